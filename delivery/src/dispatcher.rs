use crate::config::ProjectPolicy;
use crate::errors::{DeliveryError, SendError};
use crate::metrics_defs::{PUSH_FAILED, PUSH_INFLIGHT, PUSH_IO_DURATION, PUSH_PROCESSED};
use crate::notification::Notification;
use crate::providers::{Converted, Provider, ProviderKind};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

/// One push addressed to devices of a single project.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub devices: Vec<String>,
    pub correlation_id: String,
    pub notification: Arc<Notification>,
}

#[derive(Debug)]
pub struct DeliveryOutcome {
    pub device_token: String,
    pub error: Option<DeliveryError>,
}

impl DeliveryOutcome {
    /// Only invalid-token failures are reported back to the caller.
    pub fn is_invalidation(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(DeliveryError::is_invalid_token)
    }
}

/// A per-project sender, independent of the provider behind it.
#[async_trait]
pub trait Worker: Send + Sync {
    fn project_id(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Waits for a free slot, then delivers `request` in the background.
    ///
    /// Outcomes arrive in device order. The channel closes when every device is handled or
    /// `cancel` fires, in which case the remaining devices get no outcome.
    async fn send(
        &self,
        cancel: CancellationToken,
        request: PushRequest,
    ) -> mpsc::Receiver<DeliveryOutcome>;
}

struct DispatcherInner<P> {
    project_id: String,
    provider: P,
    policy: ProjectPolicy,
    nop_mode: bool,
}

/// Delivers pushes for one project through provider `P`.
///
/// At most `concurrency_limit` pushes are in flight at once. The devices of one push are
/// sent one after another.
pub struct Dispatcher<P> {
    inner: Arc<DispatcherInner<P>>,
    slots: Arc<Semaphore>,
}

impl<P: Provider> Dispatcher<P> {
    pub fn new(project_id: String, provider: P, policy: ProjectPolicy, nop_mode: bool) -> Self {
        let workers = policy.concurrency_limit.max(1);
        tracing::info!(
            %project_id,
            provider = provider.kind().as_str(),
            workers,
            nop_mode,
            "dispatcher ready"
        );

        Dispatcher {
            inner: Arc::new(DispatcherInner {
                project_id,
                provider,
                policy,
                nop_mode,
            }),
            slots: Arc::new(Semaphore::new(workers)),
        }
    }
}

#[async_trait]
impl<P: Provider> Worker for Dispatcher<P> {
    fn project_id(&self) -> &str {
        &self.inner.project_id
    }

    fn kind(&self) -> ProviderKind {
        self.inner.provider.kind()
    }

    async fn send(
        &self,
        cancel: CancellationToken,
        request: PushRequest,
    ) -> mpsc::Receiver<DeliveryOutcome> {
        let (tx, rx) = mpsc::channel(request.devices.len().max(1));

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return rx,
            permit = self.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return rx,
            },
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let inflight = shared::gauge!(PUSH_INFLIGHT, "project_id" => inner.project_id.clone());
            inflight.increment(1.0);
            inner.dispatch(&cancel, request, &tx).await;
            inflight.decrement(1.0);
        });

        rx
    }
}

impl<P: Provider> DispatcherInner<P> {
    async fn dispatch(
        &self,
        cancel: &CancellationToken,
        request: PushRequest,
        tx: &mpsc::Sender<DeliveryOutcome>,
    ) {
        let PushRequest {
            devices,
            correlation_id,
            notification,
        } = request;

        if devices.is_empty() {
            tracing::error!(
                project_id = %self.project_id,
                %correlation_id,
                "push without devices"
            );
            let _ = tx
                .send(DeliveryOutcome {
                    device_token: String::new(),
                    error: Some(DeliveryError::EmptyDeviceList),
                })
                .await;
            return;
        }

        let converted = match self.provider.convert(&notification, &self.policy) {
            Ok(Converted::Send(converted)) => converted,
            Ok(Converted::Ignore) => {
                tracing::debug!(
                    project_id = %self.project_id,
                    %correlation_id,
                    "push ignored by provider"
                );
                return;
            }
            Err(err) => {
                tracing::warn!(
                    project_id = %self.project_id,
                    %correlation_id,
                    error = %err,
                    "could not convert push"
                );
                for device_token in devices {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let outcome = DeliveryOutcome {
                        device_token,
                        error: Some(err.clone().into()),
                    };
                    if tx.send(outcome).await.is_err() {
                        return;
                    }
                }
                return;
            }
        };

        for device_token in devices {
            if cancel.is_cancelled() {
                tracing::debug!(
                    project_id = %self.project_id,
                    %correlation_id,
                    "push cancelled"
                );
                return;
            }

            let error = self
                .deliver(cancel, &converted, &device_token, &correlation_id)
                .await;
            if matches!(error, Some(DeliveryError::Send(SendError::Cancelled))) {
                return;
            }
            if tx.send(DeliveryOutcome { device_token, error }).await.is_err() {
                return;
            }
        }
    }

    async fn deliver(
        &self,
        cancel: &CancellationToken,
        request: &P::Request,
        token: &str,
        correlation_id: &str,
    ) -> Option<DeliveryError> {
        let masked = mask_token(token);

        if token.is_empty() {
            tracing::warn!(
                project_id = %self.project_id,
                %correlation_id,
                "empty device token"
            );
            return Some(DeliveryError::EmptyDeviceToken);
        }
        if self.nop_mode {
            tracing::info!(
                project_id = %self.project_id,
                %correlation_id,
                token = masked,
                "nop mode, push not sent"
            );
            return None;
        }

        let provider = self.provider.kind().as_str();
        let started = Instant::now();
        let result = self.provider.deliver(cancel, request, token).await;
        shared::histogram!(PUSH_IO_DURATION, "provider" => provider)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                shared::counter!(PUSH_PROCESSED, "provider" => provider, "project_id" => self.project_id.clone())
                    .increment(1);
                tracing::info!(
                    project_id = %self.project_id,
                    %correlation_id,
                    token = masked,
                    "push delivered"
                );
                None
            }
            Err(err) => {
                shared::counter!(PUSH_FAILED, "provider" => provider, "project_id" => self.project_id.clone())
                    .increment(1);
                if err.is_invalid_token() {
                    tracing::info!(
                        project_id = %self.project_id,
                        %correlation_id,
                        token = masked,
                        error = %err,
                        "device token invalidated"
                    );
                } else {
                    tracing::warn!(
                        project_id = %self.project_id,
                        %correlation_id,
                        token = masked,
                        class = err.class().as_str(),
                        error = %err,
                        "push failed"
                    );
                }
                Some(err)
            }
        }
    }
}

/// Keeps the first and last third of a device token for logs.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    let third = chars.len() / 3;
    if third == 0 {
        return String::new();
    }

    let head: String = chars[..third].iter().collect();
    let tail: String = chars[chars.len() - third..].iter().collect();
    format!("{head}...{tail}")
}
