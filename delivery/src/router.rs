use crate::config::ProjectConfig;
use crate::dispatcher::{PushRequest, Worker};
use crate::errors::ConstructionError;
use crate::metrics_defs::PUSH_RECEIVED;
use crate::notification::Notification;
use crate::providers::build_worker;
use futures::Stream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

// Results buffered for a slow push stream consumer.
const STREAM_BUFFER: usize = 64;

/// A notification addressed to devices across several projects.
#[derive(Debug, Clone)]
pub struct Push {
    pub correlation_id: String,
    /// Device tokens keyed by project id.
    pub destinations: HashMap<String, Vec<String>>,
    pub notification: Notification,
}

/// Dead device tokens reported for one project of one push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectInvalidations {
    pub correlation_id: String,
    pub project_id: String,
    pub device_ids: Vec<String>,
}

/// Fans pushes out to the per-project workers and gathers invalidated tokens.
#[derive(Clone)]
pub struct Router {
    workers: Arc<HashMap<String, Arc<dyn Worker>>>,
}

impl Router {
    pub fn new(workers: Vec<Arc<dyn Worker>>) -> Result<Self, ConstructionError> {
        let mut by_project = HashMap::with_capacity(workers.len());
        for worker in workers {
            let project_id = worker.project_id().to_string();
            if by_project.insert(project_id.clone(), worker).is_some() {
                return Err(ConstructionError::DuplicateProject(project_id));
            }
        }

        Ok(Router {
            workers: Arc::new(by_project),
        })
    }

    /// Builds a worker per project. Projects that fail to build are returned next to the
    /// router instead of aborting the others.
    pub fn from_config(projects: &[ProjectConfig]) -> (Self, Vec<(String, ConstructionError)>) {
        let mut workers: HashMap<String, Arc<dyn Worker>> = HashMap::new();
        let mut failures = Vec::new();

        for project in projects {
            if workers.contains_key(&project.project_id) {
                failures.push((
                    project.project_id.clone(),
                    ConstructionError::DuplicateProject(project.project_id.clone()),
                ));
                continue;
            }
            match build_worker(project) {
                Ok(worker) => {
                    workers.insert(project.project_id.clone(), worker);
                }
                Err(err) => {
                    tracing::error!(
                        project_id = %project.project_id,
                        provider = project.kind().as_str(),
                        error = %err,
                        "failed to build project"
                    );
                    failures.push((project.project_id.clone(), err));
                }
            }
        }

        let router = Router {
            workers: Arc::new(workers),
        };
        (router, failures)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Delivers `push` to every destination project and returns the dead tokens per project.
    ///
    /// Unknown projects map to an empty list.
    pub async fn single_push(
        &self,
        cancel: &CancellationToken,
        push: Push,
    ) -> HashMap<String, Vec<String>> {
        let mut tasks = self.fan_out(cancel, push);
        let mut invalidations = HashMap::new();

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(project) => {
                    invalidations.insert(project.project_id, project.device_ids);
                }
                Err(e) => tracing::error!("Task panicked: {}", e),
            }
        }

        invalidations
    }

    /// Delivers every push of `pushes`, yielding each project's invalidations as soon as
    /// its worker is done with them.
    ///
    /// Pushes are started in arrival order without waiting for earlier ones. The returned
    /// stream ends once the input ends (or `cancel` fires) and all started pushes finish.
    pub fn push_stream<S>(
        &self,
        cancel: CancellationToken,
        pushes: S,
    ) -> ReceiverStream<ProjectInvalidations>
    where
        S: Stream<Item = Push> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let router = self.clone();

        tokio::spawn(async move {
            let mut pushes = std::pin::pin!(pushes);
            let mut in_flight = JoinSet::new();

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                    push = pushes.next() => {
                        let Some(push) = push else { break };
                        let mut tasks = router.fan_out(&cancel, push);
                        let tx = tx.clone();
                        in_flight.spawn(async move {
                            while let Some(result) = tasks.join_next().await {
                                match result {
                                    Ok(project) => {
                                        if tx.send(project).await.is_err() {
                                            return;
                                        }
                                    }
                                    Err(e) => tracing::error!("Task panicked: {}", e),
                                }
                            }
                        });
                    }
                }
            }

            while in_flight.join_next().await.is_some() {}
        });

        ReceiverStream::new(rx)
    }

    fn fan_out(&self, cancel: &CancellationToken, push: Push) -> JoinSet<ProjectInvalidations> {
        shared::counter!(PUSH_RECEIVED).increment(1);

        let Push {
            correlation_id,
            destinations,
            notification,
        } = push;
        let notification = Arc::new(notification);
        let mut tasks = JoinSet::new();

        for (project_id, devices) in destinations {
            let mut result = ProjectInvalidations {
                correlation_id: correlation_id.clone(),
                project_id,
                device_ids: Vec::new(),
            };

            let Some(worker) = self.workers.get(&result.project_id).cloned() else {
                tracing::error!(
                    project_id = %result.project_id,
                    %correlation_id,
                    "push for unknown project"
                );
                tasks.spawn(async move { result });
                continue;
            };

            let request = PushRequest {
                devices,
                correlation_id: correlation_id.clone(),
                notification: notification.clone(),
            };
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let mut outcomes = worker.send(cancel, request).await;
                while let Some(outcome) = outcomes.recv().await {
                    if outcome.is_invalidation() {
                        result.device_ids.push(outcome.device_token);
                    }
                }
                result
            });
        }

        tasks
    }
}
