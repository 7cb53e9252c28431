use crate::config::ProjectPolicy;
use crate::errors::{ConversionError, DeliveryError};
use crate::notification::{Notification, Payload};
use crate::providers::{Converted, Provider, ProviderKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use rcgen::{CertificateParams, CustomExtension, KeyPair};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Device token that makes `FakeProvider` cancel the push it is part of.
pub const CANCELLING_TOKEN: &str = "cancel-after-me";

/// A self-signed certificate and its key, PEM encoded.
pub struct TestCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestCertificate {
    /// Generates a certificate carrying the given `(oid, value)` extensions.
    pub fn generate(extensions: &[(&str, Vec<u8>)]) -> Self {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["push.test".to_string()]).unwrap();
        for (oid, value) in extensions {
            let oid: Vec<u64> = oid.split('.').map(|arc| arc.parse().unwrap()).collect();
            params
                .custom_extensions
                .push(CustomExtension::from_oid_content(&oid, value.clone()));
        }
        let cert = params.self_signed(&key_pair).unwrap();

        TestCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        }
    }

    /// Certificate followed by its key, as found in an APNs credential file.
    pub fn bundle(&self) -> Vec<u8> {
        format!("{}{}", self.cert_pem, self.key_pem).into_bytes()
    }
}

/// Encodes topics the way Apple certificates list them.
pub fn topics_extension(topics: &[&str]) -> Vec<u8> {
    let mut values = Vec::new();
    for topic in topics {
        values.push(0x0C);
        values.push(topic.len() as u8);
        values.extend_from_slice(topic.as_bytes());
    }
    let mut out = vec![0x30, values.len() as u8];
    out.extend(values);
    out
}

/// Provider double recording every send.
///
/// Silent pushes are ignored and alerting pushes fail conversion unless alerts are allowed.
/// Tokens listed in `dead` are reported as invalid.
#[derive(Default)]
pub struct FakeProvider {
    pub dead: HashSet<String>,
    pub delay: Duration,
    pub sent: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeProvider {
    pub fn with_dead(tokens: &[&str]) -> Self {
        FakeProvider {
            dead: tokens.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        FakeProvider {
            delay,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    type Request = String;

    fn kind(&self) -> ProviderKind {
        ProviderKind::Apns
    }

    fn convert(
        &self,
        notification: &Notification,
        policy: &ProjectPolicy,
    ) -> Result<Converted<String>, ConversionError> {
        match notification.payload()? {
            Payload::Silent => Ok(Converted::Ignore),
            Payload::Alerting(_) if !policy.allow_alerts => {
                Err(ConversionError::AlertingNotSupported)
            }
            _ => Ok(Converted::Send("payload".into())),
        }
    }

    async fn deliver(
        &self,
        cancel: &CancellationToken,
        _request: &String,
        token: &str,
    ) -> Result<(), DeliveryError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.sent.lock().push(token.to_string());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if token == CANCELLING_TOKEN {
            cancel.cancel();
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.dead.contains(token) {
            return Err(DeliveryError::InvalidToken("400 BadDeviceToken".into()));
        }
        Ok(())
    }
}
