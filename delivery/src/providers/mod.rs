pub mod apns;
pub mod fcm;
pub mod fcm_auth;
pub mod gcm;

use crate::config::{ProjectConfig, ProjectPolicy, ProviderConfig, read_credential_file};
use crate::dispatcher::{Dispatcher, Worker};
use crate::errors::{ConstructionError, ConversionError, DeliveryError, SendError};
use crate::notification::Notification;
use async_trait::async_trait;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

// Longest provider body quoted in an error.
const MAX_BODY_EXCERPT: usize = 2000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Apns,
    FcmV1,
    Gcm,
}

impl ProviderKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Apns => "apns",
            ProviderKind::FcmV1 => "fcm-v1",
            ProviderKind::Gcm => "gcm",
        }
    }
}

/// Result of converting a notification for one provider.
#[derive(Debug, Clone, PartialEq)]
pub enum Converted<R> {
    Send(R),
    /// Nothing is sent and no outcome is reported.
    Ignore,
}

/// A push network: converts notifications into its wire format and delivers them.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    type Request: Send + Sync + 'static;

    fn kind(&self) -> ProviderKind;

    fn convert(
        &self,
        notification: &Notification,
        policy: &ProjectPolicy,
    ) -> Result<Converted<Self::Request>, ConversionError>;

    /// Sends `request` to one device and classifies the provider's answer.
    async fn deliver(
        &self,
        cancel: &CancellationToken,
        request: &Self::Request,
        token: &str,
    ) -> Result<(), DeliveryError>;
}

/// Transport settings shared by every provider client.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub sandbox: bool,
    pub retries: i32,
    pub timeout: Duration,
    pub endpoint: Option<Url>,
}

impl ClientOptions {
    pub fn new(policy: &ProjectPolicy, endpoint: Option<&str>) -> Result<Self, ConstructionError> {
        let endpoint = endpoint.map(parse_endpoint).transpose()?;

        Ok(ClientOptions {
            sandbox: policy.sandbox,
            retries: policy.retries,
            timeout: policy.timeout,
            endpoint,
        })
    }
}

pub(crate) fn parse_endpoint(raw: &str) -> Result<Url, ConstructionError> {
    let url = Url::parse(raw).map_err(|e| ConstructionError::Endpoint(format!("{raw}: {e}")))?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(ConstructionError::Endpoint(format!(
            "{raw}: not an http(s) base URL"
        )));
    }
    Ok(url)
}

/// Appends `segments` to `base`, percent-encoding each one.
pub(crate) fn join_segments(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Builds the dispatcher for one configured project.
pub fn build_worker(config: &ProjectConfig) -> Result<Arc<dyn Worker>, ConstructionError> {
    let policy = config.policy();
    let options = ClientOptions::new(&policy, config.endpoint.as_deref())?;
    let project_id = config.project_id.clone();

    let worker: Arc<dyn Worker> = match &config.provider {
        ProviderConfig::Apns { pem, .. } => {
            let pem = read_credential_file(pem)?;
            let client = apns::ApnsClient::from_pem(&pem, policy.topic.as_deref(), options)?;
            Arc::new(Dispatcher::new(project_id, client, policy, config.nop_mode))
        }
        ProviderConfig::FcmV1 { service_account } => {
            let service_account = read_credential_file(service_account)?;
            let client = fcm::FcmClient::from_service_account(&service_account, options)?;
            Arc::new(Dispatcher::new(project_id, client, policy, config.nop_mode))
        }
        ProviderConfig::Gcm { key } => {
            let client = gcm::GcmClient::new(key, options)?;
            Arc::new(Dispatcher::new(project_id, client, policy, config.nop_mode))
        }
    };

    Ok(worker)
}

/// Awaits a transport future unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, SendError>
where
    F: Future<Output = Result<T, reqwest::Error>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SendError::Cancelled),
        result = fut => result.map_err(SendError::from),
    }
}

pub(crate) fn body_excerpt(body: &[u8]) -> String {
    let end = body.len().min(MAX_BODY_EXCERPT);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

/// Replaces every string in `value` with `"*"`, keeping the structure for diagnostics.
pub fn json_without_secrets(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::String(_) => Value::String("*".into()),
        Value::Array(items) => Value::Array(items.iter().map(json_without_secrets).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), json_without_secrets(value)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_without_secrets() {
        let payload = json!({
            "aps": {"alert": {"title": "hello"}, "badge": 3},
            "user_info": {"nonce": "1", "encrypted_data": "c2VjcmV0"},
            "tags": ["a", 1, null],
        });
        assert_eq!(
            json_without_secrets(&payload),
            json!({
                "aps": {"alert": {"title": "*"}, "badge": 3},
                "user_info": {"nonce": "*", "encrypted_data": "*"},
                "tags": ["*", 1, null],
            })
        );
    }

    #[test]
    fn test_endpoints() {
        let base = parse_endpoint("http://127.0.0.1:8080").unwrap();
        assert_eq!(
            join_segments(&base, &["3", "device", "a/b c"]).as_str(),
            "http://127.0.0.1:8080/3/device/a%2Fb%20c"
        );

        let nested = parse_endpoint("https://push.example.com/base/").unwrap();
        assert_eq!(
            join_segments(&nested, &["fcm", "send"]).as_str(),
            "https://push.example.com/base/fcm/send"
        );

        assert!(parse_endpoint("mailto:someone@example.com").is_err());
        assert!(parse_endpoint("not a url").is_err());
    }

    #[test]
    fn test_body_excerpt() {
        assert_eq!(body_excerpt(b"short"), "short");
        assert_eq!(body_excerpt(&[b'x'; 5000]).len(), MAX_BODY_EXCERPT);
    }

    #[test]
    fn test_provider_kind_names() {
        let kind: ProviderKind = serde_yaml::from_str("fcm-v1").unwrap();
        assert_eq!(kind, ProviderKind::FcmV1);
        assert_eq!(ProviderKind::Apns.as_str(), "apns");
        assert_eq!(ProviderKind::Gcm.as_str(), "gcm");
    }
}
