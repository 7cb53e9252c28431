//! Client for Apple's HTTP/2 push service, authenticated with a client certificate.

use crate::certificate::CertificateCapabilities;
use crate::config::ProjectPolicy;
use crate::convert::apns::to_apns;
use crate::errors::{ConstructionError, ConversionError, DeliveryError, SendError};
use crate::notification::Notification;
use crate::pipe::encode_streaming;
use crate::providers::{
    ClientOptions, Converted, Provider, ProviderKind, body_excerpt, cancellable,
    json_without_secrets, join_segments, parse_endpoint,
};
use crate::retry::{StatusCoded, send_with_retry};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

pub const PRODUCTION_ENDPOINT: &str = "https://api.push.apple.com";
pub const SANDBOX_ENDPOINT: &str = "https://api.sandbox.push.apple.com";

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApnsPushType {
    Alert,
    Background,
    Voip,
}

impl ApnsPushType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ApnsPushType::Alert => "alert",
            ApnsPushType::Background => "background",
            ApnsPushType::Voip => "voip",
        }
    }
}

/// A converted push, shared by every device of one dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct ApnsRequest {
    pub push_type: ApnsPushType,
    pub priority: u8,
    /// Unix seconds.
    pub expiration: u64,
    pub topic: Option<String>,
    pub collapse_id: Option<String>,
    pub payload: Arc<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApnsResponse {
    pub status: StatusCode,
    pub apns_id: Option<String>,
    pub reason: String,
    /// Milliseconds since the epoch at which the token was last known valid (410 only).
    pub timestamp: Option<i64>,
}

impl StatusCoded for ApnsResponse {
    fn status(&self) -> StatusCode {
        self.status
    }
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    timestamp: Option<i64>,
}

pub struct ApnsClient {
    client: reqwest::Client,
    endpoint: Url,
    retries: i32,
    capabilities: CertificateCapabilities,
}

impl ApnsClient {
    /// Builds a client from a PEM bundle holding the certificate chain and its key.
    ///
    /// The development push OID selects the sandbox endpoint, as does the `sandbox` option.
    pub fn from_pem(
        pem: &[u8],
        topic: Option<&str>,
        options: ClientOptions,
    ) -> Result<Self, ConstructionError> {
        let capabilities = CertificateCapabilities::from_pem(pem)?;
        capabilities.check_topic(topic)?;

        let sandbox = capabilities.is_sandbox || options.sandbox;
        let endpoint = match options.endpoint {
            Some(endpoint) => endpoint,
            None if sandbox => parse_endpoint(SANDBOX_ENDPOINT)?,
            None => parse_endpoint(PRODUCTION_ENDPOINT)?,
        };

        let client = reqwest::Client::builder()
            .identity(reqwest::Identity::from_pem(pem)?)
            .timeout(options.timeout)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()?;

        tracing::info!(
            %endpoint,
            sandbox,
            voip = capabilities.supports_voip,
            topics = ?capabilities.allowed_topics,
            "APNs client ready"
        );

        Ok(ApnsClient {
            client,
            endpoint,
            retries: options.retries,
            capabilities,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn capabilities(&self) -> &CertificateCapabilities {
        &self.capabilities
    }

    pub async fn send(
        &self,
        cancel: &CancellationToken,
        request: &ApnsRequest,
        token: &str,
    ) -> Result<ApnsResponse, SendError> {
        let url = join_segments(&self.endpoint, &["3", "device", token]);
        send_with_retry(self.retries, || self.post(cancel, url.clone(), request)).await
    }

    async fn post(
        &self,
        cancel: &CancellationToken,
        url: Url,
        request: &ApnsRequest,
    ) -> Result<ApnsResponse, SendError> {
        let (body, encoder) = encode_streaming(request.payload.clone());

        let mut builder = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header("apns-id", Uuid::new_v4().to_string())
            .header("apns-expiration", request.expiration.to_string())
            .header("apns-priority", request.priority.to_string())
            .header("apns-push-type", request.push_type.as_str());
        if let Some(topic) = &request.topic {
            builder = builder.header("apns-topic", topic.as_str());
        }
        if let Some(collapse_id) = &request.collapse_id {
            builder = builder.header("apns-collapse-id", collapse_id.as_str());
        }

        let response = match cancellable(cancel, builder.body(body).send()).await {
            Ok(response) => response,
            Err(err) => return Err(encoder.explain(err).await),
        };
        let status = response.status();
        let apns_id = response
            .headers()
            .get("apns-id")
            .and_then(|value| value.to_str().ok())
            .map(String::from);
        let bytes = cancellable(cancel, response.bytes()).await?;
        encoder.finish().await?;

        decode_response(status, apns_id, &bytes)
    }
}

fn decode_response(
    status: StatusCode,
    apns_id: Option<String>,
    body: &[u8],
) -> Result<ApnsResponse, SendError> {
    let error_body = match status.as_u16() {
        200 => ErrorBody::default(),
        400 | 403 | 404 | 405 | 410 | 413 | 429 => {
            serde_json::from_slice(body).map_err(|_| SendError::InvalidResponse {
                status,
                body: body_excerpt(body),
            })?
        }
        // Retried without looking at the reason.
        500 | 503 => serde_json::from_slice(body).unwrap_or_default(),
        _ => return Err(SendError::UnexpectedStatus(status)),
    };

    Ok(ApnsResponse {
        status,
        apns_id,
        reason: error_body.reason,
        timestamp: error_body.timestamp,
    })
}

/// Maps an APNs answer onto a delivery result.
pub fn classify(response: &ApnsResponse) -> Result<(), DeliveryError> {
    if response.status == StatusCode::OK {
        return Ok(());
    }
    if response.status == StatusCode::BAD_REQUEST && response.reason == "BadDeviceToken" {
        return Err(DeliveryError::InvalidToken(format!(
            "{} {}",
            response.status.as_u16(),
            response.reason
        )));
    }
    Err(DeliveryError::Rejected {
        status: response.status,
        reason: response.reason.clone(),
    })
}

#[async_trait]
impl Provider for ApnsClient {
    type Request = ApnsRequest;

    fn kind(&self) -> ProviderKind {
        ProviderKind::Apns
    }

    fn convert(
        &self,
        notification: &Notification,
        policy: &ProjectPolicy,
    ) -> Result<Converted<ApnsRequest>, ConversionError> {
        to_apns(notification, policy, &self.capabilities, SystemTime::now())
    }

    async fn deliver(
        &self,
        cancel: &CancellationToken,
        request: &ApnsRequest,
        token: &str,
    ) -> Result<(), DeliveryError> {
        let response = self.send(cancel, request, token).await?;
        let result = classify(&response);
        if let Err(DeliveryError::Rejected { .. }) = &result {
            tracing::debug!(
                apns_id = ?response.apns_id,
                payload = %json_without_secrets(&request.payload),
                "APNs rejected push"
            );
        }
        result
    }
}
