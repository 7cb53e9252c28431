//! Client for the FCM HTTP v1 API.

use crate::config::ProjectPolicy;
use crate::convert::fcm::to_fcm;
use crate::errors::{ConstructionError, ConversionError, DeliveryError, SendError};
use crate::notification::Notification;
use crate::pipe::encode_streaming;
use crate::providers::fcm_auth::{ServiceAccount, ServiceAccountTokenSource, TokenCache, TokenSource};
use crate::providers::{
    ClientOptions, Converted, Provider, ProviderKind, body_excerpt, cancellable, join_segments,
    parse_endpoint,
};
use crate::retry::{StatusCoded, send_with_retry};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://fcm.googleapis.com";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AndroidPriority {
    #[default]
    Normal,
    High,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AndroidConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub collapse_key: String,
    pub priority: AndroidPriority,
    /// Seconds with an `s` suffix, e.g. `"60s"`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ttl: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FcmNotification {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
}

/// The `message` object of a send request.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Message {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<FcmNotification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub android: Option<AndroidConfig>,
}

#[derive(Serialize)]
struct SendRequest {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    validate_only: bool,
    message: Message,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FcmError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub details: Vec<serde_json::Value>,
}

impl std::fmt::Display for FcmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.code, self.message, self.status)
    }
}

impl FcmError {
    /// True when a field violation points at `message.token`.
    pub fn is_invalid_token(&self) -> bool {
        self.code == 400
            && self.status == "INVALID_ARGUMENT"
            && self.details.iter().any(|detail| {
                detail["fieldViolations"]
                    .as_array()
                    .is_some_and(|violations| {
                        violations
                            .iter()
                            .any(|violation| violation["field"] == "message.token")
                    })
            })
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FcmResponse {
    #[serde(skip)]
    pub status: StatusCode,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub error: Option<FcmError>,
}

impl StatusCoded for FcmResponse {
    fn status(&self) -> StatusCode {
        self.status
    }
}

pub struct FcmClient {
    client: reqwest::Client,
    url: Url,
    retries: i32,
    validate_only: bool,
    tokens: TokenCache,
}

impl FcmClient {
    /// Builds a client from the JSON key of a Google service account.
    pub fn from_service_account(
        service_account: &[u8],
        options: ClientOptions,
    ) -> Result<Self, ConstructionError> {
        let account: ServiceAccount = serde_json::from_slice(service_account)?;
        let client = http_client(&options)?;
        let source = ServiceAccountTokenSource::new(&account, client.clone())?;
        tracing::info!(
            project_id = %account.project_id,
            client_email = %account.client_email,
            "FCM v1 client ready"
        );
        Self::with_client(client, &account.project_id, Arc::new(source), options)
    }

    /// Builds a client that takes its bearer tokens from `source`.
    pub fn with_token_source(
        project_id: &str,
        source: Arc<dyn TokenSource>,
        options: ClientOptions,
    ) -> Result<Self, ConstructionError> {
        let client = http_client(&options)?;
        Self::with_client(client, project_id, source, options)
    }

    fn with_client(
        client: reqwest::Client,
        project_id: &str,
        source: Arc<dyn TokenSource>,
        options: ClientOptions,
    ) -> Result<Self, ConstructionError> {
        let base = match options.endpoint {
            Some(endpoint) => endpoint,
            None => parse_endpoint(DEFAULT_ENDPOINT)?,
        };
        let url = join_segments(&base, &["v1", "projects", project_id, "messages:send"]);

        Ok(FcmClient {
            client,
            url,
            retries: options.retries,
            validate_only: options.sandbox,
            tokens: TokenCache::new(source),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Sends `message`, which must already carry its device token.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        message: Message,
    ) -> Result<FcmResponse, SendError> {
        let request = Arc::new(SendRequest {
            validate_only: self.validate_only,
            message,
        });
        send_with_retry(self.retries, || self.post(cancel, request.clone())).await
    }

    async fn post(
        &self,
        cancel: &CancellationToken,
        request: Arc<SendRequest>,
    ) -> Result<FcmResponse, SendError> {
        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SendError::Cancelled),
            token = self.tokens.get() => token?,
        };
        let (body, encoder) = encode_streaming(request);

        let sent = cancellable(
            cancel,
            self.client
                .post(self.url.clone())
                .header(AUTHORIZATION, token.authorization())
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send(),
        )
        .await;
        let response = match sent {
            Ok(response) => response,
            Err(err) => return Err(encoder.explain(err).await),
        };
        let status = response.status();
        let bytes = cancellable(cancel, response.bytes()).await?;
        encoder.finish().await?;

        decode_response(status, &bytes)
    }
}

fn http_client(options: &ClientOptions) -> Result<reqwest::Client, ConstructionError> {
    Ok(reqwest::Client::builder().timeout(options.timeout).build()?)
}

fn decode_response(status: StatusCode, body: &[u8]) -> Result<FcmResponse, SendError> {
    match status.as_u16() {
        200 | 400 | 401 | 403 | 404 | 429 => {
            let mut response: FcmResponse =
                serde_json::from_slice(body).map_err(|_| SendError::InvalidResponse {
                    status,
                    body: body_excerpt(body),
                })?;
            response.status = status;
            Ok(response)
        }
        _ => Ok(FcmResponse {
            status,
            ..Default::default()
        }),
    }
}

/// Maps an FCM answer onto a delivery result.
pub fn classify(response: &FcmResponse) -> Result<(), DeliveryError> {
    match &response.error {
        Some(error) if error.is_invalid_token() => {
            Err(DeliveryError::InvalidToken(error.to_string()))
        }
        Some(error) => Err(DeliveryError::Rejected {
            status: response.status,
            reason: error.to_string(),
        }),
        None if response.status == StatusCode::OK && !response.name.is_empty() => Ok(()),
        None if response.status == StatusCode::OK => Err(DeliveryError::Rejected {
            status: response.status,
            reason: "response without message name".into(),
        }),
        None => Err(DeliveryError::Rejected {
            status: response.status,
            reason: response
                .status
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
        }),
    }
}

#[async_trait]
impl Provider for FcmClient {
    type Request = Message;

    fn kind(&self) -> ProviderKind {
        ProviderKind::FcmV1
    }

    fn convert(
        &self,
        notification: &Notification,
        policy: &ProjectPolicy,
    ) -> Result<Converted<Message>, ConversionError> {
        to_fcm(notification, policy)
    }

    async fn deliver(
        &self,
        cancel: &CancellationToken,
        request: &Message,
        token: &str,
    ) -> Result<(), DeliveryError> {
        let message = Message {
            token: token.to_string(),
            ..request.clone()
        };
        let response = self.send(cancel, message).await?;
        classify(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorClass;
    use crate::providers::fcm_auth::AccessToken;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticToken(AtomicUsize);

    #[async_trait]
    impl TokenSource for StaticToken {
        async fn fetch(&self) -> Result<AccessToken, SendError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                value: "test-token".into(),
                token_type: "Bearer".into(),
                expires_at: Instant::now() + Duration::from_secs(3600),
            })
        }
    }

    fn options(server: &MockServer, sandbox: bool) -> ClientOptions {
        ClientOptions {
            sandbox,
            retries: 2,
            timeout: Duration::from_secs(5),
            endpoint: Some(parse_endpoint(&server.uri()).unwrap()),
        }
    }

    fn client(server: &MockServer, sandbox: bool) -> (FcmClient, Arc<StaticToken>) {
        let source = Arc::new(StaticToken(AtomicUsize::new(0)));
        let client =
            FcmClient::with_token_source("demo", source.clone(), options(server, sandbox)).unwrap();
        (client, source)
    }

    fn message() -> Message {
        Message {
            data: BTreeMap::from([("seq".to_string(), "3".to_string())]),
            android: Some(AndroidConfig {
                priority: AndroidPriority::High,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_url_escapes_project_id() {
        let options = ClientOptions {
            sandbox: false,
            retries: 1,
            timeout: Duration::from_secs(1),
            endpoint: None,
        };
        let source = Arc::new(StaticToken(AtomicUsize::new(0)));
        let client = FcmClient::with_token_source("project-id", source.clone(), options.clone())
            .unwrap();
        assert_eq!(
            client.url().as_str(),
            "https://fcm.googleapis.com/v1/projects/project-id/messages:send"
        );

        let client = FcmClient::with_token_source("my project/x", source, options).unwrap();
        assert_eq!(
            client.url().as_str(),
            "https://fcm.googleapis.com/v1/projects/my%20project%2Fx/messages:send"
        );
    }

    #[tokio::test]
    async fn test_send_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/demo/messages:send"))
            .and(header("authorization", "Bearer test-token"))
            .and(body_json(json!({
                "validate_only": true,
                "message": {
                    "token": "device-1",
                    "data": {"seq": "3"},
                    "android": {"priority": "HIGH"},
                },
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"name": "projects/demo/messages/1"})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let (client, source) = client(&server, true);
        let cancel = CancellationToken::new();
        client.deliver(&cancel, &message(), "device-1").await.unwrap();
        client.deliver(&cancel, &message(), "device-1").await.unwrap();
        // the bearer token is cached between sends
        assert_eq!(source.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {
                    "code": 400,
                    "message": "The registration token is not a valid FCM registration token",
                    "status": "INVALID_ARGUMENT",
                    "details": [{
                        "@type": "type.googleapis.com/google.rpc.BadRequest",
                        "fieldViolations": [{
                            "field": "message.token",
                            "description": "Invalid registration token",
                        }],
                    }],
                },
            })))
            .mount(&server)
            .await;

        let (client, _) = client(&server, false);
        let err = client
            .deliver(&CancellationToken::new(), &message(), "dead")
            .await
            .unwrap_err();
        assert!(err.is_invalid_token());
    }

    #[tokio::test]
    async fn test_other_errors_are_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {
                    "code": 404,
                    "message": "Requested entity was not found.",
                    "status": "NOT_FOUND",
                    "details": [{"errorCode": "UNREGISTERED"}],
                },
            })))
            .mount(&server)
            .await;

        let (client, _) = client(&server, false);
        let err = client
            .deliver(&CancellationToken::new(), &message(), "gone")
            .await
            .unwrap_err();
        assert!(!err.is_invalid_token());
        assert!(matches!(
            err,
            DeliveryError::Rejected { status: StatusCode::NOT_FOUND, .. }
        ));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (client, _) = client(&server, false);
        let err = client
            .deliver(&CancellationToken::new(), &message(), "t")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Send(SendError::ServiceUnavailable)
        ));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_undecoded_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let (client, _) = client(&server, false);
        let cancel = CancellationToken::new();
        let response = client.send(&cancel, message()).await.unwrap();
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert_eq!(response.error, None);
        assert!(matches!(
            classify(&response),
            Err(DeliveryError::Rejected { status: StatusCode::BAD_GATEWAY, .. })
        ));
    }

    #[tokio::test]
    async fn test_ok_without_message_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _) = client(&server, false);
        let err = client
            .deliver(&CancellationToken::new(), &message(), "t")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Rejected { status: StatusCode::OK, ref reason }
                if reason == "response without message name"
        ));
        assert_eq!(err.class(), ErrorClass::Unknown);
    }

    #[test]
    fn test_invalid_token_detection() {
        let error = FcmError {
            code: 400,
            status: "INVALID_ARGUMENT".into(),
            details: vec![json!({"fieldViolations": [{"field": "message.data"}]})],
            ..Default::default()
        };
        assert!(!error.is_invalid_token());

        let error = FcmError {
            details: vec![json!({"fieldViolations": [{"field": "message.token"}]})],
            ..error
        };
        assert!(error.is_invalid_token());
    }
}
