//! Client for the legacy FCM (GCM) HTTP API, authenticated with a server key.

use crate::config::ProjectPolicy;
use crate::convert::gcm::to_gcm;
use crate::errors::{ConstructionError, ConversionError, DeliveryError, SendError};
use crate::notification::Notification;
use crate::pipe::encode_streaming;
use crate::providers::{
    ClientOptions, Converted, Provider, ProviderKind, body_excerpt, cancellable,
    join_segments, json_without_secrets, parse_endpoint,
};
use crate::retry::{StatusCoded, send_with_retry};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const ENDPOINT: &str = "https://fcm.googleapis.com/";

pub const ERROR_INVALID_REGISTRATION: &str = "InvalidRegistration";
pub const ERROR_MISSING_REGISTRATION: &str = "MissingRegistration";

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct GcmNotification {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sound: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title_loc_key: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub title_loc_args: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body_loc_key: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub body_loc_args: Vec<String>,
}

/// The legacy JSON envelope.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct GcmRequest {
    pub to: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub registration_ids: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub collapse_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub priority: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub content_available: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub time_to_live: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<GcmNotification>,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct GcmResult {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub registration_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct GcmResponse {
    #[serde(skip)]
    pub status: StatusCode,
    #[serde(default)]
    pub multicast_id: i64,
    #[serde(default)]
    pub success: i64,
    #[serde(default)]
    pub failure: i64,
    #[serde(default)]
    pub results: Vec<GcmResult>,
}

impl StatusCoded for GcmResponse {
    fn status(&self) -> StatusCode {
        self.status
    }
}

pub struct GcmClient {
    client: reqwest::Client,
    url: Url,
    retries: i32,
    dry_run: bool,
    authorization: HeaderValue,
}

impl GcmClient {
    pub fn new(server_key: &str, options: ClientOptions) -> Result<Self, ConstructionError> {
        if server_key.trim().is_empty() {
            return Err(ConstructionError::InvalidServerKey);
        }
        let mut authorization = HeaderValue::from_str(&format!("key={server_key}"))
            .map_err(|_| ConstructionError::InvalidServerKey)?;
        authorization.set_sensitive(true);

        let base = match options.endpoint {
            Some(endpoint) => endpoint,
            None => parse_endpoint(ENDPOINT)?,
        };
        let url = join_segments(&base, &["fcm", "send"]);
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()?;

        Ok(GcmClient {
            client,
            url,
            retries: options.retries,
            dry_run: options.sandbox,
            authorization,
        })
    }

    /// Sends `request`, which must already be addressed.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        mut request: GcmRequest,
    ) -> Result<GcmResponse, SendError> {
        request.dry_run |= self.dry_run;
        let request = Arc::new(request);
        send_with_retry(self.retries, || self.post(cancel, request.clone())).await
    }

    async fn post(
        &self,
        cancel: &CancellationToken,
        request: Arc<GcmRequest>,
    ) -> Result<GcmResponse, SendError> {
        let (body, encoder) = encode_streaming(request);

        let sent = cancellable(
            cancel,
            self.client
                .post(self.url.clone())
                .header(AUTHORIZATION, self.authorization.clone())
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

fn decode_response(status: StatusCode, body: &[u8]) -> Result<GcmResponse, SendError> {
    match status.as_u16() {
        200 | 400 => {
            let mut response: GcmResponse =
                serde_json::from_slice(body).map_err(|_| SendError::InvalidResponse {
                    status,
                    body: body_excerpt(body),
                })?;
            response.status = status;
            Ok(response)
        }
        _ => Ok(GcmResponse {
            status,
            ..Default::default()
        }),
    }
}

/// Maps a GCM answer for a single registration onto a delivery result.
pub fn classify(response: &GcmResponse) -> Result<(), DeliveryError> {
    if response.status == StatusCode::OK && response.success > 0 {
        return Ok(());
    }

    let error = response
        .results
        .first()
        .and_then(|result| result.error.as_deref())
        .unwrap_or_default();
    match error {
        ERROR_INVALID_REGISTRATION | ERROR_MISSING_REGISTRATION => {
            Err(DeliveryError::InvalidToken(error.to_string()))
        }
        "" => Err(DeliveryError::Rejected {
            status: response.status,
            reason: "unknown response error".into(),
        }),
        other => Err(DeliveryError::Rejected {
            status: response.status,
            reason: other.to_string(),
        }),
    }
}

#[async_trait]
impl Provider for GcmClient {
    type Request = GcmRequest;

    fn kind(&self) -> ProviderKind {
        ProviderKind::Gcm
    }

    fn convert(
        &self,
        notification: &Notification,
        policy: &ProjectPolicy,
    ) -> Result<Converted<GcmRequest>, ConversionError> {
        to_gcm(notification, policy)
    }

    async fn deliver(
        &self,
        cancel: &CancellationToken,
        request: &GcmRequest,
        token: &str,
    ) -> Result<(), DeliveryError> {
        let request = GcmRequest {
            to: token.to_string(),
            ..request.clone()
        };
        let response = self.send(cancel, request.clone()).await?;
        let result = classify(&response);
        if let Err(DeliveryError::Rejected { .. }) = &result {
            let payload = serde_json::to_value(&request.data).unwrap_or_default();
            tracing::debug!(
                data = %json_without_secrets(&payload),
                "GCM rejected push"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, sandbox: bool) -> GcmClient {
        let options = ClientOptions {
            sandbox,
            retries: 1,
            timeout: Duration::from_secs(5),
            endpoint: Some(parse_endpoint(&server.uri()).unwrap()),
        };
        GcmClient::new("server-key", options).unwrap()
    }

    fn request() -> GcmRequest {
        GcmRequest {
            priority: "high".into(),
            data: json!({"seq": 1}).as_object().cloned().unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_server_key_required() {
        let options = ClientOptions {
            sandbox: false,
            retries: 1,
            timeout: Duration::from_secs(1),
            endpoint: None,
        };
        assert!(matches!(
            GcmClient::new(" ", options.clone()),
            Err(ConstructionError::InvalidServerKey)
        ));
        assert!(matches!(
            GcmClient::new("bad\nkey", options.clone()),
            Err(ConstructionError::InvalidServerKey)
        ));
        assert_eq!(
            GcmClient::new("k", options).unwrap().url.as_str(),
            "https://fcm.googleapis.com/fcm/send"
        );
    }

    #[tokio::test]
    async fn test_send_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(wiremock::matchers::path("/fcm/send"))
            .and(header("authorization", "key=server-key"))
            .and(body_json(json!({
                "to": "device-1",
                "priority": "high",
                "dry_run": true,
                "data": {"seq": 1},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "multicast_id": 1,
                "success": 1,
                "failure": 0,
                "results": [{"message_id": "0:1"}],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, true);
        client
            .deliver(&CancellationToken::new(), &request(), "device-1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_registration() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "multicast_id": 1,
                "success": 0,
                "failure": 1,
                "results": [{"error": "InvalidRegistration"}],
            })))
            .mount(&server)
            .await;

        let client = client(&server, false);
        let err = client
            .deliver(&CancellationToken::new(), &request(), "dead")
            .await
            .unwrap_err();
        assert!(err.is_invalid_token());
    }

    #[test]
    fn test_classification() {
        let response = GcmResponse {
            status: StatusCode::OK,
            failure: 1,
            results: vec![GcmResult {
                error: Some("MissingRegistration".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(classify(&response).unwrap_err().is_invalid_token());

        let response = GcmResponse {
            results: vec![GcmResult {
                error: Some("MessageTooBig".into()),
                ..Default::default()
            }],
            ..response
        };
        let err = classify(&response).unwrap_err();
        assert!(!err.is_invalid_token());
        assert_eq!(err.to_string(), "provider rejected push: 200 OK MessageTooBig");

        let unauthorized = GcmResponse {
            status: StatusCode::UNAUTHORIZED,
            ..Default::default()
        };
        assert!(matches!(
            classify(&unauthorized),
            Err(DeliveryError::Rejected { status: StatusCode::UNAUTHORIZED, .. })
        ));
    }

    #[tokio::test]
    async fn test_bad_request_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Missing \"to\" field"))
            .mount(&server)
            .await;

        let client = client(&server, false);
        let result = client.send(&CancellationToken::new(), request()).await;
        assert!(matches!(
            result,
            Err(SendError::InvalidResponse { status: StatusCode::BAD_REQUEST, .. })
        ));
    }
}
