//! OAuth2 bearer tokens for FCM v1, obtained with a signed service account assertion.

use crate::errors::{ConstructionError, SendError};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME: Duration = Duration::from_secs(3600);
// Tokens are refreshed this long before they actually expire.
const EXPIRY_DELTA: Duration = Duration::from_secs(60);

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The fields of a Google service account key file that are used here.
#[derive(Deserialize, Clone)]
pub struct ServiceAccount {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl std::fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct AccessToken {
    pub value: String,
    pub token_type: String,
    pub expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_DELTA < self.expires_at
    }

    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.value)
    }
}

/// Produces new access tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<AccessToken, SendError>;
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "bearer")]
    token_type: String,
    expires_in: u64,
}

fn bearer() -> String {
    "Bearer".to_string()
}

/// Exchanges a signed JWT assertion for an access token at the account's `token_uri`.
pub struct ServiceAccountTokenSource {
    client: reqwest::Client,
    key: EncodingKey,
    client_email: String,
    token_uri: String,
}

impl ServiceAccountTokenSource {
    pub fn new(
        account: &ServiceAccount,
        client: reqwest::Client,
    ) -> Result<Self, ConstructionError> {
        let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())?;
        Ok(ServiceAccountTokenSource {
            client,
            key,
            client_email: account.client_email.clone(),
            token_uri: account.token_uri.clone(),
        })
    }

    fn assertion(&self) -> Result<String, SendError> {
        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = Claims {
            iss: &self.client_email,
            scope: MESSAGING_SCOPE,
            aud: &self.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME.as_secs(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| SendError::Auth(format!("could not sign assertion: {e}")))
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    async fn fetch(&self) -> Result<AccessToken, SendError> {
        let assertion = self.assertion()?;
        let requested_at = Instant::now();

        let response = self
            .client
            .post(&self.token_uri)
            .form(&[("grant_type", GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Auth(format!("token exchange returned {status}: {body}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SendError::Auth(format!("invalid token response: {e}")))?;
        tracing::debug!(expires_in = token.expires_in, "fetched FCM access token");

        Ok(AccessToken {
            value: token.access_token,
            token_type: token.token_type,
            expires_at: requested_at + Duration::from_secs(token.expires_in),
        })
    }
}

/// A single shared token slot.
///
/// Readers load a snapshot of the current token without locking. When it is stale the
/// caller fetches a new one and swaps it in, so concurrent refreshes may overlap but the
/// slot always holds a complete token.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    slot: ArcSwapOption<AccessToken>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        TokenCache {
            source,
            slot: ArcSwapOption::empty(),
        }
    }

    pub async fn get(&self) -> Result<Arc<AccessToken>, SendError> {
        if let Some(token) = self.slot.load_full()
            && token.is_fresh()
        {
            return Ok(token);
        }

        let fresh = Arc::new(self.source.fetch().await?);
        self.slot.store(Some(fresh.clone()));
        Ok(fresh)
    }
}
