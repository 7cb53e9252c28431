use crate::topics::TopicError;
use reqwest::StatusCode;
use std::path::PathBuf;

/// Coarse classification of a per-device delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    PermanentInvalidToken,
    Malformed,
    Unknown,
}

impl ErrorClass {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::PermanentInvalidToken => "invalid_token",
            ErrorClass::Malformed => "malformed",
            ErrorClass::Unknown => "unknown",
        }
    }
}

/// Raised while building a provider client or a dispatcher. The project is not served.
#[derive(thiserror::Error, Debug)]
pub enum ConstructionError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} is {size} bytes, credential files are limited to {limit} bytes")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        limit: u64,
    },
    #[error("no certificate found in PEM bundle")]
    MissingCertificate,
    #[error("invalid certificate: {0}")]
    Certificate(String),
    #[error("invalid VoIP topic list: {0}")]
    Topics(#[from] TopicError),
    #[error("topic {topic:?} is not allowed by the certificate (allowed: {allowed:?})")]
    TopicNotAllowed { topic: String, allowed: Vec<String> },
    #[error("could not build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("invalid service account: {0}")]
    ServiceAccount(#[from] serde_json::Error),
    #[error("invalid signing key: {0}")]
    SigningKey(#[from] jsonwebtoken::errors::Error),
    #[error("server key is empty or not a valid header value")]
    InvalidServerKey,
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error("duplicate project id {0:?}")]
    DuplicateProject(String),
}

/// Raised when a notification cannot be expressed for a provider.
///
/// The same error is reported for every device of the push, so it is `Clone`.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("notification has no payload")]
    MissingPayload,
    #[error("attempted VoIP push with a certificate lacking VoIP capability")]
    AttemptedVoipWithoutCapability,
    #[error("encrypted push without encrypted data")]
    EmptyEncryptedPayload,
    #[error("alerting pushes are not supported when alerts are disallowed")]
    AlertingNotSupported,
    #[error("could not encode payload field: {0}")]
    Encode(String),
}

/// Outcome of a single provider call after the retry loop.
#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("provider returned 500 Internal Server Error")]
    InternalServerError,
    #[error("provider returned 503 Service Unavailable")]
    ServiceUnavailable,
    #[error("transport error: {0}")]
    Http(reqwest::Error),
    #[error("could not encode request body: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("undecodable {status} response: {body}")]
    InvalidResponse { status: StatusCode, body: String },
    #[error("unexpected response status {0}")]
    UnexpectedStatus(StatusCode),
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl SendError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SendError::Timeout)
    }
}

impl From<reqwest::Error> for SendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SendError::Timeout
        } else {
            SendError::Http(err)
        }
    }
}

/// Per-device delivery failure carried by a `DeliveryOutcome`.
#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    #[error("empty device list")]
    EmptyDeviceList,
    #[error("empty device token")]
    EmptyDeviceToken,
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("bad device token: {0}")]
    InvalidToken(String),
    #[error("provider rejected push: {status} {reason}")]
    Rejected { status: StatusCode, reason: String },
    #[error(transparent)]
    Send(#[from] SendError),
}

impl DeliveryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DeliveryError::EmptyDeviceList
            | DeliveryError::EmptyDeviceToken
            | DeliveryError::Conversion(_) => ErrorClass::Malformed,
            DeliveryError::InvalidToken(_) => ErrorClass::PermanentInvalidToken,
            DeliveryError::Rejected { .. } => ErrorClass::Unknown,
            DeliveryError::Send(err) => match err {
                SendError::Timeout
                | SendError::Cancelled
                | SendError::InternalServerError
                | SendError::ServiceUnavailable
                | SendError::Http(_) => ErrorClass::Transient,
                SendError::Encode(_) => ErrorClass::Malformed,
                SendError::InvalidResponse { .. }
                | SendError::UnexpectedStatus(_)
                | SendError::Auth(_) => ErrorClass::Unknown,
            },
        }
    }

    pub fn is_invalid_token(&self) -> bool {
        self.class() == ErrorClass::PermanentInvalidToken
    }
}
