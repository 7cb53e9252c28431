use crate::errors::ConstructionError;
use crate::providers::ProviderKind;
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Credential files above this size are refused.
pub const MAX_CREDENTIAL_FILE_SIZE: u64 = 10 * 1024 * 1024;

const FCM_DEFAULT_RETRIES: i32 = 2;
const FCM_DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const GCM_DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const APNS_DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(tag = "provider", rename_all = "kebab-case")]
pub enum ProviderConfig {
    Apns {
        /// PEM bundle holding the client certificate chain and its private key.
        pem: PathBuf,
        #[serde(default)]
        topic: Option<String>,
    },
    FcmV1 {
        service_account: PathBuf,
    },
    Gcm {
        key: String,
    },
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct ProjectConfig {
    pub project_id: String,
    #[serde(flatten)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub nop_mode: bool,
    /// Concurrent pushes per project. Zero means the number of CPUs.
    #[serde(default)]
    pub workers: usize,
    #[serde(default)]
    pub sandbox: bool,
    #[serde(default)]
    pub allow_alerts: bool,
    #[serde(default)]
    pub sound: String,
    #[serde(default)]
    pub retries: Option<i32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Replaces the provider's base URL.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Read-only view of a project's delivery settings.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectPolicy {
    pub allow_alerts: bool,
    pub sound: String,
    pub topic: Option<String>,
    pub sandbox: bool,
    pub concurrency_limit: usize,
    pub retries: i32,
    pub timeout: Duration,
}

impl Default for ProjectPolicy {
    fn default() -> Self {
        ProjectPolicy {
            allow_alerts: false,
            sound: String::new(),
            topic: None,
            sandbox: false,
            concurrency_limit: 1,
            retries: 1,
            timeout: APNS_DEFAULT_TIMEOUT,
        }
    }
}

impl ProjectConfig {
    pub fn kind(&self) -> ProviderKind {
        match self.provider {
            ProviderConfig::Apns { .. } => ProviderKind::Apns,
            ProviderConfig::FcmV1 { .. } => ProviderKind::FcmV1,
            ProviderConfig::Gcm { .. } => ProviderKind::Gcm,
        }
    }

    pub fn policy(&self) -> ProjectPolicy {
        let (default_retries, default_timeout) = match self.kind() {
            ProviderKind::Apns => (1, APNS_DEFAULT_TIMEOUT),
            ProviderKind::FcmV1 => (FCM_DEFAULT_RETRIES, FCM_DEFAULT_TIMEOUT),
            ProviderKind::Gcm => (1, GCM_DEFAULT_TIMEOUT),
        };
        let topic = match &self.provider {
            ProviderConfig::Apns { topic, .. } => topic.clone().filter(|t| !t.is_empty()),
            _ => None,
        };
        let concurrency_limit = match self.workers {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };

        ProjectPolicy {
            allow_alerts: self.allow_alerts,
            sound: self.sound.clone(),
            topic,
            sandbox: self.sandbox,
            concurrency_limit,
            retries: self.retries.unwrap_or(default_retries),
            timeout: self
                .timeout_ms
                .map_or(default_timeout, Duration::from_millis),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("project_id must not be empty")]
    EmptyProjectId,
    #[error("duplicate project_id {0:?}")]
    DuplicateProjectId(String),
    #[error("project {0:?}: GCM server key must not be empty")]
    EmptyServerKey(String),
    #[error("project {0:?}: timeout_ms must be positive")]
    ZeroTimeout(String),
}

/// Checks a set of projects before any client is built.
pub fn validate_projects(projects: &[ProjectConfig]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();

    for project in projects {
        if project.project_id.is_empty() {
            return Err(ValidationError::EmptyProjectId);
        }
        if !seen.insert(project.project_id.as_str()) {
            return Err(ValidationError::DuplicateProjectId(
                project.project_id.clone(),
            ));
        }
        if let ProviderConfig::Gcm { key } = &project.provider
            && key.trim().is_empty()
        {
            return Err(ValidationError::EmptyServerKey(project.project_id.clone()));
        }
        if project.timeout_ms == Some(0) {
            return Err(ValidationError::ZeroTimeout(project.project_id.clone()));
        }
    }

    Ok(())
}

/// Reads a credential file, refusing anything larger than `MAX_CREDENTIAL_FILE_SIZE`.
pub fn read_credential_file(path: &Path) -> Result<Vec<u8>, ConstructionError> {
    let io_error = |source| ConstructionError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = std::fs::File::open(path).map_err(io_error)?;
    let size = file.metadata().map_err(io_error)?.len();
    if size > MAX_CREDENTIAL_FILE_SIZE {
        return Err(ConstructionError::FileTooLarge {
            path: path.to_path_buf(),
            size,
            limit: MAX_CREDENTIAL_FILE_SIZE,
        });
    }

    let mut data = Vec::with_capacity(size as usize);
    file.take(MAX_CREDENTIAL_FILE_SIZE)
        .read_to_end(&mut data)
        .map_err(io_error)?;
    Ok(data)
}
