//! Error types for automatic certificate management.

use std::path::PathBuf;

use thiserror::Error;

use crate::host::HostConfig;

/// Errors from the on-disk storage tree.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem create/read/write failure
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structured record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A private key file is missing its PEM block or holds an unusable key
    #[error("invalid private key in {path}: {reason}")]
    InvalidKey { path: PathBuf, reason: String },

    /// Certificate bytes could not be parsed
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The renewal clock file does not hold an RFC 3339 timestamp
    #[error("invalid renewal timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),

    /// Key pair generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
}

/// Errors from the certificate authority or the session wrapping it.
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("registration error: {0}")]
    Registration(String),

    #[error("error agreeing to terms: {0}")]
    Agreement(String),

    /// Registration requested while terms agreement is disabled in config
    #[error("terms of service not accepted for {email}; set agree-to-terms to register")]
    TermsNotAccepted { email: String },

    #[error("error obtaining certificates: {0}")]
    Issuance(String),

    #[error("error renewing certificate for {domain}: {reason}")]
    Renewal { domain: String, reason: String },

    /// The authority answered a batch without a certificate for every domain
    #[error("authority returned no certificate for {missing:?}")]
    IncompleteBatch { missing: Vec<String> },

    #[error("account storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An eligible host has no resolvable contact address
    #[error("must have email address to serve HTTPS without existing certificate and key (host {host:?})")]
    MissingEmail { host: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Aggregate error at the lifecycle boundary.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Authority(#[from] AuthorityError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Activation failed part way.
///
/// Hosts activated before the failure stay activated; their configs are
/// handed back alongside the cause.
#[derive(Debug, Error)]
#[error("activation aborted: {error}")]
pub struct ActivationError {
    /// Config list as it stood when activation stopped
    pub configs: Vec<HostConfig>,
    #[source]
    pub error: LifecycleError,
}

impl ActivationError {
    pub(crate) fn new(configs: Vec<HostConfig>, error: impl Into<LifecycleError>) -> Self {
        Self {
            configs,
            error: error.into(),
        }
    }
}
