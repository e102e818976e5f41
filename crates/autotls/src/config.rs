//! Configuration for automatic certificate management.
//!
//! Every process-wide knob lives here and is threaded into the manager at
//! construction time.
//!
//! ```toml
//! storage-path = "/var/lib/sentinel/autotls"
//! default-email = "ops@example.com"
//! key-size = "rsa2048"
//! renew-interval-hours = 24
//! renew-within-days = 2
//! warn-within-days = 14
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::keys::KeySize;

/// Automatic TLS configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AutoTlsConfig {
    /// Root of the account/site/timer storage tree
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Contact address used when a host does not name one
    #[serde(default)]
    pub default_email: Option<String>,

    /// Whether the operator accepts the authority's subscriber agreement
    #[serde(default = "default_true")]
    pub agree_to_terms: bool,

    /// Whether to ask on stdin when no address can be found
    #[serde(default = "default_true")]
    pub prompt_for_email: bool,

    /// Strength of newly generated account keys
    #[serde(default)]
    pub key_size: KeySize,

    /// Minimum time between renewal sweeps
    #[serde(default = "default_renew_interval_hours")]
    pub renew_interval_hours: u64,

    /// Renew once this many days (or fewer) remain
    #[serde(default = "default_renew_within_days")]
    pub renew_within_days: i64,

    /// Warn once this many days (or fewer) remain
    #[serde(default = "default_warn_within_days")]
    pub warn_within_days: i64,

    /// Ask the authority to revoke the replaced certificate on renewal
    #[serde(default = "default_true")]
    pub revoke_on_renew: bool,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(".sentinel/autotls")
}
fn default_true() -> bool {
    true
}
fn default_renew_interval_hours() -> u64 {
    24
}
fn default_renew_within_days() -> i64 {
    2
}
fn default_warn_within_days() -> i64 {
    14
}

impl Default for AutoTlsConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            default_email: None,
            agree_to_terms: true,
            prompt_for_email: true,
            key_size: KeySize::default(),
            renew_interval_hours: default_renew_interval_hours(),
            renew_within_days: default_renew_within_days(),
            warn_within_days: default_warn_within_days(),
            revoke_on_renew: true,
        }
    }
}

impl AutoTlsConfig {
    /// Configuration for test runs: cheap keys, no prompting.
    pub fn for_testing(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            prompt_for_email: false,
            key_size: KeySize::TEST,
            ..Default::default()
        }
    }

    /// Load and validate a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loading autotls configuration");
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.renew_interval_hours == 0 {
            return Err(ConfigError::Invalid(
                "renew-interval-hours must be greater than zero".to_string(),
            ));
        }
        if self.renew_within_days < 0 {
            return Err(ConfigError::Invalid(
                "renew-within-days must not be negative".to_string(),
            ));
        }
        if self.warn_within_days < self.renew_within_days {
            return Err(ConfigError::Invalid(format!(
                "warn-within-days ({}) must be at least renew-within-days ({})",
                self.warn_within_days, self.renew_within_days
            )));
        }
        if let Some(ref email) = self.default_email {
            if crate::resolver::normalize_email(email).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "default-email {:?} is not a usable contact address",
                    email
                )));
            }
        }
        Ok(())
    }
}
