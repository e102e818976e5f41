//! On-disk storage for accounts, certificates, and the renewal clock.
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── renew_timer                      # RFC 3339 UTC time of the last sweep
//! ├── users/
//! │   └── ops@example.com/
//! │       ├── ops@example.com.json     # Registration record
//! │       └── ops@example.com.key      # Account private key
//! └── sites/
//!     └── example.com/
//!         ├── example.com.crt          # Certificate chain
//!         ├── example.com.key          # Certificate private key
//!         └── example.com.json         # Certificate metadata
//! ```
//!
//! Single writer only: nothing here takes file locks.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::error::StorageError;

/// Certificate metadata stored alongside the certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CertificateMeta {
    /// Domain the certificate was issued for
    pub domain: String,
    /// Authority resource URL for the certificate
    pub cert_url: String,
    /// When the certificate was issued
    pub issued: DateTime<Utc>,
    /// When the certificate expires, as reported at issuance
    pub expires: DateTime<Utc>,
    /// Issuer name, if the authority reported one
    #[serde(default)]
    pub issuer: Option<String>,
}

/// A certificate, its private key, and its metadata.
///
/// The three parts are always written and read together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    /// PEM-encoded certificate chain
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
    pub meta: CertificateMeta,
}

impl CertificateRecord {
    pub fn domain(&self) -> &str {
        &self.meta.domain
    }
}

/// Deterministic storage layout rooted at one directory.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a storage handle. Nothing is touched on disk until a write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // =========================================================================
    // Layout
    // =========================================================================

    /// Directory holding one subdirectory per account
    pub fn users(&self) -> PathBuf {
        self.root.join("users")
    }

    pub fn user(&self, email: &str) -> PathBuf {
        self.users().join(email)
    }

    pub fn user_reg_file(&self, email: &str) -> PathBuf {
        self.user(email).join(format!("{email}.json"))
    }

    pub fn user_key_file(&self, email: &str) -> PathBuf {
        self.user(email).join(format!("{email}.key"))
    }

    /// Directory holding one subdirectory per site
    pub fn sites(&self) -> PathBuf {
        self.root.join("sites")
    }

    pub fn site(&self, domain: &str) -> PathBuf {
        self.sites().join(domain)
    }

    pub fn site_cert_file(&self, domain: &str) -> PathBuf {
        self.site(domain).join(format!("{domain}.crt"))
    }

    pub fn site_key_file(&self, domain: &str) -> PathBuf {
        self.site(domain).join(format!("{domain}.key"))
    }

    pub fn site_meta_file(&self, domain: &str) -> PathBuf {
        self.site(domain).join(format!("{domain}.json"))
    }

    pub fn renew_timer_file(&self) -> PathBuf {
        self.root.join("renew_timer")
    }

    // =========================================================================
    // Certificate Operations
    // =========================================================================

    /// Whether both a certificate and its key are stored for `domain`.
    pub fn has_certificate(&self, domain: &str) -> bool {
        self.site_cert_file(domain).is_file() && self.site_key_file(domain).is_file()
    }

    /// Save certificate, key, and metadata for the record's domain,
    /// overwriting whatever was there.
    pub fn save_certificate(&self, record: &CertificateRecord) -> Result<(), StorageError> {
        let domain = record.domain();
        create_private_dir(&self.site(domain))?;

        write_private_file(&self.site_cert_file(domain), record.cert_pem.as_bytes())?;
        write_private_file(&self.site_key_file(domain), record.key_pem.as_bytes())?;

        let meta = serde_json::to_string_pretty(&record.meta)?;
        write_private_file(&self.site_meta_file(domain), meta.as_bytes())?;

        info!(
            domain = %domain,
            expires = %record.meta.expires,
            "Saved certificate to storage"
        );
        Ok(())
    }

    /// Read only the certificate PEM for `domain`.
    pub fn read_certificate_pem(&self, domain: &str) -> Result<Vec<u8>, StorageError> {
        Ok(fs::read(self.site_cert_file(domain))?)
    }

    /// Load certificate, key, and metadata for `domain`.
    ///
    /// Metadata that fails to decode is an error; the record is never
    /// assembled from partial data.
    pub fn load_certificate(&self, domain: &str) -> Result<CertificateRecord, StorageError> {
        let cert_pem = fs::read_to_string(self.site_cert_file(domain))?;
        let key_pem = fs::read_to_string(self.site_key_file(domain))?;
        let meta_content = fs::read_to_string(self.site_meta_file(domain))?;
        let meta: CertificateMeta = serde_json::from_str(&meta_content)?;

        debug!(
            domain = %domain,
            expires = %meta.expires,
            "Loaded stored certificate"
        );

        Ok(CertificateRecord {
            cert_pem,
            key_pem,
            meta,
        })
    }

    /// List all domains with a site directory
    pub fn list_sites(&self) -> Result<Vec<String>, StorageError> {
        list_dir_names(&self.sites())
    }

    // =========================================================================
    // Account Lookup
    // =========================================================================

    /// List all account addresses with a user directory
    pub fn list_users(&self) -> Result<Vec<String>, StorageError> {
        list_dir_names(&self.users())
    }

    /// Address of the most recently modified account directory, if any.
    ///
    /// A heuristic only: modification times can tie or be rewritten.
    pub fn most_recent_user(&self) -> Option<String> {
        let entries = fs::read_dir(self.users()).ok()?;

        let mut most_recent: Option<(SystemTime, String)> = None;
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if most_recent
                .as_ref()
                .map_or(true, |(latest, _)| modified > *latest)
            {
                most_recent = Some((modified, name));
            }
        }

        most_recent.map(|(_, name)| name)
    }

    // =========================================================================
    // Renewal Clock
    // =========================================================================

    /// Time of the last renewal sweep, or `None` if no sweep has run.
    pub fn last_renewal(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let content = match fs::read_to_string(self.renew_timer_file()) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!("No renewal clock stored");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let at = DateTime::parse_from_rfc3339(content.trim())?.with_timezone(&Utc);
        Ok(Some(at))
    }

    /// Record `at` as the time of the latest renewal sweep.
    pub fn record_renewal(&self, at: DateTime<Utc>) -> Result<(), StorageError> {
        create_private_dir(&self.root)?;
        let stamp = at.to_rfc3339_opts(SecondsFormat::Secs, true);
        write_private_file(&self.renew_timer_file(), stamp.as_bytes())?;
        debug!(at = %stamp, "Recorded renewal sweep");
        Ok(())
    }
}

fn list_dir_names(path: &Path) -> Result<Vec<String>, StorageError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Create `path` and its parents, restricting the leaf to its owner on Unix.
pub(crate) fn create_private_dir(path: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

/// Write `contents` to `path`, readable by its owner only on Unix.
pub(crate) fn write_private_file(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
