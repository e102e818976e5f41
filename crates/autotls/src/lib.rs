//! Sentinel Automatic TLS
//!
//! Obtains, stores, and renews domain-validated certificates for virtual
//! hosts that do not bring their own.
//!
//! # Architecture
//!
//! - [`AccountStore`] - Loads or creates the account identity for a contact address
//! - [`AuthorityClient`] - Registers accounts and opens issuance [`Session`]s
//! - [`group_by_email`] - Selects eligible hosts and groups them by account
//! - [`RenewalScheduler`] - Persisted-clock renewal sweeps, at startup and in the background
//! - [`CertificateManager`] - Composes the above into a single activation pass
//! - [`Storage`] - Deterministic on-disk layout for all of the above
//!
//! The authority itself sits behind [`CertificateAuthority`].
//! [`LocalAuthority`] signs with an in-process CA for development and tests.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sentinel_autotls::{AutoTlsConfig, CertificateManager, HostConfig, LocalAuthority};
//!
//! let config = AutoTlsConfig::from_file("autotls.toml")?;
//! let authority = Arc::new(LocalAuthority::new("dev")?);
//! let manager = CertificateManager::from_config(config, authority)?;
//!
//! let activation = manager
//!     .activate(vec![HostConfig::new("example.com", "")])
//!     .await?;
//! // serve activation.configs ...
//! activation.renewals.shutdown().await;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod account;
pub mod authority;
pub mod client;
pub mod config;
pub mod error;
pub mod grouping;
pub mod host;
pub mod keys;
pub mod manager;
pub mod resolver;
pub mod scheduler;
pub mod storage;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Accounts and sessions
pub use account::{AccountStore, Identity, Registration};
pub use client::{AuthorityClient, Session};

// Authority boundary
pub use authority::{pem_certificate_expiry, CertificateAuthority, LocalAuthority};

// Configuration
pub use config::AutoTlsConfig;
pub use keys::KeySize;

// Errors
pub use error::{ActivationError, AuthorityError, ConfigError, LifecycleError, StorageError};

// Hosts and grouping
pub use grouping::{group_by_email, is_internal_host, qualifies};
pub use host::{AcmeEmail, HostConfig, Middleware, RedirectRule, Scheme, TlsSettings};

// Address resolution
pub use resolver::{
    EmailResolver, ExplicitEmail, InteractivePrompt, MostRecentAccount, ResolverChain,
};

// Renewal
pub use scheduler::{RenewalFailure, RenewalHandle, RenewalScheduler, ScheduleState, SweepReport};

// Lifecycle
pub use manager::{Activation, CertificateManager};

// Storage
pub use storage::{CertificateMeta, CertificateRecord, Storage};
