//! Certificate lifecycle entry point.
//!
//! [`CertificateManager::activate`] takes the full host config list and
//! returns it with TLS switched on for every host that has, or has just
//! been issued, a certificate. Redirect configs are appended for hosts
//! without a plaintext counterpart. The renewal scheduler is then left
//! running in the background.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, info};

use crate::account::AccountStore;
use crate::authority::CertificateAuthority;
use crate::client::AuthorityClient;
use crate::config::AutoTlsConfig;
use crate::error::{ActivationError, ConfigError, LifecycleError};
use crate::grouping::{group_by_email, is_managed};
use crate::host::{host_has_scheme, HostConfig, Scheme, HTTPS};
use crate::resolver::{EmailResolver, ResolverChain};
use crate::scheduler::{RenewalHandle, RenewalScheduler};
use crate::storage::Storage;

/// Result of a successful activation.
#[derive(Debug)]
pub struct Activation {
    /// The updated host config list
    pub configs: Vec<HostConfig>,
    /// Background renewal loop
    pub renewals: RenewalHandle,
}

/// Drives account, issuance, and renewal for a set of hosts.
pub struct CertificateManager {
    config: AutoTlsConfig,
    storage: Storage,
    client: Arc<AuthorityClient>,
    resolver: Arc<dyn EmailResolver>,
    scheduler: Arc<RenewalScheduler>,
}

impl CertificateManager {
    /// Create a manager with an explicit address resolver.
    pub fn new(
        config: AutoTlsConfig,
        authority: Arc<dyn CertificateAuthority>,
        resolver: Arc<dyn EmailResolver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let storage = Storage::new(config.storage_path.clone());
        let accounts = AccountStore::new(storage.clone(), config.key_size);
        let client = Arc::new(AuthorityClient::new(
            authority,
            accounts,
            config.agree_to_terms,
        ));
        let scheduler = Arc::new(RenewalScheduler::new(
            Arc::clone(&client),
            Arc::clone(&resolver),
            &config,
        ));

        info!(
            storage = %config.storage_path.display(),
            key_size = ?config.key_size,
            "Certificate manager initialized"
        );

        Ok(Self {
            config,
            storage,
            client,
            resolver,
            scheduler,
        })
    }

    /// Create a manager resolving addresses through the standard chain.
    pub fn from_config(
        config: AutoTlsConfig,
        authority: Arc<dyn CertificateAuthority>,
    ) -> Result<Self, ConfigError> {
        let storage = Storage::new(config.storage_path.clone());
        let resolver = Arc::new(ResolverChain::standard(&config, &storage));
        Self::new(config, authority, resolver)
    }

    pub fn config(&self) -> &AutoTlsConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn client(&self) -> &Arc<AuthorityClient> {
        &self.client
    }

    pub fn scheduler(&self) -> &Arc<RenewalScheduler> {
        &self.scheduler
    }

    /// Activate automatic TLS for `configs`.
    ///
    /// Hosts with stored certificates are configured first and stay
    /// configured if a later group fails; the error carries the list as it
    /// stood at that point.
    pub async fn activate(
        &self,
        mut configs: Vec<HostConfig>,
    ) -> Result<Activation, ActivationError> {
        // hosts with certificates from an earlier run; appended redirects are
        // never revisited
        let initial = configs.len();
        for index in 0..initial {
            if is_managed(&configs[index]) && self.storage.has_certificate(&configs[index].host) {
                info!(host = %configs[index].host, "Using stored certificate");
                self.auto_configure(&mut configs, index);
            }
        }

        // refresh stale certificates before serving
        if let Err(e) = self.scheduler.process_renewals(&configs).await {
            error!(error = %e, "Startup renewal sweep failed");
        }

        let groups = match group_by_email(&configs, self.resolver.as_ref()) {
            Ok(groups) => groups,
            Err(e) => return Err(ActivationError::new(configs, e)),
        };

        for (email, indices) in groups {
            if let Err(e) = self.obtain_for_group(&email, &indices, &configs).await {
                error!(email = %email, error = %e, "Certificate issuance failed");
                return Err(ActivationError::new(configs, e));
            }
            for index in indices {
                self.auto_configure(&mut configs, index);
            }
        }

        let renewals = Arc::clone(&self.scheduler).spawn(Arc::new(configs.clone()));

        info!(
            hosts = configs.len(),
            tls_enabled = configs.iter().filter(|cfg| cfg.tls.enabled).count(),
            "Automatic TLS activated"
        );

        Ok(Activation { configs, renewals })
    }

    /// Obtain and store certificates for every host in one group.
    async fn obtain_for_group(
        &self,
        email: &str,
        indices: &[usize],
        configs: &[HostConfig],
    ) -> Result<(), LifecycleError> {
        let session = self.client.new_session(email).await?;

        let hosts: BTreeSet<String> = indices
            .iter()
            .map(|&index| configs[index].host.clone())
            .collect();
        let certificates = session.obtain(&hosts).await?;

        for certificate in &certificates {
            self.storage.save_certificate(certificate)?;
        }
        Ok(())
    }

    /// Point the config at its stored certificate, serve it over HTTPS, and
    /// add a plaintext redirect unless the host already has an HTTP config.
    fn auto_configure(&self, configs: &mut Vec<HostConfig>, index: usize) {
        {
            let cfg = &mut configs[index];
            cfg.tls.certificate = Some(self.storage.site_cert_file(&cfg.host));
            cfg.tls.key = Some(self.storage.site_key_file(&cfg.host));
            cfg.tls.enabled = true;
            cfg.port = HTTPS.to_string();
        }

        let cfg = &configs[index];
        if !host_has_scheme(&cfg.host, Scheme::Http, configs) {
            let redirect = cfg.plaintext_redirect();
            configs.push(redirect);
        }
    }
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("config", &self.config)
            .field("client", &self.client)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
