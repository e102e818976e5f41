//! Persisted-clock certificate renewal scheduler
//!
//! A sweep is due when no clock is stored or the configured interval has
//! elapsed since the last one. The same check runs at startup and from the
//! background loop, so a restart after a long outage renews promptly.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::AuthorityClient;
use crate::config::AutoTlsConfig;
use crate::error::{ConfigError, LifecycleError, StorageError};
use crate::host::HostConfig;
use crate::resolver::{email_for, EmailResolver};
use crate::storage::{CertificateRecord, Storage};

/// Outcome of checking the renewal clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    /// A sweep should run now
    Due,
    /// The last sweep is recent; check again after this many hours
    Waiting { remaining_hours: u64 },
}

/// A host whose renewal could not be completed during a sweep.
#[derive(Debug)]
pub struct RenewalFailure {
    pub host: String,
    pub error: LifecycleError,
}

/// Result of one call to [`RenewalScheduler::process_renewals_at`].
#[derive(Debug)]
pub struct SweepReport {
    pub state: ScheduleState,
    /// Delay until the next check
    pub next_check_hours: u64,
    /// Hosts renewed during this sweep
    pub renewed: Vec<String>,
    /// Hosts inside the warning window that were not renewed
    pub warned: Vec<String>,
    pub failures: Vec<RenewalFailure>,
}

impl SweepReport {
    fn waiting(remaining_hours: u64) -> Self {
        Self {
            state: ScheduleState::Waiting { remaining_hours },
            next_check_hours: remaining_hours,
            renewed: Vec::new(),
            warned: Vec::new(),
            failures: Vec::new(),
        }
    }
}

/// Renews certificates that are close to expiry.
pub struct RenewalScheduler {
    client: Arc<AuthorityClient>,
    storage: Storage,
    resolver: Arc<dyn EmailResolver>,
    interval_hours: u64,
    renew_within_days: i64,
    warn_within_days: i64,
    revoke_on_renew: bool,
}

impl RenewalScheduler {
    pub fn new(
        client: Arc<AuthorityClient>,
        resolver: Arc<dyn EmailResolver>,
        config: &AutoTlsConfig,
    ) -> Self {
        let storage = client.accounts().storage().clone();
        Self {
            client,
            storage,
            resolver,
            interval_hours: config.renew_interval_hours.max(1),
            renew_within_days: config.renew_within_days,
            warn_within_days: config.warn_within_days,
            revoke_on_renew: config.revoke_on_renew,
        }
    }

    pub fn interval_hours(&self) -> u64 {
        self.interval_hours
    }

    /// Decide whether a sweep is due at `now`.
    ///
    /// A corrupt clock file counts as missing; it is overwritten by the
    /// sweep that follows.
    pub fn check_schedule_at(&self, now: DateTime<Utc>) -> Result<ScheduleState, StorageError> {
        let last = match self.storage.last_renewal() {
            Ok(last) => last,
            Err(StorageError::InvalidTimestamp(e)) => {
                warn!(error = %e, "Ignoring unreadable renewal clock");
                None
            }
            Err(e) => return Err(e),
        };

        let Some(last) = last else {
            return Ok(ScheduleState::Due);
        };

        let elapsed = now.signed_duration_since(last);
        if elapsed < chrono::Duration::zero() {
            // clock stored in the future; wait at most one interval
            return Ok(ScheduleState::Waiting {
                remaining_hours: self.interval_hours,
            });
        }

        let elapsed_hours = u64::try_from(elapsed.num_hours()).unwrap_or(0);
        if elapsed_hours >= self.interval_hours {
            Ok(ScheduleState::Due)
        } else {
            Ok(ScheduleState::Waiting {
                remaining_hours: self.interval_hours - elapsed_hours,
            })
        }
    }

    /// Run a sweep now if one is due.
    pub async fn process_renewals(
        &self,
        configs: &[HostConfig],
    ) -> Result<SweepReport, StorageError> {
        self.process_renewals_at(configs, Utc::now()).await
    }

    /// Run a sweep at `now` if one is due.
    ///
    /// Only a failure to read or write the clock is an error. Per-host
    /// problems are collected in the report and do not stop the sweep.
    pub async fn process_renewals_at(
        &self,
        configs: &[HostConfig],
        now: DateTime<Utc>,
    ) -> Result<SweepReport, StorageError> {
        if let ScheduleState::Waiting { remaining_hours } = self.check_schedule_at(now)? {
            debug!(remaining_hours, "Renewal sweep not due yet");
            return Ok(SweepReport::waiting(remaining_hours));
        }

        self.storage.record_renewal(now)?;

        let mut report = SweepReport {
            state: ScheduleState::Due,
            next_check_hours: self.interval_hours,
            renewed: Vec::new(),
            warned: Vec::new(),
            failures: Vec::new(),
        };

        let mut seen: HashSet<&str> = HashSet::new();
        for cfg in configs {
            let host = cfg.host.as_str();
            if !cfg.tls.enabled || !self.storage.has_certificate(host) || !seen.insert(host) {
                continue;
            }

            let expires = match self.certificate_expiry(host) {
                Ok(expires) => expires,
                Err(e) => {
                    warn!(host = %host, error = %e, "Failed to read certificate expiry");
                    report.failures.push(RenewalFailure {
                        host: host.to_string(),
                        error: e.into(),
                    });
                    continue;
                }
            };

            let days_left = expires
                .signed_duration_since(now)
                .num_hours()
                .div_euclid(24);

            let mut renewed = false;
            if days_left <= self.renew_within_days {
                warn!(
                    host = %host,
                    days_left,
                    "Certificate expires soon, attempting renewal"
                );
                match self.renew_host(cfg).await {
                    Ok(record) => {
                        info!(
                            host = %host,
                            expires = %record.meta.expires,
                            "Certificate renewal completed"
                        );
                        report.renewed.push(host.to_string());
                        renewed = true;
                    }
                    Err(e) => {
                        error!(host = %host, error = %e, "Certificate renewal failed");
                        report.failures.push(RenewalFailure {
                            host: host.to_string(),
                            error: e,
                        });
                    }
                }
            }

            if !renewed && days_left <= self.warn_within_days {
                warn!(
                    host = %host,
                    days_left,
                    expires = %expires,
                    "Certificate is close to expiry"
                );
                report.warned.push(host.to_string());
            }
        }

        info!(
            renewed = report.renewed.len(),
            warned = report.warned.len(),
            failed = report.failures.len(),
            next_check_hours = report.next_check_hours,
            "Renewal sweep finished"
        );
        Ok(report)
    }

    fn certificate_expiry(&self, host: &str) -> Result<DateTime<Utc>, StorageError> {
        let pem = self.storage.read_certificate_pem(host)?;
        self.client.authority().expiry_of(&pem)
    }

    async fn renew_host(&self, cfg: &HostConfig) -> Result<CertificateRecord, LifecycleError> {
        let email = self.resolve_email(cfg).await.ok_or_else(|| ConfigError::MissingEmail {
            host: cfg.host.clone(),
        })?;

        let session = self.client.new_session(&email).await?;
        let existing = self.storage.load_certificate(&cfg.host)?;
        let renewed = session.renew(&existing, self.revoke_on_renew).await?;
        self.storage.save_certificate(&renewed)?;
        Ok(renewed)
    }

    /// Resolve the contact address off the async workers; the resolver may
    /// block on an interactive prompt.
    async fn resolve_email(&self, cfg: &HostConfig) -> Option<String> {
        let resolver = Arc::clone(&self.resolver);
        let cfg = cfg.clone();
        let host = cfg.host.clone();

        tokio::task::spawn_blocking(move || email_for(&cfg, resolver.as_ref()))
            .await
            .unwrap_or_else(|e| {
                error!(host = %host, error = %e, "Contact address resolution failed");
                None
            })
    }

    /// Start the background sweep loop on the current Tokio runtime.
    ///
    /// The loop sleeps between checks for the delay each sweep reports. A
    /// clock read/write failure is logged and ends the loop.
    pub fn spawn(self: Arc<Self>, configs: Arc<Vec<HostConfig>>) -> RenewalHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            info!(
                interval_hours = self.interval_hours,
                hosts = configs.len(),
                "Starting certificate renewal scheduler"
            );

            loop {
                let next_check_hours = match self.process_renewals(&configs).await {
                    Ok(report) => report.next_check_hours,
                    Err(e) => {
                        error!(error = %e, "Renewal scheduling failed, stopping scheduler");
                        break;
                    }
                };

                let delay = Duration::from_secs(next_check_hours.max(1) * 3600);
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Certificate renewal scheduler stopped");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });

        RenewalHandle { cancel, task }
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("interval_hours", &self.interval_hours)
            .field("renew_within_days", &self.renew_within_days)
            .field("warn_within_days", &self.warn_within_days)
            .field("revoke_on_renew", &self.revoke_on_renew)
            .finish_non_exhaustive()
    }
}

/// Handle to the background renewal loop.
///
/// Dropping the handle leaves the loop running for the life of the runtime.
#[derive(Debug)]
pub struct RenewalHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RenewalHandle {
    /// Token that stops the loop when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "Certificate renewal scheduler task failed");
        }
    }
}
