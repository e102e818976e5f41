//! Authority sessions bound to one account.
//!
//! [`AuthorityClient::new_session`] loads or creates the account for an
//! address, registers it and agrees to terms when needed, and hands back a
//! [`Session`] for issuance and renewal.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::account::{AccountStore, Identity};
use crate::authority::CertificateAuthority;
use crate::error::AuthorityError;
use crate::storage::CertificateRecord;

/// Opens authority sessions on behalf of accounts.
pub struct AuthorityClient {
    authority: Arc<dyn CertificateAuthority>,
    accounts: AccountStore,
    agree_to_terms: bool,
}

impl AuthorityClient {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        accounts: AccountStore,
        agree_to_terms: bool,
    ) -> Self {
        Self {
            authority,
            accounts,
            agree_to_terms,
        }
    }

    pub fn authority(&self) -> &Arc<dyn CertificateAuthority> {
        &self.authority
    }

    pub fn accounts(&self) -> &AccountStore {
        &self.accounts
    }

    /// Open a session for `email`, registering the account first if needed.
    pub async fn new_session(&self, email: &str) -> Result<Session, AuthorityError> {
        let mut identity = self.accounts.load_or_create(email)?;

        let agreed = identity
            .registration()
            .map_or(false, |registration| registration.terms_agreed);

        // neither registration nor agreement without the operator's consent
        if !agreed && !self.agree_to_terms {
            return Err(AuthorityError::TermsNotAccepted {
                email: email.to_string(),
            });
        }

        if identity.registration().is_none() {
            let registration = self.authority.register(&identity).await?;
            info!(
                email = %email,
                account_url = %registration.account_url,
                "Registered account with authority"
            );
            identity.set_registration(registration);
        }

        if !agreed {
            if let Err(e) = self.authority.agree_to_terms(&identity).await {
                // keep the registration so the next attempt does not register again
                if let Err(save_err) = self.accounts.save(&identity) {
                    warn!(email = %email, error = %save_err, "Could not save registration");
                }
                return Err(e);
            }
            identity.mark_terms_agreed();
            self.accounts.save(&identity)?;
        }

        debug!(email = %email, "Opened authority session");
        Ok(Session {
            authority: Arc::clone(&self.authority),
            identity,
        })
    }
}

impl std::fmt::Debug for AuthorityClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityClient")
            .field("accounts", &self.accounts)
            .field("agree_to_terms", &self.agree_to_terms)
            .finish_non_exhaustive()
    }
}

/// An authenticated scope with the authority for one identity.
pub struct Session {
    authority: Arc<dyn CertificateAuthority>,
    identity: Identity,
}

impl Session {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Obtain certificates for all `domains` in one exchange.
    pub async fn obtain(
        &self,
        domains: &BTreeSet<String>,
    ) -> Result<Vec<CertificateRecord>, AuthorityError> {
        let requested: Vec<String> = domains.iter().cloned().collect();
        info!(
            email = %self.identity.email(),
            domains = ?requested,
            "Obtaining certificates"
        );

        let certificates = self
            .authority
            .obtain_certificates(&self.identity, &requested)
            .await?;

        let returned: BTreeSet<&str> = certificates.iter().map(|c| c.domain()).collect();
        let missing: Vec<String> = requested
            .iter()
            .filter(|domain| !returned.contains(domain.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(AuthorityError::IncompleteBatch { missing });
        }

        Ok(certificates)
    }

    /// Renew `existing`, optionally revoking it.
    pub async fn renew(
        &self,
        existing: &CertificateRecord,
        revoke_old: bool,
    ) -> Result<CertificateRecord, AuthorityError> {
        let renewed = self
            .authority
            .renew_certificate(&self.identity, existing, revoke_old)
            .await?;

        if renewed.domain() != existing.domain() {
            return Err(AuthorityError::Renewal {
                domain: existing.domain().to_string(),
                reason: format!("authority returned a certificate for {}", renewed.domain()),
            });
        }

        info!(
            domain = %renewed.domain(),
            expires = %renewed.meta.expires,
            revoked_old = revoke_old,
            "Renewed certificate"
        );
        Ok(renewed)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
