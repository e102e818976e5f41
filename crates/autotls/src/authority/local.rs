//! In-process development authority.
//!
//! Signs leaf certificates with a locally generated CA. Accounts must
//! register and agree to terms before issuance, and every hostname in a
//! batch is validated before any certificate is signed.

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use time::OffsetDateTime;
use tracing::{debug, info};

use super::CertificateAuthority;
use crate::account::{Identity, Registration};
use crate::error::AuthorityError;
use crate::storage::{CertificateMeta, CertificateRecord};

/// Default leaf certificate lifetime
const DEFAULT_VALIDITY_DAYS: i64 = 90;

struct LocalAccount {
    email: String,
    agreed: bool,
}

#[derive(Default)]
struct LocalState {
    accounts: HashMap<String, LocalAccount>,
    revoked: HashSet<String>,
    next_account: u64,
    next_serial: u64,
}

/// Development certificate authority backed by an in-memory CA.
pub struct LocalAuthority {
    name: String,
    issuer: Issuer<'static, KeyPair>,
    ca_pem: String,
    validity: Mutex<Duration>,
    state: Mutex<LocalState>,
}

impl LocalAuthority {
    /// Create an authority with a fresh CA named `name`.
    pub fn new(name: &str) -> Result<Self, AuthorityError> {
        let ca_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| AuthorityError::Issuance(format!("CA key generation failed: {}", e)))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| AuthorityError::Issuance(e.to_string()))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{name} Development CA"));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| AuthorityError::Issuance(format!("CA self-signing failed: {}", e)))?;

        info!(authority = %name, "Created local development authority");

        Ok(Self {
            name: name.to_string(),
            ca_pem: ca_cert.pem(),
            issuer: Issuer::new(params, ca_key),
            validity: Mutex::new(Duration::days(DEFAULT_VALIDITY_DAYS)),
            state: Mutex::new(LocalState::default()),
        })
    }

    /// Set the lifetime of certificates issued from now on.
    pub fn with_validity(self, validity: Duration) -> Self {
        *self.validity.lock() = validity;
        self
    }

    pub fn set_validity(&self, validity: Duration) {
        *self.validity.lock() = validity;
    }

    /// PEM of the CA certificate that signs every leaf
    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca_pem
    }

    pub fn is_revoked(&self, cert_url: &str) -> bool {
        self.state.lock().revoked.contains(cert_url)
    }

    /// Number of accounts registered so far
    pub fn registration_count(&self) -> usize {
        self.state.lock().accounts.len()
    }

    /// Number of certificates signed so far
    pub fn issued_count(&self) -> u64 {
        self.state.lock().next_serial
    }

    fn authorize(&self, state: &LocalState, identity: &Identity) -> Result<(), String> {
        let registration = identity
            .registration()
            .ok_or_else(|| format!("account {} is not registered", identity.email()))?;
        let account = state
            .accounts
            .get(&registration.account_url)
            .ok_or_else(|| format!("unknown account {}", registration.account_url))?;
        if !account.agreed {
            return Err(format!(
                "account {} has not agreed to the terms of service",
                account.email
            ));
        }
        Ok(())
    }

    fn sign(
        &self,
        state: &mut LocalState,
        domain: &str,
        expires: DateTime<Utc>,
    ) -> Result<CertificateRecord, String> {
        let issued = Utc::now();
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| e.to_string())?;

        let mut params =
            CertificateParams::new(vec![domain.to_string()]).map_err(|e| e.to_string())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain);
        params.distinguished_name = dn;
        params.not_before = offset_datetime(issued - Duration::minutes(5))?;
        params.not_after = offset_datetime(expires)?;

        let cert = params
            .signed_by(&key, &self.issuer)
            .map_err(|e| e.to_string())?;

        state.next_serial += 1;
        let cert_url = format!("local://{}/cert/{}", self.name, state.next_serial);
        debug!(domain = %domain, cert_url = %cert_url, "Signed certificate");

        Ok(CertificateRecord {
            cert_pem: format!("{}{}", cert.pem(), self.ca_pem),
            key_pem: key.serialize_pem(),
            meta: CertificateMeta {
                domain: domain.to_string(),
                cert_url,
                issued,
                expires,
                issuer: Some(self.name.clone()),
            },
        })
    }

    /// Sign a certificate without any account checks.
    #[cfg(test)]
    pub(crate) fn issue_for_test(&self, domain: &str, expires: DateTime<Utc>) -> CertificateRecord {
        let mut state = self.state.lock();
        self.sign(&mut state, domain, expires).unwrap()
    }
}

#[async_trait]
impl CertificateAuthority for LocalAuthority {
    async fn register(&self, identity: &Identity) -> Result<Registration, AuthorityError> {
        let mut state = self.state.lock();
        state.next_account += 1;
        let account_url = format!("local://{}/acct/{}", self.name, state.next_account);
        state.accounts.insert(
            account_url.clone(),
            LocalAccount {
                email: identity.email().to_string(),
                agreed: false,
            },
        );

        info!(email = %identity.email(), account_url = %account_url, "Registered account");

        Ok(Registration {
            account_url,
            terms_of_service: Some(format!("local://{}/terms", self.name)),
            terms_agreed: false,
            created: Utc::now(),
        })
    }

    async fn agree_to_terms(&self, identity: &Identity) -> Result<(), AuthorityError> {
        let registration = identity.registration().ok_or_else(|| {
            AuthorityError::Agreement(format!("account {} is not registered", identity.email()))
        })?;

        let mut state = self.state.lock();
        let account = state
            .accounts
            .get_mut(&registration.account_url)
            .ok_or_else(|| {
                AuthorityError::Agreement(format!("unknown account {}", registration.account_url))
            })?;
        account.agreed = true;
        Ok(())
    }

    async fn obtain_certificates(
        &self,
        identity: &Identity,
        domains: &[String],
    ) -> Result<Vec<CertificateRecord>, AuthorityError> {
        let mut state = self.state.lock();
        self.authorize(&state, identity)
            .map_err(AuthorityError::Issuance)?;

        // all-or-nothing: validate every domain before signing any
        for domain in domains {
            validate_domain(domain).map_err(AuthorityError::Issuance)?;
        }

        let expires = Utc::now() + *self.validity.lock();
        domains
            .iter()
            .map(|domain| {
                self.sign(&mut state, domain, expires)
                    .map_err(AuthorityError::Issuance)
            })
            .collect()
    }

    async fn renew_certificate(
        &self,
        identity: &Identity,
        existing: &CertificateRecord,
        revoke_old: bool,
    ) -> Result<CertificateRecord, AuthorityError> {
        let domain = existing.domain().to_string();
        let renewal_error = |reason: String| AuthorityError::Renewal {
            domain: domain.clone(),
            reason,
        };

        let mut state = self.state.lock();
        self.authorize(&state, identity).map_err(renewal_error)?;
        validate_domain(&domain).map_err(renewal_error)?;
        if state.revoked.contains(&existing.meta.cert_url) {
            return Err(renewal_error(format!(
                "certificate {} has been revoked",
                existing.meta.cert_url
            )));
        }

        let expires = Utc::now() + *self.validity.lock();
        let renewed = self
            .sign(&mut state, &domain, expires)
            .map_err(renewal_error)?;

        if revoke_old {
            state.revoked.insert(existing.meta.cert_url.clone());
        }
        Ok(renewed)
    }
}

impl fmt::Debug for LocalAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAuthority")
            .field("name", &self.name)
            .field("validity", &*self.validity.lock())
            .finish_non_exhaustive()
    }
}

fn offset_datetime(at: DateTime<Utc>) -> Result<OffsetDateTime, String> {
    OffsetDateTime::from_unix_timestamp(at.timestamp()).map_err(|e| e.to_string())
}

/// Reject hostnames no authority would validate
fn validate_domain(domain: &str) -> Result<(), String> {
    if domain.is_empty() {
        return Err("domain cannot be empty".to_string());
    }
    if domain.starts_with('.') || domain.ends_with('.') || domain.contains("..") {
        return Err(format!("domain {:?} has an empty label", domain));
    }
    let body = domain.strip_prefix("*.").unwrap_or(domain);
    if !body
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(format!("domain {:?} contains invalid characters", domain));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountStore;
    use crate::authority::pem_certificate_expiry;
    use crate::keys::KeySize;
    use crate::storage::Storage;
    use tempfile::TempDir;

    async fn registered_identity(authority: &LocalAuthority, dir: &TempDir) -> Identity {
        let store = AccountStore::new(Storage::new(dir.path()), KeySize::TEST);
        let mut identity = store.load_or_create("ops@example.com").unwrap();
        let registration = authority.register(&identity).await.unwrap();
        identity.set_registration(registration);
        authority.agree_to_terms(&identity).await.unwrap();
        identity
    }

    #[test]
    fn test_validate_domain() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("sub.example-site.com").is_ok());
        assert!(validate_domain("*.example.com").is_ok());
        assert!(validate_domain("").is_err());
        assert!(validate_domain("invalid domain.com").is_err());
        assert!(validate_domain(".example.com").is_err());
        assert!(validate_domain("example.com.").is_err());
        assert!(validate_domain("a..b").is_err());
    }

    #[tokio::test]
    async fn test_issuance_requires_agreement() {
        let dir = TempDir::new().unwrap();
        let authority = LocalAuthority::new("test-ca").unwrap();
        let store = AccountStore::new(Storage::new(dir.path()), KeySize::TEST);
        let mut identity = store.load_or_create("ops@example.com").unwrap();

        let domains = vec!["a.example".to_string()];
        assert!(authority.obtain_certificates(&identity, &domains).await.is_err());

        identity.set_registration(authority.register(&identity).await.unwrap());
        assert!(authority.obtain_certificates(&identity, &domains).await.is_err());

        authority.agree_to_terms(&identity).await.unwrap();
        let certs = authority
            .obtain_certificates(&identity, &domains)
            .await
            .unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].domain(), "a.example");
    }

    #[tokio::test]
    async fn test_batch_fails_as_a_whole() {
        let dir = TempDir::new().unwrap();
        let authority = LocalAuthority::new("test-ca").unwrap();
        let identity = registered_identity(&authority, &dir).await;

        let domains = vec!["good.example".to_string(), "bad host".to_string()];
        let result = authority.obtain_certificates(&identity, &domains).await;
        assert!(matches!(result, Err(AuthorityError::Issuance(_))));
        assert_eq!(authority.issued_count(), 0);
    }

    #[tokio::test]
    async fn test_validity_applies_to_issued_certificates() {
        let dir = TempDir::new().unwrap();
        let authority = LocalAuthority::new("test-ca")
            .unwrap()
            .with_validity(Duration::days(10));
        let identity = registered_identity(&authority, &dir).await;

        let certs = authority
            .obtain_certificates(&identity, &["a.example".to_string()])
            .await
            .unwrap();
        let expiry = pem_certificate_expiry(certs[0].cert_pem.as_bytes()).unwrap();
        let days = (expiry - Utc::now()).num_hours() / 24;
        assert_eq!(days, 9);
        assert!(certs[0].cert_pem.ends_with(authority.ca_certificate_pem()));
    }

    #[tokio::test]
    async fn test_renew_revokes_old() {
        let dir = TempDir::new().unwrap();
        let authority = LocalAuthority::new("test-ca").unwrap();
        let identity = registered_identity(&authority, &dir).await;

        let original = authority
            .obtain_certificates(&identity, &["a.example".to_string()])
            .await
            .unwrap()
            .remove(0);

        let renewed = authority
            .renew_certificate(&identity, &original, true)
            .await
            .unwrap();
        assert_eq!(renewed.domain(), "a.example");
        assert_ne!(renewed.meta.cert_url, original.meta.cert_url);
        assert!(authority.is_revoked(&original.meta.cert_url));
        assert!(!authority.is_revoked(&renewed.meta.cert_url));

        // a revoked certificate cannot be renewed again
        let again = authority.renew_certificate(&identity, &original, true).await;
        assert!(matches!(again, Err(AuthorityError::Renewal { .. })));
    }
}
