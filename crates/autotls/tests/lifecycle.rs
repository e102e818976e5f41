//! End-to-end activation and renewal against the local authority.

use std::sync::Arc;

use chrono::{Duration, Utc};
use sentinel_autotls::{
    pem_certificate_expiry, AutoTlsConfig, CertificateManager, ExplicitEmail, HostConfig,
    LifecycleError, LocalAuthority, Middleware, RedirectRule, Scheme,
};
use tempfile::TempDir;

fn setup(authority: Arc<LocalAuthority>) -> (TempDir, CertificateManager) {
    let temp_dir = TempDir::new().unwrap();
    let config = AutoTlsConfig::for_testing(temp_dir.path());
    let manager = CertificateManager::new(
        config,
        authority,
        Arc::new(ExplicitEmail("ops@example.com".to_string())),
    )
    .unwrap();
    (temp_dir, manager)
}

#[tokio::test]
async fn test_activate_issues_and_redirects() {
    let authority = Arc::new(LocalAuthority::new("e2e-ca").unwrap());
    let (_temp_dir, manager) = setup(authority.clone());

    let activation = manager
        .activate(vec![HostConfig::new("a.example", "")])
        .await
        .unwrap();
    activation.renewals.shutdown().await;

    let storage = manager.storage();
    assert!(storage.site_cert_file("a.example").is_file());
    assert!(storage.site_key_file("a.example").is_file());
    assert!(storage.site_meta_file("a.example").is_file());
    assert!(storage.user_reg_file("ops@example.com").is_file());
    assert!(storage.renew_timer_file().is_file());

    let configs = activation.configs;
    assert_eq!(configs.len(), 2);

    let secure = &configs[0];
    assert!(secure.tls.enabled);
    assert!(secure.is_served_as(Scheme::Https));
    assert_eq!(
        secure.tls.certificate.as_deref(),
        Some(storage.site_cert_file("a.example").as_path())
    );
    assert_eq!(
        secure.tls.key.as_deref(),
        Some(storage.site_key_file("a.example").as_path())
    );

    let redirect = &configs[1];
    assert_eq!(redirect.host, "a.example");
    assert!(redirect.is_served_as(Scheme::Http));
    assert_eq!(
        redirect.middleware,
        vec![Middleware::Redirect(RedirectRule {
            from_scheme: "http".to_string(),
            from_path: "/".to_string(),
            to: "https://a.example{path}".to_string(),
            status: 301,
        })]
    );
}

#[tokio::test]
async fn test_second_activation_reuses_stored_certificate() {
    let authority = Arc::new(LocalAuthority::new("e2e-ca").unwrap());
    let (_temp_dir, manager) = setup(authority.clone());

    let first = manager
        .activate(vec![HostConfig::new("a.example", "")])
        .await
        .unwrap();
    first.renewals.shutdown().await;
    assert_eq!(authority.issued_count(), 1);

    // fresh process, same storage
    let second = manager
        .activate(vec![HostConfig::new("a.example", "")])
        .await
        .unwrap();
    second.renewals.shutdown().await;

    assert_eq!(authority.issued_count(), 1);
    assert_eq!(authority.registration_count(), 1);
    assert!(second.configs[0].tls.enabled);
    assert_eq!(second.configs.len(), 2);
}

#[tokio::test]
async fn test_sweep_renews_certificate_near_expiry() {
    let authority = Arc::new(
        LocalAuthority::new("e2e-ca")
            .unwrap()
            .with_validity(Duration::days(1)),
    );
    let (_temp_dir, manager) = setup(authority.clone());

    let activation = manager
        .activate(vec![HostConfig::new("b.example", "")])
        .await
        .unwrap();
    activation.renewals.shutdown().await;

    let storage = manager.storage();
    let before = storage.load_certificate("b.example").unwrap();
    authority.set_validity(Duration::days(90));

    // next sweep, one interval later
    let later = Utc::now() + Duration::hours(25);
    let report = manager
        .scheduler()
        .process_renewals_at(&activation.configs, later)
        .await
        .unwrap();
    assert_eq!(report.renewed, vec!["b.example".to_string()]);
    assert!(report.failures.is_empty());

    let after = storage.load_certificate("b.example").unwrap();
    assert_ne!(after.meta.cert_url, before.meta.cert_url);
    assert!(authority.is_revoked(&before.meta.cert_url));
    assert_eq!(storage.list_sites().unwrap(), vec!["b.example".to_string()]);

    let expires = pem_certificate_expiry(after.cert_pem.as_bytes()).unwrap();
    let days_left = (expires - Utc::now()).num_hours().div_euclid(24);
    assert!(days_left > 2);
}

#[tokio::test]
async fn test_failed_batch_keeps_stored_hosts_active() {
    let authority = Arc::new(LocalAuthority::new("e2e-ca").unwrap());
    let (_temp_dir, manager) = setup(authority.clone());

    let first = manager
        .activate(vec![HostConfig::new("stored.example", "")])
        .await
        .unwrap();
    first.renewals.shutdown().await;

    let configs = vec![
        HostConfig::new("stored.example", ""),
        HostConfig::new("good.example", ""),
        HostConfig::new("bad_host!", ""),
    ];
    let err = manager.activate(configs).await.unwrap_err();
    assert!(matches!(err.error, LifecycleError::Authority(_)));

    // one group, one failed batch: nothing new issued or stored
    assert!(!manager.storage().has_certificate("good.example"));
    assert_eq!(authority.issued_count(), 1);

    let stored = &err.configs[0];
    assert!(stored.tls.enabled);
    assert!(stored.is_served_as(Scheme::Https));
    assert!(!err.configs[1].tls.enabled);
}
