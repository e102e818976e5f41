//! Selection and grouping of hosts eligible for automatic certificates.

use std::collections::BTreeMap;
use std::net::IpAddr;

use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::host::{HostConfig, Scheme};
use crate::resolver::{email_for, EmailResolver};

/// Whether automatic management may touch `cfg` at all.
///
/// False when the host carries manual TLS material, is served as plaintext,
/// or has management switched off.
pub fn is_managed(cfg: &HostConfig) -> bool {
    !cfg.tls.has_manual_material() && !cfg.is_served_as(Scheme::Http) && !cfg.tls.email.is_off()
}

/// Whether `host` names something no public authority will certify:
/// empty, localhost, loopback, unspecified, or private-range addresses.
pub fn is_internal_host(host: &str) -> bool {
    let host = host.trim();
    if host.is_empty() {
        return true;
    }

    let lower = host.to_ascii_lowercase();
    if lower == "localhost" || lower.ends_with(".localhost") {
        return true;
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            ip.is_loopback() || ip.is_unspecified() || ip.is_private() || ip.is_link_local()
        }
        Ok(IpAddr::V6(ip)) => {
            let first = ip.segments()[0];
            ip.is_loopback()
                || ip.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link local
        }
        Err(_) => false,
    }
}

/// Whether the config at `index` qualifies for automatic certificates.
pub fn qualifies(index: usize, configs: &[HostConfig]) -> bool {
    let cfg = &configs[index];
    if !is_managed(cfg) || is_internal_host(&cfg.host) {
        return false;
    }

    // an HTTPS variant of this host already exists elsewhere in the list
    !configs
        .iter()
        .enumerate()
        .any(|(i, other)| i != index && other.host == cfg.host && other.is_served_as(Scheme::Https))
}

/// Group qualifying configs by contact address.
///
/// Returns indices into `configs`. Fails if a qualifying config has no
/// resolvable address.
pub fn group_by_email(
    configs: &[HostConfig],
    resolver: &dyn EmailResolver,
) -> Result<BTreeMap<String, Vec<usize>>, ConfigError> {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();

    for index in 0..configs.len() {
        if !qualifies(index, configs) {
            trace!(host = %configs[index].host, "Host does not qualify for automatic TLS");
            continue;
        }

        let host = &configs[index].host;
        let email = email_for(&configs[index], resolver)
            .ok_or_else(|| ConfigError::MissingEmail { host: host.clone() })?;

        debug!(host = %host, email = %email, "Host qualifies for automatic TLS");
        groups.entry(email).or_default().push(index);
    }

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{ExplicitEmail, ResolverChain};
    use proptest::prelude::*;

    fn resolver() -> ExplicitEmail {
        ExplicitEmail("default@example.com".to_string())
    }

    #[test]
    fn test_internal_hosts() {
        for host in [
            "", "localhost", "LOCALHOST", "app.localhost", "127.0.0.1", "127.1.2.3", "0.0.0.0",
            "::1", "[::1]", "::", "10.0.0.5", "172.16.4.1", "192.168.1.1", "169.254.0.1",
            "fd00::1", "fe80::1",
        ] {
            assert!(is_internal_host(host), "{host:?} should be internal");
        }
        for host in ["example.com", "8.8.8.8", "2001:db8::1", "172.32.0.1"] {
            assert!(!is_internal_host(host), "{host:?} should be public");
        }
    }

    #[test]
    fn test_qualifies() {
        let configs = vec![
            HostConfig::new("plain.example", ""),
            HostConfig::new("manual.example", "").with_manual_tls("/c.pem", "/k.pem"),
            HostConfig::new("http.example", "http"),
            HostConfig::new("off.example", "").with_email("off"),
            HostConfig::new("localhost", ""),
            HostConfig::new("", ""),
        ];

        assert!(qualifies(0, &configs));
        for i in 1..configs.len() {
            assert!(!qualifies(i, &configs), "{:?} should not qualify", configs[i].host);
        }
    }

    #[test]
    fn test_existing_https_variant_excludes_host() {
        let configs = vec![
            HostConfig::new("a.example", ""),
            HostConfig::new("a.example", "https").with_manual_tls("/c.pem", "/k.pem"),
        ];
        assert!(!qualifies(0, &configs));

        // a lone https config does not exclude itself
        let configs = vec![HostConfig::new("b.example", "https")];
        assert!(qualifies(0, &configs));
    }

    #[test]
    fn test_group_by_email() {
        let configs = vec![
            HostConfig::new("a.example", ""),
            HostConfig::new("b.example", "").with_email("team@example.com"),
            HostConfig::new("c.example", ""),
            HostConfig::new("localhost", ""),
        ];

        let groups = group_by_email(&configs, &resolver()).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["default@example.com"], vec![0, 2]);
        assert_eq!(groups["team@example.com"], vec![1]);
    }

    #[test]
    fn test_missing_email_is_config_error() {
        let configs = vec![
            HostConfig::new("localhost", ""),
            HostConfig::new("a.example", ""),
        ];

        let err = group_by_email(&configs, &ResolverChain::new()).unwrap_err();
        match err {
            ConfigError::MissingEmail { host } => assert_eq!(host, "a.example"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_nothing_eligible_needs_no_email() {
        let configs = vec![HostConfig::new("localhost", "")];
        let groups = group_by_email(&configs, &ResolverChain::new()).unwrap();
        assert!(groups.is_empty());
    }

    fn arb_config() -> impl Strategy<Value = HostConfig> {
        (
            prop::sample::select(vec!["a.example", "b.example", "localhost", "10.1.1.1", ""]),
            prop::sample::select(vec!["", "http", "https", "8443"]),
            prop::sample::select(vec!["", "off", "ops@example.com"]),
            any::<bool>(),
        )
            .prop_map(|(host, port, email, manual)| {
                let cfg = HostConfig::new(host, port).with_email(email);
                if manual {
                    cfg.with_manual_tls("/c.pem", "/k.pem")
                } else {
                    cfg
                }
            })
    }

    proptest! {
        #[test]
        fn prop_groups_hold_only_eligible_hosts(configs in prop::collection::vec(arb_config(), 0..8)) {
            let groups = group_by_email(&configs, &resolver()).unwrap();
            for indices in groups.values() {
                for &i in indices {
                    let cfg = &configs[i];
                    prop_assert!(!cfg.tls.has_manual_material());
                    prop_assert!(!cfg.tls.email.is_off());
                    prop_assert!(!is_internal_host(&cfg.host));
                }
            }
        }
    }
}
