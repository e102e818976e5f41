//! Virtual host configuration as seen by certificate management.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Port marker for plaintext HTTP
pub const HTTP: &str = "http";
/// Port marker for HTTPS
pub const HTTPS: &str = "https";

/// Scheme a host config is served over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Whether a port marker denotes this scheme.
    pub fn matches(self, port: &str) -> bool {
        match self {
            Scheme::Http => port == HTTP || port == "80",
            Scheme::Https => port == HTTPS || port == "443",
        }
    }
}

/// Contact address setting for a host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AcmeEmail {
    /// Fall back to the process-wide resolution chain
    #[default]
    Default,
    /// Use this address
    Address(String),
    /// Automatic management disabled for this host
    Off,
}

impl AcmeEmail {
    pub fn is_off(&self) -> bool {
        matches!(self, AcmeEmail::Off)
    }

    /// The explicit address, if one is set.
    pub fn address(&self) -> Option<&str> {
        match self {
            AcmeEmail::Address(address) => Some(address),
            _ => None,
        }
    }
}

impl From<&str> for AcmeEmail {
    fn from(value: &str) -> Self {
        match value.trim() {
            "" => AcmeEmail::Default,
            "off" => AcmeEmail::Off,
            address => AcmeEmail::Address(address.to_string()),
        }
    }
}

impl fmt::Display for AcmeEmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcmeEmail::Default => Ok(()),
            AcmeEmail::Address(address) => f.write_str(address),
            AcmeEmail::Off => f.write_str("off"),
        }
    }
}

impl Serialize for AcmeEmail {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AcmeEmail {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(AcmeEmail::from(value.as_str()))
    }
}

/// TLS settings of one host config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TlsSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Certificate file path
    #[serde(default)]
    pub certificate: Option<PathBuf>,
    /// Private key file path
    #[serde(default)]
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub email: AcmeEmail,
}

impl TlsSettings {
    /// Whether the operator supplied certificate or key material by hand.
    pub fn has_manual_material(&self) -> bool {
        self.certificate.is_some() || self.key.is_some()
    }
}

/// A redirect rule in a host's request-handling chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RedirectRule {
    pub from_scheme: String,
    pub from_path: String,
    /// Target, with `{path}` standing for the request path
    pub to: String,
    pub status: u16,
}

/// One link in a host's request-handling chain.
///
/// Certificate management only ever adds redirects; other entries are
/// opaque names resolved by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Middleware {
    Redirect(RedirectRule),
    Named(String),
}

/// A virtual host configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HostConfig {
    pub host: String,
    /// Port number or scheme marker (`http`, `https`, `8080`, ...)
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub middleware: Vec<Middleware>,
}

impl HostConfig {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
            ..Default::default()
        }
    }

    /// Set the host's contact address setting (`"off"` disables management).
    pub fn with_email(mut self, email: &str) -> Self {
        self.tls.email = AcmeEmail::from(email);
        self
    }

    /// Supply certificate and key files by hand.
    pub fn with_manual_tls(mut self, certificate: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls.certificate = Some(certificate.into());
        self.tls.key = Some(key.into());
        self.tls.enabled = true;
        self
    }

    pub fn is_served_as(&self, scheme: Scheme) -> bool {
        scheme.matches(&self.port)
    }

    /// Plaintext config that permanently redirects to this host over HTTPS.
    pub fn plaintext_redirect(&self) -> HostConfig {
        HostConfig {
            host: self.host.clone(),
            port: HTTP.to_string(),
            tls: TlsSettings::default(),
            middleware: vec![Middleware::Redirect(RedirectRule {
                from_scheme: HTTP.to_string(),
                from_path: "/".to_string(),
                to: format!("https://{}{{path}}", self.host),
                status: 301,
            })],
        }
    }
}

/// Whether any config in `configs` serves `host` over `scheme`.
pub fn host_has_scheme(host: &str, scheme: Scheme, configs: &[HostConfig]) -> bool {
    configs
        .iter()
        .any(|cfg| cfg.host == host && cfg.is_served_as(scheme))
}
