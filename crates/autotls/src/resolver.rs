//! Contact address resolution.
//!
//! A host's own address wins. Otherwise an [`EmailResolver`] chain is
//! consulted: the configured default, the most recently used account in
//! storage, and finally an interactive prompt.

use std::io::{self, BufRead, BufReader, Write};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::AutoTlsConfig;
use crate::host::HostConfig;
use crate::storage::Storage;

/// Source of a contact address for hosts that do not name one.
pub trait EmailResolver: Send + Sync {
    /// Return an address, or `None` if this source has nothing to offer.
    fn resolve(&self) -> Option<String>;
}

/// Trim an address and reject ones unusable as a storage key.
pub fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim();
    if email.is_empty() || email == "." || email == ".." {
        return None;
    }
    if email.contains(['/', '\\']) || email.chars().any(char::is_control) {
        return None;
    }
    Some(email.to_string())
}

/// Address for `cfg`: its own setting first, then `resolver`.
pub fn email_for(cfg: &HostConfig, resolver: &dyn EmailResolver) -> Option<String> {
    cfg.tls
        .email
        .address()
        .and_then(normalize_email)
        .or_else(|| resolver.resolve().as_deref().and_then(normalize_email))
}

/// A fixed address.
#[derive(Debug, Clone)]
pub struct ExplicitEmail(pub String);

impl EmailResolver for ExplicitEmail {
    fn resolve(&self) -> Option<String> {
        normalize_email(&self.0)
    }
}

/// The account directory most recently modified in storage.
#[derive(Debug, Clone)]
pub struct MostRecentAccount {
    storage: Storage,
}

impl MostRecentAccount {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

impl EmailResolver for MostRecentAccount {
    fn resolve(&self) -> Option<String> {
        let email = self.storage.most_recent_user()?;
        debug!(email = %email, "Using most recent account from storage");
        Some(email)
    }
}

/// Ask for an address on an input stream.
///
/// The first non-empty answer is remembered for the life of the resolver.
pub struct InteractivePrompt {
    input: Mutex<Box<dyn BufRead + Send>>,
    output: Mutex<Box<dyn Write + Send>>,
    answer: Mutex<Option<String>>,
}

impl InteractivePrompt {
    pub fn new(input: Box<dyn BufRead + Send>, output: Box<dyn Write + Send>) -> Self {
        Self {
            input: Mutex::new(input),
            output: Mutex::new(output),
            answer: Mutex::new(None),
        }
    }

    /// Prompt on the process's stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(
            Box::new(BufReader::new(io::stdin())),
            Box::new(io::stdout()),
        )
    }

    fn ask(&self) -> io::Result<String> {
        {
            let mut output = self.output.lock();
            write!(output, "Email address: ")?;
            output.flush()?;
        }
        let mut line = String::new();
        self.input.lock().read_line(&mut line)?;
        Ok(line)
    }
}

impl EmailResolver for InteractivePrompt {
    fn resolve(&self) -> Option<String> {
        let mut answer = self.answer.lock();
        if let Some(ref email) = *answer {
            return Some(email.clone());
        }

        let email = match self.ask() {
            Ok(line) => normalize_email(&line)?,
            Err(e) => {
                warn!(error = %e, "Could not read email address");
                return None;
            }
        };
        *answer = Some(email.clone());
        Some(email)
    }
}

impl std::fmt::Debug for InteractivePrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractivePrompt")
            .field("answer", &*self.answer.lock())
            .finish_non_exhaustive()
    }
}

/// Resolvers tried in order; the first answer wins.
#[derive(Default)]
pub struct ResolverChain {
    resolvers: Vec<Box<dyn EmailResolver>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: impl EmailResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    /// Default chain: configured address, most recent account, and the
    /// stdin prompt when enabled.
    pub fn standard(config: &AutoTlsConfig, storage: &Storage) -> Self {
        let mut chain = Self::new();
        if let Some(ref email) = config.default_email {
            chain = chain.with(ExplicitEmail(email.clone()));
        }
        chain = chain.with(MostRecentAccount::new(storage.clone()));
        if config.prompt_for_email {
            chain = chain.with(InteractivePrompt::stdio());
        }
        chain
    }
}

impl EmailResolver for ResolverChain {
    fn resolve(&self) -> Option<String> {
        self.resolvers.iter().find_map(|resolver| resolver.resolve())
    }
}

impl std::fmt::Debug for ResolverChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverChain")
            .field("resolvers", &self.resolvers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        answer: Option<String>,
        calls: Arc<AtomicUsize>,
    }

    impl EmailResolver for Counting {
        fn resolve(&self) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    fn prompt(input: &str) -> InteractivePrompt {
        InteractivePrompt::new(
            Box::new(Cursor::new(input.as_bytes().to_vec())),
            Box::new(io::sink()),
        )
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  ops@example.com\n").as_deref(), Some("ops@example.com"));
        assert_eq!(normalize_email(""), None);
        assert_eq!(normalize_email("   "), None);
        assert_eq!(normalize_email("a/b@example.com"), None);
        assert_eq!(normalize_email(".."), None);
    }

    #[test]
    fn test_host_email_wins() {
        let cfg = HostConfig::new("a.example", "").with_email("host@example.com");
        let resolver = ExplicitEmail("default@example.com".to_string());
        assert_eq!(email_for(&cfg, &resolver).as_deref(), Some("host@example.com"));

        let cfg = HostConfig::new("a.example", "");
        assert_eq!(email_for(&cfg, &resolver).as_deref(), Some("default@example.com"));
    }

    #[test]
    fn test_chain_stops_at_first_answer() {
        let later = Arc::new(AtomicUsize::new(0));
        let chain = ResolverChain::new()
            .with(Counting {
                answer: None,
                calls: Arc::new(AtomicUsize::new(0)),
            })
            .with(ExplicitEmail("first@example.com".to_string()))
            .with(Counting {
                answer: Some("second@example.com".to_string()),
                calls: later.clone(),
            });

        assert_eq!(chain.resolve().as_deref(), Some("first@example.com"));
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_chain() {
        assert_eq!(ResolverChain::new().resolve(), None);
    }

    #[test]
    fn test_prompt_remembers_answer() {
        let resolver = prompt("typed@example.com\nignored@example.com\n");
        assert_eq!(resolver.resolve().as_deref(), Some("typed@example.com"));
        assert_eq!(resolver.resolve().as_deref(), Some("typed@example.com"));
    }

    #[test]
    fn test_prompt_blank_answer() {
        let resolver = prompt("\n");
        assert_eq!(resolver.resolve(), None);

        let resolver = prompt("");
        assert_eq!(resolver.resolve(), None);
    }

    #[test]
    fn test_most_recent_account() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let resolver = MostRecentAccount::new(storage.clone());
        assert_eq!(resolver.resolve(), None);

        std::fs::create_dir_all(storage.user("ops@example.com")).unwrap();
        assert_eq!(resolver.resolve().as_deref(), Some("ops@example.com"));
    }

    #[test]
    fn test_standard_chain_prefers_default_email() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        std::fs::create_dir_all(storage.user("stored@example.com")).unwrap();

        let mut config = AutoTlsConfig::for_testing(dir.path());
        let chain = ResolverChain::standard(&config, &storage);
        assert_eq!(chain.resolve().as_deref(), Some("stored@example.com"));

        config.default_email = Some("default@example.com".to_string());
        let chain = ResolverChain::standard(&config, &storage);
        assert_eq!(chain.resolve().as_deref(), Some("default@example.com"));
    }
}
