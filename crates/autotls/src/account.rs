//! Accounts: a contact address bound to one key pair and an optional
//! authority registration.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rcgen::KeyPair;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::keys::{self, KeySize};
use crate::storage::{create_private_dir, write_private_file, Storage};

/// Registration assigned by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Registration {
    /// Account resource URL assigned by the authority
    pub account_url: String,
    /// Terms of service the account was registered under
    #[serde(default)]
    pub terms_of_service: Option<String>,
    /// Whether the terms agreement exchange has completed
    #[serde(default)]
    pub terms_agreed: bool,
    /// When the account was registered
    pub created: DateTime<Utc>,
}

/// An account identity.
///
/// The key pair is fixed for the identity's lifetime; registering again
/// reuses it.
pub struct Identity {
    email: String,
    registration: Option<Registration>,
    key: KeyPair,
}

impl Identity {
    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    pub(crate) fn set_registration(&mut self, registration: Registration) {
        self.registration = Some(registration);
    }

    pub(crate) fn mark_terms_agreed(&mut self) {
        if let Some(ref mut registration) = self.registration {
            registration.terms_agreed = true;
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("email", &self.email)
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}

/// Registration record file contents. Holds the key's path, never the key.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RegistrationRecord {
    email: String,
    #[serde(default)]
    registration: Option<Registration>,
    key_file: PathBuf,
}

/// Loads, creates, and saves account identities.
pub struct AccountStore {
    storage: Storage,
    key_size: KeySize,
    /// Keys generated for addresses that have not been saved yet
    pending: Mutex<HashMap<String, String>>,
}

impl AccountStore {
    pub fn new(storage: Storage, key_size: KeySize) -> Self {
        Self {
            storage,
            key_size,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Load the identity for `email`, or create an unregistered one.
    ///
    /// A new identity is neither registered nor saved; repeated calls before
    /// [`save`](Self::save) hand back the same key pair.
    pub fn load_or_create(&self, email: &str) -> Result<Identity, StorageError> {
        let reg_path = self.storage.user_reg_file(email);

        let content = match fs::read_to_string(&reg_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return self.create(email),
            Err(e) => return Err(e.into()),
        };

        let record: RegistrationRecord = serde_json::from_str(&content)?;
        if record.email != email {
            warn!(email = %email, recorded = %record.email, "Account record names another address");
        }
        // the layout path wins over the recorded one if the tree was moved
        let key = keys::load_private_key(&self.storage.user_key_file(email))?;

        debug!(
            email = %email,
            registered = record.registration.is_some(),
            recorded_key = %record.key_file.display(),
            "Loaded account"
        );

        Ok(Identity {
            email: email.to_string(),
            registration: record.registration,
            key,
        })
    }

    fn create(&self, email: &str) -> Result<Identity, StorageError> {
        let mut pending = self.pending.lock();

        let key = match pending.get(email) {
            Some(pem) => keys::decode_private_key(pem, &self.storage.user_key_file(email))?,
            None => {
                let key = self.key_size.generate()?;
                pending.insert(email.to_string(), keys::encode_private_key(&key));
                info!(email = %email, key_size = ?self.key_size, "Created new account key");
                key
            }
        };

        Ok(Identity {
            email: email.to_string(),
            registration: None,
            key,
        })
    }

    /// Persist the identity's key pair and registration record.
    ///
    /// Does not register anything with the authority. A failure part way
    /// can leave the key written without the record.
    pub fn save(&self, identity: &Identity) -> Result<(), StorageError> {
        let email = identity.email();
        create_private_dir(&self.storage.user(email))?;

        let key_file = self.storage.user_key_file(email);
        keys::save_private_key(identity.key(), &key_file)?;

        let record = RegistrationRecord {
            email: email.to_string(),
            registration: identity.registration.clone(),
            key_file,
        };
        let content = serde_json::to_string_pretty(&record)?;
        write_private_file(&self.storage.user_reg_file(email), content.as_bytes())?;

        self.pending.lock().remove(email);

        info!(
            email = %email,
            registered = record.registration.is_some(),
            "Saved account"
        );
        Ok(())
    }
}

impl fmt::Debug for AccountStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountStore")
            .field("storage", &self.storage)
            .field("key_size", &self.key_size)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
