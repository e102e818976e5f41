//! Key pair generation and PEM encoding.

use std::fs;
use std::path::Path;

use rcgen::{KeyPair, RsaKeySize, PKCS_ECDSA_P256_SHA256, PKCS_ECDSA_P384_SHA384, PKCS_RSA_SHA256};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::StorageError;
use crate::storage::write_private_file;

/// Strength of a generated key pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeySize {
    /// ECDSA P-256; only meant for test runs where key generation cost matters
    Ec256,
    /// ECDSA P-384
    Ec384,
    /// RSA 2048, the production default
    #[default]
    Rsa2048,
    /// RSA 4096
    Rsa4096,
}

impl KeySize {
    /// Key size reserved for test execution.
    pub const TEST: KeySize = KeySize::Ec256;

    /// Generate a fresh key pair of this size.
    pub fn generate(self) -> Result<KeyPair, StorageError> {
        trace!(key_size = ?self, "Generating key pair");
        let result = match self {
            KeySize::Ec256 => KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256),
            KeySize::Ec384 => KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384),
            KeySize::Rsa2048 => KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048),
            KeySize::Rsa4096 => KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_4096),
        };
        result.map_err(|e| StorageError::KeyGeneration(format!("{:?}: {}", self, e)))
    }
}

/// Encode a private key as PKCS#8 PEM.
pub fn encode_private_key(key: &KeyPair) -> String {
    key.serialize_pem()
}

/// Decode a PKCS#8 PEM private key. `origin` names the source in errors.
pub fn decode_private_key(pem: &str, origin: &Path) -> Result<KeyPair, StorageError> {
    KeyPair::from_pem(pem).map_err(|e| StorageError::InvalidKey {
        path: origin.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Write a private key to `path` with owner-only permissions.
pub fn save_private_key(key: &KeyPair, path: &Path) -> Result<(), StorageError> {
    write_private_file(path, encode_private_key(key).as_bytes())?;
    debug!(path = %path.display(), "Saved private key");
    Ok(())
}

/// Read a private key from `path`.
pub fn load_private_key(path: &Path) -> Result<KeyPair, StorageError> {
    let pem = fs::read_to_string(path)?;
    decode_private_key(&pem, path)
}

/// Two key pairs are the same key when their PKCS#8 encodings match.
pub fn same_key(a: &KeyPair, b: &KeyPair) -> bool {
    a.serialize_der() == b.serialize_der()
}
