//! Card-secret custody boundary.
//!
//! The engine only ever sees plaintext inside a release or an authorized
//! view; everywhere else a card carries an opaque vault handle.

use crate::error::{EngineError, Result};

/// A gift card's number and PIN.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct CardSecret {
    #[n(0)]
    pub card_number: String,
    #[n(1)]
    pub pin: String,
}

/// Encryption-at-rest lives behind this trait; the engine treats it as an
/// external dependency whose failures abort (and never half-apply) the
/// transition that needed it.
pub trait Vault: Send + Sync {
    fn store(&self, secret: &CardSecret) -> Result<String>;
    fn reveal(&self, handle: &str) -> Result<CardSecret>;
}

/// Sled-backed vault for tests and single-node deployments. Handles are
/// sha256 content digests of the CBOR encoding.
pub struct SledVault {
    secrets: sled::Tree,
}

impl SledVault {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            secrets: db.open_tree("vault_secrets")?,
        })
    }
}

impl Vault for SledVault {
    fn store(&self, secret: &CardSecret) -> Result<String> {
        let cbor = minicbor::to_vec(secret)?;
        let handle = sha256::digest(&cbor);
        self.secrets
            .insert(handle.as_bytes(), cbor)
            .map_err(|e| EngineError::Vault(e.to_string()))?;
        Ok(handle)
    }

    fn reveal(&self, handle: &str) -> Result<CardSecret> {
        let raw = self
            .secrets
            .get(handle.as_bytes())
            .map_err(|e| EngineError::Vault(e.to_string()))?
            .ok_or_else(|| EngineError::not_found("vault secret", handle))?;
        Ok(minicbor::decode(&raw)?)
    }
}
