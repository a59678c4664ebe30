//! At-rest sealing for session records
//!
//! Session records hold the entity map, which is the only thing that can
//! reverse a token. File-backed stores can seal each record with
//! AES-256-GCM; the envelope carries a key id so keys can be rotated
//! without rewriting old records.

use crate::error::{InsightError, Result};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, AeadCore, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Sealed record envelope as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedRecord {
    pub key_id: String,
    /// Base64 96-bit nonce
    pub nonce: String,
    /// Base64 ciphertext
    pub ciphertext: String,
    #[serde(default = "default_sealed")]
    pub sealed: bool,
}

fn default_sealed() -> bool {
    true
}

impl SealedRecord {
    /// Check whether a JSON document is a sealed envelope
    pub fn is_sealed(value: &serde_json::Value) -> bool {
        value
            .get("sealed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Seals and unseals JSON documents
pub trait RecordSealer: Send + Sync {
    fn seal(&self, record: &serde_json::Value) -> Result<serde_json::Value>;

    fn unseal(&self, sealed: &serde_json::Value) -> Result<serde_json::Value>;

    fn active_key_id(&self) -> &str;
}

/// AES-256-GCM sealer with key rotation
///
/// Seals with the active key, unseals with any registered key.
pub struct Aes256GcmSealer {
    active_key_id: String,
    keys: RwLock<HashMap<String, Aes256Gcm>>,
}

impl Aes256GcmSealer {
    pub fn new(key_id: impl Into<String>, key: &[u8; 32]) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), cipher_for(key));

        Self {
            active_key_id: key_id,
            keys: RwLock::new(keys),
        }
    }

    /// Build a sealer from a base64-encoded 32-byte key
    pub fn from_base64(key_id: impl Into<String>, encoded: &str) -> Result<Self> {
        let key = decode_key(encoded)?;
        Ok(Self::new(key_id, &key))
    }

    /// Build a sealer from a base64 key stored in an environment variable
    pub fn from_env(key_id: impl Into<String>, var: &str) -> Result<Self> {
        let encoded = std::env::var(var)
            .map_err(|_| InsightError::Config(format!("Sealing key variable '{}' is not set", var)))?;
        Self::from_base64(key_id, encoded.trim())
    }

    /// Register an additional key for unsealing older records
    pub fn add_key(&self, key_id: impl Into<String>, key: &[u8; 32]) -> Result<()> {
        let mut keys = self
            .keys
            .write()
            .map_err(|e| InsightError::Crypto(format!("Failed to acquire key lock: {}", e)))?;
        keys.insert(key_id.into(), cipher_for(key));
        Ok(())
    }

    /// Switch the sealing key; the key must already be registered
    pub fn rotate_to(&mut self, key_id: &str) -> Result<()> {
        let keys = self
            .keys
            .read()
            .map_err(|e| InsightError::Crypto(format!("Failed to acquire key lock: {}", e)))?;
        if !keys.contains_key(key_id) {
            return Err(InsightError::Crypto(format!(
                "Key '{}' not registered, add it first",
                key_id
            )));
        }
        drop(keys);
        self.active_key_id = key_id.to_string();
        Ok(())
    }
}

fn cipher_for(key: &[u8; 32]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| InsightError::Config(format!("Invalid sealing key encoding: {}", e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        InsightError::Config(format!("Sealing key must be 32 bytes, got {}", b.len()))
    })
}

impl RecordSealer for Aes256GcmSealer {
    fn seal(&self, record: &serde_json::Value) -> Result<serde_json::Value> {
        let plaintext = serde_json::to_vec(record)?;

        let keys = self
            .keys
            .read()
            .map_err(|e| InsightError::Crypto(format!("Failed to acquire key lock: {}", e)))?;
        let cipher = keys.get(&self.active_key_id).ok_or_else(|| {
            InsightError::Crypto(format!("Active key '{}' not found", self.active_key_id))
        })?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| InsightError::Crypto(format!("Sealing failed: {}", e)))?;

        let envelope = SealedRecord {
            key_id: self.active_key_id.clone(),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
            sealed: true,
        };
        serde_json::to_value(envelope).map_err(Into::into)
    }

    fn unseal(&self, sealed: &serde_json::Value) -> Result<serde_json::Value> {
        let envelope: SealedRecord = serde_json::from_value(sealed.clone())?;

        let keys = self
            .keys
            .read()
            .map_err(|e| InsightError::Crypto(format!("Failed to acquire key lock: {}", e)))?;
        let cipher = keys.get(&envelope.key_id).ok_or_else(|| {
            InsightError::Crypto(format!("Unsealing key '{}' not registered", envelope.key_id))
        })?;

        let nonce_bytes = BASE64
            .decode(&envelope.nonce)
            .map_err(|e| InsightError::Crypto(format!("Invalid nonce encoding: {}", e)))?;
        if nonce_bytes.len() != 12 {
            return Err(InsightError::Crypto(format!(
                "Invalid nonce length: {}",
                nonce_bytes.len()
            )));
        }
        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| InsightError::Crypto(format!("Invalid ciphertext encoding: {}", e)))?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| InsightError::Crypto(format!("Unsealing failed: {}", e)))?;

        serde_json::from_slice(&plaintext).map_err(Into::into)
    }

    fn active_key_id(&self) -> &str {
        &self.active_key_id
    }
}
