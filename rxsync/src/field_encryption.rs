//! Field-level encryption for sensitive record data
//!
//! Sensitive JSON fields (a prescription's patient name, for instance) are
//! encrypted with AES-256-GCM before they are written to the local store,
//! the pending queue or the remote collection. Key material is kept in a
//! [`KeyStore`], the platform secure-storage seam.
//!
//! Encrypted values are strings of the form
//! `ENC:v{key_version}:{nonce_b64}:{ciphertext_b64}`.
//!
//! # Usage
//!
//! ```no_run
//! use rxsync::field_encryption::{FieldEncryption, FieldEncryptionConfig, MemoryKeyStore};
//! use serde_json::json;
//!
//! # fn main() -> rxsync::SyncResult<()> {
//! let store = MemoryKeyStore::default();
//! let encryptor = FieldEncryption::from_key_store(FieldEncryptionConfig::default(), &store)?;
//!
//! let stored = encryptor.encrypt_fields(&json!({"patientName": "Jane Roe"}), &["patientName"])?;
//! let restored = encryptor.decrypt_fields(&stored, &["patientName"])?;
//! # Ok(())
//! # }
//! ```

use crate::error::{SyncError, SyncResult};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use moka::sync::Cache;
use parking_lot::Mutex;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretVec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use zeroize::Zeroizing;

const ENCRYPTED_PREFIX: &str = "ENC:";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Configuration for field-level encryption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldEncryptionConfig {
    /// Whether field-level encryption is enabled
    pub enabled: bool,

    /// Alias of the key in the key store
    pub key_alias: String,

    /// Maximum number of decrypted values kept in memory
    pub decrypt_cache_size: u64,

    /// Directory of the file key store
    pub key_dir: String,
}

impl Default for FieldEncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_alias: "rxsync.field-key".to_string(),
            decrypt_cache_size: 256,
            key_dir: ".rxsync/keys".to_string(),
        }
    }
}

/// Secure storage for key material
pub trait KeyStore: Send + Sync {
    fn load_key(&self, alias: &str) -> SyncResult<Option<SecretVec<u8>>>;

    fn store_key(&self, alias: &str, key: &[u8]) -> SyncResult<()>;

    fn delete_key(&self, alias: &str) -> SyncResult<()>;
}

/// Load the key under `alias`, generating and storing a fresh one on first use
pub fn get_or_create_key(store: &dyn KeyStore, alias: &str) -> SyncResult<SecretVec<u8>> {
    if let Some(key) = store.load_key(alias)? {
        return Ok(key);
    }

    let mut key = Zeroizing::new(vec![0u8; KEY_LEN]);
    OsRng.fill_bytes(key.as_mut_slice());
    store.store_key(alias, key.as_slice())?;

    tracing::info!(alias = alias, "Generated new field encryption key");

    Ok(SecretVec::new(key.to_vec()))
}

/// Key store backed by owner-only files, one per alias
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, alias: &str) -> PathBuf {
        self.dir.join(format!("{}.key", alias))
    }
}

impl KeyStore for FileKeyStore {
    fn load_key(&self, alias: &str) -> SyncResult<Option<SecretVec<u8>>> {
        let path = self.key_path(alias);
        if !path.exists() {
            return Ok(None);
        }

        let encoded = Zeroizing::new(
            std::fs::read_to_string(&path)
                .map_err(|e| SyncError::KeyStore(format!("Failed to read key file: {}", e)))?,
        );
        let key = BASE64
            .decode(encoded.trim())
            .map_err(|e| SyncError::KeyStore(format!("Corrupt key file: {}", e)))?;

        Ok(Some(SecretVec::new(key)))
    }

    fn store_key(&self, alias: &str, key: &[u8]) -> SyncResult<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| SyncError::KeyStore(format!("Failed to create key directory: {}", e)))?;

        let path = self.key_path(alias);
        let encoded = Zeroizing::new(BASE64.encode(key));
        std::fs::write(&path, encoded.as_bytes())
            .map_err(|e| SyncError::KeyStore(format!("Failed to write key file: {}", e)))?;

        // Owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, perms)
                .map_err(|e| SyncError::KeyStore(format!("Failed to set permissions: {}", e)))?;
        }

        Ok(())
    }

    fn delete_key(&self, alias: &str) -> SyncResult<()> {
        let path = self.key_path(alias);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| SyncError::KeyStore(format!("Failed to delete key file: {}", e)))?;
        }
        Ok(())
    }
}

/// Process-local key store
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl KeyStore for MemoryKeyStore {
    fn load_key(&self, alias: &str) -> SyncResult<Option<SecretVec<u8>>> {
        Ok(self.keys.lock().get(alias).map(|key| SecretVec::new(key.to_vec())))
    }

    fn store_key(&self, alias: &str, key: &[u8]) -> SyncResult<()> {
        self.keys.lock().insert(alias.to_string(), Zeroizing::new(key.to_vec()));
        Ok(())
    }

    fn delete_key(&self, alias: &str) -> SyncResult<()> {
        self.keys.lock().remove(alias);
        Ok(())
    }
}

/// Field-level encryption handler
pub struct FieldEncryption {
    config: FieldEncryptionConfig,
    cipher: Option<Aes256Gcm>,
    key_version: u32,
    decrypt_cache: Cache<String, Value>,
}

impl FieldEncryption {
    /// Create a handler from raw key bytes
    pub fn new(config: FieldEncryptionConfig, key: &[u8]) -> SyncResult<Self> {
        if key.len() != KEY_LEN {
            return Err(SyncError::Encryption(format!(
                "Invalid key length: expected {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| SyncError::Encryption(format!("Failed to initialize AES-GCM: {}", e)))?;

        Ok(Self {
            decrypt_cache: Cache::new(config.decrypt_cache_size),
            config,
            cipher: Some(cipher),
            key_version: 1,
        })
    }

    /// Create a handler whose key lives in `store`
    pub fn from_key_store(config: FieldEncryptionConfig, store: &dyn KeyStore) -> SyncResult<Self> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        let key = get_or_create_key(store, &config.key_alias)?;
        Self::new(config, key.expose_secret())
    }

    /// Pass-through handler
    pub fn disabled() -> Self {
        let config = FieldEncryptionConfig {
            enabled: false,
            ..Default::default()
        };
        Self {
            decrypt_cache: Cache::new(config.decrypt_cache_size),
            config,
            cipher: None,
            key_version: 1,
        }
    }

    pub fn with_key_version(mut self, version: u32) -> Self {
        self.key_version = version;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.cipher.is_some()
    }

    /// Encrypt every field named in `fields`, at any depth.
    ///
    /// Named fields are always encrypted, whatever their plaintext looks like.
    pub fn encrypt_fields(&self, data: &Value, fields: &[&str]) -> SyncResult<Value> {
        if !self.is_enabled() || fields.is_empty() {
            return Ok(data.clone());
        }
        self.walk(data, fields, &|val| self.encrypt_field(val))
    }

    /// Decrypt every field named in `fields`, at any depth.
    ///
    /// Other fields are never touched. A named field holding a string without
    /// the `ENC:` prefix is a legacy plaintext row and is returned as is.
    pub fn decrypt_fields(&self, data: &Value, fields: &[&str]) -> SyncResult<Value> {
        if !self.is_enabled() || fields.is_empty() {
            return Ok(data.clone());
        }
        self.walk(data, fields, &|val| match val {
            Value::String(s) if s.starts_with(ENCRYPTED_PREFIX) => self.decrypt_field(s),
            _ => Ok(val.clone()),
        })
    }

    fn walk(
        &self,
        value: &Value,
        fields: &[&str],
        apply: &dyn Fn(&Value) -> SyncResult<Value>,
    ) -> SyncResult<Value> {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, val) in map {
                    let mapped = if fields.contains(&key.as_str()) {
                        apply(val)?
                    } else {
                        self.walk(val, fields, apply)?
                    };
                    out.insert(key.clone(), mapped);
                }
                Ok(Value::Object(out))
            }
            Value::Array(arr) => Ok(Value::Array(
                arr.iter()
                    .map(|v| self.walk(v, fields, apply))
                    .collect::<SyncResult<Vec<_>>>()?,
            )),
            _ => Ok(value.clone()),
        }
    }

    fn encrypt_field(&self, value: &Value) -> SyncResult<Value> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| SyncError::Encryption("Field encryption key not loaded".to_string()))?;

        let plaintext = Zeroizing::new(serde_json::to_string(value)?);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SyncError::Encryption("Failed to encrypt field".to_string()))?;

        Ok(Value::String(format!(
            "{}v{}:{}:{}",
            ENCRYPTED_PREFIX,
            self.key_version,
            BASE64.encode(nonce_bytes),
            BASE64.encode(ciphertext)
        )))
    }

    fn decrypt_field(&self, encoded: &str) -> SyncResult<Value> {
        if let Some(cached) = self.decrypt_cache.get(encoded) {
            return Ok(cached);
        }

        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| SyncError::Encryption("Field encryption key not loaded".to_string()))?;

        let body = encoded
            .strip_prefix(ENCRYPTED_PREFIX)
            .ok_or_else(|| SyncError::Encryption("Invalid encrypted field format".to_string()))?;

        let mut parts = body.splitn(3, ':');
        let (Some(version), Some(nonce_b64), Some(ciphertext_b64)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(SyncError::Encryption("Invalid encrypted field format".to_string()));
        };

        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| SyncError::Encryption("Invalid key version".to_string()))?;
        if version != self.key_version {
            return Err(SyncError::Encryption(format!(
                "Unsupported key version {} (current {})",
                version, self.key_version
            )));
        }

        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|e| SyncError::Encryption(format!("Failed to decode nonce: {}", e)))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(SyncError::Encryption("Invalid nonce length".to_string()));
        }
        let ciphertext = BASE64
            .decode(ciphertext_b64)
            .map_err(|e| SyncError::Encryption(format!("Failed to decode ciphertext: {}", e)))?;

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
                .map_err(|_| SyncError::Encryption("Failed to decrypt field".to_string()))?,
        );

        let value: Value = serde_json::from_slice(&plaintext).map_err(|e| {
            SyncError::Deserialization(format!("Failed to parse decrypted JSON: {}", e))
        })?;

        self.decrypt_cache.insert(encoded.to_string(), value.clone());
        Ok(value)
    }

    /// Drop all cached plaintexts
    pub fn clear_cache(&self) {
        self.decrypt_cache.invalidate_all();
    }

    pub fn cached_entries(&self) -> u64 {
        self.decrypt_cache.run_pending_tasks();
        self.decrypt_cache.entry_count()
    }
}
