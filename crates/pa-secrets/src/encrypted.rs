//! Encrypted file secret store using AES-256-GCM
//!
//! All histories live in one file, `secrets.enc`, laid out as a 12-byte nonce
//! followed by the ciphertext of the JSON-encoded map. Writes go to a temp
//! file which is then renamed over the original.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use crate::memory::SecretHistory;
use crate::{SecretStore, SecretsError, StoredVersion};

const NONCE_LEN: usize = 12;

pub struct EncryptedFileStore {
    cipher: Aes256Gcm,
    data_dir: PathBuf,
    histories: RwLock<HashMap<String, SecretHistory>>,
}

impl EncryptedFileStore {
    /// Open (or create) the store in `data_dir`, decrypting existing contents
    pub async fn open(encryption_key: &str, data_dir: &Path) -> Result<Self, SecretsError> {
        let key_bytes = BASE64.decode(encryption_key)
            .map_err(|e| SecretsError::InvalidKey(format!("Invalid base64 key: {}", e)))?;

        if key_bytes.len() != 32 {
            return Err(SecretsError::InvalidKey(format!("Key must be 32 bytes, got {}", key_bytes.len())));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| SecretsError::EncryptionError(e.to_string()))?;

        tokio::fs::create_dir_all(data_dir).await?;

        let store = Self {
            cipher,
            data_dir: data_dir.to_path_buf(),
            histories: RwLock::new(HashMap::new()),
        };
        store.load().await?;
        Ok(store)
    }

    fn secrets_file(&self) -> PathBuf {
        self.data_dir.join("secrets.enc")
    }

    async fn load(&self) -> Result<(), SecretsError> {
        let path = self.secrets_file();
        if !tokio::fs::try_exists(&path).await? {
            return Ok(());
        }

        let encrypted = tokio::fs::read(&path).await?;
        if encrypted.len() < NONCE_LEN {
            return Err(SecretsError::EncryptionError("Secrets file is truncated".to_string()));
        }

        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_LEN);
        let plaintext = self.cipher.decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| SecretsError::EncryptionError(e.to_string()))?;

        let loaded: HashMap<String, SecretHistory> = serde_json::from_slice(&plaintext)?;
        let mut histories = self.histories.write().await;
        *histories = loaded;
        debug!(count = histories.len(), "Loaded secret histories from encrypted file");
        Ok(())
    }

    async fn save(&self, histories: &HashMap<String, SecretHistory>) -> Result<(), SecretsError> {
        let plaintext = serde_json::to_vec(histories)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self.cipher.encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|e| SecretsError::EncryptionError(e.to_string()))?;

        let mut output = nonce_bytes.to_vec();
        output.extend(ciphertext);

        let path = self.secrets_file();
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &output).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!("Saved secret histories to encrypted file");
        Ok(())
    }
}

#[async_trait]
impl SecretStore for EncryptedFileStore {
    async fn put_version(&self, secret_id: &str, value: &str) -> Result<StoredVersion, SecretsError> {
        // Held across the save so file order matches version order
        let mut histories = self.histories.write().await;
        let mut updated = histories.get(secret_id).cloned().unwrap_or_default();
        let stored = updated.append(value);

        let mut next = histories.clone();
        next.insert(secret_id.to_string(), updated.clone());
        self.save(&next).await?;

        histories.insert(secret_id.to_string(), updated);
        Ok(stored)
    }

    async fn get_version(&self, secret_id: &str, version: Option<&str>) -> Result<StoredVersion, SecretsError> {
        let histories = self.histories.read().await;
        histories
            .get(secret_id)
            .and_then(|history| history.lookup(version))
            .cloned()
            .ok_or_else(|| SecretsError::not_found(secret_id, version))
    }

    fn name(&self) -> &str {
        "encrypted"
    }
}

/// Generate a new base64 encryption key
pub fn generate_key() -> String {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    BASE64.encode(key)
}
