//! Provider API-key at-rest encryption, grounded on the teacher's
//! `engine/skills/crypto.rs` skill-vault: AES-256-GCM with a random key
//! held in the OS keychain, fresh 12-byte nonce per encryption. Storage
//! format: base64(nonce || ciphertext+tag). Unlike the teacher's vault
//! this crate has no legacy XOR-encrypted rows to migrate, so the
//! decrypt path is AES-GCM only.

use crate::error::{EngineError, EngineResult};
use crate::external::ProviderKeyResolver;
use crate::store::sqlite::EngineStore;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use base64::Engine as _;
use log::info;
use std::sync::Arc;
use zeroize::Zeroizing;

const VAULT_KEYRING_SERVICE: &str = "clearance-engine-vault";
const VAULT_KEYRING_USER: &str = "encryption-key";

/// Get or create the vault encryption key from the OS keychain.
pub fn get_vault_key() -> EngineResult<Zeroizing<Vec<u8>>> {
    let entry = keyring::Entry::new(VAULT_KEYRING_SERVICE, VAULT_KEYRING_USER)
        .map_err(|e| EngineError::Security(format!("keyring init failed: {e}")))?;

    match entry.get_password() {
        Ok(key_b64) => {
            let raw = base64::engine::general_purpose::STANDARD
                .decode(&key_b64)
                .map_err(|e| EngineError::Security(format!("corrupt vault key: {e}")))?;
            Ok(Zeroizing::new(raw))
        }
        Err(keyring::Error::NoEntry) => {
            use rand::Rng;
            let mut key = vec![0u8; 32];
            rand::thread_rng().fill(&mut key[..]);
            let key_b64 = base64::engine::general_purpose::STANDARD.encode(&key);
            entry
                .set_password(&key_b64)
                .map_err(|e| EngineError::Security(format!("failed to store vault key: {e}")))?;
            info!("[vault] created new provider-key vault encryption key in OS keychain");
            Ok(Zeroizing::new(key))
        }
        Err(e) => Err(EngineError::Security(format!("keyring error: {e}"))),
    }
}

pub fn encrypt_credential(plaintext: &str, key: &[u8]) -> EngineResult<String> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EngineError::Security("invalid vault key length".into()))?;
    let mut nonce_bytes = [0u8; 12];
    use rand::Rng;
    rand::thread_rng().fill(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| EngineError::Security("encryption failed".into()))?;
    let mut packed = Vec::with_capacity(12 + ciphertext.len());
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);
    Ok(base64::engine::general_purpose::STANDARD.encode(&packed))
}

pub fn decrypt_credential(encoded: &str, key: &[u8]) -> EngineResult<Zeroizing<String>> {
    let packed = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| EngineError::Security(format!("corrupt credential: {e}")))?;
    if packed.len() < 12 + 16 {
        return Err(EngineError::Security("ciphertext too short".into()));
    }
    let (nonce_bytes, ciphertext) = packed.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EngineError::Security("invalid vault key length".into()))?;
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EngineError::Security("decryption failed — wrong key or corrupted data".into()))?;
    String::from_utf8(plaintext)
        .map(Zeroizing::new)
        .map_err(|e| EngineError::Security(format!("decrypted credential is not valid UTF-8: {e}")))
}

/// The concrete [`ProviderKeyResolver`] backing the transcription
/// orchestrator's §4.6 step 1, reading the encrypted key from
/// [`EngineStore`]'s `provider_keys` table and decrypting it with the
/// keychain-held vault key.
pub struct VaultKeyResolver {
    store: Arc<EngineStore>,
}

impl VaultKeyResolver {
    pub fn new(store: Arc<EngineStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProviderKeyResolver for VaultKeyResolver {
    async fn resolve_key(&self, model_id: &str) -> EngineResult<Zeroizing<String>> {
        let encrypted = self
            .store
            .get_encrypted_provider_key(model_id)
            .await?
            .ok_or_else(|| EngineError::Validation(format!("no provider key stored for model {model_id}")))?;
        let key = get_vault_key()?;
        decrypt_credential(&encrypted, &key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = vec![0xABu8; 32];
        let plaintext = "sk-live-abc123";
        let encrypted = encrypt_credential(plaintext, &key).unwrap();
        let decrypted = decrypt_credential(&encrypted, &key).unwrap();
        assert_eq!(&*decrypted, plaintext);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let key1 = vec![0xABu8; 32];
        let key2 = vec![0xCDu8; 32];
        let encrypted = encrypt_credential("secret", &key1).unwrap();
        assert!(decrypt_credential(&encrypted, &key2).is_err());
    }

    #[test]
    fn truncated_ciphertext_errors() {
        let key = vec![0x42u8; 32];
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 4]);
        assert!(decrypt_credential(&short, &key).is_err());
    }
}
