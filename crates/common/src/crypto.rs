//! Encryption of endpoint secrets at rest.
//!
//! Secrets are sealed with AES-256-GCM under a per-organization key derived
//! from the master key, so a ciphertext copied into another tenant's row
//! does not decrypt.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::AppError;

/// Nonce size for AES-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// Encrypts and decrypts endpoint secrets with an organization's key material.
pub trait KeyManager: Send + Sync {
    /// Seal `plaintext` for storage. Output is opaque text.
    fn encrypt(&self, org_id: Uuid, plaintext: &str) -> Result<String, AppError>;

    /// Recover a secret previously sealed for the same organization.
    fn decrypt(&self, org_id: Uuid, ciphertext: &str) -> Result<String, AppError>;
}

/// AES-256-GCM key manager with HMAC-SHA256 per-organization key derivation.
///
/// Stored format: base64(nonce || ciphertext || tag).
pub struct AesKeyManager {
    master_key: [u8; 32],
}

impl AesKeyManager {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self { master_key }
    }

    fn cipher_for(&self, org_id: Uuid) -> Result<Aes256Gcm, AppError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.master_key)
            .map_err(|e| AppError::Crypto(e.to_string()))?;
        mac.update(b"keel-webhook-secret:");
        mac.update(org_id.as_bytes());
        let org_key = mac.finalize().into_bytes();

        Aes256Gcm::new_from_slice(&org_key).map_err(|e| AppError::Crypto(e.to_string()))
    }
}

impl KeyManager for AesKeyManager {
    fn encrypt(&self, org_id: Uuid, plaintext: &str) -> Result<String, AppError> {
        let cipher = self.cipher_for(org_id)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| AppError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(&sealed))
    }

    fn decrypt(&self, org_id: Uuid, ciphertext: &str) -> Result<String, AppError> {
        let sealed = BASE64
            .decode(ciphertext)
            .map_err(|e| AppError::Crypto(format!("Base64 decode failed: {}", e)))?;

        if sealed.len() < NONCE_SIZE + 1 {
            return Err(AppError::Crypto(
                "Invalid encrypted data format".to_string(),
            ));
        }

        let cipher = self.cipher_for(org_id)?;
        let (nonce, body) = sealed.split_at(NONCE_SIZE);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|e| AppError::Crypto(format!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext).map_err(|e| AppError::Crypto(e.to_string()))
    }
}
