//! Symmetric authenticated encryption of HMAC secrets at rest.
//!
//! Ciphertext framing is `iv:tag:cipher`, each segment hex-encoded. The
//! process-level 32-byte key is loaded once at startup; rotating it requires
//! an offline re-encryption pass.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SEPARATOR: char = ':';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    /// Tag mismatch or malformed framing. Deliberately carries no detail.
    #[error("DECRYPT_ERROR")]
    Decrypt,
    #[error("encryption failure")]
    Encrypt,
}

#[derive(Clone)]
pub struct SecretVault {
    key: Key<Aes256Gcm>,
}

impl SecretVault {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key: Key::<Aes256Gcm>::from(key),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let cipher = Aes256Gcm::new(&self.key);
        let mut iv = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let mut sealed = cipher
            .encrypt(nonce, Payload::from(plaintext))
            .map_err(|_| VaultError::Encrypt)?;
        // AES-GCM appends the tag to the ciphertext; the frame keeps it as its
        // own segment.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(sealed)
        ))
    }

    pub fn decrypt(&self, framed: &str) -> Result<Vec<u8>, VaultError> {
        let mut parts = framed.split(SEPARATOR);
        let (Some(iv_hex), Some(tag_hex), Some(cipher_hex), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(VaultError::Decrypt);
        };

        let iv = hex::decode(iv_hex).map_err(|_| VaultError::Decrypt)?;
        let tag = hex::decode(tag_hex).map_err(|_| VaultError::Decrypt)?;
        let mut sealed = hex::decode(cipher_hex).map_err(|_| VaultError::Decrypt)?;
        if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(VaultError::Decrypt);
        }
        sealed.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new(&self.key);
        cipher
            .decrypt(Nonce::from_slice(&iv), Payload::from(sealed.as_slice()))
            .map_err(|_| VaultError::Decrypt)
    }
}
