use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, error};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;

/// Length of the AES-GCM nonce prefixed to every ciphertext
const NONCE_LEN: usize = 12;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Failed to encrypt payload: {0}")]
    EncryptionError(String),

    #[error("Failed to decrypt payload: {0}")]
    DecryptionError(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Symmetric authenticated encryption for medical payloads
///
/// The AES-256-GCM key is the SHA-256 digest of the node secret, so secrets of
/// any length can be used. Ciphertexts are `base64(nonce || ciphertext || tag)`.
pub struct RecordCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for RecordCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordCipher").finish()
    }
}

impl RecordCipher {
    /// Creates a cipher keyed from the node secret
    pub fn from_secret(secret: &[u8]) -> Self {
        let key = Sha256::digest(secret);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));

        RecordCipher { cipher }
    }

    /// Encrypts structured data
    ///
    /// # Arguments
    ///
    /// * `data` - The payload to encrypt
    ///
    /// # Returns
    ///
    /// `Ok(None)` for a null payload, otherwise the base64 ciphertext
    pub fn encrypt(&self, data: &Value) -> Result<Option<String>, CryptoError> {
        if data.is_null() {
            return Ok(None);
        }

        let plaintext = serde_json::to_vec(data)
            .map_err(|e| CryptoError::EncodingError(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(Some(STANDARD.encode(sealed)))
    }

    /// Decrypts a payload for an authorized reader
    ///
    /// Returns `None` when the reader is not authorized, the ciphertext is
    /// missing or empty, or the payload cannot be decrypted or parsed.
    pub fn decrypt(&self, ciphertext: Option<&str>, authorized: bool) -> Option<Value> {
        let ciphertext = match ciphertext {
            Some(text) if authorized && !text.is_empty() => text,
            _ => return None,
        };

        match self.try_decrypt(ciphertext) {
            Ok(value) => Some(value),
            Err(err) => {
                error!("Failed to decrypt medical data: {}", err);
                None
            }
        }
    }

    fn try_decrypt(&self, ciphertext: &str) -> Result<Value, CryptoError> {
        let sealed = STANDARD
            .decode(ciphertext)
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::DecryptionError("Ciphertext too short".to_string()));
        }

        let (nonce_bytes, body) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;

        serde_json::from_slice(&plaintext).map_err(|e| CryptoError::DecodingError(e.to_string()))
    }
}

/// Verifies an RSA PKCS#1 v1.5 signature over the SHA-1 digest of a message
///
/// # Arguments
///
/// * `public_key_hex` - Hex-encoded DER public key (SubjectPublicKeyInfo or PKCS#1)
/// * `signature_hex` - Hex-encoded signature
/// * `message` - The canonical string that was signed
///
/// # Returns
///
/// true if the signature is valid; false for a bad signature or any malformed input
pub fn verify_signature(public_key_hex: &str, signature_hex: &str, message: &str) -> bool {
    match try_verify_signature(public_key_hex, signature_hex, message) {
        Ok(()) => true,
        Err(err) => {
            debug!("Signature verification failed: {}", err);
            false
        }
    }
}

fn try_verify_signature(
    public_key_hex: &str,
    signature_hex: &str,
    message: &str,
) -> Result<(), CryptoError> {
    let public_key = decode_public_key(public_key_hex)?;

    let signature = hex::decode(signature_hex)
        .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

    let digest = Sha1::digest(message.as_bytes());

    public_key
        .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &signature)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
}

fn decode_public_key(public_key_hex: &str) -> Result<RsaPublicKey, CryptoError> {
    let der = hex::decode(public_key_hex)
        .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

    RsaPublicKey::from_public_key_der(&der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}
