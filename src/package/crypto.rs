// Passphrase-derived package encryption.
//
// Key derivation is Argon2id over the operator-supplied passphrase; the
// derivation parameters (including the salt) live in the unencrypted
// manifest so a restore can re-derive the key. Payload entries are
// encrypted with AES-256-GCM, nonce prepended to the ciphertext.

use crate::error::{EngineError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

const NONCE_LEN: usize = 12;

/// Argon2id parameters stored in the package manifest.
///
/// The manifest holds metadata only, so publishing the salt is fine; the
/// passphrase never leaves the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KdfParams {
    pub salt: [u8; 16],
    /// Memory cost in KiB
    pub mem_cost: u32,
    /// Iteration count
    pub time_cost: u32,
    /// Lane count
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            salt: rand::random(),
            mem_cost: 65_536, // 64 MB
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Derived package key; zeroed on drop.
pub struct PackageKey {
    key: [u8; 32],
}

impl Drop for PackageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Derive the package key from a passphrase and stored parameters.
pub fn derive_key(passphrase: &str, params: &KdfParams) -> Result<PackageKey> {
    let argon_params = Params::new(
        params.mem_cost,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| EngineError::Crypto(format!("invalid KDF parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), &params.salt, &mut key)
        .map_err(|e| EngineError::Crypto(format!("key derivation failed: {}", e)))?;

    Ok(PackageKey { key })
}

/// Encrypt one payload entry. Output layout: 12-byte nonce, then the
/// GCM ciphertext with its authentication tag.
pub fn encrypt(key: &PackageKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new((&key.key).into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| EngineError::Crypto(format!("encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt one payload entry produced by [`encrypt`]. Fails if the
/// authentication tag does not verify (wrong passphrase or tampering).
pub fn decrypt(key: &PackageKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(EngineError::Crypto(
            "ciphertext too short to carry a nonce".to_string(),
        ));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new((&key.key).into());
    cipher.decrypt(nonce, ciphertext).map_err(|_| {
        EngineError::Crypto("decryption failed: wrong passphrase or corrupted payload".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let params = KdfParams::new();
        let k1 = derive_key("correct horse", &params).unwrap();
        let k2 = derive_key("correct horse", &params).unwrap();
        assert_eq!(k1.key, k2.key);

        let k3 = derive_key("wrong horse", &params).unwrap();
        assert_ne!(k1.key, k3.key);
    }

    #[test]
    fn test_different_salt_different_key() {
        let a = KdfParams::new();
        let b = KdfParams::new();
        assert_ne!(a.salt, b.salt);

        let ka = derive_key("passphrase", &a).unwrap();
        let kb = derive_key("passphrase", &b).unwrap();
        assert_ne!(ka.key, kb.key);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = derive_key("s3cret", &KdfParams::new()).unwrap();
        let payload = b"{\"records\": []}";

        let encrypted = encrypt(&key, payload).unwrap();
        assert_ne!(encrypted.as_slice(), payload.as_slice());

        let decrypted = decrypt(&key, &encrypted).unwrap();
        assert_eq!(decrypted.as_slice(), payload.as_slice());
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let params = KdfParams::new();
        let key = derive_key("right", &params).unwrap();
        let wrong = derive_key("wrong", &params).unwrap();

        let encrypted = encrypt(&key, b"data").unwrap();
        assert!(decrypt(&wrong, &encrypted).is_err());
    }

    #[test]
    fn test_tampering_detected() {
        let key = derive_key("s3cret", &KdfParams::new()).unwrap();
        let mut encrypted = encrypt(&key, b"payload bytes").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xFF;
        assert!(decrypt(&key, &encrypted).is_err());
    }

    #[test]
    fn test_truncated_input_rejected() {
        let key = derive_key("s3cret", &KdfParams::new()).unwrap();
        assert!(decrypt(&key, &[0u8; 4]).is_err());
    }
}
