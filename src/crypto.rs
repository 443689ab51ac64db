//! Cryptographic building blocks for the wallet migration.
//!
//! This module provides small, composable primitives which the record codec
//! and the store layer wire together. All of them sit on the compatibility
//! boundary with the legacy wallet format: outputs must be byte-exact with
//! what the Indy SDK produced, so parameters here are not tunable policy.
//!
//! - AEAD: ChaCha20-Poly1305 (IETF, 12-byte nonce, 16-byte tag, no AAD).
//!   Ciphertexts are stored "merged" as `nonce || ciphertext || tag`.
//! - Nonces: either fresh random bytes, or the leading 12 bytes of
//!   `HMAC-SHA256(hmac_key, message)` when a deterministic, searchable
//!   ciphertext is required (categories, names, tag names).
//! - KDF: Argon2i v1.3 with libsodium's moderate limits derives the wallet
//!   master key from the operator passphrase.

use argon2::{Algorithm, Argon2, Params as Argon2Params, Version};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

/// Size (bytes) of every symmetric key in both key hierarchies.
pub const KEY_LEN: usize = 32;
/// Size (bytes) of the ChaCha20-Poly1305 IETF nonce.
pub const NONCE_LEN: usize = 12;
/// Size (bytes) of the Poly1305 authentication tag.
pub const TAG_LEN: usize = 16;
/// Size (bytes) of the portion of the master key salt consumed by the KDF.
pub const SALT_LEN: usize = 16;

/// Argon2i parameters matching libsodium's `OPSLIMIT_MODERATE` /
/// `MEMLIMIT_MODERATE` named constants. Keys derived on the legacy system
/// must verify here, so these are fixed: t=3, m=256 MiB, p=1.
const ARGON2_ITERATIONS: u32 = 3;
const ARGON2_MEMORY_KIB: u32 = 256 * 1024;
const ARGON2_PARALLELISM: u32 = 1;

type HmacSha256 = Hmac<Sha256>;

/// A derived 32-byte master key, zeroised on drop.
pub type MasterKey = Zeroizing<[u8; KEY_LEN]>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length {0}, expected {KEY_LEN}")]
    InvalidKeyLength(usize),

    #[error("master key salt shorter than {SALT_LEN} bytes")]
    InvalidSaltLength,

    #[error("ciphertext too short")]
    TruncatedCiphertext,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("invalid base64 encoding")]
    Base64(#[from] base64::DecodeError),

    #[error("argon2 failure")]
    Argon2(#[from] argon2::Error),
}

/// Generate `N` cryptographically-secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// HMAC-SHA256 over a sequence of byte chunks.
fn hmac_sha256(key: &[u8], chunks: &[&[u8]]) -> Result<[u8; 32], CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    for chunk in chunks {
        mac.update(chunk);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Encrypt `message` under `key`, returning `nonce || ciphertext || tag`.
///
/// With `hmac_key` the nonce is the leading 12 bytes of
/// `HMAC-SHA256(hmac_key, message)`: the same plaintext always produces the
/// same ciphertext, which is what makes encrypted categories and names
/// equality-searchable. Without it the nonce is fresh random bytes.
pub fn encrypt_merged(
    message: &[u8],
    key: &[u8],
    hmac_key: Option<&[u8]>,
) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }

    let nonce: [u8; NONCE_LEN] = match hmac_key {
        Some(hmac_key) => {
            let digest = hmac_sha256(hmac_key, &[message])?;
            digest[..NONCE_LEN].try_into().expect("digest is 32 bytes")
        }
        None => random_bytes::<NONCE_LEN>(),
    };

    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), message)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a merged `nonce || ciphertext || tag` blob.
///
/// With `b64` the blob is first decoded from Base64 (standard alphabet,
/// padding required), which is how the network store wraps binary fields.
/// Authentication-tag mismatch fails with [`CryptoError::DecryptionFailed`].
pub fn decrypt_merged(blob: &[u8], key: &[u8], b64: bool) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }

    let decoded;
    let blob = if b64 {
        decoded = BASE64.decode(blob)?;
        decoded.as_slice()
    } else {
        blob
    };

    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::TruncatedCiphertext);
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Derive the per-value encryption key for an item.
///
/// The key is `HMAC-SHA256(hmac_key, len32be(category) || category ||
/// len32be(name) || name)`: deterministic in the item coordinates, so the
/// value can be re-encrypted without storing a wrapped key per row.
pub fn derive_value_key(
    category: &[u8],
    name: &[u8],
    hmac_key: &[u8],
) -> Result<[u8; KEY_LEN], CryptoError> {
    hmac_sha256(
        hmac_key,
        &[
            &(category.len() as u32).to_be_bytes(),
            category,
            &(name.len() as u32).to_be_bytes(),
            name,
        ],
    )
}

/// Encrypt an item value under its derived per-value key (random nonce).
pub fn encrypt_value(
    category: &[u8],
    name: &[u8],
    value: &[u8],
    hmac_key: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let value_key = Zeroizing::new(derive_value_key(category, name, hmac_key)?);
    encrypt_merged(value, value_key.as_ref(), None)
}

/// Decrypt an item value encrypted with [`encrypt_value`].
pub fn decrypt_value(
    category: &[u8],
    name: &[u8],
    blob: &[u8],
    hmac_key: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let value_key = Zeroizing::new(derive_value_key(category, name, hmac_key)?);
    decrypt_merged(blob, value_key.as_ref(), false)
}

/// Derive the 32-byte wallet master key from the operator passphrase.
///
/// Only the leading 16 bytes of `salt` participate; legacy databases are
/// permitted to store a longer value.
pub fn derive_master_key(passphrase: &[u8], salt: &[u8]) -> Result<MasterKey, CryptoError> {
    if salt.len() < SALT_LEN {
        return Err(CryptoError::InvalidSaltLength);
    }

    let params = Argon2Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(KEY_LEN),
    )?;
    let argon2 = Argon2::new(Algorithm::Argon2i, Version::V0x13, params);

    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    argon2.hash_password_into(passphrase, &salt[..SALT_LEN], out.as_mut())?;
    Ok(out)
}

/// Convenience wrapper for [`derive_master_key`] using a `SecretString`.
pub fn derive_master_key_from_passphrase(
    passphrase: &SecretString,
    salt: &[u8],
) -> Result<MasterKey, CryptoError> {
    derive_master_key(passphrase.expose_secret().as_bytes(), salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_roundtrip_random_nonce() {
        let key = random_bytes::<KEY_LEN>();
        let message = b"a record value";

        let blob = encrypt_merged(message, &key, None).unwrap();
        assert_eq!(blob.len(), NONCE_LEN + message.len() + TAG_LEN);

        let plaintext = decrypt_merged(&blob, &key, false).unwrap();
        assert_eq!(plaintext, message);
    }

    #[test]
    fn hmac_nonce_is_deterministic() {
        let key = random_bytes::<KEY_LEN>();
        let hmac_key = random_bytes::<KEY_LEN>();
        let message = b"category-bytes";

        let a = encrypt_merged(message, &key, Some(&hmac_key)).unwrap();
        let b = encrypt_merged(message, &key, Some(&hmac_key)).unwrap();
        assert_eq!(a, b);

        // Without an HMAC key only the nonce prefix may differ between runs.
        let c = encrypt_merged(message, &key, None).unwrap();
        let d = encrypt_merged(message, &key, None).unwrap();
        assert_ne!(c[..NONCE_LEN], d[..NONCE_LEN]);
        assert_eq!(c.len(), d.len());
    }

    #[test]
    fn decrypt_fails_on_tamper() {
        let key = random_bytes::<KEY_LEN>();
        let mut blob = encrypt_merged(b"payload", &key, None).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;

        let err = decrypt_merged(&blob, &key, false).unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailed));
    }

    #[test]
    fn decrypt_rejects_short_blob() {
        let key = random_bytes::<KEY_LEN>();
        let err = decrypt_merged(&[0u8; NONCE_LEN], &key, false).unwrap_err();
        assert!(matches!(err, CryptoError::TruncatedCiphertext));
    }

    #[test]
    fn decrypt_applies_base64_first() {
        let key = random_bytes::<KEY_LEN>();
        let blob = encrypt_merged(b"wrapped", &key, None).unwrap();
        let wrapped = BASE64.encode(&blob);

        let plaintext = decrypt_merged(wrapped.as_bytes(), &key, true).unwrap();
        assert_eq!(plaintext, b"wrapped");
    }

    #[test]
    fn rejects_wrong_key_length() {
        let err = encrypt_merged(b"m", &[0u8; 31], None).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyLength(31)));
    }

    #[test]
    fn value_key_binds_category_and_name() {
        let hmac_key = random_bytes::<KEY_LEN>();

        let blob = encrypt_value(b"cat", b"name", b"value", &hmac_key).unwrap();
        let plaintext = decrypt_value(b"cat", b"name", &blob, &hmac_key).unwrap();
        assert_eq!(plaintext, b"value");

        let err = decrypt_value(b"cat", b"other", &blob, &hmac_key).unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailed));
    }

    #[test]
    fn master_key_uses_leading_salt_bytes_only() {
        let mut salt = [7u8; 24];
        let short = derive_master_key(b"passphrase", &salt[..SALT_LEN]).unwrap();
        let long = derive_master_key(b"passphrase", &salt).unwrap();
        assert_eq!(short.as_ref(), long.as_ref());

        salt[SALT_LEN - 1] ^= 0xff;
        let other = derive_master_key(b"passphrase", &salt).unwrap();
        assert_ne!(short.as_ref(), other.as_ref());
    }

    #[test]
    fn master_key_rejects_short_salt() {
        let err = derive_master_key(b"pw", &[0u8; 8]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidSaltLength));
    }
}
