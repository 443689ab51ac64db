//! Key material for both sides of the migration.
//!
//! The legacy wallet wraps seven 32-byte symmetric keys in a single
//! msgpack-encoded bundle, itself encrypted under the Argon2i-derived master
//! key. The Askar side stores the same six content keys (plus a version
//! marker) as a CBOR map, encrypted under the master key and persisted per
//! profile. Both shapes live here, along with the row-level encryption
//! helpers that the record codec and the store layer share.
//!
//! Key bundles are held in memory only for the duration of a run and are
//! zeroised on drop; they are never persisted in decrypted form.

use std::io::Read;

use secrecy::SecretString;
use serde::Deserialize;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{self, CryptoError, KEY_LEN, MasterKey, SALT_LEN};
use crate::error::UpgradeError;

/// Profile key format version written into the CBOR map.
pub const PROFILE_KEY_VERSION: &str = "1";

/// Prefix of the pass-key derivation descriptor persisted in `config("key")`.
///
/// The `13` is the Argon2 version (0x13) and `mod` selects the moderate
/// cost limits; the salt rides along in hex so the store can re-derive the
/// master key from the passphrase alone.
pub const PASS_KEY_PREFIX: &str = "kdf:argon2i:13:mod?salt=";

/// Decoded `metadata` blob of a source wallet.
#[derive(Debug, Deserialize)]
pub struct IndyMetadata {
    /// Encrypted key bundle.
    pub keys: Vec<u8>,
    /// KDF salt; may be longer than 16 bytes, only the head is used.
    pub master_key_salt: Vec<u8>,
}

impl IndyMetadata {
    pub fn from_json(raw: &[u8]) -> Result<Self, UpgradeError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// The seven positional keys of a legacy wallet, in bundle order.
#[derive(Debug, Zeroize, ZeroizeOnDrop)]
pub struct IndyKeyBundle {
    pub type_key: [u8; KEY_LEN],
    pub name_key: [u8; KEY_LEN],
    pub value_key: [u8; KEY_LEN],
    pub item_hmac_key: [u8; KEY_LEN],
    pub tag_name_key: [u8; KEY_LEN],
    pub tag_value_key: [u8; KEY_LEN],
    pub tag_hmac_key: [u8; KEY_LEN],
}

impl IndyKeyBundle {
    /// Unpack the decrypted bundle blob.
    ///
    /// The legacy format is a standard msgpack positional array of exactly
    /// seven fixed-width binary entries, not a named map.
    pub fn unpack(blob: &[u8]) -> Result<Self, UpgradeError> {
        let mut reader = std::io::Cursor::new(blob);

        let entries = rmp::decode::read_array_len(&mut reader)
            .map_err(|_| UpgradeError::MalformedKeyBundle)?;
        if entries != 7 {
            return Err(UpgradeError::MalformedKeyBundle);
        }

        let mut keys = [[0u8; KEY_LEN]; 7];
        for key in keys.iter_mut() {
            let len = rmp::decode::read_bin_len(&mut reader)
                .map_err(|_| UpgradeError::MalformedKeyBundle)?;
            if len as usize != KEY_LEN {
                return Err(UpgradeError::MalformedKeyBundle);
            }
            reader
                .read_exact(key)
                .map_err(|_| UpgradeError::MalformedKeyBundle)?;
        }

        let [
            type_key,
            name_key,
            value_key,
            item_hmac_key,
            tag_name_key,
            tag_value_key,
            tag_hmac_key,
        ] = keys;
        keys.zeroize();
        Ok(Self {
            type_key,
            name_key,
            value_key,
            item_hmac_key,
            tag_name_key,
            tag_value_key,
            tag_hmac_key,
        })
    }
}

/// Everything the key-unwrap step yields for one wallet: the content key
/// bundle, the master key that wrapped it, and the (truncated) KDF salt.
pub struct IndyKey {
    pub bundle: IndyKeyBundle,
    pub master: MasterKey,
    pub salt: [u8; SALT_LEN],
}

impl IndyKey {
    /// Derive the master key and unwrap the key bundle from wallet metadata.
    pub fn from_metadata(
        metadata: &IndyMetadata,
        passphrase: &SecretString,
    ) -> Result<Self, UpgradeError> {
        let master =
            crypto::derive_master_key_from_passphrase(passphrase, &metadata.master_key_salt)?;

        let keys_blob = Zeroizing::new(
            crypto::decrypt_merged(&metadata.keys, master.as_ref(), false).map_err(|err| {
                match err {
                    CryptoError::DecryptionFailed => {
                        UpgradeError::DecryptionFailed("wallet key bundle")
                    }
                    other => other.into(),
                }
            })?,
        );
        let bundle = IndyKeyBundle::unpack(&keys_blob)?;

        let salt: [u8; SALT_LEN] = metadata.master_key_salt[..SALT_LEN]
            .try_into()
            .expect("salt length checked by key derivation");

        Ok(Self {
            bundle,
            master,
            salt,
        })
    }

    /// The pass-key derivation descriptor for `config("key")`.
    pub fn pass_key_uri(&self) -> String {
        format!("{PASS_KEY_PREFIX}{}", hex::encode(self.salt))
    }
}

/// Parse a pass-key descriptor back into its salt bytes.
pub fn parse_pass_key_uri(uri: &str) -> Result<Vec<u8>, UpgradeError> {
    let hex_salt = uri
        .strip_prefix(PASS_KEY_PREFIX)
        .ok_or_else(|| UpgradeError::InvalidPassKey(uri.to_string()))?;
    let salt = hex::decode(hex_salt).map_err(|_| UpgradeError::InvalidPassKey(uri.to_string()))?;
    if salt.len() < SALT_LEN {
        return Err(UpgradeError::InvalidPassKey(uri.to_string()));
    }
    Ok(salt)
}

/// The Askar profile key: the six content keys of a wallet plus a version
/// marker, serialised as a canonical CBOR map and stored encrypted in the
/// `profiles` table.
#[derive(Clone, Debug, Zeroize, ZeroizeOnDrop)]
pub struct ProfileKey {
    pub ver: String,
    pub ick: [u8; KEY_LEN],
    pub ink: [u8; KEY_LEN],
    pub ihk: [u8; KEY_LEN],
    pub tnk: [u8; KEY_LEN],
    pub tvk: [u8; KEY_LEN],
    pub thk: [u8; KEY_LEN],
}

impl ProfileKey {
    pub fn from_bundle(bundle: &IndyKeyBundle) -> Self {
        Self {
            ver: PROFILE_KEY_VERSION.to_string(),
            ick: bundle.type_key,
            ink: bundle.name_key,
            ihk: bundle.item_hmac_key,
            tnk: bundle.tag_name_key,
            tvk: bundle.tag_value_key,
            thk: bundle.tag_hmac_key,
        }
    }

    /// Serialise as a definite-length CBOR map in canonical field order.
    pub fn to_cbor(&self) -> Result<Vec<u8>, UpgradeError> {
        let mut buf = Vec::new();
        let mut enc = minicbor::Encoder::new(&mut buf);
        enc.map(7)
            .and_then(|e| e.str("ver"))
            .and_then(|e| e.str(&self.ver))
            .and_then(|e| e.str("ick"))
            .and_then(|e| e.bytes(&self.ick))
            .and_then(|e| e.str("ink"))
            .and_then(|e| e.bytes(&self.ink))
            .and_then(|e| e.str("ihk"))
            .and_then(|e| e.bytes(&self.ihk))
            .and_then(|e| e.str("tnk"))
            .and_then(|e| e.bytes(&self.tnk))
            .and_then(|e| e.str("tvk"))
            .and_then(|e| e.bytes(&self.tvk))
            .and_then(|e| e.str("thk"))
            .and_then(|e| e.bytes(&self.thk))
            .map_err(|_| UpgradeError::ProfileKeyEncoding)?;
        Ok(buf)
    }

    /// Decode from the CBOR map produced by [`ProfileKey::to_cbor`].
    pub fn from_cbor(blob: &[u8]) -> Result<Self, UpgradeError> {
        fn fixed(bytes: &[u8]) -> Result<[u8; KEY_LEN], UpgradeError> {
            bytes
                .try_into()
                .map_err(|_| UpgradeError::ProfileKeyEncoding)
        }

        let mut dec = minicbor::Decoder::new(blob);
        let entries = dec
            .map()
            .map_err(|_| UpgradeError::ProfileKeyEncoding)?
            .ok_or(UpgradeError::ProfileKeyEncoding)?;

        let mut ver = None;
        let mut keys: [Option<[u8; KEY_LEN]>; 6] = [None; 6];
        for _ in 0..entries {
            let field = dec.str().map_err(|_| UpgradeError::ProfileKeyEncoding)?;
            if field == "ver" {
                ver = Some(
                    dec.str()
                        .map_err(|_| UpgradeError::ProfileKeyEncoding)?
                        .to_string(),
                );
                continue;
            }
            let slot = match field {
                "ick" => 0,
                "ink" => 1,
                "ihk" => 2,
                "tnk" => 3,
                "tvk" => 4,
                "thk" => 5,
                _ => return Err(UpgradeError::ProfileKeyEncoding),
            };
            let bytes = dec.bytes().map_err(|_| UpgradeError::ProfileKeyEncoding)?;
            keys[slot] = Some(fixed(bytes)?);
        }

        let ver = ver.ok_or(UpgradeError::ProfileKeyEncoding)?;
        let take = |slot: usize| keys[slot].ok_or(UpgradeError::ProfileKeyEncoding);
        Ok(Self {
            ver,
            ick: take(0)?,
            ink: take(1)?,
            ihk: take(2)?,
            tnk: take(3)?,
            tvk: take(4)?,
            thk: take(5)?,
        })
    }

    // Row-level coding. Categories, names and tag names use the
    // deterministic HMAC nonce so equal plaintexts produce equal
    // ciphertexts; values use a fresh random nonce.

    pub fn encrypt_category(&self, category: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::encrypt_merged(category, &self.ick, Some(&self.ihk))
    }

    pub fn decrypt_category(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::decrypt_merged(blob, &self.ick, false)
    }

    pub fn encrypt_name(&self, name: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::encrypt_merged(name, &self.ink, Some(&self.ihk))
    }

    pub fn decrypt_name(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::decrypt_merged(blob, &self.ink, false)
    }

    pub fn encrypt_value(
        &self,
        category: &[u8],
        name: &[u8],
        value: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        crypto::encrypt_value(category, name, value, &self.ihk)
    }

    pub fn decrypt_value(
        &self,
        category: &[u8],
        name: &[u8],
        blob: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        crypto::decrypt_value(category, name, blob, &self.ihk)
    }

    pub fn encrypt_tag_name(&self, name: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::encrypt_merged(name, &self.tnk, Some(&self.thk))
    }

    pub fn decrypt_tag_name(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::decrypt_merged(blob, &self.tnk, false)
    }

    pub fn encrypt_tag_value(&self, value: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::encrypt_merged(value, &self.tvk, Some(&self.thk))
    }

    pub fn decrypt_tag_value(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::decrypt_merged(blob, &self.tvk, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    fn sample_bundle() -> IndyKeyBundle {
        IndyKeyBundle {
            type_key: random_bytes(),
            name_key: random_bytes(),
            value_key: random_bytes(),
            item_hmac_key: random_bytes(),
            tag_name_key: random_bytes(),
            tag_value_key: random_bytes(),
            tag_hmac_key: random_bytes(),
        }
    }

    fn pack(keys: &[[u8; KEY_LEN]]) -> Vec<u8> {
        let mut buf = Vec::new();
        rmp::encode::write_array_len(&mut buf, keys.len() as u32).unwrap();
        for key in keys {
            rmp::encode::write_bin(&mut buf, key).unwrap();
        }
        buf
    }

    #[test]
    fn bundle_unpacks_in_positional_order() {
        let keys: Vec<[u8; KEY_LEN]> = (0u8..7).map(|i| [i; KEY_LEN]).collect();
        let bundle = IndyKeyBundle::unpack(&pack(&keys)).unwrap();

        assert_eq!(bundle.type_key, [0u8; KEY_LEN]);
        assert_eq!(bundle.name_key, [1u8; KEY_LEN]);
        assert_eq!(bundle.value_key, [2u8; KEY_LEN]);
        assert_eq!(bundle.item_hmac_key, [3u8; KEY_LEN]);
        assert_eq!(bundle.tag_name_key, [4u8; KEY_LEN]);
        assert_eq!(bundle.tag_value_key, [5u8; KEY_LEN]);
        assert_eq!(bundle.tag_hmac_key, [6u8; KEY_LEN]);
    }

    #[test]
    fn bundle_rejects_wrong_arity() {
        let keys: Vec<[u8; KEY_LEN]> = (0u8..6).map(|i| [i; KEY_LEN]).collect();
        let err = IndyKeyBundle::unpack(&pack(&keys)).unwrap_err();
        assert!(matches!(err, UpgradeError::MalformedKeyBundle));
    }

    #[test]
    fn bundle_rejects_truncated_entry() {
        let mut buf = Vec::new();
        rmp::encode::write_array_len(&mut buf, 7).unwrap();
        rmp::encode::write_bin(&mut buf, &[0u8; 16]).unwrap();
        let err = IndyKeyBundle::unpack(&buf).unwrap_err();
        assert!(matches!(err, UpgradeError::MalformedKeyBundle));
    }

    #[test]
    fn profile_key_cbor_roundtrip() {
        let key = ProfileKey::from_bundle(&sample_bundle());
        let cbor = key.to_cbor().unwrap();

        // Definite-length map of seven entries with "ver" leading.
        assert_eq!(cbor[0], 0xa7);
        assert_eq!(&cbor[1..5], &[0x63, b'v', b'e', b'r']);

        let decoded = ProfileKey::from_cbor(&cbor).unwrap();
        assert_eq!(decoded.ver, PROFILE_KEY_VERSION);
        assert_eq!(decoded.ick, key.ick);
        assert_eq!(decoded.ink, key.ink);
        assert_eq!(decoded.ihk, key.ihk);
        assert_eq!(decoded.tnk, key.tnk);
        assert_eq!(decoded.tvk, key.tvk);
        assert_eq!(decoded.thk, key.thk);
    }

    #[test]
    fn profile_key_rejects_unknown_field() {
        let mut buf = Vec::new();
        let mut enc = minicbor::Encoder::new(&mut buf);
        enc.map(1).unwrap().str("bogus").unwrap().str("1").unwrap();
        let err = ProfileKey::from_cbor(&buf).unwrap_err();
        assert!(matches!(err, UpgradeError::ProfileKeyEncoding));
    }

    #[test]
    fn pass_key_uri_roundtrip() {
        let metadata_salt = random_bytes::<SALT_LEN>();
        let uri = format!("{PASS_KEY_PREFIX}{}", hex::encode(metadata_salt));
        assert_eq!(parse_pass_key_uri(&uri).unwrap(), metadata_salt);

        assert!(parse_pass_key_uri("kdf:argon2i:13:int?salt=00").is_err());
    }
}
