//! Row codec: decrypt a legacy item row, re-encrypt it for the new store.
//!
//! The source row carries a wrapped per-item key; the target row derives its
//! per-value key from the item coordinates instead, and encrypts category
//! and name with deterministic nonces so they stay equality-searchable.

use crate::crypto::CryptoError;
use crate::error::UpgradeError;
use crate::keys::{IndyKeyBundle, ProfileKey};

/// Row kind written for key-management records.
pub const KIND_KMS: i16 = 1;
/// Row kind written for migrated item records.
pub const KIND_ITEM: i16 = 2;

/// A pending source row, as selected from the legacy `items` table with its
/// tag sets pre-joined into comma-separated `hex(name):hex(value)` strings.
#[derive(Debug, Clone)]
pub struct IndyRow {
    pub id: i64,
    pub item_type: Vec<u8>,
    pub name: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub key: Vec<u8>,
    pub tags_enc: Option<String>,
    pub tags_plain: Option<String>,
}

/// One decrypted tag. `plaintext` distinguishes the two legacy tag tables
/// and is carried through to the target row unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemTag {
    pub plaintext: bool,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

/// A fully decrypted source item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedItem {
    pub id: i64,
    pub category: Vec<u8>,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    pub tags: Vec<ItemTag>,
}

/// An item re-encrypted under a profile key, ready for the new `items` /
/// `items_tags` tables. Plaintext tags keep their raw value; encrypted tags
/// carry ciphertext in both columns.
#[derive(Debug, Clone)]
pub struct UpdatedItem {
    pub id: i64,
    pub category: Vec<u8>,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    pub tags: Vec<ItemTag>,
}

fn context_err(context: &'static str) -> impl FnOnce(CryptoError) -> UpgradeError {
    move |err| match err {
        CryptoError::DecryptionFailed => UpgradeError::DecryptionFailed(context),
        other => other.into(),
    }
}

/// Expand a comma-joined `hex(name):hex(value)` tag string and decrypt it.
///
/// With `value_key` the tag values are ciphertext and are decrypted; without
/// it (the plaintext tag table) the hex-decoded bytes are returned as-is.
fn decrypt_tags(
    tags: &str,
    name_key: &[u8],
    value_key: Option<&[u8]>,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, UpgradeError> {
    let mut out = Vec::new();
    for tag in tags.split(',') {
        let (name_hex, value_hex) = tag
            .split_once(':')
            .ok_or(UpgradeError::MalformedTagEncoding)?;
        let enc_name = hex::decode(name_hex).map_err(|_| UpgradeError::MalformedTagEncoding)?;
        let tag_value = hex::decode(value_hex).map_err(|_| UpgradeError::MalformedTagEncoding)?;

        let name = crate::crypto::decrypt_merged(&enc_name, name_key, false)
            .map_err(context_err("tag name"))?;
        let value = match value_key {
            Some(value_key) => crate::crypto::decrypt_merged(&tag_value, value_key, false)
                .map_err(context_err("tag value"))?,
            None => tag_value,
        };
        out.push((name, value));
    }
    Ok(out)
}

/// Decrypt a source row under the wallet's key bundle.
///
/// `b64` marks rows read from the network store, where the item `type` and
/// `name` columns are Base64-wrapped at the storage layer.
pub fn decrypt_item(
    row: &IndyRow,
    keys: &IndyKeyBundle,
    b64: bool,
) -> Result<DecryptedItem, UpgradeError> {
    let value_key = crate::crypto::decrypt_merged(&row.key, &keys.value_key, false)
        .map_err(context_err("item key"))?;

    let value = match &row.value {
        Some(value) if !value.is_empty() => {
            crate::crypto::decrypt_merged(value, &value_key, false)
                .map_err(context_err("item value"))?
        }
        _ => Vec::new(),
    };

    let category = crate::crypto::decrypt_merged(&row.item_type, &keys.type_key, b64)
        .map_err(context_err("item category"))?;
    let name = crate::crypto::decrypt_merged(&row.name, &keys.name_key, b64)
        .map_err(context_err("item name"))?;

    let mut tags = Vec::new();
    if let Some(tags_enc) = row.tags_enc.as_deref().filter(|t| !t.is_empty()) {
        for (name, value) in
            decrypt_tags(tags_enc, &keys.tag_name_key, Some(&keys.tag_value_key))?
        {
            tags.push(ItemTag {
                plaintext: false,
                name,
                value,
            });
        }
    }
    if let Some(tags_plain) = row.tags_plain.as_deref().filter(|t| !t.is_empty()) {
        for (name, value) in decrypt_tags(tags_plain, &keys.tag_name_key, None)? {
            tags.push(ItemTag {
                plaintext: true,
                name,
                value,
            });
        }
    }

    Ok(DecryptedItem {
        id: row.id,
        category,
        name,
        value,
        tags,
    })
}

/// Re-encrypt a decrypted item under the profile key for the new store.
pub fn update_item(item: &DecryptedItem, key: &ProfileKey) -> Result<UpdatedItem, UpgradeError> {
    let mut tags = Vec::with_capacity(item.tags.len());
    for tag in &item.tags {
        let value = if tag.plaintext {
            tag.value.clone()
        } else {
            key.encrypt_tag_value(&tag.value)?
        };
        tags.push(ItemTag {
            plaintext: tag.plaintext,
            name: key.encrypt_tag_name(&tag.name)?,
            value,
        });
    }

    Ok(UpdatedItem {
        id: item.id,
        category: key.encrypt_category(&item.category)?,
        name: key.encrypt_name(&item.name)?,
        value: key.encrypt_value(&item.category, &item.name, &item.value)?,
        tags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, KEY_LEN, random_bytes};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;

    fn bundle() -> IndyKeyBundle {
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

    fn tag_string(pairs: &[(Vec<u8>, Vec<u8>)]) -> String {
        pairs
            .iter()
            .map(|(n, v)| format!("{}:{}", hex::encode(n), hex::encode(v)))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Encrypt a row the way the legacy wallet layer did.
    fn make_row(
        keys: &IndyKeyBundle,
        category: &[u8],
        name: &[u8],
        value: &[u8],
        enc_tags: &[(&[u8], &[u8])],
        plain_tags: &[(&[u8], &[u8])],
        b64: bool,
    ) -> IndyRow {
        let item_key = random_bytes::<KEY_LEN>();

        let mut item_type =
            crypto::encrypt_merged(category, &keys.type_key, Some(&keys.item_hmac_key)).unwrap();
        let mut enc_name =
            crypto::encrypt_merged(name, &keys.name_key, Some(&keys.item_hmac_key)).unwrap();
        if b64 {
            item_type = BASE64.encode(&item_type).into_bytes();
            enc_name = BASE64.encode(&enc_name).into_bytes();
        }

        let tags_enc = tag_string(
            &enc_tags
                .iter()
                .map(|(n, v)| {
                    (
                        crypto::encrypt_merged(n, &keys.tag_name_key, Some(&keys.tag_hmac_key))
                            .unwrap(),
                        crypto::encrypt_merged(v, &keys.tag_value_key, Some(&keys.tag_hmac_key))
                            .unwrap(),
                    )
                })
                .collect::<Vec<_>>(),
        );
        let tags_plain = tag_string(
            &plain_tags
                .iter()
                .map(|(n, v)| {
                    (
                        crypto::encrypt_merged(n, &keys.tag_name_key, Some(&keys.tag_hmac_key))
                            .unwrap(),
                        v.to_vec(),
                    )
                })
                .collect::<Vec<_>>(),
        );

        IndyRow {
            id: 1,
            item_type,
            name: enc_name,
            value: Some(crypto::encrypt_merged(value, &item_key, None).unwrap()),
            key: crypto::encrypt_merged(&item_key, &keys.value_key, None).unwrap(),
            tags_enc: (!tags_enc.is_empty()).then_some(tags_enc),
            tags_plain: (!tags_plain.is_empty()).then_some(tags_plain),
        }
    }

    #[test]
    fn decrypts_item_with_both_tag_kinds() {
        let keys = bundle();
        let row = make_row(
            &keys,
            b"Indy::Did",
            b"did-name",
            b"{\"did\":\"x\"}",
            &[(b"enc".as_slice(), b"secret".as_slice())],
            &[(b"verkey".as_slice(), b"H3C2".as_slice())],
            false,
        );

        let item = decrypt_item(&row, &keys, false).unwrap();
        assert_eq!(item.category, b"Indy::Did");
        assert_eq!(item.name, b"did-name");
        assert_eq!(item.value, b"{\"did\":\"x\"}");
        assert_eq!(item.tags.len(), 2);
        assert_eq!(
            item.tags[0],
            ItemTag {
                plaintext: false,
                name: b"enc".to_vec(),
                value: b"secret".to_vec(),
            }
        );
        // Plaintext tag values come back as the hex-decoded bytes, as-is.
        assert_eq!(
            item.tags[1],
            ItemTag {
                plaintext: true,
                name: b"verkey".to_vec(),
                value: b"H3C2".to_vec(),
            }
        );
    }

    #[test]
    fn decrypts_base64_wrapped_row() {
        let keys = bundle();
        let row = make_row(&keys, b"Indy::Schema", b"sid", b"{}", &[], &[], true);

        let item = decrypt_item(&row, &keys, true).unwrap();
        assert_eq!(item.category, b"Indy::Schema");
        assert_eq!(item.name, b"sid");
    }

    #[test]
    fn empty_value_decrypts_to_empty() {
        let keys = bundle();
        let mut row = make_row(&keys, b"Indy::Key", b"k", b"v", &[], &[], false);
        row.value = None;

        let item = decrypt_item(&row, &keys, false).unwrap();
        assert!(item.value.is_empty());
    }

    #[test]
    fn wrong_bundle_fails_decryption() {
        let keys = bundle();
        let row = make_row(&keys, b"Indy::Did", b"n", b"v", &[], &[], false);

        let err = decrypt_item(&row, &bundle(), false).unwrap_err();
        assert!(matches!(err, UpgradeError::DecryptionFailed("item key")));
    }

    #[test]
    fn malformed_tag_string_is_rejected() {
        let keys = bundle();
        let mut row = make_row(&keys, b"Indy::Did", b"n", b"v", &[], &[], false);
        row.tags_plain = Some("not-hex-pairs".to_string());

        let err = decrypt_item(&row, &keys, false).unwrap_err();
        assert!(matches!(err, UpgradeError::MalformedTagEncoding));
    }

    #[test]
    fn updated_item_roundtrips_under_profile_key() {
        let keys = bundle();
        let row = make_row(
            &keys,
            b"Indy::Credential",
            b"cred-1",
            b"{\"values\":{}}",
            &[(b"hidden".as_slice(), b"h".as_slice())],
            &[(b"shown".as_slice(), b"s".as_slice())],
            false,
        );
        let item = decrypt_item(&row, &keys, false).unwrap();

        let profile_key = ProfileKey::from_bundle(&keys);
        let updated = update_item(&item, &profile_key).unwrap();

        assert_eq!(
            profile_key.decrypt_category(&updated.category).unwrap(),
            b"Indy::Credential"
        );
        assert_eq!(profile_key.decrypt_name(&updated.name).unwrap(), b"cred-1");
        assert_eq!(
            profile_key
                .decrypt_value(b"Indy::Credential", b"cred-1", &updated.value)
                .unwrap(),
            b"{\"values\":{}}"
        );

        let hidden = &updated.tags[0];
        assert!(!hidden.plaintext);
        assert_eq!(
            profile_key.decrypt_tag_name(&hidden.name).unwrap(),
            b"hidden"
        );
        assert_eq!(profile_key.decrypt_tag_value(&hidden.value).unwrap(), b"h");

        let shown = &updated.tags[1];
        assert!(shown.plaintext);
        assert_eq!(profile_key.decrypt_tag_name(&shown.name).unwrap(), b"shown");
        assert_eq!(shown.value, b"s");
    }

    #[test]
    fn category_encryption_is_searchable() {
        let keys = bundle();
        let profile_key = ProfileKey::from_bundle(&keys);

        let a = profile_key.encrypt_category(b"credential").unwrap();
        let b = profile_key.encrypt_category(b"credential").unwrap();
        assert_eq!(a, b);
    }
}
