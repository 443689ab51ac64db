//! Transactional record store over the migrated schema.
//!
//! This is the boundary the post-upgrade transformer drives: open a store
//! from its pass-key descriptor, then fetch / insert / remove typed records
//! inside transactions. Opening re-derives the master key from the salt in
//! `config("key")`, decrypts the profile key and CBOR-decodes it — exactly
//! the round trip the migration output must survive.
//!
//! Row-level coding mirrors the record codec: categories, names and tag
//! names are encrypted with deterministic nonces (so equality predicates
//! work on ciphertext), values under a key derived from the record
//! coordinates.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::SigningKey;
use secrecy::SecretString;
use sqlx::{ConnectOptions, Connection, Row};
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::codec::{KIND_ITEM, KIND_KMS};
use crate::crypto;
use crate::error::UpgradeError;
use crate::keys::{ProfileKey, parse_pass_key_uri};

/// Category used for key-management records written by `insert_key`.
const KEY_CATEGORY: &str = "key";

/// A decrypted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub category: String,
    pub name: String,
    pub value: Vec<u8>,
    pub tags: Vec<(String, String)>,
}

impl Entry {
    pub fn value_json(&self) -> Result<serde_json::Value, UpgradeError> {
        Ok(serde_json::from_slice(&self.value)?)
    }
}

/// A decrypted key-management record.
pub struct KeyEntry {
    pub alg: String,
    pub seed: Zeroizing<Vec<u8>>,
    pub public: Vec<u8>,
    pub metadata: Option<String>,
}

enum StoreConn {
    Sqlite(sqlx::SqliteConnection),
    Pg(sqlx::PgConnection),
}

enum StoreTxn<'a> {
    Sqlite(sqlx::Transaction<'a, sqlx::Sqlite>),
    Pg(sqlx::Transaction<'a, sqlx::Postgres>),
}

/// An opened store, scoped to a single profile.
pub struct Store {
    conn: StoreConn,
    profile_id: i64,
    profile_key: ProfileKey,
}

impl Store {
    /// Open a migrated store and unlock one profile.
    ///
    /// `profile` defaults to the `default_profile` config entry. Fails with
    /// [`UpgradeError::UnsupportedVersion`] unless `config("version")` is
    /// `"1"`, and with a decryption error when the pass key is wrong.
    pub async fn open(
        uri: &str,
        pass_key: &SecretString,
        profile: Option<&str>,
    ) -> Result<Self, UpgradeError> {
        let mut conn = StoreConn::connect(uri).await?;

        let version = conn
            .fetch_config("version")
            .await?
            .ok_or(UpgradeError::MissingConfig("version"))?;
        if version != "1" {
            return Err(UpgradeError::UnsupportedVersion(version));
        }

        let key_uri = conn
            .fetch_config("key")
            .await?
            .ok_or(UpgradeError::MissingConfig("key"))?;
        let salt = parse_pass_key_uri(&key_uri)?;
        let master = crypto::derive_master_key_from_passphrase(pass_key, &salt)?;

        let profile_name = match profile {
            Some(name) => name.to_string(),
            None => conn
                .fetch_config("default_profile")
                .await?
                .ok_or(UpgradeError::MissingConfig("default_profile"))?,
        };

        let (profile_id, enc_profile_key) = conn
            .fetch_profile(&profile_name)
            .await?
            .ok_or_else(|| UpgradeError::ProfileNotFound(profile_name.clone()))?;

        let profile_key_cbor = Zeroizing::new(
            crypto::decrypt_merged(&enc_profile_key, master.as_ref(), false).map_err(|err| {
                match err {
                    crypto::CryptoError::DecryptionFailed => {
                        UpgradeError::DecryptionFailed("profile key")
                    }
                    other => other.into(),
                }
            })?,
        );
        let profile_key = ProfileKey::from_cbor(&profile_key_cbor)?;

        Ok(Self {
            conn,
            profile_id,
            profile_key,
        })
    }

    /// Begin a transaction scoped to the opened profile.
    pub async fn transaction(&mut self) -> Result<Session<'_>, UpgradeError> {
        let txn = self.conn.begin().await?;
        Ok(Session {
            txn,
            profile_id: self.profile_id,
            profile_key: &self.profile_key,
        })
    }

    /// Fetch every record of a category.
    pub async fn scan(&mut self, category: &str) -> Result<Vec<Entry>, UpgradeError> {
        let mut session = self.transaction().await?;
        let entries = session.fetch_all(category, None).await?;
        session.commit().await?;
        Ok(entries)
    }

    pub async fn close(self) -> Result<(), UpgradeError> {
        match self.conn {
            StoreConn::Sqlite(conn) => conn.close().await?,
            StoreConn::Pg(conn) => conn.close().await?,
        }
        Ok(())
    }
}

/// A transaction over the store. Dropped without [`Session::commit`], all
/// changes roll back.
pub struct Session<'a> {
    txn: StoreTxn<'a>,
    profile_id: i64,
    profile_key: &'a ProfileKey,
}

impl Session<'_> {
    pub async fn commit(self) -> Result<(), UpgradeError> {
        match self.txn {
            StoreTxn::Sqlite(txn) => txn.commit().await?,
            StoreTxn::Pg(txn) => txn.commit().await?,
        }
        Ok(())
    }

    /// Fetch one record by category and name.
    pub async fn fetch(
        &mut self,
        category: &str,
        name: &str,
    ) -> Result<Option<Entry>, UpgradeError> {
        let enc_category = self.profile_key.encrypt_category(category.as_bytes())?;
        let enc_name = self.profile_key.encrypt_name(name.as_bytes())?;
        let row = self
            .txn
            .fetch_one_item(self.profile_id, KIND_ITEM, &enc_category, &enc_name)
            .await?;
        match row {
            Some((id, _, value)) => Ok(Some(
                self.decrypt_entry(category, name.as_bytes().to_vec(), id, value)
                    .await?,
            )),
            None => Ok(None),
        }
    }

    /// Fetch up to `limit` records of a category.
    pub async fn fetch_all(
        &mut self,
        category: &str,
        limit: Option<i64>,
    ) -> Result<Vec<Entry>, UpgradeError> {
        let enc_category = self.profile_key.encrypt_category(category.as_bytes())?;
        let rows = self
            .txn
            .fetch_items(self.profile_id, KIND_ITEM, &enc_category, limit)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (id, enc_name, value) in rows {
            let name = self.profile_key.decrypt_name(&enc_name)?;
            entries.push(self.decrypt_entry(category, name, id, value).await?);
        }
        Ok(entries)
    }

    /// Insert a new record with optional tags (stored encrypted).
    pub async fn insert(
        &mut self,
        category: &str,
        name: &str,
        value: &[u8],
        tags: &[(String, String)],
    ) -> Result<(), UpgradeError> {
        self.insert_kind(KIND_ITEM, category, name, value, tags)
            .await
    }

    /// Insert a record whose value is serialised JSON.
    pub async fn insert_json(
        &mut self,
        category: &str,
        name: &str,
        value: &serde_json::Value,
        tags: &[(String, String)],
    ) -> Result<(), UpgradeError> {
        let raw = serde_json::to_vec(value)?;
        self.insert(category, name, &raw, tags).await
    }

    /// Insert an Ed25519 key-management record from its 32-byte seed.
    pub async fn insert_key(
        &mut self,
        name: &str,
        seed: &[u8],
        metadata: Option<&str>,
    ) -> Result<(), UpgradeError> {
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| UpgradeError::MalformedRecord(name.to_string()))?;
        let signing = SigningKey::from_bytes(&seed);
        let public = signing.verifying_key().to_bytes();

        let envelope = serde_json::json!({
            "alg": "ed25519",
            "seed": BASE64.encode(seed),
            "pub": BASE64.encode(public),
            "metadata": metadata,
        });
        let raw = serde_json::to_vec(&envelope)?;
        self.insert_kind(KIND_KMS, KEY_CATEGORY, name, &raw, &[])
            .await
    }

    /// Fetch a key-management record back.
    pub async fn fetch_key(&mut self, name: &str) -> Result<Option<KeyEntry>, UpgradeError> {
        let enc_category = self.profile_key.encrypt_category(KEY_CATEGORY.as_bytes())?;
        let enc_name = self.profile_key.encrypt_name(name.as_bytes())?;
        let row = self
            .txn
            .fetch_one_item(self.profile_id, KIND_KMS, &enc_category, &enc_name)
            .await?;
        let Some((_, _, value)) = row else {
            return Ok(None);
        };

        let raw =
            self.profile_key
                .decrypt_value(KEY_CATEGORY.as_bytes(), name.as_bytes(), &value)?;
        let envelope: serde_json::Value = serde_json::from_slice(&raw)?;
        let field = |key: &str| -> Result<Vec<u8>, UpgradeError> {
            let encoded = envelope
                .get(key)
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| UpgradeError::MalformedRecord(name.to_string()))?;
            BASE64
                .decode(encoded)
                .map_err(|_| UpgradeError::MalformedRecord(name.to_string()))
        };

        Ok(Some(KeyEntry {
            alg: envelope
                .get("alg")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
            seed: Zeroizing::new(field("seed")?),
            public: field("pub")?,
            metadata: envelope
                .get("metadata")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
        }))
    }

    /// Remove a record. Removing an absent record is a no-op.
    pub async fn remove(&mut self, category: &str, name: &str) -> Result<(), UpgradeError> {
        let enc_category = self.profile_key.encrypt_category(category.as_bytes())?;
        let enc_name = self.profile_key.encrypt_name(name.as_bytes())?;
        self.txn
            .delete_item(self.profile_id, KIND_ITEM, &enc_category, &enc_name)
            .await?;
        Ok(())
    }

    async fn insert_kind(
        &mut self,
        kind: i16,
        category: &str,
        name: &str,
        value: &[u8],
        tags: &[(String, String)],
    ) -> Result<(), UpgradeError> {
        let enc_category = self.profile_key.encrypt_category(category.as_bytes())?;
        let enc_name = self.profile_key.encrypt_name(name.as_bytes())?;
        let enc_value = self
            .profile_key
            .encrypt_value(category.as_bytes(), name.as_bytes(), value)?;

        let item_id = self
            .txn
            .insert_item(self.profile_id, kind, &enc_category, &enc_name, &enc_value)
            .await?;

        for (tag_name, tag_value) in tags {
            let enc_tag_name = self.profile_key.encrypt_tag_name(tag_name.as_bytes())?;
            let enc_tag_value = self.profile_key.encrypt_tag_value(tag_value.as_bytes())?;
            self.txn
                .insert_tag(item_id, false, &enc_tag_name, &enc_tag_value)
                .await?;
        }
        Ok(())
    }

    async fn decrypt_entry(
        &mut self,
        category: &str,
        name: Vec<u8>,
        item_id: i64,
        enc_value: Vec<u8>,
    ) -> Result<Entry, UpgradeError> {
        let value = self
            .profile_key
            .decrypt_value(category.as_bytes(), &name, &enc_value)?;

        let mut tags = Vec::new();
        for (enc_name, tag_value, plaintext) in self.txn.fetch_tags(item_id).await? {
            let tag_name = self.profile_key.decrypt_tag_name(&enc_name)?;
            let tag_value = if plaintext {
                tag_value
            } else {
                self.profile_key.decrypt_tag_value(&tag_value)?
            };
            tags.push((into_string(tag_name)?, into_string(tag_value)?));
        }

        Ok(Entry {
            category: category.to_string(),
            name: into_string(name)?,
            value,
            tags,
        })
    }
}

fn into_string(bytes: Vec<u8>) -> Result<String, UpgradeError> {
    String::from_utf8(bytes).map_err(|_| UpgradeError::InvalidEncoding)
}

impl StoreConn {
    async fn connect(uri: &str) -> Result<Self, UpgradeError> {
        if uri.starts_with("sqlite:") {
            let options = sqlx::sqlite::SqliteConnectOptions::from_str(uri)?.foreign_keys(true);
            Ok(StoreConn::Sqlite(options.connect().await?))
        } else if uri.starts_with("postgres:") || uri.starts_with("postgresql:") {
            Ok(StoreConn::Pg(sqlx::PgConnection::connect(uri).await?))
        } else {
            Err(UpgradeError::InvalidUri(uri.to_string()))
        }
    }

    async fn begin(&mut self) -> Result<StoreTxn<'_>, UpgradeError> {
        Ok(match self {
            StoreConn::Sqlite(conn) => StoreTxn::Sqlite(conn.begin().await?),
            StoreConn::Pg(conn) => StoreTxn::Pg(conn.begin().await?),
        })
    }

    async fn fetch_config(&mut self, name: &str) -> Result<Option<String>, UpgradeError> {
        let row = match self {
            StoreConn::Sqlite(conn) => sqlx::query("SELECT value FROM config WHERE name = ?1")
                .bind(name)
                .fetch_optional(conn)
                .await?
                .map(|row| row.try_get::<Option<String>, _>(0)),
            StoreConn::Pg(conn) => sqlx::query("SELECT value FROM config WHERE name = $1")
                .bind(name)
                .fetch_optional(conn)
                .await?
                .map(|row| row.try_get::<Option<String>, _>(0)),
        };
        Ok(row.transpose()?.flatten())
    }

    async fn fetch_profile(&mut self, name: &str) -> Result<Option<(i64, Vec<u8>)>, UpgradeError> {
        let row = match self {
            StoreConn::Sqlite(conn) => {
                sqlx::query("SELECT id, profile_key FROM profiles WHERE name = ?1")
                    .bind(name)
                    .fetch_optional(conn)
                    .await?
                    .map(|row| Ok((row.try_get::<i64, _>(0)?, row.try_get::<Vec<u8>, _>(1)?)))
            }
            StoreConn::Pg(conn) => {
                sqlx::query("SELECT id, profile_key FROM profiles WHERE name = $1")
                    .bind(name)
                    .fetch_optional(conn)
                    .await?
                    .map(|row| Ok((row.try_get::<i64, _>(0)?, row.try_get::<Vec<u8>, _>(1)?)))
            }
        };
        row.transpose()
    }
}

impl StoreTxn<'_> {
    async fn fetch_one_item(
        &mut self,
        profile_id: i64,
        kind: i16,
        category: &[u8],
        name: &[u8],
    ) -> Result<Option<(i64, Vec<u8>, Vec<u8>)>, UpgradeError> {
        match self {
            StoreTxn::Sqlite(txn) => sqlx::query(
                "SELECT id, name, value FROM items
                 WHERE profile_id = ?1 AND kind = ?2 AND category = ?3 AND name = ?4",
            )
            .bind(profile_id)
            .bind(kind as i64)
            .bind(category)
            .bind(name)
            .fetch_optional(&mut **txn)
            .await?
            .map(|row| decode_item_row(&row))
            .transpose(),
            StoreTxn::Pg(txn) => sqlx::query(
                "SELECT id, name, value FROM items
                 WHERE profile_id = $1 AND kind = $2 AND category = $3 AND name = $4",
            )
            .bind(profile_id)
            .bind(kind)
            .bind(category)
            .bind(name)
            .fetch_optional(&mut **txn)
            .await?
            .map(|row| decode_item_row(&row))
            .transpose(),
        }
    }

    async fn fetch_items(
        &mut self,
        profile_id: i64,
        kind: i16,
        category: &[u8],
        limit: Option<i64>,
    ) -> Result<Vec<(i64, Vec<u8>, Vec<u8>)>, UpgradeError> {
        let limit = limit.unwrap_or(i64::MAX);
        match self {
            StoreTxn::Sqlite(txn) => sqlx::query(
                "SELECT id, name, value FROM items
                 WHERE profile_id = ?1 AND kind = ?2 AND category = ?3
                 ORDER BY id LIMIT ?4",
            )
            .bind(profile_id)
            .bind(kind as i64)
            .bind(category)
            .bind(limit)
            .fetch_all(&mut **txn)
            .await?
            .iter()
            .map(decode_item_row)
            .collect(),
            StoreTxn::Pg(txn) => sqlx::query(
                "SELECT id, name, value FROM items
                 WHERE profile_id = $1 AND kind = $2 AND category = $3
                 ORDER BY id LIMIT $4",
            )
            .bind(profile_id)
            .bind(kind)
            .bind(category)
            .bind(limit)
            .fetch_all(&mut **txn)
            .await?
            .iter()
            .map(decode_item_row)
            .collect(),
        }
    }

    async fn fetch_tags(
        &mut self,
        item_id: i64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>, bool)>, UpgradeError> {
        match self {
            StoreTxn::Sqlite(txn) => {
                let rows =
                    sqlx::query("SELECT name, value, plaintext FROM items_tags WHERE item_id = ?1")
                        .bind(item_id)
                        .fetch_all(&mut **txn)
                        .await?;
                rows.into_iter()
                    .map(|row| {
                        Ok((
                            row.try_get::<Vec<u8>, _>(0)?,
                            row.try_get::<Vec<u8>, _>(1)?,
                            row.try_get::<i64, _>(2)? != 0,
                        ))
                    })
                    .collect()
            }
            StoreTxn::Pg(txn) => {
                let rows =
                    sqlx::query("SELECT name, value, plaintext FROM items_tags WHERE item_id = $1")
                        .bind(item_id)
                        .fetch_all(&mut **txn)
                        .await?;
                rows.into_iter()
                    .map(|row| {
                        Ok((
                            row.try_get::<Vec<u8>, _>(0)?,
                            row.try_get::<Vec<u8>, _>(1)?,
                            row.try_get::<i16, _>(2)? != 0,
                        ))
                    })
                    .collect()
            }
        }
    }

    async fn insert_item(
        &mut self,
        profile_id: i64,
        kind: i16,
        category: &[u8],
        name: &[u8],
        value: &[u8],
    ) -> Result<i64, UpgradeError> {
        match self {
            StoreTxn::Sqlite(txn) => {
                let result = sqlx::query(
                    "INSERT INTO items (profile_id, kind, category, name, value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .bind(profile_id)
                .bind(kind as i64)
                .bind(category)
                .bind(name)
                .bind(value)
                .execute(&mut **txn)
                .await?;
                Ok(result.last_insert_rowid())
            }
            StoreTxn::Pg(txn) => {
                let row = sqlx::query(
                    "INSERT INTO items (profile_id, kind, category, name, value)
                     VALUES ($1, $2, $3, $4, $5) RETURNING id",
                )
                .bind(profile_id)
                .bind(kind)
                .bind(category)
                .bind(name)
                .bind(value)
                .fetch_one(&mut **txn)
                .await?;
                Ok(row.try_get(0)?)
            }
        }
    }

    async fn insert_tag(
        &mut self,
        item_id: i64,
        plaintext: bool,
        name: &[u8],
        value: &[u8],
    ) -> Result<(), UpgradeError> {
        match self {
            StoreTxn::Sqlite(txn) => {
                sqlx::query(
                    "INSERT INTO items_tags (item_id, plaintext, name, value)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(item_id)
                .bind(plaintext as i64)
                .bind(name)
                .bind(value)
                .execute(&mut **txn)
                .await?;
            }
            StoreTxn::Pg(txn) => {
                sqlx::query(
                    "INSERT INTO items_tags (item_id, plaintext, name, value)
                     VALUES ($1, $2, $3, $4)",
                )
                .bind(item_id)
                .bind(plaintext as i16)
                .bind(name)
                .bind(value)
                .execute(&mut **txn)
                .await?;
            }
        }
        Ok(())
    }

    async fn delete_item(
        &mut self,
        profile_id: i64,
        kind: i16,
        category: &[u8],
        name: &[u8],
    ) -> Result<u64, UpgradeError> {
        let affected = match self {
            StoreTxn::Sqlite(txn) => sqlx::query(
                "DELETE FROM items
                 WHERE profile_id = ?1 AND kind = ?2 AND category = ?3 AND name = ?4",
            )
            .bind(profile_id)
            .bind(kind as i64)
            .bind(category)
            .bind(name)
            .execute(&mut **txn)
            .await?
            .rows_affected(),
            StoreTxn::Pg(txn) => sqlx::query(
                "DELETE FROM items
                 WHERE profile_id = $1 AND kind = $2 AND category = $3 AND name = $4",
            )
            .bind(profile_id)
            .bind(kind)
            .bind(category)
            .bind(name)
            .execute(&mut **txn)
            .await?
            .rows_affected(),
        };
        Ok(affected)
    }
}

fn decode_item_row<R>(row: &R) -> Result<(i64, Vec<u8>, Vec<u8>), UpgradeError>
where
    R: Row,
    for<'c> i64: sqlx::Decode<'c, R::Database> + sqlx::Type<R::Database>,
    for<'c> Vec<u8>: sqlx::Decode<'c, R::Database> + sqlx::Type<R::Database>,
    usize: sqlx::ColumnIndex<R>,
{
    Ok((
        row.try_get::<i64, _>(0)?,
        row.try_get::<Vec<u8>, _>(1)?,
        row.try_get::<Vec<u8>, _>(2)?,
    ))
}
