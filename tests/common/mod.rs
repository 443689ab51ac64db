//! Shared fixtures: build synthetic legacy Indy wallet databases with known
//! key material, the way the Indy SDK storage layer wrote them.

#![allow(dead_code)]

use std::path::Path;
use std::str::FromStr;

use secrecy::SecretString;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Row};

use askar_migrate::crypto::{self, KEY_LEN, SALT_LEN};
use askar_migrate::keys::IndyKeyBundle;

const LEGACY_DDL: &[&str] = &[
    "CREATE TABLE metadata (value NOT NULL)",
    "CREATE TABLE items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        type NOT NULL,
        name NOT NULL,
        value NOT NULL,
        key NOT NULL
    )",
    "CREATE TABLE tags_encrypted (
        name NOT NULL,
        value NOT NULL,
        item_id INTEGER NOT NULL REFERENCES items (id) ON DELETE CASCADE
    )",
    "CREATE TABLE tags_plaintext (
        name NOT NULL,
        value NOT NULL,
        item_id INTEGER NOT NULL REFERENCES items (id) ON DELETE CASCADE
    )",
];

/// One logical record to seed into the legacy wallet.
pub struct TestItem {
    pub category: String,
    pub name: String,
    pub value: Vec<u8>,
    pub tags_enc: Vec<(String, String)>,
    pub tags_plain: Vec<(String, String)>,
}

impl TestItem {
    pub fn new(category: &str, name: &str, value: impl Into<Vec<u8>>) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            value: value.into(),
            tags_enc: Vec::new(),
            tags_plain: Vec::new(),
        }
    }

    pub fn tag_enc(mut self, name: &str, value: &str) -> Self {
        self.tags_enc.push((name.to_string(), value.to_string()));
        self
    }

    pub fn tag_plain(mut self, name: &str, value: &str) -> Self {
        self.tags_plain.push((name.to_string(), value.to_string()));
        self
    }
}

/// A synthetic wallet: passphrase, salt and the seven content keys.
pub struct TestWallet {
    passphrase: String,
    pub keys: [[u8; KEY_LEN]; 7],
    pub salt: [u8; SALT_LEN],
}

impl TestWallet {
    pub fn generate() -> Self {
        Self {
            passphrase: "insecure".to_string(),
            keys: std::array::from_fn(|_| crypto::random_bytes()),
            salt: crypto::random_bytes(),
        }
    }

    pub fn passphrase(&self) -> SecretString {
        SecretString::from(self.passphrase.clone())
    }

    pub fn bundle(&self) -> IndyKeyBundle {
        IndyKeyBundle {
            type_key: self.keys[0],
            name_key: self.keys[1],
            value_key: self.keys[2],
            item_hmac_key: self.keys[3],
            tag_name_key: self.keys[4],
            tag_value_key: self.keys[5],
            tag_hmac_key: self.keys[6],
        }
    }

    fn packed_bundle(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        rmp::encode::write_array_len(&mut buf, 7).unwrap();
        for key in &self.keys {
            rmp::encode::write_bin(&mut buf, key).unwrap();
        }
        buf
    }

    /// The metadata JSON blob: the msgpack bundle encrypted under the
    /// Argon2i master key, plus the salt.
    fn metadata_json(&self) -> String {
        let master =
            crypto::derive_master_key_from_passphrase(&self.passphrase(), &self.salt).unwrap();
        let keys_enc =
            crypto::encrypt_merged(&self.packed_bundle(), master.as_ref(), None).unwrap();
        serde_json::json!({
            "keys": keys_enc,
            "master_key_salt": self.salt.to_vec(),
        })
        .to_string()
    }

    /// Write a populated legacy wallet database at `path`.
    pub async fn write_sqlite(&self, path: &Path, items: &[TestItem]) {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .unwrap()
            .create_if_missing(true)
            .foreign_keys(true);
        let mut conn = options.connect().await.unwrap();

        for ddl in LEGACY_DDL {
            sqlx::query(ddl).execute(&mut conn).await.unwrap();
        }

        sqlx::query("INSERT INTO metadata (value) VALUES (?1)")
            .bind(self.metadata_json())
            .execute(&mut conn)
            .await
            .unwrap();

        let bundle = self.bundle();
        for item in items {
            let item_key = crypto::random_bytes::<KEY_LEN>();
            let enc_type = crypto::encrypt_merged(
                item.category.as_bytes(),
                &bundle.type_key,
                Some(&bundle.item_hmac_key),
            )
            .unwrap();
            let enc_name = crypto::encrypt_merged(
                item.name.as_bytes(),
                &bundle.name_key,
                Some(&bundle.item_hmac_key),
            )
            .unwrap();
            let enc_value = crypto::encrypt_merged(&item.value, &item_key, None).unwrap();
            let enc_key = crypto::encrypt_merged(&item_key, &bundle.value_key, None).unwrap();

            let inserted = sqlx::query(
                "INSERT INTO items (type, name, value, key) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&enc_type)
            .bind(&enc_name)
            .bind(&enc_value)
            .bind(&enc_key)
            .execute(&mut conn)
            .await
            .unwrap();
            let item_id = inserted.last_insert_rowid();

            for (tag_name, tag_value) in &item.tags_enc {
                let enc_tag_name = crypto::encrypt_merged(
                    tag_name.as_bytes(),
                    &bundle.tag_name_key,
                    Some(&bundle.tag_hmac_key),
                )
                .unwrap();
                let enc_tag_value = crypto::encrypt_merged(
                    tag_value.as_bytes(),
                    &bundle.tag_value_key,
                    Some(&bundle.tag_hmac_key),
                )
                .unwrap();
                sqlx::query(
                    "INSERT INTO tags_encrypted (name, value, item_id) VALUES (?1, ?2, ?3)",
                )
                .bind(&enc_tag_name)
                .bind(&enc_tag_value)
                .bind(item_id)
                .execute(&mut conn)
                .await
                .unwrap();
            }
            for (tag_name, tag_value) in &item.tags_plain {
                let enc_tag_name = crypto::encrypt_merged(
                    tag_name.as_bytes(),
                    &bundle.tag_name_key,
                    Some(&bundle.tag_hmac_key),
                )
                .unwrap();
                sqlx::query(
                    "INSERT INTO tags_plaintext (name, value, item_id) VALUES (?1, ?2, ?3)",
                )
                .bind(&enc_tag_name)
                .bind(tag_value.as_bytes())
                .bind(item_id)
                .execute(&mut conn)
                .await
                .unwrap();
            }
        }

        sqlx::Connection::close(conn).await.unwrap();
    }
}

/// Open a raw connection to an (existing) sqlite database.
pub async fn open_sqlite(path: &Path) -> sqlx::SqliteConnection {
    SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

pub async fn table_exists(conn: &mut sqlx::SqliteConnection, name: &str) -> bool {
    let row = sqlx::query("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")
        .bind(name)
        .fetch_one(conn)
        .await
        .unwrap();
    row.try_get::<i64, _>(0).unwrap() > 0
}

pub async fn config_value(conn: &mut sqlx::SqliteConnection, name: &str) -> Option<String> {
    sqlx::query("SELECT value FROM config WHERE name = ?1")
        .bind(name)
        .fetch_optional(conn)
        .await
        .unwrap()
        .map(|row| row.try_get::<String, _>(0).unwrap())
}
