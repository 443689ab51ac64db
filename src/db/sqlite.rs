//! Embedded-file store driver.
//!
//! One SQLite database holds exactly one wallet, so the connection is its
//! own [`Wallet`] handle and the schema transition renames the legacy
//! `items` table in place.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, Row};

use crate::codec::{IndyRow, KIND_ITEM, UpdatedItem};
use crate::db::{DbConnection, Wallet};
use crate::error::UpgradeError;

/// New-layout DDL, applied inside one transaction after the legacy `items`
/// table is renamed out of the way.
const PRE_UPGRADE_DDL: &[&str] = &[
    "CREATE TABLE config (
        name TEXT NOT NULL,
        value TEXT,
        PRIMARY KEY (name)
    )",
    "CREATE TABLE profiles (
        id INTEGER NOT NULL,
        name TEXT NOT NULL,
        reference TEXT NULL,
        profile_key BLOB NULL,
        PRIMARY KEY (id)
    )",
    "CREATE UNIQUE INDEX ix_profile_name ON profiles (name)",
    "ALTER TABLE items RENAME TO items_old",
    "CREATE TABLE items (
        id INTEGER NOT NULL,
        profile_id INTEGER NOT NULL,
        kind INTEGER NOT NULL,
        category BLOB NOT NULL,
        name BLOB NOT NULL,
        value BLOB NOT NULL,
        expiry DATETIME NULL,
        PRIMARY KEY (id),
        FOREIGN KEY (profile_id) REFERENCES profiles (id)
            ON DELETE CASCADE ON UPDATE CASCADE
    )",
    "CREATE UNIQUE INDEX ix_items_uniq ON items (profile_id, kind, category, name)",
    "CREATE TABLE items_tags (
        id INTEGER NOT NULL,
        item_id INTEGER NOT NULL,
        name BLOB NOT NULL,
        value BLOB NOT NULL,
        plaintext BOOLEAN NOT NULL,
        PRIMARY KEY (id),
        FOREIGN KEY (item_id) REFERENCES items (id)
            ON DELETE CASCADE ON UPDATE CASCADE
    )",
    "CREATE INDEX ix_items_tags_item_id ON items_tags (item_id)",
    "CREATE INDEX ix_items_tags_name_enc ON items_tags
        (name, SUBSTR(value, 1, 12)) WHERE plaintext=0",
    "CREATE INDEX ix_items_tags_name_plain ON items_tags (name, value) WHERE plaintext=1",
];

const FETCH_PENDING: &str = "
    SELECT i.id, i.type, i.name, i.value, i.key,
    (SELECT GROUP_CONCAT(HEX(te.name) || ':' || HEX(te.value))
        FROM tags_encrypted te WHERE te.item_id = i.id) AS tags_enc,
    (SELECT GROUP_CONCAT(HEX(tp.name) || ':' || HEX(tp.value))
        FROM tags_plaintext tp WHERE tp.item_id = i.id) AS tags_plain
    FROM items_old i LIMIT ?1";

pub struct SqliteConnection {
    uri: String,
    conn: Option<sqlx::SqliteConnection>,
    profile_id: Option<i64>,
}

impl SqliteConnection {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            conn: None,
            profile_id: None,
        }
    }

    fn conn(&mut self) -> Result<&mut sqlx::SqliteConnection, UpgradeError> {
        self.conn.as_mut().ok_or(UpgradeError::NotConnected)
    }
}

#[async_trait]
impl DbConnection for SqliteConnection {
    async fn connect(&mut self) -> Result<(), UpgradeError> {
        if self.conn.is_none() {
            let options = SqliteConnectOptions::from_str(&self.uri)?.foreign_keys(true);
            self.conn = Some(options.connect().await?);
        }
        Ok(())
    }

    async fn find_table(&mut self, name: &str) -> Result<bool, UpgradeError> {
        let row =
            sqlx::query("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")
                .bind(name)
                .fetch_one(self.conn()?)
                .await?;
        Ok(row.try_get::<i64, _>(0)? > 0)
    }

    async fn pre_upgrade(&mut self) -> Result<HashMap<String, String>, UpgradeError> {
        // An existing config table marks a finished or resumable upgrade;
        // the legacy metadata table is gone once the upgrade finalizes.
        if self.find_table("config").await? {
            let rows = sqlx::query("SELECT name, value FROM config")
                .fetch_all(self.conn()?)
                .await?;
            let mut config = HashMap::new();
            for row in rows {
                let name: String = row.try_get(0)?;
                let value: Option<String> = row.try_get(1)?;
                config.insert(name, value.unwrap_or_default());
            }
            return Ok(config);
        }

        if !self.find_table("metadata").await? {
            return Err(UpgradeError::NotIndyWallet);
        }

        let mut tx = self.conn()?.begin().await?;
        for ddl in PRE_UPGRADE_DDL {
            sqlx::query(ddl).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(HashMap::new())
    }

    async fn create_config(
        &mut self,
        key: &str,
        default_profile: Option<&str>,
    ) -> Result<(), UpgradeError> {
        let mut tx = self.conn()?.begin().await?;
        let mut entries = vec![("key", key)];
        if let Some(name) = default_profile {
            entries.push(("default_profile", name));
        }
        for (name, value) in entries {
            sqlx::query(
                "INSERT INTO config (name, value) VALUES (?1, ?2)
                 ON CONFLICT (name) DO UPDATE SET value = excluded.value",
            )
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn finish_upgrade(&mut self) -> Result<(), UpgradeError> {
        let mut tx = self.conn()?.begin().await?;
        for table in crate::db::LEGACY_TABLES {
            sqlx::query(&format!("DROP TABLE {table}"))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("INSERT INTO config (name, value) VALUES ('version', '1')")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), UpgradeError> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        Ok(())
    }

    fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait]
impl Wallet for SqliteConnection {
    async fn get_metadata(&mut self) -> Result<Vec<u8>, UpgradeError> {
        let rows = sqlx::query("SELECT value FROM metadata")
            .fetch_all(self.conn()?)
            .await?;
        match rows.len() {
            0 => Err(UpgradeError::MissingMetadata),
            1 => Ok(rows[0].try_get::<Vec<u8>, _>(0)?),
            _ => Err(UpgradeError::DuplicateMetadata),
        }
    }

    async fn insert_profile(&mut self, name: &str, enc_key: &[u8]) -> Result<i64, UpgradeError> {
        let conn = self.conn()?;
        sqlx::query(
            "INSERT INTO profiles (name, profile_key) VALUES (?1, ?2)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(enc_key)
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query("SELECT id FROM profiles WHERE name = ?1")
            .bind(name)
            .fetch_one(conn)
            .await?;
        let id: i64 = row.try_get(0)?;
        self.profile_id = Some(id);
        Ok(id)
    }

    async fn fetch_pending_items(&mut self, limit: u32) -> Result<Vec<IndyRow>, UpgradeError> {
        let rows = sqlx::query(FETCH_PENDING)
            .bind(limit as i64)
            .fetch_all(self.conn()?)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(IndyRow {
                    id: row.try_get(0)?,
                    item_type: row.try_get(1)?,
                    name: row.try_get(2)?,
                    value: row.try_get(3)?,
                    key: row.try_get(4)?,
                    tags_enc: row.try_get(5)?,
                    tags_plain: row.try_get(6)?,
                })
            })
            .collect()
    }

    async fn update_items(&mut self, batch: &[UpdatedItem]) -> Result<(), UpgradeError> {
        let profile_id = self.profile_id.ok_or(UpgradeError::ProfileNotInitialized)?;

        let mut tx = self.conn()?.begin().await?;
        for item in batch {
            let inserted = sqlx::query(
                "INSERT INTO items (profile_id, kind, category, name, value)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(profile_id)
            .bind(KIND_ITEM as i64)
            .bind(&item.category)
            .bind(&item.name)
            .bind(&item.value)
            .execute(&mut *tx)
            .await?;
            let item_id = inserted.last_insert_rowid();

            for tag in &item.tags {
                sqlx::query(
                    "INSERT INTO items_tags (item_id, plaintext, name, value)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(item_id)
                .bind(tag.plaintext as i64)
                .bind(&tag.name)
                .bind(&tag.value)
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query("DELETE FROM items_old WHERE id = ?1")
                .bind(item.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn base64_values(&self) -> bool {
        false
    }
}
