//! Network store driver.
//!
//! Three shapes of Postgres access:
//!
//! - [`PgConnection`]: one database, one wallet (DBPW). Upgraded in place,
//!   like the embedded store but with Base64-wrapped item columns.
//! - [`PgMwstConnection`]: a freshly created target database for the MWST
//!   strategies. No legacy tables exist here, so the schema transition
//!   creates the new layout directly and finalization only writes the
//!   version marker.
//! - [`PgMwstWallet`] / [`PgMwstStoresWallet`]: wallet handles pairing the
//!   shared legacy database (reads filtered by `wallet_id`) with a target
//!   database (writes). The separate-stores variant paginates with OFFSET
//!   and never deletes source rows, since several wallets share the legacy
//!   table and only some of them may be migrated.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sqlx::postgres::PgRow;
use sqlx::{Connection, Row};

use crate::codec::{IndyRow, KIND_ITEM, UpdatedItem};
use crate::db::{DbConnection, Wallet, db_name, replace_db_name};
use crate::error::UpgradeError;

/// Maintenance database used to create and drop wallet databases.
const ADMIN_DB: &str = "template1";

/// New-layout DDL for a database upgraded in place (DBPW).
const PRE_UPGRADE_DDL: &[&str] = &[
    "CREATE TABLE config (
        name TEXT NOT NULL,
        value TEXT,
        PRIMARY KEY (name)
    )",
    "CREATE TABLE profiles (
        id BIGSERIAL,
        name TEXT NOT NULL,
        reference TEXT NULL,
        profile_key BYTEA NULL,
        PRIMARY KEY (id)
    )",
    "CREATE UNIQUE INDEX ix_profile_name ON profiles (name)",
    "ALTER TABLE items RENAME TO items_old",
    "CREATE TABLE items (
        id BIGSERIAL,
        profile_id BIGINT NOT NULL,
        kind SMALLINT NOT NULL,
        category BYTEA NOT NULL,
        name BYTEA NOT NULL,
        value BYTEA NOT NULL,
        expiry TIMESTAMP NULL,
        PRIMARY KEY (id),
        FOREIGN KEY (profile_id) REFERENCES profiles (id)
            ON DELETE CASCADE ON UPDATE CASCADE
    )",
    "CREATE UNIQUE INDEX ix_items_uniq ON items (profile_id, kind, category, name)",
    "CREATE TABLE items_tags (
        id BIGSERIAL,
        item_id BIGINT NOT NULL,
        name BYTEA NOT NULL,
        value BYTEA NOT NULL,
        plaintext SMALLINT NOT NULL,
        PRIMARY KEY (id),
        FOREIGN KEY (item_id) REFERENCES items (id)
            ON DELETE CASCADE ON UPDATE CASCADE
    )",
    "CREATE INDEX ix_items_tags_item_id ON items_tags (item_id)",
    "CREATE INDEX ix_items_tags_name_enc
        ON items_tags (name, SUBSTR(value, 1, 12)) INCLUDE (item_id)
        WHERE plaintext=0",
    "CREATE INDEX ix_items_tags_name_plain
        ON items_tags (name, value) INCLUDE (item_id)
        WHERE plaintext=1",
];

/// The in-place DDL minus the legacy-table rename, for fresh target
/// databases.
fn fresh_target_ddl() -> impl Iterator<Item = &'static str> {
    PRE_UPGRADE_DDL
        .iter()
        .copied()
        .filter(|ddl| !ddl.starts_with("ALTER TABLE"))
}

const FETCH_PENDING_DBPW: &str = "
    SELECT i.id, i.type, i.name, i.value, i.key,
    (SELECT string_agg(encode(te.name::bytea, 'hex') || ':' || encode(te.value::bytea, 'hex'), ',')
        FROM tags_encrypted te WHERE te.item_id = i.id) AS tags_enc,
    (SELECT string_agg(encode(tp.name::bytea, 'hex') || ':' || encode(tp.value::bytea, 'hex'), ',')
        FROM tags_plaintext tp WHERE tp.item_id = i.id) AS tags_plain
    FROM items_old i LIMIT $1";

const FETCH_PENDING_MWST: &str = "
    SELECT i.id, i.type, i.name, i.value, i.key,
    (SELECT string_agg(encode(te.name::bytea, 'hex') || ':' || encode(te.value::bytea, 'hex'), ',')
        FROM tags_encrypted te WHERE te.item_id = i.id) AS tags_enc,
    (SELECT string_agg(encode(tp.name::bytea, 'hex') || ':' || encode(tp.value::bytea, 'hex'), ',')
        FROM tags_plaintext tp WHERE tp.item_id = i.id) AS tags_plain
    FROM items i WHERE i.wallet_id = $2 LIMIT $1";

const FETCH_PENDING_MWST_OFFSET: &str = "
    SELECT i.id, i.type, i.name, i.value, i.key,
    (SELECT string_agg(encode(te.name::bytea, 'hex') || ':' || encode(te.value::bytea, 'hex'), ',')
        FROM tags_encrypted te WHERE te.item_id = i.id) AS tags_enc,
    (SELECT string_agg(encode(tp.name::bytea, 'hex') || ':' || encode(tp.value::bytea, 'hex'), ',')
        FROM tags_plaintext tp WHERE tp.item_id = i.id) AS tags_plain
    FROM items i WHERE i.wallet_id = $2 LIMIT $1 OFFSET $3";

/// Open a plain connection to a Postgres URI.
pub async fn connect_pg(uri: &str) -> Result<sqlx::PgConnection, UpgradeError> {
    Ok(sqlx::PgConnection::connect(uri).await?)
}

/// Check for existence of a public table on a raw connection.
pub async fn table_exists(
    conn: &mut sqlx::PgConnection,
    name: &str,
) -> Result<bool, UpgradeError> {
    let row = sqlx::query(
        "SELECT EXISTS (
            SELECT FROM information_schema.tables
            WHERE table_schema = 'public' AND table_name = $1
        )",
    )
    .bind(name)
    .fetch_one(conn)
    .await?;
    Ok(row.try_get::<bool, _>(0)?)
}

/// Distinct `wallet_id`s present in a multi-wallet legacy database.
pub async fn fetch_wallet_ids(conn: &mut sqlx::PgConnection) -> Result<Vec<String>, UpgradeError> {
    let rows = sqlx::query("SELECT DISTINCT wallet_id FROM metadata ORDER BY wallet_id")
        .fetch_all(conn)
        .await?;
    rows.iter()
        .map(|row| Ok(row.try_get::<String, _>(0)?))
        .collect()
}

/// Drop a wallet database via the maintenance database.
pub async fn drop_database(uri: &str) -> Result<(), UpgradeError> {
    let name = db_name(uri)?;
    let admin_uri = replace_db_name(uri, ADMIN_DB)?;
    let mut admin = connect_pg(&admin_uri).await?;
    sqlx::query(&format!("DROP DATABASE {}", quote_ident(&name)))
        .execute(&mut admin)
        .await?;
    admin.close().await?;
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_undefined_database(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("3D000")
    )
}

/// Connect to `uri`, creating the database through the maintenance database
/// when it does not exist yet.
async fn connect_create_if_missing(uri: &str) -> Result<sqlx::PgConnection, UpgradeError> {
    match sqlx::PgConnection::connect(uri).await {
        Ok(conn) => Ok(conn),
        Err(err) if is_undefined_database(&err) => {
            let name = db_name(uri)?;
            let admin_uri = replace_db_name(uri, ADMIN_DB)?;
            let mut admin = connect_pg(&admin_uri).await?;
            sqlx::query(&format!("CREATE DATABASE {}", quote_ident(&name)))
                .execute(&mut admin)
                .await?;
            admin.close().await?;
            Ok(sqlx::PgConnection::connect(uri).await?)
        }
        Err(err) => Err(err.into()),
    }
}

/// Decode a binary column that the legacy layer may have stored either as
/// BYTEA or as TEXT (holding Base64 or raw bytes).
fn get_bytes(row: &PgRow, index: usize) -> Result<Vec<u8>, UpgradeError> {
    match row.try_get::<Vec<u8>, _>(index) {
        Ok(bytes) => Ok(bytes),
        Err(_) => Ok(row.try_get::<String, _>(index)?.into_bytes()),
    }
}

fn decode_row(row: &PgRow) -> Result<IndyRow, UpgradeError> {
    Ok(IndyRow {
        id: row.try_get(0)?,
        item_type: get_bytes(row, 1)?,
        name: get_bytes(row, 2)?,
        value: match row.try_get::<Option<Vec<u8>>, _>(3) {
            Ok(value) => value,
            Err(_) => row.try_get::<Option<String>, _>(3)?.map(String::into_bytes),
        },
        key: get_bytes(row, 4)?,
        tags_enc: row.try_get(5)?,
        tags_plain: row.try_get(6)?,
    })
}

fn decode_metadata(raw: &[u8]) -> Result<Vec<u8>, UpgradeError> {
    BASE64
        .decode(raw)
        .map_err(|_| UpgradeError::MalformedRecord("metadata".to_string()))
}

async fn fetch_metadata_row(
    conn: &mut sqlx::PgConnection,
    wallet_id: Option<&str>,
) -> Result<Vec<u8>, UpgradeError> {
    let rows = match wallet_id {
        Some(wallet_id) => {
            sqlx::query("SELECT value FROM metadata WHERE wallet_id = $1")
                .bind(wallet_id)
                .fetch_all(conn)
                .await?
        }
        None => {
            sqlx::query("SELECT value FROM metadata")
                .fetch_all(conn)
                .await?
        }
    };
    match rows.len() {
        0 => Err(UpgradeError::MissingMetadata),
        1 => decode_metadata(&get_bytes(&rows[0], 0)?),
        _ => Err(UpgradeError::DuplicateMetadata),
    }
}

async fn upsert_profile(
    conn: &mut sqlx::PgConnection,
    name: &str,
    enc_key: &[u8],
) -> Result<i64, UpgradeError> {
    sqlx::query(
        "INSERT INTO profiles (name, profile_key) VALUES ($1, $2)
         ON CONFLICT DO NOTHING",
    )
    .bind(name)
    .bind(enc_key)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query("SELECT id FROM profiles WHERE name = $1")
        .bind(name)
        .fetch_one(conn)
        .await?;
    Ok(row.try_get(0)?)
}

/// Insert one batch of rewritten items plus tags into a target connection.
/// Conflicting rows are left alone so an interrupted run can be resumed.
async fn insert_updated_items(
    conn: &mut sqlx::PgConnection,
    profile_id: i64,
    batch: &[UpdatedItem],
) -> Result<(), UpgradeError> {
    let mut tx = conn.begin().await?;
    for item in batch {
        let inserted = sqlx::query(
            "INSERT INTO items (profile_id, kind, category, name, value)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (profile_id, kind, category, name) DO NOTHING
             RETURNING id",
        )
        .bind(profile_id)
        .bind(KIND_ITEM)
        .bind(&item.category)
        .bind(&item.name)
        .bind(&item.value)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(inserted) = inserted else {
            continue;
        };
        let item_id: i64 = inserted.try_get(0)?;
        for tag in &item.tags {
            sqlx::query(
                "INSERT INTO items_tags (item_id, plaintext, name, value)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(item_id)
            .bind(tag.plaintext as i16)
            .bind(&tag.name)
            .bind(&tag.value)
            .execute(&mut *tx)
            .await?;
        }
    }
    tx.commit().await?;
    Ok(())
}

/// Network store connection for the database-per-wallet deployment.
pub struct PgConnection {
    uri: String,
    conn: Option<sqlx::PgConnection>,
    profile_id: Option<i64>,
}

impl PgConnection {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            conn: None,
            profile_id: None,
        }
    }

    fn conn(&mut self) -> Result<&mut sqlx::PgConnection, UpgradeError> {
        self.conn.as_mut().ok_or(UpgradeError::NotConnected)
    }
}

#[async_trait]
impl DbConnection for PgConnection {
    async fn connect(&mut self) -> Result<(), UpgradeError> {
        if self.conn.is_none() {
            self.conn = Some(connect_pg(&self.uri).await?);
        }
        Ok(())
    }

    async fn find_table(&mut self, name: &str) -> Result<bool, UpgradeError> {
        table_exists(self.conn()?, name).await
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
        create_config_on(self.conn()?, key, default_profile).await
    }

    async fn finish_upgrade(&mut self) -> Result<(), UpgradeError> {
        let mut tx = self.conn()?.begin().await?;
        for table in crate::db::LEGACY_TABLES {
            let cascade = if table == "items_old" { " CASCADE" } else { "" };
            sqlx::query(&format!("DROP TABLE {table}{cascade}"))
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

async fn create_config_on(
    conn: &mut sqlx::PgConnection,
    key: &str,
    default_profile: Option<&str>,
) -> Result<(), UpgradeError> {
    let mut tx = conn.begin().await?;
    let mut entries = vec![("key", key)];
    if let Some(name) = default_profile {
        entries.push(("default_profile", name));
    }
    for (name, value) in entries {
        sqlx::query(
            "INSERT INTO config (name, value) VALUES ($1, $2)
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

#[async_trait]
impl Wallet for PgConnection {
    async fn get_metadata(&mut self) -> Result<Vec<u8>, UpgradeError> {
        fetch_metadata_row(self.conn()?, None).await
    }

    async fn insert_profile(&mut self, name: &str, enc_key: &[u8]) -> Result<i64, UpgradeError> {
        let id = upsert_profile(self.conn()?, name, enc_key).await?;
        self.profile_id = Some(id);
        Ok(id)
    }

    async fn fetch_pending_items(&mut self, limit: u32) -> Result<Vec<IndyRow>, UpgradeError> {
        let rows = sqlx::query(FETCH_PENDING_DBPW)
            .bind(limit as i64)
            .fetch_all(self.conn()?)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn update_items(&mut self, batch: &[UpdatedItem]) -> Result<(), UpgradeError> {
        let profile_id = self.profile_id.ok_or(UpgradeError::ProfileNotInitialized)?;
        let conn = self.conn()?;

        let mut tx = conn.begin().await?;
        for item in batch {
            let inserted = sqlx::query(
                "INSERT INTO items (profile_id, kind, category, name, value)
                 VALUES ($1, $2, $3, $4, $5) RETURNING id",
            )
            .bind(profile_id)
            .bind(KIND_ITEM)
            .bind(&item.category)
            .bind(&item.name)
            .bind(&item.value)
            .fetch_one(&mut *tx)
            .await?;
            let item_id: i64 = inserted.try_get(0)?;

            for tag in &item.tags {
                sqlx::query(
                    "INSERT INTO items_tags (item_id, plaintext, name, value)
                     VALUES ($1, $2, $3, $4)",
                )
                .bind(item_id)
                .bind(tag.plaintext as i16)
                .bind(&tag.name)
                .bind(&tag.value)
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query("DELETE FROM items_old WHERE id = $1")
                .bind(item.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn base64_values(&self) -> bool {
        true
    }
}

/// Freshly created target database for the MWST strategies.
pub struct PgMwstConnection {
    uri: String,
    conn: Option<sqlx::PgConnection>,
}

impl PgMwstConnection {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            conn: None,
        }
    }

    pub(crate) fn conn_mut(&mut self) -> Result<&mut sqlx::PgConnection, UpgradeError> {
        self.conn.as_mut().ok_or(UpgradeError::NotConnected)
    }
}

#[async_trait]
impl DbConnection for PgMwstConnection {
    async fn connect(&mut self) -> Result<(), UpgradeError> {
        if self.conn.is_none() {
            self.conn = Some(connect_create_if_missing(&self.uri).await?);
        }
        Ok(())
    }

    async fn find_table(&mut self, name: &str) -> Result<bool, UpgradeError> {
        table_exists(self.conn_mut()?, name).await
    }

    async fn pre_upgrade(&mut self) -> Result<HashMap<String, String>, UpgradeError> {
        if self.find_table("config").await? {
            let rows = sqlx::query("SELECT name, value FROM config")
                .fetch_all(self.conn_mut()?)
                .await?;
            let mut config = HashMap::new();
            for row in rows {
                let name: String = row.try_get(0)?;
                let value: Option<String> = row.try_get(1)?;
                config.insert(name, value.unwrap_or_default());
            }
            return Ok(config);
        }

        let mut tx = self.conn_mut()?.begin().await?;
        for ddl in fresh_target_ddl() {
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
        create_config_on(self.conn_mut()?, key, default_profile).await
    }

    async fn finish_upgrade(&mut self) -> Result<(), UpgradeError> {
        sqlx::query(
            "INSERT INTO config (name, value) VALUES ('version', '1')
             ON CONFLICT (name) DO NOTHING",
        )
        .execute(self.conn_mut()?)
        .await?;
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

/// Wallet handle for the MWST-as-profiles strategy: reads (and deletes)
/// `wallet_id`-filtered rows from the shared legacy database, writes into a
/// target store under one profile.
pub struct PgMwstWallet<'a> {
    source: &'a mut sqlx::PgConnection,
    target: &'a mut PgMwstConnection,
    wallet_id: String,
    profile_id: Option<i64>,
}

impl<'a> PgMwstWallet<'a> {
    pub fn new(
        source: &'a mut sqlx::PgConnection,
        target: &'a mut PgMwstConnection,
        wallet_id: impl Into<String>,
    ) -> Self {
        Self {
            source,
            target,
            wallet_id: wallet_id.into(),
            profile_id: None,
        }
    }
}

#[async_trait]
impl Wallet for PgMwstWallet<'_> {
    async fn get_metadata(&mut self) -> Result<Vec<u8>, UpgradeError> {
        fetch_metadata_row(&mut *self.source, Some(&self.wallet_id)).await
    }

    async fn insert_profile(&mut self, name: &str, enc_key: &[u8]) -> Result<i64, UpgradeError> {
        let id = upsert_profile(self.target.conn_mut()?, name, enc_key).await?;
        self.profile_id = Some(id);
        Ok(id)
    }

    async fn fetch_pending_items(&mut self, limit: u32) -> Result<Vec<IndyRow>, UpgradeError> {
        let rows = sqlx::query(FETCH_PENDING_MWST)
            .bind(limit as i64)
            .bind(&self.wallet_id)
            .fetch_all(&mut *self.source)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn update_items(&mut self, batch: &[UpdatedItem]) -> Result<(), UpgradeError> {
        let profile_id = self.profile_id.ok_or(UpgradeError::ProfileNotInitialized)?;
        insert_updated_items(self.target.conn_mut()?, profile_id, batch).await?;

        // Source rows live in a different database, so their deletion cannot
        // share the target transaction; conflict-tolerant inserts above keep
        // a resumed run consistent.
        let mut tx = self.source.begin().await?;
        for item in batch {
            sqlx::query("DELETE FROM items WHERE id = $1")
                .bind(item.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn base64_values(&self) -> bool {
        true
    }
}

/// Wallet handle for the MWST-as-stores strategy. The shared legacy table is
/// left untouched: reads advance by OFFSET and nothing is deleted.
pub struct PgMwstStoresWallet<'a> {
    source: &'a mut sqlx::PgConnection,
    target: &'a mut PgMwstConnection,
    wallet_id: String,
    profile_id: Option<i64>,
    offset: i64,
}

impl<'a> PgMwstStoresWallet<'a> {
    pub fn new(
        source: &'a mut sqlx::PgConnection,
        target: &'a mut PgMwstConnection,
        wallet_id: impl Into<String>,
    ) -> Self {
        Self {
            source,
            target,
            wallet_id: wallet_id.into(),
            profile_id: None,
            offset: 0,
        }
    }
}

#[async_trait]
impl Wallet for PgMwstStoresWallet<'_> {
    async fn get_metadata(&mut self) -> Result<Vec<u8>, UpgradeError> {
        fetch_metadata_row(&mut *self.source, Some(&self.wallet_id)).await
    }

    async fn insert_profile(&mut self, name: &str, enc_key: &[u8]) -> Result<i64, UpgradeError> {
        let id = upsert_profile(self.target.conn_mut()?, name, enc_key).await?;
        self.profile_id = Some(id);
        Ok(id)
    }

    async fn fetch_pending_items(&mut self, limit: u32) -> Result<Vec<IndyRow>, UpgradeError> {
        let rows = sqlx::query(FETCH_PENDING_MWST_OFFSET)
            .bind(limit as i64)
            .bind(&self.wallet_id)
            .bind(self.offset)
            .fetch_all(&mut *self.source)
            .await?;
        self.offset += rows.len() as i64;
        rows.iter().map(decode_row).collect()
    }

    async fn update_items(&mut self, batch: &[UpdatedItem]) -> Result<(), UpgradeError> {
        let profile_id = self.profile_id.ok_or(UpgradeError::ProfileNotInitialized)?;
        insert_updated_items(self.target.conn_mut()?, profile_id, batch).await
    }

    fn base64_values(&self) -> bool {
        true
    }
}
