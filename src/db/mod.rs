//! Database driver abstraction.
//!
//! The migration talks to storage through two capabilities, selected by the
//! strategy via dependency injection rather than a class hierarchy:
//!
//! - [`DbConnection`] owns the schema lifecycle of one database: the
//!   transition to the new relational layout and its finalization.
//! - [`Wallet`] scopes row access to a single source wallet. For the
//!   embedded store the connection is its own wallet; in
//!   multi-wallet-single-table deployments a wallet handle pairs a legacy
//!   read handle with a target write handle and filters by `wallet_id`.

use std::collections::HashMap;

use async_trait::async_trait;
use url::Url;

use crate::codec::{IndyRow, UpdatedItem};
use crate::error::UpgradeError;

pub mod postgres;
pub mod sqlite;

pub use postgres::{PgConnection, PgMwstConnection, PgMwstStoresWallet, PgMwstWallet};
pub use sqlite::SqliteConnection;

/// Legacy tables dropped by `finish_upgrade`.
pub const LEGACY_TABLES: [&str; 4] = ["items_old", "metadata", "tags_encrypted", "tags_plaintext"];

/// Schema lifecycle of one database.
#[async_trait]
pub trait DbConnection: Send {
    /// Establish the connection. Idempotent.
    async fn connect(&mut self) -> Result<(), UpgradeError>;

    /// Check for existence of a table.
    async fn find_table(&mut self, name: &str) -> Result<bool, UpgradeError>;

    /// Create the new tables inside one transaction.
    ///
    /// When the database was already (partially) upgraded, returns the
    /// current `config` mapping instead so the caller can resume. Fails with
    /// [`UpgradeError::NotIndyWallet`] when the source `metadata` table is
    /// required but absent.
    async fn pre_upgrade(&mut self) -> Result<HashMap<String, String>, UpgradeError>;

    /// Upsert the pass-key derivation string and optional default profile.
    async fn create_config(
        &mut self,
        key: &str,
        default_profile: Option<&str>,
    ) -> Result<(), UpgradeError>;

    /// One atomic block: drop the legacy tables and write the version marker.
    async fn finish_upgrade(&mut self) -> Result<(), UpgradeError>;

    /// Release the connection. Idempotent.
    async fn close(&mut self) -> Result<(), UpgradeError>;

    /// The database URI this connection was opened with.
    fn uri(&self) -> &str;
}

/// Row access scoped to a single source wallet.
#[async_trait]
pub trait Wallet: Send {
    /// Fetch the wallet's metadata blob (already Base64-unwrapped for the
    /// network store).
    async fn get_metadata(&mut self) -> Result<Vec<u8>, UpgradeError>;

    /// Upsert the wallet's profile; the returned id is the durable
    /// `profile_id` used for all subsequent item writes.
    async fn insert_profile(&mut self, name: &str, enc_key: &[u8]) -> Result<i64, UpgradeError>;

    /// Select up to `limit` pending rows. Restartable: called in a loop
    /// until an empty batch is produced.
    async fn fetch_pending_items(&mut self, limit: u32) -> Result<Vec<IndyRow>, UpgradeError>;

    /// Write one batch inside a single transaction: insert each new item,
    /// insert its tag rows, and delete the consumed legacy rows.
    async fn update_items(&mut self, batch: &[UpdatedItem]) -> Result<(), UpgradeError>;

    /// Whether item `type`/`name` columns are Base64-wrapped at the storage
    /// layer (the network store variant).
    fn base64_values(&self) -> bool;
}

/// Swap the database name of a URI, keeping scheme, credentials and host.
pub fn replace_db_name(uri: &str, name: &str) -> Result<String, UpgradeError> {
    let mut url = Url::parse(uri).map_err(|_| UpgradeError::InvalidUri(uri.to_string()))?;
    url.set_path(&format!("/{name}"));
    Ok(url.into())
}

/// The database name (final path segment) of a URI.
pub fn db_name(uri: &str) -> Result<String, UpgradeError> {
    let url = Url::parse(uri).map_err(|_| UpgradeError::InvalidUri(uri.to_string()))?;
    let name = url.path().trim_start_matches('/');
    if name.is_empty() {
        return Err(UpgradeError::InvalidUri(uri.to_string()));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_database_name() {
        let uri = "postgres://user:pw@db-host:5432/wallets";
        assert_eq!(
            replace_db_name(uri, "alice").unwrap(),
            "postgres://user:pw@db-host:5432/alice"
        );
        assert_eq!(db_name(uri).unwrap(), "wallets");
    }

    #[test]
    fn rejects_uri_without_database() {
        assert!(db_name("postgres://user@host/").is_err());
    }
}
