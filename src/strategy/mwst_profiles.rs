//! Multi-wallet-single-table as Askar profiles.
//!
//! Every wallet in the shared legacy database becomes a profile: the base
//! wallet lands in its own store, and each sub-wallet becomes a profile of
//! a shared `multitenant_sub_wallet` store, all encrypted under the base
//! wallet's master key. Sub-wallet names and keys are read from the base
//! store's `wallet_record` entries after the base migration completes.

use secrecy::SecretString;
use sqlx::Connection;
use tracing::{info, warn};

use crate::db::postgres::{self, PgMwstConnection, PgMwstWallet};
use crate::db::{DbConnection, replace_db_name};
use crate::error::UpgradeError;
use crate::store::Store;
use crate::strategy::{
    create_config, delete_source_db, fetch_indy_key, init_profile, is_upgraded, update_items,
};
use crate::transform::convert_items_to_askar;

/// Store that collects all sub-wallet profiles.
const SUB_WALLET_NAME: &str = "multitenant_sub_wallet";

struct WalletInfo {
    wallet_name: String,
    wallet_id: String,
    wallet_key: SecretString,
}

pub struct MwstAsProfilesStrategy {
    uri: String,
    base_wallet_name: String,
    base_wallet_key: SecretString,
    batch_size: u32,
    delete_indy_wallets: bool,
    skip_confirmation: bool,
}

impl MwstAsProfilesStrategy {
    pub fn new(
        uri: impl Into<String>,
        base_wallet_name: impl Into<String>,
        base_wallet_key: SecretString,
        batch_size: u32,
        delete_indy_wallets: bool,
        skip_confirmation: bool,
    ) -> Self {
        Self {
            uri: uri.into(),
            base_wallet_name: base_wallet_name.into(),
            base_wallet_key,
            batch_size,
            delete_indy_wallets,
            skip_confirmation,
        }
    }

    pub async fn run(self) -> Result<(), UpgradeError> {
        let mut source = postgres::connect_pg(&self.uri).await?;
        if !postgres::table_exists(&mut source, "metadata").await? {
            return Err(UpgradeError::NotIndyWallet);
        }

        let base_uri = replace_db_name(&self.uri, &self.base_wallet_name)?;
        let sub_uri = replace_db_name(&self.uri, SUB_WALLET_NAME)?;

        let mut base_conn = PgMwstConnection::new(base_uri.clone());
        base_conn.connect().await?;
        let mut sub_conn = PgMwstConnection::new(sub_uri.clone());
        sub_conn.connect().await?;

        let base_done = is_upgraded(&base_conn.pre_upgrade().await?);
        let sub_done = is_upgraded(&sub_conn.pre_upgrade().await?);

        // The base wallet's key material also wraps every sub-wallet
        // profile, so it is needed even when the base store is done.
        let base_indy_key = {
            let mut wallet =
                PgMwstWallet::new(&mut source, &mut base_conn, &self.base_wallet_name);
            fetch_indy_key(&mut wallet, &self.base_wallet_key).await?
        };

        if base_done {
            info!(store = %self.base_wallet_name, "base store already upgraded");
        } else {
            create_config(
                &mut base_conn,
                Some(self.base_wallet_name.as_str()),
                &base_indy_key,
            )
            .await?;
            {
                let mut wallet =
                    PgMwstWallet::new(&mut source, &mut base_conn, &self.base_wallet_name);
                let profile_key = init_profile(
                    &mut wallet,
                    &self.base_wallet_name,
                    &base_indy_key,
                    &base_indy_key.master,
                )
                .await?;
                update_items(&mut wallet, &base_indy_key, &profile_key, self.batch_size).await?;
            }
            base_conn.finish_upgrade().await?;
        }
        base_conn.close().await?;
        convert_items_to_askar(&base_uri, &self.base_wallet_key, None).await?;

        // Sub-wallet names and keys live in the migrated base store.
        let wallet_info = self.get_wallet_info(&base_uri).await?;

        if sub_done {
            info!(store = SUB_WALLET_NAME, "sub-wallet store already upgraded");
        } else {
            // Downstream agents expect a "default" profile to exist.
            create_config(&mut sub_conn, Some("default"), &base_indy_key).await?;
            {
                let mut wallet = PgMwstWallet::new(&mut source, &mut sub_conn, "default");
                init_profile(&mut wallet, "default", &base_indy_key, &base_indy_key.master)
                    .await?;
            }

            for info in &wallet_info {
                let indy_key = {
                    let mut wallet =
                        PgMwstWallet::new(&mut source, &mut sub_conn, &info.wallet_name);
                    fetch_indy_key(&mut wallet, &info.wallet_key).await?
                };
                let mut wallet =
                    PgMwstWallet::new(&mut source, &mut sub_conn, &info.wallet_name);
                let profile_key = init_profile(
                    &mut wallet,
                    &info.wallet_id,
                    &indy_key,
                    &base_indy_key.master,
                )
                .await?;
                update_items(&mut wallet, &indy_key, &profile_key, self.batch_size).await?;
            }
            sub_conn.finish_upgrade().await?;
        }
        sub_conn.close().await?;

        for info in &wallet_info {
            convert_items_to_askar(&sub_uri, &self.base_wallet_key, Some(info.wallet_id.as_str()))
                .await?;
        }

        // The sub-wallets found in the base store may not cover every wallet
        // sharing the legacy table. Leftovers stay behind and veto deletion.
        let remaining: Vec<String> = postgres::fetch_wallet_ids(&mut source)
            .await?
            .into_iter()
            .filter(|id| {
                id != &self.base_wallet_name
                    && !wallet_info.iter().any(|info| &info.wallet_name == id)
            })
            .collect();
        source.close().await?;

        if !remaining.is_empty() {
            warn!(wallets = ?remaining, "wallets left unmigrated in the legacy database");
            println!(
                "Warning: {} wallet(s) were not migrated; the legacy database will not be deleted",
                remaining.len()
            );
            return Ok(());
        }

        if self.delete_indy_wallets {
            delete_source_db(&self.uri, self.skip_confirmation).await?;
        }
        Ok(())
    }

    /// Scan the migrated base store for `wallet_record` entries describing
    /// the sub-wallets.
    async fn get_wallet_info(&self, base_uri: &str) -> Result<Vec<WalletInfo>, UpgradeError> {
        let mut store = Store::open(
            base_uri,
            &self.base_wallet_key,
            Some(self.base_wallet_name.as_str()),
        )
        .await?;
        let records = store.scan("wallet_record").await?;
        store.close().await?;

        let mut info = Vec::with_capacity(records.len());
        for record in records {
            let value = record.value_json()?;
            let settings = value
                .get("settings")
                .ok_or_else(|| UpgradeError::MalformedRecord(record.name.clone()))?;
            let field = |key: &str| -> Result<String, UpgradeError> {
                settings
                    .get(key)
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| UpgradeError::MalformedRecord(record.name.clone()))
            };
            info.push(WalletInfo {
                wallet_name: field("wallet.name")?,
                wallet_key: SecretString::from(field("wallet.key")?),
                wallet_id: record.name,
            });
        }
        Ok(info)
    }
}
