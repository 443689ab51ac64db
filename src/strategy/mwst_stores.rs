//! Multi-wallet-single-table as separate Askar stores.
//!
//! Every declared wallet gets its own freshly created target database. The
//! shared legacy table is read-only here: several wallets may keep living
//! in it (under `--allow-missing-wallet`), so nothing is deleted until the
//! optional whole-database drop at the end.

use std::collections::BTreeMap;

use secrecy::SecretString;
use sqlx::Connection;
use tracing::{info, warn};

use crate::db::postgres::{self, PgMwstConnection, PgMwstStoresWallet};
use crate::db::{DbConnection, replace_db_name};
use crate::error::UpgradeError;
use crate::strategy::{
    create_config, delete_source_db, fetch_indy_key, init_profile, is_upgraded, update_items,
};
use crate::transform::convert_items_to_askar;

pub struct MwstAsStoresStrategy {
    uri: String,
    wallet_keys: BTreeMap<String, SecretString>,
    batch_size: u32,
    allow_missing_wallet: bool,
    delete_indy_wallets: bool,
    skip_confirmation: bool,
}

impl MwstAsStoresStrategy {
    pub fn new(
        uri: impl Into<String>,
        wallet_keys: BTreeMap<String, SecretString>,
        batch_size: u32,
        allow_missing_wallet: bool,
        delete_indy_wallets: bool,
        skip_confirmation: bool,
    ) -> Self {
        Self {
            uri: uri.into(),
            wallet_keys,
            batch_size,
            allow_missing_wallet,
            delete_indy_wallets,
            skip_confirmation,
        }
    }

    /// Verify the declared wallet mapping against the wallets actually in
    /// the database. A declared wallet missing from the database is always
    /// an error; a database wallet missing from the mapping is soft only
    /// under `allow_missing_wallet`. Returns whether any were left behind.
    async fn check_wallet_alignment(
        &self,
        source: &mut sqlx::PgConnection,
    ) -> Result<bool, UpgradeError> {
        let db_wallet_ids = postgres::fetch_wallet_ids(source).await?;

        for name in self.wallet_keys.keys() {
            if !db_wallet_ids.contains(name) {
                return Err(UpgradeError::WalletAlignment(name.clone()));
            }
        }

        let mut missing = false;
        for wallet_id in &db_wallet_ids {
            if !self.wallet_keys.contains_key(wallet_id) {
                if !self.allow_missing_wallet {
                    return Err(UpgradeError::MissingWallet(wallet_id.clone()));
                }
                warn!(wallet = %wallet_id, "no key provided; wallet will not be migrated");
                missing = true;
            }
        }
        if missing {
            println!("Running upgrade without migrating all wallets");
        }
        Ok(missing)
    }

    pub async fn run(self) -> Result<(), UpgradeError> {
        let mut source = postgres::connect_pg(&self.uri).await?;
        if !postgres::table_exists(&mut source, "metadata").await? {
            return Err(UpgradeError::NotIndyWallet);
        }

        let missing = self.check_wallet_alignment(&mut source).await?;

        for (wallet_name, wallet_key) in &self.wallet_keys {
            println!("Migrating wallet {wallet_name}...");
            let target_uri = replace_db_name(&self.uri, wallet_name)?;
            let mut target = PgMwstConnection::new(target_uri.clone());
            target.connect().await?;

            let config = target.pre_upgrade().await?;
            if is_upgraded(&config) {
                info!(wallet = %wallet_name, "target store already upgraded");
            } else {
                let indy_key = {
                    let mut wallet =
                        PgMwstStoresWallet::new(&mut source, &mut target, wallet_name);
                    fetch_indy_key(&mut wallet, wallet_key).await?
                };
                create_config(&mut target, Some(wallet_name.as_str()), &indy_key).await?;
                {
                    let mut wallet =
                        PgMwstStoresWallet::new(&mut source, &mut target, wallet_name);
                    let profile_key =
                        init_profile(&mut wallet, wallet_name, &indy_key, &indy_key.master)
                            .await?;
                    update_items(&mut wallet, &indy_key, &profile_key, self.batch_size).await?;
                }
                target.finish_upgrade().await?;
            }
            target.close().await?;

            convert_items_to_askar(&target_uri, wallet_key, None).await?;
        }

        source.close().await?;

        if missing {
            println!("Unmigrated wallets remain; the legacy database will not be deleted");
        } else if self.delete_indy_wallets {
            delete_source_db(&self.uri, self.skip_confirmation).await?;
        }
        Ok(())
    }
}
