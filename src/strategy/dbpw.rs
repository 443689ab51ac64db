//! Database-per-wallet strategy: one legacy database holds one wallet, and
//! the upgrade happens in place.

use secrecy::SecretString;
use tracing::info;

use crate::db::{DbConnection, Wallet};
use crate::error::UpgradeError;
use crate::strategy::{create_config, fetch_indy_key, init_profile, is_upgraded, update_items};
use crate::transform::convert_items_to_askar;

pub struct DbpwStrategy<C> {
    conn: C,
    wallet_name: String,
    wallet_key: SecretString,
    batch_size: u32,
}

impl<C> DbpwStrategy<C>
where
    C: DbConnection + Wallet,
{
    pub fn new(
        conn: C,
        wallet_name: impl Into<String>,
        wallet_key: SecretString,
        batch_size: u32,
    ) -> Self {
        Self {
            conn,
            wallet_name: wallet_name.into(),
            wallet_key,
            batch_size,
        }
    }

    pub async fn run(mut self) -> Result<(), UpgradeError> {
        self.conn.connect().await?;

        let result = self.migrate().await;
        let close_result = self.conn.close().await;
        result.and(close_result)?;

        convert_items_to_askar(self.conn.uri(), &self.wallet_key, None).await
    }

    async fn migrate(&mut self) -> Result<(), UpgradeError> {
        let config = self.conn.pre_upgrade().await?;
        if is_upgraded(&config) {
            info!(wallet = %self.wallet_name, "database already upgraded; skipping row migration");
            return Ok(());
        }

        let indy_key = fetch_indy_key(&mut self.conn, &self.wallet_key).await?;
        create_config(&mut self.conn, Some(self.wallet_name.as_str()), &indy_key).await?;
        let profile_key = init_profile(
            &mut self.conn,
            &self.wallet_name,
            &indy_key,
            &indy_key.master,
        )
        .await?;
        update_items(&mut self.conn, &indy_key, &profile_key, self.batch_size).await?;
        self.conn.finish_upgrade().await
    }
}
