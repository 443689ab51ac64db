//! Migration strategies.
//!
//! All three strategies share one template: connect, transition the schema,
//! unwrap the wallet key, write config and profile, rewrite item rows in
//! batches, finalize, then drive the post-upgrade transformer over the
//! resulting store. The strategies differ only in how source wallets map
//! onto target databases and profiles.

use std::io::{IsTerminal, Write};

use secrecy::SecretString;
use zeroize::Zeroizing;

use crate::codec;
use crate::crypto::{self, MasterKey};
use crate::db::{DbConnection, Wallet, postgres};
use crate::error::UpgradeError;
use crate::keys::{IndyKey, IndyMetadata, ProfileKey};
use crate::progress::Progress;

mod dbpw;
mod mwst_profiles;
mod mwst_stores;

pub use dbpw::DbpwStrategy;
pub use mwst_profiles::MwstAsProfilesStrategy;
pub use mwst_stores::MwstAsStoresStrategy;

/// Items rewritten (and reported) per batch unless overridden.
pub const DEFAULT_BATCH_SIZE: u32 = 50;

/// Config marker present once a database is fully upgraded.
pub(crate) fn is_upgraded(config: &std::collections::HashMap<String, String>) -> bool {
    config.get("version").map(String::as_str) == Some("1")
}

/// Read a wallet's metadata and unwrap its key bundle.
pub async fn fetch_indy_key<W>(
    wallet: &mut W,
    passphrase: &SecretString,
) -> Result<IndyKey, UpgradeError>
where
    W: Wallet + ?Sized,
{
    let raw = wallet.get_metadata().await?;
    let metadata = IndyMetadata::from_json(&raw)?;
    IndyKey::from_metadata(&metadata, passphrase)
}

/// Write the pass-key descriptor (and optional default profile) to config.
pub async fn create_config<C>(
    conn: &mut C,
    default_profile: Option<&str>,
    indy_key: &IndyKey,
) -> Result<(), UpgradeError>
where
    C: DbConnection + ?Sized,
{
    conn.create_config(&indy_key.pass_key_uri(), default_profile)
        .await
}

/// Build the profile key from a wallet's bundle, wrap it under `wrap_master`
/// and insert the profile. For sub-wallet profiles the wrapping key is the
/// base wallet's master key, since that is what opens the shared store.
pub async fn init_profile<W>(
    wallet: &mut W,
    name: &str,
    indy_key: &IndyKey,
    wrap_master: &MasterKey,
) -> Result<ProfileKey, UpgradeError>
where
    W: Wallet + ?Sized,
{
    let profile_key = ProfileKey::from_bundle(&indy_key.bundle);
    let cbor = Zeroizing::new(profile_key.to_cbor()?);
    let enc_key = crypto::encrypt_merged(&cbor, wrap_master.as_ref(), None)?;
    wallet.insert_profile(name, &enc_key).await?;
    Ok(profile_key)
}

/// Rewrite pending source rows under the profile key, one transactional
/// batch at a time, until the source drains.
pub async fn update_items<W>(
    wallet: &mut W,
    indy_key: &IndyKey,
    profile_key: &ProfileKey,
    batch_size: u32,
) -> Result<u64, UpgradeError>
where
    W: Wallet + ?Sized,
{
    let b64 = wallet.base64_values();
    let mut progress = Progress::new("items migrated:", batch_size as u64);

    loop {
        let rows = wallet.fetch_pending_items(batch_size).await?;
        if rows.is_empty() {
            break;
        }

        let mut batch = Vec::with_capacity(rows.len());
        for row in &rows {
            let item = codec::decrypt_item(row, &indy_key.bundle, b64)?;
            batch.push(codec::update_item(&item, profile_key)?);
        }
        wallet.update_items(&batch).await?;
        progress.update(batch.len() as u64);
    }

    let count = progress.count();
    progress.report();
    Ok(count)
}

/// Ask the operator before destroying the legacy database.
///
/// When no terminal is attached and confirmation was not waived, the safe
/// default is to keep the database.
pub(crate) fn confirm_legacy_deletion(skip_confirmation: bool) -> Result<bool, UpgradeError> {
    if skip_confirmation {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        return Ok(false);
    }

    print!("Delete the legacy Indy wallet database? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

/// Delete the source database after a fully covered migration.
pub(crate) async fn delete_source_db(
    uri: &str,
    skip_confirmation: bool,
) -> Result<(), UpgradeError> {
    if !confirm_legacy_deletion(skip_confirmation)? {
        println!("Leaving the legacy Indy wallet database in place");
        return Ok(());
    }
    postgres::drop_database(uri).await?;
    println!("Deleted the legacy Indy wallet database");
    Ok(())
}
