use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "askar-migrate",
    author,
    version,
    about = "Offline migration of Indy-SDK wallet databases to the Askar store layout.",
    long_about = "Offline migration of Indy-SDK wallet databases to the Askar store layout. \
        Take the owning agent offline first: the migration rewrites the database in place."
)]
pub struct Cli {
    #[arg(
        long,
        value_enum,
        help = "Migration strategy, depending on database type and wallet management mode."
    )]
    pub strategy: Strategy,

    #[arg(
        long,
        help = "URI of the database to be migrated (sqlite:// or postgres://)."
    )]
    pub uri: String,

    #[arg(long, help = "Name of the wallet to migrate (dbpw strategy).")]
    pub wallet_name: Option<String>,

    #[arg(long, help = "Key of the wallet to migrate (dbpw strategy).")]
    pub wallet_key: Option<String>,

    #[arg(
        long,
        help = "Name of the base wallet (mwst-as-profiles strategy). The base wallet and its subwallets will be migrated."
    )]
    pub base_wallet_name: Option<String>,

    #[arg(long, help = "Key of the base wallet (mwst-as-profiles strategy).")]
    pub base_wallet_key: Option<String>,

    #[arg(
        long,
        help = "JSON object mapping wallet names to wallet keys for every wallet to migrate (mwst-as-stores strategy)."
    )]
    pub wallet_keys: Option<String>,

    #[arg(
        long,
        default_value_t = crate::strategy::DEFAULT_BATCH_SIZE,
        help = "Number of rows rewritten per transaction."
    )]
    pub batch_size: u32,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Migrate only the wallets with declared keys; leftover wallets stay in the legacy database, which is then never deleted."
    )]
    pub allow_missing_wallet: bool,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Delete the legacy Indy wallet database after a fully covered migration."
    )]
    pub delete_indy_wallets: bool,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Do not prompt for confirmation before deleting the legacy database."
    )]
    pub skip_confirmation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    /// One database holds one wallet; upgraded in place.
    Dbpw,
    /// Wallets sharing one table become profiles of a shared store.
    MwstAsProfiles,
    /// Wallets sharing one table become separate stores.
    MwstAsStores,
}
