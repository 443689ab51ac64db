use std::collections::BTreeMap;
use std::process::ExitCode;

use clap::Parser;
use secrecy::SecretString;

use askar_migrate::cli::{Cli, Strategy};
use askar_migrate::db::{PgConnection, SqliteConnection};
use askar_migrate::error::UpgradeError;
use askar_migrate::exit_codes;
use askar_migrate::strategy::{DbpwStrategy, MwstAsProfilesStrategy, MwstAsStoresStrategy};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Sqlite,
    Postgres,
}

fn usage(message: impl Into<String>) -> UpgradeError {
    UpgradeError::Usage(message.into())
}

fn uri_scheme(uri: &str) -> Result<Scheme, UpgradeError> {
    if uri.starts_with("sqlite:") {
        Ok(Scheme::Sqlite)
    } else if uri.starts_with("postgres:") || uri.starts_with("postgresql:") {
        Ok(Scheme::Postgres)
    } else {
        Err(usage("URI scheme must be one of: sqlite, postgres"))
    }
}

async fn run(cli: Cli) -> Result<(), UpgradeError> {
    let scheme = uri_scheme(&cli.uri)?;

    match cli.strategy {
        Strategy::Dbpw => {
            let wallet_name = cli
                .wallet_name
                .ok_or_else(|| usage("--wallet-name is required for the dbpw strategy"))?;
            let wallet_key = SecretString::from(
                cli.wallet_key
                    .ok_or_else(|| usage("--wallet-key is required for the dbpw strategy"))?,
            );

            match scheme {
                Scheme::Sqlite => {
                    DbpwStrategy::new(
                        SqliteConnection::new(&cli.uri),
                        wallet_name,
                        wallet_key,
                        cli.batch_size,
                    )
                    .run()
                    .await
                }
                Scheme::Postgres => {
                    DbpwStrategy::new(
                        PgConnection::new(&cli.uri),
                        wallet_name,
                        wallet_key,
                        cli.batch_size,
                    )
                    .run()
                    .await
                }
            }
        }

        Strategy::MwstAsProfiles => {
            if scheme != Scheme::Postgres {
                return Err(usage(
                    "the mwst-as-profiles strategy is only valid for Postgres",
                ));
            }
            let base_wallet_name = cli.base_wallet_name.ok_or_else(|| {
                usage("--base-wallet-name is required for the mwst-as-profiles strategy")
            })?;
            let base_wallet_key = SecretString::from(cli.base_wallet_key.ok_or_else(|| {
                usage("--base-wallet-key is required for the mwst-as-profiles strategy")
            })?);

            MwstAsProfilesStrategy::new(
                cli.uri,
                base_wallet_name,
                base_wallet_key,
                cli.batch_size,
                cli.delete_indy_wallets,
                cli.skip_confirmation,
            )
            .run()
            .await
        }

        Strategy::MwstAsStores => {
            if scheme != Scheme::Postgres {
                return Err(usage(
                    "the mwst-as-stores strategy is only valid for Postgres",
                ));
            }
            let raw = cli
                .wallet_keys
                .ok_or_else(|| usage("--wallet-keys is required for the mwst-as-stores strategy"))?;
            let parsed: BTreeMap<String, String> = serde_json::from_str(&raw)
                .map_err(|_| usage("--wallet-keys must be a JSON object of name to key"))?;
            if parsed.is_empty() {
                return Err(usage("--wallet-keys must declare at least one wallet"));
            }
            let wallet_keys = parsed
                .into_iter()
                .map(|(name, key)| (name, SecretString::from(key)))
                .collect();

            MwstAsStoresStrategy::new(
                cli.uri,
                wallet_keys,
                cli.batch_size,
                cli.allow_missing_wallet,
                cli.delete_indy_wallets,
                cli.skip_confirmation,
            )
            .run()
            .await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error: {error}");
            exit_codes::exit_code_for_upgrade_error(&error)
        }
    }
}
