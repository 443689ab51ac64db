//! Post-upgrade record transformer.
//!
//! After the schema transition the store still holds records under the
//! legacy `Indy::*` categories. This pass rewrites them one category at a
//! time into the new conventions, in batches of one transaction each. The
//! source record is always removed before its replacement is inserted, so
//! the pass is idempotent: a re-run finds the source categories empty.
//!
//! Structural problems (unparseable ids, missing companions) raise typed
//! errors; records are never skipped or guessed at.

use std::sync::OnceLock;

use regex::Regex;
use secrecy::SecretString;

use crate::error::UpgradeError;
use crate::progress::Progress;
use crate::store::{Entry, Store};

/// Records converted per transaction.
const BATCH_SIZE: i64 = 50;

fn schema_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w+):2:([^:]+):([^:]+)$").expect("static pattern"))
}

fn cred_def_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w+):3:CL:([^:]+):([^:]+)$").expect("static pattern"))
}

/// Convert every legacy-categorised record of an upgraded store.
pub async fn convert_items_to_askar(
    uri: &str,
    pass_key: &SecretString,
    profile: Option<&str>,
) -> Result<(), UpgradeError> {
    println!("Opening wallet with Askar...");
    let mut store = Store::open(uri, pass_key, profile).await?;

    update_keys(&mut store).await?;
    update_master_secret(&mut store).await?;
    update_dids(&mut store).await?;
    update_raw_category(&mut store, "Indy::Schema", "schema", "stored schemas").await?;
    update_credential_definitions(&mut store).await?;
    update_raw_category(
        &mut store,
        "Indy::RevocationRegistryDefinition",
        "revocation_reg_def",
        "revocation registry definitions",
    )
    .await?;
    update_raw_category(
        &mut store,
        "Indy::RevocationRegistryDefinitionPrivate",
        "revocation_reg_def_private",
        "revocation registry keys",
    )
    .await?;
    update_raw_category(
        &mut store,
        "Indy::RevocationRegistry",
        "revocation_reg",
        "revocation registry states",
    )
    .await?;
    update_raw_category(
        &mut store,
        "Indy::RevocationRegistryInfo",
        "revocation_reg_info",
        "revocation registry info",
    )
    .await?;
    update_credentials(&mut store).await?;

    println!("Closing wallet");
    store.close().await?;
    Ok(())
}

async fn update_keys(store: &mut Store) -> Result<(), UpgradeError> {
    println!("Updating keys...");
    let mut progress = Progress::new("keys updated:", BATCH_SIZE as u64);

    loop {
        let mut txn = store.transaction().await?;
        let rows = txn.fetch_all("Indy::Key", Some(BATCH_SIZE)).await?;
        if rows.is_empty() {
            break;
        }
        for row in rows {
            txn.remove("Indy::Key", &row.name).await?;

            let metadata = match txn.fetch("Indy::KeyMetadata", &row.name).await? {
                Some(meta) => {
                    txn.remove("Indy::KeyMetadata", &meta.name).await?;
                    Some(unwrap_value_field(&meta)?)
                }
                None => None,
            };

            let value = row.value_json()?;
            let signkey = value
                .get("signkey")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| UpgradeError::MalformedRecord(row.name.clone()))?;
            let decoded = bs58::decode(signkey).into_vec()?;
            if decoded.len() < 32 {
                return Err(UpgradeError::MalformedRecord(row.name.clone()));
            }

            txn.insert_key(&row.name, &decoded[..32], metadata.as_deref())
                .await?;
            progress.update(1);
        }
        txn.commit().await?;
    }

    progress.report();
    Ok(())
}

async fn update_master_secret(store: &mut Store) -> Result<(), UpgradeError> {
    println!("Updating master secret(s)...");
    let mut progress = Progress::new("master secrets updated:", BATCH_SIZE as u64);

    let mut txn = store.transaction().await?;
    let secrets = txn.fetch_all("Indy::MasterSecret", None).await?;
    if secrets.len() > 1 {
        return Err(UpgradeError::DuplicateMasterSecret);
    }
    if let Some(row) = secrets.first() {
        txn.remove("Indy::MasterSecret", &row.name).await?;
        txn.insert("master_secret", "default", &row.value, &[])
            .await?;
        progress.update(1);
    }
    txn.commit().await?;

    progress.report();
    Ok(())
}

async fn update_dids(store: &mut Store) -> Result<(), UpgradeError> {
    println!("Updating DIDs...");
    let mut progress = Progress::new("DIDs updated:", BATCH_SIZE as u64);

    loop {
        let mut txn = store.transaction().await?;
        let rows = txn.fetch_all("Indy::Did", Some(BATCH_SIZE)).await?;
        if rows.is_empty() {
            break;
        }
        for row in rows {
            txn.remove("Indy::Did", &row.name).await?;

            let info = row.value_json()?;
            let did = info
                .get("did")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| UpgradeError::MalformedRecord(row.name.clone()))?
                .to_string();
            let verkey = info
                .get("verkey")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| UpgradeError::MalformedRecord(row.name.clone()))?
                .to_string();

            // Metadata is itself JSON when it parses, a bare string otherwise.
            let metadata = match txn.fetch("Indy::DidMetadata", &row.name).await? {
                Some(meta) => {
                    txn.remove("Indy::DidMetadata", &meta.name).await?;
                    let raw = unwrap_value_field(&meta)?;
                    serde_json::from_str::<serde_json::Value>(&raw)
                        .unwrap_or(serde_json::Value::String(raw))
                }
                None => serde_json::Value::Null,
            };

            let tags = vec![("verkey".to_string(), verkey.clone())];
            txn.insert_json(
                "did",
                &row.name,
                &serde_json::json!({
                    "did": did,
                    "verkey": verkey,
                    "metadata": metadata,
                }),
                &tags,
            )
            .await?;
            progress.update(1);
        }
        txn.commit().await?;
    }

    progress.report();
    Ok(())
}

async fn update_credential_definitions(store: &mut Store) -> Result<(), UpgradeError> {
    println!("Updating stored credential definitions...");
    let mut progress = Progress::new("credential definitions updated:", BATCH_SIZE as u64);

    loop {
        let mut txn = store.transaction().await?;
        let rows = txn
            .fetch_all("Indy::CredentialDefinition", Some(BATCH_SIZE))
            .await?;
        if rows.is_empty() {
            break;
        }
        for row in rows {
            txn.remove("Indy::CredentialDefinition", &row.name).await?;

            let schema_id = txn
                .fetch("Indy::SchemaId", &row.name)
                .await?
                .ok_or_else(|| UpgradeError::MissingSchemaId(row.name.clone()))?;
            let schema_id_value = String::from_utf8(schema_id.value.clone())
                .map_err(|_| UpgradeError::InvalidEncoding)?;

            let tags = vec![("schema_id".to_string(), schema_id_value)];
            txn.insert("credential_def", &row.name, &row.value, &tags)
                .await?;

            if let Some(private) = txn
                .fetch("Indy::CredentialDefinitionPrivateKey", &row.name)
                .await?
            {
                txn.remove("Indy::CredentialDefinitionPrivateKey", &private.name)
                    .await?;
                txn.insert("credential_def_private", &private.name, &private.value, &[])
                    .await?;
            }

            if let Some(proof) = txn
                .fetch("Indy::CredentialDefinitionCorrectnessProof", &row.name)
                .await?
            {
                txn.remove("Indy::CredentialDefinitionCorrectnessProof", &proof.name)
                    .await?;
                let value = proof
                    .value_json()?
                    .get("value")
                    .cloned()
                    .ok_or_else(|| UpgradeError::MalformedRecord(proof.name.clone()))?;
                txn.insert_json("credential_def_key_proof", &proof.name, &value, &[])
                    .await?;
            }
            progress.update(1);
        }
        txn.commit().await?;
    }

    progress.report();
    Ok(())
}

async fn update_credentials(store: &mut Store) -> Result<(), UpgradeError> {
    println!("Updating stored credentials...");
    let mut progress = Progress::new("credentials updated:", BATCH_SIZE as u64);

    loop {
        let mut txn = store.transaction().await?;
        let rows = txn.fetch_all("Indy::Credential", Some(BATCH_SIZE)).await?;
        if rows.is_empty() {
            break;
        }
        for row in rows {
            txn.remove("Indy::Credential", &row.name).await?;
            let tags = credential_tags(&row.value_json()?)?;
            txn.insert("credential", &row.name, &row.value, &tags)
                .await?;
            progress.update(1);
        }
        txn.commit().await?;
    }

    progress.report();
    Ok(())
}

/// Re-categorise records whose value is copied through unchanged.
async fn update_raw_category(
    store: &mut Store,
    from: &str,
    to: &str,
    what: &str,
) -> Result<(), UpgradeError> {
    println!("Updating {what}...");
    let mut progress = Progress::new(format!("{what} updated:"), BATCH_SIZE as u64);

    loop {
        let mut txn = store.transaction().await?;
        let rows = txn.fetch_all(from, Some(BATCH_SIZE)).await?;
        if rows.is_empty() {
            break;
        }
        for row in rows {
            txn.remove(from, &row.name).await?;
            txn.insert(to, &row.name, &row.value, &[]).await?;
            progress.update(1);
        }
        txn.commit().await?;
    }

    progress.report();
    Ok(())
}

/// Pull the `value` field out of a metadata record's JSON envelope.
fn unwrap_value_field(entry: &Entry) -> Result<String, UpgradeError> {
    let value = entry.value_json()?;
    value
        .get("value")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| UpgradeError::MalformedRecord(entry.name.clone()))
}

/// Derive the tag set for a migrated credential from its value JSON.
pub fn credential_tags(
    cred_data: &serde_json::Value,
) -> Result<Vec<(String, String)>, UpgradeError> {
    let schema_id = cred_data
        .get("schema_id")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| UpgradeError::MalformedId {
            kind: "credential schema",
            id: String::new(),
        })?;
    let schema_parts =
        schema_id_re()
            .captures(schema_id)
            .ok_or_else(|| UpgradeError::MalformedId {
                kind: "credential schema",
                id: schema_id.to_string(),
            })?;

    let cred_def_id = cred_data
        .get("cred_def_id")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| UpgradeError::MalformedId {
            kind: "credential definition",
            id: String::new(),
        })?;
    let cdef_parts =
        cred_def_id_re()
            .captures(cred_def_id)
            .ok_or_else(|| UpgradeError::MalformedId {
                kind: "credential definition",
                id: cred_def_id.to_string(),
            })?;

    let rev_reg_id = cred_data
        .get("rev_reg_id")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("None")
        .to_string();

    let mut tags = vec![
        ("schema_id".to_string(), schema_id.to_string()),
        ("schema_issuer_did".to_string(), schema_parts[1].to_string()),
        ("schema_name".to_string(), schema_parts[2].to_string()),
        ("schema_version".to_string(), schema_parts[3].to_string()),
        ("issuer_did".to_string(), cdef_parts[1].to_string()),
        ("cred_def_id".to_string(), cred_def_id.to_string()),
        ("rev_reg_id".to_string(), rev_reg_id),
    ];

    let values = cred_data
        .get("values")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| UpgradeError::MalformedRecord("credential values".to_string()))?;
    for (attr_name, attr_value) in values {
        let raw = attr_value
            .get("raw")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                UpgradeError::MalformedRecord(format!("credential attr {attr_name}"))
            })?;
        let attr_name = attr_name.replace(' ', "");
        tags.push((format!("attr::{attr_name}::value"), raw.to_string()));
    }

    Ok(tags)
}
