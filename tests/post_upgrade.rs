//! Post-upgrade transformer coverage: every legacy category lands under its
//! new name with the right bodies, tags and companions.

mod common;

use sqlx::Row;

use askar_migrate::db::SqliteConnection;
use askar_migrate::error::UpgradeError;
use askar_migrate::store::Store;
use askar_migrate::strategy::DbpwStrategy;
use common::{TestItem, TestWallet};

const CRED_DEF_NAME: &str = "cred-def-0";
const SCHEMA_ID: &str = "Did1:2:MySchema:1.0";
const CRED_DEF_ID: &str = "Did2:3:CL:17:tag";

fn signing_keypair() -> (String, Vec<u8>) {
    // The legacy layer stored sign keys as Base58 over secret || public.
    let seed = askar_migrate::crypto::random_bytes::<32>();
    let public = askar_migrate::crypto::random_bytes::<32>();
    let mut full = seed.to_vec();
    full.extend_from_slice(&public);
    (bs58::encode(&full).into_string(), seed.to_vec())
}

fn credential_value() -> String {
    serde_json::json!({
        "schema_id": SCHEMA_ID,
        "cred_def_id": CRED_DEF_ID,
        "values": {
            "first name": {"raw": "A", "encoded": "82"},
            "lastname": {"raw": "B", "encoded": "83"},
        },
    })
    .to_string()
}

async fn migrate(uri: &str, wallet: &TestWallet) -> Result<(), UpgradeError> {
    DbpwStrategy::new(
        SqliteConnection::new(uri),
        "issuer",
        wallet.passphrase(),
        50,
    )
    .run()
    .await
}

#[tokio::test]
async fn converts_every_legacy_category() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("wallet.db");
    let uri = format!("sqlite://{}", db.display());

    let (signkey_b58, seed) = signing_keypair();
    let wallet = TestWallet::generate();
    let items = vec![
        TestItem::new(
            "Indy::Key",
            "8wZcEriaNLNKtteJvx7f8i",
            format!("{{\"signkey\":\"{signkey_b58}\"}}"),
        ),
        TestItem::new(
            "Indy::KeyMetadata",
            "8wZcEriaNLNKtteJvx7f8i",
            "{\"value\":\"agent signing key\"}",
        ),
        TestItem::new("Indy::MasterSecret", "issuer", "link-secret-bytes"),
        TestItem::new("Indy::Schema", SCHEMA_ID, "{\"attrNames\":[\"first name\"]}"),
        TestItem::new("Indy::CredentialDefinition", CRED_DEF_NAME, "{\"primary\":{}}"),
        TestItem::new("Indy::SchemaId", CRED_DEF_NAME, SCHEMA_ID),
        TestItem::new(
            "Indy::CredentialDefinitionPrivateKey",
            CRED_DEF_NAME,
            "{\"p_key\":{}}",
        ),
        TestItem::new(
            "Indy::CredentialDefinitionCorrectnessProof",
            CRED_DEF_NAME,
            "{\"value\":{\"c\":\"99\"}}",
        ),
        TestItem::new("Indy::RevocationRegistryDefinition", "rev-def-0", "{\"maxCredNum\":10}"),
        TestItem::new("Indy::RevocationRegistryDefinitionPrivate", "rev-def-0", "{\"gamma\":\"g\"}"),
        TestItem::new("Indy::RevocationRegistry", "rev-def-0", "{\"accum\":\"a\"}"),
        TestItem::new("Indy::RevocationRegistryInfo", "rev-def-0", "{\"curr_id\":3}"),
        TestItem::new("Indy::Credential", "cred-1", credential_value()),
    ];
    wallet.write_sqlite(&db, &items).await;

    migrate(&uri, &wallet).await.unwrap();

    let mut store = Store::open(&uri, &wallet.passphrase(), None).await.unwrap();
    let mut txn = store.transaction().await.unwrap();

    // Key records become kind-1 entries holding the Ed25519 seed.
    let key = txn
        .fetch_key("8wZcEriaNLNKtteJvx7f8i")
        .await
        .unwrap()
        .expect("key migrated");
    assert_eq!(key.alg, "ed25519");
    assert_eq!(key.seed.as_slice(), seed.as_slice());
    assert_eq!(key.metadata.as_deref(), Some("agent signing key"));

    // The single master secret lands under the fixed name.
    let master_secret = txn
        .fetch("master_secret", "default")
        .await
        .unwrap()
        .expect("master secret migrated");
    assert_eq!(master_secret.value, b"link-secret-bytes");

    let schema = txn.fetch("schema", SCHEMA_ID).await.unwrap().unwrap();
    assert_eq!(schema.value, b"{\"attrNames\":[\"first name\"]}");

    let cred_def = txn
        .fetch("credential_def", CRED_DEF_NAME)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cred_def.value, b"{\"primary\":{}}");
    assert_eq!(
        cred_def.tags,
        vec![("schema_id".to_string(), SCHEMA_ID.to_string())]
    );

    let private = txn
        .fetch("credential_def_private", CRED_DEF_NAME)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(private.value, b"{\"p_key\":{}}");

    let proof = txn
        .fetch("credential_def_key_proof", CRED_DEF_NAME)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(proof.value_json().unwrap(), serde_json::json!({"c": "99"}));

    for (category, body) in [
        ("revocation_reg_def", "{\"maxCredNum\":10}"),
        ("revocation_reg_def_private", "{\"gamma\":\"g\"}"),
        ("revocation_reg", "{\"accum\":\"a\"}"),
        ("revocation_reg_info", "{\"curr_id\":3}"),
    ] {
        let entry = txn.fetch(category, "rev-def-0").await.unwrap().unwrap();
        assert_eq!(entry.value, body.as_bytes());
    }

    // Credential body is copied raw; tags come from the id derivation.
    let cred = txn.fetch("credential", "cred-1").await.unwrap().unwrap();
    assert_eq!(cred.value, credential_value().as_bytes());
    let tag = |name: &str| {
        cred.tags
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(tag("schema_id").as_deref(), Some(SCHEMA_ID));
    assert_eq!(tag("schema_issuer_did").as_deref(), Some("Did1"));
    assert_eq!(tag("schema_name").as_deref(), Some("MySchema"));
    assert_eq!(tag("schema_version").as_deref(), Some("1.0"));
    assert_eq!(tag("issuer_did").as_deref(), Some("Did2"));
    assert_eq!(tag("cred_def_id").as_deref(), Some(CRED_DEF_ID));
    assert_eq!(tag("rev_reg_id").as_deref(), Some("None"));
    assert_eq!(tag("attr::firstname::value").as_deref(), Some("A"));
    assert_eq!(tag("attr::lastname::value").as_deref(), Some("B"));
    txn.commit().await.unwrap();

    // Every rewritten legacy category drained. (Schema id companions are
    // only read for the tag and stay in place.)
    for category in [
        "Indy::Key",
        "Indy::KeyMetadata",
        "Indy::MasterSecret",
        "Indy::Schema",
        "Indy::CredentialDefinition",
        "Indy::CredentialDefinitionPrivateKey",
        "Indy::CredentialDefinitionCorrectnessProof",
        "Indy::RevocationRegistryDefinition",
        "Indy::RevocationRegistryDefinitionPrivate",
        "Indy::RevocationRegistry",
        "Indy::RevocationRegistryInfo",
        "Indy::Credential",
    ] {
        assert!(
            store.scan(category).await.unwrap().is_empty(),
            "{category} should be drained"
        );
    }
    store.close().await.unwrap();

    // The key record is the only kind-1 row.
    let mut conn = common::open_sqlite(&db).await;
    let kms_rows = sqlx::query("SELECT COUNT(*) FROM items WHERE kind = 1")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(kms_rows.try_get::<i64, _>(0).unwrap(), 1);
    sqlx::Connection::close(conn).await.unwrap();
}

#[tokio::test]
async fn duplicate_master_secret_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("wallet.db");
    let uri = format!("sqlite://{}", db.display());

    let wallet = TestWallet::generate();
    wallet
        .write_sqlite(
            &db,
            &[
                TestItem::new("Indy::MasterSecret", "one", "a"),
                TestItem::new("Indy::MasterSecret", "two", "b"),
            ],
        )
        .await;

    let err = migrate(&uri, &wallet).await.unwrap_err();
    assert!(matches!(err, UpgradeError::DuplicateMasterSecret));
}

#[tokio::test]
async fn credential_definition_without_schema_id_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("wallet.db");
    let uri = format!("sqlite://{}", db.display());

    let wallet = TestWallet::generate();
    wallet
        .write_sqlite(
            &db,
            &[TestItem::new(
                "Indy::CredentialDefinition",
                CRED_DEF_NAME,
                "{\"primary\":{}}",
            )],
        )
        .await;

    let err = migrate(&uri, &wallet).await.unwrap_err();
    assert!(matches!(err, UpgradeError::MissingSchemaId(name) if name == CRED_DEF_NAME));
}

#[tokio::test]
async fn malformed_credential_id_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("wallet.db");
    let uri = format!("sqlite://{}", db.display());

    let wallet = TestWallet::generate();
    wallet
        .write_sqlite(
            &db,
            &[TestItem::new(
                "Indy::Credential",
                "cred-bad",
                "{\"schema_id\":\"nope\",\"cred_def_id\":\"nope\",\"values\":{}}",
            )],
        )
        .await;

    let err = migrate(&uri, &wallet).await.unwrap_err();
    assert!(matches!(err, UpgradeError::MalformedId { .. }));
}
