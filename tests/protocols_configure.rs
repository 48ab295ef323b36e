//! Protocols Configure

use base64ct::{Base64UrlUnpadded, Encoding};
use dwn_engine::protocols::{
    Action, ActionRule, Actor, ConfigureBuilder, Definition, ProtocolType, QueryBuilder, RuleSet,
};
use dwn_engine::provider::KeyStore;
use dwn_engine::{Error, endpoint};
use http::StatusCode;
use test_node::ProviderImpl;
use test_node::key_store::ALICE_DID;

// Should allow a protocol definition with no schema or data format.
#[tokio::test]
async fn minimal() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice configures a minimal protocol.
    // --------------------------------------------------
    let configure = ConfigureBuilder::new()
        .definition(Definition::new("http://minimal.xyz"))
        .build(&alice_keyring)
        .await
        .expect("should build");

    let reply = endpoint::handle(&ALICE_DID, configure, &provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);
}

// Should return 401 when the message signature is invalid.
#[tokio::test]
async fn bad_signature() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let mut configure = ConfigureBuilder::new()
        .definition(Definition::new("http://minimal.xyz"))
        .build(&alice_keyring)
        .await
        .expect("should build");

    // tamper with the signature
    configure.authorization.signature.signatures[0].signature =
        Base64UrlUnpadded::encode_string(&[0u8; 64]);

    let Err(Error::Unauthorized(_)) = endpoint::handle(&ALICE_DID, configure, &provider).await
    else {
        panic!("should be Unauthorized");
    };
}

// Should overwrite an existing configuration when the timestamp is newer,
// and reject older configurations.
#[tokio::test]
async fn overwrite_older() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let definition = Definition::new("http://minimal.xyz");

    // --------------------------------------------------
    // Alice creates an older configuration but does not send it.
    // --------------------------------------------------
    let older = ConfigureBuilder::new()
        .definition(definition.clone())
        .build(&alice_keyring)
        .await
        .expect("should build");

    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

    // --------------------------------------------------
    // Alice configures a newer configuration.
    // --------------------------------------------------
    let newer = ConfigureBuilder::new()
        .definition(definition.clone())
        .build(&alice_keyring)
        .await
        .expect("should build");
    let reply = endpoint::handle(&ALICE_DID, newer, &provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice attempts to configure the older configuration and fails.
    // --------------------------------------------------
    let Err(Error::Conflict(_)) = endpoint::handle(&ALICE_DID, older, &provider).await else {
        panic!("should be Conflict");
    };

    // --------------------------------------------------
    // Control: only the most recent configuration exists.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter("http://minimal.xyz")
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
}

// Should reject a definition whose structure is inconsistent.
#[tokio::test]
async fn invalid_structure() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    drop(provider);

    // `of` cannot be set when `who` is "anyone"
    let definition = Definition::new("http://bad.xyz")
        .add_type("post", ProtocolType::default())
        .add_rule("post", RuleSet {
            actions: Some(vec![ActionRule {
                who: Some(Actor::Anyone),
                role: None,
                of: Some("post".to_string()),
                can: vec![Action::Create],
            }]),
            ..RuleSet::default()
        });

    let result = ConfigureBuilder::new().definition(definition).build(&alice_keyring).await;
    assert!(result.is_err());

    // a rule set must be declared as a type
    let definition = Definition::new("http://bad.xyz").add_rule("post", RuleSet::default());
    let result = ConfigureBuilder::new().definition(definition).build(&alice_keyring).await;
    assert!(result.is_err());
}

// Anonymous requestors only see published definitions.
#[tokio::test]
async fn query_published() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice configures one unpublished and one published protocol.
    // --------------------------------------------------
    let configure = ConfigureBuilder::new()
        .definition(Definition::new("http://private.xyz"))
        .build(&alice_keyring)
        .await
        .expect("should build");
    let reply = endpoint::handle(&ALICE_DID, configure, &provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let configure = ConfigureBuilder::new()
        .definition(Definition::new("http://public.xyz").published(true))
        .build(&alice_keyring)
        .await
        .expect("should build");
    let reply = endpoint::handle(&ALICE_DID, configure, &provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // An anonymous query sees only the published protocol.
    // --------------------------------------------------
    let query =
        QueryBuilder::new().authorize(false).build(&alice_keyring).await.expect("should build");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].descriptor.definition.protocol, "http://public.xyz");

    // --------------------------------------------------
    // Alice sees both.
    // --------------------------------------------------
    let query = QueryBuilder::new().build(&alice_keyring).await.expect("should build");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 2);
}
