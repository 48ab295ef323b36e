//! Records Subscribe

use futures::StreamExt;
use dwn_engine::provider::KeyStore;
use dwn_engine::records::{Data, RecordsFilter, SubscribeBuilder, WriteBuilder};
use dwn_engine::{Message, endpoint};
use http::StatusCode;
use test_node::ProviderImpl;
use test_node::key_store::ALICE_DID;

// The owner receives record events matching the subscription filter, and
// none after closing.
#[tokio::test]
async fn owner_subscribe() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice subscribes to records with a specific schema.
    // --------------------------------------------------
    let subscribe = SubscribeBuilder::new()
        .filter(RecordsFilter::new().schema("http://ticker.xyz"))
        .build(&alice_keyring)
        .await
        .expect("should build");
    let reply = endpoint::handle(&ALICE_DID, subscribe, &provider).await.expect("should subscribe");
    assert_eq!(reply.status.code, StatusCode::OK);

    let mut body = reply.body.expect("should have body");

    // --------------------------------------------------
    // A matching write is delivered; a non-matching one is not.
    // --------------------------------------------------
    let matching = WriteBuilder::new()
        .data(Data::from(b"tick".to_vec()))
        .schema("http://ticker.xyz")
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(&ALICE_DID, matching.clone(), &provider).await.expect("should write");

    let other = WriteBuilder::new()
        .data(Data::from(b"tock".to_vec()))
        .schema("http://other.xyz")
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(&ALICE_DID, other, &provider).await.expect("should write");

    let event = body.subscription.next().await.expect("should have event");
    assert_eq!(event.cid().unwrap(), matching.cid().unwrap());

    // --------------------------------------------------
    // After closing, no further events are delivered.
    // --------------------------------------------------
    body.subscription.close();

    let closed = WriteBuilder::new()
        .data(Data::from(b"tick again".to_vec()))
        .schema("http://ticker.xyz")
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, closed, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);
}
