//! Messages Subscribe

use futures::StreamExt;
use dwn_engine::provider::KeyStore;
use dwn_engine::records::{Data, WriteBuilder};
use dwn_engine::{Interface, Message, endpoint};
use http::StatusCode;
use serde_json::json;
use test_node::ProviderImpl;
use test_node::key_store::{ALICE_DID, BOB_DID};

// The owner can subscribe to their own event stream.
#[tokio::test]
async fn owner_events() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice subscribes to her own event stream.
    // --------------------------------------------------
    let filter = dwn_engine::messages::MessagesFilter::new().interface(Interface::Records);
    let subscribe = dwn_engine::messages::SubscribeBuilder::new()
        .add_filter(filter)
        .build(&alice_keyring)
        .await
        .expect("should build");
    let reply = endpoint::handle(&ALICE_DID, subscribe, &provider).await.expect("should subscribe");
    assert_eq!(reply.status.code, StatusCode::OK);

    let mut subscribe_reply = reply.body.expect("should have body");

    // --------------------------------------------------
    // Alice writes a record.
    // --------------------------------------------------
    let data = serde_json::to_vec(&json!({
        "message": "test record write",
    }))
    .expect("should serialize");

    let write = WriteBuilder::new()
        .data(Data::from(data))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let message_cid = write.cid().expect("should have cid");

    let reply = endpoint::handle(&ALICE_DID, write, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // The event is in the event log.
    // --------------------------------------------------
    let query = dwn_engine::messages::QueryBuilder::new()
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let query_reply = reply.body.expect("should have body");
    let entries = query_reply.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0], message_cid);

    // --------------------------------------------------
    // The subscriber receives the matching event.
    // --------------------------------------------------
    let event = subscribe_reply.subscription.next().await.expect("should have event");
    assert_eq!(message_cid, event.cid().expect("should have cid"));
}

// A non-owner subscriber requires a grant.
#[tokio::test]
async fn non_owner_requires_grant() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");

    let subscribe = dwn_engine::messages::SubscribeBuilder::new()
        .build(&bob_keyring)
        .await
        .expect("should build");

    let Err(dwn_engine::Error::Unauthorized(_)) =
        endpoint::handle(&ALICE_DID, subscribe, &provider).await
    else {
        panic!("should be Unauthorized");
    };
}
