//! Messages Read

use dwn_engine::provider::KeyStore;
use dwn_engine::records::{Data, WriteBuilder};
use dwn_engine::store::EntryType;
use dwn_engine::{Error, Message, endpoint};
use http::StatusCode;
use test_node::ProviderImpl;
use test_node::key_store::{ALICE_DID, BOB_DID};

// The owner can fetch any stored message by CID, record data included.
#[tokio::test]
async fn read_by_cid() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let data = b"a record to fetch by CID";
    let write = WriteBuilder::new()
        .data(Data::from(data.to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let message_cid = write.cid().expect("should have cid");

    let reply = endpoint::handle(&ALICE_DID, write, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice reads the message back by its CID.
    // --------------------------------------------------
    let read = dwn_engine::messages::ReadBuilder::new()
        .message_cid(&message_cid)
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(&ALICE_DID, read, &provider).await.expect("should read");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entry = body.entry.expect("should have entry");
    assert_eq!(entry.message_cid, message_cid);

    let EntryType::Write(_) = entry.message else {
        panic!("should be a `RecordsWrite`");
    };
    assert_eq!(entry.data.expect("should have data").into_inner(), data.to_vec());
}

// A non-owner without a grant cannot read messages.
#[tokio::test]
async fn non_owner_requires_grant() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");

    let write = WriteBuilder::new()
        .data(Data::from(b"owner only".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let message_cid = write.cid().expect("should have cid");
    endpoint::handle(&ALICE_DID, write, &provider).await.expect("should write");

    let read = dwn_engine::messages::ReadBuilder::new()
        .message_cid(&message_cid)
        .build(&bob_keyring)
        .await
        .expect("should create read");
    let Err(Error::Unauthorized(_)) = endpoint::handle(&ALICE_DID, read, &provider).await else {
        panic!("should be Unauthorized");
    };
}
