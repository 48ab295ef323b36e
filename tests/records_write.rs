//! Records Write

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Duration;
use dwn_engine::provider::KeyStore;
use dwn_engine::records::{Data, QueryBuilder, RecordsFilter, WriteBuilder};
use dwn_engine::{Error, Message, endpoint};
use http::StatusCode;
use rand::RngCore;
use test_node::ProviderImpl;
use test_node::key_store::{ALICE_DID, BOB_DID};

// Should be able to update an existing record when the update has a later
// `message_timestamp`.
#[tokio::test]
async fn update_older() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice writes a record.
    // --------------------------------------------------
    let data = b"a new write record";

    let initial = WriteBuilder::new()
        .data(Data::from(data.to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(&ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Verify the record was created.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&initial.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.encoded_data, Some(Base64UrlUnpadded::encode_string(data)));

    // --------------------------------------------------
    // Alice updates the record.
    // --------------------------------------------------
    let data = b"updated write record";

    let update = WriteBuilder::from(initial.clone())
        .data(Data::from(data.to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, update.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Verify the update overwrote the original.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&update.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.encoded_data, Some(Base64UrlUnpadded::encode_string(data)));

    // the initial write is attached to the returned update
    let attached = entries[0].initial_write.as_ref().expect("should have initial write");
    assert_eq!(attached.record_id, initial.record_id);

    // --------------------------------------------------
    // Alice attempts to overwrite the latest record with an older version.
    // --------------------------------------------------
    let Err(Error::Conflict(e)) = endpoint::handle(&ALICE_DID, initial, &provider).await else {
        panic!("should be Conflict");
    };
    assert_eq!(e, "a more recent update exists");
}

// Should be able to update an existing record with an identical
// `message_timestamp` only when the message CID is larger than the
// existing one.
#[tokio::test]
async fn update_smaller_cid() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice writes a record.
    // --------------------------------------------------
    let initial = WriteBuilder::new()
        .data(Data::from(b"a new write record".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(&ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Create 2 updates with the same `message_timestamp`.
    // --------------------------------------------------
    let message_timestamp =
        initial.descriptor.base.message_timestamp + Duration::seconds(1);

    let write_1 = WriteBuilder::from(initial.clone())
        .data(Data::from(b"message 1".to_vec()))
        .message_timestamp(message_timestamp)
        .build(&alice_keyring)
        .await
        .expect("should create write");

    let write_2 = WriteBuilder::from(initial.clone())
        .data(Data::from(b"message 2".to_vec()))
        .message_timestamp(message_timestamp)
        .build(&alice_keyring)
        .await
        .expect("should create write");

    // determine the order of the writes by CID
    let mut sorted = vec![write_1.clone(), write_2.clone()];
    sorted.sort_by(|a, b| a.cid().unwrap().cmp(&b.cid().unwrap()));

    // --------------------------------------------------
    // Apply the smaller update, then the larger.
    // --------------------------------------------------
    let reply =
        endpoint::handle(&ALICE_DID, sorted[0].clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let reply =
        endpoint::handle(&ALICE_DID, sorted[1].clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // verify the larger update is the latest state
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&initial.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.descriptor.data_cid, sorted[1].descriptor.data_cid);

    // --------------------------------------------------
    // Attempt to apply the update with the smaller CID and fail.
    // --------------------------------------------------
    let Err(Error::Conflict(e)) = endpoint::handle(&ALICE_DID, sorted[0].clone(), &provider).await
    else {
        panic!("should be Conflict");
    };
    assert_eq!(e, "an update with a larger CID already exists");
}

// Should reject an update that changes an immutable property.
#[tokio::test]
async fn immutable_properties() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice writes a record with a schema.
    // --------------------------------------------------
    let initial = WriteBuilder::new()
        .data(Data::from(b"hello".to_vec()))
        .schema("http://item.xyz/schema")
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(&ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // An update changing the schema is rejected.
    // --------------------------------------------------
    let update = WriteBuilder::from(initial)
        .data(Data::from(b"world".to_vec()))
        .schema("http://other.xyz/schema")
        .build(&alice_keyring)
        .await
        .expect("should create write");

    let Err(Error::BadRequest(e)) = endpoint::handle(&ALICE_DID, update, &provider).await else {
        panic!("should be BadRequest");
    };
    assert_eq!(e, "immutable properties do not match initial write");
}

// Should accept a resubmitted message with the same reply code and without
// creating a second event.
#[tokio::test]
async fn resubmit_idempotent() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let write = WriteBuilder::new()
        .data(Data::from(b"an idempotent write".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");

    let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let reply =
        endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should resubmit");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // a single event exists for the message
    let query = dwn_engine::messages::QueryBuilder::new()
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries, vec![write.cid().expect("should compute CID")]);
}

// Should store data larger than the inline-encoding threshold in the data
// store and return it on read.
#[tokio::test]
async fn large_data() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice writes a record larger than the inline threshold.
    // --------------------------------------------------
    let mut data = vec![0u8; dwn_engine::data::MAX_ENCODED_SIZE + 10];
    rand::thread_rng().fill_bytes(&mut data);

    let write = WriteBuilder::new()
        .data(Data::from(data.clone()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // The record is returned without inline data; a read streams it.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries[0].write.encoded_data, None);

    let read = dwn_engine::records::ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(&ALICE_DID, read, &provider).await.expect("should read");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let stream = body.entry.data.expect("should have data");
    assert_eq!(stream.into_inner(), data);
}

// Should index an attested write by its attester.
#[tokio::test]
async fn attested_write() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");

    // --------------------------------------------------
    // Alice writes a record attested to by Bob.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .data(Data::from(b"attested by bob".to_vec()))
        .build_attested(&alice_keyring, &bob_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // The record is found by its attester.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().attester(BOB_DID.as_str()))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.record_id, write.record_id);
    assert_eq!(
        entries[0].write.attester().expect("should decode"),
        Some(BOB_DID.to_string())
    );
}

// Should reject a non-owner write with no grant, role, or owner signature.
#[tokio::test]
async fn unauthorized_write() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");

    let write = WriteBuilder::new()
        .data(Data::from(b"not allowed".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");

    let Err(Error::Unauthorized(_)) = endpoint::handle(&ALICE_DID, write, &provider).await else {
        panic!("should be Unauthorized");
    };
}

// Should accept another author's message when the owner has signed it.
#[tokio::test]
async fn owner_signature() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");

    // --------------------------------------------------
    // Bob authors a record; Alice signs it as owner and stores it in her
    // web node.
    // --------------------------------------------------
    let mut write = WriteBuilder::new()
        .data(Data::from(b"from bob, admitted by alice".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    write.sign_as_owner(&alice_keyring).await.expect("should sign as owner");

    let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // The record is stored with Bob as author.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].write.authorization.author().expect("should have author"),
        BOB_DID.as_str()
    );
}
