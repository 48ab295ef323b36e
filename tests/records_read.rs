//! Records Read

use base64ct::{Base64UrlUnpadded, Encoding};
use dwn_engine::provider::KeyStore;
use dwn_engine::records::{Data, ReadBuilder, RecordsFilter, WriteBuilder};
use dwn_engine::{Error, endpoint};
use http::StatusCode;
use test_node::ProviderImpl;
use test_node::key_store::{ALICE_DID, BOB_DID, CAROL_DID};

// Anyone can read a published record, without authorization.
#[tokio::test]
async fn read_published() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let data = b"a published record";
    let write = WriteBuilder::new()
        .data(Data::from(data.to_vec()))
        .published(true)
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // an anonymous read succeeds
    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .authorize(false)
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(&ALICE_DID, read, &provider).await.expect("should read");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let stream = body.entry.data.expect("should have data");
    assert_eq!(stream.into_inner(), data.to_vec());

    let returned = body.entry.records_write.expect("should have write");
    assert_eq!(returned.record_id, write.record_id);
}

// The record's recipient can read an unpublished record; others cannot.
#[tokio::test]
async fn read_unpublished() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");
    let carol_keyring = provider.keyring(&CAROL_DID).expect("should get Carol's keyring");

    // --------------------------------------------------
    // Alice writes an unpublished record for Bob.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .data(Data::from(b"for bob's eyes only".to_vec()))
        .recipient(BOB_DID.as_str())
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Bob, the recipient, can read the record.
    // --------------------------------------------------
    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&bob_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(&ALICE_DID, read, &provider).await.expect("should read");
    assert_eq!(reply.status.code, StatusCode::OK);

    // --------------------------------------------------
    // Carol cannot read the record.
    // --------------------------------------------------
    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&carol_keyring)
        .await
        .expect("should create read");
    let Err(Error::Unauthorized(_)) = endpoint::handle(&ALICE_DID, read, &provider).await else {
        panic!("should be Unauthorized");
    };

    // --------------------------------------------------
    // An anonymous read is also rejected.
    // --------------------------------------------------
    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .authorize(false)
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let Err(Error::Unauthorized(_)) = endpoint::handle(&ALICE_DID, read, &provider).await else {
        panic!("should be Unauthorized");
    };
}

// An anonymous query returns published records only.
#[tokio::test]
async fn query_published_only() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let published = WriteBuilder::new()
        .data(Data::from(b"published".to_vec()))
        .published(true)
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(&ALICE_DID, published.clone(), &provider).await.expect("should write");

    let unpublished = WriteBuilder::new()
        .data(Data::from(b"unpublished".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(&ALICE_DID, unpublished, &provider).await.expect("should write");

    let query = dwn_engine::records::QueryBuilder::new()
        .authorize(false)
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].write.encoded_data,
        Some(Base64UrlUnpadded::encode_string(b"published"))
    );
}
