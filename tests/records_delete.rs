//! Records Delete

use dwn_engine::protocols::{
    Action, ActionRule, Actor, ConfigureBuilder, Definition, ProtocolType, RuleSet,
};
use dwn_engine::provider::KeyStore;
use dwn_engine::records::{
    Data, DeleteBuilder, QueryBuilder, ReadBuilder, RecordsFilter, WriteBuilder, WriteProtocol,
};
use dwn_engine::{Error, endpoint};
use http::StatusCode;
use serde_json::json;
use test_node::ProviderImpl;
use test_node::key_store::ALICE_DID;

// Successfully delete a record, then fail when attempting to delete it
// again.
#[tokio::test]
async fn delete_record() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice writes a record to her web node.
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
    let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Ensure the record was written.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query.clone(), &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);
    assert!(reply.body.is_some());

    // --------------------------------------------------
    // Alice deletes the record.
    // --------------------------------------------------
    let delete = DeleteBuilder::new()
        .record_id(&write.record_id)
        .build(&alice_keyring)
        .await
        .expect("should create delete");
    let reply = endpoint::handle(&ALICE_DID, delete, &provider).await.expect("should delete");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Ensure the record no longer appears in query results.
    // --------------------------------------------------
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);
    assert!(reply.body.is_none());

    // --------------------------------------------------
    // Deleting the same record again should fail.
    // --------------------------------------------------
    let delete = DeleteBuilder::new()
        .record_id(&write.record_id)
        .build(&alice_keyring)
        .await
        .expect("should create delete");
    let err = endpoint::handle(&ALICE_DID, delete, &provider).await.expect_err("should be 404");
    assert_eq!(
        err.to_json(),
        json!({"code": 404, "detail": "cannot delete a `RecordsDelete` record"})
    );
}

// A read of a deleted record returns the tombstone: the delete plus the
// record's initial write.
#[tokio::test]
async fn read_tombstone() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let write = WriteBuilder::new()
        .data(Data::from(b"soon to be deleted".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let delete = DeleteBuilder::new()
        .record_id(&write.record_id)
        .build(&alice_keyring)
        .await
        .expect("should create delete");
    let reply = endpoint::handle(&ALICE_DID, delete, &provider).await.expect("should delete");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(&ALICE_DID, read, &provider).await.expect("should read");
    assert_eq!(reply.status.code, StatusCode::NOT_FOUND);

    let body = reply.body.expect("should have body");
    let tombstone_delete = body.entry.records_delete.expect("should have delete");
    assert_eq!(tombstone_delete.descriptor.record_id, write.record_id);

    let initial = body.entry.initial_write.expect("should have initial write");
    assert_eq!(initial.record_id, write.record_id);
    assert_eq!(initial.encoded_data, None);
}

// A delete with `prune` purges descendant records, leaving only tombstone
// stubs.
#[tokio::test]
async fn delete_with_prune() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice configures a protocol with nested records.
    // --------------------------------------------------
    let definition = Definition::new("http://notes.xyz")
        .add_type("folder", ProtocolType::default())
        .add_type("note", ProtocolType::default())
        .add_rule("folder", RuleSet {
            actions: Some(vec![ActionRule {
                who: Some(Actor::Anyone),
                role: None,
                of: None,
                can: vec![Action::Create],
            }]),
            structure: [("note".to_string(), RuleSet {
                actions: Some(vec![ActionRule {
                    who: Some(Actor::Anyone),
                    role: None,
                    of: None,
                    can: vec![Action::Create],
                }]),
                ..RuleSet::default()
            })]
            .into(),
            ..RuleSet::default()
        });

    let configure = ConfigureBuilder::new()
        .definition(definition)
        .build(&alice_keyring)
        .await
        .expect("should build");
    let reply = endpoint::handle(&ALICE_DID, configure, &provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice writes a folder and a nested note.
    // --------------------------------------------------
    let folder = WriteBuilder::new()
        .data(Data::from(b"a folder".to_vec()))
        .protocol(WriteProtocol {
            protocol: "http://notes.xyz".to_string(),
            protocol_path: "folder".to_string(),
        })
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(&ALICE_DID, folder.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let note = WriteBuilder::new()
        .data(Data::from(b"a note".to_vec()))
        .protocol(WriteProtocol {
            protocol: "http://notes.xyz".to_string(),
            protocol_path: "folder/note".to_string(),
        })
        .parent_context_id(folder.context_id.as_ref().expect("should have context"))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, note.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice deletes the folder with `prune`.
    // --------------------------------------------------
    let delete = DeleteBuilder::new()
        .record_id(&folder.record_id)
        .prune(true)
        .build(&alice_keyring)
        .await
        .expect("should create delete");
    let reply = endpoint::handle(&ALICE_DID, delete, &provider).await.expect("should delete");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Neither record appears in query results.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().protocol("http://notes.xyz"))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);
    assert!(reply.body.is_none());

    // --------------------------------------------------
    // The note's messages are gone; a read finds nothing.
    // --------------------------------------------------
    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&note.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let Err(Error::NotFound(_)) = endpoint::handle(&ALICE_DID, read, &provider).await else {
        panic!("should be NotFound");
    };

    // --------------------------------------------------
    // The folder reads as a tombstone.
    // --------------------------------------------------
    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&folder.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(&ALICE_DID, read, &provider).await.expect("should read");
    assert_eq!(reply.status.code, StatusCode::NOT_FOUND);
    assert!(reply.body.expect("should have body").entry.records_delete.is_some());
}
