//! Records Query

use dwn_engine::provider::KeyStore;
use dwn_engine::records::{Data, QueryBuilder, RecordsFilter, Sort, TagFilter, WriteBuilder};
use dwn_engine::store::Pagination;
use dwn_engine::endpoint;
use http::StatusCode;
use serde_json::json;
use test_node::ProviderImpl;
use test_node::key_store::ALICE_DID;

// Should sort and paginate query results, resuming from a cursor.
#[tokio::test]
async fn paginate() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice writes 3 records.
    // --------------------------------------------------
    let mut record_ids = vec![];
    for i in 0..3 {
        let write = WriteBuilder::new()
            .data(Data::from(format!("record {i}").into_bytes()))
            .build(&alice_keyring)
            .await
            .expect("should create write");
        let reply =
            endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
        assert_eq!(reply.status.code, StatusCode::ACCEPTED);
        record_ids.push(write.record_id);
    }

    // --------------------------------------------------
    // The first page returns 2 records and a cursor.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .date_sort(Sort::TimestampAsc)
        .pagination(Pagination {
            limit: Some(2),
            cursor: None,
        })
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].write.record_id, record_ids[0]);
    assert_eq!(entries[1].write.record_id, record_ids[1]);
    let cursor = body.cursor.expect("should have cursor");

    // --------------------------------------------------
    // The second page returns the remaining record.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .date_sort(Sort::TimestampAsc)
        .pagination(Pagination {
            limit: Some(2),
            cursor: Some(cursor),
        })
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.record_id, record_ids[2]);
    assert!(body.cursor.is_none());
}

// Should return records newest first when sorting descending.
#[tokio::test]
async fn sort_descending() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let mut record_ids = vec![];
    for i in 0..3 {
        let write = WriteBuilder::new()
            .data(Data::from(format!("record {i}").into_bytes()))
            .build(&alice_keyring)
            .await
            .expect("should create write");
        endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
        record_ids.push(write.record_id);
    }

    let query = QueryBuilder::new()
        .date_sort(Sort::TimestampDesc)
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].write.record_id, record_ids[2]);
    assert_eq!(entries[2].write.record_id, record_ids[0]);
}

// Should match records on their tag values.
#[tokio::test]
async fn filter_tags() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let tagged = WriteBuilder::new()
        .data(Data::from(b"tagged".to_vec()))
        .add_tag("status", "active")
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(&ALICE_DID, tagged.clone(), &provider).await.expect("should write");

    let untagged = WriteBuilder::new()
        .data(Data::from(b"untagged".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(&ALICE_DID, untagged, &provider).await.expect("should write");

    // --------------------------------------------------
    // Only the tagged record matches the tag filter.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().add_tag("status", TagFilter::Equal(json!("active"))))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.record_id, tagged.record_id);

    // --------------------------------------------------
    // A non-matching tag value returns nothing.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().add_tag("status", TagFilter::Equal(json!("archived"))))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert!(reply.body.is_none());
}
