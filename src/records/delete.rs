//! # Records Delete
//!
//! The records delete endpoint handles `RecordsDelete` messages — requests
//! to delete a record. The record is tombstoned rather than erased: the
//! initial write is retained as an archived stub alongside the delete,
//! while intermediate writes, unreferenced data, and their events are
//! purged. With `prune` set, descendant records are purged entirely.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::SecondsFormat::Micros;
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::provider::{DataStore, EventLog, EventStream, MessageStore, Provider, Signer};
use crate::records::{self, DelegatedGrant, RecordsFilter, Write, protocol};
use crate::store::{Entry, RecordsQueryBuilder};
use crate::tasks::{self, Task, TaskType};
use crate::{
    Descriptor, Error, Interface, Method, Result, cid, forbidden, permissions, unexpected,
};

/// Handle — or process — a [`Delete`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs deleting the specified record.
pub async fn handle(
    owner: &str, delete: Delete, provider: &impl Provider,
) -> Result<Reply<DeleteReply>> {
    // deletes are serialized with writes for the same record
    let lock = records::record_lock(owner, &delete.descriptor.record_id);
    let _guard = lock.lock().await;

    // a prior write is required for delete processing
    let query = RecordsQueryBuilder::new()
        .method(None)
        .include_archived(true)
        .add_filter(RecordsFilter::new().record_id(&delete.descriptor.record_id))
        .build();
    let (entries, _) = MessageStore::query(provider, owner, &query).await?;
    let Some(latest) = entries.last() else {
        return Err(Error::NotFound("no matching record found".to_string()));
    };

    // check the record has not already been deleted
    if latest.descriptor().method == Method::Delete {
        let existing = Delete::try_from(latest)?;
        if existing.cid()? == delete.cid()? {
            // idempotent: the delete has already been accepted
            return Ok(Reply {
                status: Status {
                    code: StatusCode::ACCEPTED.as_u16(),
                    detail: None,
                },
                body: None,
            });
        }
        // a delete may only follow a delete when upgrading to a prune
        if !delete.descriptor.prune {
            return Err(Error::NotFound("cannot delete a `RecordsDelete` record".to_string()));
        }
        if existing.descriptor.prune {
            return Err(Error::NotFound("record has already been pruned".to_string()));
        }
    }

    let Some(initial) = records::initial_write(owner, &delete.descriptor.record_id, provider)
        .await?
    else {
        return Err(unexpected!("initial write not found"));
    };
    delete.authorize(owner, &initial, provider).await?;

    // the delete must not pre-date the latest existing message
    if delete.descriptor.base.message_timestamp.timestamp_micros()
        < latest.descriptor().message_timestamp.timestamp_micros()
    {
        return Err(Error::Conflict("newer record version exists".to_string()));
    }

    // the delete crosses stores: run it as a resumable task
    tasks::run(owner, TaskType::RecordsDelete, delete, provider).await?;

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: None,
    })
}

/// The [`Delete`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Delete {
    /// The Delete descriptor.
    pub descriptor: DeleteDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Delete {
    type Reply = DeleteReply;

    fn cid(&self) -> Result<String> {
        cid::from_value(self)
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor.base
    }

    fn authorization(&self) -> Option<&Authorization> {
        Some(&self.authorization)
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

/// [`DeleteReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeleteReply;

impl TryFrom<&Entry> for Delete {
    type Error = crate::Error;

    fn try_from(entry: &Entry) -> Result<Self> {
        match &entry.message {
            crate::store::EntryType::Delete(delete) => Ok(delete.clone()),
            _ => Err(unexpected!("expected `RecordsDelete` message")),
        }
    }
}

impl Task for Delete {
    async fn run(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        delete_record(owner, self, provider).await
    }
}

impl Delete {
    /// Build the flattened index keys for the delete.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> BTreeMap<String, String> {
        let mut indexes = BTreeMap::new();
        indexes.insert("interface".to_string(), Interface::Records.to_string());
        indexes.insert("method".to_string(), Method::Delete.to_string());
        indexes.insert("recordId".to_string(), self.descriptor.record_id.clone());
        indexes.insert(
            "messageTimestamp".to_string(),
            self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true),
        );
        indexes.insert("author".to_string(), self.authorization.author().unwrap_or_default());
        indexes.insert("initial".to_string(), false.to_string());
        indexes
    }

    // Authorize the delete message against the record's initial write.
    async fn authorize(&self, owner: &str, initial: &Write, provider: &impl Provider) -> Result<()> {
        let authzn = &self.authorization;
        let author = authzn.author()?;

        // when signed by a delegate, verify the delegation covers this
        // record's protocol
        if let Some(delegated_grant) = &authzn.author_delegated_grant {
            let grant = delegated_grant.to_grant()?;
            grant.verify_delegated_delete(&author, self, initial)?;
        }

        if author == owner {
            return Ok(());
        }

        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
            grant.permit_delete(owner, &author, self, initial, provider).await?;
            return Ok(());
        }

        if initial.descriptor.protocol.is_some() {
            let authorizer = protocol::Authorizer::new(owner);
            return authorizer.permit_delete(self, initial, provider).await;
        }

        Err(forbidden!("delete request failed authorization"))
    }
}

/// The [`Delete`] message descriptor.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The ID of the record to delete.
    pub record_id: String,

    /// Whether descendant records should be purged as well.
    pub prune: bool,
}

impl Default for DeleteDescriptor {
    fn default() -> Self {
        Self {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Delete,
                message_timestamp: Utc::now(),
            },
            record_id: String::new(),
            prune: false,
        }
    }
}

// Process the delete: store the tombstone, purge descendants when pruning,
// and purge superseded messages. Idempotent so it can be re-driven.
async fn delete_record(owner: &str, delete: &Delete, provider: &impl Provider) -> Result<()> {
    let query = RecordsQueryBuilder::new()
        .method(None)
        .include_archived(true)
        .add_filter(RecordsFilter::new().record_id(&delete.descriptor.record_id))
        .build();
    let (entries, _) = MessageStore::query(provider, owner, &query).await?;
    let Some(latest) = entries.last() else {
        return Err(Error::NotFound("no matching record found".to_string()));
    };

    if delete.descriptor.base.message_timestamp.timestamp_micros()
        < latest.descriptor().message_timestamp.timestamp_micros()
    {
        return Err(Error::Conflict("newer record version exists".to_string()));
    }

    let Some(initial) = entries.first().map(Write::try_from).transpose()? else {
        return Err(unexpected!("initial write not found"));
    };
    if !initial.is_initial()? {
        return Err(unexpected!("initial write is not the earliest message"));
    }

    // the delete entry carries the record's indexes so it remains
    // searchable alongside writes
    let mut delete_entry = Entry::from(delete);
    for (key, value) in initial.build_indexes() {
        delete_entry.indexes.entry(key).or_insert(value);
    }
    delete_entry.add_index("archived", false.to_string());

    MessageStore::put(provider, owner, &delete_entry).await?;
    EventLog::append(provider, owner, &delete_entry).await?;

    // purge descendant records before the delete becomes visible
    if delete.descriptor.prune {
        purge_descendants(owner, &delete.descriptor.record_id, provider).await?;
    }

    // purge all messages except the initial write and the delete itself
    delete_earlier(owner, &delete_entry, &entries, provider).await?;

    EventStream::emit(provider, owner, &delete_entry).await?;

    Ok(())
}

// Purge a record's descendants: a breadth-first walk by `parent_id`,
// grouping messages by record.
async fn purge_descendants(owner: &str, record_id: &str, provider: &impl Provider) -> Result<()> {
    let mut queue = VecDeque::from([record_id.to_string()]);

    while let Some(parent_id) = queue.pop_front() {
        let query = RecordsQueryBuilder::new()
            .method(None)
            .include_archived(true)
            .add_filter(RecordsFilter::new().parent_id(&parent_id))
            .build();
        let (children, _) = MessageStore::query(provider, owner, &query).await?;

        // a record may have multiple messages: group them
        let mut by_record = HashMap::<String, Vec<Entry>>::new();
        for entry in children {
            let Some(child_id) = entry.record_id() else {
                return Err(unexpected!("unexpected message type"));
            };
            by_record.entry(child_id.to_string()).or_default().push(entry);
        }

        for (child_id, entries) in by_record {
            queue.push_back(child_id);
            purge_record(owner, &entries, provider).await?;
        }
    }

    Ok(())
}

// Purge a pruned record: delete its data and every non-initial message
// (and their events), retaining the initial write as an archived stub so
// the record's existence stays on the record. Data for older writes was
// already removed by the normal write path.
async fn purge_record(owner: &str, entries: &[Entry], provider: &impl Provider) -> Result<()> {
    let mut purged_cids = vec![];

    for entry in entries {
        if let Some(write) = entry.as_write() {
            DataStore::delete(provider, owner, &write.record_id, &write.descriptor.data_cid)
                .await?;

            if write.is_initial()? {
                let mut stub = write.clone();
                stub.encoded_data = None;
                let mut stub_entry = Entry::from(&stub);
                stub_entry.indexes.retain(|key, _| !key.starts_with("tag."));
                stub_entry.add_index("archived", true.to_string());
                MessageStore::put(provider, owner, &stub_entry).await?;
                continue;
            }
        }

        let message_cid = entry.cid()?;
        MessageStore::delete(provider, owner, &message_cid).await?;
        purged_cids.push(message_cid);
    }

    let cids: Vec<&str> = purged_cids.iter().map(String::as_str).collect();
    if !cids.is_empty() {
        EventLog::delete(provider, owner, &cids).await?;
    }

    Ok(())
}

// Purge all messages older than the accepted delete, retaining the initial
// write as an archived stub with no data.
async fn delete_earlier(
    owner: &str, latest: &Entry, existing: &[Entry], provider: &impl Provider,
) -> Result<()> {
    // typically at most two existing messages per record: the initial
    // write plus a subsequent write or delete
    let mut purged_cids = vec![];

    for entry in existing {
        if entry.descriptor().message_timestamp.timestamp_micros()
            >= latest.descriptor().message_timestamp.timestamp_micros()
        {
            continue;
        }

        let Some(write) = entry.as_write() else {
            continue;
        };
        DataStore::delete(provider, owner, &write.record_id, &write.descriptor.data_cid).await?;

        if write.is_initial()? {
            let mut stub = write.clone();
            stub.encoded_data = None;
            let mut stub_entry = Entry::from(&stub);
            stub_entry.indexes.retain(|key, _| !key.starts_with("tag."));
            stub_entry.add_index("archived", true.to_string());
            MessageStore::put(provider, owner, &stub_entry).await?;
        } else {
            let message_cid = entry.cid()?;
            MessageStore::delete(provider, owner, &message_cid).await?;
            purged_cids.push(message_cid);
        }
    }

    let cids: Vec<&str> = purged_cids.iter().map(String::as_str).collect();
    if !cids.is_empty() {
        EventLog::delete(provider, owner, &cids).await?;
    }

    Ok(())
}

/// Options to use when creating a [`Delete`] message.
#[derive(Clone, Debug, Default)]
pub struct DeleteBuilder {
    record_id: Option<String>,
    prune: Option<bool>,
    message_timestamp: Option<DateTime<Utc>>,
    protocol_role: Option<String>,
    permission_grant_id: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
}

impl DeleteBuilder {
    /// Returns a new [`DeleteBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The ID of the record to delete.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Purge descendant records as well.
    #[must_use]
    pub const fn prune(mut self, prune: bool) -> Self {
        self.prune = Some(prune);
        self
    }

    /// The message's timestamp. Defaults to now.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Invoke a protocol role to authorize the delete.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// Invoke a permission grant to authorize the delete.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// The delegated grant invoked to sign on behalf of the logical author.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Build and sign the [`Delete`] message.
    ///
    /// # Errors
    ///
    /// Fails when no record ID is set or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Delete> {
        let record_id = self.record_id.ok_or_else(|| unexpected!("record ID not set"))?;

        let descriptor = DeleteDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Delete,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
            },
            record_id,
            prune: self.prune.unwrap_or_default(),
        };

        let mut builder = AuthorizationBuilder::new().descriptor_cid(cid::from_value(&descriptor)?);
        if let Some(protocol_role) = self.protocol_role {
            builder = builder.protocol_role(protocol_role);
        }
        if let Some(grant_id) = self.permission_grant_id {
            builder = builder.permission_grant_id(grant_id);
        }
        if let Some(delegated_grant) = self.delegated_grant {
            builder = builder.delegated_grant(delegated_grant);
        }
        let authorization = builder.build(signer).await?;

        Ok(Delete {
            descriptor,
            authorization,
        })
    }
}
