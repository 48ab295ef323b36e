//! # Records Write
//!
//! The records write endpoint handles `RecordsWrite` messages — requests to
//! create a record or update an existing one. The first accepted write of a
//! record is its *initial write*: the write whose entry ID equals the
//! record ID. Subsequent writes supersede each other by
//! `(message_timestamp, message CID)` ordering; only the initial write and
//! the latest write are retained.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::SecondsFormat::Micros;
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::authorization::{Authorization, JwsPayload};
use crate::data::{DataStream, MAX_ENCODED_SIZE};
use crate::endpoint::{Message, Reply, Status};
use crate::jws::Jws;
use crate::provider::{DataStore, EventLog, EventStream, MessageStore, Provider, Signer};
use crate::store::{Entry, RecordsQueryBuilder};
use crate::records::{self, RecordsFilter, protocol};
use crate::{
    Descriptor, Error, Interface, Method, Result, cid, forbidden, index_num, invalid, permissions,
    unexpected, utils,
};

/// Handle — or process — a [`Write`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs storing the record.
pub async fn handle(owner: &str, write: Write, provider: &impl Provider) -> Result<Reply<WriteReply>> {
    // writes for the same record are serialized through the record's lock
    let lock = records::record_lock(owner, &write.record_id);
    let _guard = lock.lock().await;

    write.authorize(owner, provider).await?;

    if write.descriptor.protocol.is_some() {
        protocol::verify_integrity(owner, &write, provider).await?;
    }

    // fetch the record's existing messages, oldest first
    let query = RecordsQueryBuilder::new()
        .method(None)
        .include_archived(true)
        .add_filter(RecordsFilter::new().record_id(&write.record_id))
        .build();
    let (existing, _) = MessageStore::query(provider, owner, &query).await?;

    let is_initial = write.is_initial()?;
    if existing.is_empty() && !is_initial {
        return Err(Error::BadRequest("initial write not found".to_string()));
    }

    if let Some(initial) = find_initial(&existing)? {
        write.verify_immutable(&initial)?;
    }

    // the incoming message must be newer than the newest existing message
    let incoming_cid = write.cid()?;
    if let Some(latest) = existing.last() {
        if latest.descriptor().method == Method::Delete {
            return Err(Error::BadRequest(
                "a write is not allowed after a record is deleted".to_string(),
            ));
        }

        let latest_cid = latest.cid()?;
        if incoming_cid == latest_cid {
            // idempotent: the message has already been accepted
            return Ok(Reply {
                status: Status {
                    code: StatusCode::ACCEPTED.as_u16(),
                    detail: None,
                },
                body: None,
            });
        }

        let latest_ts = latest.descriptor().message_timestamp.timestamp_micros();
        let incoming_ts = write.descriptor.base.message_timestamp.timestamp_micros();
        if incoming_ts < latest_ts {
            return Err(Error::Conflict("a more recent update exists".to_string()));
        }
        if incoming_ts == latest_ts && incoming_cid < latest_cid {
            return Err(Error::Conflict("an update with a larger CID already exists".to_string()));
        }
    }

    // ingest data before any metadata becomes visible
    let entry_write = ingest_data(owner, write.clone(), &existing, provider).await?;

    let mut entry = Entry::from(&entry_write);
    entry.add_index("archived", false.to_string());

    MessageStore::put(provider, owner, &entry).await?;
    EventLog::append(provider, owner, &entry).await?;

    // purge superseded messages, retaining the initial write as a stub
    delete_earlier(owner, &entry_write, &existing, provider).await?;

    EventStream::emit(provider, owner, &entry).await?;

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: None,
    })
}

// Find the initial write amongst a record's existing messages.
fn find_initial(existing: &[Entry]) -> Result<Option<Write>> {
    for entry in existing {
        if let Some(write) = entry.as_write() {
            if write.is_initial()? {
                return Ok(Some(write.clone()));
            }
        }
    }
    Ok(None)
}

// Resolve the incoming write's data: verify and store a provided stream, or
// carry over the data referenced by the newest existing write.
async fn ingest_data(
    owner: &str, mut write: Write, existing: &[Entry], provider: &impl Provider,
) -> Result<Write> {
    if let Some(stream) = write.data_stream.take() {
        let (data_cid, data_size) = stream.compute_cid()?;
        if data_cid != write.descriptor.data_cid {
            return Err(invalid!("computed data CID does not match message `data_cid`"));
        }
        if data_size != write.descriptor.data_size {
            return Err(invalid!("actual data size does not match message `data_size`"));
        }

        if data_size <= MAX_ENCODED_SIZE {
            write.encoded_data = Some(Base64UrlUnpadded::encode_string(stream.as_bytes()));
        } else {
            let (stored_cid, stored_size) = DataStore::put(
                provider,
                owner,
                &write.record_id,
                &write.descriptor.data_cid,
                stream,
            )
            .await?;

            if stored_cid != write.descriptor.data_cid || stored_size != write.descriptor.data_size
            {
                DataStore::delete(provider, owner, &write.record_id, &write.descriptor.data_cid)
                    .await?;
                return Err(invalid!("stored data does not match message `data_cid`"));
            }
        }
        return Ok(write);
    }

    // no data stream: the newest existing write must reference the same data
    let newest_write = existing.iter().rev().find_map(Entry::as_write);
    let Some(newest_write) = newest_write else {
        return Err(invalid!("no data stream provided for new record"));
    };
    if newest_write.descriptor.data_cid != write.descriptor.data_cid {
        return Err(invalid!("referenced data does not match existing record data"));
    }
    if newest_write.descriptor.data_size != write.descriptor.data_size {
        return Err(invalid!("referenced data size does not match existing record data"));
    }

    if let Some(encoded) = &newest_write.encoded_data {
        write.encoded_data = Some(encoded.clone());
    } else if !DataStore::associate(provider, owner, &write.record_id, &write.descriptor.data_cid)
        .await?
    {
        return Err(invalid!("referenced data does not exist in the data store"));
    }

    Ok(write)
}

// Delete all messages superseded by the accepted write, retaining the
// initial write as an archived stub with no data.
async fn delete_earlier(
    owner: &str, newest: &Write, existing: &[Entry], provider: &impl Provider,
) -> Result<()> {
    let newest_key = (newest.descriptor.base.message_timestamp.timestamp_micros(), newest.cid()?);
    let mut purged_cids = vec![];

    for entry in existing {
        let entry_key = (entry.descriptor().message_timestamp.timestamp_micros(), entry.cid()?);
        if entry_key >= newest_key {
            continue;
        }

        let Some(existing_write) = entry.as_write() else {
            continue;
        };

        // keep data still referenced by the newest message
        if existing_write.descriptor.data_cid != newest.descriptor.data_cid {
            DataStore::delete(
                provider,
                owner,
                &existing_write.record_id,
                &existing_write.descriptor.data_cid,
            )
            .await?;
        }

        if existing_write.is_initial()? {
            // retain the initial write as an archived stub without data;
            // tag indexes only apply to the latest base state
            let mut stub = existing_write.clone();
            stub.encoded_data = None;
            let mut entry = Entry::from(&stub);
            entry.indexes.retain(|key, _| !key.starts_with("tag."));
            entry.add_index("archived", true.to_string());
            MessageStore::put(provider, owner, &entry).await?;
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

/// The [`Write`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Write {
    /// The record's ID: the entry ID of the record's initial write.
    pub record_id: String,

    /// The record's position within its protocol subtree, when written
    /// under a protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// The write descriptor.
    pub descriptor: WriteDescriptor,

    /// The message authorization.
    pub authorization: Authorization,

    /// An optional third-party signature attesting to the descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<Jws>,

    /// Record data when it is small enough to carry inline,
    /// base64url-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_data: Option<String>,

    /// Record data to ingest, supplied out-of-band by the caller.
    #[serde(skip)]
    pub data_stream: Option<DataStream>,
}

impl Message for Write {
    type Reply = WriteReply;

    fn cid(&self) -> Result<String> {
        // inline data does not contribute to the message identity
        let mut message = self.clone();
        message.encoded_data = None;
        cid::from_value(&message)
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor.base
    }

    fn authorization(&self) -> Option<&Authorization> {
        Some(&self.authorization)
    }

    async fn verify_integrity(&self, _owner: &str, provider: &impl Provider) -> Result<()> {
        let payload = self.signature_payload()?;

        if let Some(attestation) = &self.attestation {
            attestation.verify(provider).await?;
        }

        if self.is_initial()? {
            if self.descriptor.base.message_timestamp.timestamp_micros()
                != self.descriptor.date_created.timestamp_micros()
            {
                return Err(invalid!("initial write `message_timestamp` must match `date_created`"));
            }
            if self.descriptor.protocol.is_some() && self.descriptor.parent_id.is_none() {
                if self.context_id.as_ref() != Some(&self.record_id) {
                    return Err(invalid!("initial write `context_id` must match `record_id`"));
                }
            }
        }

        if payload.record_id != self.record_id {
            return Err(invalid!("signature payload `record_id` does not match message"));
        }
        if payload.context_id != self.context_id {
            return Err(invalid!("signature payload `context_id` does not match message"));
        }

        // `protocol` and `protocol_path` are co-required
        if self.descriptor.protocol.is_some() != self.descriptor.protocol_path.is_some() {
            return Err(invalid!("`protocol` and `protocol_path` must be set together"));
        }

        // URLs must be in normalized form
        if let Some(protocol) = &self.descriptor.protocol {
            utils::validate_url(protocol)?;
        }
        if let Some(schema) = &self.descriptor.schema {
            utils::validate_url(schema)?;
        }

        if let Some(parent_id) = &self.descriptor.parent_id {
            // `parent_id` is the last segment of the parent context
            let parent_context = self
                .context_id
                .as_ref()
                .and_then(|id| id.rsplit_once('/'))
                .map(|(parent, _)| parent);
            let last_segment = parent_context.and_then(|ctx| ctx.rsplit('/').next());
            if last_segment != Some(parent_id.as_str()) {
                return Err(invalid!("`parent_id` does not match the parent context"));
            }
        }

        self.verify_attestation(&payload)
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

/// [`WriteReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct WriteReply;

impl Write {
    /// The decoded signature payload.
    ///
    /// # Errors
    ///
    /// Fails when the payload cannot be decoded.
    pub fn signature_payload(&self) -> Result<SignaturePayload> {
        self.authorization.signature.payload()
    }

    /// Whether the write is its record's initial write.
    ///
    /// # Errors
    ///
    /// Fails when the entry ID cannot be computed.
    pub fn is_initial(&self) -> Result<bool> {
        Ok(entry_id(&self.descriptor, &self.authorization.author()?)? == self.record_id)
    }

    /// The DID attesting to the write, when an attestation is present.
    ///
    /// # Errors
    ///
    /// Fails when the attestation signature is malformed.
    pub fn attester(&self) -> Result<Option<String>> {
        self.attestation.as_ref().map(Jws::did).transpose()
    }

    /// Build the flattened index keys for the write.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> std::collections::BTreeMap<String, String> {
        let mut indexes = std::collections::BTreeMap::new();
        let descriptor = &self.descriptor;

        indexes.insert("interface".to_string(), Interface::Records.to_string());
        indexes.insert("method".to_string(), Method::Write.to_string());
        indexes.insert("recordId".to_string(), self.record_id.clone());
        indexes.insert(
            "messageTimestamp".to_string(),
            descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true),
        );
        indexes.insert(
            "dateUpdated".to_string(),
            descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true),
        );
        indexes.insert(
            "dateCreated".to_string(),
            descriptor.date_created.to_rfc3339_opts(Micros, true),
        );
        indexes.insert("dataCid".to_string(), descriptor.data_cid.clone());
        indexes.insert("dataSize".to_string(), index_num(descriptor.data_size));
        indexes.insert("dataFormat".to_string(), descriptor.data_format.clone());
        indexes
            .insert("published".to_string(), descriptor.published.unwrap_or_default().to_string());
        indexes.insert("author".to_string(), self.authorization.author().unwrap_or_default());
        if let Ok(entry_id) =
            entry_id(descriptor, &self.authorization.author().unwrap_or_default())
        {
            indexes.insert("entryId".to_string(), entry_id);
        }
        indexes.insert("initial".to_string(), self.is_initial().unwrap_or_default().to_string());

        if let Some(context_id) = &self.context_id {
            indexes.insert("contextId".to_string(), context_id.clone());
        }
        if let Some(protocol) = &descriptor.protocol {
            indexes.insert("protocol".to_string(), protocol.clone());
        }
        if let Some(protocol_path) = &descriptor.protocol_path {
            indexes.insert("protocolPath".to_string(), protocol_path.clone());
        }
        if let Some(schema) = &descriptor.schema {
            indexes.insert("schema".to_string(), schema.clone());
        }
        if let Some(parent_id) = &descriptor.parent_id {
            indexes.insert("parentId".to_string(), parent_id.clone());
        }
        if let Some(recipient) = &descriptor.recipient {
            indexes.insert("recipient".to_string(), recipient.clone());
        }
        if let Some(date_published) = &descriptor.date_published {
            indexes
                .insert("datePublished".to_string(), date_published.to_rfc3339_opts(Micros, true));
        }
        if let Ok(Some(attester)) = self.attester() {
            indexes.insert("attester".to_string(), attester);
        }

        // tags are namespaced to avoid collision with built-in keys
        if let Some(tags) = &descriptor.tags {
            for (name, value) in tags {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                indexes.insert(format!("tag.{name}"), value);
            }
        }

        indexes
    }

    // Every descriptor property outside the mutable set must be identical
    // to the record's initial write.
    fn verify_immutable(&self, initial: &Write) -> Result<()> {
        let descriptor = &self.descriptor;
        let initial_descriptor = &initial.descriptor;

        if descriptor.protocol != initial_descriptor.protocol
            || descriptor.protocol_path != initial_descriptor.protocol_path
            || descriptor.schema != initial_descriptor.schema
            || descriptor.parent_id != initial_descriptor.parent_id
            || descriptor.recipient != initial_descriptor.recipient
            || descriptor.date_created.timestamp_micros()
                != initial_descriptor.date_created.timestamp_micros()
            || self.context_id != initial.context_id
        {
            return Err(invalid!("immutable properties do not match initial write"));
        }

        Ok(())
    }

    // Attestation, when present, has exactly one signature and its payload
    // contains only the descriptor CID.
    fn verify_attestation(&self, payload: &SignaturePayload) -> Result<()> {
        let Some(attestation) = &self.attestation else {
            if payload.attestation_cid.is_some() {
                return Err(invalid!("signature payload references a missing attestation"));
            }
            return Ok(());
        };

        if attestation.signatures.len() != 1 {
            return Err(invalid!("attestation must have exactly one signature"));
        }
        if payload.attestation_cid.as_ref() != Some(&cid::from_value(attestation)?) {
            return Err(invalid!("signature payload `attestation_cid` does not match attestation"));
        }

        let attestation_payload: Attestation = attestation.payload()?;
        let descriptor_cid = cid::from_value(&self.descriptor)?;
        if attestation_payload.descriptor_cid != descriptor_cid {
            return Err(invalid!("attestation payload `descriptor_cid` does not match descriptor"));
        }

        Ok(())
    }

    // Authorize the write message.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let authzn = &self.authorization;
        let author = authzn.author()?;

        // an owner signature admits another author's message into the
        // owner's web node
        if let Some(signing_owner) = authzn.owner()? {
            if signing_owner != owner {
                return Err(forbidden!("owner signature is not by the web node owner"));
            }
            if let Some(delegated_grant) = &authzn.owner_delegated_grant {
                let grant = delegated_grant.to_grant()?;
                grant.verify_delegated_write(owner, self)?;
            }
            return Ok(());
        }

        // when signed by an author delegate, verify the delegation covers
        // this write
        if let Some(delegated_grant) = &authzn.author_delegated_grant {
            let grant = delegated_grant.to_grant()?;
            grant.verify_delegated_write(&author, self)?;
        }

        if author == owner {
            return Ok(());
        }

        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
            grant.permit_write(owner, &author, self, provider).await?;
            return Ok(());
        }

        if self.descriptor.protocol.is_some() {
            let authorizer = protocol::Authorizer::new(owner);
            return authorizer.permit_write(self, provider).await;
        }

        Err(forbidden!("write failed authorization"))
    }

    /// Add an owner signature to the message, admitting it into the owner's
    /// web node.
    ///
    /// # Errors
    ///
    /// Fails when the signature payload cannot be decoded or signing fails.
    pub async fn sign_as_owner(&mut self, signer: &impl Signer) -> Result<()> {
        let payload: SignaturePayload = self.authorization.signature.payload()?;
        self.authorization.owner_signature = Some(Jws::create(&payload, signer).await?);
        Ok(())
    }

    /// Add an owner signature produced by an owner delegate.
    ///
    /// # Errors
    ///
    /// Fails when the signature payload cannot be decoded or signing fails.
    pub async fn sign_as_delegated_owner(
        &mut self, delegated_grant: DelegatedGrant, signer: &impl Signer,
    ) -> Result<()> {
        let mut payload: SignaturePayload = self.authorization.signature.payload()?;
        payload.base.delegated_grant_id = Some(cid::from_value(&delegated_grant)?);

        self.authorization.owner_signature = Some(Jws::create(&payload, signer).await?);
        self.authorization.owner_delegated_grant = Some(delegated_grant);
        Ok(())
    }
}

/// The [`Write`] message descriptor.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WriteDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The DID the record is intended for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,

    /// The protocol the record is written under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// The record's path within the protocol's structure tree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_path: Option<String>,

    /// The record's schema URI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Searchable tags associated with the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Value>>,

    /// The `record_id` of the record's parent, when nested under a
    /// protocol context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// The CID of the record's data.
    pub data_cid: String,

    /// The size of the record's data in bytes.
    pub data_size: usize,

    /// The record's creation time. Immutable across updates.
    pub date_created: DateTime<Utc>,

    /// Whether the record is published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,

    /// When the record was published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_published: Option<DateTime<Utc>>,

    /// The record data's MIME type.
    pub data_format: String,
}

impl Default for WriteDescriptor {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Write,
                message_timestamp: now,
            },
            recipient: None,
            protocol: None,
            protocol_path: None,
            schema: None,
            tags: None,
            parent_id: None,
            data_cid: String::new(),
            data_size: 0,
            date_created: now,
            published: None,
            date_published: None,
            data_format: "application/json".to_string(),
        }
    }
}

/// The payload of a write's authorization signature.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignaturePayload {
    /// The base signature payload.
    #[serde(flatten)]
    pub base: JwsPayload,

    /// The ID of the record the signature binds to.
    pub record_id: String,

    /// The context the signature binds to, for protocol records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// The CID of the message's attestation, when one is present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_cid: Option<String>,
}

/// The payload of an attestation signature: the descriptor CID and nothing
/// else.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Attestation {
    /// The CID of the descriptor being attested to.
    pub descriptor_cid: String,
}

/// A delegated grant carried inline in a message's authorization: the grant
/// record's write message, data included.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DelegatedGrant {
    /// The grant record's authorization (signed by the grantor).
    pub authorization: Box<Authorization>,

    /// The grant record's ID: the grant ID.
    pub record_id: String,

    /// The grant record's context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// The grant record's write descriptor.
    pub descriptor: WriteDescriptor,

    /// The grant's data payload, base64url-encoded.
    pub encoded_data: String,
}

impl DelegatedGrant {
    /// Convert the carried record into a [`permissions::Grant`].
    ///
    /// # Errors
    ///
    /// Fails when the grant data cannot be decoded.
    pub fn to_grant(&self) -> Result<permissions::Grant> {
        self.try_into()
    }
}

impl TryFrom<&Write> for DelegatedGrant {
    type Error = Error;

    fn try_from(write: &Write) -> Result<Self> {
        let Some(encoded_data) = write.encoded_data.clone() else {
            return Err(unexpected!("grant record has no data"));
        };
        Ok(Self {
            authorization: Box::new(write.authorization.clone()),
            record_id: write.record_id.clone(),
            context_id: write.context_id.clone(),
            descriptor: write.descriptor.clone(),
            encoded_data,
        })
    }
}

/// Compute a write's entry ID: the CID of its descriptor combined with its
/// author. The initial write of a record is the write whose entry ID equals
/// the record ID.
///
/// # Errors
///
/// Fails when the CID cannot be computed.
pub fn entry_id(descriptor: &WriteDescriptor, author: &str) -> Result<String> {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct EntryId<'a> {
        #[serde(flatten)]
        descriptor: &'a WriteDescriptor,
        author: &'a str,
    }

    cid::from_value(&EntryId { descriptor, author })
}

/// Record data provided to the [`WriteBuilder`].
#[derive(Clone, Debug)]
pub enum Data {
    /// Data bytes to ingest; the builder computes `data_cid` and
    /// `data_size`.
    Bytes(Vec<u8>),

    /// A data stream to ingest.
    Stream(DataStream),

    /// A reference to data already stored in the web node.
    Cid {
        /// The CID of the stored data.
        data_cid: String,

        /// The size of the stored data in bytes.
        data_size: usize,
    },
}

impl Default for Data {
    fn default() -> Self {
        Self::Bytes(Vec::new())
    }
}

impl From<Vec<u8>> for Data {
    fn from(data: Vec<u8>) -> Self {
        Self::Bytes(data)
    }
}

/// A protocol and protocol path pair for protocol-bound writes.
#[derive(Clone, Debug, Default)]
pub struct WriteProtocol {
    /// The protocol URI.
    pub protocol: String,

    /// The record's path within the protocol structure.
    pub protocol_path: String,
}

/// Options to use when creating a [`Write`] message.
#[derive(Clone, Debug, Default)]
pub struct WriteBuilder {
    data: Data,
    recipient: Option<String>,
    protocol: Option<WriteProtocol>,
    schema: Option<String>,
    tags: Option<Map<String, Value>>,
    parent_context_id: Option<String>,
    data_format: Option<String>,
    date_created: Option<DateTime<Utc>>,
    message_timestamp: Option<DateTime<Utc>>,
    published: Option<bool>,
    date_published: Option<DateTime<Utc>>,
    protocol_role: Option<String>,
    permission_grant_id: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
    existing: Option<Write>,
}

/// Create an update builder from a record's existing write, carrying over
/// the record's immutable properties.
impl From<Write> for WriteBuilder {
    fn from(existing: Write) -> Self {
        Self {
            data: Data::Cid {
                data_cid: existing.descriptor.data_cid.clone(),
                data_size: existing.descriptor.data_size,
            },
            recipient: existing.descriptor.recipient.clone(),
            schema: existing.descriptor.schema.clone(),
            data_format: Some(existing.descriptor.data_format.clone()),
            date_created: Some(existing.descriptor.date_created),
            published: existing.descriptor.published,
            date_published: existing.descriptor.date_published,
            existing: Some(existing),
            ..Self::default()
        }
    }
}

impl WriteBuilder {
    /// Returns a new [`WriteBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record's data.
    #[must_use]
    pub fn data(mut self, data: Data) -> Self {
        self.data = data;
        self
    }

    /// Set the record's recipient.
    #[must_use]
    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Write the record under the specified protocol and path.
    #[must_use]
    pub fn protocol(mut self, protocol: WriteProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Set the record's schema.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Add a searchable tag to the record.
    #[must_use]
    pub fn add_tag(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.get_or_insert_with(Map::new).insert(name.into(), value.into());
        self
    }

    /// Nest the record under the parent with the specified context.
    #[must_use]
    pub fn parent_context_id(mut self, parent_context_id: impl Into<String>) -> Self {
        self.parent_context_id = Some(parent_context_id.into());
        self
    }

    /// Set the record data's MIME type. Defaults to `application/json`.
    #[must_use]
    pub fn data_format(mut self, data_format: impl Into<String>) -> Self {
        self.data_format = Some(data_format.into());
        self
    }

    /// The datetime the record was created. Defaults to now.
    #[must_use]
    pub const fn date_created(mut self, date_created: DateTime<Utc>) -> Self {
        self.date_created = Some(date_created);
        self
    }

    /// The message's timestamp. Defaults to now.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Whether the record is published.
    #[must_use]
    pub const fn published(mut self, published: bool) -> Self {
        self.published = Some(published);
        self
    }

    /// The datetime the record was published. Defaults to now when
    /// publishing.
    #[must_use]
    pub const fn date_published(mut self, date_published: DateTime<Utc>) -> Self {
        self.date_published = Some(date_published);
        self
    }

    /// Invoke a protocol role to authorize the write.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// Invoke a permission grant to authorize the write.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// The delegated grant invoked to sign on behalf of the logical author,
    /// who is the grantor of the grant.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Build and sign the [`Write`] message.
    ///
    /// # Errors
    ///
    /// Fails when the builder options are inconsistent or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        self.build_inner(signer, None::<&NoSigner>).await
    }

    /// Build and sign the [`Write`] message, attaching an attestation
    /// signed by `attester`.
    ///
    /// # Errors
    ///
    /// Fails when the builder options are inconsistent or signing fails.
    pub async fn build_attested(
        self, signer: &impl Signer, attester: &impl Signer,
    ) -> Result<Write> {
        self.build_inner(signer, Some(attester)).await
    }

    #[allow(clippy::too_many_lines)]
    async fn build_inner(
        self, signer: &impl Signer, attester: Option<&impl Signer>,
    ) -> Result<Write> {
        let now = Utc::now();

        // resolve the data path: bytes or a reference to stored data
        let (data_cid, data_size, data_stream) = match self.data {
            Data::Bytes(bytes) => {
                let stream = DataStream::from(bytes);
                let (data_cid, data_size) = stream.compute_cid()?;
                (data_cid, data_size, Some(stream))
            }
            Data::Stream(stream) => {
                let (data_cid, data_size) = stream.compute_cid()?;
                (data_cid, data_size, Some(stream))
            }
            Data::Cid { data_cid, data_size } => (data_cid, data_size, None),
        };

        let published = self.published;
        let date_published = if published.unwrap_or_default() {
            // default `date_published` to now when publishing
            Some(self.date_published.unwrap_or(now))
        } else {
            None
        };

        let (protocol, protocol_path) = match &self.protocol {
            Some(write_protocol) => (
                Some(utils::clean_url(&write_protocol.protocol)?),
                Some(write_protocol.protocol_path.clone()),
            ),
            None => match &self.existing {
                Some(existing) => (
                    existing.descriptor.protocol.clone(),
                    existing.descriptor.protocol_path.clone(),
                ),
                None => (None, None),
            },
        };

        let schema = self.schema.map(|s| utils::clean_url(&s)).transpose()?;

        let parent_id = match &self.parent_context_id {
            Some(parent_context) => {
                let Some(parent_id) = parent_context.rsplit('/').next() else {
                    return Err(unexpected!("invalid parent context"));
                };
                Some(parent_id.to_string())
            }
            None => self.existing.as_ref().and_then(|e| e.descriptor.parent_id.clone()),
        };

        let descriptor = WriteDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Write,
                message_timestamp: self.message_timestamp.unwrap_or(now),
            },
            recipient: self.recipient,
            protocol,
            protocol_path,
            schema,
            tags: self.tags,
            parent_id,
            data_cid,
            data_size,
            date_created: self.date_created.unwrap_or(now),
            published,
            date_published,
            data_format: self.data_format.unwrap_or_else(|| "application/json".to_string()),
        };

        // the logical author: the delegated grant's grantor, or the signer
        let author = if let Some(delegated_grant) = &self.delegated_grant {
            delegated_grant.authorization.signature.did()?
        } else {
            let kid = signer.verification_method().await.map_err(|e| unexpected!("{e}"))?;
            let Some((did, _)) = kid.split_once('#') else {
                return Err(unexpected!("key id {kid} is not a DID URL"));
            };
            did.to_string()
        };

        // a new record's ID is its entry ID
        let record_id = match &self.existing {
            Some(existing) => existing.record_id.clone(),
            None => entry_id(&descriptor, &author)?,
        };

        // context applies to protocol records only
        let context_id = if descriptor.protocol.is_some() {
            match (&self.parent_context_id, &self.existing) {
                (Some(parent_context), _) => Some(format!("{parent_context}/{record_id}")),
                (None, Some(existing)) => existing.context_id.clone(),
                (None, None) => Some(record_id.clone()),
            }
        } else {
            None
        };

        let descriptor_cid = cid::from_value(&descriptor)?;

        let attestation = match attester {
            Some(attester) => {
                let payload = Attestation {
                    descriptor_cid: descriptor_cid.clone(),
                };
                Some(Jws::create(&payload, attester).await?)
            }
            None => None,
        };

        let payload = SignaturePayload {
            base: JwsPayload {
                descriptor_cid,
                permission_grant_id: self.permission_grant_id,
                delegated_grant_id: self
                    .delegated_grant
                    .as_ref()
                    .map(cid::from_value)
                    .transpose()?,
                protocol_role: self.protocol_role,
            },
            record_id: record_id.clone(),
            context_id: context_id.clone(),
            attestation_cid: attestation.as_ref().map(cid::from_value).transpose()?,
        };

        let authorization = Authorization {
            signature: Jws::create(&payload, signer).await?,
            owner_signature: None,
            author_delegated_grant: self.delegated_grant,
            owner_delegated_grant: None,
        };

        Ok(Write {
            record_id,
            context_id,
            descriptor,
            authorization,
            attestation,
            encoded_data: None,
            data_stream,
        })
    }
}

// Placeholder signer type for the no-attestation build path.
struct NoSigner;

impl Signer for NoSigner {
    async fn try_sign(&self, _: &[u8]) -> anyhow::Result<Vec<u8>> {
        unreachable!()
    }

    async fn verification_method(&self) -> anyhow::Result<String> {
        unreachable!()
    }

    fn algorithm(&self) -> crate::provider::Algorithm {
        crate::provider::Algorithm::EdDsa
    }
}
