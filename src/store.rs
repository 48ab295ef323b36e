//! # Store
//!
//! Storage-facing message representation and query model. An [`Entry`] pairs
//! a stored message with the flattened index keys it is searchable by;
//! [`Query`] carries filters, sort, and pagination, and implements the
//! matching and ordering rules store implementations delegate to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::endpoint::Message;
use crate::messages::MessagesFilter;
use crate::protocols::Configure;
use crate::records::{Delete, RecordsFilter, Sort, TagFilter, Write};
use crate::{Descriptor, Method, Result, unexpected};

/// A stored message with its searchable indexes.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Entry {
    /// The stored message.
    #[serde(flatten)]
    pub message: EntryType,

    /// Flattened index keys the entry is searchable by.
    #[serde(skip)]
    pub indexes: BTreeMap<String, String>,
}

/// The message types persisted in the message store.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EntryType {
    /// A `RecordsWrite` message.
    Write(Write),

    /// A `ProtocolsConfigure` message.
    Configure(Configure),

    /// A `RecordsDelete` message.
    Delete(Delete),
}

impl Entry {
    /// Compute the CID of the stored message.
    ///
    /// # Errors
    ///
    /// Fails when the message cannot be serialized.
    pub fn cid(&self) -> Result<String> {
        match &self.message {
            EntryType::Write(write) => write.cid(),
            EntryType::Configure(configure) => crate::cid::from_value(configure),
            EntryType::Delete(delete) => crate::cid::from_value(delete),
        }
    }

    /// The base descriptor of the stored message.
    #[must_use]
    pub const fn descriptor(&self) -> &Descriptor {
        match &self.message {
            EntryType::Write(write) => &write.descriptor.base,
            EntryType::Configure(configure) => &configure.descriptor.base,
            EntryType::Delete(delete) => &delete.descriptor.base,
        }
    }

    /// The entry as a `RecordsWrite`, if it is one.
    #[must_use]
    pub const fn as_write(&self) -> Option<&Write> {
        match &self.message {
            EntryType::Write(write) => Some(write),
            _ => None,
        }
    }

    /// The entry as a `RecordsDelete`, if it is one.
    #[must_use]
    pub const fn as_delete(&self) -> Option<&Delete> {
        match &self.message {
            EntryType::Delete(delete) => Some(delete),
            _ => None,
        }
    }

    /// The entry as a `ProtocolsConfigure`, if it is one.
    #[must_use]
    pub const fn as_configure(&self) -> Option<&Configure> {
        match &self.message {
            EntryType::Configure(configure) => Some(configure),
            _ => None,
        }
    }

    /// Add an index key to the entry.
    pub fn add_index(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.indexes.insert(key.into(), value.into());
    }

    /// The `record_id` of the stored message, when it has one.
    #[must_use]
    pub fn record_id(&self) -> Option<&str> {
        match &self.message {
            EntryType::Write(write) => Some(&write.record_id),
            EntryType::Delete(delete) => Some(&delete.descriptor.record_id),
            EntryType::Configure(_) => None,
        }
    }
}

impl From<&Write> for Entry {
    fn from(write: &Write) -> Self {
        Self {
            message: EntryType::Write(write.clone()),
            indexes: write.build_indexes(),
        }
    }
}

impl From<&Delete> for Entry {
    fn from(delete: &Delete) -> Self {
        Self {
            message: EntryType::Delete(delete.clone()),
            indexes: delete.build_indexes(),
        }
    }
}

impl From<&Configure> for Entry {
    fn from(configure: &Configure) -> Self {
        Self {
            message: EntryType::Configure(configure.clone()),
            indexes: configure.build_indexes(),
        }
    }
}

impl TryFrom<&Entry> for Write {
    type Error = crate::Error;

    fn try_from(entry: &Entry) -> Result<Self> {
        match &entry.message {
            EntryType::Write(write) => Ok(write.clone()),
            _ => Err(unexpected!("expected `RecordsWrite` message")),
        }
    }
}

impl TryFrom<Entry> for Write {
    type Error = crate::Error;

    fn try_from(entry: Entry) -> Result<Self> {
        match entry.message {
            EntryType::Write(write) => Ok(write),
            _ => Err(unexpected!("expected `RecordsWrite` message")),
        }
    }
}

/// A pagination cursor: the sort value and CID of the last entry returned.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// The CID of the last message returned.
    pub message_cid: String,

    /// The sort-field value of the last message returned.
    pub value: String,
}

/// Pagination options for a query.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    /// The maximum number of entries to return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// The cursor to resume from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// A store query.
#[derive(Clone, Debug)]
pub enum Query {
    /// Query for record entries.
    Records(RecordsQuery),

    /// Query for message events.
    Messages(MessagesQuery),

    /// Query for protocol configurations.
    Protocols(ProtocolsQuery),
}

impl Query {
    /// Check whether the entry matches the query, disregarding pagination.
    #[must_use]
    pub fn is_match(&self, entry: &Entry) -> bool {
        match self {
            Self::Records(query) => query.is_match(entry),
            Self::Messages(query) => query.is_match(entry),
            Self::Protocols(query) => query.is_match(entry),
        }
    }

    /// Filter, sort, and paginate the provided entries.
    ///
    /// Store implementations pass the full set of a tenant's entries;
    /// matching, ordering (including the CID tie-break), and cursor
    /// handling are applied here so every backend behaves identically.
    ///
    /// # Errors
    ///
    /// Fails when an entry's CID cannot be computed.
    pub fn apply(&self, entries: &[Entry]) -> Result<(Vec<Entry>, Option<Cursor>)> {
        let mut matched: Vec<(String, String, Entry)> = Vec::new();

        for entry in entries {
            if self.is_match(entry) {
                matched.push((self.sort_value(entry), entry.cid()?, entry.clone()));
            }
        }

        let descending = match self {
            Self::Records(query) => {
                matches!(query.sort, Sort::CreatedDesc | Sort::PublishedDesc | Sort::TimestampDesc)
            }
            Self::Messages(_) | Self::Protocols(_) => false,
        };

        // order by sort value, breaking ties with the message CID
        matched.sort_by(|a, b| {
            let ordering = (&a.0, &a.1).cmp(&(&b.0, &b.1));
            if descending { ordering.reverse() } else { ordering }
        });

        let pagination = match self {
            Self::Records(query) => query.pagination.clone(),
            Self::Messages(_) | Self::Protocols(_) => None,
        };

        // resume after the cursor entry
        if let Some(cursor) = pagination.as_ref().and_then(|p| p.cursor.as_ref()) {
            let key = (&cursor.value, &cursor.message_cid);
            matched.retain(|(value, cid, _)| {
                let entry_key = (value, cid);
                if descending { entry_key < key } else { entry_key > key }
            });
        }

        let mut cursor = None;
        if let Some(limit) = pagination.as_ref().and_then(|p| p.limit) {
            if matched.len() > limit {
                matched.truncate(limit);
                cursor = matched.last().map(|(value, cid, _)| Cursor {
                    message_cid: cid.clone(),
                    value: value.clone(),
                });
            }
        }

        Ok((matched.into_iter().map(|(.., entry)| entry).collect(), cursor))
    }

    fn sort_value(&self, entry: &Entry) -> String {
        let field = match self {
            Self::Records(query) => query.sort.to_string(),
            Self::Messages(_) | Self::Protocols(_) => "messageTimestamp".to_string(),
        };
        entry.indexes.get(&field).cloned().unwrap_or_default()
    }
}

/// A query over record entries.
#[derive(Clone, Debug)]
pub struct RecordsQuery {
    /// Filters to match entries against (disjunction across the list).
    pub filters: Vec<RecordsFilter>,

    /// Restrict matching to the specified method; `None` matches both
    /// writes and deletes.
    pub method: Option<Method>,

    /// Include superseded initial-write stubs.
    pub include_archived: bool,

    /// The sort order.
    pub sort: Sort,

    /// Pagination settings.
    pub pagination: Option<Pagination>,
}

impl Default for RecordsQuery {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            method: Some(Method::Write),
            include_archived: false,
            sort: Sort::default(),
            pagination: None,
        }
    }
}

impl RecordsQuery {
    fn is_match(&self, entry: &Entry) -> bool {
        let indexes = &entry.indexes;

        if indexes.get("interface").map(String::as_str) != Some("Records") {
            return false;
        }
        if let Some(method) = &self.method {
            if indexes.get("method") != Some(&method.to_string()) {
                return false;
            }
        } else if entry.as_configure().is_some() {
            return false;
        }
        if !self.include_archived && indexes.get("archived").map(String::as_str) == Some("true") {
            return false;
        }

        if self.filters.is_empty() {
            return true;
        }
        self.filters.iter().any(|filter| filter.is_match(indexes))
    }
}

/// A query over the event log.
#[derive(Clone, Debug, Default)]
pub struct MessagesQuery {
    /// Filters to match events against (disjunction across the list).
    pub filters: Vec<MessagesFilter>,
}

impl MessagesQuery {
    fn is_match(&self, entry: &Entry) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        self.filters.iter().any(|filter| filter.is_match(entry))
    }
}

/// A query over protocol configurations.
#[derive(Clone, Debug, Default)]
pub struct ProtocolsQuery {
    /// Match configurations for the specified protocol URI.
    pub protocol: Option<String>,

    /// Match configurations by their published flag.
    pub published: Option<bool>,
}

impl ProtocolsQuery {
    fn is_match(&self, entry: &Entry) -> bool {
        let Some(configure) = entry.as_configure() else {
            return false;
        };

        if let Some(protocol) = &self.protocol {
            if &configure.descriptor.definition.protocol != protocol {
                return false;
            }
        }
        if let Some(published) = self.published {
            if configure.descriptor.definition.published != published {
                return false;
            }
        }
        true
    }
}

/// Builder for [`Query::Records`] queries.
#[derive(Clone, Debug, Default)]
pub struct RecordsQueryBuilder {
    query: RecordsQuery,
}

impl RecordsQueryBuilder {
    /// Returns a new [`RecordsQueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter to the query.
    #[must_use]
    pub fn add_filter(mut self, filter: RecordsFilter) -> Self {
        self.query.filters.push(filter);
        self
    }

    /// Restrict matching to the specified method; `None` matches writes and
    /// deletes.
    #[must_use]
    pub fn method(mut self, method: Option<Method>) -> Self {
        self.query.method = method;
        self
    }

    /// Include superseded initial-write stubs in results.
    #[must_use]
    pub const fn include_archived(mut self, include_archived: bool) -> Self {
        self.query.include_archived = include_archived;
        self
    }

    /// Set the sort order.
    #[must_use]
    pub fn sort(mut self, sort: Sort) -> Self {
        self.query.sort = sort;
        self
    }

    /// Set pagination.
    #[must_use]
    pub fn pagination(mut self, pagination: Pagination) -> Self {
        self.query.pagination = Some(pagination);
        self
    }

    /// Build the query.
    #[must_use]
    pub fn build(self) -> Query {
        Query::Records(self.query)
    }
}

impl RecordsFilter {
    /// Check whether the provided entry indexes satisfy the filter.
    #[allow(clippy::too_many_lines)]
    #[must_use]
    pub fn is_match(&self, indexes: &BTreeMap<String, String>) -> bool {
        if let Some(record_id) = &self.record_id {
            if indexes.get("recordId") != Some(record_id) {
                return false;
            }
        }
        if let Some(author) = &self.author {
            let Some(entry_author) = indexes.get("author") else {
                return false;
            };
            if !author.to_vec().contains(entry_author) {
                return false;
            }
        }
        if let Some(attester) = &self.attester {
            if indexes.get("attester") != Some(attester) {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            let Some(entry_recipient) = indexes.get("recipient") else {
                return false;
            };
            if !recipient.to_vec().contains(entry_recipient) {
                return false;
            }
        }
        if let Some(context_id) = &self.context_id {
            // context matching is subtree-inclusive
            let Some(entry_context) = indexes.get("contextId") else {
                return false;
            };
            if !context_prefix(entry_context, context_id) {
                return false;
            }
        }
        if let Some(parent_id) = &self.parent_id {
            if indexes.get("parentId") != Some(parent_id) {
                return false;
            }
        }
        if let Some(protocol) = &self.protocol {
            if indexes.get("protocol") != Some(protocol) {
                return false;
            }
        }
        if let Some(protocol_path) = &self.protocol_path {
            if indexes.get("protocolPath") != Some(protocol_path) {
                return false;
            }
        }
        if let Some(schema) = &self.schema {
            if indexes.get("schema") != Some(schema) {
                return false;
            }
        }
        if let Some(data_format) = &self.data_format {
            if indexes.get("dataFormat") != Some(data_format) {
                return false;
            }
        }
        if let Some(data_cid) = &self.data_cid {
            if indexes.get("dataCid") != Some(data_cid) {
                return false;
            }
        }
        if let Some(data_size) = &self.data_size {
            let Some(size) = indexes.get("dataSize").and_then(|s| s.parse::<usize>().ok()) else {
                return false;
            };
            if !data_size.contains(&size) {
                return false;
            }
        }
        if let Some(published) = self.published {
            if indexes.get("published") != Some(&published.to_string()) {
                return false;
            }
        }
        if let Some(date_created) = &self.date_created {
            if !date_in_range(indexes.get("dateCreated"), date_created) {
                return false;
            }
        }
        if let Some(date_published) = &self.date_published {
            if !date_in_range(indexes.get("datePublished"), date_published) {
                return false;
            }
        }
        if let Some(date_updated) = &self.date_updated {
            if !date_in_range(indexes.get("dateUpdated"), date_updated) {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            for (name, filter) in tags {
                let Some(value) = indexes.get(&format!("tag.{name}")) else {
                    return false;
                };
                if !filter.is_match(value) {
                    return false;
                }
            }
        }

        true
    }
}

impl TagFilter {
    fn is_match(&self, value: &str) -> bool {
        match self {
            Self::StartsWith(prefix) => value.starts_with(prefix),
            Self::Range(range) => {
                value.parse::<usize>().is_ok_and(|number| range.contains(&number))
            }
            Self::Equal(expected) => match expected {
                serde_json::Value::String(s) => value == s,
                other => value == other.to_string(),
            },
        }
    }
}

// A context is matched by its own id and by any ancestor id.
fn context_prefix(context_id: &str, prefix: &str) -> bool {
    let Some(rest) = context_id.strip_prefix(prefix) else {
        return false;
    };
    rest.is_empty() || rest.starts_with('/')
}

// Compare an RFC 3339 (micros, UTC) index value against a date range.
fn date_in_range(value: Option<&String>, range: &crate::DateRange) -> bool {
    let Some(date) = value.and_then(|v| v.parse::<chrono::DateTime<chrono::Utc>>().ok()) else {
        return false;
    };
    range.contains(&date)
}
