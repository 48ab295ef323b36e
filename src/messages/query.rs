//! # Messages Query
//!
//! The messages query endpoint handles `MessagesQuery` messages — requests
//! to query the [`EventLog`] for matching persisted messages of any type.

use http::StatusCode;
use serde::{Deserialize, Serialize};

use super::MessagesFilter;
use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::provider::{EventLog, Provider, Signer};
use crate::store::{self, Cursor, MessagesQuery};
use crate::{Descriptor, Interface, Method, Result, cid, forbidden, permissions};

/// Handle — or process — a [`Query`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs querying the [`EventLog`].
pub async fn handle(
    owner: &str, query: Query, provider: &impl Provider,
) -> Result<Reply<QueryReply>> {
    query.authorize(owner, provider).await?;

    let store_query = store::Query::Messages(MessagesQuery {
        filters: query.descriptor.filters.clone(),
    });
    let (events, cursor) = EventLog::query(provider, owner, &store_query).await?;

    let mut entries = vec![];
    for event in &events {
        entries.push(event.cid()?);
    }
    let entries = if entries.is_empty() { None } else { Some(entries) };

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(QueryReply { entries, cursor }),
    })
}

/// The [`Query`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Query {
    /// The Query descriptor.
    pub descriptor: QueryDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Query {
    type Reply = QueryReply;

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

impl Query {
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let authzn = &self.authorization;
        let author = authzn.author()?;

        if author == owner {
            return Ok(());
        }

        // a non-owner must invoke a grant covering `MessagesQuery`
        let Some(grant_id) = &authzn.payload()?.permission_grant_id else {
            return Err(forbidden!("author has no grant"));
        };
        let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
        grant.verify(owner, &author, &self.descriptor.base, provider).await?;

        // a protocol-scoped grant only covers filters naming the protocol
        if let Some(protocol) = grant.data.scope.protocol() {
            for filter in &self.descriptor.filters {
                if filter.protocol.as_deref() != Some(protocol) {
                    return Err(forbidden!("filter and grant protocols do not match"));
                }
            }
        }

        Ok(())
    }
}

/// [`QueryReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct QueryReply {
    /// The CIDs of messages matching the query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<String>>,

    /// Pagination cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// The [`Query`] message descriptor.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// Filters to apply when querying for messages.
    pub filters: Vec<MessagesFilter>,

    /// The pagination cursor to resume from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

impl Default for QueryDescriptor {
    fn default() -> Self {
        Self {
            base: Descriptor {
                interface: Interface::Messages,
                method: Method::Query,
                message_timestamp: chrono::Utc::now(),
            },
            filters: Vec::new(),
            cursor: None,
        }
    }
}

/// Options to use when creating a [`Query`] message.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    filters: Vec<MessagesFilter>,
    permission_grant_id: Option<String>,
}

impl QueryBuilder {
    /// Returns a new [`QueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter events must match.
    #[must_use]
    pub fn add_filter(mut self, filter: MessagesFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Invoke a permission grant to authorize the query.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Build and sign the [`Query`] message.
    ///
    /// # Errors
    ///
    /// Fails when signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Query> {
        let descriptor = QueryDescriptor {
            base: Descriptor {
                interface: Interface::Messages,
                method: Method::Query,
                message_timestamp: chrono::Utc::now(),
            },
            filters: self.filters,
            cursor: None,
        };

        let mut builder = AuthorizationBuilder::new().descriptor_cid(cid::from_value(&descriptor)?);
        if let Some(grant_id) = self.permission_grant_id {
            builder = builder.permission_grant_id(grant_id);
        }
        let authorization = builder.build(signer).await?;

        Ok(Query {
            descriptor,
            authorization,
        })
    }
}
