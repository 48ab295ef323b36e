//! # Records Query
//!
//! The records query endpoint handles `RecordsQuery` messages — requests to
//! query the latest state of matching records. Anonymous requestors see
//! published records only; authenticated non-owners additionally see
//! records they authored or received, or that an invoked role admits.

use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::provider::{MessageStore, Provider, Signer};
use crate::records::{self, DelegatedGrant, RecordsFilter, Sort, Write, protocol};
use crate::store::{self, Cursor, Pagination, RecordsQueryBuilder};
use crate::{Descriptor, Interface, Method, Result, cid, forbidden, invalid, permissions, utils};

/// Handle — or process — a [`Query`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs querying the [`MessageStore`].
pub async fn handle(
    owner: &str, query: Query, provider: &impl Provider,
) -> Result<Reply<QueryReply>> {
    query.validate()?;

    let store_query = if query.only_published() {
        // unauthenticated queries return published records only
        let mut query = query;
        query.descriptor.filter.published = Some(true);
        store_query(&query, None)
    } else {
        query.authorize(owner, provider).await?;
        let Some(authzn) = &query.authorization else {
            return Err(forbidden!("missing authorization"));
        };

        if authzn.author()? == owner {
            store_query(&query, None)
        } else {
            query.as_non_owner()?
        }
    };

    let (entries, cursor) = MessageStore::query(provider, owner, &store_query).await?;
    if entries.is_empty() {
        return Ok(Reply {
            status: Status {
                code: StatusCode::OK.as_u16(),
                detail: None,
            },
            body: None,
        });
    }

    let mut reply_entries = vec![];
    for entry in entries {
        let write: Write = (&entry).try_into()?;

        // attach the initial write when the latest write is not it
        let initial_write = if write.is_initial()? {
            None
        } else {
            let Some(mut initial) =
                records::initial_write(owner, &write.record_id, provider).await?
            else {
                return Err(crate::unexpected!("initial write not found"));
            };
            initial.encoded_data = None;
            Some(initial)
        };

        reply_entries.push(QueryReplyEntry {
            write,
            initial_write,
        });
    }

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(QueryReply {
            entries: Some(reply_entries),
            cursor,
        }),
    })
}

fn store_query(query: &Query, extra_filters: Option<Vec<RecordsFilter>>) -> store::Query {
    let mut builder = RecordsQueryBuilder::new();
    if let Some(sort) = &query.descriptor.date_sort {
        builder = builder.sort(sort.clone());
    }
    if let Some(pagination) = &query.descriptor.pagination {
        builder = builder.pagination(pagination.clone());
    }

    match extra_filters {
        Some(filters) => {
            for filter in filters {
                builder = builder.add_filter(filter);
            }
        }
        None => builder = builder.add_filter(query.descriptor.filter.clone()),
    }

    builder.build()
}

/// The [`Query`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// The Query descriptor.
    pub descriptor: QueryDescriptor,

    /// The message authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
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
        self.authorization.as_ref()
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

/// [`QueryReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReply {
    /// Query reply entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<QueryReplyEntry>>,

    /// Pagination cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// [`QueryReplyEntry`] represents a [`Write`] entry returned by the query.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReplyEntry {
    /// The latest `RecordsWrite` message of the record.
    #[serde(flatten)]
    pub write: Write,

    /// The initial write of the record, when the latest write is not
    /// itself the initial write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_write: Option<Write>,
}

impl Query {
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let Some(authzn) = &self.authorization else {
            return Err(forbidden!("missing authorization"));
        };
        let author = authzn.author()?;

        // when signed by a delegate, the delegation must cover this query
        if let Some(delegated_grant) = &authzn.author_delegated_grant {
            let grant = delegated_grant.to_grant()?;
            grant.verify_delegated_query(&author, &self.descriptor.filter)?;
        }

        if author == owner {
            return Ok(());
        }

        // a grant may authorize the query
        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
            grant.permit_query(owner, &author, &self.descriptor.base, &self.descriptor.filter, provider)
                .await?;
            return Ok(());
        }

        // a role may authorize the query
        if authzn.payload()?.protocol_role.is_some() {
            let filter = &self.descriptor.filter;
            if filter.protocol.is_none() {
                return Err(invalid!("missing `protocol` for role-authorized query"));
            }
            if filter.protocol_path.is_none() {
                return Err(invalid!("missing `protocol_path` for role-authorized query"));
            }
            if filter.protocol_path.as_ref().is_some_and(|path| path.contains('/'))
                && filter.context_id.is_none()
            {
                return Err(invalid!("missing `context_id` for contextual role"));
            }

            let authorizer = protocol::Authorizer::new(owner);
            return authorizer.permit_query(self, provider).await;
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if let Some(protocol) = &self.descriptor.filter.protocol {
            utils::validate_url(protocol)?;
        }
        if let Some(schema) = &self.descriptor.filter.schema {
            utils::validate_url(schema)?;
        }

        // sorting on publication date requires published records
        if self.descriptor.filter.published == Some(false)
            && (self.descriptor.date_sort == Some(Sort::PublishedAsc)
                || self.descriptor.date_sort == Some(Sort::PublishedDesc))
        {
            return Err(invalid!(
                "cannot sort by `date_published` when querying for unpublished records"
            ));
        }

        Ok(())
    }

    // Whether the query can only return published records: it filters on
    // publication state or carries no authorization.
    fn only_published(&self) -> bool {
        if let Some(published) = self.descriptor.filter.published {
            return published;
        }
        if self.descriptor.filter.date_published.is_some() {
            return true;
        }
        if self.descriptor.date_sort == Some(Sort::PublishedAsc)
            || self.descriptor.date_sort == Some(Sort::PublishedDesc)
        {
            return true;
        }
        self.authorization.is_none()
    }

    // When the requestor is not the owner, rewrite the filter so only
    // records they may see can match: published records, records they
    // authored, records they received, and (with a role) any record the
    // role admits.
    fn as_non_owner(&self) -> Result<store::Query> {
        let Some(authzn) = &self.authorization else {
            return Err(forbidden!("missing authorization"));
        };
        let author = authzn.author()?;

        let mut filters = vec![];

        // published records matching the filter
        if self.descriptor.filter.published.is_none() {
            filters.push(self.descriptor.filter.clone().published(true));
        }

        // unpublished records the requestor authored
        let mut filter = self.descriptor.filter.clone();
        filter.author = None;
        filters.push(filter.add_author(&author).published(false));

        // unpublished records intended for the requestor
        let mut filter = self.descriptor.filter.clone();
        filter.recipient = None;
        filters.push(filter.add_recipient(&author).published(false));

        // an invoked role admits any matching record
        if authzn.payload()?.protocol_role.is_some() {
            filters.push(self.descriptor.filter.clone().published(false));
        }

        Ok(store_query(self, Some(filters)))
    }
}

/// The [`Query`] message descriptor.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter records must match.
    pub filter: RecordsFilter,

    /// The sort order for returned records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_sort: Option<Sort>,

    /// Pagination settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl Default for QueryDescriptor {
    fn default() -> Self {
        Self {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Query,
                message_timestamp: chrono::Utc::now(),
            },
            filter: RecordsFilter::default(),
            date_sort: None,
            pagination: None,
        }
    }
}

/// Options to use when creating a [`Query`] message.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    filter: RecordsFilter,
    date_sort: Option<Sort>,
    pagination: Option<Pagination>,
    protocol_role: Option<String>,
    permission_grant_id: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
    authorize: Option<bool>,
}

impl QueryBuilder {
    /// Returns a new [`QueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the filter records must match.
    #[must_use]
    pub fn filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Set the sort order for returned records.
    #[must_use]
    pub fn date_sort(mut self, date_sort: Sort) -> Self {
        self.date_sort = Some(date_sort);
        self
    }

    /// Set pagination.
    #[must_use]
    pub fn pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }

    /// Invoke a protocol role to authorize the query.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// Invoke a permission grant to authorize the query.
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

    /// Whether to sign the query. Defaults to `true`.
    #[must_use]
    pub const fn authorize(mut self, authorize: bool) -> Self {
        self.authorize = Some(authorize);
        self
    }

    /// Build and (optionally) sign the [`Query`] message.
    ///
    /// # Errors
    ///
    /// Fails when the filter URLs are invalid or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Query> {
        let descriptor = QueryDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Query,
                message_timestamp: chrono::Utc::now(),
            },
            filter: self.filter.normalize()?,
            date_sort: self.date_sort,
            pagination: self.pagination,
        };

        let authorization = if self.authorize.unwrap_or(true) {
            let mut builder =
                AuthorizationBuilder::new().descriptor_cid(cid::from_value(&descriptor)?);
            if let Some(role) = self.protocol_role {
                builder = builder.protocol_role(role);
            }
            if let Some(grant_id) = self.permission_grant_id {
                builder = builder.permission_grant_id(grant_id);
            }
            if let Some(delegated_grant) = self.delegated_grant {
                builder = builder.delegated_grant(delegated_grant);
            }
            Some(builder.build(signer).await?)
        } else {
            None
        };

        Ok(Query {
            descriptor,
            authorization,
        })
    }
}
