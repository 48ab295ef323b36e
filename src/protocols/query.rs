//! # Protocols Query
//!
//! The protocols query endpoint handles `ProtocolsQuery` messages —
//! requests to fetch the protocol definitions configured for a tenant.
//! Anonymous and unauthorized requestors see only published definitions.

use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::protocols::Configure;
use crate::provider::{MessageStore, Provider, Signer};
use crate::store::{self, ProtocolsQuery};
use crate::{Descriptor, Interface, Method, Result, cid, permissions, utils};

/// Handle — or process — a [`Query`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs querying the [`MessageStore`].
pub async fn handle(
    owner: &str, query: Query, provider: &impl Provider,
) -> Result<Reply<QueryReply>> {
    let published_only = !query.authorize(owner, provider).await?;

    let protocol = query.descriptor.filter.as_ref().map(|f| f.protocol.clone());
    let store_query = store::Query::Protocols(ProtocolsQuery {
        protocol,
        published: if published_only { Some(true) } else { None },
    });

    let (entries, _) = MessageStore::query(provider, owner, &store_query).await?;

    let mut configures = vec![];
    for entry in entries {
        if let Some(configure) = entry.as_configure() {
            configures.push(configure.clone());
        }
    }
    let entries = if configures.is_empty() { None } else { Some(configures) };

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(QueryReply { entries }),
    })
}

/// The [`Query`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
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

impl Query {
    // Authorize the query, returning whether the requestor may see
    // unpublished definitions.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<bool> {
        let Some(authzn) = &self.authorization else {
            return Ok(false);
        };
        let author = authzn.author()?;

        if author == owner {
            return Ok(true);
        }

        // a grant covering `ProtocolsQuery` admits unpublished definitions
        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
            grant.verify(owner, &author, &self.descriptor.base, provider).await?;

            if let (Some(scope_protocol), Some(filter)) =
                (grant.data.scope.protocol(), &self.descriptor.filter)
            {
                if scope_protocol != filter.protocol {
                    return Err(crate::forbidden!("filter protocol does not match grant scope"));
                }
            }
            return Ok(true);
        }

        Ok(false)
    }
}

/// [`QueryReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct QueryReply {
    /// The matching protocol configurations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<Configure>>,
}

/// The [`Query`] message descriptor.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter to apply when querying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
}

impl Default for QueryDescriptor {
    fn default() -> Self {
        Self {
            base: Descriptor {
                interface: Interface::Protocols,
                method: Method::Query,
                message_timestamp: chrono::Utc::now(),
            },
            filter: None,
        }
    }
}

/// A protocols query filter.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Filter {
    /// The protocol URI to match.
    pub protocol: String,
}

/// Options to use when creating a [`Query`] message.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    filter: Option<String>,
    permission_grant_id: Option<String>,
    authorize: Option<bool>,
}

impl QueryBuilder {
    /// Returns a new [`QueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Match configurations for the specified protocol.
    #[must_use]
    pub fn filter(mut self, protocol: impl Into<String>) -> Self {
        self.filter = Some(protocol.into());
        self
    }

    /// Invoke a permission grant to authorize the query.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
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
    /// Fails when the filter protocol is invalid or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Query> {
        let filter = match self.filter {
            Some(protocol) => Some(Filter {
                protocol: utils::clean_url(&protocol)?,
            }),
            None => None,
        };

        let descriptor = QueryDescriptor {
            base: Descriptor {
                interface: Interface::Protocols,
                method: Method::Query,
                message_timestamp: chrono::Utc::now(),
            },
            filter,
        };

        let authorization = if self.authorize.unwrap_or(true) {
            let mut builder =
                AuthorizationBuilder::new().descriptor_cid(cid::from_value(&descriptor)?);
            if let Some(grant_id) = self.permission_grant_id {
                builder = builder.permission_grant_id(grant_id);
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
