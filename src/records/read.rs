//! # Records Read
//!
//! The records read endpoint handles `RecordsRead` messages — requests to
//! fetch a single record's latest state along with its data. A read of a
//! deleted record returns the tombstone: the delete plus the record's
//! initial write.

use base64ct::{Base64UrlUnpadded, Encoding};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::data::DataStream;
use crate::endpoint::{Message, Reply, Status};
use crate::provider::{MessageStore, Provider, Signer};
use crate::records::{self, DelegatedGrant, Delete, RecordsFilter, Write, protocol};
use crate::store::RecordsQueryBuilder;
use crate::{Descriptor, Error, Interface, Method, Result, cid, forbidden, permissions, unexpected};

/// Handle — or process — a [`Read`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs fetching the record.
pub async fn handle(owner: &str, read: Read, provider: &impl Provider) -> Result<Reply<ReadReply>> {
    let query = RecordsQueryBuilder::new()
        .method(None)
        .add_filter(read.descriptor.filter.clone())
        .build();
    let (entries, _) = MessageStore::query(provider, owner, &query).await?;
    if entries.is_empty() {
        return Err(Error::NotFound("no matching record found".to_string()));
    }
    if entries.len() > 1 {
        return Err(Error::BadRequest("filter matches more than one record".to_string()));
    }

    // a deleted record reads as its tombstone: the delete plus the
    // initial write, authorized against the initial write
    if let Some(delete) = entries[0].as_delete() {
        let Some(initial) =
            records::initial_write(owner, &delete.descriptor.record_id, provider).await?
        else {
            return Err(unexpected!("initial write for deleted record not found"));
        };

        read.authorize(owner, &initial, provider).await?;

        return Ok(Reply {
            status: Status {
                code: StatusCode::NOT_FOUND.as_u16(),
                detail: Some("record is deleted".to_string()),
            },
            body: Some(ReadReply {
                entry: ReadReplyEntry {
                    records_write: None,
                    records_delete: Some(delete.clone()),
                    initial_write: Some(initial),
                    data: None,
                },
            }),
        });
    }

    let mut write = Write::try_from(&entries[0])?;
    read.authorize(owner, &write, provider).await?;

    // resolve the record's data: inline or from the data store
    let data = if let Some(encoded) = write.encoded_data.take() {
        let bytes = Base64UrlUnpadded::decode_vec(&encoded)?;
        Some(DataStream::from(bytes))
    } else {
        DataStream::from_store(owner, &write.record_id, &write.descriptor.data_cid, provider)
            .await?
    };

    // attach the initial write when the latest write is not it
    let initial_write = if write.is_initial()? {
        None
    } else {
        let Some(mut initial) = records::initial_write(owner, &write.record_id, provider).await?
        else {
            return Err(unexpected!("initial write not found"));
        };
        initial.encoded_data = None;
        Some(initial)
    };

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(ReadReply {
            entry: ReadReplyEntry {
                records_write: Some(write),
                records_delete: None,
                initial_write,
                data,
            },
        }),
    })
}

/// The [`Read`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Read {
    /// The Read descriptor.
    pub descriptor: ReadDescriptor,

    /// The message authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

impl Message for Read {
    type Reply = ReadReply;

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

/// [`ReadReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReply {
    /// The read reply entry.
    pub entry: ReadReplyEntry,
}

/// The record state returned by a read.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReplyEntry {
    /// The latest `RecordsWrite` message of the record, when the record
    /// exists (is not deleted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_write: Option<Write>,

    /// The `RecordsDelete` message, when the record is deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_delete: Option<Delete>,

    /// The initial write of the record, when the returned write is not
    /// itself the initial write or when the record is deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_write: Option<Write>,

    /// The record's data.
    #[serde(skip)]
    pub data: Option<DataStream>,
}

impl Read {
    // Authorize the read of the provided record.
    async fn authorize(&self, owner: &str, write: &Write, provider: &impl Provider) -> Result<()> {
        // published records require no authorization
        if write.descriptor.published.unwrap_or_default() {
            return Ok(());
        }

        let Some(authzn) = &self.authorization else {
            return Err(forbidden!("unpublished record requires authorization"));
        };
        let author = authzn.author()?;

        // when signed by a delegate, the delegation must cover the record
        if let Some(delegated_grant) = &authzn.author_delegated_grant {
            let grant = delegated_grant.to_grant()?;
            grant.verify_delegated_read(&author, write)?;
        }

        // the owner, the record's author, and its recipient can read
        if author == owner {
            return Ok(());
        }
        if write.descriptor.recipient.as_deref() == Some(author.as_str()) {
            return Ok(());
        }
        if author == write.authorization.author()? {
            return Ok(());
        }

        // a grant may authorize the read
        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
            grant.permit_read(owner, &author, self, write, provider).await?;
            return Ok(());
        }

        // a protocol action rule or role may authorize the read
        if write.descriptor.protocol.is_some() {
            let authorizer = protocol::Authorizer::new(owner);
            return authorizer.permit_read(self, write, provider).await;
        }

        Err(forbidden!("read cannot be authorized"))
    }
}

/// The [`Read`] message descriptor.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter identifying the record to read.
    pub filter: RecordsFilter,
}

impl Default for ReadDescriptor {
    fn default() -> Self {
        Self {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Read,
                message_timestamp: chrono::Utc::now(),
            },
            filter: RecordsFilter::default(),
        }
    }
}

/// Options to use when creating a [`Read`] message.
#[derive(Clone, Debug, Default)]
pub struct ReadBuilder {
    filter: RecordsFilter,
    protocol_role: Option<String>,
    permission_grant_id: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
    authorize: Option<bool>,
}

impl ReadBuilder {
    /// Returns a new [`ReadBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the filter identifying the record to read.
    #[must_use]
    pub fn filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Invoke a protocol role to authorize the read.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// Invoke a permission grant to authorize the read.
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

    /// Whether to sign the read. Defaults to `true`.
    #[must_use]
    pub const fn authorize(mut self, authorize: bool) -> Self {
        self.authorize = Some(authorize);
        self
    }

    /// Build and (optionally) sign the [`Read`] message.
    ///
    /// # Errors
    ///
    /// Fails when the filter URLs are invalid or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Read> {
        let descriptor = ReadDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Read,
                message_timestamp: chrono::Utc::now(),
            },
            filter: self.filter.normalize()?,
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

        Ok(Read {
            descriptor,
            authorization,
        })
    }
}
