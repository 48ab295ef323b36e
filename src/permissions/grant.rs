//! # Grants
//!
//! Grant issuance, invocation checks, and revocation. A grant is a record
//! written by the grantor under the reserved permissions protocol; its
//! `record_id` is the grant id. A revocation is a child record of the
//! grant.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::permissions::{self, ConditionPublication, Conditions, RecordsOptions, Scope};
use crate::protocols::PROTOCOL_URI;
use crate::provider::{MessageStore, Signer};
use crate::records::{
    Data, DelegatedGrant, Delete, Read, RecordsFilter, Write, WriteBuilder, WriteProtocol,
};
use crate::store::RecordsQueryBuilder;
use crate::{Descriptor, Method, Result, forbidden, unexpected};

/// A permission grant, unpacked from its record.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Grant {
    /// The grant's id: the `record_id` of the grant record.
    pub id: String,

    /// The DID that issued the grant.
    pub grantor: String,

    /// The DID the grant was issued to.
    pub grantee: String,

    /// When the grant became active.
    pub date_granted: DateTime<Utc>,

    /// The grant's data payload.
    pub data: GrantData,
}

/// A grant record's data payload.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GrantData {
    /// When the grant expires.
    pub date_expires: DateTime<Utc>,

    /// The `record_id` of the permission request the grant answers, when
    /// there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// A human-readable description of the grant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether the grantee may sign messages as the grantor within scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegated: Option<bool>,

    /// The operations the grant covers.
    pub scope: Scope,

    /// Conditions that must be met when the grant is invoked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,
}

/// A permission request record's data payload.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    /// A human-readable description of the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether a delegated grant is requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegated: Option<bool>,

    /// The operations the requested grant should cover.
    pub scope: Scope,
}

/// A revocation record's data payload.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RevocationData {
    /// A human-readable description of the revocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TryFrom<&Write> for Grant {
    type Error = crate::Error;

    fn try_from(write: &Write) -> Result<Self> {
        let Some(encoded) = &write.encoded_data else {
            return Err(forbidden!("missing grant data"));
        };
        let data: GrantData = permissions::decode_data(encoded)?;
        data.scope.validate()?;

        Ok(Self {
            id: write.record_id.clone(),
            grantor: write.authorization.signer()?,
            grantee: write.descriptor.recipient.clone().unwrap_or_default(),
            date_granted: write.descriptor.date_created,
            data,
        })
    }
}

impl TryFrom<&DelegatedGrant> for Grant {
    type Error = crate::Error;

    fn try_from(delegated: &DelegatedGrant) -> Result<Self> {
        let data: GrantData = permissions::decode_data(&delegated.encoded_data)?;
        data.scope.validate()?;

        Ok(Self {
            id: delegated.record_id.clone(),
            grantor: delegated.authorization.signature.did()?,
            grantee: delegated.descriptor.recipient.clone().unwrap_or_default(),
            date_granted: delegated.descriptor.date_created,
            data,
        })
    }
}

impl Grant {
    /// Verify the grant covers a message: issuance, active window,
    /// revocation, and interface/method scope.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when any check fails.
    pub async fn verify(
        &self, grantor: &str, grantee: &str, descriptor: &Descriptor, store: &impl MessageStore,
    ) -> Result<()> {
        if self.grantor != grantor {
            return Err(forbidden!("grant not granted by the expected grantor"));
        }
        if self.grantee != grantee {
            return Err(forbidden!("grant not granted to the message author"));
        }

        // the message must fall within the grant's active window
        let timestamp = descriptor.message_timestamp;
        if timestamp < self.date_granted {
            return Err(forbidden!("grant is not yet active"));
        }
        if timestamp >= self.data.date_expires {
            return Err(forbidden!("grant has expired"));
        }

        self.verify_active(grantor, timestamp, store).await?;

        if self.data.scope.interface() != descriptor.interface {
            return Err(forbidden!("message interface not within the scope of grant {}", self.id));
        }
        if self.data.scope.method() != descriptor.method {
            return Err(forbidden!("message method not within the scope of grant {}", self.id));
        }

        Ok(())
    }

    /// Verify the grant has not been revoked as at `timestamp`.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when a revocation exists.
    pub async fn verify_active(
        &self, owner: &str, timestamp: DateTime<Utc>, store: &impl MessageStore,
    ) -> Result<()> {
        // a revocation is a child record of the grant
        let query = RecordsQueryBuilder::new()
            .add_filter(
                RecordsFilter::new()
                    .parent_id(&self.id)
                    .protocol(PROTOCOL_URI)
                    .protocol_path("grant/revocation"),
            )
            .build();
        let (entries, _) = store.query(owner, &query).await?;

        for entry in entries {
            if let Some(revocation) = entry.as_write() {
                if revocation.descriptor.base.message_timestamp <= timestamp {
                    return Err(forbidden!("grant has been revoked"));
                }
            }
        }

        Ok(())
    }

    /// Verify the grant authorizes a write.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when the grant does not cover the
    /// write.
    pub async fn permit_write(
        &self, owner: &str, author: &str, write: &Write, store: &impl MessageStore,
    ) -> Result<()> {
        self.verify(owner, author, &write.descriptor.base, store).await?;
        self.verify_records_scope(write)?;
        self.verify_conditions(write)
    }

    /// Verify the grant authorizes reading the provided record.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when the grant does not cover the
    /// record.
    pub async fn permit_read(
        &self, owner: &str, author: &str, read: &Read, write: &Write, store: &impl MessageStore,
    ) -> Result<()> {
        self.verify(owner, author, &read.descriptor.base, store).await?;
        self.verify_records_scope(write)
    }

    /// Verify the grant authorizes a query with the provided filter.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when the grant does not cover the
    /// query.
    pub async fn permit_query(
        &self, owner: &str, author: &str, descriptor: &Descriptor, filter: &RecordsFilter,
        store: &impl MessageStore,
    ) -> Result<()> {
        self.verify(owner, author, descriptor, store).await?;

        // a protocol-scoped grant only covers queries filtered to it
        if let Some(protocol) = self.data.scope.protocol() {
            if filter.protocol.as_deref() != Some(protocol) {
                return Err(forbidden!("query filter protocol does not match grant scope"));
            }
        }

        Ok(())
    }

    /// Verify the grant authorizes deleting the record with the provided
    /// initial write.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when the grant does not cover the
    /// record.
    pub async fn permit_delete(
        &self, owner: &str, author: &str, delete: &Delete, initial: &Write,
        store: &impl MessageStore,
    ) -> Result<()> {
        self.verify(owner, author, &delete.descriptor.base, store).await?;
        self.verify_records_scope(initial)
    }

    /// Verify a delegated grant covers a write signed on the grantor's
    /// behalf.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when the delegation does not cover
    /// the write.
    pub fn verify_delegated_write(&self, author: &str, write: &Write) -> Result<()> {
        self.verify_delegation(author)?;
        if self.data.scope.method() != Method::Write {
            return Err(forbidden!("delegated grant does not cover writes"));
        }
        self.verify_records_scope(write)
    }

    /// Verify a delegated grant covers reading the provided record.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when the delegation does not cover
    /// the record.
    pub fn verify_delegated_read(&self, author: &str, write: &Write) -> Result<()> {
        self.verify_delegation(author)?;
        self.verify_records_scope(write)
    }

    /// Verify a delegated grant covers a query with the provided filter.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when the delegation does not cover
    /// the query.
    pub fn verify_delegated_query(&self, author: &str, filter: &RecordsFilter) -> Result<()> {
        self.verify_delegation(author)?;
        if let Some(protocol) = self.data.scope.protocol() {
            if filter.protocol.as_deref() != Some(protocol) {
                return Err(forbidden!("query filter protocol does not match delegated grant"));
            }
        }
        Ok(())
    }

    /// Verify a delegated grant covers deleting the record with the
    /// provided initial write.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when the delegation does not cover
    /// the record.
    pub fn verify_delegated_delete(
        &self, author: &str, _delete: &Delete, initial: &Write,
    ) -> Result<()> {
        self.verify_delegation(author)?;
        self.verify_records_scope(initial)
    }

    // The delegation must be marked delegated and issued by the logical
    // author.
    fn verify_delegation(&self, author: &str) -> Result<()> {
        if !self.data.delegated.unwrap_or_default() {
            return Err(forbidden!("grant is not a delegated grant"));
        }
        if self.grantor != author {
            return Err(forbidden!("delegated grant was not issued by the logical author"));
        }
        Ok(())
    }

    // Scope fields are additive constraints: every declared field must
    // match the record.
    fn verify_records_scope(&self, write: &Write) -> Result<()> {
        let Scope::Records {
            protocol,
            schema,
            options,
            ..
        } = &self.data.scope
        else {
            return Err(forbidden!("grant scope does not cover records"));
        };

        if let Some(protocol) = protocol {
            if write.descriptor.protocol.as_deref() != Some(protocol.as_str()) {
                return Err(forbidden!("record protocol not within the scope of grant {}", self.id));
            }
        }
        if let Some(schema) = schema {
            if write.descriptor.schema.as_deref() != Some(schema.as_str()) {
                return Err(forbidden!("record schema not within the scope of grant {}", self.id));
            }
        }
        match options {
            Some(RecordsOptions::ContextId(context_id)) => {
                let in_context = write.context_id.as_ref().is_some_and(|id| {
                    id.strip_prefix(context_id)
                        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
                });
                if !in_context {
                    return Err(forbidden!(
                        "record context not within the scope of grant {}",
                        self.id
                    ));
                }
            }
            Some(RecordsOptions::ProtocolPath(protocol_path)) => {
                if write.descriptor.protocol_path.as_deref() != Some(protocol_path.as_str()) {
                    return Err(forbidden!(
                        "record protocol path not within the scope of grant {}",
                        self.id
                    ));
                }
            }
            None => {}
        }

        Ok(())
    }

    // Verify the grant's conditions hold for the covered write.
    fn verify_conditions(&self, write: &Write) -> Result<()> {
        let Some(conditions) = &self.data.conditions else {
            return Ok(());
        };
        let published = write.descriptor.published.unwrap_or_default();

        match conditions.publication {
            Some(ConditionPublication::Required) if !published => {
                Err(forbidden!("grant requires the record to be published"))
            }
            Some(ConditionPublication::Prohibited) if published => {
                Err(forbidden!("grant prohibits publishing the record"))
            }
            _ => Ok(()),
        }
    }
}

/// Options to use when issuing a permission grant.
#[derive(Clone, Debug, Default)]
pub struct GrantBuilder {
    granted_to: Option<String>,
    date_expires: Option<DateTime<Utc>>,
    request_id: Option<String>,
    description: Option<String>,
    delegated: Option<bool>,
    scope: Option<Scope>,
    conditions: Option<Conditions>,
}

impl GrantBuilder {
    /// Returns a new [`GrantBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The DID the grant is issued to.
    #[must_use]
    pub fn granted_to(mut self, granted_to: impl Into<String>) -> Self {
        self.granted_to = Some(granted_to.into());
        self
    }

    /// When the grant expires.
    #[must_use]
    pub const fn date_expires(mut self, date_expires: DateTime<Utc>) -> Self {
        self.date_expires = Some(date_expires);
        self
    }

    /// The `record_id` of the permission request the grant answers.
    #[must_use]
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// A human-readable description of the grant.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether the grantee may sign messages as the grantor within scope.
    #[must_use]
    pub const fn delegated(mut self, delegated: bool) -> Self {
        self.delegated = Some(delegated);
        self
    }

    /// The operations the grant covers.
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Conditions that must be met when the grant is invoked.
    #[must_use]
    pub fn conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Build the grant record, signed by the grantor.
    ///
    /// # Errors
    ///
    /// Fails when required options are missing, the scope is invalid, or
    /// signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        let granted_to = self.granted_to.ok_or_else(|| unexpected!("`granted_to` not set"))?;
        let scope = self.scope.ok_or_else(|| unexpected!("`scope` not set"))?;
        scope.validate()?;

        let grant_data = GrantData {
            date_expires: self
                .date_expires
                .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(24)),
            request_id: self.request_id,
            description: self.description,
            delegated: self.delegated,
            scope,
            conditions: self.conditions,
        };
        let data = serde_json::to_vec(&grant_data)
            .map_err(|e| unexpected!("issue serializing grant: {e}"))?;

        let mut write = WriteBuilder::new()
            .protocol(WriteProtocol {
                protocol: PROTOCOL_URI.to_string(),
                protocol_path: "grant".to_string(),
            })
            .recipient(granted_to)
            .data(Data::from(data.clone()))
            .build(signer)
            .await?;

        // carry the payload inline so the grant can be used as a
        // delegated grant before it is stored
        write.encoded_data = Some(Base64UrlUnpadded::encode_string(&data));

        Ok(write)
    }
}

/// Options to use when requesting a permission grant.
#[derive(Clone, Debug, Default)]
pub struct RequestBuilder {
    description: Option<String>,
    delegated: Option<bool>,
    scope: Option<Scope>,
}

impl RequestBuilder {
    /// Returns a new [`RequestBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A human-readable description of the request.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether a delegated grant is requested.
    #[must_use]
    pub const fn delegated(mut self, delegated: bool) -> Self {
        self.delegated = Some(delegated);
        self
    }

    /// The operations the requested grant should cover.
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Build the request record, signed by the requestor.
    ///
    /// # Errors
    ///
    /// Fails when no scope is set, the scope is invalid, or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        let scope = self.scope.ok_or_else(|| unexpected!("`scope` not set"))?;
        scope.validate()?;

        let request_data = RequestData {
            description: self.description,
            delegated: self.delegated,
            scope,
        };
        let data = serde_json::to_vec(&request_data)
            .map_err(|e| unexpected!("issue serializing request: {e}"))?;

        WriteBuilder::new()
            .protocol(WriteProtocol {
                protocol: PROTOCOL_URI.to_string(),
                protocol_path: "request".to_string(),
            })
            .data(Data::from(data))
            .build(signer)
            .await
    }
}

/// Options to use when revoking a permission grant.
#[derive(Clone, Debug, Default)]
pub struct RevocationBuilder {
    grant: Option<Write>,
    description: Option<String>,
}

impl RevocationBuilder {
    /// Returns a new [`RevocationBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The grant record to revoke.
    #[must_use]
    pub fn grant(mut self, grant: Write) -> Self {
        self.grant = Some(grant);
        self
    }

    /// A human-readable description of the revocation.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Build the revocation record, signed by the grantor.
    ///
    /// # Errors
    ///
    /// Fails when no grant is set or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        let grant = self.grant.ok_or_else(|| unexpected!("`grant` not set"))?;
        let Some(context_id) = &grant.context_id else {
            return Err(unexpected!("grant record has no context"));
        };

        let revocation_data = RevocationData {
            description: self.description,
        };
        let data = serde_json::to_vec(&revocation_data)
            .map_err(|e| unexpected!("issue serializing revocation: {e}"))?;

        WriteBuilder::new()
            .protocol(WriteProtocol {
                protocol: PROTOCOL_URI.to_string(),
                protocol_path: "grant/revocation".to_string(),
            })
            .parent_context_id(context_id)
            .data(Data::from(data))
            .build(signer)
            .await
    }
}
