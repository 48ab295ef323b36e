//! # Protocols Configure
//!
//! The protocols configure endpoint handles `ProtocolsConfigure` messages —
//! requests to install or replace a protocol definition for a tenant. Only
//! one configuration is live per protocol URI: the latest by message
//! timestamp, with ties broken by the larger message CID.

use std::collections::BTreeMap;

use chrono::SecondsFormat::Micros;
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::protocols::{self, Definition};
use crate::provider::{EventLog, EventStream, MessageStore, Provider, Signer};
use crate::records::DelegatedGrant;
use crate::store::Entry;
use crate::{
    Descriptor, Error, Interface, Method, Result, cid, forbidden, permissions, unexpected, utils,
};

/// Handle — or process — a [`Configure`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs storing the configuration.
pub async fn handle(
    owner: &str, configure: Configure, provider: &impl Provider,
) -> Result<Reply<ConfigureReply>> {
    configure.authorize(owner, provider).await?;

    // fetch existing configurations for the protocol
    let protocol = &configure.descriptor.definition.protocol;
    let existing = protocols::fetch_config(owner, Some(protocol.clone()), provider).await?;

    // the incoming configuration must win over every existing one
    let incoming_key = (
        configure.descriptor.base.message_timestamp.timestamp_micros(),
        cid::from_value(&configure)?,
    );
    for entry in &existing {
        let entry_key =
            (entry.descriptor.base.message_timestamp.timestamp_micros(), cid::from_value(entry)?);
        if entry_key == incoming_key {
            // idempotent: the configuration has already been accepted
            return Ok(Reply {
                status: Status {
                    code: StatusCode::ACCEPTED.as_u16(),
                    detail: None,
                },
                body: Some(ConfigureReply {
                    message: configure,
                }),
            });
        }
        if entry_key > incoming_key {
            return Err(Error::Conflict("a newer configuration exists".to_string()));
        }
    }

    let entry = Entry::from(&configure);
    MessageStore::put(provider, owner, &entry).await?;
    EventLog::append(provider, owner, &entry).await?;

    // delete every superseded configuration
    let mut deleted_cids = vec![];
    for superseded in &existing {
        let message_cid = cid::from_value(superseded)?;
        MessageStore::delete(provider, owner, &message_cid).await?;
        deleted_cids.push(message_cid);
    }
    let cids: Vec<&str> = deleted_cids.iter().map(String::as_str).collect();
    if !cids.is_empty() {
        EventLog::delete(provider, owner, &cids).await?;
    }

    EventStream::emit(provider, owner, &entry).await?;

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: Some(ConfigureReply {
            message: configure,
        }),
    })
}

/// The [`Configure`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Configure {
    /// The Configure descriptor.
    pub descriptor: ConfigureDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Configure {
    type Reply = ConfigureReply;

    fn cid(&self) -> Result<String> {
        cid::from_value(self)
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor.base
    }

    fn authorization(&self) -> Option<&Authorization> {
        Some(&self.authorization)
    }

    async fn verify_integrity(&self, _owner: &str, _provider: &impl Provider) -> Result<()> {
        let definition = &self.descriptor.definition;
        utils::validate_url(&definition.protocol)?;
        for type_ in definition.types.values() {
            if let Some(schema) = &type_.schema {
                utils::validate_url(schema)?;
            }
        }
        definition.verify_structure()
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

impl Configure {
    /// Build the flattened index keys for the configuration.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> BTreeMap<String, String> {
        let mut indexes = BTreeMap::new();
        indexes.insert("interface".to_string(), Interface::Protocols.to_string());
        indexes.insert("method".to_string(), Method::Configure.to_string());
        indexes.insert("protocol".to_string(), self.descriptor.definition.protocol.clone());
        indexes
            .insert("published".to_string(), self.descriptor.definition.published.to_string());
        indexes.insert(
            "messageTimestamp".to_string(),
            self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true),
        );
        indexes.insert("author".to_string(), self.authorization.author().unwrap_or_default());
        indexes
    }

    // Authorize the configure message.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let authzn = &self.authorization;
        let author = authzn.author()?;

        if author == owner {
            return Ok(());
        }

        // a non-owner must invoke a grant covering `ProtocolsConfigure`
        let Some(grant_id) = &authzn.payload()?.permission_grant_id else {
            return Err(forbidden!("configure failed authorization"));
        };
        let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
        grant.verify(owner, &author, &self.descriptor.base, provider).await?;

        // when the grant scope names a protocol it must match
        if let Some(protocol) = grant.data.scope.protocol() {
            if protocol != self.descriptor.definition.protocol {
                return Err(forbidden!("message protocol does not match grant protocol"));
            }
        }

        Ok(())
    }
}

/// [`ConfigureReply`] is returned by the handler in the [`Reply`] `body`
/// field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ConfigureReply {
    /// The accepted configuration.
    pub message: Configure,
}

/// The [`Configure`] message descriptor.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The protocol definition.
    pub definition: Definition,
}

impl Default for ConfigureDescriptor {
    fn default() -> Self {
        Self {
            base: Descriptor {
                interface: Interface::Protocols,
                method: Method::Configure,
                message_timestamp: chrono::Utc::now(),
            },
            definition: Definition::default(),
        }
    }
}

/// Options to use when creating a [`Configure`] message.
#[derive(Clone, Debug, Default)]
pub struct ConfigureBuilder {
    message_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    definition: Option<Definition>,
    delegated_grant: Option<DelegatedGrant>,
    permission_grant_id: Option<String>,
}

impl ConfigureBuilder {
    /// Returns a new [`ConfigureBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the protocol definition to configure.
    #[must_use]
    pub fn definition(mut self, definition: Definition) -> Self {
        self.definition = Some(definition);
        self
    }

    /// The message's timestamp. Defaults to now.
    #[must_use]
    pub const fn message_timestamp(
        mut self, message_timestamp: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// The delegated grant invoked to sign on behalf of the logical author,
    /// who is the grantor of the grant.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Invoke a permission grant to authorize the configuration.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Build and sign the [`Configure`] message.
    ///
    /// # Errors
    ///
    /// Fails when no definition is set, the definition is invalid, or
    /// signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Configure> {
        let mut definition = self.definition.ok_or_else(|| unexpected!("definition not set"))?;

        // normalize definition URLs before signing
        definition.protocol = utils::clean_url(&definition.protocol)?;
        for type_ in definition.types.values_mut() {
            if let Some(schema) = &type_.schema {
                type_.schema = Some(utils::clean_url(schema)?);
            }
        }
        definition.verify_structure()?;

        let descriptor = ConfigureDescriptor {
            base: Descriptor {
                interface: Interface::Protocols,
                method: Method::Configure,
                message_timestamp: self.message_timestamp.unwrap_or_else(chrono::Utc::now),
            },
            definition,
        };

        let mut builder = AuthorizationBuilder::new().descriptor_cid(cid::from_value(&descriptor)?);
        if let Some(grant_id) = self.permission_grant_id {
            builder = builder.permission_grant_id(grant_id);
        }
        if let Some(delegated_grant) = self.delegated_grant {
            builder = builder.delegated_grant(delegated_grant);
        }
        let authorization = builder.build(signer).await?;

        Ok(Configure {
            descriptor,
            authorization,
        })
    }
}
