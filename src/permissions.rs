//! # Permissions
//!
//! Capability grants, modeled as records under a reserved protocol. A
//! grant's issuance, invocation, revocation, and scope-matching gate every
//! non-owner operation that is not admitted by a protocol rule.

mod grant;
mod protocol;

use base64ct::{Base64UrlUnpadded, Encoding};
use serde::{Deserialize, Serialize};

pub use self::grant::{
    Grant, GrantBuilder, GrantData, RequestBuilder, RequestData, RevocationBuilder, RevocationData,
};
pub(crate) use self::protocol::{fetch_scope, protocol_definition};
use crate::provider::MessageStore;
use crate::records::RecordsFilter;
use crate::store::RecordsQueryBuilder;
use crate::{Interface, Method, Result, forbidden, invalid};

/// Fetch the grant with the specified grant id from the tenant's store.
///
/// # Errors
///
/// Fails with `Error::Unauthorized` when no grant is found.
pub(crate) async fn fetch_grant(
    owner: &str, grant_id: &str, store: &impl MessageStore,
) -> Result<Grant> {
    let query = RecordsQueryBuilder::new()
        .add_filter(RecordsFilter::new().record_id(grant_id))
        .build();
    let (entries, _) = store.query(owner, &query).await?;

    let Some(entry) = entries.first() else {
        return Err(forbidden!("no grant found"));
    };
    let Some(write) = entry.as_write() else {
        return Err(forbidden!("grant record is not a valid grant"));
    };

    Grant::try_from(write)
}

/// The scope of a permission grant.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "interface")]
pub enum Scope {
    /// The grant applies to the `Records` interface.
    Records {
        /// The method the grant covers.
        method: Method,

        /// The protocol the grant is restricted to.
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,

        /// The schema the grant is restricted to (flat-space records
        /// only).
        #[serde(skip_serializing_if = "Option::is_none")]
        schema: Option<String>,

        /// Records scope options.
        #[serde(flatten)]
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<RecordsOptions>,
    },

    /// The grant applies to the `Messages` interface.
    Messages {
        /// The method the grant covers.
        method: Method,

        /// The protocol the grant is restricted to.
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },

    /// The grant applies to the `Protocols` interface.
    Protocols {
        /// The method the grant covers.
        method: Method,

        /// The protocol the grant is restricted to.
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },
}

impl Default for Scope {
    fn default() -> Self {
        Self::Records {
            method: Method::default(),
            protocol: None,
            schema: None,
            options: None,
        }
    }
}

impl Scope {
    /// The interface the scope applies to.
    #[must_use]
    pub const fn interface(&self) -> Interface {
        match self {
            Self::Records { .. } => Interface::Records,
            Self::Messages { .. } => Interface::Messages,
            Self::Protocols { .. } => Interface::Protocols,
        }
    }

    /// The method the scope applies to.
    #[must_use]
    pub fn method(&self) -> Method {
        match self {
            Self::Records { method, .. }
            | Self::Messages { method, .. }
            | Self::Protocols { method, .. } => method.clone(),
        }
    }

    /// The protocol the scope is restricted to, when set.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        match self {
            Self::Records { protocol, .. }
            | Self::Messages { protocol, .. }
            | Self::Protocols { protocol, .. } => protocol.as_deref(),
        }
    }

    /// Verify the scope's field combinations are well-defined.
    ///
    /// # Errors
    ///
    /// Fails with `Error::BadRequest` for prohibited combinations.
    pub fn validate(&self) -> Result<()> {
        if let Self::Records {
            protocol,
            schema,
            options,
            ..
        } = self
        {
            if schema.is_some() && (protocol.is_some() || options.is_some()) {
                return Err(invalid!(
                    "a `schema` scope cannot be combined with protocol-related fields"
                ));
            }
        }
        Ok(())
    }
}

/// Protocol-record scope options. A scope may be anchored to a context
/// subtree or a protocol path, not both.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RecordsOptions {
    /// Restrict the scope to records within the context subtree.
    ContextId(String),

    /// Restrict the scope to records at the protocol path.
    ProtocolPath(String),
}

impl RecordsOptions {
    /// The context ID, when the scope is context-anchored.
    #[must_use]
    pub fn context_id(&self) -> Option<&str> {
        match self {
            Self::ContextId(id) => Some(id),
            Self::ProtocolPath(_) => None,
        }
    }

    /// The protocol path, when the scope is path-anchored.
    #[must_use]
    pub fn protocol_path(&self) -> Option<&str> {
        match self {
            Self::ProtocolPath(path) => Some(path),
            Self::ContextId(_) => None,
        }
    }
}

/// Conditions that must be met when a grant is invoked.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conditions {
    /// Whether a record written with the grant must, or must not, be
    /// published. Unset means either.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication: Option<ConditionPublication>,
}

/// Publication condition for grant-covered writes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConditionPublication {
    /// The write must be published.
    #[default]
    Required,

    /// The write must not be published.
    Prohibited,
}

// Decode a permission record's base64url JSON data payload.
pub(crate) fn decode_data<T: serde::de::DeserializeOwned>(encoded: &str) -> Result<T> {
    let bytes = Base64UrlUnpadded::decode_vec(encoded)
        .map_err(|e| forbidden!("issue decoding grant data: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| forbidden!("invalid grant data: {e}"))
}
