//! # Records Subscribe
//!
//! The records subscribe endpoint handles `RecordsSubscribe` messages —
//! requests for a stream of record events matching a filter. The same
//! visibility rules as queries apply: anonymous subscribers receive
//! published records only.

use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::event::{SubscribeFilter, Subscriber};
use crate::provider::{EventStream, Provider, Signer};
use crate::records::{DelegatedGrant, RecordsFilter, protocol};
use crate::{Descriptor, Interface, Method, Result, cid, forbidden, invalid};

/// Handle — or process — a [`Subscribe`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs subscribing to the event stream.
pub async fn handle(
    owner: &str, subscribe: Subscribe, provider: &impl Provider,
) -> Result<Reply<SubscribeReply>> {
    let mut filter = subscribe.descriptor.filter.clone();

    if subscribe.authorization.is_none() {
        // anonymous subscribers receive published records only
        filter.published = Some(true);
    } else {
        subscribe.authorize(owner, provider).await?;
    }

    let subscriber =
        EventStream::subscribe(provider, owner, SubscribeFilter::Records(filter)).await?;

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(SubscribeReply {
            subscription: subscriber,
        }),
    })
}

/// The [`Subscribe`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribe {
    /// The Subscribe descriptor.
    pub descriptor: SubscribeDescriptor,

    /// The message authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

impl Message for Subscribe {
    type Reply = SubscribeReply;

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

/// [`SubscribeReply`] is returned by the handler in the [`Reply`] `body`
/// field.
#[derive(Debug, Default)]
pub struct SubscribeReply {
    /// The subscription to the record event stream.
    pub subscription: Subscriber,
}

impl Subscribe {
    // Authorize the subscription for a non-owner requestor.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let Some(authzn) = &self.authorization else {
            return Err(forbidden!("missing authorization"));
        };
        let author = authzn.author()?;

        if author == owner {
            return Ok(());
        }

        // a role may authorize subscribing to unpublished records
        if authzn.payload()?.protocol_role.is_some() {
            let filter = &self.descriptor.filter;
            if filter.protocol.is_none() || filter.protocol_path.is_none() {
                return Err(invalid!(
                    "role-authorized subscription requires `protocol` and `protocol_path`"
                ));
            }
            let authorizer = protocol::Authorizer::new(owner);
            return authorizer.permit_subscribe(self, provider).await;
        }

        // otherwise the subscriber sees only published records and records
        // they authored or received; the filter enforces visibility
        let filter = &self.descriptor.filter;
        if filter.published == Some(true) {
            return Ok(());
        }
        let authors = filter.author.as_ref().map(crate::OneOrMany::to_vec).unwrap_or_default();
        let recipients =
            filter.recipient.as_ref().map(crate::OneOrMany::to_vec).unwrap_or_default();
        if authors == vec![author.clone()] || recipients == vec![author] {
            return Ok(());
        }

        Err(forbidden!("subscription cannot be authorized"))
    }
}

/// The [`Subscribe`] message descriptor.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter record events must match.
    pub filter: RecordsFilter,
}

impl Default for SubscribeDescriptor {
    fn default() -> Self {
        Self {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Subscribe,
                message_timestamp: chrono::Utc::now(),
            },
            filter: RecordsFilter::default(),
        }
    }
}

/// Options to use when creating a [`Subscribe`] message.
#[derive(Clone, Debug, Default)]
pub struct SubscribeBuilder {
    filter: RecordsFilter,
    protocol_role: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
    authorize: Option<bool>,
}

impl SubscribeBuilder {
    /// Returns a new [`SubscribeBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the filter record events must match.
    #[must_use]
    pub fn filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Invoke a protocol role to authorize the subscription.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// The delegated grant invoked to sign on behalf of the logical author.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Whether to sign the subscription. Defaults to `true`.
    #[must_use]
    pub const fn authorize(mut self, authorize: bool) -> Self {
        self.authorize = Some(authorize);
        self
    }

    /// Build and (optionally) sign the [`Subscribe`] message.
    ///
    /// # Errors
    ///
    /// Fails when the filter URLs are invalid or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Subscribe> {
        let descriptor = SubscribeDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Subscribe,
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
            if let Some(delegated_grant) = self.delegated_grant {
                builder = builder.delegated_grant(delegated_grant);
            }
            Some(builder.build(signer).await?)
        } else {
            None
        };

        Ok(Subscribe {
            descriptor,
            authorization,
        })
    }
}
