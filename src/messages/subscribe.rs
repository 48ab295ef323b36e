//! # Messages Subscribe
//!
//! The messages subscribe endpoint handles `MessagesSubscribe` messages —
//! requests for a stream of all message events accepted by the tenant.

use http::StatusCode;
use serde::{Deserialize, Serialize};

use super::MessagesFilter;
use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::event::{SubscribeFilter, Subscriber};
use crate::provider::{EventStream, Provider, Signer};
use crate::{Descriptor, Interface, Method, Result, cid, forbidden, permissions};

/// Handle — or process — a [`Subscribe`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs subscribing to the event stream.
pub async fn handle(
    owner: &str, subscribe: Subscribe, provider: &impl Provider,
) -> Result<Reply<SubscribeReply>> {
    subscribe.authorize(owner, provider).await?;

    let filter = SubscribeFilter::Messages(subscribe.descriptor.filters.clone());
    let subscriber = EventStream::subscribe(provider, owner, filter).await?;

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
pub struct Subscribe {
    /// The Subscribe descriptor.
    pub descriptor: SubscribeDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
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
        Some(&self.authorization)
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

impl Subscribe {
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let authzn = &self.authorization;
        let author = authzn.author()?;

        if author == owner {
            return Ok(());
        }

        // a non-owner must invoke a grant covering `MessagesSubscribe`
        let Some(grant_id) = &authzn.payload()?.permission_grant_id else {
            return Err(forbidden!("author has no grant"));
        };
        let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
        grant.verify(owner, &author, &self.descriptor.base, provider).await?;

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

/// [`SubscribeReply`] is returned by the handler in the [`Reply`] `body`
/// field.
#[derive(Debug, Default)]
pub struct SubscribeReply {
    /// The subscription to the message event stream.
    pub subscription: Subscriber,
}

/// The [`Subscribe`] message descriptor.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// Filters events must match.
    pub filters: Vec<MessagesFilter>,
}

impl Default for SubscribeDescriptor {
    fn default() -> Self {
        Self {
            base: Descriptor {
                interface: Interface::Messages,
                method: Method::Subscribe,
                message_timestamp: chrono::Utc::now(),
            },
            filters: Vec::new(),
        }
    }
}

/// Options to use when creating a [`Subscribe`] message.
#[derive(Clone, Debug, Default)]
pub struct SubscribeBuilder {
    filters: Vec<MessagesFilter>,
    permission_grant_id: Option<String>,
}

impl SubscribeBuilder {
    /// Returns a new [`SubscribeBuilder`].
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

    /// Invoke a permission grant to authorize the subscription.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Build and sign the [`Subscribe`] message.
    ///
    /// # Errors
    ///
    /// Fails when signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Subscribe> {
        let descriptor = SubscribeDescriptor {
            base: Descriptor {
                interface: Interface::Messages,
                method: Method::Subscribe,
                message_timestamp: chrono::Utc::now(),
            },
            filters: self.filters,
        };

        let mut builder = AuthorizationBuilder::new().descriptor_cid(cid::from_value(&descriptor)?);
        if let Some(grant_id) = self.permission_grant_id {
            builder = builder.permission_grant_id(grant_id);
        }
        let authorization = builder.build(signer).await?;

        Ok(Subscribe {
            descriptor,
            authorization,
        })
    }
}
