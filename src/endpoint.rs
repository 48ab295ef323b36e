//! # Endpoint
//!
//! The message entry point. Every message goes through the same pipeline:
//! structural (schema) validation, authentication of its signatures with
//! the payload bound to the message, then dispatch to the
//! `(interface, method)` handler for authorization and processing.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::authorization::Authorization;
use crate::provider::Provider;
use crate::{Descriptor, Result, cid, invalid, schema, unexpected};

/// Handle an incoming message.
///
/// # Errors
///
/// The endpoint will return an error when the message fails validation,
/// authentication, or authorization, or when the handler fails processing
/// it.
pub async fn handle<T>(
    owner: &str, message: impl Message<Reply = T>, provider: &impl Provider,
) -> Result<Reply<T>> {
    message.validate(owner, provider).await?;
    message.handle(owner, provider).await
}

/// Methods common to all messages.
pub trait Message: Serialize + Clone + Debug + Send + Sync {
    /// The message's inner reply type.
    type Reply;

    /// Compute the CID of the message.
    ///
    /// # Errors
    ///
    /// Fails when the message cannot be serialized.
    fn cid(&self) -> Result<String>;

    /// Returns the component of the message descriptor common to all
    /// messages.
    fn descriptor(&self) -> &Descriptor;

    /// Returns the message's authorization, when it has one.
    fn authorization(&self) -> Option<&Authorization>;

    /// Handle the message.
    fn handle(
        self, owner: &str, provider: &impl Provider,
    ) -> impl Future<Output = Result<Reply<Self::Reply>>> + Send;

    /// Message-specific integrity checks, run after schema validation and
    /// authentication.
    fn verify_integrity(
        &self, _owner: &str, _provider: &impl Provider,
    ) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Validate the message: schema shape, signature verification, and the
    /// binding of the signature payload to the message descriptor.
    fn validate(
        &self, owner: &str, provider: &impl Provider,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            schema::validate(self)?;

            if let Some(authzn) = self.authorization() {
                authzn.authenticate(provider).await?;

                // the signature payload must bind to this message's descriptor
                let value = serde_json::to_value(self)
                    .map_err(|e| unexpected!("issue serializing message: {e}"))?;
                let Some(descriptor) = value.get("descriptor") else {
                    return Err(unexpected!("message has no descriptor"));
                };
                if authzn.payload()?.descriptor_cid != cid::from_value(descriptor)? {
                    return Err(invalid!(
                        "signature payload descriptor CID does not match message descriptor"
                    ));
                }
            }

            self.verify_integrity(owner, provider).await
        }
    }
}

/// Reply used by all endpoints.
#[derive(Debug, Default, Deserialize, Serialize)]
#[allow(clippy::module_name_repetitions)]
pub struct Reply<T> {
    /// Status message to accompany the reply.
    pub status: Status,

    /// Endpoint-specific reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(flatten)]
    pub body: Option<T>,
}

/// Reply status.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Status code.
    pub code: u16,

    /// Status detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
