//! # Authorization
//!
//! The authorization block carried by all but anonymous messages: the
//! author's signature over the message, an optional owner signature layered
//! on to admit another author's message into the owner's tenant, and
//! optional delegated grants when either signer acts as a delegate.

use serde::{Deserialize, Serialize};

use crate::jws::Jws;
use crate::provider::{DidResolver, Signer};
use crate::records::DelegatedGrant;
use crate::{Result, cid, forbidden, invalid, unexpected};

/// Message authorization.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    /// The signature of the message signer: the author or an author
    /// delegate.
    pub signature: Jws,

    /// The owner's signature, or their delegate's, admitting a message
    /// authored by another party into the owner's web node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_signature: Option<Jws>,

    /// The delegated grant invoked when the message is signed by an author
    /// delegate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_delegated_grant: Option<DelegatedGrant>,

    /// The delegated grant invoked when the owner signature is produced by
    /// an owner delegate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_delegated_grant: Option<DelegatedGrant>,
}

/// The payload common to all authorization signatures.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JwsPayload {
    /// The CID of the message descriptor the signature binds to.
    pub descriptor_cid: String,

    /// The `record_id` of the permission grant invoked to authorize the
    /// message, when the author is not the owner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_grant_id: Option<String>,

    /// The CID of the delegated grant invoked when the signer is a
    /// delegate of the logical author.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegated_grant_id: Option<String>,

    /// The protocol role invoked to authorize the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_role: Option<String>,
}

impl Authorization {
    /// The message's logical author: the grantor of the author-delegated
    /// grant when one is invoked, the signer otherwise.
    ///
    /// # Errors
    ///
    /// Fails when the relevant signature has no valid key identifier.
    pub fn author(&self) -> Result<String> {
        self.author_delegated_grant
            .as_ref()
            .map_or_else(|| self.signature.did(), |grant| grant.authorization.signature.did())
    }

    /// The DID of the message signer (which may be an author delegate).
    ///
    /// # Errors
    ///
    /// Fails when the signature has no valid key identifier.
    pub fn signer(&self) -> Result<String> {
        self.signature.did()
    }

    /// The logical owner admitting the message, when an owner signature is
    /// present.
    ///
    /// # Errors
    ///
    /// Fails when the owner signature has no valid key identifier.
    pub fn owner(&self) -> Result<Option<String>> {
        if let Some(grant) = &self.owner_delegated_grant {
            return Ok(Some(grant.authorization.signature.did()?));
        }
        let Some(owner_signature) = &self.owner_signature else {
            return Ok(None);
        };
        Ok(Some(owner_signature.did()?))
    }

    /// The base payload of the authorization signature.
    ///
    /// # Errors
    ///
    /// Fails when the payload cannot be decoded.
    pub fn payload(&self) -> Result<JwsPayload> {
        self.signature.payload()
    }

    /// Cryptographically verify every signature carried by the block, and
    /// the referential integrity of any delegated grants.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when a signature does not verify or
    /// a delegated grant does not bind signer to author.
    pub async fn authenticate(&self, resolver: &impl DidResolver) -> Result<()> {
        let signer = self.signature.verify(resolver).await?;

        if let Some(owner_signature) = &self.owner_signature {
            owner_signature.verify(resolver).await?;
        }

        if let Some(grant) = &self.author_delegated_grant {
            grant.authorization.signature.verify(resolver).await?;

            // the grant binds its grantor (the logical author) to the signer
            let payload: JwsPayload = self.signature.payload()?;
            if payload.delegated_grant_id.as_ref() != Some(&cid::from_value(grant)?) {
                return Err(invalid!("signature payload does not reference delegated grant"));
            }
            if grant.descriptor.recipient.as_ref() != Some(&signer) {
                return Err(forbidden!("delegated grant not granted to signer"));
            }
        }

        if let Some(grant) = &self.owner_delegated_grant {
            grant.authorization.signature.verify(resolver).await?;

            let Some(owner_signature) = &self.owner_signature else {
                return Err(invalid!("owner delegated grant without owner signature"));
            };
            if grant.descriptor.recipient.as_ref() != Some(&owner_signature.did()?) {
                return Err(forbidden!("delegated grant not granted to owner signer"));
            }
        }

        Ok(())
    }
}

/// Options for building a message [`Authorization`].
#[derive(Debug, Default)]
pub struct AuthorizationBuilder {
    descriptor_cid: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
    permission_grant_id: Option<String>,
    protocol_role: Option<String>,
}

impl AuthorizationBuilder {
    /// Returns a new [`AuthorizationBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CID of the descriptor being signed.
    #[must_use]
    pub fn descriptor_cid(mut self, descriptor_cid: impl Into<String>) -> Self {
        self.descriptor_cid = Some(descriptor_cid.into());
        self
    }

    /// Set the delegated grant the signer invokes to sign on the author's
    /// behalf.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Set the id of the permission grant invoked to authorize the message.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Set the protocol role invoked to authorize the message.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// Build the [`Authorization`], signing the payload.
    ///
    /// # Errors
    ///
    /// Fails when no descriptor CID has been set or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Authorization> {
        let descriptor_cid =
            self.descriptor_cid.ok_or_else(|| unexpected!("descriptor CID not set"))?;

        let delegated_grant_id = self
            .delegated_grant
            .as_ref()
            .map(cid::from_value)
            .transpose()?;

        let payload = JwsPayload {
            descriptor_cid,
            permission_grant_id: self.permission_grant_id,
            delegated_grant_id,
            protocol_role: self.protocol_role,
        };

        Ok(Authorization {
            signature: Jws::create(&payload, signer).await?,
            owner_signature: None,
            author_delegated_grant: self.delegated_grant,
            owner_delegated_grant: None,
        })
    }
}
