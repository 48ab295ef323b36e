//! # DID documents
//!
//! Minimal DID document types consumed by signature verification, plus a
//! pure resolver for the `did:key` method. Resolution of other methods is
//! delegated to the [`DidResolver`](crate::provider::DidResolver)
//! collaborator.

use multibase::Base;
use serde::{Deserialize, Serialize};

use crate::{Result, invalid};

// Multicodec prefix for an Ed25519 public key.
const ED25519_CODEC: [u8; 2] = [0xed, 0x01];

/// A resolved DID document.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// The DID the document describes.
    pub id: String,

    /// Verification methods the controller may use to authenticate.
    #[serde(default)]
    pub verification_method: Vec<VerificationMethod>,
}

/// A cryptographic key entry in a DID document.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    /// The method's key identifier.
    pub id: String,

    /// The DID controlling the key.
    pub controller: String,

    /// The key type.
    #[serde(rename = "type")]
    pub method_type: String,

    /// The public key, multibase-encoded.
    pub public_key_multibase: String,
}

impl Document {
    /// Find the verification method matching the provided key identifier.
    ///
    /// # Errors
    ///
    /// Fails when no matching method exists.
    pub fn verification_method(&self, key_id: &str) -> Result<&VerificationMethod> {
        self.verification_method
            .iter()
            .find(|vm| vm.id == key_id)
            .ok_or_else(|| invalid!("no verification method {key_id} in DID document"))
    }
}

/// Create a `did:key` DID from an Ed25519 public key.
#[must_use]
pub fn key_did(public_key: &[u8]) -> String {
    let mut multicodec = ED25519_CODEC.to_vec();
    multicodec.extend_from_slice(public_key);
    format!("did:key:{}", multibase::encode(Base::Base58Btc, multicodec))
}

/// Resolve a `did:key` DID to a DID document without I/O.
///
/// # Errors
///
/// Fails when the DID is not a valid Ed25519 `did:key`.
pub fn resolve_key(did: &str) -> Result<Document> {
    let Some(encoded) = did.strip_prefix("did:key:") else {
        return Err(invalid!("{did} is not a did:key DID"));
    };

    let (_, decoded) =
        multibase::decode(encoded).map_err(|e| invalid!("invalid did:key encoding: {e}"))?;
    if decoded.len() != ED25519_CODEC.len() + 32 || decoded[..2] != ED25519_CODEC {
        return Err(invalid!("{did} is not an Ed25519 did:key"));
    }

    Ok(Document {
        id: did.to_string(),
        verification_method: vec![VerificationMethod {
            id: format!("{did}#{encoded}"),
            controller: did.to_string(),
            method_type: "Multikey".to_string(),
            public_key_multibase: encoded.to_string(),
        }],
    })
}

/// Extract the public key bytes from a verification method.
///
/// # Errors
///
/// Fails when the key material cannot be decoded.
pub fn public_key(method: &VerificationMethod) -> Result<Vec<u8>> {
    let (_, decoded) = multibase::decode(&method.public_key_multibase)
        .map_err(|e| invalid!("invalid public key encoding: {e}"))?;
    if decoded.len() == ED25519_CODEC.len() + 32 && decoded[..2] == ED25519_CODEC {
        return Ok(decoded[2..].to_vec());
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trip() {
        let public_key = [7u8; 32];
        let did = key_did(&public_key);
        assert!(did.starts_with("did:key:z"));

        let document = resolve_key(&did).expect("should resolve");
        assert_eq!(document.id, did);

        let method = &document.verification_method[0];
        assert_eq!(super::public_key(method).expect("should decode"), public_key.to_vec());
    }

    #[test]
    fn invalid_did() {
        assert!(resolve_key("did:web:example.com").is_err());
        assert!(resolve_key("did:key:zzz").is_err());
    }
}
