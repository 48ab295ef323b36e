//! # JWS (JSON Web Signature)
//!
//! General-form JWS envelopes used for message authorization and
//! attestation. Signing is delegated to a [`Signer`]; verification resolves
//! the signer's DID document through a [`DidResolver`] and checks the
//! signature over the canonical signing input.

use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::{Signature as EdSignature, Verifier, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::provider::{DidResolver, Signer};
use crate::{Result, did, forbidden, invalid, unexpected};

/// A general-form JWS envelope.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Jws {
    /// The stringified base64url-encoded payload.
    pub payload: String,

    /// One or more signatures over the payload.
    pub signatures: Vec<Signature>,
}

/// A single JWS signature with its protected header.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Signature {
    /// The base64url-encoded protected header.
    pub protected: String,

    /// The base64url-encoded signature.
    pub signature: String,
}

/// The protected header of a JWS signature.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Protected {
    /// The signing algorithm.
    pub alg: String,

    /// The signing key's identifier: a DID URL whose fragment names the
    /// verification method.
    pub kid: String,
}

impl Signature {
    /// Decode the signature's protected header.
    ///
    /// # Errors
    ///
    /// Fails when the header cannot be decoded.
    pub fn protected(&self) -> Result<Protected> {
        let bytes = Base64UrlUnpadded::decode_vec(&self.protected)
            .map_err(|e| invalid!("issue decoding protected header: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| invalid!("invalid protected header: {e}"))
    }
}

impl Jws {
    /// Create a signed JWS over the provided payload.
    ///
    /// # Errors
    ///
    /// Fails when the payload cannot be serialized or the signer fails.
    pub async fn create<T: Serialize + Send>(payload: &T, signer: &impl Signer) -> Result<Self> {
        let payload_enc = Base64UrlUnpadded::encode_string(
            &serde_json::to_vec(payload).map_err(|e| unexpected!("issue serializing payload: {e}"))?,
        );

        let protected = Protected {
            alg: signer.algorithm().to_string(),
            kid: signer.verification_method().await.map_err(|e| unexpected!("no key id: {e}"))?,
        };
        let protected_enc = Base64UrlUnpadded::encode_string(&serde_json::to_vec(&protected)?);

        let signing_input = format!("{protected_enc}.{payload_enc}");
        let signature = signer
            .try_sign(signing_input.as_bytes())
            .await
            .map_err(|e| unexpected!("issue signing: {e}"))?;

        Ok(Self {
            payload: payload_enc,
            signatures: vec![Signature {
                protected: protected_enc,
                signature: Base64UrlUnpadded::encode_string(&signature),
            }],
        })
    }

    /// Deserialize the JWS payload.
    ///
    /// # Errors
    ///
    /// Fails when the payload cannot be decoded.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = Base64UrlUnpadded::decode_vec(&self.payload)
            .map_err(|e| invalid!("issue decoding payload: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| invalid!("invalid payload: {e}"))
    }

    /// The DID of the envelope's (first) signer, derived from the signing
    /// key identifier.
    ///
    /// # Errors
    ///
    /// Fails when the envelope has no valid signature header.
    pub fn did(&self) -> Result<String> {
        let Some(signature) = self.signatures.first() else {
            return Err(invalid!("no signatures in JWS"));
        };
        let kid = signature.protected()?.kid;
        let Some((did, _)) = kid.split_once('#') else {
            return Err(invalid!("key id {kid} is not a DID URL"));
        };
        Ok(did.to_string())
    }

    /// Cryptographically verify every signature in the envelope, returning
    /// the signer's DID.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when any signature does not verify,
    /// and `Error::BadRequest` when the envelope is malformed.
    pub async fn verify(&self, resolver: &impl DidResolver) -> Result<String> {
        if self.signatures.is_empty() {
            return Err(invalid!("no signatures in JWS"));
        }

        for signature in &self.signatures {
            let protected = signature.protected()?;
            let Some((signer_did, _)) = protected.kid.split_once('#') else {
                return Err(invalid!("key id {} is not a DID URL", protected.kid));
            };

            let document = resolver
                .resolve(signer_did)
                .await
                .map_err(|e| forbidden!("issue resolving {signer_did}: {e}"))?;
            let method = document.verification_method(&protected.kid)?;
            let key_bytes = did::public_key(method)?;

            let key_array: [u8; 32] =
                key_bytes.try_into().map_err(|_| invalid!("invalid public key length"))?;
            let verifying_key = VerifyingKey::from_bytes(&key_array)
                .map_err(|e| invalid!("invalid public key: {e}"))?;

            let sig_bytes = Base64UrlUnpadded::decode_vec(&signature.signature)
                .map_err(|e| invalid!("issue decoding signature: {e}"))?;
            let ed_signature = EdSignature::from_slice(&sig_bytes)
                .map_err(|e| invalid!("invalid signature: {e}"))?;

            let signing_input = format!("{}.{}", signature.protected, self.payload);
            verifying_key
                .verify(signing_input.as_bytes(), &ed_signature)
                .map_err(|_| forbidden!("signature verification failed"))?;
        }

        self.did()
    }
}
