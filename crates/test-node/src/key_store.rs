//! # Key store
//!
//! Deterministic Ed25519 keyrings for the well-known test identities.
//! Keys are derived from fixed seeds so DIDs are stable across test runs.

use std::collections::HashMap;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use dwn_engine::did;
use dwn_engine::provider::{Algorithm, KeyStore, Signer};
use ed25519_dalek::{Signer as _, SigningKey};

/// Alice's DID.
pub static ALICE_DID: LazyLock<String> = LazyLock::new(|| did_for_seed(1));

/// Bob's DID.
pub static BOB_DID: LazyLock<String> = LazyLock::new(|| did_for_seed(2));

/// Carol's DID.
pub static CAROL_DID: LazyLock<String> = LazyLock::new(|| did_for_seed(3));

/// Mallory's DID.
pub static MALLORY_DID: LazyLock<String> = LazyLock::new(|| did_for_seed(4));

static KEYRINGS: LazyLock<HashMap<String, Keyring>> = LazyLock::new(|| {
    let mut keyrings = HashMap::new();
    for seed in 1..=4u8 {
        let keyring = Keyring::from_seed(seed);
        keyrings.insert(keyring.did.clone(), keyring);
    }
    keyrings
});

fn did_for_seed(seed: u8) -> String {
    Keyring::from_seed(seed).did
}

/// A signing keyring for a single test identity.
#[derive(Clone)]
pub struct Keyring {
    signing_key: SigningKey,
    did: String,
}

impl Keyring {
    fn from_seed(seed: u8) -> Self {
        let signing_key = SigningKey::from_bytes(&[seed; 32]);
        let did = did::key_did(signing_key.verifying_key().as_bytes());
        Self { signing_key, did }
    }

    /// The keyring's DID.
    #[must_use]
    pub fn did(&self) -> &str {
        &self.did
    }
}

impl Signer for Keyring {
    async fn try_sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        Ok(self.signing_key.sign(msg).to_bytes().to_vec())
    }

    async fn verification_method(&self) -> Result<String> {
        let Some(key) = self.did.strip_prefix("did:key:") else {
            return Err(anyhow!("invalid did:key DID"));
        };
        Ok(format!("{}#{key}", self.did))
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::EdDsa
    }
}

/// Fetch the keyring for a well-known test DID.
///
/// # Errors
///
/// Fails when the DID is not a test identity.
pub fn keyring(did: &str) -> Result<Keyring> {
    KEYRINGS.get(did).cloned().ok_or_else(|| anyhow!("no keyring for {did}"))
}

impl KeyStore for crate::ProviderImpl {
    fn keyring(&self, controller: &str) -> Result<impl Signer + use<>> {
        keyring(controller)
    }
}
