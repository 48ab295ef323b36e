//! # CID (Content Identifier)
//!
//! Deterministic content identifiers for messages, descriptors, and record
//! data. Structured values are canonicalized before hashing so that two
//! semantically equal values always yield the same CID, regardless of field
//! order or `None`-valued optional fields.

use std::io::Read;

use multihash_codetable::{Code, MultihashDigest};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{Result, unexpected};

// Multicodec codes for the CID payload encoding.
const DAG_CBOR: u64 = 0x71;
const RAW: u64 = 0x55;

/// Compute the CID of a structured value.
///
/// The value is canonicalized by converting to a JSON value (eliding `None`
/// fields and sorting object keys), encoding as deterministic CBOR, and
/// hashing with SHA-256.
///
/// # Errors
///
/// Fails when the value cannot be serialized.
pub fn from_value<T: Serialize>(value: &T) -> Result<String> {
    // canonicalize: `serde_json::Value` maps are ordered by key
    let canonical =
        serde_json::to_value(value).map_err(|e| unexpected!("issue canonicalizing value: {e}"))?;

    let mut buf = Vec::new();
    ciborium::into_writer(&canonical, &mut buf)
        .map_err(|e| unexpected!("issue encoding CBOR: {e}"))?;

    let hash = Code::Sha2_256.digest(&buf);
    Ok(cid::Cid::new_v1(DAG_CBOR, hash).to_string())
}

/// Compute the CID of an opaque byte stream, returning the CID and the
/// number of bytes read.
///
/// The hash is computed incrementally so arbitrarily large streams can be
/// identified without buffering.
///
/// # Errors
///
/// Fails when the reader returns an I/O error.
pub fn from_reader(mut reader: impl Read) -> Result<(String, usize)> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    let mut byte_count = 0;

    loop {
        let bytes_read = reader.read(&mut buffer[..])?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        byte_count += bytes_read;
    }

    let hash =
        Code::Sha2_256.wrap(&hasher.finalize()).map_err(|e| unexpected!("issue wrapping hash: {e}"))?;

    Ok((cid::Cid::new_v1(RAW, hash).to_string(), byte_count))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn deterministic() {
        // key order must not affect the CID
        let cid_1 = from_value(&json!({"a": 1, "b": {"c": "x", "d": "y"}})).unwrap();
        let cid_2 = from_value(&json!({"b": {"d": "y", "c": "x"}, "a": 1})).unwrap();
        assert_eq!(cid_1, cid_2);

        // different values yield different CIDs
        let cid_3 = from_value(&json!({"a": 2, "b": {"c": "x", "d": "y"}})).unwrap();
        assert_ne!(cid_1, cid_3);
    }

    #[test]
    fn none_elided() {
        #[derive(serde::Serialize)]
        struct WithOption {
            a: u32,
            #[serde(skip_serializing_if = "Option::is_none")]
            b: Option<u32>,
        }

        let with = from_value(&WithOption { a: 1, b: None }).unwrap();
        let without = from_value(&json!({"a": 1})).unwrap();
        assert_eq!(with, without);
    }

    #[test]
    fn raw_data() {
        let (cid_1, size) = from_reader(&b"hello world"[..]).unwrap();
        assert_eq!(size, 11);

        let (cid_2, _) = from_reader(&b"hello world"[..]).unwrap();
        assert_eq!(cid_1, cid_2);

        let (cid_3, _) = from_reader(&b"hello there"[..]).unwrap();
        assert_ne!(cid_1, cid_3);
    }
}
