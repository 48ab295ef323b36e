//! # Schema validation
//!
//! Structural validation of messages against a static JSON schema per
//! `(interface, method)`. Unknown top-level and descriptor properties are
//! rejected before any signature or authorization work is done.

use serde::Serialize;
use serde_json::Value;

use crate::endpoint::Message;
use crate::{Result, invalid, unexpected};

/// Validate a message against the schema for its `(interface, method)`.
///
/// # Errors
///
/// Fails with `Error::BadRequest` when the message does not conform.
pub fn validate(message: &impl Message) -> Result<()> {
    let descriptor = message.descriptor();
    let schema_name = format!("{}-{}", descriptor.interface, descriptor.method).to_lowercase();
    validate_value(&schema_name, message)
}

/// Validate a value against the named schema.
///
/// # Errors
///
/// Fails with `Error::BadRequest` when the value does not conform.
pub fn validate_value<T: Serialize + ?Sized>(schema_name: &str, value: &T) -> Result<()> {
    let schema = precompiled(schema_name)?;
    let validator = jsonschema::validator_for(&schema)
        .map_err(|e| unexpected!("issue compiling schema {schema_name}: {e}"))?;

    let instance =
        serde_json::to_value(value).map_err(|e| unexpected!("issue serializing value: {e}"))?;

    let errors = validator.iter_errors(&instance).collect::<Vec<_>>();
    if !errors.is_empty() {
        let mut detail = String::new();
        for e in errors {
            detail.push_str(&format!("\n - {e} at {}", e.instance_path));
        }
        return Err(invalid!("validation failed for {schema_name}: {detail}"));
    }

    Ok(())
}

// Precompiled JSON schemas, one per `(interface, method)`.
fn precompiled(schema_name: &str) -> Result<Value> {
    let bytes: &[u8] = match schema_name {
        "records-write" => include_bytes!("../schemas/records-write.json"),
        "records-delete" => include_bytes!("../schemas/records-delete.json"),
        "records-query" => include_bytes!("../schemas/records-query.json"),
        "records-read" => include_bytes!("../schemas/records-read.json"),
        "records-subscribe" => include_bytes!("../schemas/records-subscribe.json"),
        "protocols-configure" => include_bytes!("../schemas/protocols-configure.json"),
        "protocols-query" => include_bytes!("../schemas/protocols-query.json"),
        "messages-query" => include_bytes!("../schemas/messages-query.json"),
        "messages-read" => include_bytes!("../schemas/messages-read.json"),
        "messages-subscribe" => include_bytes!("../schemas/messages-subscribe.json"),
        _ => return Err(unexpected!("schema not found: {schema_name}")),
    };

    serde_json::from_slice(bytes).map_err(|e| unexpected!("issue loading schema: {e}"))
}
