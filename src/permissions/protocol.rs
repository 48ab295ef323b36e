//! # Permissions protocol
//!
//! The built-in protocol permission records are written under. Requests,
//! grants, and revocations are ordinary records at reserved paths; the
//! definition below is always available without a `ProtocolsConfigure`.

use crate::permissions::{self, GrantData, RequestData};
use crate::protocols::{
    Action, ActionRule, Actor, Definition, PROTOCOL_URI, ProtocolType, RuleSet,
};
use crate::provider::MessageStore;
use crate::records::{self, Write};
use crate::{Result, forbidden};

/// The built-in definition of the permissions protocol.
#[must_use]
pub(crate) fn protocol_definition() -> Definition {
    let json_type = ProtocolType {
        schema: None,
        data_formats: Some(vec!["application/json".to_string()]),
    };

    Definition::new(PROTOCOL_URI)
        .published(true)
        .add_type("request", json_type.clone())
        .add_type("grant", json_type.clone())
        .add_type("revocation", json_type)
        .add_rule("request", RuleSet {
            actions: Some(vec![ActionRule {
                who: Some(Actor::Anyone),
                role: None,
                of: None,
                can: vec![Action::Create],
            }]),
            ..RuleSet::default()
        })
        .add_rule("grant", RuleSet {
            actions: Some(vec![ActionRule {
                who: Some(Actor::Recipient),
                role: None,
                of: Some("grant".to_string()),
                can: vec![Action::Read, Action::Query],
            }]),
            structure: [("revocation".to_string(), RuleSet {
                actions: Some(vec![ActionRule {
                    who: Some(Actor::Anyone),
                    role: None,
                    of: None,
                    can: vec![Action::Read],
                }]),
                ..RuleSet::default()
            })]
            .into(),
            ..RuleSet::default()
        })
}

/// Fetch the scope carried by a permission record: the scope of a request
/// or grant, or — for a revocation — the scope of the revoked grant.
///
/// # Errors
///
/// Fails when the record is not a permission record or its payload cannot
/// be decoded.
pub(crate) async fn fetch_scope(
    owner: &str, write: &Write, store: &impl MessageStore,
) -> Result<permissions::Scope> {
    if write.descriptor.protocol.as_deref() != Some(PROTOCOL_URI) {
        return Err(forbidden!("record is not a permission record"));
    }

    match write.descriptor.protocol_path.as_deref() {
        Some("request") => {
            let Some(encoded) = &write.encoded_data else {
                return Err(forbidden!("missing request data"));
            };
            let data: RequestData = permissions::decode_data(encoded)?;
            Ok(data.scope)
        }
        Some("grant") => {
            let Some(encoded) = &write.encoded_data else {
                return Err(forbidden!("missing grant data"));
            };
            let data: GrantData = permissions::decode_data(encoded)?;
            Ok(data.scope)
        }
        Some("grant/revocation") => {
            let Some(grant_id) = &write.descriptor.parent_id else {
                return Err(forbidden!("revocation record has no parent grant"));
            };
            let Some(grant) = records::initial_write(owner, grant_id, store).await? else {
                return Err(forbidden!("revoked grant not found"));
            };
            let Some(encoded) = &grant.encoded_data else {
                return Err(forbidden!("missing grant data"));
            };
            let data: GrantData = permissions::decode_data(encoded)?;
            Ok(data.scope)
        }
        _ => Err(forbidden!("record is not a permission record")),
    }
}
