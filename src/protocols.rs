//! # Protocols
//!
//! The protocols interface: configure a protocol definition for a tenant
//! and query configured protocols. A definition declares a type catalog and
//! a structure tree of protocol paths, each carrying the action rules the
//! records engine authorizes against.

mod configure;
mod query;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::configure::{Configure, ConfigureBuilder, ConfigureDescriptor, ConfigureReply};
pub use self::query::{Query, QueryBuilder, QueryDescriptor, QueryReply};
use crate::provider::MessageStore;
use crate::store::{self, ProtocolsQuery};
use crate::{Result, invalid};

/// The URI of the reserved protocol permission records are written under.
pub const PROTOCOL_URI: &str = "https://dwn-engine.io/permissions";

/// Maximum nesting depth of a protocol structure tree.
const MAX_DEPTH: usize = 10;

/// A protocol definition: the type catalog and structure tree configured
/// for a protocol URI.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    /// The protocol URI.
    pub protocol: String,

    /// Whether the definition may be returned to unauthorized
    /// `ProtocolsQuery` requestors.
    pub published: bool,

    /// The protocol's type catalog.
    pub types: BTreeMap<String, ProtocolType>,

    /// The structure tree of protocol paths.
    pub structure: BTreeMap<String, RuleSet>,
}

impl Definition {
    /// Returns a new [`Definition`] for the protocol URI.
    #[must_use]
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ..Self::default()
        }
    }

    /// Whether the definition is published.
    #[must_use]
    pub const fn published(mut self, published: bool) -> Self {
        self.published = published;
        self
    }

    /// Add a type to the catalog.
    #[must_use]
    pub fn add_type(mut self, name: impl Into<String>, type_: ProtocolType) -> Self {
        self.types.insert(name.into(), type_);
        self
    }

    /// Add a top-level rule set to the structure tree.
    #[must_use]
    pub fn add_rule(mut self, name: impl Into<String>, rule_set: RuleSet) -> Self {
        self.structure.insert(name.into(), rule_set);
        self
    }

    /// Find the rule set at the specified protocol path.
    #[must_use]
    pub fn rule_set(&self, protocol_path: &str) -> Option<&RuleSet> {
        let mut structure = &self.structure;
        let mut found = None;

        for segment in protocol_path.split('/') {
            found = structure.get(segment);
            structure = &found?.structure;
        }
        found
    }

    /// All role-record protocol paths declared by the definition.
    #[must_use]
    pub fn role_paths(&self) -> Vec<String> {
        fn walk(prefix: &str, structure: &BTreeMap<String, RuleSet>, roles: &mut Vec<String>) {
            for (name, rule_set) in structure {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                };
                if rule_set.role.unwrap_or_default() {
                    roles.push(path.clone());
                }
                walk(&path, &rule_set.structure, roles);
            }
        }

        let mut roles = vec![];
        walk("", &self.structure, &mut roles);
        roles
    }

    /// Validate the definition's structure tree.
    ///
    /// # Errors
    ///
    /// Fails with `Error::BadRequest` when the structure is inconsistent.
    pub fn verify_structure(&self) -> Result<()> {
        let types = self.types.keys().collect::<Vec<&String>>();
        let roles = self.role_paths();

        for (name, rule_set) in &self.structure {
            if !types.contains(&name) {
                return Err(invalid!("rule set {name} is not declared as a type"));
            }
            verify_rule_set(rule_set, name, &types, &roles)?;
        }

        Ok(())
    }
}

// Validate a rule set, recursing into nested rule sets.
fn verify_rule_set(
    rule_set: &RuleSet, protocol_path: &str, types: &[&String], roles: &[String],
) -> Result<()> {
    if protocol_path.split('/').count() > MAX_DEPTH {
        return Err(invalid!("record nesting depth exceeds {MAX_DEPTH} levels"));
    }

    if let Some(size) = &rule_set.size {
        if size.min.unwrap_or_default() > size.max.unwrap_or(u64::MAX) {
            return Err(invalid!("invalid size range at '{protocol_path}'"));
        }
    }

    // tag schemas must themselves be valid JSON schemas
    if let Some(tags) = &rule_set.tags {
        for (tag, schema) in &tags.defined_tags {
            jsonschema::validator_for(schema)
                .map_err(|e| invalid!("invalid schema for tag {tag}: {e}"))?;
        }
    }

    let empty = Vec::new();
    let actions = rule_set.actions.as_ref().unwrap_or(&empty);

    for (i, action) in actions.iter().enumerate() {
        if action.who.is_some() && action.role.is_some() {
            return Err(invalid!("`who` and `role` are mutually exclusive at {protocol_path}"));
        }

        if let Some(role) = &action.role {
            // the role must be a declared role record path
            if !roles.contains(role) {
                return Err(invalid!("missing role {role} in action for {protocol_path}"));
            }
        }

        // when `who` is `anyone`, `of` cannot be set
        if action.who == Some(Actor::Anyone) && action.of.is_some() {
            return Err(invalid!("`of` must not be set when `who` is \"anyone\" at {protocol_path}"));
        }

        // When `who` is "recipient" and `of` is unset, `can` may only
        // contain co-actions: there is no recipient before the record
        // exists.
        if action.who == Some(Actor::Recipient) && action.of.is_none() {
            let allowed = [Action::CoUpdate, Action::CoDelete, Action::CoPrune];
            if action.can.iter().any(|can| !allowed.contains(can)) {
                return Err(invalid!(
                    "recipient action must contain only co-update, co-delete, and co-prune"
                ));
            }
        }

        // when `who` is "author", `of` must be set
        if action.who == Some(Actor::Author) && action.of.is_none() {
            return Err(invalid!("`of` must be set when `who` is \"author\" at {protocol_path}"));
        }

        // `update` and `delete` imply `create`
        if action.can.contains(&Action::Update) && !action.can.contains(&Action::Create) {
            return Err(invalid!("action rule contains 'update' but no 'create'"));
        }
        if action.can.contains(&Action::Delete) && !action.can.contains(&Action::Create) {
            return Err(invalid!("action rule contains 'delete' but no 'create'"));
        }

        // no two action rules may share an actor or role
        for other in &actions[i + 1..] {
            if action.who.is_some() {
                if action.who == other.who && action.of == other.of {
                    return Err(invalid!(
                        "duplicate action rule for actor at {protocol_path}"
                    ));
                }
            } else if action.role == other.role {
                return Err(invalid!("duplicate action rule for role at {protocol_path}"));
            }
        }
    }

    for (name, nested) in &rule_set.structure {
        if !types.contains(&name) {
            return Err(invalid!("rule set {name} is not declared as a type"));
        }
        verify_rule_set(nested, &format!("{protocol_path}/{name}"), types, roles)?;
    }

    Ok(())
}

/// A type in a protocol's type catalog.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolType {
    /// The schema records of this type must carry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Data formats allowed for records of this type. Unset means any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_formats: Option<Vec<String>>,
}

/// A node in a protocol's structure tree.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RuleSet {
    /// Action rules for records at this path, evaluated in order.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$actions")]
    pub actions: Option<Vec<ActionRule>>,

    /// Marks the path as a role-granting record type.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$role")]
    pub role: Option<bool>,

    /// Record data size limits, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$size")]
    pub size: Option<SizeRange>,

    /// Tag rules for records at this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$tags")]
    pub tags: Option<TagsSchema>,

    /// Nested rule sets, keyed by type name.
    #[serde(flatten)]
    pub structure: BTreeMap<String, RuleSet>,
}

/// Record data size limits.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SizeRange {
    /// Minimum data size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<u64>,

    /// Maximum data size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
}

/// Tag rules for a protocol path.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct TagsSchema {
    /// Tags that must be present on records at this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$requiredTags")]
    pub required_tags: Option<Vec<String>>,

    /// Whether tags other than those defined below are allowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$allowUndefinedTags")]
    pub allow_undefined_tags: Option<bool>,

    /// Per-tag JSON schemas.
    #[serde(flatten)]
    pub defined_tags: BTreeMap<String, Value>,
}

/// An action rule: which actor may perform which actions on records at a
/// protocol path.
///
/// Rules take three forms:
///
/// 1. Anyone can create:
/// ```json
///   { "who": "anyone", "can": ["create"] }
/// ```
///
/// 2. The author or recipient of an ancestor record can create:
/// ```json
///   { "who": "recipient", "of": "requestForQuote", "can": ["create"] }
/// ```
///
/// 3. A role holder can create:
/// ```json
///   { "role": "friend", "can": ["create", "read"] }
/// ```
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionRule {
    /// The actor the rule applies to. Mutually exclusive with `role`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub who: Option<Actor>,

    /// The protocol path of a role record type marked `$role: true`.
    /// Mutually exclusive with `who`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// The ancestor protocol path whose author/recipient `who` refers to.
    /// Required when `who` is `author`; optional for `recipient`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub of: Option<String>,

    /// The actions the actor or role holder may perform.
    pub can: Vec<Action>,
}

/// Actor types.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Actor {
    /// Anyone may perform the action.
    #[default]
    Anyone,

    /// The author of the `of` ancestor record.
    Author,

    /// The recipient of the `of` ancestor record (or of this record, for
    /// co-actions).
    Recipient,
}

/// Rule actions.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    /// Create a record.
    Create,

    /// Delete one's own record.
    Delete,

    /// Query records.
    Query,

    /// Subscribe to records.
    Subscribe,

    /// Read records.
    #[default]
    Read,

    /// Update one's own record.
    Update,

    /// Delete another author's record.
    #[serde(rename = "co-delete")]
    CoDelete,

    /// Prune another author's record and its descendants.
    #[serde(rename = "co-prune")]
    CoPrune,

    /// Update another author's record.
    #[serde(rename = "co-update")]
    CoUpdate,
}

/// Fetch the protocol configurations for the tenant, optionally restricted
/// to a single protocol URI.
///
/// # Errors
///
/// Fails when the message store returns an error.
pub(crate) async fn fetch_config(
    owner: &str, protocol: Option<String>, store: &impl MessageStore,
) -> Result<Vec<Configure>> {
    let query = store::Query::Protocols(ProtocolsQuery {
        protocol,
        published: None,
    });

    let (entries, _) = store.query(owner, &query).await?;

    let mut configures = vec![];
    for entry in entries {
        let Some(configure) = entry.as_configure() else {
            continue;
        };
        configures.push(configure.clone());
    }

    Ok(configures)
}

/// Fetch the latest configuration of the specified protocol: latest wins by
/// message timestamp, ties broken by the larger message CID.
///
/// # Errors
///
/// Fails when the message store returns an error.
pub(crate) async fn definition(
    owner: &str, protocol_uri: &str, store: &impl MessageStore,
) -> Result<Definition> {
    let protocol_uri = crate::utils::clean_url(protocol_uri)?;

    // the permissions protocol is built in
    if protocol_uri == PROTOCOL_URI {
        return Ok(crate::permissions::protocol_definition());
    }

    let configures = fetch_config(owner, Some(protocol_uri.clone()), store).await?;

    let mut newest: Option<(i64, String, Configure)> = None;
    for configure in configures {
        let key = (
            configure.descriptor.base.message_timestamp.timestamp_micros(),
            crate::cid::from_value(&configure)?,
        );
        if newest.as_ref().is_none_or(|(ts, cid, _)| (key.0, &key.1) > (*ts, cid)) {
            newest = Some((key.0, key.1, configure));
        }
    }

    let Some((.., configure)) = newest else {
        return Err(crate::forbidden!("unable to find protocol definition for {protocol_uri}"));
    };
    Ok(configure.descriptor.definition)
}
