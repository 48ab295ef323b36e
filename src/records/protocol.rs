//! # Protocol authorization
//!
//! Evaluation of protocol definitions against records messages: structural
//! placement of writes in the protocol tree, type and tag conformance, and
//! the action rules and role invocations that authorize non-owner authors.

use serde_json::json;

use crate::protocols::{self, Action, ActionRule, Actor, Definition, RuleSet};
use crate::provider::MessageStore;
use crate::records::{self, Delete, Read, RecordsFilter, Subscribe, Write};
use crate::store::RecordsQueryBuilder;
use crate::{Error, Result, forbidden, invalid, unexpected};

/// Validate the structure of a protocol-bound `RecordsWrite` against its
/// protocol definition: tree placement, type conformance, role-record
/// integrity, size limits, and tag rules.
///
/// # Errors
///
/// Fails with `Error::BadRequest` when the write does not conform.
pub async fn verify_integrity(
    owner: &str, write: &Write, store: &impl MessageStore,
) -> Result<()> {
    let Some(protocol) = &write.descriptor.protocol else {
        return Err(invalid!("missing protocol"));
    };
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(invalid!("missing protocol path"));
    };

    let definition = protocols::definition(owner, protocol, store).await?;
    let Some(rule_set) = definition.rule_set(protocol_path) else {
        return Err(invalid!("no rule set defined for protocol path {protocol_path}"));
    };

    verify_type(write, &definition)?;
    verify_protocol_path(owner, write, store).await?;
    if rule_set.role.unwrap_or_default() {
        verify_role_record(owner, write, store).await?;
    }
    verify_size_limit(write.descriptor.data_size, rule_set)?;
    verify_tags(write, rule_set)?;

    Ok(())
}

// Verify the write's `schema` and `data_format` conform to the node's type
// reference.
fn verify_type(write: &Write, definition: &Definition) -> Result<()> {
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(invalid!("missing protocol path"));
    };
    let Some(type_name) = protocol_path.split('/').next_back() else {
        return Err(invalid!("missing type name"));
    };
    let Some(protocol_type) = definition.types.get(type_name) else {
        return Err(invalid!("record with type {type_name} not allowed in protocol"));
    };

    if protocol_type.schema.is_some() && protocol_type.schema != write.descriptor.schema {
        return Err(invalid!("invalid schema for type {type_name}"));
    }

    if let Some(data_formats) = &protocol_type.data_formats {
        if !data_formats.contains(&write.descriptor.data_format) {
            return Err(invalid!("invalid data format for type {type_name}"));
        }
    }

    Ok(())
}

// Verify the write's `protocol_path` and `context_id` match its actual
// position in the record tree.
async fn verify_protocol_path(
    owner: &str, write: &Write, store: &impl MessageStore,
) -> Result<()> {
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(invalid!("missing protocol path"));
    };
    let Some(type_name) = protocol_path.split('/').next_back() else {
        return Err(invalid!("missing type name"));
    };

    let Some(parent_id) = &write.descriptor.parent_id else {
        if protocol_path != type_name {
            return Err(invalid!("invalid protocol path for parentless record"));
        }
        return Ok(());
    };

    // the parent must exist and must be of the type the tree expects
    let Some(parent) = records::initial_write(owner, parent_id, store).await? else {
        return Err(invalid!("unable to find parent record {parent_id}"));
    };
    if parent.descriptor.protocol != write.descriptor.protocol {
        return Err(invalid!("parent record is not in the same protocol"));
    }

    let Some(parent_path) = &parent.descriptor.protocol_path else {
        return Err(invalid!("parent record has no protocol path"));
    };
    if &format!("{parent_path}/{type_name}") != protocol_path {
        return Err(invalid!("invalid `protocol_path`"));
    }

    // the context must be a child of the parent's context
    let Some(context_id) = &write.context_id else {
        return Err(invalid!("missing `context_id`"));
    };
    let Some(parent_context_id) = &parent.context_id else {
        return Err(invalid!("missing parent `context_id`"));
    };
    if context_id != &format!("{parent_context_id}/{}", write.record_id) {
        return Err(invalid!("invalid `context_id`"));
    }

    Ok(())
}

// Verify the integrity of a write creating a role record: the recipient is
// granted the role, and must not hold it already within the same context.
async fn verify_role_record(owner: &str, write: &Write, store: &impl MessageStore) -> Result<()> {
    let Some(recipient) = &write.descriptor.recipient else {
        return Err(invalid!("role record is missing recipient"));
    };
    let Some(protocol) = &write.descriptor.protocol else {
        return Err(invalid!("missing protocol"));
    };
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(invalid!("missing protocol path"));
    };

    let mut filter = RecordsFilter::new()
        .protocol(protocol)
        .protocol_path(protocol_path)
        .add_recipient(recipient);

    // scope the uniqueness check to the role's context subtree
    if let Some(parent_context) =
        write.context_id.as_ref().and_then(|id| id.rsplit_once('/')).map(|(parent, _)| parent)
    {
        filter = filter.context_id(parent_context);
    }

    let query = RecordsQueryBuilder::new().add_filter(filter).build();
    let (entries, _) = store.query(owner, &query).await?;

    for entry in entries {
        if let Some(matched) = entry.as_write() {
            if matched.record_id != write.record_id {
                return Err(Error::Conflict(format!(
                    "DID '{recipient}' is already recipient of a role record"
                )));
            }
        }
    }

    Ok(())
}

// Verify the write's data size is within the node's limits.
fn verify_size_limit(data_size: usize, rule_set: &RuleSet) -> Result<()> {
    let Some(range) = &rule_set.size else {
        return Ok(());
    };
    let data_size = data_size as u64;

    if let Some(min) = range.min {
        if data_size < min {
            return Err(invalid!("data size is less than allowed"));
        }
    }
    if let Some(max) = range.max {
        if data_size > max {
            return Err(invalid!("data size exceeds maximum allowed"));
        }
    }

    Ok(())
}

// Verify the write's tags satisfy the node's tag schema.
fn verify_tags(write: &Write, rule_set: &RuleSet) -> Result<()> {
    let Some(rule_set_tags) = &rule_set.tags else {
        return Ok(());
    };

    let schema = json!({
        "type": "object",
        "properties": rule_set_tags.defined_tags,
        "required": rule_set_tags.required_tags.clone().unwrap_or_default(),
        "additionalProperties": rule_set_tags.allow_undefined_tags.unwrap_or_default(),
    });

    let instance = serde_json::to_value(write.descriptor.tags.clone().unwrap_or_default())
        .map_err(|e| unexpected!("issue serializing tags: {e}"))?;

    if !jsonschema::is_valid(&schema, &instance) {
        return Err(invalid!("tags do not match protocol tag schema"));
    }

    Ok(())
}

/// Protocol-based authorization of records messages for one tenant.
pub struct Authorizer<'a> {
    owner: &'a str,
}

impl<'a> Authorizer<'a> {
    /// Returns a new [`Authorizer`] for the tenant.
    #[must_use]
    pub const fn new(owner: &'a str) -> Self {
        Self { owner }
    }

    /// Authorize a `RecordsWrite` against its protocol's action rules.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when no rule admits the write.
    pub async fn permit_write(&self, write: &Write, store: &impl MessageStore) -> Result<()> {
        let author = write.authorization.author()?;
        let Some(protocol) = &write.descriptor.protocol else {
            return Err(forbidden!("missing protocol"));
        };
        let Some(protocol_path) = &write.descriptor.protocol_path else {
            return Err(forbidden!("missing protocol path"));
        };

        let definition = protocols::definition(self.owner, protocol, store).await?;
        let Some(rule_set) = definition.rule_set(protocol_path) else {
            return Err(forbidden!("no rule set defined for protocol path {protocol_path}"));
        };

        // determine the semantic action of the write
        let initial = records::initial_write(self.owner, &write.record_id, store).await?;
        let allowed_actions = match &initial {
            None => vec![Action::Create],
            Some(initial) => {
                if author == initial.authorization.author()? {
                    vec![Action::CoUpdate, Action::Update]
                } else {
                    vec![Action::CoUpdate]
                }
            }
        };

        // the ancestor chain the action rules refer to
        let record_chain = if initial.is_some() {
            self.record_chain(&write.record_id, store).await?
        } else if let Some(parent_id) = &write.descriptor.parent_id {
            self.record_chain(parent_id, store).await?
        } else {
            vec![]
        };

        let invoked_role = write.authorization.payload()?.protocol_role;
        if let Some(role) = &invoked_role {
            self.verify_invoked_role(
                &author,
                &definition,
                role,
                write.context_id.as_deref(),
                store,
            )
            .await?;
        }

        let recipient = write.descriptor.recipient.clone();
        verify_actions(
            &author,
            invoked_role.as_deref(),
            &allowed_actions,
            rule_set,
            &record_chain,
            recipient.as_deref(),
        )
    }

    /// Authorize a `RecordsDelete` against the protocol of the record being
    /// deleted.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when no rule admits the delete.
    pub async fn permit_delete(
        &self, delete: &Delete, initial: &Write, store: &impl MessageStore,
    ) -> Result<()> {
        let author = delete.authorization.author()?;
        let Some(protocol) = &initial.descriptor.protocol else {
            return Err(forbidden!("missing protocol"));
        };
        let Some(protocol_path) = &initial.descriptor.protocol_path else {
            return Err(forbidden!("missing protocol path"));
        };

        let definition = protocols::definition(self.owner, protocol, store).await?;
        let Some(rule_set) = definition.rule_set(protocol_path) else {
            return Err(forbidden!("no rule set defined for protocol path {protocol_path}"));
        };

        // a delete by the record's author is `delete`; by another author it
        // is `co-delete`, or `co-prune` when pruning descendants
        let is_author = author == initial.authorization.author()?;
        let allowed_actions = if delete.descriptor.prune {
            if is_author { vec![Action::Delete] } else { vec![Action::CoPrune] }
        } else if is_author {
            vec![Action::CoDelete, Action::Delete]
        } else {
            vec![Action::CoDelete]
        };

        let record_chain = self.record_chain(&initial.record_id, store).await?;

        let invoked_role = delete.authorization.payload()?.protocol_role;
        if let Some(role) = &invoked_role {
            self.verify_invoked_role(
                &author,
                &definition,
                role,
                initial.context_id.as_deref(),
                store,
            )
            .await?;
        }

        verify_actions(
            &author,
            invoked_role.as_deref(),
            &allowed_actions,
            rule_set,
            &record_chain,
            initial.descriptor.recipient.as_deref(),
        )
    }

    /// Authorize a `RecordsRead` of the provided record.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when no rule admits the read.
    pub async fn permit_read(
        &self, read: &Read, write: &Write, store: &impl MessageStore,
    ) -> Result<()> {
        let Some(authzn) = &read.authorization else {
            return Err(forbidden!("missing authorization"));
        };
        let author = authzn.author()?;

        let Some(protocol) = &write.descriptor.protocol else {
            return Err(forbidden!("missing protocol"));
        };
        let Some(protocol_path) = &write.descriptor.protocol_path else {
            return Err(forbidden!("missing protocol path"));
        };

        let definition = protocols::definition(self.owner, protocol, store).await?;
        let Some(rule_set) = definition.rule_set(protocol_path) else {
            return Err(forbidden!("no rule set defined for protocol path {protocol_path}"));
        };

        let invoked_role = authzn.payload()?.protocol_role;
        if let Some(role) = &invoked_role {
            self.verify_invoked_role(
                &author,
                &definition,
                role,
                write.context_id.as_deref(),
                store,
            )
            .await?;
        }

        let record_chain = self.record_chain(&write.record_id, store).await?;

        verify_actions(
            &author,
            invoked_role.as_deref(),
            &[Action::Read],
            rule_set,
            &record_chain,
            write.descriptor.recipient.as_deref(),
        )
    }

    /// Authorize a role-invoking `RecordsQuery`.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when the invoked role does not
    /// admit the query.
    pub async fn permit_query(
        &self, query: &records::Query, store: &impl MessageStore,
    ) -> Result<()> {
        let Some(authzn) = &query.authorization else {
            return Err(forbidden!("missing authorization"));
        };
        let filter = &query.descriptor.filter;
        self.permit_role_filter(authzn, filter, Action::Query, store).await
    }

    /// Authorize a role-invoking `RecordsSubscribe`.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Unauthorized` when the invoked role does not
    /// admit the subscription.
    pub async fn permit_subscribe(
        &self, subscribe: &Subscribe, store: &impl MessageStore,
    ) -> Result<()> {
        let Some(authzn) = &subscribe.authorization else {
            return Err(forbidden!("missing authorization"));
        };
        let filter = &subscribe.descriptor.filter;
        self.permit_role_filter(authzn, filter, Action::Subscribe, store).await
    }

    // Query and subscribe are authorized through roles alone: the invoked
    // role's rule at the filtered path must cover the action.
    async fn permit_role_filter(
        &self, authzn: &crate::authorization::Authorization, filter: &RecordsFilter,
        action: Action, store: &impl MessageStore,
    ) -> Result<()> {
        let author = authzn.author()?;
        let Some(role) = authzn.payload()?.protocol_role else {
            return Err(forbidden!("missing protocol role"));
        };
        let Some(protocol) = &filter.protocol else {
            return Err(forbidden!("missing protocol"));
        };
        let Some(protocol_path) = &filter.protocol_path else {
            return Err(forbidden!("missing protocol path"));
        };

        let definition = protocols::definition(self.owner, protocol, store).await?;
        let Some(rule_set) = definition.rule_set(protocol_path) else {
            return Err(forbidden!("no rule set defined for protocol path {protocol_path}"));
        };

        self.verify_invoked_role(
            &author,
            &definition,
            &role,
            filter.context_id.as_deref(),
            store,
        )
        .await?;

        for rule in rule_set.actions.as_ref().unwrap_or(&vec![]) {
            if rule.role.as_deref() == Some(role.as_str()) && rule.can.contains(&action) {
                return Ok(());
            }
        }

        Err(forbidden!("role {role} is not permitted to {action:?}"))
    }

    // Verify the author holds the role they invoke: a role record at the
    // role path with `recipient == author` must exist, anchored at an
    // ancestor context for contextual roles.
    async fn verify_invoked_role(
        &self, author: &str, definition: &Definition, role: &str, context_id: Option<&str>,
        store: &impl MessageStore,
    ) -> Result<()> {
        let Some(rule_set) = definition.rule_set(role) else {
            return Err(forbidden!("no rule set defined for role {role}"));
        };
        if !rule_set.role.unwrap_or_default() {
            return Err(forbidden!("protocol path {role} does not denote a role record"));
        }

        let mut filter = RecordsFilter::new()
            .protocol(&definition.protocol)
            .protocol_path(role)
            .add_recipient(author);

        // a contextual role is anchored at the subtree holding the role
        // record: the first (depth - 1) segments of the invoking context
        let role_depth = role.split('/').count();
        if role_depth > 1 {
            let Some(context_id) = context_id else {
                return Err(forbidden!("unable to verify role without `context_id`"));
            };
            let segments: Vec<&str> = context_id.split('/').collect();
            if segments.len() < role_depth - 1 {
                return Err(forbidden!("`context_id` too shallow for role {role}"));
            }
            filter = filter.context_id(segments[..role_depth - 1].join("/"));
        }

        let query = RecordsQueryBuilder::new().add_filter(filter).build();
        let (entries, _) = store.query(self.owner, &query).await?;
        if entries.is_empty() {
            return Err(forbidden!("no matching role record found for {role}"));
        }

        Ok(())
    }

    // Construct the chain of existing records from the root of the context
    // to the specified record, as initial writes, root first.
    async fn record_chain(
        &self, record_id: &str, store: &impl MessageStore,
    ) -> Result<Vec<Write>> {
        let mut chain = vec![];
        let mut current_id = Some(record_id.to_owned());

        while let Some(record_id) = &current_id {
            let Some(initial) = records::initial_write(self.owner, record_id, store).await? else {
                return Err(forbidden!(
                    "no record found with ID {record_id} when constructing record chain"
                ));
            };
            current_id.clone_from(&initial.descriptor.parent_id);
            chain.push(initial);
        }

        chain.reverse();
        Ok(chain)
    }
}

// Walk the node's action rules in order; the first rule whose actor
// predicate is satisfied and whose `can` covers one of the message's
// semantic actions authorizes it.
fn verify_actions(
    author: &str, invoked_role: Option<&str>, allowed_actions: &[Action], rule_set: &RuleSet,
    record_chain: &[Write], recipient: Option<&str>,
) -> Result<()> {
    let Some(action_rules) = &rule_set.actions else {
        return Err(forbidden!("no action rule defined, {author} is unauthorized"));
    };

    for rule in action_rules {
        if !rule.can.iter().any(|action| allowed_actions.contains(action)) {
            continue;
        }

        if rule.who == Some(Actor::Anyone) {
            return Ok(());
        }

        // when a role is invoked, only the matching role rule applies
        if let Some(role) = invoked_role {
            if rule.role.as_deref() == Some(role) {
                return Ok(());
            }
            continue;
        }

        // `recipient` with no `of`: the target record's own recipient
        if rule.who == Some(Actor::Recipient) && rule.of.is_none() {
            if recipient == Some(author) {
                return Ok(());
            }
            continue;
        }

        if check_actor(author, rule, record_chain)? {
            return Ok(());
        }
    }

    Err(forbidden!("action not permitted for {author}"))
}

// Check the rule's `who`/`of` predicate against the ancestor record chain.
fn check_actor(author: &str, rule: &ActionRule, record_chain: &[Write]) -> Result<bool> {
    let ancestor =
        record_chain.iter().find(|write| write.descriptor.protocol_path == rule.of);
    let Some(ancestor) = ancestor else {
        return Ok(false);
    };

    if rule.who == Some(Actor::Recipient) {
        return Ok(ancestor.descriptor.recipient.as_deref() == Some(author));
    }
    Ok(author == ancestor.authorization.author()?)
}
