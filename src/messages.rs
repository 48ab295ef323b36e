//! # Messages
//!
//! The messages interface: query, read, and subscribe to the tenant's
//! event log across all message types.

mod query;
mod read;
mod subscribe;

use serde::{Deserialize, Serialize};

pub use self::query::{Query, QueryBuilder, QueryDescriptor, QueryReply};
pub use self::read::{Read, ReadBuilder, ReadDescriptor, ReadReply, ReadReplyEntry};
pub use self::subscribe::{
    Subscribe, SubscribeBuilder, SubscribeDescriptor, SubscribeReply,
};
use crate::store::{Entry, EntryType};
use crate::{DateRange, Interface, Method};

/// Messages filter.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessagesFilter {
    /// Events for the specified interface.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<Interface>,

    /// Events for the specified method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,

    /// Events for records under the specified protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Events within the specified timestamp range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_timestamp: Option<DateRange>,
}

impl MessagesFilter {
    /// Returns a new [`MessagesFilter`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Match events for the specified interface.
    #[must_use]
    pub fn interface(mut self, interface: Interface) -> Self {
        self.interface = Some(interface);
        self
    }

    /// Match events for the specified method.
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Match events for records under the specified protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Match events within the specified timestamp range.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateRange) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Check the event matches the filter.
    #[must_use]
    pub fn is_match(&self, event: &Entry) -> bool {
        let descriptor = event.descriptor();

        if let Some(interface) = &self.interface {
            if interface != &descriptor.interface {
                return false;
            }
        }
        if let Some(method) = &self.method {
            if method != &descriptor.method {
                return false;
            }
        }
        if let Some(protocol) = &self.protocol {
            match &event.message {
                EntryType::Write(write) => {
                    if write.descriptor.protocol.as_ref() != Some(protocol) {
                        return false;
                    }
                }
                EntryType::Delete(_) => {
                    if event.indexes.get("protocol") != Some(protocol) {
                        return false;
                    }
                }
                EntryType::Configure(configure) => {
                    if &configure.descriptor.definition.protocol != protocol {
                        return false;
                    }
                }
            }
        }
        if let Some(message_timestamp) = &self.message_timestamp {
            if !message_timestamp.contains(&descriptor.message_timestamp) {
                return false;
            }
        }

        true
    }
}
