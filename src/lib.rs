//! # Decentralized Web Node (DWN)
//!
//! A per-tenant, content-addressed message store that maintains the history
//! and latest state of records owned by decentralized identities (DIDs), and
//! enforces a declarative protocol language governing who may read, write,
//! delete, query, and subscribe to those records.
//!
//! The engine is storage-agnostic: all persistence is delegated to the
//! [`provider`] traits implemented by the embedding application. Messages are
//! submitted through [`endpoint::handle`] and dispatched to per-interface
//! handlers in [`records`], [`protocols`], and [`messages`].

mod authorization;
pub mod cid;
pub mod data;
pub mod did;
pub mod endpoint;
mod error;
pub mod event;
pub mod jws;
pub mod messages;
pub mod permissions;
pub mod protocols;
pub mod provider;
pub mod records;
mod schema;
pub mod store;
pub mod tasks;
mod utils;

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::authorization::{Authorization, AuthorizationBuilder, JwsPayload};
pub use crate::endpoint::{Message, Reply, Status};
pub use crate::error::Error;

/// Result type for `DWN` handlers.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Web node interfaces.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, derive_more::Display)]
pub enum Interface {
    /// Records interface.
    #[default]
    Records,

    /// Protocols interface.
    Protocols,

    /// Messages interface.
    Messages,
}

/// Interface methods.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, derive_more::Display)]
pub enum Method {
    /// Read method.
    #[default]
    Read,

    /// Write method.
    Write,

    /// Query method.
    Query,

    /// Configure method.
    Configure,

    /// Subscribe method.
    Subscribe,

    /// Delete method.
    Delete,
}

/// The message descriptor properties common to all messages.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The associated web node interface.
    pub interface: Interface,

    /// The interface method.
    pub method: Method,

    /// The timestamp of the message.
    pub message_timestamp: DateTime<Utc>,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self {
            interface: Interface::default(),
            method: Method::default(),
            message_timestamp: Utc::now(),
        }
    }
}

/// A value that may be a single item or a list of items.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A single item.
    One(T),

    /// A list of items.
    Many(Vec<T>),
}

impl<T: Default> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::One(T::default())
    }
}

impl<T: Clone> OneOrMany<T> {
    /// Convert the value to a vector.
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value.clone()],
            Self::Many(values) => values.clone(),
        }
    }
}

/// An inclusive or exclusive lower range bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lower<T> {
    /// Lower bound is part of the range.
    Inclusive(T),

    /// Lower bound is outside the range.
    Exclusive(T),
}

/// An inclusive or exclusive upper range bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Upper<T> {
    /// Upper bound is part of the range.
    Inclusive(T),

    /// Upper bound is outside the range.
    Exclusive(T),
}

/// A range filter with optional lower and upper bounds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Range<T> {
    /// The filter's lower bound.
    pub lower: Option<Lower<T>>,

    /// The filter's upper bound.
    pub upper: Option<Upper<T>>,
}

impl<T: PartialOrd> Range<T> {
    /// Create a new range filter with no bounds.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lower: None,
            upper: None,
        }
    }

    /// Set the range's exclusive lower bound.
    #[must_use]
    pub fn gt(mut self, gt: T) -> Self {
        self.lower = Some(Lower::Exclusive(gt));
        self
    }

    /// Set the range's inclusive lower bound.
    #[must_use]
    pub fn ge(mut self, ge: T) -> Self {
        self.lower = Some(Lower::Inclusive(ge));
        self
    }

    /// Set the range's exclusive upper bound.
    #[must_use]
    pub fn lt(mut self, lt: T) -> Self {
        self.upper = Some(Upper::Exclusive(lt));
        self
    }

    /// Set the range's inclusive upper bound.
    #[must_use]
    pub fn le(mut self, le: T) -> Self {
        self.upper = Some(Upper::Inclusive(le));
        self
    }

    /// Check whether the range contains the specified value.
    pub fn contains(&self, value: &T) -> bool {
        let lower_ok = match &self.lower {
            Some(Lower::Inclusive(lower)) => value >= lower,
            Some(Lower::Exclusive(lower)) => value > lower,
            None => true,
        };
        if !lower_ok {
            return false;
        }
        match &self.upper {
            Some(Upper::Inclusive(upper)) => value <= upper,
            Some(Upper::Exclusive(upper)) => value < upper,
            None => true,
        }
    }
}

// Serialize `Range` as a `{gt | gte, lt | lte}` map.
impl<T: Serialize> Serialize for Range<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(None)?;
        match &self.lower {
            Some(Lower::Inclusive(value)) => map.serialize_entry("gte", value)?,
            Some(Lower::Exclusive(value)) => map.serialize_entry("gt", value)?,
            None => {}
        }
        match &self.upper {
            Some(Upper::Inclusive(value)) => map.serialize_entry("lte", value)?,
            Some(Upper::Exclusive(value)) => map.serialize_entry("lt", value)?,
            None => {}
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Range<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr<T> {
            gt: Option<T>,
            gte: Option<T>,
            lt: Option<T>,
            lte: Option<T>,
        }

        let repr = Repr::deserialize(deserializer)?;
        let lower = match (repr.gte, repr.gt) {
            (Some(value), _) => Some(Lower::Inclusive(value)),
            (None, Some(value)) => Some(Lower::Exclusive(value)),
            (None, None) => None,
        };
        let upper = match (repr.lte, repr.lt) {
            (Some(value), _) => Some(Upper::Inclusive(value)),
            (None, Some(value)) => Some(Upper::Exclusive(value)),
            (None, None) => None,
        };

        Ok(Self { lower, upper })
    }
}

/// An inclusive date range filter.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DateRange {
    /// The earliest matching date.
    #[serde(rename = "from")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lower: Option<DateTime<Utc>>,

    /// The latest matching date (exclusive).
    #[serde(rename = "to")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upper: Option<DateTime<Utc>>,
}

impl DateRange {
    /// Create a new date range with no bounds.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lower: None,
            upper: None,
        }
    }

    /// Set the earliest matching date.
    #[must_use]
    pub const fn gt(mut self, gt: DateTime<Utc>) -> Self {
        self.lower = Some(gt);
        self
    }

    /// Set the latest matching date.
    #[must_use]
    pub const fn lt(mut self, lt: DateTime<Utc>) -> Self {
        self.upper = Some(lt);
        self
    }

    /// Check whether the range contains the specified date.
    #[must_use]
    pub fn contains(&self, date: &DateTime<Utc>) -> bool {
        if let Some(lower) = &self.lower {
            if date < lower {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            if date >= upper {
                return false;
            }
        }
        true
    }
}

/// Pad a numeric index value so lexicographic ordering matches numeric
/// ordering.
pub(crate) fn index_num(value: impl Display) -> String {
    format!("{value:0>10}")
}
