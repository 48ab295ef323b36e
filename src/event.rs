//! # Event
//!
//! Events are the entries appended to the event log and fanned out to
//! subscribers when a message is accepted.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::messages::MessagesFilter;
use crate::records::RecordsFilter;
use crate::store::{Entry, EntryType};

/// Alias for `store::Entry` used for event-related functionality.
pub type Event = Entry;

/// Filter to use when subscribing to events.
#[derive(Debug, Deserialize, Serialize)]
#[allow(missing_docs)]
pub enum SubscribeFilter {
    Messages(Vec<MessagesFilter>),
    Records(RecordsFilter),
}

impl Default for SubscribeFilter {
    fn default() -> Self {
        Self::Messages(Vec::default())
    }
}

impl SubscribeFilter {
    /// Check the event matches the filter.
    #[must_use]
    pub fn is_match(&self, event: &Event) -> bool {
        match self {
            Self::Messages(filters) => {
                filters.is_empty() || filters.iter().any(|filter| filter.is_match(event))
            }
            Self::Records(filter) => {
                // a records filter only matches record events
                if let EntryType::Configure(_) = event.message {
                    return false;
                }
                filter.is_match(&event.indexes)
            }
        }
    }
}

/// A handle on a stream of subscribed events. Dropping (or closing) the
/// subscriber ends the subscription; no events are delivered afterwards.
pub struct Subscriber {
    /// The subscription's unique identifier.
    pub id: String,

    inner: Pin<Box<dyn Stream<Item = Event> + Send>>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

impl Default for Subscriber {
    fn default() -> Self {
        Self::new(String::new(), Box::pin(futures::stream::empty()))
    }
}

impl Subscriber {
    /// Wrap a provider's subscription stream.
    #[must_use]
    pub fn new(id: impl Into<String>, stream: Pin<Box<dyn Stream<Item = Event> + Send>>) -> Self {
        Self {
            id: id.into(),
            inner: stream,
        }
    }

    /// Close the subscription. No further events are delivered after this
    /// returns.
    pub fn close(self) {
        drop(self);
    }
}

impl Stream for Subscriber {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
