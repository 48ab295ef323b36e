//! # Provider
//!
//! Contracts the engine consumes from its embedding application: message
//! metadata storage, opaque data blobs, the append-only event log, the event
//! stream, resumable-task storage, DID resolution, and signing keys.
//!
//! Implementations must serialize their own internal state; the engine calls
//! them from concurrently executing handlers.

use std::io::Read;

use anyhow::Result;

use crate::did::Document;
use crate::event::{Event, SubscribeFilter, Subscriber};
use crate::store::{Cursor, Entry, Query};
use crate::tasks::ResumableTask;

/// A web node provider: the full set of collaborator implementations the
/// engine requires.
pub trait Provider:
    MessageStore + DataStore + EventLog + EventStream + TaskStore + DidResolver + Clone + Send + Sync
{
}

/// The `MessageStore` trait is used by implementers to provide message
/// storage capability.
pub trait MessageStore: Send + Sync {
    /// Store a message in the underlying store.
    fn put(&self, owner: &str, entry: &Entry) -> impl Future<Output = Result<()>> + Send;

    /// Query the underlying store for matching entries.
    fn query(
        &self, owner: &str, query: &Query,
    ) -> impl Future<Output = Result<(Vec<Entry>, Option<Cursor>)>> + Send;

    /// Fetch a single message by CID, returning `None` if no message was
    /// found.
    fn get(
        &self, owner: &str, message_cid: &str,
    ) -> impl Future<Output = Result<Option<Entry>>> + Send;

    /// Delete the message associated with the specified CID.
    fn delete(&self, owner: &str, message_cid: &str) -> impl Future<Output = Result<()>> + Send;

    /// Purge all records from the store.
    fn purge(&self) -> impl Future<Output = Result<()>> + Send;
}

/// The `DataStore` trait is used by implementers to provide record data
/// storage capability.
pub trait DataStore: Send + Sync {
    /// Store data from the reader, returning the computed CID and size of
    /// the stored data.
    fn put(
        &self, owner: &str, record_id: &str, data_cid: &str, reader: impl Read + Send,
    ) -> impl Future<Output = Result<(String, usize)>> + Send;

    /// Fetch data by CID, returning `None` when not found.
    fn get(
        &self, owner: &str, record_id: &str, data_cid: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Link an existing data entry to another record reference, returning
    /// `false` when the data does not exist.
    fn associate(
        &self, owner: &str, record_id: &str, data_cid: &str,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Delete the data associated with the specified record and CID.
    fn delete(
        &self, owner: &str, record_id: &str, data_cid: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Purge all data from the store.
    fn purge(&self) -> impl Future<Output = Result<()>> + Send;
}

/// The `EventLog` trait is used by implementers to provide an append-only
/// log of message events per tenant.
pub trait EventLog: Send + Sync {
    /// Append a message event to the owner's event log.
    fn append(&self, owner: &str, event: &Event) -> impl Future<Output = Result<()>> + Send;

    /// Retrieve all of the owner's events occurring after the provided
    /// cursor. With no cursor, all events are returned in append order.
    fn events(
        &self, owner: &str, cursor: Option<Cursor>,
    ) -> impl Future<Output = Result<(Vec<Event>, Option<Cursor>)>> + Send;

    /// Retrieve a filtered set of events occurring after the provided
    /// cursor, in append order.
    fn query(
        &self, owner: &str, query: &Query,
    ) -> impl Future<Output = Result<(Vec<Event>, Option<Cursor>)>> + Send;

    /// Delete the events for the specified `message_cid`s.
    fn delete(&self, owner: &str, message_cids: &[&str])
    -> impl Future<Output = Result<()>> + Send;

    /// Purge all events from the log.
    fn purge(&self) -> impl Future<Output = Result<()>> + Send;
}

/// The `EventStream` trait is used by implementers to provide real-time
/// fan-out of accepted messages to subscribers.
pub trait EventStream: Send + Sync {
    /// Subscribe to the owner's event stream, receiving events matching the
    /// filter until the subscriber is closed.
    fn subscribe(
        &self, owner: &str, filter: SubscribeFilter,
    ) -> impl Future<Output = Result<Subscriber>> + Send;

    /// Emit an event to the owner's event stream.
    fn emit(&self, owner: &str, event: &Event) -> impl Future<Output = Result<()>> + Send;
}

/// The `TaskStore` trait is used by implementers to persist resumable tasks
/// so that cross-store operations can be re-driven after a crash.
pub trait TaskStore: Send + Sync {
    /// Register a new in-flight resumable task. Once the timeout lapses the
    /// task becomes grabbable for re-driving.
    fn register(
        &self, owner: &str, task: &ResumableTask, timeout_secs: u64,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Grab up to `count` timed-out tasks, extending their timeouts so no
    /// other client grabs them concurrently.
    fn grab(
        &self, owner: &str, count: u64,
    ) -> impl Future<Output = Result<Vec<ResumableTask>>> + Send;

    /// Read the task with the provided id, in-flight or not.
    fn read(
        &self, owner: &str, task_id: &str,
    ) -> impl Future<Output = Result<Option<ResumableTask>>> + Send;

    /// Extend the timeout of the task with the provided id. No-op when the
    /// task no longer exists.
    fn extend(
        &self, owner: &str, task_id: &str, timeout_secs: u64,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete the completed task with the provided id.
    fn delete(&self, owner: &str, task_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Purge all tasks from the store.
    fn purge(&self, owner: &str) -> impl Future<Output = Result<()>> + Send;
}

/// The `DidResolver` trait is used by implementers to resolve a DID to its
/// DID document.
pub trait DidResolver: Send + Sync {
    /// Resolve the provided DID to its document.
    fn resolve(&self, did: &str) -> impl Future<Output = Result<Document>> + Send;
}

/// Signing algorithms supported for message authorization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, derive_more::Display)]
pub enum Algorithm {
    /// Edwards-curve digital signatures (Ed25519).
    #[default]
    #[display("EdDSA")]
    EdDsa,
}

/// The `Signer` trait wraps an opaque signing key.
pub trait Signer: Send + Sync {
    /// Sign the provided message bytes.
    fn try_sign(&self, msg: &[u8]) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// The verification method (key id) the signature can be verified with.
    fn verification_method(&self) -> impl Future<Output = Result<String>> + Send;

    /// The signing algorithm used.
    fn algorithm(&self) -> Algorithm;
}

/// The `KeyStore` trait provides signing keys for locally controlled DIDs.
pub trait KeyStore: Send + Sync {
    /// Keyring for the provided controller DID.
    ///
    /// # Errors
    ///
    /// Returns an error if no keyring exists for the controller.
    fn keyring(&self, controller: &str) -> Result<impl Signer + use<Self>>;
}
