//! # Record data handling
//!
//! Record data at or below [`MAX_ENCODED_SIZE`] travels inside the message
//! as base64url `encoded_data`; larger payloads are streamed through the
//! [`DataStore`](crate::provider::DataStore).

use std::io::{Cursor, Read};

use crate::provider::DataStore;
use crate::{Result, cid};

/// The maximum data size, in bytes, that is encoded inline in the message
/// rather than stored in the data store.
pub const MAX_ENCODED_SIZE: usize = 30000;

/// An in-memory data stream for record data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataStream {
    buffer: Cursor<Vec<u8>>,
}

impl From<Vec<u8>> for DataStream {
    fn from(data: Vec<u8>) -> Self {
        Self {
            buffer: Cursor::new(data),
        }
    }
}

impl Read for DataStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.buffer.read(buf)
    }
}

impl DataStream {
    /// Fetch a record's data from the data store, returning `None` when the
    /// data does not exist.
    ///
    /// # Errors
    ///
    /// Fails when the data store returns an error.
    pub async fn from_store(
        owner: &str, record_id: &str, data_cid: &str, store: &impl DataStore,
    ) -> Result<Option<Self>> {
        let Some(data) = store.get(owner, record_id, data_cid).await? else {
            return Ok(None);
        };
        Ok(Some(Self::from(data)))
    }

    /// Compute the CID and size of the stream's data without consuming it.
    ///
    /// # Errors
    ///
    /// Fails when the CID cannot be computed.
    pub fn compute_cid(&self) -> Result<(String, usize)> {
        cid::from_reader(self.buffer.get_ref().as_slice())
    }

    /// The stream's data as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.get_ref()
    }

    /// Consume the stream, returning its data.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer.into_inner()
    }
}
