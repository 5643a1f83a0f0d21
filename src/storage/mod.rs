//! Object storage boundary.
//!
//! The pipeline needs three capabilities from storage: stream an object's
//! bytes out, stream bytes in with a durable completion signal, and mint
//! time-limited upload grants for direct client uploads. Authentication and
//! durability are the backend's concern, not modeled here.

mod http;
mod memory;

pub use http::HttpObjectStore;
pub use memory::MemoryObjectStore;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

/// Streaming read handle for one object.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write side of one in-progress object upload.
///
/// Bytes handed to `write_chunk` are not guaranteed stored until `finish`
/// returns; `finish` is the durable completion signal.
#[async_trait]
pub trait ObjectSink: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()>;

    /// Complete the upload. Resolves only once the backend has confirmed
    /// the object is durably written.
    async fn finish(self: Box<Self>) -> Result<()>;

    /// Abandon the upload without creating the object.
    async fn abort(self: Box<Self>);
}

/// Trait for object storage backends
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open an object for streaming reads
    async fn open_read(&self, object: &str) -> Result<ObjectReader>;

    /// Open an object for streaming writes
    async fn open_write(&self, object: &str, content_type: &str) -> Result<Box<dyn ObjectSink>>;

    /// Mint a time-limited URL an external client can upload to directly
    fn upload_grant(&self, object: &str, content_type: &str, ttl: Duration) -> String;

    /// Deterministic access URL for a stored object
    fn object_url(&self, object: &str) -> String;
}
