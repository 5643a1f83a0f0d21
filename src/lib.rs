//! # ziprelay
//!
//! A streaming ZIP extraction relay. Archives staged in object storage are
//! stream-parsed, their member files piped through an in-memory
//! decompression boundary back into object storage, and per-archive
//! progress is broadcast to an observing client over a session-keyed
//! server-sent-event stream that replays history after a reconnect.
//!
//! No member file is ever buffered whole: entry bodies flow from the source
//! stream through bounded channels into destination sinks, and a relay only
//! settles once its sink confirms the object is durably written.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ziprelay::{ArchivePipeline, MemoryObjectStore, SessionRegistry, UploadCoordinator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryObjectStore::new("demo"));
//!     let registry = Arc::new(SessionRegistry::new());
//!
//!     let coordinator = UploadCoordinator::new(
//!         Arc::clone(&registry),
//!         ArchivePipeline::new(store, "unzipped", 16),
//!         Duration::from_secs(600),
//!     );
//!     coordinator.run("session-1", vec!["incoming/a.zip".into()]).await;
//! }
//! ```

pub mod cli;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod storage;
pub mod zip;

pub use cli::Cli;
pub use pipeline::{ArchivePipeline, UploadCoordinator};
pub use server::{router, AppState};
pub use session::{Event, Session, SessionRegistry};
pub use storage::{HttpObjectStore, MemoryObjectStore, ObjectSink, ObjectStore};
pub use zip::{ZipEntry, ZipEntryStream};
