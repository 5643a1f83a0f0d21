//! The extraction-and-relay pipeline.
//!
//! One [`ArchivePipeline`] run stream-parses a single archive, launches a
//! relay task per non-directory entry, and reports through the session's
//! event log after every relay settles. Entry bodies flow from the archive
//! stream into a bounded channel and out through an [`ObjectSink`], so no
//! member is ever held whole in memory.
//!
//! [`UploadCoordinator`] drives archives strictly sequentially and emits the
//! final `completed` (or fatal `error`) event for the run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};

use crate::session::{
    ArchiveResult, ArchiveStatus, CompletedPayload, EntryResult, EntryStatus, ErrorPayload, Event,
    ProgressPayload, RunSummary, Session, SessionRegistry,
};
use crate::storage::ObjectStore;
use crate::zip::ZipEntryStream;

/// Chunks buffered between the archive parser and one relay.
const RELAY_CHANNEL_DEPTH: usize = 16;

/// Content type assigned to relayed members.
const MEMBER_CONTENT_TYPE: &str = "application/octet-stream";

/// Settled outcome of one entry relay.
struct RelayOutcome {
    name: String,
    destination_url: String,
    /// Bytes written on success, error message on failure.
    result: Result<u64, String>,
}

/// Relay one entry's bytes from the chunk channel into a destination sink.
///
/// Resolves exactly once, and only after the sink has confirmed durable
/// completion - closing the channel alone is not success. An `Err` item in
/// the channel aborts the upload so a decode failure cannot be finalized as
/// a short object.
async fn relay_entry(
    store: Arc<dyn ObjectStore>,
    object: String,
    mut chunks: mpsc::Receiver<Result<Bytes, String>>,
) -> Result<u64, String> {
    let mut sink = store
        .open_write(&object, MEMBER_CONTENT_TYPE)
        .await
        .map_err(|e| e.to_string())?;

    let mut written = 0u64;
    while let Some(item) = chunks.recv().await {
        match item {
            Ok(chunk) => {
                written += chunk.len() as u64;
                if let Err(e) = sink.write_chunk(chunk).await {
                    sink.abort().await;
                    return Err(e.to_string());
                }
            }
            Err(message) => {
                sink.abort().await;
                return Err(message);
            }
        }
    }

    sink.finish().await.map_err(|e| e.to_string())?;
    Ok(written)
}

/// Processes one archive at a time: parse, demultiplex, relay, settle.
pub struct ArchivePipeline {
    store: Arc<dyn ObjectStore>,
    dest_prefix: String,
    max_in_flight: usize,
}

impl ArchivePipeline {
    pub fn new(store: Arc<dyn ObjectStore>, dest_prefix: &str, max_in_flight: usize) -> Self {
        Self {
            store,
            dest_prefix: dest_prefix.trim_matches('/').to_string(),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Destination object name for one member. Traversal components are
    /// dropped so an archive cannot write outside the prefix.
    fn destination(&self, entry_name: &str) -> String {
        let clean: Vec<&str> = entry_name
            .split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .collect();
        if clean.is_empty() {
            format!("{}/unnamed", self.dest_prefix)
        } else {
            format!("{}/{}", self.dest_prefix, clean.join("/"))
        }
    }

    /// Process one archive to completion.
    ///
    /// Per-entry failures are recorded in the result and do not abort the
    /// archive; an `Err` return means the source stream itself could not be
    /// read or parsed, which is fatal for the whole run.
    pub async fn process(&self, session: &Session, archive_id: &str) -> Result<ArchiveResult> {
        let source = self
            .store
            .open_read(archive_id)
            .await
            .with_context(|| format!("failed to open archive {archive_id}"))?;
        let mut entries = ZipEntryStream::new(source);

        let mut result = ArchiveResult::default();
        // Totals are unknown until the stream is demultiplexed; announce the
        // archive with zeroes so observers see it start
        session.append(Event::Progress(ProgressPayload {
            archive: archive_id.to_string(),
            progress: 0,
            uploaded: 0,
            failed: 0,
            total_files: 0,
        }));

        let mut relays: JoinSet<RelayOutcome> = JoinSet::new();
        let limiter = Arc::new(Semaphore::new(self.max_in_flight));

        loop {
            // Settle relays that finished while we were parsing, so progress
            // events flow during demultiplexing rather than only at the end
            while let Some(joined) = relays.try_join_next() {
                Self::settle(session, archive_id, &mut result, joined);
            }

            let Some(mut entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("failed to parse archive {archive_id}"))?
            else {
                break;
            };

            if entry.is_directory() {
                entry.drain().await?;
                continue;
            }

            // Counted as soon as it is discovered, before the relay settles
            result.total_entries += 1;
            let name = entry.name().to_string();
            let object = self.destination(&name);
            let destination_url = self.store.object_url(&object);

            let permit = limiter
                .clone()
                .acquire_owned()
                .await
                .context("relay limiter closed")?;
            let (tx, rx) = mpsc::channel(RELAY_CHANNEL_DEPTH);
            let store = Arc::clone(&self.store);
            let outcome_name = name.clone();
            relays.spawn(async move {
                let _permit = permit;
                let result = relay_entry(store, object, rx).await;
                RelayOutcome {
                    name: outcome_name,
                    destination_url,
                    result,
                }
            });

            // Feed the body; the bounded channel applies the sink's
            // backpressure to the parse
            let mut feed_error: Option<String> = None;
            loop {
                match entry.read_chunk().await {
                    Ok(Some(chunk)) => {
                        // A closed channel means the relay already failed;
                        // keep reading so the stream stays aligned
                        let _ = tx.send(Ok(chunk)).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        feed_error = Some(e.to_string());
                        break;
                    }
                }
            }

            if let Some(message) = feed_error {
                let _ = tx.send(Err(message.clone())).await;
                if let Err(skip) = entry.skip_remaining().await {
                    drop(tx);
                    bail!("archive {archive_id} unreadable after entry error ({message}): {skip}");
                }
                tracing::warn!(
                    archive = archive_id,
                    entry = %name,
                    error = %message,
                    "entry decode failed; skipped"
                );
            }
            drop(tx);
        }

        // Draining: every entry is discovered; completion now gates on the
        // outstanding relays, not on the stream
        while let Some(joined) = relays.join_next().await {
            Self::settle(session, archive_id, &mut result, joined);
        }

        tracing::info!(
            archive = archive_id,
            total = result.total_entries,
            uploaded = result.uploaded_count,
            failed = result.failed_count,
            "archive finished"
        );
        Ok(result)
    }

    /// Fold one settled relay into the aggregates and emit a progress event.
    fn settle(
        session: &Session,
        archive_id: &str,
        result: &mut ArchiveResult,
        joined: Result<RelayOutcome, JoinError>,
    ) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => RelayOutcome {
                name: "<unknown>".to_string(),
                destination_url: String::new(),
                result: Err(format!("relay task failed: {e}")),
            },
        };

        match outcome.result {
            Ok(bytes_written) => {
                result.uploaded_count += 1;
                tracing::debug!(
                    archive = archive_id,
                    entry = %outcome.name,
                    bytes = bytes_written,
                    "member uploaded"
                );
                result.entries.push(EntryResult {
                    name: outcome.name,
                    destination_url: outcome.destination_url,
                    status: EntryStatus::Success,
                    error: None,
                });
            }
            Err(message) => {
                result.failed_count += 1;
                tracing::warn!(
                    archive = archive_id,
                    entry = %outcome.name,
                    error = %message,
                    "member relay failed"
                );
                result.entries.push(EntryResult {
                    name: outcome.name,
                    destination_url: String::new(),
                    status: EntryStatus::Failed,
                    error: Some(message),
                });
            }
        }

        // Denominator is the count discovered so far; the final total is
        // unknown until the stream ends
        let progress =
            (result.uploaded_count as f64 / result.total_entries as f64 * 100.0).round() as u8;
        session.append(Event::Progress(ProgressPayload {
            archive: archive_id.to_string(),
            progress,
            uploaded: result.uploaded_count,
            failed: result.failed_count,
            total_files: result.total_entries,
        }));
    }
}

/// Drives the archives of one processing request sequentially.
pub struct UploadCoordinator {
    registry: Arc<SessionRegistry>,
    pipeline: ArchivePipeline,
    session_retention: Duration,
}

impl UploadCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        pipeline: ArchivePipeline,
        session_retention: Duration,
    ) -> Self {
        Self {
            registry,
            pipeline,
            session_retention,
        }
    }

    /// Process `archives` one at a time, reporting through the session's
    /// event log. A fatal archive failure emits `error` and abandons the
    /// remaining archives; otherwise a single `completed` event carries the
    /// per-archive results and the run summary.
    pub async fn run(&self, session_id: &str, archives: Vec<String>) {
        let session = self.registry.ensure(session_id);
        let started = Instant::now();
        let mut results = BTreeMap::new();
        let mut summary = RunSummary::default();

        for archive_id in archives {
            match self.pipeline.process(&session, &archive_id).await {
                Ok(result) => {
                    summary.archive_count += 1;
                    summary.files_processed += result.uploaded_count;
                    summary.files_failed += result.failed_count;
                    summary.per_archive_status.insert(
                        archive_id.clone(),
                        ArchiveStatus {
                            total: result.total_entries,
                            success: result.uploaded_count,
                            failed: result.failed_count,
                        },
                    );
                    results.insert(archive_id, result);
                }
                Err(e) => {
                    tracing::error!(archive = %archive_id, error = %e, "run aborted");
                    session.append(Event::Error(ErrorPayload {
                        message: e.to_string(),
                    }));
                    self.registry
                        .expire_after(session_id.to_string(), self.session_retention);
                    return;
                }
            }
        }

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        session.append(Event::Completed(CompletedPayload { results, summary }));
        self.registry
            .expire_after(session_id.to_string(), self.session_retention);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use crate::zip::testutil::ZipBuilder;

    fn seeded_store() -> Arc<MemoryObjectStore> {
        Arc::new(MemoryObjectStore::new("test"))
    }

    fn pipeline(store: &Arc<MemoryObjectStore>) -> ArchivePipeline {
        ArchivePipeline::new(store.clone(), "unzipped", 8)
    }

    fn session() -> Arc<Session> {
        SessionRegistry::new().ensure("test-session")
    }

    fn progress_events(session: &Session) -> Vec<ProgressPayload> {
        session
            .history()
            .into_iter()
            .filter_map(|event| match event {
                Event::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn relays_all_members_of_an_archive() {
        let store = seeded_store();
        store.insert(
            "incoming/a.zip",
            ZipBuilder::new()
                .stored("x.png", b"x bytes")
                .stored("y.png", b"y bytes")
                .finish(),
        );
        let session = session();

        let result = pipeline(&store)
            .process(&session, "incoming/a.zip")
            .await
            .unwrap();

        assert_eq!(result.total_entries, 2);
        assert_eq!(result.uploaded_count, 2);
        assert_eq!(result.failed_count, 0);
        assert!(result
            .entries
            .iter()
            .all(|e| e.status == EntryStatus::Success));

        assert_eq!(store.get("unzipped/x.png").unwrap().as_ref(), b"x bytes");
        assert_eq!(store.get("unzipped/y.png").unwrap().as_ref(), b"y bytes");

        let events = progress_events(&session);
        let first = events.first().unwrap();
        assert_eq!((first.progress, first.uploaded, first.total_files), (0, 0, 0));
        let last = events.last().unwrap();
        assert_eq!((last.progress, last.uploaded, last.total_files), (100, 2, 2));
        // Settlement invariant holds after every event
        for event in &events[1..] {
            assert!(event.uploaded + event.failed <= event.total_files);
        }
    }

    #[tokio::test]
    async fn one_failing_member_does_not_abort_the_archive() {
        let store = seeded_store();
        store.insert(
            "incoming/b.zip",
            ZipBuilder::new()
                .stored("p.png", b"p bytes")
                .stored("q.png", b"q bytes")
                .finish(),
        );
        store.fail_writes("unzipped/q.png", "disk full");
        let session = session();

        let result = pipeline(&store)
            .process(&session, "incoming/b.zip")
            .await
            .unwrap();

        assert_eq!(result.total_entries, 2);
        assert_eq!(result.uploaded_count, 1);
        assert_eq!(result.failed_count, 1);

        let failed = result
            .entries
            .iter()
            .find(|e| e.name == "q.png")
            .unwrap();
        assert_eq!(failed.status, EntryStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("disk full"));
        assert_eq!(failed.destination_url, "");

        let ok = result.entries.iter().find(|e| e.name == "p.png").unwrap();
        assert_eq!(ok.status, EntryStatus::Success);
        assert!(store.get("unzipped/p.png").is_some());
        assert!(store.get("unzipped/q.png").is_none());
    }

    #[tokio::test]
    async fn directories_are_skipped_without_counting() {
        let store = seeded_store();
        store.insert(
            "incoming/dirs.zip",
            ZipBuilder::new()
                .directory("img/")
                .stored("img/z.png", b"z")
                .directory("empty/")
                .finish(),
        );
        let session = session();

        let result = pipeline(&store)
            .process(&session, "incoming/dirs.zip")
            .await
            .unwrap();

        assert_eq!(result.total_entries, 1);
        assert_eq!(result.uploaded_count, 1);
        assert!(store.get("unzipped/img/z.png").is_some());
    }

    #[tokio::test]
    async fn deflated_members_roundtrip() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i / 7) as u8).collect();
        let store = seeded_store();
        store.insert(
            "incoming/c.zip",
            ZipBuilder::new().deflated("blob.bin", &payload).finish(),
        );
        let session = session();

        let result = pipeline(&store)
            .process(&session, "incoming/c.zip")
            .await
            .unwrap();

        assert_eq!(result.uploaded_count, 1);
        assert_eq!(store.get("unzipped/blob.bin").unwrap(), payload);
    }

    #[tokio::test]
    async fn undecodable_member_is_recorded_and_siblings_survive() {
        let store = seeded_store();
        store.insert(
            "incoming/mixed.zip",
            ZipBuilder::new()
                .unsupported_method("legacy.lzma", b"cannot inflate this")
                .stored("fine.txt", b"fine")
                .finish(),
        );
        let session = session();

        let result = pipeline(&store)
            .process(&session, "incoming/mixed.zip")
            .await
            .unwrap();

        assert_eq!(result.total_entries, 2);
        assert_eq!(result.uploaded_count, 1);
        assert_eq!(result.failed_count, 1);
        let failed = result
            .entries
            .iter()
            .find(|e| e.name == "legacy.lzma")
            .unwrap();
        assert!(failed
            .error
            .as_deref()
            .unwrap()
            .contains("Unsupported compression method"));
        assert!(store.get("unzipped/fine.txt").is_some());
        assert!(store.get("unzipped/legacy.lzma").is_none());
    }

    #[tokio::test]
    async fn traversal_names_stay_under_the_prefix() {
        let store = seeded_store();
        store.insert(
            "incoming/evil.zip",
            ZipBuilder::new()
                .stored("../../etc/passwd", b"nope")
                .finish(),
        );
        let session = session();

        pipeline(&store)
            .process(&session, "incoming/evil.zip")
            .await
            .unwrap();

        assert!(store.get("unzipped/etc/passwd").is_some());
    }

    #[tokio::test]
    async fn missing_archive_is_fatal() {
        let store = seeded_store();
        let session = session();

        let err = pipeline(&store)
            .process(&session, "incoming/ghost.zip")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost.zip"));
    }

    #[tokio::test]
    async fn coordinator_processes_archives_sequentially() {
        let store = seeded_store();
        store.insert(
            "first.zip",
            ZipBuilder::new().stored("a.txt", b"a").finish(),
        );
        store.insert(
            "second.zip",
            ZipBuilder::new()
                .stored("b.txt", b"b")
                .stored("c.txt", b"c")
                .finish(),
        );

        let registry = Arc::new(SessionRegistry::new());
        let coordinator = UploadCoordinator::new(
            Arc::clone(&registry),
            ArchivePipeline::new(store.clone(), "unzipped", 8),
            Duration::from_secs(600),
        );
        coordinator
            .run("run-1", vec!["first.zip".into(), "second.zip".into()])
            .await;

        let session = registry.get("run-1").unwrap();
        let history = session.history();

        // No event for the second archive precedes the last event of the first
        let archives: Vec<String> = history
            .iter()
            .filter_map(|event| match event {
                Event::Progress(p) => Some(p.archive.clone()),
                _ => None,
            })
            .collect();
        let first_of_second = archives.iter().position(|a| a == "second.zip").unwrap();
        assert!(archives[..first_of_second]
            .iter()
            .all(|a| a == "first.zip"));

        let Some(Event::Completed(completed)) = history.last() else {
            panic!("expected completed event last");
        };
        assert_eq!(completed.summary.archive_count, 2);
        assert_eq!(completed.summary.files_processed, 3);
        assert_eq!(completed.summary.files_failed, 0);
        assert_eq!(completed.results.len(), 2);
        assert_eq!(
            completed.summary.per_archive_status["second.zip"].total,
            2
        );
    }

    #[tokio::test]
    async fn fatal_archive_failure_stops_the_run() {
        let store = seeded_store();
        store.insert("bad.zip", b"not a zip at all but long enough".to_vec());
        store.insert(
            "never.zip",
            ZipBuilder::new().stored("x.txt", b"x").finish(),
        );

        let registry = Arc::new(SessionRegistry::new());
        let coordinator = UploadCoordinator::new(
            Arc::clone(&registry),
            ArchivePipeline::new(store.clone(), "unzipped", 8),
            Duration::from_secs(600),
        );
        coordinator
            .run("run-2", vec!["bad.zip".into(), "never.zip".into()])
            .await;

        let session = registry.get("run-2").unwrap();
        let history = session.history();
        let Some(Event::Error(error)) = history.last() else {
            panic!("expected error event last");
        };
        assert!(error.message.contains("bad.zip"));

        // The second archive was never attempted
        assert!(store.get("unzipped/x.txt").is_none());
        assert!(!history.iter().any(|event| matches!(
            event,
            Event::Progress(p) if p.archive == "never.zip"
        )));
    }
}
