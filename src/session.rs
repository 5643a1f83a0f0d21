//! Sessions, event logs, and the typed events they carry.
//!
//! A session correlates one processing run with an observer's event stream.
//! Each session owns an append-only event log and at most one live sink.
//! Attaching a sink replays the full history and then switches to live
//! delivery in one step, so a reconnecting observer sees every event exactly
//! once, in append order, with no gap at the replay/live boundary.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Progress snapshot for one archive, emitted after every relay settlement.
///
/// `total_files` counts entries discovered so far, not the final total:
/// archives are stream-parsed, so the denominator grows while the archive
/// is still being read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub archive: String,
    pub progress: u8,
    pub uploaded: usize,
    pub failed: usize,
    pub total_files: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Success,
    Failed,
}

/// Outcome of one relayed archive member.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryResult {
    pub name: String,
    /// Access URL of the uploaded member; empty when the relay failed.
    pub destination_url: String,
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated result for one archive within a run.
///
/// Entries appear in settlement order, which is not necessarily the order
/// they were declared in the archive.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveResult {
    pub total_entries: usize,
    pub uploaded_count: usize,
    pub failed_count: usize,
    pub entries: Vec<EntryResult>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveStatus {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

/// Cross-archive totals for one processing run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub archive_count: usize,
    pub files_processed: usize,
    pub files_failed: usize,
    pub elapsed_ms: u64,
    pub per_archive_status: BTreeMap<String, ArchiveStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPayload {
    pub results: BTreeMap<String, ArchiveResult>,
    pub summary: RunSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
}

/// One event in a session's log.
#[derive(Debug, Clone)]
pub enum Event {
    Progress(ProgressPayload),
    Completed(CompletedPayload),
    Error(ErrorPayload),
}

impl Event {
    /// Event name on the wire (`event:` line of the SSE frame).
    pub fn name(&self) -> &'static str {
        match self {
            Event::Progress(_) => "progress",
            Event::Completed(_) => "completed",
            Event::Error(_) => "error",
        }
    }

    /// JSON payload for the `data:` line of the SSE frame.
    pub fn to_json(&self) -> String {
        let serialized = match self {
            Event::Progress(p) => serde_json::to_string(p),
            Event::Completed(p) => serde_json::to_string(p),
            Event::Error(p) => serde_json::to_string(p),
        };
        serialized.unwrap_or_else(|_| "{}".to_string())
    }
}

struct SessionInner {
    events: Vec<Event>,
    sink: Option<mpsc::UnboundedSender<Event>>,
}

/// One observable processing context.
pub struct Session {
    id: String,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            inner: Mutex::new(SessionInner {
                events: Vec::new(),
                sink: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append an event to the log and deliver it to the live sink, if any.
    ///
    /// A sink whose receiver has gone away (client disconnect) is detached
    /// here; the history is kept for a later reattachment.
    pub fn append(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.events.push(event.clone());
        if let Some(sink) = &inner.sink {
            if sink.send(event).is_err() {
                inner.sink = None;
            }
        }
    }

    /// Attach a live sink, replacing any previous one.
    ///
    /// The stored history is replayed into the channel before it becomes
    /// the live sink, all under the session lock, so an event appended
    /// concurrently is delivered exactly once - either as part of the
    /// replay or live, never both.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for event in &inner.events {
            // Send to a receiver we still hold cannot fail
            let _ = tx.send(event.clone());
        }
        inner.sink = Some(tx);
        rx
    }

    /// Drop the live sink without discarding history.
    pub fn detach(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).sink = None;
    }

    pub fn has_live_sink(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sink
            .as_ref()
            .is_some_and(|sink| !sink.is_closed())
    }

    /// Snapshot of the event log, in append order.
    pub fn history(&self) -> Vec<Event> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .clone()
    }
}

/// Process-wide session map owning session lifecycle.
///
/// Only registry operations mutate the map; pipeline components hold
/// `Arc<Session>` handles and never touch the registry directly.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh session under a new unique id.
    pub fn create(&self) -> Arc<Session> {
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone()));
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&session));
        session
    }

    /// Lookup; absence is a normal outcome for unknown or expired ids.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Get the session for `id`, creating it on first use.
    pub fn ensure(&self, id: &str) -> Arc<Session> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Session::new(id.to_string())))
            .clone()
    }

    fn remove(&self, id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Schedule removal of a session after `retention`.
    ///
    /// Expiry is advisory cleanup, not cancellation: while a live sink is
    /// attached the session is left alone and rechecked a period later.
    pub fn expire_after(self: &Arc<Self>, id: String, retention: Duration) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(retention).await;
                let Some(session) = registry.get(&id) else {
                    break;
                };
                if session.has_live_sink() {
                    continue;
                }
                registry.remove(&id);
                tracing::debug!(session = %id, "session expired");
                break;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(archive: &str, uploaded: usize, total: usize) -> Event {
        Event::Progress(ProgressPayload {
            archive: archive.to_string(),
            progress: 0,
            uploaded,
            failed: 0,
            total_files: total,
        })
    }

    fn names(events: &[Event]) -> Vec<&'static str> {
        events.iter().map(Event::name).collect()
    }

    #[tokio::test]
    async fn attach_replays_history_in_order() {
        let session = Session::new("s".into());
        session.append(progress("a.zip", 0, 0));
        session.append(progress("a.zip", 1, 2));
        session.append(Event::Error(ErrorPayload {
            message: "boom".into(),
        }));

        let mut rx = session.attach();
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(names(&seen), ["progress", "progress", "error"]);
    }

    #[tokio::test]
    async fn replay_then_live_has_no_gap_or_duplicate() {
        let session = Session::new("s".into());
        session.append(progress("a.zip", 0, 0));

        let mut rx = session.attach();
        session.append(progress("a.zip", 1, 1));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let (Event::Progress(first), Event::Progress(second)) = (first, second) else {
            panic!("expected progress events");
        };
        assert_eq!(first.uploaded, 0);
        assert_eq!(second.uploaded, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn detach_keeps_history_for_reattachment() {
        let session = Session::new("s".into());
        session.append(progress("a.zip", 1, 1));
        let _rx = session.attach();
        session.detach();
        assert!(!session.has_live_sink());

        session.append(progress("a.zip", 2, 2));

        let mut rx = session.attach();
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn dropped_receiver_detaches_on_next_append() {
        let session = Session::new("s".into());
        let rx = session.attach();
        drop(rx);

        session.append(progress("a.zip", 1, 1));
        assert!(!session.has_live_sink());
        assert_eq!(session.history().len(), 1);
    }

    #[tokio::test]
    async fn registry_create_and_get() {
        let registry = SessionRegistry::new();
        let session = registry.create();
        assert!(registry.get(session.id()).is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let registry = SessionRegistry::new();
        let a = registry.ensure("abc");
        a.append(progress("a.zip", 0, 0));
        let b = registry.ensure("abc");
        assert_eq!(b.history().len(), 1);
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_removes_idle_session() {
        let registry = Arc::new(SessionRegistry::new());
        registry.ensure("s1");
        registry.expire_after("s1".into(), Duration::from_secs(600));

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert!(registry.get("s1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_spares_sessions_with_live_sinks() {
        let registry = Arc::new(SessionRegistry::new());
        let session = registry.ensure("s1");
        let rx = session.attach();
        registry.expire_after("s1".into(), Duration::from_secs(600));

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert!(registry.get("s1").is_some());

        // Once the observer goes away, the next check removes it
        drop(rx);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(registry.get("s1").is_none());
    }
}
