// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only event log.
//!
//! Each movie owns two NDJSON streams: `events/inputs.log` and
//! `events/artefacts.log`. Records are appended exactly once, never
//! modified or reordered; the last record for a canonical id is the
//! authoritative one. Appends are serialized per file within the process.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rf_core::{ArtefactEvent, Event, InputEvent};
use rf_storage::{Storage, StorageContext, StorageError, StoragePath};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_stream::Stream;
use tracing::debug;

const INPUTS_LOG: &str = "inputs.log";
const ARTEFACTS_LOG: &str = "artefacts.log";

/// Errors surfaced by the event log.
#[derive(Debug, Error)]
pub enum EventLogError {
    /// A log line failed to parse; the log is the source of truth, so this
    /// is fatal for the movie.
    #[error("corrupt event record at `{path}` line {line}: {message}")]
    Corrupt {
        /// Path of the offending log.
        path: String,
        /// 1-based line number.
        line: usize,
        /// Parse failure description.
        message: String,
    },

    /// The underlying storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Counts of records per stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventLogStats {
    /// Number of input events.
    pub input_events: usize,
    /// Number of artefact events.
    pub artefact_events: usize,
}

/// Append-only input/artefact event streams for all movies under a
/// storage context.
#[derive(Clone)]
pub struct EventLog {
    ctx: StorageContext,
    // One writer per file; both locks are process-wide via Arc clones.
    input_lock: Arc<Mutex<()>>,
    artefact_lock: Arc<Mutex<()>>,
}

impl EventLog {
    /// Create a log over the given storage context.
    pub fn new(ctx: StorageContext) -> Self {
        Self {
            ctx,
            input_lock: Arc::new(Mutex::new(())),
            artefact_lock: Arc::new(Mutex::new(())),
        }
    }

    fn inputs_path(&self, movie_id: &str) -> StoragePath {
        self.ctx.resolve(movie_id, ["events", INPUTS_LOG])
    }

    fn artefacts_path(&self, movie_id: &str) -> StoragePath {
        self.ctx.resolve(movie_id, ["events", ARTEFACTS_LOG])
    }

    async fn append_line<T: serde::Serialize>(
        &self,
        path: &StoragePath,
        lock: &Mutex<()>,
        record: &T,
    ) -> Result<(), EventLogError> {
        let mut line = serde_json::to_string(record).map_err(|e| EventLogError::Corrupt {
            path: path.as_str().to_string(),
            line: 0,
            message: e.to_string(),
        })?;
        line.push('\n');
        let _guard = lock.lock().await;
        rf_storage::with_backoff("event_append", || {
            self.ctx.backend().append(path, line.as_bytes())
        })
        .await?;
        Ok(())
    }

    /// Append exactly one input event.
    pub async fn append_input(
        &self,
        movie_id: &str,
        event: &InputEvent,
    ) -> Result<(), EventLogError> {
        debug!(target: "rf.events", movie_id, input_id = %event.input_id, "append input event");
        self.append_line(&self.inputs_path(movie_id), &self.input_lock, event)
            .await
    }

    /// Append exactly one artefact event.
    pub async fn append_artefact(
        &self,
        movie_id: &str,
        event: &ArtefactEvent,
    ) -> Result<(), EventLogError> {
        debug!(
            target: "rf.events",
            movie_id,
            artefact_id = %event.artefact_id,
            status = ?event.status,
            "append artefact event"
        );
        self.append_line(&self.artefacts_path(movie_id), &self.artefact_lock, event)
            .await
    }

    async fn read_log<T: serde::de::DeserializeOwned>(
        &self,
        path: &StoragePath,
    ) -> Result<Vec<T>, EventLogError> {
        let text = match self.ctx.backend().read_to_string(path).await {
            Ok(text) => text,
            // A missing log is an empty stream (fresh movie).
            Err(StorageError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record =
                serde_json::from_str::<T>(line).map_err(|e| EventLogError::Corrupt {
                    path: path.as_str().to_string(),
                    line: idx + 1,
                    message: e.to_string(),
                })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Read all input events in insertion order.
    pub async fn read_inputs(&self, movie_id: &str) -> Result<Vec<InputEvent>, EventLogError> {
        self.read_log(&self.inputs_path(movie_id)).await
    }

    /// Read all artefact events in insertion order.
    pub async fn read_artefacts(
        &self,
        movie_id: &str,
    ) -> Result<Vec<ArtefactEvent>, EventLogError> {
        self.read_log(&self.artefacts_path(movie_id)).await
    }

    /// Stream input events in insertion order.
    pub async fn stream_inputs(
        &self,
        movie_id: &str,
    ) -> Result<impl Stream<Item = InputEvent>, EventLogError> {
        Ok(tokio_stream::iter(self.read_inputs(movie_id).await?))
    }

    /// Stream artefact events in insertion order.
    pub async fn stream_artefacts(
        &self,
        movie_id: &str,
    ) -> Result<impl Stream<Item = ArtefactEvent>, EventLogError> {
        Ok(tokio_stream::iter(self.read_artefacts(movie_id).await?))
    }

    /// Read both streams as tagged [`Event`]s, inputs first.
    ///
    /// Input and artefact ids never collide, so replay order between the
    /// two files does not affect materialization.
    pub async fn read_events(&self, movie_id: &str) -> Result<Vec<Event>, EventLogError> {
        let mut events: Vec<Event> = self
            .read_inputs(movie_id)
            .await?
            .into_iter()
            .map(Event::Input)
            .collect();
        events.extend(
            self.read_artefacts(movie_id)
                .await?
                .into_iter()
                .map(Event::Artefact),
        );
        Ok(events)
    }

    /// Record counts per stream.
    pub async fn stats(&self, movie_id: &str) -> Result<EventLogStats, EventLogError> {
        Ok(EventLogStats {
            input_events: self.read_inputs(movie_id).await?.len(),
            artefact_events: self.read_artefacts(movie_id).await?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rf_core::{ArtefactOutput, ArtefactStatus};
    use rf_storage::MemoryStorage;
    use tokio_stream::StreamExt;

    fn log() -> (Arc<MemoryStorage>, EventLog) {
        let backend = Arc::new(MemoryStorage::new());
        let ctx = StorageContext::new(backend.clone(), "movies");
        (backend, EventLog::new(ctx))
    }

    fn input_event(id: &str, hash: &str) -> InputEvent {
        InputEvent {
            input_id: id.into(),
            hash: hash.into(),
            canonical: format!("\"{hash}\""),
            value: None,
            value_blob_ref: None,
            revision: "rev-0001".into(),
            at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        }
    }

    fn artefact_event(id: &str) -> ArtefactEvent {
        ArtefactEvent {
            artefact_id: id.into(),
            produced_by: "Producer:P".into(),
            inputs_hash: "ih".into(),
            output: ArtefactOutput::from_value(serde_json::json!(1)),
            status: ArtefactStatus::Succeeded,
            diagnostics: None,
            revision: "rev-0001".into(),
            at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn appends_preserve_insertion_order() {
        let (_backend, log) = log();
        log.append_input("m1", &input_event("Input:A", "h1"))
            .await
            .unwrap();
        log.append_input("m1", &input_event("Input:B", "h2"))
            .await
            .unwrap();
        log.append_input("m1", &input_event("Input:A", "h3"))
            .await
            .unwrap();
        let events = log.read_inputs("m1").await.unwrap();
        let ids: Vec<&str> = events.iter().map(|e| e.input_id.as_str()).collect();
        assert_eq!(ids, ["Input:A", "Input:B", "Input:A"]);
        assert_eq!(events[2].hash, "h3");
    }

    #[tokio::test]
    async fn missing_log_reads_empty() {
        let (_backend, log) = log();
        assert!(log.read_inputs("fresh").await.unwrap().is_empty());
        assert!(log.read_artefacts("fresh").await.unwrap().is_empty());
        assert_eq!(log.stats("fresh").await.unwrap(), EventLogStats::default());
    }

    #[tokio::test]
    async fn streams_are_restartable() {
        let (_backend, log) = log();
        log.append_artefact("m1", &artefact_event("Artifact:Out"))
            .await
            .unwrap();
        for _ in 0..2 {
            let events: Vec<ArtefactEvent> =
                log.stream_artefacts("m1").await.unwrap().collect().await;
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].artefact_id, "Artifact:Out");
        }
    }

    #[tokio::test]
    async fn corrupt_line_is_reported_with_position() {
        let (backend, log) = log();
        log.append_input("m1", &input_event("Input:A", "h1"))
            .await
            .unwrap();
        backend
            .append(
                &StoragePath::from("movies/m1/events/inputs.log"),
                b"not-json\n",
            )
            .await
            .unwrap();
        let err = log.read_inputs("m1").await.unwrap_err();
        match err {
            EventLogError::Corrupt { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_events_merges_both_streams() {
        let (_backend, log) = log();
        log.append_input("m1", &input_event("Input:A", "h1"))
            .await
            .unwrap();
        log.append_artefact("m1", &artefact_event("Artifact:Out"))
            .await
            .unwrap();
        let events = log.read_events("m1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::Input(_)));
        assert!(matches!(events[1], Event::Artefact(_)));
        let stats = log.stats("m1").await.unwrap();
        assert_eq!(stats.input_events, 1);
        assert_eq!(stats.artefact_events, 1);
    }

    #[tokio::test]
    async fn concurrent_appends_serialize_per_file() {
        let (_backend, log) = log();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                log.append_input("m1", &input_event(&format!("Input:I{i}"), "h"))
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        // Every record lands on its own line and parses.
        let events = log.read_inputs("m1").await.unwrap();
        assert_eq!(events.len(), 16);
    }
}
