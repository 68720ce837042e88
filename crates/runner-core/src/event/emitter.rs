//! Per-run event stamping and delivery.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use super::sink::{EventSink, SinkError};
use super::{EventData, LogEventData, LogLevel, RunEvent};
use crate::types::RunId;

/// Stamps payloads with sequence numbers and timestamps and hands them to
/// the run's sink.
///
/// Owned by the single task that consumes parser output, so no locking is
/// needed. Sequence numbers start at 1 and advance on every `emit` call,
/// whether or not the sink accepted the event. A failing sink is reported
/// once (log line plus one best-effort log event) and otherwise ignored so
/// the run keeps draining the child's pipes.
pub struct RunEmitter {
    run_id: RunId,
    sink: Arc<dyn EventSink>,
    last_seq: u64,
    closed: bool,
    sink_failure: Option<SinkError>,
    report_pending: bool,
}

impl RunEmitter {
    pub fn new(run_id: RunId, sink: Arc<dyn EventSink>) -> Self {
        Self {
            run_id,
            sink,
            last_seq: 0,
            closed: false,
            sink_failure: None,
            report_pending: false,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Number of sequence numbers handed out so far.
    pub fn emitted(&self) -> u64 {
        self.last_seq
    }

    /// The first sink failure observed during this run, if any.
    pub fn sink_failure(&self) -> Option<&SinkError> {
        self.sink_failure.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Publish one payload. Returns the assigned sequence number, or `None`
    /// when the emitter is already closed.
    pub fn emit(&mut self, data: EventData) -> Option<u64> {
        if self.closed {
            debug!(run_id = %self.run_id, "dropping event emitted after close");
            return None;
        }
        let seq = self.send(data);
        if self.report_pending {
            self.report_pending = false;
            let message = self
                .sink_failure
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            warn!(
                run_id = %self.run_id,
                error = %message,
                "event sink rejected an event; continuing run"
            );
            let notice = LogEventData::new(LogLevel::Warn, format!("event sink error: {message}"));
            self.send(EventData::Log(notice));
        }
        Some(seq)
    }

    fn send(&mut self, data: EventData) -> u64 {
        self.last_seq += 1;
        let event = RunEvent {
            run_id: self.run_id,
            seq: self.last_seq,
            timestamp: Utc::now(),
            data,
        };
        if let Err(e) = self.sink.emit(event) {
            if self.sink_failure.is_none() {
                self.sink_failure = Some(e);
                self.report_pending = true;
            }
        }
        self.last_seq
    }

    /// Close the sink. Only the first call reaches the sink.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.sink.close() {
            warn!(run_id = %self.run_id, error = %e, "failed to close event sink");
        }
    }
}

impl Drop for RunEmitter {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RunEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEmitter")
            .field("run_id", &self.run_id)
            .field("last_seq", &self.last_seq)
            .field("closed", &self.closed)
            .field("sink_failure", &self.sink_failure)
            .finish()
    }
}
