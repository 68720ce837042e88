//! Event sinks: where run events go.
//!
//! A sink is shared by reference between the adapter (writer) and the
//! orchestrator (reader). `emit` must never block the adapter: a sink that
//! cannot accept an event right now fails fast with [`SinkError::Full`].

use std::io::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::RunEvent;

/// Errors returned by [`EventSink`] implementations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("sink buffer is full")]
    Full,

    #[error("sink is closed")]
    Closed,

    #[error("sink I/O error: {0}")]
    Io(String),
}

/// Receiver of [`RunEvent`]s during a run.
///
/// Implementations are responsible for their own concurrency. `close` is
/// idempotent; events emitted after it are dropped.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RunEvent) -> Result<(), SinkError>;

    fn close(&self) -> Result<(), SinkError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn EventSink) {}
};

// ---------------------------------------------------------------------------
// ChannelSink
// ---------------------------------------------------------------------------

/// Bounded channel sink. Closing drops the sender so the consumer side
/// observes end-of-stream.
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::Sender<RunEvent>>>,
}

impl ChannelSink {
    /// Create a sink with the given buffer capacity and its receiving half.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RunEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Like [`ChannelSink::new`] but hands back a `Stream` of events.
    pub fn with_stream(capacity: usize) -> (Self, ReceiverStream<RunEvent>) {
        let (sink, rx) = Self::new(capacity);
        (sink, ReceiverStream::new(rx))
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: RunEvent) -> Result<(), SinkError> {
        let guard = self.tx.lock().map_err(|_| SinkError::Closed)?;
        let Some(tx) = guard.as_ref() else {
            return Err(SinkError::Closed);
        };
        tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    fn close(&self) -> Result<(), SinkError> {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = self.tx.lock().map(|g| g.is_some()).unwrap_or(false);
        f.debug_struct("ChannelSink").field("open", &open).finish()
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Collects every event in memory. Handy for tests and short runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<RunEvent>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far.
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How many times `close` was invoked.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: RunEvent) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        let mut events = self.events.lock().map_err(|_| SinkError::Closed)?;
        events.push(event);
        Ok(())
    }

    fn close(&self) -> Result<(), SinkError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonLinesSink
// ---------------------------------------------------------------------------

/// Writes each event as one wire-format JSON line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
    closed: AtomicBool,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    /// Consume the sink and return the underlying writer.
    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&self, event: RunEvent) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        let line = serde_json::to_string(&event).map_err(|e| SinkError::Io(e.to_string()))?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| SinkError::Io("writer lock poisoned".to_string()))?;
        writeln!(writer, "{line}").map_err(|e| SinkError::Io(e.to_string()))?;
        writer.flush().map_err(|e| SinkError::Io(e.to_string()))
    }

    fn close(&self) -> Result<(), SinkError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| SinkError::Io("writer lock poisoned".to_string()))?;
        writer.flush().map_err(|e| SinkError::Io(e.to_string()))
    }
}
