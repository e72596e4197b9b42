//! In-memory ring of recent daemon log events.
//!
//! [`ServerLogLayer`] sits next to the stderr and file layers in the tracing
//! subscriber and copies every event at INFO or above into a bounded
//! [`ServerLogBuffer`], which `GET /api/server-logs` reads back.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use protocol::messages::{ServerLogEntry, ServerLogLevel};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Entries kept before the oldest is dropped.
pub const SERVER_LOG_CAPACITY: usize = 500;

/// Entries returned when the caller names no limit.
pub const DEFAULT_SERVER_LOG_LIMIT: usize = 200;

/// Bounded buffer of captured events, oldest first.
#[derive(Debug)]
pub struct ServerLogBuffer {
    entries: Mutex<VecDeque<ServerLogEntry>>,
    capacity: usize,
}

impl Default for ServerLogBuffer {
    fn default() -> Self {
        Self::new(SERVER_LOG_CAPACITY)
    }
}

impl ServerLogBuffer {
    /// Create a buffer holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // A panic while holding the lock leaves a valid deque behind.
    fn lock(&self) -> MutexGuard<'_, VecDeque<ServerLogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry, evicting the oldest when full.
    pub fn push(&self, entry: ServerLogEntry) {
        let mut entries = self.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The newest `limit` entries, newest first, plus the number held.
    ///
    /// `limit` defaults to [`DEFAULT_SERVER_LOG_LIMIT`] and is clamped to
    /// `1..=capacity`.
    pub fn recent(&self, limit: Option<usize>) -> (Vec<ServerLogEntry>, usize) {
        let limit = limit
            .unwrap_or(DEFAULT_SERVER_LOG_LIMIT)
            .clamp(1, self.capacity);
        let entries = self.lock();
        let recent = entries.iter().rev().take(limit).cloned().collect();
        (recent, entries.len())
    }

    /// A subscriber layer feeding this buffer.
    pub fn layer(self: &Arc<Self>) -> ServerLogLayer {
        ServerLogLayer {
            buffer: Arc::clone(self),
        }
    }
}

/// Tracing layer that records events into a [`ServerLogBuffer`].
#[derive(Debug, Clone)]
pub struct ServerLogLayer {
    buffer: Arc<ServerLogBuffer>,
}

impl<S: Subscriber> Layer<S> for ServerLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        let level = if level == Level::ERROR {
            ServerLogLevel::Error
        } else if level == Level::WARN {
            ServerLogLevel::Warn
        } else if level == Level::INFO {
            ServerLogLevel::Info
        } else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.buffer.push(ServerLogEntry {
            ts: Utc::now(),
            level,
            msg: visitor.finish(),
        });
    }
}

/// Collects the message and renders other fields as `key=value`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            self.message + &self.fields
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
