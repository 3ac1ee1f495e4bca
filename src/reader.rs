//! Reader contract consumed by the coordinator.
//!
//! A reader performs the physical read of one source (a device attribute, a
//! command with arguments, a service endpoint). The coordinator never talks to
//! hardware itself: it creates readers through a [`ReaderFactory`], sends them
//! [`ReaderCommand`]s and receives their results through an [`UpdateSender`].
//!
//! # Delivery
//!
//! Readers may do their I/O on any thread or task, but results must go through
//! the `UpdateSender` they were created with. The sender pushes onto the
//! coordinator's own queue, so all cycle state is mutated on the coordinator's
//! execution context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// One result delivered by a reader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadResult {
    /// Source name as echoed by the reader
    pub source: String,
    /// Value read from the source
    pub value: serde_json::Value,
    /// Time the value was read
    pub timestamp: DateTime<Utc>,
    /// Error message when the read failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReadResult {
    /// Successful read of `value` from `source`, timestamped now.
    pub fn new(source: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            source: source.into(),
            value: value.into(),
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// Failed read; the value is null.
    pub fn failed(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            value: serde_json::Value::Null,
            timestamp: Utc::now(),
            error: Some(message.into()),
        }
    }

    /// Whether the reader reported an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// How a reader refreshes its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// The reader polls its source at a period.
    Polled,
    /// The reader only reads when told to.
    Manual,
}

/// Commands the coordinator sends to readers.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderCommand {
    /// Perform one read now.
    Read,
    /// Change the reader's own refresh period, in milliseconds.
    SetPeriod(u64),
    /// Switch between polled and manual refresh.
    SetRefreshMode(RefreshMode),
    /// Arbitrary payload, e.g. new arguments for a parameterized source.
    Payload(serde_json::Value),
}

/// Typed reader options applied at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// No automatic refresh at all
    pub manual: bool,
    /// Reader refresh period, when it polls
    pub period_ms: Option<u64>,
    /// Polled or manual refresh
    pub refresh_mode: RefreshMode,
    /// Shared execution context for sequential modes
    pub thread_token: Option<String>,
}

impl ReaderConfig {
    /// Independent reader refreshing at its own period.
    pub fn concurrent(period_ms: i64) -> Self {
        Self {
            manual: false,
            period_ms: positive_period(period_ms),
            refresh_mode: RefreshMode::Polled,
            thread_token: None,
        }
    }

    /// Reader polled at the coordinator's period on a shared context.
    pub fn sequential(period_ms: i64, thread_token: impl Into<String>) -> Self {
        Self {
            manual: false,
            period_ms: positive_period(period_ms),
            refresh_mode: RefreshMode::Polled,
            thread_token: Some(thread_token.into()),
        }
    }

    /// Reader that only reads on command, on a shared context.
    pub fn sequential_manual(thread_token: impl Into<String>) -> Self {
        Self {
            manual: true,
            period_ms: None,
            refresh_mode: RefreshMode::Manual,
            thread_token: Some(thread_token.into()),
        }
    }
}

fn positive_period(period_ms: i64) -> Option<u64> {
    u64::try_from(period_ms).ok().filter(|p| *p > 0)
}

/// Identity of one created reader, unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReaderId(u64);

impl ReaderId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ReaderId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reader#{}", self.0)
    }
}

/// A result tagged with the reader that produced it.
#[derive(Debug, Clone)]
pub struct ReaderUpdate {
    /// Producing reader
    pub reader: ReaderId,
    /// The result
    pub result: ReadResult,
}

/// Delivery channel handed to each reader at creation.
#[derive(Debug, Clone)]
pub struct UpdateSender {
    reader: ReaderId,
    tx: mpsc::UnboundedSender<ReaderUpdate>,
}

impl UpdateSender {
    pub(crate) fn new(reader: ReaderId, tx: mpsc::UnboundedSender<ReaderUpdate>) -> Self {
        Self { reader, tx }
    }

    /// Id of the reader this sender belongs to.
    pub fn reader_id(&self) -> ReaderId {
        self.reader
    }

    /// Queue a result for the coordinator.
    ///
    /// Returns `false` once the coordinator is gone.
    pub fn deliver(&self, result: ReadResult) -> bool {
        self.tx
            .send(ReaderUpdate {
                reader: self.reader,
                result,
            })
            .is_ok()
    }
}

/// One reader bound to one source.
pub trait ReaderHandle: Send {
    /// Point the reader at `name`.
    fn set_source(&mut self, name: &str);

    /// Canonical name the reader resolved its source to.
    ///
    /// May differ from the requested name (normalized, aliased); the
    /// coordinator uses this form for every lookup.
    fn resolved_name(&self) -> String;

    /// Send a command. Must not block.
    fn send(&self, command: ReaderCommand);
}

/// Creates and disposes readers for one connection context.
pub trait ReaderFactory: Send + Sync {
    /// Create a reader for `name`, applying `config`.
    fn create_reader(
        &self,
        name: &str,
        config: &ReaderConfig,
        updates: UpdateSender,
    ) -> anyhow::Result<Box<dyn ReaderHandle>>;

    /// Release one reader.
    fn dispose_reader(&self, reader: Box<dyn ReaderHandle>);

    /// Release many readers at once.
    fn dispose_all(&self, readers: Vec<Box<dyn ReaderHandle>>) {
        for reader in readers {
            self.dispose_reader(reader);
        }
    }
}
