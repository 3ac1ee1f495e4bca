//! Mock Reader Implementations
//!
//! Simulated readers for tests and demos without any control system behind
//! them. All asynchronous behavior uses tokio (`tokio::time::sleep`, never
//! `std::thread::sleep`).
//!
//! # Behavior
//!
//! - Every command sent to a reader is recorded, in order, with the canonical
//!   name of the reader it went to.
//! - Names can be aliased to a different canonical name, the way a real
//!   reader resolves a short device name.
//! - Chosen names fail at creation.
//! - Built with [`MockReaderFactory::responding`], a `Read` is answered after
//!   a latency (per source if configured). Values count up from 1 per reader
//!   unless a value function is given.
//! - Built with [`MockReaderFactory::with_polling`] as well, readers configured
//!   with [`RefreshMode::Polled`] and a period push values on their own.
//!
//! # Example
//!
//! ```rust,ignore
//! let factory = MockReaderFactory::new()
//!     .responding(Duration::from_millis(5))
//!     .with_latency("slow", Duration::from_millis(50));
//! ```

use crate::reader::{
    ReadResult, ReaderCommand, ReaderConfig, ReaderFactory, ReaderHandle, RefreshMode,
    UpdateSender,
};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

type ValueFn = dyn Fn(&str, u64) -> serde_json::Value + Send + Sync;

#[derive(Clone, Default)]
struct MockSettings {
    aliases: HashMap<String, String>,
    failing: HashSet<String>,
    latency: Option<Duration>,
    latencies: HashMap<String, Duration>,
    polling: bool,
    value_fn: Option<Arc<ValueFn>>,
}

impl MockSettings {
    fn resolve(&self, name: &str) -> String {
        self.aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    fn latency_for(&self, name: &str) -> Option<Duration> {
        self.latency
            .map(|default| self.latencies.get(name).copied().unwrap_or(default))
    }

    fn value(&self, name: &str, count: u64) -> serde_json::Value {
        match &self.value_fn {
            Some(f) => f(name, count),
            None => serde_json::Value::from(count),
        }
    }
}

#[derive(Default)]
struct MockLog {
    commands: Vec<(String, ReaderCommand)>,
    created: Vec<(String, ReaderConfig)>,
    disposed: Vec<String>,
    senders: HashMap<String, UpdateSender>,
}

// =============================================================================
// MockReaderFactory
// =============================================================================

/// Factory producing [`MockReader`]s and recording everything they receive.
#[derive(Clone, Default)]
pub struct MockReaderFactory {
    settings: Arc<MockSettings>,
    log: Arc<Mutex<MockLog>>,
}

impl MockReaderFactory {
    /// Recording-only factory: readers never answer on their own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `name` to `canonical`.
    pub fn with_alias(mut self, name: impl Into<String>, canonical: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.settings)
            .aliases
            .insert(name.into(), canonical.into());
        self
    }

    /// Fail reader creation for `name`.
    pub fn failing_on(mut self, name: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.settings).failing.insert(name.into());
        self
    }

    /// Answer every `Read` after `latency`.
    pub fn responding(mut self, latency: Duration) -> Self {
        Arc::make_mut(&mut self.settings).latency = Some(latency);
        self
    }

    /// Override the answer latency for one canonical name.
    pub fn with_latency(mut self, name: impl Into<String>, latency: Duration) -> Self {
        Arc::make_mut(&mut self.settings)
            .latencies
            .insert(name.into(), latency);
        self
    }

    /// Let polled readers with a period push values on their own.
    pub fn with_polling(mut self) -> Self {
        Arc::make_mut(&mut self.settings).polling = true;
        self
    }

    /// Compute values from the canonical name and the per-reader count.
    pub fn with_values(
        mut self,
        f: impl Fn(&str, u64) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        Arc::make_mut(&mut self.settings).value_fn = Some(Arc::new(f));
        self
    }

    /// Every command sent so far, as `(canonical name, command)`.
    pub fn commands(&self) -> Vec<(String, ReaderCommand)> {
        self.log.lock().commands.clone()
    }

    /// Canonical names that were sent `Read`, in order.
    pub fn reads(&self) -> Vec<String> {
        self.log
            .lock()
            .commands
            .iter()
            .filter(|(_, command)| *command == ReaderCommand::Read)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Readers created so far, as `(requested name, config)`.
    pub fn created(&self) -> Vec<(String, ReaderConfig)> {
        self.log.lock().created.clone()
    }

    /// Canonical names of disposed readers, in order.
    pub fn disposed(&self) -> Vec<String> {
        self.log.lock().disposed.clone()
    }

    /// Forget recorded commands, creations and disposals.
    pub fn clear_log(&self) {
        let mut log = self.log.lock();
        log.commands.clear();
        log.created.clear();
        log.disposed.clear();
    }

    /// Push a result as if the latest reader for `name` produced it.
    ///
    /// Returns `false` if no reader was created for `name` or its
    /// coordinator is gone.
    pub fn deliver(&self, name: &str, value: impl Into<serde_json::Value>) -> bool {
        let canonical = self.settings.resolve(name);
        let sender = self.log.lock().senders.get(&canonical).cloned();
        match sender {
            Some(sender) => sender.deliver(ReadResult::new(canonical, value)),
            None => false,
        }
    }

    /// Push an arbitrary result through the latest reader for `via`.
    pub fn deliver_result(&self, via: &str, result: ReadResult) -> bool {
        let canonical = self.settings.resolve(via);
        let sender = self.log.lock().senders.get(&canonical).cloned();
        sender.is_some_and(|sender| sender.deliver(result))
    }
}

impl ReaderFactory for MockReaderFactory {
    fn create_reader(
        &self,
        name: &str,
        config: &ReaderConfig,
        updates: UpdateSender,
    ) -> Result<Box<dyn ReaderHandle>> {
        if self.settings.failing.contains(name) {
            return Err(anyhow!("mock reader for '{name}' refused to connect"));
        }
        let canonical = self.settings.resolve(name);
        {
            let mut log = self.log.lock();
            log.created.push((name.to_string(), config.clone()));
            log.senders.insert(canonical.clone(), updates.clone());
        }
        debug!(source = name, canonical = %canonical, ?config, "mock reader created");

        let reader = MockReader {
            name: canonical,
            settings: self.settings.clone(),
            log: self.log.clone(),
            updates,
            count: Arc::new(AtomicU64::new(0)),
            refresh: Mutex::new(config.refresh_mode),
            period_ms: Mutex::new(config.period_ms),
            poll: Mutex::new(None),
        };
        reader.restart_polling();
        Ok(Box::new(reader))
    }

    fn dispose_reader(&self, reader: Box<dyn ReaderHandle>) {
        let name = reader.resolved_name();
        debug!(source = %name, "mock reader disposed");
        self.log.lock().disposed.push(name);
        drop(reader);
    }
}

// =============================================================================
// MockReader
// =============================================================================

/// One simulated reader.
pub struct MockReader {
    name: String,
    settings: Arc<MockSettings>,
    log: Arc<Mutex<MockLog>>,
    updates: UpdateSender,
    count: Arc<AtomicU64>,
    refresh: Mutex<RefreshMode>,
    period_ms: Mutex<Option<u64>>,
    poll: Mutex<Option<JoinHandle<()>>>,
}

impl MockReader {
    fn respond(&self) {
        let Some(latency) = self.settings.latency_for(&self.name) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(source = %self.name, "no tokio runtime: mock read not answered");
            return;
        };
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        let result = ReadResult::new(self.name.clone(), self.settings.value(&self.name, count));
        let updates = self.updates.clone();
        runtime.spawn(async move {
            sleep(latency).await;
            updates.deliver(result);
        });
    }

    fn restart_polling(&self) {
        let mut poll = self.poll.lock();
        if let Some(task) = poll.take() {
            task.abort();
        }
        if !self.settings.polling || *self.refresh.lock() != RefreshMode::Polled {
            return;
        }
        let Some(period) = (*self.period_ms.lock()).filter(|p| *p > 0) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(source = %self.name, "no tokio runtime: mock polling disabled");
            return;
        };

        let name = self.name.clone();
        let settings = self.settings.clone();
        let updates = self.updates.clone();
        let count = self.count.clone();
        let period = Duration::from_millis(period);
        *poll = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let n = count.fetch_add(1, Ordering::Relaxed) + 1;
                if !updates.deliver(ReadResult::new(name.clone(), settings.value(&name, n))) {
                    break;
                }
            }
        }));
    }
}

impl ReaderHandle for MockReader {
    fn set_source(&mut self, name: &str) {
        self.name = self.settings.resolve(name);
    }

    fn resolved_name(&self) -> String {
        self.name.clone()
    }

    fn send(&self, command: ReaderCommand) {
        self.log
            .lock()
            .commands
            .push((self.name.clone(), command.clone()));
        match command {
            ReaderCommand::Read => self.respond(),
            ReaderCommand::SetPeriod(ms) => {
                *self.period_ms.lock() = Some(ms);
                self.restart_polling();
            }
            ReaderCommand::SetRefreshMode(mode) => {
                *self.refresh.lock() = mode;
                self.restart_polling();
            }
            ReaderCommand::Payload(_) => {}
        }
    }
}

impl Drop for MockReader {
    fn drop(&mut self) {
        if let Some(task) = self.poll.lock().take() {
            task.abort();
        }
        // a replacement reader for the same name may already own the entry
        let mut log = self.log.lock();
        if log
            .senders
            .get(&self.name)
            .is_some_and(|sender| sender.reader_id() == self.updates.reader_id())
        {
            log.senders.remove(&self.name);
        }
    }
}
