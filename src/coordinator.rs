//! Read-cycle coordinator.
//!
//! [`ReadCoordinator`] decides when the next read is issued, detects when a
//! cycle over every registered source is complete, and delivers per-update
//! and per-cycle events in index order, whatever order the asynchronous
//! results arrive in.
//!
//! # Modes
//!
//! - [`ReadMode::Concurrent`]: readers refresh on their own; every update is
//!   forwarded and nothing is buffered.
//! - [`ReadMode::Sequential`]: a cycle reads the lowest index first, then each
//!   first arrival asks for the smallest index still missing. When nothing is
//!   missing the ordered cycle is emitted and the single-shot timer is armed
//!   for the next one.
//! - [`ReadMode::SequentialManual`]: same cycle logic, but a new cycle only
//!   starts on [`ReadCoordinator::start_read`].
//!
//! # Execution context
//!
//! The coordinator is a plain `&mut self` state machine. All mutation happens
//! on whoever owns it, normally the [`crate::driver`] task. Readers hand their
//! results to an [`UpdateSender`] that feeds the coordinator's own queue, and
//! sequential readers are created with the coordinator's thread token.
//!
//! # Example
//!
//! ```rust,ignore
//! let factory = Arc::new(MockReaderFactory::new());
//! let mut coord = ReadCoordinator::with_context(ReadContext::shared(factory), ReadMode::SequentialManual);
//! coord.register_sink(Arc::new(FnSink::on_cycle_complete(|cycle| println!("{cycle:?}"))));
//! coord.set_sources(["A", "B", "C"])?;
//! coord.start_read(); // read issued to A
//! ```

use crate::buffer::{Arrival, CycleBuffer};
use crate::config::{MultiReadConfig, ReadMode};
use crate::error::{AppResult, MultiReadError};
use crate::reader::{
    ReadResult, ReaderCommand, ReaderConfig, ReaderFactory, ReaderId, ReaderUpdate, RefreshMode,
    UpdateSender,
};
use crate::registry::{Insertion, Source, SourceRegistry};
use crate::sink::{EventListeners, EventSink, ListenerId};
use crate::timer::CycleTimer;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

const DEFAULT_PERIOD_MS: i64 = 1000;

/// Connection context shared by a coordinator and its siblings.
pub struct ReadContext {
    factory: Arc<dyn ReaderFactory>,
}

impl ReadContext {
    /// Context creating readers through `factory`.
    pub fn new(factory: Arc<dyn ReaderFactory>) -> Self {
        Self { factory }
    }

    /// Same as [`ReadContext::new`], already wrapped for sharing.
    pub fn shared(factory: Arc<dyn ReaderFactory>) -> Arc<Self> {
        Arc::new(Self::new(factory))
    }

    /// The reader factory.
    pub fn factory(&self) -> &dyn ReaderFactory {
        self.factory.as_ref()
    }
}

impl std::fmt::Debug for ReadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadContext").finish_non_exhaustive()
    }
}

/// Whether a sequential cycle is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// No cycle in flight.
    Idle,
    /// A read was issued or a result buffered, and the cycle is not complete.
    InFlight,
}

/// The read-cycle state machine.
pub struct ReadCoordinator {
    context: Option<Arc<ReadContext>>,
    mode: ReadMode,
    period_ms: i64,
    thread_token: String,
    registry: SourceRegistry,
    buffer: CycleBuffer,
    timer: Option<CycleTimer>,
    state: CycleState,
    // last index a read was requested from
    pending: Option<usize>,
    listeners: EventListeners,
    updates_tx: mpsc::UnboundedSender<ReaderUpdate>,
    updates_rx: Option<mpsc::UnboundedReceiver<ReaderUpdate>>,
}

impl Default for ReadCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadCoordinator {
    /// Uninitialized coordinator; call [`ReadCoordinator::init`] before use.
    pub fn new() -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            context: None,
            mode: ReadMode::Concurrent,
            period_ms: DEFAULT_PERIOD_MS,
            thread_token: format!("multiread-{}", Uuid::new_v4()),
            registry: SourceRegistry::new(),
            buffer: CycleBuffer::new(),
            timer: None,
            state: CycleState::Idle,
            pending: None,
            listeners: EventListeners::new(),
            updates_tx,
            updates_rx: Some(updates_rx),
        }
    }

    /// Initialized coordinator.
    pub fn with_context(context: Arc<ReadContext>, mode: ReadMode) -> Self {
        let mut coordinator = Self::new();
        coordinator.init(context, mode);
        coordinator
    }

    /// Build a coordinator from configuration and populate its sources.
    pub fn from_config(
        config: &MultiReadConfig,
        factory: Arc<dyn ReaderFactory>,
    ) -> AppResult<Self> {
        config.validate()?;
        let mut coordinator = Self::new();
        coordinator.period_ms = config.reader.period_ms;
        if let Some(token) = &config.reader.thread_token {
            coordinator.thread_token = token.clone();
        }
        coordinator.init(ReadContext::shared(factory), config.effective_mode());
        coordinator.set_sources(&config.reader.sources)?;
        Ok(coordinator)
    }

    /// Establish the reader context and mode.
    ///
    /// Re-initializing disposes every source created under the old context.
    pub fn init(&mut self, context: Arc<ReadContext>, mode: ReadMode) {
        if self.context.is_some() {
            self.unset_sources();
        }
        info!(?mode, period_ms = self.period_ms, "multi reader initialized");
        self.context = Some(context);
        self.mode = mode;
    }

    /// Reader context, `None` before `init`.
    pub fn context(&self) -> Option<&Arc<ReadContext>> {
        self.context.as_ref()
    }

    /// Current mode.
    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// Current period in milliseconds.
    pub fn period(&self) -> i64 {
        self.period_ms
    }

    /// Execution-context token given to sequential readers.
    pub fn thread_token(&self) -> &str {
        &self.thread_token
    }

    /// Cycle state.
    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Whether a sequential cycle is running.
    pub fn is_cycle_in_flight(&self) -> bool {
        self.state == CycleState::InFlight
    }

    /// Index of the last source a read was requested from in this cycle.
    pub fn pending_index(&self) -> Option<usize> {
        self.pending
    }

    /// When the cycle timer fires next, if armed.
    pub fn timer_deadline(&self) -> Option<Instant> {
        self.timer.as_ref().and_then(CycleTimer::deadline)
    }

    /// Whether the cycle timer exists. Only timer-paced mode creates one.
    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Results buffered in the current cycle.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the queue readers deliver into. Only the first call returns it.
    pub fn take_update_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ReaderUpdate>> {
        self.updates_rx.take()
    }

    /// Add an event sink.
    pub fn register_sink(&mut self, sink: Arc<dyn EventSink>) -> ListenerId {
        self.listeners.register(sink)
    }

    /// Remove an event sink.
    pub fn unregister_sink(&mut self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    // =========================================================================
    // Sources
    // =========================================================================

    /// Replace all sources with `names`, each at its position in the list.
    ///
    /// A name whose reader cannot be created is logged and skipped, leaving
    /// its index unassigned.
    pub fn set_sources<I, S>(&mut self, names: I) -> AppResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.require_context("set_sources")?;
        self.unset_sources();
        for (i, name) in names.into_iter().enumerate() {
            let index = isize::try_from(i).unwrap_or(isize::MAX);
            // failures are already logged by insert_source
            let _ = self.insert_source(name.as_ref(), index);
        }
        Ok(())
    }

    /// Create a reader for `name` and register it at `index`.
    ///
    /// Negative indices and indices owned by another source are rejected.
    pub fn insert_source(&mut self, name: &str, index: isize) -> AppResult<()> {
        let context = self.require_context("insert_source")?;
        let index = match SourceRegistry::validate_index(index) {
            Ok(index) => index,
            Err(err) => {
                warn!(source = name, error = %err, "insert_source: rejected");
                return Err(err);
            }
        };

        let reader_id = ReaderId::next();
        let updates = UpdateSender::new(reader_id, self.updates_tx.clone());
        let config = self.reader_config();
        let mut reader = match context.factory().create_reader(name, &config, updates) {
            Ok(reader) => reader,
            Err(source) => {
                let err = MultiReadError::Reader {
                    name: name.to_string(),
                    source,
                };
                warn!(error = %err, "insert_source: reader not created");
                return Err(err);
            }
        };
        reader.set_source(name);

        let source = Source::new(index, reader_id, reader);
        let canonical = source.name.clone();
        match self.registry.insert(source) {
            Insertion::Added => {}
            Insertion::Replaced(previous) => {
                debug!(source = %canonical, from = previous.index, to = index, "source moved");
                self.forget_index(previous.index);
                context.factory().dispose_reader(previous.into_reader());
            }
            Insertion::Rejected { source, owner } => {
                context.factory().dispose_reader(source.into_reader());
                let err = MultiReadError::InvalidIndex {
                    index: isize::try_from(index).unwrap_or(isize::MAX),
                    reason: format!("already assigned to '{owner}'"),
                };
                warn!(source = %canonical, error = %err, "insert_source: rejected");
                return Err(err);
            }
        }
        debug!(source = %canonical, index, "source inserted");

        // manual cycles never arm, so only timer-paced mode holds a timer
        if self.mode == ReadMode::Sequential && self.timer.is_none() {
            self.timer = Some(CycleTimer::new(self.period_ms));
        }
        Ok(())
    }

    /// Dispose the reader for `name` and forget it. Unknown names are ignored.
    pub fn remove_source(&mut self, name: &str) {
        let Some(source) = self.registry.remove(name) else {
            trace!(source = name, "remove_source: unknown source ignored");
            return;
        };
        debug!(source = name, index = source.index, "source removed");
        let index = source.index;
        if let Some(context) = &self.context {
            context.factory().dispose_reader(source.into_reader());
        }
        self.forget_index(index);
    }

    /// Dispose every reader, stop the timer and drop the cycle in flight.
    pub fn unset_sources(&mut self) {
        let readers = self.registry.drain();
        if !readers.is_empty() {
            info!(count = readers.len(), "disposing all readers");
        }
        if let Some(context) = &self.context {
            context.factory().dispose_all(readers);
        }
        self.timer = None;
        self.buffer.clear();
        self.pending = None;
        self.state = CycleState::Idle;
    }

    /// Canonical source names, ascending by index.
    pub fn sources(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Registered indices, ascending.
    pub fn indices(&self) -> Vec<usize> {
        self.registry.indices().collect()
    }

    /// Send `command` to the reader of `name`. Unknown names are ignored.
    pub fn send_to(&self, name: &str, command: ReaderCommand) {
        if self.context.is_none() {
            warn!(source = name, "send_to: not initialized, command dropped");
            return;
        }
        match self.registry.get(name) {
            Some(source) => {
                debug!(source = name, ?command, "sending command");
                source.reader().send(command);
            }
            None => trace!(source = name, "send_to: unknown source ignored"),
        }
    }

    /// Send `command` to the reader at `index`. Unknown indices are ignored.
    pub fn send_to_index(&self, index: usize, command: ReaderCommand) {
        if let Some(source) = self.registry.at(index) {
            self.send_to(&source.name, command);
        } else {
            trace!(index, "send_to_index: unknown index ignored");
        }
    }

    // =========================================================================
    // Mode and period
    // =========================================================================

    /// Change the period.
    ///
    /// Concurrent readers get positive periods forwarded. In the sequential
    /// modes a non-positive period switches to manual cycles and drops the
    /// timer. A positive one switches back to timer-paced cycles; the timer is
    /// armed when the next cycle completes.
    pub fn set_period(&mut self, ms: i64) {
        self.period_ms = ms;
        match self.mode {
            ReadMode::Concurrent => match u64::try_from(ms) {
                Ok(period) if period > 0 => self.broadcast(ReaderCommand::SetPeriod(period)),
                _ => debug!(ms, "non-positive period ignored in concurrent mode"),
            },
            ReadMode::Sequential | ReadMode::SequentialManual if ms <= 0 => {
                info!(ms, "period <= 0: switching to manual read cycles");
                self.mode = ReadMode::SequentialManual;
                self.broadcast(ReaderCommand::SetRefreshMode(RefreshMode::Manual));
                self.timer = None;
            }
            ReadMode::Sequential | ReadMode::SequentialManual => {
                self.mode = ReadMode::Sequential;
                self.broadcast(ReaderCommand::SetRefreshMode(RefreshMode::Polled));
                self.broadcast(ReaderCommand::SetPeriod(ms.unsigned_abs()));
                if !self.registry.is_empty() {
                    self.timer
                        .get_or_insert_with(CycleTimer::default)
                        .set_interval(ms);
                }
                debug!(ms, "period > 0: timer rearms after the next completed cycle");
            }
        }
    }

    /// Switch mode, reconfiguring every reader. The cycle in flight is dropped.
    pub fn set_mode(&mut self, mode: ReadMode) {
        let mode = mode.effective(self.period_ms);
        if mode == self.mode {
            return;
        }
        info!(from = ?self.mode, to = ?mode, "read mode changed");
        self.mode = mode;
        self.buffer.clear();
        self.pending = None;
        self.state = CycleState::Idle;

        let config = self.reader_config();
        self.broadcast(ReaderCommand::SetRefreshMode(config.refresh_mode));
        if let Some(period) = config.period_ms {
            self.broadcast(ReaderCommand::SetPeriod(period));
        }

        if mode == ReadMode::Sequential {
            if !self.registry.is_empty() && self.timer.is_none() {
                self.timer = Some(CycleTimer::new(self.period_ms));
            }
        } else {
            self.timer = None;
        }
    }

    // =========================================================================
    // Cycle state machine
    // =========================================================================

    /// Start a cycle by reading the lowest index.
    ///
    /// Sequential mode calls this from the timer; manual mode needs an
    /// explicit call for every cycle.
    pub fn start_read(&mut self) {
        let Some(first) = self.registry.first_index() else {
            debug!("start_read: no sources");
            return;
        };
        if let Some(timer) = &mut self.timer {
            timer.stop();
        }
        if self.mode.is_sequential() {
            self.state = CycleState::InFlight;
        }
        debug!(index = first, "start_read: cycle started");
        self.request_read(first);
        if self.buffer.contains(first) {
            // re-read of a result this cycle already holds
            self.pending = None;
        }
    }

    /// Fire the timer if it is due at `now`. Returns whether a cycle started.
    pub fn handle_timer_expired(&mut self, now: Instant) -> bool {
        let fired = self.timer.as_mut().is_some_and(|timer| timer.expire(now));
        if fired {
            self.start_read();
        }
        fired
    }

    /// Accept a result from the update queue.
    ///
    /// Results from readers that were removed or disposed are dropped.
    pub fn handle_reader_update(&mut self, update: ReaderUpdate) {
        if !self.registry.contains_reader(update.reader) {
            debug!(
                reader = %update.reader,
                source = %update.result.source,
                "dropping update from disposed reader"
            );
            return;
        }
        self.on_update(update.result);
    }

    /// Process one result.
    pub fn on_update(&mut self, result: ReadResult) {
        if self.registry.is_empty() {
            debug!(source = %result.source, "no sources registered: update ignored");
            return;
        }

        let index = self.registry.match_index(&result.source);
        if index.is_none() {
            warn!(source = %result.source, "update does not match any registered source");
        }
        self.listeners.emit_update(&result);

        if !self.mode.is_sequential() {
            return;
        }
        let Some(index) = index else {
            return;
        };

        self.state = CycleState::InFlight;
        match self.buffer.store(index, result) {
            Arrival::Refresh => {
                trace!(index, "refresh of buffered index: cycle unchanged");
            }
            Arrival::First => {
                if self.pending == Some(index) {
                    self.pending = None;
                }
                self.advance_cycle();
            }
        }
    }

    /// Sibling reading sequentially through the same context.
    pub fn sequential_sibling(&self, manual: bool) -> AppResult<ReadCoordinator> {
        let mode = if manual {
            ReadMode::SequentialManual
        } else {
            ReadMode::Sequential.effective(self.period_ms)
        };
        self.sibling(mode)
    }

    /// Sibling reading concurrently through the same context.
    pub fn concurrent_sibling(&self) -> AppResult<ReadCoordinator> {
        self.sibling(ReadMode::Concurrent)
    }

    fn sibling(&self, mode: ReadMode) -> AppResult<ReadCoordinator> {
        let context = self.require_context("sibling")?;
        let mut sibling = ReadCoordinator::new();
        sibling.period_ms = self.period_ms;
        sibling.init(context, mode);
        Ok(sibling)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn require_context(&self, operation: &str) -> AppResult<Arc<ReadContext>> {
        match &self.context {
            Some(context) => Ok(context.clone()),
            None => {
                warn!(operation, "multi reader used before init");
                Err(MultiReadError::NotInitialized)
            }
        }
    }

    fn reader_config(&self) -> ReaderConfig {
        match self.mode {
            ReadMode::Concurrent => ReaderConfig::concurrent(self.period_ms),
            ReadMode::Sequential => ReaderConfig::sequential(self.period_ms, &self.thread_token),
            ReadMode::SequentialManual => ReaderConfig::sequential_manual(&self.thread_token),
        }
    }

    fn broadcast(&self, command: ReaderCommand) {
        for source in self.registry.iter() {
            source.reader().send(command.clone());
        }
    }

    fn request_read(&mut self, index: usize) {
        let Some(source) = self.registry.at(index) else {
            return;
        };
        debug!(index, source = %source.name, "sending read");
        source.reader().send(ReaderCommand::Read);
        if self.mode.is_sequential() {
            self.pending = Some(index);
        }
    }

    // Either chain to the smallest missing index or close the cycle.
    fn advance_cycle(&mut self) {
        if let Some(next) = self.buffer.next_missing(self.registry.indices()) {
            self.request_read(next);
            return;
        }
        if self.buffer.is_empty() {
            // every source was removed mid-cycle
            self.state = CycleState::Idle;
            self.pending = None;
            return;
        }
        self.complete_cycle();
    }

    fn complete_cycle(&mut self) {
        debug_assert!(self.buffer.is_complete(self.registry.indices()));
        let results = self.buffer.take_ordered();
        self.state = CycleState::Idle;
        self.pending = None;
        self.listeners.emit_cycle_complete(&results);

        if self.mode == ReadMode::Sequential && self.period_ms > 0 {
            let timer = self.timer.get_or_insert_with(CycleTimer::default);
            timer.set_interval(self.period_ms);
            timer.start();
            debug!(count = results.len(), period_ms = self.period_ms, "read cycle complete, restarting timer");
        } else {
            debug!(count = results.len(), "read cycle complete, waiting for manual trigger");
        }
    }

    // Drop cycle bookkeeping for an index that no longer exists, then move
    // the cycle on unless a registered source is still being awaited.
    fn forget_index(&mut self, index: usize) {
        self.buffer.discard(index);
        if self.pending == Some(index) {
            self.pending = None;
        }
        if self.state != CycleState::InFlight {
            return;
        }
        let awaited = self
            .pending
            .is_some_and(|p| !self.buffer.contains(p) && self.registry.at(p).is_some());
        if !awaited {
            self.advance_cycle();
        }
    }
}

impl Drop for ReadCoordinator {
    fn drop(&mut self) {
        self.unset_sources();
    }
}

impl std::fmt::Debug for ReadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCoordinator")
            .field("mode", &self.mode)
            .field("period_ms", &self.period_ms)
            .field("sources", &self.registry.names())
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockReaderFactory;
    use crate::sink::FnSink;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<ReadResult>>,
        cycles: Mutex<Vec<Vec<ReadResult>>>,
    }

    impl EventSink for Recorder {
        fn on_update(&self, result: &ReadResult) {
            self.updates.lock().push(result.clone());
        }
        fn on_cycle_complete(&self, results: &[ReadResult]) {
            self.cycles.lock().push(results.to_vec());
        }
    }

    impl Recorder {
        fn cycle_values(&self) -> Vec<Vec<serde_json::Value>> {
            self.cycles
                .lock()
                .iter()
                .map(|c| c.iter().map(|r| r.value.clone()).collect())
                .collect()
        }
    }

    fn coordinator(
        mode: ReadMode,
        names: &[&str],
    ) -> (ReadCoordinator, Arc<MockReaderFactory>, Arc<Recorder>) {
        let factory = Arc::new(MockReaderFactory::new());
        let mut coord = ReadCoordinator::with_context(ReadContext::shared(factory.clone()), mode);
        let recorder = Arc::new(Recorder::default());
        coord.register_sink(recorder.clone());
        coord.set_sources(names).unwrap();
        factory.clear_log();
        (coord, factory, recorder)
    }

    #[test]
    fn manual_cycle_walks_sources_in_order() {
        let (mut coord, factory, recorder) =
            coordinator(ReadMode::SequentialManual, &["A", "B", "C"]);
        coord.set_period(-1);

        coord.start_read();
        assert_eq!(factory.reads(), vec!["A"]);

        coord.on_update(ReadResult::new("A", 1));
        assert_eq!(factory.reads(), vec!["A", "B"]);
        assert_eq!(recorder.updates.lock().len(), 1);

        coord.on_update(ReadResult::new("B", 2));
        assert_eq!(factory.reads(), vec!["A", "B", "C"]);

        coord.on_update(ReadResult::new("C", 3));
        assert_eq!(recorder.cycle_values(), vec![vec![1, 2, 3]]);
        assert_eq!(coord.buffered(), 0);
        assert_eq!(coord.state(), CycleState::Idle);
        assert!(coord.timer_deadline().is_none());
        // no further read until the next trigger
        assert_eq!(factory.reads().len(), 3);
    }

    #[test]
    fn next_read_targets_smallest_missing_index() {
        let (mut coord, factory, _) = coordinator(ReadMode::SequentialManual, &["A", "B", "C"]);

        coord.on_update(ReadResult::new("C", 3));
        assert_eq!(factory.reads(), vec!["A"]);
        coord.on_update(ReadResult::new("A", 1));
        assert_eq!(factory.reads(), vec!["A", "B"]);
    }

    #[test]
    fn refresh_does_not_rescan_missing_set() {
        let (mut coord, factory, recorder) =
            coordinator(ReadMode::SequentialManual, &["A", "B", "C"]);
        coord.start_read();
        coord.on_update(ReadResult::new("A", 1));
        assert_eq!(factory.reads(), vec!["A", "B"]);

        // A refreshes twice while B is outstanding
        coord.on_update(ReadResult::new("A", 10));
        coord.on_update(ReadResult::new("A", 11));
        assert_eq!(factory.reads(), vec!["A", "B"]);
        assert_eq!(recorder.updates.lock().len(), 3);

        coord.on_update(ReadResult::new("B", 2));
        coord.on_update(ReadResult::new("C", 3));
        // refreshed value is the one delivered
        assert_eq!(recorder.cycle_values(), vec![vec![11, 2, 3]]);
    }

    #[test]
    fn sequential_cycle_rearms_timer() {
        let (mut coord, factory, recorder) = coordinator(ReadMode::Sequential, &["A", "B"]);
        coord.set_period(200);
        assert!(coord.has_timer());
        factory.clear_log();

        let before = Instant::now();
        coord.start_read();
        coord.on_update(ReadResult::new("A", 1));
        coord.on_update(ReadResult::new("B", 2));
        assert_eq!(recorder.cycles.lock().len(), 1);

        let deadline = coord.timer_deadline().unwrap();
        assert!(deadline >= before + std::time::Duration::from_millis(200));

        // not yet due
        assert!(!coord.handle_timer_expired(deadline - std::time::Duration::from_millis(1)));
        assert!(coord.handle_timer_expired(deadline));
        assert_eq!(factory.reads(), vec!["A", "B", "A"]);
        assert!(coord.timer_deadline().is_none());
    }

    #[test]
    fn non_positive_period_suspends_automatic_restart() {
        let (mut coord, factory, recorder) = coordinator(ReadMode::Sequential, &["A", "B"]);
        coord.set_period(-1);
        assert_eq!(coord.mode(), ReadMode::SequentialManual);
        assert!(factory
            .commands()
            .iter()
            .any(|(_, c)| *c == ReaderCommand::SetRefreshMode(RefreshMode::Manual)));

        coord.start_read();
        coord.on_update(ReadResult::new("A", 1));
        coord.on_update(ReadResult::new("B", 2));
        assert_eq!(recorder.cycles.lock().len(), 1);
        assert!(coord.timer_deadline().is_none());
        assert!(!coord.handle_timer_expired(Instant::now() + std::time::Duration::from_secs(60)));
        assert_eq!(factory.reads(), vec!["A", "B"]);
    }

    #[test]
    fn positive_period_resumes_automatic_cycles() {
        let (mut coord, factory, recorder) = coordinator(ReadMode::SequentialManual, &["A"]);
        assert!(!coord.has_timer());
        coord.set_period(100);
        assert_eq!(coord.mode(), ReadMode::Sequential);
        // nothing is armed until a cycle completes
        assert!(coord.timer_deadline().is_none());
        assert!(factory.reads().is_empty());

        coord.start_read();
        coord.on_update(ReadResult::new("A", 1));
        assert_eq!(recorder.cycles.lock().len(), 1);
        let deadline = coord.timer_deadline().unwrap();
        assert!(coord.handle_timer_expired(deadline));
        assert_eq!(factory.reads(), vec!["A", "A"]);
    }

    #[test]
    fn positive_period_while_idle_does_not_start_a_cycle() {
        let (mut coord, factory, _) = coordinator(ReadMode::Sequential, &["A", "B"]);
        coord.set_period(50);
        assert!(coord.has_timer());
        assert!(coord.timer_deadline().is_none());
        assert!(!coord.handle_timer_expired(Instant::now() + std::time::Duration::from_secs(60)));
        assert!(factory.reads().is_empty());
    }

    #[test]
    fn concurrent_mode_never_completes_cycles() {
        let (mut coord, factory, recorder) = coordinator(ReadMode::Concurrent, &["A", "B"]);
        for i in 0..10 {
            coord.on_update(ReadResult::new("A", i));
            coord.on_update(ReadResult::new("B", i));
        }
        assert_eq!(recorder.updates.lock().len(), 20);
        assert!(recorder.cycles.lock().is_empty());
        assert!(factory.reads().is_empty());
        assert!(!coord.has_timer());
    }

    #[test]
    fn concurrent_set_period_forwards_positive_periods() {
        let (mut coord, factory, _) = coordinator(ReadMode::Concurrent, &["A", "B"]);
        coord.set_period(500);
        let periods: Vec<_> = factory
            .commands()
            .into_iter()
            .filter(|(_, c)| *c == ReaderCommand::SetPeriod(500))
            .map(|(name, _)| name)
            .collect();
        assert_eq!(periods, vec!["A", "B"]);

        factory.clear_log();
        coord.set_period(-1);
        assert!(factory.commands().is_empty());
        assert_eq!(coord.period(), -1);
    }

    #[test]
    #[traced_test]
    fn unmatched_update_is_forwarded_but_not_buffered() {
        let (mut coord, factory, recorder) = coordinator(ReadMode::SequentialManual, &["A", "B"]);
        coord.start_read();
        coord.on_update(ReadResult::new("ghost", 0));

        assert_eq!(recorder.updates.lock().len(), 1);
        assert_eq!(coord.buffered(), 0);
        assert_eq!(factory.reads(), vec!["A"]);
        assert!(logs_contain("update does not match any registered source"));

        coord.on_update(ReadResult::new("A", 1));
        coord.on_update(ReadResult::new("B", 2));
        assert_eq!(recorder.cycle_values(), vec![vec![1, 2]]);
    }

    #[test]
    fn argument_suffix_still_matches() {
        let (mut coord, _, recorder) =
            coordinator(ReadMode::SequentialManual, &["dev/x/cmd(1)", "dev/y/attr"]);
        coord.on_update(ReadResult::new("dev/x/cmd", 1));
        coord.on_update(ReadResult::new("dev/y/attr", 2));
        assert_eq!(recorder.cycles.lock().len(), 1);
    }

    #[test]
    fn unset_sources_then_update_is_noop() {
        let (mut coord, factory, recorder) = coordinator(ReadMode::Sequential, &["A", "B"]);
        coord.start_read();
        coord.on_update(ReadResult::new("A", 1));
        coord.unset_sources();

        assert_eq!(factory.disposed(), vec!["A", "B"]);
        assert!(coord.sources().is_empty());
        assert!(!coord.has_timer());
        assert_eq!(coord.buffered(), 0);

        let before = recorder.updates.lock().len();
        coord.on_update(ReadResult::new("B", 2));
        assert_eq!(recorder.updates.lock().len(), before);
        assert!(recorder.cycles.lock().is_empty());
    }

    #[test]
    fn deliveries_from_disposed_readers_are_dropped() {
        let factory = Arc::new(MockReaderFactory::new());
        let mut coord = ReadCoordinator::with_context(
            ReadContext::shared(factory.clone()),
            ReadMode::SequentialManual,
        );
        let recorder = Arc::new(Recorder::default());
        coord.register_sink(recorder.clone());
        let mut rx = coord.take_update_receiver().unwrap();
        coord.set_sources(["A"]).unwrap();

        factory.deliver("A", 1);
        coord.set_sources(["A"]).unwrap();
        factory.deliver("A", 2);

        while let Ok(update) = rx.try_recv() {
            coord.handle_reader_update(update);
        }
        let values: Vec<_> = recorder.updates.lock().iter().map(|r| r.value.clone()).collect();
        assert_eq!(values, vec![2]);
    }

    #[test]
    fn remove_unknown_source_is_ignored() {
        let (mut coord, factory, _) = coordinator(ReadMode::Concurrent, &["A", "B"]);
        coord.remove_source("unknown");
        assert_eq!(coord.sources(), vec!["A", "B"]);
        assert!(factory.disposed().is_empty());
    }

    #[test]
    fn removing_pending_source_advances_cycle() {
        let (mut coord, factory, recorder) =
            coordinator(ReadMode::SequentialManual, &["A", "B", "C"]);
        coord.start_read();
        coord.on_update(ReadResult::new("A", 1));
        assert_eq!(coord.pending_index(), Some(1));

        coord.remove_source("B");
        assert_eq!(factory.disposed(), vec!["B"]);
        assert_eq!(factory.reads(), vec!["A", "B", "C"]);

        coord.on_update(ReadResult::new("C", 3));
        assert_eq!(recorder.cycle_values(), vec![vec![1, 3]]);
    }

    #[test]
    fn removing_outstanding_source_after_restart_completes_cycle() {
        let (mut coord, factory, recorder) = coordinator(ReadMode::SequentialManual, &["A", "B"]);
        // an unsolicited result opens the cycle and B is requested
        coord.on_update(ReadResult::new("A", 1));
        assert_eq!(coord.pending_index(), Some(1));

        // restarting re-reads A, which this cycle already holds
        coord.start_read();
        assert_eq!(coord.pending_index(), None);
        coord.on_update(ReadResult::new("A", 2));
        assert!(recorder.cycles.lock().is_empty());

        coord.remove_source("B");
        assert_eq!(recorder.cycle_values(), vec![vec![2]]);
        assert_eq!(coord.state(), CycleState::Idle);
        assert_eq!(factory.disposed(), vec!["B"]);

        // later results start fresh cycles again
        coord.on_update(ReadResult::new("A", 3));
        assert_eq!(recorder.cycle_values(), vec![vec![2], vec![3]]);
    }

    #[test]
    fn removing_a_buffered_source_keeps_waiting_on_the_outstanding_one() {
        let (mut coord, factory, recorder) =
            coordinator(ReadMode::SequentialManual, &["A", "B", "C"]);
        coord.start_read();
        coord.on_update(ReadResult::new("A", 1));
        assert_eq!(coord.pending_index(), Some(1));

        coord.remove_source("A");
        // B is still outstanding: no duplicate read, no early completion
        assert_eq!(factory.reads(), vec!["A", "B"]);
        assert!(recorder.cycles.lock().is_empty());

        coord.on_update(ReadResult::new("B", 2));
        coord.on_update(ReadResult::new("C", 3));
        assert_eq!(recorder.cycle_values(), vec![vec![2, 3]]);
    }

    #[test]
    fn removing_last_pending_source_completes_cycle() {
        let (mut coord, _, recorder) = coordinator(ReadMode::SequentialManual, &["A", "B"]);
        coord.start_read();
        coord.on_update(ReadResult::new("A", 1));
        coord.remove_source("B");
        assert_eq!(recorder.cycle_values(), vec![vec![1]]);
        assert_eq!(coord.state(), CycleState::Idle);
    }

    #[test]
    fn insert_source_index_policy() {
        let (mut coord, factory, _) = coordinator(ReadMode::SequentialManual, &["A", "B"]);

        assert!(matches!(
            coord.insert_source("N", -1),
            Err(MultiReadError::InvalidIndex { index: -1, .. })
        ));
        // rejected before any reader is created
        assert!(factory.created().is_empty());

        // index == len appends
        coord.insert_source("C", 2).unwrap();
        // index > len keeps its key and sorts last
        coord.insert_source("Z", 10).unwrap();
        assert_eq!(coord.sources(), vec!["A", "B", "C", "Z"]);
        assert_eq!(coord.indices(), vec![0, 1, 2, 10]);

        // occupied index: refused, new reader disposed
        assert!(coord.insert_source("X", 1).is_err());
        assert_eq!(factory.disposed(), vec!["X"]);
        assert_eq!(coord.sources(), vec!["A", "B", "C", "Z"]);
    }

    #[test]
    fn duplicate_resolved_name_keeps_single_entry() {
        let factory = Arc::new(MockReaderFactory::new().with_alias("a", "A"));
        let mut coord =
            ReadCoordinator::with_context(ReadContext::shared(factory.clone()), ReadMode::SequentialManual);
        coord.set_sources(["A", "B"]).unwrap();

        // "a" resolves to the already registered "A"
        coord.insert_source("a", 5).unwrap();
        assert_eq!(coord.sources(), vec!["B", "A"]);
        assert_eq!(coord.indices(), vec![1, 5]);
        assert_eq!(factory.disposed(), vec!["A"]);
    }

    #[test]
    fn set_sources_skips_failing_readers() {
        let factory = Arc::new(MockReaderFactory::new().failing_on("bad"));
        let mut coord =
            ReadCoordinator::with_context(ReadContext::shared(factory), ReadMode::SequentialManual);
        coord.set_sources(["A", "bad", "C"]).unwrap();
        assert_eq!(coord.sources(), vec!["A", "C"]);
        // C keeps its position in the list
        assert_eq!(coord.indices(), vec![0, 2]);
    }

    #[test]
    fn set_sources_indices_follow_list_positions() {
        let factory = Arc::new(MockReaderFactory::new().failing_on("bad"));
        let mut coord = ReadCoordinator::with_context(
            ReadContext::shared(factory.clone()),
            ReadMode::SequentialManual,
        );
        coord.set_sources(["A", "bad", "C"]).unwrap();

        factory.clear_log();
        coord.send_to_index(2, ReaderCommand::Read);
        coord.send_to_index(1, ReaderCommand::Read);
        assert_eq!(factory.reads(), vec!["C"]);

        // the gap takes no part in the cycle
        coord.start_read();
        coord.on_update(ReadResult::new("A", 1));
        assert_eq!(factory.reads(), vec!["C", "A", "C"]);
    }

    #[test]
    fn sources_resolve_through_reader() {
        let factory = Arc::new(MockReaderFactory::new().with_alias("tg/1/att", "sys/tg/1/att"));
        let mut coord =
            ReadCoordinator::with_context(ReadContext::shared(factory.clone()), ReadMode::SequentialManual);
        coord.set_sources(["tg/1/att"]).unwrap();
        assert_eq!(coord.sources(), vec!["sys/tg/1/att"]);

        factory.clear_log();
        coord.send_to("sys/tg/1/att", ReaderCommand::Payload(serde_json::json!({"args": [1]})));
        coord.send_to("tg/1/att", ReaderCommand::Read);
        coord.send_to_index(3, ReaderCommand::Read);
        assert_eq!(factory.commands().len(), 1);
    }

    #[test]
    fn reader_config_follows_mode() {
        let factory = Arc::new(MockReaderFactory::new());
        let context = ReadContext::shared(factory.clone());
        let mut seq = ReadCoordinator::with_context(context.clone(), ReadMode::Sequential);
        seq.set_sources(["A"]).unwrap();
        let mut manual = ReadCoordinator::with_context(context.clone(), ReadMode::SequentialManual);
        manual.set_sources(["B"]).unwrap();
        let mut conc = ReadCoordinator::with_context(context, ReadMode::Concurrent);
        conc.set_sources(["C"]).unwrap();

        let created = factory.created();
        assert_eq!(created[0].1, ReaderConfig::sequential(1000, seq.thread_token()));
        assert_eq!(created[1].1, ReaderConfig::sequential_manual(manual.thread_token()));
        assert_eq!(created[2].1, ReaderConfig::concurrent(1000));
        assert_ne!(seq.thread_token(), manual.thread_token());
    }

    #[test]
    fn timer_created_on_first_sequential_insertion() {
        let factory = Arc::new(MockReaderFactory::new());
        let mut coord =
            ReadCoordinator::with_context(ReadContext::shared(factory), ReadMode::Sequential);
        assert!(!coord.has_timer());
        coord.insert_source("A", 0).unwrap();
        assert!(coord.has_timer());
        // prepared, not started
        assert!(coord.timer_deadline().is_none());
    }

    #[test]
    #[traced_test]
    fn operations_before_init_are_noops() {
        let mut coord = ReadCoordinator::new();
        assert!(coord.context().is_none());
        assert!(matches!(
            coord.set_sources(["A"]),
            Err(MultiReadError::NotInitialized)
        ));
        assert!(matches!(
            coord.insert_source("A", 0),
            Err(MultiReadError::NotInitialized)
        ));
        coord.send_to("A", ReaderCommand::Read);
        coord.start_read();
        coord.on_update(ReadResult::new("A", 1));
        assert!(coord.sources().is_empty());
        assert!(coord.sequential_sibling(false).is_err());
        assert!(logs_contain("multi reader used before init"));
    }

    #[test]
    fn siblings_share_context_but_not_state() {
        let (mut parent, factory, recorder) = coordinator(ReadMode::Concurrent, &["A", "B"]);
        let mut sibling = parent.sequential_sibling(true).unwrap();
        assert_eq!(sibling.mode(), ReadMode::SequentialManual);
        assert!(Arc::ptr_eq(
            parent.context().unwrap(),
            sibling.context().unwrap()
        ));

        sibling.set_sources(["X", "Y"]).unwrap();
        assert_eq!(parent.sources(), vec!["A", "B"]);
        drop(sibling);
        assert_eq!(factory.disposed(), vec!["X", "Y"]);
        assert_eq!(parent.sources(), vec!["A", "B"]);

        let concurrent = parent.concurrent_sibling().unwrap();
        assert_eq!(concurrent.mode(), ReadMode::Concurrent);
        assert!(concurrent.sources().is_empty());

        parent.on_update(ReadResult::new("A", 1));
        assert_eq!(recorder.updates.lock().len(), 1);
    }

    #[test]
    fn sibling_inherits_period() {
        let (mut parent, _, _) = coordinator(ReadMode::Concurrent, &[]);
        parent.set_period(-1);
        let sibling = parent.sequential_sibling(false).unwrap();
        assert_eq!(sibling.period(), -1);
        assert_eq!(sibling.mode(), ReadMode::SequentialManual);
    }

    #[test]
    fn set_mode_reconfigures_readers() {
        let (mut coord, factory, recorder) = coordinator(ReadMode::Concurrent, &["A", "B"]);
        coord.set_mode(ReadMode::SequentialManual);
        // manual cycles never arm a timer
        assert!(!coord.has_timer());
        let manual: Vec<_> = factory
            .commands()
            .into_iter()
            .filter(|(_, c)| *c == ReaderCommand::SetRefreshMode(RefreshMode::Manual))
            .collect();
        assert_eq!(manual.len(), 2);

        coord.start_read();
        coord.on_update(ReadResult::new("A", 1));
        coord.on_update(ReadResult::new("B", 2));
        assert_eq!(recorder.cycles.lock().len(), 1);

        coord.set_mode(ReadMode::Sequential);
        assert!(coord.has_timer());
        coord.set_mode(ReadMode::Concurrent);
        assert!(!coord.has_timer());
    }

    #[test]
    fn manual_insertion_creates_no_timer() {
        let (mut coord, _, _) = coordinator(ReadMode::SequentialManual, &["A"]);
        coord.insert_source("B", 1).unwrap();
        assert!(!coord.has_timer());
    }

    #[test]
    fn fn_sinks_receive_cycles() {
        let (mut coord, _, _) = coordinator(ReadMode::SequentialManual, &["A"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let id = coord.register_sink(Arc::new(FnSink::on_cycle_complete(move |c| {
            s.lock().push(c.len());
        })));
        coord.on_update(ReadResult::new("A", 1));
        assert!(coord.unregister_sink(id));
        coord.on_update(ReadResult::new("A", 2));
        assert_eq!(*seen.lock(), vec![1]);
    }
}
