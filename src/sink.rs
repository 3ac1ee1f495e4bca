//! Event delivery to consumers.
//!
//! Consumers register one or more [`EventSink`]s with a coordinator. Every
//! update produces exactly one `on_update` call per sink; every completed
//! sequential cycle produces exactly one `on_cycle_complete` call per sink,
//! carrying the results in ascending index order. Sinks are called in
//! registration order on the coordinator's execution context and must not
//! block.

use crate::reader::ReadResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Receiver of coordinator events.
pub trait EventSink: Send + Sync {
    /// A reader delivered a result (matched or not).
    fn on_update(&self, result: &ReadResult);

    /// A sequential cycle completed; `results` are ascending by index.
    fn on_cycle_complete(&self, _results: &[ReadResult]) {}
}

/// Events as values, for channel-based consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MultiReadEvent {
    /// See [`EventSink::on_update`].
    Update(ReadResult),
    /// See [`EventSink::on_cycle_complete`].
    CycleComplete(Vec<ReadResult>),
}

/// Sink that republishes every event on a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<MultiReadEvent>,
}

impl BroadcastSink {
    /// New sink with room for `capacity` unread events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver; sees events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MultiReadEvent> {
        self.tx.subscribe()
    }

    /// Sender half, shared with whoever needs to subscribe later.
    pub fn sender(&self) -> broadcast::Sender<MultiReadEvent> {
        self.tx.clone()
    }

    fn publish(&self, event: MultiReadEvent) {
        // no receivers is fine
        let _ = self.tx.send(event);
    }
}

impl EventSink for BroadcastSink {
    fn on_update(&self, result: &ReadResult) {
        self.publish(MultiReadEvent::Update(result.clone()));
    }

    fn on_cycle_complete(&self, results: &[ReadResult]) {
        self.publish(MultiReadEvent::CycleComplete(results.to_vec()));
    }
}

type UpdateFn = dyn Fn(&ReadResult) + Send + Sync;
type CycleFn = dyn Fn(&[ReadResult]) + Send + Sync;

/// Sink built from closures.
pub struct FnSink {
    update: Option<Box<UpdateFn>>,
    cycle: Option<Box<CycleFn>>,
}

impl FnSink {
    /// Sink that only handles updates.
    pub fn on_update(f: impl Fn(&ReadResult) + Send + Sync + 'static) -> Self {
        Self {
            update: Some(Box::new(f)),
            cycle: None,
        }
    }

    /// Sink that only handles completed cycles.
    pub fn on_cycle_complete(f: impl Fn(&[ReadResult]) + Send + Sync + 'static) -> Self {
        Self {
            update: None,
            cycle: Some(Box::new(f)),
        }
    }

    /// Add a cycle handler to an update sink.
    pub fn and_cycle_complete(mut self, f: impl Fn(&[ReadResult]) + Send + Sync + 'static) -> Self {
        self.cycle = Some(Box::new(f));
        self
    }
}

impl EventSink for FnSink {
    fn on_update(&self, result: &ReadResult) {
        if let Some(f) = &self.update {
            f(result);
        }
    }

    fn on_cycle_complete(&self, results: &[ReadResult]) {
        if let Some(f) = &self.cycle {
            f(results);
        }
    }
}

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered set of registered sinks.
#[derive(Default)]
pub struct EventListeners {
    sinks: Vec<(ListenerId, Arc<dyn EventSink>)>,
    next_id: u64,
}

impl EventListeners {
    /// No listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink; it receives events after any already registered.
    pub fn register(&mut self, sink: Arc<dyn EventSink>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.sinks.push((id, sink));
        id
    }

    /// Remove a sink. Returns whether it was registered.
    pub fn unregister(&mut self, id: ListenerId) -> bool {
        let before = self.sinks.len();
        self.sinks.retain(|(sid, _)| *sid != id);
        self.sinks.len() != before
    }

    /// Number of registered sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sink is registered.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub(crate) fn emit_update(&self, result: &ReadResult) {
        for (_, sink) in &self.sinks {
            sink.on_update(result);
        }
    }

    pub(crate) fn emit_cycle_complete(&self, results: &[ReadResult]) {
        for (_, sink) in &self.sinks {
            sink.on_cycle_complete(results);
        }
    }
}
