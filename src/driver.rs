//! Async driver for a [`ReadCoordinator`].
//!
//! [`MultiReader`] is the single owner of one coordinator and runs it in a
//! dedicated Tokio task. The task processes commands received from cloneable
//! handles over an mpsc channel and responds using oneshot channels, so every
//! coordinator mutation happens on one execution context without locks.
//!
//! ## Event Loop
//!
//! The task `select!`s over three inputs:
//!
//! ```text
//! MultiReader handles ──(commands)──┐
//! Readers ──(UpdateSender)──────────┼──> ReadCoordinator ──> EventSinks
//! Cycle timer deadline ─────────────┘                    └─> broadcast subscribers
//! ```
//!
//! ## Shutdown
//!
//! `shutdown()` or dropping every handle ends the loop. All readers are
//! disposed and the timer dies with the coordinator.
//!
//! # Example
//!
//! ```rust,ignore
//! let reader = MultiReader::spawn(coordinator)?;
//! let mut events = reader.subscribe();
//! reader.set_sources(vec!["A".into(), "B".into()]).await?;
//! reader.start_read().await?;
//! while let Ok(event) = events.recv().await { /* ... */ }
//! ```

use crate::config::ReadMode;
use crate::coordinator::ReadCoordinator;
use crate::error::{AppResult, MultiReadError};
use crate::reader::{ReaderCommand, ReaderUpdate};
use crate::sink::{BroadcastSink, EventSink, ListenerId, MultiReadEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 1024;

/// Requests processed by the driver task.
enum Command {
    SetSources {
        names: Vec<String>,
        response: oneshot::Sender<AppResult<()>>,
    },
    InsertSource {
        name: String,
        index: isize,
        response: oneshot::Sender<AppResult<()>>,
    },
    RemoveSource {
        name: String,
        response: oneshot::Sender<()>,
    },
    UnsetSources {
        response: oneshot::Sender<()>,
    },
    Sources {
        response: oneshot::Sender<Vec<String>>,
    },
    StartRead {
        response: oneshot::Sender<()>,
    },
    SetPeriod {
        ms: i64,
        response: oneshot::Sender<()>,
    },
    Period {
        response: oneshot::Sender<i64>,
    },
    SetMode {
        mode: ReadMode,
        response: oneshot::Sender<()>,
    },
    Mode {
        response: oneshot::Sender<ReadMode>,
    },
    SendTo {
        name: String,
        command: ReaderCommand,
        response: oneshot::Sender<()>,
    },
    SendToIndex {
        index: usize,
        command: ReaderCommand,
        response: oneshot::Sender<()>,
    },
    RegisterSink {
        sink: Arc<dyn EventSink>,
        response: oneshot::Sender<ListenerId>,
    },
    UnregisterSink {
        id: ListenerId,
        response: oneshot::Sender<bool>,
    },
    Sibling {
        mode: ReadMode,
        response: oneshot::Sender<AppResult<ReadCoordinator>>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a coordinator running on its own task.
#[derive(Clone)]
pub struct MultiReader {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<MultiReadEvent>,
}

impl MultiReader {
    /// Move `coordinator` onto a new task. Must be called inside a Tokio runtime.
    pub fn spawn(mut coordinator: ReadCoordinator) -> AppResult<Self> {
        let updates = coordinator.take_update_receiver().ok_or_else(|| {
            MultiReadError::Configuration("coordinator is already driven elsewhere".to_string())
        })?;
        let broadcast = BroadcastSink::new(EVENT_CAPACITY);
        let events = broadcast.sender();
        coordinator.register_sink(Arc::new(broadcast));

        let (commands, command_rx) = mpsc::unbounded_channel();
        let actor = MultiReaderActor {
            coordinator,
            commands: command_rx,
            updates,
        };
        tokio::spawn(actor.run());
        Ok(Self { commands, events })
    }

    /// Receive every update and completed cycle from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MultiReadEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> AppResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| MultiReadError::ChannelClosed)?;
        rx.await.map_err(|_| MultiReadError::ChannelClosed)
    }

    /// See [`ReadCoordinator::set_sources`].
    pub async fn set_sources(&self, names: Vec<String>) -> AppResult<()> {
        self.request(|response| Command::SetSources { names, response })
            .await?
    }

    /// See [`ReadCoordinator::insert_source`].
    pub async fn insert_source(&self, name: impl Into<String>, index: isize) -> AppResult<()> {
        let name = name.into();
        self.request(|response| Command::InsertSource {
            name,
            index,
            response,
        })
        .await?
    }

    /// See [`ReadCoordinator::remove_source`].
    pub async fn remove_source(&self, name: impl Into<String>) -> AppResult<()> {
        let name = name.into();
        self.request(|response| Command::RemoveSource { name, response })
            .await
    }

    /// See [`ReadCoordinator::unset_sources`].
    pub async fn unset_sources(&self) -> AppResult<()> {
        self.request(|response| Command::UnsetSources { response })
            .await
    }

    /// See [`ReadCoordinator::sources`].
    pub async fn sources(&self) -> AppResult<Vec<String>> {
        self.request(|response| Command::Sources { response }).await
    }

    /// See [`ReadCoordinator::start_read`].
    pub async fn start_read(&self) -> AppResult<()> {
        self.request(|response| Command::StartRead { response })
            .await
    }

    /// See [`ReadCoordinator::set_period`].
    pub async fn set_period(&self, ms: i64) -> AppResult<()> {
        self.request(|response| Command::SetPeriod { ms, response })
            .await
    }

    /// See [`ReadCoordinator::period`].
    pub async fn period(&self) -> AppResult<i64> {
        self.request(|response| Command::Period { response }).await
    }

    /// See [`ReadCoordinator::set_mode`].
    pub async fn set_mode(&self, mode: ReadMode) -> AppResult<()> {
        self.request(|response| Command::SetMode { mode, response })
            .await
    }

    /// See [`ReadCoordinator::mode`].
    pub async fn mode(&self) -> AppResult<ReadMode> {
        self.request(|response| Command::Mode { response }).await
    }

    /// See [`ReadCoordinator::send_to`].
    pub async fn send_to(&self, name: impl Into<String>, command: ReaderCommand) -> AppResult<()> {
        let name = name.into();
        self.request(|response| Command::SendTo {
            name,
            command,
            response,
        })
        .await
    }

    /// See [`ReadCoordinator::send_to_index`].
    pub async fn send_to_index(&self, index: usize, command: ReaderCommand) -> AppResult<()> {
        self.request(|response| Command::SendToIndex {
            index,
            command,
            response,
        })
        .await
    }

    /// See [`ReadCoordinator::register_sink`].
    pub async fn register_sink(&self, sink: Arc<dyn EventSink>) -> AppResult<ListenerId> {
        self.request(|response| Command::RegisterSink { sink, response })
            .await
    }

    /// See [`ReadCoordinator::unregister_sink`].
    pub async fn unregister_sink(&self, id: ListenerId) -> AppResult<bool> {
        self.request(|response| Command::UnregisterSink { id, response })
            .await
    }

    /// Spawn a sequential sibling sharing this reader's context.
    pub async fn sequential_sibling(&self, manual: bool) -> AppResult<MultiReader> {
        let mode = if manual {
            ReadMode::SequentialManual
        } else {
            ReadMode::Sequential
        };
        self.sibling(mode).await
    }

    /// Spawn a concurrent sibling sharing this reader's context.
    pub async fn concurrent_sibling(&self) -> AppResult<MultiReader> {
        self.sibling(ReadMode::Concurrent).await
    }

    async fn sibling(&self, mode: ReadMode) -> AppResult<MultiReader> {
        let coordinator = self
            .request(|response| Command::Sibling { mode, response })
            .await??;
        MultiReader::spawn(coordinator)
    }

    /// Dispose every reader and stop the task.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(|response| Command::Shutdown { response })
            .await
    }
}

impl std::fmt::Debug for MultiReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiReader")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

struct MultiReaderActor {
    coordinator: ReadCoordinator,
    commands: mpsc::UnboundedReceiver<Command>,
    updates: mpsc::UnboundedReceiver<ReaderUpdate>,
}

impl MultiReaderActor {
    async fn run(mut self) {
        info!(mode = ?self.coordinator.mode(), "multi reader task started");
        loop {
            let deadline = self.coordinator.timer_deadline();
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle(command) {
                                break;
                            }
                        }
                        None => {
                            debug!("all handles dropped");
                            break;
                        }
                    }
                }
                Some(update) = self.updates.recv() => {
                    self.coordinator.handle_reader_update(update);
                }
                () = wait_until(deadline) => {
                    self.coordinator.handle_timer_expired(Instant::now());
                }
            }
        }
        self.coordinator.unset_sources();
        info!("multi reader task stopped");
    }

    // Returns false when the loop should stop.
    fn handle(&mut self, command: Command) -> bool {
        let coord = &mut self.coordinator;
        match command {
            Command::SetSources { names, response } => {
                let _ = response.send(coord.set_sources(&names));
            }
            Command::InsertSource {
                name,
                index,
                response,
            } => {
                let _ = response.send(coord.insert_source(&name, index));
            }
            Command::RemoveSource { name, response } => {
                coord.remove_source(&name);
                let _ = response.send(());
            }
            Command::UnsetSources { response } => {
                coord.unset_sources();
                let _ = response.send(());
            }
            Command::Sources { response } => {
                let _ = response.send(coord.sources());
            }
            Command::StartRead { response } => {
                coord.start_read();
                let _ = response.send(());
            }
            Command::SetPeriod { ms, response } => {
                coord.set_period(ms);
                let _ = response.send(());
            }
            Command::Period { response } => {
                let _ = response.send(coord.period());
            }
            Command::SetMode { mode, response } => {
                coord.set_mode(mode);
                let _ = response.send(());
            }
            Command::Mode { response } => {
                let _ = response.send(coord.mode());
            }
            Command::SendTo {
                name,
                command,
                response,
            } => {
                coord.send_to(&name, command);
                let _ = response.send(());
            }
            Command::SendToIndex {
                index,
                command,
                response,
            } => {
                coord.send_to_index(index, command);
                let _ = response.send(());
            }
            Command::RegisterSink { sink, response } => {
                let _ = response.send(coord.register_sink(sink));
            }
            Command::UnregisterSink { id, response } => {
                let _ = response.send(coord.unregister_sink(id));
            }
            Command::Sibling { mode, response } => {
                let sibling = match mode {
                    ReadMode::Concurrent => coord.concurrent_sibling(),
                    ReadMode::Sequential => coord.sequential_sibling(false),
                    ReadMode::SequentialManual => coord.sequential_sibling(true),
                };
                let _ = response.send(sibling);
            }
            Command::Shutdown { response } => {
                info!("shutdown requested");
                coord.unset_sources();
                let _ = response.send(());
                return false;
            }
        }
        true
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
