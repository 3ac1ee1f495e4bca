//! # DAQ Multi Reader
//!
//! Coordinates reads from a set of independently addressable data sources
//! (device attributes, parameterized commands, service endpoints). Each source
//! is served by its own reader; this crate decides when reads are issued,
//! detects when a full cycle over every source has completed, and delivers
//! per-update and per-cycle events in a deterministic index order whatever
//! order the asynchronous results arrive in.
//!
//! ## Crate Structure
//!
//! - **`coordinator`**: The `ReadCoordinator` state machine: modes, cycle
//!   progression, completion and timer rearming, sibling coordinators.
//! - **`driver`**: `MultiReader`, an async handle that runs one coordinator
//!   on its own Tokio task.
//! - **`registry`**: Index ↔ name ↔ reader bookkeeping and name matching.
//! - **`buffer`**: Per-cycle result buffer keyed by index.
//! - **`timer`**: Single-shot, deadline-based cycle timer.
//! - **`reader`**: The reader contract (`ReaderFactory`, `ReaderHandle`,
//!   `ReaderCommand`, `ReadResult`).
//! - **`sink`**: Event sinks and the broadcast adapter.
//! - **`mock`**: Simulated readers for tests and demos.
//! - **`config`**: Figment-based configuration.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: The `MultiReadError` type.

pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod logging;
pub mod mock;
pub mod reader;
pub mod registry;
pub mod sink;
pub mod timer;

pub use config::{MultiReadConfig, ReadMode};
pub use coordinator::{CycleState, ReadContext, ReadCoordinator};
pub use driver::MultiReader;
pub use error::{AppResult, MultiReadError};
pub use reader::{
    ReadResult, ReaderCommand, ReaderConfig, ReaderFactory, ReaderHandle, RefreshMode,
    UpdateSender,
};
pub use sink::{BroadcastSink, EventSink, FnSink, ListenerId, MultiReadEvent};
