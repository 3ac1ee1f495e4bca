//! Custom error types for the multi reader.
//!
//! This module defines `MultiReadError`, the single error type returned by the
//! coordinator, the async driver and the configuration layer. It is built with
//! `thiserror` so that configuration errors from `figment` convert with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while loading or extracting the
//!   configuration (missing file, malformed TOML, wrong types).
//! - **`Configuration`**: Semantic problems in a configuration that parsed fine,
//!   such as an unknown log level or duplicate source names.
//! - **`NotInitialized`**: The coordinator was used before `init` established a
//!   reader context.
//! - **`InvalidIndex`**: A source insertion asked for an index the registry
//!   refuses (negative, or already owned by another source).
//! - **`Reader`**: The reader factory could not create a reader for a source.
//! - **`ChannelClosed`**: The async driver task is gone.
//!
//! None of these are fatal to a running coordinator. Operations log the
//! problem, skip the offending step and keep the cycle state machine alive.

use thiserror::Error;

/// Convenience alias for results using the multi reader error type.
pub type AppResult<T> = std::result::Result<T, MultiReadError>;

/// Primary error type for multi-source read coordination.
#[derive(Error, Debug)]
pub enum MultiReadError {
    /// Loading or extracting the configuration failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration parsed but is logically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// An operation needed a reader context but `init` was never called.
    #[error("Multi reader is not initialized: call init() first")]
    NotInitialized,

    /// The requested source index was refused by the registry.
    #[error("Invalid source index {index}: {reason}")]
    InvalidIndex {
        /// Index requested by the caller.
        index: isize,
        /// Why the index was refused.
        reason: String,
    },

    /// The reader factory failed to create a reader.
    #[error("Failed to create reader for '{name}': {source}")]
    Reader {
        /// Name the caller asked for.
        name: String,
        /// Underlying factory error.
        #[source]
        source: anyhow::Error,
    },

    /// The driver task has stopped and can no longer accept commands.
    #[error("Multi reader task has stopped")]
    ChannelClosed,
}

impl From<figment::Error> for MultiReadError {
    fn from(err: figment::Error) -> Self {
        MultiReadError::Config(Box::new(err))
    }
}

impl MultiReadError {
    /// Whether the caller can retry after changing its input.
    ///
    /// Only a stopped driver is permanent; everything else leaves the
    /// coordinator usable.
    pub fn can_recover(&self) -> bool {
        !matches!(self, MultiReadError::ChannelClosed)
    }
}
