//! Error types for the sample workflow.
//!
//! `FlowError` is the single error enum of the crate. Its variants follow how far an error is
//! allowed to travel:
//!
//! - **`MalformedRow`**: a declarative row could not be turned into a node. The loader records it
//!   and moves on to the next row.
//! - **`Validation`** / **`TypeMismatch`**: a single hierarchy call broke the node contract. Only
//!   that call is rejected.
//! - **`UnrecognizedEvent`**: an event arrived that the node's current state has no transition
//!   for. It is logged and dropped.
//! - **`Timeout`** / **`FatalCollaborator`**: push one node into its `Error` state. Sibling
//!   nodes keep running.
//! - **`NothingLoaded`**: the initial load produced no node at all. This is the only load
//!   problem surfaced as a run-level failure.
//!
//! The remaining variants wrap I/O, CSV, JSON and configuration errors with `#[from]` so the
//! `?` operator can be used at the edges.

use crate::sample::NodeKind;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type FlowResult<T> = std::result::Result<T, FlowError>;

/// Errors raised by the hierarchy, the loader and the workflow.
#[derive(Error, Debug)]
pub enum FlowError {
    /// A declarative row could not be turned into a node.
    #[error("Malformed row at line {line}: {reason}")]
    MalformedRow {
        /// 1-based line of the row.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// A hierarchy call broke the node contract.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A node exists under the path but has a different kind.
    #[error("Type mismatch at '{path}': expected {expected}, found {found}")]
    TypeMismatch {
        /// Path that was looked up.
        path: String,
        /// Kind the caller asked for.
        expected: NodeKind,
        /// Kind stored under the path.
        found: NodeKind,
    },

    /// Nothing is stored under the path.
    #[error("No node at '{0}'")]
    NotFound(String),

    /// The event has no transition in the node's current state.
    #[error("Unrecognized event '{event}' for '{path}' in state {state}")]
    UnrecognizedEvent {
        /// Event type as received.
        event: String,
        /// Target of the event.
        path: String,
        /// State the node was in.
        state: String,
    },

    /// A node deadline expired.
    #[error("Timed out in state {state} at '{path}'")]
    Timeout {
        /// The timed out node.
        path: String,
        /// State it was waiting in.
        state: String,
    },

    /// A collaborator failed for good.
    #[error("Collaborator '{collaborator}' failed: {reason}")]
    FatalCollaborator {
        /// Collaborator name or kind.
        collaborator: String,
        /// Reported cause.
        reason: String,
    },

    /// Every row of the initial load failed.
    #[error("No node could be created from the sample state file ({failed} rows failed)")]
    NothingLoaded {
        /// Number of rejected rows.
        failed: usize,
    },

    /// The router is no longer running.
    #[error("Event router is closed")]
    RouterClosed,

    /// The configuration could not be read.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration was read but is not valid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<figment::Error> for FlowError {
    fn from(err: figment::Error) -> Self {
        FlowError::Config(Box::new(err))
    }
}
