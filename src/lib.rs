//! Core library for plate microscopy sample workflows.
//!
//! The crate models the physical sample hierarchy of an acquisition (plate → well → field →
//! channel / z-slice), builds it from a declarative CSV file and drives a per-node acquisition
//! workflow that reacts to collaborator events with outbound commands.
//!
//! - [`sample`]: the shared hierarchy and its CSV loader
//! - [`workflow`]: workflow states, the transition table and per-node actors
//! - [`router`]: the single entry point for inbound events
//! - [`collaborators`]: the seam to gain estimation, microscope control and file renaming
//! - [`run`]: wires the pieces together from a [`config::Settings`] document

pub mod collaborators;
pub mod config;
pub mod error;
pub mod messages;
pub mod naming;
pub mod report;
pub mod router;
pub mod run;
pub mod sample;
pub mod workflow;

pub use error::{FlowError, FlowResult};
