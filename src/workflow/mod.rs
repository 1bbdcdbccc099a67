//! Per-node acquisition workflow.
//!
//! - [`state`]: workflow states and the pure transition table
//! - [`node`]: the actor that owns one node's state, mailbox and deadline timer

pub mod node;
pub mod state;

pub use node::{NodeActor, NodeOutput};
pub use state::{
    transition, Effect, FailureReason, Outcome, Transition, TransitionContext, WorkflowState,
};
