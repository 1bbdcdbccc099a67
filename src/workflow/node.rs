//! Node actor.
//!
//! Each tracked node runs as its own task that owns its `WorkflowState`. Events for the node
//! arrive through a bounded mailbox and are applied one at a time, which serializes processing
//! per node while unrelated nodes run concurrently. A single optional deadline models the
//! `AwaitingGain` / `Imaging` timeouts and is replaced on every state change.
//!
//! Outbound commands and state changes go back to the router over an unbounded channel so a
//! node never waits on the router.

use super::state::{transition, Effect, Outcome, TransitionContext, WorkflowState};
use crate::config::Settings;
use crate::error::FlowError;
use crate::messages::{InboundEvent, NodeMessage, OutboundCommand, StateChange};
use crate::report::NodeReport;
use crate::sample::{Attributes, ContainerPath, NodeRef, SampleStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// What a node sends back to the router.
#[derive(Debug)]
pub enum NodeOutput {
    /// A command for a collaborator.
    Command(OutboundCommand),
    /// The node entered a new state.
    Changed(StateChange),
}

/// Workflow driver of one container.
pub struct NodeActor {
    node: NodeRef,
    state: WorkflowState,
    deadline: Option<Instant>,
    updated_at: DateTime<Utc>,
    settings: Arc<Settings>,
    output: mpsc::UnboundedSender<NodeOutput>,
}

impl NodeActor {
    /// Creates the actor in `Pending`, creating the node in `store` if needed.
    pub fn new(
        store: &SampleStore,
        path: &ContainerPath,
        settings: Arc<Settings>,
        output: mpsc::UnboundedSender<NodeOutput>,
    ) -> Self {
        Self {
            node: store.upsert_path(path, Attributes::new()),
            state: WorkflowState::Pending,
            deadline: None,
            updated_at: Utc::now(),
            settings,
            output,
        }
    }

    /// Path of the driven node.
    pub fn path(&self) -> &ContainerPath {
        self.node.path()
    }

    /// Current workflow state.
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Snapshot of the node.
    pub fn report(&self) -> NodeReport {
        NodeReport {
            path: self.node.path().clone(),
            kind: self.node.kind(),
            state: self.state.clone(),
            attributes: self.node.attributes(),
            updated_at: self.updated_at,
        }
    }

    /// Runs until shutdown is signalled or the mailbox closes.
    ///
    /// Shutdown wins over queued events: anything still in the mailbox is dropped. A node
    /// waiting on an outstanding command then moves to `Error` with a `Cancelled` reason;
    /// a `Pending` or terminal node keeps its state.
    pub async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<NodeMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> NodeReport {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let deadline = self.deadline;
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                message = mailbox.recv() => match message {
                    Some(NodeMessage::Event(event)) => self.handle_event(event),
                    Some(NodeMessage::Snapshot { response }) => {
                        let _ = response.send(self.report());
                    }
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.handle_deadline();
                }
            }
        }
        self.cancel();
        debug!("Node '{}' stopped in {}", self.path(), self.state);
        self.report()
    }

    /// Applies one event through the transition table.
    pub fn handle_event(&mut self, event: InboundEvent) {
        let attributes = self.node.attributes();
        let ctx = TransitionContext {
            path: self.node.path(),
            attributes: &attributes,
            settings: &self.settings,
        };
        match transition(&self.state, &event, &ctx) {
            Outcome::Ignore => {
                let ignored = FlowError::UnrecognizedEvent {
                    event: event.kind.to_string(),
                    path: self.path().to_string(),
                    state: self.state.name().to_string(),
                };
                warn!("{}; ignoring", ignored);
            }
            Outcome::Advance(t) => {
                for effect in t.effects {
                    match effect {
                        Effect::SetAttributes(attributes) => {
                            self.node.merge(attributes);
                        }
                        Effect::Command { kind, parameters } => {
                            let command =
                                OutboundCommand::new(kind, self.node.path().clone(), parameters);
                            self.emit(NodeOutput::Command(command));
                        }
                    }
                }
                for step in t.steps {
                    self.enter(step);
                }
            }
        }
    }

    fn handle_deadline(&mut self) {
        self.deadline = None;
        if let Some(next) = self.state.on_deadline() {
            let expired = FlowError::Timeout {
                path: self.path().to_string(),
                state: self.state.name().to_string(),
            };
            warn!("{}", expired);
            self.enter(next);
        }
    }

    fn cancel(&mut self) {
        self.deadline = None;
        if let Some(next) = self.state.on_cancel() {
            self.enter(next);
        }
    }

    fn enter(&mut self, next: WorkflowState) {
        let from = std::mem::replace(&mut self.state, next);
        self.deadline = self.state.deadline(&self.settings.workflow).and_then(|timeout| {
            let deadline = Instant::now().checked_add(timeout);
            if deadline.is_none() {
                warn!(
                    "Timeout {:?} for '{}' in {} is out of range; no deadline set",
                    timeout,
                    self.path(),
                    self.state
                );
            }
            deadline
        });
        self.updated_at = Utc::now();

        match &self.state {
            WorkflowState::Error { reason } => {
                error!("Node '{}' failed in {}: {}", self.path(), from, reason)
            }
            WorkflowState::Done => info!("Node '{}' done", self.path()),
            to => debug!("Node '{}': {} -> {}", self.path(), from, to),
        }

        let change = StateChange {
            path: self.node.path().clone(),
            from,
            to: self.state.clone(),
            at: self.updated_at,
        };
        self.emit(NodeOutput::Changed(change));
    }

    fn emit(&self, output: NodeOutput) {
        if self.output.send(output).is_err() {
            debug!("Router gone; dropping output of '{}'", self.path());
        }
    }
}
