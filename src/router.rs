//! Event router.
//!
//! The router is the single entry point for inbound events. It resolves the target node
//! (creating it on demand), forwards the event to that node's actor and hands every command a
//! node emits to the addressed collaborator. It owns the node mailboxes, so per-node delivery
//! order is the order in which events were dispatched.
//!
//! The router itself runs as an actor. [`RouterHandle`] is the cloneable front end:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use sample_flow::{collaborators::CollaboratorSet, config::Settings, sample::*};
//! # use sample_flow::{messages::InboundEvent, router::RouterHandle};
//! # async fn demo() -> sample_flow::error::FlowResult<()> {
//! let store = Arc::new(SampleStore::new());
//! let settings = Arc::new(Settings::default());
//! let (router, _task) = RouterHandle::spawn(store, settings, CollaboratorSet::logging());
//! let well = ContainerPath::plate("00").well(0, 0)?;
//! router.dispatch(InboundEvent::container_specified(well)).await?;
//! let report = router.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::collaborators::CollaboratorSet;
use crate::config::Settings;
use crate::error::{FlowError, FlowResult};
use crate::messages::{
    InboundEvent, NodeMessage, OutboundCommand, RawEvent, RouterCommand, StateChange,
};
use crate::report::{NodeReport, RunReport};
use crate::sample::{Attributes, ContainerPath, SampleStore};
use crate::workflow::{NodeActor, NodeOutput};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a node may take to stop after shutdown is signalled.
const NODE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffered state changes per subscriber.
const CHANGE_CAPACITY: usize = 1024;

struct NodeSlot {
    mailbox: mpsc::Sender<NodeMessage>,
    task: JoinHandle<NodeReport>,
    last: NodeReport,
}

/// The router actor. Use [`RouterHandle::spawn`] to start one.
pub struct EventRouter {
    store: Arc<SampleStore>,
    settings: Arc<Settings>,
    collaborators: CollaboratorSet,
    nodes: HashMap<ContainerPath, NodeSlot>,
    output_tx: mpsc::UnboundedSender<NodeOutput>,
    output_rx: mpsc::UnboundedReceiver<NodeOutput>,
    changes: broadcast::Sender<StateChange>,
    shutdown: watch::Sender<bool>,
    finished: bool,
}

impl EventRouter {
    fn new(
        store: Arc<SampleStore>,
        settings: Arc<Settings>,
        collaborators: CollaboratorSet,
        changes: broadcast::Sender<StateChange>,
    ) -> Self {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            settings,
            collaborators,
            nodes: HashMap::new(),
            output_tx,
            output_rx,
            changes,
            shutdown,
            finished: false,
        }
    }

    /// Main loop: router commands and node outputs, until shutdown.
    pub async fn run(mut self, mut commands: mpsc::Receiver<RouterCommand>) {
        info!("Event router started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(RouterCommand::Dispatch { event, response }) => {
                        let result = self.dispatch(event).await;
                        let _ = response.send(result);
                    }
                    Some(RouterCommand::Report { response }) => {
                        let report = self.report().await;
                        let _ = response.send(report);
                    }
                    Some(RouterCommand::Shutdown { response }) => {
                        let report = self.shutdown().await;
                        let _ = response.send(report);
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(output) = self.output_rx.recv() => self.handle_output(output).await,
            }
        }
        info!("Event router stopped");
    }

    async fn dispatch(&mut self, event: InboundEvent) -> FlowResult<()> {
        let path = event.target.clone();
        if !self.store.contains(&path) {
            info!("Creating {} '{}' on demand for {}", path.kind(), path, event.kind);
        }
        self.store.upsert_path(&path, Attributes::new());

        if !self.settings.workflow.tracks(path.kind()) {
            warn!(
                "Ignoring {} for '{}': {} nodes do not run the workflow",
                event.kind,
                path,
                path.kind()
            );
            return Ok(());
        }

        let mailbox = self.mailbox(&path);
        mailbox
            .send(NodeMessage::Event(event))
            .await
            .map_err(|_| FlowError::NotFound(path.to_string()))
    }

    /// Mailbox of the node at `path`, spawning its actor on first use.
    fn mailbox(&mut self, path: &ContainerPath) -> mpsc::Sender<NodeMessage> {
        if let Some(slot) = self.nodes.get(path) {
            return slot.mailbox.clone();
        }

        let actor = NodeActor::new(
            &self.store,
            path,
            self.settings.clone(),
            self.output_tx.clone(),
        );
        let last = actor.report();
        let (tx, rx) = mpsc::channel(self.settings.workflow.mailbox_capacity);
        let task = tokio::spawn(actor.run(rx, self.shutdown.subscribe()));
        debug!("Spawned node actor for '{}'", path);

        self.nodes.insert(
            path.clone(),
            NodeSlot {
                mailbox: tx.clone(),
                task,
                last,
            },
        );
        tx
    }

    async fn handle_output(&mut self, output: NodeOutput) {
        match output {
            NodeOutput::Command(command) => self.forward(command).await,
            NodeOutput::Changed(change) => {
                if let Some(slot) = self.nodes.get_mut(&change.path) {
                    slot.last.state = change.to.clone();
                    slot.last.updated_at = change.at;
                }
                // No subscribers is fine.
                let _ = self.changes.send(change);
                self.check_finished();
            }
        }
    }

    /// Hands a command to its collaborator. A rejected delivery fails the issuing node.
    async fn forward(&mut self, command: OutboundCommand) {
        let target = command.target.clone();
        let collaborator = command.kind.collaborator();
        debug!("Forwarding {} for '{}' to {}", command.kind, target, collaborator);

        if let Err(err) = self.collaborators.deliver(command).await {
            error!("Delivery to {} for '{}' failed: {}", collaborator, target, err);
            let reason = match err {
                FlowError::FatalCollaborator { reason, .. } => reason,
                other => other.to_string(),
            };
            let failed = InboundEvent::collaborator_failed(target, collaborator.as_str(), reason);
            if let Err(err) = self.dispatch(failed).await {
                warn!("Could not report delivery failure: {}", err);
            }
        }
    }

    fn check_finished(&mut self) {
        if self.finished || self.nodes.is_empty() {
            return;
        }
        if self.nodes.values().all(|slot| slot.last.state.is_terminal()) {
            self.finished = true;
            let failed = self
                .nodes
                .values()
                .filter(|slot| slot.last.state.is_error())
                .count();
            info!(
                "Run finished: {} nodes done, {} failed",
                self.nodes.len() - failed,
                failed
            );
        }
    }

    async fn report(&mut self) -> RunReport {
        while let Ok(output) = self.output_rx.try_recv() {
            self.handle_output(output).await;
        }

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for slot in self.nodes.values() {
            let (tx, rx) = oneshot::channel();
            let snapshot = match slot.mailbox.send(NodeMessage::Snapshot { response: tx }).await {
                Ok(()) => rx.await.ok(),
                Err(_) => None,
            };
            nodes.push(snapshot.unwrap_or_else(|| slot.last.clone()));
        }
        RunReport::new(nodes, false)
    }

    async fn shutdown(&mut self) -> RunReport {
        info!("Shutting down event router ({} nodes)", self.nodes.len());
        // Fails only when no node was ever spawned.
        let _ = self.shutdown.send(true);

        let slots: Vec<_> = self.nodes.drain().collect();
        let mut nodes = Vec::with_capacity(slots.len());
        for (path, slot) in slots {
            let NodeSlot {
                mailbox,
                mut task,
                last,
            } = slot;
            drop(mailbox);
            match tokio::time::timeout(NODE_SHUTDOWN_TIMEOUT, &mut task).await {
                Ok(Ok(report)) => nodes.push(report),
                Ok(Err(e)) => {
                    warn!("Node '{}' task failed during shutdown: {}", path, e);
                    nodes.push(self.cancel_stopped(last));
                }
                Err(_) => {
                    warn!(
                        "Node '{}' did not stop within {:?}, aborting",
                        path, NODE_SHUTDOWN_TIMEOUT
                    );
                    task.abort();
                    nodes.push(self.cancel_stopped(last));
                }
            }
        }

        while let Ok(output) = self.output_rx.try_recv() {
            match output {
                NodeOutput::Command(command) => warn!(
                    "Dropping {} for '{}' after shutdown",
                    command.kind, command.target
                ),
                NodeOutput::Changed(change) => {
                    let _ = self.changes.send(change);
                }
            }
        }
        RunReport::new(nodes, true)
    }

    /// Cancels a node whose actor could not do it itself, publishing the change.
    fn cancel_stopped(&self, mut last: NodeReport) -> NodeReport {
        let Some(next) = last.state.on_cancel() else {
            return last;
        };
        let from = std::mem::replace(&mut last.state, next);
        last.updated_at = Utc::now();
        error!("Node '{}' cancelled in {}", last.path, from);
        let _ = self.changes.send(StateChange {
            path: last.path.clone(),
            from,
            to: last.state.clone(),
            at: last.updated_at,
        });
        last
    }
}

/// Cloneable handle to a running router.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterCommand>,
    changes: broadcast::Sender<StateChange>,
}

impl RouterHandle {
    /// Spawns the router actor on the current runtime.
    pub fn spawn(
        store: Arc<SampleStore>,
        settings: Arc<Settings>,
        collaborators: CollaboratorSet,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.workflow.mailbox_capacity);
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let router = EventRouter::new(store, settings, collaborators, changes.clone());
        let task = tokio::spawn(router.run(rx));
        (Self { tx, changes }, task)
    }

    /// Routes an event. Returns once the event is queued for its node.
    pub async fn dispatch(&self, event: InboundEvent) -> FlowResult<()> {
        let (command, rx) = RouterCommand::dispatch(event);
        self.tx
            .send(command)
            .await
            .map_err(|_| FlowError::RouterClosed)?;
        rx.await.map_err(|_| FlowError::RouterClosed)?
    }

    /// Routes an event in wire form. Unknown event types are logged and dropped.
    pub async fn dispatch_raw(&self, raw: RawEvent) -> FlowResult<()> {
        match InboundEvent::from_raw(raw) {
            Ok(event) => self.dispatch(event).await,
            Err(err @ FlowError::UnrecognizedEvent { .. }) => {
                warn!("{}; ignoring", err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Current state of every tracked node.
    pub async fn report(&self) -> FlowResult<RunReport> {
        let (command, rx) = RouterCommand::report();
        self.tx
            .send(command)
            .await
            .map_err(|_| FlowError::RouterClosed)?;
        rx.await.map_err(|_| FlowError::RouterClosed)
    }

    /// Stops dispatching, stops every node and returns the final report.
    ///
    /// Nodes with an outstanding command end in `Error` with a `Cancelled` reason.
    pub async fn shutdown(&self) -> FlowResult<RunReport> {
        let (command, rx) = RouterCommand::shutdown();
        self.tx
            .send(command)
            .await
            .map_err(|_| FlowError::RouterClosed)?;
        rx.await.map_err(|_| FlowError::RouterClosed)
    }

    /// Stream of every state change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}
