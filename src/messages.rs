//! Message types for the event router and node actors
//!
//! This module defines the inbound event contract (collaborators → workflow), the outbound
//! command contract (workflow → collaborators) and the control messages exchanged with the
//! router and node actors. Requests that expect an answer carry a `oneshot` sender; the helper
//! constructors return the matching receiver.

use crate::collaborators::CollaboratorKind;
use crate::error::{FlowError, FlowResult};
use crate::report::{NodeReport, RunReport};
use crate::sample::{Attributes, ContainerPath};
use crate::workflow::WorkflowState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Inbound event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The container is fully specified and may start its workflow.
    ContainerSpecified,
    /// The gain estimator reported a gain.
    GainComputed,
    /// The microscope accepted the acquisition job.
    JobAccepted,
    /// An image of the container was written to disk.
    ImageSaved,
    /// The renamer moved the image to its final name.
    RenameConfirmed,
    /// A collaborator reported an unrecoverable failure for the container.
    CollaboratorFailed,
}

impl EventKind {
    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ContainerSpecified => "container_specified",
            EventKind::GainComputed => "gain_computed",
            EventKind::JobAccepted => "job_accepted",
            EventKind::ImageSaved => "image_saved",
            EventKind::RenameConfirmed => "rename_confirmed",
            EventKind::CollaboratorFailed => "collaborator_failed",
        }
    }

    /// Accepts snake case, kebab case and space separated names.
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "container_specified" => Some(EventKind::ContainerSpecified),
            "gain_computed" => Some(EventKind::GainComputed),
            "job_accepted" => Some(EventKind::JobAccepted),
            "image_saved" => Some(EventKind::ImageSaved),
            "rename_confirmed" => Some(EventKind::RenameConfirmed),
            "collaborator_failed" => Some(EventKind::CollaboratorFailed),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{eventType, targetContainerPath, payload}` in typed form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundEvent {
    /// What happened.
    pub kind: EventKind,
    /// Container the event is about.
    pub target: ContainerPath,
    /// Event-specific data.
    pub payload: Attributes,
}

impl InboundEvent {
    /// An event with an empty payload.
    pub fn new(kind: EventKind, target: ContainerPath) -> Self {
        Self {
            kind,
            target,
            payload: Attributes::new(),
        }
    }

    /// Adds a payload entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Announce a container for acquisition.
    pub fn container_specified(target: ContainerPath) -> Self {
        Self::new(EventKind::ContainerSpecified, target)
    }

    /// Gain estimate; `None` when the estimator produced no value.
    pub fn gain_computed(target: ContainerPath, gain: Option<f64>) -> Self {
        let event = Self::new(EventKind::GainComputed, target);
        match gain {
            Some(gain) => event.with("gain", gain),
            None => event,
        }
    }

    /// The microscope accepted the job.
    pub fn job_accepted(target: ContainerPath) -> Self {
        Self::new(EventKind::JobAccepted, target)
    }

    /// `path` is where the image was written.
    pub fn image_saved(target: ContainerPath, path: impl Into<String>) -> Self {
        Self::new(EventKind::ImageSaved, target).with("path", path.into())
    }

    /// The renamer finished.
    pub fn rename_confirmed(target: ContainerPath) -> Self {
        Self::new(EventKind::RenameConfirmed, target)
    }

    /// `collaborator` failed for good.
    pub fn collaborator_failed(
        target: ContainerPath,
        collaborator: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(EventKind::CollaboratorFailed, target)
            .with("collaborator", collaborator.into())
            .with("reason", reason.into())
    }

    /// Payload entry as text; numbers are rendered, other values yield `None`.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.payload.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Builds a typed event from its loosely typed wire form.
    pub fn from_raw(raw: RawEvent) -> FlowResult<Self> {
        let target = ContainerPath::from_pairs(raw.target)?;
        let kind = EventKind::parse(&raw.event_type).ok_or_else(|| FlowError::UnrecognizedEvent {
            event: raw.event_type.clone(),
            path: target.to_string(),
            state: "any".to_string(),
        })?;
        Ok(Self {
            kind,
            target,
            payload: raw.payload,
        })
    }
}

/// Wire form of an inbound event.
///
/// `target` is the ordered identifying-field sequence of the container, e.g.
/// `[["plate_name", "00"], ["well_x", "1"], ["well_y", "1"]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event type, in any form [`EventKind::parse`] accepts.
    pub event_type: String,
    /// Ordered identifying fields of the target container.
    pub target: Vec<(String, String)>,
    /// Event-specific data.
    #[serde(default)]
    pub payload: Attributes,
}

/// Outbound command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Ask the gain estimator for a gain.
    EstimateGain,
    /// Apply the gain and start the acquisition job.
    StartAcquisition,
    /// Move a saved image to its final name.
    RenameImage,
}

impl CommandKind {
    /// Collaborator that handles this command.
    pub fn collaborator(&self) -> CollaboratorKind {
        match self {
            CommandKind::EstimateGain => CollaboratorKind::GainEstimator,
            CommandKind::StartAcquisition => CollaboratorKind::Microscope,
            CommandKind::RenameImage => CollaboratorKind::FileRenamer,
        }
    }

    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::EstimateGain => "estimate_gain",
            CommandKind::StartAcquisition => "start_acquisition",
            CommandKind::RenameImage => "rename_image",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{commandType, targetContainerPath, parameters}`; fire-and-forget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundCommand {
    /// Unique command id.
    pub id: Uuid,
    /// Command type.
    pub kind: CommandKind,
    /// Container the command is about.
    pub target: ContainerPath,
    /// Command-specific data.
    pub parameters: Attributes,
    /// When the node issued the command.
    pub issued_at: DateTime<Utc>,
}

impl OutboundCommand {
    /// A command with a fresh id, issued now.
    pub fn new(kind: CommandKind, target: ContainerPath, parameters: Attributes) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            target,
            parameters,
            issued_at: Utc::now(),
        }
    }

    /// One parameter.
    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }
}

/// A node moved from one workflow state to another.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    /// The node.
    pub path: ContainerPath,
    /// Previous state.
    pub from: WorkflowState,
    /// New state.
    pub to: WorkflowState,
    /// When the node entered `to`.
    pub at: DateTime<Utc>,
}

/// Messages accepted by a node actor.
#[derive(Debug)]
pub enum NodeMessage {
    /// Apply an event.
    Event(InboundEvent),
    /// Report the node's current state.
    Snapshot {
        /// Receives the report.
        response: oneshot::Sender<NodeReport>,
    },
}

/// Commands that can be sent to the event router.
#[derive(Debug)]
pub enum RouterCommand {
    /// Route an event to its node. Answers once the event is queued.
    Dispatch {
        /// Event to route.
        event: InboundEvent,
        /// Receives the routing result.
        response: oneshot::Sender<FlowResult<()>>,
    },

    /// Snapshot every tracked node.
    Report {
        /// Receives the report.
        response: oneshot::Sender<RunReport>,
    },

    /// Stop accepting events, stop every node and return the final report.
    Shutdown {
        /// Receives the final report.
        response: oneshot::Sender<RunReport>,
    },
}

impl RouterCommand {
    /// Dispatch command and the receiver of its answer.
    pub fn dispatch(event: InboundEvent) -> (Self, oneshot::Receiver<FlowResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Dispatch {
                event,
                response: tx,
            },
            rx,
        )
    }

    /// Report command and the receiver of the report.
    pub fn report() -> (Self, oneshot::Receiver<RunReport>) {
        let (tx, rx) = oneshot::channel();
        (Self::Report { response: tx }, rx)
    }

    /// Shutdown command and the receiver of the final report.
    pub fn shutdown() -> (Self, oneshot::Receiver<RunReport>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
