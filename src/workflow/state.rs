//! Workflow states and the transition table.
//!
//! `transition` is a pure function of the current state, the inbound event and a read-only
//! view of the node. It decides the next state(s) and the side effects; the node actor applies
//! them. Keeping it free of I/O lets every row of the table be tested without a runtime.

use crate::config::{ChannelGain, Settings, WorkflowSettings};
use crate::messages::{CommandKind, EventKind, InboundEvent};
use crate::naming::{clamp_gain, exp_channel_index, gain_field_coords, image_name, ImageCoords};
use crate::sample::key::{CHANNEL_NAME, FIELD_X, FIELD_Y, WELL_X, WELL_Y, Z_SLICE};
use crate::sample::{Attributes, ChannelId, ContainerPath};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Why a node ended in `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum FailureReason {
    /// A deadline expired while waiting in `state`.
    Timeout {
        /// State the node was waiting in.
        state: String,
    },
    /// A collaborator reported an unrecoverable failure.
    Collaborator {
        /// Collaborator that failed.
        collaborator: String,
        /// Reported cause.
        reason: String,
    },
    /// No gain was reported and the channel has no default.
    MissingGain,
    /// The run was shut down while a command of this node was outstanding.
    Cancelled {
        /// State the node was waiting in.
        state: String,
    },
}

impl FailureReason {
    /// Stable machine-readable code, the same as the serialized `code` tag.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Timeout { .. } => "timeout",
            FailureReason::Collaborator { .. } => "collaborator",
            FailureReason::MissingGain => "missing_gain",
            FailureReason::Cancelled { .. } => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout { state } => write!(f, "timeout in {}", state),
            FailureReason::Collaborator {
                collaborator,
                reason,
            } => write!(f, "{} failed: {}", collaborator, reason),
            FailureReason::MissingGain => f.write_str("no gain reported and no default gain"),
            FailureReason::Cancelled { state } => write!(f, "run cancelled in {}", state),
        }
    }
}

/// Per-node workflow state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowState {
    /// Known but not yet specified for acquisition.
    Pending,
    /// Gain estimation requested.
    AwaitingGain,
    /// Gain applied, acquisition job requested.
    Ready,
    /// The microscope accepted the job.
    Imaging,
    /// Image saved, rename requested.
    Imaged,
    /// Rename confirmed, finishing up.
    Renaming,
    /// Terminal success.
    Done,
    /// Terminal failure.
    Error {
        /// What went wrong.
        reason: FailureReason,
    },
}

impl WorkflowState {
    /// Snake-case name, the same as the serialized `state` tag.
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowState::Pending => "pending",
            WorkflowState::AwaitingGain => "awaiting_gain",
            WorkflowState::Ready => "ready",
            WorkflowState::Imaging => "imaging",
            WorkflowState::Imaged => "imaged",
            WorkflowState::Renaming => "renaming",
            WorkflowState::Done => "done",
            WorkflowState::Error { .. } => "error",
        }
    }

    /// `Done` or `Error`; no event moves a node out of these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Done | WorkflowState::Error { .. })
    }

    /// True for `Error`.
    pub fn is_error(&self) -> bool {
        matches!(self, WorkflowState::Error { .. })
    }

    /// How long the node may stay in this state before it times out.
    pub fn deadline(&self, settings: &WorkflowSettings) -> Option<Duration> {
        match self {
            WorkflowState::AwaitingGain => Some(settings.gain_timeout),
            WorkflowState::Imaging => Some(settings.imaging_timeout),
            _ => None,
        }
    }

    /// State entered when the deadline of this state expires.
    pub fn on_deadline(&self) -> Option<WorkflowState> {
        matches!(self, WorkflowState::AwaitingGain | WorkflowState::Imaging).then(|| {
            WorkflowState::Error {
                reason: FailureReason::Timeout {
                    state: self.name().to_string(),
                },
            }
        })
    }

    /// State entered when the run is cancelled in this state.
    ///
    /// Every state between issuing a command and seeing it complete fails with
    /// `Cancelled`, because the completion event can no longer arrive. `Pending` has nothing
    /// outstanding and is kept.
    pub fn on_cancel(&self) -> Option<WorkflowState> {
        matches!(
            self,
            WorkflowState::AwaitingGain
                | WorkflowState::Ready
                | WorkflowState::Imaging
                | WorkflowState::Imaged
                | WorkflowState::Renaming
        )
        .then(|| WorkflowState::Error {
            reason: FailureReason::Cancelled {
                state: self.name().to_string(),
            },
        })
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Error { reason } => write!(f, "error ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// A side effect of a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Merge attributes into the node.
    SetAttributes(Attributes),
    /// Send a command to a collaborator.
    Command {
        /// Command to send.
        kind: CommandKind,
        /// Command parameters.
        parameters: Attributes,
    },
}

/// States entered, in order, and the effects to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// States entered, the last one is where the node stays.
    pub steps: Vec<WorkflowState>,
    /// Effects, applied before the steps.
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(state: WorkflowState) -> Self {
        Self {
            steps: vec![state],
            effects: Vec::new(),
        }
    }

    fn effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    /// The state the node ends up in.
    pub fn target(&self) -> Option<&WorkflowState> {
        self.steps.last()
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The event moves the node.
    Advance(Transition),
    /// The event has no meaning in the current state.
    Ignore,
}

/// Read-only view of the node an event is applied to.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    /// Path of the node.
    pub path: &'a ContainerPath,
    /// Current attributes of the node.
    pub attributes: &'a Attributes,
    /// Run settings.
    pub settings: &'a Settings,
}

/// The transition table.
pub fn transition(
    state: &WorkflowState,
    event: &InboundEvent,
    ctx: &TransitionContext<'_>,
) -> Outcome {
    if state.is_terminal() {
        return Outcome::Ignore;
    }

    match (state, event.kind) {
        (_, EventKind::CollaboratorFailed) => {
            Outcome::Advance(Transition::to(WorkflowState::Error {
                reason: FailureReason::Collaborator {
                    collaborator: event
                        .text("collaborator")
                        .unwrap_or_else(|| "unknown".to_string()),
                    reason: event.text("reason").unwrap_or_default(),
                },
            }))
        }

        (WorkflowState::Pending, EventKind::ContainerSpecified) => {
            let mut parameters = Attributes::new();
            if let Some(layout) = ctx.settings.well_layout {
                let (x, y) = gain_field_coords(layout.x_fields, layout.y_fields);
                parameters.insert(FIELD_X.to_string(), x.into());
                parameters.insert(FIELD_Y.to_string(), y.into());
            }
            Outcome::Advance(Transition::to(WorkflowState::AwaitingGain).effect(Effect::Command {
                kind: CommandKind::EstimateGain,
                parameters,
            }))
        }

        (WorkflowState::AwaitingGain, EventKind::GainComputed) => {
            let policy = channel_policy(event, ctx);
            let reported = reported_gain(event);
            let gain = match policy {
                Some(policy) => clamp_gain(reported, policy),
                None => reported,
            };
            let Some(gain) = gain else {
                return Outcome::Advance(Transition::to(WorkflowState::Error {
                    reason: FailureReason::MissingGain,
                }));
            };

            let mut attributes = Attributes::new();
            attributes.insert("gain".to_string(), gain.into());
            let mut parameters = attributes.clone();
            if let Some(policy) = policy {
                parameters.insert("channel".to_string(), policy.channel.clone().into());
                parameters.insert("job_name".to_string(), policy.job_name.clone().into());
                parameters.insert("detector_num".to_string(), policy.detector_num.into());
            }
            Outcome::Advance(
                Transition::to(WorkflowState::Ready)
                    .effect(Effect::SetAttributes(attributes))
                    .effect(Effect::Command {
                        kind: CommandKind::StartAcquisition,
                        parameters,
                    }),
            )
        }

        (WorkflowState::Ready, EventKind::JobAccepted) => {
            Outcome::Advance(Transition::to(WorkflowState::Imaging))
        }

        (WorkflowState::Imaging, EventKind::ImageSaved) => {
            let mut parameters = Attributes::new();
            if let Some(old_path) = event.text("path") {
                parameters.insert("old_path".to_string(), old_path.into());
            }
            let coords = image_coords(event, ctx);
            parameters.insert("new_name".to_string(), image_name(&coords).into());
            Outcome::Advance(Transition::to(WorkflowState::Imaged).effect(Effect::Command {
                kind: CommandKind::RenameImage,
                parameters,
            }))
        }

        (WorkflowState::Imaged, EventKind::RenameConfirmed) => {
            let mut attributes = Attributes::new();
            attributes.insert("img_ok".to_string(), Value::Bool(true));
            Outcome::Advance(Transition {
                steps: vec![WorkflowState::Renaming, WorkflowState::Done],
                effects: vec![Effect::SetAttributes(attributes)],
            })
        }

        _ => Outcome::Ignore,
    }
}

/// Gain policy for the event's channel: the event's own channel name, the node's stored
/// name, then the channel segment of the path.
fn channel_policy<'a>(
    event: &InboundEvent,
    ctx: &TransitionContext<'a>,
) -> Option<&'a ChannelGain> {
    let mut candidates = vec![event.text(CHANNEL_NAME), event.text("channel")];
    if let Some(Value::String(name)) = ctx.attributes.get(CHANNEL_NAME) {
        candidates.push(Some(name.clone()));
    }
    candidates.push(ctx.path.channel_id().map(ChannelId::to_string));
    candidates
        .into_iter()
        .flatten()
        .find_map(|name| ctx.settings.channel(&name))
}

fn reported_gain(event: &InboundEvent) -> Option<u32> {
    let value = match event.payload.get("gain")? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (value.is_finite() && value >= 0.0 && value <= f64::from(u32::MAX))
        .then(|| value.round() as u32)
}

fn payload_u32(event: &InboundEvent, keys: &[&str]) -> Option<u32> {
    keys.iter()
        .find_map(|key| event.text(key))
        .and_then(|text| text.trim().parse().ok())
}

fn image_coords(event: &InboundEvent, ctx: &TransitionContext<'_>) -> ImageCoords {
    let path = ctx.path;
    let (well_x, well_y) = path.well_coords().unwrap_or_else(|| {
        (
            payload_u32(event, &[WELL_X]).unwrap_or(0),
            payload_u32(event, &[WELL_Y]).unwrap_or(0),
        )
    });
    let (field_x, field_y) = path.field_coords().unwrap_or_else(|| {
        (
            payload_u32(event, &[FIELD_X]).unwrap_or(0),
            payload_u32(event, &[FIELD_Y]).unwrap_or(0),
        )
    });
    let z_slice = path
        .z_index()
        .or_else(|| payload_u32(event, &[Z_SLICE, "z_slice_id"]))
        .unwrap_or(0);
    let job_id = payload_u32(event, &["job_id"]).unwrap_or(0);
    let raw_channel = match path.channel_id() {
        Some(ChannelId::Index(idx)) => Some(*idx),
        _ => payload_u32(event, &["channel_id"]),
    }
    .unwrap_or(0);
    let channel = ctx
        .settings
        .exp_job_ids
        .as_ref()
        .and_then(|jobs| exp_channel_index(job_id, raw_channel, jobs))
        .unwrap_or(raw_channel);

    ImageCoords {
        well_x,
        well_y,
        job_id,
        field_x,
        field_y,
        z_slice,
        channel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel_path() -> ContainerPath {
        ContainerPath::plate("00")
            .well(1, 1)
            .and_then(|w| w.field(0, 1))
            .and_then(|f| f.channel(1))
            .unwrap()
    }

    fn settings() -> Settings {
        Settings::from_toml_str(
            r#"
exp_job_ids = [2, 3, 4]

[well_layout]
x_fields = 2
y_fields = 3

[[channels]]
channel = "1"
job_name = "red10x"
detector_num = 2
default_gain = 600
max_gain = 800
"#,
        )
        .unwrap()
    }

    fn apply(state: &WorkflowState, event: &InboundEvent, settings: &Settings) -> Outcome {
        let path = event.target.clone();
        let attributes = Attributes::new();
        let ctx = TransitionContext {
            path: &path,
            attributes: &attributes,
            settings,
        };
        transition(state, event, &ctx)
    }

    fn advance(outcome: Outcome) -> Transition {
        match outcome {
            Outcome::Advance(t) => t,
            Outcome::Ignore => panic!("event was ignored"),
        }
    }

    #[test]
    fn test_specified_requests_gain() {
        let settings = settings();
        let t = advance(apply(
            &WorkflowState::Pending,
            &InboundEvent::container_specified(channel_path()),
            &settings,
        ));
        assert_eq!(t.target(), Some(&WorkflowState::AwaitingGain));
        let Effect::Command { kind, parameters } = &t.effects[0] else {
            panic!("expected a command");
        };
        assert_eq!(*kind, CommandKind::EstimateGain);
        assert_eq!(parameters.get(FIELD_X), Some(&json!(1)));
        assert_eq!(parameters.get(FIELD_Y), Some(&json!(1)));
    }

    #[test]
    fn test_gain_is_clamped_and_stored() {
        let settings = settings();
        let event = InboundEvent::gain_computed(channel_path(), Some(950.0));
        let t = advance(apply(&WorkflowState::AwaitingGain, &event, &settings));
        assert_eq!(t.target(), Some(&WorkflowState::Ready));
        assert_eq!(
            t.effects[0],
            Effect::SetAttributes([("gain".to_string(), json!(800))].into())
        );
        let Effect::Command { kind, parameters } = &t.effects[1] else {
            panic!("expected a command");
        };
        assert_eq!(*kind, CommandKind::StartAcquisition);
        assert_eq!(parameters.get("job_name"), Some(&json!("red10x")));
        assert_eq!(parameters.get("detector_num"), Some(&json!(2)));
    }

    #[test]
    fn test_missing_gain_uses_default_or_fails() {
        let settings = settings();
        let t = advance(apply(
            &WorkflowState::AwaitingGain,
            &InboundEvent::gain_computed(channel_path(), None),
            &settings,
        ));
        assert_eq!(
            t.effects[0],
            Effect::SetAttributes([("gain".to_string(), json!(600))].into())
        );

        let well = ContainerPath::plate("00").well(0, 0).unwrap();
        let t = advance(apply(
            &WorkflowState::AwaitingGain,
            &InboundEvent::gain_computed(well, None),
            &Settings::default(),
        ));
        assert_eq!(
            t.target(),
            Some(&WorkflowState::Error {
                reason: FailureReason::MissingGain
            })
        );
    }

    #[test]
    fn test_gain_in_pending_is_ignored() {
        let event = InboundEvent::gain_computed(channel_path(), Some(500.0));
        assert_eq!(
            apply(&WorkflowState::Pending, &event, &Settings::default()),
            Outcome::Ignore
        );
    }

    #[test]
    fn test_image_saved_requests_rename() {
        let settings = settings();
        let event = InboundEvent::image_saved(channel_path(), "/data/raw.tif").with("job_id", 3);
        let t = advance(apply(&WorkflowState::Imaging, &event, &settings));
        assert_eq!(t.target(), Some(&WorkflowState::Imaged));
        let Effect::Command { kind, parameters } = &t.effects[0] else {
            panic!("expected a command");
        };
        assert_eq!(*kind, CommandKind::RenameImage);
        assert_eq!(parameters.get("old_path"), Some(&json!("/data/raw.tif")));
        assert_eq!(
            parameters.get("new_name"),
            Some(&json!("U01--V01--E03--X00--Y01--Z00--C02.ome.tif"))
        );
    }

    #[test]
    fn test_rename_confirmed_finishes() {
        let t = advance(apply(
            &WorkflowState::Imaged,
            &InboundEvent::rename_confirmed(channel_path()),
            &Settings::default(),
        ));
        assert_eq!(t.steps, vec![WorkflowState::Renaming, WorkflowState::Done]);
        assert_eq!(
            t.effects,
            vec![Effect::SetAttributes(
                [("img_ok".to_string(), json!(true))].into()
            )]
        );
    }

    #[test]
    fn test_failure_from_any_non_terminal_state() {
        let event = InboundEvent::collaborator_failed(channel_path(), "microscope", "offline");
        for state in [
            WorkflowState::Pending,
            WorkflowState::AwaitingGain,
            WorkflowState::Ready,
            WorkflowState::Imaging,
            WorkflowState::Imaged,
        ] {
            let t = advance(apply(&state, &event, &Settings::default()));
            assert!(t.target().is_some_and(WorkflowState::is_error));
        }
        assert_eq!(
            apply(&WorkflowState::Done, &event, &Settings::default()),
            Outcome::Ignore
        );
    }

    #[test]
    fn test_deadlines() {
        let workflow = WorkflowSettings::default();
        assert!(WorkflowState::AwaitingGain.deadline(&workflow).is_some());
        assert!(WorkflowState::Imaging.deadline(&workflow).is_some());
        assert!(WorkflowState::Ready.deadline(&workflow).is_none());

        let timed_out = WorkflowState::Imaging.on_deadline().unwrap();
        match &timed_out {
            WorkflowState::Error { reason } => assert_eq!(reason.code(), "timeout"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(WorkflowState::Done.on_deadline().is_none());
    }

    #[test]
    fn test_cancel_fails_states_with_outstanding_commands() {
        assert_eq!(WorkflowState::Pending.on_cancel(), None);
        assert_eq!(WorkflowState::Done.on_cancel(), None);
        assert_eq!(
            WorkflowState::Imaging.on_cancel(),
            Some(WorkflowState::Error {
                reason: FailureReason::Cancelled {
                    state: "imaging".to_string()
                }
            })
        );
        let cancelled = WorkflowState::Ready.on_cancel().unwrap();
        assert!(cancelled.is_terminal());
        assert_eq!(cancelled.to_string(), "error (run cancelled in ready)");
    }

    #[test]
    fn test_well_layout_is_optional() {
        let mut settings = settings();
        settings.well_layout = None;
        let t = advance(apply(
            &WorkflowState::Pending,
            &InboundEvent::container_specified(channel_path()),
            &settings,
        ));
        assert_eq!(
            t.effects,
            vec![Effect::Command {
                kind: CommandKind::EstimateGain,
                parameters: Attributes::new()
            }]
        );
    }
}
