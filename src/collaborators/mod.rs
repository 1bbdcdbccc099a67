//! External collaborators
//!
//! The workflow never performs instrument I/O itself. Every outbound command is handed to the
//! collaborator registered for its [`CollaboratorKind`]; completion comes back later as an
//! inbound event through the router.
//!
//! - [`LoggingCollaborator`]: logs commands and accepts them, used by the CLI
//! - [`mock::ChannelCollaborator`]: forwards commands to a channel, used by tests and embedders

pub mod logging;
pub mod mock;

pub use logging::LoggingCollaborator;
pub use mock::ChannelCollaborator;

use crate::error::{FlowError, FlowResult};
use crate::messages::OutboundCommand;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The subsystems the workflow talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorKind {
    /// Computes detector gain for a container.
    GainEstimator,
    /// Drives stage, gain and acquisition jobs.
    Microscope,
    /// Renames saved images.
    FileRenamer,
}

impl CollaboratorKind {
    /// Every kind a run needs.
    pub const ALL: [CollaboratorKind; 3] = [
        CollaboratorKind::GainEstimator,
        CollaboratorKind::Microscope,
        CollaboratorKind::FileRenamer,
    ];

    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CollaboratorKind::GainEstimator => "gain_estimator",
            CollaboratorKind::Microscope => "microscope",
            CollaboratorKind::FileRenamer => "file_renamer",
        }
    }
}

impl fmt::Display for CollaboratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver of outbound commands.
///
/// `deliver` must return once the command has been handed off; it must not wait for the
/// physical operation to finish.
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Hands one command off.
    async fn deliver(&self, command: OutboundCommand) -> FlowResult<()>;
}

/// Collaborators of a run, one per kind.
#[derive(Default, Clone)]
pub struct CollaboratorSet {
    by_kind: HashMap<CollaboratorKind, Arc<dyn Collaborator>>,
}

impl CollaboratorSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// A set where every kind logs its commands.
    pub fn logging() -> Self {
        let mut set = Self::new();
        for kind in CollaboratorKind::ALL {
            set.register(kind, Arc::new(LoggingCollaborator::new(kind)));
        }
        set
    }

    /// Registers `collaborator` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: CollaboratorKind, collaborator: Arc<dyn Collaborator>) {
        self.by_kind.insert(kind, collaborator);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, kind: CollaboratorKind, collaborator: Arc<dyn Collaborator>) -> Self {
        self.register(kind, collaborator);
        self
    }

    /// Collaborator registered for `kind`.
    pub fn get(&self, kind: CollaboratorKind) -> Option<&Arc<dyn Collaborator>> {
        self.by_kind.get(&kind)
    }

    /// Kinds without a registered collaborator.
    pub fn missing(&self) -> Vec<CollaboratorKind> {
        CollaboratorKind::ALL
            .into_iter()
            .filter(|kind| !self.by_kind.contains_key(kind))
            .collect()
    }

    /// Hands `command` to the collaborator addressed by its kind.
    pub async fn deliver(&self, command: OutboundCommand) -> FlowResult<()> {
        let kind = command.kind.collaborator();
        let collaborator = self
            .by_kind
            .get(&kind)
            .ok_or_else(|| FlowError::FatalCollaborator {
                collaborator: kind.to_string(),
                reason: "no collaborator registered".to_string(),
            })?;
        debug!(
            "Delivering {} for '{}' to '{}'",
            command.kind,
            command.target,
            collaborator.name()
        );
        collaborator.deliver(command).await
    }
}

impl fmt::Debug for CollaboratorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.by_kind.keys().collect();
        kinds.sort();
        f.debug_struct("CollaboratorSet").field("kinds", &kinds).finish()
    }
}
