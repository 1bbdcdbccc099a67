//! Collaborator that only logs.

use super::{Collaborator, CollaboratorKind};
use crate::error::FlowResult;
use crate::messages::OutboundCommand;
use async_trait::async_trait;
use tracing::info;

/// Accepts every command and logs it. Completion events must be fed back by hand.
pub struct LoggingCollaborator {
    kind: CollaboratorKind,
}

impl LoggingCollaborator {
    /// Logs commands addressed to `kind`.
    pub fn new(kind: CollaboratorKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Collaborator for LoggingCollaborator {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn deliver(&self, command: OutboundCommand) -> FlowResult<()> {
        let parameters = serde_json::to_string(&command.parameters)?;
        info!(
            collaborator = self.kind.as_str(),
            command = %command.id,
            "{} for '{}' {}",
            command.kind,
            command.target,
            parameters
        );
        Ok(())
    }
}
