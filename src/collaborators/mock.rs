//! Channel-backed collaborator for tests and embedders.

use super::Collaborator;
use crate::error::{FlowError, FlowResult};
use crate::messages::OutboundCommand;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Forwards every command into an unbounded channel.
///
/// Built with [`ChannelCollaborator::failing`] it rejects every command instead, which drives
/// the addressed node into `Error`.
pub struct ChannelCollaborator {
    name: String,
    tx: Option<mpsc::UnboundedSender<OutboundCommand>>,
    failure: Option<String>,
}

impl ChannelCollaborator {
    /// A collaborator plus the receiving end of its command channel.
    pub fn new(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<OutboundCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let collaborator = Self {
            name: name.into(),
            tx: Some(tx),
            failure: None,
        };
        (collaborator, rx)
    }

    /// A collaborator that rejects every command with `reason`.
    pub fn failing(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tx: None,
            failure: Some(reason.into()),
        }
    }
}

#[async_trait]
impl Collaborator for ChannelCollaborator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, command: OutboundCommand) -> FlowResult<()> {
        if let Some(reason) = &self.failure {
            return Err(FlowError::FatalCollaborator {
                collaborator: self.name.clone(),
                reason: reason.clone(),
            });
        }
        let tx = self.tx.as_ref().ok_or_else(|| FlowError::FatalCollaborator {
            collaborator: self.name.clone(),
            reason: "no receiver".to_string(),
        })?;
        tx.send(command).map_err(|_| FlowError::FatalCollaborator {
            collaborator: self.name.clone(),
            reason: "receiver dropped".to_string(),
        })
    }
}
