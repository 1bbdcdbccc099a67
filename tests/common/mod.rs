//! Common test utilities for sample_flow integration tests
//!
//! - fixture files in temporary directories
//! - a router wired to channel-backed collaborators
//! - waiting on state changes and commands with a bound

#![allow(dead_code)] // Not every test file uses every helper

use sample_flow::collaborators::{ChannelCollaborator, CollaboratorKind, CollaboratorSet};
use sample_flow::config::Settings;
use sample_flow::messages::{OutboundCommand, StateChange};
use sample_flow::router::RouterHandle;
use sample_flow::sample::{ContainerPath, SampleStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Writes `contents` to `name` inside `dir`.
pub fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).expect("Failed to write fixture");
    path
}

/// A running router with one channel per collaborator.
pub struct Harness {
    pub store: Arc<SampleStore>,
    pub router: RouterHandle,
    pub changes: broadcast::Receiver<StateChange>,
    pub gain: mpsc::UnboundedReceiver<OutboundCommand>,
    pub microscope: mpsc::UnboundedReceiver<OutboundCommand>,
    pub renamer: mpsc::UnboundedReceiver<OutboundCommand>,
}

pub fn collaborators() -> (
    CollaboratorSet,
    mpsc::UnboundedReceiver<OutboundCommand>,
    mpsc::UnboundedReceiver<OutboundCommand>,
    mpsc::UnboundedReceiver<OutboundCommand>,
) {
    let (gain, gain_rx) = ChannelCollaborator::new("gain");
    let (microscope, microscope_rx) = ChannelCollaborator::new("microscope");
    let (renamer, renamer_rx) = ChannelCollaborator::new("renamer");
    let set = CollaboratorSet::new()
        .with(CollaboratorKind::GainEstimator, Arc::new(gain))
        .with(CollaboratorKind::Microscope, Arc::new(microscope))
        .with(CollaboratorKind::FileRenamer, Arc::new(renamer));
    (set, gain_rx, microscope_rx, renamer_rx)
}

pub fn harness(settings: Settings) -> Harness {
    harness_with_store(Arc::new(SampleStore::new()), settings)
}

pub fn harness_with_store(store: Arc<SampleStore>, settings: Settings) -> Harness {
    let (set, gain, microscope, renamer) = collaborators();
    let (router, _task) = RouterHandle::spawn(store.clone(), Arc::new(settings), set);
    let changes = router.subscribe();
    Harness {
        store,
        router,
        changes,
        gain,
        microscope,
        renamer,
    }
}

/// Waits until `path` enters the state named `state`.
pub async fn wait_for_state(
    changes: &mut broadcast::Receiver<StateChange>,
    path: &ContainerPath,
    state: &str,
) -> StateChange {
    let wait = async {
        loop {
            match changes.recv().await {
                Ok(change) if &change.path == path && change.to.name() == state => {
                    return change
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("state stream closed while waiting for {}", state)
                }
            }
        }
    };
    tokio::time::timeout(WAIT, wait)
        .await
        .unwrap_or_else(|_| panic!("'{}' never reached {}", path, state))
}

/// Next command from a collaborator channel.
pub async fn next_command(rx: &mut mpsc::UnboundedReceiver<OutboundCommand>) -> OutboundCommand {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("Timed out waiting for a command")
        .expect("Collaborator channel closed")
}
