//! Run bootstrap.
//!
//! Builds the hierarchy from the configured source, checks that every collaborator is
//! present, starts the router and announces each loaded node that runs the workflow.

use crate::collaborators::CollaboratorSet;
use crate::config::Settings;
use crate::error::{FlowError, FlowResult};
use crate::messages::InboundEvent;
use crate::report::RunReport;
use crate::router::RouterHandle;
use crate::sample::loader::plate_layout_rows;
use crate::sample::{HierarchyLoader, LoadReport, SampleStore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A started run.
pub struct Run {
    /// The sample hierarchy.
    pub store: Arc<SampleStore>,
    /// Settings the run was started with.
    pub settings: Arc<Settings>,
    /// Outcome of the initial load.
    pub load: LoadReport,
    /// Handle for feeding events to the run.
    pub router: RouterHandle,
    task: JoinHandle<()>,
}

impl Run {
    /// Shuts the router down and waits for it to exit.
    pub async fn shutdown(self) -> FlowResult<RunReport> {
        let report = self.router.shutdown().await?;
        if let Err(e) = self.task.await {
            warn!("Event router task failed: {}", e);
        }
        Ok(report)
    }
}

/// Builds the initial hierarchy: the sample state file, else the plate layout, else nothing.
///
/// Row failures are reported, not raised. Only a file whose rows all fail is an error.
pub fn build_hierarchy(settings: &Settings) -> FlowResult<(Arc<SampleStore>, LoadReport)> {
    let store = Arc::new(SampleStore::new());
    let loader = HierarchyLoader::new(store.clone());

    let report = match (&settings.sample_state_file, &settings.plate_layout) {
        (Some(file), layout) => {
            if layout.is_some() {
                warn!("Both sample_state_file and plate_layout are set; using the file");
            }
            loader.load_path(file)?.into_result()?
        }
        (None, Some(layout)) => {
            info!(
                "Seeding plate '{}' with {}x{} wells",
                layout.plate_name, layout.x_wells, layout.y_wells
            );
            loader
                .load_records(plate_layout_rows(
                    &layout.plate_name,
                    layout.x_wells,
                    layout.y_wells,
                ))
                .into_result()?
        }
        (None, None) => {
            info!("No sample state configured; the hierarchy starts empty");
            LoadReport::default()
        }
    };
    Ok((store, report))
}

/// Loads the hierarchy from `settings` and starts the run.
pub async fn bootstrap(settings: Settings, collaborators: CollaboratorSet) -> FlowResult<Run> {
    let (store, load) = build_hierarchy(&settings)?;
    start(store, Arc::new(settings), collaborators, load).await
}

/// Starts the router over an already built hierarchy.
pub async fn start(
    store: Arc<SampleStore>,
    settings: Arc<Settings>,
    collaborators: CollaboratorSet,
    load: LoadReport,
) -> FlowResult<Run> {
    let missing = collaborators.missing();
    if !missing.is_empty() {
        let names: Vec<&str> = missing.iter().map(|kind| kind.as_str()).collect();
        return Err(FlowError::FatalCollaborator {
            collaborator: names.join(", "),
            reason: "required collaborator not registered".to_string(),
        });
    }

    let (router, task) = RouterHandle::spawn(store.clone(), settings.clone(), collaborators);
    let mut announced = 0;
    for node in store.all_nodes() {
        if settings.workflow.tracks(node.kind()) {
            router
                .dispatch(InboundEvent::container_specified(node.path().clone()))
                .await?;
            announced += 1;
        }
    }
    info!("Run started with {} nodes, {} tracked", store.len(), announced);

    Ok(Run {
        store,
        settings,
        load,
        router,
        task,
    })
}
