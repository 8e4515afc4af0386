use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::api::JobApi;

pub mod config;
pub mod job;
pub mod labels;
pub mod types;
pub mod watch;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use types::{Error, Result};

/// Main entry point for the ImagePullBackOff watcher
///
/// Returns when the pod watch stream ends, or immediately with
/// [`Error::WatchSetupFailed`] if the pods cannot be listed at all.
#[instrument(skip(client, config, api), fields(namespace = %config.namespace))]
pub async fn run_watcher<A: JobApi + 'static>(
    client: Client,
    config: &ControllerConfig,
    api: Arc<A>,
) -> Result<()> {
    info!("Starting ImagePullBackOff watcher");

    let policy = config.watcher_policy()?;
    debug!(
        grace_period_seconds = policy.grace_period.as_secs(),
        api_timeout_seconds = config.api_timeout_seconds,
        "Watcher policy built"
    );

    let handler = Arc::new(watch::ImagePullBackOffWatcher::new(
        api,
        policy,
        config.api_timeout(),
    ));
    let pods: Api<Pod> = Api::namespaced(client, &config.namespace);

    watch::run(
        pods,
        &config.pod_label_selector,
        handler,
        config.max_concurrent_evaluations,
    )
    .await?;

    info!("ImagePullBackOff watcher shutting down");
    Ok(())
}
