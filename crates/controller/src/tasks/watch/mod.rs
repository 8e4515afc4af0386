//! ImagePullBackOff watch
//!
//! Streams pod events from the cluster and hands each one to an
//! [`ImagePullBackOffWatcher`], which cancels the upstream job of any pod
//! whose essential containers cannot pull their image.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::runtime::{watcher, WatchStreamExt};
use tracing::{debug, info, warn, Instrument};

use super::types::{Error, Result};
use crate::api::JobApi;

pub mod evaluate;
pub mod handler;
pub mod policy;

#[cfg(test)]
mod fixtures;

pub use evaluate::{evaluate, CancelTarget, Verdict};
pub use handler::{ImagePullBackOffWatcher, Outcome, PodEvent};
pub use policy::{ContainerRole, EssentialContainers, WatcherPolicy};

impl PodEvent {
    /// Map a raw watch event. Relist markers carry no pod and yield `None`.
    #[must_use]
    pub fn from_watch(event: watcher::Event<Pod>) -> Option<Self> {
        match event {
            watcher::Event::InitApply(pod) => Some(Self::Added { pod, initial: true }),
            watcher::Event::Apply(pod) => Some(Self::Updated(pod)),
            watcher::Event::Delete(pod) => Some(Self::Deleted(pod)),
            watcher::Event::Init | watcher::Event::InitDone => None,
        }
    }
}

/// Watch pods matching `label_selector` until the stream ends.
///
/// An initial list is made first so that missing RBAC or a bad selector
/// fails startup instead of being retried forever by the watch backoff.
/// Up to `max_concurrent` events are evaluated at once.
pub async fn run<A: JobApi + 'static>(
    pods: Api<Pod>,
    label_selector: &str,
    handler: Arc<ImagePullBackOffWatcher<A>>,
    max_concurrent: usize,
) -> Result<()> {
    pods.list(&ListParams::default().labels(label_selector).limit(1))
        .await
        .map_err(|e| Error::WatchSetupFailed(e.to_string()))?;

    info!(label_selector, max_concurrent, "Watching pods for ImagePullBackOff");

    watcher(pods, watcher::Config::default().labels(label_selector))
        .default_backoff()
        .filter_map(|event| async move {
            match event {
                Ok(event) => PodEvent::from_watch(event),
                Err(e) => {
                    warn!(error = %e, "Pod watch error, retrying");
                    None
                }
            }
        })
        .for_each_concurrent(max_concurrent, |event| {
            let handler = Arc::clone(&handler);
            let span = tracing::info_span!("pod_event");
            async move {
                let outcome = handler.handle(event).await;
                debug!(?outcome, "Pod event handled");
            }
            .instrument(span)
        })
        .await;

    info!("Pod watch stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockJobApi;
    use crate::tasks::labels::LABEL_JOB_UUID;
    use fixtures::{essential_policy, pod, JOB_UUID};
    use kube::client::Body;
    use serde_json::json;
    use std::time::Duration;

    /// Client whose API server answers every request with 403 Forbidden.
    fn forbidden_client() -> kube::Client {
        let service = tower::service_fn(|_request: http::Request<Body>| async {
            let status = json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "pods is forbidden: User \"system:serviceaccount:buildkite:stack-controller\" cannot list resource \"pods\"",
                "reason": "Forbidden",
                "code": 403
            });
            http::Response::builder()
                .status(http::StatusCode::FORBIDDEN)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&status).unwrap()))
        });
        kube::Client::new(service, "buildkite")
    }

    #[tokio::test]
    async fn failed_initial_list_is_returned_to_caller() {
        let mut api = MockJobApi::new();
        api.expect_get_job().never();
        api.expect_cancel_job().never();
        let handler = Arc::new(ImagePullBackOffWatcher::new(
            Arc::new(api),
            essential_policy(60),
            Duration::from_secs(5),
        ));

        let pods: Api<Pod> = Api::namespaced(forbidden_client(), "buildkite");
        let result = run(pods, LABEL_JOB_UUID, handler, 4).await;

        match result {
            Err(Error::WatchSetupFailed(message)) => assert!(message.contains("forbidden")),
            other => panic!("expected watch setup failure, got {other:?}"),
        }
    }

    #[test]
    fn relist_markers_are_dropped() {
        assert!(PodEvent::from_watch(watcher::Event::Init).is_none());
        assert!(PodEvent::from_watch(watcher::Event::InitDone).is_none());
    }

    #[test]
    fn initial_list_pods_are_marked() {
        let event = PodEvent::from_watch(watcher::Event::InitApply(pod(
            "build-7f2a",
            Some(5),
            Some(JOB_UUID),
            &[("agent", None)],
        )));
        assert!(matches!(event, Some(PodEvent::Added { initial: true, .. })));
    }

    #[test]
    fn apply_and_delete_map_directly() {
        let p = pod("build-7f2a", Some(5), Some(JOB_UUID), &[("agent", None)]);
        assert!(matches!(
            PodEvent::from_watch(watcher::Event::Apply(p.clone())),
            Some(PodEvent::Updated(_))
        ));
        assert!(matches!(
            PodEvent::from_watch(watcher::Event::Delete(p)),
            Some(PodEvent::Deleted(_))
        ));
    }
}
