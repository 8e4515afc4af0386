use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, info_span, warn, Instrument};

use super::evaluate::{evaluate, CancelTarget, Verdict};
use super::policy::WatcherPolicy;
use crate::api::{ApiError, CancelJobInput, JobApi, JobState, UpstreamJob};

/// A pod lifecycle notification.
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// `initial` is set for pods delivered by the initial list
    Added { pod: Pod, initial: bool },
    Updated(Pod),
    Deleted(Pod),
}

/// How one event was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Delete events carry nothing to act on
    Ignored,
    /// Evaluation decided no upstream call was needed
    Skipped,
    LookupFailed,
    UnsupportedKind(&'static str),
    /// A cancellation is already underway or done
    AlreadyCanceling(JobState),
    /// Job finished or otherwise left the active states on its own
    NotCancellable(JobState),
    Cancelled(JobState),
    CancelFailed,
}

/// Cancels upstream jobs whose pods are stuck in `ImagePullBackOff`.
///
/// Holds no per-job state: every event is evaluated on its own, and
/// duplicate cancels are absorbed by the upstream state check plus the pod
/// name used as the mutation dedup token.
pub struct ImagePullBackOffWatcher<A> {
    api: Arc<A>,
    policy: Arc<WatcherPolicy>,
    call_timeout: Duration,
}

impl<A: JobApi> ImagePullBackOffWatcher<A> {
    #[must_use]
    pub fn new(api: Arc<A>, policy: WatcherPolicy, call_timeout: Duration) -> Self {
        Self {
            api,
            policy: Arc::new(policy),
            call_timeout,
        }
    }

    pub async fn handle(&self, event: PodEvent) -> Outcome {
        match event {
            PodEvent::Deleted(pod) => {
                debug!(pod = %pod.name_any(), "Pod deleted");
                Outcome::Ignored
            }
            PodEvent::Added { pod, initial } => {
                debug!(pod = %pod.name_any(), initial, "Pod added");
                self.reconcile(&pod, Utc::now()).await
            }
            PodEvent::Updated(pod) => self.reconcile(&pod, Utc::now()).await,
        }
    }

    /// Evaluate a pod snapshot as of `now` and cancel its job if warranted.
    pub async fn reconcile(&self, pod: &Pod, now: DateTime<Utc>) -> Outcome {
        let span = info_span!(
            "image_pull_backoff",
            namespace = %pod.namespace().unwrap_or_default(),
            pod = %pod.name_any()
        );
        self.reconcile_inner(pod, now).instrument(span).await
    }

    async fn reconcile_inner(&self, pod: &Pod, now: DateTime<Utc>) -> Outcome {
        debug!("Checking pod for ImagePullBackOff");

        match evaluate(&self.policy, pod, now) {
            Verdict::NotStarted | Verdict::WithinGracePeriod { .. } => Outcome::Skipped,
            Verdict::Unmanaged => {
                info!("Job UUID label not present, skipping");
                Outcome::Skipped
            }
            Verdict::MalformedJobUuid(raw) => {
                warn!(job_uuid = %raw, "Job UUID label is not a UUID");
                Outcome::Skipped
            }
            Verdict::Healthy { ignored_sidecars } => {
                for name in &ignored_sidecars {
                    info!(container = %name, "Ignoring sidecar container in ImagePullBackOff");
                }
                Outcome::Skipped
            }
            Verdict::Cancel {
                target,
                ignored_sidecars,
            } => {
                for name in &ignored_sidecars {
                    info!(container = %name, "Ignoring sidecar container in ImagePullBackOff");
                }
                self.cancel(target).await
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .unwrap_or(Err(ApiError::Timeout(self.call_timeout)))
    }

    async fn cancel(&self, target: CancelTarget) -> Outcome {
        info!(
            job_uuid = %target.job_uuid,
            container = %target.container,
            "Job has a container in ImagePullBackOff, cancelling"
        );

        let job = match self.bounded(self.api.get_job(target.job_uuid)).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_uuid = %target.job_uuid, error = %e, "Failed to query job");
                return Outcome::LookupFailed;
            }
        };

        let command = match job {
            UpstreamJob::Command(command) => command,
            other @ (UpstreamJob::Wait
            | UpstreamJob::Trigger
            | UpstreamJob::Block
            | UpstreamJob::Unknown) => {
                warn!(job_uuid = %target.job_uuid, kind = other.kind(), "Job is not a command job");
                return Outcome::UnsupportedKind(other.kind());
            }
        };

        // Expected between a previous cancel and the Job's cleanup, while
        // replacement pods hit the same pull failure.
        if command.state.is_canceling_or_canceled() {
            info!(job_uuid = %target.job_uuid, state = ?command.state, "Job already cancelling");
            return Outcome::AlreadyCanceling(command.state);
        }

        if !command.state.is_active() {
            info!(job_uuid = %target.job_uuid, state = ?command.state, "Job is no longer active, not cancelling");
            return Outcome::NotCancellable(command.state);
        }

        let input = CancelJobInput {
            client_mutation_id: target.dedup_token,
            id: command.id,
        };

        match self.bounded(self.api.cancel_job(input)).await {
            Ok(cancelled) => {
                info!(job_uuid = %target.job_uuid, state = ?cancelled.state, "Cancelled job");
                Outcome::Cancelled(cancelled.state)
            }
            Err(e) => {
                warn!(
                    job_uuid = %target.job_uuid,
                    state = ?command.state,
                    error = %e,
                    "Failed to cancel job"
                );
                Outcome::CancelFailed
            }
        }
    }
}
