//! Per-event pod evaluation.
//!
//! [`evaluate`] is pure: it looks at one pod snapshot and the policy and
//! decides whether the pod's job should be cancelled. Nothing is remembered
//! between calls, so redelivered or reordered events are harmless.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::ResourceExt;
use uuid::Uuid;

use super::policy::{ContainerRole, WatcherPolicy};
use crate::tasks::labels::job_uuid_label;

/// Waiting reason Kubernetes reports once image pull retries are backing off
pub const IMAGE_PULL_BACK_OFF: &str = "ImagePullBackOff";

/// What to cancel, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelTarget {
    pub job_uuid: Uuid,
    /// Pod name, passed upstream as the mutation dedup token
    pub dedup_token: String,
    /// First essential container found stuck
    pub container: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Pod has no start time yet
    NotStarted,
    WithinGracePeriod { elapsed: Duration },
    /// No job UUID label; not ours
    Unmanaged,
    MalformedJobUuid(String),
    Healthy { ignored_sidecars: Vec<String> },
    Cancel {
        target: CancelTarget,
        ignored_sidecars: Vec<String>,
    },
}

fn is_image_pull_back_off(status: &ContainerStatus) -> bool {
    status
        .state
        .as_ref()
        .and_then(|state| state.waiting.as_ref())
        .and_then(|waiting| waiting.reason.as_deref())
        == Some(IMAGE_PULL_BACK_OFF)
}

#[must_use]
pub fn evaluate(policy: &WatcherPolicy, pod: &Pod, now: DateTime<Utc>) -> Verdict {
    let Some(status) = pod.status.as_ref() else {
        return Verdict::NotStarted;
    };
    let Some(started_at) = status.start_time.as_ref() else {
        return Verdict::NotStarted;
    };

    // Negative means clock skew; treat as just started
    let elapsed = now
        .signed_duration_since(started_at.0)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if elapsed < policy.grace_period {
        return Verdict::WithinGracePeriod { elapsed };
    }

    let Some(raw_uuid) = job_uuid_label(&pod.metadata) else {
        return Verdict::Unmanaged;
    };
    let Ok(job_uuid) = Uuid::parse_str(raw_uuid) else {
        return Verdict::MalformedJobUuid(raw_uuid.to_string());
    };

    let statuses = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten());

    let mut ignored_sidecars = Vec::new();
    for container in statuses {
        if !is_image_pull_back_off(container) {
            continue;
        }
        match policy.classify(&container.name) {
            ContainerRole::Auxiliary => ignored_sidecars.push(container.name.clone()),
            ContainerRole::Essential => {
                return Verdict::Cancel {
                    target: CancelTarget {
                        job_uuid,
                        dedup_token: pod.name_any(),
                        container: container.name.clone(),
                    },
                    ignored_sidecars,
                };
            }
        }
    }

    Verdict::Healthy { ignored_sidecars }
}
