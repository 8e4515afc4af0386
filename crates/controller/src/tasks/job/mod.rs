//! Job admission
//!
//! Turns an upstream job description into exactly one Kubernetes Job. The
//! Job name is derived from the job UUID, so a repeated submission collides
//! with the first one instead of creating a second Job.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use serde::{Deserialize, Serialize};

use super::types::Result;

pub mod naming;
pub mod resources;

pub use naming::JobNaming;
pub use resources::{ClusterJobs, JobAdmitter};

/// Runs `buildkite-agent start` and acquires the job
pub const AGENT_CONTAINER_NAME: &str = "agent";
/// Init container that copies the agent binary into the shared workspace
pub const COPY_AGENT_CONTAINER_NAME: &str = "copy-agent";
/// Runs the checkout phase
pub const CHECKOUT_CONTAINER_NAME: &str = "checkout";
/// Command containers are named `container-0`, `container-1`, ...
pub const COMMAND_CONTAINER_PREFIX: &str = "container-";

/// A job handed over by the intake loop.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Upstream job UUID
    pub uuid: String,

    /// Command the job runs
    pub command: String,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Agent tags the job was targeted with. Passed to the agent as one
    /// comma-separated `key=value` list, so keys and values must not
    /// contain commas.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Image for the command container when `pod_spec` names none
    #[serde(default)]
    pub image: Option<String>,

    /// User pod spec; each of its containers becomes a command container
    #[serde(default)]
    pub pod_spec: Option<PodSpec>,

    /// User sidecars, added to the pod unchanged
    #[serde(default)]
    pub sidecars: Vec<Container>,
}

/// Creates the cluster execution unit for a job.
///
/// Safe to call more than once for the same job; failures are returned as-is
/// and retrying is the caller's decision.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn create(&self, job: &Job) -> Result<()>;
}
