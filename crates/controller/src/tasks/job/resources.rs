use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::{Container, EnvVar, VolumeMount};
use kube::api::{Api, PostParams};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::naming::JobNaming;
use super::{
    Job, JobHandler, AGENT_CONTAINER_NAME, CHECKOUT_CONTAINER_NAME, COMMAND_CONTAINER_PREFIX,
    COPY_AGENT_CONTAINER_NAME,
};
use crate::tasks::config::JobConfig;
use crate::tasks::labels::{
    tag_annotation_key, ANNOTATION_COMMAND, LABEL_JOB_UUID, LABEL_MANAGED_BY, MANAGED_BY_VALUE,
};
use crate::tasks::types::{Error, Result};

const WORKSPACE_VOLUME: &str = "workspace";
const WORKSPACE_PATH: &str = "/workspace";
const AGENT_BINARY: &str = "/workspace/buildkite-agent";
const AGENT_TOKEN_KEY: &str = "token";

/// Where Jobs get created. Implemented for `Api<Job>`; tests swap in a fake.
#[async_trait]
pub trait ClusterJobs: Send + Sync {
    async fn create_job(&self, job: &KubeJob) -> Result<KubeJob, kube::Error>;
}

#[async_trait]
impl ClusterJobs for Api<KubeJob> {
    async fn create_job(&self, job: &KubeJob) -> Result<KubeJob, kube::Error> {
        self.create(&PostParams::default(), job).await
    }
}

/// Creates one Kubernetes Job per upstream job.
pub struct JobAdmitter<C> {
    jobs: C,
    config: Arc<JobConfig>,
}

impl<C: ClusterJobs> JobAdmitter<C> {
    #[must_use]
    pub fn new(jobs: C, config: JobConfig) -> Self {
        Self {
            jobs,
            config: Arc::new(config),
        }
    }

    fn parse_uuid(job: &Job) -> Result<Uuid> {
        let raw = job.uuid.trim();
        if raw.is_empty() {
            return Err(Error::InvalidJob("job UUID must not be empty".to_string()));
        }
        Uuid::parse_str(raw)
            .map_err(|e| Error::InvalidJob(format!("job UUID {raw:?} is not a UUID: {e}")))
    }

    fn create_job_labels(uuid: &Uuid) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_JOB_UUID.to_string(), uuid.to_string());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
        labels
    }

    /// Tags reach the agent as one comma-separated `key=value` list, so
    /// neither part may contain a comma.
    fn validate_tags(job: &Job) -> Result<()> {
        for (key, value) in &job.tags {
            if key.is_empty() || key.contains(',') || value.contains(',') {
                return Err(Error::InvalidJob(format!(
                    "agent tag {key:?}={value:?} must have a non-empty key and no commas"
                )));
            }
        }
        Ok(())
    }

    fn create_job_annotations(job: &Job) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::new();
        for (key, value) in &job.tags {
            let Some(annotation) = tag_annotation_key(key) else {
                continue;
            };
            // Tags iterate in key order, so the first key to claim a name wins
            if annotations.contains_key(&annotation) {
                warn!(
                    tag = %key,
                    annotation = %annotation,
                    "Agent tag collides with another tag after sanitizing, annotation skipped"
                );
                continue;
            }
            annotations.insert(annotation, value.clone());
        }
        if !job.command.is_empty() {
            annotations.insert(ANNOTATION_COMMAND.to_string(), job.command.clone());
        }
        annotations
    }

    fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    fn workspace_mount() -> VolumeMount {
        VolumeMount {
            name: WORKSPACE_VOLUME.to_string(),
            mount_path: WORKSPACE_PATH.to_string(),
            ..Default::default()
        }
    }

    /// Env shared by every container that runs a bootstrap phase
    fn bootstrap_env(job: &Job, uuid: &Uuid, container_id: usize, phases: &str) -> Vec<EnvVar> {
        let mut env: Vec<EnvVar> = job
            .env
            .iter()
            .map(|(name, value)| Self::env_var(name, value.clone()))
            .collect();
        env.push(Self::env_var("BUILDKITE_JOB_ID", uuid.to_string()));
        env.push(Self::env_var("BUILDKITE_KUBERNETES_EXEC", "true"));
        env.push(Self::env_var("BUILDKITE_CONTAINER_ID", container_id.to_string()));
        env.push(Self::env_var("BUILDKITE_BOOTSTRAP_PHASES", phases));
        env
    }

    fn agent_container(&self, job: &Job, uuid: &Uuid, container_count: usize) -> Value {
        let tags = job
            .tags
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");

        json!({
            "name": AGENT_CONTAINER_NAME,
            "image": self.config.agent_image,
            "args": ["start"],
            "env": [
                {
                    "name": "BUILDKITE_AGENT_TOKEN",
                    "valueFrom": {
                        "secretKeyRef": {
                            "name": self.config.agent_token_secret,
                            "key": AGENT_TOKEN_KEY
                        }
                    }
                },
                { "name": "BUILDKITE_AGENT_ACQUIRE_JOB", "value": uuid.to_string() },
                { "name": "BUILDKITE_AGENT_TAGS", "value": tags },
                { "name": "BUILDKITE_KUBERNETES_EXEC", "value": "true" },
                { "name": "BUILDKITE_CONTAINER_COUNT", "value": container_count.to_string() }
            ],
            "volumeMounts": [{ "name": WORKSPACE_VOLUME, "mountPath": WORKSPACE_PATH }]
        })
    }

    fn copy_agent_container(&self) -> Value {
        json!({
            "name": COPY_AGENT_CONTAINER_NAME,
            "image": self.config.agent_image,
            "command": ["cp"],
            "args": ["/usr/local/bin/buildkite-agent", AGENT_BINARY],
            "volumeMounts": [{ "name": WORKSPACE_VOLUME, "mountPath": WORKSPACE_PATH }]
        })
    }

    fn checkout_container(&self, job: &Job, uuid: &Uuid) -> Container {
        Container {
            name: CHECKOUT_CONTAINER_NAME.to_string(),
            image: Some(self.config.agent_image.clone()),
            command: Some(vec![AGENT_BINARY.to_string()]),
            args: Some(vec!["bootstrap".to_string()]),
            working_dir: Some(WORKSPACE_PATH.to_string()),
            env: Some(Self::bootstrap_env(job, uuid, 0, "checkout")),
            volume_mounts: Some(vec![Self::workspace_mount()]),
            ..Default::default()
        }
    }

    /// Rewrites user containers into numbered command containers.
    ///
    /// A container's own command/args become the step command; otherwise the
    /// job command is used. With no user containers a single one is built
    /// from the job image.
    fn command_containers(&self, job: &Job, uuid: &Uuid, user: Vec<Container>) -> Vec<Container> {
        let user = if user.is_empty() {
            vec![Container::default()]
        } else {
            user
        };

        user.into_iter()
            .enumerate()
            .map(|(index, mut container)| {
                let own_command: Vec<String> = container
                    .command
                    .take()
                    .unwrap_or_default()
                    .into_iter()
                    .chain(container.args.take().unwrap_or_default())
                    .collect();
                let step_command = if own_command.is_empty() {
                    job.command.clone()
                } else {
                    own_command.join(" ")
                };

                let mut env = Self::bootstrap_env(job, uuid, index + 1, "plugin,command");
                env.push(Self::env_var("BUILDKITE_COMMAND", step_command));
                env.extend(container.env.take().unwrap_or_default());

                let mut mounts = container.volume_mounts.take().unwrap_or_default();
                mounts.push(Self::workspace_mount());

                container.name = format!("{COMMAND_CONTAINER_PREFIX}{index}");
                container.image = container
                    .image
                    .or_else(|| job.image.clone())
                    .or_else(|| Some(self.config.default_command_image.clone()));
                container.command = Some(vec![AGENT_BINARY.to_string()]);
                container.args = Some(vec!["bootstrap".to_string()]);
                container.working_dir = container
                    .working_dir
                    .or_else(|| Some(WORKSPACE_PATH.to_string()));
                container.env = Some(env);
                container.volume_mounts = Some(mounts);
                container
            })
            .collect()
    }

    fn build_job_spec(&self, job: &Job, uuid: &Uuid, job_name: &str) -> Result<KubeJob> {
        let labels = Self::create_job_labels(uuid);
        let annotations = Self::create_job_annotations(job);

        let mut user_spec = job.pod_spec.clone().unwrap_or_default();
        let user_containers = std::mem::take(&mut user_spec.containers);
        let user_init = user_spec.init_containers.take().unwrap_or_default();

        let command_containers = self.command_containers(job, uuid, user_containers);
        // Checkout counts as container 0
        let container_count = command_containers.len() + 1;

        let mut containers = vec![
            self.agent_container(job, uuid, container_count),
            serde_json::to_value(self.checkout_container(job, uuid))?,
        ];
        for container in command_containers.iter().chain(&job.sidecars) {
            containers.push(serde_json::to_value(container)?);
        }

        let mut init_containers = vec![self.copy_agent_container()];
        for container in &user_init {
            init_containers.push(serde_json::to_value(container)?);
        }

        let mut pod = match serde_json::to_value(&user_spec)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let mut volumes = match pod.remove("volumes") {
            Some(Value::Array(volumes)) => volumes,
            _ => Vec::new(),
        };
        volumes.push(json!({ "name": WORKSPACE_VOLUME, "emptyDir": {} }));

        let mut pull_secrets = match pod.remove("imagePullSecrets") {
            Some(Value::Array(secrets)) => secrets,
            _ => Vec::new(),
        };
        pull_secrets.extend(
            self.config
                .image_pull_secrets
                .iter()
                .map(|name| json!({ "name": name })),
        );

        pod.insert("containers".to_string(), Value::Array(containers));
        pod.insert("initContainers".to_string(), Value::Array(init_containers));
        pod.insert("volumes".to_string(), Value::Array(volumes));
        pod.insert("restartPolicy".to_string(), json!("Never"));
        if !pull_secrets.is_empty() {
            pod.insert("imagePullSecrets".to_string(), Value::Array(pull_secrets));
        }
        if let Some(service_account) = &self.config.service_account_name {
            pod.insert("serviceAccountName".to_string(), json!(service_account));
        }

        let job_value = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": job_name,
                "labels": labels,
                "annotations": annotations
            },
            "spec": {
                "backoffLimit": 0,
                "ttlSecondsAfterFinished": self.config.ttl_seconds_after_finished,
                "activeDeadlineSeconds": self.config.active_deadline_seconds,
                "template": {
                    "metadata": {
                        "labels": labels,
                        "annotations": annotations
                    },
                    "spec": Value::Object(pod)
                }
            }
        });

        Ok(serde_json::from_value(job_value)?)
    }
}

#[async_trait]
impl<C: ClusterJobs> JobHandler for JobAdmitter<C> {
    async fn create(&self, job: &Job) -> Result<()> {
        let uuid = Self::parse_uuid(job)?;
        Self::validate_tags(job)?;
        let job_name = JobNaming::job_name(&uuid);
        let kube_job = self.build_job_spec(job, &uuid, &job_name)?;

        debug!(job_uuid = %uuid, job_name = %job_name, "Creating Kubernetes Job");

        match self.jobs.create_job(&kube_job).await {
            Ok(_) => {
                info!(job_uuid = %uuid, job_name = %job_name, "Created Kubernetes Job");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                info!(
                    job_uuid = %uuid,
                    job_name = %job_name,
                    "Kubernetes Job already exists, nothing to do"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    job_uuid = %uuid,
                    job_name = %job_name,
                    error = %e,
                    "Failed to create Kubernetes Job"
                );
                Err(e.into())
            }
        }
    }
}
