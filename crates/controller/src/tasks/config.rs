//! Controller Configuration
//!
//! Loaded once at startup from a mounted YAML file and read-only afterwards.
//! The upstream API token is deliberately absent; it comes from the
//! environment so it can live in a Secret.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::job::{AGENT_CONTAINER_NAME, CHECKOUT_CONTAINER_NAME, COPY_AGENT_CONTAINER_NAME};
use super::labels::LABEL_JOB_UUID;
use super::types::{Error, Result};
use super::watch::{EssentialContainers, WatcherPolicy};
use crate::api::client::BUILDKITE_GRAPHQL_URL;

/// Default location of the mounted configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`]
pub const CONFIG_PATH_ENV: &str = "CONTROLLER_CONFIG_PATH";

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Namespace Jobs are created in and pods are watched in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Upstream GraphQL endpoint
    #[serde(default = "default_graphql_endpoint")]
    pub graphql_endpoint: String,

    /// Minimum pod age before an `ImagePullBackOff` is acted on
    #[serde(default = "default_grace_period_seconds")]
    pub image_pull_back_off_grace_period_seconds: u64,

    /// Upper bound for each upstream API call
    #[serde(default = "default_api_timeout_seconds")]
    pub api_timeout_seconds: u64,

    /// Pod events evaluated concurrently
    #[serde(default = "default_max_concurrent_evaluations")]
    pub max_concurrent_evaluations: usize,

    /// Label selector restricting the pod watch
    #[serde(default = "default_pod_label_selector")]
    pub pod_label_selector: String,

    /// Containers whose failure may cancel a job
    #[serde(default)]
    pub essential_containers: EssentialContainersConfig,

    /// Kubernetes Job template settings
    #[serde(default)]
    pub job: JobConfig,
}

/// Essential container classification
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EssentialContainersConfig {
    /// Exact container names
    #[serde(default = "default_essential_names")]
    pub names: Vec<String>,

    /// Regex for numbered command containers; `None` disables pattern matching
    #[serde(default = "default_essential_pattern")]
    pub pattern: Option<String>,
}

impl Default for EssentialContainersConfig {
    fn default() -> Self {
        Self {
            names: default_essential_names(),
            pattern: default_essential_pattern(),
        }
    }
}

/// Job template configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    /// Image providing the agent binary
    #[serde(default = "default_agent_image")]
    pub agent_image: String,

    /// Image for command containers when the job names none
    #[serde(default = "default_agent_image")]
    pub default_command_image: String,

    /// Secret holding the agent registration token
    #[serde(default = "default_agent_token_secret")]
    pub agent_token_secret: String,

    /// Hard deadline for the whole Job
    #[serde(default)]
    pub active_deadline_seconds: Option<i64>,

    /// Garbage collection delay for finished Jobs
    #[serde(default = "default_ttl_seconds_after_finished")]
    pub ttl_seconds_after_finished: i32,

    #[serde(default)]
    pub service_account_name: Option<String>,

    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            agent_image: default_agent_image(),
            default_command_image: default_agent_image(),
            agent_token_secret: default_agent_token_secret(),
            active_deadline_seconds: None,
            ttl_seconds_after_finished: default_ttl_seconds_after_finished(),
            service_account_name: None,
            image_pull_secrets: Vec::new(),
        }
    }
}

fn default_namespace() -> String {
    "buildkite".to_string()
}

fn default_graphql_endpoint() -> String {
    BUILDKITE_GRAPHQL_URL.to_string()
}

fn default_grace_period_seconds() -> u64 {
    30
}

fn default_api_timeout_seconds() -> u64 {
    10
}

fn default_max_concurrent_evaluations() -> usize {
    16
}

fn default_pod_label_selector() -> String {
    LABEL_JOB_UUID.to_string()
}

fn default_essential_names() -> Vec<String> {
    vec![
        AGENT_CONTAINER_NAME.to_string(),
        COPY_AGENT_CONTAINER_NAME.to_string(),
        CHECKOUT_CONTAINER_NAME.to_string(),
    ]
}

#[allow(clippy::unnecessary_wraps)]
fn default_essential_pattern() -> Option<String> {
    Some(r"^container-\d+$".to_string())
}

fn default_agent_image() -> String {
    "ghcr.io/buildkite/agent:3".to_string()
}

fn default_agent_token_secret() -> String {
    "buildkite-agent-token".to_string()
}

fn default_ttl_seconds_after_finished() -> i32 {
    600
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            graphql_endpoint: default_graphql_endpoint(),
            image_pull_back_off_grace_period_seconds: default_grace_period_seconds(),
            api_timeout_seconds: default_api_timeout_seconds(),
            max_concurrent_evaluations: default_max_concurrent_evaluations(),
            pod_label_selector: default_pod_label_selector(),
            essential_containers: EssentialContainersConfig::default(),
            job: JobConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a mounted YAML file
    pub fn from_mounted_file(config_path: &str) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config file {config_path}: {e}"))
        })?;

        serde_yaml::from_str(&config_str)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config YAML: {e}")))
    }

    /// Config file location: `CONTROLLER_CONFIG_PATH` when set, else the default mount
    #[must_use]
    pub fn config_path() -> String {
        std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|path| !path.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Load from [`Self::config_path`], falling back to defaults if that file
    /// cannot be read or parsed
    pub fn load() -> Self {
        let config_path = Self::config_path();

        match Self::from_mounted_file(&config_path) {
            Ok(cfg) => {
                info!("Loaded controller configuration from {}", config_path);
                cfg
            }
            Err(err) => {
                warn!(
                    "Failed to load configuration from {}: {}. Using defaults.",
                    config_path, err
                );
                Self::default()
            }
        }
    }

    /// Reject configurations the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::ConfigError("namespace must not be empty".to_string()));
        }
        if self.graphql_endpoint.trim().is_empty() {
            return Err(Error::ConfigError(
                "graphqlEndpoint must not be empty".to_string(),
            ));
        }
        if self.api_timeout_seconds == 0 {
            return Err(Error::ConfigError(
                "apiTimeoutSeconds must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_evaluations == 0 {
            return Err(Error::ConfigError(
                "maxConcurrentEvaluations must be greater than zero".to_string(),
            ));
        }
        if self.job.agent_image.trim().is_empty() {
            return Err(Error::ConfigError(
                "job.agentImage must not be empty".to_string(),
            ));
        }
        if self.job.default_command_image.trim().is_empty() {
            return Err(Error::ConfigError(
                "job.defaultCommandImage must not be empty".to_string(),
            ));
        }
        if self.job.agent_token_secret.trim().is_empty() {
            return Err(Error::ConfigError(
                "job.agentTokenSecret must not be empty".to_string(),
            ));
        }
        if self.essential_containers.names.is_empty()
            && self.essential_containers.pattern.is_none()
        {
            return Err(Error::ConfigError(
                "essentialContainers needs at least one name or a pattern".to_string(),
            ));
        }
        self.essential_containers()?;
        Ok(())
    }

    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.image_pull_back_off_grace_period_seconds)
    }

    #[must_use]
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }

    fn essential_containers(&self) -> Result<EssentialContainers> {
        EssentialContainers::new(
            self.essential_containers.names.iter().cloned(),
            self.essential_containers.pattern.as_deref(),
        )
        .map_err(|e| Error::ConfigError(format!("Invalid essentialContainers.pattern: {e}")))
    }

    /// Build the immutable policy shared by every pod evaluation
    pub fn watcher_policy(&self) -> Result<WatcherPolicy> {
        Ok(WatcherPolicy::new(
            self.grace_period(),
            self.essential_containers()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::watch::ContainerRole;
    use serial_test::serial;

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
namespace: ci
imagePullBackOffGracePeriodSeconds: 60
apiTimeoutSeconds: 5
essentialContainers:
  names: ["agent"]
  pattern: "^step-\\d+$"
job:
  agentImage: registry.local/agent:3.80
  activeDeadlineSeconds: 3600
  imagePullSecrets: ["registry-creds"]
"#;

        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.namespace, "ci");
        assert_eq!(config.grace_period(), Duration::from_secs(60));
        assert_eq!(config.api_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_concurrent_evaluations, 16);
        assert_eq!(config.pod_label_selector, LABEL_JOB_UUID);
        assert_eq!(config.job.agent_image, "registry.local/agent:3.80");
        assert_eq!(config.job.default_command_image, "ghcr.io/buildkite/agent:3");
        assert_eq!(config.job.active_deadline_seconds, Some(3600));
        assert_eq!(config.job.ttl_seconds_after_finished, 600);
        assert!(config.validate().is_ok());

        let policy = config.watcher_policy().unwrap();
        assert_eq!(policy.classify("step-3"), ContainerRole::Essential);
        assert_eq!(policy.classify("checkout"), ContainerRole::Auxiliary);
    }

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grace_period(), Duration::from_secs(30));

        let policy = config.watcher_policy().unwrap();
        for name in ["agent", "copy-agent", "checkout", "container-0", "container-12"] {
            assert_eq!(policy.classify(name), ContainerRole::Essential, "{name}");
        }
        for name in ["redis", "my-container-1-sidecar", "container-"] {
            assert_eq!(policy.classify(name), ContainerRole::Auxiliary, "{name}");
        }
    }

    #[test]
    fn validate_rejects_bad_pattern() {
        let mut config = ControllerConfig::default();
        config.essential_containers.pattern = Some("container-(".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("essentialContainers.pattern"));
    }

    #[test]
    fn validate_rejects_zero_timeout_and_empty_namespace() {
        let mut config = ControllerConfig::default();
        config.api_timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.namespace = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_some_essential_classification() {
        let mut config = ControllerConfig::default();
        config.essential_containers.names.clear();
        config.essential_containers.pattern = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = ControllerConfig::from_mounted_file("/nonexistent/config.yaml").unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    #[serial]
    fn load_reads_override_path() {
        let path = std::env::temp_dir().join(format!(
            "stack-controller-config-{}.yaml",
            std::process::id()
        ));
        std::fs::write(&path, "namespace: from-env\n").unwrap();
        std::env::set_var(CONFIG_PATH_ENV, &path);

        let config = ControllerConfig::load();

        std::env::remove_var(CONFIG_PATH_ENV);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.namespace, "from-env");
    }

    #[test]
    #[serial]
    fn load_falls_back_to_defaults() {
        std::env::set_var(CONFIG_PATH_ENV, "/nonexistent/override.yaml");
        let config = ControllerConfig::load();
        std::env::remove_var(CONFIG_PATH_ENV);
        assert_eq!(config.namespace, "buildkite");
    }

    #[test]
    fn validate_rejects_empty_job_fields() {
        let mut config = ControllerConfig::default();
        config.job.agent_token_secret = String::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("job.agentTokenSecret"));

        let mut config = ControllerConfig::default();
        config.job.default_command_image = " ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("job.defaultCommandImage"));
    }

    #[test]
    #[serial]
    fn missing_override_file_is_not_replaced_by_default_mount() {
        std::env::set_var(CONFIG_PATH_ENV, "/nonexistent/override.yaml");
        let path = ControllerConfig::config_path();
        std::env::remove_var(CONFIG_PATH_ENV);
        assert_eq!(path, "/nonexistent/override.yaml");

        assert_eq!(ControllerConfig::config_path(), DEFAULT_CONFIG_PATH);
    }
}
