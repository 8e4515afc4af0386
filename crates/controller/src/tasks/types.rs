use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Pod watch failed to start: {0}")]
    WatchSetupFailed(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
