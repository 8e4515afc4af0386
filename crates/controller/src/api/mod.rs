//! Upstream job API
//!
//! The controller only needs two operations from the CI service: look a job
//! up by UUID and cancel it. They sit behind [`JobApi`] so the watcher can be
//! driven by the real GraphQL client or by a test double.

use async_trait::async_trait;
use uuid::Uuid;

pub mod client;
pub mod error;
pub mod types;

pub use client::BuildkiteClient;
pub use error::ApiError;
pub use types::{CancelJobInput, CancelledJob, CommandJob, JobState, UpstreamJob};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Fetch the current state of a job. A missing job is `ApiError::NotFound`.
    async fn get_job(&self, uuid: Uuid) -> Result<UpstreamJob, ApiError>;

    /// Cancel a command job. Safe to repeat with the same `client_mutation_id`.
    async fn cancel_job(&self, input: CancelJobInput) -> Result<CancelledJob, ApiError>;
}
