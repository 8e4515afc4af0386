use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors returned by the upstream job API
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid API token: {0}")]
    InvalidToken(String),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned error status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("GraphQL errors: {0}")]
    GraphQl(String),

    #[error("No data in GraphQL response")]
    EmptyResponse,

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}
