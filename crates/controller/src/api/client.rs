//! GraphQL client for the Buildkite API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::error::ApiError;
use super::types::{CancelJobInput, CancelledJob, UpstreamJob};
use super::JobApi;

/// Buildkite GraphQL endpoint
pub const BUILDKITE_GRAPHQL_URL: &str = "https://graphql.buildkite.com/v1";

const GET_COMMAND_JOB_QUERY: &str = r"
    query GetCommandJob($uuid: ID!) {
        job(uuid: $uuid) {
            __typename
            ... on JobTypeCommand {
                id
                uuid
                state
            }
        }
    }
";

const CANCEL_COMMAND_JOB_MUTATION: &str = r"
    mutation CancelCommandJob($input: JobTypeCommandCancelInput!) {
        jobTypeCommandCancel(input: $input) {
            clientMutationId
            jobTypeCommand {
                id
                state
            }
        }
    }
";

/// Buildkite GraphQL client
#[derive(Debug, Clone)]
pub struct BuildkiteClient {
    client: reqwest::Client,
    api_url: String,
}

/// GraphQL request body
#[derive(Debug, Serialize)]
struct GraphQLRequest<V: Serialize> {
    query: &'static str,
    variables: V,
}

/// GraphQL response wrapper
#[derive(Debug, Deserialize)]
struct GraphQLResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQLError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQLError {
    message: String,
}

impl BuildkiteClient {
    /// Create a client for `api_url` authenticating with a bearer token.
    ///
    /// `timeout` bounds every request end to end.
    pub fn new(token: &str, api_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        let auth_value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ApiError::InvalidToken(e.to_string()))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.to_string(),
        })
    }

    /// Execute a GraphQL query/mutation
    async fn execute<V: Serialize + Send, R: DeserializeOwned>(
        &self,
        query: &'static str,
        variables: V,
    ) -> Result<R, ApiError> {
        let request = GraphQLRequest { query, variables };

        let response = self.client.post(&self.api_url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let gql_response: GraphQLResponse<R> = response.json().await?;

        if let Some(errors) = gql_response.errors {
            if !errors.is_empty() {
                let messages: Vec<_> = errors.iter().map(|e| e.message.as_str()).collect();
                return Err(ApiError::GraphQl(messages.join(", ")));
            }
        }

        gql_response.data.ok_or(ApiError::EmptyResponse)
    }
}

#[async_trait]
impl JobApi for BuildkiteClient {
    #[instrument(skip(self), fields(job_uuid = %uuid))]
    async fn get_job(&self, uuid: Uuid) -> Result<UpstreamJob, ApiError> {
        #[derive(Serialize)]
        struct Variables {
            uuid: String,
        }

        #[derive(Deserialize)]
        struct Response {
            job: Option<UpstreamJob>,
        }

        let response: Response = self
            .execute(
                GET_COMMAND_JOB_QUERY,
                Variables {
                    uuid: uuid.to_string(),
                },
            )
            .await?;

        let job = response.job.ok_or(ApiError::NotFound(uuid))?;
        debug!(kind = job.kind(), "Retrieved job");
        Ok(job)
    }

    #[instrument(skip(self, input), fields(client_mutation_id = %input.client_mutation_id))]
    async fn cancel_job(&self, input: CancelJobInput) -> Result<CancelledJob, ApiError> {
        #[derive(Serialize)]
        struct Variables {
            input: CancelJobInput,
        }

        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "jobTypeCommandCancel")]
            cancel: Option<CancelPayload>,
        }

        #[derive(Deserialize)]
        struct CancelPayload {
            #[serde(rename = "jobTypeCommand")]
            job: CancelledJob,
        }

        let response: Response = self
            .execute(CANCEL_COMMAND_JOB_MUTATION, Variables { input })
            .await?;

        let payload = response.cancel.ok_or(ApiError::EmptyResponse)?;
        debug!(state = ?payload.job.state, "Cancel mutation accepted");
        Ok(payload.job)
    }
}
