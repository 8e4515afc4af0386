//! Upstream job types as returned by the GraphQL API.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upstream job lifecycle state.
///
/// Only a handful of states matter to the controller; anything the API adds
/// later deserializes as [`JobState::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Waiting,
    WaitingFailed,
    Blocked,
    BlockedFailed,
    Unblocked,
    UnblockedFailed,
    Limiting,
    Limited,
    Scheduled,
    Assigned,
    Accepted,
    Running,
    Finished,
    Canceling,
    Canceled,
    TimingOut,
    TimedOut,
    Skipped,
    Broken,
    Expired,
    #[serde(other)]
    Other,
}

impl JobState {
    /// A cancellation has already been requested or has completed.
    #[must_use]
    pub fn is_canceling_or_canceled(self) -> bool {
        matches!(self, Self::Canceling | Self::Canceled)
    }

    /// The job holds (or is about to hold) an agent and may be cancelled.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Scheduled | Self::Assigned | Self::Accepted | Self::Running
        )
    }
}

/// A command step job.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandJob {
    /// GraphQL node id, required by mutations
    pub id: String,
    pub uuid: Uuid,
    pub state: JobState,
}

/// Result of a job lookup, keyed by the GraphQL `__typename`.
///
/// Only command jobs run on agents, so only they can be cancelled here.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "__typename")]
pub enum UpstreamJob {
    #[serde(rename = "JobTypeCommand")]
    Command(CommandJob),
    #[serde(rename = "JobTypeWait")]
    Wait,
    #[serde(rename = "JobTypeTrigger")]
    Trigger,
    #[serde(rename = "JobTypeBlock")]
    Block,
    #[serde(other)]
    Unknown,
}

impl UpstreamJob {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::Wait => "wait",
            Self::Trigger => "trigger",
            Self::Block => "block",
            Self::Unknown => "unknown",
        }
    }
}

/// Input for the command job cancel mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelJobInput {
    /// Caller-chosen dedup token; repeated mutations with the same value collapse server-side
    pub client_mutation_id: String,
    /// GraphQL node id of the job
    pub id: String,
}

/// Job as reported back by a successful cancel mutation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CancelledJob {
    pub id: String,
    pub state: JobState,
}
