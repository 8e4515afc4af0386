use uuid::Uuid;

const JOB_PREFIX: &str = "buildkite-";

pub struct JobNaming;

impl JobNaming {
    /// Kubernetes Job name for an upstream job.
    ///
    /// Single source of truth: admission dedup relies on the same UUID always
    /// producing the same name. Always 46 characters, under the 63 limit.
    #[must_use]
    pub fn job_name(uuid: &Uuid) -> String {
        format!("{JOB_PREFIX}{}", uuid.hyphenated())
    }
}
