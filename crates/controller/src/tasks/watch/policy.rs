use std::collections::BTreeSet;
use std::time::Duration;

use regex::Regex;

/// Whether a container's failure says anything about the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRole {
    /// Agent, checkout or command containers; supervised by the agent
    Essential,
    /// User sidecars; their failure alone must not fail the job
    Auxiliary,
}

/// Names (and optionally a pattern) identifying essential containers.
#[derive(Debug, Clone)]
pub struct EssentialContainers {
    names: BTreeSet<String>,
    pattern: Option<Regex>,
}

impl EssentialContainers {
    pub fn new<I, S>(names: I, pattern: Option<&str>) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self {
            names: names.into_iter().map(Into::into).collect(),
            pattern: pattern.map(Regex::new).transpose()?,
        })
    }

    #[must_use]
    pub fn classify(&self, container_name: &str) -> ContainerRole {
        let matches_pattern = self
            .pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(container_name));

        if self.names.contains(container_name) || matches_pattern {
            ContainerRole::Essential
        } else {
            ContainerRole::Auxiliary
        }
    }
}

/// Immutable per-process watcher settings, shared by every evaluation.
#[derive(Debug, Clone)]
pub struct WatcherPolicy {
    /// Minimum time since pod start before a pull failure counts
    pub grace_period: Duration,
    pub essential: EssentialContainers,
}

impl WatcherPolicy {
    #[must_use]
    pub fn new(grace_period: Duration, essential: EssentialContainers) -> Self {
        Self {
            grace_period,
            essential,
        }
    }

    #[must_use]
    pub fn classify(&self, container_name: &str) -> ContainerRole {
        self.essential.classify(container_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_without_pattern() {
        let essential = EssentialContainers::new(["agent", "checkout"], None).unwrap();
        assert_eq!(essential.classify("agent"), ContainerRole::Essential);
        assert_eq!(essential.classify("container-0"), ContainerRole::Auxiliary);
    }

    #[test]
    fn unanchored_pattern_matches_substrings() {
        let essential = EssentialContainers::new(Vec::<String>::new(), Some(r"container-\d+")).unwrap();
        assert_eq!(essential.classify("container-3"), ContainerRole::Essential);
        assert_eq!(essential.classify("my-container-3-db"), ContainerRole::Essential);
        assert_eq!(essential.classify("postgres"), ContainerRole::Auxiliary);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(EssentialContainers::new(["agent"], Some("(")).is_err());
    }
}
