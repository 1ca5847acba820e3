use std::fmt;

use crate::JobId;

/// A scheduler dependency expression.
///
/// For a single predecessor the precise forms `afternotok`/`afterok` are
/// used. As soon as a round consists of multiple batch jobs, both follow-ups
/// fall back to `afterany` over every batch: a pure on-failure dependency
/// becomes unsatisfiable the moment one batch has zero failures, which would
/// leave the handler pending forever and stall the chain. Handlers therefore
/// re-check the actual outcomes and exit early when there is nothing to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency(String);

impl Dependency {
    /// Runs the follow-up once the given jobs resolved with at least one
    /// failure (single job), or once all of them resolved (batched).
    pub fn on_failure(job_ids: &[JobId]) -> Dependency {
        debug_assert!(!job_ids.is_empty());
        match job_ids {
            [job_id] => Dependency(format!("afternotok:{job_id}")),
            _ => Self::after_any(job_ids),
        }
    }

    /// Runs the follow-up once the given jobs all succeeded (single job), or
    /// once all of them resolved (batched).
    pub fn on_success(job_ids: &[JobId]) -> Dependency {
        debug_assert!(!job_ids.is_empty());
        match job_ids {
            [job_id] => Dependency(format!("afterok:{job_id}")),
            _ => Self::after_any(job_ids),
        }
    }

    fn after_any(job_ids: &[JobId]) -> Dependency {
        let ids: Vec<String> = job_ids.iter().map(|id| id.to_string()).collect();
        Dependency(format!("afterany:{}", ids.join(":")))
    }

    /// True for the batched fallback form that fires on any outcome.
    pub fn is_any_outcome(&self) -> bool {
        self.0.starts_with("afterany:")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
