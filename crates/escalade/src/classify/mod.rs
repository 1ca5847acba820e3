use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::TaskIndex;
use crate::gateway::TaskStatus;

pub const STATE_COMPLETED: &str = "COMPLETED";
pub const STATE_OOM: &str = "OUT_OF_MEMORY";
pub const STATE_TIMEOUT: &str = "TIMEOUT";

/// Exit code reported when the memory cgroup kills a task with SIGKILL.
pub const OOM_EXIT_CODE: i32 = 137;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Handling {
    Escalate,
    NoRetry,
}

/// Per-state and per-exit-code overrides of the classification defaults.
/// States map directly to an action; `exit_codes` wins over the state map.
/// Anything not listed falls back to the built-in rules.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StateHandling {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exit_codes: BTreeMap<i32, Handling>,
    #[serde(flatten)]
    pub states: BTreeMap<String, Handling>,
}

impl StateHandling {
    fn action(&self, state: &str, exit_code: i32) -> Handling {
        if let Some(action) = self.exit_codes.get(&exit_code) {
            return *action;
        }
        if let Some(action) = self.states.get(state) {
            return *action;
        }
        // Built-in defaults: only resource exhaustion escalates.
        if state == STATE_OOM || state == STATE_TIMEOUT || exit_code == OOM_EXIT_CODE {
            Handling::Escalate
        } else {
            Handling::NoRetry
        }
    }
}

/// The four disjoint index sets of one resolved round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    pub completed: Vec<TaskIndex>,
    pub oom: Vec<TaskIndex>,
    pub timeout: Vec<TaskIndex>,
    pub other: Vec<TaskIndex>,
}

impl RoundOutcome {
    pub fn counts(&self) -> OutcomeCounts {
        OutcomeCounts {
            completed: self.completed.len() as u32,
            oom: self.oom.len() as u32,
            timeout: self.timeout.len() as u32,
            other: self.other.len() as u32,
        }
    }

    /// Indices that escalate to the next ladder level.
    pub fn retry_set(&self) -> Vec<TaskIndex> {
        let mut retry: Vec<TaskIndex> =
            self.oom.iter().chain(self.timeout.iter()).copied().collect();
        retry.sort_unstable();
        retry
    }

    pub fn total(&self) -> usize {
        self.completed.len() + self.oom.len() + self.timeout.len() + self.other.len()
    }
}

/// Per-outcome tallies of a resolved round, as stored in the checkpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub completed: u32,
    pub oom: u32,
    pub timeout: u32,
    pub other: u32,
}

/// Maps every terminal task state to one of the four outcome buckets.
///
/// Rules, in priority order: COMPLETED with exit 0 finishes the task;
/// OUT_OF_MEMORY (or exit 137) and TIMEOUT escalate; everything else is not
/// retried. Overrides can force an arbitrary state or exit code to escalate
/// or not; an overridden escalation without a timeout marker counts on the
/// memory side of the breakdown.
pub fn classify_round(statuses: &[TaskStatus], handling: &StateHandling) -> RoundOutcome {
    let mut outcome = RoundOutcome::default();
    for task in statuses {
        if task.state == STATE_COMPLETED && task.exit_code == 0 {
            outcome.completed.push(task.index);
            continue;
        }
        match handling.action(&task.state, task.exit_code) {
            Handling::Escalate if task.state == STATE_TIMEOUT => {
                outcome.timeout.push(task.index)
            }
            Handling::Escalate => outcome.oom.push(task.index),
            Handling::NoRetry => outcome.other.push(task.index),
        }
    }
    outcome.completed.sort_unstable();
    outcome.oom.sort_unstable();
    outcome.timeout.sort_unstable();
    outcome.other.sort_unstable();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(index: TaskIndex, state: &str, exit_code: i32) -> TaskStatus {
        TaskStatus {
            index,
            state: state.to_string(),
            exit_code,
            signal: 0,
            elapsed: None,
            node: None,
            peak_mem: None,
        }
    }

    #[test]
    fn default_rules() {
        let statuses = vec![
            task(0, "COMPLETED", 0),
            task(1, "OUT_OF_MEMORY", 0),
            task(2, "TIMEOUT", 0),
            task(3, "FAILED", 1),
            task(4, "FAILED", 137),
            task(5, "CANCELLED", 0),
            task(6, "NODE_FAIL", 0),
        ];
        let outcome = classify_round(&statuses, &StateHandling::default());
        assert_eq!(outcome.completed, vec![0]);
        assert_eq!(outcome.oom, vec![1, 4]);
        assert_eq!(outcome.timeout, vec![2]);
        assert_eq!(outcome.other, vec![3, 5, 6]);
    }

    #[test]
    fn buckets_are_disjoint_and_cover_the_round() {
        let statuses: Vec<TaskStatus> = (0..30)
            .map(|i| match i % 5 {
                0 => task(i, "COMPLETED", 0),
                1 => task(i, "OUT_OF_MEMORY", 0),
                2 => task(i, "TIMEOUT", 0),
                3 => task(i, "FAILED", 2),
                _ => task(i, "PREEMPTED", 0),
            })
            .collect();
        let outcome = classify_round(&statuses, &StateHandling::default());
        assert_eq!(outcome.total(), 30);

        let mut all: Vec<TaskIndex> = Vec::new();
        all.extend(&outcome.completed);
        all.extend(&outcome.oom);
        all.extend(&outcome.timeout);
        all.extend(&outcome.other);
        all.sort_unstable();
        assert_eq!(all, (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn mixed_round_retry_set() {
        // 30 tasks; OOM {1,4,7,8}, TIMEOUT {2,9}, exit-code errors {5,16}.
        let statuses: Vec<TaskStatus> = (0..30)
            .map(|i| match i {
                1 | 4 | 7 | 8 => task(i, "OUT_OF_MEMORY", 0),
                2 | 9 => task(i, "TIMEOUT", 0),
                5 | 16 => task(i, "FAILED", 1),
                _ => task(i, "COMPLETED", 0),
            })
            .collect();
        let outcome = classify_round(&statuses, &StateHandling::default());
        assert_eq!(outcome.retry_set(), vec![1, 2, 4, 7, 8, 9]);
        assert_eq!(outcome.other, vec![5, 16]);
        assert_eq!(outcome.counts().completed, 22);
    }

    #[test]
    fn state_override_escalates() {
        let mut handling = StateHandling::default();
        handling
            .states
            .insert("NODE_FAIL".to_string(), Handling::Escalate);
        let outcome = classify_round(&[task(3, "NODE_FAIL", 0)], &handling);
        assert_eq!(outcome.oom, vec![3]);
        assert!(outcome.other.is_empty());
    }

    #[test]
    fn exit_code_override_wins_over_state() {
        let mut handling = StateHandling::default();
        handling.exit_codes.insert(137, Handling::NoRetry);
        let outcome = classify_round(&[task(0, "FAILED", 137)], &handling);
        assert_eq!(outcome.other, vec![0]);
    }

    #[test]
    fn completed_with_nonzero_exit_is_not_completed() {
        let outcome = classify_round(&[task(0, "COMPLETED", 3)], &StateHandling::default());
        assert_eq!(outcome.other, vec![0]);
    }

    #[test]
    fn state_handling_yaml_shape() {
        let parsed: StateHandling = serde_yaml::from_str(
            "OUT_OF_MEMORY: escalate\nFAILED: no_retry\nexit_codes:\n  137: escalate\n",
        )
        .unwrap();
        assert_eq!(parsed.states.get("OUT_OF_MEMORY"), Some(&Handling::Escalate));
        assert_eq!(parsed.states.get("FAILED"), Some(&Handling::NoRetry));
        assert_eq!(parsed.exit_codes.get(&137), Some(&Handling::Escalate));
    }
}
