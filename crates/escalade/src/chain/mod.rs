use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::classify::{OutcomeCounts, StateHandling};
use crate::common::rsutils::{MemSize, WallTime};
use crate::{JobId, TaskIndex};

/// Unique, sortable identifier of a chain: `YYYYMMDD-HHMMSS-<suffix>`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn generate() -> ChainId {
        const SUFFIX_LEN: usize = 4;
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        ChainId(format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ChainId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            anyhow::bail!("Invalid chain id `{s}`");
        }
        Ok(ChainId(s.to_string()))
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainState {
    Running,
    Completed,
    FailedAtMax,
    FailedNotRetried,
}

impl ChainState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChainState::Running)
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainState::Running => "RUNNING",
            ChainState::Completed => "COMPLETED",
            ChainState::FailedAtMax => "FAILED_AT_MAX",
            ChainState::FailedNotRetried => "FAILED_NOT_RETRIED",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundState {
    Pending,
    Running,
    Escalating,
    Completed,
    TerminalFail,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundState::Pending => "PENDING",
            RoundState::Running => "RUNNING",
            RoundState::Escalating => "ESCALATING",
            RoundState::Completed => "COMPLETED",
            RoundState::TerminalFail => "TERMINAL_FAIL",
        };
        f.write_str(name)
    }
}

/// One step of the resource ladder.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Level {
    pub partitions: Vec<String>,
    pub memory: MemSize,
    pub time: WallTime,
}

/// The ordered escalation steps of a chain. Fixed at chain creation;
/// consecutive levels must strictly grow in memory or wall-time and must not
/// shrink in either.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct Ladder {
    levels: Vec<Level>,
}

impl Ladder {
    pub fn new(levels: Vec<Level>) -> anyhow::Result<Ladder> {
        if levels.is_empty() {
            anyhow::bail!("The resource ladder must have at least one level");
        }
        for (i, pair) in levels.windows(2).enumerate() {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.memory < prev.memory || next.time < prev.time {
                anyhow::bail!("Ladder level {} shrinks resources", i + 1);
            }
            if next.memory == prev.memory && next.time == prev.time {
                anyhow::bail!("Ladder level {} does not escalate any resource", i + 1);
            }
            if prev.partitions.is_empty() || next.partitions.is_empty() {
                anyhow::bail!("Ladder levels must name at least one partition");
            }
        }
        if levels[0].partitions.is_empty() {
            anyhow::bail!("Ladder levels must name at least one partition");
        }
        Ok(Ladder { levels })
    }

    pub fn level(&self, index: usize) -> Option<&Level> {
        self.levels.get(index)
    }

    pub fn max_level(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }
}

/// Terminal record of one task within one round. Never mutated once written.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub index: TaskIndex,
    pub state: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_mem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_path: Option<String>,
}

/// One submission attempt at a fixed ladder level for a subset of indices.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Round {
    pub round: u32,
    pub level: usize,
    pub memory: MemSize,
    pub time: WallTime,
    pub partitions: Vec<String>,
    /// Compressed form of the round's index set.
    pub array_spec: String,
    /// Canonical enumerated form, ascending.
    pub indices: Vec<TaskIndex>,
    /// More than one entry only when spec-length batching was required.
    #[serde(default)]
    pub job_ids: Vec<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watcher_id: Option<JobId>,
    pub state: RoundState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<OutcomeCounts>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskRecord>,
}

impl Round {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self.state,
            RoundState::Escalating | RoundState::Completed | RoundState::TerminalFail
        )
    }
}

/// Residual indices of a chain that ended at the top of the ladder,
/// split by the reason they kept failing.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Residuals {
    pub oom: Vec<TaskIndex>,
    pub timeout: Vec<TaskIndex>,
}

/// The whole per-chain document persisted by the checkpoint store. It is the
/// single source of truth shared by all handler invocations of the chain.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Chain {
    pub chain_id: ChainId,
    pub script: PathBuf,
    /// Preserved verbatim as a sequence; handlers read arguments from here,
    /// never from the scheduler's environment export.
    pub script_args: Vec<String>,
    pub array_spec: String,
    pub total_tasks: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_env: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<u32>,
    pub ladder: Ladder,
    pub state_handling: StateHandling,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub state: ChainState,
    #[serde(default)]
    pub completed_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residuals: Option<Residuals>,
    pub rounds: Vec<Round>,
}

impl Chain {
    pub fn round(&self, round: u32) -> Option<&Round> {
        self.rounds.get(round as usize)
    }

    pub fn round_mut(&mut self, round: u32) -> Option<&mut Round> {
        self.rounds.get_mut(round as usize)
    }

    pub fn last_round(&self) -> Option<&Round> {
        self.rounds.last()
    }

    /// Chains move monotonically through `RUNNING -> terminal` and never
    /// leave a terminal state.
    pub fn transition(&mut self, state: ChainState) -> anyhow::Result<()> {
        if self.state.is_terminal() && self.state != state {
            anyhow::bail!(
                "Chain {} is already {} and cannot become {}",
                self.chain_id,
                self.state,
                state
            );
        }
        self.state = state;
        Ok(())
    }
}
