use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Deserializer};

use crate::chain::{Ladder, Level};
use crate::classify::StateHandling;
use crate::common::rsutils::{MemSize, WallTime};

/// Top-level YAML configuration of the orchestrator.
#[derive(Deserialize, Debug, Clone)]
pub struct EscalationConfig {
    pub levels: Vec<LevelConfig>,
    #[serde(default = "default_max_array_spec_len")]
    pub max_array_spec_len: usize,
    #[serde(default = "default_settle_delay")]
    pub sacct_settle_delay_sec: u64,
    #[serde(default)]
    pub state_handling: StateHandling,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LevelConfig {
    #[serde(deserialize_with = "deserialize_partitions")]
    pub partition: Vec<String>,
    pub mem: MemSize,
    pub time: WallTime,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TrackerConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub history_log: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            checkpoint_dir: default_checkpoint_dir(),
            output_dir: default_output_dir(),
            history_log: None,
        }
    }
}

fn default_max_array_spec_len() -> usize {
    10_000
}

fn default_settle_delay() -> u64 {
    2
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("escalade-tracker/checkpoints")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("escalade-tracker/output")
}

/// `partition` accepts a single name, a comma-separated string, or a list.
fn deserialize_partitions<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }

    let partitions = match Raw::deserialize(deserializer)? {
        Raw::One(value) => value
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        Raw::Many(values) => values,
    };
    Ok(partitions)
}

impl EscalationConfig {
    pub fn load(path: &Path) -> anyhow::Result<EscalationConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config {}", path.display()))?;
        let config: EscalationConfig =
            serde_yaml::from_str(&content).context("Failed to parse config")?;
        // Surface ladder problems at load time, before any chain exists.
        config.ladder()?;
        Ok(config)
    }

    pub fn ladder(&self) -> anyhow::Result<Ladder> {
        let levels = self
            .levels
            .iter()
            .map(|level| Level {
                partitions: level.partition.clone(),
                memory: level.mem,
                time: level.time,
            })
            .collect();
        Ladder::new(levels)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.sacct_settle_delay_sec)
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        let levels = vec![
            LevelConfig {
                partition: vec!["normal".to_string()],
                mem: "1G".parse().unwrap(),
                time: "01:00:00".parse().unwrap(),
            },
            LevelConfig {
                partition: vec!["normal".to_string()],
                mem: "4G".parse().unwrap(),
                time: "04:00:00".parse().unwrap(),
            },
        ];
        EscalationConfig {
            levels,
            max_array_spec_len: default_max_array_spec_len(),
            sacct_settle_delay_sec: default_settle_delay(),
            state_handling: StateHandling::default(),
            logging: LoggingConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}
