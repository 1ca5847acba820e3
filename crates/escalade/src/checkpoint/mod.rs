use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;

use crate::chain::{Chain, ChainId, ChainState, Residuals, Round};
use crate::common::utils::fs::atomic_write;

pub const CHECKPOINT_EXTENSION: &str = "checkpoint";

const LOAD_ATTEMPTS: u32 = 3;
const LOAD_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Durable per-chain store: one YAML document per chain id under a
/// configured directory, replaced atomically on every update.
///
/// Writers for the same chain are serialized by the scheduler dependency
/// graph; the store never takes file locks. Readers tolerate a concurrent
/// replacement by retrying a failed parse a couple of times.
pub struct CheckpointStore {
    directory: PathBuf,
}

impl CheckpointStore {
    pub fn open(directory: PathBuf) -> anyhow::Result<CheckpointStore> {
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("Cannot create checkpoint directory {}", directory.display()))?;
        Ok(CheckpointStore { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn checkpoint_path(&self, chain_id: &ChainId) -> PathBuf {
        self.directory
            .join(format!("{chain_id}.{CHECKPOINT_EXTENSION}"))
    }

    /// Persists a freshly created chain. Refuses to overwrite an existing
    /// checkpoint; chain ids own their file exclusively.
    pub fn create(&self, chain: &Chain) -> anyhow::Result<()> {
        let path = self.checkpoint_path(&chain.chain_id);
        if path.exists() {
            anyhow::bail!("Checkpoint {} already exists", path.display());
        }
        self.write(chain, &path)
    }

    pub fn load(&self, chain_id: &ChainId) -> anyhow::Result<Chain> {
        let path = self.checkpoint_path(chain_id);
        let mut attempt = 1;
        loop {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Cannot read checkpoint {}", path.display()))?;
            match serde_yaml::from_str(&content) {
                Ok(chain) => return Ok(chain),
                Err(error) if attempt < LOAD_ATTEMPTS => {
                    // A writer may have replaced the file mid-read.
                    log::debug!("Checkpoint parse attempt {attempt} failed: {error}");
                    std::thread::sleep(LOAD_RETRY_DELAY);
                    attempt += 1;
                }
                Err(error) => {
                    return Err(anyhow::Error::from(error)
                        .context(format!("Cannot parse checkpoint {}", path.display())));
                }
            }
        }
    }

    /// Read-modify-write with atomic replacement. Every state transition of
    /// a chain goes through here.
    pub fn modify<R>(
        &self,
        chain_id: &ChainId,
        f: impl FnOnce(&mut Chain) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let mut chain = self.load(chain_id)?;
        let result = f(&mut chain)?;
        chain.updated = Utc::now();
        self.write(&chain, &self.checkpoint_path(chain_id))?;
        Ok(result)
    }

    pub fn append_round(&self, chain_id: &ChainId, round: Round) -> anyhow::Result<()> {
        self.modify(chain_id, |chain| {
            anyhow::ensure!(
                round.round as usize == chain.rounds.len(),
                "Round {} appended out of order",
                round.round
            );
            chain.rounds.push(round);
            Ok(())
        })
    }

    pub fn mark_completed(&self, chain_id: &ChainId, completed_count: u32) -> anyhow::Result<()> {
        self.modify(chain_id, |chain| {
            chain.transition(ChainState::Completed)?;
            chain.completed_count = completed_count;
            Ok(())
        })
    }

    pub fn mark_failed_at_max(
        &self,
        chain_id: &ChainId,
        residuals: Residuals,
    ) -> anyhow::Result<()> {
        self.modify(chain_id, |chain| {
            chain.transition(ChainState::FailedAtMax)?;
            chain.residuals = Some(residuals);
            Ok(())
        })
    }

    pub fn mark_not_retried(&self, chain_id: &ChainId, reason: String) -> anyhow::Result<()> {
        self.modify(chain_id, |chain| {
            chain.transition(ChainState::FailedNotRetried)?;
            chain.failure_reason = Some(reason);
            Ok(())
        })
    }

    /// The exact argument vector preserved at chain creation.
    pub fn preserved_args(&self, chain_id: &ChainId) -> anyhow::Result<Vec<String>> {
        Ok(self.load(chain_id)?.script_args)
    }

    /// All chains in the store, sorted by id (and therefore creation time).
    pub fn list_all(&self) -> anyhow::Result<Vec<Chain>> {
        let mut chains = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match stem.parse::<ChainId>().and_then(|id| self.load(&id)) {
                Ok(chain) => chains.push(chain),
                Err(error) => log::warn!("Skipping unreadable checkpoint {}: {error}", path.display()),
            }
        }
        chains.sort_by(|a, b| a.chain_id.cmp(&b.chain_id));
        Ok(chains)
    }

    fn write(&self, chain: &Chain, path: &Path) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(chain).context("Cannot serialize checkpoint")?;
        atomic_write(path, content.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::{test_chain, test_round};
    use tempdir::TempDir;

    fn store() -> (TempDir, CheckpointStore) {
        let dir = TempDir::new("checkpoints").unwrap();
        let store = CheckpointStore::open(dir.path().to_path_buf()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_load_roundtrip() {
        let (_dir, store) = store();
        let chain = test_chain("20260101-010203-ab12", &[0, 1, 2]);
        store.create(&chain).unwrap();

        let loaded = store.load(&chain.chain_id).unwrap();
        assert_eq!(loaded.chain_id, chain.chain_id);
        assert_eq!(loaded.total_tasks, 3);
        assert_eq!(loaded.state, ChainState::Running);
        assert!(store.create(&chain).is_err());
    }

    #[test]
    fn args_survive_whitespace_and_quotes() {
        let (_dir, store) = store();
        let mut chain = test_chain("20260101-010203-ab12", &[0]);
        chain.script_args = vec![
            "--msg".to_string(),
            "hello  world".to_string(),
            "tab\there".to_string(),
            "it's \"quoted\", yes".to_string(),
            "".to_string(),
        ];
        store.create(&chain).unwrap();
        assert_eq!(
            store.preserved_args(&chain.chain_id).unwrap(),
            chain.script_args
        );
    }

    #[test]
    fn append_round_enforces_order() {
        let (_dir, store) = store();
        let chain = test_chain("20260101-010203-ab12", &[0, 1]);
        store.create(&chain).unwrap();

        store
            .append_round(&chain.chain_id, test_round(0, &[0, 1]))
            .unwrap();
        assert!(store
            .append_round(&chain.chain_id, test_round(2, &[1]))
            .is_err());
        assert_eq!(store.load(&chain.chain_id).unwrap().rounds.len(), 1);
    }

    #[test]
    fn crash_before_rename_keeps_old_checkpoint() {
        let (_dir, store) = store();
        let chain = test_chain("20260101-010203-ab12", &[0, 1]);
        store.create(&chain).unwrap();

        // A writer that died after writing its temp file but before the
        // rename leaves only a stray sibling behind.
        let path = store.checkpoint_path(&chain.chain_id);
        let stray = path.with_file_name(".tmp-half-written");
        std::fs::write(&stray, "chain_id: [garbage").unwrap();

        let loaded = store.load(&chain.chain_id).unwrap();
        assert_eq!(loaded.chain_id, chain.chain_id);
        assert_eq!(loaded.rounds.len(), 0);
    }

    #[test]
    fn corrupt_checkpoint_is_reported_not_rewritten() {
        let (_dir, store) = store();
        let chain = test_chain("20260101-010203-ab12", &[0]);
        store.create(&chain).unwrap();

        let path = store.checkpoint_path(&chain.chain_id);
        std::fs::write(&path, "not: [valid: yaml").unwrap();
        assert!(store.load(&chain.chain_id).is_err());
        // The broken document is left for the operator to repair.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not: [valid: yaml");
    }

    #[test]
    fn list_all_sorted() {
        let (_dir, store) = store();
        for id in ["20260102-000000-bbbb", "20260101-000000-aaaa"] {
            store.create(&test_chain(id, &[0])).unwrap();
        }
        let chains = store.list_all().unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].chain_id.as_str(), "20260101-000000-aaaa");
    }

    #[test]
    fn terminal_transitions() {
        let (_dir, store) = store();
        let chain = test_chain("20260101-010203-ab12", &[0]);
        store.create(&chain).unwrap();

        store.mark_completed(&chain.chain_id, 1).unwrap();
        let loaded = store.load(&chain.chain_id).unwrap();
        assert_eq!(loaded.state, ChainState::Completed);
        assert_eq!(loaded.completed_count, 1);

        // Terminal states are sticky.
        assert!(store
            .mark_not_retried(&chain.chain_id, "oops".to_string())
            .is_err());
    }
}
