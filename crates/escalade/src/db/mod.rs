use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use rusqlite::{Connection, params};

use crate::JobId;
use crate::chain::{Chain, ChainId, Round, TaskRecord};
use crate::event::Action;

/// Best-effort relational mirror of checkpoint state.
///
/// The checkpoint stays authoritative; every method here returns a `Result`
/// that callers log and drop, so a broken database never stalls a chain.
pub struct Mirror {
    conn: Connection,
}

impl Mirror {
    pub fn open(path: &Path) -> anyhow::Result<Mirror> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Cannot open mirror database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        init_schema(&conn)?;
        Ok(Mirror { conn })
    }

    pub fn record_chain(&self, chain: &Chain) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO chains
             (chain_id, script, args, array_spec, total_tasks, created_at, updated_at, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                chain.chain_id.as_str(),
                chain.script.display().to_string(),
                serde_json::to_string(&chain.script_args)?,
                chain.array_spec,
                chain.total_tasks,
                chain.created.to_rfc3339(),
                chain.updated.to_rfc3339(),
                chain.state.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn update_chain_state(&self, chain: &Chain) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE chains SET updated_at = ?2, state = ?3 WHERE chain_id = ?1",
            params![
                chain.chain_id.as_str(),
                Utc::now().to_rfc3339(),
                chain.state.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn record_round(&self, chain_id: &ChainId, round: &Round) -> anyhow::Result<()> {
        let job_ids: Vec<String> = round.job_ids.iter().map(|id| id.to_string()).collect();
        self.conn.execute(
            "INSERT OR REPLACE INTO rounds
             (chain_id, round_no, level, memory, time, partition, job_ids, state,
              completed_count, oom_count, timeout_count, other_count, submitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                chain_id.as_str(),
                round.round,
                round.level as u32,
                round.memory.to_string(),
                round.time.to_string(),
                round.partitions.join(","),
                job_ids.join(","),
                round.state.to_string(),
                round.counts.map(|c| c.completed),
                round.counts.map(|c| c.oom),
                round.counts.map(|c| c.timeout),
                round.counts.map(|c| c.other),
                round.submitted.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn record_tasks(
        &self,
        chain_id: &ChainId,
        round_no: u32,
        tasks: &[TaskRecord],
    ) -> anyhow::Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT OR REPLACE INTO tasks
             (chain_id, round_no, task_id, state, exit_code, elapsed, node, peak_mem,
              out_path, err_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for task in tasks {
            stmt.execute(params![
                chain_id.as_str(),
                round_no,
                task.index,
                task.state,
                task.exit_code,
                task.elapsed,
                task.node,
                task.peak_mem,
                task.out_path,
                task.err_path,
            ])?;
        }
        Ok(())
    }

    pub fn record_action(
        &self,
        chain_id: &ChainId,
        action: Action,
        job_ids: &[JobId],
        level: Option<usize>,
        indices: Option<&str>,
    ) -> anyhow::Result<()> {
        let job_ids: Vec<String> = job_ids.iter().map(|id| id.to_string()).collect();
        self.conn.execute(
            "INSERT INTO actions (ts, chain_id, action, job_id, level, indices)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Utc::now().to_rfc3339(),
                chain_id.as_str(),
                action.to_string(),
                job_ids.join(","),
                level.map(|l| l as u32),
                indices,
            ],
        )?;
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chains (
             chain_id TEXT PRIMARY KEY,
             script TEXT NOT NULL,
             args TEXT,
             array_spec TEXT,
             total_tasks INTEGER,
             created_at TEXT NOT NULL,
             updated_at TEXT NOT NULL,
             state TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS rounds (
             chain_id TEXT NOT NULL,
             round_no INTEGER NOT NULL,
             level INTEGER NOT NULL,
             memory TEXT,
             time TEXT,
             partition TEXT,
             job_ids TEXT,
             state TEXT NOT NULL,
             completed_count INTEGER,
             oom_count INTEGER,
             timeout_count INTEGER,
             other_count INTEGER,
             submitted_at TEXT,
             PRIMARY KEY (chain_id, round_no)
         );
         CREATE TABLE IF NOT EXISTS tasks (
             chain_id TEXT NOT NULL,
             round_no INTEGER NOT NULL,
             task_id INTEGER NOT NULL,
             state TEXT,
             exit_code INTEGER,
             elapsed TEXT,
             node TEXT,
             peak_mem TEXT,
             out_path TEXT,
             err_path TEXT,
             PRIMARY KEY (chain_id, round_no, task_id)
         );
         CREATE TABLE IF NOT EXISTS actions (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             ts TEXT NOT NULL,
             chain_id TEXT NOT NULL,
             action TEXT NOT NULL,
             job_id TEXT,
             level INTEGER,
             indices TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_rounds_chain ON rounds(chain_id);
         CREATE INDEX IF NOT EXISTS idx_tasks_chain ON tasks(chain_id);
         CREATE INDEX IF NOT EXISTS idx_actions_chain ON actions(chain_id);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::{test_chain, test_round};
    use tempdir::TempDir;

    #[test]
    fn mirror_roundtrip() {
        let dir = TempDir::new("mirror").unwrap();
        let mirror = Mirror::open(&dir.path().join("escalade.sqlite")).unwrap();
        let chain = test_chain("20260101-000000-aaaa", &[0, 1, 2]);

        mirror.record_chain(&chain).unwrap();
        mirror.record_round(&chain.chain_id, &test_round(0, &[0, 1, 2])).unwrap();
        mirror
            .record_action(&chain.chain_id, Action::Submit, &[100], Some(0), Some("0-2"))
            .unwrap();

        let count: u32 = mirror
            .conn
            .query_row("SELECT COUNT(*) FROM rounds", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let state: String = mirror
            .conn
            .query_row("SELECT state FROM chains WHERE chain_id = ?1", ["20260101-000000-aaaa"], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(state, "RUNNING");
    }
}
