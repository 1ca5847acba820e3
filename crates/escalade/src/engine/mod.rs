use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;

use crate::chain::{Chain, ChainId, Residuals, Round, RoundState, TaskRecord};
use crate::checkpoint::CheckpointStore;
use crate::classify::{RoundOutcome, classify_round};
use crate::common::arraydef::{IntArray, batch_ids};
use crate::common::rsutils::{MemSize, WallTime};
use crate::common::utils::str::quote_shell;
use crate::db::Mirror;
use crate::event::{Action, EventLog};
use crate::gateway::{
    Dependency, Resources, SchedulerGateway, SubmitRequest, TaskStatus,
};
use crate::{JobId, Map, TaskIndex};

const HANDLER_MEM_BYTES: u64 = 512 << 20;
const HANDLER_TIME: Duration = Duration::from_secs(600);

/// Everything a handler invocation needs to make progress on a chain.
pub struct EngineContext<'a> {
    pub store: &'a CheckpointStore,
    pub gateway: &'a dyn SchedulerGateway,
    pub events: Option<&'a EventLog>,
    pub mirror: Option<&'a Mirror>,
    pub settle_delay: Duration,
    pub max_spec_len: usize,
    pub output_dir: PathBuf,
    pub binary: PathBuf,
    pub config_path: Option<PathBuf>,
}

enum ControlKind {
    Handler,
    Watcher,
}

impl EngineContext<'_> {
    fn record_event(
        &self,
        chain_id: &ChainId,
        action: Action,
        job_ids: &[JobId],
        level: Option<usize>,
        indices: Option<&str>,
    ) {
        if let Some(events) = self.events {
            events.record(chain_id, action, job_ids, level, indices);
        }
        if let Some(mirror) = self.mirror {
            if let Err(error) = mirror.record_action(chain_id, action, job_ids, level, indices) {
                log::warn!("Mirror action write failed: {error}");
            }
        }
    }

    fn mirror_round(&self, chain_id: &ChainId, round: &Round) {
        if let Some(mirror) = self.mirror {
            if let Err(error) = mirror.record_round(chain_id, round) {
                log::warn!("Mirror round write failed: {error}");
            }
        }
    }

    fn mirror_tasks(&self, chain_id: &ChainId, round_no: u32, tasks: &[TaskRecord]) {
        if let Some(mirror) = self.mirror {
            if let Err(error) = mirror.record_tasks(chain_id, round_no, tasks) {
                log::warn!("Mirror task write failed: {error}");
            }
        }
    }

    fn mirror_chain(&self, chain: &Chain) {
        if let Some(mirror) = self.mirror {
            if let Err(error) = mirror.update_chain_state(chain) {
                log::warn!("Mirror chain write failed: {error}");
            }
        }
    }

    fn chain_dir(&self, chain_id: &ChainId) -> PathBuf {
        self.output_dir.join(chain_id.as_str())
    }

    fn output_patterns(&self, chain_id: &ChainId, round_no: u32) -> (String, String) {
        let dir = self.chain_dir(chain_id);
        (
            format!("{}/r{}-%A_%a.out", dir.display(), round_no),
            format!("{}/r{}-%A_%a.err", dir.display(), round_no),
        )
    }
}

/// Entry point of the failure handler scheduled after every round.
///
/// Classifies the resolved round, persists its task records and counts,
/// and then either completes the chain, ends it at the top of the ladder,
/// or submits the retryable indices one level up.
pub async fn handle_round_failure(
    ctx: &EngineContext<'_>,
    chain_id: &ChainId,
    round_no: u32,
) -> anyhow::Result<()> {
    let chain = ctx.store.load(chain_id)?;
    if chain.state.is_terminal() {
        log::info!("Chain {chain_id} is already {}; nothing to do", chain.state);
        return Ok(());
    }

    // A predecessor that crashed between appending a round and submitting it
    // leaves a PENDING round without job ids; pick the submission back up.
    if let Some(last) = chain.last_round() {
        if last.state == RoundState::Pending && last.job_ids.is_empty() {
            log::warn!(
                "Chain {chain_id} round {} was appended but never submitted; resubmitting",
                last.round
            );
            return submit_round(ctx, chain_id, last.round).await;
        }
    }

    let round = chain
        .round(round_no)
        .with_context(|| format!("Chain {chain_id} has no round {round_no}"))?
        .clone();
    if round.is_resolved() {
        log::info!("Round {round_no} of chain {chain_id} is already resolved");
        return Ok(());
    }

    let (statuses, job_of_index) = collect_statuses(ctx, &round).await?;
    let outcome = classify_round(&statuses, &chain.state_handling);
    let retry = outcome.retry_set();

    let at_max = !retry.is_empty() && round.level + 1 > chain.ladder.max_level();
    let round_state = if retry.is_empty() {
        RoundState::Completed
    } else if at_max {
        RoundState::TerminalFail
    } else {
        RoundState::Escalating
    };

    let tasks = build_task_records(ctx, chain_id, &round, &statuses, &job_of_index);
    let (updated_round, other_total) =
        persist_resolution(ctx, chain_id, round_no, tasks, &outcome, round_state)?;
    ctx.mirror_round(chain_id, &updated_round);

    if !outcome.other.is_empty() {
        let spec = IntArray::from_ids(&outcome.other).to_string();
        log::info!(
            "Chain {chain_id} round {round_no}: {} tasks failed with non-resource errors and will not be retried ({spec})",
            outcome.other.len()
        );
        ctx.record_event(
            chain_id,
            Action::NotRetried,
            &round.job_ids,
            Some(round.level),
            Some(&spec),
        );
    }

    if retry.is_empty() {
        let completed_total = chain.total_tasks - other_total;
        ctx.store.mark_completed(chain_id, completed_total)?;
        log::info!(
            "Chain {chain_id} completed: {completed_total}/{} tasks finished",
            chain.total_tasks
        );
        ctx.record_event(chain_id, Action::Complete, &round.job_ids, Some(round.level), None);
        ctx.mirror_chain(&ctx.store.load(chain_id)?);
    } else if at_max {
        let residuals = Residuals {
            oom: outcome.oom.clone(),
            timeout: outcome.timeout.clone(),
        };
        let spec = IntArray::from_ids(&retry).to_string();
        ctx.store.mark_failed_at_max(chain_id, residuals)?;
        log::warn!(
            "Chain {chain_id} reached the top of the ladder with {} unresolved tasks ({spec})",
            retry.len()
        );
        ctx.record_event(
            chain_id,
            Action::FailAtMax,
            &round.job_ids,
            Some(round.level),
            Some(&spec),
        );
        ctx.mirror_chain(&ctx.store.load(chain_id)?);
    } else {
        let next_level = round.level + 1;
        let level = chain
            .ladder
            .level(next_level)
            .expect("next level bounds were checked");
        let next_round = Round {
            round: round_no + 1,
            level: next_level,
            memory: level.memory,
            time: level.time,
            partitions: level.partitions.clone(),
            array_spec: IntArray::from_ids(&retry).to_string(),
            indices: retry.clone(),
            job_ids: vec![],
            handler_id: None,
            watcher_id: None,
            state: RoundState::Pending,
            submitted: None,
            counts: None,
            tasks: vec![],
        };
        ctx.store.append_round(chain_id, next_round)?;
        log::info!(
            "Chain {chain_id}: escalating {} tasks to level {next_level} ({}, {})",
            retry.len(),
            level.memory,
            level.time,
        );
        if let Err(error) = submit_round(ctx, chain_id, round_no + 1).await {
            // Submission retries are exhausted; close the chain but leave any
            // job that did get through running under its own follow-ups.
            let reason = format!("Could not submit round {}: {error:#}", round_no + 1);
            ctx.store.mark_not_retried(chain_id, reason.clone())?;
            ctx.mirror_chain(&ctx.store.load(chain_id)?);
            anyhow::bail!(reason);
        }
    }

    sweep_stale_handlers(ctx, chain_id, round_no + 1).await;
    Ok(())
}

/// Entry point of the success watcher. Runs when every task of the round may
/// have succeeded; verifies that from accounting, marks the chain completed,
/// and otherwise leaves all resolution to the failure handler.
pub async fn handle_round_success(
    ctx: &EngineContext<'_>,
    chain_id: &ChainId,
    round_no: u32,
) -> anyhow::Result<()> {
    let chain = ctx.store.load(chain_id)?;
    if chain.state.is_terminal() {
        log::info!("Chain {chain_id} is already {}; nothing to do", chain.state);
        return Ok(());
    }

    let round = chain
        .round(round_no)
        .with_context(|| format!("Chain {chain_id} has no round {round_no}"))?
        .clone();
    if round.is_resolved() {
        return Ok(());
    }

    let (statuses, job_of_index) = collect_statuses(ctx, &round).await?;
    let outcome = classify_round(&statuses, &chain.state_handling);
    if outcome.completed.len() != round.indices.len() {
        log::info!(
            "Chain {chain_id} round {round_no} has failures; the failure handler owns it"
        );
        return Ok(());
    }

    let tasks = build_task_records(ctx, chain_id, &round, &statuses, &job_of_index);
    let (updated_round, other_total) =
        persist_resolution(ctx, chain_id, round_no, tasks, &outcome, RoundState::Completed)?;
    ctx.mirror_round(chain_id, &updated_round);

    let completed_total = chain.total_tasks - other_total;
    ctx.store.mark_completed(chain_id, completed_total)?;
    log::info!(
        "Chain {chain_id} completed: {completed_total}/{} tasks finished",
        chain.total_tasks
    );
    ctx.record_event(chain_id, Action::Complete, &round.job_ids, Some(round.level), None);
    ctx.mirror_chain(&ctx.store.load(chain_id)?);

    sweep_stale_handlers(ctx, chain_id, round_no + 1).await;
    Ok(())
}

/// Submits the jobs of a PENDING round together with its follow-up handler
/// and success watcher, then records the job ids in the checkpoint.
///
/// Idempotent: an already-submitted round is left alone, and jobs that are
/// still visible in the queue under this round's name are adopted instead of
/// being submitted twice.
pub async fn submit_round(
    ctx: &EngineContext<'_>,
    chain_id: &ChainId,
    round_no: u32,
) -> anyhow::Result<()> {
    let chain = ctx.store.load(chain_id)?;
    let round = chain
        .round(round_no)
        .with_context(|| format!("Chain {chain_id} has no round {round_no}"))?
        .clone();
    if !round.job_ids.is_empty() {
        log::info!("Round {round_no} of chain {chain_id} is already submitted");
        return Ok(());
    }

    std::fs::create_dir_all(ctx.chain_dir(chain_id))?;

    let job_ids = match adopt_existing_jobs(ctx, chain_id, round_no).await {
        Some(job_ids) => {
            log::warn!(
                "Adopting already-queued jobs {job_ids:?} for round {round_no} of chain {chain_id}"
            );
            job_ids
        }
        None => {
            let batches = batch_ids(&round.indices, ctx.max_spec_len)?;
            let mut job_ids = Vec::with_capacity(batches.len());
            for (batch_no, batch) in batches.iter().enumerate() {
                let request = round_request(ctx, &chain, &round, batch, batch_no, batches.len());
                job_ids.push(ctx.gateway.submit(request).await?);
            }
            job_ids
        }
    };

    let handler = control_request(
        ctx,
        &chain,
        &round,
        ControlKind::Handler,
        Dependency::on_failure(&job_ids),
    )?;
    let handler_id = ctx.gateway.submit(handler).await?;
    let watcher = control_request(
        ctx,
        &chain,
        &round,
        ControlKind::Watcher,
        Dependency::on_success(&job_ids),
    )?;
    let watcher_id = ctx.gateway.submit(watcher).await?;

    let updated_round = ctx.store.modify(chain_id, |chain| {
        let round = chain
            .round_mut(round_no)
            .with_context(|| format!("Round {round_no} disappeared"))?;
        round.job_ids = job_ids.clone();
        round.handler_id = Some(handler_id);
        round.watcher_id = Some(watcher_id);
        round.state = RoundState::Running;
        round.submitted = Some(Utc::now());
        Ok(round.clone())
    })?;
    ctx.mirror_round(chain_id, &updated_round);

    let action = if round_no == 0 {
        Action::Submit
    } else {
        Action::Escalate
    };
    ctx.record_event(
        chain_id,
        action,
        &job_ids,
        Some(round.level),
        Some(&updated_round.array_spec),
    );
    Ok(())
}

/// Queries accounting for every job of the round and returns one record per
/// round index, plus the job that reported each index. Tasks the accounting
/// subsystem does not know yet are re-queried once after the settle delay
/// and then recorded as unknown, which classifies them as not retried.
async fn collect_statuses(
    ctx: &EngineContext<'_>,
    round: &Round,
) -> anyhow::Result<(Vec<TaskStatus>, Map<TaskIndex, JobId>)> {
    if !ctx.settle_delay.is_zero() {
        tokio::time::sleep(ctx.settle_delay).await;
    }

    let mut by_index: Map<TaskIndex, TaskStatus> = Map::new();
    let mut job_of_index: Map<TaskIndex, JobId> = Map::new();
    for job_id in &round.job_ids {
        for record in ctx.gateway.classify(*job_id).await? {
            job_of_index.insert(record.index, *job_id);
            by_index.insert(record.index, record);
        }
    }

    let missing = round
        .indices
        .iter()
        .filter(|index| !by_index.contains_key(*index))
        .count();
    if missing > 0 {
        log::warn!(
            "{missing} tasks of round {} have no accounting record yet; re-querying",
            round.round
        );
        if !ctx.settle_delay.is_zero() {
            tokio::time::sleep(ctx.settle_delay).await;
        }
        for job_id in &round.job_ids {
            for record in ctx.gateway.classify(*job_id).await? {
                job_of_index.insert(record.index, *job_id);
                by_index.insert(record.index, record);
            }
        }
    }

    let statuses = round
        .indices
        .iter()
        .map(|index| {
            by_index.remove(index).unwrap_or_else(|| TaskStatus {
                index: *index,
                state: "UNKNOWN".to_string(),
                exit_code: -1,
                signal: 0,
                elapsed: None,
                node: None,
                peak_mem: None,
            })
        })
        .collect();
    Ok((statuses, job_of_index))
}

fn build_task_records(
    ctx: &EngineContext<'_>,
    chain_id: &ChainId,
    round: &Round,
    statuses: &[TaskStatus],
    job_of_index: &Map<TaskIndex, JobId>,
) -> Vec<TaskRecord> {
    let (out_pattern, err_pattern) = ctx.output_patterns(chain_id, round.round);
    statuses
        .iter()
        .map(|task| {
            let paths = job_of_index.get(&task.index).map(|job_id| {
                let fill = |pattern: &str| {
                    pattern
                        .replace("%A", &job_id.to_string())
                        .replace("%a", &task.index.to_string())
                };
                (fill(&out_pattern), fill(&err_pattern))
            });
            TaskRecord {
                index: task.index,
                state: task.state.clone(),
                exit_code: task.exit_code,
                elapsed: task.elapsed.clone(),
                node: task.node.clone(),
                peak_mem: task.peak_mem.clone(),
                out_path: paths.as_ref().map(|(out, _)| out.clone()),
                err_path: paths.map(|(_, err)| err),
            }
        })
        .collect()
}

/// Writes the round resolution in the required order: task records and
/// counts land together with the round state in one atomic update; chain
/// level transitions happen in separate, later writes. Returns the updated
/// round and the chain-wide count of tasks that were never retried.
fn persist_resolution(
    ctx: &EngineContext<'_>,
    chain_id: &ChainId,
    round_no: u32,
    tasks: Vec<TaskRecord>,
    outcome: &RoundOutcome,
    state: RoundState,
) -> anyhow::Result<(Round, u32)> {
    ctx.store.modify(chain_id, |chain| {
        let round = chain
            .round_mut(round_no)
            .with_context(|| format!("Round {round_no} disappeared"))?;
        round.tasks = tasks;
        round.counts = Some(outcome.counts());
        round.state = state;
        let round = round.clone();
        let other_total = chain
            .rounds
            .iter()
            .map(|r| r.counts.map(|c| c.other).unwrap_or(0))
            .sum();
        Ok((round, other_total))
    })
    .map(|(round, other_total)| {
        ctx.mirror_tasks(chain_id, round_no, &round.tasks);
        (round, other_total)
    })
}

fn round_request(
    ctx: &EngineContext<'_>,
    chain: &Chain,
    round: &Round,
    batch: &IntArray,
    batch_no: usize,
    batch_count: usize,
) -> SubmitRequest {
    let name = if batch_count > 1 {
        format!("esc-{}-r{}-b{}", chain.chain_id, round.round, batch_no)
    } else {
        format!("esc-{}-r{}", chain.chain_id, round.round)
    };
    let (stdout, stderr) = ctx.output_patterns(&chain.chain_id, round.round);
    SubmitRequest {
        name,
        array: Some(batch.clone()),
        resources: Resources {
            partitions: round.partitions.clone(),
            memory: round.memory,
            time: round.time,
            stdout,
            stderr,
            throttle: chain.throttle,
        },
        script: chain.script.clone(),
        // Straight from the checkpoint; never re-serialized through the
        // environment export.
        script_args: chain.script_args.clone(),
        env: chain.user_env.clone(),
        dependency: None,
    }
}

fn control_request(
    ctx: &EngineContext<'_>,
    chain: &Chain,
    round: &Round,
    kind: ControlKind,
    dependency: Dependency,
) -> anyhow::Result<SubmitRequest> {
    let (tag, subcmd) = match kind {
        ControlKind::Handler => ('h', "handle"),
        ControlKind::Watcher => ('w', "finish"),
    };
    let chain_dir = ctx.chain_dir(&chain.chain_id);
    let script_path = chain_dir.join(format!("{subcmd}-r{}.sh", round.round));

    let mut command = vec![
        ctx.binary.display().to_string(),
        subcmd.to_string(),
        "--chain".to_string(),
        chain.chain_id.to_string(),
        "--round".to_string(),
        round.round.to_string(),
    ];
    if let Some(config) = &ctx.config_path {
        command.push("--config".to_string());
        command.push(config.display().to_string());
    }
    let quoted: Vec<String> = command.iter().map(|arg| quote_shell(arg)).collect();
    let script = format!("#!/bin/bash\nexec {}\n", quoted.join(" "));
    std::fs::write(&script_path, script)
        .with_context(|| format!("Cannot write handler script {}", script_path.display()))?;

    Ok(SubmitRequest {
        name: format!("esc-{}-{}{}", chain.chain_id, tag, round.round),
        array: None,
        resources: Resources {
            partitions: round.partitions.clone(),
            memory: MemSize::from_bytes(HANDLER_MEM_BYTES),
            time: WallTime::from_duration(HANDLER_TIME),
            stdout: format!("{}/{subcmd}-r{}.out", chain_dir.display(), round.round),
            stderr: format!("{}/{subcmd}-r{}.err", chain_dir.display(), round.round),
            throttle: None,
        },
        script: script_path,
        script_args: vec![],
        env: vec![],
        dependency: Some(dependency),
    })
}

/// Looks for jobs of this round that are already queued, left behind by a
/// predecessor that crashed between submission and the checkpoint write.
async fn adopt_existing_jobs(
    ctx: &EngineContext<'_>,
    chain_id: &ChainId,
    round_no: u32,
) -> Option<Vec<JobId>> {
    let jobs = match ctx.gateway.list_user_jobs().await {
        Ok(jobs) => jobs,
        Err(error) => {
            log::warn!("Cannot list queued jobs: {error}");
            return None;
        }
    };
    let base = format!("esc-{chain_id}-r{round_no}");
    let batch_prefix = format!("{base}-b");
    let mut job_ids: Vec<JobId> = jobs
        .iter()
        .filter(|job| job.name == base || job.name.starts_with(&batch_prefix))
        .map(|job| job.job_id)
        .collect();
    job_ids.sort_unstable();
    job_ids.dedup();
    if job_ids.is_empty() { None } else { Some(job_ids) }
}

/// Cancels pending control-plane jobs of superseded rounds so the queue does
/// not accumulate zombie handlers whose dependency can never fire.
async fn sweep_stale_handlers(ctx: &EngineContext<'_>, chain_id: &ChainId, current_round: u32) {
    let jobs = match ctx.gateway.list_user_jobs().await {
        Ok(jobs) => jobs,
        Err(error) => {
            log::warn!("Cannot list queued jobs for cleanup: {error}");
            return;
        }
    };
    let prefix = format!("esc-{chain_id}-");
    let stale: Vec<JobId> = jobs
        .iter()
        .filter(|job| job.is_pending())
        .filter_map(|job| {
            let suffix = job.name.strip_prefix(&prefix)?;
            let round: u32 = suffix
                .strip_prefix('h')
                .or_else(|| suffix.strip_prefix('w'))?
                .parse()
                .ok()?;
            (round < current_round).then_some(job.job_id)
        })
        .collect();
    if stale.is_empty() {
        return;
    }
    log::info!("Cancelling {} stale pending handlers of chain {chain_id}", stale.len());
    if let Err(error) = ctx.gateway.cancel(stale).await {
        log::warn!("Stale handler cleanup failed: {error}");
    }
}
