pub mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;

use crate::chain::{Chain, ChainId, ChainState, Round, RoundState};
use crate::common::arraydef::IntArray;
use crate::common::utils::fs::absolute_path;
use crate::config::EscalationConfig;
use crate::engine::{self, EngineContext};
use crate::JobId;

pub struct SubmitOptions {
    pub script: PathBuf,
    pub script_args: Vec<String>,
    pub array: IntArray,
    pub throttle: Option<u32>,
    pub export: Vec<(String, String)>,
}

/// Bootstraps a new chain: creates the checkpoint with round 0 in PENDING,
/// submits round 0 plus its follow-ups, and returns without waiting for any
/// downstream outcome.
pub async fn submit_chain(
    ctx: &EngineContext<'_>,
    config: &EscalationConfig,
    opts: SubmitOptions,
) -> anyhow::Result<ChainId> {
    if !opts.script.is_file() {
        anyhow::bail!("Script {} does not exist", opts.script.display());
    }
    let ladder = config.ladder()?;
    let indices = opts.array.sorted_ids();
    if indices.is_empty() {
        anyhow::bail!("The index set is empty");
    }

    let chain_id = ChainId::generate();
    let level = ladder.level(0).expect("validated ladder is non-empty").clone();
    let spec = IntArray::from_ids(&indices).to_string();
    let now = Utc::now();
    let chain = Chain {
        chain_id: chain_id.clone(),
        script: absolute_path(opts.script),
        script_args: opts.script_args,
        array_spec: spec.clone(),
        total_tasks: indices.len() as u32,
        user_env: opts.export,
        throttle: opts.throttle,
        ladder,
        state_handling: config.state_handling.clone(),
        created: now,
        updated: now,
        state: ChainState::Running,
        completed_count: 0,
        failure_reason: None,
        residuals: None,
        rounds: vec![Round {
            round: 0,
            level: 0,
            memory: level.memory,
            time: level.time,
            partitions: level.partitions,
            array_spec: spec,
            indices,
            job_ids: vec![],
            handler_id: None,
            watcher_id: None,
            state: RoundState::Pending,
            submitted: None,
            counts: None,
            tasks: vec![],
        }],
    };
    ctx.store.create(&chain)?;
    if let Some(mirror) = ctx.mirror {
        if let Err(error) = mirror.record_chain(&chain) {
            log::warn!("Mirror chain write failed: {error}");
        }
    }

    engine::submit_round(ctx, &chain_id, 0).await?;
    Ok(chain_id)
}

/// Prints the status of a single chain, optionally with the scheduler's live
/// view of its pending handlers.
pub async fn status(ctx: &EngineContext<'_>, chain_id: &ChainId) -> anyhow::Result<()> {
    let chain = ctx.store.load(chain_id)?;
    let queued = ctx.gateway.list_user_jobs().await.unwrap_or_else(|error| {
        log::debug!("Cannot query the scheduler queue: {error}");
        Vec::new()
    });
    output::print_chain_status(&chain, &queued);
    Ok(())
}

/// Re-renders the chain status every `interval` until the chain settles.
pub async fn watch(
    ctx: &EngineContext<'_>,
    chain_id: &ChainId,
    interval: Duration,
) -> anyhow::Result<()> {
    loop {
        // Clear the terminal before redrawing.
        print!("\x1b[2J\x1b[H");
        status(ctx, chain_id).await?;
        let chain = ctx.store.load(chain_id)?;
        if chain.state.is_terminal() {
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
}

pub fn list(ctx: &EngineContext<'_>) -> anyhow::Result<()> {
    let chains = ctx.store.list_all()?;
    output::print_chain_list(&chains);
    Ok(())
}

/// Renders a markdown report for one chain or for the whole store.
pub fn report(ctx: &EngineContext<'_>, chain_id: Option<&ChainId>) -> anyhow::Result<()> {
    let chains = match chain_id {
        Some(chain_id) => vec![ctx.store.load(chain_id)?],
        None => ctx.store.list_all()?,
    };
    if chains.is_empty() {
        anyhow::bail!("No checkpoints found");
    }
    output::print_report(&chains);
    Ok(())
}

/// Cancels all outstanding jobs and pending handlers of a chain and closes
/// it. Jobs already running to completion are cancelled as well; the
/// checkpoint keeps everything recorded so far.
pub async fn cancel_chain(ctx: &EngineContext<'_>, chain_id: &ChainId) -> anyhow::Result<()> {
    let chain = ctx.store.load(chain_id)?;
    if chain.state.is_terminal() {
        anyhow::bail!("Chain {chain_id} is already {}", chain.state);
    }

    let mut job_ids: Vec<JobId> = Vec::new();
    for round in &chain.rounds {
        job_ids.extend(&round.job_ids);
        job_ids.extend(round.handler_id);
        job_ids.extend(round.watcher_id);
    }
    job_ids.sort_unstable();
    job_ids.dedup();
    ctx.gateway
        .cancel(job_ids)
        .await
        .context("Cancellation failed; the chain was left open")?;
    ctx.store
        .mark_not_retried(chain_id, "Cancelled by user".to_string())?;
    log::info!("Chain {chain_id} cancelled");
    Ok(())
}

/// Picks up a chain whose last handler crashed between appending a round and
/// submitting it.
pub async fn resume(ctx: &EngineContext<'_>, chain_id: &ChainId) -> anyhow::Result<()> {
    let chain = ctx.store.load(chain_id)?;
    if chain.state.is_terminal() {
        anyhow::bail!("Chain {chain_id} is already {}", chain.state);
    }
    match chain.last_round() {
        Some(round) if round.state == RoundState::Pending && round.job_ids.is_empty() => {
            engine::submit_round(ctx, chain_id, round.round).await?;
            log::info!("Resubmitted round {} of chain {chain_id}", round.round);
            Ok(())
        }
        _ => {
            log::info!("Chain {chain_id} has no unsubmitted round; nothing to do");
            Ok(())
        }
    }
}
