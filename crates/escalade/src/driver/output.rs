use cli_table::format::Separator;
use cli_table::{Cell, CellStruct, Color, Style, Table, TableStruct, print_stdout};

use crate::chain::{Chain, ChainState, Round, RoundState};
use crate::common::utils::str::{pluralize, truncate_end};
use crate::gateway::QueuedJob;

const CHAIN_COLOR_COMPLETED: Color = Color::Green;
const CHAIN_COLOR_RUNNING: Color = Color::Yellow;
const CHAIN_COLOR_FAILED: Color = Color::Red;

const MAX_SPEC_DISPLAY: usize = 40;

fn print_vertical_table(rows: Vec<Vec<CellStruct>>) {
    let table = rows.table().separator(
        Separator::builder()
            .column(Some(Default::default()))
            .build(),
    );
    print_table(table);
}

fn print_horizontal_table(rows: Vec<Vec<CellStruct>>, header: Vec<CellStruct>) {
    let table = rows
        .table()
        .separator(
            Separator::builder()
                .title(Some(Default::default()))
                .column(Some(Default::default()))
                .build(),
        )
        .title(header);
    print_table(table);
}

fn print_table(table: TableStruct) {
    if let Err(e) = print_stdout(table) {
        log::error!("Cannot print table to stdout: {e:?}");
    }
}

fn chain_state_cell(state: ChainState) -> CellStruct {
    let color = match state {
        ChainState::Completed => CHAIN_COLOR_COMPLETED,
        ChainState::Running => CHAIN_COLOR_RUNNING,
        ChainState::FailedAtMax | ChainState::FailedNotRetried => CHAIN_COLOR_FAILED,
    };
    state.cell().foreground_color(Some(color))
}

fn round_jobs(round: &Round) -> String {
    match round.job_ids.as_slice() {
        [] => "-".to_string(),
        [job_id] => job_id.to_string(),
        [first, .., last] => format!("{first}..{last} ({} batches)", round.job_ids.len()),
    }
}

fn count_cell(count: Option<u32>) -> CellStruct {
    match count {
        Some(count) => count.cell(),
        None => "-".cell(),
    }
}

pub fn print_chain_status(chain: &Chain, queued: &[QueuedJob]) {
    let mut rows = vec![
        vec!["Chain".cell().bold(true), chain.chain_id.as_str().cell()],
        vec!["Script".cell().bold(true), chain.script.display().cell()],
    ];
    if !chain.script_args.is_empty() {
        rows.push(vec![
            "Args".cell().bold(true),
            format!("{:?}", chain.script_args).cell(),
        ]);
    }
    rows.push(vec![
        "Array".cell().bold(true),
        format!(
            "{} ({} {})",
            truncate_end(&chain.array_spec, MAX_SPEC_DISPLAY),
            chain.total_tasks,
            pluralize("task", chain.total_tasks as usize)
        )
        .cell(),
    ]);
    rows.push(vec!["State".cell().bold(true), chain_state_cell(chain.state)]);
    if let Some(round) = chain.last_round() {
        rows.push(vec![
            "Level".cell().bold(true),
            format!(
                "{} / {} ({}, {})",
                round.level,
                chain.ladder.max_level(),
                round.memory,
                round.time
            )
            .cell(),
        ]);
    }
    if chain.state == ChainState::Completed {
        rows.push(vec![
            "Done".cell().bold(true),
            format!("{} / {}", chain.completed_count, chain.total_tasks).cell(),
        ]);
    }
    if let Some(residuals) = &chain.residuals {
        rows.push(vec![
            "Residuals".cell().bold(true),
            format!(
                "{} OOM, {} timeout",
                residuals.oom.len(),
                residuals.timeout.len()
            )
            .cell(),
        ]);
    }
    if let Some(reason) = &chain.failure_reason {
        rows.push(vec!["Reason".cell().bold(true), reason.cell()]);
    }
    rows.push(vec![
        "Created".cell().bold(true),
        chain.created.format("%Y-%m-%d %H:%M:%S").cell(),
    ]);
    rows.push(vec![
        "Updated".cell().bold(true),
        chain.updated.format("%Y-%m-%d %H:%M:%S").cell(),
    ]);
    print_vertical_table(rows);

    if chain.rounds.is_empty() {
        println!("No rounds recorded yet.");
        return;
    }

    let header = vec![
        "Round".cell().bold(true),
        "Level".cell().bold(true),
        "Mem".cell().bold(true),
        "Time".cell().bold(true),
        "Jobs".cell().bold(true),
        "Spec".cell().bold(true),
        "Tasks".cell().bold(true),
        "State".cell().bold(true),
        "Done".cell().bold(true),
        "OOM".cell().bold(true),
        "Timeout".cell().bold(true),
        "Other".cell().bold(true),
    ];
    let rows = chain
        .rounds
        .iter()
        .map(|round| {
            vec![
                round.round.cell(),
                round.level.cell(),
                round.memory.cell(),
                round.time.cell(),
                round_jobs(round).cell(),
                truncate_end(&round.array_spec, MAX_SPEC_DISPLAY).cell(),
                round.indices.len().cell(),
                round.state.cell(),
                count_cell(round.counts.map(|c| c.completed)),
                count_cell(round.counts.map(|c| c.oom)),
                count_cell(round.counts.map(|c| c.timeout)),
                count_cell(round.counts.map(|c| c.other)),
            ]
        })
        .collect();
    print_horizontal_table(rows, header);

    print_handler_view(chain, queued);
}

/// Live view of the pending/running control jobs, when the scheduler queue
/// is reachable.
fn print_handler_view(chain: &Chain, queued: &[QueuedJob]) {
    let Some(round) = chain.last_round() else {
        return;
    };
    if round.is_resolved() {
        return;
    }
    for (label, job_id) in [
        ("Failure handler", round.handler_id),
        ("Success watcher", round.watcher_id),
    ] {
        let Some(job_id) = job_id else { continue };
        match queued.iter().find(|job| job.job_id == job_id) {
            Some(job) => println!("{label}: job {job_id} ({})", job.state),
            None => println!("{label}: job {job_id} (not in queue)"),
        }
    }
}

pub fn print_chain_list(chains: &[Chain]) {
    if chains.is_empty() {
        println!("No chains found.");
        return;
    }
    let header = vec![
        "Chain".cell().bold(true),
        "Script".cell().bold(true),
        "State".cell().bold(true),
        "Rounds".cell().bold(true),
        "Tasks".cell().bold(true),
        "Updated".cell().bold(true),
    ];
    let rows = chains
        .iter()
        .map(|chain| {
            vec![
                chain.chain_id.as_str().cell(),
                chain.script.display().cell(),
                chain_state_cell(chain.state),
                chain.rounds.len().cell(),
                chain.total_tasks.cell(),
                chain.updated.format("%Y-%m-%d %H:%M:%S").cell(),
            ]
        })
        .collect();
    print_horizontal_table(rows, header);
}

/// Markdown report over one or more chains, suitable for pasting into an
/// issue or wiki page.
pub fn print_report(chains: &[Chain]) {
    println!("# Escalation Report");
    println!();

    for chain in chains {
        println!("## Chain: {}", chain.chain_id);
        println!();
        println!("| Setting | Value |");
        println!("|---------|-------|");
        println!("| Script | `{}` |", chain.script.display());
        if !chain.script_args.is_empty() {
            println!("| Arguments | `{:?}` |", chain.script_args);
        }
        println!(
            "| Array | `{}` ({} tasks) |",
            truncate_end(&chain.array_spec, 60),
            chain.total_tasks
        );
        println!("| Max level | {} |", chain.ladder.max_level());
        println!("| State | **{}** |", chain.state);
        println!("| Created | {} |", chain.created.format("%Y-%m-%d %H:%M:%S"));
        println!("| Updated | {} |", chain.updated.format("%Y-%m-%d %H:%M:%S"));
        println!();

        if !chain.rounds.is_empty() {
            println!("### Rounds");
            println!();
            println!("| Round | Jobs | Level | Memory | Time | Tasks | Done | OOM | Timeout | Other | State |");
            println!("|-------|------|-------|--------|------|-------|------|-----|---------|-------|-------|");
            for round in &chain.rounds {
                let fmt = |count: Option<u32>| {
                    count.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
                };
                println!(
                    "| {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} |",
                    round.round,
                    round_jobs(round),
                    round.level,
                    round.memory,
                    round.time,
                    round.indices.len(),
                    fmt(round.counts.map(|c| c.completed)),
                    fmt(round.counts.map(|c| c.oom)),
                    fmt(round.counts.map(|c| c.timeout)),
                    fmt(round.counts.map(|c| c.other)),
                    round.state,
                );
            }
            println!();
        }

        let not_retried: Vec<&crate::chain::TaskRecord> = chain
            .rounds
            .iter()
            .filter(|round| round.state != RoundState::Pending)
            .flat_map(|round| round.tasks.iter())
            .filter(|task| {
                task.state != "COMPLETED" && task.state != "OUT_OF_MEMORY" && task.state != "TIMEOUT"
            })
            .collect();
        if !not_retried.is_empty() {
            println!("### Failed tasks (not retried)");
            println!();
            println!("| Task | State | Exit code | Node |");
            println!("|------|-------|-----------|------|");
            for task in not_retried.iter().take(20) {
                println!(
                    "| {} | {} | {} | {} |",
                    task.index,
                    task.state,
                    task.exit_code,
                    task.node.as_deref().unwrap_or("-")
                );
            }
            println!();
        }

        println!("### Summary");
        println!();
        match chain.state {
            ChainState::Completed => println!(
                "**{}** of {} tasks completed across {} {}.",
                chain.completed_count,
                chain.total_tasks,
                chain.rounds.len(),
                pluralize("round", chain.rounds.len()),
            ),
            ChainState::FailedAtMax => {
                let residual = chain
                    .residuals
                    .as_ref()
                    .map(|r| r.oom.len() + r.timeout.len())
                    .unwrap_or(0);
                println!(
                    "Chain reached the top of the ladder with **{residual}** unresolved {}.",
                    pluralize("task", residual)
                );
            }
            ChainState::FailedNotRetried => println!(
                "Chain failed: {}",
                chain.failure_reason.as_deref().unwrap_or("unknown reason")
            ),
            ChainState::Running => println!("Chain is still running."),
        }
        println!();
        println!("---");
        println!();
    }
}
