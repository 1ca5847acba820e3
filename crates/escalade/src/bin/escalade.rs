use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;

use escalade::chain::ChainId;
use escalade::checkpoint::CheckpointStore;
use escalade::common::arraydef::IntArray;
use escalade::common::setup::setup_logging;
use escalade::common::utils::fs::{absolute_path, current_binary_path};
use escalade::config::EscalationConfig;
use escalade::db::Mirror;
use escalade::driver::{self, SubmitOptions};
use escalade::engine::{self, EngineContext};
use escalade::event::EventLog;
use escalade::gateway::slurm::SlurmGateway;

#[derive(Parser)]
#[command(
    name = "escalade",
    version,
    about = "Resource-escalation orchestrator for Slurm array jobs"
)]
struct RootOptions {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser)]
struct CommonOpts {
    /// Path to the escalation config (YAML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Submit a new escalation chain
    Submit(SubmitOpts),
    /// Show the status of a chain
    Status(StatusOpts),
    /// List all chains
    List,
    /// Render a markdown report for one chain or for all of them
    Report(ReportOpts),
    /// Cancel a chain and all of its outstanding jobs
    Cancel(ChainArg),
    /// Resubmit a round that was checkpointed but never submitted
    Resume(ChainArg),
    /// Failure-handler entry point, invoked by the scheduler
    #[command(hide = true)]
    Handle(HandlerOpts),
    /// Success-watcher entry point, invoked by the scheduler
    #[command(hide = true)]
    Finish(HandlerOpts),
}

#[derive(Parser)]
struct SubmitOpts {
    /// Task indices in range-stride notation, e.g. `0-99` or `0-90:10`
    #[arg(long)]
    array: String,

    /// Maximum number of simultaneously running tasks
    #[arg(long)]
    throttle: Option<u32>,

    /// Environment bindings passed to every task
    #[arg(long = "export", value_name = "KEY=VALUE")]
    export: Vec<String>,

    /// The batch script to run
    script: PathBuf,

    /// Arguments passed to the script, preserved verbatim across retries
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Parser)]
struct StatusOpts {
    chain_id: String,

    /// Keep refreshing every N seconds until the chain settles
    #[arg(long, value_name = "SECONDS", num_args = 0..=1, default_missing_value = "10")]
    watch: Option<u64>,
}

#[derive(Parser)]
struct ReportOpts {
    /// Chain to report on; all chains when omitted
    chain_id: Option<String>,
}

#[derive(Parser)]
struct ChainArg {
    chain_id: String,
}

#[derive(Parser)]
struct HandlerOpts {
    /// Chain the resolved round belongs to
    #[arg(long)]
    chain: String,

    /// Round number that resolved
    #[arg(long)]
    round: u32,
}

fn parse_export(bindings: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    bindings
        .iter()
        .map(|binding| {
            binding
                .split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| anyhow::anyhow!("Invalid --export binding `{binding}`, expected KEY=VALUE"))
        })
        .collect()
}

async fn run(opts: RootOptions) -> escalade::Result<()> {
    let config_path = opts.common.config.map(absolute_path);
    let config = match &config_path {
        Some(path) => EscalationConfig::load(path)?,
        None => EscalationConfig::default(),
    };

    let store = CheckpointStore::open(config.tracker.checkpoint_dir.clone())?;
    let gateway = SlurmGateway::new();
    let events = config.tracker.history_log.clone().map(EventLog::new);
    let mirror = match (config.logging.enabled, config.logging.db_path.as_ref()) {
        (true, Some(path)) => match Mirror::open(path) {
            Ok(mirror) => Some(mirror),
            Err(error) => {
                log::warn!("Cannot open mirror database: {error}; continuing without it");
                None
            }
        },
        _ => None,
    };

    let ctx = EngineContext {
        store: &store,
        gateway: &gateway,
        events: events.as_ref(),
        mirror: mirror.as_ref(),
        settle_delay: config.settle_delay(),
        max_spec_len: config.max_array_spec_len,
        output_dir: absolute_path(config.tracker.output_dir.clone()),
        binary: current_binary_path()?,
        config_path,
    };

    match opts.subcmd {
        SubCommand::Submit(opts) => {
            let array: IntArray = opts
                .array
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid --array spec: {e}"))?;
            let chain_id = driver::submit_chain(
                &ctx,
                &config,
                SubmitOptions {
                    script: opts.script,
                    script_args: opts.args,
                    array,
                    throttle: opts.throttle,
                    export: parse_export(&opts.export)?,
                },
            )
            .await?;
            println!("{} chain {}", "Submitted".green().bold(), chain_id);
            println!("Track it with: escalade status {chain_id}");
        }
        SubCommand::Status(opts) => {
            let chain_id: ChainId = opts.chain_id.parse()?;
            match opts.watch {
                Some(seconds) => {
                    driver::watch(&ctx, &chain_id, Duration::from_secs(seconds.max(1))).await?
                }
                None => driver::status(&ctx, &chain_id).await?,
            }
        }
        SubCommand::List => driver::list(&ctx)?,
        SubCommand::Report(opts) => {
            let chain_id = opts.chain_id.map(|id| id.parse()).transpose()?;
            driver::report(&ctx, chain_id.as_ref())?
        }
        SubCommand::Cancel(opts) => {
            let chain_id: ChainId = opts.chain_id.parse()?;
            driver::cancel_chain(&ctx, &chain_id).await?
        }
        SubCommand::Resume(opts) => {
            let chain_id: ChainId = opts.chain_id.parse()?;
            driver::resume(&ctx, &chain_id).await?
        }
        SubCommand::Handle(opts) => {
            let chain_id: ChainId = opts.chain.parse()?;
            engine::handle_round_failure(&ctx, &chain_id, opts.round).await?
        }
        SubCommand::Finish(opts) => {
            let chain_id: ChainId = opts.chain.parse()?;
            engine::handle_round_success(&ctx, &chain_id, opts.round).await?
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opts = RootOptions::parse();
    setup_logging(opts.common.debug);

    if let Err(error) = run(opts).await {
        eprintln!("{} {error}", "Error:".red().bold());
        std::process::exit(1);
    }
}
