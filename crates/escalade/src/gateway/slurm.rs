use std::future::Future;
use std::pin::Pin;
use std::process::Output;
use std::time::Duration;

use anyhow::Context;
use bstr::ByteSlice;
use tokio::process::Command;

use crate::JobId;
use crate::gateway::{GatewayResult, QueuedJob, SchedulerGateway, SubmitRequest, TaskStatus};

const SUBMIT_ATTEMPTS: u32 = 3;
const SUBMIT_BACKOFF: Duration = Duration::from_secs(2);

const SACCT_FIELDS: &str = "JobID,State,ExitCode,Elapsed,NodeList,MaxRSS";

/// Gateway speaking to Slurm through `sbatch`, `sacct`, `squeue` and
/// `scancel`.
#[derive(Default)]
pub struct SlurmGateway;

impl SlurmGateway {
    pub fn new() -> SlurmGateway {
        SlurmGateway
    }
}

impl SchedulerGateway for SlurmGateway {
    fn submit(
        &self,
        request: SubmitRequest,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<JobId>> + '_>> {
        Box::pin(async move {
            let arguments = build_sbatch_arguments(&request);
            let mut attempt = 1;
            loop {
                match run_sbatch(&arguments).await {
                    Ok(job_id) => return Ok(job_id),
                    Err(error) if attempt < SUBMIT_ATTEMPTS => {
                        log::warn!(
                            "sbatch attempt {attempt}/{SUBMIT_ATTEMPTS} for {} failed: {error:?}",
                            request.name
                        );
                        tokio::time::sleep(SUBMIT_BACKOFF * attempt).await;
                        attempt += 1;
                    }
                    Err(error) => {
                        return Err(error.context(format!("Cannot submit {}", request.name)));
                    }
                }
            }
        })
    }

    fn classify(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Vec<TaskStatus>>> + '_>> {
        Box::pin(async move {
            let job = job_id.to_string();
            let arguments = vec![
                "sacct",
                "-n",
                "-X",
                "-j",
                job.as_str(),
                "-o",
                SACCT_FIELDS,
                "--parsable2",
            ];
            let output = run_command(&arguments).await?;
            Ok(parse_sacct_records(&output))
        })
    }

    fn cancel(&self, job_ids: Vec<JobId>) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + '_>> {
        Box::pin(async move {
            if job_ids.is_empty() {
                return Ok(());
            }
            let ids: Vec<String> = job_ids.iter().map(|id| id.to_string()).collect();
            let mut arguments = vec!["scancel"];
            arguments.extend(ids.iter().map(|id| id.as_str()));
            run_command(&arguments).await?;
            Ok(())
        })
    }

    fn list_user_jobs(
        &self,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Vec<QueuedJob>>> + '_>> {
        Box::pin(async move {
            let arguments = vec!["squeue", "--me", "-h", "-o", "%i|%j|%T"];
            let output = run_command(&arguments).await?;
            Ok(parse_squeue_records(&output))
        })
    }
}

async fn run_sbatch(arguments: &[String]) -> anyhow::Result<JobId> {
    let mut command = Command::new("sbatch");
    command.args(arguments);
    log::debug!("Running command `sbatch {}`", arguments.join(" "));

    let output = command.output().await.context("sbatch start failed")?;
    let output = check_command_output(output).context("sbatch execution failed")?;
    let stdout = output
        .stdout
        .to_str()
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in sbatch output: {e:?}"))?;
    parse_sbatch_job_id(stdout)
}

async fn run_command(arguments: &[&str]) -> anyhow::Result<String> {
    let mut command = Command::new(arguments[0]);
    command.args(&arguments[1..]);
    log::debug!("Running command `{}`", arguments.join(" "));

    let output = command
        .output()
        .await
        .with_context(|| format!("{} start failed", arguments[0]))?;
    let output =
        check_command_output(output).with_context(|| format!("{} execution failed", arguments[0]))?;
    Ok(output
        .stdout
        .to_str()
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in {} output: {e:?}", arguments[0]))?
        .to_string())
}

fn check_command_output(output: Output) -> anyhow::Result<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

fn build_sbatch_arguments(request: &SubmitRequest) -> Vec<String> {
    let resources = &request.resources;
    let mut arguments = vec![
        format!("--job-name={}", request.name),
        format!("--partition={}", resources.partitions.join(",")),
        format!("--mem={}", resources.memory),
        format!("--time={}", resources.time),
        format!("--output={}", resources.stdout),
        format!("--error={}", resources.stderr),
    ];
    if let Some(array) = &request.array {
        match resources.throttle {
            Some(throttle) => arguments.push(format!("--array={array}%{throttle}")),
            None => arguments.push(format!("--array={array}")),
        }
    }
    if let Some(dependency) = &request.dependency {
        arguments.push(format!("--dependency={dependency}"));
        arguments.push("--kill-on-invalid-dep=yes".to_string());
    }
    if !request.env.is_empty() {
        let bindings: Vec<String> = request
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        arguments.push(format!("--export=ALL,{}", bindings.join(",")));
    }
    arguments.push(request.script.display().to_string());
    // Script arguments stay separate argv entries all the way to the
    // scheduler; whitespace and quoting survive intact.
    arguments.extend(request.script_args.iter().cloned());
    arguments
}

/// Extracts the job id from sbatch output. Unrelated warnings may precede
/// the real payload; the meaningful result is on the last line.
fn parse_sbatch_job_id(output: &str) -> anyhow::Result<JobId> {
    let submitted = output
        .lines()
        .map(|l| l.trim())
        .find(|l| l.to_lowercase().starts_with("submitted batch job"))
        .and_then(|l| l.split(' ').nth(3))
        .and_then(|l| l.parse().ok());
    if let Some(job_id) = submitted {
        return Ok(job_id);
    }
    // Fall back to `--parsable`-style output: `<id>[;<cluster>]`.
    output
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .last()
        .and_then(|l| l.split(';').next())
        .and_then(|l| l.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("Missing job id in sbatch output\n{output}"))
}

/// Parses `sacct --parsable2` accounting lines into per-task records.
fn parse_sacct_records(output: &str) -> Vec<TaskStatus> {
    let mut records = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 6 {
            continue;
        }
        let job_spec = parts[0];
        // Tasks that never reached a terminal state show up as `<id>_[a-b]`;
        // they have no per-task record yet.
        if job_spec.contains('[') {
            continue;
        }
        let index = job_spec
            .split('_')
            .nth(1)
            .and_then(|idx| idx.parse().ok())
            .unwrap_or(0);
        let state = match parts[1].split_whitespace().next() {
            Some(state) => state.to_string(),
            None => continue,
        };
        let (exit_code, signal) = parse_exit_code(parts[2]);
        records.push(TaskStatus {
            index,
            state,
            exit_code,
            signal,
            elapsed: non_empty(parts[3]),
            node: non_empty(parts[4]),
            peak_mem: non_empty(parts[5]),
        });
    }
    records
}

/// Parses the `<code>:<signal>` form of the accounting ExitCode field.
fn parse_exit_code(field: &str) -> (i32, i32) {
    let mut parts = field.split(':');
    let code = parts.next().and_then(|c| c.parse().ok()).unwrap_or(0);
    let signal = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (code, signal)
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_squeue_records(output: &str) -> Vec<QueuedJob> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.trim().split('|').collect();
            if parts.len() < 3 {
                return None;
            }
            let job_id = parts[0].split('_').next()?.parse().ok()?;
            Some(QueuedJob {
                job_id,
                name: parts[1].to_string(),
                state: parts[2].to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::arraydef::IntArray;
    use crate::gateway::Resources;

    #[test]
    fn sbatch_job_id_from_phrase() {
        assert_eq!(
            parse_sbatch_job_id("Submitted batch job 123456\n").unwrap(),
            123456
        );
    }

    #[test]
    fn sbatch_job_id_skips_warnings() {
        let output = "sbatch: Warning: your account is over quota\n\
                      sbatch: lua: extra site policy applied\n\
                      Submitted batch job 98765";
        assert_eq!(parse_sbatch_job_id(output).unwrap(), 98765);
    }

    #[test]
    fn sbatch_job_id_parsable_fallback() {
        assert_eq!(parse_sbatch_job_id("sbatch: warn\n4242;cluster0\n").unwrap(), 4242);
        assert!(parse_sbatch_job_id("no job here\n").is_err());
    }

    #[test]
    fn sacct_parsing() {
        let output = "900_0|COMPLETED|0:0|00:00:07|node17|120M\n\
                      900_1|OUT_OF_MEMORY|0:125|00:00:09|node17|1024M\n\
                      900_2|CANCELLED by 1000|0:0|00:00:01|node18|\n\
                      900_3|FAILED|137:0|00:01:00|node18|980M\n\
                      900_[4-9]|PENDING|0:0|||\n";
        let records = parse_sacct_records(output);
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].index, 0);
        assert_eq!(records[0].state, "COMPLETED");
        assert_eq!(records[1].state, "OUT_OF_MEMORY");
        assert_eq!(records[2].state, "CANCELLED");
        assert_eq!(records[3].exit_code, 137);
        assert_eq!(records[1].peak_mem.as_deref(), Some("1024M"));
        assert_eq!(records[2].peak_mem, None);
    }

    #[test]
    fn squeue_parsing() {
        let output = "1200|esc-20260101-000000-aaaa-h0|PENDING\n\
                      1201_5|esc-20260101-000000-aaaa-r1|RUNNING\n";
        let jobs = parse_squeue_records(output);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, 1200);
        assert!(jobs[0].is_pending());
        assert_eq!(jobs[1].job_id, 1201);
    }

    #[test]
    fn sbatch_arguments_preserve_script_argv() {
        let request = SubmitRequest {
            name: "esc-test-r0".to_string(),
            array: Some(IntArray::from_ids(&[0, 1, 2])),
            resources: Resources {
                partitions: vec!["devel".to_string(), "medium".to_string()],
                memory: "1G".parse().unwrap(),
                time: "00:05:00".parse().unwrap(),
                stdout: "/tmp/out-%A_%a.out".to_string(),
                stderr: "/tmp/out-%A_%a.err".to_string(),
                throttle: Some(8),
            },
            script: "/work/job.sh".into(),
            script_args: vec![
                "--label".to_string(),
                "two words".to_string(),
                "quo\"ted".to_string(),
            ],
            env: vec![("MODE".to_string(), "fast".to_string())],
            dependency: None,
        };
        let arguments = build_sbatch_arguments(&request);
        assert!(arguments.contains(&"--partition=devel,medium".to_string()));
        assert!(arguments.contains(&"--array=0-2%8".to_string()));
        assert!(arguments.contains(&"--export=ALL,MODE=fast".to_string()));
        // The tail is exactly: script, then each argument untouched.
        let tail = &arguments[arguments.len() - 4..];
        assert_eq!(tail[0], "/work/job.sh");
        assert_eq!(tail[1], "--label");
        assert_eq!(tail[2], "two words");
        assert_eq!(tail[3], "quo\"ted");
    }

    #[test]
    fn dependency_adds_kill_on_invalid() {
        let request = SubmitRequest {
            name: "esc-test-h0".to_string(),
            array: None,
            resources: Resources {
                partitions: vec!["devel".to_string()],
                memory: "512M".parse().unwrap(),
                time: "00:10:00".parse().unwrap(),
                stdout: "/tmp/h.out".to_string(),
                stderr: "/tmp/h.err".to_string(),
                throttle: None,
            },
            script: "/work/handler.sh".into(),
            script_args: vec![],
            env: vec![],
            dependency: Some(crate::gateway::Dependency::on_failure(&[77])),
        };
        let arguments = build_sbatch_arguments(&request);
        assert!(arguments.contains(&"--dependency=afternotok:77".to_string()));
        assert!(arguments.contains(&"--kill-on-invalid-dep=yes".to_string()));
        assert!(!arguments.iter().any(|a| a.starts_with("--array")));
    }
}
