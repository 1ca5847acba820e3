pub mod dependency;
pub mod slurm;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use crate::JobId;
use crate::common::arraydef::IntArray;
use crate::common::rsutils::{MemSize, WallTime};

pub use dependency::Dependency;

pub type GatewayResult<T> = anyhow::Result<T>;

/// Resource envelope of one submission. The output/error patterns may contain
/// the scheduler placeholders `%A` (job id) and `%a` (array index).
#[derive(Debug, Clone)]
pub struct Resources {
    pub partitions: Vec<String>,
    pub memory: MemSize,
    pub time: WallTime,
    pub stdout: String,
    pub stderr: String,
    pub throttle: Option<u32>,
}

/// One submission handed to the scheduler. Script arguments are delivered as
/// an ordered argument vector; they are never joined into a shell string.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub name: String,
    /// `None` submits a plain (non-array) job, used for control-plane handlers.
    pub array: Option<IntArray>,
    pub resources: Resources,
    pub script: PathBuf,
    pub script_args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub dependency: Option<Dependency>,
}

/// Terminal accounting record of a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub index: u32,
    pub state: String,
    pub exit_code: i32,
    pub signal: i32,
    pub elapsed: Option<String>,
    pub node: Option<String>,
    pub peak_mem: Option<String>,
}

/// A job currently visible in the scheduler queue of the invoking user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub name: String,
    pub state: String,
}

impl QueuedJob {
    pub fn is_pending(&self) -> bool {
        self.state == "PENDING"
    }
}

/// Abstract surface of the external batch scheduler. The escalation engine
/// only ever talks to the scheduler through this trait.
pub trait SchedulerGateway {
    /// Submits a job and returns its scheduler id.
    fn submit(
        &self,
        request: SubmitRequest,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<JobId>> + '_>>;

    /// Returns one terminal record per task of the given job.
    fn classify(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Vec<TaskStatus>>> + '_>>;

    /// Best-effort cancellation.
    fn cancel(&self, job_ids: Vec<JobId>) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + '_>>;

    /// Jobs of the invoking user, for stale handler cleanup.
    fn list_user_jobs(&self)
    -> Pin<Box<dyn Future<Output = GatewayResult<Vec<QueuedJob>>> + '_>>;
}
