use std::cell::{Cell, RefCell};
use std::future::{Future, ready};
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use tempdir::TempDir;

use crate::chain::{Chain, ChainState, Ladder, Level, Round, RoundState};
use crate::checkpoint::CheckpointStore;
use crate::common::arraydef::IntArray;
use crate::config::{EscalationConfig, LevelConfig};
use crate::engine::EngineContext;
use crate::gateway::{
    GatewayResult, QueuedJob, SchedulerGateway, SubmitRequest, TaskStatus,
};
use crate::{JobId, Map};

pub fn test_level(mem: &str, time: &str) -> Level {
    Level {
        partitions: vec!["devel".to_string()],
        memory: mem.parse().unwrap(),
        time: time.parse().unwrap(),
    }
}

pub fn test_ladder() -> Ladder {
    Ladder::new(vec![
        test_level("1G", "00:05:00"),
        test_level("2G", "00:30:00"),
    ])
    .unwrap()
}

pub fn test_chain(id: &str, indices: &[u32]) -> Chain {
    let now = Utc::now();
    Chain {
        chain_id: id.parse().unwrap(),
        script: "/work/job.sh".into(),
        script_args: vec![],
        array_spec: IntArray::from_ids(indices).to_string(),
        total_tasks: indices.len() as u32,
        user_env: vec![],
        throttle: None,
        ladder: test_ladder(),
        state_handling: Default::default(),
        created: now,
        updated: now,
        state: ChainState::Running,
        completed_count: 0,
        failure_reason: None,
        residuals: None,
        rounds: vec![],
    }
}

pub fn test_round(round_no: u32, indices: &[u32]) -> Round {
    Round {
        round: round_no,
        level: round_no as usize,
        memory: "1G".parse().unwrap(),
        time: "00:05:00".parse().unwrap(),
        partitions: vec!["devel".to_string()],
        array_spec: IntArray::from_ids(indices).to_string(),
        indices: indices.to_vec(),
        job_ids: vec![],
        handler_id: None,
        watcher_id: None,
        state: RoundState::Pending,
        submitted: None,
        counts: None,
        tasks: vec![],
    }
}

pub fn completed_status(index: u32) -> TaskStatus {
    task_status(index, "COMPLETED", 0)
}

pub fn task_status(index: u32, state: &str, exit_code: i32) -> TaskStatus {
    TaskStatus {
        index,
        state: state.to_string(),
        exit_code,
        signal: 0,
        elapsed: Some("00:00:10".to_string()),
        node: Some("node01".to_string()),
        peak_mem: Some("900M".to_string()),
    }
}

/// Scripted in-memory scheduler. Submissions are recorded and get increasing
/// job ids; accounting outcomes are whatever the test installed beforehand.
pub struct StubGateway {
    next_job_id: Cell<JobId>,
    pub submits: RefCell<Vec<(JobId, SubmitRequest)>>,
    pub outcomes: RefCell<Map<JobId, Vec<TaskStatus>>>,
    pub queue: RefCell<Vec<QueuedJob>>,
    pub cancelled: RefCell<Vec<JobId>>,
    pub fail_submits: Cell<bool>,
}

impl StubGateway {
    pub fn new() -> StubGateway {
        StubGateway {
            next_job_id: Cell::new(1000),
            submits: RefCell::new(Vec::new()),
            outcomes: RefCell::new(Map::new()),
            queue: RefCell::new(Vec::new()),
            cancelled: RefCell::new(Vec::new()),
            fail_submits: Cell::new(false),
        }
    }

    /// Installs terminal accounting records for a job.
    pub fn finish(&self, job_id: JobId, statuses: Vec<TaskStatus>) {
        self.outcomes.borrow_mut().insert(job_id, statuses);
        self.queue.borrow_mut().retain(|job| job.job_id != job_id);
    }

    pub fn finish_completed(&self, job_id: JobId, indices: &[u32]) {
        self.finish(job_id, indices.iter().map(|i| completed_status(*i)).collect());
    }

    pub fn submit_count(&self) -> usize {
        self.submits.borrow().len()
    }

    pub fn request_named(&self, name: &str) -> Option<(JobId, SubmitRequest)> {
        self.submits
            .borrow()
            .iter()
            .find(|(_, request)| request.name == name)
            .cloned()
    }

    pub fn jobs_with_prefix(&self, prefix: &str) -> Vec<JobId> {
        self.submits
            .borrow()
            .iter()
            .filter(|(_, request)| request.name.starts_with(prefix))
            .map(|(job_id, _)| *job_id)
            .collect()
    }

    pub fn seed_queued(&self, job_id: JobId, name: &str, state: &str) {
        self.queue.borrow_mut().push(QueuedJob {
            job_id,
            name: name.to_string(),
            state: state.to_string(),
        });
    }
}

impl SchedulerGateway for StubGateway {
    fn submit(
        &self,
        request: SubmitRequest,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<JobId>> + '_>> {
        if self.fail_submits.get() {
            return Box::pin(ready(Err(anyhow::anyhow!(
                "the scheduler rejected the submission"
            ))));
        }
        let job_id = self.next_job_id.get();
        self.next_job_id.set(job_id + 1);
        self.queue.borrow_mut().push(QueuedJob {
            job_id,
            name: request.name.clone(),
            state: "PENDING".to_string(),
        });
        self.submits.borrow_mut().push((job_id, request));
        Box::pin(ready(Ok(job_id)))
    }

    fn classify(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Vec<TaskStatus>>> + '_>> {
        let records = self
            .outcomes
            .borrow()
            .get(&job_id)
            .cloned()
            .unwrap_or_default();
        Box::pin(ready(Ok(records)))
    }

    fn cancel(&self, job_ids: Vec<JobId>) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + '_>> {
        self.cancelled.borrow_mut().extend(&job_ids);
        self.queue
            .borrow_mut()
            .retain(|job| !job_ids.contains(&job.job_id));
        Box::pin(ready(Ok(())))
    }

    fn list_user_jobs(
        &self,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Vec<QueuedJob>>> + '_>> {
        Box::pin(ready(Ok(self.queue.borrow().clone())))
    }
}

/// A workspace with a checkpoint store, a stub scheduler and a runnable
/// payload script.
pub struct TestEnv {
    dir: TempDir,
    pub store: CheckpointStore,
    pub gateway: StubGateway,
    pub script: PathBuf,
}

impl TestEnv {
    pub fn new() -> TestEnv {
        let dir = TempDir::new("escalade").unwrap();
        let store = CheckpointStore::open(dir.path().join("checkpoints")).unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "#!/bin/bash\nexit 0\n").unwrap();
        TestEnv {
            dir,
            store,
            gateway: StubGateway::new(),
            script,
        }
    }

    pub fn ctx(&self) -> EngineContext<'_> {
        self.ctx_with_spec_len(10_000)
    }

    pub fn ctx_with_spec_len(&self, max_spec_len: usize) -> EngineContext<'_> {
        EngineContext {
            store: &self.store,
            gateway: &self.gateway,
            events: None,
            mirror: None,
            settle_delay: Duration::ZERO,
            max_spec_len,
            output_dir: self.dir.path().join("output"),
            binary: self.dir.path().join("escalade"),
            config_path: None,
        }
    }

    pub fn config(&self, levels: &[(&str, &str)]) -> EscalationConfig {
        EscalationConfig {
            levels: levels
                .iter()
                .map(|(mem, time)| LevelConfig {
                    partition: vec!["devel".to_string()],
                    mem: mem.parse().unwrap(),
                    time: time.parse().unwrap(),
                })
                .collect(),
            ..EscalationConfig::default()
        }
    }
}
