use crate::config::ManagerConfig;
use crate::core::gpu::GpuAllocator;
use crate::core::job::{JobSpec, JobState, GPU_KEY};
use crate::core::probe::{ResourceProbe, SystemProbe};
use crate::core::registry::{ProcessHandle, ProcessRegistry};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use strum::Display;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often `stop(false)` and `wait_until_idle` re-check running processes.
const REAP_INTERVAL: Duration = Duration::from_millis(200);

/// Lifecycle of the background admission loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
pub enum LoopState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Conditions that must hold before a pending job is released.
///
/// Every check is optional; `None` disables it.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    pub poll_interval: Duration,
    pub memory_threshold_gb: Option<f64>,
    pub cpu_usage_threshold: Option<f64>,
    pub max_processes: Option<usize>,
    pub gpu_memory_mb: u64,
    pub gpu_empty: bool,
    pub tail_lines: usize,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            memory_threshold_gb: Some(5.0),
            cpu_usage_threshold: Some(95.0),
            max_processes: Some(8),
            gpu_memory_mb: 1000,
            gpu_empty: false,
            tail_lines: 10,
        }
    }
}

/// A job that could not be launched. It is not re-queued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpawnFailure {
    pub spec: JobSpec,
    pub error: String,
}

/// Outcome of one admission loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    QueueEmpty,
    MemoryLow(f64),
    CpuBusy(f64),
    TelemetryUnavailable,
    AtCapacity(usize),
    Spawned(u32),
    SpawnFailed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusReport {
    pub num_queued: usize,
    pub num_running: usize,
    pub num_completed: usize,
    pub total: usize,
    pub queued: Vec<JobSpec>,
    pub running: Vec<u32>,
    pub completed: Vec<u32>,
    pub status: BTreeMap<u32, JobState>,
    /// Log tails of the processes examined by this call.
    pub logs: BTreeMap<u32, Vec<String>>,
    pub failed: Vec<SpawnFailure>,
}

#[derive(Default)]
struct Queues {
    pending: VecDeque<JobSpec>,
    running: Vec<ProcessHandle>,
    completed: Vec<ProcessHandle>,
    failed: Vec<SpawnFailure>,
    ignore_keys: HashSet<String>,
}

impl Queues {
    /// Moves exited processes from `running` to `completed` and returns their
    /// pids. Their logs are closed by the caller once the lock is released.
    fn reconcile(&mut self) -> Vec<u32> {
        let running = std::mem::take(&mut self.running);
        let mut finished = Vec::new();
        for mut handle in running {
            match handle.poll() {
                Ok(true) => {
                    tracing::info!("Process {} completed", handle.pid);
                    finished.push(handle.pid);
                    self.completed.push(handle);
                }
                Ok(false) => self.running.push(handle),
                Err(e) => {
                    tracing::error!("{:#}", e);
                    self.running.push(handle);
                }
            }
        }
        finished
    }
}

struct Inner {
    queues: Mutex<Queues>,
    registry: ProcessRegistry,
    allocator: GpuAllocator,
    probe: Arc<dyn ResourceProbe>,
    policy: AdmissionPolicy,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reconciles the running set; returns the number still running.
    fn reap(&self) -> usize {
        let (finished, remaining) = {
            let mut queues = self.lock();
            let finished = queues.reconcile();
            (finished, queues.running.len())
        };
        self.close_logs(&finished);
        remaining
    }

    fn close_logs(&self, pids: &[u32]) {
        for pid in pids {
            if let Err(e) = self.registry.close_log(*pid) {
                tracing::error!("{:#}", e);
            }
        }
    }

    /// Launches `head`, the job at the front of the pending queue.
    ///
    /// The job stays queued while its process is spawned and is moved to
    /// `running` (or recorded as failed) in a single step afterwards.
    fn release_head(&self, mut head: JobSpec, gpu: Option<u32>) -> Result<u32, SpawnFailure> {
        let ignore = {
            let mut queues = self.lock();
            if let Some(index) = gpu {
                head.assign_gpu(index);
                queues.ignore_keys.insert(GPU_KEY.to_string());
            }
            queues.ignore_keys.clone()
        };

        let spawned = self.registry.spawn(&head, &ignore);

        let mut queues = self.lock();
        queues.pending.pop_front();
        match spawned {
            Ok(handle) => {
                let pid = handle.pid;
                queues.running.push(handle);
                Ok(pid)
            }
            Err(e) => {
                tracing::error!("Failed to launch job {}: {:#}", head, e);
                let failure = SpawnFailure {
                    spec: head,
                    error: format!("{e:#}"),
                };
                queues.failed.push(failure.clone());
                Err(failure)
            }
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            "Admission loop started (poll interval {:?})",
            self.policy.poll_interval
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let admission = self.admit_once(&cancel).await;
            tracing::debug!("Admission round: {:?}", admission);
            if admission == Admission::Cancelled {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.policy.poll_interval) => {}
            }
        }
        tracing::info!("Admission loop stopped");
    }

    /// One admission round: checks the queue, resources and the concurrency
    /// cap, then releases at most one job.
    async fn admit_once(&self, cancel: &CancellationToken) -> Admission {
        if self.lock().pending.is_empty() {
            return Admission::QueueEmpty;
        }

        match self.check_resources().await {
            Ok(None) => {}
            Ok(Some(busy)) => return busy,
            Err(e) => {
                tracing::warn!("Resource probe failed: {:#}", e);
                return Admission::TelemetryUnavailable;
            }
        }

        let running = self.reap();
        if let Some(max) = self.policy.max_processes {
            if running >= max {
                return Admission::AtCapacity(running);
            }
        }
        let Some(head) = self.lock().pending.front().cloned() else {
            return Admission::QueueEmpty;
        };

        // The job stays at the head of the queue while a GPU is found for it
        let gpu = if head.has_gpu() {
            None
        } else {
            match self
                .allocator
                .wait_for_gpu(self.policy.gpu_memory_mb, self.policy.gpu_empty, cancel)
                .await
            {
                Some(index) => Some(index),
                None => return Admission::Cancelled,
            }
        };

        match self.release_head(head, gpu) {
            Ok(pid) => Admission::Spawned(pid),
            Err(_) => Admission::SpawnFailed,
        }
    }

    /// `Some(reason)` when memory or CPU rule out admission right now.
    async fn check_resources(&self) -> Result<Option<Admission>> {
        if let Some(threshold) = self.policy.memory_threshold_gb {
            let probe = self.probe.clone();
            let available = tokio::task::spawn_blocking(move || probe.available_memory_gb())
                .await
                .context("Memory probe panicked")??;
            if available < threshold {
                tracing::debug!(
                    "Free memory {:.1} GB below {:.1} GB, deferring",
                    available,
                    threshold
                );
                return Ok(Some(Admission::MemoryLow(available)));
            }
        }
        if let Some(threshold) = self.policy.cpu_usage_threshold {
            let probe = self.probe.clone();
            let usage = tokio::task::spawn_blocking(move || probe.cpu_utilization_percent())
                .await
                .context("CPU probe panicked")??;
            if usage > threshold {
                tracing::debug!("CPU usage {:.1}% above {:.1}%, deferring", usage, threshold);
                return Ok(Some(Admission::CpuBusy(usage)));
            }
        }
        Ok(None)
    }

    async fn wait_for_running(&self) {
        loop {
            let remaining = self.reap();
            if remaining == 0 {
                break;
            }
            tracing::debug!("Waiting for {} running processes", remaining);
            tokio::time::sleep(REAP_INTERVAL).await;
        }
        self.registry.close_all();
    }
}

struct Lifecycle {
    state: LoopState,
    task: Option<JoinHandle<()>>,
}

/// Resource-gated job queue for one program.
///
/// Jobs are released in FIFO order by a background loop, at most one per poll
/// interval, and only while free memory, CPU load and the concurrency cap
/// allow. A stop request takes effect within one poll interval.
pub struct Scheduler {
    inner: Arc<Inner>,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn builder(program: impl Into<PathBuf>) -> SchedulerBuilder {
        SchedulerBuilder::new(program)
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub fn loop_state(&self) -> LoopState {
        self.lock_lifecycle().state
    }

    /// Appends a job to the pending queue. No admission check happens here.
    pub fn enqueue(&self, spec: JobSpec) {
        tracing::debug!("Enqueued job {}", spec);
        self.inner.lock().pending.push_back(spec);
    }

    /// Starts the admission loop. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.state != LoopState::Idle {
            bail!("Scheduler already started (state: {})", lifecycle.state);
        }
        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        lifecycle.task = Some(tokio::spawn(inner.run(cancel)));
        lifecycle.state = LoopState::Running;
        Ok(())
    }

    /// Stops the admission loop.
    ///
    /// Without `force`, the remaining pending jobs are launched right away
    /// (skipping the admission checks) and the call returns once every
    /// launched process has exited. With `force`, pending jobs stay queued and
    /// running processes are left alone.
    ///
    /// Returns the jobs of the drain that could not be launched; they are
    /// also kept in [`Scheduler::failures`].
    pub async fn stop(&self, force: bool) -> Result<Vec<SpawnFailure>> {
        let task = {
            let mut lifecycle = self.lock_lifecycle();
            if lifecycle.state != LoopState::Running {
                bail!("Scheduler is not running (state: {})", lifecycle.state);
            }
            lifecycle.state = LoopState::Stopping;
            lifecycle.task.take()
        };

        self.cancel.cancel();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Admission loop ended abnormally: {}", e);
            }
        }
        self.lock_lifecycle().state = LoopState::Stopped;

        if force {
            tracing::info!("Forced stop, leaving pending jobs queued");
            return Ok(Vec::new());
        }

        let failures = self.drain().await;
        self.inner.wait_for_running().await;
        Ok(failures)
    }

    /// Launches all pending jobs without admission checks.
    async fn drain(&self) -> Vec<SpawnFailure> {
        let never = CancellationToken::new();
        let mut failures = Vec::new();
        loop {
            let Some(head) = self.inner.lock().pending.front().cloned() else {
                break;
            };
            let gpu = if head.has_gpu() {
                None
            } else {
                self.inner
                    .allocator
                    .wait_for_gpu(
                        self.inner.policy.gpu_memory_mb,
                        self.inner.policy.gpu_empty,
                        &never,
                    )
                    .await
            };

            if let Err(failure) = self.inner.release_head(head, gpu) {
                failures.push(failure);
            }
        }
        failures
    }

    /// Resolves once nothing is pending or running.
    pub async fn wait_until_idle(&self) {
        loop {
            let running = self.inner.reap();
            if running == 0 && self.inner.lock().pending.is_empty() {
                break;
            }
            tokio::time::sleep(REAP_INTERVAL.min(self.inner.policy.poll_interval)).await;
        }
    }

    /// Jobs that failed to launch so far.
    pub fn failures(&self) -> Vec<SpawnFailure> {
        self.inner.lock().failed.clone()
    }

    /// Keys currently left out of log file names.
    pub fn ignore_keys(&self) -> HashSet<String> {
        self.inner.lock().ignore_keys.clone()
    }

    /// Reconciles the running set and reports queue contents and log tails.
    pub fn status(&self) -> StatusReport {
        let (report, observed, finished) = {
            let mut queues = self.inner.lock();
            let observed: Vec<u32> = queues.running.iter().map(|h| h.pid).collect();
            let finished = queues.reconcile();

            let running: Vec<u32> = queues.running.iter().map(|h| h.pid).collect();
            let completed: Vec<u32> = queues.completed.iter().map(|h| h.pid).collect();
            let status = queues
                .running
                .iter()
                .chain(queues.completed.iter())
                .map(|h| (h.pid, h.state()))
                .collect();
            let report = StatusReport {
                num_queued: queues.pending.len(),
                num_running: running.len(),
                num_completed: completed.len(),
                total: queues.pending.len() + running.len() + completed.len(),
                queued: queues.pending.iter().cloned().collect(),
                running,
                completed,
                status,
                logs: BTreeMap::new(),
                failed: queues.failed.clone(),
            };
            (report, observed, finished)
        };
        self.inner.close_logs(&finished);

        let tail = self.inner.policy.tail_lines;
        let logs = observed
            .into_iter()
            .map(|pid| (pid, self.inner.registry.tail_log(pid, tail)))
            .collect();
        StatusReport { logs, ..report }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    async fn admit_once(&self) -> Admission {
        self.inner.admit_once(&self.cancel).await
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct SchedulerBuilder {
    program: PathBuf,
    program_args: Vec<String>,
    result_dir: Option<PathBuf>,
    probe: Option<Arc<dyn ResourceProbe>>,
    gpus: Vec<u32>,
    gpu_wait: Duration,
    gpu_avoid_times: u32,
    cpu_sample: Duration,
    ignore_keys: Vec<String>,
    policy: AdmissionPolicy,
}

impl SchedulerBuilder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            program_args: Vec::new(),
            result_dir: None,
            probe: None,
            gpus: vec![0, 1, 2, 3],
            gpu_wait: Duration::from_secs(120),
            gpu_avoid_times: 10,
            cpu_sample: Duration::from_secs(5),
            ignore_keys: Vec::new(),
            policy: AdmissionPolicy::default(),
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        Self::new(&config.program)
            .with_program_args(config.program_args.clone())
            .with_result_dir(config.result_dir())
            .with_gpus(config.gpus.clone())
            .with_gpu_wait(Duration::from_secs(config.gpu_wait_secs))
            .with_gpu_avoid_times(config.gpu_avoid_times)
            .with_cpu_sample(Duration::from_secs(config.cpu_sample_secs))
            .with_ignore_keys(config.ignore_keys.clone())
            .with_policy(AdmissionPolicy {
                poll_interval: Duration::from_secs(config.poll_interval_secs),
                memory_threshold_gb: config.memory_threshold_gb,
                cpu_usage_threshold: config.cpu_usage_threshold,
                max_processes: config.max_processes,
                gpu_memory_mb: config.gpu_memory_mb,
                gpu_empty: config.gpu_empty,
                tail_lines: config.tail_lines,
            })
    }

    pub fn with_program_args(mut self, args: Vec<String>) -> Self {
        self.program_args = args;
        self
    }

    pub fn with_result_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.result_dir = Some(dir.into());
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_gpus(mut self, gpus: Vec<u32>) -> Self {
        self.gpus = gpus;
        self
    }

    pub fn with_gpu_wait(mut self, wait: Duration) -> Self {
        self.gpu_wait = wait;
        self
    }

    pub fn with_gpu_avoid_times(mut self, times: u32) -> Self {
        self.gpu_avoid_times = times;
        self
    }

    pub fn with_cpu_sample(mut self, sample: Duration) -> Self {
        self.cpu_sample = sample;
        self
    }

    pub fn with_ignore_keys(mut self, keys: Vec<String>) -> Self {
        self.ignore_keys = keys;
        self
    }

    pub fn with_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.policy.poll_interval = interval;
        self
    }

    pub fn with_max_processes(mut self, max: Option<usize>) -> Self {
        self.policy.max_processes = max;
        self
    }

    pub fn with_memory_threshold_gb(mut self, threshold: Option<f64>) -> Self {
        self.policy.memory_threshold_gb = threshold;
        self
    }

    pub fn with_cpu_usage_threshold(mut self, threshold: Option<f64>) -> Self {
        self.policy.cpu_usage_threshold = threshold;
        self
    }

    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.policy.tail_lines = lines;
        self
    }

    /// Creates the result directory if needed and assembles the scheduler.
    pub fn build(self) -> Result<Scheduler> {
        let result_dir = self
            .result_dir
            .unwrap_or_else(|| crate::config::default_result_dir(&self.program, &self.program_args));
        std::fs::create_dir_all(&result_dir).with_context(|| {
            format!("Failed to create result directory {}", result_dir.display())
        })?;

        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SystemProbe::new(self.cpu_sample)));
        let allocator = GpuAllocator::new(
            probe.clone(),
            self.gpus,
            self.gpu_wait,
            self.gpu_avoid_times,
        );
        let registry = ProcessRegistry::new(self.program, self.program_args, result_dir);
        let queues = Queues {
            ignore_keys: self.ignore_keys.into_iter().collect(),
            ..Default::default()
        };

        Ok(Scheduler {
            inner: Arc::new(Inner {
                queues: Mutex::new(queues),
                registry,
                allocator,
                probe,
                policy: self.policy,
            }),
            lifecycle: Mutex::new(Lifecycle {
                state: LoopState::Idle,
                task: None,
            }),
            cancel: CancellationToken::new(),
        })
    }
}
