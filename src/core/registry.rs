use crate::core::job::{is_metadata_key, JobSpec, JobState};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use tokio::process::{Child, Command};

/// Log file name for a job: sorted `key=value` pairs joined by `_`, plus `.out`.
///
/// Keys or values containing a path separator, metadata keys and keys in
/// `ignore` do not take part in the name.
pub fn log_file_name(spec: &JobSpec, ignore: &HashSet<String>) -> String {
    let segments: Vec<String> = spec
        .iter()
        .filter(|(key, value)| {
            !(key.contains('/')
                || key.contains(std::path::MAIN_SEPARATOR)
                || value.contains_path_separator()
                || is_metadata_key(key)
                || ignore.contains(*key))
        })
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    format!("{}.out", segments.join("_"))
}

/// Full log path of a job under `result_dir`, honoring `_result_subdir`.
pub fn derive_log_path(spec: &JobSpec, result_dir: &Path, ignore: &HashSet<String>) -> PathBuf {
    let dir = match spec.result_subdir() {
        Some(subdir) => result_dir.join(subdir),
        None => result_dir.to_path_buf(),
    };
    dir.join(log_file_name(spec, ignore))
}

/// `--key value...` projection of the non-metadata entries, in key order.
pub fn build_args(spec: &JobSpec) -> Vec<String> {
    let mut args = Vec::with_capacity(spec.len() * 2);
    for (key, value) in spec.params() {
        args.push(format!("--{key}"));
        args.extend(value.to_arg_tokens());
    }
    args
}

/// A spawned invocation of the target program.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    pub spec: JobSpec,
    pub args: Vec<String>,
    pub log_path: PathBuf,
    state: JobState,
    exit_status: Option<ExitStatus>,
    child: Child,
}

impl ProcessHandle {
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Non-blocking liveness check. Returns `true` once the process has exited;
    /// a completed handle stays completed.
    pub fn poll(&mut self) -> Result<bool> {
        if self.state == JobState::Completed {
            return Ok(true);
        }
        match self
            .child
            .try_wait()
            .with_context(|| format!("Failed to poll process {}", self.pid))?
        {
            Some(status) => {
                self.mark_completed(status);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Waits for the process to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for process {}", self.pid))?;
        self.mark_completed(status);
        Ok(status)
    }

    fn mark_completed(&mut self, status: ExitStatus) {
        if self.state.can_transition_to(JobState::Completed) {
            tracing::debug!("Process {} exited with {}", self.pid, status);
            self.state = JobState::Completed;
            self.exit_status = Some(status);
        }
    }
}

struct LogEntry {
    path: PathBuf,
    file: Option<File>,
}

/// Spawns the target program and owns the log files of its processes.
pub struct ProcessRegistry {
    program: PathBuf,
    program_args: Vec<String>,
    result_dir: PathBuf,
    logs: Mutex<HashMap<u32, LogEntry>>,
}

impl ProcessRegistry {
    pub fn new(program: PathBuf, program_args: Vec<String>, result_dir: PathBuf) -> Self {
        Self {
            program,
            program_args,
            result_dir,
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    pub fn log_path(&self, spec: &JobSpec, ignore: &HashSet<String>) -> PathBuf {
        derive_log_path(spec, &self.result_dir, ignore)
    }

    /// Launches the program for `spec` with stdout and stderr going to the
    /// job's log file.
    pub fn spawn(&self, spec: &JobSpec, ignore: &HashSet<String>) -> Result<ProcessHandle> {
        let log_path = self.log_path(spec, ignore);
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create log directory {}", parent.display())
            })?;
        }
        let file = File::create(&log_path)
            .with_context(|| format!("Failed to create log file {}", log_path.display()))?;
        let stdout = file
            .try_clone()
            .context("Failed to duplicate log file handle")?;
        let stderr = file
            .try_clone()
            .context("Failed to duplicate log file handle")?;

        let args: Vec<String> = self
            .program_args
            .iter()
            .cloned()
            .chain(build_args(spec))
            .collect();

        tracing::info!("OUTFILE: {}", log_path.display());
        tracing::info!("COMMAND: {} {}", self.program.display(), args.join(" "));

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.display()))?;
        let pid = child
            .id()
            .context("Spawned process exited before its pid was read")?;

        self.lock_logs().insert(
            pid,
            LogEntry {
                path: log_path.clone(),
                file: Some(file),
            },
        );

        Ok(ProcessHandle {
            pid,
            spec: spec.clone(),
            args,
            log_path,
            state: JobState::Running,
            exit_status: None,
            child,
        })
    }

    pub fn log_path_of(&self, pid: u32) -> Option<PathBuf> {
        self.lock_logs().get(&pid).map(|entry| entry.path.clone())
    }

    /// Last `n` lines of the log of `pid`. Empty when nothing is registered or
    /// the file cannot be read.
    pub fn tail_log(&self, pid: u32, n: usize) -> Vec<String> {
        let Some(path) = self.log_path_of(pid) else {
            return Vec::new();
        };
        match std::fs::read(&path) {
            Ok(bytes) => tail_lines(&String::from_utf8_lossy(&bytes), n),
            Err(e) => {
                tracing::debug!("Failed to read log {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }

    /// Flushes and releases the log handle of `pid`. The path stays registered
    /// for tailing. Closing twice is a no-op.
    pub fn close_log(&self, pid: u32) -> Result<()> {
        let file = self
            .lock_logs()
            .get_mut(&pid)
            .and_then(|entry| entry.file.take());
        if let Some(file) = file {
            file.sync_all()
                .with_context(|| format!("Failed to flush log of process {pid}"))?;
            tracing::debug!("Closed log file of process {}", pid);
        }
        Ok(())
    }

    /// Closes every open log handle, logging failures and carrying on.
    pub fn close_all(&self) {
        let pids: Vec<u32> = self.lock_logs().keys().copied().collect();
        for pid in pids {
            if let Err(e) = self.close_log(pid) {
                tracing::error!("{:#}", e);
            }
        }
    }

    pub fn is_log_open(&self, pid: u32) -> bool {
        self.lock_logs()
            .get(&pid)
            .is_some_and(|entry| entry.file.is_some())
    }

    fn lock_logs(&self) -> std::sync::MutexGuard<'_, HashMap<u32, LogEntry>> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn tail_lines(content: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|line| line.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::{ParamValue, RESULT_SUBDIR_KEY};
    use crate::core::test_support::write_counter_script;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> ProcessRegistry {
        let script = write_counter_script(dir.path());
        ProcessRegistry::new(
            PathBuf::from("sh"),
            vec![script.display().to_string()],
            dir.path().join("results"),
        )
    }

    #[test]
    fn test_log_file_name() {
        let spec = JobSpec::new()
            .with("int", 1)
            .with("float", 3.2)
            .with("str", "string")
            .with("path", "/home/user/")
            .with("udr", "a_b_c");
        assert_eq!(
            log_file_name(&spec, &HashSet::new()),
            "float=3.2_int=1_str=string_udr=a_b_c.out"
        );
    }

    #[test]
    fn test_log_file_name_filters() {
        let spec = JobSpec::new()
            .with("number", 10)
            .with("gpu", 1)
            .with("data/dir", 3)
            .with(RESULT_SUBDIR_KEY, "sweep")
            .with("_note", "x");
        let ignore: HashSet<String> = ["gpu".to_string()].into_iter().collect();
        assert_eq!(log_file_name(&spec, &ignore), "number=10.out");
        assert_eq!(log_file_name(&spec, &HashSet::new()), "gpu=1_number=10.out");
    }

    #[test]
    fn test_derive_log_path_with_subdir() {
        let spec = JobSpec::new()
            .with("number", 10)
            .with(RESULT_SUBDIR_KEY, "sweep");
        assert_eq!(
            derive_log_path(&spec, Path::new("/results"), &HashSet::new()),
            PathBuf::from("/results/sweep/number=10.out")
        );
        let spec = JobSpec::new().with("number", 10);
        assert_eq!(
            derive_log_path(&spec, Path::new("/results"), &HashSet::new()),
            PathBuf::from("/results/number=10.out")
        );
    }

    #[test]
    fn test_build_args() {
        let spec = JobSpec::new()
            .with("number", 10)
            .with("mul", vec![1, 2, 3])
            .with("dry", ParamValue::Flag)
            .with("data", "/tmp/data")
            .with(RESULT_SUBDIR_KEY, "sweep");
        assert_eq!(
            build_args(&spec),
            vec!["--data", "/tmp/data", "--dry", "--mul", "1", "2", "3", "--number", "10"]
        );
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), vec!["b", "c"]);
        assert_eq!(tail_lines("a\nb\n", 10), vec!["a", "b"]);
        assert!(tail_lines("", 3).is_empty());
    }

    #[tokio::test]
    async fn test_spawn_writes_log() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let spec = JobSpec::new().with("number", 10).with("gpu", 1);

        let mut handle = registry.spawn(&spec, &HashSet::new()).unwrap();
        assert_eq!(handle.state(), JobState::Running);
        assert!(registry.is_log_open(handle.pid));
        assert!(handle.wait().await.unwrap().success());
        assert_eq!(handle.state(), JobState::Completed);
        assert!(handle.poll().unwrap());
        registry.close_log(handle.pid).unwrap();
        assert!(!registry.is_log_open(handle.pid));

        let content = std::fs::read_to_string(registry.log_path(&spec, &HashSet::new())).unwrap();
        assert_eq!(content.lines().count(), 10);
        assert_eq!(registry.tail_log(handle.pid, 3), vec!["7", "8", "9"]);
    }

    #[tokio::test]
    async fn test_spawn_sequence_values() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let spec = JobSpec::new()
            .with("number", 2)
            .with("mul", vec![7, 8])
            .with(RESULT_SUBDIR_KEY, "nested/deeper");

        let mut handle = registry.spawn(&spec, &HashSet::new()).unwrap();
        handle.wait().await.unwrap();

        assert!(handle.log_path.starts_with(dir.path().join("results/nested/deeper")));
        assert_eq!(registry.tail_log(handle.pid, 10), vec!["0", "1", "7", "8"]);
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let dir = TempDir::new().unwrap();
        let registry = ProcessRegistry::new(
            dir.path().join("does-not-exist"),
            vec![],
            dir.path().join("results"),
        );
        let err = registry
            .spawn(&JobSpec::new().with("number", 1), &HashSet::new())
            .unwrap_err();
        assert!(format!("{err:#}").contains("Failed to spawn"));
    }

    #[test]
    fn test_tail_unknown_pid_is_empty() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        assert!(registry.tail_log(424242, 5).is_empty());
        assert!(registry.close_log(424242).is_ok());
    }

    proptest! {
        #[test]
        fn prop_log_name_is_deterministic_and_sorted(
            entries in proptest::collection::btree_map("[a-z]{1,6}", 0i64..1000, 1..8)
        ) {
            let forward: JobSpec = entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
            let backward: JobSpec = entries.iter().rev().map(|(k, v)| (k.clone(), *v)).collect();
            let name = log_file_name(&forward, &HashSet::new());
            prop_assert_eq!(&name, &log_file_name(&backward, &HashSet::new()));

            let expected: Vec<String> = entries.iter().map(|(k, v)| format!("{k}={v}")).collect();
            prop_assert_eq!(name, format!("{}.out", expected.join("_")));
        }
    }
}
