use crate::core::get_config_dir;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ManagerConfig {
    /// Executable launched for every job (e.g. `python`)
    #[serde(default)]
    pub program: PathBuf,
    /// Fixed arguments placed before the job flags (e.g. `["main.py"]`)
    #[serde(default)]
    pub program_args: Vec<String>,
    /// Seconds between admission rounds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// GPUs the allocator may hand out
    #[serde(default = "default_gpus")]
    pub gpus: Vec<u32>,
    /// Free memory (MB) a GPU needs before a job is placed on it
    #[serde(default = "default_gpu_memory_mb")]
    pub gpu_memory_mb: u64,
    /// Only place jobs on GPUs without running processes
    #[serde(default)]
    pub gpu_empty: bool,
    /// Seconds between GPU polls while waiting for a device
    #[serde(default = "default_gpu_wait_secs")]
    pub gpu_wait_secs: u64,
    /// Rounds per allocation during which the previous GPU is skipped
    #[serde(default = "default_gpu_avoid_times")]
    pub gpu_avoid_times: u32,
    /// Defer admission above this CPU usage (percent). Unset disables the check.
    #[serde(default = "default_cpu_usage_threshold")]
    pub cpu_usage_threshold: Option<f64>,
    /// Defer admission below this much free memory (GB). Unset disables the check.
    #[serde(default = "default_memory_threshold_gb")]
    pub memory_threshold_gb: Option<f64>,
    /// Upper bound on concurrently running jobs. Unset means no cap.
    #[serde(default = "default_max_processes")]
    pub max_processes: Option<usize>,
    /// Seconds over which CPU usage is sampled
    #[serde(default = "default_cpu_sample_secs")]
    pub cpu_sample_secs: u64,
    /// Lines of each log included in status output
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    /// Directory for job logs; defaults to `results/` next to the main executable
    #[serde(default)]
    pub result_dir: Option<PathBuf>,
    /// Job keys never used in log file names
    #[serde(default)]
    pub ignore_keys: Vec<String>,
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_gpus() -> Vec<u32> {
    vec![0, 1, 2, 3]
}

fn default_gpu_memory_mb() -> u64 {
    1000
}

fn default_gpu_wait_secs() -> u64 {
    120
}

fn default_gpu_avoid_times() -> u32 {
    10
}

fn default_cpu_usage_threshold() -> Option<f64> {
    Some(95.0)
}

fn default_memory_threshold_gb() -> Option<f64> {
    Some(5.0)
}

fn default_max_processes() -> Option<usize> {
    Some(8)
}

fn default_cpu_sample_secs() -> u64 {
    5
}

fn default_tail_lines() -> usize {
    10
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::new(),
            program_args: Vec::new(),
            poll_interval_secs: default_poll_interval_secs(),
            gpus: default_gpus(),
            gpu_memory_mb: default_gpu_memory_mb(),
            gpu_empty: false,
            gpu_wait_secs: default_gpu_wait_secs(),
            gpu_avoid_times: default_gpu_avoid_times(),
            cpu_usage_threshold: default_cpu_usage_threshold(),
            memory_threshold_gb: default_memory_threshold_gb(),
            max_processes: default_max_processes(),
            cpu_sample_secs: default_cpu_sample_secs(),
            tail_lines: default_tail_lines(),
            result_dir: None,
            ignore_keys: Vec::new(),
        }
    }
}

impl ManagerConfig {
    pub fn result_dir(&self) -> PathBuf {
        self.result_dir
            .clone()
            .unwrap_or_else(|| default_result_dir(&self.program, &self.program_args))
    }
}

/// `results/` beside the main executable: the last fixed argument when there
/// is one (`python main.py`), the program itself otherwise.
pub fn default_result_dir(program: &Path, program_args: &[String]) -> PathBuf {
    let main = program_args
        .last()
        .map(PathBuf::from)
        .unwrap_or_else(|| program.to_path_buf());
    main.parent()
        .map(|dir| dir.join("results"))
        .unwrap_or_else(|| PathBuf::from("results"))
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    // User-provided config file
    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            return Err(config::ConfigError::NotFound(format!(
                "Config file {config_path:?} does not exist",
            )));
        }
    }

    // Default config file
    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("expflow.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    let settings = config::Config::builder();
    let settings = config_vec.iter().rev().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(
            config::Environment::with_prefix("EXPFLOW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("manager.gpus")
                .with_list_parse_key("manager.program_args")
                .with_list_parse_key("manager.ignore_keys"),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_file() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        temp_file
            .write_all(
                b"[manager]\nprogram = 'python'\nprogram_args = ['/opt/exp/main.py']\ngpus = [1, 3]\nmax_processes = 2\npoll_interval_secs = 5\n",
            )
            .unwrap();
        let config = load_config(Some(&temp_file.path().to_path_buf())).unwrap();
        let manager = config.manager;
        assert_eq!(manager.program, PathBuf::from("python"));
        assert_eq!(manager.gpus, vec![1, 3]);
        assert_eq!(manager.max_processes, Some(2));
        assert_eq!(manager.poll_interval_secs, 5);
        assert_eq!(manager.gpu_memory_mb, 1000);
        assert_eq!(manager.result_dir(), PathBuf::from("/opt/exp/results"));
    }

    #[test]
    fn test_load_config_not_found() {
        let config = load_config(Some(&PathBuf::from("/tmp/does-not-exist-expflow.toml")));
        assert!(config.is_err());
    }

    #[test]
    fn test_defaults() {
        let manager = ManagerConfig::default();
        assert_eq!(manager.poll_interval_secs, 60);
        assert_eq!(manager.cpu_usage_threshold, Some(95.0));
        assert_eq!(manager.memory_threshold_gb, Some(5.0));
        assert_eq!(manager.tail_lines, 10);
        assert_eq!(manager.gpu_avoid_times, 10);
    }

    #[test]
    fn test_default_result_dir() {
        assert_eq!(
            default_result_dir(Path::new("/usr/bin/python"), &["/home/u/exp/main.py".into()]),
            PathBuf::from("/home/u/exp/results")
        );
        assert_eq!(
            default_result_dir(Path::new("/opt/tool/run"), &[]),
            PathBuf::from("/opt/tool/results")
        );
        assert_eq!(
            default_result_dir(Path::new("run"), &[]),
            PathBuf::from("results")
        );
    }
}
