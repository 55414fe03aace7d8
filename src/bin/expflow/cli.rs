use std::path::PathBuf;

use clap::Parser;
use clap_complete::Shell;
use clap_verbosity_flag::Verbosity;

#[derive(Debug, Parser)]
#[command(name = "expflow", author, version = expflow::core::version(), about = "Resource-gated experiment launcher")]
#[command(styles=expflow::utils::STYLES)]
pub struct ExpFlow {
    #[command(subcommand)]
    pub command: Commands,

    /// The configuration file to use
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity,
}

/// Settings that override the configuration file.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ManagerOverrides {
    /// Program launched for every job (e.g. "python")
    #[arg(long, value_name = "PROGRAM")]
    pub program: Option<PathBuf>,

    /// Fixed argument placed before the job flags; repeatable
    #[arg(long = "program-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub program_args: Vec<String>,

    /// Limit which GPUs jobs may be placed on (e.g., "0,2" or "0-2")
    #[arg(long, value_name = "INDICES")]
    pub gpus: Option<String>,

    /// Directory for job logs
    #[arg(long, value_name = "DIR")]
    pub result_dir: Option<PathBuf>,

    /// Maximum number of concurrently running jobs
    #[arg(long, value_name = "N")]
    pub max_processes: Option<usize>,

    /// Seconds between admission rounds
    #[arg(long, value_name = "SECS")]
    pub poll_interval: Option<u64>,
}

#[derive(Debug, Parser)]
pub enum Commands {
    /// Queue every job of a jobs file and run them until all have finished
    Run {
        /// Jobs file (.toml with [[jobs]] tables, or a .json array)
        jobs: PathBuf,

        #[command(flatten)]
        overrides: ManagerOverrides,
    },
    /// Print the log file each job of a jobs file would write to
    Names {
        /// Jobs file (.toml with [[jobs]] tables, or a .json array)
        jobs: PathBuf,

        #[command(flatten)]
        overrides: ManagerOverrides,
    },
    /// List GPUs with enough free memory for a job
    Gpus {
        /// Required free memory in MB (default: from config)
        #[arg(long, value_name = "MB")]
        memory: Option<u64>,

        /// Only list GPUs without running processes
        #[arg(long)]
        empty: bool,

        #[command(flatten)]
        overrides: ManagerOverrides,
    },
    /// Generate shell completion scripts
    Completion {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}
