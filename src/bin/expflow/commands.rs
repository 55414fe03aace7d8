use crate::cli::{Commands, ManagerOverrides};
use anyhow::{bail, Result};
use expflow::config::ManagerConfig;
use std::path::PathBuf;

pub mod completion;
pub mod gpus;
pub mod names;
pub mod run;

pub async fn handle_commands(config_path: &Option<PathBuf>, command: Commands) -> Result<()> {
    match command {
        Commands::Run { jobs, overrides } => {
            let manager = manager_config(config_path, &overrides)?;
            run::handle_run(manager, &jobs).await?;
        }
        Commands::Names { jobs, overrides } => {
            let manager = manager_config(config_path, &overrides)?;
            names::handle_names(&manager, &jobs)?;
        }
        Commands::Gpus {
            memory,
            empty,
            overrides,
        } => {
            let manager = manager_config(config_path, &overrides)?;
            gpus::handle_gpus(&manager, memory, empty).await?;
        }
        Commands::Completion { shell } => {
            completion::handle_completion(shell);
        }
    }

    Ok(())
}

/// Config file and environment first, command line flags on top.
fn manager_config(
    config_path: &Option<PathBuf>,
    overrides: &ManagerOverrides,
) -> Result<ManagerConfig> {
    let mut manager = expflow::config::load_config(config_path.as_ref())?.manager;

    if let Some(program) = &overrides.program {
        manager.program = program.clone();
    }
    if !overrides.program_args.is_empty() {
        manager.program_args = overrides.program_args.clone();
    }
    if let Some(gpus) = &overrides.gpus {
        manager.gpus = expflow::utils::parse_gpu_indices(gpus)?;
    }
    if let Some(dir) = &overrides.result_dir {
        manager.result_dir = Some(dir.clone());
    }
    if let Some(max) = overrides.max_processes {
        manager.max_processes = Some(max);
    }
    if let Some(secs) = overrides.poll_interval {
        manager.poll_interval_secs = secs;
    }
    Ok(manager)
}

fn require_program(manager: &ManagerConfig) -> Result<()> {
    if manager.program.as_os_str().is_empty() {
        bail!("No program configured: pass --program or set manager.program in the config file");
    }
    Ok(())
}
