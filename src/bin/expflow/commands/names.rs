use anyhow::Result;
use expflow::config::ManagerConfig;
use expflow::core::registry::derive_log_path;
use std::collections::HashSet;
use std::path::Path;

pub fn handle_names(manager: &ManagerConfig, jobs: &Path) -> Result<()> {
    let specs = expflow::utils::read_jobs_file(jobs)?;
    let result_dir = manager.result_dir();
    let ignore: HashSet<String> = manager.ignore_keys.iter().cloned().collect();
    for spec in &specs {
        println!("{}", derive_log_path(spec, &result_dir, &ignore).display());
    }
    Ok(())
}
