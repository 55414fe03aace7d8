use anyhow::Result;
use expflow::config::ManagerConfig;
use expflow::core::scheduler::{SchedulerBuilder, StatusReport};
use expflow::JobState;
use owo_colors::OwoColorize;
use std::path::Path;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};

pub async fn handle_run(manager: ManagerConfig, jobs: &Path) -> Result<()> {
    super::require_program(&manager)?;
    let specs = expflow::utils::read_jobs_file(jobs)?;
    let poll_interval = Duration::from_secs(manager.poll_interval_secs.max(1));

    let scheduler = SchedulerBuilder::from_config(&manager).build()?;
    tracing::info!(
        "Queueing {} jobs, logs in {}",
        specs.len(),
        scheduler.registry().result_dir().display()
    );
    for spec in specs {
        scheduler.enqueue(spec);
    }
    scheduler.start()?;

    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = async {
            loop {
                tokio::time::sleep(poll_interval).await;
                let status = scheduler.status();
                print_status(&status);
                if status.num_queued == 0 && status.num_running == 0 {
                    break;
                }
            }
        } => false,
    };

    if interrupted {
        eprintln!("Interrupted, leaving running jobs unattended");
        scheduler.stop(true).await?;
    } else {
        let drained = scheduler.stop(false).await?;
        if !drained.is_empty() {
            tracing::warn!("{} queued jobs failed to launch while draining", drained.len());
        }
    }

    let status = scheduler.status();
    print_status(&status);
    for failure in &status.failed {
        eprintln!("{} {}: {}", "failed".red(), failure.spec, failure.error);
    }
    if !status.failed.is_empty() {
        anyhow::bail!("{} jobs failed to launch", status.failed.len());
    }
    Ok(())
}

fn print_status(status: &StatusReport) {
    #[derive(Tabled)]
    struct ProcessRow {
        #[tabled(rename = "PID")]
        pid: u32,
        #[tabled(rename = "STATE")]
        state: String,
        #[tabled(rename = "LAST LINE")]
        last_line: String,
    }

    println!(
        "{} queued, {} running, {} completed, {} total",
        status.num_queued.yellow(),
        status.num_running.green(),
        status.num_completed.blue(),
        status.total
    );

    let rows: Vec<ProcessRow> = status
        .logs
        .iter()
        .map(|(pid, lines)| ProcessRow {
            pid: *pid,
            state: match status.status.get(pid) {
                Some(JobState::Running) => JobState::Running.to_string().green().to_string(),
                Some(state) => state.to_string(),
                None => "-".to_string(),
            },
            last_line: lines.last().cloned().unwrap_or_default(),
        })
        .collect();
    if !rows.is_empty() {
        let mut table = Table::new(rows);
        table.with(Style::blank());
        println!("{table}");
    }
}
