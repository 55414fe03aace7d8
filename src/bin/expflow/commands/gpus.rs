use anyhow::Result;
use expflow::config::ManagerConfig;
use expflow::core::gpu::GpuAllocator;
use expflow::core::probe::{GpuState, SystemProbe};
use std::sync::Arc;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};

pub async fn handle_gpus(manager: &ManagerConfig, memory: Option<u64>, empty: bool) -> Result<()> {
    let probe = Arc::new(SystemProbe::new(Duration::from_secs(manager.cpu_sample_secs)));
    let allocator = GpuAllocator::new(
        probe,
        manager.gpus.clone(),
        Duration::from_secs(manager.gpu_wait_secs),
        manager.gpu_avoid_times,
    );
    let memory = memory.unwrap_or(manager.gpu_memory_mb);
    let gpus = allocator.free_gpus(memory, empty || manager.gpu_empty).await?;

    if gpus.is_empty() {
        println!("No GPU with more than {memory} MB free");
        return Ok(());
    }
    print_gpus(&gpus);
    Ok(())
}

fn print_gpus(gpus: &[GpuState]) {
    #[derive(Tabled)]
    struct GpuRow {
        #[tabled(rename = "GPU")]
        index: u32,
        #[tabled(rename = "FREE (MB)")]
        free_memory_mb: u64,
        #[tabled(rename = "PROCESSES")]
        active_processes: usize,
    }

    let rows: Vec<GpuRow> = gpus
        .iter()
        .map(|g| GpuRow {
            index: g.index,
            free_memory_mb: g.free_memory_mb,
            active_processes: g.active_processes,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::blank());
    println!("{table}");
}
