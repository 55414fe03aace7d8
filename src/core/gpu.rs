use crate::core::probe::{GpuState, ResourceProbe};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Picks a GPU for jobs that did not ask for one.
///
/// Allocations are spread across devices: among qualifying devices the one
/// with the fewest active processes wins, ties are broken by scanning from
/// just after the previously assigned index, and for a bounded number of
/// rounds per call the previous device is not handed out again.
pub struct GpuAllocator {
    probe: Arc<dyn ResourceProbe>,
    allowed: Vec<u32>,
    wait: Duration,
    avoid_times: u32,
    previous: Mutex<Option<u32>>,
}

impl GpuAllocator {
    pub fn new(
        probe: Arc<dyn ResourceProbe>,
        allowed: Vec<u32>,
        wait: Duration,
        avoid_times: u32,
    ) -> Self {
        let mut allowed = allowed;
        allowed.sort_unstable();
        allowed.dedup();
        Self {
            probe,
            allowed,
            wait,
            avoid_times,
            previous: Mutex::new(None),
        }
    }

    /// Index returned by the last successful allocation.
    pub fn previous(&self) -> Option<u32> {
        *self.previous.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until a device with `required_memory_mb` free (and no processes,
    /// when `require_empty`) is available. Returns `None` only if `cancel`
    /// fires first.
    pub async fn wait_for_gpu(
        &self,
        required_memory_mb: u64,
        require_empty: bool,
        cancel: &CancellationToken,
    ) -> Option<u32> {
        let previous = self.previous();
        let mut avoid_budget = self.avoid_times;

        loop {
            match self.snapshot().await {
                Ok(gpus) => {
                    let best = select_gpu(
                        &gpus,
                        &self.allowed,
                        required_memory_mb,
                        require_empty,
                        previous,
                        false,
                    );
                    let choice = if avoid_budget > 0 && best.is_some() && best == previous {
                        select_gpu(
                            &gpus,
                            &self.allowed,
                            required_memory_mb,
                            require_empty,
                            previous,
                            true,
                        )
                    } else {
                        best
                    };

                    if let Some(index) = choice {
                        *self.previous.lock().unwrap_or_else(|e| e.into_inner()) = Some(index);
                        tracing::info!(
                            "Assigned GPU {} (required {} MB, empty only: {})",
                            index,
                            required_memory_mb,
                            require_empty
                        );
                        return Some(index);
                    }

                    if best.is_some() {
                        // Only the previous device qualified this round
                        avoid_budget -= 1;
                        tracing::debug!(
                            "Avoiding GPU {:?}, {} avoidance rounds left",
                            previous,
                            avoid_budget
                        );
                    } else {
                        tracing::debug!(
                            "No GPU with {} MB free, retrying in {:?}",
                            required_memory_mb,
                            self.wait
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to query GPUs: {:#}. Retrying in {:?}", e, self.wait);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.wait) => {}
            }
        }
    }

    /// Every allowed device with strictly more than `memory_mb` free.
    pub async fn free_gpus(&self, memory_mb: u64, require_empty: bool) -> Result<Vec<GpuState>> {
        let mut gpus: Vec<GpuState> = self
            .snapshot()
            .await?
            .into_iter()
            .filter(|gpu| self.allowed.contains(&gpu.index))
            .filter(|gpu| !require_empty || gpu.active_processes == 0)
            .filter(|gpu| gpu.free_memory_mb > memory_mb)
            .collect();
        gpus.sort_by_key(|gpu| gpu.index);
        Ok(gpus)
    }

    async fn snapshot(&self) -> Result<Vec<GpuState>> {
        let probe = self.probe.clone();
        tokio::task::spawn_blocking(move || probe.list_gpus()).await?
    }
}

/// Pure selection step of one allocation round.
///
/// Devices are scanned in index order starting just after `previous`
/// (wrapping around); the first device with the fewest active processes wins.
/// With `avoid_previous` the previous device is skipped entirely.
pub fn select_gpu(
    gpus: &[GpuState],
    allowed: &[u32],
    required_memory_mb: u64,
    require_empty: bool,
    previous: Option<u32>,
    avoid_previous: bool,
) -> Option<u32> {
    let mut candidates: Vec<&GpuState> = gpus
        .iter()
        .filter(|gpu| allowed.contains(&gpu.index))
        .collect();
    candidates.sort_by_key(|gpu| gpu.index);

    let start = previous
        .and_then(|prev| candidates.iter().position(|gpu| gpu.index > prev))
        .unwrap_or(0);
    candidates.rotate_left(start);

    let mut best: Option<&GpuState> = None;
    for gpu in candidates {
        if avoid_previous && Some(gpu.index) == previous {
            continue;
        }
        if require_empty && gpu.active_processes > 0 {
            continue;
        }
        if gpu.free_memory_mb < required_memory_mb {
            continue;
        }
        if best.is_none_or(|b| gpu.active_processes < b.active_processes) {
            best = Some(gpu);
        }
    }
    best.map(|gpu| gpu.index)
}
