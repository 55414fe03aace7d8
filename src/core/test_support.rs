//! Helpers shared by the unit tests of the scheduler modules.

use crate::core::probe::{GpuState, ResourceProbe};
use anyhow::{bail, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Writes an `sh` script that sleeps `--sleep` seconds, then prints
/// `0..--number` and the `--mul` values, one per line.
pub(crate) fn write_counter_script(dir: &Path) -> PathBuf {
    let path = dir.join("count.sh");
    std::fs::write(
        &path,
        r#"#!/bin/sh
number=0
pause=0
mul=""
while [ $# -gt 0 ]; do
    case "$1" in
        --number) number=$2; shift ;;
        --sleep) pause=$2; shift ;;
        --mul)
            shift
            while [ $# -gt 0 ] && [ "${1#--}" = "$1" ]; do mul="$mul $1"; shift; done
            continue ;;
    esac
    shift
done
sleep $pause
i=0
while [ $i -lt $number ]; do
    echo $i
    i=$((i + 1))
done
for m in $mul; do
    echo $m
done
"#,
    )
    .unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Probe with values the test can change while the scheduler runs.
pub(crate) struct FakeProbe {
    pub memory_gb: Mutex<f64>,
    pub cpu_percent: Mutex<f64>,
    pub gpus: Mutex<Vec<GpuState>>,
    pub fail: Mutex<bool>,
}

impl FakeProbe {
    pub fn idle() -> Self {
        Self {
            memory_gb: Mutex::new(64.0),
            cpu_percent: Mutex::new(5.0),
            gpus: Mutex::new(vec![
                GpuState {
                    index: 0,
                    free_memory_mb: 16000,
                    active_processes: 0,
                },
                GpuState {
                    index: 1,
                    free_memory_mb: 16000,
                    active_processes: 0,
                },
            ]),
            fail: Mutex::new(false),
        }
    }

    pub fn set_memory_gb(&self, gb: f64) {
        *self.memory_gb.lock().unwrap() = gb;
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

impl ResourceProbe for FakeProbe {
    fn available_memory_gb(&self) -> Result<f64> {
        if *self.fail.lock().unwrap() {
            bail!("telemetry unavailable");
        }
        Ok(*self.memory_gb.lock().unwrap())
    }

    fn cpu_utilization_percent(&self) -> Result<f64> {
        if *self.fail.lock().unwrap() {
            bail!("telemetry unavailable");
        }
        Ok(*self.cpu_percent.lock().unwrap())
    }

    fn list_gpus(&self) -> Result<Vec<GpuState>> {
        Ok(self.gpus.lock().unwrap().clone())
    }
}
