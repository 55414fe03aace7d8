pub mod gpu;
pub mod job;
pub mod probe;
pub mod registry;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

use std::path::PathBuf;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("expflow"))
}

pub fn get_data_dir() -> anyhow::Result<PathBuf> {
    dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get data directory"))
        .map(|p| p.join("expflow"))
}
