//! Subcommand implementations.

pub mod archive;
pub mod prune;
pub mod run;
pub mod snapshot;

use std::path::Path;

use anyhow::{Context, Result};

use backhaul_core::config::Config;
use backhaul_core::lock::ensure_backup_mounted;
use backhaul_engine::volume::LvmVolume;

/// Load configuration from the override path or `~/.backhaul.yaml`.
pub fn load_config(override_path: Option<&Path>) -> Result<Config> {
    Config::load(override_path).context("failed to load configuration")
}

/// Fail before any mutation when the backup filesystem is not mounted.
pub fn ensure_ready(config: &Config) -> Result<()> {
    if config.settings.require_mounted_root {
        ensure_backup_mounted(&config.settings.root)
            .context("backup tree is not ready; is the volume mounted?")?;
    }
    Ok(())
}

/// The snapshot provider for the configured backup volume.
pub fn volume_for(config: &Config) -> Result<LvmVolume> {
    let (vg, lv) = config.settings.backup_volume()?;
    Ok(LvmVolume::new(vg, lv))
}
