use anyhow::{Context, Result};
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

const SCRATCH_MODE: u32 = 0o755;

/// Picks the scratch root holding the per-job directories.
///
/// An explicit path is created when missing. Otherwise the ramdisk is used
/// when mounted, and a directory below the system temp dir when it is not.
pub fn determine(ramdisk: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = ramdisk {
        create_dir_all_with_mode(&path)?;
        let path = path
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", path.display()))?;
        return Ok(path);
    }

    let path = get_default_ramdisk_path();
    if path.is_dir() {
        return Ok(path);
    }

    let tmp_dir = std::env::temp_dir().join("rkhls");
    create_dir_all_with_mode(&tmp_dir)?;
    Ok(tmp_dir)
}

fn create_dir_all_with_mode(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(SCRATCH_MODE)
        .create(path)
        .with_context(|| format!("failed to create scratch root {}", path.display()))
}

#[cfg(not(test))]
fn get_default_ramdisk_path() -> PathBuf {
    PathBuf::from("/mnt/ram")
}

#[cfg(test)]
fn get_default_ramdisk_path() -> PathBuf {
    std::env::temp_dir().join("default_rkhls_ramdisk")
}
