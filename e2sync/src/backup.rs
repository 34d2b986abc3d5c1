//! Local snapshots of a receiver's data set.
//!
//! Before an upload overwrites the local working set, the current files
//! can be moved into a timestamped directory under the profile's backup
//! root. Tuning descriptor files are left in place: they are shared
//! between snapshots and rarely change.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::info;

use e2sync_formats::files;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Snapshots `data_dir` into a new timestamped directory under
/// `backup_root`, moving the files when `move_files` is set and copying
/// them otherwise. Returns the snapshot path.
pub fn backup_data(data_dir: &Path, backup_root: &Path, move_files: bool) -> io::Result<PathBuf> {
    let stamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
    let dest = backup_root.join(stamp);
    fs::create_dir_all(&dest)?;
    fs::create_dir_all(data_dir)?;
    for entry in fs::read_dir(data_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if files::is_descriptor_file(&name.to_string_lossy()) {
            continue;
        }
        let target = dest.join(&name);
        if move_files {
            fs::rename(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    info!("Backup written to {}", dest.display());
    Ok(dest)
}

/// Restores a snapshot into `data_dir`, replacing the current working
/// set first.
pub fn restore_data(snapshot: &Path, data_dir: &Path) -> io::Result<()> {
    clear_data_path(data_dir)?;
    for entry in fs::read_dir(snapshot)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        fs::copy(entry.path(), data_dir.join(entry.file_name()))?;
    }
    Ok(())
}

/// Removes the working files from `data_dir`, keeping descriptor files
/// and subdirectories.
pub fn clear_data_path(data_dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(data_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if files::is_descriptor_file(&entry.file_name().to_string_lossy()) {
            continue;
        }
        fs::remove_file(entry.path())?;
    }
    Ok(())
}
