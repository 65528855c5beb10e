use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use walkdir::WalkDir;

use crate::BrigadeError;

/// Prefixes of scratch directories this tool may leave behind after a crash.
/// Orphan cleanup removes anything under the work dir starting with one of
/// these, at startup and when the disk watermark trips.
pub const SCRATCH_PREFIXES: [&str; 3] = ["temp_", "unzip_", "merge_"];

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Create a unique scratch directory under `work_dir` with the given prefix
/// (`temp_`, `unzip_` or `merge_`). Uniqueness comes from PID + a process-wide
/// counter, so parallel workers never collide.
pub fn create_scratch_dir(work_dir: &Path, prefix: &str) -> Result<PathBuf, BrigadeError> {
    let seq = SCRATCH_SEQ.fetch_add(1, Ordering::SeqCst);
    let dir = work_dir.join(format!("{}{}_{}", prefix, std::process::id(), seq));
    std::fs::create_dir_all(&dir).map_err(|e| {
        BrigadeError::OperationFailed(format!("无法创建临时目录 {}: {}", dir.display(), e))
    })?;
    Ok(dir)
}

/// Total bytes of regular files under `dir` (symlinks not followed).
pub fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Current disk utilization of the filesystem holding `path`, in percent.
pub fn disk_usage_percent(path: &Path) -> Result<f64, BrigadeError> {
    let total = fs2::total_space(path).map_err(|e| {
        BrigadeError::OperationFailed(format!("无法读取磁盘容量 {}: {}", path.display(), e))
    })?;
    let avail = fs2::available_space(path).map_err(|e| {
        BrigadeError::OperationFailed(format!("无法读取磁盘剩余 {}: {}", path.display(), e))
    })?;
    if total == 0 {
        return Ok(0.0);
    }
    Ok((total.saturating_sub(avail)) as f64 / total as f64 * 100.0)
}

pub fn available_bytes(path: &Path) -> Result<u64, BrigadeError> {
    fs2::available_space(path).map_err(|e| {
        BrigadeError::OperationFailed(format!("无法读取磁盘剩余 {}: {}", path.display(), e))
    })
}

/// Remove orphaned scratch directories left by a previous crashed run.
/// Directories named with this process's own PID are live workers' scratch
/// space and are never touched, so a mid-run watermark trip cannot destroy
/// a sibling worker's in-flight download. Returns how many were removed.
pub fn clean_orphans(work_dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(work_dir) else {
        return 0;
    };
    let own = std::process::id().to_string();
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let Ok(ft) = entry.file_type() else { continue };
        if !ft.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let owned_by_self = SCRATCH_PREFIXES
            .iter()
            .any(|p| name.strip_prefix(p).is_some_and(|rest| rest.starts_with(&format!("{}_", own))));
        if owned_by_self {
            continue;
        }
        if SCRATCH_PREFIXES.iter().any(|p| name.starts_with(p)) {
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    removed += 1;
                    tracing::info!("已清理孤儿临时目录: {}", entry.path().display());
                }
                Err(e) => {
                    tracing::warn!("清理孤儿目录失败 {}: {}", entry.path().display(), e)
                }
            }
        }
    }
    removed
}

/// Best-effort removal of a scratch dir; failure is logged, never fatal.
pub fn remove_scratch(dir: &Path) {
    if dir.exists()
        && let Err(e) = std::fs::remove_dir_all(dir)
    {
        tracing::warn!("清理临时目录失败 {}: {}", dir.display(), e);
    }
}
