use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{bounded, unbounded};
use regex::Regex;

use crate::BrigadeError;
use crate::app::{App, join_remote};
use crate::lock::InstanceLock;
use crate::monitor::{StatusMonitor, StatusSender, WorkState};
use crate::progress::{ProgressStore, UnzipProgress};
use crate::sanitize::sanitize_name;
use crate::scratch;
use crate::util::{human_bytes, natural_cmp};

/// Pause before the next unit of work when the backpressure watermark is
/// still exceeded after orphan cleanup.
const BACKPRESSURE_PAUSE: Duration = Duration::from_secs(10);

/// Unzipper: for each folder in the index, download each of its archives
/// from the staging store exactly once, verify, extract and merge the
/// contents into the destination remote, recording progress per archive.
pub fn run(app: &App) -> Result<()> {
    let _lock = InstanceLock::acquire(
        &app.config.work_dir,
        "unzipper",
        Duration::from_secs(app.config.instance_lock_timeout_secs),
    )?;
    app.store.check_usable(&app.config.prefix)?;
    std::fs::create_dir_all(&app.config.work_dir)?;
    scratch::clean_orphans(&app.config.work_dir);

    let monitor = StatusMonitor::spawn();
    let status = monitor.sender();
    let progress = ProgressStore::new(&app.store);

    let folders = crate::zipper::read_folder_index(app)?;
    tracing::info!("索引含 {} 个目录", folders.len());

    let (fail_tx, fail_rx) = unbounded::<String>();
    let workers = app.config.max_parallel_workers;
    let (token_tx, token_rx) = bounded::<()>(workers);
    for _ in 0..workers {
        let _ = token_tx.send(());
    }

    std::thread::scope(|s| {
        for folder in &folders {
            if token_rx.recv().is_err() {
                break;
            }
            if app.shutdown.is_requested() {
                let _ = token_tx.send(());
                break;
            }
            let fail_tx = fail_tx.clone();
            let token_tx = token_tx.clone();
            let progress = &progress;
            let status = &status;
            s.spawn(move || {
                match process_folder(app, progress, status, folder) {
                    Ok(true) => {}
                    Ok(false) => {
                        let _ = fail_tx.send(folder.clone());
                    }
                    Err(e) => {
                        if !e.is_shutdown() {
                            status.update(folder.clone(), WorkState::Error, e.to_string());
                            tracing::warn!("目录合并失败 {}: {}", folder, e);
                        }
                        let _ = fail_tx.send(folder.clone());
                    }
                }
                let _ = token_tx.send(());
            });
        }
    });
    drop(fail_tx);

    let failed: Vec<String> = fail_rx.into_iter().collect();
    monitor.finish();
    if app.shutdown.is_requested() {
        println!("⚠️ 已中断，进度已保存，重新运行可续传");
    } else if !failed.is_empty() {
        println!("⚠️ {} 个目录未完成，重新运行可重试", failed.len());
    } else {
        println!("✅ 合并阶段完成，共 {} 个目录", folders.len());
    }
    Ok(())
}

/// Returns Ok(true) when the folder is (now) fully merged.
fn process_folder(
    app: &App,
    progress: &ProgressStore<'_>,
    status: &StatusSender,
    folder: &str,
) -> Result<bool, BrigadeError> {
    let san = sanitize_name(folder);
    let progress_key = app.config.unzip_progress_key(&san);

    let doc: UnzipProgress = progress.load(&progress_key)?;
    if doc.folder_complete {
        status.update(folder.to_string(), WorkState::Skipped, "目录已合并");
        return Ok(true);
    }

    let keys = list_folder_archives(app, &san)?;
    let pending: Vec<String> = keys.iter().filter(|k| !doc.has_key(k)).cloned().collect();
    if !doc.processed_keys.is_empty() && !pending.is_empty() {
        status.update(
            folder.to_string(),
            WorkState::Resumed,
            format!("{}/{} 个包已处理", keys.len() - pending.len(), keys.len()),
        );
    }
    if pending.is_empty() {
        progress.update(&progress_key, |p: &mut UnzipProgress| {
            p.folder_complete = true;
        })?;
        status.update(folder.to_string(), WorkState::Completed, "目录合并完成");
        return Ok(true);
    }

    let mut failures = 0usize;
    for key in &pending {
        if app.shutdown.is_requested() {
            return Err(BrigadeError::ShutdownRequested);
        }
        let label = archive_label(key);
        match process_archive(app, progress, status, &progress_key, folder, key, &label) {
            Ok(()) => {}
            Err(e) if e.is_shutdown() => return Err(e),
            Err(e) => {
                failures += 1;
                status.update(label, WorkState::Error, e.to_string());
                tracing::warn!("处理压缩包失败 {}: {}", key, e);
            }
        }
    }

    if failures > 0 {
        // 有失败不落完成标记；重跑只补失败的键 — a re-run retries only the
        // keys that failed
        return Ok(false);
    }
    progress.update(&progress_key, |p: &mut UnzipProgress| {
        p.folder_complete = true;
    })?;
    status.update(folder.to_string(), WorkState::Completed, "目录合并完成");
    Ok(true)
}

/// Archives of one folder, natural-sorted so `Part1 < Part1_Split1 < Part2 <
/// Part10`, which makes the no-clobber merge first-wins deterministic.
/// The key-shape filter keeps folder `A` from stealing `A_B`'s archives.
fn list_folder_archives(app: &App, san: &str) -> Result<Vec<String>, BrigadeError> {
    let archive_prefix = format!("{}{}_", app.config.prefix, san);
    let shape = Regex::new(&format!(
        "^{}(Full|Part[0-9]+)(_Split[0-9]+)?\\.zip$",
        regex::escape(&archive_prefix)
    ))
    .map_err(|e| BrigadeError::OperationFailed(format!("键名正则构造失败: {}", e)))?;
    let mut keys: Vec<String> = app
        .store
        .list_keys(&archive_prefix)?
        .into_iter()
        .map(|(k, _)| k)
        .filter(|k| shape.is_match(k))
        .collect();
    keys.sort_by(|a, b| natural_cmp(a, b));
    Ok(keys)
}

/// Short display label for an archive key, e.g. `Part3_Split2`.
fn archive_label(key: &str) -> String {
    let stem = key.rsplit('/').next().unwrap_or(key).trim_end_matches(".zip");
    match stem.rfind("_Part").or_else(|| stem.rfind("_Full")) {
        Some(i) => stem[i + 1..].to_string(),
        None => stem.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
fn process_archive(
    app: &App,
    progress: &ProgressStore<'_>,
    status: &StatusSender,
    progress_key: &str,
    folder: &str,
    key: &str,
    label: &str,
) -> Result<(), BrigadeError> {
    let cfg = &app.config;
    apply_backpressure(app, status, label);

    let scratch_dir = scratch::create_scratch_dir(&cfg.work_dir, "unzip_")?;
    let zip_path = scratch_dir_zip(&scratch_dir);

    let result = (|| {
        status.update(label.to_string(), WorkState::Downloading, key.to_string());
        let written = app.store.download_to_file(key, &zip_path)?;
        if written == 0 || !zip_path.is_file() {
            return Err(BrigadeError::EmptyDownload(key.to_string()));
        }

        crate::archive::verify_zip(&zip_path)?;
        // 解压前做 zip bomb 比例检查，超限直接拒绝 — ratio gate before any
        // extraction work
        let unpacked = crate::archive::check_bomb_ratio(&zip_path, cfg.zip_bomb_ratio)?;

        status.update(
            label.to_string(),
            WorkState::Extracting,
            format!("解压 {} 到本地", human_bytes(unpacked)),
        );
        let extract_dir = scratch_dir.join("tree");
        std::fs::create_dir_all(&extract_dir).map_err(|e| {
            BrigadeError::OperationFailed(format!("无法创建解压目录: {}", e))
        })?;
        crate::archive::extract_zip(&zip_path, &extract_dir)?;

        status.update(label.to_string(), WorkState::Uploading, format!("合并到 {}", folder));
        if cfg.skip_upload {
            // 本地目的地模式：显式 first-wins 合并 — local destination mode
            let dest = PathBuf::from(&cfg.destination).join(folder);
            crate::archive::merge_no_clobber(&extract_dir, &dest)?;
        } else {
            let dest = join_remote(&cfg.destination, folder);
            app.agent.copy_no_clobber(&extract_dir, &dest)?;
        }

        progress.update(progress_key, |p: &mut UnzipProgress| {
            p.add_key(key);
        })?;
        status.update(label.to_string(), WorkState::Completed, key.to_string());
        Ok(())
    })();

    scratch::remove_scratch(&scratch_dir);
    result
}

fn scratch_dir_zip(scratch_dir: &std::path::Path) -> PathBuf {
    scratch_dir.join("archive.zip")
}

/// Disk backpressure before starting the next unit: above the backpressure
/// watermark, clean orphans first; if usage stays high, pause briefly to let
/// competing activities finish their cleanup.
fn apply_backpressure(app: &App, status: &StatusSender, label: &str) {
    let cfg = &app.config;
    let Ok(pct) = scratch::disk_usage_percent(&cfg.work_dir) else {
        return;
    };
    if pct <= cfg.disk_backpressure_percent {
        return;
    }
    scratch::clean_orphans(&cfg.work_dir);
    if let Ok(pct) = scratch::disk_usage_percent(&cfg.work_dir)
        && pct > cfg.disk_backpressure_percent
    {
        status.update(
            label.to_string(),
            WorkState::Backpressure,
            format!("磁盘 {:.1}%，暂停 {}s", pct, BACKPRESSURE_PAUSE.as_secs()),
        );
        app.shutdown.sleep(BACKPRESSURE_PAUSE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_label_extracts_part() {
        assert_eq!(archive_label("migration/My_Folder_Part3.zip"), "Part3");
        assert_eq!(archive_label("migration/My_Folder_Part3_Split2.zip"), "Part3_Split2");
        assert_eq!(archive_label("migration/My_Folder_Full.zip"), "Full");
    }
}
