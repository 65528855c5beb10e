pub(crate) mod batch;
pub(crate) mod large;

use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{bounded, unbounded};

use crate::BrigadeError;
use crate::app::App;
use crate::lock::InstanceLock;
use crate::monitor::{StatusMonitor, StatusSender, WorkState};
use crate::progress::{LargeFileEntry, ProgressStore, ZipProgress};
use crate::sanitize::sanitize_name;

/// Shared per-folder context handed to the batch workers and the large-file
/// pipeline; groups the handles every worker needs.
#[derive(Clone, Copy)]
pub(crate) struct FolderCtx<'a> {
    pub(crate) app: &'a App,
    pub(crate) progress: &'a ProgressStore<'a>,
    pub(crate) status: &'a StatusSender,
    pub(crate) folder: &'a str,
    pub(crate) san: &'a str,
}

/// Zipper: for each folder in the index that is not yet complete, drive
/// normal files into capped archives and large files through direct
/// server-side copies, recording per-folder progress atomically.
pub fn run(app: &App) -> Result<()> {
    let _lock = InstanceLock::acquire(
        &app.config.work_dir,
        "zipper",
        Duration::from_secs(app.config.instance_lock_timeout_secs),
    )?;
    app.store.check_usable(&app.config.prefix)?;
    std::fs::create_dir_all(&app.config.work_dir)?;
    crate::scratch::clean_orphans(&app.config.work_dir);

    let monitor = StatusMonitor::spawn();
    let status = monitor.sender();
    let progress = ProgressStore::new(&app.store);

    let folders = read_folder_index(app)?;
    tracing::info!("索引含 {} 个目录", folders.len());

    let mut failed_folders = 0usize;
    for folder in &folders {
        if app.shutdown.is_requested() {
            break;
        }
        match process_folder(app, &progress, &status, folder) {
            Ok(true) => {}
            Ok(false) => failed_folders += 1,
            Err(e) if e.is_shutdown() => break,
            Err(e) => {
                failed_folders += 1;
                status.update(folder.clone(), WorkState::Error, e.to_string());
                tracing::warn!("目录处理失败 {}: {}", folder, e);
            }
        }
    }

    monitor.finish();
    if app.shutdown.is_requested() {
        println!("⚠️ 已中断，进度已保存，重新运行可续传");
    } else if failed_folders > 0 {
        println!("⚠️ {} 个目录未完成，重新运行可重试", failed_folders);
    } else {
        println!("✅ 打包阶段完成，共 {} 个目录", folders.len());
    }
    Ok(())
}

pub(crate) fn read_folder_index(app: &App) -> Result<Vec<String>, BrigadeError> {
    let raw = app
        .store
        .get_bytes_opt(&app.config.index_key())?
        .ok_or_else(|| BrigadeError::ObjectMissing(app.config.index_key()))?;
    let text = String::from_utf8_lossy(&raw);
    Ok(text.lines().map(|l| l.trim_end()).filter(|l| !l.is_empty()).map(String::from).collect())
}

/// Returns Ok(true) when the folder finished with zero failures.
fn process_folder(
    app: &App,
    progress: &ProgressStore<'_>,
    status: &StatusSender,
    folder: &str,
) -> Result<bool, BrigadeError> {
    let san = sanitize_name(folder);
    let progress_key = app.config.zip_progress_key(&san);

    let doc: ZipProgress = progress.load(&progress_key)?;
    if doc.folder_complete {
        status.update(folder.to_string(), WorkState::Skipped, "目录已完成");
        return Ok(true);
    }
    if !doc.completed_keys.is_empty() || !doc.large_files_done.is_empty() {
        status.update(
            folder.to_string(),
            WorkState::Resumed,
            format!("{} 包 / {} 大文件已完成", doc.completed_keys.len(), doc.large_files_done.len()),
        );
    }

    // FETCH_LISTS
    let Some(raw_list) = app.store.get_bytes_opt(&app.config.list_key(&san))? else {
        // 未映射的目录跳过，不算失败也不标记完成 — unmapped folder: skip,
        // neither a failure nor complete
        status.update(folder.to_string(), WorkState::Skipped, "缺少文件列表 (未映射?)");
        return Ok(false);
    };
    let normal_files: Vec<String> = String::from_utf8_lossy(&raw_list)
        .lines()
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();

    let large_files: Vec<LargeFileEntry> =
        match app.store.get_bytes_opt(&app.config.large_manifest_key(&san))? {
            None => Vec::new(),
            Some(raw) => serde_json::from_slice(&raw).map_err(|e| {
                BrigadeError::OperationFailed(format!("大文件清单解析失败 {}: {}", folder, e))
            })?,
        };

    let batches = plan_batches(&normal_files, app.config.split_threshold);

    // NORMAL_PIPELINE ∥ LARGE_PIPELINE
    let (fail_tx, fail_rx) = unbounded::<BrigadeError>();
    let workers = app.config.max_parallel_workers;
    let (token_tx, token_rx) = bounded::<()>(workers);
    for _ in 0..workers {
        let _ = token_tx.send(());
    }
    let large_files: &[LargeFileEntry] = &large_files;
    let ctx = FolderCtx { app, progress, status, folder, san: &san };

    std::thread::scope(|s| {
        let large_fail_tx = fail_tx.clone();
        s.spawn(move || {
            for e in large::run_large_pipeline(ctx, large_files) {
                let _ = large_fail_tx.send(e);
            }
        });

        for (label, files) in &batches {
            // token bucket 限制并发批次 — bound concurrent batch workers
            if token_rx.recv().is_err() {
                break;
            }
            if app.shutdown.is_requested() {
                let _ = token_tx.send(());
                break;
            }
            let fail_tx = fail_tx.clone();
            let token_tx = token_tx.clone();
            s.spawn(move || {
                if let Err(e) = batch::run_batch(ctx, label, files) {
                    let _ = fail_tx.send(e);
                }
                let _ = token_tx.send(());
            });
        }
    });
    drop(fail_tx);

    let failures: Vec<BrigadeError> = fail_rx.into_iter().collect();
    if app.shutdown.is_requested() {
        return Err(BrigadeError::ShutdownRequested);
    }
    if !failures.is_empty() {
        for e in &failures {
            tracing::warn!("{}: 子任务失败: {}", folder, e);
        }
        status.update(
            folder.to_string(),
            WorkState::Error,
            format!("{} 个子任务失败", failures.len()),
        );
        return Ok(false);
    }

    // MARK_COMPLETE_IF_NO_FAILURE: 只有零失败才落完成标记
    progress.update(&progress_key, |p: &mut ZipProgress| {
        p.folder_complete = true;
    })?;
    status.update(folder.to_string(), WorkState::Completed, "目录打包完成");
    Ok(true)
}

/// Partition the normal-file list into batches of at most `split_threshold`
/// entries. A single batch is labeled `Full`, otherwise `Part1..PartN`.
pub fn plan_batches(files: &[String], split_threshold: usize) -> Vec<(String, Vec<String>)> {
    if files.is_empty() {
        return Vec::new();
    }
    let chunks: Vec<&[String]> = files.chunks(split_threshold.max(1)).collect();
    if chunks.len() == 1 {
        return vec![("Full".to_string(), chunks[0].to_vec())];
    }
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, c)| (format!("Part{}", i + 1), c.to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("f{}.bin", i)).collect()
    }

    #[test]
    fn single_batch_is_full() {
        let b = plan_batches(&names(1000), 1000);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].0, "Full");
        assert_eq!(b[0].1.len(), 1000);
    }

    #[test]
    fn overflow_splits_into_parts() {
        let b = plan_batches(&names(1500), 1000);
        assert_eq!(b.len(), 2);
        assert_eq!(b[0].0, "Part1");
        assert_eq!(b[0].1.len(), 1000);
        assert_eq!(b[1].0, "Part2");
        assert_eq!(b[1].1.len(), 500);
    }

    #[test]
    fn empty_list_plans_nothing() {
        assert!(plan_batches(&[], 1000).is_empty());
    }

    #[test]
    fn batches_cover_all_files_in_order() {
        let files = names(2501);
        let b = plan_batches(&files, 1000);
        let flat: Vec<String> = b.into_iter().flat_map(|(_, fs)| fs).collect();
        assert_eq!(flat, files);
    }
}
