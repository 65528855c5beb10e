use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::BrigadeError;
use crate::app::join_remote;
use crate::monitor::WorkState;
use crate::progress::ZipProgress;
use crate::rclone::KillReason;
use crate::scratch;
use crate::util::{human_bytes, normalize_rel_path};

use super::FolderCtx;

/// Name of the download manifest written inside the scratch directory; it is
/// excluded from the downloaded-set enumeration and from the archive.
const MANIFEST_NAME: &str = ".files_from.txt";

/// Free space required before zipping, as a multiple of the scratch size.
const ZIP_HEADROOM: f64 = 1.1;

/// Per-batch worker: drive one batch of normal files into one or more capped
/// archives, escalating to `_SplitN` keys whenever the disk watermark or the
/// archive-size cap cuts a download short.
///
/// The split loop must run even when the base key is already complete: a
/// previously interrupted run may have uploaded `Part3.zip` and
/// `Part3_Split1.zip` but not `Part3_Split2.zip`, and only walking the split
/// series finds the remaining work. Never short-circuit on the base key.
pub(crate) fn run_batch(
    ctx: FolderCtx<'_>,
    label: &str,
    files: &[String],
) -> Result<(), BrigadeError> {
    let progress_key = ctx.app.config.zip_progress_key(ctx.san);
    let doc: ZipProgress = ctx.progress.load(&progress_key)?;

    // resume: 先减掉已入包的文件 — subtract files already inside a completed
    // archive
    let mut remaining: Vec<String> =
        files.iter().filter(|f| !doc.has_file(f)).cloned().collect();
    if remaining.len() < files.len() {
        ctx.status.update(
            label.to_string(),
            WorkState::Resumed,
            format!("{}/{} 个文件已入包", files.len() - remaining.len(), files.len()),
        );
    }
    if remaining.is_empty() {
        ctx.status.update(label.to_string(), WorkState::Skipped, "本批全部已完成");
        return Ok(());
    }

    let remote_folder = join_remote(&ctx.app.config.source, ctx.folder);
    let mut split_index = 0u32;

    while !remaining.is_empty() {
        if ctx.app.shutdown.is_requested() {
            return Err(BrigadeError::ShutdownRequested);
        }
        let part_label = if split_index == 0 {
            label.to_string()
        } else {
            format!("{}_Split{}", label, split_index)
        };
        let display_label = if split_index == 0 {
            label.to_string()
        } else {
            format!("{}.{}", label, split_index)
        };
        let archive_key = ctx.app.config.archive_key(ctx.san, &part_label);

        // 已上传的 split 直接跳过，继续走序列 — an already uploaded split is
        // skipped; the series continues
        let doc: ZipProgress = ctx.progress.load(&progress_key)?;
        if doc.has_key(&archive_key) {
            ctx.status.update(display_label, WorkState::Skipped, "该分卷已上传");
            split_index += 1;
            continue;
        }

        let produced = run_split(SplitCtx {
            folder: ctx,
            progress_key: &progress_key,
            remote_folder: &remote_folder,
            archive_key: &archive_key,
            display_label: &display_label,
            remaining: &mut remaining,
        })?;
        if produced == 0 {
            // run_split 保证无进展即报错；这里兜底防止死循环 — run_split errors
            // on no progress; this guards the loop invariant regardless
            return Err(BrigadeError::EmptyDownload(archive_key));
        }
        split_index += 1;
    }
    ctx.status.update(label.to_string(), WorkState::Completed, "本批打包完成");
    Ok(())
}

/// Everything one split iteration needs.
struct SplitCtx<'a, 'b> {
    folder: FolderCtx<'a>,
    progress_key: &'b str,
    remote_folder: &'b str,
    archive_key: &'b str,
    display_label: &'b str,
    remaining: &'b mut Vec<String>,
}

/// One iteration of the split loop: download whatever fits, archive it,
/// upload it, record progress. Returns how many files were taken out of
/// `remaining`.
fn run_split(ctx: SplitCtx<'_, '_>) -> Result<usize, BrigadeError> {
    let SplitCtx { folder, progress_key, remote_folder, archive_key, display_label, remaining } =
        ctx;
    let app = folder.app;
    let cfg = &app.config;
    let scratch_dir = scratch::create_scratch_dir(&cfg.work_dir, "temp_")?;
    let zip_path = zip_path_for(&scratch_dir);

    let result = (|| {
        write_manifest(&scratch_dir, remaining)?;
        folder.status.update(
            display_label.to_string(),
            WorkState::Downloading,
            format!("{} 个文件待下载", remaining.len()),
        );

        let manifest_path = scratch_dir.join(MANIFEST_NAME);
        // 空手而归且非触发截断的非零退出按瞬时网络错误退避重试；只要盘上
        // 有文件落地就算进展，交给分卷逻辑 — a non-zero exit that left
        // nothing on disk (and tripped no monitor) retries under backoff;
        // anything that landed counts as progress for the split loop
        let policy = crate::store::RetryPolicy::from_config(cfg);
        let outcome = crate::store::retry_with_policy(policy, &app.shutdown, "rclone copy", || {
            let outcome = app.agent.download_batch(
                remote_folder,
                &manifest_path,
                &scratch_dir,
                cfg.download_threads,
                || watch_download(folder, &scratch_dir),
            )?;
            if outcome.killed == Some(KillReason::Shutdown) {
                return Err(BrigadeError::ShutdownRequested);
            }
            if outcome.killed.is_none()
                && !outcome.exited_cleanly()
                && enumerate_downloaded(&scratch_dir).is_empty()
            {
                return Err(BrigadeError::AgentExit(
                    "copy".into(),
                    outcome.exit_code.unwrap_or(-1),
                ));
            }
            Ok(outcome)
        })?;
        if let Some(reason) = outcome.killed {
            tracing::info!("{}: 下载被截断 ({:?})，进入分卷", display_label, reason);
        }

        // 盘上实际落地的文件集合（排除清单与零字节） — what actually landed
        let downloaded = enumerate_downloaded(&scratch_dir);
        let downloaded_set: HashSet<&str> = downloaded.iter().map(|s| s.as_str()).collect();
        remaining.retain(|f| !downloaded_set.contains(normalize_rel_path(f).as_str()));

        if downloaded.is_empty() {
            return match outcome.killed {
                Some(KillReason::DiskWatermark) => Err(BrigadeError::DiskWatermarkExceeded(
                    scratch::disk_usage_percent(&cfg.work_dir).unwrap_or(100.0),
                    cfg.disk_limit_percent,
                )),
                Some(_) | None => Err(BrigadeError::EmptyDownload(format!(
                    "{} (rclone 退出码 {:?})",
                    archive_key, outcome.exit_code
                ))),
            };
        }

        // 打包前确认余量：1.1 倍临时目录大小 — pre-zip headroom check
        let scratch_size = scratch::dir_size(&scratch_dir);
        let need = (scratch_size as f64 * ZIP_HEADROOM) as u64;
        let free = scratch::available_bytes(&cfg.work_dir)?;
        if free < need {
            folder.status.update(
                display_label.to_string(),
                WorkState::Error,
                format!("磁盘不足: 需 {} 剩 {}", human_bytes(need), human_bytes(free)),
            );
            return Err(BrigadeError::InsufficientScratchSpace(need, free));
        }

        folder.status.update(
            display_label.to_string(),
            WorkState::Zipping,
            format!("{} 个文件 / {}", downloaded.len(), human_bytes(scratch_size)),
        );
        crate::archive::build_store_zip(&scratch_dir, &zip_path, Some(MANIFEST_NAME))?;
        crate::archive::verify_zip(&zip_path)?;

        folder.status.update(
            display_label.to_string(),
            WorkState::Uploading,
            archive_key.to_string(),
        );
        upload_and_check(app, archive_key, &zip_path)?;

        // 进度仅在上传校验通过后写入 — progress is written only after the
        // upload verified, so a crash here re-uploads but never lies
        folder.progress.update(progress_key, |p: &mut ZipProgress| {
            p.add_key(archive_key);
            p.add_files(downloaded.iter().map(|s| s.as_str()), cfg.max_completed_keys);
        })?;
        folder.status.update(
            display_label.to_string(),
            WorkState::Completed,
            format!("{} 个文件入包", downloaded.len()),
        );
        Ok(downloaded.len())
    })();

    // 无论成败都清理包文件与临时目录 — cleanup on every outcome
    if zip_path.exists()
        && let Err(e) = std::fs::remove_file(&zip_path)
    {
        tracing::warn!("清理压缩包失败 {}: {}", zip_path.display(), e);
    }
    scratch::remove_scratch(&scratch_dir);
    result
}

fn zip_path_for(scratch_dir: &Path) -> PathBuf {
    let name = scratch_dir.file_name().map(|n| n.to_string_lossy().to_string());
    let parent = scratch_dir.parent().unwrap_or(Path::new("."));
    parent.join(format!("{}.zip", name.unwrap_or_else(|| "archive".to_string())))
}

fn write_manifest(scratch_dir: &Path, files: &[String]) -> Result<(), BrigadeError> {
    let path = scratch_dir.join(MANIFEST_NAME);
    let mut f = std::fs::File::create(&path).map_err(|e| {
        BrigadeError::OperationFailed(format!("无法写下载清单 {}: {}", path.display(), e))
    })?;
    for file in files {
        writeln!(f, "{}", file)
            .map_err(|e| BrigadeError::OperationFailed(format!("写下载清单失败: {}", e)))?;
    }
    Ok(())
}

/// Monitor hook run on every download poll tick. Order matters: a shutdown
/// beats resource triggers so the batch reports interruption, not escalation.
fn watch_download(ctx: FolderCtx<'_>, scratch_dir: &Path) -> Option<KillReason> {
    let cfg = &ctx.app.config;
    if ctx.app.shutdown.is_requested() {
        return Some(KillReason::Shutdown);
    }
    match scratch::disk_usage_percent(&cfg.work_dir) {
        Ok(pct) if pct > cfg.disk_limit_percent => {
            return Some(KillReason::DiskWatermark);
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("磁盘用量读取失败: {}", e),
    }
    if scratch::dir_size(scratch_dir) > cfg.max_zip_size {
        return Some(KillReason::SizeCap);
    }
    None
}

/// Files actually on disk after the download, relative to the scratch dir
/// with `/` separators, excluding the manifest and zero-byte entries.
fn enumerate_downloaded(scratch_dir: &Path) -> Vec<String> {
    walkdir::WalkDir::new(scratch_dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.metadata().map(|m| m.len() > 0).unwrap_or(false))
        .filter_map(|e| {
            e.path()
                .strip_prefix(scratch_dir)
                .ok()
                .map(|rel| normalize_rel_path(&rel.to_string_lossy()))
        })
        .filter(|rel| rel != MANIFEST_NAME)
        .collect()
}

fn upload_and_check(
    app: &crate::app::App,
    archive_key: &str,
    zip_path: &Path,
) -> Result<(), BrigadeError> {
    app.store.put_file(archive_key, zip_path)?;
    let local_size = std::fs::metadata(zip_path)
        .map(|m| m.len())
        .map_err(|e| BrigadeError::OperationFailed(format!("无法读取压缩包大小: {}", e)))?;
    match app.store.head_size(archive_key)? {
        Some(remote_size) if remote_size == local_size => Ok(()),
        _ => Err(BrigadeError::UploadVerifyFailed(archive_key.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_excludes_manifest_and_empty_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("sub")).expect("mkdir");
        std::fs::write(dir.path().join(MANIFEST_NAME), b"list\n").expect("manifest");
        std::fs::write(dir.path().join("a.txt"), b"data").expect("a");
        std::fs::write(dir.path().join("sub/b.txt"), b"more").expect("b");
        std::fs::write(dir.path().join("empty.txt"), b"").expect("empty");
        let mut got = enumerate_downloaded(dir.path());
        got.sort();
        assert_eq!(got, vec!["a.txt", "sub/b.txt"]);
    }

    #[test]
    fn zip_path_sits_next_to_scratch() {
        let p = zip_path_for(Path::new("/work/temp_77_3"));
        assert_eq!(p, PathBuf::from("/work/temp_77_3.zip"));
    }

    #[test]
    fn manifest_is_newline_separated() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_manifest(dir.path(), &["a.txt".into(), "sub/b.txt".into()]).expect("write");
        let raw = std::fs::read_to_string(dir.path().join(MANIFEST_NAME)).expect("read");
        assert_eq!(raw, "a.txt\nsub/b.txt\n");
    }
}
