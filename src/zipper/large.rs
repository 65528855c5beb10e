use crate::BrigadeError;
use crate::app::join_remote;
use crate::monitor::WorkState;
use crate::progress::{LargeFileEntry, ZipProgress};
use crate::util::human_bytes;

use super::FolderCtx;

/// Large pipeline: files over the threshold bypass the staging bucket and go
/// straight from source to destination as server-side copies, one at a time
/// in manifest order. Each success is recorded before the next file starts,
/// so a crash loses at most the in-flight copy.
pub(crate) fn run_large_pipeline(
    ctx: FolderCtx<'_>,
    manifest: &[LargeFileEntry],
) -> Vec<BrigadeError> {
    if manifest.is_empty() {
        return Vec::new();
    }
    let app = ctx.app;
    let progress_key = app.config.zip_progress_key(ctx.san);
    let mut failures = Vec::new();

    let doc: ZipProgress = match ctx.progress.load(&progress_key) {
        Ok(d) => d,
        Err(e) => return vec![e],
    };

    for (idx, entry) in manifest.iter().enumerate() {
        if app.shutdown.is_requested() {
            // 合作式终止：未完成的下次续传 — cooperative termination
            failures.push(BrigadeError::ShutdownRequested);
            break;
        }
        let label = format!("Large{}", idx + 1);
        if doc.has_large_file(&entry.path) {
            ctx.status.update(label, WorkState::Skipped, entry.path.clone());
            continue;
        }
        ctx.status.update(
            label.clone(),
            WorkState::Transferring,
            format!("{} ({})", entry.path, human_bytes(entry.size)),
        );
        let rel = format!("{}/{}", ctx.folder, entry.path);
        let src = join_remote(&app.config.source, &rel);
        let dst = join_remote(&app.config.destination, &rel);
        match app.agent.copyto(&src, &dst) {
            Ok(()) => {
                let recorded = ctx.progress.update(&progress_key, |p: &mut ZipProgress| {
                    p.add_large_file(&entry.path);
                });
                match recorded {
                    Ok(_) => ctx.status.update(label, WorkState::Completed, entry.path.clone()),
                    Err(e) => {
                        ctx.status.update(label, WorkState::Error, e.to_string());
                        failures.push(e);
                    }
                }
            }
            Err(e) if e.is_shutdown() => {
                failures.push(e);
                break;
            }
            Err(e) => {
                ctx.status.update(label, WorkState::Error, e.to_string());
                tracing::warn!("大文件直传失败 {}: {}", entry.path, e);
                failures.push(e);
            }
        }
    }
    failures
}
