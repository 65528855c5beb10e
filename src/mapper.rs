use std::time::Duration;

use anyhow::Result;

use crate::app::{App, join_remote};
use crate::lock::InstanceLock;
use crate::monitor::{StatusMonitor, WorkState};
use crate::progress::{LargeFileEntry, MapperProgress};
use crate::sanitize::sanitize_name;
use crate::util::round_gib;

/// Mapper: discover top-level folders under the source root, classify each
/// folder's files by the large-file threshold, and publish the folder index,
/// per-folder normal-file list and large-file manifest to the staging store.
pub fn run(app: &App) -> Result<()> {
    let _lock = InstanceLock::acquire(
        &app.config.work_dir,
        "mapper",
        Duration::from_secs(app.config.instance_lock_timeout_secs),
    )?;
    app.store.check_usable(&app.config.prefix)?;

    let monitor = StatusMonitor::spawn();
    let status = monitor.sender();

    // 2. 枚举源端顶层目录并写索引 — enumerate top-level dirs, write the index
    let folders = app.agent.list_dirs(&app.config.source)?;
    tracing::info!("发现 {} 个顶层目录", folders.len());
    let index_body = folders.join("\n").into_bytes();
    app.store.put_bytes(&app.config.index_key(), index_body)?;

    let mut failures = 0usize;
    for folder in &folders {
        if app.shutdown.is_requested() {
            tracing::info!("收到终止信号，停止枚举");
            break;
        }
        match map_folder(app, &status, folder) {
            Ok(()) => {}
            Err(e) => {
                // 单个目录失败不影响其余目录 — one folder failing does not
                // abort the remaining folders
                failures += 1;
                status.update(folder.clone(), WorkState::Error, e.to_string());
                tracing::warn!("目录映射失败 {}: {}", folder, e);
            }
        }
    }

    monitor.finish();
    if failures > 0 {
        println!("⚠️ {} 个目录映射失败，重新运行可重试", failures);
    } else {
        println!("✅ 映射完成，共 {} 个目录", folders.len());
    }
    Ok(())
}

fn map_folder(
    app: &App,
    status: &crate::monitor::StatusSender,
    folder: &str,
) -> Result<(), crate::BrigadeError> {
    let san = sanitize_name(folder);
    let list_key = app.config.list_key(&san);

    // resume gate: 列表对象已存在即跳过 — the normal-list object existing
    // means this folder was fully mapped by an earlier run
    if app.store.exists(&list_key)? {
        status.update(folder.to_string(), WorkState::Skipped, "列表已存在");
        return Ok(());
    }

    status.update(folder.to_string(), WorkState::Transferring, "枚举文件中");
    let remote = join_remote(&app.config.source, folder);
    let entries = app.agent.list_files_recursive(&remote)?;

    let mut normal: Vec<&str> = Vec::new();
    let mut large: Vec<LargeFileEntry> = Vec::new();
    for e in &entries {
        let size = e.size.max(0) as u64;
        // 严格大于才算大文件，相等归普通 — strictly greater than the
        // threshold counts as large; equal is normal
        if size > app.config.large_file_threshold {
            large.push(LargeFileEntry {
                path: e.path.clone(),
                size,
                size_gb: round_gib(size),
            });
        } else {
            normal.push(&e.path);
        }
    }

    // 先传大文件清单，最后传作为断点标记的列表对象 — the normal list is the
    // resume gate, so it must land last; a crash in between re-maps cleanly
    if !large.is_empty() {
        let manifest = serde_json::to_vec(&large).map_err(|e| {
            crate::BrigadeError::OperationFailed(format!("大文件清单序列化失败: {}", e))
        })?;
        app.store.put_bytes(&app.config.large_manifest_key(&san), manifest)?;
    }
    let list_body = normal.join("\n").into_bytes();
    app.store.put_bytes(&list_key, list_body)?;

    // 诊断用进度文档 — diagnostic progress document
    let progress = serde_json::to_vec(&MapperProgress { mapped: true }).unwrap_or_default();
    app.store.put_bytes(&app.config.mapper_progress_key(&san), progress)?;

    status.update(
        folder.to_string(),
        WorkState::Completed,
        format!("{} 普通 / {} 大文件", normal.len(), large.len()),
    );
    Ok(())
}
