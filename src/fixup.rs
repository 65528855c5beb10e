use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::BrigadeError;
use crate::app::{App, join_remote};
use crate::lock::InstanceLock;
use crate::monitor::{StatusMonitor, StatusSender, WorkState};
use crate::rclone::RemoteEntry;

/// Push the processed-folder log back to the staging store every this many
/// newly fixed/checked folders.
const LOG_PUSH_INTERVAL: usize = 200;

#[derive(Default)]
struct FixupStats {
    checked: usize,
    fixed_files: usize,
    fixed_folders: usize,
    skipped: usize,
    errors: usize,
}

/// Shared state of one fixup run: the resume log (folders already handled)
/// plus counters. The queue itself is a channel; `in_flight` counts folders
/// enqueued but not yet fully processed so workers know when discovery has
/// truly drained.
struct FixupRun<'a> {
    app: &'a App,
    status: &'a StatusSender,
    processed: Mutex<HashSet<String>>,
    dirty: AtomicUsize,
    stats: Mutex<FixupStats>,
    in_flight: AtomicUsize,
}

/// Fixup: repair redundant nesting at the destination — a folder whose sole
/// child is a file or directory carrying the folder's own name is flattened
/// one level. Discovery is on-the-go: workers list folders as they pop them
/// and enqueue subfolders, no pre-listing pass.
pub fn run(app: &App) -> Result<()> {
    let _lock = InstanceLock::acquire(
        &app.config.work_dir,
        "fixup",
        Duration::from_secs(app.config.instance_lock_timeout_secs),
    )?;
    app.store.check_usable(&app.config.prefix)?;

    let monitor = StatusMonitor::spawn();
    let status = monitor.sender();

    // 从暂存桶恢复处理日志 — load the resume log from the staging store
    let log_key = app.config.fixup_log_key();
    let processed: HashSet<String> = match app.store.get_bytes_opt(&log_key)? {
        None => HashSet::new(),
        Some(raw) => String::from_utf8_lossy(&raw)
            .lines()
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect(),
    };
    if !processed.is_empty() {
        tracing::info!("续传: {} 个目录已处理过", processed.len());
    }

    let run = FixupRun {
        app,
        status: &status,
        processed: Mutex::new(processed),
        dirty: AtomicUsize::new(0),
        stats: Mutex::new(FixupStats::default()),
        in_flight: AtomicUsize::new(0),
    };

    let (tx, rx) = unbounded::<String>();
    // 以目的端顶层目录作为种子；先把上次中断留下的半程展平恢复完 — seed with
    // the destination's top-level dirs, after finishing any half-done
    // flatten a previous run left at this level
    let mut roots = app.agent.list_entries(&app.config.destination)?;
    if recover_partial(&run, "", &roots) > 0 {
        roots = app.agent.list_entries(&app.config.destination)?;
    }
    for e in roots.iter().filter(|e| e.is_dir) {
        run.in_flight.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(e.path.clone());
    }

    let workers = app.config.max_parallel_workers;
    std::thread::scope(|s| {
        for _ in 0..workers {
            let rx: Receiver<String> = rx.clone();
            let tx: Sender<String> = tx.clone();
            let run = &run;
            s.spawn(move || worker_loop(run, rx, tx));
        }
        drop(tx);
    });

    // 收尾把日志推回桶里 — final log push
    push_log(&run, &log_key, true)?;
    monitor.finish();

    let stats = run.stats.lock().expect("stats lock poisoned");
    println!(
        "✅ 修复完成: 检查 {} / 修复 {} / 跳过 {} / 失败 {}",
        stats.checked,
        stats.fixed_files + stats.fixed_folders,
        stats.skipped,
        stats.errors
    );
    Ok(())
}

fn worker_loop(run: &FixupRun<'_>, rx: Receiver<String>, tx: Sender<String>) {
    loop {
        if run.app.shutdown.is_requested() {
            break;
        }
        let folder = match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(f) => f,
            Err(_) => {
                // 队列空且没有在途任务即结束 — drained and nothing in flight
                if run.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                continue;
            }
        };
        process_folder(run, &tx, &folder);
        run.in_flight.fetch_sub(1, Ordering::SeqCst);
        let log_key = run.app.config.fixup_log_key();
        if run.dirty.load(Ordering::SeqCst) >= LOG_PUSH_INTERVAL
            && let Err(e) = push_log(run, &log_key, false)
        {
            tracing::warn!("日志推送失败: {}", e);
        }
    }
}

fn process_folder(run: &FixupRun<'_>, tx: &Sender<String>, folder: &str) {
    {
        let mut stats = run.stats.lock().expect("stats lock poisoned");
        stats.checked += 1;
    }
    {
        let processed = run.processed.lock().expect("log lock poisoned");
        if processed.contains(folder) {
            drop(processed);
            let mut stats = run.stats.lock().expect("stats lock poisoned");
            stats.skipped += 1;
            return;
        }
    }

    let remote = join_remote(&run.app.config.destination, folder);
    let mut entries = match run.app.agent.list_entries(&remote) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!("列目录失败 {}: {}", folder, e);
            let mut stats = run.stats.lock().expect("stats lock poisoned");
            stats.errors += 1;
            return;
        }
    };
    // 子级里有未完成的展平先恢复，再按恢复后的状态重新列一遍
    // — recover half-done child flattens, then re-list the settled state
    if recover_partial(run, folder, &entries) > 0 {
        entries = match run.app.agent.list_entries(&remote) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("恢复后重列目录失败 {}: {}", folder, e);
                let mut stats = run.stats.lock().expect("stats lock poisoned");
                stats.errors += 1;
                return;
            }
        };
    }
    let files: Vec<_> = entries.iter().filter(|e| !e.is_dir).collect();
    let dirs: Vec<_> = entries.iter().filter(|e| e.is_dir).collect();

    // 子目录先入队，修复与发现并行 — enqueue subfolders before fixing
    for d in &dirs {
        run.in_flight.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(format!("{}/{}", folder, d.path));
    }

    let name = folder.rsplit('/').next().unwrap_or(folder);
    let redundant_file = files.len() == 1 && dirs.is_empty() && files[0].path == name;
    let redundant_dir = dirs.len() == 1 && files.is_empty() && dirs[0].path == name;
    if !redundant_file && !redundant_dir {
        return;
    }

    match flatten(run.app, folder, name) {
        Ok(()) => {
            run.status.update(
                folder.to_string(),
                WorkState::Completed,
                if redundant_file { "已展平 (文件)" } else { "已展平 (目录)" },
            );
            let mut stats = run.stats.lock().expect("stats lock poisoned");
            if redundant_file {
                stats.fixed_files += 1;
            } else {
                stats.fixed_folders += 1;
            }
        }
        Err(e) => {
            run.status.update(folder.to_string(), WorkState::Error, e.to_string());
            let mut stats = run.stats.lock().expect("stats lock poisoned");
            stats.errors += 1;
            return;
        }
    }

    mark_processed(run, folder);
}

fn mark_processed(run: &FixupRun<'_>, folder: &str) {
    let mut processed = run.processed.lock().expect("log lock poisoned");
    processed.insert(folder.to_string());
    drop(processed);
    run.dirty.fetch_add(1, Ordering::SeqCst);
}

/// Finish flattens a previous run left half done. A `<name>.tmp` sibling
/// paired with a missing or empty `<name>` directory means the three-step
/// move in `flatten` was interrupted between steps; drop the leftover
/// directory (rmdir refuses non-empty ones, so a mispaired name cannot lose
/// data) and move the content back into the folder's place. `parent` is the
/// empty string at the destination root. Returns how many pairs were
/// recovered; the caller re-lists when any were.
fn recover_partial(run: &FixupRun<'_>, parent: &str, entries: &[RemoteEntry]) -> usize {
    let rel = |name: &str| {
        if parent.is_empty() { name.to_string() } else { format!("{}/{}", parent, name) }
    };
    let mut recovered = 0usize;
    for e in entries {
        let Some(orig) = e.path.strip_suffix(".tmp") else { continue };
        if orig.is_empty() {
            continue;
        }
        let orig_entry = entries.iter().find(|o| o.path == orig);
        if let Some(o) = orig_entry
            && !o.is_dir
        {
            // 原名已是文件：要么展平早已完成，要么 .tmp 是无关同名文件
            tracing::warn!("发现无法配对的 .tmp 条目，保留不动: {}", rel(&e.path));
            continue;
        }
        let tmp_remote = join_remote(&run.app.config.destination, &rel(&e.path));
        let dst_remote = join_remote(&run.app.config.destination, &rel(orig));
        if orig_entry.is_some()
            && let Err(err) = run.app.agent.rmdir(&dst_remote)
        {
            tracing::warn!("恢复展平失败（目录非空?） {}: {}", rel(orig), err);
            let mut stats = run.stats.lock().expect("stats lock poisoned");
            stats.errors += 1;
            continue;
        }
        match run.app.agent.moveto(&tmp_remote, &dst_remote) {
            Ok(()) => {
                run.status.update(rel(orig), WorkState::Completed, "已恢复中断的展平");
                mark_processed(run, &rel(orig));
                let mut stats = run.stats.lock().expect("stats lock poisoned");
                if e.is_dir {
                    stats.fixed_folders += 1;
                } else {
                    stats.fixed_files += 1;
                }
                recovered += 1;
            }
            Err(err) => {
                run.status.update(rel(orig), WorkState::Error, err.to_string());
                let mut stats = run.stats.lock().expect("stats lock poisoned");
                stats.errors += 1;
            }
        }
    }
    recovered
}

/// The three-step dance: move the sole child aside, drop the now-empty
/// folder, move the child into the folder's place. Each verb retries
/// transient failures; a run that still dies between steps leaves a
/// `<name>.tmp` sibling that `recover_partial` completes on the next pass,
/// so no state is ever silently stranded.
fn flatten(app: &App, folder: &str, name: &str) -> Result<(), BrigadeError> {
    let parent = match folder.rfind('/') {
        Some(i) => &folder[..i],
        None => "",
    };
    let child = join_remote(&app.config.destination, &format!("{}/{}", folder, name));
    let tmp = join_remote(
        &app.config.destination,
        &if parent.is_empty() { format!("{}.tmp", name) } else { format!("{}/{}.tmp", parent, name) },
    );
    let dst = join_remote(&app.config.destination, folder);
    app.agent.moveto(&child, &tmp)?;
    app.agent.rmdir(&dst)?;
    app.agent.moveto(&tmp, &dst)?;
    Ok(())
}

fn push_log(run: &FixupRun<'_>, log_key: &str, force: bool) -> Result<(), BrigadeError> {
    if !force && run.dirty.load(Ordering::SeqCst) == 0 {
        return Ok(());
    }
    let body = {
        let processed = run.processed.lock().expect("log lock poisoned");
        let mut lines: Vec<&String> = processed.iter().collect();
        lines.sort();
        lines.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("\n").into_bytes()
    };
    run.app.store.put_bytes(log_key, body)?;
    run.dirty.store(0, Ordering::SeqCst);
    Ok(())
}
