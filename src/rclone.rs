use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::BrigadeError;
use crate::shutdown::Shutdown;
use crate::store::{RetryPolicy, retry_with_policy};

/// Listing calls that hang are abandoned after this long; the caller logs
/// and skips the folder.
const LIST_TIMEOUT: Duration = Duration::from_secs(600);
/// Grace between terminate and kill for in-flight children.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Download poll interval; disk/size/shutdown triggers are checked this often.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// One entry of an `lsjson` listing.
#[derive(Deserialize, Debug, Clone)]
pub struct RemoteEntry {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Size", default)]
    pub size: i64,
    #[serde(rename = "IsDir", default)]
    pub is_dir: bool,
}

/// Why an in-flight bulk download was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    DiskWatermark,
    SizeCap,
    Shutdown,
}

/// Result of a bulk download: either the child exited on its own (code
/// recorded) or a monitor trigger ended it early.
#[derive(Debug, Clone, Copy)]
pub struct DownloadOutcome {
    pub exit_code: Option<i32>,
    pub killed: Option<KillReason>,
}

impl DownloadOutcome {
    pub fn exited_cleanly(&self) -> bool {
        self.killed.is_none() && self.exit_code == Some(0)
    }
}

/// The transfer-agent boundary: every interaction with the source and
/// destination remotes goes through the external rclone binary as a child
/// process. Nothing in here interprets remote semantics beyond rclone's
/// documented verbs. A non-zero exit is transient transport by default, so
/// every verb (except the monitored bulk download, see `download_batch`)
/// runs under the same backoff policy as the staging store.
pub struct TransferAgent {
    binary: PathBuf,
    config_file: Option<PathBuf>,
    policy: RetryPolicy,
    shutdown: Shutdown,
}

impl TransferAgent {
    pub fn new(
        binary: PathBuf,
        config_file: Option<PathBuf>,
        policy: RetryPolicy,
        shutdown: Shutdown,
    ) -> Self {
        Self { binary, config_file, policy, shutdown }
    }

    fn with_retry<T>(
        &self,
        what: &str,
        op: impl FnMut() -> Result<T, BrigadeError>,
    ) -> Result<T, BrigadeError> {
        retry_with_policy(self.policy, &self.shutdown, what, op)
    }

    fn base_cmd(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(ref cfg) = self.config_file {
            cmd.arg("--config").arg(cfg);
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Immediate subdirectories of a remote root, trailing separators
    /// trimmed, listing order preserved.
    pub fn list_dirs(&self, remote: &str) -> Result<Vec<String>, BrigadeError> {
        let out = self.with_retry("lsf", || {
            let mut cmd = self.base_cmd();
            cmd.args(["lsf", "--dirs-only", remote]);
            self.run_capture(cmd, "lsf", LIST_TIMEOUT)
        })?;
        Ok(out
            .lines()
            .map(|l| l.trim_end_matches('/').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Recursive file listing with sizes, relative to `remote`.
    pub fn list_files_recursive(&self, remote: &str) -> Result<Vec<RemoteEntry>, BrigadeError> {
        let out = self.with_retry("lsjson -R", || {
            let mut cmd = self.base_cmd();
            cmd.args(["lsjson", "-R", "--files-only", "--no-mimetype", "--no-modtime", remote]);
            self.run_capture(cmd, "lsjson -R", LIST_TIMEOUT)
        })?;
        serde_json::from_str::<Vec<RemoteEntry>>(&out)
            .map_err(|e| BrigadeError::AgentListDecode(remote.to_string(), e.to_string()))
    }

    /// Non-recursive listing of one remote directory (files and dirs).
    pub fn list_entries(&self, remote: &str) -> Result<Vec<RemoteEntry>, BrigadeError> {
        let out = self.with_retry("lsjson", || {
            let mut cmd = self.base_cmd();
            cmd.args(["lsjson", "--no-mimetype", "--no-modtime", remote]);
            self.run_capture(cmd, "lsjson", LIST_TIMEOUT)
        })?;
        serde_json::from_str::<Vec<RemoteEntry>>(&out)
            .map_err(|e| BrigadeError::AgentListDecode(remote.to_string(), e.to_string()))
    }

    /// Bulk download driven by a `--files-from` manifest into `dest`.
    /// `watch` runs every poll tick; returning a reason terminates the child
    /// (terminate → grace → kill) and records why.
    ///
    /// Deliberately NOT wrapped in the retry policy: a non-zero exit with
    /// files already on disk is normal partial progress for the split loop,
    /// and only the caller can see what landed. The split worker retries the
    /// truly-empty non-zero case itself.
    pub fn download_batch(
        &self,
        src: &str,
        files_from: &Path,
        dest: &Path,
        transfers: usize,
        mut watch: impl FnMut() -> Option<KillReason>,
    ) -> Result<DownloadOutcome, BrigadeError> {
        let mut cmd = self.base_cmd();
        cmd.arg("copy")
            .arg(src)
            .arg(dest)
            .arg("--files-from")
            .arg(files_from)
            .arg("--transfers")
            .arg(transfers.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| BrigadeError::AgentSpawnFailed("copy".into(), e.to_string()))?;
        let drains = drain_pipes(&mut child);

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    join_drains(drains);
                    return Ok(DownloadOutcome { exit_code: status.code(), killed: None });
                }
                Ok(None) => {}
                Err(e) => {
                    terminate_child(&mut child);
                    join_drains(drains);
                    return Err(BrigadeError::OperationFailed(format!(
                        "等待 rclone 进程失败: {}",
                        e
                    )));
                }
            }
            if let Some(reason) = watch() {
                terminate_child(&mut child);
                join_drains(drains);
                return Ok(DownloadOutcome { exit_code: None, killed: Some(reason) });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Server-side copy of one file between remotes (large-file pipeline).
    /// Polls the shutdown flag; the child is terminated on shutdown.
    pub fn copyto(&self, src: &str, dst: &str) -> Result<(), BrigadeError> {
        self.with_retry("copyto", || {
            let mut cmd = self.base_cmd();
            cmd.args(["copyto", src, dst]);
            self.run_to_completion(cmd, "copyto")
        })
    }

    /// Recursive no-clobber copy of a local directory into a remote folder.
    /// `--ignore-existing` gives the first-wins merge the unzipper relies on,
    /// and also makes the retried attempts skip whatever already landed.
    pub fn copy_no_clobber(&self, local_dir: &Path, remote: &str) -> Result<(), BrigadeError> {
        self.with_retry("copy --ignore-existing", || {
            let mut cmd = self.base_cmd();
            cmd.arg("copy")
                .arg(local_dir)
                .arg(remote)
                .arg("--ignore-existing");
            self.run_to_completion(cmd, "copy --ignore-existing")
        })
    }

    /// `moveto` retried: re-attempts after the move landed fail with "not
    /// found" on the source, which still surfaces; callers recover from the
    /// on-remote state they observe, not from this result alone.
    pub fn moveto(&self, src: &str, dst: &str) -> Result<(), BrigadeError> {
        self.with_retry("moveto", || {
            let mut cmd = self.base_cmd();
            cmd.args(["moveto", src, dst]);
            self.run_to_completion(cmd, "moveto")
        })
    }

    pub fn rmdir(&self, remote: &str) -> Result<(), BrigadeError> {
        self.with_retry("rmdir", || {
            let mut cmd = self.base_cmd();
            cmd.args(["rmdir", remote]);
            self.run_to_completion(cmd, "rmdir")
        })
    }

    /// Run to natural completion with shutdown polling; non-zero exit maps
    /// to the transient `AgentExit` error.
    fn run_to_completion(&self, mut cmd: Command, what: &str) -> Result<(), BrigadeError> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| BrigadeError::AgentSpawnFailed(what.into(), e.to_string()))?;
        let drains = drain_pipes(&mut child);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    join_drains(drains);
                    return if status.success() {
                        Ok(())
                    } else {
                        Err(BrigadeError::AgentExit(what.into(), status.code().unwrap_or(-1)))
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    terminate_child(&mut child);
                    join_drains(drains);
                    return Err(BrigadeError::OperationFailed(format!(
                        "等待 rclone 进程失败: {}",
                        e
                    )));
                }
            }
            if self.shutdown.is_requested() {
                terminate_child(&mut child);
                join_drains(drains);
                return Err(BrigadeError::ShutdownRequested);
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    }

    /// Run a listing command, capture stdout, enforce a timeout. stderr is
    /// drained and discarded (rclone chatters there even on success).
    fn run_capture(
        &self,
        mut cmd: Command,
        what: &str,
        timeout: Duration,
    ) -> Result<String, BrigadeError> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| BrigadeError::AgentSpawnFailed(what.into(), e.to_string()))?;
        // 先起读取线程防止管道写满死锁 — drain threads first so a chatty child
        // can never deadlock on a full pipe
        let stdout_handle = child.stdout.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });
        let stderr_handle = spawn_discard(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    terminate_child(&mut child);
                    finish_discard(stderr_handle);
                    return Err(BrigadeError::OperationFailed(format!(
                        "等待 rclone 进程失败: {}",
                        e
                    )));
                }
            }
            if self.shutdown.is_requested() {
                terminate_child(&mut child);
                finish_discard(stderr_handle);
                return Err(BrigadeError::ShutdownRequested);
            }
            if Instant::now() >= deadline {
                terminate_child(&mut child);
                finish_discard(stderr_handle);
                return Err(BrigadeError::AgentTimeout(what.into()));
            }
            std::thread::sleep(Duration::from_millis(200));
        };
        finish_discard(stderr_handle);
        let raw = stdout_handle
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        if !status.success() {
            return Err(BrigadeError::AgentExit(what.into(), status.code().unwrap_or(-1)));
        }
        String::from_utf8(raw)
            .map_err(|e| BrigadeError::AgentListDecode(what.into(), e.to_string()))
    }
}

type Drains = (Option<std::thread::JoinHandle<()>>, Option<std::thread::JoinHandle<()>>);

/// Spawn discard-readers for both pipes so the child can never block on a
/// full pipe and both descriptors are closed on every exit path.
fn drain_pipes(child: &mut Child) -> Drains {
    (spawn_discard(child.stdout.take()), spawn_discard(child.stderr.take()))
}

fn spawn_discard<R: Read + Send + 'static>(pipe: Option<R>) -> Option<std::thread::JoinHandle<()>> {
    pipe.map(|mut p| {
        std::thread::spawn(move || {
            let mut sink = [0u8; 8192];
            while matches!(p.read(&mut sink), Ok(n) if n > 0) {}
        })
    })
}

fn join_drains(drains: Drains) {
    finish_discard(drains.0);
    finish_discard(drains.1);
}

fn finish_discard(handle: Option<std::thread::JoinHandle<()>>) {
    if let Some(h) = handle {
        let _ = h.join();
    }
}

/// Terminate with a grace period, then kill, then reap. On Unix the child
/// first gets SIGTERM so rclone can abort transfers cleanly.
fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        let deadline = Instant::now() + KILL_GRACE;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsjson_entry_decodes_with_missing_optionals() {
        let raw = r#"[{"Path":"a/b.txt","Size":42},{"Path":"sub","IsDir":true,"Size":-1}]"#;
        let entries: Vec<RemoteEntry> = serde_json::from_str(raw).expect("decode");
        assert_eq!(entries[0].path, "a/b.txt");
        assert_eq!(entries[0].size, 42);
        assert!(!entries[0].is_dir);
        assert!(entries[1].is_dir);
    }

    #[test]
    fn download_outcome_clean_exit() {
        let ok = DownloadOutcome { exit_code: Some(0), killed: None };
        let bad = DownloadOutcome { exit_code: Some(3), killed: None };
        let cut = DownloadOutcome { exit_code: None, killed: Some(KillReason::SizeCap) };
        assert!(ok.exited_cleanly());
        assert!(!bad.exited_cleanly());
        assert!(!cut.exited_cleanly());
    }
}
