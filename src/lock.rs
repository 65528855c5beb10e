use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::BrigadeError;

/// Cooperative single-instance lock: an exclusive advisory lock on a
/// well-known file under the working directory, one per component. The file
/// content carries PID and start timestamp for diagnostics only; the advisory
/// lock itself dies with the process, so stale files never block a new run.
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Try to acquire the lock for `component`, retrying briefly (the lock
    /// timeout, default 2 s) to ride out an exiting predecessor. Contention
    /// after the window is a fatal startup error.
    pub fn acquire(
        work_dir: &std::path::Path,
        component: &str,
        timeout: Duration,
    ) -> Result<Self, BrigadeError> {
        std::fs::create_dir_all(work_dir).map_err(|e| {
            BrigadeError::OperationFailed(format!(
                "无法创建工作目录 {}: {}",
                work_dir.display(),
                e
            ))
        })?;
        let path = work_dir.join(format!("{}.lock", component));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                BrigadeError::OperationFailed(format!("无法打开锁文件 {}: {}", path.display(), e))
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(_) => return Err(BrigadeError::LockContended(path)),
            }
        }

        let mut lock = Self { file, path };
        lock.write_diagnostics();
        Ok(lock)
    }

    fn write_diagnostics(&mut self) {
        // 仅诊断用途，失败不影响持锁 — diagnostics only, failure does not
        // affect lock ownership
        let payload = format!(
            "pid={}\nstarted={}\n",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
        let _ = self.file.set_len(0);
        use std::io::Seek;
        let _ = self.file.seek(std::io::SeekFrom::Start(0));
        let _ = self.file.write_all(payload.as_bytes());
        let _ = self.file.flush();
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_file_records_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock =
            InstanceLock::acquire(dir.path(), "testcomp", Duration::from_millis(100)).expect("lock");
        let content = std::fs::read_to_string(lock.path()).expect("read lock file");
        assert!(content.contains(&format!("pid={}", std::process::id())));
    }

    #[test]
    fn released_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = {
            let lock = InstanceLock::acquire(dir.path(), "droptest", Duration::from_millis(100))
                .expect("first lock");
            lock.path().to_path_buf()
        };
        // 释放后文件被移除，可立即重新获取 — removed on release, reacquirable
        assert!(!path.exists());
        let _again = InstanceLock::acquire(dir.path(), "droptest", Duration::from_millis(100))
            .expect("relock");
    }
}
