use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Shared shutdown flag, set by SIGINT/SIGTERM. Long-running loops check it
/// between steps; child processes are terminated cooperatively when it trips.
#[derive(Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the signal handler. Safe to call once per process; a second
    /// invocation keeps the first handler (ctrlc only allows one).
    pub fn install(&self) {
        let flag = self.flag.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            // handler 内只做最小动作 — keep the handler minimal
            flag.store(true, Ordering::SeqCst);
        }) {
            tracing::warn!("无法安装信号处理器: {}", e);
        }
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// For tests and for fatal-error paths that want the same cooperative
    /// teardown as a signal.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Sleep in small slices so a shutdown request interrupts the wait.
    /// Returns false when the sleep was cut short by shutdown.
    pub fn sleep(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if self.is_requested() {
                return false;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(left.min(Duration::from_millis(200)));
        }
        !self.is_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_interrupts_sleep() {
        let s = Shutdown::new();
        s.request();
        let start = Instant::now();
        assert!(!s.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn sleep_completes_without_request() {
        let s = Shutdown::new();
        assert!(s.sleep(Duration::from_millis(50)));
    }
}
