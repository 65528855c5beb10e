/// Repository-wide structured errors for migration operations.
///
/// Variants are grouped by how they are handled: transient transport errors
/// are retried under backoff, rate limits get their own longer backoff lane,
/// integrity and resource errors fail the current unit without touching
/// progress, permanent errors propagate immediately.
#[derive(Debug, Clone)]
pub enum BrigadeError {
    // staging store / transport
    StoreTransport(String, String),
    StoreRateLimited(String, String),
    StorePermanent(String, String),
    ObjectMissing(String),
    RetryBudgetExhausted(String, String),
    // transfer agent (rclone 子进程)
    AgentSpawnFailed(String, String),
    AgentExit(String, i32),
    AgentListDecode(String, String),
    AgentTimeout(String),
    // integrity
    ArchiveCorrupt(std::path::PathBuf, String),
    ArchiveBomb(std::path::PathBuf, u64, u64),
    UploadVerifyFailed(String),
    EmptyDownload(String),
    // resources
    DiskWatermarkExceeded(f64, f64),
    InsufficientScratchSpace(u64, u64),
    // lifecycle / startup
    LockContended(std::path::PathBuf),
    MissingCredentials(String),
    InvalidConfig(String, String),
    AgentBinaryMissing(String),
    ShutdownRequested,
    OperationFailed(String),
}

impl std::fmt::Display for BrigadeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use BrigadeError::*;
        match self {
            StoreTransport(op, msg) => write!(f, "暂存桶传输错误 ({}): {}", op, msg),
            StoreRateLimited(op, msg) => write!(f, "暂存桶限流 ({}): {}", op, msg),
            StorePermanent(op, msg) => write!(f, "暂存桶永久性错误 ({}): {}", op, msg),
            ObjectMissing(key) => write!(f, "对象不存在: {}", key),
            RetryBudgetExhausted(op, msg) => {
                write!(f, "重试次数耗尽 ({}): 最后错误: {}", op, msg)
            }
            AgentSpawnFailed(what, msg) => write!(f, "无法启动 rclone ({}): {}", what, msg),
            AgentExit(what, code) => write!(f, "rclone 非零退出 ({}): 退出码 {}", what, code),
            AgentListDecode(what, msg) => write!(f, "rclone 列表解析失败 ({}): {}", what, msg),
            AgentTimeout(what) => write!(f, "rclone 执行超时 ({})", what),
            ArchiveCorrupt(p, msg) => {
                write!(f, "压缩包校验失败: {} — {}", p.display(), msg)
            }
            ArchiveBomb(p, unpacked, packed) => write!(
                f,
                "疑似 zip bomb，拒绝解压: {} (解压 {} 字节 / 包体 {} 字节)",
                p.display(),
                unpacked,
                packed
            ),
            UploadVerifyFailed(key) => write!(f, "上传后校验失败 (head-object): {}", key),
            EmptyDownload(what) => write!(f, "下载结果为空且无触发条件: {}", what),
            DiskWatermarkExceeded(used, limit) => {
                write!(f, "磁盘使用率超过水位线: {:.1}% > {:.1}%", used, limit)
            }
            InsufficientScratchSpace(need, free) => {
                write!(f, "打包前磁盘空间不足: 需要 {} 字节，剩余 {} 字节", need, free)
            }
            LockContended(p) => {
                write!(f, "另一实例已持有锁: {} (同一组件不允许并发运行)", p.display())
            }
            MissingCredentials(var) => write!(f, "缺少凭据环境变量: {}", var),
            InvalidConfig(var, msg) => write!(f, "配置项 {} 无效: {}", var, msg),
            AgentBinaryMissing(name) => {
                write!(f, "找不到 rclone 可执行文件: {} (请安装或设置 RCLONE_PATH)", name)
            }
            ShutdownRequested => write!(f, "收到终止信号，任务已中断"),
            OperationFailed(msg) => write!(f, "操作失败: {}", msg),
        }
    }
}

impl std::error::Error for BrigadeError {}

impl BrigadeError {
    /// Transient transport errors: retried under the exponential-backoff
    /// policy in `store.rs`. Rate limits are excluded here on purpose, they
    /// get a longer capped backoff that does not consume an attempt.
    pub fn is_transient(&self) -> bool {
        use BrigadeError::*;
        matches!(self, StoreTransport(_, _) | AgentExit(_, _) | AgentTimeout(_))
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, BrigadeError::StoreRateLimited(_, _))
    }

    /// Permanent errors bypass retry and propagate immediately.
    pub fn is_permanent(&self) -> bool {
        use BrigadeError::*;
        matches!(
            self,
            StorePermanent(_, _)
                | ObjectMissing(_)
                | MissingCredentials(_)
                | InvalidConfig(_, _)
                | AgentBinaryMissing(_)
                | LockContended(_)
        )
    }

    /// Shutdown is not a failure: progress is saved and the exit code is 0.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, BrigadeError::ShutdownRequested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_disjoint() {
        let samples = [
            BrigadeError::StoreTransport("put".into(), "reset".into()),
            BrigadeError::StoreRateLimited("put".into(), "SlowDown".into()),
            BrigadeError::StorePermanent("get".into(), "AccessDenied".into()),
            BrigadeError::ObjectMissing("k".into()),
            BrigadeError::ShutdownRequested,
            BrigadeError::ArchiveBomb(std::path::PathBuf::from("a.zip"), 1000, 5),
        ];
        for e in &samples {
            let flags = [e.is_transient(), e.is_rate_limit(), e.is_permanent(), e.is_shutdown()];
            assert!(flags.iter().filter(|f| **f).count() <= 1, "overlap for {:?}", e);
        }
    }

    #[test]
    fn agent_exit_is_transient() {
        assert!(BrigadeError::AgentExit("copy".into(), 1).is_transient());
        assert!(!BrigadeError::AgentExit("copy".into(), 1).is_permanent());
    }
}
