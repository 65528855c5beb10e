use crate::config::Config;
use crate::rclone::TransferAgent;
use crate::shutdown::Shutdown;
use crate::store::{RetryPolicy, StagingStore};

/// The single context value built in `main` and threaded through whichever
/// component this process runs: configuration, staging store, transfer agent
/// and the cooperative shutdown flag.
pub struct App {
    pub config: Config,
    pub store: StagingStore,
    pub agent: TransferAgent,
    pub shutdown: Shutdown,
}

impl App {
    pub fn init(config: Config) -> anyhow::Result<Self> {
        let shutdown = Shutdown::new();
        shutdown.install();
        // 可用性探测放在各组件拿到实例锁之后，避免第二实例触碰暂存桶
        // — the usability probe runs after the instance lock is held, so a
        // losing second instance never touches the staging store
        let store = StagingStore::connect(&config, shutdown.clone())?;
        let agent = TransferAgent::new(
            config.rclone_path.clone(),
            config.rclone_config.clone(),
            RetryPolicy::from_config(&config),
            shutdown.clone(),
        );
        Ok(Self { config, store, agent, shutdown })
    }
}

/// Join a remote spec (`remote:` or `remote:base/path`) with a relative
/// segment. rclone treats `remote:seg` and `remote:base/seg` as the joined
/// forms; no empty segments are produced.
pub fn join_remote(base: &str, seg: &str) -> String {
    if base.is_empty() {
        return seg.to_string();
    }
    if base.ends_with(':') || base.ends_with('/') {
        format!("{}{}", base, seg)
    } else {
        format!("{}/{}", base, seg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_remote_forms() {
        assert_eq!(join_remote("src:", "A"), "src:A");
        assert_eq!(join_remote("src:root", "A"), "src:root/A");
        assert_eq!(join_remote("src:root/", "A"), "src:root/A");
        assert_eq!(join_remote("/local/dir", "A"), "/local/dir/A");
        assert_eq!(join_remote("src:root", "A/b.txt"), "src:root/A/b.txt");
    }
}
