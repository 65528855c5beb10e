use std::path::PathBuf;

use crate::BrigadeError;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Runtime configuration, sourced from environment variables. Built once in
/// `main` and threaded through `App`.
#[derive(Debug, Clone)]
pub struct Config {
    // 暂存桶 — staging store
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    /// Key prefix, always ends with `/` (normalized on load).
    pub prefix: String,
    // transfer agent remotes
    pub source: String,
    pub destination: String,
    pub rclone_path: PathBuf,
    pub rclone_config: Option<PathBuf>,
    // thresholds and caps
    pub large_file_threshold: u64,
    pub max_zip_size: u64,
    pub split_threshold: usize,
    pub max_parallel_workers: usize,
    pub download_threads: usize,
    pub disk_limit_percent: f64,
    pub disk_backpressure_percent: f64,
    pub max_completed_keys: usize,
    pub zip_bomb_ratio: f64,
    // retry policy
    pub s3_max_retries: usize,
    pub max_retry_duration_secs: u64,
    pub instance_lock_timeout_secs: u64,
    // local scratch
    pub work_dir: PathBuf,
    /// Unzipper merges into a local DESTINATION directory instead of
    /// uploading via the transfer agent.
    pub skip_upload: bool,
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, BrigadeError> {
    match env_str(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| BrigadeError::InvalidConfig(name.to_string(), raw)),
    }
}

fn env_bool(name: &str) -> bool {
    matches!(env_str(name).as_deref(), Some("1") | Some("true") | Some("yes"))
}

/// Default scratch root when WORK_DIR is unset: a dot-dir under home, like
/// the rest of this tool family keeps its state, falling back to a relative
/// directory when no home is resolvable.
fn default_work_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".bucketbrigade").join("work"),
        None => PathBuf::from("bb_work"),
    }
}

impl Config {
    /// Load and validate configuration. Missing credentials or an unusable
    /// rclone binary are fatal startup errors (non-zero exit in `main`).
    pub fn from_env() -> anyhow::Result<Self> {
        let access_key = env_str("AWS_ACCESS_KEY_ID")
            .ok_or_else(|| BrigadeError::MissingCredentials("AWS_ACCESS_KEY_ID".into()))?;
        let secret_key = env_str("AWS_SECRET_ACCESS_KEY")
            .ok_or_else(|| BrigadeError::MissingCredentials("AWS_SECRET_ACCESS_KEY".into()))?;
        let bucket = env_str("S3_BUCKET")
            .ok_or_else(|| BrigadeError::MissingCredentials("S3_BUCKET".into()))?;

        // 前缀统一以 '/' 结尾，键拼接时不再判断 — Prefix always ends with '/'
        let mut prefix = env_str("S3_PREFIX").unwrap_or_else(|| "migration/".to_string());
        if !prefix.ends_with('/') {
            prefix.push('/');
        }

        let rclone_path = match env_str("RCLONE_PATH") {
            Some(p) => {
                let p = PathBuf::from(p);
                if !p.is_file() {
                    return Err(BrigadeError::AgentBinaryMissing(p.display().to_string()).into());
                }
                p
            }
            None => which::which("rclone")
                .map_err(|_| BrigadeError::AgentBinaryMissing("rclone".into()))?,
        };

        let threshold_gb: f64 = env_parse("LARGE_FILE_THRESHOLD_GB", 5.0)?;
        if !(threshold_gb > 0.0) {
            return Err(BrigadeError::InvalidConfig(
                "LARGE_FILE_THRESHOLD_GB".into(),
                threshold_gb.to_string(),
            )
            .into());
        }
        let max_zip_gb: f64 = env_parse("MAX_ZIP_SIZE_GB", 20.0)?;

        let cfg = Config {
            access_key,
            secret_key,
            endpoint: env_str("S3_ENDPOINT"),
            region: env_str("S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            bucket,
            prefix,
            source: env_str("SOURCE").unwrap_or_else(|| "src:".to_string()),
            destination: env_str("DESTINATION").unwrap_or_else(|| "dst:".to_string()),
            rclone_path,
            rclone_config: env_str("RCLONE_CONFIG").map(PathBuf::from),
            large_file_threshold: (threshold_gb * GIB as f64) as u64,
            max_zip_size: (max_zip_gb * GIB as f64) as u64,
            split_threshold: env_parse("SPLIT_THRESHOLD", 1000usize)?.max(1),
            max_parallel_workers: env_parse("MAX_PARALLEL_WORKERS", 2usize)?.clamp(1, 16),
            download_threads: env_parse("DOWNLOAD_THREADS", 8usize)?.clamp(1, 64),
            disk_limit_percent: env_parse("DISK_LIMIT_PERCENT", 80.0f64)?,
            disk_backpressure_percent: env_parse("DISK_BACKPRESSURE_PERCENT", 70.0f64)?,
            max_completed_keys: env_parse("MAX_COMPLETED_KEYS", 5000usize)?.max(1),
            zip_bomb_ratio: env_parse("ZIP_BOMB_RATIO", 100.0f64)?,
            s3_max_retries: env_parse("S3_MAX_RETRIES", 3usize)?.max(1),
            max_retry_duration_secs: env_parse("MAX_RETRY_DURATION", 300u64)?,
            instance_lock_timeout_secs: env_parse("INSTANCE_LOCK_TIMEOUT", 2u64)?,
            work_dir: env_str("WORK_DIR").map(PathBuf::from).unwrap_or_else(default_work_dir),
            skip_upload: env_bool("SKIP_UPLOAD"),
        };
        Ok(cfg)
    }

    /// Key of the folder index object.
    pub fn index_key(&self) -> String {
        format!("{}_index/folder_list.txt", self.prefix)
    }

    pub fn list_key(&self, sanitized: &str) -> String {
        format!("{}{}_List.txt", self.prefix, sanitized)
    }

    pub fn large_manifest_key(&self, sanitized: &str) -> String {
        format!("{}{}_LargeFiles.json", self.prefix, sanitized)
    }

    pub fn archive_key(&self, sanitized: &str, part_label: &str) -> String {
        format!("{}{}_{}.zip", self.prefix, sanitized, part_label)
    }

    pub fn zip_progress_key(&self, sanitized: &str) -> String {
        format!("{}_progress/{}_progress.json", self.prefix, sanitized)
    }

    pub fn unzip_progress_key(&self, sanitized: &str) -> String {
        format!("{}_progress/{}_unzip_progress.json", self.prefix, sanitized)
    }

    pub fn mapper_progress_key(&self, sanitized: &str) -> String {
        format!("{}_progress/{}_mapper_progress.json", self.prefix, sanitized)
    }

    pub fn fixup_log_key(&self) -> String {
        format!("{}_progress/fixup_progress.log", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            access_key: "ak".into(),
            secret_key: "sk".into(),
            endpoint: None,
            region: "us-east-1".into(),
            bucket: "bucket".into(),
            prefix: "migration/".into(),
            source: "src:".into(),
            destination: "dst:".into(),
            rclone_path: PathBuf::from("rclone"),
            rclone_config: None,
            large_file_threshold: 5 * GIB,
            max_zip_size: 20 * GIB,
            split_threshold: 1000,
            max_parallel_workers: 2,
            download_threads: 8,
            disk_limit_percent: 80.0,
            disk_backpressure_percent: 70.0,
            max_completed_keys: 5000,
            zip_bomb_ratio: 100.0,
            s3_max_retries: 3,
            max_retry_duration_secs: 300,
            instance_lock_timeout_secs: 2,
            work_dir: PathBuf::from("bb_work"),
            skip_upload: false,
        }
    }

    #[test]
    fn key_layout_matches_store_contract() {
        let c = base();
        assert_eq!(c.index_key(), "migration/_index/folder_list.txt");
        assert_eq!(c.list_key("Photos_2021"), "migration/Photos_2021_List.txt");
        assert_eq!(
            c.large_manifest_key("Photos_2021"),
            "migration/Photos_2021_LargeFiles.json"
        );
        assert_eq!(c.archive_key("A", "Part3"), "migration/A_Part3.zip");
        assert_eq!(c.archive_key("A", "Full_Split1"), "migration/A_Full_Split1.zip");
        assert_eq!(c.zip_progress_key("A"), "migration/_progress/A_progress.json");
        assert_eq!(c.unzip_progress_key("A"), "migration/_progress/A_unzip_progress.json");
    }
}
