use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use aws_sdk_s3::Client;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};

use crate::BrigadeError;
use crate::config::Config;
use crate::shutdown::Shutdown;

/// Uploads above this size go through multipart; S3 caps a single PUT at
/// 5 GiB and archives run to 20 GiB.
pub const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
pub const MULTIPART_PART_SIZE: usize = 64 * 1024 * 1024;

/// Retry envelope for staging-store operations: bounded both by attempt
/// count and by total elapsed time.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub max_total: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.s3_max_retries,
            max_total: Duration::from_secs(config.max_retry_duration_secs),
        }
    }
}

/// Backoff for the `attempt`-th transient failure: `2^attempt` seconds.
fn transient_backoff(attempt: usize) -> Duration {
    Duration::from_secs(1u64 << attempt.min(16))
}

/// Backoff for the `k`-th consecutive rate-limit indication: `min(4·2^k, 60)`
/// seconds. Rate limits never consume a retry attempt.
fn rate_limit_backoff(rate_hits: u32) -> Duration {
    Duration::from_secs((4u64 << rate_hits.min(8)).min(60))
}

/// Run `op` under the retry policy. Only transient errors back off and count
/// against the attempt budget; rate limits take the longer capped backoff
/// lane without counting; everything else (permanent, integrity, local IO,
/// decode) propagates immediately. Every sleep is interruptible by shutdown.
pub fn retry_with_policy<T>(
    policy: RetryPolicy,
    shutdown: &Shutdown,
    op_name: &str,
    mut op: impl FnMut() -> Result<T, BrigadeError>,
) -> Result<T, BrigadeError> {
    let start = Instant::now();
    let mut attempt = 0usize;
    let mut rate_hits = 0u32;
    loop {
        if shutdown.is_requested() {
            return Err(BrigadeError::ShutdownRequested);
        }
        let err = match op() {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        let backoff = if err.is_rate_limit() {
            let d = rate_limit_backoff(rate_hits);
            rate_hits += 1;
            d
        } else if err.is_transient() {
            attempt += 1;
            if attempt >= policy.max_attempts {
                return Err(BrigadeError::RetryBudgetExhausted(
                    op_name.to_string(),
                    err.to_string(),
                ));
            }
            transient_backoff(attempt)
        } else {
            return Err(err);
        };
        if start.elapsed() + backoff > policy.max_total {
            return Err(BrigadeError::RetryBudgetExhausted(op_name.to_string(), err.to_string()));
        }
        tracing::debug!("{} 失败，{}s 后重试: {}", op_name, backoff.as_secs(), err);
        if !shutdown.sleep(backoff) {
            return Err(BrigadeError::ShutdownRequested);
        }
    }
}

/// Blocking facade over the async S3 SDK. The tokio runtime is an
/// implementation detail of this module: every public method blocks, which is
/// what the worker-thread model elsewhere in the crate expects.
pub struct StagingStore {
    rt: tokio::runtime::Runtime,
    client: Client,
    bucket: String,
    policy: RetryPolicy,
    shutdown: Shutdown,
}

impl StagingStore {
    pub fn connect(config: &Config, shutdown: Shutdown) -> anyhow::Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let creds = aws_sdk_s3::config::Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "environment",
        );
        let shared = rt.block_on(
            aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(aws_config::Region::new(config.region.clone()))
                .load(),
        );
        let mut builder = aws_sdk_s3::config::Builder::from(&shared)
            .credentials_provider(creds)
            // 兼容 MinIO/Wasabi 等路径式端点 — path-style for S3-compatible endpoints
            .force_path_style(true);
        if let Some(ref url) = config.endpoint {
            builder = builder.endpoint_url(url.clone());
        }
        let client = Client::from_conf(builder.build());
        Ok(Self {
            rt,
            client,
            bucket: config.bucket.clone(),
            policy: RetryPolicy::from_config(config),
            shutdown,
        })
    }

    /// Fatal-at-startup probe: an unusable staging store must stop the run
    /// before any work begins.
    pub fn check_usable(&self, prefix: &str) -> Result<(), BrigadeError> {
        self.with_retry("list_objects", || self.list_once(prefix, Some(1)).map(|_| ()))
    }

    fn with_retry<T>(
        &self,
        op_name: &str,
        op: impl FnMut() -> Result<T, BrigadeError>,
    ) -> Result<T, BrigadeError> {
        retry_with_policy(self.policy, &self.shutdown, op_name, op)
    }

    // ---- small objects ---------------------------------------------------

    pub fn put_bytes(&self, key: &str, body: Vec<u8>) -> Result<(), BrigadeError> {
        self.with_retry("put_object", || {
            self.rt.block_on(async {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(ByteStream::from(body.clone()))
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify("put_object", e))
            })
        })
    }

    pub fn get_bytes(&self, key: &str) -> Result<Vec<u8>, BrigadeError> {
        self.with_retry("get_object", || {
            self.rt.block_on(async {
                let resp = self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| classify("get_object", e))?;
                let data = resp
                    .body
                    .collect()
                    .await
                    .map_err(|e| BrigadeError::StoreTransport("get_object".into(), e.to_string()))?;
                Ok(data.into_bytes().to_vec())
            })
        })
    }

    /// Like `get_bytes` but a missing key is `Ok(None)` instead of an error.
    pub fn get_bytes_opt(&self, key: &str) -> Result<Option<Vec<u8>>, BrigadeError> {
        match self.get_bytes(key) {
            Ok(v) => Ok(Some(v)),
            Err(BrigadeError::ObjectMissing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self, key: &str) -> Result<bool, BrigadeError> {
        self.head_size(key).map(|s| s.is_some())
    }

    /// Head-object; `Ok(None)` when the key does not exist.
    pub fn head_size(&self, key: &str) -> Result<Option<u64>, BrigadeError> {
        self.with_retry("head_object", || {
            self.rt.block_on(async {
                match self.client.head_object().bucket(&self.bucket).key(key).send().await {
                    Ok(out) => Ok(out.content_length().map(|l| l.max(0) as u64)),
                    Err(e) => {
                        if let SdkError::ServiceError(ref se) = e
                            && se.err().is_not_found()
                        {
                            return Ok(None);
                        }
                        Err(classify("head_object", e))
                    }
                }
            })
        })
    }

    pub fn delete(&self, key: &str) -> Result<(), BrigadeError> {
        self.with_retry("delete_object", || {
            self.rt.block_on(async {
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify("delete_object", e))
            })
        })
    }

    /// All keys under `prefix`, with sizes.
    pub fn list_keys(&self, prefix: &str) -> Result<Vec<(String, u64)>, BrigadeError> {
        self.with_retry("list_objects", || self.list_once(prefix, None))
    }

    fn list_once(&self, prefix: &str, max: Option<i32>) -> Result<Vec<(String, u64)>, BrigadeError> {
        self.rt.block_on(async {
            let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(m) = max {
                req = req.max_keys(m);
            }
            let mut pages = req.into_paginator().send();
            let mut out = Vec::new();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| classify("list_objects", e))?;
                for obj in page.contents() {
                    if let Some(key) = obj.key() {
                        out.push((key.to_string(), obj.size().unwrap_or(0).max(0) as u64));
                    }
                }
                if max.is_some() {
                    break;
                }
            }
            Ok(out)
        })
    }

    // ---- large objects ---------------------------------------------------

    /// Upload a local file. Multipart above `MULTIPART_THRESHOLD`; each part
    /// runs under the retry policy and a failed multipart is aborted so no
    /// orphaned upload lingers in the bucket.
    pub fn put_file(&self, key: &str, path: &Path) -> Result<(), BrigadeError> {
        let size = std::fs::metadata(path)
            .map_err(|e| {
                BrigadeError::OperationFailed(format!("无法读取文件元数据 {}: {}", path.display(), e))
            })?
            .len();
        if size <= MULTIPART_THRESHOLD {
            return self.with_retry("put_object", || {
                self.rt.block_on(async {
                    let body = ByteStream::from_path(path).await.map_err(|e| {
                        BrigadeError::OperationFailed(format!(
                            "无法读取上传文件 {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                    self.client
                        .put_object()
                        .bucket(&self.bucket)
                        .key(key)
                        .body(body)
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(|e| classify("put_object", e))
                })
            });
        }
        self.put_file_multipart(key, path)
    }

    fn put_file_multipart(&self, key: &str, path: &Path) -> Result<(), BrigadeError> {
        let upload_id = self.with_retry("create_multipart_upload", || {
            self.rt.block_on(async {
                let out = self
                    .client
                    .create_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| classify("create_multipart_upload", e))?;
                out.upload_id().map(|s| s.to_string()).ok_or_else(|| {
                    BrigadeError::StoreTransport(
                        "create_multipart_upload".into(),
                        "响应缺少 upload_id".into(),
                    )
                })
            })
        })?;

        match self.upload_parts(key, &upload_id, path) {
            Ok(()) => Ok(()),
            Err(e) => {
                // abort 失败只记日志，原错误优先 — original error wins
                let abort = self.rt.block_on(async {
                    self.client
                        .abort_multipart_upload()
                        .bucket(&self.bucket)
                        .key(key)
                        .upload_id(&upload_id)
                        .send()
                        .await
                });
                if let Err(ae) = abort {
                    tracing::warn!("abort multipart 失败 {}: {}", key, ae);
                }
                Err(e)
            }
        }
    }

    fn upload_parts(&self, key: &str, upload_id: &str, path: &Path) -> Result<(), BrigadeError> {
        let mut file = std::fs::File::open(path).map_err(|e| {
            BrigadeError::OperationFailed(format!("无法打开上传文件 {}: {}", path.display(), e))
        })?;
        let mut parts: Vec<CompletedPart> = Vec::new();
        let mut part_number = 1i32;
        loop {
            if self.shutdown.is_requested() {
                return Err(BrigadeError::ShutdownRequested);
            }
            let mut buf = vec![0u8; MULTIPART_PART_SIZE];
            let mut filled = 0usize;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).map_err(|e| {
                    BrigadeError::OperationFailed(format!("读取分片失败: {}", e))
                })?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            buf.truncate(filled);
            let etag = self.with_retry("upload_part", || {
                self.rt.block_on(async {
                    let out = self
                        .client
                        .upload_part()
                        .bucket(&self.bucket)
                        .key(key)
                        .upload_id(upload_id)
                        .part_number(part_number)
                        .body(ByteStream::from(buf.clone()))
                        .send()
                        .await
                        .map_err(|e| classify("upload_part", e))?;
                    out.e_tag().map(|s| s.to_string()).ok_or_else(|| {
                        BrigadeError::StoreTransport("upload_part".into(), "响应缺少 ETag".into())
                    })
                })
            })?;
            parts.push(
                CompletedPart::builder().e_tag(etag).part_number(part_number).build(),
            );
            part_number += 1;
            if filled < MULTIPART_PART_SIZE {
                break;
            }
        }
        let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
        self.with_retry("complete_multipart_upload", || {
            self.rt.block_on(async {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(completed.clone())
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify("complete_multipart_upload", e))
            })
        })
    }

    /// Stream an object to a local file; never buffers the whole object.
    pub fn download_to_file(&self, key: &str, dest: &Path) -> Result<u64, BrigadeError> {
        self.with_retry("get_object", || {
            self.rt.block_on(async {
                let resp = self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| classify("get_object", e))?;
                let mut file = std::fs::File::create(dest).map_err(|e| {
                    BrigadeError::OperationFailed(format!(
                        "无法创建下载文件 {}: {}",
                        dest.display(),
                        e
                    ))
                })?;
                let mut body = resp.body;
                let mut written = 0u64;
                while let Some(chunk) = body.try_next().await.map_err(|e| {
                    BrigadeError::StoreTransport("get_object".into(), e.to_string())
                })? {
                    file.write_all(&chunk).map_err(|e| {
                        BrigadeError::OperationFailed(format!("写入下载文件失败: {}", e))
                    })?;
                    written += chunk.len() as u64;
                }
                file.flush().map_err(|e| {
                    BrigadeError::OperationFailed(format!("写入下载文件失败: {}", e))
                })?;
                Ok(written)
            })
        })
    }
}

const RATE_LIMIT_CODES: [&str; 6] = [
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequests",
    "ServiceUnavailable",
];

const PERMANENT_CODES: [&str; 7] = [
    "NoSuchKey",
    "NoSuchBucket",
    "NotFound",
    "AccessDenied",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
];

/// Map an SDK error onto the crate taxonomy. Rate-limit indications get their
/// own lane; well-known 4xx codes are permanent; connection-level failures
/// (dispatch, timeout, malformed response) are transient.
fn classify<E, R>(op: &'static str, err: SdkError<E, R>) -> BrigadeError
where
    E: ProvideErrorMetadata,
{
    let code = err.code().map(|c| c.to_string());
    let message = err
        .message()
        .map(|m| m.to_string())
        .or_else(|| code.clone())
        .unwrap_or_else(|| transport_detail(&err));
    if let Some(ref c) = code {
        if RATE_LIMIT_CODES.contains(&c.as_str()) {
            return BrigadeError::StoreRateLimited(op.to_string(), message);
        }
        if PERMANENT_CODES.contains(&c.as_str()) {
            if c == "NoSuchKey" || c == "NotFound" {
                return BrigadeError::ObjectMissing(message);
            }
            return BrigadeError::StorePermanent(op.to_string(), message);
        }
    }
    BrigadeError::StoreTransport(op.to_string(), message)
}

fn transport_detail<E, R>(err: &SdkError<E, R>) -> String {
    match err {
        SdkError::TimeoutError(_) => "请求超时".to_string(),
        SdkError::DispatchFailure(_) => "连接失败".to_string(),
        SdkError::ResponseError(_) => "响应异常".to_string(),
        SdkError::ConstructionFailure(_) => "请求构造失败".to_string(),
        SdkError::ServiceError(_) => "服务端错误".to_string(),
        _ => "未知 SDK 错误".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy { max_attempts, max_total: Duration::from_secs(300) }
    }

    #[test]
    fn success_passes_straight_through() {
        let shutdown = Shutdown::new();
        let calls = Cell::new(0usize);
        let r = retry_with_policy(fast_policy(3), &shutdown, "op", || {
            calls.set(calls.get() + 1);
            Ok::<_, BrigadeError>(7)
        });
        assert_eq!(r.expect("ok"), 7);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn permanent_error_bypasses_retry() {
        let shutdown = Shutdown::new();
        let calls = Cell::new(0usize);
        let r: Result<(), _> = retry_with_policy(fast_policy(3), &shutdown, "get", || {
            calls.set(calls.get() + 1);
            Err(BrigadeError::StorePermanent("get".into(), "AccessDenied".into()))
        });
        assert!(matches!(r, Err(BrigadeError::StorePermanent(_, _))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn transient_exhausts_attempt_budget() {
        let shutdown = Shutdown::new();
        let calls = Cell::new(0usize);
        // max_attempts=1 耗尽时不再休眠，测试保持即时 — exhausts before any sleep
        let r: Result<(), _> = retry_with_policy(fast_policy(1), &shutdown, "put", || {
            calls.set(calls.get() + 1);
            Err(BrigadeError::StoreTransport("put".into(), "reset".into()))
        });
        assert!(matches!(r, Err(BrigadeError::RetryBudgetExhausted(_, _))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn non_transient_errors_are_not_retried() {
        let shutdown = Shutdown::new();
        let calls = Cell::new(0usize);
        let r: Result<(), _> = retry_with_policy(fast_policy(3), &shutdown, "zip", || {
            calls.set(calls.get() + 1);
            Err(BrigadeError::OperationFailed("本地 IO 失败".into()))
        });
        assert!(matches!(r, Err(BrigadeError::OperationFailed(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn shutdown_interrupts_before_first_attempt() {
        let shutdown = Shutdown::new();
        shutdown.request();
        let r: Result<(), _> =
            retry_with_policy(fast_policy(3), &shutdown, "put", || unreachable!());
        assert!(matches!(r, Err(BrigadeError::ShutdownRequested)));
    }

    #[test]
    fn backoff_schedules_match_contract() {
        assert_eq!(transient_backoff(1), Duration::from_secs(2));
        assert_eq!(transient_backoff(2), Duration::from_secs(4));
        assert_eq!(transient_backoff(3), Duration::from_secs(8));
        // 连续限流：4、8、16……封顶 60 秒 — 4, 8, 16 … capped at 60
        assert_eq!(rate_limit_backoff(0), Duration::from_secs(4));
        assert_eq!(rate_limit_backoff(1), Duration::from_secs(8));
        assert_eq!(rate_limit_backoff(2), Duration::from_secs(16));
        assert_eq!(rate_limit_backoff(5), Duration::from_secs(60));
    }

    #[test]
    fn classify_maps_codes_onto_taxonomy() {
        // 通过 code 常量表间接验证映射关系 — the lookup tables drive classify
        assert!(RATE_LIMIT_CODES.contains(&"SlowDown"));
        assert!(RATE_LIMIT_CODES.contains(&"RequestLimitExceeded"));
        assert!(PERMANENT_CODES.contains(&"NoSuchKey"));
        assert!(PERMANENT_CODES.contains(&"AccessDenied"));
    }
}
