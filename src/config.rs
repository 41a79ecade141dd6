//! 命令行参数与服务默认配置。

use clap::{Parser, ValueEnum};
use shadow_rs::formatcp;
use std::path::PathBuf;
use std::time::Duration;

use crate::build;
use crate::engine::UploadConfig;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

/// 分片文件名的十进制位宽。
pub const CHUNK_INDEX_WIDTH: usize = 5;
/// 位宽可表示的最大分片数量（00000..99999）。
pub const MAX_TOTAL_CHUNKS: u64 = 100_000;
pub const UPLOAD_ID_MAX_LEN: usize = 200;
pub const NUMBER_MAX_LEN: usize = 10;
pub const FILENAME_MAX_LEN: usize = 255;
pub const DOWNLOAD_ROUTE_PREFIX: &str = "/uploads";

pub const DEFAULT_UPLOAD_DIR: &str = "uploads";
pub const DEFAULT_CHUNK_DIR: &str = "chunked";
pub const DEFAULT_MAX_CHUNK_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_RETENTION_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 900;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 120;

/// 日志输出格式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// 合并时遇到缺失分片的处理策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum MissingChunkPolicy {
    /// 中止合并并保留分片目录。
    #[default]
    Fail,
    /// 跳过缺失分片，产出截断的文件。
    Skip,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "chunkdock", version = VERSION_INFO, about = "Resumable chunked upload server")]
pub struct Args {
    #[arg(
        short = 'u',
        long,
        env = "CHUNKDOCK_UPLOAD_DIR",
        default_value = DEFAULT_UPLOAD_DIR,
        help = "Directory for assembled files"
    )]
    pub upload_dir: PathBuf,
    #[arg(
        long,
        env = "CHUNKDOCK_CHUNK_DIR",
        default_value = DEFAULT_CHUNK_DIR,
        help = "Directory for in-progress chunk sessions"
    )]
    pub chunk_dir: PathBuf,
    #[arg(
        short = 'b',
        long,
        env = "CHUNKDOCK_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "CHUNKDOCK_HTTP_PORT",
        default_value_t = 5000,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "CHUNKDOCK_HTTPS_PORT",
        default_value_t = 5443,
        help = "HTTPS port (used only with --tls-cert and --tls-key)"
    )]
    pub https_port: u16,
    #[arg(short = 'c', long, env = "CHUNKDOCK_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<PathBuf>,
    #[arg(short = 'k', long, env = "CHUNKDOCK_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<PathBuf>,
    #[arg(
        long,
        env = "CHUNKDOCK_CORS_ORIGINS",
        help = "Comma separated CORS origins"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "CHUNKDOCK_MAX_CHUNK_BYTES",
        default_value_t = DEFAULT_MAX_CHUNK_BYTES,
        help = "Max request body size for a single chunk upload"
    )]
    pub max_chunk_bytes: u64,
    #[arg(
        long,
        env = "CHUNKDOCK_RETENTION_SECS",
        default_value_t = DEFAULT_RETENTION_SECS,
        help = "Age after which an unfinished upload is reaped (0 to disable)"
    )]
    pub retention_secs: u64,
    #[arg(
        long,
        env = "CHUNKDOCK_REAP_INTERVAL_SECS",
        default_value_t = DEFAULT_REAP_INTERVAL_SECS,
        help = "Interval between stale upload sweeps"
    )]
    pub reap_interval_secs: u64,
    #[arg(
        long,
        env = "CHUNKDOCK_LOCK_WAIT_SECS",
        default_value_t = DEFAULT_LOCK_WAIT_TIMEOUT_SECS,
        help = "Max wait for a per-upload lock before answering 409"
    )]
    pub lock_wait_secs: u64,
    #[arg(
        long,
        env = "CHUNKDOCK_MISSING_CHUNKS",
        value_enum,
        default_value_t = MissingChunkPolicy::Fail,
        help = "Missing chunk at assembly: fail (default) aborts and keeps the chunks; \
                skip assembles the chunks present, producing a truncated file"
    )]
    pub missing_chunks: MissingChunkPolicy,
    #[arg(
        long,
        env = "CHUNKDOCK_SCAN_COMMAND",
        help = "External scanner invoked with the assembled file path (exit 0 accept, 1 reject)"
    )]
    pub scan_command: Option<String>,
    #[arg(
        long,
        env = "CHUNKDOCK_SCAN_TIMEOUT_SECS",
        default_value_t = DEFAULT_SCAN_TIMEOUT_SECS,
        help = "Scanner timeout in seconds"
    )]
    pub scan_timeout_secs: u64,
    #[arg(
        long,
        env = "CHUNKDOCK_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text,
        help = "Log output format"
    )]
    pub log_format: LogFormat,
}

impl Args {
    /// 构建传递给上传引擎的显式配置。
    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            upload_dir: self.upload_dir.clone(),
            chunk_dir: self.chunk_dir.clone(),
            retention: Duration::from_secs(self.retention_secs),
            lock_wait: Duration::from_secs(self.lock_wait_secs),
            missing_chunks: self.missing_chunks,
        }
    }

    /// 单个分片请求的请求体上限。
    pub fn body_limit(&self) -> usize {
        usize::try_from(self.max_chunk_bytes).unwrap_or(usize::MAX)
    }
}
