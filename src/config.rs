//! CLI 参数与服务默认配置。

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_STORAGE_DIR: &str = ".sendvault/files";
pub const SPOOL_DIR_NAME: &str = "spool";
pub const DEFAULT_IDENTITY_HEADER: &str = "x-remote-user";
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 100 * 1024 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_CONCURRENT: u64 = 64;
pub const DEFAULT_UPLOAD_IDLE_TIMEOUT_SECS: u64 = 60 * 60;
pub const DEFAULT_UPLOAD_SWEEP_INTERVAL_SECS: u64 = 10 * 60;
pub const DEFAULT_MAX_DOWNLOADS: u32 = 5;
pub const DEFAULT_EXPIRY_DAYS: u32 = 7;
pub const DEFAULT_LARGE_UPLOAD_THRESHOLD: u64 = 1024 * 1024 * 1024;

/// 服务的命令行参数与环境变量配置。
#[derive(Parser, Debug)]
#[command(name = "sendvault", version = VERSION_INFO, about = "SendVault transfer server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "SENDVAULT_STORAGE_DIR",
        default_value = DEFAULT_STORAGE_DIR,
        help = "Permanent storage directory for finalized files"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "SENDVAULT_SPOOL_DIR",
        help = "Spool directory for in-flight uploads (defaults next to storage dir)"
    )]
    pub spool_dir: Option<String>,
    #[arg(
        short = 'b',
        long,
        env = "SENDVAULT_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "SENDVAULT_PORT",
        default_value_t = 5080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(long, env = "SENDVAULT_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "SENDVAULT_IDENTITY_HEADER",
        default_value = DEFAULT_IDENTITY_HEADER,
        help = "Header carrying the authenticated principal from the upstream proxy"
    )]
    pub identity_header: String,
    #[arg(
        long,
        env = "SENDVAULT_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload total size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "SENDVAULT_UPLOAD_MAX_CONCURRENT",
        default_value_t = DEFAULT_UPLOAD_MAX_CONCURRENT,
        help = "Max live upload sessions (0 to disable)"
    )]
    pub upload_max_concurrent: u64,
    #[arg(
        long,
        env = "SENDVAULT_UPLOAD_IDLE_TIMEOUT_SECS",
        default_value_t = DEFAULT_UPLOAD_IDLE_TIMEOUT_SECS,
        help = "Evict upload sessions idle for this many seconds"
    )]
    pub upload_idle_timeout_secs: u64,
    #[arg(
        long,
        env = "SENDVAULT_UPLOAD_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_UPLOAD_SWEEP_INTERVAL_SECS,
        help = "Interval between idle upload sweeps in seconds"
    )]
    pub upload_sweep_interval_secs: u64,
    #[arg(
        long,
        env = "SENDVAULT_DEFAULT_MAX_DOWNLOADS",
        default_value_t = DEFAULT_MAX_DOWNLOADS,
        help = "Download limit applied when the client does not send one"
    )]
    pub default_max_downloads: u32,
    #[arg(
        long,
        env = "SENDVAULT_DEFAULT_EXPIRY_DAYS",
        default_value_t = DEFAULT_EXPIRY_DAYS,
        help = "Expiry in days applied when the client does not send a date"
    )]
    pub default_expiry_days: u32,
    #[arg(
        long,
        env = "SENDVAULT_LARGE_UPLOAD_THRESHOLD",
        default_value_t = DEFAULT_LARGE_UPLOAD_THRESHOLD,
        help = "Uploads at or above this size in bytes trigger a notification"
    )]
    pub large_upload_threshold: u64,
}
