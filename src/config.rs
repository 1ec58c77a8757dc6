//! CLI arguments and gateway configuration defaults.

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

pub const AUTH_REALM: &str = r#"Basic realm="repogate""#;
pub const DEFAULT_AUTH_MAX_FAILURES: u32 = 5;
pub const DEFAULT_AUTH_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_AUTH_BLOCK_SECS: u64 = 10 * 60;
pub const DEFAULT_AUTH_MAX_TRACKED: usize = 10_000;
pub const DEFAULT_UPLOAD_DIR: &str = ".uploads";
pub const DEFAULT_SCREENSHOT_DIR: &str = ".screenshots";
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 25 * 1024 * 1024;
pub const DEFAULT_TREE_MAX_ENTRIES: usize = 5000;
pub const DEFAULT_IGNORE_TIMEOUT_MS: u64 = 3000;
pub const FAILURE_PRUNE_INTERVAL_SECS: u64 = 60;
pub const MAX_FILENAME_LEN: usize = 255;

/// CLI arguments and environment configuration for the gateway.
#[derive(Parser, Debug, Clone)]
#[command(name = "repogate", version = VERSION_INFO, about = "Repository file gateway")]
pub struct Args {
    #[arg(
        short = 'r',
        long,
        env = "REPOGATE_ROOT",
        default_value = ".",
        help = "Repository root exposed by the gateway"
    )]
    pub root: String,
    #[arg(
        short = 'b',
        long = "bind",
        env = "REPOGATE_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "REPOGATE_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        short = 'P',
        long,
        env = "REPOGATE_HTTPS_PORT",
        help = "HTTPS port (HTTPS disabled when unset)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "REPOGATE_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "REPOGATE_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "REPOGATE_PASSWORD",
        hide_env_values = true,
        help = "Shared secret for Basic auth (open access when unset)"
    )]
    pub password: Option<String>,
    #[arg(
        long,
        env = "REPOGATE_AUTH_MAX_FAILURES",
        default_value_t = DEFAULT_AUTH_MAX_FAILURES,
        help = "Failed attempts per IP before blocking (0 to disable)"
    )]
    pub auth_max_failures: u32,
    #[arg(
        long,
        env = "REPOGATE_AUTH_WINDOW_SECS",
        default_value_t = DEFAULT_AUTH_WINDOW_SECS,
        help = "Failure counting window in seconds"
    )]
    pub auth_window_secs: u64,
    #[arg(
        long,
        env = "REPOGATE_AUTH_BLOCK_SECS",
        default_value_t = DEFAULT_AUTH_BLOCK_SECS,
        help = "Block duration in seconds once the threshold is reached"
    )]
    pub auth_block_secs: u64,
    #[arg(
        long,
        env = "REPOGATE_AUTH_MAX_TRACKED",
        default_value_t = DEFAULT_AUTH_MAX_TRACKED,
        help = "Max client IPs tracked by the failure store"
    )]
    pub auth_max_tracked: usize,
    #[arg(
        long,
        env = "REPOGATE_TRUST_FORWARDED_FOR",
        help = "Use the first X-Forwarded-For entry as client IP"
    )]
    pub trust_forwarded_for: bool,
    #[arg(
        long,
        env = "REPOGATE_UPLOAD_DIR",
        default_value = DEFAULT_UPLOAD_DIR,
        help = "Upload directory relative to the root"
    )]
    pub upload_dir: String,
    #[arg(
        long,
        env = "REPOGATE_SCREENSHOT_DIR",
        default_value = DEFAULT_SCREENSHOT_DIR,
        help = "Screenshot directory relative to the root"
    )]
    pub screenshot_dir: String,
    #[arg(
        long,
        env = "REPOGATE_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload size in bytes"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "REPOGATE_TREE_MAX_ENTRIES",
        default_value_t = DEFAULT_TREE_MAX_ENTRIES,
        help = "Max files returned by the tree endpoint"
    )]
    pub tree_max_entries: usize,
    #[arg(
        long,
        env = "REPOGATE_GIT_BIN",
        default_value = "git",
        help = "Git executable used as ignore oracle"
    )]
    pub git_bin: String,
    #[arg(
        long,
        env = "REPOGATE_IGNORE_TIMEOUT_MS",
        default_value_t = DEFAULT_IGNORE_TIMEOUT_MS,
        help = "Timeout for one ignore oracle invocation in milliseconds"
    )]
    pub ignore_timeout_ms: u64,
    #[arg(
        long,
        env = "REPOGATE_IGNORE_FAIL_CLOSED",
        help = "Hide the whole batch when the ignore oracle fails"
    )]
    pub ignore_fail_closed: bool,
    #[arg(long, env = "REPOGATE_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
}
