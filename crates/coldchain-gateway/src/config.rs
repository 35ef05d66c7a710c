use crate::alert_state::DEFAULT_MAX_TRACKED_ALERTS;
use clap::Parser;
use coldchain_core::{DEFAULT_MAX_FRAME_BYTES, DEFAULT_WARNING_BAND};
use std::{path::PathBuf, time::Duration};

pub const DEFAULT_ADDR: &str = "127.0.0.1:8787";
pub const DEFAULT_DATABASE: &str = "coldchain.db";

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub addr: String,
    pub database: String,
    pub tokens: Option<PathBuf>,
    pub log_dir: String,
    pub debug: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,
    pub auth_timeout: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub notification_queue: usize,
    pub email_timeout: Duration,
    pub email_concurrency: usize,
    pub warning_band: f64,
    pub alert_recipients: Vec<String>,
    pub max_frame_bytes: usize,
    pub max_tracked_alerts: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            tokens: None,
            log_dir: String::new(),
            debug: false,
            log_level: "info".to_string(),
            auth_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(20),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 256,
            notification_queue: 1024,
            email_timeout: Duration::from_secs(10),
            email_concurrency: 8,
            warning_band: DEFAULT_WARNING_BAND,
            alert_recipients: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_tracked_alerts: DEFAULT_MAX_TRACKED_ALERTS,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "coldchain-gateway")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value = "")]
    pub database: String,
    #[arg(long, default_value = "")]
    pub tokens: String,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value = "")]
    pub log_level: String,
    #[arg(long, default_value_t = 10)]
    pub auth_timeout: u64,
    #[arg(long, default_value_t = 20)]
    pub ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    pub queue_capacity: usize,
    #[arg(long, default_value_t = 1024)]
    pub notification_queue: usize,
    #[arg(long, default_value_t = 10)]
    pub email_timeout: u64,
    /// Emails in flight at once; alerts past this send push only.
    #[arg(long, default_value_t = 8)]
    pub email_concurrency: usize,
    #[arg(long, default_value_t = DEFAULT_WARNING_BAND)]
    pub warning_band: f64,
    /// Email recipient for organizations without notification settings.
    /// Repeatable. Without any, those organizations get push alerts only.
    #[arg(long = "alert-recipient")]
    pub alert_recipients: Vec<String>,
    #[arg(long, default_value_t = DEFAULT_MAX_TRACKED_ALERTS)]
    pub max_tracked_alerts: usize,
}

pub fn load_config() -> GatewayConfig {
    config_from_args(Args::parse())
}

/// Flags win over environment variables, which win over built-in defaults.
pub fn config_from_args(args: Args) -> GatewayConfig {
    let debug = args.debug || env_true("COLDCHAIN_DEBUG");
    let tokens = resolve_flag_or_env(&args.tokens, "COLDCHAIN_TOKENS").map(PathBuf::from);
    GatewayConfig {
        addr: resolve_flag_or_env(&args.addr, "COLDCHAIN_ADDR")
            .unwrap_or_else(|| DEFAULT_ADDR.to_string()),
        database: resolve_flag_or_env(&args.database, "COLDCHAIN_DATABASE")
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
        tokens,
        log_dir: resolve_flag_or_env(&args.log_dir, "COLDCHAIN_LOG_DIR").unwrap_or_default(),
        log_level: resolve_log_level(&args.log_level, debug),
        debug,
        auth_timeout: Duration::from_secs(args.auth_timeout),
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        queue_capacity: args.queue_capacity.max(1),
        notification_queue: args.notification_queue.max(1),
        email_timeout: Duration::from_secs(args.email_timeout),
        email_concurrency: args.email_concurrency.max(1),
        warning_band: args.warning_band,
        alert_recipients: resolve_recipients(args.alert_recipients),
        max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        max_tracked_alerts: args.max_tracked_alerts.max(1),
    }
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_flag_or_env(flag: &str, key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

/// `--debug` beats `--log-level`, which beats `COLDCHAIN_LOG_LEVEL`.
fn resolve_log_level(flag: &str, debug: bool) -> String {
    if debug {
        return "debug".to_string();
    }
    resolve_flag_or_env(flag, "COLDCHAIN_LOG_LEVEL").unwrap_or_else(|| "info".to_string())
}

fn resolve_recipients(flags: Vec<String>) -> Vec<String> {
    let raw = if flags.is_empty() {
        std::env::var("COLDCHAIN_ALERT_RECIPIENTS")
            .map(|value| vec![value])
            .unwrap_or_default()
    } else {
        flags
    };
    split_recipients(&raw)
}

fn split_recipients(raw: &[String]) -> Vec<String> {
    raw.iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(str::to_string)
        .collect()
}
