use anyhow::{Context, Result, bail};
use clap::Parser;
use lib_common::core::ControllerConfig;
use lib_common::vision::debounce::{
    DEFAULT_OVERLAP_THRESHOLD, DEFAULT_PERSON_CLASS_INDEX, DEFAULT_TRACK_TTL_MS, DebounceConfig,
};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "PPE frame relay: browser frames in, worker detections and violation alerts out", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "RELAY_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "RELAY_WORKER_PROGRAM", help = "Executable of the detection worker.")]
    pub worker_program: Option<String>,

    #[clap(long, env = "RELAY_WORKER_ARGS", value_delimiter = ',', help = "Comma separated worker arguments.")]
    pub worker_args: Option<Vec<String>>,

    #[clap(long, env = "RELAY_REQUIRED_ITEMS", value_delimiter = ',', help = "Comma separated equipment labels every person must wear.")]
    pub required_items: Option<Vec<String>>,

    #[clap(long, env = "RELAY_PERSON_LABEL", help = "Label of person detections.")]
    pub person_label: Option<String>,

    #[clap(long, env = "RELAY_PERSON_CLASS_INDEX", allow_negative_numbers = true, help = "Class index of person detections (negative disables).")]
    pub person_class_index: Option<i64>,

    #[clap(long, env = "RELAY_OVERLAP_THRESHOLD", help = "Minimum IoU between a person and an item for the item to count as worn.")]
    pub overlap_threshold: Option<f64>,

    #[clap(long, env = "RELAY_TRACK_TTL_MS", help = "Milliseconds a track may go unseen before its alert state is forgotten.")]
    pub track_ttl_ms: Option<u64>,

    #[clap(long, env = "RELAY_OUTBOUND_BUFFER", help = "Queued server events per connection before new ones are dropped.")]
    pub outbound_buffer: Option<usize>,

    #[clap(long, env = "RELAY_WORKER_STALL_WARN_SECS", help = "Warn when the worker has not answered for this many seconds (0 disables).")]
    pub worker_stall_warn_secs: Option<u64>,

    #[clap(long, env = "RELAY_PROXY_TIMEOUT_SECS", help = "Seconds to wait for a proxied upstream to answer.")]
    pub proxy_timeout_secs: Option<u64>,

    #[clap(long, env = "DATABASE_URL", help = "PostgreSQL URL for violation persistence.")]
    pub database_url: Option<String>,

    #[clap(long, env = "RELAY_NOTIFY_WEBHOOK_URL", help = "Webhook receiving violation notifications.")]
    pub notify_webhook_url: Option<String>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            worker_program: other.worker_program.or(self.worker_program),
            worker_args: other.worker_args.or(self.worker_args),
            required_items: other.required_items.or(self.required_items),
            person_label: other.person_label.or(self.person_label),
            person_class_index: other.person_class_index.or(self.person_class_index),
            overlap_threshold: other.overlap_threshold.or(self.overlap_threshold),
            track_ttl_ms: other.track_ttl_ms.or(self.track_ttl_ms),
            outbound_buffer: other.outbound_buffer.or(self.outbound_buffer),
            worker_stall_warn_secs: other.worker_stall_warn_secs.or(self.worker_stall_warn_secs),
            proxy_timeout_secs: other.proxy_timeout_secs.or(self.proxy_timeout_secs),
            database_url: other.database_url.or(self.database_url),
            notify_webhook_url: other.notify_webhook_url.or(self.notify_webhook_url),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(3004),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            worker_program: Some("python3".to_string()),
            worker_args: Some(vec!["python/inference.py".to_string()]),
            required_items: Some(DebounceConfig::default().required_items),
            person_label: Some("person".to_string()),
            person_class_index: Some(DEFAULT_PERSON_CLASS_INDEX),
            overlap_threshold: Some(DEFAULT_OVERLAP_THRESHOLD),
            track_ttl_ms: Some(DEFAULT_TRACK_TTL_MS),
            outbound_buffer: Some(64),
            worker_stall_warn_secs: Some(30),
            proxy_timeout_secs: Some(25),
            ..Default::default()
        }
    }
}

/// Fully resolved and validated runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub worker_program: String,
    pub worker_args: Vec<String>,
    pub controller: ControllerConfig,
    pub outbound_buffer: usize,
    pub proxy_timeout: Duration,
    pub database_url: Option<String>,
    pub notify_webhook_url: Option<String>,
    /// Certificate and key, present only when both files exist.
    pub tls: Option<(PathBuf, PathBuf)>,
}

impl TryFrom<Config> for Settings {
    type Error = anyhow::Error;

    fn try_from(config: Config) -> Result<Self> {
        let defaults = Config::defaults();
        let config = defaults.merge(config);

        let overlap_threshold = config.overlap_threshold.unwrap_or(DEFAULT_OVERLAP_THRESHOLD);
        if !(0.0..=1.0).contains(&overlap_threshold) {
            bail!("overlapThreshold must be within [0, 1], got {}", overlap_threshold);
        }

        let required_items: Vec<String> = config
            .required_items
            .unwrap_or_default()
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect();
        if required_items.is_empty() {
            bail!("requiredItems must name at least one equipment label");
        }

        let track_ttl_ms = config.track_ttl_ms.unwrap_or(DEFAULT_TRACK_TTL_MS);
        if track_ttl_ms == 0 {
            bail!("trackTtlMs must be greater than zero");
        }

        let outbound_buffer = config.outbound_buffer.unwrap_or(64);
        if outbound_buffer == 0 {
            bail!("outboundBuffer must be greater than zero");
        }

        let proxy_timeout_secs = config.proxy_timeout_secs.unwrap_or(25);
        if proxy_timeout_secs == 0 {
            bail!("proxyTimeoutSecs must be greater than zero");
        }

        let worker_program = config.worker_program.unwrap_or_default();
        if worker_program.trim().is_empty() {
            bail!("workerProgram must not be empty");
        }

        let person_label = config.person_label.unwrap_or_else(|| "person".to_string());
        let debounce = DebounceConfig {
            required_items,
            person_label,
            person_class_index: config.person_class_index.filter(|idx| *idx >= 0),
            overlap_threshold,
            track_ttl_ms,
        };
        let stall_warn_after = config
            .worker_stall_warn_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let tls = match (config.tls_cert_path, config.tls_key_path) {
            (Some(cert), Some(key)) if cert.exists() && key.exists() => Some((cert, key)),
            (Some(cert), Some(key)) => {
                log::info!(
                    "TLS files {} / {} not found, serving plain HTTP",
                    cert.display(),
                    key.display()
                );
                None
            }
            _ => None,
        };

        Ok(Settings {
            port: config.port.unwrap_or(3004),
            log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
            worker_program,
            worker_args: config.worker_args.unwrap_or_default(),
            controller: ControllerConfig {
                debounce,
                stall_warn_after,
            },
            outbound_buffer,
            proxy_timeout: Duration::from_secs(proxy_timeout_secs),
            database_url: non_empty(config.database_url),
            notify_webhook_url: non_empty(config.notify_webhook_url),
            tls,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn load_config() -> Result<Settings> {
    load_config_from(std::env::args_os())
}

/// Layers defaults, the JSON config file, then environment and CLI.
pub fn load_config_from<I, T>(args: I) -> Result<Settings>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Config::try_parse_from(args)?;

    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_relay.conf"));

    let mut current_config = Config::default();
    if config_file_path.exists() {
        let config_str = fs::read_to_string(&config_file_path)
            .with_context(|| format!("Failed to read config file {}", config_file_path.display()))?;
        let file_config: Config = serde_json::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file {}", config_file_path.display()))?;
        current_config = current_config.merge(file_config);
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    // CLI args (which include env vars) win over the file.
    let mut current_config = current_config.merge(cli);

    // Fall back to the usual Let's Encrypt location when TLS paths are unset.
    if current_config.tls_cert_path.is_none() || current_config.tls_key_path.is_none() {
        if let Some(home_dir) = dirs::home_dir() {
            let letsencrypt_dir = home_dir.join(".letsencrypt");
            current_config
                .tls_cert_path
                .get_or_insert_with(|| letsencrypt_dir.join("fullchain.pem"));
            current_config
                .tls_key_path
                .get_or_insert_with(|| letsencrypt_dir.join("privkey.pem"));
        }
    }

    Settings::try_from(current_config)
}
