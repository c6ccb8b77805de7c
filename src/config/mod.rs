//! Configuration for the proxy server
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (`OBSPROXY_*`, highest priority)
//! 2. Config file (~/.config/obsproxy/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

mod transformers;

pub use transformers::{FileTransformers, Transformers};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default min interval between Copilot requests, in seconds.
pub const DEFAULT_COPILOT_RATE_LIMIT_SECONDS: f64 = 0.0;

/// Default bound on in-flight archive entries awaiting `ResponseComplete`.
pub const DEFAULT_ARCHIVE_MAX_PENDING: usize = 256;

/// Default event router channel capacity (per producer).
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Provider selection
// ─────────────────────────────────────────────────────────────────────────────

/// Which upstream provider plugin handles traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    Copilot,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Copilot => "copilot",
        }
    }

    fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "copilot" => ProviderKind::Copilot,
            _ => ProviderKind::Anthropic,
        }
    }
}

/// Copilot-specific settings (base URL, auth, rate limiting).
#[derive(Debug, Clone)]
pub struct CopilotConfig {
    pub base_url: String,
    pub account_type: String,
    pub vscode_version: String,
    /// Minimum interval between upstream calls, in seconds.
    pub rate_limit_seconds: f64,
    /// When a request arrives before the interval has elapsed: wait (true) or
    /// reply 429 immediately (false).
    pub rate_limit_wait: bool,
    pub token: Option<String>,
    pub github_token: Option<String>,
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.githubcopilot.com".to_string(),
            account_type: "individual".to_string(),
            vscode_version: "1.95.0".to_string(),
            rate_limit_seconds: DEFAULT_COPILOT_RATE_LIMIT_SECONDS,
            rate_limit_wait: true,
            token: None,
            github_token: None,
        }
    }
}

/// Local CA material for forward-proxy TLS interception.
#[derive(Debug, Clone)]
pub struct CaConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Archive writer settings.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub path: PathBuf,
    pub max_pending: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./logs/archive.json"),
            max_pending: DEFAULT_ARCHIVE_MAX_PENDING,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the proxy server to
    pub bind_addr: SocketAddr,

    /// Which provider plugin is active
    pub provider: ProviderKind,

    /// Target Anthropic API URL (reverse-proxy mode, or the Anthropic plugin's upstream)
    pub anthropic_base_url: String,

    /// Copilot plugin settings
    pub copilot: CopilotConfig,

    /// Directory for storing logs
    pub log_dir: PathBuf,

    /// Archive writer settings
    pub archive: ArchiveConfig,

    /// Capacity of each event-router subscriber channel
    pub event_queue_capacity: usize,

    /// Request transformation settings
    pub transformers: Transformers,

    /// Forward-proxy CA material; `None` means CONNECT requests get 501
    pub ca: Option<CaConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".parse().unwrap(),
            provider: ProviderKind::Anthropic,
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            copilot: CopilotConfig::default(),
            log_dir: PathBuf::from("./logs"),
            archive: ArchiveConfig::default(),
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            transformers: Transformers::default(),
            ca: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,
    pub provider: Option<String>,
    pub anthropic_base_url: Option<String>,

    pub copilot_base_url: Option<String>,
    pub copilot_account_type: Option<String>,
    pub copilot_vscode_version: Option<String>,
    pub copilot_rate_limit_seconds: Option<f64>,
    pub copilot_rate_limit_wait: Option<bool>,

    pub log_dir: Option<String>,

    pub archive_path: Option<String>,
    pub archive_max_pending: Option<usize>,

    pub event_queue_capacity: Option<usize>,

    pub ca_cert_path: Option<String>,
    pub ca_key_path: Option<String>,

    /// Optional [transformers] section
    pub transformers: Option<FileTransformers>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: ~/.config/obsproxy/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("obsproxy").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };

        if path.exists() {
            return;
        }

        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Silently fail - config is optional
            }
        }

        let _ = std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE);
    }

    /// Load file config if it exists
    ///
    /// # Panics
    /// If config file exists but cannot be parsed. This is intentional -
    /// a broken config should fail fast with a clear error, not silently
    /// fall back to defaults while the user debugs the wrong thing.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!(
                        "\n╔══════════════════════════════════════════════════════════════╗"
                    );
                    eprintln!(
                        "║  CONFIG ERROR - Failed to parse configuration file          ║"
                    );
                    eprintln!(
                        "╚══════════════════════════════════════════════════════════════╝\n"
                    );
                    eprintln!("  File: {}\n", path.display());
                    eprintln!("  Error: {}\n", e);
                    eprintln!("  To reset, delete the file and restart obsproxy.\n");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
                eprintln!("║  CONFIG ERROR - Cannot read configuration file              ║");
                eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
                eprintln!("  File: {}\n", path.display());
                eprintln!("  Error: {}\n", e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env vars -> file -> defaults
    pub fn from_env() -> Self {
        let file = Self::load_file_config();

        let bind_addr = std::env::var("OBSPROXY_BIND")
            .ok()
            .or(file.bind_addr)
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .expect("Invalid bind address");

        let provider = std::env::var("OBSPROXY_PROVIDER")
            .ok()
            .or(file.provider)
            .map(|s| ProviderKind::parse(&s))
            .unwrap_or(ProviderKind::Anthropic);

        let anthropic_base_url = std::env::var("OBSPROXY_ANTHROPIC_BASE_URL")
            .ok()
            .or(file.anthropic_base_url)
            .unwrap_or_else(|| "https://api.anthropic.com".to_string());

        let copilot_default = CopilotConfig::default();
        let copilot = CopilotConfig {
            base_url: std::env::var("OBSPROXY_COPILOT_BASE_URL")
                .ok()
                .or(file.copilot_base_url)
                .unwrap_or(copilot_default.base_url),
            account_type: std::env::var("OBSPROXY_COPILOT_ACCOUNT_TYPE")
                .ok()
                .or(file.copilot_account_type)
                .unwrap_or(copilot_default.account_type),
            vscode_version: std::env::var("OBSPROXY_COPILOT_VSCODE_VERSION")
                .ok()
                .or(file.copilot_vscode_version)
                .unwrap_or(copilot_default.vscode_version),
            rate_limit_seconds: std::env::var("OBSPROXY_COPILOT_RATE_LIMIT_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(file.copilot_rate_limit_seconds)
                .unwrap_or(copilot_default.rate_limit_seconds),
            rate_limit_wait: std::env::var("OBSPROXY_COPILOT_RATE_LIMIT_WAIT")
                .ok()
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .or(file.copilot_rate_limit_wait)
                .unwrap_or(copilot_default.rate_limit_wait),
            token: std::env::var("OBSPROXY_COPILOT_TOKEN").ok(),
            github_token: std::env::var("OBSPROXY_COPILOT_GITHUB_TOKEN").ok(),
        };

        let log_dir = std::env::var("OBSPROXY_LOG_DIR")
            .ok()
            .or(file.log_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./logs"));

        let archive_default = ArchiveConfig::default();
        let archive = ArchiveConfig {
            path: std::env::var("OBSPROXY_ARCHIVE_PATH")
                .ok()
                .or(file.archive_path)
                .map(PathBuf::from)
                .unwrap_or(archive_default.path),
            max_pending: std::env::var("OBSPROXY_ARCHIVE_MAX_PENDING")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(file.archive_max_pending)
                .unwrap_or(archive_default.max_pending),
        };

        let event_queue_capacity = std::env::var("OBSPROXY_EVENT_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.event_queue_capacity)
            .unwrap_or(DEFAULT_EVENT_QUEUE_CAPACITY);

        let transformers = Transformers::from_file(file.transformers);

        let ca_cert_path = std::env::var("OBSPROXY_CA_CERT").ok().or(file.ca_cert_path);
        let ca_key_path = std::env::var("OBSPROXY_CA_KEY").ok().or(file.ca_key_path);
        let ca = match (ca_cert_path, ca_key_path) {
            (Some(cert_path), Some(key_path)) => Some(CaConfig {
                cert_path: PathBuf::from(cert_path),
                key_path: PathBuf::from(key_path),
            }),
            _ => None,
        };

        Self {
            bind_addr,
            provider,
            anthropic_base_url,
            copilot,
            log_dir,
            archive,
            event_queue_capacity,
            transformers,
            ca,
        }
    }
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# obsproxy configuration
# bind_addr = "127.0.0.1:8080"
# provider = "anthropic"  # or "copilot"
# anthropic_base_url = "https://api.anthropic.com"
# log_dir = "./logs"
# archive_path = "./logs/archive.json"
# archive_max_pending = 256
# event_queue_capacity = 1024

# [transformers]
# enabled = false

# copilot_base_url = "https://api.githubcopilot.com"
# copilot_account_type = "individual"
# copilot_vscode_version = "1.95.0"
# copilot_rate_limit_seconds = 0.0
# copilot_rate_limit_wait = true

# ca_cert_path = "~/.config/obsproxy/ca.pem"
# ca_key_path = "~/.config/obsproxy/ca.key"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_anthropic_reverse_proxy() {
        let config = Config::default();
        assert_eq!(config.provider, ProviderKind::Anthropic);
        assert_eq!(config.anthropic_base_url, "https://api.anthropic.com");
        assert!(config.ca.is_none());
    }

    #[test]
    fn provider_kind_parses_case_insensitively() {
        assert_eq!(ProviderKind::parse("Copilot"), ProviderKind::Copilot);
        assert_eq!(ProviderKind::parse("anything-else"), ProviderKind::Anthropic);
    }

    #[test]
    fn archive_default_max_pending_matches_spec() {
        assert_eq!(ArchiveConfig::default().max_pending, 256);
    }
}
