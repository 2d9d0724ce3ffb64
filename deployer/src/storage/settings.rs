//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Deployer settings, read from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Directory for rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Base directory for workspaces, artifacts, uploads and templates
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Periodic retention sweep
    #[serde(default)]
    pub retention: RetentionSettings,
}

fn default_true() -> bool {
    true
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/webduh")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            base_dir: default_base_dir(),
            server: ServerSettings::default(),
            pipeline: PipelineSettings::default(),
            retention: RetentionSettings::default(),
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_deployments: usize,

    /// Per-stage timeout in seconds; no limit when absent
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,

    #[serde(default = "default_git_program")]
    pub git_program: String,

    #[serde(default = "default_shell")]
    pub shell: String,

    /// Domain used to synthesize deployment URLs
    #[serde(default = "default_edge_domain")]
    pub edge_domain: String,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_git_program() -> String {
    "git".to_string()
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_edge_domain() -> String {
    "webduh.app".to_string()
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_deployments: default_max_concurrent(),
            stage_timeout_secs: None,
            git_program: default_git_program(),
            shell: default_shell(),
            edge_domain: default_edge_domain(),
        }
    }
}

/// Retention sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_retention_days")]
    pub older_than_days: u32,

    #[serde(default = "default_retention_interval")]
    pub interval_secs: u64,
}

fn default_retention_days() -> u32 {
    7
}

fn default_retention_interval() -> u64 {
    3600
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            older_than_days: default_retention_days(),
            interval_secs: default_retention_interval(),
        }
    }
}
