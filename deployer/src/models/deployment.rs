//! Deployment models

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::DeploymentState;
use crate::errors::DeployerError;
use crate::filesys::path::is_contained;

/// Maximum number of log entries retained per deployment
pub const MAX_LOG_ENTRIES: usize = 1000;

/// Where the deployment source comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Git,
    Upload,
    Template,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Git => write!(f, "git"),
            Self::Upload => write!(f, "upload"),
            Self::Template => write!(f, "template"),
        }
    }
}

/// Target environment of a deployment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetEnvironment {
    #[default]
    Production,
    Preview,
    Development,
}

impl TargetEnvironment {
    /// Value exported as `NODE_ENV` to the build
    pub fn node_env(&self) -> &'static str {
        match self {
            TargetEnvironment::Production => "production",
            TargetEnvironment::Preview | TargetEnvironment::Development => "development",
        }
    }
}

/// An edge function shipped with the deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeFunction {
    pub name: String,
    pub path: String,
    pub runtime: String,
    /// Memory limit in MB
    #[serde(default)]
    pub memory: Option<u32>,
    /// Timeout in seconds
    #[serde(default)]
    pub timeout: Option<u32>,
}

/// Deployment configuration submitted by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    pub project_id: String,

    pub user_id: String,

    #[serde(default)]
    pub team_id: Option<String>,

    pub source_type: SourceType,

    /// Git URL, upload archive name or template name depending on `source_type`
    #[serde(default)]
    pub source_url: Option<String>,

    #[serde(default)]
    pub branch: Option<String>,

    #[serde(default)]
    pub build_command: Option<String>,

    /// Overrides the detected dependency install command
    #[serde(default)]
    pub install_command: Option<String>,

    #[serde(default)]
    pub output_directory: Option<String>,

    #[serde(default)]
    pub environment: TargetEnvironment,

    #[serde(default)]
    pub env_vars: HashMap<String, String>,

    #[serde(default)]
    pub regions: Vec<String>,

    #[serde(default)]
    pub custom_domain: Option<String>,

    #[serde(default)]
    pub edge_functions: Vec<EdgeFunction>,
}

impl DeploymentConfig {
    /// Minimal configuration for a project and source type
    pub fn new(project_id: impl Into<String>, user_id: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
            team_id: None,
            source_type,
            source_url: None,
            branch: None,
            build_command: None,
            install_command: None,
            output_directory: None,
            environment: TargetEnvironment::default(),
            env_vars: HashMap::new(),
            regions: Vec::new(),
            custom_domain: None,
            edge_functions: Vec::new(),
        }
    }

    pub fn branch_or_default(&self) -> &str {
        self.branch.as_deref().filter(|b| !b.is_empty()).unwrap_or("main")
    }

    pub fn build_command_or_default(&self) -> &str {
        self.build_command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or("npm run build")
    }

    pub fn output_directory_or_default(&self) -> &str {
        self.output_directory
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or("dist")
    }

    /// Reject settings that would reach outside the deployment workspace
    pub fn validate(&self) -> Result<(), DeployerError> {
        let output = self.output_directory_or_default();
        if !is_contained(output) {
            return Err(DeployerError::ConfigError(format!(
                "Output directory must stay inside the workspace: {}",
                output
            )));
        }
        Ok(())
    }
}

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Info,
    Warn,
    Error,
    Debug,
}

/// Which part of the pipeline produced a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Build,
    Deploy,
    Runtime,
}

/// A single deployment log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogSeverity,
    pub message: String,
    pub source: LogSource,
}

impl DeploymentLog {
    pub fn new(level: LogSeverity, source: LogSource, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            source,
        }
    }

    pub fn info(source: LogSource, message: impl Into<String>) -> Self {
        Self::new(LogSeverity::Info, source, message)
    }

    pub fn warn(source: LogSource, message: impl Into<String>) -> Self {
        Self::new(LogSeverity::Warn, source, message)
    }

    pub fn error(source: LogSource, message: impl Into<String>) -> Self {
        Self::new(LogSeverity::Error, source, message)
    }
}

/// Metrics measured at the end of a successful deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentMetrics {
    /// Total bytes of build output
    pub build_size: u64,
    /// Bytes of script and stylesheet bundles
    pub bundle_size: u64,
    pub static_files: u64,
    pub functions: u64,
    /// Milliseconds
    pub build_duration: u64,
    /// Milliseconds
    pub deploy_duration: u64,
}

/// Mutable status of a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    pub id: String,
    pub project_id: String,
    pub state: DeploymentState,
    pub progress: u8,
    pub logs: VecDeque<DeploymentLog>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<DeploymentMetrics>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentStatus {
    /// Fresh status in the queued state
    pub fn queued(id: impl Into<String>, project_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: project_id.into(),
            state: DeploymentState::Queued,
            progress: 0,
            logs: VecDeque::new(),
            build_duration: None,
            deploy_duration: None,
            url: None,
            preview_url: None,
            error: None,
            metrics: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a log entry, evicting the oldest beyond [`MAX_LOG_ENTRIES`]
    pub fn push_log(&mut self, log: DeploymentLog) {
        self.logs.push_back(log);
        while self.logs.len() > MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
    }

    /// Timestamp used by the retention sweep
    pub fn earliest_activity(&self) -> DateTime<Utc> {
        self.logs
            .front()
            .map(|log| log.timestamp)
            .unwrap_or(self.created_at)
    }
}
