//! Edge publishing backends

use async_trait::async_trait;
use tracing::{debug, info};

use crate::errors::DeployerError;
use crate::filesys::dir::Dir;
use crate::models::deployment::DeploymentConfig;

/// Result of publishing a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRelease {
    pub url: String,
    pub preview_url: String,
    /// Number of files published, zero when the build produced no output
    pub files: u64,
}

/// Publishes build output and configures routing for it
#[async_trait]
pub trait EdgeBackend: Send + Sync {
    /// Backend name used in logs
    fn name(&self) -> &str;

    /// Publish the contents of `output` for a deployment
    async fn publish(
        &self,
        deployment_id: &str,
        config: &DeploymentConfig,
        output: &Dir,
    ) -> Result<EdgeRelease, DeployerError>;

    /// Configure domains and edge functions; returns a line per routing action
    async fn configure_routing(
        &self,
        deployment_id: &str,
        config: &DeploymentConfig,
        release: &EdgeRelease,
    ) -> Result<Vec<String>, DeployerError>;

    /// Remove published artifacts of a deployment
    async fn unpublish(&self, deployment_id: &str) -> Result<(), DeployerError>;
}

/// Lowercase, dash-separated label usable as a DNS name part
pub fn dns_label(value: &str) -> String {
    let mut label = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            label.push(c.to_ascii_lowercase());
        } else if !label.ends_with('-') {
            label.push('-');
        }
    }
    let label = label.trim_matches('-');
    if label.is_empty() {
        "app".to_string()
    } else {
        label.to_string()
    }
}

/// Production and preview URLs for a deployment
pub fn deployment_urls(project_id: &str, deployment_id: &str, domain: &str) -> (String, String) {
    let project = dns_label(project_id);
    let prefix: String = deployment_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_ascii_lowercase();

    (
        format!("https://{}-{}.{}", project, prefix, domain),
        format!("https://{}-{}-preview.{}", project, prefix, domain),
    )
}

/// Publishes build output into a local artifacts directory.
///
/// URLs are derived from the project and deployment ids; nothing is served.
#[derive(Debug, Clone)]
pub struct LocalEdge {
    artifacts_dir: Dir,
    domain: String,
}

impl LocalEdge {
    pub fn new(artifacts_dir: Dir, domain: impl Into<String>) -> Self {
        Self {
            artifacts_dir,
            domain: domain.into(),
        }
    }

    pub fn artifacts_for(&self, deployment_id: &str) -> Dir {
        self.artifacts_dir.subdir(deployment_id)
    }
}

#[async_trait]
impl EdgeBackend for LocalEdge {
    fn name(&self) -> &str {
        "local"
    }

    async fn publish(
        &self,
        deployment_id: &str,
        config: &DeploymentConfig,
        output: &Dir,
    ) -> Result<EdgeRelease, DeployerError> {
        let (url, preview_url) = deployment_urls(&config.project_id, deployment_id, &self.domain);

        let target = self.artifacts_for(deployment_id);
        target.delete().await?;
        target.create().await?;

        let files = if output.exists().await {
            output.copy_into(&target).await?
        } else {
            debug!(deployment_id, output = %output.path().display(), "No build output to publish");
            0
        };

        info!(deployment_id, files, url = %url, "Published build output");
        Ok(EdgeRelease {
            url,
            preview_url,
            files,
        })
    }

    async fn configure_routing(
        &self,
        _deployment_id: &str,
        config: &DeploymentConfig,
        release: &EdgeRelease,
    ) -> Result<Vec<String>, DeployerError> {
        let mut actions = Vec::new();

        if !config.regions.is_empty() {
            actions.push(format!("Regions: {}", config.regions.join(", ")));
        }

        if let Some(domain) = config.custom_domain.as_deref().filter(|d| !d.is_empty()) {
            actions.push(format!(
                "Custom domain {} would be routed to {}",
                domain, release.url
            ));
        }

        for function in &config.edge_functions {
            let memory = function
                .memory
                .map(|m| format!("{}MB", m))
                .unwrap_or_else(|| "default memory".to_string());
            let timeout = function
                .timeout
                .map(|t| format!("{}s", t))
                .unwrap_or_else(|| "default timeout".to_string());
            actions.push(format!(
                "Edge function {} ({}, {}, {}) would be deployed from {}",
                function.name, function.runtime, memory, timeout, function.path
            ));
        }

        Ok(actions)
    }

    async fn unpublish(&self, deployment_id: &str) -> Result<(), DeployerError> {
        self.artifacts_for(deployment_id).delete().await
    }
}
