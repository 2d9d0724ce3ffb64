//! Source acquisition: git clone, upload extraction, template copy

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info};

use crate::deploy::process::ProcessExecutor;
use crate::deploy::recorder::Recorder;
use crate::errors::DeployerError;
use crate::filesys::dir::Dir;
use crate::filesys::path::is_contained;
use crate::models::deployment::{DeploymentConfig, LogSource, SourceType};

/// Where uploads and templates are looked up, and which programs to call
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub git_program: String,
    pub uploads_dir: Dir,
    pub templates_dir: Dir,
}

/// Fetch the deployment source into `workspace`
pub async fn acquire(
    deployment_id: &str,
    config: &DeploymentConfig,
    workspace: &Dir,
    options: &SourceOptions,
    executor: &ProcessExecutor,
    recorder: &Recorder,
) -> Result<(), DeployerError> {
    match config.source_type {
        SourceType::Git => {
            let url = config
                .source_url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| {
                    DeployerError::ConfigError("Git repository URL is required".to_string())
                })?;
            clone_repository(deployment_id, url, config.branch_or_default(), workspace, options, executor, recorder).await
        }
        SourceType::Upload => {
            let name = required_name(config, "Upload archive name is required")?;
            extract_upload(deployment_id, name, workspace, options, executor, recorder).await
        }
        SourceType::Template => {
            let name = required_name(config, "Template name is required")?;
            copy_template(deployment_id, name, workspace, options, recorder).await
        }
    }
}

fn required_name<'a>(config: &'a DeploymentConfig, message: &str) -> Result<&'a str, DeployerError> {
    let name = config
        .source_url
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| DeployerError::ConfigError(message.to_string()))?;

    // Names are resolved below a fixed root and may not escape it
    if !is_contained(name) {
        return Err(DeployerError::ConfigError(format!(
            "Invalid source name: {}",
            name
        )));
    }
    Ok(name)
}

async fn clone_repository(
    deployment_id: &str,
    url: &str,
    branch: &str,
    workspace: &Dir,
    options: &SourceOptions,
    executor: &ProcessExecutor,
    recorder: &Recorder,
) -> Result<(), DeployerError> {
    info!(deployment_id, url, branch, "Cloning repository");
    recorder.info(
        deployment_id,
        LogSource::Build,
        format!("Cloning {} (branch: {})", url, branch),
    );

    let args = vec![
        "clone".to_string(),
        "--depth".to_string(),
        "1".to_string(),
        "--branch".to_string(),
        branch.to_string(),
        url.to_string(),
        workspace.path().display().to_string(),
    ];
    let cwd = workspace.path().parent().unwrap_or(workspace.path());
    executor
        .run(deployment_id, &options.git_program, &args, cwd, &HashMap::new())
        .await?;

    recorder.info(deployment_id, LogSource::Build, "Repository cloned");
    Ok(())
}

/// Archive formats accepted for uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveKind {
    pub fn detect(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if lower.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }

    fn command(&self, archive: &Path, target: &Path) -> (&'static str, Vec<String>) {
        let archive = archive.display().to_string();
        let target = target.display().to_string();
        match self {
            ArchiveKind::Zip => ("unzip", vec!["-q".into(), "-o".into(), archive, "-d".into(), target]),
            ArchiveKind::TarGz => ("tar", vec!["-xzf".into(), archive, "-C".into(), target]),
            ArchiveKind::Tar => ("tar", vec!["-xf".into(), archive, "-C".into(), target]),
        }
    }
}

async fn extract_upload(
    deployment_id: &str,
    name: &str,
    workspace: &Dir,
    options: &SourceOptions,
    executor: &ProcessExecutor,
    recorder: &Recorder,
) -> Result<(), DeployerError> {
    let kind = ArchiveKind::detect(name).ok_or_else(|| {
        DeployerError::ConfigError(format!("Unsupported upload archive: {}", name))
    })?;

    let archive = options.uploads_dir.file(name);
    if !archive.exists().await {
        return Err(DeployerError::ConfigError(format!(
            "Upload archive not found: {}",
            name
        )));
    }

    recorder.info(
        deployment_id,
        LogSource::Build,
        format!("Extracting uploaded archive {}", name),
    );
    let (program, args) = kind.command(archive.path(), workspace.path());
    debug!(deployment_id, program, "Extracting upload");
    executor
        .run(deployment_id, program, &args, workspace.path(), &HashMap::new())
        .await?;

    recorder.info(deployment_id, LogSource::Build, "Upload extracted");
    Ok(())
}

async fn copy_template(
    deployment_id: &str,
    name: &str,
    workspace: &Dir,
    options: &SourceOptions,
    recorder: &Recorder,
) -> Result<(), DeployerError> {
    let template = options.templates_dir.subdir(name);
    if !template.exists().await {
        return Err(DeployerError::ConfigError(format!(
            "Template not found: {}",
            name
        )));
    }

    recorder.info(
        deployment_id,
        LogSource::Build,
        format!("Copying template {}", name),
    );
    let copied = template.copy_into(workspace).await?;
    recorder.info(
        deployment_id,
        LogSource::Build,
        format!("Template copied ({} files)", copied),
    );
    Ok(())
}
