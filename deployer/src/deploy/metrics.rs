//! Build output measurement

use std::time::Duration;

use crate::errors::DeployerError;
use crate::filesys::dir::Dir;
use crate::models::deployment::DeploymentMetrics;

const BUNDLE_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "css"];

/// Measure the build output directory. A missing directory measures as empty.
pub async fn measure(
    output: &Dir,
    functions: usize,
    build_duration: Duration,
    deploy_duration: Duration,
) -> Result<DeploymentMetrics, DeployerError> {
    let files = if output.exists().await {
        output.walk_files().await?
    } else {
        Vec::new()
    };

    let build_size: u64 = files.iter().map(|(_, len)| len).sum();
    let bundle_size: u64 = files
        .iter()
        .filter(|(path, _)| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| BUNDLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .map(|(_, len)| len)
        .sum();

    Ok(DeploymentMetrics {
        build_size,
        bundle_size,
        static_files: files.len() as u64,
        functions: functions as u64,
        build_duration: build_duration.as_millis() as u64,
        deploy_duration: deploy_duration.as_millis() as u64,
    })
}
