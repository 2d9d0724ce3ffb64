//! Application configuration options

use std::time::Duration;

use crate::deploy::pipeline::PipelineOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::retention;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Enable local HTTP server
    pub enable_socket_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Pipeline configuration
    pub pipeline: PipelineOptions,

    /// Domain used to synthesize deployment URLs
    pub edge_domain: String,

    /// Enable the periodic retention sweep
    pub enable_retention_worker: bool,

    /// Retention worker options
    pub retention_worker: retention::Options,
}

impl AppOptions {
    /// Build options from the settings file
    pub fn from_settings(settings: &Settings) -> Self {
        let layout = StorageLayout::new(&settings.base_dir);

        let mut pipeline = PipelineOptions::from_layout(&layout);
        pipeline.source.git_program = settings.pipeline.git_program.clone();
        pipeline.shell = settings.pipeline.shell.clone();
        pipeline.max_concurrent_deployments = settings.pipeline.max_concurrent_deployments;
        pipeline.stage_timeout = settings.pipeline.stage_timeout_secs.map(Duration::from_secs);

        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            enable_socket_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            pipeline,
            edge_domain: settings.pipeline.edge_domain.clone(),
            enable_retention_worker: settings.retention.enabled,
            retention_worker: retention::Options {
                interval: Duration::from_secs(settings.retention.interval_secs),
                older_than_days: settings.retention.older_than_days,
            },
        }
    }
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
