//! Deployment pipeline runner
//!
//! A submitted configuration runs through a fixed sequence of stages on its
//! own task. Each stage returns a `Result`; the first error short-circuits
//! the rest and moves the deployment to `error`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::deploy::edge::{EdgeBackend, EdgeRelease};
use crate::deploy::events::{DeploymentEvent, EventNotifier};
use crate::deploy::fsm::{DeploymentState, Transition};
use crate::deploy::metrics;
use crate::deploy::process::{ProcessExecutor, ProcessTable};
use crate::deploy::recorder::Recorder;
use crate::deploy::source::{self, SourceOptions};
use crate::deploy::store::StatusStore;
use crate::errors::DeployerError;
use crate::filesys::dir::Dir;
use crate::models::deployment::{
    DeploymentConfig, DeploymentLog, DeploymentStatus, LogSource,
};
use crate::storage::layout::StorageLayout;
use crate::utils::generate_uuid;

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Root of per-deployment working directories
    pub workspace_dir: Dir,

    /// Source lookup and git program
    pub source: SourceOptions,

    /// Shell used for install and build commands
    pub shell: String,

    /// Pipelines allowed to run at once; the rest wait in `queued`
    pub max_concurrent_deployments: usize,

    /// Upper bound for a single stage, unbounded when `None`
    pub stage_timeout: Option<Duration>,

    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl PipelineOptions {
    /// Default options for a storage layout
    pub fn from_layout(layout: &StorageLayout) -> Self {
        Self {
            workspace_dir: layout.workspaces_dir(),
            source: SourceOptions {
                git_program: "git".to_string(),
                uploads_dir: layout.uploads_dir(),
                templates_dir: layout.templates_dir(),
            },
            shell: "sh".to_string(),
            max_concurrent_deployments: 4,
            stage_timeout: None,
            event_capacity: 1024,
        }
    }
}

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prepare,
    Source,
    Install,
    Build,
    Deploy,
    Route,
    Finalize,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Prepare,
        Stage::Source,
        Stage::Install,
        Stage::Build,
        Stage::Deploy,
        Stage::Route,
        Stage::Finalize,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::Source => "source",
            Stage::Install => "install",
            Stage::Build => "build",
            Stage::Deploy => "deploy",
            Stage::Route => "route",
            Stage::Finalize => "finalize",
        }
    }

    /// Progress reported when the stage starts
    pub fn progress(&self) -> u8 {
        match self {
            Stage::Prepare => 10,
            Stage::Source => 20,
            Stage::Install => 40,
            Stage::Build => 60,
            Stage::Deploy => 80,
            Stage::Route => 90,
            Stage::Finalize => 100,
        }
    }

    fn log_source(&self) -> LogSource {
        match self {
            Stage::Prepare | Stage::Source | Stage::Install | Stage::Build => LogSource::Build,
            Stage::Deploy | Stage::Route | Stage::Finalize => LogSource::Deploy,
        }
    }
}

/// Per-run state threaded through the stages
struct RunContext {
    id: String,
    config: DeploymentConfig,
    workspace: Dir,
    build_duration: Duration,
    deploy_duration: Duration,
    release: Option<EdgeRelease>,
}

impl RunContext {
    fn output_dir(&self) -> Dir {
        self.workspace.subdir(self.config.output_directory_or_default())
    }
}

/// Runs deployments and answers status queries
#[derive(Clone)]
pub struct PipelineRunner {
    options: Arc<PipelineOptions>,
    store: Arc<StatusStore>,
    processes: Arc<ProcessTable>,
    recorder: Recorder,
    executor: ProcessExecutor,
    edge: Arc<dyn EdgeBackend>,
    limiter: Arc<Semaphore>,
}

impl PipelineRunner {
    pub fn new(options: PipelineOptions, edge: Arc<dyn EdgeBackend>) -> Self {
        let store = Arc::new(StatusStore::new());
        let processes = Arc::new(ProcessTable::new());
        let recorder = Recorder::new(store.clone(), EventNotifier::new(options.event_capacity));
        let executor = ProcessExecutor::new(recorder.clone(), processes.clone());
        let limiter = Arc::new(Semaphore::new(options.max_concurrent_deployments.max(1)));

        Self {
            options: Arc::new(options),
            store,
            processes,
            recorder,
            executor,
            edge,
            limiter,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    pub fn processes(&self) -> &Arc<ProcessTable> {
        &self.processes
    }

    /// Subscribe to lifecycle events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.recorder.notifier().subscribe()
    }

    /// Queue a deployment and start its pipeline in the background.
    ///
    /// Configuration problems surface later as an `error` state, never here.
    pub fn submit(&self, config: DeploymentConfig) -> String {
        let id = generate_uuid();

        let mut status = DeploymentStatus::queued(&id, &config.project_id);
        status.push_log(DeploymentLog::info(
            LogSource::Build,
            format!("Deployment queued ({} source)", config.source_type),
        ));
        self.store.insert(status);

        info!(
            deployment_id = %id,
            project_id = %config.project_id,
            source_type = %config.source_type,
            "Deployment submitted"
        );
        self.recorder.notifier().emit(DeploymentEvent::Created {
            deployment_id: id.clone(),
            project_id: config.project_id.clone(),
        });

        let runner = self.clone();
        let span = info_span!("deployment", id = %id);
        tokio::spawn(runner.execute(id.clone(), config).instrument(span));

        id
    }

    /// Current status of a deployment
    pub fn get_status(&self, id: &str) -> Option<DeploymentStatus> {
        self.store.get(id)
    }

    /// Every known deployment, newest first
    pub fn list(&self) -> Vec<DeploymentStatus> {
        self.store.list()
    }

    /// Cancel a deployment that has not finished yet.
    ///
    /// Returns false for unknown or already finished deployments.
    pub fn cancel(&self, id: &str) -> bool {
        match self.store.transition(id, Transition::Cancel) {
            Ok(_) => {}
            Err(DeployerError::NotFound(_)) => return false,
            Err(e) => {
                debug!(deployment_id = id, "Cancel ignored: {}", e);
                return false;
            }
        }

        let killed = self.processes.kill(id);
        info!(deployment_id = id, killed, "Deployment cancelled");
        self.recorder.info(id, LogSource::Build, "Deployment cancelled");
        self.recorder.notifier().emit(DeploymentEvent::Cancelled {
            deployment_id: id.to_string(),
        });
        true
    }

    /// Drop finished deployments older than `older_than_days` together with
    /// their workspaces and published artifacts. Returns how many were removed.
    pub async fn cleanup(&self, older_than_days: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
        let removed = self.store.remove_older_than(cutoff);

        for id in &removed {
            if let Err(e) = self.options.workspace_dir.subdir(id).delete().await {
                warn!(deployment_id = %id, "Failed to delete workspace: {}", e);
            }
            if let Err(e) = self.edge.unpublish(id).await {
                warn!(deployment_id = %id, "Failed to remove artifacts: {}", e);
            }
        }

        if !removed.is_empty() {
            info!(removed = removed.len(), older_than_days, "Cleaned up deployments");
        }
        removed.len()
    }

    // ============================== EXECUTION ================================ //

    async fn execute(self, id: String, config: DeploymentConfig) {
        let _permit = match self.limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                self.fail(&id, Stage::Prepare, DeployerError::Internal(e.to_string()));
                return;
            }
        };

        let mut ctx = RunContext {
            workspace: self.options.workspace_dir.subdir(&id),
            id,
            config,
            build_duration: Duration::ZERO,
            deploy_duration: Duration::ZERO,
            release: None,
        };

        let started = Instant::now();
        match self.run_stages(&mut ctx).await {
            Ok(()) => {
                info!(deployment_id = %ctx.id, elapsed = ?started.elapsed(), "Deployment ready");
            }
            Err((stage, e)) => {
                self.fail(&ctx.id, stage, e);
                if ctx.release.is_some() {
                    self.withdraw(&ctx.id).await;
                }
            }
        }
    }

    /// Remove artifacts published by a deployment that did not finish
    async fn withdraw(&self, id: &str) {
        match self.edge.unpublish(id).await {
            Ok(()) => debug!(deployment_id = id, "Withdrew published artifacts"),
            Err(e) => warn!(deployment_id = id, "Failed to withdraw artifacts: {}", e),
        }
    }

    async fn run_stages(&self, ctx: &mut RunContext) -> Result<(), (Stage, DeployerError)> {
        for stage in Stage::ALL {
            self.run_stage_bounded(stage, ctx)
                .await
                .map_err(|e| (stage, e))?;
        }
        Ok(())
    }

    async fn run_stage_bounded(&self, stage: Stage, ctx: &mut RunContext) -> Result<(), DeployerError> {
        match self.options.stage_timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_stage(stage, ctx))
                .await
                .map_err(|_| DeployerError::Timeout {
                    stage: stage.name().to_string(),
                    secs: limit.as_secs(),
                })?,
            None => self.run_stage(stage, ctx).await,
        }
    }

    async fn run_stage(&self, stage: Stage, ctx: &mut RunContext) -> Result<(), DeployerError> {
        self.ensure_active(&ctx.id)?;
        debug!(deployment_id = %ctx.id, stage = stage.name(), "Stage started");

        match stage {
            Stage::Prepare => self.prepare(ctx).await,
            Stage::Source => self.acquire_source(ctx).await,
            Stage::Install => self.install(ctx).await,
            Stage::Build => self.build(ctx).await,
            Stage::Deploy => self.deploy(ctx).await,
            Stage::Route => self.route(ctx).await,
            Stage::Finalize => self.finalize(ctx).await,
        }
    }

    fn ensure_active(&self, id: &str) -> Result<(), DeployerError> {
        match self.store.state(id) {
            Some(DeploymentState::Cancelled) => Err(DeployerError::Cancelled(id.to_string())),
            Some(_) => Ok(()),
            None => Err(DeployerError::NotFound(format!("deployment {}", id))),
        }
    }

    fn enter(&self, ctx: &RunContext, stage: Stage) {
        self.recorder.progress(&ctx.id, stage.progress(), stage.name());
    }

    async fn prepare(&self, ctx: &mut RunContext) -> Result<(), DeployerError> {
        ctx.config.validate()?;
        self.store.transition(&ctx.id, Transition::Build)?;
        self.enter(ctx, Stage::Prepare);

        ctx.workspace.create().await?;
        self.recorder.info(
            &ctx.id,
            LogSource::Build,
            format!("Prepared workspace {}", ctx.workspace.path().display()),
        );
        Ok(())
    }

    async fn acquire_source(&self, ctx: &mut RunContext) -> Result<(), DeployerError> {
        self.enter(ctx, Stage::Source);
        source::acquire(
            &ctx.id,
            &ctx.config,
            &ctx.workspace,
            &self.options.source,
            &self.executor,
            &self.recorder,
        )
        .await
    }

    async fn install(&self, ctx: &mut RunContext) -> Result<(), DeployerError> {
        self.enter(ctx, Stage::Install);

        if !ctx.workspace.file("package.json").exists().await {
            self.recorder.info(
                &ctx.id,
                LogSource::Build,
                "No package.json found, skipping dependency installation",
            );
            return Ok(());
        }

        let command = match ctx.config.install_command.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(command) => command.to_string(),
            None if ctx.workspace.file("package-lock.json").exists().await => "npm ci".to_string(),
            None => "npm install".to_string(),
        };

        self.recorder.info(
            &ctx.id,
            LogSource::Build,
            format!("Installing dependencies: {}", command),
        );
        self.shell(ctx, &command, &HashMap::new()).await?;
        self.recorder.info(&ctx.id, LogSource::Build, "Dependencies installed");
        Ok(())
    }

    async fn build(&self, ctx: &mut RunContext) -> Result<(), DeployerError> {
        self.enter(ctx, Stage::Build);

        let command = ctx.config.build_command_or_default().to_string();
        let mut envs = ctx.config.env_vars.clone();
        envs.insert(
            "NODE_ENV".to_string(),
            ctx.config.environment.node_env().to_string(),
        );

        self.recorder.info(
            &ctx.id,
            LogSource::Build,
            format!("Running build: {}", command),
        );
        let started = Instant::now();
        self.shell(ctx, &command, &envs).await?;
        ctx.build_duration = started.elapsed();

        let build_ms = ctx.build_duration.as_millis() as u64;
        self.store.update(&ctx.id, |s| s.build_duration = Some(build_ms));
        self.recorder.info(
            &ctx.id,
            LogSource::Build,
            format!("Build completed in {}ms", build_ms),
        );
        Ok(())
    }

    async fn deploy(&self, ctx: &mut RunContext) -> Result<(), DeployerError> {
        self.store.transition(&ctx.id, Transition::Deploy)?;
        self.enter(ctx, Stage::Deploy);

        let output = ctx.output_dir();
        self.recorder.info(
            &ctx.id,
            LogSource::Deploy,
            format!("Deploying to edge ({})", self.edge.name()),
        );

        let started = Instant::now();
        let release = self.edge.publish(&ctx.id, &ctx.config, &output).await?;
        ctx.deploy_duration = started.elapsed();

        if release.files == 0 {
            self.recorder.warn(
                &ctx.id,
                LogSource::Deploy,
                format!(
                    "No build output found in {}",
                    ctx.config.output_directory_or_default()
                ),
            );
        }

        let deploy_ms = ctx.deploy_duration.as_millis() as u64;
        self.store.update(&ctx.id, |s| s.deploy_duration = Some(deploy_ms));
        self.recorder.info(
            &ctx.id,
            LogSource::Deploy,
            format!("Published {} files", release.files),
        );
        ctx.release = Some(release);
        Ok(())
    }

    async fn route(&self, ctx: &mut RunContext) -> Result<(), DeployerError> {
        self.enter(ctx, Stage::Route);

        let release = ctx
            .release
            .as_ref()
            .ok_or_else(|| DeployerError::Internal("routing before publish".to_string()))?;
        let actions = self
            .edge
            .configure_routing(&ctx.id, &ctx.config, release)
            .await?;

        for action in actions {
            self.recorder.info(&ctx.id, LogSource::Deploy, action);
        }
        Ok(())
    }

    async fn finalize(&self, ctx: &mut RunContext) -> Result<(), DeployerError> {
        let release = ctx
            .release
            .clone()
            .ok_or_else(|| DeployerError::Internal("finalize before publish".to_string()))?;

        let metrics = metrics::measure(
            &ctx.output_dir(),
            ctx.config.edge_functions.len(),
            ctx.build_duration,
            ctx.deploy_duration,
        )
        .await?;

        self.store
            .transition_with(&ctx.id, Transition::Complete, |s| {
                s.url = Some(release.url.clone());
                s.preview_url = Some(release.preview_url.clone());
                s.metrics = Some(metrics.clone());
            })
            .map_err(|e| match self.store.state(&ctx.id) {
                Some(DeploymentState::Cancelled) => DeployerError::Cancelled(ctx.id.clone()),
                _ => e,
            })?;
        self.enter(ctx, Stage::Finalize);

        self.recorder.info(
            &ctx.id,
            LogSource::Deploy,
            format!("Deployment ready at {}", release.url),
        );
        self.recorder.notifier().emit(DeploymentEvent::Completed {
            deployment_id: ctx.id.clone(),
            url: release.url,
            preview_url: release.preview_url,
            metrics,
        });
        Ok(())
    }

    async fn shell(
        &self,
        ctx: &RunContext,
        command: &str,
        envs: &HashMap<String, String>,
    ) -> Result<(), DeployerError> {
        let args = vec!["-c".to_string(), command.to_string()];
        self.executor
            .run(&ctx.id, &self.options.shell, &args, ctx.workspace.path(), envs)
            .await
    }

    fn fail(&self, id: &str, stage: Stage, err: DeployerError) {
        self.processes.kill(id);

        if matches!(err, DeployerError::Cancelled(_))
            || self.store.state(id) == Some(DeploymentState::Cancelled)
        {
            debug!(deployment_id = id, stage = stage.name(), "Stopped after cancellation");
            return;
        }

        let message = err.to_string();
        if let Err(e) = self.store.transition(id, Transition::Fail(message.clone())) {
            warn!(deployment_id = id, "Unable to record failure: {}", e);
            return;
        }

        warn!(deployment_id = id, stage = stage.name(), "Deployment failed: {}", message);
        self.recorder.error(
            id,
            stage.log_source(),
            format!("Deployment failed during {}: {}", stage.name(), message),
        );
        self.recorder.notifier().emit(DeploymentEvent::Failed {
            deployment_id: id.to_string(),
            error: message,
        });
    }
}
