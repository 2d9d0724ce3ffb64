//! Pipeline runner tests
//!
//! Source checkouts use a shell script standing in for `git`, so no network
//! access is needed.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::broadcast;

use webduh_deployer::deploy::edge::{EdgeBackend, EdgeRelease, LocalEdge};
use webduh_deployer::deploy::events::DeploymentEvent;
use webduh_deployer::deploy::fsm::DeploymentState;
use webduh_deployer::deploy::pipeline::{PipelineOptions, PipelineRunner};
use webduh_deployer::errors::DeployerError;
use webduh_deployer::filesys::dir::Dir;
use webduh_deployer::models::deployment::{
    DeploymentConfig, DeploymentStatus, LogSeverity, SourceType,
};
use webduh_deployer::storage::layout::StorageLayout;

/// Clones by writing a single page into the target directory
const FAKE_GIT: &str = r#"#!/bin/sh
for last; do :; done
mkdir -p "$last"
echo '<html>hello</html>' > "$last/index.html"
echo 'console.log(1)' > "$last/app.js"
echo "cloned into $last"
"#;

/// Clone that never finishes
const HANGING_GIT: &str = "#!/bin/sh\nexec sleep 30\n";

const BUILD_COMMAND: &str = "mkdir -p dist && cp index.html app.js dist/";

struct Harness {
    _root: TempDir,
    layout: StorageLayout,
    edge: LocalEdge,
    runner: PipelineRunner,
}

async fn harness_with(git_script: &str, configure: impl FnOnce(&mut PipelineOptions)) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(root.path().join("data"));
    layout.setup().await.unwrap();

    let git = root.path().join("fake-git");
    write_script(&git, git_script);

    let mut options = PipelineOptions::from_layout(&layout);
    options.source.git_program = git.display().to_string();
    configure(&mut options);

    let edge = LocalEdge::new(layout.artifacts_dir(), "webduh.test");
    let runner = PipelineRunner::new(options, Arc::new(edge.clone()));

    Harness {
        _root: root,
        layout,
        edge,
        runner,
    }
}

async fn harness(git_script: &str) -> Harness {
    harness_with(git_script, |_| {}).await
}

fn write_script(path: &Path, contents: &str) {
    std::fs::write(path, contents).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn git_config() -> DeploymentConfig {
    let mut config = DeploymentConfig::new("My Project", "user-1", SourceType::Git);
    config.source_url = Some("https://example.com/repo.git".to_string());
    config.build_command = Some(BUILD_COMMAND.to_string());
    config
}

async fn wait_until<F>(runner: &PipelineRunner, id: &str, done: F) -> DeploymentStatus
where
    F: Fn(&DeploymentStatus) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let status = runner.get_status(id).unwrap();
        if done(&status) {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "deployment {} stuck in {}",
            id,
            status.state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_terminal(runner: &PipelineRunner, id: &str) -> DeploymentStatus {
    wait_until(runner, id, |s| s.state.is_terminal()).await
}

/// Collect this deployment's events until one ends it
async fn collect_events(
    rx: &mut broadcast::Receiver<DeploymentEvent>,
    id: &str,
) -> Vec<DeploymentEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(20), rx.recv())
            .await
            .expect("timed out waiting for events")
            .unwrap();
        if event.deployment_id() != id {
            continue;
        }
        let last = matches!(
            event,
            DeploymentEvent::Completed { .. }
                | DeploymentEvent::Failed { .. }
                | DeploymentEvent::Cancelled { .. }
        );
        events.push(event);
        if last {
            return events;
        }
    }
}

#[tokio::test]
async fn test_git_deployment_reaches_ready() {
    let h = harness(FAKE_GIT).await;

    let id = h.runner.submit(git_config());
    let status = wait_for_terminal(&h.runner, &id).await;

    assert_eq!(status.state, DeploymentState::Ready, "logs: {:?}", status.logs);
    assert_eq!(status.progress, 100);
    assert!(status.error.is_none());

    let url = status.url.unwrap();
    assert!(url.starts_with("https://my-project-"), "{}", url);
    assert!(url.ends_with(".webduh.test"));
    assert!(status.preview_url.unwrap().ends_with("-preview.webduh.test"));
    assert!(status.build_duration.is_some());
    assert!(status.deploy_duration.is_some());

    let metrics = status.metrics.unwrap();
    assert_eq!(metrics.static_files, 2);
    assert!(metrics.bundle_size > 0);
    assert!(metrics.build_size >= metrics.bundle_size);

    // Output was published and the clone output was logged
    assert!(h.edge.artifacts_for(&id).file("index.html").exists().await);
    assert!(status.logs.iter().any(|l| l.message.starts_with("cloned into")));
    assert!(!h.runner.processes().is_tracked(&id));
}

#[tokio::test]
async fn test_events_progress_never_decreases() {
    let h = harness(FAKE_GIT).await;
    let mut rx = h.runner.subscribe();

    let id = h.runner.submit(git_config());
    let events = collect_events(&mut rx, &id).await;

    assert!(matches!(events.first(), Some(DeploymentEvent::Created { .. })));
    assert!(matches!(events.last(), Some(DeploymentEvent::Completed { .. })));

    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            DeploymentEvent::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
    assert_eq!(progress.last(), Some(&100));
}

#[tokio::test]
async fn test_git_without_url_fails() {
    let h = harness(FAKE_GIT).await;
    let mut rx = h.runner.subscribe();

    let mut config = git_config();
    config.source_url = None;
    let id = h.runner.submit(config);

    let status = wait_for_terminal(&h.runner, &id).await;
    assert_eq!(status.state, DeploymentState::Error);
    assert_eq!(status.error.as_deref(), Some("Git repository URL is required"));
    assert!(status.url.is_none());
    assert!(status
        .logs
        .iter()
        .any(|l| l.level == LogSeverity::Error && l.message.contains("during source")));

    let events = collect_events(&mut rx, &id).await;
    assert!(matches!(
        events.last(),
        Some(DeploymentEvent::Failed { error, .. }) if error == "Git repository URL is required"
    ));
}

#[tokio::test]
async fn test_build_failure_reports_exit_code() {
    let h = harness(FAKE_GIT).await;

    let mut config = git_config();
    config.build_command = Some("echo broken >&2; exit 3".to_string());
    let id = h.runner.submit(config);

    let status = wait_for_terminal(&h.runner, &id).await;
    assert_eq!(status.state, DeploymentState::Error);
    assert!(status.error.unwrap().contains("exited with code 3"));
    assert!(status
        .logs
        .iter()
        .any(|l| l.level == LogSeverity::Warn && l.message == "broken"));
}

#[tokio::test]
async fn test_build_sees_env_vars() {
    let h = harness(FAKE_GIT).await;

    let mut config = git_config();
    config
        .env_vars
        .insert("GREETING".to_string(), "hello".to_string());
    config.build_command = Some(format!(
        "{} && echo \"$NODE_ENV:$GREETING\" > dist/env.txt",
        BUILD_COMMAND
    ));
    let id = h.runner.submit(config);

    let status = wait_for_terminal(&h.runner, &id).await;
    assert_eq!(status.state, DeploymentState::Ready, "logs: {:?}", status.logs);

    let env = h
        .edge
        .artifacts_for(&id)
        .file("env.txt")
        .read_string()
        .await
        .unwrap();
    assert_eq!(env.trim(), "production:hello");
}

#[tokio::test]
async fn test_install_skipped_without_package_json() {
    let h = harness(FAKE_GIT).await;

    let id = h.runner.submit(git_config());
    let status = wait_for_terminal(&h.runner, &id).await;

    assert_eq!(status.state, DeploymentState::Ready);
    assert!(status
        .logs
        .iter()
        .any(|l| l.message.contains("skipping dependency installation")));
}

#[tokio::test]
async fn test_custom_install_command_runs_with_package_json() {
    let script = format!(
        "{}echo '{{}}' > \"$last/package.json\"\n",
        FAKE_GIT
    );
    let h = harness(&script).await;

    let mut config = git_config();
    config.install_command = Some("touch installed.marker".to_string());
    config.build_command = Some(format!("{} && cp installed.marker dist/", BUILD_COMMAND));
    let id = h.runner.submit(config);

    let status = wait_for_terminal(&h.runner, &id).await;
    assert_eq!(status.state, DeploymentState::Ready, "logs: {:?}", status.logs);
    assert!(h.edge.artifacts_for(&id).file("installed.marker").exists().await);
}

#[tokio::test]
async fn test_cancel_kills_running_clone() {
    let h = harness(HANGING_GIT).await;
    let mut rx = h.runner.subscribe();

    let id = h.runner.submit(git_config());
    wait_until(&h.runner, &id, |_| h.runner.processes().is_tracked(&id)).await;

    assert!(h.runner.cancel(&id));
    let events = collect_events(&mut rx, &id).await;
    assert!(matches!(events.last(), Some(DeploymentEvent::Cancelled { .. })));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while h.runner.processes().is_tracked(&id) {
        assert!(tokio::time::Instant::now() < deadline, "process still tracked");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Give the pipeline task a moment to observe the kill
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = h.runner.get_status(&id).unwrap();
    assert_eq!(status.state, DeploymentState::Cancelled);
    assert!(status.error.is_none());
    assert!(status.url.is_none());

    // A second cancel is a no-op
    assert!(!h.runner.cancel(&id));
}

#[tokio::test]
async fn test_cancel_unknown_or_finished() {
    let h = harness(FAKE_GIT).await;
    assert!(!h.runner.cancel("does-not-exist"));

    let id = h.runner.submit(git_config());
    let status = wait_for_terminal(&h.runner, &id).await;
    assert_eq!(status.state, DeploymentState::Ready);

    assert!(!h.runner.cancel(&id));
    assert_eq!(
        h.runner.get_status(&id).unwrap().state,
        DeploymentState::Ready
    );
}

#[tokio::test]
async fn test_stage_timeout_fails_deployment() {
    let h = harness_with(HANGING_GIT, |options| {
        options.stage_timeout = Some(Duration::from_millis(500));
    })
    .await;

    let id = h.runner.submit(git_config());
    let status = wait_for_terminal(&h.runner, &id).await;

    assert_eq!(status.state, DeploymentState::Error);
    assert!(status.error.unwrap().contains("timed out"));
    assert!(!h.runner.processes().is_tracked(&id));
}

#[tokio::test]
async fn test_template_source_is_copied() {
    let h = harness(FAKE_GIT).await;

    let template = h.layout.templates_dir().subdir("starter");
    template.subdir("public").create().await.unwrap();
    std::fs::write(template.path().join("public/index.html"), "<h1>starter</h1>").unwrap();

    let mut config = DeploymentConfig::new("proj", "user-1", SourceType::Template);
    config.source_url = Some("starter".to_string());
    config.build_command = Some("true".to_string());
    config.output_directory = Some("public".to_string());
    let id = h.runner.submit(config);

    let status = wait_for_terminal(&h.runner, &id).await;
    assert_eq!(status.state, DeploymentState::Ready, "logs: {:?}", status.logs);
    assert!(h.edge.artifacts_for(&id).file("index.html").exists().await);
}

#[tokio::test]
async fn test_missing_template_fails() {
    let h = harness(FAKE_GIT).await;

    let mut config = DeploymentConfig::new("proj", "user-1", SourceType::Template);
    config.source_url = Some("nope".to_string());
    let id = h.runner.submit(config);

    let status = wait_for_terminal(&h.runner, &id).await;
    assert_eq!(status.state, DeploymentState::Error);
    assert_eq!(status.error.as_deref(), Some("Template not found: nope"));
}

#[tokio::test]
async fn test_upload_archive_is_extracted() {
    let h = harness(FAKE_GIT).await;

    let staging = h.layout.base().subdir("staging");
    staging.subdir("site").create().await.unwrap();
    std::fs::write(staging.path().join("site/index.html"), "<h1>upload</h1>").unwrap();
    let archive = h.layout.uploads_dir().path().join("site.tar");
    let tar = std::process::Command::new("tar")
        .arg("-cf")
        .arg(&archive)
        .arg("-C")
        .arg(staging.path())
        .arg("site")
        .status()
        .unwrap();
    assert!(tar.success());

    let mut config = DeploymentConfig::new("proj", "user-1", SourceType::Upload);
    config.source_url = Some("site.tar".to_string());
    config.build_command = Some("true".to_string());
    config.output_directory = Some("site".to_string());
    let id = h.runner.submit(config);

    let status = wait_for_terminal(&h.runner, &id).await;
    assert_eq!(status.state, DeploymentState::Ready, "logs: {:?}", status.logs);
    assert!(h.edge.artifacts_for(&id).file("index.html").exists().await);
}

#[tokio::test]
async fn test_upload_rejects_path_escape() {
    let h = harness(FAKE_GIT).await;

    let mut config = DeploymentConfig::new("proj", "user-1", SourceType::Upload);
    config.source_url = Some("../secrets.tar".to_string());
    let id = h.runner.submit(config);

    let status = wait_for_terminal(&h.runner, &id).await;
    assert_eq!(status.state, DeploymentState::Error);
    assert!(status.error.unwrap().contains("Invalid source name"));
}

#[tokio::test]
async fn test_concurrency_limit_keeps_extra_deployments_queued() {
    let h = harness_with(HANGING_GIT, |options| {
        options.max_concurrent_deployments = 1;
    })
    .await;

    let first = h.runner.submit(git_config());
    wait_until(&h.runner, &first, |_| h.runner.processes().is_tracked(&first)).await;

    let second = h.runner.submit(git_config());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        h.runner.get_status(&second).unwrap().state,
        DeploymentState::Queued
    );

    // Cancelling a queued deployment is allowed and it never starts
    assert!(h.runner.cancel(&second));
    assert!(h.runner.cancel(&first));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        h.runner.get_status(&second).unwrap().state,
        DeploymentState::Cancelled
    );
    assert!(!h.runner.processes().is_tracked(&second));
}

#[tokio::test]
async fn test_cleanup_removes_old_finished_deployments() {
    let h = harness(FAKE_GIT).await;

    let old = h.runner.submit(git_config());
    let recent = h.runner.submit(git_config());
    wait_for_terminal(&h.runner, &old).await;
    wait_for_terminal(&h.runner, &recent).await;

    let long_ago = Utc::now() - chrono::Duration::days(30);
    h.runner.store().update(&old, |s| {
        s.created_at = long_ago;
        for log in s.logs.iter_mut() {
            log.timestamp = long_ago;
        }
    });

    assert_eq!(h.runner.cleanup(7).await, 1);
    assert!(h.runner.get_status(&old).is_none());
    assert!(h.runner.get_status(&recent).is_some());
    assert!(!h.layout.workspaces_dir().subdir(&old).exists().await);
    assert!(!h.edge.artifacts_for(&old).exists().await);
    assert!(h.edge.artifacts_for(&recent).exists().await);

    // Nothing left to remove
    assert_eq!(h.runner.cleanup(7).await, 0);
}

/// Wait for the progress event a stage emits when it starts
async fn wait_for_progress(
    rx: &mut broadcast::Receiver<DeploymentEvent>,
    id: &str,
    expected: u8,
) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(20), rx.recv())
            .await
            .expect("timed out waiting for progress")
            .unwrap();
        match event {
            DeploymentEvent::Progress {
                deployment_id,
                progress,
                ..
            } if deployment_id == id && progress == expected => return,
            DeploymentEvent::Failed { deployment_id, error } if deployment_id == id => {
                panic!("deployment failed before reaching {}: {}", expected, error)
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_cancel_at_stage_start_stops_the_stage_command() {
    let script = format!("{}echo '{{}}' > \"$last/package.json\"\n", FAKE_GIT);
    let h = harness_with(&script, |options| {
        options.max_concurrent_deployments = 1;
    })
    .await;
    let slow = "sleep 0.3; touch ran_after_cancel";

    for (progress, stage) in [(40, "install"), (60, "build")] {
        for _ in 0..5 {
            let mut rx = h.runner.subscribe();
            let mut config = git_config();
            if stage == "install" {
                config.install_command = Some(slow.to_string());
            } else {
                config.install_command = Some("true".to_string());
                config.build_command = Some(slow.to_string());
            }

            let id = h.runner.submit(config);
            wait_for_progress(&mut rx, &id, progress).await;
            assert!(h.runner.cancel(&id));

            tokio::time::sleep(Duration::from_millis(800)).await;
            let status = h.runner.get_status(&id).unwrap();
            assert_eq!(status.state, DeploymentState::Cancelled);
            assert!(!h.runner.processes().is_tracked(&id));
            assert!(
                !h.layout
                    .workspaces_dir()
                    .subdir(&id)
                    .file("ran_after_cancel")
                    .exists()
                    .await,
                "{} command finished after cancel",
                stage
            );
        }
    }

    // The single pipeline slot was released by every cancelled run
    let id = h.runner.submit(git_config());
    let status = wait_for_terminal(&h.runner, &id).await;
    assert_eq!(status.state, DeploymentState::Ready, "logs: {:?}", status.logs);
}

#[tokio::test]
async fn test_output_directory_must_stay_in_workspace() {
    let h = harness(FAKE_GIT).await;
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(outside.path().join("secret.txt"), "token").unwrap();

    for output in [outside.path().display().to_string(), "../..".to_string()] {
        let mut config = git_config();
        config.output_directory = Some(output.clone());
        let id = h.runner.submit(config);

        let status = wait_for_terminal(&h.runner, &id).await;
        assert_eq!(status.state, DeploymentState::Error, "{} accepted", output);
        assert!(status
            .error
            .unwrap()
            .starts_with("Output directory must stay inside the workspace"));
        assert!(!h.edge.artifacts_for(&id).exists().await);
        assert!(!h.layout.workspaces_dir().subdir(&id).exists().await);
    }
}

/// Local edge that cancels the deployment while routing, after publish
struct CancelWhileRouting {
    inner: LocalEdge,
    runner: OnceLock<PipelineRunner>,
}

#[async_trait]
impl EdgeBackend for CancelWhileRouting {
    fn name(&self) -> &str {
        "cancel-while-routing"
    }

    async fn publish(
        &self,
        deployment_id: &str,
        config: &DeploymentConfig,
        output: &Dir,
    ) -> Result<EdgeRelease, DeployerError> {
        self.inner.publish(deployment_id, config, output).await
    }

    async fn configure_routing(
        &self,
        deployment_id: &str,
        config: &DeploymentConfig,
        release: &EdgeRelease,
    ) -> Result<Vec<String>, DeployerError> {
        if let Some(runner) = self.runner.get() {
            assert!(runner.cancel(deployment_id));
        }
        self.inner.configure_routing(deployment_id, config, release).await
    }

    async fn unpublish(&self, deployment_id: &str) -> Result<(), DeployerError> {
        self.inner.unpublish(deployment_id).await
    }
}

#[tokio::test]
async fn test_cancel_after_publish_withdraws_release() {
    let root = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(root.path().join("data"));
    layout.setup().await.unwrap();
    let git = root.path().join("fake-git");
    write_script(&git, FAKE_GIT);

    let mut options = PipelineOptions::from_layout(&layout);
    options.source.git_program = git.display().to_string();
    let local = LocalEdge::new(layout.artifacts_dir(), "webduh.test");
    let edge = Arc::new(CancelWhileRouting {
        inner: local.clone(),
        runner: OnceLock::new(),
    });
    let runner = PipelineRunner::new(options, edge.clone());
    assert!(edge.runner.set(runner.clone()).is_ok());

    let mut rx = runner.subscribe();
    let id = runner.submit(git_config());
    let events = collect_events(&mut rx, &id).await;
    assert!(matches!(events.last(), Some(DeploymentEvent::Cancelled { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, DeploymentEvent::Completed { .. })));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while local.artifacts_for(&id).exists().await {
        assert!(tokio::time::Instant::now() < deadline, "artifacts still published");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let status = runner.get_status(&id).unwrap();
    assert_eq!(status.state, DeploymentState::Cancelled);
    assert!(status.url.is_none());
    assert!(status.preview_url.is_none());
    assert!(status.metrics.is_none());
}
