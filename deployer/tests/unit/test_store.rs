//! Status store unit tests

use chrono::{Duration, Utc};

use webduh_deployer::deploy::fsm::{DeploymentState, Transition};
use webduh_deployer::deploy::store::StatusStore;
use webduh_deployer::errors::DeployerError;
use webduh_deployer::models::deployment::{
    DeploymentLog, DeploymentStatus, LogSource, MAX_LOG_ENTRIES,
};

fn aged_status(id: &str, state: DeploymentState, days: i64) -> DeploymentStatus {
    let mut status = DeploymentStatus::queued(id, "proj-1");
    status.state = state;
    status.created_at = Utc::now() - Duration::days(days);
    status.updated_at = status.created_at;
    status
}

#[test]
fn test_store_insert_and_get() {
    let store = StatusStore::new();
    assert!(store.insert(DeploymentStatus::queued("dep-1", "proj-1")));

    let status = store.get("dep-1").unwrap();
    assert_eq!(status.project_id, "proj-1");
    assert_eq!(status.state, DeploymentState::Queued);
    assert_eq!(status.progress, 0);
    assert_eq!(store.len(), 1);
}

#[test]
fn test_store_rejects_duplicate_ids() {
    let store = StatusStore::new();
    assert!(store.insert(DeploymentStatus::queued("dep-1", "proj-1")));
    assert!(!store.insert(DeploymentStatus::queued("dep-1", "proj-2")));
    assert_eq!(store.get("dep-1").unwrap().project_id, "proj-1");
}

#[test]
fn test_store_unknown_id_has_no_side_effects() {
    let store = StatusStore::new();

    assert!(store.get("missing").is_none());
    assert!(store.state("missing").is_none());
    assert!(!store.append_log("missing", DeploymentLog::info(LogSource::Build, "hi")));
    assert!(store.set_progress("missing", 50).is_none());
    assert!(matches!(
        store.transition("missing", Transition::Cancel),
        Err(DeployerError::NotFound(_))
    ));
    assert!(store.is_empty());
}

#[test]
fn test_store_logs_keep_most_recent_entries() {
    let store = StatusStore::new();
    store.insert(DeploymentStatus::queued("dep-1", "proj-1"));

    for i in 0..MAX_LOG_ENTRIES + 25 {
        store.append_log("dep-1", DeploymentLog::info(LogSource::Build, format!("line {}", i)));
    }

    let status = store.get("dep-1").unwrap();
    assert_eq!(status.logs.len(), MAX_LOG_ENTRIES);
    assert_eq!(status.logs.front().unwrap().message, "line 25");
    assert_eq!(
        status.logs.back().unwrap().message,
        format!("line {}", MAX_LOG_ENTRIES + 24)
    );
}

#[test]
fn test_store_progress_never_decreases() {
    let store = StatusStore::new();
    store.insert(DeploymentStatus::queued("dep-1", "proj-1"));

    assert_eq!(store.set_progress("dep-1", 40), Some(40));
    assert_eq!(store.set_progress("dep-1", 20), Some(40));
    assert_eq!(store.set_progress("dep-1", 250), Some(100));
    assert_eq!(store.get("dep-1").unwrap().progress, 100);
}

#[test]
fn test_store_transition_sets_error_and_touches_updated_at() {
    let store = StatusStore::new();
    let status = aged_status("dep-1", DeploymentState::Queued, 1);
    let before = status.updated_at;
    store.insert(status);

    store.transition("dep-1", Transition::Build).unwrap();
    let state = store
        .transition("dep-1", Transition::Fail("build broke".to_string()))
        .unwrap();

    let status = store.get("dep-1").unwrap();
    assert_eq!(state, DeploymentState::Error);
    assert_eq!(status.error.as_deref(), Some("build broke"));
    assert!(status.updated_at > before);

    // Terminal states reject further transitions and keep their error
    assert!(store.transition("dep-1", Transition::Cancel).is_err());
    assert_eq!(store.state("dep-1"), Some(DeploymentState::Error));
}

#[test]
fn test_store_list_newest_first() {
    let store = StatusStore::new();
    store.insert(aged_status("old", DeploymentState::Ready, 3));
    store.insert(aged_status("new", DeploymentState::Ready, 1));
    store.insert(aged_status("mid", DeploymentState::Ready, 2));

    let ids: Vec<String> = store.list().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["new", "mid", "old"]);
}

#[test]
fn test_store_remove_older_than_skips_in_flight() {
    let store = StatusStore::new();
    store.insert(aged_status("old-ready", DeploymentState::Ready, 10));
    store.insert(aged_status("old-error", DeploymentState::Error, 10));
    store.insert(aged_status("old-building", DeploymentState::Building, 10));
    store.insert(aged_status("fresh-ready", DeploymentState::Ready, 1));

    let mut removed = store.remove_older_than(Utc::now() - Duration::days(7));
    removed.sort();

    assert_eq!(removed, vec!["old-error", "old-ready"]);
    assert!(store.contains("old-building"));
    assert!(store.contains("fresh-ready"));
    assert_eq!(store.len(), 2);
}

#[test]
fn test_store_age_uses_first_log_entry() {
    let store = StatusStore::new();
    let mut status = aged_status("dep-1", DeploymentState::Ready, 1);
    let mut first = DeploymentLog::info(LogSource::Build, "queued");
    first.timestamp = Utc::now() - Duration::days(30);
    status.push_log(first);
    store.insert(status);

    assert_eq!(store.remove_older_than(Utc::now() - Duration::days(7)), vec!["dep-1"]);
}

#[test]
fn test_store_transition_with_skips_update_when_rejected() {
    let store = StatusStore::new();
    store.insert(DeploymentStatus::queued("dep-1", "proj-1"));
    store.transition("dep-1", Transition::Build).unwrap();
    store.transition("dep-1", Transition::Deploy).unwrap();
    store.transition("dep-1", Transition::Cancel).unwrap();

    let result = store.transition_with("dep-1", Transition::Complete, |s| {
        s.url = Some("https://proj-1-dep1.webduh.app".to_string());
    });

    assert!(matches!(result, Err(DeployerError::InvalidTransition(_))));
    let status = store.get("dep-1").unwrap();
    assert_eq!(status.state, DeploymentState::Cancelled);
    assert!(status.url.is_none());
}

#[test]
fn test_store_transition_with_applies_update_on_success() {
    let store = StatusStore::new();
    store.insert(DeploymentStatus::queued("dep-1", "proj-1"));
    store.transition("dep-1", Transition::Build).unwrap();
    store.transition("dep-1", Transition::Deploy).unwrap();

    let state = store
        .transition_with("dep-1", Transition::Complete, |s| {
            s.url = Some("https://proj-1-dep1.webduh.app".to_string());
        })
        .unwrap();

    assert_eq!(state, DeploymentState::Ready);
    assert!(store.get("dep-1").unwrap().url.is_some());
}
