//! Fetch cache integration tests.
//!
//! These tests verify the freshness window, that failed rebuilds never leave
//! a slot behind, and that real git clones flow through the cache.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_test::{assert_err, assert_ok};

use benchdag::cache::{set_mtime, FingerprintCache};
use benchdag::git::GitFetcher;
use benchdag::Error;

use crate::fixtures::{MockFetcher, TestRepo};

const HOUR: Duration = Duration::from_secs(3600);
const LOCATOR: &str = "https://gitlab.com/bsc_sod2d/sod2d_gitlab";

fn mock_cache(dir: &tempfile::TempDir) -> (FingerprintCache, Arc<MockFetcher>) {
    let fetcher = Arc::new(MockFetcher::default());
    let cache = FingerprintCache::new(dir.path().join("fetch"), 24 * HOUR, fetcher.clone());
    (cache, fetcher)
}

/// Test: freshness window
/// Given a 24h window
/// When the slot is 25h old it is rebuilt; when it is 1h old it is reused
#[tokio::test]
async fn test_freshness_window() {
    let dir = tempfile::TempDir::new().unwrap();
    let (cache, fetcher) = mock_cache(&dir);

    let slot = assert_ok!(cache.resolve(LOCATOR, Some("master")).await).path().to_path_buf();
    assert_eq!(fetcher.calls(), 1);

    set_mtime(&slot, SystemTime::now() - 25 * HOUR).unwrap();
    let rebuilt = assert_ok!(cache.resolve(LOCATOR, Some("master")).await);
    assert!(!rebuilt.is_hit());
    assert_eq!(fetcher.calls(), 2);

    set_mtime(&slot, SystemTime::now() - HOUR).unwrap();
    let reused = assert_ok!(cache.resolve(LOCATOR, Some("master")).await);
    assert!(reused.is_hit());
    assert_eq!(fetcher.calls(), 2);
}

/// Test: a failed rebuild leaves no fresh slot
/// Given a fetch that fails after writing partial content
/// When resolve is called again after the failure clears
/// Then the fetch collaborator runs again and the slot is complete
#[tokio::test]
async fn test_failed_fetch_is_retried_next_time() {
    let dir = tempfile::TempDir::new().unwrap();
    let (cache, fetcher) = mock_cache(&dir);
    fetcher.set_failing(true);

    let err = assert_err!(cache.resolve(LOCATOR, None).await);
    assert!(matches!(err, Error::Fetch { .. }));
    assert!(!cache.slot_path(LOCATOR, None).exists());

    fetcher.set_failing(false);
    let resolution = assert_ok!(cache.resolve(LOCATOR, None).await);
    assert!(!resolution.is_hit());
    assert_eq!(fetcher.calls(), 2);
    let marker = std::fs::read_to_string(resolution.path().join("CMakeLists.txt")).unwrap();
    assert!(marker.ends_with("#2"), "{}", marker);
}

/// Test: a timed-out fetch cannot clobber the next rebuild
/// Given a fetch that stalls past the timeout and then fails
/// When the next resolve of the same key follows immediately
/// Then it waits for the stalled fetch to exit and its slot survives
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_out_fetch_then_resolve() {
    let dir = tempfile::TempDir::new().unwrap();
    let fetcher = Arc::new(MockFetcher::default());
    let cache = FingerprintCache::new(dir.path().join("fetch"), 24 * HOUR, fetcher.clone())
        .with_fetch_timeout(Duration::from_millis(100));
    fetcher.set_failing(true);
    fetcher.stall_next(Duration::from_millis(400));

    let err = assert_err!(cache.resolve(LOCATOR, None).await);
    assert!(err.to_string().contains("timed out"), "{}", err);

    fetcher.set_failing(false);
    let rebuilt = assert_ok!(cache.resolve(LOCATOR, None).await);
    assert_eq!(fetcher.calls(), 2);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let marker = std::fs::read_to_string(rebuilt.path().join("CMakeLists.txt")).unwrap();
    assert!(marker.ends_with("#2"), "{}", marker);
    assert!(assert_ok!(cache.resolve(LOCATOR, None).await).is_hit());
}

/// Test: selectors are part of the identity
#[tokio::test]
async fn test_branches_get_separate_slots() {
    let dir = tempfile::TempDir::new().unwrap();
    let (cache, fetcher) = mock_cache(&dir);

    let master = assert_ok!(cache.resolve(LOCATOR, Some("master")).await);
    let opt = assert_ok!(cache.resolve(LOCATOR, Some("bsc-epicure-opt")).await);
    let none = assert_ok!(cache.resolve(LOCATOR, None).await);
    assert_ne!(master.path(), opt.path());
    assert_ne!(master.path(), none.path());
    assert_eq!(fetcher.calls(), 3);
}

/// Test: concurrent builds of one checkout fetch once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_materialize_fetches_once() {
    let dir = tempfile::TempDir::new().unwrap();
    let (cache, fetcher) = mock_cache(&dir);
    let cache = Arc::new(cache);

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let cache = Arc::clone(&cache);
            let dest = dir.path().join(format!("work-{}", i)).join("src");
            tokio::spawn(async move { cache.materialize(LOCATOR, Some("master"), &dest).await })
        })
        .collect();
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }
    assert_eq!(fetcher.calls(), 1);
    for i in 0..6 {
        assert!(dir.path().join(format!("work-{}", i)).join("src/CMakeLists.txt").exists());
    }
}

/// Test: git clones through the cache
/// Given a local repository with master and feature branches
/// When each branch is materialized
/// Then each destination has that branch's tree, and a stale slot picks up
/// new commits on rebuild
#[tokio::test]
async fn test_git_clone_through_cache() {
    let repo = TestRepo::new();
    repo.branch_with_file("feature", "feature.txt", "fast path\n");

    let cache = FingerprintCache::new(
        repo.scratch("fetch"),
        24 * HOUR,
        Arc::new(GitFetcher::new(None)),
    );

    let master_dest = repo.scratch("work/master/src");
    let feature_dest = repo.scratch("work/feature/src");
    assert_ok!(cache.materialize(&repo.locator(), Some("master"), &master_dest).await);
    assert_ok!(cache.materialize(&repo.locator(), Some("feature"), &feature_dest).await);

    assert!(master_dest.join("README.md").exists());
    assert!(!master_dest.join("feature.txt").exists());
    assert!(feature_dest.join("feature.txt").exists());
    assert!(feature_dest.join(".git").exists());

    repo.commit_on_master("solver.f90", "program sod2d\n");
    let hit = assert_ok!(cache.resolve(&repo.locator(), Some("master")).await);
    assert!(hit.is_hit());
    assert!(!hit.path().join("solver.f90").exists());

    set_mtime(hit.path(), SystemTime::now() - 48 * HOUR).unwrap();
    let rebuilt = assert_ok!(cache.resolve(&repo.locator(), Some("master")).await);
    assert!(!rebuilt.is_hit());
    assert!(rebuilt.path().join("solver.f90").exists());
}

/// Test: an unknown branch is a fetch error and leaves nothing behind
#[tokio::test]
async fn test_git_unknown_branch() {
    let repo = TestRepo::new();
    let cache = FingerprintCache::new(
        repo.scratch("fetch"),
        24 * HOUR,
        Arc::new(GitFetcher::new(None)),
    );
    let err = assert_err!(cache.resolve(&repo.locator(), Some("no-such-branch")).await);
    assert!(matches!(err, Error::Fetch { .. }));
    let leftovers = std::fs::read_dir(cache.root()).unwrap().count();
    assert_eq!(leftovers, 0);
}
