mod common;

use common::{git_available, logged_clones, logging_git, python_available, CountingBackend, SourceRepo};
use pinrun_core::config::{BackendConfig, CacheConfig, Settings, SubprocessConfig};
use pinrun_core::errors::PinrunError;
use pinrun_core::snapshot::git::{self, Git};
use pinrun_core::snapshot::{PullOptions, RepoRef, SnapshotManager};
use pinrun_core::task::Task;
use pinrun_core::TaskRunner;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn settings(base: &Path, single_pull: bool, cache: CacheConfig) -> Settings {
    Settings {
        base_dir: base.to_path_buf(),
        single_pull,
        cache,
        ..Default::default()
    }
}

async fn counting_runner(base: &Path, single_pull: bool, backend: Arc<CountingBackend>) -> TaskRunner {
    TaskRunner::with_backend(settings(base, single_pull, CacheConfig::Memory), backend)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_single_pull_holds_commit_until_pulled_again() {
    if !git_available() {
        return;
    }
    let repo = SourceRepo::new();
    let first = repo.commit(&[("mod.py", "VALUE = 1\n")], "first");
    let base = TempDir::new().unwrap();
    let runner = counting_runner(base.path(), true, Arc::new(CountingBackend::new())).await;

    assert_eq!(runner.current_commit(&repo.url(), "master").await.unwrap(), first);

    let second = repo.commit(&[("mod.py", "VALUE = 2\n")], "second");
    assert_eq!(runner.current_commit(&repo.url(), "master").await.unwrap(), first);

    runner.pull_again(Some(&repo.url()), Some("master")).unwrap();
    assert_eq!(runner.current_commit(&repo.url(), "master").await.unwrap(), second);
}

#[tokio::test]
async fn test_default_policy_follows_the_remote() {
    if !git_available() {
        return;
    }
    let repo = SourceRepo::new();
    repo.commit(&[("mod.py", "VALUE = 1\n")], "first");
    let base = TempDir::new().unwrap();
    let runner = counting_runner(base.path(), false, Arc::new(CountingBackend::new())).await;

    runner.snapshot(&repo.url(), "master").await.unwrap();
    let second = repo.commit(&[("mod.py", "VALUE = 2\n")], "second");

    let snapshot = runner.snapshot(&repo.url(), "master").await.unwrap();
    assert_eq!(snapshot.commit_id, second);
    let content = std::fs::read_to_string(snapshot.local_path.join("mod.py")).unwrap();
    assert_eq!(content, "VALUE = 2\n");
}

#[tokio::test]
async fn test_branches_get_their_own_working_copies() {
    if !git_available() {
        return;
    }
    let repo = SourceRepo::new();
    let master = repo.commit(&[("mod.py", "VALUE = 1\n")], "first");
    repo.checkout_new_branch("feature/x");
    let feature = repo.commit(&[("mod.py", "VALUE = 2\n")], "feature");
    repo.checkout("master");

    let base = TempDir::new().unwrap();
    let runner = counting_runner(base.path(), false, Arc::new(CountingBackend::new())).await;

    let on_master = runner.snapshot(&repo.url(), "master").await.unwrap();
    let on_feature = runner.snapshot(&repo.url(), "feature/x").await.unwrap();

    assert_eq!(on_master.commit_id, master);
    assert_eq!(on_feature.commit_id, feature);
    assert_ne!(on_master.local_path, on_feature.local_path);
    assert!(on_master.local_path.starts_with(runner.base_dir()));
}

#[tokio::test]
async fn test_sibling_branch_lends_objects_to_new_clone() {
    if !git_available() {
        return;
    }
    let repo = SourceRepo::new();
    repo.commit(&[("mod.py", "VALUE = 1\n")], "first");
    repo.checkout_new_branch("develop");
    let develop = repo.commit(&[("mod.py", "VALUE = 2\n")], "develop");
    repo.checkout("master");

    let tools = TempDir::new().unwrap();
    let (program, log) = logging_git(tools.path());
    let base = TempDir::new().unwrap();
    let manager = SnapshotManager::with_git(base.path(), false, Git::new(program));
    let full = PullOptions::full_history();

    let master = manager
        .snapshot(&RepoRef::new(repo.url(), "master").unwrap(), &full)
        .await
        .unwrap();
    assert!(!git::is_shallow(&master.local_path));

    let snapshot = manager
        .snapshot(&RepoRef::new(repo.url(), "develop").unwrap(), &full)
        .await
        .unwrap();
    assert_eq!(snapshot.commit_id, develop);
    assert!(!snapshot.local_path.join(".git/objects/info/alternates").exists());

    let clones = logged_clones(&log);
    assert_eq!(clones.len(), 2);
    assert!(!clones[0].contains(&"--reference-if-able".to_string()));
    let position = clones[1]
        .iter()
        .position(|arg| arg == "--reference-if-able")
        .expect("second clone borrows from the first");
    assert_eq!(Path::new(&clones[1][position + 1]), master.local_path.as_path());
    assert!(clones[1].contains(&"--dissociate".to_string()));
}

#[tokio::test]
async fn test_shallow_reference_is_not_used() {
    if !git_available() {
        return;
    }
    let repo = SourceRepo::new();
    repo.commit(&[("mod.py", "VALUE = 1\n")], "first");
    repo.commit(&[("mod.py", "VALUE = 2\n")], "second");
    repo.checkout_new_branch("develop");
    let develop = repo.commit(&[("mod.py", "VALUE = 3\n")], "develop");
    repo.checkout("master");

    let tools = TempDir::new().unwrap();
    let (program, log) = logging_git(tools.path());
    let base = TempDir::new().unwrap();
    let manager = SnapshotManager::with_git(base.path(), false, Git::new(program));

    let master = manager
        .snapshot(&RepoRef::new(repo.url(), "master").unwrap(), &PullOptions::default())
        .await
        .unwrap();
    assert!(git::is_shallow(&master.local_path));

    let options = PullOptions {
        depth: None,
        reference: Some(master.local_path.clone()),
    };
    let snapshot = manager
        .snapshot(&RepoRef::new(repo.url(), "develop").unwrap(), &options)
        .await
        .unwrap();
    assert_eq!(snapshot.commit_id, develop);

    let clones = logged_clones(&log);
    assert_eq!(clones.len(), 2);
    assert!(clones
        .iter()
        .all(|clone| !clone.contains(&"--reference-if-able".to_string())));
}

#[tokio::test]
async fn test_missing_branch_is_repository_error() {
    if !git_available() {
        return;
    }
    let repo = SourceRepo::new();
    repo.commit(&[("mod.py", "")], "first");
    let base = TempDir::new().unwrap();
    let runner = counting_runner(base.path(), false, Arc::new(CountingBackend::new())).await;

    let err = runner.snapshot(&repo.url(), "does-not-exist").await.unwrap_err();
    assert!(matches!(err, PinrunError::Repository(_)));
}

#[tokio::test]
async fn test_pull_again_needs_repository_for_branch() {
    let base = TempDir::new().unwrap();
    let runner = counting_runner(base.path(), true, Arc::new(CountingBackend::new())).await;
    assert!(matches!(
        runner.pull_again(None, Some("master")),
        Err(PinrunError::Configuration(_))
    ));
    runner.pull_again(None, None).unwrap();
}

#[tokio::test]
async fn test_static_filename() {
    if !git_available() {
        return;
    }
    let outside = TempDir::new().unwrap();
    std::fs::write(outside.path().join("secret.txt"), "nope").unwrap();

    let repo = SourceRepo::new();
    repo.symlink(&outside.path().join("secret.txt"), "escape.txt");
    repo.commit(&[("docs/readme.md", "# hi\n"), ("mod.py", "")], "first");

    let base = TempDir::new().unwrap();
    let runner = counting_runner(base.path(), false, Arc::new(CountingBackend::new())).await;
    let snapshot = runner.snapshot(&repo.url(), "master").await.unwrap();

    let readme = runner
        .static_filename(&repo.url(), "master", "docs/readme.md")
        .await
        .unwrap();
    assert!(readme.is_absolute());
    assert!(readme.starts_with(&snapshot.local_path));
    assert_eq!(std::fs::read_to_string(readme).unwrap(), "# hi\n");

    for path in ["../../secret.txt", "docs/../../mod.py", "escape.txt"] {
        let err = runner
            .static_filename(&repo.url(), "master", path)
            .await
            .unwrap_err();
        assert!(matches!(err, PinrunError::FileOutOfRange(_)), "{} gave {:?}", path, err);
    }

    let err = runner
        .static_filename(&repo.url(), "master", "docs/missing.md")
        .await
        .unwrap_err();
    assert!(matches!(err, PinrunError::FileNotFound(_)));
}

#[tokio::test]
async fn test_second_run_is_served_from_cache() {
    if !git_available() {
        return;
    }
    let repo = SourceRepo::new();
    repo.commit(&[("mod.py", "")], "first");
    let base = TempDir::new().unwrap();
    let backend = Arc::new(CountingBackend::new());
    let runner = counting_runner(base.path(), false, backend.clone()).await;
    let task = Task::new("mod:add").unwrap().with_args(vec![json!(2), json!(3)]);

    let first = runner.run(&repo.url(), "master", &task).await.unwrap();
    let second = runner.run(&repo.url(), "master", &task).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(backend.executions(), 1);

    let other = Task::new("mod:add").unwrap().with_args(vec![json!(1), json!(1)]);
    runner.run(&repo.url(), "master", &other).await.unwrap();
    assert_eq!(backend.executions(), 2);

    // A new commit changes the fingerprint.
    repo.commit(&[("mod.py", "# changed\n")], "second");
    runner.run(&repo.url(), "master", &task).await.unwrap();
    assert_eq!(backend.executions(), 3);
}

#[tokio::test]
async fn test_concurrent_misses_execute_once() {
    if !git_available() {
        return;
    }
    let repo = SourceRepo::new();
    repo.commit(&[("mod.py", "")], "first");
    let base = TempDir::new().unwrap();
    let mut backend = CountingBackend::new();
    backend.delay = Some(Duration::from_millis(200));
    let backend = Arc::new(backend);
    let runner = Arc::new(counting_runner(base.path(), true, backend.clone()).await);
    runner.snapshot(&repo.url(), "master").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let runner = runner.clone();
        let url = repo.url();
        handles.push(tokio::spawn(async move {
            let task = Task::new("mod:add").unwrap().with_args(vec![json!(2), json!(3)]);
            runner.run(&url, "master", &task).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(backend.executions(), 1);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    if !git_available() {
        return;
    }
    let repo = SourceRepo::new();
    repo.commit(&[("mod.py", "")], "first");
    let base = TempDir::new().unwrap();
    let mut backend = CountingBackend::new();
    backend.fail_with_timeout = true;
    let backend = Arc::new(backend);
    let runner = counting_runner(base.path(), false, backend.clone()).await;
    let task = Task::new("mod:slow").unwrap();

    for _ in 0..2 {
        let err = runner.run(&repo.url(), "master", &task).await.unwrap_err();
        assert!(err.is_timeout());
    }
    assert_eq!(backend.executions(), 2);
}

#[tokio::test]
async fn test_fingerprint_matches_cache_key() {
    if !git_available() {
        return;
    }
    let repo = SourceRepo::new();
    repo.commit(&[("mod.py", ""), ("requirements.txt", "six\n")], "first");
    let base = TempDir::new().unwrap();
    let runner = counting_runner(base.path(), false, Arc::new(CountingBackend::new())).await;
    let task = Task::new("mod:add").unwrap();

    let fingerprint = runner.fingerprint(&repo.url(), "master", &task).await.unwrap();
    assert_eq!(fingerprint.len(), 64);
    assert_eq!(
        fingerprint,
        runner.fingerprint(&repo.url(), "master", &task).await.unwrap()
    );

    repo.commit(&[("requirements.txt", "six\nrequests\n")], "more requirements");
    assert_ne!(
        fingerprint,
        runner.fingerprint(&repo.url(), "master", &task).await.unwrap()
    );
}

#[tokio::test]
async fn test_unknown_requirements_refused_before_execution() {
    if !git_available() {
        return;
    }
    let repo = SourceRepo::new();
    repo.commit(&[("mod.py", ""), ("requirements.txt", "definitely-not-installed==1.0\n")], "first");
    let base = TempDir::new().unwrap();
    let runner = TaskRunner::new(settings(base.path(), false, CacheConfig::Null))
        .await
        .unwrap();

    let err = runner
        .run(&repo.url(), "master", &Task::new("mod:add").unwrap())
        .await
        .unwrap_err();
    match err {
        PinrunError::RequirementsMismatch { extras } => {
            assert_eq!(extras, vec!["definitely-not-installed==1.0".to_string()])
        }
        other => panic!("unexpected error {:?}", other),
    }
}

const MODULE: &str = r#"import time


def add(a, b):
    return a + b


def chatty(name):
    print("hello", name)
    return name.upper()


def slow():
    time.sleep(10)


def broken():
    raise ValueError("nope")
"#;

fn python_runner_settings(base: &Path, cache: CacheConfig) -> Settings {
    Settings {
        backend: BackendConfig::Subprocess(SubprocessConfig::default()),
        ..settings(base, false, cache)
    }
}

#[tokio::test]
async fn test_python_add() {
    if !git_available() || !python_available() {
        return;
    }
    let repo = SourceRepo::new();
    repo.commit(&[("mod.py", MODULE)], "module");
    let base = TempDir::new().unwrap();
    let runner = TaskRunner::new(python_runner_settings(base.path(), CacheConfig::Memory))
        .await
        .unwrap();

    let task = Task::new("mod:add").unwrap().with_args(vec![json!(2), json!(3)]);
    let result = runner.run(&repo.url(), "master", &task).await.unwrap();
    assert_eq!(result.output, json!(5));
    assert_eq!(result.stdout, "");
    assert_eq!(result.stderr, "");

    let chatty = Task::new("mod:chatty").unwrap().with_args(vec![json!("world")]);
    let result = runner.run(&repo.url(), "master", &chatty).await.unwrap();
    assert_eq!(result.output, json!("WORLD"));
    assert_eq!(result.stdout, "hello world\n");
}

#[tokio::test]
async fn test_python_failures() {
    if !git_available() || !python_available() {
        return;
    }
    let repo = SourceRepo::new();
    repo.commit(&[("mod.py", MODULE)], "module");
    let base = TempDir::new().unwrap();
    let runner = TaskRunner::new(python_runner_settings(base.path(), CacheConfig::Memory))
        .await
        .unwrap();

    let slow = Task::new("mod:slow").unwrap().with_timeout(1).unwrap();
    let err = runner.run(&repo.url(), "master", &slow).await.unwrap_err();
    assert!(err.is_timeout());

    let broken = Task::new("mod:broken").unwrap();
    match runner.run(&repo.url(), "master", &broken).await.unwrap_err() {
        PinrunError::Build { diagnostics, .. } => assert!(diagnostics.contains("ValueError")),
        other => panic!("unexpected error {:?}", other),
    }

    let missing = Task::new("mod:missing").unwrap();
    assert!(matches!(
        runner.run(&repo.url(), "master", &missing).await,
        Err(PinrunError::Build { .. })
    ));

    let fingerprint = runner.fingerprint(&repo.url(), "master", &slow).await.unwrap();
    assert_eq!(runner.cache().get(&fingerprint).await.unwrap(), None);
}
