//! Commit-log backend: history, persistence, mirroring and lock contention

use machine_vault::core::lock::{FileLockBackend, LockCoordinator};
use machine_vault::{
    CommitRecord, LockConfig, RepoError, Replica, Repository, RepositoryBuilder, Result,
};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn sealed_machine(repo: &Repository, name: &str) {
    repo.create_machine(name).unwrap();
    repo.seal_version(name, "version1").unwrap();
}

#[test]
fn test_history_records_every_mutation() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repository::open(temp_dir.path().join("repo")).unwrap();

    sealed_machine(&repo, "door");
    repo.create_instance("door", "version1").unwrap();

    let history = repo.history().unwrap();
    let messages: Vec<&str> = history.iter().map(|r| r.message.as_str()).collect();
    assert_eq!(
        messages,
        vec![
            "Initialized repository",
            "Added 'door' machine",
            "Sealed 'version1' version of 'door' machine",
            "Added 'instance1' instance to 'version1' version of 'door' machine",
        ]
    );

    assert!(history[0].parent.is_none());
    for pair in history.windows(2) {
        assert_eq!(pair[1].parent.as_deref(), Some(pair[0].id.as_str()));
    }
    assert!(history[1]
        .staged
        .contains(&"machines/door/versions/version1/model.scxml".to_string()));
    assert_eq!(repo.verify_history().unwrap(), 4);
}

#[test]
fn test_tampered_history_fails_verification() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("repo");
    let repo = Repository::open(&root).unwrap();
    repo.create_machine("door").unwrap();

    let log = root.join(".history").join("commits.log");
    let text = fs::read_to_string(&log).unwrap();
    fs::write(&log, text.replace("Added 'door' machine", "Added 'gate' machine")).unwrap();

    assert!(matches!(
        repo.verify_history(),
        Err(RepoError::StorageFailure(_))
    ));
}

#[test]
fn test_reopen_keeps_state() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("repo");

    {
        let repo = Repository::open(&root).unwrap();
        sealed_machine(&repo, "door");
        repo.create_instance("door", "version1").unwrap();
        repo.create_version("door").unwrap();
    }

    let repo = Repository::open(&root).unwrap();
    assert_eq!(repo.list_machines().unwrap(), vec!["door"]);
    assert_eq!(repo.version_keys("door").unwrap(), vec!["version1", "version2"]);
    assert!(repo.get_version_info("door", "version1").unwrap().is_sealed);
    assert!(!repo.get_version_info("door", "version2").unwrap().is_sealed);

    // Allocation continues after the existing keys
    assert_eq!(repo.create_instance("door", "version1").unwrap(), "instance2");

    // The chain continues from the previous head
    assert_eq!(repo.verify_history().unwrap(), 6);
}

#[test]
fn test_remote_directory_mirrors_commits() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("repo");
    let mirror = temp_dir.path().join("mirror");

    let repo = RepositoryBuilder::new()
        .path(&root)
        .remote(&mirror)
        .build()
        .unwrap();
    sealed_machine(&repo, "door");
    sealed_machine(&repo, "gate");
    repo.remove_machine("gate").unwrap();

    let model = "machines/door/versions/version1/model.scxml";
    assert_eq!(
        fs::read(mirror.join(model)).unwrap(),
        fs::read(root.join(model)).unwrap()
    );
    assert_eq!(
        fs::read(mirror.join("manifest.json")).unwrap(),
        fs::read(root.join("manifest.json")).unwrap()
    );
    assert!(!mirror
        .join("machines/gate/versions/version1/model.scxml")
        .exists());

    // The mirror log is a copy of the local one
    assert_eq!(
        fs::read_to_string(mirror.join(".history/commits.log")).unwrap(),
        fs::read_to_string(root.join(".history/commits.log")).unwrap()
    );
}

struct Offline;

impl Replica for Offline {
    fn describe(&self) -> String {
        "offline".to_string()
    }

    fn replicate(&self, _record: &CommitRecord, _files: &[(String, Vec<u8>)]) -> Result<()> {
        Err(RepoError::StorageFailure("remote unreachable".to_string()))
    }
}

#[test]
fn test_replication_failure_reports_but_keeps_commit() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("repo");

    // Initialization replicates too, so a dead replica fails the first open
    let first = RepositoryBuilder::new()
        .path(&root)
        .replica(Arc::new(Offline))
        .build();
    match first {
        Err(e) => assert!(e.is_committed_locally()),
        Ok(_) => panic!("open with an offline replica should report the failure"),
    }

    let repo = RepositoryBuilder::new()
        .path(&root)
        .replica(Arc::new(Offline))
        .build()
        .unwrap();

    let err = repo.create_machine("door").unwrap_err();
    assert!(matches!(err, RepoError::ReplicationFailed { .. }));
    assert!(err.is_committed_locally());

    assert_eq!(repo.list_machines().unwrap(), vec!["door"]);
    assert_eq!(repo.history().unwrap().len(), 2);
}

#[test]
fn test_lock_timeout_has_no_side_effects() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("repo");

    let repo = RepositoryBuilder::new()
        .path(&root)
        .lock_config(LockConfig {
            retry_count: 2,
            retry_delay_ms: 5,
            retry_jitter_ms: 5,
            ..LockConfig::default()
        })
        .build()
        .unwrap();
    sealed_machine(&repo, "door");
    let commits = repo.history().unwrap().len();

    // Another process holding the repository lock
    let other = LockCoordinator::new(
        Arc::new(FileLockBackend::new(root.join(".history").join("locks"))),
        LockConfig::default(),
    );
    let held = other
        .acquire("lock:repository", Duration::from_secs(30))
        .unwrap();

    match repo.create_instance("door", "version1") {
        Err(RepoError::LockTimeout { key, attempts }) => {
            assert_eq!(key, "lock:repository");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected LockTimeout, got {:?}", other),
    }
    assert!(matches!(
        repo.create_machine("gate"),
        Err(RepoError::LockTimeout { .. })
    ));

    assert!(repo.instance_keys("door", "version1").unwrap().is_empty());
    assert_eq!(repo.list_machines().unwrap(), vec!["door"]);
    assert_eq!(repo.history().unwrap().len(), commits);

    drop(held);
    assert_eq!(repo.create_instance("door", "version1").unwrap(), "instance1");
}

#[test]
fn test_two_handles_share_one_history() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("repo");

    let a = Repository::open(&root).unwrap();
    let b = Repository::open(&root).unwrap();

    sealed_machine(&a, "door");
    assert_eq!(b.create_instance("door", "version1").unwrap(), "instance1");
    assert_eq!(a.create_instance("door", "version1").unwrap(), "instance2");

    assert_eq!(a.verify_history().unwrap(), 5);
}

#[test]
fn test_open_from_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("repo");
    let config_path = temp_dir.path().join("vault.toml");
    fs::write(
        &config_path,
        format!(
            "[backend]\nkind = \"commit_log\"\npath = {:?}\n\n[lock]\nretry_count = 3\n",
            root.display().to_string()
        ),
    )
    .unwrap();

    let config = machine_vault::RepositoryConfig::load(&config_path).unwrap();
    let repo = Repository::from_config(config).unwrap();
    repo.create_machine("door").unwrap();

    assert!(root.join("machines/door/versions/version1/model.scxml").exists());
    assert!(root.join("config.json").exists());
}

#[test]
fn test_failed_commit_leaves_version_untouched() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("repo");
    let repo = Repository::open(&root).unwrap();
    repo.create_machine("door").unwrap();
    let model = repo.get_model("door", "version1").unwrap();

    let log = root.join(".history").join("commits.log");
    let saved = fs::read(&log).unwrap();
    fs::remove_file(&log).unwrap();
    fs::create_dir(&log).unwrap();

    assert!(repo.set_model("door", "version1", b"<changed/>").is_err());
    assert_eq!(repo.get_model("door", "version1").unwrap(), model);

    assert!(repo.seal_version("door", "version1").is_err());
    assert!(!repo.get_version_info("door", "version1").unwrap().is_sealed);

    fs::remove_dir(&log).unwrap();
    fs::write(&log, saved).unwrap();
    repo.seal_version("door", "version1").unwrap();
    assert_eq!(repo.verify_history().unwrap(), 3);
}

#[test]
fn test_unfinished_commit_line_does_not_block_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("repo");
    {
        let repo = Repository::open(&root).unwrap();
        sealed_machine(&repo, "door");
    }

    // Simulate a crash halfway through an append
    let log = root.join(".history").join("commits.log");
    let mut text = fs::read_to_string(&log).unwrap();
    text.push_str(r#"{"id":"9c1e","parent":"#);
    fs::write(&log, text).unwrap();

    let repo = Repository::open(&root).unwrap();
    assert_eq!(repo.list_machines().unwrap(), vec!["door"]);
    assert_eq!(repo.history().unwrap().len(), 3);

    assert_eq!(repo.create_instance("door", "version1").unwrap(), "instance1");
    assert_eq!(repo.verify_history().unwrap(), 4);
}
