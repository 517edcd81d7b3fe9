#![allow(missing_docs)]

use std::path::Path;
use std::process::{abort, Command};
use std::sync::Arc;

use gentree::admin::verify_tree;
use gentree::{
    CleanupState, GenTree, NoopMonitor, PageStore, Pager, PagerOptions, RecoveryCoordinator,
    Result, TreeError, TreeMonitor, TreeOptions, U64Layout,
};
use parking_lot::Mutex;
use tempfile::tempdir;

const PAGE_SIZE: u32 = 512;
const CAPACITY: usize = 8;

#[derive(Default)]
struct RecordingMonitor {
    events: Mutex<Vec<String>>,
}

impl RecordingMonitor {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl TreeMonitor for RecordingMonitor {
    fn startup_state(&self, clean: bool) {
        self.events.lock().push(format!("startup clean={clean}"));
    }

    fn cleanup_registered(&self) {
        self.events.lock().push("registered".into());
    }

    fn cleanup_started(&self) {
        self.events.lock().push("started".into());
    }

    fn cleanup_finished(&self, pages_visited: u64, pointers_cleaned: u64, _duration_ms: u64) {
        self.events
            .lock()
            .push(format!("finished pages={pages_visited} cleaned={pointers_cleaned}"));
    }

    fn cleanup_failed(&self, error: &TreeError) {
        self.events.lock().push(format!("failed {error}"));
    }
}

fn open(
    path: &Path,
    coordinator: &RecoveryCoordinator,
    monitor: Arc<dyn TreeMonitor>,
) -> Result<GenTree<U64Layout>> {
    let options = PagerOptions {
        page_size: PAGE_SIZE,
        ..PagerOptions::default()
    };
    GenTree::open(
        Arc::new(Pager::open(path, options)?),
        U64Layout,
        TreeOptions {
            node_capacity: Some(CAPACITY),
        },
        |_| {},
        coordinator,
        monitor,
    )
}

/// Checkpoints keys `0..500`, then keeps writing without a checkpoint.
fn write_then_crash(tree: &GenTree<U64Layout>) -> Result<()> {
    for key in 0..500u64 {
        tree.insert(key, key)?;
    }
    tree.checkpoint()?;
    for key in (0..500u64).step_by(7) {
        tree.insert(key, key + 1_000_000)?;
    }
    for key in 1_000..1_100u64 {
        tree.insert(key, key)?;
    }
    for key in (100..200u64).step_by(3) {
        tree.remove(&key)?;
    }
    tree.store().flush()
}

fn assert_checkpointed_contents(tree: &GenTree<U64Layout>) -> Result<()> {
    let entries = tree.seek_range(..)?.into_vec()?;
    let expected: Vec<(u64, u64)> = (0..500u64).map(|key| (key, key)).collect();
    assert_eq!(entries, expected);
    let report = verify_tree(tree).expect("verify");
    assert!(report.success, "{:?}", report.findings);
    assert_eq!(report.counts.crash_pointers, 0);
    Ok(())
}

#[test]
fn killed_writer_recovers_last_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("killed.gt");

    let child = Command::new(std::env::current_exe()?)
        .env("GENTREE_CRASH_PATH", &path)
        .arg("--nocapture")
        .arg("--ignored")
        .arg("--exact")
        .arg("crash_child_writes_then_aborts")
        .status()
        .expect("spawn child");
    assert!(!child.success(), "child should abort");

    let monitor = Arc::new(RecordingMonitor::default());
    let coordinator = RecoveryCoordinator::background();
    let tree = open(&path, &coordinator, monitor.clone())?;
    let handle = tree.cleanup_handle().expect("cleanup scheduled");
    let report = handle.wait()?;
    assert!(report.pointers_cleaned > 0);
    assert_eq!(
        handle.history(),
        vec![
            CleanupState::Idle,
            CleanupState::Scheduled,
            CleanupState::Running,
            CleanupState::Complete,
        ]
    );
    let finished: Vec<String> = monitor
        .events()
        .into_iter()
        .filter(|event| event.starts_with("finished"))
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(monitor.events()[0], "startup clean=false");

    assert_checkpointed_contents(&tree)?;
    tree.close()?;

    let monitor = Arc::new(RecordingMonitor::default());
    let tree = open(&path, &coordinator, monitor.clone())?;
    assert!(tree.cleanup_handle().is_none());
    assert_eq!(monitor.events(), vec!["startup clean=true".to_string()]);
    assert_checkpointed_contents(&tree)
}

#[test]
#[ignore]
fn crash_child_writes_then_aborts() -> Result<()> {
    let Ok(path) = std::env::var("GENTREE_CRASH_PATH") else {
        return Ok(());
    };
    let tree = open(
        Path::new(&path),
        &RecoveryCoordinator::immediate(),
        Arc::new(NoopMonitor),
    )?;
    write_then_crash(&tree)?;
    abort();
}

#[test]
fn repeated_crashes_reschedule_cleanup() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("twice.gt");
    let coordinator = RecoveryCoordinator::immediate();
    {
        let tree = open(&path, &coordinator, Arc::new(NoopMonitor))?;
        write_then_crash(&tree)?;
    }

    let first = {
        let tree = open(&path, &coordinator, Arc::new(NoopMonitor))?;
        let report = tree.cleanup_handle().expect("first pass").wait()?;
        tree.store().flush()?;
        report
    };
    assert!(first.pointers_cleaned > 0);

    let tree = open(&path, &coordinator, Arc::new(NoopMonitor))?;
    let second = tree.cleanup_handle().expect("second pass").wait()?;
    assert_eq!(second.pointers_cleaned, 0);
    assert_eq!(second.pages_visited, first.pages_visited);
    assert_checkpointed_contents(&tree)
}

#[test]
fn writes_after_recovery_survive_clean_close() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("after.gt");
    let coordinator = RecoveryCoordinator::background();
    {
        let tree = open(&path, &coordinator, Arc::new(NoopMonitor))?;
        write_then_crash(&tree)?;
    }
    {
        let tree = open(&path, &coordinator, Arc::new(NoopMonitor))?;
        for key in 2_000..2_050u64 {
            tree.insert(key, key)?;
        }
        tree.checkpoint()?;
        assert_eq!(
            tree.cleanup_handle().map(|handle| handle.state()),
            Some(CleanupState::Complete)
        );
        tree.remove(&0)?;
        tree.close()?;
    }

    let tree = open(&path, &coordinator, Arc::new(NoopMonitor))?;
    assert!(tree.cleanup_handle().is_none());
    assert_eq!(tree.get(&0)?, None);
    assert_eq!(tree.get(&7)?, Some(7));
    assert_eq!(tree.get(&2_049)?, Some(2_049));
    assert_eq!(tree.get(&1_050)?, None);
    let report = verify_tree(&tree).expect("verify");
    assert!(report.success, "{:?}", report.findings);
    assert_eq!(report.counts.entries, 499 + 50);
    Ok(())
}

#[test]
fn corrupt_page_fails_cleanup_and_blocks_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("corrupt.gt");
    let coordinator = RecoveryCoordinator::immediate();
    {
        let tree = open(&path, &coordinator, Arc::new(NoopMonitor))?;
        write_then_crash(&tree)?;
    }
    let stable_root = {
        let info = gentree::admin::inspect_file(&path).expect("inspect");
        info.states
            .iter()
            .find(|state| state.current)
            .and_then(|state| state.root)
            .expect("current state")
    };
    assert!(stable_root > 0);
    flip_last_byte(&path, stable_root)?;

    let monitor = Arc::new(RecordingMonitor::default());
    let tree = open(&path, &coordinator, monitor.clone())?;
    let handle = tree.cleanup_handle().expect("cleanup scheduled");
    assert_eq!(handle.state(), CleanupState::Failed);
    assert!(matches!(handle.wait(), Err(TreeError::RecoveryFailed(_))));
    assert!(monitor
        .events()
        .iter()
        .any(|event| event.starts_with("failed")));
    assert!(matches!(tree.checkpoint(), Err(TreeError::RecoveryFailed(_))));
    tree.close()?;

    let info = gentree::admin::inspect_file(&path).expect("inspect");
    let current = info.states.iter().find(|state| state.current).expect("current");
    assert_eq!(current.clean, Some(false));
    Ok(())
}

fn flip_last_byte(path: &Path, page: u64) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io::{Read, Seek, SeekFrom, Write};

    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let offset = (page + 1) * PAGE_SIZE as u64 - 1;
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut byte)?;
    byte[0] ^= 0xFF;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&byte)?;
    file.sync_all()?;
    Ok(())
}
