#![allow(missing_docs)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use gentree::{
    GenTree, NoopMonitor, Pager, PagerOptions, RecoveryCoordinator, Result, TreeOptions,
    U64Layout,
};
use tempfile::tempdir;

fn open(path: &Path) -> Result<GenTree<U64Layout>> {
    let options = PagerOptions {
        page_size: 1024,
        cache_pages: 64,
        ..PagerOptions::default()
    };
    GenTree::open(
        Arc::new(Pager::open(path, options)?),
        U64Layout,
        TreeOptions {
            node_capacity: Some(6),
        },
        |_| {},
        &RecoveryCoordinator::immediate(),
        Arc::new(NoopMonitor),
    )
}

#[test]
fn readers_see_consistent_prefixes_while_writer_appends() -> Result<()> {
    let dir = tempdir()?;
    let tree = open(&dir.path().join("append.gt"))?;
    let published = Arc::new(AtomicU64::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let tree = tree.clone();
            let published = Arc::clone(&published);
            let done = Arc::clone(&done);
            thread::spawn(move || -> Result<u64> {
                let mut scans = 0;
                while !done.load(Ordering::Acquire) {
                    let floor = published.load(Ordering::Acquire);
                    let mut cursor = tree.seek_range(..)?;
                    let mut expected = 0u64;
                    while let Some((key, value)) = cursor.next()? {
                        assert_eq!(key, expected, "snapshot skipped or repeated a key");
                        assert_eq!(value, key * 3);
                        expected += 1;
                    }
                    assert!(expected >= floor, "saw {expected} keys, {floor} were published");
                    scans += 1;
                }
                Ok(scans)
            })
        })
        .collect();

    for key in 0..2_000u64 {
        tree.insert(key, key * 3)?;
        published.store(key + 1, Ordering::Release);
        if key % 250 == 249 {
            tree.checkpoint()?;
        }
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        let scans = reader.join().expect("reader thread panicked")?;
        assert!(scans > 0);
    }
    assert_eq!(tree.seek_range(..)?.into_vec()?.len(), 2_000);
    tree.close()
}

#[test]
fn long_lived_cursor_outlasts_removals_and_checkpoints() -> Result<()> {
    let dir = tempdir()?;
    let tree = open(&dir.path().join("long.gt"))?;
    for key in 0..600u64 {
        tree.insert(key, key)?;
    }
    tree.checkpoint()?;

    let mut cursor = tree.seek(&100, &500)?;
    let mut seen = Vec::new();
    for _ in 0..50 {
        seen.push(cursor.next()?.expect("entry").0);
    }

    let writer = {
        let tree = tree.clone();
        thread::spawn(move || -> Result<()> {
            for key in (0..600u64).filter(|key| key % 2 == 0) {
                tree.remove(&key)?;
            }
            tree.checkpoint()?;
            for key in 600..900u64 {
                tree.insert(key, key)?;
            }
            tree.checkpoint()
        })
    };
    writer.join().expect("writer thread panicked")?;

    while let Some((key, _)) = cursor.next()? {
        seen.push(key);
    }
    assert_eq!(seen, (100..500).collect::<Vec<_>>());

    let now = tree.seek(&100, &500)?.into_vec()?;
    assert_eq!(now.len(), 200);
    assert!(now.iter().all(|(key, _)| key % 2 == 1));
    Ok(())
}

#[test]
fn abandoned_cursor_releases_its_snapshot() -> Result<()> {
    let dir = tempdir()?;
    let tree = open(&dir.path().join("abandon.gt"))?;
    for key in 0..200u64 {
        tree.insert(key, key)?;
    }
    tree.checkpoint()?;

    {
        let mut cursor = tree.seek_range(..)?;
        assert_eq!(cursor.next()?, Some((0, 0)));
        let before = tree.stats().pointer_slot_writes;
        tree.insert(10, 1)?;
        assert_eq!(tree.stats().pointer_slot_writes, before);
    }

    tree.checkpoint()?;
    let before = tree.stats().pointer_slot_writes;
    tree.insert(150, 1)?;
    assert!(tree.stats().pointer_slot_writes > before);
    Ok(())
}
