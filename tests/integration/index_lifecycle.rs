#![allow(missing_docs)]

use std::fs;

use gentree::index::no_header_writer;
use gentree::{
    CleanupState, ExecutionMode, IndexConfig, IndexDescriptor, IndexError, NumberKey,
    NumberLayout, RecoveryCoordinator, SchemaIndex, U64Layout,
};
use tempfile::tempdir;

fn descriptor() -> IndexDescriptor {
    IndexDescriptor::new(42, "Index( GENERAL, :Person(age) )")
}

fn small_config() -> IndexConfig {
    IndexConfig {
        page_size: 512,
        node_capacity: Some(4),
        recovery: ExecutionMode::Immediate,
        ..IndexConfig::default()
    }
}

#[test]
fn open_creates_missing_directories() -> Result<(), IndexError> {
    let dir = tempdir()?;
    let path = dir.path().join("schema").join("index").join("42").join("index.gt");
    let index = SchemaIndex::open(
        descriptor(),
        &path,
        U64Layout,
        &small_config(),
        no_header_writer,
        &RecoveryCoordinator::immediate(),
    )?;
    assert!(path.parent().expect("parent").is_dir());
    assert!(path.is_file());
    index.insert(1, 10)?;
    index.close()?;

    // Reopening with the directories already present is fine.
    let index = SchemaIndex::open(
        descriptor(),
        &path,
        U64Layout,
        &small_config(),
        no_header_writer,
        &RecoveryCoordinator::immediate(),
    )?;
    assert_eq!(index.get(&1)?, Some(10));
    index.close()
}

#[test]
fn header_payload_is_written_once_and_read_back() -> Result<(), IndexError> {
    let dir = tempdir()?;
    let path = dir.path().join("header.gt");
    let coordinator = RecoveryCoordinator::immediate();

    let mut calls = 0;
    let index = SchemaIndex::open(
        descriptor(),
        &path,
        U64Layout,
        &small_config(),
        |payload: &mut Vec<u8>| {
            calls += 1;
            payload.extend_from_slice(b"index-42");
        },
        &coordinator,
    )?;
    assert_eq!(index.header()?, b"index-42".to_vec());
    index.close()?;

    let index = SchemaIndex::open(
        descriptor(),
        &path,
        U64Layout,
        &small_config(),
        |payload: &mut Vec<u8>| {
            calls += 1;
            payload.extend_from_slice(b"overwritten");
        },
        &coordinator,
    )?;
    assert_eq!(index.header()?, b"index-42".to_vec());
    assert_eq!(calls, 1);
    index.close()
}

#[test]
fn close_is_idempotent_and_guards_operations() -> Result<(), IndexError> {
    let dir = tempdir()?;
    let index = SchemaIndex::open(
        descriptor(),
        dir.path().join("closed.gt"),
        U64Layout,
        &small_config(),
        no_header_writer,
        &RecoveryCoordinator::immediate(),
    )?;
    index.insert(5, 50)?;
    index.assert_open()?;
    index.close()?;
    index.close()?;

    assert!(index.is_closed());
    assert!(matches!(index.assert_open(), Err(IndexError::Closed)));
    assert!(matches!(index.insert(6, 60), Err(IndexError::Closed)));
    assert!(matches!(index.get(&5), Err(IndexError::Closed)));
    assert!(matches!(index.seek(&0, &10), Err(IndexError::Closed)));
    assert!(matches!(index.checkpoint(), Err(IndexError::Closed)));
    Ok(())
}

#[test]
fn second_open_of_the_same_store_is_refused() -> Result<(), IndexError> {
    let dir = tempdir()?;
    let path = dir.path().join("shared.gt");
    let coordinator = RecoveryCoordinator::immediate();
    let first = SchemaIndex::open(
        descriptor(),
        &path,
        U64Layout,
        &small_config(),
        no_header_writer,
        &coordinator,
    )?;
    let second = SchemaIndex::open(
        descriptor(),
        dir.path().join(".").join("shared.gt"),
        U64Layout,
        &small_config(),
        no_header_writer,
        &coordinator,
    );
    assert!(matches!(second, Err(IndexError::AlreadyOpen(_))));

    first.close()?;
    let again = SchemaIndex::open(
        descriptor(),
        &path,
        U64Layout,
        &small_config(),
        no_header_writer,
        &coordinator,
    )?;
    again.close()
}

#[test]
fn dropped_index_recovers_on_next_open() -> Result<(), IndexError> {
    let dir = tempdir()?;
    let path = dir.path().join("dropped.gt");
    let coordinator = RecoveryCoordinator::background();
    {
        let index = SchemaIndex::open(
            descriptor(),
            &path,
            U64Layout,
            &small_config(),
            no_header_writer,
            &coordinator,
        )?;
        for key in 0..100u64 {
            index.insert(key, key)?;
        }
        index.checkpoint()?;
        for key in 0..100u64 {
            index.insert(key, key * 2)?;
        }
        index.tree_handle()?.store().flush()?;
    }

    let index = SchemaIndex::open(
        descriptor(),
        &path,
        U64Layout,
        &small_config(),
        no_header_writer,
        &coordinator,
    )?;
    let handle = index.cleanup_handle().expect("cleanup scheduled");
    let report = handle.wait()?;
    assert!(report.pointers_cleaned > 0);
    assert_eq!(handle.state(), CleanupState::Complete);
    assert_eq!(index.get(&99)?, Some(99));
    index.close()
}

#[test]
fn corrupt_store_degrades_the_index() -> Result<(), IndexError> {
    let dir = tempdir()?;
    let path = dir.path().join("degraded.gt");
    let coordinator = RecoveryCoordinator::immediate();
    let page_size = small_config().page_size as u64;
    {
        let index = SchemaIndex::open(
            descriptor(),
            &path,
            U64Layout,
            &small_config(),
            no_header_writer,
            &coordinator,
        )?;
        for key in 0..100u64 {
            index.insert(key, key)?;
        }
        index.checkpoint()?;
        index.insert(3, 33)?;
        index.tree_handle()?.store().flush()?;
    }
    let info = gentree::admin::inspect_file(&path).expect("inspect");
    let root = info
        .states
        .iter()
        .find(|state| state.current)
        .and_then(|state| state.root)
        .expect("current state");

    let mut bytes = fs::read(&path)?;
    let last = ((root + 1) * page_size - 1) as usize;
    bytes[last] ^= 0xFF;
    fs::write(&path, &bytes)?;

    let index = SchemaIndex::open(
        descriptor(),
        &path,
        U64Layout,
        &small_config(),
        no_header_writer,
        &coordinator,
    )?;
    let handle = index.cleanup_handle().expect("cleanup scheduled");
    assert_eq!(handle.state(), CleanupState::Failed);
    assert!(matches!(index.assert_open(), Err(IndexError::Degraded(_))));
    assert!(matches!(index.insert(1, 1), Err(IndexError::Degraded(_))));
    index.close()
}

#[test]
fn number_index_round_trips_through_the_facade() -> Result<(), IndexError> {
    let dir = tempdir()?;
    let path = dir.path().join("numbers.gt");
    let config = IndexConfig::from_toml_str(
        "page_size = 1024\nnode_capacity = 8\nrecovery = \"immediate\"\n",
    )?;
    let index = SchemaIndex::open(
        descriptor(),
        &path,
        NumberLayout,
        &config,
        no_header_writer,
        &config.coordinator(),
    )?;
    for entity in 0..200u64 {
        index.insert(NumberKey::new((entity % 17) as f64 - 8.0, entity), ())?;
    }
    let low = NumberKey::new(-1.0, 0);
    let high = NumberKey::new(1.0, 0);
    let hits = index.seek(&low, &high)?.into_vec()?;
    // Values -1.0 and 0.0, every entity with those residues.
    let expected = (0..200u64).filter(|e| matches!(e % 17, 7 | 8)).count();
    assert_eq!(hits.len(), expected);
    assert!(hits
        .windows(2)
        .all(|w| (w[0].0.value, w[0].0.entity_id) < (w[1].0.value, w[1].0.entity_id)));
    index.close()
}

#[test]
fn config_file_is_loaded() -> Result<(), IndexError> {
    let dir = tempdir()?;
    let file = dir.path().join("index.toml");
    fs::write(&file, "cache_pages = 64\nverify_checksums = false\n")?;
    let config = IndexConfig::load(&file)?;
    assert_eq!(config.cache_pages, 64);
    assert!(!config.verify_checksums);
    assert_eq!(config.recovery, ExecutionMode::Background);

    fs::write(&file, "page_size = \"big\"\n")?;
    assert!(matches!(IndexConfig::load(&file), Err(IndexError::Config(_))));
    Ok(())
}
