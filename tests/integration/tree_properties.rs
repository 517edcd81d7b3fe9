#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use gentree::admin::verify_tree;
use gentree::{
    BytesLayout, GenTree, Layout, NoopMonitor, NumberKey, NumberLayout, Pager, PagerOptions,
    RecoveryCoordinator, TreeOptions, U64Layout,
};
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Insert(u16, u32),
    Remove(u16),
    Checkpoint,
    Reopen,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u16..300, any::<u32>()).prop_map(|(k, v)| Op::Insert(k, v)),
        3 => (0u16..300).prop_map(Op::Remove),
        1 => Just(Op::Checkpoint),
        1 => Just(Op::Reopen),
    ]
}

fn open_bytes(dir: &TempDir, capacity: usize) -> GenTree<BytesLayout> {
    let options = PagerOptions {
        page_size: 1024,
        ..PagerOptions::default()
    };
    let pager = Pager::open(dir.path().join("prop.gt"), options).expect("pager");
    GenTree::open(
        Arc::new(pager),
        BytesLayout::new(16, 8).expect("layout"),
        TreeOptions {
            node_capacity: Some(capacity),
        },
        |_| {},
        &RecoveryCoordinator::immediate(),
        Arc::new(NoopMonitor),
    )
    .expect("open")
}

fn encode_key(key: u16) -> Vec<u8> {
    // Varying lengths exercise the variable-size encoding.
    let mut out = format!("k{key}").into_bytes();
    out.resize(2 + (key % 7) as usize + out.len(), b'.');
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn tree_matches_model_across_checkpoints_and_reopens(
        capacity in 3usize..8,
        ops in prop::collection::vec(arb_op(), 1..250),
    ) {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open_bytes(&dir, capacity);
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let key = encode_key(k);
                    let value = v.to_be_bytes().to_vec();
                    tree.insert(key.clone(), value.clone()).expect("insert");
                    model.insert(key, value);
                }
                Op::Remove(k) => {
                    let key = encode_key(k);
                    prop_assert_eq!(tree.remove(&key).expect("remove"), model.remove(&key));
                }
                Op::Checkpoint => tree.checkpoint().expect("checkpoint"),
                Op::Reopen => {
                    tree.close().expect("close");
                    tree = open_bytes(&dir, capacity);
                }
            }
        }

        let all = tree.seek_range(..).expect("seek").into_vec().expect("scan");
        let expected: Vec<(Vec<u8>, Vec<u8>)> =
            model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        prop_assert_eq!(all, expected);

        let report = verify_tree(&tree).expect("verify");
        prop_assert!(report.success, "{:?}", report.findings);
        prop_assert_eq!(report.counts.entries, model.len() as u64);
    }

    #[test]
    fn seek_returns_the_half_open_range(
        keys in prop::collection::btree_set(0u64..10_000, 0..400),
        from in 0u64..10_000,
        span in 0u64..5_000,
    ) {
        let dir = TempDir::new().expect("tempdir");
        let pager = Pager::open(dir.path().join("range.gt"), PagerOptions {
            page_size: 512,
            ..PagerOptions::default()
        }).expect("pager");
        let tree = GenTree::open(
            Arc::new(pager),
            U64Layout,
            TreeOptions { node_capacity: Some(5) },
            |_| {},
            &RecoveryCoordinator::immediate(),
            Arc::new(NoopMonitor),
        ).expect("open");
        for key in &keys {
            tree.insert(*key, !*key).expect("insert");
        }
        let to = from + span;
        let got: Vec<u64> = tree
            .seek(&from, &to)
            .expect("seek")
            .into_vec()
            .expect("scan")
            .into_iter()
            .map(|(k, v)| {
                assert_eq!(v, !k);
                k
            })
            .collect();
        let want: Vec<u64> = keys.range(from..to).copied().collect();
        prop_assert_eq!(got, want);
    }

    #[test]
    fn number_keys_round_trip(value in any::<f64>(), entity in any::<u64>()) {
        let layout = NumberLayout;
        let key = NumberKey::new(value, entity);
        let mut buf = vec![0u8; layout.key_size(&key)];
        layout.write_key(&key, &mut buf);
        let back = layout.read_key(&buf).expect("decode");
        prop_assert_eq!(back.value.to_bits(), value.to_bits());
        prop_assert_eq!(back.entity_id, entity);
        prop_assert_eq!(layout.compare(&back, &key), std::cmp::Ordering::Equal);
    }
}
