use flintdb::{
    AnyStorage, BPlusTree, BlockStorage, Direction, MatchAll, NaturalOrder, StorageOptions,
};
use std::sync::Arc;
use test_log::test;

/// 48-byte node payload: LEAF_MAX = 4, INTERNAL_MAX = 2.
fn tiny_tree(folder: &std::path::Path) -> flintdb::Result<BPlusTree> {
    let opts = StorageOptions {
        block_bytes: 48,
        increment: 16 * 1_024,
        ..Default::default()
    };

    let storage = Arc::new(AnyStorage::Block(BlockStorage::create(
        &folder.join("tree"),
        &opts,
    )?));

    BPlusTree::open(storage, Arc::new(NaturalOrder), 1_024 * 1_024)
}

#[test]
fn split_chain_of_one_thousand_keys() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let tree = tiny_tree(folder.path())?;

    for key in 1..=1_000 {
        assert!(tree.insert(key)?, "key {key} should be fresh");
    }

    // With a fan-out this small the tree must be at least 4 levels deep
    assert!(tree.height()? >= 4, "height was {}", tree.height()?);
    assert_eq!(1_000, tree.len()?);

    tree.check_invariants()?;

    // The leaf sibling walk yields 1..=1000 in order
    let mut cursor = tree.cursor(Direction::Ascending, Box::new(MatchAll))?;
    let mut expected = 1;

    while let Some(key) = cursor.next()? {
        assert_eq!(expected, key);
        expected += 1;
    }
    assert_eq!(1_001, expected);

    // The descending cursor yields 1000..=1 in exact reverse
    let mut cursor = tree.cursor(Direction::Descending, Box::new(MatchAll))?;
    let mut expected = 1_000;

    while let Some(key) = cursor.next()? {
        assert_eq!(expected, key);
        expected -= 1;
    }
    assert_eq!(0, expected);

    Ok(())
}

#[test]
fn full_leaf_with_full_right_sibling_falls_through_to_split() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let tree = tiny_tree(folder.path())?;

    // Ascending fill packs every leaf to LEAF_MAX; inserting into the
    // middle then finds both siblings full and must split
    for key in (0..40).map(|i| i * 10) {
        tree.insert(key)?;
    }

    tree.check_invariants()?;

    tree.insert(195)?;
    tree.check_invariants()?;

    assert!(tree.contains(195)?);
    assert_eq!(41, tree.len()?);

    Ok(())
}

#[test]
fn churn_survives_reopen() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;

    let opts = StorageOptions {
        block_bytes: 48,
        increment: 16 * 1_024,
        ..Default::default()
    };

    {
        let tree = tiny_tree(folder.path())?;

        for key in 0..500 {
            tree.insert(key)?;
        }

        for key in (0..500).filter(|k| k % 3 == 0) {
            assert!(tree.remove(key)?);
        }

        tree.check_invariants()?;
    }

    let storage = Arc::new(AnyStorage::Block(BlockStorage::open(
        &folder.path().join("tree"),
        &opts,
        false,
    )?));
    let tree = BPlusTree::open(storage, Arc::new(NaturalOrder), 1_024 * 1_024)?;

    tree.check_invariants()?;

    let expected: Vec<i64> = (0..500).filter(|k| k % 3 != 0).collect();
    assert_eq!(expected.len() as u64, tree.len()?);

    for key in expected {
        assert!(tree.contains(key)?, "key {key} should have survived");
    }

    Ok(())
}
