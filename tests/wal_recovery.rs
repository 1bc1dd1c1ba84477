use flintdb::{
    BlockStorage, Column, ColumnType, Direction, IndexDef, IndexKind, Meta, OpenMode, Row,
    Storage, StorageOptions, Table, Value, Wal, WalOptions,
};
use test_log::test;

fn storage_opts() -> StorageOptions {
    StorageOptions {
        increment: 4_096,
        ..Default::default()
    }
}

fn wal_opts() -> WalOptions {
    WalOptions {
        checkpoint_interval: 0,
        ..Default::default()
    }
}

#[test]
fn crash_before_commit_keeps_pre_transaction_state() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let data = folder.path().join("data");
    let log = folder.path().join("data.wal");

    let index = {
        let wal = Wal::open(&log, wal_opts())?;
        let storage = wal.wrap(BlockStorage::create(&data, &storage_opts())?);

        let index = storage.write(b"baseline")?;
        storage.sync()?;

        // A transaction mutates the page, then the process dies before
        // commit: buffers are simply never applied
        let _tx = wal.begin()?;
        storage.write_at(index, b"never committed")?;
        storage.delete(index)?;

        index
    };

    let wal = Wal::open(&log, wal_opts())?;
    let storage = wal.wrap(BlockStorage::open(&data, &storage_opts(), false)?);

    assert_eq!(0, wal.recover(&[&storage])?);
    assert_eq!(Some(b"baseline".to_vec()), storage.read(index)?);

    Ok(())
}

#[test]
fn rolled_back_transaction_is_discarded_by_replay() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let data = folder.path().join("data");
    let log = folder.path().join("data.wal");

    let index = {
        let wal = Wal::open(&log, wal_opts())?;
        let storage = wal.wrap(BlockStorage::create(&data, &storage_opts())?);

        let index = storage.write(b"v1")?;

        let tx = wal.begin()?;
        storage.write_at(index, b"rolled back")?;
        storage.rollback_discard(tx);
        wal.rollback(tx)?;

        let tx = wal.begin()?;
        storage.write_at(index, b"v2")?;
        storage.commit_apply(tx)?;
        wal.commit(tx)?;

        index
    };

    let wal = Wal::open(&log, wal_opts())?;
    let storage = wal.wrap(BlockStorage::open(&data, &storage_opts(), false)?);

    wal.recover(&[&storage])?;
    assert_eq!(Some(b"v2".to_vec()), storage.read(index)?);

    Ok(())
}

#[test]
fn replay_restores_a_torn_page_after_commit() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let data = folder.path().join("data");
    let log = folder.path().join("data.wal");

    let index = {
        let wal = Wal::open(&log, wal_opts())?;
        let storage = wal.wrap(BlockStorage::create(&data, &storage_opts())?);

        let index = storage.write(b"v1")?;

        let tx = wal.begin()?;
        storage.write_at(index, b"v2 committed")?;
        storage.commit_apply(tx)?;
        wal.commit(tx)?;

        // Simulate a torn write: the origin page loses the committed
        // image after the commit record became durable
        storage.origin().write_at(index, b"v1")?;
        storage.sync()?;

        index
    };

    // No checkpoint ran, so replay must re-apply the page image
    let wal = Wal::open(&log, wal_opts())?;
    let storage = wal.wrap(BlockStorage::open(&data, &storage_opts(), false)?);

    assert_eq!(1, wal.recover(&[&storage])?);
    assert_eq!(Some(b"v2 committed".to_vec()), storage.read(index)?);

    Ok(())
}

#[test]
fn metadata_only_mode_cannot_restore_updates() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let data = folder.path().join("data");
    let log = folder.path().join("data.wal");

    let opts = WalOptions {
        checkpoint_interval: 0,
        page_data: false,
        ..Default::default()
    };

    let index = {
        let wal = Wal::open(&log, opts)?;
        let storage = wal.wrap(BlockStorage::create(&data, &storage_opts())?);

        let index = storage.write(b"v1")?;

        let tx = wal.begin()?;
        storage.write_at(index, b"v2 committed")?;
        storage.commit_apply(tx)?;
        wal.commit(tx)?;

        storage.origin().write_at(index, b"torn!")?;
        storage.sync()?;

        index
    };

    // Recovery runs cleanly, but the metadata-only UPDATE carries no image
    let wal = Wal::open(&log, opts)?;
    let storage = wal.wrap(BlockStorage::open(&data, &storage_opts(), false)?);

    wal.recover(&[&storage])?;
    assert_eq!(Some(b"torn!".to_vec()), storage.read(index)?);

    Ok(())
}

#[test]
fn committed_delete_replays_once() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let data = folder.path().join("data");
    let log = folder.path().join("data.wal");

    let index = {
        let wal = Wal::open(&log, wal_opts())?;
        let storage = wal.wrap(BlockStorage::create(&data, &storage_opts())?);

        let index = storage.write(b"doomed")?;

        let tx = wal.begin()?;
        storage.delete(index)?;
        storage.commit_apply(tx)?;
        wal.commit(tx)?;

        index
    };

    let wal = Wal::open(&log, wal_opts())?;
    let storage = wal.wrap(BlockStorage::open(&data, &storage_opts(), false)?);

    // The delete is already in origin; replay must tolerate that
    wal.recover(&[&storage])?;
    assert_eq!(None, storage.read(index)?);

    Ok(())
}

// --- table-level crash scenarios ---

fn users_meta() -> Meta {
    Meta::new("t")
        .column(Column::new("id", ColumnType::Int64))
        .column(Column::new("name", ColumnType::String).with_bytes(16))
        .index(IndexDef::new("pk", IndexKind::Primary, &["id"]))
}

fn user(id: i64, name: &str) -> Row {
    Row::new(vec![Value::Int64(id), Value::String(name.into())])
}

#[test]
fn table_crash_after_commit_keeps_the_row() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("t");

    {
        let table = Table::create(&path, users_meta())?;

        table.apply(&user(1, "a"), false)?;
        table.apply(&user(4, "d"), false)?;

        // Kill the process without close(): no checkpoint, no final sync
        std::mem::forget(table);
    }

    let table = Table::open(&path, OpenMode::ReadWrite)?;

    assert_eq!(2, table.count());

    let mut cursor = table.find("id = 4", Direction::Ascending)?;
    let rows = cursor.collect_rows()?;
    assert_eq!(1, rows.len());
    assert_eq!(user(4, "d").values(), rows[0].values());

    table.verify()?;
    table.close()?;

    Ok(())
}

#[test]
fn table_close_truncates_the_log() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("t");
    let log = folder.path().join("t.wal");

    {
        let table = Table::create(&path, users_meta())?;

        for id in 0..20 {
            table.apply(&user(id, "x"), false)?;
        }

        table.close()?;
    }

    // TRUNCATE mode: after the close-time checkpoint only the header is
    // left
    assert_eq!(4_096, std::fs::metadata(&log)?.len());

    let table = Table::open(&path, OpenMode::ReadWrite)?;
    assert_eq!(20, table.count());
    table.verify()?;

    Ok(())
}

#[test]
fn table_auto_checkpoint_bounds_the_log() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("t");
    let log = folder.path().join("t.wal");

    let mut meta = users_meta();
    meta.apply_option("wal.checkpoint.interval", "1")?;

    {
        let table = Table::create(&path, meta)?;

        for id in 0..10 {
            table.apply(&user(id, "x"), false)?;
        }

        std::mem::forget(table);
    }

    // Every commit checkpointed; the log never accumulates records
    assert_eq!(4_096, std::fs::metadata(&log)?.len());

    let table = Table::open(&path, OpenMode::ReadWrite)?;
    assert_eq!(10, table.count());
    table.verify()?;

    Ok(())
}
