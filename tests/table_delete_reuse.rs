use flintdb::{Column, ColumnType, Direction, IndexDef, IndexKind, Meta, Row, Table, Value};
use test_log::test;

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
fn delete_frees_and_next_insert_reuses_the_block() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;

    let table = Table::create(&folder.path().join("t"), users_meta())?;

    let first = table.apply(&user(1, "a"), false)?;
    table.apply(&user(2, "b"), false)?;

    assert_eq!(1, table.delete(first)?);
    assert_eq!(1, table.count());
    assert_eq!(None, table.read(first)?);

    // The freed block must be reused: the new row gets the old row id
    let reused = table.apply(&user(3, "c"), false)?;
    assert_eq!(first, reused);

    let mut cursor = table.find("", Direction::Ascending)?;
    let rows = cursor.collect_rows()?;

    assert_eq!(2, rows.len());
    assert_eq!(user(2, "b").values(), rows[0].values());
    assert_eq!(user(3, "c").values(), rows[1].values());

    table.verify()?;

    Ok(())
}

#[test]
fn delete_unknown_row_id_returns_minus_one() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;

    let table = Table::create(&folder.path().join("t"), users_meta())?;

    let id = table.apply(&user(1, "a"), false)?;

    assert_eq!(1, table.delete(id)?);

    // Deleting the same id again: the row is unknown now
    assert_eq!(-1, table.delete(id)?);
    assert_eq!(0, table.count());

    Ok(())
}

#[test]
fn delete_then_read_returns_none() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;

    let table = Table::create(&folder.path().join("t"), users_meta())?;

    let id = table.apply(&user(1, "a"), false)?;
    assert!(table.read(id)?.is_some());

    table.delete(id)?;
    assert_eq!(None, table.read(id)?);

    Ok(())
}

#[test]
fn delete_removes_from_every_index() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;

    let meta = users_meta().index(IndexDef::new("by_name", IndexKind::Sort, &["name"]));
    let table = Table::create(&folder.path().join("t"), meta)?;

    let id = table.apply(&user(1, "gone"), false)?;
    table.apply(&user(2, "kept"), false)?;

    table.delete(id)?;

    let mut cursor = table.find("USE INDEX by_name", Direction::Ascending)?;
    let rows = cursor.collect_rows()?;

    assert_eq!(1, rows.len());
    assert_eq!(user(2, "kept").values(), rows[0].values());

    table.verify()?;

    Ok(())
}

#[test]
fn delete_interleaved_with_inserts_stays_consistent() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;

    let table = Table::create(&folder.path().join("t"), users_meta())?;

    let mut live = Vec::new();

    for id in 0..50 {
        let row_id = table.apply(&user(id, "x"), false)?;
        live.push((id, row_id));
    }

    // Drop every even row
    for (id, row_id) in live.clone() {
        if id % 2 == 0 {
            assert_eq!(1, table.delete(row_id)?);
        }
    }

    assert_eq!(25, table.count());

    // Refill; freed blocks come back in some order
    for id in 100..125 {
        table.apply(&user(id, "y"), false)?;
    }

    assert_eq!(50, table.count());
    table.verify()?;

    Ok(())
}
