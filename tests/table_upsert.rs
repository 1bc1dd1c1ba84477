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
fn upsert_conflict_semantics() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;

    let table = Table::create(&folder.path().join("t"), users_meta())?;

    let original = table.apply(&user(1, "a"), false)?;
    table.apply(&user(2, "b"), false)?;

    // Plain insert with an existing key fails
    let err = table.apply(&user(1, "A"), false).unwrap_err();
    assert!(matches!(err, flintdb::Error::DuplicateKey(_)));
    assert_eq!(flintdb::ErrorCode::DuplicateKey, err.code());

    // Upsert overwrites in place, keeping the row id
    let upserted = table.apply(&user(1, "A"), true)?;
    assert_eq!(original, upserted);

    let row = table.read(upserted)?.expect("row exists");
    assert_eq!(user(1, "A").values(), row.values());

    assert_eq!(2, table.count());
    table.verify()?;

    Ok(())
}

#[test]
fn upsert_is_idempotent() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;

    let table = Table::create(&folder.path().join("t"), users_meta())?;

    let first = table.apply(&user(1, "a"), true)?;
    let second = table.apply(&user(1, "a"), true)?;

    assert_eq!(first, second);
    assert_eq!(1, table.count());

    Ok(())
}

#[test]
fn upsert_resorts_secondary_indexes() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;

    let meta = users_meta().index(IndexDef::new("by_name", IndexKind::Sort, &["name"]));
    let table = Table::create(&folder.path().join("t"), meta)?;

    table.apply(&user(1, "zzz"), false)?;
    table.apply(&user(2, "aaa"), false)?;

    // Move row 1 to the front of the name order
    table.apply(&user(1, "aa"), true)?;

    let mut cursor = table.find("USE INDEX by_name", Direction::Ascending)?;
    let rows = cursor.collect_rows()?;

    let names: Vec<_> = rows
        .iter()
        .map(|row| match row.get(1) {
            Some(Value::String(s)) => s.clone(),
            _ => unreachable!(),
        })
        .collect();

    assert_eq!(vec!["aa".to_string(), "aaa".to_string()], names);

    table.verify()?;

    Ok(())
}

#[test]
fn update_preserves_row_id_and_rejects_key_change() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;

    let meta = users_meta().index(IndexDef::new("by_name", IndexKind::Sort, &["name"]));
    let table = Table::create(&folder.path().join("t"), meta)?;

    let id = table.apply(&user(1, "before"), false)?;

    let returned = table.update(id, &user(1, "after"))?;
    assert_eq!(id, returned);

    let row = table.read(id)?.expect("row exists");
    assert_eq!(user(1, "after").values(), row.values());

    // Changing a primary key column through UPDATE would desync the
    // primary sorter from the heap
    let err = table.update(id, &user(9, "after")).unwrap_err();
    assert!(matches!(err, flintdb::Error::InvalidOperation(_)));

    // Unknown row id
    let missing = table.update(999_999, &user(1, "x"));
    assert!(missing.is_err());

    table.verify()?;

    Ok(())
}

#[test]
fn secondary_index_keeps_duplicates() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;

    let meta = users_meta().index(IndexDef::new("by_name", IndexKind::Sort, &["name"]));
    let table = Table::create(&folder.path().join("t"), meta)?;

    table.apply(&user(1, "same"), false)?;
    table.apply(&user(2, "same"), false)?;
    table.apply(&user(3, "same"), false)?;

    let mut cursor = table.find("name = 'same' USE INDEX by_name", Direction::Ascending)?;

    let mut ids = Vec::new();
    while let Some(id) = cursor.next()? {
        ids.push(id);
    }

    assert_eq!(3, ids.len());
    table.verify()?;

    Ok(())
}
