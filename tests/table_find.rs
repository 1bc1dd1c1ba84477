use flintdb::{Column, ColumnType, Direction, IndexDef, IndexKind, Meta, Row, Table, Value};
use test_log::test;

fn scored_meta() -> Meta {
    Meta::new("t")
        .column(Column::new("id", ColumnType::Int64))
        .column(Column::new("name", ColumnType::String).with_bytes(16))
        .column(Column::new("score", ColumnType::Int32).nullable())
        .index(IndexDef::new("pk", IndexKind::Primary, &["id"]))
        .index(IndexDef::new("by_name", IndexKind::Sort, &["name"]))
}

fn row(id: i64, name: &str, score: Option<i32>) -> Row {
    Row::new(vec![
        Value::Int64(id),
        Value::String(name.into()),
        score.map_or(Value::Null, Value::Int32),
    ])
}

fn fixture(table: &Table) -> flintdb::Result<()> {
    for (id, name, score) in [
        (1, "ada", Some(90)),
        (2, "bob", Some(70)),
        (3, "cyd", None),
        (4, "dan", Some(70)),
        (5, "eve", Some(100)),
    ] {
        table.apply(&row(id, name, score), false)?;
    }

    Ok(())
}

fn ids(table: &Table, predicate: &str, direction: Direction) -> flintdb::Result<Vec<i64>> {
    let mut cursor = table.find(predicate, direction)?;
    let rows = cursor.collect_rows()?;

    Ok(rows
        .iter()
        .map(|r| match r.get(0) {
            Some(Value::Int64(id)) => *id,
            _ => unreachable!(),
        })
        .collect())
}

#[test]
fn find_point_and_range() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let table = Table::create(&folder.path().join("t"), scored_meta())?;
    fixture(&table)?;

    assert_eq!(vec![3], ids(&table, "id = 3", Direction::Ascending)?);
    assert_eq!(vec![4, 5], ids(&table, "id > 3", Direction::Ascending)?);
    assert_eq!(vec![1, 2], ids(&table, "id < 3", Direction::Ascending)?);
    assert_eq!(
        vec![2, 3, 4],
        ids(&table, "id >= 2 AND id <= 4", Direction::Ascending)?
    );
    assert!(ids(&table, "id = 99", Direction::Ascending)?.is_empty());

    Ok(())
}

#[test]
fn find_descending_reverses_ascending() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let table = Table::create(&folder.path().join("t"), scored_meta())?;
    fixture(&table)?;

    for predicate in ["", "id >= 2", "id >= 2 AND id <= 4", "score = 70"] {
        let mut ascending = ids(&table, predicate, Direction::Ascending)?;
        let descending = ids(&table, predicate, Direction::Descending)?;

        ascending.reverse();
        assert_eq!(ascending, descending, "predicate {predicate:?}");
    }

    Ok(())
}

#[test]
fn find_limit_and_offset() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let table = Table::create(&folder.path().join("t"), scored_meta())?;
    fixture(&table)?;

    // limit 0 yields nothing
    assert!(ids(&table, "LIMIT 0", Direction::Ascending)?.is_empty());

    // offset beyond the total yields nothing
    assert!(ids(&table, "OFFSET 5", Direction::Ascending)?.is_empty());
    assert!(ids(&table, "OFFSET 99", Direction::Ascending)?.is_empty());

    assert_eq!(vec![1, 2], ids(&table, "LIMIT 2", Direction::Ascending)?);
    assert_eq!(
        vec![3, 4],
        ids(&table, "LIMIT 2 OFFSET 2", Direction::Ascending)?
    );
    assert_eq!(vec![5], ids(&table, "OFFSET 4", Direction::Ascending)?);

    Ok(())
}

#[test]
fn find_with_secondary_index_hint() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let table = Table::create(&folder.path().join("t"), scored_meta())?;
    fixture(&table)?;

    // Name order differs from id order only in direction here, so filter
    assert_eq!(
        vec![2],
        ids(&table, "name = 'bob' USE INDEX by_name", Direction::Ascending)?
    );

    assert_eq!(
        vec![2, 3, 4],
        ids(
            &table,
            "name > 'ada' AND name < 'eve' USE INDEX by_name",
            Direction::Ascending
        )?
    );

    Ok(())
}

#[test]
fn find_unknown_index_fails() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let table = Table::create(&folder.path().join("t"), scored_meta())?;
    fixture(&table)?;

    let err = table
        .find("USE INDEX nope", Direction::Ascending)
        .unwrap_err();

    assert!(matches!(err, flintdb::Error::IndexNotFound(_)));
    assert_eq!(flintdb::ErrorCode::IndexNotFound, err.code());

    Ok(())
}

#[test]
fn find_unknown_column_fails() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let table = Table::create(&folder.path().join("t"), scored_meta())?;
    fixture(&table)?;

    assert!(table.find("ghost = 1", Direction::Ascending).is_err());

    Ok(())
}

#[test]
fn find_null_semantics() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let table = Table::create(&folder.path().join("t"), scored_meta())?;
    fixture(&table)?;

    // NULL cells match only `= NULL`
    assert_eq!(vec![3], ids(&table, "score = NULL", Direction::Ascending)?);
    assert_eq!(
        vec![1, 2, 4, 5],
        ids(&table, "score != NULL", Direction::Ascending)?
    );
    assert_eq!(
        vec![2, 4],
        ids(&table, "score = 70", Direction::Ascending)?
    );

    Ok(())
}

#[test]
fn find_residual_filter_on_non_index_column() -> flintdb::Result<()> {
    let folder = tempfile::tempdir()?;
    let table = Table::create(&folder.path().join("t"), scored_meta())?;
    fixture(&table)?;

    // score is not a key of the primary index; rows are filtered lazily
    assert_eq!(
        vec![1, 5],
        ids(&table, "score >= 90", Direction::Ascending)?
    );
    assert_eq!(
        vec![2, 4],
        ids(&table, "id <= 4 AND score = 70", Direction::Ascending)?
    );

    Ok(())
}
