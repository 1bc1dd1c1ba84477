// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    meta::{Column, Meta},
    value::{ColumnType, Value},
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Block index of a row image in the row heap; assigned on first persist.
pub type RowId = u64;

/// A typed row
///
/// The value arity always equals the schema's column count. The row id is
/// the block index of the row image in the heap and identifies the row for
/// its whole lifetime.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    /// Heap block index, if persisted
    pub id: Option<RowId>,

    values: Vec<Value>,
}

impl Row {
    /// Creates an in-memory row, not yet persisted.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self { id: None, values }
    }

    /// Creates a row with a known id (decode path).
    #[must_use]
    pub fn with_id(id: RowId, values: Vec<Value>) -> Self {
        Self {
            id: Some(id),
            values,
        }
    }

    /// The row's values.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value at the given column position.
    #[must_use]
    pub fn get(&self, position: usize) -> Option<&Value> {
        self.values.get(position)
    }

    /// Encodes the fixed-width row image for the given schema.
    pub fn encode(&self, meta: &Meta) -> crate::Result<Vec<u8>> {
        if self.values.len() != meta.columns.len() {
            return Err(crate::Error::ColumnMismatch {
                expected: meta.columns.len(),
                got: self.values.len(),
            });
        }

        let mut image = Vec::with_capacity(meta.row_width());

        for (column, value) in meta.columns.iter().zip(&self.values) {
            encode_cell(&mut image, column, value)?;
        }

        debug_assert_eq!(meta.row_width(), image.len());

        Ok(image)
    }

    /// Decodes a row image produced by [`Row::encode`].
    pub fn decode(meta: &Meta, image: &[u8], id: RowId) -> crate::Result<Self> {
        let mut reader = image;
        let mut values = Vec::with_capacity(meta.columns.len());

        for column in &meta.columns {
            values.push(decode_cell(&mut reader, column)?);
        }

        Ok(Self::with_id(id, values))
    }
}

fn encode_cell<W: Write>(writer: &mut W, column: &Column, value: &Value) -> crate::Result<()> {
    if value.is_null() {
        if !column.nullable {
            return Err(crate::Error::InvalidDataType(format!(
                "NULL in non-nullable column {:?}",
                column.name
            )));
        }

        writer.write_u8(0).map_err(crate::Error::Io)?;

        // Fixed width: null cells still occupy the full footprint
        let zeroes = vec![0u8; column.value_width()];
        writer.write_all(&zeroes).map_err(crate::Error::Io)?;

        return Ok(());
    }

    if !value.fits(column.ty) {
        return Err(crate::Error::InvalidDataType(format!(
            "{value:?} does not fit column {:?} of type {:?}",
            column.name, column.ty
        )));
    }

    if column.nullable {
        writer.write_u8(1).map_err(crate::Error::Io)?;
    }

    let r = match (column.ty, value) {
        (ColumnType::Int16, Value::Int16(v)) => writer.write_i16::<LittleEndian>(*v),
        (ColumnType::Int32, Value::Int32(v)) => writer.write_i32::<LittleEndian>(*v),
        (ColumnType::Int64, Value::Int64(v)) => writer.write_i64::<LittleEndian>(*v),
        (ColumnType::Time, Value::Time(v)) => writer.write_i64::<LittleEndian>(*v),
        (ColumnType::Date, Value::Date(v)) => {
            // 24-bit packed date, little-endian
            let le = v.to_le_bytes();
            writer.write_all(le.get(..3).unwrap_or_default())
        }
        (ColumnType::Bit, Value::Bit(v)) => writer.write_u8(u8::from(*v)),

        (ColumnType::Decimal, Value::Decimal(v)) => {
            let scale = 10f64.powi(i32::from(column.precision));
            #[allow(clippy::cast_possible_truncation)]
            let scaled = (*v * scale).round() as i64;
            writer.write_i64::<LittleEndian>(scaled)
        }

        (ColumnType::String, Value::String(s)) => {
            return encode_var(writer, column, s.as_bytes());
        }
        (ColumnType::Bytes, Value::Bytes(b)) => {
            return encode_var(writer, column, b);
        }

        _ => unreachable!("fits() already checked the pairing"),
    };

    r.map_err(crate::Error::Io)
}

fn encode_var<W: Write>(writer: &mut W, column: &Column, bytes: &[u8]) -> crate::Result<()> {
    let capacity = column.bytes as usize;

    if bytes.len() > capacity {
        return Err(crate::Error::RowBytesExceeded {
            limit: capacity,
            got: bytes.len(),
        });
    }

    #[allow(clippy::cast_possible_truncation)]
    writer
        .write_u16::<LittleEndian>(bytes.len() as u16)
        .map_err(crate::Error::Io)?;
    writer.write_all(bytes).map_err(crate::Error::Io)?;

    let padding = vec![0u8; capacity - bytes.len()];
    writer.write_all(&padding).map_err(crate::Error::Io)?;

    Ok(())
}

fn decode_cell<R: Read>(reader: &mut R, column: &Column) -> crate::Result<Value> {
    if column.nullable {
        let marker = reader.read_u8().map_err(crate::Error::Io)?;

        if marker == 0 {
            let mut skip = vec![0u8; column.value_width()];
            reader.read_exact(&mut skip).map_err(crate::Error::Io)?;

            return Ok(Value::Null);
        }
    }

    Ok(match column.ty {
        ColumnType::Int16 => Value::Int16(reader.read_i16::<LittleEndian>()?),
        ColumnType::Int32 => Value::Int32(reader.read_i32::<LittleEndian>()?),
        ColumnType::Int64 => Value::Int64(reader.read_i64::<LittleEndian>()?),
        ColumnType::Time => Value::Time(reader.read_i64::<LittleEndian>()?),
        ColumnType::Date => {
            let mut le = [0u8; 4];
            reader
                .read_exact(le.get_mut(..3).unwrap_or(&mut []))
                .map_err(crate::Error::Io)?;
            Value::Date(u32::from_le_bytes(le))
        }
        ColumnType::Bit => Value::Bit(reader.read_u8()? != 0),

        ColumnType::Decimal => {
            let scaled = reader.read_i64::<LittleEndian>()?;
            let scale = 10f64.powi(i32::from(column.precision));
            #[allow(clippy::cast_precision_loss)]
            let restored = scaled as f64 / scale;
            Value::Decimal(restored)
        }

        ColumnType::String => {
            let bytes = decode_var(reader, column)?;
            Value::String(String::from_utf8(bytes).map_err(|_| {
                crate::Error::InvalidDataType(format!(
                    "invalid UTF-8 in column {:?}",
                    column.name
                ))
            })?)
        }

        ColumnType::Bytes => Value::Bytes(decode_var(reader, column)?),
    })
}

fn decode_var<R: Read>(reader: &mut R, column: &Column) -> crate::Result<Vec<u8>> {
    let capacity = column.bytes as usize;
    let len = reader.read_u16::<LittleEndian>()? as usize;

    if len > capacity {
        return Err(crate::Error::StorageRead(format!(
            "corrupt length {len} in column {:?} (capacity {capacity})",
            column.name
        )));
    }

    let mut buf = vec![0u8; capacity];
    reader.read_exact(&mut buf).map_err(crate::Error::Io)?;
    buf.truncate(len);

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{IndexDef, IndexKind};
    use test_log::test;

    fn meta() -> Meta {
        Meta::new("t")
            .column(Column::new("id", ColumnType::Int64))
            .column(Column::new("name", ColumnType::String).with_bytes(8).nullable())
            .column(Column::new("score", ColumnType::Decimal).with_precision(2))
            .column(Column::new("born", ColumnType::Date).nullable())
            .column(Column::new("flag", ColumnType::Bit))
            .index(IndexDef::new("pk", IndexKind::Primary, &["id"]))
    }

    #[test]
    fn row_codec_roundtrip() -> crate::Result<()> {
        let meta = meta();

        let row = Row::new(vec![
            Value::Int64(42),
            Value::String("ab".into()),
            Value::Decimal(12.34),
            Value::date(1999, 12, 31),
            Value::Bit(true),
        ]);

        let image = row.encode(&meta)?;
        assert_eq!(meta.row_width(), image.len());

        let decoded = Row::decode(&meta, &image, 7)?;
        assert_eq!(Some(7), decoded.id);
        assert_eq!(row.values(), decoded.values());

        Ok(())
    }

    #[test]
    fn row_codec_nulls_roundtrip() -> crate::Result<()> {
        let meta = meta();

        let row = Row::new(vec![
            Value::Int64(1),
            Value::Null,
            Value::Decimal(0.5),
            Value::Null,
            Value::Bit(false),
        ]);

        let image = row.encode(&meta)?;
        assert_eq!(meta.row_width(), image.len());

        let decoded = Row::decode(&meta, &image, 1)?;
        assert_eq!(row.values(), decoded.values());

        Ok(())
    }

    #[test]
    fn row_arity_mismatch() {
        let err = Row::new(vec![Value::Int64(1)]).encode(&meta()).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::ColumnMismatch {
                expected: 5,
                got: 1
            }
        ));
    }

    #[test]
    fn row_null_in_non_nullable() {
        let row = Row::new(vec![
            Value::Null,
            Value::Null,
            Value::Decimal(0.0),
            Value::Null,
            Value::Bit(false),
        ]);

        let err = row.encode(&meta()).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidDataType(_)));
    }

    #[test]
    fn row_string_at_capacity_succeeds() -> crate::Result<()> {
        let row = Row::new(vec![
            Value::Int64(1),
            Value::String("exactly8".into()),
            Value::Decimal(1.0),
            Value::Null,
            Value::Bit(true),
        ]);

        let image = row.encode(&meta())?;
        let decoded = Row::decode(&meta(), &image, 0)?;
        assert_eq!(Some(&Value::String("exactly8".into())), decoded.get(1));

        Ok(())
    }

    #[test]
    fn row_string_over_capacity_fails() {
        let row = Row::new(vec![
            Value::Int64(1),
            Value::String("ninechars".into()),
            Value::Decimal(1.0),
            Value::Null,
            Value::Bit(true),
        ]);

        let err = row.encode(&meta()).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::RowBytesExceeded { limit: 8, got: 9 }
        ));
    }

    #[test]
    fn row_wrong_type_fails() {
        let row = Row::new(vec![
            Value::String("1".into()),
            Value::Null,
            Value::Decimal(1.0),
            Value::Null,
            Value::Bit(true),
        ]);

        let err = row.encode(&meta()).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidDataType(_)));
    }

    #[test]
    fn row_decimal_precision_rounds() -> crate::Result<()> {
        let meta = meta();

        let row = Row::new(vec![
            Value::Int64(1),
            Value::Null,
            Value::Decimal(1.2345),
            Value::Null,
            Value::Bit(false),
        ]);

        let image = row.encode(&meta)?;
        let decoded = Row::decode(&meta, &image, 0)?;

        // precision 2: 1.2345 truncates to 1.23 at encode time
        assert_eq!(Some(&Value::Decimal(1.23)), decoded.get(2));

        Ok(())
    }
}
