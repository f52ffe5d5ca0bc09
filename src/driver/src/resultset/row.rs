use std::io;

use mysql_common::constants::ColumnType;

use crate::protocol::packet::PacketBuf;
use crate::resultset::column::ColumnInformation;

/// One decoded cell. Text-protocol rows only ever produce `Null` and
/// `Bytes`; binary-protocol rows decode to the typed variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bytes(Vec<u8>),
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Date {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        micros: u32,
    },
    Time {
        negative: bool,
        days: u32,
        hours: u8,
        minutes: u8,
        seconds: u8,
        micros: u32,
    },
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Text-protocol row: every cell is a length-encoded byte run or NULL.
pub fn decode_text_row(payload: &[u8], column_count: usize) -> io::Result<Vec<Value>> {
    let mut buf = PacketBuf::new(payload);
    let mut row = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        match buf.read_lenenc_bytes()? {
            None => row.push(Value::Null),
            Some(cell) => row.push(Value::Bytes(cell.to_vec())),
        }
    }
    Ok(row)
}

/// Binary-protocol row: 0x00 header, null bitmap with 2-bit offset, then
/// typed cells for every non-NULL column.
pub fn decode_binary_row(
    payload: &[u8],
    columns: &[ColumnInformation],
) -> io::Result<Vec<Value>> {
    let mut buf = PacketBuf::new(payload);
    buf.skip(1)?; // 0x00 header
    let bitmap_len = (columns.len() + 9) / 8;
    let bitmap = buf.read_bytes(bitmap_len)?.to_vec();

    let mut row = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            row.push(Value::Null);
            continue;
        }
        row.push(decode_binary_value(&mut buf, column)?);
    }
    Ok(row)
}

fn decode_binary_value(
    buf: &mut PacketBuf<'_>,
    column: &ColumnInformation,
) -> io::Result<Value> {
    let signed = column.is_signed();
    let value = match column.column_type {
        ColumnType::MYSQL_TYPE_TINY => {
            let raw = buf.read_u8()?;
            if signed {
                Value::Int(raw as i8 as i64)
            } else {
                Value::UInt(raw as u64)
            }
        }
        ColumnType::MYSQL_TYPE_SHORT | ColumnType::MYSQL_TYPE_YEAR => {
            let raw = buf.read_u16_le()?;
            if signed {
                Value::Int(raw as i16 as i64)
            } else {
                Value::UInt(raw as u64)
            }
        }
        ColumnType::MYSQL_TYPE_LONG | ColumnType::MYSQL_TYPE_INT24 => {
            let raw = buf.read_u32_le()?;
            if signed {
                Value::Int(raw as i32 as i64)
            } else {
                Value::UInt(raw as u64)
            }
        }
        ColumnType::MYSQL_TYPE_LONGLONG => {
            let raw = buf.read_u64_le()?;
            if signed {
                Value::Int(raw as i64)
            } else {
                Value::UInt(raw)
            }
        }
        ColumnType::MYSQL_TYPE_FLOAT => {
            let raw = buf.read_u32_le()?;
            Value::Float(f32::from_le_bytes(raw.to_le_bytes()))
        }
        ColumnType::MYSQL_TYPE_DOUBLE => {
            let raw = buf.read_u64_le()?;
            Value::Double(f64::from_le_bytes(raw.to_le_bytes()))
        }
        ColumnType::MYSQL_TYPE_DATE
        | ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_TIMESTAMP => {
            let len = buf.read_u8()?;
            let mut year = 0u16;
            let mut month = 0u8;
            let mut day = 0u8;
            let mut hour = 0u8;
            let mut minute = 0u8;
            let mut second = 0u8;
            let mut micros = 0u32;
            if len >= 4 {
                year = buf.read_u16_le()?;
                month = buf.read_u8()?;
                day = buf.read_u8()?;
            }
            if len >= 7 {
                hour = buf.read_u8()?;
                minute = buf.read_u8()?;
                second = buf.read_u8()?;
            }
            if len >= 11 {
                micros = buf.read_u32_le()?;
            }
            Value::Date {
                year,
                month,
                day,
                hour,
                minute,
                second,
                micros,
            }
        }
        ColumnType::MYSQL_TYPE_TIME => {
            let len = buf.read_u8()?;
            let mut negative = false;
            let mut days = 0u32;
            let mut hours = 0u8;
            let mut minutes = 0u8;
            let mut seconds = 0u8;
            let mut micros = 0u32;
            if len >= 8 {
                negative = buf.read_u8()? == 1;
                days = buf.read_u32_le()?;
                hours = buf.read_u8()?;
                minutes = buf.read_u8()?;
                seconds = buf.read_u8()?;
            }
            if len >= 12 {
                micros = buf.read_u32_le()?;
            }
            Value::Time {
                negative,
                days,
                hours,
                minutes,
                seconds,
                micros,
            }
        }
        _ => match buf.read_lenenc_bytes()? {
            None => Value::Null,
            Some(cell) => Value::Bytes(cell.to_vec()),
        },
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mysql_common::constants::ColumnFlags;

    fn col(column_type: ColumnType, unsigned: bool) -> ColumnInformation {
        let mut c = ColumnInformation::synthetic("c", column_type);
        if unsigned {
            c.flags |= ColumnFlags::UNSIGNED_FLAG;
        }
        c
    }

    #[test]
    pub fn test_decode_text_row() {
        // "1", NULL, "ab"
        let payload = [1, b'1', 0xfb, 2, b'a', b'b'];
        let row = decode_text_row(&payload, 3).unwrap();
        assert_eq!(row[0], Value::Bytes(b"1".to_vec()));
        assert_eq!(row[1], Value::Null);
        assert_eq!(row[2], Value::Bytes(b"ab".to_vec()));
    }

    #[test]
    pub fn test_decode_binary_row_ints_and_null() {
        let columns = vec![
            col(ColumnType::MYSQL_TYPE_LONG, false),
            col(ColumnType::MYSQL_TYPE_TINY, false),
            col(ColumnType::MYSQL_TYPE_LONGLONG, true),
        ];
        // null bitmap: column 1 (offset bit 3) null
        let mut payload = vec![0x00, 0b0000_1000];
        payload.extend_from_slice(&0xfffffff6u32.to_le_bytes()); // -10 as i32
        payload.extend_from_slice(&u64::MAX.to_le_bytes());
        let row = decode_binary_row(&payload, &columns).unwrap();
        assert_eq!(row[0], Value::Int(-10));
        assert_eq!(row[1], Value::Null);
        assert_eq!(row[2], Value::UInt(u64::MAX));
    }

    #[test]
    pub fn test_decode_binary_temporals() {
        let columns = vec![
            col(ColumnType::MYSQL_TYPE_DATETIME, false),
            col(ColumnType::MYSQL_TYPE_TIME, false),
        ];
        let mut payload = vec![0x00, 0x00];
        payload.push(7); // datetime, second precision
        payload.extend_from_slice(&2023u16.to_le_bytes());
        payload.extend_from_slice(&[4, 5, 6, 7, 8]);
        payload.push(12); // time with micros
        payload.push(1); // negative
        payload.extend_from_slice(&1u32.to_le_bytes()); // 1 day
        payload.extend_from_slice(&[2, 3, 4]);
        payload.extend_from_slice(&500u32.to_le_bytes());
        let row = decode_binary_row(&payload, &columns).unwrap();
        assert_eq!(
            row[0],
            Value::Date {
                year: 2023,
                month: 4,
                day: 5,
                hour: 6,
                minute: 7,
                second: 8,
                micros: 0
            }
        );
        assert_eq!(
            row[1],
            Value::Time {
                negative: true,
                days: 1,
                hours: 2,
                minutes: 3,
                seconds: 4,
                micros: 500
            }
        );
    }

    #[test]
    pub fn test_zero_length_temporal() {
        let columns = vec![col(ColumnType::MYSQL_TYPE_DATE, false)];
        let payload = vec![0x00, 0x00, 0]; // len 0 = zero date
        let row = decode_binary_row(&payload, &columns).unwrap();
        assert_eq!(
            row[0],
            Value::Date {
                year: 0,
                month: 0,
                day: 0,
                hour: 0,
                minute: 0,
                second: 0,
                micros: 0
            }
        );
    }
}
