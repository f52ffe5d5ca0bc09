use std::collections::HashMap;
use std::io;

use mysql_common::constants::{ColumnFlags, ColumnType};

use crate::error::{Result, SqlError};
use crate::protocol::packet::PacketBuf;

/// Column metadata of a result set, decoded from a ColumnDefinition41
/// packet or assembled directly for virtual result sets.
#[derive(Debug, Clone)]
pub struct ColumnInformation {
    pub schema: String,
    pub table: String,
    pub original_table: String,
    pub name: String,
    pub original_name: String,
    pub charset: u16,
    /// display size in bytes (column definition "length" field)
    pub length: u32,
    pub column_type: ColumnType,
    pub flags: ColumnFlags,
    pub decimals: u8,
}

impl ColumnInformation {
    /// Decode a ColumnDefinition41 payload.
    pub fn parse(payload: &[u8]) -> io::Result<ColumnInformation> {
        let mut buf = PacketBuf::new(payload);
        let _catalog = buf.read_lenenc_bytes()?; // always "def"
        let schema = buf.read_lenenc_string()?;
        let table = buf.read_lenenc_string()?;
        let original_table = buf.read_lenenc_string()?;
        let name = buf.read_lenenc_string()?;
        let original_name = buf.read_lenenc_string()?;
        let _fixed_len = buf.read_lenenc_int()?; // 0x0c
        let charset = buf.read_u16_le()?;
        let length = buf.read_u32_le()?;
        let type_tag = buf.read_u8()?;
        let flags = ColumnFlags::from_bits_truncate(buf.read_u16_le()?);
        let decimals = buf.read_u8()?;
        Ok(ColumnInformation {
            schema,
            table,
            original_table,
            name,
            original_name,
            charset,
            length,
            column_type: column_type_from_tag(type_tag),
            flags,
            decimals,
        })
    }

    /// Metadata for driver-built (virtual) result sets.
    pub fn synthetic(name: &str, column_type: ColumnType) -> ColumnInformation {
        ColumnInformation {
            schema: String::new(),
            table: String::new(),
            original_table: String::new(),
            name: name.to_string(),
            original_name: name.to_string(),
            charset: 33,
            length: 64,
            column_type,
            flags: ColumnFlags::empty(),
            decimals: 0,
        }
    }

    pub fn is_signed(&self) -> bool {
        !self.flags.contains(ColumnFlags::UNSIGNED_FLAG)
    }

    pub fn is_not_null(&self) -> bool {
        self.flags.contains(ColumnFlags::NOT_NULL_FLAG)
    }

    pub fn is_primary_key(&self) -> bool {
        self.flags.contains(ColumnFlags::PRI_KEY_FLAG)
    }

    pub fn is_zerofill(&self) -> bool {
        self.flags.contains(ColumnFlags::ZEROFILL_FLAG)
    }

    pub fn is_binary(&self) -> bool {
        self.flags.contains(ColumnFlags::BINARY_FLAG)
    }

    pub fn is_blob(&self) -> bool {
        self.flags.contains(ColumnFlags::BLOB_FLAG)
    }

    /// Decimal digits the column can hold.
    pub fn precision(&self) -> u32 {
        match self.column_type {
            ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
                let sign = if self.is_signed() { 1 } else { 0 };
                let point = if self.decimals > 0 { 1 } else { 0 };
                self.length.saturating_sub(sign + point)
            }
            _ => self.length,
        }
    }

    pub fn scale(&self) -> u8 {
        self.decimals
    }
}

pub fn column_type_from_tag(tag: u8) -> ColumnType {
    match tag {
        0 => ColumnType::MYSQL_TYPE_DECIMAL,
        1 => ColumnType::MYSQL_TYPE_TINY,
        2 => ColumnType::MYSQL_TYPE_SHORT,
        3 => ColumnType::MYSQL_TYPE_LONG,
        4 => ColumnType::MYSQL_TYPE_FLOAT,
        5 => ColumnType::MYSQL_TYPE_DOUBLE,
        6 => ColumnType::MYSQL_TYPE_NULL,
        7 => ColumnType::MYSQL_TYPE_TIMESTAMP,
        8 => ColumnType::MYSQL_TYPE_LONGLONG,
        9 => ColumnType::MYSQL_TYPE_INT24,
        10 => ColumnType::MYSQL_TYPE_DATE,
        11 => ColumnType::MYSQL_TYPE_TIME,
        12 => ColumnType::MYSQL_TYPE_DATETIME,
        13 => ColumnType::MYSQL_TYPE_YEAR,
        14 => ColumnType::MYSQL_TYPE_NEWDATE,
        15 => ColumnType::MYSQL_TYPE_VARCHAR,
        16 => ColumnType::MYSQL_TYPE_BIT,
        245 => ColumnType::MYSQL_TYPE_JSON,
        246 => ColumnType::MYSQL_TYPE_NEWDECIMAL,
        247 => ColumnType::MYSQL_TYPE_ENUM,
        248 => ColumnType::MYSQL_TYPE_SET,
        249 => ColumnType::MYSQL_TYPE_TINY_BLOB,
        250 => ColumnType::MYSQL_TYPE_MEDIUM_BLOB,
        251 => ColumnType::MYSQL_TYPE_LONG_BLOB,
        252 => ColumnType::MYSQL_TYPE_BLOB,
        253 => ColumnType::MYSQL_TYPE_VAR_STRING,
        254 => ColumnType::MYSQL_TYPE_STRING,
        255 => ColumnType::MYSQL_TYPE_GEOMETRY,
        _ => ColumnType::MYSQL_TYPE_BLOB,
    }
}

/// Lazily built lookup maps: alias names first, `table.column` originals
/// second.
#[derive(Debug)]
pub struct ColumnNameMap {
    alias_map: HashMap<String, usize>,
    original_map: HashMap<String, usize>,
}

impl ColumnNameMap {
    pub fn build(columns: &[ColumnInformation]) -> ColumnNameMap {
        let mut alias_map = HashMap::new();
        let mut original_map = HashMap::new();
        for (idx, col) in columns.iter().enumerate() {
            // first column wins on duplicate names
            if !col.name.is_empty() {
                alias_map.entry(col.name.to_lowercase()).or_insert(idx);
                if !col.table.is_empty() {
                    alias_map
                        .entry(format!(
                            "{}.{}",
                            col.table.to_lowercase(),
                            col.name.to_lowercase()
                        ))
                        .or_insert(idx);
                }
            }
            if !col.original_name.is_empty() {
                original_map
                    .entry(col.original_name.to_lowercase())
                    .or_insert(idx);
                if !col.original_table.is_empty() {
                    original_map
                        .entry(format!(
                            "{}.{}",
                            col.original_table.to_lowercase(),
                            col.original_name.to_lowercase()
                        ))
                        .or_insert(idx);
                }
            }
        }
        ColumnNameMap {
            alias_map,
            original_map,
        }
    }

    /// 0-based index for a label; alias map first, original names second.
    pub fn index(&self, name: &str) -> Result<usize> {
        let key = name.to_lowercase();
        if let Some(idx) = self.alias_map.get(&key) {
            return Ok(*idx);
        }
        if let Some(idx) = self.original_map.get(&key) {
            return Ok(*idx);
        }
        Err(SqlError::new(
            crate::error::ErrorKind::Syntax,
            format!("No such column: '{name}'"),
            "42S22",
            1054,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, original: &str, table: &str, original_table: &str) -> ColumnInformation {
        let mut c = ColumnInformation::synthetic(name, ColumnType::MYSQL_TYPE_LONG);
        c.original_name = original.to_string();
        c.table = table.to_string();
        c.original_table = original_table.to_string();
        c
    }

    #[test]
    pub fn test_name_lookup_alias_first() {
        let columns = vec![
            col("total", "t_total", "o", "orders"),
            col("id", "id", "o", "orders"),
        ];
        let map = ColumnNameMap::build(&columns);
        assert_eq!(map.index("TOTAL").unwrap(), 0);
        assert_eq!(map.index("o.id").unwrap(), 1);
        // falls through to the original name map
        assert_eq!(map.index("t_total").unwrap(), 0);
        assert_eq!(map.index("orders.id").unwrap(), 1);
    }

    #[test]
    pub fn test_unknown_column_error_state() {
        let map = ColumnNameMap::build(&[col("a", "a", "", "")]);
        let err = map.index("missing").unwrap_err();
        assert_eq!(err.sql_state(), "42S22");
        assert_eq!(err.error_code(), 1054);
    }

    #[test]
    pub fn test_parse_column_definition() {
        // def/test/t/t/id/id fixed(0x0c) charset=63 len=11 type=LONG
        // flags=NOT_NULL|PRI_KEY decimals=0
        let mut payload = Vec::new();
        for part in [&b"def"[..], b"test", b"t", b"t", b"id", b"id"] {
            payload.push(part.len() as u8);
            payload.extend_from_slice(part);
        }
        payload.push(0x0c);
        payload.extend_from_slice(&63u16.to_le_bytes());
        payload.extend_from_slice(&11u32.to_le_bytes());
        payload.push(3); // MYSQL_TYPE_LONG
        payload.extend_from_slice(&(0x0001u16 | 0x0002).to_le_bytes());
        payload.push(0);
        payload.extend_from_slice(&[0, 0]);

        let info = ColumnInformation::parse(&payload).unwrap();
        assert_eq!(info.name, "id");
        assert_eq!(info.schema, "test");
        assert_eq!(info.column_type, ColumnType::MYSQL_TYPE_LONG);
        assert!(info.is_not_null());
        assert!(info.is_primary_key());
        assert!(info.is_signed());
    }
}
