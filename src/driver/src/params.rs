use std::fmt;
use std::io::Read;

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use mysql_common::constants::ColumnType;

use crate::error::{Result, SqlError};

const QUOTE: u8 = b'\'';
const BACKSLASH: u8 = b'\\';
const DBL_QUOTE: u8 = b'"';
const ZERO_BYTE: u8 = 0;

/// Escape a byte run into a quoted SQL literal body. Quotes are doubled;
/// unless the session runs with NO_BACKSLASH_ESCAPES, backslash, double
/// quote and NUL are backslash-escaped as well.
pub fn escape_bytes(input: &[u8], no_backslash_escapes: bool, out: &mut Vec<u8>) {
    out.reserve(input.len() + 16);
    if no_backslash_escapes {
        for &b in input {
            if b == QUOTE {
                out.push(QUOTE);
            }
            out.push(b);
        }
    } else {
        for &b in input {
            if b == QUOTE || b == BACKSLASH || b == DBL_QUOTE || b == ZERO_BYTE {
                out.push(BACKSLASH);
            }
            out.push(b);
        }
    }
}

/// TIME value with explicit sign; MySQL TIME spans more than a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeParam {
    pub negative: bool,
    pub hours: u32,
    pub minutes: u8,
    pub seconds: u8,
    pub micros: u32,
}

impl From<NaiveTime> for TimeParam {
    fn from(t: NaiveTime) -> Self {
        TimeParam {
            negative: false,
            hours: t.hour(),
            minutes: t.minute() as u8,
            seconds: t.second() as u8,
            micros: t.nanosecond() / 1000,
        }
    }
}

/// Stream parameter, uploaded through COM_STMT_SEND_LONG_DATA before
/// execute.
pub struct LongDataParam {
    pub stream: Box<dyn Read + Send>,
}

impl fmt::Debug for LongDataParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LongDataParam { .. }")
    }
}

/// One bound parameter value with its text and binary serializations.
#[derive(Debug)]
pub enum ParameterHolder {
    Null(ColumnType),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    ULong(u64),
    Float(f32),
    Double(f64),
    Decimal(String),
    Boolean(bool),
    Bytes(Vec<u8>),
    Text(String),
    Date(NaiveDate),
    Time(TimeParam),
    Timestamp(NaiveDateTime),
    LongData(LongDataParam),
}

impl ParameterHolder {
    pub fn is_null(&self) -> bool {
        matches!(self, ParameterHolder::Null(_))
    }

    pub fn is_long_data(&self) -> bool {
        matches!(self, ParameterHolder::LongData(_))
    }

    /// Binary-protocol column type of this value.
    pub fn column_type(&self) -> ColumnType {
        match self {
            ParameterHolder::Null(t) => *t,
            ParameterHolder::Byte(_) => ColumnType::MYSQL_TYPE_TINY,
            ParameterHolder::Short(_) => ColumnType::MYSQL_TYPE_SHORT,
            ParameterHolder::Int(_) => ColumnType::MYSQL_TYPE_LONG,
            ParameterHolder::Long(_) | ParameterHolder::ULong(_) => {
                ColumnType::MYSQL_TYPE_LONGLONG
            }
            ParameterHolder::Float(_) => ColumnType::MYSQL_TYPE_FLOAT,
            ParameterHolder::Double(_) => ColumnType::MYSQL_TYPE_DOUBLE,
            ParameterHolder::Decimal(_) => ColumnType::MYSQL_TYPE_NEWDECIMAL,
            ParameterHolder::Boolean(_) => ColumnType::MYSQL_TYPE_TINY,
            ParameterHolder::Bytes(_) | ParameterHolder::LongData(_) => {
                ColumnType::MYSQL_TYPE_BLOB
            }
            ParameterHolder::Text(_) => ColumnType::MYSQL_TYPE_VAR_STRING,
            ParameterHolder::Date(_) => ColumnType::MYSQL_TYPE_DATE,
            ParameterHolder::Time(_) => ColumnType::MYSQL_TYPE_TIME,
            ParameterHolder::Timestamp(_) => ColumnType::MYSQL_TYPE_DATETIME,
        }
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, ParameterHolder::ULong(_))
    }

    /// Append the SQL-literal form to a client-prepared query buffer.
    pub fn write_text(&mut self, out: &mut Vec<u8>, no_backslash_escapes: bool) -> Result<()> {
        match self {
            ParameterHolder::Null(_) => out.extend_from_slice(b"NULL"),
            ParameterHolder::Byte(v) => out.extend_from_slice(v.to_string().as_bytes()),
            ParameterHolder::Short(v) => out.extend_from_slice(v.to_string().as_bytes()),
            ParameterHolder::Int(v) => out.extend_from_slice(v.to_string().as_bytes()),
            ParameterHolder::Long(v) => out.extend_from_slice(v.to_string().as_bytes()),
            ParameterHolder::ULong(v) => out.extend_from_slice(v.to_string().as_bytes()),
            ParameterHolder::Float(v) => out.extend_from_slice(v.to_string().as_bytes()),
            ParameterHolder::Double(v) => out.extend_from_slice(v.to_string().as_bytes()),
            ParameterHolder::Decimal(v) => out.extend_from_slice(v.as_bytes()),
            ParameterHolder::Boolean(v) => out.push(if *v { b'1' } else { b'0' }),
            ParameterHolder::Text(v) => {
                out.push(QUOTE);
                escape_bytes(v.as_bytes(), no_backslash_escapes, out);
                out.push(QUOTE);
            }
            ParameterHolder::Bytes(v) => {
                out.extend_from_slice(b"_binary'");
                escape_bytes(v, no_backslash_escapes, out);
                out.push(QUOTE);
            }
            ParameterHolder::Date(d) => {
                out.push(QUOTE);
                out.extend_from_slice(d.format("%Y-%m-%d").to_string().as_bytes());
                out.push(QUOTE);
            }
            ParameterHolder::Time(t) => {
                out.push(QUOTE);
                if t.negative {
                    out.push(b'-');
                }
                out.extend_from_slice(
                    format!("{:02}:{:02}:{:02}", t.hours, t.minutes, t.seconds).as_bytes(),
                );
                if t.micros > 0 {
                    out.extend_from_slice(format!(".{:06}", t.micros).as_bytes());
                }
                out.push(QUOTE);
            }
            ParameterHolder::Timestamp(ts) => {
                out.push(QUOTE);
                out.extend_from_slice(ts.format("%Y-%m-%d %H:%M:%S").to_string().as_bytes());
                let micros = ts.and_utc().timestamp_subsec_micros();
                if micros > 0 {
                    out.extend_from_slice(format!(".{micros:06}").as_bytes());
                }
                out.push(QUOTE);
            }
            ParameterHolder::LongData(ld) => {
                let mut data = Vec::new();
                ld.stream
                    .read_to_end(&mut data)
                    .map_err(SqlError::from)?;
                out.extend_from_slice(b"_binary'");
                escape_bytes(&data, no_backslash_escapes, out);
                out.push(QUOTE);
                // stream is consumed; keep the bytes for any re-execution
                *self = ParameterHolder::Bytes(data);
            }
        }
        Ok(())
    }

    /// Append the binary-protocol cell for COM_STMT_EXECUTE. NULL values
    /// are carried in the null bitmap and write nothing here.
    pub fn write_binary(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            ParameterHolder::Null(_) | ParameterHolder::LongData(_) => {}
            ParameterHolder::Byte(v) => out.push(*v as u8),
            ParameterHolder::Short(v) => out.write_i16::<LittleEndian>(*v).unwrap(),
            ParameterHolder::Int(v) => out.write_i32::<LittleEndian>(*v).unwrap(),
            ParameterHolder::Long(v) => out.write_i64::<LittleEndian>(*v).unwrap(),
            ParameterHolder::ULong(v) => out.write_u64::<LittleEndian>(*v).unwrap(),
            ParameterHolder::Float(v) => out.write_f32::<LittleEndian>(*v).unwrap(),
            ParameterHolder::Double(v) => out.write_f64::<LittleEndian>(*v).unwrap(),
            ParameterHolder::Boolean(v) => out.push(*v as u8),
            ParameterHolder::Decimal(v) => write_lenenc_bytes(out, v.as_bytes()),
            ParameterHolder::Text(v) => write_lenenc_bytes(out, v.as_bytes()),
            ParameterHolder::Bytes(v) => write_lenenc_bytes(out, v),
            ParameterHolder::Date(d) => {
                out.push(4);
                out.write_u16::<LittleEndian>(d.year() as u16).unwrap();
                out.push(d.month() as u8);
                out.push(d.day() as u8);
            }
            ParameterHolder::Time(t) => {
                let days = t.hours / 24;
                let hours = (t.hours % 24) as u8;
                if t.micros > 0 {
                    out.push(12);
                } else {
                    out.push(8);
                }
                out.push(t.negative as u8);
                out.write_u32::<LittleEndian>(days).unwrap();
                out.push(hours);
                out.push(t.minutes);
                out.push(t.seconds);
                if t.micros > 0 {
                    out.write_u32::<LittleEndian>(t.micros).unwrap();
                }
            }
            ParameterHolder::Timestamp(ts) => {
                let micros = ts.and_utc().timestamp_subsec_micros();
                out.push(if micros > 0 { 11 } else { 7 });
                out.write_u16::<LittleEndian>(ts.year() as u16).unwrap();
                out.push(ts.month() as u8);
                out.push(ts.day() as u8);
                out.push(ts.hour() as u8);
                out.push(ts.minute() as u8);
                out.push(ts.second() as u8);
                if micros > 0 {
                    out.write_u32::<LittleEndian>(micros).unwrap();
                }
            }
        }
        Ok(())
    }

    /// Duplicate the value. Streams cannot be duplicated; batching moves
    /// them instead.
    pub fn try_clone(&self) -> Option<ParameterHolder> {
        match self {
            ParameterHolder::Null(t) => Some(ParameterHolder::Null(*t)),
            ParameterHolder::Byte(v) => Some(ParameterHolder::Byte(*v)),
            ParameterHolder::Short(v) => Some(ParameterHolder::Short(*v)),
            ParameterHolder::Int(v) => Some(ParameterHolder::Int(*v)),
            ParameterHolder::Long(v) => Some(ParameterHolder::Long(*v)),
            ParameterHolder::ULong(v) => Some(ParameterHolder::ULong(*v)),
            ParameterHolder::Float(v) => Some(ParameterHolder::Float(*v)),
            ParameterHolder::Double(v) => Some(ParameterHolder::Double(*v)),
            ParameterHolder::Decimal(v) => Some(ParameterHolder::Decimal(v.clone())),
            ParameterHolder::Boolean(v) => Some(ParameterHolder::Boolean(*v)),
            ParameterHolder::Bytes(v) => Some(ParameterHolder::Bytes(v.clone())),
            ParameterHolder::Text(v) => Some(ParameterHolder::Text(v.clone())),
            ParameterHolder::Date(v) => Some(ParameterHolder::Date(*v)),
            ParameterHolder::Time(v) => Some(ParameterHolder::Time(*v)),
            ParameterHolder::Timestamp(v) => Some(ParameterHolder::Timestamp(*v)),
            ParameterHolder::LongData(_) => None,
        }
    }

    /// Short rendering for error messages and INFILE validation.
    pub fn display_snapshot(&self) -> String {
        match self {
            ParameterHolder::Text(v) => format!("'{v}'"),
            ParameterHolder::Null(_) => "NULL".to_string(),
            ParameterHolder::Bytes(v) => format!("<{} bytes>", v.len()),
            ParameterHolder::LongData(_) => "<stream>".to_string(),
            other => {
                let mut out = Vec::new();
                // numeric and temporal forms have no escaping concerns
                let mut probe = match other.try_clone() {
                    Some(p) => p,
                    None => return "<stream>".to_string(),
                };
                if probe.write_text(&mut out, true).is_ok() {
                    String::from_utf8_lossy(&out).into_owned()
                } else {
                    "?".to_string()
                }
            }
        }
    }

    /// Upper bound of the text-protocol length, used to pack rewrite
    /// batches below max_allowed_packet. −1 when unknown.
    pub fn approximate_text_len(&self) -> i64 {
        match self {
            ParameterHolder::Null(_) => 4,
            ParameterHolder::Byte(_) => 4,
            ParameterHolder::Short(_) => 6,
            ParameterHolder::Int(_) => 11,
            ParameterHolder::Long(_) | ParameterHolder::ULong(_) => 20,
            ParameterHolder::Float(_) => 15,
            ParameterHolder::Double(_) => 24,
            ParameterHolder::Decimal(v) => v.len() as i64,
            ParameterHolder::Boolean(_) => 1,
            ParameterHolder::Text(v) => v.len() as i64 * 2 + 2,
            ParameterHolder::Bytes(v) => v.len() as i64 * 2 + 9,
            ParameterHolder::Date(_) => 12,
            ParameterHolder::Time(_) => 17,
            ParameterHolder::Timestamp(_) => 28,
            ParameterHolder::LongData(_) => -1,
        }
    }
}

fn write_lenenc_bytes(out: &mut Vec<u8>, data: &[u8]) {
    let len = data.len() as u64;
    if len < 251 {
        out.push(len as u8);
    } else if len < 65_536 {
        out.push(0xfc);
        out.write_u16::<LittleEndian>(len as u16).unwrap();
    } else if len < 16_777_216 {
        out.push(0xfd);
        out.write_u24::<LittleEndian>(len as u32).unwrap();
    } else {
        out.push(0xfe);
        out.write_u64::<LittleEndian>(len).unwrap();
    }
    out.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(param: &mut ParameterHolder, no_backslash: bool) -> Vec<u8> {
        let mut out = Vec::new();
        param.write_text(&mut out, no_backslash).unwrap();
        out
    }

    #[test]
    pub fn test_string_escaping() {
        let mut p = ParameterHolder::Text("o'ha\\ra".to_string());
        assert_eq!(text_of(&mut p, false), b"'o\\'ha\\\\ra'".to_vec());
        let mut p = ParameterHolder::Text("o'hara".to_string());
        assert_eq!(text_of(&mut p, true), b"'o''hara'".to_vec());
    }

    #[test]
    pub fn test_quote_and_semicolon_literals() {
        let mut p = ParameterHolder::Text("'".to_string());
        assert_eq!(text_of(&mut p, false), b"'\\''".to_vec());
        let mut p = ParameterHolder::Text("\"".to_string());
        assert_eq!(text_of(&mut p, false), b"'\\\"'".to_vec());
        let mut p = ParameterHolder::Text(";".to_string());
        assert_eq!(text_of(&mut p, false), b"';'".to_vec());
    }

    #[test]
    pub fn test_numeric_and_null_text() {
        assert_eq!(text_of(&mut ParameterHolder::Int(-7), false), b"-7".to_vec());
        assert_eq!(
            text_of(&mut ParameterHolder::ULong(u64::MAX), false),
            u64::MAX.to_string().into_bytes()
        );
        assert_eq!(
            text_of(&mut ParameterHolder::Null(ColumnType::MYSQL_TYPE_NULL), false),
            b"NULL".to_vec()
        );
    }

    #[test]
    pub fn test_temporal_text_forms() {
        let date = NaiveDate::from_ymd_opt(2023, 4, 5).unwrap();
        assert_eq!(
            text_of(&mut ParameterHolder::Date(date), false),
            b"'2023-04-05'".to_vec()
        );
        let time = TimeParam {
            negative: true,
            hours: 101,
            minutes: 2,
            seconds: 3,
            micros: 400,
        };
        assert_eq!(
            text_of(&mut ParameterHolder::Time(time), false),
            b"'-101:02:03.000400'".to_vec()
        );
    }

    #[test]
    pub fn test_binary_int_encoding() {
        let mut out = Vec::new();
        ParameterHolder::Int(0x01020304).write_binary(&mut out).unwrap();
        assert_eq!(out, vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    pub fn test_binary_lenenc_string() {
        let mut out = Vec::new();
        ParameterHolder::Text("ab".to_string())
            .write_binary(&mut out)
            .unwrap();
        assert_eq!(out, vec![2, b'a', b'b']);
    }

    #[test]
    pub fn test_long_data_flag_and_estimate() {
        let p = ParameterHolder::LongData(LongDataParam {
            stream: Box::new(std::io::Cursor::new(vec![1, 2, 3])),
        });
        assert!(p.is_long_data());
        assert_eq!(p.approximate_text_len(), -1);
        assert!(ParameterHolder::Int(1).approximate_text_len() > 0);
    }

    #[test]
    pub fn test_time_binary_split_days() {
        let t = TimeParam {
            negative: false,
            hours: 26,
            minutes: 1,
            seconds: 2,
            micros: 0,
        };
        let mut out = Vec::new();
        ParameterHolder::Time(t).write_binary(&mut out).unwrap();
        assert_eq!(out, vec![8, 0, 1, 0, 0, 0, 2, 1, 2]);
    }
}
