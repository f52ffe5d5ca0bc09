pub mod cmd_info;
pub mod column;
pub mod results;
pub mod row;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use mysql_common::constants::ColumnType;

use crate::error::{ErrorKind, Result, SqlError};
use crate::params::TimeParam;
use crate::protocol::Protocol;
use crate::resultset::column::{ColumnInformation, ColumnNameMap};
use crate::resultset::row::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollType {
    ForwardOnly,
    ScrollInsensitive,
    ScrollSensitive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    ReadOnly,
    Updatable,
}

/// Rows already read off the wire but not yet consumed by the cursor,
/// shared between a streaming result set and the protocol that drains it.
pub struct SharedTail {
    pub rows: Mutex<VecDeque<Vec<Value>>>,
    pub eof: AtomicBool,
}

impl SharedTail {
    pub fn new() -> Arc<SharedTail> {
        Arc::new(SharedTail {
            rows: Mutex::new(VecDeque::new()),
            eof: AtomicBool::new(false),
        })
    }
}

/// Streaming attachment of a result set: where the remaining rows come
/// from. The protocol reference is weak; the connection owns the
/// protocol, not its result sets.
pub struct StreamTail {
    pub shared: Arc<SharedTail>,
    pub protocol: Weak<Mutex<Protocol>>,
    pub fetch_size: u32,
}

struct RsInner {
    columns: Arc<Vec<ColumnInformation>>,
    name_map: Option<ColumnNameMap>,
    /// current row window; the full data set once eof is reached unless
    /// streaming already discarded a prefix
    data: VecDeque<Vec<Value>>,
    /// rows dropped in front of the window (forward-only streaming)
    discarded: usize,
    is_eof: bool,
    tail: Option<StreamTail>,
    /// 0 = before first, 1..=N on a row, N+1 = after last
    row_pointer: usize,
    scroll_type: ScrollType,
    callable: bool,
    closed: bool,
    was_null: bool,
}

/// JDBC-shaped result set handle. Clones share state so that an owning
/// statement can close a result set it previously handed out.
#[derive(Clone)]
pub struct ResultSet {
    inner: Arc<Mutex<RsInner>>,
}

impl ResultSet {
    pub fn buffered(
        columns: Arc<Vec<ColumnInformation>>,
        rows: Vec<Vec<Value>>,
        scroll_type: ScrollType,
        callable: bool,
    ) -> ResultSet {
        ResultSet {
            inner: Arc::new(Mutex::new(RsInner {
                columns,
                name_map: None,
                data: rows.into(),
                discarded: 0,
                is_eof: true,
                tail: None,
                row_pointer: 0,
                scroll_type,
                callable,
                closed: false,
                was_null: false,
            })),
        }
    }

    pub fn streaming(
        columns: Arc<Vec<ColumnInformation>>,
        first_rows: Vec<Vec<Value>>,
        tail: StreamTail,
        scroll_type: ScrollType,
        callable: bool,
    ) -> ResultSet {
        ResultSet {
            inner: Arc::new(Mutex::new(RsInner {
                columns,
                name_map: None,
                data: first_rows.into(),
                discarded: 0,
                is_eof: false,
                tail: Some(tail),
                row_pointer: 0,
                scroll_type,
                callable,
                closed: false,
                was_null: false,
            })),
        }
    }

    /// Driver-built in-memory result set (metadata surfaces).
    pub fn virtual_rows(
        columns: Vec<ColumnInformation>,
        rows: Vec<Vec<Value>>,
    ) -> ResultSet {
        ResultSet::buffered(
            Arc::new(columns),
            rows,
            ScrollType::ScrollInsensitive,
            false,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RsInner> {
        self.inner.lock().unwrap()
    }

    pub fn is_callable(&self) -> bool {
        self.lock().callable
    }

    pub fn close(&self) {
        let mut inner = self.lock();
        inner.drain_tail_quietly();
        inner.closed = true;
        inner.data.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn was_null(&self) -> bool {
        self.lock().was_null
    }

    pub fn fetch_size(&self) -> u32 {
        self.lock().tail.as_ref().map(|t| t.fetch_size).unwrap_or(0)
    }

    pub fn column_count(&self) -> usize {
        self.lock().columns.len()
    }

    pub fn metadata(&self) -> ResultSetMetaData {
        ResultSetMetaData {
            columns: self.lock().columns.clone(),
        }
    }

    /// 1-based index for a column label; alias map first, then
    /// `table.column` originals.
    pub fn find_column(&self, label: &str) -> Result<usize> {
        let mut inner = self.lock();
        inner.check_open()?;
        if inner.name_map.is_none() {
            inner.name_map = Some(ColumnNameMap::build(&inner.columns));
        }
        inner.name_map.as_ref().unwrap().index(label).map(|i| i + 1)
    }

    // ---- cursor -------------------------------------------------------

    pub fn next(&self) -> Result<bool> {
        let mut inner = self.lock();
        inner.check_open()?;
        inner.advance()
    }

    pub fn previous(&self) -> Result<bool> {
        let mut inner = self.lock();
        inner.check_open()?;
        inner.check_scrollable()?;
        if inner.row_pointer > 0 {
            inner.row_pointer -= 1;
        }
        Ok(inner.on_row())
    }

    pub fn first(&self) -> Result<bool> {
        let mut inner = self.lock();
        inner.check_open()?;
        inner.check_scrollable()?;
        inner.row_pointer = if inner.total_rows() > 0 { 1 } else { 0 };
        Ok(inner.on_row())
    }

    pub fn last(&self) -> Result<bool> {
        let mut inner = self.lock();
        inner.check_open()?;
        inner.check_scrollable()?;
        inner.row_pointer = inner.total_rows();
        Ok(inner.on_row())
    }

    pub fn before_first(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.check_open()?;
        inner.check_scrollable()?;
        inner.row_pointer = 0;
        Ok(())
    }

    pub fn after_last(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.check_open()?;
        inner.check_scrollable()?;
        inner.row_pointer = inner.total_rows() + 1;
        Ok(())
    }

    pub fn absolute(&self, row: i64) -> Result<bool> {
        let mut inner = self.lock();
        inner.check_open()?;
        inner.check_scrollable()?;
        let total = inner.total_rows() as i64;
        let target = if row >= 0 { row } else { total + row + 1 };
        if target < 1 {
            inner.row_pointer = 0;
            return Ok(false);
        }
        if target > total {
            inner.row_pointer = total as usize + 1;
            return Ok(false);
        }
        inner.row_pointer = target as usize;
        Ok(true)
    }

    pub fn relative(&self, rows: i64) -> Result<bool> {
        let mut inner = self.lock();
        inner.check_open()?;
        if rows < 0 {
            inner.check_scrollable()?;
        }
        let total = inner.total_rows() as i64;
        let target = (inner.row_pointer as i64 + rows).clamp(0, total + 1);
        inner.row_pointer = target as usize;
        Ok(inner.on_row())
    }

    pub fn is_before_first(&self) -> Result<bool> {
        let inner = self.lock();
        Ok(inner.row_pointer == 0 && inner.total_rows() > 0)
    }

    pub fn is_after_last(&self) -> Result<bool> {
        let inner = self.lock();
        Ok(inner.is_eof
            && inner.total_rows() > 0
            && inner.row_pointer > inner.total_rows())
    }

    pub fn is_first(&self) -> Result<bool> {
        Ok(self.lock().row_pointer == 1)
    }

    pub fn is_last(&self) -> Result<bool> {
        let inner = self.lock();
        Ok(inner.is_eof && inner.row_pointer == inner.total_rows() && inner.on_row())
    }

    /// Current row number, 0 when not positioned on a row.
    pub fn get_row(&self) -> Result<u32> {
        let inner = self.lock();
        if inner.on_row() {
            Ok(inner.row_pointer as u32)
        } else {
            Ok(0)
        }
    }

    // ---- getters ------------------------------------------------------

    pub fn get_string(&self, column_index: usize) -> Result<Option<String>> {
        let mut inner = self.lock();
        let (value, column) = inner.current_cell(column_index)?;
        coerce_string(&value, &column)
    }

    pub fn get_string_by_label(&self, label: &str) -> Result<Option<String>> {
        let index = self.find_column(label)?;
        self.get_string(index)
    }

    pub fn get_int(&self, column_index: usize) -> Result<i32> {
        let mut inner = self.lock();
        let (value, column) = inner.current_cell(column_index)?;
        let wide = coerce_long(&value, &column)?;
        i32::try_from(wide)
            .map_err(|_| SqlError::out_of_range(format!("integer out of range: {wide}")))
    }

    pub fn get_int_by_label(&self, label: &str) -> Result<i32> {
        let index = self.find_column(label)?;
        self.get_int(index)
    }

    pub fn get_byte(&self, column_index: usize) -> Result<i8> {
        let mut inner = self.lock();
        let (value, column) = inner.current_cell(column_index)?;
        let wide = coerce_long(&value, &column)?;
        i8::try_from(wide)
            .map_err(|_| SqlError::out_of_range(format!("byte out of range: {wide}")))
    }

    pub fn get_short(&self, column_index: usize) -> Result<i16> {
        let mut inner = self.lock();
        let (value, column) = inner.current_cell(column_index)?;
        let wide = coerce_long(&value, &column)?;
        i16::try_from(wide)
            .map_err(|_| SqlError::out_of_range(format!("smallint out of range: {wide}")))
    }

    pub fn get_long(&self, column_index: usize) -> Result<i64> {
        let mut inner = self.lock();
        let (value, column) = inner.current_cell(column_index)?;
        coerce_long(&value, &column)
    }

    pub fn get_long_by_label(&self, label: &str) -> Result<i64> {
        let index = self.find_column(label)?;
        self.get_long(index)
    }

    pub fn get_ulong(&self, column_index: usize) -> Result<u64> {
        let mut inner = self.lock();
        let (value, column) = inner.current_cell(column_index)?;
        coerce_ulong(&value, &column)
    }

    pub fn get_float(&self, column_index: usize) -> Result<f32> {
        let mut inner = self.lock();
        let (value, column) = inner.current_cell(column_index)?;
        coerce_double(&value, &column).map(|d| d as f32)
    }

    pub fn get_double(&self, column_index: usize) -> Result<f64> {
        let mut inner = self.lock();
        let (value, column) = inner.current_cell(column_index)?;
        coerce_double(&value, &column)
    }

    pub fn get_boolean(&self, column_index: usize) -> Result<bool> {
        let mut inner = self.lock();
        let (value, column) = inner.current_cell(column_index)?;
        coerce_boolean(&value, &column)
    }

    pub fn get_bytes(&self, column_index: usize) -> Result<Option<Vec<u8>>> {
        let mut inner = self.lock();
        let (value, column) = inner.current_cell(column_index)?;
        coerce_bytes(&value, &column)
    }

    pub fn get_decimal(&self, column_index: usize) -> Result<Option<String>> {
        let mut inner = self.lock();
        let (value, column) = inner.current_cell(column_index)?;
        coerce_string(&value, &column)
    }

    pub fn get_date(&self, column_index: usize) -> Result<Option<chrono::NaiveDate>> {
        let mut inner = self.lock();
        let (value, column) = inner.current_cell(column_index)?;
        coerce_date(&value, &column)
    }

    pub fn get_time(&self, column_index: usize) -> Result<Option<TimeParam>> {
        let mut inner = self.lock();
        let (value, column) = inner.current_cell(column_index)?;
        coerce_time(&value, &column)
    }

    pub fn get_timestamp(
        &self,
        column_index: usize,
    ) -> Result<Option<chrono::NaiveDateTime>> {
        let mut inner = self.lock();
        let (value, column) = inner.current_cell(column_index)?;
        coerce_timestamp(&value, &column)
    }
}

impl RsInner {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(SqlError::closed_explicitly("getObject"));
        }
        Ok(())
    }

    fn check_scrollable(&self) -> Result<()> {
        if self.scroll_type == ScrollType::ForwardOnly {
            return Err(SqlError::invalid_argument(
                "Invalid operation on TYPE_FORWARD_ONLY ResultSet",
            ));
        }
        Ok(())
    }

    /// Known row count; final only once eof was reached.
    fn total_rows(&self) -> usize {
        self.discarded + self.data.len()
    }

    fn on_row(&self) -> bool {
        self.row_pointer >= 1 && self.row_pointer <= self.total_rows()
    }

    fn advance(&mut self) -> Result<bool> {
        let target = self.row_pointer + 1;
        if target > self.total_rows() && !self.is_eof {
            self.fetch_more()?;
        }
        if target > self.total_rows() {
            // cursor parks after the last row
            self.row_pointer = self.total_rows() + 1;
            return Ok(false);
        }
        self.row_pointer = target;
        Ok(true)
    }

    /// Pull the next window from the shared tail, reading from the socket
    /// when the tail is empty.
    fn fetch_more(&mut self) -> Result<()> {
        let (shared, fetch_size, protocol) = match &self.tail {
            None => {
                self.is_eof = true;
                return Ok(());
            }
            Some(tail) => (tail.shared.clone(), tail.fetch_size, tail.protocol.clone()),
        };

        let queued = shared.rows.lock().unwrap().len();
        if queued == 0 && !shared.eof.load(Ordering::Acquire) {
            match protocol.upgrade() {
                Some(protocol) => {
                    let mut guard = protocol.lock().unwrap();
                    guard.read_stream_rows(&shared, fetch_size)?;
                }
                None => {
                    return Err(SqlError::closed_explicitly("next"));
                }
            }
        }

        // forward-only streaming keeps only the active window
        if self.scroll_type == ScrollType::ForwardOnly && self.row_pointer >= self.total_rows()
        {
            self.discarded += self.data.len();
            self.data.clear();
        }
        let mut queue = shared.rows.lock().unwrap();
        while let Some(row) = queue.pop_front() {
            self.data.push_back(row);
        }
        let drained = shared.eof.load(Ordering::Acquire) && queue.is_empty();
        drop(queue);
        if drained {
            self.is_eof = true;
            self.tail = None;
        }
        Ok(())
    }

    /// Silently consume the remaining stream on close.
    fn drain_tail_quietly(&mut self) {
        if let Some(tail) = self.tail.take() {
            if !tail.shared.eof.load(Ordering::Acquire) {
                if let Some(protocol) = tail.protocol.upgrade() {
                    if let Ok(mut guard) = protocol.lock() {
                        let _ = guard.read_stream_rows(&tail.shared, 0);
                    }
                }
            }
        }
    }

    fn current_cell(&mut self, column_index: usize) -> Result<(Value, ColumnInformation)> {
        self.check_open()?;
        if column_index == 0 || column_index > self.columns.len() {
            return Err(SqlError::new(
                ErrorKind::Data,
                format!(
                    "No such column: {column_index} (columns go from 1 to {})",
                    self.columns.len()
                ),
                "22023",
                0,
            ));
        }
        if self.row_pointer == 0 {
            return Err(SqlError::new(
                ErrorKind::Data,
                "Current position is before the first row",
                "22023",
                0,
            ));
        }
        if self.row_pointer > self.total_rows() {
            return Err(SqlError::new(
                ErrorKind::Data,
                "Current position is after the last row",
                "22023",
                0,
            ));
        }
        let window_index = self.row_pointer - 1 - self.discarded;
        let value = self.data[window_index][column_index - 1].clone();
        self.was_null = value.is_null();
        Ok((value, self.columns[column_index - 1].clone()))
    }
}

/// Column metadata facade over the shared column vector.
#[derive(Clone)]
pub struct ResultSetMetaData {
    columns: Arc<Vec<ColumnInformation>>,
}

impl ResultSetMetaData {
    fn column(&self, index: usize) -> Result<&ColumnInformation> {
        index
            .checked_sub(1)
            .and_then(|i| self.columns.get(i))
            .ok_or_else(|| SqlError::invalid_argument(format!("no column at index {index}")))
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_label(&self, index: usize) -> Result<&str> {
        self.column(index).map(|c| c.name.as_str())
    }

    pub fn column_name(&self, index: usize) -> Result<&str> {
        self.column(index).map(|c| c.original_name.as_str())
    }

    pub fn table_name(&self, index: usize) -> Result<&str> {
        self.column(index).map(|c| c.table.as_str())
    }

    pub fn schema_name(&self, index: usize) -> Result<&str> {
        self.column(index).map(|c| c.schema.as_str())
    }

    pub fn column_type(&self, index: usize) -> Result<ColumnType> {
        self.column(index).map(|c| c.column_type)
    }

    pub fn is_nullable(&self, index: usize) -> Result<bool> {
        self.column(index).map(|c| !c.is_not_null())
    }

    pub fn is_signed(&self, index: usize) -> Result<bool> {
        self.column(index).map(|c| c.is_signed())
    }

    pub fn precision(&self, index: usize) -> Result<u32> {
        self.column(index).map(|c| c.precision())
    }

    pub fn scale(&self, index: usize) -> Result<u8> {
        self.column(index).map(|c| c.scale())
    }
}

// ---- coercion table ---------------------------------------------------

fn bit_to_u64(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for &b in bytes.iter().take(8) {
        value = (value << 8) | b as u64;
    }
    value
}

fn parse_ascii<T: std::str::FromStr>(bytes: &[u8], what: &str) -> Result<T> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| SqlError::data(format!("could not parse {what}"), "22018"))?;
    text.trim()
        .parse::<T>()
        .map_err(|_| SqlError::data(format!("could not parse '{text}' as {what}"), "22018"))
}

fn coerce_string(value: &Value, column: &ColumnInformation) -> Result<Option<String>> {
    let text = match value {
        Value::Null => return Ok(None),
        Value::Bytes(bytes) => {
            if column.column_type == ColumnType::MYSQL_TYPE_BIT {
                bit_to_u64(bytes).to_string()
            } else {
                String::from_utf8_lossy(bytes).into_owned()
            }
        }
        Value::Int(v) => zerofill(v.to_string(), column),
        Value::UInt(v) => zerofill(v.to_string(), column),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Date {
            year,
            month,
            day,
            hour,
            minute,
            second,
            micros,
        } => {
            if column.column_type == ColumnType::MYSQL_TYPE_DATE {
                format!("{year:04}-{month:02}-{day:02}")
            } else if *micros > 0 {
                format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
                )
            } else {
                format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
            }
        }
        Value::Time {
            negative,
            days,
            hours,
            minutes,
            seconds,
            micros,
        } => {
            let sign = if *negative { "-" } else { "" };
            let total_hours = days * 24 + *hours as u32;
            if *micros > 0 {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micros:06}")
            } else {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}")
            }
        }
    };
    Ok(Some(text))
}

fn zerofill(text: String, column: &ColumnInformation) -> String {
    if !column.is_zerofill() {
        return text;
    }
    let width = column.length as usize;
    if text.len() >= width || text.starts_with('-') {
        return text;
    }
    format!("{}{}", "0".repeat(width - text.len()), text)
}

fn coerce_long(value: &Value, column: &ColumnInformation) -> Result<i64> {
    match value {
        Value::Null => Ok(0),
        Value::Int(v) => Ok(*v),
        Value::UInt(v) => i64::try_from(*v)
            .map_err(|_| SqlError::out_of_range(format!("value {v} out of range"))),
        Value::Float(v) => Ok(*v as i64),
        Value::Double(v) => Ok(*v as i64),
        Value::Bytes(bytes) => {
            if column.column_type == ColumnType::MYSQL_TYPE_BIT {
                let v = bit_to_u64(bytes);
                return i64::try_from(v)
                    .map_err(|_| SqlError::out_of_range(format!("value {v} out of range")));
            }
            // server sends exact decimal text; a fractional part means the
            // column is not integral
            if bytes.contains(&b'.') {
                let v: f64 = parse_ascii(bytes, "number")?;
                Ok(v as i64)
            } else {
                parse_ascii(bytes, "integer")
            }
        }
        other => Err(SqlError::data(
            format!("cannot convert {other:?} to integer"),
            "22018",
        )),
    }
}

fn coerce_ulong(value: &Value, column: &ColumnInformation) -> Result<u64> {
    match value {
        Value::Null => Ok(0),
        Value::UInt(v) => Ok(*v),
        Value::Int(v) => u64::try_from(*v)
            .map_err(|_| SqlError::out_of_range(format!("value {v} out of range"))),
        Value::Bytes(bytes) => {
            if column.column_type == ColumnType::MYSQL_TYPE_BIT {
                Ok(bit_to_u64(bytes))
            } else {
                parse_ascii(bytes, "unsigned integer")
            }
        }
        Value::Float(v) if *v >= 0.0 => Ok(*v as u64),
        Value::Double(v) if *v >= 0.0 => Ok(*v as u64),
        other => Err(SqlError::data(
            format!("cannot convert {other:?} to unsigned integer"),
            "22018",
        )),
    }
}

fn coerce_double(value: &Value, _column: &ColumnInformation) -> Result<f64> {
    match value {
        Value::Null => Ok(0.0),
        Value::Int(v) => Ok(*v as f64),
        Value::UInt(v) => Ok(*v as f64),
        Value::Float(v) => Ok(*v as f64),
        Value::Double(v) => Ok(*v),
        Value::Bytes(bytes) => parse_ascii(bytes, "double"),
        other => Err(SqlError::data(
            format!("cannot convert {other:?} to double"),
            "22018",
        )),
    }
}

fn coerce_boolean(value: &Value, column: &ColumnInformation) -> Result<bool> {
    match value {
        Value::Null => Ok(false),
        Value::Int(v) => Ok(*v != 0),
        Value::UInt(v) => Ok(*v != 0),
        Value::Float(v) => Ok(*v != 0.0),
        Value::Double(v) => Ok(*v != 0.0),
        Value::Bytes(bytes) => {
            if column.column_type == ColumnType::MYSQL_TYPE_BIT {
                return Ok(bit_to_u64(bytes) != 0);
            }
            let text = String::from_utf8_lossy(bytes);
            match text.to_lowercase().as_str() {
                "true" | "1" | "y" => Ok(true),
                "false" | "0" | "n" => Ok(false),
                other => Err(SqlError::data(
                    format!("cannot convert '{other}' to boolean"),
                    "22018",
                )),
            }
        }
        other => Err(SqlError::data(
            format!("cannot convert {other:?} to boolean"),
            "22018",
        )),
    }
}

fn coerce_bytes(value: &Value, column: &ColumnInformation) -> Result<Option<Vec<u8>>> {
    match value {
        Value::Null => Ok(None),
        Value::Bytes(bytes) => Ok(Some(bytes.clone())),
        other => coerce_string(other, column).map(|s| s.map(String::into_bytes)),
    }
}

fn parse_temporal_text(text: &str) -> (Vec<i64>, u32, bool) {
    // ISO-like: optional sign, fields split on -, space, :, micros after '.'
    let negative = text.starts_with('-');
    let body = text.strip_prefix('-').unwrap_or(text);
    let (body, fraction) = match body.split_once('.') {
        Some((b, f)) => (b, f),
        None => (body, ""),
    };
    let fields: Vec<i64> = body
        .split(['-', ' ', ':', 'T'])
        .filter_map(|f| f.parse::<i64>().ok())
        .collect();
    let mut micros = 0u32;
    if !fraction.is_empty() {
        let padded = format!("{fraction:0<6}");
        micros = padded[..6].parse().unwrap_or(0);
    }
    (fields, micros, negative)
}

fn coerce_date(value: &Value, column: &ColumnInformation) -> Result<Option<chrono::NaiveDate>> {
    let make = |y: i32, m: u32, d: u32| {
        chrono::NaiveDate::from_ymd_opt(y, m, d)
            .ok_or_else(|| SqlError::data("invalid date value", "22007"))
    };
    match value {
        Value::Null => Ok(None),
        Value::Date { year, month, day, .. } => {
            if *year == 0 && *month == 0 && *day == 0 {
                return Ok(None);
            }
            make(*year as i32, *month as u32, *day as u32).map(Some)
        }
        Value::Bytes(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            let (fields, _, _) = parse_temporal_text(&text);
            if fields.len() < 3 {
                return Err(SqlError::data(
                    format!("cannot convert '{text}' to date"),
                    "22007",
                ));
            }
            if fields[0] == 0 && fields[1] == 0 && fields[2] == 0 {
                return Ok(None);
            }
            make(fields[0] as i32, fields[1] as u32, fields[2] as u32).map(Some)
        }
        other => Err(SqlError::data(
            format!("cannot convert {other:?} to date ({})", column.name),
            "22007",
        )),
    }
}

fn coerce_time(value: &Value, column: &ColumnInformation) -> Result<Option<TimeParam>> {
    match value {
        Value::Null => Ok(None),
        Value::Time {
            negative,
            days,
            hours,
            minutes,
            seconds,
            micros,
        } => Ok(Some(TimeParam {
            negative: *negative,
            hours: days * 24 + *hours as u32,
            minutes: *minutes,
            seconds: *seconds,
            micros: *micros,
        })),
        Value::Bytes(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            let (fields, micros, negative) = parse_temporal_text(&text);
            if fields.len() < 3 {
                return Err(SqlError::data(
                    format!("cannot convert '{text}' to time"),
                    "22007",
                ));
            }
            Ok(Some(TimeParam {
                negative,
                hours: fields[0] as u32,
                minutes: fields[1] as u8,
                seconds: fields[2] as u8,
                micros,
            }))
        }
        other => Err(SqlError::data(
            format!("cannot convert {other:?} to time ({})", column.name),
            "22007",
        )),
    }
}

fn coerce_timestamp(
    value: &Value,
    column: &ColumnInformation,
) -> Result<Option<chrono::NaiveDateTime>> {
    match value {
        Value::Null => Ok(None),
        Value::Date {
            year,
            month,
            day,
            hour,
            minute,
            second,
            micros,
        } => {
            if *year == 0 && *month == 0 && *day == 0 {
                return Ok(None);
            }
            let date = chrono::NaiveDate::from_ymd_opt(*year as i32, *month as u32, *day as u32)
                .ok_or_else(|| SqlError::data("invalid datetime value", "22007"))?;
            let time = chrono::NaiveTime::from_hms_micro_opt(
                *hour as u32,
                *minute as u32,
                *second as u32,
                *micros,
            )
            .ok_or_else(|| SqlError::data("invalid datetime value", "22007"))?;
            Ok(Some(date.and_time(time)))
        }
        Value::Bytes(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            let (fields, micros, _) = parse_temporal_text(&text);
            if fields.len() < 6 {
                // plain DATE text promotes to midnight
                if fields.len() == 3 {
                    return coerce_date(value, column)
                        .map(|d| d.map(|d| d.and_hms_opt(0, 0, 0).unwrap()));
                }
                return Err(SqlError::data(
                    format!("cannot convert '{text}' to timestamp"),
                    "22007",
                ));
            }
            if fields[..3] == [0, 0, 0] {
                return Ok(None);
            }
            let date =
                chrono::NaiveDate::from_ymd_opt(fields[0] as i32, fields[1] as u32, fields[2] as u32)
                    .ok_or_else(|| SqlError::data("invalid datetime value", "22007"))?;
            let time = chrono::NaiveTime::from_hms_micro_opt(
                fields[3] as u32,
                fields[4] as u32,
                fields[5] as u32,
                micros,
            )
            .ok_or_else(|| SqlError::data("invalid datetime value", "22007"))?;
            Ok(Some(date.and_time(time)))
        }
        other => Err(SqlError::data(
            format!("cannot convert {other:?} to timestamp ({})", column.name),
            "22007",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mysql_common::constants::ColumnFlags;

    fn int_col(name: &str) -> ColumnInformation {
        ColumnInformation::synthetic(name, ColumnType::MYSQL_TYPE_LONG)
    }

    fn text_col(name: &str) -> ColumnInformation {
        ColumnInformation::synthetic(name, ColumnType::MYSQL_TYPE_VAR_STRING)
    }

    fn rows_of_ints(values: &[i64]) -> Vec<Vec<Value>> {
        values.iter().map(|v| vec![Value::Int(*v)]).collect()
    }

    fn scroll_rs(n: i64) -> ResultSet {
        ResultSet::virtual_rows(vec![int_col("id")], rows_of_ints(&(1..=n).collect::<Vec<_>>()))
    }

    #[test]
    pub fn test_forward_iteration() {
        let rs = scroll_rs(2);
        assert!(rs.next().unwrap());
        assert_eq!(rs.get_int(1).unwrap(), 1);
        assert!(rs.next().unwrap());
        assert_eq!(rs.get_int(1).unwrap(), 2);
        assert!(!rs.next().unwrap());
        assert!(rs.is_after_last().unwrap());
    }

    #[test]
    pub fn test_scrolling_contract() {
        let rs = scroll_rs(5);
        assert!(rs.first().unwrap());
        assert_eq!(rs.get_row().unwrap(), 1);
        assert!(rs.last().unwrap());
        assert_eq!(rs.get_row().unwrap(), 5);
        assert!(rs.absolute(3).unwrap());
        assert_eq!(rs.get_row().unwrap(), 3);
        assert!(rs.absolute(-1).unwrap());
        assert_eq!(rs.get_row().unwrap(), 5);
        assert!(!rs.absolute(9).unwrap());
        assert!(rs.is_after_last().unwrap());
        rs.before_first().unwrap();
        assert!(rs.is_before_first().unwrap());
        assert!(rs.relative(2).unwrap());
        assert_eq!(rs.get_row().unwrap(), 2);
        assert!(rs.relative(-1).unwrap());
        assert_eq!(rs.get_row().unwrap(), 1);
        assert!(!rs.relative(-5).unwrap());
        assert!(rs.is_before_first().unwrap());
    }

    #[test]
    pub fn test_forward_only_rejects_backward_motion() {
        let rs = ResultSet::buffered(
            Arc::new(vec![int_col("id")]),
            rows_of_ints(&[1, 2]),
            ScrollType::ForwardOnly,
            false,
        );
        assert!(rs.next().unwrap());
        assert!(rs.previous().is_err());
        assert!(rs.first().is_err());
        assert!(rs.absolute(1).is_err());
        assert!(rs.relative(-1).is_err());
        // forward relative still walks
        assert!(rs.relative(1).unwrap());
    }

    #[test]
    pub fn test_getter_cursor_validation() {
        let rs = scroll_rs(1);
        let err = rs.get_int(1).unwrap_err();
        assert_eq!(err.sql_state(), "22023");
        rs.next().unwrap();
        assert!(rs.get_int(2).is_err());
        rs.next().unwrap();
        assert!(rs.get_int(1).is_err());
    }

    #[test]
    pub fn test_was_null_tracks_last_fetch() {
        let rs = ResultSet::virtual_rows(
            vec![int_col("a"), int_col("b")],
            vec![vec![Value::Null, Value::Int(3)]],
        );
        rs.next().unwrap();
        assert_eq!(rs.get_int(1).unwrap(), 0);
        assert!(rs.was_null());
        assert_eq!(rs.get_int(2).unwrap(), 3);
        assert!(!rs.was_null());
    }

    #[test]
    pub fn test_numeric_range_checks() {
        let rs = ResultSet::virtual_rows(
            vec![int_col("a")],
            vec![vec![Value::Int(300)], vec![Value::UInt(u64::MAX)]],
        );
        rs.next().unwrap();
        let err = rs.get_byte(1).unwrap_err();
        assert_eq!(err.sql_state(), "22003");
        assert_eq!(err.error_code(), 1264);
        assert_eq!(rs.get_int(1).unwrap(), 300);
        rs.next().unwrap();
        assert!(rs.get_long(1).is_err());
        assert_eq!(rs.get_ulong(1).unwrap(), u64::MAX);
    }

    #[test]
    pub fn test_string_and_boolean_coercions() {
        let rs = ResultSet::virtual_rows(
            vec![text_col("v")],
            vec![
                vec![Value::Bytes(b"true".to_vec())],
                vec![Value::Bytes(b"N".to_vec())],
                vec![Value::Bytes(b"17".to_vec())],
                vec![Value::Bytes(b"pear".to_vec())],
            ],
        );
        rs.next().unwrap();
        assert!(rs.get_boolean(1).unwrap());
        rs.next().unwrap();
        assert!(!rs.get_boolean(1).unwrap());
        rs.next().unwrap();
        assert!(rs.get_boolean(1).unwrap());
        assert_eq!(rs.get_int(1).unwrap(), 17);
        rs.next().unwrap();
        let err = rs.get_boolean(1).unwrap_err();
        assert_eq!(err.sql_state(), "22018");
    }

    #[test]
    pub fn test_bit_renders_as_unsigned_decimal() {
        let mut bit = ColumnInformation::synthetic("b", ColumnType::MYSQL_TYPE_BIT);
        bit.flags |= ColumnFlags::UNSIGNED_FLAG;
        let rs = ResultSet::virtual_rows(
            vec![bit],
            vec![vec![Value::Bytes(vec![0x01, 0x00])]],
        );
        rs.next().unwrap();
        assert_eq!(rs.get_string(1).unwrap().as_deref(), Some("256"));
        assert_eq!(rs.get_long(1).unwrap(), 256);
        assert!(rs.get_boolean(1).unwrap());
    }

    #[test]
    pub fn test_temporal_parsing_from_text() {
        let rs = ResultSet::virtual_rows(
            vec![text_col("t")],
            vec![vec![Value::Bytes(b"2023-04-05 06:07:08.000500".to_vec())]],
        );
        rs.next().unwrap();
        let ts = rs.get_timestamp(1).unwrap().unwrap();
        assert_eq!(ts.to_string(), "2023-04-05 06:07:08.000500");
        let d = rs.get_date(1).unwrap().unwrap();
        assert_eq!(d.to_string(), "2023-04-05");

        let rs = ResultSet::virtual_rows(
            vec![text_col("t")],
            vec![vec![Value::Bytes(b"-101:02:03.000004".to_vec())]],
        );
        rs.next().unwrap();
        let t = rs.get_time(1).unwrap().unwrap();
        assert!(t.negative);
        assert_eq!(t.hours, 101);
        assert_eq!(t.micros, 4);
    }

    #[test]
    pub fn test_find_column_by_label() {
        let rs = ResultSet::virtual_rows(
            vec![int_col("id"), text_col("name")],
            vec![vec![Value::Int(1), Value::Bytes(b"x".to_vec())]],
        );
        assert_eq!(rs.find_column("NAME").unwrap(), 2);
        rs.next().unwrap();
        assert_eq!(rs.get_string_by_label("name").unwrap().as_deref(), Some("x"));
        let err = rs.find_column("missing").unwrap_err();
        assert_eq!(err.sql_state(), "42S22");
    }

    #[test]
    pub fn test_closed_result_set_rejects_getters() {
        let rs = scroll_rs(1);
        rs.next().unwrap();
        rs.close();
        assert!(rs.is_closed());
        let err = rs.get_int(1).unwrap_err();
        assert!(err.sql_state().starts_with("08"));
    }
}
