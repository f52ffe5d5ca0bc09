use std::io::Read;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime};
use mysql_common::constants::ColumnType;
use tracing::warn;

use crate::connection::Connection;
use crate::error::{Result, SqlError};
use crate::failover::FailoverProxy;
use crate::logging::exception_with_query;
use crate::params::{LongDataParam, ParameterHolder, TimeParam};
use crate::prepare::ServerPrepareResult;
use crate::resultset::results::Results;
use crate::resultset::{ResultSet, ScrollType};
use crate::sql::{self, ClientPrepareResult};

/// Soft query timer for the server-prepared path, where no
/// `max_statement_time` prefix can be attached: after the timeout the
/// in-flight command is interrupted and killed through the side channel.
struct SoftTimer {
    done: Arc<AtomicBool>,
}

impl SoftTimer {
    fn start(proxy: Arc<FailoverProxy>, seconds: u32) -> SoftTimer {
        let done = Arc::new(AtomicBool::new(false));
        let watcher = done.clone();
        std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(seconds as u64);
            while Instant::now() < deadline {
                if watcher.load(Ordering::Acquire) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            if !watcher.load(Ordering::Acquire) {
                proxy.interrupt();
                let _ = proxy.cancel_current_query();
            }
        });
        SoftTimer { done }
    }
}

impl Drop for SoftTimer {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Release);
    }
}

/// JDBC-shaped statement: owns the execution accumulator of its last run
/// and closes handed-out result sets on re-execution or close.
pub struct Statement {
    conn: Connection,
    results: Option<Results>,
    open_result: Option<ResultSet>,
    batch: Vec<String>,
    fetch_size: u32,
    query_timeout: u32,
    max_rows: i64,
    escape_processing: bool,
    scroll_type: ScrollType,
    return_generated_keys: bool,
    closed: bool,
}

impl Statement {
    pub(crate) fn new(conn: Connection) -> Statement {
        Statement {
            conn,
            results: None,
            open_result: None,
            batch: Vec::new(),
            fetch_size: 0,
            query_timeout: 0,
            max_rows: 0,
            escape_processing: true,
            scroll_type: ScrollType::ForwardOnly,
            return_generated_keys: false,
            closed: false,
        }
    }

    pub(crate) fn with_scroll_type(mut self, scroll_type: ScrollType) -> Statement {
        self.scroll_type = scroll_type;
        self
    }

    fn check_open(&self, operation: &str) -> Result<()> {
        if self.closed {
            return Err(SqlError::closed_explicitly(operation));
        }
        self.conn.check_open(operation)
    }

    fn close_current_results(&mut self) {
        if let Some(results) = &mut self.results {
            results.close_all();
        }
        self.results = None;
        self.open_result = None;
    }

    fn preprocess(&self, sql: &str) -> Result<String> {
        if self.escape_processing && sql.contains('{') {
            let ctx = self.conn.escape_context()?;
            return sql::native_sql(sql, &ctx);
        }
        Ok(sql.to_string())
    }

    fn run_query(&mut self, sql: &str) -> Result<()> {
        self.check_open("execute")?;
        self.close_current_results();
        let processed = self.preprocess(sql)?;

        let fetch_size = self.fetch_size;
        let timeout = self.query_timeout;
        let max_rows = self.max_rows;
        let scroll_type = self.scroll_type;
        let generated_keys = self.return_generated_keys;

        let outcome = self
            .conn
            .proxy()
            .dispatch("executeQuery", Some(&processed), |protocol| {
                let mut results = Results::new(1)
                    .with_sql(processed.clone())
                    .with_fetch_size(fetch_size)
                    .with_max_statement_time(timeout)
                    .with_auto_generated_keys(generated_keys)
                    .with_scroll_type(scroll_type);
                protocol.cmd_prologue()?;
                protocol.set_max_rows(max_rows)?;
                protocol.execute_query(&mut results, &processed)?;
                Ok(results)
            });
        let mut results = outcome
            .map_err(|err| exception_with_query(err, Some(&processed), self.conn.opts()))?;
        results.command_end();
        self.open_result = results.result_set();
        self.results = Some(results);
        Ok(())
    }

    pub fn execute_query(&mut self, sql: &str) -> Result<ResultSet> {
        self.run_query(sql)?;
        self.open_result.clone().ok_or_else(|| {
            SqlError::invalid_argument("statement did not produce a result set")
        })
    }

    pub fn execute_update(&mut self, sql: &str) -> Result<i64> {
        self.run_query(sql)?;
        if self.open_result.is_some() {
            return Err(SqlError::invalid_argument(
                "statement produced a result set; use executeQuery",
            ));
        }
        Ok(self.get_update_count().max(0))
    }

    /// Returns true when the first result is a result set.
    pub fn execute(&mut self, sql: &str) -> Result<bool> {
        self.run_query(sql)?;
        Ok(self.open_result.is_some())
    }

    /// `executeUpdate(sql, RETURN_GENERATED_KEYS)`.
    pub fn execute_update_with_keys(&mut self, sql: &str) -> Result<i64> {
        self.return_generated_keys = true;
        let outcome = self.execute_update(sql);
        self.return_generated_keys = false;
        outcome
    }

    /// Virtual result set over the insert ids of the last execution.
    pub fn get_generated_keys(&self) -> Result<ResultSet> {
        use crate::resultset::column::ColumnInformation;
        use crate::resultset::row::Value;

        let rows = match &self.results {
            Some(results) => results
                .cmd_info()
                .generated_ids(results.auto_increment() as i64)
                .into_iter()
                .map(|id| vec![Value::Int(id)])
                .collect(),
            None => Vec::new(),
        };
        Ok(ResultSet::virtual_rows(
            vec![ColumnInformation::synthetic(
                "insert_id",
                ColumnType::MYSQL_TYPE_LONGLONG,
            )],
            rows,
        ))
    }

    pub fn get_result_set(&self) -> Option<ResultSet> {
        self.open_result.clone()
    }

    /// `-1` iff the current result is a result set or nothing is left.
    pub fn get_update_count(&self) -> i64 {
        self.results.as_ref().map_or(-1, Results::update_count)
    }

    /// Advance the multi-result pipeline, claiming responses a drained
    /// stream buffered on the connection.
    pub fn get_more_results(&mut self) -> Result<bool> {
        self.check_open("getMoreResults")?;
        let followups = self.conn.proxy().dispatch("getMoreResults", None, |protocol| {
            protocol.drain_active_stream()?;
            Ok(protocol.take_pending_followups())
        })?;
        let Some(results) = &mut self.results else {
            return Ok(false);
        };
        for holder in followups {
            results.push_holder(holder);
        }
        let more = results.more_results();
        self.open_result = results.result_set();
        Ok(more)
    }

    // ---- batch ---------------------------------------------------------

    pub fn add_batch(&mut self, sql: &str) -> Result<()> {
        self.check_open("addBatch")?;
        self.batch.push(sql.to_string());
        Ok(())
    }

    pub fn clear_batch(&mut self) {
        self.batch.clear();
    }

    pub fn execute_batch(&mut self) -> Result<Vec<i64>> {
        self.check_open("executeBatch")?;
        self.close_current_results();
        let queries = std::mem::take(&mut self.batch);
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let expected = queries.len();
        let outcome = self
            .conn
            .proxy()
            .dispatch("executeBatch", queries.first().map(String::as_str), |protocol| {
                let mut results = Results::new(expected);
                match protocol.execute_batch_stmt(&mut results, &queries) {
                    Ok(()) => Ok((results, None)),
                    Err(err) if err.is_connection_error() => Err(err),
                    Err(err) => Ok((results, Some(err))),
                }
            })?;
        let (mut results, batch_error) = outcome;
        results.command_end();
        let counts = results.cmd_info().batch_update_counts();
        self.results = Some(results);
        match batch_error {
            Some(err) => Err(SqlError::batch(err, counts)),
            None => Ok(counts),
        }
    }

    // ---- attributes ----------------------------------------------------

    pub fn set_fetch_size(&mut self, fetch_size: u32) {
        self.fetch_size = fetch_size;
    }

    pub fn fetch_size(&self) -> u32 {
        self.fetch_size
    }

    /// Mapped to `SET STATEMENT max_statement_time=N FOR …` on execute.
    pub fn set_query_timeout(&mut self, seconds: u32) {
        self.query_timeout = seconds;
    }

    pub fn query_timeout(&self) -> u32 {
        self.query_timeout
    }

    pub fn set_max_rows(&mut self, max_rows: i64) -> Result<()> {
        if max_rows < 0 {
            return Err(SqlError::invalid_argument("max rows cannot be negative"));
        }
        self.max_rows = max_rows;
        Ok(())
    }

    pub fn max_rows(&self) -> i64 {
        self.max_rows
    }

    pub fn set_escape_processing(&mut self, enabled: bool) {
        self.escape_processing = enabled;
    }

    /// Side-channel `KILL QUERY` against the in-flight command.
    pub fn cancel(&self) -> Result<()> {
        self.check_open("cancel")?;
        self.conn.proxy().cancel_current_query()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.conn.is_closed()
    }

    pub fn close(&mut self) {
        self.close_current_results();
        self.closed = true;
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        self.close_current_results();
    }
}

/// Client- or server-side prepared statement, chosen by
/// `useServerPrepStmts` (batch rewriting forces the client side).
pub struct PreparedStatement {
    base: Statement,
    sql: String,
    prepare: ClientPrepareResult,
    server_prepare: Option<(Arc<ServerPrepareResult>, usize)>,
    server_prepare_failed: bool,
    /// OUT parameters only travel on the binary protocol
    force_server_prepare: bool,
    params: Vec<Option<ParameterHolder>>,
    batch_params: Vec<Vec<ParameterHolder>>,
    batch_has_long_data: bool,
}

impl PreparedStatement {
    pub(crate) fn new(conn: Connection, sql: &str) -> Result<PreparedStatement> {
        let base = Statement::new(conn);
        let ctx = base.conn.escape_context()?;
        let processed = if base.escape_processing && sql.contains('{') {
            sql::native_sql(sql, &ctx)?
        } else {
            sql.to_string()
        };
        let opts = base.conn.opts().clone();
        let no_backslash = ctx.no_backslash_escapes;
        let prepare = if opts.rewrite_batched_statements {
            ClientPrepareResult::rewritable(&processed, no_backslash)
        } else {
            ClientPrepareResult::parameterize(&processed, no_backslash)
        };
        let param_count = prepare.param_count();
        Ok(PreparedStatement {
            base,
            sql: processed,
            prepare,
            server_prepare: None,
            server_prepare_failed: false,
            force_server_prepare: false,
            params: (0..param_count).map(|_| None).collect(),
            batch_params: Vec::new(),
            batch_has_long_data: false,
        })
    }

    pub fn parameter_count(&self) -> usize {
        self.prepare.param_count()
    }

    fn set_param(&mut self, index: usize, value: ParameterHolder) -> Result<()> {
        if index == 0 || index > self.params.len() {
            return Err(SqlError::invalid_argument(format!(
                "Could not set parameter at position {index} (values must range from 1 to {})",
                self.params.len()
            )));
        }
        self.params[index - 1] = Some(value);
        Ok(())
    }

    // ---- typed setters -------------------------------------------------

    pub fn set_null(&mut self, index: usize) -> Result<()> {
        self.set_param(index, ParameterHolder::Null(ColumnType::MYSQL_TYPE_NULL))
    }

    pub fn set_boolean(&mut self, index: usize, value: bool) -> Result<()> {
        self.set_param(index, ParameterHolder::Boolean(value))
    }

    pub fn set_byte(&mut self, index: usize, value: i8) -> Result<()> {
        self.set_param(index, ParameterHolder::Byte(value))
    }

    pub fn set_short(&mut self, index: usize, value: i16) -> Result<()> {
        self.set_param(index, ParameterHolder::Short(value))
    }

    pub fn set_int(&mut self, index: usize, value: i32) -> Result<()> {
        self.set_param(index, ParameterHolder::Int(value))
    }

    pub fn set_long(&mut self, index: usize, value: i64) -> Result<()> {
        self.set_param(index, ParameterHolder::Long(value))
    }

    pub fn set_ulong(&mut self, index: usize, value: u64) -> Result<()> {
        self.set_param(index, ParameterHolder::ULong(value))
    }

    pub fn set_float(&mut self, index: usize, value: f32) -> Result<()> {
        self.set_param(index, ParameterHolder::Float(value))
    }

    pub fn set_double(&mut self, index: usize, value: f64) -> Result<()> {
        self.set_param(index, ParameterHolder::Double(value))
    }

    pub fn set_decimal(&mut self, index: usize, value: &str) -> Result<()> {
        self.set_param(index, ParameterHolder::Decimal(value.to_string()))
    }

    pub fn set_string(&mut self, index: usize, value: &str) -> Result<()> {
        self.set_param(index, ParameterHolder::Text(value.to_string()))
    }

    pub fn set_bytes(&mut self, index: usize, value: &[u8]) -> Result<()> {
        self.set_param(index, ParameterHolder::Bytes(value.to_vec()))
    }

    pub fn set_date(&mut self, index: usize, value: NaiveDate) -> Result<()> {
        self.set_param(index, ParameterHolder::Date(value))
    }

    pub fn set_time(&mut self, index: usize, value: TimeParam) -> Result<()> {
        self.set_param(index, ParameterHolder::Time(value))
    }

    pub fn set_timestamp(&mut self, index: usize, value: NaiveDateTime) -> Result<()> {
        self.set_param(index, ParameterHolder::Timestamp(value))
    }

    /// Stream parameter, uploaded via SEND_LONG_DATA on the server path.
    pub fn set_binary_stream(
        &mut self,
        index: usize,
        stream: Box<dyn Read + Send>,
    ) -> Result<()> {
        self.set_param(index, ParameterHolder::LongData(LongDataParam { stream }))
    }

    pub fn clear_parameters(&mut self) {
        for slot in &mut self.params {
            *slot = None;
        }
    }

    /// Bound values for one execution. Streams move out of their slot;
    /// everything else stays bound for re-execution.
    fn snapshot_params(&mut self) -> Result<Vec<ParameterHolder>> {
        let mut snapshot = Vec::with_capacity(self.params.len());
        for (i, slot) in self.params.iter_mut().enumerate() {
            match slot {
                None => {
                    return Err(SqlError::invalid_argument(format!(
                        "Parameter at position {} is not set",
                        i + 1
                    )))
                }
                Some(param) => match param.try_clone() {
                    Some(clone) => snapshot.push(clone),
                    None => {
                        let taken = slot.take().unwrap();
                        snapshot.push(taken);
                    }
                },
            }
        }
        Ok(snapshot)
    }

    fn params_display(params: &[ParameterHolder]) -> String {
        params
            .iter()
            .map(ParameterHolder::display_snapshot)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn use_server_prepare(&self) -> bool {
        let opts = self.base.conn.opts();
        (opts.use_server_prep_stmts || self.force_server_prepare)
            && !opts.rewrite_batched_statements
            && !self.server_prepare_failed
    }

    /// Prepare (or re-prepare after a protocol switch). A non-connection
    /// failure downgrades this statement to the client-side path.
    fn ensure_prepared(&mut self) -> Result<()> {
        let generation = self.base.conn.proxy().generation();
        if let Some((_, prepared_generation)) = &self.server_prepare {
            if *prepared_generation == generation {
                return Ok(());
            }
            self.server_prepare = None;
        }
        let sql = self.sql.clone();
        let outcome = self
            .base
            .conn
            .proxy()
            .dispatch("prepare", Some(&sql), |protocol| {
                protocol.cmd_prologue()?;
                protocol.prepare(&sql)
            });
        match outcome {
            Ok(prepared) => {
                self.server_prepare = Some((prepared, generation));
                Ok(())
            }
            Err(err) if err.is_connection_error() => Err(err),
            Err(err) => {
                warn!("server-side prepare failed, falling back to client side: {err}");
                self.server_prepare_failed = true;
                Ok(())
            }
        }
    }

    fn run_prepared(&mut self) -> Result<()> {
        self.base.check_open("execute")?;
        self.base.close_current_results();
        let mut params = self.snapshot_params()?;

        if self.use_server_prepare() {
            self.ensure_prepared()?;
        }

        let fetch_size = self.base.fetch_size;
        let timeout = self.base.query_timeout;
        let max_rows = self.base.max_rows;
        let scroll_type = self.base.scroll_type;
        let generated_keys = self.base.return_generated_keys;
        let sql = self.sql.clone();
        let display = Self::params_display(&params);

        let outcome = if let Some((prepared, _)) = self.server_prepare.clone() {
            let _timer = (timeout > 0)
                .then(|| SoftTimer::start(self.base.conn.proxy().clone(), timeout));
            self.base
                .conn
                .proxy()
                .dispatch("executePreparedQuery", Some(&sql), |protocol| {
                    let mut results = Results::new(1)
                        .with_sql(sql.clone())
                        .with_parameters_display(display.clone())
                        .with_fetch_size(fetch_size)
                        .with_max_statement_time(timeout)
                        .with_scroll_type(scroll_type)
                        .with_auto_generated_keys(generated_keys)
                        .with_binary_protocol(true);
                    protocol.cmd_prologue()?;
                    protocol.set_max_rows(max_rows)?;
                    protocol.execute_server_prepared(&mut results, &prepared, &mut params)?;
                    Ok(results)
                })
        } else {
            let prepare = self.prepare.clone();
            self.base
                .conn
                .proxy()
                .dispatch("executeQuery", Some(&sql), |protocol| {
                    let mut results = Results::new(1)
                        .with_sql(sql.clone())
                        .with_parameters_display(display.clone())
                        .with_fetch_size(fetch_size)
                        .with_max_statement_time(timeout)
                        .with_auto_generated_keys(generated_keys)
                        .with_scroll_type(scroll_type);
                    protocol.cmd_prologue()?;
                    protocol.set_max_rows(max_rows)?;
                    protocol.execute_client_prepared(&mut results, &prepare, &mut params)?;
                    Ok(results)
                })
        };

        let mut results = outcome
            .map_err(|err| exception_with_query(err, Some(&self.sql), self.base.conn.opts()))?;
        results.command_end();
        self.base.open_result = results.result_set();
        self.base.results = Some(results);
        Ok(())
    }

    pub fn execute_query(&mut self) -> Result<ResultSet> {
        self.run_prepared()?;
        self.base.open_result.clone().ok_or_else(|| {
            SqlError::invalid_argument("statement did not produce a result set")
        })
    }

    pub fn execute_update(&mut self) -> Result<i64> {
        self.run_prepared()?;
        if self.base.open_result.is_some() {
            return Err(SqlError::invalid_argument(
                "statement produced a result set; use executeQuery",
            ));
        }
        Ok(self.base.get_update_count().max(0))
    }

    pub fn execute(&mut self) -> Result<bool> {
        self.run_prepared()?;
        Ok(self.base.open_result.is_some())
    }

    /// `executeUpdate(RETURN_GENERATED_KEYS)`.
    pub fn execute_update_with_keys(&mut self) -> Result<i64> {
        self.base.return_generated_keys = true;
        let outcome = self.execute_update();
        self.base.return_generated_keys = false;
        outcome
    }

    // ---- batch ---------------------------------------------------------

    pub fn add_batch(&mut self) -> Result<()> {
        self.base.check_open("addBatch")?;
        let params = self.snapshot_params()?;
        self.batch_has_long_data |= params.iter().any(ParameterHolder::is_long_data);
        self.batch_params.push(params);
        Ok(())
    }

    pub fn clear_batch(&mut self) {
        self.batch_params.clear();
        self.batch_has_long_data = false;
    }

    pub fn execute_batch(&mut self) -> Result<Vec<i64>> {
        self.base.check_open("executeBatch")?;
        self.base.close_current_results();
        let mut params_list = std::mem::take(&mut self.batch_params);
        let has_long_data = std::mem::take(&mut self.batch_has_long_data);
        if params_list.is_empty() {
            return Ok(Vec::new());
        }
        let expected = params_list.len();
        let sql = self.sql.clone();
        let generated_keys = self.base.return_generated_keys;
        let use_server = self.use_server_prepare();
        if use_server {
            self.ensure_prepared()?;
        }
        let server_prepare = self.server_prepare.clone().map(|(prepared, _)| prepared);
        let prepare = self.prepare.clone();
        let continue_on_error = self.base.conn.opts().continue_batch_on_error;

        let outcome = self
            .base
            .conn
            .proxy()
            .dispatch("executeBatch", Some(&sql), |protocol| {
                let mut results = Results::new(expected)
                    .with_sql(sql.clone())
                    .with_auto_generated_keys(generated_keys);
                let attempt = if use_server && !protocol.options().rewrite_batched_statements {
                    match protocol.execute_batch_server(
                        &mut results,
                        server_prepare.clone(),
                        &sql,
                        &mut params_list,
                        has_long_data,
                    ) {
                        Ok(true) => Ok(()),
                        Ok(false) => {
                            // strategy exhausted: one execute per parameter set
                            let prepared = match &server_prepare {
                                Some(prepared) => prepared.clone(),
                                None => protocol.prepare(&sql)?,
                            };
                            let mut first_error: Option<SqlError> = None;
                            for parameters in params_list.iter_mut() {
                                let row = protocol.execute_server_prepared(
                                    &mut results,
                                    &prepared,
                                    parameters,
                                );
                                if let Err(err) = row {
                                    if err.is_connection_error() {
                                        return Err(err);
                                    }
                                    results.add_stats_error();
                                    if first_error.is_none() {
                                        first_error = Some(err);
                                    }
                                    if !continue_on_error {
                                        break;
                                    }
                                }
                            }
                            match first_error {
                                Some(err) => Err(err),
                                None => Ok(()),
                            }
                        }
                        Err(err) => Err(err),
                    }
                } else {
                    protocol.execute_batch_client(
                        &mut results,
                        &prepare,
                        &mut params_list,
                        has_long_data,
                    )
                };
                match attempt {
                    Ok(()) => Ok((results, None)),
                    Err(err) if err.is_connection_error() => Err(err),
                    Err(err) => Ok((results, Some(err))),
                }
            })?;

        let (mut results, batch_error) = outcome;
        results.command_end();
        let counts = results.cmd_info().batch_update_counts();
        self.base.results = Some(results);
        match batch_error {
            Some(err) => Err(SqlError::batch(err, counts)),
            None => Ok(counts),
        }
    }

    pub fn metadata(&self) -> Option<Vec<crate::resultset::column::ColumnInformation>> {
        self.server_prepare
            .as_ref()
            .map(|(prepared, _)| prepared.columns().as_ref().clone())
    }

    pub fn close(&mut self) {
        if let Some((prepared, generation)) = self.server_prepare.take() {
            if generation == self.base.conn.proxy().generation() && !self.base.conn.is_closed()
            {
                let _ = self
                    .base
                    .conn
                    .proxy()
                    .dispatch("closePreparedStatement", None, |protocol| {
                        protocol.release_prepare_statement(&prepared)
                    });
            }
        }
        self.base.close();
    }
}

impl Deref for PreparedStatement {
    type Target = Statement;

    fn deref(&self) -> &Statement {
        &self.base
    }
}

impl DerefMut for PreparedStatement {
    fn deref_mut(&mut self) -> &mut Statement {
        &mut self.base
    }
}

impl Drop for PreparedStatement {
    fn drop(&mut self) {
        self.close();
    }
}

/// `{call …}` statement with OUT/INOUT parameter retrieval. OUT values
/// arrive as a PS_OUT_PARAMETERS pseudo-row after the user result sets and
/// are routed here instead of being exposed as a result set.
pub struct CallableStatement {
    ps: PreparedStatement,
    registered_out: Vec<usize>,
    out_row: Option<ResultSet>,
}

impl CallableStatement {
    pub(crate) fn new(conn: Connection, sql: &str) -> Result<CallableStatement> {
        let ctx = conn.escape_context()?;
        let processed = sql::native_sql(sql, &ctx)?;
        let mut ps = PreparedStatement::new(conn, &processed)?;
        ps.force_server_prepare = true;
        Ok(CallableStatement {
            ps,
            registered_out: Vec::new(),
            out_row: None,
        })
    }

    pub fn register_out_parameter(&mut self, index: usize) -> Result<()> {
        if index == 0 || index > self.ps.parameter_count() {
            return Err(SqlError::invalid_argument(format!(
                "Could not register out parameter at position {index}"
            )));
        }
        if !self.registered_out.contains(&index) {
            self.registered_out.push(index);
            self.registered_out.sort_unstable();
        }
        // an OUT-only parameter still needs a placeholder value bound
        if self.ps.params[index - 1].is_none() {
            self.ps.params[index - 1] =
                Some(ParameterHolder::Null(ColumnType::MYSQL_TYPE_NULL));
        }
        Ok(())
    }

    pub fn execute(&mut self) -> Result<bool> {
        self.out_row = None;
        let has_results = self.ps.execute()?;
        self.capture_out_row()?;
        Ok(has_results)
    }

    pub fn execute_query(&mut self) -> Result<ResultSet> {
        self.out_row = None;
        let rs = self.ps.execute_query()?;
        self.capture_out_row()?;
        Ok(rs)
    }

    pub fn execute_update(&mut self) -> Result<i64> {
        self.out_row = None;
        let count = self.ps.execute_update()?;
        self.capture_out_row()?;
        Ok(count)
    }

    fn capture_out_row(&mut self) -> Result<()> {
        if let Some(results) = &self.ps.base.results {
            if let Some(out) = results.callable_result() {
                let out = out.clone();
                out.next()?;
                self.out_row = Some(out);
            }
        }
        Ok(())
    }

    /// Map a parameter index onto its column in the OUT pseudo-row.
    fn out_column(&self, parameter_index: usize) -> Result<(usize, &ResultSet)> {
        let position = self
            .registered_out
            .iter()
            .position(|idx| *idx == parameter_index)
            .ok_or_else(|| {
                SqlError::invalid_argument(format!(
                    "Parameter {parameter_index} is not registered as an output parameter"
                ))
            })?;
        let row = self.out_row.as_ref().ok_or_else(|| {
            SqlError::invalid_argument(
                "No output parameters returned; execute the call first",
            )
        })?;
        Ok((position + 1, row))
    }

    pub fn get_int(&self, parameter_index: usize) -> Result<i32> {
        let (column, row) = self.out_column(parameter_index)?;
        row.get_int(column)
    }

    pub fn get_long(&self, parameter_index: usize) -> Result<i64> {
        let (column, row) = self.out_column(parameter_index)?;
        row.get_long(column)
    }

    pub fn get_string(&self, parameter_index: usize) -> Result<Option<String>> {
        let (column, row) = self.out_column(parameter_index)?;
        row.get_string(column)
    }

    pub fn get_double(&self, parameter_index: usize) -> Result<f64> {
        let (column, row) = self.out_column(parameter_index)?;
        row.get_double(column)
    }

    pub fn get_boolean(&self, parameter_index: usize) -> Result<bool> {
        let (column, row) = self.out_column(parameter_index)?;
        row.get_boolean(column)
    }

    pub fn was_null(&self) -> bool {
        self.out_row.as_ref().is_some_and(ResultSet::was_null)
    }
}

impl Deref for CallableStatement {
    type Target = PreparedStatement;

    fn deref(&self) -> &PreparedStatement {
        &self.ps
    }
}

impl DerefMut for CallableStatement {
    fn deref_mut(&mut self) -> &mut PreparedStatement {
        &mut self.ps
    }
}
