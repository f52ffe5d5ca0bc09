use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mysql_common::constants::{CapabilityFlags, ColumnType, StatusFlags};
use regex::RegexBuilder;
use tracing::{debug, warn};

use crate::error::{ErrorKind, Result, SqlError};
use crate::params::ParameterHolder;
use crate::prepare::ServerPrepareResult;
use crate::protocol::constants::{
    MariaDbCapabilities, MAX_PAYLOAD_LEN, SESSION_TRACK_SCHEMA, SESSION_TRACK_SYSTEM_VARIABLES,
};
use crate::protocol::packet::{readers, writers, PacketBuf};
use crate::protocol::{ActiveStream, FollowUpResult, Protocol};
use crate::resultset::column::ColumnInformation;
use crate::resultset::results::Results;
use crate::resultset::row::{decode_binary_row, decode_text_row};
use crate::resultset::{ResultSet, SharedTail, StreamTail};
use crate::sql::client_parser::{rewrite_query, ClientPrepareResult};

/// Row packets end with an EOF-headed packet; a real row can only start
/// with 0xfe when its payload is a 8-byte length-encoded run, which forces
/// the frame to the 16MB maximum.
fn is_row_terminator(payload: &[u8]) -> bool {
    payload.first() == Some(&0xfe) && payload.len() < MAX_PAYLOAD_LEN
}

/// `LOAD DATA [LOW_PRIORITY|CONCURRENT] LOCAL INFILE '<name>'` (or a bound
/// placeholder) anchored against the statement that triggered the upload.
pub(crate) fn validate_infile_filename(sql: &str, parameters: Option<&str>, filename: &str) -> bool {
    let pattern = format!(
        r"^[^;]*LOAD\s+DATA\s+((LOW_PRIORITY|CONCURRENT)\s+)?LOCAL\s+INFILE\s+('{}'|\?)",
        regex::escape(filename)
    );
    let re = match RegexBuilder::new(&pattern).case_insensitive(true).build() {
        Ok(re) => re,
        Err(_) => return false,
    };
    if re.is_match(sql.trim_start()) {
        // a bound placeholder must carry the same file name
        if sql.to_uppercase().contains("INFILE ?") {
            if let Some(parameters) = parameters {
                return parameters.contains(filename);
            }
        }
        return true;
    }
    false
}

/// Parameter types of a bulk execute: per column the first non-NULL type
/// across all rows. `None` when a column mixes incompatible types.
pub(crate) fn bulk_parameter_types(
    parameters_list: &[Vec<ParameterHolder>],
) -> Option<Vec<(u8, bool)>> {
    let first = parameters_list.first()?;
    let param_count = first.len();
    let mut types: Vec<(ColumnType, bool)> = Vec::with_capacity(param_count);
    for i in 0..param_count {
        let mut column_type = first[i].column_type();
        let mut unsigned = first[i].is_unsigned();
        if column_type == ColumnType::MYSQL_TYPE_NULL {
            for row in parameters_list.iter().skip(1) {
                if row[i].column_type() != ColumnType::MYSQL_TYPE_NULL {
                    column_type = row[i].column_type();
                    unsigned = row[i].is_unsigned();
                    break;
                }
            }
        }
        types.push((column_type, unsigned));
    }
    for row in parameters_list {
        if row.len() != param_count {
            return None;
        }
        for (i, param) in row.iter().enumerate() {
            let row_type = param.column_type();
            if row_type != types[i].0
                && row_type != ColumnType::MYSQL_TYPE_NULL
                && types[i].0 != ColumnType::MYSQL_TYPE_NULL
            {
                return None;
            }
        }
    }
    Some(types.into_iter().map(|(t, u)| (t as u8, u)).collect())
}

impl Protocol {
    // ---- command prologue ----------------------------------------------

    /// Runs before every public execute: drain the streaming result, flush
    /// deferred statement releases, verify liveness, clear the interrupt.
    pub fn cmd_prologue(&mut self) -> Result<()> {
        self.drain_active_stream()?;
        self.pending_followups.clear();
        self.force_release_waiting_prepare_statements();
        self.check_connected()?;
        self.interrupted.store(false, Ordering::Release);
        Ok(())
    }

    /// COM_STMT_CLOSE for every handle parked by an owner that could not
    /// reach the socket. Best effort, never surfaced.
    pub fn force_release_waiting_prepare_statements(&mut self) {
        let ids: Vec<u32> = std::mem::take(&mut *self.statement_id_to_release.lock().unwrap());
        for statement_id in ids {
            if let Ok(io) = self.io_mut() {
                if let Err(err) = writers::write_stmt_close(io, statement_id) {
                    debug!("deferred statement release failed: {err}");
                }
            }
        }
    }

    /// Drop one reference to a server-side handle, closing it on the
    /// server once unshared and uncached.
    pub fn release_prepare_statement(&mut self, prepare: &Arc<ServerPrepareResult>) -> Result<()> {
        if !prepare.is_in_cache() {
            prepare.set_removed_from_cache();
        }
        if prepare.decrement_share_counter() && self.connected {
            let io = self.io_mut()?;
            writers::write_stmt_close(io, prepare.statement_id())?;
        }
        Ok(())
    }

    // ---- text / client-prepared execution ------------------------------

    fn timeout_wrapped(&self, results: &Results, sql: &str) -> String {
        if results.max_statement_time() > 0 && self.server_mariadb {
            format!(
                "SET STATEMENT max_statement_time={} FOR {}",
                results.max_statement_time(),
                sql
            )
        } else {
            sql.to_string()
        }
    }

    fn send_query(&mut self, sql: &[u8]) -> Result<()> {
        if sql.len() + 1 > self.max_allowed_packet {
            return Err(SqlError::max_allowed_packet(
                format!(
                    "query size ({}) exceeds max_allowed_packet ({})",
                    sql.len() + 1,
                    self.max_allowed_packet
                ),
                false,
            ));
        }
        let io = self.io_mut()?;
        writers::write_query(io, sql)?;
        Ok(())
    }

    pub fn execute_query(&mut self, results: &mut Results, sql: &str) -> Result<()> {
        self.cmd_prologue()?;
        let sql = self.timeout_wrapped(results, sql);
        self.send_query(sql.as_bytes())?;
        self.get_result(results, None)
    }

    pub fn execute_client_prepared(
        &mut self,
        results: &mut Results,
        prepare: &ClientPrepareResult,
        parameters: &mut [ParameterHolder],
    ) -> Result<()> {
        self.cmd_prologue()?;
        let mut sql = Vec::new();
        if results.max_statement_time() > 0 && self.server_mariadb {
            sql.extend_from_slice(
                format!(
                    "SET STATEMENT max_statement_time={} FOR ",
                    results.max_statement_time()
                )
                .as_bytes(),
            );
        }
        let assembled = prepare.assemble(parameters, self.no_backslash_escapes())?;
        sql.extend_from_slice(&assembled);
        self.send_query(&sql)?;
        self.get_result(results, None)
    }

    /// Internal fire-and-read helper for session plumbing.
    pub(crate) fn internal_query(&mut self, sql: &str) -> Result<()> {
        self.internal_query_results(sql).map(|_| ())
    }

    pub(crate) fn internal_query_results(&mut self, sql: &str) -> Result<Results> {
        let mut results = Results::new(0);
        self.send_query(sql.as_bytes())?;
        self.read_response(&mut results, None, true)?;
        Ok(results)
    }

    // ---- server-side prepare / execute ---------------------------------

    /// COM_STMT_PREPARE with cache sharing: a cached handle gets its share
    /// counter bumped instead of a server round-trip.
    pub fn prepare(&mut self, sql: &str) -> Result<Arc<ServerPrepareResult>> {
        if self.opts.cache_prep_stmts {
            let database = self.database.clone();
            if let Some(cached) = self.ps_cache.get(&database, sql) {
                return Ok(cached);
            }
        }
        self.prepare_internal(sql)
    }

    fn prepare_internal(&mut self, sql: &str) -> Result<Arc<ServerPrepareResult>> {
        if sql.len() + 1 > self.max_allowed_packet {
            return Err(SqlError::max_allowed_packet(
                "prepare statement size exceeds max_allowed_packet".to_string(),
                false,
            ));
        }
        {
            let io = self.io_mut()?;
            writers::write_stmt_prepare(io, sql.as_bytes())?;
        }
        let payload = self.read_packet()?;
        if payload.first() == Some(&0xff) {
            return Err(readers::parse_err_packet(&payload));
        }
        let ok = readers::parse_stmt_prepare_ok(&payload)?;

        let mut param_meta = Vec::with_capacity(ok.num_params as usize);
        if ok.num_params > 0 {
            for _ in 0..ok.num_params {
                let payload = self.read_packet()?;
                param_meta.push(ColumnInformation::parse(&payload)?);
            }
            self.skip_eof_packet()?;
        }
        let mut columns = Vec::with_capacity(ok.num_columns as usize);
        if ok.num_columns > 0 {
            for _ in 0..ok.num_columns {
                let payload = self.read_packet()?;
                columns.push(ColumnInformation::parse(&payload)?);
            }
            self.skip_eof_packet()?;
        }

        let prepared = Arc::new(ServerPrepareResult::new(
            ok.statement_id,
            sql.to_string(),
            self.database.clone(),
            param_meta,
            columns,
        ));
        if self.opts.cache_prep_stmts && sql.len() < self.opts.prep_stmt_cache_sql_limit {
            let database = self.database.clone();
            let resolved = self.ps_cache.put(&database, sql, prepared.clone());
            if !Arc::ptr_eq(&resolved, &prepared) {
                // another preparation of the same SQL won; ours goes away
                self.release_prepare_statement(&prepared)?;
                return Ok(resolved);
            }
            return Ok(resolved);
        }
        Ok(prepared)
    }

    pub(crate) fn skip_eof_packet(&mut self) -> Result<()> {
        if !self.eof_deprecated {
            let payload = self.read_packet()?;
            let (warnings, status) = readers::parse_eof_packet(&payload)?;
            self.has_warnings = warnings > 0;
            self.server_status = status;
        }
        Ok(())
    }

    pub fn execute_server_prepared(
        &mut self,
        results: &mut Results,
        prepare: &Arc<ServerPrepareResult>,
        parameters: &mut [ParameterHolder],
    ) -> Result<()> {
        self.cmd_prologue()?;
        if parameters.len() != prepare.parameter_count() {
            return Err(SqlError::invalid_argument(format!(
                "Parameter count mismatch: statement takes {}, {} given",
                prepare.parameter_count(),
                parameters.len()
            )));
        }

        // streams first, chunked below the frame limit
        if parameters.iter().any(ParameterHolder::is_long_data) {
            let mut buffer = vec![0u8; MAX_PAYLOAD_LEN - 4];
            for (index, parameter) in parameters.iter_mut().enumerate() {
                if let ParameterHolder::LongData(long_data) = parameter {
                    loop {
                        let read =
                            long_data.stream.read(&mut buffer).map_err(SqlError::from)?;
                        if read == 0 {
                            break;
                        }
                        let io = self.io_mut()?;
                        writers::write_stmt_send_long_data(
                            io,
                            prepare.statement_id(),
                            index as u16,
                            &buffer[..read],
                        )?;
                    }
                }
            }
        }

        {
            let io = self.io_mut()?;
            writers::write_stmt_execute(io, prepare.statement_id(), parameters)?;
        }
        self.get_result(results, Some(prepare))
    }

    // ---- batch strategies ----------------------------------------------

    /// Strategy ladder for client-side prepared batches: multi-values
    /// rewrite, bulk, semicolon aggregation, pipeline, one-by-one.
    pub fn execute_batch_client(
        &mut self,
        results: &mut Results,
        prepare: &ClientPrepareResult,
        parameters_list: &mut Vec<Vec<ParameterHolder>>,
        has_long_data: bool,
    ) -> Result<()> {
        if parameters_list.is_empty() {
            return Ok(());
        }
        if self.opts.rewrite_batched_statements {
            if prepare.is_query_multi_values_rewritable() && !results.auto_generated_keys() {
                return self.execute_batch_rewrite(results, prepare, parameters_list, true);
            }
            if prepare.is_query_multiple_rewritable() {
                if self.opts.use_bulk_stmts
                    && !has_long_data
                    && !results.auto_generated_keys()
                    && self.execute_bulk_batch(results, prepare.sql(), None, parameters_list)?
                {
                    return Ok(());
                }
                return self.execute_batch_rewrite(results, prepare, parameters_list, false);
            }
        }

        if self.opts.use_bulk_stmts
            && !has_long_data
            && !results.auto_generated_keys()
            && self.execute_bulk_batch(results, prepare.sql(), None, parameters_list)?
        {
            return Ok(());
        }

        if self.opts.use_batch_multi_send || self.opts.continue_batch_on_error {
            return self.execute_batch_multi(results, prepare, parameters_list);
        }
        self.execute_batch_slow(results, prepare, parameters_list)
    }

    /// Server-prepared batch: bulk when possible, otherwise pipelined
    /// executes. Returns false when the caller must fall back to a
    /// one-by-one loop.
    pub fn execute_batch_server(
        &mut self,
        results: &mut Results,
        prepare: Option<Arc<ServerPrepareResult>>,
        sql: &str,
        parameters_list: &mut Vec<Vec<ParameterHolder>>,
        has_long_data: bool,
    ) -> Result<bool> {
        self.cmd_prologue()?;
        if self.opts.use_bulk_stmts
            && !has_long_data
            && !results.auto_generated_keys()
            && self.execute_bulk_batch(results, sql, prepare.clone(), parameters_list)?
        {
            return Ok(true);
        }
        if !self.opts.use_batch_multi_send {
            return Ok(false);
        }

        let (prepared, fresh) = match prepare {
            Some(prepared) => (prepared, false),
            None => (self.prepare(sql)?, true),
        };
        let mut first_error: Option<SqlError> = None;
        for parameters in parameters_list.iter_mut() {
            if let Err(err) = self.execute_server_prepared(results, &prepared, parameters) {
                if err.is_connection_error() {
                    return Err(err);
                }
                results.add_stats_error();
                if first_error.is_none() {
                    first_error = Some(err);
                }
                if !self.opts.continue_batch_on_error {
                    break;
                }
            }
        }
        if fresh {
            self.release_prepare_statement(&prepared)?;
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }

    /// MariaDB bulk protocol: one COM_STMT_BULK_EXECUTE carrying the whole
    /// parameter array. Falls back (Ok(false)) when preconditions fail or
    /// the server rejects the statement class (error 1295).
    fn execute_bulk_batch(
        &mut self,
        results: &mut Results,
        sql: &str,
        prepare: Option<Arc<ServerPrepareResult>>,
        parameters_list: &mut [Vec<ParameterHolder>],
    ) -> Result<bool> {
        if self.client_capabilities
            & MariaDbCapabilities::MARIADB_CLIENT_STMT_BULK_OPERATIONS.bits()
            == 0
        {
            return Ok(false);
        }
        let Some(types) = bulk_parameter_types(parameters_list) else {
            return Ok(false);
        };
        // INSERT … SELECT result shapes cannot ride the bulk protocol
        if sql.to_lowercase().contains("select") {
            return Ok(false);
        }

        self.cmd_prologue()?;
        let (prepared, fresh) = match &prepare {
            Some(prepared) => (prepared.clone(), false),
            None => (self.prepare_internal(sql)?, true),
        };

        {
            let io = self.io_mut()?;
            writers::write_stmt_bulk_execute(
                io,
                prepared.statement_id(),
                &types,
                parameters_list,
            )?;
        }
        let outcome = self.get_result(results, Some(&prepared));
        if fresh {
            self.release_prepare_statement(&prepared)?;
        }
        match outcome {
            Ok(()) => {
                results.set_rewritten(true);
                Ok(true)
            }
            Err(err) if err.sql_state() == "HY000" && err.error_code() == 1295 => {
                // statement class not bulk-capable; clear the special error
                // so it is not misread as an update count
                results.cmd_info_mut().reset();
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Multi-values / semicolon-aggregated rewrite, packed below
    /// max_allowed_packet per physical statement.
    fn execute_batch_rewrite(
        &mut self,
        results: &mut Results,
        prepare: &ClientPrepareResult,
        parameters_list: &mut Vec<Vec<ParameterHolder>>,
        rewrite_values: bool,
    ) -> Result<()> {
        self.cmd_prologue()?;
        let total = parameters_list.len();
        let mut current_index = 0;
        let no_backslash = self.no_backslash_escapes();
        let max_allowed_packet = self.max_allowed_packet;

        let outcome: Result<()> = (|| {
            let mut sql = Vec::with_capacity(1024);
            while current_index < total {
                sql.clear();
                current_index = rewrite_query(
                    &mut sql,
                    prepare,
                    current_index,
                    parameters_list,
                    rewrite_values,
                    max_allowed_packet,
                    no_backslash,
                )?;
                self.send_query(&sql)?;
                self.read_response(results, None, !rewrite_values)?;
                self.stop_if_interrupted()?;
            }
            Ok(())
        })();
        // the flag is stamped even on early failure for diagnostics
        results.set_rewritten(rewrite_values);
        outcome
    }

    /// Statement batch entry point (plain SQL strings).
    pub fn execute_batch_stmt(&mut self, results: &mut Results, queries: &[String]) -> Result<()> {
        self.cmd_prologue()?;
        if self.opts.rewrite_batched_statements {
            let mut can_aggregate = true;
            let mut total_len = 0usize;
            for query in queries {
                if !ClientPrepareResult::can_aggregate_semicolon(
                    query,
                    self.no_backslash_escapes(),
                ) {
                    can_aggregate = false;
                    break;
                }
                total_len += query.len() + 1;
            }
            self.stop_if_interrupted()?;
            if can_aggregate {
                return self.execute_batch_aggregate_semicolon(results, queries, total_len);
            }
        }
        self.execute_batch_queries(results, queries)
    }

    fn execute_batch_aggregate_semicolon(
        &mut self,
        results: &mut Results,
        queries: &[String],
        _total_len_estimation: usize,
    ) -> Result<()> {
        let mut first_error: Option<SqlError> = None;
        let mut current_index = 0;
        let mut sql = Vec::with_capacity(1024);
        while current_index < queries.len() {
            sql.clear();
            sql.extend_from_slice(queries[current_index].as_bytes());
            current_index += 1;
            while current_index < queries.len()
                && sql.len() + 1 + queries[current_index].len() < self.max_allowed_packet
            {
                sql.push(b';');
                sql.extend_from_slice(queries[current_index].as_bytes());
                current_index += 1;
            }
            let attempt: Result<()> = self
                .send_query(&sql)
                .and_then(|_| self.read_response(results, None, true));
            if let Err(err) = attempt {
                if err.is_connection_error() {
                    return Err(err);
                }
                if !self.opts.continue_batch_on_error {
                    return Err(err);
                }
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            self.stop_if_interrupted()?;
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Pipeline: send everything inside an autocommit bracket, then read
    /// every response.
    fn execute_batch_multi(
        &mut self,
        results: &mut Results,
        prepare: &ClientPrepareResult,
        parameters_list: &mut Vec<Vec<ParameterHolder>>,
    ) -> Result<()> {
        self.cmd_prologue()?;
        let autocommit = self.autocommit();
        let no_backslash = self.no_backslash_escapes();

        if autocommit {
            self.send_query(b"SET AUTOCOMMIT=0")?;
        }
        let sent = parameters_list.len();
        for parameters in parameters_list.iter_mut() {
            let sql = prepare.assemble(parameters, no_backslash)?;
            self.send_query(&sql)?;
        }
        if autocommit {
            self.send_query(b"COMMIT")?;
            self.send_query(b"SET AUTOCOMMIT=1")?;
        }

        let mut first_error: Option<SqlError> = None;
        if autocommit {
            // response of SET AUTOCOMMIT=0
            let mut scratch = Results::new(0);
            self.read_response(&mut scratch, None, true)?;
        }
        for _ in 0..sent {
            if let Err(err) = self.read_response(results, None, true) {
                if err.is_connection_error() {
                    return Err(err);
                }
                results.add_stats_error();
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        if autocommit {
            let mut scratch = Results::new(0);
            self.read_response(&mut scratch, None, true)?;
            self.read_response(&mut scratch, None, true)?;
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// One statement at a time inside a transaction bracket.
    fn execute_batch_slow(
        &mut self,
        results: &mut Results,
        prepare: &ClientPrepareResult,
        parameters_list: &mut Vec<Vec<ParameterHolder>>,
    ) -> Result<()> {
        self.cmd_prologue()?;
        let autocommit = self.autocommit();
        if autocommit {
            self.internal_query("SET AUTOCOMMIT=0")?;
        }
        let mut first_error: Option<SqlError> = None;
        for parameters in parameters_list.iter_mut() {
            let attempt = self
                .stop_if_interrupted()
                .and_then(|_| self.execute_client_prepared(results, prepare, parameters));
            if let Err(err) = attempt {
                if err.is_connection_error() {
                    return Err(err);
                }
                if self.opts.continue_batch_on_error {
                    results.add_stats_error();
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                } else {
                    if autocommit {
                        self.commit_return_autocommit()?;
                    }
                    return Err(err);
                }
            }
        }
        if autocommit {
            self.commit_return_autocommit()?;
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn execute_batch_queries(&mut self, results: &mut Results, queries: &[String]) -> Result<()> {
        let autocommit = self.autocommit();
        if !self.opts.continue_batch_on_error {
            if autocommit {
                self.internal_query("SET AUTOCOMMIT=0")?;
            }
            for sql in queries {
                let attempt = self
                    .stop_if_interrupted()
                    .and_then(|_| self.send_query(sql.as_bytes()))
                    .and_then(|_| self.read_response(results, None, true));
                if let Err(err) = attempt {
                    if autocommit && !err.is_connection_error() {
                        self.commit_return_autocommit()?;
                    }
                    return Err(err);
                }
            }
            if autocommit {
                self.commit_return_autocommit()?;
            }
            return Ok(());
        }

        // pipelined with per-row error capture
        if autocommit {
            self.send_query(b"SET AUTOCOMMIT=0")?;
        }
        for sql in queries {
            self.send_query(sql.as_bytes())?;
        }
        if autocommit {
            self.send_query(b"COMMIT")?;
            self.send_query(b"SET AUTOCOMMIT=1")?;
        }
        let mut first_error: Option<SqlError> = None;
        if autocommit {
            let mut scratch = Results::new(0);
            self.read_response(&mut scratch, None, true)?;
        }
        for _ in queries {
            if let Err(err) = self.read_response(results, None, true) {
                if err.is_connection_error() {
                    return Err(err);
                }
                results.add_stats_error();
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        if autocommit {
            let mut scratch = Results::new(0);
            self.read_response(&mut scratch, None, true)?;
            self.read_response(&mut scratch, None, true)?;
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn commit_return_autocommit(&mut self) -> Result<()> {
        self.internal_query("COMMIT")?;
        self.internal_query("SET AUTOCOMMIT=1")
    }

    // ---- response reading ----------------------------------------------

    pub(crate) fn read_packet(&mut self) -> Result<Vec<u8>> {
        let io = self.io_mut()?;
        match io.read_packet() {
            Ok(payload) => Ok(payload),
            Err(err) => {
                // the exchange is broken beyond recovery
                self.destroy_socket();
                Err(SqlError::from(err))
            }
        }
    }

    pub(crate) fn get_result(
        &mut self,
        results: &mut Results,
        prepare: Option<&Arc<ServerPrepareResult>>,
    ) -> Result<()> {
        let read_all = results.fetch_size() == 0;
        self.read_response(results, prepare, read_all)
    }

    pub(crate) fn read_response(
        &mut self,
        results: &mut Results,
        prepare: Option<&Arc<ServerPrepareResult>>,
        read_all: bool,
    ) -> Result<()> {
        self.read_packet_response(results, prepare)?;
        while read_all && self.active_stream.is_none() && self.has_more_results() {
            self.read_packet_response(results, prepare)?;
        }
        Ok(())
    }

    fn read_packet_response(
        &mut self,
        results: &mut Results,
        prepare: Option<&Arc<ServerPrepareResult>>,
    ) -> Result<()> {
        let payload = self.read_packet()?;
        match payload.first().copied() {
            Some(0x00) => self.read_ok_packet(&payload, results),
            Some(0xff) => {
                let err = readers::parse_err_packet(&payload);
                // ER_MUST_CHANGE_PASSWORD: the sandboxed session survives,
                // only the statement is refused
                if err.error_code() == 1820 || err.error_code() == 1862 {
                    self.expired_password = true;
                }
                results.add_stats_error();
                self.has_warnings = false;
                self.server_status
                    .remove(StatusFlags::SERVER_MORE_RESULTS_EXISTS);
                self.active_stream = None;
                Err(err)
            }
            Some(0xfb) => self.read_local_infile(&payload, results, prepare),
            Some(_) => self.read_result_set(&payload, results, prepare),
            None => Err(SqlError::connection("empty server response packet")),
        }
    }

    fn client_capability_flags(&self) -> CapabilityFlags {
        CapabilityFlags::from_bits_truncate(self.client_capabilities as u32)
    }

    fn read_ok_packet(&mut self, payload: &[u8], results: &mut Results) -> Result<()> {
        let ok = readers::parse_ok_packet(payload, self.client_capability_flags())?;
        self.server_status = ok.status_flags;
        self.has_warnings = ok.warnings > 0;
        results.set_warnings(ok.warnings);
        if ok
            .status_flags
            .contains(StatusFlags::SERVER_SESSION_STATE_CHANGED)
        {
            self.handle_state_change(&ok, results);
        }
        results.add_stats(ok.affected_rows as i64, ok.last_insert_id as i64);
        Ok(())
    }

    fn handle_state_change(&mut self, ok: &readers::OkPacket, results: &mut Results) {
        for change in &ok.state_changes {
            let mut buf = PacketBuf::new(&change.data);
            match change.change_type {
                SESSION_TRACK_SCHEMA => {
                    if let Ok(Some(schema)) = buf.read_lenenc_bytes() {
                        self.database = String::from_utf8_lossy(schema).into_owned();
                        debug!("database change: now is '{}'", self.database);
                    }
                }
                SESSION_TRACK_SYSTEM_VARIABLES => {
                    let name = buf.read_lenenc_bytes().ok().flatten();
                    let value = buf.read_lenenc_bytes().ok().flatten();
                    if let (Some(name), Some(value)) = (name, value) {
                        if name == b"auto_increment_increment" {
                            if let Ok(value) =
                                String::from_utf8_lossy(value).parse::<i32>()
                            {
                                self.auto_increment_increment = value;
                                results.set_auto_increment(value);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn read_result_set(
        &mut self,
        first_payload: &[u8],
        results: &mut Results,
        prepare: Option<&Arc<ServerPrepareResult>>,
    ) -> Result<()> {
        let mut buf = PacketBuf::new(first_payload);
        let column_count = buf
            .read_lenenc_int()?
            .ok_or_else(|| SqlError::connection("invalid result set header"))? as usize;

        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let payload = self.read_packet()?;
            columns.push(ColumnInformation::parse(&payload)?);
        }
        self.skip_eof_packet()?;
        let mut callable = self
            .server_status
            .contains(StatusFlags::SERVER_PS_OUT_PARAMS);

        if let Some(prepare) = prepare {
            prepare.set_columns(columns.clone());
        }
        let columns = Arc::new(columns);
        let binary = prepare.is_some();

        if results.fetch_size() == 0 {
            let mut rows = Vec::new();
            loop {
                let payload = self.read_packet()?;
                if payload.first() == Some(&0xff) {
                    let err = readers::parse_err_packet(&payload);
                    results.add_stats_error();
                    return Err(err);
                }
                if is_row_terminator(&payload) {
                    self.read_row_terminator(&payload)?;
                    break;
                }
                rows.push(self.decode_row(&payload, &columns, binary)?);
            }
            callable |= self
                .server_status
                .contains(StatusFlags::SERVER_PS_OUT_PARAMS);
            let rs = ResultSet::buffered(columns, rows, results.scroll_type(), callable);
            results.add_result_set(rs);
        } else {
            let shared = SharedTail::new();
            self.active_stream = Some(ActiveStream {
                columns: columns.clone(),
                binary,
                shared: shared.clone(),
            });
            let tail = StreamTail {
                shared,
                protocol: self.self_ref.clone(),
                fetch_size: results.fetch_size(),
            };
            let rs =
                ResultSet::streaming(columns, Vec::new(), tail, results.scroll_type(), callable);
            results.add_result_set(rs);
        }
        Ok(())
    }

    fn decode_row(
        &self,
        payload: &[u8],
        columns: &[ColumnInformation],
        binary: bool,
    ) -> Result<Vec<crate::resultset::row::Value>> {
        if binary {
            decode_binary_row(payload, columns).map_err(SqlError::from)
        } else {
            decode_text_row(payload, columns.len()).map_err(SqlError::from)
        }
    }

    fn read_row_terminator(&mut self, payload: &[u8]) -> Result<()> {
        if self.eof_deprecated {
            let ok = readers::parse_eof_deprecated_ok(payload, self.client_capability_flags())?;
            self.server_status = ok.status_flags;
            self.has_warnings = ok.warnings > 0;
            if ok
                .status_flags
                .contains(StatusFlags::SERVER_SESSION_STATE_CHANGED)
            {
                let mut scratch = Results::new(0);
                self.handle_state_change(&ok, &mut scratch);
            }
        } else {
            let (warnings, status) = readers::parse_eof_packet(payload)?;
            self.server_status = status;
            self.has_warnings = warnings > 0;
        }
        Ok(())
    }

    fn read_local_infile(
        &mut self,
        payload: &[u8],
        results: &mut Results,
        prepare: Option<&Arc<ServerPrepareResult>>,
    ) -> Result<()> {
        let filename = String::from_utf8_lossy(&payload[1..]).into_owned();

        let source: Option<Box<dyn Read + Send>> = if let Some(stream) =
            self.local_infile_input.take()
        {
            Some(stream)
        } else if !self.opts.allow_local_infile {
            None
        } else {
            let sql_matches = results.sql().is_some_and(|sql| {
                validate_infile_filename(sql, results.parameters_display(), &filename)
            });
            if !sql_matches {
                None
            } else {
                match std::fs::File::open(&filename) {
                    Ok(file) => Some(Box::new(file)),
                    Err(err) => {
                        // refuse the transfer, then surface the local error
                        self.reply_empty_infile_packet(results, prepare)?;
                        return Err(SqlError::data(
                            format!("Could not send file '{filename}': {err}"),
                            "22000",
                        ));
                    }
                }
            }
        };

        let Some(mut source) = source else {
            self.reply_empty_infile_packet(results, prepare)?;
            if !self.opts.allow_local_infile {
                return Err(SqlError::new(
                    ErrorKind::InvalidArgument,
                    "Usage of LOCAL INFILE is disabled. To use it enable it via the connection \
                     property allowLocalInfile=true",
                    "42000",
                    0,
                ));
            }
            return Err(SqlError::new(
                ErrorKind::InvalidArgument,
                format!(
                    "LOAD DATA LOCAL INFILE asked for file '{filename}' that doesn't correspond \
                     to initial query {}. Possible malicious proxy changing server answer. \
                     Command interrupted",
                    results.sql().unwrap_or("")
                ),
                "42000",
                0,
            ));
        };

        let mut buffer = [0u8; 8192];
        loop {
            let read = source.read(&mut buffer).map_err(SqlError::from)?;
            if read == 0 {
                break;
            }
            let io = self.io_mut()?;
            writers::write_local_infile_chunk(io, &buffer[..read])?;
        }
        {
            let io = self.io_mut()?;
            writers::write_empty_packet(io)?;
        }
        self.read_packet_response(results, prepare)
    }

    /// Refuse a LOCAL INFILE transfer and consume the server's verdict.
    fn reply_empty_infile_packet(
        &mut self,
        results: &mut Results,
        prepare: Option<&Arc<ServerPrepareResult>>,
    ) -> Result<()> {
        {
            let io = self.io_mut()?;
            writers::write_empty_packet(io)?;
        }
        // the server answers with its own error; keep ours instead
        let _ = self.read_packet_response(results, prepare);
        Ok(())
    }

    // ---- streaming -----------------------------------------------------

    /// Read up to `fetch_size` rows of the active stream into its shared
    /// tail (everything when 0), consuming follow-up results once the row
    /// stream ends.
    pub fn read_stream_rows(&mut self, shared: &Arc<SharedTail>, fetch_size: u32) -> Result<()> {
        let Some(active) = &self.active_stream else {
            shared.eof.store(true, Ordering::Release);
            return Ok(());
        };
        if !Arc::ptr_eq(&active.shared, shared) {
            shared.eof.store(true, Ordering::Release);
            return Ok(());
        }
        let columns = active.columns.clone();
        let binary = active.binary;

        let limit = if fetch_size == 0 {
            usize::MAX
        } else {
            fetch_size as usize
        };
        let mut fetched = 0usize;
        loop {
            let payload = match self.read_packet() {
                Ok(payload) => payload,
                Err(err) => {
                    shared.eof.store(true, Ordering::Release);
                    self.active_stream = None;
                    return Err(err);
                }
            };
            if payload.first() == Some(&0xff) {
                shared.eof.store(true, Ordering::Release);
                self.active_stream = None;
                return Err(readers::parse_err_packet(&payload));
            }
            if is_row_terminator(&payload) {
                self.read_row_terminator(&payload)?;
                shared.eof.store(true, Ordering::Release);
                self.active_stream = None;
                if self.has_more_results() {
                    self.read_followup_results()?;
                }
                return Ok(());
            }
            let row = self.decode_row(&payload, &columns, binary)?;
            shared.rows.lock().unwrap().push_back(row);
            fetched += 1;
            if fetched >= limit {
                return Ok(());
            }
        }
    }

    /// Drain the active streaming result to completion (command prologue,
    /// close, getMoreResults).
    pub fn drain_active_stream(&mut self) -> Result<()> {
        if let Some(active) = &self.active_stream {
            let shared = active.shared.clone();
            self.read_stream_rows(&shared, 0)?;
        }
        Ok(())
    }

    /// Responses that followed a streamed result set, buffered until the
    /// owning statement claims them.
    fn read_followup_results(&mut self) -> Result<()> {
        let mut followups = Results::new(0);
        while self.has_more_results() {
            self.read_packet_response(&mut followups, None)?;
        }
        self.pending_followups.extend(followups.take_all_holders());
        Ok(())
    }

    pub fn take_pending_followups(&mut self) -> Vec<FollowUpResult> {
        std::mem::take(&mut self.pending_followups)
    }

    // ---- session operations --------------------------------------------

    pub fn ping(&mut self) -> Result<bool> {
        self.cmd_prologue()?;
        {
            let io = self.io_mut()?;
            writers::write_ping(io)?;
        }
        let payload = self.read_packet()?;
        Ok(payload.first() == Some(&0x00))
    }

    pub fn is_valid(&mut self, timeout: Duration) -> Result<bool> {
        if !self.connected {
            return Ok(false);
        }
        let previous = self.socket_timeout;
        if let Some(io) = self.io.as_ref() {
            let _ = io.set_read_timeout(Some(timeout));
        }
        let alive = self.ping().unwrap_or(false);
        if let Some(io) = self.io.as_ref() {
            let _ = io.set_read_timeout(previous);
        }
        Ok(alive)
    }

    /// COM_RESET_CONNECTION; falls back to a manual session scrub. The
    /// server forgets prepared statements either way.
    pub fn reset(&mut self) -> Result<()> {
        self.cmd_prologue()?;
        let reset_outcome: Result<()> = (|| {
            {
                let io = self.io_mut()?;
                writers::write_reset_connection(io)?;
            }
            let payload = self.read_packet()?;
            if payload.first() == Some(&0xff) {
                return Err(readers::parse_err_packet(&payload));
            }
            let ok = readers::parse_ok_packet(&payload, self.client_capability_flags())?;
            self.server_status = ok.status_flags;
            Ok(())
        })();
        match reset_outcome {
            Ok(()) => {}
            Err(err) if err.is_connection_error() => return Err(err),
            Err(err) => {
                warn!("COM_RESET_CONNECTION refused ({err}); falling back to manual reset");
                self.internal_query("ROLLBACK")?;
                self.internal_query("SET autocommit=1")?;
            }
        }
        self.ps_cache.clear();
        self.force_release_waiting_prepare_statements();
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.cmd_prologue()?;
        if self.in_transaction() {
            self.internal_query("ROLLBACK")?;
        }
        Ok(())
    }

    pub fn set_catalog(&mut self, database: &str) -> Result<()> {
        self.cmd_prologue()?;
        {
            let io = self.io_mut()?;
            writers::write_init_db(io, database)?;
        }
        let payload = self.read_packet()?;
        if payload.first() == Some(&0xff) {
            return Err(readers::parse_err_packet(&payload));
        }
        self.database = database.to_string();
        Ok(())
    }

    pub fn set_max_rows(&mut self, max: i64) -> Result<()> {
        if self.max_rows == max {
            return Ok(());
        }
        if max == 0 {
            self.internal_query("set @@SQL_SELECT_LIMIT=DEFAULT")?;
        } else {
            self.internal_query(&format!("set @@SQL_SELECT_LIMIT={max}"))?;
        }
        self.max_rows = max;
        Ok(())
    }

    pub fn set_transaction_isolation(
        &mut self,
        level: crate::protocol::constants::IsolationLevel,
    ) -> Result<()> {
        if self.transaction_isolation == Some(level) {
            return Ok(());
        }
        self.internal_query(&format!(
            "SET SESSION TRANSACTION ISOLATION LEVEL {}",
            level.as_sql()
        ))?;
        self.transaction_isolation = Some(level);
        Ok(())
    }

    pub fn transaction_isolation(&self) -> Option<crate::protocol::constants::IsolationLevel> {
        self.transaction_isolation
    }

    pub fn set_socket_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.socket_timeout = timeout;
        if let Some(io) = self.io.as_ref() {
            io.set_read_timeout(timeout).map_err(SqlError::from)?;
        }
        Ok(())
    }

    /// Side-channel cancellation: a second connection to the same host
    /// killing the in-flight query. Never takes this connection's lock.
    pub fn cancel_current_query(&self) -> Result<()> {
        let mut side = Protocol::new(self.url.clone(), self.host.clone());
        side.connect()?;
        side.internal_query(&format!("KILL QUERY {}", self.server_thread_id))?;
        side.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_row_terminator_detection() {
        assert!(is_row_terminator(&[0xfe, 0, 0, 2, 0]));
        assert!(!is_row_terminator(&[0x01, b'5']));
        let mut giant_row = vec![0xfe];
        giant_row.resize(MAX_PAYLOAD_LEN, 0);
        assert!(!is_row_terminator(&giant_row));
    }

    #[test]
    pub fn test_infile_filename_validation() {
        let sql = "LOAD DATA LOCAL INFILE '/tmp/data.csv' INTO TABLE t";
        assert!(validate_infile_filename(sql, None, "/tmp/data.csv"));
        assert!(validate_infile_filename(
            "load data low_priority local infile '/tmp/data.csv' INTO TABLE t",
            None,
            "/tmp/data.csv"
        ));
        assert!(!validate_infile_filename(sql, None, "/etc/passwd"));
        assert!(!validate_infile_filename(
            "SELECT 1 /* LOAD DATA LOCAL INFILE '/etc/passwd' */",
            None,
            "/etc/passwd"
        ));
        assert!(validate_infile_filename(
            "LOAD DATA LOCAL INFILE ? INTO TABLE t",
            Some("'/tmp/data.csv'"),
            "/tmp/data.csv"
        ));
    }

    #[test]
    pub fn test_bulk_parameter_types() {
        let mut list = vec![
            vec![
                ParameterHolder::Null(ColumnType::MYSQL_TYPE_NULL),
                ParameterHolder::Text("a".to_string()),
            ],
            vec![
                ParameterHolder::Int(5),
                ParameterHolder::Text("b".to_string()),
            ],
        ];
        let types = bulk_parameter_types(&list).unwrap();
        assert_eq!(types[0].0, ColumnType::MYSQL_TYPE_LONG as u8);
        assert_eq!(types[1].0, ColumnType::MYSQL_TYPE_VAR_STRING as u8);

        list.push(vec![
            ParameterHolder::Text("oops".to_string()),
            ParameterHolder::Text("c".to_string()),
        ]);
        assert!(bulk_parameter_types(&list).is_none());
    }
}
