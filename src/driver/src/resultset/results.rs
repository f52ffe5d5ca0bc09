use std::collections::VecDeque;

use crate::resultset::cmd_info::CmdInformation;
use crate::resultset::{Concurrency, ResultSet, ScrollType};

/// One entry of the multi-result pipeline: a row set or an update count.
#[derive(Clone)]
pub enum ResultHolder {
    Rows(ResultSet),
    UpdateCount(i64),
}

/// Per-execution accumulator: the SQL text and parameter snapshot for
/// diagnostics, the result queue, update counts and session attributes
/// stamped while reading responses.
pub struct Results {
    sql: Option<String>,
    parameters_display: Option<String>,
    fetch_size: u32,
    auto_generated_keys: bool,
    scroll_type: ScrollType,
    concurrency: Concurrency,
    binary_protocol: bool,
    cmd_info: CmdInformation,
    queue: VecDeque<ResultHolder>,
    current: Option<ResultHolder>,
    /// OUT-parameter pseudo-row of a CALL, never exposed as a user result
    callable_result: Option<ResultSet>,
    warnings: u16,
    auto_increment: i32,
    max_statement_time: u32,
}

impl Results {
    pub fn new(expected_size: usize) -> Results {
        Results {
            sql: None,
            parameters_display: None,
            fetch_size: 0,
            auto_generated_keys: false,
            scroll_type: ScrollType::ForwardOnly,
            concurrency: Concurrency::ReadOnly,
            binary_protocol: false,
            cmd_info: CmdInformation::new(expected_size),
            queue: VecDeque::new(),
            current: None,
            callable_result: None,
            warnings: 0,
            auto_increment: 1,
            max_statement_time: 0,
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Results {
        self.sql = Some(sql.into());
        self
    }

    pub fn with_parameters_display(mut self, display: String) -> Results {
        self.parameters_display = Some(display);
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: u32) -> Results {
        self.fetch_size = fetch_size;
        self
    }

    pub fn with_auto_generated_keys(mut self, requested: bool) -> Results {
        self.auto_generated_keys = requested;
        self
    }

    pub fn with_scroll_type(mut self, scroll_type: ScrollType) -> Results {
        self.scroll_type = scroll_type;
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Results {
        self.concurrency = concurrency;
        self
    }

    pub fn with_binary_protocol(mut self, binary: bool) -> Results {
        self.binary_protocol = binary;
        self
    }

    pub fn with_max_statement_time(mut self, seconds: u32) -> Results {
        self.max_statement_time = seconds;
        self
    }

    pub fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    pub fn parameters_display(&self) -> Option<&str> {
        self.parameters_display.as_deref()
    }

    pub fn fetch_size(&self) -> u32 {
        self.fetch_size
    }

    /// Streaming is disabled for updatable result sets.
    pub fn remove_fetch_size(&mut self) {
        self.fetch_size = 0;
    }

    pub fn auto_generated_keys(&self) -> bool {
        self.auto_generated_keys
    }

    pub fn scroll_type(&self) -> ScrollType {
        self.scroll_type
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    pub fn is_binary_protocol(&self) -> bool {
        self.binary_protocol
    }

    pub fn max_statement_time(&self) -> u32 {
        self.max_statement_time
    }

    pub fn cmd_info(&self) -> &CmdInformation {
        &self.cmd_info
    }

    pub fn cmd_info_mut(&mut self) -> &mut CmdInformation {
        &mut self.cmd_info
    }

    pub fn set_rewritten(&mut self, rewritten: bool) {
        self.cmd_info.set_rewritten(rewritten);
    }

    pub fn set_warnings(&mut self, warnings: u16) {
        self.warnings = warnings;
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn set_auto_increment(&mut self, increment: i32) {
        self.auto_increment = increment;
    }

    pub fn auto_increment(&self) -> i32 {
        self.auto_increment
    }

    pub fn add_result_set(&mut self, result_set: ResultSet) {
        if result_set.is_callable() {
            self.callable_result = Some(result_set);
            return;
        }
        self.cmd_info.add_result_set_stat();
        self.queue.push_back(ResultHolder::Rows(result_set));
    }

    pub fn add_stats(&mut self, update_count: i64, insert_id: i64) {
        self.cmd_info.add_success(update_count, insert_id);
        self.queue.push_back(ResultHolder::UpdateCount(update_count));
    }

    pub fn add_stats_error(&mut self) {
        self.cmd_info.add_error_stat();
    }

    pub fn callable_result(&self) -> Option<&ResultSet> {
        self.callable_result.as_ref()
    }

    /// Position on the first produced result.
    pub fn command_end(&mut self) {
        if self.current.is_none() {
            self.current = self.queue.pop_front();
        }
    }

    pub fn result_set(&self) -> Option<ResultSet> {
        match &self.current {
            Some(ResultHolder::Rows(rs)) => Some(rs.clone()),
            _ => None,
        }
    }

    /// `-1` iff the current holder is a result set or nothing is left.
    pub fn update_count(&self) -> i64 {
        match &self.current {
            Some(ResultHolder::UpdateCount(count)) => *count,
            _ => -1,
        }
    }

    /// Discard the current result set and advance the pipeline. Returns
    /// true when the new current result is a row set.
    pub fn more_results(&mut self) -> bool {
        if let Some(ResultHolder::Rows(rs)) = self.current.take() {
            rs.close();
        }
        self.current = self.queue.pop_front();
        matches!(self.current, Some(ResultHolder::Rows(_)))
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Append a follow-up result claimed from a drained stream.
    pub fn push_holder(&mut self, holder: ResultHolder) {
        self.queue.push_back(holder);
    }

    /// Hand every produced result over, current first (streamed follow-up
    /// buffering).
    pub fn take_all_holders(&mut self) -> Vec<ResultHolder> {
        let mut holders = Vec::with_capacity(self.queue.len() + 1);
        if let Some(current) = self.current.take() {
            holders.push(current);
        }
        holders.extend(self.queue.drain(..));
        holders
    }

    /// Close every produced result set (owning statement closed or
    /// re-executed).
    pub fn close_all(&mut self) {
        if let Some(ResultHolder::Rows(rs)) = &self.current {
            rs.close();
        }
        for holder in &self.queue {
            if let ResultHolder::Rows(rs) = holder {
                rs.close();
            }
        }
        self.queue.clear();
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resultset::column::ColumnInformation;
    use crate::resultset::row::Value;
    use mysql_common::constants::ColumnType;

    fn rs() -> ResultSet {
        ResultSet::virtual_rows(
            vec![ColumnInformation::synthetic("a", ColumnType::MYSQL_TYPE_LONG)],
            vec![vec![Value::Int(1)]],
        )
    }

    #[test]
    pub fn test_multi_result_pipeline() {
        let mut results = Results::new(1).with_sql("SELECT 1; UPDATE t; SELECT 2");
        results.add_result_set(rs());
        results.add_stats(3, 0);
        results.add_result_set(rs());
        results.command_end();

        assert!(results.result_set().is_some());
        assert_eq!(results.update_count(), -1);

        assert!(!results.more_results());
        assert_eq!(results.update_count(), 3);

        assert!(results.more_results());
        assert_eq!(results.update_count(), -1);

        assert!(!results.more_results());
        assert!(results.result_set().is_none());
    }

    #[test]
    pub fn test_previous_result_set_closed_on_advance() {
        let mut results = Results::new(1);
        results.add_result_set(rs());
        results.add_stats(1, 0);
        results.command_end();
        let first = results.result_set().unwrap();
        assert!(!first.is_closed());
        results.more_results();
        assert!(first.is_closed());
    }

    #[test]
    pub fn test_callable_result_not_exposed() {
        let callable = ResultSet::buffered(
            std::sync::Arc::new(vec![ColumnInformation::synthetic(
                "out",
                ColumnType::MYSQL_TYPE_LONG,
            )]),
            vec![vec![Value::Int(9)]],
            crate::resultset::ScrollType::ForwardOnly,
            true,
        );
        let mut results = Results::new(1);
        results.add_result_set(callable);
        results.command_end();
        assert!(results.result_set().is_none());
        assert!(results.callable_result().is_some());
    }
}
