use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::SqlError;
use crate::options::Options;

/// Bound a query for log output.
pub fn truncate_query(sql: &str, max_query_size_to_log: usize) -> String {
    if max_query_size_to_log == 0 || sql.len() <= max_query_size_to_log {
        return sql.to_string();
    }
    let mut cut = max_query_size_to_log.saturating_sub(3);
    while cut > 0 && !sql.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &sql[..cut])
}

/// Attach the failing query to an error when the options ask for it.
pub fn exception_with_query(mut err: SqlError, sql: Option<&str>, opts: &Options) -> SqlError {
    if opts.dump_queries_on_exception {
        if let Some(sql) = sql {
            err.append_message(&format!(
                "\nQuery is: {}",
                truncate_query(sql, opts.max_query_size_to_log)
            ));
        }
    }
    err
}

/// Measures every dispatched protocol operation; the optional layer around
/// the protocol driven by `profileSql` / `slowQueryThresholdNanos`.
#[derive(Debug, Clone)]
pub struct ProtocolLogger {
    profile_sql: bool,
    slow_query_threshold_nanos: Option<u64>,
    max_query_size_to_log: usize,
}

impl ProtocolLogger {
    pub fn new(opts: &Options) -> ProtocolLogger {
        ProtocolLogger {
            profile_sql: opts.profile_sql,
            slow_query_threshold_nanos: opts.slow_query_threshold_nanos,
            max_query_size_to_log: opts.max_query_size_to_log,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.profile_sql || self.slow_query_threshold_nanos.is_some()
    }

    pub fn observe(
        &self,
        operation: &str,
        sql: Option<&str>,
        elapsed: Duration,
        error: Option<&SqlError>,
    ) {
        if !self.is_enabled() {
            return;
        }
        let shown_sql = sql.map(|s| truncate_query(s, self.max_query_size_to_log));
        let sql_part = shown_sql.as_deref().unwrap_or("");

        if let Some(err) = error {
            error!(
                "{operation} failed after {:.3}ms: {} {sql_part}",
                elapsed.as_secs_f64() * 1000.0,
                err
            );
            return;
        }
        let slow = self
            .slow_query_threshold_nanos
            .is_some_and(|threshold| elapsed.as_nanos() as u64 > threshold);
        if slow {
            warn!(
                "slow {operation}: {:.3}ms {sql_part}",
                elapsed.as_secs_f64() * 1000.0
            );
        } else if self.profile_sql {
            info!(
                "{operation}: {:.3}ms {sql_part}",
                elapsed.as_secs_f64() * 1000.0
            );
        } else {
            debug!(
                "{operation}: {:.3}ms {sql_part}",
                elapsed.as_secs_f64() * 1000.0
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_truncate_query() {
        assert_eq!(truncate_query("SELECT 1", 100), "SELECT 1");
        assert_eq!(truncate_query("SELECT '0123456789'", 10), "SELECT ...");
        // never split a multi-byte character
        let truncated = truncate_query("SELECT 'ééééééé'", 12);
        assert!(truncated.ends_with("..."));
        assert!(truncated.is_char_boundary(truncated.len() - 3));
    }

    #[test]
    pub fn test_exception_with_query_dump() {
        let mut opts = Options::default();
        opts.dump_queries_on_exception = true;
        opts.max_query_size_to_log = 16;
        let err = exception_with_query(
            SqlError::syntax("bad"),
            Some("SELECT * FROM a_rather_long_table"),
            &opts,
        );
        assert!(err.message().contains("\nQuery is: SELECT * FROM..."));

        let mut quiet = Options::default();
        quiet.dump_queries_on_exception = false;
        let err = exception_with_query(SqlError::syntax("bad"), Some("SELECT 1"), &quiet);
        assert!(!err.message().contains("Query is"));
    }
}
