use std::fmt;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SqlError>;

/// Exception classes of the JDBC-shaped surface. Every error carries one of
/// these, plus the SQLState and vendor code of the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("SQL syntax error")]
    Syntax,
    #[error("feature not supported")]
    FeatureNotSupported,
    #[error("feature not implemented")]
    FeatureNotImplemented,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("data exception")]
    Data,
    #[error("integrity constraint violation")]
    Integrity,
    #[error("authorization failure")]
    Authorization,
    #[error("transient connection failure")]
    TransientConnection,
    #[error("connection failure")]
    NonTransientConnection,
    #[error("transient failure")]
    Transient,
    #[error("transaction rollback")]
    RollbackTransaction,
    #[error("timeout")]
    Timeout,
    #[error("SQL parse failure")]
    Parse,
    #[error("packet exceeds max_allowed_packet")]
    MaxAllowedPacket,
    #[error("batch update failure")]
    BatchUpdate,
    #[error("general failure")]
    Other,
}

/// SQL error with SQLState, vendor error code, optional cause and an
/// optional `next` link used to chain batch errors.
#[derive(Debug)]
pub struct SqlError {
    kind: ErrorKind,
    message: String,
    sql_state: String,
    error_code: u16,
    parse_position: Option<usize>,
    must_reconnect: bool,
    update_counts: Option<Vec<i64>>,
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    next: Option<Box<SqlError>>,
}

impl SqlError {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        sql_state: impl Into<String>,
        error_code: u16,
    ) -> Self {
        SqlError {
            kind,
            message: message.into(),
            sql_state: sql_state.into(),
            error_code,
            parse_position: None,
            must_reconnect: false,
            update_counts: None,
            cause: None,
            next: None,
        }
    }

    /// Map a server ERR packet to the matching exception class.
    pub fn from_server(error_code: u16, sql_state: &str, message: impl Into<String>) -> Self {
        let kind = classify_server_error(error_code, sql_state);
        SqlError::new(kind, message, sql_state, error_code)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        SqlError::new(ErrorKind::Syntax, message, "42000", 1064)
    }

    pub fn feature_not_supported(message: impl Into<String>) -> Self {
        SqlError::new(ErrorKind::FeatureNotSupported, message, "0A000", 0)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        SqlError::new(ErrorKind::InvalidArgument, message, "HY000", 0)
    }

    pub fn data(message: impl Into<String>, sql_state: &str) -> Self {
        SqlError::new(ErrorKind::Data, message, sql_state, 0)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        SqlError::new(ErrorKind::Data, message, "22003", 1264)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        SqlError::new(ErrorKind::Timeout, message, "HY000", 0)
    }

    pub fn batch_timeout() -> Self {
        SqlError::new(ErrorKind::Timeout, "Timeout during batch execution", "00000", 0)
    }

    pub fn parse(message: impl Into<String>, position: usize) -> Self {
        let mut err = SqlError::new(ErrorKind::Parse, message, "HY000", 0);
        err.parse_position = Some(position);
        err
    }

    pub fn connection(message: impl Into<String>) -> Self {
        SqlError::new(ErrorKind::TransientConnection, message, "08000", 0)
    }

    /// Raised by the command prologue when the socket is gone.
    pub fn connection_closed() -> Self {
        SqlError::new(
            ErrorKind::NonTransientConnection,
            "Connection is closed",
            "08000",
            1220,
        )
    }

    /// Raised by facades after an explicit `close()`.
    pub fn closed_explicitly(op: &str) -> Self {
        SqlError::new(
            ErrorKind::NonTransientConnection,
            format!("{op}() is called on closed connection"),
            "08000",
            1220,
        )
    }

    pub fn max_allowed_packet(message: impl Into<String>, must_reconnect: bool) -> Self {
        let mut err = SqlError::new(ErrorKind::MaxAllowedPacket, message, "HY000", 0);
        err.must_reconnect = must_reconnect;
        err
    }

    /// Batch failure carrying the partial update-count vector. SQLState and
    /// vendor code are those of the first failure, which becomes the `next`
    /// link.
    pub fn batch(first: SqlError, update_counts: Vec<i64>) -> Self {
        let mut err = SqlError::new(
            ErrorKind::BatchUpdate,
            first.message.clone(),
            first.sql_state.clone(),
            first.error_code,
        );
        err.update_counts = Some(update_counts);
        err.next = Some(Box::new(first));
        err
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Append to the end of the `next` chain.
    pub fn chain_next(&mut self, next: SqlError) {
        let mut tail = self;
        while tail.next.is_some() {
            tail = tail.next.as_mut().unwrap();
        }
        tail.next = Some(Box::new(next));
    }

    /// Failover decoration: `"\non <HostAddress>, master=<bool>"`.
    pub fn with_host_info(mut self, host: &str, master: bool) -> Self {
        self.message = format!("{}\non {host}, master={master}", self.message);
        self
    }

    pub fn append_message(&mut self, suffix: &str) {
        self.message.push_str(suffix);
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn sql_state(&self) -> &str {
        &self.sql_state
    }

    pub fn error_code(&self) -> u16 {
        self.error_code
    }

    pub fn parse_position(&self) -> Option<usize> {
        self.parse_position
    }

    pub fn must_reconnect(&self) -> bool {
        self.must_reconnect
    }

    pub fn update_counts(&self) -> Option<&[i64]> {
        self.update_counts.as_deref()
    }

    pub fn next_error(&self) -> Option<&SqlError> {
        self.next.as_deref()
    }

    /// Connection-class errors are handed to the failover proxy: SQLState
    /// `08xxx`, or the kill marker `70100` / vendor code 1927.
    pub fn is_connection_error(&self) -> bool {
        self.sql_state.starts_with("08")
            || (self.sql_state == "70100" && self.error_code == 1927)
    }
}

fn classify_server_error(error_code: u16, sql_state: &str) -> ErrorKind {
    match error_code {
        1064 => return ErrorKind::Syntax,
        1044 | 1045 | 1142 => return ErrorKind::Authorization,
        1205 | 1213 => return ErrorKind::Transient,
        1927 => return ErrorKind::TransientConnection,
        _ => {}
    }
    match sql_state.get(..2) {
        Some("22") => ErrorKind::Data,
        Some("23") => ErrorKind::Integrity,
        Some("28") => ErrorKind::Authorization,
        Some("08") => ErrorKind::TransientConnection,
        Some("40") => ErrorKind::RollbackTransaction,
        Some("42") => ErrorKind::Syntax,
        Some("0A") => ErrorKind::FeatureNotSupported,
        Some("70") if sql_state == "70100" => ErrorKind::TransientConnection,
        _ => ErrorKind::Other,
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.sql_state.is_empty() {
            write!(f, " (SQLState: {}", self.sql_state)?;
            if self.error_code != 0 {
                write!(f, ", code: {}", self.error_code)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for SqlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for SqlError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::TransientConnection,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorKind::TransientConnection,
            _ => ErrorKind::NonTransientConnection,
        };
        let mut sql = SqlError::new(kind, format!("socket error: {err}"), "08000", 0);
        sql.cause = Some(Box::new(err));
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_server_error_classification() {
        assert_eq!(SqlError::from_server(1064, "42000", "x").kind(), ErrorKind::Syntax);
        assert_eq!(SqlError::from_server(1062, "23000", "x").kind(), ErrorKind::Integrity);
        assert_eq!(SqlError::from_server(1452, "23000", "x").kind(), ErrorKind::Integrity);
        assert_eq!(SqlError::from_server(1045, "28000", "x").kind(), ErrorKind::Authorization);
        assert_eq!(SqlError::from_server(1213, "40001", "x").kind(), ErrorKind::Transient);
        assert_eq!(SqlError::from_server(1205, "HY000", "x").kind(), ErrorKind::Transient);
        assert_eq!(SqlError::from_server(3024, "22001", "x").kind(), ErrorKind::Data);
    }

    #[test]
    pub fn test_connection_error_detection() {
        assert!(SqlError::connection("gone").is_connection_error());
        assert!(SqlError::from_server(1927, "70100", "killed").is_connection_error());
        assert!(!SqlError::from_server(1927, "70101", "nope").is_connection_error());
        assert!(!SqlError::syntax("bad").is_connection_error());
    }

    #[test]
    pub fn test_host_decoration_and_chain() {
        let err = SqlError::connection("lost").with_host_info("db1:3306", true);
        assert!(err.message().ends_with("\non db1:3306, master=true"));

        let mut first = SqlError::syntax("a");
        first.chain_next(SqlError::syntax("b"));
        first.chain_next(SqlError::syntax("c"));
        let second = first.next_error().unwrap();
        assert_eq!(second.message(), "b");
        assert_eq!(second.next_error().unwrap().message(), "c");
    }

    #[test]
    pub fn test_batch_error_carries_counts() {
        let cause = SqlError::from_server(1062, "23000", "dup");
        let err = SqlError::batch(cause, vec![1, 1, -3]);
        assert_eq!(err.kind(), ErrorKind::BatchUpdate);
        assert_eq!(err.sql_state(), "23000");
        assert_eq!(err.update_counts(), Some(&[1, 1, -3][..]));
        assert_eq!(err.next_error().unwrap().message(), "dup");
    }
}
