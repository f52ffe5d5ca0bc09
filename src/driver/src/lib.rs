pub mod connection;
pub mod error;
pub mod failover;
pub mod logging;
pub mod options;
pub mod params;
pub mod pool;
pub mod prepare;
pub mod protocol;
pub mod resultset;
pub mod sql;
pub mod statement;
pub mod url;

use std::collections::BTreeMap;
use std::sync::OnceLock;

pub use connection::Connection;
pub use error::{ErrorKind, Result, SqlError};
pub use options::Options;
pub use params::{ParameterHolder, TimeParam};
pub use pool::{MariaDbDataSource, Pool, PooledConnection};
pub use resultset::{ResultSet, ResultSetMetaData, ScrollType};
pub use statement::{CallableStatement, PreparedStatement, Statement};
pub use url::{HaMode, UrlParser};

/// Driver entry point, constructed once per process.
pub struct Driver {
    _private: (),
}

static DRIVER: OnceLock<Driver> = OnceLock::new();

impl Driver {
    pub fn get() -> &'static Driver {
        DRIVER.get_or_init(|| {
            common::log_utils::init_tracing();
            Driver { _private: () }
        })
    }

    /// URLs this driver serves: `jdbc:mariadb:` and `jdbc:mysql:` schemes,
    /// plus the bare form that normalizes to them.
    pub fn accepts_url(&self, url: &str) -> bool {
        !url.starts_with("jdbc:") || url.starts_with("jdbc:mariadb:") || url.starts_with("jdbc:mysql:")
    }

    pub fn connect(&self, url: &str, properties: &BTreeMap<String, String>) -> Result<Connection> {
        if !self.accepts_url(url) {
            return Err(SqlError::invalid_argument(format!(
                "url '{url}' is not handled by this driver"
            )));
        }
        Connection::connect(url, properties)
    }

    /// Library teardown: shuts every registered pool down. No work happens
    /// in static destructors.
    pub fn unload(&self) {
        pool::close_all_pools();
    }
}

/// Convenience entry mirroring `DriverManager.getConnection`.
pub fn connect(url: &str, properties: &BTreeMap<String, String>) -> Result<Connection> {
    Driver::get().connect(url, properties)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_driver_url_acceptance() {
        let driver = Driver::get();
        assert!(driver.accepts_url("jdbc:mariadb://localhost/test"));
        assert!(driver.accepts_url("jdbc:mysql://localhost/test"));
        assert!(driver.accepts_url("localhost:3306/test"));
        assert!(!driver.accepts_url("jdbc:postgresql://localhost/test"));
    }
}
