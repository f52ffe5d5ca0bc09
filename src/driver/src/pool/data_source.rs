use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::pool::{remove_pool, retrieve_pool, Pool, PooledConnection};
use crate::url::UrlParser;

/// DataSource facade over the per-URL pool. One instance owns one pool;
/// `close` shuts that pool down.
pub struct MariaDbDataSource {
    url: String,
    properties: Mutex<BTreeMap<String, String>>,
    pool: Mutex<Option<(Arc<UrlParser>, Pool)>>,
}

impl MariaDbDataSource {
    pub fn new(url: impl Into<String>) -> MariaDbDataSource {
        MariaDbDataSource {
            url: url.into(),
            properties: Mutex::new(BTreeMap::new()),
            pool: Mutex::new(None),
        }
    }

    pub fn set_user(&self, user: &str) {
        self.properties
            .lock()
            .unwrap()
            .insert("user".to_string(), user.to_string());
    }

    pub fn set_password(&self, password: &str) {
        self.properties
            .lock()
            .unwrap()
            .insert("password".to_string(), password.to_string());
    }

    fn pool(&self, extra: Option<(&str, &str)>) -> Result<Pool> {
        let mut properties = self.properties.lock().unwrap().clone();
        if let Some((user, password)) = extra {
            properties.insert("user".to_string(), user.to_string());
            properties.insert("password".to_string(), password.to_string());
        }
        let url = Arc::new(UrlParser::parse(&self.url, &properties)?);

        let mut slot = self.pool.lock().unwrap();
        match &*slot {
            Some((cached_url, pool))
                if cached_url.pool_key() == url.pool_key() && !pool.is_closed() =>
            {
                Ok(pool.clone())
            }
            _ => {
                let pool = retrieve_pool(&url);
                *slot = Some((url, pool.clone()));
                Ok(pool)
            }
        }
    }

    pub fn get_connection(&self) -> Result<PooledConnection> {
        self.pool(None)?.get_connection()
    }

    pub fn get_connection_with(&self, user: &str, password: &str) -> Result<PooledConnection> {
        self.pool(Some((user, password)))?.get_connection()
    }

    /// Close the pool backing this DataSource.
    pub fn close(&self) {
        if let Some((url, pool)) = self.pool.lock().unwrap().take() {
            pool.close();
            remove_pool(&url);
        }
    }
}

impl Drop for MariaDbDataSource {
    fn drop(&mut self) {
        self.close();
    }
}
