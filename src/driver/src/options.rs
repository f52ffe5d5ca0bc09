use std::collections::BTreeMap;
use std::time::Duration;

use itertools::Itertools;
use tracing::warn;

use crate::error::{Result, SqlError};

/// Connection options, frozen once parsed from the URL query string and the
/// caller-supplied property map. Field defaults follow the driver defaults
/// of the option table.
#[derive(Debug, Clone)]
pub struct Options {
    // endpoint selection
    pub user: Option<String>,
    pub password: Option<String>,
    pub local_socket: Option<String>,
    pub pipe: Option<String>,

    // TLS posture
    pub use_tls: bool,
    pub tls_key: Option<String>,
    pub key_password: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_ca: Option<String>,
    pub tls_ca_path: Option<String>,
    pub tls_crl: Option<String>,
    pub tls_crl_path: Option<String>,
    pub tls_peer_fp: Option<String>,
    pub enabled_tls_protocol_suites: Option<String>,
    pub enabled_tls_cipher_suites: Option<String>,
    pub disable_ssl_hostname_verification: bool,
    pub trust_server_certificate: bool,

    // transport tuning
    pub connect_timeout: Duration,
    pub socket_timeout: Option<Duration>,
    pub tcp_no_delay: bool,
    pub tcp_rcv_buf: Option<usize>,
    pub tcp_snd_buf: Option<usize>,
    pub tcp_abortive_close: bool,

    // connect-path behavior
    pub auto_reconnect: bool,
    pub use_pipeline_auth: bool,
    pub create_database_if_not_exist: bool,

    // capability flags
    pub allow_multi_queries: bool,
    pub allow_local_infile: bool,
    pub use_affected_rows: bool,
    pub use_compression: bool,
    pub interactive_client: bool,
    pub jdbc_compliant_truncation: bool,

    // prepared-statement strategy
    pub use_server_prep_stmts: bool,
    pub cache_prep_stmts: bool,
    pub prep_stmt_cache_size: usize,
    pub prep_stmt_cache_sql_limit: usize,

    // batch strategy
    pub use_bulk_stmts: bool,
    pub rewrite_batched_statements: bool,
    pub use_batch_multi_send: bool,
    pub continue_batch_on_error: bool,

    // session initialization
    pub session_variables: Option<String>,
    pub use_character_encoding: Option<String>,
    pub server_timezone: Option<String>,
    pub autocommit: bool,

    // pool
    pub pool: bool,
    pub min_pool_size: Option<usize>,
    pub max_pool_size: usize,
    pub max_idle_time: Duration,
    pub test_min_removal_delay: Duration,
    pub pin_global_tx_to_physical_connection: bool,

    // observability
    pub profile_sql: bool,
    pub slow_query_threshold_nanos: Option<u64>,
    pub max_query_size_to_log: usize,
    pub dump_queries_on_exception: bool,
    pub enable_packet_debug: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            user: None,
            password: None,
            local_socket: None,
            pipe: None,
            use_tls: false,
            tls_key: None,
            key_password: None,
            tls_cert: None,
            tls_ca: None,
            tls_ca_path: None,
            tls_crl: None,
            tls_crl_path: None,
            tls_peer_fp: None,
            enabled_tls_protocol_suites: None,
            enabled_tls_cipher_suites: None,
            disable_ssl_hostname_verification: false,
            trust_server_certificate: false,
            connect_timeout: Duration::from_secs(30),
            socket_timeout: None,
            tcp_no_delay: true,
            tcp_rcv_buf: None,
            tcp_snd_buf: None,
            tcp_abortive_close: false,
            auto_reconnect: false,
            use_pipeline_auth: true,
            create_database_if_not_exist: false,
            allow_multi_queries: false,
            allow_local_infile: false,
            use_affected_rows: false,
            use_compression: false,
            interactive_client: false,
            jdbc_compliant_truncation: true,
            use_server_prep_stmts: false,
            cache_prep_stmts: true,
            prep_stmt_cache_size: 250,
            prep_stmt_cache_sql_limit: 2048,
            use_bulk_stmts: false,
            rewrite_batched_statements: false,
            use_batch_multi_send: true,
            continue_batch_on_error: false,
            session_variables: None,
            use_character_encoding: None,
            server_timezone: None,
            autocommit: true,
            pool: false,
            min_pool_size: None,
            max_pool_size: 8,
            max_idle_time: Duration::from_secs(600),
            test_min_removal_delay: Duration::from_secs(30),
            pin_global_tx_to_physical_connection: false,
            profile_sql: false,
            slow_query_threshold_nanos: None,
            max_query_size_to_log: 1024,
            dump_queries_on_exception: false,
            enable_packet_debug: false,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "TRUE" | "1" => Ok(true),
        "false" | "FALSE" | "0" => Ok(false),
        other => Err(SqlError::invalid_argument(format!(
            "Optional parameter {key} must be boolean (true/false or 0/1) was '{other}'"
        ))),
    }
}

fn parse_int(key: &str, value: &str) -> Result<u64> {
    value.parse::<u64>().map_err(|_| {
        SqlError::invalid_argument(format!(
            "Optional parameter {key} must be an integer, was '{value}'"
        ))
    })
}

impl Options {
    /// Build the frozen option record from `key=value` properties. The URL
    /// parser merges query-string pairs and the caller property map before
    /// calling this.
    pub fn parse(properties: &BTreeMap<String, String>) -> Result<Options> {
        let mut opts = Options::default();
        for (key, value) in properties {
            opts.apply(key, value)?;
        }
        if opts.min_pool_size.map_or(false, |min| min > opts.max_pool_size) {
            return Err(SqlError::invalid_argument(format!(
                "minPoolSize {} cannot exceed maxPoolSize {}",
                opts.min_pool_size.unwrap(),
                opts.max_pool_size
            )));
        }
        Ok(opts)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "user" => self.user = Some(value.to_string()),
            "password" => self.password = Some(value.to_string()),
            "localSocket" => self.local_socket = Some(value.to_string()),
            "pipe" => self.pipe = Some(value.to_string()),

            "useTls" | "useSsl" => self.use_tls = parse_bool(key, value)?,
            "tlsKey" => self.tls_key = Some(value.to_string()),
            "keyPassword" => self.key_password = Some(value.to_string()),
            "tlsCert" => self.tls_cert = Some(value.to_string()),
            "tlsCA" => self.tls_ca = Some(value.to_string()),
            "tlsCAPath" => self.tls_ca_path = Some(value.to_string()),
            "tlsCRL" => self.tls_crl = Some(value.to_string()),
            "tlsCRLPath" => self.tls_crl_path = Some(value.to_string()),
            "tlsPeerFP" => self.tls_peer_fp = Some(value.to_string()),
            "enabledTlsProtocolSuites" => {
                self.enabled_tls_protocol_suites = Some(value.to_string())
            }
            "enabledTlsCipherSuites" => self.enabled_tls_cipher_suites = Some(value.to_string()),
            "disableSslHostnameVerification" => {
                self.disable_ssl_hostname_verification = parse_bool(key, value)?
            }
            "trustServerCertificate" => self.trust_server_certificate = parse_bool(key, value)?,

            "connectTimeout" => {
                self.connect_timeout = Duration::from_millis(parse_int(key, value)?)
            }
            "socketTimeout" => {
                let millis = parse_int(key, value)?;
                self.socket_timeout =
                    (millis > 0).then(|| Duration::from_millis(millis));
            }
            "tcpNoDelay" => self.tcp_no_delay = parse_bool(key, value)?,
            "tcpRcvBuf" => self.tcp_rcv_buf = Some(parse_int(key, value)? as usize),
            "tcpSndBuf" => self.tcp_snd_buf = Some(parse_int(key, value)? as usize),
            "tcpAbortiveClose" => self.tcp_abortive_close = parse_bool(key, value)?,

            "autoReconnect" => self.auto_reconnect = parse_bool(key, value)?,
            "usePipelineAuth" => self.use_pipeline_auth = parse_bool(key, value)?,
            "createDatabaseIfNotExist" => {
                self.create_database_if_not_exist = parse_bool(key, value)?
            }

            "allowMultiQueries" => self.allow_multi_queries = parse_bool(key, value)?,
            "allowLocalInfile" => self.allow_local_infile = parse_bool(key, value)?,
            "useAffectedRows" => self.use_affected_rows = parse_bool(key, value)?,
            "useCompression" => self.use_compression = parse_bool(key, value)?,
            "interactiveClient" => self.interactive_client = parse_bool(key, value)?,
            "jdbcCompliantTruncation" => {
                self.jdbc_compliant_truncation = parse_bool(key, value)?
            }

            "useServerPrepStmts" => self.use_server_prep_stmts = parse_bool(key, value)?,
            "cachePrepStmts" => self.cache_prep_stmts = parse_bool(key, value)?,
            "prepStmtCacheSize" => self.prep_stmt_cache_size = parse_int(key, value)? as usize,
            "prepStmtCacheSqlLimit" => {
                self.prep_stmt_cache_sql_limit = parse_int(key, value)? as usize
            }

            "useBulkStmts" => self.use_bulk_stmts = parse_bool(key, value)?,
            "rewriteBatchedStatements" => {
                self.rewrite_batched_statements = parse_bool(key, value)?
            }
            "useBatchMultiSend" => self.use_batch_multi_send = parse_bool(key, value)?,
            "continueBatchOnError" => self.continue_batch_on_error = parse_bool(key, value)?,

            "sessionVariables" => self.session_variables = Some(value.to_string()),
            "useCharacterEncoding" => self.use_character_encoding = Some(value.to_string()),
            "serverTimezone" => self.server_timezone = Some(value.to_string()),
            "autocommit" => self.autocommit = parse_bool(key, value)?,

            "pool" => self.pool = parse_bool(key, value)?,
            "minPoolSize" => self.min_pool_size = Some(parse_int(key, value)? as usize),
            "maxPoolSize" => self.max_pool_size = parse_int(key, value)?.max(1) as usize,
            "maxIdleTime" => self.max_idle_time = Duration::from_secs(parse_int(key, value)?),
            "testMinRemovalDelay" => {
                self.test_min_removal_delay = Duration::from_secs(parse_int(key, value)?)
            }
            "pinGlobalTxToPhysicalConnection" => {
                self.pin_global_tx_to_physical_connection = parse_bool(key, value)?
            }

            "profileSql" => self.profile_sql = parse_bool(key, value)?,
            "slowQueryThresholdNanos" => {
                self.slow_query_threshold_nanos = Some(parse_int(key, value)?)
            }
            "maxQuerySizeToLog" => self.max_query_size_to_log = parse_int(key, value)? as usize,
            "dumpQueriesOnException" => {
                self.dump_queries_on_exception = parse_bool(key, value)?
            }
            "enablePacketDebug" => self.enable_packet_debug = parse_bool(key, value)?,

            unknown => warn!("ignoring unknown connection option '{unknown}'"),
        }
        Ok(())
    }

    /// Effective minimum pool size: explicit option, else maxPoolSize.
    pub fn effective_min_pool_size(&self) -> usize {
        self.min_pool_size.unwrap_or(self.max_pool_size)
    }

    /// The subset of properties that affects connection semantics, in
    /// canonical order. Two URLs with the same normalized form share one
    /// pool.
    pub fn normalized_form(properties: &BTreeMap<String, String>) -> String {
        properties
            .iter()
            .filter(|(k, _)| k.as_str() != "password")
            .map(|(k, v)| format!("{k}={v}"))
            .join("&")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    pub fn test_defaults() {
        let opts = Options::parse(&BTreeMap::new()).unwrap();
        assert!(opts.autocommit);
        assert!(opts.use_pipeline_auth);
        assert!(opts.jdbc_compliant_truncation);
        assert!(!opts.use_server_prep_stmts);
        assert_eq!(opts.prep_stmt_cache_size, 250);
        assert_eq!(opts.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    pub fn test_parse_types() {
        let opts = Options::parse(&props(&[
            ("useServerPrepStmts", "true"),
            ("prepStmtCacheSize", "2"),
            ("connectTimeout", "500"),
            ("socketTimeout", "0"),
            ("maxPoolSize", "3"),
        ]))
        .unwrap();
        assert!(opts.use_server_prep_stmts);
        assert_eq!(opts.prep_stmt_cache_size, 2);
        assert_eq!(opts.connect_timeout, Duration::from_millis(500));
        assert_eq!(opts.socket_timeout, None);
        assert_eq!(opts.max_pool_size, 3);
    }

    #[test]
    pub fn test_bad_bool_rejected() {
        assert!(Options::parse(&props(&[("useTls", "maybe")])).is_err());
    }

    #[test]
    pub fn test_min_above_max_rejected() {
        assert!(Options::parse(&props(&[
            ("minPoolSize", "5"),
            ("maxPoolSize", "2")
        ]))
        .is_err());
    }

    #[test]
    pub fn test_normalized_form_skips_password() {
        let normalized = Options::normalized_form(&props(&[
            ("user", "root"),
            ("password", "secret"),
            ("pool", "true"),
        ]));
        assert_eq!(normalized, "pool=true&user=root");
    }
}
