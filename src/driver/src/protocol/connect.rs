use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::Ordering;

use mysql_common::constants::CapabilityFlags;
use tracing::{debug, warn};

use crate::error::{ErrorKind, Result, SqlError};
use crate::protocol::auth::{
    initial_auth_data, CACHING_SHA2_FAST_AUTH_OK, CACHING_SHA2_FULL_AUTH,
};
use crate::protocol::charset::{collation_for_encoding, decide_language};
use crate::protocol::constants::{AuthPluginName, MariaDbCapabilities};
use crate::protocol::packet::{readers, writers, PacketIo, Stream};
use crate::protocol::Protocol;
use crate::resultset::results::Results;
use crate::url::{HaMode, TransportType};

/// CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: survive the sandboxed
/// expired-password session instead of failing authentication.
const CAN_HANDLE_EXPIRED_PASSWORDS: u64 = 1 << 22;

const SESSION_QUERY: &str = "SELECT @@max_allowed_packet, @@system_time_zone, @@time_zone, \
                             @@auto_increment_increment";
const IS_MASTER_QUERY: &str = "select @@innodb_read_only";

impl Protocol {
    /// Ordered connect procedure. Any failure tears the socket down,
    /// leaves the protocol reconnectable and surfaces an 08-class error.
    pub fn connect(&mut self) -> Result<()> {
        match self.create_connection() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.destroy_socket();
                if err.sql_state().starts_with("08") || err.kind() == ErrorKind::Authorization {
                    Err(err)
                } else {
                    Err(SqlError::new(
                        ErrorKind::TransientConnection,
                        format!("Could not connect to {}: {}", self.host, err.message()),
                        "08000",
                        0,
                    ))
                }
            }
        }
    }

    fn create_connection(&mut self) -> Result<()> {
        let stream = self.create_socket()?;
        let mut io = PacketIo::new(stream, self.opts.enable_packet_debug);

        let payload = io.read_packet()?;
        if payload.first() == Some(&0xff) {
            return Err(readers::parse_err_packet(&payload));
        }
        let greeting = readers::parse_initial_handshake(&payload)?;
        self.parse_version(&greeting.server_version);
        self.server_thread_id = greeting.connection_id;
        self.server_capabilities = greeting.capabilities;
        self.server_status = greeting.status_flags;

        let collation = self
            .opts
            .use_character_encoding
            .as_deref()
            .and_then(collation_for_encoding)
            .unwrap_or_else(|| {
                decide_language(greeting.default_collation, self.major, self.minor)
            });

        let capabilities = self.initialize_client_capabilities();
        self.client_capabilities = capabilities;
        self.eof_deprecated =
            capabilities & CapabilityFlags::CLIENT_DEPRECATE_EOF.bits() as u64 != 0;

        #[cfg(feature = "tls")]
        let mut io = if self.opts.use_tls {
            if self.server_capabilities & CapabilityFlags::CLIENT_SSL.bits() as u64 == 0 {
                return Err(SqlError::new(
                    ErrorKind::NonTransientConnection,
                    "Trying to connect with TLS, but the server does not support it",
                    "08000",
                    0,
                ));
            }
            let ssl_caps = capabilities | CapabilityFlags::CLIENT_SSL.bits() as u64;
            self.client_capabilities = ssl_caps;
            writers::write_ssl_request(&mut io, ssl_caps, 1 << 24, collation)?;
            let host = self.host.host.clone();
            let opts = self.opts.clone();
            io.map_stream(|stream| match stream {
                Stream::Tcp(tcp) => crate::protocol::tls::wrap_stream(tcp, &host, &opts)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string())),
                other => Ok(other),
            })?
        } else {
            io
        };
        #[cfg(not(feature = "tls"))]
        if self.opts.use_tls {
            return Err(SqlError::feature_not_supported(
                "useTls requires the driver's tls feature",
            ));
        }

        self.authenticate(&mut io, &greeting, collation)?;

        self.io = Some(io);
        self.connected = true;
        self.interrupted.store(false, Ordering::Release);

        if let Err(err) = self.post_connection_queries() {
            self.destroy_socket();
            if err.sql_state().starts_with("08") {
                return Err(err);
            }
            return Err(SqlError::new(
                ErrorKind::TransientConnection,
                format!("Socket error during post connection queries: {}", err.message()),
                "08000",
                0,
            ));
        }

        self.active_stream = None;
        self.host_failed = false;
        debug!(
            "connected to {} (conn={}, server {} {})",
            self.host,
            self.server_thread_id,
            if self.server_mariadb { "MariaDB" } else { "MySQL" },
            self.server_version
        );
        Ok(())
    }

    fn create_socket(&self) -> Result<Stream> {
        match self.host.transport {
            TransportType::Tcp => {
                let address = (self.host.host.as_str(), self.host.port)
                    .to_socket_addrs()
                    .map_err(SqlError::from)?
                    .next()
                    .ok_or_else(|| {
                        SqlError::connection(format!("Could not resolve host '{}'", self.host.host))
                    })?;
                let stream = TcpStream::connect_timeout(&address, self.opts.connect_timeout)
                    .map_err(SqlError::from)?;
                stream.set_nodelay(self.opts.tcp_no_delay).map_err(SqlError::from)?;
                stream
                    .set_read_timeout(self.opts.socket_timeout)
                    .map_err(SqlError::from)?;
                stream
                    .set_write_timeout(self.opts.socket_timeout)
                    .map_err(SqlError::from)?;
                if self.opts.tcp_rcv_buf.is_some() || self.opts.tcp_snd_buf.is_some() {
                    warn!("tcpRcvBuf/tcpSndBuf are accepted but socket buffer sizing follows the OS");
                }
                Ok(Stream::Tcp(stream))
            }
            #[cfg(unix)]
            TransportType::Unix => {
                let path = self
                    .opts
                    .local_socket
                    .as_deref()
                    .unwrap_or(self.host.host.as_str());
                let stream =
                    std::os::unix::net::UnixStream::connect(path).map_err(SqlError::from)?;
                stream
                    .set_read_timeout(self.opts.socket_timeout)
                    .map_err(SqlError::from)?;
                Ok(Stream::Unix(stream))
            }
            #[cfg(not(unix))]
            TransportType::Unix => Err(SqlError::feature_not_supported(
                "Unix socket transport is not available on this platform",
            )),
            TransportType::Pipe => Err(SqlError::new(
                ErrorKind::FeatureNotImplemented,
                "Named pipe transport is not implemented",
                "0A000",
                0,
            )),
        }
    }

    /// Client capability mask for the handshake response.
    fn initialize_client_capabilities(&self) -> u64 {
        let mut capabilities = (CapabilityFlags::CLIENT_IGNORE_SPACE
            | CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_TRANSACTIONS
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_MULTI_RESULTS
            | CapabilityFlags::CLIENT_PS_MULTI_RESULTS
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_CONNECT_ATTRS
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CapabilityFlags::CLIENT_SESSION_TRACK)
            .bits() as u64
            | CAN_HANDLE_EXPIRED_PASSWORDS;

        if self.opts.allow_local_infile {
            capabilities |= CapabilityFlags::CLIENT_LOCAL_FILES.bits() as u64;
        }
        if !self.opts.use_affected_rows {
            capabilities |= CapabilityFlags::CLIENT_FOUND_ROWS.bits() as u64;
        }
        if self.opts.allow_multi_queries || self.opts.rewrite_batched_statements {
            capabilities |= CapabilityFlags::CLIENT_MULTI_STATEMENTS.bits() as u64;
        }
        if self.server_capabilities & CapabilityFlags::CLIENT_DEPRECATE_EOF.bits() as u64 != 0 {
            capabilities |= CapabilityFlags::CLIENT_DEPRECATE_EOF.bits() as u64;
        }
        if self.opts.use_compression {
            // compressed framing is left to the transport; the option is
            // forced off when the server cannot compress anyway
            if self.server_capabilities & CapabilityFlags::CLIENT_COMPRESS.bits() as u64 == 0 {
                warn!("useCompression requested but server lacks COMPRESS; continuing without");
            } else {
                warn!("useCompression is not carried by this driver; continuing without");
            }
        }
        if self.opts.interactive_client {
            capabilities |= CapabilityFlags::CLIENT_INTERACTIVE.bits() as u64;
        }
        if !self.database.is_empty() && !self.opts.create_database_if_not_exist {
            capabilities |= CapabilityFlags::CLIENT_CONNECT_WITH_DB.bits() as u64;
        }
        if self.server_capabilities
            & MariaDbCapabilities::MARIADB_CLIENT_STMT_BULK_OPERATIONS.bits()
            != 0
        {
            capabilities |= MariaDbCapabilities::MARIADB_CLIENT_STMT_BULK_OPERATIONS.bits();
        }
        capabilities
    }

    fn authenticate(
        &mut self,
        io: &mut PacketIo,
        greeting: &readers::InitialHandshake,
        collation: u8,
    ) -> Result<()> {
        let user = self.opts.user.clone().unwrap_or_default();
        let password = self.opts.password.clone().unwrap_or_default();
        let confidential = io.stream().is_confidential();

        let mut plugin = AuthPluginName::from_name(&greeting.auth_plugin);
        if plugin == AuthPluginName::UnknownPluginName {
            plugin = AuthPluginName::AuthNativePassword;
        }
        let auth_data = initial_auth_data(&plugin, &password, &greeting.seed, confidential)?;

        let database = if self.client_capabilities
            & CapabilityFlags::CLIENT_CONNECT_WITH_DB.bits() as u64
            != 0
        {
            Some(self.database.as_str())
        } else {
            None
        };
        let connect_attrs = vec![
            ("_client_name".to_string(), env!("CARGO_PKG_NAME").to_string()),
            ("_client_version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
        ];
        writers::write_handshake_response(
            io,
            self.client_capabilities,
            1 << 24,
            collation,
            &user,
            &auth_data,
            database,
            plugin.as_ref(),
            &connect_attrs,
        )?;

        loop {
            let payload = io.read_packet()?;
            match payload.first().copied() {
                Some(0x00) => {
                    let caps =
                        CapabilityFlags::from_bits_truncate(self.client_capabilities as u32);
                    let ok = readers::parse_ok_packet(&payload, caps)?;
                    self.server_status = ok.status_flags;
                    return Ok(());
                }
                Some(0xff) => {
                    let err = readers::parse_err_packet(&payload);
                    return Err(err);
                }
                Some(0xfe) => {
                    // plugin switch
                    let switch = readers::parse_auth_switch_request(&payload)?;
                    let next_plugin = AuthPluginName::from_name(&switch.plugin_name);
                    let data =
                        initial_auth_data(&next_plugin, &password, &switch.seed, confidential)?;
                    writers::write_auth_response(io, &data)?;
                }
                Some(0x01) => {
                    // caching_sha2 continuation
                    match payload.get(1).copied() {
                        Some(CACHING_SHA2_FAST_AUTH_OK) => {}
                        Some(CACHING_SHA2_FULL_AUTH) => {
                            if !confidential {
                                return Err(SqlError::new(
                                    ErrorKind::NonTransientConnection,
                                    "caching_sha2_password full authentication requires TLS \
                                     or a local socket",
                                    "08004",
                                    0,
                                ));
                            }
                            let mut clear = password.as_bytes().to_vec();
                            clear.push(0);
                            writers::write_auth_response(io, &clear)?;
                        }
                        other => {
                            return Err(SqlError::connection(format!(
                                "unexpected authentication continuation {other:?}"
                            )))
                        }
                    }
                }
                other => {
                    return Err(SqlError::connection(format!(
                        "unexpected packet during authentication: {other:?}"
                    )))
                }
            }
        }
    }

    // ---- post-connect session bootstrap --------------------------------

    fn post_connection_queries(&mut self) -> Result<()> {
        let mut server_data = HashMap::new();
        if self.opts.use_pipeline_auth && !self.opts.create_database_if_not_exist {
            match self.pipeline_additional_data(&mut server_data) {
                Ok(()) => {}
                Err(err) if err.sql_state().starts_with("08") => return Err(err),
                Err(_) => {
                    // pipeline unsupported in the path (a proxy flushing
                    // after the first packet); retry sequentially
                    server_data.clear();
                    self.additional_data(&mut server_data)?;
                }
            }
        } else {
            self.additional_data(&mut server_data)?;
        }

        if let Some(raw) = server_data.get("max_allowed_packet") {
            self.max_allowed_packet = raw.parse().unwrap_or(self.max_allowed_packet);
        }
        if let Some(raw) = server_data.get("auto_increment_increment") {
            self.auto_increment_increment = raw.parse().unwrap_or(1);
        }
        self.system_time_zone = server_data
            .remove("system_time_zone")
            .unwrap_or_default();
        self.time_zone = server_data.remove("time_zone").unwrap_or_default();

        if self.opts.create_database_if_not_exist && !self.database.is_empty() {
            let quoted = quote_identifier(&self.database);
            self.internal_query(&format!("CREATE DATABASE IF NOT EXISTS {quoted}"))?;
            self.internal_query(&format!("USE {quoted}"))?;
        }
        Ok(())
    }

    fn pipeline_additional_data(
        &mut self,
        server_data: &mut HashMap<String, String>,
    ) -> Result<()> {
        let session_sql = self.session_infos_query()?;
        let check_master = self.url.ha_mode() == HaMode::Aurora;
        {
            let io = self.io_mut()?;
            writers::write_query(io, session_sql.as_bytes())?;
            writers::write_query(io, SESSION_QUERY.as_bytes())?;
            if check_master {
                writers::write_query(io, IS_MASTER_QUERY.as_bytes())?;
            }
        }
        // reads happen in write order
        let mut results = Results::new(0);
        self.read_response(&mut results, None, true)?;
        self.read_session_variables(server_data)?;
        if check_master {
            self.read_check_master()?;
        }
        Ok(())
    }

    fn additional_data(&mut self, server_data: &mut HashMap<String, String>) -> Result<()> {
        let session_sql = self.session_infos_query()?;
        self.internal_query(&session_sql)?;
        {
            let io = self.io_mut()?;
            writers::write_query(io, SESSION_QUERY.as_bytes())?;
        }
        if self.read_session_variables(server_data).is_err() {
            self.request_session_data_with_show(server_data)?;
        }
        if self.url.ha_mode() == HaMode::Aurora {
            let io = self.io_mut()?;
            writers::write_query(io, IS_MASTER_QUERY.as_bytes())?;
            self.read_check_master()?;
        }
        Ok(())
    }

    /// One SET statement for the whole session posture.
    fn session_infos_query(&self) -> Result<String> {
        let mut session_option = format!(
            "autocommit={}",
            if self.opts.autocommit { "1" } else { "0" }
        );
        if self.client_capabilities & CapabilityFlags::CLIENT_SESSION_TRACK.bits() as u64 != 0 {
            session_option.push_str(", session_track_schema=1");
            session_option
                .push_str(", session_track_system_variables='auto_increment_increment'");
        }
        if self.opts.jdbc_compliant_truncation {
            session_option.push_str(", sql_mode = concat(@@sql_mode,',STRICT_TRANS_TABLES')");
        }
        if let Some(user_variables) = &self.opts.session_variables {
            session_option.push(',');
            session_option.push_str(&parse_session_variables(user_variables)?);
        }
        Ok(format!("set {session_option}"))
    }

    fn read_session_variables(
        &mut self,
        server_data: &mut HashMap<String, String>,
    ) -> Result<()> {
        let mut results = Results::new(0);
        self.read_response(&mut results, None, true)?;
        results.command_end();
        let rs = results.result_set().ok_or_else(|| {
            SqlError::connection("Error reading SessionVariables results")
        })?;
        if !rs.next()? {
            return Err(SqlError::connection("Error reading SessionVariables results"));
        }
        for (index, key) in [
            "max_allowed_packet",
            "system_time_zone",
            "time_zone",
            "auto_increment_increment",
        ]
        .iter()
        .enumerate()
        {
            if let Some(value) = rs.get_string(index + 1)? {
                server_data.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    /// Fallback for servers that refuse the SELECT form.
    fn request_session_data_with_show(
        &mut self,
        server_data: &mut HashMap<String, String>,
    ) -> Result<()> {
        let mut results = self.internal_query_results(
            "SHOW VARIABLES WHERE Variable_name in (\
             'max_allowed_packet',\
             'system_time_zone',\
             'time_zone',\
             'auto_increment_increment')",
        )?;
        results.command_end();
        let rs = results
            .result_set()
            .ok_or_else(|| SqlError::connection("could not load system variables"))?;
        while rs.next()? {
            if let (Some(name), Some(value)) = (rs.get_string(1)?, rs.get_string(2)?) {
                server_data.insert(name, value);
            }
        }
        if server_data.len() < 4 {
            return Err(SqlError::connection("could not load system variables"));
        }
        Ok(())
    }

    fn read_check_master(&mut self) -> Result<()> {
        let mut results = Results::new(0);
        self.read_response(&mut results, None, true)?;
        results.command_end();
        if let Some(rs) = results.result_set() {
            if rs.next()? {
                // innodb_read_only=1 means an Aurora replica
                self.master = rs.get_long(1)? == 0;
            }
        }
        Ok(())
    }

    pub(crate) fn parse_version(&mut self, server_version: &str) {
        self.server_version = server_version.to_string();
        // MariaDB through replication announces itself as 5.5.5-x.y.z-MariaDB
        let effective = server_version.strip_prefix("5.5.5-").unwrap_or(server_version);
        self.server_mariadb =
            server_version.contains("MariaDB") || server_version.starts_with("5.5.5-");

        let mut numbers = [0u32; 3];
        let mut slot = 0;
        let mut current = 0u32;
        let mut seen_digit = false;
        for c in effective.chars() {
            if let Some(digit) = c.to_digit(10) {
                current = current.saturating_mul(10) + digit;
                seen_digit = true;
            } else if c == '.' && slot < 2 {
                numbers[slot] = current;
                slot += 1;
                current = 0;
                seen_digit = false;
            } else {
                break;
            }
        }
        if seen_digit && slot < 3 {
            numbers[slot] = current;
        }
        self.major = numbers[0];
        self.minor = numbers[1];
        self.patch = numbers[2];
    }

    // ---- teardown / recovery -------------------------------------------

    /// Graceful close: QUIT then socket teardown.
    pub fn close(&mut self) {
        if let Some(io) = self.io.as_mut() {
            let _ = writers::write_quit(io);
        }
        self.destroy_socket();
        self.ps_cache.clear();
        self.statement_id_to_release.lock().unwrap().clear();
    }

    pub fn close_explicit(&mut self) {
        self.explicit_closed = true;
        self.close();
    }

    /// Hard teardown without any protocol goodbye.
    pub fn abort(&mut self) {
        self.explicit_closed = true;
        self.destroy_socket();
    }

    pub(crate) fn destroy_socket(&mut self) {
        self.active_stream = None;
        self.connected = false;
        if let Some(io) = self.io.take() {
            io.shutdown();
        }
    }

    /// Reconnect to the same host and replay the session-affecting state.
    pub fn reconnect(&mut self) -> Result<()> {
        let max_rows = self.max_rows;
        let isolation = self.transaction_isolation;
        let database = self.database.clone();
        let autocommit = self.opts.autocommit;

        self.destroy_socket();
        self.explicit_closed = false;
        self.connect()?;
        self.reset_state_after_failover(max_rows, isolation, &database, autocommit)
    }

    pub fn reset_state_after_failover(
        &mut self,
        max_rows: i64,
        isolation: Option<crate::protocol::constants::IsolationLevel>,
        database: &str,
        autocommit: bool,
    ) -> Result<()> {
        self.set_max_rows(max_rows)?;
        if let Some(level) = isolation {
            self.set_transaction_isolation(level)?;
        }
        if !database.is_empty() && self.database != database {
            self.set_catalog(database)?;
        }
        if self.autocommit() != autocommit {
            self.internal_query(&format!("set autocommit={}", autocommit as u8))?;
        }
        Ok(())
    }
}

fn quote_identifier(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

/// `sessionVariables` sanitation: `key=value` pairs where the key is an
/// identifier and the value an identifier, number or quoted literal.
pub(crate) fn parse_session_variables(raw: &str) -> Result<String> {
    let mut sanitized = Vec::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            SqlError::invalid_argument(format!("invalid session variable '{pair}'"))
        })?;
        let key = key.trim();
        let value = value.trim();
        let key_ok = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        let quoted = value.len() >= 2
            && ((value.starts_with('\'') && value.ends_with('\''))
                || (value.starts_with('"') && value.ends_with('"')))
            && !value[1..value.len() - 1].contains(['\'', '"', '\\', ';']);
        let bare = !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
        if !key_ok || !(quoted || bare) {
            return Err(SqlError::invalid_argument(format!(
                "invalid session variable '{pair}'"
            )));
        }
        sanitized.push(format!("{key}={value}"));
    }
    Ok(sanitized.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::UrlParser;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn protocol() -> Protocol {
        let url = Arc::new(
            UrlParser::parse("jdbc:mariadb://localhost/test", &BTreeMap::new()).unwrap(),
        );
        let host = url.hosts()[0].clone();
        Protocol::new(url, host)
    }

    #[test]
    pub fn test_parse_version_mariadb_prefix() {
        let mut p = protocol();
        p.parse_version("5.5.5-10.6.12-MariaDB-1:10.6.12+maria~ubu2004");
        assert!(p.is_server_mariadb());
        assert_eq!((p.major, p.minor, p.patch), (10, 6, 12));

        p.parse_version("8.0.33");
        assert!(!p.is_server_mariadb());
        assert_eq!((p.major, p.minor, p.patch), (8, 0, 33));
        assert!(p.version_greater_or_equal(8, 0, 17));
        assert!(!p.version_greater_or_equal(8, 1, 0));
    }

    #[test]
    pub fn test_capabilities_follow_options() {
        let url = Arc::new(
            UrlParser::parse(
                "jdbc:mariadb://localhost/test?allowLocalInfile=true&allowMultiQueries=true",
                &BTreeMap::new(),
            )
            .unwrap(),
        );
        let host = url.hosts()[0].clone();
        let p = Protocol::new(url, host);
        let caps = p.initialize_client_capabilities();
        assert!(caps & CapabilityFlags::CLIENT_LOCAL_FILES.bits() as u64 != 0);
        assert!(caps & CapabilityFlags::CLIENT_MULTI_STATEMENTS.bits() as u64 != 0);
        assert!(caps & CapabilityFlags::CLIENT_FOUND_ROWS.bits() as u64 != 0);
        assert!(caps & CapabilityFlags::CLIENT_CONNECT_WITH_DB.bits() as u64 != 0);
        // server offered nothing yet
        assert!(caps & CapabilityFlags::CLIENT_DEPRECATE_EOF.bits() as u64 == 0);
    }

    #[test]
    pub fn test_use_affected_rows_drops_found_rows() {
        let url = Arc::new(
            UrlParser::parse(
                "jdbc:mariadb://localhost/test?useAffectedRows=true",
                &BTreeMap::new(),
            )
            .unwrap(),
        );
        let host = url.hosts()[0].clone();
        let p = Protocol::new(url, host);
        let caps = p.initialize_client_capabilities();
        assert!(caps & CapabilityFlags::CLIENT_FOUND_ROWS.bits() as u64 == 0);
    }

    #[test]
    pub fn test_session_variable_sanitation() {
        assert_eq!(
            parse_session_variables("wait_timeout=3600, sql_mode='ANSI'").unwrap(),
            "wait_timeout=3600,sql_mode='ANSI'"
        );
        assert!(parse_session_variables("bad key=1").is_err());
        assert!(parse_session_variables("a=1; DROP TABLE t").is_err());
        assert!(parse_session_variables("a='x'; --'").is_err());
    }

    #[test]
    pub fn test_session_infos_query_shape() {
        let mut p = protocol();
        p.client_capabilities = CapabilityFlags::CLIENT_SESSION_TRACK.bits() as u64;
        let q = p.session_infos_query().unwrap();
        assert!(q.starts_with("set autocommit=1"));
        assert!(q.contains("session_track_schema=1"));
        assert!(q.contains("session_track_system_variables='auto_increment_increment'"));
        assert!(q.contains("STRICT_TRANS_TABLES"));
    }

    #[test]
    pub fn test_quote_identifier() {
        assert_eq!(quote_identifier("db"), "`db`");
        assert_eq!(quote_identifier("we`ird"), "`we``ird`");
    }
}
