pub mod auth;
pub mod charset;
pub mod connect;
pub mod constants;
pub mod packet;
pub mod query;
#[cfg(feature = "tls")]
pub mod tls;

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use mysql_common::constants::StatusFlags;

use crate::error::{Result, SqlError};
use crate::options::Options;
use crate::prepare::PsCache;
use crate::protocol::constants::IsolationLevel;
use crate::protocol::packet::PacketIo;
use crate::resultset::column::ColumnInformation;
use crate::resultset::SharedTail;
use crate::sql::EscapeContext;
use crate::url::{HostAddress, UrlParser};

/// The one result set currently reading off this connection's socket.
/// Holds only what draining needs; the connection does not keep its result
/// sets alive.
pub struct ActiveStream {
    pub columns: Arc<Vec<ColumnInformation>>,
    pub binary: bool,
    pub shared: Arc<SharedTail>,
}

/// Responses of a streamed execution that followed the streamed row set;
/// buffered when the stream is drained, claimed by `getMoreResults`.
pub use crate::resultset::results::ResultHolder as FollowUpResult;

/// Session state machine of one physical connection. All socket access and
/// state mutation happens behind the owning `Arc<Mutex<Protocol>>`.
pub struct Protocol {
    pub(crate) url: Arc<UrlParser>,
    pub(crate) opts: Arc<Options>,
    pub(crate) host: HostAddress,
    pub(crate) io: Option<PacketIo>,
    /// backlink used to hand weak references to streaming result sets
    pub(crate) self_ref: Weak<Mutex<Protocol>>,

    pub(crate) connected: bool,
    pub(crate) explicit_closed: bool,
    pub(crate) host_failed: bool,

    pub(crate) server_capabilities: u64,
    pub(crate) client_capabilities: u64,
    pub(crate) server_version: String,
    pub(crate) major: u32,
    pub(crate) minor: u32,
    pub(crate) patch: u32,
    pub(crate) server_mariadb: bool,
    pub(crate) server_thread_id: u32,
    pub(crate) server_status: StatusFlags,
    pub(crate) eof_deprecated: bool,

    pub(crate) has_warnings: bool,
    pub(crate) auto_increment_increment: i32,
    pub(crate) max_rows: i64,
    pub(crate) transaction_isolation: Option<IsolationLevel>,
    pub(crate) socket_timeout: Option<Duration>,
    pub(crate) database: String,
    pub(crate) max_allowed_packet: usize,
    pub(crate) system_time_zone: String,
    pub(crate) time_zone: String,

    pub(crate) active_stream: Option<ActiveStream>,
    pub(crate) pending_followups: Vec<FollowUpResult>,
    /// prepared-statement handles whose owner could not issue the close;
    /// flushed by the next command prologue
    pub(crate) statement_id_to_release: Arc<Mutex<Vec<u32>>>,
    pub(crate) ps_cache: PsCache,
    /// shared so that cancellation paths can set it without the lock
    pub(crate) interrupted: Arc<AtomicBool>,

    pub(crate) read_only: bool,
    pub(crate) master: bool,
    pub(crate) expired_password: bool,

    pub(crate) local_infile_input: Option<Box<dyn Read + Send>>,
}

impl Protocol {
    pub fn new(url: Arc<UrlParser>, host: HostAddress) -> Protocol {
        let opts = url.options().clone();
        let release_queue = Arc::new(Mutex::new(Vec::new()));
        let ps_cache = PsCache::new(
            opts.prep_stmt_cache_size,
            opts.prep_stmt_cache_sql_limit,
            release_queue.clone(),
        );
        Protocol {
            database: url.database().unwrap_or("").to_string(),
            url,
            opts,
            host,
            io: None,
            self_ref: Weak::new(),
            connected: false,
            explicit_closed: false,
            host_failed: false,
            server_capabilities: 0,
            client_capabilities: 0,
            server_version: String::new(),
            major: 0,
            minor: 0,
            patch: 0,
            server_mariadb: false,
            server_thread_id: 0,
            server_status: StatusFlags::empty(),
            eof_deprecated: false,
            has_warnings: false,
            auto_increment_increment: 1,
            max_rows: 0,
            transaction_isolation: None,
            socket_timeout: None,
            max_allowed_packet: 0x0040_0000,
            system_time_zone: String::new(),
            time_zone: String::new(),
            active_stream: None,
            pending_followups: Vec::new(),
            statement_id_to_release: release_queue,
            ps_cache,
            interrupted: Arc::new(AtomicBool::new(false)),
            read_only: false,
            master: true,
            expired_password: false,
            local_infile_input: None,
        }
    }

    /// Build the shared, lockable protocol and stamp the backlink used by
    /// streaming result sets.
    pub fn into_shared(self) -> Arc<Mutex<Protocol>> {
        let shared = Arc::new(Mutex::new(self));
        let weak = Arc::downgrade(&shared);
        shared.lock().unwrap().self_ref = weak;
        shared
    }

    pub fn options(&self) -> &Arc<Options> {
        &self.opts
    }

    pub fn url_parser(&self) -> &Arc<UrlParser> {
        &self.url
    }

    pub fn host(&self) -> &HostAddress {
        &self.host
    }

    pub fn set_host(&mut self, host: HostAddress) {
        self.host = host;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_explicit_closed(&self) -> bool {
        self.explicit_closed
    }

    pub fn is_host_failed(&self) -> bool {
        self.host_failed
    }

    pub fn set_host_failed(&mut self) {
        self.host_failed = true;
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn is_server_mariadb(&self) -> bool {
        self.server_mariadb
    }

    pub fn server_thread_id(&self) -> u32 {
        self.server_thread_id
    }

    pub fn version_greater_or_equal(&self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }

    pub fn server_status(&self) -> StatusFlags {
        self.server_status
    }

    pub fn autocommit(&self) -> bool {
        self.server_status
            .contains(StatusFlags::SERVER_STATUS_AUTOCOMMIT)
    }

    pub fn in_transaction(&self) -> bool {
        self.server_status
            .contains(StatusFlags::SERVER_STATUS_IN_TRANS)
    }

    pub fn has_more_results(&self) -> bool {
        self.server_status
            .contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS)
    }

    pub fn no_backslash_escapes(&self) -> bool {
        self.server_status
            .contains(StatusFlags::SERVER_STATUS_NO_BACKSLASH_ESCAPES)
    }

    pub fn has_warnings(&self) -> bool {
        self.has_warnings
    }

    pub fn auto_increment_increment(&self) -> i32 {
        self.auto_increment_increment
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn max_rows(&self) -> i64 {
        self.max_rows
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn has_expired_password(&self) -> bool {
        self.expired_password
    }

    pub fn max_allowed_packet(&self) -> usize {
        self.max_allowed_packet
    }

    pub fn time_zone(&self) -> (&str, &str) {
        (&self.system_time_zone, &self.time_zone)
    }

    pub fn ps_cache(&self) -> &PsCache {
        &self.ps_cache
    }

    pub fn escape_context(&self) -> EscapeContext {
        EscapeContext {
            server_mariadb: self.server_mariadb,
            major: self.major,
            minor: self.minor,
            patch: self.patch,
            no_backslash_escapes: self.no_backslash_escapes(),
        }
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Settable without holding the protocol lock.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn stop_if_interrupted(&self) -> Result<()> {
        if self.is_interrupted() {
            return Err(SqlError::batch_timeout());
        }
        Ok(())
    }

    /// Feed for the next LOCAL INFILE request instead of opening the file
    /// the server names.
    pub fn set_local_infile_stream(&mut self, stream: Box<dyn Read + Send>) {
        self.local_infile_input = Some(stream);
    }

    pub(crate) fn check_connected(&self) -> Result<()> {
        if !self.connected {
            return Err(SqlError::connection_closed());
        }
        Ok(())
    }

    pub(crate) fn io_mut(&mut self) -> Result<&mut PacketIo> {
        self.io.as_mut().ok_or_else(SqlError::connection_closed)
    }
}
