use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Result, SqlError};
use crate::logging::ProtocolLogger;
use crate::protocol::Protocol;
use crate::url::{HaMode, HostAddress, UrlParser};

/// How long a failed host stays out of rotation.
const BLACKLIST_TIMEOUT: Duration = Duration::from_secs(50);

/// global round-robin start for LOADBALANCE host orders
static ROUND_ROBIN: AtomicUsize = AtomicUsize::new(0);

/// Re-dispatch classification: SQLState `08…`, or the killed-connection
/// marker `70100` with vendor code 1927.
pub fn has_to_handle_failover(err: &SqlError) -> bool {
    err.is_connection_error()
}

/// HA policy state: current protocol, the host rotation and the blacklist
/// of recently failed peers.
struct Listener {
    url: Arc<UrlParser>,
    current: Arc<Mutex<Protocol>>,
    blacklist: HashMap<String, Instant>,
    last_switch: Option<Instant>,
    /// thread id of the current physical connection, for lock-free abort
    server_thread_id: u32,
    current_host: HostAddress,
    /// current protocol's interrupt flag, settable without its lock
    interrupt_flag: Arc<std::sync::atomic::AtomicBool>,
}

impl Listener {
    fn candidate_hosts(&self, want_master: bool) -> Vec<HostAddress> {
        let mut hosts: Vec<HostAddress> = self
            .url
            .hosts()
            .iter()
            .filter(|h| h.master == want_master || self.url.ha_mode() == HaMode::Aurora)
            .cloned()
            .collect();
        if hosts.is_empty() {
            hosts = self.url.hosts().to_vec();
        }
        if self.url.ha_mode() == HaMode::LoadBalance && hosts.len() > 1 {
            let start = ROUND_ROBIN.fetch_add(1, Ordering::Relaxed) % hosts.len();
            hosts.rotate_left(start);
        }
        // expired blacklist entries rejoin the rotation
        let now = Instant::now();
        let (fresh, blacklisted): (Vec<_>, Vec<_>) = hosts.into_iter().partition(|h| {
            self.blacklist
                .get(&h.to_string())
                .map_or(true, |failed_at| now - *failed_at > BLACKLIST_TIMEOUT)
        });
        fresh.into_iter().chain(blacklisted).collect()
    }

    /// Connect to the first reachable candidate, replacing the current
    /// protocol on success.
    fn connect_to_any(&mut self, want_master: bool) -> Result<()> {
        let mut last_error: Option<SqlError> = None;
        for host in self.candidate_hosts(want_master) {
            let shared = Protocol::new(self.url.clone(), host.clone()).into_shared();
            let outcome = shared.lock().unwrap().connect();
            match outcome {
                Ok(()) => {
                    let guard = shared.lock().unwrap();
                    self.server_thread_id = guard.server_thread_id();
                    self.current_host = guard.host().clone();
                    self.interrupt_flag = guard.interrupt_handle();
                    drop(guard);
                    self.current = shared;
                    self.last_switch = Some(Instant::now());
                    self.blacklist.remove(&host.to_string());
                    return Ok(());
                }
                Err(err) => {
                    debug!("connection to {host} failed: {err}");
                    self.blacklist.insert(host.to_string(), Instant::now());
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            SqlError::connection("no host available for connection")
        }))
    }
}

/// Wraps the protocol of one logical connection. Every facade operation is
/// routed through [`FailoverProxy::dispatch`]: connection-class errors
/// switch the underlying protocol to a peer and replay the operation once
/// when that is safe.
pub struct FailoverProxy {
    listener: Mutex<Listener>,
    logger: ProtocolLogger,
    explicit_closed: AtomicBool,
    /// bumped on every protocol switch; server-prepared handles from an
    /// older generation must re-prepare
    generation: AtomicUsize,
}

impl FailoverProxy {
    pub fn connect(url: Arc<UrlParser>) -> Result<FailoverProxy> {
        common::log_utils::init_tracing();
        let logger = ProtocolLogger::new(url.options());
        let placeholder_host = url.hosts()[0].clone();
        let placeholder = Protocol::new(url.clone(), placeholder_host.clone());
        let interrupt_flag = placeholder.interrupt_handle();
        let mut listener = Listener {
            url,
            current: placeholder.into_shared(),
            blacklist: HashMap::new(),
            last_switch: None,
            server_thread_id: 0,
            current_host: placeholder_host,
            interrupt_flag,
        };
        listener.connect_to_any(true)?;
        Ok(FailoverProxy {
            listener: Mutex::new(listener),
            logger,
            explicit_closed: AtomicBool::new(false),
            generation: AtomicUsize::new(0),
        })
    }

    pub fn protocol(&self) -> Arc<Mutex<Protocol>> {
        self.listener.lock().unwrap().current.clone()
    }

    pub fn logger(&self) -> &ProtocolLogger {
        &self.logger
    }

    /// Identity of the current physical connection; stale prepared handles
    /// compare against this.
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_explicit_closed(&self) -> bool {
        self.explicit_closed.load(Ordering::Acquire)
    }

    /// Route one protocol operation, classify failures and re-dispatch to
    /// a peer when the error is connection-class.
    pub fn dispatch<T>(
        &self,
        operation: &str,
        sql: Option<&str>,
        mut op: impl FnMut(&mut Protocol) -> Result<T>,
    ) -> Result<T> {
        if self.is_explicit_closed() {
            return Err(SqlError::closed_explicitly(operation));
        }
        let protocol = self.protocol();
        let started = Instant::now();

        let (outcome, host, master, in_transaction, was_closed) = {
            let mut guard = protocol.lock().unwrap();
            if !guard.is_connected()
                && !guard.is_explicit_closed()
                && guard.options().auto_reconnect
            {
                if let Err(err) = guard.reconnect() {
                    debug!("autoReconnect attempt failed: {err}");
                }
            }
            let was_closed = !guard.is_connected();
            let in_transaction = guard.in_transaction();
            let host = guard.host().to_string();
            let master = guard.is_master();
            let outcome = op(&mut guard);
            (outcome, host, master, in_transaction, was_closed)
        };
        self.logger
            .observe(operation, sql, started.elapsed(), outcome.as_ref().err());

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        // 1290: the server refuses writes although this protocol believes
        // it sits on the master; force a master reconnect
        let read_only_mismatch = err.error_code() == 1290 && master;
        if self.is_explicit_closed() || (!has_to_handle_failover(&err) && !read_only_mismatch) {
            return Err(err);
        }

        // connection-class failure: blacklist the host, move to a peer
        let decorated = err.with_host_info(&host, master);
        let reconnected = {
            let mut listener = self.listener.lock().unwrap();
            {
                let mut guard = listener.current.lock().unwrap();
                guard.set_host_failed();
                guard.destroy_socket();
            }
            listener.blacklist.insert(host.clone(), Instant::now());
            match listener.connect_to_any(true) {
                Ok(()) => {
                    self.generation.fetch_add(1, Ordering::AcqRel);
                    true
                }
                Err(connect_err) => {
                    warn!("failover reconnection failed: {connect_err}");
                    false
                }
            }
        };

        if reconnected && !in_transaction && !was_closed {
            // safe to replay exactly once
            let protocol = self.protocol();
            let mut guard = protocol.lock().unwrap();
            match op(&mut guard) {
                Ok(value) => {
                    debug!("operation {operation} replayed successfully after failover");
                    return Ok(value);
                }
                Err(replay_err) => {
                    debug!("replay after failover failed: {replay_err}");
                }
            }
        }
        let mut surfaced = decorated;
        if reconnected {
            surfaced.append_message(
                "\nConnection was switched to another host; in-flight operation was not replayed",
            );
        }
        Err(surfaced)
    }

    /// Flag the current protocol as interrupted without taking its lock;
    /// the next blocking wait surfaces a timeout.
    pub fn interrupt(&self) {
        self.listener
            .lock()
            .unwrap()
            .interrupt_flag
            .store(true, Ordering::Release);
    }

    /// Side-channel `KILL QUERY <thread id>`: never touches the owning
    /// protocol lock, so an in-flight exchange can be interrupted.
    pub fn cancel_current_query(&self) -> Result<()> {
        let (url, host, thread_id) = {
            let listener = self.listener.lock().unwrap();
            (
                listener.url.clone(),
                listener.current_host.clone(),
                listener.server_thread_id,
            )
        };
        let mut side = Protocol::new(url, host);
        side.connect()?;
        let outcome = side.internal_query(&format!("KILL QUERY {thread_id}"));
        side.close();
        outcome
    }

    /// Explicit reconnection of the current protocol (autoReconnect path,
    /// Connection.reconnect surface).
    pub fn reconnect(&self) -> Result<()> {
        let protocol = self.protocol();
        let mut guard = protocol.lock().unwrap();
        guard.reconnect()
    }

    pub fn close(&self) {
        self.explicit_closed.store(true, Ordering::Release);
        let protocol = self.protocol();
        let mut guard = protocol.lock().unwrap();
        guard.close_explicit();
    }

    /// Abort does not wait for an in-flight exchange: without the lock the
    /// session is killed through a side channel, then torn down.
    pub fn abort(&self) {
        self.explicit_closed.store(true, Ordering::Release);
        let protocol = self.protocol();
        let try_result = protocol.try_lock();
        match try_result {
            Ok(mut guard) => guard.abort(),
            Err(_) => {
                let (url, host, thread_id) = {
                    let listener = self.listener.lock().unwrap();
                    (
                        listener.url.clone(),
                        listener.current_host.clone(),
                        listener.server_thread_id,
                    )
                };
                let mut side = Protocol::new(url, host);
                let killed = side
                    .connect()
                    .and_then(|_| side.internal_query(&format!("KILL {thread_id}")));
                if let Err(err) = killed {
                    warn!("side-channel abort failed: {err}");
                }
                side.close();
                // the owner notices the dead socket at its next read
                let mut guard = protocol.lock().unwrap();
                guard.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_failover_classification() {
        assert!(has_to_handle_failover(&SqlError::connection("gone")));
        assert!(has_to_handle_failover(&SqlError::from_server(
            1927, "70100", "killed"
        )));
        assert!(!has_to_handle_failover(&SqlError::syntax("bad")));
        assert!(!has_to_handle_failover(&SqlError::from_server(
            1064, "42000", "syntax"
        )));
    }
}
