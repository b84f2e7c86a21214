//! Engine-style TLS connections and the reset interface a credential reload
//! drives them through.

use crate::error::{Error, Result};
use crate::prelude::*;
use rustls::{ClientConnection, Connection, ProtocolVersion, ServerConnection};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Per-connection TLS state machine that a [`ResettableTlsContext`] can force
/// onto new key material.
///
/// This is the interface the reset procedure consumes; the crate's own
/// rustls-backed implementation is [`TlsEngine`], and host applications with
/// a different engine type can implement it themselves and register via
/// [`ResettableTlsContext::track_engine`].
///
/// [`ResettableTlsContext`]: crate::ResettableTlsContext
/// [`ResettableTlsContext::track_engine`]: crate::ResettableTlsContext::track_engine
pub trait ResettableEngine: Send + Sync {
    /// Whether this engine's outbound direction has been closed. Closed
    /// engines are skipped during reset.
    fn is_outbound_done(&self) -> bool;

    /// The negotiated protocol version, once the handshake has chosen one.
    fn negotiated_protocol(&self) -> Option<ProtocolVersion>;

    /// Drops any per-engine resumption state, so a future handshake cannot
    /// resume a session established under retired credentials.
    fn invalidate_session(&self);

    /// Closes the outbound direction, queueing a close_notify alert for the
    /// peer. Used on TLS 1.3 and later, where renegotiation does not exist
    /// and a clean close is the only way to force new key material.
    ///
    /// # Errors
    ///
    /// Engine-level failures; the reset loop logs them and moves on.
    fn close_outbound(&self) -> Result<()>;

    /// Initiates a fresh handshake on the existing connection. Used on TLS
    /// 1.2 and below, where the peer's policy decides between renegotiating
    /// and dropping the connection.
    ///
    /// # Errors
    ///
    /// Engine-level failures; the reset loop logs them and moves on.
    fn begin_handshake(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Client,
    Server,
}

/// rustls-backed TLS engine: a non-blocking per-connection state machine
/// with explicit wrap ([`write_tls`](TlsEngine::write_tls)) and unwrap
/// ([`read_tls`](TlsEngine::read_tls)) steps. No sockets are touched; the
/// caller moves the wire bytes.
pub struct TlsEngine {
    side: Side,
    conn: Mutex<Connection>,
    close_notify_sent: AtomicBool,
}

impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEngine")
            .field("side", &self.side)
            .field("protocol", &self.negotiated_protocol())
            .field(
                "outbound_done",
                &self.close_notify_sent.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl TlsEngine {
    pub(crate) fn from_client(conn: ClientConnection) -> Self {
        Self {
            side: Side::Client,
            conn: Mutex::new(Connection::Client(conn)),
            close_notify_sent: AtomicBool::new(false),
        }
    }

    pub(crate) fn from_server(conn: ServerConnection) -> Self {
        Self {
            side: Side::Server,
            conn: Mutex::new(Connection::Server(conn)),
            close_notify_sent: AtomicBool::new(false),
        }
    }

    /// Wrap step: writes pending TLS records to `wire`.
    ///
    /// # Errors
    ///
    /// I/O errors from `wire`.
    pub fn write_tls(&self, wire: &mut dyn io::Write) -> io::Result<usize> {
        self.lock_conn().write_tls(wire)
    }

    /// Unwrap step: reads TLS records from `wire` and processes them.
    ///
    /// # Errors
    ///
    /// I/O errors from `wire`, or TLS errors from processing the records.
    pub fn read_tls(&self, wire: &mut dyn io::Read) -> Result<usize> {
        let mut conn = self.lock_conn();
        let read = conn.read_tls(wire)?;
        conn.process_new_packets()?;
        Ok(read)
    }

    /// Whether the engine has TLS records ready to be wrapped.
    pub fn wants_write(&self) -> bool {
        self.lock_conn().wants_write()
    }

    /// Whether the engine needs more wire bytes.
    pub fn wants_read(&self) -> bool {
        self.lock_conn().wants_read()
    }

    /// Whether the handshake is still in progress.
    pub fn is_handshaking(&self) -> bool {
        self.lock_conn().is_handshaking()
    }

    /// Runs `f` against the underlying connection, for plaintext I/O and
    /// anything else the wrap/unwrap surface does not cover.
    pub fn with_connection<R>(&self, f: impl FnOnce(&mut Connection) -> R) -> R {
        f(&mut self.lock_conn())
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ResettableEngine for TlsEngine {
    fn is_outbound_done(&self) -> bool {
        self.close_notify_sent.load(Ordering::Acquire)
    }

    fn negotiated_protocol(&self) -> Option<ProtocolVersion> {
        self.lock_conn().protocol_version()
    }

    fn invalidate_session(&self) {
        // rustls keeps resumption state in the config-level session stores,
        // which the context flushes; there is nothing per-engine to drop.
        debug!("invalidate session on {self:?}");
    }

    fn close_outbound(&self) -> Result<()> {
        if self.close_notify_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("close outbound on {self:?}");
        self.lock_conn().send_close_notify();
        Ok(())
    }

    fn begin_handshake(&self) -> Result<()> {
        // rustls has no renegotiation on any protocol version; peers relying
        // on it must reconnect instead.
        Err(Error::RenegotiationUnsupported)
    }
}
