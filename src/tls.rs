//! TLS sessions layered over a TCP stream (§4.7): rustls's internal
//! plaintext/ciphertext buffers stand in for the spec's two memory BIOs
//! (SPEC_FULL resolved decision #5) — `read_tls`/`write_tls` push and pull
//! ciphertext, `process_new_packets` drives the state machine, and
//! `reader()`/`writer()` expose the plaintext side.

use crate::config::TlsConfig;
use crate::error::{Error, Result};
use crate::reactor::EventLoop;
use crate::ssl;
use crate::tcp::{ReadOutcome, TcpStreamId};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::warn;

slotmap::new_key_type! {
    pub struct TlsId;
}

pub enum TlsReadOutcome {
    Data(crate::mempool::PoolBuf),
    Eof,
    Error(Error),
}

enum Role {
    Client(rustls::ClientConnection),
    Server(rustls::ServerConnection),
}

impl Role {
    fn is_handshaking(&self) -> bool {
        match self {
            Role::Client(c) => c.is_handshaking(),
            Role::Server(c) => c.is_handshaking(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Role::Client(c) => c.wants_write(),
            Role::Server(c) => c.wants_write(),
        }
    }

    fn read_tls(&mut self, rd: &mut dyn std::io::Read) -> std::io::Result<usize> {
        match self {
            Role::Client(c) => c.read_tls(rd),
            Role::Server(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn std::io::Write) -> std::io::Result<usize> {
        match self {
            Role::Client(c) => c.write_tls(wr),
            Role::Server(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> std::result::Result<(), rustls::Error> {
        match self {
            Role::Client(c) => c.process_new_packets().map(|_| ()),
            Role::Server(c) => c.process_new_packets().map(|_| ()),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Role::Client(c) => c.reader(),
            Role::Server(c) => c.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Role::Client(c) => c.writer(),
            Role::Server(c) => c.writer(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Role::Client(c) => c.send_close_notify(),
            Role::Server(c) => c.send_close_notify(),
        }
    }
}

type TlsReadCallback = Box<dyn FnMut(&mut EventLoop, TlsId, TlsReadOutcome)>;
type TlsConnectCallback = Box<dyn FnOnce(&mut EventLoop, TlsId, Result<()>)>;

pub(crate) struct TlsState {
    tcp: TcpStreamId,
    role: Role,
    read_cb: Option<TlsReadCallback>,
    connect_cb: Option<TlsConnectCallback>,
    handshake_reported: bool,
    closing: bool,
    user_data: Option<Box<dyn std::any::Any + Send>>,
}

impl EventLoop {
    /// Start a client handshake over an already-connected TCP stream.
    /// `connect_cb` fires once the handshake completes (or fails).
    pub fn tls_connect(
        &mut self,
        tcp: TcpStreamId,
        server_name: &str,
        connect_cb: impl FnOnce(&mut EventLoop, TlsId, Result<()>) + 'static,
    ) -> Result<TlsId> {
        let cfg = self.config().tls.clone().unwrap_or_default();
        self.tls_connect_with_config(tcp, server_name, &cfg, connect_cb)
    }

    /// Like [`EventLoop::tls_connect`], but with an explicit [`TlsConfig`]
    /// rather than the reactor-wide default — callers (MQTT over TLS, say)
    /// that need a connection-specific CA bundle or ALPN set use this.
    pub fn tls_connect_with_config(
        &mut self,
        tcp: TcpStreamId,
        server_name: &str,
        cfg: &TlsConfig,
        connect_cb: impl FnOnce(&mut EventLoop, TlsId, Result<()>) + 'static,
    ) -> Result<TlsId> {
        let client_cfg = ssl::build_client_config(cfg)?;
        let name = rustls::ServerName::try_from(server_name)
            .map_err(|e| Error::argument(format!("invalid tls server name {server_name:?}: {e}")))?;
        let conn = rustls::ClientConnection::new(client_cfg, name)?;
        let id = self.tls.insert(TlsState {
            tcp,
            role: Role::Client(conn),
            read_cb: None,
            connect_cb: Some(Box::new(connect_cb)),
            handshake_reported: false,
            closing: false,
            user_data: None,
        });
        self.wire_tcp_to_tls(tcp, id)?;
        self.flush_tls(id);
        Ok(id)
    }

    /// Accept a server-side handshake over an already-accepted TCP stream.
    pub fn tls_accept(
        &mut self,
        tcp: TcpStreamId,
        cfg: &TlsConfig,
        connect_cb: impl FnOnce(&mut EventLoop, TlsId, Result<()>) + 'static,
    ) -> Result<TlsId> {
        let server_cfg = ssl::build_server_config(cfg)?;
        let conn = rustls::ServerConnection::new(server_cfg)?;
        let id = self.tls.insert(TlsState {
            tcp,
            role: Role::Server(conn),
            read_cb: None,
            connect_cb: Some(Box::new(connect_cb)),
            handshake_reported: false,
            closing: false,
            user_data: None,
        });
        self.wire_tcp_to_tls(tcp, id)?;
        Ok(id)
    }

    fn wire_tcp_to_tls(&mut self, tcp: TcpStreamId, id: TlsId) -> Result<()> {
        let pool = self.pool();
        self.tcp_read_start(
            tcp,
            move |_lp, n| pool.alloc_buf(n).expect("pool alloc for tls ciphertext"),
            move |lp, _tcp_id, outcome| match outcome {
                ReadOutcome::Data(buf) => lp.feed_tls(id, &buf),
                ReadOutcome::Eof => lp.tls_peer_closed(id),
                ReadOutcome::Error(e) => lp.abort_tls(id, e),
            },
        )
    }

    pub fn tls_read_start(
        &mut self,
        id: TlsId,
        read_cb: impl FnMut(&mut EventLoop, TlsId, TlsReadOutcome) + 'static,
    ) -> Result<()> {
        let state = self.tls.get_mut(id).ok_or_else(|| Error::argument("unknown tls session"))?;
        state.read_cb = Some(Box::new(read_cb));
        self.deliver_plaintext(id);
        Ok(())
    }

    /// Queue plaintext; encrypted and handed to the underlying TCP write
    /// queue immediately. `cb` fires once the ciphertext has been accepted
    /// onto the TCP write queue, not once it's acknowledged on the wire —
    /// TLS has no such acknowledgment to offer.
    pub fn tls_write(
        &mut self,
        id: TlsId,
        data: impl AsRef<[u8]>,
        cb: impl FnOnce(&mut EventLoop, TlsId, Result<()>) + 'static,
    ) -> Result<()> {
        let state = self.tls.get_mut(id).ok_or_else(|| Error::argument("unknown tls session"))?;
        if state.closing {
            return Err(Error::argument("write on closing tls handle"));
        }
        state
            .role
            .writer()
            .write_all(data.as_ref())
            .map_err(|e| Error::other(format!("tls plaintext write failed: {e}")))?;
        self.flush_tls(id);
        cb(self, id, Ok(()));
        Ok(())
    }

    /// Attach opaque application data to a session handle (§3 "Handle").
    /// For a server-side session from `tls_accept`, this can be called
    /// before `tls_read_start`/the handshake completes (spec's "attach
    /// user data before the first byte flows").
    pub fn tls_set_user_data<T: std::any::Any + Send>(&mut self, id: TlsId, data: T) {
        if let Some(state) = self.tls.get_mut(id) {
            state.user_data = Some(Box::new(data));
        }
    }

    pub fn tls_user_data<T: std::any::Any + Send>(&self, id: TlsId) -> Option<&T> {
        self.tls.get(id)?.user_data.as_ref()?.downcast_ref()
    }

    pub fn tls_user_data_mut<T: std::any::Any + Send>(&mut self, id: TlsId) -> Option<&mut T> {
        self.tls.get_mut(id)?.user_data.as_mut()?.downcast_mut()
    }

    pub fn tls_close(&mut self, id: TlsId, close_cb: impl FnOnce(&mut EventLoop, TlsId) + 'static) {
        let Some(state) = self.tls.get_mut(id) else { return };
        if state.closing {
            return;
        }
        state.closing = true;
        state.role.send_close_notify();
        let tcp = state.tcp;
        self.flush_tls(id);
        self.tls.remove(id);
        self.tcp_close(tcp, move |lp, _| close_cb(lp, id));
    }

    fn feed_tls(&mut self, id: TlsId, mut data: &[u8]) {
        let Some(state) = self.tls.get_mut(id) else { return };
        if let Err(e) = state.role.read_tls(&mut data) {
            self.abort_tls(id, Error::other(format!("tls record read failed: {e}")));
            return;
        }
        self.process_tls(id);
    }

    fn process_tls(&mut self, id: TlsId) {
        let Some(state) = self.tls.get_mut(id) else { return };
        if let Err(e) = state.role.process_new_packets() {
            self.abort_tls(id, Error::from(e));
            return;
        }
        self.check_handshake(id);
        self.deliver_plaintext(id);
        self.flush_tls(id);
    }

    fn check_handshake(&mut self, id: TlsId) {
        let Some(state) = self.tls.get_mut(id) else { return };
        if state.handshake_reported || state.role.is_handshaking() {
            return;
        }
        state.handshake_reported = true;
        let Some(cb) = state.connect_cb.take() else { return };
        cb(self, id, Ok(()));
    }

    fn deliver_plaintext(&mut self, id: TlsId) {
        loop {
            let pool = self.pool();
            let Some(state) = self.tls.get_mut(id) else { return };
            if state.read_cb.is_none() {
                return;
            }
            let mut buf = match pool.alloc_buf(16 * 1024) {
                Some(buf) => buf,
                None => return,
            };
            match state.role.reader().read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    buf.truncate(n);
                    self.fire_tls_read(id, TlsReadOutcome::Data(buf));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    self.abort_tls(id, Error::other(format!("tls plaintext read failed: {e}")));
                    return;
                }
            }
        }
    }

    fn fire_tls_read(&mut self, id: TlsId, outcome: TlsReadOutcome) {
        let Some(state) = self.tls.get_mut(id) else { return };
        let Some(mut cb) = state.read_cb.take() else { return };
        cb(self, id, outcome);
        if let Some(state) = self.tls.get_mut(id) {
            if state.read_cb.is_none() {
                state.read_cb = Some(cb);
            }
        }
    }

    fn flush_tls(&mut self, id: TlsId) {
        let Some(state) = self.tls.get_mut(id) else { return };
        let mut out = Vec::new();
        let mut io_err = None;
        while state.role.wants_write() {
            if let Err(e) = state.role.write_tls(&mut out) {
                io_err = Some(format!("tls ciphertext write failed: {e}"));
                break;
            }
        }
        let tcp = state.tcp;
        if let Some(message) = io_err {
            self.abort_tls(id, Error::other(message));
            return;
        }
        if !out.is_empty() {
            let _ = self.tcp_write(tcp, out, |_, _, result| {
                if let Err(e) = result {
                    warn!(error = %e, "tls ciphertext write to tcp layer failed");
                }
            });
        }
    }

    fn tls_peer_closed(&mut self, id: TlsId) {
        self.fire_tls_read(id, TlsReadOutcome::Eof);
    }

    fn abort_tls(&mut self, id: TlsId, err: Error) {
        let Some(state) = self.tls.get_mut(id) else { return };
        state.closing = true;
        let tcp = state.tcp;
        let connect_cb = state.connect_cb.take();
        if let Some(cb) = connect_cb {
            cb(self, id, Err(Error::other(err.to_string())));
            return;
        }
        self.fire_tls_read(id, TlsReadOutcome::Error(err));
        self.tls.remove(id);
        self.tcp_close(tcp, |_, _| {});
    }
}
