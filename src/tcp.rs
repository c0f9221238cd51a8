//! Non-blocking TCP handles (§4.6): buffered write queue, allocator/read
//! callback pair, graceful two-phase close.
//!
//! Connect and listen go through `socket2` directly (rather than `mio`'s own
//! `TcpStream::connect`/`TcpListener::bind`) so the configurable listen
//! backlog and `SO_REUSEADDR` from [`crate::config::TcpConfig`] are honored
//! before the socket is handed to `mio` for non-blocking readiness polling.

use crate::address::Address;
use crate::backend::ReadinessMask;
use crate::config::TcpConfig;
use crate::error::{Error, Result};
use crate::mempool::PoolBuf;
use crate::reactor::EventLoop;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream as StdTcpStream;
use tracing::{debug, trace, warn};

slotmap::new_key_type! {
    pub struct TcpStreamId;
    pub struct TcpListenerId;
}

/// Outcome handed to the read callback, mirroring §4.6's three cases:
/// data, EOF, or error.
pub enum ReadOutcome {
    Data(PoolBuf),
    Eof,
    Error(Error),
}

type AllocCallback = Box<dyn FnMut(&mut EventLoop, usize) -> PoolBuf>;
type ReadCallback = Box<dyn FnMut(&mut EventLoop, TcpStreamId, ReadOutcome)>;
type ConnectCallback = Box<dyn FnOnce(&mut EventLoop, TcpStreamId, Result<()>)>;
type WriteCallback = Box<dyn FnOnce(&mut EventLoop, TcpStreamId, Result<()>)>;
type AcceptCallback = Box<dyn FnMut(&mut EventLoop, TcpListenerId, Result<TcpStreamId>)>;

struct WriteRequest {
    data: Bytes,
    offset: usize,
    cb: Option<WriteCallback>,
}

pub(crate) struct StreamState {
    pub(crate) socket: mio::net::TcpStream,
    pub(crate) token: usize,
    peer_addr: Option<Address>,

    reading: bool,
    alloc_cb: Option<AllocCallback>,
    read_cb: Option<ReadCallback>,

    write_queue: VecDeque<WriteRequest>,
    write_queue_bytes: usize,
    high_water: usize,

    connecting: Option<ConnectCallback>,
    closing: bool,
    user_data: Option<Box<dyn std::any::Any + Send>>,
}

pub(crate) struct ListenerState {
    pub(crate) socket: mio::net::TcpListener,
    pub(crate) token: usize,
    accept_cb: Option<AcceptCallback>,
    closing: bool,
    user_data: Option<Box<dyn std::any::Any + Send>>,
}

fn new_socket(addr: Address) -> io::Result<Socket> {
    let domain = if addr.ip.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
}

fn bind_listener(addr: Address, backlog: i32, reuse_addr: bool) -> io::Result<mio::net::TcpListener> {
    let socket = new_socket(addr)?;
    socket.set_reuse_address(reuse_addr)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.to_std().into())?;
    socket.listen(backlog)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(mio::net::TcpListener::from_std(std_listener))
}

fn connect_nonblocking(addr: Address) -> io::Result<mio::net::TcpStream> {
    let socket = new_socket(addr)?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.to_std().into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.raw_os_error() == Some(EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    let std_stream: StdTcpStream = socket.into();
    Ok(mio::net::TcpStream::from_std(std_stream))
}

/// Checked by raw errno since `std::io::ErrorKind` has no portable variant
/// for "connect in progress" on a non-blocking socket.
#[cfg(unix)]
const EINPROGRESS: i32 = 115;
#[cfg(not(unix))]
const EINPROGRESS: i32 = i32::MIN;

impl EventLoop {
    /// Bind and listen in one call (§4.6's `create`/`bind`/`listen` trio
    /// collapsed, since socket2's builder already separates creation from
    /// registration cleanly).
    pub fn tcp_listen(
        &mut self,
        addr: Address,
        backlog: i32,
        accept_cb: impl FnMut(&mut EventLoop, TcpListenerId, Result<TcpStreamId>) + 'static,
    ) -> Result<TcpListenerId> {
        let reuse = self.config().tcp.listen_backlog > 0;
        let socket = bind_listener(addr, backlog, reuse).map_err(|e| Error::network(format!("listen on {addr} failed: {e}")))?;

        let id = self.tcp_listeners.insert(ListenerState {
            socket,
            token: 0,
            accept_cb: Some(Box::new(accept_cb)),
            closing: false,
            user_data: None,
        });
        let token = self.register_tcp_listener(id, ReadinessMask::READABLE)?;
        self.tcp_listeners[id].token = token;
        debug!(?id, %addr, "tcp listener bound");
        Ok(id)
    }

    pub fn tcp_listener_close(&mut self, id: TcpListenerId, close_cb: impl FnOnce(&mut EventLoop, TcpListenerId) + 'static) {
        let Some(state) = self.tcp_listeners.get_mut(id) else { return };
        if state.closing {
            return;
        }
        state.closing = true;
        self.deregister_tcp_listener(id);
        self.schedule_close(move |lp| {
            lp.tcp_listeners.remove(id);
            close_cb(lp, id);
        });
    }

    /// Non-blocking connect; `connect_cb` fires once the socket becomes
    /// writable and `SO_ERROR` confirms success or failure (§4.6 Connect).
    pub fn tcp_connect(
        &mut self,
        addr: Address,
        connect_cb: impl FnOnce(&mut EventLoop, TcpStreamId, Result<()>) + 'static,
    ) -> Result<TcpStreamId> {
        let socket = connect_nonblocking(addr).map_err(|e| Error::network(format!("connect to {addr} failed: {e}")))?;
        let cfg = self.config().tcp.clone();
        self.insert_stream(socket, Some(addr), Some(Box::new(connect_cb)), &cfg)
    }

    fn insert_stream(
        &mut self,
        socket: mio::net::TcpStream,
        peer_addr: Option<Address>,
        connecting: Option<ConnectCallback>,
        cfg: &TcpConfig,
    ) -> Result<TcpStreamId> {
        let initial_mask =
            if connecting.is_some() { ReadinessMask::WRITABLE } else { ReadinessMask::READABLE };
        let id = self.tcp_streams.insert(StreamState {
            socket,
            token: 0,
            peer_addr,
            reading: false,
            alloc_cb: None,
            read_cb: None,
            write_queue: VecDeque::new(),
            write_queue_bytes: 0,
            high_water: cfg.write_queue_high_water,
            connecting,
            closing: false,
            user_data: None,
        });
        let token = self.register_tcp_stream(id, initial_mask)?;
        self.tcp_streams[id].token = token;
        Ok(id)
    }

    pub fn tcp_read_start(
        &mut self,
        id: TcpStreamId,
        alloc_cb: impl FnMut(&mut EventLoop, usize) -> PoolBuf + 'static,
        read_cb: impl FnMut(&mut EventLoop, TcpStreamId, ReadOutcome) + 'static,
    ) -> Result<()> {
        let state = self.tcp_streams.get_mut(id).ok_or_else(|| Error::argument("unknown tcp stream"))?;
        state.alloc_cb = Some(Box::new(alloc_cb));
        state.read_cb = Some(Box::new(read_cb));
        state.reading = true;
        self.rearm_interest(id)
    }

    pub fn tcp_read_stop(&mut self, id: TcpStreamId) -> Result<()> {
        let state = self.tcp_streams.get_mut(id).ok_or_else(|| Error::argument("unknown tcp stream"))?;
        state.reading = false;
        self.rearm_interest(id)
    }

    fn rearm_interest(&mut self, id: TcpStreamId) -> Result<()> {
        let state = self.tcp_streams.get(id).ok_or_else(|| Error::argument("unknown tcp stream"))?;
        let mut mask = ReadinessMask::default();
        if state.reading || state.connecting.is_some() {
            mask = mask.union(ReadinessMask::READABLE);
        }
        if !state.write_queue.is_empty() || state.connecting.is_some() {
            mask = mask.union(ReadinessMask::WRITABLE);
        }
        self.modify_tcp_stream(id, mask)
    }

    /// Enqueue a write; copied into the request's own `Bytes` so the
    /// caller's buffer need not outlive the call (§4.6 write queue).
    pub fn tcp_write(
        &mut self,
        id: TcpStreamId,
        data: impl Into<Bytes>,
        cb: impl FnOnce(&mut EventLoop, TcpStreamId, Result<()>) + 'static,
    ) -> Result<()> {
        let data = data.into();
        let state = self.tcp_streams.get_mut(id).ok_or_else(|| Error::argument("unknown tcp stream"))?;
        if state.closing {
            return Err(Error::argument("write on closing tcp handle"));
        }
        state.write_queue_bytes += data.len();
        if state.write_queue_bytes > state.high_water {
            warn!(?id, bytes = state.write_queue_bytes, "tcp write queue above high water mark");
        }
        state.write_queue.push_back(WriteRequest { data, offset: 0, cb: Some(Box::new(cb)) });
        self.rearm_interest(id)?;
        self.drain_writes(id);
        Ok(())
    }

    /// Two-phase close (§4.6 Close semantics): drops pending writes without
    /// invoking their callbacks (they were never going to complete),
    /// deregisters the socket immediately, defers the slotmap release and
    /// `close_cb` to the next turn's close phase.
    pub fn tcp_close(&mut self, id: TcpStreamId, close_cb: impl FnOnce(&mut EventLoop, TcpStreamId) + 'static) {
        let Some(state) = self.tcp_streams.get_mut(id) else { return };
        if state.closing {
            return;
        }
        state.closing = true;
        state.write_queue.clear();
        state.read_cb = None;
        state.connecting = None;
        self.deregister_tcp_stream(id);
        self.schedule_close(move |lp| {
            lp.tcp_streams.remove(id);
            close_cb(lp, id);
        });
    }

    pub fn tcp_peer_addr(&self, id: TcpStreamId) -> Result<Address> {
        let state = self.tcp_streams.get(id).ok_or_else(|| Error::argument("unknown tcp stream"))?;
        state.socket.peer_addr().map(Address::from).map_err(|e| Error::network(format!("getpeername failed: {e}")))
    }

    pub fn tcp_local_addr(&self, id: TcpStreamId) -> Result<Address> {
        let state = self.tcp_streams.get(id).ok_or_else(|| Error::argument("unknown tcp stream"))?;
        state.socket.local_addr().map(Address::from).map_err(|e| Error::network(format!("getsockname failed: {e}")))
    }

    pub fn tcp_listener_local_addr(&self, id: TcpListenerId) -> Result<Address> {
        let state = self.tcp_listeners.get(id).ok_or_else(|| Error::argument("unknown tcp listener"))?;
        state.socket.local_addr().map(Address::from).map_err(|e| Error::network(format!("getsockname failed: {e}")))
    }

    pub fn tcp_set_nodelay(&mut self, id: TcpStreamId, nodelay: bool) -> Result<()> {
        let state = self.tcp_streams.get(id).ok_or_else(|| Error::argument("unknown tcp stream"))?;
        state.socket.set_nodelay(nodelay).map_err(|e| Error::network(format!("setsockopt failed: {e}")))
    }

    /// Attach opaque application data to a stream handle (§3 "Handle").
    /// Safe to call before the first byte flows, e.g. right after
    /// `tcp_connect`'s callback fires or immediately on an accepted stream.
    pub fn tcp_set_user_data<T: std::any::Any + Send>(&mut self, id: TcpStreamId, data: T) {
        if let Some(state) = self.tcp_streams.get_mut(id) {
            state.user_data = Some(Box::new(data));
        }
    }

    pub fn tcp_user_data<T: std::any::Any + Send>(&self, id: TcpStreamId) -> Option<&T> {
        self.tcp_streams.get(id)?.user_data.as_ref()?.downcast_ref()
    }

    pub fn tcp_user_data_mut<T: std::any::Any + Send>(&mut self, id: TcpStreamId) -> Option<&mut T> {
        self.tcp_streams.get_mut(id)?.user_data.as_mut()?.downcast_mut()
    }

    pub fn tcp_listener_set_user_data<T: std::any::Any + Send>(&mut self, id: TcpListenerId, data: T) {
        if let Some(state) = self.tcp_listeners.get_mut(id) {
            state.user_data = Some(Box::new(data));
        }
    }

    pub fn tcp_listener_user_data<T: std::any::Any + Send>(&self, id: TcpListenerId) -> Option<&T> {
        self.tcp_listeners.get(id)?.user_data.as_ref()?.downcast_ref()
    }

    fn drain_writes(&mut self, id: TcpStreamId) {
        loop {
            let Some(state) = self.tcp_streams.get_mut(id) else { return };
            let Some(req) = state.write_queue.front_mut() else { break };
            let result = state.socket.write(&req.data[req.offset..]);
            match result {
                Ok(0) => break,
                Ok(n) => {
                    req.offset += n;
                    state.write_queue_bytes = state.write_queue_bytes.saturating_sub(n);
                    if req.offset == req.data.len() {
                        let mut done = state.write_queue.pop_front().unwrap();
                        if let Some(cb) = done.cb.take() {
                            cb(self, id, Ok(()));
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let message = format!("tcp write failed: {e}");
                    let mut queue = std::mem::take(&mut state.write_queue);
                    state.write_queue_bytes = 0;
                    for pending in queue.drain(..) {
                        if let Some(cb) = pending.cb {
                            cb(self, id, Err(Error::network(message.clone())));
                        }
                    }
                    break;
                }
            }
        }
        let _ = self.rearm_interest(id);
    }

    fn do_read(&mut self, id: TcpStreamId) {
        const SUGGESTED_SIZE: usize = 64 * 1024;
        loop {
            let Some(state) = self.tcp_streams.get_mut(id) else { return };
            if !state.reading {
                return;
            }
            let Some(mut alloc_cb) = state.alloc_cb.take() else { return };
            let mut buf = alloc_cb(self, SUGGESTED_SIZE);
            let Some(state) = self.tcp_streams.get_mut(id) else { return };
            state.alloc_cb = Some(alloc_cb);

            match state.socket.read(&mut buf) {
                Ok(0) => {
                    trace!(?id, "tcp eof");
                    self.fire_read(id, ReadOutcome::Eof);
                    return;
                }
                Ok(n) => {
                    let saturated = n == buf.capacity();
                    buf.truncate(n);
                    self.fire_read(id, ReadOutcome::Data(buf));
                    if !saturated {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    let err = Error::network(format!("tcp read failed: {e}"));
                    self.fire_read(id, ReadOutcome::Error(err));
                    return;
                }
            }
        }
    }

    fn fire_read(&mut self, id: TcpStreamId, outcome: ReadOutcome) {
        let Some(state) = self.tcp_streams.get_mut(id) else { return };
        let Some(mut cb) = state.read_cb.take() else { return };
        cb(self, id, outcome);
        if let Some(state) = self.tcp_streams.get_mut(id) {
            if state.read_cb.is_none() && state.reading {
                state.read_cb = Some(cb);
            }
        }
    }

    fn complete_connect(&mut self, id: TcpStreamId) {
        let Some(state) = self.tcp_streams.get_mut(id) else { return };
        let Some(cb) = state.connecting.take() else { return };
        let result = SockRef::from(&state.socket)
            .take_error()
            .map_err(|e| Error::network(format!("connect failed: {e}")))
            .and_then(|opt| match opt {
                None => Ok(()),
                Some(e) => Err(Error::network(format!("connect failed: {e}"))),
            });
        let _ = self.rearm_interest(id);
        cb(self, id, result);
    }
}

pub(crate) fn dispatch_stream_ready(lp: &mut EventLoop, id: TcpStreamId, event: crate::backend::ReadyEvent) {
    let Some(state) = lp.tcp_streams.get(id) else { return };
    if state.connecting.is_some() {
        if event.writable || event.error {
            lp.complete_connect(id);
        }
        return;
    }
    if event.writable {
        lp.drain_writes(id);
    }
    if event.readable || event.hangup {
        lp.do_read(id);
    }
}

pub(crate) fn dispatch_listener_ready(lp: &mut EventLoop, id: TcpListenerId, _event: crate::backend::ReadyEvent) {
    loop {
        let Some(state) = lp.tcp_listeners.get_mut(id) else { return };
        match state.socket.accept() {
            Ok((socket, peer)) => {
                let cfg = lp.config().tcp.clone();
                match lp.insert_stream(socket, Some(peer.into()), None, &cfg) {
                    Ok(stream_id) => {
                        let Some(state) = lp.tcp_listeners.get_mut(id) else { return };
                        if let Some(cb) = state.accept_cb.as_mut() {
                            cb(lp, id, Ok(stream_id));
                        }
                    }
                    Err(e) => {
                        let Some(state) = lp.tcp_listeners.get_mut(id) else { return };
                        if let Some(cb) = state.accept_cb.as_mut() {
                            cb(lp, id, Err(e));
                        }
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                let Some(state) = lp.tcp_listeners.get_mut(id) else { return };
                if let Some(cb) = state.accept_cb.as_mut() {
                    cb(lp, id, Err(Error::network(format!("accept failed: {e}"))));
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn listen_then_connect_round_trips_a_write() {
        let mut lp = EventLoop::new(Config::default()).unwrap();
        let addr = Address::parse("127.0.0.1:0").unwrap();

        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_clone = Arc::clone(&accepted);
        let listener_id = lp
            .tcp_listen(addr, 128, move |lp, _listener, result| {
                let stream_id = result.expect("accept should succeed");
                accepted_clone.fetch_add(1, Ordering::SeqCst);
                let pool = lp.pool();
                lp.tcp_read_start(
                    stream_id,
                    move |_lp, n| pool.alloc_buf(n).expect("pool alloc"),
                    |lp, id, outcome| {
                        if let ReadOutcome::Data(buf) = outcome {
                            assert_eq!(&buf[..], b"hello");
                            lp.tcp_close(id, |_, _| {});
                        }
                    },
                )
                .unwrap();
            })
            .unwrap();

        let bound_addr = lp.tcp_listener_local_addr(listener_id).unwrap();

        let connected = Arc::new(AtomicBool::new(false));
        let connected_clone = Arc::clone(&connected);
        lp.tcp_connect(bound_addr, move |lp, id, result| {
            result.expect("connect should succeed");
            connected_clone.store(true, Ordering::SeqCst);
            lp.tcp_write(id, &b"hello"[..], |lp, id, result| {
                result.expect("write should succeed");
                lp.tcp_close(id, |_, _| {});
            })
            .unwrap();
        })
        .unwrap();

        for _ in 0..200 {
            lp.run_turn(crate::reactor::RunMode::Once).unwrap();
            if accepted.load(Ordering::SeqCst) > 0 && connected.load(Ordering::SeqCst) {
                break;
            }
        }

        assert!(connected.load(Ordering::SeqCst));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }
}
