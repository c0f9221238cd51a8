//! Non-blocking UDP handles (§4.6): datagram send/receive, no write queue
//! since UDP has no byte-stream backpressure to manage, just per-datagram
//! send results.

use crate::address::Address;
use crate::backend::ReadinessMask;
use crate::error::{Error, Result};
use crate::mempool::PoolBuf;
use crate::reactor::EventLoop;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::io;
use tracing::{debug, warn};

slotmap::new_key_type! {
    pub struct UdpId;
}

/// Outcome handed to the receive callback: a datagram and its sender, or an
/// error reading from the socket.
pub enum RecvOutcome {
    Datagram(PoolBuf, Address),
    Error(Error),
}

type AllocCallback = Box<dyn FnMut(&mut EventLoop, usize) -> PoolBuf>;
type RecvCallback = Box<dyn FnMut(&mut EventLoop, UdpId, RecvOutcome)>;
type SendCallback = Box<dyn FnOnce(&mut EventLoop, UdpId, Result<()>)>;

struct SendRequest {
    data: Bytes,
    to: Address,
    cb: Option<SendCallback>,
}

pub(crate) struct UdpState {
    pub(crate) socket: mio::net::UdpSocket,
    pub(crate) token: usize,
    receiving: bool,
    alloc_cb: Option<AllocCallback>,
    recv_cb: Option<RecvCallback>,
    send_queue: VecDeque<SendRequest>,
    closing: bool,
    user_data: Option<Box<dyn std::any::Any + Send>>,
}

fn bind_socket(addr: Address, recv_buf: usize, send_buf: usize) -> io::Result<mio::net::UdpSocket> {
    let domain = if addr.ip.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_recv_buffer_size(recv_buf)?;
    socket.set_send_buffer_size(send_buf)?;
    socket.bind(&addr.to_std().into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(mio::net::UdpSocket::from_std(std_socket))
}

impl EventLoop {
    pub fn udp_bind(&mut self, addr: Address) -> Result<UdpId> {
        let cfg = self.config().udp.clone();
        let socket = bind_socket(addr, cfg.recv_buffer_size, cfg.send_buffer_size)
            .map_err(|e| Error::network(format!("udp bind on {addr} failed: {e}")))?;

        let id = self.udp.insert(UdpState {
            socket,
            token: 0,
            receiving: false,
            alloc_cb: None,
            recv_cb: None,
            send_queue: VecDeque::new(),
            closing: false,
            user_data: None,
        });
        let token = self.register_udp(id, ReadinessMask::READABLE)?;
        self.udp[id].token = token;
        debug!(?id, %addr, "udp socket bound");
        Ok(id)
    }

    /// Restricts the socket to one peer: subsequent `udp_send` targets are
    /// ignored in favor of the connected peer, matching `connect(2)`'s
    /// semantics for datagram sockets.
    pub fn udp_connect(&mut self, id: UdpId, peer: Address) -> Result<()> {
        let state = self.udp.get(id).ok_or_else(|| Error::argument("unknown udp socket"))?;
        state.socket.connect(peer.to_std()).map_err(|e| Error::network(format!("udp connect failed: {e}")))
    }

    pub fn udp_recv_start(
        &mut self,
        id: UdpId,
        alloc_cb: impl FnMut(&mut EventLoop, usize) -> PoolBuf + 'static,
        recv_cb: impl FnMut(&mut EventLoop, UdpId, RecvOutcome) + 'static,
    ) -> Result<()> {
        let state = self.udp.get_mut(id).ok_or_else(|| Error::argument("unknown udp socket"))?;
        state.alloc_cb = Some(Box::new(alloc_cb));
        state.recv_cb = Some(Box::new(recv_cb));
        state.receiving = true;
        Ok(())
    }

    pub fn udp_recv_stop(&mut self, id: UdpId) -> Result<()> {
        let state = self.udp.get_mut(id).ok_or_else(|| Error::argument("unknown udp socket"))?;
        state.receiving = false;
        Ok(())
    }

    pub fn udp_send(
        &mut self,
        id: UdpId,
        data: impl Into<Bytes>,
        to: Address,
        cb: impl FnOnce(&mut EventLoop, UdpId, Result<()>) + 'static,
    ) -> Result<()> {
        let state = self.udp.get_mut(id).ok_or_else(|| Error::argument("unknown udp socket"))?;
        if state.closing {
            return Err(Error::argument("send on closing udp handle"));
        }
        state.send_queue.push_back(SendRequest { data: data.into(), to, cb: Some(Box::new(cb)) });
        self.rearm_udp_interest(id)?;
        self.drain_udp_sends(id);
        Ok(())
    }

    fn rearm_udp_interest(&mut self, id: UdpId) -> Result<()> {
        let state = self.udp.get(id).ok_or_else(|| Error::argument("unknown udp socket"))?;
        let mut mask = if state.receiving { ReadinessMask::READABLE } else { ReadinessMask::default() };
        if !state.send_queue.is_empty() {
            mask = mask.union(ReadinessMask::WRITABLE);
        }
        self.modify_udp(id, mask)
    }

    pub fn udp_close(&mut self, id: UdpId, close_cb: impl FnOnce(&mut EventLoop, UdpId) + 'static) {
        let Some(state) = self.udp.get_mut(id) else { return };
        if state.closing {
            return;
        }
        state.closing = true;
        state.send_queue.clear();
        state.recv_cb = None;
        self.deregister_udp(id);
        self.schedule_close(move |lp| {
            lp.udp.remove(id);
            close_cb(lp, id);
        });
    }

    pub fn udp_local_addr(&self, id: UdpId) -> Result<Address> {
        let state = self.udp.get(id).ok_or_else(|| Error::argument("unknown udp socket"))?;
        state.socket.local_addr().map(Address::from).map_err(|e| Error::network(format!("getsockname failed: {e}")))
    }

    /// Attach opaque application data to a UDP handle (§3 "Handle").
    pub fn udp_set_user_data<T: std::any::Any + Send>(&mut self, id: UdpId, data: T) {
        if let Some(state) = self.udp.get_mut(id) {
            state.user_data = Some(Box::new(data));
        }
    }

    pub fn udp_user_data<T: std::any::Any + Send>(&self, id: UdpId) -> Option<&T> {
        self.udp.get(id)?.user_data.as_ref()?.downcast_ref()
    }

    pub fn udp_user_data_mut<T: std::any::Any + Send>(&mut self, id: UdpId) -> Option<&mut T> {
        self.udp.get_mut(id)?.user_data.as_mut()?.downcast_mut()
    }

    fn drain_udp_sends(&mut self, id: UdpId) {
        loop {
            let Some(state) = self.udp.get_mut(id) else { return };
            let Some(req) = state.send_queue.front() else { break };
            match state.socket.send_to(&req.data, req.to.to_std()) {
                Ok(_) => {
                    let mut done = state.send_queue.pop_front().unwrap();
                    if let Some(cb) = done.cb.take() {
                        cb(self, id, Ok(()));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let mut done = state.send_queue.pop_front().unwrap();
                    let err = Error::network(format!("udp send failed: {e}"));
                    if let Some(cb) = done.cb.take() {
                        cb(self, id, Err(err));
                    }
                }
            }
        }
        let _ = self.rearm_udp_interest(id);
    }

    fn do_udp_recv(&mut self, id: UdpId) {
        const SUGGESTED_SIZE: usize = 64 * 1024;
        loop {
            let Some(state) = self.udp.get_mut(id) else { return };
            if !state.receiving {
                return;
            }
            let Some(mut alloc_cb) = state.alloc_cb.take() else { return };
            let mut buf = alloc_cb(self, SUGGESTED_SIZE);
            let Some(state) = self.udp.get_mut(id) else { return };
            state.alloc_cb = Some(alloc_cb);

            match state.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    buf.truncate(n);
                    self.fire_udp_recv(id, RecvOutcome::Datagram(buf, from.into()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(?id, error = %e, "udp recv failed");
                    self.fire_udp_recv(id, RecvOutcome::Error(Error::network(format!("udp recv failed: {e}"))));
                    return;
                }
            }
        }
    }

    fn fire_udp_recv(&mut self, id: UdpId, outcome: RecvOutcome) {
        let Some(state) = self.udp.get_mut(id) else { return };
        let Some(mut cb) = state.recv_cb.take() else { return };
        cb(self, id, outcome);
        if let Some(state) = self.udp.get_mut(id) {
            if state.recv_cb.is_none() && state.receiving {
                state.recv_cb = Some(cb);
            }
        }
    }
}

pub(crate) fn dispatch_ready(lp: &mut EventLoop, id: UdpId, event: crate::backend::ReadyEvent) {
    if event.writable {
        lp.drain_udp_sends(id);
    }
    if event.readable {
        lp.do_udp_recv(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn send_and_receive_a_datagram() {
        let mut lp = EventLoop::new(Config::default()).unwrap();
        let a = lp.udp_bind(Address::parse("127.0.0.1:0").unwrap()).unwrap();
        let b = lp.udp_bind(Address::parse("127.0.0.1:0").unwrap()).unwrap();
        let b_addr = lp.udp_local_addr(b).unwrap();

        let received = Arc::new(AtomicBool::new(false));
        let received_clone = Arc::clone(&received);
        let pool = lp.pool();
        lp.udp_recv_start(
            b,
            move |_lp, n| pool.alloc_buf(n).expect("pool alloc"),
            move |_lp, _id, outcome| {
                if let RecvOutcome::Datagram(buf, _from) = outcome {
                    assert_eq!(&buf[..], b"ping");
                    received_clone.store(true, Ordering::SeqCst);
                }
            },
        )
        .unwrap();

        lp.udp_send(a, &b"ping"[..], b_addr, |_lp, _id, result| {
            result.expect("send should succeed");
        })
        .unwrap();

        for _ in 0..50 {
            lp.run_turn(crate::reactor::RunMode::Once).unwrap();
            if received.load(Ordering::SeqCst) {
                break;
            }
        }
        assert!(received.load(Ordering::SeqCst));
    }
}
