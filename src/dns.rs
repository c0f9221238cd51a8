//! Name resolution (§4.9 transport selection, SPEC_FULL resolved decision
//! #7): `std::net::ToSocketAddrs` blocks the calling thread, so lookups run
//! on a dedicated worker thread and the result is delivered back through
//! `queue_work`, the same path any other cross-thread completion uses.

use crate::address::Address;
use crate::error::{Error, Result};
use crate::reactor::EventLoop;
use std::net::ToSocketAddrs;
use tracing::{debug, warn};

slotmap::new_key_type! {
    pub struct DnsId;
}

type ResolveCallback = Box<dyn FnOnce(&mut EventLoop, DnsId, Result<Vec<Address>>)>;

/// Bookkeeping kept only long enough to invoke the callback once the worker
/// thread reports back; removed from the slotmap the moment it fires.
pub(crate) struct DnsState {
    callback: Option<ResolveCallback>,
}

impl EventLoop {
    /// Resolve `host:port` (or a bare `host` with `default_port`) off the
    /// loop thread. `callback` runs on the loop thread once resolution
    /// completes, with every address the system resolver returned, in the
    /// order it returned them.
    pub fn dns_resolve(
        &mut self,
        host: impl Into<String>,
        default_port: u16,
        callback: impl FnOnce(&mut EventLoop, DnsId, Result<Vec<Address>>) + 'static,
    ) -> Result<DnsId> {
        let host = host.into();
        let id = self.dns.insert(DnsState { callback: Some(Box::new(callback)) });
        let wake = self.wake_handle();

        std::thread::Builder::new()
            .name("squall-dns".into())
            .spawn(move || {
                let result = resolve_blocking(&host, default_port);
                let _ = wake.queue_work(move |lp| {
                    complete_resolve(lp, id, result);
                });
            })
            .map_err(|e| Error::concurrency(format!("failed to spawn dns worker: {e}")))?;

        debug!(?id, "dns resolution started");
        Ok(id)
    }

    pub fn dns_cancel(&mut self, id: DnsId) {
        // The worker thread cannot be interrupted once spawned; dropping the
        // callback here just means its eventual `queue_work` delivery is a
        // no-op (the id is gone from the slotmap by then).
        self.dns.remove(id);
    }
}

fn resolve_blocking(host: &str, default_port: u16) -> Result<Vec<Address>> {
    let target = if host.contains(':') { host.to_string() } else { format!("{host}:{default_port}") };
    let addrs: Vec<Address> = target
        .to_socket_addrs()
        .map_err(|e| Error::network(format!("dns resolution of {host:?} failed: {e}")))?
        .map(Address::from)
        .collect();
    if addrs.is_empty() {
        return Err(Error::network(format!("dns resolution of {host:?} returned no addresses")));
    }
    Ok(addrs)
}

fn complete_resolve(lp: &mut EventLoop, id: DnsId, result: Result<Vec<Address>>) {
    let Some(mut state) = lp.dns.remove(id) else {
        warn!(?id, "dns result delivered after cancellation");
        return;
    };
    if let Some(cb) = state.callback.take() {
        cb(lp, id, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn resolves_localhost() {
        let mut lp = EventLoop::new(Config::default()).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = Arc::clone(&done);
        lp.dns_resolve("127.0.0.1", 80, move |_lp, _id, result| {
            let addrs = result.expect("resolution should succeed");
            assert!(!addrs.is_empty());
            assert_eq!(addrs[0].port, 80);
            done_clone.store(true, Ordering::SeqCst);
        })
        .unwrap();

        for _ in 0..100 {
            lp.run_turn(crate::reactor::RunMode::Once).unwrap();
            if done.load(Ordering::SeqCst) {
                break;
            }
        }
        assert!(done.load(Ordering::SeqCst));
    }
}
