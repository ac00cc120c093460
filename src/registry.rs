//! Shared listener registry (C8): BIND requests for the same fixed
//! `host:port` share one underlying `TcpListener`, ref-counted, torn down
//! only after a grace period with no remaining holders.
//!
//! Grounded on `original_source/server/listener.go` (`listener`,
//! `listenerproxy`, the ref-counted two-closer handle) and
//! `server/server.go` (`getListener`, `listenKey`).

use crate::addr::Addr;
use crate::error::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Entry {
    listener: TcpListener,
    refs: AtomicI32,
    /// Millis (since the registry's epoch) at which this entry's last
    /// holder let go; `i64::MAX` while still held.
    died_at: AtomicI64,
}

struct Inner {
    epoch: Instant,
    grace: Duration,
    listeners: Mutex<HashMap<String, Arc<Entry>>>,
}

/// The BIND listener registry for one server. Cheap to clone (an `Arc`
/// underneath); every session handling BIND goes through
/// [`Registry::get_or_create`].
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new(grace: Duration) -> Registry {
        Registry {
            inner: Arc::new(Inner {
                epoch: Instant::now(),
                grace,
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn now_millis(&self) -> i64 {
        self.inner.epoch.elapsed().as_millis() as i64
    }

    /// Acquire a listener for `addr`, sharing an existing one if the key
    /// matches and creating a fresh bind otherwise.
    ///
    /// An ephemeral (`port == 0`) request has no key to share *before* it is
    /// bound, but the concrete port it resolves to is exactly what a
    /// pipelined re-BIND (`binding.rs`) asks for next — so it is registered
    /// under `listen_key` of the *bound* address, the same as a fixed-port
    /// request, letting that re-BIND share the acceptor instead of racing it
    /// for the port.
    pub async fn get_or_create(&self, addr: &Addr) -> Result<ListenerHandle> {
        let mut listeners = self.inner.listeners.lock().await;

        if let Some(key) = listen_key(addr) {
            if let Some(entry) = listeners.get(&key) {
                entry.refs.fetch_add(1, Ordering::SeqCst);
                entry.died_at.store(i64::MAX, Ordering::SeqCst);
                return Ok(ListenerHandle::new(Some(key), entry.clone(), self.clone()));
            }
            let listener = TcpListener::bind(addr.to_string()).await?;
            let entry = Arc::new(Entry {
                listener,
                refs: AtomicI32::new(1),
                died_at: AtomicI64::new(i64::MAX),
            });
            listeners.insert(key.clone(), entry.clone());
            return Ok(ListenerHandle::new(Some(key), entry, self.clone()));
        }

        let listener = TcpListener::bind(addr.to_string()).await?;
        let bound_key = listen_key(&Addr::from_socket_addr(listener.local_addr()?));
        let entry = Arc::new(Entry {
            listener,
            refs: AtomicI32::new(1),
            died_at: AtomicI64::new(i64::MAX),
        });
        if let Some(key) = bound_key {
            listeners.insert(key.clone(), entry.clone());
            Ok(ListenerHandle::new(Some(key), entry, self.clone()))
        } else {
            Ok(ListenerHandle::new(None, entry, self.clone()))
        }
    }

    /// Drop any entry with zero holders whose grace period has elapsed.
    /// Intended to run on a periodic tick from the server's reaper task.
    pub async fn reap_expired(&self) {
        let now = self.now_millis();
        let grace = self.inner.grace.as_millis() as i64;
        let mut listeners = self.inner.listeners.lock().await;
        listeners.retain(|_, entry| {
            if entry.refs.load(Ordering::SeqCst) > 0 {
                return true;
            }
            let died_at = entry.died_at.load(Ordering::SeqCst);
            died_at == i64::MAX || now < died_at + grace
        });
    }

    /// Drop every pooled listener regardless of ref-count, for server
    /// shutdown (§4.9: "close all pooled BIND listeners and drop the
    /// registry").
    pub async fn close_all(&self) {
        self.inner.listeners.lock().await.clear();
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.listeners.lock().await.len()
    }
}

/// A ref-counted handle onto a registry entry. Closing is idempotent:
/// dropping the handle after an explicit `close()` call does nothing extra.
pub struct ListenerHandle {
    key: Option<String>,
    entry: Arc<Entry>,
    registry: Registry,
    closed: AtomicBool,
}

impl ListenerHandle {
    fn new(key: Option<String>, entry: Arc<Entry>, registry: Registry) -> ListenerHandle {
        ListenerHandle {
            key,
            entry,
            registry,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.entry.listener.accept().await?;
        Ok((stream, peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.entry.listener.local_addr()?)
    }

    /// Release this handle's hold on the listener. Safe to call more than
    /// once (only the first call has any effect) and safe to skip (`Drop`
    /// calls it too).
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let remaining = self.entry.refs.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining <= 0 {
            self.entry.died_at.store(self.registry.now_millis(), Ordering::SeqCst);
        }
        let _ = &self.key;
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Derive the sharing key for a BIND listener: ephemeral ports (`0`) are
/// never shared (each BIND with port 0 gets its own fresh listener); a fixed
/// port on a wildcard host collapses to a host-independent key so any BIND
/// on that port shares the listener regardless of which wildcard form asked
/// for it.
fn listen_key(addr: &Addr) -> Option<String> {
    if addr.port == 0 {
        return None;
    }
    let host = if addr.is_any() {
        String::new()
    } else {
        addr.host.clone()
    };
    Some(format!("{}:{}", host, addr.port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Addr;

    #[test]
    fn listen_key_blanks_wildcard_host() {
        let a = Addr::from_host_port("0.0.0.0", 9000);
        let b = Addr::from_host_port("::", 9000);
        assert_eq!(listen_key(&a), listen_key(&b));
    }

    #[test]
    fn listen_key_is_none_for_ephemeral_port() {
        let a = Addr::from_host_port("0.0.0.0", 0);
        assert!(listen_key(&a).is_none());
    }

    #[test]
    fn listen_key_distinguishes_fixed_hosts() {
        let a = Addr::from_host_port("127.0.0.1", 9000);
        let b = Addr::from_host_port("127.0.0.2", 9000);
        assert_ne!(listen_key(&a), listen_key(&b));
    }

    #[tokio::test]
    async fn ephemeral_binds_are_never_shared() {
        let registry = Registry::new(Duration::from_millis(50));
        let a = registry
            .get_or_create(&Addr::from_host_port("127.0.0.1", 0))
            .await
            .unwrap();
        let b = registry
            .get_or_create(&Addr::from_host_port("127.0.0.1", 0))
            .await
            .unwrap();
        assert_ne!(a.local_addr().unwrap(), b.local_addr().unwrap());
        // each resolves to its own concrete port, so both get their own entry
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn fixed_port_binds_are_shared_and_survive_one_close() {
        let registry = Registry::new(Duration::from_secs(60));
        let probe = registry
            .get_or_create(&Addr::from_host_port("127.0.0.1", 0))
            .await
            .unwrap();
        let port = probe.local_addr().unwrap().port();
        probe.close();

        let addr = Addr::from_host_port("127.0.0.1", port);
        let first = registry.get_or_create(&addr).await.unwrap();
        let second = registry.get_or_create(&addr).await.unwrap();
        assert_eq!(first.local_addr().unwrap(), second.local_addr().unwrap());

        first.close();
        // one holder remains: entry must still be registered
        assert_eq!(registry.len().await, 1);
        second.close();
    }

    #[tokio::test]
    async fn reaper_drops_entries_after_grace_expires() {
        let registry = Registry::new(Duration::from_millis(0));
        let probe = registry
            .get_or_create(&Addr::from_host_port("127.0.0.1", 0))
            .await
            .unwrap();
        let port = probe.local_addr().unwrap().port();
        probe.close();

        let addr = Addr::from_host_port("127.0.0.1", port);
        let handle = registry.get_or_create(&addr).await.unwrap();
        handle.close();
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.reap_expired().await;
        assert_eq!(registry.len().await, 0);
    }

    #[test]
    fn close_is_idempotent() {
        let entry = Arc::new(Entry {
            refs: AtomicI32::new(1),
            died_at: AtomicI64::new(i64::MAX),
            listener: {
                // constructed only to exercise `close()`'s ref bookkeeping;
                // never accepted on.
                let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                std_listener.set_nonblocking(true).unwrap();
                TcpListener::from_std(std_listener).unwrap()
            },
        });
        let registry = Registry::new(Duration::from_secs(1));
        let handle = ListenerHandle::new(None, entry.clone(), registry);
        handle.close();
        handle.close();
        assert_eq!(entry.refs.load(Ordering::SeqCst), 0);
    }
}
