//! Outbound dialing (C3): the seam between a session and the network it
//! reaches out on, so CONNECT/BIND/ASSOCIATE can be pointed at something
//! other than a raw `tokio::net` socket in tests or in chained deployments.
//!
//! Grounded on `original_source/dialer.go` (`ContextDialer`),
//! `contextdialer.go`, `hostlookuper.go`, and `server/dialerselector.go`.

use crate::addr::Addr;
use crate::error::{Error, ReplyCode, Result};
use crate::wire::AuthMethod;
use async_trait::async_trait;
use tokio::net::{lookup_host, TcpStream, UdpSocket};

/// Establishes outbound TCP connections and UDP sockets on behalf of a
/// session. The default `TokioDialer` just calls straight through to
/// `tokio::net`; a chained or sandboxed deployment can supply its own.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_tcp(&self, addr: &Addr) -> Result<TcpStream>;

    /// Bind a UDP socket on `local` and connect it to `target` (ASSOCIATE's
    /// per-destination sub-socket). A connected socket means every
    /// subsequent `recv`/`send` on it is implicitly scoped to `target`,
    /// mirroring the original's `DialContext(ctx, "udp", addr)`.
    async fn dial_udp(&self, local: std::net::SocketAddr, target: &Addr) -> Result<UdpSocket>;
}

/// Resolves a domain name the way the active `Dialer` would, independent of
/// actually connecting — used by BIND to pick a local interface that can
/// route to a declared host before the listener exists.
#[async_trait]
pub trait HostLookup: Send + Sync {
    async fn lookup(&self, host: &str) -> Result<Vec<std::net::IpAddr>>;
}

/// The stock `Dialer`/`HostLookup`: direct `tokio::net` sockets, DNS via the
/// system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioDialer;

#[async_trait]
impl Dialer for TokioDialer {
    async fn dial_tcp(&self, addr: &Addr) -> Result<TcpStream> {
        let stream = TcpStream::connect(addr.to_string()).await?;
        Ok(stream)
    }

    async fn dial_udp(&self, local: std::net::SocketAddr, target: &Addr) -> Result<UdpSocket> {
        let socket = UdpSocket::bind(local).await?;
        let mut resolved = lookup_host(target.to_string()).await?;
        let target_addr = resolved
            .next()
            .ok_or(Error::Reply(ReplyCode::HostUnreachable))?;
        socket.connect(target_addr).await?;
        Ok(socket)
    }
}

#[async_trait]
impl HostLookup for TokioDialer {
    async fn lookup(&self, host: &str) -> Result<Vec<std::net::IpAddr>> {
        let ips = lookup_host((host, 0))
            .await?
            .map(|sa| sa.ip())
            .collect::<Vec<_>>();
        Ok(ips)
    }
}

/// Lets a deployment pick a different `Dialer` per authenticated identity,
/// network kind, or destination — e.g. routing one user's traffic through a
/// second upstream proxy. Returning `Err` refuses the request outright
/// (surfaced to the client as the error's reply code, `GeneralFailure` by
/// default).
#[async_trait]
pub trait DialerSelector: Send + Sync {
    async fn select_dialer(
        &self,
        auth_method: AuthMethod,
        username: Option<&str>,
        addr: &Addr,
    ) -> Result<std::sync::Arc<dyn Dialer>>;
}

/// Always hands back the same `Dialer`, ignoring identity/destination. The
/// default wiring for a server with no per-user routing policy.
pub struct FixedDialerSelector(pub std::sync::Arc<dyn Dialer>);

#[async_trait]
impl DialerSelector for FixedDialerSelector {
    async fn select_dialer(
        &self,
        _auth_method: AuthMethod,
        _username: Option<&str>,
        _addr: &Addr,
    ) -> Result<std::sync::Arc<dyn Dialer>> {
        Ok(self.0.clone())
    }
}

impl Default for FixedDialerSelector {
    fn default() -> Self {
        FixedDialerSelector(std::sync::Arc::new(TokioDialer))
    }
}

/// Rejects every request with `UnsupportedNetwork`. Useful where a
/// deployment wants CONNECT but not BIND/ASSOCIATE wired to a real dialer at
/// all, rather than relying on the session never calling in.
pub struct RefusingDialer;

#[async_trait]
impl Dialer for RefusingDialer {
    async fn dial_tcp(&self, addr: &Addr) -> Result<TcpStream> {
        Err(Error::UnsupportedNetwork(addr.to_string()))
    }

    async fn dial_udp(&self, _local: std::net::SocketAddr, target: &Addr) -> Result<UdpSocket> {
        Err(Error::UnsupportedNetwork(target.to_string()))
    }
}
