//! Command dispatch (C6/C7/C8): `Active(cmd)` fans out to the handler for
//! the requested SOCKS5 command.
//!
//! Grounded on `original_source/server/session.go` (`handleRequest`), which
//! switches on `req.Cmd` and funnels whatever the handler returns back
//! through a single best-effort failure reply.

pub mod associate;
pub mod bind;
pub mod connect;

use crate::addr::Addr;
use crate::dialer::Dialer;
use crate::error::Result;
use crate::registry::Registry;
use crate::server::Tunables;
use crate::wire::Command;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Run the handler for `command` against `addr`, using `dialer` for
/// outbound connections and `registry` for BIND's shared listeners.
///
/// Returns whatever the handler returns; the caller (the per-session task
/// in `server.rs`) is responsible for turning an `Err` into the session's
/// best-effort failure reply — handlers never write a failure reply
/// themselves, only success replies along the way.
#[allow(clippy::too_many_arguments)]
pub async fn dispatch<S>(
    stream: &mut S,
    command: Command,
    addr: &Addr,
    dialer: Arc<dyn Dialer>,
    registry: &Registry,
    tunables: &Tunables,
    tcp_local: SocketAddr,
    tcp_peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match command {
        Command::Connect => connect::handle(stream, dialer.as_ref(), addr).await,
        Command::Bind => bind::handle(stream, registry, addr).await,
        Command::Associate => {
            associate::handle(stream, dialer, tunables, addr, tcp_local, tcp_peer).await
        }
    }
}
