//! BIND handler (C8, server side): acquire a (possibly shared) listener,
//! report it, accept exactly one inbound connection, report its peer, then
//! relay until either side closes.
//!
//! Grounded on `original_source/server/handlebind.go` (`handleBIND`,
//! `sendReply`) and the listener acquisition contract in `src/registry.rs`.

use crate::addr::Addr;
use crate::error::Result;
use crate::registry::Registry;
use crate::wire::Response;
use tokio::io::{AsyncRead, AsyncWrite};

pub async fn handle<S>(stream: &mut S, registry: &Registry, requested: &Addr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    trace!("BIND requested={}", requested);

    let handle = registry.get_or_create(requested).await?;

    let listen_addr = handle.local_addr()?;
    Response::success(Addr::from_socket_addr(listen_addr))
        .write_to(stream)
        .await?;
    trace!("BIND listening on {}", listen_addr);

    let (mut peer_conn, peer_addr) = handle.accept().await?;
    Response::success(Addr::from_socket_addr(peer_addr))
        .write_to(stream)
        .await?;
    trace!("BIND accepted {}", peer_addr);

    tokio::io::copy_bidirectional(stream, &mut peer_conn).await?;
    // `handle` drops here, decrementing the registry's ref-count; the
    // listener itself lingers for `ListenerTimeout` in case of another BIND.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn bind_reports_listener_then_peer_and_relays() {
        let registry = Registry::new(Duration::from_millis(200));
        let requested = Addr::from_host_port("127.0.0.1", 0);

        let (mut client_side, mut server_side) = duplex(256);
        let handler = tokio::spawn(async move { handle(&mut server_side, &registry, &requested).await });

        let mut first_reply = [0u8; 10];
        client_side.read_exact(&mut first_reply).await.unwrap();
        assert_eq!(first_reply[1], 0x00);
        let port = u16::from_be_bytes([first_reply[8], first_reply[9]]);

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let mut second_reply = [0u8; 10];
        client_side.read_exact(&mut second_reply).await.unwrap();
        assert_eq!(second_reply[1], 0x00);

        peer.write_all(b"ping").await.unwrap();
        let mut relayed = [0u8; 4];
        client_side.read_exact(&mut relayed).await.unwrap();
        assert_eq!(&relayed, b"ping");

        drop(peer);
        drop(client_side);
        let _ = handler.await.unwrap();
    }
}
