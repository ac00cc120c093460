//! CONNECT handler (C6): dial the backend, report the bound address, then
//! relay bytes full-duplex until either side closes.
//!
//! Grounded on `original_source/server/handleconnect.go` (the 5-second dial
//! timeout and reply shape) and the teacher's `handle_client` CONNECT arm,
//! which already reaches for `tokio::io::copy_bidirectional`.

use crate::addr::Addr;
use crate::dialer::Dialer;
use crate::error::{Error, Result};
use crate::wire::Response;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Non-configurable in this core (§5); an injected `Dialer` can impose its
/// own, tighter timeout if a deployment needs one.
const CONNECT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn handle<S>(stream: &mut S, dialer: &dyn Dialer, target: &Addr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    trace!("CONNECT target={}", target);

    let mut backend = match tokio::time::timeout(CONNECT_DIAL_TIMEOUT, dialer.dial_tcp(target)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "CONNECT dial timed out",
            )))
        }
    };

    let local = backend.local_addr()?;
    Response::success(Addr::from_socket_addr(local))
        .write_to(stream)
        .await?;

    tokio::io::copy_bidirectional(stream, &mut backend).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::{RefusingDialer, TokioDialer};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_relays_bytes_both_ways() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut sock, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let (mut client_side, mut server_side) = duplex(256);
        let target = Addr::from_socket_addr(backend_addr);
        let handler = tokio::spawn(async move { handle(&mut server_side, &TokioDialer, &target).await });

        let mut reply_hdr = [0u8; 10];
        client_side.read_exact(&mut reply_hdr).await.unwrap();
        assert_eq!(reply_hdr[0], 0x05);
        assert_eq!(reply_hdr[1], 0x00);

        client_side.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client_side.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        drop(client_side);
        echo.await.unwrap();
        let _ = handler.await.unwrap();
    }

    #[tokio::test]
    async fn connect_propagates_dial_failure_without_writing_a_reply() {
        let (mut client_side, mut server_side) = duplex(256);
        let target = Addr::from_host_port("10.255.255.1", 9);
        let result = handle(&mut server_side, &RefusingDialer, &target).await;
        assert!(result.is_err());
        drop(server_side);

        let mut buf = Vec::new();
        let _ = client_side.read_to_end(&mut buf).await;
        assert!(buf.is_empty());
    }
}
