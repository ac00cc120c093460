//! Client-side BIND acceptor (§4.7): a pipelined listener backed by
//! successive BIND control connections, one already "waiting" while the
//! caller processes the previous `accept()`.
//!
//! Grounded on `original_source/client/boundtcp.go` (`boundTCP`, `Accept`,
//! `Close`, `Addr`) — `ready chan struct{}` maps onto a one-permit
//! `tokio::sync::Semaphore` per the recorded BIND-pipelining decision in
//! DESIGN.md.

use super::Client;
use crate::addr::Addr;
use crate::error::{Error, Result};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};

/// The terminal condition a `Binding` can end up in. `Failed` carries the
/// message of whatever I/O error killed the pipeline (the original error
/// isn't `Clone`, so only its text survives to later `accept()` calls).
enum Terminal {
    Failed(String),
    Closed,
}

struct State {
    waiting: Option<TcpStream>,
    terminal: Option<Terminal>,
}

/// A BIND acceptor: each `accept()` call hands back one inbound connection
/// and its peer address, while transparently starting the next BIND in the
/// background so a second inbound connection doesn't have to wait for the
/// proxy round-trip.
pub struct Binding {
    client: Client,
    /// The address the proxy reported for this listener (ANY-substituted in
    /// `addr()`, not here, since the substitution needs the current waiting
    /// connection's peer).
    addr: Addr,
    state: Mutex<State>,
    ready: Semaphore,
}

impl Binding {
    pub(crate) fn new(client: Client, addr: Addr, first_conn: TcpStream) -> Binding {
        Binding {
            client,
            addr,
            state: Mutex::new(State {
                waiting: Some(first_conn),
                terminal: None,
            }),
            ready: Semaphore::new(1),
        }
    }

    /// Wait for and return the next inbound connection, plus its peer
    /// address as reported by the proxy's second BIND reply.
    pub async fn accept(&self) -> Result<(TcpStream, Addr)> {
        if let Some(e) = self.terminal_error().await {
            return Err(e);
        }

        let permit = self
            .ready
            .acquire()
            .await
            .map_err(|_| Error::Closed)?;
        permit.forget();

        let mut guard = self.state.lock().await;
        if let Some(e) = terminal_to_error(&guard.terminal) {
            drop(guard);
            return Err(e);
        }
        let mut conn = guard.waiting.take().expect("permit implies a waiting connection");
        drop(guard);

        let result = self.client.read_reply(&mut conn).await.map(|addr| (conn, addr));

        match self.client.bind_once(&self.addr.to_string()).await {
            Ok((next_conn, _next_addr)) => {
                let mut guard = self.state.lock().await;
                guard.waiting = Some(next_conn);
                drop(guard);
                self.ready.add_permits(1);
            }
            Err(e) => {
                let mut guard = self.state.lock().await;
                guard.terminal = Some(Terminal::Failed(e.to_string()));
                drop(guard);
                self.ready.close();
            }
        }

        result
    }

    /// The listener's address and port on the proxy server. If the
    /// original request asked for the ANY host, this substitutes the proxy's
    /// own address instead (the only routable answer a remote peer could
    /// use).
    pub async fn addr(&self) -> Addr {
        let guard = self.state.lock().await;
        let mut addr = self.addr.clone();
        if addr.is_any() {
            if let Some(conn) = &guard.waiting {
                if let Ok(peer) = conn.peer_addr() {
                    addr.replace_any(peer);
                }
            }
        }
        addr
    }

    /// Close the acceptor: further `accept()` calls fail with `Error::Closed`.
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        if guard.terminal.is_none() {
            guard.terminal = Some(Terminal::Closed);
        }
        let conn = guard.waiting.take();
        drop(guard);
        self.ready.close();
        if let Some(mut conn) = conn {
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut conn).await;
        }
        Ok(())
    }

    async fn terminal_error(&self) -> Option<Error> {
        let guard = self.state.lock().await;
        terminal_to_error(&guard.terminal)
    }
}

fn terminal_to_error(terminal: &Option<Terminal>) -> Option<Error> {
    match terminal {
        None => None,
        Some(Terminal::Closed) => Some(Error::Closed),
        Some(Terminal::Failed(msg)) => Some(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            msg.clone(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::TokioDialer;
    use crate::wire::{Request, Response};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_client() -> Client {
        let mut client = Client::new("127.0.0.1:1");
        client.proxy_dialer = Arc::new(TokioDialer);
        client
    }

    /// A stand-in proxy that accepts one BIND handshake, replies with
    /// `listen_addr` as the first reply, then waits for the test to send a
    /// second reply through the same connection before returning it.
    async fn fake_proxy_bind(listener: &TcpListener, listen_addr: Addr) -> TcpStream {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut greeting_hdr = [0u8; 2];
        conn.read_exact(&mut greeting_hdr).await.unwrap();
        let mut methods = vec![0u8; greeting_hdr[1] as usize];
        conn.read_exact(&mut methods).await.unwrap();
        conn.write_all(&[0x05, 0x00]).await.unwrap();

        let _req = Request::read_from(&mut conn).await.unwrap();
        Response::success(listen_addr).write_to(&mut conn).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn accept_reads_second_reply_and_pipelines_next_bind() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        let mut client = test_client();
        client.proxy_address = proxy_addr.to_string();

        let listen_addr = Addr::from_host_port("203.0.113.5", 10001);
        let (bind_result, mut proxy_conn) = tokio::join!(
            client.bind_once("0.0.0.0:0"),
            fake_proxy_bind(&proxy, listen_addr.clone()),
        );
        let (first_conn, reported_addr) = bind_result.unwrap();
        assert_eq!(reported_addr, listen_addr);

        let binding = Binding::new(client, listen_addr.clone(), first_conn);

        let peer_addr = Addr::from_host_port("198.51.100.9", 4000);
        let accept_task = tokio::spawn(async move { binding.accept().await });

        // the accept task is now blocked reading the second reply on its
        // (client-side) control connection; play the proxy and supply it.
        Response::success(peer_addr.clone())
            .write_to(&mut proxy_conn)
            .await
            .unwrap();
        // accept() then pipelines the next BIND; serve that one too.
        let _next_proxy_conn = fake_proxy_bind(&proxy, listen_addr).await;

        let (_, observed_peer) = tokio::time::timeout(std::time::Duration::from_secs(5), accept_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(observed_peer, peer_addr);
    }
}
