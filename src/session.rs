//! Per-connection session state machine (C5): `Greeting` ->
//! `Authenticating` -> `Requesting` -> `Active(command)` -> `Terminated`.
//!
//! Grounded on the teacher's `auth::SOCKClient` (negotiation shape) and
//! generalized from its single hard-coded auth method to the pluggable
//! `Authenticator` list described by `original_source/server/session.go`
//! (`negotiateAuth`, `verifyAuth`, `handleRequest`, `fail`).

use crate::auth::Authenticator;
use crate::error::{Error, ReplyCode, Result};
use crate::wire::{self, AuthMethod, Request, Response};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Where a connection is in its lifecycle. Not consulted for control flow
/// (the `async fn`s below encode that directly) — it exists so a session can
/// log where it got to when something fails partway through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Greeting,
    Authenticating,
    Requesting,
    Active(crate::wire::Command),
    Terminated,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Greeting => write!(f, "greeting"),
            State::Authenticating => write!(f, "authenticating"),
            State::Requesting => write!(f, "requesting"),
            State::Active(cmd) => write!(f, "active({:?})", cmd),
            State::Terminated => write!(f, "terminated"),
        }
    }
}

/// The outcome of a successful negotiation: which method won and, for
/// methods that establish one, the authenticated identity.
#[derive(Debug, Clone)]
pub struct Identity {
    pub method: AuthMethod,
    pub username: Option<String>,
}

/// Run the greeting and method sub-negotiation against a list of configured
/// authenticators, in priority order. The first configured authenticator
/// whose method the client also offered wins; if none match, the server
/// reports `NoAcceptable` and the connection must be dropped.
pub async fn negotiate<S>(
    stream: &mut S,
    authenticators: &[Arc<dyn Authenticator>],
    peer: SocketAddr,
) -> Result<Identity>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let offered: HashSet<u8> = wire::read_greeting(stream).await?.into_iter().collect();
    let chosen = authenticators
        .iter()
        .find(|a| offered.contains(&a.method().to_byte()));

    let authenticator = match chosen {
        Some(a) => a,
        None => {
            wire::write_method_selection(stream, AuthMethod::NoAcceptable).await?;
            return Err(Error::NoAcceptableAuthMethods);
        }
    };

    wire::write_method_selection(stream, authenticator.method()).await?;
    let username = authenticator.authenticate(stream, peer).await?;
    Ok(Identity {
        method: authenticator.method(),
        username,
    })
}

/// Read the client's request (`Requesting` state).
pub async fn read_request<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + Unpin,
{
    Request::read_from(stream).await
}

/// Best-effort failure reply: write a zero-address `Response` with the
/// given reply code, swallowing any write error since the connection is
/// already being torn down. Mirrors the original's `fail`.
pub async fn fail<S>(stream: &mut S, reply: ReplyCode)
where
    S: AsyncWrite + Unpin,
{
    let _ = Response::failure(reply).write_to(stream).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoAuthAuthenticator;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn peer() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[tokio::test]
    async fn negotiate_picks_matching_authenticator() {
        let authenticators: Vec<Arc<dyn Authenticator>> = vec![Arc::new(NoAuthAuthenticator)];
        let (mut server, mut client) = duplex(64);
        let client_task = tokio::spawn(async move {
            client.write_all(&[0x05, 1, 0x00]).await.unwrap();
            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.unwrap();
            resp
        });
        let identity = negotiate(&mut server, &authenticators, peer()).await.unwrap();
        assert_eq!(identity.method, AuthMethod::NoAuthRequired);
        assert_eq!(client_task.await.unwrap(), [0x05, 0x00]);
    }

    #[tokio::test]
    async fn negotiate_rejects_when_nothing_matches() {
        let authenticators: Vec<Arc<dyn Authenticator>> = vec![Arc::new(NoAuthAuthenticator)];
        let (mut server, mut client) = duplex(64);
        let client_task = tokio::spawn(async move {
            client.write_all(&[0x05, 1, 0x02]).await.unwrap();
            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.unwrap();
            resp
        });
        let result = negotiate(&mut server, &authenticators, peer()).await;
        assert!(matches!(result, Err(Error::NoAcceptableAuthMethods)));
        assert_eq!(client_task.await.unwrap(), [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn fail_writes_zero_address_response() {
        let (mut server, mut client) = duplex(64);
        let client_task = tokio::spawn(async move {
            let mut buf = [0u8; 10];
            client.read_exact(&mut buf).await.unwrap();
            buf
        });
        fail(&mut server, ReplyCode::GeneralFailure).await;
        let buf = client_task.await.unwrap();
        assert_eq!(buf[0], 0x05);
        assert_eq!(buf[1], 0x01);
    }
}
