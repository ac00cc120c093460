//! Pluggable authentication (C5 auth half): the method-selection contract a
//! session negotiates against, plus the RFC 1929 username/password
//! implementation and its static, CSV-backed credential store.
//!
//! Grounded on `original_source/server/authenticator.go`
//! (`Authenticator`/`NoAuthAuthenticator`/`UserPassAuthenticator`) and
//! `server/credentialstore.go` (`CredentialStore`/`StaticCredentials`), with
//! the CSV loading kept from the teacher's `User` struct (src/lib.rs).

use crate::error::{Error, Result};
use crate::wire::{self, AuthMethod};
use async_trait::async_trait;
use serde_derive::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream, object-safe so `Authenticator` can take `&mut dyn
/// Stream` instead of being generic over the session's concrete socket type.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// One authentication method a server is willing to offer. A session builds
/// its method-selection response from whichever configured `Authenticator`s
/// the client also offered, then delegates the sub-negotiation (if any) to
/// the chosen one.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn method(&self) -> AuthMethod;

    /// Run this method's sub-negotiation, if it has one. Returns the
    /// authenticated username, or `None` for methods that don't establish an
    /// identity (`NoAuthRequired`).
    async fn authenticate(&self, stream: &mut dyn Stream, peer: SocketAddr) -> Result<Option<String>>;
}

/// `NoAuthRequired`: the method-selection response alone is the whole
/// negotiation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthAuthenticator;

#[async_trait]
impl Authenticator for NoAuthAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::NoAuthRequired
    }

    async fn authenticate(&self, _stream: &mut dyn Stream, _peer: SocketAddr) -> Result<Option<String>> {
        Ok(None)
    }
}

/// A source of valid username/password pairs, independent of how the
/// sub-negotiation itself is framed on the wire.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn validate(&self, username: &str, password: &str, peer: SocketAddr) -> bool;
}

/// RFC 1929 username/password sub-negotiation against a `CredentialStore`.
pub struct UserPassAuthenticator {
    pub credentials: std::sync::Arc<dyn CredentialStore>,
}

#[async_trait]
impl Authenticator for UserPassAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::UserPass
    }

    async fn authenticate(&self, stream: &mut dyn Stream, peer: SocketAddr) -> Result<Option<String>> {
        let (username, password) = wire::read_user_pass(stream).await?;
        let valid = self.credentials.validate(&username, &password, peer).await;
        wire::write_user_pass_result(stream, valid).await?;
        if valid {
            Ok(Some(username))
        } else {
            Err(Error::AuthFailed)
        }
    }
}

/// One row of the static user CSV (kept from the teacher's `User`).
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
}

/// A fixed, in-memory username -> password map, loadable from a CSV file in
/// the teacher's `username,password` format.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials(HashMap<String, String>);

impl StaticCredentials {
    pub fn new() -> Self {
        StaticCredentials(HashMap::new())
    }

    pub fn insert(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.0.insert(username.into(), password.into());
    }

    pub fn from_users(users: Vec<User>) -> Self {
        let mut map = HashMap::new();
        for user in users {
            map.insert(user.username, user.password);
        }
        StaticCredentials(map)
    }

    /// Load a headerless `username,password` CSV, same format the teacher's
    /// `--users` flag reads.
    pub fn load_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)
            .map_err(csv_err)?;
        let mut store = StaticCredentials::new();
        for row in reader.deserialize() {
            let user: User = row.map_err(csv_err)?;
            store.insert(user.username, user.password);
        }
        Ok(store)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn csv_err(e: csv::Error) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

#[async_trait]
impl CredentialStore for StaticCredentials {
    async fn validate(&self, username: &str, password: &str, _peer: SocketAddr) -> bool {
        self.0.get(username).is_some_and(|p| p == password)
    }
}
