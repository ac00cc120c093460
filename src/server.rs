//! Server top-level (C9): the accept loop, per-connection session lifetime,
//! the BIND listener reaper, and graceful shutdown.
//!
//! Grounded on the teacher's `Merino::{new,serve}` (`src/lib.rs`),
//! generalized with the listener-registry reaper and watch-channel
//! graceful-stop from `original_source/server/server.go` (`Serve`, `listen`,
//! `close`) and `server/session.go` (`serve`, `handleRequest`).

use crate::auth::Authenticator;
use crate::dialer::{Dialer, DialerSelector, FixedDialerSelector};
use crate::handlers;
use crate::registry::Registry;
use crate::session;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Process-wide tunables, set before [`Server::serve`] starts (§6).
#[derive(Debug, Clone)]
pub struct Tunables {
    /// UDP idle service eviction threshold (default 10s).
    pub udp_timeout: Duration,
    /// Grace period before a ref-count-zero BIND listener is closed (default 1s).
    pub listener_timeout: Duration,
    /// Prefix applied to every structured log message (default `"socks5: "`).
    pub log_prefix: String,
    /// Gates verbose (`trace`-level) structured logging, mirroring the
    /// original's `Server.Debug`.
    pub debug: bool,
}

impl Default for Tunables {
    fn default() -> Tunables {
        Tunables {
            udp_timeout: Duration::from_secs(10),
            listener_timeout: Duration::from_secs(1),
            log_prefix: "socks5: ".to_string(),
            debug: false,
        }
    }
}

/// A SOCKS5 proxy server: an ordered list of authenticators, an outbound
/// `DialerSelector`, the shared BIND listener registry, and the tunables
/// above.
pub struct Server {
    authenticators: Vec<Arc<dyn Authenticator>>,
    dialer_selector: Arc<dyn DialerSelector>,
    registry: Registry,
    tunables: Tunables,
}

impl Server {
    pub fn new(
        authenticators: Vec<Arc<dyn Authenticator>>,
        dialer_selector: Arc<dyn DialerSelector>,
        tunables: Tunables,
    ) -> Arc<Server> {
        Arc::new(Server {
            authenticators,
            dialer_selector,
            registry: Registry::new(tunables.listener_timeout),
            tunables,
        })
    }

    /// Convenience constructor for the common case: no per-user routing
    /// policy, just a fixed default dialer.
    pub fn with_default_dialer(
        authenticators: Vec<Arc<dyn Authenticator>>,
        dialer: Arc<dyn Dialer>,
        tunables: Tunables,
    ) -> Arc<Server> {
        Server::new(
            authenticators,
            Arc::new(FixedDialerSelector(dialer)),
            tunables,
        )
    }

    /// Accept connections on `listener` until `stop` fires. Runs the
    /// listener-registry reaper concurrently. Returns once the accept loop
    /// ends, after closing every pooled BIND listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
        info!("{}listening on {}", self.tunables.log_prefix, listener.local_addr().map(|a| a.to_string()).unwrap_or_default());

        let reaper_registry = self.registry.clone();
        // `tokio::time::interval` panics on a zero period; a `--listener-timeout
        // 0` CLI flag must not take the reaper down with it.
        let reaper_period = self.tunables.listener_timeout.max(Duration::from_millis(1));
        let mut reaper_stop = stop.clone();
        let reaper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(reaper_period);
            loop {
                tokio::select! {
                    _ = tick.tick() => reaper_registry.reap_expired().await,
                    _ = reaper_stop.changed() => break,
                }
            }
        });

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move { server.handle_connection(stream, peer).await });
                        }
                        Err(e) => {
                            error!("{}accept failed: {}", self.tunables.log_prefix, e);
                            break;
                        }
                    }
                }
            }
        }

        reaper.abort();
        self.registry.close_all().await;
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        if self.tunables.debug {
            trace!("{}session start session={}", self.tunables.log_prefix, peer);
        }

        let local = match stream.local_addr() {
            Ok(a) => a,
            Err(e) => {
                warn!("{}could not read local addr: {}", self.tunables.log_prefix, e);
                return;
            }
        };

        let result = self.serve_session(&mut stream, local, peer).await;
        if self.tunables.debug {
            trace!(
                "{}session stop session={} result={:?}",
                self.tunables.log_prefix,
                peer,
                result.as_ref().err()
            );
        }
    }

    async fn serve_session(
        &self,
        stream: &mut TcpStream,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> crate::error::Result<()> {
        let identity = session::negotiate(stream, &self.authenticators, peer).await?;

        let request = match session::read_request(stream).await {
            Ok(req) => req,
            Err(e) => {
                session::fail(stream, e.to_reply_code()).await;
                return Err(e);
            }
        };

        let dialer = match self
            .dialer_selector
            .select_dialer(identity.method, identity.username.as_deref(), &request.addr)
            .await
        {
            Ok(d) => d,
            Err(e) => {
                session::fail(stream, e.to_reply_code()).await;
                return Err(e);
            }
        };

        let result = handlers::dispatch(
            stream,
            request.command,
            &request.addr,
            dialer,
            &self.registry,
            &self.tunables,
            local,
            peer,
        )
        .await;

        if let Err(ref e) = result {
            session::fail(stream, e.to_reply_code()).await;
        }
        result
    }
}
