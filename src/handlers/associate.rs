//! ASSOCIATE / UDP relay (C7): the densest handler. One ASSOCIATE command
//! yields one logical UDP relay bound to the client's TCP control
//! connection, fanning out per-destination sub-sockets with idle eviction.
//!
//! Grounded on `original_source/server/handleassociate.go` (`handleASSOCIATE`,
//! `serveUDP`, `udpService`) — new functionality for the teacher (which
//! returns `UdpAssosiate not supported`), built in the teacher's idiom.

use crate::addr::{Addr, AddrType};
use crate::dialer::Dialer;
use crate::error::Result;
use crate::server::Tunables;
use crate::wire::{Response, UDPPacket};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// `math.MaxUint16 - 28`: the largest UDP payload that can round a typical
/// path MTU, matching the original's `maxUdpPacket`.
const MAX_UDP_PACKET: usize = u16::MAX as usize - 28;

struct UdpService {
    target: Arc<UdpSocket>,
    last_activity_millis: AtomicI64,
}

impl UdpService {
    fn new(target: Arc<UdpSocket>, started: Instant) -> UdpService {
        let svc = UdpService {
            target,
            last_activity_millis: AtomicI64::new(0),
        };
        svc.touch(started);
        svc
    }

    fn touch(&self, started: Instant) {
        self.last_activity_millis
            .store(started.elapsed().as_millis() as i64, Ordering::SeqCst);
    }

    fn idle_millis(&self, started: Instant) -> i64 {
        started.elapsed().as_millis() as i64 - self.last_activity_millis.load(Ordering::SeqCst)
    }
}

struct ServiceEntry {
    svc: Arc<UdpService>,
    reverse_task: JoinHandle<()>,
}

impl Drop for ServiceEntry {
    fn drop(&mut self) {
        self.reverse_task.abort();
    }
}

pub async fn handle<S>(
    stream: &mut S,
    dialer: Arc<dyn Dialer>,
    tunables: &Tunables,
    requested: &Addr,
    tcp_local: SocketAddr,
    tcp_peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client_udp = Arc::new(UdpSocket::bind((tcp_local.ip(), 0)).await?);
    let bind_addr = client_udp.local_addr()?;
    Response::success(Addr::from_socket_addr(bind_addr))
        .write_to(stream)
        .await?;
    trace!("ASSOCIATE bound client-facing socket on {}", bind_addr);

    let mut client_addr = resolve_predeclared(requested, tcp_peer, bind_addr.port());

    let started = Instant::now();
    let mut services: HashMap<Addr, ServiceEntry> = HashMap::new();
    let mut recv_buf = vec![0u8; MAX_UDP_PACKET];
    let mut discard = [0u8; 4096];
    // `tokio::time::interval` panics on a zero period; `--udp-timeout 0` must
    // not take the first ASSOCIATE down with it.
    let sweep_period = (tunables.udp_timeout / 10).max(std::time::Duration::from_millis(1));
    let mut sweep = tokio::time::interval(sweep_period);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            read = stream.read(&mut discard) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            received = client_udp.recv_from(&mut recv_buf) => {
                let (n, src) = match received {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if client_addr.is_none() {
                    client_addr = Some(src);
                }
                if client_addr != Some(src) {
                    trace!("ASSOCIATE dropping UDP packet from unexpected source {}", src);
                    continue;
                }
                let pkt = match UDPPacket::parse(&recv_buf[..n]).await {
                    Ok(pkt) => pkt,
                    Err(e) => {
                        trace!("ASSOCIATE dropping unparseable UDP packet: {}", e);
                        continue;
                    }
                };
                if let Err(e) = forward(
                    &mut services,
                    dialer.as_ref(),
                    &client_udp,
                    src,
                    &pkt,
                    started,
                ).await {
                    trace!("ASSOCIATE forward to {} failed: {}", pkt.addr, e);
                    services.remove(&pkt.addr);
                }
            }
            _ = sweep.tick() => {
                let timeout_millis = tunables.udp_timeout.as_millis() as i64;
                services.retain(|dest, entry| {
                    let idle = entry.svc.idle_millis(started);
                    let keep = idle < timeout_millis;
                    if !keep {
                        trace!("ASSOCIATE evicting idle service for {}", dest);
                    }
                    keep
                });
            }
        }
    }

    // TCP control connection closed: tear the fabric down. Masked to `Ok`
    // regardless of what the discard read returned, matching the original's
    // `if tcpClosed.Load() { err = nil }`.
    Ok(())
}

async fn forward(
    services: &mut HashMap<Addr, ServiceEntry>,
    dialer: &dyn Dialer,
    client_udp: &Arc<UdpSocket>,
    client_addr: SocketAddr,
    pkt: &UDPPacket,
    started: Instant,
) -> Result<()> {
    if !services.contains_key(&pkt.addr) {
        let local = unspecified_for(&pkt.addr);
        let target = Arc::new(dialer.dial_udp(local, &pkt.addr).await?);
        let svc = Arc::new(UdpService::new(target.clone(), started));
        let reverse_task = tokio::spawn(reverse_loop(
            target,
            client_udp.clone(),
            client_addr,
            svc.clone(),
            started,
        ));
        services.insert(pkt.addr.clone(), ServiceEntry { svc, reverse_task });
    }
    let entry = services.get(&pkt.addr).expect("just inserted");
    let sent = entry.svc.target.send(&pkt.body).await?;
    if sent != pkt.body.len() {
        return Err(crate::error::Error::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "short UDP write to backend",
        )));
    }
    entry.svc.touch(started);
    Ok(())
}

/// Per-service reverse path: reads datagrams back from the backend,
/// re-encapsulates each as a `UDPPacket`, and forwards it to the client's
/// UDP socket. Terminates (and lets the entry's `Drop` clean it up) on any
/// backend read error.
async fn reverse_loop(
    target: Arc<UdpSocket>,
    client_udp: Arc<UdpSocket>,
    client_addr: SocketAddr,
    svc: Arc<UdpService>,
    started: Instant,
) {
    let mut buf = vec![0u8; MAX_UDP_PACKET];
    loop {
        let (n, src) = match target.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(_) => return,
        };
        let pkt = UDPPacket {
            addr: Addr::from_socket_addr(src),
            body: buf[..n].to_vec(),
        };
        let bytes = match pkt.to_bytes() {
            Ok(b) => b,
            Err(_) => return,
        };
        if client_udp.send_to(&bytes, client_addr).await.is_err() {
            return;
        }
        svc.touch(started);
    }
}

fn unspecified_for(dest: &Addr) -> SocketAddr {
    match dest.kind {
        AddrType::V6 => "[::]:0".parse().unwrap(),
        _ => "0.0.0.0:0".parse().unwrap(),
    }
}

/// §4.8 step 3: pre-record the expected UDP source from the request's
/// address when it's non-zero, substituting "any" with the TCP peer's host
/// and a zero port with the server's UDP bind port. `Addr::zero()` (the
/// common case — most clients don't pre-declare) means "learn on first
/// packet".
fn resolve_predeclared(
    requested: &Addr,
    tcp_peer: SocketAddr,
    udp_bind_port: u16,
) -> Option<SocketAddr> {
    if *requested == Addr::zero() {
        return None;
    }
    let host = if requested.is_any() {
        tcp_peer.ip().to_string()
    } else {
        requested.host.clone()
    };
    let port = if requested.port == 0 {
        udp_bind_port
    } else {
        requested.port
    };
    let hostport = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    hostport.parse().ok()
}
