//! `Addr` (C1): the three-variant SOCKS5 address type plus its wire codec.
//!
//! Grounded on `original_source/addr.go` (`Addr`, `MakeAddr`, `ParseAddr`,
//! `AppendBinary`) for the wire layout, and on the teacher's
//! `addr_to_socket`/`pretty_print_addr` (src/lib.rs) for the
//! read-one-field-at-a-time style over an `AsyncRead`.

use crate::error::{Error, Result};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// DST.addr variant types, as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrType {
    /// IP V4 address: X'01'
    V4 = 0x01,
    /// DOMAINNAME: X'03'
    Domain = 0x03,
    /// IP V6 address: X'04'
    V6 = 0x04,
}

/// A SOCKS5 endpoint: an address variant plus a port.
///
/// `host` always holds the canonical string form for `V4`/`V6` (so the
/// invariant "an IPv4 value carries an IPv4-parseable string" is checked at
/// encode time, not baked into the type) and the raw domain name for
/// `Domain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    pub kind: AddrType,
    pub host: String,
    pub port: u16,
}

impl Addr {
    /// The distinguished "any" address: `(IPv4, 0.0.0.0, port 0)`.
    pub fn zero() -> Addr {
        Addr {
            kind: AddrType::V4,
            host: "0.0.0.0".to_string(),
            port: 0,
        }
    }

    pub fn from_socket_addr(sa: SocketAddr) -> Addr {
        match sa {
            SocketAddr::V4(a) => Addr {
                kind: AddrType::V4,
                host: a.ip().to_string(),
                port: a.port(),
            },
            SocketAddr::V6(a) => Addr {
                kind: AddrType::V6,
                host: a.ip().to_string(),
                port: a.port(),
            },
        }
    }

    /// Build an `Addr` from a bare host and port, inferring the variant:
    /// an IPv4-parseable host becomes `V4`, an IPv6-parseable host becomes
    /// `V6`, anything else (and the empty string) becomes `Domain`/`zero()`
    /// respectively. Mirrors the original's `MakeAddr`.
    pub fn from_host_port(host: &str, port: u16) -> Addr {
        if host.is_empty() {
            return Addr {
                kind: AddrType::V4,
                host: "0.0.0.0".to_string(),
                port,
            };
        }
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            return Addr {
                kind: AddrType::V4,
                host: v4.to_string(),
                port,
            };
        }
        if let Ok(v6) = host.parse::<Ipv6Addr>() {
            return Addr {
                kind: AddrType::V6,
                host: v6.to_string(),
                port,
            };
        }
        Addr {
            kind: AddrType::Domain,
            host: host.to_string(),
            port,
        }
    }

    /// Parse a `host:port` (or `[ipv6]:port`) string, as used for target
    /// addresses supplied by a caller (client `Dial`/`Listen`).
    pub fn parse(hostport: &str) -> Result<Addr> {
        let (host, port) = split_host_port(hostport)?;
        Ok(Self::from_host_port(&host, port))
    }

    /// True for `0.0.0.0` and `::`.
    pub fn is_any(&self) -> bool {
        self.host == "0.0.0.0" || self.host == "::"
    }

    /// If this address is "any", replace its host with the observed peer
    /// address (used by BIND to report a routable address to the client).
    pub fn replace_any(&mut self, observed: SocketAddr) {
        if self.is_any() {
            match observed {
                SocketAddr::V4(a) => {
                    self.kind = AddrType::V4;
                    self.host = a.ip().to_string();
                }
                SocketAddr::V6(a) => {
                    self.kind = AddrType::V6;
                    self.host = a.ip().to_string();
                }
            }
        }
    }

    /// Encode this address onto `buf`, appending to whatever is already
    /// there (mirrors the original's `AppendBinary`). Never appends partial
    /// bytes on failure: validation happens before anything is pushed.
    pub fn append_binary(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self.kind {
            AddrType::V4 => {
                let ip: Ipv4Addr = self
                    .host
                    .parse()
                    .map_err(|_| Error::InvalidIPv4Address)?;
                buf.push(AddrType::V4 as u8);
                buf.extend_from_slice(&ip.octets());
            }
            AddrType::V6 => {
                let ip: Ipv6Addr = self
                    .host
                    .parse()
                    .map_err(|_| Error::InvalidIPv6Address)?;
                buf.push(AddrType::V6 as u8);
                buf.extend_from_slice(&ip.octets());
            }
            AddrType::Domain => {
                let len = self.host.len();
                if len == 0 || len > 255 {
                    return Err(Error::InvalidDomainName);
                }
                buf.push(AddrType::Domain as u8);
                buf.push(len as u8);
                buf.extend_from_slice(self.host.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.append_binary(&mut buf)?;
        Ok(buf)
    }

    /// Write this address to an async sink (greeting/request/response
    /// encoding all funnel through this).
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let buf = self.to_bytes()?;
        w.write_all(&buf).await?;
        Ok(())
    }

    /// Decode an address from the wire: one type byte, a variant-specific
    /// payload, then a 2-byte port.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Addr> {
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag).await?;
        let (kind, host) = match tag[0] {
            0x01 => {
                let mut ip = [0u8; 4];
                r.read_exact(&mut ip).await?;
                (AddrType::V4, Ipv4Addr::from(ip).to_string())
            }
            0x03 => {
                let mut len_byte = [0u8; 1];
                r.read_exact(&mut len_byte).await?;
                let mut domain = vec![0u8; len_byte[0] as usize];
                r.read_exact(&mut domain).await?;
                // lossy conversion would replace invalid bytes with U+FFFD
                // and break the round-trip; reject instead of mangling.
                let domain = String::from_utf8(domain).map_err(|_| Error::InvalidDomainName)?;
                (AddrType::Domain, domain)
            }
            0x04 => {
                let mut ip = [0u8; 16];
                r.read_exact(&mut ip).await?;
                (AddrType::V6, Ipv6Addr::from(ip).to_string())
            }
            _ => return Err(Error::UnsupportedAddressType),
        };
        let mut port_bytes = [0u8; 2];
        r.read_exact(&mut port_bytes).await?;
        Ok(Addr {
            kind,
            host,
            port: u16::from_be_bytes(port_bytes),
        })
    }
}

impl Default for Addr {
    fn default() -> Self {
        Addr::zero()
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AddrType::V6 => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// `net.SplitHostPort` equivalent: splits `host:port` or `[ipv6]:port` into
/// its parts, failing with `InvalidPortNumber` on anything malformed.
pub fn split_host_port(s: &str) -> Result<(String, u16)> {
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']').ok_or(Error::InvalidPortNumber)?;
        let host = &rest[..end];
        let after = rest[end + 1..]
            .strip_prefix(':')
            .ok_or(Error::InvalidPortNumber)?;
        let port: u16 = after.parse().map_err(|_| Error::InvalidPortNumber)?;
        return Ok((host.to_string(), port));
    }
    let idx = s.rfind(':').ok_or(Error::InvalidPortNumber)?;
    let port: u16 = s[idx + 1..]
        .parse()
        .map_err(|_| Error::InvalidPortNumber)?;
    Ok((s[..idx].to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(addr: &Addr) -> Addr {
        let bytes = addr.to_bytes().expect("encode");
        let mut cursor = std::io::Cursor::new(bytes);
        futures_block_on_read(&mut cursor)
    }

    // tiny helper so tests stay synchronous; Addr::read_from only needs
    // AsyncRead, which Cursor implements via tokio's blanket impl.
    fn futures_block_on_read(cursor: &mut std::io::Cursor<Vec<u8>>) -> Addr {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(Addr::read_from(cursor))
            .expect("decode")
    }

    #[test]
    fn round_trip_v4() {
        let addr = Addr::from_host_port("127.0.0.1", 8080);
        assert_eq!(roundtrip(&addr), addr);
    }

    #[test]
    fn round_trip_v6() {
        let addr = Addr::from_host_port("::1", 443);
        assert_eq!(roundtrip(&addr), addr);
    }

    #[test]
    fn round_trip_domain() {
        let addr = Addr::from_host_port("example.com", 80);
        assert_eq!(roundtrip(&addr), addr);
    }

    #[test]
    fn empty_domain_rejected_on_encode() {
        let addr = Addr {
            kind: AddrType::Domain,
            host: String::new(),
            port: 1,
        };
        assert!(matches!(addr.to_bytes(), Err(Error::InvalidDomainName)));
    }

    #[test]
    fn oversized_domain_rejected_on_encode() {
        let addr = Addr {
            kind: AddrType::Domain,
            host: "a".repeat(256),
            port: 1,
        };
        assert!(matches!(addr.to_bytes(), Err(Error::InvalidDomainName)));
    }

    #[test]
    fn mismatched_ip_string_rejected_on_encode() {
        let addr = Addr {
            kind: AddrType::V4,
            host: "::1".to_string(),
            port: 1,
        };
        assert!(matches!(addr.to_bytes(), Err(Error::InvalidIPv4Address)));
    }

    #[test]
    fn is_any_recognizes_both_families() {
        assert!(Addr::from_host_port("0.0.0.0", 0).is_any());
        assert!(Addr::from_host_port("::", 0).is_any());
        assert!(!Addr::from_host_port("127.0.0.1", 0).is_any());
    }

    #[test]
    fn replace_any_swaps_host_when_any() {
        let mut addr = Addr::zero();
        addr.replace_any("10.0.0.5:9".parse().unwrap());
        assert_eq!(addr.host, "10.0.0.5");
    }

    #[test]
    fn replace_any_is_noop_otherwise() {
        let mut addr = Addr::from_host_port("1.2.3.4", 5);
        addr.replace_any("10.0.0.5:9".parse().unwrap());
        assert_eq!(addr.host, "1.2.3.4");
    }

    #[test]
    fn split_host_port_handles_ipv6_brackets() {
        let (host, port) = split_host_port("[::1]:443").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 443);
    }
}
