//! Error taxonomy (C2): reply-code <-> error mapping plus structured context
//! wrapping, mirroring the split the teacher already has between a
//! `thiserror`-derived top-level error and a `snafu`-derived display on the
//! wire reply code.

use snafu::Snafu;
use thiserror::Error as ThisError;

/// The set of valid SOCKS5 reply types as per RFC 1928, plus an `Unknown`
/// escape hatch so the wire byte is never lossy (some deployments abuse
/// codes above 8; `ReplyCode::Unknown` still round-trips and still reports
/// a diagnostic message that names the numeric code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum ReplyCode {
    Success,
    #[snafu(display("general SOCKS server failure"))]
    GeneralFailure,
    #[snafu(display("connection not allowed by ruleset"))]
    ConnectionNotAllowed,
    #[snafu(display("network unreachable"))]
    NetworkUnreachable,
    #[snafu(display("host unreachable"))]
    HostUnreachable,
    #[snafu(display("connection refused"))]
    ConnectionRefused,
    #[snafu(display("TTL expired"))]
    TtlExpired,
    #[snafu(display("command not supported"))]
    CommandNotSupported,
    #[snafu(display("address type not supported"))]
    AddrTypeNotSupported,
    #[snafu(display("socks5 reply code {code}"))]
    Unknown { code: u8 },
}

impl ReplyCode {
    /// Parse the wire byte sent in a SOCKS5 `Response`.
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => ReplyCode::Success,
            0x01 => ReplyCode::GeneralFailure,
            0x02 => ReplyCode::ConnectionNotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddrTypeNotSupported,
            code => ReplyCode::Unknown { code },
        }
    }

    /// The wire byte for this reply code.
    pub fn to_byte(self) -> u8 {
        match self {
            ReplyCode::Success => 0x00,
            ReplyCode::GeneralFailure => 0x01,
            ReplyCode::ConnectionNotAllowed => 0x02,
            ReplyCode::NetworkUnreachable => 0x03,
            ReplyCode::HostUnreachable => 0x04,
            ReplyCode::ConnectionRefused => 0x05,
            ReplyCode::TtlExpired => 0x06,
            ReplyCode::CommandNotSupported => 0x07,
            ReplyCode::AddrTypeNotSupported => 0x08,
            ReplyCode::Unknown { code } => code,
        }
    }

    /// `Success` maps to no error; every other reply code maps to a
    /// `Error::Reply` carrying itself.
    pub fn to_error(self) -> Option<Error> {
        match self {
            ReplyCode::Success => None,
            other => Some(Error::Reply(other)),
        }
    }
}

impl From<u8> for ReplyCode {
    fn from(b: u8) -> Self {
        ReplyCode::from_byte(b)
    }
}

/// The crate-wide error type. Covers negotiation errors, codec errors,
/// configuration errors and protocol-level reply errors (§7).
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("socks error: {0}")]
    Reply(ReplyCode),

    #[error("invalid SOCKS version")]
    InvalidVersion,
    #[error("bad SOCKS auth version")]
    BadSocksAuthVersion,
    #[error("no acceptable authentication methods")]
    NoAcceptableAuthMethods,
    #[error("auth method not supported")]
    AuthMethodNotSupported,
    #[error("authentication failed")]
    AuthFailed,
    #[error("illegal username")]
    IllegalUsername,
    #[error("illegal password")]
    IllegalPassword,

    #[error("unsupported address type")]
    UnsupportedAddressType,
    #[error("invalid domain name")]
    InvalidDomainName,
    #[error("invalid IPv4 address")]
    InvalidIPv4Address,
    #[error("invalid IPv6 address")]
    InvalidIPv6Address,
    #[error("invalid port number")]
    InvalidPortNumber,
    #[error("invalid UDP packet")]
    InvalidUDPPacket,
    #[error("fragmented UDP packet")]
    FragmentedUDPPacket,

    #[error("unsupported network {0:?}")]
    UnsupportedNetwork(String),
    #[error("unsupported proxy URL scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("use of closed network connection")]
    Closed,

    #[error("{1}: {0}")]
    Context(Box<Error>, &'static str),
    #[error("multiple errors: {0:?}")]
    Joined(Vec<Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap `self` with a short contextual note, preserving the chain
    /// (mirrors the original's `Note`/`TextError` helpers).
    pub fn note(self, txt: &'static str) -> Error {
        Error::Context(Box::new(self), txt)
    }

    /// The reply code a session should write back to the client for this
    /// error. `Error::Reply` passes its code through verbatim (used when a
    /// `DialerSelector` refuses with a specific code); everything else maps
    /// to `GeneralFailure`, matching the session's default failure reply.
    pub fn to_reply_code(&self) -> ReplyCode {
        match self {
            Error::Reply(code) => *code,
            Error::Context(inner, _) => inner.to_reply_code(),
            _ => ReplyCode::GeneralFailure,
        }
    }
}

/// Returns the single error when exactly one of `a`/`b` is present, `None`
/// when both are, and a `Joined` value when both are present.
pub fn join(a: Option<Error>, b: Option<Error>) -> Option<Error> {
    match (a, b) {
        (None, None) => None,
        (Some(e), None) | (None, Some(e)) => Some(e),
        (Some(e1), Some(e2)) => Some(Error::Joined(vec![e1, e2])),
    }
}

/// Convenience for `io::Result<()>` pairs that both need closing, e.g.
/// `UDPConn::close` tearing down both the UDP socket and the TCP control
/// connection.
pub fn join_io(a: std::io::Result<()>, b: std::io::Result<()>) -> Result<()> {
    match join(a.err().map(Error::from), b.err().map(Error::from)) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
