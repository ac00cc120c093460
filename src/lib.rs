#![forbid(unsafe_code)]
#[macro_use]
extern crate log;

//! A SOCKS5 proxy server and client library (RFC 1928 + RFC 1929).
//!
//! The server side accepts connections, negotiates authentication, and
//! dispatches CONNECT, BIND and ASSOCIATE. The client side (`client` module)
//! dials a remote SOCKS5 proxy and exposes the same three operations from
//! the other end of the wire.

pub mod addr;
pub mod auth;
pub mod client;
pub mod dialer;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod server;
pub mod session;
pub mod wire;

pub use addr::{Addr, AddrType};
pub use error::{Error, ReplyCode, Result};
pub use server::{Server, Tunables};
pub use wire::{AuthMethod, Request, Response, UDPPacket};

/// The only SOCKS version this crate speaks.
pub const SOCKS_VERSION: u8 = 0x05;

/// The sub-negotiation version byte for RFC 1929 username/password auth.
pub const AUTH_USER_PASS_VERSION: u8 = 0x01;

/// Reserved wire byte, always zero.
pub(crate) const RESERVED: u8 = 0x00;
