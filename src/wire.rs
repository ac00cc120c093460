//! Wire framing (C1): the greeting, the RFC 1929 username/password
//! sub-negotiation, `Request`/`Response`, and the UDP datagram envelope.
//!
//! Grounded on the teacher's `SOCKSReq::from_stream` (src/lib.rs) for the
//! read-the-header-then-dispatch shape, and on `original_source/request.go`,
//! `response.go`, `udppacket.go` and `server/server.go`'s
//! `readClientGreeting`/`parseClientAuth` for the exact byte layout.

use crate::addr::Addr;
use crate::error::{Error, ReplyCode, Result};
use crate::{AUTH_USER_PASS_VERSION, RESERVED, SOCKS_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Authentication methods this crate knows how to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    NoAuthRequired = 0x00,
    UserPass = 0x02,
    NoAcceptable = 0xFF,
}

impl AuthMethod {
    pub fn from_byte(b: u8) -> Option<AuthMethod> {
        match b {
            0x00 => Some(AuthMethod::NoAuthRequired),
            0x02 => Some(AuthMethod::UserPass),
            0xFF => Some(AuthMethod::NoAcceptable),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Read the client greeting (`VER NMETHODS METHODS`), returning the raw
/// method list for the session to negotiate against.
pub async fn read_greeting<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; 2];
    r.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Error::InvalidVersion);
    }
    let mut methods = vec![0u8; header[1] as usize];
    r.read_exact(&mut methods).await?;
    Ok(methods)
}

/// Write the server's method selection (`VER METHOD`).
pub async fn write_method_selection<W: AsyncWrite + Unpin>(
    w: &mut W,
    method: AuthMethod,
) -> Result<()> {
    w.write_all(&[SOCKS_VERSION, method.to_byte()]).await?;
    Ok(())
}

/// Read an RFC 1929 username/password sub-negotiation request.
pub async fn read_user_pass<R: AsyncRead + Unpin>(r: &mut R) -> Result<(String, String)> {
    let mut ver = [0u8; 1];
    r.read_exact(&mut ver).await?;
    if ver[0] != AUTH_USER_PASS_VERSION {
        return Err(Error::BadSocksAuthVersion);
    }
    let mut ulen = [0u8; 1];
    r.read_exact(&mut ulen).await?;
    let mut uname = vec![0u8; ulen[0] as usize];
    r.read_exact(&mut uname).await?;
    let mut plen = [0u8; 1];
    r.read_exact(&mut plen).await?;
    let mut pword = vec![0u8; plen[0] as usize];
    r.read_exact(&mut pword).await?;
    let username = String::from_utf8(uname).map_err(|_| Error::IllegalUsername)?;
    let password = String::from_utf8(pword).map_err(|_| Error::IllegalPassword)?;
    Ok((username, password))
}

/// Write the RFC 1929 sub-negotiation result (`VER STATUS`, 0 = success).
pub async fn write_user_pass_result<W: AsyncWrite + Unpin>(w: &mut W, ok: bool) -> Result<()> {
    w.write_all(&[AUTH_USER_PASS_VERSION, if ok { 0x00 } else { 0x01 }])
        .await?;
    Ok(())
}

/// The three SOCKS5 commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    Associate = 0x03,
}

impl Command {
    pub fn from_byte(b: u8) -> Result<Command> {
        match b {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::Associate),
            _ => Err(Error::Reply(ReplyCode::CommandNotSupported)),
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// `VER CMD RSV ATYP DST.ADDR DST.PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub addr: Addr,
}

impl Request {
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Request> {
        let mut header = [0u8; 3];
        r.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(Error::InvalidVersion);
        }
        let command = Command::from_byte(header[1])?;
        let addr = Addr::read_from(r).await?;
        Ok(Request { command, addr })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let mut buf = vec![SOCKS_VERSION, self.command.to_byte(), RESERVED];
        self.addr.append_binary(&mut buf)?;
        w.write_all(&buf).await?;
        Ok(())
    }
}

/// `VER REP RSV ATYP BND.ADDR BND.PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub reply: ReplyCode,
    pub addr: Addr,
}

impl Response {
    pub fn success(addr: Addr) -> Response {
        Response {
            reply: ReplyCode::Success,
            addr,
        }
    }

    pub fn failure(reply: ReplyCode) -> Response {
        Response {
            reply,
            addr: Addr::zero(),
        }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Response> {
        let mut header = [0u8; 3];
        r.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(Error::InvalidVersion);
        }
        let reply = ReplyCode::from_byte(header[1]);
        let addr = Addr::read_from(r).await?;
        Ok(Response { reply, addr })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let mut buf = vec![SOCKS_VERSION, self.reply.to_byte(), RESERVED];
        self.addr.append_binary(&mut buf)?;
        w.write_all(&buf).await?;
        Ok(())
    }
}

/// The UDP relay envelope: `RSV(2) FRAG(1) ATYP DST.ADDR DST.PORT DATA`.
///
/// Fragmentation (FRAG != 0) is rejected rather than reassembled, matching
/// the original's `requireValidHeader`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UDPPacket {
    pub addr: Addr,
    pub body: Vec<u8>,
}

impl UDPPacket {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0x00, 0x00, 0x00];
        self.addr.append_binary(&mut buf)?;
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Parse a full UDP datagram already read into memory.
    pub async fn parse(data: &[u8]) -> Result<UDPPacket> {
        if data.len() < 4 || data[0] != 0 || data[1] != 0 {
            return Err(Error::InvalidUDPPacket);
        }
        if data[2] != 0 {
            return Err(Error::FragmentedUDPPacket);
        }
        let mut cursor = std::io::Cursor::new(&data[3..]);
        let addr = Addr::read_from(&mut cursor).await?;
        let consumed = cursor.position() as usize;
        let body = data[3 + consumed..].to_vec();
        Ok(UDPPacket { addr, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Addr;

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[test]
    fn greeting_round_trips() {
        let mut buf = Vec::new();
        block_on(async {
            buf.push(SOCKS_VERSION);
            buf.push(2);
            buf.extend_from_slice(&[0x00, 0x02]);
        });
        let mut cursor = std::io::Cursor::new(buf);
        let methods = block_on(read_greeting(&mut cursor)).unwrap();
        assert_eq!(methods, vec![0x00, 0x02]);
    }

    #[test]
    fn greeting_rejects_wrong_version() {
        let mut cursor = std::io::Cursor::new(vec![0x04, 0x00]);
        assert!(matches!(
            block_on(read_greeting(&mut cursor)),
            Err(Error::InvalidVersion)
        ));
    }

    #[test]
    fn user_pass_round_trips() {
        let mut buf = vec![AUTH_USER_PASS_VERSION, 5];
        buf.extend_from_slice(b"alice");
        buf.push(3);
        buf.extend_from_slice(b"hi!");
        let mut cursor = std::io::Cursor::new(buf);
        let (user, pass) = block_on(read_user_pass(&mut cursor)).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "hi!");
    }

    #[test]
    fn user_pass_rejects_bad_version() {
        let mut cursor = std::io::Cursor::new(vec![0x05, 0, 0]);
        assert!(matches!(
            block_on(read_user_pass(&mut cursor)),
            Err(Error::BadSocksAuthVersion)
        ));
    }

    #[test]
    fn request_round_trips_each_command() {
        for command in [Command::Connect, Command::Bind, Command::Associate] {
            let req = Request {
                command,
                addr: Addr::from_host_port("example.com", 1080),
            };
            let mut buf = Vec::new();
            block_on(async {
                let mut sink = &mut buf;
                req.write_to(&mut sink).await.unwrap();
            });
            let mut cursor = std::io::Cursor::new(buf);
            let decoded = block_on(Request::read_from(&mut cursor)).unwrap();
            assert_eq!(decoded, req);
        }
    }

    #[test]
    fn unknown_command_maps_to_command_not_supported() {
        assert!(matches!(
            Command::from_byte(0x7f),
            Err(Error::Reply(ReplyCode::CommandNotSupported))
        ));
    }

    #[test]
    fn response_round_trips() {
        let resp = Response::success(Addr::from_host_port("10.0.0.1", 4000));
        let mut buf = Vec::new();
        block_on(async {
            let mut sink = &mut buf;
            resp.write_to(&mut sink).await.unwrap();
        });
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = block_on(Response::read_from(&mut cursor)).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn udp_packet_round_trips() {
        let packet = UDPPacket {
            addr: Addr::from_host_port("1.2.3.4", 53),
            body: b"hello".to_vec(),
        };
        let bytes = packet.to_bytes().unwrap();
        let decoded = block_on(UDPPacket::parse(&bytes)).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn udp_packet_rejects_nonzero_reserved() {
        let bytes = vec![0x01, 0x00, 0x00, 0x01, 1, 2, 3, 4, 0, 0];
        assert!(matches!(
            block_on(UDPPacket::parse(&bytes)),
            Err(Error::InvalidUDPPacket)
        ));
    }

    #[test]
    fn udp_packet_rejects_fragmentation() {
        let bytes = vec![0x00, 0x00, 0x01, 0x01, 1, 2, 3, 4, 0, 0];
        assert!(matches!(
            block_on(UDPPacket::parse(&bytes)),
            Err(Error::FragmentedUDPPacket)
        ));
    }
}
