//! SOCKS5 negotiation.
//!
//! Greets the client, selects no-authentication, and reads the CONNECT
//! request up to the point a target address is known. Wire format is the
//! RFC 1928 subset this proxy speaks: no authentication, CONNECT only,
//! and no error replies — every protocol violation just drops the session
//! without writing a byte back.

use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// The only SOCKS version we speak.
pub const SOCKS_VERSION: u8 = 5;

/// METHOD octet for "no authentication required".
pub const NO_AUTHENTICATION: u8 = 0x00;

/// The command header is read in two parts; the first five bytes are
/// enough to compute the length of the rest.
const INITIAL_COMMAND_BYTES: usize = 5;

/// Reply sent once the embedded stack reports the connection established:
/// success, with the bound address and port reported as zero.
pub const SUCCESS_REPLY: [u8; 10] = [SOCKS_VERSION, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// SOCKS5 request commands.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect = 1,
    Bind = 2,
    UdpAssociate = 3,
}

impl Command {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Command::Connect),
            2 => Some(Command::Bind),
            3 => Some(Command::UdpAssociate),
            _ => None,
        }
    }

    fn name(value: u8) -> &'static str {
        match Command::from_u8(value) {
            Some(Command::Connect) => "CONNECT",
            Some(Command::Bind) => "BIND",
            Some(Command::UdpAssociate) => "UDP",
            None => "unknown",
        }
    }
}

/// SOCKS5 address types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrType {
    V4 = 1,
    Domain = 3,
    V6 = 4,
}

impl AddrType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AddrType::V4),
            3 => Some(AddrType::Domain),
            4 => Some(AddrType::V6),
            _ => None,
        }
    }

    fn name(value: u8) -> &'static str {
        match AddrType::from_u8(value) {
            Some(AddrType::V4) => "IPv4",
            Some(AddrType::Domain) => "domain name",
            Some(AddrType::V6) => "IPv6",
            None => "unknown",
        }
    }
}

/// A CONNECT target the embedded stack can dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Remote IPv4 address.
    pub addr: Ipv4Addr,
    /// Remote TCP port.
    pub port: u16,
}

impl std::fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Run the negotiation to completion and return the CONNECT target.
///
/// `buf` is the session's staging buffer; negotiation frames are read into
/// its head exactly as the pump will later read payload into it. On any
/// protocol violation the error is returned without writing reply bytes —
/// the caller drops the socket.
pub async fn negotiate<S>(stream: &mut S, buf: &mut [u8]) -> Result<ConnectTarget>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: version and method count, then the method list. The second
    // read is sized by the count byte, which is what makes the two-part
    // framing sound.
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(Error::BadVersion(buf[0]));
    }
    let method_count = buf[1] as usize;
    stream.read_exact(&mut buf[2..2 + method_count]).await?;

    if !buf[2..2 + method_count].contains(&NO_AUTHENTICATION) {
        return Err(Error::NoAcceptableAuth);
    }
    stream
        .write_all(&[SOCKS_VERSION, NO_AUTHENTICATION])
        .await?;

    // Command header, first part: enough to size the rest. Byte 3 is the
    // address type; byte 4 is the first address byte, which for domain
    // names is the length prefix.
    stream.read_exact(&mut buf[..INITIAL_COMMAND_BYTES]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(Error::BadVersion(buf[0]));
    }
    let cmd = buf[1];
    let atyp = buf[3];

    tracing::debug!(
        "command '{}' address '{}'",
        Command::name(cmd),
        AddrType::name(atyp)
    );

    // Remaining bytes beyond the initial five, per address type. The tail
    // is consumed even for requests we end up rejecting, so a client never
    // sees a mid-request hangup at an unpredictable offset.
    let tail = match AddrType::from_u8(atyp) {
        Some(AddrType::V4) => 3 + 2,
        Some(AddrType::Domain) => buf[4] as usize + 2,
        Some(AddrType::V6) => 15 + 2,
        None => return Err(Error::UnsupportedAddressType(AddrType::name(atyp).into())),
    };
    stream
        .read_exact(&mut buf[INITIAL_COMMAND_BYTES..INITIAL_COMMAND_BYTES + tail])
        .await?;

    if Command::from_u8(cmd) != Some(Command::Connect) {
        return Err(Error::UnsupportedCommand(Command::name(cmd).into()));
    }

    match AddrType::from_u8(atyp) {
        Some(AddrType::V4) => {
            let addr = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            let port = u16::from_be_bytes([buf[8], buf[9]]);
            Ok(ConnectTarget { addr, port })
        }
        Some(AddrType::Domain) => {
            let len = buf[4] as usize;
            let name = String::from_utf8_lossy(&buf[5..5 + len]).into_owned();
            // TODO: resolve via the stack's DNS once a resolver is wired in,
            // then dispatch through the IPv4 path.
            Err(Error::DomainNotResolved(name))
        }
        _ => Err(Error::UnsupportedAddressType(AddrType::name(atyp).into())),
    }
}
