use async_io::Async;
use rand::Rng;
use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Payload size of a full DATA block. Anything shorter ends the transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Largest legal datagram: a full DATA block plus its 4-byte header.
pub const MAX_PACKET_SIZE: usize = DATA_BUFFER_SIZE + 4;

// Bigger than any legal datagram so that oversize packets are seen whole and rejected rather than
// silently truncated into something that parses.
const RECV_BUFFER_SIZE: usize = 2048;

const EPHEMERAL_BIND_ATTEMPTS: usize = 16;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// A structural problem with a datagram that prevents it from being decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatError(pub String);

impl FormatError {
    fn new(reason: impl Into<String>) -> FormatError {
        FormatError(reason.into())
    }
}

impl error::Error for FormatError {}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "malformed packet: {}", self.0)
    }
}

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(FormatError),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {}", e),
            SocketError::Timeout(_) => write!(f, "Socket IO timeout"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

impl From<FormatError> for SocketError {
    fn from(e: FormatError) -> Self {
        SocketError::PacketParse(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

///////////////////////////////////////////////////////////////
// Protocol vocabulary

/// Represents the mode for a file the client wishes to read or write. Only `Octet` is served, the
/// others are recognised so that they can be refused with a proper error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
    Mail,
}

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

impl FromStr for FileMode {
    type Err = FormatError;

    fn from_str(raw: &str) -> Result<FileMode, FormatError> {
        match raw.to_lowercase().as_str() {
            "netascii" => Ok(FileMode::NetAscii),
            "octet" => Ok(FileMode::Octet),
            "mail" => Ok(FileMode::Mail),
            _ => Err(FormatError::new(format!("unknown file mode '{raw}'"))),
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    Illegal = 4,
    UnknownTid = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    pub fn from_u16(raw: u16) -> Option<ErrorCode> {
        match raw {
            0 => Some(ErrorCode::Undefined),
            1 => Some(ErrorCode::FileNotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::Illegal),
            5 => Some(ErrorCode::UnknownTid),
            6 => Some(ErrorCode::FileAlreadyExists),
            7 => Some(ErrorCode::NoSuchUser),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// The stock human-readable text for this code.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::Undefined => "Not defined, see error message (if any).",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "Disk full or allocation exceeded.",
            ErrorCode::Illegal => "Illegal TFTP operation.",
            ErrorCode::UnknownTid => "Unknown transfer ID.",
            ErrorCode::FileAlreadyExists => "File already exists.",
            ErrorCode::NoSuchUser => "No such user.",
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::StorageFull => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

/// The opcode carried in the first two bytes of every TFTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl OpCode {
    pub fn from_u16(raw: u16) -> Option<OpCode> {
        match raw {
            1 => Some(OpCode::Rrq),
            2 => Some(OpCode::Wrq),
            3 => Some(OpCode::Data),
            4 => Some(OpCode::Ack),
            5 => Some(OpCode::Error),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Reads the opcode of a raw datagram without decoding the rest of it.
    pub fn peek(buf: &[u8]) -> Option<OpCode> {
        if buf.len() < 2 {
            return None;
        }
        OpCode::from_u16(u16_from_buffer(buf))
    }

    pub fn is_request(self) -> bool {
        matches!(self, OpCode::Rrq | OpCode::Wrq)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OpCode::Rrq => "RRQ",
            OpCode::Wrq => "WRQ",
            OpCode::Data => "DATA",
            OpCode::Ack => "ACK",
            OpCode::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Splits a 0-terminated string off the front of `buf`.
///
/// Returns the string and whatever follows its terminator, or `None` when no terminator exists.
fn take_string(buf: &[u8]) -> Result<Option<(String, &[u8])>, FormatError> {
    let end = match buf.iter().position(|&b| b == 0x00) {
        Some(end) => end,
        None => return Ok(None),
    };
    let s = String::from_utf8(buf[..end].to_vec())
        .map_err(|_| FormatError::new("string field is not valid text"))?;
    Ok(Some((s, &buf[end + 1..])))
}

fn parse_path_and_mode(buf: &[u8]) -> Result<(String, FileMode), FormatError> {
    let (path, rest) = take_string(buf)?
        .ok_or_else(|| FormatError::new("request filename is not terminated"))?;

    if path.is_empty() {
        return Err(FormatError::new("request does not name a file"));
    }

    let (raw_mode, rest) = take_string(rest)?
        .ok_or_else(|| FormatError::new("mode must be terminated with a null byte"))?;

    if !rest.is_empty() {
        return Err(FormatError::new(format!(
            "{} unexpected bytes after the mode terminator",
            rest.len()
        )));
    }

    Ok((path, raw_mode.parse()?))
}

fn parse_data(buf: &[u8]) -> Result<Packet, FormatError> {
    if buf.len() < 4 {
        return Err(FormatError::new("data packet has no block number"));
    }
    if buf.len() > MAX_PACKET_SIZE {
        return Err(FormatError::new(format!(
            "data packet is {} bytes, the limit is {MAX_PACKET_SIZE}",
            buf.len()
        )));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data { block, data: Vec::from(&buf[4..]) })
}

fn parse_ack(buf: &[u8]) -> Result<Packet, FormatError> {
    if buf.len() != 4 {
        return Err(FormatError::new(format!("ack packet must be 4 bytes, got {}", buf.len())));
    }
    Ok(Packet::Ack { block: u16_from_buffer(&buf[2..4]) })
}

fn parse_error(buf: &[u8]) -> Result<Packet, FormatError> {
    if buf.len() < 5 {
        return Err(FormatError::new("error packet is too short"));
    }

    let raw_code = u16_from_buffer(&buf[2..4]);
    let code = ErrorCode::from_u16(raw_code)
        .ok_or_else(|| FormatError::new(format!("error code {raw_code} is out of range")))?;

    let (message, rest) = take_string(&buf[4..])?
        .ok_or_else(|| FormatError::new("error message is not terminated"))?;

    if !rest.is_empty() {
        return Err(FormatError::new("unexpected bytes after the error message"));
    }

    Ok(Packet::Error { code, message })
}

impl Packet {
    /// Builds an error packet carrying the stock message for `code`.
    pub fn error(code: ErrorCode) -> Packet {
        Packet::Error { code, message: code.default_message().to_string() }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// The block number of DATA and ACK packets.
    pub fn block(&self) -> Option<u16> {
        match self {
            Packet::Data { block, .. } | Packet::Ack { block } => Some(*block),
            _ => None,
        }
    }

    /// Decodes a datagram, rejecting anything that does not follow the RFC 1350 layout exactly.
    pub fn decode(buf: &[u8]) -> Result<Packet, FormatError> {
        if buf.len() < 2 {
            return Err(FormatError::new("packet too short to hold an opcode"));
        }

        let raw_op = u16_from_buffer(buf);
        let op = OpCode::from_u16(raw_op)
            .ok_or_else(|| FormatError::new(format!("unknown opcode {raw_op}")))?;

        match op {
            OpCode::Rrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode })
            }
            OpCode::Wrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode })
            }
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        buf.extend_from_slice(&self.op_code().as_u16().to_be_bytes());

        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                buf.extend_from_slice(path.as_bytes());
                buf.push(0x00);
                buf.extend_from_slice(mode.as_str().as_bytes());
                buf.push(0x00);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
            }
        }

        buf
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Packet::ReadReq { path, mode } => write!(f, "RRQ '{}' ({})", path, mode.as_str()),
            Packet::WriteReq { path, mode } => write!(f, "WRQ '{}' ({})", path, mode.as_str()),
            Packet::Data { block, data } => write!(f, "DATA #{} ({} bytes)", block, data.len()),
            Packet::Ack { block } => write!(f, "ACK #{}", block),
            Packet::Error { code, message } => {
                write!(f, "ERROR {} ({:?}): {}", code.as_u16(), code, message)
            }
        }
    }
}

/// Renders a datagram as space separated hex for trace logs.
pub fn hex(buf: &[u8]) -> String {
    buf.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

/// The wildcard address of the same family as `peer`.
pub fn unspecified_for(peer: SocketAddr) -> IpAddr {
    match peer {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
#[derive(Debug)]
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    /// Binds a fresh transfer identifier: a randomly chosen port on `ip`, falling back to whatever
    /// the OS hands out if the random picks keep colliding.
    pub fn bind_ephemeral(ip: IpAddr) -> TftpResult<TftpSocket> {
        let mut rng = rand::thread_rng();
        for _ in 0..EPHEMERAL_BIND_ATTEMPTS {
            let port = rng.gen_range(1024..65535);
            match TftpSocket::bind((ip, port).into()) {
                Ok(sock) => return Ok(sock),
                Err(e) => log::warn!("Couldn't bind socket on port {port}: {e}"),
            }
        }
        TftpSocket::bind((ip, 0).into())
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        log::debug!("-> {dst}: {packet}");
        self.send_raw(&packet.encode(), dst).await
    }

    pub async fn send_raw(&self, buf: &[u8], dst: SocketAddr) -> TftpResult<()> {
        log::trace!("-> {dst}: [{}]", hex(buf));
        self.sock.send_to(buf, dst).await?;
        Ok(())
    }

    /// Receives one datagram without interpreting it.
    pub async fn recv_raw_with_timeout(&self, ttl: Duration) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = [0; RECV_BUFFER_SIZE];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;
        log::trace!("<- {src}: [{}]", hex(&buf[..total_written]));
        Ok((buf[..total_written].to_vec(), src))
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        let (buf, src) = self.recv_raw_with_timeout(ttl).await?;
        let packet = Packet::decode(&buf)?;
        log::debug!("<- {src}: {packet}");
        Ok((packet, src))
    }
}
