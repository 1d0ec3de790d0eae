use async_io::Async;
use std::error;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest payload a DATA packet may carry. Anything shorter ends the transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Opcode and block number that precede every DATA payload.
pub const DATA_HEADER_SIZE: usize = 4;

/// Receive buffer size. Requests can carry long filenames, so this is larger than a full DATA
/// packet, which also lets oversized DATA packets be told apart from full ones.
const RECV_BUFFER_SIZE: usize = 2048;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Raised when a datagram does not hold a well-formed TFTP packet.
#[derive(Debug, PartialEq)]
pub enum PacketError {
    Malformed(String),
}

impl error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::Malformed(msg) => write!(f, "Malformed packet: {msg}"),
        }
    }
}

fn malformed<T>(msg: impl Into<String>) -> PacketResult<T> {
    Err(PacketError::Malformed(msg.into()))
}

/// Represents an error returned from a datagram endpoint.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {e}"),
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

pub type PacketResult<T> = Result<T, PacketError>;

///////////////////////////////////////////////////////////////
// Packet model

/// The first two bytes of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl OpCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for OpCode {
    type Error = PacketError;

    fn try_from(raw: u16) -> PacketResult<OpCode> {
        match raw {
            1 => Ok(OpCode::Rrq),
            2 => Ok(OpCode::Wrq),
            3 => Ok(OpCode::Data),
            4 => Ok(OpCode::Ack),
            5 => Ok(OpCode::Error),
            _ => malformed(format!("Unknown opcode: {raw}")),
        }
    }
}

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
    Mail,
}

impl FileMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }

    /// Mode names are matched in any combination of case.
    pub fn parse(raw: &[u8]) -> PacketResult<FileMode> {
        match String::from_utf8_lossy(raw).to_ascii_lowercase().as_str() {
            "netascii" => Ok(FileMode::NetAscii),
            "octet" => Ok(FileMode::Octet),
            "mail" => Ok(FileMode::Mail),
            other => malformed(format!("Unknown file mode: '{other}'")),
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
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::StorageFull | io::ErrorKind::WriteZero => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
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
    WriteReq { path: String, mode: FileMode },

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
    Error { code: ErrorCode, message: String },
}

///////////////////////////////////////////////////////////////
// Wire codec. All 16-bit fields are big-endian.

fn read_u16(buf: &[u8], at: usize) -> PacketResult<u16> {
    match buf.get(at..at + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => malformed(format!(
            "Packet of {} bytes is too short to hold a 16-bit field at offset {at}",
            buf.len()
        )),
    }
}

/// Splits `buf` at its first NUL byte, dropping the terminator. `None` if there is no NUL.
fn split_nul(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let end = buf.iter().position(|&b| b == 0)?;
    Some((&buf[..end], &buf[end + 1..]))
}

pub fn decode_opcode(buf: &[u8]) -> PacketResult<OpCode> {
    OpCode::try_from(read_u16(buf, 0)?)
}

/// Returns the raw filename and mode fields of an RRQ/WRQ packet.
pub fn decode_request(buf: &[u8]) -> PacketResult<(&[u8], &[u8])> {
    let Some(body) = buf.get(2..) else {
        return malformed("Request is missing its opcode");
    };
    let Some((filename, rest)) = split_nul(body) else {
        return malformed("Request filename must be terminated with a null byte");
    };
    if filename.is_empty() {
        return malformed("Request filename is empty");
    }
    let Some((mode, _)) = split_nul(rest) else {
        return malformed("Request mode must be terminated with a null byte");
    };
    Ok((filename, mode))
}

/// Reads bytes 2-3 of an ACK or DATA packet.
pub fn decode_block_number(buf: &[u8]) -> PacketResult<u16> {
    read_u16(buf, 2)
}

pub fn decode_data(buf: &[u8]) -> PacketResult<&[u8]> {
    let Some(payload) = buf.get(DATA_HEADER_SIZE..) else {
        return malformed("Data packet is missing its block number");
    };
    if payload.len() > DATA_BUFFER_SIZE {
        return malformed(format!(
            "Data payload of {} bytes exceeds the {DATA_BUFFER_SIZE} byte block size",
            payload.len()
        ));
    }
    Ok(payload)
}

pub fn encode_data(block: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DATA_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&OpCode::Data.as_u16().to_be_bytes());
    buf.extend_from_slice(&block.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn encode_ack(block: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.extend_from_slice(&OpCode::Ack.as_u16().to_be_bytes());
    buf.extend_from_slice(&block.to_be_bytes());
    buf
}

pub fn encode_error(code: u16, message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + message.len());
    buf.extend_from_slice(&OpCode::Error.as_u16().to_be_bytes());
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(message.as_bytes());
    buf.push(0);
    buf
}

fn encode_request(opcode: OpCode, path: &str, mode: FileMode) -> Vec<u8> {
    let mode = mode.as_str();
    let mut buf = Vec::with_capacity(4 + path.len() + mode.len());
    buf.extend_from_slice(&opcode.as_u16().to_be_bytes());
    buf.extend_from_slice(path.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0);
    buf
}

fn parse_path_and_mode(buf: &[u8]) -> PacketResult<(String, FileMode)> {
    let (path, mode) = decode_request(buf)?;
    // A lossy conversion would name a different file than the one asked for.
    let path = match std::str::from_utf8(path) {
        Ok(path) => path.to_string(),
        Err(_) => return malformed("Filename is not valid UTF-8"),
    };
    Ok((path, FileMode::parse(mode)?))
}

fn parse_error(buf: &[u8]) -> PacketResult<Packet> {
    let code = ErrorCode::from(read_u16(buf, 2)?);
    let body = &buf[4..];
    // Some peers forget the terminator; the message is informational, so take what is there.
    let message = match split_nul(body) {
        Some((message, _)) => message,
        None => body,
    };
    Ok(Packet::Error {
        code,
        message: String::from_utf8_lossy(message).into_owned(),
    })
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> PacketResult<Packet> {
        match decode_opcode(buf)? {
            OpCode::Rrq => {
                let (path, mode) = parse_path_and_mode(buf)?;
                Ok(Packet::ReadReq { path, mode })
            }
            OpCode::Wrq => {
                let (path, mode) = parse_path_and_mode(buf)?;
                Ok(Packet::WriteReq { path, mode })
            }
            OpCode::Data => Ok(Packet::Data {
                block: decode_block_number(buf)?,
                data: decode_data(buf)?.to_vec(),
            }),
            OpCode::Ack => Ok(Packet::Ack {
                block: decode_block_number(buf)?,
            }),
            OpCode::Error => parse_error(buf),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::ReadReq { path, mode } => encode_request(OpCode::Rrq, path, *mode),
            Packet::WriteReq { path, mode } => encode_request(OpCode::Wrq, path, *mode),
            Packet::Data { block, data } => encode_data(*block, data),
            Packet::Ack { block } => encode_ack(*block),
            Packet::Error { code, message } => encode_error(code.as_u16(), message),
        }
    }
}

///////////////////////////////////////////////////////////////
// Datagram endpoints

/// A datagram endpoint a session exchanges raw packets over.
///
/// Received datagrams are handed back undecoded together with their source, so the caller can
/// check the sender before trusting the contents.
pub trait Endpoint {
    fn send(&mut self, buf: &[u8], dst: SocketAddr) -> impl Future<Output = io::Result<()>> + Send;

    fn recv_with_timeout(
        &mut self,
        ttl: Duration,
    ) -> impl Future<Output = Result<(Vec<u8>, SocketAddr), SocketError>> + Send;
}

/// Wrapper around a UDP socket for sending and receiving TFTP datagrams.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }

    pub async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<()> {
        self.sock.send_to(buf, dst).await?;
        Ok(())
    }

    pub async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0; RECV_BUFFER_SIZE];
        let (len, src) = self.sock.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((buf, src))
    }
}

impl Endpoint for TftpSocket {
    async fn send(&mut self, buf: &[u8], dst: SocketAddr) -> io::Result<()> {
        self.send_to(buf, dst).await
    }

    async fn recv_with_timeout(&mut self, ttl: Duration) -> Result<(Vec<u8>, SocketAddr), SocketError> {
        Ok(timeout(ttl, self.recv_from()).await??)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F, 0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00,
            // mode: octet
            0x6F, 0x63, 0x74, 0x65, 0x74, 0x00];

        let packet = Packet::parse_from_buf(&buf);
        assert_eq!(packet, Ok(Packet::ReadReq { path: "/path/to/data.txt".to_string(), mode: FileMode::Octet }));
        assert_eq!(packet.unwrap().to_bytes(), buf);
    }

    #[test]
    fn test_packet_write_req_mode_is_case_insensitive() {
        let buf = b"\x00\x02upload.bin\x00NetASCII\x00".to_vec();
        assert_eq!(
            Packet::parse_from_buf(&buf),
            Ok(Packet::WriteReq { path: "upload.bin".to_string(), mode: FileMode::NetAscii })
        );
    }

    #[test]
    fn test_decode_request_fields() {
        let buf = b"\x00\x01boot/pxelinux.0\x00octet\x00";
        assert_eq!(decode_opcode(buf), Ok(OpCode::Rrq));
        assert_eq!(decode_request(buf), Ok((&b"boot/pxelinux.0"[..], &b"octet"[..])));
    }

    #[test]
    fn test_decode_request_ignores_trailing_bytes() {
        // Option extensions follow the mode; they are not negotiated and are skipped.
        let buf = b"\x00\x01file\x00octet\x00blksize\x001428\x00";
        assert_eq!(decode_request(buf), Ok((&b"file"[..], &b"octet"[..])));
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![
            // opcode
            0x00, 0x03,
            // block number
            0x12, 0x34,
            // data
            0xDE, 0xAD, 0xBE, 0xEF];

        assert_eq!(decode_block_number(&buf), Ok(0x1234));
        assert_eq!(decode_data(&buf), Ok(&[0xDE, 0xAD, 0xBE, 0xEF][..]));
        assert_eq!(
            Packet::parse_from_buf(&buf),
            Ok(Packet::Data { block: 0x1234, data: vec![0xDE, 0xAD, 0xBE, 0xEF] })
        );
    }

    #[test]
    fn test_packet_parses_empty_data() {
        assert_eq!(
            Packet::parse_from_buf(&[0x00, 0x03, 0x00, 0x07]),
            Ok(Packet::Data { block: 7, data: vec![] })
        );
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        assert_eq!(Packet::parse_from_buf(&buf), Ok(Packet::Ack { block: 0x102f }));
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05,
            // Error code
            0x00, 0x04,
            // Error message: Illegal! with terminating nullchar
            0x49, 0x6C, 0x6C, 0x65, 0x67, 0x61, 0x6C, 0x21, 0x00];

        assert_eq!(
            Packet::parse_from_buf(&buf),
            Ok(Packet::Error { code: ErrorCode::Illegal, message: "Illegal!".to_string() })
        );
    }

    #[test]
    fn test_packet_parses_unterminated_error() {
        assert_eq!(
            Packet::parse_from_buf(b"\x00\x05\x00\x63oops"),
            Ok(Packet::Error { code: ErrorCode::Undefined, message: "oops".to_string() })
        );
    }

    #[test]
    fn test_encode_data() {
        assert_eq!(encode_data(2, b"abc"), vec![0x00, 0x03, 0x00, 0x02, b'a', b'b', b'c']);
        assert_eq!(encode_data(0xFFFF, &[]), vec![0x00, 0x03, 0xFF, 0xFF]);
    }

    #[test]
    fn test_encode_ack() {
        assert_eq!(encode_ack(0), vec![0x00, 0x04, 0x00, 0x00]);
        assert_eq!(encode_ack(0x0102), vec![0x00, 0x04, 0x01, 0x02]);
    }

    #[test]
    fn test_encode_error_appends_single_nul() {
        let buf = encode_error(ErrorCode::FileNotFound.as_u16(), "missing");
        assert_eq!(&buf[..4], &[0x00, 0x05, 0x00, 0x01]);
        assert_eq!(&buf[4..], b"missing\x00");
        assert_eq!(buf.iter().filter(|&&b| b == 0).count(), 3);
    }

    #[test]
    fn test_packet_parse_failures() {
        // Too short for an opcode
        assert!(decode_opcode(&[]).is_err());
        assert!(Packet::parse_from_buf(&[0x10]).is_err());
        // Invalid opcodes
        assert!(Packet::parse_from_buf(&[0x10, 0x00]).is_err());
        assert!(Packet::parse_from_buf(&[0x00, 0x09]).is_err());
        // Unterminated read path
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69]).is_err());
        // Missing mode string
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00]).is_err());
        // Unterminated mode string
        assert!(Packet::parse_from_buf(b"\x00\x01hi\x00octet").is_err());
        // Empty filename
        assert!(Packet::parse_from_buf(b"\x00\x01\x00octet\x00").is_err());
        // Invalid mode string
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x62, 0x61, 0x64, 0x00]).is_err());
        // Ack and data without a full block number
        assert!(Packet::parse_from_buf(&[0x00, 0x04, 0x01]).is_err());
        assert!(Packet::parse_from_buf(&[0x00, 0x03]).is_err());
    }

    #[test]
    fn test_non_utf8_filename_is_malformed() {
        let rrq = b"\x00\x01boot\xff\xfe.img\x00octet\x00";
        assert_eq!(
            Packet::parse_from_buf(rrq),
            Err(PacketError::Malformed("Filename is not valid UTF-8".to_string()))
        );
        let wrq = b"\x00\x02\xc3\x28\x00octet\x00";
        assert!(matches!(Packet::parse_from_buf(wrq), Err(PacketError::Malformed(_))));

        // The raw fields are still there for anyone who wants the bytes.
        assert_eq!(decode_request(rrq), Ok((&b"boot\xff\xfe.img"[..], &b"octet"[..])));
    }

    #[test]
    fn test_oversized_data_is_malformed() {
        let buf = encode_data(1, &[0x55; DATA_BUFFER_SIZE + 1]);
        assert!(matches!(decode_data(&buf), Err(PacketError::Malformed(_))));

        let buf = encode_data(1, &[0x55; DATA_BUFFER_SIZE]);
        assert_eq!(decode_data(&buf).map(<[u8]>::len), Ok(DATA_BUFFER_SIZE));
    }

    #[test]
    fn test_error_code_from_io_kind() {
        assert_eq!(ErrorCode::from(io::ErrorKind::NotFound), ErrorCode::FileNotFound);
        assert_eq!(ErrorCode::from(io::ErrorKind::PermissionDenied), ErrorCode::AccessViolation);
        assert_eq!(ErrorCode::from(io::ErrorKind::AlreadyExists), ErrorCode::FileAlreadyExists);
        assert_eq!(ErrorCode::from(io::ErrorKind::Interrupted), ErrorCode::Undefined);
    }

    #[tokio::test]
    async fn test_socket_send_and_recv() {
        let mut a = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let mut b = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send(&encode_ack(3), b_addr).await.unwrap();
        let (buf, src) = b.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(buf, encode_ack(3));
        assert_eq!(src, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_socket_recv_times_out() {
        let mut sock = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let result = sock.recv_with_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(SocketError::Timeout(_))));
    }
}
