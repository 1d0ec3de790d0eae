// This module contains the server-side connection handler, one per client request.
//
// A handler is created from the raw request datagram the listener received, the address it came
// from and a fresh endpoint reserved for this client. It works in roughly the following stages:
//
// 1. Decode the request and check whether it can be serviced by asking storage for the file.
//    Requests that cannot be serviced are answered with a single error packet and dropped.
// 2. Enter the lockstep phase. Every packet sent is kept in its encoded form until the peer
//    answers it, and the same bytes go out again when the answer does not come in time or when
//    the peer answers with something that does not move the transfer forward.
// 3. Stop when the final block has been exchanged, the peer reports an error, or the peer stays
//    silent through every retry.
//
// What to do with a packet from the peer is decided by the PacketProcessor. This module owns the
// timing, the retry budget and the transfer identifier (TID) check: the peer's address and port
// are fixed by the request, and packets from any other source are dropped without a reply.

use crate::processor::{PacketProcessor, ResultAction};
use crate::storage::Storage;
use crate::tftp::{self, Endpoint, SocketError};
use std::error;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Per-session timing and policy.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// How long to wait for an answer after each (re)send.
    pub timeout: Duration,

    /// How many times a packet is retransmitted after timing out before the peer is given up on.
    pub max_retries: u32,

    /// Refuse write requests.
    pub read_only: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            read_only: false,
        }
    }
}

/// Where a session stands. Dispatching the request happens in `ServerRequestHandler::new`, so a
/// handler always starts out sending or receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Serving a read request: we send DATA, the peer sends ACK.
    Sending,
    /// Serving a write request: the peer sends DATA, we send ACK.
    Receiving,
    Done,
    Failed,
}

/// What a finished transfer moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub filename: String,
    pub bytes: u64,
    /// Packets sent again because of a timeout or an unexpected answer.
    pub retransmissions: u32,
}

/// An object responsible for handling a request.
pub struct ServerRequestHandler<E> {
    /// The endpoint used to send and receive packets for this session only.
    sock: E,

    /// The address to send packets to, and the only one packets are accepted from.
    dst: SocketAddr,

    /// The packet processor.
    processor: PacketProcessor,

    settings: SessionSettings,
    state: SessionState,
    filename: String,
    retransmissions: u32,
}

async fn send_error_packet<E: Endpoint>(
    sock: &mut E,
    dst: SocketAddr,
    code: tftp::ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    if let Err(e) = sock.send(&tftp::encode_error(code.as_u16(), &message), dst).await {
        log::debug!("Could not deliver error packet to {dst}: {e}");
    }
}

/// Only octet transfers are supported. Netascii is served byte for byte, which is what most
/// clients that default to it actually want.
async fn check_mode<E: Endpoint>(
    sock: &mut E,
    dst: SocketAddr,
    mode: tftp::FileMode,
) -> Result<(), SessionError> {
    match mode {
        tftp::FileMode::Octet | tftp::FileMode::NetAscii => Ok(()),
        tftp::FileMode::Mail => {
            send_error_packet(
                sock,
                dst,
                tftp::ErrorCode::Undefined,
                "Support for mail mode is unimplemented".to_string(),
            )
            .await;
            Err(SessionError::Rejected(
                "Peer requested mail mode, which is unsupported".to_string(),
            ))
        }
    }
}

impl<E: Endpoint> ServerRequestHandler<E> {
    /// Dispatches the initial request. Failures have already been reported to the peer when this
    /// returns an error.
    pub async fn new<S: Storage>(
        storage: &S,
        request: &[u8],
        src: SocketAddr,
        mut sock: E,
        settings: SessionSettings,
    ) -> Result<ServerRequestHandler<E>, SessionError> {
        let request = match tftp::Packet::parse_from_buf(request) {
            Ok(p) => p,
            Err(e) => {
                send_error_packet(&mut sock, src, tftp::ErrorCode::Illegal, e.to_string()).await;
                return Err(SessionError::MalformedRequest(e));
            }
        };

        let (filename, processor, state) = match request {
            tftp::Packet::ReadReq { path, mode } => {
                log::info!("Read request for '{path}' ({}) from {src}", mode.as_str());
                check_mode(&mut sock, src, mode).await?;

                match storage.open_read(&path).await {
                    Ok(source) => (path, PacketProcessor::new_for_reading(source), SessionState::Sending),
                    Err(e) => {
                        // Whatever went wrong, the peer only learns that the file is not there.
                        send_error_packet(
                            &mut sock,
                            src,
                            tftp::ErrorCode::FileNotFound,
                            format!("Requested file: '{path}' not found."),
                        )
                        .await;
                        return Err(SessionError::from_open_error(e));
                    }
                }
            }
            tftp::Packet::WriteReq { path, mode } => {
                log::info!("Write request for '{path}' ({}) from {src}", mode.as_str());
                if settings.read_only {
                    send_error_packet(
                        &mut sock,
                        src,
                        tftp::ErrorCode::AccessViolation,
                        "This server does not accept uploads".to_string(),
                    )
                    .await;
                    return Err(SessionError::Rejected(format!("Write of '{path}' refused, server is read-only")));
                }
                check_mode(&mut sock, src, mode).await?;

                match storage.open_write(&path).await {
                    Ok(sink) => (path, PacketProcessor::new_for_writing(sink), SessionState::Receiving),
                    Err(e) => {
                        send_error_packet(&mut sock, src, e.kind().into(), format!("Cannot write '{path}': {e}")).await;
                        return Err(SessionError::from_open_error(e));
                    }
                }
            }
            _ => {
                return Err(SessionError::Rejected(
                    "Only read and write requests are valid initial requests.".to_string(),
                ))
            }
        };

        Ok(ServerRequestHandler {
            sock,
            dst: src,
            processor,
            settings,
            state,
            filename,
            retransmissions: 0,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Does the work of sending and receiving data over the connection until the connection closes
    pub async fn handle(&mut self) -> Result<TransferSummary, SessionError> {
        let result = self.exchange().await;
        self.state = match result {
            Ok(_) => SessionState::Done,
            Err(_) => SessionState::Failed,
        };
        result
    }

    async fn exchange(&mut self) -> Result<TransferSummary, SessionError> {
        // The last packet sent, exactly as it went on the wire. Retransmissions reuse these bytes
        // and never rebuild the packet.
        let mut out_packet: Vec<u8> = Vec::new();
        let mut retries = 0;
        let mut action = self.processor.first_packet().await;

        loop {
            match action {
                ResultAction::SendPacketAndAwait(p) => {
                    out_packet = p.to_bytes();
                    retries = 0;
                }
                ResultAction::Resend => {
                    self.retransmissions += 1;
                }
                ResultAction::Complete => return Ok(self.summary()),
                ResultAction::TerminateWithPacket(p) => {
                    self.sock.send(&p.to_bytes(), self.dst).await?;
                    return Ok(self.summary());
                }
                ResultAction::PeerError { code, message } => {
                    return Err(SessionError::PeerAborted { code, message });
                }
                ResultAction::Fail(p) => {
                    if let Err(e) = self.sock.send(&p.to_bytes(), self.dst).await {
                        log::debug!("Could not deliver error packet to {}: {e}", self.dst);
                    }
                    let reason = match p {
                        tftp::Packet::Error { message, .. } => message,
                        other => format!("{other:?}"),
                    };
                    return Err(SessionError::Storage(reason));
                }
            }

            log::debug!(
                "Sending {} bytes to {} (block {})",
                out_packet.len(),
                self.dst,
                self.processor.block()
            );
            self.sock.send(&out_packet, self.dst).await?;
            action = self.await_reply(&mut retries).await?;
        }
    }

    /// Waits for the peer to answer the packet just sent and hands the answer to the processor.
    ///
    /// A timeout spends one retry and asks for a resend. Packets from other sources are dropped
    /// and the wait goes on against the same deadline, so they can neither stall nor speed up
    /// the session.
    async fn await_reply(&mut self, retries: &mut u32) -> Result<ResultAction, SessionError> {
        let deadline = Instant::now() + self.settings.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.sock.recv_with_timeout(remaining).await {
                Ok((buf, src)) => {
                    if src != self.dst {
                        log::warn!("Dropping packet from {src}, this session belongs to {}", self.dst);
                        continue;
                    }
                    return match tftp::Packet::parse_from_buf(&buf) {
                        Ok(packet) => {
                            log::debug!("Got packet from {src}: {packet:?}");
                            Ok(self.processor.process_packet(&packet).await)
                        }
                        Err(e) => {
                            log::warn!("Discarding packet from {src}: {e}");
                            Ok(ResultAction::Resend)
                        }
                    };
                }
                // If we timed out, rebroadcast the last sent packet
                Err(SocketError::Timeout(_)) => {
                    *retries += 1;
                    if *retries > self.settings.max_retries {
                        return Err(SessionError::PeerUnresponsive {
                            block: self.processor.block(),
                            attempts: *retries,
                        });
                    }
                    log::info!(
                        "Timed out waiting for {}, trying again ({}/{})",
                        self.dst,
                        retries,
                        self.settings.max_retries
                    );
                    return Ok(ResultAction::Resend);
                }
                Err(SocketError::IO(e)) => return Err(SessionError::Socket(e)),
            }
        }
    }

    fn summary(&self) -> TransferSummary {
        TransferSummary {
            filename: self.filename.clone(),
            bytes: self.processor.bytes_transferred(),
            retransmissions: self.retransmissions,
        }
    }
}

/// Runs one session from its request datagram to the end of the transfer.
pub async fn run_session<S: Storage, E: Endpoint>(
    storage: &S,
    request: &[u8],
    src: SocketAddr,
    sock: E,
    settings: SessionSettings,
) -> Result<TransferSummary, SessionError> {
    let mut handler = ServerRequestHandler::new(storage, request, src, sock, settings).await?;
    handler.handle().await
}

#[derive(Debug)]
pub enum SessionError {
    MalformedRequest(tftp::PacketError),
    Rejected(String),
    FileNotFound(io::Error),
    AccessDenied(io::Error),
    Storage(String),
    PeerUnresponsive { block: u16, attempts: u32 },
    PeerAborted { code: tftp::ErrorCode, message: String },
    Socket(io::Error),
}

impl SessionError {
    fn from_open_error(e: io::Error) -> SessionError {
        match e.kind() {
            io::ErrorKind::NotFound => SessionError::FileNotFound(e),
            _ => SessionError::AccessDenied(e),
        }
    }
}

impl error::Error for SessionError {}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MalformedRequest(e) => write!(f, "Invalid request: {e}"),
            Self::Rejected(msg) => write!(f, "Request rejected: {msg}"),
            Self::FileNotFound(e) => write!(f, "File not found: {e}"),
            Self::AccessDenied(e) => write!(f, "Access denied: {e}"),
            Self::Storage(msg) => write!(f, "File IO error: {msg}"),
            Self::PeerUnresponsive { block, attempts } => {
                write!(f, "Peer stopped responding at block {block} after {attempts} timeouts")
            }
            Self::PeerAborted { code, message } => {
                write!(f, "Peer aborted the transfer: {code:?}, '{message}'")
            }
            Self::Socket(e) => write!(f, "Socket IO error: {e}"),
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> SessionError {
        SessionError::Socket(e)
    }
}
