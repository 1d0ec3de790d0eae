use crate::storage::{self, ByteSink, ByteSource};
use crate::tftp;
use std::fmt;
use tokio::io::AsyncWriteExt;

/// Decides what a session does with each packet its peer sends.
///
/// The processor knows nothing about sockets, timers or TIDs. Those are handled by the
/// connection handler, which only feeds it packets that came from the session's peer.
pub enum PacketProcessor {
    Read(ReadProcessor),
    Write(WriteProcessor),
}

impl PacketProcessor {
    pub fn new_for_reading(source: ByteSource) -> PacketProcessor {
        PacketProcessor::Read(ReadProcessor::new(source))
    }

    pub fn new_for_writing(sink: ByteSink) -> PacketProcessor {
        PacketProcessor::Write(WriteProcessor::new(sink))
    }

    /// The packet that opens the transfer: DATA block 1 for reads, ACK block 0 for writes.
    pub async fn first_packet(&mut self) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.next_block().await,
            PacketProcessor::Write(_) => ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 0 }),
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.process_ack(packet).await,
            PacketProcessor::Write(p) => p.process_data(packet).await,
        }
    }

    /// The last block sent (reads) or acknowledged (writes).
    pub fn block(&self) -> u16 {
        match self {
            PacketProcessor::Read(p) => p.curr_block,
            PacketProcessor::Write(p) => p.curr_block,
        }
    }

    /// Payload bytes moved so far.
    pub fn bytes_transferred(&self) -> u64 {
        match self {
            PacketProcessor::Read(p) => p.bytes_sent,
            PacketProcessor::Write(p) => p.bytes_written,
        }
    }
}

impl fmt::Debug for PacketProcessor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketProcessor::Read(p) => f
                .debug_struct("ReadProcessor")
                .field("curr_block", &p.curr_block)
                .field("final_block_sent", &p.final_block_sent)
                .finish(),
            PacketProcessor::Write(p) => f
                .debug_struct("WriteProcessor")
                .field("curr_block", &p.curr_block)
                .finish(),
        }
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response. The packet replaces the one kept for
    /// retransmission.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should retransmit the last packet it sent, byte for byte, and keep waiting.
    Resend,

    /// The transfer finished and nothing more needs to be sent.
    Complete,

    /// Caller should send the packet, after which the transfer is finished.
    TerminateWithPacket(tftp::Packet),

    /// The peer gave up on the transfer. Nothing should be sent back.
    PeerError { code: tftp::ErrorCode, message: String },

    /// The transfer failed locally. Caller should send the error packet and close.
    Fail(tftp::Packet),
}

pub struct ReadProcessor {
    source: ByteSource,
    curr_block: u16,
    final_block_sent: bool,
    bytes_sent: u64,
}

impl ReadProcessor {
    fn new(source: ByteSource) -> ReadProcessor {
        ReadProcessor {
            source,
            curr_block: 0,
            final_block_sent: false,
            bytes_sent: 0,
        }
    }

    async fn next_block(&mut self) -> ResultAction {
        match storage::read_block(&mut self.source).await {
            Ok(data) => {
                // Block numbers count modulo 2^16 so files past 32 MB keep going.
                self.curr_block = self.curr_block.wrapping_add(1);
                self.bytes_sent += data.len() as u64;
                if data.len() < tftp::DATA_BUFFER_SIZE {
                    self.final_block_sent = true;
                }
                ResultAction::SendPacketAndAwait(tftp::Packet::Data {
                    block: self.curr_block,
                    data,
                })
            }
            Err(e) => ResultAction::Fail(tftp::Packet::Error {
                code: e.kind().into(),
                message: format!("Failed to read from file: {e}"),
            }),
        }
    }

    async fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            &tftp::Packet::Ack { block } if block == self.curr_block => {
                if self.final_block_sent {
                    ResultAction::Complete
                } else {
                    self.next_block().await
                }
            }
            tftp::Packet::Error { code, message } => ResultAction::PeerError {
                code: *code,
                message: message.clone(),
            },
            // A stale ack or a stray packet. Sending the current block again lets the peer catch
            // up, and never moves the transfer forward.
            _ => ResultAction::Resend,
        }
    }
}

pub struct WriteProcessor {
    sink: ByteSink,
    curr_block: u16,
    bytes_written: u64,
}

impl WriteProcessor {
    fn new(sink: ByteSink) -> WriteProcessor {
        WriteProcessor {
            sink,
            curr_block: 0,
            bytes_written: 0,
        }
    }

    async fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        let expected = self.curr_block.wrapping_add(1);
        match packet {
            tftp::Packet::Data { block, data } if *block == expected => {
                if let Err(e) = self.sink.write_all(data).await {
                    return fail_with_io_error("Error writing to file", e);
                }
                self.curr_block = expected;
                self.bytes_written += data.len() as u64;
                let ack = tftp::Packet::Ack { block: expected };

                if data.len() < tftp::DATA_BUFFER_SIZE {
                    if let Err(e) = self.sink.shutdown().await {
                        return fail_with_io_error("Error closing file", e);
                    }
                    ResultAction::TerminateWithPacket(ack)
                } else {
                    ResultAction::SendPacketAndAwait(ack)
                }
            }
            tftp::Packet::Error { code, message } => ResultAction::PeerError {
                code: *code,
                message: message.clone(),
            },
            // Most likely a retransmission of the block we just acked, which means our ack got
            // lost. Acking it again is what gets the peer moving.
            _ => ResultAction::Resend,
        }
    }
}

fn fail_with_io_error(context: &str, e: std::io::Error) -> ResultAction {
    ResultAction::Fail(tftp::Packet::Error {
        code: e.kind().into(),
        message: format!("{context}: {e}"),
    })
}
