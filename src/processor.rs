use crate::checker::Expectation;
use crate::storage::{BlockReader, BlockWriter};
use crate::tftp::{self, ErrorCode, OpCode, Packet};
use std::net::SocketAddr;
use tokio::io;

/// The IO-free half of a transfer: given a packet that passed the format checker, decides what the
/// session should do next. The sending side reads blocks and waits for acks, the receiving side
/// waits for blocks and acks them. Which role a client or server plays depends on the request.
#[derive(Debug)]
pub enum PacketProcessor {
    Send(SendProcessor),
    Receive(ReceiveProcessor),
}

impl PacketProcessor {
    pub fn sending(reader: BlockReader) -> PacketProcessor {
        PacketProcessor::Send(SendProcessor::new(reader))
    }

    pub fn receiving(writer: BlockWriter) -> PacketProcessor {
        PacketProcessor::Receive(ReceiveProcessor::new(writer))
    }

    /// The packet a server sends in reply to a request: DATA #1 for a read, ACK #0 for a write.
    pub async fn first_packet(&mut self) -> ResultAction {
        let first_packet = match self {
            PacketProcessor::Send(_) => Packet::Ack { block: 0 },
            PacketProcessor::Receive(_) => Packet::Data {
                block: 0,
                data: vec![],
            },
        };
        self.process_packet(&first_packet).await
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &Packet) -> ResultAction {
        match self {
            PacketProcessor::Send(p) => p.process_ack(packet).await,
            PacketProcessor::Receive(p) => p.process_data(packet).await,
        }
    }

    /// What the next inbound packet has to look like, given the peer's TID.
    pub fn expectation(&self, tid: Option<SocketAddr>) -> Expectation {
        match self {
            PacketProcessor::Send(p) => Expectation {
                tid,
                op_code: OpCode::Ack,
                block: p.curr_block,
                completed: p.curr_block.checked_sub(1),
            },
            PacketProcessor::Receive(p) => Expectation {
                tid,
                op_code: OpCode::Data,
                block: p.curr_block.wrapping_add(1),
                completed: if p.curr_block > 0 { Some(p.curr_block) } else { None },
            },
        }
    }

    /// Number of DATA blocks moved so far.
    pub fn blocks(&self) -> u16 {
        match self {
            PacketProcessor::Send(p) => p.curr_block,
            PacketProcessor::Receive(p) => p.curr_block,
        }
    }

    /// Number of file bytes moved so far.
    pub fn bytes(&self) -> u64 {
        match self {
            PacketProcessor::Send(p) => p.reader.bytes_read(),
            PacketProcessor::Receive(p) => p.writer.bytes_written(),
        }
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should send the packet; the transfer is complete once it is out.
    TerminateWithPacket(tftp::Packet),

    /// The transfer is complete and there is nothing left to send.
    CloseConnection,

    /// Caller should keep waiting for the next packet without sending anything.
    RetryRecv,

    /// Caller should send its last packet again and keep waiting.
    ResendLast,

    /// The peer ended the transfer with an error packet.
    PeerAborted { code: ErrorCode, message: String },

    /// The packet breaks the protocol; the peer should be told and the transfer abandoned.
    Illegal(String),

    /// Local storage failed. `notify` is sent to the peer when it is something the peer should
    /// hear about (a full disk); otherwise the failure stays local.
    StorageFailed {
        kind: io::ErrorKind,
        message: String,
        notify: Option<tftp::Packet>,
    },
}

fn storage_failure(e: io::Error, context: &str) -> ResultAction {
    let notify = match ErrorCode::from(e.kind()) {
        ErrorCode::DiskFull => Some(tftp::Packet::error(ErrorCode::DiskFull)),
        _ => None,
    };
    ResultAction::StorageFailed {
        kind: e.kind(),
        message: format!("{context}: {e}"),
        notify,
    }
}

fn too_many_blocks() -> ResultAction {
    ResultAction::StorageFailed {
        kind: io::ErrorKind::Other,
        message: "file is too large to number its blocks".to_string(),
        notify: Some(tftp::Packet::error(ErrorCode::DiskFull)),
    }
}

#[derive(Debug)]
pub struct SendProcessor {
    reader: BlockReader,
    curr_block: u16,
    awaiting_final_ack: bool,
}

impl SendProcessor {
    fn new(reader: BlockReader) -> SendProcessor {
        SendProcessor {
            reader,
            curr_block: 0,
            awaiting_final_ack: false,
        }
    }

    async fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            &tftp::Packet::Ack { block } => {
                match block {
                    block if block == self.curr_block => {
                        if self.awaiting_final_ack {
                            return ResultAction::CloseConnection;
                        }
                        let next_block = match self.curr_block.checked_add(1) {
                            Some(b) => b,
                            None => return too_many_blocks(),
                        };
                        match self.reader.read_next_block().await {
                            Ok(data) => {
                                self.curr_block = next_block;
                                if data.len() < tftp::DATA_BUFFER_SIZE {
                                    self.awaiting_final_ack = true;
                                }
                                ResultAction::SendPacketAndAwait(
                                    tftp::Packet::Data { block: self.curr_block, data }
                                )
                            },
                            Err(e) => storage_failure(e, "Failed to read from file"),
                        }
                    },
                    block if block < self.curr_block => {
                        // Acks for blocks that were already acknowledged are duplicates. Answering
                        // them would send every later block twice.
                        ResultAction::RetryRecv
                    },
                    _ => ResultAction::Illegal(format!(
                        "Cannot acknowledge a block which was not yet sent. Current block is {cb}, \
                        but received an ack for {block}",
                        cb = self.curr_block
                    )),
                }
            },
            tftp::Packet::Error { code, message } => ResultAction::PeerAborted {
                code: *code,
                message: message.clone(),
            },
            _ => ResultAction::Illegal(format!(
                "Expected to receive an Ack packet, but got {} instead",
                packet
            )),
        }
    }
}

#[derive(Debug)]
pub struct ReceiveProcessor {
    writer: BlockWriter,
    curr_block: u16,
}

impl ReceiveProcessor {
    fn new(writer: BlockWriter) -> ReceiveProcessor {
        ReceiveProcessor { writer, curr_block: 0 }
    }

    async fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Data { block, data } => {
                match *block {
                    0 if self.curr_block == 0 => {
                        ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 0 })
                    },
                    block if Some(block) == self.curr_block.checked_add(1) => {
                        match self.writer.write_next_block(data).await {
                            Ok(more_expected) => {
                                self.curr_block = block;
                                let ack = tftp::Packet::Ack { block };
                                if more_expected {
                                    ResultAction::SendPacketAndAwait(ack)
                                } else {
                                    ResultAction::TerminateWithPacket(ack)
                                }
                            },
                            Err(e) => storage_failure(e, "Error writing to file"),
                        }
                    },
                    // Our ack for this block got lost, so the sender repeated the block.
                    block if block == self.curr_block => ResultAction::ResendLast,
                    // Ignore data packets from further back that e.g. may have been duplicated
                    // in transit.
                    block if block < self.curr_block => ResultAction::RetryRecv,
                    _ => ResultAction::Illegal(format!(
                        "Data blocks must be received in sequence. \
                        Received data for block {block}, but have only received up to block {cb}.",
                        cb = self.curr_block
                    )),
                }
            },
            tftp::Packet::Error { code, message } => ResultAction::PeerAborted {
                code: *code,
                message: message.clone(),
            },
            _ => ResultAction::Illegal(format!(
                "Expected to receive a Data packet, but got {} instead",
                packet
            )),
        }
    }
}
