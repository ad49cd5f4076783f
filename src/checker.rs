// Classification of inbound datagrams against the state of a transfer.
//
// Every datagram a transfer session receives goes through `check` before the packet processor sees
// it. The checker does not touch sockets or files; it only answers "is this the packet we were
// waiting for, and if not, how wrong is it?". The session decides what to send back.

use crate::tftp::{self, OpCode, Packet};
use std::net::SocketAddr;

/// What a session is waiting for right now.
#[derive(Debug, Clone, PartialEq)]
pub struct Expectation {
    /// The peer's transfer identifier, once it is known.
    pub tid: Option<SocketAddr>,

    /// The opcode the next packet must carry.
    pub op_code: OpCode,

    /// The block number the next DATA or ACK must carry.
    pub block: u16,

    /// The highest block that is already finished. Repeats of it or of anything older are late
    /// duplicates rather than protocol violations.
    pub completed: Option<u16>,
}

/// The verdict for one datagram.
#[derive(Debug, PartialEq)]
pub enum Check {
    /// The packet is the one the session was waiting for, or an error from the peer.
    Valid(Packet),

    /// A repeat of a block that is already finished.
    Stale(Packet),

    /// The datagram came from somebody other than the peer.
    UnknownTransfer,

    /// The datagram came from the peer but breaks the protocol.
    IllegalOperation(String),
}

pub fn check(datagram: &[u8], src: SocketAddr, expected: &Expectation) -> Check {
    if let Some(tid) = expected.tid {
        if src != tid {
            return Check::UnknownTransfer;
        }
    }

    if OpCode::peek(datagram) == Some(OpCode::Data) && datagram.len() > tftp::MAX_PACKET_SIZE {
        return Check::IllegalOperation(format!(
            "DATA packet of {} bytes exceeds the {} byte limit",
            datagram.len(),
            tftp::MAX_PACKET_SIZE
        ));
    }

    let packet = match Packet::decode(datagram) {
        Ok(p) => p,
        Err(e) => return Check::IllegalOperation(e.to_string()),
    };

    // The peer may abort the transfer at any point.
    if let Packet::Error { .. } = packet {
        return Check::Valid(packet);
    }

    if packet.op_code() != expected.op_code {
        return Check::IllegalOperation(format!(
            "expected {} but received {}",
            expected.op_code,
            packet.op_code()
        ));
    }

    match packet.block() {
        Some(block) if block == expected.block => Check::Valid(packet),
        Some(block) if expected.completed.is_some_and(|done| block <= done) => Check::Stale(packet),
        Some(block) => Check::IllegalOperation(format!(
            "expected block {} but received block {block}",
            expected.block
        )),
        None => Check::Valid(packet),
    }
}
