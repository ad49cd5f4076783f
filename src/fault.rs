// Fault plans for the error simulator.
//
// A plan names one kind of fault and the packet it targets (an opcode, plus a block number for
// DATA and ACK). The proxy asks the plan about every datagram it relays; the plan answers whether
// the fault fires for that datagram and keeps count so that a fault does not fire more often than
// it was asked to. Each proxy session gets its own copy of the plan.

use crate::tftp::{OpCode, DATA_BUFFER_SIZE, MAX_PACKET_SIZE};
use std::error;
use std::fmt;
use std::time::Duration;

/// Ways of making a packet unacceptable to its receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Corruption {
    /// Remove the filename of a request.
    Filename,
    /// Replace the transfer mode of a request with one nobody supports.
    Mode,
    /// Overwrite the final zero byte of a request or error packet.
    Terminator,
    /// Move the block number of a DATA or ACK one ahead.
    BlockNumber,
    /// Swap the opcode for one the receiver is not waiting for.
    OpCode,
    /// Pad the datagram past the largest legal TFTP packet.
    Length,
}

impl Corruption {
    pub fn applies_to(self, op_code: OpCode) -> bool {
        match self {
            Corruption::Filename | Corruption::Mode => op_code.is_request(),
            Corruption::Terminator => op_code.is_request() || op_code == OpCode::Error,
            Corruption::BlockNumber => matches!(op_code, OpCode::Data | OpCode::Ack),
            Corruption::OpCode => op_code != OpCode::Error,
            Corruption::Length => true,
        }
    }

    /// Returns a mangled copy of `datagram`.
    pub fn apply(self, datagram: &[u8]) -> Vec<u8> {
        if datagram.len() < 4 {
            return datagram.to_vec();
        }
        match self {
            Corruption::Filename => {
                let name_end = terminator_after(datagram, 2).unwrap_or(datagram.len());
                let mut out = datagram[..2].to_vec();
                out.extend_from_slice(&datagram[name_end..]);
                out
            }
            Corruption::Mode => match terminator_after(datagram, 2) {
                Some(name_end) => {
                    let mut out = datagram[..=name_end].to_vec();
                    out.extend_from_slice(b"invalid\0");
                    out
                }
                None => datagram.to_vec(),
            },
            Corruption::Terminator => {
                let mut out = datagram.to_vec();
                if let Some(last) = out.last_mut() {
                    *last = b'A';
                }
                out
            }
            Corruption::BlockNumber => {
                let mut out = datagram.to_vec();
                let block = u16::from_be_bytes([out[2], out[3]]).wrapping_add(1);
                out[2..4].copy_from_slice(&block.to_be_bytes());
                out
            }
            Corruption::OpCode => {
                let swapped = match OpCode::peek(datagram) {
                    Some(OpCode::Rrq) => OpCode::Ack,
                    Some(OpCode::Wrq) => OpCode::Data,
                    Some(OpCode::Data) => OpCode::Ack,
                    Some(OpCode::Ack) => OpCode::Rrq,
                    _ => return datagram.to_vec(),
                };
                let mut out = datagram.to_vec();
                out[..2].copy_from_slice(&swapped.as_u16().to_be_bytes());
                out
            }
            Corruption::Length => {
                let mut out = datagram.to_vec();
                let target = (MAX_PACKET_SIZE + 1).max(out.len() + DATA_BUFFER_SIZE);
                out.resize(target, 0);
                out
            }
        }
    }
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Corruption::Filename => "filename",
            Corruption::Mode => "mode",
            Corruption::Terminator => "terminator",
            Corruption::BlockNumber => "block number",
            Corruption::OpCode => "opcode",
            Corruption::Length => "length",
        };
        write!(f, "{name}")
    }
}

fn terminator_after(datagram: &[u8], start: usize) -> Option<usize> {
    datagram[start..].iter().position(|b| *b == 0).map(|i| start + i)
}

/// What happens to a targeted packet.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FaultKind {
    /// Relay everything untouched.
    None,
    /// Relay a corrupted copy instead of the packet.
    Corrupt(Corruption),
    /// Also send a copy of the packet from a port the receiver has never seen.
    UnknownTid,
    /// Drop the packet.
    Lose,
    /// Hold the packet back for the given time.
    Delay(Duration),
    /// Send the packet twice.
    Duplicate,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FaultKind::None => write!(f, "no fault"),
            FaultKind::Corrupt(c) => write!(f, "corrupt {c}"),
            FaultKind::UnknownTid => write!(f, "unknown TID"),
            FaultKind::Lose => write!(f, "lose"),
            FaultKind::Delay(d) => write!(f, "delay {}ms", d.as_millis()),
            FaultKind::Duplicate => write!(f, "duplicate"),
        }
    }
}

/// The packet a fault is aimed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultTarget {
    pub op_code: OpCode,
    /// Only meaningful for DATA and ACK; `None` matches any block.
    pub block: Option<u16>,
}

impl FaultTarget {
    pub fn new(op_code: OpCode, block: Option<u16>) -> FaultTarget {
        FaultTarget { op_code, block }
    }

    pub fn matches(&self, datagram: &[u8]) -> bool {
        if OpCode::peek(datagram) != Some(self.op_code) {
            return false;
        }
        match (self.op_code, self.block) {
            (OpCode::Data | OpCode::Ack, Some(block)) => {
                datagram.len() >= 4 && u16::from_be_bytes([datagram[2], datagram[3]]) == block
            }
            _ => true,
        }
    }
}

impl fmt::Display for FaultTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.block {
            Some(block) => write!(f, "{} #{block}", self.op_code),
            None => write!(f, "{}", self.op_code),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FaultPlan {
    pub kind: FaultKind,
    pub target: FaultTarget,
    /// How many times a loss fires. Every other kind fires once.
    pub occurrences: u32,
    /// Fire on every n-th matching packet rather than on each one.
    pub every: u32,
    matches_seen: u32,
    fired: u32,
}

impl FaultPlan {
    pub fn new(kind: FaultKind, target: FaultTarget) -> FaultPlan {
        FaultPlan {
            kind,
            target,
            occurrences: 1,
            every: 1,
            matches_seen: 0,
            fired: 0,
        }
    }

    pub fn none() -> FaultPlan {
        FaultPlan::new(FaultKind::None, FaultTarget::new(OpCode::Data, None))
    }

    pub fn with_occurrences(mut self, occurrences: u32) -> FaultPlan {
        self.occurrences = occurrences;
        self
    }

    pub fn with_every(mut self, every: u32) -> FaultPlan {
        self.every = every;
        self
    }

    pub fn validate(&self) -> Result<(), FaultPlanError> {
        if self.kind == FaultKind::None {
            return Ok(());
        }
        if self.occurrences == 0 {
            return Err(FaultPlanError::new("occurrences must be at least 1"));
        }
        if self.every == 0 {
            return Err(FaultPlanError::new("every must be at least 1"));
        }
        let numbered = matches!(self.target.op_code, OpCode::Data | OpCode::Ack);
        if self.target.block.is_some() && !numbered {
            return Err(FaultPlanError::new(format!(
                "{} packets carry no block number",
                self.target.op_code
            )));
        }
        match self.kind {
            FaultKind::Corrupt(c) if !c.applies_to(self.target.op_code) => Err(FaultPlanError::new(
                format!("cannot corrupt the {c} of a {} packet", self.target.op_code),
            )),
            FaultKind::Delay(d) if d.is_zero() => {
                Err(FaultPlanError::new("a delay must be longer than zero"))
            }
            // A request has no transfer yet, so a copy from another port is just a second request.
            FaultKind::UnknownTid if self.target.op_code.is_request() => {
                Err(FaultPlanError::new(format!(
                    "a {} belongs to no transfer and cannot come from an unknown TID",
                    self.target.op_code
                )))
            }
            _ => Ok(()),
        }
    }

    fn budget(&self) -> u32 {
        match self.kind {
            FaultKind::None => 0,
            FaultKind::Lose => self.occurrences,
            _ => 1,
        }
    }

    /// Whether the plan has no firings left.
    pub fn exhausted(&self) -> bool {
        self.fired >= self.budget()
    }

    pub fn times_fired(&self) -> u32 {
        self.fired
    }

    /// Decides whether the fault fires for `datagram`, using up budget when it does.
    pub fn should_fire(&mut self, datagram: &[u8]) -> bool {
        if self.exhausted() || !self.target.matches(datagram) {
            return false;
        }
        self.matches_seen += 1;
        if self.matches_seen % self.every.max(1) != 0 {
            return false;
        }
        self.fired += 1;
        true
    }
}

impl Default for FaultPlan {
    fn default() -> Self {
        FaultPlan::none()
    }
}

impl fmt::Display for FaultPlan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            FaultKind::None => write!(f, "no fault"),
            FaultKind::Lose => write!(
                f,
                "lose {} ({}x, every {})",
                self.target, self.occurrences, self.every
            ),
            kind => write!(f, "{kind} {}", self.target),
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct FaultPlanError(String);

impl FaultPlanError {
    fn new(reason: impl Into<String>) -> FaultPlanError {
        FaultPlanError(reason.into())
    }
}

impl error::Error for FaultPlanError {}

impl fmt::Display for FaultPlanError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid fault plan: {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::{FileMode, Packet};
    use tokio_test::{assert_err, assert_ok};

    fn data(block: u16) -> Vec<u8> {
        Packet::Data { block, data: vec![0x41; 16] }.encode()
    }

    fn read_request() -> Vec<u8> {
        Packet::ReadReq { path: "file.bin".to_string(), mode: FileMode::Octet }.encode()
    }

    #[test]
    fn test_fires_once_on_target_block() {
        let mut plan =
            FaultPlan::new(FaultKind::Duplicate, FaultTarget::new(OpCode::Data, Some(2)));

        assert!(!plan.should_fire(&data(1)));
        assert!(!plan.should_fire(&Packet::Ack { block: 2 }.encode()));
        assert!(plan.should_fire(&data(2)));
        // The retransmission of the same block passes untouched.
        assert!(!plan.should_fire(&data(2)));
        assert!(plan.exhausted());
        assert_eq!(plan.times_fired(), 1);
    }

    #[test]
    fn test_loss_respects_occurrences_and_every() {
        let mut plan = FaultPlan::new(FaultKind::Lose, FaultTarget::new(OpCode::Data, None))
            .with_occurrences(2)
            .with_every(2);

        let fired: Vec<bool> = (1..=6).map(|block| plan.should_fire(&data(block))).collect();
        assert_eq!(fired, vec![false, true, false, true, false, false]);
        assert_eq!(plan.times_fired(), 2);
    }

    #[test]
    fn test_request_target_ignores_block() {
        let mut plan = FaultPlan::new(FaultKind::Lose, FaultTarget::new(OpCode::Rrq, None));
        assert!(plan.should_fire(&read_request()));
        assert!(!plan.should_fire(&read_request()));
    }

    #[test]
    fn test_none_never_fires() {
        let mut plan = FaultPlan::none();
        assert!(!plan.should_fire(&data(1)));
        assert_ok!(plan.validate());
    }

    #[test]
    fn test_validate_rejects_mismatched_corruption() {
        let plan = FaultPlan::new(
            FaultKind::Corrupt(Corruption::Terminator),
            FaultTarget::new(OpCode::Data, Some(1)),
        );
        let err = assert_err!(plan.validate());
        assert_eq!(
            err.to_string(),
            "Invalid fault plan: cannot corrupt the terminator of a DATA packet"
        );

        let plan = FaultPlan::new(FaultKind::Lose, FaultTarget::new(OpCode::Wrq, Some(3)));
        assert_err!(plan.validate());

        let plan =
            FaultPlan::new(FaultKind::Lose, FaultTarget::new(OpCode::Ack, None)).with_every(0);
        assert_err!(plan.validate());

        let plan =
            FaultPlan::new(FaultKind::Delay(Duration::ZERO), FaultTarget::new(OpCode::Ack, None));
        assert_err!(plan.validate());
    }

    #[test]
    fn test_validate_rejects_unknown_tid_on_requests() {
        for op in [OpCode::Rrq, OpCode::Wrq] {
            let plan = FaultPlan::new(FaultKind::UnknownTid, FaultTarget::new(op, None));
            assert_err!(plan.validate());
        }
        let plan = FaultPlan::new(FaultKind::UnknownTid, FaultTarget::new(OpCode::Data, Some(1)));
        assert_ok!(plan.validate());
    }

    #[test]
    fn test_corrupted_requests_no_longer_parse() {
        let corruptions =
            [Corruption::Filename, Corruption::Mode, Corruption::Terminator, Corruption::Length];
        for corruption in corruptions {
            let mangled = corruption.apply(&read_request());
            assert_err!(Packet::decode(&mangled), "{corruption} corruption still parsed");
        }
    }

    #[test]
    fn test_filename_corruption_keeps_mode() {
        let mangled = Corruption::Filename.apply(&read_request());
        assert_eq!(mangled, b"\x00\x01\x00octet\x00".to_vec());
    }

    #[test]
    fn test_block_corruption_moves_block_ahead() {
        let mangled = Corruption::BlockNumber.apply(&Packet::Ack { block: 7 }.encode());
        assert_eq!(assert_ok!(Packet::decode(&mangled)), Packet::Ack { block: 8 });
    }

    #[test]
    fn test_opcode_corruption_swaps_opcode() {
        let mangled = Corruption::OpCode.apply(&Packet::Ack { block: 1 }.encode());
        assert_eq!(OpCode::peek(&mangled), Some(OpCode::Rrq));

        let mangled = Corruption::OpCode.apply(&data(1));
        assert_eq!(OpCode::peek(&mangled), Some(OpCode::Ack));
    }

    #[test]
    fn test_length_corruption_exceeds_max_packet() {
        let mangled = Corruption::Length.apply(&Packet::Ack { block: 1 }.encode());
        assert!(mangled.len() > MAX_PACKET_SIZE);
        assert_eq!(&mangled[..4], &[0x00, 0x04, 0x00, 0x01]);
    }
}
