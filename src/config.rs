// Command line surface and the knobs it controls.

use crate::fault::{Corruption, FaultKind, FaultPlan, FaultPlanError, FaultTarget};
use crate::tftp::OpCode;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SERVER_LISTEN: &str = "0.0.0.0:6969";
pub const DEFAULT_PROXY_LISTEN: &str = "0.0.0.0:6970";
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:6969";
pub const DEFAULT_ROOT: &str = "./tftp_root";

/// How long an endpoint waits for a reply before retransmitting, and how often it retransmits
/// before giving up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, max_retries: u32) -> RetryPolicy {
        RetryPolicy { timeout, max_retries }
    }

    /// How long a receiver lingers after its final ACK to answer a repeated final block.
    pub fn dally(&self) -> Duration {
        self.timeout * 2
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(Duration::from_secs(1), 5)
    }
}

#[derive(Debug, Parser)]
#[command(name = "tftp-testbed", about = "TFTP client, server and fault injecting proxy")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Retransmission timeout (milliseconds)
    #[arg(long, global = true, default_value_t = 1000)]
    pub timeout_ms: u64,

    /// Retransmissions before a transfer is abandoned
    #[arg(long, global = true, default_value_t = 5)]
    pub retries: u32,
}

impl Cli {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.timeout_ms), self.retries)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve files out of a directory
    Server {
        #[arg(long, default_value = DEFAULT_SERVER_LISTEN)]
        listen: SocketAddr,

        /// Directory that reads are served from and writes land in
        #[arg(long, default_value = DEFAULT_ROOT)]
        root: PathBuf,
    },

    /// Relay transfers to a server, injecting a fault into each one
    Proxy {
        #[arg(long, default_value = DEFAULT_PROXY_LISTEN)]
        listen: SocketAddr,

        #[arg(long, default_value = DEFAULT_SERVER_ADDR)]
        server: SocketAddr,

        /// How long the proxy waits for either side (milliseconds); keep it above --timeout-ms
        #[arg(long, default_value_t = 2000)]
        proxy_timeout_ms: u64,

        #[command(flatten)]
        fault: FaultArgs,
    },

    /// Download a file from a server
    Read {
        remote: String,

        /// Where to store the file; defaults to the remote name in the working directory
        local: Option<PathBuf>,

        #[arg(long, default_value = DEFAULT_SERVER_ADDR)]
        server: SocketAddr,
    },

    /// Upload a file to a server
    Write {
        local: PathBuf,

        /// Name to store the file under; defaults to the local file name
        remote: Option<String>,

        #[arg(long, default_value = DEFAULT_SERVER_ADDR)]
        server: SocketAddr,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FaultFamily {
    None,
    Lose,
    Delay,
    Duplicate,
    UnknownTid,
    BadFilename,
    BadMode,
    BadTerminator,
    BadBlock,
    BadOpcode,
    BadLength,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TargetOp {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
}

impl From<TargetOp> for OpCode {
    fn from(op: TargetOp) -> OpCode {
        match op {
            TargetOp::Rrq => OpCode::Rrq,
            TargetOp::Wrq => OpCode::Wrq,
            TargetOp::Data => OpCode::Data,
            TargetOp::Ack => OpCode::Ack,
            TargetOp::Error => OpCode::Error,
        }
    }
}

#[derive(Clone, Debug, Args)]
pub struct FaultArgs {
    #[arg(long, value_enum, default_value_t = FaultFamily::None)]
    pub fault: FaultFamily,

    /// Kind of packet the fault is aimed at
    #[arg(long, value_enum, default_value_t = TargetOp::Data)]
    pub opcode: TargetOp,

    /// Block number of the targeted DATA or ACK; any block when omitted
    #[arg(long)]
    pub block: Option<u16>,

    /// How many packets a loss fault drops
    #[arg(long, default_value_t = 1)]
    pub occurrences: u32,

    /// Fire on every n-th matching packet
    #[arg(long, default_value_t = 1)]
    pub every: u32,

    /// Hold-back time of a delay fault (milliseconds)
    #[arg(long, default_value_t = 2500)]
    pub delay_ms: u64,
}

impl FaultArgs {
    pub fn plan(&self) -> Result<FaultPlan, FaultPlanError> {
        let kind = match self.fault {
            FaultFamily::None => FaultKind::None,
            FaultFamily::Lose => FaultKind::Lose,
            FaultFamily::Delay => FaultKind::Delay(Duration::from_millis(self.delay_ms)),
            FaultFamily::Duplicate => FaultKind::Duplicate,
            FaultFamily::UnknownTid => FaultKind::UnknownTid,
            FaultFamily::BadFilename => FaultKind::Corrupt(Corruption::Filename),
            FaultFamily::BadMode => FaultKind::Corrupt(Corruption::Mode),
            FaultFamily::BadTerminator => FaultKind::Corrupt(Corruption::Terminator),
            FaultFamily::BadBlock => FaultKind::Corrupt(Corruption::BlockNumber),
            FaultFamily::BadOpcode => FaultKind::Corrupt(Corruption::OpCode),
            FaultFamily::BadLength => FaultKind::Corrupt(Corruption::Length),
        };
        let plan = FaultPlan::new(kind, FaultTarget::new(self.opcode.into(), self.block))
            .with_occurrences(self.occurrences)
            .with_every(self.every);
        plan.validate()?;
        Ok(plan)
    }
}
