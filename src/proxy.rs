// This module contains the error simulator's per-transfer relay.
//
// A proxy session sits between one client and the server. It owns one socket, which is the TID both
// sides see for the transfer: the client sends its request to the proxy's well-known port and from
// then on talks to this socket, the server gets the request from this socket and answers to it.
//
// Every datagram is queued, then relayed in order. Before a datagram goes out, the session's copy
// of the fault plan decides whether to tamper with it. A delayed datagram comes back through the
// session's inbox when its timer expires and is then relayed untouched. Retransmitted requests that
// the client sends to the well-known port arrive through the same inbox.
//
// The session ends when either side sends an error, when neither side has said anything for
// several proxy timeouts, or when the final ACK has been relayed and the line stays quiet.

use crate::config::RetryPolicy;
use crate::fault::{FaultKind, FaultPlan};
use crate::shutdown::ShutdownListener;
use crate::tftp::{
    self, ErrorCode, OpCode, Packet, SocketError, TftpResult, TftpSocket, DATA_BUFFER_SIZE,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;

/// Which endpoint a datagram came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// A datagram waiting to be relayed.
#[derive(Clone, Debug)]
pub struct Relay {
    bytes: Vec<u8>,
    from: Side,
    /// Already went through the fault plan once.
    faulted: bool,
}

impl Relay {
    fn new(bytes: Vec<u8>, from: Side) -> Relay {
        Relay { bytes, from, faulted: false }
    }
}

/// Messages a proxy session receives besides datagrams on its own socket.
#[derive(Debug)]
pub enum Inbound {
    /// A delayed datagram whose hold-back time is over.
    Delayed(Relay),
    /// The client repeated its request on the well-known port.
    Request(Vec<u8>),
}

/// What a proxy session did over its lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProxyReport {
    pub relayed: u32,
    pub dropped: u32,
    pub delayed: u32,
    pub duplicated: u32,
    pub corrupted: u32,
    pub impersonated: u32,
    /// Datagrams from neither the client nor the bound server.
    pub foreign: u32,
    /// Echo responses to a duplicated packet that were swallowed.
    pub echoes: u32,
    /// The final ACK made it through.
    pub completed: bool,
}

/// Tracks the answer to a duplicated packet. Only a duplicated DATA is answered twice: the receiver
/// acks the repeat again, and that second ACK is kept from the sender, which sent the block once.
/// A repeated request or ACK is ignored by the receiver and leaves nothing to swallow.
#[derive(Debug, PartialEq)]
enum Echo {
    Idle,
    Expected { from: Side, ack: Vec<u8>, seen: bool },
}

impl Echo {
    fn after_duplicate(bytes: &[u8], from: Side) -> Echo {
        match Packet::decode(bytes) {
            Ok(Packet::Data { block, .. }) => Echo::Expected {
                from: opposite(from),
                ack: Packet::Ack { block }.encode(),
                seen: false,
            },
            _ => Echo::Idle,
        }
    }

    fn swallows(&mut self, relay: &Relay) -> bool {
        match self {
            Echo::Expected { from, ack, seen } if *from == relay.from && *ack == relay.bytes => {
                if *seen {
                    *self = Echo::Idle;
                    true
                } else {
                    *seen = true;
                    false
                }
            }
            _ => false,
        }
    }
}

enum Event {
    Datagram(TftpResult<(Vec<u8>, SocketAddr)>),
    Inbox(Inbound),
    Aborted,
}

pub struct ProxySession {
    sock: TftpSocket,

    /// The client's TID, fixed at creation.
    client: SocketAddr,

    /// The server's well-known address; requests go here.
    server_entry: SocketAddr,

    /// The server's TID, learned from the first datagram that is not the client's.
    server: Option<SocketAddr>,

    /// RRQ or WRQ. Decides which side sends DATA and which sends ACKs.
    direction: OpCode,

    plan: FaultPlan,
    retry: RetryPolicy,

    pending: VecDeque<Relay>,
    inbox_sx: mpsc::UnboundedSender<Inbound>,
    inbox_rx: mpsc::UnboundedReceiver<Inbound>,

    echo: Echo,

    /// Block number of the short DATA that ends the transfer, once it went by.
    final_block: Option<u16>,

    /// An error packet was relayed.
    ended: bool,

    report: ProxyReport,
    cancel: ShutdownListener,
}

impl ProxySession {
    pub fn new(
        client: SocketAddr,
        request: &[u8],
        server_entry: SocketAddr,
        plan: FaultPlan,
        retry: RetryPolicy,
        cancel: ShutdownListener,
    ) -> TftpResult<ProxySession> {
        let direction = match OpCode::peek(request) {
            Some(op) if op.is_request() => op,
            _ => return Err(not_a_request().into()),
        };
        let sock = TftpSocket::bind_ephemeral(tftp::unspecified_for(server_entry))?;
        let (inbox_sx, inbox_rx) = mpsc::unbounded_channel();
        Ok(ProxySession {
            sock,
            client,
            server_entry,
            server: None,
            direction,
            plan,
            retry,
            pending: VecDeque::new(),
            inbox_sx,
            inbox_rx,
            echo: Echo::Idle,
            final_block: None,
            ended: false,
            report: ProxyReport::default(),
            cancel,
        })
    }

    /// A handle for feeding repeated requests into this session.
    pub fn inbox(&self) -> mpsc::UnboundedSender<Inbound> {
        self.inbox_sx.clone()
    }

    /// Relays the transfer that starts with `request` until it is over.
    pub async fn run(mut self, request: Vec<u8>) -> ProxyReport {
        log::info!(
            "Relaying {} from {} through {:?} with plan: {}",
            self.direction,
            self.client,
            self.sock.local_addr().ok(),
            self.plan
        );
        self.pending.push_back(Relay::new(request, Side::Client));
        self.flush().await;

        let mut idle = 0;
        while !self.ended {
            let event = tokio::select! {
                r = self.sock.recv_raw_with_timeout(self.retry.timeout) => Event::Datagram(r),
                Some(inbound) = self.inbox_rx.recv() => Event::Inbox(inbound),
                _ = self.cancel.aborted() => Event::Aborted,
            };

            match event {
                Event::Datagram(Ok((bytes, src))) => {
                    idle = 0;
                    if let Some(relay) = self.admit(bytes, src).await {
                        self.pending.push_back(relay);
                    }
                }
                Event::Datagram(Err(SocketError::Timeout(_))) => {
                    idle += 1;
                    if idle >= self.retry.max_retries {
                        if self.report.completed {
                            log::info!("Transfer from {} is complete", self.client);
                        } else {
                            log::warn!(
                                "Neither side of {}'s transfer answered, giving up",
                                self.client
                            );
                        }
                        break;
                    }
                    continue;
                }
                Event::Datagram(Err(e)) => {
                    log::warn!("Proxy socket failed: {e}");
                    break;
                }
                Event::Inbox(Inbound::Delayed(relay)) => self.pending.push_back(relay),
                Event::Inbox(Inbound::Request(bytes)) => {
                    self.pending.push_back(Relay::new(bytes, Side::Client));
                }
                Event::Aborted => {
                    log::warn!("Relay for {} cancelled", self.client);
                    break;
                }
            }
            self.flush().await;
        }

        log::info!("Relay for {} finished: {:?}", self.client, self.report);
        self.report
    }

    /// Decides which side a datagram came from. Strangers are told off and their datagram goes
    /// nowhere.
    async fn admit(&mut self, bytes: Vec<u8>, src: SocketAddr) -> Option<Relay> {
        if src == self.client {
            return Some(Relay::new(bytes, Side::Client));
        }
        match self.server {
            None => {
                log::info!("Server answered from {src}, binding the relay to it");
                self.server = Some(src);
                Some(Relay::new(bytes, Side::Server))
            }
            Some(server) if server == src => Some(Relay::new(bytes, Side::Server)),
            Some(server) => {
                log::warn!("Datagram from unknown TID {src}, the server of this relay is {server}");
                self.report.foreign += 1;
                if OpCode::peek(&bytes) != Some(OpCode::Error) {
                    let rejection = Packet::Error {
                        code: ErrorCode::UnknownTid,
                        message: "This port belongs to a different transfer".to_string(),
                    };
                    let _ = self.sock.send(&rejection, src).await;
                }
                None
            }
        }
    }

    /// Requests always go to the well-known port, even a repeat after the server answered.
    fn destination(&self, relay: &Relay) -> SocketAddr {
        match relay.from {
            Side::Server => self.client,
            Side::Client if OpCode::peek(&relay.bytes).is_some_and(OpCode::is_request) => {
                self.server_entry
            }
            Side::Client => self.server.unwrap_or(self.server_entry),
        }
    }

    async fn flush(&mut self) {
        while let Some(relay) = self.pending.pop_front() {
            self.relay(relay).await;
        }
    }

    async fn relay(&mut self, relay: Relay) {
        let dst = self.destination(&relay);
        if relay.faulted {
            self.forward(&relay.bytes, relay.from, dst).await;
            return;
        }
        if self.echo.swallows(&relay) {
            log::info!("Swallowed the echo of a duplicated packet from {:?}", relay.from);
            self.report.echoes += 1;
            return;
        }
        if !self.plan.should_fire(&relay.bytes) {
            self.forward(&relay.bytes, relay.from, dst).await;
            return;
        }

        log::warn!("Injecting fault ({}) into {}", self.plan.kind, summarize(&relay.bytes));
        match self.plan.kind {
            FaultKind::None => self.forward(&relay.bytes, relay.from, dst).await,
            FaultKind::Lose => self.report.dropped += 1,
            FaultKind::Delay(hold) => {
                self.report.delayed += 1;
                self.hold_back(relay, hold);
            }
            FaultKind::Duplicate => {
                self.forward(&relay.bytes, relay.from, dst).await;
                self.forward(&relay.bytes, relay.from, dst).await;
                self.report.duplicated += 1;
                self.echo = Echo::after_duplicate(&relay.bytes, relay.from);
            }
            FaultKind::Corrupt(corruption) => {
                let mangled = corruption.apply(&relay.bytes);
                self.report.corrupted += 1;
                self.forward(&mangled, relay.from, dst).await;
            }
            FaultKind::UnknownTid => {
                self.forward(&relay.bytes, relay.from, dst).await;
                self.report.impersonated += 1;
                impersonate(relay.bytes, dst, self.retry.timeout);
            }
        }
    }

    fn hold_back(&self, mut relay: Relay, hold: Duration) {
        relay.faulted = true;
        let inbox = self.inbox_sx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            // The session may be gone by now, in which case the datagram dies with it.
            let _ = inbox.send(Inbound::Delayed(relay));
        });
    }

    async fn forward(&mut self, bytes: &[u8], from: Side, dst: SocketAddr) {
        if let Err(e) = self.sock.send_raw(bytes, dst).await {
            log::warn!("Couldn't relay to {dst}: {e}");
            return;
        }
        self.report.relayed += 1;
        self.observe(bytes, from);
    }

    /// Follows the transfer's progress from the datagrams that went through.
    fn observe(&mut self, bytes: &[u8], from: Side) {
        let data_side = match self.direction {
            OpCode::Rrq => Side::Server,
            _ => Side::Client,
        };
        match Packet::decode(bytes) {
            Ok(Packet::Data { block, data })
                if from == data_side && data.len() < DATA_BUFFER_SIZE =>
            {
                self.final_block = Some(block);
            }
            Ok(Packet::Ack { block }) if from != data_side && Some(block) == self.final_block => {
                if !self.report.completed {
                    log::info!("Final ACK relayed, waiting for stragglers");
                }
                self.report.completed = true;
            }
            Ok(Packet::Error { code, message }) if code != ErrorCode::UnknownTid => {
                log::warn!("{from:?} aborted the transfer with {code:?}: {message}");
                self.ended = true;
            }
            _ => {}
        }
    }
}

fn opposite(side: Side) -> Side {
    match side {
        Side::Client => Side::Server,
        Side::Server => Side::Client,
    }
}

fn not_a_request() -> tftp::FormatError {
    tftp::FormatError("a relay has to start with a read or write request".to_string())
}

fn summarize(bytes: &[u8]) -> String {
    match Packet::decode(bytes) {
        Ok(p) => p.to_string(),
        Err(_) => format!("{} undecodable bytes", bytes.len()),
    }
}

/// Sends a copy of `bytes` to `dst` from a port `dst` has never heard of and logs the answer, which
/// should be an unknown TID error.
fn impersonate(bytes: Vec<u8>, dst: SocketAddr, wait: Duration) {
    tokio::spawn(async move {
        let sock = match TftpSocket::bind_ephemeral(tftp::unspecified_for(dst)) {
            Ok(sock) => sock,
            Err(e) => {
                log::warn!("Couldn't bind a socket to impersonate a peer: {e}");
                return;
            }
        };
        if let Err(e) = sock.send_raw(&bytes, dst).await {
            log::warn!("Couldn't send from the foreign TID: {e}");
            return;
        }
        match sock.recv_with_timeout(wait).await {
            Ok((Packet::Error { code: ErrorCode::UnknownTid, .. }, src)) => {
                log::info!("{src} rejected the foreign TID as it should")
            }
            Ok((packet, src)) => log::warn!("{src} answered the foreign TID with {packet}"),
            Err(e) => log::warn!("No answer to the foreign TID from {dst}: {e}"),
        }
    });
}
