// This module contains the transfer session, the lockstep loop shared by clients and servers.
//
// A session owns one socket (its TID) and one packet processor. It works in the following stages:
//
// 1. Send the outgoing packet: a request for a client, the first DATA or ACK for a server.
// 2. Wait for the peer's answer. Every datagram is classified by the checker first. Datagrams from
//    strangers are answered with an error and otherwise ignored; protocol violations end the
//    transfer; late duplicates are absorbed; the expected packet goes to the processor.
// 3. If nothing acceptable arrives within the timeout, the last packet is sent again, up to the
//    retry limit.
// 4. A receiver that sent the final ACK lingers for a while, so that a repeated final block (its
//    ACK got lost) is acknowledged again instead of leaving the sender to time out.
//
// A client does not know the server's TID up front: it sends its request to the well-known port
// and binds the peer to whatever address the first valid response came from.

use crate::checker::{self, Check};
use crate::config::RetryPolicy;
use crate::processor::{PacketProcessor, ResultAction};
use crate::shutdown::ShutdownListener;
use crate::tftp::{ErrorCode, OpCode, Packet, SocketError, TftpSocket};
use std::error;
use std::fmt;
use std::net::SocketAddr;
use tokio::io;
use tokio::time::Instant;

/// What a finished transfer moved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: u64,
    pub blocks: u16,
}

#[derive(Debug)]
pub enum TransferError {
    /// The peer stayed silent through every retransmission.
    Timeout { retries: u32 },
    /// The peer sent an error packet.
    Remote { code: ErrorCode, message: String },
    /// The peer broke the protocol.
    Illegal(String),
    /// The local file could not be opened, read or written.
    Storage(io::Error),
    /// The socket failed.
    Io(io::Error),
    Cancelled,
}

impl TransferError {
    /// The TFTP error code the peer used, if the transfer was ended by the peer.
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            TransferError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Timeout { retries } => write!(f, "No response after {retries} retransmissions"),
            Self::Remote { code, message } => {
                write!(
                    f,
                    "Peer ended the transfer with error {} ({:?}): {message}",
                    code.as_u16(),
                    code
                )
            }
            Self::Illegal(reason) => write!(f, "Illegal TFTP operation: {reason}"),
            Self::Storage(e) => write!(f, "File IO error: {e}"),
            Self::Io(e) => write!(f, "Socket error: {e}"),
            Self::Cancelled => write!(f, "Transfer cancelled"),
        }
    }
}

impl From<SocketError> for TransferError {
    fn from(e: SocketError) -> TransferError {
        match e {
            SocketError::IO(e) => TransferError::Io(e),
            SocketError::PacketParse(e) => TransferError::Illegal(e.to_string()),
            SocketError::Timeout(_) => TransferError::Timeout { retries: 0 },
        }
    }
}

pub async fn send_error_packet(
    sock: &TftpSocket,
    dst: SocketAddr,
    code: ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&Packet::Error { code, message }, dst).await;
}

/// One side of a single transfer.
pub struct TransferSession {
    /// The socket whose port is our TID.
    sock: TftpSocket,

    /// Where outgoing packets go: the server's well-known address until the peer's TID is known.
    dst: SocketAddr,

    /// The peer's TID. Fixed once learned.
    peer: Option<SocketAddr>,

    processor: PacketProcessor,

    retry: RetryPolicy,

    cancel: ShutdownListener,
}

impl TransferSession {
    /// A server side session, answering a request that arrived from `peer`.
    pub fn for_peer(
        sock: TftpSocket,
        peer: SocketAddr,
        processor: PacketProcessor,
        retry: RetryPolicy,
        cancel: ShutdownListener,
    ) -> TransferSession {
        TransferSession {
            sock,
            dst: peer,
            peer: Some(peer),
            processor,
            retry,
            cancel,
        }
    }

    /// A client side session that will send its request to the server's well-known `server`
    /// address.
    pub fn to_server(
        sock: TftpSocket,
        server: SocketAddr,
        processor: PacketProcessor,
        retry: RetryPolicy,
        cancel: ShutdownListener,
    ) -> TransferSession {
        TransferSession {
            sock,
            dst: server,
            peer: None,
            processor,
            retry,
            cancel,
        }
    }

    fn report(&self) -> TransferReport {
        TransferReport {
            bytes: self.processor.bytes(),
            blocks: self.processor.blocks(),
        }
    }

    /// Runs a client transfer that starts with `request`.
    pub async fn request(mut self, request: Packet) -> Result<TransferReport, TransferError> {
        log::info!("Sending {request} to {}", self.dst);
        self.drive(request).await
    }

    /// Runs a server transfer: sends the first DATA or ACK and carries on from there.
    pub async fn respond(mut self) -> Result<TransferReport, TransferError> {
        match self.processor.first_packet().await {
            ResultAction::SendPacketAndAwait(p) => self.drive(p).await,
            ResultAction::StorageFailed { kind, message, notify } => {
                self.fail_storage(kind, message, notify).await
            }
            other => {
                log::error!(
                    "Packet processor answered {other:?} before the first message was sent"
                );
                send_error_packet(
                    &self.sock,
                    self.dst,
                    ErrorCode::Undefined,
                    "Internal error, please retry".to_string(),
                )
                .await;
                Err(TransferError::Illegal("transfer could not be started".to_string()))
            }
        }
    }

    async fn fail_storage(
        &self,
        kind: io::ErrorKind,
        message: String,
        notify: Option<Packet>,
    ) -> Result<TransferReport, TransferError> {
        if let Some(p) = notify {
            let _ = self.sock.send(&p, self.dst).await;
        }
        Err(TransferError::Storage(io::Error::new(kind, message)))
    }

    async fn fail_illegal(
        &self,
        dst: SocketAddr,
        reason: String,
    ) -> Result<TransferReport, TransferError> {
        log::warn!("Illegal packet from {dst}: {reason}");
        send_error_packet(&self.sock, dst, ErrorCode::Illegal, reason.clone()).await;
        Err(TransferError::Illegal(reason))
    }

    async fn drive(&mut self, first: Packet) -> Result<TransferReport, TransferError> {
        let mut out_packet = first;
        let mut retries = 0;

        // This loop is used for message sending as well as retries, depending on whether
        // |out_packet| has been overwritten.
        loop {
            self.sock.send(&out_packet, self.dst).await?;

            let started_waiting = Instant::now();
            loop {
                let remaining = self.retry.timeout.saturating_sub(started_waiting.elapsed());
                let received = tokio::select! {
                    r = self.sock.recv_raw_with_timeout(remaining) => r,
                    _ = self.cancel.aborted() => {
                        log::warn!("Transfer with {} cancelled", self.dst);
                        return Err(TransferError::Cancelled);
                    }
                };

                let (datagram, src) = match received {
                    Ok(r) => r,
                    // If we timed out, rebroadcast the last sent packet
                    Err(SocketError::Timeout(_)) => {
                        retries += 1;
                        if retries > self.retry.max_retries {
                            log::warn!(
                                "Giving up on {} after {} retransmissions",
                                self.dst,
                                self.retry.max_retries
                            );
                            return Err(TransferError::Timeout { retries: self.retry.max_retries });
                        }
                        log::info!(
                            "Timed out, trying again ({retries}/{})",
                            self.retry.max_retries
                        );
                        break;
                    }
                    Err(e) => return Err(e.into()),
                };

                let expected = self.processor.expectation(self.peer);
                let packet = match checker::check(&datagram, src, &expected) {
                    Check::Valid(p) | Check::Stale(p) => p,
                    Check::UnknownTransfer => {
                        log::warn!(
                            "Datagram from unknown TID {src}, this transfer belongs to {}",
                            self.dst
                        );
                        if OpCode::peek(&datagram) == Some(OpCode::Error) {
                            continue;
                        }
                        send_error_packet(
                            &self.sock,
                            src,
                            ErrorCode::UnknownTid,
                            "This port belongs to a different transfer".to_string(),
                        )
                        .await;
                        // Continue waiting for a good packet from the expected peer.
                        continue;
                    }
                    Check::IllegalOperation(reason) => return self.fail_illegal(src, reason).await,
                };

                if self.peer.is_none() {
                    log::info!("Server answered from {src}, binding the transfer to it");
                    self.peer = Some(src);
                    self.dst = src;
                }

                match self.processor.process_packet(&packet).await {
                    ResultAction::SendPacketAndAwait(p) => {
                        out_packet = p;
                        retries = 0;
                        break;
                    }
                    ResultAction::RetryRecv => continue,
                    ResultAction::ResendLast => {
                        log::debug!("Peer repeated {packet}, sending {out_packet} again");
                        break;
                    }
                    ResultAction::CloseConnection => {
                        log::info!("Closing connection with {}", self.dst);
                        return Ok(self.report());
                    }
                    ResultAction::TerminateWithPacket(p) => {
                        self.sock.send(&p, self.dst).await?;
                        self.dally(&p).await;
                        log::info!("Closing connection with {}", self.dst);
                        return Ok(self.report());
                    }
                    ResultAction::PeerAborted { code, message } => {
                        log::warn!("{} aborted the transfer with {:?}: {message}", self.dst, code);
                        return Err(TransferError::Remote { code, message });
                    }
                    ResultAction::Illegal(reason) => {
                        return self.fail_illegal(self.dst, reason).await
                    }
                    ResultAction::StorageFailed { kind, message, notify } => {
                        log::error!("{message}");
                        return self.fail_storage(kind, message, notify).await;
                    }
                }
            }
        }
    }

    /// Answers repeats of the final block with `final_ack` until the peer has been quiet for a
    /// while. Every repeat restarts the wait, since the ack sent for it can get lost as well.
    async fn dally(&mut self, final_ack: &Packet) {
        let mut deadline = Instant::now() + self.retry.dally();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            let (datagram, src) = match self.sock.recv_raw_with_timeout(remaining).await {
                Ok(r) => r,
                Err(_) => return,
            };
            let expected = self.processor.expectation(self.peer);
            if let Check::Stale(p) = checker::check(&datagram, src, &expected) {
                if p.block() == final_ack.block() {
                    log::debug!("Peer repeated the final block, acknowledging it again");
                    let _ = self.sock.send(final_ack, src).await;
                    deadline = Instant::now() + self.retry.dally();
                }
            }
        }
    }
}
