use crate::config::RetryPolicy;
use crate::processor::PacketProcessor;
use crate::session::{TransferError, TransferReport, TransferSession};
use crate::shutdown::ShutdownListener;
use crate::storage::{BlockReader, BlockWriter};
use crate::tftp::{self, FileMode, Packet, TftpSocket};
use std::net::SocketAddr;
use std::path::Path;

/// Reads and writes files on one TFTP server, one transfer at a time. `server` is the well-known
/// address requests go to; the transfer itself continues with whatever TID the server answers from.
#[derive(Clone, Debug)]
pub struct Client {
    server: SocketAddr,
    retry: RetryPolicy,
    cancel: ShutdownListener,
}

impl Client {
    pub fn new(server: SocketAddr, retry: RetryPolicy) -> Client {
        Client {
            server,
            retry,
            cancel: ShutdownListener::detached(),
        }
    }

    pub fn with_cancel(mut self, cancel: ShutdownListener) -> Client {
        self.cancel = cancel;
        self
    }

    fn session(&self, processor: PacketProcessor) -> Result<TransferSession, TransferError> {
        let sock = TftpSocket::bind_ephemeral(tftp::unspecified_for(self.server))?;
        Ok(TransferSession::to_server(
            sock,
            self.server,
            processor,
            self.retry,
            self.cancel.clone(),
        ))
    }

    /// Downloads `remote` into `local`, replacing whatever `local` held. A failed download does
    /// not leave a partial file behind.
    pub async fn read(&self, remote: &str, local: &Path) -> Result<TransferReport, TransferError> {
        let writer = BlockWriter::create(local, true).await.map_err(TransferError::Storage)?;
        let request = Packet::ReadReq {
            path: remote.to_string(),
            mode: FileMode::Octet,
        };

        let result = match self.session(PacketProcessor::receiving(writer)) {
            Ok(session) => session.request(request).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(local).await {
                log::warn!("Couldn't remove partial download {}: {e}", local.display());
            }
        }
        result
    }

    /// Uploads `local` to the server under the name `remote`.
    pub async fn write(&self, local: &Path, remote: &str) -> Result<TransferReport, TransferError> {
        let reader = BlockReader::open(local).await.map_err(TransferError::Storage)?;
        let request = Packet::WriteReq {
            path: remote.to_string(),
            mode: FileMode::Octet,
        };
        self.session(PacketProcessor::sending(reader))?
            .request(request)
            .await
    }
}
