// Server side admission of a single request.
//
// The dispatcher hands every RRQ or WRQ that reaches the well-known port to `serve_request`, which
// binds a fresh TID for the transfer, decides whether the request can be served at all, and then
// runs the transfer session to completion. Refusals are reported to the client from the new TID,
// the same way every other error of the transfer would be.

use crate::config::RetryPolicy;
use crate::processor::PacketProcessor;
use crate::session::{send_error_packet, TransferError, TransferReport, TransferSession};
use crate::shutdown::ShutdownListener;
use crate::storage::{BlockReader, BlockWriter};
use crate::tftp::{self, ErrorCode, FileMode, Packet, TftpSocket};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use tokio::io;

/// Maps a requested filename onto `root`. A leading "/" is tolerated; anything that would climb
/// out of `root` is refused.
pub fn resolve_path(root: &Path, requested: &str) -> Result<PathBuf, io::Error> {
    let relative = Path::new(requested.trim_start_matches('/'));
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || relative.as_os_str().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("'{requested}' is outside the served directory"),
        ));
    }
    Ok(root.join(relative))
}

async fn refuse(
    sock: &TftpSocket,
    client: SocketAddr,
    code: ErrorCode,
    message: String,
) {
    log::warn!("Refusing request from {client}: {message}");
    send_error_packet(sock, client, code, message).await;
}

/// Serves one request received from `client` on the well-known port.
pub async fn serve_request(
    datagram: &[u8],
    client: SocketAddr,
    root: &Path,
    retry: RetryPolicy,
    cancel: ShutdownListener,
) -> Result<TransferReport, TransferError> {
    let sock = TftpSocket::bind_ephemeral(tftp::unspecified_for(client))?;

    let request = match Packet::decode(datagram) {
        Ok(p) => p,
        Err(e) => {
            refuse(&sock, client, ErrorCode::Illegal, e.to_string()).await;
            return Err(TransferError::Illegal(e.to_string()));
        }
    };
    log::info!("Got {request} from {client}");

    let (path, mode) = match &request {
        Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => (path, *mode),
        _ => {
            let reason = "Only read and write requests are valid initial requests.".to_string();
            refuse(&sock, client, ErrorCode::Illegal, reason.clone()).await;
            return Err(TransferError::Illegal(reason));
        }
    };

    if mode != FileMode::Octet {
        let reason = format!("Transfer mode '{}' is not supported, use octet", mode.as_str());
        refuse(&sock, client, ErrorCode::Illegal, reason.clone()).await;
        return Err(TransferError::Illegal(reason));
    }

    let opened = match resolve_path(root, path) {
        Ok(local) => match request {
            Packet::ReadReq { .. } => BlockReader::open(&local).await.map(PacketProcessor::sending),
            _ => BlockWriter::create(&local, false).await.map(PacketProcessor::receiving),
        },
        Err(e) => Err(e),
    };
    let processor = match opened {
        Ok(p) => p,
        Err(e) => {
            refuse(&sock, client, e.kind().into(), e.to_string()).await;
            return Err(TransferError::Storage(e));
        }
    };

    TransferSession::for_peer(sock, client, processor, retry, cancel)
        .respond()
        .await
}
