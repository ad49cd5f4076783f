// The accept loop on a well-known port.
//
// Both the server and the proxy listen on a well-known port for requests and spawn one task per
// transfer. The dispatcher keeps a registry of live transfers keyed by the requesting TID so that
// a client retransmitting its request does not start a second transfer: the server ignores the
// repeat, the proxy routes it to the live relay, which decides whether to pass it on.
//
// Shutdown is observed between datagrams. Once it starts draining, the loop stops accepting and
// waits for the registry to empty out; an abort makes every live session give up.

use crate::config::RetryPolicy;
use crate::fault::FaultPlan;
use crate::proxy::{Inbound, ProxyReport, ProxySession};
use crate::server;
use crate::session::send_error_packet;
use crate::shutdown::ShutdownListener;
use crate::tftp::{ErrorCode, OpCode, SocketError, TftpResult, TftpSocket};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

const ACCEPT_POLL: Duration = Duration::from_millis(500);

/// What the dispatcher does with a request.
#[derive(Clone, Debug)]
pub enum Mode {
    /// Serve files out of `root`.
    Server { root: PathBuf },
    /// Relay to the server at `server`, injecting faults according to `plan`.
    Proxy { server: SocketAddr, plan: FaultPlan },
}

#[derive(Debug)]
struct Entry {
    peer: SocketAddr,
    inbox: Option<mpsc::UnboundedSender<Inbound>>,
}

#[derive(Debug, Default)]
struct Registry {
    sessions: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    idle: Notify,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Entry>> {
        // A panicking session must not take the whole registry with it.
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The set of live transfers.
#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    inner: Arc<Registry>,
}

/// What the registry knows about a TID.
#[derive(Debug)]
pub enum Lookup {
    Unknown,
    /// A transfer with this peer is live and takes no further requests.
    Busy,
    /// A transfer with this peer is live and wants repeated requests delivered here.
    Routed(mpsc::UnboundedSender<Inbound>),
}

impl SessionRegistry {
    /// Records a live session. It stays registered until the returned guard is dropped.
    pub fn register(
        &self,
        peer: SocketAddr,
        inbox: Option<mpsc::UnboundedSender<Inbound>>,
    ) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().insert(id, Entry { peer, inbox });
        Registration {
            registry: self.inner.clone(),
            id,
        }
    }

    pub fn lookup(&self, peer: SocketAddr) -> Lookup {
        let sessions = self.inner.lock();
        match sessions.values().find(|e| e.peer == peer) {
            None => Lookup::Unknown,
            Some(Entry { inbox: Some(inbox), .. }) => Lookup::Routed(inbox.clone()),
            Some(_) => Lookup::Busy,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until no session is registered.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a deregistration in between is not missed.
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps a session registered while alive.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<Registry>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut sessions = self.registry.lock();
        sessions.remove(&self.id);
        if sessions.is_empty() {
            self.registry.idle.notify_waiters();
        }
    }
}

pub struct Dispatcher {
    sock: TftpSocket,
    mode: Mode,
    retry: RetryPolicy,
    accept_poll: Duration,
    registry: SessionRegistry,
    reports: Option<mpsc::UnboundedSender<ProxyReport>>,
}

impl Dispatcher {
    pub fn bind(listen: SocketAddr, mode: Mode, retry: RetryPolicy) -> TftpResult<Dispatcher> {
        Ok(Dispatcher {
            sock: TftpSocket::bind(listen)?,
            mode,
            retry,
            accept_poll: ACCEPT_POLL,
            registry: SessionRegistry::default(),
            reports: None,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        self.sock.local_addr()
    }

    /// How often the accept loop looks at the shutdown state while no requests come in.
    pub fn with_accept_poll(mut self, accept_poll: Duration) -> Dispatcher {
        self.accept_poll = accept_poll;
        self
    }

    /// Sends the report of every finished relay to `reports`.
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<ProxyReport>) -> Dispatcher {
        self.reports = Some(reports);
        self
    }

    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Accepts requests until `shutdown` stops it, then waits for the live transfers.
    pub async fn run(self, shutdown: ShutdownListener) -> Result<(), SocketError> {
        log::info!("Listening on {}", self.local_addr()?);
        while shutdown.is_accepting() {
            match self.sock.recv_raw_with_timeout(self.accept_poll).await {
                Ok((datagram, src)) => self.accept(datagram, src, &shutdown).await,
                Err(SocketError::Timeout(_)) => continue,
                Err(SocketError::IO(e)) => {
                    log::error!("Receiving on the well-known port failed: {e}");
                    return Err(SocketError::IO(e));
                }
                Err(e) => log::warn!("Dropping unreadable datagram: {e}"),
            }
        }

        log::info!(
            "No longer accepting requests, waiting for {} live transfers",
            self.registry.len()
        );
        self.registry.wait_idle().await;
        log::info!("All transfers finished");
        Ok(())
    }

    async fn accept(&self, datagram: Vec<u8>, src: SocketAddr, shutdown: &ShutdownListener) {
        match OpCode::peek(&datagram) {
            Some(op) if op.is_request() => {}
            op => {
                match self.mode {
                    Mode::Server { .. } if op != Some(OpCode::Error) => {
                        log::warn!("Non-request datagram from {src} on the well-known port");
                        send_error_packet(
                            &self.sock,
                            src,
                            ErrorCode::Illegal,
                            "Expected a read or write request".to_string(),
                        )
                        .await;
                    }
                    _ => log::info!("Dropping non-request datagram from {src}"),
                }
                return;
            }
        }

        match self.registry.lookup(src) {
            Lookup::Unknown => {}
            Lookup::Busy => {
                log::info!("Ignoring repeated request from {src}, its transfer is still running");
                return;
            }
            Lookup::Routed(inbox) => {
                log::info!("Routing repeated request from {src} to its live relay");
                let _ = inbox.send(Inbound::Request(datagram));
                return;
            }
        }

        match &self.mode {
            Mode::Server { root } => {
                self.spawn_transfer(datagram, src, root.clone(), shutdown.clone())
            }
            Mode::Proxy { server, plan } => {
                self.spawn_relay(datagram, src, *server, plan.clone(), shutdown.clone())
            }
        }
    }

    fn spawn_transfer(
        &self,
        datagram: Vec<u8>,
        client: SocketAddr,
        root: PathBuf,
        cancel: ShutdownListener,
    ) {
        let registration = self.registry.register(client, None);
        let retry = self.retry;
        tokio::spawn(async move {
            let _registration = registration;
            match server::serve_request(&datagram, client, &root, retry, cancel).await {
                Ok(report) => log::info!(
                    "Transfer with {client} succeeded: {} bytes in {} blocks",
                    report.bytes,
                    report.blocks
                ),
                Err(e) => log::warn!("Transfer with {client} failed: {e}"),
            }
        });
    }

    fn spawn_relay(
        &self,
        datagram: Vec<u8>,
        client: SocketAddr,
        server: SocketAddr,
        plan: FaultPlan,
        cancel: ShutdownListener,
    ) {
        let session = match ProxySession::new(client, &datagram, server, plan, self.retry, cancel) {
            Ok(session) => session,
            Err(e) => {
                log::warn!("Couldn't start a relay for {client}: {e}");
                return;
            }
        };
        let registration = self.registry.register(client, Some(session.inbox()));
        let reports = self.reports.clone();
        tokio::spawn(async move {
            let _registration = registration;
            let report = session.run(datagram).await;
            if let Some(reports) = reports {
                let _ = reports.send(report);
            }
        });
    }
}
