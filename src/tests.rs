// End-to-end transfers over loopback: real client, real server, and the proxy in between where a
// fault is being injected.

use crate::client::Client;
use crate::config::RetryPolicy;
use crate::dispatcher::{Dispatcher, Mode};
use crate::fault::{Corruption, FaultKind, FaultPlan, FaultTarget};
use crate::proxy::ProxyReport;
use crate::session::TransferError;
use crate::shutdown::Shutdown;
use crate::tftp::{ErrorCode, FileMode, OpCode, Packet, TftpSocket, DATA_BUFFER_SIZE};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tempdir::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(2);

fn localhost(port: u16) -> SocketAddr {
    (IpAddr::V4(Ipv4Addr::LOCALHOST), port).into()
}

fn endpoint_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(200), 5)
}

fn proxy_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(400), 3)
}

fn random_contents(len: usize) -> Vec<u8> {
    let mut contents = vec![0_u8; len];
    rand::thread_rng().fill(&mut contents[..]);
    contents
}

/// A server on an ephemeral loopback port, with scratch space for the client side.
struct Testbed {
    root: TempDir,
    scratch: TempDir,
    server: SocketAddr,
    shutdown: Shutdown,
}

impl Testbed {
    fn start() -> Testbed {
        let root = TempDir::new("root").unwrap();
        let scratch = TempDir::new("scratch").unwrap();
        let shutdown = Shutdown::new();
        let dispatcher = assert_ok!(Dispatcher::bind(
            localhost(0),
            Mode::Server { root: root.path().to_path_buf() },
            endpoint_retry(),
        ))
        .with_accept_poll(Duration::from_millis(50));
        let server = dispatcher.local_addr().unwrap();
        tokio::spawn(dispatcher.run(shutdown.listener()));
        Testbed { root, scratch, server, shutdown }
    }

    /// Starts a proxy in front of the server. Every finished relay reports on the returned channel.
    fn proxy(&self, plan: FaultPlan) -> (SocketAddr, mpsc::UnboundedReceiver<ProxyReport>) {
        self.proxy_for(self.server, plan)
    }

    fn proxy_for(
        &self,
        server: SocketAddr,
        plan: FaultPlan,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<ProxyReport>) {
        assert_ok!(plan.validate());
        let (reports_sx, reports_rx) = mpsc::unbounded_channel();
        let mode = Mode::Proxy { server, plan };
        let dispatcher = assert_ok!(Dispatcher::bind(localhost(0), mode, proxy_retry()))
            .with_accept_poll(Duration::from_millis(50))
            .with_reports(reports_sx);
        let addr = dispatcher.local_addr().unwrap();
        tokio::spawn(dispatcher.run(self.shutdown.listener()));
        (addr, reports_rx)
    }

    fn client(&self, target: SocketAddr) -> Client {
        Client::new(target, endpoint_retry())
    }

    fn served(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    fn local(&self, name: &str) -> PathBuf {
        self.scratch.path().join(name)
    }

    async fn serve(&self, name: &str, contents: &[u8]) {
        tokio::fs::write(self.served(name), contents).await.unwrap();
    }

    async fn keep_locally(&self, name: &str, contents: &[u8]) {
        tokio::fs::write(self.local(name), contents).await.unwrap();
    }
}

async fn next_report(reports: &mut mpsc::UnboundedReceiver<ProxyReport>) -> ProxyReport {
    assert_ok!(timeout(Duration::from_secs(10), reports.recv()).await).unwrap()
}

///////////////////////////////////////////////////////////////
// Client and server

#[tokio::test]
async fn test_read_small_file() {
    let bed = Testbed::start();
    let contents = random_contents(600);
    bed.serve("small.bin", &contents).await;

    let local = bed.local("small.bin");
    let report = assert_ok!(bed.client(bed.server).read("small.bin", &local).await);
    assert_eq!((report.bytes, report.blocks), (600, 2));
    assert_eq!(tokio::fs::read(&local).await.unwrap(), contents);
}

#[tokio::test]
async fn test_write_empty_file() {
    let bed = Testbed::start();
    bed.keep_locally("empty.bin", b"").await;

    let local = bed.local("empty.bin");
    let report = assert_ok!(bed.client(bed.server).write(&local, "empty.bin").await);
    assert_eq!((report.bytes, report.blocks), (0, 1));
    assert!(tokio::fs::read(bed.served("empty.bin")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_write_exact_multiple_of_block_size() {
    let bed = Testbed::start();
    let contents = random_contents(2 * DATA_BUFFER_SIZE);
    bed.keep_locally("even.bin", &contents).await;

    let report = assert_ok!(bed.client(bed.server).write(&bed.local("even.bin"), "even.bin").await);
    // Two full blocks, then an empty one to end the transfer.
    assert_eq!(report.blocks, 3);
    assert_eq!(tokio::fs::read(bed.served("even.bin")).await.unwrap(), contents);
}

#[tokio::test]
async fn test_concurrent_reads() {
    let bed = Testbed::start();
    let first = random_contents(5000);
    let second = random_contents(3000);
    bed.serve("first.bin", &first).await;
    bed.serve("second.bin", &second).await;

    let client = bed.client(bed.server);
    let (first_local, second_local) = (bed.local("first.bin"), bed.local("second.bin"));
    let (a, b) = tokio::join!(
        client.read("first.bin", &first_local),
        client.read("second.bin", &second_local),
    );
    assert_ok!(a);
    assert_ok!(b);
    assert_eq!(tokio::fs::read(&first_local).await.unwrap(), first);
    assert_eq!(tokio::fs::read(&second_local).await.unwrap(), second);
}

#[tokio::test]
async fn test_read_missing_file_leaves_nothing_behind() {
    let bed = Testbed::start();

    let err = assert_err!(bed.client(bed.server).read("nope.bin", &bed.local("nope.bin")).await);
    assert_eq!(err.remote_code(), Some(ErrorCode::FileNotFound));
    assert!(!bed.local("nope.bin").exists());
}

#[tokio::test]
async fn test_write_existing_file_is_refused() {
    let bed = Testbed::start();
    bed.serve("taken.bin", b"original").await;
    bed.keep_locally("taken.bin", b"replacement").await;

    let err = assert_err!(bed.client(bed.server).write(&bed.local("taken.bin"), "taken.bin").await);
    assert_eq!(err.remote_code(), Some(ErrorCode::FileAlreadyExists));
    assert_eq!(tokio::fs::read(bed.served("taken.bin")).await.unwrap(), b"original".to_vec());
}

#[tokio::test]
async fn test_write_missing_local_file() {
    let bed = Testbed::start();
    let local = bed.local("absent.bin");
    let err = assert_err!(bed.client(bed.server).write(&local, "absent.bin").await);
    assert!(matches!(err, TransferError::Storage(_)));
}

#[tokio::test]
async fn test_client_acks_every_block_in_order() {
    let scratch = TempDir::new("scratch").unwrap();
    let well_known = assert_ok!(TftpSocket::bind(localhost(0)));
    let addr = well_known.local_addr().unwrap();
    let contents = random_contents(2 * DATA_BUFFER_SIZE);
    let blocks: Vec<Vec<u8>> = vec![
        contents[..DATA_BUFFER_SIZE].to_vec(),
        contents[DATA_BUFFER_SIZE..].to_vec(),
        vec![],
    ];

    let fake_server = tokio::spawn(async move {
        let (request, client) = well_known.recv_with_timeout(WAIT).await.unwrap();
        let expected = Packet::ReadReq { path: "even.bin".to_string(), mode: FileMode::Octet };
        assert_eq!(request, expected);

        let transfer = TftpSocket::bind(localhost(0)).unwrap();
        let mut acks = vec![];
        for (i, data) in blocks.into_iter().enumerate() {
            let block = i as u16 + 1;
            transfer.send(&Packet::Data { block, data }, client).await.unwrap();
            let (ack, _) = transfer.recv_with_timeout(WAIT).await.unwrap();
            acks.push(ack);
        }
        // Nothing may follow the final ack.
        let straggler = transfer.recv_with_timeout(Duration::from_millis(300)).await;
        (acks, straggler.is_err())
    });

    let client = Client::new(addr, endpoint_retry());
    let report = assert_ok!(client.read("even.bin", &scratch.path().join("even.bin")).await);
    assert_eq!(report.blocks, 3);

    let (acks, quiet) = fake_server.await.unwrap();
    let expected: Vec<Packet> = (1..=3).map(|block| Packet::Ack { block }).collect();
    assert_eq!(acks, expected);
    assert!(quiet);
    assert_eq!(tokio::fs::read(scratch.path().join("even.bin")).await.unwrap(), contents);
}

#[tokio::test]
async fn test_client_gives_up_on_silent_server() {
    let scratch = TempDir::new("scratch").unwrap();
    let silent = assert_ok!(TftpSocket::bind(localhost(0)));
    let impatient = RetryPolicy::new(Duration::from_millis(50), 3);
    let client = Client::new(silent.local_addr().unwrap(), impatient);

    let err = assert_err!(client.read("x.bin", &scratch.path().join("x.bin")).await);
    assert!(matches!(err, TransferError::Timeout { retries: 3 }));

    // The request plus one retransmission per retry.
    let mut requests = 0;
    while silent.recv_with_timeout(Duration::from_millis(100)).await.is_ok() {
        requests += 1;
    }
    assert_eq!(requests, 4);
}

///////////////////////////////////////////////////////////////
// Through the proxy

#[tokio::test]
async fn test_proxy_relays_untouched_transfer() {
    let bed = Testbed::start();
    let contents = random_contents(1500);
    bed.serve("plain.bin", &contents).await;
    let (proxy, mut reports) = bed.proxy(FaultPlan::none());

    let report = assert_ok!(bed.client(proxy).read("plain.bin", &bed.local("plain.bin")).await);
    assert_eq!(report.blocks, 3);
    assert_eq!(tokio::fs::read(bed.local("plain.bin")).await.unwrap(), contents);

    let relay = next_report(&mut reports).await;
    assert!(relay.completed);
    // RRQ, three DATA and three ACK, give or take a retransmission.
    assert!(relay.relayed >= 7);
    assert_eq!(relay.dropped + relay.corrupted + relay.duplicated + relay.delayed, 0);
}

#[tokio::test]
async fn test_lost_data_is_retransmitted_once() {
    let bed = Testbed::start();
    let well_known = assert_ok!(TftpSocket::bind(localhost(0)));
    let plan = FaultPlan::new(FaultKind::Lose, FaultTarget::new(OpCode::Data, Some(1)));
    let (proxy, mut reports) = bed.proxy_for(well_known.local_addr().unwrap(), plan);
    let contents = random_contents(DATA_BUFFER_SIZE + 100);
    let blocks = vec![
        contents[..DATA_BUFFER_SIZE].to_vec(),
        contents[DATA_BUFFER_SIZE..].to_vec(),
    ];

    // A lockstep sender that counts how often it had to send each block.
    let fake_server = tokio::spawn(async move {
        let (_, relay) = well_known.recv_with_timeout(WAIT).await.unwrap();
        let transfer = TftpSocket::bind(localhost(0)).unwrap();
        let mut copies = vec![];
        for (i, data) in blocks.into_iter().enumerate() {
            let block = i as u16 + 1;
            let packet = Packet::Data { block, data };
            let mut sent = 0;
            loop {
                transfer.send(&packet, relay).await.unwrap();
                sent += 1;
                match transfer.recv_with_timeout(endpoint_retry().timeout).await {
                    Ok((ack, _)) => {
                        assert_eq!(ack, Packet::Ack { block });
                        break;
                    }
                    Err(_) => assert!(sent < 5, "block {block} never got through"),
                }
            }
            copies.push(sent);
        }
        // One ack per block reached the server, nothing follows the last one.
        let straggler = transfer.recv_with_timeout(Duration::from_millis(300)).await;
        (copies, straggler.is_err())
    });

    assert_ok!(bed.client(proxy).read("lossy.bin", &bed.local("lossy.bin")).await);
    assert_eq!(tokio::fs::read(bed.local("lossy.bin")).await.unwrap(), contents);

    let (copies, quiet) = fake_server.await.unwrap();
    assert_eq!(copies, vec![2, 1]);
    assert!(quiet);
    assert_eq!(next_report(&mut reports).await.dropped, 1);
}

#[tokio::test]
async fn test_lost_request_is_retransmitted() {
    let bed = Testbed::start();
    let contents = random_contents(700);
    bed.serve("req.bin", &contents).await;
    let plan = FaultPlan::new(FaultKind::Lose, FaultTarget::new(OpCode::Rrq, None));
    let (proxy, mut reports) = bed.proxy(plan);

    assert_ok!(bed.client(proxy).read("req.bin", &bed.local("req.bin")).await);
    assert_eq!(tokio::fs::read(bed.local("req.bin")).await.unwrap(), contents);
    assert_eq!(next_report(&mut reports).await.dropped, 1);
}

#[tokio::test]
async fn test_repeatedly_lost_ack_on_write() {
    let bed = Testbed::start();
    let contents = random_contents(1500);
    bed.keep_locally("up.bin", &contents).await;
    let plan = FaultPlan::new(FaultKind::Lose, FaultTarget::new(OpCode::Ack, Some(2)))
        .with_occurrences(2);
    let (proxy, mut reports) = bed.proxy(plan);

    assert_ok!(bed.client(proxy).write(&bed.local("up.bin"), "up.bin").await);
    assert_eq!(tokio::fs::read(bed.served("up.bin")).await.unwrap(), contents);
    assert_eq!(next_report(&mut reports).await.dropped, 2);
}

#[tokio::test]
async fn test_final_ack_lost_twice_on_write() {
    let bed = Testbed::start();
    let contents = random_contents(700);
    bed.keep_locally("tail.bin", &contents).await;
    // Block 2 is the short one, so its ack is the last packet of the transfer.
    let plan = FaultPlan::new(FaultKind::Lose, FaultTarget::new(OpCode::Ack, Some(2)))
        .with_occurrences(2);
    let (proxy, mut reports) = bed.proxy(plan);

    let report = assert_ok!(bed.client(proxy).write(&bed.local("tail.bin"), "tail.bin").await);
    assert_eq!(report.blocks, 2);
    assert_eq!(tokio::fs::read(bed.served("tail.bin")).await.unwrap(), contents);

    let relay = next_report(&mut reports).await;
    assert_eq!(relay.dropped, 2);
    assert!(relay.completed);
}

#[tokio::test]
async fn test_delayed_data_arrives_as_late_duplicate() {
    let bed = Testbed::start();
    let contents = random_contents(1500);
    bed.serve("slow.bin", &contents).await;
    // Longer than the endpoint timeout, so the block is retransmitted before the original shows up.
    let plan = FaultPlan::new(
        FaultKind::Delay(Duration::from_millis(500)),
        FaultTarget::new(OpCode::Data, Some(2)),
    );
    let (proxy, mut reports) = bed.proxy(plan);

    assert_ok!(bed.client(proxy).read("slow.bin", &bed.local("slow.bin")).await);
    assert_eq!(tokio::fs::read(bed.local("slow.bin")).await.unwrap(), contents);
    assert_eq!(next_report(&mut reports).await.delayed, 1);
}

#[tokio::test]
async fn test_duplicated_data_on_write() {
    let bed = Testbed::start();
    let contents = random_contents(1500);
    bed.keep_locally("twice.bin", &contents).await;
    let plan = FaultPlan::new(FaultKind::Duplicate, FaultTarget::new(OpCode::Data, Some(1)));
    let (proxy, mut reports) = bed.proxy(plan);

    assert_ok!(bed.client(proxy).write(&bed.local("twice.bin"), "twice.bin").await);
    assert_eq!(tokio::fs::read(bed.served("twice.bin")).await.unwrap(), contents);

    let relay = next_report(&mut reports).await;
    assert_eq!(relay.duplicated, 1);
    assert_eq!(relay.echoes, 1);
}

#[tokio::test]
async fn test_duplicated_request_starts_one_transfer() {
    let bed = Testbed::start();
    let contents = random_contents(900);
    bed.serve("once.bin", &contents).await;
    let plan = FaultPlan::new(FaultKind::Duplicate, FaultTarget::new(OpCode::Rrq, None));
    let (proxy, mut reports) = bed.proxy(plan);

    assert_ok!(bed.client(proxy).read("once.bin", &bed.local("once.bin")).await);
    assert_eq!(tokio::fs::read(bed.local("once.bin")).await.unwrap(), contents);

    let relay = next_report(&mut reports).await;
    assert_eq!(relay.duplicated, 1);
    assert_eq!(relay.foreign, 0);
}

#[tokio::test]
async fn test_unknown_tid_does_not_disturb_transfer() {
    let bed = Testbed::start();
    let contents = random_contents(1500);
    bed.serve("tid.bin", &contents).await;
    let plan = FaultPlan::new(FaultKind::UnknownTid, FaultTarget::new(OpCode::Data, Some(1)));
    let (proxy, mut reports) = bed.proxy(plan);

    assert_ok!(bed.client(proxy).read("tid.bin", &bed.local("tid.bin")).await);
    assert_eq!(tokio::fs::read(bed.local("tid.bin")).await.unwrap(), contents);
    assert_eq!(next_report(&mut reports).await.impersonated, 1);
}

#[tokio::test]
async fn test_corrupted_write_request_is_refused() {
    let bed = Testbed::start();
    bed.keep_locally("bad.bin", b"payload").await;

    for corruption in [Corruption::Filename, Corruption::Mode, Corruption::Terminator] {
        let plan =
            FaultPlan::new(FaultKind::Corrupt(corruption), FaultTarget::new(OpCode::Wrq, None));
        let (proxy, mut reports) = bed.proxy(plan);

        let err = assert_err!(bed.client(proxy).write(&bed.local("bad.bin"), "bad.bin").await);
        assert_eq!(err.remote_code(), Some(ErrorCode::Illegal), "{corruption} corruption");
        assert_eq!(next_report(&mut reports).await.corrupted, 1);
    }
    assert!(!bed.served("bad.bin").exists());
}

#[tokio::test]
async fn test_corrupted_ack_block_ends_read() {
    let bed = Testbed::start();
    bed.serve("blk.bin", &random_contents(1500)).await;
    let plan = FaultPlan::new(
        FaultKind::Corrupt(Corruption::BlockNumber),
        FaultTarget::new(OpCode::Ack, Some(1)),
    );
    let (proxy, mut reports) = bed.proxy(plan);

    let err = assert_err!(bed.client(proxy).read("blk.bin", &bed.local("blk.bin")).await);
    assert_eq!(err.remote_code(), Some(ErrorCode::Illegal));
    assert!(!bed.local("blk.bin").exists());

    let relay = next_report(&mut reports).await;
    assert_eq!(relay.corrupted, 1);
    assert!(!relay.completed);
}

#[tokio::test]
async fn test_oversize_data_is_rejected_by_client() {
    let bed = Testbed::start();
    bed.serve("fat.bin", &random_contents(1500)).await;
    let plan = FaultPlan::new(
        FaultKind::Corrupt(Corruption::Length),
        FaultTarget::new(OpCode::Data, Some(2)),
    );
    let (proxy, mut reports) = bed.proxy(plan);

    let err = assert_err!(bed.client(proxy).read("fat.bin", &bed.local("fat.bin")).await);
    assert!(matches!(err, TransferError::Illegal(_)));
    assert_eq!(next_report(&mut reports).await.corrupted, 1);
}

#[tokio::test]
async fn test_proxy_rejects_second_server_tid() {
    let bed = Testbed::start();
    let well_known = assert_ok!(TftpSocket::bind(localhost(0)));
    let (proxy, mut reports) = bed.proxy_for(well_known.local_addr().unwrap(), FaultPlan::none());

    let fake_server = tokio::spawn(async move {
        let (_, relay) = well_known.recv_with_timeout(WAIT).await.unwrap();
        let real = TftpSocket::bind(localhost(0)).unwrap();
        let impostor = TftpSocket::bind(localhost(0)).unwrap();

        let full = Packet::Data { block: 1, data: vec![1; DATA_BUFFER_SIZE] };
        real.send(&full, relay).await.unwrap();
        let (ack, _) = real.recv_with_timeout(WAIT).await.unwrap();
        assert_eq!(ack, Packet::Ack { block: 1 });

        impostor.send(&Packet::Data { block: 2, data: b"bogus".to_vec() }, relay).await.unwrap();
        let (rejection, _) = impostor.recv_with_timeout(WAIT).await.unwrap();

        real.send(&Packet::Data { block: 2, data: b"real".to_vec() }, relay).await.unwrap();
        let (ack, _) = real.recv_with_timeout(WAIT).await.unwrap();
        assert_eq!(ack, Packet::Ack { block: 2 });
        rejection
    });

    assert_ok!(bed.client(proxy).read("any.bin", &bed.local("any.bin")).await);
    let rejection = fake_server.await.unwrap();
    assert!(matches!(rejection, Packet::Error { code: ErrorCode::UnknownTid, .. }));

    let mut expected = vec![1; DATA_BUFFER_SIZE];
    expected.extend_from_slice(b"real");
    assert_eq!(tokio::fs::read(bed.local("any.bin")).await.unwrap(), expected);
    assert_eq!(next_report(&mut reports).await.foreign, 1);
}
