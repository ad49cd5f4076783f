// A TFTP (RFC 1350) testbed: client, server and an error simulator that sits between them.
//
// Transfer begins with a request to read or write a file, sent to the server's well-known port.
// The server answers from a fresh port; the two ports (TIDs) identify the transfer from then on.
// A datagram from any other port gets an Unknown TID error and is otherwise ignored.
//
// Files move in 512 byte blocks, lockstep: every DATA is acked before the next one goes out. A
// block shorter than 512 bytes (possibly empty) ends the transfer.
//
// On loss, whoever is waiting times out and sends its last packet again. Duplicates are harmless:
// a repeated ACK is ignored, a repeated DATA is acked again. Whoever sends the final ACK lingers
// for a while in case it got lost and the final DATA shows up again.
//
// Most errors end the transfer. The error packet is a courtesy; it is never acked or retransmitted.
//
// ------------------------------
// Roles
//
// server  - serves files out of a directory, octet mode only, one task per transfer.
// client  - reads or writes one file per invocation.
// proxy   - the error simulator. Listens like a server, relays every transfer to the real server
//           through a port of its own, and injects one fault per transfer: loss, delay,
//           duplication, a copy from an unknown TID, or one of several corruptions.
//
// ------------------------------
// Packets
//
// opcode   operation
// 1        Read req (RRQ)      | 01 | Filename | 0 | Mode | 0 |
// 2        Write req (WRQ)     | 02 | Filename | 0 | Mode | 0 |
// 3        Data (DATA)         | 03 | Block # | Data (0-512 bytes) |
// 4        ACK                 | 04 | Block # |
// 5        ERROR               | 05 | ErrorCode | ErrMsg | 0 |
//
// Error codes
//
// 0    Not defined, see msg
// 1    File not found
// 2    Access violation
// 3    Disk full / alloc exceeded
// 4    Illegal TFTP op
// 5    Unknown TID
// 6    File already exists
// 7    No such user
//
// Logging goes through env_logger; RUST_LOG=debug shows every packet, RUST_LOG=trace every byte.

pub mod checker;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod fault;
pub mod processor;
pub mod proxy;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod storage;
pub mod tftp;

#[cfg(test)]
mod tests;

use anyhow::{bail, Context, Result};
use clap::Parser;
use client::Client;
use config::{Cli, Command, RetryPolicy};
use dispatcher::{Dispatcher, Mode};
use shutdown::{Shutdown, ShutdownListener, ShutdownState};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// First ctrl-c drains, the second one aborts whatever is still running.
fn handle_ctrl_c(shutdown: Shutdown) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match shutdown.escalate() {
                ShutdownState::Draining => {
                    log::info!("Finishing live transfers, press ctrl-c again to abort them")
                }
                _ => {
                    log::warn!("Aborting live transfers");
                    break;
                }
            }
        }
    });
}

/// A listener that fires on the first ctrl-c, for one-shot client transfers.
fn cancel_on_ctrl_c() -> ShutdownListener {
    let shutdown = Shutdown::new();
    let listener = shutdown.listener();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.abort();
        }
    });
    listener
}

async fn run_dispatcher(dispatcher: Dispatcher) -> Result<()> {
    let shutdown = Shutdown::new();
    let listener = shutdown.listener();
    handle_ctrl_c(shutdown);
    dispatcher.run(listener).await?;
    Ok(())
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no usable file name", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let retry = cli.retry_policy();

    match cli.command {
        Command::Server { listen, root } => {
            tokio::fs::create_dir_all(&root)
                .await
                .with_context(|| format!("Couldn't create {}", root.display()))?;
            log::info!("Serving {}", root.display());
            let dispatcher = Dispatcher::bind(listen, Mode::Server { root }, retry)
                .with_context(|| format!("Couldn't listen on {listen}"))?;
            run_dispatcher(dispatcher).await
        }
        Command::Proxy { listen, server, proxy_timeout_ms, fault } => {
            let plan = fault.plan()?;
            let proxy_retry =
                RetryPolicy::new(Duration::from_millis(proxy_timeout_ms), retry.max_retries);
            if proxy_retry.timeout <= retry.timeout {
                log::warn!(
                    "The proxy timeout should be longer than the endpoints' retransmission timeout"
                );
            }
            log::info!("Relaying to {server} with plan: {plan}");
            let dispatcher = Dispatcher::bind(listen, Mode::Proxy { server, plan }, proxy_retry)
                .with_context(|| format!("Couldn't listen on {listen}"))?;
            run_dispatcher(dispatcher).await
        }
        Command::Read { remote, local, server } => {
            let local = match local {
                Some(local) => local,
                None => PathBuf::from(file_name_of(Path::new(&remote))?),
            };
            let client = Client::new(server, retry).with_cancel(cancel_on_ctrl_c());
            match client.read(&remote, &local).await {
                Ok(report) => {
                    log::info!(
                        "Read {} bytes ({} blocks) into {}",
                        report.bytes,
                        report.blocks,
                        local.display()
                    );
                    Ok(())
                }
                Err(e) => bail!("File transfer failed: {e}"),
            }
        }
        Command::Write { local, remote, server } => {
            let remote = match remote {
                Some(remote) => remote,
                None => file_name_of(&local)?,
            };
            let client = Client::new(server, retry).with_cancel(cancel_on_ctrl_c());
            match client.write(&local, &remote).await {
                Ok(report) => {
                    log::info!(
                        "Wrote {} bytes ({} blocks) to {remote}",
                        report.bytes,
                        report.blocks
                    );
                    Ok(())
                }
                Err(e) => bail!("File transfer failed: {e}"),
            }
        }
    }
}
