//! CDR transport. In active mode the PBX connects to us; in passive
//! mode we dial out to the PBX's listener. Either way, each connection
//! is a stream of CSV lines handled sequentially.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::CdrMode;
use crate::state::AppState;

use super::CdrProcessor;

const RECONNECT_DELAY: Duration = Duration::from_secs(10);

pub async fn run(state: AppState, processor: CdrProcessor, cancel: CancellationToken) -> Result<()> {
    match state.config.cdr_mode {
        CdrMode::Off => {
            info!("CDR disabled");
            Ok(())
        }
        CdrMode::Active => {
            let addr = state.config.cdr_bind_addr()?;
            run_active(processor, addr, cancel).await
        }
        CdrMode::Passive => {
            let addr = state
                .config
                .cdr_addr
                .clone()
                .context("CDR_ADDR is not configured")?;
            run_passive(processor, addr, cancel).await;
            Ok(())
        }
    }
}

async fn run_active(
    processor: CdrProcessor,
    addr: std::net::SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind CDR listener on {addr}"))?;

    info!(%addr, "CDR listener started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let processor = processor.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            handle_connection(processor, stream, &peer.to_string(), cancel).await;
                        });
                    }
                    Err(err) => {
                        error!(error = %err, "failed to accept CDR connection");
                    }
                }
            }
        }
    }
}

async fn run_passive(processor: CdrProcessor, addr: String, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            connected = TcpStream::connect(&addr) => {
                match connected {
                    Ok(stream) => {
                        info!(addr, "connected to CDR feed");
                        handle_connection(processor.clone(), stream, &addr, cancel.clone()).await;
                    }
                    Err(err) => {
                        error!(addr, error = %err, "failed to connect to CDR feed");
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn handle_connection(
    processor: CdrProcessor,
    stream: TcpStream,
    peer: &str,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => processor.process_line(&line).await,
                    Ok(None) => {
                        info!(peer, "CDR connection closed");
                        return;
                    }
                    Err(err) => {
                        error!(peer, error = %err, "failed to read CDR record");
                        return;
                    }
                }
            }
        }
    }
}
