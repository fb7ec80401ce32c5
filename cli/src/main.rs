//! Tether CLI - an interactive WebSocket client.
//!
//! ```text
//! main() -> Args::parse -> resolve profile -> Socket::open
//!                                                 |
//!              stdin lines -> send       inbound -> stdout
//!                                                 |
//!                   EOF | Ctrl-C | peer close -> close
//! ```
//!
//! Diagnostics go to stderr so stdout carries only messages.

mod args;

use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tether_socket::{AbortReason, CLOSE_NORMAL, ListenOptions, Payload, SendOptions, Socket};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::args::Args;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

fn print_message(payload: &Payload) {
    let mut stdout = io::stdout().lock();
    let written = match payload {
        Payload::Text(text) => writeln!(stdout, "{text}"),
        Payload::Binary(bytes) => writeln!(stdout, "<{} bytes>", bytes.len()),
    };
    if let Err(err) = written.and_then(|()| stdout.flush()) {
        tracing::warn!("Failed to write message: {err}");
    }
}

enum Exit {
    InputClosed,
    Interrupted,
    PeerClosed(Option<AbortReason>),
}

async fn run(socket: &Socket) -> Result<Exit> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            reason = socket.closed() => return Ok(Exit::PeerClosed(reason)),
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                return Ok(Exit::Interrupted);
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    return Ok(Exit::InputClosed);
                };
                if line.is_empty() {
                    continue;
                }
                if let Err(err) = socket.send(line, SendOptions::default()).await {
                    if err.is_closed() || err.is_aborted() {
                        continue;
                    }
                    return Err(err).context("send failed");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();

    let config = Args::parse().resolve()?;

    let socket = Socket::open(config.url(), config.to_options())
        .await
        .with_context(|| format!("failed to open {}", config.url()))?;
    tracing::info!(
        url = socket.url(),
        protocol = socket.protocol().unwrap_or("-"),
        "Connected"
    );
    socket.listen(print_message, ListenOptions::default())?;

    let exit = run(&socket).await;
    socket.close(None).await?;

    match exit? {
        Exit::InputClosed => tracing::info!("End of input; closed"),
        Exit::Interrupted => tracing::info!("Interrupted; closed"),
        Exit::PeerClosed(Some(reason)) => {
            tracing::info!(%reason, "Connection closed by peer");
            if reason.as_connection().and_then(|err| err.code()) != Some(CLOSE_NORMAL) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Exit::PeerClosed(None) => tracing::info!("Connection closed"),
    }
    Ok(ExitCode::SUCCESS)
}
