use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::{
    codec::{DEFAULT_MAX_FRAME_LEN, DEFAULT_MAX_OUTBOUND_FRAME_LEN},
    config::{DEFAULT_PORT, ServerConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Interface address to bind.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// TCP port to listen on. Prompted for on stdin when omitted.
    #[arg(long)]
    pub port: Option<u16>,

    /// Largest frame payload, in bytes, accepted from a client.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,

    /// Largest frame payload, in bytes, written to a client. Larger relays and
    /// rosters are dropped for that client.
    #[arg(long, default_value_t = DEFAULT_MAX_OUTBOUND_FRAME_LEN)]
    pub max_outbound_frame_len: usize,

    /// Milliseconds a single delivery may take before the recipient is dropped.
    #[arg(long, default_value_t = 5_000)]
    pub write_timeout_ms: u64,

    /// Milliseconds shutdown waits for session workers.
    #[arg(long, default_value_t = 10_000)]
    pub shutdown_grace_ms: u64,
}

impl ServeArgs {
    pub fn into_config(self, port: u16) -> ServerConfig {
        ServerConfig {
            listen: SocketAddr::new(self.bind, port),
            max_frame_len: self.max_frame_len,
            max_outbound_frame_len: self.max_outbound_frame_len,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name announced to the relay. May be empty.
    #[arg(long)]
    pub username: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:8888")]
    pub server: SocketAddr,
}

/// Asks the operator for a port on stdin. Empty input picks the default.
pub async fn prompt_port() -> Result<u16> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("Enter the server port (default {DEFAULT_PORT}): ").as_bytes())
        .await?;
    stdout.flush().await?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read port from stdin")?;
    parse_port_input(&line)
}

pub fn parse_port_input(input: &str) -> Result<u16> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(DEFAULT_PORT);
    }
    trimmed
        .parse()
        .with_context(|| format!("invalid port '{trimmed}'"))
}
