//! Tiny CLI client that sends a single QUERY to a master-server and prints
//! the directory it returns — a liveness probe, not a game client.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use masterd_core::codec::{decode, encode, Packet};
use tokio::net::UdpSocket;
use tokio::time::timeout;

#[derive(Parser, Debug)]
#[command(name = "masterd-probe", about = "Query a master-server's registered directory")]
struct Cli {
    /// Master-server address, e.g. master.example.org:2342
    server: String,

    /// Seconds to wait for a reply before giving up.
    #[arg(short, long, default_value_t = 3)]
    timeout: u64,

    /// Emit the directory as a JSON array instead of plain text.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let dest: SocketAddr = tokio::net::lookup_host(&cli.server)
        .await
        .with_context(|| format!("resolving {}", cli.server))?
        .next()
        .with_context(|| format!("no address found for {}", cli.server))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(dest).await?;
    socket.send(&encode(&Packet::Query)).await?;

    let mut entries = Vec::new();
    let deadline = Duration::from_secs(cli.timeout);
    let mut buf = [0u8; 2048];

    // A directory listing may arrive as several chunked QUERY_RESPONSE
    // datagrams; keep collecting until the per-read timeout elapses.
    loop {
        match timeout(deadline, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => match decode(&buf[..len]) {
                Ok(Packet::QueryResponse { entries: chunk }) => entries.extend(chunk),
                Ok(other) => bail!("unexpected response packet: {other:?}"),
                Err(e) => bail!("undecodable response: {e}"),
            },
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("no servers registered");
    } else {
        for entry in &entries {
            println!("{entry}");
        }
    }

    Ok(())
}
