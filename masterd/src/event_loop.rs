//! Owns the public and (optional) verification `UdpSocket`s and drives the
//! cooperative, single-task event loop described by spec.md §5: one
//! `tokio::select!` over both sockets plus a 1-second aging-pass tick, so
//! the directory never needs internal locking.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use masterd_core::codec::{decode, encode};
use tokio::net::UdpSocket;
use tokio::time::interval;

use crate::engine::{Outbound, ProtocolEngine};

/// Datagrams larger than this are rejected by the OS before we ever see
/// them, but a generous receive buffer keeps us future-proof against any
/// payload this protocol could legitimately carry.
const RECV_BUF_LEN: usize = 2048;

pub struct EventLoop {
    public_socket: UdpSocket,
    verification_socket: Option<UdpSocket>,
    engine: ProtocolEngine,
}

impl EventLoop {
    pub fn new(public_socket: UdpSocket, verification_socket: Option<UdpSocket>, engine: ProtocolEngine) -> Self {
        Self {
            public_socket,
            verification_socket,
            engine,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut aging_tick = interval(Duration::from_secs(1));
        let mut public_buf = [0u8; RECV_BUF_LEN];
        let mut verify_buf = [0u8; RECV_BUF_LEN];

        tracing::info!(
            public_addr = %self.public_socket.local_addr()?,
            verification_enabled = self.engine.verification_enabled(),
            "master-server event loop starting"
        );

        loop {
            // Biased so a tick that's ready alongside a datagram always runs
            // first, and the public socket is drained before the
            // verification socket on any tick where both are ready.
            tokio::select! {
                biased;

                _ = aging_tick.tick() => {
                    let outbound = self.engine.run_aging_pass(Instant::now());
                    self.send_all(outbound).await;
                }
                res = self.public_socket.recv_from(&mut public_buf) => {
                    match res {
                        Ok((len, src)) => self.on_public_datagram(&public_buf[..len], src).await,
                        Err(e) => tracing::warn!(error = %e, "public socket recv failed"),
                    }
                }
                res = recv_from_optional(&self.verification_socket, &mut verify_buf),
                    if self.verification_socket.is_some() => {
                    match res {
                        Ok((len, src)) => self.on_verification_datagram(&verify_buf[..len], src).await,
                        Err(e) => tracing::warn!(error = %e, "verification socket recv failed"),
                    }
                }
            }
        }
    }

    async fn on_public_datagram(&mut self, datagram: &[u8], src: SocketAddr) {
        let packet = match decode(datagram) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(%src, error = %e, "dropping undecodable datagram on public socket");
                return;
            }
        };
        let outbound = self.engine.handle_public(src, packet, Instant::now()).await;
        self.send_all(outbound).await;
    }

    async fn on_verification_datagram(&mut self, datagram: &[u8], src: SocketAddr) {
        let packet = match decode(datagram) {
            Ok(p) => p,
            Err(e) => {
                // Per spec.md §9: QUERY_RESPONSE parse failures are logged
                // with their cause and otherwise ignored, not retried.
                tracing::warn!(%src, error = %e, "dropping undecodable datagram on verification socket");
                return;
            }
        };
        let outbound = self.engine.handle_verification(src, packet);
        self.send_all(outbound).await;
    }

    async fn send_all(&mut self, outbound: Vec<Outbound>) {
        for item in outbound {
            let (socket, addr, packet) = match &item {
                Outbound::Public(addr, packet) => (&self.public_socket, *addr, packet),
                Outbound::Verification(addr, packet) => match &self.verification_socket {
                    Some(s) => (s, *addr, packet),
                    None => {
                        tracing::warn!(%addr, "dropping verification-bound packet: no verification socket configured");
                        continue;
                    }
                },
            };
            let bytes = encode(packet);
            if let Err(e) = socket.send_to(&bytes, addr).await {
                tracing::warn!(%addr, error = %e, "send failed");
            }
        }
    }
}

async fn recv_from_optional(
    socket: &Option<UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(s) => s.recv_from(buf).await,
        None => std::future::pending().await,
    }
}
