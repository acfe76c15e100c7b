//! Protocol engine: dispatches decoded packets against the directory state
//! machine (spec.md §4.3, §4.4, §4.6). Owns no socket; the event loop feeds
//! it datagrams and ticks, and sends whatever this module hands back.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use masterd_core::ban::BanFilter;
use masterd_core::codec::{chunk_entries, Packet, ServerQueryResponse, MAX_RESPONSE_LEN};
use masterd_core::config::DEFAULT_PORT;
use masterd_core::directory::Directory;
use masterd_core::record::ServerMetadata;
use masterd_core::signer::DemoSigner;

/// An outbound datagram destined for a specific socket. The event loop maps
/// these onto the public or verification `UdpSocket` it owns.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Public(SocketAddr, Packet),
    Verification(SocketAddr, Packet),
}

/// How often (in aging-pass ticks) the signer's issued-nonce set is swept,
/// bounding memory from abandoned SIGN_START calls that never reach
/// SIGN_END (see `Ed25519DemoSigner::gc_nonces`).
const NONCE_GC_INTERVAL_TICKS: u64 = 300;

pub struct ProtocolEngine {
    directory: Directory,
    ban: BanFilter,
    signer: Option<Arc<dyn DemoSigner>>,
    server_timeout: Duration,
    metadata_refresh_time: Duration,
    /// The master's own verification-socket address, advertised to
    /// NAT-encumbered servers during self-directed hole-punch escalation.
    /// `None` disables verification entirely (spec.md §6).
    verification_addr: Option<SocketAddr>,
    aging_ticks: u64,
}

impl ProtocolEngine {
    pub fn new(
        ban: BanFilter,
        signer: Option<Arc<dyn DemoSigner>>,
        server_timeout: Duration,
        metadata_refresh_time: Duration,
        verification_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            directory: Directory::new(),
            ban,
            signer,
            server_timeout,
            metadata_refresh_time,
            verification_addr,
            aging_ticks: 0,
        }
    }

    #[cfg(test)]
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn verification_enabled(&self) -> bool {
        self.verification_addr.is_some()
    }

    /// Handle a datagram received on the public socket.
    pub async fn handle_public(&mut self, src: SocketAddr, packet: Packet, now: Instant) -> Vec<Outbound> {
        match packet {
            Packet::Add => self.handle_add(src, now),
            Packet::Query => self.handle_query(src),
            Packet::GetMetadata => self.handle_get_metadata(src, now),
            Packet::SignStart => self.handle_sign_start(src).await,
            Packet::SignEnd { hash, start_message } => {
                self.handle_sign_end(src, hash, start_message).await
            }
            Packet::NatHolePunch { target } => self.handle_nat_hole_punch(src, &target),
            Packet::NatHolePunchAll => self.handle_nat_hole_punch_all(src),
            Packet::Unknown(t) => {
                tracing::debug!(%src, r#type = t, "dropping unrecognised packet type on public socket");
                vec![]
            }
            other => {
                tracing::debug!(%src, packet = ?other, "unexpected packet type on public socket");
                vec![]
            }
        }
    }

    /// Handle a datagram received on the verification socket.
    pub fn handle_verification(&mut self, src: SocketAddr, packet: Packet) -> Vec<Outbound> {
        match packet {
            Packet::VerifyQueryResponse(resp) => self.handle_verify_query_response(src, resp, Instant::now()),
            Packet::VerifyNatHolePunch => self.handle_verify_nat_hole_punch(src),
            Packet::Unknown(t) => {
                tracing::debug!(%src, r#type = t, "dropping unrecognised packet type on verification socket");
                vec![]
            }
            other => {
                tracing::debug!(%src, packet = ?other, "unexpected packet type on verification socket");
                vec![]
            }
        }
    }

    fn handle_add(&mut self, src: SocketAddr, now: Instant) -> Vec<Outbound> {
        if self.ban.is_blocked(&src) {
            tracing::info!(%src, "dropping ADD from blocked source");
            return vec![];
        }

        self.directory.upsert(src, now);

        let record = self.directory.get_mut(&src).expect("just upserted");
        if record.verified {
            if let Some(age) = record.metadata_age(now) {
                if age > self.metadata_refresh_time {
                    record.mark_stale();
                }
            }
        }

        let record = self.directory.get(&src).expect("just upserted");
        if record.verified {
            vec![Outbound::Public(src, Packet::AddResponse { success: true })]
        } else if self.verification_enabled() {
            vec![Outbound::Verification(src, Packet::VerifyQuery)]
        } else {
            // No verification socket configured: the server will time out
            // its 5s deadline in the aging pass and receive success=0 then.
            vec![]
        }
    }

    fn handle_verify_query_response(
        &mut self,
        src: SocketAddr,
        resp: ServerQueryResponse,
        now: Instant,
    ) -> Vec<Outbound> {
        let Some(record) = self.directory.get_mut(&src) else {
            tracing::debug!(%src, "QUERY_RESPONSE from unregistered source, dropping");
            return vec![];
        };

        let metadata = ServerMetadata::from(&resp);
        record.set_metadata(metadata, now);
        let was_verified = record.verified;
        record.verified = true;

        if was_verified {
            vec![]
        } else {
            vec![Outbound::Public(src, Packet::AddResponse { success: true })]
        }
    }

    fn handle_verify_nat_hole_punch(&mut self, src: SocketAddr) -> Vec<Outbound> {
        match self.directory.get(&src) {
            Some(record) if !record.verified && record.needs_hole_punch => {
                vec![Outbound::Verification(src, Packet::VerifyQuery)]
            }
            _ => vec![],
        }
    }

    fn handle_query(&self, src: SocketAddr) -> Vec<Outbound> {
        let entries: Vec<String> = self
            .directory
            .verified_snapshot()
            .map(|r| format!("{}:{}", r.addr.ip(), r.addr.port()))
            .collect();

        chunk_entries(&entries, MAX_RESPONSE_LEN, 2)
            .into_iter()
            .map(|chunk| Outbound::Public(src, Packet::QueryResponse { entries: chunk }))
            .collect()
    }

    fn handle_get_metadata(&self, src: SocketAddr, now: Instant) -> Vec<Outbound> {
        let entries: Vec<String> = self
            .directory
            .verified_snapshot()
            .filter_map(|r| r.to_metadata_json(now))
            .map(|v| v.to_string())
            .collect();

        chunk_entries(&entries, MAX_RESPONSE_LEN, 2)
            .into_iter()
            .map(|chunk| Outbound::Public(src, Packet::GetMetadataResponse { entries: chunk }))
            .collect()
    }

    async fn handle_sign_start(&self, src: SocketAddr) -> Vec<Outbound> {
        let Some(signer) = &self.signer else {
            return vec![];
        };
        let (nonce, signature) = signer.sign_start().await;
        tracing::info!(%src, nonce = %signer.hex(&nonce.0), "issued SIGN_START nonce");
        vec![Outbound::Public(src, Packet::SignStartResponse { nonce, signature })]
    }

    async fn handle_sign_end(&self, src: SocketAddr, hash: [u8; 20], start_message: Vec<u8>) -> Vec<Outbound> {
        let Some(signer) = &self.signer else {
            return vec![];
        };
        match signer.sign_end(&start_message, &hash).await {
            Some(signature) => vec![Outbound::Public(src, Packet::SignEndResponse { signature })],
            None => {
                tracing::warn!(%src, "SIGN_END failed signature verification, dropping");
                vec![]
            }
        }
    }

    fn handle_nat_hole_punch(&self, src: SocketAddr, target: &str) -> Vec<Outbound> {
        let Some(target_addr) = parse_hole_punch_target(target) else {
            tracing::warn!(%src, target, "malformed NAT_HOLE_PUNCH target, dropping");
            return vec![];
        };

        let Some(record) = self.directory.get(&target_addr) else {
            tracing::debug!(%src, %target_addr, "NAT_HOLE_PUNCH target not registered, dropping");
            return vec![];
        };

        if record.needs_hole_punch {
            let payload = format!("{}:{}", src.ip(), src.port());
            vec![Outbound::Public(target_addr, Packet::NatHolePunch { target: payload })]
        } else {
            vec![]
        }
    }

    fn handle_nat_hole_punch_all(&self, src: SocketAddr) -> Vec<Outbound> {
        self.directory
            .all_snapshot()
            .filter(|r| r.needs_hole_punch)
            .map(|r| {
                let payload = format!("{}:{}", src.ip(), src.port());
                Outbound::Public(r.addr, Packet::NatHolePunch { target: payload })
            })
            .collect()
    }

    /// Sweep the directory once per tick: destroy silent records, escalate
    /// to hole-punch at 2s, fail verification at 5s (spec.md §4.4). `now`
    /// is sampled once by the caller so every record is judged against the
    /// same instant.
    pub fn run_aging_pass(&mut self, now: Instant) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        let addrs: Vec<SocketAddr> = self.directory.all_snapshot().map(|r| r.addr).collect();

        for addr in addrs {
            let Some(record) = self.directory.get(&addr) else {
                continue;
            };
            let silence = record.silence(now);

            if silence > self.server_timeout {
                tracing::info!(%addr, "server heartbeat timed out, removing");
                self.directory.remove(&addr);
                continue;
            }

            if record.verified {
                continue;
            }

            if let Some(verification_addr) = self.verification_addr {
                if !record.needs_hole_punch && silence > Duration::from_secs(2) {
                    if let Some(record) = self.directory.get_mut(&addr) {
                        record.needs_hole_punch = true;
                    }
                    let payload = format!("{}:{}", verification_addr.ip(), verification_addr.port());
                    outbound.push(Outbound::Public(addr, Packet::NatHolePunch { target: payload }));
                }
            }

            if silence > Duration::from_secs(5) {
                outbound.push(Outbound::Public(addr, Packet::AddResponse { success: false }));
                self.directory.remove(&addr);
            }
        }

        self.aging_ticks += 1;
        if let Some(signer) = self.signer.as_ref().and_then(downcast_ed25519) {
            if self.aging_ticks % NONCE_GC_INTERVAL_TICKS == 0 {
                signer.gc_nonces();
            }
        }

        outbound
    }
}

/// The `DemoSigner` trait doesn't expose nonce GC as a first-class method
/// (it's an implementation detail of `Ed25519DemoSigner`, not part of the
/// spec.md §6 contract), so the engine reaches for it via `as_any` rather
/// than widening the trait for every future signer backend.
fn downcast_ed25519(
    signer: &Arc<dyn DemoSigner>,
) -> Option<&masterd_core::signer::Ed25519DemoSigner> {
    signer.as_any().downcast_ref()
}

/// Parse a hole-punch target string. Per spec.md §9's first Open Question,
/// this preserves the source's looseness: a bare host with no `:` falls
/// back to the canonical public port, and the target host is never checked
/// against the directory entry beyond the address lookup itself.
fn parse_hole_punch_target(s: &str) -> Option<SocketAddr> {
    if let Some((host, port)) = s.rsplit_once(':') {
        let port: u16 = port.parse().ok()?;
        let ip: Ipv4Addr = host.parse().ok()?;
        return Some(SocketAddr::new(ip.into(), port));
    }
    let ip: Ipv4Addr = s.parse().ok()?;
    Some(SocketAddr::new(ip.into(), DEFAULT_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use masterd_core::codec::ServerQueryResponse;

    fn engine() -> ProtocolEngine {
        ProtocolEngine::new(
            BanFilter::default(),
            None,
            Duration::from_secs(30),
            Duration::from_secs(60),
            Some("127.0.0.1:2343".parse().unwrap()),
        )
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn happy_path_registration() {
        let mut engine = engine();
        let server = addr("203.0.113.5:2342");
        let now = Instant::now();

        let out = engine.handle_add(server, now);
        assert_eq!(out, vec![Outbound::Verification(server, Packet::VerifyQuery)]);

        let resp = ServerQueryResponse {
            version: "Chocolate Doom 3.0.1".into(),
            state: 0,
            num_players: 1,
            max_players: 4,
            mode: 0,
            mission: 0,
            name: "Arena".into(),
        };
        let out = engine.handle_verify_query_response(server, resp, now);
        assert_eq!(
            out,
            vec![Outbound::Public(server, Packet::AddResponse { success: true })]
        );
        assert!(engine.directory().get(&server).unwrap().verified);
    }

    #[tokio::test]
    async fn banned_source_is_dropped() {
        let ban = BanFilter::new(&["198.51.100.*:*".to_string()]).unwrap();
        let mut engine = ProtocolEngine::new(ban, None, Duration::from_secs(30), Duration::from_secs(60), None);
        let server = addr("198.51.100.7:2342");
        let out = engine.handle_add(server, Instant::now());
        assert!(out.is_empty());
        assert!(!engine.directory().contains(&server));
    }

    #[test]
    fn query_only_returns_verified_servers() {
        let mut engine = engine();
        let now = Instant::now();
        let a = addr("203.0.113.1:1");
        let b = addr("203.0.113.2:2");
        engine.directory.upsert(a, now);
        engine.directory.upsert(b, now);
        engine.directory.get_mut(&b).unwrap().verified = true;

        let out = engine.handle_query(addr("198.51.100.9:5000"));
        assert_eq!(out.len(), 1);
        match &out[0] {
            Outbound::Public(_, Packet::QueryResponse { entries }) => {
                assert_eq!(entries, &vec!["203.0.113.2:2".to_string()]);
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[test]
    fn hole_punch_target_parsing_falls_back_to_default_port() {
        assert_eq!(
            parse_hole_punch_target("203.0.113.5"),
            Some(addr("203.0.113.5:2342"))
        );
        assert_eq!(
            parse_hole_punch_target("203.0.113.5:4000"),
            Some(addr("203.0.113.5:4000"))
        );
        assert_eq!(parse_hole_punch_target("not-an-address"), None);
    }

    #[test]
    fn aging_pass_escalates_then_fails_unverified_record() {
        let mut engine = engine();
        let server = addr("203.0.113.5:2342");
        let t0 = Instant::now();
        engine.directory.upsert(server, t0);

        let out = engine.run_aging_pass(t0 + Duration::from_millis(500));
        assert!(out.is_empty());

        let out = engine.run_aging_pass(t0 + Duration::from_secs(3));
        assert!(matches!(out.as_slice(), [Outbound::Public(_, Packet::NatHolePunch { .. })]));
        assert!(engine.directory().get(&server).unwrap().needs_hole_punch);

        let out = engine.run_aging_pass(t0 + Duration::from_secs(6));
        assert_eq!(
            out,
            vec![Outbound::Public(server, Packet::AddResponse { success: false })]
        );
        assert!(!engine.directory().contains(&server));
    }

    #[test]
    fn aging_pass_removes_timed_out_heartbeat() {
        let mut engine = engine();
        let server = addr("203.0.113.5:2342");
        let t0 = Instant::now();
        engine.directory.upsert(server, t0);
        engine.directory.get_mut(&server).unwrap().verified = true;

        let out = engine.run_aging_pass(t0 + Duration::from_secs(31));
        assert!(out.is_empty());
        assert!(!engine.directory().contains(&server));
    }

    #[test]
    fn client_query_returns_three_entries_in_directory_order() {
        let mut engine = engine();
        let now = Instant::now();
        for addr_str in ["203.0.113.5:1", "203.0.113.5:2", "203.0.113.5:3"] {
            let a = addr(addr_str);
            engine.directory.upsert(a, now);
            engine.directory.get_mut(&a).unwrap().verified = true;
        }

        let out = engine.handle_query(addr("198.51.100.9:5000"));
        let all_entries: Vec<String> = out
            .into_iter()
            .flat_map(|o| match o {
                Outbound::Public(_, Packet::QueryResponse { entries }) => entries,
                other => panic!("unexpected outbound: {other:?}"),
            })
            .collect();
        let mut expected = vec!["203.0.113.5:1".to_string(), "203.0.113.5:2".to_string(), "203.0.113.5:3".to_string()];
        let mut actual = all_entries;
        expected.sort();
        actual.sort();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn idempotent_add_within_refresh_window_emits_no_query() {
        let mut engine = engine();
        let server = addr("203.0.113.5:2342");
        let now = Instant::now();

        engine.handle_add(server, now);
        let resp = ServerQueryResponse {
            version: "Chocolate Doom 3.0.1".into(),
            state: 0,
            num_players: 0,
            max_players: 4,
            mode: 0,
            mission: 0,
            name: "Arena".into(),
        };
        engine.handle_verify_query_response(server, resp, now);
        assert!(engine.directory().get(&server).unwrap().verified);

        // Same address ADDs again well inside metadata_refresh_time (60s).
        let out = engine.handle_add(server, now + Duration::from_secs(10));
        assert_eq!(
            out,
            vec![Outbound::Public(server, Packet::AddResponse { success: true })],
            "no outbound re-verification QUERY expected on idempotent re-ADD"
        );
    }

    #[tokio::test]
    async fn metadata_refresh_reverifies_before_responding() {
        let mut engine = engine();
        let server = addr("203.0.113.5:2342");
        let t0 = Instant::now();

        engine.handle_add(server, t0);
        let resp = ServerQueryResponse {
            version: "Chocolate Doom 3.0.1".into(),
            state: 0,
            num_players: 0,
            max_players: 4,
            mode: 0,
            mission: 0,
            name: "Arena".into(),
        };
        engine.handle_verify_query_response(server, resp.clone(), t0);

        // metadata_time is now 61s old, past metadata_refresh_time (60s).
        let stale_now = t0 + Duration::from_secs(61);
        let out = engine.handle_add(server, stale_now);
        assert_eq!(out, vec![Outbound::Verification(server, Packet::VerifyQuery)]);
        assert!(!engine.directory().get(&server).unwrap().verified);

        let out = engine.handle_verify_query_response(server, resp, stale_now);
        assert_eq!(
            out,
            vec![Outbound::Public(server, Packet::AddResponse { success: true })]
        );
        assert!(engine.directory().get(&server).unwrap().verified);
    }

    #[tokio::test]
    async fn signed_demo_cycle_rejects_replay_after_nonce_cleared() {
        use masterd_core::signer::{DemoSigner as _, Ed25519DemoSigner};

        let signer: Arc<dyn DemoSigner> = Arc::new(Ed25519DemoSigner::from_seed_hex(&"42".repeat(32)).unwrap());
        let mut engine = ProtocolEngine::new(
            BanFilter::default(),
            Some(signer),
            Duration::from_secs(30),
            Duration::from_secs(60),
            Some(addr("127.0.0.1:2343")),
        );
        let client = addr("198.51.100.9:5000");
        let hash = [9u8; 20];

        let out = engine.handle_sign_start(client).await;
        let (nonce, signature) = match &out[0] {
            Outbound::Public(_, Packet::SignStartResponse { nonce, signature }) => {
                (nonce.clone(), signature.clone())
            }
            other => panic!("unexpected outbound: {other:?}"),
        };
        let mut start_message = nonce.0.to_vec();
        start_message.extend_from_slice(signature.as_bytes());

        let out = engine.handle_sign_end(client, hash, start_message.clone()).await;
        assert!(matches!(
            out.as_slice(),
            [Outbound::Public(_, Packet::SignEndResponse { .. })]
        ));

        // Nonce is consumed by the first SIGN_END; a replay yields no packet.
        let out = engine.handle_sign_end(client, hash, start_message).await;
        assert!(out.is_empty());
    }

    #[test]
    fn hole_punch_brokering_forwards_to_target_only() {
        let mut engine = engine();
        let now = Instant::now();
        let server = addr("203.0.113.5:2342");
        let client = addr("198.51.100.9:5000");
        engine.directory.upsert(server, now);
        engine.directory.get_mut(&server).unwrap().verified = true;
        engine.directory.get_mut(&server).unwrap().needs_hole_punch = true;

        let out = engine.handle_nat_hole_punch(client, "203.0.113.5:2342");
        assert_eq!(
            out,
            vec![Outbound::Public(
                server,
                Packet::NatHolePunch { target: "198.51.100.9:5000".to_string() }
            )]
        );
    }
}
