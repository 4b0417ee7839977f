//! Non-blocking DNS resolver
//!
//! A single UDP socket registered with the socket engine, an in-flight
//! table keyed by 16-bit transaction id, and a TTL cache. Consumers
//! implement [`Resolver`] and receive exactly one terminal callback:
//! `on_complete` or `on_error`, never both, never neither.

mod cache;
pub mod wire;

pub use cache::{CachedAnswer, DnsCache};
pub use wire::QueryType;

use crate::config::DnsConfig;
use crate::error::{Error, Result};
use crate::event::{EventHandler, EventMask};
use crate::server::Core;
use crate::timer::TimerEvent;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, warn};

/// Why a lookup failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverError {
    /// The nameserver socket is unusable or the send failed
    NsDown,
    /// The nameserver answered negatively or unusably
    NxDomain,
    /// No reply arrived in time
    Timeout,
    /// The consumer's owning module is being unloaded
    ForceUnload,
}

impl fmt::Display for ResolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResolverError::NsDown => "NSDOWN",
            ResolverError::NxDomain => "NXDOMAIN",
            ResolverError::Timeout => "TIMEOUT",
            ResolverError::ForceUnload => "FORCEUNLOAD",
        };
        write!(f, "{}", text)
    }
}

/// Consumer of one lookup result.
///
/// Callbacks run while the resolver itself is mutably borrowed, so a
/// consumer must not re-enter the resolver synchronously; issue any
/// follow-up lookup from the run loop instead.
pub trait Resolver {
    /// Name of the owning module, for forced unload cleanup
    fn owner(&self) -> Option<&str> {
        None
    }

    /// The lookup succeeded. `cached` is true when served from cache
    /// without a wire exchange.
    fn on_complete(&mut self, core: &Core, answer: &str, ttl: u32, cached: bool);

    /// The lookup failed terminally
    fn on_error(&mut self, core: &Core, kind: ResolverError, message: &str);
}

struct PendingRequest {
    qtype: QueryType,
    orig: String,
}

/// The resolver: socket, in-flight table, consumer slots, cache
pub struct Dns {
    socket: Option<UdpSocket>,
    server: SocketAddr,
    enabled: bool,
    ip6munge: bool,
    timeout_secs: u64,
    event_mask: EventMask,
    requests: HashMap<u16, PendingRequest>,
    consumers: HashMap<u16, Box<dyn Resolver>>,
    cache: DnsCache,
    rng: StdRng,
}

impl Dns {
    /// Build a resolver from configuration. A socket that cannot be
    /// opened leaves the resolver in the down state: lookups fail with
    /// `NSDOWN` until a rehash succeeds.
    pub fn new(config: &DnsConfig) -> Result<Self> {
        let server_ip: IpAddr = config.server.parse().map_err(|_| {
            Error::Dns(format!("invalid nameserver address {:?}", config.server))
        })?;
        let server = SocketAddr::new(server_ip, config.port);
        let socket = if config.enabled {
            match open_socket(&server) {
                Ok(socket) => Some(socket),
                Err(e) => {
                    warn!(error = %e, "error creating dns socket; hostnames will not resolve");
                    None
                }
            }
        } else {
            None
        };
        Ok(Self {
            socket,
            server,
            enabled: config.enabled,
            ip6munge: config.ip6munge,
            timeout_secs: config.timeout_secs.max(1),
            event_mask: EventMask::NONE,
            requests: HashMap::new(),
            consumers: HashMap::new(),
            cache: DnsCache::new(),
            rng: StdRng::from_entropy(),
        })
    }

    /// Re-read configuration: reopen the socket and prune the cache.
    /// The caller re-registers the descriptor with the engine.
    pub fn rehash(&mut self, config: &DnsConfig, now: u64) -> Result<()> {
        let server_ip: IpAddr = config.server.parse().map_err(|_| {
            Error::Dns(format!("invalid nameserver address {:?}", config.server))
        })?;
        self.server = SocketAddr::new(server_ip, config.port);
        self.enabled = config.enabled;
        self.ip6munge = config.ip6munge;
        self.timeout_secs = config.timeout_secs.max(1);
        self.cache.prune(now);
        self.socket = if config.enabled {
            match open_socket(&self.server) {
                Ok(socket) => Some(socket),
                Err(e) => {
                    warn!(error = %e, "error creating dns socket; hostnames will not resolve");
                    None
                }
            }
        } else {
            None
        };
        Ok(())
    }

    /// Whether the resolver socket is usable
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Number of in-flight requests
    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }

    /// Start an A lookup. `None` when the query cannot be issued.
    pub fn resolve_a(&mut self, core: &Core, name: &str) -> Option<u16> {
        self.send_query(core, QueryType::A, name, name)
    }

    /// Start an AAAA lookup
    pub fn resolve_aaaa(&mut self, core: &Core, name: &str) -> Option<u16> {
        self.send_query(core, QueryType::Aaaa, name, name)
    }

    /// Start a CNAME lookup
    pub fn resolve_cname(&mut self, core: &Core, alias: &str) -> Option<u16> {
        self.send_query(core, QueryType::Cname, alias, alias)
    }

    /// Start a PTR lookup for an address. The reverse domain is built
    /// here; the original address text keys the cache entry.
    pub fn resolve_ptr(&mut self, core: &Core, ip: IpAddr) -> Option<u16> {
        let reverse = match ip {
            IpAddr::V4(v4) => wire::reverse_v4(v4),
            IpAddr::V6(v6) => wire::reverse_v6(v6),
        };
        let orig = ip.to_string();
        self.send_query(core, QueryType::Ptr, &reverse, &orig)
    }

    fn send_query(
        &mut self,
        core: &Core,
        qtype: QueryType,
        qname: &str,
        orig: &str,
    ) -> Option<u16> {
        if !self.enabled {
            return None;
        }
        let socket = self.socket.as_ref()?;
        if self.requests.len() > u16::MAX as usize {
            return None;
        }
        let mut id = self.rng.gen::<u16>();
        while self.requests.contains_key(&id) {
            id = self.rng.gen::<u16>();
        }
        let packet = match wire::build_query(id, qname, qtype) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(name = qname, error = %e, "cannot encode query");
                return None;
            }
        };
        match socket.send_to(&packet, self.server) {
            Ok(n) if n == packet.len() => {}
            Ok(_) => {
                debug!(name = qname, "short send on dns socket");
                return None;
            }
            Err(e) => {
                debug!(name = qname, error = %e, "send on dns socket failed");
                return None;
            }
        }
        self.requests.insert(
            id,
            PendingRequest {
                qtype,
                orig: orig.to_string(),
            },
        );
        let now = core.clock.now();
        core.timers.borrow_mut().add(
            now,
            self.timeout_secs,
            false,
            TimerEvent::DnsRequestTimeout(id),
        );
        debug!(id, name = qname, ?qtype, "dns request sent");
        Some(id)
    }

    /// Bind a consumer to an issued request id. Rejects an occupied
    /// slot.
    pub fn register_consumer(&mut self, id: u16, consumer: Box<dyn Resolver>) -> Result<()> {
        if self.consumers.contains_key(&id) {
            return Err(Error::Dns(format!("resolver slot {} is occupied", id)));
        }
        self.consumers.insert(id, consumer);
        Ok(())
    }

    /// High-level entry point: consult the cache, else issue the query
    /// and bind `consumer` to it. The consumer always receives exactly
    /// one callback, possibly synchronously from here (cache hit or
    /// `NSDOWN`).
    pub fn lookup(
        &mut self,
        core: &Core,
        qtype: QueryType,
        query: &str,
        mut consumer: Box<dyn Resolver>,
    ) -> Option<u16> {
        let now = core.clock.now();
        if let Some(entry) = self.cache.lookup(query, now) {
            let answer = entry.answer.clone();
            let ttl = entry.ttl_remaining(now) as u32;
            consumer.on_complete(core, &answer, ttl, true);
            return None;
        }
        let id = match qtype {
            QueryType::A => self.resolve_a(core, query),
            QueryType::Aaaa => self.resolve_aaaa(core, query),
            QueryType::Cname => self.resolve_cname(core, query),
            QueryType::Ptr => match query.parse::<IpAddr>() {
                Ok(ip) => self.resolve_ptr(core, ip),
                Err(_) => None,
            },
        };
        match id {
            Some(id) => {
                self.consumers.insert(id, consumer);
                Some(id)
            }
            None => {
                consumer.on_error(core, ResolverError::NsDown, "Nameserver is down");
                None
            }
        }
    }

    /// A request's timeout fired. Stale ids (already answered) are
    /// no-ops.
    pub fn handle_timeout(&mut self, core: &Core, id: u16) {
        if self.requests.remove(&id).is_none() {
            return;
        }
        debug!(id, "dns request timed out");
        if let Some(mut consumer) = self.consumers.remove(&id) {
            consumer.on_error(core, ResolverError::Timeout, "Request timed out");
        }
    }

    /// Fire `FORCEUNLOAD` on every consumer owned by `module` and drop
    /// their requests.
    pub fn clean_resolvers(&mut self, core: &Core, module: &str) {
        let ids: Vec<u16> = self
            .consumers
            .iter()
            .filter(|(_, consumer)| consumer.owner() == Some(module))
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            if let Some(mut consumer) = self.consumers.remove(&id) {
                consumer.on_error(
                    core,
                    ResolverError::ForceUnload,
                    "Parent module is unloading",
                );
            }
            self.requests.remove(&id);
        }
    }

    /// Cached answer and remaining TTL for a query key
    pub fn cache_lookup(&mut self, key: &str, now: u64) -> Option<(String, u64)> {
        self.cache
            .lookup(key, now)
            .map(|entry| (entry.answer.clone(), entry.ttl_remaining(now)))
    }

    /// Drop one cache entry
    pub fn cache_delete(&mut self, key: &str) -> bool {
        self.cache.delete(key)
    }

    /// Sweep expired cache entries
    pub fn prune(&mut self, now: u64) -> usize {
        let removed = self.cache.prune(now);
        if removed > 0 {
            debug!(removed, "pruned dns cache");
        }
        removed
    }

    /// Drop the whole cache
    pub fn clear(&mut self) -> usize {
        self.cache.clear()
    }

    /// Read and process one reply datagram
    fn process_reply(&mut self, core: &Core) {
        let socket = match self.socket.as_ref() {
            Some(socket) => socket,
            None => return,
        };
        let mut buf = [0u8; wire::MAX_PACKET_SIZE];
        let (length, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                debug!(error = %e, "recv on dns socket failed");
                return;
            }
        };
        if length < wire::HEADER_SIZE {
            return;
        }

        // Replies must come from the nameserver we queried, port and
        // address both. Off-path spoofing is still possible but no
        // longer trivial. The check cannot work under ip6munge.
        if !self.ip6munge && from != self.server {
            debug!(%from, "dropping dns reply from unexpected source");
            return;
        }

        let buf = &buf[..length];
        let header = match wire::Header::parse(buf) {
            Ok(header) => header,
            Err(_) => return,
        };
        let request = match self.requests.remove(&header.id) {
            Some(request) => request,
            // A reply for a request we never made.
            None => return,
        };
        let consumer = self.consumers.remove(&header.id);

        let outcome = parse_reply(buf, &header, request.qtype);
        let mut consumer = match consumer {
            Some(consumer) => consumer,
            None => return,
        };
        core.stats.record_dns_total();
        match outcome {
            Ok((answer, ttl)) => {
                core.stats.record_dns_good();
                let now = core.clock.now();
                self.cache.insert_if_absent(&request.orig, &answer, ttl, now);
                debug!(id = header.id, answer = %answer, ttl, "dns lookup complete");
                consumer.on_complete(core, &answer, ttl, false);
            }
            Err(message) => {
                core.stats.record_dns_bad();
                debug!(id = header.id, message = %message, "dns lookup failed");
                consumer.on_error(core, ResolverError::NxDomain, &message);
            }
        }
    }
}

impl EventHandler for Dns {
    fn fd(&self) -> RawFd {
        self.socket.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    fn event_mask(&self) -> EventMask {
        self.event_mask
    }

    fn set_event_mask(&mut self, mask: EventMask) {
        self.event_mask = mask;
    }

    fn on_readable(&mut self, core: &Core) {
        self.process_reply(core);
    }
}

fn open_socket(server: &SocketAddr) -> Result<UdpSocket> {
    let bind_addr = if server.is_ipv6() {
        SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(bind_addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn rcode_text(rcode: u8) -> String {
    match rcode {
        1 => "Query format error".to_string(),
        2 => "Nameserver internal failure".to_string(),
        3 => "Domain name not found".to_string(),
        5 => "Query refused".to_string(),
        other => format!("Nameserver error code {}", other),
    }
}

/// Walk a reply and extract the first answer matching the request.
/// Returns the decoded answer text and its TTL, or a failure reason.
fn parse_reply(
    buf: &[u8],
    header: &wire::Header,
    qtype: QueryType,
) -> std::result::Result<(String, u32), String> {
    if !header.is_response() {
        return Err("Not a query result".to_string());
    }
    if header.opcode() != 0 {
        return Err("Unexpected value in DNS reply packet".to_string());
    }
    if header.rcode() != 0 {
        return Err(rcode_text(header.rcode()));
    }
    if header.ancount < 1 {
        return Err("No resource records returned".to_string());
    }

    let mut pos = wire::skip_questions(buf, header.qdcount, wire::HEADER_SIZE)
        .map_err(|e| e.to_string())?;

    for _ in 0..header.ancount {
        pos = wire::skip_name(buf, pos).map_err(|e| e.to_string())?;
        let rr = wire::parse_rr_header(buf, pos).map_err(|e| e.to_string())?;
        pos += wire::RR_HEADER_SIZE;
        if rr.rtype != qtype.to_u16() || rr.class != wire::QCLASS_IN {
            pos += rr.rdlength as usize;
            continue;
        }
        if rr.rdlength as usize > wire::MAX_RDATA_LENGTH {
            return Err("Resource record too large".to_string());
        }
        if pos + rr.rdlength as usize > buf.len() {
            return Err("Resource record larger than stated".to_string());
        }
        let answer = decode_rdata(buf, pos, rr.rdlength, qtype)?;
        return Ok((answer, rr.ttl));
    }
    Err(format!(
        "No matching answer records ({} answers)",
        header.ancount
    ))
}

fn decode_rdata(
    buf: &[u8],
    pos: usize,
    rdlength: u16,
    qtype: QueryType,
) -> std::result::Result<String, String> {
    match qtype {
        QueryType::A => {
            if rdlength != 4 {
                return Err("Malformed A record".to_string());
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[pos..pos + 4]);
            Ok(std::net::Ipv4Addr::from(octets).to_string())
        }
        QueryType::Aaaa => {
            if rdlength != 16 {
                return Err("Malformed AAAA record".to_string());
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[pos..pos + 16]);
            let mut text = std::net::Ipv6Addr::from(octets).to_string();
            // A leading colon would be misread as a trailing-parameter
            // marker by line-based consumers downstream.
            if text.starts_with(':') {
                text.insert(0, '0');
            }
            Ok(text)
        }
        QueryType::Cname | QueryType::Ptr => {
            wire::decode_name(buf, pos).map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullConsumer;

    impl Resolver for NullConsumer {
        fn on_complete(&mut self, _core: &Core, _answer: &str, _ttl: u32, _cached: bool) {}
        fn on_error(&mut self, _core: &Core, _kind: ResolverError, _message: &str) {}
    }

    #[test]
    fn consumer_slots_reject_duplicates() {
        let config = DnsConfig {
            enabled: false,
            ..DnsConfig::default()
        };
        let mut dns = Dns::new(&config).unwrap();
        dns.register_consumer(7, Box::new(NullConsumer)).unwrap();
        assert!(dns.register_consumer(7, Box::new(NullConsumer)).is_err());
        assert!(dns.register_consumer(8, Box::new(NullConsumer)).is_ok());
    }

    #[test]
    fn cache_surface_delegates() {
        let config = DnsConfig {
            enabled: false,
            ..DnsConfig::default()
        };
        let mut dns = Dns::new(&config).unwrap();
        dns.cache.insert_if_absent("host.example", "192.0.2.9", 60, 100);
        assert_eq!(
            dns.cache_lookup("HOST.example", 110),
            Some(("192.0.2.9".to_string(), 50))
        );
        assert!(dns.cache_delete("host.example"));
        assert_eq!(dns.cache_lookup("host.example", 110), None);

        dns.cache.insert_if_absent("a", "1", 10, 0);
        dns.cache.insert_if_absent("b", "2", 1000, 0);
        assert_eq!(dns.prune(500), 1);
        assert_eq!(dns.clear(), 1);
    }

    fn reply_header(id: u16, ancount: u16) -> wire::Header {
        wire::Header {
            id,
            flags1: wire::FLAG1_QR | wire::FLAG1_RD,
            flags2: 0,
            qdcount: 1,
            ancount,
            nscount: 0,
            arcount: 0,
        }
    }

    /// Build a reply datagram echoing one question and carrying the
    /// given answer records as (type, class, ttl, rdata).
    fn build_reply(
        header: &wire::Header,
        question: (&str, QueryType),
        answers: &[(u16, u16, u32, Vec<u8>)],
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        header.encode(&mut buf);
        wire::encode_question(question.0, question.1, &mut buf).unwrap();
        for (rtype, class, ttl, rdata) in answers {
            // Compressed name pointing at the question name.
            buf.extend_from_slice(&[0xC0, 12]);
            buf.extend_from_slice(&rtype.to_be_bytes());
            buf.extend_from_slice(&class.to_be_bytes());
            buf.extend_from_slice(&ttl.to_be_bytes());
            buf.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            buf.extend_from_slice(rdata);
        }
        buf
    }

    #[test]
    fn parses_a_record() {
        let header = reply_header(7, 1);
        let buf = build_reply(
            &header,
            ("example.invalid", QueryType::A),
            &[(1, 1, 300, vec![192, 0, 2, 1])],
        );
        let (answer, ttl) = parse_reply(&buf, &header, QueryType::A).unwrap();
        assert_eq!(answer, "192.0.2.1");
        assert_eq!(ttl, 300);
    }

    #[test]
    fn skips_records_of_other_types() {
        let header = reply_header(7, 2);
        let mut cname_rdata = Vec::new();
        wire::encode_name("alias.example", &mut cname_rdata).unwrap();
        let buf = build_reply(
            &header,
            ("example.invalid", QueryType::A),
            &[
                (5, 1, 60, cname_rdata),
                (1, 1, 300, vec![192, 0, 2, 7]),
            ],
        );
        let (answer, ttl) = parse_reply(&buf, &header, QueryType::A).unwrap();
        assert_eq!(answer, "192.0.2.7");
        assert_eq!(ttl, 300);
    }

    #[test]
    fn ptr_records_decode_with_compression() {
        let header = reply_header(9, 1);
        let mut rdata = Vec::new();
        wire::encode_name("host.example.net", &mut rdata).unwrap();
        let buf = build_reply(
            &header,
            ("5.2.0.192.in-addr.arpa", QueryType::Ptr),
            &[(12, 1, 600, rdata)],
        );
        let (answer, _) = parse_reply(&buf, &header, QueryType::Ptr).unwrap();
        assert_eq!(answer, "host.example.net");
    }

    #[test]
    fn aaaa_with_leading_colon_gets_zero_prefix() {
        let header = reply_header(9, 1);
        let ip: std::net::Ipv6Addr = "::1".parse().unwrap();
        let buf = build_reply(
            &header,
            ("localhost", QueryType::Aaaa),
            &[(28, 1, 60, ip.octets().to_vec())],
        );
        let (answer, _) = parse_reply(&buf, &header, QueryType::Aaaa).unwrap();
        assert_eq!(answer, "0::1");
    }

    #[test]
    fn nonzero_rcode_fails_with_text() {
        let mut header = reply_header(3, 0);
        header.flags2 = 3;
        let buf = build_reply(&header, ("missing.invalid", QueryType::A), &[]);
        let err = parse_reply(&buf, &header, QueryType::A).unwrap_err();
        assert_eq!(err, "Domain name not found");
    }

    #[test]
    fn zero_answers_fail() {
        let header = reply_header(3, 0);
        let buf = build_reply(&header, ("empty.invalid", QueryType::A), &[]);
        let err = parse_reply(&buf, &header, QueryType::A).unwrap_err();
        assert_eq!(err, "No resource records returned");
    }

    #[test]
    fn reply_without_qr_bit_fails() {
        let mut header = reply_header(3, 1);
        header.flags1 = wire::FLAG1_RD;
        let buf = build_reply(
            &header,
            ("x.invalid", QueryType::A),
            &[(1, 1, 1, vec![192, 0, 2, 1])],
        );
        assert_eq!(
            parse_reply(&buf, &header, QueryType::A).unwrap_err(),
            "Not a query result"
        );
    }

    #[test]
    fn wrong_class_is_skipped_to_exhaustion() {
        let header = reply_header(3, 1);
        let buf = build_reply(
            &header,
            ("x.invalid", QueryType::A),
            &[(1, 3, 1, vec![192, 0, 2, 1])],
        );
        let err = parse_reply(&buf, &header, QueryType::A).unwrap_err();
        assert!(err.starts_with("No matching answer records"));
    }

    #[test]
    fn truncated_rdata_is_rejected() {
        let header = reply_header(3, 1);
        let mut buf = build_reply(
            &header,
            ("x.invalid", QueryType::A),
            &[(1, 1, 1, vec![192, 0, 2, 1])],
        );
        // Claim more rdata than the packet holds.
        let len = buf.len();
        buf[len - 6] = 0;
        buf[len - 5] = 200;
        assert_eq!(
            parse_reply(&buf, &header, QueryType::A).unwrap_err(),
            "Resource record larger than stated"
        );
    }
}
