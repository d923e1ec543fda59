//! Non-blocking DNS resolver: hosts-file precedence, a process-wide
//! positive/negative cache, CNAME chasing, Happy-Eyeballs `A`/`AAAA`
//! resolution, and per-server failover, all routed through a
//! [`transport::DnsTransport`] so UDP/DoT/DoQ are interchangeable.

pub mod cache;
pub mod hosts;
pub mod transport;
pub mod wire;

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use log::{debug, warn};

use cache::{Cache, CacheLookup};
use hosts::HostsFile;
use transport::DnsTransport;
use wire::{Message, ResourceRecord, QTYPE_A, QTYPE_AAAA, QTYPE_CNAME};

/// RFC 1035 §4.3.2's "should follow CNAMEs" is bounded here at 8 hops;
/// the 9th would-be hop fails closed rather than looping forever.
const MAX_CNAME_DEPTH: u8 = 8;

#[derive(Debug)]
pub enum ResolverError {
    NoServersConfigured,
    Timeout,
    NxDomain,
    TooManyCnameHops,
    Transport(String),
    MalformedResponse(String),
    Closed,
}

impl fmt::Display for ResolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverError::NoServersConfigured => write!(f, "no DNS servers configured"),
            ResolverError::Timeout => write!(f, "timeout"),
            ResolverError::NxDomain => write!(f, "name does not exist"),
            ResolverError::TooManyCnameHops => write!(f, "too many CNAME hops"),
            ResolverError::Transport(msg) => write!(f, "transport error: {msg}"),
            ResolverError::MalformedResponse(msg) => write!(f, "malformed response: {msg}"),
            ResolverError::Closed => write!(f, "resolver closed"),
        }
    }
}

impl std::error::Error for ResolverError {}

/// A record of an in-flight query, keyed by its wire id. In a fully
/// callback-driven reactor this would also carry the reply sink, the
/// serialized message for retransmission, and a cancellable retry timer;
/// here the retry loop is folded directly into [`Resolver::query`]'s
/// `await`, so only the bookkeeping needed to reject a stale/unknown id is
/// retained.
struct PendingQuery {
    name: String,
    qtype: u16,
}

enum ChaseOutcome {
    Done(Vec<ResourceRecord>),
    Chase(String),
    NxDomain,
}

/// Resolves names by trying each configured transport in order, maintains
/// a shared cache, and chases CNAMEs before giving an answer to the caller.
pub struct Resolver {
    transports: Vec<Arc<dyn DnsTransport>>,
    timeout: Duration,
    cache: Option<Arc<Cache>>,
    hosts_path: String,
    hosts: OnceLock<HostsFile>,
    next_id: AtomicU16,
    pending: Mutex<std::collections::HashMap<u16, PendingQuery>>,
}

impl Resolver {
    /// General constructor: each transport corresponds to one upstream
    /// server, tried in order on failure/timeout.
    pub fn new(transports: Vec<Arc<dyn DnsTransport>>, timeout: Duration, cache_capacity: usize, hosts_path: String) -> Self {
        Resolver {
            transports,
            timeout,
            cache: if cache_capacity > 0 { Some(Arc::new(Cache::new(cache_capacity))) } else { None },
            hosts_path,
            hosts: OnceLock::new(),
            next_id: AtomicU16::new(0),
            pending: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Convenience constructor for the common case of plain-UDP upstreams.
    pub fn new_udp(servers: Vec<std::net::SocketAddr>, timeout: Duration, cache_capacity: usize, hosts_path: String) -> Self {
        let transports = servers.into_iter().map(|addr| Arc::new(transport::udp::UdpTransport::new(addr)) as Arc<dyn DnsTransport>).collect();
        Resolver::new(transports, timeout, cache_capacity, hosts_path)
    }

    fn hosts_file(&self) -> &HostsFile {
        self.hosts.get_or_init(|| HostsFile::load(&self.hosts_path))
    }

    /// Resolves a hostname to addresses: hosts-file entries win outright;
    /// otherwise `A` and `AAAA` are queried in parallel and merged
    /// IPv6-first (Happy Eyeballs order), succeeding if either half
    /// produced a non-empty answer.
    pub async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolverError> {
        if let Some(addrs) = self.hosts_file().lookup(hostname) {
            return Ok(addrs.to_vec());
        }

        let (aaaa, a) = tokio::join!(self.query(hostname, QTYPE_AAAA), self.query(hostname, QTYPE_A));

        let mut addrs = Vec::new();
        let mut last_error = None;

        match aaaa {
            Ok(records) => addrs.extend(records.iter().filter_map(ResourceRecord::address)),
            Err(e) => last_error = Some(e),
        }
        let v6_count = addrs.len();
        match a {
            Ok(records) => addrs.extend(records.iter().filter_map(ResourceRecord::address)),
            Err(e) => last_error = Some(e),
        }
        debug!("resolve({hostname}): {v6_count} AAAA, {} A", addrs.len() - v6_count);

        if addrs.is_empty() {
            Err(last_error.unwrap_or(ResolverError::NxDomain))
        } else {
            Ok(addrs)
        }
    }

    /// Queries `name`/`qtype`, consulting and populating the cache, and
    /// chasing any `CNAME` the answer redirects through.
    pub async fn query(&self, name: &str, qtype: u16) -> Result<Vec<ResourceRecord>, ResolverError> {
        self.query_chasing(name.to_string(), qtype, 0).await
    }

    fn query_chasing(&self, name: String, qtype: u16, depth: u8) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<ResourceRecord>, ResolverError>> + '_>> {
        Box::pin(async move {
            if depth > MAX_CNAME_DEPTH {
                return Err(ResolverError::TooManyCnameHops);
            }

            if let Some(cache) = &self.cache {
                match cache.lookup(&name, qtype) {
                    CacheLookup::Positive(records) => return Ok(records),
                    CacheLookup::Negative => return Err(ResolverError::NxDomain),
                    CacheLookup::Miss => {}
                }
            }

            match self.query_once(&name, qtype).await? {
                ChaseOutcome::Done(records) => Ok(records),
                ChaseOutcome::NxDomain => Err(ResolverError::NxDomain),
                ChaseOutcome::Chase(target) => self.query_chasing(target, qtype, depth + 1).await,
            }
        })
    }

    /// Sends `name`/`qtype` to each configured server in order until one
    /// answers, handling CNAME chase and cache population for that single
    /// round trip.
    async fn query_once(&self, name: &str, qtype: u16) -> Result<ChaseOutcome, ResolverError> {
        if self.transports.is_empty() {
            return Err(ResolverError::NoServersConfigured);
        }

        let mut last_error = None;
        for (server_index, transport) in self.transports.iter().enumerate() {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let query_message = Message::query(id, name, qtype);
            let raw = query_message.encode();
            self.pending.lock().expect("dns pending table lock poisoned").insert(id, PendingQuery { name: name.to_string(), qtype });

            let outcome = match transport.send(&raw, self.timeout).await {
                Ok(response_bytes) => self.handle_response(&response_bytes, id, name, qtype),
                Err(e) => {
                    warn!("DNS query to server {server_index} ({}) failed: {e}", transport.protocol_name());
                    Err(ResolverError::Transport(e.to_string()))
                }
            };
            self.pending.lock().expect("dns pending table lock poisoned").remove(&id);

            match outcome {
                Ok(result) => return Ok(result),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or(ResolverError::Timeout))
    }

    fn handle_response(&self, response_bytes: &[u8], expected_id: u16, name: &str, qtype: u16) -> Result<ChaseOutcome, ResolverError> {
        let message = Message::decode(response_bytes).map_err(|e| ResolverError::MalformedResponse(e.to_string()))?;

        if message.id != expected_id {
            let pending = self.pending.lock().expect("dns pending table lock poisoned");
            if !pending.contains_key(&message.id) {
                warn!("DNS response for unknown id {} dropped", message.id);
            }
            return Err(ResolverError::MalformedResponse(format!("id mismatch: expected {expected_id}, got {}", message.id)));
        }

        if message.truncated() {
            warn!("DNS response for {name} was truncated; delivering the partial answer (TC=1 retry over TCP/DoT is not implemented)");
        }

        if message.rcode() == 3 {
            if let Some(cache) = &self.cache {
                cache.store_negative(name, qtype);
            }
            return Ok(ChaseOutcome::NxDomain);
        }

        let direct: Vec<ResourceRecord> = message.answers.iter().filter(|rr| rr.rtype == qtype).cloned().collect();
        if !direct.is_empty() {
            if let Some(cache) = &self.cache {
                cache.store_positive(name, qtype, direct.clone(), cache::min_ttl(&direct));
            }
            return Ok(ChaseOutcome::Done(direct));
        }

        if qtype != QTYPE_CNAME {
            if let Some(cname) = message.answers.iter().find(|rr| rr.rtype == QTYPE_CNAME) {
                if let Some(target) = cname.cname_target(response_bytes) {
                    return Ok(ChaseOutcome::Chase(target));
                }
            }
        }

        // No matching records and no CNAME to chase: an empty, non-error
        // answer. Cache it as negative so repeated lookups for genuinely
        // empty record sets don't re-query on every message.
        if let Some(cache) = &self.cache {
            cache.store_negative(name, qtype);
        }
        Ok(ChaseOutcome::NxDomain)
    }
}

#[cfg(test)]
#[path = "tests/resolver_tests.rs"]
mod tests;
