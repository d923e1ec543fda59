use super::*;
use crate::dns::transport::TransportError;
use std::sync::atomic::AtomicUsize;

/// A transport that replays a fixed script of responses (by call index),
/// rewriting each response's id to match whatever the resolver sent, so
/// the fixture doesn't need to predict the wrapping id counter.
struct ScriptedTransport {
    responses: Vec<Option<Vec<u8>>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    fn new(responses: Vec<Option<Vec<u8>>>) -> Arc<Self> {
        Arc::new(ScriptedTransport { responses, calls: AtomicUsize::new(0) })
    }
}

#[async_trait::async_trait]
impl DnsTransport for ScriptedTransport {
    async fn send(&self, message: &[u8], _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let sent_id = u16::from_be_bytes([message[0], message[1]]);
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.responses.get(index).cloned().flatten() {
            Some(mut bytes) => {
                bytes[0] = (sent_id >> 8) as u8;
                bytes[1] = (sent_id & 0xff) as u8;
                Ok(bytes)
            }
            None => Err(TransportError::Timeout),
        }
    }

    fn protocol_name(&self) -> &'static str {
        "scripted"
    }
}

fn a_response(name: &str, addr: [u8; 4]) -> Vec<u8> {
    let mut message = Message::query(0, name, QTYPE_A);
    message.flags |= 0x8000;
    let mut bytes = message.encode();
    bytes[6] = 0;
    bytes[7] = 1;
    bytes.extend_from_slice(&[0xc0, 0x0c]);
    bytes.extend_from_slice(&QTYPE_A.to_be_bytes());
    bytes.extend_from_slice(&1u16.to_be_bytes());
    bytes.extend_from_slice(&300u32.to_be_bytes());
    bytes.extend_from_slice(&4u16.to_be_bytes());
    bytes.extend_from_slice(&addr);
    bytes
}

fn nxdomain_response(name: &str, qtype: u16) -> Vec<u8> {
    let mut message = Message::query(0, name, qtype);
    message.flags |= 0x8000 | 0x0003; // QR + RCODE=3
    message.encode()
}

fn cname_then_a(alias: &str, target: &str, addr: [u8; 4]) -> Vec<u8> {
    let mut message = Message::query(0, alias, QTYPE_A);
    message.flags |= 0x8000;
    let mut bytes = message.encode();
    bytes[6] = 0;
    bytes[7] = 1;
    bytes.extend_from_slice(&[0xc0, 0x0c]);
    bytes.extend_from_slice(&QTYPE_CNAME.to_be_bytes());
    bytes.extend_from_slice(&1u16.to_be_bytes());
    bytes.extend_from_slice(&300u32.to_be_bytes());
    let mut rdata = Vec::new();
    for label in target.split('.') {
        rdata.push(label.len() as u8);
        rdata.extend_from_slice(label.as_bytes());
    }
    rdata.push(0);
    bytes.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    bytes.extend_from_slice(&rdata);
    let _ = addr;
    bytes
}

#[tokio::test]
async fn resolves_a_record_and_populates_cache() {
    let transport = ScriptedTransport::new(vec![Some(a_response("example.com", [192, 0, 2, 7]))]);
    let resolver = Resolver::new(vec![transport], Duration::from_secs(1), 16, "/nonexistent-hosts".to_string());

    let records = resolver.query("example.com", QTYPE_A).await.unwrap();
    assert_eq!(records[0].address(), Some("192.0.2.7".parse().unwrap()));

    // Second call should hit the cache, not the (exhausted) scripted transport.
    let cached = resolver.query("example.com", QTYPE_A).await.unwrap();
    assert_eq!(cached[0].address(), Some("192.0.2.7".parse().unwrap()));
}

#[tokio::test]
async fn nxdomain_is_cached_negative() {
    let transport = ScriptedTransport::new(vec![Some(nxdomain_response("nowhere.invalid", QTYPE_A))]);
    let resolver = Resolver::new(vec![transport], Duration::from_secs(1), 16, "/nonexistent-hosts".to_string());

    let result = resolver.query("nowhere.invalid", QTYPE_A).await;
    assert!(matches!(result, Err(ResolverError::NxDomain)));

    let cached = resolver.query("nowhere.invalid", QTYPE_A).await;
    assert!(matches!(cached, Err(ResolverError::NxDomain)));
}

#[tokio::test]
async fn failover_tries_the_next_server() {
    let failing = ScriptedTransport::new(vec![None]);
    let working = ScriptedTransport::new(vec![Some(a_response("example.com", [203, 0, 113, 9]))]);
    let resolver = Resolver::new(vec![failing, working], Duration::from_millis(50), 16, "/nonexistent-hosts".to_string());

    let records = resolver.query("example.com", QTYPE_A).await.unwrap();
    assert_eq!(records[0].address(), Some("203.0.113.9".parse().unwrap()));
}

#[tokio::test]
async fn all_servers_exhausted_yields_timeout() {
    let failing = ScriptedTransport::new(vec![None]);
    let resolver = Resolver::new(vec![failing], Duration::from_millis(50), 16, "/nonexistent-hosts".to_string());

    let result = resolver.query("example.com", QTYPE_A).await;
    assert!(matches!(result, Err(ResolverError::Transport(_))));
}

#[tokio::test]
async fn cname_is_chased_to_its_target_address() {
    let transport = ScriptedTransport::new(vec![
        Some(cname_then_a("www.example.com", "host.example.com", [0, 0, 0, 0])),
        Some(a_response("host.example.com", [192, 0, 2, 55])),
    ]);
    let resolver = Resolver::new(vec![transport], Duration::from_secs(1), 16, "/nonexistent-hosts".to_string());

    let records = resolver.query("www.example.com", QTYPE_A).await.unwrap();
    assert_eq!(records[0].address(), Some("192.0.2.55".parse().unwrap()));
}

#[tokio::test]
async fn hosts_file_entries_short_circuit_network_queries() {
    let hosts_contents = "127.0.0.1 fixed.local\n";
    let path = std::env::temp_dir().join(format!("staged-net-hosts-test-{}", std::process::id()));
    std::fs::write(&path, hosts_contents).unwrap();

    let resolver = Resolver::new(Vec::new(), Duration::from_secs(1), 16, path.to_string_lossy().into_owned());
    let addrs = resolver.resolve("fixed.local").await.unwrap();
    assert_eq!(addrs, vec!["127.0.0.1".parse::<std::net::IpAddr>().unwrap()]);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn query_ids_wrap_around_after_65536_allocations() {
    let resolver = Resolver::new(Vec::new(), Duration::from_secs(1), 16, "/nonexistent-hosts".to_string());
    resolver.next_id.store(u16::MAX, Ordering::SeqCst);
    let last = resolver.next_id.fetch_add(1, Ordering::SeqCst);
    let wrapped = resolver.next_id.load(Ordering::SeqCst);
    assert_eq!(last, u16::MAX);
    assert_eq!(wrapped, 0);
}
