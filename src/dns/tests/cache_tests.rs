use super::*;
use crate::dns::wire::QTYPE_A;

fn sample_record() -> ResourceRecord {
    crate::dns::wire::Message::decode(&{
        let mut msg = crate::dns::wire::Message::query(1, "example.com", QTYPE_A);
        msg.flags |= 0x8000;
        let mut bytes = msg.encode();
        bytes[6] = 0;
        bytes[7] = 1;
        bytes.extend_from_slice(&[0xc0, 0x0c]);
        bytes.extend_from_slice(&QTYPE_A.to_be_bytes());
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(&300u32.to_be_bytes());
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&[192, 0, 2, 1]);
        bytes
    })
    .unwrap()
    .answers
    .remove(0)
}

#[test]
fn miss_on_empty_cache() {
    let cache = Cache::new(16);
    assert!(matches!(cache.lookup("example.com", QTYPE_A), CacheLookup::Miss));
}

#[test]
fn positive_entry_is_retrieved_until_expiry() {
    let cache = Cache::new(16);
    cache.store_positive("example.com", QTYPE_A, vec![sample_record()], Duration::from_secs(60));
    match cache.lookup("example.com", QTYPE_A) {
        CacheLookup::Positive(records) => assert_eq!(records.len(), 1),
        other => panic!("expected Positive, got {other:?}"),
    }
}

#[test]
fn negative_entry_is_retrieved() {
    let cache = Cache::new(16);
    cache.store_negative("nowhere.invalid", QTYPE_A);
    assert!(matches!(cache.lookup("nowhere.invalid", QTYPE_A), CacheLookup::Negative));
}

#[test]
fn lookup_is_case_insensitive() {
    let cache = Cache::new(16);
    cache.store_positive("Example.COM", QTYPE_A, vec![sample_record()], Duration::from_secs(60));
    assert!(matches!(cache.lookup("example.com", QTYPE_A), CacheLookup::Positive(_)));
}

#[test]
fn expired_entry_is_a_miss() {
    let cache = Cache::new(16);
    cache.store_positive("example.com", QTYPE_A, vec![sample_record()], Duration::from_secs(0));
    std::thread::sleep(Duration::from_millis(5));
    assert!(matches!(cache.lookup("example.com", QTYPE_A), CacheLookup::Miss));
}

#[test]
fn min_ttl_picks_the_smallest_record_ttl() {
    let mut a = sample_record();
    a.ttl = 300;
    let mut b = sample_record();
    b.ttl = 60;
    assert_eq!(min_ttl(&[a, b]), Duration::from_secs(60));
}
