use super::*;

#[test]
fn encodes_and_decodes_a_simple_query() {
    let query = Message::query(0x1234, "example.com", QTYPE_A);
    let bytes = query.encode();
    let decoded = Message::decode(&bytes).unwrap();
    assert_eq!(decoded.id, 0x1234);
    assert_eq!(decoded.questions.len(), 1);
    assert_eq!(decoded.questions[0].name, "example.com");
    assert_eq!(decoded.questions[0].qtype, QTYPE_A);
    assert!(!decoded.is_response());
}

#[test]
fn decodes_response_flags_and_rcode() {
    let mut bytes = Message::query(1, "example.com", QTYPE_A).encode();
    // Set QR, RA and RCODE=3 (NXDOMAIN) directly on the flags word.
    bytes[2] = 0x81;
    bytes[3] = 0x83;
    let decoded = Message::decode(&bytes).unwrap();
    assert!(decoded.is_response());
    assert_eq!(decoded.rcode(), 3);
}

#[test]
fn decodes_an_answer_with_a_record() {
    let mut message = Message::query(7, "example.com", QTYPE_A);
    message.flags |= 0x8000;
    let mut bytes = message.encode();
    // ancount = 1
    bytes[6] = 0;
    bytes[7] = 1;
    // answer: pointer to the question name at offset 12, type A, class IN, ttl 300, rdlength 4, 4 octets
    bytes.extend_from_slice(&[0xc0, 0x0c]);
    bytes.extend_from_slice(&QTYPE_A.to_be_bytes());
    bytes.extend_from_slice(&QCLASS_IN.to_be_bytes());
    bytes.extend_from_slice(&300u32.to_be_bytes());
    bytes.extend_from_slice(&4u16.to_be_bytes());
    bytes.extend_from_slice(&[192, 0, 2, 7]);

    let decoded = Message::decode(&bytes).unwrap();
    assert_eq!(decoded.answers.len(), 1);
    assert_eq!(decoded.answers[0].name, "example.com");
    assert_eq!(decoded.answers[0].address(), Some("192.0.2.7".parse().unwrap()));
}

#[test]
fn decodes_a_cname_target_through_compression() {
    let mut message = Message::query(9, "www.example.com", QTYPE_A);
    message.flags |= 0x8000;
    let mut bytes = message.encode();
    bytes[6] = 0;
    bytes[7] = 1;
    let question_name_offset = 12u16;
    bytes.extend_from_slice(&[0xc0, (question_name_offset & 0xff) as u8]);
    bytes.extend_from_slice(&QTYPE_CNAME.to_be_bytes());
    bytes.extend_from_slice(&QCLASS_IN.to_be_bytes());
    bytes.extend_from_slice(&300u32.to_be_bytes());

    let mut rdata = Vec::new();
    write_name(&mut rdata, "host.example.com");
    bytes.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    bytes.extend_from_slice(&rdata);

    let decoded = Message::decode(&bytes).unwrap();
    assert_eq!(decoded.answers.len(), 1);
    assert_eq!(decoded.answers[0].cname_target(&bytes), Some("host.example.com".to_string()));
}

#[test]
fn truncated_message_is_rejected() {
    let bytes = [0u8; 4];
    assert!(matches!(Message::decode(&bytes), Err(WireError::Truncated)));
}

#[test]
fn compression_pointer_loop_is_bounded() {
    // Two labels that point at each other forever.
    let mut bytes = vec![0u8; 12];
    bytes.extend_from_slice(&[0xc0, 12]);
    let result = read_name(&bytes, 12);
    assert_eq!(result, Err(WireError::TooManyCompressionJumps));
}
