use super::*;
use tokio::io::{self, BufReader, BufWriter};

fn create_test_protocol() -> Pop3Protocol<BufReader<io::Empty>, BufWriter<io::Sink>> {
    Pop3Protocol::new(BufReader::new(io::empty()), BufWriter::new(io::sink()))
}

const NO_AUTH: &[String] = &[];

#[tokio::test]
async fn user_enters_awaiting_password() {
    let mut protocol = create_test_protocol();
    let result = protocol.process_command("USER alice", false, NO_AUTH).await.unwrap();
    assert!(matches!(result, Pop3CommandResult::Continue));
    assert_eq!(protocol.get_state(), Pop3State::AwaitingPassword);
}

#[tokio::test]
async fn pass_without_user_is_rejected_back_to_authorization() {
    let mut protocol = create_test_protocol();
    let result = protocol.process_command("PASS hunter2", false, NO_AUTH).await.unwrap();
    assert!(matches!(result, Pop3CommandResult::Continue));
    assert_eq!(protocol.get_state(), Pop3State::Authorization);
}

#[tokio::test]
async fn user_then_pass_yields_pass_result_with_username() {
    let mut protocol = create_test_protocol();
    protocol.process_command("USER alice", false, NO_AUTH).await.unwrap();
    let result = protocol.process_command("PASS hunter2", false, NO_AUTH).await.unwrap();
    match result {
        Pop3CommandResult::Pass { username, password } => {
            assert_eq!(username, "alice");
            assert_eq!(password, "hunter2");
        }
        other => panic!("expected Pass, got {other:?}"),
    }
}

#[tokio::test]
async fn apop_parses_username_and_digest() {
    let mut protocol = create_test_protocol();
    let result = protocol.process_command("APOP alice c4c9334bac560ecc979e58001b3e22fb", false, NO_AUTH).await.unwrap();
    match result {
        Pop3CommandResult::Apop { username, digest } => {
            assert_eq!(username, "alice");
            assert_eq!(digest, "c4c9334bac560ecc979e58001b3e22fb");
        }
        other => panic!("expected Apop, got {other:?}"),
    }
}

#[tokio::test]
async fn transaction_commands_rejected_before_authentication() {
    let mut protocol = create_test_protocol();
    let result = protocol.process_command("STAT", false, NO_AUTH).await.unwrap();
    assert!(matches!(result, Pop3CommandResult::Continue));
}

#[tokio::test]
async fn transaction_commands_accepted_after_authentication() {
    let mut protocol = create_test_protocol();
    protocol.complete_authentication(true);
    assert_eq!(protocol.get_state(), Pop3State::Transaction);

    let result = protocol.process_command("STAT", false, NO_AUTH).await.unwrap();
    assert!(matches!(result, Pop3CommandResult::Stat));

    let result = protocol.process_command("RETR 1", false, NO_AUTH).await.unwrap();
    assert!(matches!(result, Pop3CommandResult::Retr(1)));

    let result = protocol.process_command("TOP 1 5", false, NO_AUTH).await.unwrap();
    assert!(matches!(result, Pop3CommandResult::Top(1, 5)));

    let result = protocol.process_command("DELE 1", false, NO_AUTH).await.unwrap();
    assert!(matches!(result, Pop3CommandResult::Dele(1)));
}

#[tokio::test]
async fn stls_rejected_when_unavailable() {
    let mut protocol = create_test_protocol();
    let result = protocol.process_command("STLS", false, NO_AUTH).await.unwrap();
    assert!(matches!(result, Pop3CommandResult::Continue));
}

#[tokio::test]
async fn stls_accepted_when_available() {
    let mut protocol = create_test_protocol();
    let result = protocol.process_command("STLS", true, NO_AUTH).await.unwrap();
    assert!(matches!(result, Pop3CommandResult::Stls));
}

#[tokio::test]
async fn auth_start_requires_known_mechanism() {
    let mut protocol = create_test_protocol();
    let mechanisms = vec!["PLAIN".to_string()];

    let result = protocol.process_command("AUTH CRAM-MD5", false, &mechanisms).await.unwrap();
    assert!(matches!(result, Pop3CommandResult::Continue));
    assert_eq!(protocol.get_state(), Pop3State::Authorization);

    let result = protocol.process_command("AUTH PLAIN", false, &mechanisms).await.unwrap();
    assert!(matches!(result, Pop3CommandResult::AuthStart { .. }));
    assert_eq!(protocol.get_state(), Pop3State::Authenticating);
}

#[tokio::test]
async fn auth_cancelled_with_asterisk_returns_to_authorization() {
    let mut protocol = create_test_protocol();
    let mechanisms = vec!["PLAIN".to_string()];
    protocol.process_command("AUTH PLAIN", false, &mechanisms).await.unwrap();
    assert_eq!(protocol.get_state(), Pop3State::Authenticating);

    let result = protocol.process_command("*", false, &mechanisms).await.unwrap();
    assert!(matches!(result, Pop3CommandResult::Continue));
    assert_eq!(protocol.get_state(), Pop3State::Authorization);
}
