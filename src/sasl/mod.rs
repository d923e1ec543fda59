//! SASL mechanisms shared by SMTP `AUTH` and POP3's `AUTH`/`APOP` flows.
//!
//! Each mechanism implements [`SaslMechanism`], producing an initial client
//! response (where the mechanism supports one) and reacting to each
//! server challenge until the exchange completes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug)]
pub enum SaslError {
    UnexpectedChallenge,
    InvalidBase64,
    InvalidUtf8,
    MalformedChallenge(String),
}

impl fmt::Display for SaslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaslError::UnexpectedChallenge => write!(f, "server issued a challenge this mechanism does not expect"),
            SaslError::InvalidBase64 => write!(f, "challenge was not valid base64"),
            SaslError::InvalidUtf8 => write!(f, "challenge was not valid utf-8"),
            SaslError::MalformedChallenge(s) => write!(f, "malformed challenge: {s}"),
        }
    }
}

impl std::error::Error for SaslError {}

/// A name advertised in an `AUTH` capability list (`EHLO`'s `AUTH` line,
/// POP3's `CAPA`).
pub trait SaslMechanism: Send {
    fn name(&self) -> &'static str;

    /// The response sent with the initial `AUTH <mechanism>` command, if the
    /// mechanism supports sending one without waiting for a challenge.
    fn initial_response(&self) -> Option<Vec<u8>>;

    /// Computes the response to a base64-decoded server challenge.
    ///
    /// Returns `Ok(None)` once the exchange is complete and no further
    /// response should be sent.
    fn respond(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>, SaslError>;
}

/// `AUTH PLAIN`: a single response of `\0authzid\0authcid\0password` (RFC 4616).
pub struct Plain {
    authzid: String,
    authcid: String,
    password: String,
    sent: bool,
}

impl Plain {
    pub fn new(authcid: impl Into<String>, password: impl Into<String>) -> Self {
        Plain {
            authzid: String::new(),
            authcid: authcid.into(),
            password: password.into(),
            sent: false,
        }
    }
}

impl SaslMechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn initial_response(&self) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.authzid.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.authcid.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.password.as_bytes());
        Some(buf)
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Option<Vec<u8>>, SaslError> {
        if self.sent {
            return Ok(None);
        }
        self.sent = true;
        Err(SaslError::UnexpectedChallenge)
    }
}

/// `AUTH LOGIN`: two challenge/response round trips, username then password.
pub struct Login {
    username: String,
    password: String,
    step: u8,
}

impl Login {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Login {
            username: username.into(),
            password: password.into(),
            step: 0,
        }
    }
}

impl SaslMechanism for Login {
    fn name(&self) -> &'static str {
        "LOGIN"
    }

    fn initial_response(&self) -> Option<Vec<u8>> {
        None
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Option<Vec<u8>>, SaslError> {
        let out = match self.step {
            0 => Some(self.username.clone().into_bytes()),
            1 => Some(self.password.clone().into_bytes()),
            _ => None,
        };
        self.step += 1;
        Ok(out)
    }
}

/// `AUTH CRAM-MD5` (RFC 2195): HMAC-MD5 of the server's challenge, hex-encoded,
/// sent as `username <space> hex_digest`.
pub struct CramMd5 {
    username: String,
    secret: String,
    responded: bool,
}

impl CramMd5 {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        CramMd5 {
            username: username.into(),
            secret: secret.into(),
            responded: false,
        }
    }
}

impl SaslMechanism for CramMd5 {
    fn name(&self) -> &'static str {
        "CRAM-MD5"
    }

    fn initial_response(&self) -> Option<Vec<u8>> {
        None
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>, SaslError> {
        if self.responded {
            return Ok(None);
        }
        self.responded = true;

        let mut mac = Hmac::<md5::Md5>::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(challenge);
        let digest = hex::encode(mac.finalize().into_bytes());
        Ok(Some(format!("{} {digest}", self.username).into_bytes()))
    }
}

/// `AUTH SCRAM-SHA-256` (RFC 7677), client side. Supports exactly the two
/// round trips of the mechanism: client-first-message then
/// client-final-message, without channel binding.
pub struct ScramSha256 {
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    step: u8,
}

impl ScramSha256 {
    pub fn new(username: impl Into<String>, password: impl Into<String>, client_nonce: impl Into<String>) -> Self {
        let username = username.into();
        let client_nonce = client_nonce.into();
        let client_first_bare = format!("n={},r={}", scram_escape(&username), client_nonce);
        ScramSha256 {
            username,
            password: password.into(),
            client_nonce,
            client_first_bare,
            step: 0,
        }
    }
}

fn scram_escape(s: &str) -> String {
    s.replace('=', "=3D").replace(',', "=2C")
}

impl SaslMechanism for ScramSha256 {
    fn name(&self) -> &'static str {
        "SCRAM-SHA-256"
    }

    fn initial_response(&self) -> Option<Vec<u8>> {
        Some(format!("n,,{}", self.client_first_bare).into_bytes())
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>, SaslError> {
        match self.step {
            0 => {
                let server_first = std::str::from_utf8(challenge).map_err(|_| SaslError::InvalidUtf8)?;
                let mut salt = None;
                let mut iterations = None;
                let mut combined_nonce = None;
                for field in server_first.split(',') {
                    if let Some(v) = field.strip_prefix("s=") {
                        salt = Some(v.to_string());
                    } else if let Some(v) = field.strip_prefix("i=") {
                        iterations = v.parse::<u32>().ok();
                    } else if let Some(v) = field.strip_prefix("r=") {
                        combined_nonce = Some(v.to_string());
                    }
                }
                let salt = salt.ok_or_else(|| SaslError::MalformedChallenge("missing salt".into()))?;
                let iterations = iterations.ok_or_else(|| SaslError::MalformedChallenge("missing iteration count".into()))?;
                let combined_nonce = combined_nonce.ok_or_else(|| SaslError::MalformedChallenge("missing nonce".into()))?;
                if !combined_nonce.starts_with(&self.client_nonce) {
                    return Err(SaslError::MalformedChallenge("server nonce does not extend client nonce".into()));
                }

                let salted_password = scram_hi(self.password.as_bytes(), &salt, iterations);
                let client_key = hmac_sha256(&salted_password, b"Client Key");
                let stored_key = sha256(&client_key);
                let channel_binding = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, "n,,");
                let client_final_no_proof = format!("c={channel_binding},r={combined_nonce}");
                let auth_message = format!("{},{},{}", self.client_first_bare, server_first, client_final_no_proof);
                let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
                let client_proof: Vec<u8> = client_key.iter().zip(client_signature.iter()).map(|(a, b)| a ^ b).collect();
                let proof_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, client_proof);

                self.step += 1;
                let _ = &self.username;
                Ok(Some(format!("{client_final_no_proof},p={proof_b64}").into_bytes()))
            }
            1 => {
                // Server-final-message carries v=<signature>; nothing further to send.
                self.step += 1;
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256(data: &[u8]) -> Vec<u8> {
    use sha2::Digest;
    Sha256::digest(data).to_vec()
}

fn scram_hi(password: &[u8], salt_b64: &str, iterations: u32) -> Vec<u8> {
    use base64::Engine;
    let salt = base64::engine::general_purpose::STANDARD.decode(salt_b64).unwrap_or_default();
    let mut salted = salt.clone();
    salted.extend_from_slice(&[0, 0, 0, 1]);
    let mut u = hmac_sha256(password, &salted);
    let mut result = u.clone();
    for _ in 1..iterations {
        u = hmac_sha256(password, &u);
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_initial_response_has_three_nul_separated_fields() {
        let plain = Plain::new("alice", "hunter2");
        let resp = plain.initial_response().unwrap();
        let fields: Vec<&[u8]> = resp.split(|&b| b == 0).collect();
        assert_eq!(fields, vec![&b""[..], &b"alice"[..], &b"hunter2"[..]]);
    }

    #[test]
    fn login_walks_username_then_password() {
        let mut login = Login::new("bob", "secret");
        assert_eq!(login.respond(b"Username:").unwrap(), Some(b"bob".to_vec()));
        assert_eq!(login.respond(b"Password:").unwrap(), Some(b"secret".to_vec()));
        assert_eq!(login.respond(b"").unwrap(), None);
    }

    #[test]
    fn cram_md5_responds_once_then_stops() {
        let mut mech = CramMd5::new("alice", "secret");
        let first = mech.respond(b"<1896.697170952@example.com>").unwrap();
        assert!(first.is_some());
        let response = String::from_utf8(first.unwrap()).unwrap();
        assert!(response.starts_with("alice "));
        assert_eq!(mech.respond(b"ignored").unwrap(), None);
    }

    #[test]
    fn scram_client_first_message_carries_username_and_nonce() {
        let scram = ScramSha256::new("alice", "secret", "fyko+d2lbbFgONRv9qkxdawL");
        let msg = String::from_utf8(scram.initial_response().unwrap()).unwrap();
        assert_eq!(msg, "n,,n=alice,r=fyko+d2lbbFgONRv9qkxdawL");
    }
}
