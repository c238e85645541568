//! Random identifiers for sessions, requests and tokens.

use rand::RngCore;

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Generate a unique, unguessable session identifier.
pub fn generate_session_id() -> String {
    format!("sess_{}", random_hex(12))
}

/// Generate a request identifier for correlation and logging.
pub fn generate_request_id() -> String {
    format!("req_{}", random_hex(8))
}

/// Generate a secure random authentication token (64 hex characters).
pub fn generate_token() -> String {
    random_hex(32)
}
