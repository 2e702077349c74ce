//! HTTP Basic Auth for the control plane.
//!
//! Credentials come from configuration; the password is either plain text
//! or a hex SHA-256 digest. Authentication failures answer 401 with a
//! challenge, role mismatches answer 403.

use axum::http::HeaderMap;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::app::AdminCredentials;

use super::error::ApiError;

/// Role the control plane requires.
pub const REQUIRED_ROLE: &str = "super-admin";

/// Checks the `Authorization` header against the configured admin account.
pub fn authorize(headers: &HeaderMap, admin: &AdminCredentials) -> Result<(), ApiError> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::unauthorized)?;

    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(ApiError::unauthorized)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| ApiError::unauthorized())?;
    let pair = String::from_utf8(decoded).map_err(|_| ApiError::unauthorized())?;
    let (user, password) = pair.split_once(':').ok_or_else(ApiError::unauthorized)?;

    if user != admin.user || !password_matches(password, admin) {
        return Err(ApiError::unauthorized());
    }
    if admin.role != REQUIRED_ROLE {
        return Err(ApiError::forbidden());
    }
    Ok(())
}

fn password_matches(provided: &str, admin: &AdminCredentials) -> bool {
    if admin.hashed {
        constant_time_eq(&sha256_hex(provided), &admin.password)
    } else {
        constant_time_eq(provided, &admin.password)
    }
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Length-independent comparison; timing must not reveal prefix matches.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().min(b.len()).max(1) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}

/// Builds an `Authorization` header value for tests and tooling.
pub fn basic_header(user: &str, password: &str) -> String {
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"))
    )
}
