//! HMAC-SHA256 request signing.
//!
//! The signed string is `"{timestamp}.{payload}"`, so a captured request
//! cannot be replayed under a fresh timestamp. Receivers recompute the MAC
//! and reject requests whose timestamp is outside their tolerance window.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_DELIVERY_ID: &str = "X-Webhook-Delivery-Id";
pub const HEADER_EVENT: &str = "X-Webhook-Event";
pub const HEADER_TIMESTAMP: &str = "X-Webhook-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";

/// Header names custom endpoint headers can never override.
pub const RESERVED_HEADERS: [&str; 4] = [
    HEADER_DELIVERY_ID,
    HEADER_EVENT,
    HEADER_TIMESTAMP,
    HEADER_SIGNATURE,
];

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Hex-encoded HMAC-SHA256 of `"{timestamp}.{payload}"` keyed by `secret`.
pub fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Check a signature produced by [`sign`]. Accepts the bare hex digest or
/// the `sha256=` header form. Comparison is constant-time.
pub fn verify(secret: &str, timestamp: i64, payload: &[u8], signature: &str) -> bool {
    let provided = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
    let expected = sign(secret, timestamp, payload);

    if provided.len() != expected.len() {
        return false;
    }
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

pub fn is_reserved_header(name: &str) -> bool {
    RESERVED_HEADERS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// The four headers attached to every outbound attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub delivery_id: Uuid,
    pub event_type: String,
    pub timestamp: i64,
    /// Hex digest without the `sha256=` prefix
    pub signature: String,
}

impl SignedHeaders {
    pub fn new(
        secret: &str,
        delivery_id: Uuid,
        event_type: &str,
        timestamp: i64,
        payload: &[u8],
    ) -> Self {
        Self {
            delivery_id,
            event_type: event_type.to_string(),
            timestamp,
            signature: sign(secret, timestamp, payload),
        }
    }

    /// `(name, value)` pairs in wire form.
    pub fn pairs(&self) -> [(&'static str, String); 4] {
        [
            (HEADER_DELIVERY_ID, self.delivery_id.to_string()),
            (HEADER_EVENT, self.event_type.clone()),
            (HEADER_TIMESTAMP, self.timestamp.to_string()),
            (
                HEADER_SIGNATURE,
                format!("{}{}", SIGNATURE_PREFIX, self.signature),
            ),
        ]
    }
}
