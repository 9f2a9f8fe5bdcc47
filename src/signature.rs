//! Request signatures
//!
//! Base string: `METHOD\nPATH\nTIMESTAMP\nBODY`, signed with HMAC-SHA256
//! under the client's secret and rendered as lowercase hex.

use ring::hmac;

/// Build the byte string covered by the signature
pub fn signing_base(method: &str, path: &str, timestamp: &str, body: &[u8]) -> Vec<u8> {
    let mut base =
        Vec::with_capacity(method.len() + path.len() + timestamp.len() + body.len() + 3);
    base.extend_from_slice(method.as_bytes());
    base.push(b'\n');
    base.extend_from_slice(path.as_bytes());
    base.push(b'\n');
    base.extend_from_slice(timestamp.as_bytes());
    base.push(b'\n');
    base.extend_from_slice(body);
    base
}

/// Compute the hex signature a client should send
pub fn compute_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: &str,
    body: &[u8],
) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, &signing_base(method, path, timestamp, body));
    hex::encode(tag.as_ref())
}

/// Check a claimed signature in constant time
///
/// Hex is accepted in either case. Anything that is not valid hex fails.
pub fn verify_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: &str,
    body: &[u8],
    claimed: &str,
) -> bool {
    let claimed_bytes = match hex::decode(claimed.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(
        &key,
        &signing_base(method, path, timestamp, body),
        &claimed_bytes,
    )
    .is_ok()
}
