//! Request signing between members.
//!
//! Every member holds the cluster key handed out at bootstrap or join. A
//! peer request names its sender, the fingerprint of the sender's
//! certificate and a timestamp, and carries an HMAC-SHA256 over those
//! fields plus the method and path, keyed by the cluster key. Knowing a
//! member's certificate is not enough to produce a valid signature.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use http::{HeaderMap, Method};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{ClusterError, ClusterResult};

type HmacSha256 = Hmac<Sha256>;

/// Header naming the member that sent a peer request.
pub const MEMBER_HEADER: &str = "x-corral-member";
/// Header carrying the hex SHA-256 fingerprint of the sender's certificate.
pub const FINGERPRINT_HEADER: &str = "x-corral-fingerprint";
/// Header carrying the signing time, in seconds since the epoch.
pub const TIMESTAMP_HEADER: &str = "x-corral-timestamp";
/// Header carrying the hex HMAC-SHA256 request signature.
pub const SIGNATURE_HEADER: &str = "x-corral-signature";

/// Clock skew tolerated between members (5 minutes).
pub const MAX_CLOCK_SKEW_SECS: u64 = 300;

/// The identity fields of a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity<'a> {
    pub member: &'a str,
    pub fingerprint: &'a str,
    pub timestamp: u64,
}

/// Seconds since the epoch, as carried in [`TIMESTAMP_HEADER`].
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn string_to_sign(method: &Method, path: &str, identity: &RequestIdentity<'_>) -> String {
    format!(
        "{method}\n{path}\n{}\n{}\n{}",
        identity.timestamp, identity.member, identity.fingerprint
    )
}

/// Hex HMAC-SHA256 of the request, keyed by the cluster key.
pub fn sign(
    cluster_key: &str,
    method: &Method,
    path: &str,
    identity: &RequestIdentity<'_>,
) -> ClusterResult<String> {
    let mut mac = HmacSha256::new_from_slice(cluster_key.as_bytes())
        .map_err(|e| ClusterError::Internal(format!("invalid signing key: {e}")))?;
    mac.update(string_to_sign(method, path, identity).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// The four identity headers for a request signed at `timestamp`.
pub fn signed_headers(
    cluster_key: &str,
    method: &Method,
    path: &str,
    member: &str,
    fingerprint: &str,
    timestamp: u64,
) -> ClusterResult<[(&'static str, String); 4]> {
    let identity = RequestIdentity {
        member,
        fingerprint,
        timestamp,
    };
    let signature = sign(cluster_key, method, path, &identity)?;
    Ok([
        (MEMBER_HEADER, member.to_string()),
        (FINGERPRINT_HEADER, fingerprint.to_string()),
        (TIMESTAMP_HEADER, timestamp.to_string()),
        (SIGNATURE_HEADER, signature),
    ])
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// A request's claimed identity and signature, if all four headers are present.
pub fn presented(headers: &HeaderMap) -> Option<(RequestIdentity<'_>, &str)> {
    let identity = RequestIdentity {
        member: header(headers, MEMBER_HEADER)?,
        fingerprint: header(headers, FINGERPRINT_HEADER)?,
        timestamp: header(headers, TIMESTAMP_HEADER)?.parse().ok()?,
    };
    Some((identity, header(headers, SIGNATURE_HEADER)?))
}

/// Whether `signature` was produced with `cluster_key` for this request
/// within the tolerated clock skew of `now`.
pub fn verify(
    cluster_key: &str,
    method: &Method,
    path: &str,
    identity: &RequestIdentity<'_>,
    signature: &str,
    now: u64,
) -> bool {
    if now.abs_diff(identity.timestamp) > MAX_CLOCK_SKEW_SECS {
        return false;
    }
    let Ok(expected) = sign(cluster_key, method, path, identity) else {
        return false;
    };
    expected.len() == signature.len() && bool::from(expected.as_bytes().ct_eq(signature.as_bytes()))
}
