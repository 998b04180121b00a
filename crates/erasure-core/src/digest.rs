use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{CoreError, CoreResult};

/// Compute the answer to the marketplace ownership challenge.
///
/// Formula: hex(SHA-256(challenge_code || verification_token || endpoint_url))
///
/// The three values are concatenated in exactly this order with no
/// separator. The platform rejects any other arrangement without telling the
/// caller why.
pub fn compute_challenge_response(
    challenge_code: &str,
    verification_token: &str,
    canonical_endpoint_url: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(challenge_code.as_bytes());
    hasher.update(verification_token.as_bytes());
    hasher.update(canonical_endpoint_url.as_bytes());
    hex::encode(hasher.finalize())
}

/// Rebuild the endpoint URL the way it was registered with the platform:
/// `https://` + Host header + path without query string or fragment.
///
/// The host is lower-cased and keeps any explicit port. An empty path
/// becomes `/`.
pub fn canonical_endpoint_url(host: &str, path: &str) -> CoreResult<String> {
    let host = host.trim();
    if host.is_empty() {
        return Err(CoreError::MissingHost);
    }
    if host.contains('/') || host.chars().any(char::is_whitespace) {
        return Err(CoreError::InvalidEndpointUrl(format!(
            "malformed host '{}'",
            host
        )));
    }

    let path = path
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let path = if path.is_empty() { "/" } else { path };
    let separator = if path.starts_with('/') { "" } else { "/" };

    Ok(format!(
        "https://{}{}{}",
        host.to_ascii_lowercase(),
        separator,
        path
    ))
}

/// Constant-time comparison of two digests.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}
