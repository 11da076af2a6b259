//! Request signing seam
//!
//! Signing is an injected capability: the engine hands every outgoing
//! request to a [`RequestSigner`] before dispatch and never looks at
//! credentials itself.

use std::sync::OnceLock;

use regex::Regex;

/// Adds authentication to outgoing requests.
///
/// Implementations mutate the request in place, typically by attaching
/// `Authorization` and date headers appropriate for the target service.
pub trait RequestSigner: Send + Sync + 'static {
    fn sign(&self, request: &mut reqwest::Request);
}

/// Signer for stores that accept unauthenticated requests.
///
/// Useful against MinIO or other S3-compatible services with anonymous
/// access enabled, and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousSigner;

impl RequestSigner for AnonymousSigner {
    fn sign(&self, _request: &mut reqwest::Request) {}
}

static REGION_MATCHER: OnceLock<Regex> = OnceLock::new();

/// Infer the service region from an endpoint domain.
///
/// Handles the legacy us-east-1 aliases and the transfer-acceleration
/// endpoint (which carries no region and falls back to `AWS_REGION`).
/// Returns `None` when nothing can be inferred.
pub fn infer_region(domain: &str) -> Option<String> {
    match domain {
        "s3.amazonaws.com" | "s3-external-1.amazonaws.com" => Some("us-east-1".to_string()),
        "s3-accelerate.amazonaws.com" => std::env::var("AWS_REGION").ok(),
        _ => {
            let matcher = REGION_MATCHER.get_or_init(|| {
                Regex::new(r"s3[-.]([a-z0-9-]+)\.amazonaws\.com").expect("static region pattern")
            });
            match matcher.captures(domain) {
                Some(caps) => Some(caps[1].to_string()),
                None => std::env::var("AWS_REGION").ok(),
            }
        }
    }
}
