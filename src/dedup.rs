//! De-duplication key derivation.
//!
//! The store collapses submissions that share a key while the earlier one is
//! still queued. How that key is derived is a policy decision left to the
//! caller: an API-supplied idempotency key, a digest of the payload, or
//! nothing at all.

use sha2::{Digest as _, Sha256};
use std::fmt::Write as _;

use crate::model::NewJob;

/// Derives the de-duplication key for a submission.
pub trait DedupPolicy: Send + Sync {
    fn key_for(&self, new: &NewJob) -> Option<String>;
}

/// Never de-duplicates. Every submission inserts a new job.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDedup;

impl DedupPolicy for NoDedup {
    fn key_for(&self, _new: &NewJob) -> Option<String> {
        None
    }
}

/// Uses the caller-supplied key verbatim; submissions without one are never
/// collapsed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerKey;

impl DedupPolicy for CallerKey {
    fn key_for(&self, new: &NewJob) -> Option<String> {
        new.supplied_key().map(|k| format!("key:{k}"))
    }
}

/// Caller-supplied key if present, otherwise a SHA-256 digest of the
/// payload's canonical JSON. Identical payloads collapse.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentDigest;

impl DedupPolicy for ContentDigest {
    fn key_for(&self, new: &NewJob) -> Option<String> {
        if let Some(key) = CallerKey.key_for(new) {
            return Some(key);
        }
        Some(format!("sha256:{}", payload_digest(new.payload())))
    }
}

/// Hex SHA-256 of the payload's serialized form.
///
/// `serde_json::Map` keeps keys sorted, so objects that differ only in key
/// order hash identically.
pub fn payload_digest(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}
