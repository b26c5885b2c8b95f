//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for the database URL so callers don't
//! need a direct dependency to read it.

pub use secrecy::{ExposeSecret, SecretString};
