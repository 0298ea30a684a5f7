//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for broker credentials so callers
//! building a `Broker` by hand don't need a direct secrecy dependency.

pub use secrecy::{ExposeSecret, SecretString};
