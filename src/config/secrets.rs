//! Re-exports of the secrecy types used for connection strings.

pub use secrecy::{ExposeSecret, SecretString};
