//! Common types, key-lifecycle records, and errors shared across `fieldcrypt` crates.

pub mod error;
pub mod model;

pub use error::{CryptoError, ErrorKind};
pub use model::{KeyRecord, KeyStatus, RotationReport};
