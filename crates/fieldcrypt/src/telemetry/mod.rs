//! Structured logging and optional OTLP span export.
//!
//! # Telemetry invariants
//!
//! - **No plaintext, ciphertext, or key material** may appear in any span
//!   attribute or log field. Key ids, record ids, counts and error kinds only.
//! - Log level is configurable via `FIELDCRYPT_LOG_LEVEL` (default: `info`).

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
