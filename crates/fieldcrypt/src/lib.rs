//! `fieldcrypt`: field-level encryption with multiple keys, a key lifecycle,
//! and batched zero-downtime rotation.
//!
//! The entry point for applications is [`FieldCipher`]; operators drive key
//! management through [`KeyRegistry`] and rotation through
//! [`RotationOrchestrator`] (or the `fieldcrypt` binary).

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod legacy;
pub mod registry;
pub mod rotation;
pub mod service;
pub mod telemetry;

pub use common::{CryptoError, ErrorKind, KeyRecord, KeyStatus, RotationReport};
pub use crypto::{KeyDerivation, MasterSecret};
pub use envelope::{Envelope, VersionTag};
pub use legacy::{LegacyMigrator, MigrationQueue, SweepReport};
pub use registry::{FileKeyStore, KeyRegistry, KeyStore, LifecyclePolicy, MemoryKeyStore};
pub use rotation::{
    rotate, FieldRecord, FileRecordStore, MemoryRecordStore, RecordRange, RecordStore,
    RotationJob, RotationOrchestrator, RotationSettings,
};
pub use service::{Decrypted, FieldCipher};
