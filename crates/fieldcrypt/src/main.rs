//! `fieldcrypt` operator entry point.
//!
//! Startup sequence:
//! 1. Parse the command line.
//! 2. Load and validate [`Config`] from environment variables.
//! 3. Initialise the telemetry pipeline (tracing + optional OTLP).
//! 4. Derive keys from the master secret and open the key registry.
//! 5. Run the command, printing its result as JSON on stdout.

mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cli::{Cli, Command, KeysCommand};
use fieldcrypt::config::Config;
use fieldcrypt::{
    telemetry, FieldCipher, FileKeyStore, FileRecordStore, KeyDerivation, KeyRegistry,
    LegacyMigrator, RotationJob, RotationOrchestrator,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        key_store = %cfg.key_store_path.display(),
        legacy_support = cfg.legacy_support,
        "fieldcrypt starting"
    );

    // -----------------------------------------------------------------------
    // 3. Key registry
    // -----------------------------------------------------------------------
    let kdf = KeyDerivation::new(cfg.master_secret()?);
    let registry = Arc::new(
        KeyRegistry::open(
            Arc::new(FileKeyStore::new(&cfg.key_store_path)),
            kdf,
            cfg.lifecycle_policy(),
        )
        .context("failed to open key registry")?,
    );
    let cipher = FieldCipher::new(Arc::clone(&registry), LegacyMigrator::new(cfg.legacy_support));

    // -----------------------------------------------------------------------
    // 4. Command
    // -----------------------------------------------------------------------
    let result = run(cli.command, &cfg, &cipher).await;

    if let Err(e) = registry.flush_usage() {
        warn!(error = %e, "failed to persist key usage counters");
    }
    telemetry::shutdown_telemetry();
    result
}

async fn run(command: Command, cfg: &Config, cipher: &FieldCipher) -> Result<()> {
    let registry = cipher.registry();
    match command {
        Command::Keys(KeysCommand::Create { activate }) => {
            let record = registry.create_key()?;
            if activate {
                registry.activate_key(&record.key_id)?;
            }
            let record = registry
                .key_status()
                .into_iter()
                .find(|r| r.key_id == record.key_id)
                .context("created key missing from registry")?;
            print_json(&record)
        }
        Command::Keys(KeysCommand::Activate { key_id }) => {
            registry.activate_key(&key_id)?;
            print_json(&registry.key_status())
        }
        Command::Keys(KeysCommand::Status) => print_json(&registry.key_status()),
        Command::Keys(KeysCommand::Expire { force }) => {
            print_json(&registry.expire_due(Utc::now(), force)?)
        }
        Command::Keys(KeysCommand::Reactivate { key_id, reason }) => {
            registry.reactivate_key(&key_id, &reason)?;
            print_json(&registry.key_status())
        }
        Command::Rotate {
            target,
            records,
            batch_size,
            dry_run,
            continue_on_error,
            resume_after,
        } => {
            let store = Arc::new(FileRecordStore::new(records));
            let orchestrator =
                RotationOrchestrator::new(cipher.clone(), store, cfg.rotation_settings());
            let job = RotationJob::new(target, batch_size.unwrap_or(cfg.rotation_batch_size))
                .dry_run(dry_run)
                .continue_on_error(continue_on_error)
                .resume_after(resume_after);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current batch");
                    on_signal.cancel();
                }
            });

            let report = orchestrator.run(job, &cancel).await?;
            print_json(&report)?;
            report.into_result().context("rotation halted")?;
            Ok(())
        }
        Command::Encrypt { plaintext } => {
            let envelope = cipher.encrypt(&plaintext)?;
            print_json(&serde_json::json!({ "envelope": envelope }))
        }
        Command::Decrypt { envelope } => {
            let decrypted = cipher.decrypt(&envelope)?;
            print_json(&serde_json::json!({
                "plaintext": decrypted.plaintext,
                "version": decrypted.version.as_str(),
                "key_id": decrypted.key_id,
                "migration_needed": decrypted.migration_needed,
            }))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("failed to serialise output")?;
    println!("{out}");
    Ok(())
}
