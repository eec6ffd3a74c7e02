//! Command-line definitions for the `fieldcrypt` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Field encryption key management and rotation.
#[derive(Parser, Debug)]
#[command(name = "fieldcrypt")]
#[command(version)]
#[command(about = "Field-level encryption key management and rotation")]
#[command(long_about = "Manage field encryption keys and rotate stored data onto a new key.\n\n\
    Configuration is read from FIELDCRYPT_* environment variables. Results are \
    printed as JSON on stdout; logs go to stderr.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Key lifecycle operations
    #[command(subcommand)]
    Keys(KeysCommand),

    /// Re-encrypt every record in a JSON records file under a target key
    Rotate {
        /// Key to rotate onto (Pending or Active)
        #[arg(long)]
        target: String,

        /// JSON file holding an array of records
        #[arg(long)]
        records: PathBuf,

        /// Records per batch (default: FIELDCRYPT_ROTATION_BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,

        /// Record failed batches and keep going
        #[arg(long)]
        continue_on_error: bool,

        /// Resume after this record id (from a previous report)
        #[arg(long)]
        resume_after: Option<String>,
    },

    /// Encrypt a value under the Active key
    Encrypt {
        plaintext: String,
    },

    /// Decrypt an envelope of any supported version
    Decrypt {
        envelope: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum KeysCommand {
    /// Create a new Pending key
    Create {
        /// Activate the key immediately
        #[arg(long)]
        activate: bool,
    },

    /// Activate a Pending key; the current Active key starts Rotating
    Activate {
        key_id: String,
    },

    /// List every key with its status and usage
    Status,

    /// Expire Retired keys past their retention period
    Expire {
        /// Also expire keys still used since retirement
        #[arg(long)]
        force: bool,
    },

    /// Return a Rotating or Retired key to Active (requires FIELDCRYPT_ALLOW_REACTIVATION)
    Reactivate {
        key_id: String,

        /// Audit trail entry explaining the reactivation
        #[arg(long)]
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rotate() {
        let cli = Cli::try_parse_from([
            "fieldcrypt",
            "rotate",
            "--target",
            "key_a",
            "--records",
            "records.json",
            "--batch-size",
            "50",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Command::Rotate {
                target,
                batch_size,
                dry_run,
                continue_on_error,
                ..
            } => {
                assert_eq!(target, "key_a");
                assert_eq!(batch_size, Some(50));
                assert!(dry_run);
                assert!(!continue_on_error);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn reactivate_requires_reason() {
        assert!(Cli::try_parse_from(["fieldcrypt", "keys", "reactivate", "key_a"]).is_err());
        assert!(Cli::try_parse_from([
            "fieldcrypt",
            "keys",
            "reactivate",
            "key_a",
            "--reason",
            "incident 42"
        ])
        .is_ok());
    }
}
