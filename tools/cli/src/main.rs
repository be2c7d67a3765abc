//! PassVault CLI - Command line interface for password database files.
//!
//! Inspects, exports, creates and merges local database files.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::Zeroizing;

use passvault_common::CancellationToken;
use passvault_crypto::{CompositeKey, KdfParams};
use passvault_format::{read_header, to_plain_xml, Header};
use passvault_model::{Database, FormatVersion};
use passvault_storage::{IoConnection, LocalFileConnection};
use passvault_sync::{merge_with_stats, DatabaseSession, SaveMode, SaveOutcome};

#[derive(Parser)]
#[command(name = "passvault")]
#[command(about = "PassVault - Encrypted password database tools")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new, empty database.
    Create {
        /// Path of the new database file.
        path: PathBuf,

        /// Name of the database and its root group.
        #[arg(short, long, default_value = "Passwords")]
        name: String,

        /// KDF strength: "interactive", "moderate", or "sensitive".
        #[arg(short, long, default_value = "moderate")]
        strength: String,

        /// Write the older 3.1 format (AES-KDF only).
        #[arg(long)]
        legacy: bool,

        /// Keyfile to combine with the password.
        #[arg(short, long)]
        keyfile: Option<PathBuf>,
    },

    /// Show container settings from the unencrypted header.
    Info {
        /// Path to the database.
        path: PathBuf,

        /// Print machine-readable JSON.
        #[arg(long)]
        json: bool,

        /// Also decrypt the file and count its contents.
        #[arg(short, long)]
        unlock: bool,

        /// Keyfile to combine with the password.
        #[arg(short, long)]
        keyfile: Option<PathBuf>,
    },

    /// Decrypt a database and print its payload as plain XML.
    Dump {
        /// Path to the database.
        path: PathBuf,

        /// Write to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keyfile to combine with the password.
        #[arg(short, long)]
        keyfile: Option<PathBuf>,
    },

    /// Merge another copy of a database into this one.
    Merge {
        /// Database to merge into.
        path: PathBuf,

        /// Other copy of the database.
        other: PathBuf,

        /// Write the result to a new file instead of updating `path`.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Prompt for a separate password for the other copy.
        #[arg(long)]
        other_password: bool,

        /// Keyfile to combine with the password.
        #[arg(short, long)]
        keyfile: Option<PathBuf>,
    },

    /// Change the master password.
    ChangePassword {
        /// Path to the database.
        path: PathBuf,

        /// Keyfile used now and after the change.
        #[arg(short, long)]
        keyfile: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;

    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Create {
            path,
            name,
            strength,
            legacy,
            keyfile,
        } => cmd_create(&path, &name, &strength, legacy, keyfile.as_deref(), &cancel),
        Commands::Info {
            path,
            json,
            unlock,
            keyfile,
        } => cmd_info(&path, json, unlock, keyfile.as_deref(), &cancel),
        Commands::Dump {
            path,
            output,
            keyfile,
        } => cmd_dump(&path, output.as_deref(), keyfile.as_deref(), &cancel),
        Commands::Merge {
            path,
            other,
            output,
            other_password,
            keyfile,
        } => cmd_merge(
            &path,
            &other,
            output.as_deref(),
            other_password,
            keyfile.as_deref(),
            &cancel,
        ),
        Commands::ChangePassword { path, keyfile } => {
            cmd_change_password(&path, keyfile.as_deref(), &cancel)
        }
    }
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    rpassword::prompt_password(prompt)
        .map(Zeroizing::new)
        .context("Failed to read password")
}

/// Prompt twice and insist on a non-empty, matching answer.
fn prompt_new_password(prompt: &str) -> Result<Zeroizing<String>> {
    let password = prompt_password(prompt)?;
    let confirm = prompt_password("Confirm password: ")?;

    if *password != *confirm {
        anyhow::bail!("Passwords do not match");
    }

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    Ok(password)
}

fn build_key(password: &str, keyfile: Option<&Path>) -> Result<CompositeKey> {
    let key = CompositeKey::from_password(password.as_bytes());
    match keyfile {
        Some(path) => {
            let bytes = Zeroizing::new(
                std::fs::read(path)
                    .with_context(|| format!("Failed to read keyfile {}", path.display()))?,
            );
            key.with_keyfile(&bytes).context("Invalid keyfile")
        }
        None => Ok(key),
    }
}

fn connection(path: &Path) -> Arc<dyn IoConnection> {
    Arc::new(LocalFileConnection::new(path))
}

fn open_session(
    path: &Path,
    keyfile: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<DatabaseSession> {
    let password = prompt_password("Enter password: ")?;
    let key = build_key(&password, keyfile)?;
    DatabaseSession::open(connection(path), key, cancel)
        .with_context(|| format!("Failed to open {}", path.display()))
}

fn kdf_for_strength(strength: &str, legacy: bool) -> Result<KdfParams> {
    if legacy {
        let rounds = match strength {
            "interactive" => 60_000,
            "moderate" => 600_000,
            "sensitive" => 6_000_000,
            _ => anyhow::bail!(
                "Invalid strength: {}. Use interactive, moderate, or sensitive.",
                strength
            ),
        };
        return Ok(KdfParams::aes(rounds));
    }

    match strength {
        "interactive" => Ok(KdfParams::interactive()),
        "moderate" => Ok(KdfParams::moderate()),
        "sensitive" => Ok(KdfParams::sensitive()),
        _ => anyhow::bail!(
            "Invalid strength: {}. Use interactive, moderate, or sensitive.",
            strength
        ),
    }
}

/// Create a new database.
fn cmd_create(
    path: &Path,
    name: &str,
    strength: &str,
    legacy: bool,
    keyfile: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("Creating database at: {}", path.display());

    let kdf = kdf_for_strength(strength, legacy)?;
    let password = prompt_new_password("Enter password: ")?;
    let key = build_key(&password, keyfile)?;

    let mut database = Database::new(name);
    database.settings.kdf = kdf;
    if legacy {
        database.settings.version = FormatVersion::KDBX3_1;
    }

    let session = DatabaseSession::create(connection(path), key, database, cancel)
        .context("Failed to create database")?;

    println!("Database created successfully!");
    println!("  Name: {}", session.database().meta.database_name);
    println!("  Location: {}", path.display());
    println!("  Format: {}", session.database().settings.version);

    Ok(())
}

#[derive(Serialize)]
struct InfoReport {
    version: String,
    cipher: String,
    compression: String,
    kdf: String,
    inner_stream: Option<String>,
    has_public_custom_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    contents: Option<ContentsReport>,
}

#[derive(Serialize)]
struct ContentsReport {
    name: String,
    groups: usize,
    entries: usize,
    deleted_objects: usize,
    generator: String,
}

impl InfoReport {
    fn from_header(header: &Header) -> Self {
        Self {
            version: header.version.to_string(),
            cipher: format!("{:?}", header.cipher),
            compression: format!("{:?}", header.compression),
            kdf: header.kdf.name().to_string(),
            inner_stream: header.inner_stream.map(|s| format!("{:?}", s)),
            has_public_custom_data: header.public_custom_data.is_some(),
            contents: None,
        }
    }
}

/// Show database information.
fn cmd_info(
    path: &Path,
    json: bool,
    unlock: bool,
    keyfile: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("Getting database info: {}", path.display());

    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let header = read_header(&bytes).context("Failed to read header")?;
    let mut report = InfoReport::from_header(&header);

    if unlock {
        let session = open_session(path, keyfile, cancel)?;
        let database = session.database();
        let index = database.index();
        report.inner_stream = Some(format!("{:?}", database.settings.inner_stream));
        report.contents = Some(ContentsReport {
            name: database.meta.database_name.clone(),
            groups: index.group_count(),
            entries: index.entry_count(),
            deleted_objects: database.deleted_objects.len(),
            generator: database.meta.generator.clone(),
        });
    }

    if json {
        let out = serde_json::to_string_pretty(&report).context("Failed to encode JSON")?;
        println!("{}", out);
        return Ok(());
    }

    println!("Database Information:");
    println!("  Format: {}", report.version);
    println!("  Cipher: {}", report.cipher);
    println!("  Compression: {}", report.compression);
    println!("  KDF: {}", report.kdf);
    match &report.inner_stream {
        Some(stream) => println!("  Inner stream: {}", stream),
        None => println!("  Inner stream: (encrypted inner header)"),
    }
    if let Some(contents) = &report.contents {
        println!("  Name: {}", contents.name);
        println!("  Groups: {}", contents.groups);
        println!("  Entries: {}", contents.entries);
        println!("  Deleted objects: {}", contents.deleted_objects);
        println!("  Generator: {}", contents.generator);
    }

    Ok(())
}

/// Export the decrypted payload as plain XML.
fn cmd_dump(
    path: &Path,
    output: Option<&Path>,
    keyfile: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    let session = open_session(path, keyfile, cancel)?;
    let xml = Zeroizing::new(to_plain_xml(session.database()).context("Failed to export XML")?);

    match output {
        Some(out) => {
            std::fs::write(out, xml.as_bytes())
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("Exported {} ({} bytes)", out.display(), xml.len());
        }
        None => println!("{}", xml.as_str()),
    }

    Ok(())
}

/// Merge `other` into `path`, or into a new file at `output`.
fn cmd_merge(
    path: &Path,
    other: &Path,
    output: Option<&Path>,
    other_password: bool,
    keyfile: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("Merging {} into {}", other.display(), path.display());

    let password = prompt_password("Enter password: ")?;
    let key = build_key(&password, keyfile)?;
    let mut session = DatabaseSession::open(connection(path), key.clone(), cancel)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let other_key = if other_password {
        let password = prompt_password("Enter password for other copy: ")?;
        build_key(&password, keyfile)?
    } else {
        key.clone()
    };
    let theirs = DatabaseSession::open(connection(other), other_key, cancel)
        .with_context(|| format!("Failed to open {}", other.display()))?;

    let (merged, stats) = merge_with_stats(session.database(), theirs.database());

    match output {
        Some(out) => {
            DatabaseSession::create(connection(out), key, merged, cancel)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("Merged database written to {}", out.display());
        }
        None => {
            *session.database_mut() = merged;
            match session.save(SaveMode::Merge, cancel)? {
                SaveOutcome::Merged(_) => {
                    println!("{} changed during the merge; changes were folded in.", path.display())
                }
                SaveOutcome::Saved | SaveOutcome::RemoteChanged => {
                    println!("Merged database saved to {}", path.display())
                }
            }
        }
    }

    println!("  Groups: {}", stats.groups);
    println!("  Entries: {}", stats.entries);
    println!("  Conflicts: {}", stats.conflicts);
    println!("  Deleted: {}", stats.deleted);
    println!("  Resurrected: {}", stats.resurrected);
    println!("  Moved: {}", stats.reparented);

    Ok(())
}

/// Change the master password.
fn cmd_change_password(
    path: &Path,
    keyfile: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("Changing database password");

    let mut session = open_session(path, keyfile, cancel)?;
    let new_password = prompt_new_password("Enter new password: ")?;
    let key = build_key(&new_password, keyfile)?;

    session
        .change_key(key, cancel)
        .context("Failed to change password")?;
    session
        .save(SaveMode::Detect, cancel)
        .context("Failed to save database")
        .and_then(|outcome| match outcome {
            SaveOutcome::RemoteChanged => {
                anyhow::bail!("{} changed since it was opened; try again", path.display())
            }
            _ => Ok(()),
        })?;

    println!("Password changed successfully!");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_for_strength() {
        assert_eq!(kdf_for_strength("moderate", false).unwrap().name(), "Argon2id");
        assert_eq!(kdf_for_strength("interactive", true).unwrap().name(), "AES-KDF");
        assert!(kdf_for_strength("extreme", false).is_err());
    }

    #[test]
    fn test_build_key_with_keyfile() {
        let dir = std::env::temp_dir();
        let keyfile = dir.join(format!("passvault-cli-test-{}.key", std::process::id()));
        std::fs::write(&keyfile, [7u8; 32]).unwrap();

        let key = build_key("secret", Some(&keyfile)).unwrap();
        assert_eq!(key.component_count(), 2);
        assert_eq!(build_key("secret", None).unwrap().component_count(), 1);

        std::fs::remove_file(&keyfile).unwrap();
    }

    #[test]
    fn test_info_report_from_header() {
        let mut database = Database::new("Info");
        database.settings.kdf = KdfParams::aes(10);
        let sealed = passvault_format::seal(
            &database,
            &CompositeKey::from_password(b"pw"),
            None,
            &CancellationToken::new(),
        )
        .unwrap();

        let header = read_header(&sealed.bytes).unwrap();
        let report = InfoReport::from_header(&header);
        assert_eq!(report.version, "4.0");
        assert_eq!(report.kdf, "AES-KDF");
        assert!(report.inner_stream.is_none());

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("contents").is_none());
    }
}
