//! Open database sessions.
//!
//! A session ties one database to its connection and credentials. It caches
//! the transformed key so ordinary saves skip the KDF, and remembers a
//! fingerprint of the bytes it last read or wrote so a save can tell whether
//! somebody else changed the file in between.

use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use passvault_common::{CancellationToken, Error, Result};
use passvault_crypto::{CompositeKey, KdfParams};
use passvault_format::{container, DerivedKey};
use passvault_model::times::now;
use passvault_model::Database;
use passvault_storage::IoConnection;

use crate::merge::{merge_with_stats, MergeStats};

/// What `save` does when the stored file changed since it was last seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    /// Merge the stored copy into ours and write the result.
    #[default]
    Merge,
    /// Write ours over the stored copy.
    Overwrite,
    /// Write nothing and report the change.
    Detect,
}

/// Result of a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Our database was written as-is.
    Saved,
    /// The stored copy had changed and the merge result was written.
    Merged(MergeStats),
    /// The stored copy had changed; nothing was written (`SaveMode::Detect`).
    RemoteChanged,
}

fn fingerprint(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// An open database bound to its storage location.
pub struct DatabaseSession {
    connection: Arc<dyn IoConnection>,
    key: CompositeKey,
    derived: DerivedKey,
    database: Database,
    fingerprint: [u8; 32],
}

impl DatabaseSession {
    /// Write `database` as a new file.
    ///
    /// # Preconditions
    /// - Nothing exists at the connection yet
    ///
    /// # Errors
    /// - `InvalidInput` if the connection already holds a file
    /// - Any error of the KDF, `seal` or the connection
    pub fn create(
        connection: Arc<dyn IoConnection>,
        key: CompositeKey,
        database: Database,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        if connection.exists()? {
            return Err(Error::InvalidInput(format!(
                "{} already exists",
                connection.describe()
            )));
        }
        let sealed = container::seal(&database, &key, None, cancel)?;
        connection.write_all(&sealed.bytes)?;
        info!(location = %connection.describe(), "Created database");

        Ok(Self {
            fingerprint: fingerprint(&sealed.bytes),
            connection,
            key,
            derived: sealed.key,
            database,
        })
    }

    /// Load the file behind `connection`.
    ///
    /// # Errors
    /// - `NotFound` if the connection holds nothing
    /// - Any error of [`container::open`]; no session is returned then
    pub fn open(
        connection: Arc<dyn IoConnection>,
        key: CompositeKey,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let bytes = connection.read_all()?;
        let opened = container::open(&bytes, &key, None, cancel)?;
        info!(location = %connection.describe(), "Opened database");

        Ok(Self {
            fingerprint: fingerprint(&bytes),
            connection,
            key,
            derived: opened.key,
            database: opened.database,
        })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn database_mut(&mut self) -> &mut Database {
        &mut self.database
    }

    pub fn connection(&self) -> &Arc<dyn IoConnection> {
        &self.connection
    }

    /// SHA-256 of the bytes last read or written.
    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    /// Discard in-memory changes and load the stored file again.
    pub fn reload(&mut self, cancel: &CancellationToken) -> Result<()> {
        let bytes = self.connection.read_all()?;
        let opened = container::open(&bytes, &self.key, Some(&self.derived), cancel)?;
        self.database = opened.database;
        self.derived = opened.key;
        self.fingerprint = fingerprint(&bytes);
        debug!(location = %self.connection.describe(), "Reloaded database");
        Ok(())
    }

    /// Save, reconciling with concurrent writers according to `mode`.
    ///
    /// # Postconditions
    /// - On `Saved` / `Merged` the session holds exactly what was written
    /// - On `RemoteChanged` or any error the session is unchanged
    ///
    /// # Errors
    /// - `IntegrityCheckFailed` if the stored copy cannot be opened with the
    ///   session key during a merge
    /// - Any error of `seal` or the connection
    pub fn save(&mut self, mode: SaveMode, cancel: &CancellationToken) -> Result<SaveOutcome> {
        let stored = if self.connection.exists()? {
            Some(self.connection.read_all()?)
        } else {
            None
        };
        let changed = stored
            .as_deref()
            .is_some_and(|bytes| fingerprint(bytes) != self.fingerprint);

        if !changed {
            let database = self.database.clone();
            self.write(database, cancel)?;
            return Ok(SaveOutcome::Saved);
        }

        warn!(
            location = %self.connection.describe(),
            ?mode,
            "Stored database changed since it was loaded"
        );
        match (mode, stored) {
            (SaveMode::Detect, _) => Ok(SaveOutcome::RemoteChanged),
            (SaveMode::Overwrite, _) | (SaveMode::Merge, None) => {
                let database = self.database.clone();
                self.write(database, cancel)?;
                Ok(SaveOutcome::Saved)
            }
            (SaveMode::Merge, Some(bytes)) => {
                let remote = container::open(&bytes, &self.key, Some(&self.derived), cancel)?;
                let (merged, stats) = merge_with_stats(&self.database, &remote.database);
                self.write(merged, cancel)?;
                Ok(SaveOutcome::Merged(stats))
            }
        }
    }

    /// Switch to a new KDF with a fresh seed or salt.
    ///
    /// Takes effect on the next save.
    pub fn change_kdf(&mut self, kdf: KdfParams, cancel: &CancellationToken) -> Result<()> {
        let kdf = kdf.with_fresh_seed();
        let derived = DerivedKey::derive(&self.key, &kdf, cancel)?;
        info!(kdf = kdf.name(), "Changed key derivation");
        self.database.settings.kdf = kdf;
        self.database.meta.settings_changed = now();
        self.derived = derived;
        Ok(())
    }

    /// Replace the credentials. Takes effect on the next save.
    ///
    /// A fresh KDF seed is drawn so the new key shares nothing with the old.
    pub fn change_key(&mut self, key: CompositeKey, cancel: &CancellationToken) -> Result<()> {
        let kdf = self.database.settings.kdf.with_fresh_seed();
        let derived = DerivedKey::derive(&key, &kdf, cancel)?;
        info!("Changed master key");
        self.database.settings.kdf = kdf;
        self.database.meta.master_key_changed = now();
        self.key = key;
        self.derived = derived;
        Ok(())
    }

    /// Seal and commit `database`, then adopt it.
    fn write(&mut self, database: Database, cancel: &CancellationToken) -> Result<()> {
        let sealed = container::seal(&database, &self.key, Some(&self.derived), cancel)?;
        self.connection.write_all(&sealed.bytes)?;

        self.fingerprint = fingerprint(&sealed.bytes);
        self.derived = sealed.key;
        self.database = database;
        debug!(location = %self.connection.describe(), "Saved database");
        Ok(())
    }
}

impl fmt::Debug for DatabaseSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSession")
            .field("connection", &self.connection.describe())
            .field("key", &self.key)
            .field("fingerprint", &hex::encode(self.fingerprint))
            .finish_non_exhaustive()
    }
}
