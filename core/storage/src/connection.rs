//! Connection trait definition.

use std::io::{Read, Write};

use passvault_common::Result;

/// A pending write. Nothing is visible to readers until [`commit`].
///
/// Dropping a stream without committing discards the data.
///
/// [`commit`]: WriteStream::commit
pub trait WriteStream: Write + Send {
    /// Publish the written bytes atomically.
    ///
    /// # Errors
    /// - `Io` if flushing or publishing fails; the previous content is then
    ///   still in place
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Location of one database file.
///
/// Implementations handle their own authentication and retries; callers
/// see a plain byte source and sink.
pub trait IoConnection: Send + Sync {
    /// Human-readable location, safe to log.
    fn describe(&self) -> String;

    /// Open the current content for reading.
    ///
    /// # Errors
    /// - `NotFound` if nothing was written yet
    /// - `Io` on transport failures
    fn open_read(&self) -> Result<Box<dyn Read + Send>>;

    /// Start a new write that replaces the content on commit.
    ///
    /// # Errors
    /// - `Io` if the staging area cannot be created
    fn open_write(&self) -> Result<Box<dyn WriteStream>>;

    /// Whether any content exists.
    fn exists(&self) -> Result<bool>;

    /// Remove the content.
    ///
    /// # Errors
    /// - `NotFound` if nothing exists
    fn delete(&self) -> Result<()>;

    /// Read the whole content.
    fn read_all(&self) -> Result<Vec<u8>> {
        let mut reader = self.open_read()?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Replace the whole content atomically.
    fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.open_write()?;
        writer.write_all(data)?;
        writer.commit()
    }
}
