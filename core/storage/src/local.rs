//! Local filesystem connection.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::connection::{IoConnection, WriteStream};
use passvault_common::{Error, Result};

/// A database file on the local filesystem.
///
/// Writes go to a temporary file in the same directory and are renamed over
/// the target on commit, so readers never observe a partial file.
#[derive(Debug, Clone)]
pub struct LocalFileConnection {
    path: PathBuf,
}

impl LocalFileConnection {
    /// Create a connection for `path`.
    ///
    /// # Postconditions
    /// - The file itself need not exist yet
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }
}

impl IoConnection for LocalFileConnection {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn open_read(&self) -> Result<Box<dyn Read + Send>> {
        match File::open(&self.path) {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("File not found: {}", self.describe())))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn open_write(&self) -> Result<Box<dyn WriteStream>> {
        let dir = self.directory();
        if !dir.is_dir() {
            return Err(Error::NotFound(format!(
                "Parent directory not found: {}",
                dir.display()
            )));
        }
        let temp = NamedTempFile::new_in(dir)?;
        Ok(Box::new(LocalWriter {
            temp,
            target: self.path.clone(),
        }))
    }

    fn exists(&self) -> Result<bool> {
        Ok(self.path.is_file())
    }

    fn delete(&self) -> Result<()> {
        if !self.path.exists() {
            return Err(Error::NotFound(format!("File not found: {}", self.describe())));
        }
        if self.path.is_dir() {
            return Err(Error::InvalidInput(format!(
                "{} is a directory",
                self.describe()
            )));
        }
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

struct LocalWriter {
    temp: NamedTempFile,
    target: PathBuf,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.temp.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.temp.flush()
    }
}

impl WriteStream for LocalWriter {
    fn commit(self: Box<Self>) -> Result<()> {
        let LocalWriter { mut temp, target } = *self;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&target).map_err(|e| Error::Io(e.error))?;
        debug!(path = %target.display(), "Committed file write");
        Ok(())
    }
}
