//! In-memory connection for testing and embedding.

use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::connection::{IoConnection, WriteStream};
use passvault_common::{Error, Result};

type Slot = Arc<RwLock<Option<Vec<u8>>>>;

fn poisoned() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, "memory slot lock poisoned"))
}

/// Shared in-memory file.
///
/// Clones share the same buffer, so two sessions can act as two writers of
/// one file.
#[derive(Clone, Default)]
pub struct MemoryConnection {
    name: String,
    slot: Slot,
}

impl MemoryConnection {
    /// Create an empty connection.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot: Arc::default(),
        }
    }

    /// Create a connection that already holds `data`.
    pub fn with_data(name: impl Into<String>, data: Vec<u8>) -> Self {
        let conn = Self::new(name);
        if let Ok(mut slot) = conn.slot.write() {
            *slot = Some(data);
        }
        conn
    }

    /// Copy of the current content, if any.
    pub fn snapshot(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.slot.read().map_err(|_| poisoned())?.clone())
    }

    /// Replace the content directly, bypassing the write stream.
    pub fn replace(&self, data: Vec<u8>) -> Result<()> {
        *self.slot.write().map_err(|_| poisoned())? = Some(data);
        Ok(())
    }
}

impl IoConnection for MemoryConnection {
    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }

    fn open_read(&self) -> Result<Box<dyn Read + Send>> {
        let slot = self.slot.read().map_err(|_| poisoned())?;
        match slot.as_ref() {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(Error::NotFound(self.describe())),
        }
    }

    fn open_write(&self) -> Result<Box<dyn WriteStream>> {
        Ok(Box::new(MemoryWriter {
            slot: Arc::clone(&self.slot),
            buffer: Vec::new(),
        }))
    }

    fn exists(&self) -> Result<bool> {
        Ok(self.slot.read().map_err(|_| poisoned())?.is_some())
    }

    fn delete(&self) -> Result<()> {
        let mut slot = self.slot.write().map_err(|_| poisoned())?;
        if slot.take().is_none() {
            return Err(Error::NotFound(self.describe()));
        }
        Ok(())
    }
}

struct MemoryWriter {
    slot: Slot,
    buffer: Vec<u8>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteStream for MemoryWriter {
    fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        debug!(len = this.buffer.len(), "Committing memory write");
        *this.slot.write().map_err(|_| poisoned())? = Some(this.buffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read() {
        let conn = MemoryConnection::new("test");
        assert!(!conn.exists().unwrap());

        conn.write_all(b"Hello, World!").unwrap();
        assert!(conn.exists().unwrap());
        assert_eq!(conn.read_all().unwrap(), b"Hello, World!");
    }

    #[test]
    fn test_uncommitted_write_is_invisible() {
        let conn = MemoryConnection::with_data("test", vec![1, 2, 3]);
        let mut writer = conn.open_write().unwrap();
        writer.write_all(&[9, 9]).unwrap();
        assert_eq!(conn.read_all().unwrap(), vec![1, 2, 3]);

        drop(writer);
        assert_eq!(conn.read_all().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_clones_share_content() {
        let a = MemoryConnection::new("shared");
        let b = a.clone();
        a.write_all(b"one").unwrap();
        assert_eq!(b.read_all().unwrap(), b"one");
    }

    #[test]
    fn test_delete() {
        let conn = MemoryConnection::with_data("test", vec![1]);
        conn.delete().unwrap();
        assert!(!conn.exists().unwrap());
        assert!(matches!(conn.delete(), Err(Error::NotFound(_))));
        assert!(matches!(conn.open_read(), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_describe() {
        assert_eq!(MemoryConnection::new("vault").describe(), "memory:vault");
    }
}
