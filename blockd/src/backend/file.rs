//! File-backed storage.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::Backend;

/// Backend over an opened file using positioned I/O.
///
/// Reads share the lock; writes take it exclusively, so overlapping writes
/// from different sessions serialize to some sequential order.
pub struct FileBackend {
    file: RwLock<File>,
}

impl FileBackend {
    pub fn new(file: File) -> Self {
        Self {
            file: RwLock::new(file),
        }
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let file = self.file.read().await;
        file.read_at(buf, offset)
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let file = self.file.write().await;
        file.write_at(buf, offset)
    }

    async fn size(&self) -> io::Result<u64> {
        let file = self.file.read().await;
        Ok(file.metadata()?.len())
    }

    async fn sync(&self) -> io::Result<()> {
        let file = self.file.read().await;
        file.sync_all()
    }
}
