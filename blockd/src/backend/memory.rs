//! In-memory storage.

use std::io;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::Backend;

/// Fixed-capacity byte buffer behind a mutex.
///
/// `sync` is a no-op; there is nothing more durable to flush to.
pub struct MemoryBackend {
    memory: Mutex<Vec<u8>>,
}

impl MemoryBackend {
    pub fn new(memory: Vec<u8>) -> Self {
        Self {
            memory: Mutex::new(memory),
        }
    }

    /// Zero-filled backend of `size` bytes.
    pub fn zeroed(size: usize) -> Self {
        Self::new(vec![0u8; size])
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let memory = self.memory.lock().await;
        let start = bounded_offset(offset, memory.len())?;
        let n = buf.len().min(memory.len() - start);
        buf[..n].copy_from_slice(&memory[start..start + n]);
        Ok(n)
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut memory = self.memory.lock().await;
        let start = bounded_offset(offset, memory.len())?;
        let n = buf.len().min(memory.len() - start);
        memory[start..start + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    async fn size(&self) -> io::Result<u64> {
        Ok(self.memory.lock().await.len() as u64)
    }

    async fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

fn bounded_offset(offset: u64, len: usize) -> io::Result<usize> {
    if offset > len as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("offset {offset} beyond storage of {len} bytes"),
        ));
    }
    Ok(offset as usize)
}
