//! Storage backends behind exports.
//!
//! A [`Backend`] is sized random-access storage with explicit durability.
//! Individual calls may transfer fewer bytes than requested; the
//! exact-transfer helpers loop the way the session layer needs.

use std::io;

use async_trait::async_trait;

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

/// Sized random-access storage with explicit durability.
///
/// Overlapping operations from concurrent sessions must serialize to some
/// sequential order; implementations guard their storage with a lock.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Read up to `buf.len()` bytes from `offset`. Returns the number of
    /// bytes read; 0 only at the end of storage.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes written. Durable only after [`sync`](Backend::sync).
    async fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Current storage size in bytes. Reflects extension done externally to
    /// the backend.
    async fn size(&self) -> io::Result<u64>;

    /// Force durability of prior writes.
    async fn sync(&self) -> io::Result<()>;

    /// Fill `buf` exactly from `offset`.
    async fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .read_at(&mut buf[filled..], offset + filled as u64)
                .await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "storage ended mid-read",
                ));
            }
            filled += n;
        }
        Ok(())
    }

    /// Write all of `buf` at `offset`.
    async fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self
                .write_at(&buf[written..], offset + written as u64)
                .await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "storage refused further bytes",
                ));
            }
            written += n;
        }
        Ok(())
    }
}
