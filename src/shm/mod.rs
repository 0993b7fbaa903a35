//! Shared-memory data plane: named regions, typed views, and named
//! semaphores for cross-process synchronization.
//!
//! Regions and semaphores are inherently shared with the child;
//! synchronizing access between the two sides is the caller's
//! responsibility and the intended use of [`NamedSemaphore`].

pub mod array;
pub mod semaphore;

pub use array::{Element, SharedArray};
pub use semaphore::NamedSemaphore;

use std::io::{self, Read, Seek, SeekFrom, Write};

use shared_memory_extended::{Shmem, ShmemConf};

use crate::{Error, Result};

/// A named, sized shared-memory region with a read/write cursor.
///
/// The creator unlinks the OS name on drop; openers only unmap. Reads and
/// writes are bounded by `size`: offsets past the end signal end-of-stream
/// by transferring zero bytes.
pub struct SharedMemory {
    name: String,
    size: usize,
    pos: u64,
    shmem: Shmem,
}

// Safety: the mapping itself is process-shared by construction; all
// access goes through bounded raw-pointer copies, and synchronization
// between processes is explicitly the caller's concern.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a new shared memory region.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|e| Error::SharedMemory(format!("failed to create region {name:?}: {e}")))?;
        tracing::debug!("created shared memory region {name} ({size} bytes)");
        Ok(Self {
            name: name.to_string(),
            size,
            pos: 0,
            shmem,
        })
    }

    /// Open an existing shared memory region.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .open()
            .map_err(|e| Error::SharedMemory(format!("failed to open region {name:?}: {e}")))?;
        // The OS mapping is authoritative; never let the requested size
        // extend bounds past it.
        let size = size.min(shmem.len());
        tracing::debug!("opened shared memory region {name} ({size} bytes)");
        Ok(Self {
            name: name.to_string(),
            size,
            pos: 0,
            shmem,
        })
    }

    /// Region name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Region size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this handle created the region (and will unlink it).
    pub fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    /// Read into `buf` starting at `offset`.
    ///
    /// Returns the number of bytes read; zero when `offset` is at or past
    /// the end of the region.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let Some(available) = self.size.checked_sub(offset as usize) else {
            return Ok(0);
        };
        let n = buf.len().min(available);
        // SAFETY: offset + n is within the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset as usize), buf.as_mut_ptr(), n);
        }
        Ok(n)
    }

    /// Write `buf` starting at `offset`.
    ///
    /// Returns the number of bytes written, truncated at the end of the
    /// region; zero when `offset` is at or past the end.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let Some(available) = self.size.checked_sub(offset as usize) else {
            return Ok(0);
        };
        let n = buf.len().min(available);
        // SAFETY: offset + n is within the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.as_ptr().add(offset as usize), n);
        }
        Ok(n)
    }

    /// View the region from `offset` onward as a slice of `T`.
    ///
    /// Length is `(size - offset) / size_of::<T>()`.
    ///
    /// # Safety
    ///
    /// `offset` must be aligned for `T`, and the caller is responsible for
    /// synchronizing with any concurrent writer, in this process or the
    /// child.
    pub unsafe fn typed_slice<T>(&self, offset: usize) -> &[T] {
        debug_assert!(offset <= self.size);
        debug_assert_eq!((self.as_ptr() as usize + offset) % std::mem::align_of::<T>(), 0);
        let count = self.size.saturating_sub(offset) / std::mem::size_of::<T>();
        std::slice::from_raw_parts(self.as_ptr().add(offset) as *const T, count)
    }

    /// Mutable variant of [`typed_slice`](Self::typed_slice).
    ///
    /// # Safety
    ///
    /// Same contract as [`typed_slice`](Self::typed_slice), plus exclusive
    /// access to the viewed range.
    pub unsafe fn typed_slice_mut<T>(&self, offset: usize) -> &mut [T] {
        debug_assert!(offset <= self.size);
        debug_assert_eq!((self.as_ptr() as usize + offset) % std::mem::align_of::<T>(), 0);
        let count = self.size.saturating_sub(offset) / std::mem::size_of::<T>();
        std::slice::from_raw_parts_mut(self.as_ptr().add(offset) as *mut T, count)
    }
}

impl Read for SharedMemory {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .read_at(buf, self.pos)
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for SharedMemory {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self
            .write_at(buf, self.pos)
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SharedMemory {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.size as i64 + delta,
        };
        if target < 0 || target > self.size as i64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside region",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("owner", &self.is_owner())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn unique_name(tag: &str) -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "pyt-{}-{}-{}",
        std::process::id(),
        tag,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_bounds() {
        let shm = SharedMemory::create(&unique_name("bounds"), 16).unwrap();

        assert_eq!(shm.write_at(b"hello", 0).unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(shm.read_at(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        // Writes are truncated at the end of the region.
        assert_eq!(shm.write_at(b"abcdef", 12).unwrap(), 4);
        // Offsets at or past the end signal end-of-stream.
        assert_eq!(shm.write_at(b"x", 16).unwrap(), 0);
        assert_eq!(shm.read_at(&mut buf, 16).unwrap(), 0);
        assert_eq!(shm.read_at(&mut buf, 99).unwrap(), 0);

        let mut tail = [0u8; 8];
        let n = shm.read_at(&mut tail, 12).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&tail[..n], b"abcd");
    }

    #[test]
    fn test_cursor_read_write_seek() {
        let mut shm = SharedMemory::create(&unique_name("cursor"), 8).unwrap();

        shm.write_all(b"abcd").unwrap();
        shm.seek(SeekFrom::Start(2)).unwrap();
        let mut buf = [0u8; 2];
        shm.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"cd");

        assert_eq!(shm.seek(SeekFrom::End(0)).unwrap(), 8);
        assert_eq!(shm.read(&mut buf).unwrap(), 0);
        assert!(shm.seek(SeekFrom::Current(1)).is_err());
        assert!(shm.seek(SeekFrom::Start(99)).is_err());
    }

    #[test]
    fn test_open_sees_creator_writes() {
        let name = unique_name("shared");
        let creator = SharedMemory::create(&name, 32).unwrap();
        creator.write_at(b"ping", 0).unwrap();

        let opener = SharedMemory::open(&name, 32).unwrap();
        assert!(!opener.is_owner());
        let mut buf = [0u8; 4];
        opener.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"ping");

        opener.write_at(b"pong", 0).unwrap();
        creator.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_typed_slice() {
        let shm = SharedMemory::create(&unique_name("typed"), 32).unwrap();
        let words: Vec<u8> = (0u32..8).flat_map(|i| i.to_le_bytes()).collect();
        shm.write_at(&words, 0).unwrap();

        // SAFETY: offset 0 is aligned and nothing else touches the region.
        let view = unsafe { shm.typed_slice::<u32>(0) };
        assert_eq!(view.len(), 8);
        assert_eq!(view[5], 5);

        // SAFETY: offset 8 keeps u32 alignment.
        let tail = unsafe { shm.typed_slice::<u32>(8) };
        assert_eq!(tail.len(), 6);
        assert_eq!(tail[0], 2);
    }
}
