//! Shared-memory segments for same-host tensor transfer.
//!
//! A segment is a POSIX shared-memory object (`/dev/shm`) mapped read-write
//! into the process. Tensor payloads are addressed by a 64-bit worker key:
//! the low 16 bits select a fixed-size partition inside the segment named by
//! the remaining high bits, so one `mmap` per base key serves every partition
//! of that tensor group.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::Mutex;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

/// Number of partition slots addressable inside one segment.
pub const PARTITIONS_PER_SEGMENT: u64 = 1 << 16;

/// Partition sequence number of a worker key (low 16 bits).
#[inline]
pub fn seq_num(worker_key: u64) -> u64 {
    worker_key % PARTITIONS_PER_SEGMENT
}

/// Base key of a worker key: the key with its partition bits cleared.
/// Names the shared-memory object the partition lives in.
#[inline]
pub fn base_key(worker_key: u64) -> u64 {
    worker_key - seq_num(worker_key)
}

/// A region of shared memory backed by `/dev/shm`.
pub struct Segment {
    ptr: NonNull<u8>,
    size: usize,
    name: CString,
    _fd: OwnedFd,
    is_owner: bool,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Creates a new shared-memory segment of `size` bytes.
    ///
    /// The caller becomes the owner; the object is unlinked when the
    /// segment is dropped.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        let cname = to_cstring(name)?;
        let fd = shm_open(
            cname.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        if let Err(e) = ftruncate(&fd, size as i64) {
            let _ = shm_unlink(cname.as_c_str());
            return Err(io::Error::from_raw_os_error(e as i32));
        }

        let ptr = map_fd(&fd, size).inspect_err(|_| {
            let _ = shm_unlink(cname.as_c_str());
        })?;

        Ok(Self {
            ptr,
            size,
            name: cname,
            _fd: fd,
            is_owner: true,
        })
    }

    /// Opens an existing shared-memory segment, mapping its full extent as
    /// reported by `fstat`. The creator retains ownership of the object.
    pub fn open(name: &str) -> io::Result<Self> {
        let cname = to_cstring(name)?;
        let fd = shm_open(cname.as_c_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let size = st.st_size as usize;

        let ptr = map_fd(&fd, size)?;
        Ok(Self {
            ptr,
            size,
            name: cname,
            _fd: fd,
            is_owner: false,
        })
    }

    /// Base address of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
        if self.is_owner {
            let _ = shm_unlink(self.name.as_c_str());
        }
    }
}

fn to_cstring(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "segment name contains NUL")
    })
}

fn map_fd(fd: &OwnedFd, size: usize) -> io::Result<NonNull<u8>> {
    let len = NonZeroUsize::new(size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "size must be non-zero"))?;
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
    .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok(ptr.cast())
}

/// Lazily-opened table of segments, one per base key.
///
/// `partition` resolves a worker key to the address of its partition,
/// opening and caching the backing segment on first use.
pub struct SegmentTable {
    prefix: String,
    partition_bytes: usize,
    segments: Mutex<HashMap<u64, Segment>>,
}

impl SegmentTable {
    pub fn new(prefix: impl Into<String>, partition_bytes: usize) -> Self {
        Self {
            prefix: prefix.into(),
            partition_bytes,
            segments: Mutex::new(HashMap::new()),
        }
    }

    /// Partition stride in bytes.
    #[inline]
    pub fn partition_bytes(&self) -> usize {
        self.partition_bytes
    }

    /// Byte offset of a worker key inside its segment.
    #[inline]
    pub fn partition_offset(&self, worker_key: u64) -> usize {
        seq_num(worker_key) as usize * self.partition_bytes
    }

    /// Address of the partition for `worker_key`, opening the segment
    /// `<prefix><base_key>` on first access.
    pub fn partition(&self, worker_key: u64) -> io::Result<*mut u8> {
        let base = base_key(worker_key);
        let offset = self.partition_offset(worker_key);

        let mut segments = self.segments.lock().unwrap();
        if let Some(seg) = segments.get(&base) {
            return Ok(unsafe { seg.as_ptr().add(offset) });
        }

        let name = format!("{}{}", self.prefix, base);
        let seg = Segment::open(&name)?;
        log::debug!(
            "opened shared memory {}: size={}, offset={}",
            name,
            seg.len(),
            offset
        );
        let ptr = unsafe { seg.as_ptr().add(offset) };
        segments.insert(base, seg);
        Ok(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_decomposition() {
        assert_eq!(seq_num(0), 0);
        assert_eq!(seq_num(9), 9);
        assert_eq!(seq_num(0x30005), 5);
        assert_eq!(base_key(0x30005), 0x30000);
        assert_eq!(base_key(9), 0);
        assert_eq!(seq_num(u64::MAX), 0xFFFF);
    }

    #[test]
    fn partition_offsets() {
        let table = SegmentTable::new("test_prefix", 4096);
        assert_eq!(table.partition_offset(0x30000), 0);
        assert_eq!(table.partition_offset(0x30001), 4096);
        assert_eq!(table.partition_offset(0x30007), 7 * 4096);
    }

    #[test]
    fn create_open_roundtrip() {
        let name = format!("/shmipc_test_{}", std::process::id());
        let size = 2 * 4096;

        let owner = Segment::create(&name, size).expect("create");
        assert_eq!(owner.len(), size);
        unsafe {
            std::ptr::write_bytes(owner.as_ptr(), 0xAB, size);
        }

        let reader = Segment::open(&name).expect("open");
        assert_eq!(reader.len(), size);
        let view = unsafe { std::slice::from_raw_parts(reader.as_ptr(), size) };
        assert!(view.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn table_resolves_partitions() {
        let prefix = format!("/shmipc_table_{}_", std::process::id());
        let partition_bytes = 4096usize;
        // Segment for base key 0 covering four partitions.
        let seg = Segment::create(&format!("{}0", prefix), 4 * partition_bytes).expect("create");
        unsafe {
            std::ptr::write_bytes(seg.as_ptr().add(2 * partition_bytes), 0x5A, partition_bytes);
        }

        let table = SegmentTable::new(prefix, partition_bytes);
        let ptr = table.partition(2).expect("partition");
        let view = unsafe { std::slice::from_raw_parts(ptr, partition_bytes) };
        assert!(view.iter().all(|&b| b == 0x5A));
    }
}
