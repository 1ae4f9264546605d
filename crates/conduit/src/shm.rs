use crate::errors::SetupError;
use memmap2::MmapOptions;
use std::fs::OpenOptions;
use std::path::Path;

/// One file-backed shared memory region.
///
/// The base pointer is captured once at map time; the mapping is owned by the
/// segment and never remapped, so the pointer stays valid for the segment's
/// lifetime. Both participants map the same file (by convention under
/// `/dev/shm`) and coordinate exclusively through the atomic words of the
/// state region.
pub struct ShmSegment {
    _mmap: memmap2::MmapMut,
    base: *mut u8,
    len: usize,
}

// SAFETY: the mapping is never moved after construction, and all concurrent
// access is mediated by atomic loads/stores (or raw copies ordered by them).
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create or open the backing file, expand it if undersized, and map it
    /// read-write.
    ///
    /// A freshly created file is zero-filled by the kernel, which is exactly
    /// the initial state both regions expect.
    pub fn create(path: impl AsRef<Path>, len: usize) -> Result<Self, SetupError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        // Only resize if the file is smaller than needed
        if file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }

        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Self::from_mmap(mmap))
    }

    /// Map an existing region read-write. Fails if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SetupError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Self::from_mmap(mmap))
    }

    fn from_mmap(mut mmap: memmap2::MmapMut) -> Self {
        let base = mmap.as_mut_ptr();
        let len = mmap.len();
        Self { _mmap: mmap, base, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }
}
