use super::stats;
use std::fmt;
use std::io;
use std::path::Path;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum RegionError {
    /// Opening or memory-mapping the backing store failed.
    Map(io::Error),
    /// The path maps, but the kernel refused synchronous (DAX) semantics,
    /// i.e. it is not persistent memory.
    NotPmem(String),
    /// The devdax character device probe failed.
    DaxProbe(String),
    /// The backing store's size differs from the requested region size.
    SizeMismatch { mapped: u64, requested: u64 },
    /// Invalid allocator configuration.
    Config(String),
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::Map(e) => write!(f, "PMem map failed: {e}"),
            RegionError::NotPmem(path) => write!(f, "{path} is not a pmem path"),
            RegionError::DaxProbe(msg) => write!(f, "DAX probe failed: {msg}"),
            RegionError::SizeMismatch { mapped, requested } => write!(
                f,
                "PMem mapped size {mapped} is not same as expected {requested}"
            ),
            RegionError::Config(msg) => write!(f, "invalid allocator config: {msg}"),
        }
    }
}

impl std::error::Error for RegionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegionError::Map(e) => Some(e),
            RegionError::NotPmem(_)
            | RegionError::DaxProbe(_)
            | RegionError::SizeMismatch { .. }
            | RegionError::Config(_) => None,
        }
    }
}

/// The mapped byte range the allocator carves up. Owns the mapping; unmaps
/// on drop.
#[derive(Debug)]
pub(crate) struct Region {
    base: NonNull<u8>,
    len: u64,
}

// Safety: Region owns the mapping and hands out raw offsets only; all
// concurrent access discipline lives in the allocator above it.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map a file on a DAX filesystem with shared, synchronous semantics.
    ///
    /// A missing file is created and sized to `size`; an existing file must
    /// already be exactly `size` bytes. The kernel rejecting `MAP_SYNC` is
    /// the "not persistent memory" signal.
    #[cfg(target_os = "linux")]
    pub fn map_pmem_file(path: &Path, size: u64) -> Result<Self, RegionError> {
        use std::os::fd::AsRawFd;

        match std::fs::metadata(path) {
            Ok(md) => {
                if md.len() != size {
                    return Err(RegionError::SizeMismatch {
                        mapped: md.len(),
                        requested: size,
                    });
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(RegionError::Map(e)),
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(RegionError::Map)?;
        file.set_len(size).map_err(RegionError::Map)?;

        // Safety: FFI call to mmap; fd is live for the duration of the call
        // and the mapping survives the fd.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED_VALIDATE | libc::MAP_SYNC,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            // EOPNOTSUPP: filesystem has no DAX support. EINVAL: kernel
            // predates MAP_SHARED_VALIDATE. Either way, not a pmem path.
            return match err.raw_os_error() {
                Some(libc::EOPNOTSUPP) | Some(libc::EINVAL) => {
                    Err(RegionError::NotPmem(path.display().to_string()))
                }
                _ => Err(RegionError::Map(err)),
            };
        }
        Ok(Self::from_raw(ptr.cast(), size))
    }

    /// Map a devdax character device.
    ///
    /// Confirms `/sys/dev/char/<major>:<minor>/subsystem` resolves to
    /// `/sys/class/dax`, reads the device size from `.../size`, and requires
    /// it to equal `size`.
    #[cfg(target_os = "linux")]
    pub fn map_devdax(path: &Path, size: u64) -> Result<Self, RegionError> {
        use std::os::fd::AsRawFd;

        let device_size = Self::devdax_size(path)?;
        if device_size != size {
            return Err(RegionError::SizeMismatch {
                mapped: device_size,
                requested: size,
            });
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(RegionError::Map)?;

        // Safety: FFI call to mmap (see map_pmem_file).
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RegionError::Map(io::Error::last_os_error()));
        }
        Ok(Self::from_raw(ptr.cast(), size))
    }

    #[cfg(target_os = "linux")]
    fn devdax_size(path: &Path) -> Result<u64, RegionError> {
        use std::os::linux::fs::MetadataExt;

        let md = std::fs::metadata(path)
            .map_err(|e| RegionError::DaxProbe(format!("stat {} failed: {e}", path.display())))?;
        let rdev = md.st_rdev();
        let major = libc::major(rdev);
        let minor = libc::minor(rdev);

        let subsystem = format!("/sys/dev/char/{major}:{minor}/subsystem");
        let resolved = std::fs::canonicalize(&subsystem).map_err(|e| {
            RegionError::DaxProbe(format!("realpath on {subsystem} failed: {e}"))
        })?;
        if resolved != Path::new("/sys/class/dax") {
            return Err(RegionError::DaxProbe(format!(
                "{} is not a DAX character device",
                path.display()
            )));
        }

        let size_path = format!("/sys/dev/char/{major}:{minor}/size");
        let text = std::fs::read_to_string(&size_path)
            .map_err(|e| RegionError::DaxProbe(format!("read {size_path} failed: {e}")))?;
        text.trim()
            .parse()
            .map_err(|e| RegionError::DaxProbe(format!("parse {size_path} failed: {e}")))
    }

    /// Map anonymous memory. Volatile mode: used by the test suite and by
    /// callers that want the allocator without a backing file.
    pub fn anonymous(size: u64) -> Result<Self, RegionError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RegionError::Map(io::Error::last_os_error()));
        }
        Ok(Self::from_raw(ptr.cast(), size))
    }

    fn from_raw(ptr: *mut u8, len: u64) -> Self {
        debug_assert!(!ptr.is_null());
        stats::REGION_MAPPED.add(len as usize);
        Self {
            // Safety: mmap success excludes MAP_FAILED and null.
            base: unsafe { NonNull::new_unchecked(ptr) },
            len,
        }
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Zero-fill the whole region with a small team of threads so the pages
    /// are faulted in before first use. Destroys any existing payload.
    pub fn populate(&self) {
        // A moderate concurrency for streaming writes to PMem.
        const WORKERS: u64 = 16;

        let base = self.base.as_ptr() as usize;
        let len = self.len;
        std::thread::scope(|s| {
            for i in 0..WORKERS {
                let start = len * i / WORKERS;
                let end = len * (i + 1) / WORKERS;
                s.spawn(move || {
                    // Safety: workers write disjoint chunks of the owned
                    // mapping.
                    unsafe {
                        std::ptr::write_bytes(
                            (base + start as usize) as *mut u8,
                            0,
                            (end - start) as usize,
                        );
                    }
                });
            }
        });
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // Safety: FFI call to munmap on the mapping we own.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len as usize);
        }
        stats::REGION_MAPPED.sub(self.len as usize);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("pmem_alloc_test_{}_{tag}", std::process::id()));
        p
    }

    #[test]
    fn test_anonymous_map_round_trip() {
        let region = Region::anonymous(1 << 20).unwrap();
        assert_eq!(region.len(), 1 << 20);
        // Safety: fresh private mapping, single-threaded access.
        unsafe {
            let p = region.base().as_ptr();
            p.write(0xAB);
            p.add((1 << 20) - 1).write(0xCD);
            assert_eq!(p.read(), 0xAB);
            assert_eq!(p.add((1 << 20) - 1).read(), 0xCD);
        }
    }

    #[test]
    fn test_anonymous_zero_size_fails() {
        assert!(Region::anonymous(0).is_err());
    }

    #[test]
    fn test_populate_zeroes_region() {
        let region = Region::anonymous(1 << 20).unwrap();
        // Safety: single-threaded access to the owned mapping.
        unsafe {
            std::ptr::write_bytes(region.base().as_ptr(), 0x5A, 1 << 20);
        }
        region.populate();
        // Safety: populate's worker threads have been joined.
        unsafe {
            let p = region.base().as_ptr();
            assert_eq!(p.read(), 0);
            assert_eq!(p.add(12345).read(), 0);
            assert_eq!(p.add((1 << 20) - 1).read(), 0);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pmem_file_size_mismatch() {
        let path = temp_path("size_mismatch");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let result = Region::map_pmem_file(&path, 8192);
        match result {
            Err(RegionError::SizeMismatch { mapped, requested }) => {
                assert_eq!(mapped, 4096);
                assert_eq!(requested, 8192);
            }
            other => panic!("expected SizeMismatch, got {other:?}"),
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pmem_file_on_ordinary_fs_is_rejected() {
        // temp_dir is not a DAX filesystem, so MAP_SYNC must be refused.
        let path = temp_path("not_pmem");
        let result = Region::map_pmem_file(&path, 1 << 20);
        assert!(result.is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_devdax_probe_rejects_non_dax_node() {
        let result = Region::map_devdax(Path::new("/dev/null"), 1 << 20);
        assert!(matches!(result, Err(RegionError::DaxProbe(_))));
    }

    #[test]
    fn test_mapped_gauge_covers_live_region() {
        // Other tests map and unmap concurrently, so only assert the lower
        // bound contributed by this region while it is held.
        let region = Region::anonymous(1 << 20).unwrap();
        assert!(stats::REGION_MAPPED.get() >= 1 << 20);
        drop(region);
    }
}
