//! Named POSIX shared-memory segments: create/attach, size, map, probe, unlink.
//!
//! The segment header layout is defined here because it is part of the
//! on-segment format that both the probe path (read-only, temporary mapping)
//! and the ring (full read-write mapping) must agree on bit-exactly.

use crate::error::{Error, Result};
use crossbeam_utils::CachePadded;
use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;

/// One padded line of the segment header. Each consumer tail occupies a full
/// line of its own so that tail updates by one consumer never invalidate the
/// producer's cached view of the others.
pub(crate) type TailLine = CachePadded<AtomicU32>;

/// Stride of a header line. Computed, never hardcoded: `CachePadded` matches
/// the destructive-interference size of the target architecture.
pub(crate) const LINE: usize = size_of::<TailLine>();

/// Fixed part of the segment header, placed at offset 0 of the mapping and
/// occupying the first line. `capacity`, `slot_size` and `num_consumers` are
/// write-once: stored Relaxed during initialization and read-only thereafter.
/// A stored `capacity` of 0 marks the header as uninitialized.
#[repr(C)]
pub(crate) struct FixedHeader {
    pub head: AtomicU32,
    pub capacity: AtomicU32,
    pub slot_size: AtomicU32,
    pub num_consumers: AtomicU32,
}

const _: () = assert!(size_of::<FixedHeader>() <= LINE);

/// Total header size for a given consumer count: the fixed line followed by
/// one tail line per consumer. The slot region starts here.
pub(crate) fn header_bytes(num_consumers: u32) -> usize {
    LINE * (1 + num_consumers as usize)
}

/// How `open_or_create` treats an existing (or missing) segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Create if absent, attach if present; size via truncation either way.
    OpenOrCreate,
    /// Unlink any prior segment with this name first, then create fresh.
    ForceRecreate,
    /// Attach only; fail with `NotFound` if no such segment exists. Never
    /// resizes: the segment is mapped at its actual existing size, so a
    /// sibling process still mapped at that size is never pulled out from
    /// under.
    OpenExistingOnly,
}

/// Header fields copied out of an existing segment by [`probe_header`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentInfo {
    pub capacity: u32,
    pub slot_size: u32,
    pub num_consumers: u32,
    pub byte_size: u64,
}

/// A named shared-memory segment mapped read-write into this process.
///
/// Dropping a `SharedSegment` unmaps it and nothing more: the name binding
/// survives until some process calls [`unlink`]. Which process does so is a
/// deployment decision, not a property of this handle.
#[derive(Debug)]
pub struct SharedSegment {
    ptr: NonNull<u8>,
    len: usize,
    name: String,
}

// SAFETY: the mapping is plain shared memory with no thread-local state; a
// handle may move between threads. Deliberately not Sync: every role (the
// producer, each consumer) attaches its own handle, so one handle is never
// shared across threads.
unsafe impl Send for SharedSegment {}

impl SharedSegment {
    /// Creates and/or attaches the named segment.
    ///
    /// Under the creating modes the segment is sized to `total_bytes` via
    /// `ftruncate`, which is idempotent when it already has that size. Under
    /// `OpenExistingOnly` the segment is left exactly as found and mapped at
    /// its existing size; callers compare that against what they expected.
    /// The file descriptor is closed before returning; the mapping stays
    /// valid without it.
    pub fn open_or_create(name: &str, total_bytes: usize, mode: OpenMode) -> Result<Self> {
        validate_name(name)?;
        if total_bytes == 0 {
            return Err(Error::InvalidArgument(
                "segment size must be non-zero".into(),
            ));
        }
        let c_name = c_name(name)?;

        if mode == OpenMode::ForceRecreate {
            // Stale segment (possibly with a different size) goes away first.
            unlink(name)?;
        }

        let oflag = match mode {
            OpenMode::OpenExistingOnly => libc::O_RDWR,
            _ => libc::O_CREAT | libc::O_RDWR,
        };

        // SAFETY: c_name is a valid NUL-terminated string; oflag and mode are
        // valid POSIX constants.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflag, 0o600) };
        if fd == -1 {
            let source = io::Error::last_os_error();
            if mode == OpenMode::OpenExistingOnly
                && source.raw_os_error() == Some(libc::ENOENT)
            {
                return Err(Error::NotFound(name.to_owned()));
            }
            return Err(Error::Io {
                op: "shm_open",
                source,
            });
        }

        let map_len = if mode == OpenMode::OpenExistingOnly {
            // Attach-only never mutates the segment: take its size as found
            // and map exactly that, the way probe_header sizes its peek.
            // SAFETY: fd is a valid descriptor; st is a valid out-parameter.
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } == -1 {
                let err = Error::io("fstat");
                // SAFETY: fd is valid and owned here.
                unsafe { libc::close(fd) };
                return Err(err);
            }
            st.st_size as usize
        } else {
            // SAFETY: fd is a valid descriptor from shm_open above.
            if unsafe { libc::ftruncate(fd, total_bytes as libc::off_t) } == -1 {
                let err = Error::io("ftruncate");
                // SAFETY: fd is valid and owned here.
                unsafe { libc::close(fd) };
                return Err(err);
            }
            total_bytes
        };
        if map_len == 0 {
            // SAFETY: fd is valid and owned here.
            unsafe { libc::close(fd) };
            return Err(Error::Incompatible(format!(
                "segment {} exists but is empty",
                name
            )));
        }

        // SAFETY: fd is valid, map_len > 0, and the protection/flag
        // constants are valid for a shared read-write mapping.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = Error::io("mmap");
            // SAFETY: fd is valid and owned here.
            unsafe { libc::close(fd) };
            return Err(err);
        }
        // SAFETY: fd is valid; the mapping stays valid after close.
        unsafe { libc::close(fd) };

        log::debug!(
            "mapped shared segment {} ({} bytes, mode {:?})",
            name,
            map_len,
            mode
        );

        Ok(Self {
            // SAFETY: mmap returned a non-MAP_FAILED address, which is non-null.
            ptr: unsafe { NonNull::new_unchecked(addr as *mut u8) },
            len: map_len,
            name: name.to_owned(),
        })
    }

    /// Base address of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The POSIX name this segment was opened under.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping established in open_or_create.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if rc == -1 {
            log::error!(
                "munmap of segment {} failed: {}",
                self.name,
                io::Error::last_os_error()
            );
        }
    }
}

/// Read-only peek at an existing segment's header.
///
/// Maps just the fixed header line with read-only access, copies the fields
/// out and unmaps again. Returns `None` when the segment does not exist or is
/// smaller than one header line; the caller cannot distinguish the two, which
/// is exactly the contract of a probe.
pub fn probe_header(name: &str) -> Option<SegmentInfo> {
    validate_name(name).ok()?;
    let c_name = CString::new(name).ok()?;

    // SAFETY: c_name is a valid NUL-terminated string.
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
    if fd == -1 {
        return None;
    }

    // SAFETY: fd is a valid descriptor; st is a valid out-parameter.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } == -1 {
        // SAFETY: fd is valid and owned here.
        unsafe { libc::close(fd) };
        return None;
    }
    let byte_size = st.st_size as u64;
    if (byte_size as usize) < LINE {
        // SAFETY: fd is valid and owned here.
        unsafe { libc::close(fd) };
        return None;
    }

    // SAFETY: fd is valid and the segment is at least LINE bytes long.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            LINE,
            libc::PROT_READ,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    // SAFETY: fd is valid; the mapping (if any) stays valid after close.
    unsafe { libc::close(fd) };
    if addr == libc::MAP_FAILED {
        return None;
    }

    // SAFETY: the mapping is at least LINE >= size_of::<FixedHeader>() bytes
    // and page-aligned, so reading the header through atomics is in-bounds
    // and aligned.
    let info = unsafe {
        use std::sync::atomic::Ordering::Relaxed;
        let header = &*(addr as *const FixedHeader);
        SegmentInfo {
            capacity: header.capacity.load(Relaxed),
            slot_size: header.slot_size.load(Relaxed),
            num_consumers: header.num_consumers.load(Relaxed),
            byte_size,
        }
    };

    // SAFETY: addr/LINE describe the mapping established above.
    unsafe { libc::munmap(addr, LINE) };
    Some(info)
}

/// Removes the name binding. Existing mappings remain valid until their
/// holders unmap. A missing segment is not an error: unlink is idempotent.
pub fn unlink(name: &str) -> Result<()> {
    validate_name(name)?;
    let c_name = c_name(name)?;
    // SAFETY: c_name is a valid NUL-terminated string.
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } == -1 {
        let source = io::Error::last_os_error();
        if source.raw_os_error() == Some(libc::ENOENT) {
            return Ok(());
        }
        return Err(Error::Io {
            op: "shm_unlink",
            source,
        });
    }
    log::debug!("unlinked shared segment {}", name);
    Ok(())
}

/// POSIX naming rules: a leading `/`, at least one further character, and no
/// interior `/`.
fn validate_name(name: &str) -> Result<()> {
    if !name.starts_with('/') || name.len() < 2 || name[1..].contains('/') {
        return Err(Error::InvalidArgument(format!(
            "segment name {:?} must start with '/' and contain no other '/'",
            name
        )));
    }
    Ok(())
}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name)
        .map_err(|_| Error::InvalidArgument(format!("segment name {:?} contains NUL", name)))
}
