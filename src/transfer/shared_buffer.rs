// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use super::TransferError;
use crate::shared::constants::MAX_SHARED_MEMORY_SIZE;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::collections::HashMap;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::Mutex;

/// Bookkeeping for one mapped view: the page-aligned base address actually
/// handed out by the kernel and the number of bytes mapped there.
struct ViewInfo {
    base: usize,
    mapped_len: usize,
}

/// A named, cross-process memory-mapped region with page-granularity view
/// management.
///
/// Callers request views at arbitrary (offset, length); the implementation
/// rounds the offset down to the allocation granularity, maps enough bytes to
/// cover the requested window, and returns a pointer adjusted back to the
/// exact requested offset.  Views are tracked per handle so that concurrent
/// views (including one taken by a reentrant fault on another thread) can be
/// unmapped independently.
pub struct SharedBuffer {
    fd: OwnedFd,
    name: String,
    size: usize,
    granularity: usize,
    // The creator unlinks the name on close; readers only detach.
    owner: bool,
    views: Mutex<HashMap<usize, ViewInfo>>,
}

// Raw view addresses are stored as usize and only dereferenced by the holder
// of the corresponding view pointer; the map itself is lock-protected.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Creates a named region with the fixed transfer ceiling so that
    /// in-crash packing never needs to grow the mapping.
    pub fn create(name: &str) -> Result<Self, TransferError> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| TransferError::CreateFailed(name.to_string(), e))?;
        ftruncate(&fd, MAX_SHARED_MEMORY_SIZE as libc::off_t).map_err(|e| {
            let _ = shm_unlink(name);
            TransferError::ResizeFailed(e)
        })?;
        Ok(Self {
            fd,
            name: name.to_string(),
            size: MAX_SHARED_MEMORY_SIZE,
            granularity: page_size::get(),
            owner: true,
            views: Mutex::new(HashMap::new()),
        })
    }

    /// Attaches to a region created by another process.
    pub fn open(name: &str) -> Result<Self, TransferError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| TransferError::OpenFailed(name.to_string(), e))?;
        // Size from the object itself; the creator may have been built with a
        // different ceiling.
        let file: File = fd.into();
        let size = file.metadata()?.len() as usize;
        Ok(Self {
            fd: file.into(),
            name: name.to_string(),
            size,
            granularity: page_size::get(),
            owner: false,
            views: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Maps a byte window at an arbitrary offset.  The returned pointer
    /// addresses exactly `offset` and stays valid until `unmap_view`.
    pub fn map_view(&self, offset: usize, length: usize) -> Result<*mut u8, TransferError> {
        if length == 0 || offset.checked_add(length).map_or(true, |end| end > self.size) {
            return Err(TransferError::ViewOutOfRange {
                offset,
                length,
                size: self.size,
            });
        }
        let base_offset = offset - offset % self.granularity;
        let diff = offset - base_offset;
        let mapped_len = length + diff;
        // SAFETY: fd is a live shared memory object and [base_offset,
        // base_offset + mapped_len) was checked to lie inside it.
        let base = unsafe {
            mmap(
                None,
                NonZeroUsize::new(mapped_len).expect("mapped_len is nonzero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &self.fd,
                base_offset as libc::off_t,
            )
        }
        .map_err(|source| TransferError::MapFailed {
            offset,
            length,
            source,
        })?;
        let adjusted = base.as_ptr() as usize + diff;
        #[allow(clippy::unwrap_used)]
        self.views.lock().unwrap().insert(
            adjusted,
            ViewInfo {
                base: base.as_ptr() as usize,
                mapped_len,
            },
        );
        Ok(adjusted as *mut u8)
    }

    /// Unmaps a view previously returned by `map_view`.  Unknown pointers are
    /// ignored: a reader walking blocks may hand back the same window twice.
    pub fn unmap_view(&self, ptr: *mut u8) {
        #[allow(clippy::unwrap_used)]
        let view = self.views.lock().unwrap().remove(&(ptr as usize));
        if let Some(view) = view {
            // SAFETY: base/mapped_len came from a successful mmap above and
            // have just been removed from the bookkeeping, so no other holder
            // can unmap them again.
            unsafe {
                let _ = munmap(
                    NonNull::new_unchecked(view.base as *mut libc::c_void),
                    view.mapped_len,
                );
            }
        }
    }

    fn release_all(&mut self) {
        #[allow(clippy::unwrap_used)]
        let views = std::mem::take(&mut *self.views.lock().unwrap());
        for view in views.into_values() {
            // SAFETY: every entry came from a successful mmap.
            unsafe {
                let _ = munmap(
                    NonNull::new_unchecked(view.base as *mut libc::c_void),
                    view.mapped_len,
                );
            }
        }
        if self.owner {
            let _ = shm_unlink(self.name.as_str());
            self.owner = false;
        }
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/crashtrap-test-{tag}-{}", uuid::Uuid::new_v4())
    }

    #[test]
    fn test_create_write_open_read() {
        let name = unique_name("rw");
        let writer = SharedBuffer::create(&name).unwrap();
        assert_eq!(writer.size(), MAX_SHARED_MEMORY_SIZE);

        let view = writer.map_view(0, 16).unwrap();
        // SAFETY: view covers 16 writable bytes.
        unsafe { std::slice::from_raw_parts_mut(view, 16) }.copy_from_slice(b"transfer-buffer!");
        writer.unmap_view(view);

        let reader = SharedBuffer::open(&name).unwrap();
        let view = reader.map_view(0, 16).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(view, 16) }.to_vec();
        reader.unmap_view(view);
        assert_eq!(&bytes, b"transfer-buffer!");
    }

    #[test]
    fn test_unaligned_view_addresses_requested_offset() {
        let name = unique_name("unaligned");
        let buf = SharedBuffer::create(&name).unwrap();
        let page = page_size::get();

        // Write a marker through an aligned view, then read it back through a
        // deliberately unaligned one.
        let offset = page + 13;
        let view = buf.map_view(offset, 4).unwrap();
        unsafe { std::slice::from_raw_parts_mut(view, 4) }.copy_from_slice(b"mark");
        buf.unmap_view(view);

        let wide = buf.map_view(page, 64).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(wide, 64) };
        assert_eq!(&bytes[13..17], b"mark");
        buf.unmap_view(wide);
    }

    #[test]
    fn test_overlapping_views_are_independent() {
        let name = unique_name("overlap");
        let buf = SharedBuffer::create(&name).unwrap();

        let a = buf.map_view(0, 32).unwrap();
        let b = buf.map_view(8, 32).unwrap();
        unsafe { std::slice::from_raw_parts_mut(a, 32) }.fill(0xAB);
        buf.unmap_view(a);
        // b still readable after a is gone.
        let bytes = unsafe { std::slice::from_raw_parts(b, 24) }.to_vec();
        assert!(bytes.iter().all(|&x| x == 0xAB));
        buf.unmap_view(b);
    }

    #[test]
    fn test_unmap_unknown_pointer_is_noop() {
        let name = unique_name("noop");
        let buf = SharedBuffer::create(&name).unwrap();
        buf.unmap_view(0xdead_0000 as *mut u8);
    }

    #[test]
    fn test_out_of_range_view_rejected() {
        let name = unique_name("range");
        let buf = SharedBuffer::create(&name).unwrap();
        assert!(matches!(
            buf.map_view(MAX_SHARED_MEMORY_SIZE - 8, 16),
            Err(TransferError::ViewOutOfRange { .. })
        ));
        assert!(matches!(
            buf.map_view(0, 0),
            Err(TransferError::ViewOutOfRange { .. })
        ));
    }

    #[test]
    fn test_owner_unlinks_on_drop() {
        let name = unique_name("unlink");
        drop(SharedBuffer::create(&name).unwrap());
        assert!(matches!(
            SharedBuffer::open(&name),
            Err(TransferError::OpenFailed(..))
        ));
    }
}
