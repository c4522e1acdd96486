//! Anonymous shared-memory mappings.
//!
//! All cross-stage state (rings, packet pool, key cells, counters) is
//! allocated by the parent before any worker is forked, so every child
//! inherits the mappings at the same virtual addresses. A stage that has
//! no business with a given region unmaps it right after the fork; the
//! confinement mirrors the privilege-separation model, where a process
//! simply does not hold a reference to what it must not touch.

use std::marker::PhantomData;
use std::ptr::NonNull;

use anyhow::{bail, Result};

/// A typed handle to a `MAP_SHARED | MAP_ANONYMOUS` region.
///
/// The handle is `Copy` so the parent can hand the same region to every
/// child; each process tracks its own attachment and detaches
/// independently. The region is created zero-filled, which is a valid
/// initial state for every type we place in one.
pub struct Shared<T> {
    ptr: NonNull<T>,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Shared<T> {}

unsafe impl<T: Sync> Send for Shared<T> {}
unsafe impl<T: Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    /// Map a new zero-filled shared region large enough for a `T`.
    pub fn create() -> Result<Shared<T>> {
        let len = std::mem::size_of::<T>();

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            bail!(
                "mmap of {} shared bytes failed: {}",
                len,
                std::io::Error::last_os_error()
            );
        }

        Ok(Shared {
            ptr: NonNull::new(ptr as *mut T).expect("mmap returned null"),
            len,
            _marker: PhantomData,
        })
    }

    /// Shared view of the region. `T` is expected to synchronise its own
    /// interior mutability (atomics, or single-writer discipline).
    pub fn get(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }

    /// Exclusive view, for in-place initialisation before any worker has
    /// been forked.
    ///
    /// # Safety
    ///
    /// The caller must be the only process with the mapping attached, or
    /// must otherwise guarantee no concurrent access.
    pub unsafe fn get_mut(&mut self) -> &mut T {
        self.ptr.as_mut()
    }

    /// Unmap the region from this process. Other processes keep their
    /// attachment; the kernel frees the memory once the last one is gone.
    pub fn detach(self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if ret == -1 {
            crate::fatal!(
                "munmap of shared region failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn mapping_is_zeroed_and_writable() {
        let shared = Shared::<AtomicU64>::create().unwrap();
        assert_eq!(shared.get().load(Ordering::SeqCst), 0);
        shared.get().store(42, Ordering::SeqCst);
        assert_eq!(shared.get().load(Ordering::SeqCst), 42);
        shared.detach();
    }

    #[test]
    fn copies_alias_the_same_region() {
        let shared = Shared::<AtomicU64>::create().unwrap();
        let alias = shared;
        alias.get().store(7, Ordering::SeqCst);
        assert_eq!(shared.get().load(Ordering::SeqCst), 7);
        shared.detach();
    }
}
