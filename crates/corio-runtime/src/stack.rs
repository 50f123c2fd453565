//! Fixed-block stack arena backed by a single anonymous mmap
//!
//! One arena carves a contiguous mapping into equally sized stack blocks
//! and tracks occupancy in a bitmap. Allocation scans for the first clear
//! bit; freeing validates the pointer is block-aligned and inside the
//! mapping before clearing its bit. One lock covers both paths so a free
//! racing an allocation scan is ordered, never lost.

use std::sync::Mutex;

use corio_core::error::{CorioError, CorioResult};
use corio_core::kerror;

/// A contiguous run of fixed-size coroutine stacks.
pub struct StackArena {
    base: *mut u8,
    block_size: usize,
    block_count: usize,
    bitmap: Mutex<Box<[u64]>>,
}

// The raw base pointer is only dereferenced by the coroutine that owns a
// block; arena bookkeeping itself is fully behind the mutex.
unsafe impl Send for StackArena {}
unsafe impl Sync for StackArena {}

impl StackArena {
    /// Map a new arena of `block_count` stacks of `block_size` bytes each.
    pub fn new(block_size: usize, block_count: usize) -> CorioResult<Self> {
        assert!(block_size > 0 && block_count > 0);
        let total = block_size
            .checked_mul(block_count)
            .ok_or(CorioError::ArenaExhausted)?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            kerror!("stack arena mmap of {} bytes failed", total);
            return Err(CorioError::last_os());
        }

        let words = block_count.div_ceil(64);
        Ok(Self {
            base: base as *mut u8,
            block_size,
            block_count,
            bitmap: Mutex::new(vec![0u64; words].into_boxed_slice()),
        })
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// True if `ptr` lies anywhere inside this arena's mapping.
    #[inline]
    pub fn contains(&self, ptr: *mut u8) -> bool {
        let addr = ptr as usize;
        let base = self.base as usize;
        addr >= base && addr < base + self.block_size * self.block_count
    }

    /// Claim the first free block, returning its base pointer.
    pub fn alloc(&self) -> CorioResult<*mut u8> {
        let mut bitmap = self.bitmap.lock().unwrap();
        for (wi, word) in bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let idx = wi * 64 + bit;
            if idx >= self.block_count {
                break;
            }
            *word |= 1u64 << bit;
            return Ok(unsafe { self.base.add(idx * self.block_size) });
        }
        Err(CorioError::ArenaExhausted)
    }

    /// Return a block to the arena.
    ///
    /// `ptr` must be a value previously returned by [`alloc`](Self::alloc);
    /// anything misaligned, outside the mapping, or already free is
    /// rejected with `InvalidStackPointer`.
    pub fn free(&self, ptr: *mut u8) -> CorioResult<()> {
        let offset = (ptr as usize).wrapping_sub(self.base as usize);
        if offset % self.block_size != 0 || offset / self.block_size >= self.block_count {
            kerror!("stack free of pointer {:p} not from this arena", ptr);
            return Err(CorioError::InvalidStackPointer);
        }
        let idx = offset / self.block_size;

        let mut bitmap = self.bitmap.lock().unwrap();
        let mask = 1u64 << (idx % 64);
        if bitmap[idx / 64] & mask == 0 {
            kerror!("stack free of block {} which is not allocated", idx);
            return Err(CorioError::InvalidStackPointer);
        }
        bitmap[idx / 64] &= !mask;
        Ok(())
    }

    /// Number of blocks currently handed out.
    pub fn in_use(&self) -> usize {
        let bitmap = self.bitmap.lock().unwrap();
        bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl Drop for StackArena {
    fn drop(&mut self) {
        let total = self.block_size * self.block_count;
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_reuse() {
        let arena = StackArena::new(4096, 4).unwrap();
        let a = arena.alloc().unwrap();
        let b = arena.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(arena.in_use(), 2);

        arena.free(a).unwrap();
        // First-fit: the freed block is handed out again
        let c = arena.alloc().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_exhaustion() {
        let arena = StackArena::new(4096, 2);
        let arena = arena.unwrap();
        arena.alloc().unwrap();
        arena.alloc().unwrap();
        assert!(matches!(arena.alloc(), Err(CorioError::ArenaExhausted)));
    }

    #[test]
    fn test_free_rejects_foreign_and_misaligned() {
        let arena = StackArena::new(4096, 2).unwrap();
        let a = arena.alloc().unwrap();

        let mut local = 0u8;
        assert!(matches!(
            arena.free(&mut local as *mut u8),
            Err(CorioError::InvalidStackPointer)
        ));
        assert!(matches!(
            arena.free(unsafe { a.add(1) }),
            Err(CorioError::InvalidStackPointer)
        ));

        // Double free is rejected too
        arena.free(a).unwrap();
        assert!(matches!(arena.free(a), Err(CorioError::InvalidStackPointer)));
    }

    #[test]
    fn test_blocks_are_writable() {
        let arena = StackArena::new(4096, 1).unwrap();
        let p = arena.alloc().unwrap();
        unsafe {
            p.write(0xAB);
            p.add(4095).write(0xCD);
            assert_eq!(p.read(), 0xAB);
        }
        arena.free(p).unwrap();
    }
}
