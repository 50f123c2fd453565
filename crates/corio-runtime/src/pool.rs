//! Global coroutine pool
//!
//! A process-wide pool of pre-built coroutines over fixed-size stacks.
//! The primary arena backs a fixed slot table whose control blocks live
//! for the life of the process and are recycled by flag. When every slot
//! is checked out, overflow arenas supply extra stacks; overflow control
//! blocks are built on demand and dropped again on release, only their
//! stack block is recycled.

use crate::config::PoolConfig;
use crate::coroutine::Coroutine;
use crate::stack::StackArena;

use std::sync::{Arc, Mutex, OnceLock};

use corio_core::error::{CorioError, CorioResult};
use corio_core::{kdebug, kerror};

struct SlotEntry {
    cor: Arc<Coroutine>,
    checked_out: bool,
}

struct PoolInner {
    /// arenas[0] backs the fixed slots; the rest are overflow
    arenas: Vec<StackArena>,
    slots: Vec<SlotEntry>,
}

/// Process-wide coroutine pool.
pub struct CoroutinePool {
    stack_size: usize,
    inner: Mutex<PoolInner>,
}

impl CoroutinePool {
    /// Build a pool of `config.pool_size` coroutines.
    pub fn new(config: &PoolConfig) -> CorioResult<Self> {
        config.validate().map_err(|e| {
            kerror!("pool config rejected: {}", e);
            CorioError::ArenaExhausted
        })?;

        let arena = StackArena::new(config.stack_size, config.pool_size)?;
        let mut slots = Vec::with_capacity(config.pool_size);
        for i in 0..config.pool_size {
            let ptr = arena.alloc()?;
            let cor = Arc::new(Coroutine::new_indexed(ptr, config.stack_size, i as i32));
            slots.push(SlotEntry {
                cor,
                checked_out: false,
            });
        }

        Ok(Self {
            stack_size: config.stack_size,
            inner: Mutex::new(PoolInner {
                arenas: vec![arena],
                slots,
            }),
        })
    }

    /// Check out a coroutine, preferring a recycled fixed slot.
    ///
    /// A slot is reusable once it is released and its entry callback has
    /// returned. With all slots busy, a stack comes from an overflow arena
    /// (growing the arena list when those fill too).
    pub fn acquire(&self) -> CorioResult<Arc<Coroutine>> {
        let mut inner = self.inner.lock().unwrap();

        for entry in inner.slots.iter_mut() {
            if !entry.checked_out && !entry.cor.is_in_entry() {
                entry.checked_out = true;
                return Ok(entry.cor.clone());
            }
        }

        // Fixed table exhausted; carve a stack out of an overflow arena
        for arena in inner.arenas[1..].iter() {
            if let Ok(ptr) = arena.alloc() {
                kdebug!("pool slots busy, using overflow stack");
                return Ok(Arc::new(Coroutine::new(ptr, self.stack_size)));
            }
        }

        let pool_size = inner.slots.len();
        let arena = StackArena::new(self.stack_size, pool_size)?;
        let ptr = arena.alloc()?;
        inner.arenas.push(arena);
        kdebug!("pool grown to {} arenas", inner.arenas.len());
        Ok(Arc::new(Coroutine::new(ptr, self.stack_size)))
    }

    /// Return a coroutine to the pool.
    ///
    /// Fixed-slot coroutines are recycled by clearing the checked-out flag;
    /// overflow coroutines give their stack back to its arena and the
    /// control block is dropped with the caller's last `Arc`.
    pub fn release(&self, cor: &Arc<Coroutine>) {
        if cor.is_scheduler() {
            kerror!("release: scheduler coroutine is not pooled");
            return;
        }
        if cor.is_in_entry() {
            kerror!("release: coroutine {} is still mid entry callback", cor.id());
            return;
        }

        let mut inner = self.inner.lock().unwrap();

        let slot = cor.slot();
        if slot >= 0 {
            let slot = slot as usize;
            if slot >= inner.slots.len() || !Arc::ptr_eq(&inner.slots[slot].cor, cor) {
                kerror!("release: coroutine {} does not belong to this pool", cor.id());
                return;
            }
            inner.slots[slot].checked_out = false;
            return;
        }

        let ptr = cor.stack_ptr();
        for arena in inner.arenas[1..].iter() {
            if arena.contains(ptr) {
                if let Err(e) = arena.free(ptr) {
                    kerror!("release: overflow stack free failed: {}", e);
                }
                return;
            }
        }
        kerror!("release: coroutine {} stack not from any arena", cor.id());
    }

    /// Number of fixed slots currently checked out.
    pub fn slots_in_use(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.iter().filter(|e| e.checked_out).count()
    }
}

static POOL: OnceLock<CoroutinePool> = OnceLock::new();

/// Build the process-wide pool with explicit settings.
///
/// Must run before anything touches [`pool`]; a pool that already exists
/// is left as is and reported.
pub fn init_pool(config: &PoolConfig) -> CorioResult<()> {
    let built = CoroutinePool::new(config)?;
    if POOL.set(built).is_err() {
        kerror!("coroutine pool is already initialized");
    }
    Ok(())
}

/// The process-wide pool, built from [`PoolConfig::default`] on first use.
pub fn pool() -> &'static CoroutinePool {
    POOL.get_or_init(|| {
        CoroutinePool::new(&PoolConfig::default()).expect("coroutine pool init failed")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_pool(n: usize) -> CoroutinePool {
        CoroutinePool::new(&PoolConfig::new().pool_size(n).stack_size(64 * 1024)).unwrap()
    }

    #[test]
    fn test_slot_recycled_after_completion() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        let pool = small_pool(2);

        let first = pool.acquire().unwrap();
        let first_slot = first.slot();
        assert!(first_slot >= 0);
        first.set_callback(|| {
            RUNS.fetch_add(1, Ordering::SeqCst);
        });
        sched::resume(&first);
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);

        pool.release(&first);
        assert_eq!(pool.slots_in_use(), 0);

        // Same slot comes back and runs a fresh callback
        let second = pool.acquire().unwrap();
        assert_eq!(second.slot(), first_slot);
        second.set_callback(|| {
            RUNS.fetch_add(1, Ordering::SeqCst);
        });
        sched::resume(&second);
        assert_eq!(RUNS.load(Ordering::SeqCst), 2);
        pool.release(&second);
    }

    #[test]
    fn test_two_slots_run_to_completion_and_recycle() {
        static STEPS: AtomicUsize = AtomicUsize::new(0);

        let pool = small_pool(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.slots_in_use(), 2);

        for cor in [&a, &b] {
            cor.set_callback(|| {
                STEPS.fetch_add(1, Ordering::SeqCst);
                sched::yield_now();
                STEPS.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Two resumes each: up to the yield, then to completion
        sched::resume(&a);
        sched::resume(&b);
        assert_eq!(STEPS.load(Ordering::SeqCst), 2);
        sched::resume(&a);
        sched::resume(&b);
        assert_eq!(STEPS.load(Ordering::SeqCst), 4);

        pool.release(&a);
        pool.release(&b);

        // A further acquire reuses a fixed slot, no overflow arena appears
        let c = pool.acquire().unwrap();
        assert!(c.slot() >= 0);
        assert!(c.slot() == a.slot() || c.slot() == b.slot());
        pool.release(&c);
    }

    #[test]
    fn test_overflow_when_slots_busy() {
        let pool = small_pool(1);

        let pooled = pool.acquire().unwrap();
        assert!(pooled.slot() >= 0);
        assert_eq!(pool.slots_in_use(), 1);

        let overflow = pool.acquire().unwrap();
        assert_eq!(overflow.slot(), -1);
        assert!(!overflow.stack_ptr().is_null());

        pool.release(&overflow);
        pool.release(&pooled);
        assert_eq!(pool.slots_in_use(), 0);
    }

    #[test]
    fn test_release_rejects_foreign_coroutine() {
        let pool = small_pool(1);
        let mut stack = vec![0u8; 16 * 1024];
        let stray = Arc::new(Coroutine::new(stack.as_mut_ptr(), stack.len()));
        // Logged no-op, must not corrupt pool state
        pool.release(&stray);
        assert_eq!(pool.slots_in_use(), 0);
    }
}
