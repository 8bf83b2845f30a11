//! Memory pools: first-fit allocation over a fixed region, with a 64-byte
//! granularity and eager coalescing of freed spans.
//!
//! A pool tracks its region as an ordered list of chunks covering it end to
//! end. The list is empty while the whole region is free; the first
//! allocation materializes it. Addresses are plain `usize` values and are
//! never dereferenced here; whether they mean anything is the creator's
//! business.
use crate::error::{
    AllocatePoolError, CreatePoolError, DeallocatePoolError, DeletePoolError, QueryPoolError,
};
use crate::{Kernel, KernelState, PoolId};

/// Allocation sizes are rounded up to a multiple of this.
pub const ALLOC_QUANTUM: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Chunk {
    base: usize,
    size: usize,
    free: bool,
}

#[derive(Debug)]
pub(crate) struct PoolCb {
    pub(crate) id: PoolId,
    base: usize,
    size: usize,
    chunks: Vec<Chunk>,
}

impl PoolCb {
    pub(crate) fn new(id: PoolId, base: usize, size: usize) -> Self {
        Self {
            id,
            base,
            size,
            chunks: Vec::new(),
        }
    }

    /// Allocates `size` bytes (rounded up to the quantum) from the first
    /// free chunk that fits. Returns the span's base address.
    pub(crate) fn allocate(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size > 0);
        let size = round_up(size)?;
        if size > self.size {
            return None;
        }

        if self.chunks.is_empty() {
            self.chunks.push(Chunk {
                base: self.base,
                size,
                free: false,
            });
            if size < self.size {
                self.chunks.push(Chunk {
                    base: self.base + size,
                    size: self.size - size,
                    free: true,
                });
            }
            return Some(self.base);
        }

        for i in 0..self.chunks.len() {
            if self.chunks[i].free && self.chunks[i].size >= size {
                let base = self.chunks[i].base;
                self.chunks[i].base += size;
                self.chunks[i].size -= size;
                if self.chunks[i].size == 0 {
                    self.chunks.remove(i);
                }
                self.chunks.insert(
                    i,
                    Chunk {
                        base,
                        size,
                        free: false,
                    },
                );
                return Some(base);
            }
        }
        None
    }

    /// Frees the allocated chunk whose base is exactly `addr`, merging it
    /// with free neighbors. Returns `false` if there is no such chunk.
    pub(crate) fn deallocate(&mut self, addr: usize) -> bool {
        let i = match self.chunks.iter().position(|c| c.base == addr && !c.free) {
            Some(i) => i,
            None => return false,
        };
        self.chunks[i].free = true;

        if i + 1 < self.chunks.len() && self.chunks[i + 1].free {
            self.chunks[i].size += self.chunks[i + 1].size;
            self.chunks.remove(i + 1);
        }
        if i > 0 && self.chunks[i - 1].free {
            self.chunks[i - 1].size += self.chunks[i].size;
            self.chunks.remove(i);
        }
        if self.chunks.len() == 1 && self.chunks[0].free {
            self.chunks.clear();
        }
        true
    }

    pub(crate) fn bytes_free(&self) -> usize {
        if self.chunks.is_empty() {
            self.size
        } else {
            self.chunks.iter().filter(|c| c.free).map(|c| c.size).sum()
        }
    }

    pub(crate) fn in_use(&self) -> bool {
        !self.chunks.is_empty()
    }

    #[cfg(test)]
    fn invariants_hold(&self) -> bool {
        if self.chunks.is_empty() {
            return true;
        }
        let mut expected = self.base;
        for (i, c) in self.chunks.iter().enumerate() {
            if c.base != expected || c.size == 0 {
                return false;
            }
            if i > 0 && self.chunks[i - 1].free && c.free {
                return false;
            }
            expected += c.size;
        }
        expected == self.base + self.size
    }
}

fn round_up(size: usize) -> Option<usize> {
    let r = size.checked_add(ALLOC_QUANTUM - 1)?;
    Some(r - r % ALLOC_QUANTUM)
}

impl KernelState {
    pub(crate) fn pool(&self, id: PoolId) -> Option<&PoolCb> {
        self.pools.iter().find(|p| p.id == id)
    }

    pub(crate) fn pool_mut(&mut self, id: PoolId) -> Option<&mut PoolCb> {
        self.pools.iter_mut().find(|p| p.id == id)
    }
}

impl Kernel {
    /// Creates a memory pool over `[base, base + size)`. The region is the
    /// caller's to provide; the pool only does the bookkeeping.
    pub fn pool_create(&self, base: usize, size: usize) -> Result<PoolId, CreatePoolError> {
        let _mask = self.mask();
        if base == 0 || size == 0 {
            return Err(CreatePoolError::InvalidParameter);
        }
        let mut st = self.shared.state.lock();
        let id = st.next_pool_id;
        st.next_pool_id += 1;
        st.pools.push(PoolCb::new(id, base, size));
        log::trace!("pool_create: id {} covers {:#x}+{}", id, base, size);
        Ok(id)
    }

    /// Deletes a pool. Fails while any allocation is outstanding. Pool ids
    /// are never reused.
    pub fn pool_delete(&self, pool: PoolId) -> Result<(), DeletePoolError> {
        let _mask = self.mask();
        let mut st = self.shared.state.lock();
        let i = st
            .pools
            .iter()
            .position(|p| p.id == pool)
            .ok_or(DeletePoolError::InvalidParameter)?;
        if st.pools[i].in_use() {
            return Err(DeletePoolError::InvalidState);
        }
        st.pools.remove(i);
        log::trace!("pool_delete: id {}", pool);
        Ok(())
    }

    /// Allocates `size` bytes (rounded up to [`ALLOC_QUANTUM`]) and returns
    /// the span's base address.
    pub fn pool_allocate(&self, pool: PoolId, size: usize) -> Result<usize, AllocatePoolError> {
        let _mask = self.mask();
        if size == 0 {
            return Err(AllocatePoolError::InvalidParameter);
        }
        let mut st = self.shared.state.lock();
        let cb = st
            .pool_mut(pool)
            .ok_or(AllocatePoolError::InvalidParameter)?;
        cb.allocate(size)
            .ok_or(AllocatePoolError::InsufficientResources)
    }

    /// Returns `addr`'s span to its pool. `addr` must be the exact base of
    /// an outstanding allocation.
    pub fn pool_deallocate(&self, pool: PoolId, addr: usize) -> Result<(), DeallocatePoolError> {
        let _mask = self.mask();
        if addr == 0 {
            return Err(DeallocatePoolError::InvalidParameter);
        }
        let mut st = self.shared.state.lock();
        let cb = st
            .pool_mut(pool)
            .ok_or(DeallocatePoolError::InvalidParameter)?;
        if cb.deallocate(addr) {
            Ok(())
        } else {
            Err(DeallocatePoolError::InvalidParameter)
        }
    }

    /// The number of bytes left unallocated in the pool.
    pub fn pool_query(&self, pool: PoolId) -> Result<usize, QueryPoolError> {
        let _mask = self.mask();
        let st = self.shared.state.lock();
        let cb = st.pool(pool).ok_or(QueryPoolError::InvalidParameter)?;
        Ok(cb.bytes_free())
    }
}
