// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Pooled helper resources: semaphores, transfer mutexes, pinned buffers.
//!
//! Transfers borrow a semaphore and a mutex from the pool instead of
//! allocating their own, and the engines borrow pinned scratch buffers for
//! descriptor staging. Items are lazily created on first miss, recycled on
//! release, and physically destroyed only at teardown.
//!
//! Each kind lives in its own arena with an index-encoded free list and
//! in-use list, guarded by a per-kind lock. An item is on exactly one of
//! the two lists at all times.

use std::sync::{Arc, Mutex};

use scopeguard::guard;

use crate::error::{DmaError, DmaResult};
use crate::mmio::{BufferPinner, PinnedBuffer};
use crate::sync::Semaphore;
use crate::transfer::TransferInner;

/// Pool item kinds, for stats and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Semaphore,
    Mutex,
    Buffer,
}

/// Allocation and occupancy counters for one pool kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Physical resources created over the pool's lifetime.
    pub created: u64,
    /// Items currently on the free list.
    pub free: usize,
    /// Items currently handed out.
    pub in_use: usize,
}

/// A pooled semaphore, re-armed to its requested initial value on reuse.
#[derive(Clone)]
pub struct PooledSem {
    pub(crate) slot: usize,
    pub sem: Arc<Semaphore>,
}

/// A pooled transfer mutex. The mutex owns the transfer's mutable fields;
/// recycling resets them to defaults.
#[derive(Clone)]
pub struct PooledMutex {
    pub(crate) slot: usize,
    pub lock: Arc<Mutex<TransferInner>>,
}

/// A pooled pinned buffer.
#[derive(Clone, Copy)]
pub struct PooledBuffer {
    pub(crate) slot: usize,
    pub buf: PinnedBuffer,
}

// Slot states: Some(item) on the free or in-use list; None once the item
// has been physically destroyed (slot is parked on the vacant list).
struct ArenaSlot<T> {
    item: Option<T>,
    destroyed: bool,
    next: Option<usize>,
}

struct PoolArena<T> {
    slots: Vec<ArenaSlot<T>>,
    free_head: Option<usize>,
    in_use_head: Option<usize>,
    vacant_head: Option<usize>,
    created: u64,
}

impl<T> PoolArena<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            in_use_head: None,
            vacant_head: None,
            created: 0,
        }
    }

    /// Pop a free item (recycling it) or create a new one, and link it
    /// onto the in-use list.
    fn acquire(
        &mut self,
        create: impl FnOnce() -> DmaResult<T>,
        recycle: impl FnOnce(&mut T) -> DmaResult<()>,
    ) -> DmaResult<usize> {
        let slot = if let Some(slot) = self.free_head {
            self.free_head = self.slots[slot].next;
            let item = self.slots[slot]
                .item
                .as_mut()
                .ok_or(DmaError::Exception("free-list slot has no item"))?;
            if let Err(e) = recycle(item) {
                // Recycling failed; park the item back on the free list
                // rather than leaking it off both lists.
                self.slots[slot].next = self.free_head;
                self.free_head = Some(slot);
                return Err(e);
            }
            slot
        } else {
            let item = create()?;
            self.created += 1;
            if let Some(slot) = self.vacant_head {
                self.vacant_head = self.slots[slot].next;
                self.slots[slot].item = Some(item);
                slot
            } else {
                self.slots.push(ArenaSlot {
                    item: Some(item),
                    destroyed: false,
                    next: None,
                });
                self.slots.len() - 1
            }
        };

        self.slots[slot].destroyed = false;
        self.slots[slot].next = self.in_use_head;
        self.in_use_head = Some(slot);
        Ok(slot)
    }

    /// Unlink `slot` from the in-use list and push it onto the free list.
    /// A slot that is not in use was already released; that is a no-op,
    /// not an error.
    fn release(&mut self, slot: usize) {
        if slot >= self.slots.len() || self.slots[slot].item.is_none() {
            return;
        }
        if self.in_use_head == Some(slot) {
            self.in_use_head = self.slots[slot].next;
        } else {
            let mut prev = self.in_use_head;
            while let Some(p) = prev {
                if self.slots[p].next == Some(slot) {
                    break;
                }
                prev = self.slots[p].next;
            }
            match prev {
                Some(p) => self.slots[p].next = self.slots[slot].next,
                // Not in use, already freed
                None => return,
            }
        }

        self.slots[slot].next = self.free_head;
        self.free_head = Some(slot);
    }

    fn mark_destroyed(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            s.destroyed = true;
        }
    }

    /// Tear the arena down. With `free_only`, only free-list items are
    /// destroyed; otherwise in-use items are forcibly reclaimed first.
    /// Returns the destroyed items so kind-specific teardown can run.
    fn drain(&mut self, free_only: bool, kind: PoolKind) -> Vec<T> {
        if !free_only && self.in_use_head.is_some() {
            log::warn!("destroying {kind:?} pool items while marked in-use");
            while let Some(slot) = self.in_use_head {
                self.release(slot);
            }
        }

        let mut drained = Vec::new();
        while let Some(slot) = self.free_head {
            self.free_head = self.slots[slot].next;
            if let Some(item) = self.slots[slot].item.take() {
                drained.push(item);
            }
            self.slots[slot].next = self.vacant_head;
            self.vacant_head = Some(slot);
        }
        drained
    }

    fn count(&self, mut head: Option<usize>) -> usize {
        let mut n = 0;
        while let Some(slot) = head {
            n += 1;
            head = self.slots[slot].next;
        }
        n
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created,
            free: self.count(self.free_head),
            in_use: self.count(self.in_use_head),
        }
    }
}

/// Pool manager for the three helper-resource kinds.
pub struct ResourcePool {
    sems: Mutex<PoolArena<Arc<Semaphore>>>,
    mutexes: Mutex<PoolArena<Arc<Mutex<TransferInner>>>>,
    buffers: Mutex<PoolArena<PinnedBuffer>>,
    pinner: Arc<dyn BufferPinner>,
    buffer_size: usize,
}

impl ResourcePool {
    pub fn new(pinner: Arc<dyn BufferPinner>, buffer_size: usize) -> Self {
        Self {
            sems: Mutex::new(PoolArena::new()),
            mutexes: Mutex::new(PoolArena::new()),
            buffers: Mutex::new(PoolArena::new()),
            pinner,
            buffer_size,
        }
    }

    /// Size of the pinned buffers this pool hands out.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get a semaphore armed to `initial`, recycling a free one if
    /// available.
    pub fn get_semaphore(&self, initial: u32) -> DmaResult<PooledSem> {
        let mut arena = self
            .sems
            .lock()
            .map_err(|_| DmaError::Exception("semaphore pool lock poisoned"))?;
        let slot = arena.acquire(
            || Ok(Arc::new(Semaphore::new(initial))),
            |sem| {
                sem.reinit(initial);
                Ok(())
            },
        )?;
        let sem = arena.slots[slot]
            .item
            .as_ref()
            .map(Arc::clone)
            .ok_or(DmaError::Exception("acquired slot has no item"))?;
        Ok(PooledSem { slot, sem })
    }

    /// Get a transfer mutex with its fields reset to defaults.
    pub fn get_mutex(&self) -> DmaResult<PooledMutex> {
        let mut arena = self
            .mutexes
            .lock()
            .map_err(|_| DmaError::Exception("mutex pool lock poisoned"))?;
        let slot = arena.acquire(
            || Ok(Arc::new(Mutex::new(TransferInner::default()))),
            |lock| match lock.try_lock() {
                Ok(mut inner) => {
                    *inner = TransferInner::default();
                    Ok(())
                }
                Err(_) => {
                    log::error!("mutex on free list still locked");
                    Err(DmaError::Exception("mutex on free list still locked"))
                }
            },
        )?;
        let lock = arena.slots[slot]
            .item
            .as_ref()
            .map(Arc::clone)
            .ok_or(DmaError::Exception("acquired slot has no item"))?;
        Ok(PooledMutex { slot, lock })
    }

    /// Get a pinned buffer, pinning a new one on first miss.
    pub fn get_buffer(&self) -> DmaResult<PooledBuffer> {
        let mut arena = self
            .buffers
            .lock()
            .map_err(|_| DmaError::Exception("buffer pool lock poisoned"))?;
        let pinner = &self.pinner;
        let len = self.buffer_size;
        let slot = arena.acquire(
            || {
                let (virt, wsid) = pinner.prepare_buffer(len)?;
                // If the IOVA lookup fails the buffer must not leak pinned.
                let rollback = guard(wsid, |wsid| {
                    if let Err(e) = pinner.release_buffer(wsid) {
                        log::error!("failed to release pinned buffer: {e}");
                    }
                });
                let iova = pinner.io_address(wsid)?;
                scopeguard::ScopeGuard::into_inner(rollback);
                Ok(PinnedBuffer {
                    virt,
                    iova,
                    wsid,
                    len,
                })
            },
            |_| Ok(()),
        )?;
        let buf = *arena.slots[slot]
            .item
            .as_ref()
            .ok_or(DmaError::Exception("acquired slot has no item"))?;
        Ok(PooledBuffer { slot, buf })
    }

    pub fn release_semaphore(&self, item: &PooledSem) {
        if let Ok(mut arena) = self.sems.lock() {
            arena.release(item.slot);
        }
    }

    pub fn release_mutex(&self, item: &PooledMutex) {
        if let Ok(mut arena) = self.mutexes.lock() {
            arena.release(item.slot);
        }
    }

    pub fn release_buffer(&self, item: &PooledBuffer) {
        if let Ok(mut arena) = self.buffers.lock() {
            arena.release(item.slot);
        }
    }

    /// Mark a transfer mutex destroyed. Consulted by teardown diagnostics;
    /// the slot itself is reclaimed by the normal release path.
    pub fn mark_mutex_destroyed(&self, item: &PooledMutex) {
        if let Ok(mut arena) = self.mutexes.lock() {
            arena.mark_destroyed(item.slot);
        }
    }

    /// Physically destroy pooled resources. With `free_only`, in-use items
    /// survive; otherwise everything is reclaimed with a warning, since
    /// in-use items at teardown indicate a use-after-release in the
    /// caller.
    pub fn destroy_all(&self, free_only: bool) {
        if let Ok(mut arena) = self.sems.lock() {
            arena.drain(free_only, PoolKind::Semaphore);
        }
        if let Ok(mut arena) = self.mutexes.lock() {
            for lock in arena.drain(free_only, PoolKind::Mutex) {
                if lock.try_lock().is_err() {
                    log::error!("destroying a transfer mutex that is still locked");
                }
            }
        }
        if let Ok(mut arena) = self.buffers.lock() {
            for buf in arena.drain(free_only, PoolKind::Buffer) {
                if let Err(e) = self.pinner.release_buffer(buf.wsid) {
                    log::error!("failure releasing pinned buffer: {e}");
                }
            }
        }
    }

    pub fn stats(&self, kind: PoolKind) -> PoolStats {
        match kind {
            PoolKind::Semaphore => self.sems.lock().map(|a| a.stats()).ok(),
            PoolKind::Mutex => self.mutexes.lock().map(|a| a.stats()).ok(),
            PoolKind::Buffer => self.buffers.lock().map(|a| a.stats()).ok(),
        }
        .unwrap_or(PoolStats {
            created: 0,
            free: 0,
            in_use: 0,
        })
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        self.destroy_all(false);
    }
}
