// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Register access and platform capabilities.
//!
//! The engines never touch device memory directly; they go through
//! [`RegisterAccess`], selected at construction time. Two implementations
//! exist: [`MappedMmio`] for a directly mapped BAR, and
//! [`SimDevice`](crate::sim::SimDevice), a software model of the DMA BBB
//! used in place of the hardware transport.
//!
//! Buffer pinning (prepare / IOVA lookup / release) is the second platform
//! capability; the buffer pool consumes it through [`BufferPinner`].

use crate::error::{DmaError, DmaResult};
use crate::regs::{self, CsrStatus, MsgdmaExtDescriptor};

/// Spin budget while waiting for the descriptor buffer to drain.
const DESC_FULL_SPIN_ITERATIONS: u32 = 10_000_000;

/// Raw 32/64-bit register access to a device's MMIO region.
///
/// Offsets are byte offsets from the start of the region. Implementations
/// must tolerate concurrent calls from multiple worker threads; the mSGDMA
/// register ports are designed for single-writer-per-channel use, which the
/// driver guarantees by giving each channel to exactly one worker.
pub trait RegisterAccess: Send + Sync {
    fn read32(&self, offset: u64) -> DmaResult<u32>;
    fn write32(&self, offset: u64, value: u32) -> DmaResult<()>;
    fn read64(&self, offset: u64) -> DmaResult<u64>;
    fn write64(&self, offset: u64, value: u64) -> DmaResult<()>;

    /// Read a contiguous span as repeated 32-bit register accesses.
    fn read32_blk(&self, offset: u64, out: &mut [u32]) -> DmaResult<()> {
        for (i, word) in out.iter_mut().enumerate() {
            *word = self.read32(offset + (i as u64) * 4)?;
        }
        Ok(())
    }

    /// Write a contiguous span as repeated 32-bit register accesses.
    fn write32_blk(&self, offset: u64, values: &[u32]) -> DmaResult<()> {
        for (i, word) in values.iter().enumerate() {
            self.write32(offset + (i as u64) * 4, *word)?;
        }
        Ok(())
    }
}

/// Push one extended descriptor into a channel's dispatcher.
///
/// Waits for the descriptor FIFO to have room, then writes the 32-byte
/// descriptor to the descriptor slave port. The control word goes last;
/// its GO bit dispatches the descriptor.
pub fn send_descriptor(
    regs_access: &dyn RegisterAccess,
    csr_base: u64,
    desc_base: u64,
    desc: &MsgdmaExtDescriptor,
) -> DmaResult<()> {
    let mut spins = 0u32;
    loop {
        let status = CsrStatus::from_bits_retain(self::read_csr_status(regs_access, csr_base)?);
        if !status.contains(CsrStatus::DESC_BUF_FULL) {
            break;
        }
        spins += 1;
        if spins >= DESC_FULL_SPIN_ITERATIONS {
            log::error!("descriptor buffer stuck full");
            return Err(DmaError::Exception("descriptor buffer stuck full"));
        }
        std::hint::spin_loop();
    }

    regs_access.write32_blk(desc_base, &desc.as_words())
}

#[inline]
fn read_csr_status(regs_access: &dyn RegisterAccess, csr_base: u64) -> DmaResult<u32> {
    regs_access.read32(csr_base + regs::csr::STATUS)
}

// ---------------------------------------------------------------------------
// Direct-mapped MMIO
// ---------------------------------------------------------------------------

/// Register access over a directly mapped MMIO region (e.g. a BAR obtained
/// from `fpgaMapMMIO`). All accesses are volatile.
pub struct MappedMmio {
    base: *mut u8,
    len: usize,
}

// SAFETY: MappedMmio may be shared between worker threads because:
// - The mapping is valid for the lifetime of the struct
// - All accesses are volatile single-word loads/stores
// - Channel register ranges are disjoint and owned by one worker each
unsafe impl Send for MappedMmio {}
unsafe impl Sync for MappedMmio {}

impl MappedMmio {
    /// Wrap an existing MMIO mapping.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapping of at least `len` bytes that stays
    /// valid for the lifetime of the returned value.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    fn check(&self, offset: u64, width: usize) -> DmaResult<()> {
        if offset as usize + width > self.len {
            return Err(DmaError::InvalidParam("MMIO offset out of range"));
        }
        if offset % width as u64 != 0 {
            return Err(DmaError::InvalidParam("misaligned MMIO access"));
        }
        Ok(())
    }
}

impl RegisterAccess for MappedMmio {
    fn read32(&self, offset: u64) -> DmaResult<u32> {
        self.check(offset, 4)?;
        // SAFETY: bounds and alignment checked above; mapping valid per
        // the `new` contract.
        Ok(unsafe { std::ptr::read_volatile(self.base.add(offset as usize) as *const u32) })
    }

    fn write32(&self, offset: u64, value: u32) -> DmaResult<()> {
        self.check(offset, 4)?;
        // SAFETY: as in read32.
        unsafe { std::ptr::write_volatile(self.base.add(offset as usize) as *mut u32, value) };
        Ok(())
    }

    fn read64(&self, offset: u64) -> DmaResult<u64> {
        self.check(offset, 8)?;
        // SAFETY: as in read32.
        Ok(unsafe { std::ptr::read_volatile(self.base.add(offset as usize) as *const u64) })
    }

    fn write64(&self, offset: u64, value: u64) -> DmaResult<()> {
        self.check(offset, 8)?;
        // SAFETY: as in read32.
        unsafe { std::ptr::write_volatile(self.base.add(offset as usize) as *mut u64, value) };
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Buffer pinning
// ---------------------------------------------------------------------------

/// A pinned, device-visible host buffer.
#[derive(Debug, Clone, Copy)]
pub struct PinnedBuffer {
    /// Host virtual address.
    pub virt: *mut u8,
    /// Address the DMA masters use to reach this buffer.
    pub iova: u64,
    /// Opaque workspace id used to release the buffer.
    pub wsid: u64,
    /// Size in bytes.
    pub len: usize,
}

// SAFETY: PinnedBuffer is a plain descriptor of a pinned region; the
// region itself outlives every copy (released only through the pool).
unsafe impl Send for PinnedBuffer {}
unsafe impl Sync for PinnedBuffer {}

/// Pin host memory and translate it for device access.
///
/// Mirrors the prepare / IOVA-lookup / release split of the platform API so
/// the buffer pool can roll back a prepared buffer whose translation fails.
pub trait BufferPinner: Send + Sync {
    /// Pin `len` bytes and return the host mapping plus a workspace id.
    fn prepare_buffer(&self, len: usize) -> DmaResult<(*mut u8, u64)>;

    /// Look up the device-visible address of a prepared buffer.
    fn io_address(&self, wsid: u64) -> DmaResult<u64>;

    /// Unpin and release a prepared buffer.
    fn release_buffer(&self, wsid: u64) -> DmaResult<()>;
}

/// The full platform surface the driver consumes: register access plus
/// buffer pinning.
pub trait FpgaPlatform: RegisterAccess + BufferPinner {}

impl<T: RegisterAccess + BufferPinner> FpgaPlatform for T {}

// ---------------------------------------------------------------------------
// Interrupt wait
// ---------------------------------------------------------------------------

/// A completion interrupt source backed by an eventfd, as delivered by the
/// FPGA interrupt plumbing. Channels without one run in polling mode and
/// spin on the response fill level instead.
#[cfg(target_os = "linux")]
pub struct InterruptEvent {
    fd: std::os::raw::c_int,
}

#[cfg(target_os = "linux")]
impl InterruptEvent {
    /// Create a fresh eventfd-backed interrupt source.
    pub fn new() -> DmaResult<Self> {
        // SAFETY: eventfd takes no pointers; a negative return is an error.
        let fd = unsafe { libc::eventfd(0, 0) };
        if fd < 0 {
            return Err(DmaError::Io(std::io::Error::last_os_error()));
        }
        Ok(Self { fd })
    }

    /// Raw file descriptor, for registering with the event plumbing.
    pub fn as_raw_fd(&self) -> std::os::raw::c_int {
        self.fd
    }

    /// Block until the interrupt fires, draining the counter.
    pub fn wait(&self, timeout_ms: i32) -> DmaResult<()> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd for the lifetime of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            return Err(DmaError::Io(std::io::Error::last_os_error()));
        }
        if rc == 0 {
            log::error!("interrupt poll timeout");
            return Err(DmaError::Exception("interrupt poll timeout"));
        }
        let mut count: u64 = 0;
        // SAFETY: reading 8 bytes into a valid u64, the eventfd contract.
        let n = unsafe {
            libc::read(
                self.fd,
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            return Err(DmaError::Exception("eventfd read failed"));
        }
        Ok(())
    }

    /// Fire the interrupt (test plumbing; hardware writes the eventfd
    /// through the kernel driver).
    pub fn notify(&self) -> DmaResult<()> {
        let count: u64 = 1;
        // SAFETY: writing 8 bytes from a valid u64, the eventfd contract.
        let n = unsafe {
            libc::write(
                self.fd,
                &count as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            return Err(DmaError::Exception("eventfd write failed"));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl Drop for InterruptEvent {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this struct and closed exactly once.
        unsafe { libc::close(self.fd) };
    }
}
