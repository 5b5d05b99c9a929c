// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! DMA transfer objects.
//!
//! A [`DmaTransfer`] describes one DMA operation. Its mutable fields live
//! behind a mutex borrowed from the resource pool; a pooled binary
//! semaphore enforces that at most one use of the object is in flight at a
//! time (`wait` claims, `post` releases). Both are returned to the pool
//! when the transfer is destroyed.

use std::sync::Arc;

use crate::error::{DmaError, DmaResult};
use crate::pool::{PooledBuffer, PooledMutex, PooledSem, ResourcePool};

/// Semaphore value while no use of the transfer is in flight.
pub(crate) const TRANSFER_NOT_IN_PROGRESS: u32 = 1;

/// Direction of a DMA transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// Host memory to AFU stream (TX).
    HostMmToFpgaSt,
    /// AFU stream to host memory (RX).
    FpgaStToHostMm,
    /// Local memory to AFU stream. Not supported in the current version.
    FpgaMmToFpgaSt,
    /// AFU stream to local memory. Not supported in the current version.
    FpgaStToFpgaMm,
    /// Host memory to FPGA local memory.
    HostToFpgaMm,
    /// FPGA local memory to host memory.
    FpgaToHostMm,
    /// FPGA local memory to FPGA local memory.
    FpgaToFpgaMm,
}

/// TX control: optional in-band SOP/EOP generation on the outgoing stream.
/// Only meaningful for host-to-stream transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxControl {
    /// Deterministic-length transfer, no packet markers.
    NoPacket,
    GenerateSop,
    GenerateEop,
    GenerateSopAndEop,
}

/// RX control: how the receive side bounds a transfer. With
/// [`RxControl::EndOnEop`] the transfer ends at the in-band EOP or after
/// `len` bytes, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxControl {
    /// Deterministic-length transfer.
    NoPacket,
    EndOnEop,
}

/// Kind of DMA channel, discovered from the interface UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Memory-to-stream (TX streaming).
    TxSt,
    /// Stream-to-memory (RX streaming).
    RxSt,
    /// Memory-to-memory.
    Mm,
}

/// Completion snapshot passed to transfer callbacks.
#[derive(Debug, Clone, Copy)]
pub struct TransferStatus {
    pub bytes_transferred: u64,
    pub eop_arrived: bool,
}

/// Callback invoked from the completion thread when an asynchronous
/// transfer finishes.
pub type TransferCallback = Box<dyn FnMut(TransferStatus) + Send>;

/// Mutable transfer state, guarded by the pooled transfer mutex.
pub struct TransferInner {
    pub src: u64,
    pub dst: u64,
    pub len: u64,
    pub transfer_type: TransferType,
    pub tx_ctrl: TxControl,
    pub rx_ctrl: RxControl,
    pub callback: Option<TransferCallback>,
    pub bytes_transferred: u64,
    pub eop_arrived: bool,
    /// Small-transfer buffers attached to this object; released back to
    /// the pool on destroy.
    pub attached: Vec<PooledBuffer>,
}

impl Default for TransferInner {
    fn default() -> Self {
        Self {
            src: 0,
            dst: 0,
            len: 0,
            transfer_type: TransferType::HostMmToFpgaSt,
            tx_ctrl: TxControl::NoPacket,
            rx_ctrl: RxControl::NoPacket,
            callback: None,
            bytes_transferred: 0,
            eop_arrived: false,
            attached: Vec::new(),
        }
    }
}

impl TransferInner {
    /// Reset request fields to defaults. Attached buffers stay attached.
    fn reset(&mut self) {
        self.src = 0;
        self.dst = 0;
        self.len = 0;
        self.transfer_type = TransferType::HostMmToFpgaSt;
        self.tx_ctrl = TxControl::NoPacket;
        self.rx_ctrl = RxControl::NoPacket;
        self.callback = None;
        self.bytes_transferred = 0;
        self.eop_arrived = false;
    }
}

/// One DMA operation, reusable across starts.
pub struct DmaTransfer {
    pub(crate) inner: PooledMutex,
    pub(crate) status_sem: PooledSem,
    ch_type: ChannelType,
}

impl DmaTransfer {
    /// Claim a mutex and semaphore from the pool and build a transfer with
    /// default attributes. Called through the channel's `transfer_init`.
    pub(crate) fn new(pool: &ResourcePool, ch_type: ChannelType) -> DmaResult<Self> {
        let inner = pool.get_mutex()?;
        let status_sem = match pool.get_semaphore(TRANSFER_NOT_IN_PROGRESS) {
            Ok(sem) => sem,
            Err(e) => {
                pool.release_mutex(&inner);
                return Err(e);
            }
        };
        Ok(Self {
            inner,
            status_sem,
            ch_type,
        })
    }

    /// The channel type this transfer was initialized on.
    pub fn channel_type(&self) -> ChannelType {
        self.ch_type
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut TransferInner) -> R) -> DmaResult<R> {
        let mut inner = self
            .inner
            .lock
            .lock()
            .map_err(|_| DmaError::Exception("transfer mutex poisoned"))?;
        Ok(f(&mut inner))
    }

    pub fn set_src(&self, src: u64) -> DmaResult<()> {
        self.with_inner(|t| t.src = src)
    }

    pub fn set_dst(&self, dst: u64) -> DmaResult<()> {
        self.with_inner(|t| t.dst = dst)
    }

    pub fn set_len(&self, len: u64) -> DmaResult<()> {
        self.with_inner(|t| t.len = len)
    }

    /// Set the transfer direction. Local-memory streaming directions are
    /// rejected before the lock is taken.
    pub fn set_transfer_type(&self, ty: TransferType) -> DmaResult<()> {
        if matches!(
            ty,
            TransferType::FpgaMmToFpgaSt | TransferType::FpgaStToFpgaMm
        ) {
            log::error!("transfer type {ty:?} unsupported");
            return Err(DmaError::NotSupported("local-memory streaming transfer"));
        }
        self.with_inner(|t| t.transfer_type = ty)
    }

    pub fn set_tx_control(&self, tx_ctrl: TxControl) -> DmaResult<()> {
        self.with_inner(|t| t.tx_ctrl = tx_ctrl)
    }

    pub fn set_rx_control(&self, rx_ctrl: RxControl) -> DmaResult<()> {
        self.with_inner(|t| t.rx_ctrl = rx_ctrl)
    }

    /// Register a completion callback. A transfer with a callback starts
    /// asynchronously; without one, `start` blocks until completion.
    pub fn set_callback(&self, cb: Option<TransferCallback>) -> DmaResult<()> {
        self.with_inner(|t| t.callback = cb)
    }

    /// Bytes moved so far. For an in-flight transfer this is a progress
    /// snapshot; after completion it is the final count.
    pub fn bytes_transferred(&self) -> DmaResult<u64> {
        self.with_inner(|t| t.bytes_transferred)
    }

    /// Whether the hardware signaled end-of-packet during the most recent
    /// use of this transfer.
    pub fn eop_arrived(&self) -> DmaResult<bool> {
        self.with_inner(|t| t.eop_arrived)
    }

    /// Reset request fields to their defaults, keeping the pooled mutex,
    /// semaphore, and any attached buffers.
    pub fn reset(&self) -> DmaResult<()> {
        self.with_inner(|t| t.reset())
    }

    /// Host virtual address and size of the first attached small-transfer
    /// buffer, if any.
    pub fn small_buffer(&self) -> DmaResult<Option<(*mut u8, usize)>> {
        self.with_inner(|t| t.attached.first().map(|b| (b.buf.virt, b.buf.len)))
    }

    pub(crate) fn snapshot(&self) -> DmaResult<TransferStatus> {
        self.with_inner(|t| TransferStatus {
            bytes_transferred: t.bytes_transferred,
            eop_arrived: t.eop_arrived,
        })
    }

    pub(crate) fn add_bytes_transferred(&self, n: u64) -> DmaResult<()> {
        self.with_inner(|t| t.bytes_transferred += n)
    }

    pub(crate) fn set_eop_arrived(&self) -> DmaResult<()> {
        self.with_inner(|t| t.eop_arrived = true)
    }

    pub(crate) fn clear_progress(&self) -> DmaResult<()> {
        self.with_inner(|t| {
            t.bytes_transferred = 0;
            t.eop_arrived = false;
        })
    }

    /// Tear the transfer down: release attached buffers, mark the mutex
    /// destroyed, and return the mutex and semaphore to the pool.
    ///
    /// A transfer that is still in flight cannot be destroyed; that
    /// returns `Busy`.
    pub(crate) fn destroy(self: Arc<Self>, pool: &ResourcePool) -> DmaResult<()> {
        if !self.status_sem.sem.try_wait()? {
            log::error!("attempt to destroy an in-flight transfer");
            return Err(DmaError::Busy("transfer in flight"));
        }

        self.with_inner(|t| {
            for buf in t.attached.drain(..) {
                pool.release_buffer(&buf);
            }
            t.callback = None;
        })?;

        pool.mark_mutex_destroyed(&self.inner);
        pool.release_mutex(&self.inner);
        pool.release_semaphore(&self.status_sem);
        Ok(())
    }
}
