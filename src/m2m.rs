// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Memory-to-memory descriptor engine.
//!
//! Host↔device transfers bounce through pooled pinned buffers; device↔
//! device transfers run directly. Read-backs are fenced with the "magic
//! number" handshake: a final descriptor copies a known value from the
//! write-fence ROM into a pinned magic buffer, and its arrival proves all
//! prior writes have landed.
//!
//! All addresses and lengths must be 64-byte aligned; the MMIO fallback
//! for unaligned edges is intentionally not part of this engine.

use std::sync::Arc;

use scopeguard::guard;

use crate::channel::{ChannelHw, DmaOptions};
use crate::error::{DmaError, DmaResult};
use crate::mmio::{BufferPinner, PinnedBuffer};
use crate::pool::ResourcePool;
use crate::regs::{
    DescControl, MsgdmaExtDescriptor, DMA_ALIGN_BYTES, DMA_MAX_BUF, HOST_MEM_MASK, WF_HOST_MASK,
    WF_MAGIC, WF_ROM_MAGIC_ADDR,
};
use crate::transfer::{DmaTransfer, TransferType};

/// Spin budget while waiting for the magic number to land.
const MAGIC_SPIN_ITERATIONS: u32 = 100_000_000;

/// Host addresses are 4-cacheline (256 B) burst aligned when possible.
const BURST_ALIGN: u64 = 4 * DMA_ALIGN_BYTES;

pub(crate) struct M2mEngine {
    hw: Arc<ChannelHw>,
    pool: Arc<ResourcePool>,
    opts: DmaOptions,
    pinner: Arc<dyn BufferPinner>,
    /// Pinned landing zone for the write-fence magic value.
    magic: PinnedBuffer,
}

impl M2mEngine {
    pub(crate) fn new(
        hw: Arc<ChannelHw>,
        pool: Arc<ResourcePool>,
        opts: DmaOptions,
        pinner: Arc<dyn BufferPinner>,
    ) -> DmaResult<Self> {
        let (virt, wsid) = pinner.prepare_buffer(DMA_ALIGN_BYTES as usize)?;
        let rollback = guard(wsid, |wsid| {
            if let Err(e) = pinner.release_buffer(wsid) {
                log::error!("failed to release magic buffer: {e}");
            }
        });
        let iova = pinner.io_address(wsid)?;
        scopeguard::ScopeGuard::into_inner(rollback);

        Ok(Self {
            hw,
            pool,
            opts,
            magic: PinnedBuffer {
                virt,
                iova,
                wsid,
                len: DMA_ALIGN_BYTES as usize,
            },
            pinner,
        })
    }

    /// Issue descriptors for one bounce-buffer-sized transaction, split to
    /// respect the host burst alignment (CCI-P restriction): an optional
    /// short lead-in up to a 4-cacheline boundary, a burst-of-4 body, and
    /// a short tail.
    fn do_dma(
        &self,
        mut dst: u64,
        mut src: u64,
        mut count: u64,
        is_last_desc: bool,
        ty: TransferType,
        intr_en: bool,
    ) -> DmaResult<()> {
        if dst % DMA_ALIGN_BYTES != 0 || src % DMA_ALIGN_BYTES != 0 || count % DMA_ALIGN_BYTES != 0
        {
            return Err(DmaError::InvalidParam("DMA address not 64-byte aligned"));
        }

        let mut control = DescControl::GO;
        if intr_en {
            control |= DescControl::TRANSFER_IRQ_EN;
        }
        if !is_last_desc {
            control |= DescControl::EARLY_DONE_EN;
        }

        if ty == TransferType::FpgaToFpgaMm {
            let desc = MsgdmaExtDescriptor::new(src, dst, count as u32)
                .with_burst_counts(4, 4)
                .with_control(control);
            return self.hw.send_descriptor(&desc);
        }

        // The host-side address decides the burst alignment.
        let alignment_offset = if ty == TransferType::HostToFpgaMm {
            src % BURST_ALIGN
        } else {
            dst % BURST_ALIGN
        };

        if alignment_offset != 0 {
            let segment = (BURST_ALIGN - alignment_offset).min(count);
            let mut ctrl = control;
            if segment < count {
                // More descriptors follow; only the final one interrupts.
                ctrl -= DescControl::TRANSFER_IRQ_EN;
            }
            let desc =
                MsgdmaExtDescriptor::new(src, dst, segment as u32).with_control(ctrl);
            self.hw.send_descriptor(&desc)?;
            src += segment;
            dst += segment;
            count -= segment;
        }

        if count >= BURST_ALIGN {
            let segment = count - count % BURST_ALIGN;
            let mut ctrl = control;
            if segment < count {
                ctrl -= DescControl::TRANSFER_IRQ_EN;
            }
            let desc = MsgdmaExtDescriptor::new(src, dst, segment as u32)
                .with_burst_counts(4, 4)
                .with_control(ctrl);
            self.hw.send_descriptor(&desc)?;
            src += segment;
            dst += segment;
            count -= segment;
        }

        if count > 0 {
            let desc = MsgdmaExtDescriptor::new(src, dst, count as u32).with_control(control);
            self.hw.send_descriptor(&desc)?;
        }

        Ok(())
    }

    /// Queue the write-fence read: the magic value lands in the pinned
    /// magic buffer after every prior write has been committed.
    fn issue_magic(&self) -> DmaResult<()> {
        // SAFETY: magic buffer is a valid pinned 64-byte region.
        unsafe { std::ptr::write_volatile(self.magic.virt as *mut u64, 0) };
        self.do_dma(
            self.magic.iova | WF_HOST_MASK,
            WF_ROM_MAGIC_ADDR,
            DMA_ALIGN_BYTES,
            true,
            TransferType::FpgaToHostMm,
            true,
        )
    }

    fn wait_magic(&self) -> DmaResult<()> {
        self.hw.poll_interrupt()?;
        let mut spins = 0u32;
        // SAFETY: as in issue_magic.
        while unsafe { std::ptr::read_volatile(self.magic.virt as *const u64) } != WF_MAGIC {
            spins += 1;
            if spins >= MAGIC_SPIN_ITERATIONS {
                return Err(DmaError::Exception("write-fence magic never arrived"));
            }
            std::hint::spin_loop();
        }
        // SAFETY: as in issue_magic.
        unsafe { std::ptr::write_volatile(self.magic.virt as *mut u64, 0) };
        Ok(())
    }

    fn transfer_host_to_fpga(&self, xfer: &Arc<DmaTransfer>) -> DmaResult<()> {
        let (src, dst, len, small) = {
            let inner = xfer
                .inner
                .lock
                .lock()
                .map_err(|_| DmaError::Exception("transfer mutex poisoned"))?;
            (
                inner.src,
                inner.dst,
                inner.len,
                inner.attached.first().copied(),
            )
        };

        // Small-transfer fast path: the data is already in a pinned
        // buffer the caller filled in place.
        if let Some(sbp) = small {
            let offset = src.wrapping_sub(sbp.buf.virt as u64);
            if offset + len > sbp.buf.len as u64 {
                return Err(DmaError::InvalidParam("small transfer outside its buffer"));
            }
            self.do_dma(
                dst,
                (sbp.buf.iova + offset) | HOST_MEM_MASK,
                len,
                true,
                TransferType::HostToFpgaMm,
                true,
            )?;
            self.hw.poll_interrupt()?;
            xfer.add_bytes_transferred(len)?;
            return Ok(());
        }

        let buf_size = self.opts.buffer_size as u64;
        let mut chunks = len / buf_size;
        let mut last_chunk = len - chunks * buf_size;
        if last_chunk != 0 {
            chunks += 1;
        } else {
            last_chunk = buf_size;
        }

        let num_buffers = (chunks as usize).min(DMA_MAX_BUF).max(1);
        let buffers = self.acquire_bounce(num_buffers)?;
        let pool = &self.pool;
        let buffers = guard(buffers, |bufs| {
            for b in &bufs {
                pool.release_buffer(b);
            }
        });

        let half = (num_buffers / 2).max(1) as u64;
        let ping_pong = chunks > num_buffers as u64;
        let mut issued_intr = false;
        let mut pending_bytes: u64 = 0;

        for i in 0..chunks {
            let size = if i == chunks - 1 { last_chunk } else { buf_size };
            let buf = &buffers[(i % num_buffers as u64) as usize].buf;
            // SAFETY: bounce buffer holds buffer_size bytes and size is
            // bounded by it; src validity per the transfer API contract.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (src + i * buf_size) as *const u8,
                    buf.virt,
                    size as usize,
                );
            }

            let batch_end =
                (ping_pong && i % half == half - 1) || i == chunks - 1;
            if batch_end {
                if issued_intr {
                    self.hw.poll_interrupt()?;
                    xfer.add_bytes_transferred(pending_bytes)?;
                    pending_bytes = 0;
                }
                self.do_dma(
                    dst + i * buf_size,
                    buf.iova | HOST_MEM_MASK,
                    size,
                    true,
                    TransferType::HostToFpgaMm,
                    true,
                )?;
                issued_intr = true;
            } else {
                self.do_dma(
                    dst + i * buf_size,
                    buf.iova | HOST_MEM_MASK,
                    size,
                    false,
                    TransferType::HostToFpgaMm,
                    false,
                )?;
            }
            pending_bytes += size;
        }

        if issued_intr {
            self.hw.poll_interrupt()?;
            xfer.add_bytes_transferred(pending_bytes)?;
        }
        Ok(())
    }

    fn transfer_fpga_to_host(&self, xfer: &Arc<DmaTransfer>) -> DmaResult<()> {
        let (src, dst, len, small) = {
            let inner = xfer
                .inner
                .lock
                .lock()
                .map_err(|_| DmaError::Exception("transfer mutex poisoned"))?;
            (
                inner.src,
                inner.dst,
                inner.len,
                inner.attached.first().copied(),
            )
        };

        if let Some(sbp) = small {
            let offset = dst.wrapping_sub(sbp.buf.virt as u64);
            if offset + len > sbp.buf.len as u64 {
                return Err(DmaError::InvalidParam("small transfer outside its buffer"));
            }
            self.do_dma(
                (sbp.buf.iova + offset) | HOST_MEM_MASK,
                src,
                len,
                true,
                TransferType::FpgaToHostMm,
                false,
            )?;
            self.issue_magic()?;
            self.wait_magic()?;
            xfer.add_bytes_transferred(len)?;
            return Ok(());
        }

        let buf_size = self.opts.buffer_size as u64;
        let mut chunks = len / buf_size;
        let mut last_chunk = len - chunks * buf_size;
        if last_chunk != 0 {
            chunks += 1;
        } else {
            last_chunk = buf_size;
        }

        let num_buffers = (chunks as usize).min(DMA_MAX_BUF).max(1);
        let buffers = self.acquire_bounce(num_buffers)?;
        let pool = &self.pool;
        let buffers = guard(buffers, |bufs| {
            for b in &bufs {
                pool.release_buffer(b);
            }
        });

        let mut pending: u64 = 0;
        for i in 0..chunks {
            let size = if i == chunks - 1 { last_chunk } else { buf_size };
            let buf = &buffers[(i % num_buffers as u64) as usize].buf;
            self.do_dma(
                buf.iova | HOST_MEM_MASK,
                src + i * buf_size,
                size,
                i == chunks - 1,
                TransferType::FpgaToHostMm,
                false,
            )?;

            if (i + 1) % num_buffers as u64 == 0 || i == chunks - 1 {
                // Fence, then drain the completed window back to the
                // caller's buffer.
                self.issue_magic()?;
                self.wait_magic()?;
                let mut batch_bytes = 0u64;
                while pending <= i {
                    let psize = if pending == chunks - 1 {
                        last_chunk
                    } else {
                        buf_size
                    };
                    let pbuf = &buffers[(pending % num_buffers as u64) as usize].buf;
                    // SAFETY: as in transfer_host_to_fpga, reversed.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            pbuf.virt as *const u8,
                            (dst + pending * buf_size) as *mut u8,
                            psize as usize,
                        );
                    }
                    batch_bytes += psize;
                    pending += 1;
                }
                xfer.add_bytes_transferred(batch_bytes)?;
            }
        }
        Ok(())
    }

    fn transfer_fpga_to_fpga(&self, xfer: &Arc<DmaTransfer>) -> DmaResult<()> {
        let (src, dst, len) = {
            let inner = xfer
                .inner
                .lock
                .lock()
                .map_err(|_| DmaError::Exception("transfer mutex poisoned"))?;
            (inner.src, inner.dst, inner.len)
        };

        if src < dst && src + len >= dst {
            log::error!("overlapping device addresses");
            return Err(DmaError::NotSupported("overlapping device transfer"));
        }

        let buf_size = self.opts.buffer_size as u64;
        let chunks = len / buf_size;
        let remainder = len - chunks * buf_size;

        for i in 0..chunks {
            self.do_dma(
                dst + i * buf_size,
                src + i * buf_size,
                buf_size,
                false,
                TransferType::FpgaToFpgaMm,
                false,
            )?;
            if (i + 1) % DMA_MAX_BUF as u64 == 0 || i == chunks - 1 {
                self.issue_magic()?;
                self.wait_magic()?;
                xfer.add_bytes_transferred(
                    buf_size * ((i % DMA_MAX_BUF as u64) + 1).min(i + 1),
                )?;
            }
        }
        if remainder > 0 {
            self.do_dma(
                dst + chunks * buf_size,
                src + chunks * buf_size,
                remainder,
                true,
                TransferType::FpgaToFpgaMm,
                false,
            )?;
            self.issue_magic()?;
            self.wait_magic()?;
            xfer.add_bytes_transferred(remainder)?;
        }
        Ok(())
    }

    fn acquire_bounce(&self, n: usize) -> DmaResult<Vec<crate::pool::PooledBuffer>> {
        let mut bufs = Vec::with_capacity(n);
        for _ in 0..n {
            match self.pool.get_buffer() {
                Ok(b) => bufs.push(b),
                Err(e) => {
                    for b in &bufs {
                        self.pool.release_buffer(b);
                    }
                    return Err(e);
                }
            }
        }
        Ok(bufs)
    }

    /// Run one memory-to-memory transfer synchronously on the worker.
    pub(crate) fn run(&mut self, xfer: &Arc<DmaTransfer>) -> DmaResult<()> {
        let (ty, src, dst, len) = {
            let inner = xfer
                .inner
                .lock
                .lock()
                .map_err(|_| DmaError::Exception("transfer mutex poisoned"))?;
            (inner.transfer_type, inner.src, inner.dst, inner.len)
        };
        xfer.clear_progress()?;

        if src % DMA_ALIGN_BYTES != 0 || dst % DMA_ALIGN_BYTES != 0 || len % DMA_ALIGN_BYTES != 0 {
            return Err(DmaError::InvalidParam(
                "MM transfer requires 64-byte aligned src/dst/len",
            ));
        }

        if len == 0 {
            return Ok(());
        }

        log::debug!("m2m transfer: {ty:?} src={src:#x} dst={dst:#x} len={len:#x}");

        match ty {
            TransferType::HostToFpgaMm => self.transfer_host_to_fpga(xfer),
            TransferType::FpgaToHostMm => self.transfer_fpga_to_host(xfer),
            TransferType::FpgaToFpgaMm => self.transfer_fpga_to_fpga(xfer),
            _ => Err(DmaError::NotSupported("not a memory-to-memory transfer")),
        }
    }
}

impl Drop for M2mEngine {
    fn drop(&mut self) {
        if let Err(e) = self.pinner.release_buffer(self.magic.wsid) {
            log::error!("failed to release magic buffer: {e}");
        }
    }
}
