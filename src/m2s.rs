// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Memory-to-stream (TX) descriptor engine.
//!
//! Source data is staged chunk-by-chunk through the scratch ring and
//! dispatched to the outgoing stream. Completion interrupts are requested
//! every half ring so the copy of the next half overlaps the hardware's
//! consumption of the previous one. SOP/EOP markers are generated in-band
//! on the first/last descriptor per the transfer's TX control.

use std::sync::Arc;

use crate::channel::{ChannelHw, DmaOptions};
use crate::error::{DmaError, DmaResult};
use crate::pool::{PooledBuffer, ResourcePool};
use crate::regs::{DescControl, MsgdmaExtDescriptor, DMA_ALIGN_BYTES, DMA_MAX_BUF, HOST_MEM_MASK};
use crate::transfer::{DmaTransfer, TxControl};

pub(crate) struct M2sEngine {
    hw: Arc<ChannelHw>,
    pool: Arc<ResourcePool>,
    opts: DmaOptions,
    /// Staging ring, owned by this engine for its lifetime.
    scratch: Vec<PooledBuffer>,
}

impl M2sEngine {
    pub(crate) fn new(
        hw: Arc<ChannelHw>,
        pool: Arc<ResourcePool>,
        opts: DmaOptions,
    ) -> DmaResult<Self> {
        let mut scratch = Vec::with_capacity(DMA_MAX_BUF);
        for _ in 0..DMA_MAX_BUF {
            match pool.get_buffer() {
                Ok(buf) => scratch.push(buf),
                Err(e) => {
                    for buf in &scratch {
                        pool.release_buffer(buf);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self {
            hw,
            pool,
            opts,
            scratch,
        })
    }

    /// Issue one TX descriptor sourcing `count` bytes from `src`.
    fn do_dma_tx(
        &self,
        src: u64,
        count: u32,
        is_last_desc: bool,
        intr_en: bool,
        sop: bool,
        eop: bool,
    ) -> DmaResult<()> {
        if src % DMA_ALIGN_BYTES != 0 {
            return Err(DmaError::InvalidParam("DMA address not 64-byte aligned"));
        }

        let mut control = DescControl::GO;
        if intr_en {
            control |= DescControl::TRANSFER_IRQ_EN;
        }
        if !is_last_desc {
            control |= DescControl::EARLY_DONE_EN;
        }
        if sop {
            control |= DescControl::GENERATE_SOP;
        }
        if eop {
            control |= DescControl::GENERATE_EOP;
        }

        let desc = MsgdmaExtDescriptor::new(src, 0, count).with_control(control);
        self.hw.send_descriptor(&desc)
    }

    /// Run one memory-to-stream transfer to completion.
    pub(crate) fn run(&mut self, xfer: &Arc<DmaTransfer>) -> DmaResult<()> {
        let (src, len, tx_ctrl) = {
            let inner = xfer
                .inner
                .lock
                .lock()
                .map_err(|_| DmaError::Exception("transfer mutex poisoned"))?;
            (inner.src, inner.len, inner.tx_ctrl)
        };
        xfer.clear_progress()?;

        let buf_size = self.opts.buffer_size as u64;
        let dma_chunks = len / buf_size;
        let remainder = (len - dma_chunks * buf_size) as u32;

        let gen_sop = matches!(tx_ctrl, TxControl::GenerateSop | TxControl::GenerateSopAndEop);
        let gen_eop = matches!(tx_ctrl, TxControl::GenerateEop | TxControl::GenerateSopAndEop);

        log::debug!("m2s transfer: src={src:#x} len={len:#x} chunks={dma_chunks}");

        let half_ring = DMA_MAX_BUF as u64 / 2;
        let mut issued_intr = false;
        // Bytes issued since the last completed interrupt wait; credited
        // to the transfer once the hardware has caught up.
        let mut pending_bytes: u64 = 0;

        for i in 0..dma_chunks {
            let slot = (i % DMA_MAX_BUF as u64) as usize;
            let buf = &self.scratch[slot].buf;
            // SAFETY: scratch buffers hold buffer_size bytes; src validity
            // for len bytes is part of the transfer API contract.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (src + i * buf_size) as *const u8,
                    buf.virt,
                    buf_size as usize,
                );
            }

            let structurally_last = i == dma_chunks - 1 && remainder == 0;
            let eop_here = structurally_last && gen_eop;
            let sop_here = i == 0 && gen_sop;

            if i % half_ring == half_ring - 1 || i == dma_chunks - 1 {
                if issued_intr {
                    self.hw.poll_interrupt()?;
                    xfer.add_bytes_transferred(pending_bytes)?;
                    pending_bytes = 0;
                }
                self.do_dma_tx(
                    buf.iova | HOST_MEM_MASK,
                    buf_size as u32,
                    structurally_last,
                    true,
                    sop_here,
                    eop_here,
                )?;
                issued_intr = true;
            } else {
                self.do_dma_tx(
                    buf.iova | HOST_MEM_MASK,
                    buf_size as u32,
                    false,
                    false,
                    sop_here,
                    false,
                )?;
            }
            pending_bytes += buf_size;
        }

        if issued_intr {
            self.hw.poll_interrupt()?;
            xfer.add_bytes_transferred(pending_bytes)?;
        }

        if remainder > 0 {
            let buf = &self.scratch[0].buf;
            // SAFETY: remainder < buffer_size; src validity per the
            // transfer API contract.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (src + dma_chunks * buf_size) as *const u8,
                    buf.virt,
                    remainder as usize,
                );
            }
            self.do_dma_tx(
                buf.iova | HOST_MEM_MASK,
                remainder,
                true,
                true,
                dma_chunks == 0 && gen_sop,
                gen_eop,
            )?;
            self.hw.poll_interrupt()?;
            xfer.add_bytes_transferred(remainder as u64)?;
        }

        Ok(())
    }
}

impl Drop for M2sEngine {
    fn drop(&mut self) {
        for buf in &self.scratch {
            self.pool.release_buffer(buf);
        }
    }
}
