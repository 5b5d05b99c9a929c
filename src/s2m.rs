// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Stream-to-memory (RX) descriptor/response engine.
//!
//! Moves streaming data from the AFU into a destination buffer through a
//! ring of pinned scratch buffers. Multiple descriptors are kept in flight
//! to hide per-descriptor completion latency; completion interrupts are
//! requested only every half ring. A hardware-signaled end-of-packet can
//! shorten the transfer, in which case descriptors already issued into the
//! dispatcher remain outstanding and are either flushed or carried over to
//! the next transfer of the same mode.

use std::sync::Arc;

use crate::channel::{ChannelHw, DmaOptions};
use crate::error::{DmaError, DmaResult};
use crate::pool::{PooledBuffer, ResourcePool};
use crate::regs::{
    self, CsrControl, CsrStatus, DescControl, MsgdmaExtDescriptor, RspStatus, ValveControl,
    DMA_ALIGN_BYTES, DMA_MAX_BUF, HOST_MEM_MASK,
};
use crate::transfer::{DmaTransfer, RxControl};

/// Spin budget while waiting for the dispatcher to stop during a flush.
const STOP_SPIN_ITERATIONS: u32 = 10_000_000;

/// One pop of the response FIFO: responses consumed, bytes reported, and
/// whether EOP was seen.
struct RspBatch {
    fill: usize,
    bytes: u64,
    eop: bool,
}

pub(crate) struct S2mEngine {
    hw: Arc<ChannelHw>,
    pool: Arc<ResourcePool>,
    opts: DmaOptions,
    /// Scratch landing zones for streaming data, owned by this engine for
    /// its lifetime. Ring slot i stages the data of every chunk with
    /// chunk-index ≡ i (mod ring size).
    scratch: Vec<PooledBuffer>,
    /// Ring slot of the oldest issued-but-unconsumed descriptor.
    next_avail_desc_idx: usize,
    /// Issued-but-unconsumed descriptors left in the dispatcher.
    unused_desc_count: usize,
    /// RX mode of the transfer that left the outstanding descriptors.
    /// Carryover is only valid for a same-mode successor; anything else
    /// forces a flush.
    carryover_mode: Option<RxControl>,
}

impl S2mEngine {
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
            next_avail_desc_idx: 0,
            unused_desc_count: 0,
            carryover_mode: None,
        })
    }

    /// Pop up to `max` responses from the response FIFO, stopping early at
    /// an EOP response. Responses beyond `max` stay in the FIFO for a
    /// later pop (or the next transfer's drain phase).
    fn pop_response_fifo(&self, max: usize) -> DmaResult<RspBatch> {
        let level = self.hw.regs.read32(self.hw.csr_base + regs::csr::RSP_FILL_LEVEL)?;
        let mut fill_remaining = ((level & 0xFFFF) as usize).min(max);

        let mut batch = RspBatch {
            fill: 0,
            bytes: 0,
            eop: false,
        };
        while fill_remaining > 0 && !batch.eop {
            let bytes = self
                .hw
                .regs
                .read32(self.hw.rsp_base + regs::rsp::BYTES_TRANSFERRED)?;
            // Reading the status register pops this response.
            let status =
                RspStatus::from_bits_retain(self.hw.regs.read32(self.hw.rsp_base + regs::rsp::STATUS)?);
            batch.bytes += bytes as u64;
            if status.error() != 0 {
                log::warn!("response reported error {:#04x}", status.error());
            }
            if status.contains(RspStatus::EOP_ARRIVED) {
                batch.eop = true;
            }
            batch.fill += 1;
            fill_remaining -= 1;
            log::debug!(
                "rsp pop: fill={} eop={} bytes={:#x}",
                batch.fill,
                batch.eop,
                batch.bytes
            );
        }
        Ok(batch)
    }

    /// Issue one RX descriptor: `count` bytes of stream data landing at
    /// `dst`. Addresses must be 64-byte aligned.
    fn do_dma_rx(
        &self,
        dst: u64,
        src: u64,
        count: u32,
        is_last_desc: bool,
        intr_en: bool,
        rx_ctrl: RxControl,
    ) -> DmaResult<()> {
        if dst % DMA_ALIGN_BYTES != 0 || src % DMA_ALIGN_BYTES != 0 {
            return Err(DmaError::InvalidParam("DMA address not 64-byte aligned"));
        }

        let mut control = DescControl::GO | DescControl::WAIT_FOR_WR_RSP;
        if intr_en {
            control |= DescControl::TRANSFER_IRQ_EN;
        }
        // Early done lets the read logic start the next descriptor before
        // this one's write response lands. The last descriptor must wait
        // for full completion.
        if !is_last_desc {
            control |= DescControl::EARLY_DONE_EN;
        }
        if rx_ctrl == RxControl::EndOnEop {
            control |= DescControl::END_ON_EOP | DescControl::EOP_RCVD_IRQ_EN;
        }

        let desc = MsgdmaExtDescriptor::new(src, dst, count).with_control(control);
        self.hw.send_descriptor(&desc)
    }

    /// Flush descriptors left pending in the dispatcher: stop, wait for
    /// the stopped status, flush the write master, re-enable interrupts.
    fn pending_desc_flush(&self) -> DmaResult<()> {
        self.hw.write_control(CsrControl::FLUSH_DESCRIPTORS | CsrControl::STOP_DISPATCHER)?;

        let mut spins = 0u32;
        loop {
            let status = CsrStatus::from_bits_retain(
                self.hw.regs.read32(self.hw.csr_base + regs::csr::STATUS)?,
            );
            if status.contains(CsrStatus::STOPPED) {
                break;
            }
            spins += 1;
            if spins >= STOP_SPIN_ITERATIONS {
                return Err(DmaError::Exception("dispatcher did not stop for flush"));
            }
            std::hint::spin_loop();
        }

        // Catch descriptors that sneaked in after the initial flush.
        self.hw.write_control(CsrControl::FLUSH_WR_MASTER)?;
        self.hw
            .write_control(CsrControl::FLUSH_WR_MASTER | CsrControl::GLOBAL_INTR_EN)?;
        Ok(())
    }

    /// Copy one completed chunk from ring slot `slot` into the destination.
    ///
    /// # Safety contract
    ///
    /// The destination address comes from the client's transfer request;
    /// validity for the full transfer length while the transfer is in
    /// flight is part of the API contract.
    fn copy_chunk(&self, dst: u64, chunk: u64, slot: usize, len: usize) {
        let buf = &self.scratch[slot].buf;
        let len = len.min(buf.len);
        // SAFETY: scratch buffers are valid for buf.len bytes; dst validity
        // per the transfer contract.
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf.virt as *const u8,
                (dst + chunk * self.opts.buffer_size as u64) as *mut u8,
                len,
            );
        }
    }

    /// Run one stream-to-memory transfer to completion.
    pub(crate) fn run(&mut self, xfer: &Arc<DmaTransfer>) -> DmaResult<()> {
        let (dst, len, rx_ctrl) = {
            let inner = xfer
                .inner
                .lock
                .lock()
                .map_err(|_| DmaError::Exception("transfer mutex poisoned"))?;
            (inner.dst, inner.len, inner.rx_ctrl)
        };
        xfer.clear_progress()?;

        let buf_size = self.opts.buffer_size as u64;
        let dma_chunks = len / buf_size;
        let mut remainder = (len - dma_chunks * buf_size) as u32;

        log::debug!(
            "s2m transfer: dst={dst:#x} len={len:#x} chunks={dma_chunks} carryover={}",
            self.unused_desc_count
        );

        // Program the streaming valve. Outstanding descriptors from a
        // prior transfer are only reusable by a same-mode successor;
        // a mode switch must flush them first.
        let mut valve = ValveControl::EN_DATA_FLOW;
        match rx_ctrl {
            RxControl::EndOnEop => valve |= ValveControl::EN_NON_DET_TF,
            RxControl::NoPacket => valve |= ValveControl::EN_DET_TF,
        }
        if self.unused_desc_count > 0 && self.carryover_mode != Some(rx_ctrl) {
            self.pending_desc_flush()?;
            self.unused_desc_count = 0;
            self.next_avail_desc_idx = 0;
            self.carryover_mode = None;
        }
        self.hw
            .regs
            .write32(self.hw.valve_base + regs::valve::CONTROL, valve.bits())?;

        let mut head: u64 = 0;
        let mut tail: u64;
        let mut eop_arrived = false;
        let mut eop_in_drain = false;

        // Drain phase: the dispatcher holds either nothing or descriptors
        // left over from prior transfers; consume their responses first.
        // Stops once the requested chunks are consumed, the ring is
        // exhausted, or EOP arrives.
        loop {
            // The current transfer was satisfied by leftovers alone.
            // Responses past this point stay queued for the next drain.
            if head == dma_chunks {
                break;
            }
            // Ring exhausted; fresh descriptors are needed.
            if self.unused_desc_count == 0 {
                self.next_avail_desc_idx = 0;
                break;
            }

            let want = (dma_chunks - head).min(self.unused_desc_count as u64) as usize;
            let batch = self.pop_response_fifo(want)?;
            xfer.add_bytes_transferred(batch.bytes)?;
            let mut bytes_left = batch.bytes;
            let mut fill = batch.fill;
            while fill > 0 {
                self.copy_chunk(
                    dst,
                    head,
                    self.next_avail_desc_idx,
                    bytes_left.min(buf_size) as usize,
                );
                bytes_left -= bytes_left.min(buf_size);
                self.next_avail_desc_idx = (self.next_avail_desc_idx + 1) % DMA_MAX_BUF;
                self.unused_desc_count = self.unused_desc_count.saturating_sub(1);
                head += 1;
                fill -= 1;
            }

            // EOP arrived before the carried-over descriptors ran out.
            if batch.eop {
                eop_arrived = true;
                eop_in_drain = true;
                break;
            }
        }

        tail = head;

        if !eop_arrived {
            let mut issued_intr = false;

            while head < dma_chunks {
                let cur_num_pending = head - tail + 1;
                let is_last = head == dma_chunks - 1 && remainder == 0;
                let slot = (head % DMA_MAX_BUF as u64) as usize;
                let land = self.scratch[slot].buf.iova | HOST_MEM_MASK;

                if cur_num_pending == (DMA_MAX_BUF / 2) as u64 {
                    self.do_dma_rx(land, 0, buf_size as u32, is_last, true, rx_ctrl)?;
                    issued_intr = true;
                } else if cur_num_pending > (DMA_MAX_BUF - 1) as u64 || head == dma_chunks - 1 {
                    if issued_intr {
                        self.hw.poll_interrupt()?;
                        let batch = self.pop_response_fifo((head - tail) as usize)?;
                        xfer.add_bytes_transferred(batch.bytes)?;
                        let mut bytes_left = batch.bytes;
                        for _ in 0..batch.fill {
                            self.copy_chunk(
                                dst,
                                tail,
                                (tail % DMA_MAX_BUF as u64) as usize,
                                bytes_left.min(buf_size) as usize,
                            );
                            bytes_left -= bytes_left.min(buf_size);
                            tail += 1;
                        }
                        issued_intr = false;
                        if batch.eop {
                            eop_arrived = true;
                            break;
                        }
                    }
                    self.do_dma_rx(land, 0, buf_size as u32, is_last, true, rx_ctrl)?;
                    issued_intr = true;
                } else {
                    self.do_dma_rx(land, 0, buf_size as u32, is_last, false, rx_ctrl)?;
                }

                head += 1;
            }

            // Collect the responses of the final batch.
            if !eop_arrived && issued_intr {
                self.hw.poll_interrupt()?;
                loop {
                    let batch = self.pop_response_fifo((head - tail) as usize)?;
                    xfer.add_bytes_transferred(batch.bytes)?;
                    let mut bytes_left = batch.bytes;
                    let mut fill = batch.fill;
                    while fill > 0 {
                        self.copy_chunk(
                            dst,
                            tail,
                            (tail % DMA_MAX_BUF as u64) as usize,
                            bytes_left.min(buf_size) as usize,
                        );
                        bytes_left -= bytes_left.min(buf_size);
                        tail += 1;
                        fill -= 1;
                    }
                    if batch.eop {
                        eop_arrived = true;
                        break;
                    }
                    if tail >= dma_chunks {
                        break;
                    }
                }
            }

            // Sub-chunk remainder, drained synchronously.
            if !eop_arrived && remainder > 0 {
                self.do_dma_rx(
                    self.scratch[0].buf.iova | HOST_MEM_MASK,
                    0,
                    remainder,
                    true,
                    true,
                    rx_ctrl,
                )?;
                self.hw.poll_interrupt()?;
                loop {
                    let batch = self.pop_response_fifo(1)?;
                    xfer.add_bytes_transferred(batch.bytes)?;
                    if batch.fill > 0 {
                        let buf = &self.scratch[0].buf;
                        let n = (batch.bytes as usize).min(buf.len).min(remainder as usize);
                        // SAFETY: as in copy_chunk.
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                buf.virt as *const u8,
                                (dst + dma_chunks * buf_size) as *mut u8,
                                n,
                            );
                        }
                        remainder = remainder.saturating_sub(batch.bytes as u32);
                    }
                    if batch.eop {
                        eop_arrived = true;
                        break;
                    }
                    if remainder == 0 {
                        break;
                    }
                }
            }
        }

        if eop_arrived {
            if self.opts.force_desc_flush {
                self.pending_desc_flush()?;
                self.unused_desc_count = 0;
                self.next_avail_desc_idx = 0;
                self.carryover_mode = None;
            } else {
                // Keep the unconsumed descriptors for the next same-mode
                // transfer; its drain phase picks them up.
                if !eop_in_drain {
                    self.next_avail_desc_idx = (tail % DMA_MAX_BUF as u64) as usize;
                    self.unused_desc_count = (head - tail) as usize;
                }
                self.carryover_mode = Some(rx_ctrl);
            }
            xfer.set_eop_arrived()?;
        } else {
            // Without EOP, every descriptor issued for this transfer was
            // consumed. The drain counters still track any leftover
            // carryover when the transfer was satisfied early by count.
            if self.unused_desc_count == 0 {
                self.carryover_mode = None;
            }
        }

        Ok(())
    }
}

impl Drop for S2mEngine {
    fn drop(&mut self) {
        for buf in &self.scratch {
            self.pool.release_buffer(buf);
        }
    }
}
