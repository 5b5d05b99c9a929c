// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software model of the streaming DMA BBB.
//!
//! `SimDevice` implements the same [`RegisterAccess`] and [`BufferPinner`]
//! surface as real hardware, backed by an in-process model of the DFH
//! feature table, the dispatcher CSR, the descriptor and response ports,
//! and the S2M streaming valve. It stands in for the hardware transport
//! the way the RTL simulator does, and drives the full engine/worker stack
//! in the integration tests.
//!
//! Descriptors are executed synchronously where data is available: an M2S
//! or MM descriptor completes at dispatch, an S2M descriptor completes as
//! soon as enough stream data has been pushed. Channels run in polling
//! mode (no interrupt source).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{DmaError, DmaResult};
use crate::mmio::{BufferPinner, RegisterAccess};
use crate::regs::{
    dfh_is_bbb, CsrControl, CsrStatus, DescControl, MsgdmaExtDescriptor, RspStatus, ValveControl,
    DFH_EOL_OFFSET, DFH_NEXT_OFFSET, DFH_TYPE_BBB, DFH_TYPE_OFFSET, HOST_MEM_MASK, M2M_DMA_UUID_H,
    M2M_DMA_UUID_L, M2S_DMA_UUID_H, M2S_DMA_UUID_L, S2M_DMA_UUID_H, S2M_DMA_UUID_L, WF_HOST_MASK,
    WF_MAGIC, WF_ROM_MAGIC_ADDR,
};
use crate::transfer::ChannelType;

/// Register span reserved per modeled channel.
const CHANNEL_STRIDE: u64 = 0x100;

struct HostBuf {
    wsid: u64,
    iova: u64,
    len: usize,
    ptr: usize,
}

struct SimChannel {
    ch_type: ChannelType,
    control: u32,
    stopped: bool,
    desc_words: [u32; 8],
    /// Dispatched descriptors not yet executed (S2M waiting for data).
    pending: VecDeque<MsgdmaExtDescriptor>,
    /// Response FIFO: (bytes transferred, status word).
    responses: VecDeque<(u32, u32)>,
    valve_control: u32,
    /// Incoming stream data for an S2M channel.
    stream_in: VecDeque<u8>,
    /// An EOP follows the last byte currently in `stream_in`.
    eop_pending: bool,
    /// In non-deterministic mode the valve stops admitting data once EOP
    /// has arrived, until the control register is rewritten.
    valve_closed: bool,
    /// Data an M2S channel has emitted onto its stream.
    sink: Vec<u8>,
    /// Sink offsets at which an EOP was generated.
    eop_marks: Vec<usize>,
    descriptors_issued: u64,
}

impl SimChannel {
    fn new(ch_type: ChannelType) -> Self {
        Self {
            ch_type,
            control: 0,
            stopped: false,
            desc_words: [0; 8],
            pending: VecDeque::new(),
            responses: VecDeque::new(),
            valve_control: 0,
            stream_in: VecDeque::new(),
            eop_pending: false,
            valve_closed: false,
            sink: Vec::new(),
            eop_marks: Vec::new(),
            descriptors_issued: 0,
        }
    }
}

struct SimInner {
    channels: Vec<SimChannel>,
    bufs: Vec<HostBuf>,
    next_iova: u64,
    next_wsid: u64,
    device_mem: Vec<u8>,
    write_count: u64,
}

impl SimInner {
    fn host_ptr(&self, addr: u64, len: u64) -> DmaResult<*mut u8> {
        let iova = addr & !(HOST_MEM_MASK | WF_HOST_MASK);
        for buf in &self.bufs {
            if iova >= buf.iova && iova + len <= buf.iova + buf.len as u64 {
                return Ok((buf.ptr + (iova - buf.iova) as usize) as *mut u8);
            }
        }
        Err(DmaError::InvalidParam("no pinned buffer at IOVA"))
    }

    fn read_span(&self, addr: u64, len: usize) -> Vec<u8> {
        if addr == WF_ROM_MAGIC_ADDR {
            let mut data = vec![0u8; len];
            let magic = WF_MAGIC.to_le_bytes();
            let n = len.min(magic.len());
            data[..n].copy_from_slice(&magic[..n]);
            return data;
        }
        if addr & (HOST_MEM_MASK | WF_HOST_MASK) != 0 {
            match self.host_ptr(addr, len as u64) {
                Ok(ptr) => {
                    let mut data = vec![0u8; len];
                    // SAFETY: host_ptr bounds-checked the pinned region.
                    unsafe { std::ptr::copy_nonoverlapping(ptr as *const u8, data.as_mut_ptr(), len) };
                    data
                }
                Err(e) => {
                    log::error!("sim read at bad host address {addr:#x}: {e}");
                    vec![0u8; len]
                }
            }
        } else {
            let start = addr as usize;
            let end = start + len;
            if end > self.device_mem.len() {
                log::error!("sim read outside device memory: {addr:#x}+{len:#x}");
                return vec![0u8; len];
            }
            self.device_mem[start..end].to_vec()
        }
    }

    fn write_span(&mut self, addr: u64, data: &[u8]) {
        if addr & (HOST_MEM_MASK | WF_HOST_MASK) != 0 {
            match self.host_ptr(addr, data.len() as u64) {
                Ok(ptr) => {
                    // SAFETY: host_ptr bounds-checked the pinned region.
                    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
                }
                Err(e) => log::error!("sim write at bad host address {addr:#x}: {e}"),
            }
        } else {
            let start = addr as usize;
            let end = start + data.len();
            if end > self.device_mem.len() {
                log::error!("sim write outside device memory: {addr:#x}+{:#x}", data.len());
                return;
            }
            self.device_mem[start..end].copy_from_slice(data);
        }
    }

    /// Execute whatever pending descriptors currently have data.
    fn process(&mut self, ci: usize) {
        let ch_type = self.channels[ci].ch_type;
        loop {
            let progressed = match ch_type {
                ChannelType::RxSt => self.process_one_rx(ci),
                ChannelType::TxSt => self.process_one_tx(ci),
                ChannelType::Mm => self.process_one_mm(ci),
            };
            if !progressed {
                break;
            }
        }
    }

    fn process_one_rx(&mut self, ci: usize) -> bool {
        let ch = &self.channels[ci];
        let valve = ValveControl::from_bits_retain(ch.valve_control);
        if !valve.contains(ValveControl::EN_DATA_FLOW) || ch.valve_closed {
            return false;
        }
        let Some(desc) = ch.pending.front().copied() else {
            return false;
        };

        let want = desc.len as usize;
        let avail = ch.stream_in.len();
        if avail == 0 {
            return false;
        }
        // A descriptor fills when the stream covers it, or is cut short
        // by an EOP on the final queued byte.
        let (take, eop_now) = if avail >= want {
            (want, ch.eop_pending && avail == want)
        } else if ch.eop_pending {
            (avail, true)
        } else {
            return false;
        };

        let ch = &mut self.channels[ci];
        let data: Vec<u8> = ch.stream_in.drain(..take).collect();
        if eop_now {
            ch.eop_pending = false;
            if valve.contains(ValveControl::EN_NON_DET_TF) {
                ch.valve_closed = true;
            }
        }
        ch.pending.pop_front();

        let dst = desc.dst();
        self.write_span(dst, &data);

        let ctrl = DescControl::from_bits_retain(desc.control);
        let mut status = RspStatus::empty();
        if eop_now && ctrl.contains(DescControl::END_ON_EOP) {
            status |= RspStatus::EOP_ARRIVED;
            if take < want {
                status |= RspStatus::EARLY_TERMINATION;
            }
        }
        self.channels[ci]
            .responses
            .push_back((take as u32, status.bits()));
        true
    }

    fn process_one_tx(&mut self, ci: usize) -> bool {
        let Some(desc) = self.channels[ci].pending.pop_front() else {
            return false;
        };
        let data = self.read_span(desc.src(), desc.len as usize);
        let ch = &mut self.channels[ci];
        ch.sink.extend_from_slice(&data);
        let ctrl = DescControl::from_bits_retain(desc.control);
        if ctrl.contains(DescControl::GENERATE_EOP) {
            let mark = ch.sink.len();
            ch.eop_marks.push(mark);
        }
        true
    }

    fn process_one_mm(&mut self, ci: usize) -> bool {
        let Some(desc) = self.channels[ci].pending.pop_front() else {
            return false;
        };
        let data = self.read_span(desc.src(), desc.len as usize);
        self.write_span(desc.dst(), &data);
        true
    }
}

/// In-process software model of the DMA feature.
pub struct SimDevice {
    inner: Mutex<SimInner>,
}

// SAFETY: all state, including raw host-buffer pointers, is owned by the
// inner mutex; buffer memory lives until release_buffer or drop.
unsafe impl Send for SimDevice {}
unsafe impl Sync for SimDevice {}

impl SimDevice {
    /// Model a device exposing the given DMA channels, with
    /// `device_mem_size` bytes of FPGA-local memory.
    pub fn new(channel_types: &[ChannelType], device_mem_size: usize) -> Self {
        Self {
            inner: Mutex::new(SimInner {
                channels: channel_types.iter().map(|&t| SimChannel::new(t)).collect(),
                bufs: Vec::new(),
                next_iova: 0x10_0000,
                next_wsid: 1,
                device_mem: vec![0u8; device_mem_size],
                write_count: 0,
            }),
        }
    }

    fn locate(offset: u64) -> (usize, u64) {
        ((offset / CHANNEL_STRIDE) as usize, offset % CHANNEL_STRIDE)
    }

    /// Queue stream data toward an S2M channel; with `eop`, an
    /// end-of-packet follows the final byte. Pending descriptors consume
    /// the data immediately.
    pub fn push_stream(&self, channel: usize, data: &[u8], eop: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ch = &mut inner.channels[channel];
        ch.stream_in.extend(data.iter().copied());
        if eop {
            ch.eop_pending = true;
        }
        inner.process(channel);
    }

    /// Data an M2S channel has emitted so far.
    pub fn stream_sink(&self, channel: usize) -> Vec<u8> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.channels[channel].sink.clone()
    }

    /// Sink offsets at which EOP markers were generated.
    pub fn eop_marks(&self, channel: usize) -> Vec<usize> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.channels[channel].eop_marks.clone()
    }

    pub fn write_device_mem(&self, offset: usize, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.device_mem[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn read_device_mem(&self, offset: usize, len: usize) -> Vec<u8> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.device_mem[offset..offset + len].to_vec()
    }

    /// Descriptors dispatched on a channel over its lifetime.
    pub fn descriptors_issued(&self, channel: usize) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.channels[channel].descriptors_issued
    }

    /// Descriptors dispatched but not yet executed (awaiting stream data).
    pub fn pending_descriptors(&self, channel: usize) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.channels[channel].pending.len()
    }

    /// Total MMIO writes the driver has performed.
    pub fn mmio_write_count(&self) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.write_count
    }
}

impl RegisterAccess for SimDevice {
    fn read32(&self, offset: u64) -> DmaResult<u32> {
        let mut inner = self.inner.lock().map_err(|_| DmaError::Exception("sim poisoned"))?;
        let (ci, rel) = Self::locate(offset);
        if ci >= inner.channels.len() {
            return Err(DmaError::InvalidParam("sim register out of range"));
        }
        let value = match rel {
            0x40 => {
                let ch = &inner.channels[ci];
                let mut status = CsrStatus::empty();
                if ch.pending.is_empty() {
                    status |= CsrStatus::DESC_BUF_EMPTY;
                }
                if ch.responses.is_empty() {
                    status |= CsrStatus::RSP_BUF_EMPTY;
                }
                if ch.stopped {
                    status |= CsrStatus::STOPPED;
                }
                status.bits()
            }
            0x44 => inner.channels[ci].control,
            0x4C => inner.channels[ci].responses.len().min(0xFFFF) as u32,
            0x80 => inner.channels[ci].responses.front().map_or(0, |r| r.0),
            // Reading response status pops the FIFO.
            0x84 => inner.channels[ci].responses.pop_front().map_or(0, |r| r.1),
            0xAC => inner.channels[ci].valve_control,
            _ => 0,
        };
        Ok(value)
    }

    fn write32(&self, offset: u64, value: u32) -> DmaResult<()> {
        let mut inner = self.inner.lock().map_err(|_| DmaError::Exception("sim poisoned"))?;
        inner.write_count += 1;
        let (ci, rel) = Self::locate(offset);
        if ci >= inner.channels.len() {
            return Err(DmaError::InvalidParam("sim register out of range"));
        }
        match rel {
            0x44 => {
                let control = CsrControl::from_bits_retain(value);
                let ch = &mut inner.channels[ci];
                ch.control = value;
                if control.contains(CsrControl::FLUSH_DESCRIPTORS) {
                    ch.pending.clear();
                }
                ch.stopped = control.contains(CsrControl::STOP_DISPATCHER);
            }
            0x60..=0x7C => {
                let word = ((rel - 0x60) / 4) as usize;
                inner.channels[ci].desc_words[word] = value;
                if rel == 0x7C {
                    let desc = MsgdmaExtDescriptor::from_words(inner.channels[ci].desc_words);
                    let ctrl = DescControl::from_bits_retain(desc.control);
                    if ctrl.contains(DescControl::GO) {
                        inner.channels[ci].pending.push_back(desc);
                        inner.channels[ci].descriptors_issued += 1;
                        inner.process(ci);
                    }
                }
            }
            0xAC => {
                let ch = &mut inner.channels[ci];
                ch.valve_control = value;
                ch.valve_closed = false;
                inner.process(ci);
            }
            _ => {}
        }
        Ok(())
    }

    fn read64(&self, offset: u64) -> DmaResult<u64> {
        let (ci, rel) = Self::locate(offset);
        {
            let inner = self.inner.lock().map_err(|_| DmaError::Exception("sim poisoned"))?;
            if ci >= inner.channels.len() {
                return Err(DmaError::InvalidParam("sim register out of range"));
            }
            match rel {
                0 => {
                    let mut dfh = (DFH_TYPE_BBB << DFH_TYPE_OFFSET)
                        | (CHANNEL_STRIDE << DFH_NEXT_OFFSET);
                    if ci == inner.channels.len() - 1 {
                        dfh |= 1 << DFH_EOL_OFFSET;
                    }
                    debug_assert!(dfh_is_bbb(dfh));
                    return Ok(dfh);
                }
                8 => {
                    return Ok(match inner.channels[ci].ch_type {
                        ChannelType::TxSt => M2S_DMA_UUID_L,
                        ChannelType::RxSt => S2M_DMA_UUID_L,
                        ChannelType::Mm => M2M_DMA_UUID_L,
                    })
                }
                16 => {
                    return Ok(match inner.channels[ci].ch_type {
                        ChannelType::TxSt => M2S_DMA_UUID_H,
                        ChannelType::RxSt => S2M_DMA_UUID_H,
                        ChannelType::Mm => M2M_DMA_UUID_H,
                    })
                }
                _ => {}
            }
        }
        let lo = self.read32(offset)? as u64;
        let hi = self.read32(offset + 4)? as u64;
        Ok(hi << 32 | lo)
    }

    fn write64(&self, offset: u64, value: u64) -> DmaResult<()> {
        self.write32(offset, value as u32)?;
        self.write32(offset + 4, (value >> 32) as u32)
    }
}

impl BufferPinner for SimDevice {
    fn prepare_buffer(&self, len: usize) -> DmaResult<(*mut u8, u64)> {
        let layout = Layout::from_size_align(len.max(1), 64)
            .map_err(|_| DmaError::InvalidParam("bad buffer size"))?;
        // SAFETY: layout has non-zero size and valid alignment.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(DmaError::NoMemory("pinned buffer allocation failed"));
        }

        let mut inner = self.inner.lock().map_err(|_| DmaError::Exception("sim poisoned"))?;
        let wsid = inner.next_wsid;
        inner.next_wsid += 1;
        let iova = inner.next_iova;
        inner.next_iova += (len as u64 + 0xFFF) & !0xFFF;
        inner.bufs.push(HostBuf {
            wsid,
            iova,
            len,
            ptr: ptr as usize,
        });
        Ok((ptr, wsid))
    }

    fn io_address(&self, wsid: u64) -> DmaResult<u64> {
        let inner = self.inner.lock().map_err(|_| DmaError::Exception("sim poisoned"))?;
        inner
            .bufs
            .iter()
            .find(|b| b.wsid == wsid)
            .map(|b| b.iova)
            .ok_or(DmaError::InvalidParam("unknown workspace id"))
    }

    fn release_buffer(&self, wsid: u64) -> DmaResult<()> {
        let mut inner = self.inner.lock().map_err(|_| DmaError::Exception("sim poisoned"))?;
        let pos = inner
            .bufs
            .iter()
            .position(|b| b.wsid == wsid)
            .ok_or(DmaError::InvalidParam("unknown workspace id"))?;
        let buf = inner.bufs.swap_remove(pos);
        let layout = Layout::from_size_align(buf.len.max(1), 64)
            .map_err(|_| DmaError::Exception("bad stored layout"))?;
        // SAFETY: ptr was allocated with this exact layout in
        // prepare_buffer and is freed exactly once.
        unsafe { dealloc(buf.ptr as *mut u8, layout) };
        Ok(())
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        for buf in &inner.bufs {
            if let Ok(layout) = Layout::from_size_align(buf.len.max(1), 64) {
                // SAFETY: as in release_buffer.
                unsafe { dealloc(buf.ptr as *mut u8, layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dfh_walk_shape() {
        let sim = SimDevice::new(&[ChannelType::TxSt, ChannelType::RxSt, ChannelType::Mm], 0);
        let dfh0 = sim.read64(0).unwrap();
        assert!(dfh_is_bbb(dfh0));
        assert!(!crate::regs::dfh_eol(dfh0));
        assert_eq!(crate::regs::dfh_next(dfh0), CHANNEL_STRIDE);
        assert_eq!(sim.read64(8).unwrap(), M2S_DMA_UUID_L);
        assert_eq!(sim.read64(16).unwrap(), M2S_DMA_UUID_H);

        let dfh2 = sim.read64(2 * CHANNEL_STRIDE).unwrap();
        assert!(crate::regs::dfh_eol(dfh2));
        assert_eq!(sim.read64(2 * CHANNEL_STRIDE + 8).unwrap(), M2M_DMA_UUID_L);
    }

    #[test]
    fn test_pin_and_translate() {
        let sim = SimDevice::new(&[ChannelType::Mm], 0);
        let (ptr, wsid) = sim.prepare_buffer(4096).unwrap();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 64, 0);
        let iova = sim.io_address(wsid).unwrap();
        assert_eq!(iova % 64, 0);
        sim.release_buffer(wsid).unwrap();
        assert!(sim.io_address(wsid).is_err());
    }

    #[test]
    fn test_mm_descriptor_copies_device_memory() {
        let sim = SimDevice::new(&[ChannelType::Mm], 0x1000);
        sim.write_device_mem(0, &[0xAB; 64]);

        let desc = MsgdmaExtDescriptor::new(0, 0x200, 64).with_control(DescControl::GO);
        for (i, w) in desc.as_words().iter().enumerate() {
            sim.write32(0x60 + 4 * i as u64, *w).unwrap();
        }
        assert_eq!(sim.read_device_mem(0x200, 64), vec![0xAB; 64]);
        assert_eq!(sim.descriptors_issued(0), 1);
    }

    #[test]
    fn test_rx_descriptor_waits_for_stream() {
        let sim = SimDevice::new(&[ChannelType::RxSt], 0);
        let (_, wsid) = sim.prepare_buffer(4096).unwrap();
        let iova = sim.io_address(wsid).unwrap();

        // Open the valve first, then dispatch one 64-byte descriptor.
        sim.write32(0xAC, (ValveControl::EN_DATA_FLOW | ValveControl::EN_DET_TF).bits())
            .unwrap();
        let desc = MsgdmaExtDescriptor::new(0, iova | HOST_MEM_MASK, 64)
            .with_control(DescControl::GO | DescControl::WAIT_FOR_WR_RSP);
        for (i, w) in desc.as_words().iter().enumerate() {
            sim.write32(0x60 + 4 * i as u64, *w).unwrap();
        }
        assert_eq!(sim.pending_descriptors(0), 1);
        assert_eq!(sim.read32(0x4C).unwrap(), 0);

        sim.push_stream(0, &[0x5A; 64], false);
        assert_eq!(sim.pending_descriptors(0), 0);
        assert_eq!(sim.read32(0x4C).unwrap(), 1);
        assert_eq!(sim.read32(0x80).unwrap(), 64);
        // Status read pops the FIFO.
        sim.read32(0x84).unwrap();
        assert_eq!(sim.read32(0x4C).unwrap(), 0);
    }
}
