// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! mSGDMA register map, extended-descriptor layout, and DFH constants.
//!
//! These layouts match the modular scatter-gather DMA (mSGDMA) dispatcher
//! configuration used by the streaming DMA BBB, plus the streaming-valve
//! and response ports added by the S2M write master. They are a fixed
//! hardware ABI; nothing here is tunable.

use bitflags::bitflags;

/// DMA transfers must be aligned to this many bytes (one cache line).
pub const DMA_ALIGN_BYTES: u64 = 64;

/// Number of scratch buffers in the descriptor ring (per direction).
/// Matches the depth of the dispatcher's descriptor FIFO.
pub const DMA_MAX_BUF: usize = 8;

/// Default granularity of a single descriptor (bytes). This must match the
/// maximum-transfer configuration of the DMA IP; larger requests are broken
/// into descriptors of at most this size. See `DmaOptions::buffer_size`.
pub const DMA_BUF_SIZE: usize = 2 * 1024 * 1024;

/// Default capacity of a channel's transfer request queue.
pub const DMA_MAX_INFLIGHT: usize = 1024;

/// Budget of small-transfer buffers that may be attached to transfers at
/// any one time.
pub const DMA_MAX_SMALL_BUFFERS: usize = 32;

/// Window bit the DMA masters use to address host memory through the IOMMU.
pub const HOST_MEM_MASK: u64 = 0x1_0000_0000_0000;

/// Window bit for write-fence magic readback on the MM master.
pub const WF_HOST_MASK: u64 = 0x2_0000_0000_0000;

/// Device-side address of the write-fence magic ROM.
pub const WF_ROM_MAGIC_ADDR: u64 = 0x1_0000_0000_0000;

/// Value the write-fence ROM returns once all prior writes have landed.
pub const WF_MAGIC: u64 = 0x5772_745F_5379_6E63;

pub const MASK_32_BIT: u64 = 0xFFFF_FFFF;

// ---------------------------------------------------------------------------
// Register offsets from a channel's DFH base
// ---------------------------------------------------------------------------

/// Dispatcher CSR block.
pub const DMA_CSR: u64 = 0x40;
/// Descriptor slave port (32-byte extended descriptor).
pub const DMA_DESC: u64 = 0x60;
/// Response slave port (S2M only).
pub const DMA_RESPONSE: u64 = 0x80;
/// Streaming valve (S2M only).
pub const DMA_STREAMING_VALVE: u64 = 0xA0;

/// Offsets within the CSR block.
pub mod csr {
    pub const STATUS: u64 = 0x0;
    pub const CONTROL: u64 = 0x4;
    pub const FILL_LEVEL: u64 = 0x8;
    pub const RSP_FILL_LEVEL: u64 = 0xC;
    pub const SEQ_NUM: u64 = 0x10;
}

/// Offsets within the response port.
pub mod rsp {
    pub const BYTES_TRANSFERRED: u64 = 0x0;
    /// Reading the status register pops the response FIFO.
    pub const STATUS: u64 = 0x4;
}

/// Offsets within the streaming valve.
pub mod valve {
    pub const BYTES_TRANSFERRED_LO: u64 = 0x0;
    pub const BYTES_TRANSFERRED_HI: u64 = 0x4;
    pub const BYTES_TO_TRANSFER: u64 = 0x8;
    pub const CONTROL: u64 = 0xC;
    pub const STATUS: u64 = 0x10;
}

bitflags! {
    /// Descriptor control word (offset 0x1C of the extended descriptor).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescControl: u32 {
        /// In-band start-of-packet on the outgoing stream (M2S).
        const GENERATE_SOP = 1 << 8;
        /// In-band end-of-packet on the outgoing stream (M2S).
        const GENERATE_EOP = 1 << 9;
        const PARK_READS = 1 << 10;
        const PARK_WRITES = 1 << 11;
        /// Terminate the descriptor when EOP arrives on the stream (S2M).
        const END_ON_EOP = 1 << 12;
        /// Interrupt when EOP is received (S2M).
        const EOP_RCVD_IRQ_EN = 1 << 13;
        /// Interrupt when this descriptor completes.
        const TRANSFER_IRQ_EN = 1 << 14;
        const EARLY_TERM_IRQ_EN = 1 << 15;
        /// Read logic may advance to the next descriptor before this one's
        /// write response lands. Must be clear on the last descriptor of a
        /// batch; a premature completion there is indistinguishable from
        /// the real one.
        const EARLY_DONE_EN = 1 << 24;
        /// Hold descriptor completion until the write response arrives.
        const WAIT_FOR_WR_RSP = 1 << 25;
        /// Dispatch the descriptor.
        const GO = 1 << 31;
    }
}

impl DescControl {
    /// Error-interrupt mask field, bits [23:16].
    #[inline]
    pub fn with_error_irq_mask(self, mask: u8) -> Self {
        Self::from_bits_retain(self.bits() | ((mask as u32) << 16))
    }

    /// Streaming TX channel field, bits [7:0].
    #[inline]
    pub fn with_tx_channel(self, channel: u8) -> Self {
        Self::from_bits_retain(self.bits() | channel as u32)
    }
}

bitflags! {
    /// Dispatcher status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CsrStatus: u32 {
        const BUSY = 1 << 0;
        const DESC_BUF_EMPTY = 1 << 1;
        const DESC_BUF_FULL = 1 << 2;
        const RSP_BUF_EMPTY = 1 << 3;
        const RSP_BUF_FULL = 1 << 4;
        const STOPPED = 1 << 5;
        const RESETTING = 1 << 6;
        const STOPPED_ON_ERROR = 1 << 7;
        const STOPPED_ON_EARLY_TERM = 1 << 8;
        const IRQ = 1 << 9;
    }
}

bitflags! {
    /// Dispatcher control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CsrControl: u32 {
        const STOP_DISPATCHER = 1 << 0;
        const RESET_DISPATCHER = 1 << 1;
        const STOP_ON_ERROR = 1 << 2;
        const STOP_ON_EARLY_TERM = 1 << 3;
        const GLOBAL_INTR_EN = 1 << 4;
        const STOP_DESCRIPTORS = 1 << 5;
        /// Discard descriptors pending in the dispatcher FIFO.
        const FLUSH_DESCRIPTORS = 1 << 6;
        const FLUSH_RD_MASTER = 1 << 7;
        const FLUSH_WR_MASTER = 1 << 8;
    }
}

bitflags! {
    /// Response status word. The error byte occupies bits [7:0].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RspStatus: u32 {
        const EARLY_TERMINATION = 1 << 8;
        /// The stream delivered EOP within this descriptor.
        const EOP_ARRIVED = 1 << 9;
        const DESC_BUFFER_FULL = 1 << 19;
    }
}

impl RspStatus {
    /// Error byte, bits [7:0].
    #[inline]
    pub fn error(self) -> u8 {
        (self.bits() & 0xFF) as u8
    }
}

bitflags! {
    /// Streaming valve control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ValveControl: u32 {
        /// Let stream data into the DMA.
        const EN_DATA_FLOW = 1 << 0;
        /// Deterministic (fixed-length) transfer mode.
        const EN_DET_TF = 1 << 1;
        /// Non-deterministic mode; the valve stops accepting data after
        /// EOP so stale descriptors can be flushed.
        const EN_NON_DET_TF = 1 << 2;
        const CLR_BYTES_TRANSFERRED = 1 << 3;
    }
}

bitflags! {
    /// Streaming valve status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ValveStatus: u32 {
        const DET_TF_OCCURRED = 1 << 0;
        const NON_DET_TF_OCCURRED = 1 << 1;
    }
}

/// 32-byte mSGDMA extended descriptor, written word-by-word to the
/// descriptor slave port. Dispatch happens when the control word (with GO
/// set) lands at offset 0x1C.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MsgdmaExtDescriptor {
    /// Source address, low 32 bits.
    pub rd_address: u32,
    /// Destination address, low 32 bits.
    pub wr_address: u32,
    /// Transfer length in bytes.
    pub len: u32,
    pub seq_num: u16,
    pub rd_burst_count: u8,
    pub wr_burst_count: u8,
    pub rd_stride: u16,
    pub wr_stride: u16,
    /// Source address, high 32 bits.
    pub rd_address_ext: u32,
    /// Destination address, high 32 bits.
    pub wr_address_ext: u32,
    /// Control word; see [`DescControl`].
    pub control: u32,
}

impl MsgdmaExtDescriptor {
    /// Create a descriptor with the fields that are fixed for all DMA
    /// transfers already populated (unit strides, sequence number zero).
    #[inline]
    pub fn new(src: u64, dst: u64, len: u32) -> Self {
        Self {
            rd_address: (src & MASK_32_BIT) as u32,
            wr_address: (dst & MASK_32_BIT) as u32,
            len,
            seq_num: 0,
            rd_burst_count: 1,
            wr_burst_count: 1,
            rd_stride: 1,
            wr_stride: 1,
            rd_address_ext: ((src >> 32) & MASK_32_BIT) as u32,
            wr_address_ext: ((dst >> 32) & MASK_32_BIT) as u32,
            control: 0,
        }
    }

    #[inline]
    pub fn with_control(mut self, control: DescControl) -> Self {
        self.control = control.bits();
        self
    }

    #[inline]
    pub fn with_burst_counts(mut self, rd: u8, wr: u8) -> Self {
        self.rd_burst_count = rd;
        self.wr_burst_count = wr;
        self
    }

    /// Full 64-bit source address.
    #[inline]
    pub fn src(&self) -> u64 {
        (self.rd_address_ext as u64) << 32 | self.rd_address as u64
    }

    /// Full 64-bit destination address.
    #[inline]
    pub fn dst(&self) -> u64 {
        (self.wr_address_ext as u64) << 32 | self.wr_address as u64
    }

    /// The descriptor as the eight 32-bit words written to the slave port,
    /// in ascending offset order.
    #[inline]
    pub fn as_words(&self) -> [u32; 8] {
        [
            self.rd_address,
            self.wr_address,
            self.len,
            (self.seq_num as u32)
                | (self.rd_burst_count as u32) << 16
                | (self.wr_burst_count as u32) << 24,
            (self.rd_stride as u32) | (self.wr_stride as u32) << 16,
            self.rd_address_ext,
            self.wr_address_ext,
            self.control,
        ]
    }

    /// Rebuild a descriptor from the eight words written to the slave port.
    #[inline]
    pub fn from_words(w: [u32; 8]) -> Self {
        Self {
            rd_address: w[0],
            wr_address: w[1],
            len: w[2],
            seq_num: (w[3] & 0xFFFF) as u16,
            rd_burst_count: ((w[3] >> 16) & 0xFF) as u8,
            wr_burst_count: ((w[3] >> 24) & 0xFF) as u8,
            rd_stride: (w[4] & 0xFFFF) as u16,
            wr_stride: ((w[4] >> 16) & 0xFFFF) as u16,
            rd_address_ext: w[5],
            wr_address_ext: w[6],
            control: w[7],
        }
    }
}

// ---------------------------------------------------------------------------
// Device feature list (DFH) walking
// ---------------------------------------------------------------------------

pub const DFH_NEXT_OFFSET: u32 = 16;
pub const DFH_EOL_OFFSET: u32 = 40;
pub const DFH_TYPE_OFFSET: u32 = 60;

/// Feature type nibble for a basic building block (per CCI-P).
pub const DFH_TYPE_BBB: u64 = 0x2;

/// Interface UUID of the memory-to-stream DMA BBB.
pub const M2S_DMA_UUID_H: u64 = 0xfee6_9b44_2f77_43ed;
pub const M2S_DMA_UUID_L: u64 = 0x9ff4_9b8c_f9ee_6335;

/// Interface UUID of the stream-to-memory DMA BBB.
pub const S2M_DMA_UUID_H: u64 = 0xf118_209a_d59a_4b3f;
pub const S2M_DMA_UUID_L: u64 = 0xa66c_d700_a658_a015;

/// Interface UUID of the memory-to-memory DMA BBB.
pub const M2M_DMA_UUID_H: u64 = 0xef82_def7_f6ec_40fc;
pub const M2M_DMA_UUID_L: u64 = 0xa914_9a35_bace_01ea;

/// Feature header marks the end of the device feature list.
#[inline]
pub fn dfh_eol(dfh: u64) -> bool {
    (dfh >> DFH_EOL_OFFSET) & 1 == 1
}

/// Feature header describes a basic building block.
#[inline]
pub fn dfh_is_bbb(dfh: u64) -> bool {
    (dfh >> DFH_TYPE_OFFSET) & 0xF == DFH_TYPE_BBB
}

/// Byte offset from this feature header to the next.
#[inline]
pub fn dfh_next(dfh: u64) -> u64 {
    (dfh >> DFH_NEXT_OFFSET) & 0xFF_FFFF
}

// Compile-time layout checks; the descriptor port is a fixed hardware ABI.
const _: () = assert!(std::mem::size_of::<MsgdmaExtDescriptor>() == 32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_size() {
        assert_eq!(std::mem::size_of::<MsgdmaExtDescriptor>(), 32);
    }

    #[test]
    fn test_descriptor_word_round_trip() {
        let desc = MsgdmaExtDescriptor::new(0x1_2345_6780, 0x9_8765_4340, 4096)
            .with_burst_counts(4, 4)
            .with_control(DescControl::GO | DescControl::TRANSFER_IRQ_EN);

        let rebuilt = MsgdmaExtDescriptor::from_words(desc.as_words());
        assert_eq!(rebuilt.src(), 0x1_2345_6780);
        assert_eq!(rebuilt.dst(), 0x9_8765_4340);
        assert_eq!(rebuilt.len, 4096);
        assert_eq!(rebuilt.rd_burst_count, 4);
        assert_eq!(rebuilt.wr_burst_count, 4);
        assert_eq!(rebuilt.rd_stride, 1);
        assert_eq!(rebuilt.wr_stride, 1);
        let ctrl = DescControl::from_bits_retain(rebuilt.control);
        assert!(ctrl.contains(DescControl::GO));
        assert!(ctrl.contains(DescControl::TRANSFER_IRQ_EN));
    }

    #[test]
    fn test_desc_control_fields() {
        let ctrl = DescControl::GO.with_error_irq_mask(0xFF).with_tx_channel(3);
        assert_eq!(ctrl.bits() & 0xFF, 3);
        assert_eq!((ctrl.bits() >> 16) & 0xFF, 0xFF);
        assert!(ctrl.contains(DescControl::GO));
    }

    #[test]
    fn test_rsp_status_error_byte() {
        let st = RspStatus::from_bits_retain(0x27) | RspStatus::EOP_ARRIVED;
        assert_eq!(st.error(), 0x27);
        assert!(st.contains(RspStatus::EOP_ARRIVED));
        assert!(!st.contains(RspStatus::EARLY_TERMINATION));
    }

    #[test]
    fn test_dfh_helpers() {
        // BBB header, next at +0x100, not end-of-list
        let dfh = (DFH_TYPE_BBB << DFH_TYPE_OFFSET) | (0x100u64 << DFH_NEXT_OFFSET);
        assert!(dfh_is_bbb(dfh));
        assert!(!dfh_eol(dfh));
        assert_eq!(dfh_next(dfh), 0x100);

        let last = dfh | (1u64 << DFH_EOL_OFFSET);
        assert!(dfh_eol(last));
    }
}
