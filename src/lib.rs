// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # FPGA Streaming DMA (mSGDMA) Rust Driver
//!
//! Userspace driver for the Intel FPGA streaming DMA accelerator built on
//! the modular scatter-gather DMA (mSGDMA) dispatcher. The device exposes
//! up to three channel kinds (memory-to-stream, stream-to-memory, and
//! memory-to-memory), each driven by a dedicated worker thread that
//! pipelines hardware descriptors through a bounded ring to hide
//! per-descriptor completion latency.
//!
//! ## Architecture
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | Resource pool | [`pool`] | Reusable semaphores, transfer mutexes, pinned buffers |
//! | Transfer queue | [`queue`] | Bounded FIFO between submitters and workers |
//! | Transfer object | [`transfer`] | One DMA operation, reusable across starts |
//! | RX engine | `s2m` | Stream→memory descriptor/response pipeline |
//! | TX engine | `m2s` | Memory→stream descriptor pipeline |
//! | MM engine | `m2m` | Memory↔memory with write-fence handshake |
//! | Channels | [`channel`] | Enumeration, workers, completion thread |
//! | Register access | [`mmio`] | Capability trait + direct-mapped impl |
//! | Software model | [`sim`] | In-process device model (ASE-style transport) |
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use msgdma_rust::{ChannelType, DmaError, SimDevice, StreamingDma, TransferType};
//!
//! fn main() -> Result<(), DmaError> {
//!     // A software-modeled device with one memory-to-memory channel.
//!     let device = Arc::new(SimDevice::new(&[ChannelType::Mm], 1 << 20));
//!     let dma = StreamingDma::open(Arc::clone(&device))?;
//!     let channel = dma.open_channel(0)?;
//!
//!     // DMA addresses must be 64-byte aligned.
//!     #[repr(C, align(64))]
//!     struct Aligned([u8; 4096]);
//!     let src = Box::new(Aligned([0xA5; 4096]));
//!
//!     let transfer = channel.transfer_init()?;
//!     transfer.set_src(src.0.as_ptr() as u64)?;
//!     transfer.set_dst(0x1000)?; // device-local destination
//!     transfer.set_len(src.0.len() as u64)?;
//!     transfer.set_transfer_type(TransferType::HostToFpgaMm)?;
//!
//!     // No callback registered: start() blocks until completion.
//!     channel.start(&transfer)?;
//!     assert_eq!(transfer.bytes_transferred()?, 4096);
//!     Ok(())
//! }
//! ```
//!
//! ## Safety
//!
//! Transfer source/destination addresses are raw pointers into the
//! caller's address space (or device-local offsets). The caller must keep
//! those regions valid and unaliased for the duration of the transfer;
//! the driver cannot check them. All other unsafe code is confined to
//! MMIO access, pinned-buffer management, and the staging copies.

// Module declarations
pub mod channel;
pub mod error;
pub mod mmio;
pub mod pool;
pub mod queue;
pub mod regs;
pub mod sim;
pub mod sync;
pub mod transfer;

mod m2m;
mod m2s;
mod s2m;

// Re-exports for convenient access
pub use channel::{ChannelDesc, DmaChannel, DmaOptions, StreamingDma};
pub use error::{DmaError, DmaResult};
pub use mmio::{BufferPinner, FpgaPlatform, MappedMmio, PinnedBuffer, RegisterAccess};
pub use pool::{PoolKind, PoolStats, ResourcePool};
pub use queue::TransferQueue;
pub use sim::SimDevice;
pub use transfer::{
    ChannelType, DmaTransfer, RxControl, TransferCallback, TransferStatus, TransferType, TxControl,
};
