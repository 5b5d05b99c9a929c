// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for DMA operations.

use thiserror::Error;

/// Errors that can occur during DMA operations.
#[derive(Debug, Error)]
pub enum DmaError {
    /// Invalid argument: misaligned address, bad channel index, or an
    /// incompatible transfer/channel combination.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// Allocation failure (pool item, queue, channel state).
    #[error("out of memory: {0}")]
    NoMemory(&'static str),

    /// A lock or semaphore primitive failed, or an internal invariant was
    /// violated. Not recoverable for the current call.
    #[error("exception: {0}")]
    Exception(&'static str),

    /// Transfer queue is full (retry), or a resource is transiently held.
    #[error("busy: {0}")]
    Busy(&'static str),

    /// Queue-closed signal. Used cooperatively to shut down worker
    /// threads; not a hardware or programming error.
    #[error("no access: queue closed")]
    NoAccess,

    /// Requested transfer type is not supported by this driver version.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// No DMA channel was found while walking the device feature list.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// I/O error from system calls (mmap, eventfd, poll).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for DMA operations.
pub type DmaResult<T> = Result<T, DmaError>;
