// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! End-to-end transfer tests against the software device model: channel
//! enumeration, all three directions, synchronous and callback completion,
//! FIFO ordering, transfer-object reuse, and the EOP descriptor-carryover
//! path.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use msgdma_rust::{
    ChannelType, DmaError, DmaOptions, PoolKind, RxControl, SimDevice, StreamingDma, TransferType,
    TxControl,
};

/// Small descriptor granularity so tests exercise multi-chunk pipelining
/// without megabyte buffers.
const TEST_BUF_SIZE: usize = 1024;

/// 64-byte aligned host buffer for transfer sources/destinations.
struct AlignedBuf {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len, 64).unwrap();
        // SAFETY: len is non-zero in every test.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, len }
    }

    fn addr(&self) -> u64 {
        self.ptr as u64
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is len bytes and lives until drop.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in as_slice.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, 64).unwrap();
        // SAFETY: allocated with this layout in new.
        unsafe { dealloc(self.ptr, layout) };
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn test_options() -> DmaOptions {
    DmaOptions {
        buffer_size: TEST_BUF_SIZE,
        ..DmaOptions::default()
    }
}

/// Full three-channel device plus an opened controller.
fn open_dma(opts: DmaOptions) -> (Arc<SimDevice>, StreamingDma) {
    let sim = Arc::new(SimDevice::new(
        &[ChannelType::TxSt, ChannelType::RxSt, ChannelType::Mm],
        1 << 20,
    ));
    let dma = StreamingDma::open_with(Arc::clone(&sim), opts).unwrap();
    (sim, dma)
}

fn wait_for(counter: &AtomicUsize, target: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while counter.load(Ordering::SeqCst) < target {
        assert!(Instant::now() < deadline, "timed out waiting for callbacks");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_enumeration_finds_all_channels() {
    let (_sim, dma) = open_dma(test_options());
    let descs = dma.enumerate_channels();
    assert_eq!(descs.len(), 3);
    assert_eq!(descs[0].ch_type, ChannelType::TxSt);
    assert_eq!(descs[1].ch_type, ChannelType::RxSt);
    assert_eq!(descs[2].ch_type, ChannelType::Mm);
    assert_eq!(descs[1].csr_base, descs[1].dma_base + 0x40);
}

#[test]
fn test_double_open_channel_busy() {
    let (_sim, dma) = open_dma(test_options());
    let _ch = dma.open_channel(2).unwrap();
    assert!(matches!(dma.open_channel(2), Err(DmaError::Busy(_))));
    dma.close_channel(2).unwrap();
    // Closed channels can be reopened.
    let _ch = dma.open_channel(2).unwrap();
}

#[test]
fn test_close_unopened_channel_rejected() {
    let (_sim, dma) = open_dma(test_options());
    assert!(matches!(
        dma.close_channel(1),
        Err(DmaError::InvalidParam(_))
    ));
    assert!(matches!(
        dma.open_channel(17),
        Err(DmaError::InvalidParam(_))
    ));
}

// Scenario: a synchronous host→device MM transfer moves the full payload
// and reports its byte count.
#[test]
fn test_mm_host_to_fpga_sync() {
    let (sim, dma) = open_dma(test_options());
    let channel = dma.open_channel(2).unwrap();

    let mut src = AlignedBuf::new(4096);
    src.as_mut_slice().copy_from_slice(&pattern(4096));

    let xfer = channel.transfer_init().unwrap();
    xfer.set_src(src.addr()).unwrap();
    xfer.set_dst(0x1000).unwrap();
    xfer.set_len(4096).unwrap();
    xfer.set_transfer_type(TransferType::HostToFpgaMm).unwrap();

    channel.start(&xfer).unwrap();
    assert_eq!(xfer.bytes_transferred().unwrap(), 4096);
    assert!(!xfer.eop_arrived().unwrap());

    let written = sim.read_device_mem(0x1000, 4096);
    assert_eq!(crc32fast::hash(&written), crc32fast::hash(src.as_slice()));

    channel.transfer_destroy(xfer).unwrap();
}

#[test]
fn test_mm_fpga_to_host_sync() {
    let (sim, dma) = open_dma(test_options());
    let channel = dma.open_channel(2).unwrap();

    // 5.5 chunks exercises the bounce ring and the short final chunk.
    let len = 5 * TEST_BUF_SIZE + 512;
    let data = pattern(len);
    sim.write_device_mem(0x4000, &data);

    let dst = AlignedBuf::new(len);
    let xfer = channel.transfer_init().unwrap();
    xfer.set_src(0x4000).unwrap();
    xfer.set_dst(dst.addr()).unwrap();
    xfer.set_len(len as u64).unwrap();
    xfer.set_transfer_type(TransferType::FpgaToHostMm).unwrap();

    channel.start(&xfer).unwrap();
    assert_eq!(xfer.bytes_transferred().unwrap(), len as u64);
    assert_eq!(crc32fast::hash(dst.as_slice()), crc32fast::hash(&data));
}

#[test]
fn test_mm_fpga_to_fpga_sync() {
    let (sim, dma) = open_dma(test_options());
    let channel = dma.open_channel(2).unwrap();

    let data = pattern(8192);
    sim.write_device_mem(0, &data);

    let xfer = channel.transfer_init().unwrap();
    xfer.set_src(0).unwrap();
    xfer.set_dst(0x10000).unwrap();
    xfer.set_len(8192).unwrap();
    xfer.set_transfer_type(TransferType::FpgaToFpgaMm).unwrap();

    channel.start(&xfer).unwrap();
    assert_eq!(sim.read_device_mem(0x10000, 8192), data);
}

// Scenario: misaligned MM addresses fail inside the engine; the transfer
// completes with a zero byte count rather than hanging the caller.
#[test]
fn test_mm_misaligned_completes_with_zero_bytes() {
    let (_sim, dma) = open_dma(test_options());
    let channel = dma.open_channel(2).unwrap();

    let src = AlignedBuf::new(128);
    let xfer = channel.transfer_init().unwrap();
    xfer.set_src(src.addr() + 1).unwrap();
    xfer.set_dst(0x1000).unwrap();
    xfer.set_len(64).unwrap();
    xfer.set_transfer_type(TransferType::HostToFpgaMm).unwrap();

    channel.start(&xfer).unwrap();
    assert_eq!(xfer.bytes_transferred().unwrap(), 0);
}

// Scenario: a no-packet transfer whose length is not a burst multiple is
// rejected before any register write happens.
#[test]
fn test_no_packet_alignment_rejected_before_mmio() {
    let (sim, dma) = open_dma(test_options());
    let channel = dma.open_channel(0).unwrap();

    let src = AlignedBuf::new(128);
    let xfer = channel.transfer_init().unwrap();
    xfer.set_src(src.addr()).unwrap();
    xfer.set_len(100).unwrap();
    xfer.set_transfer_type(TransferType::HostMmToFpgaSt).unwrap();
    xfer.set_tx_control(TxControl::NoPacket).unwrap();

    let writes_before = sim.mmio_write_count();
    assert!(matches!(
        channel.start(&xfer),
        Err(DmaError::InvalidParam(_))
    ));
    assert_eq!(sim.mmio_write_count(), writes_before);
    // The object is still usable afterwards.
    xfer.set_len(128).unwrap();
    channel.start(&xfer).unwrap();
    assert_eq!(xfer.bytes_transferred().unwrap(), 128);
}

#[test]
fn test_incompatible_transfer_type_rejected() {
    let (_sim, dma) = open_dma(test_options());
    let tx = dma.open_channel(0).unwrap();
    let rx = dma.open_channel(1).unwrap();

    // RX-only channel must not accept a host-to-stream transfer.
    let xfer = rx.transfer_init().unwrap();
    xfer.set_transfer_type(TransferType::HostMmToFpgaSt).unwrap();
    assert!(matches!(rx.start(&xfer), Err(DmaError::InvalidParam(_))));

    // A transfer initialized on one channel type cannot start on another.
    let xfer = rx.transfer_init().unwrap();
    xfer.set_transfer_type(TransferType::FpgaStToHostMm).unwrap();
    assert!(matches!(tx.start(&xfer), Err(DmaError::InvalidParam(_))));

    // MM transfer types never run on a streaming channel.
    let xfer = tx.transfer_init().unwrap();
    xfer.set_transfer_type(TransferType::HostToFpgaMm).unwrap();
    assert!(matches!(tx.start(&xfer), Err(DmaError::InvalidParam(_))));
}

#[test]
fn test_m2s_stream_with_packet_markers() {
    let (sim, dma) = open_dma(test_options());
    let channel = dma.open_channel(0).unwrap();

    // Two full chunks plus a remainder.
    let len = 2 * TEST_BUF_SIZE + 512;
    let mut src = AlignedBuf::new(len);
    src.as_mut_slice().copy_from_slice(&pattern(len));

    let xfer = channel.transfer_init().unwrap();
    xfer.set_src(src.addr()).unwrap();
    xfer.set_len(len as u64).unwrap();
    xfer.set_transfer_type(TransferType::HostMmToFpgaSt).unwrap();
    xfer.set_tx_control(TxControl::GenerateSopAndEop).unwrap();

    channel.start(&xfer).unwrap();
    assert_eq!(xfer.bytes_transferred().unwrap(), len as u64);

    let sink = sim.stream_sink(0);
    assert_eq!(sink.len(), len);
    assert_eq!(crc32fast::hash(&sink), crc32fast::hash(src.as_slice()));
    // Exactly one EOP, at the end of the packet.
    assert_eq!(sim.eop_marks(0), vec![len]);
}

#[test]
fn test_m2s_long_transfer_pipelines_ring() {
    let (sim, dma) = open_dma(test_options());
    let channel = dma.open_channel(0).unwrap();

    // 24 chunks: three full trips around the 8-deep ring.
    let len = 24 * TEST_BUF_SIZE;
    let mut src = AlignedBuf::new(len);
    src.as_mut_slice().copy_from_slice(&pattern(len));

    let xfer = channel.transfer_init().unwrap();
    xfer.set_src(src.addr()).unwrap();
    xfer.set_len(len as u64).unwrap();
    xfer.set_transfer_type(TransferType::HostMmToFpgaSt).unwrap();

    channel.start(&xfer).unwrap();
    let sink = sim.stream_sink(0);
    assert_eq!(sink, pattern(len));
    assert_eq!(sim.descriptors_issued(0), 24);
}

#[test]
fn test_s2m_deterministic_transfer() {
    let (sim, dma) = open_dma(test_options());
    let channel = dma.open_channel(1).unwrap();

    // Two chunks plus a remainder, all data queued up front.
    let len = 2 * TEST_BUF_SIZE + 512;
    let data = pattern(len);
    sim.push_stream(1, &data, false);

    let dst = AlignedBuf::new(len);
    let xfer = channel.transfer_init().unwrap();
    xfer.set_dst(dst.addr()).unwrap();
    xfer.set_len(len as u64).unwrap();
    xfer.set_transfer_type(TransferType::FpgaStToHostMm).unwrap();
    xfer.set_rx_control(RxControl::NoPacket).unwrap();

    channel.start(&xfer).unwrap();
    assert_eq!(xfer.bytes_transferred().unwrap(), len as u64);
    assert!(!xfer.eop_arrived().unwrap());
    assert_eq!(dst.as_slice(), &data[..]);
}

// Scenario: an EOP-terminated transfer leaves its unconsumed descriptors
// in the dispatcher, and the next same-mode transfer drains them without
// issuing duplicates.
#[test]
fn test_s2m_eop_carryover_reused_without_duplicate_descriptors() {
    let mut opts = test_options();
    opts.force_desc_flush = false;
    let (sim, dma) = open_dma(opts);
    let channel = dma.open_channel(1).unwrap();

    // First transfer asks for 8 chunks but the packet ends after 3.
    let first = pattern(3 * TEST_BUF_SIZE);
    sim.push_stream(1, &first, true);

    let dst1 = AlignedBuf::new(8 * TEST_BUF_SIZE);
    let xfer = channel.transfer_init().unwrap();
    xfer.set_dst(dst1.addr()).unwrap();
    xfer.set_len(8 * TEST_BUF_SIZE as u64).unwrap();
    xfer.set_transfer_type(TransferType::FpgaStToHostMm).unwrap();
    xfer.set_rx_control(RxControl::EndOnEop).unwrap();
    channel.start(&xfer).unwrap();

    assert_eq!(xfer.bytes_transferred().unwrap(), first.len() as u64);
    assert!(xfer.eop_arrived().unwrap());
    assert_eq!(&dst1.as_slice()[..first.len()], &first[..]);

    let issued_after_first = sim.descriptors_issued(1);
    let leftover = sim.pending_descriptors(1);
    assert!(leftover > 0, "EOP should leave descriptors outstanding");

    // Second same-mode transfer is satisfied entirely by the leftovers.
    let second = pattern(leftover * TEST_BUF_SIZE);
    sim.push_stream(1, &second, true);

    let dst2 = AlignedBuf::new(second.len());
    xfer.reset().unwrap();
    xfer.set_dst(dst2.addr()).unwrap();
    xfer.set_len(second.len() as u64).unwrap();
    xfer.set_transfer_type(TransferType::FpgaStToHostMm).unwrap();
    xfer.set_rx_control(RxControl::EndOnEop).unwrap();
    channel.start(&xfer).unwrap();

    assert_eq!(xfer.bytes_transferred().unwrap(), second.len() as u64);
    assert!(xfer.eop_arrived().unwrap());
    assert_eq!(dst2.as_slice(), &second[..]);
    // No new descriptors were issued for the second transfer.
    assert_eq!(sim.descriptors_issued(1), issued_after_first);
    assert_eq!(sim.pending_descriptors(1), 0);
}

// Scenario: carryover from a non-deterministic transfer is flushed, not
// reused, when the next transfer switches to deterministic mode.
#[test]
fn test_s2m_mode_switch_flushes_carryover() {
    let mut opts = test_options();
    opts.force_desc_flush = false;
    let (sim, dma) = open_dma(opts);
    let channel = dma.open_channel(1).unwrap();

    let first = pattern(2 * TEST_BUF_SIZE);
    sim.push_stream(1, &first, true);

    let dst1 = AlignedBuf::new(6 * TEST_BUF_SIZE);
    let xfer = channel.transfer_init().unwrap();
    xfer.set_dst(dst1.addr()).unwrap();
    xfer.set_len(6 * TEST_BUF_SIZE as u64).unwrap();
    xfer.set_transfer_type(TransferType::FpgaStToHostMm).unwrap();
    xfer.set_rx_control(RxControl::EndOnEop).unwrap();
    channel.start(&xfer).unwrap();
    assert!(xfer.eop_arrived().unwrap());
    assert!(sim.pending_descriptors(1) > 0);

    // Deterministic follow-up: stale descriptors must be flushed before
    // fresh ones are issued for the new mode.
    let second = pattern(TEST_BUF_SIZE);
    sim.push_stream(1, &second, false);

    let dst2 = AlignedBuf::new(TEST_BUF_SIZE);
    xfer.reset().unwrap();
    xfer.set_dst(dst2.addr()).unwrap();
    xfer.set_len(TEST_BUF_SIZE as u64).unwrap();
    xfer.set_transfer_type(TransferType::FpgaStToHostMm).unwrap();
    xfer.set_rx_control(RxControl::NoPacket).unwrap();
    channel.start(&xfer).unwrap();

    assert_eq!(xfer.bytes_transferred().unwrap(), TEST_BUF_SIZE as u64);
    assert_eq!(dst2.as_slice(), &second[..]);
    assert_eq!(sim.pending_descriptors(1), 0);
}

// Scenario: transfers submitted on one channel complete strictly in
// submission order.
#[test]
fn test_fifo_completion_order() {
    let (sim, dma) = open_dma(test_options());
    let channel = dma.open_channel(0).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicUsize::new(0));

    let len = TEST_BUF_SIZE;
    let mut bufs = Vec::new();
    let mut xfers = Vec::new();
    for i in 0..3usize {
        let mut src = AlignedBuf::new(len);
        src.as_mut_slice().fill(i as u8 + 1);

        let xfer = channel.transfer_init().unwrap();
        xfer.set_src(src.addr()).unwrap();
        xfer.set_len(len as u64).unwrap();
        xfer.set_transfer_type(TransferType::HostMmToFpgaSt).unwrap();

        let order = Arc::clone(&order);
        let done = Arc::clone(&done);
        xfer.set_callback(Some(Box::new(move |_status| {
            order.lock().unwrap().push(i);
            done.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

        channel.start(&xfer).unwrap();
        bufs.push(src);
        xfers.push(xfer);
    }

    wait_for(&done, 3);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    // Stream carries the payloads back-to-back in submission order.
    let sink = sim.stream_sink(0);
    assert_eq!(sink.len(), 3 * len);
    assert!(sink[..len].iter().all(|&b| b == 1));
    assert!(sink[len..2 * len].iter().all(|&b| b == 2));
    assert!(sink[2 * len..].iter().all(|&b| b == 3));
}

// Scenario: an async transfer's callback observes the final byte count.
#[test]
fn test_async_callback_status() {
    let (_sim, dma) = open_dma(test_options());
    let channel = dma.open_channel(2).unwrap();

    let mut src = AlignedBuf::new(4096);
    src.as_mut_slice().copy_from_slice(&pattern(4096));

    let done = Arc::new(AtomicUsize::new(0));
    let seen_bytes = Arc::new(AtomicUsize::new(0));

    let xfer = channel.transfer_init().unwrap();
    xfer.set_src(src.addr()).unwrap();
    xfer.set_dst(0x2000).unwrap();
    xfer.set_len(4096).unwrap();
    xfer.set_transfer_type(TransferType::HostToFpgaMm).unwrap();
    {
        let done = Arc::clone(&done);
        let seen = Arc::clone(&seen_bytes);
        xfer.set_callback(Some(Box::new(move |status| {
            seen.store(status.bytes_transferred as usize, Ordering::SeqCst);
            done.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
    }

    channel.start(&xfer).unwrap();
    wait_for(&done, 1);
    assert_eq!(seen_bytes.load(Ordering::SeqCst), 4096);
}

// Scenario: two sequential starts reusing one transfer object (with a
// reset in between) each complete with their own byte count.
#[test]
fn test_transfer_object_reuse_with_reset() {
    let (sim, dma) = open_dma(test_options());
    let channel = dma.open_channel(2).unwrap();

    let mut src = AlignedBuf::new(8192);
    src.as_mut_slice().copy_from_slice(&pattern(8192));

    let xfer = channel.transfer_init().unwrap();
    xfer.set_src(src.addr()).unwrap();
    xfer.set_dst(0x1000).unwrap();
    xfer.set_len(4096).unwrap();
    xfer.set_transfer_type(TransferType::HostToFpgaMm).unwrap();
    channel.start(&xfer).unwrap();
    assert_eq!(xfer.bytes_transferred().unwrap(), 4096);

    xfer.reset().unwrap();
    xfer.set_src(src.addr()).unwrap();
    xfer.set_dst(0x8000).unwrap();
    xfer.set_len(8192).unwrap();
    xfer.set_transfer_type(TransferType::HostToFpgaMm).unwrap();
    channel.start(&xfer).unwrap();
    assert_eq!(xfer.bytes_transferred().unwrap(), 8192);

    assert_eq!(sim.read_device_mem(0x8000, 8192), pattern(8192));
    channel.transfer_destroy(xfer).unwrap();
}

// Scenario: a second start on the same transfer object blocks until the
// first in-flight use completes.
#[test]
fn test_one_in_flight_use_per_transfer_object() {
    let (sim, dma) = open_dma(test_options());
    let channel = dma.open_channel(1).unwrap();

    let dst = AlignedBuf::new(2 * TEST_BUF_SIZE);
    let xfer = channel.transfer_init().unwrap();
    xfer.set_dst(dst.addr()).unwrap();
    xfer.set_len(TEST_BUF_SIZE as u64).unwrap();
    xfer.set_transfer_type(TransferType::FpgaStToHostMm).unwrap();
    xfer.set_rx_control(RxControl::EndOnEop).unwrap();

    // No stream data yet: the first start parks in the worker.
    let xfer2 = Arc::clone(&xfer);
    let channel2 = Arc::clone(&channel);
    let dst2_addr = dst.addr() + TEST_BUF_SIZE as u64;
    let first = thread::spawn(move || channel2.start(&xfer2));

    thread::sleep(Duration::from_millis(50));
    assert!(!first.is_finished(), "first start should still be in flight");

    // Second use of the same object blocks on the in-flight claim.
    let xfer3 = Arc::clone(&xfer);
    let channel3 = Arc::clone(&channel);
    let second = thread::spawn(move || {
        xfer3.set_dst(dst2_addr).unwrap();
        channel3.start(&xfer3)
    });
    thread::sleep(Duration::from_millis(50));
    assert!(!second.is_finished(), "second start must wait for the first");

    // Release both uses: one packet each.
    sim.push_stream(1, &pattern(TEST_BUF_SIZE), true);
    first.join().unwrap().unwrap();
    sim.push_stream(1, &pattern(TEST_BUF_SIZE), true);
    second.join().unwrap().unwrap();
}

#[test]
fn test_small_transfer_fast_path() {
    let (sim, dma) = open_dma(test_options());
    let channel = dma.open_channel(2).unwrap();

    let xfer = channel.transfer_init_small(256).unwrap();
    let (ptr, size) = xfer.small_buffer().unwrap().unwrap();
    assert!(size >= 256);

    // Fill the pinned buffer in place; the engine skips the bounce copy.
    let data = pattern(256);
    // SAFETY: the attached buffer is at least `size` bytes.
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, 256) };

    xfer.set_src(ptr as u64).unwrap();
    xfer.set_dst(0x3000).unwrap();
    xfer.set_len(256).unwrap();
    xfer.set_transfer_type(TransferType::HostToFpgaMm).unwrap();
    channel.start(&xfer).unwrap();

    assert_eq!(sim.read_device_mem(0x3000, 256), data);
    channel.transfer_destroy(xfer).unwrap();
}

#[test]
fn test_zero_length_transfer_completes() {
    let (sim, dma) = open_dma(test_options());
    let rx = dma.open_channel(1).unwrap();

    let dst = AlignedBuf::new(64);
    let xfer = rx.transfer_init().unwrap();
    xfer.set_dst(dst.addr()).unwrap();
    xfer.set_len(0).unwrap();
    xfer.set_transfer_type(TransferType::FpgaStToHostMm).unwrap();

    let writes_before = sim.mmio_write_count();
    rx.start(&xfer).unwrap();
    assert_eq!(xfer.bytes_transferred().unwrap(), 0);
    // Only the streaming valve gets programmed; no descriptors.
    assert_eq!(sim.descriptors_issued(1), 0);
    assert!(sim.mmio_write_count() > writes_before);
}

// Repeated transfers reuse the pool's pinned buffers instead of pinning
// fresh ones.
#[test]
fn test_pool_buffers_reused_across_transfers() {
    let (sim, dma) = open_dma(test_options());
    let channel = dma.open_channel(2).unwrap();

    let mut src = AlignedBuf::new(4 * TEST_BUF_SIZE);
    src.as_mut_slice().copy_from_slice(&pattern(4 * TEST_BUF_SIZE));

    let xfer = channel.transfer_init().unwrap();
    xfer.set_src(src.addr()).unwrap();
    xfer.set_dst(0x1000).unwrap();
    xfer.set_len(4 * TEST_BUF_SIZE as u64).unwrap();
    xfer.set_transfer_type(TransferType::HostToFpgaMm).unwrap();

    for _ in 0..10 {
        channel.start(&xfer).unwrap();
    }

    let stats = dma.pool().stats(PoolKind::Buffer);
    // One bounce set for the MM engine, pinned once and recycled.
    assert_eq!(stats.created, 4);
    drop(sim);
}
