// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Basic example driving all three channel kinds against the software
//! device model.
//!
//! Run with: `cargo run --example basic`

use std::sync::Arc;

use msgdma_rust::{
    ChannelType, DmaError, DmaOptions, RxControl, SimDevice, StreamingDma, TransferType, TxControl,
};

#[repr(C, align(64))]
struct Aligned([u8; 8192]);

fn main() -> Result<(), DmaError> {
    println!("FPGA Streaming DMA Basic Example");
    println!("================================\n");

    // A modeled device with one channel of each kind and 1 MiB of
    // device-local memory.
    let device = Arc::new(SimDevice::new(
        &[ChannelType::TxSt, ChannelType::RxSt, ChannelType::Mm],
        1 << 20,
    ));
    let dma = StreamingDma::open_with(
        Arc::clone(&device),
        DmaOptions {
            buffer_size: 4096,
            ..DmaOptions::default()
        },
    )?;

    println!("Discovered channels:");
    for desc in dma.enumerate_channels() {
        println!(
            "  #{} {:?} (csr at {:#x})",
            desc.index, desc.ch_type, desc.csr_base
        );
    }
    println!();

    // Memory-to-memory: push a pattern into device memory and read it back.
    let mm = dma.open_channel(2)?;
    let src = Box::new(Aligned([0xA5; 8192]));
    let mut dst = Box::new(Aligned([0; 8192]));

    let xfer = mm.transfer_init()?;
    xfer.set_src(src.0.as_ptr() as u64)?;
    xfer.set_dst(0x10000)?;
    xfer.set_len(8192)?;
    xfer.set_transfer_type(TransferType::HostToFpgaMm)?;
    mm.start(&xfer)?;
    println!("host -> device: {} bytes", xfer.bytes_transferred()?);

    xfer.reset()?;
    xfer.set_src(0x10000)?;
    xfer.set_dst(dst.0.as_mut_ptr() as u64)?;
    xfer.set_len(8192)?;
    xfer.set_transfer_type(TransferType::FpgaToHostMm)?;
    mm.start(&xfer)?;
    println!(
        "device -> host: {} bytes, data matches: {}",
        xfer.bytes_transferred()?,
        src.0[..] == dst.0[..]
    );
    mm.transfer_destroy(xfer)?;

    // Memory-to-stream: emit one packet.
    let tx = dma.open_channel(0)?;
    let xfer = tx.transfer_init()?;
    xfer.set_src(src.0.as_ptr() as u64)?;
    xfer.set_len(8192)?;
    xfer.set_transfer_type(TransferType::HostMmToFpgaSt)?;
    xfer.set_tx_control(TxControl::GenerateSopAndEop)?;
    tx.start(&xfer)?;
    println!(
        "host -> stream: {} bytes, EOP marks at {:?}",
        xfer.bytes_transferred()?,
        device.eop_marks(0)
    );
    tx.transfer_destroy(xfer)?;

    // Stream-to-memory: receive a packet that ends early on EOP.
    let rx = dma.open_channel(1)?;
    device.push_stream(1, &vec![0x3C; 6000], true);

    let xfer = rx.transfer_init()?;
    xfer.set_dst(dst.0.as_mut_ptr() as u64)?;
    xfer.set_len(8192)?;
    xfer.set_transfer_type(TransferType::FpgaStToHostMm)?;
    xfer.set_rx_control(RxControl::EndOnEop)?;
    rx.start(&xfer)?;
    println!(
        "stream -> host: {} bytes, EOP arrived: {}",
        xfer.bytes_transferred()?,
        xfer.eop_arrived()?
    );
    rx.transfer_destroy(xfer)?;

    println!("\nDone!");
    Ok(())
}
