// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Controller and channel management: enumeration over the device feature
//! list, per-channel worker threads, transfer submission, and the
//! completion thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::{DmaError, DmaResult};
use crate::m2m::M2mEngine;
use crate::m2s::M2sEngine;
use crate::mmio::{self, BufferPinner, FpgaPlatform, RegisterAccess};
use crate::pool::ResourcePool;
use crate::queue::TransferQueue;
use crate::regs::{
    self, dfh_eol, dfh_is_bbb, dfh_next, CsrControl, MsgdmaExtDescriptor, DMA_BUF_SIZE,
    DMA_MAX_INFLIGHT, DMA_MAX_SMALL_BUFFERS, M2M_DMA_UUID_H, M2M_DMA_UUID_L, M2S_DMA_UUID_H,
    M2S_DMA_UUID_L, S2M_DMA_UUID_H, S2M_DMA_UUID_L,
};
use crate::s2m::S2mEngine;
use crate::sync::Semaphore;
use crate::transfer::{ChannelType, DmaTransfer, RxControl, TransferType, TxControl};

/// How long to wait for a spawned worker thread to report alive.
const THREAD_START_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on feature-list length, against malformed headers.
const DFH_WALK_LIMIT: usize = 256;

/// Driver configuration. The defaults match the shipping IP
/// configuration; `buffer_size` must agree with the DMA IP's
/// maximum-transfer setting.
#[derive(Debug, Clone)]
pub struct DmaOptions {
    /// Granularity of one descriptor / pinned pool buffer, in bytes.
    pub buffer_size: usize,
    /// Capacity of each channel's request queue.
    pub queue_depth: usize,
    /// Flush outstanding RX descriptors when a transfer ends on EOP,
    /// instead of carrying them over to the next same-mode transfer.
    pub force_desc_flush: bool,
    /// How long one enqueue attempt waits for queue space before
    /// reporting Busy to the retry loop.
    pub enqueue_timeout: Duration,
}

impl Default for DmaOptions {
    fn default() -> Self {
        Self {
            buffer_size: DMA_BUF_SIZE,
            queue_depth: DMA_MAX_INFLIGHT,
            force_desc_flush: true,
            enqueue_timeout: Duration::from_millis(10),
        }
    }
}

/// One discovered DMA channel: its type and register bases.
#[derive(Debug, Clone, Copy)]
pub struct ChannelDesc {
    pub index: u32,
    pub ch_type: ChannelType,
    pub dma_base: u64,
    pub csr_base: u64,
    pub desc_base: u64,
    pub rsp_base: u64,
    pub valve_base: u64,
}

impl ChannelDesc {
    pub(crate) fn new(index: u32, ch_type: ChannelType, dma_base: u64) -> Self {
        Self {
            index,
            ch_type,
            dma_base,
            csr_base: dma_base + regs::DMA_CSR,
            desc_base: dma_base + regs::DMA_DESC,
            rsp_base: dma_base + regs::DMA_RESPONSE,
            valve_base: dma_base + regs::DMA_STREAMING_VALVE,
        }
    }
}

/// Register-access bundle handed to a channel's engine.
pub(crate) struct ChannelHw {
    pub regs: Arc<dyn RegisterAccess>,
    pub csr_base: u64,
    pub desc_base: u64,
    pub rsp_base: u64,
    pub valve_base: u64,
    #[cfg(target_os = "linux")]
    pub irq: Option<mmio::InterruptEvent>,
}

impl ChannelHw {
    pub(crate) fn new(regs: Arc<dyn RegisterAccess>, desc: &ChannelDesc) -> Self {
        Self {
            regs,
            csr_base: desc.csr_base,
            desc_base: desc.desc_base,
            rsp_base: desc.rsp_base,
            valve_base: desc.valve_base,
            #[cfg(target_os = "linux")]
            irq: None,
        }
    }

    pub(crate) fn send_descriptor(&self, desc: &MsgdmaExtDescriptor) -> DmaResult<()> {
        mmio::send_descriptor(&*self.regs, self.csr_base, self.desc_base, desc)
    }

    pub(crate) fn write_control(&self, control: CsrControl) -> DmaResult<()> {
        self.regs
            .write32(self.csr_base + regs::csr::CONTROL, control.bits())
    }

    /// Wait for a completion interrupt. In polling configurations (no
    /// interrupt source attached) this returns immediately; the engines
    /// spin on the response fill level instead.
    pub(crate) fn poll_interrupt(&self) -> DmaResult<()> {
        #[cfg(target_os = "linux")]
        if let Some(irq) = &self.irq {
            return irq.wait(-1);
        }
        Ok(())
    }
}

fn uuid_channel_type(uuid_lo: u64, uuid_hi: u64) -> Option<ChannelType> {
    if uuid_lo == M2S_DMA_UUID_L && uuid_hi == M2S_DMA_UUID_H {
        Some(ChannelType::TxSt)
    } else if uuid_lo == S2M_DMA_UUID_L && uuid_hi == S2M_DMA_UUID_H {
        Some(ChannelType::RxSt)
    } else if uuid_lo == M2M_DMA_UUID_L && uuid_hi == M2M_DMA_UUID_H {
        Some(ChannelType::Mm)
    } else {
        None
    }
}

/// Walk the device feature list and record every DMA BBB found.
fn enumerate_channels_int(regs: &dyn RegisterAccess) -> DmaResult<Vec<ChannelDesc>> {
    let mut descs = Vec::new();
    let mut offset = 0u64;

    for _ in 0..DFH_WALK_LIMIT {
        let dfh = regs.read64(offset)?;
        let uuid_lo = regs.read64(offset + 8)?;
        let uuid_hi = regs.read64(offset + 16)?;

        if dfh_is_bbb(dfh) {
            if let Some(ch_type) = uuid_channel_type(uuid_lo, uuid_hi) {
                descs.push(ChannelDesc::new(descs.len() as u32, ch_type, offset));
            }
        }

        if dfh_eol(dfh) {
            return Ok(descs);
        }
        let next = dfh_next(dfh);
        if next == 0 {
            log::warn!("feature header at {offset:#x} has zero next-offset");
            return Ok(descs);
        }
        offset += next;
    }

    log::warn!("device feature list longer than {DFH_WALK_LIMIT} entries");
    Ok(descs)
}

/// An open DMA channel with its dedicated worker thread.
pub struct DmaChannel {
    desc: ChannelDesc,
    pool: Arc<ResourcePool>,
    request_q: Arc<TransferQueue<Arc<DmaTransfer>>>,
    opts: DmaOptions,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    small_count: Arc<AtomicUsize>,
}

impl DmaChannel {
    /// Channel type discovered at enumeration.
    pub fn channel_type(&self) -> ChannelType {
        self.desc.ch_type
    }

    pub fn index(&self) -> u32 {
        self.desc.index
    }

    /// Allocate a transfer object bound to this channel, borrowing its
    /// mutex and semaphore from the pool.
    pub fn transfer_init(&self) -> DmaResult<Arc<DmaTransfer>> {
        Ok(Arc::new(DmaTransfer::new(&self.pool, self.desc.ch_type)?))
    }

    /// Allocate a transfer with one pinned buffer attached. The caller
    /// reads/writes the returned buffer directly and the MM engine skips
    /// the bounce copy. `size` may not exceed the pool buffer size.
    pub fn transfer_init_small(&self, size: usize) -> DmaResult<Arc<DmaTransfer>> {
        if size == 0 || size > self.pool.buffer_size() {
            return Err(DmaError::InvalidParam("invalid small-transfer size"));
        }
        if self.small_count.load(Ordering::SeqCst) >= DMA_MAX_SMALL_BUFFERS {
            log::error!("too many small transfers allocated");
            return Err(DmaError::NoMemory("small-transfer budget exhausted"));
        }

        let xfer = self.transfer_init()?;
        let buf = match self.pool.get_buffer() {
            Ok(buf) => buf,
            Err(e) => {
                Arc::clone(&xfer).destroy(&self.pool)?;
                return Err(e);
            }
        };
        self.small_count.fetch_add(1, Ordering::SeqCst);
        {
            let mut inner = xfer
                .inner
                .lock
                .lock()
                .map_err(|_| DmaError::Exception("transfer mutex poisoned"))?;
            inner.attached.push(buf);
        }
        Ok(xfer)
    }

    /// Tear down a transfer, returning its pooled resources. Fails with
    /// `Busy` while the transfer is in flight.
    pub fn transfer_destroy(&self, xfer: Arc<DmaTransfer>) -> DmaResult<()> {
        let attached = {
            let inner = xfer
                .inner
                .lock
                .lock()
                .map_err(|_| DmaError::Exception("transfer mutex poisoned"))?;
            inner.attached.len()
        };
        xfer.destroy(&self.pool)?;
        if attached > 0 {
            self.small_count.fetch_sub(attached, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Submit a transfer. Blocks until a prior in-flight use of the same
    /// object completes, then enqueues it for the worker thread. Without
    /// a callback the call further blocks until the transfer finishes;
    /// with one it returns immediately and the callback fires from the
    /// completion thread.
    pub fn start(&self, xfer: &Arc<DmaTransfer>) -> DmaResult<()> {
        let (ty, tx_ctrl, rx_ctrl, len, has_cb) = {
            let inner = xfer
                .inner
                .lock
                .lock()
                .map_err(|_| DmaError::Exception("transfer mutex poisoned"))?;
            (
                inner.transfer_type,
                inner.tx_ctrl,
                inner.rx_ctrl,
                inner.len,
                inner.callback.is_some(),
            )
        };

        if matches!(
            ty,
            TransferType::FpgaMmToFpgaSt | TransferType::FpgaStToFpgaMm
        ) {
            log::error!("transfer type {ty:?} unsupported");
            return Err(DmaError::NotSupported("local-memory streaming transfer"));
        }

        if xfer.channel_type() != self.desc.ch_type {
            log::error!("transfer was initialized on a different channel type");
            return Err(DmaError::InvalidParam("transfer/channel type mismatch"));
        }

        let compatible = match self.desc.ch_type {
            ChannelType::TxSt => ty == TransferType::HostMmToFpgaSt,
            ChannelType::RxSt => ty == TransferType::FpgaStToHostMm,
            ChannelType::Mm => matches!(
                ty,
                TransferType::HostToFpgaMm
                    | TransferType::FpgaToHostMm
                    | TransferType::FpgaToFpgaMm
            ),
        };
        if !compatible {
            log::error!("incompatible transfer {ty:?} on {:?} channel", self.desc.ch_type);
            return Err(DmaError::InvalidParam("incompatible transfer for channel"));
        }

        // Deterministic (no-packet) streaming requires whole bursts.
        let no_packet = (tx_ctrl == TxControl::NoPacket && self.desc.ch_type == ChannelType::TxSt)
            || (rx_ctrl == RxControl::NoPacket && self.desc.ch_type == ChannelType::RxSt);
        if no_packet && len % regs::DMA_ALIGN_BYTES != 0 {
            log::error!("no-packet transfer length not a burst multiple");
            return Err(DmaError::InvalidParam(
                "no-packet transfer length must be a multiple of 64",
            ));
        }

        // Claim the transfer object; blocks while a previous use is still
        // in flight.
        xfer.status_sem.sem.wait()?;

        loop {
            match self
                .request_q
                .enqueue_timeout(Arc::clone(xfer), self.opts.enqueue_timeout)
            {
                Ok(()) => break,
                Err(DmaError::Busy(_)) => continue,
                Err(e) => {
                    log::error!("enqueue failed: {e}");
                    if let Err(e) = xfer.status_sem.sem.post() {
                        log::error!("semaphore post failed: {e}");
                    }
                    return Err(DmaError::Exception("transfer enqueue failed"));
                }
            }
        }

        // Blocking transfer: wait for completion, then immediately
        // restore the not-in-progress token so the object is reusable.
        if !has_cb {
            xfer.status_sem.sem.wait()?;
            xfer.status_sem.sem.post()?;
        }

        Ok(())
    }
}

fn worker_loop(
    request_q: &TransferQueue<Arc<DmaTransfer>>,
    complete_q: &TransferQueue<Arc<DmaTransfer>>,
    mut run: impl FnMut(&Arc<DmaTransfer>) -> DmaResult<()>,
) {
    loop {
        let xfer = match request_q.dequeue() {
            Ok(x) => x,
            Err(DmaError::NoAccess) => {
                log::debug!("worker thread termination");
                break;
            }
            Err(e) => {
                log::error!("dequeue failed: {e}");
                return;
            }
        };

        // A failed transfer is logged and completed with whatever byte
        // count it reached; the worker moves on to the next request.
        if let Err(e) = run(&xfer) {
            log::error!("transfer processing failed: {e}");
        }

        loop {
            match complete_q.enqueue_timeout(Arc::clone(&xfer), Duration::from_millis(10)) {
                Ok(()) => break,
                Err(DmaError::Busy(_)) => continue,
                Err(e) => {
                    // Completion queue gone; unblock the submitter here.
                    log::error!("completion enqueue failed: {e}");
                    if let Err(e) = xfer.status_sem.sem.post() {
                        log::error!("semaphore post failed: {e}");
                    }
                    break;
                }
            }
        }
    }
}

fn completion_loop(complete_q: &TransferQueue<Arc<DmaTransfer>>) {
    loop {
        let xfer = match complete_q.dequeue() {
            Ok(x) => x,
            Err(DmaError::NoAccess) => {
                log::debug!("completion thread termination");
                break;
            }
            Err(e) => {
                log::error!("completion dequeue failed: {e}");
                break;
            }
        };

        let status = match xfer.snapshot() {
            Ok(s) => s,
            Err(e) => {
                log::error!("completion snapshot failed: {e}");
                continue;
            }
        };

        // Run the callback outside the transfer mutex so it may inspect
        // the transfer, then reinstall it for the next use.
        let cb = xfer
            .inner
            .lock
            .lock()
            .ok()
            .and_then(|mut inner| inner.callback.take());
        if let Some(mut cb) = cb {
            cb(status);
            if let Ok(mut inner) = xfer.inner.lock.lock() {
                inner.callback = Some(cb);
            }
        }

        if let Err(e) = xfer.status_sem.sem.post() {
            log::error!("semaphore post failed: {e}");
        }
    }
}

/// The DMA controller: discovered channels, the shared resource pool, and
/// the completion thread.
pub struct StreamingDma {
    regs: Arc<dyn RegisterAccess>,
    pool: Arc<ResourcePool>,
    opts: DmaOptions,
    pinner: Arc<dyn BufferPinner>,
    chan_descs: Vec<ChannelDesc>,
    open_channels: Mutex<Vec<Option<Arc<DmaChannel>>>>,
    complete_q: Arc<TransferQueue<Arc<DmaTransfer>>>,
    completion_thread: Mutex<Option<thread::JoinHandle<()>>>,
    small_count: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl StreamingDma {
    /// Open the DMA feature with default options.
    pub fn open<P>(platform: Arc<P>) -> DmaResult<Self>
    where
        P: FpgaPlatform + 'static,
    {
        Self::open_with(platform, DmaOptions::default())
    }

    /// Open the DMA feature: enumerate channels, start the completion
    /// thread, and set up the resource pool.
    pub fn open_with<P>(platform: Arc<P>, opts: DmaOptions) -> DmaResult<Self>
    where
        P: FpgaPlatform + 'static,
    {
        let regs: Arc<dyn RegisterAccess> = Arc::clone(&platform) as Arc<dyn RegisterAccess>;
        let pinner: Arc<dyn BufferPinner> = platform as Arc<dyn BufferPinner>;

        let chan_descs = enumerate_channels_int(&*regs)?;
        if chan_descs.is_empty() {
            log::error!("no DMA channels found in the device feature list");
            return Err(DmaError::NotFound("no DMA channels"));
        }

        let pool = Arc::new(ResourcePool::new(Arc::clone(&pinner), opts.buffer_size));
        let complete_q = Arc::new(TransferQueue::with_capacity(opts.queue_depth));

        let alive = Arc::new(Semaphore::new(0));
        let completion_thread = {
            let cq = Arc::clone(&complete_q);
            let alive = Arc::clone(&alive);
            thread::Builder::new()
                .name("dma-complete".into())
                .spawn(move || {
                    if let Err(e) = alive.post() {
                        log::error!("alive post failed: {e}");
                    }
                    completion_loop(&cq);
                })
                .map_err(|_| DmaError::Exception("failed to spawn completion thread"))?
        };
        if !alive.wait_timeout(THREAD_START_TIMEOUT)? {
            complete_q.close();
            return Err(DmaError::Exception("completion thread startup timeout"));
        }

        let num = chan_descs.len();
        Ok(Self {
            regs,
            pool,
            opts,
            pinner,
            chan_descs,
            open_channels: Mutex::new(vec![None; num]),
            complete_q,
            completion_thread: Mutex::new(Some(completion_thread)),
            small_count: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    /// The channels discovered at open.
    pub fn enumerate_channels(&self) -> &[ChannelDesc] {
        &self.chan_descs
    }

    /// Shared resource pool (pool statistics are exposed for tests and
    /// diagnostics).
    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Open a channel by index and start its worker thread.
    pub fn open_channel(&self, index: u32) -> DmaResult<Arc<DmaChannel>> {
        let desc = *self
            .chan_descs
            .get(index as usize)
            .ok_or(DmaError::InvalidParam("invalid channel index"))?;

        let mut open = self
            .open_channels
            .lock()
            .map_err(|_| DmaError::Exception("channel table lock poisoned"))?;
        if open[index as usize].is_some() {
            log::error!("attempt to open a channel that is already open");
            return Err(DmaError::Busy("channel already open"));
        }

        let hw = Arc::new(ChannelHw::new(Arc::clone(&self.regs), &desc));
        hw.write_control(CsrControl::GLOBAL_INTR_EN)?;

        let request_q = Arc::new(TransferQueue::with_capacity(self.opts.queue_depth));
        let alive = Arc::new(Semaphore::new(0));

        let worker = {
            let hw = Arc::clone(&hw);
            let pool = Arc::clone(&self.pool);
            let opts = self.opts.clone();
            let pinner = Arc::clone(&self.pinner);
            let rq = Arc::clone(&request_q);
            let cq = Arc::clone(&self.complete_q);
            let alive = Arc::clone(&alive);
            let name = format!("dma-{:?}-{}", desc.ch_type, desc.index);

            thread::Builder::new()
                .name(name)
                .spawn(move || match desc.ch_type {
                    ChannelType::RxSt => match S2mEngine::new(hw, pool, opts) {
                        Ok(mut engine) => {
                            let _ = alive.post();
                            worker_loop(&rq, &cq, |x| engine.run(x));
                        }
                        Err(e) => log::error!("S2M engine startup failed: {e}"),
                    },
                    ChannelType::TxSt => match M2sEngine::new(hw, pool, opts) {
                        Ok(mut engine) => {
                            let _ = alive.post();
                            worker_loop(&rq, &cq, |x| engine.run(x));
                        }
                        Err(e) => log::error!("M2S engine startup failed: {e}"),
                    },
                    ChannelType::Mm => match M2mEngine::new(hw, pool, opts, pinner) {
                        Ok(mut engine) => {
                            let _ = alive.post();
                            worker_loop(&rq, &cq, |x| engine.run(x));
                        }
                        Err(e) => log::error!("MM engine startup failed: {e}"),
                    },
                })
                .map_err(|_| DmaError::Exception("failed to spawn worker thread"))?
        };

        if !alive.wait_timeout(THREAD_START_TIMEOUT)? {
            request_q.close();
            let _ = worker.join();
            return Err(DmaError::Exception("worker thread startup timeout"));
        }

        let channel = Arc::new(DmaChannel {
            desc,
            pool: Arc::clone(&self.pool),
            request_q,
            opts: self.opts.clone(),
            worker: Mutex::new(Some(worker)),
            small_count: Arc::clone(&self.small_count),
        });
        open[index as usize] = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Close an open channel: stop its worker and disable its interrupts.
    pub fn close_channel(&self, index: u32) -> DmaResult<()> {
        let channel = {
            let mut open = self
                .open_channels
                .lock()
                .map_err(|_| DmaError::Exception("channel table lock poisoned"))?;
            open.get_mut(index as usize)
                .and_then(Option::take)
                .ok_or_else(|| {
                    log::error!("attempt to close a DMA channel that was not open");
                    DmaError::InvalidParam("channel not open")
                })?
        };

        channel.request_q.close();
        if let Ok(mut worker) = channel.worker.lock() {
            if let Some(handle) = worker.take() {
                if handle.join().is_err() {
                    log::error!("worker thread panicked");
                }
            }
        }

        // Turn the channel's global interrupts back off.
        let hw = ChannelHw::new(Arc::clone(&self.regs), &channel.desc);
        hw.write_control(CsrControl::empty())?;
        Ok(())
    }

    /// Shut everything down: channels, completion thread, pooled
    /// resources. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let indices: Vec<u32> = self
            .open_channels
            .lock()
            .map(|open| {
                open.iter()
                    .enumerate()
                    .filter_map(|(i, c)| c.as_ref().map(|_| i as u32))
                    .collect()
            })
            .unwrap_or_default();
        for index in indices {
            if let Err(e) = self.close_channel(index) {
                log::error!("closing channel {index}: {e}");
            }
        }

        self.complete_q.close();
        if let Ok(mut th) = self.completion_thread.lock() {
            if let Some(handle) = th.take() {
                if handle.join().is_err() {
                    log::error!("completion thread panicked");
                }
            }
        }

        self.pool.destroy_all(false);
    }
}

impl Drop for StreamingDma {
    fn drop(&mut self) {
        self.close();
    }
}
