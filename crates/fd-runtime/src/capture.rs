//! Timestamp capture pipeline.
//!
//! The hardware FIFO is drained into a [`RingBuffer`] either by a periodic
//! timer (polled mode) or by the "buffer not empty" interrupt (interrupt
//! mode). Delivery is the deferred half: it pops raw samples in arrival
//! order, normalizes them, applies the input offsets and checks sequence
//! continuity. Consumers pull delivered stamps through a [`TimestampStream`].
//!
//! ```text
//!  TSBR FIFO ──drain()──▶ RingBuffer ──deliver()──▶ TimestampStream
//!   (timer / irq)          (overflow: drop oldest half)
//! ```

use crate::periodic::PeriodicWorker;
use crate::ring::{PushStatus, RingBuffer};
use fd_common::{
    normalize, BoardConfig, CaptureMetrics, CaptureMode, CaptureSnapshot, FdResult, RawSample,
    TimeValue,
};
use fd_hw::regs;
use fd_hw::RegisterAccess;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Longest single wait inside a blocking stream read.
const STREAM_WAIT: Duration = Duration::from_millis(100);

/// A discontinuity in the hardware sequence ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceGap {
    /// Last id seen before the gap.
    pub after: u16,
    /// First id seen after the gap.
    pub before: u16,
    /// Ids missing in between.
    pub lost: u16,
}

/// Detects gaps between successive sequence ids, modulo 65536.
///
/// Ids are compared only within one capture epoch. The hardware numbering
/// restarts when the timestamp unit is re-armed, so the first id of a new
/// epoch is never a gap.
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    last: Option<u16>,
    epoch: u32,
}

impl SequenceTracker {
    /// Create a tracker that has seen nothing yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seq` and report the gap since the previous id, if any.
    pub fn observe(&mut self, seq: u16) -> Option<SequenceGap> {
        let gap = self.last.and_then(|prev| {
            let lost = seq.wrapping_sub(prev).wrapping_sub(1);
            (lost != 0).then_some(SequenceGap {
                after: prev,
                before: seq,
                lost,
            })
        });
        self.last = Some(seq);
        gap
    }

    /// Record `seq` captured during `epoch`.
    pub fn observe_in(&mut self, epoch: u32, seq: u16) -> Option<SequenceGap> {
        if epoch != self.epoch {
            self.epoch = epoch;
            self.last = None;
        }
        self.observe(seq)
    }

    /// Forget the last id, e.g. after the hardware numbering was restarted.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// A drained sample tagged with the capture epoch it was read in.
#[derive(Debug, Default, Clone, Copy)]
struct Captured {
    raw: RawSample,
    epoch: u32,
}

/// One delivered timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Delivery {
    /// Normalized, offset-corrected stamp tagged with channel and sequence id.
    pub stamp: TimeValue,
    /// Gap detected just before this stamp.
    pub gap: Option<SequenceGap>,
}

/// State shared by the drain path, the delivery path and the handles.
struct CaptureCore {
    regs: Arc<dyn RegisterAccess>,
    ring: RingBuffer<Captured>,
    metrics: CaptureMetrics,
    tdc_zero_ps: i64,
    tdc_user_ps: AtomicI64,
    /// Bumped on every start; samples from earlier epochs may still be buffered.
    epoch: AtomicU32,
    /// Held across pop and check so concurrent consumers see ids in order.
    sequence: Mutex<SequenceTracker>,
}

impl CaptureCore {
    fn sequence(&self) -> MutexGuard<'_, SequenceTracker> {
        self.sequence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_sample(&self) -> RawSample {
        let sech = self.regs.read32(regs::TSBR_SECH);
        let secl = self.regs.read32(regs::TSBR_SECL);
        let cycles = self.regs.read32(regs::TSBR_CYCLES);
        let fid = self.regs.read32(regs::TSBR_FID);
        RawSample {
            utc: (i64::from(sech & 0xff) << 32) | i64::from(secl),
            coarse: cycles & 0x0fff_ffff,
            frac: regs::fid_fine(fid),
            channel: regs::fid_channel(fid),
            seq: regs::fid_seq(fid),
        }
    }

    /// Move every buffered hardware sample into the ring.
    fn drain(&self) -> usize {
        // a stuck EMPTY flag must not spin forever
        let budget = self.ring.capacity() * 2;
        let epoch = self.epoch.load(Ordering::Acquire);
        let mut drained = 0;

        while drained < budget && self.regs.read32(regs::TSBCR) & regs::TSBCR_EMPTY == 0 {
            self.regs.write32(regs::TSBR_ADVANCE, regs::TSBR_ADVANCE_ADV);
            let raw = self.read_sample();
            trace!(seq = raw.seq, channel = raw.channel, "drained timestamp");

            if let PushStatus::Overflowed { dropped } = self.ring.push(Captured { raw, epoch }) {
                self.metrics.record_overflow(dropped);
                warn!(
                    dropped,
                    total_dropped = self.metrics.dropped(),
                    "timestamp ring overflow"
                );
            }
            drained += 1;
        }

        if drained > 0 {
            self.metrics.record_drained(drained as u64);
        }
        drained
    }

    fn finish(&self, sample: Captured, tracker: &mut SequenceTracker) -> Delivery {
        let Captured { raw, epoch } = sample;
        let stamp = normalize(raw)
            .apply_offset(self.tdc_zero_ps.saturating_neg())
            .apply_offset(self.tdc_user_ps.load(Ordering::Relaxed));

        let gap = tracker.observe_in(epoch, raw.seq);
        if let Some(g) = gap {
            self.metrics.record_gap(u64::from(g.lost));
            warn!(after = g.after, before = g.before, lost = g.lost, "timestamp sequence gap");
        }
        self.metrics.record_delivered();
        Delivery { stamp, gap }
    }

    fn deliver(&self) -> Option<Delivery> {
        let mut tracker = self.sequence();
        let sample = self.ring.pop()?;
        Some(self.finish(sample, &mut tracker))
    }

    fn deliver_timeout(&self, timeout: Duration) -> Option<Delivery> {
        let mut tracker = self.sequence();
        let sample = self.ring.pop_timeout(timeout)?;
        Some(self.finish(sample, &mut tracker))
    }

    fn interrupt_enabled(&self) -> bool {
        self.regs.read32(regs::EIC_IMR) & regs::EIC_TS_BUF_NOTEMPTY != 0
    }
}

/// Drives the capture pipeline for one board.
pub struct CaptureScheduler {
    core: Arc<CaptureCore>,
    mode: CaptureMode,
    poller: PeriodicWorker,
    running: bool,
}

impl std::fmt::Debug for CaptureScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureScheduler")
            .field("mode", &self.mode)
            .field("running", &self.running)
            .field("buffered", &self.core.ring.len())
            .finish_non_exhaustive()
    }
}

impl CaptureScheduler {
    /// Allocate the ring and prepare a stopped pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`fd_common::FdError::Config`] if the ring capacity is invalid.
    pub fn new(regs: Arc<dyn RegisterAccess>, config: &BoardConfig) -> FdResult<Self> {
        let ring = RingBuffer::new(config.ring_capacity)?;
        Ok(Self {
            core: Arc::new(CaptureCore {
                regs,
                ring,
                metrics: CaptureMetrics::new(),
                tdc_zero_ps: config.offsets.tdc_zero_ps,
                tdc_user_ps: AtomicI64::new(config.offsets.tdc_user_ps),
                epoch: AtomicU32::new(0),
                sequence: Mutex::new(SequenceTracker::new()),
            }),
            mode: config.capture.mode,
            poller: PeriodicWorker::new("fd-capture-poll", config.capture.poll_interval),
            running: false,
        })
    }

    /// Enable the trigger input and start draining. Idempotent.
    ///
    /// Opens a new sequence epoch: samples still buffered from before keep
    /// their old numbering and are delivered without a spurious gap.
    ///
    /// # Errors
    ///
    /// Returns [`fd_common::FdError::Config`] if the poll thread cannot start.
    pub fn start(&mut self) -> FdResult<()> {
        if self.running {
            return Ok(());
        }
        let epoch = self.core.epoch.fetch_add(1, Ordering::AcqRel).wrapping_add(1);

        match self.mode {
            CaptureMode::Polled => {
                let core = Arc::clone(&self.core);
                self.poller.start(move || {
                    core.drain();
                })?;
            }
            CaptureMode::Interrupt => {
                self.core
                    .regs
                    .write32(regs::EIC_IER, regs::EIC_TS_BUF_NOTEMPTY);
            }
        }
        self.core.regs.set_bits(regs::GCR, regs::GCR_INPUT_EN);
        self.running = true;
        info!(
            mode = ?self.mode,
            capacity = self.core.ring.capacity(),
            epoch,
            "Capture started"
        );
        Ok(())
    }

    /// Disable the input, stop the drain source and drain what is left.
    /// Idempotent.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.core.regs.clear_bits(regs::GCR, regs::GCR_INPUT_EN);
        match self.mode {
            CaptureMode::Polled => self.poller.stop(),
            CaptureMode::Interrupt => {
                self.core
                    .regs
                    .write32(regs::EIC_IDR, regs::EIC_TS_BUF_NOTEMPTY);
            }
        }
        let tail = self.core.drain();
        self.running = false;
        info!(final_drain = tail, "Capture stopped");
    }

    /// Stop and close the ring. Open streams end once they have read what
    /// was buffered.
    pub fn release(&mut self) {
        self.stop();
        self.core.ring.close();
        debug!(buffered = self.core.ring.len(), "Capture ring released");
    }

    /// Drain the hardware FIFO now. Returns the number of samples moved.
    pub fn drain(&self) -> usize {
        self.core.drain()
    }

    /// Deliver the oldest buffered sample, if any.
    pub fn deliver(&self) -> Option<Delivery> {
        self.core.deliver()
    }

    /// Deliver the oldest sample, waiting up to `timeout` for one.
    pub fn deliver_timeout(&self, timeout: Duration) -> Option<Delivery> {
        self.core.deliver_timeout(timeout)
    }

    /// A consumer handle over delivered stamps.
    pub fn stream(&self) -> TimestampStream {
        TimestampStream {
            core: Arc::clone(&self.core),
        }
    }

    /// Handle used by the interrupt source to run the top half.
    pub fn interrupt_line(&self) -> InterruptLine {
        InterruptLine {
            core: Arc::clone(&self.core),
        }
    }

    /// Whether undelivered samples are waiting.
    pub fn is_ready(&self) -> bool {
        !self.core.ring.is_empty()
    }

    /// Whether capture is enabled.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Drain source.
    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Samples buffered in the ring.
    pub fn buffered(&self) -> usize {
        self.core.ring.len()
    }

    /// Change the user input offset, in picoseconds.
    pub fn set_user_offset(&self, ps: i64) {
        self.core.tdc_user_ps.store(ps, Ordering::Relaxed);
    }

    /// Current user input offset, in picoseconds.
    pub fn user_offset(&self) -> i64 {
        self.core.tdc_user_ps.load(Ordering::Relaxed)
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> CaptureSnapshot {
        self.core.metrics.snapshot()
    }
}

impl Drop for CaptureScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Entry point for the "timestamp buffer not empty" interrupt.
#[derive(Clone)]
pub struct InterruptLine {
    core: Arc<CaptureCore>,
}

impl std::fmt::Debug for InterruptLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptLine").finish_non_exhaustive()
    }
}

impl InterruptLine {
    /// Run the top half: drain the FIFO into the ring and acknowledge.
    ///
    /// Returns false when the source is masked or not pending.
    pub fn fire(&self) -> bool {
        let core = &self.core;
        if !core.interrupt_enabled() {
            return false;
        }
        let isr = core.regs.read32(regs::EIC_ISR);
        if isr & regs::EIC_TS_BUF_NOTEMPTY == 0 {
            return false;
        }
        let n = core.drain();
        core.regs.write32(regs::EIC_ISR, isr);
        trace!(drained = n, "timestamp interrupt");
        true
    }
}

/// Lazily consumed sequence of delivered timestamps.
///
/// Several streams may exist; each stamp goes to exactly one of them. A
/// stream survives capture stop/start and ends once the board releases the
/// ring and the buffered stamps have been read.
#[derive(Clone)]
pub struct TimestampStream {
    core: Arc<CaptureCore>,
}

impl std::fmt::Debug for TimestampStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampStream")
            .field("buffered", &self.core.ring.len())
            .finish()
    }
}

impl TimestampStream {
    /// Next stamp without waiting.
    pub fn try_next(&mut self) -> Option<Delivery> {
        self.core.deliver()
    }

    /// Next stamp, waiting up to `timeout`.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<Delivery> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if let Some(d) = self.core.deliver_timeout((deadline - now).min(STREAM_WAIT)) {
                return Some(d);
            }
            if self.core.ring.is_closed() {
                return None;
            }
        }
    }

    /// Whether the ring was released.
    pub fn is_closed(&self) -> bool {
        self.core.ring.is_closed()
    }
}

impl Iterator for TimestampStream {
    type Item = Delivery;

    /// Blocks until a stamp arrives or the ring is released.
    fn next(&mut self) -> Option<Delivery> {
        loop {
            if let Some(d) = self.core.deliver_timeout(STREAM_WAIT) {
                return Some(d);
            }
            if self.core.ring.is_closed() {
                return None;
            }
        }
    }
}
