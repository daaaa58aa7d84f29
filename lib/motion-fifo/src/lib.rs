// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Motion-sensor FIFO with two-phase writes and timestamp spreading.
//!
//! Sensor readings arrive in bursts: one scheduling slice of the motion task
//! can pull several samples per sensor out of hardware, all carrying nearly
//! the same interrupt timestamp. Handing those to the AP as-is produces
//! bunched timestamps that downstream consumers (which assume evenly spaced
//! samples) misinterpret as jitter. So writes happen in two phases:
//!
//! 1. **Stage**: each reading (preceded by a timestamp record when tight
//!    timestamps are on) is appended past the committed tail of the ring,
//!    invisible to the AP.
//! 2. **Commit**: at the end of the scan, if any sensor staged more than one
//!    sample, the batch's timestamps are *spread* -- rewritten so consecutive
//!    samples of a sensor sit one data period apart, where the period is
//!    clamped to the real elapsed window so the rewritten times never run
//!    ahead of the clock. Then the tail advances over the whole batch at
//!    once.
//!
//! `N` is the ring capacity in records and `S` the number of sensors. All
//! state sits behind one mutex on purpose: `requires_spreading` must never
//! be observed disagreeing with `sample_count[]`, and every critical section
//! is index arithmetic only.
//!
//! Timestamps are 32-bit free-running microseconds; every comparison goes
//! through the wrapping helpers in `ec_proto::time`.

#![cfg_attr(not(test), no_std)]

mod ring;

use ec_proto::sensor::{FifoInfo, RecordFlags, SensorRecord, SENSOR_NUM_NONE};
use ec_proto::time::{time_after, time_until};
use ring::StagedRing;
use tracebuf::TraceBuf;

/// Consumer for readings that never reach the AP queue (oversampling
/// filtered) and for committed readings, fed with the best-known timestamp
/// for the sample. Online calibration lives behind this seam.
pub trait CalibrationSink {
    fn process(&mut self, rec: &SensorRecord, timestamp: u32);
}

/// Sink for configurations without online calibration.
pub struct NoCalibration;

impl CalibrationSink for NoCalibration {
    fn process(&mut self, _rec: &SensorRecord, _timestamp: u32) {}
}

/// Out-of-band notifications a sensor can push through the FIFO.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AsyncEvent {
    /// Response marker for a host-requested flush.
    Flush,
    /// The sensor's output data rate changed.
    OdrChange,
}

impl AsyncEvent {
    fn flags(self) -> RecordFlags {
        match self {
            Self::Flush => RecordFlags::FLUSH | RecordFlags::TIMESTAMP,
            Self::OdrChange => RecordFlags::ODR | RecordFlags::TIMESTAMP,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    /// Commit found a batch needing spreading whose first entry is not a
    /// timestamp; the batch was committed unmodified.
    SpreadingSkippedHeadNotTimestamp,
    /// A data record was not directly preceded by a timestamp record; its
    /// timestamp was left alone.
    OutOfOrderEntry,
    /// A data record named a sensor outside the configured set.
    BadSensorNum,
    /// The ring refused a staged write even after eviction.
    StageFailed,
}

/// Per-sensor timestamp predictor: `prev` is the last timestamp handed to
/// the AP for this sensor, `next` the predicted timestamp for its next
/// sample.
#[derive(Copy, Clone, Default)]
struct TimestampState {
    prev: u32,
    next: u32,
}

/// Metadata for the staged region of the ring.
struct StagedMeta<const S: usize> {
    /// Clock captured when the first entry of the batch was staged; upper
    /// bound for spreading.
    read_ts: u32,
    /// Staged data records per sensor.
    sample_count: [u16; S],
    /// True iff some `sample_count[i] > 1`. Kept incrementally consistent
    /// on every stage and eviction.
    requires_spreading: bool,
}

impl<const S: usize> StagedMeta<S> {
    const ZERO: Self = Self {
        read_ts: 0,
        sample_count: [0; S],
        requires_spreading: false,
    };
}

/// Per-sensor configuration and scratch owned by the FIFO.
#[derive(Copy, Clone)]
struct SensorSlot {
    /// Keep 1 of every `oversampling_ratio` samples; 0 drops everything.
    oversampling_ratio: u16,
    /// Modulo counter driving the filter.
    oversampling: u16,
    /// Last accepted reading, for "current value" host queries.
    xyz: [i16; 3],
}

impl SensorSlot {
    const DEFAULT: Self = Self {
        oversampling_ratio: 1,
        oversampling: 0,
        xyz: [0; 3],
    };
}

struct Inner<const N: usize, const S: usize> {
    ring: StagedRing<N>,
    staged: StagedMeta<S>,
    next_ts: [TimestampState; S],
    /// Bitmap of sensors whose `next_ts` holds a real observation.
    next_ts_initialized: u32,
    /// Nominal period from the configured ODR.
    expected_period: [u32; S],
    /// Period actually applied while spreading; recomputed each commit.
    period: [u32; S],
    sensors: [SensorSlot; S],
    total_lost: u16,
    sensor_lost: [u16; S],
    wake_up_needed: bool,
    bypass_needed: bool,
    tablet_mode: bool,
    tight_timestamps: bool,
    trace: TraceBuf<Trace, 8>,
}

/// The motion-sensor FIFO. `N` records of capacity shared by `S` sensors.
pub struct MotionFifo<const N: usize, const S: usize> {
    inner: spin::Mutex<Inner<N, S>>,
}

impl<const N: usize, const S: usize> MotionFifo<N, S> {
    /// `tight_timestamps` selects the mode where every data record is
    /// staged right behind a timestamp record, enabling spreading.
    pub const fn new(tight_timestamps: bool) -> Self {
        const { assert!(S <= 32) };
        Self {
            inner: spin::Mutex::new(Inner {
                ring: StagedRing::new(),
                staged: StagedMeta::ZERO,
                next_ts: [TimestampState { prev: 0, next: 0 }; S],
                next_ts_initialized: 0,
                expected_period: [0; S],
                period: [0; S],
                sensors: [SensorSlot::DEFAULT; S],
                total_lost: 0,
                sensor_lost: [0; S],
                wake_up_needed: false,
                bypass_needed: false,
                tablet_mode: false,
                tight_timestamps,
                trace: TraceBuf::new(),
            }),
        }
    }

    /// Stages one reading, preceded by its timestamp record when tight
    /// timestamps are on. `valid_data` is the number of meaningful axes in
    /// `rec` (0 for activity-style sensors). `time` is the reading's capture
    /// time, `now` the current clock (recorded as the batch's read time when
    /// this is the batch's first entry). Nothing is visible to the AP until
    /// [`Self::commit`].
    pub fn stage_data(
        &self,
        rec: SensorRecord,
        valid_data: usize,
        time: u32,
        now: u32,
        cal: &mut dyn CalibrationSink,
    ) {
        let filtered = {
            let mut g = self.inner.lock();
            if g.tight_timestamps {
                if g.ring.staged_count() == 0 {
                    g.staged.read_ts = now;
                }
                let ts_rec =
                    SensorRecord::new_timestamp(rec.sensor_num(), time);
                let _ = g.stage_unit(ts_rec, 0);
            }
            g.stage_unit(rec, valid_data)
        };
        // The filtered sample still feeds calibration, outside the lock.
        if let Some((rec, timestamp)) = filtered {
            cal.process(&rec, timestamp);
        }
    }

    /// Stages a free-standing timestamp (not tied to a sensor) and commits
    /// immediately.
    pub fn add_timestamp(
        &self,
        timestamp: u32,
        cal: &mut dyn CalibrationSink,
    ) {
        {
            let mut g = self.inner.lock();
            let rec = SensorRecord::new_timestamp(SENSOR_NUM_NONE, timestamp);
            let _ = g.stage_unit(rec, 0);
        }
        self.commit(cal);
    }

    /// Pushes a flush/ODR marker for `sensor_num` and commits immediately.
    pub fn insert_async_event(
        &self,
        sensor_num: u8,
        event: AsyncEvent,
        now: u32,
        cal: &mut dyn CalibrationSink,
    ) {
        {
            let mut g = self.inner.lock();
            let rec = SensorRecord::new_marker(sensor_num, event.flags(), now);
            let _ = g.stage_unit(rec, 0);
        }
        self.commit(cal);
    }

    /// Publishes the staged batch, spreading timestamps first if any sensor
    /// staged more than one sample. Committed records are fed to `cal` with
    /// their final timestamps.
    pub fn commit(&self, cal: &mut dyn CalibrationSink) {
        let mut g = self.inner.lock();
        if g.ring.staged_count() == 0 {
            return;
        }
        g.commit_batch(cal);
    }

    /// True if an evicted or committed record asked to wake the AP.
    pub fn wake_up_needed(&self) -> bool {
        self.inner.lock().wake_up_needed
    }

    /// True if a committed record asked to bypass FIFO batching.
    pub fn bypass_needed(&self) -> bool {
        self.inner.lock().bypass_needed
    }

    /// Clears both needed-flags; called once per scan cycle after the
    /// caller has acted on them.
    pub fn reset_needed_flags(&self) {
        let mut g = self.inner.lock();
        g.wake_up_needed = false;
        g.bypass_needed = false;
    }

    /// Occupancy and loss counters for the AP. `timestamp` is left zero for
    /// the caller to stamp with the dispatcher's last event time. `reset`
    /// clears the loss counters.
    pub fn get_info(&self, reset: bool) -> FifoInfo<S> {
        let mut g = self.inner.lock();
        let info = FifoInfo {
            size: g.ring.capacity() as u16,
            count: g.ring.count() as u16,
            timestamp: 0,
            total_lost: g.total_lost,
            lost: g.sensor_lost,
        };
        if reset {
            g.total_lost = 0;
            g.sensor_lost = [0; S];
        }
        info
    }

    /// Drains up to `out.len()` committed records to the AP.
    pub fn read(&self, out: &mut [SensorRecord]) -> usize {
        self.inner.lock().ring.read_into(out)
    }

    /// Whether committed occupancy crossed the interrupt watermark.
    pub fn over_threshold(&self, threshold: usize) -> bool {
        self.inner.lock().ring.space() < threshold
    }

    /// Committed records currently readable.
    pub fn count(&self) -> usize {
        self.inner.lock().ring.count()
    }

    /// Staged records not yet visible.
    pub fn staged_count(&self) -> usize {
        self.inner.lock().ring.staged_count()
    }

    /// Reconfigures a sensor's nominal data period (µs per sample, from the
    /// ODR) and oversampling ratio. Resets the sensor's timestamp predictor
    /// so the next observed timestamp is taken as ground truth.
    pub fn set_data_period(
        &self,
        sensor_num: usize,
        period_us: u32,
        oversampling_ratio: u16,
    ) {
        let mut g = self.inner.lock();
        if sensor_num >= S {
            return;
        }
        g.expected_period[sensor_num] = period_us;
        g.next_ts_initialized &= !(1 << sensor_num);
        g.sensors[sensor_num].oversampling_ratio = oversampling_ratio;
        g.sensors[sensor_num].oversampling = 0;
    }

    /// Latches the tablet-mode flag onto subsequently staged records.
    pub fn set_tablet_mode(&self, on: bool) {
        self.inner.lock().tablet_mode = on;
    }

    /// Last accepted reading for a sensor.
    pub fn last_reading(&self, sensor_num: usize) -> Option<[i16; 3]> {
        let g = self.inner.lock();
        if sensor_num >= S {
            return None;
        }
        Some(g.sensors[sensor_num].xyz)
    }

    /// Empties the queue and staging area and clears the loss counters and
    /// timestamp predictors. Configured periods and ratios survive.
    pub fn reset(&self) {
        let mut g = self.inner.lock();
        g.ring.clear();
        g.staged = StagedMeta::ZERO;
        g.next_ts_initialized = 0;
        g.total_lost = 0;
        g.sensor_lost = [0; S];
    }

    /// Most recent trace event, for diagnostics and tests.
    pub fn last_trace(&self) -> Option<Trace> {
        self.inner.lock().trace.last().map(|e| e.payload)
    }
}

impl<const N: usize, const S: usize> Inner<N, S> {
    fn is_new_timestamp(&self, sensor_num: u8) -> bool {
        (sensor_num as usize) < S
            && self.next_ts_initialized & (1 << sensor_num) == 0
    }

    /// Drops the oldest entry (committed first) to make room, with the
    /// loss/metadata bookkeeping that goes with it.
    fn pop_for_space(&mut self) {
        if self.ring.total_len() == 0 {
            return;
        }
        let head = *self.ring.head();
        let from_staged = self.ring.count() == 0;

        // An evicted wake request still has to wake somebody.
        if head.flags().contains(RecordFlags::WAKEUP) {
            self.wake_up_needed = true;
        }
        self.ring.pop();
        self.total_lost = self.total_lost.wrapping_add(1);
        if !head.is_timestamp() && (head.sensor_num() as usize) < S {
            let s = head.sensor_num() as usize;
            self.sensor_lost[s] = self.sensor_lost[s].wrapping_add(1);
        }

        if !from_staged || head.is_timestamp() {
            return;
        }

        // We consumed a staged data record; keep the spreading shortcut
        // consistent with the per-sensor counts.
        let s = head.sensor_num() as usize;
        if s < S {
            self.staged.sample_count[s] =
                self.staged.sample_count[s].saturating_sub(1);
            if self.staged.sample_count[s] < 2 {
                self.staged.requires_spreading =
                    self.staged.sample_count.iter().any(|&c| c > 1);
            }
        }
    }

    /// Guarantees room for one more staged entry.
    ///
    /// Always evicts at least one entry when full. Under tight timestamps,
    /// eviction continues until a timestamp leads the queue: a data record
    /// with its timestamp evicted out from under it would be assigned a
    /// wrong time by the AP.
    fn ensure_space(&mut self) {
        if self.ring.space() > self.ring.staged_count() {
            return;
        }
        loop {
            self.pop_for_space();
            if !(self.tight_timestamps
                && !self.ring.head().is_timestamp()
                && self.ring.total_len() > 0)
            {
                break;
            }
        }
    }

    /// Stages one record. Returns the record and its projected timestamp
    /// when the oversampling filter dropped it but calibration still wants
    /// it.
    fn stage_unit(
        &mut self,
        mut rec: SensorRecord,
        valid_data: usize,
    ) -> Option<(SensorRecord, u32)> {
        let s = rec.sensor_num() as usize;

        if valid_data > 0 && s < S {
            let xyz = rec.xyz();
            self.sensors[s].xyz[..valid_data]
                .copy_from_slice(&xyz[..valid_data]);
        }

        // A sensor's first-ever timestamp seeds its predictor.
        if rec.flags().contains(RecordFlags::TIMESTAMP)
            && self.is_new_timestamp(rec.sensor_num())
        {
            let ts = rec.timestamp();
            self.next_ts[s] = TimestampState { prev: ts, next: ts };
            self.next_ts_initialized |= 1 << s;
        }

        // Oversampling filter: keep 1 of every `ratio` readings.
        if valid_data > 0 && s < S {
            let slot = &mut self.sensors[s];
            let removed = if slot.oversampling_ratio == 0 {
                true
            } else {
                let r = slot.oversampling != 0;
                slot.oversampling =
                    (slot.oversampling + 1) % slot.oversampling_ratio;
                r
            };
            if removed {
                if !self.is_new_timestamp(rec.sensor_num()) {
                    return Some((rec, self.next_ts[s].next));
                }
                return None;
            }
        }

        self.ensure_space();

        if self.tablet_mode {
            rec.insert_flags(RecordFlags::TABLET_MODE);
        }

        if !self.ring.push_staged(rec) {
            // ensure_space just ran; a refusal means bookkeeping went
            // wrong. Drop the record rather than corrupting the ring.
            self.trace.record(Trace::StageFailed);
            return None;
        }

        if self.tight_timestamps && !rec.is_timestamp() && s < S {
            self.staged.sample_count[s] += 1;
            if self.staged.sample_count[s] > 1 {
                self.staged.requires_spreading = true;
            }
        }
        None
    }

    fn commit_batch(&mut self, cal: &mut dyn CalibrationSink) {
        if self.staged.requires_spreading {
            let first = *self.ring.staged(0);
            if !first.is_timestamp() {
                // The staged layout lost its timestamp-then-data shape;
                // commit verbatim rather than guessing times.
                self.trace
                    .record(Trace::SpreadingSkippedHeadNotTimestamp);
                self.staged.requires_spreading = false;
            } else {
                let window = time_until(first.timestamp(), self.staged.read_ts);
                for i in 0..S {
                    let samples = self.staged.sample_count[i];
                    if samples == 0 {
                        continue;
                    }
                    let mut period = self.expected_period[i] as i32;
                    // Clamp to the real window so rewritten times never
                    // outrun the clock; a zero-width window falls back to
                    // the nominal period.
                    if window != 0 && samples > 1 {
                        period = period.min(window / (samples as i32 - 1));
                    }
                    self.period[i] = period as u32;
                }
            }
        }

        for i in 0..self.ring.staged_count() {
            let rec = *self.ring.staged(i);
            if rec.flags().contains(RecordFlags::BYPASS_FIFO) {
                self.bypass_needed = true;
            }
            if rec.flags().contains(RecordFlags::WAKEUP) {
                self.wake_up_needed = true;
            }
            if !rec.is_data() {
                continue;
            }
            let s = rec.sensor_num() as usize;
            if s >= S {
                self.trace.record(Trace::BadSensorNum);
                continue;
            }

            // The record right before a data record must be its timestamp.
            if i == 0 || !self.ring.staged(i - 1).is_timestamp() {
                self.trace.record(Trace::OutOfOrderEntry);
                continue;
            }
            let staged_ts = self.ring.staged(i - 1).timestamp();

            // First observation for this sensor, or a timestamp from after
            // our prediction: fast-forward instead of dragging behind.
            if self.is_new_timestamp(rec.sensor_num())
                || time_after(staged_ts, self.next_ts[s].prev)
            {
                self.next_ts[s].next = staged_ts;
                self.next_ts_initialized |= 1 << s;
            }

            // Rewrite the timestamp record and predict the next sample.
            let assigned = self.next_ts[s].next;
            self.ring.staged_mut(i - 1).set_timestamp(assigned);
            self.next_ts[s].prev = assigned;
            let step = if self.staged.requires_spreading {
                self.period[s]
            } else {
                self.expected_period[s]
            };
            self.next_ts[s].next = assigned.wrapping_add(step);

            cal.process(&rec, assigned);
        }

        self.ring.commit_all();
        self.staged = StagedMeta::ZERO;
    }
}
