// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fingerprint sensor task logic.
//!
//! One task owns the sensor. It sleeps until one of two things happens: the
//! host changes the requested mode word, or the sensor interrupt (or a poll
//! timeout, for finger removal, which this hardware cannot interrupt on)
//! fires. Each wake walks the mode word -- a set of orthogonal request bits,
//! not one state -- and clears each bit as its request completes: finger-down
//! reported, image captured, enrollment advanced, match run. Failed captures
//! leave their bit set so the next wake retries.
//!
//! The task core is platform-independent: the sensor, the matching
//! algorithm, and the board (clock + entropy) are traits, and the embedding
//! task feeds wakes in and arms the poll timeout out of
//! [`FpTask::next_poll_us`]. Results reach the host as MKBP fingerprint
//! events; the pending event word accumulates in an atomic read out by the
//! dispatcher's event source.

#![cfg_attr(not(test), no_std)]

pub mod secret;

use core::sync::atomic::{AtomicU32, Ordering};

use ec_proto::fp::{
    CaptureType, EnrollCode, FingerState, FpEventWord, FpMode, MatchCode,
    FP_CONTEXT_TPM_BYTES, FP_CONTEXT_USERID_WORDS, FP_MAX_FINGER_COUNT,
    FP_MODE_ANY_CAPTURE, FP_MODE_ANY_DETECT_FINGER, FP_MODE_ANY_WAIT_IRQ,
    FP_MODE_CAPTURE_TYPE_MASK, FP_POSITIVE_MATCH_SALT_BYTES,
    ROLLBACK_SECRET_SIZE,
};
use ec_proto::MkbpEventType;
use mkbp_event::MkbpSendEvent;
use secret::{
    derive_positive_match_secret, PositiveMatchSecret,
    PositiveMatchSecretState, SecretError,
};

/// Poll interval for finger-removal detection, which must be polled.
pub const FINGER_POLLING_DELAY_US: u32 = 100_000;

/// Template format version reported to the host.
pub const FP_TEMPLATE_FORMAT_VERSION: u32 = 4;

/// Capture timing was invalidated by a failed acquisition.
pub const FPSTATS_CAPTURE_INV: u8 = 1 << 0;
/// Matching timing was invalidated by a failed match.
pub const FPSTATS_MATCHING_INV: u8 = 1 << 1;

/// Why the task woke up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wake {
    /// The host rewrote the mode word.
    ModeChange,
    /// The sensor interrupt line fired.
    Irq,
    /// The finger-removal poll timeout elapsed.
    Timer,
}

/// The sensor driver failed; the operation will be retried on a later wake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SensorError;

/// Static description of the sensor, merged into the host's info response.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SensorInfo {
    pub vendor_id: u32,
    pub product_id: u32,
    pub model_id: u32,
    pub version: u32,
    pub frame_size: u32,
    pub pixel_format: u32,
    pub width: u16,
    pub height: u16,
    pub bpp: u16,
    pub errors: u16,
}

/// Low-level sensor driver seam.
pub trait FpSensor {
    fn init(&mut self) -> Result<(), SensorError>;
    /// Arms the hardware finger-detect configuration.
    fn configure_detect(&mut self);
    fn set_irq_enabled(&mut self, enabled: bool);
    fn finger_status(&mut self) -> FingerState;
    /// Acquires one frame into `image`. Failures are not fatal; the caller
    /// retries on its next wake.
    fn acquire_image(
        &mut self,
        capture: Option<CaptureType>,
        image: &mut [u8],
    ) -> Result<(), SensorError>;
    fn low_power(&mut self);
    fn maintenance(&mut self, image: &mut [u8]) -> Result<(), SensorError>;
    fn info(&self) -> SensorInfo;
}

/// Sensor stand-in for boards without fingerprint hardware: the task
/// degrades to a pass-through that only forwards event words it is handed
/// (see [`FpTask::forward_event_bits`]).
pub struct NullFpSensor;

impl FpSensor for NullFpSensor {
    fn init(&mut self) -> Result<(), SensorError> {
        Ok(())
    }
    fn configure_detect(&mut self) {}
    fn set_irq_enabled(&mut self, _enabled: bool) {}
    fn finger_status(&mut self) -> FingerState {
        FingerState::None
    }
    fn acquire_image(
        &mut self,
        _capture: Option<CaptureType>,
        _image: &mut [u8],
    ) -> Result<(), SensorError> {
        Err(SensorError)
    }
    fn low_power(&mut self) {}
    fn maintenance(&mut self, _image: &mut [u8]) -> Result<(), SensorError> {
        Ok(())
    }
    fn info(&self) -> SensorInfo {
        SensorInfo::default()
    }
}

/// The matching algorithm blew up in a way a retry won't fix.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MatcherError;

/// Outcome of matching a finger against the enrolled templates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatchOutcome {
    Yes { idx: usize },
    /// Matched, and the algorithm improved the stored template.
    YesUpdated { idx: usize },
    /// Matched, but updating the stored template failed.
    YesUpdateFailed { idx: usize },
    No,
    NoLowQuality,
    NoLowCoverage,
    /// The algorithm itself failed.
    Internal,
}

/// Matching/enrollment algorithm seam. The template format is the
/// algorithm's own business.
pub trait FpMatcher {
    type Template;

    fn enroll_begin(&mut self) -> Result<(), MatcherError>;
    /// Feeds one image to the open enrollment; returns the step quality and
    /// the overall progress percentage (100 = complete).
    fn enroll_step(
        &mut self,
        image: &[u8],
    ) -> Result<(EnrollCode, u32), MatcherError>;
    /// Closes a complete enrollment, producing the new template.
    fn enroll_finish(&mut self) -> Result<Self::Template, MatcherError>;
    /// Abandons an open enrollment.
    fn enroll_abort(&mut self);
    fn match_templates(
        &mut self,
        templates: &mut [Self::Template],
        image: &[u8],
    ) -> MatchOutcome;
}

/// Board glue: time and entropy.
pub trait FpBoard {
    fn now_us(&mut self) -> u64;
    /// Entropy persisted in the rollback region, half of the secret IKM.
    fn rollback_secret(
        &mut self,
    ) -> Result<[u8; ROLLBACK_SECRET_SIZE], SensorError>;
    fn rand_bytes(&mut self, out: &mut [u8]);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModeError {
    /// The mode word contains bits this firmware does not define.
    InvalidMode,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SeedError {
    /// The TPM seed can only be set once per boot.
    AlreadySet,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Offset plus size overflows or runs past the buffer.
    OutOfRange,
}

/// Timing statistics for the last capture/match cycle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FpStats {
    pub capture_time_us: u32,
    pub matching_time_us: u32,
    pub overall_time_us: u32,
    pub overall_t0_us: u64,
    /// [`FPSTATS_CAPTURE_INV`] / [`FPSTATS_MATCHING_INV`] bits.
    pub timestamps_invalid: u8,
    /// Template armed by the last successful match, if its secret has not
    /// been read yet.
    pub template_matched: Option<usize>,
}

/// Info response: sensor description plus template accounting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FpInfo {
    pub sensor: SensorInfo,
    pub template_max: u16,
    pub template_valid: u16,
    pub template_dirty: u32,
    pub template_version: u32,
}

/// The fingerprint task core. `IMG` is the frame buffer size in bytes.
pub struct FpTask<S, M: FpMatcher, B, const IMG: usize> {
    sensor: S,
    matcher: M,
    board: B,
    sensor_mode: FpMode,
    /// Tracks the ENROLL_SESSION bit across mode writes, to catch the
    /// open/close edges.
    enroll_session: FpMode,
    /// Pending MKBP event word bits, drained by the event source.
    fp_events: AtomicU32,
    image: [u8; IMG],
    templates: heapless::Vec<M::Template, FP_MAX_FINGER_COUNT>,
    positive_match_salt:
        [[u8; FP_POSITIVE_MATCH_SALT_BYTES]; FP_MAX_FINGER_COUNT],
    template_dirty: u32,
    template_newly_enrolled: Option<usize>,
    user_id: [u32; FP_CONTEXT_USERID_WORDS],
    tpm_seed: Option<[u8; FP_CONTEXT_TPM_BYTES]>,
    secret_state: PositiveMatchSecretState,
    poll_interval_us: Option<u32>,
    stats: FpStats,
}

impl<S: FpSensor, M: FpMatcher, B: FpBoard, const IMG: usize>
    FpTask<S, M, B, IMG>
{
    pub fn new(mut sensor: S, matcher: M, board: B) -> Self {
        // A sensor that fails to come up still leaves a functioning
        // pass-through task; acquisition will fail and retry.
        let _ = sensor.init();
        Self {
            sensor,
            matcher,
            board,
            sensor_mode: FpMode::empty(),
            enroll_session: FpMode::empty(),
            fp_events: AtomicU32::new(0),
            image: [0; IMG],
            templates: heapless::Vec::new(),
            positive_match_salt: [[0; FP_POSITIVE_MATCH_SALT_BYTES];
                FP_MAX_FINGER_COUNT],
            template_dirty: 0,
            template_newly_enrolled: None,
            user_id: [0; FP_CONTEXT_USERID_WORDS],
            tpm_seed: None,
            secret_state: PositiveMatchSecretState::default(),
            poll_interval_us: None,
            stats: FpStats::default(),
        }
    }

    /// Current poll timeout the embedding should arm before sleeping, or
    /// `None` for an indefinite wait.
    pub fn next_poll_us(&self) -> Option<u32> {
        self.poll_interval_us
    }

    pub fn mode(&self) -> FpMode {
        self.sensor_mode
    }

    /// Host mode write. Returns the resulting mode and whether the task
    /// needs a [`Wake::ModeChange`]. `DONT_CHANGE` reads back the current
    /// mode without waking anything.
    pub fn set_mode(
        &mut self,
        mode: FpMode,
    ) -> Result<(FpMode, bool), ModeError> {
        if mode.contains(FpMode::DONT_CHANGE) {
            return Ok((self.sensor_mode, false));
        }
        let valid = FpMode::all().bits() | FP_MODE_CAPTURE_TYPE_MASK;
        if mode.bits() & !valid != 0 {
            return Err(ModeError::InvalidMode);
        }
        self.sensor_mode = mode;
        Ok((mode, true))
    }

    /// Drains the pending MKBP event word (the event source's `get_data`).
    pub fn take_events(&self) -> u32 {
        self.fp_events.swap(0, Ordering::AcqRel)
    }

    /// Degraded mode for builds without a sensor driver: forward whatever
    /// event bits the embedding hands us.
    pub fn forward_event_bits(
        &self,
        bits: u32,
        now: u32,
        events: &impl MkbpSendEvent,
    ) {
        self.fp_events.fetch_or(bits, Ordering::AcqRel);
        events.send_event(MkbpEventType::Fingerprint, now);
    }

    fn send_event(&self, word: u32, events: &impl MkbpSendEvent, now: u32) {
        self.fp_events.fetch_or(word, Ordering::AcqRel);
        events.send_event(MkbpEventType::Fingerprint, now);
    }

    /// One iteration of the task loop.
    pub fn step(&mut self, wake: Wake, events: &impl MkbpSendEvent) {
        match wake {
            Wake::ModeChange => self.on_mode_change(events),
            Wake::Irq | Wake::Timer => self.on_sensor_event(events),
        }
    }

    fn on_mode_change(&mut self, events: &impl MkbpSendEvent) {
        let mode = self.sensor_mode;
        self.sensor.set_irq_enabled(false);

        // Enrollment session open/close edges.
        if (mode ^ self.enroll_session).contains(FpMode::ENROLL_SESSION) {
            if mode.contains(FpMode::ENROLL_SESSION) {
                if self.templates.is_full()
                    || self.matcher.enroll_begin().is_err()
                {
                    self.sensor_mode.remove(FpMode::ENROLL_SESSION);
                }
            } else {
                self.matcher.enroll_abort();
            }
            self.enroll_session = self.sensor_mode & FpMode::ENROLL_SESSION;
        }

        if mode.is_test_capture() {
            // Test patterns need no finger; complete synchronously.
            let _ = self
                .sensor
                .acquire_image(mode.capture_type(), &mut self.image);
            self.sensor_mode.remove(FpMode::CAPTURE);
            let now = self.board.now_us();
            self.send_event(FpEventWord::image_ready().0, events, now as u32);
            return;
        } else if self.sensor_mode.intersects(FP_MODE_ANY_DETECT_FINGER) {
            self.sensor.configure_detect();
        }

        if self.sensor_mode.contains(FpMode::DEEPSLEEP) {
            self.sensor.low_power();
        }

        if self.sensor_mode.contains(FpMode::FINGER_UP) {
            // Removal cannot interrupt; poll for it.
            self.poll_interval_us = Some(FINGER_POLLING_DELAY_US);
        } else {
            self.poll_interval_us = None;
        }

        if mode.intersects(FP_MODE_ANY_WAIT_IRQ) {
            self.sensor.set_irq_enabled(true);
        } else if mode.contains(FpMode::RESET_SENSOR) {
            self.reset_and_clear_context();
            self.sensor_mode.remove(FpMode::RESET_SENSOR);
        } else if mode.contains(FpMode::SENSOR_MAINTENANCE) {
            let _ = self.sensor.maintenance(&mut self.image);
            self.sensor_mode.remove(FpMode::SENSOR_MAINTENANCE);
        } else {
            self.sensor.low_power();
        }
    }

    fn on_sensor_event(&mut self, events: &impl MkbpSendEvent) {
        self.stats.overall_t0_us = self.board.now_us();
        self.stats.timestamps_invalid = 0;
        self.sensor.set_irq_enabled(false);

        let mut st = FingerState::None;
        if self.sensor_mode.intersects(FP_MODE_ANY_DETECT_FINGER) {
            st = self.sensor.finger_status();
            if st == FingerState::Present
                && self.sensor_mode.contains(FpMode::FINGER_DOWN)
            {
                self.sensor_mode.remove(FpMode::FINGER_DOWN);
                let now = self.board.now_us();
                self.send_event(
                    FpEventWord::finger_down().0,
                    events,
                    now as u32,
                );
            }
            if st == FingerState::None
                && self.sensor_mode.contains(FpMode::FINGER_UP)
            {
                self.sensor_mode.remove(FpMode::FINGER_UP);
                self.poll_interval_us = None;
                let now = self.board.now_us();
                self.send_event(FpEventWord::finger_up().0, events, now as u32);
            }
        }

        if st == FingerState::Present
            && self.sensor_mode.intersects(FP_MODE_ANY_CAPTURE)
        {
            self.process_finger(events);
        }

        if self.sensor_mode.intersects(FP_MODE_ANY_WAIT_IRQ) {
            self.sensor.configure_detect();
            self.sensor.set_irq_enabled(true);
        } else {
            self.sensor.low_power();
        }
    }

    fn process_finger(&mut self, events: &impl MkbpSendEvent) {
        let t0 = self.board.now_us();
        let res = self
            .sensor
            .acquire_image(self.sensor_mode.capture_type(), &mut self.image);
        self.stats.capture_time_us = (self.board.now_us() - t0) as u32;

        match res {
            Ok(()) => {
                let evt = if self.sensor_mode.contains(FpMode::ENROLL_IMAGE) {
                    self.process_enroll()
                } else if self.sensor_mode.contains(FpMode::MATCH) {
                    self.process_match()
                } else {
                    FpEventWord::image_ready().0
                };
                self.sensor_mode.remove(FP_MODE_ANY_CAPTURE);
                let now = self.board.now_us();
                self.stats.overall_time_us =
                    (now - self.stats.overall_t0_us) as u32;
                self.send_event(evt, events, now as u32);
            }
            Err(SensorError) => {
                // Leave the capture bits set; the next wake retries.
                self.stats.timestamps_invalid |= FPSTATS_CAPTURE_INV;
            }
        }
    }

    fn process_enroll(&mut self) -> u32 {
        let (code, percent) = match self.matcher.enroll_step(&self.image) {
            Ok(step) => step,
            Err(MatcherError) => {
                return FpEventWord::enroll(EnrollCode::Internal, 0).0
            }
        };

        self.template_dirty |= 1 << self.templates.len();
        let mut code = code;
        if percent == 100 {
            match self.matcher.enroll_finish() {
                Ok(template) => {
                    let idx = self.templates.len();
                    if self.templates.push(template).is_ok() {
                        self.template_newly_enrolled = Some(idx);
                        let mut salt = [0; FP_POSITIVE_MATCH_SALT_BYTES];
                        self.board.rand_bytes(&mut salt);
                        self.positive_match_salt[idx] = salt;
                        let now = self.board.now_us();
                        let _ = self.secret_state.enable(idx, now);
                    } else {
                        code = EnrollCode::Internal;
                    }
                }
                Err(MatcherError) => {
                    code = EnrollCode::Internal;
                }
            }
            self.sensor_mode.remove(FpMode::ENROLL_SESSION);
            self.enroll_session.remove(FpMode::ENROLL_SESSION);
        }
        FpEventWord::enroll(code, percent).0
    }

    fn process_match(&mut self) -> u32 {
        let t0 = self.board.now_us();
        // Whatever was readable from a previous match is forfeit now.
        self.secret_state.disable();

        let (code, idx) = if self.templates.is_empty() {
            (MatchCode::NoTemplates, None)
        } else {
            let outcome = self
                .matcher
                .match_templates(&mut self.templates, &self.image);
            match outcome {
                MatchOutcome::Yes { idx } => (MatchCode::Yes, Some(idx)),
                MatchOutcome::YesUpdated { idx } => {
                    (MatchCode::YesUpdated, Some(idx))
                }
                MatchOutcome::YesUpdateFailed { idx } => {
                    (MatchCode::YesUpdateFailed, Some(idx))
                }
                MatchOutcome::No => (MatchCode::No, None),
                MatchOutcome::NoLowQuality => (MatchCode::NoLowQuality, None),
                MatchOutcome::NoLowCoverage => {
                    (MatchCode::NoLowCoverage, None)
                }
                MatchOutcome::Internal => (MatchCode::NoInternal, None),
            }
        };

        let (code, idx) = match (code, idx) {
            (code, Some(idx)) if code.is_success() => {
                if idx < self.templates.len() {
                    let now = self.board.now_us();
                    let _ = self.secret_state.enable(idx, now);
                    if code == MatchCode::YesUpdated {
                        self.template_dirty |= 1 << idx;
                    }
                    (code, Some(idx))
                } else {
                    // The algorithm named a template we don't have.
                    (MatchCode::NoInternal, Some(idx))
                }
            }
            other => other,
        };

        if !code.is_success() {
            self.stats.timestamps_invalid |= FPSTATS_MATCHING_INV;
        }
        self.stats.matching_time_us = (self.board.now_us() - t0) as u32;
        FpEventWord::match_result(code, idx.map(|i| i as u32)).0
    }

    /// Clears templates, salts, user id, and any readable secret, then
    /// reinitializes the sensor.
    pub fn reset_and_clear_context(&mut self) {
        self.templates.clear();
        self.template_dirty = 0;
        self.template_newly_enrolled = None;
        self.positive_match_salt =
            [[0; FP_POSITIVE_MATCH_SALT_BYTES]; FP_MAX_FINGER_COUNT];
        self.user_id = [0; FP_CONTEXT_USERID_WORDS];
        self.secret_state.disable();
        self.image = [0; IMG];
        let _ = self.sensor.init();
    }

    /// Index of a template enrolled since the host last acknowledged one,
    /// used by the host's template-readout flow to refresh its salt copy.
    pub fn take_newly_enrolled(&mut self) -> Option<usize> {
        self.template_newly_enrolled.take()
    }

    pub fn info(&self) -> FpInfo {
        FpInfo {
            sensor: self.sensor.info(),
            template_max: FP_MAX_FINGER_COUNT as u16,
            template_valid: self.templates.len() as u16,
            template_dirty: self.template_dirty,
            template_version: FP_TEMPLATE_FORMAT_VERSION,
        }
    }

    pub fn stats(&self) -> FpStats {
        FpStats {
            template_matched: self.secret_state.template_matched(),
            ..self.stats
        }
    }

    /// Host read of the raw frame buffer by offset.
    pub fn read_frame(
        &self,
        offset: u32,
        out: &mut [u8],
    ) -> Result<(), FrameError> {
        let end = offset
            .checked_add(out.len() as u32)
            .ok_or(FrameError::OutOfRange)?;
        if end as usize > IMG {
            return Err(FrameError::OutOfRange);
        }
        out.copy_from_slice(
            &self.image[offset as usize..end as usize],
        );
        Ok(())
    }

    /// TPM seed, required for secret derivation; set exactly once per boot.
    pub fn set_seed(
        &mut self,
        seed: [u8; FP_CONTEXT_TPM_BYTES],
    ) -> Result<(), SeedError> {
        if self.tpm_seed.is_some() {
            return Err(SeedError::AlreadySet);
        }
        self.tpm_seed = Some(seed);
        Ok(())
    }

    pub fn set_user_id(&mut self, user_id: [u32; FP_CONTEXT_USERID_WORDS]) {
        self.user_id = user_id;
    }

    /// Host read of the positive-match secret for template `fgr`. Succeeds
    /// at most once per match, only inside the post-match window; any
    /// outcome other than "window still pending" tears the window down.
    pub fn read_match_secret(
        &mut self,
        fgr: usize,
    ) -> Result<PositiveMatchSecret, SecretError> {
        if fgr >= FP_MAX_FINGER_COUNT {
            return Err(SecretError::InvalidFinger);
        }
        let now = self.board.now_us();
        self.secret_state.check_read(fgr, now)?;

        let seed = self.tpm_seed.ok_or(SecretError::SeedNotSet)?;
        let rollback = self
            .board
            .rollback_secret()
            .map_err(|SensorError| SecretError::Hardware)?;
        let secret = derive_positive_match_secret(
            &self.positive_match_salt[fgr],
            &self.user_id,
            &seed,
            &rollback,
        )?;
        self.secret_state.disable();
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const IMG: usize = 32;

    struct FakeSensor {
        statuses: VecDeque<FingerState>,
        acquire_results: VecDeque<Result<(), SensorError>>,
        irq_enabled: bool,
        detect_configured: usize,
        low_power_calls: usize,
        maintenance_calls: usize,
    }

    impl FakeSensor {
        fn new() -> Self {
            Self {
                statuses: VecDeque::new(),
                acquire_results: VecDeque::new(),
                irq_enabled: false,
                detect_configured: 0,
                low_power_calls: 0,
                maintenance_calls: 0,
            }
        }
    }

    impl FpSensor for FakeSensor {
        fn init(&mut self) -> Result<(), SensorError> {
            Ok(())
        }
        fn configure_detect(&mut self) {
            self.detect_configured += 1;
        }
        fn set_irq_enabled(&mut self, enabled: bool) {
            self.irq_enabled = enabled;
        }
        fn finger_status(&mut self) -> FingerState {
            self.statuses.pop_front().unwrap_or(FingerState::None)
        }
        fn acquire_image(
            &mut self,
            _capture: Option<CaptureType>,
            image: &mut [u8],
        ) -> Result<(), SensorError> {
            let res = self.acquire_results.pop_front().unwrap_or(Ok(()));
            if res.is_ok() {
                image.fill(0x5a);
            }
            res
        }
        fn low_power(&mut self) {
            self.low_power_calls += 1;
        }
        fn maintenance(
            &mut self,
            _image: &mut [u8],
        ) -> Result<(), SensorError> {
            self.maintenance_calls += 1;
            Ok(())
        }
        fn info(&self) -> SensorInfo {
            SensorInfo {
                width: 8,
                height: 4,
                bpp: 8,
                frame_size: IMG as u32,
                ..SensorInfo::default()
            }
        }
    }

    struct FakeMatcher {
        enroll_steps: VecDeque<Result<(EnrollCode, u32), MatcherError>>,
        match_outcome: MatchOutcome,
        session_open: bool,
    }

    impl FakeMatcher {
        fn new() -> Self {
            Self {
                enroll_steps: VecDeque::new(),
                match_outcome: MatchOutcome::No,
                session_open: false,
            }
        }
    }

    impl FpMatcher for FakeMatcher {
        type Template = u8;

        fn enroll_begin(&mut self) -> Result<(), MatcherError> {
            self.session_open = true;
            Ok(())
        }
        fn enroll_step(
            &mut self,
            _image: &[u8],
        ) -> Result<(EnrollCode, u32), MatcherError> {
            self.enroll_steps
                .pop_front()
                .unwrap_or(Ok((EnrollCode::Ok, 0)))
        }
        fn enroll_finish(&mut self) -> Result<u8, MatcherError> {
            self.session_open = false;
            Ok(0xa5)
        }
        fn enroll_abort(&mut self) {
            self.session_open = false;
        }
        fn match_templates(
            &mut self,
            _templates: &mut [u8],
            _image: &[u8],
        ) -> MatchOutcome {
            self.match_outcome
        }
    }

    struct FakeBoard {
        now_us: u64,
    }

    impl FpBoard for FakeBoard {
        fn now_us(&mut self) -> u64 {
            self.now_us
        }
        fn rollback_secret(
            &mut self,
        ) -> Result<[u8; ROLLBACK_SECRET_SIZE], SensorError> {
            Ok(crate::secret::tests::FAKE_ROLLBACK_SECRET)
        }
        fn rand_bytes(&mut self, out: &mut [u8]) {
            out.copy_from_slice(&crate::secret::tests::FAKE_SALT[..out.len()]);
        }
    }

    #[derive(Default)]
    struct FakeEvents {
        sent: std::sync::Mutex<Vec<MkbpEventType>>,
    }

    impl MkbpSendEvent for FakeEvents {
        fn send_event(&self, ty: MkbpEventType, _now: u32) -> bool {
            self.sent.lock().unwrap().push(ty);
            true
        }
    }

    type Task = FpTask<FakeSensor, FakeMatcher, FakeBoard, IMG>;

    fn task() -> Task {
        FpTask::new(FakeSensor::new(), FakeMatcher::new(), FakeBoard {
            now_us: 1_000_000,
        })
    }

    #[test]
    fn finger_down_detection() {
        let mut t = task();
        let ev = FakeEvents::default();

        let (_, wake) = t.set_mode(FpMode::FINGER_DOWN).unwrap();
        assert!(wake);
        t.step(Wake::ModeChange, &ev);
        assert_eq!(t.sensor.detect_configured, 1);
        assert!(t.sensor.irq_enabled);
        assert_eq!(t.next_poll_us(), None);

        t.sensor.statuses.push_back(FingerState::Present);
        t.step(Wake::Irq, &ev);
        assert!(!t.mode().contains(FpMode::FINGER_DOWN));
        let word = t.take_events();
        assert_eq!(word, ec_proto::fp::FP_EVENT_FINGER_DOWN);
        assert_eq!(
            ev.sent.lock().unwrap().as_slice(),
            &[MkbpEventType::Fingerprint]
        );
        // No wait-IRQ bit remains; the sensor was put to sleep.
        assert_eq!(t.sensor.low_power_calls, 1);
    }

    #[test]
    fn finger_up_is_polled() {
        let mut t = task();
        let ev = FakeEvents::default();

        t.set_mode(FpMode::FINGER_UP).unwrap();
        t.step(Wake::ModeChange, &ev);
        assert_eq!(t.next_poll_us(), Some(FINGER_POLLING_DELAY_US));
        // FINGER_UP alone does not wait on the IRQ line.
        assert!(!t.sensor.irq_enabled);

        // Finger still present: bit stays, keep polling.
        t.sensor.statuses.push_back(FingerState::Present);
        t.step(Wake::Timer, &ev);
        assert!(t.mode().contains(FpMode::FINGER_UP));
        assert_eq!(t.next_poll_us(), Some(FINGER_POLLING_DELAY_US));

        // Finger gone: bit clears, poll cancelled, event raised.
        t.sensor.statuses.push_back(FingerState::None);
        t.step(Wake::Timer, &ev);
        assert!(!t.mode().contains(FpMode::FINGER_UP));
        assert_eq!(t.next_poll_us(), None);
        assert_eq!(t.take_events(), ec_proto::fp::FP_EVENT_FINGER_UP);
    }

    #[test]
    fn capture_retries_after_sensor_failure() {
        let mut t = task();
        let ev = FakeEvents::default();

        t.set_mode(
            (FpMode::FINGER_DOWN | FpMode::CAPTURE)
                .with_capture_type(CaptureType::SimpleImage),
        )
        .unwrap();
        t.step(Wake::ModeChange, &ev);

        // First wake: finger present but acquisition fails. The capture
        // bit must survive for a retry.
        t.sensor.statuses.push_back(FingerState::Present);
        t.sensor.acquire_results.push_back(Err(SensorError));
        t.step(Wake::Irq, &ev);
        assert!(t.mode().contains(FpMode::CAPTURE));
        assert_eq!(t.stats().timestamps_invalid, FPSTATS_CAPTURE_INV);
        // Finger-down fired, image-ready did not.
        assert_eq!(t.take_events(), ec_proto::fp::FP_EVENT_FINGER_DOWN);

        // Next wake: acquisition succeeds, bit clears, exactly one
        // image-ready event.
        t.sensor.statuses.push_back(FingerState::Present);
        t.sensor.acquire_results.push_back(Ok(()));
        t.step(Wake::Irq, &ev);
        assert!(!t.mode().contains(FpMode::CAPTURE));
        assert_eq!(t.take_events(), ec_proto::fp::FP_EVENT_IMAGE_READY);
        assert_eq!(t.take_events(), 0);
    }

    #[test]
    fn test_pattern_capture_completes_without_finger() {
        let mut t = task();
        let ev = FakeEvents::default();

        t.set_mode(
            FpMode::CAPTURE.with_capture_type(CaptureType::Pattern0),
        )
        .unwrap();
        t.step(Wake::ModeChange, &ev);
        assert!(!t.mode().contains(FpMode::CAPTURE));
        assert_eq!(t.take_events(), ec_proto::fp::FP_EVENT_IMAGE_READY);
        // The frame got filled by the synchronous acquisition.
        let mut out = [0u8; 4];
        t.read_frame(0, &mut out).unwrap();
        assert_eq!(out, [0x5a; 4]);
    }

    fn enroll_one(t: &mut Task, ev: &FakeEvents) {
        t.set_mode(
            (FpMode::ENROLL_SESSION | FpMode::ENROLL_IMAGE | FpMode::CAPTURE)
                .with_capture_type(CaptureType::VendorFormat),
        )
        .unwrap();
        t.step(Wake::ModeChange, ev);
        t.matcher
            .enroll_steps
            .push_back(Ok((EnrollCode::Ok, 100)));
        t.sensor.statuses.push_back(FingerState::Present);
        t.step(Wake::Irq, ev);
    }

    #[test]
    fn enrollment_progress_and_completion() {
        let mut t = task();
        let ev = FakeEvents::default();

        t.set_mode(
            (FpMode::ENROLL_SESSION | FpMode::ENROLL_IMAGE | FpMode::CAPTURE)
                .with_capture_type(CaptureType::VendorFormat),
        )
        .unwrap();
        t.step(Wake::ModeChange, &ev);
        assert!(t.matcher.session_open);

        // Partial step: 60%, low coverage.
        t.matcher
            .enroll_steps
            .push_back(Ok((EnrollCode::LowCoverage, 60)));
        t.sensor.statuses.push_back(FingerState::Present);
        t.step(Wake::Irq, &ev);
        let word = FpEventWord(t.take_events());
        assert_eq!(word.enroll_progress(), 60);
        assert_eq!(word.errcode(), EnrollCode::LowCoverage as u32);
        // Session stays open, capture bits cleared pending next image.
        assert!(t.mode().contains(FpMode::ENROLL_SESSION));
        assert!(!t.mode().contains(FpMode::CAPTURE));
        assert_eq!(t.info().template_valid, 0);

        // Host re-arms the capture for the final image.
        t.set_mode(
            (FpMode::ENROLL_SESSION | FpMode::ENROLL_IMAGE | FpMode::CAPTURE)
                .with_capture_type(CaptureType::VendorFormat),
        )
        .unwrap();
        t.step(Wake::ModeChange, &ev);
        t.matcher
            .enroll_steps
            .push_back(Ok((EnrollCode::Ok, 100)));
        t.sensor.statuses.push_back(FingerState::Present);
        t.step(Wake::Irq, &ev);

        let word = FpEventWord(t.take_events());
        assert_eq!(word.enroll_progress(), 100);
        assert_eq!(word.errcode(), EnrollCode::Ok as u32);
        assert_eq!(t.info().template_valid, 1);
        assert!(!t.mode().contains(FpMode::ENROLL_SESSION));
        // The new template's secret window is armed.
        assert_eq!(t.stats().template_matched, Some(0));
    }

    #[test]
    fn match_with_no_templates() {
        let mut t = task();
        let ev = FakeEvents::default();
        t.set_mode(
            (FpMode::MATCH | FpMode::CAPTURE)
                .with_capture_type(CaptureType::VendorFormat),
        )
        .unwrap();
        t.step(Wake::ModeChange, &ev);
        t.sensor.statuses.push_back(FingerState::Present);
        t.step(Wake::Irq, &ev);

        let word = FpEventWord(t.take_events());
        assert_eq!(word.errcode(), MatchCode::NoTemplates as u32);
        assert_eq!(word.match_idx(), 0xf);
        assert_eq!(
            t.stats().timestamps_invalid & FPSTATS_MATCHING_INV,
            FPSTATS_MATCHING_INV
        );
    }

    #[test]
    fn match_success_arms_and_reveals_secret_once() {
        let mut t = task();
        let ev = FakeEvents::default();
        t.set_seed(crate::secret::tests::FAKE_TPM_SEED).unwrap();
        enroll_one(&mut t, &ev);
        t.take_events();
        // Reading the enrollment's own window keeps the test focused on
        // the match window below.
        t.secret_state.disable();

        t.matcher.match_outcome = MatchOutcome::Yes { idx: 0 };
        t.set_mode(
            (FpMode::MATCH | FpMode::CAPTURE)
                .with_capture_type(CaptureType::VendorFormat),
        )
        .unwrap();
        t.step(Wake::ModeChange, &ev);
        t.sensor.statuses.push_back(FingerState::Present);
        t.step(Wake::Irq, &ev);

        let word = FpEventWord(t.take_events());
        assert_eq!(word.errcode(), MatchCode::Yes as u32);
        assert_eq!(word.match_idx(), 0);

        // Wrong index fails and leaves the window armed.
        assert_eq!(
            t.read_match_secret(1).err(),
            Some(SecretError::Denied)
        );
        let secret = t.read_match_secret(0).unwrap();
        // The salt came from the board's entropy; the derivation matches
        // the reference vector for an all-zero user id.
        let expected = derive_positive_match_secret(
            &crate::secret::tests::FAKE_SALT,
            &[0; 8],
            &crate::secret::tests::FAKE_TPM_SEED,
            &crate::secret::tests::FAKE_ROLLBACK_SECRET,
        )
        .unwrap();
        assert_eq!(secret.0, expected.0);

        // Read-once: a second attempt fails closed.
        assert_eq!(
            t.read_match_secret(0).err(),
            Some(SecretError::Denied)
        );
    }

    #[test]
    fn secret_window_times_out() {
        let mut t = task();
        let ev = FakeEvents::default();
        t.set_seed(crate::secret::tests::FAKE_TPM_SEED).unwrap();
        enroll_one(&mut t, &ev);

        t.board.now_us +=
            secret::POSITIVE_MATCH_SECRET_TIMEOUT_US + 1;
        assert_eq!(
            t.read_match_secret(0).err(),
            Some(SecretError::Timeout)
        );
        // And the window is gone even if time rolls on.
        assert_eq!(
            t.read_match_secret(0).err(),
            Some(SecretError::Denied)
        );
    }

    #[test]
    fn secret_requires_seed() {
        let mut t = task();
        let ev = FakeEvents::default();
        enroll_one(&mut t, &ev);
        assert_eq!(
            t.read_match_secret(0).err(),
            Some(SecretError::SeedNotSet)
        );
        assert_eq!(
            t.read_match_secret(9).err(),
            Some(SecretError::InvalidFinger)
        );
    }

    #[test]
    fn seed_set_once() {
        let mut t = task();
        t.set_seed([1; 32]).unwrap();
        assert_eq!(t.set_seed([2; 32]), Err(SeedError::AlreadySet));
    }

    #[test]
    fn matcher_bad_index_reported_as_internal() {
        let mut t = task();
        let ev = FakeEvents::default();
        enroll_one(&mut t, &ev);
        t.take_events();

        t.matcher.match_outcome = MatchOutcome::Yes { idx: 3 };
        t.set_mode(
            (FpMode::MATCH | FpMode::CAPTURE)
                .with_capture_type(CaptureType::VendorFormat),
        )
        .unwrap();
        t.step(Wake::ModeChange, &ev);
        t.sensor.statuses.push_back(FingerState::Present);
        t.step(Wake::Irq, &ev);

        let word = FpEventWord(t.take_events());
        assert_eq!(word.errcode(), MatchCode::NoInternal as u32);
    }

    #[test]
    fn reset_sensor_clears_context() {
        let mut t = task();
        let ev = FakeEvents::default();
        t.set_seed(crate::secret::tests::FAKE_TPM_SEED).unwrap();
        enroll_one(&mut t, &ev);
        assert_eq!(t.info().template_valid, 1);

        t.set_mode(FpMode::RESET_SENSOR).unwrap();
        t.step(Wake::ModeChange, &ev);
        assert!(!t.mode().contains(FpMode::RESET_SENSOR));
        assert_eq!(t.info().template_valid, 0);
        assert_eq!(t.info().template_dirty, 0);
        assert_eq!(
            t.read_match_secret(0).err(),
            Some(SecretError::Denied)
        );
    }

    #[test]
    fn maintenance_runs_once() {
        let mut t = task();
        let ev = FakeEvents::default();
        t.set_mode(FpMode::SENSOR_MAINTENANCE).unwrap();
        t.step(Wake::ModeChange, &ev);
        assert_eq!(t.sensor.maintenance_calls, 1);
        assert!(!t.mode().contains(FpMode::SENSOR_MAINTENANCE));
    }

    #[test]
    fn deepsleep_powers_down() {
        let mut t = task();
        let ev = FakeEvents::default();
        t.set_mode(FpMode::DEEPSLEEP).unwrap();
        t.step(Wake::ModeChange, &ev);
        // Once for the mode bit, once because nothing waits on the IRQ.
        assert_eq!(t.sensor.low_power_calls, 2);
    }

    #[test]
    fn dont_change_reads_back_mode() {
        let mut t = task();
        t.set_mode(FpMode::FINGER_DOWN).unwrap();
        let (mode, wake) = t.set_mode(FpMode::DONT_CHANGE).unwrap();
        assert_eq!(mode, FpMode::FINGER_DOWN);
        assert!(!wake);
    }

    #[test]
    fn invalid_mode_bits_rejected() {
        let mut t = task();
        assert_eq!(
            t.set_mode(FpMode::from_bits_retain(1 << 20)),
            Err(ModeError::InvalidMode)
        );
    }

    #[test]
    fn frame_read_validates_offset() {
        let t = task();
        let mut out = [0u8; 8];
        t.read_frame(0, &mut out).unwrap();
        t.read_frame((IMG - 8) as u32, &mut out).unwrap();
        assert_eq!(
            t.read_frame((IMG - 7) as u32, &mut out),
            Err(FrameError::OutOfRange)
        );
        // Offset + size overflow must not wrap into range.
        assert_eq!(
            t.read_frame(u32::MAX - 2, &mut out),
            Err(FrameError::OutOfRange)
        );
    }

    #[test]
    fn passthrough_forwards_event_bits() {
        let t: FpTask<NullFpSensor, FakeMatcher, FakeBoard, IMG> =
            FpTask::new(NullFpSensor, FakeMatcher::new(), FakeBoard {
                now_us: 0,
            });
        let ev = FakeEvents::default();
        t.forward_event_bits(0xdead_beef, 0, &ev);
        assert_eq!(t.take_events(), 0xdead_beef);
        assert_eq!(
            ev.sent.lock().unwrap().as_slice(),
            &[MkbpEventType::Fingerprint]
        );
    }
}
