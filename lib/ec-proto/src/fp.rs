// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fingerprint protocol: sensor mode word and MKBP event word.

use bitflags::bitflags;

/// Maximum number of enrolled fingers.
pub const FP_MAX_FINGER_COUNT: usize = 5;
/// Bytes in the TPM-provided seed.
pub const FP_CONTEXT_TPM_BYTES: usize = 32;
/// Words in the user id.
pub const FP_CONTEXT_USERID_WORDS: usize = 8;
/// Bytes in a per-template positive-match salt.
pub const FP_POSITIVE_MATCH_SALT_BYTES: usize = 16;
/// Bytes in a derived positive-match secret.
pub const FP_POSITIVE_MATCH_SECRET_BYTES: usize = 32;
/// Bytes in the rollback-region entropy used as the first half of the IKM.
pub const ROLLBACK_SECRET_SIZE: usize = 32;

bitflags! {
    /// Fingerprint sensor mode word.
    ///
    /// These are orthogonal request bits, not an enumerated state: the host
    /// may ask for finger-down detection and a capture at once. Bits 30:28
    /// are not flags -- they hold the [`CaptureType`] subfield and are
    /// retained verbatim by `from_bits_retain`.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FpMode: u32 {
        /// Shut the sensor down.
        const DEEPSLEEP = 1 << 0;
        /// Report when a finger lands on the sensor.
        const FINGER_DOWN = 1 << 1;
        /// Report when the finger leaves the sensor (polled).
        const FINGER_UP = 1 << 2;
        /// Acquire an image (capture type in bits 30:28).
        const CAPTURE = 1 << 3;
        /// A multi-capture enrollment session is open.
        const ENROLL_SESSION = 1 << 4;
        /// The next capture feeds the enrollment algorithm.
        const ENROLL_IMAGE = 1 << 5;
        /// The next capture is matched against enrolled templates.
        const MATCH = 1 << 6;
        /// Clear all context (templates, secrets) and reset the sensor.
        const RESET_SENSOR = 1 << 7;
        /// Run the sensor vendor's maintenance routine.
        const SENSOR_MAINTENANCE = 1 << 8;
        /// Query-only: report the current mode without changing it.
        const DONT_CHANGE = 1 << 31;
    }
}

/// Position of the capture-type subfield within [`FpMode`].
pub const FP_MODE_CAPTURE_TYPE_SHIFT: u32 = 28;
pub const FP_MODE_CAPTURE_TYPE_MASK: u32 = 0x7 << FP_MODE_CAPTURE_TYPE_SHIFT;

/// Modes that end in an image acquisition.
pub const FP_MODE_ANY_CAPTURE: FpMode = FpMode::CAPTURE
    .union(FpMode::ENROLL_IMAGE)
    .union(FpMode::MATCH);
/// Modes that need the finger-detect circuitry armed.
pub const FP_MODE_ANY_DETECT_FINGER: FpMode = FpMode::FINGER_DOWN
    .union(FpMode::FINGER_UP)
    .union(FP_MODE_ANY_CAPTURE);
/// Modes that wait on the sensor interrupt line.
pub const FP_MODE_ANY_WAIT_IRQ: FpMode =
    FpMode::FINGER_DOWN.union(FP_MODE_ANY_CAPTURE);

/// Capture-type subfield of the mode word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureType {
    /// Best-of-N capture in the matcher's vendor format.
    VendorFormat = 0,
    /// Single raw frame.
    SimpleImage = 1,
    /// Self-test pattern.
    Pattern0 = 2,
    /// Inverted self-test pattern.
    Pattern1 = 3,
    /// Fixed-contrast frame for quality tests.
    QualityTest = 4,
    /// Pixel reset-value test frame.
    ResetTest = 5,
}

impl CaptureType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::VendorFormat,
            1 => Self::SimpleImage,
            2 => Self::Pattern0,
            3 => Self::Pattern1,
            4 => Self::QualityTest,
            5 => Self::ResetTest,
            _ => return None,
        })
    }
}

impl FpMode {
    /// Extracts the capture-type subfield; out-of-range values read as
    /// `None`.
    pub fn capture_type(self) -> Option<CaptureType> {
        CaptureType::from_u8(
            ((self.bits() & FP_MODE_CAPTURE_TYPE_MASK)
                >> FP_MODE_CAPTURE_TYPE_SHIFT) as u8,
        )
    }

    pub fn with_capture_type(self, ty: CaptureType) -> Self {
        Self::from_bits_retain(
            (self.bits() & !FP_MODE_CAPTURE_TYPE_MASK)
                | ((ty as u32) << FP_MODE_CAPTURE_TYPE_SHIFT),
        )
    }

    /// Test-pattern captures complete synchronously, without a finger.
    pub fn is_test_capture(self) -> bool {
        self.contains(Self::CAPTURE)
            && matches!(
                self.capture_type(),
                Some(
                    CaptureType::Pattern0
                        | CaptureType::Pattern1
                        | CaptureType::ResetTest
                )
            )
    }

    /// Raw captures expose the unprocessed frame buffer to the host.
    pub fn is_raw_capture(self) -> bool {
        matches!(
            self.capture_type(),
            Some(CaptureType::VendorFormat | CaptureType::QualityTest)
        )
    }
}

/// Finger presence as reported by the sensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FingerState {
    None,
    Partial,
    Present,
}

/// Enrollment step error codes (event-word bits 3:0 when ENROLL is set).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum EnrollCode {
    Ok = 0,
    LowQuality = 1,
    Immobile = 2,
    LowCoverage = 3,
    Internal = 5,
}

/// Match result codes (event-word bits 3:0 when MATCH is set).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MatchCode {
    No = 0,
    Yes = 1,
    NoLowQuality = 2,
    YesUpdated = 3,
    NoLowCoverage = 4,
    YesUpdateFailed = 5,
    NoInternal = 6,
    NoTemplates = 7,
}

impl MatchCode {
    /// Any flavor of "matched", whether or not the template update stuck.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Yes | Self::YesUpdated | Self::YesUpdateFailed)
    }
}

/// The 32-bit MKBP fingerprint event word: category bits in 31:27, match
/// index in 15:12, enroll progress in 11:4, error code in 3:0.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FpEventWord(pub u32);

pub const FP_EVENT_ENROLL: u32 = 1 << 27;
pub const FP_EVENT_MATCH: u32 = 1 << 28;
pub const FP_EVENT_FINGER_DOWN: u32 = 1 << 29;
pub const FP_EVENT_FINGER_UP: u32 = 1 << 30;
pub const FP_EVENT_IMAGE_READY: u32 = 1 << 31;

const FP_ERRCODE_MASK: u32 = 0xf;
const FP_ENROLL_PROGRESS_SHIFT: u32 = 4;
const FP_ENROLL_PROGRESS_MASK: u32 = 0x0000_0ff0;
const FP_MATCH_IDX_SHIFT: u32 = 12;
const FP_MATCH_IDX_MASK: u32 = 0x0000_f000;

impl FpEventWord {
    pub fn finger_down() -> Self {
        Self(FP_EVENT_FINGER_DOWN)
    }

    pub fn finger_up() -> Self {
        Self(FP_EVENT_FINGER_UP)
    }

    pub fn image_ready() -> Self {
        Self(FP_EVENT_IMAGE_READY)
    }

    pub fn enroll(code: EnrollCode, percent: u32) -> Self {
        Self(
            FP_EVENT_ENROLL
                | (code as u32 & FP_ERRCODE_MASK)
                | ((percent << FP_ENROLL_PROGRESS_SHIFT)
                    & FP_ENROLL_PROGRESS_MASK),
        )
    }

    pub fn match_result(code: MatchCode, idx: Option<u32>) -> Self {
        // "No such template" is encoded as an index that masks to 0xf.
        let idx = idx.unwrap_or(0xf);
        Self(
            FP_EVENT_MATCH
                | (code as u32 & FP_ERRCODE_MASK)
                | ((idx << FP_MATCH_IDX_SHIFT) & FP_MATCH_IDX_MASK),
        )
    }

    pub fn errcode(self) -> u32 {
        self.0 & FP_ERRCODE_MASK
    }

    pub fn enroll_progress(self) -> u32 {
        (self.0 & FP_ENROLL_PROGRESS_MASK) >> FP_ENROLL_PROGRESS_SHIFT
    }

    pub fn match_idx(self) -> u32 {
        (self.0 & FP_MATCH_IDX_MASK) >> FP_MATCH_IDX_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_type_field_survives_flag_ops() {
        let mode = (FpMode::CAPTURE | FpMode::FINGER_DOWN)
            .with_capture_type(CaptureType::Pattern1);
        assert_eq!(mode.capture_type(), Some(CaptureType::Pattern1));
        assert!(mode.is_test_capture());
        assert!(!mode.is_raw_capture());

        let cleared = mode.difference(FpMode::FINGER_DOWN);
        assert_eq!(cleared.capture_type(), Some(CaptureType::Pattern1));
    }

    #[test]
    fn mode_combos_match_protocol() {
        assert_eq!(FP_MODE_ANY_CAPTURE.bits(), (1 << 3) | (1 << 5) | (1 << 6));
        assert!(FP_MODE_ANY_WAIT_IRQ.contains(FpMode::FINGER_DOWN));
        assert!(!FP_MODE_ANY_WAIT_IRQ.contains(FpMode::FINGER_UP));
        assert!(FP_MODE_ANY_DETECT_FINGER.contains(FpMode::FINGER_UP));
    }

    #[test]
    fn event_word_packing() {
        let e = FpEventWord::enroll(EnrollCode::LowCoverage, 60);
        assert_eq!(e.errcode(), 3);
        assert_eq!(e.enroll_progress(), 60);
        assert!(e.0 & FP_EVENT_ENROLL != 0);

        let m = FpEventWord::match_result(MatchCode::Yes, Some(2));
        assert_eq!(m.errcode(), 1);
        assert_eq!(m.match_idx(), 2);

        let none = FpEventWord::match_result(MatchCode::NoTemplates, None);
        assert_eq!(none.match_idx(), 0xf);
    }
}
