// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wraparound-safe time comparisons.
//!
//! Event timestamps are microseconds from a free-running 32-bit hardware
//! counter, which wraps a little over every 71 minutes. Comparisons must go
//! through signed wrapping differences; a direct `<` misorders timestamps
//! that straddle the wrap.

/// Returns true if `a` is later than `b`, assuming the two are within half
/// the counter range of each other.
pub fn time_after(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 > 0
}

/// Signed distance from `from` to `to`; negative when `to` is in the past.
pub fn time_until(from: u32, to: u32) -> i32 {
    to.wrapping_sub(from) as i32
}
