// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Motion-sensor wire records.

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

bitflags! {
    /// Flags carried in the first byte of a [`SensorRecord`].
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct RecordFlags: u8 {
        /// Marks the response to a host-requested flush.
        const FLUSH = 1 << 0;
        /// The payload is a timestamp, not axis data.
        const TIMESTAMP = 1 << 1;
        /// This record should wake the AP.
        const WAKEUP = 1 << 2;
        /// Tablet mode was active when the record was queued.
        const TABLET_MODE = 1 << 3;
        /// Marks an output-data-rate change notification.
        const ODR = 1 << 4;
        /// This record must reach the AP without waiting for the FIFO.
        const BYPASS_FIFO = 1 << 7;
    }
}

/// Sensor number used for timestamps not tied to any one sensor.
pub const SENSOR_NUM_NONE: u8 = 0xff;

/// One motion-sensor FIFO record as read by the AP.
///
/// Packed 8-byte layout: flags, sensor number, then six payload bytes that
/// hold either three little-endian `i16` axes or (after two reserved bytes)
/// a little-endian `u32` timestamp, depending on [`RecordFlags::TIMESTAMP`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct SensorRecord {
    flags: u8,
    sensor_num: u8,
    data: [u8; 6],
}

static_assertions::const_assert_eq!(core::mem::size_of::<SensorRecord>(), 8);

impl SensorRecord {
    /// An all-zero record; reads as axis data `[0, 0, 0]` for sensor 0.
    pub const ZERO: Self = Self {
        flags: 0,
        sensor_num: 0,
        data: [0; 6],
    };

    /// A data record carrying one three-axis reading.
    pub fn new_data(sensor_num: u8, xyz: [i16; 3]) -> Self {
        let mut r = Self {
            flags: 0,
            sensor_num,
            data: [0; 6],
        };
        r.set_xyz(xyz);
        r
    }

    /// A timestamp record. Use [`SENSOR_NUM_NONE`] when the timestamp is not
    /// associated with a specific sensor.
    pub fn new_timestamp(sensor_num: u8, timestamp: u32) -> Self {
        let mut r = Self {
            flags: RecordFlags::TIMESTAMP.bits(),
            sensor_num,
            data: [0; 6],
        };
        r.set_timestamp(timestamp);
        r
    }

    /// An out-of-band marker record (flush/ODR), which carries both marker
    /// flags and a timestamp payload.
    pub fn new_marker(sensor_num: u8, flags: RecordFlags, timestamp: u32) -> Self {
        let mut r = Self {
            flags: flags.bits(),
            sensor_num,
            data: [0; 6],
        };
        r.set_timestamp(timestamp);
        r
    }

    pub fn sensor_num(&self) -> u8 {
        self.sensor_num
    }

    pub fn flags(&self) -> RecordFlags {
        RecordFlags::from_bits_truncate(self.flags)
    }

    pub fn insert_flags(&mut self, flags: RecordFlags) {
        self.flags |= flags.bits();
    }

    pub fn is_timestamp(&self) -> bool {
        self.flags().contains(RecordFlags::TIMESTAMP)
    }

    /// A record is sensor data iff it carries neither a timestamp nor an ODR
    /// marker. (Flush markers also carry TIMESTAMP, so they are excluded.)
    pub fn is_data(&self) -> bool {
        !self
            .flags()
            .intersects(RecordFlags::TIMESTAMP | RecordFlags::ODR)
    }

    pub fn xyz(&self) -> [i16; 3] {
        [
            i16::from_le_bytes([self.data[0], self.data[1]]),
            i16::from_le_bytes([self.data[2], self.data[3]]),
            i16::from_le_bytes([self.data[4], self.data[5]]),
        ]
    }

    pub fn set_xyz(&mut self, xyz: [i16; 3]) {
        self.data[0..2].copy_from_slice(&xyz[0].to_le_bytes());
        self.data[2..4].copy_from_slice(&xyz[1].to_le_bytes());
        self.data[4..6].copy_from_slice(&xyz[2].to_le_bytes());
    }

    /// The timestamp payload. Only meaningful when `is_timestamp()`; the
    /// first two payload bytes are reserved on the wire.
    pub fn timestamp(&self) -> u32 {
        u32::from_le_bytes([self.data[2], self.data[3], self.data[4], self.data[5]])
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.data[2..6].copy_from_slice(&timestamp.to_le_bytes());
    }
}

/// Snapshot of motion FIFO occupancy and loss counters, as reported to the
/// AP. `S` is the board's sensor count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FifoInfo<const S: usize> {
    /// Total capacity of the FIFO, in records.
    pub size: u16,
    /// Committed records currently readable.
    pub count: u16,
    /// Time the most recent host notification was raised, stamped by the
    /// event dispatcher, not the FIFO.
    pub timestamp: u32,
    /// Records evicted since the last counter reset.
    pub total_lost: u16,
    /// Data records evicted per sensor since the last counter reset.
    pub lost: [u16; S],
}

impl<const S: usize> FifoInfo<S> {
    pub const ZERO: Self = Self {
        size: 0,
        count: 0,
        timestamp: 0,
        total_lost: 0,
        lost: [0; S],
    };
}
