// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keyboard FIFO wired into the event dispatcher, driven the way the AP
//! drives the real thing: notification edge, then `get next event` polls
//! until the well runs dry.

use ec_proto::{MkbpEventType, MKBP_HAS_MORE_EVENTS};
use mkbp_event::{
    DispatchError, EventSource, GetDataError, HostLink, HostLinkError,
    MkbpDispatch,
};
use mkbp_fifo::{GetNextError, MkbpFifo};

struct Wire;

impl HostLink for Wire {
    fn set_active(
        &self,
        _active: bool,
        timestamp: Option<&mut u32>,
    ) -> Result<(), HostLinkError> {
        if let Some(ts) = timestamp {
            *ts = 42;
        }
        Ok(())
    }

    fn is_sleeping(&self) -> bool {
        false
    }
}

const KEY: [u8; 13] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c,
    0x0d,
];
const BUTTON: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Builds the FIFO-backed sources for the event types under test. A
/// `WrongHeadType` from the FIFO becomes the dispatcher's `Busy`, which is
/// the whole point of the protocol: the AP drains the FIFO in its order,
/// not the round-robin's.
macro_rules! fifo_source {
    ($name:ident, $ty:expr, $fifo:expr, $dispatch:expr) => {
        let $name = |out: &mut [u8]| match $fifo.get_next($ty, out, 0, $dispatch)
        {
            Ok(n) => Ok(n),
            Err(GetNextError::WrongHeadType) => Err(GetDataError::Busy),
            Err(GetNextError::Empty) => Err(GetDataError::Failed),
        };
        let $name = EventSource {
            event_type: $ty,
            get_data: &$name,
        };
    };
}

#[test]
fn ap_drains_mixed_events_in_fifo_order() {
    let fifo = MkbpFifo::<8>::new();
    let dispatch = MkbpDispatch::new(Wire);
    fifo_source!(keys, MkbpEventType::KeyMatrix, &fifo, &dispatch);
    fifo_source!(buttons, MkbpEventType::Button, &fifo, &dispatch);
    let sources = [keys, buttons];

    fifo.add(MkbpEventType::KeyMatrix, &KEY, 0, &dispatch).unwrap();
    fifo.add(MkbpEventType::Button, &BUTTON, 0, &dispatch).unwrap();
    assert_eq!(dispatch.last_event_time(), 42);

    // First poll: the key matrix, with more to come.
    let mut resp = [0u8; 16];
    let n = dispatch.get_next_event(&sources, &mut resp, 2).unwrap();
    assert_eq!(n, 1 + KEY.len());
    assert_eq!(resp[0], MkbpEventType::KeyMatrix as u8 | MKBP_HAS_MORE_EVENTS);
    assert_eq!(&resp[1..n], &KEY);

    // Second poll: the button, and the queue is dry.
    let n = dispatch.get_next_event(&sources, &mut resp, 2).unwrap();
    assert_eq!(n, 1 + BUTTON.len());
    assert_eq!(resp[0], MkbpEventType::Button as u8);
    assert_eq!(&resp[1..n], &BUTTON);

    assert_eq!(
        dispatch.get_next_event(&sources, &mut resp, 2),
        Err(DispatchError::Unavailable)
    );
}

#[test]
fn round_robin_defers_to_fifo_order() {
    let fifo = MkbpFifo::<8>::new();
    let dispatch = MkbpDispatch::new(Wire);
    fifo_source!(keys, MkbpEventType::KeyMatrix, &fifo, &dispatch);
    fifo_source!(buttons, MkbpEventType::Button, &fifo, &dispatch);
    let sources = [keys, buttons];

    // Button first in the FIFO, but KeyMatrix first in the round-robin.
    fifo.add(MkbpEventType::Button, &BUTTON, 0, &dispatch).unwrap();
    fifo.add(MkbpEventType::KeyMatrix, &KEY, 0, &dispatch).unwrap();

    // The KeyMatrix source reports busy (its head is a button), so the
    // dispatcher re-queues it and serves the button within one poll.
    let mut resp = [0u8; 16];
    let n = dispatch.get_next_event(&sources, &mut resp, 2).unwrap();
    assert_eq!(resp[0], MkbpEventType::Button as u8 | MKBP_HAS_MORE_EVENTS);
    assert_eq!(&resp[1..n], &BUTTON);

    let n = dispatch.get_next_event(&sources, &mut resp, 2).unwrap();
    assert_eq!(resp[0], MkbpEventType::KeyMatrix as u8);
    assert_eq!(&resp[1..n], &KEY);
}
