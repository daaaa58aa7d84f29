// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instance-owned trace ring buffer.
//!
//! The EC has no console worth printing to from interrupt context, so
//! subsystems record typed trace events into a small ring instead, to be
//! read out by a debugger or a test. Each owning context embeds its own
//! `TraceBuf` -- there are deliberately no statics here, so two instances of
//! a subsystem trace independently.
//!
//! Recording an event equal to the most recent entry bumps that entry's
//! count rather than consuming a slot, so a tight loop hitting the same
//! anomaly doesn't wash out the history around it.

#![cfg_attr(not(test), no_std)]

/// One trace entry: the payload plus enough metadata to order entries and
/// collapse repeats.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TraceEntry<T: Copy + PartialEq> {
    /// Bumps each time the ring wraps past this slot; distinguishes a stale
    /// entry from a fresh one at the same index.
    pub generation: u16,
    /// Number of consecutive identical recordings collapsed into this entry.
    pub count: u32,
    pub payload: T,
}

/// Fixed-capacity trace ring of `N` entries.
#[derive(Clone, Debug)]
pub struct TraceBuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    entries: [Option<TraceEntry<T>>; N],
}

impl<T: Copy + PartialEq, const N: usize> TraceBuf<T, N> {
    pub const fn new() -> Self {
        Self {
            last: None,
            entries: [None; N],
        }
    }

    /// Records `payload`, collapsing it into the previous entry if equal.
    pub fn record(&mut self, payload: T) {
        let ndx = match self.last {
            Some(last) => {
                if let Some(ent) = &mut self.entries[last] {
                    if ent.payload == payload {
                        ent.count = ent.count.saturating_add(1);
                        return;
                    }
                }
                if last + 1 < N {
                    last + 1
                } else {
                    0
                }
            }
            None => 0,
        };

        let generation = match self.entries[ndx] {
            Some(prev) => prev.generation.wrapping_add(1),
            None => 0,
        };
        self.entries[ndx] = Some(TraceEntry {
            generation,
            count: 1,
            payload,
        });
        self.last = Some(ndx);
    }

    /// The most recently recorded entry, if any.
    pub fn last(&self) -> Option<&TraceEntry<T>> {
        self.entries[self.last?].as_ref()
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &TraceEntry<T>> {
        let first = match self.last {
            Some(last) if last + 1 < N => last + 1,
            _ => 0,
        };
        self.entries[first..]
            .iter()
            .chain(self.entries[..first].iter())
            .filter_map(|e| e.as_ref())
    }

    pub fn clear(&mut self) {
        self.last = None;
        self.entries = [None; N];
    }
}

impl<T: Copy + PartialEq, const N: usize> Default for TraceBuf<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Trace {
        A,
        B(u8),
    }

    #[test]
    fn repeats_collapse() {
        let mut buf = TraceBuf::<Trace, 4>::new();
        buf.record(Trace::A);
        buf.record(Trace::A);
        buf.record(Trace::A);
        let last = buf.last().unwrap();
        assert_eq!(last.payload, Trace::A);
        assert_eq!(last.count, 3);
        assert_eq!(buf.iter().count(), 1);
    }

    #[test]
    fn wrap_keeps_newest() {
        let mut buf = TraceBuf::<Trace, 2>::new();
        buf.record(Trace::B(0));
        buf.record(Trace::B(1));
        buf.record(Trace::B(2));
        let seen: Vec<_> = buf.iter().map(|e| e.payload).collect();
        assert_eq!(seen, vec![Trace::B(1), Trace::B(2)]);
        // The slot for B(2) was reused; its generation advanced.
        assert_eq!(buf.last().unwrap().generation, 1);
    }

    #[test]
    fn interleaving_does_not_collapse() {
        let mut buf = TraceBuf::<Trace, 4>::new();
        buf.record(Trace::A);
        buf.record(Trace::B(1));
        buf.record(Trace::A);
        assert_eq!(buf.iter().count(), 3);
    }
}
