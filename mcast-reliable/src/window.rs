//! Receive window ring.
//!
//! [`ReceiveWindow`] records which sequence numbers of the current window
//! have been sent or delivered.  Slots are indexed by `psn & (wsize - 1)`;
//! a slot "has seen" a psn only if it holds that exact psn, so an entry left
//! over from an older window never answers for a newer one.

use crate::config::ConfigError;
use crate::pool::DescId;

/// Returns `true` when `a` precedes `b` in wrap-around psn space.
#[inline]
pub fn psn_lt(a: u32, b: u32) -> bool {
    let d = b.wrapping_sub(a);
    d != 0 && d <= u32::MAX / 2
}

/// Returns `true` when `a` is ≤ `b` in wrap-around psn space.
#[inline]
pub fn psn_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= u32::MAX / 2
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    psn: u32,
    desc: DescId,
}

/// Fixed-capacity ring of descriptor slots.
#[derive(Debug)]
pub struct ReceiveWindow {
    slots: Box<[Option<Slot>]>,
    mask: u32,
}

impl ReceiveWindow {
    /// Build a window of `wsize` slots; `wsize` must be a power of two.
    pub fn new(wsize: usize) -> Result<Self, ConfigError> {
        if wsize < 2 || !wsize.is_power_of_two() || wsize > u32::MAX as usize {
            return Err(ConfigError::WindowNotPowerOfTwo(wsize));
        }
        Ok(Self {
            slots: vec![None; wsize].into_boxed_slice(),
            mask: (wsize - 1) as u32,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn index(&self, psn: u32) -> usize {
        (psn & self.mask) as usize
    }

    /// `true` if `psn` is currently recorded.
    pub fn seen(&self, psn: u32) -> bool {
        self.get(psn).is_some()
    }

    /// Descriptor recorded for `psn`, if any.
    pub fn get(&self, psn: u32) -> Option<DescId> {
        match self.slots[self.index(psn)] {
            Some(slot) if slot.psn == psn => Some(slot.desc),
            _ => None,
        }
    }

    /// Record `desc` as holding `psn`.
    ///
    /// Returns the previous occupant of the slot when one is evicted; the
    /// window recycle normally empties a slot before it is reused.
    pub fn record(&mut self, psn: u32, desc: DescId) -> Option<DescId> {
        let idx = self.index(psn);
        self.slots[idx]
            .replace(Slot { psn, desc })
            .map(|old| old.desc)
    }

    /// Clear the slot for `psn` and hand back its descriptor.
    pub fn take(&mut self, psn: u32) -> Option<DescId> {
        let idx = self.index(psn);
        match self.slots[idx] {
            Some(slot) if slot.psn == psn => {
                self.slots[idx] = None;
                Some(slot.desc)
            }
            _ => None,
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    fn ids(n: usize) -> Vec<DescId> {
        let mut pool = BufferPool::new(n, 8);
        (0..n).map(|_| pool.acquire().unwrap()).collect()
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(ReceiveWindow::new(6).is_err());
        assert!(ReceiveWindow::new(1).is_err());
        assert!(ReceiveWindow::new(8).is_ok());
    }

    #[test]
    fn record_and_seen() {
        let d = ids(2);
        let mut w = ReceiveWindow::new(8).unwrap();
        assert!(!w.seen(100));
        w.record(100, d[0]);
        assert!(w.seen(100));
        assert_eq!(w.get(100), Some(d[0]));
        // Same slot, different psn: not seen.
        assert!(!w.seen(108));
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn record_evicts_previous_occupant() {
        let d = ids(2);
        let mut w = ReceiveWindow::new(4).unwrap();
        w.record(1, d[0]);
        assert_eq!(w.record(5, d[1]), Some(d[0]));
        assert!(!w.seen(1));
        assert!(w.seen(5));
    }

    #[test]
    fn take_clears_only_matching_psn() {
        let d = ids(1);
        let mut w = ReceiveWindow::new(4).unwrap();
        w.record(2, d[0]);
        assert_eq!(w.take(6), None);
        assert_eq!(w.take(2), Some(d[0]));
        assert!(w.is_empty());
    }

    #[test]
    fn psn_ordering_wraps() {
        assert!(psn_lt(1, 2));
        assert!(!psn_lt(2, 2));
        assert!(psn_le(2, 2));
        assert!(psn_lt(u32::MAX, 0));
        assert!(!psn_lt(0, u32::MAX));
    }
}
