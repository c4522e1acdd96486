//! Sliding-window anti-replay filter.
//!
//! The window tracks the highest packet number accepted so far (`last`)
//! and a 64-bit bitmap of the most recent arrivals, bit 63 standing for
//! `last` itself. Only the decrypt stage mutates the window; the crypto
//! ingress stage reads `last` for a permissive pre-check that widens the
//! window by the decrypt queue depth, so packets still sitting in the
//! queue are not falsely rejected before their authoritative check.

use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

/// Width of the strict window.
pub const WINDOW_SIZE: u64 = 64;

/// Pre-check slack: decrypt queue capacity minus one.
pub const PRECHECK_SLACK: u64 = crate::ring::RING_DEFAULT_CAPACITY as u64 - 1;

#[repr(C)]
#[derive(Default)]
pub struct ReplayWindow {
    last: AtomicU64,
    bitmap: AtomicU64,
}

impl ReplayWindow {
    /// Strict admission test: accept packet numbers above the window,
    /// and in-window numbers not yet seen. Everything at or below the
    /// window's lower edge is rejected as too old.
    pub fn check(&self, pn: u64) -> bool {
        let last = self.last.load(SeqCst);

        if pn > last {
            return true;
        }

        if pn > 0 && last - pn < WINDOW_SIZE {
            let bit = (WINDOW_SIZE - 1) - (last - pn);
            return self.bitmap.load(SeqCst) & (1u64 << bit) == 0;
        }

        false
    }

    /// Record an accepted packet number. Must only be called after the
    /// packet authenticated and `check` admitted it.
    pub fn update(&self, pn: u64) {
        let last = self.last.load(SeqCst);

        if pn > last {
            let shift = pn - last;
            let bitmap = if shift >= WINDOW_SIZE {
                1u64 << 63
            } else {
                (self.bitmap.load(SeqCst) >> shift) | (1u64 << 63)
            };
            self.bitmap.store(bitmap, SeqCst);
            self.last.store(pn, SeqCst);
            return;
        }

        let bit = (WINDOW_SIZE - 1) - (last - pn);
        self.bitmap.fetch_or(1u64 << bit, SeqCst);
    }

    /// Permissive pre-check used on the crypto side before queueing for
    /// decrypt. Accepts anything the strict window might still accept by
    /// the time the packet is dequeued.
    pub fn precheck(&self, pn: u64) -> bool {
        let last = self.last.load(SeqCst);

        if pn > last {
            return true;
        }

        pn > 0 && WINDOW_SIZE + PRECHECK_SLACK > last - pn
    }

    /// Highest accepted packet number.
    pub fn last(&self) -> u64 {
        self.last.load(SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(w: &ReplayWindow, pn: u64) -> bool {
        if w.check(pn) {
            w.update(pn);
            true
        } else {
            false
        }
    }

    #[test]
    fn monotone_sequence_accepts_each_once() {
        let w = ReplayWindow::default();
        for pn in 1..=200u64 {
            assert!(accept(&w, pn), "pn {} should be new", pn);
            assert!(!accept(&w, pn), "pn {} replay must be rejected", pn);
        }
        assert_eq!(w.last(), 200);
    }

    #[test]
    fn window_edges() {
        let w = ReplayWindow::default();
        assert!(accept(&w, 100));

        // In window, unseen: accepted exactly once.
        assert!(accept(&w, 50));
        assert!(!accept(&w, 50));

        // Lower edge: last - pn == 63 is still inside.
        assert!(accept(&w, 37));

        // last - pn == 64 is too old.
        assert!(!w.check(36));
        // And pn == 0 is never valid.
        assert!(!w.check(0));
    }

    #[test]
    fn reorder_after_jump() {
        // Feed 1..=50, then 100, then the stragglers. Everything within
        // 64 of 100 that was not yet seen is accepted; 37..=50 are
        // duplicates; 36 and below are too old.
        let w = ReplayWindow::default();
        for pn in 1..=50u64 {
            assert!(accept(&w, pn));
        }
        assert!(accept(&w, 100));

        for pn in 51..=99u64 {
            assert!(accept(&w, pn), "pn {} is in-window and unseen", pn);
        }
        for pn in 37..=50u64 {
            assert!(!accept(&w, pn), "pn {} was already seen", pn);
        }
        for pn in 1..=36u64 {
            assert!(!accept(&w, pn), "pn {} is below the window", pn);
        }
        assert_eq!(w.last(), 100);
    }

    #[test]
    fn far_jump_clears_the_bitmap() {
        let w = ReplayWindow::default();
        assert!(accept(&w, 1));
        assert!(accept(&w, 1000));
        // The old arrival is far below the window now.
        assert!(!w.check(1));
        // Bit 63 marks the new last.
        assert!(!accept(&w, 1000));
        // Fresh in-window values still land.
        assert!(accept(&w, 999));
    }

    #[test]
    fn precheck_is_wider_than_strict() {
        let w = ReplayWindow::default();
        w.update(5000);

        // Strictly too old, but within queue slack: the pre-check lets it
        // through for the authoritative check to decide.
        let pn = 5000 - WINDOW_SIZE - 10;
        assert!(!w.check(pn));
        assert!(w.precheck(pn));

        // Beyond window + slack even the pre-check rejects.
        let pn = 5000 - WINDOW_SIZE - PRECHECK_SLACK;
        assert!(!w.precheck(pn));

        // Ahead of the window is always fine.
        assert!(w.precheck(5001));
        assert!(!w.precheck(0));
    }
}
