//! Key handoff between the keying stage and the data-plane workers.
//!
//! One cell per direction lives in shared memory. The keying stage is
//! the only producer and walks EMPTY -> GENERATING -> PENDING; the
//! owning data-plane stage is the only consumer and walks PENDING ->
//! INSTALLING -> EMPTY. Every transition is a compare-and-swap, and a
//! failed swap means some other process violated the protocol — that is
//! corrupted state, not congestion, so it terminates the worker.

use std::cell::UnsafeCell;
use std::hint;
use std::sync::atomic::{AtomicU32, Ordering::SeqCst};

use zeroize::Zeroize;

use crate::cipher::KEY_LEN;
use crate::esp::Sa;

pub const KEY_EMPTY: u32 = 0;
pub const KEY_GENERATING: u32 = 1;
pub const KEY_PENDING: u32 = 2;
pub const KEY_INSTALLING: u32 = 3;

/// Shared cell mediating one direction's key transfer.
#[repr(C)]
#[derive(Default)]
pub struct KeyCell {
    spi: AtomicU32,
    state: AtomicU32,
    key: UnsafeCell<[u8; KEY_LEN]>,
}

// The key bytes are only touched while the state machine grants the
// toucher exclusivity (GENERATING for the producer, INSTALLING for the
// consumer).
unsafe impl Sync for KeyCell {}

impl KeyCell {
    fn transition(&self, from: u32, to: u32) {
        if self
            .state
            .compare_exchange(from, to, SeqCst, SeqCst)
            .is_err()
        {
            crate::fatal!("key cell state swap {} -> {} failed", from, to);
        }
    }

    /// Producer side: wait for the consumer to drain any previous key,
    /// then stage the new one. Called only by the keying stage.
    pub fn publish(&self, spi: u32, key: &[u8; KEY_LEN]) {
        while self.state.load(SeqCst) != KEY_EMPTY {
            hint::spin_loop();
        }

        self.transition(KEY_EMPTY, KEY_GENERATING);

        unsafe { (*self.key.get()).copy_from_slice(key) };
        self.spi.store(spi, SeqCst);

        self.transition(KEY_GENERATING, KEY_PENDING);
    }

    /// Consumer side: install a pending key into `sa`, wiping the cell's
    /// copy of the key bytes. Returns false when nothing is pending.
    pub fn install(&self, sa: &mut Sa) -> bool {
        if self.state.load(SeqCst) != KEY_PENDING {
            return false;
        }

        self.transition(KEY_PENDING, KEY_INSTALLING);

        let spi = self.spi.load(SeqCst);
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(unsafe { &*self.key.get() });
        unsafe { (*self.key.get()).zeroize() };

        let result = sa.rekey(spi, &key);
        key.zeroize();
        if let Err(e) = result {
            crate::fatal!("cipher setup for spi=0x{:08x} failed: {}", spi, e);
        }

        self.transition(KEY_INSTALLING, KEY_EMPTY);
        true
    }

    /// Whether a key is staged and waiting for its consumer.
    pub fn has_pending(&self) -> bool {
        self.state.load(SeqCst) == KEY_PENDING
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn publish_then_install() {
        let cell = KeyCell::default();
        let mut sa = Sa::default();

        assert!(!cell.install(&mut sa), "nothing pending yet");

        cell.publish(0x0A0B0C0D, &[0x42u8; KEY_LEN]);
        assert!(cell.has_pending());

        assert!(cell.install(&mut sa));
        assert!(sa.active());
        assert_eq!(sa.spi, 0x0A0B0C0D);
        assert_eq!(sa.salt, 0x0A0B0C0D);
        assert_eq!(sa.seq, 1);

        assert!(!cell.has_pending());
        assert_eq!(
            unsafe { *cell.key.get() },
            [0u8; KEY_LEN],
            "cell must wipe the key bytes after install"
        );
    }

    #[test]
    fn install_replaces_previous_sa() {
        let cell = KeyCell::default();
        let mut sa = Sa::default();

        cell.publish(1, &[1u8; KEY_LEN]);
        assert!(cell.install(&mut sa));
        sa.seq = 500;

        cell.publish(2, &[2u8; KEY_LEN]);
        assert!(cell.install(&mut sa));
        assert_eq!(sa.spi, 2);
        assert_eq!(sa.seq, 1, "rekey restarts the sequence");
    }

    #[test]
    fn producer_waits_for_consumer() {
        let cell = Arc::new(KeyCell::default());
        let producer = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                for spi in 1..=50u32 {
                    cell.publish(spi, &[spi as u8; KEY_LEN]);
                }
            })
        };

        let mut sa = Sa::default();
        let mut installed = Vec::new();
        while installed.len() < 50 {
            if cell.install(&mut sa) {
                installed.push(sa.spi);
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();

        // Linearity: every key handed over exactly once, in order.
        let expect: Vec<u32> = (1..=50).collect();
        assert_eq!(installed, expect);
        assert!(!cell.has_pending());
    }
}
