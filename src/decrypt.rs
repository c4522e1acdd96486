//! The decrypt stage: sealed ESP datagrams in, plaintext out.
//!
//! RX keeps two SA slots so a rekey loses no traffic regardless of
//! which side starts speaking under the new key first. Every packet is
//! tried against slot 1; on authentication failure it is retried
//! against slot 2, and a slot-2 success promotes that SA to slot 1.

use std::net::Ipv4Addr;

use log::{debug, info};

use crate::esp::{self, EspHeader, Sa};
use crate::keys::KeyCell;
use crate::packet::Packet;
use crate::proc::{self, ProcIo, RunAs, Stage};
use crate::replay::ReplayWindow;
use crate::state::SharedState;

/// The RX half of the data plane.
#[derive(Default)]
pub struct Decryptor {
    slot1: Sa,
    slot2: Sa,
}

impl Decryptor {
    /// Pick up a pending RX key. The first key lands in slot 1; once a
    /// current SA exists, fresh keys stage in slot 2 until a packet
    /// authenticates under them.
    pub fn install(&mut self, cell: &KeyCell, state: &SharedState) {
        if !self.slot1.active() {
            if cell.install(&mut self.slot1) {
                state.rx.set_spi(self.slot1.spi);
                info!("new RX SA (spi=0x{:08x})", self.slot1.spi);
            }
        } else if cell.install(&mut self.slot2) {
            info!("pending RX SA (spi=0x{:08x})", self.slot2.spi);
        }
    }

    /// Verify and decrypt one sealed packet. Returns false when the
    /// packet is dropped for any reason; on success the packet holds the
    /// plaintext and is routed to the clear stage.
    pub fn process(
        &mut self,
        pkt: &mut Packet,
        arwin: &ReplayWindow,
        state: &SharedState,
    ) -> bool {
        debug_assert_eq!(pkt.target, Stage::Decrypt as u32);

        if !esp::checklen(pkt) {
            debug!("dropping runt datagram ({} bytes)", pkt.length);
            return false;
        }

        let hdr = EspHeader::parse(pkt.head()).expect("checklen guarantees a full header");
        if !esp::replay_admissible(&hdr, arwin) {
            info!("dropping replayed or too-old packet (pn=0x{:x})", hdr.pn);
            return false;
        }

        let wire_len = pkt.length;
        let promoted = if esp::open_packet(&self.slot1, pkt, &hdr) {
            false
        } else if esp::open_packet(&self.slot2, pkt, &hdr) {
            true
        } else {
            info!("dropping unverifiable packet (spi=0x{:08x})", hdr.spi);
            return false;
        };

        if promoted {
            self.promote(state);
        }

        arwin.update(hdr.pn);
        self.learn_peer(pkt, state);

        if !esp::strip_packet(pkt) {
            info!("dropping packet with invalid trailer (pn=0x{:x})", hdr.pn);
            return false;
        }

        state.rx.record(wire_len);
        pkt.target = Stage::Clear as u32;
        true
    }

    /// Slot 2 authenticated a packet: its SA becomes current and the old
    /// slot-1 SA is destroyed. Slot 2 ends up empty.
    fn promote(&mut self, state: &SharedState) {
        state.rx.set_spi(self.slot2.spi);
        info!("swapping RX SA (spi=0x{:08x})", self.slot2.spi);
        self.slot1.take_from(&mut self.slot2);
    }

    /// The peer may roam; a verified packet from a new source address
    /// moves the recorded endpoint, and egress follows it.
    fn learn_peer(&self, pkt: &Packet, state: &SharedState) {
        let src = pkt.source();
        if *src.ip() == Ipv4Addr::UNSPECIFIED {
            return;
        }
        if state.peer() != Some(src) {
            info!("peer address change (new={})", src);
            state.set_peer(src);
        }
    }

    pub fn current_spi(&self) -> u32 {
        self.slot1.spi
    }

    pub fn pending_active(&self) -> bool {
        self.slot2.active()
    }
}

fn drop_access(io: &mut ProcIo) {
    proc::detach(&mut io.tx);
    proc::detach(&mut io.crypto);
    proc::detach(&mut io.encrypt);
}

/// Worker entry, running in its own forked process.
pub fn run(mut io: ProcIo, runas: Option<RunAs>) {
    proc::signal_trap(libc::SIGQUIT);
    proc::signal_ignore(libc::SIGINT);
    drop_access(&mut io);

    let state = io.state.expect("decrypt keeps the shared state");
    let pool = io.pool.expect("decrypt keeps the packet pool");
    let rx = io.rx.expect("decrypt keeps the RX key cell");
    let arwin = io.arwin.expect("decrypt keeps the anti-replay window");
    let input = io.decrypt.expect("decrypt keeps its input ring");
    let output = io.clear.expect("decrypt keeps the clear ring");

    proc::drop_privileges(runas);

    let mut dec = Decryptor::default();
    let mut running = true;

    while running {
        if let Some(sig) = proc::last_signal() {
            info!("received signal {}", sig);
            if sig == libc::SIGQUIT {
                running = false;
                continue;
            }
        }

        dec.install(rx.get(), state.get());

        while let Some(idx) = input.get().pop() {
            dec.install(rx.get(), state.get());

            let pkt = unsafe { pool.get().packet_mut(idx) };
            if dec.process(pkt, arwin.get(), state.get()) {
                if !output.get().push(idx) {
                    pool.get().release(idx);
                }
            } else {
                pool.get().release(idx);
            }
        }

        proc::idle_pause();
    }

    info!("exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::KEY_LEN;
    use crate::encrypt::Encryptor;
    use crate::keys::KeyCell;
    use std::net::SocketAddrV4;

    fn sealed(enc: &mut Encryptor, state: &SharedState, payload: &[u8]) -> Box<Packet> {
        let mut pkt = Packet::new_boxed();
        pkt.data_mut()[..payload.len()].copy_from_slice(payload);
        pkt.length = payload.len();
        pkt.target = Stage::Encrypt as u32;
        assert!(enc.process(&mut pkt, state));
        pkt.target = Stage::Decrypt as u32;
        pkt
    }

    fn keyed_pair(spi: u32, key: u8) -> (Encryptor, Decryptor, SharedState) {
        let state = SharedState::default();
        let cell = KeyCell::default();
        let mut enc = Encryptor::default();
        let mut dec = Decryptor::default();
        cell.publish(spi, &[key; KEY_LEN]);
        enc.install(&cell, &state);
        cell.publish(spi, &[key; KEY_LEN]);
        dec.install(&cell, &state);
        (enc, dec, state)
    }

    #[test]
    fn round_trip_through_both_halves() {
        let (mut enc, mut dec, state) = keyed_pair(0x01020304, 0);
        let arwin = ReplayWindow::default();
        let payload = b"ip datagram bytes";

        let mut pkt = sealed(&mut enc, &state, payload);
        assert!(dec.process(&mut pkt, &arwin, &state));
        assert_eq!(pkt.target, Stage::Clear as u32);
        assert_eq!(&pkt.data()[..payload.len()], payload);
        assert_eq!(arwin.last(), 1);
        assert_eq!(state.rx.snapshot().packets, 1);
    }

    #[test]
    fn replayed_packet_is_rejected() {
        let (mut enc, mut dec, state) = keyed_pair(0x11, 0);
        let arwin = ReplayWindow::default();

        let pkt = sealed(&mut enc, &state, b"once");
        let mut first = Packet::new_boxed();
        first.head_mut().copy_from_slice(pkt.head());
        first.length = pkt.length;
        first.target = pkt.target;

        let mut replay = Packet::new_boxed();
        replay.head_mut().copy_from_slice(pkt.head());
        replay.length = pkt.length;
        replay.target = pkt.target;

        assert!(dec.process(&mut first, &arwin, &state));
        assert!(!dec.process(&mut replay, &arwin, &state));
    }

    #[test]
    fn rekey_promotes_slot_two() {
        let state = SharedState::default();
        let arwin = ReplayWindow::default();
        let cell = KeyCell::default();

        let mut enc_old = Encryptor::default();
        let mut enc_new = Encryptor::default();
        let mut dec = Decryptor::default();

        cell.publish(0xA1, &[1u8; KEY_LEN]);
        enc_old.install(&cell, &state);
        cell.publish(0xA1, &[1u8; KEY_LEN]);
        dec.install(&cell, &state);

        // Sender still on the old key while the new RX key stages.
        cell.publish(0xB2, &[2u8; KEY_LEN]);
        dec.install(&cell, &state);
        assert!(dec.pending_active());
        assert_eq!(dec.current_spi(), 0xA1);

        let mut old_pkt = sealed(&mut enc_old, &state, b"old key traffic");
        assert!(dec.process(&mut old_pkt, &arwin, &state));
        assert_eq!(dec.current_spi(), 0xA1, "slot 1 still current");

        // Sender switches. The shared window already saw pn=1 from the
        // old SA, so the first new-key packet collides and drops; the
        // second authenticates under slot 2 and promotes it.
        cell.publish(0xB2, &[2u8; KEY_LEN]);
        enc_new.install(&cell, &state);
        let mut colliding = sealed(&mut enc_new, &state, b"new key traffic");
        assert!(!dec.process(&mut colliding, &arwin, &state));
        let mut promoting = sealed(&mut enc_new, &state, b"new key traffic");
        assert!(dec.process(&mut promoting, &arwin, &state));

        assert_eq!(dec.current_spi(), 0xB2, "slot 2 promoted");
        assert!(!dec.pending_active(), "slot 2 zeroed after promotion");
        assert_eq!(state.rx.snapshot().spi, 0xB2);
    }

    #[test]
    fn verified_packet_updates_peer_address() {
        let (mut enc, mut dec, state) = keyed_pair(0x77, 3);
        let arwin = ReplayWindow::default();

        let roamed = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000);
        let mut pkt = sealed(&mut enc, &state, b"roaming peer");
        pkt.set_source(roamed);

        assert!(dec.process(&mut pkt, &arwin, &state));
        assert_eq!(state.peer(), Some(roamed));
    }

    #[test]
    fn runt_and_mismatched_sequence_are_dropped() {
        let (mut enc, mut dec, state) = keyed_pair(0x42, 0);
        let arwin = ReplayWindow::default();

        let mut runt = Packet::new_boxed();
        runt.length = 10;
        runt.target = Stage::Decrypt as u32;
        assert!(!dec.process(&mut runt, &arwin, &state));

        // A sealed packet whose 32-bit sequence does not mirror the PN.
        let mut pkt = sealed(&mut enc, &state, b"valid once");
        pkt.head_mut()[7] ^= 0x01;
        assert!(!dec.process(&mut pkt, &arwin, &state));
    }
}
