//! The encrypt stage: plaintext in, sealed ESP datagrams out.
//!
//! A single worker owns the TX security association, so packet numbers
//! are assigned monotonically without cross-process coordination.

use log::{debug, info};

use crate::esp::{self, Sa};
use crate::keys::KeyCell;
use crate::packet::Packet;
use crate::proc::{self, ProcIo, RunAs, Stage};
use crate::state::SharedState;

/// The TX half of the data plane, separated from the worker loop so the
/// pipeline can be exercised in-process.
#[derive(Default)]
pub struct Encryptor {
    sa: Sa,
}

impl Encryptor {
    /// Pick up a pending TX key if the keying stage staged one. A new
    /// key simply replaces the current SA; the first packet sealed under
    /// it carries the new SPI.
    pub fn install(&mut self, cell: &KeyCell, state: &SharedState) {
        if cell.install(&mut self.sa) {
            state.tx.set_spi(self.sa.spi);
            info!("new TX SA (spi=0x{:08x})", self.sa.spi);
        }
    }

    /// Seal one plaintext packet. Returns false when the packet must be
    /// dropped: no key installed yet, or the SA ran out of packet
    /// numbers.
    pub fn process(&mut self, pkt: &mut Packet, state: &SharedState) -> bool {
        debug_assert_eq!(pkt.target, Stage::Encrypt as u32);

        if !esp::seal_packet(&mut self.sa, pkt) {
            debug!("dropping plaintext packet, no usable TX SA");
            return false;
        }

        pkt.target = Stage::Crypto as u32;
        state.tx.record(pkt.length);
        true
    }
}

fn drop_access(io: &mut ProcIo) {
    proc::detach(&mut io.rx);
    proc::detach(&mut io.arwin);
    proc::detach(&mut io.clear);
    proc::detach(&mut io.decrypt);
}

/// Worker entry, running in its own forked process.
pub fn run(mut io: ProcIo, runas: Option<RunAs>) {
    proc::signal_trap(libc::SIGQUIT);
    proc::signal_ignore(libc::SIGINT);
    drop_access(&mut io);

    let state = io.state.expect("encrypt keeps the shared state");
    let pool = io.pool.expect("encrypt keeps the packet pool");
    let tx = io.tx.expect("encrypt keeps the TX key cell");
    let input = io.encrypt.expect("encrypt keeps its input ring");
    let output = io.crypto.expect("encrypt keeps the crypto ring");

    proc::drop_privileges(runas);

    let mut enc = Encryptor::default();
    let mut running = true;

    while running {
        if let Some(sig) = proc::last_signal() {
            info!("received signal {}", sig);
            if sig == libc::SIGQUIT {
                running = false;
                continue;
            }
        }

        enc.install(tx.get(), state.get());

        while let Some(idx) = input.get().pop() {
            enc.install(tx.get(), state.get());

            let pkt = unsafe { pool.get().packet_mut(idx) };
            if enc.process(pkt, state.get()) {
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
