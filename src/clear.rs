//! The clear stage: tunnel-device I/O.
//!
//! Plaintext datagrams read from the tunnel are queued for the encrypt
//! worker; decrypted packets coming back from the decrypt worker are
//! written out to the device.

use std::io;

use log::{debug, info};

use crate::packet::{Packet, PacketPool};
use crate::proc::{self, ProcIo, RunAs, Stage};
use crate::ring::Ring;
use crate::tun::{self, TunDev};

/// Upper bound on datagrams moved per wakeup, per direction.
const PACKETS_PER_EVENT: usize = 32;

fn drop_access(io: &mut ProcIo) {
    proc::detach(&mut io.state);
    proc::detach(&mut io.tx);
    proc::detach(&mut io.rx);
    proc::detach(&mut io.arwin);
    proc::detach(&mut io.crypto);
    proc::detach(&mut io.decrypt);
}

/// Worker entry, running in its own forked process.
pub fn run(mut io: ProcIo, runas: Option<RunAs>) {
    proc::signal_trap(libc::SIGQUIT);
    proc::signal_ignore(libc::SIGINT);
    drop_access(&mut io);

    let pool = io.pool.expect("clear keeps the packet pool");
    let input = io.clear.expect("clear keeps its input ring");
    let output = io.encrypt.expect("clear keeps the encrypt ring");

    let dev = match tun::open() {
        Ok(dev) => dev,
        Err(e) => crate::fatal!("tunnel setup failed: {:#}", e),
    };

    proc::drop_privileges(runas);

    // Read target for when the pool is out of buffers; whatever lands
    // here is dropped, which is the backpressure mechanism.
    let mut throwaway = Packet::new_boxed();

    let mut running = true;
    while running {
        if let Some(sig) = proc::last_signal() {
            info!("received signal {}", sig);
            if sig == libc::SIGQUIT {
                running = false;
                continue;
            }
        }

        if proc::wait_readable(dev.as_raw_fd(), 0) {
            recv_packets(&dev, pool.get(), output.get(), &mut throwaway);
        }

        while let Some(idx) = input.get().pop() {
            let pkt = unsafe { pool.get().packet_mut(idx) };
            send_packet(&dev, pkt);
            pool.get().release(idx);
        }

        proc::idle_pause();
    }

    info!("exiting");
}

/// Read up to a batch of plaintext datagrams and queue them for the
/// encrypt worker.
fn recv_packets(dev: &TunDev, pool: &PacketPool, output: &Ring, throwaway: &mut Packet) {
    for _ in 0..PACKETS_PER_EVENT {
        let idx = pool.acquire();
        let pkt: &mut Packet = match idx {
            Some(i) => unsafe { pool.packet_mut(i) },
            None => throwaway,
        };

        match tun::read_packet(dev, pkt) {
            Err(e) => {
                if let Some(i) = idx {
                    pool.release(i);
                }
                match e.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => break,
                    _ => crate::fatal!("tunnel read error: {}", e),
                }
            }
            Ok(0) => crate::fatal!("eof on tunnel device"),
            Ok(n) => {
                let Some(i) = idx else {
                    debug!("pool exhausted, dropped {} byte datagram", n);
                    continue;
                };
                let pkt = unsafe { pool.packet_mut(i) };
                pkt.target = Stage::Encrypt as u32;
                if !output.push(i) {
                    pool.release(i);
                }
            }
        }
    }
}

/// Write one decrypted packet back to the tunnel device. Transient
/// errors drop the packet; the caller releases the buffer either way.
fn send_packet(dev: &TunDev, pkt: &mut Packet) {
    debug_assert_eq!(pkt.target, Stage::Clear as u32);

    loop {
        match tun::write_packet(dev, pkt) {
            Ok(_) => break,
            Err(e) => match e.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    debug!("tunnel write would block, dropping packet");
                    break;
                }
                _ => crate::fatal!("tunnel write error: {}", e),
            },
        }
    }
}
