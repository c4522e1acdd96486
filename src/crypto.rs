//! The crypto stage: UDP I/O with the peer.
//!
//! Sealed datagrams from the peer are sanity-checked (length, sequence
//! mirror, a permissive replay pre-check) and queued for the decrypt
//! worker; sealed packets from the encrypt worker are sent to wherever
//! the peer was last seen.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::os::unix::io::AsRawFd;

use anyhow::{Context, Result};
use log::{debug, info};

use crate::esp::{self, EspHeader};
use crate::packet::{Packet, PacketPool};
use crate::proc::{self, ProcIo, RunAs, Stage};
use crate::replay::ReplayWindow;
use crate::ring::Ring;
use crate::state::SharedState;

/// Upper bound on datagrams moved per wakeup, per direction.
const PACKETS_PER_EVENT: usize = 32;

/// Bind the peer-facing socket: non-blocking, don't-fragment so the
/// kernel surfaces path-MTU problems instead of fragmenting ESP.
pub fn bind_socket(local: SocketAddrV4) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::V4(local))
        .with_context(|| format!("failed to bind UDP socket on {}", local))?;
    socket
        .set_nonblocking(true)
        .context("failed to set socket non-blocking")?;

    #[cfg(target_os = "linux")]
    {
        let val: libc::c_int = libc::IP_PMTUDISC_DO;
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_MTU_DISCOVER,
                &val as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret == -1 {
            return Err(io::Error::last_os_error()).context("setsockopt(IP_MTU_DISCOVER) failed");
        }
    }

    #[cfg(target_os = "macos")]
    {
        let val: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_DONTFRAG,
                &val as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret == -1 {
            return Err(io::Error::last_os_error()).context("setsockopt(IP_DONTFRAG) failed");
        }
    }

    Ok(socket)
}

/// Ingress admission: structurally sound and not provably stale. The
/// replay check here is widened by the decrypt queue depth so packets
/// the decrypt worker has not drained yet are not falsely refused; the
/// strict check happens in the decrypt stage.
pub fn admit_ingress(pkt: &Packet, arwin: &ReplayWindow) -> bool {
    if !esp::checklen(pkt) {
        return false;
    }
    let hdr = EspHeader::parse(pkt.head()).expect("checklen guarantees a full header");
    if hdr.pn as u32 != hdr.seq {
        return false;
    }
    if !arwin.precheck(hdr.pn) {
        info!("dropped too-old packet (pn=0x{:x})", hdr.pn);
        return false;
    }
    true
}

fn drop_access(io: &mut ProcIo) {
    proc::detach(&mut io.tx);
    proc::detach(&mut io.rx);
    proc::detach(&mut io.clear);
    proc::detach(&mut io.encrypt);
}

/// Worker entry, running in its own forked process.
pub fn run(mut io: ProcIo, runas: Option<RunAs>) {
    proc::signal_trap(libc::SIGQUIT);
    proc::signal_ignore(libc::SIGINT);
    drop_access(&mut io);

    let state = io.state.expect("crypto keeps the shared state");
    let pool = io.pool.expect("crypto keeps the packet pool");
    let arwin = io.arwin.expect("crypto keeps the anti-replay window");
    let input = io.crypto.expect("crypto keeps its input ring");
    let output = io.decrypt.expect("crypto keeps the decrypt ring");

    let socket = match bind_socket(state.get().local()) {
        Ok(socket) => socket,
        Err(e) => crate::fatal!("crypto socket setup failed: {:#}", e),
    };

    proc::drop_privileges(runas);

    let mut throwaway = Packet::new_boxed();
    let mut mtu_logged = false;

    let mut running = true;
    while running {
        if let Some(sig) = proc::last_signal() {
            info!("received signal {}", sig);
            if sig == libc::SIGQUIT {
                running = false;
                continue;
            }
        }

        if proc::wait_readable(socket.as_raw_fd(), 0) {
            recv_packets(&socket, pool.get(), arwin.get(), output.get(), &mut throwaway);
        }

        while let Some(idx) = input.get().pop() {
            let pkt = unsafe { pool.get().packet_mut(idx) };
            send_packet(&socket, state.get(), pkt, &mut mtu_logged);
            pool.get().release(idx);
        }

        proc::idle_pause();
    }

    info!("exiting");
}

/// Read up to a batch of datagrams from the peer socket and queue the
/// admissible ones for decryption.
fn recv_packets(
    socket: &UdpSocket,
    pool: &PacketPool,
    arwin: &ReplayWindow,
    output: &Ring,
    throwaway: &mut Packet,
) {
    for _ in 0..PACKETS_PER_EVENT {
        let idx = pool.acquire();
        let pkt: &mut Packet = match idx {
            Some(i) => unsafe { pool.packet_mut(i) },
            None => throwaway,
        };

        match socket.recv_from(pkt.head_mut()) {
            Err(e) => {
                if let Some(i) = idx {
                    pool.release(i);
                }
                match e.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => crate::fatal!("crypto socket read error: {}", e),
                }
            }
            Ok((n, src)) => {
                let Some(i) = idx else {
                    debug!("pool exhausted, dropped {} byte datagram", n);
                    continue;
                };
                let pkt = unsafe { pool.packet_mut(i) };
                pkt.length = n;
                pkt.target = Stage::Decrypt as u32;
                match src {
                    SocketAddr::V4(addr) => pkt.set_source(addr),
                    SocketAddr::V6(_) => {
                        pool.release(i);
                        continue;
                    }
                }

                if !admit_ingress(pkt, arwin) || !output.push(i) {
                    pool.release(i);
                }
            }
        }
    }
}

/// Send one sealed packet to the current peer address. The packet is
/// dropped when no peer is known yet, or on any per-packet send error.
fn send_packet(socket: &UdpSocket, state: &SharedState, pkt: &Packet, mtu_logged: &mut bool) {
    debug_assert_eq!(pkt.target, Stage::Crypto as u32);

    let Some(peer) = state.peer() else {
        debug!("no peer address yet, dropping sealed packet");
        return;
    };

    loop {
        match socket.send_to(&pkt.head()[..pkt.length], SocketAddr::V4(peer)) {
            Ok(_) => break,
            Err(e) => match (e.kind(), e.raw_os_error()) {
                (io::ErrorKind::Interrupted, _) => continue,
                (io::ErrorKind::WouldBlock, _) => break,
                (_, Some(libc::EMSGSIZE)) => {
                    if !*mtu_logged {
                        info!(
                            "packet (size={}) too large for path MTU, lower tunnel MTU",
                            pkt.length
                        );
                        *mtu_logged = true;
                    }
                    break;
                }
                (_, Some(libc::ENETUNREACH)) | (_, Some(libc::EHOSTUNREACH)) => {
                    info!("host {} unreachable ({})", peer, e);
                    break;
                }
                _ => crate::fatal!("crypto socket send error: {}", e),
            },
        }
    }
}
