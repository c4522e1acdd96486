//! The keying stage: accepts derived key material on a local unix
//! socket and stages it into the TX and RX handoff cells.
//!
//! Key agreement happens elsewhere; whatever delivers the shared secret
//! writes one fixed-size datagram per rekey.

use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;

use log::info;
use zeroize::Zeroize;

use crate::cipher::KEY_LEN;
use crate::proc::{self, ProcIo, RunAs};
use crate::status;

/// Size of one key-injection datagram: two SPIs and the symmetric key.
pub const KEY_REQUEST_LEN: usize = 8 + KEY_LEN;

/// A decoded key-injection request.
pub struct KeyRequest {
    pub tx_spi: u32,
    pub rx_spi: u32,
    pub key: [u8; KEY_LEN],
}

impl Drop for KeyRequest {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl KeyRequest {
    /// Decode a datagram. Anything but an exact-size request with
    /// non-zero SPIs is ignored.
    pub fn parse(buf: &[u8]) -> Option<KeyRequest> {
        if buf.len() != KEY_REQUEST_LEN {
            return None;
        }
        let tx_spi = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let rx_spi = u32::from_ne_bytes(buf[4..8].try_into().unwrap());
        if tx_spi == 0 || rx_spi == 0 {
            return None;
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&buf[8..]);
        Some(KeyRequest {
            tx_spi,
            rx_spi,
            key,
        })
    }

    /// Encode a request, for the injecting side.
    pub fn encode(&self) -> [u8; KEY_REQUEST_LEN] {
        let mut buf = [0u8; KEY_REQUEST_LEN];
        buf[0..4].copy_from_slice(&self.tx_spi.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.rx_spi.to_ne_bytes());
        buf[8..].copy_from_slice(&self.key);
        buf
    }
}

fn drop_access(io: &mut ProcIo) {
    proc::detach(&mut io.state);
    proc::detach(&mut io.pool);
    proc::detach(&mut io.arwin);
    proc::detach(&mut io.clear);
    proc::detach(&mut io.crypto);
    proc::detach(&mut io.encrypt);
    proc::detach(&mut io.decrypt);
}

/// Worker entry, running in its own forked process.
pub fn run(mut io: ProcIo, runas: Option<RunAs>, path: PathBuf, owner: Option<RunAs>) {
    proc::signal_trap(libc::SIGQUIT);
    proc::signal_ignore(libc::SIGINT);
    drop_access(&mut io);

    let tx = io.tx.expect("keying keeps the TX key cell");
    let rx = io.rx.expect("keying keeps the RX key cell");

    let socket = match status::bind_control_socket(&path, owner) {
        Ok(socket) => socket,
        Err(e) => crate::fatal!("keying socket setup failed: {:#}", e),
    };

    proc::drop_privileges(runas);

    let mut running = true;
    while running {
        if let Some(sig) = proc::last_signal() {
            info!("received signal {}", sig);
            if sig == libc::SIGQUIT {
                running = false;
                continue;
            }
        }

        if proc::wait_readable(socket.as_raw_fd(), -1) {
            handle_requests(&socket, tx.get(), rx.get());
        }
    }

    info!("exiting");
}

fn handle_requests(socket: &UnixDatagram, tx: &crate::keys::KeyCell, rx: &crate::keys::KeyCell) {
    let mut buf = [0u8; KEY_REQUEST_LEN + 1];

    loop {
        match socket.recv(&mut buf) {
            Err(e) => match e.kind() {
                std::io::ErrorKind::WouldBlock => break,
                std::io::ErrorKind::Interrupted => continue,
                _ => crate::fatal!("keying socket read error: {}", e),
            },
            Ok(n) => {
                let req = KeyRequest::parse(&buf[..n]);
                buf.zeroize();

                let Some(req) = req else {
                    info!("ignoring malformed key injection ({} bytes)", n);
                    continue;
                };

                tx.publish(req.tx_spi, &req.key);
                rx.publish(req.rx_spi, &req.key);
                info!(
                    "staged new keys (tx spi=0x{:08x}, rx spi=0x{:08x})",
                    req.tx_spi, req.rx_spi
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encode_parse_round_trip() {
        let req = KeyRequest {
            tx_spi: 0x0A0B0C0D,
            rx_spi: 0x01020304,
            key: [0x5A; KEY_LEN],
        };
        let wire = req.encode();
        assert_eq!(wire.len(), 40);

        let parsed = KeyRequest::parse(&wire).unwrap();
        assert_eq!(parsed.tx_spi, 0x0A0B0C0D);
        assert_eq!(parsed.rx_spi, 0x01020304);
        assert_eq!(parsed.key, [0x5A; KEY_LEN]);
    }

    #[test]
    fn short_long_and_zero_spi_requests_are_ignored() {
        let req = KeyRequest {
            tx_spi: 1,
            rx_spi: 2,
            key: [0; KEY_LEN],
        };
        let wire = req.encode();

        assert!(KeyRequest::parse(&wire[..39]).is_none());
        let mut long = wire.to_vec();
        long.push(0);
        assert!(KeyRequest::parse(&long).is_none());

        let mut zero_spi = wire;
        zero_spi[0..4].copy_from_slice(&0u32.to_ne_bytes());
        assert!(KeyRequest::parse(&zero_spi).is_none());
    }
}
