//! The status control surface and the unix-socket plumbing shared with
//! the keying stage.
//!
//! A client sends a single request byte and gets back a fixed-size
//! record with both directions' counters. The supervisor services this
//! socket; the `skyctl` binary is the matching client.

use std::os::unix::net::UnixDatagram;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};

use crate::proc::RunAs;
use crate::state::{IfStatSnapshot, SharedState};

/// Request byte for a status dump.
pub const CTL_STATUS: u8 = 1;

/// One direction's slice of the response: spi, padding, packets, bytes,
/// last-activity epoch seconds.
const IFSTAT_LEN: usize = 32;

/// Full response: TX stats followed by RX stats.
pub const STATUS_RESPONSE_LEN: usize = 2 * IFSTAT_LEN;

fn encode_ifstat(buf: &mut [u8], snap: &IfStatSnapshot) {
    buf[0..4].copy_from_slice(&snap.spi.to_ne_bytes());
    buf[8..16].copy_from_slice(&snap.packets.to_ne_bytes());
    buf[16..24].copy_from_slice(&snap.bytes.to_ne_bytes());
    buf[24..32].copy_from_slice(&snap.last.to_ne_bytes());
}

fn decode_ifstat(buf: &[u8]) -> IfStatSnapshot {
    IfStatSnapshot {
        spi: u32::from_ne_bytes(buf[0..4].try_into().unwrap()),
        packets: u64::from_ne_bytes(buf[8..16].try_into().unwrap()),
        bytes: u64::from_ne_bytes(buf[16..24].try_into().unwrap()),
        last: u64::from_ne_bytes(buf[24..32].try_into().unwrap()),
    }
}

/// Serialise a status response.
pub fn encode_response(
    tx: &IfStatSnapshot,
    rx: &IfStatSnapshot,
) -> [u8; STATUS_RESPONSE_LEN] {
    let mut buf = [0u8; STATUS_RESPONSE_LEN];
    encode_ifstat(&mut buf[..IFSTAT_LEN], tx);
    encode_ifstat(&mut buf[IFSTAT_LEN..], rx);
    buf
}

/// Parse a status response. Returns (tx, rx).
pub fn decode_response(buf: &[u8]) -> Option<(IfStatSnapshot, IfStatSnapshot)> {
    if buf.len() != STATUS_RESPONSE_LEN {
        return None;
    }
    Some((
        decode_ifstat(&buf[..IFSTAT_LEN]),
        decode_ifstat(&buf[IFSTAT_LEN..]),
    ))
}

/// Bind a non-blocking unix datagram socket at `path`, mode 0700, owned
/// by `owner` when configured. Used for both the status and the keying
/// sockets.
pub fn bind_control_socket(path: &Path, owner: Option<RunAs>) -> Result<UnixDatagram> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("failed to unlink {:?}", path)),
    }

    let socket =
        UnixDatagram::bind(path).with_context(|| format!("failed to bind {:?}", path))?;
    socket
        .set_nonblocking(true)
        .context("failed to set control socket non-blocking")?;

    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .context("control socket path contains NUL")?;

    if let Some(owner) = owner {
        if unsafe { libc::chown(cpath.as_ptr(), owner.uid, owner.gid) } == -1 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to chown {:?}", path));
        }
    }
    if unsafe { libc::chmod(cpath.as_ptr(), 0o700) } == -1 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("failed to chmod {:?}", path));
    }

    info!("control socket bound at {:?}", path);
    Ok(socket)
}

/// Answer one pending status request, if any. The client must bind its
/// own socket path so there is an address to answer to.
pub fn handle_request(socket: &UnixDatagram, state: &SharedState) {
    let mut buf = [0u8; 8];

    loop {
        match socket.recv_from(&mut buf) {
            Err(e) => match e.kind() {
                std::io::ErrorKind::WouldBlock => break,
                std::io::ErrorKind::Interrupted => continue,
                _ => crate::fatal!("status socket read error: {}", e),
            },
            Ok((n, addr)) => {
                if n != 1 || buf[0] != CTL_STATUS {
                    debug!("ignoring malformed status request ({} bytes)", n);
                    continue;
                }
                let Some(reply_to) = addr.as_pathname() else {
                    debug!("status request from unbound client, cannot reply");
                    continue;
                };
                let response =
                    encode_response(&state.tx.snapshot(), &state.rx.snapshot());
                if let Err(e) = socket.send_to(&response, reply_to) {
                    debug!("status reply to {:?} failed: {}", reply_to, e);
                }
            }
        }
    }
}
