//! Daemon state shared across all stages: the learned peer endpoint and
//! per-direction traffic counters.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::SeqCst};
use std::time::{SystemTime, UNIX_EPOCH};

/// Counters for one direction of the tunnel.
#[repr(C)]
#[derive(Default)]
pub struct IfStat {
    spi: AtomicU32,
    packets: AtomicU64,
    bytes: AtomicU64,
    last: AtomicU64,
}

impl IfStat {
    pub fn set_spi(&self, spi: u32) {
        self.spi.store(spi, SeqCst);
    }

    pub fn record(&self, bytes: usize) {
        self.packets.fetch_add(1, SeqCst);
        self.bytes.fetch_add(bytes as u64, SeqCst);
        self.last.store(epoch_seconds(), SeqCst);
    }

    pub fn snapshot(&self) -> IfStatSnapshot {
        IfStatSnapshot {
            spi: self.spi.load(SeqCst),
            packets: self.packets.load(SeqCst),
            bytes: self.bytes.load(SeqCst),
            last: self.last.load(SeqCst),
        }
    }
}

/// A point-in-time copy of one direction's counters, as carried in a
/// status response.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IfStatSnapshot {
    pub spi: u32,
    pub packets: u64,
    pub bytes: u64,
    pub last: u64,
}

/// State every worker can see. The peer endpoint is multi-writer (the
/// decrypt stage updates it when the other side roams) and multi-reader
/// (the crypto stage targets it on every send); both sides go through
/// sequentially consistent atomics. The local endpoint is written once
/// before any worker forks.
#[repr(C)]
#[derive(Default)]
pub struct SharedState {
    peer_ip: AtomicU32,
    peer_port: AtomicU32,
    local_ip: u32,
    local_port: u16,
    pub tx: IfStat,
    pub rx: IfStat,
    started: AtomicU64,
}

impl SharedState {
    /// Parent-side initialisation, before any fork.
    pub fn init(&mut self, local: SocketAddrV4, peer: SocketAddrV4) {
        self.local_ip = u32::from(*local.ip());
        self.local_port = local.port();
        self.set_peer(peer);
        self.started.store(epoch_seconds(), SeqCst);
    }

    /// The address the peer was last seen at, or None while it is still
    /// the zero address (nothing received, nothing configured).
    pub fn peer(&self) -> Option<SocketAddrV4> {
        let ip = self.peer_ip.load(SeqCst);
        let port = self.peer_port.load(SeqCst);
        if ip == 0 {
            return None;
        }
        Some(SocketAddrV4::new(Ipv4Addr::from(ip), port as u16))
    }

    pub fn set_peer(&self, addr: SocketAddrV4) {
        self.peer_ip.store(u32::from(*addr.ip()), SeqCst);
        self.peer_port.store(u32::from(addr.port()), SeqCst);
    }

    pub fn local(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.local_ip), self.local_port)
    }

    pub fn uptime_seconds(&self) -> u64 {
        epoch_seconds().saturating_sub(self.started.load(SeqCst))
    }
}

pub fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
