//! Fixed-size packet buffers and the process-shared pool they live in.
//!
//! A buffer is always owned by exactly one stage, or sits in the pool's
//! free list. Ownership moves by passing the buffer's pool index through
//! the inter-stage rings; the free list is itself a ring of indices.

use std::cell::UnsafeCell;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::ring::Ring;

/// Total space in one buffer: 16 bytes of ESP head room, up to 1500 bytes
/// of payload, and slack for the ESP trailer plus the AEAD tag.
pub const PACKET_MAX_LEN: usize = 2048;

/// Largest datagram we accept from either interface. No jumbo frames.
pub const PACKET_DATA_LEN: usize = 1500;

/// Head room reserved in front of the payload for the ESP header and the
/// 64-bit packet number.
pub const PACKET_HEAD_LEN: usize = 16;

/// Number of buffers in the shared pool.
pub const POOL_SIZE: usize = 1024;

/// A network packet in flight through the pipeline.
#[repr(C)]
pub struct Packet {
    /// Number of meaningful bytes. For plaintext packets this counts from
    /// the data offset; for sealed packets it counts from the head.
    pub length: usize,
    /// The stage this packet is routed to next (a [`crate::proc::Stage`]
    /// discriminant).
    pub target: u32,
    src_ip: u32,
    src_port: u16,
    buf: [u8; PACKET_MAX_LEN],
}

impl Packet {
    /// A zeroed, heap-allocated packet. Each I/O stage keeps one of these
    /// as a throwaway read target for when the pool runs dry.
    pub fn new_boxed() -> Box<Packet> {
        Box::new(Packet {
            length: 0,
            target: 0,
            src_ip: 0,
            src_port: 0,
            buf: [0u8; PACKET_MAX_LEN],
        })
    }

    /// The whole buffer, starting at the ESP header position.
    pub fn head(&self) -> &[u8] {
        &self.buf
    }

    pub fn head_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// The payload area behind the ESP head room.
    pub fn data(&self) -> &[u8] {
        &self.buf[PACKET_HEAD_LEN..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PACKET_HEAD_LEN..]
    }

    /// Record where an ingress datagram came from.
    pub fn set_source(&mut self, addr: SocketAddrV4) {
        self.src_ip = u32::from(*addr.ip());
        self.src_port = addr.port();
    }

    pub fn source(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.src_ip), self.src_port)
    }
}

/// The shared pool: a free list of indices in front of the buffer array.
///
/// Buffer addresses are never passed between processes; only indices are,
/// and each process resolves them against its own attachment of the pool
/// mapping.
#[repr(C)]
pub struct PacketPool {
    free: Ring,
    packets: [UnsafeCell<Packet>; POOL_SIZE],
}

// Access to individual buffers is serialised by the ownership rule: a
// buffer index is held by exactly one stage at a time.
unsafe impl Sync for PacketPool {}

impl PacketPool {
    /// Initialise the pool in place inside a zeroed shared mapping,
    /// populating the free list with every buffer index.
    pub fn init(&mut self) {
        self.free.init(POOL_SIZE);
        for idx in 0..POOL_SIZE {
            assert!(self.free.push(idx));
        }
    }

    /// Take a buffer out of the pool. Returns None when the pool is
    /// empty; ingress paths then fall back to their throwaway buffer and
    /// drop the datagram.
    pub fn acquire(&self) -> Option<usize> {
        let idx = self.free.pop()?;
        // A fresh buffer starts with no payload and no routing decision.
        let pkt = unsafe { self.packet_mut(idx) };
        pkt.length = 0;
        pkt.target = 0;
        Some(idx)
    }

    /// Return a buffer to the pool.
    pub fn release(&self, idx: usize) {
        let _pushed = self.free.push(idx);
        debug_assert!(_pushed, "free list can always hold every buffer");
    }

    /// Resolve an index to its buffer.
    ///
    /// # Safety
    ///
    /// The caller must own `idx`: it was acquired from this pool or
    /// dequeued from an inter-stage ring, and has not been released or
    /// forwarded since.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn packet_mut(&self, idx: usize) -> &mut Packet {
        assert!(idx < POOL_SIZE, "packet index {} out of range", idx);
        &mut *self.packets[idx].get()
    }
}
