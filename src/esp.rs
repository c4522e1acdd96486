//! ESP tunnel-mode framing and the per-direction security association.
//!
//! Wire layout of one datagram, all integers big-endian:
//!
//! ```text
//! 0        4        8                16                N-16      N
//! | SPI    | seq    | packet number  | ciphertext ...  | GCM tag |
//! ```
//!
//! `seq` mirrors the low 32 bits of the 64-bit packet number. The
//! ciphertext covers the plaintext IP packet followed by a two-byte
//! trailer `{pad = 0, next = 4}`. The nonce is the SA salt followed by
//! the packet number, the AAD is the SPI followed by the packet number,
//! both big-endian on both peers regardless of host byte order.

use crate::cipher::{Cipher, AAD_LEN, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::packet::{Packet, PACKET_DATA_LEN, PACKET_HEAD_LEN, PACKET_MAX_LEN};
use crate::replay::ReplayWindow;

/// ESP header plus the trailing 64-bit packet number.
pub const ESP_HEAD_LEN: usize = PACKET_HEAD_LEN;

/// Pad-length and next-header bytes appended to the plaintext.
pub const ESP_TRAILER_LEN: usize = 2;

/// Next-header value for IPv4-in-IPv4 tunnel mode.
pub const NEXT_HEADER_IPV4: u8 = 4;

/// Smallest datagram that can possibly carry a sealed packet.
pub const ESP_MIN_LEN: usize = ESP_HEAD_LEN + ESP_TRAILER_LEN + TAG_LEN;

/// The decoded head of a sealed datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EspHeader {
    pub spi: u32,
    pub seq: u32,
    pub pn: u64,
}

impl EspHeader {
    /// Decode the header from wire bytes. Returns None when the buffer
    /// cannot hold a full header.
    pub fn parse(buf: &[u8]) -> Option<EspHeader> {
        if buf.len() < ESP_HEAD_LEN {
            return None;
        }
        Some(EspHeader {
            spi: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            seq: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            pn: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.spi.to_be_bytes());
        buf[4..8].copy_from_slice(&self.seq.to_be_bytes());
        buf[8..16].copy_from_slice(&self.pn.to_be_bytes());
    }
}

/// 12-byte nonce: salt then packet number.
pub fn nonce(salt: u32, pn: u64) -> [u8; NONCE_LEN] {
    let mut out = [0u8; NONCE_LEN];
    out[0..4].copy_from_slice(&salt.to_be_bytes());
    out[4..12].copy_from_slice(&pn.to_be_bytes());
    out
}

/// 12-byte AAD: SPI then packet number.
pub fn aad(spi: u32, pn: u64) -> [u8; AAD_LEN] {
    let mut out = [0u8; AAD_LEN];
    out[0..4].copy_from_slice(&spi.to_be_bytes());
    out[4..12].copy_from_slice(&pn.to_be_bytes());
    out
}

/// A security association for one direction.
///
/// The key-injection format carries no explicit salt, so the salt is the
/// SPI value; both peers derive the same nonce prefix by construction.
#[derive(Default)]
pub struct Sa {
    pub spi: u32,
    pub salt: u32,
    pub seq: u64,
    cipher: Option<Cipher>,
}

impl Sa {
    /// Whether this SA can currently seal or open packets.
    pub fn active(&self) -> bool {
        self.cipher.is_some()
    }

    /// Bind a fresh key to this SA, replacing whatever it held.
    pub fn rekey(&mut self, spi: u32, key: &[u8; KEY_LEN]) -> anyhow::Result<()> {
        self.cipher = Some(Cipher::setup(key)?);
        self.spi = spi;
        self.salt = spi;
        self.seq = 1;
        Ok(())
    }

    /// Tear the SA down; it no longer matches any traffic.
    pub fn reset(&mut self) {
        self.cipher = None;
        self.spi = 0;
        self.salt = 0;
        self.seq = 0;
    }

    /// Move another SA's identity into this one, leaving the source
    /// empty. Used when the pending RX slot is promoted to current.
    pub fn take_from(&mut self, other: &mut Sa) {
        self.spi = other.spi;
        self.salt = other.salt;
        self.seq = other.seq;
        self.cipher = other.cipher.take();
        other.reset();
    }

    /// Claim the next packet number. When the counter space is used up
    /// the SA is torn down; traffic stops until a rekey arrives.
    fn next_pn(&mut self) -> Option<u64> {
        let pn = self.seq;
        if pn == u64::MAX {
            self.reset();
            return None;
        }
        self.seq += 1;
        Some(pn)
    }
}

/// Frame and seal a plaintext packet in place under `sa`.
///
/// Returns false when the packet must be dropped (no key, or packet
/// numbers exhausted). A bounds violation means a corrupted length field
/// and is fatal.
pub fn seal_packet(sa: &mut Sa, pkt: &mut Packet) -> bool {
    if !sa.active() || pkt.length > PACKET_DATA_LEN {
        return false;
    }

    let plain_len = pkt.length;
    let total = ESP_HEAD_LEN
        .checked_add(plain_len)
        .and_then(|n| n.checked_add(ESP_TRAILER_LEN))
        .and_then(|n| n.checked_add(TAG_LEN));
    match total {
        Some(n) if n <= PACKET_MAX_LEN => {}
        _ => crate::fatal!("packet length {} corrupts buffer bounds", plain_len),
    }

    let pn = match sa.next_pn() {
        Some(pn) => pn,
        None => return false,
    };

    let hdr = EspHeader {
        spi: sa.spi,
        seq: pn as u32,
        pn,
    };

    let nonce = nonce(sa.salt, pn);
    let aad = aad(sa.spi, pn);
    let spi = sa.spi;
    let cipher = sa.cipher.as_ref().expect("active SA has a cipher");

    let buf = pkt.head_mut();
    hdr.write(buf);
    buf[ESP_HEAD_LEN + plain_len] = 0;
    buf[ESP_HEAD_LEN + plain_len + 1] = NEXT_HEADER_IPV4;

    let ct_len = plain_len + ESP_TRAILER_LEN;
    let tag = match cipher.seal(&nonce, &aad, &mut buf[ESP_HEAD_LEN..ESP_HEAD_LEN + ct_len]) {
        Ok(tag) => tag,
        Err(e) => crate::fatal!("cipher failure sealing spi=0x{:08x}: {}", spi, e),
    };
    buf[ESP_HEAD_LEN + ct_len..ESP_HEAD_LEN + ct_len + TAG_LEN].copy_from_slice(&tag);

    pkt.length = ESP_HEAD_LEN + ct_len + TAG_LEN;
    true
}

/// Whether a datagram is even long enough to be a sealed packet.
pub fn checklen(pkt: &Packet) -> bool {
    pkt.length >= ESP_MIN_LEN && pkt.length <= PACKET_MAX_LEN
}

/// Attempt to authenticate and decrypt a sealed packet under `sa`.
///
/// Returns false when the packet does not belong to this SA or fails
/// authentication; the caller may then try the pending slot. The packet
/// bytes are modified in place either way, so the caller must re-seal or
/// drop on failure — with a 16-byte tag the plaintext of a forged packet
/// is never forwarded.
pub fn open_packet(sa: &Sa, pkt: &mut Packet, hdr: &EspHeader) -> bool {
    let cipher = match &sa.cipher {
        Some(c) => c,
        None => return false,
    };
    if hdr.spi != sa.spi || !checklen(pkt) {
        return false;
    }

    let nonce = nonce(sa.salt, hdr.pn);
    let aad = aad(hdr.spi, hdr.pn);

    let ct_end = pkt.length - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    let buf = pkt.head_mut();
    tag.copy_from_slice(&buf[ct_end..ct_end + TAG_LEN]);

    cipher.open(&nonce, &aad, &tag, &mut buf[ESP_HEAD_LEN..ct_end])
}

/// Validate and strip the trailer of a successfully opened packet,
/// leaving `pkt.length` as the plaintext length. Returns false on a
/// malformed trailer; the packet is then dropped.
pub fn strip_packet(pkt: &mut Packet) -> bool {
    let plain_len = pkt.length - ESP_HEAD_LEN - ESP_TRAILER_LEN - TAG_LEN;
    let data = pkt.data();
    if data[plain_len] != 0 || data[plain_len + 1] != NEXT_HEADER_IPV4 {
        return false;
    }
    pkt.length = plain_len;
    true
}

/// The strict anti-replay admission test, shared between the check in the
/// decrypt stage and the tests: a packet number is acceptable when the
/// header is self-consistent and the window has not seen it.
pub fn replay_admissible(hdr: &EspHeader, arwin: &ReplayWindow) -> bool {
    hdr.pn as u32 == hdr.seq && arwin.check(hdr.pn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa_pair(spi: u32) -> (Sa, Sa) {
        let key = [0u8; KEY_LEN];
        let mut tx = Sa::default();
        let mut rx = Sa::default();
        tx.rekey(spi, &key).unwrap();
        rx.rekey(spi, &key).unwrap();
        (tx, rx)
    }

    fn plaintext_packet(payload: &[u8]) -> Box<Packet> {
        let mut pkt = Packet::new_boxed();
        pkt.data_mut()[..payload.len()].copy_from_slice(payload);
        pkt.length = payload.len();
        pkt
    }

    #[test]
    fn header_is_big_endian_on_the_wire() {
        let hdr = EspHeader {
            spi: 0x01020304,
            seq: 0x05060708,
            pn: 0x0102030405060708,
        };
        let mut buf = [0u8; ESP_HEAD_LEN];
        hdr.write(&mut buf);
        assert_eq!(
            buf,
            [1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6, 7, 8],
            "all header fields must serialise big-endian"
        );
        assert_eq!(EspHeader::parse(&buf), Some(hdr));
    }

    #[test]
    fn nonce_and_aad_layout() {
        let n = nonce(0xAABBCCDD, 0x1122334455667788);
        assert_eq!(&n[0..4], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&n[4..12], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);

        let a = aad(0x01020304, 2);
        assert_eq!(&a[0..4], &[1, 2, 3, 4]);
        assert_eq!(&a[4..12], &[0, 0, 0, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn seal_open_round_trip() {
        for size in [1usize, 64, 512, 1500] {
            let (mut tx, rx) = sa_pair(0x01020304);
            let payload: Vec<u8> = (0..size).map(|i| i as u8).collect();
            let mut pkt = plaintext_packet(&payload);

            assert!(seal_packet(&mut tx, &mut pkt));
            assert_eq!(pkt.length, ESP_HEAD_LEN + size + ESP_TRAILER_LEN + TAG_LEN);

            let hdr = EspHeader::parse(pkt.head()).unwrap();
            assert_eq!(hdr.spi, 0x01020304);
            assert_eq!(hdr.pn, 1, "first packet number after install is 1");
            assert_eq!(hdr.seq, 1, "seq mirrors the low packet number bits");

            assert!(open_packet(&rx, &mut pkt, &hdr));
            assert!(strip_packet(&mut pkt));
            assert_eq!(pkt.length, size);
            assert_eq!(&pkt.data()[..size], payload.as_slice());
        }
    }

    #[test]
    fn sequence_is_monotone() {
        let (mut tx, _) = sa_pair(7);
        for expect in 1..=5u64 {
            let mut pkt = plaintext_packet(b"x");
            assert!(seal_packet(&mut tx, &mut pkt));
            let hdr = EspHeader::parse(pkt.head()).unwrap();
            assert_eq!(hdr.pn, expect);
        }
    }

    #[test]
    fn exhausted_counter_disables_the_sa() {
        let (mut tx, _) = sa_pair(7);
        tx.seq = u64::MAX;
        let mut pkt = plaintext_packet(b"x");
        assert!(!seal_packet(&mut tx, &mut pkt));
        assert!(!tx.active(), "SA must be unusable after exhaustion");
    }

    #[test]
    fn tamper_anywhere_is_rejected() {
        let (mut tx, rx) = sa_pair(0xDEAD);
        let payload = [0x5Au8; 256];

        // Flip one bit in every region of the sealed datagram. SPI, PN,
        // ciphertext and tag flips must fail authentication; flips in
        // the 32-bit sequence mirror are caught by the admission check
        // against the packet number instead.
        let mut reference = plaintext_packet(&payload);
        assert!(seal_packet(&mut tx, &mut reference));
        let wire_len = reference.length;

        for byte in 0..wire_len {
            let mut pkt = Packet::new_boxed();
            pkt.head_mut()[..wire_len].copy_from_slice(&reference.head()[..wire_len]);
            pkt.length = wire_len;
            pkt.head_mut()[byte] ^= 0x01;

            let hdr = EspHeader::parse(pkt.head()).unwrap();
            if (4..8).contains(&byte) {
                let arwin = ReplayWindow::default();
                assert!(
                    !replay_admissible(&hdr, &arwin),
                    "seq flip at byte {} must fail the mirror check",
                    byte
                );
            } else {
                assert!(
                    !open_packet(&rx, &mut pkt, &hdr),
                    "bit flip at byte {} must not verify",
                    byte
                );
            }
        }
    }

    #[test]
    fn wrong_spi_does_not_match() {
        let (mut tx, _) = sa_pair(0x10);
        let (_, other_rx) = sa_pair(0x20);
        let mut pkt = plaintext_packet(b"hello");
        assert!(seal_packet(&mut tx, &mut pkt));
        let hdr = EspHeader::parse(pkt.head()).unwrap();
        assert!(!open_packet(&other_rx, &mut pkt, &hdr));
    }

    #[test]
    fn corrupt_trailer_is_dropped_after_valid_tag() {
        // Seal by hand with a bogus next-header so the tag verifies but
        // the trailer does not.
        let (tx, rx) = sa_pair(0x31);
        let payload = b"datagram";
        let mut pkt = plaintext_packet(payload);
        let plain_len = pkt.length;

        let pn = 1u64;
        let hdr = EspHeader {
            spi: tx.spi,
            seq: pn as u32,
            pn,
        };
        let n = nonce(tx.salt, pn);
        let a = aad(tx.spi, pn);
        let buf = pkt.head_mut();
        hdr.write(buf);
        buf[ESP_HEAD_LEN + plain_len] = 0;
        buf[ESP_HEAD_LEN + plain_len + 1] = 41; // not IPv4-in-IPv4
        let ct_len = plain_len + ESP_TRAILER_LEN;
        let cipher = Cipher::setup(&[0u8; KEY_LEN]).unwrap();
        let tag = cipher
            .seal(&n, &a, &mut buf[ESP_HEAD_LEN..ESP_HEAD_LEN + ct_len])
            .unwrap();
        buf[ESP_HEAD_LEN + ct_len..ESP_HEAD_LEN + ct_len + TAG_LEN].copy_from_slice(&tag);
        pkt.length = ESP_HEAD_LEN + ct_len + TAG_LEN;

        let hdr = EspHeader::parse(pkt.head()).unwrap();
        assert!(open_packet(&rx, &mut pkt, &hdr), "tag itself is valid");
        assert!(!strip_packet(&mut pkt), "trailer must reject next != 4");
    }

    #[test]
    fn short_datagrams_fail_checklen() {
        let mut pkt = Packet::new_boxed();
        pkt.length = ESP_MIN_LEN - 1;
        assert!(!checklen(&pkt));
        pkt.length = ESP_MIN_LEN;
        assert!(checklen(&pkt));
    }
}
