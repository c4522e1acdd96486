//! AES-256-GCM behind the four operations the data path needs.
//!
//! The nonce is built by the caller from the SA salt and the packet
//! number, so every invocation carries an explicit nonce; `LessSafeKey`
//! is the ring API for exactly that arrangement.

use anyhow::{anyhow, Result};
use ring::aead::{self, Aad, LessSafeKey, Nonce, Tag, UnboundKey, AES_256_GCM};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const AAD_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// One direction's cipher state.
pub struct Cipher {
    key: LessSafeKey,
}

impl Cipher {
    /// Expand a 256-bit key into a usable cipher context.
    pub fn setup(key: &[u8; KEY_LEN]) -> Result<Cipher> {
        let unbound =
            UnboundKey::new(&AES_256_GCM, key).map_err(|_| anyhow!("AES-256-GCM key rejected"))?;
        Ok(Cipher {
            key: LessSafeKey::new(unbound),
        })
    }

    /// Bytes of overhead appended to the ciphertext: the GCM tag.
    pub const fn overhead() -> usize {
        TAG_LEN
    }

    /// Encrypt `buf` in place and return the tag to append behind it.
    /// A failure here means the primitive itself broke, which the caller
    /// treats as fatal.
    pub fn seal(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8; AAD_LEN],
        buf: &mut [u8],
    ) -> Result<[u8; TAG_LEN]> {
        let nonce = Nonce::assume_unique_for_key(*nonce);
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::from(*aad), buf)
            .map_err(|_| anyhow!("AES-256-GCM seal failed"))?;
        let mut out = [0u8; TAG_LEN];
        out.copy_from_slice(tag.as_ref());
        Ok(out)
    }

    /// Decrypt `buf` in place and verify it against `tag`. Returns false
    /// when authentication fails; the packet is then dropped (or retried
    /// against the pending RX slot).
    pub fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8; AAD_LEN],
        tag: &[u8; TAG_LEN],
        buf: &mut [u8],
    ) -> bool {
        let nonce = Nonce::assume_unique_for_key(*nonce);
        self.key
            .open_in_place_separate_tag(nonce, Aad::from(*aad), Tag::from(*tag), buf, 0..)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [0u8; KEY_LEN];
    const NONCE: [u8; NONCE_LEN] = [1u8; NONCE_LEN];
    const AAD: [u8; AAD_LEN] = [2u8; AAD_LEN];

    #[test]
    fn seal_then_open_round_trips() {
        let cipher = Cipher::setup(&KEY).unwrap();
        let plaintext = b"attack at dawn".to_vec();

        let mut buf = plaintext.clone();
        let tag = cipher.seal(&NONCE, &AAD, &mut buf).unwrap();
        assert_ne!(buf, plaintext, "ciphertext should differ from plaintext");

        assert!(cipher.open(&NONCE, &AAD, &tag, &mut buf));
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn bad_tag_is_rejected() {
        let cipher = Cipher::setup(&KEY).unwrap();
        let mut buf = b"some payload".to_vec();
        let mut tag = cipher.seal(&NONCE, &AAD, &mut buf).unwrap();
        tag[0] ^= 0x01;
        assert!(!cipher.open(&NONCE, &AAD, &tag, &mut buf));
    }

    #[test]
    fn aad_is_authenticated() {
        let cipher = Cipher::setup(&KEY).unwrap();
        let mut buf = b"some payload".to_vec();
        let tag = cipher.seal(&NONCE, &AAD, &mut buf).unwrap();
        let mut wrong_aad = AAD;
        wrong_aad[11] ^= 0x80;
        assert!(!cipher.open(&NONCE, &wrong_aad, &tag, &mut buf));
    }
}
