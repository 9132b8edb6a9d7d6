//! Payload masking (RFC 6455 Section 5.3).
//!
//! Masking XORs every payload byte with one byte of a 4-byte key, cycling through the key.
//! The operation is its own inverse, so the same function masks outbound frames and unmasks
//! inbound ones.

use rand::{rngs::StdRng, RngCore, SeedableRng};

/// Mask/unmask a payload in place.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    apply_mask_fast32(buf, mask);
}

/// Byte-at-a-time masking.
#[inline]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Masks the aligned middle of the buffer one `u32` at a time.
///
/// The key is rotated by the length of the unaligned prefix so that the word loop continues
/// the byte cycle where the prefix left it.
#[inline]
fn apply_mask_fast32(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);

    // SAFETY: every bit pattern is a valid u32 and u8, so reinterpreting the aligned
    // middle part of the slice is sound.
    let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u32>() };
    apply_mask_fallback(prefix, mask);

    let head = prefix.len() & 3;
    let mask_u32 = if head > 0 {
        if cfg!(target_endian = "big") {
            mask_u32.rotate_left(8 * head as u32)
        } else {
            mask_u32.rotate_right(8 * head as u32)
        }
    } else {
        mask_u32
    };

    for word in words.iter_mut() {
        *word ^= mask_u32;
    }
    apply_mask_fallback(suffix, mask_u32.to_ne_bytes());
}

/// Source of masking keys for one connection.
///
/// Masking exists to defeat cache poisoning in intermediaries, not for secrecy, so the keys only
/// need to be unpredictable to the peer. Each connection owns its generator, which keeps key
/// generation free of shared state and lets tests inject a seeded one.
pub struct MaskGenerator {
    rng: StdRng,
}

impl MaskGenerator {
    /// Creates a generator seeded from the operating system.
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Creates a deterministic generator. Two generators with the same seed yield the same keys.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Returns a fresh masking key.
    pub fn next_key(&mut self) -> [u8; 4] {
        self.rng.next_u32().to_ne_bytes()
    }
}

impl Default for MaskGenerator {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl std::fmt::Debug for MaskGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskGenerator").finish_non_exhaustive()
    }
}
