// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

//! CDI-seeded random number generator.
//!
//! The TRNG on the chip is a low-rate entropy source, so nonces are not drawn
//! from it directly. Instead the generator keeps a 16-word state, the low
//! half seeded from the CDI and the high half from the TRNG, and extracts
//! output through a BLAKE2s hash chain. The TRNG half is reseeded every
//! [`RESEED_INTERVAL`] blocks; between reseeds the construction keeps
//! producing even if the TRNG stalls.

use blake2::{Blake2s256, Digest};

use crate::hal::Hal;

/// Number of 16-byte output blocks between TRNG reseeds.
const RESEED_INTERVAL: u32 = 1000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// Requested length is not a multiple of the 16-byte block size.
    LengthNotBlockAligned,
}

/// The generator state: 16 words hashed as one 64-byte block per output.
pub struct CdiRng {
    state: [u32; 16],
    ctr: u32,
}

impl core::fmt::Debug for CdiRng {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // state words are secret-derived, keep them out of logs
        f.debug_struct("CdiRng").field("ctr", &self.ctr).finish()
    }
}

impl CdiRng {
    /// Seed state words 0..8 from the CDI and words 8..16 from the TRNG.
    pub fn init<H: Hal>(cdi: &[u8; 32], hal: &mut H) -> Self {
        let mut state = [0u32; 16];
        for (i, word) in state.iter_mut().take(8).enumerate() {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&cdi[i * 4..i * 4 + 4]);
            *word = u32::from_le_bytes(bytes);
        }
        for word in state.iter_mut().skip(8) {
            *word = hal.trng_word();
        }
        Self { state, ctr: 0 }
    }

    /// Fill `out` with random bytes. `out.len()` must be a multiple of 16.
    pub fn generate<H: Hal>(&mut self, hal: &mut H, out: &mut [u8]) -> Result<(), Error> {
        crate::ensure(out.len() % 16 == 0, Error::LengthNotBlockAligned)?;
        self.fill_blocks(hal, out);
        Ok(())
    }

    /// A fresh 32-byte nonce. 32 is block-aligned, so this cannot fail.
    pub fn fill_nonce<H: Hal>(&mut self, hal: &mut H) -> [u8; 32] {
        let mut nonce = [0u8; 32];
        self.fill_blocks(hal, &mut nonce);
        nonce
    }

    fn fill_blocks<H: Hal>(&mut self, hal: &mut H, out: &mut [u8]) {
        for block in out.chunks_exact_mut(16) {
            let digest = self.hash_state();
            // emit the first four digest words, big-endian
            for (chunk, word) in block.chunks_exact_mut(4).zip(digest.iter()) {
                chunk.copy_from_slice(&word.to_be_bytes());
            }
            self.update(hal, &digest);
        }
    }

    fn hash_state(&self) -> [u32; 8] {
        let mut hasher = Blake2s256::new();
        for word in &self.state {
            hasher.update(word.to_le_bytes());
        }
        let digest = hasher.finalize();

        let mut words = [0u32; 8];
        for (word, bytes) in words.iter_mut().zip(digest.chunks_exact(4)) {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(bytes);
            *word = u32::from_le_bytes(buf);
        }
        words
    }

    /// Ratchet: fold the digest back into the low half, mix the step counter
    /// into the last word, and refresh the TRNG half on schedule.
    fn update<H: Hal>(&mut self, hal: &mut H, digest: &[u32; 8]) {
        self.state[..8].copy_from_slice(digest);

        self.ctr += 1;
        self.state[15] = self.state[15].wrapping_add(self.ctr);

        if self.ctr == RESEED_INTERVAL {
            for word in self.state.iter_mut().skip(8) {
                *word = hal.trng_word();
            }
            self.ctr = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virt::VirtHal;

    fn rng_pair() -> (CdiRng, VirtHal) {
        let cdi = [0x42; 32];
        let mut hal = VirtHal::new(cdi);
        (CdiRng::init(&cdi, &mut hal), hal)
    }

    #[test]
    fn rejects_unaligned_length() {
        let (mut rng, mut hal) = rng_pair();
        let mut out = [0u8; 15];
        assert_eq!(
            rng.generate(&mut hal, &mut out),
            Err(Error::LengthNotBlockAligned)
        );
        let mut out = [0u8; 0];
        assert_eq!(rng.generate(&mut hal, &mut out), Ok(()));
    }

    #[test]
    fn output_is_deterministic_for_fixed_seeds() {
        let (mut a, mut hal_a) = rng_pair();
        let (mut b, mut hal_b) = rng_pair();
        let (mut out_a, mut out_b) = ([0u8; 32], [0u8; 32]);
        a.generate(&mut hal_a, &mut out_a).unwrap();
        b.generate(&mut hal_b, &mut out_b).unwrap();
        assert_eq!(out_a, out_b);
    }

    #[test]
    fn consecutive_blocks_differ() {
        let (mut rng, mut hal) = rng_pair();
        let mut out = [0u8; 48];
        rng.generate(&mut hal, &mut out).unwrap();
        assert_ne!(out[..16], out[16..32]);
        assert_ne!(out[16..32], out[32..]);
    }

    #[test]
    fn different_cdi_different_stream() {
        let cdi_a = [1; 32];
        let cdi_b = [2; 32];
        let mut hal_a = VirtHal::new(cdi_a);
        let mut hal_b = VirtHal::new(cdi_b);
        let mut rng_a = CdiRng::init(&cdi_a, &mut hal_a);
        let mut rng_b = CdiRng::init(&cdi_b, &mut hal_b);
        let (mut out_a, mut out_b) = ([0u8; 16], [0u8; 16]);
        rng_a.generate(&mut hal_a, &mut out_a).unwrap();
        rng_b.generate(&mut hal_b, &mut out_b).unwrap();
        assert_ne!(out_a, out_b);
    }

    #[test]
    fn reseeds_after_interval() {
        let (mut rng, mut hal) = rng_pair();
        let drawn_before = hal.trng_words_drawn();
        let mut out = [0u8; 16];
        for _ in 0..RESEED_INTERVAL {
            rng.generate(&mut hal, &mut out).unwrap();
        }
        // the 1000th update refreshes state[8..16] from the TRNG
        assert_eq!(hal.trng_words_drawn(), drawn_before + 8);
        assert_eq!(rng.ctr, 0);
    }
}
