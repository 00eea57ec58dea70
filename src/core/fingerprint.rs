//! Stack fingerprinting
//!
//! A round only needs to know whether a thread's stack *changed* since the
//! previous round, so the full address sequence is reduced to a single
//! rolling hash. Any change in call depth or in any single frame flips the
//! fingerprint with overwhelming probability; comparing two fingerprints is
//! O(1) and no addresses are retained between routine rounds.

use crate::core::types::Fingerprint;

/// Fold one byte into the accumulator (rotate-and-accumulate avalanche step)
#[inline]
fn mix_byte(hash: Fingerprint, byte: u8) -> Fingerprint {
    let hash = hash.wrapping_add(byte as Fingerprint);
    hash.wrapping_sub(hash.rotate_left(13))
}

#[inline]
fn mix_word(mut hash: Fingerprint, word: u64) -> Fingerprint {
    for byte in word.to_le_bytes() {
        hash = mix_byte(hash, byte);
    }
    hash
}

/// Reduce a captured stack to one fingerprint value
///
/// Hashes every return address in order, then the final depth, so that both
/// "same frames, different depth" and "same depth, one frame changed" are
/// distinguished. An empty capture hashes to zero, which the classifier
/// treats as "no sample" rather than as a repeatable stack.
pub fn fingerprint(frames: &[usize]) -> Fingerprint {
    let mut hash: Fingerprint = 0;
    for &addr in frames {
        hash = mix_word(hash, addr as u64);
    }
    hash = mix_word(hash, frames.len() as u64);
    hash
}
