//! Hash Engine
//!
//! Maps an entry name to a point on the 32-bit hash ring used by directory layouts.
//! The function is a Davies-Meyer construction over the TEA block cipher: names are
//! packed into 16-byte blocks which key successive TEA rounds over a 64-bit state.
//! It is deterministic across processes and architectures (no seeded hasher), which
//! is what lets every client agree on the hashed node of a name.

const DELTA: u32 = 0x9E37_79B9;
const ROUNDS: usize = 16;
const BLOCK: usize = 16;

/// Hashes an entry name (a single path component, not a full path).
pub fn dm_hash(name: &[u8]) -> u32 {
    let mut state = [0x6745_2301u32, 0xefcd_ab89u32];

    if name.is_empty() {
        let block = pack_block(name, 0);
        tea_transform(&mut state, &block);
    }

    for chunk in name.chunks(BLOCK) {
        let block = pack_block(chunk, name.len());
        tea_transform(&mut state, &block);
    }

    state[0] ^ state[1]
}

/// Convenience wrapper for `&str` names.
pub fn hash_name(name: &str) -> u32 {
    dm_hash(name.as_bytes())
}

/// Packs up to 16 bytes into four words. Short blocks are filled with a pad
/// derived from the total name length so "ab" and "ab\0" never collide trivially.
fn pack_block(chunk: &[u8], total_len: usize) -> [u32; 4] {
    let mut pad = (total_len as u32) | ((total_len as u32) << 8);
    pad |= pad << 16;

    let mut words = [pad; 4];
    let mut value = pad;
    let mut word = 0;

    for (i, byte) in chunk.iter().enumerate() {
        value = (*byte as u32).wrapping_add(value << 8);
        if i % 4 == 3 {
            words[word] = value;
            word += 1;
            value = pad;
        }
    }

    if chunk.len() % 4 != 0 && word < 4 {
        words[word] = value;
    }

    words
}

fn tea_transform(state: &mut [u32; 2], key: &[u32; 4]) {
    let (mut b0, mut b1) = (state[0], state[1]);
    let mut sum = 0u32;

    for _ in 0..ROUNDS {
        sum = sum.wrapping_add(DELTA);
        b0 = b0.wrapping_add(
            (b1 << 4).wrapping_add(key[0]) ^ b1.wrapping_add(sum) ^ (b1 >> 5).wrapping_add(key[1]),
        );
        b1 = b1.wrapping_add(
            (b0 << 4).wrapping_add(key[2]) ^ b0.wrapping_add(sum) ^ (b0 >> 5).wrapping_add(key[3]),
        );
    }

    state[0] = state[0].wrapping_add(b0);
    state[1] = state[1].wrapping_add(b1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash_name("file_100"), hash_name("file_100"));
        assert_eq!(dm_hash(b""), dm_hash(b""));
    }

    #[test]
    fn test_hash_distinguishes_similar_names() {
        let names = ["a", "b", "ab", "ba", "abc", "abcd", "abcde", "file1", "file2"];
        let hashes: HashSet<u32> = names.iter().map(|n| hash_name(n)).collect();
        assert_eq!(hashes.len(), names.len());
    }

    #[test]
    fn test_hash_long_names_use_every_block() {
        let a = "x".repeat(40) + "tail-a";
        let b = "x".repeat(40) + "tail-b";
        assert_ne!(hash_name(&a), hash_name(&b));
    }

    #[test]
    fn test_hash_spreads_over_quarters() {
        let mut quarters = [0usize; 4];
        for i in 0..4000 {
            let h = hash_name(&format!("entry_{}", i));
            quarters[(h >> 30) as usize] += 1;
        }
        // ~1000 each; anything under 700 means the high bits are badly skewed.
        for count in quarters {
            assert!(count > 700, "quarter distribution skewed: {:?}", quarters);
        }
    }

    #[test]
    fn test_single_bit_flip_avalanche() {
        let base = dm_hash(b"avalanche-test");
        let flipped = dm_hash(b"avalanche-tesu");
        let changed = (base ^ flipped).count_ones();
        assert!(changed >= 6, "only {} bits changed", changed);
    }
}
