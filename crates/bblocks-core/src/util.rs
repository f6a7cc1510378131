//! Checksums and small numeric helpers

/// Round `n` up to the next multiple of `s`.
#[inline]
pub fn roundup(n: usize, s: usize) -> usize {
    crate::invariant!(s != 0);
    n.div_ceil(s) * s
}

/// Whether `n` is a multiple of `s`.
#[inline]
pub fn is_aligned(n: u64, s: u64) -> bool {
    s != 0 && n % s == 0
}

const ADLER_MOD: u32 = 65521;
// Largest n such that 255n(n+1)/2 + (n+1)(MOD-1) fits in u32.
const ADLER_NMAX: usize = 5552;

/// Incremental Adler-32 checksum (RFC 1950), used by the RPC packet header.
///
/// Seeded with 0 (not 1) so that an all-zero header field hashes to the
/// same value the C framing produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct Adler32 {
    cksum: u32,
}

impl Adler32 {
    pub fn new() -> Self {
        Self { cksum: 0 }
    }

    /// One-shot checksum of `data`.
    pub fn calc(data: &[u8]) -> u32 {
        let mut a = Self::new();
        a.update(data);
        a.hash()
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut a = self.cksum & 0xffff;
        let mut b = self.cksum >> 16;
        for chunk in data.chunks(ADLER_NMAX) {
            for &byte in chunk {
                a += byte as u32;
                b += a;
            }
            a %= ADLER_MOD;
            b %= ADLER_MOD;
        }
        self.cksum = (b << 16) | a;
    }

    #[inline]
    pub fn hash(&self) -> u32 {
        self.cksum
    }

    #[inline]
    pub fn reset(&mut self) {
        self.cksum = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundup() {
        assert_eq!(roundup(0, 512), 0);
        assert_eq!(roundup(1, 512), 512);
        assert_eq!(roundup(512, 512), 512);
        assert_eq!(roundup(513, 512), 1024);
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned(4096, 512));
        assert!(!is_aligned(100, 512));
        assert!(!is_aligned(100, 0));
    }

    #[test]
    fn test_adler32_incremental_matches_oneshot() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i * 7) as u8).collect();
        let mut inc = Adler32::new();
        inc.update(&data[..7000]);
        inc.update(&data[7000..]);
        assert_eq!(inc.hash(), Adler32::calc(&data));
    }

    #[test]
    fn test_adler32_zero_seed() {
        // With a zero seed, "a" sums only the data bytes.
        assert_eq!(Adler32::calc(&[1, 2, 3]), ((1 + 3 + 6) << 16) | 6);
        assert_eq!(Adler32::calc(&[]), 0);
    }
}
