//! Deterministic fill algorithms for the blob's data region.
//!
//! Two profiles:
//!
//! - `prand`: a seeded xorshift32 tile replicated across the buffer. Fast and
//!   reproducible, not engineered for matchability.
//! - `orchard`: the buffer is partitioned into proportioned banks, each
//!   raising the odds that arbitrary external input shares substrings with
//!   the dictionary. Bank proportions are fixed fractions of the total size,
//!   rounded down to page granularity; the bank composition is the main lever
//!   for compression ratio.

/// Bank boundaries are rounded to this granularity.
pub const PAGE: usize = 4096;

const TILE_SIZE: usize = 1024 * 1024;

// =============================================================================
// xorshift32
// =============================================================================

/// Marsaglia xorshift32. Zero seeds are remapped so the stream never sticks.
pub struct XorShift32 {
    state: u32,
}

impl XorShift32 {
    pub fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 { 0x6B5F_CA75 } else { seed },
        }
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// Fill `buf` from the stream, four bytes per step.
    pub fn fill(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(4) {
            let word = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}

// =============================================================================
// Profile dispatch
// =============================================================================

/// Fill `buf` according to `profile`. Unknown profiles fall back to `prand`
/// so a fingerprint always yields *some* deterministic content.
pub fn fill_profile(profile: &str, seed: u32, buf: &mut [u8]) {
    match profile {
        "orchard" => fill_orchard(seed, buf),
        _ => fill_prand(seed, buf),
    }
}

/// `prand`: one 1MB tile from the seeded stream, tiled across the buffer.
fn fill_prand(seed: u32, buf: &mut [u8]) {
    let tile_len = TILE_SIZE.min(buf.len().max(1));
    let mut tile = vec![0u8; tile_len];
    XorShift32::new(seed).fill(&mut tile);

    for chunk in buf.chunks_mut(tile_len) {
        chunk.copy_from_slice(&tile[..chunk.len()]);
    }
}

// =============================================================================
// orchard banks
// =============================================================================

/// (64ths of total size, fill function). The remainder after all listed
/// banks becomes the pseudo-random tail.
const ORCHARD_BANKS: &[(usize, fn(u32, &mut [u8]))] = &[
    (6, bank_padding),
    (6, bank_code_idioms),
    (2, bank_markers),
    (8, bank_words),
    (6, bank_stride),
    (8, bank_stripes),
    (2, bank_coverage),
    (8, bank_de_bruijn),
    (6, bank_const_runs),
];

fn fill_orchard(seed: u32, buf: &mut [u8]) {
    let total = buf.len();
    let mut pos = 0usize;

    for &(sixty_fourths, fill) in ORCHARD_BANKS {
        let want = total / 64 * sixty_fourths;
        let len = (want / PAGE * PAGE).min(total - pos);
        if len == 0 {
            break;
        }
        fill(seed, &mut buf[pos..pos + len]);
        pos += len;
    }

    // Pseudo-random tail fills whatever remains.
    XorShift32::new(seed ^ 0x9E37_79B9).fill(&mut buf[pos..]);
}

/// Padding / NOP-like runs: long stretches of the bytes real binaries pad with.
fn bank_padding(_seed: u32, buf: &mut [u8]) {
    const PADS: &[u8] = &[0x00, 0x90, 0xFF, 0x20, 0xCC];
    const RUN: usize = 256;
    for (i, chunk) in buf.chunks_mut(RUN).enumerate() {
        chunk.fill(PADS[i % PADS.len()]);
    }
}

/// Common short machine-code idioms, concatenated and repeated.
fn bank_code_idioms(_seed: u32, buf: &mut [u8]) {
    const IDIOMS: &[&[u8]] = &[
        &[0xF3, 0x0F, 0x1E, 0xFA],       // endbr64
        &[0x55],                          // push rbp
        &[0x48, 0x89, 0xE5],              // mov rbp, rsp
        &[0x48, 0x83, 0xEC, 0x20],        // sub rsp, 0x20
        &[0x31, 0xC0],                    // xor eax, eax
        &[0xE8, 0x00, 0x00, 0x00, 0x00],  // call rel32
        &[0x48, 0x8B, 0x45, 0xF8],        // mov rax, [rbp-8]
        &[0x5D],                          // pop rbp
        &[0xC9],                          // leave
        &[0xC3],                          // ret
        &[0x0F, 0x1F, 0x44, 0x00, 0x00],  // nopl
    ];
    let pattern: Vec<u8> = IDIOMS.iter().flat_map(|s| s.iter().copied()).collect();
    fill_repeating(buf, &pattern);
}

/// Recognizable binary-format signatures and section-name-like tokens.
fn bank_markers(_seed: u32, buf: &mut [u8]) {
    const MARKERS: &[&[u8]] = &[
        b"\x7fELF\x02\x01\x01\x00",
        b"MZ\x90\x00",
        b"PK\x03\x04",
        b"%PDF-1.7\n",
        b"\x89PNG\r\n\x1a\n",
        b"GIF89a",
        b"\xff\xd8\xff\xe0",
        b"#!/bin/sh\n",
        b"\x1f\x8b\x08\x00",
        b".text\x00",
        b".data\x00",
        b".rodata\x00",
        b".bss\x00",
        b".symtab\x00",
        b"__libc_start_main\x00",
        b"GLIBC_2.2.5\x00",
    ];
    let pattern: Vec<u8> = MARKERS.iter().flat_map(|s| s.iter().copied()).collect();
    fill_repeating(buf, &pattern);
}

/// Printable-ASCII word tokens.
fn bank_words(_seed: u32, buf: &mut [u8]) {
    const WORDS: &str = "the and for are but not you all can had her was one \
our out day get has him his how man new now old see two way who did its let \
put say she too use that with have this will your from they know want been \
good much some time very when come here just like long make many more only \
over such take than them well were error value return result string length \
offset buffer window header packet stream index total count bytes size data \
file read write open close true false null void const static struct ";
    fill_repeating(buf, WORDS.as_bytes());
}

/// Monotonically increasing numeric stride: consecutive big-endian u64s.
fn bank_stride(_seed: u32, buf: &mut [u8]) {
    for (i, chunk) in buf.chunks_mut(8).enumerate() {
        let word = (i as u64).to_be_bytes();
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
}

/// Periodic modulo stripes at several moduli, one sub-bank per modulus.
fn bank_stripes(_seed: u32, buf: &mut [u8]) {
    const MODULI: &[usize] = &[2, 3, 4, 8, 16, 32, 64, 128];
    let part = (buf.len() / MODULI.len()).max(1);
    for (i, chunk) in buf.chunks_mut(part).enumerate() {
        let m = MODULI[i.min(MODULI.len() - 1)];
        for (j, b) in chunk.iter_mut().enumerate() {
            *b = (j % m) as u8;
        }
    }
}

/// Every byte value, in order, repeated. Guarantees all 1-grams appear.
fn bank_coverage(_seed: u32, buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = (i % 256) as u8;
    }
}

/// De Bruijn sequence over nibbles, order 3: every 3-nibble n-gram appears
/// at least once. Packed two nibbles per byte and repeated across the bank.
fn bank_de_bruijn(_seed: u32, buf: &mut [u8]) {
    let nibbles = de_bruijn(16, 3);
    let mut packed = Vec::with_capacity(nibbles.len() / 2 + 1);
    for pair in nibbles.chunks(2) {
        let hi = pair[0];
        let lo = pair.get(1).copied().unwrap_or(0);
        packed.push((hi << 4) | lo);
    }
    fill_repeating(buf, &packed);
}

/// Long constant runs, one page per value.
fn bank_const_runs(_seed: u32, buf: &mut [u8]) {
    for (i, chunk) in buf.chunks_mut(PAGE).enumerate() {
        chunk.fill((i.wrapping_mul(37)) as u8);
    }
}

fn fill_repeating(buf: &mut [u8], pattern: &[u8]) {
    if pattern.is_empty() {
        return;
    }
    for (i, b) in buf.iter_mut().enumerate() {
        *b = pattern[i % pattern.len()];
    }
}

/// Standard de Bruijn B(k, n) construction via Lyndon words.
fn de_bruijn(k: u8, n: usize) -> Vec<u8> {
    fn db(t: usize, p: usize, k: u8, n: usize, a: &mut [u8], seq: &mut Vec<u8>) {
        if t > n {
            if n % p == 0 {
                seq.extend_from_slice(&a[1..=p]);
            }
        } else {
            a[t] = a[t - p];
            db(t + 1, p, k, n, a, seq);
            for j in (a[t - p] + 1)..k {
                a[t] = j;
                db(t + 1, t, k, n, a, seq);
            }
        }
    }

    let mut a = vec![0u8; k as usize * n + 1];
    let mut seq = Vec::new();
    db(1, 1, k, n, &mut a, &mut seq);
    seq
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_xorshift_deterministic() {
        let mut a = XorShift32::new(1337);
        let mut b = XorShift32::new(1337);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn test_xorshift_zero_seed_progresses() {
        let mut rng = XorShift32::new(0);
        assert_ne!(rng.next_u32(), 0);
    }

    #[test]
    fn test_prand_deterministic() {
        let mut a = vec![0u8; 64 * 1024];
        let mut b = vec![0u8; 64 * 1024];
        fill_profile("prand", 1337, &mut a);
        fill_profile("prand", 1337, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_prand_seed_changes_content() {
        let mut a = vec![0u8; 4096];
        let mut b = vec![0u8; 4096];
        fill_profile("prand", 1, &mut a);
        fill_profile("prand", 2, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_prand_tiling_repeats() {
        // Buffers larger than the tile repeat it exactly.
        let mut buf = vec![0u8; TILE_SIZE + 4096];
        fill_profile("prand", 9, &mut buf);
        assert_eq!(&buf[..4096], &buf[TILE_SIZE..TILE_SIZE + 4096]);
    }

    #[test]
    fn test_orchard_deterministic() {
        let mut a = vec![0u8; 256 * 1024];
        let mut b = vec![0u8; 256 * 1024];
        fill_profile("orchard", 42, &mut a);
        fill_profile("orchard", 42, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_orchard_contains_markers() {
        let mut buf = vec![0u8; 1024 * 1024];
        fill_profile("orchard", 42, &mut buf);
        let elf = b"\x7fELF";
        assert!(buf.windows(elf.len()).any(|w| w == elf));
    }

    #[test]
    fn test_orchard_full_byte_coverage() {
        let mut buf = vec![0u8; 1024 * 1024];
        fill_profile("orchard", 42, &mut buf);
        let seen: HashSet<u8> = buf.iter().copied().collect();
        assert_eq!(seen.len(), 256);
    }

    #[test]
    fn test_de_bruijn_length_and_coverage() {
        // B(4, 2): 16 symbols, every 2-gram appears once cyclically.
        let seq = de_bruijn(4, 2);
        assert_eq!(seq.len(), 16);
        let mut grams = HashSet::new();
        for i in 0..seq.len() {
            grams.insert((seq[i], seq[(i + 1) % seq.len()]));
        }
        assert_eq!(grams.len(), 16);
    }

    #[test]
    fn test_de_bruijn_nibble_order_three() {
        let seq = de_bruijn(16, 3);
        assert_eq!(seq.len(), 16 * 16 * 16);
        let mut grams = HashSet::new();
        for i in 0..seq.len() {
            let g = (
                seq[i],
                seq[(i + 1) % seq.len()],
                seq[(i + 2) % seq.len()],
            );
            grams.insert(g);
        }
        assert_eq!(grams.len(), 16 * 16 * 16);
    }

    #[test]
    fn test_unknown_profile_falls_back() {
        let mut a = vec![0u8; 4096];
        let mut b = vec![0u8; 4096];
        fill_profile("nonsense", 5, &mut a);
        fill_profile("prand", 5, &mut b);
        assert_eq!(a, b);
    }
}
