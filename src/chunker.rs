use std::io::Read;

use crate::buf::read_fill;

/// Content-defined chunking.
///
/// A polynomial rolling hash over a 32-byte sliding window declares a cut
/// wherever its low 16 bits vanish, clamped to [4 KiB, 4 MiB]. The
/// constants are part of the dedup compatibility contract: change any of
/// them and previously written archives stop deduplicating against new
/// ones.
pub const MIN_FRAGMENT: usize = 4 * 1024;
pub const MAX_FRAGMENT: usize = 4 * 1024 * 1024;

const WINDOW: usize = 32;
const CUT_MASK: u32 = 0xFFFF;
const HASH_MUL: u32 = 0x9E37_79B1;

// HASH_MUL^WINDOW, the factor that removes the byte leaving the window.
const OUT_MUL: u32 = pow_mul(HASH_MUL, WINDOW);

const fn pow_mul(base: u32, mut exp: usize) -> u32 {
    let mut acc = 1u32;
    let mut b = base;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = acc.wrapping_mul(b);
        }
        b = b.wrapping_mul(b);
        exp >>= 1;
    }
    acc
}

struct RollingHash {
    hash: u32,
    window: [u8; WINDOW],
    pos: usize,
}

impl RollingHash {
    fn new() -> Self {
        RollingHash {
            hash: 0,
            window: [0; WINDOW],
            pos: 0,
        }
    }

    fn roll(&mut self, byte: u8) -> u32 {
        let out = self.window[self.pos % WINDOW];
        self.window[self.pos % WINDOW] = byte;
        self.pos += 1;

        self.hash = self
            .hash
            .wrapping_mul(HASH_MUL)
            .wrapping_add(byte as u32 + 1)
            .wrapping_sub(OUT_MUL.wrapping_mul(out as u32 + 1));
        self.hash
    }
}

/// Splits a byte stream into content-defined fragments.
pub struct Chunker<R: Read> {
    inner: R,
    buf: Vec<u8>,
    buf_pos: usize,
    eof: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(reader: R) -> Self {
        Chunker {
            inner: reader,
            buf: Vec::new(),
            buf_pos: 0,
            eof: false,
        }
    }

    fn next_byte(&mut self) -> std::io::Result<Option<u8>> {
        if self.buf_pos == self.buf.len() {
            if self.eof {
                return Ok(None);
            }
            let mut window = [0u8; 64 * 1024];
            let n = read_fill(&mut self.inner, &mut window)?;
            if n < window.len() {
                self.eof = true;
            }
            if n == 0 {
                return Ok(None);
            }
            self.buf.clear();
            self.buf.extend_from_slice(&window[..n]);
            self.buf_pos = 0;
        }
        let b = self.buf[self.buf_pos];
        self.buf_pos += 1;
        Ok(Some(b))
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut fragment = Vec::new();
        let mut hash = RollingHash::new();

        loop {
            match self.next_byte() {
                Err(e) => return Some(Err(e)),
                Ok(None) => break,
                Ok(Some(b)) => {
                    let h = hash.roll(b);
                    fragment.push(b);

                    if fragment.len() >= MAX_FRAGMENT {
                        return Some(Ok(fragment));
                    }
                    if fragment.len() >= MIN_FRAGMENT && h & CUT_MASK == 0 {
                        return Some(Ok(fragment));
                    }
                }
            }
        }

        if fragment.is_empty() {
            None
        } else {
            Some(Ok(fragment))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn chunk_all(data: &[u8]) -> Vec<Vec<u8>> {
        Chunker::new(Cursor::new(data.to_vec()))
            .collect::<std::io::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(chunk_all(b"").is_empty());
    }

    #[test]
    fn short_input_is_one_fragment() {
        let chunks = chunk_all(b"hello");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], b"hello");
    }

    #[test]
    fn fragments_reassemble() {
        let data: Vec<u8> = (0..1_000_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let chunks = chunk_all(&data);

        let mut whole = Vec::new();
        for c in &chunks {
            assert!(c.len() <= MAX_FRAGMENT);
            whole.extend_from_slice(c);
        }
        assert_eq!(whole, data);
    }

    #[test]
    fn min_clamp_holds() {
        let data: Vec<u8> = (0..200_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 7) as u8)
            .collect();
        let chunks = chunk_all(&data);
        for c in &chunks[..chunks.len() - 1] {
            assert!(c.len() >= MIN_FRAGMENT);
        }
    }

    #[test]
    fn cuts_are_content_defined() {
        // Same content must cut identically no matter how it arrives.
        let data: Vec<u8> = (0..300_000u32)
            .map(|i| (i.wrapping_mul(0x85eb_ca6b) >> 11) as u8)
            .collect();
        let a = chunk_all(&data);
        let b = chunk_all(&data);
        assert_eq!(a, b);
    }
}
