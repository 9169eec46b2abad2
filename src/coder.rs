use std::io::{Read, Write};

use crate::error::{Result, ZpaqError};

/// Binary range coder over a 32-bit interval.
///
/// `p` is the probability that the next bit is 1, scaled to 16 bits and
/// never 0 or 65536 for data bits; the end-of-segment symbol is coded as a
/// 1 bit with p = 0, which collapses the interval and forces the flush of
/// the four bytes of `low`. Multiplications go through 64-bit intermediates
/// so the split never overflows.
pub struct Encoder<W: Write> {
    low: u32,
    high: u32,
    out: W,
}

impl<W: Write> Encoder<W> {
    pub fn new(out: W) -> Self {
        Encoder {
            low: 1,
            high: 0xFFFF_FFFF,
            out,
        }
    }

    pub fn encode(&mut self, bit: u32, p: u32) -> Result<()> {
        debug_assert!(p < 65536);
        let range = (self.high - self.low) as u64;
        let mid = self.low.wrapping_add(((range * p as u64) >> 16) as u32);

        if bit != 0 {
            self.high = mid;
        } else {
            self.low = mid.wrapping_add(1);
        }

        // Shift out bytes once the top bytes agree.
        while (self.high ^ self.low) < 0x0100_0000 {
            self.out.write_all(&[(self.high >> 24) as u8])?;
            self.high = (self.high << 8) | 255;
            self.low <<= 8;
            if self.low == 0 {
                self.low = 1;
            }
        }
        Ok(())
    }

    /// Terminates the coded stream; the interval collapse writes the four
    /// bytes of `low` that the decoder's final renormalization consumes.
    pub fn finish(&mut self) -> Result<()> {
        self.encode(1, 0)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

pub struct Decoder<R: Read> {
    low: u32,
    high: u32,
    curr: u32,
    inp: R,
}

impl<R: Read> Decoder<R> {
    pub fn new(inp: R) -> Self {
        Decoder {
            low: 1,
            high: 0xFFFF_FFFF,
            curr: 0,
            inp,
        }
    }

    fn get(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        match self.inp.read_exact(&mut b) {
            Ok(()) => Ok(b[0]),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(ZpaqError::Truncated("coded stream"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Primes the 4-byte lookahead before the first decode of a segment.
    pub fn load(&mut self) -> Result<()> {
        self.curr = 0;
        for _ in 0..4 {
            self.curr = (self.curr << 8) | self.get()? as u32;
        }
        Ok(())
    }

    pub fn decode(&mut self, p: u32) -> Result<u32> {
        debug_assert!(p < 65536);
        if self.curr < self.low || self.curr > self.high {
            return Err(ZpaqError::CoderRange);
        }

        let range = (self.high - self.low) as u64;
        let mid = self.low.wrapping_add(((range * p as u64) >> 16) as u32);

        let bit;
        if self.curr <= mid {
            bit = 1;
            self.high = mid;
        } else {
            bit = 0;
            self.low = mid.wrapping_add(1);
        }

        while (self.high ^ self.low) < 0x0100_0000 {
            self.high = (self.high << 8) | 255;
            self.low <<= 8;
            if self.low == 0 {
                self.low = 1;
            }
            self.curr = (self.curr << 8) | self.get()? as u32;
        }
        Ok(bit)
    }

    /// After the end-of-segment symbol the lookahead must have drained to
    /// zero, i.e. the four zero bytes of the trailer were consumed.
    pub fn at_clean_end(&self) -> bool {
        self.curr == 0
    }

    pub fn into_inner(self) -> R {
        self.inp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // A fixed pseudo-random probability stream keeps the test deterministic.
    fn prob(i: usize) -> u32 {
        ((i as u32).wrapping_mul(2_654_435_761) >> 16) % 65534 + 1
    }

    #[test]
    fn bit_roundtrip_with_varying_probabilities() {
        let bits: Vec<u32> = (0..4096u32).map(|i| (i * i >> 3) & 1).collect();

        let mut enc = Encoder::new(Vec::new());
        for (i, &b) in bits.iter().enumerate() {
            enc.encode(b, prob(i)).unwrap();
        }
        enc.finish().unwrap();
        let mut coded = enc.into_inner();
        // The decoder drains the trailer zeros during its final renorm.
        coded.extend_from_slice(&[0, 0, 0, 0]);

        let mut dec = Decoder::new(Cursor::new(coded));
        dec.load().unwrap();
        for (i, &b) in bits.iter().enumerate() {
            assert_eq!(dec.decode(prob(i)).unwrap(), b, "bit {}", i);
        }
        assert_eq!(dec.decode(0).unwrap(), 1);
        assert!(dec.at_clean_end());
    }

    #[test]
    fn empty_stream_is_just_the_end_symbol() {
        let mut enc = Encoder::new(Vec::new());
        enc.finish().unwrap();
        let mut coded = enc.into_inner();
        assert_eq!(coded.len(), 4);
        coded.extend_from_slice(&[0, 0, 0, 0]);

        let mut dec = Decoder::new(Cursor::new(coded));
        dec.load().unwrap();
        assert_eq!(dec.decode(0).unwrap(), 1);
        assert!(dec.at_clean_end());
    }

    #[test]
    fn truncated_stream_reports_eof() {
        let mut enc = Encoder::new(Vec::new());
        for (i, b) in (0..1024u32).map(|i| (i, i & 1)) {
            enc.encode(b, prob(i as usize)).unwrap();
        }
        enc.finish().unwrap();
        let coded = enc.into_inner();

        let cut = coded.len() / 2;
        let mut dec = Decoder::new(Cursor::new(coded[..cut].to_vec()));
        dec.load().unwrap();
        let mut saw_eof = false;
        for i in 0..1024usize {
            match dec.decode(prob(i)) {
                Ok(_) => continue,
                Err(ZpaqError::Truncated(_)) => {
                    saw_eof = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saw_eof);
    }
}
