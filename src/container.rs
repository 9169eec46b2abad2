use std::io::Read;

use crate::error::{Result, ZpaqError};
use crate::hash::Sha1Sum;
use crate::zpaql::Program;

/// The 13-byte locator tag that anchors every block. No inner byte
/// sequence is allowed to shadow it, so a damaged archive can always be
/// re-entered by scanning forward for the next tag.
pub const LOCATOR_TAG: [u8; 13] = [
    0x37, 0x6B, 0x53, 0x74, 0xA0, 0x31, 0x83, 0xD3, 0x8C, 0xB2, 0x28, 0xB0, 0xD3,
];

/// Container level written after the tag: `zPQ` + level + a reserved one.
pub const LEVEL: u8 = 2;

pub const SEG_START: u8 = 0x01;
pub const TRAILER_SHA1: u8 = 0xFD;
pub const TRAILER_PLAIN: u8 = 0xFE;
pub const BLOCK_END: u8 = 0xFF;

const MAX_NAME: usize = 4096;

/// Header fields of one segment, read up to the start of its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHead {
    pub filename: String,
    pub comment: String,
}

impl SegmentHead {
    /// Writers put the payload byte length in the comment so readers can
    /// hop over a segment without decoding it.
    pub fn payload_len(&self) -> Option<u64> {
        self.comment.parse().ok()
    }
}

/// A reader that knows how far into the archive it is. Block offsets
/// recorded during a scan index straight back into the file.
pub struct CountingReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        CountingReader { inner, offset: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

fn read_byte<R: Read>(r: &mut R, what: &'static str) -> Result<u8> {
    let mut b = [0u8; 1];
    match r.read_exact(&mut b) {
        Ok(()) => Ok(b[0]),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ZpaqError::Truncated(what)),
        Err(e) => Err(e.into()),
    }
}

fn read_cstring<R: Read>(r: &mut R, what: &'static str) -> Result<String> {
    let mut raw = Vec::new();
    loop {
        let b = read_byte(r, what)?;
        if b == 0 {
            break;
        }
        if raw.len() >= MAX_NAME {
            return Err(ZpaqError::BadHeader("name field too long"));
        }
        raw.push(b);
    }
    String::from_utf8(raw).map_err(|_| ZpaqError::BadHeader("name field is not UTF-8"))
}

// ---- writer side -------------------------------------------------------

pub fn write_block_header(out: &mut Vec<u8>, prog: &Program) {
    out.extend_from_slice(&LOCATOR_TAG);
    out.extend_from_slice(b"zPQ");
    out.push(LEVEL);
    out.push(1);
    prog.write_to(out);
}

pub fn write_segment_header(out: &mut Vec<u8>, filename: &str, comment: &str) {
    out.push(SEG_START);
    out.extend_from_slice(filename.as_bytes());
    out.push(0);
    out.extend_from_slice(comment.as_bytes());
    out.push(0);
    out.push(0); // reserved
}

/// The four zero bytes ahead of the marker are consumed by the payload
/// decoder itself (final renormalization, or the zero run count), so the
/// trailer proper is just the marker plus the optional digest.
pub fn write_segment_trailer(out: &mut Vec<u8>, sha1: Option<&Sha1Sum>) {
    out.extend_from_slice(&[0, 0, 0, 0]);
    match sha1 {
        Some(sum) => {
            out.push(TRAILER_SHA1);
            out.extend_from_slice(sum.as_bytes());
        }
        None => out.push(TRAILER_PLAIN),
    }
}

pub fn write_block_end(out: &mut Vec<u8>) {
    out.push(BLOCK_END);
}

// ---- reader side -------------------------------------------------------

/// Reads a block prefix at the current position. `Ok(None)` means clean
/// end of archive; a tag mismatch is `BadMagic` so the caller can resync.
pub fn read_block_start<R: Read>(r: &mut R) -> Result<Option<Program>> {
    let mut first = [0u8; 1];
    match r.read(&mut first) {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(e) => return Err(e.into()),
    }
    if first[0] != LOCATOR_TAG[0] {
        return Err(ZpaqError::BadMagic);
    }

    let mut rest = [0u8; 12];
    r.read_exact(&mut rest)
        .map_err(|_| ZpaqError::Truncated("block tag"))?;
    if rest != LOCATOR_TAG[1..] {
        return Err(ZpaqError::BadMagic);
    }

    read_block_body(r).map(Some)
}

/// Parses everything after the locator tag.
pub fn read_block_body<R: Read>(r: &mut R) -> Result<Program> {
    let mut intro = [0u8; 5];
    r.read_exact(&mut intro)
        .map_err(|_| ZpaqError::Truncated("block intro"))?;
    if &intro[0..3] != b"zPQ" {
        return Err(ZpaqError::BadMagic);
    }
    if intro[3] != 1 && intro[3] != LEVEL {
        return Err(ZpaqError::BadHeader("unsupported level"));
    }
    if intro[4] != 1 {
        return Err(ZpaqError::BadHeader("unsupported block type"));
    }

    Program::parse(r)
}

/// After a block header or a segment trailer: either another segment
/// begins, or the block ends.
pub fn read_segment_head<R: Read>(r: &mut R) -> Result<Option<SegmentHead>> {
    match read_byte(r, "segment start")? {
        SEG_START => {}
        BLOCK_END => return Ok(None),
        _ => return Err(ZpaqError::BadHeader("expected segment or block end")),
    }

    let filename = read_cstring(r, "segment filename")?;
    let comment = read_cstring(r, "segment comment")?;
    if read_byte(r, "segment reserved byte")? != 0 {
        return Err(ZpaqError::BadHeader("bad reserved byte"));
    }

    Ok(Some(SegmentHead { filename, comment }))
}

/// Reads the trailer marker after the payload decoder has consumed its
/// four zero bytes.
pub fn read_segment_trailer<R: Read>(r: &mut R) -> Result<Option<Sha1Sum>> {
    match read_byte(r, "segment trailer")? {
        TRAILER_PLAIN => Ok(None),
        TRAILER_SHA1 => {
            let mut sum = [0u8; 20];
            r.read_exact(&mut sum)
                .map_err(|_| ZpaqError::Truncated("segment checksum"))?;
            Ok(Some(Sha1Sum(sum)))
        }
        _ => Err(ZpaqError::Corrupt("bad trailer marker")),
    }
}

/// Skips a payload by its declared length and swallows the trailer zeros.
pub fn skip_payload<R: Read>(r: &mut R, len: u64) -> Result<()> {
    let copied = std::io::copy(&mut r.take(len + 4), &mut std::io::sink())?;
    if copied != len + 4 {
        return Err(ZpaqError::Truncated("segment payload"));
    }
    Ok(())
}

/// Resynchronization: consume bytes until the next locator tag, leaving
/// the reader positioned just after it. Returns false at end of stream.
pub fn scan_to_tag<R: Read>(r: &mut R) -> Result<bool> {
    let mut matched = 0usize;
    loop {
        let mut b = [0u8; 1];
        match r.read(&mut b) {
            Ok(0) => return Ok(false),
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        if b[0] == LOCATOR_TAG[matched] {
            matched += 1;
            if matched == LOCATOR_TAG.len() {
                return Ok(true);
            }
        } else {
            // The tag has no repeated prefix longer than one byte, so a
            // plain restart (with a one-byte retry) is enough.
            matched = if b[0] == LOCATOR_TAG[0] { 1 } else { 0 };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use std::io::Cursor;

    fn store_program() -> Program {
        Program {
            hh: 0,
            hm: 0,
            ph: 0,
            pm: 0,
            comp: vec![],
            n: 0,
            hcomp: vec![],
        }
    }

    #[test]
    fn block_header_roundtrip() {
        let mut out = Vec::new();
        write_block_header(&mut out, &store_program());
        // tag + zPQ + level + type + hsize(2) + body(7)
        assert_eq!(out.len(), 13 + 5 + 2 + 7);

        let mut r = Cursor::new(out);
        let prog = read_block_start(&mut r).unwrap().expect("one block");
        assert_eq!(prog, store_program());
    }

    #[test]
    fn segment_head_roundtrip() {
        let mut out = Vec::new();
        write_segment_header(&mut out, "d0000000001", "12345");
        write_block_end(&mut out);

        let mut r = Cursor::new(out);
        let head = read_segment_head(&mut r).unwrap().expect("segment");
        assert_eq!(head.filename, "d0000000001");
        assert_eq!(head.payload_len(), Some(12345));
        assert!(read_segment_head(&mut r).unwrap().is_none());
    }

    #[test]
    fn trailer_carries_checksum() {
        let sum = hash::sum(b"payload");
        let mut out = Vec::new();
        write_segment_trailer(&mut out, Some(&sum));

        let mut r = Cursor::new(out);
        // The payload decoder normally eats these four zeros.
        let mut zeros = [0u8; 4];
        r.read_exact(&mut zeros).unwrap();
        assert_eq!(zeros, [0, 0, 0, 0]);
        assert_eq!(read_segment_trailer(&mut r).unwrap(), Some(sum));
    }

    #[test]
    fn eof_is_a_clean_none() {
        let mut r = Cursor::new(Vec::new());
        assert!(read_block_start(&mut r).unwrap().is_none());
    }

    #[test]
    fn garbage_reports_bad_magic() {
        let mut r = Cursor::new(b"garbage data".to_vec());
        assert!(matches!(read_block_start(&mut r), Err(ZpaqError::BadMagic)));
    }

    #[test]
    fn scan_finds_tag_after_noise() {
        let mut data = b"noise noise noise".to_vec();
        data.extend_from_slice(&LOCATOR_TAG);
        data.extend_from_slice(b"zPQ");

        let mut r = CountingReader::new(Cursor::new(data));
        assert!(scan_to_tag(&mut r).unwrap());
        assert_eq!(r.offset(), 17 + 13);

        let mut rest = [0u8; 3];
        r.read_exact(&mut rest).unwrap();
        assert_eq!(&rest, b"zPQ");
    }

    #[test]
    fn scan_handles_partial_tag_prefixes() {
        // A truncated tag start, then the real one.
        let mut data = Vec::new();
        data.extend_from_slice(&LOCATOR_TAG[..7]);
        data.extend_from_slice(&LOCATOR_TAG);

        let mut r = Cursor::new(data);
        assert!(scan_to_tag(&mut r).unwrap());
    }

    #[test]
    fn scan_reports_end_of_stream() {
        let mut r = Cursor::new(b"nothing here".to_vec());
        assert!(!scan_to_tag(&mut r).unwrap());
    }
}
