use std::io::Read;

/// Reads until `buf` is full or the stream ends, retrying interrupted
/// reads. Returns the byte count; a short count means end of input.
///
/// The chunker and the stream compressor both need whole input windows,
/// not whatever a single `read` happens to deliver.
pub fn read_fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Hands out at most two bytes per read call, so filling a window
    /// takes several rounds.
    struct Dribble(Cursor<Vec<u8>>);

    impl Read for Dribble {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let cap = buf.len().min(2);
            self.0.read(&mut buf[..cap])
        }
    }

    #[test]
    fn short_input_reports_short_count() {
        let mut r = Cursor::new(vec![1, 2]);
        let mut buf = [0u8; 4];
        assert_eq!(read_fill(&mut r, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[1, 2]);
    }

    #[test]
    fn exact_input_fills_the_window() {
        let mut r = Cursor::new(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 4];
        assert_eq!(read_fill(&mut r, &mut buf).unwrap(), 4);
        assert_eq!(&buf, &[1, 2, 3, 4]);
        assert_eq!(read_fill(&mut r, &mut buf).unwrap(), 0);
    }

    #[test]
    fn fragmented_reads_are_reassembled() {
        let data: Vec<u8> = (0..=99).collect();
        let mut r = Dribble(Cursor::new(data.clone()));
        let mut buf = [0u8; 100];
        assert_eq!(read_fill(&mut r, &mut buf).unwrap(), 100);
        assert_eq!(&buf[..], &data[..]);
    }
}
