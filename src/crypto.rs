use std::io::{Read, Write};

use aes::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use aes::Aes256;
use rand::RngCore;
use scrypt::Params;

use crate::error::{Result, ZpaqError};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Plain-text preamble that marks an encrypted archive: magic, then the
/// key-strengthening salt. Everything after it is ciphertext, including
/// the first block's magic, which is what a wrong key trips over.
pub const CRYPTO_MAGIC: [u8; 4] = *b"zPQX";
pub const SALT_LEN: usize = 32;
pub const PREAMBLE_LEN: u64 = CRYPTO_MAGIC.len() as u64 + SALT_LEN as u64;

const SCRYPT_LOG_N: u8 = 14; // N = 16384
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Derived key material: the AES-256 key and the high half of the CTR
/// nonce. The low half of the counter block is the archive offset in
/// 16-byte units, so any position in the stream can be re-derived.
#[derive(Clone)]
pub struct Key {
    enc: [u8; 32],
    iv: [u8; 8],
}

impl Key {
    pub fn derive(password: &[u8], salt: &[u8; SALT_LEN]) -> Result<Key> {
        let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 64)
            .map_err(|_| ZpaqError::Corrupt("bad scrypt parameters"))?;

        let mut out = [0u8; 64];
        scrypt::scrypt(password, salt, &params, &mut out)
            .map_err(|_| ZpaqError::Corrupt("scrypt output length"))?;

        let mut enc = [0u8; 32];
        enc.copy_from_slice(&out[0..32]);
        let mut iv = [0u8; 8];
        iv.copy_from_slice(&out[32..40]);

        Ok(Key { enc, iv })
    }

    fn cipher_at(&self, offset: u64) -> Aes256Ctr {
        let mut nonce = [0u8; 16];
        nonce[0..8].copy_from_slice(&self.iv);
        let mut cipher = Aes256Ctr::new(&self.enc.into(), &nonce.into());
        cipher.seek(offset);
        cipher
    }

    /// XORs the keystream into `buf` as if it sat at `offset` bytes past
    /// the preamble. Encryption and decryption are the same operation.
    pub fn apply_at(&self, offset: u64, buf: &mut [u8]) {
        let mut cipher = self.cipher_at(offset);
        cipher.apply_keystream(buf);
    }
}

pub fn gen_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Sequential decrypting reader starting at a known archive offset.
pub struct CryptReader<R: Read> {
    inner: R,
    cipher: Aes256Ctr,
}

impl<R: Read> CryptReader<R> {
    pub fn new_at(inner: R, key: &Key, offset: u64) -> Self {
        CryptReader {
            inner,
            cipher: key.cipher_at(offset),
        }
    }
}

impl<R: Read> Read for CryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}

/// Sequential encrypting writer; the caller is responsible for having
/// written the preamble first.
pub struct CryptWriter<W: Write> {
    inner: W,
    cipher: Aes256Ctr,
}

impl<W: Write> CryptWriter<W> {
    pub fn new_at(inner: W, key: &Key, offset: u64) -> Self {
        CryptWriter {
            inner,
            cipher: key.cipher_at(offset),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut scratch = buf.to_vec();
        self.cipher.apply_keystream(&mut scratch);
        self.inner.write_all(&scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

pub fn write_preamble<W: Write>(w: &mut W, salt: &[u8; SALT_LEN]) -> Result<()> {
    w.write_all(&CRYPTO_MAGIC)?;
    w.write_all(salt)?;
    Ok(())
}

/// What the first bytes of an archive turned out to be.
pub enum Preamble {
    /// Encrypted: salt follows the magic.
    Encrypted([u8; SALT_LEN]),
    /// Plain archive; the probed bytes are handed back for re-reading.
    Plain(Vec<u8>),
}

/// Probes the head of a stream for the crypto preamble.
pub fn read_preamble<R: Read>(r: &mut R) -> Result<Preamble> {
    let mut head = [0u8; 4];
    let mut got = 0usize;
    while got < head.len() {
        match r.read(&mut head[got..])? {
            0 => return Ok(Preamble::Plain(head[..got].to_vec())),
            n => got += n,
        }
    }

    if head != CRYPTO_MAGIC {
        return Ok(Preamble::Plain(head.to_vec()));
    }

    let mut salt = [0u8; SALT_LEN];
    r.read_exact(&mut salt)
        .map_err(|_| ZpaqError::Truncated("crypto preamble"))?;
    Ok(Preamble::Encrypted(salt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_key() -> Key {
        Key::derive(b"pw", &[7u8; SALT_LEN]).unwrap()
    }

    #[test]
    fn keystream_roundtrips() {
        let key = test_key();
        let mut data = b"the quick brown fox jumps over the lazy dog".to_vec();
        let orig = data.clone();

        key.apply_at(0, &mut data);
        assert_ne!(data, orig);
        key.apply_at(0, &mut data);
        assert_eq!(data, orig);
    }

    #[test]
    fn random_access_matches_sequential() {
        let key = test_key();
        let mut whole = vec![0u8; 1000];
        for (i, b) in whole.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut sequential = whole.clone();
        key.apply_at(0, &mut sequential);

        // Decrypting a slice at its own offset must match the slice of
        // the sequential result, including unaligned offsets.
        for &at in &[0usize, 1, 15, 16, 17, 255, 999] {
            let mut piece = sequential[at..].to_vec();
            key.apply_at(at as u64, &mut piece);
            assert_eq!(&piece[..], &whole[at..], "offset {}", at);
        }
    }

    #[test]
    fn reader_and_writer_agree() {
        let key = test_key();
        let data = b"stream me through the envelope".to_vec();

        let mut w = CryptWriter::new_at(Vec::new(), &key, 0);
        w.write_all(&data).unwrap();
        let encrypted = w.into_inner();

        let mut r = CryptReader::new_at(Cursor::new(encrypted), &key, 0);
        let mut back = Vec::new();
        r.read_to_end(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn different_passwords_differ() {
        let salt = [3u8; SALT_LEN];
        let a = Key::derive(b"one", &salt).unwrap();
        let b = Key::derive(b"two", &salt).unwrap();
        assert_ne!(a.enc, b.enc);
    }

    #[test]
    fn empty_and_binary_passwords_derive() {
        let salt = [9u8; SALT_LEN];
        let _ = Key::derive(b"", &salt).unwrap();
        let _ = Key::derive(&[0xFF, 0x00, 0xFE, 0x80], &salt).unwrap();
    }

    #[test]
    fn preamble_detection() {
        let salt = [5u8; SALT_LEN];
        let mut out = Vec::new();
        write_preamble(&mut out, &salt).unwrap();
        out.extend_from_slice(b"ciphertext");

        let mut r = Cursor::new(out);
        match read_preamble(&mut r).unwrap() {
            Preamble::Encrypted(s) => assert_eq!(s, salt),
            Preamble::Plain(_) => panic!("expected encrypted"),
        }

        let mut r = Cursor::new(b"not encrypted".to_vec());
        match read_preamble(&mut r).unwrap() {
            Preamble::Plain(head) => assert_eq!(&head, b"not "),
            Preamble::Encrypted(_) => panic!("expected plain"),
        }
    }

    #[test]
    fn truncated_preamble_errors() {
        let mut short = CRYPTO_MAGIC.to_vec();
        short.extend_from_slice(&[1, 2, 3]);
        let mut r = Cursor::new(short);
        assert!(matches!(
            read_preamble(&mut r),
            Err(ZpaqError::Truncated(_))
        ));
    }
}
