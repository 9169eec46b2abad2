use std::io::Cursor;

use rand::{Rng, SeedableRng};

use rzpaq::{compress, decompress, Method, ZpaqError};

fn roundtrip(method: u8, data: &[u8]) -> Vec<u8> {
    let mut coded = Vec::new();
    compress(
        Cursor::new(data.to_vec()),
        &mut coded,
        Method::preset(method),
        None,
    )
    .expect("compress");

    let mut restored = Vec::new();
    decompress(Cursor::new(coded.clone()), &mut restored, None).expect("decompress");
    assert_eq!(restored, data, "method {method}");
    coded
}

#[test]
fn literal_store_of_hello() {
    let coded = roundtrip(0, b"hello");

    // Magic, program header, five literal bytes, framing, trailer.
    assert!(coded.len() >= 13 + 5 + 5);

    // Stored blocks keep the payload verbatim.
    assert!(coded.windows(5).any(|w| w == b"hello"));

    // The segment trailer carries the SHA-1 of the original bytes.
    let expected = [
        0xaa, 0xf4, 0xc6, 0x1d, 0xdc, 0xc5, 0xe8, 0xa2, 0xda, 0xbe, 0xde, 0x0f, 0x3b, 0x48, 0x2c,
        0xd9, 0xae, 0xa9, 0x43, 0x4d,
    ];
    assert!(coded.windows(20).any(|w| w == expected));
}

#[test]
fn empty_input_makes_a_nonempty_archive() {
    for m in 0..=5u8 {
        let mut coded = Vec::new();
        compress(Cursor::new(Vec::new()), &mut coded, Method::preset(m), None).unwrap();
        assert!(!coded.is_empty(), "method {m}");

        let mut restored = Vec::new();
        decompress(Cursor::new(coded), &mut restored, None).unwrap();
        assert!(restored.is_empty(), "method {m}");
    }
}

#[test]
fn one_byte_and_tiny_inputs() {
    for m in 0..=5u8 {
        roundtrip(m, b"\x00");
        roundtrip(m, b"\xff");
        roundtrip(m, b"ab");
    }
}

#[test]
fn random_megabyte_every_method() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut data = vec![0u8; 1 << 20];
    rng.fill(&mut data[..]);

    for m in 0..=5u8 {
        roundtrip(m, &data);
    }
}

#[test]
fn repetitive_input_compresses_well() {
    let mut data = Vec::with_capacity(400_000);
    while data.len() < 400_000 {
        data.extend_from_slice(b"all work and no play makes jack a dull boy\n");
    }

    for m in 1..=5u8 {
        let coded = roundtrip(m, &data);
        assert!(
            coded.len() < data.len() / 10,
            "method {m}: {} of {}",
            coded.len(),
            data.len()
        );
    }
}

#[test]
fn binary_with_long_matches() {
    // Two copies of the same noise exercises the match model.
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut half = vec![0u8; 200_000];
    rng.fill(&mut half[..]);
    let mut data = half.clone();
    data.extend_from_slice(&half);

    for m in 3..=5u8 {
        let coded = roundtrip(m, &data);
        assert!(
            coded.len() < data.len() * 3 / 4,
            "method {m} missed the repeat: {} of {}",
            coded.len(),
            data.len()
        );
    }
}

#[test]
fn concatenated_archives_decode_in_sequence() {
    let a = b"first stream".to_vec();
    let b = vec![0x41u8; 100_000];

    let mut coded = Vec::new();
    compress(Cursor::new(a.clone()), &mut coded, Method::preset(0), None).unwrap();
    compress(Cursor::new(b.clone()), &mut coded, Method::preset(5), None).unwrap();

    let mut restored = Vec::new();
    decompress(Cursor::new(coded), &mut restored, None).unwrap();

    let mut expected = a;
    expected.extend_from_slice(&b);
    assert_eq!(restored, expected);
}

#[test]
fn encrypted_stream_roundtrip() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(99);
    let mut data = vec![0u8; 64 * 1024];
    rng.fill(&mut data[..]);

    for pw in [&b"pw"[..], &b""[..], &[0xFFu8, 0x00, 0x80][..]] {
        let mut coded = Vec::new();
        compress(
            Cursor::new(data.clone()),
            &mut coded,
            Method::preset(2),
            Some(pw),
        )
        .unwrap();

        let mut restored = Vec::new();
        decompress(Cursor::new(coded), &mut restored, Some(pw)).unwrap();
        assert_eq!(restored, data);
    }
}

#[test]
fn wrong_password_is_bad_key() {
    let mut coded = Vec::new();
    compress(
        Cursor::new(b"secret".to_vec()),
        &mut coded,
        Method::preset(1),
        Some(b"right"),
    )
    .unwrap();

    let mut sink = Vec::new();
    let err = decompress(Cursor::new(coded), &mut sink, Some(b"wrong")).expect_err("must fail");
    assert!(matches!(err, ZpaqError::BadKey));
}

#[test]
fn truncated_preamble_is_reported() {
    let mut coded = Vec::new();
    compress(
        Cursor::new(b"data".to_vec()),
        &mut coded,
        Method::preset(0),
        Some(b"pw"),
    )
    .unwrap();

    // Cut inside the salt.
    coded.truncate(20);
    let mut sink = Vec::new();
    let err = decompress(Cursor::new(coded), &mut sink, Some(b"pw")).expect_err("must fail");
    assert!(matches!(err, ZpaqError::Truncated(_)));
}

#[test]
fn long_password_roundtrip() {
    let pw = vec![b'k'; 1024];
    let data = b"long password data".to_vec();

    let mut coded = Vec::new();
    compress(
        Cursor::new(data.clone()),
        &mut coded,
        Method::preset(1),
        Some(&pw),
    )
    .unwrap();

    let mut restored = Vec::new();
    decompress(Cursor::new(coded), &mut restored, Some(&pw)).unwrap();
    assert_eq!(restored, data);
}

#[test]
fn damaged_payload_is_detected() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(3);
    let mut data = vec![0u8; 50_000];
    rng.fill(&mut data[..]);

    let mut coded = Vec::new();
    compress(Cursor::new(data), &mut coded, Method::preset(2), None).unwrap();

    let mid = coded.len() / 2;
    coded[mid] ^= 0x01;

    let mut sink = Vec::new();
    assert!(decompress(Cursor::new(coded), &mut sink, None).is_err());
}
