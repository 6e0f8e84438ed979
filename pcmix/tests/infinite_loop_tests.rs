//! Integration tests for InfiniteLoop byte patterns and seek folding
//!
//! These tests verify that:
//! - Reads from position 0 repeat the loop body forever
//! - Seeks from start and from the current position fold into the loop
//! - An intro longer than the underlying source still plays once
//! - Invalid seeks are rejected without moving the stream

mod helpers;

use helpers::{read_full, sin_pattern};
use pcmix::{BytesSource, Error, InfiniteLoop, SampleFormat, Source};
use std::io::SeekFrom;

#[test]
fn test_loop_repeats_source_pattern() {
    let src = sin_pattern(256);
    let mut lp =
        InfiniteLoop::new(BytesSource::new(src.clone()), 256, SampleFormat::Int16).unwrap();

    let out = read_full(&mut lp, 1024);
    for (i, b) in out.iter().enumerate() {
        assert_eq!(*b, src[i % 256], "byte {} differs", i);
    }

    assert_eq!(lp.seek(SeekFrom::Start(5 * 256 + 128)).unwrap(), 128);
    assert_eq!(lp.seek(SeekFrom::Current(6 * 256 + 64)).unwrap(), 192);

    let out = read_full(&mut lp, 7 * 256);
    for (i, b) in out.iter().enumerate() {
        assert_eq!(*b, src[(i + 192) % 256], "byte {} after seek differs", i);
    }
}

#[test]
fn test_loop_with_intro_longer_than_source() {
    // The underlying stream is itself a 68-byte loop, so the 76-byte intro
    // wraps the source once before the 92-byte loop body starts. That inner
    // loop never ends, so the outer joint is left unblended.
    let src = sin_pattern(68);
    let inner =
        InfiniteLoop::new(BytesSource::new(src.clone()), 68, SampleFormat::Int16).unwrap();
    let mut lp = InfiniteLoop::with_intro(inner, 76, 92, SampleFormat::Int16)
        .unwrap()
        .with_blending(false);

    let total = 76 + 4 * 92 + 20;
    let out = read_full(&mut lp, total);
    for (i, b) in out.iter().take(76).enumerate() {
        assert_eq!(*b, src[i % 68], "intro byte {} differs", i);
    }
    for (i, b) in out.iter().enumerate().skip(76) {
        let expected = src[((i - 76) % 92 + 76) % 68];
        assert_eq!(*b, expected, "loop byte {} differs", i);
    }
}

#[test]
fn test_intro_loop_seeks_fold_into_body() {
    let src = sin_pattern(68);
    let inner =
        InfiniteLoop::new(BytesSource::new(src.clone()), 68, SampleFormat::Int16).unwrap();
    let mut lp = InfiniteLoop::with_intro(inner, 76, 92, SampleFormat::Int16)
        .unwrap()
        .with_blending(false);

    read_full(&mut lp, 116);
    // 116 + 200 = 316 → (316 - 76) mod 92 + 76
    let pos = lp.seek(SeekFrom::Current(200)).unwrap();
    assert_eq!(pos, 132);
    assert!((76..76 + 92).contains(&pos));

    let pos = lp.seek(SeekFrom::Start(500)).unwrap();
    assert_eq!(pos, (500 - 76) % 92 + 76);
    assert!((76..76 + 92).contains(&pos));

    // Positions inside the intro are kept as they are.
    assert_eq!(lp.seek(SeekFrom::Start(40)).unwrap(), 40);

    let out = read_full(&mut lp, 8);
    let expected: Vec<u8> = (40..48).map(|i| src[i % 68]).collect();
    assert_eq!(out, expected);
}

#[test]
fn test_negative_seek_rejected() {
    let mut lp =
        InfiniteLoop::new(BytesSource::new(sin_pattern(64)), 64, SampleFormat::Int16).unwrap();
    read_full(&mut lp, 16);

    assert!(matches!(
        lp.seek(SeekFrom::Current(-20)),
        Err(Error::BadPosition(-4))
    ));
    assert_eq!(lp.position().unwrap(), 16);
}

#[test]
fn test_float_loop_keeps_frames_whole() {
    let src: Vec<u8> = (0u8..40).collect();
    // The source runs past the loop end; keep the joint unblended so bytes
    // compare exactly.
    let mut lp = InfiniteLoop::new(BytesSource::new(src.clone()), 36, SampleFormat::Float32)
        .unwrap()
        .with_blending(false);
    // 36 truncates to 32 bytes: four float32 stereo frames.
    assert_eq!(lp.loop_len(), 32);

    let mut buf = [0u8; 12];
    let outcome = lp.read(&mut buf).unwrap();
    assert_eq!(outcome.n % 8, 0);

    let out = read_full(&mut lp, 64);
    let start = outcome.n;
    for (i, b) in out.iter().enumerate() {
        assert_eq!(*b, src[(start + i) % 32]);
    }
}
