//! Fuzz target for frame decoding.
//!
//! Feeds arbitrary bytes to the incremental decoder. It must return frames
//! or an error, never panic.

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use stripe_coordinator::wire::FrameDecoder;

fuzz_target!(|data: &[u8]| {
    let mut decoder = FrameDecoder::new(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_frame)) = decoder.decode(&mut buf) {}
});
