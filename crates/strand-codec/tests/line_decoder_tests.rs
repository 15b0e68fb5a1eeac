//! Line framer behavior, including the over-long discard protocol and the
//! chunking-independence property.

use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use strand_buf::{BufAllocator, ByteBuf, HeapAllocator};
use strand_channel::{Ctx, EmbeddedChannel, Handler, Msg};
use strand_codec::{CodecError, LineDecoder, StreamDecoder};
use strand_core::Cause;

/// Records every error travelling past it instead of forwarding.
struct ErrorCatcher {
    seen: Arc<Mutex<Vec<Cause>>>,
}

impl Handler for ErrorCatcher {
    fn exception_caught(&self, _ctx: &Ctx, cause: Cause) -> Result<(), Cause> {
        self.seen.lock().unwrap().push(cause);
        Ok(())
    }

    fn channel_read(&self, ctx: &Ctx, msg: Msg) -> Result<(), Cause> {
        ctx.fire_channel_read(msg);
        Ok(())
    }
}

fn buf(alloc: &HeapAllocator, bytes: &[u8]) -> ByteBuf {
    let mut buf = alloc.allocate(bytes.len().max(1), bytes.len().max(64) * 4);
    buf.write_bytes(bytes).unwrap();
    buf
}

fn framer_channel(
    max_length: usize,
    strip: bool,
    fail_fast: bool,
) -> (EmbeddedChannel, Arc<Mutex<Vec<Cause>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let channel = EmbeddedChannel::with_handlers(vec![
        Box::new(StreamDecoder::new(
            LineDecoder::new(max_length)
                .with_strip_delimiter(strip)
                .with_fail_fast(fail_fast),
        )),
        Box::new(ErrorCatcher {
            seen: Arc::clone(&seen),
        }),
    ]);
    (channel, seen)
}

fn frame_bytes(channel: &EmbeddedChannel) -> Option<Vec<u8>> {
    let frame = channel.read_inbound_buf()?;
    let bytes = frame.copy_to_vec();
    frame.release().unwrap();
    Some(bytes)
}

fn too_long_errors(seen: &Arc<Mutex<Vec<Cause>>>) -> Vec<usize> {
    seen.lock()
        .unwrap()
        .iter()
        .filter_map(|cause| match cause.downcast_ref::<CodecError>() {
            Some(CodecError::FrameTooLong { length, .. }) => Some(*length),
            _ => None,
        })
        .collect()
}

/// A line split across three deliveries comes out as two clean frames.
#[test]
fn split_line_across_buffers() {
    let alloc = HeapAllocator::unsampled();
    let (channel, seen) = framer_channel(64, true, true);

    channel.write_inbound(Box::new(buf(&alloc, b"he")));
    channel.write_inbound(Box::new(buf(&alloc, b"llo\nwor")));
    channel.write_inbound(Box::new(buf(&alloc, b"ld\r\n")));

    assert_eq!(frame_bytes(&channel).unwrap(), b"hello");
    assert_eq!(frame_bytes(&channel).unwrap(), b"world");
    assert!(frame_bytes(&channel).is_none());
    assert!(seen.lock().unwrap().is_empty());
    channel.finish();
}

/// Fail-fast raises the moment accumulated readable exceeds the limit,
/// before any delimiter arrives; the delimiter then clears silently.
#[test]
fn over_long_frame_fail_fast() {
    let alloc = HeapAllocator::unsampled();
    let (channel, seen) = framer_channel(4, true, true);

    channel.write_inbound(Box::new(buf(&alloc, b"abcdefgh")));
    assert_eq!(too_long_errors(&seen), vec![8]);
    assert!(frame_bytes(&channel).is_none());

    channel.write_inbound(Box::new(buf(&alloc, b"\n")));
    assert_eq!(too_long_errors(&seen), vec![8]);
    assert!(frame_bytes(&channel).is_none());

    // The framer recovered: the next line decodes normally.
    channel.write_inbound(Box::new(buf(&alloc, b"ok\n")));
    assert_eq!(frame_bytes(&channel).unwrap(), b"ok");
    channel.finish();
}

/// A too-long frame that arrives whole still fails and discards through the
/// delimiter.
#[test]
fn over_long_frame_single_delivery() {
    let alloc = HeapAllocator::unsampled();
    let (channel, seen) = framer_channel(4, true, true);

    channel.write_inbound(Box::new(buf(&alloc, b"abcdefgh\nok\n")));
    assert_eq!(too_long_errors(&seen), vec![8]);
    // The error aborts this delivery's decode loop; the surviving bytes
    // decode with the next one.
    assert!(frame_bytes(&channel).is_none());

    channel.write_inbound(Box::new(buf(&alloc, b"next\n")));
    assert_eq!(frame_bytes(&channel).unwrap(), b"ok");
    assert_eq!(frame_bytes(&channel).unwrap(), b"next");
    assert!(frame_bytes(&channel).is_none());
    channel.finish();
}

/// Without fail-fast the error waits for the delimiter and reports the full
/// discarded length.
#[test]
fn over_long_frame_not_fail_fast() {
    let alloc = HeapAllocator::unsampled();
    let (channel, seen) = framer_channel(4, true, false);

    channel.write_inbound(Box::new(buf(&alloc, b"abcdefgh")));
    assert!(too_long_errors(&seen).is_empty());

    channel.write_inbound(Box::new(buf(&alloc, b"ij")));
    assert!(too_long_errors(&seen).is_empty());

    channel.write_inbound(Box::new(buf(&alloc, b"kl\n")));
    assert_eq!(too_long_errors(&seen), vec![12]);
    assert!(frame_bytes(&channel).is_none());
    channel.finish();
}

#[test]
fn delimiters_are_kept_when_not_stripping() {
    let alloc = HeapAllocator::unsampled();
    let (channel, seen) = framer_channel(64, false, true);

    channel.write_inbound(Box::new(buf(&alloc, b"a\nb\r\n")));
    assert_eq!(frame_bytes(&channel).unwrap(), b"a\n");
    assert_eq!(frame_bytes(&channel).unwrap(), b"b\r\n");
    assert!(seen.lock().unwrap().is_empty());
    channel.finish();
}

#[test]
fn empty_lines_become_empty_frames() {
    let alloc = HeapAllocator::unsampled();
    let (channel, _seen) = framer_channel(64, true, true);

    channel.write_inbound(Box::new(buf(&alloc, b"\n\r\n")));
    assert_eq!(frame_bytes(&channel).unwrap(), b"");
    assert_eq!(frame_bytes(&channel).unwrap(), b"");
    channel.finish();
}

/// A CRLF split exactly between deliveries still counts as one delimiter.
#[test]
fn crlf_split_between_deliveries() {
    let alloc = HeapAllocator::unsampled();
    let (channel, _seen) = framer_channel(64, true, true);

    channel.write_inbound(Box::new(buf(&alloc, b"hi\r")));
    assert!(frame_bytes(&channel).is_none());
    channel.write_inbound(Box::new(buf(&alloc, b"\nyo\n")));
    assert_eq!(frame_bytes(&channel).unwrap(), b"hi");
    assert_eq!(frame_bytes(&channel).unwrap(), b"yo");
    channel.finish();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Round-trip: frames joined with LF/CRLF and chunked arbitrarily come
    /// out exactly as the original frames, regardless of chunking.
    #[test]
    fn prop_chunking_independent_round_trip(
        frames in prop::collection::vec(
            prop::collection::vec(
                prop::num::u8::ANY.prop_filter("no delimiter bytes", |b| *b != b'\n' && *b != b'\r'),
                0..24,
            ),
            1..8,
        ),
        crlf_flags in prop::collection::vec(prop::bool::ANY, 8),
        cuts in prop::collection::vec(1usize..8, 0..16),
    ) {
        let alloc = HeapAllocator::unsampled();
        let (channel, seen) = framer_channel(64, true, true);

        // Concatenate frames with chosen delimiters.
        let mut stream = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            stream.extend_from_slice(frame);
            if crlf_flags[i % crlf_flags.len()] {
                stream.extend_from_slice(b"\r\n");
            } else {
                stream.push(b'\n');
            }
        }

        // Chunk the stream at arbitrary points.
        let mut offset = 0;
        let mut cut_iter = cuts.iter().copied().cycle();
        while offset < stream.len() {
            let take = cut_iter.next().unwrap_or(4).min(stream.len() - offset);
            channel.write_inbound(Box::new(buf(&alloc, &stream[offset..offset + take])));
            offset += take;
        }

        for frame in &frames {
            let decoded = frame_bytes(&channel);
            prop_assert_eq!(decoded.as_deref(), Some(frame.as_slice()));
        }
        prop_assert!(frame_bytes(&channel).is_none());
        prop_assert!(seen.lock().unwrap().is_empty());
        channel.finish();
    }
}
