//! Decode-skeleton protocol: progress enforcement, cumulator strategies,
//! single-decode, inactive drain and re-entrant removal.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use strand_buf::{BufAllocator, ByteBuf, Cumulation, Cumulator, HeapAllocator};
use strand_channel::{Ctx, EmbeddedChannel, Handler, Msg};
use strand_codec::{CodecError, DecoderConfig, FrameDecoder, LineDecoder, StreamDecoder};
use strand_core::Cause;

struct ErrorCatcher {
    seen: Arc<Mutex<Vec<Cause>>>,
}

impl Handler for ErrorCatcher {
    fn exception_caught(&self, _ctx: &Ctx, cause: Cause) -> Result<(), Cause> {
        self.seen.lock().unwrap().push(cause);
        Ok(())
    }
}

fn buf(alloc: &HeapAllocator, bytes: &[u8]) -> ByteBuf {
    let mut buf = alloc.allocate(bytes.len().max(1), 1024);
    buf.write_bytes(bytes).unwrap();
    buf
}

/// Emits a message without consuming anything: the skeleton must refuse it.
struct Stuck;

impl FrameDecoder for Stuck {
    fn decode(
        &mut self,
        _ctx: &Ctx,
        _input: &mut Cumulation,
        out: &mut Vec<Msg>,
    ) -> Result<(), Cause> {
        out.push(Box::new(()));
        Ok(())
    }
}

#[test]
fn decoding_without_consuming_is_rejected() {
    let alloc = HeapAllocator::unsampled();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let channel = EmbeddedChannel::with_handlers(vec![
        Box::new(StreamDecoder::new(Stuck)),
        Box::new(ErrorCatcher {
            seen: Arc::clone(&seen),
        }),
    ]);

    channel.write_inbound(Box::new(buf(&alloc, b"xyz")));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(matches!(
        seen[0].downcast_ref::<CodecError>(),
        Some(CodecError::DecoderNoProgress)
    ));
    channel.finish();
}

#[test]
fn composite_cumulator_spans_deliveries_without_copying_inline() {
    let alloc = HeapAllocator::unsampled();
    let channel = EmbeddedChannel::with_handlers(vec![Box::new(StreamDecoder::with_config(
        LineDecoder::new(64).with_strip_delimiter(true),
        DecoderConfig::new(Cumulator::Composite, false, 16),
    ))]);

    channel.write_inbound(Box::new(buf(&alloc, b"sp")));
    channel.write_inbound(Box::new(buf(&alloc, b"lit")));
    channel.write_inbound(Box::new(buf(&alloc, b"\n")));

    let frame = channel.read_inbound_buf().unwrap();
    assert_eq!(frame.copy_to_vec(), b"split");
    frame.release().unwrap();
    channel.finish();
}

#[test]
fn single_decode_emits_at_most_one_frame_per_delivery() {
    let alloc = HeapAllocator::unsampled();
    let channel = EmbeddedChannel::with_handlers(vec![Box::new(StreamDecoder::with_config(
        LineDecoder::new(64).with_strip_delimiter(true),
        DecoderConfig::new(Cumulator::Merge, true, 16),
    ))]);

    channel.write_inbound(Box::new(buf(&alloc, b"a\nb\n")));
    let first = channel.read_inbound_buf().unwrap();
    assert_eq!(first.copy_to_vec(), b"a");
    first.release().unwrap();
    assert!(channel.read_inbound().is_none());

    // The next delivery resumes where single-decode stopped.
    channel.write_inbound(Box::new(buf(&alloc, b"c\n")));
    let second = channel.read_inbound_buf().unwrap();
    assert_eq!(second.copy_to_vec(), b"b");
    second.release().unwrap();
    channel.finish();
}

#[test]
fn non_buffer_messages_bypass_the_decoder() {
    let channel = EmbeddedChannel::with_handlers(vec![Box::new(StreamDecoder::new(
        LineDecoder::new(64),
    ))]);

    channel.write_inbound(Box::new("passthrough".to_string()));
    let msg = channel.read_inbound().unwrap();
    assert_eq!(*msg.downcast::<String>().unwrap(), "passthrough");
    channel.finish();
}

/// Emits whatever is left as one frame when the channel goes inactive.
struct DrainLast;

impl FrameDecoder for DrainLast {
    fn decode(
        &mut self,
        _ctx: &Ctx,
        _input: &mut Cumulation,
        _out: &mut Vec<Msg>,
    ) -> Result<(), Cause> {
        Ok(())
    }

    fn decode_last(
        &mut self,
        ctx: &Ctx,
        input: &mut Cumulation,
        out: &mut Vec<Msg>,
    ) -> Result<(), Cause> {
        let readable = input.readable_bytes();
        if readable > 0 {
            let alloc = ctx.allocator().expect("channel alive during drain");
            let frame = input
                .read_frame(readable, alloc.as_ref())
                .map_err(|e| Arc::new(CodecError::from_buf(e)) as Cause)?;
            out.push(Box::new(frame));
        }
        Ok(())
    }
}

#[test]
fn channel_inactive_drains_through_decode_last() {
    let alloc = HeapAllocator::unsampled();
    let channel = EmbeddedChannel::with_handlers(vec![Box::new(StreamDecoder::new(DrainLast))]);

    channel.write_inbound(Box::new(buf(&alloc, b"tail-bytes")));
    assert!(channel.read_inbound().is_none());

    channel.channel().close().await_done().unwrap();
    let frame = channel.read_inbound_buf().unwrap();
    assert_eq!(frame.copy_to_vec(), b"tail-bytes");
    frame.release().unwrap();
}

/// Removes its own handler mid-decode; the skeleton must defer the removal
/// until the call returns and then forward the unconsumed remainder.
struct SelfRemoving {
    removed: Arc<AtomicBool>,
}

impl FrameDecoder for SelfRemoving {
    fn decode(
        &mut self,
        ctx: &Ctx,
        input: &mut Cumulation,
        out: &mut Vec<Msg>,
    ) -> Result<(), Cause> {
        // Consume one byte as a frame, then bow out.
        let alloc = ctx.allocator().expect("channel alive");
        let frame = input
            .read_frame(1, alloc.as_ref())
            .map_err(|e| Arc::new(CodecError::from_buf(e)) as Cause)?;
        out.push(Box::new(frame));
        ctx.remove_self().expect("still installed");
        self.removed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn self_removal_during_decode_is_deferred() {
    let alloc = HeapAllocator::unsampled();
    let removed = Arc::new(AtomicBool::new(false));
    let channel = EmbeddedChannel::with_handlers(vec![Box::new(StreamDecoder::new(
        SelfRemoving {
            removed: Arc::clone(&removed),
        },
    ))]);

    channel.write_inbound(Box::new(buf(&alloc, b"abc")));
    assert!(removed.load(Ordering::SeqCst));
    assert!(channel.pipeline().names().is_empty());

    // One decoded frame, then the untouched remainder.
    let first = channel.read_inbound_buf().unwrap();
    assert_eq!(first.copy_to_vec(), b"a");
    first.release().unwrap();

    let rest = channel.read_inbound_buf().unwrap();
    assert_eq!(rest.copy_to_vec(), b"bc");
    rest.release().unwrap();

    // The decoder is gone: raw buffers now pass straight to the tail.
    let raw = buf(&alloc, b"later");
    channel.write_inbound(Box::new(raw));
    let passed = channel.read_inbound_buf().unwrap();
    assert_eq!(passed.copy_to_vec(), b"later");
    passed.release().unwrap();
    channel.finish();
}

#[test]
fn removal_outside_decode_forwards_the_remainder() {
    let alloc = HeapAllocator::unsampled();
    let channel = EmbeddedChannel::with_handlers(vec![Box::new(StreamDecoder::new(
        LineDecoder::new(64).with_strip_delimiter(true),
    ))]);

    channel.write_inbound(Box::new(buf(&alloc, b"partial")));
    assert!(channel.read_inbound().is_none());

    channel.pipeline().remove("handler0").unwrap();
    let rest = channel.read_inbound_buf().unwrap();
    assert_eq!(rest.copy_to_vec(), b"partial");
    rest.release().unwrap();
    channel.finish();
}

/// Deliveries are counted toward periodic compaction whether or not they
/// produced a frame.
#[test]
fn accumulator_is_compacted_after_configured_deliveries() {
    let alloc = HeapAllocator::unsampled();
    let reads = Arc::new(AtomicUsize::new(0));

    struct CountingLines {
        inner: LineDecoder,
        reads: Arc<AtomicUsize>,
    }
    impl FrameDecoder for CountingLines {
        fn decode(
            &mut self,
            ctx: &Ctx,
            input: &mut Cumulation,
            out: &mut Vec<Msg>,
        ) -> Result<(), Cause> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.decode(ctx, input, out)
        }
    }

    let channel = EmbeddedChannel::with_handlers(vec![Box::new(StreamDecoder::with_config(
        CountingLines {
            inner: LineDecoder::new(1024).with_strip_delimiter(true),
            reads: Arc::clone(&reads),
        },
        DecoderConfig::new(Cumulator::Merge, false, 2),
    ))]);

    for _ in 0..6 {
        channel.write_inbound(Box::new(buf(&alloc, b"x")));
    }
    assert!(reads.load(Ordering::SeqCst) >= 6);
    assert!(channel.read_inbound().is_none());
    channel.finish();
}
