use crate::CodecError;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use strand_buf::{BufAllocator, ByteBuf, Cumulation, Cumulator};
use strand_channel::{Ctx, Handler, HandlerCaps, Msg};
use strand_core::Cause;

/// Turns a byte stream into discrete frames.
///
/// `decode` is invoked repeatedly against the accumulated input until it
/// stops making progress. Implementations emit frames into `out` and consume
/// the bytes they report — producing output without advancing the read
/// cursor is a protocol violation the skeleton turns into
/// [`CodecError::DecoderNoProgress`]. Implementations must not fire pipeline
/// events from inside `decode`; the skeleton forwards `out` afterwards.
pub trait FrameDecoder: Send + 'static {
    /// Decodes as much of `input` as possible, emitting frames into `out`.
    fn decode(
        &mut self,
        ctx: &Ctx,
        input: &mut Cumulation,
        out: &mut Vec<Msg>,
    ) -> Result<(), Cause>;

    /// Last call before the channel goes away; defaults to a plain decode.
    fn decode_last(
        &mut self,
        ctx: &Ctx,
        input: &mut Cumulation,
        out: &mut Vec<Msg>,
    ) -> Result<(), Cause> {
        self.decode(ctx, input, out)
    }
}

/// Configuration for the decode skeleton.
#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    /// How incoming buffers fold into the accumulator.
    pub cumulator: Cumulator,
    /// Stop after the first decoded message per delivery.
    pub single_decode: bool,
    /// Compact the accumulator every this many deliveries.
    pub discard_after_reads: usize,
}

impl DecoderConfig {
    pub fn new(cumulator: Cumulator, single_decode: bool, discard_after_reads: usize) -> Self {
        assert!(discard_after_reads > 0, "discard_after_reads must be positive");
        Self {
            cumulator,
            single_decode,
            discard_after_reads,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            cumulator: Cumulator::Merge,
            single_decode: false,
            discard_after_reads: 16,
        }
    }
}

/// Call-state machine guarding re-entrant self-removal: a decoder that
/// removes its own handler mid-`decode` has the removal deferred until the
/// call returns.
const STATE_INIT: u8 = 0;
const STATE_CALLING: u8 = 1;
const STATE_REMOVAL_PENDING: u8 = 2;

struct DecodeState<D> {
    decoder: D,
    cumulation: Option<Cumulation>,
    deliveries_since_discard: usize,
    decoded_in_burst: bool,
}

/// Pipeline handler driving a [`FrameDecoder`] against accumulated input.
///
/// One inbound delivery: adopt or cumulate the buffer, loop `decode` until
/// no progress, then free or periodically compact the accumulator and
/// forward the produced frames in order. On `channel_inactive` (or handler
/// removal) the remaining bytes are drained through `decode_last`.
pub struct StreamDecoder<D: FrameDecoder> {
    config: DecoderConfig,
    call_state: AtomicU8,
    state: Mutex<DecodeState<D>>,
}

impl<D: FrameDecoder> StreamDecoder<D> {
    /// Skeleton with default configuration (merge cumulator, multi-decode,
    /// compaction every 16 deliveries).
    pub fn new(decoder: D) -> Self {
        Self::with_config(decoder, DecoderConfig::default())
    }

    pub fn with_config(decoder: D, config: DecoderConfig) -> Self {
        Self {
            config,
            call_state: AtomicU8::new(STATE_INIT),
            state: Mutex::new(DecodeState {
                decoder,
                cumulation: None,
                deliveries_since_discard: 0,
                decoded_in_burst: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DecodeState<D>> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Repeatedly decodes until the handler is removed, no progress is made,
    /// or (in single-decode mode) the first message appears.
    fn call_decode(
        &self,
        state: &mut DecodeState<D>,
        ctx: &Ctx,
        out: &mut Vec<Msg>,
    ) -> Result<(), Cause> {
        loop {
            eprintln!("DEBUG loop iter");
            let Some(cumulation) = state.cumulation.as_mut() else {
                return Ok(());
            };
            if !cumulation.is_readable() {
                return Ok(());
            }
            let out_before = out.len();
            let readable_before = cumulation.readable_bytes();

            self.call_state.store(STATE_CALLING, Ordering::Release);
            eprintln!("DEBUG before decode call, out_before={}", out_before);
            let result = state.decoder.decode(ctx, cumulation, out);
            eprintln!("DEBUG after decode call, out.len()={}", out.len());
            let removal_pending = self
                .call_state
                .compare_exchange(
                    STATE_CALLING,
                    STATE_INIT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err();
            result?;

            if removal_pending {
                return Ok(());
            }
            let readable_after = cumulation.readable_bytes();
            if out.len() == out_before {
                if readable_after == readable_before {
                    return Ok(());
                }
                continue;
            }
            if readable_after == readable_before {
                return Err(Arc::new(CodecError::DecoderNoProgress));
            }
            if self.config.single_decode {
                return Ok(());
            }
        }
    }

    /// Accumulates one delivery and runs the decode loop.
    fn deliver(
        &self,
        state: &mut DecodeState<D>,
        ctx: &Ctx,
        alloc: &Arc<dyn BufAllocator>,
        incoming: ByteBuf,
        out: &mut Vec<Msg>,
    ) -> Result<(), Cause> {
        state.cumulation = Some(match state.cumulation.take() {
            // Empty accumulator: adopt the incoming buffer directly.
            None => Cumulation::Plain(incoming),
            Some(current) => self
                .config
                .cumulator
                .cumulate(alloc.as_ref(), current, incoming)
                .map_err(|e| Arc::new(CodecError::from_buf(e)) as Cause)?,
        });

        let decode_result = self.call_decode(state, ctx, out);

        let drained = state
            .cumulation
            .as_ref()
            .map_or(false, |cumulation| !cumulation.is_readable());
        if drained {
            if let Some(cumulation) = state.cumulation.take() {
                if let Err(e) = cumulation.release() {
                    tracing::debug!(error = %e, "releasing drained accumulator failed");
                }
            }
            state.deliveries_since_discard = 0;
        } else if let Some(cumulation) = state.cumulation.as_mut() {
            state.deliveries_since_discard += 1;
            if state.deliveries_since_discard >= self.config.discard_after_reads {
                state.deliveries_since_discard = 0;
                if let Err(e) = cumulation.discard_read_bytes() {
                    tracing::debug!(error = %e, "accumulator compaction failed");
                }
            }
        }
        decode_result
    }

    /// Drains the remaining accumulated bytes through `decode` plus a final
    /// `decode_last`, releasing the accumulator.
    fn drain_remaining(
        &self,
        state: &mut DecodeState<D>,
        ctx: &Ctx,
        out: &mut Vec<Msg>,
    ) -> Result<(), Cause> {
        let result = self.call_decode(state, ctx, out);
        if let Some(mut cumulation) = state.cumulation.take() {
            let last = if result.is_ok() {
                state.decoder.decode_last(ctx, &mut cumulation, out)
            } else {
                Ok(())
            };
            if let Err(e) = cumulation.release() {
                tracing::debug!(error = %e, "releasing accumulator on drain failed");
            }
            result?;
            return last;
        }
        result
    }

    /// Hands any undecoded bytes to the next handler on removal: the
    /// skeleton stops framing, but the bytes themselves are not lost.
    fn forward_remainder(&self, state: &mut DecodeState<D>, ctx: &Ctx) {
        if let Some(mut cumulation) = state.cumulation.take() {
            let readable = cumulation.readable_bytes();
            if readable > 0 {
                if let Some(alloc) = ctx.allocator() {
                    match cumulation.read_frame(readable, alloc.as_ref()) {
                        Ok(rest) => ctx.fire_channel_read(Box::new(rest)),
                        Err(e) => {
                            tracing::debug!(error = %e, "detaching undecoded remainder failed");
                        }
                    }
                    ctx.fire_channel_read_complete();
                }
            }
            if let Err(e) = cumulation.release() {
                tracing::debug!(error = %e, "releasing accumulator on removal failed");
            }
        }
    }
}

impl<D: FrameDecoder> Handler for StreamDecoder<D> {
    fn capabilities(&self) -> HandlerCaps {
        HandlerCaps::INBOUND
    }

    fn channel_read(&self, ctx: &Ctx, msg: Msg) -> Result<(), Cause> {
        let incoming = match msg.downcast::<ByteBuf>() {
            Ok(buf) => *buf,
            // Non-buffer messages bypass the decoder untouched.
            Err(other) => {
                ctx.fire_channel_read(other);
                return Ok(());
            }
        };
        let Some(alloc) = ctx.allocator() else {
            let _ = incoming.release();
            return Ok(());
        };

        let mut out: Vec<Msg> = Vec::new();
        let result = {
            let mut state = self.lock();
            let result = self.deliver(&mut state, ctx, &alloc, incoming, &mut out);
            state.decoded_in_burst |= !out.is_empty();
            result
        };

        for frame in out {
            ctx.fire_channel_read(frame);
        }
        // A removal requested mid-decode takes effect now: decoded frames
        // went out first, then the undecoded remainder.
        if self.call_state.load(Ordering::Acquire) == STATE_REMOVAL_PENDING {
            let mut state = self.lock();
            self.forward_remainder(&mut state, ctx);
            self.call_state.store(STATE_INIT, Ordering::Release);
        }
        result
    }

    fn channel_read_complete(&self, ctx: &Ctx) -> Result<(), Cause> {
        let decoded = {
            let mut state = self.lock();
            let decoded = state.decoded_in_burst;
            state.decoded_in_burst = false;
            if let Some(cumulation) = state.cumulation.as_mut() {
                if let Err(e) = cumulation.discard_read_bytes() {
                    tracing::debug!(error = %e, "accumulator compaction failed");
                }
            }
            decoded
        };
        ctx.fire_channel_read_complete();
        if !decoded {
            // A frame is still pending: ask the transport for more input.
            ctx.read();
        }
        Ok(())
    }

    fn channel_inactive(&self, ctx: &Ctx) -> Result<(), Cause> {
        let mut out: Vec<Msg> = Vec::new();
        let result = {
            let mut state = self.lock();
            self.drain_remaining(&mut state, ctx, &mut out)
        };
        let emitted = !out.is_empty();
        for frame in out {
            ctx.fire_channel_read(frame);
        }
        if emitted {
            ctx.fire_channel_read_complete();
        }
        ctx.fire_channel_inactive();
        result
    }

    fn handler_removed(&self, ctx: &Ctx) -> Result<(), Cause> {
        // Removal from inside `decode` is deferred until the call returns.
        if self
            .call_state
            .compare_exchange(
                STATE_CALLING,
                STATE_REMOVAL_PENDING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            return Ok(());
        }
        let mut state = self.lock();
        self.forward_remainder(&mut state, ctx);
        Ok(())
    }
}
