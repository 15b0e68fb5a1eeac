use crate::pipeline::Ctx;
use std::any::Any;
use std::net::SocketAddr;
use strand_buf::ByteBuf;
use strand_core::{Cause, Promise};

/// Message travelling through a pipeline.
pub type Msg = Box<dyn Any + Send>;

/// User event travelling the inbound path.
pub type Event = Box<dyn Any + Send>;

/// Releases a reference-counted buffer message; other message types drop
/// normally.
pub fn release_msg(msg: Msg) {
    if let Ok(buf) = msg.downcast::<ByteBuf>() {
        if let Err(e) = buf.release() {
            tracing::debug!(error = %e, "releasing discarded buffer message failed");
        }
    }
}

/// Which traversal directions a handler participates in.
///
/// Dispatch skips contexts whose handler lacks the direction's capability,
/// replacing inheritance-based dispatch with a plain mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerCaps(u8);

impl HandlerCaps {
    /// Participates in head-to-tail event flow.
    pub const INBOUND: HandlerCaps = HandlerCaps(0b01);
    /// Participates in tail-to-head operation flow.
    pub const OUTBOUND: HandlerCaps = HandlerCaps(0b10);
    /// Participates in both directions.
    pub const DUPLEX: HandlerCaps = HandlerCaps(0b11);

    /// Returns `true` when this mask includes `other`.
    #[inline]
    pub fn contains(self, other: HandlerCaps) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A unit of protocol logic installed in a pipeline.
///
/// Every callback defaults to pass-through, so implementations override only
/// what they consume. Callbacks run on the channel's owning executor;
/// handlers therefore take `&self` and keep mutable state behind a lock that
/// is held only for short, non-forwarding sections. Never hold internal
/// state borrows across a `ctx.fire_*`/`ctx.write` call: the event may
/// re-enter this handler from the other direction.
///
/// Returning `Err` from an inbound callback fires `exception_caught` on this
/// handler's own context; returning `Err` from an outbound callback fails
/// the associated promise.
#[allow(unused_variables)]
pub trait Handler: Send + Sync + 'static {
    /// Directions this handler takes part in.
    fn capabilities(&self) -> HandlerCaps {
        HandlerCaps::DUPLEX
    }

    /// Called before any event is dispatched to this handler.
    fn handler_added(&self, ctx: &Ctx) -> Result<(), Cause> {
        Ok(())
    }

    /// Called after the handler's last event.
    fn handler_removed(&self, ctx: &Ctx) -> Result<(), Cause> {
        Ok(())
    }

    // ---------------------------------------------------------------------
    // INBOUND
    // ---------------------------------------------------------------------

    /// The channel was bound to its owning executor.
    fn channel_registered(&self, ctx: &Ctx) -> Result<(), Cause> {
        ctx.fire_channel_registered();
        Ok(())
    }

    /// The channel became active.
    fn channel_active(&self, ctx: &Ctx) -> Result<(), Cause> {
        ctx.fire_channel_active();
        Ok(())
    }

    /// The channel became inactive; no inbound callbacks follow.
    fn channel_inactive(&self, ctx: &Ctx) -> Result<(), Cause> {
        ctx.fire_channel_inactive();
        Ok(())
    }

    /// A message arrived from the transport or an upstream handler.
    fn channel_read(&self, ctx: &Ctx, msg: Msg) -> Result<(), Cause> {
        ctx.fire_channel_read(msg);
        Ok(())
    }

    /// The current read burst finished.
    fn channel_read_complete(&self, ctx: &Ctx) -> Result<(), Cause> {
        ctx.fire_channel_read_complete();
        Ok(())
    }

    /// The outbound buffer crossed a writability boundary.
    fn channel_writability_changed(&self, ctx: &Ctx) -> Result<(), Cause> {
        ctx.fire_channel_writability_changed();
        Ok(())
    }

    /// An application-level event (idle notifications travel here).
    fn user_event(&self, ctx: &Ctx, event: Event) -> Result<(), Cause> {
        ctx.fire_user_event(event);
        Ok(())
    }

    /// An error travelling toward the tail.
    fn exception_caught(&self, ctx: &Ctx, cause: Cause) -> Result<(), Cause> {
        ctx.fire_exception_caught(cause);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // OUTBOUND
    // ---------------------------------------------------------------------

    /// Bind request travelling toward the transport.
    fn bind(&self, ctx: &Ctx, addr: SocketAddr, promise: Promise<()>) -> Result<(), Cause> {
        ctx.bind(addr, promise);
        Ok(())
    }

    /// Connect request travelling toward the transport.
    fn connect(&self, ctx: &Ctx, remote: SocketAddr, promise: Promise<()>) -> Result<(), Cause> {
        ctx.connect(remote, promise);
        Ok(())
    }

    /// Write request; the message lands in the outbound buffer at the head.
    fn write(&self, ctx: &Ctx, msg: Msg, promise: Promise<()>) -> Result<(), Cause> {
        ctx.write(msg, promise);
        Ok(())
    }

    /// Flush request: drain the outbound buffer into the transport.
    fn flush(&self, ctx: &Ctx) -> Result<(), Cause> {
        ctx.flush();
        Ok(())
    }

    /// Read request toward the transport.
    fn read(&self, ctx: &Ctx) -> Result<(), Cause> {
        ctx.read();
        Ok(())
    }

    /// Close request travelling toward the transport.
    fn close(&self, ctx: &Ctx, promise: Promise<()>) -> Result<(), Cause> {
        ctx.close(promise);
        Ok(())
    }

    /// Deregister request: detach the channel from its executor.
    fn deregister(&self, ctx: &Ctx, promise: Promise<()>) -> Result<(), Cause> {
        ctx.deregister(promise);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_masks_compose() {
        assert!(HandlerCaps::DUPLEX.contains(HandlerCaps::INBOUND));
        assert!(HandlerCaps::DUPLEX.contains(HandlerCaps::OUTBOUND));
        assert!(!HandlerCaps::INBOUND.contains(HandlerCaps::OUTBOUND));
        assert!(!HandlerCaps::OUTBOUND.contains(HandlerCaps::INBOUND));
    }
}
