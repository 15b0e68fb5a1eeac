//! Idle and write-timeout supervision on virtual time.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use strand_buf::{BufAllocator, ByteBuf, HeapAllocator};
use strand_channel::{Ctx, EmbeddedChannel, Event, Handler};
use strand_codec::{
    CodecError, IdleConfig, IdleHandler, IdleState, IdleStateEvent, WriteTimeoutHandler,
};
use strand_core::Cause;

/// Records idle events and errors travelling past it.
struct Observer {
    idle: Arc<Mutex<Vec<IdleStateEvent>>>,
    errors: Arc<Mutex<Vec<Cause>>>,
}

impl Handler for Observer {
    fn user_event(&self, ctx: &Ctx, event: Event) -> Result<(), Cause> {
        match event.downcast::<IdleStateEvent>() {
            Ok(idle) => self.idle.lock().unwrap().push(*idle),
            Err(other) => ctx.fire_user_event(other),
        }
        Ok(())
    }

    fn exception_caught(&self, _ctx: &Ctx, cause: Cause) -> Result<(), Cause> {
        self.errors.lock().unwrap().push(cause);
        Ok(())
    }
}

struct Probes {
    idle: Arc<Mutex<Vec<IdleStateEvent>>>,
    errors: Arc<Mutex<Vec<Cause>>>,
}

fn supervised(handler: Box<dyn Handler>) -> (EmbeddedChannel, Probes) {
    let idle = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let channel = EmbeddedChannel::with_handlers(vec![
        handler,
        Box::new(Observer {
            idle: Arc::clone(&idle),
            errors: Arc::clone(&errors),
        }),
    ]);
    (channel, Probes { idle, errors })
}

fn buf(alloc: &HeapAllocator, bytes: &[u8]) -> ByteBuf {
    let mut buf = alloc.allocate(bytes.len().max(1), 256);
    buf.write_bytes(bytes).unwrap();
    buf
}

#[test]
fn reader_idle_fires_after_the_window() {
    let (channel, probes) = supervised(Box::new(IdleHandler::new(IdleConfig::new(
        Duration::from_secs(1),
        Duration::ZERO,
        Duration::ZERO,
    ))));

    channel.advance_time(Duration::from_millis(999));
    assert!(probes.idle.lock().unwrap().is_empty());

    channel.advance_time(Duration::from_millis(1));
    {
        let idle = probes.idle.lock().unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].state, IdleState::ReaderIdle);
        assert!(idle[0].first);
    }

    // Still idle: the next full window fires a non-first event.
    channel.advance_time(Duration::from_secs(1));
    {
        let idle = probes.idle.lock().unwrap();
        assert_eq!(idle.len(), 2);
        assert!(!idle[1].first);
    }
    channel.finish();
}

#[test]
fn read_activity_resets_the_reader_window() {
    let alloc = HeapAllocator::unsampled();
    let (channel, probes) = supervised(Box::new(IdleHandler::new(IdleConfig::new(
        Duration::from_secs(1),
        Duration::ZERO,
        Duration::ZERO,
    ))));

    channel.advance_time(Duration::from_millis(800));
    channel.write_inbound(Box::new(buf(&alloc, b"ping")));

    // 800ms of the old window plus 900ms of the new one: no event yet.
    channel.advance_time(Duration::from_millis(900));
    assert!(probes.idle.lock().unwrap().is_empty());

    channel.advance_time(Duration::from_millis(100));
    assert_eq!(probes.idle.lock().unwrap().len(), 1);
    channel.finish();
}

#[test]
fn writer_idle_counts_completed_writes() {
    let alloc = HeapAllocator::unsampled();
    let (channel, probes) = supervised(Box::new(IdleHandler::new(IdleConfig::new(
        Duration::ZERO,
        Duration::from_secs(1),
        Duration::ZERO,
    ))));

    channel.advance_time(Duration::from_millis(600));
    // Flushed write: completes immediately on the embedded transport.
    channel.write_outbound(Box::new(buf(&alloc, b"out"))).sync().unwrap();
    assert!(channel.read_outbound().is_some());

    channel.advance_time(Duration::from_millis(900));
    assert!(probes.idle.lock().unwrap().is_empty());

    channel.advance_time(Duration::from_millis(100));
    let idle = probes.idle.lock().unwrap();
    assert_eq!(idle.len(), 1);
    assert_eq!(idle[0].state, IdleState::WriterIdle);
    channel.finish();
}

/// Outbound-buffer progress suppresses writer idleness while a slow peer
/// drains a large write.
#[test]
fn observe_output_suppresses_writer_idle_while_draining() {
    let alloc = HeapAllocator::unsampled();
    let (channel, probes) = supervised(Box::new(IdleHandler::new(
        IdleConfig::new(Duration::ZERO, Duration::from_secs(1), Duration::ZERO)
            .with_observe_output(true),
    )));

    // Queue without flushing: the write never completes, but pending bytes
    // keep changing while the "peer" drains.
    channel.channel().write(Box::new(buf(&alloc, b"chunk-one")));
    channel.run_pending_tasks();

    channel.advance_time(Duration::from_millis(500));
    channel.channel().write(Box::new(buf(&alloc, b"chunk-two")));
    channel.run_pending_tasks();

    // 1s mark: pending bytes changed since the last check.
    channel.advance_time(Duration::from_millis(500));
    assert!(probes.idle.lock().unwrap().is_empty());

    channel.advance_time(Duration::from_millis(500));
    channel.channel().write(Box::new(buf(&alloc, b"chunk-three")));
    channel.run_pending_tasks();

    // 2s mark: still progressing, still no event.
    channel.advance_time(Duration::from_millis(500));
    assert!(probes.idle.lock().unwrap().is_empty());

    // Progress stops: the next full window fires.
    channel.advance_time(Duration::from_secs(1));
    let idle = probes.idle.lock().unwrap();
    assert_eq!(idle.len(), 1);
    assert_eq!(idle[0].state, IdleState::WriterIdle);
    channel.finish();
}

#[test]
fn all_idle_tracks_both_directions() {
    let alloc = HeapAllocator::unsampled();
    let (channel, probes) = supervised(Box::new(IdleHandler::new(IdleConfig::new(
        Duration::ZERO,
        Duration::ZERO,
        Duration::from_secs(1),
    ))));

    channel.advance_time(Duration::from_millis(700));
    channel.write_inbound(Box::new(buf(&alloc, b"in")));
    channel.advance_time(Duration::from_millis(700));
    channel.write_outbound(Box::new(buf(&alloc, b"out"))).sync().unwrap();
    channel.advance_time(Duration::from_millis(700));
    assert!(probes.idle.lock().unwrap().is_empty());

    channel.advance_time(Duration::from_millis(300));
    let idle = probes.idle.lock().unwrap();
    assert_eq!(idle.len(), 1);
    assert_eq!(idle[0].state, IdleState::AllIdle);
    channel.finish();
}

#[test]
fn write_timeout_fails_a_stalled_write_and_closes() {
    let alloc = HeapAllocator::unsampled();
    let (channel, probes) = supervised(Box::new(WriteTimeoutHandler::new(Duration::from_secs(
        1,
    ))));

    // Queued but never flushed: the deadline will find it incomplete.
    let promise = channel.channel().write(Box::new(buf(&alloc, b"stall")));
    channel.run_pending_tasks();
    assert!(!promise.is_done());

    channel.advance_time(Duration::from_secs(1));
    assert!(promise.is_done());
    assert!(!promise.is_success());

    let errors = probes.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0].downcast_ref::<CodecError>(),
        Some(CodecError::WriteTimeout { .. })
    ));
    drop(errors);
    assert!(!channel.channel().is_active());
}

#[test]
fn completed_writes_cancel_their_deadlines() {
    let alloc = HeapAllocator::unsampled();
    let (channel, probes) = supervised(Box::new(WriteTimeoutHandler::new(Duration::from_secs(
        1,
    ))));

    channel.write_outbound(Box::new(buf(&alloc, b"quick"))).sync().unwrap();
    channel.advance_time(Duration::from_secs(2));

    assert!(probes.errors.lock().unwrap().is_empty());
    assert!(channel.channel().is_active());
    channel.finish();
}

#[test]
fn handler_removal_cancels_pending_deadlines() {
    let alloc = HeapAllocator::unsampled();
    let (channel, probes) = supervised(Box::new(WriteTimeoutHandler::new(Duration::from_secs(
        1,
    ))));

    let promise = channel.channel().write(Box::new(buf(&alloc, b"stall")));
    channel.run_pending_tasks();
    channel.pipeline().remove("handler0").unwrap();

    channel.advance_time(Duration::from_secs(2));
    assert!(!promise.is_done());
    assert!(probes.errors.lock().unwrap().is_empty());
    assert!(channel.channel().is_active());
    channel.finish();
}
