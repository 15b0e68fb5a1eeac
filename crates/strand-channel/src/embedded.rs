use crate::channel::{Channel, ChannelConfig, Transport};
use crate::handler::{Handler, Msg};
use crate::pipeline::Pipeline;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strand_buf::ByteBuf;
use strand_core::{Executor, ManualExecutor, Promise};

struct EmbeddedTransport {
    written: Arc<Mutex<VecDeque<Msg>>>,
}

impl Transport for EmbeddedTransport {
    fn bind(&mut self, _addr: std::net::SocketAddr) -> Result<(), strand_core::Cause> {
        Ok(())
    }

    fn connect(&mut self, _remote: std::net::SocketAddr) -> Result<(), strand_core::Cause> {
        Ok(())
    }

    fn write(&mut self, msg: Msg) -> Result<(), strand_core::Cause> {
        self.written
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(msg);
        Ok(())
    }

    fn close(&mut self) -> Result<(), strand_core::Cause> {
        Ok(())
    }
}

/// Channel without a real transport, driven inline by a [`ManualExecutor`].
///
/// Inbound messages pushed with [`write_inbound`](Self::write_inbound) run
/// the whole pipeline synchronously; whatever reaches the tail is captured
/// for [`read_inbound`](Self::read_inbound). Flushed outbound messages are
/// captured for [`read_outbound`](Self::read_outbound). Scheduled work
/// (idle timers, write timeouts) is driven deterministically with
/// [`advance_time`](Self::advance_time).
pub struct EmbeddedChannel {
    channel: Channel,
    executor: Arc<ManualExecutor>,
    inbound: Arc<Mutex<VecDeque<Msg>>>,
    outbound: Arc<Mutex<VecDeque<Msg>>>,
}

impl EmbeddedChannel {
    /// Channel with an empty pipeline.
    pub fn new() -> Self {
        Self::with_handlers(Vec::new())
    }

    /// Channel with `handlers` installed head-to-tail as `handler0..n`.
    pub fn with_handlers(handlers: Vec<Box<dyn Handler>>) -> Self {
        let outbound = Arc::new(Mutex::new(VecDeque::new()));
        let inbound = Arc::new(Mutex::new(VecDeque::new()));
        let executor = ManualExecutor::new();

        let channel = Channel::new(
            ChannelConfig::default(),
            Box::new(EmbeddedTransport {
                written: Arc::clone(&outbound),
            }),
        );
        channel.install_inbound_sink(Arc::clone(&inbound));
        channel
            .register(Arc::clone(&executor) as Arc<dyn Executor>)
            .await_done()
            .expect("inline registration");

        for (index, handler) in handlers.into_iter().enumerate() {
            channel
                .pipeline()
                .add_last(&format!("handler{index}"), handler)
                .expect("unique generated handler name");
        }
        channel.mark_active();

        Self {
            channel,
            executor,
            inbound,
            outbound,
        }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The channel's pipeline.
    pub fn pipeline(&self) -> Pipeline {
        self.channel.pipeline()
    }

    /// The inline executor driving this channel.
    pub fn executor(&self) -> &Arc<ManualExecutor> {
        &self.executor
    }

    /// Feeds one message into the pipeline and completes the read burst.
    /// Returns `true` when at least one message reached the tail.
    pub fn write_inbound(&self, msg: Msg) -> bool {
        self.channel.fire_channel_read(msg);
        self.channel.fire_channel_read_complete();
        self.executor.run_pending_tasks();
        !self.lock(&self.inbound).is_empty()
    }

    /// Writes and flushes a message through the outbound path.
    pub fn write_outbound(&self, msg: Msg) -> Promise<()> {
        let promise = self.channel.write_and_flush(msg);
        self.executor.run_pending_tasks();
        promise
    }

    /// Pops the next message captured at the tail.
    pub fn read_inbound(&self) -> Option<Msg> {
        self.lock(&self.inbound).pop_front()
    }

    /// Pops the next tail message, downcast to a buffer.
    pub fn read_inbound_buf(&self) -> Option<ByteBuf> {
        self.read_inbound()
            .and_then(|msg| msg.downcast::<ByteBuf>().ok())
            .map(|b| *b)
    }

    /// Pops the next message the transport would have written to the wire.
    pub fn read_outbound(&self) -> Option<Msg> {
        self.lock(&self.outbound).pop_front()
    }

    /// Moves the virtual clock, firing due scheduled tasks.
    pub fn advance_time(&self, delta: Duration) {
        self.executor.advance_time(delta);
    }

    /// Runs queued tasks without moving the clock.
    pub fn run_pending_tasks(&self) {
        self.executor.run_pending_tasks();
    }

    /// Closes the channel and reports whether any messages are left
    /// unconsumed in either direction.
    pub fn finish(&self) -> bool {
        self.channel
            .close()
            .await_done()
            .expect("inline close");
        self.executor.run_pending_tasks();
        !self.lock(&self.inbound).is_empty() || !self.lock(&self.outbound).is_empty()
    }

    fn lock<'a>(&self, queue: &'a Mutex<VecDeque<Msg>>) -> std::sync::MutexGuard<'a, VecDeque<Msg>> {
        queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for EmbeddedChannel {
    fn default() -> Self {
        Self::new()
    }
}
