use crate::handler::{release_msg, Event, Msg};
use crate::outbound::OutboundBuffer;
use crate::pipeline::Pipeline;
use crate::{AttrMap, ChannelError};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use strand_buf::{BufAllocator, ByteBuf, HeapAllocator};
use strand_core::{Cause, Executor, Promise};

/// Lifecycle of a channel. Closed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChannelState {
    /// Constructed, no owning executor yet.
    Unregistered = 0,
    /// Pinned to an executor; not yet carrying traffic.
    Registered = 1,
    /// Open for reads and writes.
    Active = 2,
    /// Shutting down: flushing what it can, accepting nothing new.
    Closing = 3,
    /// All resources released; events are dropped.
    Closed = 4,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Unregistered,
            1 => ChannelState::Registered,
            2 => ChannelState::Active,
            3 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

/// Process-unique channel identity with a short hex display form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Channel-level configuration.
#[derive(Clone)]
pub struct ChannelConfig {
    /// Allocator handed to decoders and transports.
    pub allocator: Arc<dyn BufAllocator>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            allocator: Arc::new(HeapAllocator::default()),
        }
    }
}

/// The transport operations a channel consumes. Implementations are driven
/// only from the channel's owning executor.
#[allow(unused_variables)]
pub trait Transport: Send + 'static {
    /// Binds a local address.
    fn bind(&mut self, addr: SocketAddr) -> Result<(), Cause>;

    /// Connects to a remote peer.
    fn connect(&mut self, remote: SocketAddr) -> Result<(), Cause>;

    /// Hands one flushed message to the wire.
    fn write(&mut self, msg: Msg) -> Result<(), Cause>;

    /// Drains anything the transport itself buffers.
    fn flush(&mut self) -> Result<(), Cause> {
        Ok(())
    }

    /// Requests a read from the wire.
    fn begin_read(&mut self) -> Result<(), Cause> {
        Ok(())
    }

    /// Tears the transport down.
    fn close(&mut self) -> Result<(), Cause>;

    /// Local address, once bound.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Peer address, once connected.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

pub(crate) struct ChannelCore {
    id: ChannelId,
    state: AtomicU8,
    executor: OnceLock<Arc<dyn Executor>>,
    pipeline: OnceLock<Pipeline>,
    outbound: Mutex<OutboundBuffer>,
    transport: Mutex<Box<dyn Transport>>,
    config: ChannelConfig,
    attrs: AttrMap,
    close_promise: Promise<()>,
    /// Installed by embedded channels: messages reaching the tail land here
    /// instead of being discarded.
    inbound_sink: OnceLock<Arc<Mutex<VecDeque<Msg>>>>,
}

impl ChannelCore {
    pub(crate) fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn executor(&self) -> Option<Arc<dyn Executor>> {
        self.executor.get().cloned()
    }

    pub(crate) fn allocator(&self) -> Arc<dyn BufAllocator> {
        Arc::clone(&self.config.allocator)
    }

    pub(crate) fn pipeline(&self) -> Pipeline {
        self.pipeline.get().expect("pipeline installed at construction").clone()
    }

    fn outbound_lock(&self) -> MutexGuard<'_, OutboundBuffer> {
        self.outbound
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn transport_lock(&self) -> MutexGuard<'_, Box<dyn Transport>> {
        self.transport
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn sink_or_discard(&self, msg: Msg) {
        match self.inbound_sink.get() {
            Some(sink) => sink
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push_back(msg),
            None => {
                tracing::debug!(channel = %self.id, "message reached the tail unconsumed");
                release_msg(msg);
            }
        }
    }

    // ---------------------------------------------------------------------
    // HEAD OPERATIONS (terminal ends of outbound traversal)
    // ---------------------------------------------------------------------

    pub(crate) fn head_write(&self, msg: Msg, promise: Promise<()>) {
        if self.state() >= ChannelState::Closing {
            release_msg(msg);
            let _ = promise.try_failure(Arc::new(ChannelError::Closed));
            return;
        }
        let size = msg
            .downcast_ref::<ByteBuf>()
            .map_or(0, ByteBuf::readable_bytes);
        self.outbound_lock().add(msg, size, promise);
    }

    pub(crate) fn head_flush(&self) {
        self.outbound_lock().mark_all_flushed();
        loop {
            let entry = self.outbound_lock().pop_flushed();
            let Some((msg, promise)) = entry else { break };
            let result = self.transport_lock().write(msg);
            match result {
                Ok(()) => {
                    let _ = promise.try_success(());
                }
                Err(cause) => {
                    let _ = promise.try_failure(cause);
                }
            }
        }
        if let Err(cause) = self.transport_lock().flush() {
            self.pipeline().head_exception_caught(cause);
        }
    }

    pub(crate) fn head_bind(self: &Arc<Self>, addr: SocketAddr, promise: Promise<()>) {
        let result = self.transport_lock().bind(addr);
        match result {
            Ok(()) => {
                let _ = promise.try_success(());
                self.activate();
            }
            Err(cause) => {
                let _ = promise.try_failure(cause);
            }
        }
    }

    pub(crate) fn head_connect(self: &Arc<Self>, remote: SocketAddr, promise: Promise<()>) {
        let result = self.transport_lock().connect(remote);
        match result {
            Ok(()) => {
                let _ = promise.try_success(());
                self.activate();
            }
            Err(cause) => {
                let _ = promise.try_failure(cause);
            }
        }
    }

    pub(crate) fn head_read(&self) {
        if let Err(cause) = self.transport_lock().begin_read() {
            self.pipeline().head_exception_caught(cause);
        }
    }

    pub(crate) fn head_close(self: &Arc<Self>, promise: Promise<()>) {
        let prior = self.state();
        if prior >= ChannelState::Closing {
            // A close is already underway (or done): piggyback on it.
            self.close_promise.add_listener(move |_| {
                let _ = promise.try_success(());
            });
            return;
        }
        self.set_state(ChannelState::Closing);
        let cause: Cause = Arc::new(ChannelError::Closed);
        self.outbound_lock().fail_all(&cause);
        if let Err(error) = self.transport_lock().close() {
            tracing::debug!(channel = %self.id, error = %error, "transport close failed");
        }
        self.set_state(ChannelState::Closed);
        // Inactive fires only on a channel that actually went active.
        if prior == ChannelState::Active {
            self.pipeline().head_channel_inactive();
        }
        let _ = self.close_promise.try_success(());
        let _ = promise.try_success(());
    }

    pub(crate) fn head_deregister(&self, promise: Promise<()>) {
        let _ = promise.try_success(());
    }

    fn activate(self: &Arc<Self>) {
        if self.state() < ChannelState::Active {
            self.set_state(ChannelState::Active);
            self.pipeline().head_channel_active();
        }
    }

    pub(crate) fn outbound_snapshot(&self) -> (Option<u64>, usize) {
        let outbound = self.outbound_lock();
        (outbound.current(), outbound.total_pending_bytes())
    }
}

/// A bidirectional endpoint: pipeline, owning executor, outbound buffer and
/// attributes. Cheap to clone; all clones address the same channel.
///
/// Every mutation runs on the owning executor — operations invoked from a
/// foreign thread are forwarded there, preserving per-submitter order.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl Channel {
    /// Builds an unregistered channel over `transport`.
    pub fn new(config: ChannelConfig, transport: Box<dyn Transport>) -> Self {
        let core = Arc::new(ChannelCore {
            id: ChannelId::next(),
            state: AtomicU8::new(ChannelState::Unregistered as u8),
            executor: OnceLock::new(),
            pipeline: OnceLock::new(),
            outbound: Mutex::new(OutboundBuffer::new()),
            transport: Mutex::new(transport),
            config,
            attrs: AttrMap::new(),
            close_promise: Promise::new(),
            inbound_sink: OnceLock::new(),
        });
        let pipeline = Pipeline::new(&Arc::downgrade(&core));
        core.pipeline
            .set(pipeline)
            .unwrap_or_else(|_| unreachable!("pipeline set once at construction"));
        Self { core }
    }

    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }

    pub(crate) fn install_inbound_sink(&self, sink: Arc<Mutex<VecDeque<Msg>>>) {
        let _ = self.core.inbound_sink.set(sink);
    }

    /// The channel's process-unique id.
    pub fn id(&self) -> ChannelId {
        self.core.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    /// Returns `true` while the channel is open for traffic.
    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Active
    }

    /// The owning executor, once registered.
    pub fn executor(&self) -> Option<Arc<dyn Executor>> {
        self.core.executor()
    }

    /// The handler pipeline.
    pub fn pipeline(&self) -> Pipeline {
        self.core.pipeline()
    }

    /// The channel's attribute map.
    pub fn attrs(&self) -> &AttrMap {
        &self.core.attrs
    }

    /// The channel's buffer allocator.
    pub fn allocator(&self) -> Arc<dyn BufAllocator> {
        self.core.allocator()
    }

    /// Local address, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.transport_lock().local_addr()
    }

    /// Remote address, once connected.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.core.transport_lock().remote_addr()
    }

    /// Completed when the channel closes; shared by every clone.
    pub fn close_promise(&self) -> Promise<()> {
        self.core.close_promise.clone()
    }

    /// First-unflushed-write identity and pending byte count, for progress
    /// observers.
    pub fn outbound_snapshot(&self) -> (Option<u64>, usize) {
        self.core.outbound_snapshot()
    }

    /// A promise bound to the owning executor when registered.
    pub fn new_promise(&self) -> Promise<()> {
        match self.core.executor.get() {
            Some(executor) => Promise::bound(Arc::clone(executor)),
            None => Promise::new(),
        }
    }

    // ---------------------------------------------------------------------
    // LIFECYCLE
    // ---------------------------------------------------------------------

    /// Pins the channel to `executor` and fires `channel_registered`. The
    /// owner is immutable afterwards.
    pub fn register(&self, executor: Arc<dyn Executor>) -> Promise<()> {
        let promise = Promise::bound(Arc::clone(&executor));
        if executor.is_shutting_down() {
            let _ = promise.try_failure(Arc::new(ChannelError::RegistrationRejected));
            return promise;
        }
        if self.core.executor.set(executor).is_err() {
            let _ = promise.try_failure(Arc::new(ChannelError::AlreadyRegistered));
            return promise;
        }
        let channel = self.clone();
        let registered = promise.clone();
        self.run_on_loop(move || {
            channel.core.set_state(ChannelState::Registered);
            channel.core.pipeline().head_channel_registered();
            let _ = registered.try_success(());
        });
        promise
    }

    /// Marks the channel active and fires `channel_active`. Called by
    /// transports once bind/connect establishment finishes out-of-band.
    pub fn mark_active(&self) {
        let channel = self.clone();
        self.run_on_loop(move || channel.core.activate());
    }

    // ---------------------------------------------------------------------
    // OUTBOUND OPERATIONS
    // ---------------------------------------------------------------------

    /// Binds `addr` through the pipeline.
    pub fn bind(&self, addr: SocketAddr) -> Promise<()> {
        let promise = self.new_promise();
        let channel = self.clone();
        let op = promise.clone();
        self.run_on_loop(move || channel.core.pipeline().tail_bind(addr, op));
        promise
    }

    /// Connects to `remote` through the pipeline.
    pub fn connect(&self, remote: SocketAddr) -> Promise<()> {
        let promise = self.new_promise();
        let channel = self.clone();
        let op = promise.clone();
        self.run_on_loop(move || channel.core.pipeline().tail_connect(remote, op));
        promise
    }

    /// Queues `msg` into the outbound buffer through the pipeline.
    pub fn write(&self, msg: Msg) -> Promise<()> {
        let promise = self.new_promise();
        let channel = self.clone();
        let op = promise.clone();
        self.run_on_loop(move || channel.core.pipeline().tail_write(msg, op));
        promise
    }

    /// Requests the transport to drain the outbound buffer.
    pub fn flush(&self) {
        let channel = self.clone();
        self.run_on_loop(move || channel.core.pipeline().tail_flush());
    }

    /// [`write`](Self::write) followed by [`flush`](Self::flush).
    pub fn write_and_flush(&self, msg: Msg) -> Promise<()> {
        let promise = self.new_promise();
        let channel = self.clone();
        let op = promise.clone();
        self.run_on_loop(move || {
            channel.core.pipeline().tail_write(msg, op);
            channel.core.pipeline().tail_flush();
        });
        promise
    }

    /// Requests a transport read.
    pub fn read(&self) {
        let channel = self.clone();
        self.run_on_loop(move || channel.core.pipeline().tail_read());
    }

    /// Closes the channel through the pipeline.
    pub fn close(&self) -> Promise<()> {
        let promise = self.new_promise();
        let channel = self.clone();
        let op = promise.clone();
        self.run_on_loop(move || channel.core.pipeline().tail_close(op));
        promise
    }

    /// Detaches the channel from its executor.
    pub fn deregister(&self) -> Promise<()> {
        let promise = self.new_promise();
        let channel = self.clone();
        let op = promise.clone();
        self.run_on_loop(move || channel.core.pipeline().tail_deregister(op));
        promise
    }

    // ---------------------------------------------------------------------
    // TRANSPORT-FACING EVENT ENTRY POINTS
    // ---------------------------------------------------------------------

    /// Delivers a message into the pipeline on the owning executor.
    /// Messages arriving after close are released, not delivered.
    pub fn fire_channel_read(&self, msg: Msg) {
        let channel = self.clone();
        self.run_on_loop(move || {
            if channel.core.state() >= ChannelState::Closing {
                release_msg(msg);
                return;
            }
            channel.core.pipeline().head_channel_read(msg);
        });
    }

    /// Signals the end of a read burst.
    pub fn fire_channel_read_complete(&self) {
        let channel = self.clone();
        self.run_on_loop(move || {
            if channel.core.state() >= ChannelState::Closing {
                return;
            }
            channel.core.pipeline().head_channel_read_complete();
        });
    }

    /// Delivers a user event into the pipeline.
    pub fn fire_user_event(&self, event: Event) {
        let channel = self.clone();
        self.run_on_loop(move || {
            if channel.core.state() >= ChannelState::Closing {
                return;
            }
            channel.core.pipeline().head_user_event(event);
        });
    }

    /// Delivers an error into the pipeline.
    pub fn fire_exception_caught(&self, cause: Cause) {
        let channel = self.clone();
        self.run_on_loop(move || channel.core.pipeline().head_exception_caught(cause));
    }

    /// Signals a writability boundary crossing.
    pub fn fire_channel_writability_changed(&self) {
        let channel = self.clone();
        self.run_on_loop(move || channel.core.pipeline().head_channel_writability_changed());
    }

    /// Runs `f` on the owning executor, inline when already there (or when
    /// the channel is not yet registered).
    fn run_on_loop<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.core.executor.get() {
            Some(executor) if !executor.in_event_loop() => {
                if executor.execute(Box::new(f)).is_err() {
                    tracing::debug!(channel = %self.core.id, "executor rejected channel task");
                }
            }
            _ => f(),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .finish()
    }
}
