use crate::channel::{Channel, ChannelCore};
use crate::handler::{release_msg, Event, Handler, HandlerCaps, Msg};
use crate::ChannelError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use strand_core::{Cause, Executor, Promise};

// =============================================================================
// TRAVERSAL & MUTATION PROTOCOL
// =============================================================================
//
// The pipeline is a doubly-linked list of contexts between two permanent
// sentinels. Inbound events walk head -> tail visiting inbound-capable
// contexts; outbound operations walk tail -> head visiting outbound-capable
// ones.
//
// - `next` links are strong (`Arc`), `prev` links weak: every context is kept
//   alive by the chain from head, and backward hops upgrade through nodes the
//   forward chain already anchors.
// - Add/remove requested off-loop only reserves or releases the NAME in the
//   registry synchronously (so duplicate/unknown errors report to the
//   caller); the splice/unlink of the links themselves, and the
//   handler_added/handler_removed callback, run as one task on the owning
//   executor. Events already queued there dispatch through the old chain,
//   and a handler sees handler_added before its first event.
// - On the loop, link mutation happens under the registry lock, one pointer
//   swap at a time; link reads take the per-context lock only for the hop.
// - A removed context keeps its links: events already past it continue to
//   forward, while new traversals skip it via the `removed` flag.
//
// =============================================================================

struct Links {
    prev: Weak<Ctx>,
    next: Option<Arc<Ctx>>,
}

/// A handler's binding into a pipeline: its name, neighbours and channel.
pub struct Ctx {
    name: Arc<str>,
    handler: Box<dyn Handler>,
    caps: HandlerCaps,
    links: Mutex<Links>,
    removed: AtomicBool,
    channel: Weak<ChannelCore>,
}

impl Ctx {
    fn new(name: &str, handler: Box<dyn Handler>, channel: Weak<ChannelCore>) -> Arc<Self> {
        let caps = handler.capabilities();
        Arc::new(Self {
            name: Arc::from(name),
            handler,
            caps,
            links: Mutex::new(Links {
                prev: Weak::new(),
                next: None,
            }),
            removed: AtomicBool::new(false),
            channel,
        })
    }

    /// The handler's unique name within its pipeline.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` once the context was unlinked from its pipeline.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// The channel this context belongs to, while it is alive.
    pub fn channel(&self) -> Option<Channel> {
        self.channel.upgrade().map(Channel::from_core)
    }

    /// The channel's owning executor, once registered.
    pub fn executor(&self) -> Option<Arc<dyn Executor>> {
        self.channel.upgrade().and_then(|core| core.executor())
    }

    /// The channel's buffer allocator.
    pub fn allocator(&self) -> Option<Arc<dyn strand_buf::BufAllocator>> {
        self.channel.upgrade().map(|core| core.allocator())
    }

    fn lock_links(&self) -> MutexGuard<'_, Links> {
        self.links
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next_ctx(&self) -> Option<Arc<Ctx>> {
        self.lock_links().next.clone()
    }

    fn prev_ctx(&self) -> Option<Arc<Ctx>> {
        self.lock_links().prev.upgrade()
    }

    fn next_inbound(&self) -> Option<Arc<Ctx>> {
        let mut cur = self.next_ctx();
        while let Some(ctx) = cur {
            if !ctx.is_removed() && ctx.caps.contains(HandlerCaps::INBOUND) {
                return Some(ctx);
            }
            cur = ctx.next_ctx();
        }
        None
    }

    fn prev_outbound(&self) -> Option<Arc<Ctx>> {
        let mut cur = self.prev_ctx();
        while let Some(ctx) = cur {
            if !ctx.is_removed() && ctx.caps.contains(HandlerCaps::OUTBOUND) {
                return Some(ctx);
            }
            cur = ctx.prev_ctx();
        }
        None
    }

    // ---------------------------------------------------------------------
    // INBOUND FORWARDING
    // ---------------------------------------------------------------------

    /// Forwards `channel_registered` to the next inbound handler.
    pub fn fire_channel_registered(&self) {
        if let Some(next) = self.next_inbound() {
            next.invoke_channel_registered();
        }
    }

    /// Forwards `channel_active` to the next inbound handler.
    pub fn fire_channel_active(&self) {
        if let Some(next) = self.next_inbound() {
            next.invoke_channel_active();
        }
    }

    /// Forwards `channel_inactive` to the next inbound handler.
    pub fn fire_channel_inactive(&self) {
        if let Some(next) = self.next_inbound() {
            next.invoke_channel_inactive();
        }
    }

    /// Forwards a message to the next inbound handler; with no consumer left
    /// the message is released.
    pub fn fire_channel_read(&self, msg: Msg) {
        match self.next_inbound() {
            Some(next) => next.invoke_channel_read(msg),
            None => release_msg(msg),
        }
    }

    /// Forwards `channel_read_complete` to the next inbound handler.
    pub fn fire_channel_read_complete(&self) {
        if let Some(next) = self.next_inbound() {
            next.invoke_channel_read_complete();
        }
    }

    /// Forwards `channel_writability_changed` to the next inbound handler.
    pub fn fire_channel_writability_changed(&self) {
        if let Some(next) = self.next_inbound() {
            next.invoke_channel_writability_changed();
        }
    }

    /// Forwards a user event to the next inbound handler.
    pub fn fire_user_event(&self, event: Event) {
        if let Some(next) = self.next_inbound() {
            next.invoke_user_event(event);
        }
    }

    /// Forwards an error to the next inbound handler.
    pub fn fire_exception_caught(&self, cause: Cause) {
        if let Some(next) = self.next_inbound() {
            next.invoke_exception_caught(cause);
        }
    }

    // ---------------------------------------------------------------------
    // OUTBOUND FORWARDING
    // ---------------------------------------------------------------------

    /// Sends a bind request toward the transport.
    pub fn bind(&self, addr: SocketAddr, promise: Promise<()>) {
        if let Some(prev) = self.prev_outbound() {
            prev.invoke_bind(addr, promise);
        }
    }

    /// Sends a connect request toward the transport.
    pub fn connect(&self, remote: SocketAddr, promise: Promise<()>) {
        if let Some(prev) = self.prev_outbound() {
            prev.invoke_connect(remote, promise);
        }
    }

    /// Sends a write toward the outbound buffer at the head.
    pub fn write(&self, msg: Msg, promise: Promise<()>) {
        match self.prev_outbound() {
            Some(prev) => prev.invoke_write(msg, promise),
            None => {
                release_msg(msg);
                let _ = promise.try_failure(Arc::new(ChannelError::NotRegistered));
            }
        }
    }

    /// Sends a flush request toward the transport.
    pub fn flush(&self) {
        if let Some(prev) = self.prev_outbound() {
            prev.invoke_flush();
        }
    }

    /// Sends a read request toward the transport.
    pub fn read(&self) {
        if let Some(prev) = self.prev_outbound() {
            prev.invoke_read();
        }
    }

    /// Sends a close request toward the transport.
    pub fn close(&self, promise: Promise<()>) {
        if let Some(prev) = self.prev_outbound() {
            prev.invoke_close(promise);
        }
    }

    /// Sends a deregister request toward the transport.
    pub fn deregister(&self, promise: Promise<()>) {
        if let Some(prev) = self.prev_outbound() {
            prev.invoke_deregister(promise);
        }
    }

    /// Removes this handler from its pipeline.
    pub fn remove_self(&self) -> Result<(), ChannelError> {
        let core = self.channel.upgrade().ok_or(ChannelError::Closed)?;
        core.pipeline().remove(&self.name)
    }

    // ---------------------------------------------------------------------
    // INVOCATION (errors become exception_caught / failed promises)
    // ---------------------------------------------------------------------

    fn invoke_channel_registered(self: &Arc<Self>) {
        if let Err(cause) = self.handler.channel_registered(self) {
            self.invoke_exception_caught(cause);
        }
    }

    fn invoke_channel_active(self: &Arc<Self>) {
        if let Err(cause) = self.handler.channel_active(self) {
            self.invoke_exception_caught(cause);
        }
    }

    fn invoke_channel_inactive(self: &Arc<Self>) {
        if let Err(cause) = self.handler.channel_inactive(self) {
            self.invoke_exception_caught(cause);
        }
    }

    pub(crate) fn invoke_channel_read(self: &Arc<Self>, msg: Msg) {
        if let Err(cause) = self.handler.channel_read(self, msg) {
            self.invoke_exception_caught(cause);
        }
    }

    fn invoke_channel_read_complete(self: &Arc<Self>) {
        if let Err(cause) = self.handler.channel_read_complete(self) {
            self.invoke_exception_caught(cause);
        }
    }

    fn invoke_channel_writability_changed(self: &Arc<Self>) {
        if let Err(cause) = self.handler.channel_writability_changed(self) {
            self.invoke_exception_caught(cause);
        }
    }

    fn invoke_user_event(self: &Arc<Self>, event: Event) {
        if let Err(cause) = self.handler.user_event(self, event) {
            self.invoke_exception_caught(cause);
        }
    }

    pub(crate) fn invoke_exception_caught(self: &Arc<Self>, cause: Cause) {
        if let Err(error) = self.handler.exception_caught(self, cause) {
            tracing::warn!(
                handler = %self.name,
                error = %error,
                "exception handler failed; error dropped"
            );
        }
    }

    fn invoke_bind(self: &Arc<Self>, addr: SocketAddr, promise: Promise<()>) {
        let failable = promise.clone();
        if let Err(cause) = self.handler.bind(self, addr, promise) {
            let _ = failable.try_failure(cause);
        }
    }

    fn invoke_connect(self: &Arc<Self>, remote: SocketAddr, promise: Promise<()>) {
        let failable = promise.clone();
        if let Err(cause) = self.handler.connect(self, remote, promise) {
            let _ = failable.try_failure(cause);
        }
    }

    pub(crate) fn invoke_write(self: &Arc<Self>, msg: Msg, promise: Promise<()>) {
        let failable = promise.clone();
        if let Err(cause) = self.handler.write(self, msg, promise) {
            let _ = failable.try_failure(cause);
        }
    }

    pub(crate) fn invoke_flush(self: &Arc<Self>) {
        if let Err(cause) = self.handler.flush(self) {
            self.invoke_exception_caught(cause);
        }
    }

    fn invoke_read(self: &Arc<Self>) {
        if let Err(cause) = self.handler.read(self) {
            self.invoke_exception_caught(cause);
        }
    }

    pub(crate) fn invoke_close(self: &Arc<Self>, promise: Promise<()>) {
        let failable = promise.clone();
        if let Err(cause) = self.handler.close(self, promise) {
            let _ = failable.try_failure(cause);
        }
    }

    fn invoke_deregister(self: &Arc<Self>, promise: Promise<()>) {
        let failable = promise.clone();
        if let Err(cause) = self.handler.deregister(self, promise) {
            let _ = failable.try_failure(cause);
        }
    }

    fn invoke_handler_added(self: &Arc<Self>) {
        if let Err(cause) = self.handler.handler_added(self) {
            self.invoke_exception_caught(cause);
        }
    }

    fn invoke_handler_removed(self: &Arc<Self>) {
        if let Err(cause) = self.handler.handler_removed(self) {
            tracing::warn!(handler = %self.name, error = %cause, "handler_removed failed");
        }
    }
}

impl std::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx")
            .field("name", &self.name)
            .field("removed", &self.is_removed())
            .finish()
    }
}

// =============================================================================
// SENTINELS
// =============================================================================

/// Head sentinel: terminates outbound traversal by driving the channel's
/// outbound buffer and transport. Inbound events pass through untouched.
struct HeadHandler;

impl Handler for HeadHandler {
    fn bind(&self, ctx: &Ctx, addr: SocketAddr, promise: Promise<()>) -> Result<(), Cause> {
        if let Some(core) = ctx.channel.upgrade() {
            core.head_bind(addr, promise);
        }
        Ok(())
    }

    fn connect(&self, ctx: &Ctx, remote: SocketAddr, promise: Promise<()>) -> Result<(), Cause> {
        if let Some(core) = ctx.channel.upgrade() {
            core.head_connect(remote, promise);
        }
        Ok(())
    }

    fn write(&self, ctx: &Ctx, msg: Msg, promise: Promise<()>) -> Result<(), Cause> {
        match ctx.channel.upgrade() {
            Some(core) => core.head_write(msg, promise),
            None => release_msg(msg),
        }
        Ok(())
    }

    fn flush(&self, ctx: &Ctx) -> Result<(), Cause> {
        if let Some(core) = ctx.channel.upgrade() {
            core.head_flush();
        }
        Ok(())
    }

    fn read(&self, ctx: &Ctx) -> Result<(), Cause> {
        if let Some(core) = ctx.channel.upgrade() {
            core.head_read();
        }
        Ok(())
    }

    fn close(&self, ctx: &Ctx, promise: Promise<()>) -> Result<(), Cause> {
        if let Some(core) = ctx.channel.upgrade() {
            core.head_close(promise);
        }
        Ok(())
    }

    fn deregister(&self, ctx: &Ctx, promise: Promise<()>) -> Result<(), Cause> {
        if let Some(core) = ctx.channel.upgrade() {
            core.head_deregister(promise);
        }
        Ok(())
    }
}

/// Tail sentinel: terminates inbound traversal. Unconsumed messages go to
/// the channel's inbound sink when one is installed (embedded channels),
/// otherwise they are logged and released.
struct TailHandler;

impl Handler for TailHandler {
    fn capabilities(&self) -> HandlerCaps {
        HandlerCaps::INBOUND
    }

    fn channel_read(&self, ctx: &Ctx, msg: Msg) -> Result<(), Cause> {
        match ctx.channel.upgrade() {
            Some(core) => core.sink_or_discard(msg),
            None => release_msg(msg),
        }
        Ok(())
    }

    fn user_event(&self, _ctx: &Ctx, event: Event) -> Result<(), Cause> {
        drop(event);
        Ok(())
    }

    fn exception_caught(&self, _ctx: &Ctx, cause: Cause) -> Result<(), Cause> {
        tracing::warn!(error = %cause, "unhandled exception reached the pipeline tail");
        Ok(())
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

pub(crate) struct PipelineInner {
    head: Arc<Ctx>,
    tail: Arc<Ctx>,
    registry: Mutex<HashMap<String, Arc<Ctx>>>,
    channel: Weak<ChannelCore>,
}

impl PipelineInner {
    fn registry_lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Ctx>>> {
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Ordered chain of handler contexts attached to one channel.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub(crate) fn new(channel: &Weak<ChannelCore>) -> Self {
        let head = Ctx::new("head", Box::new(HeadHandler), channel.clone());
        let tail = Ctx::new("tail", Box::new(TailHandler), channel.clone());
        head.lock_links().next = Some(Arc::clone(&tail));
        tail.lock_links().prev = Arc::downgrade(&head);
        Self {
            inner: Arc::new(PipelineInner {
                head,
                tail,
                registry: Mutex::new(HashMap::new()),
                channel: channel.clone(),
            }),
        }
    }

    fn registry_lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Ctx>>> {
        self.inner.registry_lock()
    }

    /// Reserves `name` and builds its context. The list splice itself runs
    /// on the owning executor so it stays atomic w.r.t. event traversal.
    fn register_name(
        &self,
        name: &str,
        handler: Box<dyn Handler>,
    ) -> Result<Arc<Ctx>, ChannelError> {
        let mut registry = self.registry_lock();
        if registry.contains_key(name) {
            return Err(ChannelError::DuplicateHandler {
                name: name.to_string(),
            });
        }
        let ctx = Ctx::new(name, handler, self.inner.channel.clone());
        registry.insert(name.to_string(), Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Appends a handler just before the tail sentinel.
    pub fn add_last(&self, name: &str, handler: Box<dyn Handler>) -> Result<(), ChannelError> {
        let ctx = self.register_name(name, handler)?;
        let inner = Arc::clone(&self.inner);
        self.on_loop(move || {
            {
                let _registry = inner.registry_lock();
                let prev = inner
                    .tail
                    .prev_ctx()
                    .unwrap_or_else(|| Arc::clone(&inner.head));
                link_between(&prev, &inner.tail, &ctx);
            }
            ctx.invoke_handler_added();
        });
        Ok(())
    }

    /// Prepends a handler just after the head sentinel.
    pub fn add_first(&self, name: &str, handler: Box<dyn Handler>) -> Result<(), ChannelError> {
        let ctx = self.register_name(name, handler)?;
        let inner = Arc::clone(&self.inner);
        self.on_loop(move || {
            {
                let _registry = inner.registry_lock();
                let next = inner
                    .head
                    .next_ctx()
                    .unwrap_or_else(|| Arc::clone(&inner.tail));
                link_between(&inner.head, &next, &ctx);
            }
            ctx.invoke_handler_added();
        });
        Ok(())
    }

    /// Inserts a handler immediately before `existing`.
    pub fn add_before(
        &self,
        existing: &str,
        name: &str,
        handler: Box<dyn Handler>,
    ) -> Result<(), ChannelError> {
        let anchor = self
            .ctx(existing)
            .ok_or_else(|| ChannelError::UnknownHandler {
                name: existing.to_string(),
            })?;
        let ctx = self.register_name(name, handler)?;
        let inner = Arc::clone(&self.inner);
        self.on_loop(move || {
            {
                let _registry = inner.registry_lock();
                let prev = anchor.prev_ctx().unwrap_or_else(|| Arc::clone(&inner.head));
                link_between(&prev, &anchor, &ctx);
            }
            ctx.invoke_handler_added();
        });
        Ok(())
    }

    /// Inserts a handler immediately after `existing`.
    pub fn add_after(
        &self,
        existing: &str,
        name: &str,
        handler: Box<dyn Handler>,
    ) -> Result<(), ChannelError> {
        let anchor = self
            .ctx(existing)
            .ok_or_else(|| ChannelError::UnknownHandler {
                name: existing.to_string(),
            })?;
        let ctx = self.register_name(name, handler)?;
        let inner = Arc::clone(&self.inner);
        self.on_loop(move || {
            {
                let _registry = inner.registry_lock();
                let next = anchor.next_ctx().unwrap_or_else(|| Arc::clone(&inner.tail));
                link_between(&anchor, &next, &ctx);
            }
            ctx.invoke_handler_added();
        });
        Ok(())
    }

    /// Unregisters the named handler. The unlink runs on the owning
    /// executor, after every event already queued there: the handler sees
    /// those events and then `handler_removed`.
    pub fn remove(&self, name: &str) -> Result<(), ChannelError> {
        let ctx = {
            let mut registry = self.registry_lock();
            registry
                .remove(name)
                .ok_or_else(|| ChannelError::UnknownHandler {
                    name: name.to_string(),
                })?
        };
        let inner = Arc::clone(&self.inner);
        self.on_loop(move || {
            {
                let _registry = inner.registry_lock();
                let prev = ctx.prev_ctx();
                let next = ctx.next_ctx();
                if let (Some(prev), Some(next)) = (prev, next) {
                    prev.lock_links().next = Some(Arc::clone(&next));
                    next.lock_links().prev = Arc::downgrade(&prev);
                }
                ctx.removed.store(true, Ordering::Release);
            }
            ctx.invoke_handler_removed();
        });
        Ok(())
    }

    /// The context registered under `name`.
    pub fn ctx(&self, name: &str) -> Option<Arc<Ctx>> {
        self.registry_lock().get(name).cloned()
    }

    /// Returns `true` when a handler is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.registry_lock().contains_key(name)
    }

    /// User handler names in head-to-tail order (sentinels excluded).
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut cur = self.inner.head.next_ctx();
        while let Some(ctx) = cur {
            if !Arc::ptr_eq(&ctx, &self.inner.tail) && !ctx.is_removed() {
                names.push(ctx.name().to_string());
            }
            cur = ctx.next_ctx();
        }
        names
    }

    // Entry points used by the channel: events enter at the head sentinel,
    // operations enter at the tail sentinel.

    pub(crate) fn head_channel_registered(&self) {
        self.inner.head.invoke_channel_registered();
    }

    pub(crate) fn head_channel_active(&self) {
        self.inner.head.invoke_channel_active();
    }

    pub(crate) fn head_channel_inactive(&self) {
        self.inner.head.invoke_channel_inactive();
    }

    pub(crate) fn head_channel_read(&self, msg: Msg) {
        self.inner.head.invoke_channel_read(msg);
    }

    pub(crate) fn head_channel_read_complete(&self) {
        self.inner.head.invoke_channel_read_complete();
    }

    pub(crate) fn head_channel_writability_changed(&self) {
        self.inner.head.invoke_channel_writability_changed();
    }

    pub(crate) fn head_user_event(&self, event: Event) {
        self.inner.head.invoke_user_event(event);
    }

    pub(crate) fn head_exception_caught(&self, cause: Cause) {
        self.inner.head.invoke_exception_caught(cause);
    }

    pub(crate) fn tail_write(&self, msg: Msg, promise: Promise<()>) {
        self.inner.tail.write(msg, promise);
    }

    pub(crate) fn tail_flush(&self) {
        self.inner.tail.flush();
    }

    pub(crate) fn tail_bind(&self, addr: SocketAddr, promise: Promise<()>) {
        self.inner.tail.bind(addr, promise);
    }

    pub(crate) fn tail_connect(&self, remote: SocketAddr, promise: Promise<()>) {
        self.inner.tail.connect(remote, promise);
    }

    pub(crate) fn tail_read(&self) {
        self.inner.tail.read();
    }

    pub(crate) fn tail_close(&self, promise: Promise<()>) {
        self.inner.tail.close(promise);
    }

    pub(crate) fn tail_deregister(&self, promise: Promise<()>) {
        self.inner.tail.deregister(promise);
    }

    /// Runs `f` on the channel's executor, inline when already there or
    /// when the channel is not yet registered.
    fn on_loop<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let executor = self.inner.channel.upgrade().and_then(|core| core.executor());
        match executor {
            Some(exec) if !exec.in_event_loop() => {
                if exec.execute(Box::new(f)).is_err() {
                    tracing::debug!("executor rejected pipeline mutation task");
                }
            }
            _ => f(),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.names())
            .finish()
    }
}

/// Splices `ctx` between two live neighbours. Caller holds the registry lock.
fn link_between(prev: &Arc<Ctx>, next: &Arc<Ctx>, ctx: &Arc<Ctx>) {
    {
        let mut links = ctx.lock_links();
        links.prev = Arc::downgrade(prev);
        links.next = Some(Arc::clone(next));
    }
    prev.lock_links().next = Some(Arc::clone(ctx));
    next.lock_links().prev = Arc::downgrade(ctx);
}
