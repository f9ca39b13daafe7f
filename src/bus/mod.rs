//! In-process dispatch engine.
//!
//! This module contains:
//! - `Bus`: handler registry, matching, concurrent fan-out
//! - `EventHandler` trait and `handler_fn` closure adapter
//! - `EventMatcher` trait with exact and hierarchical strategies
//!
//! A bus may carry one transport. Locally emitted messages are always handed
//! to the transport for outward delivery; messages arriving from the transport
//! are dispatched to local handlers only, so they are never echoed back out.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::id::{IdGenerator, UuidGenerator};
use crate::message::Message;
use crate::transport::{is_reserved_event, MessageTransport, TransportError};

pub mod dispatch;
pub mod handler;
pub mod matcher;

pub use dispatch::{Completion, DispatchReport};
pub use handler::{handler_fn, EventHandler, HandlerError, HandlerFn, HandlerFuture};
pub use matcher::{EventMatcher, ExactMatcher, HierarchicalMatcher, MATCH_ALL};

/// Reserved pattern of the handler that forwards local messages to the
/// transport. Never accepted from subscribers and never put on the wire.
pub const TRANSPORT_FORWARD_PATTERN: &str = "$peerbus.transport";

/// Default capacity of the channel carrying inbound transport messages.
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Pattern '{0}' is reserved")]
    ReservedPattern(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Where an emitted message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Transport,
}

struct Registered {
    pattern: String,
    handler: Arc<dyn EventHandler>,
}

struct BusInner {
    handlers: RwLock<HashMap<String, Registered>>,
    matcher: Arc<dyn EventMatcher>,
    transport: Option<Arc<dyn MessageTransport>>,
    ids: Arc<dyn IdGenerator>,
}

impl BusInner {
    fn register(&self, pattern: String, handler: Arc<dyn EventHandler>) -> String {
        let id = self.ids.next_id();
        let count = {
            let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
            handlers.insert(id.clone(), Registered { pattern, handler });
            handlers.len()
        };
        debug!(handler_id = %id, handler_count = count, "Handler registered");
        id
    }

    fn remove(&self, id: &str) {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed.is_some() {
            debug!(handler_id = %id, "Handler removed");
        }
    }

    /// Collect matching handlers under the read lock, then release it before
    /// any handler runs.
    fn matching(&self, event: &str, origin: Origin) -> Vec<Arc<dyn EventHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers
            .values()
            .filter(|h| {
                if h.pattern == TRANSPORT_FORWARD_PATTERN {
                    origin == Origin::Local
                } else {
                    self.matcher.matches(&h.pattern, event)
                }
            })
            .map(|h| Arc::clone(&h.handler))
            .collect()
    }

    fn emit(&self, msg: Message, origin: Origin) -> Completion {
        // Mesh control events may arrive from the transport but never
        // originate locally.
        let refused = match origin {
            Origin::Local => is_reserved_event(&msg.event),
            Origin::Transport => msg.event == TRANSPORT_FORWARD_PATTERN,
        };
        if refused {
            warn!(event = %msg.event, "Refusing to emit reserved event name");
            return Completion::ready();
        }

        let targets = self.matching(&msg.event, origin);
        debug!(
            event = %msg.event,
            handlers = targets.len(),
            from_transport = origin == Origin::Transport,
            "Dispatching message"
        );

        dispatch::fan_out(targets, Arc::new(msg))
    }
}

/// Handler that pushes every locally emitted message to the transport.
struct ForwardToTransport {
    transport: Arc<dyn MessageTransport>,
}

impl EventHandler for ForwardToTransport {
    fn handle(&self, msg: Arc<Message>) -> HandlerFuture {
        let transport = Arc::clone(&self.transport);
        Box::pin(async move {
            let msg = Arc::try_unwrap(msg).unwrap_or_else(|shared| (*shared).clone());
            transport.push(msg).await;
            Ok(())
        })
    }
}

/// Handle to a live subscription.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::off`].
#[derive(Debug, Clone)]
pub struct Subscription {
    id: String,
    pattern: String,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Unique id of this subscription within its bus.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pattern this subscription was registered with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Remove the handler from the bus. Calling it again is a no-op.
    pub fn off(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInner")
            .field("has_transport", &self.transport.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Bus`].
pub struct BusBuilder {
    matcher: Arc<dyn EventMatcher>,
    transport: Option<Arc<dyn MessageTransport>>,
    ids: Arc<dyn IdGenerator>,
    inbound_capacity: usize,
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self {
            matcher: Arc::new(ExactMatcher),
            transport: None,
            ids: Arc::new(UuidGenerator),
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

impl BusBuilder {
    /// Replace the matching strategy.
    pub fn matcher(mut self, matcher: impl EventMatcher + 'static) -> Self {
        self.matcher = Arc::new(matcher);
        self
    }

    /// Attach a transport.
    pub fn transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the handler id generator.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Capacity of the inbound transport channel.
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }

    /// Build the bus.
    ///
    /// With a transport attached this spawns the inbound drain task, so it
    /// must be called from within a Tokio runtime.
    pub fn build(self) -> Bus {
        let inner = Arc::new(BusInner {
            handlers: RwLock::new(HashMap::new()),
            matcher: self.matcher,
            transport: self.transport.clone(),
            ids: self.ids,
        });

        if let Some(transport) = self.transport {
            let (tx, rx) = mpsc::channel(self.inbound_capacity);
            transport.subscribe(tx);
            tokio::spawn(drain_inbound(Arc::downgrade(&inner), rx));

            inner.register(
                TRANSPORT_FORWARD_PATTERN.to_string(),
                Arc::new(ForwardToTransport { transport }),
            );
            info!("Bus attached to transport");
        }

        Bus { inner }
    }
}

/// Redeliver inbound transport messages locally for as long as the bus lives.
async fn drain_inbound(bus: Weak<BusInner>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let Some(inner) = bus.upgrade() else {
            break;
        };
        // Completion not awaited; inbound dispatch is fire-and-forget.
        drop(inner.emit(msg, Origin::Transport));
    }
    debug!("Inbound transport drain stopped");
}

/// In-process event bus.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Debug)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// Bus with exact matching and no transport.
    pub fn new() -> Self {
        BusBuilder::default().build()
    }

    pub fn builder() -> BusBuilder {
        BusBuilder::default()
    }

    /// Register a handler for a pattern.
    pub fn on(
        &self,
        pattern: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> Result<Subscription> {
        let pattern = pattern.into();
        if pattern == TRANSPORT_FORWARD_PATTERN {
            return Err(BusError::ReservedPattern(pattern));
        }

        let id = self.inner.register(pattern.clone(), Arc::new(handler));
        Ok(Subscription {
            id,
            pattern,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Register an async closure for a pattern.
    pub fn on_fn<F, Fut>(&self, pattern: impl Into<String>, f: F) -> Result<Subscription>
    where
        F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.on(pattern, handler_fn(f))
    }

    /// Dispatch a message to every matching handler and to the transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn emit(&self, msg: Message) -> Completion {
        self.inner.emit(msg, Origin::Local)
    }

    /// Number of registered subscriptions, excluding the transport forwarder.
    pub fn handler_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|h| h.pattern != TRANSPORT_FORWARD_PATTERN)
            .count()
    }

    /// Returns true if a transport is attached.
    pub fn has_transport(&self) -> bool {
        self.inner.transport.is_some()
    }

    /// Shut down the attached transport, if any.
    pub async fn close(&self) -> Result<()> {
        match &self.inner.transport {
            Some(transport) => {
                transport.close().await?;
                info!("Bus transport closed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests;
