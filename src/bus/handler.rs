//! Event handler trait and closure adapter.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::message::Message;

/// Future returned by a handler invocation.
pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

/// Failure reported by a handler.
///
/// Failures never reach the emitter; the bus logs them and counts the
/// invocation as complete.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Callback invoked once per matching message.
pub trait EventHandler: Send + Sync {
    /// Process a message.
    ///
    /// The message is shared between every handler it was dispatched to.
    fn handle(&self, msg: Arc<Message>) -> HandlerFuture;
}

/// Adapter implementing [`EventHandler`] for an async closure.
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as an [`EventHandler`].
///
/// ```ignore
/// bus.on("ping", handler_fn(|msg| async move {
///     println!("ping from {:?}", msg.data);
///     Ok(())
/// }))?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn { f }
}

impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, msg: Arc<Message>) -> HandlerFuture {
        Box::pin((self.f)(msg))
    }
}
