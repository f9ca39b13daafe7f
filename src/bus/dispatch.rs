//! Concurrent fan-out of a message to its matching handlers.
//!
//! Every invocation runs in its own task. A handler that returns an error or
//! panics is logged and counted complete; siblings and the emitter are
//! unaffected.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::error;

use super::handler::EventHandler;
use crate::message::Message;

/// Outcome of a single emit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers invoked, including the transport forwarder.
    pub invoked: usize,
    /// Invocations that returned an error or panicked.
    pub failed: usize,
}

impl DispatchReport {
    /// Returns true if every invocation succeeded.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Completion signal returned by `Bus::emit`.
///
/// Resolves once every invocation triggered by the emit has returned or
/// failed. Dropping it without awaiting is supported: the producer side
/// never blocks.
#[must_use = "await the completion to wait for handlers, or drop it to fire and forget"]
pub struct Completion {
    rx: oneshot::Receiver<DispatchReport>,
    invoked: usize,
}

impl Completion {
    /// A completion that has already fired.
    pub(crate) fn ready() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(DispatchReport::default());
        Self { rx, invoked: 0 }
    }
}

impl Future for Completion {
    type Output = DispatchReport;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let invoked = self.invoked;
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            // Sender dropped means the runtime shut down under us; no
            // invocation can be shown to have finished.
            result.unwrap_or(DispatchReport {
                invoked,
                failed: invoked,
            })
        })
    }
}

/// Spawn one task per handler and a collector that fires the completion.
pub(crate) fn fan_out(handlers: Vec<Arc<dyn EventHandler>>, msg: Arc<Message>) -> Completion {
    let (tx, rx) = oneshot::channel();
    let invoked = handlers.len();

    let invocations: Vec<_> = handlers
        .into_iter()
        .map(|handler| {
            let msg = Arc::clone(&msg);
            tokio::spawn(async move { handler.handle(msg).await })
        })
        .collect();

    tokio::spawn(async move {
        let mut report = DispatchReport {
            invoked,
            failed: 0,
        };

        for outcome in join_all(invocations).await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    error!(event = %msg.event, error = %e, "Handler failed");
                }
                Err(e) if e.is_panic() => {
                    report.failed += 1;
                    let detail = panic_detail(e.into_panic());
                    error!(event = %msg.event, error = %detail, "Handler panicked");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(event = %msg.event, error = %e, "Handler task cancelled");
                }
            }
        }

        // Receiver may be gone; fire-and-forget callers drop it.
        let _ = tx.send(report);
    });

    Completion { rx, invoked }
}

fn panic_detail(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
