//! Mock transport implementation for testing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{MessageTransport, TransportError};
use crate::message::Message;

/// In-memory transport that records pushed messages and lets tests inject
/// inbound ones.
#[derive(Default)]
pub struct MockTransport {
    pushed: Mutex<Vec<Message>>,
    inbound: Mutex<Option<mpsc::Sender<Message>>>,
    close_calls: AtomicUsize,
    fail_on_close: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_close(&self, fail: bool) {
        self.fail_on_close.store(fail, Ordering::SeqCst);
    }

    pub fn pushed_count(&self) -> usize {
        self.pushed.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn take_pushed(&self) -> Vec<Message> {
        std::mem::take(&mut *self.pushed.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Deliver a message as if it arrived from a peer.
    ///
    /// Returns false if nothing is subscribed or the receiver is gone.
    pub async fn inject(&self, msg: Message) -> bool {
        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match inbound {
            Some(tx) => tx.send(msg).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    fn subscribe(&self, inbound: mpsc::Sender<Message>) {
        *self.inbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(inbound);
    }

    async fn push(&self, msg: Message) {
        self.pushed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(msg);
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_close.load(Ordering::SeqCst) {
            return Err(TransportError::Other("Mock close failure".to_string()));
        }
        Ok(())
    }
}
