//! Unique identifier generation.
//!
//! Handler ids and mesh endpoint names come from an injectable generator so
//! tests can use deterministic ids.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Produces probabilistically-unique string tokens.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs. The default everywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic `{prefix}-{n}` ids.
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}
