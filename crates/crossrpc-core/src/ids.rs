//! Identifier generation for pending calls and browser surfaces.

use std::sync::atomic::{AtomicU64, Ordering};

/// Produces identifiers that never repeat within one context's lifetime.
pub trait IdGenerator: Send + Sync + 'static {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs. The default for every context.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Monotonic counter ids with a prefix, handy for readable logs and tests.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next_id: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.prefix, n)
    }
}
