//! Cooperative termination token shared between the signal handler and the
//! session loop.
//!
//! The first request asks for a graceful stop after the current exposure; a
//! second one means the operator wants out immediately.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    requests: Arc<AtomicU32>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a termination request and return how many have been made so far
    pub fn request(&self) -> u32 {
        self.requests.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_requested(&self) -> bool {
        self.request_count() > 0
    }

    /// Two or more requests: skip parking and exit
    pub fn is_forced(&self) -> bool {
        self.request_count() >= 2
    }

    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}
