//! Fault injection for crash-recovery testing
//!
//! The data store calls [`InjectedErrorListener::check`] at points where a
//! crash would leave on-disk state half-updated. Tests arm the listener to
//! make the next check fail, then reopen the store and assert it recovers.

use crate::error::{DataStoreError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Fault raised right after the side file has been truncated
pub const INVALIDATE_FREELIST_FAULT: &str = "free list invalidated but not re-written";

#[derive(Debug, Default)]
pub struct InjectedErrorListener {
    running: AtomicBool,
    armed: AtomicBool,
    fired: AtomicU64,
}

impl InjectedErrorListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Stop listening; pending injections are dropped
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Make the next [`check`](Self::check) fail
    pub fn inject(&self) {
        self.armed.store(true, Ordering::Release);
    }

    /// Number of faults raised so far
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    /// Fail once if a fault was injected while the listener is running
    pub fn check(&self, site: &'static str) -> Result<()> {
        if self.is_running() && self.armed.swap(false, Ordering::AcqRel) {
            self.fired.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Raising injected fault: {}", site);
            return Err(DataStoreError::InjectedFault(site));
        }
        Ok(())
    }
}
