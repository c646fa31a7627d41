//! Collaborator traits the node engine depends on.
//!
//! The engine is handed a framed transport and a clock at construction and
//! never names a concrete implementation; tests substitute an in-memory
//! fabric and a controlled clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;

/// Frame delivery to a peer address. Inbound frames arrive separately as
/// `(source_address, frame_bytes)` events on a channel handed to the engine.
///
/// The transport may authenticate peers at channel level; the engine
/// re-verifies every envelope signature regardless.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: &str, frame: Vec<u8>) -> Result<()>;
}

/// Receiver side of the inbound frame stream.
pub type InboundFrames = tokio::sync::mpsc::Receiver<(String, Vec<u8>)>;

/// Time source for the engine.
///
/// `now_ms` is monotonic and drives timers, timeouts and bookkeeping;
/// `wall_ms` is wall-clock time used only for item timestamps and expiry.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
    fn wall_ms(&self) -> u64;
}

/// Default clock: monotonic milliseconds since construction, wall clock from
/// the system.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn wall_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually advanced clock for tests.
#[derive(Default)]
pub struct MockClock {
    mono: AtomicU64,
    wall: AtomicU64,
}

impl MockClock {
    pub fn new(mono_ms: u64, wall_ms: u64) -> Self {
        Self {
            mono: AtomicU64::new(mono_ms),
            wall: AtomicU64::new(wall_ms),
        }
    }

    /// Advance both clocks by the same amount.
    pub fn advance(&self, ms: u64) {
        self.mono.fetch_add(ms, Ordering::SeqCst);
        self.wall.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.mono.load(Ordering::SeqCst)
    }

    fn wall_ms(&self) -> u64 {
        self.wall.load(Ordering::SeqCst)
    }
}
