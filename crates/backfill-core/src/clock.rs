//! Injectable tick source for polling loops.
//!
//! Production code sleeps on the tokio timer; tests step a virtual clock so a
//! thirty-tick convergence run finishes instantly.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;

/// Future returned by [`Ticker::wait`].
pub type TickFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Source of inter-poll delays and elapsed time.
pub trait Ticker: Send {
    /// Suspend for one poll interval.
    fn wait(&mut self, interval: Duration) -> TickFuture<'_>;

    /// Time elapsed since the ticker was created.
    fn elapsed(&self) -> Duration;
}

/// Ticker backed by `tokio::time::sleep`.
#[derive(Debug, Clone)]
pub struct TokioTicker {
    started: Instant,
}

impl TokioTicker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for TokioTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for TokioTicker {
    fn wait(&mut self, interval: Duration) -> TickFuture<'_> {
        Box::pin(tokio::time::sleep(interval))
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Virtual clock: each wait advances elapsed time without sleeping.
#[derive(Debug, Clone, Default)]
pub struct ManualTicker {
    elapsed: Duration,
    waits: u32,
}

impl ManualTicker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of waits performed so far.
    #[must_use]
    pub fn waits(&self) -> u32 {
        self.waits
    }
}

impl Ticker for ManualTicker {
    fn wait(&mut self, interval: Duration) -> TickFuture<'_> {
        self.elapsed = self.elapsed.saturating_add(interval);
        self.waits = self.waits.saturating_add(1);
        Box::pin(std::future::ready(()))
    }

    fn elapsed(&self) -> Duration {
        self.elapsed
    }
}
