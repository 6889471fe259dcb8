//! Stream consumer.
//!
//! Drives the single writer path: frames from a [`FrameSource`] are parsed,
//! applied to the [`DerivedIndex`] strictly in arrival order, and the cursor
//! is persisted after each one. Delivery is at-least-once; every apply is
//! idempotent, so resuming from the last persisted cursor is always safe.
//!
//! # Failure handling
//!
//! - Malformed frames and undecodable records are logged and dropped.
//! - Transient apply failures (storage) are retried with backoff; the event
//!   is never skipped and the cursor does not move past it.
//! - Connection failures reconnect with exponential backoff, forever.
//!   After `degraded_after` consecutive failures health reports `Degraded`.

mod jetstream;

pub use jetstream::JetstreamSource;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use brewlog_core::metrics::HealthReport;
use brewlog_core::{Frame, parse_jetstream_frame};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::index::{ApplyOutcome, DerivedIndex};
use crate::store::Store;

/// A connection to the global event log.
pub trait FrameSource: Send {
    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    /// (Re)connect, resuming after `cursor` when given, otherwise from now.
    fn connect(&mut self, cursor: Option<u64>) -> impl Future<Output = Result<()>> + Send;

    /// Next raw frame. `Ok(None)` means the server closed the connection.
    fn next_frame(&mut self) -> impl Future<Output = Result<Option<String>>> + Send;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures before health reports `Degraded`.
    pub degraded_after: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            degraded_after: 5,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHealth {
    Healthy = 0,
    Degraded = 1,
    Disconnected = 2,
}

impl StreamHealth {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Healthy,
            1 => Self::Degraded,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "ok",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Counters for one [`StreamConsumer::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub frames: u64,
    pub applied: u64,
    /// Events for collections the index does not track.
    pub skipped: u64,
    /// Events whose record failed to decode.
    pub rejected: u64,
    pub malformed: u64,
    pub reconnects: u64,
    pub apply_retries: u64,
    pub last_cursor: Option<u64>,
}

/// Shared view of the consumer's health, readable from other tasks.
#[derive(Debug)]
pub struct HealthHandle {
    status: AtomicU8,
    consecutive_failures: AtomicU64,
    /// 0 means no cursor yet.
    cursor: AtomicU64,
}

impl HealthHandle {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(StreamHealth::Disconnected as u8),
            consecutive_failures: AtomicU64::new(0),
            cursor: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> StreamHealth {
        StreamHealth::from_u8(self.status.load(Ordering::Relaxed))
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> HealthReport {
        let cursor = self.cursor.load(Ordering::Relaxed);
        HealthReport {
            status: self.status().as_str(),
            cursor: (cursor > 0).then_some(cursor),
            consecutive_failures: self.consecutive_failures(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    fn set(&self, status: StreamHealth) {
        self.status.store(status as u8, Ordering::Relaxed);
        metrics::gauge!("stream_connected")
            .set(if status == StreamHealth::Disconnected { 0.0 } else { 1.0 });
        metrics::gauge!("stream_degraded")
            .set(if status == StreamHealth::Degraded { 1.0 } else { 0.0 });
    }
}

/// How a connected session ended.
enum SessionEnd {
    Shutdown,
    Closed,
    Failed(Error),
}

/// Outcome of handling one frame.
enum FrameEnd {
    Continue,
    Shutdown,
}

pub struct StreamConsumer {
    index: Arc<DerivedIndex>,
    store: Arc<Store>,
    config: ConsumerConfig,
    health: Arc<HealthHandle>,
}

impl StreamConsumer {
    pub fn new(index: Arc<DerivedIndex>, store: Arc<Store>, config: ConsumerConfig) -> Self {
        Self {
            index,
            store,
            config,
            health: Arc::new(HealthHandle::new()),
        }
    }

    pub fn health(&self) -> Arc<HealthHandle> {
        Arc::clone(&self.health)
    }

    /// Consume until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// On return the last cursor has been written durably.
    ///
    /// # Errors
    ///
    /// Only store failures while loading or flushing the cursor.
    pub async fn run<S: FrameSource>(
        &self,
        mut source: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumerStats> {
        let mut stats = ConsumerStats {
            last_cursor: self.store.load_cursor()?,
            ..Default::default()
        };
        if let Some(cursor) = stats.last_cursor {
            self.health.cursor.store(cursor, Ordering::Relaxed);
        }
        let mut backoff = self.config.initial_backoff;

        loop {
            if *shutdown.borrow() {
                break;
            }

            info!(source = source.name(), cursor = ?stats.last_cursor, "connecting to event stream");
            let connected = tokio::select! {
                result = source.connect(stats.last_cursor) => result,
                _ = shutdown.changed() => break,
            };

            let failure = match connected {
                Ok(()) => {
                    info!(source = source.name(), "event stream connected");
                    if self.health.status() == StreamHealth::Disconnected {
                        self.health.set(StreamHealth::Healthy);
                    }
                    let frames_before = stats.frames;
                    let end = self.session(&mut source, &mut stats, &mut shutdown).await;
                    if stats.frames > frames_before {
                        backoff = self.config.initial_backoff;
                    }
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed => {
                            info!("event stream closed by server");
                            None
                        }
                        SessionEnd::Failed(e) => {
                            warn!(error = %e, "event stream connection lost");
                            Some(e)
                        }
                    }
                }
                Err(e) => Some(e),
            };

            if let Some(e) = failure {
                self.record_failure(&e);
            }
            if self.health.status() != StreamHealth::Degraded {
                self.health.set(StreamHealth::Disconnected);
            }

            stats.reconnects += 1;
            metrics::counter!("stream_reconnects_total").increment(1);
            debug!(delay_ms = backoff.as_millis() as u64, "waiting before reconnect");
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
            backoff = next_backoff(backoff, self.config.max_backoff);
        }

        if let Some(cursor) = stats.last_cursor {
            self.store.save_cursor_durable(cursor)?;
        }
        self.store.flush()?;
        self.health.set(StreamHealth::Disconnected);
        info!(
            frames = stats.frames,
            applied = stats.applied,
            rejected = stats.rejected,
            malformed = stats.malformed,
            reconnects = stats.reconnects,
            cursor = ?stats.last_cursor,
            "stream consumer stopped"
        );
        Ok(stats)
    }

    async fn session<S: FrameSource>(
        &self,
        source: &mut S,
        stats: &mut ConsumerStats,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            if *shutdown.borrow() {
                return SessionEnd::Shutdown;
            }
            let next = tokio::select! {
                result = source.next_frame() => result,
                _ = shutdown.changed() => return SessionEnd::Shutdown,
            };
            match next {
                Ok(Some(text)) => {
                    if let FrameEnd::Shutdown = self.handle_frame(&text, stats, shutdown).await {
                        return SessionEnd::Shutdown;
                    }
                }
                Ok(None) => return SessionEnd::Closed,
                Err(e) => return SessionEnd::Failed(e),
            }
        }
    }

    async fn handle_frame(
        &self,
        text: &str,
        stats: &mut ConsumerStats,
        shutdown: &mut watch::Receiver<bool>,
    ) -> FrameEnd {
        stats.frames += 1;
        metrics::counter!("stream_frames_total").increment(1);

        let frame: Frame = match parse_jetstream_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                stats.malformed += 1;
                metrics::counter!("stream_frames_malformed_total").increment(1);
                warn!(error = %e, "dropping malformed frame");
                self.record_failure(&Error::Decode(e));
                return FrameEnd::Continue;
            }
        };

        if let Some(event) = &frame.event {
            let mut delay = self.config.initial_backoff;
            loop {
                match self.index.apply(event) {
                    Ok(ApplyOutcome::Skipped) => {
                        stats.skipped += 1;
                        break;
                    }
                    Ok(ApplyOutcome::Applied(kind) | ApplyOutcome::Deleted(kind)) => {
                        stats.applied += 1;
                        metrics::counter!("stream_events_applied_total", "kind" => kind.as_str())
                            .increment(1);
                        break;
                    }
                    Err(e) if e.is_transient() => {
                        stats.apply_retries += 1;
                        metrics::counter!("stream_apply_retries_total").increment(1);
                        warn!(did = %event.did, rkey = %event.rkey, error = %e, "apply failed, retrying");
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = shutdown.changed() => return FrameEnd::Shutdown,
                        }
                        delay = next_backoff(delay, self.config.max_backoff);
                    }
                    Err(e) => {
                        stats.rejected += 1;
                        metrics::counter!("stream_events_rejected_total").increment(1);
                        debug!(did = %event.did, rkey = %event.rkey, error = %e, "dropping undecodable event");
                        break;
                    }
                }
            }
        }

        self.advance_cursor(frame.seq, stats);
        self.record_success();
        FrameEnd::Continue
    }

    fn advance_cursor(&self, seq: u64, stats: &mut ConsumerStats) {
        let cursor = stats.last_cursor.map_or(seq, |c| c.max(seq));
        if let Err(e) = self.store.save_cursor(cursor) {
            // Next frame retries; worst case is a replay on restart.
            warn!(cursor, error = %e, "failed to persist cursor");
        }
        stats.last_cursor = Some(cursor);
        self.health.cursor.store(cursor, Ordering::Relaxed);
        metrics::gauge!("stream_cursor").set(cursor as f64);
    }

    fn record_failure(&self, error: &Error) {
        let failures = self
            .health
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if failures >= self.config.degraded_after && self.health.status() != StreamHealth::Degraded
        {
            warn!(failures, error = %error, "event stream degraded");
            self.health.set(StreamHealth::Degraded);
        } else {
            debug!(failures, error = %error, "event stream failure");
        }
    }

    fn record_success(&self) {
        self.health.consecutive_failures.store(0, Ordering::Relaxed);
        if self.health.status() != StreamHealth::Healthy {
            info!("event stream healthy");
            self.health.set(StreamHealth::Healthy);
        }
    }
}

/// Double `current`, capped at `max`.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
