//! Bulkhead: bounded concurrency with a bounded FIFO wait queue
//!
//! Admission works in two tiers:
//!
//! 1. `max_concurrent_requests` permits on a [`Semaphore`] bound the work in
//!    flight.
//! 2. Up to `queue_size` callers may wait for a permit. A caller that finds
//!    the queue full is rejected at once.
//!
//! Waiting callers are served by a dispatcher task that pops requests strictly
//! in arrival order and tries to acquire a permit for each, giving up after
//! `semaphore_timeout`. A waiter additionally gives up after `queue_timeout`
//! or when its cancellation token fires; the dispatcher skips requests whose
//! waiter has already left.
//!
//! A granted [`BulkheadPermit`] returns its slot when dropped, so every exit
//! path releases exactly once.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::duration_millis;
use crate::error::{ConfigError, ConfigResult, ResilienceError, ShutdownError};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bulkhead settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// When false every acquire succeeds at once.
    pub enabled: bool,
    /// Operations allowed to run at the same time.
    pub max_concurrent_requests: usize,
    /// Callers allowed to wait for a slot.
    pub queue_size: usize,
    /// Longest a caller waits in the queue.
    #[serde(with = "duration_millis")]
    pub queue_timeout: Duration,
    /// Longest the dispatcher waits for a slot on behalf of one caller.
    #[serde(with = "duration_millis")]
    pub semaphore_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_requests: 100,
            queue_size: 50,
            queue_timeout: Duration::from_secs(5),
            semaphore_timeout: Duration::from_secs(1),
        }
    }
}

impl BulkheadConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::invalid("max_concurrent_requests must be greater than 0"));
        }
        if self.max_concurrent_requests > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(format!(
                "max_concurrent_requests must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.queue_timeout.is_zero() {
            return Err(ConfigError::invalid("queue_timeout must be greater than zero"));
        }
        if self.semaphore_timeout.is_zero() {
            return Err(ConfigError::invalid("semaphore_timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for [`BulkheadConfig`].
#[derive(Debug, Default)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl BulkheadConfigBuilder {
    /// Builder seeded with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn admission control on or off.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Slots that may be held at once.
    #[must_use]
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent_requests = max;
        self
    }

    /// Callers allowed to wait for a slot. Zero rejects as soon as every
    /// slot is taken.
    #[must_use]
    pub fn queue_size(mut self, size: usize) -> Self {
        self.config.queue_size = size;
        self
    }

    /// Longest a caller waits in the queue.
    #[must_use]
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.config.queue_timeout = timeout;
        self
    }

    /// Longest the dispatcher tries to acquire a slot for one request.
    #[must_use]
    pub fn semaphore_timeout(mut self, timeout: Duration) -> Self {
        self.config.semaphore_timeout = timeout;
        self
    }

    /// Validate and return the config.
    pub fn build(self) -> ConfigResult<BulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Why an acquire did not yield a permit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BulkheadError {
    /// Every queue slot was taken.
    #[error("Bulkhead queue is full ({queue_size} waiting)")]
    QueueFull {
        /// Configured queue capacity.
        queue_size: usize,
    },

    /// No slot was granted in time.
    #[error("Bulkhead permit not granted within {timeout:?}")]
    Timeout {
        /// The timeout that expired.
        timeout: Duration,
    },

    /// The caller cancelled while waiting.
    #[error("Bulkhead acquire cancelled")]
    Cancelled,

    /// The bulkhead has been shut down.
    #[error("Bulkhead is shut down")]
    ShutDown,
}

impl<E> From<BulkheadError> for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: BulkheadError) -> Self {
        match error {
            BulkheadError::QueueFull { queue_size } => Self::BulkheadRejected { queue_size },
            BulkheadError::Timeout { timeout } => Self::BulkheadTimeout { timeout },
            BulkheadError::Cancelled => Self::Cancelled,
            BulkheadError::ShutDown => Self::ShutDown,
        }
    }
}

/// Point-in-time view of the bulkhead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkheadMetrics {
    /// Permits currently held.
    pub active_requests: usize,
    /// Callers currently waiting.
    pub queued_requests: usize,
    /// Callers turned away because the queue was full.
    pub rejected_requests: u64,
    /// Waits that ran out of time.
    pub timeouts: u64,
    /// Configured concurrency.
    pub max_concurrent: usize,
    /// Configured queue capacity.
    pub queue_size: usize,
}

impl BulkheadMetrics {
    /// Share of permits in use, from 0.0 to 1.0.
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 0.0;
        }
        self.active_requests as f64 / self.max_concurrent as f64
    }

    /// One-line summary for logs.
    pub fn status_message(&self) -> String {
        format!(
            "Bulkhead: {}/{} active ({:.1}% utilized), {}/{} queued, {} rejected, {} timeouts",
            self.active_requests,
            self.max_concurrent,
            self.utilization() * 100.0,
            self.queued_requests,
            self.queue_size,
            self.rejected_requests,
            self.timeouts
        )
    }
}

/// A held concurrency slot. Dropping it releases the slot.
#[must_use = "dropping the permit releases the bulkhead slot immediately"]
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl BulkheadPermit {
    fn granted(permit: OwnedSemaphorePermit) -> Self {
        Self { _permit: Some(permit) }
    }

    fn unbounded() -> Self {
        Self { _permit: None }
    }
}

type Grant = Result<OwnedSemaphorePermit, BulkheadError>;

struct QueuedRequest {
    responder: oneshot::Sender<Grant>,
}

/// Occupies one queue slot until dropped.
struct QueueSlot<'a> {
    queued: &'a AtomicUsize,
}

impl<'a> QueueSlot<'a> {
    fn try_claim(queued: &'a AtomicUsize, capacity: usize) -> Option<Self> {
        queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < capacity).then_some(current + 1)
            })
            .ok()
            .map(|_| Self { queued })
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Concurrency isolation with a FIFO wait queue.
pub struct Bulkhead {
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
    rejected: AtomicU64,
    timeouts: AtomicU64,
    requests: Option<mpsc::UnboundedSender<QueuedRequest>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("config", &self.config)
            .field("available_permits", &self.semaphore.available_permits())
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Bulkhead {
    /// Build a bulkhead and, when enabled, spawn its dispatcher on the
    /// current Tokio runtime.
    pub fn new(config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;

        let semaphore = Arc::new(Semaphore::new(if config.enabled {
            config.max_concurrent_requests
        } else {
            0
        }));
        let shutdown = CancellationToken::new();

        let (requests, worker) = if config.enabled {
            let handle = Handle::try_current()
                .map_err(|e| ConfigError::RuntimeUnavailable { message: e.to_string() })?;
            let (tx, rx) = mpsc::unbounded_channel();

            info!(
                max_concurrent = config.max_concurrent_requests,
                queue_size = config.queue_size,
                "Starting bulkhead dispatcher"
            );
            let worker = handle.spawn(dispatch_worker(
                Arc::clone(&semaphore),
                rx,
                config.semaphore_timeout,
                shutdown.clone(),
            ));
            (Some(tx), Some(worker))
        } else {
            (None, None)
        };

        Ok(Self {
            config,
            semaphore,
            queued: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            requests,
            shutdown,
            worker: Mutex::new(worker),
        })
    }

    /// Whether admission control is active.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The bulkhead's configuration.
    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Wait for a concurrency slot.
    ///
    /// Rejects immediately when the queue is full. Otherwise waits until the
    /// dispatcher grants a slot, a timeout expires or `cancel` fires. The
    /// queue slot is given back on every one of those outcomes. An already
    /// cancelled token gets `Cancelled` even when a slot is free.
    #[instrument(skip(self, cancel), fields(queue_size = self.config.queue_size))]
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BulkheadPermit, BulkheadError> {
        let Some(requests) = &self.requests else {
            return Ok(BulkheadPermit::unbounded());
        };
        if self.shutdown.is_cancelled() {
            return Err(BulkheadError::ShutDown);
        }
        if cancel.is_cancelled() {
            return Err(BulkheadError::Cancelled);
        }

        if self.queued.load(Ordering::Acquire) == 0 {
            if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
                debug!("Bulkhead slot granted without queueing");
                return Ok(BulkheadPermit::granted(permit));
            }
        }

        let Some(_slot) = QueueSlot::try_claim(&self.queued, self.config.queue_size) else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("Bulkhead queue full, rejecting");
            return Err(BulkheadError::QueueFull { queue_size: self.config.queue_size });
        };

        let (responder, mut response) = oneshot::channel();
        if requests.send(QueuedRequest { responder }).is_err() {
            return Err(BulkheadError::ShutDown);
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(BulkheadError::Cancelled),
            grant = &mut response => match grant {
                Ok(grant) => grant,
                Err(_) => Err(BulkheadError::ShutDown),
            },
            () = tokio::time::sleep(self.config.queue_timeout) => {
                Err(BulkheadError::Timeout { timeout: self.config.queue_timeout })
            }
        };

        match outcome {
            Ok(permit) => {
                debug!("Bulkhead slot granted from queue");
                Ok(BulkheadPermit::granted(permit))
            }
            Err(error) => {
                if matches!(error, BulkheadError::Timeout { .. }) {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %error, "Bulkhead wait timed out");
                } else {
                    debug!(error = %error, "Bulkhead wait ended without a slot");
                }
                Err(error)
            }
        }
    }

    /// Give a slot back. Equivalent to dropping the permit.
    pub fn release(&self, permit: BulkheadPermit) {
        drop(permit);
    }

    /// Current occupancy and counters.
    pub fn get_metrics(&self) -> BulkheadMetrics {
        let active_requests = if self.config.enabled {
            self.config
                .max_concurrent_requests
                .saturating_sub(self.semaphore.available_permits())
        } else {
            0
        };

        BulkheadMetrics {
            active_requests,
            queued_requests: self.queued.load(Ordering::Acquire),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            max_concurrent: self.config.max_concurrent_requests,
            queue_size: self.config.queue_size,
        }
    }

    /// Stop the dispatcher and wait for it to exit.
    ///
    /// Waiters still queued receive [`BulkheadError::ShutDown`]; later
    /// acquires fail the same way. Permits already granted stay valid.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.shutdown.cancel();

        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            tokio::time::timeout(SHUTDOWN_GRACE, handle)
                .await
                .map_err(|_| ShutdownError::Timeout {
                    component: "bulkhead",
                    timeout: SHUTDOWN_GRACE,
                })?
                .map_err(|e| ShutdownError::Join {
                    component: "bulkhead",
                    message: e.to_string(),
                })?;
            info!("Bulkhead dispatcher stopped");
        }
        Ok(())
    }

    /// Whether the dispatcher is still serving the queue.
    pub fn is_running(&self) -> bool {
        let has_worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).is_some();
        has_worker && !self.shutdown.is_cancelled()
    }
}

impl Drop for Bulkhead {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Serve queued requests one at a time, oldest first.
async fn dispatch_worker(
    semaphore: Arc<Semaphore>,
    mut requests: mpsc::UnboundedReceiver<QueuedRequest>,
    semaphore_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let mut request = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            next = requests.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        if request.responder.is_closed() {
            debug!("Skipping queued request whose caller left");
            continue;
        }

        let acquire =
            tokio::time::timeout(semaphore_timeout, Arc::clone(&semaphore).acquire_owned());
        let grant = tokio::select! {
            biased;
            () = shutdown.cancelled() => Some(Err(BulkheadError::ShutDown)),
            () = request.responder.closed() => None,
            acquired = acquire => {
                Some(match acquired {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(BulkheadError::ShutDown),
                    Err(_) => Err(BulkheadError::Timeout { timeout: semaphore_timeout }),
                })
            }
        };

        let Some(grant) = grant else {
            debug!("Queued caller left while waiting for a slot");
            continue;
        };
        // A permit the caller can no longer take is dropped with the error
        // value and returns to the semaphore.
        if request.responder.send(grant).is_err() {
            debug!("Queued caller left before the grant arrived");
        }
        if shutdown.is_cancelled() {
            break;
        }
    }

    // Fail whoever is still waiting.
    requests.close();
    while let Ok(request) = requests.try_recv() {
        let _ = request.responder.send(Err(BulkheadError::ShutDown));
    }
    info!("Bulkhead dispatcher shutting down");
}
