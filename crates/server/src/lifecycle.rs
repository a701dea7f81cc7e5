//! Lazy lifecycle for the single shared backing-store connection.
//!
//! The connection is opened on the first `acquire()` and closed either when
//! an idle-close timer fires or when the session registry reports that no
//! consumers remain. Route handlers hold a [`ConnectionLease`] while they
//! work; dropping the last lease arms the idle-close countdown.

use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use campusdock_protocol::ConnectionStatus;
use thiserror::Error;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::registry::ConnectionDemand;

/// Errors raised while opening or closing the backing store
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to open backing store: {0}")]
    Open(String),

    #[error("failed to close backing store: {0}")]
    Close(String),

    #[error("backing store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Opens and closes the expensive shared connection.
pub trait StoreConnector: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    fn open(&self) -> impl Future<Output = Result<Self::Handle, ConnectionError>> + Send;

    /// Close a handle that has already been detached from the manager.
    /// Other leases may still hold clones of the `Arc`.
    fn close(
        &self,
        handle: Arc<Self::Handle>,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// Owner of the shared connection handle (cheap to Clone).
pub struct ConnectionLifecycleManager<C: StoreConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: StoreConnector> Clone for ConnectionLifecycleManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C: StoreConnector> {
    connector: C,
    idle_window: Duration,
    slot: Mutex<Slot<C::Handle>>,
    /// Serializes the closed → open transition so a burst of callers opens once.
    open_lock: tokio::sync::Mutex<()>,
    opens: AtomicU64,
    closes: AtomicU64,
}

struct Slot<H> {
    handle: Option<Arc<H>>,
    opened_at: Option<Instant>,
    leases: usize,
    timer: Option<IdleTimer>,
    /// Bumped on every arm/cancel; a timer only acts if its generation is current.
    generation: u64,
    /// An open is in flight.
    opening: bool,
    /// No consumers remained while the open was in flight: close on last release.
    close_when_released: bool,
}

struct IdleTimer {
    deadline: Instant,
    abort: AbortHandle,
}

impl<H> Slot<H> {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    fn detach(&mut self) -> Option<Arc<H>> {
        self.opened_at = None;
        self.handle.take()
    }
}

impl<C: StoreConnector> ConnectionLifecycleManager<C> {
    /// Create a manager that closes the connection `idle_window` after the
    /// last lease is released.
    pub fn new(connector: C, idle_window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                idle_window,
                slot: Mutex::new(Slot {
                    handle: None,
                    opened_at: None,
                    leases: 0,
                    timer: None,
                    generation: 0,
                    opening: false,
                    close_when_released: false,
                }),
                open_lock: tokio::sync::Mutex::new(()),
                opens: AtomicU64::new(0),
                closes: AtomicU64::new(0),
            }),
        }
    }

    /// Return a lease on the shared connection, opening it if needed.
    ///
    /// Cancels any armed idle-close. Open failures are returned to the caller
    /// and not retried; the next `acquire()` attempts a fresh open.
    pub async fn acquire(&self) -> Result<ConnectionLease<C>, ConnectionError> {
        let _open = self.inner.open_lock.lock().await;

        {
            let mut slot = self.inner.slot();
            slot.cancel_timer();
            if let Some(handle) = slot.handle.clone() {
                slot.leases += 1;
                return Ok(self.lease(handle));
            }
            slot.opening = true;
            slot.close_when_released = false;
        }

        let started = Instant::now();
        let handle = match self.inner.connector.open().await {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                {
                    let mut slot = self.inner.slot();
                    slot.opening = false;
                    slot.close_when_released = false;
                }
                warn!(
                    component = "lifecycle",
                    event = "store.connection.open_failed",
                    error = %e,
                    "Backing store open failed"
                );
                return Err(e);
            }
        };
        let opens = self.inner.opens.fetch_add(1, Ordering::Relaxed) + 1;

        let mut slot = self.inner.slot();
        slot.cancel_timer();
        slot.opening = false;
        slot.handle = Some(Arc::clone(&handle));
        slot.opened_at = Some(Instant::now());
        slot.leases += 1;

        info!(
            component = "lifecycle",
            event = "store.connection.opened",
            opens_total = opens,
            open_ms = started.elapsed().as_millis() as u64,
            "Backing store connection opened"
        );

        Ok(self.lease(handle))
    }

    /// Strong hint that no consumers remain: close now, bypassing the timer.
    ///
    /// The handle is detached before this returns so the next `acquire()`
    /// re-opens; the close I/O itself runs in the background. If an open is
    /// still in flight, the connection closes as soon as its leases drop.
    pub fn mark_idle_candidate(&self) {
        let detached = {
            let mut slot = self.inner.slot();
            slot.cancel_timer();
            let detached = slot.detach();
            if detached.is_none() && slot.opening {
                slot.close_when_released = true;
                debug!(
                    component = "lifecycle",
                    event = "store.connection.idle_candidate_deferred",
                    "No consumers remain, close deferred until the pending open is released"
                );
            }
            detached
        };
        let Some(handle) = detached else {
            return;
        };

        debug!(
            component = "lifecycle",
            event = "store.connection.idle_candidate",
            "No consumers remain, closing backing store"
        );
        self.inner.close_in_background(handle, "idle_candidate");
    }

    /// Arm a one-shot idle close. Rearming replaces any pending timer.
    pub fn schedule_idle_close(&self, window: Duration) {
        let mut slot = self.inner.slot();
        if slot.handle.is_none() {
            return;
        }
        self.inner.arm_idle_close(&mut slot, window);
    }

    /// Close immediately and wait for the close to finish. Idempotent.
    pub async fn close_now(&self, reason: &'static str) {
        let detached = {
            let mut slot = self.inner.slot();
            slot.cancel_timer();
            slot.detach()
        };
        if let Some(handle) = detached {
            self.inner.close_detached(handle, reason).await;
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.slot().handle.is_some()
    }

    pub fn idle_window(&self) -> Duration {
        self.inner.idle_window
    }

    pub fn opens_total(&self) -> u64 {
        self.inner.opens.load(Ordering::Relaxed)
    }

    pub fn closes_total(&self) -> u64 {
        self.inner.closes.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> ConnectionStatus {
        let now = Instant::now();
        let slot = self.inner.slot();
        ConnectionStatus {
            open: slot.handle.is_some(),
            open_for_ms: slot
                .opened_at
                .map(|at| millis(now.saturating_duration_since(at))),
            idle_close_in_ms: slot
                .timer
                .as_ref()
                .map(|t| millis(t.deadline.saturating_duration_since(now))),
            opens_total: self.opens_total(),
            closes_total: self.closes_total(),
            active_leases: slot.leases,
        }
    }

    fn lease(&self, handle: Arc<C::Handle>) -> ConnectionLease<C> {
        ConnectionLease {
            handle,
            manager: Arc::downgrade(&self.inner),
        }
    }
}

impl<C: StoreConnector> Inner<C> {
    fn slot(&self) -> MutexGuard<'_, Slot<C::Handle>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm_idle_close(self: &Arc<Self>, slot: &mut Slot<C::Handle>, window: Duration) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            debug!(
                component = "lifecycle",
                event = "store.idle_timer.no_runtime",
                "No runtime available, idle close not armed"
            );
            return;
        };

        slot.cancel_timer();
        let generation = slot.generation;
        // Fixed at arm time; the task may not be polled until later.
        let deadline = Instant::now() + window;
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = rt.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire_idle_close(generation).await;
            }
        });

        slot.timer = Some(IdleTimer {
            deadline,
            abort: task.abort_handle(),
        });

        debug!(
            component = "lifecycle",
            event = "store.idle_timer.armed",
            window_ms = millis(window),
            "Idle close armed"
        );
    }

    fn release(self: &Arc<Self>) {
        let detached = {
            let mut slot = self.slot();
            slot.leases = slot.leases.saturating_sub(1);
            if slot.leases > 0 || slot.handle.is_none() {
                return;
            }
            if std::mem::take(&mut slot.close_when_released) {
                slot.cancel_timer();
                slot.detach()
            } else {
                let window = self.idle_window;
                self.arm_idle_close(&mut slot, window);
                None
            }
        };
        if let Some(handle) = detached {
            self.close_in_background(handle, "idle_candidate");
        }
    }

    fn close_in_background(self: &Arc<Self>, handle: Arc<C::Handle>, reason: &'static str) {
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let inner = Arc::clone(self);
                rt.spawn(async move { inner.close_detached(handle, reason).await });
            }
            Err(_) => {
                // No runtime to run the close on; dropping the last Arc releases it.
                self.closes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn fire_idle_close(&self, generation: u64) {
        let detached = {
            let mut slot = self.slot();
            if slot.generation != generation {
                return;
            }
            // Runs inside the timer task itself; drop without aborting.
            slot.timer = None;
            slot.detach()
        };
        if let Some(handle) = detached {
            self.close_detached(handle, "idle_timeout").await;
        }
    }

    async fn close_detached(&self, handle: Arc<C::Handle>, reason: &'static str) {
        let closes = self.closes.fetch_add(1, Ordering::Relaxed) + 1;
        match self.connector.close(handle).await {
            Ok(()) => info!(
                component = "lifecycle",
                event = "store.connection.closed",
                reason,
                closes_total = closes,
                "Backing store connection closed"
            ),
            Err(e) => warn!(
                component = "lifecycle",
                event = "store.connection.close_failed",
                reason,
                error = %e,
                "Backing store close failed, handle discarded"
            ),
        }
    }
}

impl<C: StoreConnector> ConnectionDemand for ConnectionLifecycleManager<C> {
    /// Session activity resets a pending idle countdown and cancels a deferred
    /// close, without opening anything.
    fn demand_observed(&self) {
        let mut slot = self.inner.slot();
        slot.close_when_released = false;
        if slot.timer.is_some() && slot.leases == 0 {
            let window = self.inner.idle_window;
            self.inner.arm_idle_close(&mut slot, window);
        }
    }

    fn idle_candidate(&self) {
        self.mark_idle_candidate();
    }
}

/// A consumer's hold on the shared connection.
///
/// The handle stays valid for the lease's lifetime even if the manager
/// closes the connection meanwhile.
pub struct ConnectionLease<C: StoreConnector> {
    handle: Arc<C::Handle>,
    manager: Weak<Inner<C>>,
}

impl<C: StoreConnector> ConnectionLease<C> {
    /// Owned clone of the handle, e.g. for moving into `spawn_blocking`.
    pub fn handle(&self) -> Arc<C::Handle> {
        Arc::clone(&self.handle)
    }
}

impl<C: StoreConnector> Deref for ConnectionLease<C> {
    type Target = C::Handle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<C: StoreConnector> Drop for ConnectionLease<C> {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.release();
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
