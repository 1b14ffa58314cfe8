//! Priority-based admission of concurrent requests.
//!
//! Lower values are more urgent. An operation starts right away when nothing
//! is running or when its priority is at most the lowest priority currently
//! running; otherwise it waits. When the last running operation finishes,
//! every waiting operation tied at the lowest waiting priority starts at once.
//!
//! Operations are admitted when first polled, not when created, and a
//! dropped operation gives its slot back exactly like a finished one.

use async_stream::stream;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, trace};

struct WaitingEntry {
    id: u64,
    priority: i32,
    release: oneshot::Sender<RunningPermit>,
}

#[derive(Default)]
struct State {
    /// Lowest priority among running operations, `None` when nothing runs
    min_pending_priority: Option<i32>,
    running: usize,
    waiting: Vec<WaitingEntry>,
}

impl State {
    fn can_start(&self, priority: i32) -> bool {
        self.min_pending_priority.is_none_or(|min| priority <= min)
    }

    fn start(&mut self, priority: i32) {
        self.running += 1;
        self.min_pending_priority = Some(
            self.min_pending_priority
                .map_or(priority, |min| min.min(priority)),
        );
    }

    /// Start every waiting entry tied at the lowest waiting priority.
    ///
    /// Returns the permits whose receivers were already gone; the caller must
    /// drop them after releasing the lock.
    fn release_lowest(&mut self, shared: &Arc<Shared>) -> Vec<RunningPermit> {
        self.min_pending_priority = None;
        let Some(lowest) = self.waiting.iter().map(|entry| entry.priority).min() else {
            return Vec::new();
        };

        let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiting)
            .into_iter()
            .partition(|entry| entry.priority == lowest);
        self.waiting = rest;
        debug!(priority = lowest, released = ready.len(), still_waiting = self.waiting.len(), "Releasing queued operations");

        let mut orphaned = Vec::new();
        for entry in ready {
            if let Err(permit) = self.hand_over(shared, entry) {
                orphaned.push(permit);
            }
        }
        orphaned
    }

    fn hand_over(&mut self, shared: &Arc<Shared>, entry: WaitingEntry) -> Result<(), RunningPermit> {
        self.start(entry.priority);
        entry.release.send(RunningPermit {
            shared: Arc::clone(shared),
        })
    }
}

struct Shared {
    state: Mutex<State>,
    next_id: AtomicU64,
}

/// Held by a running operation; giving it back may release waiting ones.
struct RunningPermit {
    shared: Arc<Shared>,
}

impl Drop for RunningPermit {
    fn drop(&mut self) {
        let orphaned = {
            let mut state = self.shared.state.lock();
            state.running = state.running.saturating_sub(1);
            if state.running == 0 {
                state.release_lowest(&self.shared)
            } else {
                Vec::new()
            }
        };
        drop(orphaned);
    }
}

/// Removes a waiting entry whose operation was dropped before being released.
struct QueuedGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for QueuedGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(position) = state.waiting.iter().position(|entry| entry.id == self.id) {
            state.waiting.remove(position);
            trace!(id = self.id, "Dropped queued operation");
        }
    }
}

/// Identifies one prioritized operation, for [`Prioritizer::update_priority`].
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    priority: Arc<AtomicI32>,
    admitted: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Priority the operation was (or will be) admitted with.
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct Prioritizer {
    shared: Arc<Shared>,
}

impl Default for Prioritizer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Prioritizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Prioritizer")
            .field("running", &state.running)
            .field("waiting", &state.waiting.len())
            .field("min_pending_priority", &state.min_pending_priority)
            .finish()
    }
}

impl Prioritizer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Wrap `stream` so that it only starts producing once admitted.
    pub fn create<S>(&self, stream: S, priority: i32) -> Prioritized<S::Item>
    where
        S: Stream + Send + 'static,
        S::Item: Send + 'static,
    {
        let handle = self.new_handle(priority);
        let shared = Arc::clone(&self.shared);
        let admission = handle.clone();
        let inner = Box::pin(stream! {
            let _permit = admit(shared, admission).await;
            let mut stream = std::pin::pin!(stream);
            while let Some(item) = stream.next().await {
                yield item;
            }
        });
        Prioritized { handle, inner }
    }

    /// Future-shaped variant of [`Prioritizer::create`].
    pub fn create_task<F>(&self, future: F, priority: i32) -> (TaskHandle, BoxFuture<'static, F::Output>)
    where
        F: Future + Send + 'static,
    {
        let handle = self.new_handle(priority);
        let shared = Arc::clone(&self.shared);
        let admission = handle.clone();
        let task = Box::pin(async move {
            let _permit = admit(shared, admission).await;
            future.await
        });
        (handle, task)
    }

    /// Change the priority of an operation that has not started yet.
    ///
    /// A queued operation whose new priority is at most the active minimum
    /// starts immediately. Operations already running are left untouched.
    pub fn update_priority(&self, handle: &TaskHandle, priority: i32) {
        let mut orphaned = None;
        {
            let mut state = self.shared.state.lock();
            if let Some(position) = state.waiting.iter().position(|entry| entry.id == handle.id) {
                handle.priority.store(priority, Ordering::Relaxed);
                state.waiting[position].priority = priority;
                if state.can_start(priority) {
                    let entry = state.waiting.remove(position);
                    debug!(id = handle.id, priority, "Releasing operation after priority update");
                    orphaned = state.hand_over(&self.shared, entry).err();
                }
            } else if !handle.admitted.load(Ordering::Acquire) {
                handle.priority.store(priority, Ordering::Relaxed);
            } else {
                trace!(id = handle.id, priority, "Ignoring priority update of a started operation");
            }
        }
        drop(orphaned);
    }

    pub fn running_count(&self) -> usize {
        self.shared.state.lock().running
    }

    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().waiting.len()
    }

    /// Lowest priority among running operations.
    pub fn active_priority(&self) -> Option<i32> {
        self.shared.state.lock().min_pending_priority
    }

    fn new_handle(&self, priority: i32) -> TaskHandle {
        TaskHandle {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            priority: Arc::new(AtomicI32::new(priority)),
            admitted: Arc::new(AtomicBool::new(false)),
        }
    }
}

async fn admit(shared: Arc<Shared>, handle: TaskHandle) -> RunningPermit {
    let receiver = {
        let mut state = shared.state.lock();
        handle.admitted.store(true, Ordering::Release);
        let priority = handle.priority.load(Ordering::Relaxed);
        if state.can_start(priority) {
            state.start(priority);
            trace!(id = handle.id, priority, running = state.running, "Starting operation");
            drop(state);
            return RunningPermit { shared };
        }
        let (release, receiver) = oneshot::channel();
        state.waiting.push(WaitingEntry {
            id: handle.id,
            priority,
            release,
        });
        trace!(id = handle.id, priority, waiting = state.waiting.len(), "Queueing operation");
        receiver
    };

    // Unlinks the entry if this future is dropped while still queued.
    let _guard = QueuedGuard {
        shared: Arc::clone(&shared),
        id: handle.id,
    };
    match receiver.await {
        Ok(permit) => permit,
        // Every entry is either released with a permit or removed by its
        // own guard, so the sender cannot vanish while we wait.
        Err(_) => {
            let mut state = shared.state.lock();
            state.start(handle.priority.load(Ordering::Relaxed));
            drop(state);
            RunningPermit { shared }
        }
    }
}

/// Stream returned by [`Prioritizer::create`].
pub struct Prioritized<T> {
    handle: TaskHandle,
    inner: BoxStream<'static, T>,
}

impl<T> Prioritized<T> {
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }
}

impl<T> Stream for Prioritized<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T> fmt::Debug for Prioritized<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prioritized").field("handle", &self.handle).finish_non_exhaustive()
    }
}
