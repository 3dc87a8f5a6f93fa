//! Ordering of synchronous commands against the inbound stream
//!
//! While a command runs under [`OrderedMessageHandler::run_locked`], inbound
//! messages are queued instead of dispatched. Releasing the section flushes
//! the queue in arrival order before any newer message reaches the consumer.

use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{MarketDataError, Result};

thread_local! {
    /// Nesting depth of consumer dispatch on this thread
    static DISPATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

tokio::task_local! {
    /// Handlers whose exclusive section the current task is inside
    static EXCLUSIVE: Vec<u64>;
}

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

struct DispatchState<T> {
    locked: bool,
    /// A caller is draining `pending` into the consumer
    dispatching: bool,
    pending: VecDeque<T>,
}

/// Consumer callback receiving dispatched messages
pub type Consumer<T> = Arc<dyn Fn(T) + Send + Sync>;

pub struct OrderedMessageHandler<T> {
    id: u64,
    state: Mutex<DispatchState<T>>,
    /// Serializes commands; held for the whole of `run_locked`
    command: tokio::sync::Mutex<()>,
    consumer: Consumer<T>,
}

impl<T: Send + 'static> OrderedMessageHandler<T> {
    /// The consumer runs outside the handler's state lock, one message at a
    /// time. It may call [`handle_inbound`](Self::handle_inbound) on the same
    /// handler; such messages are delivered after the current one returns.
    pub fn new(consumer: Consumer<T>) -> Self {
        Self {
            id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(DispatchState {
                locked: false,
                dispatching: false,
                pending: VecDeque::new(),
            }),
            command: tokio::sync::Mutex::new(()),
            consumer,
        }
    }

    /// Deliver `message` now, or queue it while a command is in flight
    pub fn handle_inbound(&self, message: T) {
        {
            let mut state = self.state.lock();
            state.pending.push_back(message);
            if state.locked {
                trace!(pending = state.pending.len(), "Inbound message queued behind command");
                return;
            }
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }
        self.drain();
    }

    /// Run `action` with inbound dispatch suspended
    ///
    /// Messages arriving meanwhile reach the consumer after `action`
    /// completes, in arrival order. Calling this from inside the consumer or
    /// from inside `action` is a programming error: it panics in debug builds
    /// and returns [`MarketDataError::ReentrantRunLocked`] otherwise.
    pub async fn run_locked<F, Fut, R>(&self, action: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        if DISPATCH_DEPTH.with(Cell::get) > 0 {
            debug_assert!(false, "run_locked called from inside message dispatch");
            return Err(MarketDataError::ReentrantRunLocked);
        }
        let id = self.id;
        let mut held = EXCLUSIVE.try_with(|held| held.clone()).unwrap_or_default();
        if held.contains(&id) {
            debug_assert!(false, "run_locked called from inside its own command");
            return Err(MarketDataError::ReentrantRunLocked);
        }
        held.push(id);

        let _command = self.command.lock().await;
        self.state.lock().locked = true;
        let release = ReleaseGuard { handler: self };

        let result = EXCLUSIVE.scope(held, action()).await;

        drop(release);
        Ok(result)
    }

    /// Wait for the in-flight command, if any, to finish
    pub async fn quiesce(&self) {
        let _command = self.command.lock().await;
        debug!("Ordered handler quiesced");
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Deliver queued messages until the queue empties or a command starts;
    /// the caller must have set `dispatching`
    fn drain(&self) {
        let mut guard = DrainGuard {
            handler: self,
            finished: false,
        };
        let mut delivered = 0usize;
        loop {
            let message = {
                let mut state = self.state.lock();
                let next = if state.locked {
                    None
                } else {
                    state.pending.pop_front()
                };
                if next.is_none() {
                    state.dispatching = false;
                }
                next
            };
            let Some(message) = message else {
                break;
            };
            let _depth = DepthGuard::enter();
            (self.consumer)(message);
            delivered += 1;
        }
        guard.finished = true;
        if delivered > 1 {
            trace!(delivered, "Queued inbound messages flushed");
        }
    }
}

/// Reopens dispatch and flushes queued messages, also when the command is
/// cancelled or panics
struct ReleaseGuard<'a, T: Send + 'static> {
    handler: &'a OrderedMessageHandler<T>,
}

impl<T: Send + 'static> Drop for ReleaseGuard<'_, T> {
    fn drop(&mut self) {
        {
            let mut state = self.handler.state.lock();
            state.locked = false;
            if state.dispatching || state.pending.is_empty() {
                return;
            }
            state.dispatching = true;
        }
        self.handler.drain();
    }
}

/// Clears `dispatching` if the consumer panics mid-drain
struct DrainGuard<'a, T: Send + 'static> {
    handler: &'a OrderedMessageHandler<T>,
    finished: bool,
}

impl<T: Send + 'static> Drop for DrainGuard<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            self.handler.state.lock().dispatching = false;
        }
    }
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
        DepthGuard
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}
