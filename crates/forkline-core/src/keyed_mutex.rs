// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-local named locks.
//!
//! A [`KeyedMutex`] keeps one FIFO queue per lock name. Callers sharing a name
//! run strictly one at a time, in the order they asked for the lock; callers
//! under different names never wait on each other.
//!
//! The queue position is taken synchronously when [`KeyedMutex::acquire`] (or
//! [`Serialized::call`]) is invoked, not when the returned future is first
//! polled, so call order is the execution order even when the futures are
//! spawned onto different tasks.
//!
//! ```rust,ignore
//! let mutex = KeyedMutex::new();
//! let reload = mutex.wrap("routes", |reason: String| async move {
//!     rebuild_route_inventory(&reason).await
//! });
//!
//! // Both calls queue under "routes"; the second starts after the first ends.
//! let (a, b) = tokio::join!(reload.call("boot".into()), reload.call("hook".into()));
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::trace;

/// Named mutual exclusion within one process.
///
/// Cloning is cheap and clones share the same set of queues. Queues are
/// created on first use of a name and kept for the lifetime of the mutex.
#[derive(Clone, Default)]
pub struct KeyedMutex {
    queues: Arc<DashMap<String, Arc<KeyQueue>>>,
}

impl std::fmt::Debug for KeyedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedMutex")
            .field("names", &self.queues.len())
            .finish()
    }
}

impl KeyedMutex {
    /// Create an empty keyed mutex.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a place in the queue for `name`.
    ///
    /// The returned [`Ticket`] is either granted immediately (nobody holds
    /// the name) or pending behind earlier callers. Dropping a ticket gives
    /// up the place, and passes the lock on if it had already been handed
    /// over.
    pub fn acquire(&self, name: &str) -> Ticket {
        let queue = self.queue(name);
        let ticket = queue.enqueue();
        if !ticket.is_granted() {
            trace!(lock = %name, "Waiting for keyed mutex");
        }
        ticket
    }

    /// Wait for exclusive access to `name`.
    pub async fn lock(&self, name: &str) -> KeyGuard {
        self.acquire(name).wait().await
    }

    /// Wrap `f` so that every call runs under the lock `name`.
    pub fn wrap<F>(&self, name: impl Into<String>, f: F) -> Serialized<F> {
        Serialized {
            mutex: self.clone(),
            name: name.into(),
            f: Arc::new(f),
        }
    }

    /// Number of callers waiting behind the current holder of `name`.
    pub fn queued(&self, name: &str) -> usize {
        self.queues
            .get(name)
            .map(|queue| queue.lock_state().waiters.len())
            .unwrap_or(0)
    }

    /// Whether `name` is currently held.
    pub fn is_locked(&self, name: &str) -> bool {
        self.queues
            .get(name)
            .map(|queue| queue.lock_state().held)
            .unwrap_or(false)
    }

    fn queue(&self, name: &str) -> Arc<KeyQueue> {
        if let Some(queue) = self.queues.get(name) {
            return queue.clone();
        }
        self.queues.entry(name.to_owned()).or_default().clone()
    }
}

#[derive(Default)]
struct KeyQueue {
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    held: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl KeyQueue {
    // The state lock is never held across an await or user code, so a
    // poisoned lock still holds consistent data.
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(self: &Arc<Self>) -> Ticket {
        let mut state = self.lock_state();
        if !state.held {
            state.held = true;
            return Ticket {
                queue: self.clone(),
                state: TicketState::Granted,
            };
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Ticket {
            queue: self.clone(),
            state: TicketState::Pending(rx),
        }
    }

    /// Hand the lock to the oldest waiter that is still listening.
    fn release(&self) {
        let mut state = self.lock_state();
        while let Some(next) = state.waiters.pop_front() {
            if next.send(()).is_ok() {
                return;
            }
        }
        state.held = false;
    }
}

enum TicketState {
    Granted,
    Pending(oneshot::Receiver<()>),
    Consumed,
}

/// A place in the queue of one lock name.
#[must_use = "a ticket holds a queue position; call `wait` to obtain the lock"]
pub struct Ticket {
    queue: Arc<KeyQueue>,
    state: TicketState,
}

impl Ticket {
    /// Whether the lock was free when the ticket was issued.
    pub fn is_granted(&self) -> bool {
        matches!(self.state, TicketState::Granted)
    }

    /// Wait until every earlier holder has released the lock.
    pub async fn wait(mut self) -> KeyGuard {
        if let TicketState::Pending(rx) = &mut self.state {
            // The sender lives in the queue until it is used, and the queue
            // outlives this ticket, so the only outcome is a hand-over.
            let _ = rx.await;
        }
        self.state = TicketState::Consumed;
        KeyGuard {
            queue: self.queue.clone(),
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.state, TicketState::Consumed) {
            TicketState::Granted => self.queue.release(),
            TicketState::Pending(mut rx) => {
                rx.close();
                if rx.try_recv().is_ok() {
                    self.queue.release();
                }
            }
            TicketState::Consumed => {}
        }
    }
}

/// Exclusive access to one lock name; released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct KeyGuard {
    queue: Arc<KeyQueue>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.queue.release();
    }
}

/// A function whose invocations are serialized under one lock name.
pub struct Serialized<F> {
    mutex: KeyedMutex,
    name: String,
    f: Arc<F>,
}

impl<F> Clone for Serialized<F> {
    fn clone(&self) -> Self {
        Self {
            mutex: self.mutex.clone(),
            name: self.name.clone(),
            f: self.f.clone(),
        }
    }
}

impl<F> Serialized<F> {
    /// Lock name this function runs under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an invocation of the wrapped function.
    ///
    /// The queue position is fixed when `call` returns. The body runs once
    /// all earlier invocations under the same name have completed, whether
    /// they succeeded, failed or panicked. The output is returned to this
    /// caller only.
    pub fn call<A, Fut>(&self, arg: A) -> BoxFuture<'static, Fut::Output>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        A: Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send,
    {
        let ticket = self.mutex.acquire(&self.name);
        let f = self.f.clone();
        Box::pin(async move {
            let _guard = ticket.wait().await;
            f(arg).await
        })
    }
}
