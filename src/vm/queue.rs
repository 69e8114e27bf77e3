//! The bounded call queue a [`super::Vm`] drains one call at a time (spec
//! §4.4 point 1, §4.8's `Q_MAX`).
//!
//! Calls are pushed from any task (typically an RPC handler) and drained by
//! a single worker loop owned by the `Vm`. `parking_lot::Mutex` plus
//! `tokio::sync::Notify` gives the same "one waiter wakes, nothing blocks
//! across an await point while holding the lock" shape the rest of the
//! crate already uses, without pulling in a second channel abstraction.

use std::collections::VecDeque;

use tokio::sync::Notify;

use crate::error::{CoreError, CoreResult};
use crate::ledger::CallRequest;

/// A call waiting to run, plus the means to hand its result back to
/// whoever enqueued it.
pub struct QueuedCall {
    pub request: CallRequest,
    pub respond_to: tokio::sync::oneshot::Sender<CoreResult<Option<serde_json::Value>>>,
}

struct Inner {
    pending: VecDeque<QueuedCall>,
    closed: bool,
}

pub struct CallQueue {
    capacity: usize,
    inner: parking_lot::Mutex<Inner>,
    notify: Notify,
}

impl CallQueue {
    pub fn new(capacity: usize) -> Self {
        CallQueue {
            capacity,
            inner: parking_lot::Mutex::new(Inner {
                pending: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Current queue depth, for the `callQueue.length > Q_MAX` check a
    /// caller may want to perform before even attempting to enqueue.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Pushes a call onto the back of the queue. Fails with
    /// [`CoreError::Closed`] if the VM has been closed, or
    /// [`CoreError::Capacity`] if the queue is already at `Q_MAX`.
    pub fn enqueue(&self, call: QueuedCall) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CoreError::Closed);
        }
        if inner.pending.len() >= self.capacity {
            return Err(CoreError::Capacity(format!(
                "call queue is at capacity ({})",
                self.capacity
            )));
        }
        inner.pending.push_back(call);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Waits for and pops the next call, or returns `None` once the queue
    /// has been closed and drained.
    pub async fn next(&self) -> Option<QueuedCall> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(call) = inner.pending.pop_front() {
                    return Some(call);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks the queue closed and drains whatever is still pending,
    /// handing each drained call back so the caller can fail it with
    /// [`CoreError::Closed`]. Any call already popped by [`Self::next`] and
    /// in flight is unaffected — it runs to completion.
    pub fn close(&self) -> Vec<QueuedCall> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let drained = inner.pending.drain(..).collect();
        drop(inner);
        self.notify.notify_waiters();
        drained
    }
}
