use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task;
use std::time::Duration;

use async_broadcast::{Receiver, Sender};
use futures_core::Stream;
use futures_lite::FutureExt;
use futures_timer::Delay;
use tracing::debug;

use crate::bridge::{Reply, RequestId};
use crate::util::lock;

/// Why the core resolved a request before the bridge replied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Abort {
    /// The caller, or a disconnect, gave up on the request.
    Cancelled,
    /// The link dropped underneath the request.
    LinkLost,
    /// The session the request belonged to is gone.
    Invalidated,
    /// The session was shut down.
    Detached,
}

pub(crate) type Outcome = Result<Reply, Abort>;

/// Table of requests waiting for their bridge reply, keyed by request identity.
///
/// Every registered request resolves exactly once: by [`complete`][Self::complete], by [`abort`][Self::abort],
/// or by being dropped. Whatever arrives for an id that is no longer in the table is discarded.
#[derive(Clone)]
pub(crate) struct PendingCalls {
    inner: Arc<Mutex<PendingInner>>,
}

struct PendingInner {
    next_id: u64,
    waiting: HashMap<RequestId, async_channel::Sender<Outcome>>,
    closed: bool,
}

pub(crate) struct PendingReply {
    id: RequestId,
    receiver: async_channel::Receiver<Outcome>,
    table: Weak<Mutex<PendingInner>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        PendingCalls {
            inner: Arc::new(Mutex::new(PendingInner {
                next_id: 1,
                waiting: HashMap::new(),
                closed: false,
            })),
        }
    }

    /// Reserves a fresh request id. Returns `None` once the table is closed.
    pub fn register(&self) -> Option<PendingReply> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return None;
        }
        let id = RequestId(inner.next_id);
        inner.next_id += 1;
        let (sender, receiver) = async_channel::bounded(1);
        inner.waiting.insert(id, sender);
        Some(PendingReply {
            id,
            receiver,
            table: Arc::downgrade(&self.inner),
        })
    }

    /// Delivers the bridge reply for `id`. Returns `false` if nobody is waiting for it any more.
    pub fn complete(&self, id: RequestId, reply: Reply) -> bool {
        self.resolve(id, Ok(reply))
    }

    /// Resolves `id` without a bridge reply.
    pub fn abort(&self, id: RequestId, cause: Abort) -> bool {
        self.resolve(id, Err(cause))
    }

    fn resolve(&self, id: RequestId, outcome: Outcome) -> bool {
        let sender = lock(&self.inner).waiting.remove(&id);
        match sender {
            Some(sender) => sender.try_send(outcome).is_ok(),
            None => {
                debug!("dropping outcome for unknown request {id}: {outcome:?}");
                false
            }
        }
    }

    /// Resolves everything still waiting with [`Abort::Detached`] and refuses further registrations.
    pub fn close(&self) {
        let waiting = {
            let mut inner = lock(&self.inner);
            inner.closed = true;
            std::mem::take(&mut inner.waiting)
        };
        for (_, sender) in waiting {
            let _ = sender.try_send(Err(Abort::Detached));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        lock(&self.inner).waiting.len()
    }
}

impl PendingReply {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the outcome of the request.
    pub async fn wait(self) -> Outcome {
        self.receiver.recv().await.unwrap_or(Err(Abort::Detached))
    }

    /// Waits for the outcome of the request, or `None` once `timeout` expires. The request is forgotten either
    /// way, so a reply arriving after the timeout is discarded.
    pub async fn wait_with_timeout(self, timeout: Duration) -> Option<Outcome> {
        with_timeout(timeout, self.wait()).await
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            lock(&table).waiting.remove(&self.id);
        }
    }
}

/// Longest wait the timer accepts. Longer timeouts are clamped so the deadline stays representable.
const MAX_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Runs `future` to completion unless `timeout` expires first.
pub(crate) async fn with_timeout<T>(timeout: Duration, future: impl Future<Output = T>) -> Option<T> {
    let timeout = timeout.min(MAX_TIMEOUT);
    async { Some(future.await) }
        .or(async {
            Delay::new(timeout).await;
            None
        })
        .await
}

/// Fans values out to every live [`NotifierReceiver`].
pub(crate) struct Notifier<T: Send + Clone> {
    capacity: usize,
    inner: Mutex<Weak<NotifierInner<T>>>,
}

struct NotifierInner<T: Send + Clone> {
    sender: Sender<Option<T>>,
    on_stop: Box<dyn Fn() + Send + Sync + 'static>,
}

/// Stream of values from a [`Notifier`]. Ends when the notifier is closed or dropped.
pub struct NotifierReceiver<T: Send + Clone> {
    holder: Option<Arc<NotifierInner<T>>>,
    receiver: Receiver<Option<T>>,
}

impl<T: Send + Clone> Notifier<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Weak::new()),
        }
    }

    /// Joins the active notifier, if there is one.
    pub fn join(&self) -> Option<NotifierReceiver<T>> {
        let inner = lock(&self.inner).upgrade()?;
        let receiver = inner.sender.new_receiver();
        Some(NotifierReceiver {
            holder: Some(inner),
            receiver,
        })
    }

    /// Joins the active notifier or activates a new one. `on_stop` runs when the last receiver of a newly
    /// activated notifier goes away; it is discarded if the notifier was already active.
    pub fn subscribe_with(&self, on_stop: impl Fn() + Send + Sync + 'static) -> NotifierReceiver<T> {
        let mut guard = lock(&self.inner);
        if let Some(inner) = guard.upgrade() {
            let receiver = inner.sender.new_receiver();
            return NotifierReceiver {
                holder: Some(inner),
                receiver,
            };
        }
        let (mut sender, receiver) = async_broadcast::broadcast(self.capacity);
        sender.set_overflow(true);
        let inner = Arc::new(NotifierInner {
            sender,
            on_stop: Box::new(on_stop),
        });
        *guard = Arc::downgrade(&inner);
        NotifierReceiver {
            holder: Some(inner),
            receiver,
        }
    }

    pub fn subscribe(&self) -> NotifierReceiver<T> {
        self.subscribe_with(|| ())
    }

    /// Sends `value` to every live receiver. Returns `false` if there was none.
    pub fn notify(&self, value: T) -> bool {
        let inner = lock(&self.inner).upgrade();
        match inner {
            Some(inner) => inner.sender.try_broadcast(Some(value)).is_ok(),
            None => false,
        }
    }

    /// Ends every live receiver's stream. A later subscription starts a fresh notifier.
    pub fn close(&self) {
        let inner = std::mem::take(&mut *lock(&self.inner)).upgrade();
        if let Some(inner) = inner {
            let _ = inner.sender.try_broadcast(None);
        }
    }
}

impl<T: Send + Clone> Drop for Notifier<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Send + Clone> Drop for NotifierInner<T> {
    fn drop(&mut self) {
        (self.on_stop)()
    }
}

impl<T: Send + Clone> Stream for NotifierReceiver<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Option<T>> {
        if self.holder.is_none() {
            return task::Poll::Ready(None);
        }
        match Pin::new(&mut self.receiver).poll_next(cx) {
            task::Poll::Ready(Some(Some(value))) => task::Poll::Ready(Some(value)),
            task::Poll::Ready(_) => {
                let _ = self.holder.take();
                task::Poll::Ready(None)
            }
            task::Poll::Pending => task::Poll::Pending,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.holder.is_none() {
            (0, Some(0))
        } else {
            self.receiver.size_hint()
        }
    }
}

impl<T: Send + Clone> std::fmt::Debug for NotifierReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierReceiver")
            .field("closed", &self.holder.is_none())
            .finish()
    }
}
