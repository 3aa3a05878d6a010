//! Task plumbing: the spawn indirection, the abort signal handed to
//! data-source callbacks, and the cancellable operation owned by a query
//! while a request is in flight.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Spawn a task.
pub fn spawn<F>(future: F)
where
    F: Future + Send + 'static,
    F::Output: Send,
{
    tokio::spawn(future);
}

/// One-shot abort flag. A clone is handed to the embedder's callback through
/// the request context; the callback may poll it or await it to honour
/// cancellation (timeouts are the embedder's business).
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self { Self::default() }

    pub(crate) fn abort(&self) {
        if !self.inner.aborted.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_aborted(&self) -> bool { self.inner.aborted.load(Ordering::SeqCst) }

    pub async fn aborted(&self) {
        if self.is_aborted() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AbortSignal").field(&self.is_aborted()).finish()
    }
}

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// An in-flight asynchronous operation. A query holds at most one; starting a
/// new operation cancels the previous. Cancellation aborts the signal and
/// fires the registered callbacks exactly once; the driver task observes the
/// abort and discards its eventual result without touching query state.
pub(crate) struct Operation {
    id: u64,
    signal: AbortSignal,
    on_cancel: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Operation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            signal: AbortSignal::new(),
            on_cancel: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 { self.id }

    pub fn signal(&self) -> AbortSignal { self.signal.clone() }

    /// Register a callback fired once if this operation is cancelled. Fires
    /// immediately when the operation was already cancelled.
    pub fn on_cancelled(&self, f: impl FnOnce() + Send + 'static) {
        if self.signal.is_aborted() {
            f();
        } else {
            self.on_cancel.lock().expect("operation lock").push(Box::new(f));
        }
    }

    pub fn cancel(&self) {
        self.signal.abort();
        let hooks = std::mem::take(&mut *self.on_cancel.lock().expect("operation lock"));
        for hook in hooks {
            hook();
        }
    }
}

/// Await `fut` unless the signal aborts first. `None` means abandoned.
pub(crate) async fn abortable<T>(signal: &AbortSignal, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        _ = signal.aborted() => None,
        out = fut => Some(out),
    }
}
