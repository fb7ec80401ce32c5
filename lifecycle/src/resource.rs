//! Resource lifecycle: close signal, teardown stack, and tracked tasks.
//!
//! A [`Lifecycle`] is the single authority over when a resource closes. Closing
//! aborts the close signal first, then runs every registered teardown action
//! exactly once, last registered first. Every caller of [`Lifecycle::close`],
//! concurrent or late, observes the same outcome.

use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tether_types::{AbortReason, Error};
use tokio::runtime::Handle;

use crate::signal::{AbortController, AbortSignal};

/// The shared outcome of closing a resource.
pub type Closing = Shared<BoxFuture<'static, Result<(), Error>>>;

type Teardown = Box<dyn FnOnce(Option<AbortReason>) -> BoxFuture<'static, Result<(), Error>> + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where the resource is in its life. Teardown actions live in `Open`; once
/// closing starts they have been moved into the shared outcome.
enum CloseState {
    Open {
        teardown: Vec<Teardown>,
    },
    Closing {
        reason: Option<AbortReason>,
        outcome: Closing,
    },
}

struct LifecycleInner {
    label: String,
    controller: AbortController,
    state: Mutex<CloseState>,
    pending_tasks: AtomicUsize,
}

/// Close coordination for one resource. Clones share the same lifecycle.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<LifecycleInner>,
}

impl Lifecycle {
    /// `label` identifies the resource in logs.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                label: label.into(),
                controller: AbortController::new(),
                state: Mutex::new(CloseState::Open {
                    teardown: Vec::new(),
                }),
                pending_tasks: AtomicUsize::new(0),
            }),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Fires once, when closing starts.
    #[must_use]
    pub fn signal(&self) -> &AbortSignal {
        self.inner.controller.signal()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.signal().is_aborted()
    }

    /// Fail fast with [`Error::Closed`] once closing has started.
    pub fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// The reason passed to the first `close`; `None` while open or when the
    /// close was graceful.
    #[must_use]
    pub fn close_reason(&self) -> Option<AbortReason> {
        match &*lock(&self.inner.state) {
            CloseState::Open { .. } => None,
            CloseState::Closing { reason, .. } => reason.clone(),
        }
    }

    /// Resolve with the close reason once closing starts.
    pub async fn closed(&self) -> Option<AbortReason> {
        self.signal().cancelled().await;
        self.close_reason()
    }

    /// Register a teardown action. It receives the close reason and runs once,
    /// before any action registered earlier.
    pub fn add_teardown<F, Fut>(&self, teardown: F) -> Result<(), Error>
    where
        F: FnOnce(Option<AbortReason>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        match &mut *lock(&self.inner.state) {
            CloseState::Open { teardown: stack } => {
                stack.push(Box::new(move |reason| teardown(reason).boxed()));
                Ok(())
            }
            CloseState::Closing { .. } => Err(Error::Closed),
        }
    }

    /// Start closing, or join the close already under way.
    ///
    /// The close signal is aborted before this returns. Inside a tokio runtime
    /// the teardown is driven to completion even if the returned future is
    /// dropped; the future resolves once every teardown action has run, with the
    /// first teardown error if any failed.
    pub fn close(&self, reason: Option<AbortReason>) -> Closing {
        let outcome = {
            let mut state = lock(&self.inner.state);
            let stack = match &mut *state {
                CloseState::Closing { outcome, .. } => return outcome.clone(),
                CloseState::Open { teardown } => mem::take(teardown),
            };
            let outcome =
                run_teardown(self.inner.label.clone(), stack, reason.clone()).boxed().shared();
            *state = CloseState::Closing {
                reason: reason.clone(),
                outcome: outcome.clone(),
            };
            outcome
        };

        tracing::debug!(
            resource = %self.inner.label,
            reason = ?reason,
            pending_tasks = self.pending_tasks(),
            "Closing"
        );
        self.inner.controller.abort(reason.unwrap_or_default());

        if let Ok(handle) = Handle::try_current() {
            let driver = outcome.clone();
            handle.spawn(async move {
                let _ = driver.await;
            });
        }
        outcome
    }

    /// Run `task` with a signal that aborts when this resource closes or when
    /// `signal` aborts, whichever comes first.
    ///
    /// The merged signal is created and the task counted before this returns;
    /// `task` itself runs when the future is first polled. Once the task ends,
    /// or its future is dropped, the merged signal detaches from both sources.
    pub fn run_task<T, F, Fut>(
        &self,
        signal: Option<&AbortSignal>,
        task: F,
    ) -> impl Future<Output = Result<T, Error>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let (scope, merged) = match signal {
            Some(signal) => {
                let merged = AbortSignal::any([self.signal(), signal]);
                (merged.clone(), Some(merged))
            }
            None => (self.signal().clone(), None),
        };
        let tracked = TrackedTask::enter(&self.inner, merged);
        async move {
            let _tracked = tracked;
            task(scope).await
        }
    }

    /// Tasks started with [`run_task`](Self::run_task) that have not finished.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.inner.pending_tasks.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}

async fn run_teardown(
    label: String,
    stack: Vec<Teardown>,
    reason: Option<AbortReason>,
) -> Result<(), Error> {
    let mut first_error = None;
    for teardown in stack.into_iter().rev() {
        if let Err(err) = teardown(reason.clone()).await {
            if first_error.is_none() {
                first_error = Some(err);
            } else {
                tracing::warn!(resource = %label, "Additional teardown failure: {err}");
            }
        }
    }
    tracing::debug!(resource = %label, failed = first_error.is_some(), "Teardown complete");
    first_error.map_or(Ok(()), Err)
}

/// Counts a running task and releases its merged signal when the task ends.
struct TrackedTask {
    inner: Arc<LifecycleInner>,
    merged: Option<AbortSignal>,
}

impl TrackedTask {
    fn enter(inner: &Arc<LifecycleInner>, merged: Option<AbortSignal>) -> Self {
        inner.pending_tasks.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(inner),
            merged,
        }
    }
}

impl Drop for TrackedTask {
    fn drop(&mut self) {
        if let Some(merged) = self.merged.take() {
            merged.detach();
        }
        self.inner.pending_tasks.fetch_sub(1, Ordering::AcqRel);
    }
}
