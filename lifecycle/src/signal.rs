//! One-shot abort signals.
//!
//! An [`AbortController`] owns the right to abort; the [`AbortSignal`] it hands
//! out can be cloned freely and observed either synchronously
//! ([`AbortSignal::on_abort`]) or asynchronously ([`AbortSignal::cancelled`]).
//! A signal aborts at most once and keeps the first reason forever.

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use tether_types::{AbortReason, Error};
use tokio_util::sync::CancellationToken;

type Callback = Box<dyn FnOnce(&AbortReason) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

#[derive(Default)]
struct SignalInner {
    /// Written under the `callbacks` lock so registration cannot miss an abort.
    reason: OnceLock<AbortReason>,
    token: CancellationToken,
    callbacks: Mutex<Callbacks>,
    /// Registrations a merged signal holds on its sources.
    sources: Mutex<Vec<AbortRegistration>>,
}

impl SignalInner {
    fn abort(&self, reason: AbortReason) -> bool {
        let callbacks = {
            let mut callbacks = lock(&self.callbacks);
            if self.reason.set(reason).is_err() {
                return false;
            }
            mem::take(&mut callbacks.entries)
        };

        let sources = mem::take(&mut *lock(&self.sources));
        for registration in sources {
            registration.unregister();
        }

        self.token.cancel();

        if let Some(reason) = self.reason.get() {
            for (_, callback) in callbacks {
                callback(reason);
            }
        }
        true
    }
}

/// Owner side of an abort signal.
#[derive(Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Abort the signal. Returns `false` if it was already aborted, in which case
    /// the original reason is kept.
    pub fn abort(&self, reason: AbortReason) -> bool {
        self.signal.inner.abort(reason)
    }
}

impl fmt::Debug for AbortController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortController")
            .field("signal", &self.signal)
            .finish()
    }
}

/// Observer side of an abort signal. Clones observe the same signal.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

impl AbortSignal {
    /// A signal that is already aborted with `reason`.
    #[must_use]
    pub fn aborted(reason: AbortReason) -> Self {
        let signal = Self::default();
        signal.inner.abort(reason);
        signal
    }

    /// A signal that aborts with [`AbortReason::TimedOut`] once `duration` elapses.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        let signal = Self::default();
        let target = Arc::downgrade(&signal.inner);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(inner) = target.upgrade() {
                inner.abort(AbortReason::TimedOut);
            }
        });
        signal
    }

    /// A signal that aborts as soon as any of `signals` does, with that signal's
    /// reason.
    ///
    /// If one of them is already aborted the result is aborted too. Once the merged
    /// signal fires, its registrations on the remaining sources are removed.
    pub fn any<'a>(signals: impl IntoIterator<Item = &'a AbortSignal>) -> Self {
        let signals: Vec<&AbortSignal> = signals.into_iter().collect();
        if let Some(reason) = signals.iter().find_map(|signal| signal.reason()) {
            return Self::aborted(reason);
        }

        let merged = Self::default();
        for source in signals {
            let target = Arc::clone(&merged.inner);
            let registration = source.on_abort(move |reason| {
                target.abort(reason.clone());
            });
            lock(&merged.inner.sources).push(registration);
        }

        // A source may have fired while we were still registering on the others.
        if merged.is_aborted() {
            for registration in mem::take(&mut *lock(&merged.inner.sources)) {
                registration.unregister();
            }
        }
        merged
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    #[must_use]
    pub fn reason(&self) -> Option<AbortReason> {
        self.inner.reason.get().cloned()
    }

    /// `Err` with the abort reason if the signal has fired.
    pub fn check(&self) -> Result<(), Error> {
        match self.reason() {
            Some(reason) => Err(Error::from(reason)),
            None => Ok(()),
        }
    }

    /// Run `callback` once when the signal aborts.
    ///
    /// If the signal is already aborted the callback runs immediately, on the
    /// calling thread, and the returned registration is inert.
    pub fn on_abort<F>(&self, callback: F) -> AbortRegistration
    where
        F: FnOnce(&AbortReason) + Send + 'static,
    {
        {
            let mut callbacks = lock(&self.inner.callbacks);
            if self.inner.reason.get().is_none() {
                let id = callbacks.next_id;
                callbacks.next_id += 1;
                callbacks.entries.push((id, Box::new(callback)));
                return AbortRegistration {
                    signal: Arc::downgrade(&self.inner),
                    id,
                };
            }
        }

        if let Some(reason) = self.inner.reason.get() {
            callback(reason);
        }
        AbortRegistration::inert()
    }

    /// Resolve with the reason once the signal aborts.
    pub async fn cancelled(&self) -> AbortReason {
        self.inner.token.cancelled().await;
        self.reason().unwrap_or_default()
    }

    /// Number of pending `on_abort` callbacks.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        lock(&self.inner.callbacks).entries.len()
    }

    /// Stop following the sources of a signal built with [`any`](Self::any).
    ///
    /// The signal keeps its current state and will no longer abort because a
    /// source does. A no-op for signals that were not merged.
    pub fn detach(&self) {
        let sources = mem::take(&mut *lock(&self.inner.sources));
        for registration in sources {
            registration.unregister();
        }
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("reason", &self.inner.reason.get())
            .finish_non_exhaustive()
    }
}

/// Handle to a callback registered with [`AbortSignal::on_abort`].
///
/// Dropping it keeps the callback registered; call [`unregister`](Self::unregister)
/// to remove it early.
#[derive(Debug)]
pub struct AbortRegistration {
    signal: Weak<SignalInner>,
    id: u64,
}

impl AbortRegistration {
    fn inert() -> Self {
        Self {
            signal: Weak::new(),
            id: 0,
        }
    }

    /// Remove the callback. Returns `false` if it already ran or was removed.
    pub fn unregister(self) -> bool {
        let Some(inner) = self.signal.upgrade() else {
            return false;
        };
        let mut callbacks = lock(&inner.callbacks);
        let before = callbacks.entries.len();
        callbacks.entries.retain(|(id, _)| *id != self.id);
        callbacks.entries.len() != before
    }
}

/// Wait for `duration`, or fail with the reason if `signal` aborts first.
///
/// A zero duration yields to the scheduler once instead of arming a timer.
/// An already-aborted signal fails without waiting.
pub async fn delay(duration: Duration, signal: Option<&AbortSignal>) -> Result<(), AbortReason> {
    let Some(signal) = signal else {
        pause(duration).await;
        return Ok(());
    };
    if let Some(reason) = signal.reason() {
        return Err(reason);
    }

    tokio::select! {
        biased;
        reason = signal.cancelled() => Err(reason),
        () = pause(duration) => Ok(()),
    }
}

async fn pause(duration: Duration) {
    if duration.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(duration).await;
    }
}
