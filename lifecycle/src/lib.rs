//! Abort signals and once-only teardown for Tether resources.
//!
//! - [`signal`]: one-shot [`AbortSignal`]s with a reason, merging via
//!   [`AbortSignal::any`], and the cancellable [`delay`].
//! - [`resource`]: the [`Lifecycle`] a resource delegates its close signal,
//!   teardown stack, and cancellable tasks to.

pub mod resource;
pub mod signal;

pub use resource::{Closing, Lifecycle};
pub use signal::{AbortController, AbortRegistration, AbortSignal, delay};
