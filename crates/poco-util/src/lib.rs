//! Event primitives shared across the poco stack.
//!
//! Connections in `poco-net` are event-driven: callers register listeners,
//! await one-shot events with a deadline, and choose whether a listener runs
//! inline or on the next deferred drain. This crate holds those primitives,
//! free of any networking:
//!
//! - [`EventDispatcher`]: string-keyed pub/sub with callback identity.
//! - [`DeferQueue`]: explicit queue backing the deferred dispatch mode.
//! - [`WaitError`]: why a one-shot wait ended without a payload.

mod defer;
mod dispatcher;

pub use defer::DeferQueue;
pub use dispatcher::{Callback, DispatchMode, EventDispatcher, OnceOptions, WaitError};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
