//! Convenience constructors for futures that settle against the loop.
//!
//! `resolve` and `reject` hand back a future whose settlement is scheduled on
//! the next loop iteration, never synchronously at the call site, so the
//! caller can attach continuations before the value is delivered. `wait` and
//! `wait_until` wrap a [`Timeout`] whose handle is owned by the returned
//! chain.

use std::time::{Duration, Instant};

use eddy_core::{Error, Future, Promise};

use crate::event_loop::Loop;
use crate::timer::Timeout;


/// A future fulfilled with `value` on the next loop iteration.
pub fn resolve<T: 'static>(lp: &Loop, value: T) -> Future<T> {
    let promise = Promise::new();
    let future = promise.future();
    lp.handle().schedule(Box::new(move || promise.resolve(value)));
    future
}

/// A future rejected with `error` on the next loop iteration.
pub fn reject<T: 'static>(lp: &Loop, error: Error) -> Future<T> {
    let promise = Promise::new();
    let future = promise.future();
    lp.handle().schedule(Box::new(move || promise.reject(error)));
    future
}

/// A future fulfilled after `delay`. A zero delay fires on the next loop
/// iteration.
pub fn wait(lp: &Loop, delay: Duration) -> Future<()> {
    let timeout = Timeout::new(lp);
    let fired = timeout.start(delay);
    // The handle rides along in the continuation so it lives until the timer
    // fires.
    fired.map(move |()| drop(timeout))
}

/// A future fulfilled at `deadline` (or on the next iteration when the
/// deadline has already passed).
pub fn wait_until(lp: &Loop, deadline: Instant) -> Future<()> {
    wait(lp, deadline.saturating_duration_since(Instant::now()))
}
