//! Timer handles: [`Idle`] fires a callback on every loop iteration while
//! active; [`Timeout`] fires once after a delay or repeatedly at an interval.
//!
//! Handles are cheap to clone; clones share the registration, so a callback
//! can capture a clone of its own handle and stop it from inside the loop:
//!
//! ```no_run
//! use eddy_runtime::{Idle, Loop};
//!
//! let lp = Loop::new().unwrap();
//! let idle = Idle::new(&lp);
//! let handle = idle.clone();
//! let mut ticks = 0u32;
//! idle.start(move || {
//!     ticks += 1;
//!     if ticks == 10 {
//!         handle.stop();
//!     }
//! });
//! lp.run().unwrap();
//! ```

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use eddy_core::{Future, Promise};

use crate::event_loop::{Loop, LoopHandle, TimerCallback};

#[cfg(test)]
mod tests;

/// A handle whose callback runs once per loop iteration while active.
///
/// Used for cooperative polling and yield points. While any idle handle is
/// active the loop never sleeps.
#[derive(Clone)]
pub struct Idle {
    loop_: LoopHandle,
    shared: Rc<IdleShared>,
}

struct IdleShared {
    registration: Cell<Option<usize>>,
}

impl Idle {
    pub fn new(lp: &Loop) -> Self {
        Idle {
            loop_: lp.handle(),
            shared: Rc::new(IdleShared {
                registration: Cell::new(None),
            }),
        }
    }

    /// Starts invoking `callback` on every loop iteration. Starting an
    /// already active idle handle is a programming error.
    #[track_caller]
    pub fn start<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        if self.shared.registration.get().is_some() {
            panic!("idle handle is already started");
        }
        let id = self.loop_.add_idle(Box::new(callback));
        self.shared.registration.set(Some(id));
    }

    /// Stops the callback from firing again. Idempotent.
    pub fn stop(&self) {
        if let Some(id) = self.shared.registration.take() {
            self.loop_.remove_idle(id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.registration.get().is_some()
    }
}

impl Drop for Idle {
    fn drop(&mut self) {
        if Rc::strong_count(&self.shared) == 1 {
            self.stop();
        }
    }
}

/// A timer handle: one-shot via [`start`](Timeout::start), repeating via
/// [`repeat`](Timeout::repeat).
#[derive(Clone)]
pub struct Timeout {
    loop_: LoopHandle,
    shared: Rc<TimeoutShared>,
}

struct TimeoutShared {
    registration: Cell<Option<usize>>,
    /// The promise behind an outstanding one-shot future. Kept here so that
    /// `stop` leaves the future forever pending instead of breaking it.
    promise: RefCell<Option<Promise<()>>>,
}

impl Timeout {
    pub fn new(lp: &Loop) -> Self {
        Timeout {
            loop_: lp.handle(),
            shared: Rc::new(TimeoutShared {
                registration: Cell::new(None),
                promise: RefCell::new(None),
            }),
        }
    }

    /// Schedules a single shot after `delay` and returns the future it
    /// resolves. A zero delay fires on the next loop iteration, never
    /// synchronously. Starting an active timeout cancels the previous
    /// schedule; its outstanding future is rejected as a broken promise.
    pub fn start(&self, delay: Duration) -> Future<()> {
        self.cancel();
        let stale = self.shared.promise.borrow_mut().take();
        // Dropped outside the borrow: breaking the stale promise runs its
        // rejection continuation, which may touch this handle again.
        drop(stale);

        let promise = Promise::new();
        let future = promise.future();
        *self.shared.promise.borrow_mut() = Some(promise);

        let shared = Rc::clone(&self.shared);
        let id = self.loop_.add_timer(
            Instant::now() + delay,
            None,
            TimerCallback::Once(Box::new(move || {
                shared.registration.set(None);
                let fired = shared.promise.borrow_mut().take();
                if let Some(promise) = fired {
                    promise.resolve(());
                }
            })),
        );
        self.shared.registration.set(Some(id));
        future
    }

    /// Invokes `callback` every `interval`, passing a handle to this timeout
    /// so the callback can stop the repetition. There is no single resolution
    /// point, so no future is involved. The next deadline advances from the
    /// previous deadline, not from the callback's run time, so drift does not
    /// accumulate.
    pub fn repeat<F>(&self, interval: Duration, mut callback: F)
    where
        F: FnMut(&Timeout) + 'static,
    {
        self.cancel();
        let handle = self.clone();
        let id = self.loop_.add_timer(
            Instant::now() + interval,
            Some(interval),
            TimerCallback::Repeat(Rc::new(RefCell::new(Some(Box::new(move || {
                callback(&handle);
            }))))),
        );
        self.shared.registration.set(Some(id));
    }

    /// Cancels the schedule. A pending one-shot future never settles; the
    /// promise stays parked in the handle. Idempotent.
    pub fn stop(&self) {
        self.cancel();
    }

    pub fn is_active(&self) -> bool {
        self.shared.registration.get().is_some()
    }

    fn cancel(&self) {
        if let Some(id) = self.shared.registration.take() {
            self.loop_.cancel_timer(id);
        }
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        // Dropping the last handle tears the registration down; a parked
        // promise dropped with it rejects its future as broken.
        if Rc::strong_count(&self.shared) == 1 {
            self.cancel();
        }
    }
}
