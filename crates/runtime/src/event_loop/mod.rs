//! The event loop: a mio poller plus three scheduling lanes (timers, a
//! next-tick queue and idle callbacks).
//!
//! [`Loop::run`] drains all four until nothing registered can fire anymore,
//! then returns. Promises settled from reactor callbacks run their
//! continuations on the loop thread, inside the iteration that fired them.
//! The loop is not `Send`; thread affinity is structural.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use eddy_core::{Error, ErrorKind};
use mio::{Events, Poll, Registry, Token};
use slab::Slab;
use tracing::{debug, error};

#[cfg(test)]
mod tests;

pub(crate) type TickCallback = Box<dyn FnOnce()>;
pub(crate) type IdleCallback = Box<dyn FnMut()>;

/// A timer registration. One-shot entries are consumed when they fire;
/// repeating entries advance their deadline from the previous deadline so
/// interval drift does not accumulate.
struct TimerEntry {
    deadline: Instant,
    period: Option<Duration>,
    callback: TimerCallback,
}

pub(crate) enum TimerCallback {
    Once(TickCallback),
    Repeat(Rc<RefCell<Option<IdleCallback>>>),
}

/// An idle registration; the callback slot is shared so it can be taken for
/// the duration of a call without holding the table borrowed.
struct IdleEntry {
    callback: Rc<RefCell<Option<IdleCallback>>>,
}

/// Readiness observer for one registered I/O source. Callbacks are one-shot:
/// a primitive arms them again after each `WouldBlock`.
#[derive(Default)]
struct IoEntry {
    readable: Option<TickCallback>,
    writable: Option<TickCallback>,
}

/// The event loop. Owns the reactor; drives every handle created against it.
///
/// A loop is bound to the thread that runs it and may be re-entered with
/// further `run` calls once `run` returns. A reactor-level failure makes the
/// loop unusable: the failed `run` reports the error and later runs are
/// refused.
pub struct Loop {
    inner: Rc<Inner>,
}

impl Loop {
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new().map_err(|e| Error::from_io(ErrorKind::Stream, &e))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|e| Error::from_io(ErrorKind::Stream, &e))?;
        Ok(Loop {
            inner: Rc::new(Inner {
                poll: RefCell::new(poll),
                registry,
                running: Cell::new(false),
                broken: Cell::new(false),
                timers: RefCell::new(Slab::new()),
                idles: RefCell::new(Slab::new()),
                pending: RefCell::new(VecDeque::new()),
                ios: RefCell::new(Slab::new()),
            }),
        })
    }

    /// Drains the reactor, returning once every registered handle is
    /// inactive. Calling `run` from inside a loop callback is a programming
    /// error.
    pub fn run(&self) -> Result<(), Error> {
        self.inner.run()
    }

    /// The underlying reactor registry, for primitives that register their
    /// own sources.
    pub fn lowest_layer(&self) -> &Registry {
        &self.inner.registry
    }

    pub(crate) fn handle(&self) -> LoopHandle {
        LoopHandle {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Owning reference to a loop, held by every handle registered with it.
#[derive(Clone)]
pub(crate) struct LoopHandle {
    inner: Rc<Inner>,
}

impl LoopHandle {
    /// Queues a callback for the next loop iteration.
    pub(crate) fn schedule(&self, callback: TickCallback) {
        self.inner.pending.borrow_mut().push_back(callback);
    }

    pub(crate) fn add_timer(
        &self,
        deadline: Instant,
        period: Option<Duration>,
        callback: TimerCallback,
    ) -> usize {
        self.inner.timers.borrow_mut().insert(TimerEntry {
            deadline,
            period,
            callback,
        })
    }

    /// Drops a timer registration. Idempotent against already fired one-shot
    /// entries because those remove themselves.
    pub(crate) fn cancel_timer(&self, id: usize) {
        let _ = self.inner.timers.borrow_mut().try_remove(id);
    }

    pub(crate) fn add_idle(&self, callback: IdleCallback) -> usize {
        self.inner.idles.borrow_mut().insert(IdleEntry {
            callback: Rc::new(RefCell::new(Some(callback))),
        })
    }

    pub(crate) fn remove_idle(&self, id: usize) {
        let _ = self.inner.idles.borrow_mut().try_remove(id);
    }

    /// Registers an I/O source for both readiness directions and returns its
    /// observer slot.
    pub(crate) fn register_io<S>(&self, source: &mut S) -> io::Result<usize>
    where
        S: mio::event::Source + ?Sized,
    {
        let id = self.inner.ios.borrow_mut().insert(IoEntry::default());
        let interests = mio::Interest::READABLE | mio::Interest::WRITABLE;
        if let Err(err) = self.inner.registry.register(source, Token(id), interests) {
            self.inner.ios.borrow_mut().remove(id);
            return Err(err);
        }
        Ok(id)
    }

    pub(crate) fn deregister_io<S>(&self, id: usize, source: &mut S)
    where
        S: mio::event::Source + ?Sized,
    {
        self.inner.ios.borrow_mut().try_remove(id);
        if let Err(err) = self.inner.registry.deregister(source) {
            debug!(error = %err, "failed to deregister reactor source");
        }
    }

    /// Arms a one-shot callback for the next readable edge of `id`. Arm only
    /// after a fresh `WouldBlock`, or the edge may already have passed.
    pub(crate) fn arm_readable(&self, id: usize, callback: TickCallback) {
        if let Some(entry) = self.inner.ios.borrow_mut().get_mut(id) {
            entry.readable = Some(callback);
        }
    }

    /// Arms a one-shot callback for the next writable edge of `id`.
    pub(crate) fn arm_writable(&self, id: usize, callback: TickCallback) {
        if let Some(entry) = self.inner.ios.borrow_mut().get_mut(id) {
            entry.writable = Some(callback);
        }
    }
}

struct Inner {
    poll: RefCell<Poll>,
    registry: Registry,
    running: Cell<bool>,
    broken: Cell<bool>,
    timers: RefCell<Slab<TimerEntry>>,
    idles: RefCell<Slab<IdleEntry>>,
    pending: RefCell<VecDeque<TickCallback>>,
    ios: RefCell<Slab<IoEntry>>,
}

impl Inner {
    fn run(&self) -> Result<(), Error> {
        if self.broken.get() {
            return Err(Error::new(
                ErrorKind::InvalidState,
                0,
                "the loop failed previously and can no longer run",
            ));
        }
        if self.running.get() {
            panic!("Loop::run called re-entrantly from a loop callback");
        }
        self.running.set(true);
        let result = self.turn_until_drained();
        self.running.set(false);
        if result.is_err() {
            self.broken.set(true);
        }
        result
    }

    fn turn_until_drained(&self) -> Result<(), Error> {
        let mut events = Events::with_capacity(256);
        loop {
            let now = Instant::now();
            self.run_due_timers(now);
            self.run_pending();
            self.run_idles();

            if !self.has_work() {
                return Ok(());
            }

            let timeout = self.poll_timeout();
            match self.poll.borrow_mut().poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(error = %err, "reactor poll failed; the loop is now unusable");
                    return Err(Error::from_io(ErrorKind::Stream, &err));
                }
            }
            self.dispatch(&events);
        }
    }

    /// How long the poll may sleep: not at all while idle or next-tick work
    /// is queued, until the nearest deadline when timers are armed, and
    /// indefinitely when only I/O can wake us.
    fn poll_timeout(&self) -> Option<Duration> {
        if !self.pending.borrow().is_empty() || !self.idles.borrow().is_empty() {
            return Some(Duration::ZERO);
        }
        let nearest = self
            .timers
            .borrow()
            .iter()
            .map(|(_, entry)| entry.deadline)
            .min();
        nearest.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn has_work(&self) -> bool {
        !self.timers.borrow().is_empty()
            || !self.idles.borrow().is_empty()
            || !self.pending.borrow().is_empty()
            || self
                .ios
                .borrow()
                .iter()
                .any(|(_, entry)| entry.readable.is_some() || entry.writable.is_some())
    }

    /// Fires every timer whose deadline has passed, in deadline order. The
    /// callback runs with no table borrow held, so it may register or cancel
    /// timers freely.
    fn run_due_timers(&self, now: Instant) {
        loop {
            let due = self
                .timers
                .borrow()
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .min_by_key(|(_, entry)| entry.deadline)
                .map(|(id, _)| id);
            let Some(id) = due else { return };

            let is_once = matches!(
                self.timers.borrow()[id].callback,
                TimerCallback::Once(_)
            );
            if is_once {
                let entry = self.timers.borrow_mut().remove(id);
                match entry.callback {
                    TimerCallback::Once(callback) => callback(),
                    TimerCallback::Repeat(_) => unreachable!(),
                }
            } else {
                let slot = {
                    let mut timers = self.timers.borrow_mut();
                    let entry = &mut timers[id];
                    let period = entry.period.expect("repeating timer without a period");
                    entry.deadline += period;
                    if entry.deadline <= now {
                        // The loop fell behind; reschedule from now instead
                        // of bursting to catch up.
                        entry.deadline = now + period;
                    }
                    match &entry.callback {
                        TimerCallback::Repeat(slot) => Rc::clone(slot),
                        TimerCallback::Once(_) => unreachable!(),
                    }
                };
                // Taken out of the slot for the duration of the call, so the
                // callback can cancel its own registration.
                let taken = slot.borrow_mut().take();
                if let Some(mut callback) = taken {
                    callback();
                    *slot.borrow_mut() = Some(callback);
                }
            }
        }
    }

    /// Drains the next-tick queue as it stood at the start of this phase.
    /// Callbacks scheduled while draining run on the next iteration.
    fn run_pending(&self) {
        let batch = std::mem::take(&mut *self.pending.borrow_mut());
        for callback in batch {
            callback();
        }
    }

    /// Runs every active idle callback once.
    fn run_idles(&self) {
        let snapshot: Vec<(usize, Rc<RefCell<Option<IdleCallback>>>)> = self
            .idles
            .borrow()
            .iter()
            .map(|(id, entry)| (id, Rc::clone(&entry.callback)))
            .collect();
        for (id, slot) in snapshot {
            let still_registered = self
                .idles
                .borrow()
                .get(id)
                .is_some_and(|entry| Rc::ptr_eq(&entry.callback, &slot));
            if !still_registered {
                continue;
            }
            let taken = slot.borrow_mut().take();
            if let Some(mut callback) = taken {
                callback();
                *slot.borrow_mut() = Some(callback);
            }
        }
    }

    fn dispatch(&self, events: &Events) {
        let mut ready: Vec<TickCallback> = Vec::new();
        {
            let mut ios = self.ios.borrow_mut();
            for event in events.iter() {
                let Token(id) = event.token();
                let Some(entry) = ios.get_mut(id) else { continue };
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    if let Some(callback) = entry.readable.take() {
                        ready.push(callback);
                    }
                }
                if event.is_writable() || event.is_write_closed() || event.is_error() {
                    if let Some(callback) = entry.writable.take() {
                        ready.push(callback);
                    }
                }
            }
        }
        for callback in ready {
            callback();
        }
    }
}
