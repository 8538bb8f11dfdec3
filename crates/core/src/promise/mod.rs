//! The deferred-value pair: a single-producer [`Promise`] and a
//! single-consumer [`Future`] bound to the same shared state.
//!
//! The pair needs no event loop: chains built purely in memory settle the
//! moment the root promise settles, with every continuation running
//! synchronously on the resolving thread. The runtime crate layers timers and
//! stream I/O on top by resolving promises from reactor callbacks.
//!
//! Continuations come in three shapes, distinguished by the handler's return:
//! [`Future::map`] for handlers returning a plain value, [`Future::then`] for
//! handlers returning another future (the result is flattened, not nested),
//! and [`Future::defer`] for handlers that take the fresh downstream promise
//! and settle it at an arbitrary later time.
//!
//! ## Example
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! use eddy_core::Promise;
//!
//! let answer = Rc::new(Cell::new(0));
//! let seen = Rc::clone(&answer);
//!
//! let promise = Promise::new();
//! // `map` infers the downstream value type from the handler's return.
//! promise.future().map(|()| 42).map(move |n| seen.set(n));
//! promise.resolve(());
//! assert_eq!(answer.get(), 42);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::error::Error;


type Continuation<T> = Box<dyn FnOnce(Result<T, Error>)>;

enum State<T> {
    Pending,
    Fulfilled(T),
    Rejected(Error),
    /// A settled result has already been handed to the continuation.
    Consumed,
}

impl<T> State<T> {
    fn is_finished(&self) -> bool {
        !matches!(self, State::Pending)
    }

    fn name(&self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Fulfilled(_) => "fulfilled",
            State::Rejected(_) => "rejected",
            State::Consumed => "consumed",
        }
    }
}

/// The cell owned jointly by a promise, its futures and any chained
/// descendants. Lives as long as the longest holder.
struct Shared<T: 'static> {
    state: State<T>,
    continuation: Option<Continuation<T>>,
    /// Closed once a continuation pair has been attached; stays closed even
    /// after the callback itself has been consumed.
    attached: bool,
}

impl<T: 'static> Shared<T> {
    fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Shared {
            state: State::Pending,
            continuation: None,
            attached: false,
        }))
    }
}

impl<T: 'static> Drop for Shared<T> {
    fn drop(&mut self) {
        if let State::Rejected(error) = &self.state {
            debug!(
                code = error.code(),
                message = error.message(),
                "unhandled rejection dropped"
            );
        }
    }
}

/// Commits the state transition, then runs the continuation outside the
/// borrow so a re-entrant continuation observes a fully settled cell.
#[track_caller]
fn settle<T: 'static>(cell: &Rc<RefCell<Shared<T>>>, result: Result<T, Error>, op: &str) {
    let callback = {
        let mut shared = cell.borrow_mut();
        if shared.state.is_finished() {
            panic!("cannot {op} a promise that is already {}", shared.state.name());
        }
        match shared.continuation.take() {
            Some(callback) => {
                shared.state = State::Consumed;
                callback
            }
            None => {
                shared.state = match result {
                    Ok(value) => State::Fulfilled(value),
                    Err(error) => State::Rejected(error),
                };
                return;
            }
        }
    };
    callback(result);
}

/// Installs the continuation, firing it synchronously when the state has
/// already settled.
#[track_caller]
fn attach<T: 'static>(cell: &Rc<RefCell<Shared<T>>>, callback: Continuation<T>) {
    let ready = {
        let mut shared = cell.borrow_mut();
        if shared.attached {
            panic!("a continuation is already attached to this future");
        }
        shared.attached = true;
        match std::mem::replace(&mut shared.state, State::Pending) {
            State::Pending => {
                shared.continuation = Some(callback);
                None
            }
            State::Fulfilled(value) => {
                shared.state = State::Consumed;
                Some((callback, Ok(value)))
            }
            State::Rejected(error) => {
                shared.state = State::Consumed;
                Some((callback, Err(error)))
            }
            State::Consumed => unreachable!("a consumed state implies an attached continuation"),
        }
    };
    if let Some((callback, result)) = ready {
        callback(result);
    }
}

/// The producer half of a deferred value.
///
/// Created pending; settled by exactly one of [`resolve`](Promise::resolve),
/// [`reject`](Promise::reject), [`reset`](Promise::reset) or the destructor.
/// Settling an already finished promise is a programming error and panics.
pub struct Promise<T: 'static = ()> {
    state: Rc<RefCell<Shared<T>>>,
}

impl<T: 'static> Promise<T> {
    pub fn new() -> Self {
        Promise {
            state: Shared::new(),
        }
    }

    /// Returns a future bound to the same shared state.
    ///
    /// May be called any number of times, but all returned futures share one
    /// continuation slot: attaching through one closes the slot for all.
    pub fn future(&self) -> Future<T> {
        Future {
            state: Rc::clone(&self.state),
        }
    }

    /// Transitions pending → fulfilled and runs any attached continuation
    /// synchronously before returning.
    #[track_caller]
    pub fn resolve(&self, value: T) {
        settle(&self.state, Ok(value), "resolve");
    }

    /// Transitions pending → rejected and runs any attached rejection
    /// continuation synchronously before returning.
    #[track_caller]
    pub fn reject(&self, error: Error) {
        settle(&self.state, Err(error), "reject");
    }

    /// Swaps in a fresh pending state. Futures already handed out keep
    /// observing the old state; continuations stored there no longer fire
    /// from this promise.
    pub fn reset(&mut self) {
        self.state = Shared::new();
    }

    /// True once the state is fulfilled or rejected.
    pub fn is_finished(&self) -> bool {
        self.state.borrow().state.is_finished()
    }
}

impl<T: 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state.borrow().state.name())
            .finish()
    }
}

impl<T: 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        // Only the producer can settle the state; going away while it is
        // still pending breaks every consumer downstream.
        let pending = !self.state.borrow().state.is_finished();
        if pending {
            settle(&self.state, Err(Error::broken_promise()), "reject");
        }
    }
}

/// The consumer half of a deferred value.
///
/// At most one continuation pair may ever be attached to the shared state;
/// attaching a second panics. Attaching to an already settled state fires the
/// continuation synchronously within the attach call.
pub struct Future<T: 'static = ()> {
    state: Rc<RefCell<Shared<T>>>,
}

impl<T: 'static> Future<T> {
    /// A future that is already fulfilled with `value`.
    pub fn fulfilled(value: T) -> Self {
        let promise = Promise::new();
        let future = promise.future();
        promise.resolve(value);
        future
    }

    /// A future that is already rejected with `error`.
    pub fn rejected(error: Error) -> Self {
        let promise = Promise::new();
        let future = promise.future();
        promise.reject(error);
        future
    }

    /// True once the shared state is fulfilled or rejected.
    pub fn is_finished(&self) -> bool {
        self.state.borrow().state.is_finished()
    }

    /// Chains a handler returning a plain value; the downstream future is
    /// fulfilled with the handler's return. Rejections skip the handler and
    /// propagate untouched.
    #[track_caller]
    pub fn map<U, F>(self, on_fulfilled: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let downstream = Promise::new();
        let future = downstream.future();
        attach(
            &self.state,
            Box::new(move |result| match result {
                Ok(value) => downstream.resolve(on_fulfilled(value)),
                Err(error) => downstream.reject(error),
            }),
        );
        future
    }

    /// Like [`map`](Future::map) with an explicit rejection handler. An error
    /// consumed by `on_rejected` becomes the fulfillment value downstream.
    #[track_caller]
    pub fn map_else<U, F, G>(self, on_fulfilled: F, on_rejected: G) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
        G: FnOnce(Error) -> U + 'static,
    {
        let downstream = Promise::new();
        let future = downstream.future();
        attach(
            &self.state,
            Box::new(move |result| match result {
                Ok(value) => downstream.resolve(on_fulfilled(value)),
                Err(error) => downstream.resolve(on_rejected(error)),
            }),
        );
        future
    }

    /// Chains a handler returning another future. The downstream future
    /// tracks the returned future rather than wrapping it, staying pending
    /// until the inner future settles.
    #[track_caller]
    pub fn then<U, F>(self, on_fulfilled: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> Future<U> + 'static,
    {
        let downstream = Promise::new();
        let future = downstream.future();
        attach(
            &self.state,
            Box::new(move |result| match result {
                Ok(value) => on_fulfilled(value).forward(downstream),
                Err(error) => downstream.reject(error),
            }),
        );
        future
    }

    /// Like [`then`](Future::then) with an explicit rejection handler, which
    /// also returns a future for the downstream to track.
    #[track_caller]
    pub fn then_else<U, F, G>(self, on_fulfilled: F, on_rejected: G) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> Future<U> + 'static,
        G: FnOnce(Error) -> Future<U> + 'static,
    {
        let downstream = Promise::new();
        let future = downstream.future();
        attach(
            &self.state,
            Box::new(move |result| match result {
                Ok(value) => on_fulfilled(value).forward(downstream),
                Err(error) => on_rejected(error).forward(downstream),
            }),
        );
        future
    }

    /// Chains a handler that receives the fresh downstream promise along with
    /// the value, and may settle it at an arbitrary later time.
    #[track_caller]
    pub fn defer<U, F>(self, on_fulfilled: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T, Promise<U>) + 'static,
    {
        let downstream = Promise::new();
        let future = downstream.future();
        attach(
            &self.state,
            Box::new(move |result| match result {
                Ok(value) => on_fulfilled(value, downstream),
                Err(error) => downstream.reject(error),
            }),
        );
        future
    }

    /// The forwarding form: fulfillment resolves `downstream`, rejection
    /// rejects it.
    #[track_caller]
    pub fn forward(self, downstream: Promise<T>) {
        attach(
            &self.state,
            Box::new(move |result| match result {
                Ok(value) => downstream.resolve(value),
                Err(error) => downstream.reject(error),
            }),
        );
    }
}

impl<T: 'static> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("state", &self.state.borrow().state.name())
            .finish()
    }
}
