//! Asynchronous file stream with an internal read/write offset.
//!
//! File requests queue in one strict FIFO lane and are processed one per
//! loop iteration on the next-tick lane, so every settlement happens from a
//! loop callback in submission order. Opening a nonexistent path creates the
//! file. Reads and writes advance the offset monotonically by the bytes
//! delivered or accepted.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use eddy_core::{Error, ErrorKind, Future, Promise};
use tracing::debug;

use crate::event_loop::{Loop, LoopHandle};
use crate::stream::{Stream, StreamState, closed_error, not_open_error};

#[cfg(test)]
mod tests;

enum Request {
    Open { path: PathBuf, promise: Promise<()> },
    Read { len: usize, promise: Promise<BytesMut> },
    Write { buf: Bytes, promise: Promise<()> },
    Close { promise: Promise<()> },
}

struct State {
    lifecycle: StreamState,
    /// State the stream will be in once every queued request has applied;
    /// new requests validate against this so `open(); write(); close()`
    /// composes without awaiting.
    projected: StreamState,
    file: Option<fs::File>,
    offset: u64,
    queue: VecDeque<Request>,
    pump_scheduled: bool,
}

/// An asynchronous file over the loop.
#[derive(Clone)]
pub struct File {
    inner: Rc<Inner>,
}

struct Inner {
    loop_: LoopHandle,
    state: RefCell<State>,
}

impl File {
    pub fn new(lp: &Loop) -> Self {
        File {
            inner: Rc::new(Inner {
                loop_: lp.handle(),
                state: RefCell::new(State {
                    lifecycle: StreamState::Closed,
                    projected: StreamState::Closed,
                    file: None,
                    offset: 0,
                    queue: VecDeque::new(),
                    pump_scheduled: false,
                }),
            }),
        }
    }

    /// Queues an open. The file is created when the path does not exist.
    pub fn open(&self, path: impl Into<PathBuf>) -> Future<()> {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.projected != StreamState::Closed {
                return Future::rejected(Error::new(
                    ErrorKind::Stream,
                    0,
                    "stream is already open",
                ));
            }
            state.projected = StreamState::Open;
        }
        let promise = Promise::new();
        let future = promise.future();
        self.enqueue(Request::Open {
            path: path.into(),
            promise,
        });
        future
    }

    /// The current read/write position.
    pub fn offset(&self) -> u64 {
        self.inner.state.borrow().offset
    }

    fn enqueue(&self, request: Request) {
        let mut state = self.inner.state.borrow_mut();
        state.queue.push_back(request);
        if !state.pump_scheduled {
            state.pump_scheduled = true;
            let inner = Rc::clone(&self.inner);
            self.inner.loop_.schedule(Box::new(move || Inner::pump(&inner)));
        }
    }
}

impl Stream for File {
    fn state(&self) -> StreamState {
        self.inner.state.borrow().lifecycle
    }

    fn read(&self, len: usize) -> Future<BytesMut> {
        if self.inner.state.borrow().projected != StreamState::Open {
            return Future::rejected(not_open_error());
        }
        let promise = Promise::new();
        let future = promise.future();
        self.enqueue(Request::Read { len, promise });
        future
    }

    fn write(&self, buf: Bytes) -> Future<()> {
        if self.inner.state.borrow().projected != StreamState::Open {
            return Future::rejected(not_open_error());
        }
        let promise = Promise::new();
        let future = promise.future();
        self.enqueue(Request::Write { buf, promise });
        future
    }

    fn close(&self) -> Future<()> {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.projected != StreamState::Open {
                return Future::rejected(not_open_error());
            }
            state.projected = StreamState::ClosedFinal;
            if state.lifecycle == StreamState::Open {
                state.lifecycle = StreamState::Closing;
            }
        }
        let promise = Promise::new();
        let future = promise.future();
        self.enqueue(Request::Close { promise });
        future
    }
}

impl Inner {
    /// Processes the head request, settles it, then reschedules itself while
    /// requests remain. One request per loop iteration keeps every
    /// settlement on its own reactor callback.
    fn pump(inner: &Rc<Inner>) {
        let request = {
            let mut state = inner.state.borrow_mut();
            match state.queue.pop_front() {
                Some(request) => request,
                None => {
                    state.pump_scheduled = false;
                    return;
                }
            }
        };

        match request {
            Request::Open { path, promise } => match Inner::do_open(inner, &path) {
                Ok(()) => promise.resolve(()),
                Err(err) => promise.reject(err),
            },
            Request::Read { len, promise } => match Inner::do_read(inner, len) {
                Ok(buf) => promise.resolve(buf),
                Err(err) => promise.reject(err),
            },
            Request::Write { buf, promise } => match Inner::do_write(inner, &buf) {
                Ok(()) => promise.resolve(()),
                Err(err) => promise.reject(err),
            },
            Request::Close { promise } => {
                let stragglers = Inner::do_close(inner);
                promise.resolve(());
                for request in stragglers {
                    reject_request(request);
                }
            }
        }

        let mut state = inner.state.borrow_mut();
        if state.queue.is_empty() {
            state.pump_scheduled = false;
        } else {
            let inner = Rc::clone(inner);
            let loop_ = inner.loop_.clone();
            loop_.schedule(Box::new(move || Inner::pump(&inner)));
        }
    }

    fn do_open(inner: &Rc<Inner>, path: &PathBuf) -> Result<(), Error> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::from_io(ErrorKind::Stream, &e))?;
        let mut state = inner.state.borrow_mut();
        state.file = Some(file);
        state.lifecycle = StreamState::Open;
        state.offset = 0;
        Ok(())
    }

    fn do_read(inner: &Rc<Inner>, len: usize) -> Result<BytesMut, Error> {
        let mut state = inner.state.borrow_mut();
        let offset = state.offset;
        let file = state.file.as_ref().ok_or_else(not_open_error)?;
        let mut buf = BytesMut::zeroed(len);
        let count = file
            .read_at(&mut buf, offset)
            .map_err(|e| Error::from_io(ErrorKind::Stream, &e))?;
        if count == 0 && len > 0 {
            return Err(Error::end_of_stream());
        }
        buf.truncate(count);
        state.offset += count as u64;
        Ok(buf)
    }

    fn do_write(inner: &Rc<Inner>, buf: &Bytes) -> Result<(), Error> {
        let mut state = inner.state.borrow_mut();
        let offset = state.offset;
        let file = state.file.as_ref().ok_or_else(not_open_error)?;
        file.write_all_at(buf, offset)
            .map_err(|e| Error::from_io(ErrorKind::Stream, &e))?;
        state.offset += buf.len() as u64;
        Ok(())
    }

    /// Tears the file down and returns any requests that slipped in behind
    /// the close, to be rejected by the caller.
    fn do_close(inner: &Rc<Inner>) -> Vec<Request> {
        let mut state = inner.state.borrow_mut();
        state.file = None;
        state.lifecycle = StreamState::ClosedFinal;
        state.queue.drain(..).collect()
    }
}

fn reject_request(request: Request) {
    debug!("rejecting file request queued behind a close");
    match request {
        Request::Open { promise, .. } => promise.reject(closed_error()),
        Request::Read { promise, .. } => promise.reject(closed_error()),
        Request::Write { promise, .. } => promise.reject(closed_error()),
        Request::Close { promise } => promise.reject(closed_error()),
    }
}
