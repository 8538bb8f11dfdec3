//! Local (Unix-domain) pipes over the reactor.
//!
//! A pipe is either adopted from an existing descriptor with
//! [`open`](Pipe::open), connected to a named endpoint with
//! [`connect`](Pipe::connect), or produced by [`accept`](Pipe::accept) on a
//! pipe that [`bind`](Pipe::bind) turned into a server endpoint. Reads and
//! writes drive independent readiness lanes; requests within a lane complete
//! in submission order.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::path::Path;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use eddy_core::{Error, ErrorKind, Future, Promise};
use mio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::event_loop::{Loop, LoopHandle};
use crate::stream::{Stream, StreamState, closed_error, not_open_error};


struct ReadRequest {
    len: usize,
    promise: Promise<BytesMut>,
}

struct WriteRequest {
    buf: Bytes,
    written: usize,
    promise: Promise<()>,
}

/// An I/O source together with its reactor registration.
struct Registered<S> {
    source: S,
    token: usize,
}

enum ConnectPhase {
    /// Never connected; `connect` is still available.
    Idle,
    /// A connect is in flight; resolves or rejects the held promise.
    InFlight(Promise<()>),
    /// Connected, adopted, accepted or failed; `connect` is used up.
    Done,
}

struct State {
    lifecycle: StreamState,
    connect: ConnectPhase,
    stream: Option<Registered<UnixStream>>,
    listener: Option<Registered<UnixListener>>,
    reads: VecDeque<ReadRequest>,
    writes: VecDeque<WriteRequest>,
    accepts: VecDeque<Promise<Pipe>>,
    close: Option<Promise<()>>,
    /// A read/write/accept drive is queued on the next-tick lane or armed on
    /// a readiness edge; prevents double scheduling.
    read_driving: bool,
    write_driving: bool,
    accept_driving: bool,
}

/// A local pipe endpoint.
#[derive(Clone)]
pub struct Pipe {
    inner: Rc<Inner>,
}

struct Inner {
    loop_: LoopHandle,
    ipc: bool,
    state: RefCell<State>,
}

impl Pipe {
    /// Well-known descriptors usable with [`open`](Pipe::open).
    pub const STDIN: RawFd = 0;
    pub const STDOUT: RawFd = 1;
    pub const STDERR: RawFd = 2;

    pub fn new(lp: &Loop) -> Self {
        Self::with_ipc(lp, false)
    }

    /// A pipe in IPC mode. The mode is fixed at construction.
    pub fn new_ipc(lp: &Loop) -> Self {
        Self::with_ipc(lp, true)
    }

    fn with_ipc(lp: &Loop, ipc: bool) -> Self {
        Pipe {
            inner: Rc::new(Inner {
                loop_: lp.handle(),
                ipc,
                state: RefCell::new(State {
                    lifecycle: StreamState::Closed,
                    connect: ConnectPhase::Idle,
                    stream: None,
                    listener: None,
                    reads: VecDeque::new(),
                    writes: VecDeque::new(),
                    accepts: VecDeque::new(),
                    close: None,
                    read_driving: false,
                    write_driving: false,
                    accept_driving: false,
                }),
            }),
        }
    }

    pub fn is_ipc(&self) -> bool {
        self.inner.ipc
    }

    /// Adopts an existing descriptor, taking ownership of it. The pipe
    /// becomes open; the returned future settles on the next loop iteration.
    pub fn open(&self, fd: RawFd) -> Future<()> {
        if self.inner.state.borrow().lifecycle != StreamState::Closed {
            return Future::rejected(Error::pipe(0, "pipe is already open"));
        }
        // Ownership of `fd` transfers to the pipe; the descriptor is closed
        // when the stream goes away.
        let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
        if let Err(err) = std_stream.set_nonblocking(true) {
            return Future::rejected(Error::from_io(ErrorKind::Pipe, &err));
        }
        let mut stream = UnixStream::from_std(std_stream);
        let token = match self.inner.loop_.register_io(&mut stream) {
            Ok(token) => token,
            Err(err) => return Future::rejected(Error::from_io(ErrorKind::Pipe, &err)),
        };
        {
            let mut state = self.inner.state.borrow_mut();
            state.stream = Some(Registered { source: stream, token });
            state.lifecycle = StreamState::Open;
            state.connect = ConnectPhase::Done;
        }
        let promise = Promise::new();
        let future = promise.future();
        self.inner.loop_.schedule(Box::new(move || promise.resolve(())));
        future
    }

    /// Binds this pipe as a server endpoint under `name`.
    pub fn bind(&self, name: impl AsRef<Path>) -> Result<(), Error> {
        let mut state = self.inner.state.borrow_mut();
        if state.listener.is_some() {
            return Err(Error::pipe(0, "pipe is already bound"));
        }
        let mut listener = UnixListener::bind(name.as_ref())
            .map_err(|e| Error::from_io(ErrorKind::Pipe, &e))?;
        let token = self
            .inner
            .loop_
            .register_io(&mut listener)
            .map_err(|e| Error::from_io(ErrorKind::Pipe, &e))?;
        state.listener = Some(Registered {
            source: listener,
            token,
        });
        Ok(())
    }

    /// Accepts one client connection on a bound pipe, resolving with the
    /// open pipe for the connection.
    pub fn accept(&self) -> Future<Pipe> {
        {
            let state = self.inner.state.borrow();
            if state.listener.is_none() {
                return Future::rejected(Error::pipe(0, "pipe is not bound"));
            }
        }
        let promise = Promise::new();
        let future = promise.future();
        {
            let mut state = self.inner.state.borrow_mut();
            state.accepts.push_back(promise);
        }
        Inner::schedule_accept_drive(&self.inner);
        future
    }

    /// Connects to the server endpoint bound under `name`. At most one
    /// connect per pipe instance; a second call fails with a pipe error
    /// carrying code 1.
    pub fn connect(&self, name: impl AsRef<Path>) -> Future<()> {
        {
            let state = self.inner.state.borrow();
            if !matches!(state.connect, ConnectPhase::Idle) {
                return Future::rejected(Error::pipe(1, "cannot connect a pipe twice"));
            }
            if state.lifecycle != StreamState::Closed {
                return Future::rejected(Error::pipe(0, "pipe is already open"));
            }
        }
        let mut stream = match UnixStream::connect(name.as_ref()) {
            Ok(stream) => stream,
            Err(err) => {
                self.inner.state.borrow_mut().connect = ConnectPhase::Done;
                return Future::rejected(Error::from_io(ErrorKind::Pipe, &err));
            }
        };
        let token = match self.inner.loop_.register_io(&mut stream) {
            Ok(token) => token,
            Err(err) => {
                self.inner.state.borrow_mut().connect = ConnectPhase::Done;
                return Future::rejected(Error::from_io(ErrorKind::Pipe, &err));
            }
        };
        let promise = Promise::new();
        let future = promise.future();
        {
            let mut state = self.inner.state.borrow_mut();
            state.stream = Some(Registered { source: stream, token });
            state.connect = ConnectPhase::InFlight(promise);
        }
        // Connection completion is signalled by the first writable edge.
        let inner = Rc::clone(&self.inner);
        self.inner
            .loop_
            .arm_writable(token, Box::new(move || Inner::finish_connect(&inner)));
        future
    }
}

impl Stream for Pipe {
    fn state(&self) -> StreamState {
        self.inner.state.borrow().lifecycle
    }

    fn read(&self, len: usize) -> Future<BytesMut> {
        if !self.inner.state.borrow().can_queue_io() {
            return Future::rejected(not_open_error());
        }
        let promise = Promise::new();
        let future = promise.future();
        self.inner
            .state
            .borrow_mut()
            .reads
            .push_back(ReadRequest { len, promise });
        Inner::schedule_read_drive(&self.inner);
        future
    }

    fn write(&self, buf: Bytes) -> Future<()> {
        if !self.inner.state.borrow().can_queue_io() {
            return Future::rejected(not_open_error());
        }
        let promise = Promise::new();
        let future = promise.future();
        self.inner.state.borrow_mut().writes.push_back(WriteRequest {
            buf,
            written: 0,
            promise,
        });
        Inner::schedule_write_drive(&self.inner);
        future
    }

    /// Rejects pending reads (which may never complete once the caller has
    /// decided to close), drains pending writes, then tears the endpoint
    /// down.
    fn close(&self) -> Future<()> {
        let promise = Promise::new();
        let future = promise.future();
        let (stale_reads, stale_accepts, stale_connect, writes_drained) = {
            let mut state = self.inner.state.borrow_mut();
            let closeable = state.lifecycle == StreamState::Open
                || (state.lifecycle == StreamState::Closed
                    && (state.listener.is_some()
                        || matches!(state.connect, ConnectPhase::InFlight(_))));
            if !closeable {
                return Future::rejected(not_open_error());
            }
            state.lifecycle = StreamState::Closing;
            state.close = Some(promise);
            let stale_reads: Vec<ReadRequest> = state.reads.drain(..).collect();
            let stale_accepts: Vec<Promise<Pipe>> = state.accepts.drain(..).collect();
            let stale_connect = match std::mem::replace(&mut state.connect, ConnectPhase::Done) {
                ConnectPhase::InFlight(promise) => Some(promise),
                _ => None,
            };
            (stale_reads, stale_accepts, stale_connect, state.writes.is_empty())
        };
        for request in stale_reads {
            request.promise.reject(closed_error());
        }
        for promise in stale_accepts {
            promise.reject(closed_error());
        }
        if let Some(promise) = stale_connect {
            promise.reject(Error::pipe(0, "pipe closed while connecting"));
        }
        if writes_drained {
            let inner = Rc::clone(&self.inner);
            self.inner
                .loop_
                .schedule(Box::new(move || Inner::finish_close(&inner)));
        }
        future
    }
}

impl State {
    /// Reads and writes may queue while open, or behind an in-flight
    /// connect.
    fn can_queue_io(&self) -> bool {
        self.lifecycle == StreamState::Open
            || (self.lifecycle == StreamState::Closed
                && matches!(self.connect, ConnectPhase::InFlight(_)))
    }
}

enum Drive {
    /// Settle a request and keep driving.
    Settle,
    /// Wait for the next readiness edge.
    Arm(usize),
    /// Retry the syscall immediately.
    Retry,
    /// Nothing left to drive.
    Done,
}

impl Inner {
    fn schedule_read_drive(inner: &Rc<Inner>) {
        if std::mem::replace(&mut inner.state.borrow_mut().read_driving, true) {
            return;
        }
        let inner = Rc::clone(inner);
        let loop_ = inner.loop_.clone();
        loop_.schedule(Box::new(move || {
            inner.state.borrow_mut().read_driving = false;
            Inner::drive_reads(&inner);
        }));
    }

    fn schedule_write_drive(inner: &Rc<Inner>) {
        if std::mem::replace(&mut inner.state.borrow_mut().write_driving, true) {
            return;
        }
        let inner = Rc::clone(inner);
        let loop_ = inner.loop_.clone();
        loop_.schedule(Box::new(move || {
            inner.state.borrow_mut().write_driving = false;
            Inner::drive_writes(&inner);
        }));
    }

    fn schedule_accept_drive(inner: &Rc<Inner>) {
        if std::mem::replace(&mut inner.state.borrow_mut().accept_driving, true) {
            return;
        }
        let inner = Rc::clone(inner);
        let loop_ = inner.loop_.clone();
        loop_.schedule(Box::new(move || {
            inner.state.borrow_mut().accept_driving = false;
            Inner::drive_accepts(&inner);
        }));
    }

    fn drive_reads(inner: &Rc<Inner>) {
        loop {
            let mut settle: Option<(Promise<BytesMut>, Result<BytesMut, Error>)> = None;
            let step = {
                let mut state = inner.state.borrow_mut();
                let State { stream, reads, .. } = &mut *state;
                if reads.is_empty() {
                    Drive::Done
                } else if reads.front().is_some_and(|request| request.len == 0) {
                    let request = reads.pop_front().expect("read queue emptied");
                    settle = Some((request.promise, Ok(BytesMut::new())));
                    Drive::Settle
                } else {
                    match stream {
                        None => {
                            let request = reads.pop_front().expect("read queue emptied");
                            settle = Some((request.promise, Err(not_open_error())));
                            Drive::Settle
                        }
                        Some(registered) => {
                            let len = reads.front().expect("read queue emptied").len;
                            let mut buf = BytesMut::zeroed(len);
                            match registered.source.read(&mut buf) {
                                Ok(0) => {
                                    let request = reads.pop_front().expect("read queue emptied");
                                    settle = Some((request.promise, Err(Error::end_of_stream())));
                                    Drive::Settle
                                }
                                Ok(count) => {
                                    buf.truncate(count);
                                    let request = reads.pop_front().expect("read queue emptied");
                                    settle = Some((request.promise, Ok(buf)));
                                    Drive::Settle
                                }
                                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                                    Drive::Arm(registered.token)
                                }
                                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                                    Drive::Retry
                                }
                                Err(err) => {
                                    let request = reads.pop_front().expect("read queue emptied");
                                    settle = Some((
                                        request.promise,
                                        Err(Error::from_io(ErrorKind::Pipe, &err)),
                                    ));
                                    Drive::Settle
                                }
                            }
                        }
                    }
                }
            };
            match step {
                Drive::Settle => {
                    let (promise, result) = settle.expect("settlement lost");
                    match result {
                        Ok(buf) => promise.resolve(buf),
                        Err(err) => promise.reject(err),
                    }
                }
                Drive::Arm(token) => {
                    inner.state.borrow_mut().read_driving = true;
                    let handle = Rc::clone(inner);
                    inner.loop_.arm_readable(
                        token,
                        Box::new(move || {
                            handle.state.borrow_mut().read_driving = false;
                            Inner::drive_reads(&handle);
                        }),
                    );
                    return;
                }
                Drive::Retry => continue,
                Drive::Done => return,
            }
        }
    }

    fn drive_writes(inner: &Rc<Inner>) {
        loop {
            let mut settle: Option<(Promise<()>, Result<(), Error>)> = None;
            let step = {
                let mut state = inner.state.borrow_mut();
                let State { stream, writes, .. } = &mut *state;
                if writes.is_empty() {
                    Drive::Done
                } else {
                    match stream {
                        None => {
                            let request = writes.pop_front().expect("write queue emptied");
                            settle = Some((request.promise, Err(not_open_error())));
                            Drive::Settle
                        }
                        Some(registered) => {
                            let request = writes.front_mut().expect("write queue emptied");
                            if request.written >= request.buf.len() {
                                let request = writes.pop_front().expect("write queue emptied");
                                settle = Some((request.promise, Ok(())));
                                Drive::Settle
                            } else {
                                match registered.source.write(&request.buf[request.written..]) {
                                    Ok(0) => {
                                        let request =
                                            writes.pop_front().expect("write queue emptied");
                                        settle = Some((
                                            request.promise,
                                            Err(Error::pipe(0, "write returned zero bytes")),
                                        ));
                                        Drive::Settle
                                    }
                                    Ok(count) => {
                                        request.written += count;
                                        Drive::Retry
                                    }
                                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                                        Drive::Arm(registered.token)
                                    }
                                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                                        Drive::Retry
                                    }
                                    Err(err) => {
                                        let request =
                                            writes.pop_front().expect("write queue emptied");
                                        settle = Some((
                                            request.promise,
                                            Err(Error::from_io(ErrorKind::Pipe, &err)),
                                        ));
                                        Drive::Settle
                                    }
                                }
                            }
                        }
                    }
                }
            };
            match step {
                Drive::Settle => {
                    let (promise, result) = settle.expect("settlement lost");
                    match result {
                        Ok(()) => promise.resolve(()),
                        Err(err) => promise.reject(err),
                    }
                    Inner::finish_close_if_drained(inner);
                }
                Drive::Arm(token) => {
                    inner.state.borrow_mut().write_driving = true;
                    let handle = Rc::clone(inner);
                    inner.loop_.arm_writable(
                        token,
                        Box::new(move || {
                            handle.state.borrow_mut().write_driving = false;
                            Inner::drive_writes(&handle);
                        }),
                    );
                    return;
                }
                Drive::Retry => continue,
                Drive::Done => {
                    Inner::finish_close_if_drained(inner);
                    return;
                }
            }
        }
    }

    fn drive_accepts(inner: &Rc<Inner>) {
        loop {
            enum Accepted {
                Connection(Promise<Pipe>, UnixStream),
                Failed(Promise<Pipe>, Error),
                Arm(usize),
                Done,
            }
            let step = {
                let mut state = inner.state.borrow_mut();
                let State {
                    listener, accepts, ..
                } = &mut *state;
                if accepts.is_empty() {
                    Accepted::Done
                } else {
                    match listener {
                        None => {
                            let promise = accepts.pop_front().expect("accept queue emptied");
                            Accepted::Failed(promise, Error::pipe(0, "pipe is not bound"))
                        }
                        Some(registered) => match registered.source.accept() {
                            Ok((stream, _addr)) => {
                                let promise = accepts.pop_front().expect("accept queue emptied");
                                Accepted::Connection(promise, stream)
                            }
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                                Accepted::Arm(registered.token)
                            }
                            Err(err) => {
                                let promise = accepts.pop_front().expect("accept queue emptied");
                                Accepted::Failed(promise, Error::from_io(ErrorKind::Pipe, &err))
                            }
                        },
                    }
                }
            };
            match step {
                Accepted::Connection(promise, stream) => {
                    match Inner::adopt_accepted(inner, stream) {
                        Ok(pipe) => promise.resolve(pipe),
                        Err(err) => promise.reject(err),
                    }
                }
                Accepted::Failed(promise, err) => promise.reject(err),
                Accepted::Arm(token) => {
                    inner.state.borrow_mut().accept_driving = true;
                    let handle = Rc::clone(inner);
                    inner.loop_.arm_readable(
                        token,
                        Box::new(move || {
                            handle.state.borrow_mut().accept_driving = false;
                            Inner::drive_accepts(&handle);
                        }),
                    );
                    return;
                }
                Accepted::Done => return,
            }
        }
    }

    /// Wraps an accepted connection into an open pipe on the same loop.
    fn adopt_accepted(inner: &Rc<Inner>, mut stream: UnixStream) -> Result<Pipe, Error> {
        let token = inner
            .loop_
            .register_io(&mut stream)
            .map_err(|e| Error::from_io(ErrorKind::Pipe, &e))?;
        let pipe = Pipe {
            inner: Rc::new(Inner {
                loop_: inner.loop_.clone(),
                ipc: inner.ipc,
                state: RefCell::new(State {
                    lifecycle: StreamState::Open,
                    connect: ConnectPhase::Done,
                    stream: Some(Registered { source: stream, token }),
                    listener: None,
                    reads: VecDeque::new(),
                    writes: VecDeque::new(),
                    accepts: VecDeque::new(),
                    close: None,
                    read_driving: false,
                    write_driving: false,
                    accept_driving: false,
                }),
            }),
        };
        Ok(pipe)
    }

    fn finish_connect(inner: &Rc<Inner>) {
        enum Connect {
            Connected(Promise<()>),
            Failed(Promise<()>, Error),
            Wait(usize),
        }
        enum Verdict {
            Connected,
            Failed(Error),
            Wait,
        }
        let step = {
            let mut state = inner.state.borrow_mut();
            let Some(registered) = &state.stream else {
                return;
            };
            let token = registered.token;
            let verdict = match registered.source.take_error() {
                Ok(Some(err)) | Err(err) => Verdict::Failed(Error::from_io(ErrorKind::Pipe, &err)),
                Ok(None) => match registered.source.peer_addr() {
                    Ok(_) => Verdict::Connected,
                    Err(ref err) if err.kind() == io::ErrorKind::NotConnected => {
                        // Still in flight; wait for another writable edge.
                        Verdict::Wait
                    }
                    Err(err) => Verdict::Failed(Error::from_io(ErrorKind::Pipe, &err)),
                },
            };
            match verdict {
                Verdict::Wait => Connect::Wait(token),
                Verdict::Connected => {
                    match std::mem::replace(&mut state.connect, ConnectPhase::Done) {
                        ConnectPhase::InFlight(promise) => {
                            state.lifecycle = StreamState::Open;
                            Connect::Connected(promise)
                        }
                        _ => return,
                    }
                }
                Verdict::Failed(err) => {
                    match std::mem::replace(&mut state.connect, ConnectPhase::Done) {
                        ConnectPhase::InFlight(promise) => Connect::Failed(promise, err),
                        _ => return,
                    }
                }
            }
        };
        match step {
            Connect::Connected(promise) => {
                debug!("pipe connected");
                promise.resolve(());
            }
            Connect::Failed(promise, err) => {
                // Requests queued behind the connect can never complete.
                let (dropped, stale_reads, stale_writes) = {
                    let mut state = inner.state.borrow_mut();
                    let stale_reads: Vec<ReadRequest> = state.reads.drain(..).collect();
                    let stale_writes: Vec<WriteRequest> = state.writes.drain(..).collect();
                    (state.stream.take(), stale_reads, stale_writes)
                };
                if let Some(mut registered) = dropped {
                    inner
                        .loop_
                        .deregister_io(registered.token, &mut registered.source);
                }
                promise.reject(err);
                for request in stale_reads {
                    request.promise.reject(not_open_error());
                }
                for request in stale_writes {
                    request.promise.reject(not_open_error());
                }
            }
            Connect::Wait(token) => {
                let handle = Rc::clone(inner);
                inner
                    .loop_
                    .arm_writable(token, Box::new(move || Inner::finish_connect(&handle)));
            }
        }
    }

    fn finish_close_if_drained(inner: &Rc<Inner>) {
        let drained = {
            let state = inner.state.borrow();
            state.lifecycle == StreamState::Closing && state.writes.is_empty()
        };
        if drained {
            Inner::finish_close(inner);
        }
    }

    fn finish_close(inner: &Rc<Inner>) {
        let (stream, listener, promise) = {
            let mut state = inner.state.borrow_mut();
            if state.lifecycle == StreamState::ClosedFinal {
                return;
            }
            state.lifecycle = StreamState::ClosedFinal;
            (state.stream.take(), state.listener.take(), state.close.take())
        };
        if let Some(mut registered) = stream {
            inner
                .loop_
                .deregister_io(registered.token, &mut registered.source);
        }
        if let Some(mut registered) = listener {
            inner
                .loop_
                .deregister_io(registered.token, &mut registered.source);
        }
        if let Some(promise) = promise {
            promise.resolve(());
        }
    }
}
