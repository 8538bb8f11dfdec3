//! The stream contract shared by [`Pipe`](crate::Pipe) and
//! [`File`](crate::File): a full-duplex byte channel whose operations each
//! enqueue exactly one request, processed in submission order and settled by
//! a reactor callback exactly once.

use bytes::{Bytes, BytesMut};
use eddy_core::{Error, ErrorKind, Future};

/// Lifecycle of a stream. `ClosedFinal` is terminal: a closed stream is not
/// reopened, a fresh one is created instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Initial state of an unopened stream.
    Closed,
    /// Capable of reads and writes.
    Open,
    /// A close was requested; the queue is draining.
    Closing,
    /// Terminal.
    ClosedFinal,
}

/// Asynchronous byte-channel operations. Requests may be enqueued
/// back-to-back without awaiting completion; each kind completes in
/// submission order.
pub trait Stream {
    fn state(&self) -> StreamState;

    /// Queues a read for up to `len` bytes, resolving with whatever arrives
    /// first. Rejects with [`ErrorKind::EndOfStream`] when the end is reached
    /// before any byte.
    fn read(&self, len: usize) -> Future<BytesMut>;

    /// Queues `buf` for writing. Resolves once the OS has accepted every
    /// byte; the buffer is retained by the stream until then.
    fn write(&self, buf: Bytes) -> Future<()>;

    /// Drains the queue, then transitions to `ClosedFinal`. Requests that
    /// cannot complete anymore are rejected with [`ErrorKind::Stream`].
    fn close(&self) -> Future<()>;
}

/// Rejection used when an operation is queued against a stream that is not
/// open (and will not become open ahead of the request).
pub(crate) fn not_open_error() -> Error {
    Error::new(ErrorKind::Stream, 0, "stream is not open")
}

/// Rejection delivered to requests discarded when their stream closes.
pub(crate) fn closed_error() -> Error {
    Error::new(ErrorKind::Stream, 0, "stream closed with the request pending")
}
