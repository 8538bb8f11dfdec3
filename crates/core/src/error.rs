use thiserror::Error;

/// Category of a runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The producing promise was dropped while the value was still pending.
    BrokenPromise,
    /// An operation was attempted against a state that cannot accept it.
    InvalidState,
    /// Pipe-level I/O failure.
    Pipe,
    /// Stream-level I/O failure.
    Stream,
    /// A read reached the end of the stream before any byte arrived.
    EndOfStream,
}

/// The error value carried through every rejection path.
///
/// Pairs a numeric code with a human-readable message. Platform failures keep
/// the OS error number as the code; errors the runtime itself produces use
/// small reserved codes (`1` marks the pipe double-connect misuse).
#[derive(Debug, Clone, Error)]
#[error("{message} (code {code})")]
pub struct Error {
    kind: ErrorKind,
    code: i64,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, code: i64, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    /// The rejection delivered when a pending promise's producer goes away.
    pub fn broken_promise() -> Self {
        Self::new(ErrorKind::BrokenPromise, 0, "promise dropped while pending")
    }

    pub fn end_of_stream() -> Self {
        Self::new(ErrorKind::EndOfStream, 0, "end of stream")
    }

    pub fn stream(code: i64, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Stream, code, message)
    }

    pub fn pipe(code: i64, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Pipe, code, message)
    }

    /// Wraps a platform error, keeping the OS error number as the code.
    pub fn from_io(kind: ErrorKind, err: &std::io::Error) -> Self {
        let code = err.raw_os_error().map(i64::from).unwrap_or(-1);
        Self::new(kind, code, err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> i64 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
