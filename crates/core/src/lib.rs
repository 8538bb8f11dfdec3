//! Loop-free core of the eddy runtime: the promise/future deferred-value
//! pair and the error value carried through rejection paths.

mod error;
pub use error::{Error, ErrorKind};

pub mod promise;
pub use promise::{Future, Promise};
