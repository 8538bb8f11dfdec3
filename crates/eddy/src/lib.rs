pub use bytes;
pub use eddy_core::{Error, ErrorKind, Future, Promise};
pub use eddy_runtime::*;

pub mod prelude {
    pub use super::*;
    pub use bytes::{Bytes, BytesMut};
}
