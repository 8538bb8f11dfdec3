//! The eddy event loop and its primitives: timers, idle callbacks, pipes,
//! files, and helpers for futures that settle against the loop.

pub mod event_loop;
pub use event_loop::Loop;

pub mod timer;
pub use timer::{Idle, Timeout};

pub mod stream;
pub use stream::{Stream, StreamState};

pub mod pipe;
pub use pipe::Pipe;

pub mod file;
pub use file::File;

mod helpers;
pub use helpers::{reject, resolve, wait, wait_until};
