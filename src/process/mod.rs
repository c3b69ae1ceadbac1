//! Tool process spawning, line I/O and lifetime tracking.

mod channel;
mod error;
mod handle;
mod registry;

pub use channel::*;
pub use error::*;
pub use handle::*;
pub use registry::*;
