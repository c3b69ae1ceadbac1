//! Supervisors that own tool processes and the policy around them.

mod executor;
mod keep_alive;
mod scheduler;
mod single;
mod state;

pub use executor::*;
pub use keep_alive::*;
pub use scheduler::*;
pub use single::*;
pub use state::*;
