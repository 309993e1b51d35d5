//! Momentum supervisor: task selection, dispatch and lifecycle.

pub mod control;
pub mod lifecycle;
pub mod pending;
pub mod prompt;
pub mod running;
pub mod scheduler;
pub mod selector;
pub mod status;

pub use control::*;
pub use lifecycle::*;
pub use pending::*;
pub use prompt::*;
pub use running::*;
pub use scheduler::*;
pub use selector::*;
pub use status::*;
