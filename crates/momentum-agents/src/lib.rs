pub mod agent;
pub mod error;
pub mod process_tree;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod types;

pub use agent::*;
pub use error::*;
pub use process_tree::*;
pub use queue::*;
pub use registry::*;
pub use runner::*;
pub use types::*;
