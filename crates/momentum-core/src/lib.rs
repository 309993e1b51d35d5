pub mod cancel;
pub mod config;
pub mod mode;
pub mod types;
pub mod validation;

pub use cancel::*;
pub use config::*;
pub use mode::*;
pub use types::*;
pub use validation::*;
