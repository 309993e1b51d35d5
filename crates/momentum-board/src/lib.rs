pub mod backoff;
pub mod board;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod sse;
pub mod subscriber;

pub use backoff::*;
pub use board::*;
pub use error::*;
#[cfg(any(test, feature = "test-support"))]
pub use memory::MemoryBoard;
pub use sse::*;
pub use subscriber::*;
