//! Storage module for crypto box persistence.
//!
//! Provides the store traits plus a directory-backed and an in-memory
//! implementation.

mod file;
mod memory;
mod traits;

pub use file::*;
pub use memory::*;
pub use traits::*;
