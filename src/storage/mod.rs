//! Store adapters and the named targets the engine talks to.

pub mod traits;
pub mod target;
pub mod memory;
pub mod sql;
