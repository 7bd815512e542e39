//! NX image container structures and loading.

pub mod context;
pub mod structs;

pub use context::NxFile;
pub use structs::*;
