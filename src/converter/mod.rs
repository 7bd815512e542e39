//! Conversion pipeline: heuristic locators, exception-frame measurement,
//! and the two output writers.

pub mod eh;
pub mod locate;
pub mod nso;
pub mod profile;
pub mod strtab;
pub mod writer;

pub use nso::write_uncompressed;
pub use profile::Profile;
pub use writer::write_elf;
