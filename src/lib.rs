//! nxelf - NX loadable-image to ELF64 converter.
//!
//! This library converts Nintendo-Switch-style loadable binary images in
//! their three observed container shapes (NSO, NRO, raw MOD) into standard
//! ELF64 shared objects suitable for off-the-shelf disassemblers and static
//! analyzers. A secondary operation re-emits an NSO with its per-segment
//! compression removed.
//!
//! The containers describe only three segments and a dynamic table, so the
//! interesting work is reconstruction: decoding and decompressing the
//! container, recovering the structures it does not describe (.plt, .got,
//! .got.plt, .init, .fini, .note, the exception-frame extents, and for raw
//! MOD every segment boundary) by heuristics over the memory image, and
//! synthesizing a mutually consistent ELF header, program-header table,
//! section-header table, and string table.
//!
//! # Example
//!
//! ```no_run
//! use nxelf::NxFile;
//!
//! fn main() -> nxelf::Result<()> {
//!     let nx = NxFile::load("main.nso")?;
//!     nxelf::export_elf(&nx, "main.elf")?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod converter;
pub mod elf;
pub mod error;
pub mod nx;
pub mod util;

// Re-export main types
pub use error::{Error, Result};
pub use nx::{FileKind, NxFile};

use std::fs;
use std::path::Path;

use tracing::debug;

use converter::Profile;

/// Converts a loaded image to an ELF64 shared object, returning the
/// output bytes.
pub fn convert_to_elf(nx: &NxFile) -> Result<Vec<u8>> {
    let profile = Profile::build(nx);
    converter::write_elf(nx, &profile)
}

/// Re-emits a loaded image as an uncompressed NSO, returning the output
/// bytes.
pub fn rewrite_uncompressed(nx: &NxFile) -> Result<Vec<u8>> {
    converter::write_uncompressed(nx)
}

/// Converts a loaded image to an ELF64 shared object on disk.
pub fn export_elf<P: AsRef<Path>>(nx: &NxFile, output_path: P) -> Result<()> {
    let elf = convert_to_elf(nx)?;
    write_output(output_path.as_ref(), &elf)
}

/// Writes a loaded image back out as an uncompressed NSO.
pub fn export_uncompressed<P: AsRef<Path>>(nx: &NxFile, output_path: P) -> Result<()> {
    let nso = rewrite_uncompressed(nx)?;
    write_output(output_path.as_ref(), &nso)
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::FileWrite {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
    }
    fs::write(path, bytes).map_err(|e| Error::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;
    debug!(path = %path.display(), size = bytes.len(), "wrote output");
    Ok(())
}
