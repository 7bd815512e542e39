//! Derived-layout profile consumed by the ELF synthesizer.

use tracing::{debug, warn};

use crate::converter::{eh, locate};
use crate::nx::{EhInfo, NxFile};

/// Everything the synthesizer needs beyond what the container records:
/// the GOT extents, the init/fini spans, and the measured exception
/// frames. Built once per conversion by running the heuristic locators
/// over the loaded image.
#[derive(Debug, Default)]
pub struct Profile {
    /// End of `.got.plt` (one past the last jump slot), 0 when absent
    pub jump_slot_end: u64,
    /// Start of `.got`, when the pointer-to-dynamic sentinel was found
    pub got_addr: Option<u64>,
    /// End of `.got` (one past the last GLOB_DAT slot)
    pub glob_dat_end: u64,
    /// Size of `.init` through its first RET
    pub init_size: Option<u64>,
    /// Size of `.fini` through its first unconditional branch
    pub fini_size: Option<u64>,
    /// Measured exception-frame extents; `None` when measurement failed
    pub eh: Option<EhInfo>,
}

impl Profile {
    /// Runs the locators and the exception-frame measurer over `nx`.
    pub fn build(nx: &NxFile) -> Self {
        let jump_slot_end = locate::jump_slot_end(&nx.image, &nx.dyn_info);
        let got_addr = if jump_slot_end != 0 {
            locate::find_got(&nx.image, jump_slot_end, nx.dynamic_off)
        } else {
            None
        };
        let glob_dat_end = got_addr
            .map(|addr| locate::glob_dat_end(&nx.image, &nx.dyn_info, addr))
            .unwrap_or(0);

        let init_size = (nx.dyn_info.init != 0)
            .then(|| locate::init_size(&nx.image, nx.dyn_info.init))
            .flatten();
        let fini_size = (nx.dyn_info.fini != 0)
            .then(|| locate::fini_size(&nx.image, nx.dyn_info.fini))
            .flatten();

        let eh = match eh::measure(&nx.image, nx.eh_hdr_addr, nx.eh_hdr_size) {
            Ok(eh) => Some(eh),
            Err(err) => {
                warn!("omitting .eh_frame sections: {}", err);
                None
            }
        };

        debug!(
            got = ?got_addr,
            got_plt_end = jump_slot_end,
            init = ?init_size,
            fini = ?fini_size,
            eh = eh.is_some(),
            "profiled image"
        );

        Profile {
            jump_slot_end,
            got_addr,
            glob_dat_end,
            init_size,
            fini_size,
            eh,
        }
    }
}
