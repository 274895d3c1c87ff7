//! x86-64 guest front end: decodes instruction bytes into IR superblocks.
//!
//! The decoder understands the 64-bit instruction stream only (no legacy
//! modes, no vector extensions). Condition flags are never computed
//! eagerly; see [`flags`] for the thunk scheme.

pub mod amode;
pub mod flags;
pub mod insn;
pub mod prefix;
pub mod sb;
pub mod state;

#[cfg(test)]
mod tests;

use decoder::{Error, Extents, LiftParams, Lifter};
use ir::SuperBlock;

/// The x86-64 guest front end.
#[derive(Debug, Default, Copy, Clone)]
pub struct GuestAmd64;

impl Lifter for GuestAmd64 {
    fn superblock(&self, params: &LiftParams) -> Result<(SuperBlock, Extents), Error> {
        sb::build_superblock(params)
    }
}
