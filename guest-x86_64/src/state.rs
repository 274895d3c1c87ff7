//! Byte offsets into the guest machine-state block.
//!
//! The block is a flat struct the generated code reads and writes through
//! `Get`/`Put` at these offsets. Integer registers come first, then the
//! deferred flags thunk, then control state.

pub const OFF_RAX: i32 = 0;
pub const OFF_RCX: i32 = 8;
pub const OFF_RDX: i32 = 16;
pub const OFF_RBX: i32 = 24;
pub const OFF_RSP: i32 = 32;
pub const OFF_RBP: i32 = 40;
pub const OFF_RSI: i32 = 48;
pub const OFF_RDI: i32 = 56;
pub const OFF_R8: i32 = 64;

/// Condition-code thunk: which operation last set the flags.
pub const OFF_CC_OP: i32 = 128;
/// First operand (or result) captured for flag recovery.
pub const OFF_CC_DEP1: i32 = 136;
/// Second operand captured for flag recovery.
pub const OFF_CC_DEP2: i32 = 144;
/// Bits not determined by the thunked operation (e.g. a carried-in C).
pub const OFF_CC_NDEP: i32 = 152;

/// Direction flag, stored as 1 or -1 for use as a string-op stride sign.
pub const OFF_DFLAG: i32 = 160;
pub const OFF_RIP: i32 = 168;
/// Interrupt-disable flag, 0 or 1.
pub const OFF_IDFLAG: i32 = 176;
/// Base of the %fs-mapped segment.
pub const OFF_FS_ZERO: i32 = 184;

/// Offset of 64-bit integer register `num` (0..16, in encoding order
/// rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8..r15).
#[inline]
pub fn off_reg64(num: u8) -> i32 {
    assert!(num < 16);
    num as i32 * 8
}

/// Offset of the byte register with encoding `num`. Without a REX prefix,
/// encodings 4..=7 name ah/ch/dh/bh: bits 8..16 of rax/rcx/rdx/rbx, which
/// on a little-endian state block live one byte above the register base.
#[inline]
pub fn off_reg8(rex_present: bool, num: u8) -> i32 {
    if !rex_present && (4..8).contains(&num) {
        off_reg64(num - 4) + 1
    } else {
        off_reg64(num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_file_is_contiguous() {
        assert_eq!(off_reg64(0), OFF_RAX);
        assert_eq!(off_reg64(4), OFF_RSP);
        assert_eq!(off_reg64(8), OFF_R8);
        assert_eq!(off_reg64(15), 120);
    }

    #[test]
    fn high_byte_registers_without_rex() {
        // ah/ch/dh/bh sit one byte into rax/rcx/rdx/rbx.
        assert_eq!(off_reg8(false, 4), OFF_RAX + 1);
        assert_eq!(off_reg8(false, 7), OFF_RBX + 1);
        // With REX present, 4..=7 name spl/bpl/sil/dil instead.
        assert_eq!(off_reg8(true, 4), OFF_RSP);
        assert_eq!(off_reg8(true, 7), OFF_RDI);
        assert_eq!(off_reg8(false, 0), OFF_RAX);
        assert_eq!(off_reg8(true, 12), 96);
    }
}
