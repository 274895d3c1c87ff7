//! Effective-address computation for memory operands.
//!
//! Covers the ModRM/SIB/displacement forms of 64-bit mode, including the
//! two encoding quirks that matter: mod=00 rm=101 is rip-relative (not
//! [rbp]), and a SIB base field of 101 under mod=00 means "no base,
//! disp32" even when an index register is present.

use decoder::{Error, ErrorKind, GuestReader};
use ir::{Binop, Expr, SuperBlock, Ty};

use crate::prefix::{Prefixes, Segment};
use crate::state::{off_reg64, OFF_FS_ZERO};

/// A rip-relative displacement is relative to the *end* of the current
/// instruction, which is unknown while its tail is still being decoded.
/// The resolver instead guesses the end address from the caller's promise
/// of how many immediate bytes follow, and the decoder must confirm the
/// guess once the instruction's true length is known.
#[must_use]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RipGuess {
    assumed_next: u64,
}

impl RipGuess {
    pub fn assumed_next(&self) -> u64 {
        self.assumed_next
    }

    /// Confirm the guess against the address actually following the
    /// instruction. A mismatch means the decoder lied about its trailing
    /// immediate size, which is a bug here, not bad guest code.
    pub fn verify(self, actual_next: u64) {
        assert_eq!(
            self.assumed_next, actual_next,
            "rip-relative guess missed the instruction end"
        );
    }
}

/// A resolved memory operand: the effective address as an I64 atom, plus
/// the rip-relative guess to confirm, if one was made.
pub struct EffAddr {
    pub addr: Expr,
    pub rip_guess: Option<RipGuess>,
}

fn seg_adjust(pfx: &Prefixes, ea: Expr, at: usize) -> Result<Expr, Error> {
    match pfx.segment() {
        None => Ok(ea),
        Some(Segment::Fs) => Ok(Expr::binop(
            Binop::Add64,
            ea,
            Expr::get(OFF_FS_ZERO, Ty::I64),
        )),
        Some(Segment::Gs) => Err(Error::new(ErrorKind::InvalidPrefixes, at)),
    }
}

/// How many address bytes (SIB plus displacement) the memory form named by
/// `modrm` occupies, without consuming or interpreting them. `sib` is only
/// looked at when the form has one. The caller must have checked mod != 3.
pub fn amode_len(modrm: u8, sib: u8) -> usize {
    let md = modrm >> 6;
    let rm = modrm & 7;
    assert!(md < 3, "amode_len: modrm names a register, not memory");

    if rm == 4 {
        let disp = if (sib & 7) == 5 && md == 0 {
            4
        } else {
            match md {
                0 => 0,
                1 => 1,
                _ => 4,
            }
        };
        1 + disp
    } else if md == 0 && rm == 5 {
        // rip-relative: always disp32.
        4
    } else {
        match md {
            0 => 0,
            1 => 1,
            _ => 4,
        }
    }
}

fn disp(rdr: &mut GuestReader, md: u8) -> Result<i64, Error> {
    Ok(match md {
        0 => 0,
        1 => rdr.next_i8()? as i64,
        _ => rdr.next_i32()? as i64,
    })
}

/// Decode the memory form named by `modrm`, consuming its SIB and
/// displacement bytes. `n_imm` is how many immediate bytes the instruction
/// carries after the address bytes; rip-relative forms need it to guess
/// the next instruction's address. The caller must have checked mod != 3.
pub fn disamode(
    sb: &mut SuperBlock,
    rdr: &mut GuestReader,
    pfx: &Prefixes,
    modrm: u8,
    n_imm: usize,
) -> Result<EffAddr, Error> {
    let md = modrm >> 6;
    let rm = modrm & 7;
    assert!(md < 3, "disamode: modrm names a register, not memory");

    let mut rip_guess = None;

    let ea = if rm == 4 {
        let sib = rdr.next()?;
        let scale = sib >> 6;
        let index = ((sib >> 3) & 7) | (pfx.rex.x() << 3);

        // Index 4 (with no REX.X) encodes "no index"; r12 still works.
        let index_expr = if index == 4 {
            None
        } else {
            let r = Expr::get(off_reg64(index), Ty::I64);
            Some(if scale == 0 {
                r
            } else {
                Expr::binop(Binop::Shl64, r, Expr::u8(scale))
            })
        };

        let (base_expr, d) = if (sib & 7) == 5 && md == 0 {
            // Base field 101 under mod=00: no base register, bare disp32.
            (None, rdr.next_i32()? as i64)
        } else {
            let base = (sib & 7) | (pfx.rex.b() << 3);
            (Some(Expr::get(off_reg64(base), Ty::I64)), disp(rdr, md)?)
        };

        let core = match (base_expr, index_expr) {
            (Some(b), Some(i)) => Expr::binop(Binop::Add64, b, i),
            (Some(b), None) => b,
            (None, Some(i)) => i,
            (None, None) => Expr::u64(d as u64),
        };
        if matches!(core, Expr::Const(_)) {
            core
        } else {
            Expr::binop(Binop::Add64, core, Expr::u64(d as u64))
        }
    } else if md == 0 && rm == 5 {
        let d = rdr.next_i32()? as i64;
        let assumed_next = rdr.addr() + n_imm as u64;
        rip_guess = Some(RipGuess { assumed_next });
        Expr::u64(assumed_next.wrapping_add(d as u64))
    } else {
        let reg = rm | (pfx.rex.b() << 3);
        let d = disp(rdr, md)?;
        Expr::binop(
            Binop::Add64,
            Expr::get(off_reg64(reg), Ty::I64),
            Expr::u64(d as u64),
        )
    };

    let ea = seg_adjust(pfx, ea, rdr.offset())?;
    let addr = Expr::tmp(sb.assign(ea));
    Ok(EffAddr { addr, rip_guess })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{OFF_RAX, OFF_RBP, OFF_RBX};
    use ir::Stmt;

    fn yes(_: u64) -> bool {
        true
    }

    fn resolve(bytes: &[u8], n_imm: usize) -> (SuperBlock, EffAddr, usize) {
        let acc = yes;
        let mut rdr = GuestReader::new(bytes, 0x4000, &acc);
        rdr.mark();
        let modrm = rdr.next().unwrap();
        let mut sb = SuperBlock::new();
        let pfx = Prefixes::default();
        let ea = disamode(&mut sb, &mut rdr, &pfx, modrm, n_imm).unwrap();
        let used = rdr.offset();
        (sb, ea, used)
    }

    fn assigned(sb: &SuperBlock) -> &Expr {
        match sb.stmts.last().unwrap() {
            Stmt::WrTmp(_, e) => e,
            other => panic!("expected WrTmp, got {other:?}"),
        }
    }

    #[test]
    fn plain_register_base() {
        // [rbx]
        let (sb, ea, used) = resolve(&[0x03], 0);
        assert_eq!(used, 1);
        assert!(ea.rip_guess.is_none());
        match assigned(&sb) {
            Expr::Binop(Binop::Add64, b, _) => {
                assert_eq!(**b, Expr::get(OFF_RBX, Ty::I64));
            }
            other => panic!("unexpected ea {other:?}"),
        }
    }

    #[test]
    fn disp8_sign_extends() {
        // [rbp - 8]
        let (sb, _, used) = resolve(&[0x45, 0xf8], 0);
        assert_eq!(used, 2);
        match assigned(&sb) {
            Expr::Binop(Binop::Add64, b, d) => {
                assert_eq!(**b, Expr::get(OFF_RBP, Ty::I64));
                assert_eq!(**d, Expr::u64((-8i64) as u64));
            }
            other => panic!("unexpected ea {other:?}"),
        }
    }

    #[test]
    fn rip_relative_guesses_past_immediates() {
        // [rip + 0x10] followed by a 4-byte immediate.
        let (sb, ea, used) = resolve(&[0x05, 0x10, 0x00, 0x00, 0x00], 4);
        assert_eq!(used, 5);
        let guess = ea.rip_guess.expect("rip form must guess");
        // modrm at 0x4000, disp ends at 0x4005, plus 4 imm bytes.
        assert_eq!(guess.assumed_next(), 0x4009);
        assert_eq!(*assigned(&sb), Expr::u64(0x4009 + 0x10));
        guess.verify(0x4009);
    }

    #[test]
    #[should_panic(expected = "guess missed")]
    fn bad_rip_guess_is_fatal() {
        let (_, ea, _) = resolve(&[0x05, 0x10, 0x00, 0x00, 0x00], 4);
        ea.rip_guess.unwrap().verify(0x400a);
    }

    #[test]
    fn sib_with_no_base_or_index_is_bare_disp32() {
        // modrm 0x04, sib 0x25: mod=00, index=100 (none), base=101.
        let (sb, _, used) = resolve(&[0x04, 0x25, 0x44, 0x33, 0x22, 0x11], 0);
        assert_eq!(used, 6);
        assert_eq!(*assigned(&sb), Expr::u64(0x11223344));
    }

    #[test]
    fn amode_len_matches_what_disamode_consumes() {
        // (bytes, n_imm) pairs reusing the resolver fixtures above.
        let cases: &[&[u8]] = &[
            &[0x03],                               // [rbx]
            &[0x45, 0xf8],                         // [rbp - 8]
            &[0x05, 0x10, 0x00, 0x00, 0x00],       // [rip + 0x10]
            &[0x04, 0x25, 0x44, 0x33, 0x22, 0x11], // bare disp32
            &[0x04, 0x58],                         // [rax + rbx*2]
            &[0x84, 0x58, 0x01, 0x00, 0x00, 0x00], // [rax + rbx*2 + 1]
        ];
        for bytes in cases {
            let (_, _, used) = resolve(bytes, 0);
            let sib = if bytes[0] & 7 == 4 { bytes[1] } else { 0 };
            // `used` counts the modrm byte itself; amode_len does not.
            assert_eq!(amode_len(bytes[0], sib), used - 1, "{bytes:x?}");
        }
    }

    #[test]
    fn sib_base_plus_scaled_index() {
        // modrm 0x04, sib 0x58: scale=1 (x2), index=rbx, base=rax.
        let (sb, _, _) = resolve(&[0x04, 0x58], 0);
        match assigned(&sb) {
            Expr::Binop(Binop::Add64, core, _) => match &**core {
                Expr::Binop(Binop::Add64, b, i) => {
                    assert_eq!(**b, Expr::get(OFF_RAX, Ty::I64));
                    assert_eq!(
                        **i,
                        Expr::binop(Binop::Shl64, Expr::get(OFF_RBX, Ty::I64), Expr::u8(1))
                    );
                }
                other => panic!("unexpected core {other:?}"),
            },
            other => panic!("unexpected ea {other:?}"),
        }
    }
}
