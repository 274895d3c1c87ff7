//! Deferred condition-flag bookkeeping.
//!
//! Arithmetic never computes %rflags eagerly. Instead each flag-setting
//! instruction records what it did in a four-slot thunk in guest state
//! (operation tag plus captured dependencies), and anything that actually
//! needs flag bits calls out to a pure helper that replays the recorded
//! operation. Consecutive flag writes then cost four state puts each, and
//! dead ones fall to the optimiser.

use ir::{Expr, Stmt, SuperBlock, Ty, Unop};

use crate::state::{OFF_CC_DEP1, OFF_CC_DEP2, OFF_CC_NDEP, OFF_CC_OP};

/// Replays the thunk and extracts one condition (helper args: cond, op,
/// dep1, dep2, ndep).
pub const HELPER_CONDITION: &str = "calculate_condition";
/// Replays the thunk into a full %rflags image (args: op, dep1, dep2, ndep).
pub const HELPER_RFLAGS_ALL: &str = "calculate_rflags_all";
/// Replays the thunk and extracts just the carry bit.
pub const HELPER_RFLAGS_C: &str = "calculate_rflags_c";

/// Flag-setting operation classes. The stored tag is `base + log2(size)`,
/// so each class covers the 1/2/4/8-byte variants.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CcClass {
    /// dep1 holds a literal %rflags image.
    Copy,
    Add,
    Sub,
    Adc,
    Sbb,
    Logic,
    Inc,
    Dec,
    Shl,
    Shr,
    Rol,
    Ror,
    UMul,
    SMul,
}

impl CcClass {
    fn base(self) -> u64 {
        use CcClass::*;
        match self {
            Copy => 0,
            Add => 1,
            Sub => 5,
            Adc => 9,
            Sbb => 13,
            Logic => 17,
            Inc => 21,
            Dec => 25,
            Shl => 29,
            Shr => 33,
            Rol => 37,
            Ror => 41,
            UMul => 45,
            SMul => 49,
        }
    }

    /// The thunk tag for this class at operand size `sz` bytes.
    pub fn op(self, sz: usize) -> u64 {
        if self == CcClass::Copy {
            return 0;
        }
        let lg = match sz {
            1 => 0,
            2 => 1,
            4 => 2,
            8 => 3,
            _ => panic!("CcClass::op: bad operand size {sz}"),
        };
        self.base() + lg
    }
}

/// Condition codes, in encoding order of the Jcc/SETcc/CMOVcc nibble.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cond {
    O = 0,
    No = 1,
    B = 2,
    Nb = 3,
    Z = 4,
    Nz = 5,
    Be = 6,
    Nbe = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Nl = 13,
    Le = 14,
    Nle = 15,
}

impl Cond {
    pub fn from_nibble(n: u8) -> Cond {
        use Cond::*;
        match n & 0xf {
            0 => O,
            1 => No,
            2 => B,
            3 => Nb,
            4 => Z,
            5 => Nz,
            6 => Be,
            7 => Nbe,
            8 => S,
            9 => Ns,
            10 => P,
            11 => Np,
            12 => L,
            13 => Nl,
            14 => Le,
            _ => Nle,
        }
    }
}

/// Zero-extend `e` to I64, materialised as an atom.
pub fn widen_u64(sb: &mut SuperBlock, e: Expr) -> Expr {
    let wide = match e.ty(&sb.tyenv) {
        Ty::I64 => e,
        Ty::I8 => Expr::unop(Unop::U8to64, e),
        Ty::I16 => Expr::unop(Unop::U16to64, e),
        Ty::I32 => Expr::unop(Unop::U32to64, e),
        Ty::I1 => Expr::unop(Unop::U1to64, e),
        other => panic!("widen_u64: cannot widen {other:?}"),
    };
    if wide.is_atom() {
        wide
    } else {
        Expr::tmp(sb.assign(wide))
    }
}

fn get_slot(off: i32) -> Expr {
    Expr::get(off, Ty::I64)
}

/// Overwrite all four thunk slots. Values narrower than I64 are
/// zero-extended first.
pub fn set_thunk(sb: &mut SuperBlock, op: Expr, dep1: Expr, dep2: Expr, ndep: Expr) {
    let op = widen_u64(sb, op);
    let dep1 = widen_u64(sb, dep1);
    let dep2 = widen_u64(sb, dep2);
    let ndep = widen_u64(sb, ndep);
    sb.push(Stmt::Put {
        off: OFF_CC_OP,
        data: op,
    });
    sb.push(Stmt::Put {
        off: OFF_CC_DEP1,
        data: dep1,
    });
    sb.push(Stmt::Put {
        off: OFF_CC_DEP2,
        data: dep2,
    });
    sb.push(Stmt::Put {
        off: OFF_CC_NDEP,
        data: ndep,
    });
}

/// As `set_thunk`, but each slot keeps its old value unless `guard` (an I8
/// atom) is non-zero. Used by shifts, whose flags are untouched when the
/// masked shift amount is zero.
pub fn set_thunk_guarded(
    sb: &mut SuperBlock,
    guard: Expr,
    op: Expr,
    dep1: Expr,
    dep2: Expr,
    ndep: Expr,
) {
    let op = widen_u64(sb, op);
    let dep1 = widen_u64(sb, dep1);
    let dep2 = widen_u64(sb, dep2);
    let ndep = widen_u64(sb, ndep);
    for (off, new) in [
        (OFF_CC_OP, op),
        (OFF_CC_DEP1, dep1),
        (OFF_CC_DEP2, dep2),
        (OFF_CC_NDEP, ndep),
    ] {
        let old = Expr::tmp(sb.assign(get_slot(off)));
        let sel = Expr::mux0x(guard.clone(), old, new);
        let data = Expr::tmp(sb.assign(sel));
        sb.push(Stmt::Put { off, data });
    }
}

/// Record a literal %rflags image in the thunk.
pub fn set_rflags_copy(sb: &mut SuperBlock, rflags: Expr) {
    set_thunk(
        sb,
        Expr::u64(CcClass::Copy.op(8)),
        rflags,
        Expr::u64(0),
        Expr::u64(0),
    );
}

fn thunk_args(sb: &mut SuperBlock) -> Vec<Expr> {
    vec![
        Expr::tmp(sb.assign(get_slot(OFF_CC_OP))),
        Expr::tmp(sb.assign(get_slot(OFF_CC_DEP1))),
        Expr::tmp(sb.assign(get_slot(OFF_CC_DEP2))),
        Expr::tmp(sb.assign(get_slot(OFF_CC_NDEP))),
    ]
}

/// An I64 that is 1 when `cond` currently holds, else 0.
pub fn condition(sb: &mut SuperBlock, cond: Cond) -> Expr {
    let mut args = vec![Expr::u64(cond as u64)];
    args.extend(thunk_args(sb));
    let call = Expr::ccall(HELPER_CONDITION, Ty::I64, args);
    Expr::tmp(sb.assign(call))
}

/// The full current %rflags image as an I64.
pub fn rflags_all(sb: &mut SuperBlock) -> Expr {
    let args = thunk_args(sb);
    let call = Expr::ccall(HELPER_RFLAGS_ALL, Ty::I64, args);
    Expr::tmp(sb.assign(call))
}

/// Just the carry flag, as an I64 that is 0 or 1.
pub fn rflags_c(sb: &mut SuperBlock) -> Expr {
    let args = thunk_args(sb);
    let call = Expr::ccall(HELPER_RFLAGS_C, Ty::I64, args);
    Expr::tmp(sb.assign(call))
}
