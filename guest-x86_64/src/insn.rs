//! Per-instruction translation to IR.
//!
//! One call to [`disas_insn`] consumes exactly one guest instruction from
//! the reader and appends its IR to the block. The caller owns instruction
//! markers, %rip maintenance, and the decision to keep going.

use decoder::{Error, ErrorKind, GuestReader, Outcome};
use ir::{Binop, Const, Dirty, Effect, Expr, JumpKind, StateFootprint, Stmt, SuperBlock, Ty, Unop};

use crate::amode::{amode_len, disamode, RipGuess};
use crate::flags::{self, CcClass, Cond};
use crate::prefix::Prefixes;
use crate::state::{
    off_reg64, off_reg8, OFF_DFLAG, OFF_IDFLAG, OFF_RAX, OFF_RBP, OFF_RCX, OFF_RDI, OFF_RDX,
    OFF_RSI, OFF_RSP,
};

/// No instruction may encode to more than this many bytes.
const MAX_INSN_LEN: usize = 15;

fn ity(sz: usize) -> Ty {
    Ty::int_of_size(sz)
}

fn sized(sz: usize, b8: Binop, b16: Binop, b32: Binop, b64: Binop) -> Binop {
    match sz {
        1 => b8,
        2 => b16,
        4 => b32,
        8 => b64,
        _ => panic!("bad operand size {sz}"),
    }
}

fn op_add(sz: usize) -> Binop {
    sized(sz, Binop::Add8, Binop::Add16, Binop::Add32, Binop::Add64)
}

fn op_sub(sz: usize) -> Binop {
    sized(sz, Binop::Sub8, Binop::Sub16, Binop::Sub32, Binop::Sub64)
}

fn op_and(sz: usize) -> Binop {
    sized(sz, Binop::And8, Binop::And16, Binop::And32, Binop::And64)
}

fn op_or(sz: usize) -> Binop {
    sized(sz, Binop::Or8, Binop::Or16, Binop::Or32, Binop::Or64)
}

fn op_xor(sz: usize) -> Binop {
    sized(sz, Binop::Xor8, Binop::Xor16, Binop::Xor32, Binop::Xor64)
}

fn op_shl(sz: usize) -> Binop {
    sized(sz, Binop::Shl8, Binop::Shl16, Binop::Shl32, Binop::Shl64)
}

fn op_shr(sz: usize) -> Binop {
    sized(sz, Binop::Shr8, Binop::Shr16, Binop::Shr32, Binop::Shr64)
}

fn op_sar(sz: usize) -> Binop {
    sized(sz, Binop::Sar8, Binop::Sar16, Binop::Sar32, Binop::Sar64)
}

fn const_of_size(sz: usize, v: u64) -> Expr {
    match sz {
        1 => Expr::u8(v as u8),
        2 => Expr::u16(v as u16),
        4 => Expr::u32(v as u32),
        8 => Expr::u64(v),
        _ => panic!("bad operand size {sz}"),
    }
}

/// Immediate bytes an "Iz" operand occupies at operand size `sz`.
fn n_imm_z(sz: usize) -> usize {
    if sz == 2 {
        2
    } else {
        4
    }
}

/// The two-operand ALU family, in ModRM reg-field/opcode-row order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    fn from_index(i: u8) -> AluOp {
        use AluOp::*;
        [Add, Or, Adc, Sbb, And, Sub, Xor, Cmp][(i & 7) as usize]
    }

    fn writes_back(self) -> bool {
        self != AluOp::Cmp
    }
}

/// Where a ModRM byte pointed: a register number or a resolved address.
enum Operand {
    Reg(u8),
    Mem(Expr),
}

/// Opcodes a lock prefix may legally precede (the read-modify-write set).
fn lock_allowed(opcode: u8) -> bool {
    matches!(
        opcode,
        0x00 | 0x01 | 0x08 | 0x09 | 0x10 | 0x11 | 0x18 | 0x19 | 0x20 | 0x21 | 0x28 | 0x29
            | 0x30 | 0x31 | 0x80 | 0x81 | 0x83 | 0x86 | 0x87 | 0xf6 | 0xf7 | 0xfe | 0xff
    )
}

struct Ctx<'a, 'g> {
    sb: &'a mut SuperBlock,
    rdr: &'a mut GuestReader<'g>,
    pfx: Prefixes,
    insn_addr: u64,
    rip_guess: Option<RipGuess>,
}

/// Decode the instruction at the reader's position into `sb`.
///
/// On success the reader sits one past the instruction and the returned
/// [`Outcome`] says whether the block may keep growing. `resteer_ok` is
/// consulted before offering to chase an unconditional direct branch. On
/// error the reader position is unspecified; the caller is expected to
/// discard whatever this call appended.
pub fn disas_insn(
    sb: &mut SuperBlock,
    rdr: &mut GuestReader<'_>,
    resteer_ok: &dyn Fn(u64) -> bool,
) -> Result<Outcome, Error> {
    rdr.mark();
    let insn_addr = rdr.addr();
    let pfx = Prefixes::parse(rdr)?;
    let mut ctx = Ctx {
        sb,
        rdr,
        pfx,
        insn_addr,
        rip_guess: None,
    };
    let out = ctx.dispatch(resteer_ok)?;

    let len = ctx.rdr.offset();
    if len > MAX_INSN_LEN {
        return Err(Error::new(ErrorKind::TooLong, len));
    }
    if let Some(g) = ctx.rip_guess.take() {
        g.verify(insn_addr + len as u64);
    }
    Ok(out)
}

impl<'a, 'g> Ctx<'a, 'g> {
    fn err(&self, kind: ErrorKind) -> Error {
        Error::new(kind, self.rdr.offset())
    }

    /// Materialise `e` as an atom.
    fn atom(&mut self, e: Expr) -> Expr {
        if e.is_atom() {
            e
        } else {
            Expr::tmp(self.sb.assign(e))
        }
    }

    fn greg(&self, modrm: u8) -> u8 {
        ((modrm >> 3) & 7) | (self.pfx.rex.r() << 3)
    }

    fn ereg(&self, modrm: u8) -> u8 {
        (modrm & 7) | (self.pfx.rex.b() << 3)
    }

    /// The bare state read for a register, not yet bound to a temporary.
    /// Only safe to embed directly in a statement when nothing between
    /// here and that statement writes the register.
    fn reg_expr(&self, sz: usize, num: u8) -> Expr {
        let off = if sz == 1 {
            off_reg8(self.pfx.rex.present(), num)
        } else {
            off_reg64(num)
        };
        Expr::get(off, ity(sz))
    }

    fn get_reg(&mut self, sz: usize, num: u8) -> Expr {
        let e = self.reg_expr(sz, num);
        self.atom(e)
    }

    /// Write a register at operand size `sz`. 32-bit writes zero the upper
    /// half of the full register; 8- and 16-bit writes leave it alone.
    fn put_reg(&mut self, sz: usize, num: u8, data: Expr) {
        match sz {
            1 => {
                let off = off_reg8(self.pfx.rex.present(), num);
                self.sb.push(Stmt::Put { off, data });
            }
            2 => self.sb.push(Stmt::Put {
                off: off_reg64(num),
                data,
            }),
            4 => self.sb.push(Stmt::Put {
                off: off_reg64(num),
                data: Expr::unop(Unop::U32to64, data),
            }),
            8 => self.sb.push(Stmt::Put {
                off: off_reg64(num),
                data,
            }),
            _ => panic!("bad operand size {sz}"),
        }
    }

    /// Resolve the r/m half of `modrm`. `n_imm` is the trailing immediate
    /// size, needed by rip-relative forms.
    fn modrm_operand(&mut self, modrm: u8, n_imm: usize) -> Result<Operand, Error> {
        if modrm >> 6 == 3 {
            Ok(Operand::Reg(self.ereg(modrm)))
        } else {
            let ea = disamode(self.sb, self.rdr, &self.pfx, modrm, n_imm)?;
            if let Some(g) = ea.rip_guess {
                assert!(self.rip_guess.is_none(), "two rip-relative operands");
                self.rip_guess = Some(g);
            }
            Ok(Operand::Mem(ea.addr))
        }
    }

    fn read_operand(&mut self, sz: usize, op: &Operand) -> Expr {
        match op {
            Operand::Reg(r) => self.get_reg(sz, *r),
            Operand::Mem(addr) => {
                let load = Expr::load(ity(sz), addr.clone());
                self.atom(load)
            }
        }
    }

    fn write_operand(&mut self, sz: usize, op: &Operand, data: Expr) {
        match op {
            Operand::Reg(r) => self.put_reg(sz, *r, data),
            Operand::Mem(addr) => self.sb.push(Stmt::Store {
                addr: addr.clone(),
                data,
            }),
        }
    }

    /// An "Iz" immediate: `sz` bytes for sizes up to 4, else 4 bytes
    /// sign-extended to 64.
    fn imm_z(&mut self, sz: usize) -> Result<Expr, Error> {
        Ok(match sz {
            1 => Expr::u8(self.rdr.next()?),
            2 => Expr::u16(self.rdr.next_u16()?),
            4 => Expr::u32(self.rdr.next_u32()?),
            8 => Expr::u64(self.rdr.next_i32()? as i64 as u64),
            _ => panic!("bad operand size {sz}"),
        })
    }

    /// An "Ib" immediate sign-extended to operand size.
    fn imm8_sx(&mut self, sz: usize) -> Result<Expr, Error> {
        let v = self.rdr.next_i8()? as i64;
        Ok(const_of_size(sz, v as u64))
    }

    /// Truncate an I64 atom down to operand size.
    fn narrow(&mut self, sz: usize, e: Expr) -> Expr {
        let op = match sz {
            8 => return e,
            4 => Unop::T64to32,
            2 => Unop::T64to16,
            1 => Unop::T64to8,
            _ => panic!("bad operand size {sz}"),
        };
        self.atom(Expr::unop(op, e))
    }

    /// Compute `a1 op a2`, record the flags thunk, and return the result
    /// atom. The caller decides about writeback (cmp discards it).
    fn alu(&mut self, op: AluOp, sz: usize, a1: Expr, a2: Expr) -> Expr {
        match op {
            AluOp::Add => {
                let r = self.atom(Expr::binop(op_add(sz), a1.clone(), a2.clone()));
                flags::set_thunk(
                    self.sb,
                    Expr::u64(CcClass::Add.op(sz)),
                    a1,
                    a2,
                    Expr::u64(0),
                );
                r
            }
            AluOp::Sub | AluOp::Cmp => {
                let r = self.atom(Expr::binop(op_sub(sz), a1.clone(), a2.clone()));
                flags::set_thunk(
                    self.sb,
                    Expr::u64(CcClass::Sub.op(sz)),
                    a1,
                    a2,
                    Expr::u64(0),
                );
                r
            }
            AluOp::And | AluOp::Or | AluOp::Xor => {
                let bop = match op {
                    AluOp::And => op_and(sz),
                    AluOp::Or => op_or(sz),
                    _ => op_xor(sz),
                };
                let r = self.atom(Expr::binop(bop, a1, a2));
                flags::set_thunk(
                    self.sb,
                    Expr::u64(CcClass::Logic.op(sz)),
                    r.clone(),
                    Expr::u64(0),
                    Expr::u64(0),
                );
                r
            }
            AluOp::Adc | AluOp::Sbb => {
                let c64 = flags::rflags_c(self.sb);
                let c = self.narrow(sz, c64.clone());
                let (bop, class) = if op == AluOp::Adc {
                    (op_add(sz), CcClass::Adc)
                } else {
                    (op_sub(sz), CcClass::Sbb)
                };
                let part = self.atom(Expr::binop(bop, a1.clone(), a2.clone()));
                let r = self.atom(Expr::binop(bop, part, c.clone()));
                let dep2 = self.atom(Expr::binop(op_xor(sz), a2, c));
                flags::set_thunk(self.sb, Expr::u64(class.op(sz)), a1, dep2, c64);
                r
            }
        }
    }

    /// `test`-style flag update: and the operands, keep only the thunk.
    fn test_flags(&mut self, sz: usize, a1: Expr, a2: Expr) {
        let r = self.atom(Expr::binop(op_and(sz), a1, a2));
        flags::set_thunk(
            self.sb,
            Expr::u64(CcClass::Logic.op(sz)),
            r,
            Expr::u64(0),
            Expr::u64(0),
        );
    }

    fn push_value(&mut self, sz: usize, data: Expr) {
        let rsp = self.atom(Expr::get(OFF_RSP, Ty::I64));
        let nsp = self.atom(Expr::binop(Binop::Sub64, rsp, Expr::u64(sz as u64)));
        self.sb.push(Stmt::Put {
            off: OFF_RSP,
            data: nsp.clone(),
        });
        self.sb.push(Stmt::Store { addr: nsp, data });
    }

    fn pop_value(&mut self, sz: usize) -> Expr {
        let rsp = self.atom(Expr::get(OFF_RSP, Ty::I64));
        let v = self.atom(Expr::load(ity(sz), rsp.clone()));
        let nsp = self.atom(Expr::binop(Binop::Add64, rsp, Expr::u64(sz as u64)));
        self.sb.push(Stmt::Put {
            off: OFF_RSP,
            data: nsp,
        });
        v
    }

    fn branch_to(&mut self, target: Expr, jk: JumpKind) -> Outcome {
        self.sb.next = target;
        self.sb.jumpkind = jk;
        Outcome::StopHere
    }

    /// Conditional branch: side exit to `target`, fall through to `next`.
    fn jcc(&mut self, cond: Cond, target: u64, next: u64) -> Outcome {
        let c = flags::condition(self.sb, cond);
        let guard = self.atom(Expr::binop(Binop::CmpNe64, c, Expr::u64(0)));
        self.sb.push(Stmt::Exit {
            guard,
            dst: Const::U64(target),
            jk: JumpKind::Boring,
        });
        self.branch_to(Expr::u64(next), JumpKind::Boring)
    }

    fn dispatch(&mut self, resteer_ok: &dyn Fn(u64) -> bool) -> Result<Outcome, Error> {
        let opcode = self.rdr.next()?;
        if self.pfx.lock() {
            if !lock_allowed(opcode) {
                return Err(self.err(ErrorKind::InvalidPrefixes));
            }
            self.sb.push(Stmt::MFence);
        }
        let sz = self.pfx.op_size();

        match opcode {
            0x0f => self.dispatch_0f(sz),

            // The 8x6 two-operand ALU block.
            op if op < 0x40 && (op & 7) < 6 => {
                self.dis_alu(op, sz)?;
                Ok(Outcome::Continue)
            }

            0x50..=0x57 => {
                let num = (opcode & 7) | (self.pfx.rex.b() << 3);
                let psz = if self.pfx.operand_size() { 2 } else { 8 };
                let v = self.get_reg(psz, num);
                self.push_value(psz, v);
                Ok(Outcome::Continue)
            }
            0x58..=0x5f => {
                let num = (opcode & 7) | (self.pfx.rex.b() << 3);
                let psz = if self.pfx.operand_size() { 2 } else { 8 };
                let v = self.pop_value(psz);
                self.put_reg(psz, num, v);
                Ok(Outcome::Continue)
            }

            // movsxd Gv, Ed
            0x63 => {
                let modrm = self.rdr.next()?;
                let op = self.modrm_operand(modrm, 0)?;
                let src = self.read_operand(4, &op);
                let dst = self.greg(modrm);
                if sz == 8 {
                    let w = self.atom(Expr::unop(Unop::S32to64, src));
                    self.put_reg(8, dst, w);
                } else {
                    self.put_reg(4, dst, src);
                }
                Ok(Outcome::Continue)
            }

            0x68 => {
                let v = self.rdr.next_i32()? as i64 as u64;
                self.push_value(8, Expr::u64(v));
                Ok(Outcome::Continue)
            }
            0x6a => {
                let v = self.rdr.next_i8()? as i64 as u64;
                self.push_value(8, Expr::u64(v));
                Ok(Outcome::Continue)
            }

            // imul Gv, Ev, Iz / Ib
            0x69 | 0x6b => {
                let modrm = self.rdr.next()?;
                let n_imm = if opcode == 0x69 { n_imm_z(sz) } else { 1 };
                let op = self.modrm_operand(modrm, n_imm)?;
                let a1 = self.read_operand(sz, &op);
                let a2 = if opcode == 0x69 {
                    self.imm_z(sz)?
                } else {
                    self.imm8_sx(sz)?
                };
                let dst = self.greg(modrm);
                self.imul_truncating(sz, dst, a1, a2);
                Ok(Outcome::Continue)
            }

            0x70..=0x7f => {
                let cond = Cond::from_nibble(opcode);
                let d = self.rdr.next_i8()? as i64;
                let next = self.rdr.addr();
                Ok(self.jcc(cond, next.wrapping_add(d as u64), next))
            }

            0x80 | 0x81 | 0x83 => self.dis_grp1(opcode, sz),

            0x84 | 0x85 => {
                let tsz = if opcode == 0x84 { 1 } else { sz };
                let modrm = self.rdr.next()?;
                let op = self.modrm_operand(modrm, 0)?;
                let a1 = self.read_operand(tsz, &op);
                let greg = self.greg(modrm);
                let a2 = self.get_reg(tsz, greg);
                self.test_flags(tsz, a1, a2);
                Ok(Outcome::Continue)
            }

            0x86 | 0x87 => {
                let xsz = if opcode == 0x86 { 1 } else { sz };
                let modrm = self.rdr.next()?;
                let op = self.modrm_operand(modrm, 0)?;
                let greg = self.greg(modrm);
                let v1 = self.read_operand(xsz, &op);
                let v2 = self.get_reg(xsz, greg);
                self.write_operand(xsz, &op, v2);
                self.put_reg(xsz, greg, v1);
                Ok(Outcome::Continue)
            }

            // mov never re-reads its destination, so the source read can
            // ride in the write statement itself: a register-to-register
            // move is a single Put.
            0x88..=0x8b => {
                let msz = if opcode & 1 == 0 { 1 } else { sz };
                let modrm = self.rdr.next()?;
                let op = self.modrm_operand(modrm, 0)?;
                let greg = self.greg(modrm);
                if opcode < 0x8a {
                    let v = self.reg_expr(msz, greg);
                    self.write_operand(msz, &op, v);
                } else {
                    let v = match &op {
                        Operand::Reg(r) => self.reg_expr(msz, *r),
                        Operand::Mem(addr) => Expr::load(ity(msz), addr.clone()),
                    };
                    self.put_reg(msz, greg, v);
                }
                Ok(Outcome::Continue)
            }

            0x8d => {
                let modrm = self.rdr.next()?;
                if modrm >> 6 == 3 {
                    return Err(self.err(ErrorKind::InvalidOperand));
                }
                let op = self.modrm_operand(modrm, 0)?;
                let addr = match op {
                    Operand::Mem(a) => a,
                    Operand::Reg(_) => unreachable!(),
                };
                let dst = self.greg(modrm);
                let v = self.narrow(sz.max(2), addr);
                self.put_reg(sz.max(2), dst, v);
                Ok(Outcome::Continue)
            }

            0x8f => {
                let modrm = self.rdr.next()?;
                if (modrm >> 3) & 7 != 0 {
                    return Err(self.err(ErrorKind::InvalidOpcode));
                }
                let psz = if self.pfx.operand_size() { 2 } else { 8 };
                // The pop adjusts rsp first; an rsp-relative destination
                // sees the incremented value.
                let v = self.pop_value(psz);
                let op = self.modrm_operand(modrm, 0)?;
                self.write_operand(psz, &op, v);
                Ok(Outcome::Continue)
            }

            // xchg rAX, r (0x90 with no REX.B is nop/pause)
            0x90..=0x97 => {
                let num = (opcode & 7) | (self.pfx.rex.b() << 3);
                if num == 0 {
                    return Ok(Outcome::Continue);
                }
                let a = self.get_reg(sz, 0);
                let r = self.get_reg(sz, num);
                self.put_reg(sz, 0, r);
                self.put_reg(sz, num, a);
                Ok(Outcome::Continue)
            }

            // cbw/cwde/cdqe: sign-extend the lower half of rAX in place.
            0x98 => {
                let (ssz, uop) = match sz {
                    2 => (1, Unop::S8to16),
                    4 => (2, Unop::S16to32),
                    _ => (4, Unop::S32to64),
                };
                let x = self.get_reg(ssz, 0);
                let w = self.atom(Expr::unop(uop, x));
                self.put_reg(sz, 0, w);
                Ok(Outcome::Continue)
            }
            // cwd/cdq/cqo: rDX = sign of rAX.
            0x99 => {
                let x = self.get_reg(sz, 0);
                let shift = (8 * sz - 1) as u8;
                let s = self.atom(Expr::binop(op_sar(sz), x, Expr::u8(shift)));
                self.put_reg(sz, 2, s);
                Ok(Outcome::Continue)
            }

            0x9c => {
                self.dis_pushf();
                Ok(Outcome::Continue)
            }
            0x9d => {
                self.dis_popf();
                Ok(Outcome::Continue)
            }

            0xa4 | 0xa5 => {
                let ssz = if opcode == 0xa4 { 1 } else { sz };
                self.dis_string(ssz, true)
            }
            0xaa | 0xab => {
                let ssz = if opcode == 0xaa { 1 } else { sz };
                self.dis_string(ssz, false)
            }

            0xa8 | 0xa9 => {
                let tsz = if opcode == 0xa8 { 1 } else { sz };
                let imm = self.imm_z(tsz)?;
                let a1 = self.get_reg(tsz, 0);
                self.test_flags(tsz, a1, imm);
                Ok(Outcome::Continue)
            }

            0xb0..=0xb7 => {
                let num = (opcode & 7) | (self.pfx.rex.b() << 3);
                let v = self.rdr.next()?;
                self.put_reg(1, num, Expr::u8(v));
                Ok(Outcome::Continue)
            }
            0xb8..=0xbf => {
                let num = (opcode & 7) | (self.pfx.rex.b() << 3);
                // The one instruction with a full 64-bit immediate.
                let imm = match sz {
                    8 => Expr::u64(self.rdr.next_u64()?),
                    4 => Expr::u32(self.rdr.next_u32()?),
                    _ => Expr::u16(self.rdr.next_u16()?),
                };
                self.put_reg(sz, num, imm);
                Ok(Outcome::Continue)
            }

            0xc0 | 0xc1 => {
                let ssz = if opcode == 0xc0 { 1 } else { sz };
                let modrm = self.rdr.next()?;
                let op = self.modrm_operand(modrm, 1)?;
                let amt = self.rdr.next()?;
                self.dis_shift(ssz, &op, (modrm >> 3) & 7, Expr::u8(amt))?;
                Ok(Outcome::Continue)
            }
            0xd0..=0xd3 => {
                let ssz = if opcode & 1 == 0 { 1 } else { sz };
                let modrm = self.rdr.next()?;
                let op = self.modrm_operand(modrm, 0)?;
                let amt = if opcode < 0xd2 {
                    Expr::u8(1)
                } else {
                    self.atom(Expr::get(OFF_RCX, Ty::I8))
                };
                self.dis_shift(ssz, &op, (modrm >> 3) & 7, amt)?;
                Ok(Outcome::Continue)
            }

            0xc2 => {
                let imm = self.rdr.next_u16()? as u64;
                let rsp = self.atom(Expr::get(OFF_RSP, Ty::I64));
                let ret = self.atom(Expr::load(Ty::I64, rsp.clone()));
                let nsp = self.atom(Expr::binop(Binop::Add64, rsp, Expr::u64(8 + imm)));
                self.sb.push(Stmt::Put {
                    off: OFF_RSP,
                    data: nsp,
                });
                Ok(self.branch_to(ret, JumpKind::Ret))
            }
            0xc3 => {
                let ret = self.pop_value(8);
                Ok(self.branch_to(ret, JumpKind::Ret))
            }

            0xc6 | 0xc7 => {
                let msz = if opcode == 0xc6 { 1 } else { sz };
                let modrm = self.rdr.next()?;
                if (modrm >> 3) & 7 != 0 {
                    return Err(self.err(ErrorKind::InvalidOperand));
                }
                let n_imm = if msz == 1 { 1 } else { n_imm_z(msz) };
                let op = self.modrm_operand(modrm, n_imm)?;
                let imm = self.imm_z(msz)?;
                self.write_operand(msz, &op, imm);
                Ok(Outcome::Continue)
            }

            0xc9 => {
                let rbp = self.atom(Expr::get(OFF_RBP, Ty::I64));
                let v = self.atom(Expr::load(Ty::I64, rbp.clone()));
                let nsp = self.atom(Expr::binop(Binop::Add64, rbp, Expr::u64(8)));
                self.sb.push(Stmt::Put {
                    off: OFF_RSP,
                    data: nsp,
                });
                self.sb.push(Stmt::Put {
                    off: OFF_RBP,
                    data: v,
                });
                Ok(Outcome::Continue)
            }

            0xcc => {
                let next = self.rdr.addr();
                Ok(self.branch_to(Expr::u64(next), JumpKind::Trap))
            }

            0xe8 => {
                let d = self.rdr.next_i32()? as i64;
                let next = self.rdr.addr();
                let target = next.wrapping_add(d as u64);
                self.push_value(8, Expr::u64(next));
                Ok(self.branch_to(Expr::u64(target), JumpKind::Call))
            }
            0xe9 | 0xeb => {
                let d = if opcode == 0xe9 {
                    self.rdr.next_i32()? as i64
                } else {
                    self.rdr.next_i8()? as i64
                };
                let target = self.rdr.addr().wrapping_add(d as u64);
                if resteer_ok(target) {
                    Ok(Outcome::Resteer { target })
                } else {
                    Ok(self.branch_to(Expr::u64(target), JumpKind::Boring))
                }
            }

            0xf4 => Ok(self.branch_to(Expr::u64(self.insn_addr), JumpKind::Trap)),

            0xf5 | 0xf8 | 0xf9 => {
                let old = flags::rflags_all(self.sb);
                let new = self.atom(match opcode {
                    0xf5 => Expr::binop(Binop::Xor64, old, Expr::u64(1)),
                    0xf8 => Expr::binop(Binop::And64, old, Expr::u64(!1)),
                    _ => Expr::binop(Binop::Or64, old, Expr::u64(1)),
                });
                flags::set_rflags_copy(self.sb, new);
                Ok(Outcome::Continue)
            }

            0xf6 | 0xf7 => {
                let gsz = if opcode == 0xf6 { 1 } else { sz };
                self.dis_grp3(gsz)
            }

            0xfc | 0xfd => {
                let d = if opcode == 0xfc { 1u64 } else { (-1i64) as u64 };
                self.sb.push(Stmt::Put {
                    off: OFF_DFLAG,
                    data: Expr::u64(d),
                });
                Ok(Outcome::Continue)
            }

            0xfe => {
                let modrm = self.rdr.next()?;
                let reg = (modrm >> 3) & 7;
                if reg > 1 {
                    return Err(self.err(ErrorKind::InvalidOpcode));
                }
                let op = self.modrm_operand(modrm, 0)?;
                self.inc_dec(1, &op, reg == 0);
                Ok(Outcome::Continue)
            }
            0xff => self.dis_grp5(sz),

            _ => Err(self.err(ErrorKind::InvalidOpcode)),
        }
    }

    fn dispatch_0f(&mut self, sz: usize) -> Result<Outcome, Error> {
        let opcode = self.rdr.next()?;
        match opcode {
            // syscall: hardware stashes the return address in rcx and the
            // flags in r11 before entering the kernel.
            0x05 => {
                let next = self.rdr.addr();
                self.sb.push(Stmt::Put {
                    off: OFF_RCX,
                    data: Expr::u64(next),
                });
                let fl = flags::rflags_all(self.sb);
                self.sb.push(Stmt::Put {
                    off: off_reg64(11),
                    data: fl,
                });
                Ok(self.branch_to(Expr::u64(next), JumpKind::Syscall))
            }

            // Long nop: skips over a full ModRM operand without resolving
            // it, so no dead address IR lands in the block.
            0x1f => {
                let modrm = self.rdr.next()?;
                if modrm >> 6 != 3 {
                    let sib = if modrm & 7 == 4 { self.rdr.peek()? } else { 0 };
                    for _ in 0..amode_len(modrm, sib) {
                        self.rdr.next()?;
                    }
                }
                Ok(Outcome::Continue)
            }

            0x31 => {
                let t = self.sb.new_temp(Ty::I64);
                self.sb.push(Stmt::Dirty(Dirty {
                    callee: "read_tsc",
                    guard: Expr::Const(Const::U1(true)),
                    args: vec![],
                    dst: Some(t),
                    mem: None,
                    state: vec![],
                }));
                let lo = self.atom(Expr::unop(Unop::T64to32, Expr::tmp(t)));
                self.put_reg(4, 0, lo);
                let hi = self.atom(Expr::unop(Unop::Hi64to32, Expr::tmp(t)));
                self.put_reg(4, 2, hi);
                Ok(Outcome::Continue)
            }

            0x40..=0x4f => {
                let modrm = self.rdr.next()?;
                let op = self.modrm_operand(modrm, 0)?;
                let src = self.read_operand(sz, &op);
                let dst = self.greg(modrm);
                let old = self.get_reg(sz, dst);
                let c = flags::condition(self.sb, Cond::from_nibble(opcode));
                let c8 = self.atom(Expr::unop(Unop::T64to8, c));
                let v = self.atom(Expr::mux0x(c8, old, src));
                self.put_reg(sz, dst, v);
                Ok(Outcome::Continue)
            }

            0x80..=0x8f => {
                let cond = Cond::from_nibble(opcode);
                let d = self.rdr.next_i32()? as i64;
                let next = self.rdr.addr();
                Ok(self.jcc(cond, next.wrapping_add(d as u64), next))
            }

            0x90..=0x9f => {
                let modrm = self.rdr.next()?;
                let op = self.modrm_operand(modrm, 0)?;
                let c = flags::condition(self.sb, Cond::from_nibble(opcode));
                let b = self.atom(Expr::unop(Unop::T64to8, c));
                self.write_operand(1, &op, b);
                Ok(Outcome::Continue)
            }

            0xa2 => {
                self.sb.push(Stmt::Dirty(Dirty {
                    callee: "cpuid",
                    guard: Expr::Const(Const::U1(true)),
                    args: vec![],
                    dst: None,
                    mem: None,
                    state: vec![
                        StateFootprint {
                            fx: Effect::Modify,
                            offset: OFF_RAX,
                            size: 8,
                        },
                        StateFootprint {
                            fx: Effect::Modify,
                            offset: off_reg64(3),
                            size: 8,
                        },
                        StateFootprint {
                            fx: Effect::Modify,
                            offset: OFF_RCX,
                            size: 8,
                        },
                        StateFootprint {
                            fx: Effect::Modify,
                            offset: OFF_RDX,
                            size: 8,
                        },
                    ],
                }));
                Ok(Outcome::Continue)
            }

            0xaf => {
                let modrm = self.rdr.next()?;
                let op = self.modrm_operand(modrm, 0)?;
                let a2 = self.read_operand(sz, &op);
                let dst = self.greg(modrm);
                let a1 = self.get_reg(sz, dst);
                self.imul_truncating(sz, dst, a1, a2);
                Ok(Outcome::Continue)
            }

            0xb6 | 0xb7 | 0xbe | 0xbf => {
                let ssz = if opcode & 1 == 0 { 1 } else { 2 };
                let signed = opcode >= 0xbe;
                let modrm = self.rdr.next()?;
                let op = self.modrm_operand(modrm, 0)?;
                let src = self.read_operand(ssz, &op);
                let dst = self.greg(modrm);
                let dsz = sz.max(2);
                if ssz == dsz {
                    self.put_reg(dsz, dst, src);
                } else {
                    let uop = match (ssz, dsz, signed) {
                        (1, 2, false) => Unop::U8to16,
                        (1, 4, false) => Unop::U8to32,
                        (1, 8, false) => Unop::U8to64,
                        (2, 4, false) => Unop::U16to32,
                        (2, 8, false) => Unop::U16to64,
                        (1, 2, true) => Unop::S8to16,
                        (1, 4, true) => Unop::S8to32,
                        (1, 8, true) => Unop::S8to64,
                        (2, 4, true) => Unop::S16to32,
                        (2, 8, true) => Unop::S16to64,
                        _ => unreachable!(),
                    };
                    let w = self.atom(Expr::unop(uop, src));
                    self.put_reg(dsz, dst, w);
                }
                Ok(Outcome::Continue)
            }

            0xc8..=0xcf => {
                let num = (opcode & 7) | (self.pfx.rex.b() << 3);
                let bsz = if sz == 8 { 8 } else { 4 };
                let x = self.get_reg(bsz, num);
                let r = self.bswap(bsz, x);
                self.put_reg(bsz, num, r);
                Ok(Outcome::Continue)
            }

            _ => Err(self.err(ErrorKind::InvalidOpcode)),
        }
    }

    fn dis_alu(&mut self, opcode: u8, sz: usize) -> Result<(), Error> {
        let aop = AluOp::from_index(opcode >> 3);
        let col = opcode & 7;
        let esz = if col & 1 == 0 { 1 } else { sz };
        match col {
            // E, G: r/m is destination.
            0 | 1 => {
                let modrm = self.rdr.next()?;
                let op = self.modrm_operand(modrm, 0)?;
                let a1 = self.read_operand(esz, &op);
                let greg = self.greg(modrm);
                let a2 = self.get_reg(esz, greg);
                let r = self.alu(aop, esz, a1, a2);
                if aop.writes_back() {
                    self.write_operand(esz, &op, r);
                }
            }
            // G, E: register is destination.
            2 | 3 => {
                let modrm = self.rdr.next()?;
                let op = self.modrm_operand(modrm, 0)?;
                let greg = self.greg(modrm);
                let a1 = self.get_reg(esz, greg);
                let a2 = self.read_operand(esz, &op);
                let r = self.alu(aop, esz, a1, a2);
                if aop.writes_back() {
                    self.put_reg(esz, greg, r);
                }
            }
            // AL/eAX, imm.
            4 | 5 => {
                let imm = self.imm_z(esz)?;
                let a1 = self.get_reg(esz, 0);
                let r = self.alu(aop, esz, a1, imm);
                if aop.writes_back() {
                    self.put_reg(esz, 0, r);
                }
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn dis_grp1(&mut self, opcode: u8, sz: usize) -> Result<Outcome, Error> {
        let esz = if opcode == 0x80 { 1 } else { sz };
        let modrm = self.rdr.next()?;
        let aop = AluOp::from_index((modrm >> 3) & 7);
        let n_imm = if opcode == 0x81 { n_imm_z(esz) } else { 1 };
        let op = self.modrm_operand(modrm, n_imm)?;
        let imm = if opcode == 0x83 {
            self.imm8_sx(esz)?
        } else {
            self.imm_z(esz)?
        };
        let a1 = self.read_operand(esz, &op);
        let r = self.alu(aop, esz, a1, imm);
        if aop.writes_back() {
            self.write_operand(esz, &op, r);
        }
        Ok(Outcome::Continue)
    }

    fn inc_dec(&mut self, sz: usize, op: &Operand, is_inc: bool) {
        let x = self.read_operand(sz, op);
        let one = const_of_size(sz, 1);
        let (bop, class) = if is_inc {
            (op_add(sz), CcClass::Inc)
        } else {
            (op_sub(sz), CcClass::Dec)
        };
        let r = self.atom(Expr::binop(bop, x, one));
        // inc/dec leave carry alone, so the old carry rides in ndep.
        let c64 = flags::rflags_c(self.sb);
        flags::set_thunk(
            self.sb,
            Expr::u64(class.op(sz)),
            r.clone(),
            Expr::u64(0),
            c64,
        );
        self.write_operand(sz, op, r);
    }

    fn dis_grp3(&mut self, sz: usize) -> Result<Outcome, Error> {
        let modrm = self.rdr.next()?;
        let reg = (modrm >> 3) & 7;
        let n_imm = if reg <= 1 {
            if sz == 1 {
                1
            } else {
                n_imm_z(sz)
            }
        } else {
            0
        };
        let op = self.modrm_operand(modrm, n_imm)?;
        match reg {
            0 | 1 => {
                let imm = self.imm_z(sz)?;
                let a1 = self.read_operand(sz, &op);
                self.test_flags(sz, a1, imm);
            }
            2 => {
                let x = self.read_operand(sz, &op);
                let nop = match sz {
                    1 => Unop::Not8,
                    2 => Unop::Not16,
                    4 => Unop::Not32,
                    _ => Unop::Not64,
                };
                let r = self.atom(Expr::unop(nop, x));
                self.write_operand(sz, &op, r);
            }
            3 => {
                let x = self.read_operand(sz, &op);
                let zero = const_of_size(sz, 0);
                let r = self.atom(Expr::binop(op_sub(sz), zero.clone(), x.clone()));
                flags::set_thunk(self.sb, Expr::u64(CcClass::Sub.op(sz)), zero, x, Expr::u64(0));
                self.write_operand(sz, &op, r);
            }
            4 | 5 => {
                let src = self.read_operand(sz, &op);
                self.widening_mul(sz, src, reg == 5);
            }
            6 | 7 => {
                let src = self.read_operand(sz, &op);
                self.divide(sz, src, reg == 7);
            }
            _ => unreachable!(),
        }
        Ok(Outcome::Continue)
    }

    fn dis_grp5(&mut self, sz: usize) -> Result<Outcome, Error> {
        let modrm = self.rdr.next()?;
        let reg = (modrm >> 3) & 7;
        match reg {
            0 | 1 => {
                let op = self.modrm_operand(modrm, 0)?;
                self.inc_dec(sz, &op, reg == 0);
                Ok(Outcome::Continue)
            }
            2 => {
                let op = self.modrm_operand(modrm, 0)?;
                let target = self.read_operand(8, &op);
                let next = self.rdr.addr();
                self.push_value(8, Expr::u64(next));
                Ok(self.branch_to(target, JumpKind::Call))
            }
            4 => {
                let op = self.modrm_operand(modrm, 0)?;
                let target = self.read_operand(8, &op);
                Ok(self.branch_to(target, JumpKind::Boring))
            }
            6 => {
                let psz = if self.pfx.operand_size() { 2 } else { 8 };
                let op = self.modrm_operand(modrm, 0)?;
                let v = self.read_operand(psz, &op);
                self.push_value(psz, v);
                Ok(Outcome::Continue)
            }
            _ => Err(self.err(ErrorKind::InvalidOpcode)),
        }
    }

    fn dis_shift(&mut self, sz: usize, op: &Operand, kind: u8, amt_raw: Expr) -> Result<(), Error> {
        let mask: u8 = if sz == 8 { 63 } else { 31 };
        let amt_raw = self.atom(amt_raw);
        let amt = self.atom(Expr::binop(Binop::And8, amt_raw, Expr::u8(mask)));
        let x = self.read_operand(sz, op);
        let width = (8 * sz) as u8;

        match kind {
            // shl / sal
            4 | 6 => {
                let r = self.atom(Expr::binop(op_shl(sz), x.clone(), amt.clone()));
                let m1 = self.atom(Expr::binop(Binop::Sub8, amt.clone(), Expr::u8(1)));
                let m1 = self.atom(Expr::binop(Binop::And8, m1, Expr::u8(mask)));
                let pre = self.atom(Expr::binop(op_shl(sz), x, m1));
                flags::set_thunk_guarded(
                    self.sb,
                    amt,
                    Expr::u64(CcClass::Shl.op(sz)),
                    r.clone(),
                    pre,
                    Expr::u64(0),
                );
                self.write_operand(sz, op, r);
            }
            // shr / sar
            5 | 7 => {
                let bop = if kind == 5 { op_shr(sz) } else { op_sar(sz) };
                let r = self.atom(Expr::binop(bop, x.clone(), amt.clone()));
                let m1 = self.atom(Expr::binop(Binop::Sub8, amt.clone(), Expr::u8(1)));
                let m1 = self.atom(Expr::binop(Binop::And8, m1, Expr::u8(mask)));
                let pre = self.atom(Expr::binop(bop, x, m1));
                flags::set_thunk_guarded(
                    self.sb,
                    amt,
                    Expr::u64(CcClass::Shr.op(sz)),
                    r.clone(),
                    pre,
                    Expr::u64(0),
                );
                self.write_operand(sz, op, r);
            }
            // rol / ror
            0 | 1 => {
                let rot_mask = width - 1;
                let ra = self.atom(Expr::binop(Binop::And8, amt.clone(), Expr::u8(rot_mask)));
                let inv = self.atom(Expr::binop(Binop::Sub8, Expr::u8(width), ra.clone()));
                let inv = self.atom(Expr::binop(Binop::And8, inv, Expr::u8(rot_mask)));
                let (fwd, back) = if kind == 0 {
                    (op_shl(sz), op_shr(sz))
                } else {
                    (op_shr(sz), op_shl(sz))
                };
                let hi = self.atom(Expr::binop(fwd, x.clone(), ra));
                let lo = self.atom(Expr::binop(back, x, inv));
                let r = self.atom(Expr::binop(op_or(sz), hi, lo));
                // Rotates preserve most flags; the old image rides in ndep.
                let old = flags::rflags_all(self.sb);
                let class = if kind == 0 { CcClass::Rol } else { CcClass::Ror };
                flags::set_thunk_guarded(
                    self.sb,
                    amt,
                    Expr::u64(class.op(sz)),
                    r.clone(),
                    Expr::u64(0),
                    old,
                );
                self.write_operand(sz, op, r);
            }
            // rcl / rcr: carry-through rotates, not supported.
            2 | 3 => return Err(self.err(ErrorKind::InvalidOpcode)),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// One-operand widening multiply into rDX:rAX (AX for bytes).
    fn widening_mul(&mut self, sz: usize, src: Expr, signed: bool) {
        let a = self.get_reg(sz, 0);
        let mop = if signed {
            sized(sz, Binop::MullS8, Binop::MullS16, Binop::MullS32, Binop::MullS64)
        } else {
            sized(sz, Binop::MullU8, Binop::MullU16, Binop::MullU32, Binop::MullU64)
        };
        let prod = self.atom(Expr::binop(mop, a.clone(), src.clone()));
        match sz {
            1 => {
                // The whole 16-bit product lands in AX.
                self.sb.push(Stmt::Put {
                    off: OFF_RAX,
                    data: prod,
                });
            }
            2 => {
                let lo = self.atom(Expr::unop(Unop::T32to16, prod.clone()));
                let hi = self.atom(Expr::unop(Unop::Hi32to16, prod));
                self.put_reg(2, 0, lo);
                self.put_reg(2, 2, hi);
            }
            4 => {
                let lo = self.atom(Expr::unop(Unop::T64to32, prod.clone()));
                let hi = self.atom(Expr::unop(Unop::Hi64to32, prod));
                self.put_reg(4, 0, lo);
                self.put_reg(4, 2, hi);
            }
            _ => {
                let lo = self.atom(Expr::unop(Unop::T128to64, prod.clone()));
                let hi = self.atom(Expr::unop(Unop::Hi128to64, prod));
                self.put_reg(8, 0, lo);
                self.put_reg(8, 2, hi);
            }
        }
        let class = if signed { CcClass::SMul } else { CcClass::UMul };
        flags::set_thunk(self.sb, Expr::u64(class.op(sz)), a, src, Expr::u64(0));
    }

    /// Two-or-three-operand multiply keeping only the low half.
    fn imul_truncating(&mut self, sz: usize, dst: u8, a1: Expr, a2: Expr) {
        let mop = sized(sz, Binop::MullS8, Binop::MullS16, Binop::MullS32, Binop::MullS64);
        let prod = self.atom(Expr::binop(mop, a1.clone(), a2.clone()));
        let trunc = match sz {
            1 => Unop::T16to8,
            2 => Unop::T32to16,
            4 => Unop::T64to32,
            _ => Unop::T128to64,
        };
        let r = self.atom(Expr::unop(trunc, prod));
        self.put_reg(sz, dst, r);
        flags::set_thunk(self.sb, Expr::u64(CcClass::SMul.op(sz)), a1, a2, Expr::u64(0));
    }

    /// One-operand divide of rDX:rAX (AX for bytes) by `src`. Division
    /// faults are not modelled.
    fn divide(&mut self, sz: usize, src: Expr, signed: bool) {
        match sz {
            8 => {
                let lo = self.atom(Expr::get(OFF_RAX, Ty::I64));
                let hi = self.atom(Expr::get(OFF_RDX, Ty::I64));
                let dividend = self.atom(Expr::binop(Binop::Join64to128, hi, lo));
                let dop = if signed {
                    Binop::DivModS128to64
                } else {
                    Binop::DivModU128to64
                };
                let dm = self.atom(Expr::binop(dop, dividend, src));
                let q = self.atom(Expr::unop(Unop::T128to64, dm.clone()));
                let r = self.atom(Expr::unop(Unop::Hi128to64, dm));
                self.put_reg(8, 0, q);
                self.put_reg(8, 2, r);
            }
            4 => {
                let lo = self.get_reg(4, 0);
                let hi = self.get_reg(4, 2);
                let dividend = self.atom(Expr::binop(Binop::Join32to64, hi, lo));
                let dop = if signed {
                    Binop::DivModS64to32
                } else {
                    Binop::DivModU64to32
                };
                let dm = self.atom(Expr::binop(dop, dividend, src));
                let q = self.atom(Expr::unop(Unop::T64to32, dm.clone()));
                let r = self.atom(Expr::unop(Unop::Hi64to32, dm));
                self.put_reg(4, 0, q);
                self.put_reg(4, 2, r);
            }
            2 => {
                let lo = self.get_reg(2, 0);
                let hi = self.get_reg(2, 2);
                let hi32 = self.atom(Expr::unop(Unop::U16to32, hi));
                let lo32 = self.atom(Expr::unop(Unop::U16to32, lo));
                let shifted = self.atom(Expr::binop(Binop::Shl32, hi32, Expr::u8(16)));
                let d32 = self.atom(Expr::binop(Binop::Or32, shifted, lo32));
                let (wide, wsrc, dop) = if signed {
                    (Unop::S32to64, Unop::S16to32, Binop::DivModS64to32)
                } else {
                    (Unop::U32to64, Unop::U16to32, Binop::DivModU64to32)
                };
                let dividend = self.atom(Expr::unop(wide, d32));
                let src32 = self.atom(Expr::unop(wsrc, src));
                let dm = self.atom(Expr::binop(dop, dividend, src32));
                let q32 = self.atom(Expr::unop(Unop::T64to32, dm.clone()));
                let q = self.atom(Expr::unop(Unop::T32to16, q32));
                let r32 = self.atom(Expr::unop(Unop::Hi64to32, dm));
                let r = self.atom(Expr::unop(Unop::T32to16, r32));
                self.put_reg(2, 0, q);
                self.put_reg(2, 2, r);
            }
            _ => {
                // Byte divide: dividend is AX, quotient AL, remainder AH.
                let ax = self.atom(Expr::get(OFF_RAX, Ty::I16));
                let (wide, wsrc, dop) = if signed {
                    (Unop::S16to64, Unop::S8to32, Binop::DivModS64to32)
                } else {
                    (Unop::U16to64, Unop::U8to32, Binop::DivModU64to32)
                };
                let dividend = self.atom(Expr::unop(wide, ax));
                let src32 = self.atom(Expr::unop(wsrc, src));
                let dm = self.atom(Expr::binop(dop, dividend, src32));
                let q = self.atom(Expr::unop(Unop::T64to8, dm.clone()));
                let r32 = self.atom(Expr::unop(Unop::Hi64to32, dm));
                let r = self.atom(Expr::unop(Unop::T32to8, r32));
                self.sb.push(Stmt::Put {
                    off: OFF_RAX,
                    data: q,
                });
                // AH, irrespective of any REX prefix.
                self.sb.push(Stmt::Put {
                    off: OFF_RAX + 1,
                    data: r,
                });
            }
        }
    }

    /// movs/stos, with rep expressed as one iteration of a self-loop:
    /// exit to the next instruction when rcx is zero, otherwise do one
    /// element, decrement rcx, and jump back to this instruction.
    fn dis_string(&mut self, sz: usize, is_movs: bool) -> Result<Outcome, Error> {
        if self.pfx.repne() {
            return Err(self.err(ErrorKind::InvalidPrefixes));
        }
        let next_addr = self.rdr.addr();
        if self.pfx.rep() {
            let rcx = self.atom(Expr::get(OFF_RCX, Ty::I64));
            let done = self.atom(Expr::binop(Binop::CmpEq64, rcx.clone(), Expr::u64(0)));
            self.sb.push(Stmt::Exit {
                guard: done,
                dst: Const::U64(next_addr),
                jk: JumpKind::Boring,
            });
            self.string_body(sz, is_movs);
            let dec = self.atom(Expr::binop(Binop::Sub64, rcx, Expr::u64(1)));
            self.sb.push(Stmt::Put {
                off: OFF_RCX,
                data: dec,
            });
            Ok(self.branch_to(Expr::u64(self.insn_addr), JumpKind::Boring))
        } else {
            self.string_body(sz, is_movs);
            Ok(Outcome::Continue)
        }
    }

    fn string_body(&mut self, sz: usize, is_movs: bool) {
        // dflag is +-1; scaling it by the element size gives the stride.
        let step_log = sz.trailing_zeros() as u8;
        let d = self.atom(Expr::get(OFF_DFLAG, Ty::I64));
        let step = if step_log == 0 {
            d
        } else {
            self.atom(Expr::binop(Binop::Shl64, d, Expr::u8(step_log)))
        };
        let rdi = self.atom(Expr::get(OFF_RDI, Ty::I64));
        if is_movs {
            let rsi = self.atom(Expr::get(OFF_RSI, Ty::I64));
            let v = self.atom(Expr::load(ity(sz), rsi.clone()));
            self.sb.push(Stmt::Store {
                addr: rdi.clone(),
                data: v,
            });
            let nsi = self.atom(Expr::binop(Binop::Add64, rsi, step.clone()));
            self.sb.push(Stmt::Put {
                off: OFF_RSI,
                data: nsi,
            });
        } else {
            let v = self.get_reg(sz, 0);
            self.sb.push(Stmt::Store {
                addr: rdi.clone(),
                data: v,
            });
        }
        let ndi = self.atom(Expr::binop(Binop::Add64, rdi, step));
        self.sb.push(Stmt::Put {
            off: OFF_RDI,
            data: ndi,
        });
    }

    fn dis_pushf(&mut self) {
        let fl = flags::rflags_all(self.sb);
        // Fold the direction flag back into bit 10: dflag is 1 or -1, so
        // (1 - dflag) << 9 is 0 or 0x400.
        let d = self.atom(Expr::get(OFF_DFLAG, Ty::I64));
        let t = self.atom(Expr::binop(Binop::Sub64, Expr::u64(1), d));
        let dbit = self.atom(Expr::binop(Binop::Shl64, t, Expr::u8(9)));
        let with_d = self.atom(Expr::binop(Binop::Or64, fl, dbit));
        let v = self.atom(Expr::binop(Binop::Or64, with_d, Expr::u64(0x2)));
        self.push_value(8, v);
    }

    fn dis_popf(&mut self) {
        let v = self.pop_value(8);
        // Arithmetic flags only (CF/PF/AF/ZF/SF/OF).
        let arith = self.atom(Expr::binop(Binop::And64, v.clone(), Expr::u64(0x8d5)));
        flags::set_rflags_copy(self.sb, arith);
        let dshift = self.atom(Expr::binop(Binop::Shr64, v.clone(), Expr::u8(10)));
        let dtest = self.atom(Expr::binop(Binop::And64, dshift, Expr::u64(1)));
        let d8 = self.atom(Expr::unop(Unop::T64to8, dtest));
        let d = self.atom(Expr::mux0x(d8, Expr::u64(1), Expr::u64((-1i64) as u64)));
        self.sb.push(Stmt::Put {
            off: OFF_DFLAG,
            data: d,
        });
        let ishift = self.atom(Expr::binop(Binop::Shr64, v, Expr::u8(9)));
        let id = self.atom(Expr::binop(Binop::And64, ishift, Expr::u64(1)));
        self.sb.push(Stmt::Put {
            off: OFF_IDFLAG,
            data: id,
        });
    }

    fn bswap(&mut self, sz: usize, x: Expr) -> Expr {
        if sz == 4 {
            let b0 = self.atom(Expr::binop(Binop::Shl32, x.clone(), Expr::u8(24)));
            let m1 = self.atom(Expr::binop(Binop::And32, x.clone(), Expr::u32(0xff00)));
            let b1 = self.atom(Expr::binop(Binop::Shl32, m1, Expr::u8(8)));
            let s2 = self.atom(Expr::binop(Binop::Shr32, x.clone(), Expr::u8(8)));
            let b2 = self.atom(Expr::binop(Binop::And32, s2, Expr::u32(0xff00)));
            let b3 = self.atom(Expr::binop(Binop::Shr32, x, Expr::u8(24)));
            let lo = self.atom(Expr::binop(Binop::Or32, b0, b1));
            let hi = self.atom(Expr::binop(Binop::Or32, b2, b3));
            self.atom(Expr::binop(Binop::Or32, lo, hi))
        } else {
            let mut parts = Vec::new();
            for i in 0..4 {
                let mask = 0xffu64 << (8 * i);
                let m = self.atom(Expr::binop(Binop::And64, x.clone(), Expr::u64(mask)));
                let sh = (56 - 16 * i) as u8;
                parts.push(self.atom(Expr::binop(Binop::Shl64, m, Expr::u8(sh))));
            }
            for i in 4..8 {
                let mask = 0xffu64 << (8 * i);
                let m = self.atom(Expr::binop(Binop::And64, x.clone(), Expr::u64(mask)));
                let sh = (16 * i - 56) as u8;
                parts.push(self.atom(Expr::binop(Binop::Shr64, m, Expr::u8(sh))));
            }
            let mut acc = parts[0].clone();
            for p in &parts[1..] {
                acc = self.atom(Expr::binop(Binop::Or64, acc, p.clone()));
            }
            acc
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{OFF_CC_DEP1, OFF_CC_OP, OFF_RBX};

    fn yes(_: u64) -> bool {
        true
    }

    fn no_resteer(_: u64) -> bool {
        false
    }

    fn decode(bytes: &[u8]) -> (SuperBlock, Outcome, usize) {
        let acc = yes;
        let mut rdr = GuestReader::new(bytes, 0x4000, &acc);
        let mut sb = SuperBlock::new();
        let out = disas_insn(&mut sb, &mut rdr, &no_resteer).unwrap();
        let len = rdr.offset();
        (sb, out, len)
    }

    fn puts_at(sb: &SuperBlock, off: i32) -> usize {
        sb.stmts
            .iter()
            .filter(|st| matches!(st, Stmt::Put { off: o, .. } if *o == off))
            .count()
    }

    #[test]
    fn add_reg_reg_sets_thunk_and_result() {
        // add rbx, rax
        let (sb, out, len) = decode(&[0x48, 0x01, 0xc3]);
        assert_eq!(out, Outcome::Continue);
        assert_eq!(len, 3);
        assert_eq!(puts_at(&sb, OFF_RBX), 1);
        assert_eq!(puts_at(&sb, OFF_CC_OP), 1);
        assert_eq!(puts_at(&sb, OFF_CC_DEP1), 1);
        ir::sanity_check(&sb, "add", false);
    }

    #[test]
    fn thirty_two_bit_write_zeroes_upper_half() {
        // mov ebx, 7
        let (sb, _, _) = decode(&[0xbb, 0x07, 0x00, 0x00, 0x00]);
        let widened = sb.stmts.iter().any(|st| {
            matches!(
                st,
                Stmt::Put { off, data: Expr::Unop(Unop::U32to64, _) } if *off == OFF_RBX
            )
        });
        assert!(widened);
        assert_eq!(puts_at(&sb, OFF_RBX), 1);
    }

    #[test]
    fn reg_to_reg_mov_is_a_single_put() {
        // mov rbx, rax
        let (sb, out, len) = decode(&[0x48, 0x89, 0xc3]);
        assert_eq!(out, Outcome::Continue);
        assert_eq!(len, 3);
        assert_eq!(sb.stmts.len(), 1);
        match &sb.stmts[0] {
            Stmt::Put { off, data } => {
                assert_eq!(*off, OFF_RBX);
                assert_eq!(*data, Expr::get(OFF_RAX, Ty::I64));
            }
            other => panic!("expected a Put, got {other:?}"),
        }

        // Same move through the load-form opcode.
        let (sb, _, _) = decode(&[0x48, 0x8b, 0xd8]);
        assert_eq!(sb.stmts.len(), 1);
        ir::sanity_check(&sb, "mov reg reg", false);
    }

    #[test]
    fn ret_sets_terminal() {
        let (sb, out, _) = decode(&[0xc3]);
        assert_eq!(out, Outcome::StopHere);
        assert_eq!(sb.jumpkind, JumpKind::Ret);
        assert_eq!(puts_at(&sb, OFF_RSP), 1);
    }

    #[test]
    fn jcc_emits_side_exit_and_falls_through() {
        // jz +5
        let (sb, out, len) = decode(&[0x74, 0x05]);
        assert_eq!(out, Outcome::StopHere);
        assert_eq!(len, 2);
        let exit = sb.stmts.iter().find_map(|st| match st {
            Stmt::Exit { dst, .. } => Some(*dst),
            _ => None,
        });
        assert_eq!(exit, Some(Const::U64(0x4002 + 5)));
        assert_eq!(sb.next, Expr::u64(0x4002));
        assert_eq!(sb.jumpkind, JumpKind::Boring);
    }

    #[test]
    fn direct_jump_resteers_when_allowed() {
        let acc = yes;
        let always = |_: u64| true;
        let mut rdr = GuestReader::new(&[0xeb, 0x10], 0x4000, &acc);
        let mut sb = SuperBlock::new();
        let out = disas_insn(&mut sb, &mut rdr, &always).unwrap();
        assert_eq!(out, Outcome::Resteer { target: 0x4012 });

        // Same bytes, chasing refused: becomes the block terminal.
        let mut rdr = GuestReader::new(&[0xeb, 0x10], 0x4000, &acc);
        let mut sb = SuperBlock::new();
        let out = disas_insn(&mut sb, &mut rdr, &no_resteer).unwrap();
        assert_eq!(out, Outcome::StopHere);
        assert_eq!(sb.next, Expr::u64(0x4012));
    }

    #[test]
    fn call_pushes_return_address() {
        // call +0x20
        let (sb, out, _) = decode(&[0xe8, 0x20, 0x00, 0x00, 0x00]);
        assert_eq!(out, Outcome::StopHere);
        assert_eq!(sb.jumpkind, JumpKind::Call);
        assert_eq!(sb.next, Expr::u64(0x4025));
        let stored = sb.stmts.iter().any(|st| {
            matches!(st, Stmt::Store { data, .. } if *data == Expr::u64(0x4005))
        });
        assert!(stored);
    }

    #[test]
    fn rip_relative_load_resolves_against_insn_end() {
        // mov rax, [rip + 0x100]
        let (sb, _, len) = decode(&[0x48, 0x8b, 0x05, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(len, 7);
        let addr_const = sb.stmts.iter().any(|st| {
            matches!(st, Stmt::WrTmp(_, Expr::Const(Const::U64(a))) if *a == 0x4007 + 0x100)
        });
        assert!(addr_const);
        ir::sanity_check(&sb, "rip", false);
    }

    #[test]
    fn lock_requires_a_lockable_opcode() {
        let acc = yes;
        // lock mov rax, rbx is not a thing.
        let mut rdr = GuestReader::new(&[0xf0, 0x48, 0x89, 0xd8], 0x4000, &acc);
        let mut sb = SuperBlock::new();
        let err = disas_insn(&mut sb, &mut rdr, &no_resteer).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidPrefixes);

        // lock add [rbx], rax is.
        let mut rdr = GuestReader::new(&[0xf0, 0x48, 0x01, 0x03], 0x4000, &acc);
        let mut sb = SuperBlock::new();
        disas_insn(&mut sb, &mut rdr, &no_resteer).unwrap();
        assert!(sb.stmts.iter().any(|st| matches!(st, Stmt::MFence)));
    }

    #[test]
    fn rep_movs_builds_a_self_loop() {
        // rep movsb at 0x4000
        let (sb, out, _) = decode(&[0xf3, 0xa4]);
        assert_eq!(out, Outcome::StopHere);
        // Exit to the following instruction when rcx is exhausted.
        let exit_dst = sb.stmts.iter().find_map(|st| match st {
            Stmt::Exit { dst, .. } => Some(*dst),
            _ => None,
        });
        assert_eq!(exit_dst, Some(Const::U64(0x4002)));
        // Otherwise loop back to ourselves.
        assert_eq!(sb.next, Expr::u64(0x4000));
        ir::sanity_check(&sb, "rep movs", false);
    }

    #[test]
    fn undecodable_byte_reports_consumed_length() {
        let acc = yes;
        let mut rdr = GuestReader::new(&[0x06], 0x4000, &acc);
        let mut sb = SuperBlock::new();
        let err = disas_insn(&mut sb, &mut rdr, &no_resteer).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidOpcode);
        assert_eq!(err.size(), 1);
    }

    #[test]
    fn shift_by_cl_guards_flag_update() {
        // shl rax, cl
        let (sb, _, _) = decode(&[0x48, 0xd3, 0xe0]);
        let n_mux = sb
            .stmts
            .iter()
            .filter(|st| matches!(st, Stmt::WrTmp(_, Expr::Mux0X { .. })))
            .count();
        assert_eq!(n_mux, 4);
        ir::sanity_check(&sb, "shl cl", false);
    }

    #[test]
    fn cqo_spreads_the_sign_into_rdx() {
        // cqo
        let (sb, out, _) = decode(&[0x48, 0x99]);
        assert_eq!(out, Outcome::Continue);
        let sign_fill = sb.stmts.iter().any(|st| {
            matches!(
                st,
                Stmt::WrTmp(_, Expr::Binop(Binop::Sar64, _, b))
                    if **b == Expr::u8(63)
            )
        });
        assert!(sign_fill);
        assert_eq!(puts_at(&sb, crate::state::OFF_RDX), 1);
    }

    #[test]
    fn pop_rm_adjusts_rsp_before_the_store() {
        // pop qword [rbx]
        let (sb, out, len) = decode(&[0x8f, 0x03]);
        assert_eq!(out, Outcome::Continue);
        assert_eq!(len, 2);
        let rsp_put = sb
            .stmts
            .iter()
            .position(|st| matches!(st, Stmt::Put { off: o, .. } if *o == OFF_RSP))
            .expect("rsp updated");
        let store = sb
            .stmts
            .iter()
            .position(|st| matches!(st, Stmt::Store { .. }))
            .expect("value stored");
        assert!(rsp_put < store);
        ir::sanity_check(&sb, "pop rm", false);
    }

    #[test]
    fn long_nop_consumes_its_operand_and_emits_nothing() {
        // The canonical 5- and 8-byte nopl forms.
        let (sb, out, len) = decode(&[0x0f, 0x1f, 0x44, 0x00, 0x00]);
        assert_eq!(out, Outcome::Continue);
        assert_eq!(len, 5);
        assert!(sb.stmts.is_empty(), "{:?}", sb.stmts);

        let (sb, _, len) = decode(&[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(len, 8);
        assert!(sb.stmts.is_empty());
    }

    #[test]
    fn syscall_stashes_return_state() {
        let (sb, out, _) = decode(&[0x0f, 0x05]);
        assert_eq!(out, Outcome::StopHere);
        assert_eq!(sb.jumpkind, JumpKind::Syscall);
        assert_eq!(puts_at(&sb, OFF_RCX), 1);
        assert_eq!(puts_at(&sb, off_reg64(11)), 1);
    }
}
