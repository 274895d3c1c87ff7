//! Superblock optimisation passes.
//!
//! Every pass other than [`flatten`] expects flat input. The pipeline runs
//! [`optimise`] after decode, [`cleanup`] after instrumentation, and
//! [`deadcode`] + [`treebuild`] immediately before instruction selection.

use std::collections::HashMap;

use tracing::trace;

use crate::{Binop, Const, Expr, Stmt, SuperBlock, Temp, Ty, Unop};

/* ------------------------ flattening ------------------------ */

fn flatten_expr(out: &mut SuperBlock, e: &Expr) -> Expr {
    match e {
        Expr::Const(_) | Expr::Tmp(_) => e.clone(),
        Expr::Get { .. } => Expr::tmp(out.assign(e.clone())),
        Expr::GetI { descr, ix, bias } => {
            let ix = flatten_expr(out, ix);
            let t = out.assign(Expr::GetI {
                descr: *descr,
                ix: Box::new(ix),
                bias: *bias,
            });
            Expr::tmp(t)
        }
        Expr::Unop(op, a) => {
            let a = flatten_expr(out, a);
            Expr::tmp(out.assign(Expr::unop(*op, a)))
        }
        Expr::Binop(op, a, b) => {
            let a = flatten_expr(out, a);
            let b = flatten_expr(out, b);
            Expr::tmp(out.assign(Expr::binop(*op, a, b)))
        }
        Expr::Load { ty, addr } => {
            let addr = flatten_expr(out, addr);
            Expr::tmp(out.assign(Expr::load(*ty, addr)))
        }
        Expr::Mux0X { cond, zero, other } => {
            let cond = flatten_expr(out, cond);
            let zero = flatten_expr(out, zero);
            let other = flatten_expr(out, other);
            Expr::tmp(out.assign(Expr::mux0x(cond, zero, other)))
        }
        Expr::CCall {
            callee,
            ret_ty,
            args,
        } => {
            let args = args.iter().map(|a| flatten_expr(out, a)).collect();
            Expr::tmp(out.assign(Expr::CCall {
                callee,
                ret_ty: *ret_ty,
                args,
            }))
        }
    }
}

fn flatten_stmt(out: &mut SuperBlock, st: &Stmt) {
    match st {
        Stmt::NoOp | Stmt::IMark { .. } | Stmt::MFence => out.push(st.clone()),
        Stmt::WrTmp(t, e) => {
            let a = flatten_expr(out, e);
            out.push(Stmt::WrTmp(*t, a));
        }
        Stmt::Put { off, data } => {
            let data = flatten_expr(out, data);
            out.push(Stmt::Put { off: *off, data });
        }
        Stmt::PutI {
            descr,
            ix,
            bias,
            data,
        } => {
            let ix = flatten_expr(out, ix);
            let data = flatten_expr(out, data);
            out.push(Stmt::PutI {
                descr: *descr,
                ix,
                bias: *bias,
                data,
            });
        }
        Stmt::Store { addr, data } => {
            let addr = flatten_expr(out, addr);
            let data = flatten_expr(out, data);
            out.push(Stmt::Store { addr, data });
        }
        Stmt::Dirty(d) => {
            let mut d = d.clone();
            d.guard = flatten_expr(out, &d.guard);
            d.args = d.args.iter().map(|a| flatten_expr(out, a)).collect();
            if let Some(m) = &mut d.mem {
                m.addr = flatten_expr(out, &m.addr.clone());
            }
            out.push(Stmt::Dirty(d));
        }
        Stmt::Exit { guard, dst, jk } => {
            let guard = flatten_expr(out, guard);
            out.push(Stmt::Exit {
                guard,
                dst: *dst,
                jk: *jk,
            });
        }
    }
}

/// Rewrite `sb` so every sub-expression is an atom. Temporaries keep their
/// numbers; fresh ones are appended for the decomposed trees.
pub fn flatten(sb: &SuperBlock) -> SuperBlock {
    let mut out = SuperBlock {
        tyenv: sb.tyenv.clone(),
        stmts: Vec::with_capacity(sb.stmts.len() * 2),
        next: Expr::u64(0),
        jumpkind: sb.jumpkind,
    };
    for st in &sb.stmts {
        flatten_stmt(&mut out, st);
    }
    out.next = flatten_expr(&mut out, &sb.next);
    out
}

/* ------------------- const/copy propagation ------------------- */

fn subst_atom(env: &[Option<Expr>], e: &Expr) -> Expr {
    if let Expr::Tmp(t) = e {
        if let Some(Some(a)) = env.get(t.index()) {
            return a.clone();
        }
    }
    e.clone()
}

fn subst_args(env: &[Option<Expr>], e: &Expr) -> Expr {
    match e {
        Expr::Const(_) | Expr::Get { .. } => e.clone(),
        Expr::Tmp(_) => subst_atom(env, e),
        Expr::GetI { descr, ix, bias } => Expr::GetI {
            descr: *descr,
            ix: Box::new(subst_atom(env, ix)),
            bias: *bias,
        },
        Expr::Unop(op, a) => Expr::unop(*op, subst_atom(env, a)),
        Expr::Binop(op, a, b) => Expr::binop(*op, subst_atom(env, a), subst_atom(env, b)),
        Expr::Load { ty, addr } => Expr::load(*ty, subst_atom(env, addr)),
        Expr::Mux0X { cond, zero, other } => Expr::mux0x(
            subst_atom(env, cond),
            subst_atom(env, zero),
            subst_atom(env, other),
        ),
        Expr::CCall {
            callee,
            ret_ty,
            args,
        } => Expr::CCall {
            callee,
            ret_ty: *ret_ty,
            args: args.iter().map(|a| subst_atom(env, a)).collect(),
        },
    }
}

fn const_of(e: &Expr) -> Option<Const> {
    match e {
        Expr::Const(c) => Some(*c),
        _ => None,
    }
}

fn fold_unop(op: Unop, c: Const) -> Option<Const> {
    use Unop::*;
    let v = c.as_u64();
    Some(match op {
        Not1 => Const::U1(v == 0),
        Not8 => Const::U8(!(v as u8)),
        Not16 => Const::U16(!(v as u16)),
        Not32 => Const::U32(!(v as u32)),
        Not64 => Const::U64(!v),
        U1to8 => Const::U8(v as u8),
        U1to64 => Const::U64(v),
        U8to16 => Const::U16(v as u8 as u16),
        U8to32 => Const::U32(v as u8 as u32),
        U8to64 => Const::U64(v as u8 as u64),
        U16to32 => Const::U32(v as u16 as u32),
        U16to64 => Const::U64(v as u16 as u64),
        U32to64 => Const::U64(v as u32 as u64),
        S8to16 => Const::U16(v as u8 as i8 as i16 as u16),
        S8to32 => Const::U32(v as u8 as i8 as i32 as u32),
        S8to64 => Const::U64(v as u8 as i8 as i64 as u64),
        S16to32 => Const::U32(v as u16 as i16 as i32 as u32),
        S16to64 => Const::U64(v as u16 as i16 as i64 as u64),
        S32to64 => Const::U64(v as u32 as i32 as i64 as u64),
        T16to8 | T32to8 | T64to8 => Const::U8(v as u8),
        T32to16 | T64to16 => Const::U16(v as u16),
        T64to32 => Const::U32(v as u32),
        Hi32to16 => Const::U16((v >> 16) as u16),
        Hi64to32 => Const::U32((v >> 32) as u32),
        T128to64 | Hi128to64 => return None,
    })
}

fn fold_binop(op: Binop, a: Const, b: Const) -> Option<Const> {
    use Binop::*;
    let x = a.as_u64();
    let y = b.as_u64();
    Some(match op {
        Add8 => Const::U8((x as u8).wrapping_add(y as u8)),
        Add16 => Const::U16((x as u16).wrapping_add(y as u16)),
        Add32 => Const::U32((x as u32).wrapping_add(y as u32)),
        Add64 => Const::U64(x.wrapping_add(y)),
        Sub8 => Const::U8((x as u8).wrapping_sub(y as u8)),
        Sub16 => Const::U16((x as u16).wrapping_sub(y as u16)),
        Sub32 => Const::U32((x as u32).wrapping_sub(y as u32)),
        Sub64 => Const::U64(x.wrapping_sub(y)),
        And8 => Const::U8(x as u8 & y as u8),
        And16 => Const::U16(x as u16 & y as u16),
        And32 => Const::U32(x as u32 & y as u32),
        And64 => Const::U64(x & y),
        Or8 => Const::U8(x as u8 | y as u8),
        Or16 => Const::U16(x as u16 | y as u16),
        Or32 => Const::U32(x as u32 | y as u32),
        Or64 => Const::U64(x | y),
        Xor8 => Const::U8(x as u8 ^ y as u8),
        Xor16 => Const::U16(x as u16 ^ y as u16),
        Xor32 => Const::U32(x as u32 ^ y as u32),
        Xor64 => Const::U64(x ^ y),
        // Shift counts at or past the operand width produce 0 (sign-fill
        // for Sar). The front end masks counts modulo 32/64, so a count
        // can legally reach the width of a narrow operand.
        Shl8 => Const::U8((x as u8).checked_shl(y as u32).unwrap_or(0)),
        Shl16 => Const::U16((x as u16).checked_shl(y as u32).unwrap_or(0)),
        Shl32 => Const::U32((x as u32).checked_shl(y as u32).unwrap_or(0)),
        Shl64 => Const::U64(x.checked_shl(y as u32).unwrap_or(0)),
        Shr8 => Const::U8((x as u8).checked_shr(y as u32).unwrap_or(0)),
        Shr16 => Const::U16((x as u16).checked_shr(y as u32).unwrap_or(0)),
        Shr32 => Const::U32((x as u32).checked_shr(y as u32).unwrap_or(0)),
        Shr64 => Const::U64(x.checked_shr(y as u32).unwrap_or(0)),
        Sar8 => Const::U8(((x as u8 as i8) >> (y as u32).min(7)) as u8),
        Sar16 => Const::U16(((x as u16 as i16) >> (y as u32).min(15)) as u16),
        Sar32 => Const::U32(((x as u32 as i32) >> (y as u32).min(31)) as u32),
        Sar64 => Const::U64(((x as i64) >> (y as u32).min(63)) as u64),
        CmpEq8 => Const::U1(x as u8 == y as u8),
        CmpEq16 => Const::U1(x as u16 == y as u16),
        CmpEq32 => Const::U1(x as u32 == y as u32),
        CmpEq64 => Const::U1(x == y),
        CmpNe8 => Const::U1(x as u8 != y as u8),
        CmpNe16 => Const::U1(x as u16 != y as u16),
        CmpNe32 => Const::U1(x as u32 != y as u32),
        CmpNe64 => Const::U1(x != y),
        Join32to64 => Const::U64((x << 32) | (y as u32 as u64)),
        _ => return None,
    })
}

/// Algebraic simplification of a flat expression whose atoms have already
/// been substituted. Returns a replacement, or `None` to keep the original.
fn fold_expr(e: &Expr) -> Option<Expr> {
    match e {
        Expr::Unop(op, a) => {
            let c = const_of(a)?;
            fold_unop(*op, c).map(Expr::Const)
        }
        Expr::Binop(op, a, b) => {
            if let (Some(ca), Some(cb)) = (const_of(a), const_of(b)) {
                return fold_binop(*op, ca, cb).map(Expr::Const);
            }
            // A few identities worth catching on address arithmetic.
            match (*op, const_of(a), const_of(b)) {
                (Binop::Add64, _, Some(c)) if c.as_u64() == 0 => Some((**a).clone()),
                (Binop::Add64, Some(c), _) if c.as_u64() == 0 => Some((**b).clone()),
                (Binop::Or64, _, Some(c)) if c.as_u64() == 0 => Some((**a).clone()),
                _ => None,
            }
        }
        Expr::Mux0X { cond, zero, other } => {
            let c = const_of(cond)?;
            if c.as_u64() == 0 {
                Some((**zero).clone())
            } else {
                Some((**other).clone())
            }
        }
        _ => None,
    }
}

/// Constant folding plus copy propagation over a flat block.
pub fn cprop(sb: &SuperBlock) -> SuperBlock {
    let mut env: Vec<Option<Expr>> = vec![None; sb.tyenv.len()];
    let mut out = SuperBlock {
        tyenv: sb.tyenv.clone(),
        stmts: Vec::with_capacity(sb.stmts.len()),
        next: Expr::u64(0),
        jumpkind: sb.jumpkind,
    };

    for st in &sb.stmts {
        let st = match st {
            Stmt::WrTmp(t, e) => {
                let mut e = subst_args(&env, e);
                if let Some(f) = fold_expr(&e) {
                    e = f;
                }
                if e.is_atom() {
                    env[t.index()] = Some(e.clone());
                }
                Stmt::WrTmp(*t, e)
            }
            Stmt::Put { off, data } => Stmt::Put {
                off: *off,
                data: subst_atom(&env, data),
            },
            Stmt::PutI {
                descr,
                ix,
                bias,
                data,
            } => Stmt::PutI {
                descr: *descr,
                ix: subst_atom(&env, ix),
                bias: *bias,
                data: subst_atom(&env, data),
            },
            Stmt::Store { addr, data } => Stmt::Store {
                addr: subst_atom(&env, addr),
                data: subst_atom(&env, data),
            },
            Stmt::Dirty(d) => {
                let mut d = d.clone();
                d.guard = subst_atom(&env, &d.guard);
                d.args = d.args.iter().map(|a| subst_atom(&env, a)).collect();
                if let Some(m) = &mut d.mem {
                    m.addr = subst_atom(&env, &m.addr.clone());
                }
                Stmt::Dirty(d)
            }
            Stmt::Exit { guard, dst, jk } => {
                let guard = subst_atom(&env, guard);
                // A statically false exit can be discarded entirely.
                if let Expr::Const(Const::U1(false)) = guard {
                    continue;
                }
                Stmt::Exit {
                    guard,
                    dst: *dst,
                    jk: *jk,
                }
            }
            other => other.clone(),
        };
        out.push(st);
    }

    out.next = subst_atom(&env, &sb.next);
    out
}

/* ------------------- redundant Get removal ------------------- */

fn ranges_overlap(a_off: i32, a_sz: usize, b_off: i32, b_sz: usize) -> bool {
    a_off < b_off + b_sz as i32 && b_off < a_off + a_sz as i32
}

/// Forward a `Put` value (or an earlier `Get` result) into later `Get`s of
/// the same guest-state slot within the block.
pub fn redundant_get_removal(sb: &mut SuperBlock) {
    let mut state: HashMap<(i32, Ty), Expr> = HashMap::new();
    let tyenv = sb.tyenv.clone();

    let mut invalidate = |state: &mut HashMap<(i32, Ty), Expr>, off: i32, sz: usize| {
        state.retain(|(o, ty), _| !ranges_overlap(*o, ty.size(), off, sz));
    };

    for st in &mut sb.stmts {
        match st {
            Stmt::Put { off, data } => {
                let ty = data.ty(&tyenv);
                invalidate(&mut state, *off, ty.size());
                if data.is_atom() {
                    state.insert((*off, ty), data.clone());
                }
            }
            Stmt::PutI { descr, .. } => {
                let span = descr.elem.size() * descr.n_elems;
                invalidate(&mut state, descr.base, span);
            }
            Stmt::Dirty(d) => {
                for fx in &d.state {
                    if fx.fx != crate::Effect::Read {
                        invalidate(&mut state, fx.offset, fx.size);
                    }
                }
            }
            Stmt::WrTmp(t, e) => {
                if let Expr::Get { off, ty } = e {
                    if *ty == Ty::I1 {
                        continue;
                    }
                    if let Some(known) = state.get(&(*off, *ty)) {
                        *e = known.clone();
                    } else {
                        state.insert((*off, *ty), Expr::tmp(*t));
                    }
                }
            }
            _ => {}
        }
    }
}

/* ------------------------ dead code ------------------------ */

fn note_uses(e: &Expr, used: &mut [bool]) {
    match e {
        Expr::Const(_) | Expr::Get { .. } => {}
        Expr::Tmp(t) => used[t.index()] = true,
        Expr::GetI { ix, .. } => note_uses(ix, used),
        Expr::Unop(_, a) => note_uses(a, used),
        Expr::Binop(_, a, b) => {
            note_uses(a, used);
            note_uses(b, used);
        }
        Expr::Load { addr, .. } => note_uses(addr, used),
        Expr::Mux0X { cond, zero, other } => {
            note_uses(cond, used);
            note_uses(zero, used);
            note_uses(other, used);
        }
        Expr::CCall { args, .. } => {
            for a in args {
                note_uses(a, used);
            }
        }
    }
}

/// Remove assignments to temporaries that nothing downstream reads. Works
/// backwards so chains of dead definitions disappear in one pass.
pub fn deadcode(sb: &mut SuperBlock) {
    let mut used = vec![false; sb.tyenv.len()];
    note_uses(&sb.next, &mut used);

    let mut kept: Vec<Stmt> = Vec::with_capacity(sb.stmts.len());
    for st in sb.stmts.drain(..).rev() {
        match &st {
            Stmt::WrTmp(t, e) => {
                if !used[t.index()] {
                    continue;
                }
                note_uses(e, &mut used);
            }
            Stmt::Put { data, .. } => note_uses(data, &mut used),
            Stmt::PutI { ix, data, .. } => {
                note_uses(ix, &mut used);
                note_uses(data, &mut used);
            }
            Stmt::Store { addr, data } => {
                note_uses(addr, &mut used);
                note_uses(data, &mut used);
            }
            Stmt::Dirty(d) => {
                note_uses(&d.guard, &mut used);
                for a in &d.args {
                    note_uses(a, &mut used);
                }
                if let Some(m) = &d.mem {
                    note_uses(&m.addr, &mut used);
                }
            }
            Stmt::Exit { guard, .. } => note_uses(guard, &mut used),
            Stmt::NoOp | Stmt::IMark { .. } | Stmt::MFence => {}
        }
        kept.push(st);
    }
    kept.reverse();
    sb.stmts = kept;
}

/* ------------------------ tree building ------------------------ */

fn expr_reads_state(e: &Expr) -> bool {
    match e {
        Expr::Const(_) | Expr::Tmp(_) => false,
        Expr::Get { .. } | Expr::GetI { .. } | Expr::Load { .. } | Expr::CCall { .. } => true,
        Expr::Unop(_, a) => expr_reads_state(a),
        Expr::Binop(_, a, b) => expr_reads_state(a) || expr_reads_state(b),
        Expr::Mux0X { cond, zero, other } => {
            expr_reads_state(cond) || expr_reads_state(zero) || expr_reads_state(other)
        }
    }
}

fn subst_trees(e: &Expr, env: &mut HashMap<Temp, Expr>) -> Expr {
    match e {
        Expr::Tmp(t) => match env.remove(t) {
            Some(tree) => tree,
            None => e.clone(),
        },
        Expr::Const(_) | Expr::Get { .. } => e.clone(),
        Expr::GetI { descr, ix, bias } => Expr::GetI {
            descr: *descr,
            ix: Box::new(subst_trees(ix, env)),
            bias: *bias,
        },
        Expr::Unop(op, a) => Expr::unop(*op, subst_trees(a, env)),
        Expr::Binop(op, a, b) => {
            // Substitute right-to-left so any memory reads keep their
            // original program order when the host evaluates left-first.
            let b2 = subst_trees(b, env);
            let a2 = subst_trees(a, env);
            Expr::binop(*op, a2, b2)
        }
        Expr::Load { ty, addr } => Expr::load(*ty, subst_trees(addr, env)),
        Expr::Mux0X { cond, zero, other } => {
            let other2 = subst_trees(other, env);
            let zero2 = subst_trees(zero, env);
            let cond2 = subst_trees(cond, env);
            Expr::mux0x(cond2, zero2, other2)
        }
        Expr::CCall {
            callee,
            ret_ty,
            args,
        } => Expr::CCall {
            callee,
            ret_ty: *ret_ty,
            args: args.iter().map(|a| subst_trees(a, env)).collect(),
        },
    }
}

fn count_uses(sb: &SuperBlock) -> Vec<u32> {
    fn walk(e: &Expr, n: &mut [u32]) {
        match e {
            Expr::Tmp(t) => n[t.index()] += 1,
            Expr::Const(_) | Expr::Get { .. } => {}
            Expr::GetI { ix, .. } => walk(ix, n),
            Expr::Unop(_, a) => walk(a, n),
            Expr::Binop(_, a, b) => {
                walk(a, n);
                walk(b, n);
            }
            Expr::Load { addr, .. } => walk(addr, n),
            Expr::Mux0X { cond, zero, other } => {
                walk(cond, n);
                walk(zero, n);
                walk(other, n);
            }
            Expr::CCall { args, .. } => {
                for a in args {
                    walk(a, n);
                }
            }
        }
    }
    let mut n = vec![0u32; sb.tyenv.len()];
    for st in &sb.stmts {
        match st {
            Stmt::WrTmp(_, e) => walk(e, &mut n),
            Stmt::Put { data, .. } => walk(data, &mut n),
            Stmt::PutI { ix, data, .. } => {
                walk(ix, &mut n);
                walk(data, &mut n);
            }
            Stmt::Store { addr, data } => {
                walk(addr, &mut n);
                walk(data, &mut n);
            }
            Stmt::Dirty(d) => {
                walk(&d.guard, &mut n);
                for a in &d.args {
                    walk(a, &mut n);
                }
                if let Some(m) = &d.mem {
                    walk(&m.addr, &mut n);
                }
            }
            Stmt::Exit { guard, .. } => walk(guard, &mut n),
            Stmt::NoOp | Stmt::IMark { .. } | Stmt::MFence => {}
        }
    }
    walk(&sb.next, &mut n);
    n
}

/// Rebuild expression trees out of single-use temporaries, undoing the
/// flattening so instruction selection sees whole sub-computations.
///
/// Definitions that read state or memory are only carried forward until the
/// next statement that could interfere (a state write, a store, a dirty
/// call, a fence, or an exit); at that point they are re-emitted in their
/// original order.
pub fn treebuild(sb: &mut SuperBlock) {
    let uses = count_uses(sb);
    // Pending single-use definitions, in definition order.
    let mut pending: Vec<(Temp, bool)> = Vec::new();
    let mut env: HashMap<Temp, Expr> = HashMap::new();
    let mut out: Vec<Stmt> = Vec::with_capacity(sb.stmts.len());

    fn flush_reads(
        pending: &mut Vec<(Temp, bool)>,
        env: &mut HashMap<Temp, Expr>,
        out: &mut Vec<Stmt>,
    ) {
        let mut rest = Vec::new();
        for (t, reads) in pending.drain(..) {
            if reads {
                if let Some(e) = env.remove(&t) {
                    out.push(Stmt::WrTmp(t, e));
                }
            } else if env.contains_key(&t) {
                rest.push((t, reads));
            }
        }
        *pending = rest;
    }

    fn flush_all(
        pending: &mut Vec<(Temp, bool)>,
        env: &mut HashMap<Temp, Expr>,
        out: &mut Vec<Stmt>,
    ) {
        for (t, _) in pending.drain(..) {
            if let Some(e) = env.remove(&t) {
                out.push(Stmt::WrTmp(t, e));
            }
        }
    }

    for st in sb.stmts.drain(..) {
        match st {
            Stmt::WrTmp(t, e) => {
                let e = subst_trees(&e, &mut env);
                if uses[t.index()] == 1 {
                    let reads = expr_reads_state(&e);
                    env.insert(t, e);
                    pending.push((t, reads));
                } else {
                    out.push(Stmt::WrTmp(t, e));
                }
            }
            Stmt::Put { off, data } => {
                let data = subst_trees(&data, &mut env);
                flush_reads(&mut pending, &mut env, &mut out);
                out.push(Stmt::Put { off, data });
            }
            Stmt::PutI {
                descr,
                ix,
                bias,
                data,
            } => {
                let ix = subst_trees(&ix, &mut env);
                let data = subst_trees(&data, &mut env);
                flush_reads(&mut pending, &mut env, &mut out);
                out.push(Stmt::PutI {
                    descr,
                    ix,
                    bias,
                    data,
                });
            }
            Stmt::Store { addr, data } => {
                let addr = subst_trees(&addr, &mut env);
                let data = subst_trees(&data, &mut env);
                flush_reads(&mut pending, &mut env, &mut out);
                out.push(Stmt::Store { addr, data });
            }
            Stmt::Dirty(mut d) => {
                d.guard = subst_trees(&d.guard, &mut env);
                d.args = d
                    .args
                    .iter()
                    .map(|a| subst_trees(a, &mut env))
                    .collect();
                if let Some(m) = &mut d.mem {
                    m.addr = subst_trees(&m.addr.clone(), &mut env);
                }
                flush_all(&mut pending, &mut env, &mut out);
                out.push(Stmt::Dirty(d));
            }
            Stmt::Exit { guard, dst, jk } => {
                let guard = subst_trees(&guard, &mut env);
                flush_all(&mut pending, &mut env, &mut out);
                out.push(Stmt::Exit { guard, dst, jk });
            }
            Stmt::MFence => {
                flush_reads(&mut pending, &mut env, &mut out);
                out.push(Stmt::MFence);
            }
            other @ (Stmt::NoOp | Stmt::IMark { .. }) => out.push(other),
        }
    }

    sb.next = subst_trees(&sb.next.clone(), &mut env);
    flush_all(&mut pending, &mut env, &mut out);
    sb.stmts = out;
}

/* ------------------------ drivers ------------------------ */

fn has_indexed_access(sb: &SuperBlock) -> bool {
    sb.stmts.iter().any(|st| match st {
        Stmt::PutI { .. } => true,
        Stmt::WrTmp(_, Expr::GetI { .. }) => true,
        _ => false,
    })
}

fn cheap(sb: SuperBlock) -> SuperBlock {
    let mut sb = cprop(&sb);
    redundant_get_removal(&mut sb);
    deadcode(&mut sb);
    sb
}

/// The main optimisation driver: flatten, then clean up according to
/// `level` (0 = flatten only, 1 = one cheap pass, 2 = a second cheap pass
/// for blocks with indexed state accesses).
pub fn optimise(sb: &SuperBlock, level: u8) -> SuperBlock {
    let mut out = flatten(sb);
    if level == 0 {
        return out;
    }
    out = cheap(out);
    if level > 1 && has_indexed_access(&out) {
        trace!(stmts = out.stmts.len(), "iropt: second pass for GetI/PutI");
        out = cheap(out);
    }
    out
}

/// Post-instrumentation cleanup: dead code, propagation, dead code again.
pub fn cleanup(sb: SuperBlock) -> SuperBlock {
    let mut sb = sb;
    deadcode(&mut sb);
    let mut sb = cprop(&sb);
    deadcode(&mut sb);
    sb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sanity_check, JumpKind};

    fn addr_block() -> SuperBlock {
        // t = (0x1000 + 8) + Get(rax); store t; fall through
        let mut sb = SuperBlock::new();
        sb.push(Stmt::IMark { addr: 0x1000, len: 3 });
        let base = Expr::binop(Binop::Add64, Expr::u64(0x1000), Expr::u64(8));
        let ea = Expr::binop(Binop::Add64, base, Expr::get(0, Ty::I64));
        let t = sb.assign(ea);
        sb.push(Stmt::Store {
            addr: Expr::tmp(t),
            data: Expr::u64(7),
        });
        sb.next = Expr::u64(0x1003);
        sb.jumpkind = JumpKind::Boring;
        sb
    }

    #[test]
    fn flatten_produces_flat_block() {
        let flat = flatten(&addr_block());
        sanity_check(&flat, "flatten test", true);
    }

    #[test]
    fn cprop_folds_constant_addition() {
        let flat = flatten(&addr_block());
        let opt = cprop(&flat);
        let folded = opt.stmts.iter().any(|st| {
            matches!(
                st,
                Stmt::WrTmp(_, Expr::Binop(Binop::Add64, a, _))
                    if **a == Expr::u64(0x1008)
            )
        });
        assert!(folded, "0x1000 + 8 was not folded: {:?}", opt.stmts);
    }

    #[test]
    fn deadcode_drops_unused_chain() {
        let mut sb = SuperBlock::new();
        sb.push(Stmt::IMark { addr: 0x10, len: 1 });
        let a = sb.assign(Expr::u64(1));
        let _b = sb.assign(Expr::binop(Binop::Add64, Expr::tmp(a), Expr::u64(2)));
        let live = sb.assign(Expr::u64(0x20));
        sb.next = Expr::tmp(live);
        let mut flat = flatten(&sb);
        deadcode(&mut flat);
        let n_assigns = flat
            .stmts
            .iter()
            .filter(|st| matches!(st, Stmt::WrTmp(..)))
            .count();
        assert_eq!(n_assigns, 1, "{:?}", flat.stmts);
    }

    #[test]
    fn optimise_level1_is_flat_and_sane() {
        let opt = optimise(&addr_block(), 1);
        sanity_check(&opt, "optimise test", true);
    }

    #[test]
    fn treebuild_rebuilds_single_use_trees() {
        let opt = optimise(&addr_block(), 1);
        let mut sb = opt;
        treebuild(&mut sb);
        // The store address should have been rebuilt into a tree rather
        // than read through a temporary.
        let tree_store = sb.stmts.iter().any(|st| {
            matches!(st, Stmt::Store { addr, .. } if !addr.is_atom())
        });
        assert!(tree_store, "{:?}", sb.stmts);
        sanity_check(&sb, "treebuild test", false);
    }

    #[test]
    fn indexed_state_access_gets_a_second_pass() {
        use crate::RegArray;
        let descr = RegArray {
            base: 464,
            elem: Ty::I64,
            n_elems: 8,
        };
        let mut sb = SuperBlock::new();
        sb.push(Stmt::IMark { addr: 0x10, len: 2 });
        let ix = sb.assign(Expr::binop(Binop::Add8, Expr::u8(1), Expr::u8(2)));
        let v = sb.assign(Expr::GetI {
            descr,
            ix: Box::new(Expr::tmp(ix)),
            bias: 0,
        });
        sb.push(Stmt::PutI {
            descr,
            ix: Expr::tmp(ix),
            bias: 1,
            data: Expr::tmp(v),
        });
        sb.next = Expr::u64(0x12);
        let opt = optimise(&sb, 2);
        sanity_check(&opt, "indexed test", true);
        // The rotating-file access itself must survive; the constant index
        // arithmetic must not.
        assert!(has_indexed_access(&opt));
        let folded_ix = opt.stmts.iter().any(|st| {
            matches!(
                st,
                Stmt::PutI { ix: Expr::Const(Const::U8(3)), .. }
            )
        });
        assert!(folded_ix, "{:?}", opt.stmts);
    }

    #[test]
    fn overlong_shift_counts_fold_to_zero_or_sign() {
        assert_eq!(
            fold_binop(Binop::Shl8, Const::U8(1), Const::U8(9)),
            Some(Const::U8(0))
        );
        assert_eq!(
            fold_binop(Binop::Shr16, Const::U16(0xffff), Const::U8(16)),
            Some(Const::U16(0))
        );
        assert_eq!(
            fold_binop(Binop::Sar8, Const::U8(0x80), Const::U8(12)),
            Some(Const::U8(0xff))
        );
        assert_eq!(
            fold_binop(Binop::Sar16, Const::U16(0x1234), Const::U8(20)),
            Some(Const::U16(0))
        );
        // In-range counts are unaffected.
        assert_eq!(
            fold_binop(Binop::Shl8, Const::U8(1), Const::U8(3)),
            Some(Const::U8(8))
        );
    }

    #[test]
    fn statically_dead_exit_is_dropped() {
        let mut sb = SuperBlock::new();
        sb.push(Stmt::IMark { addr: 0x10, len: 2 });
        let g = sb.assign(Expr::binop(Binop::CmpNe64, Expr::u64(3), Expr::u64(3)));
        sb.push(Stmt::Exit {
            guard: Expr::tmp(g),
            dst: Const::U64(0x99),
            jk: JumpKind::Boring,
        });
        sb.next = Expr::u64(0x12);
        let opt = optimise(&sb, 1);
        assert!(
            !opt.stmts.iter().any(|st| matches!(st, Stmt::Exit { .. })),
            "{:?}",
            opt.stmts
        );
    }
}
