//! Structural validation of superblocks.
//!
//! The pipeline re-validates IR between stages. A failure here is a bug in
//! whichever stage produced the block, so the checker panics rather than
//! returning an error.

use crate::{Expr, Stmt, SuperBlock, Temp, Ty, TypeEnv};

struct Checker<'a> {
    what: &'a str,
    tyenv: &'a TypeEnv,
    defined: Vec<bool>,
    must_be_flat: bool,
}

impl<'a> Checker<'a> {
    fn fail(&self, msg: &str) -> ! {
        panic!("ir sanity check [{}]: {}", self.what, msg);
    }

    fn use_temp(&self, t: Temp) {
        if self.tyenv.get(t).is_none() {
            self.fail(&format!("temp t{} has no type", t.index()));
        }
        if !self.defined[t.index()] {
            self.fail(&format!("temp t{} used before definition", t.index()));
        }
    }

    fn def_temp(&mut self, t: Temp) {
        if self.tyenv.get(t).is_none() {
            self.fail(&format!("temp t{} has no type", t.index()));
        }
        if self.defined[t.index()] {
            self.fail(&format!("temp t{} defined more than once", t.index()));
        }
        self.defined[t.index()] = true;
    }

    fn atom(&self, e: &Expr) {
        if self.must_be_flat && !e.is_atom() {
            self.fail("non-atomic sub-expression in flat block");
        }
        self.expr(e);
    }

    fn expr(&self, e: &Expr) {
        match e {
            Expr::Const(_) | Expr::Get { .. } => {}
            Expr::Tmp(t) => self.use_temp(*t),
            Expr::GetI { ix, descr, .. } => {
                if descr.n_elems == 0 {
                    self.fail("GetI over an empty register array");
                }
                self.atom(ix);
            }
            Expr::Unop(_, a) => self.atom(a),
            Expr::Binop(_, a, b) => {
                self.atom(a);
                self.atom(b);
            }
            Expr::Load { addr, ty } => {
                if *ty == Ty::I1 {
                    self.fail("load of I1");
                }
                self.atom(addr);
            }
            Expr::Mux0X { cond, zero, other } => {
                self.atom(cond);
                self.atom(zero);
                self.atom(other);
            }
            Expr::CCall { args, .. } => {
                for a in args {
                    self.atom(a);
                }
            }
        }
    }

    fn stmt(&mut self, st: &Stmt) {
        match st {
            Stmt::NoOp | Stmt::MFence => {}
            Stmt::IMark { len, .. } => {
                if *len == 0 {
                    self.fail("IMark with zero length");
                }
            }
            Stmt::WrTmp(t, e) => {
                // Flatness allows one level of expression on the rhs; its
                // arguments must be atoms, checked by expr().
                self.expr(e);
                self.def_temp(*t);
                let want = self.tyenv.ty_of(*t);
                let got = e.ty(self.tyenv);
                if want != got {
                    self.fail(&format!(
                        "t{} declared {:?} but assigned {:?}",
                        t.index(),
                        want,
                        got
                    ));
                }
            }
            Stmt::Put { data, .. } => {
                self.atom(data);
                if data.ty(self.tyenv) == Ty::I1 {
                    self.fail("put of I1");
                }
            }
            Stmt::PutI { ix, data, descr, .. } => {
                if descr.n_elems == 0 {
                    self.fail("PutI over an empty register array");
                }
                self.atom(ix);
                self.atom(data);
            }
            Stmt::Store { addr, data } => {
                self.atom(addr);
                self.atom(data);
                if data.ty(self.tyenv) == Ty::I1 {
                    self.fail("store of I1");
                }
            }
            Stmt::Dirty(d) => {
                self.atom(&d.guard);
                for a in &d.args {
                    self.atom(a);
                }
                if let Some(m) = &d.mem {
                    self.atom(&m.addr);
                }
                if let Some(t) = d.dst {
                    self.def_temp(t);
                }
            }
            Stmt::Exit { guard, .. } => {
                self.atom(guard);
                if guard.ty(self.tyenv) != Ty::I1 {
                    self.fail("exit guard is not I1");
                }
            }
        }
    }
}

/// Validate `sb`, panicking with `what` in the message on any violation.
///
/// Checks single-assignment and definition-before-use for every temporary,
/// per-statement typing, non-zero instruction marker lengths, and (when
/// `must_be_flat`) that every sub-expression is an atom.
pub fn sanity_check(sb: &SuperBlock, what: &str, must_be_flat: bool) {
    let mut ck = Checker {
        what,
        tyenv: &sb.tyenv,
        defined: vec![false; sb.tyenv.len()],
        must_be_flat,
    };

    for st in &sb.stmts {
        ck.stmt(st);
    }

    ck.atom(&sb.next);
    if sb.next.ty(&sb.tyenv) != Ty::I64 {
        ck.fail("next-address expression is not I64");
    }
}
