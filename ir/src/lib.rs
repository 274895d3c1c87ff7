//! Architecture-neutral intermediate representation.
//!
//! A translation unit is a [`SuperBlock`]: a typed temporary environment, a
//! flat list of statements in single-static-assignment form, and exactly one
//! terminal control transfer (`next` + [`JumpKind`]). Guest front ends build
//! superblocks, the optimiser rewrites them, and host back ends consume them.

pub mod opt;
mod sanity;

pub use sanity::sanity_check;

/// Primitive IR types.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Ty {
    /// A single bit, used for guards and comparison results.
    I1,
    I8,
    I16,
    I32,
    I64,
    I128,
    F32,
    F64,
}

impl Ty {
    pub fn bits(self) -> usize {
        match self {
            Ty::I1 => 1,
            Ty::I8 => 8,
            Ty::I16 => 16,
            Ty::I32 => 32,
            Ty::I64 => 64,
            Ty::I128 => 128,
            Ty::F32 => 32,
            Ty::F64 => 64,
        }
    }

    /// Storage size in bytes. `I1` values live only in temporaries and have
    /// no storage size.
    pub fn size(self) -> usize {
        match self {
            Ty::I1 => panic!("Ty::size: I1 has no storage size"),
            other => other.bits() / 8,
        }
    }

    /// The integer type of `size` bytes.
    pub fn int_of_size(size: usize) -> Ty {
        match size {
            1 => Ty::I8,
            2 => Ty::I16,
            4 => Ty::I32,
            8 => Ty::I64,
            16 => Ty::I128,
            _ => panic!("Ty::int_of_size: no integer type of {size} bytes"),
        }
    }
}

/// An IR constant, tagged with its type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Const {
    U1(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    /// An `F64`, carried as raw bits so constants stay `Eq`.
    F64Bits(u64),
}

impl Const {
    pub fn ty(self) -> Ty {
        match self {
            Const::U1(_) => Ty::I1,
            Const::U8(_) => Ty::I8,
            Const::U16(_) => Ty::I16,
            Const::U32(_) => Ty::I32,
            Const::U64(_) => Ty::I64,
            Const::F64Bits(_) => Ty::F64,
        }
    }

    /// The value zero-extended to 64 bits.
    pub fn as_u64(self) -> u64 {
        match self {
            Const::U1(b) => b as u64,
            Const::U8(v) => v as u64,
            Const::U16(v) => v as u64,
            Const::U32(v) => v as u64,
            Const::U64(v) => v,
            Const::F64Bits(v) => v,
        }
    }
}

/// An IR temporary: written exactly once, scoped to one superblock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Temp(u32);

impl Temp {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The temporary->type environment of one superblock.
#[derive(Debug, Clone, Default)]
pub struct TypeEnv {
    types: Vec<Ty>,
}

impl TypeEnv {
    pub fn new_temp(&mut self, ty: Ty) -> Temp {
        let t = Temp(self.types.len() as u32);
        self.types.push(ty);
        t
    }

    pub fn get(&self, t: Temp) -> Option<Ty> {
        self.types.get(t.index()).copied()
    }

    pub fn ty_of(&self, t: Temp) -> Ty {
        match self.get(t) {
            Some(ty) => ty,
            None => panic!("TypeEnv::ty_of: temp t{} out of range", t.0),
        }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Descriptor for an indexed, circular region of guest state, as used by
/// rotating register files (x87-style stacks). `GetI`/`PutI` index into it
/// modulo `n_elems`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegArray {
    pub base: i32,
    pub elem: Ty,
    pub n_elems: usize,
}

/// Unary operations. Naming: `U`/`S` prefixes widen (zero/sign extend),
/// `T` truncates, `Hi` takes the upper half.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Unop {
    Not1,
    Not8,
    Not16,
    Not32,
    Not64,
    U1to8,
    U1to64,
    U8to16,
    U8to32,
    U8to64,
    U16to32,
    U16to64,
    U32to64,
    S8to16,
    S8to32,
    S8to64,
    S16to32,
    S16to64,
    S32to64,
    T16to8,
    T32to8,
    T32to16,
    T64to8,
    T64to16,
    T64to32,
    T128to64,
    Hi32to16,
    Hi64to32,
    Hi128to64,
}

impl Unop {
    /// (argument type, result type).
    pub fn ty(self) -> (Ty, Ty) {
        use Unop::*;
        match self {
            Not1 => (Ty::I1, Ty::I1),
            Not8 => (Ty::I8, Ty::I8),
            Not16 => (Ty::I16, Ty::I16),
            Not32 => (Ty::I32, Ty::I32),
            Not64 => (Ty::I64, Ty::I64),
            U1to8 => (Ty::I1, Ty::I8),
            U1to64 => (Ty::I1, Ty::I64),
            U8to16 | S8to16 => (Ty::I8, Ty::I16),
            U8to32 | S8to32 => (Ty::I8, Ty::I32),
            U8to64 | S8to64 => (Ty::I8, Ty::I64),
            U16to32 | S16to32 => (Ty::I16, Ty::I32),
            U16to64 | S16to64 => (Ty::I16, Ty::I64),
            U32to64 | S32to64 => (Ty::I32, Ty::I64),
            T16to8 => (Ty::I16, Ty::I8),
            T32to8 => (Ty::I32, Ty::I8),
            T32to16 => (Ty::I32, Ty::I16),
            T64to8 => (Ty::I64, Ty::I8),
            T64to16 => (Ty::I64, Ty::I16),
            T64to32 => (Ty::I64, Ty::I32),
            T128to64 => (Ty::I128, Ty::I64),
            Hi32to16 => (Ty::I32, Ty::I16),
            Hi64to32 => (Ty::I64, Ty::I32),
            Hi128to64 => (Ty::I128, Ty::I64),
        }
    }
}

/// Binary operations. `Mull*` are widening multiplies, `DivMod*` produce a
/// remainder:quotient pair in the upper:lower halves of the result, `Join*`
/// concatenate two halves. Shift counts at or past the operand width give
/// 0 for `Shl*`/`Shr*` and the sign fill for `Sar*`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Binop {
    Add8,
    Add16,
    Add32,
    Add64,
    Sub8,
    Sub16,
    Sub32,
    Sub64,
    And8,
    And16,
    And32,
    And64,
    Or8,
    Or16,
    Or32,
    Or64,
    Xor8,
    Xor16,
    Xor32,
    Xor64,
    Shl8,
    Shl16,
    Shl32,
    Shl64,
    Shr8,
    Shr16,
    Shr32,
    Shr64,
    Sar8,
    Sar16,
    Sar32,
    Sar64,
    MullU8,
    MullS8,
    MullU16,
    MullS16,
    MullU32,
    MullS32,
    MullU64,
    MullS64,
    CmpEq8,
    CmpEq16,
    CmpEq32,
    CmpEq64,
    CmpNe8,
    CmpNe16,
    CmpNe32,
    CmpNe64,
    DivModU64to32,
    DivModS64to32,
    DivModU128to64,
    DivModS128to64,
    Join32to64,
    Join64to128,
}

impl Binop {
    /// (left argument, right argument, result) types.
    pub fn ty(self) -> (Ty, Ty, Ty) {
        use Binop::*;
        match self {
            Add8 | Sub8 | And8 | Or8 | Xor8 => (Ty::I8, Ty::I8, Ty::I8),
            Add16 | Sub16 | And16 | Or16 | Xor16 => (Ty::I16, Ty::I16, Ty::I16),
            Add32 | Sub32 | And32 | Or32 | Xor32 => (Ty::I32, Ty::I32, Ty::I32),
            Add64 | Sub64 | And64 | Or64 | Xor64 => (Ty::I64, Ty::I64, Ty::I64),
            Shl8 | Shr8 | Sar8 => (Ty::I8, Ty::I8, Ty::I8),
            Shl16 | Shr16 | Sar16 => (Ty::I16, Ty::I8, Ty::I16),
            Shl32 | Shr32 | Sar32 => (Ty::I32, Ty::I8, Ty::I32),
            Shl64 | Shr64 | Sar64 => (Ty::I64, Ty::I8, Ty::I64),
            MullU8 | MullS8 => (Ty::I8, Ty::I8, Ty::I16),
            MullU16 | MullS16 => (Ty::I16, Ty::I16, Ty::I32),
            MullU32 | MullS32 => (Ty::I32, Ty::I32, Ty::I64),
            MullU64 | MullS64 => (Ty::I64, Ty::I64, Ty::I128),
            CmpEq8 | CmpNe8 => (Ty::I8, Ty::I8, Ty::I1),
            CmpEq16 | CmpNe16 => (Ty::I16, Ty::I16, Ty::I1),
            CmpEq32 | CmpNe32 => (Ty::I32, Ty::I32, Ty::I1),
            CmpEq64 | CmpNe64 => (Ty::I64, Ty::I64, Ty::I1),
            DivModU64to32 | DivModS64to32 => (Ty::I64, Ty::I32, Ty::I64),
            DivModU128to64 | DivModS128to64 => (Ty::I128, Ty::I64, Ty::I128),
            Join32to64 => (Ty::I32, Ty::I32, Ty::I64),
            Join64to128 => (Ty::I64, Ty::I64, Ty::I128),
        }
    }
}

/// An IR expression: an immutable tree with a statically known type.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Const),
    /// Read `ty` from guest state at byte offset `off`.
    Get { off: i32, ty: Ty },
    /// Read from a circular guest-state array, at `(ix + bias) % n_elems`.
    GetI { descr: RegArray, ix: Box<Expr>, bias: i32 },
    Tmp(Temp),
    Unop(Unop, Box<Expr>),
    Binop(Binop, Box<Expr>, Box<Expr>),
    /// Little-endian load of `ty` from guest memory.
    Load { ty: Ty, addr: Box<Expr> },
    /// `if cond == 0 { zero } else { other }`. `cond` has type `I8`.
    Mux0X { cond: Box<Expr>, zero: Box<Expr>, other: Box<Expr> },
    /// Call to a pure external helper.
    CCall { callee: &'static str, ret_ty: Ty, args: Vec<Expr> },
}

impl Expr {
    pub fn u8(v: u8) -> Expr {
        Expr::Const(Const::U8(v))
    }

    pub fn u16(v: u16) -> Expr {
        Expr::Const(Const::U16(v))
    }

    pub fn u32(v: u32) -> Expr {
        Expr::Const(Const::U32(v))
    }

    pub fn u64(v: u64) -> Expr {
        Expr::Const(Const::U64(v))
    }

    pub fn get(off: i32, ty: Ty) -> Expr {
        Expr::Get { off, ty }
    }

    pub fn tmp(t: Temp) -> Expr {
        Expr::Tmp(t)
    }

    pub fn unop(op: Unop, a: Expr) -> Expr {
        Expr::Unop(op, Box::new(a))
    }

    pub fn binop(op: Binop, a: Expr, b: Expr) -> Expr {
        Expr::Binop(op, Box::new(a), Box::new(b))
    }

    pub fn load(ty: Ty, addr: Expr) -> Expr {
        Expr::Load {
            ty,
            addr: Box::new(addr),
        }
    }

    pub fn mux0x(cond: Expr, zero: Expr, other: Expr) -> Expr {
        Expr::Mux0X {
            cond: Box::new(cond),
            zero: Box::new(zero),
            other: Box::new(other),
        }
    }

    pub fn ccall(callee: &'static str, ret_ty: Ty, args: Vec<Expr>) -> Expr {
        Expr::CCall {
            callee,
            ret_ty,
            args,
        }
    }

    /// An atom is a temporary read or a constant. Flat IR only allows atoms
    /// as sub-expressions.
    pub fn is_atom(&self) -> bool {
        matches!(self, Expr::Tmp(_) | Expr::Const(_))
    }

    /// The statically known type of this expression.
    pub fn ty(&self, env: &TypeEnv) -> Ty {
        match self {
            Expr::Const(c) => c.ty(),
            Expr::Get { ty, .. } => *ty,
            Expr::GetI { descr, .. } => descr.elem,
            Expr::Tmp(t) => env.ty_of(*t),
            Expr::Unop(op, _) => op.ty().1,
            Expr::Binop(op, _, _) => op.ty().2,
            Expr::Load { ty, .. } => *ty,
            Expr::Mux0X { zero, .. } => zero.ty(env),
            Expr::CCall { ret_ty, .. } => *ret_ty,
        }
    }
}

/// Read/write/modify classification for dirty-call footprints.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Effect {
    Read,
    Write,
    Modify,
}

/// Memory touched by a dirty call.
#[derive(Debug, Clone, PartialEq)]
pub struct MemFootprint {
    pub fx: Effect,
    pub addr: Expr,
    pub size: usize,
}

/// A guest-state range touched by a dirty call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StateFootprint {
    pub fx: Effect,
    pub offset: i32,
    pub size: usize,
}

/// A call to an external helper with side effects. The declared footprints
/// tell instrumenters and the optimiser what the helper may touch.
#[derive(Debug, Clone, PartialEq)]
pub struct Dirty {
    pub callee: &'static str,
    pub guard: Expr,
    pub args: Vec<Expr>,
    pub dst: Option<Temp>,
    pub mem: Option<MemFootprint>,
    pub state: Vec<StateFootprint>,
}

/// The class of a control transfer out of a superblock.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JumpKind {
    /// An ordinary branch.
    Boring,
    Call,
    Ret,
    Syscall,
    /// A debug trap or other deliberate stop.
    Trap,
    /// The bytes at the destination could not be decoded.
    NoDecode,
}

/// An IR statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    NoOp,
    /// Instruction boundary: guest address and encoded length of the
    /// instruction whose IR follows. The length is patched in after decode.
    IMark { addr: u64, len: u32 },
    /// Assign to a temporary. Each temporary is written exactly once.
    WrTmp(Temp, Expr),
    /// Write `data` to guest state at byte offset `off`.
    Put { off: i32, data: Expr },
    /// Write into a circular guest-state array.
    PutI { descr: RegArray, ix: Expr, bias: i32, data: Expr },
    /// Little-endian store to guest memory.
    Store { addr: Expr, data: Expr },
    Dirty(Dirty),
    /// Memory fence.
    MFence,
    /// Conditional side exit: if `guard` is true, jump to `dst`.
    Exit { guard: Expr, dst: Const, jk: JumpKind },
}

/// One translation unit's IR.
#[derive(Debug, Clone)]
pub struct SuperBlock {
    pub tyenv: TypeEnv,
    pub stmts: Vec<Stmt>,
    /// Guest address execution continues at after the block.
    pub next: Expr,
    pub jumpkind: JumpKind,
}

impl SuperBlock {
    pub fn new() -> SuperBlock {
        SuperBlock {
            tyenv: TypeEnv::default(),
            stmts: Vec::new(),
            next: Expr::u64(0),
            jumpkind: JumpKind::Boring,
        }
    }

    pub fn new_temp(&mut self, ty: Ty) -> Temp {
        self.tyenv.new_temp(ty)
    }

    pub fn push(&mut self, st: Stmt) {
        self.stmts.push(st);
    }

    /// Assign `e` to a fresh temporary of its own type and return the temp.
    pub fn assign(&mut self, e: Expr) -> Temp {
        let ty = e.ty(&self.tyenv);
        let t = self.new_temp(ty);
        self.push(Stmt::WrTmp(t, e));
        t
    }
}

impl Default for SuperBlock {
    fn default() -> Self {
        SuperBlock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temps_are_typed_and_sequential() {
        let mut sb = SuperBlock::new();
        let a = sb.new_temp(Ty::I64);
        let b = sb.new_temp(Ty::I8);
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(sb.tyenv.ty_of(a), Ty::I64);
        assert_eq!(sb.tyenv.ty_of(b), Ty::I8);
    }

    #[test]
    fn expr_typing_follows_ops() {
        let mut env = TypeEnv::default();
        let t = env.new_temp(Ty::I32);
        let e = Expr::binop(Binop::Add32, Expr::tmp(t), Expr::u32(1));
        assert_eq!(e.ty(&env), Ty::I32);

        let w = Expr::unop(Unop::U32to64, e);
        assert_eq!(w.ty(&env), Ty::I64);

        let c = Expr::binop(Binop::CmpNe64, w.clone(), Expr::u64(0));
        assert_eq!(c.ty(&env), Ty::I1);

        let m = Expr::mux0x(Expr::u8(1), Expr::u64(4), w);
        assert_eq!(m.ty(&env), Ty::I64);
    }

    #[test]
    fn assign_infers_temp_type() {
        let mut sb = SuperBlock::new();
        let t = sb.assign(Expr::binop(Binop::MullU32, Expr::u32(3), Expr::u32(5)));
        assert_eq!(sb.tyenv.ty_of(t), Ty::I64);
        assert_eq!(sb.stmts.len(), 1);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn foreign_temp_is_rejected() {
        let mut other = TypeEnv::default();
        let t = other.new_temp(Ty::I64);
        let _ = t;
        let mut more = TypeEnv::default();
        more.new_temp(Ty::I8);
        let bad = Temp(7);
        more.ty_of(bad);
    }
}
