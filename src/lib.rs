//! The translation pipeline: guest bytes to host machine code.
//!
//! A [`Translator`] owns a guest front end, a host back end, and a
//! validated [`Config`]. One [`Translator::translate`] call runs the full
//! pipeline over one superblock: lift, validate, optimise, instrument,
//! clean up, rebuild expression trees, then hand the block to the back
//! end for selection, register allocation, and encoding into the caller's
//! buffer.

use bitflags::bitflags;
use thiserror::Error;

use decoder::{ErrorKind, Extents, LiftParams, Lifter};
use ir::{opt, sanity_check, SuperBlock};

/// An extent longer than this means the front end lost track of itself.
const MAX_EXTENT_LEN: u16 = 10_000;

/// Upper bound on the encoding of a single host instruction.
pub const MAX_HOST_INSN_BYTES: usize = 32;

bitflags! {
    /// Which pipeline stages report what they produced. Output goes
    /// through `tracing` at debug level.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct TraceFlags: u32 {
        const FRONTEND = 1 << 0;
        const OPT1 = 1 << 1;
        const INSTRUMENT = 1 << 2;
        const OPT2 = 1 << 3;
        const TREES = 1 << 4;
        const VCODE = 1 << 5;
        const RCODE = 1 << 6;
        const ASM = 1 << 7;
    }
}

/// Pipeline tuning. Checked once, at [`Translator::new`]; translation
/// itself never revalidates.
#[derive(Debug, Clone)]
pub struct Config {
    /// Optimisation effort: 0 flattens only, 1 runs the cheap passes,
    /// 2 repeats them when indexed state accesses survive.
    pub iropt_level: u8,
    /// Loop-unrolling size threshold, reserved for the unroller.
    pub iropt_unroll_thresh: u32,
    /// Most guest instructions one superblock may contain.
    pub guest_max_insns: usize,
    /// Most unconditional direct branches one superblock may chase.
    pub guest_chase_thresh: usize,
    pub trace: TraceFlags,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            iropt_level: 2,
            iropt_unroll_thresh: 120,
            guest_max_insns: 60,
            guest_chase_thresh: 10,
            trace: TraceFlags::empty(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("iropt level {0} out of range 0..=2")]
    IroptLevel(u8),
    #[error("unroll threshold {0} out of range 0..=400")]
    UnrollThresh(u32),
    #[error("instruction budget {0} out of range 1..=100")]
    MaxInsns(usize),
    #[error("chase threshold {got} must be below the instruction budget {budget}")]
    ChaseThresh { got: usize, budget: usize },
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.iropt_level > 2 {
            return Err(ConfigError::IroptLevel(self.iropt_level));
        }
        if self.iropt_unroll_thresh > 400 {
            return Err(ConfigError::UnrollThresh(self.iropt_unroll_thresh));
        }
        if self.guest_max_insns < 1 || self.guest_max_insns > 100 {
            return Err(ConfigError::MaxInsns(self.guest_max_insns));
        }
        if self.guest_chase_thresh >= self.guest_max_insns {
            return Err(ConfigError::ChaseThresh {
                got: self.guest_chase_thresh,
                budget: self.guest_max_insns,
            });
        }
        Ok(())
    }
}

/// The ways one translation can fail. Anything else the pipeline notices
/// is an internal invariant violation and panics.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranslateError {
    /// The guest bytes could not be read at all.
    #[error("guest bytes at {addr:#x} not accessible")]
    AccessFailure { addr: u64 },
    /// The caller's output buffer could not hold the generated code.
    #[error("output buffer full after {bytes_used} bytes")]
    OutputFull { bytes_used: usize },
}

/// An instrumentation pass: takes the flat superblock, returns a flat
/// superblock. Run between optimisation and tree building.
pub type Instrument<'a> = &'a dyn Fn(SuperBlock) -> SuperBlock;

/// One translation request.
pub struct Request<'a> {
    /// Guest bytes, with `bytes[0]` at guest address `addr`.
    pub bytes: &'a [u8],
    pub addr: u64,
    /// Consulted before any guest byte is trusted.
    pub byte_accessible: &'a dyn Fn(u64) -> bool,
    /// Consulted before chasing a direct branch into a new address.
    pub chase_into_ok: &'a dyn Fn(u64) -> bool,
    pub instrument1: Option<Instrument<'a>>,
    pub instrument2: Option<Instrument<'a>>,
    /// Re-run cleanup after instrumentation, to strip whatever redundancy
    /// the instrumenters introduced.
    pub cleanup_after_instrumentation: bool,
    /// Where the generated host code goes.
    pub out: &'a mut [u8],
}

/// What a successful translation hands back.
#[derive(Debug, Clone)]
pub struct Translated {
    pub bytes_used: usize,
    /// The guest address ranges the superblock was decoded from.
    pub extents: Extents,
}

/// A host code generator: instruction selection over tree IR, register
/// allocation, and encoding.
pub trait HostBackend {
    type Instr;

    /// Lower the (tree-built) superblock to virtual-register code.
    fn select(&self, sb: &SuperBlock) -> Vec<Self::Instr>;

    /// Assign real registers, possibly inserting spills.
    fn allocate(&self, code: Vec<Self::Instr>) -> Vec<Self::Instr>;

    /// Encode one instruction into `buf`, returning how many bytes it
    /// used. Must not exceed the buffer.
    fn emit(&self, instr: &Self::Instr, buf: &mut [u8; MAX_HOST_INSN_BYTES]) -> usize;
}

pub struct Translator<L, B> {
    lifter: L,
    backend: B,
    config: Config,
}

impl<L: Lifter, B: HostBackend> Translator<L, B> {
    pub fn new(lifter: L, backend: B, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Translator {
            lifter,
            backend,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Translate one superblock's worth of guest code.
    pub fn translate(&self, req: &mut Request<'_>) -> Result<Translated, TranslateError> {
        let trace = self.config.trace;

        let params = LiftParams {
            bytes: req.bytes,
            addr: req.addr,
            byte_accessible: req.byte_accessible,
            chase_into_ok: req.chase_into_ok,
            max_insns: self.config.guest_max_insns,
            chase_thresh: self.config.guest_chase_thresh,
        };
        let (sb, extents) = self.lifter.superblock(&params).map_err(|e| {
            // The front end swallows undecodable instructions into
            // no-decode terminals; only access failures escape it.
            assert!(e.is_access_failure(), "front end leaked {e}");
            let addr = match e.kind {
                ErrorKind::AccessFault(a) => a,
                _ => req.addr,
            };
            TranslateError::AccessFailure { addr }
        })?;

        let n = extents.n_used();
        assert!(n >= 1 && n <= Extents::MAX, "bad extent count {n}");
        assert_eq!(extents.get(0).0, req.addr, "first extent must start the block");
        for (base, len) in extents.iter() {
            assert!(len < MAX_EXTENT_LEN, "runaway extent at {base:#x}");
        }

        if trace.contains(TraceFlags::FRONTEND) {
            tracing::debug!(addr = req.addr, stmts = sb.stmts.len(), "lifted superblock");
        }
        sanity_check(&sb, "initial", false);

        let mut sb = opt::optimise(&sb, self.config.iropt_level);
        sanity_check(&sb, "after optimisation", true);
        if trace.contains(TraceFlags::OPT1) {
            tracing::debug!(stmts = sb.stmts.len(), "optimised superblock");
        }

        let instrumented = req.instrument1.is_some() || req.instrument2.is_some();
        if let Some(f) = req.instrument1 {
            sb = f(sb);
        }
        if let Some(f) = req.instrument2 {
            sb = f(sb);
        }
        if instrumented {
            sanity_check(&sb, "after instrumentation", true);
            if trace.contains(TraceFlags::INSTRUMENT) {
                tracing::debug!(stmts = sb.stmts.len(), "instrumented superblock");
            }
            if req.cleanup_after_instrumentation {
                sb = opt::cleanup(sb);
                sanity_check(&sb, "after cleanup", true);
                if trace.contains(TraceFlags::OPT2) {
                    tracing::debug!(stmts = sb.stmts.len(), "cleaned superblock");
                }
            }
        }

        opt::treebuild(&mut sb);
        sanity_check(&sb, "after tree building", false);
        if trace.contains(TraceFlags::TREES) {
            tracing::debug!(stmts = sb.stmts.len(), "tree-built superblock");
        }

        let code = self.backend.select(&sb);
        if trace.contains(TraceFlags::VCODE) {
            tracing::debug!(insns = code.len(), "selected instructions");
        }
        let code = self.backend.allocate(code);
        if trace.contains(TraceFlags::RCODE) {
            tracing::debug!(insns = code.len(), "allocated registers");
        }

        let mut bytes_used = 0usize;
        for insn in &code {
            let mut scratch = [0u8; MAX_HOST_INSN_BYTES];
            let n = self.backend.emit(insn, &mut scratch);
            assert!(n <= MAX_HOST_INSN_BYTES, "oversized host instruction");
            if bytes_used + n > req.out.len() {
                return Err(TranslateError::OutputFull { bytes_used });
            }
            req.out[bytes_used..bytes_used + n].copy_from_slice(&scratch[..n]);
            bytes_used += n;
        }
        if trace.contains(TraceFlags::ASM) {
            tracing::debug!(bytes_used, "emitted host code");
        }

        Ok(Translated { bytes_used, extents })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::Stmt;
    use x86_64::GuestAmd64;

    /// A stand-in back end: one 4-byte pseudo-instruction per IR
    /// statement, plus one for the terminal.
    struct StubBackend;

    impl HostBackend for StubBackend {
        type Instr = u32;

        fn select(&self, sb: &SuperBlock) -> Vec<u32> {
            let mut code: Vec<u32> = (0..sb.stmts.len() as u32).collect();
            code.push(u32::MAX);
            code
        }

        fn allocate(&self, code: Vec<u32>) -> Vec<u32> {
            code
        }

        fn emit(&self, instr: &u32, buf: &mut [u8; MAX_HOST_INSN_BYTES]) -> usize {
            buf[..4].copy_from_slice(&instr.to_le_bytes());
            4
        }
    }

    fn yes(_: u64) -> bool {
        true
    }

    fn translator() -> Translator<GuestAmd64, StubBackend> {
        Translator::new(GuestAmd64, StubBackend, Config::default()).unwrap()
    }

    fn request<'a>(
        bytes: &'a [u8],
        acc: &'a dyn Fn(u64) -> bool,
        chase: &'a dyn Fn(u64) -> bool,
        out: &'a mut [u8],
    ) -> Request<'a> {
        Request {
            bytes,
            addr: 0x40_0000,
            byte_accessible: acc,
            chase_into_ok: chase,
            instrument1: None,
            instrument2: None,
            cleanup_after_instrumentation: false,
            out,
        }
    }

    #[test]
    fn config_ranges_are_enforced() {
        let bad = Config {
            iropt_level: 3,
            ..Config::default()
        };
        assert_eq!(bad.validate(), Err(ConfigError::IroptLevel(3)));

        let bad = Config {
            iropt_unroll_thresh: 401,
            ..Config::default()
        };
        assert_eq!(bad.validate(), Err(ConfigError::UnrollThresh(401)));

        // 400 itself is the top of the accepted range.
        let edge = Config {
            iropt_unroll_thresh: 400,
            ..Config::default()
        };
        assert!(edge.validate().is_ok());

        let bad = Config {
            guest_max_insns: 0,
            ..Config::default()
        };
        assert_eq!(bad.validate(), Err(ConfigError::MaxInsns(0)));

        let bad = Config {
            guest_max_insns: 101,
            ..Config::default()
        };
        assert_eq!(bad.validate(), Err(ConfigError::MaxInsns(101)));

        let bad = Config {
            guest_max_insns: 10,
            guest_chase_thresh: 10,
            ..Config::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::ChaseThresh { .. })));

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn translator_new_rejects_bad_config() {
        let cfg = Config {
            guest_max_insns: 200,
            ..Config::default()
        };
        assert!(Translator::new(GuestAmd64, StubBackend, cfg).is_err());
    }

    #[test]
    fn whole_pipeline_produces_code_and_extents() {
        // add rax, rbx; ret
        let bytes = [0x48, 0x01, 0xd8, 0xc3];
        let acc = yes;
        let chase = yes;
        let mut out = [0u8; 4096];
        let t = translator();
        let r = t
            .translate(&mut request(&bytes, &acc, &chase, &mut out))
            .unwrap();
        assert!(r.bytes_used > 0);
        assert_eq!(r.bytes_used % 4, 0);
        assert_eq!(r.extents.n_used(), 1);
        assert_eq!(r.extents.get(0), (0x40_0000, 4));
    }

    #[test]
    fn inaccessible_first_byte_fails_before_any_ir() {
        let bytes = [0x90];
        let acc = |_: u64| false;
        let chase = yes;
        let mut out = [0u8; 64];
        let t = translator();
        let err = t
            .translate(&mut request(&bytes, &acc, &chase, &mut out))
            .unwrap_err();
        assert_eq!(err, TranslateError::AccessFailure { addr: 0x40_0000 });
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn full_output_buffer_reports_bytes_used() {
        let bytes = [0x48, 0x01, 0xd8, 0xc3];
        let acc = yes;
        let chase = yes;
        let mut out = [0u8; 0];
        let t = translator();
        let err = t
            .translate(&mut request(&bytes, &acc, &chase, &mut out))
            .unwrap_err();
        assert_eq!(err, TranslateError::OutputFull { bytes_used: 0 });

        // A buffer that fits some but not all instructions fills up
        // part-way instead.
        let mut out = [0u8; 10];
        let err = t
            .translate(&mut request(&bytes, &acc, &chase, &mut out))
            .unwrap_err();
        assert_eq!(err, TranslateError::OutputFull { bytes_used: 8 });
    }

    #[test]
    fn instrumenters_see_and_reshape_the_block() {
        let bytes = [0x48, 0x01, 0xd8, 0xc3];
        let acc = yes;
        let chase = yes;
        let mut out = [0u8; 4096];

        let pad = |mut sb: SuperBlock| {
            sb.stmts.insert(0, Stmt::NoOp);
            sb
        };

        let t = translator();
        let mut req = request(&bytes, &acc, &chase, &mut out);
        req.instrument1 = Some(&pad);
        req.cleanup_after_instrumentation = true;
        let r = t.translate(&mut req).unwrap();
        assert!(r.bytes_used > 0);
    }
}
