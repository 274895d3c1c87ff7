//! Legacy and REX prefix classification.

use decoder::{Error, ErrorKind, GuestReader};

/// At most this many prefix bytes may precede an opcode.
pub const MAX_PREFIX_BYTES: usize = 5;

/// REX byte state. `from` records presence (bit 4) and the W/R/X/B payload
/// (bits 3..0); a zero value means no REX prefix was seen.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PrefixRex {
    bits: u8,
}

impl PrefixRex {
    #[inline]
    fn from(&mut self, prefix: u8) {
        self.bits = 0x10 | (prefix & 0xf);
    }

    #[inline]
    pub fn present(&self) -> bool {
        (self.bits & 0x10) == 0x10
    }

    /// 64-bit operand size.
    #[inline]
    pub fn w(&self) -> bool {
        (self.bits & 0x8) == 0x8
    }

    /// Extension of the ModRM reg field.
    #[inline]
    pub fn r(&self) -> u8 {
        (self.bits >> 2) & 1
    }

    /// Extension of the SIB index field.
    #[inline]
    pub fn x(&self) -> u8 {
        (self.bits >> 1) & 1
    }

    /// Extension of the ModRM r/m, SIB base, or opcode reg field.
    #[inline]
    pub fn b(&self) -> u8 {
        self.bits & 1
    }
}

/// Which segment override was seen, if any.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Segment {
    Fs,
    Gs,
}

/// The classified prefix run of one instruction.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Prefixes {
    bits: u8,
    segment: Option<Segment>,
    pub rex: PrefixRex,
}

const FLAG_OPSIZE: u8 = 0x01;
const FLAG_LOCK: u8 = 0x02;
const FLAG_REP: u8 = 0x04;
const FLAG_REPNE: u8 = 0x08;

impl Prefixes {
    /// 0x66: operand size drops from 32 to 16 bits (unless REX.W wins).
    #[inline]
    pub fn operand_size(&self) -> bool {
        (self.bits & FLAG_OPSIZE) != 0
    }

    #[inline]
    pub fn lock(&self) -> bool {
        (self.bits & FLAG_LOCK) != 0
    }

    #[inline]
    pub fn rep(&self) -> bool {
        (self.bits & FLAG_REP) != 0
    }

    #[inline]
    pub fn repne(&self) -> bool {
        (self.bits & FLAG_REPNE) != 0
    }

    #[inline]
    pub fn segment(&self) -> Option<Segment> {
        self.segment
    }

    /// Consume the prefix run at the reader's position, leaving the reader
    /// at the opcode byte. The caller must have `mark()`ed the instruction
    /// start so error sizes come out right.
    pub fn parse(rdr: &mut GuestReader) -> Result<Prefixes, Error> {
        let mut p = Prefixes::default();
        let mut n = 0usize;

        loop {
            let b = rdr.peek()?;
            match b {
                0x66 => p.bits |= FLAG_OPSIZE,
                0xf0 => p.bits |= FLAG_LOCK,
                0xf2 => p.bits |= FLAG_REPNE,
                0xf3 => p.bits |= FLAG_REP,
                0x64 | 0x65 => {
                    if p.segment.is_some() {
                        return Err(Error::new(ErrorKind::InvalidPrefixes, rdr.offset() + 1));
                    }
                    p.segment = Some(if b == 0x64 { Segment::Fs } else { Segment::Gs });
                }
                // cs/ss/ds/es overrides are architectural no-ops here but
                // still occupy a prefix byte.
                0x2e | 0x36 | 0x3e | 0x26 => {}
                // Address-size override: not supported.
                0x67 => return Err(Error::new(ErrorKind::InvalidPrefixes, rdr.offset() + 1)),
                0x40..=0x4f => {
                    rdr.next()?;
                    n += 1;
                    if n > MAX_PREFIX_BYTES {
                        return Err(Error::new(ErrorKind::InvalidPrefixes, rdr.offset()));
                    }
                    // REX is only effective immediately before the opcode;
                    // an earlier one is silently dropped.
                    if matches!(
                        rdr.peek()?,
                        0x66 | 0xf0 | 0xf2 | 0xf3 | 0x64 | 0x65 | 0x2e | 0x36 | 0x3e | 0x26
                            | 0x67 | 0x40..=0x4f
                    ) {
                        continue;
                    }
                    p.rex.from(b);
                    break;
                }
                _ => break,
            }
            rdr.next()?;
            n += 1;
            if n > MAX_PREFIX_BYTES {
                return Err(Error::new(ErrorKind::InvalidPrefixes, rdr.offset()));
            }
        }

        if p.rep() && p.repne() {
            return Err(Error::new(ErrorKind::InvalidPrefixes, rdr.offset()));
        }
        Ok(p)
    }

    /// Operand size in bytes implied by this prefix run for an instruction
    /// whose default is 32 bits.
    #[inline]
    pub fn op_size(&self) -> usize {
        if self.rex.w() {
            8
        } else if self.operand_size() {
            2
        } else {
            4
        }
    }
}
