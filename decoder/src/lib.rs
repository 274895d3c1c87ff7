//! Shared behaviour required between guest front ends.

use std::fmt;

/// What kind of error happened while decoding guest bytes.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ErrorKind {
    /// Opcode in instruction is impossible/unknown.
    InvalidOpcode,

    /// Operand encoding in instruction is impossible/unknown.
    InvalidOperand,

    /// Prefix run on instruction is impossible/unknown.
    InvalidPrefixes,

    /// The guest byte buffer ended mid-instruction.
    ExhaustedInput,

    /// Impossibly long instruction.
    TooLong,

    /// The caller's accessibility predicate rejected this guest address.
    AccessFault(u64),
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Error {
    /// What kind of error happened in decoding an instruction.
    pub kind: ErrorKind,

    /// How many bytes in the stream the invalid instruction consumed.
    size: u8,
}

impl Error {
    pub fn new(kind: ErrorKind, size: usize) -> Self {
        Self {
            kind,
            size: size as u8,
        }
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// True when the failure means the guest bytes could not be obtained at
    /// all, as opposed to obtained but not understood.
    pub fn is_access_failure(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::AccessFault(_) | ErrorKind::ExhaustedInput
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::InvalidOpcode => write!(f, "invalid opcode"),
            ErrorKind::InvalidOperand => write!(f, "invalid operand"),
            ErrorKind::InvalidPrefixes => write!(f, "invalid prefixes"),
            ErrorKind::ExhaustedInput => write!(f, "exhausted input"),
            ErrorKind::TooLong => write!(f, "instruction too long"),
            ErrorKind::AccessFault(addr) => write!(f, "guest byte {addr:#x} not accessible"),
        }
    }
}

/// What the per-instruction decoder asks the superblock assembler to do
/// next.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Outcome {
    /// Keep decoding at the following instruction.
    Continue,

    /// The instruction set the block's terminal; stop here.
    StopHere,

    /// Keep decoding at `target`: the instruction was an unconditional
    /// direct branch the caller has authorised chasing into.
    Resteer { target: u64 },
}

/// A cursor over the guest byte buffer. Every byte is checked against the
/// caller's accessibility predicate before being handed out.
pub struct GuestReader<'a> {
    bytes: &'a [u8],
    base: u64,
    pos: usize,
    mark: usize,
    accessible: &'a dyn Fn(u64) -> bool,
}

impl<'a> GuestReader<'a> {
    pub fn new(bytes: &'a [u8], base: u64, accessible: &'a dyn Fn(u64) -> bool) -> Self {
        Self {
            bytes,
            base,
            pos: 0,
            mark: 0,
            accessible,
        }
    }

    /// The guest address of the next byte to be read.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.base + self.pos as u64
    }

    /// Reposition to guest address `addr`, which must lie within the
    /// supplied buffer.
    pub fn seek_to(&mut self, addr: u64) -> Result<(), Error> {
        let off = addr.checked_sub(self.base);
        match off {
            Some(off) if (off as usize) < self.bytes.len() => {
                self.pos = off as usize;
                Ok(())
            }
            _ => Err(Error::new(ErrorKind::AccessFault(addr), 0)),
        }
    }

    /// Mark the current position as where to measure `offset` against.
    #[inline]
    pub fn mark(&mut self) {
        self.mark = self.pos;
    }

    /// Bytes consumed since the last `mark`.
    #[inline]
    pub fn offset(&self) -> usize {
        self.pos - self.mark
    }

    pub fn next(&mut self) -> Result<u8, Error> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    /// Look at the next byte without consuming it.
    pub fn peek(&self) -> Result<u8, Error> {
        let addr = self.addr();
        if self.pos >= self.bytes.len() {
            return Err(Error::new(ErrorKind::ExhaustedInput, self.offset()));
        }
        if !(self.accessible)(addr) {
            return Err(Error::new(ErrorKind::AccessFault(addr), self.offset()));
        }
        Ok(self.bytes[self.pos])
    }

    pub fn next_u16(&mut self) -> Result<u16, Error> {
        let lo = self.next()? as u16;
        let hi = self.next()? as u16;
        Ok(lo | (hi << 8))
    }

    pub fn next_u32(&mut self) -> Result<u32, Error> {
        let lo = self.next_u16()? as u32;
        let hi = self.next_u16()? as u32;
        Ok(lo | (hi << 16))
    }

    pub fn next_u64(&mut self) -> Result<u64, Error> {
        let lo = self.next_u32()? as u64;
        let hi = self.next_u32()? as u64;
        Ok(lo | (hi << 32))
    }

    pub fn next_i8(&mut self) -> Result<i8, Error> {
        Ok(self.next()? as i8)
    }

    pub fn next_i32(&mut self) -> Result<i32, Error> {
        Ok(self.next_u32()? as i32)
    }
}

/// Which disjoint guest address ranges a superblock was decoded from. At
/// most three; entries past the first arise only from branch chasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extents {
    n_used: usize,
    base: [u64; 3],
    len: [u16; 3],
}

impl Extents {
    pub const MAX: usize = 3;

    /// Start tracking with the first range opened at `base`.
    pub fn new(base: u64) -> Self {
        Self {
            n_used: 1,
            base: [base, 0, 0],
            len: [0, 0, 0],
        }
    }

    pub fn n_used(&self) -> usize {
        self.n_used
    }

    pub fn get(&self, i: usize) -> (u64, u16) {
        assert!(i < self.n_used);
        (self.base[i], self.len[i])
    }

    /// Guest address one past the end of the currently open range.
    pub fn current_end(&self) -> u64 {
        self.base[self.n_used - 1] + self.len[self.n_used - 1] as u64
    }

    /// Grow the currently open range by `n` bytes.
    pub fn extend(&mut self, n: usize) {
        self.len[self.n_used - 1] += n as u16;
    }

    pub fn has_room(&self) -> bool {
        self.n_used < Self::MAX
    }

    /// Open a new range at `base`. The caller must have checked
    /// `has_room()`.
    pub fn open(&mut self, base: u64) {
        assert!(self.has_room(), "extents list overflow");
        self.base[self.n_used] = base;
        self.len[self.n_used] = 0;
        self.n_used += 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u16)> + '_ {
        (0..self.n_used).map(move |i| (self.base[i], self.len[i]))
    }
}

/// Everything a guest front end needs to build one superblock.
pub struct LiftParams<'a> {
    pub bytes: &'a [u8],
    pub addr: u64,
    /// Queried before trusting any guest byte.
    pub byte_accessible: &'a dyn Fn(u64) -> bool,
    /// Queried before resteering into a new address.
    pub chase_into_ok: &'a dyn Fn(u64) -> bool,
    pub max_insns: usize,
    pub chase_thresh: usize,
}

/// A guest front end: turns raw bytes into an IR superblock plus the guest
/// ranges it covered. The only error that escapes is an access failure;
/// undecodable instructions become a `NoDecode` terminal instead.
pub trait Lifter {
    fn superblock(&self, params: &LiftParams) -> Result<(ir::SuperBlock, Extents), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yes(_: u64) -> bool {
        true
    }

    #[test]
    fn reader_tracks_addresses_and_marks() {
        let data = [0xaa, 0xbb, 0xcc, 0xdd];
        let acc = yes;
        let mut r = GuestReader::new(&data, 0x1000, &acc);
        assert_eq!(r.addr(), 0x1000);
        assert_eq!(r.next().unwrap(), 0xaa);
        r.mark();
        assert_eq!(r.next_u16().unwrap(), 0xccbb);
        assert_eq!(r.offset(), 2);
        assert_eq!(r.addr(), 0x1003);
    }

    #[test]
    fn reader_reports_fault_address() {
        let data = [0x90, 0x90];
        let acc = |a: u64| a != 0x1001;
        let mut r = GuestReader::new(&data, 0x1000, &acc);
        assert_eq!(r.next().unwrap(), 0x90);
        let err = r.next().unwrap_err();
        assert_eq!(err.kind, ErrorKind::AccessFault(0x1001));
        assert!(err.is_access_failure());
    }

    #[test]
    fn reader_rejects_reads_past_buffer() {
        let data = [0x90];
        let acc = yes;
        let mut r = GuestReader::new(&data, 0, &acc);
        r.next().unwrap();
        assert_eq!(r.next().unwrap_err().kind, ErrorKind::ExhaustedInput);
    }

    #[test]
    fn extents_cap_at_three_ranges() {
        let mut e = Extents::new(0x1000);
        e.extend(5);
        assert_eq!(e.current_end(), 0x1005);
        assert!(e.has_room());
        e.open(0x2000);
        e.extend(3);
        e.open(0x3000);
        assert!(!e.has_room());
        assert_eq!(e.n_used(), 3);
        assert_eq!(e.get(1), (0x2000, 3));
    }
}
