//! Superblock assembly: string instructions together until something
//! stops us.
//!
//! A block grows until an instruction sets a terminal, the instruction
//! budget runs out, or a decode failure turns the rest of the block into a
//! no-decode terminal. Unconditional direct branches may instead be chased
//! ("resteered"): decoding continues at the branch target, recorded as a
//! fresh guest extent when the target is not adjacent.

use decoder::{Error, Extents, GuestReader, LiftParams, Outcome};
use ir::{Expr, JumpKind, Stmt, SuperBlock};

use crate::insn::disas_insn;
use crate::state::OFF_RIP;

pub fn build_superblock(params: &LiftParams) -> Result<(SuperBlock, Extents), Error> {
    assert!(params.max_insns >= 1, "instruction budget must be positive");
    assert!(
        params.chase_thresh < params.max_insns,
        "chase threshold must stay below the instruction budget"
    );

    let mut sb = SuperBlock::new();
    let mut extents = Extents::new(params.addr);
    let mut rdr = GuestReader::new(params.bytes, params.addr, params.byte_accessible);

    let lo = params.addr;
    let hi = params.addr + params.bytes.len() as u64;
    let mut n_insns = 0usize;
    let mut n_resteers = 0usize;

    loop {
        let insn_start = rdr.addr();
        let imark_at = sb.stmts.len();
        sb.push(Stmt::IMark {
            addr: insn_start,
            len: 0,
        });
        if n_insns > 0 {
            sb.push(Stmt::Put {
                off: OFF_RIP,
                data: Expr::u64(insn_start),
            });
        }

        // Whether this instruction, were it an unconditional direct
        // branch, would be allowed to pull the block along to its target.
        let room = extents.has_room();
        let insns_so_far = n_insns;
        let resteers_so_far = n_resteers;
        let resteer_ok = move |target: u64| {
            resteers_so_far < params.chase_thresh
                && insns_so_far + 1 < params.max_insns
                && room
                && target >= lo
                && target < hi
                && (params.chase_into_ok)(target)
        };

        match disas_insn(&mut sb, &mut rdr, &resteer_ok) {
            Err(e) => {
                if n_insns == 0 && e.is_access_failure() {
                    return Err(e);
                }
                // Drop the partial instruction, marker included.
                sb.stmts.truncate(imark_at);
                if e.is_access_failure() {
                    // The bytes exist but we cannot see them; end the
                    // block cleanly before this instruction.
                    sb.next = Expr::u64(insn_start);
                    sb.jumpkind = JumpKind::Boring;
                } else {
                    tracing::debug!(addr = insn_start, %e, "undecodable instruction");
                    sb.next = Expr::u64(insn_start);
                    sb.jumpkind = JumpKind::NoDecode;
                }
                break;
            }
            Ok(out) => {
                let len = rdr.offset();
                sb.stmts[imark_at] = Stmt::IMark {
                    addr: insn_start,
                    len: len as u32,
                };
                extents.extend(len);
                n_insns += 1;
                tracing::trace!(addr = insn_start, len, n_insns, "decoded instruction");

                match out {
                    Outcome::StopHere => break,
                    Outcome::Continue => {
                        if n_insns >= params.max_insns {
                            sb.next = Expr::u64(rdr.addr());
                            sb.jumpkind = JumpKind::Boring;
                            break;
                        }
                    }
                    Outcome::Resteer { target } => {
                        // The decoder may only offer what the closure
                        // above allowed.
                        assert!(n_resteers < params.chase_thresh, "resteer past threshold");
                        assert!(n_insns < params.max_insns, "resteer past insn budget");
                        n_resteers += 1;
                        if target == extents.current_end() {
                            // Fell through to the next byte anyway; the
                            // current extent simply keeps growing.
                        } else {
                            assert!(extents.has_room(), "resteer without extent room");
                            extents.open(target);
                        }
                        rdr.seek_to(target)?;
                        tracing::trace!(target, n_resteers, "chased direct branch");
                    }
                }
            }
        }
    }

    Ok((sb, extents))
}
