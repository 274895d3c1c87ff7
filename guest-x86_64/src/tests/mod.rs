//! End-to-end lift tests: bytes in, checked superblocks out.

use decoder::{Extents, LiftParams, Lifter};
use ir::{opt, Const, Expr, JumpKind, Stmt, SuperBlock};
use proptest::prelude::*;

use crate::flags::{HELPER_CONDITION, HELPER_RFLAGS_C};
use crate::state::{OFF_CC_OP, OFF_RIP};
use crate::GuestAmd64;

fn yes(_: u64) -> bool {
    true
}

fn lift(bytes: &[u8], addr: u64) -> (SuperBlock, Extents) {
    let acc = yes;
    let chase = yes;
    GuestAmd64
        .superblock(&LiftParams {
            bytes,
            addr,
            byte_accessible: &acc,
            chase_into_ok: &chase,
            max_insns: 60,
            chase_thresh: 10,
        })
        .expect("lift failed")
}

#[test]
fn straight_line_block_survives_full_optimisation() {
    // add rax, rbx; adc rax, rbx; ret
    let bytes = [0x48, 0x01, 0xd8, 0x48, 0x11, 0xd8, 0xc3];
    let (sb, extents) = lift(&bytes, 0x40_0000);
    assert_eq!(extents.get(0), (0x40_0000, 7));
    assert_eq!(sb.jumpkind, JumpKind::Ret);
    ir::sanity_check(&sb, "lifted", false);

    let sb = opt::optimise(&sb, 2);
    ir::sanity_check(&sb, "optimised", true);

    // adc consumes the carry left by add, so add's thunk write must
    // survive dead-store analysis.
    let reads_carry = sb.stmts.iter().any(|st| {
        matches!(st, Stmt::WrTmp(_, Expr::CCall { callee, .. }) if *callee == HELPER_RFLAGS_C)
    });
    assert!(reads_carry);
    let thunk_writes = sb
        .stmts
        .iter()
        .filter(|st| matches!(st, Stmt::Put { off, .. } if *off == OFF_CC_OP))
        .count();
    assert!(thunk_writes >= 1);
}

#[test]
fn compare_and_branch_reads_flags_through_helper() {
    // cmp rax, rbx; jz +2
    let bytes = [0x48, 0x39, 0xd8, 0x74, 0x02];
    let (sb, _) = lift(&bytes, 0x1000);
    let sb = opt::optimise(&sb, 2);
    ir::sanity_check(&sb, "cmp+jz", true);

    let uses_helper = sb.stmts.iter().any(|st| {
        matches!(st, Stmt::WrTmp(_, Expr::CCall { callee, .. }) if *callee == HELPER_CONDITION)
    });
    assert!(uses_helper);
    let exit = sb
        .stmts
        .iter()
        .find(|st| matches!(st, Stmt::Exit { .. }))
        .expect("conditional branch must leave a side exit");
    match exit {
        Stmt::Exit { dst, .. } => assert_eq!(dst.as_u64(), 0x1007),
        _ => unreachable!(),
    }
    assert_eq!(sb.next, Expr::u64(0x1005));
}

#[test]
fn store_load_block_keeps_memory_order() {
    // mov [rbx], rax; mov rcx, [rbx]; ret
    let bytes = [0x48, 0x89, 0x03, 0x48, 0x8b, 0x0b, 0xc3];
    let (sb, _) = lift(&bytes, 0x2000);
    let sb = opt::optimise(&sb, 2);
    ir::sanity_check(&sb, "store-load", true);

    let store_at = sb
        .stmts
        .iter()
        .position(|st| matches!(st, Stmt::Store { .. }))
        .expect("store survives");
    let load_at = sb
        .stmts
        .iter()
        .position(|st| matches!(st, Stmt::WrTmp(_, Expr::Load { .. })))
        .expect("load survives");
    assert!(store_at < load_at);
}

#[test]
fn chased_block_tracks_rip_across_extents() {
    // 0x3000: jmp 0x3008; 0x3008: add rax, rbx; ret
    let mut bytes = vec![0xeb, 0x06];
    bytes.extend([0x90; 6]);
    bytes.extend([0x48, 0x01, 0xd8, 0xc3]);
    let (sb, extents) = lift(&bytes, 0x3000);

    assert_eq!(extents.n_used(), 2);
    assert_eq!(extents.get(1), (0x3008, 4));

    // The chased-into instructions get rip puts; the lead one does not.
    let rip_puts: Vec<u64> = sb
        .stmts
        .iter()
        .filter_map(|st| match st {
            Stmt::Put { off: OFF_RIP, data } => match data {
                Expr::Const(c) => Some(c.as_u64()),
                _ => None,
            },
            _ => None,
        })
        .collect();
    assert_eq!(rip_puts, vec![0x3008, 0x300b]);
}

#[test]
fn byte_shift_past_width_stores_zero() {
    // mov al, 1; shl al, 9; mov [rbx], al; ret
    // Shift counts are masked modulo 32, not modulo the operand width,
    // so a count of 9 pushes every bit of al off the top.
    let bytes = [0xb0, 0x01, 0xc0, 0xe0, 0x09, 0x88, 0x03, 0xc3];
    let (sb, _) = lift(&bytes, 0x6000);
    let sb = opt::cleanup(opt::optimise(&sb, 2));
    ir::sanity_check(&sb, "overlong shl", true);

    let stored = sb.stmts.iter().find_map(|st| match st {
        Stmt::Store { data, .. } => Some(data.clone()),
        _ => None,
    });
    assert_eq!(stored, Some(Expr::Const(Const::U8(0))));
}

#[test]
fn rep_stos_self_loop_optimises_clean() {
    // mov rcx, 8; rep stosq
    let bytes = [0x48, 0xc7, 0xc1, 0x08, 0x00, 0x00, 0x00, 0xf3, 0x48, 0xab];
    let (sb, _) = lift(&bytes, 0x5000);
    assert_eq!(sb.jumpkind, JumpKind::Boring);
    assert_eq!(sb.next, Expr::u64(0x5007));
    let sb = opt::optimise(&sb, 2);
    ir::sanity_check(&sb, "rep stos", true);
}

proptest! {
    // Arbitrary byte soup must never panic the lifter: it either refuses
    // (access failure with an empty buffer) or produces a block that
    // passes both raw and optimised validation.
    #[test]
    fn lifting_arbitrary_bytes_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let acc = yes;
        let chase = yes;
        let res = GuestAmd64.superblock(&LiftParams {
            bytes: &bytes,
            addr: 0x1_0000,
            byte_accessible: &acc,
            chase_into_ok: &chase,
            max_insns: 20,
            chase_thresh: 5,
        });
        if let Ok((sb, extents)) = res {
            prop_assert!(extents.n_used() >= 1);
            ir::sanity_check(&sb, "fuzzed", false);
            let sb = opt::optimise(&sb, 2);
            ir::sanity_check(&sb, "fuzzed+opt", true);
        }
    }

    // Prefix classification is a pure function of the byte stream; it
    // must be deterministic and never read past the declared cap.
    #[test]
    fn prefix_parse_is_deterministic(bytes in proptest::collection::vec(any::<u8>(), 1..16)) {
        let acc = yes;
        let mut a = decoder::GuestReader::new(&bytes, 0, &acc);
        a.mark();
        let mut b = decoder::GuestReader::new(&bytes, 0, &acc);
        b.mark();
        let ra = crate::prefix::Prefixes::parse(&mut a);
        let rb = crate::prefix::Prefixes::parse(&mut b);
        prop_assert_eq!(ra, rb);
        if ra.is_ok() {
            prop_assert!(a.offset() <= crate::prefix::MAX_PREFIX_BYTES + 1);
        }
    }
}
