/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

use crate::checker::{self, compute_live_in, live_out_of};
use crate::ir::{Block, Format, HwGen, HwInfo, Instruction, Opcode, Program};
use crate::{
    Definition, FxHashMap, FxHashSet, LiveSet, Operand, PhysReg, RaTestPolicy, RegAllocError,
    RegClass, Temp, TempId,
};
use smallvec::SmallVec;

fn hw(gen: HwGen) -> HwInfo {
    HwInfo {
        gen,
        sram_ecc: false,
    }
}

fn ins<O, D>(opcode: Opcode, operands: O, definitions: D) -> Instruction
where
    O: IntoIterator<Item = Operand>,
    D: IntoIterator<Item = Definition>,
{
    Instruction::new(
        opcode,
        operands.into_iter().collect::<SmallVec<[Operand; 4]>>(),
        definitions
            .into_iter()
            .collect::<SmallVec<[Definition; 2]>>(),
    )
}

fn op(t: Temp) -> Operand {
    Operand::new(t)
}

/// Compute live-out sets and set the kill/dead flags the allocator
/// expects its input to carry.
fn annotate(program: &mut Program) -> Vec<LiveSet> {
    let live_in = compute_live_in(program);
    let n = program.blocks.len();
    let live_out: Vec<LiveSet> = (0..n).map(|b| live_out_of(program, &live_in, b)).collect();

    for b in 0..n {
        let mut live = live_out[b].clone();
        for instr in program.blocks[b].instructions.iter_mut().rev() {
            for def in instr.definitions.iter_mut() {
                def.set_dead(!live.contains(&def.temp_id()));
                live.remove(&def.temp_id());
            }
            if instr.is_phi() {
                for op in instr.operands.iter_mut() {
                    if op.is_temp() && !live_in[b].contains(&op.temp_id()) {
                        op.set_first_kill(true);
                    }
                }
                continue;
            }
            let mut seen: FxHashSet<TempId> = FxHashSet::default();
            for op in instr.operands.iter_mut() {
                if !op.is_temp() {
                    continue;
                }
                let id = op.temp_id();
                if !live.contains(&id) {
                    if seen.insert(id) {
                        op.set_first_kill(true);
                    } else {
                        op.set_kill(true);
                    }
                }
            }
            for op in instr.operands.iter() {
                if op.is_temp() {
                    live.insert(op.temp_id());
                }
            }
        }
    }
    live_out
}

fn run(program: &mut Program, policy: RaTestPolicy) -> crate::Output {
    let live = annotate(program);
    let out = crate::run(program, live, policy).expect("allocation failed");
    if let Err(errors) = checker::check(program) {
        panic!("checker rejected the allocation: {:?}", errors);
    }
    out
}

#[test]
fn straight_line_reuses_registers() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
    let s0 = program.allocate_temp(RegClass::sgpr(1));
    let v0 = program.allocate_temp(RegClass::vgpr(1));
    let v1 = program.allocate_temp(RegClass::vgpr(1));
    let v2 = program.allocate_temp(RegClass::vgpr(1));

    let mut block = Block::default();
    block
        .instructions
        .push(ins(Opcode::SMovB32, [Operand::c32(7)], [Definition::new(s0)]));
    block
        .instructions
        .push(ins(Opcode::VMovB32, [Operand::c32(1)], [Definition::new(v0)]));
    block
        .instructions
        .push(ins(Opcode::VAddF32, [op(v0), op(v0)], [Definition::new(v1)]));
    block
        .instructions
        .push(ins(Opcode::VAddF32, [op(v1), op(v1)], [Definition::new(v2)]));
    block
        .instructions
        .push(ins(Opcode::Export, [op(v2)], []));
    program.blocks.push(block);

    let out = run(&mut program, RaTestPolicy::default());
    // Each value dies at its only use, so the whole chain fits in one
    // register.
    assert_eq!(out.num_vgprs, 1);
    assert_eq!(out.num_sgprs, 1);
}

#[test]
fn fixed_definition_evicts_occupant() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
    let a = program.allocate_temp(RegClass::sgpr(1));
    let b = program.allocate_temp(RegClass::sgpr(1));
    let c = program.allocate_temp(RegClass::sgpr(1));

    let mut block = Block::default();
    block
        .instructions
        .push(ins(Opcode::SMovB32, [Operand::c32(1)], [Definition::new(a)]));
    block.instructions.push(ins(
        Opcode::SMovB32,
        [Operand::c32(2)],
        [Definition::fixed(b, PhysReg::unit_reg(0))],
    ));
    block
        .instructions
        .push(ins(Opcode::SAndB32, [op(a), op(b)], [Definition::new(c)]));
    program.blocks.push(block);

    run(&mut program, RaTestPolicy::default());

    // `a` was allocated to s0 first and had to move for the fixed
    // definition.
    let instrs = &program.blocks[0].instructions;
    assert_eq!(instrs.len(), 4);
    assert_eq!(instrs[1].opcode, Opcode::ParallelCopy);
    assert_eq!(instrs[2].definitions[0].preg(), PhysReg::unit_reg(0));
    let renamed = &instrs[3].operands[0];
    assert_ne!(renamed.temp_id(), a.id());
    assert_ne!(renamed.preg(), PhysReg::unit_reg(0));
}

#[test]
fn mad_with_dying_accumulator_becomes_mac() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
    let x = program.allocate_temp(RegClass::vgpr(1));
    let acc = program.allocate_temp(RegClass::vgpr(1));
    let d = program.allocate_temp(RegClass::vgpr(1));

    let mut block = Block::default();
    block
        .instructions
        .push(ins(Opcode::VMovB32, [Operand::c32(1)], [Definition::new(x)]));
    block.instructions.push(ins(
        Opcode::VMovB32,
        [Operand::c32(2)],
        [Definition::new(acc)],
    ));
    block.instructions.push(ins(
        Opcode::VMadF32,
        [Operand::c32(0x3f800000), op(x), op(acc)],
        [Definition::new(d)],
    ));
    block.instructions.push(ins(Opcode::Export, [op(d)], []));
    program.blocks.push(block);

    run(&mut program, RaTestPolicy::default());

    let mac = &program.blocks[0].instructions[2];
    assert_eq!(mac.opcode, Opcode::VMacF32);
    assert_eq!(mac.format, Format::Vop2);
    assert_eq!(mac.definitions[0].preg(), mac.operands[2].preg());
}

fn two_way_edges(program: &mut Program, from: usize, to: usize) {
    program.blocks[from].logical_succs.push(to as u32);
    program.blocks[from].linear_succs.push(to as u32);
    program.blocks[to].logical_preds.push(from as u32);
    program.blocks[to].linear_preds.push(from as u32);
}

#[test]
fn loop_phi_keeps_one_register() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
    let x0 = program.allocate_temp(RegClass::vgpr(1));
    let x1 = program.allocate_temp(RegClass::vgpr(1));
    let x2 = program.allocate_temp(RegClass::vgpr(1));
    let y = program.allocate_temp(RegClass::vgpr(1));

    let mut b0 = Block::default();
    b0.instructions
        .push(ins(Opcode::VMovB32, [Operand::c32(1)], [Definition::new(x0)]));
    b0.instructions.push(ins(Opcode::Branch, [], []));

    let mut b1 = Block::default();
    b1.instructions
        .push(ins(Opcode::Phi, [op(x0), op(x2)], [Definition::new(x1)]));
    b1.instructions
        .push(ins(Opcode::VAddF32, [op(x1), op(x1)], [Definition::new(x2)]));
    b1.instructions.push(ins(Opcode::Branch, [], []));

    let mut b2 = Block::default();
    b2.instructions
        .push(ins(Opcode::VAddF32, [op(x2), op(x2)], [Definition::new(y)]));

    program.blocks.push(b0);
    program.blocks.push(b1);
    program.blocks.push(b2);
    // Phi operand order must match predecessor order.
    two_way_edges(&mut program, 0, 1);
    two_way_edges(&mut program, 1, 1);
    two_way_edges(&mut program, 1, 2);

    let out = run(&mut program, RaTestPolicy::default());

    // The affinity chain keeps the loop-carried value in place: phi
    // definition and both operands agree, so no copies are needed.
    let phi = &program.blocks[1].instructions[0];
    assert_eq!(phi.opcode, Opcode::Phi);
    let reg = phi.definitions[0].preg();
    assert!(phi.operands.iter().all(|op| op.preg() == reg));
    assert_eq!(out.num_vgprs, 1);
}

#[test]
fn unchanged_loop_value_needs_no_phi() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
    let y0 = program.allocate_temp(RegClass::vgpr(1));
    let z = program.allocate_temp(RegClass::vgpr(1));
    let w = program.allocate_temp(RegClass::vgpr(1));

    let mut b0 = Block::default();
    b0.instructions
        .push(ins(Opcode::VMovB32, [Operand::c32(1)], [Definition::new(y0)]));
    b0.instructions.push(ins(Opcode::Branch, [], []));

    let mut b1 = Block::default();
    b1.instructions
        .push(ins(Opcode::VAddF32, [op(y0), op(y0)], [Definition::new(z)]));
    b1.instructions.push(ins(Opcode::Branch, [], []));

    let mut b2 = Block::default();
    b2.instructions
        .push(ins(Opcode::VAddF32, [op(y0), op(y0)], [Definition::new(w)]));

    program.blocks.push(b0);
    program.blocks.push(b1);
    program.blocks.push(b2);
    two_way_edges(&mut program, 0, 1);
    two_way_edges(&mut program, 1, 1);
    two_way_edges(&mut program, 1, 2);

    run(&mut program, RaTestPolicy::default());

    // The phi speculatively created for the live-in of the unsealed
    // loop header turned out trivial and was removed again; uses read
    // the original value.
    let header = &program.blocks[1].instructions;
    assert!(!header[0].is_phi());
    assert_eq!(header[0].operands[0].temp_id(), y0.id());
    let exit = &program.blocks[2].instructions;
    assert_eq!(exit[0].operands[0].temp_id(), y0.id());
}

#[test]
fn compare_away_from_vcc_upgrades_to_vop3() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
    let v = program.allocate_temp(RegClass::vgpr(1));
    let cc = program.allocate_temp(RegClass::sgpr(2));

    let mut block = Block::default();
    block
        .instructions
        .push(ins(Opcode::VMovB32, [Operand::c32(1)], [Definition::new(v)]));
    block.instructions.push(ins(
        Opcode::VCmpLtF32,
        [Operand::literal32(0x40490fdb), op(v)],
        [Definition::new(cc)],
    ));
    program.blocks.push(block);

    run(&mut program, RaTestPolicy::default());

    let instrs = &program.blocks[0].instructions;
    // The literal moved through a scratch scalar, then the compare was
    // re-encoded for its non-vcc destination.
    assert_eq!(instrs.len(), 3);
    assert_eq!(instrs[1].opcode, Opcode::SMovB32);
    let cmp = &instrs[2];
    assert_eq!(cmp.format, Format::Vop3);
    assert!(cmp.operands[0].is_temp());
    assert_eq!(cmp.operands[0].preg(), instrs[1].definitions[0].preg());
    assert_ne!(cmp.definitions[0].preg(), PhysReg::VCC);
}

#[test]
fn eviction_path_matches_free_search() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
    let a = program.allocate_temp(RegClass::vgpr(1));
    let b = program.allocate_temp(RegClass::vgpr(1));

    let mut block = Block::default();
    block
        .instructions
        .push(ins(Opcode::VMovB32, [Operand::c32(1)], [Definition::new(a)]));
    block
        .instructions
        .push(ins(Opcode::VAddF32, [op(a), op(a)], [Definition::new(b)]));
    block.instructions.push(ins(Opcode::Export, [op(b)], []));
    program.blocks.push(block);

    let out = run(
        &mut program,
        RaTestPolicy {
            skip_free_search: true,
        },
    );
    assert_eq!(out.num_vgprs, 1);
}

#[test]
fn subword_results_pack_under_pressure() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 2);
    let addr = program.allocate_temp(RegClass::vgpr(1));
    let h1 = program.allocate_temp(RegClass::vgpr_bytes(2));
    let h2 = program.allocate_temp(RegClass::vgpr_bytes(2));
    let h3 = program.allocate_temp(RegClass::vgpr_bytes(2));

    let mut block = Block::default();
    block.instructions.push(ins(
        Opcode::VMovB32,
        [Operand::c32(0)],
        [Definition::new(addr)],
    ));
    block.instructions.push(ins(
        Opcode::DsReadU16D16,
        [op(addr)],
        [Definition::new(h1)],
    ));
    block.instructions.push(ins(
        Opcode::DsReadU16D16,
        [op(addr)],
        [Definition::new(h2)],
    ));
    block
        .instructions
        .push(ins(Opcode::VAddF16, [op(h1), op(h2)], [Definition::new(h3)]));
    block
        .instructions
        .push(ins(Opcode::DsWriteB16, [op(addr), op(h3)], []));
    program.blocks.push(block);

    let out = run(&mut program, RaTestPolicy::default());

    // With only two registers, the second half-word load lands in the
    // upper bytes of the first one's register and switches to the
    // high-half opcode.
    let second_load = &program.blocks[0].instructions[2];
    assert_eq!(second_load.opcode, Opcode::DsReadU16D16Hi);
    assert_eq!(second_load.definitions[0].preg().byte(), 2);
    assert_eq!(
        second_load.definitions[0].preg().unit(),
        program.blocks[0].instructions[1].definitions[0]
            .preg()
            .unit()
    );
    assert_eq!(out.num_vgprs, 2);
}

#[test]
fn create_vector_from_dying_lanes_needs_no_copies() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
    let a = program.allocate_temp(RegClass::vgpr(1));
    let b = program.allocate_temp(RegClass::vgpr(1));
    let vec = program.allocate_temp(RegClass::vgpr(2));

    let mut block = Block::default();
    block
        .instructions
        .push(ins(Opcode::VMovB32, [Operand::c32(1)], [Definition::new(a)]));
    block
        .instructions
        .push(ins(Opcode::VMovB32, [Operand::c32(2)], [Definition::new(b)]));
    block.instructions.push(ins(
        Opcode::CreateVector,
        [op(a), op(b)],
        [Definition::new(vec)],
    ));
    block.instructions.push(ins(Opcode::Export, [op(vec)], []));
    program.blocks.push(block);

    run(&mut program, RaTestPolicy::default());

    // The lanes were placed consecutively up front, so building the
    // vector moves nothing.
    let instrs = &program.blocks[0].instructions;
    assert_eq!(instrs.len(), 4);
    let cv = &instrs[2];
    assert_eq!(cv.definitions[0].preg(), cv.operands[0].preg());
    assert_eq!(
        cv.operands[1].preg(),
        cv.operands[0].preg().advance(4)
    );
}

#[test]
fn writelane_pins_one_source_to_m0() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
    let val = program.allocate_temp(RegClass::sgpr(1));
    let lane = program.allocate_temp(RegClass::sgpr(1));
    let acc = program.allocate_temp(RegClass::vgpr(1));
    let d = program.allocate_temp(RegClass::vgpr(1));

    let mut block = Block::default();
    block.instructions.push(ins(
        Opcode::SMovB32,
        [Operand::c32(5)],
        [Definition::new(val)],
    ));
    block.instructions.push(ins(
        Opcode::SMovB32,
        [Operand::c32(3)],
        [Definition::new(lane)],
    ));
    block.instructions.push(ins(
        Opcode::VMovB32,
        [Operand::c32(0)],
        [Definition::new(acc)],
    ));
    block.instructions.push(ins(
        Opcode::VWritelaneB32,
        [op(val), op(lane), op(acc)],
        [Definition::new(d)],
    ));
    block.instructions.push(ins(Opcode::Export, [op(d)], []));
    program.blocks.push(block);

    run(&mut program, RaTestPolicy::default());

    // Pre-GFX10 only one of the two scalar sources may be a plain
    // sgpr; the other is forced through m0 by a copy.
    let wl = program.blocks[0]
        .instructions
        .iter()
        .find(|i| i.opcode == Opcode::VWritelaneB32)
        .unwrap();
    assert_eq!(wl.operands[0].preg(), PhysReg::M0);
    assert_eq!(wl.definitions[0].preg(), wl.operands[2].preg());
    assert!(program.blocks[0]
        .instructions
        .iter()
        .any(|i| i.opcode == Opcode::ParallelCopy));
}

#[test]
fn equal_cost_windows_prefer_aligned_placement() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 8);
    let vec = program.allocate_temp(RegClass::vgpr(4));

    let mut block = Block::default();
    block.instructions.push(ins(
        Opcode::CreateVector,
        (0..4).map(Operand::c32),
        [Definition::new(vec)],
    ));
    block.instructions.push(ins(Opcode::Export, [op(vec)], []));
    program.blocks.push(block);

    let out = run(
        &mut program,
        RaTestPolicy {
            skip_free_search: true,
        },
    );

    // Every window in the empty bank costs zero moves; the tie goes to
    // four-aligned positions only.
    let instrs = &program.blocks[0].instructions;
    assert_eq!(instrs.len(), 2);
    assert_eq!(instrs[0].definitions[0].preg().unit() % 4, 0);
    assert_eq!(out.num_vgprs, 8);
}

fn fragmented_scalar_bank(program: &mut Program) -> (Vec<Temp>, Temp) {
    // Four three-wide values at s1, s5, s9 and s13 leave four free
    // units that no four-aligned window can reach.
    let held: Vec<Temp> = (0..4)
        .map(|_| program.allocate_temp(RegClass::sgpr(3)))
        .collect();
    let vec = program.allocate_temp(RegClass::sgpr(4));

    let mut block = Block::default();
    for (i, &t) in held.iter().enumerate() {
        block.instructions.push(ins(
            Opcode::CreateVector,
            vec![Operand::c32(0); 3],
            [Definition::fixed(t, PhysReg::unit_reg(1 + 4 * i as u32))],
        ));
    }
    block.instructions.push(ins(
        Opcode::CreateVector,
        vec![Operand::c32(0); 4],
        [Definition::new(vec)],
    ));
    block.instructions.push(ins(
        Opcode::Export,
        [op(held[0]), op(held[1]), op(held[2]), op(held[3]), op(vec)],
        [],
    ));
    program.blocks.push(block);
    (held, vec)
}

#[test]
fn budget_grows_when_splitting_cannot_make_room() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
    let (held, vec) = fragmented_scalar_bank(&mut program);

    let out = run(&mut program, RaTestPolicy::default());

    // Splitting inside the old budget fails (every window holds an
    // unevictable three-wide value), so the budget grows until one of
    // them can move out of the way.
    assert_eq!(program.sgpr_budget, 19);
    assert_eq!(out.num_sgprs, 19);
    let instrs = &program.blocks[0].instructions;
    let pc = instrs
        .iter()
        .find(|i| i.opcode == Opcode::ParallelCopy)
        .unwrap();
    assert_eq!(pc.operands[0].temp_id(), held[0].id());
    assert_eq!(pc.definitions[0].preg(), PhysReg::unit_reg(16));
    let cv = instrs
        .iter()
        .find(|i| i.definitions.first().map_or(false, |d| d.temp_id() == vec.id()))
        .unwrap();
    assert_eq!(cv.definitions[0].preg(), PhysReg::unit_reg(0));
}

#[test]
fn full_budget_compacts_the_bank() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
    program.sgpr_ceiling = 16;
    let (held, vec) = fragmented_scalar_bank(&mut program);

    let out = run(&mut program, RaTestPolicy::default());

    // With the budget pinned at the ceiling the only way out is to
    // compact the whole bank; the total stays within the old limit.
    assert_eq!(program.sgpr_budget, 16);
    assert_eq!(out.num_sgprs, 16);
    let instrs = &program.blocks[0].instructions;
    let pc = instrs
        .iter()
        .find(|i| i.opcode == Opcode::ParallelCopy)
        .unwrap();
    assert_eq!(pc.definitions.len(), 3);
    let cv = instrs
        .iter()
        .find(|i| i.definitions.first().map_or(false, |d| d.temp_id() == vec.id()))
        .unwrap();
    assert_eq!(cv.definitions[0].preg(), PhysReg::unit_reg(0));
    // The value that already sat at its compacted position never moved.
    let export = instrs.last().unwrap();
    assert_eq!(export.operands[3].temp_id(), held[3].id());
    assert_eq!(export.operands[3].preg(), PhysReg::unit_reg(13));
}

#[test]
fn parallel_copies_preserve_operand_values() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
    let a = program.allocate_temp(RegClass::sgpr(1));
    let b = program.allocate_temp(RegClass::sgpr(1));
    let c = program.allocate_temp(RegClass::sgpr(1));

    let mut block = Block::default();
    block
        .instructions
        .push(ins(Opcode::SMovB32, [Operand::c32(1)], [Definition::new(a)]));
    block.instructions.push(ins(
        Opcode::SMovB32,
        [Operand::c32(2)],
        [Definition::fixed(b, PhysReg::unit_reg(0))],
    ));
    block
        .instructions
        .push(ins(Opcode::SAndB32, [op(a), op(b)], [Definition::new(c)]));
    program.blocks.push(block);

    run(&mut program, RaTestPolicy::default());

    // Replay the block with concrete values: whatever renaming and
    // eviction happened, the consumer must still read 1 and 2.
    let mut regs: FxHashMap<u32, u32> = FxHashMap::default();
    let mut checked = false;
    for instr in &program.blocks[0].instructions {
        match instr.opcode {
            Opcode::SMovB32 => {
                regs.insert(
                    instr.definitions[0].preg().unit(),
                    instr.operands[0].constant_value(),
                );
            }
            Opcode::ParallelCopy => {
                let vals: Vec<u32> = instr
                    .operands
                    .iter()
                    .map(|op| regs[&op.preg().unit()])
                    .collect();
                for (def, v) in instr.definitions.iter().zip(vals) {
                    regs.insert(def.preg().unit(), v);
                }
            }
            Opcode::SAndB32 => {
                let lhs = regs[&instr.operands[0].preg().unit()];
                let rhs = regs[&instr.operands[1].preg().unit()];
                assert_eq!((lhs, rhs), (1, 2));
                checked = true;
            }
            _ => {}
        }
    }
    assert!(checked);
}

#[test]
fn rerunning_identical_input_is_deterministic() {
    let build = || {
        let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
        let x0 = program.allocate_temp(RegClass::vgpr(1));
        let x1 = program.allocate_temp(RegClass::vgpr(1));
        let x2 = program.allocate_temp(RegClass::vgpr(1));
        let s = program.allocate_temp(RegClass::sgpr(1));
        let y = program.allocate_temp(RegClass::vgpr(1));

        let mut b0 = Block::default();
        b0.instructions
            .push(ins(Opcode::VMovB32, [Operand::c32(1)], [Definition::new(x0)]));
        b0.instructions
            .push(ins(Opcode::SMovB32, [Operand::c32(2)], [Definition::new(s)]));
        b0.instructions.push(ins(Opcode::Branch, [], []));

        let mut b1 = Block::default();
        b1.instructions
            .push(ins(Opcode::Phi, [op(x0), op(x2)], [Definition::new(x1)]));
        b1.instructions
            .push(ins(Opcode::VAddF32, [op(x1), op(x1)], [Definition::new(x2)]));
        b1.instructions.push(ins(Opcode::Branch, [], []));

        let mut b2 = Block::default();
        b2.instructions
            .push(ins(Opcode::VAddF32, [op(x2), op(x2)], [Definition::new(y)]));
        b2.instructions.push(ins(Opcode::Export, [op(y)], []));

        program.blocks.push(b0);
        program.blocks.push(b1);
        program.blocks.push(b2);
        two_way_edges(&mut program, 0, 1);
        two_way_edges(&mut program, 1, 1);
        two_way_edges(&mut program, 1, 2);
        program
    };

    let mut first = build();
    let mut second = build();
    let out_first = run(&mut first, RaTestPolicy::default());
    let out_second = run(&mut second, RaTestPolicy::default());

    assert_eq!(out_first, out_second);
    for (b1, b2) in first.blocks.iter().zip(&second.blocks) {
        assert_eq!(b1.instructions.len(), b2.instructions.len());
        for (i1, i2) in b1.instructions.iter().zip(&b2.instructions) {
            assert_eq!(i1.opcode, i2.opcode);
            for (d1, d2) in i1.definitions.iter().zip(&i2.definitions) {
                assert_eq!(d1.preg(), d2.preg());
            }
            for (o1, o2) in i1.operands.iter().zip(&i2.operands) {
                assert_eq!(o1.is_temp(), o2.is_temp());
                if o1.is_temp() {
                    assert_eq!(o1.preg(), o2.preg());
                }
            }
        }
    }
}

#[test]
fn rejects_mismatched_live_sets() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
    program.blocks.push(Block::default());
    let err = crate::run(&mut program, Vec::new(), RaTestPolicy::default()).unwrap_err();
    assert_eq!(
        err,
        RegAllocError::LiveOutMismatch {
            blocks: 1,
            live_sets: 0
        }
    );
}

#[test]
fn rejects_entry_live_in() {
    let mut program = Program::new(hw(HwGen::Gfx9), 16, 16);
    let v = program.allocate_temp(RegClass::vgpr(1));
    let w = program.allocate_temp(RegClass::vgpr(1));
    let mut block = Block::default();
    // `v` is used but never defined, so it leaks into the entry's
    // live-in set.
    block
        .instructions
        .push(ins(Opcode::VAddF32, [op(v), op(v)], [Definition::new(w)]));
    program.blocks.push(block);

    let live = annotate(&mut program);
    let err = crate::run(&mut program, live, RaTestPolicy::default()).unwrap_err();
    assert_eq!(err, RegAllocError::EntryLiveIn);
}
