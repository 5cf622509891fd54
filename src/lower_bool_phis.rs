/*
 * Copyright © 2022 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

use crate::ir::*;

use std::collections::HashMap;
use std::mem;

/// A divergent 1-bit phi cannot be lowered as an ordinary scalar phi:
/// the hardware mask is per-lane and the scalar value does not compose
/// across divergent control flow.  Each such phi is rewritten into
/// per-predecessor mask merges
///
/// ```text
/// cur = (old & ~exec) | (src & exec)
/// ```
///
/// threaded through fresh SSA names along the linear CFG, with linear
/// phis materialized on demand at join points.

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct PhiUse {
    block: u32,
    phi_def: u32,
}

#[derive(Default)]
struct SsaState {
    /// Latest mask name per block.
    latest: HashMap<u32, u32>,
    /// For each name: the on-demand phis using it, with the operand
    /// positions it occupies (these get updated when the name is
    /// superseded along a back edge).
    phis: HashMap<u32, HashMap<PhiUse, u64>>,
}

fn get_ssa(program: &mut Program, block_idx: u32, state: &mut SsaState) -> Operand {
    let mut block_idx = block_idx;
    loop {
        if let Some(&id) = state.latest.get(&block_idx) {
            return Operand::of_temp(Temp::new(id, RegClass::S2));
        }

        let preds = program.blocks[block_idx as usize].linear_preds.clone();
        if preds.is_empty() {
            return Operand::undefined();
        } else if preds.len() == 1 {
            block_idx = preds[0];
            continue;
        }

        let res = program.allocate_id();
        state.latest.insert(block_idx, res);

        let mut phi = create_instruction(
            Opcode::PLinearPhi,
            Format::PSEUDO,
            preds.len(),
            1,
        );
        for (i, &pred) in preds.iter().enumerate() {
            let op = get_ssa(program, pred, state);
            *phi.operand_mut(i) = op;
            if op.is_temp() {
                assert!(i < 64);
                *state
                    .phis
                    .entry(op.temp_id())
                    .or_default()
                    .entry(PhiUse {
                        block: block_idx,
                        phi_def: res,
                    })
                    .or_insert(0) |= 1u64 << i;
            }
        }
        *phi.definition_mut(0) = Definition::new(res, RegClass::S2);
        program.blocks[block_idx as usize]
            .instructions
            .insert(0, phi);

        return Operand::of_temp(Temp::new(res, RegClass::S2));
    }
}

fn update_phi(
    program: &mut Program,
    state: &mut SsaState,
    block: u32,
    phi_def: u32,
    operand_mask: u64,
) {
    let mut operands = operand_mask;
    while operands != 0 {
        let operand = operands.trailing_zeros() as usize;
        operands &= operands - 1;

        /* re-find the phi each round; get_ssa may have inserted new
         * phis at the front of this block in the meantime */
        let mut phi_idx = None;
        for (i, instr) in program.blocks[block as usize].instructions.iter().enumerate() {
            if !instr.is_phi() {
                break;
            }
            if instr.opcode == Opcode::PLinearPhi
                && instr.definition(0).temp_id() == phi_def
            {
                phi_idx = Some(i);
                break;
            }
        }
        let phi_idx = phi_idx.expect("phi to update has vanished");

        let pred = program.blocks[block as usize].linear_preds[operand];
        let new_operand = get_ssa(program, pred, state);
        *program.blocks[block as usize].instructions[phi_idx]
            .operand_mut(operand) = new_operand;
        if !new_operand.is_undefined() {
            *state
                .phis
                .entry(new_operand.temp_id())
                .or_default()
                .entry(PhiUse {
                    block: block,
                    phi_def: phi_def,
                })
                .or_insert(0) |= 1u64 << operand;
        }
    }
}

fn write_ssa(
    program: &mut Program,
    block: u32,
    state: &mut SsaState,
    previous: u32,
) -> Temp {
    let id = program.allocate_id();
    state.latest.insert(block, id);

    /* the phis fed by the previous name need the new one */
    if previous != 0 {
        let phis = state.phis.remove(&previous).unwrap_or_default();
        for (phi_use, mask) in phis {
            update_phi(program, state, phi_use.block, phi_use.phi_def, mask);
        }
    }

    Temp::new(id, RegClass::S2)
}

pub fn insert_before_branch(block: &mut Block, instr: Instruction) {
    let end = block.instructions.len();
    if end > 0 && block.instructions[end - 1].is_branch() {
        block.instructions.insert(end - 1, instr);
    } else {
        block.instructions.push(instr);
    }
}

pub fn insert_before_logical_end(block: &mut Block, instr: Instruction) {
    for i in (0..block.instructions.len()).rev() {
        if block.instructions[i].opcode == Opcode::PLogicalEnd {
            block.instructions.insert(i, instr);
            return;
        }
    }
    insert_before_branch(block, instr);
}

fn lower_divergent_bool_phi(
    program: &mut Program,
    block_idx: u32,
    phi: &Instruction,
) -> Instruction {
    let mut state = SsaState::default();

    for i in 0..phi.num_operands() {
        let pred = program.blocks[block_idx as usize].logical_preds[i];

        assert!(phi.operand(i).is_temp());
        let mut phi_src = phi.operand(i).temp();
        if phi_src.rc() == RegClass::S1 {
            /* widen the scc-carried bit into a per-lane mask first */
            let mut cselect = create_instruction(
                Opcode::SCselectB64,
                Format::SOP2,
                3,
                1,
            );
            *cselect.operand_mut(0) = Operand::constant(u32::MAX);
            *cselect.operand_mut(1) = Operand::constant(0);
            let mut cond = Operand::of_temp(phi_src);
            cond.set_fixed(SCC);
            *cselect.operand_mut(2) = cond;
            phi_src = program.allocate_temp(RegClass::S2);
            *cselect.definition_mut(0) = Definition::of_temp(phi_src);
            insert_before_logical_end(
                &mut program.blocks[pred as usize],
                cselect,
            );
        }
        assert!(phi_src.rc() == RegClass::S2);

        let cur = get_ssa(program, pred, &mut state);
        let previous = if cur.is_temp() { cur.temp_id() } else { 0 };
        let new_cur = write_ssa(program, pred, &mut state, previous);

        if cur.is_undefined() {
            let mut merge =
                create_instruction(Opcode::SMovB64, Format::SOP1, 1, 1);
            *merge.operand_mut(0) = Operand::of_temp(phi_src);
            *merge.definition_mut(0) = Definition::of_temp(new_cur);
            insert_before_logical_end(
                &mut program.blocks[pred as usize],
                merge,
            );
        } else {
            let tmp1 = program.allocate_temp(RegClass::S2);
            let tmp2 = program.allocate_temp(RegClass::S2);

            let mut merge =
                create_instruction(Opcode::SAndn2B64, Format::SOP2, 2, 2);
            *merge.operand_mut(0) = cur;
            *merge.operand_mut(1) = Operand::fixed(EXEC, RegClass::S2);
            *merge.definition_mut(0) = Definition::of_temp(tmp1);
            let scc_id = program.allocate_id();
            let mut scc_def = Definition::new(scc_id, RegClass::B);
            scc_def.set_fixed(SCC);
            *merge.definition_mut(1) = scc_def;
            insert_before_logical_end(
                &mut program.blocks[pred as usize],
                merge,
            );

            let mut merge =
                create_instruction(Opcode::SAndB64, Format::SOP2, 2, 2);
            *merge.operand_mut(0) = Operand::of_temp(phi_src);
            *merge.operand_mut(1) = Operand::fixed(EXEC, RegClass::S2);
            *merge.definition_mut(0) = Definition::of_temp(tmp2);
            let scc_id = program.allocate_id();
            let mut scc_def = Definition::new(scc_id, RegClass::B);
            scc_def.set_fixed(SCC);
            *merge.definition_mut(1) = scc_def;
            insert_before_logical_end(
                &mut program.blocks[pred as usize],
                merge,
            );

            let mut merge =
                create_instruction(Opcode::SOrB64, Format::SOP2, 2, 2);
            *merge.operand_mut(0) = Operand::of_temp(tmp1);
            *merge.operand_mut(1) = Operand::of_temp(tmp2);
            *merge.definition_mut(0) = Definition::of_temp(new_cur);
            let scc_id = program.allocate_id();
            let mut scc_def = Definition::new(scc_id, RegClass::B);
            scc_def.set_fixed(SCC);
            *merge.definition_mut(1) = scc_def;
            insert_before_logical_end(
                &mut program.blocks[pred as usize],
                merge,
            );
        }
    }

    let mut copy = create_instruction(Opcode::SMovB64, Format::SOP1, 1, 1);
    *copy.operand_mut(0) = get_ssa(program, block_idx, &mut state);
    *copy.definition_mut(0) = *phi.definition(0);
    copy
}

pub fn lower_bool_phis(program: &mut Program) {
    for block_idx in 0..program.blocks.len() as u32 {
        let instructions =
            mem::take(&mut program.blocks[block_idx as usize].instructions);
        let mut non_phi: Vec<Instruction> = Vec::new();

        let mut iter = instructions.into_iter();
        let mut rest: Vec<Instruction> = Vec::new();
        for instr in iter.by_ref() {
            if !instr.is_phi() {
                rest.push(instr);
                break;
            }
            if instr.opcode == Opcode::PPhi
                && instr.definition(0).rc() == RegClass::S2
            {
                let copy =
                    lower_divergent_bool_phi(program, block_idx, &instr);
                non_phi.push(copy);
            } else {
                program.blocks[block_idx as usize].instructions.push(instr);
            }
        }
        rest.extend(iter);

        let block = &mut program.blocks[block_idx as usize];
        block.instructions.append(&mut non_phi);
        block.instructions.append(&mut rest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{link_blocks, link_linear, link_logical, Builder};
    use crate::ChipClass;

    /// 0 -> {1, 2} -> 3, with the linear edge 1 -> 2 from if-conversion.
    fn divergent_diamond() -> (Program, Temp, Temp) {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        for _ in 0..4 {
            program.create_and_insert_block();
        }
        link_blocks(&mut program, 0, 1);
        link_logical(&mut program, 0, 2);
        link_linear(&mut program, 1, 2);
        link_blocks(&mut program, 1, 3);
        link_blocks(&mut program, 2, 3);

        let mut b = Builder::new(&mut program, 1);
        let v = b.vop1(Opcode::VMovB32, Operand::constant(1));
        let c1 = b.vopc(Opcode::VCmpEqU32, Operand::of_temp(v), Operand::constant(1));
        b.logical_end();
        let mut b = Builder::new(&mut program, 2);
        let v = b.vop1(Opcode::VMovB32, Operand::constant(2));
        let c2 = b.vopc(Opcode::VCmpEqU32, Operand::of_temp(v), Operand::constant(2));
        b.logical_end();
        (program, c1, c2)
    }

    #[test]
    fn divergent_bool_phi_becomes_mask_merge() {
        let (mut program, c1, c2) = divergent_diamond();
        let mut b = Builder::new(&mut program, 3);
        let phi = b.phi(
            Opcode::PPhi,
            &[Operand::of_temp(c1), Operand::of_temp(c2)],
            RegClass::S2,
        );
        b.endpgm();

        lower_bool_phis(&mut program);

        /* the divergent phi is gone; the mask arrives through a linear
         * phi and the def is now an s_mov_b64 */
        let merge = &program.blocks[3];
        assert!(merge
            .instructions
            .iter()
            .all(|i| i.opcode != Opcode::PPhi));
        assert_eq!(merge.instructions[0].opcode, Opcode::PLinearPhi);
        let copy = merge
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::SMovB64)
            .unwrap();
        assert_eq!(copy.definition(0).temp(), phi);

        /* first predecessor initializes the mask */
        let pred1 = &program.blocks[1];
        assert!(pred1
            .instructions
            .iter()
            .any(|i| i.opcode == Opcode::SMovB64));

        /* second predecessor merges under exec */
        let pred2 = &program.blocks[2];
        for op in [Opcode::SAndn2B64, Opcode::SAndB64, Opcode::SOrB64] {
            assert!(pred2.instructions.iter().any(|i| i.opcode == op));
        }
        /* merge code sits before the p_logical_end marker */
        let end_pos = pred2
            .instructions
            .iter()
            .position(|i| i.opcode == Opcode::PLogicalEnd)
            .unwrap();
        let or_pos = pred2
            .instructions
            .iter()
            .position(|i| i.opcode == Opcode::SOrB64)
            .unwrap();
        assert!(or_pos < end_pos);
    }

    #[test]
    fn s1_source_is_widened() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        for _ in 0..4 {
            program.create_and_insert_block();
        }
        link_blocks(&mut program, 0, 1);
        link_logical(&mut program, 0, 2);
        link_linear(&mut program, 1, 2);
        link_blocks(&mut program, 1, 3);
        link_blocks(&mut program, 2, 3);

        let mut b = Builder::new(&mut program, 1);
        let s = b.alloc_temp(RegClass::S1);
        let mut mov = create_instruction(Opcode::SMovB32, Format::SOP1, 1, 1);
        *mov.operand_mut(0) = Operand::constant(1);
        *mov.definition_mut(0) = Definition::of_temp(s);
        b.push_instr(mov);
        b.logical_end();
        let mut b = Builder::new(&mut program, 2);
        let v = b.vop1(Opcode::VMovB32, Operand::constant(2));
        let c2 = b.vopc(Opcode::VCmpEqU32, Operand::of_temp(v), Operand::constant(2));
        b.logical_end();
        let mut b = Builder::new(&mut program, 3);
        b.phi(
            Opcode::PPhi,
            &[Operand::of_temp(s), Operand::of_temp(c2)],
            RegClass::S2,
        );
        b.endpgm();

        lower_bool_phis(&mut program);

        let pred1 = &program.blocks[1];
        let cselect = pred1
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::SCselectB64)
            .expect("s1 source must be widened via s_cselect_b64");
        assert_eq!(cselect.operand(0).constant_value(), u32::MAX);
        assert_eq!(cselect.operand(2).phys_reg(), SCC);
    }
}
