/*
 * Copyright © 2022 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

use crate::ir::*;

use std::collections::{BTreeSet, HashSet};

use tracing::debug;

/// Register demand at one program point, in 32-bit units per bank.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Demand {
    pub sgpr: u16,
    pub vgpr: u16,
}

pub struct LiveInfo {
    /// Temps live at the end of each block.
    pub live_out: Vec<HashSet<Temp>>,
    /// Demand right after each instruction, indexed [block][instr].
    /// Only filled in demand-tracking mode.
    pub register_demand: Vec<Vec<Demand>>,
}

fn process_live_temps_per_block<const COMPUTE_DEMAND: bool>(
    program: &mut Program,
    lives: &mut LiveInfo,
    block_idx: u32,
    worklist: &mut BTreeSet<u32>,
) {
    let block = &program.blocks[block_idx as usize];
    let num_instrs = block.instructions.len();

    let mut demand = Demand::default();
    let mut block_demand = Demand::default();
    if COMPUTE_DEMAND {
        lives.register_demand[block_idx as usize] =
            vec![Demand::default(); num_instrs];
    }

    /* split the live-outs into the linear (scalar, mask, linear vgpr)
     * and per-lane halves; they propagate along different edges */
    let mut live_linear: HashSet<Temp> = HashSet::new();
    let mut live_vector: HashSet<Temp> = HashSet::new();
    for temp in &lives.live_out[block_idx as usize] {
        if temp.is_linear() {
            live_linear.insert(*temp);
        } else {
            live_vector.insert(*temp);
        }
        if COMPUTE_DEMAND {
            if temp.ty() == RegType::Vgpr {
                demand.vgpr += temp.size();
            } else {
                demand.sgpr += temp.size();
            }
        }
    }

    /* traverse the instructions backwards */
    for i in (0..num_instrs).rev() {
        if COMPUTE_DEMAND {
            lives.register_demand[block_idx as usize][i] = demand;
        }

        let instr = &program.blocks[block_idx as usize].instructions[i];

        /* KILL */
        for def_idx in 0..instr.num_definitions() {
            let def = *instr.definition(def_idx);
            if !def.is_temp() {
                continue;
            }
            let removed = if def.temp().is_linear() {
                live_linear.remove(&def.temp())
            } else {
                live_vector.remove(&def.temp())
            };
            if COMPUTE_DEMAND {
                if removed {
                    if def.temp().ty() == RegType::Vgpr {
                        demand.vgpr -= def.size();
                    } else {
                        demand.sgpr -= def.size();
                    }
                } else {
                    /* the value is dead at issue, but the defining
                     * instruction still momentarily holds it */
                    let d = &mut lives.register_demand[block_idx as usize][i];
                    if def.temp().ty() == RegType::Vgpr {
                        d.vgpr += def.size();
                    } else {
                        d.sgpr += def.size();
                    }
                }
            }
        }

        /* GEN */
        let instr = &program.blocks[block_idx as usize].instructions[i];
        if instr.is_phi() {
            /* phi operands are not live-in here; they go directly into
             * the matching predecessor's live-out */
            let preds = if instr.opcode == Opcode::PPhi {
                program.blocks[block_idx as usize].logical_preds.clone()
            } else {
                program.blocks[block_idx as usize].linear_preds.clone()
            };
            let ops: Vec<Operand> = instr.operands().to_vec();
            for (op_idx, op) in ops.iter().enumerate() {
                if op.is_temp() {
                    let pred = preds[op_idx];
                    if lives.live_out[pred as usize].insert(op.temp()) {
                        worklist.insert(pred);
                    }
                }
            }
        } else {
            for op_idx in 0..instr.num_operands() {
                let op = *instr.operand(op_idx);
                if !op.is_temp() {
                    continue;
                }
                let inserted = if op.temp().is_linear() {
                    live_linear.insert(op.temp())
                } else {
                    live_vector.insert(op.temp())
                };
                if COMPUTE_DEMAND && inserted {
                    if op.temp().ty() == RegType::Vgpr {
                        demand.vgpr += op.size();
                    } else {
                        demand.sgpr += op.size();
                    }
                }
            }
            if COMPUTE_DEMAND {
                block_demand.sgpr = block_demand.sgpr.max(demand.sgpr);
                block_demand.vgpr = block_demand.vgpr.max(demand.vgpr);
            }
        }
    }

    /* merge what is still live into the predecessors' live-out sets:
     * per-lane values along logical edges, linear values along linear
     * edges */
    let logical_preds = program.blocks[block_idx as usize].logical_preds.clone();
    let linear_preds = program.blocks[block_idx as usize].linear_preds.clone();
    for pred in logical_preds {
        for temp in &live_vector {
            if lives.live_out[pred as usize].insert(*temp) {
                worklist.insert(pred);
            }
        }
    }
    for pred in &linear_preds {
        for temp in &live_linear {
            if lives.live_out[*pred as usize].insert(*temp) {
                worklist.insert(*pred);
            }
        }
    }

    assert!(
        !linear_preds.is_empty()
            || (live_vector.is_empty() && live_linear.is_empty()),
        "entry block must not have live-in temps"
    );

    if COMPUTE_DEMAND {
        let block = &mut program.blocks[block_idx as usize];
        block.sgpr_demand = block_demand.sgpr;
        block.vgpr_demand = block_demand.vgpr;
    }
}

/// Iterative backward dataflow over the linear CFG with SSA-aware phi
/// handling.  In demand-tracking mode this additionally records the
/// per-instruction register demand, the per-block maxima, and the
/// program's wave count.
pub fn live_var_analysis<const COMPUTE_DEMAND: bool>(
    program: &mut Program,
) -> LiveInfo {
    let num_blocks = program.blocks.len();
    let mut lives = LiveInfo {
        live_out: vec![HashSet::new(); num_blocks],
        register_demand: vec![Vec::new(); num_blocks],
    };

    let mut demand = Demand::default();

    /* process the highest block index first; this converges in near
     * reverse post-order */
    let mut worklist: BTreeSet<u32> = (0..num_blocks as u32).collect();
    while let Some(&block_idx) = worklist.iter().next_back() {
        worklist.remove(&block_idx);
        process_live_temps_per_block::<COMPUTE_DEMAND>(
            program,
            &mut lives,
            block_idx,
            &mut worklist,
        );
        let block = &program.blocks[block_idx as usize];
        demand.sgpr = demand.sgpr.max(block.sgpr_demand);
        demand.vgpr = demand.vgpr.max(block.vgpr_demand);
    }

    /* VCC */
    demand.sgpr += 2;

    if COMPUTE_DEMAND {
        let total_sgpr_regs = program.chip_class.total_sgprs();
        let max_addressible_sgpr = program.chip_class.max_addressable_sgpr();
        let rounded_vgpr_demand = 4u16.max((demand.vgpr + 3) & !3);
        let rounded_sgpr_demand =
            8u16.max((demand.sgpr + 7) & !7).min(max_addressible_sgpr);

        program.sgpr_demand = demand.sgpr;
        program.vgpr_demand = demand.vgpr;

        if demand.vgpr > 256 || demand.sgpr > max_addressible_sgpr {
            /* this won't fit, register pressure reduction necessary */
            program.num_waves = 0;
            program.max_sgpr = demand.sgpr;
            program.max_vgpr = demand.vgpr;
        } else {
            program.num_waves = 10u16
                .min(256 / rounded_vgpr_demand)
                .min(total_sgpr_regs / rounded_sgpr_demand);
            /* subtract 2 again for VCC */
            program.max_sgpr = ((total_sgpr_regs / program.num_waves) & !7)
                .min(max_addressible_sgpr)
                - 2;
            program.max_vgpr = (256 / program.num_waves) & !3;
        }

        debug!(
            sgpr_demand = demand.sgpr,
            vgpr_demand = demand.vgpr,
            num_waves = program.num_waves,
            "live variable analysis"
        );
    }

    lives
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{link_blocks, Builder};
    use crate::ChipClass;

    fn straight_line_program() -> Program {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        let b0 = program.create_and_insert_block();
        let mut b = Builder::new(&mut program, b0);
        let x = b.vop1(Opcode::VMovB32, Operand::constant(1));
        let y = b.vop1(Opcode::VMovB32, Operand::constant(2));
        let z = b.vop2(
            Opcode::VAddF32,
            Operand::of_temp(x),
            Operand::of_temp(y),
        );
        b.export(
            0xf,
            0,
            [
                Operand::of_temp(z),
                Operand::of_temp(z),
                Operand::of_temp(z),
                Operand::of_temp(z),
            ],
            true,
            true,
        );
        b.endpgm();
        program
    }

    #[test]
    fn straight_line_demand() {
        let mut program = straight_line_program();
        let lives = live_var_analysis::<true>(&mut program);

        assert!(lives.live_out[0].is_empty());
        /* x and y live into the add */
        assert_eq!(program.blocks[0].vgpr_demand, 2);
        assert_eq!(program.vgpr_demand, 2);
        /* only VCC counts on the scalar side */
        assert_eq!(program.sgpr_demand, 2);
        assert_eq!(program.num_waves, 10);
    }

    #[test]
    fn phi_operands_feed_predecessor_live_out() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        for _ in 0..4 {
            program.create_and_insert_block();
        }
        link_blocks(&mut program, 0, 1);
        link_blocks(&mut program, 0, 2);
        link_blocks(&mut program, 1, 3);
        link_blocks(&mut program, 2, 3);

        let mut b = Builder::new(&mut program, 1);
        let x = b.vop1(Opcode::VMovB32, Operand::constant(1));
        let mut b = Builder::new(&mut program, 2);
        let y = b.vop1(Opcode::VMovB32, Operand::constant(2));
        let mut b = Builder::new(&mut program, 3);
        let phi = b.phi(
            Opcode::PPhi,
            &[Operand::of_temp(x), Operand::of_temp(y)],
            RegClass::V1,
        );
        let z = b.vop2(
            Opcode::VAddF32,
            Operand::of_temp(phi),
            Operand::of_temp(phi),
        );
        b.export(
            0xf,
            0,
            [
                Operand::of_temp(z),
                Operand::of_temp(z),
                Operand::of_temp(z),
                Operand::of_temp(z),
            ],
            true,
            true,
        );
        b.endpgm();

        let lives = live_var_analysis::<true>(&mut program);
        /* each phi operand is live-out only of its own predecessor */
        assert!(lives.live_out[1].contains(&x));
        assert!(!lives.live_out[1].contains(&y));
        assert!(lives.live_out[2].contains(&y));
        assert!(!lives.live_out[2].contains(&x));
        /* and not live-in to the merge block's predecessors' siblings */
        assert!(lives.live_out[0].is_empty());
    }

    #[test]
    fn wave_count_from_demand() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        let b0 = program.create_and_insert_block();
        let mut b = Builder::new(&mut program, b0);
        /* 30 vgprs live at once */
        let temps: Vec<Temp> = (0..30)
            .map(|i| b.vop1(Opcode::VMovB32, Operand::constant(i)))
            .collect();
        let mut acc = b.vop2(
            Opcode::VAddF32,
            Operand::of_temp(temps[0]),
            Operand::of_temp(temps[1]),
        );
        for t in &temps[2..] {
            acc = b.vop2(
                Opcode::VAddF32,
                Operand::of_temp(acc),
                Operand::of_temp(*t),
            );
        }
        b.export(
            0xf,
            0,
            [
                Operand::of_temp(acc),
                Operand::of_temp(acc),
                Operand::of_temp(acc),
                Operand::of_temp(acc),
            ],
            true,
            true,
        );
        b.endpgm();

        live_var_analysis::<true>(&mut program);
        assert_eq!(program.vgpr_demand, 30);
        /* 256 / 32 rounded vgprs */
        assert_eq!(program.num_waves, 8);
        assert_eq!(program.max_vgpr, 32);
    }
}
