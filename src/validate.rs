/*
 * Copyright © 2022 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

use crate::ir::*;
use crate::live::live_var_analysis;
use crate::CompileError;

use std::collections::{HashMap, HashSet};

fn err(block: u32, message: String) -> CompileError {
    CompileError::Validation(format!("BB{}: {}", block, message))
}

fn check_alignment(block: u32, rc: RegClass, reg: PhysReg) -> Result<(), CompileError> {
    if rc.ty() != RegType::Sgpr || reg.0 >= 104 {
        return Ok(());
    }
    if rc.size() == 2 && reg.0 % 2 != 0 {
        return Err(err(
            block,
            format!("size-2 sgpr at odd register {}", reg),
        ));
    }
    if rc.size() >= 4 && reg.0 % 4 != 0 {
        return Err(err(
            block,
            format!("size-{} sgpr not 4-aligned at {}", rc.size(), reg),
        ));
    }
    Ok(())
}

/// Structural SSA invariants: block indices, unique definitions, phi
/// shapes, class consistency, fixed-register alignment.
pub fn validate(program: &Program) -> Result<(), CompileError> {
    let mut defs: HashMap<u32, RegClass> = HashMap::new();

    for (pos, block) in program.blocks.iter().enumerate() {
        if block.index as usize != pos {
            return Err(err(
                block.index,
                format!("block index does not match position {}", pos),
            ));
        }

        for instr in &block.instructions {
            if instr.is_phi() {
                let preds = if instr.opcode == Opcode::PPhi {
                    &block.logical_preds
                } else {
                    &block.linear_preds
                };
                if instr.num_operands() != preds.len() {
                    return Err(err(
                        block.index,
                        format!(
                            "{} has {} operands for {} predecessors",
                            instr.opcode,
                            instr.num_operands(),
                            preds.len()
                        ),
                    ));
                }
                for op in instr.operands() {
                    if op.is_temp()
                        && op.rc() != instr.definition(0).rc()
                    {
                        return Err(err(
                            block.index,
                            format!(
                                "phi operand class {} does not match def {}",
                                op.rc(),
                                instr.definition(0).rc()
                            ),
                        ));
                    }
                }
            }

            if instr.opcode == Opcode::PParallelcopy {
                for i in 0..instr.num_operands() {
                    let op = instr.operand(i);
                    if op.is_temp()
                        && op.rc() != instr.definition(i).rc()
                    {
                        return Err(err(
                            block.index,
                            format!(
                                "parallelcopy class mismatch: {} vs {}",
                                op.rc(),
                                instr.definition(i).rc()
                            ),
                        ));
                    }
                }
            }

            for def in instr.definitions() {
                if !def.is_temp() {
                    continue;
                }
                if defs.insert(def.temp_id(), def.rc()).is_some() {
                    return Err(err(
                        block.index,
                        format!("temp %{} defined more than once", def.temp_id()),
                    ));
                }
                if def.is_fixed() {
                    check_alignment(block.index, def.rc(), def.phys_reg())?;
                }
            }
            for op in instr.operands() {
                if op.is_temp() && op.is_fixed() && !op.is_constant() {
                    check_alignment(block.index, op.rc(), op.phys_reg())?;
                }
            }
        }
    }

    /* every use must refer to a defined temp of the same class */
    for block in &program.blocks {
        for instr in &block.instructions {
            for op in instr.operands() {
                if !op.is_temp() {
                    continue;
                }
                match defs.get(&op.temp_id()) {
                    None => {
                        return Err(err(
                            block.index,
                            format!("use of undefined temp %{}", op.temp_id()),
                        ))
                    }
                    Some(&rc) => {
                        if rc != op.rc() {
                            return Err(err(
                                block.index,
                                format!(
                                    "%{} used as {} but defined as {}",
                                    op.temp_id(),
                                    op.rc(),
                                    rc
                                ),
                            ));
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Post-allocation invariants: everything fixed, and the values live at
/// every point occupy disjoint register words.
pub fn validate_ra(program: &mut Program) -> Result<(), CompileError> {
    let mut location: HashMap<u32, (PhysReg, u16)> = HashMap::new();
    for block in &program.blocks {
        for instr in &block.instructions {
            for def in instr.definitions() {
                if !def.is_temp() {
                    continue;
                }
                if !def.is_fixed() {
                    return Err(err(
                        block.index,
                        format!("unassigned definition %{}", def.temp_id()),
                    ));
                }
                location.insert(def.temp_id(), (def.phys_reg(), def.size()));
            }
            for op in instr.operands() {
                if op.is_temp() && !op.is_fixed() {
                    return Err(err(
                        block.index,
                        format!("unassigned operand %{}", op.temp_id()),
                    ));
                }
            }
        }
    }

    let lives = live_var_analysis::<false>(program);
    for block in &program.blocks {
        let mut live: HashSet<Temp> = lives.live_out[block.index as usize].clone();
        for instr in block.instructions.iter().rev() {
            check_disjoint(block.index, &live, &location)?;
            for def in instr.definitions() {
                if def.is_temp() {
                    live.remove(&def.temp());
                }
            }
            if !instr.is_phi() {
                for op in instr.operands() {
                    if op.is_temp() {
                        live.insert(op.temp());
                    }
                }
            }
        }
    }
    Ok(())
}

fn check_disjoint(
    block: u32,
    live: &HashSet<Temp>,
    location: &HashMap<u32, (PhysReg, u16)>,
) -> Result<(), CompileError> {
    let mut words: HashMap<u16, u32> = HashMap::new();
    for temp in live {
        let &(reg, size) = match location.get(&temp.id()) {
            Some(loc) => loc,
            None => continue,
        };
        for i in 0..size {
            if let Some(other) = words.insert(reg.0 + i, temp.id()) {
                return Err(err(
                    block,
                    format!(
                        "%{} and %{} overlap at {}",
                        temp.id(),
                        other,
                        PhysReg(reg.0 + i)
                    ),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::ChipClass;

    #[test]
    fn duplicate_definition_rejected() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        let b0 = program.create_and_insert_block();
        let mut b = Builder::new(&mut program, b0);
        let x = b.vop1(Opcode::VMovB32, Operand::constant(1));
        /* second def of the same id */
        let mut dup = create_instruction(Opcode::VMovB32, Format::VOP1, 1, 1);
        *dup.operand_mut(0) = Operand::constant(2);
        *dup.definition_mut(0) = Definition::of_temp(x);
        b.push_instr(dup);
        b.endpgm();

        assert!(validate(&program).is_err());
    }

    #[test]
    fn misaligned_fixed_sgpr_pair_rejected() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        let b0 = program.create_and_insert_block();
        let mut b = Builder::new(&mut program, b0);
        let t = b.alloc_temp(RegClass::S2);
        let mut mov = create_instruction(Opcode::SMovB64, Format::SOP1, 1, 1);
        *mov.operand_mut(0) = Operand::constant(0);
        let mut def = Definition::of_temp(t);
        def.set_fixed(PhysReg::sgpr(3));
        *mov.definition_mut(0) = def;
        b.push_instr(mov);
        b.endpgm();

        assert!(validate(&program).is_err());
    }

    #[test]
    fn well_formed_program_passes() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        let b0 = program.create_and_insert_block();
        let mut b = Builder::new(&mut program, b0);
        let x = b.vop1(Opcode::VMovB32, Operand::constant(1));
        let y = b.vop2(Opcode::VMulF32, Operand::of_temp(x), Operand::of_temp(x));
        b.export(
            0xf,
            0,
            [
                Operand::of_temp(y),
                Operand::of_temp(y),
                Operand::of_temp(y),
                Operand::of_temp(y),
            ],
            true,
            true,
        );
        b.endpgm();

        validate(&program).unwrap();
    }
}
