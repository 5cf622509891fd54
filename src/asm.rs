/*
 * Copyright © 2022 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

use crate::ir::*;

use tracing::debug;

struct AsmContext {
    /// Emitted branches waiting for their target offset: (word index of
    /// the branch, target block).
    branches: Vec<(usize, u32)>,
    block_offsets: Vec<u32>,
}

fn reg(op: &Operand) -> u32 {
    u32::from(op.phys_reg().0)
}

fn dreg(def: &Definition) -> u32 {
    u32::from(def.phys_reg().0)
}

fn emit_vop3(out: &mut Vec<u32>, instr: &Instruction) {
    /* dual encoding: the base-format opcode moves into the VOP3A opcode
     * space at a per-format offset */
    let offset: u32 = if instr.format.has(Format::VOP2) {
        0x100
    } else if instr.format.has(Format::VOP1) {
        0x140
    } else if instr.format.has(Format::VOPC) {
        0x0
    } else if instr.format.base() == Format::VINTRP {
        0x270
    } else {
        0x0
    };
    let opcode = u32::from(instr.opcode.info().hw) + offset;

    let (abs, clamp, omod, neg) = match &instr.data {
        InstrData::Vop3a {
            abs,
            clamp,
            omod,
            neg,
            ..
        } => (*abs, *clamp, *omod, *neg),
        _ => ([false; 3], false, 0, [false; 3]),
    };

    let mut encoding: u32 = 0b110100 << 26;
    encoding |= opcode << 16;
    if clamp {
        encoding |= 1 << 15;
    }
    if instr.num_definitions() > 1
        && instr.definition(1).rc() == RegClass::S2
    {
        /* carry-out to an arbitrary sgpr pair takes the sdst field */
        encoding |= dreg(instr.definition(1)) << 8;
    } else {
        for (i, &a) in abs.iter().enumerate() {
            if a {
                encoding |= 1 << (8 + i);
            }
        }
    }
    encoding |= 0xFF & dreg(instr.definition(0));
    out.push(encoding);

    let mut encoding: u32 = 0;
    for (i, op) in instr.operands().iter().enumerate() {
        encoding |= reg(op) << (i * 9);
    }
    encoding |= u32::from(omod) << 27;
    for (i, &n) in neg.iter().enumerate() {
        if n {
            encoding |= 1 << (29 + i);
        }
    }
    out.push(encoding);
}

fn emit_instruction(
    ctx: &mut AsmContext,
    out: &mut Vec<u32>,
    instr: &Instruction,
) {
    let format = instr.format;
    let hw = u32::from(instr.opcode.info().hw);

    if format.is_pseudo() {
        /* pseudo instructions are consumed by earlier stages; whatever is
         * left emits nothing */
        return;
    } else if format.has(Format::DPP) {
        /* emit the base instruction with src0 replaced by the DPP
         * sentinel, then the DPP control word */
        let mut base = instr.clone();
        base.format = base.format.without(Format::DPP);
        base.operand_mut(0).set_fixed(PhysReg(250));
        let src0 = *instr.operand(0);
        let dpp = instr.data.clone();
        base.data = InstrData::None;
        emit_instruction(ctx, out, &base);

        if let InstrData::Dpp {
            dpp_ctrl,
            row_mask,
            bank_mask,
            abs,
            neg,
            bound_ctrl,
        } = dpp
        {
            let mut encoding: u32 = 0xFF & reg(&src0);
            encoding |= u32::from(dpp_ctrl) << 8;
            if bound_ctrl {
                encoding |= 1 << 19;
            }
            for (i, &n) in neg.iter().enumerate() {
                if n {
                    encoding |= 1 << (20 + i);
                }
            }
            for (i, &a) in abs.iter().enumerate() {
                if a {
                    encoding |= 1 << (22 + i);
                }
            }
            encoding |= u32::from(bank_mask) << 24;
            encoding |= u32::from(row_mask) << 28;
            out.push(encoding);
        } else {
            panic!("DPP format without DPP data");
        }
        return;
    } else if format.has(Format::VOP3A) || format.has(Format::VOP3B) {
        emit_vop3(out, instr);
    } else if format.has(Format::VOP2) {
        let mut encoding: u32 = 0;
        encoding |= hw << 25;
        encoding |= (0xFF & dreg(instr.definition(0))) << 17;
        encoding |= reg(instr.operand(1)) << 9;
        encoding |= reg(instr.operand(0));
        out.push(encoding);
    } else if format.has(Format::VOP1) {
        let mut encoding: u32 = 0b0111111 << 25;
        encoding |= (0xFF & dreg(instr.definition(0))) << 17;
        encoding |= hw << 9;
        encoding |= reg(instr.operand(0));
        out.push(encoding);
    } else if format.has(Format::VOPC) {
        let mut encoding: u32 = 0b0111110 << 25;
        encoding |= hw << 17;
        encoding |= (0xFF & reg(instr.operand(1))) << 9;
        encoding |= reg(instr.operand(0));
        out.push(encoding);
    } else {
        match format.base() {
            Format::SOP2 => {
                let mut encoding: u32 = 0b10 << 30;
                encoding |= hw << 23;
                if instr.num_definitions() > 0 {
                    encoding |= dreg(instr.definition(0)) << 16;
                }
                if instr.num_operands() >= 2 {
                    encoding |= reg(instr.operand(1)) << 8;
                }
                if instr.num_operands() >= 1 {
                    encoding |= reg(instr.operand(0));
                }
                out.push(encoding);
            }
            Format::SOPK => {
                let imm = match &instr.data {
                    InstrData::Sopk { imm } => *imm,
                    _ => 0,
                };
                let mut encoding: u32 = 0b1011 << 28;
                encoding |= hw << 23;
                if instr.num_definitions() > 0
                    && instr.definition(0).rc() != RegClass::B
                {
                    encoding |= dreg(instr.definition(0)) << 16;
                } else if instr.num_operands() > 0
                    && instr.operand(0).rc() != RegClass::B
                {
                    encoding |= reg(instr.operand(0)) << 16;
                }
                encoding |= u32::from(imm);
                out.push(encoding);
            }
            Format::SOP1 => {
                let mut encoding: u32 = 0b101111101 << 23;
                if instr.num_definitions() > 0 {
                    encoding |= dreg(instr.definition(0)) << 16;
                }
                encoding |= hw << 8;
                if instr.num_operands() > 0 {
                    encoding |= reg(instr.operand(0));
                }
                out.push(encoding);
            }
            Format::SOPC => {
                let mut encoding: u32 = 0b101111110 << 23;
                encoding |= hw << 16;
                encoding |= reg(instr.operand(1)) << 8;
                encoding |= reg(instr.operand(0));
                out.push(encoding);
            }
            Format::SOPP => {
                let imm = match &instr.data {
                    InstrData::Sopp { imm, block } => {
                        if let Some(target) = block {
                            /* the offset is patched once all block
                             * offsets are known */
                            ctx.branches.push((out.len(), *target));
                            0
                        } else {
                            *imm
                        }
                    }
                    _ => 0,
                };
                let mut encoding: u32 = 0b101111111 << 23;
                encoding |= hw << 16;
                encoding |= u32::from(imm);
                out.push(encoding);
            }
            Format::VINTRP => {
                let (attribute, component) = match &instr.data {
                    InstrData::Vintrp {
                        attribute,
                        component,
                    } => (*attribute, *component),
                    _ => (0, 0),
                };
                let mut encoding: u32 = 0b110101 << 26;
                encoding |= (0xFF & dreg(instr.definition(0))) << 18;
                encoding |= hw << 16;
                encoding |= u32::from(attribute) << 10;
                encoding |= u32::from(component) << 8;
                encoding |= 0xFF & reg(instr.operand(0));
                out.push(encoding);
            }
            Format::EXP => {
                let (enabled_mask, dest, compressed, done, valid_mask) =
                    match &instr.data {
                        InstrData::Exp {
                            enabled_mask,
                            dest,
                            compressed,
                            done,
                            valid_mask,
                        } => (
                            *enabled_mask,
                            *dest,
                            *compressed,
                            *done,
                            *valid_mask,
                        ),
                        _ => panic!("EXP format without EXP data"),
                    };
                let mut encoding: u32 = 0b110001 << 26;
                if valid_mask {
                    encoding |= 1 << 12;
                }
                if done {
                    encoding |= 1 << 11;
                }
                if compressed {
                    encoding |= 1 << 10;
                }
                encoding |= u32::from(dest) << 4;
                encoding |= u32::from(enabled_mask);
                out.push(encoding);

                let mut encoding: u32 = 0xFF & reg(instr.operand(0));
                encoding |= (0xFF & reg(instr.operand(1))) << 8;
                encoding |= (0xFF & reg(instr.operand(2))) << 16;
                encoding |= (0xFF & reg(instr.operand(3))) << 24;
                out.push(encoding);
            }
            _ => panic!(
                "unimplemented instruction format: {:?}",
                instr.format
            ),
        }
    }

    /* append the literal dword */
    for op in instr.operands() {
        if op.is_literal() {
            out.push(op.constant_value());
            break;
        }
    }
}

fn fixup_exports(program: &mut Program) {
    /* the last export of the program signals completion to the hardware */
    for block in program.blocks.iter_mut().rev() {
        for instr in block.instructions.iter_mut().rev() {
            if instr.format.base() == Format::EXP && !instr.format.is_valu()
            {
                if let InstrData::Exp {
                    done, valid_mask, ..
                } = &mut instr.data
                {
                    *done = true;
                    *valid_mask = true;
                }
                return;
            }
        }
    }

    /* no export at all: add a null export before the final terminator */
    for block in program.blocks.iter_mut().rev() {
        let end = block.instructions.len();
        if end == 0 || block.instructions[end - 1].opcode != Opcode::SEndpgm {
            continue;
        }
        let mut exp = create_instruction(Opcode::Exp, Format::EXP, 4, 0);
        exp.data = InstrData::Exp {
            enabled_mask: 0,
            dest: 9, /* NULL target */
            compressed: false,
            done: true,
            valid_mask: true,
        };
        block.instructions.insert(end - 1, exp);
        return;
    }
}

/// Encodes the program into its final stream of 32-bit machine words and
/// patches block-relative branch offsets.
pub fn emit_program(program: &mut Program) -> Vec<u32> {
    fixup_exports(program);

    let mut ctx = AsmContext {
        branches: Vec::new(),
        block_offsets: vec![0; program.blocks.len()],
    };
    let mut out: Vec<u32> = Vec::new();

    for block in &program.blocks {
        ctx.block_offsets[block.index as usize] = out.len() as u32;
        for instr in &block.instructions {
            emit_instruction(&mut ctx, &mut out, instr);
        }
    }

    /* branch offsets are relative to the next instruction word */
    for (word_idx, target) in &ctx.branches {
        let offset = ctx.block_offsets[*target as usize] as i32
            - *word_idx as i32
            - 1;
        out[*word_idx] |= u32::from(offset as i16 as u16);
    }

    debug!(words = out.len(), "assembled program");
    out
}
