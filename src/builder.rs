/*
 * Copyright © 2022 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

use crate::ir::*;

/// Instruction-construction helpers bound to one block of a program.
/// The front-end and the tests build IR through this; the passes use the
/// factory directly.
pub struct Builder<'a> {
    program: &'a mut Program,
    block: u32,
}

impl<'a> Builder<'a> {
    pub fn new(program: &'a mut Program, block: u32) -> Builder<'a> {
        Builder {
            program: program,
            block: block,
        }
    }

    pub fn push_instr(&mut self, instr: Instruction) {
        self.program.blocks[self.block as usize].instructions.push(instr);
    }

    pub fn alloc_temp(&mut self, rc: RegClass) -> Temp {
        self.program.allocate_temp(rc)
    }

    pub fn sop1(&mut self, opcode: Opcode, rc: RegClass, src: Operand) -> Temp {
        let dst = self.alloc_temp(rc);
        let mut instr = create_instruction(opcode, Format::SOP1, 1, 1);
        *instr.operand_mut(0) = src;
        *instr.definition_mut(0) = Definition::of_temp(dst);
        self.push_instr(instr);
        dst
    }

    /// SOP2 with the usual implicit SCC definition.
    pub fn sop2(
        &mut self,
        opcode: Opcode,
        rc: RegClass,
        a: Operand,
        b: Operand,
    ) -> Temp {
        let dst = self.alloc_temp(rc);
        let scc_id = self.program.allocate_id();
        let mut instr = create_instruction(opcode, Format::SOP2, 2, 2);
        *instr.operand_mut(0) = a;
        *instr.operand_mut(1) = b;
        *instr.definition_mut(0) = Definition::of_temp(dst);
        let mut scc_def = Definition::new(scc_id, RegClass::B);
        scc_def.set_fixed(SCC);
        *instr.definition_mut(1) = scc_def;
        self.push_instr(instr);
        dst
    }

    pub fn vop1(&mut self, opcode: Opcode, src: Operand) -> Temp {
        let dst = self.alloc_temp(RegClass::V1);
        let mut instr = create_instruction(opcode, Format::VOP1, 1, 1);
        *instr.operand_mut(0) = src;
        *instr.definition_mut(0) = Definition::of_temp(dst);
        self.push_instr(instr);
        dst
    }

    pub fn vop2(&mut self, opcode: Opcode, a: Operand, b: Operand) -> Temp {
        let dst = self.alloc_temp(RegClass::V1);
        let mut instr = create_instruction(opcode, Format::VOP2, 2, 1);
        *instr.operand_mut(0) = a;
        *instr.operand_mut(1) = b;
        *instr.definition_mut(0) = Definition::of_temp(dst);
        self.push_instr(instr);
        dst
    }

    /// Comparison writing a per-lane mask; the definition is fixed to VCC
    /// as the plain VOPC encoding demands.
    pub fn vopc(&mut self, opcode: Opcode, a: Operand, b: Operand) -> Temp {
        let dst = self.alloc_temp(RegClass::S2);
        let mut instr = create_instruction(opcode, Format::VOPC, 2, 1);
        *instr.operand_mut(0) = a;
        *instr.operand_mut(1) = b;
        let mut def = Definition::of_temp(dst);
        def.set_fixed(VCC);
        *instr.definition_mut(0) = def;
        self.push_instr(instr);
        dst
    }

    pub fn interp_p1(
        &mut self,
        attribute: u8,
        component: u8,
        i_coord: Operand,
    ) -> Temp {
        let dst = self.alloc_temp(RegClass::V1);
        let mut instr =
            create_instruction(Opcode::VInterpP1F32, Format::VINTRP, 1, 1);
        *instr.operand_mut(0) = i_coord;
        *instr.definition_mut(0) = Definition::of_temp(dst);
        instr.data = InstrData::Vintrp {
            attribute: attribute,
            component: component,
        };
        self.push_instr(instr);
        dst
    }

    pub fn interp_p2(
        &mut self,
        attribute: u8,
        component: u8,
        j_coord: Operand,
        p1: Operand,
    ) -> Temp {
        let dst = self.alloc_temp(RegClass::V1);
        let mut instr =
            create_instruction(Opcode::VInterpP2F32, Format::VINTRP, 3, 1);
        *instr.operand_mut(0) = j_coord;
        *instr.operand_mut(1) = Operand::fixed(M0, RegClass::S1);
        *instr.operand_mut(2) = p1;
        let mut def = Definition::of_temp(dst);
        def.set_reuse_input(true);
        *instr.definition_mut(0) = def;
        instr.data = InstrData::Vintrp {
            attribute: attribute,
            component: component,
        };
        self.push_instr(instr);
        dst
    }

    pub fn phi(&mut self, opcode: Opcode, ops: &[Operand], rc: RegClass) -> Temp {
        assert!(opcode.is_phi());
        let dst = self.alloc_temp(rc);
        let mut instr =
            create_instruction(opcode, Format::PSEUDO, ops.len(), 1);
        for (i, op) in ops.iter().enumerate() {
            *instr.operand_mut(i) = *op;
        }
        *instr.definition_mut(0) = Definition::of_temp(dst);
        self.push_instr(instr);
        dst
    }

    pub fn sopp(&mut self, opcode: Opcode, imm: u16) {
        let mut instr = create_instruction(opcode, Format::SOPP, 0, 0);
        instr.data = InstrData::Sopp {
            imm: imm,
            block: None,
        };
        self.push_instr(instr);
    }

    pub fn branch(&mut self, opcode: Opcode, target: u32) {
        let mut instr = create_instruction(opcode, Format::SOPP, 0, 0);
        instr.data = InstrData::Sopp {
            imm: 0,
            block: Some(target),
        };
        self.push_instr(instr);
    }

    pub fn logical_end(&mut self) {
        self.push_instr(create_instruction(
            Opcode::PLogicalEnd,
            Format::PSEUDO,
            0,
            0,
        ));
    }

    pub fn endpgm(&mut self) {
        self.sopp(Opcode::SEndpgm, 0);
    }

    pub fn export(
        &mut self,
        enabled_mask: u8,
        dest: u8,
        srcs: [Operand; 4],
        done: bool,
        valid_mask: bool,
    ) {
        let mut instr = create_instruction(Opcode::Exp, Format::EXP, 4, 0);
        for (i, src) in srcs.iter().enumerate() {
            *instr.operand_mut(i) = *src;
        }
        instr.data = InstrData::Exp {
            enabled_mask: enabled_mask,
            dest: dest,
            compressed: false,
            done: done,
            valid_mask: valid_mask,
        };
        self.push_instr(instr);
    }
}

pub fn link_logical(program: &mut Program, from: u32, to: u32) {
    program.blocks[from as usize].logical_succs.push(to);
    program.blocks[to as usize].logical_preds.push(from);
}

pub fn link_linear(program: &mut Program, from: u32, to: u32) {
    program.blocks[from as usize].linear_succs.push(to);
    program.blocks[to as usize].linear_preds.push(from);
}

/// Logical and linear edge at once, for uniform control flow.
pub fn link_blocks(program: &mut Program, from: u32, to: u32) {
    link_logical(program, from, to);
    link_linear(program, from, to);
}
