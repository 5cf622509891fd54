/*
 * Copyright © 2022 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

use crate::ir::*;
use crate::live::live_var_analysis;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::mem;

use tracing::debug;

/* SSA-based register allocation: blocks are colored in program order
 * against a flat 512-entry register file; fixed-register constraints are
 * satisfied with parallel-copies, and cross-block names are repaired with
 * the classical incomplete-phi scheme. */

const BLOCKED: u32 = 0xFFFF;

type RegFile = [u32; 512];

struct PhiInfo {
    block_idx: u32,
    /// Def ids of phis that read this phi's def.  Ordinary instructions
    /// are rewired by the final substitution sweep instead.
    uses: HashSet<u32>,
}

struct RaCtx<'a> {
    program: &'a mut Program,
    max_sgpr: u16,
    max_vgpr: u16,
    assignments: HashMap<u32, (PhysReg, RegClass)>,
    renames: Vec<HashMap<u32, Temp>>,
    orig_names: HashMap<u32, Temp>,
    filled: Vec<bool>,
    sealed: Vec<bool>,
    /// Phis created during SSA repair, keyed by def id; surviving ones
    /// are prepended to their block at the end.
    ra_phis: HashMap<u32, Instruction>,
    phi_order: Vec<Vec<u32>>,
    incomplete_phis: Vec<Vec<u32>>,
    phi_map: HashMap<u32, PhiInfo>,
    /// Removed trivial phis: def id -> replacement.
    subst: HashMap<u32, Temp>,
    affinities: HashMap<u32, u32>,
    /// Per block: temp id -> index of its killing instruction in the
    /// pre-RA instruction list (None for live-outs).
    kills: Vec<HashMap<u32, Option<usize>>>,
    live_in: Vec<HashSet<Temp>>,
}

fn rc_stride(rc: RegClass) -> u32 {
    if rc.ty() == RegType::Sgpr {
        if rc.size() == 2 {
            2
        } else if rc.size() > 3 {
            4
        } else {
            1
        }
    } else {
        1
    }
}

impl<'a> RaCtx<'a> {
    fn resolve(&self, mut t: Temp) -> Temp {
        while let Some(&next) = self.subst.get(&t.id()) {
            t = next;
        }
        t
    }

    /// Finds a free aligned window of `size` words in [lb, ub), moving at
    /// most `num_moves` other occupants out of the way via parallel-copy.
    fn get_reg_window(
        &self,
        reg_file: &mut RegFile,
        pc: &mut Vec<(Operand, Definition)>,
        lb: u32,
        ub: u32,
        size: u32,
        stride: u32,
        num_moves: u32,
    ) -> Option<PhysReg> {
        assert!(num_moves <= size);

        /* trivial case: without moves */
        if num_moves == 0 {
            let mut reg_lo = lb;
            'outer: while reg_lo + size <= ub {
                if reg_file[reg_lo as usize] != 0 {
                    reg_lo += stride;
                    continue;
                }
                for i in 1..size {
                    let reg_hi = reg_lo + i;
                    if reg_file[reg_hi as usize] != 0 {
                        while reg_lo <= reg_hi {
                            reg_lo += stride;
                        }
                        continue 'outer;
                    }
                }
                return Some(PhysReg(reg_lo as u16));
            }
            return None;
        }

        /* we use a sliding window to find potential positions */
        let mut reg_lo = lb;
        while reg_lo + size - 1 < ub {
            let reg_hi = reg_lo + size - 1;

            /* don't cut a multi-word variable at the window edges */
            if reg_lo > lb + 1
                && reg_file[reg_lo as usize] == reg_file[reg_lo as usize - 1]
            {
                reg_lo += stride;
                continue;
            }
            if reg_hi < ub - 1
                && reg_file[reg_hi as usize] == reg_file[reg_hi as usize + 1]
            {
                reg_lo += stride;
                continue;
            }

            /* at most num_moves occupants, none larger than the variable
             * being placed (we could loop infinitely otherwise) */
            let mut k = 0;
            let mut vars: BTreeSet<u32> = BTreeSet::new();
            let mut stop = false;
            for j in reg_lo..=reg_hi {
                let id = reg_file[j as usize];
                if id == 0 {
                    continue;
                }
                k += 1;
                if id == BLOCKED || k > num_moves {
                    stop = true;
                    break;
                }
                if u32::from(self.assignments[&id].1.size()) >= size {
                    stop = true;
                    break;
                }
                vars.insert(id);
            }
            if stop {
                reg_lo += stride;
                continue;
            }

            /* move the occupants away, on a copy of the register file */
            let mut register_file = *reg_file;
            for j in reg_lo..=reg_hi {
                register_file[j as usize] = BLOCKED;
            }

            let mut parallelcopy: Vec<(Operand, Definition)> = Vec::new();
            let mut success = true;
            let mut remaining_moves = num_moves - k;
            for id in vars {
                let (var_reg, var_rc) = self.assignments[&id];
                let stride = rc_stride(var_rc);
                let mut moves = 0;
                let mut res = self.get_reg_window(
                    &mut register_file,
                    &mut parallelcopy,
                    lb,
                    ub,
                    u32::from(var_rc.size()),
                    stride,
                    moves,
                );
                while res.is_none() && remaining_moves > 0 {
                    remaining_moves -= 1;
                    moves += 1;
                    res = self.get_reg_window(
                        &mut register_file,
                        &mut parallelcopy,
                        lb,
                        ub,
                        u32::from(var_rc.size()),
                        stride,
                        moves,
                    );
                }
                let new_reg = match res {
                    Some(r) => r,
                    None => {
                        success = false;
                        break;
                    }
                };
                for i in 0..u32::from(var_rc.size()) {
                    register_file[new_reg.reg() + i as usize] = BLOCKED;
                }

                /* parallelcopy pair; the definition id is assigned by the
                 * outer call */
                let mut pc_op = Operand::of_temp(Temp::new(id, var_rc));
                pc_op.set_fixed(var_reg);
                let mut pc_def = Definition::null();
                pc_def.set_temp(Temp::new(0, var_rc));
                pc_def.set_fixed(new_reg);
                parallelcopy.push((pc_op, pc_def));
            }

            if success {
                pc.extend(parallelcopy);
                *reg_file = register_file;
                for i in reg_lo..reg_lo + size {
                    reg_file[i as usize] = 0;
                }
                return Some(PhysReg(reg_lo as u16));
            }

            reg_lo += stride;
        }

        None
    }

    fn get_reg(
        &mut self,
        reg_file: &mut RegFile,
        rc: RegClass,
        pc: &mut Vec<(Operand, Definition)>,
        instr: &mut Instruction,
    ) -> PhysReg {
        let size = u32::from(rc.size());
        let (lb, ub, stride) = if rc.ty() == RegType::Vgpr {
            (256u32, 256 + u32::from(self.max_vgpr), 1u32)
        } else {
            (0u32, u32::from(self.max_sgpr), rc_stride(rc))
        };

        /* try without moves */
        if let Some(reg) =
            self.get_reg_window(reg_file, pc, lb, ub, size, stride, 0)
        {
            return reg;
        }

        /* didn't work out: try with 1 .. size moves */
        assert!(size > 1);
        for k in 1..=size {
            let res =
                self.get_reg_window(reg_file, pc, lb, ub, size, stride, k);
            let reg = match res {
                Some(r) => r,
                None => continue,
            };

            /* the caller fills in the definition's words */
            for i in 0..size {
                reg_file[reg.reg() + i as usize] = 0;
            }

            /* allocate ids for the new copies and rename any operands of
             * the instruction that were moved */
            for i in 0..pc.len() {
                if pc[i].1.is_temp() {
                    continue;
                }
                let rc = pc[i].1.rc();
                let tmp = self.program.allocate_temp(rc);
                pc[i].1.set_temp(tmp);
                let def_reg = pc[i].1.phys_reg();
                self.assignments.insert(tmp.id(), (def_reg, rc));
                for j in 0..usize::from(rc.size()) {
                    reg_file[def_reg.reg() + j] = tmp.id();
                }
                let moved_id = pc[i].0.temp_id();
                for op_idx in 0..instr.num_operands() {
                    let op = *instr.operand(op_idx);
                    if op.is_temp() && op.temp_id() == moved_id {
                        instr.operand_mut(op_idx).set_temp(tmp);
                        instr.operand_mut(op_idx).set_fixed(def_reg);
                    }
                }
            }

            /* it might happen that something was moved to the position of
             * a killed operand; evacuate it */
            for op_idx in 0..instr.num_operands() {
                let op = *instr.operand(op_idx);
                if !op.is_temp()
                    || op.temp().ty() != rc.ty()
                    || !op.is_kill()
                    || !op.is_fixed()
                {
                    continue;
                }
                for j in 0..usize::from(op.size()) {
                    if reg_file[op.phys_reg().reg() + j] == 0 {
                        continue;
                    }
                    let new_rc = op.rc();
                    let new_tmp = self.program.allocate_temp(new_rc);
                    let new_reg = self.get_reg(reg_file, new_rc, pc, instr);
                    let mut def = Definition::of_temp(new_tmp);
                    def.set_fixed(new_reg);
                    pc.push((op, def));
                    instr.operand_mut(op_idx).set_temp(new_tmp);
                    instr.operand_mut(op_idx).set_fixed(new_reg);
                    break;
                }
            }
            return reg;
        }
        panic!("register allocation failed to find a register");
    }

    fn read_variable(&mut self, val: Temp, block_idx: u32) -> Temp {
        match self.renames[block_idx as usize].get(&val.id()) {
            Some(&t) => t,
            None => self.read_variable_recursive(val, block_idx),
        }
    }

    fn read_variable_recursive(&mut self, val: Temp, block_idx: u32) -> Temp {
        let is_logical = val.ty() == RegType::Vgpr;
        let preds = if is_logical {
            self.program.blocks[block_idx as usize].logical_preds.clone()
        } else {
            self.program.blocks[block_idx as usize].linear_preds.clone()
        };
        assert!(!preds.is_empty());

        let new_val;
        if !self.sealed[block_idx as usize] {
            /* the block is not sealed yet: create an incomplete phi, which
             * might later be removed again */
            new_val = self.program.allocate_temp(val.rc());
            let opcode = if is_logical {
                Opcode::PPhi
            } else {
                Opcode::PLinearPhi
            };
            let mut phi =
                create_instruction(opcode, Format::PSEUDO, preds.len(), 1);
            let reg = self.assignments[&val.id()].0;
            let mut def = Definition::of_temp(new_val);
            def.set_fixed(reg);
            *phi.definition_mut(0) = def;
            self.assignments.insert(new_val.id(), (reg, val.rc()));
            for i in 0..preds.len() {
                *phi.operand_mut(i) = Operand::of_temp(val);
            }

            self.phi_map.insert(
                new_val.id(),
                PhiInfo {
                    block_idx: block_idx,
                    uses: HashSet::new(),
                },
            );
            self.ra_phis.insert(new_val.id(), phi);
            self.phi_order[block_idx as usize].push(new_val.id());
            self.incomplete_phis[block_idx as usize].push(new_val.id());
        } else if preds.len() == 1 {
            /* one predecessor: just look there for the name */
            new_val = self.read_variable(val, preds[0]);
        } else {
            /* more predecessors: create a phi just in case */
            let phi_val = self.program.allocate_temp(val.rc());
            self.renames[block_idx as usize].insert(val.id(), phi_val);
            let opcode = if is_logical {
                Opcode::PPhi
            } else {
                Opcode::PLinearPhi
            };
            let mut phi =
                create_instruction(opcode, Format::PSEUDO, preds.len(), 1);
            let reg = self.assignments[&val.id()].0;
            let mut def = Definition::of_temp(phi_val);
            def.set_fixed(reg);
            *phi.definition_mut(0) = def;
            self.assignments.insert(phi_val.id(), (reg, val.rc()));
            self.phi_map.insert(
                phi_val.id(),
                PhiInfo {
                    block_idx: block_idx,
                    uses: HashSet::new(),
                },
            );
            self.ra_phis.insert(phi_val.id(), phi);
            self.phi_order[block_idx as usize].push(phi_val.id());

            /* we look up the name in all predecessors */
            for (i, &pred) in preds.iter().enumerate() {
                let op_temp = self.read_variable(val, pred);
                let mut op = Operand::of_temp(op_temp);
                op.set_fixed(self.assignments[&op_temp.id()].0);
                *self
                    .ra_phis
                    .get_mut(&phi_val.id())
                    .unwrap()
                    .operand_mut(i) = op;
                if op_temp != phi_val {
                    if let Some(info) = self.phi_map.get_mut(&op_temp.id()) {
                        info.uses.insert(phi_val.id());
                    }
                }
            }

            new_val = self.try_remove_trivial_phi(phi_val.id());
        }
        self.renames[block_idx as usize].insert(val.id(), new_val);
        self.orig_names.insert(new_val.id(), val);
        new_val
    }

    /// A phi is trivial iff all operands are the phi itself or one single
    /// other value; replace it by that value and recursively retry the
    /// phis that used it.
    fn try_remove_trivial_phi(&mut self, phi_id: u32) -> Temp {
        let (block_idx, users) = match self.phi_map.get(&phi_id) {
            Some(info) => (info.block_idx, info.uses.clone()),
            None => {
                /* already removed */
                return self.resolve(Temp::new(phi_id, RegClass::B));
            }
        };

        let phi = &self.ra_phis[&phi_id];
        let def = phi.definition(0).temp();
        let mut same = Temp::null();
        for op in phi.operands() {
            let op_temp = self.resolve(op.temp());
            if op_temp == same || op_temp == def {
                continue;
            }
            if !same.is_null() {
                /* phi is not trivial */
                return def;
            }
            same = op_temp;
        }
        assert!(!(same.is_null() || same == def));

        /* reroute all uses to same and remove the phi */
        self.subst.insert(phi_id, same);
        self.ra_phis.remove(&phi_id);
        self.phi_map.remove(&phi_id);

        let orig_var = self
            .orig_names
            .get(&same.id())
            .map_or(same.id(), |t| t.id());
        for block_renames in self.renames.iter_mut() {
            if let Some(t) = block_renames.get_mut(&orig_var) {
                if *t == def {
                    *t = same;
                }
            }
        }

        /* recursively try to remove the user phis */
        for user in users {
            if self.phi_map.contains_key(&user) {
                self.try_remove_trivial_phi(user);
            }
        }

        /* due to the removal of other phis, the name might have changed
         * once again */
        self.renames[block_idx as usize]
            .get(&orig_var)
            .copied()
            .unwrap_or(same)
    }

    fn handle_fixed_operand(
        &mut self,
        reg_file: &mut RegFile,
        pc: &mut Vec<(Operand, Definition)>,
        instr: &mut Instruction,
        op_idx: usize,
    ) {
        let operand = *instr.operand(op_idx);
        let current = self.assignments[&operand.temp_id()].0;
        if operand.phys_reg() == current {
            /* already in the right place */
            return;
        }

        /* check if the target reg is blocked, and move the blocking var */
        if reg_file[operand.phys_reg().reg()] != 0 {
            let blocking_id = reg_file[operand.phys_reg().reg()];
            let blocking_rc = self.assignments[&blocking_id].1;
            let mut pc_op =
                Operand::of_temp(Temp::new(blocking_id, blocking_rc));
            pc_op.set_fixed(operand.phys_reg());
            let reg = self.get_reg(reg_file, pc_op.rc(), pc, instr);
            let tmp = self.program.allocate_temp(pc_op.rc());
            let mut pc_def = Definition::of_temp(tmp);
            pc_def.set_fixed(reg);
            self.assignments.insert(tmp.id(), (reg, pc_op.rc()));
            for i in 0..usize::from(operand.size()) {
                reg_file[pc_op.phys_reg().reg() + i] = 0;
                reg_file[pc_def.phys_reg().reg() + i] = tmp.id();
            }
            pc.push((pc_op, pc_def));
        }

        /* move the operand to the fixed reg and create a parallelcopy */
        let mut pc_op = operand;
        pc_op.set_fixed(current);
        let tmp = self.program.allocate_temp(operand.rc());
        let mut pc_def = Definition::of_temp(tmp);
        pc_def.set_fixed(operand.phys_reg());
        self.assignments
            .insert(tmp.id(), (pc_def.phys_reg(), operand.rc()));
        let mut new_op = Operand::of_temp(tmp);
        new_op.set_fixed(pc_def.phys_reg());
        if operand.is_kill() {
            new_op.set_kill(true);
        }
        *instr.operand_mut(op_idx) = new_op;
        for i in 0..usize::from(operand.size()) {
            reg_file[pc_op.phys_reg().reg() + i] = 0;
            reg_file[pc_def.phys_reg().reg() + i] = tmp.id();
        }
        pc.push((pc_op, pc_def));
    }

    fn handle_definition(
        &mut self,
        reg_file: &mut RegFile,
        pc: &mut Vec<(Operand, Definition)>,
        instr: &mut Instruction,
        def_idx: usize,
        block_idx: u32,
        kill: bool,
    ) {
        let definition = *instr.definition(def_idx);
        if definition.is_fixed() {
            /* check if the target dst is blocked and move the occupant */
            if reg_file[definition.phys_reg().reg()] != 0 {
                let blocking_id = reg_file[definition.phys_reg().reg()];
                let blocking_rc = self.assignments[&blocking_id].1;
                let mut pc_op =
                    Operand::of_temp(Temp::new(blocking_id, blocking_rc));
                pc_op.set_fixed(self.assignments[&blocking_id].0);
                let tmp = self.program.allocate_temp(pc_op.rc());
                let mut pc_def = Definition::of_temp(tmp);
                let reg = self.get_reg(reg_file, pc_op.rc(), pc, instr);
                pc_def.set_fixed(reg);
                self.assignments.insert(tmp.id(), (reg, pc_op.rc()));
                for i in 0..usize::from(pc_op.size()) {
                    reg_file[pc_op.phys_reg().reg() + i] = BLOCKED;
                    reg_file[pc_def.phys_reg().reg() + i] = tmp.id();
                }
                pc.push((pc_op, pc_def));
            }
        } else {
            /* find a free reg, in placement-priority order */
            let reg = if instr.opcode == Opcode::VInterpP2F32
                || instr.opcode == Opcode::VMacF32
            {
                /* the result must be co-located with input 2 */
                instr.operand(2).phys_reg()
            } else if instr.opcode == Opcode::PSplitVector
                && reg_file
                    [instr.operand(0).phys_reg().reg() + def_idx]
                    == 0
            {
                PhysReg(
                    (instr.operand(0).phys_reg().reg() + def_idx) as u16,
                )
            } else if definition.has_hint()
                && reg_file[definition.phys_reg().reg()] == 0
            {
                definition.phys_reg()
            } else if let Some(reg) = self.affinity_reg(reg_file, &definition)
            {
                reg
            } else {
                self.get_reg(reg_file, definition.rc(), pc, instr)
            };
            instr.definition_mut(def_idx).set_fixed(reg);
        }

        let definition = *instr.definition(def_idx);
        self.assignments
            .insert(definition.temp_id(), (definition.phys_reg(), definition.rc()));

        /* enter it into the register file if the value is ever used */
        if kill {
            for i in 0..usize::from(definition.size()) {
                reg_file[definition.phys_reg().reg() + i] =
                    definition.temp_id();
            }
        }
        self.renames[block_idx as usize]
            .insert(definition.temp_id(), definition.temp());
    }

    fn affinity_reg(
        &self,
        reg_file: &RegFile,
        definition: &Definition,
    ) -> Option<PhysReg> {
        let &target = self.affinities.get(&definition.temp_id())?;
        let &(reg, _) = self.assignments.get(&target)?;
        for i in 0..usize::from(definition.size()) {
            if reg_file[reg.reg() + i] != 0 {
                return None;
            }
        }
        Some(reg)
    }

    fn emit_parallelcopy(
        &mut self,
        parallelcopy: Vec<(Operand, Definition)>,
        block_idx: u32,
        instructions: &mut Vec<Instruction>,
    ) {
        if parallelcopy.is_empty() {
            return;
        }
        let mut pc = create_instruction(
            Opcode::PParallelcopy,
            Format::PSEUDO,
            parallelcopy.len(),
            parallelcopy.len(),
        );
        for (i, (mut op, def)) in parallelcopy.into_iter().enumerate() {
            /* the operand might already be renamed; restore the original
             * name so the rename table stays keyed by source names */
            if let Some(&orig) = self.orig_names.get(&op.temp_id()) {
                op.set_temp(orig);
            }
            let orig_id = op.temp_id();
            self.orig_names.insert(def.temp_id(), op.temp());

            let renamed = self.read_variable(op.temp(), block_idx);
            op.set_temp(renamed);
            self.renames[block_idx as usize].insert(orig_id, def.temp());

            *pc.operand_mut(i) = op;
            *pc.definition_mut(i) = def;
        }
        instructions.push(pc);
    }

    fn allocate_block(&mut self, block_idx: u32) {
        let live = self.live_in[block_idx as usize].clone();
        assert!(block_idx != 0 || live.is_empty());

        /* initialize the register file from the live-ins */
        let mut reg_file: RegFile = [0; 512];
        for t in &live {
            let (reg, _) = *self
                .assignments
                .get(&t.id())
                .expect("live-in without assignment");
            for i in 0..usize::from(t.size()) {
                reg_file[reg.reg() + i] = t.id();
            }
        }

        let work =
            mem::take(&mut self.program.blocks[block_idx as usize].instructions);
        let mut instructions: Vec<Instruction> = Vec::with_capacity(work.len());

        for (orig_idx, mut instr) in work.into_iter().enumerate() {
            let mut parallelcopy: Vec<(Operand, Definition)> = Vec::new();

            if instr.is_phi() {
                /* slight adjustment from the paper as we already have phi
                 * nodes: consider them incomplete phis */
                let def = *instr.definition(0);
                self.renames[block_idx as usize]
                    .insert(def.temp_id(), def.temp());
            } else {
                /* handle operands */
                for op_idx in 0..instr.num_operands() {
                    let op = *instr.operand(op_idx);
                    if !op.is_temp() {
                        continue;
                    }

                    /* mark the last use */
                    if self.kills[block_idx as usize].get(&op.temp_id())
                        == Some(&Some(orig_idx))
                    {
                        instr.operand_mut(op_idx).set_kill(true);
                    }

                    /* rename */
                    let renamed = self.read_variable(op.temp(), block_idx);
                    instr.operand_mut(op_idx).set_temp(renamed);

                    if instr.operand(op_idx).is_fixed() {
                        self.handle_fixed_operand(
                            &mut reg_file,
                            &mut parallelcopy,
                            &mut instr,
                            op_idx,
                        );
                    } else {
                        let reg = self.assignments[&renamed.id()].0;
                        instr.operand_mut(op_idx).set_fixed(reg);
                    }
                }

                /* remove dead vars from the register file */
                for op_idx in 0..instr.num_operands() {
                    let op = *instr.operand(op_idx);
                    if op.is_temp() && op.is_fixed() && op.is_kill() {
                        for i in 0..usize::from(op.size()) {
                            reg_file[op.phys_reg().reg() + i] = 0;
                        }
                    }
                }
            }

            /* handle definitions */
            for def_idx in 0..instr.num_definitions() {
                if !instr.definition(def_idx).is_temp() {
                    continue;
                }
                let kill = self.kills[block_idx as usize]
                    .contains_key(&instr.definition(def_idx).temp_id());
                self.handle_definition(
                    &mut reg_file,
                    &mut parallelcopy,
                    &mut instr,
                    def_idx,
                    block_idx,
                    kill,
                );
            }

            self.emit_parallelcopy(parallelcopy, block_idx, &mut instructions);

            /* v_add_co_u32 with a carry-out somewhere else than VCC needs
             * the VOP3A encoding */
            if instr.opcode == Opcode::VAddCoU32
                && instr.num_definitions() > 1
                && instr.definition(1).phys_reg() != VCC
            {
                instr.format = instr.format.combine(Format::VOP3A);
                instr.data = InstrData::Vop3a {
                    abs: [false; 3],
                    opsel: [false; 3],
                    clamp: false,
                    omod: 0,
                    neg: [false; 3],
                };
            }

            instructions.push(instr);
        }

        self.program.blocks[block_idx as usize].instructions = instructions;
        self.filled[block_idx as usize] = true;

        /* seal every successor whose predecessors are now all filled */
        let succs = self.program.blocks[block_idx as usize].linear_succs.clone();
        for succ in succs {
            let all_filled = self.program.blocks[succ as usize]
                .linear_preds
                .iter()
                .all(|&p| self.filled[p as usize]);
            if all_filled && !self.sealed[succ as usize] {
                self.seal_block(succ);
            }
        }
    }

    fn seal_block(&mut self, block_idx: u32) {
        /* finish the incomplete phis and check if they became trivial */
        for phi_id in self.incomplete_phis[block_idx as usize].clone() {
            if !self.ra_phis.contains_key(&phi_id) {
                continue;
            }
            let def_temp = self.ra_phis[&phi_id].definition(0).temp();
            let preds = if def_temp.ty() == RegType::Vgpr {
                self.program.blocks[block_idx as usize].logical_preds.clone()
            } else {
                self.program.blocks[block_idx as usize].linear_preds.clone()
            };
            for (i, &pred) in preds.iter().enumerate() {
                let val = self.ra_phis[&phi_id].operand(i).temp();
                let renamed = self.read_variable(val, pred);
                let reg = self.assignments[&renamed.id()].0;
                let mut op = Operand::of_temp(renamed);
                op.set_fixed(reg);
                *self.ra_phis.get_mut(&phi_id).unwrap().operand_mut(i) = op;
                if renamed.id() != phi_id {
                    if let Some(info) = self.phi_map.get_mut(&renamed.id()) {
                        info.uses.insert(phi_id);
                    }
                }
            }
            self.try_remove_trivial_phi(phi_id);
        }

        /* complete the original phi nodes, but no need to check
         * triviality */
        let num_instrs =
            self.program.blocks[block_idx as usize].instructions.len();
        for pos in 0..num_instrs {
            let instr = &self.program.blocks[block_idx as usize].instructions[pos];
            if !instr.is_phi() {
                break;
            }
            let preds = if instr.opcode == Opcode::PPhi {
                self.program.blocks[block_idx as usize].logical_preds.clone()
            } else {
                self.program.blocks[block_idx as usize].linear_preds.clone()
            };
            for i in 0..preds.len() {
                let op = *self.program.blocks[block_idx as usize].instructions
                    [pos]
                    .operand(i);
                if !op.is_temp() {
                    continue;
                }
                let renamed = self.read_variable(op.temp(), preds[i]);
                let reg = self.assignments[&renamed.id()].0;
                let instr = &mut self.program.blocks[block_idx as usize]
                    .instructions[pos];
                instr.operand_mut(i).set_temp(renamed);
                instr.operand_mut(i).set_fixed(reg);
            }
        }

        self.sealed[block_idx as usize] = true;
    }

    /// Prepends the surviving repair phis and applies the trivial-phi
    /// substitutions to every remaining operand.
    fn finish(&mut self) {
        for block_idx in 0..self.program.blocks.len() {
            let mut phis: Vec<Instruction> = Vec::new();
            for phi_id in &self.phi_order[block_idx] {
                if let Some(phi) = self.ra_phis.remove(phi_id) {
                    phis.push(phi);
                }
            }
            if !phis.is_empty() {
                let block = &mut self.program.blocks[block_idx];
                let rest = mem::take(&mut block.instructions);
                phis.extend(rest);
                block.instructions = phis;
            }
        }

        if self.subst.is_empty() {
            return;
        }
        for block in self.program.blocks.iter_mut() {
            for instr in block.instructions.iter_mut() {
                for op_idx in 0..instr.num_operands() {
                    let op = *instr.operand(op_idx);
                    if !op.is_temp() {
                        continue;
                    }
                    let mut t = op.temp();
                    while let Some(&next) = self.subst.get(&t.id()) {
                        t = next;
                    }
                    if t != op.temp() {
                        instr.operand_mut(op_idx).set_temp(t);
                    }
                }
            }
        }
    }
}

/// Pre-RA backward pass: turns the live-out sets into live-in sets,
/// records each temp's kill point per block, and collects phi affinities
/// that bias the allocator towards coalescing phi webs.
fn compute_kills_and_affinities(
    program: &Program,
    live_in: &mut [HashSet<Temp>],
    kills: &mut [HashMap<u32, Option<usize>>],
    affinities: &mut HashMap<u32, u32>,
) {
    for block in program.blocks.iter().rev() {
        let idx = block.index as usize;
        for t in live_in[idx].clone() {
            kills[idx].entry(t.id()).or_insert(None);
        }

        for (i, instr) in block.instructions.iter().enumerate().rev() {
            if !instr.is_phi() {
                for op in instr.operands() {
                    if op.is_temp() && live_in[idx].insert(op.temp()) {
                        kills[idx].entry(op.temp_id()).or_insert(Some(i));
                    }
                }
            } else {
                /* pick the smallest already-visited operand name of the
                 * matching class; def and the other operands get an
                 * affinity to it */
                let def = instr.definition(0);
                let preds = if instr.opcode == Opcode::PPhi {
                    &block.logical_preds
                } else {
                    &block.linear_preds
                };
                let mut preferred = def.temp_id();
                let mut op_idx = instr.num_operands();
                for (i, op) in instr.operands().iter().enumerate() {
                    if preds[i] < block.index
                        && op.is_temp()
                        && op.temp_id() < preferred
                        && op.rc() == def.rc()
                    {
                        assert!(!op.is_undefined());
                        preferred = op.temp_id();
                        op_idx = i;
                    }
                }
                for (i, op) in instr.operands().iter().enumerate() {
                    if op.is_temp() && i != op_idx {
                        affinities.entry(op.temp_id()).or_insert(preferred);
                    }
                }
                if op_idx < instr.num_operands() {
                    affinities.entry(def.temp_id()).or_insert(preferred);
                }
            }
            for def in instr.definitions() {
                if def.is_temp() {
                    live_in[idx].remove(&def.temp());
                }
            }
        }
    }
}

pub fn register_allocation(program: &mut Program) {
    assert!(
        program.vgpr_demand <= 256
            && program.sgpr_demand
                <= program.chip_class.max_addressable_sgpr()
    );

    /* calculate the register bounds; smaller budgets leave headroom for
     * more waves */
    let (max_sgpr, max_vgpr): (u16, u16) = if program.vgpr_demand <= 24
        && program.sgpr_demand <= 46
    {
        (46, 24)
    } else if program.vgpr_demand <= 28 && program.sgpr_demand <= 54 {
        (54, 28)
    } else if program.vgpr_demand <= 32 && program.sgpr_demand <= 62 {
        (62, 32)
    } else if program.vgpr_demand <= 36 && program.sgpr_demand <= 70 {
        (70, 36)
    } else if program.vgpr_demand <= 40 && program.sgpr_demand <= 78 {
        (78, 40)
    } else if program.vgpr_demand <= 48 && program.sgpr_demand <= 94 {
        (94, 48)
    } else {
        let max_vgpr = if program.vgpr_demand <= 64 {
            64
        } else if program.vgpr_demand <= 84 {
            84
        } else if program.vgpr_demand <= 128 {
            128
        } else {
            256
        };
        (100, max_vgpr)
    };
    program.config.num_vgprs = max_vgpr;
    program.config.num_sgprs = max_sgpr + 2;

    let mut live_in = live_var_analysis::<false>(program).live_out;
    let num_blocks = program.blocks.len();
    let mut kills: Vec<HashMap<u32, Option<usize>>> =
        vec![HashMap::new(); num_blocks];
    let mut affinities: HashMap<u32, u32> = HashMap::new();
    compute_kills_and_affinities(
        program,
        &mut live_in,
        &mut kills,
        &mut affinities,
    );

    let mut ctx = RaCtx {
        program: program,
        max_sgpr: max_sgpr,
        max_vgpr: max_vgpr,
        assignments: HashMap::new(),
        renames: vec![HashMap::new(); num_blocks],
        orig_names: HashMap::new(),
        filled: vec![false; num_blocks],
        sealed: vec![false; num_blocks],
        ra_phis: HashMap::new(),
        phi_order: vec![Vec::new(); num_blocks],
        incomplete_phis: vec![Vec::new(); num_blocks],
        phi_map: HashMap::new(),
        subst: HashMap::new(),
        affinities: affinities,
        kills: kills,
        live_in: live_in,
    };

    for block_idx in 0..num_blocks as u32 {
        ctx.allocate_block(block_idx);
    }
    ctx.finish();

    debug!(
        num_sgprs = program.config.num_sgprs,
        num_vgprs = program.config.num_vgprs,
        "register allocation"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{link_blocks, Builder};
    use crate::ChipClass;

    fn exported(program: &mut Program, block: u32, t: Temp) {
        let mut b = Builder::new(program, block);
        b.export(
            0xf,
            0,
            [
                Operand::of_temp(t),
                Operand::of_temp(t),
                Operand::of_temp(t),
                Operand::of_temp(t),
            ],
            true,
            true,
        );
        b.endpgm();
    }

    #[test]
    fn straight_line_defs_pack_from_v0() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        let b0 = program.create_and_insert_block();
        let mut b = Builder::new(&mut program, b0);
        let t: Vec<Temp> = (0..4)
            .map(|i| b.vop1(Opcode::VMovB32, Operand::constant(i)))
            .collect();
        let mut instr =
            create_instruction(Opcode::Exp, Format::EXP, 4, 0);
        for (i, temp) in t.iter().enumerate() {
            *instr.operand_mut(i) = Operand::of_temp(*temp);
        }
        instr.data = InstrData::Exp {
            enabled_mask: 0xf,
            dest: 0,
            compressed: false,
            done: true,
            valid_mask: true,
        };
        b.push_instr(instr);
        b.endpgm();

        live_var_analysis::<true>(&mut program);
        register_allocation(&mut program);

        let block = &program.blocks[0];
        let mut seen = Vec::new();
        for instr in &block.instructions {
            if instr.opcode == Opcode::VMovB32 {
                assert!(instr.definition(0).is_fixed());
                seen.push(instr.definition(0).phys_reg());
            }
        }
        assert_eq!(
            seen,
            vec![PhysReg::vgpr(0), PhysReg::vgpr(1), PhysReg::vgpr(2), PhysReg::vgpr(3)]
        );
    }

    #[test]
    fn reuse_input_definition_follows_operand_2() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        let b0 = program.create_and_insert_block();
        let mut b = Builder::new(&mut program, b0);
        let i_coord = b.vop1(Opcode::VMovB32, Operand::constant(0));
        let p1 = b.interp_p1(0, 0, Operand::of_temp(i_coord));
        let j_coord = b.vop1(Opcode::VMovB32, Operand::constant(1));
        let p2 = b.interp_p2(0, 0, Operand::of_temp(j_coord), Operand::of_temp(p1));
        exported(&mut program, b0, p2);

        live_var_analysis::<true>(&mut program);
        register_allocation(&mut program);

        let block = &program.blocks[0];
        let interp = block
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::VInterpP2F32)
            .unwrap();
        assert_eq!(
            interp.definition(0).phys_reg(),
            interp.operand(2).phys_reg()
        );
    }

    #[test]
    fn trivial_phi_collapses_in_diamond() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        for _ in 0..4 {
            program.create_and_insert_block();
        }
        link_blocks(&mut program, 0, 1);
        link_blocks(&mut program, 0, 2);
        link_blocks(&mut program, 1, 3);
        link_blocks(&mut program, 2, 3);

        let mut b = Builder::new(&mut program, 0);
        let x = b.vop1(Opcode::VMovB32, Operand::constant(7));
        b.branch(Opcode::SCbranchScc1, 2);
        let mut b = Builder::new(&mut program, 1);
        b.sopp(Opcode::SNop, 0);
        b.branch(Opcode::SBranch, 3);
        let mut b = Builder::new(&mut program, 2);
        b.sopp(Opcode::SNop, 0);
        /* x used only past the join */
        let mut b = Builder::new(&mut program, 3);
        let y = b.vop1(Opcode::VMovB32, Operand::of_temp(x));
        exported(&mut program, 3, y);

        live_var_analysis::<true>(&mut program);
        register_allocation(&mut program);

        /* both paths carry the same name: no phi should survive */
        let merge = &program.blocks[3];
        assert!(merge.instructions.iter().all(|i| !i.is_phi()));
        let mov = merge
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::VMovB32)
            .unwrap();
        assert!(mov.operand(0).is_fixed());
        assert_eq!(mov.operand(0).temp(), x);
    }

    #[test]
    fn fixed_definition_evicts_occupant() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        let b0 = program.create_and_insert_block();
        let mut b = Builder::new(&mut program, b0);
        let x = b.vop1(Opcode::VMovB32, Operand::constant(1));
        /* a def fixed to v0, where x already lives */
        let y = b.alloc_temp(RegClass::V1);
        let mut instr =
            create_instruction(Opcode::VMovB32, Format::VOP1, 1, 1);
        *instr.operand_mut(0) = Operand::constant(2);
        let mut def = Definition::of_temp(y);
        def.set_fixed(PhysReg::vgpr(0));
        *instr.definition_mut(0) = def;
        b.push_instr(instr);
        let z = b.vop2(Opcode::VAddF32, Operand::of_temp(x), Operand::of_temp(y));
        exported(&mut program, b0, z);

        live_var_analysis::<true>(&mut program);
        register_allocation(&mut program);

        let block = &program.blocks[0];
        let pc = block
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::PParallelcopy)
            .expect("eviction must emit a parallelcopy");
        assert_eq!(pc.operand(0).phys_reg(), PhysReg::vgpr(0));
        assert_ne!(pc.definition(0).phys_reg(), PhysReg::vgpr(0));
    }
}
