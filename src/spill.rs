/*
 * Copyright © 2022 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

use crate::dominance::{common_dominator, compute_dominance};
use crate::ir::*;
use crate::live::{live_var_analysis, Demand, LiveInfo};
use crate::CompileError;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::mem;

use tracing::debug;

/* Implements the spilling algorithm on SSA-form from
 * "Register Spilling and Live-Range Splitting for SSA-Form Programs"
 * by Matthias Braun and Sebastian Hack.
 */

struct SpillCtx<'a> {
    target_vgpr: u16,
    target_sgpr: u16,
    program: &'a mut Program,
    register_demand: Vec<Vec<Demand>>,
    renames: Vec<HashMap<Temp, Temp>>,
    spills_entry: Vec<HashMap<Temp, u32>>,
    spills_exit: Vec<HashMap<Temp, u32>>,
    processed: Vec<bool>,
    loop_header: Vec<u32>,
    /// Per block and temp: (dominator block of the use chain, distance in
    /// instructions with a loop-nesting penalty).
    next_use_distances_start: Vec<HashMap<Temp, (u32, u32)>>,
    next_use_distances_end: Vec<HashMap<Temp, (u32, u32)>>,
    interferences: Vec<(RegClass, HashSet<u32>)>,
    affinities: Vec<(u32, u32)>,
}

impl<'a> SpillCtx<'a> {
    fn new(
        target_vgpr: u16,
        target_sgpr: u16,
        program: &'a mut Program,
        register_demand: Vec<Vec<Demand>>,
    ) -> SpillCtx<'a> {
        let num_blocks = program.blocks.len();
        SpillCtx {
            target_vgpr: target_vgpr,
            target_sgpr: target_sgpr,
            program: program,
            register_demand: register_demand,
            renames: vec![HashMap::new(); num_blocks],
            spills_entry: vec![HashMap::new(); num_blocks],
            spills_exit: vec![HashMap::new(); num_blocks],
            processed: vec![false; num_blocks],
            loop_header: Vec::new(),
            next_use_distances_start: vec![HashMap::new(); num_blocks],
            next_use_distances_end: vec![HashMap::new(); num_blocks],
            interferences: Vec::new(),
            affinities: Vec::new(),
        }
    }

    fn allocate_spill_id(&mut self, rc: RegClass) -> u32 {
        let id = self.interferences.len() as u32;
        self.interferences.push((rc, HashSet::new()));
        id
    }

    fn add_interference(&mut self, a: u32, b: u32) {
        if a == b {
            return;
        }
        self.interferences[a as usize].1.insert(b);
        self.interferences[b as usize].1.insert(a);
    }

    /// Insertion point within a predecessor: right before the branch
    /// terminator, or, for per-lane values, before `p_logical_end` so the
    /// value is captured before exec-mask changes.
    fn insert_at_pred(&mut self, pred_idx: u32, logical: bool, instr: Instruction) {
        let pred = &mut self.program.blocks[pred_idx as usize];
        let mut idx = pred.instructions.len();
        loop {
            assert!(idx != 0);
            idx -= 1;
            if !logical || pred.instructions[idx].opcode == Opcode::PLogicalEnd {
                break;
            }
        }
        pred.instructions.insert(idx, instr);
    }

    fn new_spill(&mut self, value: Operand, spill_id: u32) -> Instruction {
        let mut spill =
            create_instruction(Opcode::PSpill, Format::PSEUDO, 2, 0);
        *spill.operand_mut(0) = value;
        *spill.operand_mut(1) = Operand::constant(spill_id);
        spill
    }

    fn new_reload(&mut self, spill_id: u32, def: Temp) -> Instruction {
        let mut reload =
            create_instruction(Opcode::PReload, Format::PSEUDO, 1, 1);
        *reload.operand_mut(0) = Operand::constant(spill_id);
        *reload.definition_mut(0) = Definition::of_temp(def);
        reload
    }

    fn next_uses_per_block(&mut self, block_idx: u32, worklist: &mut BTreeSet<u32>) {
        let num_instrs =
            self.program.blocks[block_idx as usize].instructions.len();
        let mut next_uses = self.next_use_distances_end[block_idx as usize].clone();

        /* to compute the next-use distance at the beginning of the block,
         * we have to add the block's size */
        for (_, dist) in next_uses.values_mut() {
            *dist += num_instrs as u32;
        }

        let mut idx = num_instrs as isize - 1;
        while idx >= 0 {
            let instr =
                &self.program.blocks[block_idx as usize].instructions[idx as usize];
            if instr.is_phi() {
                break;
            }

            for def in instr.definitions() {
                if def.is_temp() {
                    next_uses.remove(&def.temp());
                }
            }
            for op in instr.operands() {
                if op.is_temp() {
                    next_uses.insert(op.temp(), (block_idx, idx as u32));
                }
            }
            idx -= 1;
        }

        assert!(block_idx != 0 || next_uses.is_empty());
        self.next_use_distances_start[block_idx as usize] = next_uses.clone();

        while idx >= 0 {
            let instr =
                &self.program.blocks[block_idx as usize].instructions[idx as usize];
            assert!(instr.is_phi());

            let preds = if instr.opcode == Opcode::PPhi {
                self.program.blocks[block_idx as usize].logical_preds.clone()
            } else {
                self.program.blocks[block_idx as usize].linear_preds.clone()
            };
            let ops: Vec<Operand> = instr.operands().to_vec();
            let phi_def =
                self.program.blocks[block_idx as usize].instructions[idx as usize]
                    .definition(0)
                    .temp();
            for (i, op) in ops.iter().enumerate() {
                if !op.is_temp() {
                    continue;
                }
                let pred_idx = preds[i];
                let prev = self.next_use_distances_end[pred_idx as usize]
                    .get(&op.temp())
                    .copied();
                if prev != Some((block_idx, 0)) {
                    worklist.insert(pred_idx);
                }
                self.next_use_distances_end[pred_idx as usize]
                    .insert(op.temp(), (block_idx, 0));
            }
            next_uses.remove(&phi_def);
            idx -= 1;
        }

        /* all remaining live vars must be live-out at the predecessors */
        for (temp, (mut dom, mut distance)) in next_uses {
            let preds = if temp.is_linear() {
                self.program.blocks[block_idx as usize].linear_preds.clone()
            } else {
                self.program.blocks[block_idx as usize].logical_preds.clone()
            };
            for pred_idx in preds {
                if self.program.blocks[pred_idx as usize].loop_nest_depth
                    > self.program.blocks[block_idx as usize].loop_nest_depth
                {
                    distance += 0xFFFF;
                }
                if let Some(&(pdom, pdist)) =
                    self.next_use_distances_end[pred_idx as usize].get(&temp)
                {
                    dom = common_dominator(
                        self.program,
                        dom,
                        pdom,
                        temp.is_linear(),
                    );
                    distance = distance.min(pdist);
                }
                let prev = self.next_use_distances_end[pred_idx as usize]
                    .get(&temp)
                    .copied();
                if prev != Some((dom, distance)) {
                    worklist.insert(pred_idx);
                }
                self.next_use_distances_end[pred_idx as usize]
                    .insert(temp, (dom, distance));
            }
        }
    }

    fn compute_global_next_uses(&mut self) {
        let mut worklist: BTreeSet<u32> =
            (0..self.program.blocks.len() as u32).collect();
        while let Some(&block_idx) = worklist.iter().next_back() {
            worklist.remove(&block_idx);
            self.next_uses_per_block(block_idx, &mut worklist);
        }
    }

    /// Next-use distances within the block for every index >= `start`,
    /// computed from the not-yet-processed tail (still in original SSA
    /// names).  Indices count phis, matching the demand array.
    fn local_next_uses(
        &self,
        block_idx: u32,
        tail: &[Instruction],
        phi_count: usize,
    ) -> Vec<HashMap<Temp, u32>> {
        let num_instrs = phi_count + tail.len();
        let mut local = vec![HashMap::new(); num_instrs];

        let mut next_uses: HashMap<Temp, u32> = HashMap::new();
        for (temp, (_, dist)) in &self.next_use_distances_end[block_idx as usize] {
            next_uses.insert(*temp, dist + num_instrs as u32);
        }

        for i in (phi_count..num_instrs).rev() {
            let instr = &tail[i - phi_count];
            for op in instr.operands() {
                if op.is_temp() {
                    next_uses.insert(op.temp(), i as u32);
                }
            }
            for def in instr.definitions() {
                if def.is_temp() {
                    next_uses.remove(&def.temp());
                }
            }
            local[i] = next_uses.clone();
        }
        local
    }

    /// Chooses which live-in temps enter the block already spilled.
    /// Returns how many (sgpr, vgpr) words that covers.
    fn init_live_in_vars(&mut self, block_idx: u32) -> (i32, i32) {
        let mut spilled_sgprs: i32 = 0;
        let mut spilled_vgprs: i32 = 0;

        /* first block, nothing was spilled before */
        if block_idx == 0 {
            return (0, 0);
        }

        let block_depth = self.program.blocks[block_idx as usize].loop_nest_depth;

        /* loop header block */
        if block_depth
            > self.program.blocks[block_idx as usize - 1].loop_nest_depth
        {
            assert_eq!(
                self.program.blocks[block_idx as usize].linear_preds[0],
                block_idx - 1
            );
            assert_eq!(
                self.program.blocks[block_idx as usize].logical_preds[0],
                block_idx - 1
            );

            self.loop_header.push(block_idx);

            /* how many live-through variables should be spilled: scan the
             * whole loop for its peak demand */
            let mut loop_demand = Demand::default();
            let mut i = block_idx as usize;
            while i < self.program.blocks.len()
                && self.program.blocks[i].loop_nest_depth >= block_depth
            {
                loop_demand.sgpr =
                    loop_demand.sgpr.max(self.program.blocks[i].sgpr_demand);
                loop_demand.vgpr =
                    loop_demand.vgpr.max(self.program.blocks[i].vgpr_demand);
                i += 1;
            }
            let loop_end = i as u32;

            /* select live-through vgpr variables */
            while i32::from(loop_demand.vgpr) - spilled_vgprs
                > i32::from(self.target_vgpr)
            {
                let to_spill = self.furthest_live_through(
                    block_idx,
                    RegType::Vgpr,
                    loop_end,
                );
                let to_spill = match to_spill {
                    Some(t) => t,
                    None => break,
                };
                let spill_id = match self.spills_exit[block_idx as usize - 1]
                    .get(&to_spill)
                {
                    Some(&id) => id,
                    None => self.allocate_spill_id(to_spill.rc()),
                };
                self.spills_entry[block_idx as usize].insert(to_spill, spill_id);
                spilled_vgprs += i32::from(to_spill.size());
            }

            /* select live-through sgpr variables */
            while i32::from(loop_demand.sgpr) - spilled_sgprs
                > i32::from(self.target_sgpr)
            {
                let to_spill = self.furthest_live_through(
                    block_idx,
                    RegType::Sgpr,
                    loop_end,
                );
                let to_spill = match to_spill {
                    Some(t) => t,
                    None => break,
                };
                let spill_id = match self.spills_exit[block_idx as usize - 1]
                    .get(&to_spill)
                {
                    Some(&id) => id,
                    None => self.allocate_spill_id(to_spill.rc()),
                };
                self.spills_entry[block_idx as usize].insert(to_spill, spill_id);
                spilled_sgprs += i32::from(to_spill.size());
            }

            /* shortcut */
            if i32::from(loop_demand.vgpr) - spilled_vgprs
                <= i32::from(self.target_vgpr)
                && i32::from(loop_demand.sgpr) - spilled_sgprs
                    <= i32::from(self.target_sgpr)
            {
                return (spilled_sgprs, spilled_vgprs);
            }

            /* if reg pressure is too high at the beginning of the loop,
             * add variables with the furthest next use */
            let block = &self.program.blocks[block_idx as usize];
            let mut idx = 0;
            while idx < block.instructions.len()
                && block.instructions[idx].is_phi()
            {
                idx += 1;
            }
            assert!(idx != 0, "loop without phis");
            idx -= 1;
            let demand = self.register_demand[block_idx as usize][idx];
            let mut pressure_sgpr = i32::from(demand.sgpr) - spilled_sgprs;
            let mut pressure_vgpr = i32::from(demand.vgpr) - spilled_vgprs;

            while pressure_sgpr > i32::from(self.target_sgpr) {
                let to_spill = self
                    .furthest_next_use_at_start(block_idx, RegType::Sgpr)
                    .expect("no spill candidate despite pressure");
                let spill_id = self.allocate_spill_id(to_spill.rc());
                self.spills_entry[block_idx as usize].insert(to_spill, spill_id);
                spilled_sgprs += i32::from(to_spill.size());
                pressure_sgpr -= i32::from(to_spill.size());
            }
            while pressure_vgpr > i32::from(self.target_vgpr) {
                let to_spill = self
                    .furthest_next_use_at_start(block_idx, RegType::Vgpr)
                    .expect("no spill candidate despite pressure");
                let spill_id = self.allocate_spill_id(to_spill.rc());
                self.spills_entry[block_idx as usize].insert(to_spill, spill_id);
                spilled_vgprs += i32::from(to_spill.size());
                pressure_vgpr -= i32::from(to_spill.size());
            }

            return (spilled_sgprs, spilled_vgprs);
        }

        /* branch block: inherit every spill whose variable is still live
         * here; ones not used in this block move straight to the exit set
         * again, the others get reloaded right before their use */
        if self.program.blocks[block_idx as usize].linear_preds.len() == 1 {
            let pred_idx =
                self.program.blocks[block_idx as usize].linear_preds[0];
            for (temp, spill_id) in self.spills_exit[pred_idx as usize].clone() {
                if temp.ty() == RegType::Sgpr
                    && self.next_use_distances_start[block_idx as usize]
                        .contains_key(&temp)
                {
                    self.spills_entry[block_idx as usize].insert(temp, spill_id);
                    spilled_sgprs += i32::from(temp.size());
                }
            }
            if self.program.blocks[block_idx as usize].logical_preds.len() == 1 {
                let pred_idx =
                    self.program.blocks[block_idx as usize].logical_preds[0];
                for (temp, spill_id) in
                    self.spills_exit[pred_idx as usize].clone()
                {
                    if temp.ty() == RegType::Vgpr
                        && self.next_use_distances_start[block_idx as usize]
                            .contains_key(&temp)
                    {
                        self.spills_entry[block_idx as usize]
                            .insert(temp, spill_id);
                        spilled_vgprs += i32::from(temp.size());
                    }
                }
            }

            return (spilled_sgprs, spilled_vgprs);
        }

        /* else: merge block */
        assert_eq!(
            self.program.blocks[block_idx as usize].linear_preds.len(),
            2
        );
        let mut partial_spills: HashSet<Temp> = HashSet::new();

        /* keep variables spilled on all incoming paths */
        for (temp, _) in self.next_use_distances_start[block_idx as usize].clone()
        {
            let preds = if temp.ty() == RegType::Vgpr {
                self.program.blocks[block_idx as usize].logical_preds.clone()
            } else {
                self.program.blocks[block_idx as usize].linear_preds.clone()
            };
            let mut spill = true;
            let mut spill_id = 0;
            for pred_idx in preds {
                /* variable is not even live at the predecessor: probably
                 * from a phi */
                if !self.next_use_distances_end[pred_idx as usize]
                    .contains_key(&temp)
                {
                    spill = false;
                    break;
                }
                match self.spills_exit[pred_idx as usize].get(&temp) {
                    None => spill = false,
                    Some(&id) => {
                        partial_spills.insert(temp);
                        /* it might be that on one incoming path, the
                         * variable has a different spill_id, but
                         * add_coupling_code() will take care of that. */
                        spill_id = id;
                    }
                }
            }
            if spill {
                self.spills_entry[block_idx as usize].insert(temp, spill_id);
                if temp.ty() == RegType::Vgpr {
                    spilled_vgprs += i32::from(temp.size());
                } else {
                    spilled_sgprs += i32::from(temp.size());
                }
            }
        }

        /* same for phis */
        let mut idx = 0;
        loop {
            let block = &self.program.blocks[block_idx as usize];
            if idx >= block.instructions.len()
                || !block.instructions[idx].is_phi()
            {
                break;
            }
            let phi = &block.instructions[idx];
            let preds = if phi.opcode == Opcode::PPhi {
                block.logical_preds.clone()
            } else {
                block.linear_preds.clone()
            };
            let phi_ops: Vec<Operand> = phi.operands().to_vec();
            let phi_def = phi.definition(0).temp();

            let mut spill = true;
            for (i, op) in phi_ops.iter().enumerate() {
                if !op.is_temp() {
                    spill = false;
                } else if !self.spills_exit[preds[i] as usize]
                    .contains_key(&op.temp())
                {
                    spill = false;
                } else {
                    partial_spills.insert(phi_def);
                }
            }
            if spill {
                let spill_id = self.allocate_spill_id(phi_def.rc());
                self.spills_entry[block_idx as usize].insert(phi_def, spill_id);
                if phi_def.ty() == RegType::Vgpr {
                    spilled_vgprs += i32::from(phi_def.size());
                } else {
                    spilled_sgprs += i32::from(phi_def.size());
                }
            }

            idx += 1;
        }

        /* if reg pressure at the first instruction is still too high, add
         * partially spilled variables */
        let mut pressure_sgpr: i32 = 0;
        let mut pressure_vgpr: i32 = 0;
        let block = &self.program.blocks[block_idx as usize];
        if idx == 0 {
            for def in block.instructions[idx].definitions() {
                if def.is_temp() {
                    if def.temp().ty() == RegType::Vgpr {
                        pressure_vgpr += i32::from(def.size());
                    } else {
                        pressure_sgpr += i32::from(def.size());
                    }
                }
            }
        } else {
            idx -= 1;
        }
        let demand = self.register_demand[block_idx as usize][idx];
        pressure_sgpr += i32::from(demand.sgpr) - spilled_sgprs;
        pressure_vgpr += i32::from(demand.vgpr) - spilled_vgprs;

        while pressure_sgpr > i32::from(self.target_sgpr) {
            let to_spill = self
                .furthest_partial_spill(block_idx, &mut partial_spills, RegType::Sgpr)
                .expect("no partial spill candidate despite pressure");
            let spill_id = self.allocate_spill_id(to_spill.rc());
            self.spills_entry[block_idx as usize].insert(to_spill, spill_id);
            spilled_sgprs += i32::from(to_spill.size());
            pressure_sgpr -= i32::from(to_spill.size());
        }
        while pressure_vgpr > i32::from(self.target_vgpr) {
            let to_spill = self
                .furthest_partial_spill(block_idx, &mut partial_spills, RegType::Vgpr)
                .expect("no partial spill candidate despite pressure");
            let spill_id = self.allocate_spill_id(to_spill.rc());
            self.spills_entry[block_idx as usize].insert(to_spill, spill_id);
            spilled_vgprs += i32::from(to_spill.size());
            pressure_vgpr -= i32::from(to_spill.size());
        }

        (spilled_sgprs, spilled_vgprs)
    }

    /// The live-through variable (next use dominated past `loop_end`) with
    /// the largest next-use distance at the loop preheader's exit.
    fn furthest_live_through(
        &self,
        block_idx: u32,
        ty: RegType,
        loop_end: u32,
    ) -> Option<Temp> {
        let mut distance = 0;
        let mut to_spill = None;
        for (temp, &(dom, dist)) in
            &self.next_use_distances_end[block_idx as usize - 1]
        {
            if temp.ty() == ty
                && dom >= loop_end
                && dist > distance
                && !self.spills_entry[block_idx as usize].contains_key(temp)
            {
                to_spill = Some(*temp);
                distance = dist;
            }
        }
        to_spill
    }

    fn furthest_next_use_at_start(
        &self,
        block_idx: u32,
        ty: RegType,
    ) -> Option<Temp> {
        let mut distance = 0;
        let mut to_spill = None;
        for (temp, &(_, dist)) in
            &self.next_use_distances_start[block_idx as usize]
        {
            if temp.ty() == ty
                && dist > distance
                && !self.spills_entry[block_idx as usize].contains_key(temp)
            {
                to_spill = Some(*temp);
                distance = dist;
            }
        }
        to_spill
    }

    fn furthest_partial_spill(
        &mut self,
        block_idx: u32,
        partial_spills: &mut HashSet<Temp>,
        ty: RegType,
    ) -> Option<Temp> {
        let mut distance = 0;
        let mut to_spill = None;
        let mut dropped: Vec<Temp> = Vec::new();
        for temp in partial_spills.iter() {
            if self.spills_entry[block_idx as usize].contains_key(temp) {
                dropped.push(*temp);
                continue;
            }
            let dist = self.next_use_distances_start[block_idx as usize]
                .get(temp)
                .map_or(0, |&(_, d)| d);
            if temp.ty() == ty && dist > distance {
                distance = dist;
                to_spill = Some(*temp);
            }
        }
        for temp in dropped {
            partial_spills.remove(&temp);
        }
        to_spill
    }

    /// Inserts the spill/reload code between predecessor exits and this
    /// block's entry so both sides agree on what is in a register.
    fn add_coupling_code(&mut self, block_idx: u32) {
        if self.program.blocks[block_idx as usize].linear_preds.is_empty() {
            return;
        }

        /* branch block */
        if self.program.blocks[block_idx as usize].linear_preds.len() == 1 {
            assert!(
                self.processed[self.program.blocks[block_idx as usize]
                    .linear_preds[0] as usize]
            );

            let mut instructions: Vec<Instruction> = Vec::new();

            if self.program.blocks[block_idx as usize].logical_preds.len() == 1 {
                let pred_idx =
                    self.program.blocks[block_idx as usize].logical_preds[0];
                for (live, _) in
                    self.next_use_distances_start[block_idx as usize].clone()
                {
                    if live.ty() == RegType::Sgpr {
                        continue;
                    }
                    self.couple_single_pred(
                        block_idx,
                        pred_idx,
                        live,
                        &mut instructions,
                    );
                }
            }

            let pred_idx =
                self.program.blocks[block_idx as usize].linear_preds[0];
            for (live, _) in
                self.next_use_distances_start[block_idx as usize].clone()
            {
                if live.ty() == RegType::Vgpr {
                    continue;
                }
                self.couple_single_pred(
                    block_idx,
                    pred_idx,
                    live,
                    &mut instructions,
                );
            }

            if !instructions.is_empty() {
                let block = &mut self.program.blocks[block_idx as usize];
                let rest = mem::take(&mut block.instructions);
                instructions.extend(rest);
                block.instructions = instructions;
            }
            return;
        }

        /* loop header and merge blocks: all (linear) predecessors have
         * been processed */
        for &pred in &self.program.blocks[block_idx as usize].linear_preds {
            assert!(self.processed[pred as usize]);
        }

        let mut block_instrs =
            mem::take(&mut self.program.blocks[block_idx as usize].instructions);
        let phi_count =
            block_instrs.iter().take_while(|i| i.is_phi()).count();
        let rest: Vec<Instruction> = block_instrs.split_off(phi_count);
        let phis = block_instrs;

        let mut instructions: Vec<Instruction> = Vec::new();

        /* iterate the phi nodes for which operands to spill at the
         * predecessor */
        for phi in phis {
            let phi_def = phi.definition(0).temp();

            /* if the phi is not spilled, add to instructions */
            if !self.spills_entry[block_idx as usize].contains_key(&phi_def) {
                instructions.push(phi);
                continue;
            }

            let logical = phi.opcode == Opcode::PPhi;
            let preds = if logical {
                self.program.blocks[block_idx as usize].logical_preds.clone()
            } else {
                self.program.blocks[block_idx as usize].linear_preds.clone()
            };
            let def_spill_id =
                self.spills_entry[block_idx as usize][&phi_def];

            for i in 0..phi.num_operands() {
                let op = *phi.operand(i);
                let pred_idx = preds[i];

                /* we have to spill constants to the same memory address */
                if op.is_constant() {
                    let spill_id = self.allocate_spill_id(phi_def.rc());
                    for (_, exit_id) in
                        self.spills_exit[pred_idx as usize].clone()
                    {
                        self.add_interference(def_spill_id, exit_id);
                    }
                    self.affinities.push((def_spill_id, spill_id));
                    let spill = self.new_spill(op, spill_id);
                    self.insert_at_pred(pred_idx, logical, spill);
                    continue;
                }
                if !op.is_temp() {
                    continue;
                }

                /* build interferences between the phi def and all spilled
                 * variables at the predecessor blocks */
                for (exit_temp, exit_id) in
                    self.spills_exit[pred_idx as usize].clone()
                {
                    if op.temp() == exit_temp {
                        continue;
                    }
                    self.add_interference(def_spill_id, exit_id);
                }

                /* variable is already spilled at predecessor */
                if let Some(&spilled_id) =
                    self.spills_exit[pred_idx as usize].get(&op.temp())
                {
                    if spilled_id != def_spill_id {
                        self.affinities.push((def_spill_id, spilled_id));
                    }
                    continue;
                }

                /* rename if necessary */
                let mut var = op.temp();
                if let Some(renamed) =
                    self.renames[block_idx as usize].remove(&var)
                {
                    var = renamed;
                }

                let spill_id = self.allocate_spill_id(phi_def.rc());
                self.affinities.push((def_spill_id, spill_id));
                let spill = self.new_spill(Operand::of_temp(var), spill_id);
                self.insert_at_pred(pred_idx, logical, spill);
                self.spills_exit[pred_idx as usize]
                    .insert(op.temp(), spill_id);
            }

            /* the phi itself is dropped; its value lives in the slot */
        }

        /* iterate all (other) spilled variables for which to spill at the
         * predecessor */
        for (temp, spill_id) in self.spills_entry[block_idx as usize].clone() {
            let logical = temp.ty() == RegType::Vgpr;
            let preds = if logical {
                self.program.blocks[block_idx as usize].logical_preds.clone()
            } else {
                self.program.blocks[block_idx as usize].linear_preds.clone()
            };

            for pred_idx in preds {
                /* add interferences between the spilled variable and the
                 * predecessor's exit spills */
                for (exit_temp, exit_id) in
                    self.spills_exit[pred_idx as usize].clone()
                {
                    if exit_temp == temp {
                        continue;
                    }
                    self.add_interference(spill_id, exit_id);
                }

                /* variable is already spilled at predecessor */
                if let Some(&spilled_id) =
                    self.spills_exit[pred_idx as usize].get(&temp)
                {
                    if spilled_id != spill_id {
                        self.affinities.push((spill_id, spilled_id));
                    }
                    continue;
                }

                /* variable is dead at predecessor, it must be from a phi */
                if !self.next_use_distances_end[pred_idx as usize]
                    .contains_key(&temp)
                {
                    continue;
                }

                /* variable is in a register at the predecessor and has to
                 * be spilled; rename if necessary */
                let mut var = temp;
                if let Some(renamed) =
                    self.renames[block_idx as usize].remove(&var)
                {
                    var = renamed;
                }

                let spill = self.new_spill(Operand::of_temp(var), spill_id);
                self.insert_at_pred(pred_idx, logical, spill);
                self.spills_exit[pred_idx as usize].insert(temp, spill_id);
            }
        }

        /* iterate phis for which operands to reload */
        for phi in instructions.iter_mut() {
            assert!(phi.is_phi());
            let phi_def = phi.definition(0).temp();
            assert!(
                !self.spills_entry[block_idx as usize].contains_key(&phi_def)
            );

            let logical = phi.opcode == Opcode::PPhi;
            let preds = if logical {
                self.program.blocks[block_idx as usize].logical_preds.clone()
            } else {
                self.program.blocks[block_idx as usize].linear_preds.clone()
            };
            for i in 0..phi.num_operands() {
                let op = *phi.operand(i);
                if !op.is_temp() {
                    continue;
                }
                let pred_idx = preds[i];

                /* in a register at the predecessor: just rename */
                if !self.spills_exit[pred_idx as usize]
                    .contains_key(&op.temp())
                {
                    if let Some(&renamed) =
                        self.renames[pred_idx as usize].get(&op.temp())
                    {
                        phi.operand_mut(i).set_temp(renamed);
                    }
                    continue;
                }

                /* reload the phi operand at the end of the predecessor */
                let new_name = self.program.allocate_temp(op.rc());
                let spill_id =
                    self.spills_exit[pred_idx as usize][&op.temp()];
                let reload = self.new_reload(spill_id, new_name);
                self.insert_at_pred(pred_idx, logical, reload);

                self.spills_exit[pred_idx as usize].remove(&op.temp());
                self.renames[pred_idx as usize].insert(op.temp(), new_name);
                phi.operand_mut(i).set_temp(new_name);
            }
        }

        /* iterate live variables for which to reload */
        for (temp, _) in self.next_use_distances_start[block_idx as usize].clone()
        {
            /* skip spilled variables */
            if self.spills_entry[block_idx as usize].contains_key(&temp) {
                continue;
            }
            let logical = temp.ty() == RegType::Vgpr;
            let preds = if logical {
                self.program.blocks[block_idx as usize].logical_preds.clone()
            } else {
                self.program.blocks[block_idx as usize].linear_preds.clone()
            };

            /* variable is dead at a predecessor, it must be from a phi */
            let is_dead = preds.iter().any(|&pred_idx| {
                !self.next_use_distances_end[pred_idx as usize]
                    .contains_key(&temp)
            });
            if is_dead {
                continue;
            }
            for &pred_idx in &preds {
                /* the variable is not spilled at the predecessor */
                if !self.spills_exit[pred_idx as usize].contains_key(&temp) {
                    continue;
                }

                /* variable is spilled at the predecessor and has to be
                 * reloaded */
                let new_name = self.program.allocate_temp(temp.rc());
                let spill_id = self.spills_exit[pred_idx as usize][&temp];
                let reload = self.new_reload(spill_id, new_name);
                self.insert_at_pred(pred_idx, logical, reload);

                self.spills_exit[pred_idx as usize].remove(&temp);
                self.renames[pred_idx as usize].insert(temp, new_name);
            }

            /* check if we have to create a new phi for this variable */
            let mut rename = Temp::null();
            let mut is_same = true;
            for &pred_idx in &preds {
                let pred_name = self.renames[pred_idx as usize]
                    .get(&temp)
                    .copied()
                    .unwrap_or(temp);
                if rename.is_null() {
                    rename = pred_name;
                } else {
                    is_same = rename == pred_name;
                }
                if !is_same {
                    break;
                }
            }

            if !is_same {
                /* the variable was renamed differently in the
                 * predecessors: we have to create a phi */
                let opcode = if temp.ty() == RegType::Vgpr {
                    Opcode::PPhi
                } else {
                    Opcode::PLinearPhi
                };
                rename = self.program.allocate_temp(temp.rc());
                let mut phi = create_instruction(
                    opcode,
                    Format::PSEUDO,
                    preds.len(),
                    1,
                );
                for (i, &pred_idx) in preds.iter().enumerate() {
                    let tmp = if let Some(&renamed) =
                        self.renames[pred_idx as usize].get(&temp)
                    {
                        renamed
                    } else if pred_idx >= block_idx {
                        rename
                    } else {
                        temp
                    };
                    *phi.operand_mut(i) = Operand::of_temp(tmp);
                }
                *phi.definition_mut(0) = Definition::of_temp(rename);
                instructions.push(phi);
            }

            /* the variable was renamed: add new name to renames */
            if !(rename.is_null() || rename == temp) {
                self.renames[block_idx as usize].insert(temp, rename);
            }
        }

        /* combine phis with the rest of the block */
        instructions.extend(rest);
        self.program.blocks[block_idx as usize].instructions = instructions;
    }

    fn couple_single_pred(
        &mut self,
        block_idx: u32,
        pred_idx: u32,
        live: Temp,
        instructions: &mut Vec<Instruction>,
    ) {
        /* still spilled */
        if self.spills_entry[block_idx as usize].contains_key(&live) {
            return;
        }

        /* in a register at the end of the predecessor */
        if !self.spills_exit[pred_idx as usize].contains_key(&live) {
            if let Some(&renamed) = self.renames[pred_idx as usize].get(&live)
            {
                self.renames[block_idx as usize].insert(live, renamed);
            }
            return;
        }

        /* variable is spilled at the predecessor and live at the current
         * block: create a reload instruction */
        let new_name = self.program.allocate_temp(live.rc());
        let spill_id = self.spills_exit[pred_idx as usize][&live];
        let reload = self.new_reload(spill_id, new_name);
        instructions.push(reload);
        self.renames[block_idx as usize].insert(live, new_name);
    }

    fn process_block(
        &mut self,
        block_idx: u32,
        mut current_spills: HashMap<Temp, u32>,
        mut spilled_sgprs: i32,
        mut spilled_vgprs: i32,
    ) {
        let block_instrs =
            mem::take(&mut self.program.blocks[block_idx as usize].instructions);
        let mut instructions: Vec<Instruction> = Vec::new();

        /* phis are handled separately */
        let phi_count =
            block_instrs.iter().take_while(|i| i.is_phi()).count();
        let mut tail = block_instrs;
        let non_phis = tail.split_off(phi_count);
        instructions.extend(tail);
        let tail = non_phis;

        let mut local_next_use_distance: Vec<HashMap<Temp, u32>> = Vec::new();

        let block_demand = Demand {
            sgpr: self.program.blocks[block_idx as usize].sgpr_demand,
            vgpr: self.program.blocks[block_idx as usize].vgpr_demand,
        };

        for (i, mut instr) in tail.iter().cloned().enumerate() {
            let idx = phi_count + i;

            let mut reloads: Vec<(Temp, u32)> = Vec::new();

            /* rename and reload operands */
            for op_idx in 0..instr.num_operands() {
                let op = *instr.operand(op_idx);
                if !op.is_temp() {
                    continue;
                }
                match current_spills.get(&op.temp()).copied() {
                    None => {
                        /* the operand is in a register: check if it was
                         * renamed */
                        if let Some(&renamed) =
                            self.renames[block_idx as usize].get(&op.temp())
                        {
                            instr.operand_mut(op_idx).set_temp(renamed);
                        }
                    }
                    Some(spill_id) => {
                        /* the operand is spilled: add it to reloads */
                        let new_tmp = self.program.allocate_temp(op.rc());
                        self.renames[block_idx as usize]
                            .insert(op.temp(), new_tmp);
                        reloads.push((new_tmp, spill_id));
                        current_spills.remove(&op.temp());
                        instr.operand_mut(op_idx).set_temp(new_tmp);
                        if new_tmp.ty() == RegType::Vgpr {
                            spilled_vgprs -= i32::from(new_tmp.size());
                        } else {
                            spilled_sgprs -= i32::from(new_tmp.size());
                        }
                    }
                }
            }

            /* check if register demand is low enough at the current
             * instruction */
            if block_demand.vgpr > self.target_vgpr
                || block_demand.sgpr > self.target_sgpr
            {
                /* coupling code may have grown the block past the recorded
                 * demand array; clamp to the last recorded point */
                let di = idx
                    .min(self.register_demand[block_idx as usize].len() - 1);
                let mut demand = self.register_demand[block_idx as usize][di];
                if idx == 0 {
                    for def in instr.definitions() {
                        if !def.is_temp() {
                            continue;
                        }
                        if def.temp().ty() == RegType::Vgpr {
                            demand.vgpr += def.size();
                        } else {
                            demand.sgpr += def.size();
                        }
                    }
                } else {
                    let prev = self.register_demand[block_idx as usize]
                        [di.saturating_sub(1)];
                    demand.sgpr = demand.sgpr.max(prev.sgpr);
                    demand.vgpr = demand.vgpr.max(prev.vgpr);
                }

                /* compute local next-use distances on demand */
                if (i32::from(demand.sgpr) - spilled_sgprs
                    > i32::from(self.target_sgpr)
                    || i32::from(demand.vgpr) - spilled_vgprs
                        > i32::from(self.target_vgpr))
                    && local_next_use_distance.is_empty()
                {
                    local_next_use_distance =
                        self.local_next_uses(block_idx, &tail, phi_count);
                }

                /* if reg pressure is too high, spill the variable with the
                 * furthest next use */
                while i32::from(demand.vgpr) - spilled_vgprs
                    > i32::from(self.target_vgpr)
                    || i32::from(demand.sgpr) - spilled_sgprs
                        > i32::from(self.target_sgpr)
                {
                    let ty = if i32::from(demand.vgpr) - spilled_vgprs
                        > i32::from(self.target_vgpr)
                    {
                        RegType::Vgpr
                    } else {
                        RegType::Sgpr
                    };
                    let mut distance = 0;
                    let mut to_spill = None;
                    for (temp, &dist) in &local_next_use_distance[idx] {
                        if temp.ty() == ty
                            && dist > distance
                            && !current_spills.contains_key(temp)
                            && !self.spills_exit[block_idx as usize]
                                .contains_key(temp)
                        {
                            to_spill = Some(*temp);
                            distance = dist;
                        }
                    }
                    let mut to_spill =
                        to_spill.expect("no spill candidate despite pressure");
                    let spill_id = self.allocate_spill_id(to_spill.rc());

                    /* add interferences with currently spilled variables */
                    for (_, &other_id) in current_spills.iter() {
                        self.add_interference(spill_id, other_id);
                    }

                    current_spills.insert(to_spill, spill_id);
                    if to_spill.ty() == RegType::Vgpr {
                        spilled_vgprs += i32::from(to_spill.size());
                    } else {
                        spilled_sgprs += i32::from(to_spill.size());
                    }

                    /* rename if necessary */
                    if let Some(&renamed) =
                        self.renames[block_idx as usize].get(&to_spill)
                    {
                        to_spill = renamed;
                    }

                    let spill =
                        self.new_spill(Operand::of_temp(to_spill), spill_id);
                    instructions.push(spill);
                }
            }

            /* add reloads and the instruction to the new list */
            for (new_tmp, spill_id) in reloads {
                let reload = self.new_reload(spill_id, new_tmp);
                instructions.push(reload);
            }
            instructions.push(instr);
        }

        self.program.blocks[block_idx as usize].instructions = instructions;
        self.spills_exit[block_idx as usize].extend(current_spills);
    }

    fn spill_block(&mut self, block_idx: u32) {
        self.processed[block_idx as usize] = true;

        /* determine the set of variables which are spilled at the
         * beginning of the block */
        let (spilled_sgprs, spilled_vgprs) = self.init_live_in_vars(block_idx);

        /* entry spills all interfere with each other */
        let entry: Vec<u32> =
            self.spills_entry[block_idx as usize].values().copied().collect();
        for &x in &entry {
            for &y in &entry {
                if x != y {
                    self.interferences[x as usize].1.insert(y);
                }
            }
        }

        let is_loop_header = self.program.blocks[block_idx as usize]
            .loop_nest_depth
            > 0
            && self.loop_header.last() == Some(&block_idx);
        if !is_loop_header {
            /* add spill/reload code on incoming control flow edges */
            self.add_coupling_code(block_idx);
        }

        let mut current_spills = self.spills_entry[block_idx as usize].clone();

        /* remove spills which are not needed in this block */
        let keys: Vec<Temp> = current_spills.keys().copied().collect();
        for temp in keys {
            let dom = self.next_use_distances_start[block_idx as usize]
                .get(&temp)
                .map_or(0, |&(dom, _)| dom);
            if dom > block_idx {
                let id = current_spills.remove(&temp).unwrap();
                self.spills_exit[block_idx as usize].insert(temp, id);
            }
        }

        /* conditions to process this block */
        let block = &self.program.blocks[block_idx as usize];
        if !current_spills.is_empty()
            || i32::from(block.vgpr_demand) - spilled_vgprs
                > i32::from(self.target_vgpr)
            || i32::from(block.sgpr_demand) - spilled_sgprs
                > i32::from(self.target_sgpr)
            || !self.renames[block_idx as usize].is_empty()
        {
            self.process_block(
                block_idx,
                current_spills,
                spilled_sgprs,
                spilled_vgprs,
            );
        }

        /* check if the next block leaves the current loop */
        let depth = self.program.blocks[block_idx as usize].loop_nest_depth;
        if depth == 0
            || block_idx as usize + 1 >= self.program.blocks.len()
            || self.program.blocks[block_idx as usize + 1].loop_nest_depth
                >= depth
        {
            return;
        }

        let header_idx = *self.loop_header.last().unwrap();

        /* save the original renames at the end of the loop header block */
        let saved = mem::take(&mut self.renames[header_idx as usize]);

        /* add coupling code to all loop header predecessors */
        self.add_coupling_code(header_idx);

        /* propagate the new renames through the loop, repairing the SSA */
        let new_renames =
            mem::replace(&mut self.renames[header_idx as usize], saved);
        for (old, new) in new_renames {
            for idx in header_idx..=block_idx {
                /* first rename phis */
                let num_instrs =
                    self.program.blocks[idx as usize].instructions.len();
                let mut pos = 0;
                while pos < num_instrs {
                    if !self.program.blocks[idx as usize].instructions[pos]
                        .is_phi()
                    {
                        break;
                    }
                    /* the loop header phis were already renamed in
                     * add_coupling_code() */
                    if idx != header_idx {
                        let phi = &mut self.program.blocks[idx as usize]
                            .instructions[pos];
                        for op_idx in 0..phi.num_operands() {
                            let op = *phi.operand(op_idx);
                            if op.is_temp() && op.temp() == old {
                                phi.operand_mut(op_idx).set_temp(new);
                            }
                        }
                    }
                    pos += 1;
                }

                let start_entry = self.next_use_distances_start[idx as usize]
                    .get(&old)
                    .copied();
                match start_entry {
                    /* variable is not live at the beginning of this block */
                    None => continue,
                    Some((dom, _)) if dom != idx => {
                        /* not used in this block, but later */
                        self.renames[idx as usize].insert(old, new);
                        continue;
                    }
                    _ => {}
                }

                /* rename all uses in this block, stopping at a spill of
                 * the variable: that spill consumed the previous name */
                let mut stopped = false;
                while pos < num_instrs {
                    let instr =
                        &mut self.program.blocks[idx as usize].instructions[pos];
                    for op_idx in 0..instr.num_operands() {
                        let op = *instr.operand(op_idx);
                        if op.is_temp() && op.temp() == old {
                            instr.operand_mut(op_idx).set_temp(new);
                        }
                    }
                    if instr.opcode == Opcode::PSpill
                        && instr.operand(0).is_temp()
                        && instr.operand(0).temp() == new
                    {
                        stopped = true;
                        break;
                    }
                    pos += 1;
                }

                /* if the variable is live at the block's exit, keep the
                 * rename */
                if !stopped
                    && self.next_use_distances_end[idx as usize]
                        .contains_key(&old)
                {
                    self.renames[idx as usize].insert(old, new);
                }
            }
        }

        self.loop_header.pop();
    }

    /// Greedy slot coloring per bank.  Affine spill ids pool their
    /// interferences so they can land on the same slot; multi-word vgpr
    /// slots must stay within one 64-lane backing register.  Returns the
    /// per-bank slot maps and the total number of slot words.
    fn color_spill_slots(
        &mut self,
    ) -> (HashMap<u32, u32>, HashMap<u32, u32>, usize) {
        let mut sgpr_slot: HashMap<u32, u32> = HashMap::new();
        let mut vgpr_slot: HashMap<u32, u32> = HashMap::new();
        let mut is_assigned = vec![false; self.interferences.len()];

        /* first, handle affinities: just merge all interferences into both
         * spill ids */
        for (a, b) in self.affinities.clone() {
            assert!(a != b);
            let other = self.interferences[b as usize].1.clone();
            self.interferences[a as usize].1.extend(other);
            let other = self.interferences[a as usize].1.clone();
            self.interferences[b as usize].1.extend(other);
        }
        for (i, (_, set)) in self.interferences.iter().enumerate() {
            assert!(!set.contains(&(i as u32)));
        }

        /* for each spill slot, assign as many spill ids as possible */
        let mut spill_slot_interferences: Vec<HashSet<u32>> = Vec::new();

        for ty in [RegType::Sgpr, RegType::Vgpr] {
            let mut slot_idx: usize = 0;
            let mut done = false;
            while !done {
                done = true;
                for id in 0..self.interferences.len() {
                    if is_assigned[id] {
                        continue;
                    }
                    let rc = self.interferences[id].0;
                    if rc.ty() != ty {
                        continue;
                    }
                    let size = usize::from(rc.size());

                    /* check interferences; vector slots must not cross a
                     * 64-lane boundary */
                    let mut interferes = false;
                    for i in slot_idx..slot_idx + size {
                        if i == spill_slot_interferences.len() {
                            spill_slot_interferences.push(HashSet::new());
                        }
                        if spill_slot_interferences[i].contains(&(id as u32))
                            || (ty == RegType::Vgpr && i / 64 != slot_idx / 64)
                        {
                            interferes = true;
                            break;
                        }
                    }
                    if interferes {
                        done = false;
                        continue;
                    }

                    /* this spill id can live in the current slot */
                    if ty == RegType::Sgpr {
                        sgpr_slot.insert(id as u32, slot_idx as u32);
                    } else {
                        vgpr_slot.insert(id as u32, slot_idx as u32);
                    }
                    is_assigned[id] = true;
                    let others: Vec<u32> = self.interferences[id]
                        .1
                        .iter()
                        .copied()
                        .collect();
                    for i in slot_idx..slot_idx + size {
                        spill_slot_interferences[i].extend(others.iter());
                    }
                }
                slot_idx += 1;
            }
        }

        assert!(is_assigned.iter().all(|&a| a));

        (sgpr_slot, vgpr_slot, spill_slot_interferences.len())
    }

    fn assign_spill_slots(
        &mut self,
        spills_to_vgpr: i32,
    ) -> Result<(), CompileError> {
        let (sgpr_slot, vgpr_slot, num_slots) = self.color_spill_slots();

        let num_linear_vgprs = (num_slots + 63) / 64;
        assert!(num_linear_vgprs as i32 <= spills_to_vgpr);
        let mut vgpr_spill_temps: Vec<Option<Temp>> =
            vec![None; num_linear_vgprs];

        debug!(
            sgpr_spill_ids = sgpr_slot.len(),
            linear_vgprs = num_linear_vgprs,
            "assigned spill slots"
        );

        /* last block referencing each backing word; the storage must stay
         * alive up to there */
        let mut last_use_block: HashMap<usize, u32> = HashMap::new();
        for block in self.program.blocks.iter() {
            for instr in &block.instructions {
                let spill_id = match instr.opcode {
                    Opcode::PSpill => instr.operand(1).constant_value(),
                    Opcode::PReload => instr.operand(0).constant_value(),
                    _ => continue,
                };
                if let Some(&slot) = sgpr_slot.get(&spill_id) {
                    last_use_block.insert(slot as usize / 64, block.index);
                }
            }
        }

        /* replace the pseudo instructions with the lowered per-lane form */
        let mut nesting_depth: i32 = 0;
        let mut last_top_level_block_idx: u32 = 0;
        for block_idx in 0..self.program.blocks.len() as u32 {
            let block = &self.program.blocks[block_idx as usize];
            if block.loop_nest_depth == 0 && block.linear_preds.len() == 2 {
                nesting_depth -= 1;
            }
            if block.loop_nest_depth == 0 && nesting_depth == 0 {
                last_top_level_block_idx = block_idx;

                /* destroy linear vgprs no spilled variable still uses */
                for i in 0..vgpr_spill_temps.len() {
                    let temp = match vgpr_spill_temps[i] {
                        Some(t) => t,
                        None => continue,
                    };
                    let still_used = last_use_block
                        .get(&i)
                        .map_or(false, |&last| last >= block_idx);
                    if still_used {
                        continue;
                    }
                    let mut destr = create_instruction(
                        Opcode::PEndLinearVgpr,
                        Format::PSEUDO,
                        1,
                        0,
                    );
                    *destr.operand_mut(0) = Operand::of_temp(temp);
                    let block =
                        &mut self.program.blocks[block_idx as usize];
                    let after_phi = block
                        .instructions
                        .iter()
                        .take_while(|i| i.is_phi())
                        .count();
                    block.instructions.insert(after_phi, destr);
                    vgpr_spill_temps[i] = None;
                }
            }

            let mut pos = 0;
            while pos < self.program.blocks[block_idx as usize].instructions.len()
            {
                let opcode = self.program.blocks[block_idx as usize]
                    .instructions[pos]
                    .opcode;
                if opcode == Opcode::PSpill {
                    let spill_id = self.program.blocks[block_idx as usize]
                        .instructions[pos]
                        .operand(1)
                        .constant_value();

                    if vgpr_slot.contains_key(&spill_id) {
                        /* spill vgpr */
                        return Err(CompileError::VgprSpilling);
                    }
                    let spill_slot = *sgpr_slot
                        .get(&spill_id)
                        .expect("no spill slot assigned for spill id");

                    let backing = self.get_or_create_linear_vgpr(
                        &mut vgpr_spill_temps,
                        spill_slot,
                        last_top_level_block_idx,
                        block_idx,
                        &mut pos,
                    );

                    /* spill sgpr: just add the vgpr temp to the operands */
                    let old = self.program.blocks[block_idx as usize]
                        .instructions[pos]
                        .clone();
                    let mut spill = create_instruction(
                        Opcode::PSpill,
                        Format::PSEUDO,
                        3,
                        0,
                    );
                    *spill.operand_mut(0) = Operand::of_temp(backing);
                    *spill.operand_mut(1) = Operand::constant(spill_slot % 64);
                    *spill.operand_mut(2) = *old.operand(0);
                    self.program.blocks[block_idx as usize].instructions[pos] =
                        spill;
                } else if opcode == Opcode::PReload {
                    let spill_id = self.program.blocks[block_idx as usize]
                        .instructions[pos]
                        .operand(0)
                        .constant_value();

                    if vgpr_slot.contains_key(&spill_id) {
                        /* reload vgpr */
                        return Err(CompileError::VgprSpilling);
                    }
                    let spill_slot = *sgpr_slot
                        .get(&spill_id)
                        .expect("no spill slot assigned for spill id");

                    let backing = self.get_or_create_linear_vgpr(
                        &mut vgpr_spill_temps,
                        spill_slot,
                        last_top_level_block_idx,
                        block_idx,
                        &mut pos,
                    );

                    let old = self.program.blocks[block_idx as usize]
                        .instructions[pos]
                        .clone();
                    let mut reload = create_instruction(
                        Opcode::PReload,
                        Format::PSEUDO,
                        2,
                        1,
                    );
                    *reload.operand_mut(0) = Operand::of_temp(backing);
                    *reload.operand_mut(1) = Operand::constant(spill_slot % 64);
                    *reload.definition_mut(0) = *old.definition(0);
                    self.program.blocks[block_idx as usize].instructions[pos] =
                        reload;
                }
                pos += 1;
            }

            let block = &self.program.blocks[block_idx as usize];
            if block.loop_nest_depth == 0 && block.linear_succs.len() == 2 {
                nesting_depth += 1;
            }
        }

        Ok(())
    }

    fn get_or_create_linear_vgpr(
        &mut self,
        vgpr_spill_temps: &mut [Option<Temp>],
        spill_slot: u32,
        last_top_level_block_idx: u32,
        block_idx: u32,
        pos: &mut usize,
    ) -> Temp {
        let word = spill_slot as usize / 64;
        if let Some(temp) = vgpr_spill_temps[word] {
            return temp;
        }

        let linear_vgpr = self.program.allocate_temp(RegClass::V1_LINEAR);
        vgpr_spill_temps[word] = Some(linear_vgpr);
        let mut create = create_instruction(
            Opcode::PStartLinearVgpr,
            Format::PSEUDO,
            0,
            1,
        );
        *create.definition_mut(0) = Definition::of_temp(linear_vgpr);

        if last_top_level_block_idx == block_idx {
            /* insert right before the current instruction */
            self.program.blocks[block_idx as usize]
                .instructions
                .insert(*pos, create);
            *pos += 1;
        } else {
            assert!(last_top_level_block_idx < block_idx);
            /* insert before the branch at the last top level block */
            let instructions = &mut self.program.blocks
                [last_top_level_block_idx as usize]
                .instructions;
            let at = instructions.len() - 1;
            instructions.insert(at, create);
        }
        linear_vgpr
    }
}

/// Reduces register pressure until the per-wave targets fit, inserting
/// `p_spill`/`p_reload` pseudo-ops and lowering the sgpr slots onto
/// linear-vgpr backing storage.
pub fn spill(
    program: &mut Program,
    lives: &mut LiveInfo,
) -> Result<(), CompileError> {
    /* no spilling when the wave count is already high */
    if program.num_waves >= 6 {
        return Ok(());
    }

    let total_sgpr_regs = program.chip_class.total_sgprs();
    let max_addressible_sgpr = program.chip_class.max_addressable_sgpr();

    /* calculate the target register demand */
    let mut max_demand = Demand::default();
    for block in &program.blocks {
        max_demand.sgpr = max_demand.sgpr.max(block.sgpr_demand);
        max_demand.vgpr = max_demand.vgpr.max(block.vgpr_demand);
    }

    let mut target_vgpr: u16 = 256;
    let mut target_sgpr: u16 = max_addressible_sgpr;
    let mut num_waves: u16 = 1;
    let mut spills_to_vgpr: i32 =
        (i32::from(max_demand.sgpr) - i32::from(max_addressible_sgpr) + 63) / 64;

    /* test if it is possible to increase occupancy with little spilling */
    for num_waves_next in 2..=8u16 {
        let target_vgpr_next = (256 / num_waves_next) & !3;
        let target_sgpr_next = ((total_sgpr_regs / num_waves_next) & !7)
            .min(max_addressible_sgpr)
            - 2;

        /* no vgpr spilling supported: stop once the vgpr demand alone
         * exceeds the candidate target */
        if max_demand.vgpr > target_vgpr_next {
            break;
        }
        /* check that we have enough free vgprs to spill sgprs into */
        if max_demand.sgpr > target_sgpr_next {
            /* add some buffer in case graph coloring is not perfect */
            let spills_to_vgpr_next = (i32::from(max_demand.sgpr)
                - i32::from(target_sgpr_next)
                + 63
                + 32)
                / 64;
            if spills_to_vgpr_next + i32::from(max_demand.vgpr)
                > i32::from(target_vgpr_next)
            {
                break;
            }
            spills_to_vgpr = spills_to_vgpr_next;
        }

        target_vgpr = target_vgpr_next;
        target_sgpr = target_sgpr_next;
        num_waves = num_waves_next;
    }

    if max_demand.vgpr > target_vgpr {
        return Err(CompileError::VgprSpilling);
    }
    /* nothing to do */
    if num_waves == program.num_waves {
        return Ok(());
    }

    debug!(
        target_sgpr = target_sgpr,
        target_vgpr = target_vgpr,
        num_waves = num_waves,
        "spilling for occupancy"
    );

    compute_dominance(program);

    let register_demand = lives.register_demand.clone();
    let mut ctx = SpillCtx::new(target_vgpr, target_sgpr, program, register_demand);
    ctx.compute_global_next_uses();

    /* create spills and reloads */
    for block_idx in 0..ctx.program.blocks.len() as u32 {
        ctx.spill_block(block_idx);
    }

    /* assign spill slots and lower to linear-vgpr storage */
    ctx.assign_spill_slots(spills_to_vgpr)?;

    /* update live variable information */
    *lives = live_var_analysis::<true>(program);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{link_blocks, Builder};
    use crate::ChipClass;

    #[test]
    fn no_spilling_at_high_wave_count() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        let b0 = program.create_and_insert_block();
        let mut b = Builder::new(&mut program, b0);
        let x = b.vop1(Opcode::VMovB32, Operand::constant(1));
        b.export(
            0xf,
            0,
            [
                Operand::of_temp(x),
                Operand::of_temp(x),
                Operand::of_temp(x),
                Operand::of_temp(x),
            ],
            true,
            true,
        );
        b.endpgm();

        let mut lives = live_var_analysis::<true>(&mut program);
        assert!(program.num_waves >= 6);
        let before = program.blocks[0].instructions.len();
        spill(&mut program, &mut lives).unwrap();
        assert_eq!(program.blocks[0].instructions.len(), before);
    }

    #[test]
    fn next_use_distances_cross_blocks() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        for _ in 0..2 {
            program.create_and_insert_block();
        }
        link_blocks(&mut program, 0, 1);

        let mut b = Builder::new(&mut program, 0);
        let x = b.vop1(Opcode::VMovB32, Operand::constant(1));
        b.branch(Opcode::SBranch, 1);
        let mut b = Builder::new(&mut program, 1);
        let y = b.vop1(Opcode::VMovB32, Operand::constant(2));
        let z = b.vop2(Opcode::VAddF32, Operand::of_temp(x), Operand::of_temp(y));
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

        compute_dominance(&mut program);
        let lives = live_var_analysis::<true>(&mut program);
        let demand = lives.register_demand.clone();
        let mut ctx = SpillCtx::new(256, 100, &mut program, demand);
        ctx.compute_global_next_uses();

        /* x is used at index 1 of block 1 */
        assert_eq!(
            ctx.next_use_distances_start[1].get(&x).copied(),
            Some((1, 1))
        );
        /* at the end of block 0, x is next used 1 instruction into the
         * successor */
        assert_eq!(
            ctx.next_use_distances_end[0].get(&x).copied(),
            Some((1, 1))
        );
        /* y is block-local, it does not appear at block 0's exit */
        assert!(!ctx.next_use_distances_end[0].contains_key(&y));
    }

    #[test]
    fn affine_spill_ids_share_a_slot() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        program.create_and_insert_block();
        let x = program.allocate_temp(RegClass::S2);
        let z = program.allocate_temp(RegClass::S2);

        let mut ctx = SpillCtx::new(256, 100, &mut program, Vec::new());

        /* a value stored under one id and reloaded under an affine one,
         * like a phi web; a third id is live across both */
        let id_store = ctx.allocate_spill_id(RegClass::S2);
        let id_load = ctx.allocate_spill_id(RegClass::S2);
        let id_other = ctx.allocate_spill_id(RegClass::S2);
        ctx.add_interference(id_store, id_other);
        ctx.add_interference(id_load, id_other);
        ctx.affinities.push((id_store, id_load));

        let x2 = ctx.program.allocate_temp(RegClass::S2);
        let z2 = ctx.program.allocate_temp(RegClass::S2);
        let spill_x = ctx.new_spill(Operand::of_temp(x), id_store);
        let reload_x = ctx.new_reload(id_load, x2);
        let spill_z = ctx.new_spill(Operand::of_temp(z), id_other);
        let reload_z = ctx.new_reload(id_other, z2);
        let endpgm =
            create_instruction(Opcode::SEndpgm, Format::SOPP, 0, 0);
        ctx.program.blocks[0].instructions =
            vec![spill_x, reload_x, spill_z, reload_z, endpgm];

        ctx.assign_spill_slots(10).unwrap();

        let block = &ctx.program.blocks[0];
        let slots: Vec<u32> = block
            .instructions
            .iter()
            .filter_map(|i| match i.opcode {
                Opcode::PSpill | Opcode::PReload => {
                    Some(i.operand(1).constant_value())
                }
                _ => None,
            })
            .collect();
        assert_eq!(slots.len(), 4);
        /* the affine pair shares one slot, the interfering id does not */
        assert_eq!(slots[0], slots[1]);
        assert_eq!(slots[2], slots[3]);
        assert_ne!(slots[0], slots[2]);

        /* four slot words fit in a single backing vgpr */
        let starts = block
            .instructions
            .iter()
            .filter(|i| i.opcode == Opcode::PStartLinearVgpr)
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn vgpr_slot_does_not_straddle_lane_boundary() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        program.create_and_insert_block();
        let mut ctx = SpillCtx::new(256, 100, &mut program, Vec::new());

        /* 63 pairwise-interfering scalar ids fill lanes 0..62; two wide
         * vector ids are live across all of them */
        let scalars: Vec<u32> = (0..63)
            .map(|_| ctx.allocate_spill_id(RegClass::S1))
            .collect();
        for &a in &scalars {
            for &b in &scalars {
                ctx.add_interference(a, b);
            }
        }
        let v = ctx.allocate_spill_id(RegClass::V2);
        let w = ctx.allocate_spill_id(RegClass::V2);
        for &s in &scalars {
            ctx.add_interference(s, v);
            ctx.add_interference(s, w);
        }
        ctx.add_interference(v, w);

        let (sgpr_slot, vgpr_slot, num_slots) = ctx.color_spill_slots();

        assert_eq!(sgpr_slot.len(), 63);
        let distinct: HashSet<u32> = sgpr_slot.values().copied().collect();
        assert_eq!(distinct.len(), 63);

        /* lane 63 is free, but a two-word slot there would cross into
         * the next backing vgpr: the first fit is lane 64 */
        assert_eq!(vgpr_slot[&v], 64);
        assert_eq!(vgpr_slot[&w], 66);
        assert!(num_slots > 64);
    }

    #[test]
    fn loop_nesting_penalty_applied() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        for _ in 0..4 {
            program.create_and_insert_block();
        }
        /* 0 -> 1 (header) <-> 2 (body), 2 -> 3 */
        link_blocks(&mut program, 0, 1);
        link_blocks(&mut program, 1, 2);
        link_blocks(&mut program, 2, 1);
        link_blocks(&mut program, 2, 3);
        program.blocks[1].loop_nest_depth = 1;
        program.blocks[2].loop_nest_depth = 1;

        let mut b = Builder::new(&mut program, 0);
        let x = b.vop1(Opcode::VMovB32, Operand::constant(1));
        b.branch(Opcode::SBranch, 1);
        let mut b = Builder::new(&mut program, 1);
        b.sopp(Opcode::SNop, 0);
        b.branch(Opcode::SBranch, 2);
        let mut b = Builder::new(&mut program, 2);
        b.branch(Opcode::SCbranchScc1, 1);
        let mut b = Builder::new(&mut program, 3);
        let z = b.vop1(Opcode::VMovB32, Operand::of_temp(x));
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

        compute_dominance(&mut program);
        let lives = live_var_analysis::<true>(&mut program);
        let demand = lives.register_demand.clone();
        let mut ctx = SpillCtx::new(256, 100, &mut program, demand);
        ctx.compute_global_next_uses();

        /* entering the loop costs at least one 0xFFFF penalty */
        let (_, dist) = ctx.next_use_distances_end[0].get(&x).copied().unwrap();
        assert!(dist >= 0xFFFF);
        /* the next use of x past the loop is dominated by the exit block */
        let (dom, _) = ctx.next_use_distances_end[2].get(&x).copied().unwrap();
        assert_eq!(dom, 3);
    }
}
