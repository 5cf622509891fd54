/*
 * Copyright © 2022 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

use crate::ir::*;

/// Walks two blocks up their idom chains until they meet.  Block order
/// is a reverse post-order, so the block with the higher index can never
/// dominate the other.
pub fn common_dominator(
    program: &Program,
    mut a: u32,
    mut b: u32,
    linear: bool,
) -> u32 {
    while a != b {
        let up = if a > b { &mut a } else { &mut b };
        let block = &program.blocks[*up as usize];
        *up = if linear {
            block.linear_idom
        } else {
            block.logical_idom
        };
    }
    a
}

/// Fills the immediate dominators of every block for both CFGs.  A
/// single forward pass suffices because the block order is a reverse
/// post-order over a structurized (reducible) graph: back-edge
/// predecessors can be ignored, they never lower the dominator.
pub fn compute_dominance(program: &mut Program) {
    for i in 0..program.blocks.len() as u32 {
        let logical_idom = idom_of(program, i, false);
        let linear_idom = idom_of(program, i, true);
        let block = &mut program.blocks[i as usize];
        block.logical_idom = logical_idom;
        block.linear_idom = linear_idom;
    }
}

fn idom_of(program: &Program, index: u32, linear: bool) -> u32 {
    let block = &program.blocks[index as usize];
    let preds = if linear {
        &block.linear_preds
    } else {
        &block.logical_preds
    };

    let mut idom = index;
    for &pred in preds {
        if pred >= index {
            continue;
        }
        if idom == index {
            idom = pred;
        } else {
            idom = common_dominator(program, idom, pred, linear);
        }
    }
    idom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::link_blocks;
    use crate::ChipClass;

    #[test]
    fn diamond_idoms() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        for _ in 0..4 {
            program.create_and_insert_block();
        }
        link_blocks(&mut program, 0, 1);
        link_blocks(&mut program, 0, 2);
        link_blocks(&mut program, 1, 3);
        link_blocks(&mut program, 2, 3);
        compute_dominance(&mut program);

        assert_eq!(program.blocks[1].linear_idom, 0);
        assert_eq!(program.blocks[2].linear_idom, 0);
        assert_eq!(program.blocks[3].linear_idom, 0);
        assert_eq!(program.blocks[3].logical_idom, 0);
        assert_eq!(common_dominator(&program, 1, 2, true), 0);
    }

    #[test]
    fn loop_back_edge_ignored() {
        let mut program = Program::new(ChipClass::VolcanicIslands);
        for _ in 0..4 {
            program.create_and_insert_block();
        }
        /* 0 -> 1 (header) -> 2 (body) -> 1, 2 -> 3 */
        link_blocks(&mut program, 0, 1);
        link_blocks(&mut program, 1, 2);
        link_blocks(&mut program, 2, 1);
        link_blocks(&mut program, 2, 3);
        compute_dominance(&mut program);

        assert_eq!(program.blocks[1].linear_idom, 0);
        assert_eq!(program.blocks[2].linear_idom, 1);
        assert_eq!(program.blocks[3].linear_idom, 2);
    }
}
