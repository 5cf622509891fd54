/*
 * Copyright © 2022 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

//! SSA back-end compiler for GCN/RDNA-family wavefront GPUs.
//!
//! The pipeline consumes a structurized, divergence-annotated SSA program
//! over two register banks and produces the 32-bit machine-word stream:
//! bool-phi lowering, live-variable analysis, SSA spilling, SSA register
//! allocation, assembly.  Instruction selection and the post-allocation
//! collaborators (pseudo elimination, scheduling, wait states) live
//! upstream and downstream of this crate.

pub mod asm;
pub mod builder;
pub mod dominance;
pub mod ir;
pub mod live;
pub mod lower_bool_phis;
pub mod regalloc;
pub mod spill;
pub mod validate;

use thiserror::Error;
use tracing::debug;

pub use crate::ir::Program;

/// Device generations this back-end knows the register-file parameters
/// for.  Only the scalar-file layout differs here.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ChipClass {
    Tahiti,
    SeaIslands,
    VolcanicIslands,
    Vega,
}

impl ChipClass {
    pub fn total_sgprs(self) -> u16 {
        if self >= ChipClass::VolcanicIslands {
            800
        } else {
            512
        }
    }

    pub fn max_addressable_sgpr(self) -> u16 {
        if self >= ChipClass::VolcanicIslands {
            102
        } else {
            104
        }
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(
        "register demand not representable: {sgpr} sgprs, {vgpr} vgprs"
    )]
    UnrepresentableDemand { sgpr: u16, vgpr: u16 },

    #[error("vgpr spilling is not supported")]
    VgprSpilling,

    #[error("invariant violation: {0}")]
    Validation(String),
}

/// Runs the back-end stages over a selected program and returns the
/// encoded instruction stream.  The caller packages the words together
/// with `program.config` into its binary record.
pub fn compile_program(
    program: &mut Program,
) -> Result<Vec<u32>, CompileError> {
    lower_bool_phis::lower_bool_phis(program);
    if cfg!(debug_assertions) {
        validate::validate(program)?;
    }

    let mut lives = live::live_var_analysis::<true>(program);
    spill::spill(program, &mut lives)?;
    if program.num_waves == 0 {
        return Err(CompileError::UnrepresentableDemand {
            sgpr: program.sgpr_demand,
            vgpr: program.vgpr_demand,
        });
    }
    if cfg!(debug_assertions) {
        validate::validate(program)?;
    }

    regalloc::register_allocation(program);
    if cfg!(debug_assertions) {
        validate::validate_ra(program)?;
    }

    let code = asm::emit_program(program);
    debug!(
        num_waves = program.num_waves,
        num_sgprs = program.config.num_sgprs,
        num_vgprs = program.config.num_vgprs,
        code_size = code.len(),
        "compiled program"
    );
    Ok(code)
}
