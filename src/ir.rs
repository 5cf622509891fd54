/*
 * Copyright © 2022 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

use crate::ChipClass;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegType {
    Scc,
    Sgpr,
    Vgpr,
}

/// Register class: type and size in 32-bit units, packed the way the
/// hardware thinks about it.  Bit 5 selects the vector file, bit 6 marks
/// wave-lifetime (linear) classes used for spill storage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RegClass(u8);

impl RegClass {
    pub const B: RegClass = RegClass(0);
    pub const S1: RegClass = RegClass(1);
    pub const S2: RegClass = RegClass(2);
    pub const S3: RegClass = RegClass(3);
    pub const S4: RegClass = RegClass(4);
    pub const S6: RegClass = RegClass(6);
    pub const S8: RegClass = RegClass(8);
    pub const S16: RegClass = RegClass(16);
    pub const V1: RegClass = RegClass(1 | (1 << 5));
    pub const V2: RegClass = RegClass(2 | (1 << 5));
    pub const V3: RegClass = RegClass(3 | (1 << 5));
    pub const V4: RegClass = RegClass(4 | (1 << 5));
    pub const V6: RegClass = RegClass(6 | (1 << 5));
    pub const V1_LINEAR: RegClass = RegClass(1 | (1 << 5) | (1 << 6));

    pub fn new(ty: RegType, size: u8) -> RegClass {
        match ty {
            RegType::Scc => RegClass::B,
            RegType::Sgpr => {
                assert!(size >= 1 && size <= 16);
                RegClass(size)
            }
            RegType::Vgpr => {
                assert!(size >= 1 && size <= 8);
                RegClass(size | (1 << 5))
            }
        }
    }

    pub fn ty(self) -> RegType {
        if self.0 == 0 {
            RegType::Scc
        } else if self.0 & (1 << 5) == 0 {
            RegType::Sgpr
        } else {
            RegType::Vgpr
        }
    }

    pub fn size(self) -> u16 {
        u16::from(self.0 & 0x1f)
    }

    /// Linear values live across the whole wave regardless of the exec
    /// mask.  All scalars are linear; vgprs only when explicitly marked.
    pub fn is_linear(self) -> bool {
        self.ty() != RegType::Vgpr || self.0 & (1 << 6) != 0
    }
}

impl fmt::Display for RegClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ty() {
            RegType::Scc => write!(f, "b"),
            RegType::Sgpr => write!(f, "s{}", self.size()),
            RegType::Vgpr => {
                write!(f, "v{}", self.size())?;
                if self.0 & (1 << 6) != 0 {
                    write!(f, "*")?;
                }
                Ok(())
            }
        }
    }
}

/// An SSA virtual register.  Identity is the id alone; id 0 is reserved
/// for "no temp".
#[derive(Clone, Copy, Debug)]
pub struct Temp {
    id: u32,
    rc: RegClass,
}

impl Temp {
    pub fn new(id: u32, rc: RegClass) -> Temp {
        Temp { id: id, rc: rc }
    }

    pub fn null() -> Temp {
        Temp::new(0, RegClass::B)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn rc(&self) -> RegClass {
        self.rc
    }

    pub fn ty(&self) -> RegType {
        self.rc.ty()
    }

    pub fn size(&self) -> u16 {
        self.rc.size()
    }

    pub fn is_linear(&self) -> bool {
        self.rc.is_linear()
    }

    pub fn is_null(&self) -> bool {
        self.id == 0
    }
}

impl PartialEq for Temp {
    fn eq(&self, other: &Temp) -> bool {
        self.id == other.id
    }
}

impl Eq for Temp {}

impl PartialOrd for Temp {
    fn partial_cmp(&self, other: &Temp) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Temp {
    fn cmp(&self, other: &Temp) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Temp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Temp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}:{}", self.id, self.rc)
    }
}

/// Flat physical register index.  0..103 scalar gprs, 106 VCC, 124 M0,
/// 126 EXEC, 128..255 inline constants (255 = literal follows),
/// 256..511 vector gprs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PhysReg(pub u16);

pub const VCC: PhysReg = PhysReg(106);
pub const M0: PhysReg = PhysReg(124);
pub const EXEC: PhysReg = PhysReg(126);
pub const SCC: PhysReg = PhysReg(253);

impl PhysReg {
    pub fn sgpr(idx: u16) -> PhysReg {
        PhysReg(idx)
    }

    pub fn vgpr(idx: u16) -> PhysReg {
        assert!(idx < 256);
        PhysReg(idx + 256)
    }

    pub fn reg(self) -> usize {
        usize::from(self.0)
    }

    pub fn is_vgpr(self) -> bool {
        self.0 >= 256
    }
}

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            106 => write!(f, "vcc"),
            124 => write!(f, "m0"),
            126 => write!(f, "exec"),
            253 => write!(f, "scc"),
            r if r >= 256 => write!(f, "v{}", r - 256),
            r if r >= 128 => write!(f, "#{}", r),
            r => write!(f, "s{}", r),
        }
    }
}

const OPERAND_IS_TEMP: u8 = 1 << 0;
const OPERAND_IS_FIXED: u8 = 1 << 1;
const OPERAND_IS_CONST: u8 = 1 << 2;
const OPERAND_IS_KILL: u8 = 1 << 3;
const OPERAND_IS_UNDEF: u8 = 1 << 4;

/// Either a temp reference, an inlined compile-time constant, or
/// Undefined.  Constants pick their inline-encoding register on
/// construction; everything the table cannot express becomes the
/// "literal follows" marker 255.
#[derive(Clone, Copy)]
pub struct Operand {
    temp: Temp,
    data: u32,
    reg: PhysReg,
    flags: u8,
}

impl Operand {
    pub fn of_temp(temp: Temp) -> Operand {
        Operand {
            temp: temp,
            data: 0,
            reg: PhysReg(0),
            flags: OPERAND_IS_TEMP,
        }
    }

    pub fn constant(v: u32) -> Operand {
        let reg = if v <= 64 {
            PhysReg(128 + v as u16)
        } else if v >= 0xFFFFFFF0 {
            /* [-16 .. -1] */
            PhysReg(192u32.wrapping_sub(v) as u16)
        } else {
            match v {
                0x3f000000 => PhysReg(240), /* 0.5 */
                0xbf000000 => PhysReg(241), /* -0.5 */
                0x3f800000 => PhysReg(242), /* 1.0 */
                0xbf800000 => PhysReg(243), /* -1.0 */
                0x40000000 => PhysReg(244), /* 2.0 */
                0xc0000000 => PhysReg(245), /* -2.0 */
                0x40800000 => PhysReg(246), /* 4.0 */
                0xc0800000 => PhysReg(247), /* -4.0 */
                0x3e22f983 => PhysReg(248), /* 1/(2*PI) */
                _ => PhysReg(255),          /* literal */
            }
        };
        Operand {
            temp: Temp::null(),
            data: v,
            reg: reg,
            flags: OPERAND_IS_CONST | OPERAND_IS_FIXED,
        }
    }

    pub fn undefined() -> Operand {
        Operand {
            temp: Temp::null(),
            data: 0,
            reg: PhysReg(128),
            flags: OPERAND_IS_UNDEF | OPERAND_IS_FIXED,
        }
    }

    /// A fixed reference to a hardware register (EXEC, VCC, M0, SCC)
    /// that flows through the IR without an SSA temp.
    pub fn fixed(reg: PhysReg, rc: RegClass) -> Operand {
        Operand {
            temp: Temp::new(0, rc),
            data: 0,
            reg: reg,
            flags: OPERAND_IS_TEMP | OPERAND_IS_FIXED,
        }
    }

    pub fn is_temp(&self) -> bool {
        self.flags & OPERAND_IS_TEMP != 0 && !self.temp.is_null()
    }

    pub fn set_temp(&mut self, t: Temp) {
        assert!(self.flags & OPERAND_IS_CONST == 0);
        self.flags |= OPERAND_IS_TEMP;
        self.temp = t;
    }

    pub fn temp(&self) -> Temp {
        self.temp
    }

    pub fn temp_id(&self) -> u32 {
        self.temp.id()
    }

    pub fn rc(&self) -> RegClass {
        self.temp.rc()
    }

    pub fn size(&self) -> u16 {
        if self.is_constant() || self.is_undefined() {
            1
        } else {
            self.temp.size()
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.flags & OPERAND_IS_FIXED != 0
    }

    pub fn phys_reg(&self) -> PhysReg {
        self.reg
    }

    pub fn set_fixed(&mut self, reg: PhysReg) {
        self.flags |= OPERAND_IS_FIXED;
        self.reg = reg;
    }

    pub fn is_constant(&self) -> bool {
        self.flags & OPERAND_IS_CONST != 0
    }

    pub fn is_literal(&self) -> bool {
        self.is_constant() && self.reg == PhysReg(255)
    }

    pub fn is_undefined(&self) -> bool {
        self.flags & OPERAND_IS_UNDEF != 0
    }

    pub fn constant_value(&self) -> u32 {
        self.data
    }

    pub fn set_kill(&mut self, kill: bool) {
        if kill {
            self.flags |= OPERAND_IS_KILL;
        } else {
            self.flags &= !OPERAND_IS_KILL;
        }
    }

    pub fn is_kill(&self) -> bool {
        self.flags & OPERAND_IS_KILL != 0
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            write!(f, "undef")
        } else if self.is_constant() {
            write!(f, "{:#x}", self.data)
        } else if self.temp.is_null() {
            write!(f, "{}", self.reg)
        } else if self.is_fixed() {
            write!(f, "{}({})", self.temp, self.reg)
        } else {
            write!(f, "{}", self.temp)
        }
    }
}

const DEF_IS_FIXED: u8 = 1 << 0;
const DEF_REUSE_INPUT: u8 = 1 << 1;
const DEF_HAS_HINT: u8 = 1 << 2;

/// The result slot of an instruction: an SSA temp, optionally fixed to a
/// physical register, optionally carrying a reuse-input constraint or a
/// non-binding hint.
#[derive(Clone, Copy)]
pub struct Definition {
    temp: Temp,
    reg: PhysReg,
    flags: u8,
}

impl Definition {
    pub fn new(id: u32, rc: RegClass) -> Definition {
        Definition::of_temp(Temp::new(id, rc))
    }

    pub fn of_temp(temp: Temp) -> Definition {
        Definition {
            temp: temp,
            reg: PhysReg(0),
            flags: 0,
        }
    }

    pub fn fixed(reg: PhysReg, rc: RegClass) -> Definition {
        Definition {
            temp: Temp::new(0, rc),
            reg: reg,
            flags: DEF_IS_FIXED,
        }
    }

    pub fn null() -> Definition {
        Definition::of_temp(Temp::null())
    }

    pub fn is_temp(&self) -> bool {
        self.temp.id() > 0
    }

    pub fn temp(&self) -> Temp {
        self.temp
    }

    pub fn temp_id(&self) -> u32 {
        self.temp.id()
    }

    pub fn set_temp(&mut self, t: Temp) {
        self.temp = t;
    }

    pub fn rc(&self) -> RegClass {
        self.temp.rc()
    }

    pub fn size(&self) -> u16 {
        self.temp.size()
    }

    pub fn is_fixed(&self) -> bool {
        self.flags & DEF_IS_FIXED != 0
    }

    pub fn phys_reg(&self) -> PhysReg {
        self.reg
    }

    pub fn set_fixed(&mut self, reg: PhysReg) {
        self.flags |= DEF_IS_FIXED;
        self.reg = reg;
    }

    pub fn must_reuse_input(&self) -> bool {
        self.flags & DEF_REUSE_INPUT != 0
    }

    pub fn set_reuse_input(&mut self, v: bool) {
        if v {
            self.flags |= DEF_REUSE_INPUT;
        } else {
            self.flags &= !DEF_REUSE_INPUT;
        }
    }

    pub fn set_hint(&mut self, reg: PhysReg) {
        self.flags |= DEF_HAS_HINT;
        self.reg = reg;
    }

    pub fn has_hint(&self) -> bool {
        self.flags & DEF_HAS_HINT != 0
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.temp.is_null() {
            write!(f, "{}", self.reg)
        } else if self.is_fixed() {
            write!(f, "{}({})", self.temp, self.reg)
        } else {
            write!(f, "{}", self.temp)
        }
    }
}

/// Microcode encoding format.  Base formats are exclusive; the vector
/// ALU flag formats can be OR-combined so that e.g. VOP2 | VOP3A is a
/// VOP2 instruction in its VOP3A encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Format(u16);

impl Format {
    pub const PSEUDO: Format = Format(0);
    pub const SOP1: Format = Format(1);
    pub const SOP2: Format = Format(2);
    pub const SOPK: Format = Format(3);
    pub const SOPP: Format = Format(4);
    pub const SOPC: Format = Format(5);
    pub const SMEM: Format = Format(6);
    pub const VINTRP: Format = Format(7);
    pub const DS: Format = Format(8);
    pub const MTBUF: Format = Format(9);
    pub const MUBUF: Format = Format(10);
    pub const MIMG: Format = Format(11);
    pub const EXP: Format = Format(12);
    pub const FLAT: Format = Format(13);
    pub const PSEUDO_BRANCH: Format = Format(16);

    pub const VOP1: Format = Format(1 << 8);
    pub const VOP2: Format = Format(1 << 9);
    pub const VOPC: Format = Format(1 << 10);
    pub const VOP3B: Format = Format(1 << 11);
    pub const VOP3P: Format = Format(1 << 12);
    pub const VOP3A: Format = Format(1 << 13);
    pub const DPP: Format = Format(1 << 14);
    pub const SDWA: Format = Format(1 << 15);

    pub fn combine(self, other: Format) -> Format {
        Format(self.0 | other.0)
    }

    /// Bit test, only meaningful for the flag formats above bit 8.
    pub fn has(self, flag: Format) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn without(self, flag: Format) -> Format {
        Format(self.0 & !flag.0)
    }

    /// The exclusive base format, if this is not a vector ALU format.
    pub fn base(self) -> Format {
        Format(self.0 & 0x1f)
    }

    pub fn is_pseudo(self) -> bool {
        self == Format::PSEUDO || self == Format::PSEUDO_BRANCH
    }

    pub fn is_valu(self) -> bool {
        self.0 & 0xff00 != 0
    }

    pub fn is_salu(self) -> bool {
        !self.is_valu()
            && matches!(
                self.base(),
                Format::SOP1
                    | Format::SOP2
                    | Format::SOPK
                    | Format::SOPP
                    | Format::SOPC
            )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Opcode {
    /* pseudo operations, consumed before assembly */
    PPhi,
    PLinearPhi,
    PParallelcopy,
    PSpill,
    PReload,
    PStartLinearVgpr,
    PEndLinearVgpr,
    PLogicalEnd,
    PSplitVector,
    PBranch,
    PCbranchZ,
    PCbranchNz,

    SMovB32,
    SMovB64,
    SCselectB64,
    SAndB64,
    SAndn2B64,
    SOrB64,
    SXorB64,
    SAddU32,
    SAddcU32,
    SCmpEqU32,
    SMovkI32,

    SNop,
    SEndpgm,
    SBranch,
    SCbranchScc0,
    SCbranchScc1,
    SCbranchVccz,
    SCbranchVccnz,
    SCbranchExecz,
    SCbranchExecnz,
    SWaitcnt,

    VMovB32,
    VCndmaskB32,
    VAddF32,
    VSubF32,
    VMulF32,
    VMacF32,
    VAddCoU32,
    VCmpLtF32,
    VCmpEqF32,
    VCmpEqU32,
    VInterpP1F32,
    VInterpP2F32,
    VInterpMovF32,

    Exp,
}

pub struct OpcodeInfo {
    pub name: &'static str,
    /// Hardware opcode number within the encoding family (GFX8).
    pub hw: u16,
}

impl Opcode {
    pub fn info(self) -> OpcodeInfo {
        let (name, hw): (&'static str, u16) = match self {
            Opcode::PPhi => ("p_phi", 0),
            Opcode::PLinearPhi => ("p_linear_phi", 0),
            Opcode::PParallelcopy => ("p_parallelcopy", 0),
            Opcode::PSpill => ("p_spill", 0),
            Opcode::PReload => ("p_reload", 0),
            Opcode::PStartLinearVgpr => ("p_start_linear_vgpr", 0),
            Opcode::PEndLinearVgpr => ("p_end_linear_vgpr", 0),
            Opcode::PLogicalEnd => ("p_logical_end", 0),
            Opcode::PSplitVector => ("p_split_vector", 0),
            Opcode::PBranch => ("p_branch", 0),
            Opcode::PCbranchZ => ("p_cbranch_z", 0),
            Opcode::PCbranchNz => ("p_cbranch_nz", 0),

            Opcode::SMovB32 => ("s_mov_b32", 0),
            Opcode::SMovB64 => ("s_mov_b64", 1),
            Opcode::SCselectB64 => ("s_cselect_b64", 11),
            Opcode::SAndB64 => ("s_and_b64", 13),
            Opcode::SAndn2B64 => ("s_andn2_b64", 19),
            Opcode::SOrB64 => ("s_or_b64", 15),
            Opcode::SXorB64 => ("s_xor_b64", 17),
            Opcode::SAddU32 => ("s_add_u32", 0),
            Opcode::SAddcU32 => ("s_addc_u32", 4),
            Opcode::SCmpEqU32 => ("s_cmp_eq_u32", 6),
            Opcode::SMovkI32 => ("s_movk_i32", 0),

            Opcode::SNop => ("s_nop", 0),
            Opcode::SEndpgm => ("s_endpgm", 1),
            Opcode::SBranch => ("s_branch", 2),
            Opcode::SCbranchScc0 => ("s_cbranch_scc0", 4),
            Opcode::SCbranchScc1 => ("s_cbranch_scc1", 5),
            Opcode::SCbranchVccz => ("s_cbranch_vccz", 6),
            Opcode::SCbranchVccnz => ("s_cbranch_vccnz", 7),
            Opcode::SCbranchExecz => ("s_cbranch_execz", 8),
            Opcode::SCbranchExecnz => ("s_cbranch_execnz", 9),
            Opcode::SWaitcnt => ("s_waitcnt", 12),

            Opcode::VMovB32 => ("v_mov_b32", 1),
            Opcode::VCndmaskB32 => ("v_cndmask_b32", 0),
            Opcode::VAddF32 => ("v_add_f32", 1),
            Opcode::VSubF32 => ("v_sub_f32", 2),
            Opcode::VMulF32 => ("v_mul_f32", 5),
            Opcode::VMacF32 => ("v_mac_f32", 22),
            Opcode::VAddCoU32 => ("v_add_co_u32", 25),
            Opcode::VCmpLtF32 => ("v_cmp_lt_f32", 0x41),
            Opcode::VCmpEqF32 => ("v_cmp_eq_f32", 0x42),
            Opcode::VCmpEqU32 => ("v_cmp_eq_u32", 0xca),
            Opcode::VInterpP1F32 => ("v_interp_p1_f32", 0),
            Opcode::VInterpP2F32 => ("v_interp_p2_f32", 1),
            Opcode::VInterpMovF32 => ("v_interp_mov_f32", 2),

            Opcode::Exp => ("exp", 0),
        };
        OpcodeInfo { name: name, hw: hw }
    }

    pub fn is_phi(self) -> bool {
        matches!(self, Opcode::PPhi | Opcode::PLinearPhi)
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::SBranch
                | Opcode::SCbranchScc0
                | Opcode::SCbranchScc1
                | Opcode::SCbranchVccz
                | Opcode::SCbranchVccnz
                | Opcode::SCbranchExecz
                | Opcode::SCbranchExecnz
                | Opcode::PBranch
                | Opcode::PCbranchZ
                | Opcode::PCbranchNz
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.info().name)
    }
}

/// Format-specific instruction payload.  The concrete variant is decided
/// by the format at creation time.
#[derive(Clone)]
pub enum InstrData {
    None,
    Sopk {
        imm: u16,
    },
    Sopp {
        imm: u16,
        /// Target block for branches; patched into the immediate by the
        /// assembler once block offsets are known.
        block: Option<u32>,
    },
    Smem {
        glc: bool,
        nv: bool,
    },
    Vop3a {
        abs: [bool; 3],
        opsel: [bool; 3],
        clamp: bool,
        omod: u8,
        neg: [bool; 3],
    },
    Dpp {
        dpp_ctrl: u16,
        row_mask: u8,
        bank_mask: u8,
        abs: [bool; 2],
        neg: [bool; 2],
        bound_ctrl: bool,
    },
    Vintrp {
        attribute: u8,
        component: u8,
    },
    Ds {
        offset0: i16,
        offset1: i8,
        gds: bool,
    },
    Mubuf {
        dfmt: u8,
        nfmt: u8,
        offset: u16,
        offen: bool,
        idxen: bool,
        glc: bool,
        slc: bool,
        tfe: bool,
        lds: bool,
    },
    Exp {
        enabled_mask: u8,
        dest: u8,
        compressed: bool,
        done: bool,
        valid_mask: bool,
    },
    Branch {
        target: Option<u32>,
    },
}

impl InstrData {
    fn for_format(format: Format) -> InstrData {
        if format.has(Format::DPP) {
            InstrData::Dpp {
                dpp_ctrl: 0,
                row_mask: 0xf,
                bank_mask: 0xf,
                abs: [false; 2],
                neg: [false; 2],
                bound_ctrl: false,
            }
        } else if format.has(Format::VOP3A) || format.has(Format::VOP3B) {
            InstrData::Vop3a {
                abs: [false; 3],
                opsel: [false; 3],
                clamp: false,
                omod: 0,
                neg: [false; 3],
            }
        } else if format.is_valu() {
            InstrData::None
        } else {
            match format.base() {
                Format::SOPK => InstrData::Sopk { imm: 0 },
                Format::SOPP => InstrData::Sopp {
                    imm: 0,
                    block: None,
                },
                Format::SMEM => InstrData::Smem {
                    glc: false,
                    nv: false,
                },
                Format::VINTRP => InstrData::Vintrp {
                    attribute: 0,
                    component: 0,
                },
                Format::DS => InstrData::Ds {
                    offset0: 0,
                    offset1: 0,
                    gds: false,
                },
                Format::MUBUF => InstrData::Mubuf {
                    dfmt: 0,
                    nfmt: 0,
                    offset: 0,
                    offen: false,
                    idxen: false,
                    glc: false,
                    slc: false,
                    tfe: false,
                    lds: false,
                },
                Format::EXP => InstrData::Exp {
                    enabled_mask: 0,
                    dest: 0,
                    compressed: false,
                    done: false,
                    valid_mask: false,
                },
                Format::PSEUDO_BRANCH => InstrData::Branch { target: None },
                _ => InstrData::None,
            }
        }
    }
}

/// Operand/definition storage sized at creation time: small arrays live
/// inline in the instruction, larger ones spill to the heap.
#[derive(Clone)]
enum RefArr<T: Copy, const N: usize> {
    Inline { len: u8, arr: [T; N] },
    Heap(Vec<T>),
}

impl<T: Copy, const N: usize> RefArr<T, N> {
    fn new(count: usize, fill: T) -> RefArr<T, N> {
        if count <= N {
            RefArr::Inline {
                len: count as u8,
                arr: [fill; N],
            }
        } else {
            RefArr::Heap(vec![fill; count])
        }
    }

    fn as_slice(&self) -> &[T] {
        match self {
            RefArr::Inline { len, arr } => &arr[..usize::from(*len)],
            RefArr::Heap(v) => v,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        match self {
            RefArr::Inline { len, arr } => &mut arr[..usize::from(*len)],
            RefArr::Heap(v) => v,
        }
    }
}

#[derive(Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub format: Format,
    operands: RefArr<Operand, 4>,
    definitions: RefArr<Definition, 2>,
    pub data: InstrData,
}

/// The instruction factory.  Operand and definition slots come back
/// default-initialized to Undefined / the null temp; the caller fills
/// them in.
pub fn create_instruction(
    opcode: Opcode,
    format: Format,
    num_operands: usize,
    num_definitions: usize,
) -> Instruction {
    Instruction {
        opcode: opcode,
        format: format,
        operands: RefArr::new(num_operands, Operand::undefined()),
        definitions: RefArr::new(num_definitions, Definition::null()),
        data: InstrData::for_format(format),
    }
}

impl Instruction {
    pub fn operands(&self) -> &[Operand] {
        self.operands.as_slice()
    }

    pub fn operands_mut(&mut self) -> &mut [Operand] {
        self.operands.as_mut_slice()
    }

    pub fn operand(&self, idx: usize) -> &Operand {
        &self.operands.as_slice()[idx]
    }

    pub fn operand_mut(&mut self, idx: usize) -> &mut Operand {
        &mut self.operands.as_mut_slice()[idx]
    }

    pub fn definitions(&self) -> &[Definition] {
        self.definitions.as_slice()
    }

    pub fn definitions_mut(&mut self) -> &mut [Definition] {
        self.definitions.as_mut_slice()
    }

    pub fn definition(&self, idx: usize) -> &Definition {
        &self.definitions.as_slice()[idx]
    }

    pub fn definition_mut(&mut self, idx: usize) -> &mut Definition {
        &mut self.definitions.as_mut_slice()[idx]
    }

    pub fn num_operands(&self) -> usize {
        self.operands.as_slice().len()
    }

    pub fn num_definitions(&self) -> usize {
        self.definitions.as_slice().len()
    }

    pub fn is_phi(&self) -> bool {
        self.opcode.is_phi()
    }

    /// A block terminator: either a branch pseudo-op or a SOPP branch
    /// carrying a target block.
    pub fn is_branch(&self) -> bool {
        if self.format == Format::PSEUDO_BRANCH {
            return true;
        }
        match &self.data {
            InstrData::Sopp { block, .. } => block.is_some(),
            _ => self.opcode.is_branch(),
        }
    }

    pub fn branch_target(&self) -> Option<u32> {
        match &self.data {
            InstrData::Sopp { block, .. } => *block,
            InstrData::Branch { target } => *target,
            _ => None,
        }
    }

    pub fn set_branch_target(&mut self, idx: u32) {
        match &mut self.data {
            InstrData::Sopp { block, .. } => *block = Some(idx),
            InstrData::Branch { target } => *target = Some(idx),
            _ => panic!("Not a branch instruction"),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        for (i, def) in self.definitions().iter().enumerate() {
            write!(f, "{} {}", if i == 0 { "" } else { "," }, def)?;
        }
        if self.num_definitions() > 0 {
            write!(f, " =")?;
        }
        for (i, op) in self.operands().iter().enumerate() {
            write!(f, "{} {}", if i == 0 { "" } else { "," }, op)?;
        }
        Ok(())
    }
}

/// A basic block.  Inter-block references are indices into the program's
/// block vector; logical edges carry the source-language control flow,
/// linear edges additionally the edges synthesized by if-conversion.
pub struct Block {
    pub index: u32,
    pub instructions: Vec<Instruction>,
    pub logical_preds: Vec<u32>,
    pub linear_preds: Vec<u32>,
    pub logical_succs: Vec<u32>,
    pub linear_succs: Vec<u32>,
    pub loop_nest_depth: u32,
    pub logical_idom: u32,
    pub linear_idom: u32,
    pub sgpr_demand: u16,
    pub vgpr_demand: u16,
}

impl Block {
    fn new(index: u32) -> Block {
        Block {
            index: index,
            instructions: Vec::new(),
            logical_preds: Vec::new(),
            linear_preds: Vec::new(),
            logical_succs: Vec::new(),
            linear_succs: Vec::new(),
            loop_nest_depth: 0,
            logical_idom: index,
            linear_idom: index,
            sgpr_demand: 0,
            vgpr_demand: 0,
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "BB{}:", self.index)?;
        for instr in &self.instructions {
            writeln!(f, "    {}", instr)?;
        }
        Ok(())
    }
}

/// Resource usage the allocator reports back to the driver.
#[derive(Clone, Copy, Default)]
pub struct ProgramConfig {
    pub num_sgprs: u16,
    pub num_vgprs: u16,
}

pub struct Program {
    pub blocks: Vec<Block>,
    pub chip_class: ChipClass,
    pub sgpr_demand: u16,
    pub vgpr_demand: u16,
    pub max_sgpr: u16,
    pub max_vgpr: u16,
    pub num_waves: u16,
    pub config: ProgramConfig,
    allocation_id: u32,
}

impl Program {
    pub fn new(chip_class: ChipClass) -> Program {
        Program {
            blocks: Vec::new(),
            chip_class: chip_class,
            sgpr_demand: 0,
            vgpr_demand: 0,
            max_sgpr: 0,
            max_vgpr: 0,
            num_waves: 0,
            config: ProgramConfig::default(),
            allocation_id: 1,
        }
    }

    pub fn allocate_id(&mut self) -> u32 {
        let id = self.allocation_id;
        self.allocation_id += 1;
        id
    }

    pub fn allocate_temp(&mut self, rc: RegClass) -> Temp {
        let id = self.allocate_id();
        Temp::new(id, rc)
    }

    pub fn peek_id(&self) -> u32 {
        self.allocation_id
    }

    pub fn create_and_insert_block(&mut self) -> u32 {
        let index = self.blocks.len() as u32;
        self.blocks.push(Block::new(index));
        index
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            write!(f, "{}", block)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_class_packing() {
        assert_eq!(RegClass::S2.size(), 2);
        assert_eq!(RegClass::S2.ty(), RegType::Sgpr);
        assert_eq!(RegClass::V4.size(), 4);
        assert_eq!(RegClass::V4.ty(), RegType::Vgpr);
        assert_eq!(RegClass::B.size(), 0);
        assert!(RegClass::S1.is_linear());
        assert!(!RegClass::V1.is_linear());
        assert!(RegClass::V1_LINEAR.is_linear());
        assert_eq!(RegClass::V1_LINEAR.size(), 1);
    }

    #[test]
    fn constant_operands_inline_encode() {
        assert_eq!(Operand::constant(0).phys_reg(), PhysReg(128));
        assert_eq!(Operand::constant(64).phys_reg(), PhysReg(192));
        assert_eq!(Operand::constant(0xFFFFFFFF).phys_reg(), PhysReg(193));
        assert_eq!(Operand::constant(0xFFFFFFF0).phys_reg(), PhysReg(208));
        assert_eq!(Operand::constant(0x3f800000).phys_reg(), PhysReg(242));
        let lit = Operand::constant(0x12345678);
        assert!(lit.is_literal());
        assert_eq!(lit.constant_value(), 0x12345678);
    }

    #[test]
    fn instruction_factory_defaults() {
        let instr =
            create_instruction(Opcode::SAndB64, Format::SOP2, 2, 2);
        assert_eq!(instr.num_operands(), 2);
        assert_eq!(instr.num_definitions(), 2);
        assert!(instr.operand(0).is_undefined());
        assert!(!instr.definition(0).is_temp());

        /* more slots than fit inline */
        let phi = create_instruction(Opcode::PPhi, Format::PSEUDO, 6, 1);
        assert_eq!(phi.num_operands(), 6);
        assert!(phi.operand(5).is_undefined());
    }

    #[test]
    fn format_combining() {
        let f = Format::VOP2.combine(Format::VOP3A);
        assert!(f.has(Format::VOP2));
        assert!(f.has(Format::VOP3A));
        assert!(f.is_valu());
        assert!(!Format::SOP2.is_valu());
        assert!(Format::SOP2.is_salu());
        assert_eq!(f.without(Format::VOP3A), Format::VOP2);
    }
}
