//! Instruction set of the modeled compute device.
//!
//! A subset of the Southern Islands ISA: enough scalar ALU to manipulate the
//! `exec`/`vcc` masks, per-lane vector ALU and compares, program control,
//! barriers, and local/global memory accesses.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Instruction opcodes.
#[derive(
    strum::AsRefStr,
    strum::IntoStaticStr,
    strum::EnumIter,
    Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord,
)]
#[strum(serialize_all = "lowercase")]
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
pub enum Op {
    // scalar alu
    S_MOV_B32,
    S_MOV_B64,
    S_MOVK_I32,
    S_ADD_I32,
    S_SUB_I32,
    S_AND_B64,
    S_ANDN2_B64,
    S_OR_B64,
    S_XOR_B64,
    S_NOT_B64,
    S_AND_SAVEEXEC_B64,
    S_CMP_EQ_I32,
    S_CMP_LG_I32,
    S_CMP_LT_I32,
    S_CMP_LE_I32,
    S_CMP_GT_I32,
    S_CMP_GE_I32,
    // program control
    S_BRANCH,
    S_CBRANCH_EXECZ,
    S_CBRANCH_EXECNZ,
    S_CBRANCH_VCCZ,
    S_CBRANCH_VCCNZ,
    S_CBRANCH_SCC0,
    S_CBRANCH_SCC1,
    S_BARRIER,
    S_WAITCNT,
    S_ENDPGM,
    // vector alu
    V_MOV_B32,
    V_ADD_I32,
    V_SUB_I32,
    V_MUL_LO_I32,
    V_AND_B32,
    V_OR_B32,
    V_LSHLREV_B32,
    V_CNDMASK_B32,
    V_READFIRSTLANE_B32,
    V_CMP_EQ_I32,
    V_CMP_NE_I32,
    V_CMP_LT_I32,
    V_CMP_LE_I32,
    V_CMP_GT_I32,
    V_CMP_GE_I32,
    // memory
    DS_READ_B32,
    DS_WRITE_B32,
    GLOBAL_LOAD_DWORD,
    GLOBAL_STORE_DWORD,
}

/// Encoding format of an instruction.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Format {
    SOP1,
    SOP2,
    SOPK,
    SOPC,
    SOPP,
    VOP1,
    VOP2,
    VOP3,
    VOPC,
    DS,
    GLOBAL,
}

/// Which part of the wavefront executes an instruction.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Unit {
    /// Executed once per wavefront.
    Scalar,
    /// Executed once per active lane.
    Vector,
    Branch,
    Barrier,
    EndProgram,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Opcode {
    pub op: Op,
    pub format: Format,
}

impl Opcode {
    #[must_use]
    pub fn unit(&self) -> Unit {
        match self.op {
            Op::S_BRANCH
            | Op::S_CBRANCH_EXECZ
            | Op::S_CBRANCH_EXECNZ
            | Op::S_CBRANCH_VCCZ
            | Op::S_CBRANCH_VCCNZ
            | Op::S_CBRANCH_SCC0
            | Op::S_CBRANCH_SCC1 => Unit::Branch,
            Op::S_BARRIER => Unit::Barrier,
            Op::S_ENDPGM => Unit::EndProgram,
            _ => match self.format {
                Format::SOP1 | Format::SOP2 | Format::SOPK | Format::SOPC | Format::SOPP => {
                    Unit::Scalar
                }
                Format::VOP1
                | Format::VOP2
                | Format::VOP3
                | Format::VOPC
                | Format::DS
                | Format::GLOBAL => Unit::Vector,
            },
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.op, f)
    }
}

pub type OpcodeMap = phf::Map<&'static str, Opcode>;

pub static OPCODES: OpcodeMap = phf::phf_map! {
    "s_mov_b32" => Opcode { op: Op::S_MOV_B32, format: Format::SOP1 },
    "s_mov_b64" => Opcode { op: Op::S_MOV_B64, format: Format::SOP1 },
    "s_movk_i32" => Opcode { op: Op::S_MOVK_I32, format: Format::SOPK },
    "s_add_i32" => Opcode { op: Op::S_ADD_I32, format: Format::SOP2 },
    "s_sub_i32" => Opcode { op: Op::S_SUB_I32, format: Format::SOP2 },
    "s_and_b64" => Opcode { op: Op::S_AND_B64, format: Format::SOP2 },
    "s_andn2_b64" => Opcode { op: Op::S_ANDN2_B64, format: Format::SOP2 },
    "s_or_b64" => Opcode { op: Op::S_OR_B64, format: Format::SOP2 },
    "s_xor_b64" => Opcode { op: Op::S_XOR_B64, format: Format::SOP2 },
    "s_not_b64" => Opcode { op: Op::S_NOT_B64, format: Format::SOP1 },
    "s_and_saveexec_b64" => Opcode { op: Op::S_AND_SAVEEXEC_B64, format: Format::SOP1 },
    "s_cmp_eq_i32" => Opcode { op: Op::S_CMP_EQ_I32, format: Format::SOPC },
    "s_cmp_lg_i32" => Opcode { op: Op::S_CMP_LG_I32, format: Format::SOPC },
    "s_cmp_lt_i32" => Opcode { op: Op::S_CMP_LT_I32, format: Format::SOPC },
    "s_cmp_le_i32" => Opcode { op: Op::S_CMP_LE_I32, format: Format::SOPC },
    "s_cmp_gt_i32" => Opcode { op: Op::S_CMP_GT_I32, format: Format::SOPC },
    "s_cmp_ge_i32" => Opcode { op: Op::S_CMP_GE_I32, format: Format::SOPC },
    "s_branch" => Opcode { op: Op::S_BRANCH, format: Format::SOPP },
    "s_cbranch_execz" => Opcode { op: Op::S_CBRANCH_EXECZ, format: Format::SOPP },
    "s_cbranch_execnz" => Opcode { op: Op::S_CBRANCH_EXECNZ, format: Format::SOPP },
    "s_cbranch_vccz" => Opcode { op: Op::S_CBRANCH_VCCZ, format: Format::SOPP },
    "s_cbranch_vccnz" => Opcode { op: Op::S_CBRANCH_VCCNZ, format: Format::SOPP },
    "s_cbranch_scc0" => Opcode { op: Op::S_CBRANCH_SCC0, format: Format::SOPP },
    "s_cbranch_scc1" => Opcode { op: Op::S_CBRANCH_SCC1, format: Format::SOPP },
    "s_barrier" => Opcode { op: Op::S_BARRIER, format: Format::SOPP },
    "s_waitcnt" => Opcode { op: Op::S_WAITCNT, format: Format::SOPP },
    "s_endpgm" => Opcode { op: Op::S_ENDPGM, format: Format::SOPP },
    "v_mov_b32" => Opcode { op: Op::V_MOV_B32, format: Format::VOP1 },
    "v_add_i32" => Opcode { op: Op::V_ADD_I32, format: Format::VOP2 },
    "v_sub_i32" => Opcode { op: Op::V_SUB_I32, format: Format::VOP2 },
    "v_mul_lo_i32" => Opcode { op: Op::V_MUL_LO_I32, format: Format::VOP3 },
    "v_and_b32" => Opcode { op: Op::V_AND_B32, format: Format::VOP2 },
    "v_or_b32" => Opcode { op: Op::V_OR_B32, format: Format::VOP2 },
    "v_lshlrev_b32" => Opcode { op: Op::V_LSHLREV_B32, format: Format::VOP2 },
    "v_cndmask_b32" => Opcode { op: Op::V_CNDMASK_B32, format: Format::VOP2 },
    "v_readfirstlane_b32" => Opcode { op: Op::V_READFIRSTLANE_B32, format: Format::VOP1 },
    "v_cmp_eq_i32" => Opcode { op: Op::V_CMP_EQ_I32, format: Format::VOPC },
    "v_cmp_ne_i32" => Opcode { op: Op::V_CMP_NE_I32, format: Format::VOPC },
    "v_cmp_lt_i32" => Opcode { op: Op::V_CMP_LT_I32, format: Format::VOPC },
    "v_cmp_le_i32" => Opcode { op: Op::V_CMP_LE_I32, format: Format::VOPC },
    "v_cmp_gt_i32" => Opcode { op: Op::V_CMP_GT_I32, format: Format::VOPC },
    "v_cmp_ge_i32" => Opcode { op: Op::V_CMP_GE_I32, format: Format::VOPC },
    "ds_read_b32" => Opcode { op: Op::DS_READ_B32, format: Format::DS },
    "ds_write_b32" => Opcode { op: Op::DS_WRITE_B32, format: Format::DS },
    "global_load_dword" => Opcode { op: Op::GLOBAL_LOAD_DWORD, format: Format::GLOBAL },
    "global_store_dword" => Opcode { op: Op::GLOBAL_STORE_DWORD, format: Format::GLOBAL },
};

impl Op {
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        self.into()
    }

    pub fn opcode(self) -> Result<Opcode, DecodeError> {
        OPCODES
            .get(self.as_ref())
            .copied()
            .ok_or_else(|| DecodeError::UnknownMnemonic(self.as_ref().to_string()))
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown mnemonic {0:?}")]
    UnknownMnemonic(String),
    #[error("invalid operand {0:?}")]
    InvalidOperand(String),
    #[error("{op}: expected {expected} operands, got {got}")]
    OperandCount {
        op: Op,
        expected: &'static str,
        got: usize,
    },
    #[error("{op}: operand {index} ({operand}) must be {expected}")]
    OperandKind {
        op: Op,
        index: usize,
        operand: Operand,
        expected: &'static str,
    },
    #[error("{op}: unresolved label {label:?}")]
    UnresolvedLabel { op: Op, label: String },
    #[error("literal {0} does not fit into 32 bits")]
    LiteralRange(i64),
}

/// An instruction operand as written in assembly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Scalar register `sN`.
    Sreg(u16),
    /// Aligned scalar register pair `s[N:N+1]`.
    SregPair(u16),
    /// Active-lane mask.
    Exec,
    /// Comparison mask.
    Vcc,
    Scc,
    /// Vector register `vN`.
    Vreg(u16),
    Literal(i64),
    /// Symbolic branch target, resolved when the program is linked.
    Label(String),
    /// Resolved branch target (instruction index).
    Target(usize),
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sreg(idx) => write!(f, "s{idx}"),
            Self::SregPair(idx) => write!(f, "s[{}:{}]", idx, idx + 1),
            Self::Exec => write!(f, "exec"),
            Self::Vcc => write!(f, "vcc"),
            Self::Scc => write!(f, "scc"),
            Self::Vreg(idx) => write!(f, "v{idx}"),
            Self::Literal(value) if *value > 0xFFFF => write!(f, "{value:#x}"),
            Self::Literal(value) => write!(f, "{value}"),
            Self::Label(label) => write!(f, "{label}"),
            Self::Target(pc) => write!(f, "@{pc}"),
        }
    }
}

static OPERAND_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)^(?:
            s(?P<sreg>\d+)
            | s\[(?P<lo>\d+):(?P<hi>\d+)\]
            | v(?P<vreg>\d+)
            | @(?P<target>\d+)
            | (?P<lit>-?(?:0x[0-9a-fA-F]+|\d+))
            | (?P<label>[A-Za-z_.][A-Za-z0-9_.]*)
        )$",
    )
    .unwrap()
});

impl std::str::FromStr for Operand {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let invalid = || DecodeError::InvalidOperand(value.to_string());
        match value {
            "exec" => return Ok(Self::Exec),
            "vcc" => return Ok(Self::Vcc),
            "scc" => return Ok(Self::Scc),
            _ => {}
        }
        let captures = OPERAND_REGEX.captures(value).ok_or_else(invalid)?;
        let index = |name: &str| -> Result<Option<u16>, DecodeError> {
            captures
                .name(name)
                .map(|m| m.as_str().parse::<u16>().map_err(|_| invalid()))
                .transpose()
        };
        if let Some(idx) = index("sreg")? {
            return Ok(Self::Sreg(idx));
        }
        if let (Some(lo), Some(hi)) = (index("lo")?, index("hi")?) {
            if lo % 2 != 0 || hi != lo + 1 {
                return Err(invalid());
            }
            return Ok(Self::SregPair(lo));
        }
        if let Some(idx) = index("vreg")? {
            return Ok(Self::Vreg(idx));
        }
        if let Some(target) = captures.name("target") {
            return target.as_str().parse().map(Self::Target).map_err(|_| invalid());
        }
        if let Some(lit) = captures.name("lit") {
            let lit = lit.as_str();
            let (negative, digits) = match lit.strip_prefix('-') {
                Some(digits) => (true, digits),
                None => (false, lit),
            };
            let magnitude = match digits.strip_prefix("0x") {
                Some(hex) => i64::from_str_radix(hex, 16),
                None => digits.parse::<i64>(),
            }
            .map_err(|_| invalid())?;
            return Ok(Self::Literal(if negative { -magnitude } else { magnitude }));
        }
        if let Some(label) = captures.name("label") {
            return Ok(Self::Label(label.as_str().to_string()));
        }
        Err(invalid())
    }
}

/// A 32-bit scalar source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar32 {
    Reg(u16),
    Literal(u32),
}

/// A 64-bit scalar source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar64 {
    Pair(u16),
    Exec,
    Vcc,
    Literal(u64),
}

/// A 64-bit scalar destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dst64 {
    Pair(u16),
    Exec,
    Vcc,
}

/// A per-lane 32-bit source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vector32 {
    Vreg(u16),
    /// Uniform scalar value broadcast to all lanes.
    Sreg(u16),
    Literal(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    #[must_use]
    pub fn eval(self, a: i32, b: i32) -> bool {
        match self {
            Self::Eq => a == b,
            Self::Ne => a != b,
            Self::Lt => a < b,
            Self::Le => a <= b,
            Self::Gt => a > b,
            Self::Ge => a >= b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarAlu {
    Add,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    And,
    AndN2,
    Or,
    Xor,
}

impl BitOp {
    #[must_use]
    pub fn eval(self, a: u64, b: u64) -> u64 {
        match self {
            Self::And => a & b,
            Self::AndN2 => a & !b,
            Self::Or => a | b,
            Self::Xor => a ^ b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorAlu {
    Add,
    Sub,
    MulLo,
    And,
    Or,
    LshlRev,
}

impl VectorAlu {
    #[must_use]
    pub fn eval(self, a: u32, b: u32) -> u32 {
        match self {
            Self::Add => a.wrapping_add(b),
            Self::Sub => a.wrapping_sub(b),
            Self::MulLo => a.wrapping_mul(b),
            Self::And => a & b,
            Self::Or => a | b,
            Self::LshlRev => b.wrapping_shl(a & 31),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCond {
    ExecZ,
    ExecNz,
    VccZ,
    VccNz,
    Scc0,
    Scc1,
}

/// An instruction with typed, validated operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    SMov { dst: u16, src: Scalar32 },
    SMov64 { dst: Dst64, src: Scalar64 },
    SAlu { op: ScalarAlu, dst: u16, a: Scalar32, b: Scalar32 },
    SBitOp64 { op: BitOp, dst: Dst64, a: Scalar64, b: Scalar64 },
    SNot64 { dst: Dst64, src: Scalar64 },
    /// `dst = exec; exec = src & exec`
    SAndSaveExec { dst: Dst64, src: Scalar64 },
    SCmp { cmp: Cmp, a: Scalar32, b: Scalar32 },
    Branch { target: usize },
    CBranch { cond: BranchCond, target: usize },
    Barrier,
    WaitCnt,
    EndPgm,
    VMov { dst: u16, src: Vector32 },
    VAlu { op: VectorAlu, dst: u16, a: Vector32, b: Vector32 },
    /// `dst = mask[lane] ? b : a`
    VCndMask { dst: u16, a: Vector32, b: Vector32, mask: Scalar64 },
    VCmp { cmp: Cmp, dst: Dst64, a: Vector32, b: Vector32 },
    VReadFirstLane { dst: u16, src: u16 },
    DsRead { dst: u16, addr: u16 },
    DsWrite { addr: u16, data: u16 },
    GlobalLoad { dst: u16, addr: u16 },
    GlobalStore { addr: u16, data: u16 },
}

/// A single instruction of a basic block or program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: SmallVec<[Operand; 4]>,
    /// Set on mask manipulation emitted for control flow.
    ///
    /// Such instructions must not be reordered or eliminated by later passes.
    pub control_flow: bool,
}

impl Instruction {
    pub fn new(op: Op, operands: impl IntoIterator<Item = Operand>) -> Result<Self, DecodeError> {
        Ok(Self {
            opcode: op.opcode()?,
            operands: operands.into_iter().collect(),
            control_flow: false,
        })
    }

    #[must_use]
    pub fn with_control_flow(mut self) -> Self {
        self.control_flow = true;
        self
    }

    #[must_use]
    pub fn op(&self) -> Op {
        self.opcode.op
    }

    #[must_use]
    pub fn unit(&self) -> Unit {
        self.opcode.unit()
    }

    /// One past the highest scalar register named by an operand.
    #[must_use]
    pub fn sreg_end(&self) -> Option<u16> {
        self.operands
            .iter()
            .filter_map(|operand| match operand {
                Operand::Sreg(idx) => Some(idx.saturating_add(1)),
                Operand::SregPair(idx) => Some(idx.saturating_add(2)),
                _ => None,
            })
            .max()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> + '_ {
        self.operands.iter().filter_map(|operand| match operand {
            Operand::Label(label) => Some(label.as_str()),
            _ => None,
        })
    }

    /// Decode the operands into their typed form.
    ///
    /// Fails if the operand list does not match the shape the opcode requires,
    /// or if a branch target has not been resolved yet.
    pub fn decode(&self) -> Result<Decoded, DecodeError> {
        let ops = Operands {
            op: self.op(),
            operands: &self.operands,
        };
        let decoded = match self.op() {
            Op::S_MOV_B32 => {
                ops.count(2, "2")?;
                Decoded::SMov {
                    dst: ops.sreg(0)?,
                    src: ops.scalar32(1)?,
                }
            }
            Op::S_MOVK_I32 => {
                ops.count(2, "2")?;
                let imm = ops.literal(1)?;
                let imm = i16::try_from(imm).map_err(|_| DecodeError::LiteralRange(imm))?;
                Decoded::SMov {
                    dst: ops.sreg(0)?,
                    src: Scalar32::Literal(i32::from(imm) as u32),
                }
            }
            Op::S_MOV_B64 => {
                ops.count(2, "2")?;
                Decoded::SMov64 {
                    dst: ops.dst64(0)?,
                    src: ops.scalar64(1)?,
                }
            }
            Op::S_ADD_I32 | Op::S_SUB_I32 => {
                ops.count(3, "3")?;
                Decoded::SAlu {
                    op: if self.op() == Op::S_ADD_I32 {
                        ScalarAlu::Add
                    } else {
                        ScalarAlu::Sub
                    },
                    dst: ops.sreg(0)?,
                    a: ops.scalar32(1)?,
                    b: ops.scalar32(2)?,
                }
            }
            Op::S_AND_B64 | Op::S_ANDN2_B64 | Op::S_OR_B64 | Op::S_XOR_B64 => {
                ops.count(3, "3")?;
                let op = match self.op() {
                    Op::S_AND_B64 => BitOp::And,
                    Op::S_ANDN2_B64 => BitOp::AndN2,
                    Op::S_OR_B64 => BitOp::Or,
                    _ => BitOp::Xor,
                };
                Decoded::SBitOp64 {
                    op,
                    dst: ops.dst64(0)?,
                    a: ops.scalar64(1)?,
                    b: ops.scalar64(2)?,
                }
            }
            Op::S_NOT_B64 => {
                ops.count(2, "2")?;
                Decoded::SNot64 {
                    dst: ops.dst64(0)?,
                    src: ops.scalar64(1)?,
                }
            }
            Op::S_AND_SAVEEXEC_B64 => {
                ops.count(2, "2")?;
                Decoded::SAndSaveExec {
                    dst: ops.dst64(0)?,
                    src: ops.scalar64(1)?,
                }
            }
            Op::S_CMP_EQ_I32
            | Op::S_CMP_LG_I32
            | Op::S_CMP_LT_I32
            | Op::S_CMP_LE_I32
            | Op::S_CMP_GT_I32
            | Op::S_CMP_GE_I32 => {
                ops.count(2, "2")?;
                let cmp = match self.op() {
                    Op::S_CMP_EQ_I32 => Cmp::Eq,
                    Op::S_CMP_LG_I32 => Cmp::Ne,
                    Op::S_CMP_LT_I32 => Cmp::Lt,
                    Op::S_CMP_LE_I32 => Cmp::Le,
                    Op::S_CMP_GT_I32 => Cmp::Gt,
                    _ => Cmp::Ge,
                };
                Decoded::SCmp {
                    cmp,
                    a: ops.scalar32(0)?,
                    b: ops.scalar32(1)?,
                }
            }
            Op::S_BRANCH => {
                ops.count(1, "1")?;
                Decoded::Branch {
                    target: ops.target(0)?,
                }
            }
            Op::S_CBRANCH_EXECZ
            | Op::S_CBRANCH_EXECNZ
            | Op::S_CBRANCH_VCCZ
            | Op::S_CBRANCH_VCCNZ
            | Op::S_CBRANCH_SCC0
            | Op::S_CBRANCH_SCC1 => {
                ops.count(1, "1")?;
                let cond = match self.op() {
                    Op::S_CBRANCH_EXECZ => BranchCond::ExecZ,
                    Op::S_CBRANCH_EXECNZ => BranchCond::ExecNz,
                    Op::S_CBRANCH_VCCZ => BranchCond::VccZ,
                    Op::S_CBRANCH_VCCNZ => BranchCond::VccNz,
                    Op::S_CBRANCH_SCC0 => BranchCond::Scc0,
                    _ => BranchCond::Scc1,
                };
                Decoded::CBranch {
                    cond,
                    target: ops.target(0)?,
                }
            }
            Op::S_BARRIER => {
                ops.count(0, "0")?;
                Decoded::Barrier
            }
            Op::S_WAITCNT => Decoded::WaitCnt,
            Op::S_ENDPGM => {
                ops.count(0, "0")?;
                Decoded::EndPgm
            }
            Op::V_MOV_B32 => {
                ops.count(2, "2")?;
                Decoded::VMov {
                    dst: ops.vreg(0)?,
                    src: ops.vector32(1)?,
                }
            }
            Op::V_ADD_I32
            | Op::V_SUB_I32
            | Op::V_MUL_LO_I32
            | Op::V_AND_B32
            | Op::V_OR_B32
            | Op::V_LSHLREV_B32 => {
                ops.count(3, "3")?;
                let op = match self.op() {
                    Op::V_ADD_I32 => VectorAlu::Add,
                    Op::V_SUB_I32 => VectorAlu::Sub,
                    Op::V_MUL_LO_I32 => VectorAlu::MulLo,
                    Op::V_AND_B32 => VectorAlu::And,
                    Op::V_OR_B32 => VectorAlu::Or,
                    _ => VectorAlu::LshlRev,
                };
                Decoded::VAlu {
                    op,
                    dst: ops.vreg(0)?,
                    a: ops.vector32(1)?,
                    b: ops.vector32(2)?,
                }
            }
            Op::V_CNDMASK_B32 => {
                let mask = match ops.operands.len() {
                    3 => Scalar64::Vcc,
                    4 => ops.scalar64(3)?,
                    got => {
                        return Err(DecodeError::OperandCount {
                            op: self.op(),
                            expected: "3 or 4",
                            got,
                        })
                    }
                };
                Decoded::VCndMask {
                    dst: ops.vreg(0)?,
                    a: ops.vector32(1)?,
                    b: ops.vector32(2)?,
                    mask,
                }
            }
            Op::V_READFIRSTLANE_B32 => {
                ops.count(2, "2")?;
                Decoded::VReadFirstLane {
                    dst: ops.sreg(0)?,
                    src: ops.vreg(1)?,
                }
            }
            Op::V_CMP_EQ_I32
            | Op::V_CMP_NE_I32
            | Op::V_CMP_LT_I32
            | Op::V_CMP_LE_I32
            | Op::V_CMP_GT_I32
            | Op::V_CMP_GE_I32 => {
                let cmp = match self.op() {
                    Op::V_CMP_EQ_I32 => Cmp::Eq,
                    Op::V_CMP_NE_I32 => Cmp::Ne,
                    Op::V_CMP_LT_I32 => Cmp::Lt,
                    Op::V_CMP_LE_I32 => Cmp::Le,
                    Op::V_CMP_GT_I32 => Cmp::Gt,
                    _ => Cmp::Ge,
                };
                // the result goes to vcc unless the encoding names a scalar pair
                let (dst, first) = match ops.operands.len() {
                    2 => (Dst64::Vcc, 0),
                    3 => (ops.dst64(0)?, 1),
                    got => {
                        return Err(DecodeError::OperandCount {
                            op: self.op(),
                            expected: "2 or 3",
                            got,
                        })
                    }
                };
                if dst == Dst64::Exec {
                    return Err(ops.kind(0, "vcc or a scalar pair"));
                }
                Decoded::VCmp {
                    cmp,
                    dst,
                    a: ops.vector32(first)?,
                    b: ops.vector32(first + 1)?,
                }
            }
            Op::DS_READ_B32 | Op::GLOBAL_LOAD_DWORD => {
                ops.count(2, "2")?;
                let (dst, addr) = (ops.vreg(0)?, ops.vreg(1)?);
                if self.op() == Op::DS_READ_B32 {
                    Decoded::DsRead { dst, addr }
                } else {
                    Decoded::GlobalLoad { dst, addr }
                }
            }
            Op::DS_WRITE_B32 | Op::GLOBAL_STORE_DWORD => {
                ops.count(2, "2")?;
                let (addr, data) = (ops.vreg(0)?, ops.vreg(1)?);
                if self.op() == Op::DS_WRITE_B32 {
                    Decoded::DsWrite { addr, data }
                } else {
                    Decoded::GlobalStore { addr, data }
                }
            }
        };
        Ok(decoded)
    }
}

struct Operands<'a> {
    op: Op,
    operands: &'a [Operand],
}

impl<'a> Operands<'a> {
    fn count(&self, count: usize, expected: &'static str) -> Result<(), DecodeError> {
        if self.operands.len() == count {
            Ok(())
        } else {
            Err(DecodeError::OperandCount {
                op: self.op,
                expected,
                got: self.operands.len(),
            })
        }
    }

    fn kind(&self, index: usize, expected: &'static str) -> DecodeError {
        DecodeError::OperandKind {
            op: self.op,
            index,
            operand: self.operands[index].clone(),
            expected,
        }
    }

    fn literal(&self, index: usize) -> Result<i64, DecodeError> {
        match self.operands[index] {
            Operand::Literal(value) => Ok(value),
            _ => Err(self.kind(index, "a literal")),
        }
    }

    fn sreg(&self, index: usize) -> Result<u16, DecodeError> {
        match self.operands[index] {
            Operand::Sreg(idx) => Ok(idx),
            _ => Err(self.kind(index, "a scalar register")),
        }
    }

    fn vreg(&self, index: usize) -> Result<u16, DecodeError> {
        match self.operands[index] {
            Operand::Vreg(idx) => Ok(idx),
            _ => Err(self.kind(index, "a vector register")),
        }
    }

    fn scalar32(&self, index: usize) -> Result<Scalar32, DecodeError> {
        match self.operands[index] {
            Operand::Sreg(idx) => Ok(Scalar32::Reg(idx)),
            Operand::Literal(value) => literal32(value).map(Scalar32::Literal),
            _ => Err(self.kind(index, "a scalar register or literal")),
        }
    }

    fn scalar64(&self, index: usize) -> Result<Scalar64, DecodeError> {
        match self.operands[index] {
            Operand::SregPair(idx) => Ok(Scalar64::Pair(idx)),
            Operand::Exec => Ok(Scalar64::Exec),
            Operand::Vcc => Ok(Scalar64::Vcc),
            // sign extended
            Operand::Literal(value) => Ok(Scalar64::Literal(value as u64)),
            _ => Err(self.kind(index, "a scalar pair, exec, vcc or literal")),
        }
    }

    fn dst64(&self, index: usize) -> Result<Dst64, DecodeError> {
        match self.operands[index] {
            Operand::SregPair(idx) => Ok(Dst64::Pair(idx)),
            Operand::Exec => Ok(Dst64::Exec),
            Operand::Vcc => Ok(Dst64::Vcc),
            _ => Err(self.kind(index, "a scalar pair, exec or vcc")),
        }
    }

    fn vector32(&self, index: usize) -> Result<Vector32, DecodeError> {
        match self.operands[index] {
            Operand::Vreg(idx) => Ok(Vector32::Vreg(idx)),
            Operand::Sreg(idx) => Ok(Vector32::Sreg(idx)),
            Operand::Literal(value) => literal32(value).map(Vector32::Literal),
            _ => Err(self.kind(index, "a vector register, scalar register or literal")),
        }
    }

    fn target(&self, index: usize) -> Result<usize, DecodeError> {
        match &self.operands[index] {
            Operand::Target(pc) => Ok(*pc),
            Operand::Label(label) => Err(DecodeError::UnresolvedLabel {
                op: self.op,
                label: label.clone(),
            }),
            _ => Err(self.kind(index, "a label")),
        }
    }
}

fn literal32(value: i64) -> Result<u32, DecodeError> {
    if let Ok(value) = i32::try_from(value) {
        Ok(value as u32)
    } else {
        u32::try_from(value).map_err(|_| DecodeError::LiteralRange(value))
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.opcode)?;
        for (i, operand) in self.operands.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}{operand}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Instruction {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let (mnemonic, rest) = value.split_once(char::is_whitespace).unwrap_or((value, ""));
        let opcode = OPCODES
            .get(mnemonic.to_lowercase().as_str())
            .copied()
            .ok_or_else(|| DecodeError::UnknownMnemonic(mnemonic.to_string()))?;
        let operands = rest
            .split(',')
            .map(str::trim)
            .filter(|operand| !operand.is_empty())
            .map(str::parse)
            .collect::<Result<SmallVec<_>, _>>()?;
        let instruction = Self {
            opcode,
            operands,
            control_flow: false,
        };

        // validate the operand shape early, labels are resolved when linking
        match instruction.decode() {
            Ok(_) | Err(DecodeError::UnresolvedLabel { .. }) => Ok(instruction),
            Err(err) => Err(err),
        }
    }
}

impl Serialize for Instruction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Instruction {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Cmp, DecodeError, Decoded, Dst64, Instruction, Op, Operand, Scalar32, Scalar64, Unit,
        Vector32, OPCODES,
    };
    use strum::IntoEnumIterator;

    #[test]
    fn test_every_op_has_an_opcode() {
        for op in Op::iter() {
            let opcode = op.opcode().unwrap();
            assert_eq!(opcode.op, op);
            assert_eq!(op.mnemonic(), op.as_ref());
        }
        assert_eq!(OPCODES.len(), Op::iter().count());
    }

    #[test]
    fn test_parse_operands() {
        assert_eq!("s7".parse(), Ok(Operand::Sreg(7)));
        assert_eq!("s[4:5]".parse(), Ok(Operand::SregPair(4)));
        assert_eq!("v12".parse(), Ok(Operand::Vreg(12)));
        assert_eq!("exec".parse(), Ok(Operand::Exec));
        assert_eq!("-1".parse(), Ok(Operand::Literal(-1)));
        assert_eq!("0x10".parse(), Ok(Operand::Literal(16)));
        assert_eq!("bb_exit".parse(), Ok(Operand::Label("bb_exit".to_string())));
        assert_eq!("@3".parse(), Ok(Operand::Target(3)));
        assert!("s[5:6]".parse::<Operand>().is_err());
        assert!("s[4:6]".parse::<Operand>().is_err());
        assert!("4x".parse::<Operand>().is_err());
    }

    #[test]
    fn test_parse_and_display() {
        let inst: Instruction = "s_and_saveexec_b64 s[4:5], s[2:3]".parse().unwrap();
        assert_eq!(inst.op(), Op::S_AND_SAVEEXEC_B64);
        assert_eq!(inst.to_string(), "s_and_saveexec_b64 s[4:5], s[2:3]");
        assert_eq!(inst.sreg_end(), Some(6));
        assert_eq!(
            inst.decode(),
            Ok(Decoded::SAndSaveExec {
                dst: Dst64::Pair(4),
                src: Scalar64::Pair(2),
            })
        );
        let inst: Instruction = "s_endpgm".parse().unwrap();
        assert_eq!(inst.unit(), Unit::EndProgram);
        assert_eq!(inst.sreg_end(), None);
        assert_eq!(inst.to_string(), "s_endpgm");
    }

    #[test]
    fn test_vector_compare_destination() {
        let implicit: Instruction = "v_cmp_lt_i32 v0, 2".parse().unwrap();
        assert_eq!(
            implicit.decode(),
            Ok(Decoded::VCmp {
                cmp: Cmp::Lt,
                dst: Dst64::Vcc,
                a: Vector32::Vreg(0),
                b: Vector32::Literal(2),
            })
        );
        let explicit: Instruction = "v_cmp_lt_i32 s[6:7], v0, s3".parse().unwrap();
        assert_eq!(
            explicit.decode(),
            Ok(Decoded::VCmp {
                cmp: Cmp::Lt,
                dst: Dst64::Pair(6),
                a: Vector32::Vreg(0),
                b: Vector32::Sreg(3),
            })
        );
        assert!("v_cmp_lt_i32 exec, v0, v1".parse::<Instruction>().is_err());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            "s_frobnicate s0".parse::<Instruction>(),
            Err(DecodeError::UnknownMnemonic("s_frobnicate".to_string()))
        );
        assert!(matches!(
            "s_mov_b64 s2, s[4:5]".parse::<Instruction>(),
            Err(DecodeError::OperandKind { index: 0, .. })
        ));
        assert!(matches!(
            "v_add_i32 v0, v1".parse::<Instruction>(),
            Err(DecodeError::OperandCount { got: 2, .. })
        ));
        assert_eq!(
            "s_movk_i32 s2, 0x10000".parse::<Instruction>(),
            Err(DecodeError::LiteralRange(0x10000))
        );
    }

    #[test]
    fn test_unresolved_label_is_rejected_at_decode() {
        let inst: Instruction = "s_branch loop_head".parse().unwrap();
        assert_eq!(inst.labels().collect::<Vec<_>>(), vec!["loop_head"]);
        assert_eq!(
            inst.decode(),
            Err(DecodeError::UnresolvedLabel {
                op: Op::S_BRANCH,
                label: "loop_head".to_string(),
            })
        );
    }

    #[test]
    fn test_literal_operands() {
        let inst: Instruction = "s_mov_b32 s2, -1".parse().unwrap();
        assert_eq!(
            inst.decode(),
            Ok(Decoded::SMov {
                dst: 2,
                src: Scalar32::Literal(u32::MAX),
            })
        );
        let inst: Instruction = "s_mov_b64 exec, -1".parse().unwrap();
        assert_eq!(
            inst.decode(),
            Ok(Decoded::SMov64 {
                dst: Dst64::Exec,
                src: Scalar64::Literal(u64::MAX),
            })
        );
    }

    #[test]
    fn test_serde_as_assembly() {
        let inst: Instruction = serde_json::from_str(r#""v_mov_b32 v2, 7""#).unwrap();
        assert_eq!(inst.to_string(), "v_mov_b32 v2, 7");
        assert_eq!(serde_json::to_string(&inst).unwrap(), r#""v_mov_b32 v2, 7""#);
    }
}
