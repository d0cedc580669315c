use crate::address;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

/// Southern Islands instruction encoding formats.
///
/// Only the formats the timing pipelines distinguish are modeled; the
/// disassembler-level distinctions within one format are irrelevant here.
#[derive(Clone, Copy, Debug, Display, EnumIter, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    Sop1,
    Sop2,
    Sopc,
    Sopk,
    Sopp,
    Smrd,
    Vop1,
    Vop2,
    Vopc,
    Vop3a,
    Vop3b,
    Ds,
    Mubuf,
    Mtbuf,
}

impl Format {
    /// Scalar-program formats handled by the scalar and branch pipelines.
    #[must_use]
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            Format::Sop1 | Format::Sop2 | Format::Sopc | Format::Sopk | Format::Sopp
        )
    }

    /// Vector-ALU formats handled by the SIMD pipelines.
    #[must_use]
    pub fn is_vector_alu(self) -> bool {
        matches!(
            self,
            Format::Vop1 | Format::Vop2 | Format::Vopc | Format::Vop3a | Format::Vop3b
        )
    }

    /// Typed or untyped vector-memory buffer formats.
    #[must_use]
    pub fn is_vector_memory(self) -> bool {
        matches!(self, Format::Mubuf | Format::Mtbuf)
    }
}

/// SOPP opcode of `s_endpgm`.
pub const OP_SOPP_ENDPGM: u16 = 1;
/// First SOPP branch opcode (`s_branch`).
pub const OP_SOPP_BRANCH_FIRST: u16 = 2;
/// Last SOPP branch opcode (`s_cbranch_execnz`).
pub const OP_SOPP_BRANCH_LAST: u16 = 9;
/// SOPP opcode of `s_barrier`.
pub const OP_SOPP_BARRIER: u16 = 10;
/// SOPP opcode of `s_waitcnt`.
pub const OP_SOPP_WAITCNT: u16 = 12;

/// Per-work-item access pattern of a memory instruction.
///
/// Work item `i` of the wavefront accesses `base + i * stride` with the
/// given size. The functional emulator computes real per-lane addresses;
/// the trace stand-in synthesizes them from this pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPattern {
    pub base: address,
    pub stride: u64,
    pub size: u32,
}

impl AccessPattern {
    #[must_use]
    pub fn address_for_lane(&self, lane: usize) -> address {
        self.base + self.stride * lane as u64
    }
}

/// Direction of a local-data-share access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LdsAccessKind {
    Read,
    Write,
}

/// One dynamic instruction of a kernel, annotated with the side effects the
/// timing simulator needs: which pipeline it belongs to and what memory
/// traffic it generates per work item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub format: Format,
    pub op: u16,
    /// Disassembly used in traces.
    pub name: String,

    /// Global-memory access pattern (SMRD, MUBUF, MTBUF).
    pub glbl_access: Option<AccessPattern>,
    /// LDS access pattern (DS).
    pub lds_access: Option<(LdsAccessKind, AccessPattern)>,

    pub is_store: bool,
    pub is_atomic: bool,
    pub global_coherency: bool,
}

impl Instruction {
    fn new(format: Format, op: u16, name: impl Into<String>) -> Self {
        Self {
            format,
            op,
            name: name.into(),
            glbl_access: None,
            lds_access: None,
            is_store: false,
            is_atomic: false,
            global_coherency: false,
        }
    }

    /// Scalar ALU operation (SOP2 encoding).
    #[must_use]
    pub fn scalar_alu(name: impl Into<String>) -> Self {
        Self::new(Format::Sop2, 0, name)
    }

    /// Vector ALU operation (VOP2 encoding).
    #[must_use]
    pub fn vector_alu(name: impl Into<String>) -> Self {
        Self::new(Format::Vop2, 0, name)
    }

    /// Vector ALU operation in the three-operand VOP3a encoding.
    #[must_use]
    pub fn vector_alu_vop3(name: impl Into<String>) -> Self {
        Self::new(Format::Vop3a, 0, name)
    }

    #[must_use]
    pub fn s_endpgm() -> Self {
        Self::new(Format::Sopp, OP_SOPP_ENDPGM, "s_endpgm")
    }

    #[must_use]
    pub fn s_branch() -> Self {
        Self::new(Format::Sopp, OP_SOPP_BRANCH_FIRST, "s_branch")
    }

    /// Conditional branch; `op` must lie in the SOPP branch opcode range.
    #[must_use]
    pub fn s_cbranch(op: u16) -> Self {
        assert!(
            (OP_SOPP_BRANCH_FIRST..=OP_SOPP_BRANCH_LAST).contains(&op),
            "opcode {op} is not a SOPP branch"
        );
        Self::new(Format::Sopp, op, "s_cbranch")
    }

    #[must_use]
    pub fn s_barrier() -> Self {
        Self::new(Format::Sopp, OP_SOPP_BARRIER, "s_barrier")
    }

    #[must_use]
    pub fn s_waitcnt() -> Self {
        Self::new(Format::Sopp, OP_SOPP_WAITCNT, "s_waitcnt")
    }

    /// Scalar memory read of a constant buffer (SMRD encoding).
    #[must_use]
    pub fn smem_load(base: address, size: u32) -> Self {
        let mut instr = Self::new(Format::Smrd, 0, "s_buffer_load_dword");
        instr.glbl_access = Some(AccessPattern {
            base,
            stride: 0,
            size,
        });
        instr
    }

    /// Untyped vector buffer load (MUBUF encoding).
    #[must_use]
    pub fn buffer_load(base: address, stride: u64, size: u32) -> Self {
        let mut instr = Self::new(Format::Mubuf, 0, "buffer_load_dword");
        instr.glbl_access = Some(AccessPattern { base, stride, size });
        instr
    }

    /// Untyped vector buffer store (MUBUF encoding).
    #[must_use]
    pub fn buffer_store(base: address, stride: u64, size: u32, global_coherency: bool) -> Self {
        let mut instr = Self::new(Format::Mubuf, 0, "buffer_store_dword");
        instr.glbl_access = Some(AccessPattern { base, stride, size });
        instr.is_store = true;
        instr.global_coherency = global_coherency;
        instr
    }

    /// Buffer atomic (MUBUF encoding).
    #[must_use]
    pub fn buffer_atomic(base: address, stride: u64, size: u32) -> Self {
        let mut instr = Self::new(Format::Mubuf, 0, "buffer_atomic_add");
        instr.glbl_access = Some(AccessPattern { base, stride, size });
        instr.is_atomic = true;
        instr
    }

    /// Local-data-share read (DS encoding).
    #[must_use]
    pub fn ds_read(base: address, size: u32) -> Self {
        let mut instr = Self::new(Format::Ds, 0, "ds_read_b32");
        instr.lds_access = Some((
            LdsAccessKind::Read,
            AccessPattern {
                base,
                stride: u64::from(size),
                size,
            },
        ));
        instr
    }

    /// Local-data-share write (DS encoding).
    #[must_use]
    pub fn ds_write(base: address, size: u32) -> Self {
        let mut instr = Self::new(Format::Ds, 0, "ds_write_b32");
        instr.lds_access = Some((
            LdsAccessKind::Write,
            AccessPattern {
                base,
                stride: u64::from(size),
                size,
            },
        ));
        instr
    }

    /// Whether this is a branch: SOPP with opcode in the branch range.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        self.format == Format::Sopp
            && (OP_SOPP_BRANCH_FIRST..=OP_SOPP_BRANCH_LAST).contains(&self.op)
    }

    #[must_use]
    pub fn is_endpgm(&self) -> bool {
        self.format == Format::Sopp && self.op == OP_SOPP_ENDPGM
    }

    #[must_use]
    pub fn is_barrier(&self) -> bool {
        self.format == Format::Sopp && self.op == OP_SOPP_BARRIER
    }

    #[must_use]
    pub fn is_memory_wait(&self) -> bool {
        self.format == Format::Sopp && self.op == OP_SOPP_WAITCNT
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_range() {
        assert!(Instruction::s_branch().is_branch());
        assert!(Instruction::s_cbranch(9).is_branch());
        assert!(!Instruction::s_endpgm().is_branch());
        assert!(!Instruction::s_barrier().is_branch());
        assert!(!Instruction::s_waitcnt().is_branch());
    }

    #[test]
    fn format_classes() {
        assert!(Format::Sopp.is_scalar());
        assert!(!Format::Smrd.is_vector_alu());
        assert!(Format::Vop3b.is_vector_alu());
        assert!(Format::Mtbuf.is_vector_memory());
        assert!(!Format::Ds.is_vector_memory());
    }

    #[test]
    fn access_pattern_addresses() {
        let pattern = AccessPattern {
            base: 0x1000,
            stride: 4,
            size: 4,
        };
        assert_eq!(pattern.address_for_lane(0), 0x1000);
        assert_eq!(pattern.address_for_lane(63), 0x10fc);
    }

    #[test]
    fn special_sopp_flags() {
        assert!(Instruction::s_endpgm().is_endpgm());
        assert!(Instruction::s_barrier().is_barrier());
        assert!(Instruction::s_waitcnt().is_memory_wait());
        assert!(!Instruction::s_waitcnt().is_barrier());
    }
}
