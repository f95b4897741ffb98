//! Typed error/fault families for every error class in the core.
//!
//! These replace the "numeric fault cause" framing of a register-level
//! emulation model with real sum types; callers that need the raw wire-level
//! cause code (for building a fault-queue record) use `as u8`/`cause_code`.

/// Register-file access failure (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegAccessError {
    #[error("misaligned access: offset {offset:#x} width {width}")]
    Alignment { offset: u64, width: usize },
    #[error("access out of range: offset {offset:#x} width {width}")]
    OutOfRange { offset: u64, width: usize },
}

/// Directory-walk / translation fault causes (spec §4.2, §7).
///
/// Variants are ordered and numbered to match the RISC-V IOMMU fault cause
/// encoding this core distills from; `cause_code` exposes the wire value
/// used in fault-queue records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FaultCause {
    #[error("DMA disabled (DDTP.MODE == OFF)")]
    DmaDisabled,
    #[error("DDT entry load failure")]
    DdtLoadFault,
    #[error("DDT entry invalid (reserved bits set or VALID clear)")]
    DdtInvalid,
    #[error("device-context validation failed")]
    DdtMisconfigured,
    #[error("DDT walk hit a corrupted intermediate entry")]
    DdtCorrupted,
    #[error("PDT entry load failure")]
    PdtLoadFault,
    #[error("PDT entry invalid")]
    PdtInvalid,
    #[error("process-context validation failed")]
    PdtMisconfigured,
    #[error("process_id given but PDTV clear")]
    TtypeBlocked,
    #[error("internal data-path error")]
    InternalDpError,
}

impl FaultCause {
    /// Whether `tc.DTF` can suppress a fault record for this cause (spec §7:
    /// six causes are "always fatal" and DTF does not suppress them).
    pub fn suppressible_by_dtf(self) -> bool {
        !matches!(
            self,
            FaultCause::DmaDisabled
                | FaultCause::DdtLoadFault
                | FaultCause::DdtInvalid
                | FaultCause::DdtMisconfigured
                | FaultCause::DdtCorrupted
                | FaultCause::InternalDpError
        )
    }

    pub fn cause_code(self) -> u8 {
        match self {
            FaultCause::DmaDisabled => 1,
            FaultCause::DdtLoadFault => 2,
            FaultCause::DdtInvalid => 3,
            FaultCause::DdtMisconfigured => 4,
            FaultCause::DdtCorrupted => 5,
            FaultCause::PdtLoadFault => 6,
            FaultCause::PdtInvalid => 7,
            FaultCause::PdtMisconfigured => 8,
            FaultCause::TtypeBlocked => 9,
            FaultCause::InternalDpError => 10,
        }
    }
}

/// MSI/MRIF redirection fault causes (spec §4.5, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MsiFaultCause {
    #[error("MSI load fault")]
    LoadFault,
    #[error("MSI page table entry corrupted")]
    PtCorrupted,
    #[error("MSI page table entry invalid")]
    Invalid,
    #[error("MSI page table entry misconfigured")]
    Misconfigured,
    #[error("MSI write fault")]
    WrFault,
}

impl MsiFaultCause {
    /// `MSI_WR_FAULT` is always fatal (spec §7); everything else in this
    /// family follows the same DTF rule as translation faults.
    pub fn suppressible_by_dtf(self) -> bool {
        !matches!(self, MsiFaultCause::WrFault)
    }

    pub fn cause_code(self) -> u8 {
        match self {
            MsiFaultCause::LoadFault => 0x20,
            MsiFaultCause::PtCorrupted => 0x21,
            MsiFaultCause::Invalid => 0x22,
            MsiFaultCause::Misconfigured => 0x23,
            MsiFaultCause::WrFault => 0x24,
        }
    }
}

/// Command-queue decode/execution faults (spec §4.6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CmdFault {
    #[error("illegal command")]
    Illegal,
    #[error("command timeout")]
    Timeout,
}
