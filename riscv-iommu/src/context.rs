//! The translation context (`Ctx`) materialized by a DDT/PDT walk (spec §3).

use bitflags::bitflags;

bitflags! {
    /// Translation-control bitfield (`tc`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Tc: u64 {
        /// Context valid.
        const V = 1 << 0;
        /// Process directory table enabled.
        const PDTV = 1 << 1;
        /// Disable fault reporting for this context (does not suppress the
        /// "always fatal" causes — see [`crate::error::FaultCause::suppressible_by_dtf`]).
        const DTF = 1 << 2;
        /// Page-request interface enabled.
        const PRPR = 1 << 3;
        const EN_PRI = 1 << 4;
        const T2GPA = 1 << 5;
        const SBE = 1 << 6;
        /// Private extension: opt this context into automatic page-request
        /// generation on a fault (spec §9 open question).
        const AUTO_PR = 1 << 32;
    }
}

bitflags! {
    /// Translation attributes (`ta`): permissions + ASID reserved bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Ta: u64 {
        const V = 1 << 0;
    }
}

/// Bits of `ta` that must be zero (spec §4.2 step 7: `PDT_MISCONFIGURED` on
/// any reserved bit set).
pub const TA_RESERVED_MASK: u64 = !Ta::V.bits();

/// `msiptp` mode field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsiPtMode {
    Off,
    Flat,
}

impl MsiPtMode {
    pub fn from_bits(bits: u64) -> Option<Self> {
        match bits & 0xF {
            0 => Some(MsiPtMode::Off),
            1 => Some(MsiPtMode::Flat),
            _ => None,
        }
    }
}

/// A fully materialized per-{device, process} translation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ctx {
    pub devid: u32,
    pub process_id: u32,
    pub tc: Tc,
    pub ta: Ta,
    pub msiptp_raw: u64,
    pub msi_addr_mask: u64,
    pub msi_addr_pattern: u64,
}

impl Ctx {
    /// Synthesize the pass-through context used when `DDTP.MODE == BARE`
    /// (spec §4.2 step 1).
    pub fn bare(devid: u32, process_id: u32) -> Self {
        Self {
            devid,
            process_id,
            tc: Tc::V,
            ta: Ta::empty(),
            msiptp_raw: 0,
            msi_addr_mask: 0,
            msi_addr_pattern: 0,
        }
    }

    pub fn msiptp_mode(&self) -> Option<MsiPtMode> {
        MsiPtMode::from_bits(self.msiptp_raw)
    }

    pub fn msiptp_ppn(&self) -> u64 {
        (self.msiptp_raw >> 10) & 0x000F_FFFF_FFFF_FFFF
    }

    /// Clear the `V` bit in place (invalidation never removes the entry,
    /// only marks it stale — spec §4.3).
    pub fn invalidate(&mut self) {
        self.tc.remove(Tc::V);
    }

    pub fn is_valid(&self) -> bool {
        self.tc.contains(Tc::V)
    }
}
