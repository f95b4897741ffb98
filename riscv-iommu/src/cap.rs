//! The `cap` capability snapshot, computed once at realize time (spec §3).

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CapFlags: u64 {
        /// MSI flat-table mode supported.
        const MSI_FLAT = 1 << 22;
        /// MRIF (memory-resident interrupt file) mode supported.
        const MSI_MRIF = 1 << 23;
    }
}

/// Supported process-ID width: PD8 (8-bit PASID space) per spec §3.
pub const PD8: u32 = 8;

#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub version: u8,
    pub flags: CapFlags,
    pub phys_bits: u32,
    pub pd8_bits: u32,
}

impl Capabilities {
    pub fn new(version: u8, msi_flat: bool, msi_mrif: bool, phys_bits: u32) -> Self {
        let mut flags = CapFlags::empty();
        flags.set(CapFlags::MSI_FLAT, msi_flat);
        flags.set(CapFlags::MSI_MRIF, msi_mrif);
        Self {
            version,
            flags,
            phys_bits,
            pd8_bits: PD8,
        }
    }

    /// Pack the capability snapshot into the `CAP` register's raw bits.
    pub fn to_raw(self) -> u64 {
        (self.version as u64)
            | self.flags.bits()
            | ((self.phys_bits as u64) << 24)
            | ((self.pd8_bits as u64) << 32)
    }
}
