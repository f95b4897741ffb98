//! MSI/MRIF redirection (spec §4.5): invoked when a trap-bus write lands on
//! an address the translation engine already matched against the context's
//! MSI window.

use memory::MemoryBus;

use crate::context::Ctx;
use crate::error::MsiFaultCause;
use crate::translate::{pext, PAGE_SHIFT};

const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
const MSI_PTE_LEN: u64 = 16;

/// Decoded MSI page-table entry mode (PTE `M` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MsiPteMode {
    Disabled,
    Basic,
    Mrif,
}

struct MsiPte {
    mode: MsiPteMode,
    valid: bool,
    custom: bool,
    ppn: u64,
    mrif_addr: u64,
    npn: u64,
}

fn decode_pte(dword0: u64, dword1: u64) -> MsiPte {
    MsiPte {
        valid: dword0 & 1 != 0,
        custom: dword0 & (1 << 1) != 0,
        mode: match (dword0 >> 60) & 0xF {
            0 => MsiPteMode::Disabled,
            1 => MsiPteMode::Basic,
            3 => MsiPteMode::Mrif,
            _ => MsiPteMode::Disabled,
        },
        // Bits [53:10], a 44-bit field; bits [59:54] are reserved and [63:60]
        // is `M`, decoded separately above. Must not reach into either.
        ppn: (dword0 >> 10) & 0x0000_0FFF_FFFF_FFFF,
        mrif_addr: (dword0 >> 10) & 0x0000_0FFF_FFFF_FFFF,
        // NPPN occupies the high bits of pte1, above the NID/NID_MSB fields
        // at bits [10:0] so the two never overlap.
        npn: dword1 >> 11,
    }
}

/// Outcome of a redirected MSI write: either it was forwarded transparently
/// (`Basic`) or it updated an MRIF pending/enable pair and possibly sent a
/// notification (`Mrif`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsiOutcome {
    Basic,
    Mrif { notified: bool },
}

/// Distinguish a decode error (the bus understood the address but can't
/// service it — a corrupted PTE slot) from an ordinary bus error when
/// reading the MSI PTE quads (spec §4.5 step 3).
fn pte_read_fault(err: memory::BusError) -> MsiFaultCause {
    match err {
        memory::BusError::Decode { .. } => MsiFaultCause::PtCorrupted,
        memory::BusError::Bus { .. } => MsiFaultCause::LoadFault,
    }
}

/// Redirect a trap-bus write carrying `gpa`/`data` through `ctx`'s MSI page
/// table (spec §4.5). `bus` is the memory bus backing the MSI PT and, for
/// MRIF mode, the pending/enable bit pairs and notification target.
pub fn redirect<B: MemoryBus + ?Sized>(
    bus: &mut B,
    ctx: &Ctx,
    gpa: u64,
    data: u32,
) -> Result<MsiOutcome, MsiFaultCause> {
    if !crate::translate::msi_check(ctx, gpa) {
        return Err(MsiFaultCause::LoadFault);
    }

    let intn = pext(gpa >> PAGE_SHIFT, ctx.msi_addr_mask);
    if intn >= 256 {
        return Err(MsiFaultCause::LoadFault);
    }

    let msiptp_ppn = ctx.msiptp_ppn();
    let pte_addr = msiptp_ppn * PAGE_SIZE + intn * MSI_PTE_LEN;
    let dword0 = bus.read_u64(pte_addr).map_err(pte_read_fault)?;
    let dword1 = bus.read_u64(pte_addr + 8).map_err(pte_read_fault)?;
    let pte = decode_pte(dword0, dword1);

    if !pte.valid || pte.custom {
        return Err(MsiFaultCause::Invalid);
    }

    match pte.mode {
        MsiPteMode::Basic => {
            let target = pte.ppn * PAGE_SIZE | (gpa & (PAGE_SIZE - 1));
            bus.write_u32(target, data)
                .map_err(|_| MsiFaultCause::WrFault)?;
            Ok(MsiOutcome::Basic)
        }
        MsiPteMode::Mrif => {
            if data > 2047 || gpa % 4 != 0 {
                return Err(MsiFaultCause::Misconfigured);
            }
            let pending_addr = (pte.mrif_addr << 9) | (((data as u64) & 0x7C0) >> 3);
            let mut pending = bus
                .read_u64(pending_addr)
                .map_err(|_| MsiFaultCause::LoadFault)?;
            pending |= 1u64 << (data & 0x3F);
            bus.write_u64(pending_addr, pending)
                .map_err(|_| MsiFaultCause::WrFault)?;

            let enable = bus
                .read_u64(pending_addr + 8)
                .map_err(|_| MsiFaultCause::LoadFault)?;
            let bit = 1u64 << (data & 0x3F);
            if enable & bit == 0 {
                return Ok(MsiOutcome::Mrif { notified: false });
            }

            let nid = dword1 & 0x3FF;
            let nid_msb = (dword1 >> 10) & 1;
            let n190 = nid | (nid_msb << 10);
            let notify_addr = pte.npn * PAGE_SIZE;
            bus.write_u32(notify_addr, n190 as u32)
                .map_err(|_| MsiFaultCause::WrFault)?;
            Ok(MsiOutcome::Mrif { notified: true })
        }
        MsiPteMode::Disabled => Err(MsiFaultCause::Misconfigured),
    }
}
