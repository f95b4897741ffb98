//! The translation engine (spec §4.4): consumes a [`Ctx`] and an incoming
//! IOVA/permission pair, returns a translated entry or drives fault
//! production.

use crate::context::{Ctx, MsiPtMode};
use crate::error::FaultCause;

/// Page size / mask this core translates at (spec glossary: PPN).
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_MASK: u64 = (1 << PAGE_SHIFT) - 1;

/// Requested/returned access permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perm {
    None,
    Ro,
    Wo,
    Rw,
}

impl Perm {
    fn includes_write(self) -> bool {
        matches!(self, Perm::Wo | Perm::Rw)
    }
}

/// Which bus a translated access should be directed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetBus {
    Target,
    Trap,
}

/// The result of a successful `translate()` (spec §4.4, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoTlbEntry {
    pub iova: u64,
    pub translated_addr: u64,
    pub addr_mask: u64,
    pub perm: Perm,
    pub target: TargetBus,
}

fn ppn(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

/// `pext`: compress the bits of `x` selected by `mask` to the low end of the
/// result, in ascending order of their position in `mask` (spec §4.5, §8
/// invariant 6; kept as a portable loop, not a host bit-manipulation
/// intrinsic, per spec §9).
pub fn pext(x: u64, mask: u64) -> u64 {
    let mut result = 0u64;
    let mut out_bit = 0u32;
    let mut m = mask;
    while m != 0 {
        let bit = m.trailing_zeros();
        if x & (1 << bit) != 0 {
            result |= 1 << out_bit;
        }
        out_bit += 1;
        m &= m - 1;
    }
    result
}

/// `msi_check(gpa)`: whether `gpa` matches the context's MSI address window
/// (spec §4.4, §8 invariant 5).
pub fn msi_check(ctx: &Ctx, gpa: u64) -> bool {
    ctx.msiptp_mode() == Some(MsiPtMode::Flat)
        && (ppn(gpa) ^ ctx.msi_addr_pattern) & !ctx.msi_addr_mask == 0
}

/// Outcome of a translation that did not produce an `IoTlbEntry`: the fault
/// the caller should enqueue (spec §4.4 steps 3-4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateFault {
    /// Automatic page-request path (`tc` bit 32 set, `perm == NONE`).
    PageRequest { iova_page: u64, cause: FaultCause },
    /// Ordinary fault enqueue.
    Fault { write: bool, cause: FaultCause },
}

/// Translate `iova` under `ctx` with the requested permission.
///
/// `walk_fault`, when `Some`, is the fault the directory walker already
/// produced for this context; in that case translation cannot succeed and
/// this function only decides how the failure should be reported.
pub fn translate(
    ctx: &Ctx,
    iova: u64,
    perm: Perm,
    walk_fault: Option<FaultCause>,
) -> Result<IoTlbEntry, TranslateFault> {
    if let Some(cause) = walk_fault {
        if ctx.tc.bits() & (1u64 << 32) != 0 && perm == Perm::None {
            return Err(TranslateFault::PageRequest {
                iova_page: iova & !PAGE_MASK,
                cause,
            });
        }
        return Err(TranslateFault::Fault {
            write: perm.includes_write(),
            cause,
        });
    }

    if perm.includes_write() && msi_check(ctx, iova) {
        return Ok(IoTlbEntry {
            iova,
            translated_addr: iova,
            addr_mask: !PAGE_MASK,
            perm,
            target: TargetBus::Trap,
        });
    }

    Ok(IoTlbEntry {
        iova,
        translated_addr: iova,
        addr_mask: !PAGE_MASK,
        perm: Perm::Rw,
        target: TargetBus::Target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Ctx, Tc};

    fn identity_ctx() -> Ctx {
        Ctx::bare(0x100, 0)
    }

    const SOME_CAUSE: FaultCause = FaultCause::PdtInvalid;

    #[test]
    fn pass_through_does_not_touch_msi_path() {
        let ctx = identity_ctx();
        let entry = translate(&ctx, 0xDEAD_F000, Perm::Rw, None).unwrap();
        assert_eq!(entry.translated_addr, 0xDEAD_F000);
        assert_eq!(entry.addr_mask, !PAGE_MASK);
        assert_eq!(entry.perm, Perm::Rw);
        assert_eq!(entry.target, TargetBus::Target);
    }

    #[test]
    fn matching_msi_write_redirects_to_trap_bus() {
        let mut ctx = identity_ctx();
        ctx.msiptp_raw = 1; // FLAT
        ctx.msi_addr_mask = 0x1;
        ctx.msi_addr_pattern = 0x1000;

        // ppn(gpa) == 0x1000, matching `pattern` with the mask's one free bit
        // (bit 0) clear.
        let gpa = (0x1000 << PAGE_SHIFT) | 0xABC;
        assert!(msi_check(&ctx, gpa));
        let entry = translate(&ctx, gpa, Perm::Wo, None).unwrap();
        assert_eq!(entry.target, TargetBus::Trap);
        assert_eq!(entry.translated_addr, gpa);
    }

    #[test]
    fn pext_gathers_masked_bits_in_ascending_order() {
        let x = 0b1011_0110;
        let mask = 0b0010_1100;
        // mask bits set at positions 2,3,5 -> x bits at those positions: 1,0,1
        assert_eq!(pext(x, mask), 0b101);
    }

    #[test]
    fn pext_zero_mask_is_zero() {
        assert_eq!(pext(0xFFFF_FFFF, 0), 0);
    }

    #[test]
    fn walk_fault_with_auto_pr_and_no_perm_requests_page_request() {
        let mut ctx = identity_ctx();
        ctx.tc.insert(Tc::from_bits_retain(1 << 32));
        let result = translate(&ctx, 0x2000, Perm::None, Some(SOME_CAUSE));
        assert_eq!(
            result,
            Err(TranslateFault::PageRequest {
                iova_page: 0x2000,
                cause: SOME_CAUSE
            })
        );
    }

    #[test]
    fn ordinary_walk_fault_reports_ttype_from_perm() {
        let ctx = identity_ctx();
        let result = translate(&ctx, 0x3000, Perm::Ro, Some(SOME_CAUSE));
        assert_eq!(
            result,
            Err(TranslateFault::Fault {
                write: false,
                cause: SOME_CAUSE
            })
        );
    }

    proptest::proptest! {
        /// Spec §8 invariant 6: `pext(x, m)`'s output bits, from position 0 up
        /// to `popcount(m) - 1`, are exactly `x`'s bits at the positions where
        /// `m` is set, in ascending order of that position.
        #[test]
        fn pext_gathers_bits_in_ascending_mask_order(
            x in proptest::prelude::any::<u64>(),
            mask in proptest::prelude::any::<u64>(),
        ) {
            let out = pext(x, mask);
            let mut expected = 0u64;
            let mut out_bit = 0u32;
            for bit in 0..64 {
                if mask & (1u64 << bit) != 0 {
                    if x & (1u64 << bit) != 0 {
                        expected |= 1u64 << out_bit;
                    }
                    out_bit += 1;
                }
            }
            proptest::prop_assert_eq!(out, expected);
        }
    }
}
