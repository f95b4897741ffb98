//! The MMIO dispatcher: decodes the aligned 4-byte register an accepted
//! write landed in and selects the action the core runs once `regs_lock` is
//! released (spec §4.1).

use crate::ddtp::DDTP_BUSY_BIT;
use crate::queues::csr_bit::BUSY;
use crate::regs::offset;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ProcessDdtp,
    ProcessCqTail,
    ProcessCqControl,
    ProcessFqControl,
    ProcessPqControl,
    /// Software wrote `FQH`/`PQH` to acknowledge consuming records up to
    /// that index (spec §4.6: these two queues are host-consumed, so the
    /// driver owns the head pointer rather than the queue's tail).
    ProcessFqHead,
    ProcessPqHead,
    UpdateIpsr,
    /// Recognized but actionless: the value is stored, nothing else runs.
    None,
}

/// Select the action for a write that landed anywhere in `[offset, offset +
/// width)`. `DDTP` is a 64-bit register so a write to either half selects
/// `ProcessDdtp`.
pub fn decode(offset_written: u64) -> Action {
    let regb = offset_written & !0x3;
    if regb == offset::DDTP || regb == offset::DDTP + 4 {
        return Action::ProcessDdtp;
    }
    match regb {
        o if o == offset::CQT => Action::ProcessCqTail,
        o if o == offset::CQCSR => Action::ProcessCqControl,
        o if o == offset::FQCSR => Action::ProcessFqControl,
        o if o == offset::PQCSR => Action::ProcessPqControl,
        o if o == offset::FQH => Action::ProcessFqHead,
        o if o == offset::PQH => Action::ProcessPqHead,
        o if o == offset::IPSR => Action::UpdateIpsr,
        _ => Action::None,
    }
}

/// The `(offset, width, bit)` of the `BUSY` bit to OR in atomically before
/// running `action` (spec §4.1: "OR-ed into the register atomically before
/// the action runs").
pub fn busy_latch(action: Action) -> Option<(u64, usize, u64)> {
    match action {
        Action::ProcessDdtp => Some((offset::DDTP, 8, DDTP_BUSY_BIT)),
        Action::ProcessCqControl => Some((offset::CQCSR, 4, BUSY)),
        Action::ProcessFqControl => Some((offset::FQCSR, 4, BUSY)),
        Action::ProcessPqControl => Some((offset::PQCSR, 4, BUSY)),
        _ => None,
    }
}
