//! `IPSR` update logic and edge-triggered notification dispatch (spec §4.7).

/// Interrupt source indices, matching the bit position each occupies in
/// `IPSR` and the nibble it occupies in `IVEC`.
pub mod source {
    pub const CQ: u32 = 0;
    pub const FQ: u32 = 1;
    pub const PQ: u32 = 2;
}

/// `FCTL.BE`: MMIO endianness selector. Not driver-writable in this core
/// (spec §6: "writable bits disallow `BE` and `WSI`") since big-endian MMIO
/// is out of scope.
pub const FCTL_BE: u64 = 1 << 0;

/// `FCTL.WSI`: when set, interrupts are wire-signaled and this core has
/// nothing further to do (the host bridge polls `IPSR`) (spec §4.7, §6).
pub const FCTL_WSI: u64 = 1 << 1;

/// Apply an `IPSR` write and recompute which written-1 bits should actually
/// clear.
///
/// `write_data` bit `1` is a driver request to acknowledge (clear) that
/// source. A bit only clears if `still_pending(source)` reports the source
/// no longer has a masked, enabled, latched condition; otherwise the bit is
/// forced back to `1` (spec §4.7: "if yes the bit remains set").
pub fn update_ipsr(current: u32, write_data: u32, still_pending: impl Fn(u32) -> bool) -> u32 {
    let mut next = current & !write_data;
    for src in 0..32 {
        let bit = 1u32 << src;
        if write_data & bit != 0 && still_pending(src) {
            next |= bit;
        }
    }
    next
}

/// The vector assigned to `source` by `IVEC` (4 bits per source).
pub fn ivec_vector(ivec: u64, source: u32) -> u8 {
    ((ivec >> (source * 4)) & 0xF) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_clears_when_condition_is_gone() {
        let next = update_ipsr(0b1, 0b1, |_| false);
        assert_eq!(next, 0);
    }

    #[test]
    fn ack_is_rejected_while_condition_persists() {
        let next = update_ipsr(0b1, 0b1, |_| true);
        assert_eq!(next, 0b1);
    }

    #[test]
    fn unwritten_bits_are_left_alone() {
        let next = update_ipsr(0b101, 0b001, |_| false);
        assert_eq!(next, 0b100);
    }

    #[test]
    fn ivec_vector_reads_the_right_nibble() {
        assert_eq!(ivec_vector(0x10, source::CQ), 0);
        assert_eq!(ivec_vector(0x10, source::FQ), 1);
    }
}
