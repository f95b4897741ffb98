//! `DDTP` mode decode and the legal-transition rule (spec §3, §4.1).

/// `DDTP.MODE` field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdtpMode {
    Off,
    Bare,
    Lvl1,
    Lvl2,
    Lvl3,
}

impl DdtpMode {
    pub fn from_bits(bits: u64) -> Option<Self> {
        match bits & 0xF {
            0 => Some(DdtpMode::Off),
            1 => Some(DdtpMode::Bare),
            2 => Some(DdtpMode::Lvl1),
            3 => Some(DdtpMode::Lvl2),
            4 => Some(DdtpMode::Lvl3),
            _ => None,
        }
    }

    pub fn to_bits(self) -> u64 {
        match self {
            DdtpMode::Off => 0,
            DdtpMode::Bare => 1,
            DdtpMode::Lvl1 => 2,
            DdtpMode::Lvl2 => 3,
            DdtpMode::Lvl3 => 4,
        }
    }

    /// Number of intermediate (non-leaf) DDT levels this mode walks (spec §4.2
    /// step 1: `depth ∈ {0,1,2}`).
    pub fn depth(self) -> Option<u32> {
        match self {
            DdtpMode::Lvl1 => Some(0),
            DdtpMode::Lvl2 => Some(1),
            DdtpMode::Lvl3 => Some(2),
            DdtpMode::Off | DdtpMode::Bare => None,
        }
    }

    fn is_idle(self) -> bool {
        matches!(self, DdtpMode::Off | DdtpMode::Bare)
    }

    /// spec §4.1 DDTP transition rule: `{OFF, BARE} -> any`; `{1LVL,2LVL,3LVL}
    /// -> {OFF, BARE}`; everything else is rejected.
    pub fn transition_allowed(from: DdtpMode, to: DdtpMode) -> bool {
        from.is_idle() || to.is_idle()
    }
}

/// Reserved-bit mask applied to an accepted `DDTP` write: bits [3:0] mode,
/// bits [63:10] PPN, bits [9:4] reserved and masked to zero on acceptance.
pub const DDTP_ACCEPT_MASK: u64 = 0xF | (!0x3FFu64);

/// `DDTP.BUSY`, latched by the dispatcher before `process_ddtp` runs and
/// cleared by `process_ddtp` on completion (spec §4.1).
pub const DDTP_BUSY_BIT: u64 = 1 << 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_to_any_is_allowed() {
        assert!(DdtpMode::transition_allowed(DdtpMode::Off, DdtpMode::Lvl3));
        assert!(DdtpMode::transition_allowed(DdtpMode::Bare, DdtpMode::Lvl1));
    }

    #[test]
    fn active_to_idle_is_allowed() {
        assert!(DdtpMode::transition_allowed(DdtpMode::Lvl2, DdtpMode::Off));
        assert!(DdtpMode::transition_allowed(DdtpMode::Lvl3, DdtpMode::Bare));
    }

    #[test]
    fn active_to_active_is_rejected() {
        assert!(!DdtpMode::transition_allowed(DdtpMode::Lvl1, DdtpMode::Lvl2));
        assert!(!DdtpMode::transition_allowed(DdtpMode::Lvl3, DdtpMode::Lvl1));
    }
}
