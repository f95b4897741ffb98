//! The three hardware queues: Command Queue consumer, Fault Queue producer,
//! Page-Request Queue producer (spec §4.6), sharing one enable/active/busy
//! control state machine.

use memory::MemoryBus;

use crate::cache::{ContextCache, InvalidateSelector};
use crate::error::CmdFault;

/// Bit positions shared by `CQCSR`/`FQCSR`/`PQCSR` (spec §4.6, §6). `OVERFLOW`
/// on `FQCSR`/`PQCSR` and `CMD_TO` on `CQCSR` occupy the same position since
/// each queue only ever uses its own meaning for that bit.
pub mod csr_bit {
    pub const ENABLE: u64 = 1 << 0;
    pub const IE: u64 = 1 << 1;
    pub const MEMFAULT: u64 = 1 << 8;
    pub const CMD_TO_OR_OVERFLOW: u64 = 1 << 9;
    pub const CMD_ILL: u64 = 1 << 10;
    pub const FENCE_W_IP: u64 = 1 << 11;
    pub const ACTIVE: u64 = 1 << 16;
    pub const BUSY: u64 = 1 << 17;
}

/// Control/ring state common to all three queues (spec §3, §4.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueState {
    pub enable: bool,
    pub active: bool,
    pub busy: bool,
    pub memfault: bool,
    /// `CMD_TO` for the command queue (unused — spec §9), `OVERFLOW` for
    /// fault/page-request.
    pub secondary_error: bool,
    /// `CQCSR.CMD_ILL`. Only meaningful for the command queue.
    pub cmd_ill: bool,
    pub ie: bool,
    pub base_ppn: u64,
    pub log2size: u32,
    pub head: u32,
    pub tail: u32,
}

impl QueueState {
    pub fn index_mask(&self) -> u32 {
        (1u32 << self.log2size) - 1
    }

    pub fn is_full(&self) -> bool {
        self.head == (self.tail.wrapping_add(1)) & self.index_mask()
    }

    pub fn has_any_error(&self) -> bool {
        self.memfault || self.secondary_error || self.cmd_ill
    }

    /// Apply the common `*_CONTROL` write transition table (spec §4.6).
    pub fn apply_control(&mut self, requested_enable: bool, base_ppn: u64, log2size: u32) {
        match (requested_enable, self.active) {
            (true, false) => {
                self.base_ppn = base_ppn;
                self.log2size = log2size;
                self.head = 0;
                self.tail = 0;
                self.memfault = false;
                self.secondary_error = false;
                self.cmd_ill = false;
                self.busy = false;
                self.active = true;
                self.enable = true;
            }
            (false, true) => {
                self.head = 0;
                self.tail = 0;
                self.busy = false;
                self.active = false;
                self.enable = false;
            }
            _ => {
                self.busy = false;
            }
        }
    }

    /// Whether this queue's latched conditions currently warrant raising its
    /// interrupt (spec §4.7: every queue's `IE` gates its own source the way
    /// `CQCSR.CIE` does for the command queue).
    pub fn wants_interrupt(&self) -> bool {
        self.ie && (self.memfault || self.secondary_error || self.cmd_ill)
    }
}

const CMD_LEN: u64 = 16;
const FAULT_RECORD_LEN: u64 = 32;
const PR_RECORD_LEN: u64 = 16;

fn entry_addr(base_ppn: u64, index: u32, len: u64) -> u64 {
    base_ppn * 4096 + index as u64 * len
}

/// A decoded command-queue entry's effect on the rest of the core, reported
/// back to the caller (which owns the context cache and the notify/fault
/// plumbing) rather than executed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEffect {
    /// `IOFENCE.C`: if `av`, write `data` to `addr`.
    Fence { av: bool, addr: u64, data: u32 },
    /// `IOTINVAL.{VMA,GVMA}`: accepted as a TLB-invalidation no-op (spec §9:
    /// two-stage translation is wired but never actually caches anything).
    TlbInvalidateNoop,
    Invalidate(InvalidateSelector),
}

const OPCODE_IOTINVAL: u64 = 1;
const OPCODE_IOFENCE: u64 = 2;
const OPCODE_IODIR: u64 = 3;

fn decode_opcode_func(dword0: u64) -> (u64, u64) {
    (dword0 & 0x7F, (dword0 >> 7) & 0x7)
}

/// Decode one 16-byte command (spec §4.6, §6).
fn decode_command(dword0: u64, dword1: u64) -> Result<CommandEffect, CmdFault> {
    let (opcode, func) = decode_opcode_func(dword0);
    match opcode {
        OPCODE_IOFENCE if func == 0 => {
            let av = dword0 & (1 << 10) != 0;
            let data = (dword0 >> 32) as u32;
            Ok(CommandEffect::Fence {
                av,
                addr: dword1,
                data,
            })
        }
        OPCODE_IOTINVAL if func == 0 => Ok(CommandEffect::TlbInvalidateNoop),
        OPCODE_IOTINVAL if func == 1 => {
            let pscv = dword0 & (1 << 10) != 0;
            if pscv {
                Err(CmdFault::Illegal)
            } else {
                Ok(CommandEffect::TlbInvalidateNoop)
            }
        }
        OPCODE_IODIR if func == 0 => {
            let dv = dword0 & (1 << 10) != 0;
            if dv {
                let did = ((dword0 >> 32) & 0x00FF_FFFF) as u32;
                Ok(CommandEffect::Invalidate(InvalidateSelector::Device(did)))
            } else {
                Ok(CommandEffect::Invalidate(InvalidateSelector::All))
            }
        }
        OPCODE_IODIR if func == 1 => {
            let dv = dword0 & (1 << 10) != 0;
            if !dv {
                return Err(CmdFault::Illegal);
            }
            let did = ((dword0 >> 32) & 0x00FF_FFFF) as u32;
            let pid = (dword1 & 0x000F_FFFF) as u32;
            Ok(CommandEffect::Invalidate(InvalidateSelector::DeviceProcess(
                did, pid,
            )))
        }
        _ => Err(CmdFault::Illegal),
    }
}

/// Drain the command queue from `head` to `tail`, applying each command's
/// effect to `cache` directly and returning the `Fence`/`TlbInvalidateNoop`
/// effects the caller (which owns `target_as`) still needs to act on.
///
/// Stops (without advancing `head` past the offending entry) on `CMD_ILL` or
/// a bus fault, per spec §4.6.
pub fn process_cq_tail<B: MemoryBus + ?Sized>(
    state: &mut QueueState,
    bus: &mut B,
    cache: &ContextCache,
) -> (Vec<CommandEffect>, Result<(), CmdFault>) {
    let mut effects = Vec::new();
    if !state.active || state.has_any_error() {
        return (effects, Ok(()));
    }
    let mask = state.index_mask();
    while state.head != state.tail {
        let addr = entry_addr(state.base_ppn, state.head, CMD_LEN);
        let dword0 = match bus.read_u64(addr) {
            Ok(v) => v,
            Err(_) => {
                state.memfault = true;
                return (effects, Ok(()));
            }
        };
        let dword1 = match bus.read_u64(addr + 8) {
            Ok(v) => v,
            Err(_) => {
                state.memfault = true;
                return (effects, Ok(()));
            }
        };

        match decode_command(dword0, dword1) {
            Ok(CommandEffect::Invalidate(selector)) => {
                cache.invalidate(selector);
                effects.push(CommandEffect::Invalidate(selector));
            }
            Ok(effect) => effects.push(effect),
            Err(fault) => {
                match fault {
                    CmdFault::Illegal => state.cmd_ill = true,
                    CmdFault::Timeout => state.secondary_error = true,
                }
                return (effects, Err(fault));
            }
        }

        state.head = (state.head.wrapping_add(1)) & mask;
    }
    (effects, Ok(()))
}

/// The fault-queue/page-request-queue producer side shared by both (spec
/// §4.6, §7): refuse if disabled or erroring, latch overflow if full,
/// otherwise write the record and advance the tail.
fn produce<B: MemoryBus + ?Sized>(
    state: &mut QueueState,
    bus: &mut B,
    record: &[u8],
    record_len: u64,
) -> bool {
    if !state.active || state.has_any_error() {
        return false;
    }
    if state.is_full() {
        state.secondary_error = true;
        return false;
    }
    let addr = entry_addr(state.base_ppn, state.tail, record_len);
    if bus.write_physical(addr, record).is_err() {
        state.memfault = true;
        return false;
    }
    state.tail = (state.tail.wrapping_add(1)) & state.index_mask();
    true
}

/// A fault-queue record (spec §6: `{hdr, iotval, iotval2, ...}`, 32 bytes).
pub struct FaultRecord {
    pub cause: u8,
    pub write: bool,
    pub did: u32,
    pub pid: Option<u32>,
    pub iotval: u64,
    pub iotval2: u64,
}

impl FaultRecord {
    fn to_bytes(&self) -> [u8; 32] {
        let ttype: u64 = if self.write { 1 } else { 0 };
        // The source sets `PV` unconditionally even when `pid` is absent;
        // only the `PID` payload field is conditional (spec §9 open
        // question, resolved in DESIGN.md).
        let pv: u64 = 1;
        let pid = self.pid.unwrap_or(0) as u64;
        let hdr = self.cause as u64
            | (ttype << 12)
            | ((self.did as u64 & 0x00FF_FFFF) << 18)
            | (pv << 42)
            | (pid << 43);

        let mut buf = [0u8; 32];
        buf[0..8].copy_from_slice(&hdr.to_le_bytes());
        buf[8..16].copy_from_slice(&self.iotval.to_le_bytes());
        buf[16..24].copy_from_slice(&self.iotval2.to_le_bytes());
        buf
    }
}

/// Enqueue a fault record (spec §4.6 `fault`). Returns whether it was
/// written; on `false` the caller's translation still reports its own fault
/// to the endpoint (spec §7: best-effort production).
pub fn enqueue_fault<B: MemoryBus + ?Sized>(
    state: &mut QueueState,
    bus: &mut B,
    record: &FaultRecord,
) -> bool {
    produce(state, bus, &record.to_bytes(), FAULT_RECORD_LEN)
}

/// A page-request-queue record (spec §6: `{hdr, payload}`).
pub struct PageRequestRecord {
    pub did: u32,
    pub pid: Option<u32>,
    pub iova_page: u64,
    pub message: bool,
}

impl PageRequestRecord {
    fn to_bytes(&self) -> [u8; 16] {
        let pv: u64 = if self.pid.is_some() { 1 } else { 0 };
        let pid = self.pid.unwrap_or(0) as u64;
        let hdr = (self.did as u64 & 0x00FF_FFFF) | (pv << 24) | (pid << 25);
        let m: u64 = if self.message { 1 } else { 0 };
        let payload = (self.iova_page & !0xFFFu64) | m;

        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&hdr.to_le_bytes());
        buf[8..16].copy_from_slice(&payload.to_le_bytes());
        buf
    }
}

/// Enqueue a page-request record (spec §4.6 `pri`).
pub fn enqueue_page_request<B: MemoryBus + ?Sized>(
    state: &mut QueueState,
    bus: &mut B,
    record: &PageRequestRecord,
) -> bool {
    produce(state, bus, &record.to_bytes(), PR_RECORD_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory::PhysicalMemory;

    fn active_queue(log2size: u32) -> QueueState {
        let mut q = QueueState::default();
        q.apply_control(true, 0, log2size);
        q
    }

    #[test]
    fn control_transition_latches_and_resets() {
        let mut q = QueueState::default();
        q.apply_control(true, 7, 4);
        assert!(q.active);
        assert_eq!(q.base_ppn, 7);
        assert_eq!(q.log2size, 4);

        q.head = 3;
        q.tail = 5;
        q.apply_control(false, 0, 0);
        assert!(!q.active);
        assert_eq!(q.head, 0);
        assert_eq!(q.tail, 0);
    }

    #[test]
    fn control_no_op_clears_busy_only() {
        let mut q = active_queue(4);
        q.busy = true;
        q.head = 2;
        q.apply_control(true, 0, 0); // already active+enable=1, no-op branch
        assert!(!q.busy);
        assert_eq!(q.head, 2);
    }

    #[test]
    fn fence_command_is_decoded_with_av_and_data() {
        let mut q = active_queue(2);
        let mut mem = PhysicalMemory::new(4096);
        let dword0 = OPCODE_IOFENCE | (1 << 10) | (0x5A5Au64 << 32);
        let addr = 0xA0u64;
        mem.write_u64(0, dword0).unwrap();
        mem.write_u64(8, addr).unwrap();
        q.tail = 1;

        let cache = ContextCache::new();
        let (effects, result) = process_cq_tail(&mut q, &mut mem, &cache);
        assert!(result.is_ok());
        assert_eq!(
            effects,
            vec![CommandEffect::Fence {
                av: true,
                addr,
                data: 0x5A5A
            }]
        );
        assert_eq!(q.head, q.tail);
    }

    #[test]
    fn illegal_gvma_with_pscv_stops_without_advancing_head() {
        let mut q = active_queue(2);
        let mut mem = PhysicalMemory::new(4096);
        let dword0 = OPCODE_IOTINVAL | (1 << 7) | (1 << 10); // func=1 (GVMA), PSCV=1
        mem.write_u64(0, dword0).unwrap();
        mem.write_u64(8, 0).unwrap();
        q.tail = 1;

        let cache = ContextCache::new();
        let (_effects, result) = process_cq_tail(&mut q, &mut mem, &cache);
        assert_eq!(result, Err(CmdFault::Illegal));
        assert_eq!(q.head, 0);
    }

    #[test]
    fn fault_queue_full_sets_overflow_and_refuses() {
        let mut q = QueueState::default();
        q.apply_control(true, 0, 1); // size 2
        q.head = 0;
        q.tail = 1; // full: (tail+1)&mask == head
        let mut mem = PhysicalMemory::new(4096);
        let record = FaultRecord {
            cause: 3,
            write: false,
            did: 0x42,
            pid: None,
            iotval: 0x1000,
            iotval2: 0,
        };
        let ok = enqueue_fault(&mut q, &mut mem, &record);
        assert!(!ok);
        assert!(q.secondary_error);
    }

    proptest::proptest! {
        /// Spec §8 invariant 2: the high bits of head/tail above `log2size`
        /// never survive masking, for any latched ring size and any raw
        /// index value software might try to write.
        #[test]
        fn queue_index_mask_bounds_head_and_tail(
            log2size in 0u32..5,
            raw_index in proptest::prelude::any::<u32>(),
        ) {
            let mut q = QueueState::default();
            q.apply_control(true, 0, log2size);
            q.tail = raw_index & q.index_mask();
            proptest::prop_assert!(q.tail <= q.index_mask());
            proptest::prop_assert_eq!(q.index_mask(), (1u32 << log2size) - 1);
            proptest::prop_assert_eq!(q.tail >> log2size, 0);
        }
    }

    #[test]
    fn fault_record_round_trips_through_memory() {
        let mut q = QueueState::default();
        q.apply_control(true, 0, 2);
        let mut mem = PhysicalMemory::new(8192);
        let record = FaultRecord {
            cause: 3,
            write: false,
            did: 0x42,
            pid: None,
            iotval: 0x1234,
            iotval2: 0,
        };
        assert!(enqueue_fault(&mut q, &mut mem, &record));
        let hdr = mem.read_u64(0).unwrap();
        assert_eq!(hdr & 0xFFF, 3);
        assert_eq!(mem.read_u64(8).unwrap(), 0x1234);
    }
}
