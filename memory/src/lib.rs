//! The system-memory port consumed by device models.
//!
//! Device models never touch host memory directly; they go through
//! [`MemoryBus`], so the same model can sit on top of a flat guest-RAM array,
//! a sparse/overlaid address space, or (in tests) a fixed-size byte buffer.

mod physical;

pub use physical::PhysicalMemory;

/// Failure of a bus transaction.
///
/// `Decode` covers addresses the bus understands but cannot service as
/// requested (e.g. a misaligned or partially out-of-range access landing on a
/// structure that requires whole-unit decode); `Bus` covers addresses the bus
/// has no backing for at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("bus decode error at {addr:#x}")]
    Decode { addr: u64 },
    #[error("bus error at {addr:#x}")]
    Bus { addr: u64 },
}

/// A physical (or guest-physical) memory bus.
///
/// Implementors back directory tables, page tables, queue rings, and MSI
/// tables; callers never assume a particular backing store.
pub trait MemoryBus {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) -> Result<(), BusError>;
    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), BusError>;

    fn read_u32(&mut self, paddr: u64) -> Result<u32, BusError> {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self, paddr: u64) -> Result<u64, BusError> {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u32(&mut self, paddr: u64, value: u32) -> Result<(), BusError> {
        self.write_physical(paddr, &value.to_le_bytes())
    }

    fn write_u64(&mut self, paddr: u64, value: u64) -> Result<(), BusError> {
        self.write_physical(paddr, &value.to_le_bytes())
    }
}

impl<B: MemoryBus + ?Sized> MemoryBus for &mut B {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) -> Result<(), BusError> {
        (**self).read_physical(paddr, buf)
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), BusError> {
        (**self).write_physical(paddr, buf)
    }
}
