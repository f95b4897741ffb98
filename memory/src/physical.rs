use crate::{BusError, MemoryBus};

/// A flat, fixed-size memory buffer used to back the integration tests and
/// benches. Real deployments plug in whatever the host emulator's actual
/// guest-RAM abstraction is; this is the `memory` crate's own test double,
/// not part of the port.
pub struct PhysicalMemory {
    bytes: Vec<u8>,
}

impl PhysicalMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn bounds(&self, paddr: u64, len: usize) -> Result<(usize, usize), BusError> {
        let start = usize::try_from(paddr).map_err(|_| BusError::Bus { addr: paddr })?;
        let end = start
            .checked_add(len)
            .ok_or(BusError::Bus { addr: paddr })?;
        if end > self.bytes.len() {
            return Err(BusError::Bus { addr: paddr });
        }
        Ok((start, end))
    }
}

impl MemoryBus for PhysicalMemory {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) -> Result<(), BusError> {
        let (start, end) = self.bounds(paddr, buf.len())?;
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), BusError> {
        let (start, end) = self.bounds(paddr, buf.len())?;
        self.bytes[start..end].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_within_bounds() {
        let mut mem = PhysicalMemory::new(4096);
        mem.write_u64(0x100, 0xDEAD_BEEF_CAFE_F00D).unwrap();
        assert_eq!(mem.read_u64(0x100).unwrap(), 0xDEAD_BEEF_CAFE_F00D);
    }

    #[test]
    fn out_of_range_is_a_bus_error() {
        let mut mem = PhysicalMemory::new(16);
        let mut buf = [0u8; 8];
        assert_eq!(
            mem.read_physical(12, &mut buf),
            Err(BusError::Bus { addr: 12 })
        );
    }

    proptest::proptest! {
        /// Any in-bounds write, read back at the same address and width,
        /// returns exactly what was written.
        #[test]
        fn write_then_read_round_trips(
            addr in 0u64..4096,
            value in proptest::prelude::any::<u64>(),
        ) {
            let mut mem = PhysicalMemory::new(8192);
            mem.write_u64(addr, value).unwrap();
            proptest::prop_assert_eq!(mem.read_u64(addr).unwrap(), value);
        }
    }
}
