//! A RISC-V IOMMU translation-engine core: register file, DDT/PDT directory
//! walker, bounded translation-context cache, MSI/MRIF redirector and the
//! three hardware queues (command, fault, page-request), wired together
//! behind the [`Iommu`] façade.

mod cache;
mod cap;
mod config;
mod context;
mod ddtp;
mod device;
mod dispatch;
mod error;
mod iommu;
mod ipsr;
mod msi;
mod queues;
mod regs;
mod translate;
mod walker;

pub use cache::{InvalidateSelector, MAX_ENTRIES};
pub use cap::{CapFlags, Capabilities, PD8};
pub use config::IommuConfig;
pub use context::{Ctx, MsiPtMode, Ta, Tc};
pub use ddtp::DdtpMode;
pub use device::{requester_id, PerDeviceAs};
pub use error::{CmdFault, FaultCause, MsiFaultCause, RegAccessError};
pub use iommu::Iommu;
pub use msi::MsiOutcome;
pub use queues::{CommandEffect, FaultRecord, PageRequestRecord};
pub use regs::offset;
pub use translate::{IoTlbEntry, Perm, TargetBus, TranslateFault};
