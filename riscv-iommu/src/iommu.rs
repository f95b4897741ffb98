//! The top-level `Iommu`: wires the register file, dispatcher, directory
//! walker, context cache, queues, MSI redirector and per-device address
//! spaces together behind the three locks spec §5 describes.

use std::sync::{Arc, Mutex, Weak};

use memory::MemoryBus;

use crate::cache::ContextCache;
use crate::cap::Capabilities;
use crate::config::IommuConfig;
use crate::context::Ctx;
use crate::ddtp::{DdtpMode, DDTP_ACCEPT_MASK, DDTP_BUSY_BIT};
use crate::device::PerDeviceAs;
use crate::dispatch::{self, Action};
use crate::error::{FaultCause, RegAccessError};
use crate::ipsr::{self, source};
use crate::msi;
use crate::queues::{self, csr_bit, CommandEffect, FaultRecord, PageRequestRecord, QueueState};
use crate::regs::{offset, RegisterFile};
use crate::translate::{self, IoTlbEntry, Perm, TranslateFault};

/// Queue state and the last-accepted `DDTP` snapshot, guarded by `core_lock`
/// (spec §5).
struct CoreState {
    ddtp_mode: DdtpMode,
    ddtp_ppn: u64,
    ddtp_raw: u64,
    cq: QueueState,
    fq: QueueState,
    pq: QueueState,
    ipsr: u32,
}

impl Default for CoreState {
    fn default() -> Self {
        Self {
            ddtp_mode: DdtpMode::Off,
            ddtp_ppn: 0,
            ddtp_raw: 0,
            cq: QueueState::default(),
            fq: QueueState::default(),
            pq: QueueState::default(),
            ipsr: 0,
        }
    }
}

pub struct Iommu {
    regs: spin::Mutex<RegisterFile>,
    caps: Capabilities,
    config: IommuConfig,
    core: Mutex<CoreState>,
    ctx_cache: ContextCache,
    devices: Mutex<Vec<Arc<PerDeviceAs>>>,
    /// Physical memory backing DDT/PDT walks, MSI page tables and the three
    /// queues. A `TargetBus::Trap`-tagged [`IoTlbEntry`] still resolves here;
    /// it only tells the caller to route the write through [`Self::write_trap`]
    /// instead of performing it directly (spec §4.4, §4.5).
    target_as: Mutex<Box<dyn MemoryBus + Send>>,
    notify: Mutex<Box<dyn FnMut(u8) + Send>>,
}

impl Iommu {
    pub fn new(
        config: IommuConfig,
        target_as: Box<dyn MemoryBus + Send>,
        notify: Box<dyn FnMut(u8) + Send>,
    ) -> Arc<Self> {
        let caps = Capabilities::new(1, config.msi_flat, config.msi_mrif, config.phys_bits);
        let mut regs = RegisterFile::new();
        regs.seed(offset::CAP, 8, caps.to_raw());
        regs.set_read_only(offset::CAP, 8, u64::MAX);

        // DDTP: BUSY and the reserved bits between MODE and PPN are not
        // driver-writable; the accepted value is re-seeded by `process_ddtp`.
        regs.set_read_only(offset::DDTP, 8, DDTP_BUSY_BIT | !DDTP_ACCEPT_MASK);

        // `*H` on the command queue and `*T` on the fault/page-request queues
        // are IOMMU-owned producer/consumer pointers; the driver only ever
        // reads them and writes the other pointer (`CQT`, `FQH`, `PQH`).
        regs.set_read_only(offset::CQH, 4, u64::MAX);
        regs.set_read_only(offset::FQT, 4, u64::MAX);
        regs.set_read_only(offset::PQT, 4, u64::MAX);

        // FCTL: BE and WSI are not driver-writable (spec §6).
        regs.set_read_only(offset::FCTL, 4, ipsr::FCTL_BE | ipsr::FCTL_WSI);

        for (csr_offset, _) in [
            (offset::CQCSR, ()),
            (offset::FQCSR, ()),
            (offset::PQCSR, ()),
        ] {
            regs.set_read_only(csr_offset, 4, csr_bit::ACTIVE | csr_bit::BUSY);
            regs.set_w1c(
                csr_offset,
                4,
                csr_bit::MEMFAULT | csr_bit::CMD_TO_OR_OVERFLOW | csr_bit::CMD_ILL,
            );
        }
        regs.set_w1c(offset::IPSR, 4, 0xFFFF_FFFF);

        Arc::new(Self {
            regs: spin::Mutex::new(regs),
            caps,
            config,
            core: Mutex::new(CoreState::default()),
            ctx_cache: ContextCache::new(),
            devices: Mutex::new(Vec::new()),
            target_as: Mutex::new(target_as),
            notify: Mutex::new(notify),
        })
    }

    pub fn read(&self, offset: u64, width: usize) -> Result<u64, RegAccessError> {
        self.regs.lock().read(offset, width)
    }

    /// Apply a driver MMIO write: update the register array under
    /// `regs_lock`, then (after releasing it) run the matching dispatcher
    /// action under `core_lock` (spec §4.1, §5).
    pub fn write(&self, offset: u64, data: u64, width: usize) -> Result<(), RegAccessError> {
        {
            let mut regs = self.regs.lock();
            regs.write(offset, data, width)?;
        }

        let action = dispatch::decode(offset);
        if let Some((busy_off, busy_width, bit)) = dispatch::busy_latch(action) {
            self.regs.lock().set_bits(busy_off, busy_width, bit);
        }

        match action {
            Action::ProcessDdtp => self.process_ddtp(),
            Action::ProcessCqTail => self.process_cq_tail(),
            Action::ProcessCqControl => self.process_cq_control(),
            Action::ProcessFqControl => self.process_fq_control(),
            Action::ProcessPqControl => self.process_pq_control(),
            Action::ProcessFqHead => self.process_fq_head(),
            Action::ProcessPqHead => self.process_pq_head(),
            Action::UpdateIpsr => self.process_update_ipsr(data as u32),
            Action::None => {}
        }
        Ok(())
    }

    fn process_ddtp(&self) {
        let mut core = self.core.lock().expect("core_lock poisoned");
        let raw = self.regs.lock().raw_read(offset::DDTP, 8);
        let requested = DdtpMode::from_bits(raw);

        match requested {
            Some(mode) if DdtpMode::transition_allowed(core.ddtp_mode, mode) => {
                let sanitized = raw & DDTP_ACCEPT_MASK;
                core.ddtp_mode = mode;
                core.ddtp_ppn = (sanitized >> 10) & 0x000F_FFFF_FFFF_FFFF;
                core.ddtp_raw = sanitized;
                self.regs.lock().seed(offset::DDTP, 8, sanitized);
            }
            Some(mode) => {
                tracing::warn!(
                    from = ?core.ddtp_mode,
                    to = ?mode,
                    "rejected illegal DDTP mode transition"
                );
                self.regs.lock().seed(offset::DDTP, 8, core.ddtp_raw);
            }
            None => {
                tracing::warn!(bits = raw & 0xF, "rejected unknown DDTP mode encoding");
                self.regs.lock().seed(offset::DDTP, 8, core.ddtp_raw);
            }
        }
        self.regs.lock().clear_bits(offset::DDTP, 8, DDTP_BUSY_BIT);
    }

    fn ring_geometry(&self, base_offset: u64) -> (u64, u32) {
        let raw = self.regs.lock().raw_read(base_offset, 8);
        let ppn = (raw >> 10) & 0x000F_FFFF_FFFF_FFFF;
        let log2size = (raw & 0x1F) as u32;
        (ppn, log2size)
    }

    fn sync_csr(&self, csr_offset: u64, state: &QueueState) {
        let mut bits = 0u64;
        if state.enable {
            bits |= csr_bit::ENABLE;
        }
        if state.ie {
            bits |= csr_bit::IE;
        }
        if state.active {
            bits |= csr_bit::ACTIVE;
        }
        if state.busy {
            bits |= csr_bit::BUSY;
        }
        if state.memfault {
            bits |= csr_bit::MEMFAULT;
        }
        if state.secondary_error {
            bits |= csr_bit::CMD_TO_OR_OVERFLOW;
        }
        if state.cmd_ill {
            bits |= csr_bit::CMD_ILL;
        }
        let mut regs = self.regs.lock();
        let driver_bits = regs.raw_read(csr_offset, 4) & (csr_bit::ENABLE | csr_bit::IE);
        regs.seed(csr_offset, 4, bits | driver_bits);
    }

    fn raise_if_edge(&self, source: u32, was_pending: bool, now_pending: bool) {
        if was_pending || !now_pending {
            return;
        }
        let fctl = self.regs.lock().raw_read(offset::FCTL, 4);
        let ivec = self.regs.lock().raw_read(offset::IVEC, 8);
        if fctl & ipsr::FCTL_WSI != 0 {
            return;
        }
        let vector = ipsr::ivec_vector(ivec, source);
        (self.notify.lock().expect("notify lock poisoned"))(vector);
    }

    fn process_cq_control(&self) {
        let mut core = self.core.lock().expect("core_lock poisoned");
        let raw = self.regs.lock().raw_read(offset::CQCSR, 4);
        let (ppn, log2size) = self.ring_geometry(offset::CQB);
        let requested_enable = raw & csr_bit::ENABLE != 0;
        let was_pending = core.cq.wants_interrupt();
        core.cq.ie = raw & csr_bit::IE != 0;
        core.cq.apply_control(requested_enable, ppn, log2size);
        let now_pending = core.cq.wants_interrupt();
        self.sync_csr(offset::CQCSR, &core.cq);
        self.regs.lock().clear_bits(offset::CQCSR, 4, csr_bit::BUSY);
        self.raise_if_edge(source::CQ, was_pending, now_pending);
    }

    fn process_fq_control(&self) {
        let mut core = self.core.lock().expect("core_lock poisoned");
        let raw = self.regs.lock().raw_read(offset::FQCSR, 4);
        let (ppn, log2size) = self.ring_geometry(offset::FQB);
        let requested_enable = raw & csr_bit::ENABLE != 0;
        let was_pending = core.fq.wants_interrupt();
        core.fq.ie = raw & csr_bit::IE != 0;
        core.fq.apply_control(requested_enable, ppn, log2size);
        let now_pending = core.fq.wants_interrupt();
        self.sync_csr(offset::FQCSR, &core.fq);
        self.regs.lock().clear_bits(offset::FQCSR, 4, csr_bit::BUSY);
        self.raise_if_edge(source::FQ, was_pending, now_pending);
    }

    fn process_pq_control(&self) {
        let mut core = self.core.lock().expect("core_lock poisoned");
        let raw = self.regs.lock().raw_read(offset::PQCSR, 4);
        let (ppn, log2size) = self.ring_geometry(offset::PQB);
        let requested_enable = raw & csr_bit::ENABLE != 0;
        let was_pending = core.pq.wants_interrupt();
        core.pq.ie = raw & csr_bit::IE != 0;
        core.pq.apply_control(requested_enable, ppn, log2size);
        let now_pending = core.pq.wants_interrupt();
        self.sync_csr(offset::PQCSR, &core.pq);
        self.regs.lock().clear_bits(offset::PQCSR, 4, csr_bit::BUSY);
        self.raise_if_edge(source::PQ, was_pending, now_pending);
    }

    /// Software acknowledges consuming fault-queue records up to `FQH`.
    fn process_fq_head(&self) {
        let mut core = self.core.lock().expect("core_lock poisoned");
        let head = (self.regs.lock().raw_read(offset::FQH, 4) & 0xFFFF_FFFF) as u32;
        core.fq.head = head & core.fq.index_mask();
        // Spec §8 invariant 2: bits above `log2size` always read back as zero.
        self.regs.lock().seed(offset::FQH, 4, core.fq.head as u64);
    }

    fn process_pq_head(&self) {
        let mut core = self.core.lock().expect("core_lock poisoned");
        let head = (self.regs.lock().raw_read(offset::PQH, 4) & 0xFFFF_FFFF) as u32;
        core.pq.head = head & core.pq.index_mask();
        self.regs.lock().seed(offset::PQH, 4, core.pq.head as u64);
    }

    fn process_cq_tail(&self) {
        let tail = (self.regs.lock().raw_read(offset::CQT, 4) & 0xFFFF_FFFF) as u32;
        let mut core = self.core.lock().expect("core_lock poisoned");
        core.cq.tail = tail & core.cq.index_mask();
        let was_pending = core.cq.wants_interrupt();

        let mut target = self.target_as.lock().expect("target_as lock poisoned");
        let (effects, _result) = queues::process_cq_tail(&mut core.cq, &mut **target, &self.ctx_cache);
        for effect in effects {
            if let CommandEffect::Fence { av: true, addr, data } = effect {
                // Spec §4.6: "on bus failure set `CQMF`" for the IOFENCE.C
                // deferred write.
                if target.write_u32(addr, data).is_err() {
                    core.cq.memfault = true;
                }
            }
        }
        drop(target);

        let now_pending = core.cq.wants_interrupt();
        let mut regs = self.regs.lock();
        regs.seed(offset::CQH, 4, core.cq.head as u64);
        // Spec §8 invariant 2: bits above `log2size` always read back as zero.
        regs.seed(offset::CQT, 4, core.cq.tail as u64);
        drop(regs);
        self.sync_csr(offset::CQCSR, &core.cq);
        self.raise_if_edge(source::CQ, was_pending, now_pending);
    }

    fn process_update_ipsr(&self, write_data: u32) {
        let mut core = self.core.lock().expect("core_lock poisoned");
        let old = core.ipsr;
        let cq_wants = core.cq.wants_interrupt();
        let fq_wants = core.fq.wants_interrupt();
        let pq_wants = core.pq.wants_interrupt();
        let next = ipsr::update_ipsr(old, write_data, |src| match src {
            source::CQ => cq_wants,
            source::FQ => fq_wants,
            source::PQ => pq_wants,
            _ => false,
        });
        core.ipsr = next;
        self.regs.lock().seed(offset::IPSR, 4, next as u64);
    }

    /// The endpoint entry point (spec §6): translate `iova` for
    /// `{devid, process_id}` under `perm`, fetching (and caching) the
    /// translation context as needed.
    pub fn translate(
        &self,
        devid: u32,
        process_id: u32,
        iova: u64,
        perm: Perm,
    ) -> Result<IoTlbEntry, FaultCause> {
        let (mode, ddtp_ppn) = {
            let core = self.core.lock().expect("core_lock poisoned");
            (core.ddtp_mode, core.ddtp_ppn)
        };

        let fetch_result = self.ctx_cache.get_or_fetch(devid, process_id, || {
            let mut bus = self.target_as.lock().expect("target_as lock poisoned");
            crate::walker::ctx_fetch(
                &mut **bus,
                mode,
                ddtp_ppn,
                devid,
                process_id,
                &self.caps,
                self.config.enable_msi,
            )
        });

        let (ctx, walk_fault) = match fetch_result {
            Ok((ctx, _snapshot)) => (ctx, None),
            Err(walk_fault) => {
                let ctx = Ctx {
                    devid,
                    process_id,
                    tc: walk_fault.tc,
                    ta: crate::context::Ta::empty(),
                    msiptp_raw: 0,
                    msi_addr_mask: 0,
                    msi_addr_pattern: 0,
                };
                (ctx, Some(walk_fault.cause))
            }
        };

        match translate::translate(&ctx, iova, perm, walk_fault) {
            // A `Trap`-targeted entry tells the caller to route the access to
            // `write_trap` instead of the target bus; nothing to do here.
            Ok(entry) => Ok(entry),
            Err(TranslateFault::Fault { write, cause }) => {
                self.report_fault(&ctx, devid, process_id, iova, write, cause);
                Err(cause)
            }
            Err(TranslateFault::PageRequest { iova_page, cause }) => {
                self.report_page_request(&ctx, devid, process_id, iova_page);
                Err(cause)
            }
        }
    }

    /// Deliver a deferred write the translation engine redirected to
    /// `trap_as` (spec §4.4 step 1, §4.5).
    pub fn write_trap(&self, devid: u32, process_id: u32, gpa: u64, data: u32) {
        let (mode, ddtp_ppn) = {
            let core = self.core.lock().expect("core_lock poisoned");
            (core.ddtp_mode, core.ddtp_ppn)
        };

        let ctx = match self
            .ctx_cache
            .get_or_fetch(devid, process_id, || {
                let mut bus = self.target_as.lock().expect("target_as lock poisoned");
                crate::walker::ctx_fetch(
                    &mut **bus,
                    mode,
                    ddtp_ppn,
                    devid,
                    process_id,
                    &self.caps,
                    self.config.enable_msi,
                )
            })
            .map(|(ctx, _)| ctx)
        {
            Ok(ctx) => ctx,
            Err(_) => return,
        };

        let mut bus = self.target_as.lock().expect("target_as lock poisoned");
        if let Err(cause) = msi::redirect(&mut **bus, &ctx, gpa, data) {
            drop(bus);
            let dtf_applies = ctx.tc.contains(crate::context::Tc::DTF) && cause.suppressible_by_dtf();
            if !dtf_applies {
                self.report_fault_raw(&ctx, devid, process_id, gpa, true, cause.cause_code());
            }
        }
    }

    fn dtf_suppresses(&self, ctx: &Ctx, cause: FaultCause) -> bool {
        ctx.tc.contains(crate::context::Tc::DTF) && cause.suppressible_by_dtf()
    }

    fn report_fault(
        &self,
        ctx: &Ctx,
        devid: u32,
        process_id: u32,
        iova: u64,
        write: bool,
        cause: FaultCause,
    ) {
        if self.dtf_suppresses(ctx, cause) {
            return;
        }
        self.report_fault_raw(ctx, devid, process_id, iova, write, cause.cause_code());
    }

    /// Shared fault-queue producer path, keyed by a raw wire cause code so it
    /// can serve both `FaultCause` and `MsiFaultCause` callers (spec §7).
    fn report_fault_raw(
        &self,
        ctx: &Ctx,
        devid: u32,
        process_id: u32,
        iova: u64,
        write: bool,
        cause_code: u8,
    ) {
        let mut core = self.core.lock().expect("core_lock poisoned");
        let was_pending = core.fq.wants_interrupt();
        let record = FaultRecord {
            cause: cause_code,
            write,
            did: devid,
            pid: ctx.tc.contains(crate::context::Tc::PDTV).then_some(process_id),
            iotval: iova,
            iotval2: iova,
        };
        let mut bus = self.target_as.lock().expect("target_as lock poisoned");
        queues::enqueue_fault(&mut core.fq, &mut **bus, &record);
        drop(bus);
        let now_pending = core.fq.wants_interrupt();
        self.regs.lock().seed(offset::FQT, 4, core.fq.tail as u64);
        self.sync_csr(offset::FQCSR, &core.fq);
        drop(core);
        self.raise_if_edge(source::FQ, was_pending, now_pending);
    }

    fn report_page_request(&self, ctx: &Ctx, devid: u32, process_id: u32, iova_page: u64) {
        let mut core = self.core.lock().expect("core_lock poisoned");
        let was_pending = core.pq.wants_interrupt();
        let record = PageRequestRecord {
            did: devid,
            pid: ctx.tc.contains(crate::context::Tc::PDTV).then_some(process_id),
            iova_page,
            message: true,
        };
        let mut bus = self.target_as.lock().expect("target_as lock poisoned");
        queues::enqueue_page_request(&mut core.pq, &mut **bus, &record);
        drop(bus);
        let now_pending = core.pq.wants_interrupt();
        self.regs.lock().seed(offset::PQT, 4, core.pq.tail as u64);
        self.sync_csr(offset::PQCSR, &core.pq);
        drop(core);
        self.raise_if_edge(source::PQ, was_pending, now_pending);
    }

    /// Find (or create) the per-device address space for `requester_id`
    /// (spec §3: "created on first lookup, lives for the IOMMU's lifetime").
    pub fn device_for(self: &Arc<Self>, requester_id: u16) -> Arc<PerDeviceAs> {
        let mut devices = self.devices.lock().expect("devices lock poisoned");
        if let Some(existing) = devices.iter().find(|d| d.requester_id() == requester_id) {
            return existing.clone();
        }
        let owner: Weak<Iommu> = Arc::downgrade(self);
        let dev = PerDeviceAs::new(requester_id, owner);
        devices.push(dev.clone());
        dev
    }
}
