// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-processor CPU interface state and the GICC register window.
//!
//! The guest-visible view is the same for both supported models; it is
//! backed by the hardware format of whichever virtualization interface the
//! partition was created with (GICH_VMCR for v2, ICH_VMCR_EL2 for v3),
//! chosen once at construction. The bridge copies fields without
//! interpreting them.

use crate::irq::VgicIrq;
use crate::mmio;
use crate::mmio::Access;
use crate::mmio::MmioError;
use crate::mmio::Region;
use crate::mmio::RegionLen;
use crate::Distributor;
use crate::GicVersion;
use crate::VpIndex;
use crate::WakeSet;
use gicdefs::GiccCtlr;
use gicdefs::GiccRegister;
use gicdefs::GichVmcr;
use gicdefs::IchVmcr;
use gicdefs::GIC_IIDR;
use gicdefs::NR_PRIVATE_IRQS;
use parking_lot::Mutex;
use std::sync::Arc;

/// The guest-visible CPU interface control state.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Vmcr {
    pub ctlr: u32,
    pub pmr: u8,
    pub bpr: u8,
    pub abpr: u8,
}

#[derive(Debug)]
enum VmcrBacking {
    V2(GichVmcr),
    V3(IchVmcr),
}

/// One processor's interface to the virtual GIC: its banked private
/// interrupts, its run lock, and its CPU-interface registers.
pub struct CpuInterface {
    vp: VpIndex,
    privates: Vec<Arc<VgicIrq>>,
    /// Held by the processor's run loop while it executes guest code;
    /// acquired all-or-nothing by the register uaccess paths.
    run_lock: Mutex<()>,
    vmcr: Mutex<VmcrBacking>,
}

impl CpuInterface {
    pub(crate) fn new(vp: VpIndex, version: GicVersion) -> Self {
        Self {
            vp,
            privates: (0..NR_PRIVATE_IRQS)
                .map(|i| Arc::new(VgicIrq::new_private(i)))
                .collect(),
            run_lock: Mutex::new(()),
            vmcr: Mutex::new(match version {
                GicVersion::V2 => VmcrBacking::V2(GichVmcr::new()),
                GicVersion::V3 => VmcrBacking::V3(IchVmcr::new()),
            }),
        }
    }

    pub fn vp(&self) -> VpIndex {
        self.vp
    }

    pub fn run_lock(&self) -> &Mutex<()> {
        &self.run_lock
    }

    pub(crate) fn private_irq(&self, intid: u32) -> Arc<VgicIrq> {
        self.privates[intid as usize].clone()
    }

    pub fn get_vmcr(&self) -> Vmcr {
        match &*self.vmcr.lock() {
            VmcrBacking::V2(hw) => Vmcr {
                ctlr: GiccCtlr::new()
                    .with_enable(hw.grp1_en())
                    .with_eoi_mode(hw.eoi_mode())
                    .into(),
                // The v2 interface implements the upper five priority bits.
                pmr: hw.pmr() << 3,
                bpr: hw.bpr(),
                abpr: hw.abpr(),
            },
            VmcrBacking::V3(hw) => Vmcr {
                ctlr: GiccCtlr::new()
                    .with_enable(hw.veng1())
                    .with_eoi_mode(hw.veoim())
                    .into(),
                pmr: hw.vpmr(),
                bpr: hw.vbpr0(),
                abpr: hw.vbpr1(),
            },
        }
    }

    pub fn set_vmcr(&self, vmcr: Vmcr) {
        let ctlr = GiccCtlr::from(vmcr.ctlr);
        let mut backing = self.vmcr.lock();
        let new = match &*backing {
            VmcrBacking::V2(_) => VmcrBacking::V2(
                GichVmcr::new()
                    .with_grp1_en(ctlr.enable())
                    .with_eoi_mode(ctlr.eoi_mode())
                    .with_pmr(vmcr.pmr >> 3)
                    .with_bpr(vmcr.bpr & 0b111)
                    .with_abpr(vmcr.abpr & 0b111),
            ),
            VmcrBacking::V3(_) => VmcrBacking::V3(
                IchVmcr::new()
                    .with_veng1(ctlr.enable())
                    .with_veoim(ctlr.eoi_mode())
                    .with_vpmr(vmcr.pmr)
                    .with_vbpr0(vmcr.bpr & 0b111)
                    .with_vbpr1(vmcr.abpr & 0b111),
            ),
        };
        *backing = new;
    }
}

impl Distributor {
    /// Reads from the banked CPU-interface register window of `vp`.
    pub fn cpu_read(&self, vp: VpIndex, offset: u64, data: &mut [u8]) -> Result<(), MmioError> {
        let r = mmio::dispatch_read(GICC_REGIONS, self, vp, 0, offset, data);
        if let Err(err) = r {
            tracing::warn!(offset, len = data.len(), ?err, "unhandled gicc read");
        }
        r
    }

    /// Writes to the banked CPU-interface register window of `vp`.
    pub fn cpu_write(&self, vp: VpIndex, offset: u64, data: &[u8]) -> Result<WakeSet, MmioError> {
        let r = mmio::dispatch_write(GICC_REGIONS, self, vp, 0, offset, data);
        if let Err(err) = r {
            tracing::warn!(offset, len = data.len(), ?err, "unhandled gicc write");
        }
        r
    }

    fn vmcr_of(&self, vp: VpIndex) -> Vmcr {
        self.cpu_interfaces()[vp.index() as usize].get_vmcr()
    }

    fn update_vmcr(&self, vp: VpIndex, f: impl FnOnce(&mut Vmcr)) {
        let cpu_interfaces = self.cpu_interfaces();
        let cpu = &cpu_interfaces[vp.index() as usize];
        let mut vmcr = cpu.get_vmcr();
        f(&mut vmcr);
        cpu.set_vmcr(vmcr);
    }
}

/// GICv2 CPU interface window. Every register is forwarded through the VMCR
/// bridge; nothing is interpreted here.
static GICC_REGIONS: &[Region] = &[
    Region {
        offset: GiccRegister::CTLR.0,
        len: RegionLen::Fixed(4),
        access: Access::WORD,
        read: read_gicc_ctlr,
        write: write_gicc_ctlr,
    },
    Region {
        offset: GiccRegister::PMR.0,
        len: RegionLen::Fixed(4),
        access: Access::WORD,
        read: read_gicc_pmr,
        write: write_gicc_pmr,
    },
    Region {
        offset: GiccRegister::BPR.0,
        len: RegionLen::Fixed(4),
        access: Access::WORD,
        read: read_gicc_bpr,
        write: write_gicc_bpr,
    },
    Region {
        offset: GiccRegister::ABPR.0,
        len: RegionLen::Fixed(4),
        access: Access::WORD,
        read: read_gicc_abpr,
        write: write_gicc_abpr,
    },
    Region {
        offset: GiccRegister::IIDR.0,
        len: RegionLen::Fixed(4),
        access: Access::WORD,
        read: read_gicc_iidr,
        write: mmio::write_wi,
    },
];

fn read_gicc_ctlr(dist: &Distributor, vp: VpIndex, _offset: u16, _len: usize) -> u32 {
    dist.vmcr_of(vp).ctlr
}

fn write_gicc_ctlr(dist: &Distributor, vp: VpIndex, _: u16, _: usize, value: u32) -> WakeSet {
    dist.update_vmcr(vp, |vmcr| vmcr.ctlr = value);
    WakeSet::EMPTY
}

fn read_gicc_pmr(dist: &Distributor, vp: VpIndex, _offset: u16, _len: usize) -> u32 {
    dist.vmcr_of(vp).pmr.into()
}

fn write_gicc_pmr(dist: &Distributor, vp: VpIndex, _: u16, _: usize, value: u32) -> WakeSet {
    dist.update_vmcr(vp, |vmcr| vmcr.pmr = value as u8);
    WakeSet::EMPTY
}

fn read_gicc_bpr(dist: &Distributor, vp: VpIndex, _offset: u16, _len: usize) -> u32 {
    dist.vmcr_of(vp).bpr.into()
}

fn write_gicc_bpr(dist: &Distributor, vp: VpIndex, _: u16, _: usize, value: u32) -> WakeSet {
    dist.update_vmcr(vp, |vmcr| vmcr.bpr = value as u8);
    WakeSet::EMPTY
}

fn read_gicc_abpr(dist: &Distributor, vp: VpIndex, _offset: u16, _len: usize) -> u32 {
    dist.vmcr_of(vp).abpr.into()
}

fn write_gicc_abpr(dist: &Distributor, vp: VpIndex, _: u16, _: usize, value: u32) -> WakeSet {
    dist.update_vmcr(vp, |vmcr| vmcr.abpr = value as u8);
    WakeSet::EMPTY
}

fn read_gicc_iidr(_dist: &Distributor, _vp: VpIndex, _offset: u16, _len: usize) -> u32 {
    GIC_IIDR
}
