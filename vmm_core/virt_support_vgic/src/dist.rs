// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The virtual distributor: VM-wide interrupt routing state and the GICv2
//! distributor register window.

use crate::cpuif::CpuInterface;
use crate::device::VmConfig;
use crate::irq::IrqState;
use crate::irq::Trigger;
use crate::irq::VgicIrq;
use crate::mmio;
use crate::mmio::Access;
use crate::mmio::MmioError;
use crate::mmio::Region;
use crate::mmio::RegionLen;
use crate::GicVersion;
use crate::VpIndex;
use crate::WakeSet;
use gicdefs::GicdCtlr;
use gicdefs::GicdRegister;
use gicdefs::GicdTyper;
use gicdefs::GIC_IIDR;
use gicdefs::NR_PRIVATE_IRQS;
use gicdefs::NR_SGIS;
use parking_lot::Mutex;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;

/// The VM-wide virtual GIC distributor.
pub struct Distributor {
    version: GicVersion,
    /// Global delivery gate, mirrored out of GICD_CTLR for lock-free reads
    /// on the interrupt paths.
    enabled: AtomicBool,
    /// Window placement and the configuration state machine, under the VM
    /// lock. Never taken while an interrupt record is locked.
    pub(crate) config: Mutex<VmConfig>,
    cpu_interfaces: RwLock<Vec<Arc<CpuInterface>>>,
    /// Shared peripheral interrupts, intid 32 and up. Set once when the
    /// distributor is initialized.
    spis: OnceLock<Vec<Arc<VgicIrq>>>,
}

impl Distributor {
    pub fn new(version: GicVersion) -> Self {
        Self {
            version,
            enabled: AtomicBool::new(false),
            config: Mutex::new(VmConfig::new()),
            cpu_interfaces: RwLock::new(Vec::new()),
            spis: OnceLock::new(),
        }
    }

    pub fn version(&self) -> GicVersion {
        self.version
    }

    /// The configured total interrupt count, once initialized.
    pub fn nr_irqs(&self) -> Option<u32> {
        self.spis.get().map(|s| NR_PRIVATE_IRQS + s.len() as u32)
    }

    pub(crate) fn spis(&self) -> Option<&[Arc<VgicIrq>]> {
        self.spis.get().map(|v| v.as_slice())
    }

    pub(crate) fn set_spis(&self, spis: Vec<Arc<VgicIrq>>) {
        self.spis
            .set(spis)
            .expect("spi array allocated exactly once");
    }

    pub(crate) fn cpu_interfaces(&self) -> RwLockReadGuard<'_, Vec<Arc<CpuInterface>>> {
        self.cpu_interfaces.read()
    }

    pub(crate) fn cpu_interfaces_mut(&self) -> &RwLock<Vec<Arc<CpuInterface>>> {
        &self.cpu_interfaces
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Turns the distributor on. A false-to-true transition makes any
    /// already pending-and-enabled interrupt deliverable, so every
    /// processor must be kicked to notice.
    pub fn enable_distributor(&self) -> WakeSet {
        if !self.enabled.swap(true, Ordering::Relaxed) {
            tracing::debug!("distributor enabled");
            WakeSet::all(self.cpu_interfaces().len() as u32)
        } else {
            WakeSet::EMPTY
        }
    }

    pub fn disable_distributor(&self) {
        if self.enabled.swap(false, Ordering::Relaxed) {
            tracing::debug!("distributor disabled");
        }
    }

    /// Reads from the distributor register window. `offset` is relative to
    /// the window base; the trap layer has already subtracted it.
    pub fn read(&self, vp: VpIndex, offset: u64, data: &mut [u8]) -> Result<(), MmioError> {
        let r = match self.nr_irqs() {
            Some(nr_irqs) => mmio::dispatch_read(GICD_REGIONS, self, vp, nr_irqs, offset, data),
            None => Err(MmioError::InvalidRegister),
        };
        if let Err(err) = r {
            tracing::warn!(offset, len = data.len(), ?err, "unhandled gicd read");
        }
        r
    }

    /// Writes to the distributor register window, returning the processors
    /// made runnable by the access.
    pub fn write(&self, vp: VpIndex, offset: u64, data: &[u8]) -> Result<WakeSet, MmioError> {
        let r = match self.nr_irqs() {
            Some(nr_irqs) => mmio::dispatch_write(GICD_REGIONS, self, vp, nr_irqs, offset, data),
            None => Err(MmioError::InvalidRegister),
        };
        if let Err(err) = r {
            tracing::warn!(offset, len = data.len(), ?err, "unhandled gicd write");
        }
        r
    }

    /// Sets or clears the line level of shared peripheral interrupt `intid`,
    /// as a virtual device would. Returns the processors to kick.
    pub fn set_spi(&self, intid: u32, high: bool) -> WakeSet {
        let Some(nr_irqs) = self.nr_irqs() else {
            return WakeSet::EMPTY;
        };
        if !(NR_PRIVATE_IRQS..nr_irqs).contains(&intid) {
            tracing::warn!(intid, "spi out of range");
            return WakeSet::EMPTY;
        }
        let irq = self.get_irq(VpIndex::new(0), intid);
        let mut state = irq.lock();
        if high {
            if !state.pending {
                tracing::debug!(intid = irq.intid(), "spi raised");
            }
            state.pending = true;
            self.wake_for(VpIndex::new(0), intid, &state)
        } else {
            // Lowering the line only retracts a level-triggered interrupt.
            if state.trigger == Trigger::Level {
                state.pending = false;
            }
            WakeSet::EMPTY
        }
    }

    /// The processor to kick if `state` is now deliverable. Private
    /// interrupts belong to the bank owner `vp`; shared interrupts go to the
    /// cached routing target.
    pub(crate) fn wake_for(&self, vp: VpIndex, intid: u32, state: &IrqState) -> WakeSet {
        let mut wake = WakeSet::EMPTY;
        if self.enabled() && state.enabled && state.pending {
            let target = if intid < NR_PRIVATE_IRQS {
                Some(vp)
            } else {
                state.target_vp
            };
            if let Some(target) = target {
                wake.insert(target);
            }
        }
        wake
    }

    fn cpu_mask(&self) -> u8 {
        ((1u16 << self.cpu_interfaces().len().min(8)) - 1) as u8
    }
}

/// GICv2 distributor window, sorted by offset.
static GICD_REGIONS: &[Region] = &[
    Region {
        offset: GicdRegister::CTLR.0,
        len: RegionLen::Fixed(4),
        access: Access::WORD,
        read: read_ctlr,
        write: write_ctlr,
    },
    Region {
        offset: GicdRegister::TYPER.0,
        len: RegionLen::Fixed(4),
        access: Access::WORD,
        read: read_typer,
        write: mmio::write_wi,
    },
    Region {
        offset: GicdRegister::IIDR.0,
        len: RegionLen::Fixed(4),
        access: Access::WORD,
        read: read_iidr,
        write: mmio::write_wi,
    },
    // This model keeps every interrupt in group one.
    Region {
        offset: GicdRegister::IGROUPR0.0,
        len: RegionLen::PerIrq(1),
        access: Access::WORD,
        read: mmio::read_rao,
        write: mmio::write_wi,
    },
    Region {
        offset: GicdRegister::ISENABLER0.0,
        len: RegionLen::PerIrq(1),
        access: Access::WORD,
        read: read_enable,
        write: write_set_enable,
    },
    Region {
        offset: GicdRegister::ICENABLER0.0,
        len: RegionLen::PerIrq(1),
        access: Access::WORD,
        read: read_enable,
        write: write_clear_enable,
    },
    Region {
        offset: GicdRegister::ISPENDR0.0,
        len: RegionLen::PerIrq(1),
        access: Access::WORD,
        read: read_pending,
        write: write_set_pending,
    },
    Region {
        offset: GicdRegister::ICPENDR0.0,
        len: RegionLen::PerIrq(1),
        access: Access::WORD,
        read: read_pending,
        write: write_clear_pending,
    },
    Region {
        offset: GicdRegister::ISACTIVER0.0,
        len: RegionLen::PerIrq(1),
        access: Access::WORD,
        read: read_active,
        write: write_set_active,
    },
    Region {
        offset: GicdRegister::ICACTIVER0.0,
        len: RegionLen::PerIrq(1),
        access: Access::WORD,
        read: read_active,
        write: write_clear_active,
    },
    Region {
        offset: GicdRegister::IPRIORITYR0.0,
        len: RegionLen::PerIrq(8),
        access: Access::BYTE_WORD,
        read: read_priority,
        write: write_priority,
    },
    Region {
        offset: GicdRegister::ITARGETSR0.0,
        len: RegionLen::PerIrq(8),
        access: Access::BYTE_WORD,
        read: read_target,
        write: write_target,
    },
    Region {
        offset: GicdRegister::ICFGR0.0,
        len: RegionLen::PerIrq(2),
        access: Access::WORD,
        read: read_config,
        write: write_config,
    },
    Region {
        offset: GicdRegister::SGIR.0,
        len: RegionLen::Fixed(4),
        access: Access::WORD,
        read: mmio::read_raz,
        write: write_sgir,
    },
    Region {
        offset: GicdRegister::CPENDSGIR0.0,
        len: RegionLen::Fixed(16),
        access: Access::BYTE_WORD,
        read: read_sgi_sources,
        write: write_clear_sgi_sources,
    },
    Region {
        offset: GicdRegister::SPENDSGIR0.0,
        len: RegionLen::Fixed(16),
        access: Access::BYTE_WORD,
        read: read_sgi_sources,
        write: write_set_sgi_sources,
    },
];

fn read_ctlr(dist: &Distributor, _vp: VpIndex, _offset: u16, _len: usize) -> u32 {
    GicdCtlr::new().with_enable(dist.enabled()).into()
}

fn write_ctlr(dist: &Distributor, _vp: VpIndex, _offset: u16, _len: usize, value: u32) -> WakeSet {
    if GicdCtlr::from(value).enable() {
        dist.enable_distributor()
    } else {
        dist.disable_distributor();
        WakeSet::EMPTY
    }
}

fn read_typer(dist: &Distributor, _vp: VpIndex, _offset: u16, _len: usize) -> u32 {
    let nr_irqs = dist.nr_irqs().expect("initialized before register access");
    let nr_cpus = dist.cpu_interfaces().len() as u8;
    GicdTyper::new()
        .with_it_lines_number((nr_irqs / 32 - 1) as u8)
        .with_cpu_number(nr_cpus - 1)
        .into()
}

fn read_iidr(_dist: &Distributor, _vp: VpIndex, _offset: u16, _len: usize) -> u32 {
    GIC_IIDR
}

/// Reads one state bit per interrupt.
fn read_bits(
    dist: &Distributor,
    vp: VpIndex,
    offset: u16,
    len: usize,
    bit: fn(&IrqState) -> bool,
) -> u32 {
    let (first, count) = mmio::irq_span(1, offset, len);
    let mut value = 0;
    for i in 0..count {
        let irq = dist.get_irq(vp, first + i);
        if bit(&irq.lock()) {
            value |= 1 << i;
        }
    }
    value
}

fn read_enable(dist: &Distributor, vp: VpIndex, offset: u16, len: usize) -> u32 {
    read_bits(dist, vp, offset, len, |s| s.enabled)
}

fn read_pending(dist: &Distributor, vp: VpIndex, offset: u16, len: usize) -> u32 {
    read_bits(dist, vp, offset, len, |s| s.pending)
}

fn read_active(dist: &Distributor, vp: VpIndex, offset: u16, len: usize) -> u32 {
    read_bits(dist, vp, offset, len, |s| s.active)
}

/// Applies a set-type or clear-type register write: only the interrupts
/// whose bit is one are touched, so writing zero never changes state.
fn for_set_bits(
    dist: &Distributor,
    vp: VpIndex,
    offset: u16,
    len: usize,
    value: u32,
    mut f: impl FnMut(VpIndex, u32, &mut IrqState) -> bool,
) -> WakeSet {
    let (first, count) = mmio::irq_span(1, offset, len);
    let mut wake = WakeSet::EMPTY;
    for i in 0..count {
        if value & (1 << i) == 0 {
            continue;
        }
        let intid = first + i;
        let irq = dist.get_irq(vp, intid);
        let mut state = irq.lock();
        if f(vp, intid, &mut state) {
            wake.merge(dist.wake_for(vp, intid, &state));
        }
    }
    wake
}

fn write_set_enable(
    dist: &Distributor,
    vp: VpIndex,
    offset: u16,
    len: usize,
    value: u32,
) -> WakeSet {
    for_set_bits(dist, vp, offset, len, value, |_, _, state| {
        state.enabled = true;
        true
    })
}

fn write_clear_enable(
    dist: &Distributor,
    vp: VpIndex,
    offset: u16,
    len: usize,
    value: u32,
) -> WakeSet {
    for_set_bits(dist, vp, offset, len, value, |_, intid, state| {
        // SGIs are permanently enabled.
        if intid >= NR_SGIS {
            state.enabled = false;
        }
        false
    })
}

fn write_set_pending(
    dist: &Distributor,
    vp: VpIndex,
    offset: u16,
    len: usize,
    value: u32,
) -> WakeSet {
    for_set_bits(dist, vp, offset, len, value, |vp, intid, state| {
        if intid < NR_SGIS {
            // A guest-pended SGI is accounted to the writing processor so
            // the source bookkeeping stays coherent.
            state.add_sources(1 << vp.index());
        } else {
            state.pending = true;
        }
        true
    })
}

fn write_clear_pending(
    dist: &Distributor,
    vp: VpIndex,
    offset: u16,
    len: usize,
    value: u32,
) -> WakeSet {
    for_set_bits(dist, vp, offset, len, value, |_, intid, state| {
        if intid < NR_SGIS {
            state.remove_sources(!0);
        } else {
            state.pending = false;
        }
        false
    })
}

fn write_set_active(
    dist: &Distributor,
    vp: VpIndex,
    offset: u16,
    len: usize,
    value: u32,
) -> WakeSet {
    for_set_bits(dist, vp, offset, len, value, |_, _, state| {
        state.active = true;
        false
    })
}

fn write_clear_active(
    dist: &Distributor,
    vp: VpIndex,
    offset: u16,
    len: usize,
    value: u32,
) -> WakeSet {
    for_set_bits(dist, vp, offset, len, value, |_, _, state| {
        state.active = false;
        false
    })
}

fn read_priority(dist: &Distributor, vp: VpIndex, offset: u16, len: usize) -> u32 {
    let (first, count) = mmio::irq_span(8, offset, len);
    let mut value = 0;
    for i in 0..count {
        let irq = dist.get_irq(vp, first + i);
        let priority = irq.lock().priority;
        value |= (priority as u32) << (i * 8);
    }
    value
}

fn write_priority(
    dist: &Distributor,
    vp: VpIndex,
    offset: u16,
    len: usize,
    value: u32,
) -> WakeSet {
    let (first, count) = mmio::irq_span(8, offset, len);
    for i in 0..count {
        let irq = dist.get_irq(vp, first + i);
        irq.lock().priority = (value >> (i * 8)) as u8;
    }
    WakeSet::EMPTY
}

fn read_target(dist: &Distributor, vp: VpIndex, offset: u16, len: usize) -> u32 {
    let (first, count) = mmio::irq_span(8, offset, len);
    let mut value = 0;
    for i in 0..count {
        let intid = first + i;
        // The private byte range is banked: each processor reads itself.
        let byte = if intid < NR_PRIVATE_IRQS {
            1 << vp.index()
        } else {
            dist.get_irq(vp, intid).lock().targets
        };
        value |= (byte as u32) << (i * 8);
    }
    value
}

fn write_target(dist: &Distributor, vp: VpIndex, offset: u16, len: usize, value: u32) -> WakeSet {
    let (first, count) = mmio::irq_span(8, offset, len);
    let cpu_mask = dist.cpu_mask();
    let mut wake = WakeSet::EMPTY;
    for i in 0..count {
        let intid = first + i;
        // Private targets are architecturally read-only.
        if intid < NR_PRIVATE_IRQS {
            continue;
        }
        let irq = dist.get_irq(vp, intid);
        let mut state = irq.lock();
        state.set_targets((value >> (i * 8)) as u8 & cpu_mask);
        wake.merge(dist.wake_for(vp, intid, &state));
    }
    wake
}

fn read_config(dist: &Distributor, vp: VpIndex, offset: u16, len: usize) -> u32 {
    let (first, count) = mmio::irq_span(2, offset, len);
    let mut value = 0;
    for i in 0..count {
        let irq = dist.get_irq(vp, first + i);
        if irq.lock().trigger == Trigger::Edge {
            value |= 0b10 << (i * 2);
        }
    }
    value
}

fn write_config(dist: &Distributor, vp: VpIndex, offset: u16, len: usize, value: u32) -> WakeSet {
    let (first, count) = mmio::irq_span(2, offset, len);
    for i in 0..count {
        let intid = first + i;
        // Private interrupt configuration is fixed.
        if intid < NR_PRIVATE_IRQS {
            continue;
        }
        let irq = dist.get_irq(vp, intid);
        irq.lock().trigger = if value & (0b10 << (i * 2)) != 0 {
            Trigger::Edge
        } else {
            Trigger::Level
        };
    }
    WakeSet::EMPTY
}

fn write_sgir(dist: &Distributor, vp: VpIndex, _offset: u16, _len: usize, value: u32) -> WakeSet {
    dist.request_sgi(vp, value)
}

/// CPENDSGIR/SPENDSGIR: one byte per SGI, each bit a source processor, banked
/// on the accessing processor.
fn read_sgi_sources(dist: &Distributor, vp: VpIndex, offset: u16, len: usize) -> u32 {
    let mut value = 0;
    for i in 0..len as u16 {
        let irq = dist.get_irq(vp, (offset + i).into());
        let source = irq.lock().source;
        value |= (source as u32) << (i * 8);
    }
    value
}

fn write_set_sgi_sources(
    dist: &Distributor,
    vp: VpIndex,
    offset: u16,
    len: usize,
    value: u32,
) -> WakeSet {
    let mut wake = WakeSet::EMPTY;
    for i in 0..len as u16 {
        let sources = (value >> (i * 8)) as u8;
        if sources == 0 {
            continue;
        }
        let intid = (offset + i).into();
        let irq = dist.get_irq(vp, intid);
        let mut state = irq.lock();
        state.add_sources(sources);
        wake.merge(dist.wake_for(vp, intid, &state));
    }
    wake
}

fn write_clear_sgi_sources(
    dist: &Distributor,
    vp: VpIndex,
    offset: u16,
    len: usize,
    value: u32,
) -> WakeSet {
    for i in 0..len as u16 {
        let sources = (value >> (i * 8)) as u8;
        if sources == 0 {
            continue;
        }
        let irq = dist.get_irq(vp, (offset + i).into());
        irq.lock().remove_sources(sources);
    }
    WakeSet::EMPTY
}
