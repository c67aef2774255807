// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Out-of-band configuration of the virtual GIC: window placement, interrupt
//! count, initialization, and the direct register access paths used by
//! migration and debug tooling.
//!
//! Configuration moves monotonically: unconfigured, then address and count
//! writes, then a one-shot initialization after which the geometry is
//! frozen. Every setter validates completely before committing anything.

use crate::cpuif::CpuInterface;
use crate::irq::VgicIrq;
use crate::mmio::MmioError;
use crate::Distributor;
use crate::GicVersion;
use crate::VpIndex;
use crate::WakeSet;
use gicdefs::DEFAULT_NR_IRQS;
use gicdefs::GICC_V2_SIZE;
use gicdefs::GICD_V2_SIZE;
use gicdefs::GICD_V3_SIZE;
use gicdefs::GICR_V3_STRIDE;
use gicdefs::GIC_PHYS_ADDR_BITS;
use gicdefs::GIC_V2_ALIGN;
use gicdefs::GIC_V3_ALIGN;
use gicdefs::MAX_CPUS_V2;
use gicdefs::MAX_IRQS;
use gicdefs::NR_PRIVATE_IRQS;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("address already configured")]
    AddrExists,
    #[error("address violates the required alignment")]
    Misaligned,
    #[error("window exceeds the supported physical address range")]
    AddrOutOfRange,
    #[error("address kind does not match the configured GIC version")]
    InvalidModel,
    #[error("interrupt count out of range or not a multiple of 32")]
    CountOutOfRange,
    #[error("configuration is frozen or a lock is held")]
    Busy,
    #[error("distributor not initialized")]
    NotInitialized,
    #[error("no processors registered")]
    NoVcpus,
    #[error("processor limit reached")]
    TooManyVcpus,
    #[error("no register at this offset")]
    NoSuchRegister,
}

/// Which emulated window an address configures.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddrKind {
    V2Dist,
    V2Cpu,
    V3Dist,
    V3Redist,
}

impl AddrKind {
    fn version(self) -> GicVersion {
        match self {
            AddrKind::V2Dist | AddrKind::V2Cpu => GicVersion::V2,
            AddrKind::V3Dist | AddrKind::V3Redist => GicVersion::V3,
        }
    }

    fn alignment(self) -> u64 {
        match self.version() {
            GicVersion::V2 => GIC_V2_ALIGN,
            GicVersion::V3 => GIC_V3_ALIGN,
        }
    }

    fn window_size(self, nr_cpus: u64) -> u64 {
        match self {
            AddrKind::V2Dist => GICD_V2_SIZE,
            AddrKind::V2Cpu => GICC_V2_SIZE,
            AddrKind::V3Dist => GICD_V3_SIZE,
            AddrKind::V3Redist => GICR_V3_STRIDE * nr_cpus,
        }
    }
}

#[derive(Debug)]
pub(crate) struct VmConfig {
    dist_base: Option<u64>,
    cpu_base: Option<u64>,
    redist_base: Option<u64>,
    nr_irqs: Option<u32>,
    initialized: bool,
}

impl VmConfig {
    pub fn new() -> Self {
        Self {
            dist_base: None,
            cpu_base: None,
            redist_base: None,
            nr_irqs: None,
            initialized: false,
        }
    }

    fn slot(&mut self, kind: AddrKind) -> &mut Option<u64> {
        match kind {
            AddrKind::V2Dist | AddrKind::V3Dist => &mut self.dist_base,
            AddrKind::V2Cpu => &mut self.cpu_base,
            AddrKind::V3Redist => &mut self.redist_base,
        }
    }
}

impl Distributor {
    /// Places one of the emulated register windows in guest physical memory.
    /// Each window address can be set exactly once.
    pub fn set_addr(&self, kind: AddrKind, addr: u64) -> Result<(), Error> {
        if kind.version() != self.version() {
            return Err(Error::InvalidModel);
        }
        if addr % kind.alignment() != 0 {
            return Err(Error::Misaligned);
        }
        let nr_cpus = self.cpu_interfaces().len() as u64;
        if addr.checked_add(kind.window_size(nr_cpus)).is_none_or(|end| end > 1 << GIC_PHYS_ADDR_BITS)
        {
            return Err(Error::AddrOutOfRange);
        }
        let mut config = self.config.lock();
        let slot = config.slot(kind);
        if slot.is_some() {
            return Err(Error::AddrExists);
        }
        *slot = Some(addr);
        tracing::debug!(?kind, addr, "window placed");
        Ok(())
    }

    pub fn get_addr(&self, kind: AddrKind) -> Result<Option<u64>, Error> {
        if kind.version() != self.version() {
            return Err(Error::InvalidModel);
        }
        Ok(*self.config.lock().slot(kind))
    }

    /// Commits the total interrupt count. Allowed once, before
    /// initialization; the value must cover the private range plus at least
    /// 32 shared interrupts, stay within the architectural maximum, and be
    /// a multiple of 32.
    pub fn set_nr_irqs(&self, nr_irqs: u32) -> Result<(), Error> {
        let mut config = self.config.lock();
        if config.initialized || config.nr_irqs.is_some() {
            return Err(Error::Busy);
        }
        if !(NR_PRIVATE_IRQS + 32..=MAX_IRQS).contains(&nr_irqs) || nr_irqs % 32 != 0 {
            return Err(Error::CountOutOfRange);
        }
        config.nr_irqs = Some(nr_irqs);
        Ok(())
    }

    /// Registers the next processor. Processors are added before
    /// initialization and live as long as the VM.
    pub fn add_cpu_interface(&self) -> Result<Arc<CpuInterface>, Error> {
        let config = self.config.lock();
        if config.initialized {
            return Err(Error::Busy);
        }
        let mut cpu_interfaces = self.cpu_interfaces_mut().write();
        if cpu_interfaces.len() as u32 == MAX_CPUS_V2 {
            return Err(Error::TooManyVcpus);
        }
        let vp = VpIndex::new(cpu_interfaces.len() as u32);
        let cpu = Arc::new(CpuInterface::new(vp, self.version()));
        cpu_interfaces.push(cpu.clone());
        Ok(cpu)
    }

    /// Finalizes configuration and allocates the shared interrupt array,
    /// after which guest execution may depend on the distributor. Harmless
    /// if already initialized.
    pub fn init(&self) -> Result<(), Error> {
        let mut config = self.config.lock();
        if config.initialized {
            return Ok(());
        }
        if self.cpu_interfaces().is_empty() {
            return Err(Error::NoVcpus);
        }
        let nr_irqs = config.nr_irqs.unwrap_or(DEFAULT_NR_IRQS);
        self.set_spis(
            (NR_PRIVATE_IRQS..nr_irqs)
                .map(|intid| Arc::new(VgicIrq::new_shared(intid)))
                .collect(),
        );
        config.initialized = true;
        tracing::debug!(nr_irqs, "distributor initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.config.lock().initialized
    }

    /// Reads a distributor register on behalf of the VMM rather than the
    /// guest, with every processor's run lock held.
    pub fn uaccess_dist_read(&self, vp: VpIndex, offset: u64) -> Result<u32, Error> {
        self.uaccess_read(vp, offset, Distributor::read)
    }

    pub fn uaccess_dist_write(&self, vp: VpIndex, offset: u64, value: u32) -> Result<WakeSet, Error> {
        self.uaccess_write(vp, offset, value, Distributor::write)
    }

    /// Reads a CPU-interface register of `vp` on behalf of the VMM.
    pub fn uaccess_cpu_read(&self, vp: VpIndex, offset: u64) -> Result<u32, Error> {
        self.uaccess_read(vp, offset, Distributor::cpu_read)
    }

    pub fn uaccess_cpu_write(&self, vp: VpIndex, offset: u64, value: u32) -> Result<WakeSet, Error> {
        self.uaccess_write(vp, offset, value, Distributor::cpu_write)
    }

    fn uaccess_read(
        &self,
        vp: VpIndex,
        offset: u64,
        read: fn(&Self, VpIndex, u64, &mut [u8]) -> Result<(), MmioError>,
    ) -> Result<u32, Error> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let cpu_interfaces = self.cpu_interfaces();
        let _locked = lock_all_run_locks(&cpu_interfaces).ok_or(Error::Busy)?;
        let mut data = [0; 4];
        read(self, vp, offset, &mut data).map_err(|_| Error::NoSuchRegister)?;
        Ok(u32::from_le_bytes(data))
    }

    fn uaccess_write(
        &self,
        vp: VpIndex,
        offset: u64,
        value: u32,
        write: fn(&Self, VpIndex, u64, &[u8]) -> Result<WakeSet, MmioError>,
    ) -> Result<WakeSet, Error> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let cpu_interfaces = self.cpu_interfaces();
        let _locked = lock_all_run_locks(&cpu_interfaces).ok_or(Error::Busy)?;
        write(self, vp, offset, &value.to_le_bytes()).map_err(|_| Error::NoSuchRegister)
    }
}

/// Acquires every processor's run lock without blocking, in ascending index
/// order, or none at all. Dropping the returned guards releases them in
/// reverse order.
fn lock_all_run_locks(
    cpu_interfaces: &[Arc<CpuInterface>],
) -> Option<Vec<parking_lot::MutexGuard<'_, ()>>> {
    let mut guards = Vec::with_capacity(cpu_interfaces.len());
    for cpu in cpu_interfaces {
        match cpu.run_lock().try_lock() {
            Some(guard) => guards.push(guard),
            None => {
                // Roll back exactly what was taken, newest first.
                while let Some(guard) = guards.pop() {
                    drop(guard);
                }
                return None;
            }
        }
    }
    Some(guards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::ready_distributor;
    use gicdefs::GicdRegister;
    use gicdefs::GicdTyper;
    use gicdefs::GIC_IIDR;

    #[test]
    fn addresses_are_write_once() {
        let dist = Distributor::new(GicVersion::V2);
        dist.set_addr(AddrKind::V2Dist, 0x800_0000).unwrap();
        assert_eq!(
            dist.set_addr(AddrKind::V2Dist, 0x900_0000),
            Err(Error::AddrExists)
        );
        assert_eq!(dist.get_addr(AddrKind::V2Dist), Ok(Some(0x800_0000)));
        // The CPU window slot is independent.
        dist.set_addr(AddrKind::V2Cpu, 0x801_0000).unwrap();
    }

    /// A misaligned placement is rejected without touching the slot.
    #[test]
    fn scenario_misaligned_addr_rejected() {
        let dist = Distributor::new(GicVersion::V2);
        assert_eq!(dist.set_addr(AddrKind::V2Dist, 0x1001), Err(Error::Misaligned));
        assert_eq!(dist.get_addr(AddrKind::V2Dist), Ok(None));
        dist.set_addr(AddrKind::V2Dist, 0x2000).unwrap();
        assert_eq!(dist.set_addr(AddrKind::V2Dist, 0x1001), Err(Error::Misaligned));
        assert_eq!(dist.get_addr(AddrKind::V2Dist), Ok(Some(0x2000)));
    }

    #[test]
    fn address_model_pairing() {
        let dist = Distributor::new(GicVersion::V2);
        assert_eq!(
            dist.set_addr(AddrKind::V3Redist, 0x1000_0000),
            Err(Error::InvalidModel)
        );
        assert_eq!(dist.get_addr(AddrKind::V3Dist), Err(Error::InvalidModel));

        let dist = Distributor::new(GicVersion::V3);
        assert_eq!(dist.set_addr(AddrKind::V2Cpu, 0x1000_0000), Err(Error::InvalidModel));
        // v3 windows need 64 KiB alignment.
        assert_eq!(dist.set_addr(AddrKind::V3Dist, 0x1000), Err(Error::Misaligned));
        dist.set_addr(AddrKind::V3Dist, 0x1000_0000).unwrap();
    }

    #[test]
    fn window_must_fit_physical_range() {
        let dist = Distributor::new(GicVersion::V2);
        assert_eq!(
            dist.set_addr(AddrKind::V2Dist, 1 << GIC_PHYS_ADDR_BITS),
            Err(Error::AddrOutOfRange)
        );
        assert_eq!(
            dist.set_addr(AddrKind::V2Dist, u64::MAX - 0xfff),
            Err(Error::AddrOutOfRange)
        );
        dist.set_addr(AddrKind::V2Dist, (1 << GIC_PHYS_ADDR_BITS) - GICD_V2_SIZE)
            .unwrap();
    }

    #[test]
    fn irq_count_frozen_after_init() {
        let dist = Distributor::new(GicVersion::V2);
        let _vp = dist.add_cpu_interface().unwrap();
        dist.set_nr_irqs(96).unwrap();
        assert_eq!(dist.set_nr_irqs(128), Err(Error::Busy));
        dist.init().unwrap();
        assert_eq!(dist.set_nr_irqs(96), Err(Error::Busy));
        assert_eq!(dist.nr_irqs(), Some(96));
    }

    #[test]
    fn irq_count_validation() {
        let dist = Distributor::new(GicVersion::V2);
        assert_eq!(dist.set_nr_irqs(32), Err(Error::CountOutOfRange));
        assert_eq!(dist.set_nr_irqs(63), Err(Error::CountOutOfRange));
        assert_eq!(dist.set_nr_irqs(100), Err(Error::CountOutOfRange));
        assert_eq!(dist.set_nr_irqs(MAX_IRQS + 32), Err(Error::CountOutOfRange));
        dist.set_nr_irqs(MAX_IRQS).unwrap();
    }

    #[test]
    fn init_requires_a_processor() {
        let dist = Distributor::new(GicVersion::V2);
        assert_eq!(dist.init(), Err(Error::NoVcpus));
        let _vp = dist.add_cpu_interface().unwrap();
        dist.init().unwrap();
    }

    #[test]
    fn init_is_idempotent_and_defaults() {
        let dist = Distributor::new(GicVersion::V2);
        let vp = dist.add_cpu_interface().unwrap().vp();
        dist.init().unwrap();
        dist.init().unwrap();
        assert_eq!(dist.nr_irqs(), Some(DEFAULT_NR_IRQS));
        // The default count is visible in TYPER.
        let mut data = [0; 4];
        dist.read(vp, GicdRegister::TYPER.0.into(), &mut data).unwrap();
        let typer = GicdTyper::from(u32::from_le_bytes(data));
        assert_eq!(typer.it_lines_number(), (DEFAULT_NR_IRQS / 32 - 1) as u8);
    }

    #[test]
    fn processors_capped_and_frozen() {
        let dist = Distributor::new(GicVersion::V2);
        for _ in 0..MAX_CPUS_V2 {
            let _vp = dist.add_cpu_interface().unwrap();
        }
        assert_eq!(dist.add_cpu_interface().err(), Some(Error::TooManyVcpus));

        let dist = Distributor::new(GicVersion::V2);
        let _vp = dist.add_cpu_interface().unwrap();
        dist.init().unwrap();
        assert_eq!(dist.add_cpu_interface().err(), Some(Error::Busy));
    }

    #[test]
    fn uaccess_requires_all_run_locks() {
        let (dist, vps) = ready_distributor(GicVersion::V2, 2, Some(64));
        let cpu1 = dist.cpu_interfaces()[1].clone();

        let guard = cpu1.run_lock().lock();
        assert_eq!(
            dist.uaccess_dist_read(vps[0], GicdRegister::IIDR.0.into()),
            Err(Error::Busy)
        );
        assert_eq!(
            dist.uaccess_cpu_write(vps[0], 0x4, 0xf0),
            Err(Error::Busy)
        );
        drop(guard);

        assert_eq!(
            dist.uaccess_dist_read(vps[0], GicdRegister::IIDR.0.into()),
            Ok(GIC_IIDR)
        );
        let _ = dist.uaccess_cpu_write(vps[0], 0x4, 0xf0).unwrap();
        assert_eq!(dist.uaccess_cpu_read(vps[0], 0x4), Ok(0xf0));

        // And both run locks are free again afterward.
        assert!(cpu1.run_lock().try_lock().is_some());
    }

    #[test]
    fn uaccess_errors() {
        let dist = Distributor::new(GicVersion::V2);
        let vp = dist.add_cpu_interface().unwrap().vp();
        assert_eq!(
            dist.uaccess_dist_read(vp, 0x0),
            Err(Error::NotInitialized)
        );
        dist.init().unwrap();
        assert_eq!(
            dist.uaccess_dist_read(vp, 0x0c),
            Err(Error::NoSuchRegister)
        );
        assert_eq!(
            dist.uaccess_dist_write(vp, 0x0c, 1).err(),
            Some(Error::NoSuchRegister)
        );
    }
}
