// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Software emulation of an ARM GICv2-style virtual interrupt controller.
//!
//! [`Distributor`] models the VM-wide distributor register block and owns the
//! shared peripheral interrupts; each [`CpuInterface`] carved out of it via
//! [`Distributor::add_cpu_interface`] holds that processor's banked private
//! interrupts, its run lock, and the version-specific VMCR backing.
//!
//! Nothing here delivers interrupts or wakes processors. Every operation that
//! can make an interrupt newly deliverable reports the processors to kick in
//! a [`WakeSet`], and the caller (the partition's run loop glue) applies it.

#![forbid(unsafe_code)]

pub use cpuif::CpuInterface;
pub use cpuif::Vmcr;
pub use device::AddrKind;
pub use device::Error;
pub use dist::Distributor;
pub use mmio::MmioError;

mod cpuif;
mod device;
mod dist;
mod irq;
mod mmio;
mod sgi;

/// The index of a virtual processor within its VM, stable for the VM's life.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VpIndex(u32);

impl VpIndex {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Which GIC architecture variant the distributor models.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GicVersion {
    V2,
    V3,
}

/// The set of virtual processors that an operation made runnable.
///
/// Returned instead of waking directly so the side effect is visible at the
/// call site; an empty set requires no action.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct WakeSet(u64);

impl WakeSet {
    pub const EMPTY: Self = Self(0);

    pub fn insert(&mut self, vp: VpIndex) {
        debug_assert!(vp.index() < 64);
        self.0 |= 1 << vp.index();
    }

    pub fn merge(&mut self, other: WakeSet) {
        self.0 |= other.0;
    }

    pub fn contains(&self, vp: VpIndex) -> bool {
        self.0 & (1 << vp.index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// All processors with index below `count`.
    pub fn all(count: u32) -> Self {
        debug_assert!(count < 64);
        Self((1u64 << count) - 1)
    }

    pub fn vps(self) -> impl Iterator<Item = VpIndex> {
        let mut mask = self.0;
        std::iter::from_fn(move || {
            if mask == 0 {
                return None;
            }
            let i = mask.trailing_zeros();
            mask &= mask - 1;
            Some(VpIndex::new(i))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An initialized, enabled distributor with `nr_vps` processors, plus
    /// their indexes.
    pub(crate) fn ready_distributor(
        version: GicVersion,
        nr_vps: u32,
        nr_irqs: Option<u32>,
    ) -> (Distributor, Vec<VpIndex>) {
        let dist = Distributor::new(version);
        let vps = (0..nr_vps)
            .map(|_| dist.add_cpu_interface().unwrap().vp())
            .collect();
        if let Some(nr_irqs) = nr_irqs {
            dist.set_nr_irqs(nr_irqs).unwrap();
        }
        dist.init().unwrap();
        let _ = dist.enable_distributor();
        (dist, vps)
    }

    #[test]
    fn wake_set() {
        let mut wake = WakeSet::EMPTY;
        assert!(wake.is_empty());
        wake.insert(VpIndex::new(2));
        wake.insert(VpIndex::new(0));
        assert!(wake.contains(VpIndex::new(2)));
        assert!(!wake.contains(VpIndex::new(1)));
        let vps: Vec<_> = wake.vps().map(VpIndex::index).collect();
        assert_eq!(vps, [0, 2]);
        assert_eq!(WakeSet::all(3), {
            let mut w = WakeSet::EMPTY;
            for i in 0..3 {
                w.insert(VpIndex::new(i));
            }
            w
        });
    }
}
