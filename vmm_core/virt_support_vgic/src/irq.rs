// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-interrupt state records.
//!
//! Every virtual interrupt has exactly one record for the life of the VM:
//! records for the 32 banked private interrupts are created with their
//! [`CpuInterface`](crate::CpuInterface), records for shared peripheral
//! interrupts when the distributor is initialized. All flags of a record are
//! guarded by that record's own mutex, so accesses to distinct interrupts
//! never contend.

use crate::Distributor;
use crate::VpIndex;
use gicdefs::NR_PRIVATE_IRQS;
use gicdefs::NR_SGIS;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Trigger {
    Edge,
    Level,
}

#[derive(Debug)]
pub(crate) struct IrqState {
    pub enabled: bool,
    pub pending: bool,
    pub active: bool,
    pub priority: u8,
    pub trigger: Trigger,
    /// GICv2 target CPU mask. Meaningful for shared interrupts only.
    pub targets: u8,
    /// Cache of the lowest processor in `targets`, the one that receives the
    /// interrupt. Recomputed on every `targets` write, under this record's
    /// lock.
    pub target_vp: Option<VpIndex>,
    /// For SGIs, the processors that requested this interrupt.
    pub source: u8,
}

impl IrqState {
    pub fn set_targets(&mut self, targets: u8) {
        self.targets = targets;
        self.target_vp = if targets != 0 {
            Some(VpIndex::new(targets.trailing_zeros()))
        } else {
            None
        };
    }

    /// Adds SGI source processors. SGIs are pending exactly while a source
    /// bit is set.
    pub fn add_sources(&mut self, sources: u8) {
        self.source |= sources;
        if self.source != 0 {
            self.pending = true;
        }
    }

    /// Removes SGI source processors, clearing pending with the last one.
    pub fn remove_sources(&mut self, sources: u8) {
        self.source &= !sources;
        if self.source == 0 {
            self.pending = false;
        }
    }
}

#[derive(Debug)]
pub(crate) struct VgicIrq {
    intid: u32,
    state: Mutex<IrqState>,
}

impl VgicIrq {
    pub fn new_private(intid: u32) -> Self {
        debug_assert!(intid < NR_PRIVATE_IRQS);
        // SGIs are architecturally edge triggered and permanently enabled.
        let sgi = intid < NR_SGIS;
        Self::new(
            intid,
            if sgi { Trigger::Edge } else { Trigger::Level },
            sgi,
        )
    }

    pub fn new_shared(intid: u32) -> Self {
        debug_assert!(intid >= NR_PRIVATE_IRQS);
        Self::new(intid, Trigger::Level, false)
    }

    fn new(intid: u32, trigger: Trigger, enabled: bool) -> Self {
        Self {
            intid,
            state: Mutex::new(IrqState {
                enabled,
                pending: false,
                active: false,
                priority: 0,
                trigger,
                targets: 0,
                target_vp: None,
                source: 0,
            }),
        }
    }

    pub fn intid(&self) -> u32 {
        self.intid
    }

    pub fn lock(&self) -> MutexGuard<'_, IrqState> {
        self.state.lock()
    }
}

impl Distributor {
    /// Returns a handle to interrupt `intid`, resolving private interrupts
    /// through `vp`'s bank. Dropping the handle releases it.
    ///
    /// Callers have already range checked `intid` against the register
    /// window, so an out-of-range id here is a bug in this crate.
    pub(crate) fn get_irq(&self, vp: VpIndex, intid: u32) -> Arc<VgicIrq> {
        if intid < NR_PRIVATE_IRQS {
            self.cpu_interfaces()[vp.index() as usize].private_irq(intid)
        } else {
            let spis = self.spis().expect("initialized before register access");
            spis[(intid - NR_PRIVATE_IRQS) as usize].clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GicVersion;
    use gicdefs::GicdRegister;
    use std::thread;

    #[test]
    fn sgi_source_tracks_pending() {
        let irq = VgicIrq::new_private(3);
        let mut state = irq.lock();
        state.add_sources(0b101);
        assert!(state.pending);
        state.remove_sources(0b001);
        assert!(state.pending);
        state.remove_sources(0b100);
        assert!(!state.pending);
        assert_eq!(state.source, 0);
    }

    #[test]
    fn target_cache_follows_lowest_bit() {
        let irq = VgicIrq::new_shared(40);
        assert_eq!(irq.intid(), 40);
        let mut state = irq.lock();
        state.set_targets(0b1100);
        assert_eq!(state.target_vp, Some(VpIndex::new(2)));
        state.set_targets(0);
        assert_eq!(state.target_vp, None);
    }

    /// Concurrent register writes to disjoint interrupt ranges from several
    /// threads must proceed independently and leave exactly the written
    /// state behind.
    #[test]
    fn cross_irq_independence_stress() {
        let dist = Distributor::new(GicVersion::V2);
        let vp = dist.add_cpu_interface().unwrap().vp();
        dist.set_nr_irqs(256).unwrap();
        dist.init().unwrap();
        let dist = Arc::new(dist);

        // Four threads, each owning a disjoint 32-SPI span of the priority
        // array (8 bits per interrupt, so a disjoint 32-byte span of the
        // register window).
        let threads: Vec<_> = (0u16..4)
            .map(|t| {
                let dist = dist.clone();
                thread::spawn(move || {
                    let base = GicdRegister::IPRIORITYR0.0 + 32 + t * 32;
                    for round in 0..500u32 {
                        for i in 0..32u16 {
                            let b = (round as u8) ^ (t as u8) ^ (i as u8);
                            let _ = dist.write(vp, (base + i) as u64, &[b]).unwrap();
                            let mut got = [0u8];
                            dist.read(vp, (base + i) as u64, &mut got).unwrap();
                            assert_eq!(got[0], b);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        // Final state is the last round's pattern for every span.
        for t in 0u16..4 {
            for i in 0..32u16 {
                let off = GicdRegister::IPRIORITYR0.0 + 32 + t * 32 + i;
                let mut got = [0u8];
                dist.read(vp, off as u64, &mut got).unwrap();
                assert_eq!(got[0], (499u32 as u8) ^ (t as u8) ^ (i as u8));
            }
        }
    }
}
