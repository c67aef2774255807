// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Software-generated interrupt routing, the GICD_SGIR write path.

use crate::Distributor;
use crate::VpIndex;
use crate::WakeSet;
use gicdefs::GicdSgir;

impl Distributor {
    /// Raises a software-generated interrupt on behalf of `source`, from a
    /// GICD_SGIR write. Returns the processors to kick.
    ///
    /// Each target's copy of the interrupt is locked, marked, and released
    /// independently; targets are never held as a group.
    pub fn request_sgi(&self, source: VpIndex, value: u32) -> WakeSet {
        let sgir = GicdSgir::from(value);
        let cpu_interfaces = self.cpu_interfaces();
        let nr_cpus = cpu_interfaces.len() as u32;
        if nr_cpus == 0 {
            return WakeSet::EMPTY;
        }

        let targets: u32 = match sgir.target_list_filter() {
            0 => {
                // Literal target list. Bits beyond the registered processors
                // are silently dropped.
                u32::from(sgir.target_list()) & (!0u32 >> (32 - nr_cpus))
            }
            1 => (!0u32 >> (32 - nr_cpus)) & !(1 << source.index()),
            2 => 1 << source.index(),
            3 => {
                // Reserved encoding.
                tracing::debug!(value, "sgir write with reserved filter");
                return WakeSet::EMPTY;
            }
            _ => unreachable!(),
        };

        tracing::debug!(
            source = source.index(),
            intid = sgir.intid(),
            targets,
            "sgi requested"
        );

        let mut wake = WakeSet::EMPTY;
        for (i, cpu) in cpu_interfaces.iter().enumerate() {
            if targets & (1 << i) == 0 {
                continue;
            }
            let irq = cpu.private_irq(sgir.intid());
            let mut state = irq.lock();
            state.add_sources(1 << source.index());
            wake.merge(self.wake_for(cpu.vp(), irq.intid(), &state));
        }
        wake
    }
}
