// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Table-driven register decode for the emulated MMIO windows.
//!
//! Each window is described by a sorted slice of [`Region`]s. A region either
//! has a fixed byte length or packs a fixed number of bits per interrupt, in
//! which case its length is derived from the configured interrupt count at
//! lookup time so the window layout always tracks the live configuration.

use crate::Distributor;
use crate::VpIndex;
use crate::WakeSet;

/// An access the window does not decode. The trap layer decides what the
/// guest sees; this core only reports the distinction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmioError {
    /// No register at the given offset.
    InvalidRegister,
    /// The register exists but not at this access width.
    InvalidAccessSize,
    /// The access is not naturally aligned.
    UnalignedAccess,
}

pub(crate) type ReadFn = fn(&Distributor, VpIndex, u16, usize) -> u32;
pub(crate) type WriteFn = fn(&Distributor, VpIndex, u16, usize, u32) -> WakeSet;

#[derive(Copy, Clone)]
pub(crate) enum RegionLen {
    Fixed(u16),
    /// Length scales as `nr_irqs * bits / 8`.
    PerIrq(u8),
}

impl RegionLen {
    fn byte_len(self, nr_irqs: u32) -> u32 {
        match self {
            RegionLen::Fixed(n) => n.into(),
            RegionLen::PerIrq(bits) => nr_irqs * bits as u32 / 8,
        }
    }
}

/// Allowed access widths, a bitmask of byte lengths.
#[derive(Copy, Clone)]
pub(crate) struct Access(u8);

impl Access {
    pub const WORD: Self = Self(1 << 4);
    pub const BYTE_WORD: Self = Self(1 << 1 | 1 << 4);

    fn allows(self, len: usize) -> bool {
        len < 8 && self.0 & (1 << len) != 0
    }
}

pub(crate) struct Region {
    pub offset: u16,
    pub len: RegionLen,
    pub access: Access,
    pub read: ReadFn,
    pub write: WriteFn,
}

/// The first interrupt covered by an access at `offset` within a region
/// packing `bits_per_irq` bits per interrupt, and the number of interrupts
/// the access spans.
pub(crate) fn irq_span(bits_per_irq: u8, offset: u16, len: usize) -> (u32, u32) {
    (
        offset as u32 * 8 / bits_per_irq as u32,
        len as u32 * 8 / bits_per_irq as u32,
    )
}

/// Locates the region containing `offset` and validates the access shape
/// against it.
fn find(
    table: &[Region],
    nr_irqs: u32,
    offset: u64,
    len: usize,
) -> Result<(&Region, u16), MmioError> {
    if !matches!(len, 1 | 2 | 4) {
        return Err(MmioError::InvalidAccessSize);
    }
    if offset % len as u64 != 0 {
        return Err(MmioError::UnalignedAccess);
    }
    let region = table
        .iter()
        .take_while(|r| (r.offset as u64) <= offset)
        .find(|r| offset < r.offset as u64 + r.len.byte_len(nr_irqs) as u64)
        .ok_or(MmioError::InvalidRegister)?;
    let offset = (offset - region.offset as u64) as u16;
    // Natural alignment makes it impossible to cross the end of a 4-byte
    // register, but a byte access can still land past the live length of a
    // scaled region, and the table is checked again on the way out.
    if offset as u32 + len as u32 > region.len.byte_len(nr_irqs) {
        return Err(MmioError::InvalidRegister);
    }
    if !region.access.allows(len) {
        return Err(MmioError::InvalidAccessSize);
    }
    Ok((region, offset))
}

pub(crate) fn dispatch_read(
    table: &[Region],
    dist: &Distributor,
    vp: VpIndex,
    nr_irqs: u32,
    offset: u64,
    data: &mut [u8],
) -> Result<(), MmioError> {
    let (region, offset) = find(table, nr_irqs, offset, data.len())?;
    let v = (region.read)(dist, vp, offset, data.len());
    data.copy_from_slice(&v.to_le_bytes()[..data.len()]);
    Ok(())
}

pub(crate) fn dispatch_write(
    table: &[Region],
    dist: &Distributor,
    vp: VpIndex,
    nr_irqs: u32,
    offset: u64,
    data: &[u8],
) -> Result<WakeSet, MmioError> {
    let (region, offset) = find(table, nr_irqs, offset, data.len())?;
    let mut bytes = [0; 4];
    bytes[..data.len()].copy_from_slice(data);
    Ok((region.write)(dist, vp, offset, data.len(), u32::from_le_bytes(bytes)))
}

/// Read-as-zero.
pub(crate) fn read_raz(_: &Distributor, _: VpIndex, _: u16, _: usize) -> u32 {
    0
}

/// Read-as-ones across the access width.
pub(crate) fn read_rao(_: &Distributor, _: VpIndex, _: u16, len: usize) -> u32 {
    !0u32 >> (32 - len * 8)
}

/// Write-ignored.
pub(crate) fn write_wi(_: &Distributor, _: VpIndex, _: u16, _: usize, _: u32) -> WakeSet {
    WakeSet::EMPTY
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<Region> {
        vec![
            Region {
                offset: 0x0,
                len: RegionLen::Fixed(4),
                access: Access::WORD,
                read: read_raz,
                write: write_wi,
            },
            Region {
                offset: 0x100,
                len: RegionLen::PerIrq(1),
                access: Access::WORD,
                read: read_rao,
                write: write_wi,
            },
            Region {
                offset: 0x400,
                len: RegionLen::PerIrq(8),
                access: Access::BYTE_WORD,
                read: read_raz,
                write: write_wi,
            },
        ]
    }

    fn probe(nr_irqs: u32, offset: u64, len: usize) -> Result<(), MmioError> {
        find(&table(), nr_irqs, offset, len).map(|_| ())
    }

    #[test]
    fn region_length_tracks_irq_count() {
        // 64 interrupts: 1 bit per IRQ covers 8 bytes, 8 bits per IRQ 64.
        assert_eq!(probe(64, 0x104, 4), Ok(()));
        assert_eq!(probe(64, 0x108, 4), Err(MmioError::InvalidRegister));
        assert_eq!(probe(128, 0x108, 4), Ok(()));
        assert_eq!(probe(64, 0x43f, 1), Ok(()));
        assert_eq!(probe(64, 0x440, 1), Err(MmioError::InvalidRegister));
    }

    #[test]
    fn width_and_alignment_checks() {
        assert_eq!(probe(64, 0x0, 2), Err(MmioError::InvalidAccessSize));
        assert_eq!(probe(64, 0x1, 1), Err(MmioError::InvalidAccessSize));
        assert_eq!(probe(64, 0x2, 4), Err(MmioError::UnalignedAccess));
        assert_eq!(probe(64, 0x102, 2), Err(MmioError::InvalidAccessSize));
        assert_eq!(probe(64, 0x400, 8), Err(MmioError::InvalidAccessSize));
        assert_eq!(probe(64, 0x401, 1), Ok(()));
    }

    #[test]
    fn gaps_are_unhandled() {
        assert_eq!(probe(64, 0x8, 4), Err(MmioError::InvalidRegister));
        assert_eq!(probe(64, 0x3000, 4), Err(MmioError::InvalidRegister));
    }

    #[test]
    fn irq_span_decode() {
        assert_eq!(irq_span(1, 4, 4), (32, 32));
        assert_eq!(irq_span(8, 0x20, 1), (32, 1));
        assert_eq!(irq_span(8, 0x20, 4), (32, 4));
        assert_eq!(irq_span(2, 8, 4), (32, 16));
    }
}
