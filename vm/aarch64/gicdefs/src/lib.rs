// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions for the Generic Interrupt Controller (GIC) registers, GICv2
//! distributor and CPU interface layout plus the GICv3 window geometry.

#![no_std]
#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use core::fmt;
use core::ops::Range;

/// Interrupt numbers 0..16 are software-generated interrupts.
pub const NR_SGIS: u32 = 16;
/// Interrupt numbers 0..32 are banked per CPU (SGIs and PPIs).
pub const NR_PRIVATE_IRQS: u32 = 32;
/// Architectural ceiling on the total interrupt count.
pub const MAX_IRQS: u32 = 1024;
/// Total interrupt count used when the VMM never configures one.
pub const DEFAULT_NR_IRQS: u32 = 256;
/// The GICv2 distributor addresses at most eight CPU interfaces.
pub const MAX_CPUS_V2: u32 = 8;

/// GICD_IIDR/GICC_IIDR: ARM as implementer, a hypervisor product id.
pub const GIC_IIDR: u32 = 0x4b00_043b;

pub const GICD_V2_SIZE: u64 = 0x1000;
pub const GICC_V2_SIZE: u64 = 0x2000;
pub const GICD_V3_SIZE: u64 = 0x10000;
/// Per-CPU redistributor frame pair (RD_base + SGI_base).
pub const GICR_V3_STRIDE: u64 = 0x20000;

pub const GIC_V2_ALIGN: u64 = 0x1000;
pub const GIC_V3_ALIGN: u64 = 0x10000;

/// Maximum guest physical address width for the register windows.
pub const GIC_PHYS_ADDR_BITS: u32 = 48;

macro_rules! register_set {
    ($name:ident: $ty:ty { $($reg:ident = $value:expr,)* }) => {
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(pub $ty);

        impl $name {
            $(pub const $reg: Self = Self($value);)*
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match *self {
                    $(Self::$reg => f.pad(stringify!($reg)),)*
                    Self(v) => write!(f, "{}({:#x})", stringify!($name), v),
                }
            }
        }
    };
}

register_set! {
    GicdRegister: u16 {
        CTLR = 0x0000,
        TYPER = 0x0004,
        IIDR = 0x0008,
        IGROUPR0 = 0x0080,    // 0x80
        ISENABLER0 = 0x0100,  // 0x80
        ICENABLER0 = 0x0180,  // 0x80
        ISPENDR0 = 0x0200,    // 0x80
        ICPENDR0 = 0x0280,    // 0x80
        ISACTIVER0 = 0x0300,  // 0x80
        ICACTIVER0 = 0x0380,  // 0x80
        IPRIORITYR0 = 0x0400, // 0x400
        ITARGETSR0 = 0x0800,  // 0x400
        ICFGR0 = 0x0c00,      // 0x100
        SGIR = 0x0f00,
        CPENDSGIR0 = 0x0f10,  // 0x10
        SPENDSGIR0 = 0x0f20,  // 0x10
    }
}

impl GicdRegister {
    pub const IGROUPR: Range<u16> = Self::IGROUPR0.0..Self::IGROUPR0.0 + 0x80;
    pub const ISENABLER: Range<u16> = Self::ISENABLER0.0..Self::ISENABLER0.0 + 0x80;
    pub const ICENABLER: Range<u16> = Self::ICENABLER0.0..Self::ICENABLER0.0 + 0x80;
    pub const ISPENDR: Range<u16> = Self::ISPENDR0.0..Self::ISPENDR0.0 + 0x80;
    pub const ICPENDR: Range<u16> = Self::ICPENDR0.0..Self::ICPENDR0.0 + 0x80;
    pub const ISACTIVER: Range<u16> = Self::ISACTIVER0.0..Self::ISACTIVER0.0 + 0x80;
    pub const ICACTIVER: Range<u16> = Self::ICACTIVER0.0..Self::ICACTIVER0.0 + 0x80;
    pub const IPRIORITYR: Range<u16> = Self::IPRIORITYR0.0..Self::IPRIORITYR0.0 + 0x400;
    pub const ITARGETSR: Range<u16> = Self::ITARGETSR0.0..Self::ITARGETSR0.0 + 0x400;
    pub const ICFGR: Range<u16> = Self::ICFGR0.0..Self::ICFGR0.0 + 0x100;
    pub const CPENDSGIR: Range<u16> = Self::CPENDSGIR0.0..Self::CPENDSGIR0.0 + 0x10;
    pub const SPENDSGIR: Range<u16> = Self::SPENDSGIR0.0..Self::SPENDSGIR0.0 + 0x10;
}

register_set! {
    GiccRegister: u16 {
        CTLR = 0x0000,
        PMR = 0x0004,
        BPR = 0x0008,
        ABPR = 0x001c,
        IIDR = 0x00fc,
    }
}

#[bitfield(u32)]
pub struct GicdCtlr {
    pub enable: bool,
    #[bits(31)]
    _res1_31: u32,
}

#[bitfield(u32)]
pub struct GicdTyper {
    /// `32 * (n + 1)` interrupt lines.
    #[bits(5)]
    pub it_lines_number: u8,
    /// One less than the number of CPU interfaces.
    #[bits(3)]
    pub cpu_number: u8,
    #[bits(2)]
    _res8_9: u8,
    pub security_extn: bool,
    #[bits(5)]
    pub lspi: u8,
    _res16_31: u16,
}

#[bitfield(u32)]
pub struct GicdSgir {
    #[bits(4)]
    pub intid: u32,
    #[bits(11)]
    _res4_14: u16,
    pub nsatt: bool,
    pub target_list: u8,
    #[bits(2)]
    pub target_list_filter: u8,
    #[bits(6)]
    _res26_31: u8,
}

#[bitfield(u32)]
pub struct GiccCtlr {
    pub enable: bool,
    _res1_8: u8,
    pub eoi_mode: bool,
    #[bits(22)]
    _res10_31: u32,
}

/// GICH_VMCR, the GICv2 hardware view of the virtual CPU interface.
#[bitfield(u32)]
pub struct GichVmcr {
    pub grp0_en: bool,
    pub grp1_en: bool,
    pub ack_ctl: bool,
    pub fiq_en: bool,
    pub cbpr: bool,
    #[bits(4)]
    _res5_8: u8,
    pub eoi_mode: bool,
    _res10_17: u8,
    /// Aliased binary point, 3 bits.
    #[bits(3)]
    pub abpr: u8,
    #[bits(3)]
    pub bpr: u8,
    #[bits(3)]
    _res24_26: u8,
    /// Priority mask, top five bits only.
    #[bits(5)]
    pub pmr: u8,
}

/// ICH_VMCR_EL2, the GICv3 hardware view of the virtual CPU interface.
#[bitfield(u32)]
pub struct IchVmcr {
    pub veng0: bool,
    pub veng1: bool,
    pub vackctl: bool,
    pub vfiqen: bool,
    pub vcbpr: bool,
    #[bits(4)]
    _res5_8: u8,
    pub veoim: bool,
    _res10_17: u8,
    #[bits(3)]
    pub vbpr1: u8,
    #[bits(3)]
    pub vbpr0: u8,
    /// Priority mask, all eight bits.
    pub vpmr: u8,
}
