//! x86 architectural constants used by the probes.
//!
//! Only what the sandbox, the metric sources and the battery touch is
//! defined here.  Names follow the SDM where one exists.

use core::fmt;

// ─── Fault vectors ───────────────────────────────────────────────────

/// A hardware trap / exception vector number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vector(pub u8);

impl Vector {
    pub const DIVIDE_ERROR: Self = Self(0x00);
    pub const DEBUG: Self = Self(0x01);
    pub const NMI: Self = Self(0x02);
    pub const BREAKPOINT: Self = Self(0x03);
    pub const OVERFLOW: Self = Self(0x04);
    pub const BOUND_RANGE_EXCEEDED: Self = Self(0x05);
    pub const INVALID_OPCODE: Self = Self(0x06);
    pub const DEVICE_NOT_AVAILABLE: Self = Self(0x07);
    pub const DOUBLE_FAULT: Self = Self(0x08);
    pub const INVALID_TSS: Self = Self(0x0A);
    pub const SEGMENT_NOT_PRESENT: Self = Self(0x0B);
    pub const STACK_SEGMENT_FAULT: Self = Self(0x0C);
    pub const GENERAL_PROTECTION_FAULT: Self = Self(0x0D);
    pub const PAGE_FAULT: Self = Self(0x0E);
    pub const FLOATING_POINT_EXCEPTION: Self = Self(0x10);
    pub const ALIGNMENT_CHECK: Self = Self(0x11);
    pub const MACHINE_CHECK: Self = Self(0x12);
    pub const SIMD_FLOATING_POINT_EXCEPTION: Self = Self(0x13);
    pub const CONTROL_PROTECTION: Self = Self(0x15);
    pub const SECURITY_EXCEPTION: Self = Self(0x1E);

    /// Highest architecturally defined exception vector.
    pub const LAST_EXCEPTION: Self = Self(0x1E);

    /// Vector reported for every non-exception vector above
    /// [`LAST_EXCEPTION`](Self::LAST_EXCEPTION).
    pub const EXTERNAL: Self = Self(0xCC);

    /// Vector owned by the private table; recorded as itself.
    pub const PRIVATE: Self = Self(0xFE);

    /// Vector as it is written into a trace: external interrupts collapse
    /// into [`EXTERNAL`](Self::EXTERNAL).
    pub const fn recorded(self) -> Self {
        if self.0 > Self::LAST_EXCEPTION.0 && self.0 != Self::PRIVATE.0 {
            Self::EXTERNAL
        } else {
            self
        }
    }

    /// The CPU pushes an error code for this vector.
    pub const fn has_error_code(self) -> bool {
        matches!(self.0, 0x08 | 0x0A..=0x0E | 0x11 | 0x15 | 0x1E)
    }

    /// The saved instruction pointer still points at the faulting
    /// instruction, so the trap routine has to step over it.
    ///
    /// Vectors 1 through 4 are trap-class (or NMI) and resume after the
    /// instruction on their own.
    pub const fn needs_skip(self) -> bool {
        !matches!(self.0, 0x01..=0x04) && self.0 <= Self::LAST_EXCEPTION.0
    }
}

impl fmt::Debug for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::DIVIDE_ERROR => "#DE",
            Self::DEBUG => "#DB",
            Self::NMI => "NMI",
            Self::BREAKPOINT => "#BP",
            Self::OVERFLOW => "#OF",
            Self::BOUND_RANGE_EXCEEDED => "#BR",
            Self::INVALID_OPCODE => "#UD",
            Self::DEVICE_NOT_AVAILABLE => "#NM",
            Self::DOUBLE_FAULT => "#DF",
            Self::INVALID_TSS => "#TS",
            Self::SEGMENT_NOT_PRESENT => "#NP",
            Self::STACK_SEGMENT_FAULT => "#SS",
            Self::GENERAL_PROTECTION_FAULT => "#GP",
            Self::PAGE_FAULT => "#PF",
            Self::FLOATING_POINT_EXCEPTION => "#MF",
            Self::ALIGNMENT_CHECK => "#AC",
            Self::MACHINE_CHECK => "#MC",
            Self::SIMD_FLOATING_POINT_EXCEPTION => "#XM",
            Self::CONTROL_PROTECTION => "#CP",
            Self::SECURITY_EXCEPTION => "#SX",
            _ => return write!(f, "Vector({:#04x})", self.0),
        };
        f.write_str(name)
    }
}

// ─── CPUID leaves ────────────────────────────────────────────────────

pub const CPUID_LEAF_VENDOR: u32 = 0x0;
pub const CPUID_LEAF_FEATURES: u32 = 0x1;
pub const CPUID_LEAF_THERMAL_POWER: u32 = 0x6;
pub const CPUID_LEAF_STRUCTURED_EXT: u32 = 0x7;
pub const CPUID_LEAF_XSAVE: u32 = 0xD;
pub const CPUID_LEAF_TSC_INFO: u32 = 0x15;
pub const CPUID_LEAF_FREQ_INFO: u32 = 0x16;

/// Leaf 0x1 ECX bit 31: hypervisor present.
pub const CPUID_1_ECX_HYPERVISOR: u32 = 1 << 31;
/// Leaf 0x6 EAX bit 1: Intel Turbo Boost available.
pub const CPUID_6_EAX_TURBO: u32 = 1 << 1;
/// Leaf 0x7.0 EBX bit 1: `IA32_TSC_ADJUST` supported.
pub const CPUID_7_EBX_TSC_ADJUST: u32 = 1 << 1;
/// Leaf 0x7.0 EDX bit 19: architectural LBRs.
pub const CPUID_7_EDX_ARCH_LBR: u32 = 1 << 19;
/// Leaf 0xD.1 EAX bit 2: `XGETBV` with ECX=1.
pub const CPUID_D1_EAX_XGETBV_ECX1: u32 = 1 << 2;

/// "GenuineIntel" as EBX, EDX, ECX.
pub const VENDOR_INTEL: [u32; 3] = [0x756e_6547, 0x4965_6e69, 0x6c65_746e];
/// "AuthenticAMD" as EBX, EDX, ECX.
pub const VENDOR_AMD: [u32; 3] = [0x6874_7541, 0x6974_6e65, 0x444d_4163];

// ─── MSRs ────────────────────────────────────────────────────────────

pub const IA32_TIME_STAMP_COUNTER: u32 = 0x10;
pub const IA32_SMI_COUNT: u32 = 0x34;
pub const IA32_TSC_ADJUST: u32 = 0x3B;
pub const IA32_PMC0: u32 = 0xC1;
pub const IA32_MPERF: u32 = 0xE7;
pub const IA32_APERF: u32 = 0xE8;
pub const IA32_PERFEVTSEL0: u32 = 0x186;
pub const IA32_MISC_ENABLE: u32 = 0x1A0;
pub const IA32_DEBUGCTL: u32 = 0x1D9;
pub const IA32_FIXED_CTR0: u32 = 0x309;
pub const IA32_FIXED_CTR_CTRL: u32 = 0x38D;
pub const IA32_PERF_GLOBAL_CTRL: u32 = 0x38F;
pub const IA32_PEBS_ENABLE: u32 = 0x3F1;
pub const IA32_RTIT_CTL: u32 = 0x570;
pub const IA32_PKG_ENERGY_STATUS: u32 = 0x611;
pub const IA32_DRAM_ENERGY_STATUS: u32 = 0x619;
pub const IA32_PPERF: u32 = 0x64E;
pub const IA32_EFER: u32 = 0xC000_0080;
pub const IA32_GS_BASE: u32 = 0xC000_0101;
pub const IA32_IRPERF: u32 = 0xC000_00E9;

/// OR-ed into a clock MSR address to reach its read-only alias.
pub const MSR_READ_ONLY_ALIAS: u32 = 0xC000_0000;

/// AMD legacy performance event select / counter banks.
pub const AMD_PERF_EVTSEL0: u32 = 0xC001_0000;
pub const AMD_PERF_CTR0: u32 = 0xC001_0004;

/// Hypervisor-range MSRs that fault on bare metal.
pub const MSR_HV_GUEST_OS_ID: u32 = 0x4000_0000;
pub const MSR_KVM_SYSTEM_TIME_NEW: u32 = 0x4b56_4d01;

pub const MISC_ENABLE_TURBO_DISABLE_BIT: u32 = 38;
pub const MISC_ENABLE_XD_DISABLE: u64 = 1 << 34;
pub const DEBUGCTL_LBR: u64 = 1 << 0;
pub const DEBUGCTL_BTF: u64 = 1 << 1;
pub const DEBUGCTL_BTS_OFF_OS: u64 = 1 << 9;
pub const PEBS_ENABLE_PMC0: u64 = 1 << 0;
pub const RTIT_CTL_TRACE_EN: u64 = 1 << 0;
pub const RTIT_CTL_BRANCH_EN: u64 = 1 << 13;
pub const RTIT_CTL_TOPA: u64 = 1 << 8;
pub const EFER_NXE: u64 = 1 << 11;

// ─── Control registers ───────────────────────────────────────────────

pub const CR4_VMXE: u64 = 1 << 13;

/// XCR0 bit that no processor defines; setting it must #GP.
pub const XCR0_RESERVED_BIT_21: u64 = 1 << 21;

/// DR7: local enable for breakpoint 0, 2-byte length, read/write.
pub const DR7_L0_RW_LEN2: u64 = (1 << 0) | (0b11 << 16) | (0b01 << 18);

/// RFLAGS trap flag.
pub const RFLAGS_TF: u64 = 1 << 8;
/// RFLAGS interrupt enable flag.
pub const RFLAGS_IF: u64 = 1 << 9;

// ─── Ports ───────────────────────────────────────────────────────────

/// APM control port; a write raises an SMI on chipsets that route it.
pub const PORT_APM_CONTROL: u16 = 0xB2;
/// VMware backdoor I/O port.
pub const PORT_VMWARE_BACKDOOR: u16 = 0x5658;
/// Magic placed in EAX for a backdoor call and echoed in EBX on success.
pub const VMWARE_MAGIC: u32 = 0x564D_5868;
/// Backdoor command: get version.
pub const VMWARE_CMD_GET_VERSION: u32 = 0x0A;

// ─── Paging ──────────────────────────────────────────────────────────

pub const PAGE_SIZE: u64 = 0x1000;
pub const PAGE_SHIFT: u32 = 12;

pub const PTE_PRESENT: u64 = 1 << 0;
pub const PTE_WRITE: u64 = 1 << 1;
pub const PTE_LARGE: u64 = 1 << 7;
pub const PTE_NO_EXECUTE: u64 = 1 << 63;
pub const PTE_PFN_MASK: u64 = 0x000F_FFFF_FFFF_F000;

// ─── HPET ────────────────────────────────────────────────────────────

/// Offset of the main counter register within the HPET window.
pub const HPET_MAIN_COUNTER: u64 = 0xF0;

/// Instruction set level at which an operand was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandWidth {
    W16,
    W32,
    W64,
}
