//! Machine personalities for the simulator.
//!
//! A [`SimProfile`] describes one processor as the probes would see it:
//! identification, which optional hardware is there, what a VM exit
//! costs, and a set of [`Quirks`] that reproduce known hypervisor
//! emulation gaps.  The bare-metal profiles have no quirks.

use alloc::string::ToString;

use crate::arch::defs::{DEBUGCTL_BTF, DEBUGCTL_BTS_OFF_OS, DEBUGCTL_LBR};
use crate::caps::Vendor;
use crate::error::ProbeError;

/// How the free-running clock MSRs (MPERF, APERF, PPERF, IRPERF) behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMsrModel {
    /// As the vendor's silicon: AMD also answers the read-only aliases and
    /// IRPERF, Intel answers PPERF.
    Native,
    /// Every clock MSR faults.
    Hidden,
    /// Every clock MSR reads as zero.
    Null,
    /// Every clock MSR and alias answers, whatever the vendor.
    ReadAll,
}

/// Intel Processor Trace control register behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtModel {
    Supported,
    /// Writes are accepted and dropped.
    Discards,
    Faults,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmuModel {
    /// Counter MSRs exist; otherwise they fault.
    pub present: bool,
    /// Writes to the counter registers are kept.
    pub writes_stick: bool,
    /// Enabled counters advance.
    pub counts: bool,
    /// `RDPMC` faults even at ring 0.
    pub rdpmc_faults: bool,
    /// PEBS enable bits are kept.
    pub pebs: bool,
}

impl PmuModel {
    pub const FULL: Self = Self {
        present: true,
        writes_stick: true,
        counts: true,
        rdpmc_faults: false,
        pebs: true,
    };

    pub const ABSENT: Self = Self {
        present: false,
        writes_stick: false,
        counts: false,
        rdpmc_faults: true,
        pebs: false,
    };
}

/// Emulation gaps.  `Default` is faithful hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quirks {
    /// Writes to the APM port never reach SMM.
    pub smi_swallowed: bool,
    /// The VMware backdoor port answers.
    pub vmware_backdoor: bool,
    /// `STR`/`SLDT` into a 32- or 64-bit register only write 16 bits.
    pub str_sldt_width_bug: bool,
    /// A #DB held pending across a `MOV SS` shadow is lost.
    pub drops_pending_db: bool,
    /// `IA32_MISC_ENABLE` turbo-disable toggles are dropped.
    pub turbo_write_discarded: bool,
    /// `DEBUGCTL.BTF` is ignored; `TF` single-steps every instruction.
    pub btf_ignored: bool,
    /// `CPUID` leaf 0xD returns sub-leaf 0 for every sub-leaf.
    pub cpuid_ignores_subleaf: bool,
    /// `XGETBV`/`XSETBV` fault when RCX bits 63:32 are set.
    pub xcr_index_full_rcx: bool,
    /// `XSETBV` accepts any ECX.
    pub xsetbv_accepts_bad_index: bool,
    /// `XSETBV` accepts reserved XCR0 bits.
    pub xsetbv_accepts_reserved_bits: bool,
    /// `SMSW` into a 64-bit register only stores 16 bits.
    pub smsw_truncated: bool,
    /// The KVM and Hyper-V MSR ranges are readable.
    pub hv_msrs: bool,
    /// Added to `RDMSR IA32_TSC` (an offset the hypervisor forgot).
    pub tsc_msr_skew: u64,
    /// `IA32_TSC_ADJUST` writes do not move the TSC.
    pub tsc_adjust_ignored: bool,
    /// Clearing `EFER.NXE` is silently undone.
    pub efer_nx_discarded: bool,
    /// Guest page tables are shadowed: every PTE write is trapped and
    /// invalidates the translation.
    pub shadow_paging: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimProfile {
    pub name: &'static str,
    pub vendor: Vendor,
    /// CPUID leaf 1 EAX.
    pub signature: u32,
    pub max_leaf: u32,
    pub tsc_hz: u64,
    pub hypervisor_bit: bool,
    /// CR4.VMXE as found.
    pub vmxe: bool,
    /// Cost of a VM exit; `None` on bare metal.
    pub exit_cycles: Option<u64>,
    pub turbo: bool,
    pub arch_lbr: bool,
    pub tsc_adjust: bool,
    pub xgetbv_ecx1: bool,
    pub processor_trace: PtModel,
    /// `IA32_DEBUGCTL` bits that read back after being written.
    pub debugctl_bits: u64,
    pub clock_msrs: ClockMsrModel,
    pub pmu: PmuModel,
    pub energy_msrs: bool,
    pub hpet_present: bool,
    /// Main-counter period in TSC cycles; `None` freezes the counter.
    pub hpet_period_cycles: Option<u64>,
    pub tlb_entries: usize,
    pub quirks: Quirks,
}

/// 14.318 MHz HPET at a 3 GHz TSC.
const HPET_PERIOD_3GHZ: u64 = 210;

impl SimProfile {
    pub const NAMES: [&'static str; 5] =
        ["bare-metal-intel", "bare-metal-amd", "kvm", "vmware", "hyperv"];

    pub fn from_name(name: &str) -> Result<Self, ProbeError> {
        match name {
            "bare-metal-intel" => Ok(Self::bare_metal_intel()),
            "bare-metal-amd" => Ok(Self::bare_metal_amd()),
            "kvm" => Ok(Self::kvm()),
            "vmware" => Ok(Self::vmware()),
            "hyperv" => Ok(Self::hyperv()),
            other => Err(ProbeError::UnknownProfile(other.to_string())),
        }
    }

    /// Coffee Lake desktop part.
    pub fn bare_metal_intel() -> Self {
        Self {
            name: "bare-metal-intel",
            vendor: Vendor::Intel,
            signature: 0x0009_06EA,
            max_leaf: 0x16,
            tsc_hz: 3_000_000_000,
            hypervisor_bit: false,
            vmxe: false,
            exit_cycles: None,
            turbo: true,
            arch_lbr: false,
            tsc_adjust: true,
            xgetbv_ecx1: true,
            processor_trace: PtModel::Supported,
            debugctl_bits: DEBUGCTL_LBR | DEBUGCTL_BTF | DEBUGCTL_BTS_OFF_OS,
            clock_msrs: ClockMsrModel::Native,
            pmu: PmuModel::FULL,
            energy_msrs: true,
            hpet_present: true,
            hpet_period_cycles: Some(HPET_PERIOD_3GHZ),
            tlb_entries: 1536,
            quirks: Quirks::default(),
        }
    }

    /// Zen 3 desktop part.  No leaf 0x15, so the TSC rate falls back.
    pub fn bare_metal_amd() -> Self {
        Self {
            name: "bare-metal-amd",
            vendor: Vendor::Amd,
            signature: 0x00A2_0F10,
            max_leaf: 0x10,
            turbo: false,
            processor_trace: PtModel::Faults,
            debugctl_bits: DEBUGCTL_LBR | DEBUGCTL_BTF,
            energy_msrs: false,
            tlb_entries: 2048,
            ..Self::bare_metal_intel()
        }
    }

    /// Intel guest under KVM with EPT and a virtual PMU.
    pub fn kvm() -> Self {
        Self {
            name: "kvm",
            hypervisor_bit: true,
            exit_cycles: Some(1_200),
            processor_trace: PtModel::Faults,
            debugctl_bits: DEBUGCTL_BTF,
            clock_msrs: ClockMsrModel::Hidden,
            pmu: PmuModel {
                pebs: false,
                ..PmuModel::FULL
            },
            energy_msrs: false,
            quirks: Quirks {
                smi_swallowed: true,
                hv_msrs: true,
                ..Quirks::default()
            },
            ..Self::bare_metal_intel()
        }
    }

    /// Intel guest under VMware with shadow paging and no virtual PMU.
    pub fn vmware() -> Self {
        Self {
            name: "vmware",
            hypervisor_bit: true,
            exit_cycles: Some(1_800),
            turbo: true,
            processor_trace: PtModel::Discards,
            debugctl_bits: 0,
            clock_msrs: ClockMsrModel::Hidden,
            pmu: PmuModel::ABSENT,
            energy_msrs: false,
            hpet_period_cycles: Some(HPET_PERIOD_3GHZ),
            quirks: Quirks {
                smi_swallowed: true,
                vmware_backdoor: true,
                str_sldt_width_bug: true,
                drops_pending_db: true,
                turbo_write_discarded: true,
                btf_ignored: true,
                shadow_paging: true,
                ..Quirks::default()
            },
            ..Self::bare_metal_intel()
        }
    }

    /// Intel guest under Hyper-V, hiding the hypervisor bit.
    pub fn hyperv() -> Self {
        Self {
            name: "hyperv",
            hypervisor_bit: false,
            exit_cycles: Some(1_500),
            processor_trace: PtModel::Faults,
            debugctl_bits: 0,
            clock_msrs: ClockMsrModel::ReadAll,
            pmu: PmuModel {
                writes_stick: false,
                counts: false,
                pebs: false,
                ..PmuModel::FULL
            },
            energy_msrs: false,
            quirks: Quirks {
                smi_swallowed: true,
                cpuid_ignores_subleaf: true,
                xcr_index_full_rcx: true,
                xsetbv_accepts_bad_index: true,
                xsetbv_accepts_reserved_bits: true,
                smsw_truncated: true,
                hv_msrs: true,
                tsc_msr_skew: 50_000,
                tsc_adjust_ignored: true,
                efer_nx_discarded: true,
                ..Quirks::default()
            },
            ..Self::bare_metal_intel()
        }
    }

    pub fn is_virtualized(&self) -> bool {
        self.exit_cycles.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_name_resolves() {
        for name in SimProfile::NAMES {
            assert_eq!(SimProfile::from_name(name).unwrap().name, name);
        }
        assert!(matches!(
            SimProfile::from_name("qemu-tcg"),
            Err(ProbeError::UnknownProfile(_))
        ));
    }

    #[test]
    fn bare_metal_has_no_quirks() {
        for p in [SimProfile::bare_metal_intel(), SimProfile::bare_metal_amd()] {
            assert_eq!(p.quirks, Quirks::default());
            assert!(!p.is_virtualized());
        }
    }
}
