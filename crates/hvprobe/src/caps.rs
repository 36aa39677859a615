//! Capability query result handed to the metric sources and the battery.
//!
//! Built once per run from CPUID ([`Capabilities::detect`]) and refined by
//! sandboxed MSR reads ([`Capabilities::probe_clock_msrs`]).  Passing it
//! around explicitly lets tests construct synthetic capability sets.

use log::debug;
use serde::Serialize;

use crate::arch::defs::*;
use crate::arch::{vendor_bytes, Cpu};
use crate::sandbox::{try_rdmsr, FaultFilter};

/// TSC rate assumed when neither leaf 0x15 nor 0x16 reports one.
pub const FALLBACK_TSC_HZ: u64 = 3_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Intel,
    Amd,
    Other,
}

/// How a free-running clock MSR can be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMsr {
    /// Faults, or reads as zero.
    #[default]
    Absent,
    /// Readable at the architectural address only.
    Legacy,
    /// Also readable at the read-only alias (`msr | 0xC000_0000`).
    Aliased,
}

impl ClockMsr {
    pub fn is_present(self) -> bool {
        self != Self::Absent
    }
}

/// Decoded leaf 0x1 EAX.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Signature {
    pub family: u32,
    pub model: u32,
    pub processor_type: u32,
    pub stepping: u32,
    pub extended_family: u32,
    pub extended_model: u32,
}

impl Signature {
    pub fn from_eax(eax: u32) -> Self {
        Self {
            stepping: eax & 0xF,
            model: (eax >> 4) & 0xF,
            family: (eax >> 8) & 0xF,
            processor_type: (eax >> 12) & 0x3,
            extended_model: (eax >> 16) & 0xF,
            extended_family: (eax >> 20) & 0xFF,
        }
    }

    /// Model number with the extended model folded in where the SDM says
    /// it applies (families 6 and 0xF).
    pub fn display_model(&self) -> u32 {
        match self.family {
            0x6 | 0xF => self.model + (self.extended_model << 4),
            _ => self.model,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub vendor: Vendor,
    pub brand: [u8; 12],
    pub max_leaf: u32,
    pub signature: Signature,
    pub hypervisor_bit: bool,
    pub tsc_hz: u64,
    pub mperf: ClockMsr,
    pub aperf: ClockMsr,
    pub pperf: ClockMsr,
    pub irperf: ClockMsr,
}

impl Capabilities {
    /// Everything CPUID can tell; clock MSRs start out [`ClockMsr::Absent`].
    pub fn detect<C: Cpu + ?Sized>(cpu: &C) -> Self {
        let leaf0 = cpu.cpuid(CPUID_LEAF_VENDOR, 0);
        let brand = vendor_bytes(&leaf0);
        let vendor = if [leaf0.ebx, leaf0.edx, leaf0.ecx] == VENDOR_INTEL {
            Vendor::Intel
        } else if [leaf0.ebx, leaf0.edx, leaf0.ecx] == VENDOR_AMD {
            Vendor::Amd
        } else {
            Vendor::Other
        };
        let leaf1 = cpu.cpuid(CPUID_LEAF_FEATURES, 0);

        let caps = Self {
            vendor,
            brand,
            max_leaf: leaf0.eax,
            signature: Signature::from_eax(leaf1.eax),
            hypervisor_bit: leaf1.ecx & CPUID_1_ECX_HYPERVISOR != 0,
            tsc_hz: tsc_frequency(cpu, leaf0.eax),
            mperf: ClockMsr::Absent,
            aperf: ClockMsr::Absent,
            pperf: ClockMsr::Absent,
            irperf: ClockMsr::Absent,
        };
        debug!(
            "caps: {:?} max leaf {:#x}, tsc {} Hz",
            caps.vendor, caps.max_leaf, caps.tsc_hz
        );
        caps
    }

    pub fn is_intel(&self) -> bool {
        self.vendor == Vendor::Intel
    }

    pub fn brand_str(&self) -> &str {
        core::str::from_utf8(&self.brand).unwrap_or("")
    }

    /// Leaf `leaf` exists on this processor.
    pub fn has_leaf(&self, leaf: u32) -> bool {
        self.max_leaf >= leaf
    }

    /// Probe MPERF, APERF, PPERF and IRPERF.  Returns `true` if any of them
    /// read back as zero, which no running core should report.  Only the
    /// vectors in `filter` make a read count as faulted.
    pub fn probe_clock_msrs<C: Cpu + ?Sized>(&mut self, cpu: &C, filter: FaultFilter) -> bool {
        let mut null_clock = false;
        for (msr, out) in [
            (IA32_MPERF, &mut self.mperf),
            (IA32_APERF, &mut self.aperf),
            (IA32_PPERF, &mut self.pperf),
            (IA32_IRPERF, &mut self.irperf),
        ] {
            let (state, null) = probe_clock_msr(cpu, filter, msr);
            *out = state;
            null_clock |= null;
        }
        null_clock
    }

    /// Cycles per microsecond, rounded down, never zero.
    pub fn cycles_per_us(&self) -> u64 {
        (self.tsc_hz / 1_000_000).max(1)
    }
}

fn probe_clock_msr<C: Cpu + ?Sized>(cpu: &C, filter: FaultFilter, msr: u32) -> (ClockMsr, bool) {
    match try_rdmsr(cpu, filter, msr) {
        None => return (ClockMsr::Absent, false),
        Some(0) => return (ClockMsr::Absent, true),
        Some(_) => {}
    }
    match try_rdmsr(cpu, filter, msr | MSR_READ_ONLY_ALIAS) {
        Some(_) => (ClockMsr::Aliased, false),
        None => (ClockMsr::Legacy, false),
    }
}

fn tsc_frequency<C: Cpu + ?Sized>(cpu: &C, max_leaf: u32) -> u64 {
    if max_leaf >= CPUID_LEAF_TSC_INFO {
        let r = cpu.cpuid(CPUID_LEAF_TSC_INFO, 0);
        if r.eax != 0 && r.ebx != 0 && r.ecx != 0 {
            return u64::from(r.ecx) * u64::from(r.ebx) / u64::from(r.eax);
        }
    }
    if max_leaf >= CPUID_LEAF_FREQ_INFO {
        let r = cpu.cpuid(CPUID_LEAF_FREQ_INFO, 0);
        if r.eax & 0xFFFF != 0 {
            return u64::from(r.eax & 0xFFFF) * 1_000_000;
        }
    }
    FALLBACK_TSC_HZ
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCpu, SimProfile};

    #[test]
    fn signature_folds_extended_model() {
        // Family 6, model 0xE, extended model 0x9 (Kaby Lake).
        let sig = Signature::from_eax(0x0009_06E9);
        assert_eq!(sig.family, 6);
        assert_eq!(sig.stepping, 9);
        assert_eq!(sig.display_model(), 0x9E);

        let amd = Signature::from_eax(0x00A2_0F10);
        assert_eq!(amd.family, 0xF);
        assert_eq!(amd.extended_family, 0xA);
    }

    #[test]
    fn detect_reads_vendor_and_hypervisor_bit() {
        let bare = Capabilities::detect(&SimCpu::new(SimProfile::bare_metal_intel()));
        assert!(bare.is_intel());
        assert_eq!(bare.brand_str(), "GenuineIntel");
        assert!(!bare.hypervisor_bit);

        let amd = Capabilities::detect(&SimCpu::new(SimProfile::bare_metal_amd()));
        assert_eq!(amd.vendor, Vendor::Amd);

        let kvm = Capabilities::detect(&SimCpu::new(SimProfile::kvm()));
        assert!(kvm.hypervisor_bit);
    }

    #[test]
    fn tsc_frequency_comes_from_cpuid() {
        let profile = SimProfile::bare_metal_intel();
        let hz = profile.tsc_hz;
        let caps = Capabilities::detect(&SimCpu::new(profile));
        assert_eq!(caps.tsc_hz, hz);
        assert_eq!(caps.cycles_per_us(), hz / 1_000_000);
    }

    #[test]
    fn clock_msr_aliases_follow_vendor() {
        // The read-only aliases are AMD registers; Intel faults on them.
        let intel = SimCpu::new(SimProfile::bare_metal_intel());
        let mut caps = Capabilities::detect(&intel);
        assert!(!caps.probe_clock_msrs(&intel, FaultFilter::DEFAULT));
        assert_eq!(caps.mperf, ClockMsr::Legacy);
        assert_eq!(caps.aperf, ClockMsr::Legacy);
        assert_eq!(caps.irperf, ClockMsr::Absent);

        let amd = SimCpu::new(SimProfile::bare_metal_amd());
        let mut caps = Capabilities::detect(&amd);
        assert!(!caps.probe_clock_msrs(&amd, FaultFilter::DEFAULT));
        assert_eq!(caps.mperf, ClockMsr::Aliased);
        assert!(caps.irperf.is_present());
    }

    #[test]
    fn hidden_clock_msrs_are_absent() {
        let mut profile = SimProfile::kvm();
        profile.clock_msrs = crate::sim::ClockMsrModel::Hidden;
        let cpu = SimCpu::new(profile);
        let mut caps = Capabilities::detect(&cpu);
        assert!(!caps.probe_clock_msrs(&cpu, FaultFilter::DEFAULT));
        assert_eq!(caps.mperf, ClockMsr::Absent);
        assert!(!caps.pperf.is_present());
    }

    #[test]
    fn null_clock_msrs_are_flagged() {
        let mut profile = SimProfile::kvm();
        profile.clock_msrs = crate::sim::ClockMsrModel::Null;
        let cpu = SimCpu::new(profile);
        let mut caps = Capabilities::detect(&cpu);
        assert!(caps.probe_clock_msrs(&cpu, FaultFilter::DEFAULT));
        assert_eq!(caps.aperf, ClockMsr::Absent);
    }

    #[test]
    fn uncounted_faults_read_as_zero() {
        // With no vector counted, the faulting IRPERF read and the Intel
        // alias reads fall through with the value 0.
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let mut caps = Capabilities::detect(&cpu);
        assert!(caps.probe_clock_msrs(&cpu, FaultFilter::NONE));
        assert_eq!(caps.irperf, ClockMsr::Absent);
        assert_eq!(caps.mperf, ClockMsr::Aliased);
    }
}
