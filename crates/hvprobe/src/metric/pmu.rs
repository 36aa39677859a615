//! Performance-monitoring unit programming.
//!
//! Only what the metric sources and the battery need: general-purpose
//! counter 0..N on Intel (architectural perfmon) and AMD (legacy
//! `PERF_CTL`/`PERF_CTR` banks), plus the three Intel fixed counters.
//! Every register access is sandboxed; a fault means "not available".

use crate::arch::defs::*;
use crate::arch::Cpu;
use crate::caps::Vendor;
use crate::sandbox::{guarded, try_rdmsr, try_wrmsr, FaultFilter};

/// Event-select: count in ring 3.
pub const EVTSEL_USR: u64 = 1 << 16;
/// Event-select: count in ring 0.
pub const EVTSEL_OS: u64 = 1 << 17;
/// Event-select: counter enable.
pub const EVTSEL_EN: u64 = 1 << 22;

/// RDPMC selector bit picking the fixed-function bank.
pub const RDPMC_FIXED: u32 = 1 << 30;

/// Number of general-purpose counters the battery resets.
pub const GENERAL_COUNTERS: u32 = 8;

/// Width of the general and fixed counters.
pub const COUNTER_MASK: u64 = (1 << 48) - 1;

/// Events the probes count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmcEvent {
    InstructionsRetired,
    CoreCycles,
    ReferenceCycles,
    SmiReceived,
}

impl PmcEvent {
    /// Event-select encoding (event | umask << 8) for a general counter.
    pub fn encoding(self, vendor: Vendor) -> Option<u64> {
        match (vendor, self) {
            (Vendor::Intel, Self::InstructionsRetired) => Some(0x00C0),
            (Vendor::Intel, Self::CoreCycles) => Some(0x003C),
            (Vendor::Intel, Self::ReferenceCycles) => Some(0x013C),
            (Vendor::Amd, Self::InstructionsRetired) => Some(0x00C0),
            (Vendor::Amd, Self::CoreCycles) => Some(0x0076),
            (Vendor::Amd, Self::SmiReceived) => Some(0x002B),
            _ => None,
        }
    }
}

/// Intel fixed-function counters, by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixedCounter {
    InstructionsRetired = 0,
    CoreCycles = 1,
    ReferenceCycles = 2,
}

impl FixedCounter {
    pub const ALL: [Self; 3] = [
        Self::InstructionsRetired,
        Self::CoreCycles,
        Self::ReferenceCycles,
    ];

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn rdpmc_selector(self) -> u32 {
        RDPMC_FIXED | self.index()
    }
}

fn evtsel_msr(vendor: Vendor, index: u32) -> Option<u32> {
    match vendor {
        Vendor::Intel => Some(IA32_PERFEVTSEL0 + index),
        Vendor::Amd => Some(AMD_PERF_EVTSEL0 + index),
        Vendor::Other => None,
    }
}

fn counter_msr(vendor: Vendor, index: u32) -> Option<u32> {
    match vendor {
        Vendor::Intel => Some(IA32_PMC0 + index),
        Vendor::Amd => Some(AMD_PERF_CTR0 + index),
        Vendor::Other => None,
    }
}

/// PMU access for one vendor.  Every register access runs in its own
/// sandbox scope with `filter`; a counted fault means "not available".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pmu {
    pub vendor: Vendor,
    pub filter: FaultFilter,
}

impl Pmu {
    pub fn new(vendor: Vendor, filter: FaultFilter) -> Self {
        Self { vendor, filter }
    }

    /// Program general counter `index` to count `event` in ring 0.
    pub fn dynamic_enable<C: Cpu + ?Sized>(&self, cpu: &C, index: u32, event: PmcEvent) -> bool {
        let vendor = self.vendor;
        let (Some(evtsel), Some(code)) = (evtsel_msr(vendor, index), event.encoding(vendor)) else {
            return false;
        };
        let ((), trace) = guarded(cpu, self.filter, |cpu| {
            cpu.wrmsr(evtsel, code | EVTSEL_OS | EVTSEL_EN);
            if vendor == Vendor::Intel {
                let global = cpu.rdmsr(IA32_PERF_GLOBAL_CTRL);
                cpu.wrmsr(IA32_PERF_GLOBAL_CTRL, global | (1 << index));
            }
        });
        !trace.has_fault()
    }

    pub fn dynamic_disable<C: Cpu + ?Sized>(&self, cpu: &C, index: u32) -> bool {
        evtsel_msr(self.vendor, index).is_some_and(|evtsel| try_wrmsr(cpu, self.filter, evtsel, 0))
    }

    pub fn dynamic_set_value<C: Cpu + ?Sized>(&self, cpu: &C, index: u32, value: u64) -> bool {
        counter_msr(self.vendor, index).is_some_and(|ctr| try_wrmsr(cpu, self.filter, ctr, value))
    }

    /// Counter value through the MSR interface; zero if unreadable.
    pub fn dynamic_value<C: Cpu + ?Sized>(&self, cpu: &C, index: u32) -> u64 {
        counter_msr(self.vendor, index)
            .and_then(|ctr| try_rdmsr(cpu, self.filter, ctr))
            .unwrap_or(0)
    }

    /// Enable a fixed counter for ring 0.  Intel only.
    pub fn fixed_enable<C: Cpu + ?Sized>(&self, cpu: &C, counter: FixedCounter) -> bool {
        if self.vendor != Vendor::Intel {
            return false;
        }
        let shift = counter.index() * 4;
        let ((), trace) = guarded(cpu, self.filter, |cpu| {
            let ctrl = cpu.rdmsr(IA32_FIXED_CTR_CTRL);
            // Field value 1: count in ring 0 only.
            cpu.wrmsr(IA32_FIXED_CTR_CTRL, (ctrl & !(0xF << shift)) | (0x1 << shift));
            let global = cpu.rdmsr(IA32_PERF_GLOBAL_CTRL);
            cpu.wrmsr(IA32_PERF_GLOBAL_CTRL, global | fixed_global_bit(counter));
        });
        !trace.has_fault()
    }

    /// Clear the counter's control field and its global enable bit.
    pub fn fixed_disable<C: Cpu + ?Sized>(&self, cpu: &C, counter: FixedCounter) -> bool {
        if self.vendor != Vendor::Intel {
            return false;
        }
        let shift = counter.index() * 4;
        let ((), trace) = guarded(cpu, self.filter, |cpu| {
            let ctrl = cpu.rdmsr(IA32_FIXED_CTR_CTRL);
            cpu.wrmsr(IA32_FIXED_CTR_CTRL, ctrl & !(0xF << shift));
            let global = cpu.rdmsr(IA32_PERF_GLOBAL_CTRL);
            cpu.wrmsr(IA32_PERF_GLOBAL_CTRL, global & !fixed_global_bit(counter));
        });
        !trace.has_fault()
    }

    /// Turn every counter off, as a clean slate before timing.
    pub fn disable_all<C: Cpu + ?Sized>(&self, cpu: &C) {
        for counter in FixedCounter::ALL {
            self.fixed_disable(cpu, counter);
        }
        for index in 0..GENERAL_COUNTERS {
            self.dynamic_disable(cpu, index);
        }
    }
}

fn fixed_global_bit(counter: FixedCounter) -> u64 {
    1 << (32 + counter.index())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCpu, SimProfile};

    fn intel() -> Pmu {
        Pmu::new(Vendor::Intel, FaultFilter::DEFAULT)
    }

    #[test]
    fn encodings_are_vendor_specific() {
        assert_eq!(PmcEvent::SmiReceived.encoding(Vendor::Intel), None);
        assert_eq!(PmcEvent::SmiReceived.encoding(Vendor::Amd), Some(0x2B));
        assert_eq!(PmcEvent::ReferenceCycles.encoding(Vendor::Amd), None);
        assert_eq!(PmcEvent::InstructionsRetired.encoding(Vendor::Other), None);
    }

    #[test]
    fn fixed_counter_selector() {
        assert_eq!(FixedCounter::ReferenceCycles.rdpmc_selector(), 0x4000_0002);
    }

    #[test]
    fn counter_written_value_reads_back() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let pmu = intel();
        assert!(pmu.dynamic_disable(&cpu, 0));
        assert!(pmu.dynamic_set_value(&cpu, 0, 0x1234));
        assert_eq!(pmu.dynamic_value(&cpu, 0), 0x1234);
    }

    #[test]
    fn enabled_counter_advances() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let pmu = intel();
        assert!(pmu.dynamic_set_value(&cpu, 0, 100));
        assert!(pmu.dynamic_enable(&cpu, 0, PmcEvent::InstructionsRetired));
        cpu.cpuid(0, 0);
        assert!(pmu.dynamic_disable(&cpu, 0));
        assert!(pmu.dynamic_value(&cpu, 0) > 100);
    }

    #[test]
    fn fixed_disable_clears_global_enable() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let pmu = intel();
        let bit = fixed_global_bit(FixedCounter::CoreCycles);
        assert!(pmu.fixed_enable(&cpu, FixedCounter::CoreCycles));
        assert_ne!(cpu.rdmsr(IA32_PERF_GLOBAL_CTRL) & bit, 0);
        assert!(pmu.fixed_disable(&cpu, FixedCounter::CoreCycles));
        assert_eq!(cpu.rdmsr(IA32_PERF_GLOBAL_CTRL) & bit, 0);
        assert_eq!(cpu.rdmsr(IA32_FIXED_CTR_CTRL) & (0xF << 4), 0);
    }

    #[test]
    fn missing_pmu_reports_failure() {
        let mut profile = SimProfile::kvm();
        profile.pmu.present = false;
        let cpu = SimCpu::new(profile);
        let pmu = intel();
        assert!(!pmu.dynamic_disable(&cpu, 0));
        assert!(!pmu.fixed_enable(&cpu, FixedCounter::CoreCycles));
        assert_eq!(pmu.dynamic_value(&cpu, 0), 0);
    }

    #[test]
    fn filter_decides_whether_a_register_fault_counts() {
        let mut profile = SimProfile::kvm();
        profile.pmu.present = false;
        let cpu = SimCpu::new(profile);
        let blind = Pmu::new(Vendor::Intel, FaultFilter::NONE);
        assert!(blind.dynamic_disable(&cpu, 0));
        assert!(blind.fixed_enable(&cpu, FixedCounter::CoreCycles));
    }
}
