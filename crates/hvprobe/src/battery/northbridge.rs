//! Chipset-side probes: SMI delivery and the hypervisor backdoor port.

use rand::Rng;

use super::Probe;
use crate::arch::defs::*;
use crate::arch::{BackdoorRegs, Cpu};
use crate::caps::Vendor;
use crate::metric::pmu::{PmcEvent, Pmu, COUNTER_MASK};

/// Where SMI arrivals are counted.
#[derive(Clone, Copy)]
enum SmiCounter {
    /// General counter 0 programmed for the SMI-received event.
    Pmc(Pmu),
    /// `MSR_SMI_COUNT`.
    Msr,
}

impl SmiCounter {
    fn read<C: Cpu + ?Sized>(self, cpu: &C) -> u64 {
        match self {
            Self::Pmc(pmu) => pmu.dynamic_value(cpu, 0),
            Self::Msr => cpu.rdmsr(IA32_SMI_COUNT),
        }
    }

    /// Bits the counter keeps before it wraps.
    fn mask(self) -> u64 {
        match self {
            Self::Pmc(_) => COUNTER_MASK,
            Self::Msr => u64::MAX,
        }
    }

    /// Arrivals between two reads, across a wrap of the counter.
    fn delta(self, before: u64, after: u64) -> u64 {
        after.wrapping_sub(before) & self.mask()
    }
}

/// Write the APM control port a random number of times and check that
/// every write reached SMM.
pub(super) fn test_smi<C: Cpu + ?Sized>(p: &mut Probe<'_, C>) {
    let cpu = p.cpu;
    let pmu = p.pmu();

    // The SMI-received event only has an AMD encoding, so this is the
    // path AMD parts take; Intel falls through to MSR_SMI_COUNT.
    let counter = if pmu.dynamic_enable(cpu, 0, PmcEvent::SmiReceived) {
        SmiCounter::Pmc(pmu)
    } else if pmu.vendor == Vendor::Intel {
        let ((), trace) = p.guarded(|cpu| {
            cpu.rdmsr(IA32_SMI_COUNT);
        });
        if trace.has_fault() {
            p.skip("smi", "no SMI counter");
            return;
        }
        SmiCounter::Msr
    } else {
        p.skip("smi", "no SMI counter");
        return;
    };

    let count = p.rng.gen_range(p.config.smi_min..=p.config.smi_max);
    let before = counter.read(cpu);
    for _ in 0..count {
        cpu.outb(PORT_APM_CONTROL, 0);
    }
    let after = counter.read(cpu);

    if let SmiCounter::Pmc(pmu) = counter {
        pmu.dynamic_disable(cpu, 0);
    }

    let expected = before.wrapping_add(u64::from(count)) & counter.mask();
    p.flag("vm.smiSuppressed", counter.delta(before, after) < u64::from(count));
    p.report.data.northbridge.set("smiExpected", expected);
    p.report.data.northbridge.set("smiReceived", after);
}

/// Ask the backdoor port for its version.  Hardware leaves the port
/// undecoded, so only a hypervisor can echo the magic back.
pub(super) fn test_vmw<C: Cpu + ?Sized>(p: &mut Probe<'_, C>) {
    let reply = p.cpu.backdoor(BackdoorRegs {
        eax: VMWARE_MAGIC,
        ebx: !VMWARE_MAGIC,
        ecx: VMWARE_CMD_GET_VERSION,
        edx: u32::from(PORT_VMWARE_BACKDOOR),
    });
    p.flag("vm.vmwareIo", reply.ebx == VMWARE_MAGIC);
}

#[cfg(test)]
mod tests {
    use super::super::{run_battery, BatteryScope, Platform};
    use super::*;
    use crate::config::ProbeConfig;
    use crate::record::{BatteryReport, Value};
    use crate::sim::{SimCpu, SimProfile};

    const SMIS: u32 = 4;

    fn basic(cpu: &SimCpu) -> BatteryReport {
        let config = ProbeConfig {
            iterations: 4,
            warmup: 1,
            warm_passes: 1,
            fixed_duration_us: 1,
            tlb_probe_pages: 4,
            smi_min: SMIS,
            smi_max: SMIS,
            seed: Some(3),
            ..ProbeConfig::default()
        };
        let platform = Platform::new(cpu, cpu);
        run_battery(&platform, BatteryScope::Basic, &config).unwrap()
    }

    fn smi_data(report: &BatteryReport) -> (Option<&Value>, Option<&Value>) {
        let nb = &report.data.northbridge;
        (nb.get("smiExpected"), nb.get("smiReceived"))
    }

    #[test]
    fn smi_count_msr_wrapping_is_not_suppression() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        cpu.set_smi_count(u64::MAX - 1);
        let report = basic(&cpu);
        assert!(report.detections.contains("vm.smiSuppressed"));
        assert!(!report.detections.is_set("vm.smiSuppressed"));
        let wrapped = Value::Int(u64::from(SMIS) - 2);
        assert_eq!(smi_data(&report), (Some(&wrapped), Some(&wrapped)));
    }

    #[test]
    fn smi_pmc_wrapping_at_counter_width_is_not_suppression() {
        let cpu = SimCpu::new(SimProfile::bare_metal_amd());
        cpu.wrmsr(AMD_PERF_CTR0, COUNTER_MASK - 1);
        let report = basic(&cpu);
        assert!(report.detections.contains("vm.smiSuppressed"));
        assert!(!report.detections.is_set("vm.smiSuppressed"));
        let wrapped = Value::Int(u64::from(SMIS) - 2);
        assert_eq!(smi_data(&report), (Some(&wrapped), Some(&wrapped)));
    }

    #[test]
    fn swallowed_smis_are_still_caught_near_the_wrap() {
        let cpu = SimCpu::new(SimProfile::kvm());
        cpu.set_smi_count(u64::MAX);
        let report = basic(&cpu);
        assert!(report.detections.is_set("vm.smiSuppressed"));
    }
}
