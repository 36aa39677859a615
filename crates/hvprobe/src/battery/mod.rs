//! The detection battery.
//!
//! An ordered list of independent probes run on the calling core.  Each
//! probe writes zero or more flags into the report's
//! [`DetectionRecord`](crate::record::DetectionRecord) and raw numbers
//! into one of the data groups.  A probe whose prerequisite is missing,
//! or that cannot complete safely, leaves its keys out; it never aborts
//! the run.
//!
//! Two scopes exist:
//!
//! * [`BatteryScope::Basic`]: feature flags, the northbridge group (SMI
//!   delivery, hypervisor backdoor port), the processor group, then the
//!   timing fingerprints of every [`CanonicalOp`].
//! * [`BatteryScope::Advanced`]: probes that can upset a misbehaving
//!   hypervisor (extended-control-register emulation, MSR decoding, NX
//!   enforcement).  Callers should only run it once the basic scope has
//!   already shown something.
//!
//! ```
//! use hvprobe::battery::{run_battery, BatteryScope, Platform};
//! use hvprobe::sim::{SimCpu, SimProfile};
//! use hvprobe::ProbeConfig;
//!
//! let cpu = SimCpu::new(SimProfile::hyperv());
//! let platform = Platform::new(&cpu, &cpu);
//! let report = run_battery(&platform, BatteryScope::Advanced, &ProbeConfig::default()).unwrap();
//! assert!(report.detections.is_set("vm.eferNxDiscard"));
//! ```

mod northbridge;
mod processor;

use core::fmt;
use core::str::FromStr;

use alloc::string::ToString;
use log::{debug, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::arch::defs::CR4_VMXE;
use crate::arch::Cpu;
use crate::bench::{execute, fixed_duration, run_all, CanonicalOp, Protocol};
use crate::caps::Capabilities;
use crate::clock::Timekeeper;
use crate::config::ProbeConfig;
use crate::error::{ProbeError, Result};
use crate::mapper::PageMapper;
use crate::metric::pmu::Pmu;
use crate::metric::{MetricSuite, SuiteParams};
use crate::record::{BatteryReport, EvidenceRecord};
use crate::sandbox::{guarded, FaultFilter, FaultTrace};

/// Which probe list [`run_battery`] executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryScope {
    Basic,
    Advanced,
}

impl BatteryScope {
    pub fn name(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Advanced => "advanced",
        }
    }
}

impl FromStr for BatteryScope {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "basic" => Ok(Self::Basic),
            "advanced" => Ok(Self::Advanced),
            other => Err(ProbeError::UnknownScope(other.to_string())),
        }
    }
}

impl fmt::Display for BatteryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The collaborators a run needs: the core to probe, the memory manager,
/// and optionally a [`Timekeeper`] already running on another core.
pub struct Platform<'a, C: Cpu + ?Sized> {
    pub cpu: &'a C,
    pub mapper: &'a dyn PageMapper,
    pub timekeeper: Option<&'a Timekeeper>,
}

impl<'a, C: Cpu + ?Sized> Platform<'a, C> {
    pub fn new(cpu: &'a C, mapper: &'a dyn PageMapper) -> Self {
        Self {
            cpu,
            mapper,
            timekeeper: None,
        }
    }

    pub fn with_timekeeper(mut self, timekeeper: &'a Timekeeper) -> Self {
        self.timekeeper = Some(timekeeper);
        self
    }
}

/// Run the probe list for `scope` on the calling core.
///
/// Only an invalid `config` is an error.  With the basic scope the
/// timekeeper, if any, is stopped once the fingerprints are taken.
pub fn run_battery<C: Cpu + ?Sized>(
    platform: &Platform<'_, C>,
    scope: BatteryScope,
    config: &ProbeConfig,
) -> Result<BatteryReport> {
    config.validate()?;
    let mut probe = Probe::new(platform, config)?;
    info!(
        "battery: {scope} scope on {} (family {:#x}, model {:#x})",
        probe.caps.brand_str(),
        probe.caps.signature.family,
        probe.caps.signature.display_model()
    );

    match scope {
        BatteryScope::Basic => probe.run_basic(),
        BatteryScope::Advanced => probe.run_advanced(),
    }

    let report = probe.report;
    info!(
        "battery: {scope} scope done, {} of {} flags raised",
        report.detections.raised().count(),
        report.detections.len()
    );
    Ok(report)
}

/// Timing fingerprint of one canonical operation: single-shot, or
/// repeated for the configured fixed window when `long` is set.
///
/// Counters are disabled first.  A supplied timekeeper is waited for (up
/// to the configured deadline) but left running.
pub fn measure_operation<C: Cpu + ?Sized>(
    platform: &Platform<'_, C>,
    op: CanonicalOp,
    long: bool,
    config: &ProbeConfig,
) -> Result<EvidenceRecord> {
    config.validate()?;
    let cpu = platform.cpu;
    let protocol = Protocol::from_config(config)?;
    let filter = protocol.filter;
    let mut caps = Capabilities::detect(cpu);
    caps.probe_clock_msrs(cpu, filter);
    Pmu::new(caps.vendor, filter).disable_all(cpu);

    let timekeeper = rendezvous(cpu, platform.timekeeper, config);
    let mut suite = MetricSuite::new(SuiteParams {
        caps: &caps,
        mapper: platform.mapper,
        timekeeper,
        tlb_pages: config.tlb_probe_pages,
        hpet_deadline_cycles: config.hpet_deadline_cycles,
        filter,
    });
    let xcr0 = current_xcr0(cpu, filter);
    let window = caps.cycles_per_us().saturating_mul(config.fixed_duration_us);
    let evidence = fingerprint(cpu, &mut suite, op, long, xcr0, window, &protocol, config);
    debug!(
        "measure {}: {} sources",
        if long { op.long_name() } else { op.name() },
        evidence.len()
    );
    Ok(evidence)
}

/// Wait for the timekeeper; `None` when there is none or it never came up.
fn rendezvous<'t, C: Cpu + ?Sized>(
    cpu: &C,
    timekeeper: Option<&'t Timekeeper>,
    config: &ProbeConfig,
) -> Option<&'t Timekeeper> {
    let Some(clock) = timekeeper else {
        debug!("no timekeeper supplied, cross-core clock unavailable");
        return None;
    };
    if clock.wait_ready(cpu, config.timekeeper_deadline_cycles) {
        Some(clock)
    } else {
        warn!(
            "timekeeper not running after {} cycles, cross-core clock unavailable",
            config.timekeeper_deadline_cycles
        );
        None
    }
}

/// XCR0 as the `xsetbv` operation writes it back; zero if unreadable.
fn current_xcr0<C: Cpu + ?Sized>(cpu: &C, filter: FaultFilter) -> u64 {
    let (xcr0, trace) = guarded(cpu, filter, |cpu| cpu.xgetbv(0));
    if trace.has_fault() {
        0
    } else {
        xcr0
    }
}

#[allow(clippy::too_many_arguments)]
fn fingerprint<C: Cpu + ?Sized>(
    cpu: &C,
    suite: &mut MetricSuite<'_>,
    op: CanonicalOp,
    long: bool,
    xcr0: u64,
    window_cycles: u64,
    protocol: &Protocol,
    config: &ProbeConfig,
) -> EvidenceRecord {
    let once = move || execute(cpu, op, xcr0);
    if long {
        let repeated = fixed_duration(cpu, window_cycles, once);
        run_all(cpu, suite, &repeated, protocol, &config.disabled_metrics)
    } else {
        run_all(cpu, suite, &once, protocol, &config.disabled_metrics)
    }
}

// ─── Probe context ───────────────────────────────────────────────────

/// State shared by the probes of one run.
pub(crate) struct Probe<'a, C: Cpu + ?Sized> {
    cpu: &'a C,
    mapper: &'a dyn PageMapper,
    timekeeper: Option<&'a Timekeeper>,
    config: &'a ProbeConfig,
    protocol: Protocol,
    filter: FaultFilter,
    caps: Capabilities,
    rng: ChaCha8Rng,
    report: BatteryReport,
}

impl<'a, C: Cpu + ?Sized> Probe<'a, C> {
    fn new(platform: &Platform<'a, C>, config: &'a ProbeConfig) -> Result<Self> {
        let cpu = platform.cpu;
        let seed = config.seed.unwrap_or_else(|| cpu.rdtsc());
        let protocol = Protocol::from_config(config)?;
        Ok(Self {
            cpu,
            mapper: platform.mapper,
            timekeeper: platform.timekeeper,
            config,
            protocol,
            filter: protocol.filter,
            caps: Capabilities::detect(cpu),
            rng: ChaCha8Rng::seed_from_u64(seed),
            report: BatteryReport::new(),
        })
    }

    /// Run `body` in a fresh sandbox scope with the configured filter.
    fn guarded<R>(&self, body: impl FnOnce(&C) -> R) -> (R, FaultTrace) {
        guarded(self.cpu, self.filter, body)
    }

    /// PMU access under the configured filter.
    fn pmu(&self) -> Pmu {
        Pmu::new(self.caps.vendor, self.filter)
    }

    fn flag(&mut self, name: &str, value: bool) {
        self.report.detections.flag(name, value);
    }

    fn skip(&self, probe: &str, reason: &str) {
        debug!("probe {probe}: skipped, {reason}");
    }

    fn run_basic(&mut self) {
        let cr4 = self.cpu.read_cr4();
        self.flag("vm.vmxe", cr4 & CR4_VMXE != 0);

        northbridge::test_smi(self);
        northbridge::test_vmw(self);

        processor::collect_info(self);
        processor::test_int(self);
        processor::test_po(self);
        processor::test_pm(self);
        processor::test_dbg(self);
        processor::test_id(self);
        processor::test_clk(self);

        self.run_benchmarks();
    }

    fn run_advanced(&mut self) {
        // test_msr reads the clock-MSR capabilities.
        self.caps.probe_clock_msrs(self.cpu, self.filter);

        processor::test_cr(self);
        processor::test_msr(self);
        processor::test_nx(self);
    }

    fn run_benchmarks(&mut self) {
        let cpu = self.cpu;
        let config = self.config;
        self.pmu().disable_all(cpu);

        let timekeeper = rendezvous(cpu, self.timekeeper, config);
        let xcr0 = current_xcr0(cpu, self.filter);
        let window = self.caps.cycles_per_us().saturating_mul(config.fixed_duration_us);
        let mut suite = MetricSuite::new(SuiteParams {
            caps: &self.caps,
            mapper: self.mapper,
            timekeeper,
            tlb_pages: config.tlb_probe_pages,
            hpet_deadline_cycles: config.hpet_deadline_cycles,
            filter: self.filter,
        });

        let protocol = self.protocol;
        let benchmarks = &mut self.report.data.benchmarks;
        for long in [false, true] {
            for op in CanonicalOp::ALL {
                let key = if long { op.long_name() } else { op.name() };
                let evidence = fingerprint(cpu, &mut suite, op, long, xcr0, window, &protocol, config);
                debug!("benchmark {key}: {} sources", evidence.len());
                benchmarks.insert(key.to_string(), evidence);
            }
        }
        drop(suite);

        if let Some(clock) = self.timekeeper {
            clock.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCpu, SimProfile};
    use alloc::vec::Vec;

    /// Small enough to run the full basic scope quickly on the simulator.
    fn quick() -> ProbeConfig {
        ProbeConfig {
            iterations: 8,
            warmup: 1,
            warm_passes: 2,
            fixed_duration_us: 2,
            tlb_probe_pages: 8,
            seed: Some(7),
            ..ProbeConfig::default()
        }
    }

    fn run(profile: SimProfile, scope: BatteryScope) -> BatteryReport {
        let cpu = SimCpu::new(profile);
        let platform = Platform::new(&cpu, &cpu);
        run_battery(&platform, scope, &quick()).unwrap()
    }

    fn raised(report: &BatteryReport) -> Vec<&str> {
        report.detections.raised().collect()
    }

    #[test]
    fn scope_names_parse() {
        assert_eq!("basic".parse::<BatteryScope>().unwrap(), BatteryScope::Basic);
        assert_eq!(BatteryScope::Advanced.to_string(), "advanced");
        assert!(matches!(
            "everything".parse::<BatteryScope>(),
            Err(ProbeError::UnknownScope(_))
        ));
    }

    #[test]
    fn invalid_config_is_rejected_before_probing() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let platform = Platform::new(&cpu, &cpu);
        let config = ProbeConfig {
            iterations: 0,
            ..quick()
        };
        assert!(matches!(
            run_battery(&platform, BatteryScope::Basic, &config),
            Err(ProbeError::InvalidConfig(_))
        ));
        assert_eq!(cpu.instructions_retired(), 0);
    }

    #[test]
    fn bare_metal_raises_nothing() {
        for profile in [SimProfile::bare_metal_intel(), SimProfile::bare_metal_amd()] {
            let name = profile.name;
            let basic = run(profile.clone(), BatteryScope::Basic);
            assert!(raised(&basic).is_empty(), "{name}: {:?}", raised(&basic));
            let advanced = run(profile, BatteryScope::Advanced);
            assert!(raised(&advanced).is_empty(), "{name}: {:?}", raised(&advanced));
        }
    }

    #[test]
    fn basic_report_has_every_fingerprint() {
        let report = run(SimProfile::bare_metal_intel(), BatteryScope::Basic);
        for op in CanonicalOp::ALL {
            for key in [op.name(), op.long_name()] {
                let evidence = &report.data.benchmarks[key];
                assert!(evidence.get("tsc").is_some(), "{key}: {evidence:?}");
                assert!(evidence.get("mpc").is_none());
            }
        }
        let nop = report.data.benchmarks["nop"].get("tsc").unwrap();
        let cpuid = report.data.benchmarks["cpuid"].get("tsc").unwrap();
        let cpuid_long = report.data.benchmarks["cpuidLong"].get("tsc").unwrap();
        assert!(nop < cpuid && cpuid < cpuid_long);
    }

    #[test]
    fn kvm_is_caught_by_hypervisor_bit_and_smis() {
        let report = run(SimProfile::kvm(), BatteryScope::Basic);
        let flags = raised(&report);
        for expected in ["vm.hvFlagSet", "vm.smiSuppressed", "vm.hiddenClocks", "vm.ptSuppressed"] {
            assert!(flags.contains(&expected), "missing {expected}: {flags:?}");
        }
        assert!(!report.detections.is_set("vm.btfSuppressed"));
        assert!(!report.detections.is_set("vm.vmwareIo"));
    }

    #[test]
    fn vmware_quirks_are_all_visible() {
        let report = run(SimProfile::vmware(), BatteryScope::Basic);
        let flags = raised(&report);
        for expected in [
            "vm.vmwareIo",
            "vm.strEmulFail",
            "vm.sldtEmulFail",
            "vm.dbSuppressed",
            "vm.turboSuppressed",
            "vm.btfSuppressed",
            "vm.ptSuppressed",
            "vm.hiddenClocks",
        ] {
            assert!(flags.contains(&expected), "missing {expected}: {flags:?}");
        }
        assert_eq!(
            report.data.processor.get("failedSettingPmcs"),
            Some(&crate::record::Value::Bool(true))
        );
        assert_eq!(
            report.data.processor.get("dbsDelivered"),
            Some(&crate::record::Value::Int(0))
        );
    }

    #[test]
    fn hyperv_hides_the_bit_but_not_the_rest() {
        let basic = run(SimProfile::hyperv(), BatteryScope::Basic);
        assert!(!basic.detections.is_set("vm.hvFlagSet"));
        let flags = raised(&basic);
        for expected in [
            "vm.pmcMsrMismatch",
            "vm.pmcDead",
            "vm.cpuidEcxSuppressed",
            "vm.tscWarped",
        ] {
            assert!(flags.contains(&expected), "missing {expected}: {flags:?}");
        }

        let advanced = run(SimProfile::hyperv(), BatteryScope::Advanced);
        let flags = raised(&advanced);
        for expected in [
            "vm.xgetbvEmulFail",
            "vm.xsetbvLeafEmulFail",
            "vm.xsetbvLeafEmulFail2",
            "vm.smswEmulFail",
            "vm.msrDefaultInvalid",
            "vm.hvMsrs",
            "vm.tscMsrEmulFail",
            "vm.eferNxDiscard",
        ] {
            assert!(flags.contains(&expected), "missing {expected}: {flags:?}");
        }
    }

    #[test]
    fn invalid_xsetbv_selector_faults_on_hardware() {
        // The architecture guarantees #GP for XCR3; only a broken emulator
        // accepts it.
        let bare = run(SimProfile::bare_metal_intel(), BatteryScope::Advanced);
        assert!(bare.detections.contains("vm.xsetbvLeafEmulFail"));
        assert!(!bare.detections.is_set("vm.xsetbvLeafEmulFail"));

        let mut profile = SimProfile::bare_metal_intel();
        profile.quirks.xsetbv_accepts_bad_index = true;
        let broken = run(profile, BatteryScope::Advanced);
        assert!(broken.detections.is_set("vm.xsetbvLeafEmulFail"));
    }

    #[test]
    fn smi_data_matches_trigger_count() {
        let report = run(SimProfile::bare_metal_intel(), BatteryScope::Basic);
        let expected = report.data.northbridge.get("smiExpected").cloned();
        assert!(expected.is_some());
        assert_eq!(expected.as_ref(), report.data.northbridge.get("smiReceived"));

        let kvm = run(SimProfile::kvm(), BatteryScope::Basic);
        assert_ne!(
            kvm.data.northbridge.get("smiExpected"),
            kvm.data.northbridge.get("smiReceived")
        );
    }

    #[test]
    fn advanced_scope_releases_its_page() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let platform = Platform::new(&cpu, &cpu);
        run_battery(&platform, BatteryScope::Advanced, &quick()).unwrap();
        assert_eq!(cpu.allocated_pages(), 0);
    }

    #[test]
    fn report_serializes_grouped() {
        let report = run(SimProfile::vmware(), BatteryScope::Basic);
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["detections"]["vm.vmwareIo"], serde_json::json!(true));
        assert_eq!(v["data"]["processor"]["brand"], serde_json::json!("GenuineIntel"));
        assert!(v["data"]["benchmarks"]["smiLong"]["tsc"].is_u64());
    }

    #[test]
    fn same_seed_same_report() {
        let a = run(SimProfile::kvm(), BatteryScope::Basic);
        let b = run(SimProfile::kvm(), BatteryScope::Basic);
        assert_eq!(a, b);
    }

    #[test]
    fn measure_nop_on_reference_hardware() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let platform = Platform::new(&cpu, &cpu);
        let evidence =
            measure_operation(&platform, CanonicalOp::Nop, false, &ProbeConfig::default()).unwrap();
        let tsc = evidence.get("tsc").unwrap();
        assert!(tsc > 0 && tsc < 100, "nop measured {tsc}");
        assert!(evidence.get("mpc").is_none());
    }

    #[test]
    fn measure_long_spans_the_window() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let platform = Platform::new(&cpu, &cpu);
        let config = quick();
        let evidence = measure_operation(&platform, CanonicalOp::Alu, true, &config).unwrap();
        let window = 3_000 * config.fixed_duration_us;
        assert!(u64::from(evidence.get("tsc").unwrap()) >= window);
    }

    #[test]
    fn unarrived_timekeeper_degrades_to_no_mpc() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let clock = Timekeeper::new();
        let platform = Platform::new(&cpu, &cpu).with_timekeeper(&clock);
        let config = ProbeConfig {
            timekeeper_deadline_cycles: 10_000,
            ..quick()
        };
        let evidence = measure_operation(&platform, CanonicalOp::Nop, false, &config).unwrap();
        assert!(evidence.get("mpc").is_none());
        assert!(evidence.get("tsc").is_some());
    }

    #[cfg(feature = "std")]
    #[test]
    fn running_timekeeper_adds_mpc_and_is_stopped() {
        use crate::clock::TimekeeperThread;

        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let thread = TimekeeperThread::spawn(None).unwrap();
        let platform = Platform::new(&cpu, &cpu).with_timekeeper(thread.clock());
        let report = run_battery(&platform, BatteryScope::Basic, &quick()).unwrap();
        assert!(report.data.benchmarks["nop"].get("mpc").is_some());
        assert!(thread.clock().is_stopped());
    }
}
