//! Measurement protocol: warm up, measure, take the median.
//!
//! [`measure`] runs one operation against one [`Metric`]:
//!
//! 1. Enter a sandbox scope for the whole measurement (interrupts off).
//! 2. `prepare` the source and take one trial sample; a failed prepare or
//!    a faulting trial means the source is unavailable.
//! 3. Flush caches and the TLB.
//! 4. Run `warmup` discarded plus `iterations` kept rounds.  Each round
//!    first repeats a short warming loop (touch the operation's code and
//!    the stack, occasionally run the operation, fence), then brackets a
//!    single call to the operation with two samples.
//! 5. `release`, sort the truncated 32-bit deltas, and return the
//!    configured percentile.
//!
//! [`run_all`] repeats that for every source in a [`MetricSuite`] and
//! keeps only the successful ones.

use alloc::vec;
use core::hint::black_box;

use log::debug;

use crate::arch::Cpu;
use crate::config::ProbeConfig;
use crate::error::Result;
use crate::metric::{Metric, MetricSuite};
use crate::record::EvidenceRecord;
use crate::sandbox::{FaultFilter, FaultTrace, SandboxScope};

/// The operation runs inside the warming loop when `rdtsc % this == 0`,
/// i.e. almost never, but the compiler cannot prove it.
const WARM_CALL_MODULUS: u64 = 0xDEAD_BEEF;

/// Distance below the stack pointer touched by the warming loop.
const STACK_TOUCH_OFFSET: u64 = 16 * 8;

/// Protocol parameters, usually taken from [`ProbeConfig`].
#[derive(Debug, Clone, Copy)]
pub struct Protocol {
    pub iterations: usize,
    pub warmup: usize,
    pub warm_passes: usize,
    pub percentile: f64,
    /// Vectors that make the trial sample count as faulted.
    pub filter: FaultFilter,
}

impl Protocol {
    pub fn from_config(config: &ProbeConfig) -> Result<Self> {
        Ok(Self {
            iterations: config.iterations,
            warmup: config.warmup,
            warm_passes: config.warm_passes,
            percentile: config.percentile,
            filter: config.fault_filter()?,
        })
    }
}

impl Default for Protocol {
    fn default() -> Self {
        let config = ProbeConfig::default();
        Self {
            iterations: config.iterations,
            warmup: config.warmup,
            warm_passes: config.warm_passes,
            percentile: config.percentile,
            filter: FaultFilter::DEFAULT,
        }
    }
}

/// Element of a sorted slice at percentile `p` (0.0..=1.0), nearest rank.
pub fn percentile(sorted: &[u32], p: f64) -> Option<u32> {
    if sorted.is_empty() {
        return None;
    }
    let last = sorted.len() - 1;
    let index = ((last as f64) * p.clamp(0.0, 1.0) + 0.5) as usize;
    sorted.get(index.min(last)).copied()
}

#[inline(never)]
fn invoke<F: Fn()>(op: &F) {
    op();
}

/// Measure `op` with `metric`.  `None` when the source is unavailable.
pub fn measure<C, M, F>(cpu: &C, metric: &mut M, op: &F, protocol: &Protocol) -> Option<u32>
where
    C: Cpu + ?Sized,
    M: Metric,
    F: Fn(),
{
    let result = measure_guarded(cpu, metric, op, protocol);
    if result.is_none() {
        debug!("metric {}: unavailable", metric.name());
    }
    result
}

fn measure_guarded<C, M, F>(cpu: &C, metric: &mut M, op: &F, protocol: &Protocol) -> Option<u32>
where
    C: Cpu + ?Sized,
    M: Metric,
    F: Fn(),
{
    if protocol.iterations == 0 {
        return None;
    }
    let trace = FaultTrace::with_filter(protocol.filter);
    let _scope = SandboxScope::enter(cpu, &trace);

    if !metric.prepare(cpu) {
        return None;
    }
    metric.sample(cpu, true);
    if trace.has_fault() {
        metric.release(cpu);
        return None;
    }

    cpu.wbinvd();
    cpu.flush_tlb();

    let code = invoke::<F> as fn(&F) as usize as u64;
    let mut results = vec![0u32; protocol.iterations];
    let warmup = protocol.warmup as isize;
    for n in -warmup..protocol.iterations as isize {
        for _ in 0..protocol.warm_passes {
            if cpu.rdtsc() % WARM_CALL_MODULUS == 0 {
                invoke(op);
            }
            cpu.touch(code);
            cpu.touch(cpu.stack_pointer().wrapping_sub(STACK_TOUCH_OFFSET));
            cpu.mfence();
        }

        cpu.serialize();
        let m1 = metric.sample(cpu, true);
        invoke(black_box(op));
        let m2 = metric.sample(cpu, false);
        cpu.serialize();

        results[n.max(0) as usize] = m2.wrapping_sub(m1) as u32;
    }

    metric.release(cpu);
    results.sort_unstable();
    percentile(&results, protocol.percentile)
}

/// Measure `op` with every source in `suite`, skipping the names in
/// `disabled`, and collect the successes.
pub fn run_all<C, F>(
    cpu: &C,
    suite: &mut MetricSuite<'_>,
    op: &F,
    protocol: &Protocol,
    disabled: &[alloc::string::String],
) -> EvidenceRecord
where
    C: Cpu + ?Sized,
    F: Fn(),
{
    let mut evidence = EvidenceRecord::new();
    macro_rules! each {
        ($($field:ident),* $(,)?) => {$(
            let name = suite.$field.name();
            if disabled.iter().any(|d| d == name) {
                debug!("metric {name}: disabled");
            } else if let Some(v) = measure(cpu, &mut suite.$field, op, protocol) {
                evidence.insert(name, v);
            }
        )*};
    }
    each!(pmc_tsc, pmc_core, tsc, mpc, mperf, aperf, pperf, hpet, tlb, po_dram, po_pkg);
    evidence
}

// ─── Canonical operations ────────────────────────────────────────────

/// The operations the battery fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CanonicalOp {
    Nop,
    Alu,
    Cpuid,
    Smi,
    Xsetbv,
}

impl CanonicalOp {
    pub const ALL: [Self; 5] = [Self::Nop, Self::Alu, Self::Cpuid, Self::Smi, Self::Xsetbv];

    pub fn name(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Alu => "alu",
            Self::Cpuid => "cpuid",
            Self::Smi => "smi",
            Self::Xsetbv => "xsetbv",
        }
    }

    /// Report key of the fixed-duration variant.
    pub fn long_name(self) -> &'static str {
        match self {
            Self::Nop => "nopLong",
            Self::Alu => "aluLong",
            Self::Cpuid => "cpuidLong",
            Self::Smi => "smiLong",
            Self::Xsetbv => "xsetbvLong",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }
}

impl core::str::FromStr for CanonicalOp {
    type Err = crate::error::ProbeError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| crate::error::ProbeError::UnknownOperation(s.into()))
    }
}

impl core::fmt::Display for CanonicalOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// 64-bit linear congruential step.
const fn lce_64(x: u64) -> u64 {
    x.wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1_442_695_040_888_963_407)
}

/// Run `op` once on `cpu`.  `xcr0` is the value `xsetbv` writes back.
#[inline(always)]
pub fn execute<C: Cpu + ?Sized>(cpu: &C, op: CanonicalOp, xcr0: u64) {
    match op {
        CanonicalOp::Nop => {}
        CanonicalOp::Alu => {
            let a = black_box(0xDEAD_i64);
            black_box(a / ((lce_64(a as u64) | 1) as i64));
        }
        CanonicalOp::Cpuid => {
            cpu.cpuid(0, 0);
        }
        CanonicalOp::Smi => cpu.outb(crate::arch::defs::PORT_APM_CONTROL, 0),
        CanonicalOp::Xsetbv => cpu.xsetbv(0, xcr0),
    }
}

/// Repeat `op` until `cycles` TSC cycles have passed.
pub fn fixed_duration<'a, C, F>(cpu: &'a C, cycles: u64, op: F) -> impl Fn() + 'a
where
    C: Cpu + ?Sized,
    F: Fn() + 'a,
{
    move || {
        let end = cpu.rdtsc().wrapping_add(cycles);
        while cpu.rdtsc() <= end {
            op();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Vector;
    use crate::caps::Capabilities;
    use crate::metric::{SuiteParams, Tsc};
    use crate::sim::{SimCpu, SimProfile};
    use alloc::string::String;
    use alloc::vec::Vec;
    use core::cell::Cell;

    /// Replays a fixed sequence of deltas.
    struct Scripted {
        deltas: Vec<u64>,
        cursor: Cell<usize>,
        now: Cell<u64>,
        prepared: bool,
        released: bool,
    }

    impl Scripted {
        fn new(deltas: Vec<u64>) -> Self {
            Self {
                deltas,
                cursor: Cell::new(0),
                now: Cell::new(1_000),
                prepared: false,
                released: false,
            }
        }
    }

    impl Metric for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn prepare<C: Cpu + ?Sized>(&mut self, _cpu: &C) -> bool {
            self.prepared = true;
            true
        }

        fn sample<C: Cpu + ?Sized>(&self, _cpu: &C, first: bool) -> u64 {
            if !first {
                let i = self.cursor.get();
                self.cursor.set(i + 1);
                let d = self.deltas[i % self.deltas.len()];
                self.now.set(self.now.get() + d);
            }
            self.now.get()
        }

        fn release<C: Cpu + ?Sized>(&mut self, _cpu: &C) {
            self.released = true;
        }
    }

    struct Unsupported;

    impl Metric for Unsupported {
        fn name(&self) -> &'static str {
            "unsupported"
        }
        fn prepare<C: Cpu + ?Sized>(&mut self, _cpu: &C) -> bool {
            false
        }
        fn sample<C: Cpu + ?Sized>(&self, _cpu: &C, _first: bool) -> u64 {
            unreachable!("sampled an unprepared source")
        }
        fn release<C: Cpu + ?Sized>(&mut self, _cpu: &C) {}
    }

    /// Raises `vector` on every sample and otherwise reads the TSC.
    struct Faulting<'c> {
        cpu: &'c SimCpu,
        vector: Vector,
    }

    impl<'c> Faulting<'c> {
        fn new(cpu: &'c SimCpu, vector: Vector) -> Self {
            Self { cpu, vector }
        }
    }

    impl Metric for Faulting<'_> {
        fn name(&self) -> &'static str {
            "faulting"
        }
        fn prepare<C: Cpu + ?Sized>(&mut self, _cpu: &C) -> bool {
            true
        }
        fn sample<C: Cpu + ?Sized>(&self, _cpu: &C, _first: bool) -> u64 {
            self.cpu.raise(self.vector);
            self.cpu.rdtsc()
        }
        fn release<C: Cpu + ?Sized>(&mut self, _cpu: &C) {}
    }

    #[test]
    fn percentile_nearest_rank() {
        let sorted: Vec<u32> = (1..=48).collect();
        assert_eq!(percentile(&sorted, 0.5), Some(25));
        assert_eq!(percentile(&sorted, 0.0), Some(1));
        assert_eq!(percentile(&sorted, 1.0), Some(48));
        assert_eq!(percentile(&[7], 0.5), Some(7));
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn median_ignores_one_outlier() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let protocol = Protocol::default();
        // Warm-up rounds see the outlier first; the kept rounds see 47
        // copies of c and one huge value.
        for outlier_at in [0usize, 10, 51] {
            let mut deltas = vec![37u64; protocol.warmup + protocol.iterations];
            deltas[outlier_at] = 9_000_000;
            let mut metric = Scripted::new(deltas);
            let v = measure(&cpu, &mut metric, &|| {}, &protocol);
            assert_eq!(v, Some(37));
            assert!(metric.prepared && metric.released);
        }
    }

    #[test]
    fn deltas_truncate_to_32_bits() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let mut metric = Scripted::new(vec![(1u64 << 32) + 5]);
        assert_eq!(measure(&cpu, &mut metric, &|| {}, &Protocol::default()), Some(5));
    }

    #[test]
    fn unsupported_source_yields_nothing() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        assert_eq!(measure(&cpu, &mut Unsupported, &|| {}, &Protocol::default()), None);
    }

    #[test]
    fn faulting_trial_sample_yields_nothing() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let mut metric = Faulting::new(&cpu, Vector::GENERAL_PROTECTION_FAULT);
        assert_eq!(measure(&cpu, &mut metric, &|| {}, &Protocol::default()), None);
    }

    #[test]
    fn vector_outside_the_filter_does_not_abort() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let config = ProbeConfig {
            fault_vectors: vec![Vector::INVALID_OPCODE.0],
            ..ProbeConfig::default()
        };
        let protocol = Protocol::from_config(&config).unwrap();
        assert!(!protocol.filter.counts(Vector::GENERAL_PROTECTION_FAULT));

        let mut metric = Faulting::new(&cpu, Vector::GENERAL_PROTECTION_FAULT);
        assert!(measure(&cpu, &mut metric, &|| {}, &protocol).is_some());

        let mut metric = Faulting::new(&cpu, Vector::INVALID_OPCODE);
        assert_eq!(measure(&cpu, &mut metric, &|| {}, &protocol), None);
    }

    #[test]
    fn protocol_rejects_out_of_range_vectors() {
        let config = ProbeConfig {
            fault_vectors: vec![0x40],
            ..ProbeConfig::default()
        };
        assert!(Protocol::from_config(&config).is_err());
    }

    #[test]
    fn measure_restores_interrupts() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        cpu.enable_interrupts();
        measure(&cpu, &mut Tsc, &|| {}, &Protocol::default());
        assert!(cpu.interrupts_enabled());
    }

    #[test]
    fn operation_runs_once_per_round() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let protocol = Protocol::default();
        let calls = Cell::new(0usize);
        measure(&cpu, &mut Tsc, &|| calls.set(calls.get() + 1), &protocol);
        // The warming loop may call it too, but only when rdtsc hits the
        // modulus; at least one call per round is guaranteed.
        assert!(calls.get() >= protocol.warmup + protocol.iterations);
    }

    #[test]
    fn nop_tsc_is_small_and_positive() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let v = measure(&cpu, &mut Tsc, &|| {}, &Protocol::default()).unwrap();
        assert!(v > 0 && v < 100, "nop measured {v} cycles");
    }

    #[test]
    fn cpuid_costs_more_under_a_hypervisor() {
        let bare = SimCpu::new(SimProfile::bare_metal_intel());
        let vm = SimCpu::new(SimProfile::kvm());
        let protocol = Protocol::default();
        let t_bare = measure(&bare, &mut Tsc, &|| execute(&bare, CanonicalOp::Cpuid, 0), &protocol);
        let t_vm = measure(&vm, &mut Tsc, &|| execute(&vm, CanonicalOp::Cpuid, 0), &protocol);
        assert!(t_vm.unwrap() > t_bare.unwrap() * 5);
    }

    fn suite_run(cpu: &SimCpu, disabled: &[String]) -> EvidenceRecord {
        let mut caps = Capabilities::detect(cpu);
        caps.probe_clock_msrs(cpu, FaultFilter::DEFAULT);
        let mut suite = MetricSuite::new(SuiteParams {
            caps: &caps,
            mapper: cpu,
            timekeeper: None,
            tlb_pages: 16,
            hpet_deadline_cycles: 10_000_000,
            filter: FaultFilter::DEFAULT,
        });
        run_all(cpu, &mut suite, &|| {}, &Protocol::default(), disabled)
    }

    #[test]
    fn run_all_on_bare_metal_reports_every_local_source() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let evidence = suite_run(&cpu, &[]);
        for key in ["pmcTsc", "pmcCore", "tsc", "mperf", "aperf", "hpet", "tlb", "poPkg"] {
            assert!(evidence.get(key).is_some(), "missing {key}: {evidence:?}");
        }
        assert!(evidence.get("mpc").is_none());
        assert_eq!(evidence.get("tlb"), Some(16));
    }

    #[test]
    fn disabled_source_is_skipped_and_others_survive() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let evidence = suite_run(&cpu, &[String::from("tsc")]);
        assert!(evidence.get("tsc").is_none());
        assert!(evidence.get("pmcTsc").is_some());
        assert!(evidence.get("hpet").is_some());
    }

    #[test]
    fn fixed_duration_spans_the_window() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let calls = Cell::new(0u32);
        let long = fixed_duration(&cpu, 10_000, || calls.set(calls.get() + 1));
        let start = cpu.rdtsc();
        long();
        assert!(cpu.rdtsc() - start > 10_000);
        assert!(calls.get() > 1);
    }

    #[test]
    fn canonical_names_round_trip() {
        for op in CanonicalOp::ALL {
            assert_eq!(op.name().parse::<CanonicalOp>().unwrap(), op);
            assert!(op.long_name().starts_with(op.name()));
        }
        assert!("fma".parse::<CanonicalOp>().is_err());
    }
}
