//! Interchangeable counter sources for the measurement protocol.
//!
//! Every source follows the same three-step contract:
//!
//! 1. [`Metric::prepare`] does feature detection and setup.  It may run
//!    faulting instructions, but only inside its own sandbox scope, and
//!    reports "unsupported" by returning `false`.
//! 2. [`Metric::sample`] is called back to back around the operation under
//!    test, first with `first = true`, then `false`.  It must stay small;
//!    the difference of the two samples is the measurement.
//! 3. [`Metric::release`] undoes whatever `prepare` enabled.
//!
//! The sources live for the whole run inside a [`MetricSuite`], which
//! also performs the one-time teardown (mapped probe pages) on drop.

pub mod pmu;

use alloc::vec::Vec;

use crate::arch::defs::*;
use crate::arch::Cpu;
use crate::caps::{Capabilities, ClockMsr};
use crate::clock::Timekeeper;
use crate::mapper::{with_frame, PageMapper};
use crate::sandbox::{try_rdmsr, FaultFilter};

use self::pmu::{FixedCounter, PmcEvent, Pmu};

/// One counter source.
pub trait Metric {
    /// Key under which the source's measurement is reported.
    fn name(&self) -> &'static str;
    fn prepare<C: Cpu + ?Sized>(&mut self, cpu: &C) -> bool;
    fn sample<C: Cpu + ?Sized>(&self, cpu: &C, first: bool) -> u64;
    fn release<C: Cpu + ?Sized>(&mut self, cpu: &C);
}

// ─── Cycle counter ───────────────────────────────────────────────────

/// `RDTSC` to open the window, `RDTSCP` to close it.
#[derive(Debug, Default)]
pub struct Tsc;

impl Metric for Tsc {
    fn name(&self) -> &'static str {
        "tsc"
    }

    fn prepare<C: Cpu + ?Sized>(&mut self, _cpu: &C) -> bool {
        true
    }

    #[inline(always)]
    fn sample<C: Cpu + ?Sized>(&self, cpu: &C, first: bool) -> u64 {
        if first {
            cpu.rdtsc()
        } else {
            cpu.rdtscp().0
        }
    }

    fn release<C: Cpu + ?Sized>(&mut self, _cpu: &C) {}
}

// ─── Performance counters ────────────────────────────────────────────

/// A fixed-function counter read through `RDPMC`.
#[derive(Debug)]
pub struct FixedPmc {
    name: &'static str,
    pmu: Pmu,
    counter: FixedCounter,
}

impl FixedPmc {
    pub fn new(name: &'static str, pmu: Pmu, counter: FixedCounter) -> Self {
        Self { name, pmu, counter }
    }
}

impl Metric for FixedPmc {
    fn name(&self) -> &'static str {
        self.name
    }

    fn prepare<C: Cpu + ?Sized>(&mut self, cpu: &C) -> bool {
        self.pmu.fixed_enable(cpu, self.counter)
    }

    #[inline(always)]
    fn sample<C: Cpu + ?Sized>(&self, cpu: &C, _first: bool) -> u64 {
        let v = cpu.rdpmc(self.counter.rdpmc_selector());
        cpu.serialize();
        v
    }

    fn release<C: Cpu + ?Sized>(&mut self, cpu: &C) {
        self.pmu.fixed_disable(cpu, self.counter);
    }
}

/// General-purpose counter 0 programmed for an arbitrary event.
#[derive(Debug)]
pub struct DynamicPmc {
    name: &'static str,
    pmu: Pmu,
    event: PmcEvent,
}

impl DynamicPmc {
    pub fn new(name: &'static str, pmu: Pmu, event: PmcEvent) -> Self {
        Self { name, pmu, event }
    }
}

impl Metric for DynamicPmc {
    fn name(&self) -> &'static str {
        self.name
    }

    fn prepare<C: Cpu + ?Sized>(&mut self, cpu: &C) -> bool {
        self.pmu.dynamic_enable(cpu, 0, self.event)
    }

    #[inline(always)]
    fn sample<C: Cpu + ?Sized>(&self, cpu: &C, _first: bool) -> u64 {
        let v = cpu.rdpmc(0);
        cpu.serialize();
        v
    }

    fn release<C: Cpu + ?Sized>(&mut self, cpu: &C) {
        self.pmu.dynamic_disable(cpu, 0);
    }
}

// ─── MSR clocks ──────────────────────────────────────────────────────

/// A free-running clock MSR (MPERF, APERF, PPERF).
///
/// When the capability says the read-only alias answers, the alias is
/// tried first, then the architectural address.
#[derive(Debug)]
pub struct MsrClock {
    name: &'static str,
    msr: u32,
    cap: ClockMsr,
    filter: FaultFilter,
    selected: u32,
}

impl MsrClock {
    pub fn new(name: &'static str, msr: u32, cap: ClockMsr, filter: FaultFilter) -> Self {
        Self {
            name,
            msr,
            cap,
            filter,
            selected: msr,
        }
    }
}

impl Metric for MsrClock {
    fn name(&self) -> &'static str {
        self.name
    }

    fn prepare<C: Cpu + ?Sized>(&mut self, cpu: &C) -> bool {
        let mut candidates = [None, None];
        match self.cap {
            ClockMsr::Aliased => {
                candidates = [Some(self.msr | MSR_READ_ONLY_ALIAS), Some(self.msr)];
            }
            ClockMsr::Legacy => candidates[0] = Some(self.msr),
            ClockMsr::Absent => {}
        }
        for msr in candidates.into_iter().flatten() {
            if try_rdmsr(cpu, self.filter, msr).is_some_and(|v| v != 0) {
                self.selected = msr;
                return true;
            }
        }
        false
    }

    #[inline(always)]
    fn sample<C: Cpu + ?Sized>(&self, cpu: &C, _first: bool) -> u64 {
        let v = cpu.rdmsr(self.selected);
        cpu.serialize();
        v
    }

    fn release<C: Cpu + ?Sized>(&mut self, _cpu: &C) {}
}

/// RAPL energy-status counter; unsupported when it reads as zero.
#[derive(Debug)]
pub struct EnergyStatus {
    name: &'static str,
    msr: u32,
    filter: FaultFilter,
}

impl EnergyStatus {
    pub fn new(name: &'static str, msr: u32, filter: FaultFilter) -> Self {
        Self { name, msr, filter }
    }
}

impl Metric for EnergyStatus {
    fn name(&self) -> &'static str {
        self.name
    }

    fn prepare<C: Cpu + ?Sized>(&mut self, cpu: &C) -> bool {
        try_rdmsr(cpu, self.filter, self.msr).is_some_and(|v| v != 0)
    }

    #[inline(always)]
    fn sample<C: Cpu + ?Sized>(&self, cpu: &C, _first: bool) -> u64 {
        let v = cpu.rdmsr(self.msr);
        cpu.serialize();
        v
    }

    fn release<C: Cpu + ?Sized>(&mut self, _cpu: &C) {}
}

// ─── Cross-core clock ────────────────────────────────────────────────

/// Reads the [`Timekeeper`] counter running on another core.
#[derive(Debug)]
pub struct CrossCoreClock<'t> {
    clock: Option<&'t Timekeeper>,
    intel: bool,
}

impl<'t> CrossCoreClock<'t> {
    pub fn new(clock: Option<&'t Timekeeper>, intel: bool) -> Self {
        Self { clock, intel }
    }
}

impl Metric for CrossCoreClock<'_> {
    fn name(&self) -> &'static str {
        "mpc"
    }

    fn prepare<C: Cpu + ?Sized>(&mut self, _cpu: &C) -> bool {
        self.intel && self.clock.is_some_and(Timekeeper::is_running)
    }

    #[inline(always)]
    fn sample<C: Cpu + ?Sized>(&self, _cpu: &C, _first: bool) -> u64 {
        self.clock.map_or(0, Timekeeper::now)
    }

    fn release<C: Cpu + ?Sized>(&mut self, _cpu: &C) {}
}

// ─── External timer ──────────────────────────────────────────────────

/// HPET main counter.  The opening sample waits for the counter to tick so
/// the window starts on a tick boundary.
#[derive(Debug)]
pub struct Hpet {
    counter: Option<u64>,
    deadline_cycles: u64,
}

impl Hpet {
    pub fn new(base: Option<u64>, deadline_cycles: u64) -> Self {
        Self {
            counter: base.map(|b| b + HPET_MAIN_COUNTER),
            deadline_cycles,
        }
    }

    /// First value read after the counter changed, or `None` if it did not
    /// change before the deadline.
    fn next_tick<C: Cpu + ?Sized>(&self, cpu: &C, counter: u64) -> Option<u64> {
        let start = cpu.read_u64(counter);
        let deadline = cpu.rdtsc().saturating_add(self.deadline_cycles);
        loop {
            let now = cpu.read_u64(counter);
            if now != start {
                return Some(now);
            }
            if cpu.rdtsc() > deadline {
                return None;
            }
            cpu.pause();
        }
    }
}

impl Metric for Hpet {
    fn name(&self) -> &'static str {
        "hpet"
    }

    fn prepare<C: Cpu + ?Sized>(&mut self, cpu: &C) -> bool {
        self.counter.is_some_and(|c| self.next_tick(cpu, c).is_some())
    }

    #[inline(always)]
    fn sample<C: Cpu + ?Sized>(&self, cpu: &C, first: bool) -> u64 {
        let Some(counter) = self.counter else {
            return 0;
        };
        if first {
            self.next_tick(cpu, counter).unwrap_or_else(|| cpu.read_u64(counter))
        } else {
            cpu.serialize();
            cpu.read_u64(counter)
        }
    }

    fn release<C: Cpu + ?Sized>(&mut self, _cpu: &C) {}
}

// ─── TLB residency ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct ProbePage {
    va: u64,
    pte: u64,
}

/// Times nothing: counts how many probe pages still translate through a
/// stale TLB entry after their PTE was re-pointed at a zero page.
///
/// The opening sample primes every probe page through its own frame
/// (holding a 1), then rewrites each PTE to the shared zero page without
/// invalidating.  The closing sample sums one byte per page, least
/// recently primed first.  Hardware keeps serving the stale frames;
/// shadow paging drops them.
pub struct TlbResidency<'m> {
    mapper: &'m dyn PageMapper,
    count: usize,
    zero: Option<ProbePage>,
    probes: Vec<ProbePage>,
}

/// Priming reads per probe page.
const TLB_PRIME_TOUCHES: usize = 12;

impl<'m> TlbResidency<'m> {
    pub fn new(mapper: &'m dyn PageMapper, count: usize) -> Self {
        Self {
            mapper,
            count,
            zero: None,
            probes: Vec::new(),
        }
    }

    fn allocate_page<C: Cpu + ?Sized>(&self, cpu: &C, fill: u8) -> Option<ProbePage> {
        let va = self.mapper.allocate_page()?;
        cpu.write_u8(va, fill);
        match self.mapper.read_pte(va) {
            Some(pte) => Some(ProbePage { va, pte }),
            None => {
                self.mapper.free_page(va);
                None
            }
        }
    }

    /// Allocate the zero page and probe pages once per suite.
    fn ensure_pages<C: Cpu + ?Sized>(&mut self, cpu: &C) -> bool {
        if self.zero.is_some() {
            return true;
        }
        let Some(zero) = self.allocate_page(cpu, 0) else {
            return false;
        };
        self.zero = Some(zero);
        while self.probes.len() < self.count {
            let Some(page) = self.allocate_page(cpu, 1) else {
                self.teardown();
                return false;
            };
            self.probes.push(page);
        }
        true
    }

    /// Restore every rewritten PTE and free the pages.
    pub fn teardown(&mut self) {
        for page in self.probes.drain(..).chain(self.zero.take()) {
            // SAFETY: the page came from allocate_page and gets its
            // previous entry back.
            unsafe { self.mapper.write_pte(page.va, page.pte) };
            self.mapper.free_page(page.va);
        }
    }
}

impl Metric for TlbResidency<'_> {
    fn name(&self) -> &'static str {
        "tlb"
    }

    fn prepare<C: Cpu + ?Sized>(&mut self, cpu: &C) -> bool {
        self.ensure_pages(cpu)
    }

    fn sample<C: Cpu + ?Sized>(&self, cpu: &C, first: bool) -> u64 {
        let Some(zero) = self.zero else {
            return 0;
        };
        if first {
            for page in &self.probes {
                // SAFETY: probe pages are private; both frames stay mapped
                // readable for the suite's lifetime.
                unsafe { self.mapper.write_pte(page.va, page.pte) };
                for _ in 0..TLB_PRIME_TOUCHES {
                    cpu.touch(page.va);
                }
                // SAFETY: as above.
                unsafe { self.mapper.write_pte(page.va, with_frame(page.pte, zero.pte)) };
            }
            cpu.sfence();
            cpu.serialize();
            0
        } else {
            cpu.serialize();
            let hits = self
                .probes
                .iter()
                .map(|page| u64::from(cpu.read_u8(page.va)))
                .sum();
            cpu.lfence();
            hits
        }
    }

    fn release<C: Cpu + ?Sized>(&mut self, _cpu: &C) {}
}

impl Drop for TlbResidency<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ─── Suite ───────────────────────────────────────────────────────────

/// Everything a source needs to be constructed.
pub struct SuiteParams<'a> {
    pub caps: &'a Capabilities,
    pub mapper: &'a dyn PageMapper,
    pub timekeeper: Option<&'a Timekeeper>,
    pub tlb_pages: usize,
    pub hpet_deadline_cycles: u64,
    /// Vectors that make a setup access count as faulted.
    pub filter: FaultFilter,
}

/// The process-lifetime set of sources, in reporting order.
pub struct MetricSuite<'a> {
    pub pmc_tsc: FixedPmc,
    pub pmc_core: FixedPmc,
    pub tsc: Tsc,
    pub mpc: CrossCoreClock<'a>,
    pub mperf: MsrClock,
    pub aperf: MsrClock,
    pub pperf: MsrClock,
    pub hpet: Hpet,
    pub tlb: TlbResidency<'a>,
    pub po_dram: EnergyStatus,
    pub po_pkg: EnergyStatus,
}

impl<'a> MetricSuite<'a> {
    /// Every key [`MetricSuite`] can report, in order.
    pub const NAMES: [&'static str; 11] = [
        "pmcTsc", "pmcCore", "tsc", "mpc", "mperf", "aperf", "pperf", "hpet", "tlb", "poDram",
        "poPkg",
    ];

    pub fn new(params: SuiteParams<'a>) -> Self {
        let caps = params.caps;
        let filter = params.filter;
        let pmu = Pmu::new(caps.vendor, filter);
        // PPERF has no alias worth trying.
        let pperf_cap = caps.pperf.min(ClockMsr::Legacy);
        Self {
            pmc_tsc: FixedPmc::new("pmcTsc", pmu, FixedCounter::ReferenceCycles),
            pmc_core: FixedPmc::new("pmcCore", pmu, FixedCounter::CoreCycles),
            tsc: Tsc,
            mpc: CrossCoreClock::new(params.timekeeper, caps.is_intel()),
            mperf: MsrClock::new("mperf", IA32_MPERF, caps.mperf, filter),
            aperf: MsrClock::new("aperf", IA32_APERF, caps.aperf, filter),
            pperf: MsrClock::new("pperf", IA32_PPERF, pperf_cap, filter),
            hpet: Hpet::new(params.mapper.hpet_base(), params.hpet_deadline_cycles),
            tlb: TlbResidency::new(params.mapper, params.tlb_pages),
            po_dram: EnergyStatus::new("poDram", IA32_DRAM_ENERGY_STATUS, filter),
            po_pkg: EnergyStatus::new("poPkg", IA32_PKG_ENERGY_STATUS, filter),
        }
    }
}
