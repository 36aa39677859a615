//! Fault sandbox: run possibly-faulting privileged code and find out
//! which vectors fired.
//!
//! A [`SandboxScope`] swaps the core's fault-vector table for the private
//! table (every entry records and skips), points the per-core scratch
//! pointer at a [`FaultTrace`], and disables interrupts.  Dropping or
//! [`leave`](SandboxScope::leave)-ing the scope puts back the table, the
//! scratch pointer and the interrupt flag, in that order, exactly once.
//!
//! While a scope is active *every* fault on the core lands in the trace,
//! including unrelated ones, so guarded regions should be as small as
//! the probe allows.  Nothing may be logged from inside a scope.
//!
//! # Example
//!
//! ```
//! use hvprobe::sandbox::{FaultTrace, SandboxScope};
//! use hvprobe::sim::{SimCpu, SimProfile};
//! use hvprobe::arch::Cpu;
//!
//! let cpu = SimCpu::new(SimProfile::bare_metal_intel());
//! let trace = FaultTrace::new();
//! {
//!     let _scope = SandboxScope::enter(&cpu, &trace);
//!     cpu.rdmsr(0x4000_0000); // #GP on bare metal
//! }
//! assert!(trace.has_fault());
//! ```

use core::cell::Cell;
use core::marker::PhantomData;

use crate::arch::{Cpu, DescriptorTable, Vector};

// ─── Fault filter ────────────────────────────────────────────────────

/// The set of vectors that count as a fault for
/// [`FaultTrace::has_fault`].  Vectors outside `0..=0x1F` never count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultFilter {
    mask: u32,
}

impl FaultFilter {
    /// Every architectural exception vector except NMI.
    pub const DEFAULT: Self = Self {
        mask: (u32::MAX >> 1) & !(1 << Vector::NMI.0),
    };

    /// Nothing counts.
    pub const NONE: Self = Self { mask: 0 };

    /// Build a filter from explicit vector numbers.  Returns the first
    /// vector beyond [`Vector::LAST_EXCEPTION`] as the error.
    pub fn from_vectors(vectors: &[u8]) -> Result<Self, u8> {
        let mut mask = 0;
        for &v in vectors {
            if v > Vector::LAST_EXCEPTION.0 {
                return Err(v);
            }
            mask |= 1 << v;
        }
        Ok(Self { mask })
    }

    pub const fn counts(self, vector: Vector) -> bool {
        vector.0 < 32 && self.mask & (1 << vector.0) != 0
    }
}

impl Default for FaultFilter {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ─── Fault trace ─────────────────────────────────────────────────────

/// Maximum number of vectors a trace holds; later ones are dropped.
pub const TRACE_CAPACITY: usize = 128;

/// Fixed-capacity, append-only record of the vectors delivered while a
/// scope pointed at this trace.
///
/// The trap routines write through the per-core scratch pointer while the
/// owner still holds `&FaultTrace`, hence the cells.  A trace is never
/// shared across cores.
#[repr(C)]
pub struct FaultTrace {
    len: Cell<usize>,
    store: [Cell<u8>; TRACE_CAPACITY],
    filter: FaultFilter,
}

impl FaultTrace {
    pub fn new() -> Self {
        Self::with_filter(FaultFilter::DEFAULT)
    }

    pub fn with_filter(filter: FaultFilter) -> Self {
        Self {
            len: Cell::new(0),
            store: [const { Cell::new(0) }; TRACE_CAPACITY],
            filter,
        }
    }

    /// Append a vector, as the trap routine does.  Silently dropped once
    /// the trace is full.
    pub(crate) fn record(&self, vector: Vector) {
        let n = self.len.get();
        if n < TRACE_CAPACITY {
            self.store[n].set(vector.0);
            self.len.set(n + 1);
        }
    }

    pub fn clear(&self) {
        self.len.set(0);
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn filter(&self) -> FaultFilter {
        self.filter
    }

    pub fn iter(&self) -> impl Iterator<Item = Vector> + '_ {
        self.store[..self.len()].iter().map(|c| Vector(c.get()))
    }

    /// Any recorded vector is in the fault filter.
    pub fn has_fault(&self) -> bool {
        self.iter().any(|v| self.filter.counts(v))
    }

    pub fn count_faults(&self) -> usize {
        self.iter().filter(|&v| self.filter.counts(v)).count()
    }

    /// Occurrences of one specific vector, counted or not.
    pub fn count_vector(&self, vector: Vector) -> usize {
        self.iter().filter(|&v| v == vector).count()
    }
}

impl Default for FaultTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for FaultTrace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

// ─── Scope ───────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
struct Saved {
    table: DescriptorTable,
    scratch: u64,
    interrupts: bool,
}

/// Stack-scoped ownership of the core's fault routing.
///
/// The scope borrows its trace for `'a`, so the trace can neither move nor
/// be dropped while the trap routines may still write into it.
pub struct SandboxScope<'a, C: Cpu + ?Sized> {
    cpu: &'a C,
    saved: Option<Saved>,
    _trace: PhantomData<&'a FaultTrace>,
}

impl<'a, C: Cpu + ?Sized> SandboxScope<'a, C> {
    /// Clear `trace` and start routing faults into it.
    pub fn enter(cpu: &'a C, trace: &'a FaultTrace) -> Self {
        let mut scope = Self::inactive(cpu);
        scope.reset(Some(trace));
        scope
    }

    /// Swallow faults without recording them.
    pub fn enter_untraced(cpu: &'a C) -> Self {
        let mut scope = Self::inactive(cpu);
        scope.reset(None);
        scope
    }

    fn inactive(cpu: &'a C) -> Self {
        Self {
            cpu,
            saved: None,
            _trace: PhantomData,
        }
    }

    /// Acquire the core if this scope is not already active.  A no-op on
    /// an active scope: the trace and the saved state stay as they are.
    pub fn reset(&mut self, trace: Option<&'a FaultTrace>) {
        if self.saved.is_some() {
            return;
        }
        let cpu = self.cpu;
        let interrupts = cpu.interrupts_enabled();
        cpu.disable_interrupts();
        let scratch = cpu.scratch();
        let table = cpu.vector_table();

        let trace_addr = match trace {
            Some(t) => {
                t.clear();
                t as *const FaultTrace as u64
            }
            None => 0,
        };
        // SAFETY: the private table comes from the backend itself, and the
        // trace is borrowed for 'a, which outlives this scope.
        unsafe {
            cpu.load_vector_table(cpu.sandbox_vector_table());
            cpu.set_scratch(trace_addr);
        }
        self.saved = Some(Saved {
            table,
            scratch,
            interrupts,
        });
    }

    pub fn is_active(&self) -> bool {
        self.saved.is_some()
    }

    /// Restore the vector table, scratch pointer and interrupt flag.
    /// Later calls do nothing.
    pub fn leave(&mut self) {
        if let Some(saved) = self.saved.take() {
            // SAFETY: both values were read from this core on entry.
            unsafe {
                self.cpu.load_vector_table(saved.table);
                self.cpu.set_scratch(saved.scratch);
            }
            if saved.interrupts {
                self.cpu.enable_interrupts();
            }
        }
    }
}

impl<C: Cpu + ?Sized> Drop for SandboxScope<'_, C> {
    fn drop(&mut self) {
        self.leave();
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

/// Run `body` inside a fresh scope and hand back the trace.
pub fn guarded<C, R>(cpu: &C, filter: FaultFilter, body: impl FnOnce(&C) -> R) -> (R, FaultTrace)
where
    C: Cpu + ?Sized,
{
    let trace = FaultTrace::with_filter(filter);
    let out = {
        let _scope = SandboxScope::enter(cpu, &trace);
        body(cpu)
    };
    (out, trace)
}

/// `RDMSR` that reports `None` instead of faulting.
pub fn try_rdmsr<C: Cpu + ?Sized>(cpu: &C, filter: FaultFilter, msr: u32) -> Option<u64> {
    let (value, trace) = guarded(cpu, filter, |cpu| cpu.rdmsr(msr));
    (!trace.has_fault()).then_some(value)
}

/// `WRMSR` that reports whether it went through without a fault.
pub fn try_wrmsr<C: Cpu + ?Sized>(cpu: &C, filter: FaultFilter, msr: u32, value: u64) -> bool {
    let ((), trace) = guarded(cpu, filter, |cpu| cpu.wrmsr(msr, value));
    !trace.has_fault()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCpu, SimProfile};

    fn cpu() -> SimCpu {
        SimCpu::new(SimProfile::bare_metal_intel())
    }

    fn snapshot(cpu: &SimCpu) -> (DescriptorTable, u64, bool) {
        (cpu.vector_table(), cpu.scratch(), cpu.interrupts_enabled())
    }

    #[test]
    fn default_filter_excludes_nmi_and_external() {
        let f = FaultFilter::DEFAULT;
        assert!(f.counts(Vector::DIVIDE_ERROR));
        assert!(f.counts(Vector::DEBUG));
        assert!(!f.counts(Vector::NMI));
        assert!(f.counts(Vector::GENERAL_PROTECTION_FAULT));
        assert!(f.counts(Vector::SECURITY_EXCEPTION));
        assert!(!f.counts(Vector(0x1F)));
        assert!(!f.counts(Vector::EXTERNAL));
        assert!(!f.counts(Vector::PRIVATE));
    }

    #[test]
    fn filter_from_vectors() {
        let f = FaultFilter::from_vectors(&[6, 13]).unwrap();
        assert!(f.counts(Vector::INVALID_OPCODE));
        assert!(!f.counts(Vector::PAGE_FAULT));
        assert_eq!(FaultFilter::from_vectors(&[13, 0x20]), Err(0x20));
    }

    #[test]
    fn enter_routes_faults_into_trace() {
        let cpu = cpu();
        let trace = FaultTrace::new();
        {
            let _scope = SandboxScope::enter(&cpu, &trace);
            cpu.raise(Vector::GENERAL_PROTECTION_FAULT);
            cpu.raise(Vector::NMI);
        }
        assert_eq!(trace.len(), 2);
        assert!(trace.has_fault());
        assert_eq!(trace.count_faults(), 1);
        assert_eq!(trace.count_vector(Vector::NMI), 1);
    }

    #[test]
    fn benign_only_trace_has_no_fault() {
        let cpu = cpu();
        let trace = FaultTrace::new();
        {
            let _scope = SandboxScope::enter(&cpu, &trace);
            cpu.raise(Vector::NMI);
            cpu.raise(Vector(0x40));
        }
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.iter().nth(1), Some(Vector::EXTERNAL));
        assert!(!trace.has_fault());
    }

    #[test]
    fn reentry_is_a_noop() {
        let cpu = cpu();
        let first = FaultTrace::new();
        let second = FaultTrace::new();
        let mut scope = SandboxScope::enter(&cpu, &first);
        let scratch = cpu.scratch();
        scope.reset(Some(&second));
        assert_eq!(cpu.scratch(), scratch);
        cpu.raise(Vector::INVALID_OPCODE);
        scope.leave();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn leave_twice_restores_once() {
        let cpu = cpu();
        cpu.enable_interrupts();
        let before = snapshot(&cpu);
        let trace = FaultTrace::new();
        let mut scope = SandboxScope::enter(&cpu, &trace);
        assert!(!cpu.interrupts_enabled());
        scope.leave();
        assert_eq!(snapshot(&cpu), before);

        // Disturb the core; a second leave must not restore again.
        cpu.disable_interrupts();
        scope.leave();
        assert!(!cpu.interrupts_enabled());
        drop(scope);
        assert!(!cpu.interrupts_enabled());
    }

    #[test]
    fn restore_is_complete_for_any_fault_count() {
        for count in [0usize, 1, 17, 127, 128] {
            let cpu = cpu();
            cpu.enable_interrupts();
            // SAFETY: the host table is loaded, the scratch value is never
            // dereferenced.
            unsafe { cpu.set_scratch(0xFFFF_8000_DEAD_0000) };
            let before = snapshot(&cpu);
            let trace = FaultTrace::new();
            {
                let _scope = SandboxScope::enter(&cpu, &trace);
                for _ in 0..count {
                    cpu.raise(Vector::PAGE_FAULT);
                }
            }
            assert_eq!(snapshot(&cpu), before, "after {count} faults");
            assert_eq!(trace.count_faults(), count);
        }
    }

    #[test]
    fn disabled_interrupts_stay_disabled() {
        let cpu = cpu();
        cpu.disable_interrupts();
        {
            let _scope = SandboxScope::enter_untraced(&cpu);
        }
        assert!(!cpu.interrupts_enabled());
    }

    #[test]
    fn capacity_saturates() {
        let cpu = cpu();
        let trace = FaultTrace::new();
        {
            let _scope = SandboxScope::enter(&cpu, &trace);
            cpu.raise(Vector::NMI);
            for _ in 0..300 {
                cpu.raise(Vector::GENERAL_PROTECTION_FAULT);
            }
        }
        assert_eq!(trace.len(), TRACE_CAPACITY);
        assert_eq!(trace.count_faults(), TRACE_CAPACITY - 1);
    }

    #[test]
    fn untraced_scope_swallows_faults() {
        let cpu = cpu();
        let outer = FaultTrace::new();
        let _outer = SandboxScope::enter(&cpu, &outer);
        {
            let _inner = SandboxScope::enter_untraced(&cpu);
            cpu.raise(Vector::GENERAL_PROTECTION_FAULT);
        }
        assert!(outer.is_empty());
        cpu.raise(Vector::GENERAL_PROTECTION_FAULT);
        assert_eq!(outer.len(), 1);
    }

    #[test]
    fn nested_scope_restores_outer_routing() {
        let cpu = cpu();
        let outer = FaultTrace::new();
        let _outer = SandboxScope::enter(&cpu, &outer);
        assert_eq!(try_rdmsr(&cpu, FaultFilter::DEFAULT, crate::arch::defs::MSR_HV_GUEST_OS_ID), None);
        assert!(outer.is_empty());
        cpu.raise(Vector::INVALID_OPCODE);
        assert_eq!(outer.count_vector(Vector::INVALID_OPCODE), 1);
    }

    #[test]
    fn entering_clears_previous_contents() {
        let cpu = cpu();
        let trace = FaultTrace::new();
        {
            let _scope = SandboxScope::enter(&cpu, &trace);
            cpu.raise(Vector::PAGE_FAULT);
        }
        {
            let _scope = SandboxScope::enter(&cpu, &trace);
        }
        assert!(trace.is_empty());
    }

    #[test]
    #[should_panic]
    fn fault_outside_scope_is_fatal() {
        cpu().raise(Vector::GENERAL_PROTECTION_FAULT);
    }
}
