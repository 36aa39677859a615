//! Processor probes.
//!
//! The basic group ([`collect_info`] through [`test_clk`]) only reads
//! state or toggles it and puts it back.  The advanced group
//! ([`test_cr`], [`test_msr`], [`test_nx`]) feeds deliberately invalid
//! operands to instructions a hypervisor has to emulate.

use alloc::vec::Vec;

use rand::Rng;

use super::Probe;
use crate::arch::defs::*;
use crate::arch::{Cpu, OperandWidth, Vector};
use crate::caps::ClockMsr;
use crate::mapper::with_no_execute;
use crate::metric::pmu::PmcEvent;

/// Preset for the 16-bit `STR`/`SLDT` form; bits 63:16 must survive.
const SELECTOR_PRESET_16: u64 = 0xEACC_EACC_EACC_EACC;

/// Selector the data breakpoint watches during the MOV SS probe.
const WATCHED_SELECTOR: u16 = 0x18;

/// First display model with Processor Trace (Broadwell).
const PT_FIRST_MODEL: u32 = 70;

// ─── Identification ──────────────────────────────────────────────────

pub(super) fn collect_info<C: Cpu + ?Sized>(p: &mut Probe<'_, C>) {
    let sig = p.caps.signature;
    let data = &mut p.report.data.processor;
    data.set("brand", p.caps.brand_str());
    data.set("highestFunction", p.caps.max_leaf);
    data.set("family", sig.family);
    data.set("model", sig.model);
    data.set("type", sig.processor_type);
    data.set("stepping", sig.stepping);
    data.set("extendedFamily", sig.extended_family);
    data.set("extendedModel", sig.extended_model);
    data.set("isIntel", p.caps.is_intel());

    let hypervisor_bit = p.caps.hypervisor_bit;
    p.flag("vm.hvFlagSet", hypervisor_bit);

    let null_clock = p.caps.probe_clock_msrs(p.cpu, p.filter);
    p.flag("vm.nullClock", null_clock);
}

// ─── Interruptibility ────────────────────────────────────────────────

/// OR together whatever an emulated `STR`/`SLDT` leaves above the
/// selector.  Zero on hardware.
fn selector_garbage(store: impl Fn(OperandWidth, u64) -> u64) -> u64 {
    let mut bits = store(OperandWidth::W64, u64::MAX) >> 16;
    bits |= store(OperandWidth::W32, u64::MAX) >> 16;
    bits |= (store(OperandWidth::W16, SELECTOR_PRESET_16) >> 16).wrapping_sub(SELECTOR_PRESET_16 >> 16);
    bits
}

pub(super) fn test_int<C: Cpu + ?Sized>(p: &mut Probe<'_, C>) {
    let cpu = p.cpu;
    let str_bits = selector_garbage(|w, preset| cpu.store_task_register(w, preset));
    let sldt_bits = selector_garbage(|w, preset| cpu.store_ldt_register(w, preset));
    p.flag("vm.strEmulFail", str_bits != 0);
    p.flag("vm.sldtEmulFail", sldt_bits != 0);

    // A data breakpoint hit by MOV SS is held across the shadow and must
    // still be delivered, once, before the INT 2.
    let selector = WATCHED_SELECTOR;
    cpu.write_dr0(&selector as *const u16 as u64);
    cpu.write_dr7(DR7_L0_RW_LEN2);
    let ((), trace) = p.guarded(|cpu| cpu.mov_ss_then_int2(&selector));
    cpu.write_dr7(0);

    let delivered = trace.count_vector(Vector::DEBUG);
    p.flag("vm.dbSuppressed", delivered != 1);
    p.report.data.processor.set("dbsDelivered", delivered);
}

// ─── Power management ────────────────────────────────────────────────

pub(super) fn test_po<C: Cpu + ?Sized>(p: &mut Probe<'_, C>) {
    if !p.caps.is_intel() {
        return;
    }
    let turbo = p.caps.has_leaf(CPUID_LEAF_THERMAL_POWER)
        && p.cpu.cpuid(CPUID_LEAF_THERMAL_POWER, 0).eax & CPUID_6_EAX_TURBO != 0;
    if !turbo {
        p.skip("po", "no turbo boost");
        return;
    }

    let bit = 1u64 << MISC_ENABLE_TURBO_DISABLE_BIT;
    let ((before, after), trace) = p.guarded(|cpu| {
        let before = cpu.rdmsr(IA32_MISC_ENABLE);
        cpu.wrmsr(IA32_MISC_ENABLE, before ^ bit);
        let after = cpu.rdmsr(IA32_MISC_ENABLE);
        cpu.wrmsr(IA32_MISC_ENABLE, before);
        (before, after)
    });
    p.flag("vm.turboSuppressed", trace.has_fault() || (before ^ after) & bit == 0);
}

// ─── Performance monitoring ──────────────────────────────────────────

pub(super) fn test_pm<C: Cpu + ?Sized>(p: &mut Probe<'_, C>) {
    let cpu = p.cpu;
    let pmu = p.pmu();

    if !pmu.dynamic_disable(cpu, 0) {
        p.report.data.processor.set("failedSettingPmcs", true);
        return;
    }
    let magic = p.rng.gen_range(1u64 << 2..1u64 << 20);
    if !pmu.dynamic_set_value(cpu, 0, magic) {
        p.report.data.processor.set("failedWritingPmcs", true);
        return;
    }

    p.flag("vm.pmcMsrMismatch", pmu.dynamic_value(cpu, 0) != magic);

    let (via_rdpmc, trace) = p.guarded(|cpu| cpu.rdpmc(0));
    p.report
        .detections
        .set("vm.rdpmcMismatch", u64::from(via_rdpmc != magic));
    p.flag("vm.rdpmcFaulted", trace.has_fault());

    // Count for a moment; the value must have moved past the magic.
    if !pmu.dynamic_enable(cpu, 0, PmcEvent::InstructionsRetired) {
        p.report.data.processor.set("failedSettingPmcs", true);
        return;
    }
    pmu.dynamic_disable(cpu, 0);
    p.flag("vm.pmcDead", pmu.dynamic_value(cpu, 0) <= magic);

    if p.caps.is_intel() {
        let (pebs, trace) = p.guarded(|cpu| {
            cpu.wrmsr(IA32_PEBS_ENABLE, PEBS_ENABLE_PMC0);
            let pebs = cpu.rdmsr(IA32_PEBS_ENABLE);
            cpu.wrmsr(IA32_PEBS_ENABLE, 0);
            pebs
        });
        if trace.has_fault() {
            p.report.data.processor.set("failedEnablingPebs", true);
        } else {
            p.flag("vm.pebsSuppressed", pebs & PEBS_ENABLE_PMC0 == 0);
        }
    }
}

// ─── Debug extensions ────────────────────────────────────────────────

pub(super) fn test_dbg<C: Cpu + ?Sized>(p: &mut Probe<'_, C>) {
    let cpu = p.cpu;
    let leaf7 = if p.caps.has_leaf(CPUID_LEAF_STRUCTURED_EXT) {
        cpu.cpuid(CPUID_LEAF_STRUCTURED_EXT, 0)
    } else {
        Default::default()
    };

    // Architectural LBRs use their own MSRs; DEBUGCTL.LBR is legacy only.
    if leaf7.edx & CPUID_7_EDX_ARCH_LBR == 0 {
        let (state, _) = p.guarded(|cpu| {
            cpu.wrmsr(IA32_DEBUGCTL, DEBUGCTL_LBR);
            let state = cpu.rdmsr(IA32_DEBUGCTL);
            cpu.wrmsr(IA32_DEBUGCTL, 0);
            state
        });
        p.flag("vm.lbrSuppressed", state & DEBUGCTL_LBR == 0);
    }

    if p.caps.is_intel() {
        let (state, trace) = p.guarded(|cpu| {
            cpu.wrmsr(IA32_DEBUGCTL, DEBUGCTL_BTS_OFF_OS);
            cpu.rdmsr(IA32_DEBUGCTL)
        });
        p.flag("vm.btsOsFault", trace.has_fault());
        p.flag("vm.btsOsSuppressed", state & DEBUGCTL_BTS_OFF_OS == 0);
    }

    // With BTF the trap flag only fires on branches; a lone PAUSE must
    // not raise #DB.
    let ((), trace) = p.guarded(|cpu| cpu.wrmsr(IA32_DEBUGCTL, DEBUGCTL_BTF));
    if trace.has_fault() {
        p.skip("dbg/btf", "DEBUGCTL.BTF not writable");
    } else {
        let ((), trace) = p.guarded(|cpu| {
            cpu.trap_flag_over_pause();
            cpu.wrmsr(IA32_DEBUGCTL, 0);
        });
        p.flag("vm.btfSuppressed", trace.has_fault());
    }

    let sig = p.caps.signature;
    let has_pt = sig.family > 6 || (sig.family == 6 && sig.display_model() >= PT_FIRST_MODEL);
    if p.caps.is_intel() && has_pt {
        let (suppressed, _) = p.guarded(|cpu| {
            let previous = cpu.rdmsr(IA32_RTIT_CTL);
            cpu.wrmsr(
                IA32_RTIT_CTL,
                RTIT_CTL_TOPA | RTIT_CTL_TRACE_EN | RTIT_CTL_BRANCH_EN,
            );
            let active = cpu.rdmsr(IA32_RTIT_CTL);
            cpu.wrmsr(IA32_RTIT_CTL, previous);
            active & RTIT_CTL_TRACE_EN == 0
        });
        p.flag("vm.ptSuppressed", suppressed);
    }
}

// ─── Identifiers ─────────────────────────────────────────────────────

pub(super) fn test_id<C: Cpu + ?Sized>(p: &mut Probe<'_, C>) {
    if !p.caps.has_leaf(CPUID_LEAF_XSAVE) {
        p.skip("id", "no leaf 0xD");
        return;
    }
    // Sub-leaves 0 and 1 of leaf 0xD never coincide on hardware.
    let sub0 = p.cpu.cpuid(CPUID_LEAF_XSAVE, 0);
    let sub1 = p.cpu.cpuid(CPUID_LEAF_XSAVE, 1);
    p.flag("vm.cpuidEcxSuppressed", sub0 == sub1);
}

// ─── Clocks ──────────────────────────────────────────────────────────

pub(super) fn test_clk<C: Cpu + ?Sized>(p: &mut Probe<'_, C>) {
    let hidden = !p.caps.aperf.is_present() || !p.caps.mperf.is_present();
    p.flag("vm.hiddenClocks", hidden);

    let tsc_adjust = p.caps.has_leaf(CPUID_LEAF_STRUCTURED_EXT)
        && p.cpu.cpuid(CPUID_LEAF_STRUCTURED_EXT, 0).ebx & CPUID_7_EBX_TSC_ADJUST != 0;
    if !(p.caps.is_intel() && tsc_adjust) {
        p.skip("clk/tsc", "no IA32_TSC_ADJUST");
        return;
    }

    // Warp the TSC forward through TSC_ADJUST and make sure RDTSCP moved
    // by the same amount.
    let warp = u64::from(p.rng.gen::<u32>() | 0x00DE_AD00);
    let ((t0, t1), trace) = p.guarded(|cpu| {
        let adjust = cpu.rdmsr(IA32_TSC_ADJUST);
        let t0 = cpu.rdtsc();
        cpu.serialize();
        cpu.wrmsr(IA32_TSC_ADJUST, adjust.wrapping_add(warp));
        cpu.serialize();
        let t1 = cpu.rdtscp().0;
        cpu.serialize();
        cpu.wrmsr(IA32_TSC_ADJUST, adjust);
        (t0, t1)
    });
    if trace.has_fault() {
        p.skip("clk/tsc", "IA32_TSC_ADJUST faulted");
        return;
    }
    let t1 = t1.wrapping_sub(warp);
    let tolerance = p.config.tsc_adjust_tolerance_cycles;
    p.flag("vm.tscWarped", t1 < t0 || t1 > t0.saturating_add(tolerance));
}

// ─── Advanced: control registers ─────────────────────────────────────

pub(super) fn test_cr<C: Cpu + ?Sized>(p: &mut Probe<'_, C>) {
    let cpu = p.cpu;
    let (xcr0, trace) = p.guarded(|cpu| cpu.xgetbv(0));
    if trace.has_fault() {
        p.skip("cr", "XGETBV unavailable");
        return;
    }
    // Hardware only decodes ECX; garbage in RCX[63:32] must be ignored.
    let high = (cpu.rdtsc() << 32) | (1 << 32);

    let ecx1 = p.caps.has_leaf(CPUID_LEAF_XSAVE)
        && cpu.cpuid(CPUID_LEAF_XSAVE, 1).eax & CPUID_D1_EAX_XGETBV_ECX1 != 0;
    let index = u64::from(ecx1);
    let (_, trace) = p.guarded(|cpu| cpu.xgetbv(index | high));
    p.flag("vm.xgetbvEmulFail", trace.has_fault());

    let ((), trace) = p.guarded(|cpu| cpu.xsetbv(3, 0));
    p.flag("vm.xsetbvLeafEmulFail", !trace.has_fault());

    let ((), trace) = p.guarded(|cpu| cpu.xsetbv(high, xcr0));
    p.flag("vm.xsetbvLeafEmulFail2", trace.has_fault());

    let ((), trace) = p.guarded(|cpu| cpu.xsetbv(high, xcr0 | XCR0_RESERVED_BIT_21));
    p.flag("vm.xsetbvValueEmulFail", !trace.has_fault());

    let smsw = cpu.smsw();
    let cr0 = cpu.read_cr0();
    p.flag("vm.smswEmulFail", (smsw ^ cr0) as u32 != 0);
}

// ─── Advanced: MSR decoding ──────────────────────────────────────────

pub(super) fn test_msr<C: Cpu + ?Sized>(p: &mut Probe<'_, C>) {
    // Intel has no read-only aliases and no IRPERF; both answering means
    // unknown MSRs read as zero instead of faulting.
    if p.caps.is_intel() {
        let invalid = p.caps.mperf == ClockMsr::Aliased && p.caps.irperf.is_present();
        p.flag("vm.msrDefaultInvalid", invalid);
    }

    let ((), trace) = p.guarded(|cpu| {
        cpu.rdmsr(MSR_KVM_SYSTEM_TIME_NEW);
        cpu.rdmsr(MSR_HV_GUEST_OS_ID);
    });
    p.flag("vm.hvMsrs", trace.count_faults() != 2);

    // RDMSR IA32_TIME_STAMP_COUNTER must agree with RDTSC; an emulator
    // that confuses RCX with ECX, or forgets the TSC offset, does not.
    let threshold = p.config.tsc_msr_threshold_cycles;
    let samples = p.config.tsc_msr_samples;
    let mut fails = 0;
    for _ in 0..samples {
        let ((tsc, msr), trace) = p.guarded(|cpu| {
            cpu.serialize();
            let tsc = cpu.rdtsc();
            cpu.serialize();
            let msr = cpu.rdmsr(IA32_TIME_STAMP_COUNTER);
            cpu.serialize();
            (tsc, msr)
        });
        if trace.has_fault() || msr.wrapping_sub(tsc) > threshold {
            fails += 1;
        }
    }
    p.flag("vm.tscMsrEmulFail", fails > samples / 2);
}

// ─── Advanced: NX enforcement ────────────────────────────────────────

/// One leaf entry changed by [`test_nx`] and its previous value.
struct Reverted {
    va: u64,
    pte: u64,
}

/// Set or clear XD on the leaf entry of `va` and drop its translation.
/// Remembers the previous entry when it changed.
fn set_no_execute<C: Cpu + ?Sized>(p: &Probe<'_, C>, va: u64, xd: bool, log: &mut Vec<Reverted>) {
    let Some(pte) = p.mapper.read_pte(va) else {
        return;
    };
    let wanted = with_no_execute(pte, xd);
    if wanted == pte {
        return;
    }
    // SAFETY: `va` is either the probe page or one of the mapper's
    // context pages, and only XD changes.
    unsafe { p.mapper.write_pte(va, wanted) };
    p.cpu.invlpg(va);
    log.push(Reverted { va, pte });
}

/// Turn NX enforcement off and touch an XD page.  With NX off, XD is a
/// reserved bit, so the access must #PF; a hypervisor that silently keeps
/// EFER.NXE set lets it through.
pub(super) fn test_nx<C: Cpu + ?Sized>(p: &mut Probe<'_, C>) {
    let Some(page) = p.mapper.allocate_page() else {
        p.skip("nx", "no page available");
        return;
    };
    let context = p.mapper.context_pages();
    let intel = p.caps.is_intel();
    let mut changed = Vec::with_capacity(context.len() + 1);

    let ((), trace) = p.guarded(|cpu| {
        set_no_execute(p, page, true, &mut changed);
        // Everything the core fetches or pushes to while the fault is
        // delivered must stay valid once XD becomes reserved.
        for &va in &context {
            set_no_execute(p, va, false, &mut changed);
        }

        let efer = cpu.rdmsr(IA32_EFER);
        cpu.wrmsr(IA32_EFER, efer & !EFER_NXE);
        let misc = if intel {
            let misc = cpu.rdmsr(IA32_MISC_ENABLE);
            cpu.wrmsr(IA32_MISC_ENABLE, misc | MISC_ENABLE_XD_DISABLE);
            Some(misc)
        } else {
            None
        };

        cpu.write_u8(page, 0);
        cpu.cpuid(0, 0);
        cpu.flush_tlb();
        cpu.write_u8(page, 0);
        cpu.cpuid(0, 0);
        cpu.write_u8(page, 0);

        if let Some(misc) = misc {
            cpu.wrmsr(IA32_MISC_ENABLE, misc & !MISC_ENABLE_XD_DISABLE);
        }
        cpu.wrmsr(IA32_EFER, efer | EFER_NXE);

        for entry in changed.iter().rev() {
            // SAFETY: restores the entry read before it was changed.
            unsafe { p.mapper.write_pte(entry.va, entry.pte) };
            cpu.invlpg(entry.va);
        }
    });

    p.mapper.free_page(page);
    p.flag("vm.eferNxDiscard", !trace.has_fault());
}
