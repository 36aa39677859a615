//! The simulated core.
//!
//! Every [`Cpu`] method charges a fixed cycle cost to the virtual TSC
//! (plus the profile's exit cost when a hypervisor would intercept the
//! instruction), advances the enabled performance counters, and then
//! applies the architectural effect.  A failing effect raises its vector
//! through [`SimCpu::raise`], which behaves like the real delivery path:
//! recorded through the scratch pointer when the private table is loaded,
//! fatal otherwise.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;

use crate::arch::defs::*;
use crate::arch::{BackdoorRegs, Cpu, CpuidResult, DescriptorTable, OperandWidth, Vector};
use crate::caps::Vendor;
use crate::mapper::PageMapper;
use crate::metric::pmu::{COUNTER_MASK, EVTSEL_EN, EVTSEL_OS, RDPMC_FIXED};
use crate::sandbox::FaultTrace;

use super::profile::{ClockMsrModel, PtModel, SimProfile};

// ─── Cycle costs ─────────────────────────────────────────────────────

const COST_SIMPLE: u64 = 2;
const COST_RDTSC: u64 = 18;
const COST_RDTSCP: u64 = 30;
const COST_RDPMC: u64 = 24;
const COST_RDMSR: u64 = 90;
const COST_WRMSR: u64 = 110;
const COST_CPUID: u64 = 110;
const COST_XGETBV: u64 = 8;
const COST_XSETBV: u64 = 60;
const COST_SERIALIZE: u64 = 25;
const COST_FENCE: u64 = 4;
const COST_PAUSE: u64 = 40;
const COST_WBINVD: u64 = 2_500;
const COST_PORT_IO: u64 = 900;
const COST_SMM: u64 = 60_000;
const COST_FAULT: u64 = 180;
const COST_MEMORY: u64 = 4;
const COST_PAGE_WALK: u64 = 30;
const COST_MMIO: u64 = 600;
const COST_CR3: u64 = 120;
const COST_INVLPG: u64 = 60;
const COST_DESCRIPTOR: u64 = 20;

// ─── Initial register state ──────────────────────────────────────────

const HOST_TABLE: DescriptorTable = DescriptorTable {
    limit: 0xFFF,
    base: 0xFFFF_FE00_0000_0000,
};
const SANDBOX_TABLE: DescriptorTable = DescriptorTable {
    limit: 0xFFF,
    base: 0xFFFF_FE00_0001_0000,
};

/// PG | WP | NE | ET | MP | PE.
const CR0_INIT: u64 = 0x8005_0033;
const CR3_INIT: u64 = 0x0000_0000_001A_A000;
const CR4_INIT: u64 = 0x0035_06F0;
/// SCE | LME | LMA | NXE.
const EFER_INIT: u64 = 0xD01;
const MISC_ENABLE_INIT: u64 = 0x0085_0089;
const XCR0_INIT: u64 = 0x7;
const XCR0_SUPPORTED: u64 = 0x2FF;
const TSC_INIT: u64 = 1_000_000_000;
const TR_SELECTOR: u16 = 0x40;
const LDT_SELECTOR: u16 = 0;
const CRYSTAL_HZ: u64 = 24_000_000;

// ─── Address space ───────────────────────────────────────────────────

const ALLOCATION_BASE: u64 = 0xFFFF_8880_0010_0000;
const CODE_PAGE: u64 = 0xFFFF_FFFF_8100_0000;
const STACK_PAGE: u64 = 0xFFFF_C900_0040_0000;
const STACK_POINTER: u64 = STACK_PAGE + 0xF80;
const HPET_BASE: u64 = 0xFFFF_FFFF_FF5F_E000;
const HPET_WINDOW: u64 = 0x400;
const FIRST_FRAME: u64 = 0x10_0000;

// ─── Memory ──────────────────────────────────────────────────────────

/// Leaf page tables, frames and an LRU TLB.
struct Memory {
    tables: BTreeMap<u64, u64>,
    frames: BTreeMap<u64, Box<[u8; PAGE_SIZE as usize]>>,
    tlb: VecDeque<(u64, u64)>,
    tlb_entries: usize,
    allocated: BTreeSet<u64>,
    context: Vec<u64>,
    next_va: u64,
    next_frame: u64,
}

impl Memory {
    fn new(tlb_entries: usize) -> Self {
        let mut memory = Self {
            tables: BTreeMap::new(),
            frames: BTreeMap::new(),
            tlb: VecDeque::with_capacity(tlb_entries),
            tlb_entries,
            allocated: BTreeSet::new(),
            context: Vec::new(),
            next_va: ALLOCATION_BASE,
            next_frame: FIRST_FRAME,
        };
        memory.map(CODE_PAGE, PTE_PRESENT);
        memory.map(STACK_PAGE, PTE_PRESENT | PTE_WRITE | PTE_NO_EXECUTE);
        memory.context = alloc::vec![CODE_PAGE, STACK_PAGE];
        memory
    }

    fn map(&mut self, va: u64, flags: u64) {
        let frame = self.next_frame;
        self.next_frame += 1;
        self.frames.insert(frame, Box::new([0; PAGE_SIZE as usize]));
        self.tables.insert(va >> PAGE_SHIFT, (frame << PAGE_SHIFT) | flags);
    }

    fn allocate(&mut self) -> u64 {
        let va = self.next_va;
        // Leave an unmapped guard page after every allocation.
        self.next_va += 2 * PAGE_SIZE;
        self.map(va, PTE_PRESENT | PTE_WRITE | PTE_NO_EXECUTE);
        self.allocated.insert(va);
        va
    }

    fn free(&mut self, va: u64) {
        if !self.allocated.remove(&va) {
            return;
        }
        let vpn = va >> PAGE_SHIFT;
        if let Some(pte) = self.tables.remove(&vpn) {
            self.frames.remove(&((pte & PTE_PFN_MASK) >> PAGE_SHIFT));
        }
        self.invalidate(vpn);
    }

    fn lookup(&mut self, vpn: u64) -> Option<u64> {
        let at = self.tlb.iter().position(|&(v, _)| v == vpn)?;
        let entry = self.tlb.remove(at)?;
        self.tlb.push_back(entry);
        Some(entry.1)
    }

    fn fill(&mut self, vpn: u64, pte: u64) {
        if self.tlb_entries == 0 {
            return;
        }
        if self.tlb.len() == self.tlb_entries {
            self.tlb.pop_front();
        }
        self.tlb.push_back((vpn, pte));
    }

    fn invalidate(&mut self, vpn: u64) {
        self.tlb.retain(|&(v, _)| v != vpn);
    }

    fn frame(&mut self, pa: u64) -> Option<&mut [u8; PAGE_SIZE as usize]> {
        self.frames.get_mut(&(pa >> PAGE_SHIFT)).map(|f| &mut **f)
    }
}

// ─── Performance counters ────────────────────────────────────────────

const INTEL_GENERAL_COUNTERS: u32 = 8;
const AMD_GENERAL_COUNTERS: u32 = 4;
const FIXED_COUNTERS: u32 = 3;

#[derive(Default)]
struct Pmu {
    evtsel: [u64; INTEL_GENERAL_COUNTERS as usize],
    counter: [u64; INTEL_GENERAL_COUNTERS as usize],
    fixed: [u64; FIXED_COUNTERS as usize],
    fixed_ctrl: u64,
    global_ctrl: u64,
}

enum PmuRegister {
    EventSelect(usize),
    Counter(usize),
    Fixed(usize),
    FixedCtrl,
    GlobalCtrl,
}

impl Pmu {
    fn decode(vendor: Vendor, msr: u32) -> Option<PmuRegister> {
        let within = |base: u32, n: u32| (base..base + n).contains(&msr).then(|| (msr - base) as usize);
        match vendor {
            Vendor::Intel => within(IA32_PERFEVTSEL0, INTEL_GENERAL_COUNTERS)
                .map(PmuRegister::EventSelect)
                .or_else(|| within(IA32_PMC0, INTEL_GENERAL_COUNTERS).map(PmuRegister::Counter))
                .or_else(|| within(IA32_FIXED_CTR0, FIXED_COUNTERS).map(PmuRegister::Fixed))
                .or(match msr {
                    IA32_FIXED_CTR_CTRL => Some(PmuRegister::FixedCtrl),
                    IA32_PERF_GLOBAL_CTRL => Some(PmuRegister::GlobalCtrl),
                    _ => None,
                }),
            Vendor::Amd => within(AMD_PERF_EVTSEL0, AMD_GENERAL_COUNTERS)
                .map(PmuRegister::EventSelect)
                .or_else(|| within(AMD_PERF_CTR0, AMD_GENERAL_COUNTERS).map(PmuRegister::Counter)),
            Vendor::Other => None,
        }
    }

    fn counts(&self, vendor: Vendor, index: usize) -> bool {
        let sel = self.evtsel[index];
        sel & EVTSEL_EN != 0
            && sel & EVTSEL_OS != 0
            && (vendor != Vendor::Intel || self.global_ctrl & (1 << index) != 0)
    }

    /// One retired instruction that took `cycles`.
    fn retire(&mut self, vendor: Vendor, cycles: u64) {
        for i in 0..self.evtsel.len() {
            if !self.counts(vendor, i) {
                continue;
            }
            let inc = match self.evtsel[i] & 0xFFFF {
                0x00C0 => 1,
                0x003C | 0x013C | 0x0076 => cycles,
                _ => 0,
            };
            self.counter[i] = self.counter[i].wrapping_add(inc) & COUNTER_MASK;
        }
        for i in 0..self.fixed.len() {
            let field = (self.fixed_ctrl >> (4 * i)) & 0x3;
            if field != 0 && self.global_ctrl & (1 << (32 + i)) != 0 {
                let inc = if i == 0 { 1 } else { cycles };
                self.fixed[i] = self.fixed[i].wrapping_add(inc) & COUNTER_MASK;
            }
        }
    }

    fn count_event(&mut self, vendor: Vendor, event: u64) {
        for i in 0..self.evtsel.len() {
            if self.counts(vendor, i) && self.evtsel[i] & 0xFFFF == event {
                self.counter[i] = self.counter[i].wrapping_add(1) & COUNTER_MASK;
            }
        }
    }
}

// ─── Machine state ───────────────────────────────────────────────────

struct Machine {
    tsc: u64,
    tsc_adjust: u64,
    instructions: u64,
    interrupts: bool,
    vector_table: DescriptorTable,
    scratch: u64,
    cr0: u64,
    cr3: u64,
    cr4: u64,
    xcr0: u64,
    dr0: u64,
    dr7: u64,
    efer: u64,
    misc_enable: u64,
    debugctl: u64,
    pebs_enable: u64,
    rtit_ctl: u64,
    smi_count: u64,
    pmu: Pmu,
    memory: Memory,
}

type Outcome<T> = Result<T, Vector>;

const GP: Vector = Vector::GENERAL_PROTECTION_FAULT;

impl Machine {
    fn new(p: &SimProfile) -> Self {
        Self {
            tsc: TSC_INIT,
            tsc_adjust: 0,
            instructions: 0,
            interrupts: true,
            vector_table: HOST_TABLE,
            scratch: 0,
            cr0: CR0_INIT,
            cr3: CR3_INIT,
            cr4: if p.vmxe { CR4_INIT | CR4_VMXE } else { CR4_INIT },
            xcr0: XCR0_INIT,
            dr0: 0,
            dr7: 0x400,
            efer: EFER_INIT,
            misc_enable: if p.vendor == Vendor::Intel { MISC_ENABLE_INIT } else { 0 },
            debugctl: 0,
            pebs_enable: 0,
            rtit_ctl: 0,
            smi_count: 0,
            pmu: Pmu::default(),
            memory: Memory::new(p.tlb_entries),
        }
    }

    fn step(&mut self, p: &SimProfile, cycles: u64) {
        self.tsc = self.tsc.wrapping_add(cycles);
        self.instructions += 1;
        if p.pmu.counts {
            self.pmu.retire(p.vendor, cycles);
        }
    }

    fn tsc_now(&self) -> u64 {
        self.tsc.wrapping_add(self.tsc_adjust)
    }

    fn deliver_smi(&mut self, p: &SimProfile) {
        self.smi_count = self.smi_count.wrapping_add(1);
        self.tsc = self.tsc.wrapping_add(COST_SMM);
        if p.pmu.counts {
            self.pmu.count_event(p.vendor, 0x002B);
        }
    }

    fn nx_enabled(&self, p: &SimProfile) -> bool {
        if p.quirks.efer_nx_discarded {
            return true;
        }
        let xd_disabled = p.vendor == Vendor::Intel && self.misc_enable & MISC_ENABLE_XD_DISABLE != 0;
        self.efer & EFER_NXE != 0 && !xd_disabled
    }

    /// With NX off, XD is a reserved bit: a context page still carrying it
    /// makes the next fetch or stack access fault, and the fault delivery
    /// itself faults.
    fn check_context_executable(&self, p: &SimProfile) {
        if self.nx_enabled(p) {
            return;
        }
        for &va in &self.memory.context {
            let pte = self.memory.tables.get(&(va >> PAGE_SHIFT)).copied().unwrap_or(0);
            if pte & PTE_NO_EXECUTE != 0 {
                panic!("triple fault: NX disabled while context page {va:#x} is still XD");
            }
        }
    }

    fn translate(&mut self, p: &SimProfile, va: u64) -> Outcome<u64> {
        let vpn = va >> PAGE_SHIFT;
        let pte = match self.memory.lookup(vpn) {
            Some(pte) => pte,
            None => {
                self.tsc = self.tsc.wrapping_add(COST_PAGE_WALK);
                let pte = self.memory.tables.get(&vpn).copied().unwrap_or(0);
                if pte & PTE_PRESENT == 0 {
                    return Err(Vector::PAGE_FAULT);
                }
                if pte & PTE_NO_EXECUTE != 0 && !self.nx_enabled(p) {
                    return Err(Vector::PAGE_FAULT);
                }
                self.memory.fill(vpn, pte);
                pte
            }
        };
        Ok((pte & PTE_PFN_MASK) | (va & (PAGE_SIZE - 1)))
    }

    fn load_byte(&mut self, p: &SimProfile, va: u64) -> Outcome<u8> {
        let pa = self.translate(p, va)?;
        let frame = self.memory.frame(pa).ok_or(Vector::MACHINE_CHECK)?;
        Ok(frame[(pa & (PAGE_SIZE - 1)) as usize])
    }

    fn hpet_read(&self, p: &SimProfile, va: u64) -> u64 {
        if va != HPET_BASE + HPET_MAIN_COUNTER {
            return 0;
        }
        match p.hpet_period_cycles {
            Some(period) => self.tsc / period.max(1),
            None => 0x0BAD_F00D,
        }
    }

    // ── MSRs ──

    fn read_msr(&self, p: &SimProfile, msr: u32) -> Outcome<u64> {
        let intel = p.vendor == Vendor::Intel;
        match msr {
            IA32_TIME_STAMP_COUNTER => Ok(self.tsc_now().wrapping_add(p.quirks.tsc_msr_skew)),
            IA32_SMI_COUNT if intel => Ok(self.smi_count),
            IA32_TSC_ADJUST if p.tsc_adjust => Ok(self.tsc_adjust),
            IA32_MISC_ENABLE if intel => Ok(self.misc_enable),
            IA32_DEBUGCTL => Ok(self.debugctl),
            IA32_PEBS_ENABLE if intel && p.pmu.present => Ok(self.pebs_enable),
            IA32_RTIT_CTL if intel && p.processor_trace != PtModel::Faults => Ok(self.rtit_ctl),
            IA32_PKG_ENERGY_STATUS if p.energy_msrs => Ok(self.tsc / 4_096),
            IA32_DRAM_ENERGY_STATUS if p.energy_msrs => Ok(self.tsc / 16_384),
            IA32_EFER => Ok(self.efer),
            MSR_HV_GUEST_OS_ID | MSR_KVM_SYSTEM_TIME_NEW if p.quirks.hv_msrs => Ok(0),
            _ => match self.read_clock_msr(p, msr) {
                Some(outcome) => outcome,
                None => self.read_pmu_msr(p, msr),
            },
        }
    }

    /// `None` when `msr` is not a clock MSR.
    fn read_clock_msr(&self, p: &SimProfile, msr: u32) -> Option<Outcome<u64>> {
        let amd = p.vendor == Vendor::Amd;
        let (value, native) = match msr {
            IA32_MPERF => (self.tsc, true),
            IA32_APERF => (self.tsc + self.tsc / 8, true),
            IA32_PPERF => (self.tsc - self.tsc / 8, !amd),
            IA32_IRPERF => (self.instructions, amd),
            m if m == IA32_MPERF | MSR_READ_ONLY_ALIAS => (self.tsc, amd),
            m if m == IA32_APERF | MSR_READ_ONLY_ALIAS => (self.tsc + self.tsc / 8, amd),
            m if m == IA32_PPERF | MSR_READ_ONLY_ALIAS => (0, false),
            _ => return None,
        };
        Some(match p.clock_msrs {
            ClockMsrModel::Native if native => Ok(value),
            ClockMsrModel::Native | ClockMsrModel::Hidden => Err(GP),
            ClockMsrModel::Null => Ok(0),
            ClockMsrModel::ReadAll => Ok(value.max(1)),
        })
    }

    fn read_pmu_msr(&self, p: &SimProfile, msr: u32) -> Outcome<u64> {
        if !p.pmu.present {
            return Err(GP);
        }
        match Pmu::decode(p.vendor, msr).ok_or(GP)? {
            PmuRegister::EventSelect(i) => Ok(self.pmu.evtsel[i]),
            PmuRegister::Counter(i) => Ok(self.pmu.counter[i]),
            PmuRegister::Fixed(i) => Ok(self.pmu.fixed[i]),
            PmuRegister::FixedCtrl => Ok(self.pmu.fixed_ctrl),
            PmuRegister::GlobalCtrl => Ok(self.pmu.global_ctrl),
        }
    }

    fn write_msr(&mut self, p: &SimProfile, msr: u32, value: u64) -> Outcome<()> {
        let intel = p.vendor == Vendor::Intel;
        match msr {
            IA32_TSC_ADJUST if p.tsc_adjust => {
                if !p.quirks.tsc_adjust_ignored {
                    self.tsc_adjust = value;
                }
            }
            IA32_MISC_ENABLE if intel => {
                let turbo = 1u64 << MISC_ENABLE_TURBO_DISABLE_BIT;
                let mut value = value;
                if p.quirks.turbo_write_discarded {
                    value = (value & !turbo) | (self.misc_enable & turbo);
                }
                self.misc_enable = value;
                self.check_context_executable(p);
            }
            IA32_DEBUGCTL => {
                if value & !p.debugctl_bits != 0 && !p.is_virtualized() {
                    return Err(GP);
                }
                self.debugctl = value & p.debugctl_bits;
            }
            IA32_PEBS_ENABLE if intel => {
                if !p.pmu.present {
                    return Err(GP);
                }
                if p.pmu.pebs {
                    self.pebs_enable = value;
                }
            }
            IA32_RTIT_CTL if intel => match p.processor_trace {
                PtModel::Supported => self.rtit_ctl = value,
                PtModel::Discards => {}
                PtModel::Faults => return Err(GP),
            },
            IA32_EFER => {
                self.efer = if p.quirks.efer_nx_discarded {
                    value | (self.efer & EFER_NXE)
                } else {
                    value
                };
                self.check_context_executable(p);
            }
            MSR_HV_GUEST_OS_ID | MSR_KVM_SYSTEM_TIME_NEW if p.quirks.hv_msrs => {}
            _ => self.write_pmu_msr(p, msr, value)?,
        }
        Ok(())
    }

    fn write_pmu_msr(&mut self, p: &SimProfile, msr: u32, value: u64) -> Outcome<()> {
        if !p.pmu.present {
            return Err(GP);
        }
        match Pmu::decode(p.vendor, msr).ok_or(GP)? {
            PmuRegister::EventSelect(i) => self.pmu.evtsel[i] = value,
            PmuRegister::Counter(i) if p.pmu.writes_stick => self.pmu.counter[i] = value & COUNTER_MASK,
            PmuRegister::Fixed(i) if p.pmu.writes_stick => self.pmu.fixed[i] = value & COUNTER_MASK,
            PmuRegister::Counter(_) | PmuRegister::Fixed(_) => {}
            PmuRegister::FixedCtrl => self.pmu.fixed_ctrl = value,
            PmuRegister::GlobalCtrl => self.pmu.global_ctrl = value,
        }
        Ok(())
    }

    fn rdpmc(&self, p: &SimProfile, selector: u32) -> Outcome<u64> {
        if !p.pmu.present || p.pmu.rdpmc_faults {
            return Err(GP);
        }
        let index = (selector & 0xFFFF) as usize;
        if selector & RDPMC_FIXED != 0 {
            return match p.vendor {
                Vendor::Intel if index < FIXED_COUNTERS as usize => Ok(self.pmu.fixed[index]),
                _ => Err(GP),
            };
        }
        let general = match p.vendor {
            Vendor::Intel => INTEL_GENERAL_COUNTERS,
            Vendor::Amd => AMD_GENERAL_COUNTERS,
            Vendor::Other => 0,
        };
        if index < general as usize {
            Ok(self.pmu.counter[index])
        } else {
            Err(GP)
        }
    }

    // ── Extended control registers ──

    fn xgetbv(&self, p: &SimProfile, rcx: u64) -> Outcome<u64> {
        if p.quirks.xcr_index_full_rcx && rcx >> 32 != 0 {
            return Err(GP);
        }
        match rcx as u32 {
            0 => Ok(self.xcr0),
            1 if p.xgetbv_ecx1 => Ok(self.xcr0),
            _ => Err(GP),
        }
    }

    fn xsetbv(&mut self, p: &SimProfile, rcx: u64, value: u64) -> Outcome<()> {
        if p.quirks.xcr_index_full_rcx && rcx >> 32 != 0 {
            return Err(GP);
        }
        if rcx as u32 != 0 {
            return if p.quirks.xsetbv_accepts_bad_index { Ok(()) } else { Err(GP) };
        }
        // x87 must stay on; AVX needs SSE.
        let malformed = value & 1 == 0 || (value & 0b100 != 0 && value & 0b10 == 0);
        if malformed {
            return Err(GP);
        }
        if value & !XCR0_SUPPORTED != 0 && !p.quirks.xsetbv_accepts_reserved_bits {
            return Err(GP);
        }
        self.xcr0 = value & XCR0_SUPPORTED;
        Ok(())
    }

    fn cpuid(&self, p: &SimProfile, leaf: u32, subleaf: u32) -> CpuidResult {
        let vendor = match p.vendor {
            Vendor::Intel => VENDOR_INTEL,
            Vendor::Amd => VENDOR_AMD,
            Vendor::Other => [0; 3],
        };
        if leaf > p.max_leaf && leaf < 0x4000_0000 {
            return CpuidResult::default();
        }
        match leaf {
            CPUID_LEAF_VENDOR => CpuidResult {
                eax: p.max_leaf,
                ebx: vendor[0],
                edx: vendor[1],
                ecx: vendor[2],
            },
            CPUID_LEAF_FEATURES => CpuidResult {
                eax: p.signature,
                ebx: 0x0010_0800,
                ecx: 0x7FFA_FBFF | if p.hypervisor_bit { CPUID_1_ECX_HYPERVISOR } else { 0 },
                edx: 0xBFEB_FBFF,
            },
            CPUID_LEAF_THERMAL_POWER => CpuidResult {
                eax: 0x4 | if p.turbo { CPUID_6_EAX_TURBO } else { 0 },
                ..CpuidResult::default()
            },
            CPUID_LEAF_STRUCTURED_EXT if subleaf == 0 => CpuidResult {
                ebx: 0x029C_67A9 | if p.tsc_adjust { CPUID_7_EBX_TSC_ADJUST } else { 0 },
                edx: if p.arch_lbr { CPUID_7_EDX_ARCH_LBR } else { 0 },
                ..CpuidResult::default()
            },
            CPUID_LEAF_XSAVE => {
                let subleaf = if p.quirks.cpuid_ignores_subleaf { 0 } else { subleaf };
                match subleaf {
                    0 => CpuidResult {
                        eax: XCR0_SUPPORTED as u32,
                        ebx: 0x340,
                        ecx: 0x440,
                        edx: 0,
                    },
                    1 => CpuidResult {
                        eax: 0xB | if p.xgetbv_ecx1 { CPUID_D1_EAX_XGETBV_ECX1 } else { 0 },
                        ebx: 0x3C0,
                        ..CpuidResult::default()
                    },
                    _ => CpuidResult::default(),
                }
            }
            CPUID_LEAF_TSC_INFO => CpuidResult {
                eax: 2,
                ebx: (p.tsc_hz * 2 / CRYSTAL_HZ) as u32,
                ecx: CRYSTAL_HZ as u32,
                edx: 0,
            },
            CPUID_LEAF_FREQ_INFO => CpuidResult {
                eax: (p.tsc_hz / 1_000_000) as u32,
                ebx: 4_700,
                ecx: 100,
                edx: 0,
            },
            _ => CpuidResult::default(),
        }
    }

    fn store_selector(p: &SimProfile, width: OperandWidth, preset: u64, selector: u16) -> u64 {
        let selector = u64::from(selector);
        if p.quirks.str_sldt_width_bug {
            return (preset & !0xFFFF) | selector;
        }
        match width {
            OperandWidth::W16 => (preset & !0xFFFF) | selector,
            OperandWidth::W32 | OperandWidth::W64 => selector,
        }
    }
}

// ─── The core ────────────────────────────────────────────────────────

/// A deterministic single core with the personality of a [`SimProfile`].
///
/// Not thread safe; one `SimCpu` models one logical core.
pub struct SimCpu {
    profile: SimProfile,
    state: RefCell<Machine>,
}

impl SimCpu {
    pub fn new(profile: SimProfile) -> Self {
        let machine = Machine::new(&profile);
        Self {
            profile,
            state: RefCell::new(machine),
        }
    }

    pub fn profile(&self) -> &SimProfile {
        &self.profile
    }

    /// Deliver `vector` as the hardware would.
    ///
    /// # Panics
    ///
    /// When the host vector table is loaded: the fault would escape to the
    /// host, which is fatal for a probe.
    pub fn raise(&self, vector: Vector) {
        let (table, scratch) = {
            let m = self.state.borrow();
            (m.vector_table, m.scratch)
        };
        if table != SANDBOX_TABLE {
            panic!("unhandled {vector:?} with the host vector table loaded");
        }
        if scratch != 0 {
            // SAFETY: set_scratch's contract keeps a live FaultTrace at this
            // address while the private table is loaded.
            let trace = unsafe { &*(scratch as *const FaultTrace) };
            trace.record(vector.recorded());
        }
        let mut m = self.state.borrow_mut();
        m.tsc = m.tsc.wrapping_add(COST_FAULT);
    }

    /// Pages handed out by [`PageMapper::allocate_page`] and not yet freed.
    pub fn allocated_pages(&self) -> usize {
        self.state.borrow().memory.allocated.len()
    }

    /// SMIs that reached SMM so far.
    pub fn smi_count(&self) -> u64 {
        self.state.borrow().smi_count
    }

    /// Preset the SMI counter, as firmware that has been up for a while
    /// would leave it.
    pub fn set_smi_count(&self, count: u64) {
        self.state.borrow_mut().smi_count = count;
    }

    pub fn instructions_retired(&self) -> u64 {
        self.state.borrow().instructions
    }

    fn exit_cost(&self, exits: bool) -> u64 {
        if exits {
            self.profile.exit_cycles.unwrap_or(0)
        } else {
            0
        }
    }

    /// Charge `cost` (plus an exit), run `effect`, deliver its fault.
    fn exec<R: Default>(
        &self,
        cost: u64,
        exits: bool,
        effect: impl FnOnce(&SimProfile, &mut Machine) -> Outcome<R>,
    ) -> R {
        let outcome = {
            let mut m = self.state.borrow_mut();
            m.step(&self.profile, cost + self.exit_cost(exits));
            effect(&self.profile, &mut *m)
        };
        outcome.unwrap_or_else(|vector| {
            self.raise(vector);
            R::default()
        })
    }

    fn is_hpet(&self, va: u64) -> bool {
        self.profile.hpet_present && (HPET_BASE..HPET_BASE + HPET_WINDOW).contains(&va)
    }
}

impl fmt::Debug for SimCpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.state.borrow();
        f.debug_struct("SimCpu")
            .field("profile", &self.profile.name)
            .field("tsc", &m.tsc)
            .field("instructions", &m.instructions)
            .finish_non_exhaustive()
    }
}

impl Cpu for SimCpu {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.exec(COST_CPUID, true, |p, m| Ok(m.cpuid(p, leaf, subleaf)))
    }

    fn rdtsc(&self) -> u64 {
        self.exec(COST_RDTSC, false, |_, m| {
            // The value is latched before the instruction's own cost.
            Ok(m.tsc_now().wrapping_sub(COST_RDTSC))
        })
    }

    fn rdtscp(&self) -> (u64, u32) {
        self.exec(COST_RDTSCP, false, |_, m| Ok((m.tsc_now(), 0)))
    }

    fn rdpmc(&self, selector: u32) -> u64 {
        self.exec(COST_RDPMC, false, |p, m| m.rdpmc(p, selector))
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        self.exec(COST_RDMSR, true, |p, m| m.read_msr(p, msr))
    }

    fn wrmsr(&self, msr: u32, value: u64) {
        self.exec(COST_WRMSR, true, |p, m| m.write_msr(p, msr, value))
    }

    fn xgetbv(&self, rcx: u64) -> u64 {
        self.exec(COST_XGETBV, false, |p, m| m.xgetbv(p, rcx))
    }

    fn xsetbv(&self, rcx: u64, value: u64) {
        self.exec(COST_XSETBV, true, |p, m| m.xsetbv(p, rcx, value))
    }

    fn read_cr0(&self) -> u64 {
        self.exec(COST_SIMPLE, false, |_, m| Ok(m.cr0))
    }

    fn read_cr3(&self) -> u64 {
        self.exec(COST_SIMPLE, false, |_, m| Ok(m.cr3))
    }

    fn write_cr3(&self, value: u64) {
        let shadow = self.profile.quirks.shadow_paging;
        self.exec(COST_CR3, shadow, |_, m| {
            m.cr3 = value;
            m.memory.tlb.clear();
            Ok(())
        })
    }

    fn read_cr4(&self) -> u64 {
        self.exec(COST_SIMPLE, false, |_, m| Ok(m.cr4))
    }

    fn smsw(&self) -> u64 {
        self.exec(COST_SIMPLE, false, |p, m| {
            Ok(if p.quirks.smsw_truncated { m.cr0 & 0xFFFF } else { m.cr0 })
        })
    }

    fn store_task_register(&self, width: OperandWidth, preset: u64) -> u64 {
        self.exec(COST_SIMPLE, false, |p, _| {
            Ok(Machine::store_selector(p, width, preset, TR_SELECTOR))
        })
    }

    fn store_ldt_register(&self, width: OperandWidth, preset: u64) -> u64 {
        self.exec(COST_SIMPLE, false, |p, _| {
            Ok(Machine::store_selector(p, width, preset, LDT_SELECTOR))
        })
    }

    fn write_dr0(&self, value: u64) {
        self.exec(COST_SIMPLE, false, |_, m| {
            m.dr0 = value;
            Ok(())
        })
    }

    fn write_dr7(&self, value: u64) {
        self.exec(COST_SIMPLE, false, |_, m| {
            m.dr7 = value;
            Ok(())
        })
    }

    fn interrupts_enabled(&self) -> bool {
        self.state.borrow().interrupts
    }

    fn disable_interrupts(&self) {
        self.exec(COST_SIMPLE, false, |_, m| {
            m.interrupts = false;
            Ok(())
        })
    }

    fn enable_interrupts(&self) {
        self.exec(COST_SIMPLE, false, |_, m| {
            m.interrupts = true;
            Ok(())
        })
    }

    fn vector_table(&self) -> DescriptorTable {
        self.state.borrow().vector_table
    }

    unsafe fn load_vector_table(&self, table: DescriptorTable) {
        self.exec(COST_DESCRIPTOR, false, |_, m| {
            m.vector_table = table;
            Ok(())
        })
    }

    fn sandbox_vector_table(&self) -> DescriptorTable {
        SANDBOX_TABLE
    }

    fn scratch(&self) -> u64 {
        self.state.borrow().scratch
    }

    unsafe fn set_scratch(&self, value: u64) {
        self.exec(COST_SIMPLE, false, |_, m| {
            m.scratch = value;
            Ok(())
        })
    }

    fn outb(&self, port: u16, _value: u8) {
        self.exec(COST_PORT_IO, true, |p, m| {
            if port == PORT_APM_CONTROL && !p.quirks.smi_swallowed {
                m.deliver_smi(p);
            }
            Ok(())
        })
    }

    fn backdoor(&self, regs: BackdoorRegs) -> BackdoorRegs {
        self.exec(COST_PORT_IO, true, |p, _| {
            let addressed = regs.eax == VMWARE_MAGIC
                && regs.edx & 0xFFFF == u32::from(PORT_VMWARE_BACKDOOR);
            if !(p.quirks.vmware_backdoor && addressed) {
                // Nothing decodes the port: the bus floats high.
                return Ok(BackdoorRegs { eax: u32::MAX, ..regs });
            }
            if regs.ecx & 0xFFFF == VMWARE_CMD_GET_VERSION {
                Ok(BackdoorRegs {
                    eax: 6,
                    ebx: VMWARE_MAGIC,
                    ..regs
                })
            } else {
                Ok(regs)
            }
        })
    }

    fn mov_ss_then_int2(&self, selector: &u16) {
        let addr = selector as *const u16 as u64;
        let hit = self.exec(COST_SIMPLE, false, |p, m| {
            let watched = m.dr7 & 1 != 0 && (m.dr0..m.dr0 + 2).contains(&addr);
            Ok(watched && !p.quirks.drops_pending_db)
        });
        if hit {
            self.raise(Vector::DEBUG);
        }
        self.raise(Vector::NMI);
    }

    fn trap_flag_over_pause(&self) {
        let single_step = self.exec(COST_PAUSE, false, |p, m| {
            let branch_only = m.debugctl & DEBUGCTL_BTF != 0 && !p.quirks.btf_ignored;
            Ok(!branch_only)
        });
        if single_step {
            self.raise(Vector::DEBUG);
        }
    }

    fn serialize(&self) {
        self.exec(COST_SERIALIZE, false, |_, _| Ok(()))
    }

    fn lfence(&self) {
        self.exec(COST_FENCE, false, |_, _| Ok(()))
    }

    fn sfence(&self) {
        self.exec(COST_FENCE, false, |_, _| Ok(()))
    }

    fn mfence(&self) {
        self.exec(COST_FENCE, false, |_, _| Ok(()))
    }

    fn pause(&self) {
        self.exec(COST_PAUSE, false, |_, _| Ok(()))
    }

    fn wbinvd(&self) {
        self.exec(COST_WBINVD, true, |_, _| Ok(()))
    }

    fn invlpg(&self, va: u64) {
        let shadow = self.profile.quirks.shadow_paging;
        self.exec(COST_INVLPG, shadow, |_, m| {
            m.memory.invalidate(va >> PAGE_SHIFT);
            Ok(())
        })
    }

    fn read_u8(&self, va: u64) -> u8 {
        if self.is_hpet(va) {
            return self.read_u64(va & !7).to_le_bytes()[(va & 7) as usize];
        }
        self.exec(COST_MEMORY, false, |p, m| m.load_byte(p, va))
    }

    fn write_u8(&self, va: u64, value: u8) {
        self.exec(COST_MEMORY, false, |p, m| {
            let pa = m.translate(p, va)?;
            let frame = m.memory.frame(pa).ok_or(Vector::MACHINE_CHECK)?;
            frame[(pa & (PAGE_SIZE - 1)) as usize] = value;
            Ok(())
        })
    }

    fn read_u64(&self, va: u64) -> u64 {
        if self.is_hpet(va) {
            return self.exec(COST_MMIO, true, |p, m| Ok(m.hpet_read(p, va)));
        }
        self.exec(COST_MEMORY, false, |p, m| {
            let mut bytes = [0u8; 8];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = m.load_byte(p, va.wrapping_add(i as u64))?;
            }
            Ok(u64::from_le_bytes(bytes))
        })
    }

    fn touch(&self, va: u64) {
        // A prefetch: fills the TLB, never faults.
        self.exec(COST_MEMORY, false, |p, m| {
            let _ = m.translate(p, va);
            Ok(())
        })
    }

    fn stack_pointer(&self) -> u64 {
        STACK_POINTER
    }
}

impl PageMapper for SimCpu {
    fn allocate_page(&self) -> Option<u64> {
        Some(self.state.borrow_mut().memory.allocate())
    }

    fn free_page(&self, va: u64) {
        self.state.borrow_mut().memory.free(va);
    }

    fn read_pte(&self, va: u64) -> Option<u64> {
        self.state.borrow().memory.tables.get(&(va >> PAGE_SHIFT)).copied()
    }

    unsafe fn write_pte(&self, va: u64, pte: u64) {
        let mut m = self.state.borrow_mut();
        let vpn = va >> PAGE_SHIFT;
        m.memory.tables.insert(vpn, pte);
        if self.profile.quirks.shadow_paging {
            // The hypervisor traps the write and drops the shadow entry.
            m.memory.invalidate(vpn);
            m.tsc = m.tsc.wrapping_add(self.exit_cost(true));
        }
    }

    fn hpet_base(&self) -> Option<u64> {
        self.profile.hpet_present.then_some(HPET_BASE)
    }

    fn context_pages(&self) -> Vec<u64> {
        self.state.borrow().memory.context.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::with_no_execute;
    use crate::sandbox::{guarded, try_rdmsr, FaultFilter};
    use crate::sim::Quirks;

    fn bare() -> SimCpu {
        SimCpu::new(SimProfile::bare_metal_intel())
    }

    #[test]
    fn rdtsc_is_monotonic_and_charges_costs() {
        let cpu = bare();
        let a = cpu.rdtsc();
        let b = cpu.rdtsc();
        assert_eq!(b - a, COST_RDTSC);
        let (c, _) = cpu.rdtscp();
        assert!(c > b);
    }

    #[test]
    fn unknown_msr_faults_inside_a_scope() {
        let cpu = bare();
        assert_eq!(try_rdmsr(&cpu, FaultFilter::DEFAULT, 0xDEAD), None);
        assert_eq!(try_rdmsr(&cpu, FaultFilter::DEFAULT, IA32_EFER), Some(EFER_INIT));
    }

    #[test]
    fn exits_only_under_a_hypervisor() {
        let cost = |cpu: &SimCpu| {
            let a = cpu.rdtsc();
            cpu.cpuid(0, 0);
            cpu.rdtsc() - a
        };
        assert_eq!(cost(&bare()), COST_RDTSC + COST_CPUID);
        assert_eq!(cost(&SimCpu::new(SimProfile::kvm())), COST_RDTSC + COST_CPUID + 1_200);
    }

    #[test]
    fn smi_reaches_smm_unless_swallowed() {
        let cpu = bare();
        cpu.outb(PORT_APM_CONTROL, 0);
        cpu.outb(0x80, 0);
        assert_eq!(cpu.smi_count(), 1);
        assert_eq!(cpu.rdmsr(IA32_SMI_COUNT), 1);

        let vm = SimCpu::new(SimProfile::kvm());
        vm.outb(PORT_APM_CONTROL, 0);
        assert_eq!(vm.smi_count(), 0);
    }

    #[test]
    fn tsc_adjust_moves_the_counter() {
        let cpu = bare();
        let before = cpu.rdtsc();
        cpu.wrmsr(IA32_TSC_ADJUST, 1 << 40);
        assert!(cpu.rdtsc() > before + (1 << 40));

        let mut profile = SimProfile::bare_metal_intel();
        profile.quirks = Quirks {
            tsc_adjust_ignored: true,
            ..Quirks::default()
        };
        let cpu = SimCpu::new(profile);
        let before = cpu.rdtsc();
        cpu.wrmsr(IA32_TSC_ADJUST, 1 << 40);
        assert!(cpu.rdtsc() < before + (1 << 40));
    }

    #[test]
    fn xsetbv_validates_index_and_value() {
        let cpu = bare();
        let fault = |f: &dyn Fn(&SimCpu)| guarded(&cpu, FaultFilter::DEFAULT, |c| f(c)).1.has_fault();
        assert!(!fault(&|c| c.xsetbv(0, XCR0_INIT)));
        assert!(fault(&|c| c.xsetbv(3, XCR0_INIT)));
        assert!(fault(&|c| c.xsetbv(0, XCR0_INIT | XCR0_RESERVED_BIT_21)));
        assert!(!fault(&|c| c.xsetbv(1 << 32, XCR0_INIT)));
        assert_eq!(cpu.xgetbv(0), XCR0_INIT);
    }

    #[test]
    fn str_width_semantics() {
        let cpu = bare();
        assert_eq!(cpu.store_task_register(OperandWidth::W64, u64::MAX), 0x40);
        assert_eq!(cpu.store_task_register(OperandWidth::W32, u64::MAX), 0x40);
        assert_eq!(
            cpu.store_task_register(OperandWidth::W16, u64::MAX),
            0xFFFF_FFFF_FFFF_0040
        );

        let vm = SimCpu::new(SimProfile::vmware());
        assert_ne!(vm.store_task_register(OperandWidth::W64, u64::MAX) >> 16, 0);
    }

    #[test]
    fn stale_translation_survives_pte_rewrite_without_shadow_paging() {
        for (profile, stale) in [(SimProfile::bare_metal_intel(), 7), (SimProfile::vmware(), 0)] {
            let cpu = SimCpu::new(profile);
            let page = cpu.allocate_page().unwrap();
            let zero = cpu.allocate_page().unwrap();
            cpu.write_u8(page, 7);
            let (Some(pte), Some(zero_pte)) = (cpu.read_pte(page), cpu.read_pte(zero)) else {
                panic!("unmapped allocation");
            };
            // SAFETY: both pages are private to this test.
            unsafe { cpu.write_pte(page, crate::mapper::with_frame(pte, zero_pte)) };
            assert_eq!(cpu.read_u8(page), stale);
            cpu.flush_tlb();
            assert_eq!(cpu.read_u8(page), 0);
        }
    }

    #[test]
    fn xd_is_reserved_once_nx_is_off() {
        let cpu = bare();
        let page = cpu.allocate_page().unwrap();
        for va in cpu.context_pages() {
            let pte = cpu.read_pte(va).unwrap();
            // SAFETY: simulated context pages; nothing executes from them.
            unsafe { cpu.write_pte(va, with_no_execute(pte, false)) };
        }
        let ((), trace) = guarded(&cpu, FaultFilter::DEFAULT, |cpu| {
            cpu.wrmsr(IA32_EFER, EFER_INIT & !EFER_NXE);
            cpu.flush_tlb();
            cpu.write_u8(page, 1);
            cpu.wrmsr(IA32_EFER, EFER_INIT);
        });
        assert_eq!(trace.count_vector(Vector::PAGE_FAULT), 1);
    }

    #[test]
    #[should_panic(expected = "triple fault")]
    fn disabling_nx_under_xd_context_is_fatal() {
        let cpu = bare();
        cpu.wrmsr(IA32_EFER, EFER_INIT & !EFER_NXE);
    }

    #[test]
    fn free_releases_only_allocations() {
        let cpu = bare();
        let page = cpu.allocate_page().unwrap();
        cpu.free_page(STACK_PAGE);
        assert!(cpu.read_pte(STACK_PAGE).is_some());
        cpu.free_page(page);
        assert_eq!(cpu.allocated_pages(), 0);
        assert!(cpu.read_pte(page).is_none());
    }
}
