//! Ring-0 x86_64 backend.
//!
//! [`NativeCpu`] executes every [`Cpu`] method as the real instruction.
//! It owns a private [`TrapTable`] whose address never changes for the
//! lifetime of the value, so a sandbox scope can load it and point the
//! table's scratch word at a trace.
//!
//! The embedding kernel must be built without a red zone and without SSE
//! in interrupt context (the usual kernel target settings): the trap
//! routines run on the interrupted stack and only save general-purpose
//! registers.

mod trap;

use alloc::boxed::Box;
use core::arch::asm;
use core::arch::x86_64::{__cpuid_count, __rdtscp, _rdtsc};
use core::marker::PhantomData;

pub use self::trap::TrapTable;
use super::defs::{OperandWidth, RFLAGS_IF};
use super::{BackdoorRegs, Cpu, CpuidResult, DescriptorTable};

/// The executing core, driven through inline assembly.
///
/// Not `Send`: the vector table and scratch word belong to the core the
/// value was created on.
pub struct NativeCpu {
    table: Box<TrapTable>,
    _core: PhantomData<*const ()>,
}

impl NativeCpu {
    /// # Safety
    ///
    /// The caller must run at CPL 0 on x86_64 long mode, stay on the
    /// current logical core for the lifetime of the value, and never let
    /// the value drop while its private table is loaded.
    pub unsafe fn new() -> Self {
        Self {
            table: Box::new(TrapTable::new()),
            _core: PhantomData,
        }
    }
}

fn split(value: u64) -> (u32, u32) {
    (value as u32, (value >> 32) as u32)
}

fn join(lo: u32, hi: u32) -> u64 {
    u64::from(lo) | (u64::from(hi) << 32)
}

// SAFETY (all blocks below): `NativeCpu::new` requires CPL 0, where each
// of these instructions is architecturally permitted.  Faults go through
// whatever table is loaded, as documented on `Cpu`.
impl Cpu for NativeCpu {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        let r = unsafe { __cpuid_count(leaf, subleaf) };
        CpuidResult {
            eax: r.eax,
            ebx: r.ebx,
            ecx: r.ecx,
            edx: r.edx,
        }
    }

    fn rdtsc(&self) -> u64 {
        unsafe { _rdtsc() }
    }

    fn rdtscp(&self) -> (u64, u32) {
        let mut aux = 0;
        let tsc = unsafe { __rdtscp(&mut aux) };
        (tsc, aux)
    }

    fn rdpmc(&self, selector: u32) -> u64 {
        let (mut lo, mut hi) = (0u32, 0u32);
        unsafe {
            asm!("rdpmc", in("ecx") selector, inout("eax") lo, inout("edx") hi,
                 options(nomem, nostack, preserves_flags));
        }
        join(lo, hi)
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        let (mut lo, mut hi) = (0u32, 0u32);
        unsafe {
            asm!("rdmsr", in("ecx") msr, inout("eax") lo, inout("edx") hi,
                 options(nomem, nostack, preserves_flags));
        }
        join(lo, hi)
    }

    fn wrmsr(&self, msr: u32, value: u64) {
        let (lo, hi) = split(value);
        unsafe {
            asm!("wrmsr", in("ecx") msr, in("eax") lo, in("edx") hi, options(nostack, preserves_flags));
        }
    }

    fn xgetbv(&self, rcx: u64) -> u64 {
        let (mut lo, mut hi) = (0u32, 0u32);
        unsafe {
            asm!("xgetbv", in("rcx") rcx, inout("eax") lo, inout("edx") hi,
                 options(nomem, nostack, preserves_flags));
        }
        join(lo, hi)
    }

    fn xsetbv(&self, rcx: u64, value: u64) {
        let (lo, hi) = split(value);
        unsafe {
            asm!("xsetbv", in("rcx") rcx, in("eax") lo, in("edx") hi, options(nostack, preserves_flags));
        }
    }

    fn read_cr0(&self) -> u64 {
        let v: u64;
        unsafe { asm!("mov {}, cr0", out(reg) v, options(nomem, nostack, preserves_flags)) };
        v
    }

    fn read_cr3(&self) -> u64 {
        let v: u64;
        unsafe { asm!("mov {}, cr3", out(reg) v, options(nomem, nostack, preserves_flags)) };
        v
    }

    fn write_cr3(&self, value: u64) {
        unsafe { asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags)) };
    }

    fn read_cr4(&self) -> u64 {
        let v: u64;
        unsafe { asm!("mov {}, cr4", out(reg) v, options(nomem, nostack, preserves_flags)) };
        v
    }

    fn smsw(&self) -> u64 {
        let mut v = 0u64;
        unsafe { asm!("smsw {:r}", inout(reg) v, options(nomem, nostack, preserves_flags)) };
        v
    }

    fn store_task_register(&self, width: OperandWidth, preset: u64) -> u64 {
        let mut v = preset;
        unsafe {
            match width {
                OperandWidth::W16 => asm!("str {:x}", inout(reg) v, options(nomem, nostack, preserves_flags)),
                OperandWidth::W32 => asm!("str {:e}", inout(reg) v, options(nomem, nostack, preserves_flags)),
                OperandWidth::W64 => asm!("str {:r}", inout(reg) v, options(nomem, nostack, preserves_flags)),
            }
        }
        v
    }

    fn store_ldt_register(&self, width: OperandWidth, preset: u64) -> u64 {
        let mut v = preset;
        unsafe {
            match width {
                OperandWidth::W16 => asm!("sldt {:x}", inout(reg) v, options(nomem, nostack, preserves_flags)),
                OperandWidth::W32 => asm!("sldt {:e}", inout(reg) v, options(nomem, nostack, preserves_flags)),
                OperandWidth::W64 => asm!("sldt {:r}", inout(reg) v, options(nomem, nostack, preserves_flags)),
            }
        }
        v
    }

    fn write_dr0(&self, value: u64) {
        unsafe { asm!("mov dr0, {}", in(reg) value, options(nostack, preserves_flags)) };
    }

    fn write_dr7(&self, value: u64) {
        unsafe { asm!("mov dr7, {}", in(reg) value, options(nostack, preserves_flags)) };
    }

    fn interrupts_enabled(&self) -> bool {
        let flags: u64;
        unsafe { asm!("pushfq", "pop {}", out(reg) flags, options(nomem, preserves_flags)) };
        flags & RFLAGS_IF != 0
    }

    fn disable_interrupts(&self) {
        unsafe { asm!("cli", options(nomem, nostack)) };
    }

    fn enable_interrupts(&self) {
        unsafe { asm!("sti", options(nomem, nostack)) };
    }

    fn vector_table(&self) -> DescriptorTable {
        trap::sidt()
    }

    unsafe fn load_vector_table(&self, table: DescriptorTable) {
        // SAFETY: forwarded to the caller.
        unsafe { trap::lidt(table) }
    }

    fn sandbox_vector_table(&self) -> DescriptorTable {
        self.table.descriptor()
    }

    fn scratch(&self) -> u64 {
        self.table.scratch()
    }

    unsafe fn set_scratch(&self, value: u64) {
        self.table.set_scratch(value);
    }

    fn outb(&self, port: u16, value: u8) {
        unsafe { asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags)) };
    }

    fn backdoor(&self, regs: BackdoorRegs) -> BackdoorRegs {
        let (mut eax, mut ebx, mut ecx, mut edx) = (regs.eax, u64::from(regs.ebx), regs.ecx, regs.edx);
        // RBX is reserved by the compiler, so it is swapped in by hand.
        unsafe {
            asm!(
                "xchg {b}, rbx",
                "in eax, dx",
                "xchg {b}, rbx",
                b = inout(reg) ebx,
                inout("eax") eax,
                inout("ecx") ecx,
                inout("edx") edx,
                options(nomem, nostack, preserves_flags),
            );
        }
        BackdoorRegs {
            eax,
            ebx: ebx as u32,
            ecx,
            edx,
        }
    }

    fn mov_ss_then_int2(&self, selector: &u16) {
        unsafe {
            asm!(
                "mov ss, word ptr [{}]",
                "int 2",
                in(reg) selector as *const u16,
                options(readonly),
            );
        }
    }

    fn trap_flag_over_pause(&self) {
        unsafe {
            asm!(
                "pushfq",
                "or qword ptr [rsp], 0x100",
                "popfq",
                "pause",
                "pushfq",
                "and qword ptr [rsp], ~0x100",
                "popfq",
            );
        }
    }

    fn serialize(&self) {
        self.lfence();
    }

    fn lfence(&self) {
        unsafe { asm!("lfence", options(nostack, preserves_flags)) };
    }

    fn sfence(&self) {
        unsafe { asm!("sfence", options(nostack, preserves_flags)) };
    }

    fn mfence(&self) {
        unsafe { asm!("mfence", options(nostack, preserves_flags)) };
    }

    fn pause(&self) {
        unsafe { asm!("pause", options(nomem, nostack, preserves_flags)) };
    }

    fn wbinvd(&self) {
        unsafe { asm!("wbinvd", options(nostack, preserves_flags)) };
    }

    fn invlpg(&self, va: u64) {
        unsafe { asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags)) };
    }

    fn read_u8(&self, va: u64) -> u8 {
        unsafe { core::ptr::read_volatile(va as *const u8) }
    }

    fn write_u8(&self, va: u64, value: u8) {
        unsafe { core::ptr::write_volatile(va as *mut u8, value) }
    }

    fn read_u64(&self, va: u64) -> u64 {
        unsafe { core::ptr::read_volatile(va as *const u64) }
    }

    fn touch(&self, va: u64) {
        let _ = self.read_u8(va);
    }

    fn stack_pointer(&self) -> u64 {
        let rsp: u64;
        unsafe { asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags)) };
        rsp
    }
}
