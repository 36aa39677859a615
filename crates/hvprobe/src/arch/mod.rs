//! The privileged-instruction surface every probe executes through.
//!
//! [`Cpu`] is deliberately flat: one method per instruction (or per
//! fixed instruction sequence) that the sandbox, the metric sources and
//! the battery need.  Methods never report faults through their return
//! value.  A faulting instruction is routed through whatever vector
//! table is loaded; inside a [`SandboxScope`](crate::sandbox::SandboxScope)
//! that means it is recorded and skipped, and the method returns whatever
//! the destination held (zero for reads).  Outside a scope a fault is
//! fatal, exactly as it would be for the raw instruction.
//!
//! Implementations:
//! - [`native::NativeCpu`] (feature `ring0`, x86_64): inline assembly.
//! - [`crate::sim::SimCpu`]: deterministic software machine.

pub mod decode;
pub mod defs;
#[cfg(all(feature = "ring0", target_arch = "x86_64"))]
pub mod native;

pub use defs::{OperandWidth, Vector};

/// Output of one `CPUID` invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Base and limit of a descriptor table, as stored by `SIDT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub limit: u16,
    pub base: u64,
}

/// General-purpose registers exchanged with the hypervisor backdoor port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackdoorRegs {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Privileged operations on the executing logical core.
///
/// All methods act on the *current* core.  Callers are expected to be
/// pinned (or to run with interrupts disabled) for the duration of any
/// sequence that must observe one core.
pub trait Cpu {
    // ── Identification & counters ───────────────────────────────────

    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;
    fn rdtsc(&self) -> u64;
    /// `RDTSCP`: counter plus `IA32_TSC_AUX`.
    fn rdtscp(&self) -> (u64, u32);
    /// `RDPMC` with the raw ECX selector (bit 30 selects fixed counters).
    fn rdpmc(&self, selector: u32) -> u64;
    fn rdmsr(&self, msr: u32) -> u64;
    fn wrmsr(&self, msr: u32, value: u64);
    /// `XGETBV` with the full 64-bit RCX; hardware only decodes ECX.
    fn xgetbv(&self, rcx: u64) -> u64;
    /// `XSETBV` with the full 64-bit RCX.
    fn xsetbv(&self, rcx: u64, value: u64);

    // ── Control & system registers ──────────────────────────────────

    fn read_cr0(&self) -> u64;
    fn read_cr3(&self) -> u64;
    fn write_cr3(&self, value: u64);
    fn read_cr4(&self) -> u64;
    /// `SMSW` into a 64-bit register.
    fn smsw(&self) -> u64;
    /// `STR` at the given operand width into a register preloaded with
    /// `preset`; returns the register afterwards.
    fn store_task_register(&self, width: OperandWidth, preset: u64) -> u64;
    /// `SLDT`, same register convention as
    /// [`store_task_register`](Self::store_task_register).
    fn store_ldt_register(&self, width: OperandWidth, preset: u64) -> u64;
    fn write_dr0(&self, value: u64);
    fn write_dr7(&self, value: u64);

    // ── Trap plumbing (used by the sandbox) ─────────────────────────

    fn interrupts_enabled(&self) -> bool;
    fn disable_interrupts(&self);
    fn enable_interrupts(&self);
    /// Currently loaded fault-vector table.
    fn vector_table(&self) -> DescriptorTable;
    /// # Safety
    ///
    /// `table` must describe a valid vector table for this core, either
    /// one previously returned by [`vector_table`](Self::vector_table) or
    /// [`sandbox_vector_table`](Self::sandbox_vector_table).
    unsafe fn load_vector_table(&self, table: DescriptorTable);
    /// The private table whose every entry records and skips.
    fn sandbox_vector_table(&self) -> DescriptorTable;
    /// Per-core scratch pointer the private trap routines consult to find
    /// the active trace.
    fn scratch(&self) -> u64;
    /// # Safety
    ///
    /// While the private table is loaded, `value` must be zero or the
    /// address of a [`FaultTrace`](crate::sandbox::FaultTrace) that stays
    /// alive and unmoved until the scratch pointer is replaced.
    unsafe fn set_scratch(&self, value: u64);

    // ── Port I/O ────────────────────────────────────────────────────

    fn outb(&self, port: u16, value: u8);
    /// `IN EAX, DX` against the hypervisor backdoor port with the full
    /// register block in place.
    fn backdoor(&self, regs: BackdoorRegs) -> BackdoorRegs;

    // ── Fixed debug sequences ───────────────────────────────────────

    /// `MOV SS, [selector]` immediately followed by `INT 2`.  With a data
    /// breakpoint on `selector` the #DB is held pending across the
    /// `MOV SS` shadow and must be delivered exactly once.
    fn mov_ss_then_int2(&self, selector: &u16);
    /// Set RFLAGS.TF, execute a lone `PAUSE`, restore RFLAGS.
    fn trap_flag_over_pause(&self);

    // ── Ordering, caches, translation ───────────────────────────────

    /// Instruction-stream serialization point.
    fn serialize(&self);
    fn lfence(&self);
    fn sfence(&self);
    fn mfence(&self);
    fn pause(&self);
    fn wbinvd(&self);
    fn invlpg(&self, va: u64);
    /// Flush non-global translations by reloading CR3.
    fn flush_tlb(&self) {
        self.write_cr3(self.read_cr3());
    }

    // ── Memory ──────────────────────────────────────────────────────

    fn read_u8(&self, va: u64) -> u8;
    fn write_u8(&self, va: u64, value: u8);
    fn read_u64(&self, va: u64) -> u64;
    /// Bring the line at `va` into the caches without using the value.
    fn touch(&self, va: u64);
    fn stack_pointer(&self) -> u64;
}

/// Join the vendor words of leaf 0 (EBX, EDX, ECX) into the 12-byte
/// vendor string.
pub fn vendor_bytes(leaf0: &CpuidResult) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0..4].copy_from_slice(&leaf0.ebx.to_le_bytes());
    out[4..8].copy_from_slice(&leaf0.edx.to_le_bytes());
    out[8..12].copy_from_slice(&leaf0.ecx.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_bytes_order_is_ebx_edx_ecx() {
        let leaf0 = CpuidResult {
            eax: 0x16,
            ebx: defs::VENDOR_INTEL[0],
            edx: defs::VENDOR_INTEL[1],
            ecx: defs::VENDOR_INTEL[2],
        };
        assert_eq!(&vendor_bytes(&leaf0), b"GenuineIntel");
    }
}
