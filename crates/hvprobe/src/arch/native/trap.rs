//! Private fault-vector table and its trap routines.
//!
//! Every one of the 256 gates points at a ten-byte stub that pushes its
//! vector number and jumps to a shared prologue.  The prologue saves the
//! caller-saved registers and hands the frame to [`trap_dispatch`], which
//! appends the vector to the active trace, advances the saved RIP past
//! the faulting instruction where needed, and tells the prologue whether
//! to pop an error code before `IRETQ`.
//!
//! The active trace is found through the table itself: `SIDT` yields the
//! table base, and the scratch word sits right after the last gate.  Each
//! core therefore needs its own [`TrapTable`].

use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering::Relaxed};

use crate::arch::decode::{skip_length, MAX_INSTRUCTION_LEN};
use crate::arch::{DescriptorTable, Vector};
use crate::sandbox::FaultTrace;

const GATE_COUNT: usize = 256;
const STUB_LEN: usize = 10;

/// Present, DPL 0, 64-bit interrupt gate (IF cleared on entry).
const INTERRUPT_GATE: u8 = 0x8E;

core::arch::global_asm! {
    "hvprobe_trap_common:",
    "push rbp",
    "mov rbp, rsp",
    "push rax",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "mov rdi, rbp",
    "and rsp, 0xfffffffffffffff0",
    "call {dispatch}",
    "test al, al",
    "mov rax, [rbp - 8]",
    "mov rcx, [rbp - 16]",
    "mov rdx, [rbp - 24]",
    "mov rsi, [rbp - 32]",
    "mov rdi, [rbp - 40]",
    "mov r8, [rbp - 48]",
    "mov r9, [rbp - 56]",
    "mov r10, [rbp - 64]",
    "mov r11, [rbp - 72]",
    // Drop the saved registers and the vector; neither touches flags.
    "lea rsp, [rbp + 16]",
    "mov rbp, [rbp]",
    "jz 2f",
    "add rsp, 8",
    "2:",
    "iretq",

    // One push-vector / jump stub per gate.
    ".globl hvprobe_trap_stubs",
    "hvprobe_trap_stubs:",
    ".rept 256",
    ".byte 0x68", ".long \\+",
    ".byte 0xe9", ".long hvprobe_trap_common - . - 4",
    ".endr",
    dispatch = sym trap_dispatch,
}

extern "C" {
    #[link_name = "hvprobe_trap_stubs"]
    static TRAP_STUBS: [u8; GATE_COUNT * STUB_LEN];
}

#[allow(dead_code)]
#[repr(C)]
struct Frame {
    rbp: u64,
    vector: u64,
    error_code: u64,
}

#[repr(C)]
struct ReturnParams {
    rip: u64,
    cs: u64,
    rflags: u64,
}

/// # Safety
///
/// Only called by `hvprobe_trap_common` with the frame it built, while a
/// [`TrapTable`] is the loaded vector table.
unsafe extern "C" fn trap_dispatch(frame: *mut u64) -> bool {
    // SAFETY: the prologue passes its own frame pointer.
    let vector = Vector(unsafe { (*frame.cast::<Frame>()).vector } as u8);
    let has_error_code = vector.has_error_code();

    // SAFETY: the CPU pushed RIP, CS and RFLAGS above the optional error
    // code.
    let ret = unsafe {
        &mut *frame
            .byte_add(if has_error_code { 24 } else { 16 })
            .cast::<ReturnParams>()
    };

    // SAFETY: only the private table routes here, so SIDT names a
    // TrapTable whose scratch word is zero or a live FaultTrace.
    unsafe {
        let table = &*(current_table_base() as *const TrapTable);
        let trace = table.scratch.load(Relaxed) as *const FaultTrace;
        if let Some(trace) = trace.as_ref() {
            trace.record(vector.recorded());
        }
    }

    if vector.needs_skip() {
        // SAFETY: RIP addresses the faulting instruction, which is mapped
        // and at most fifteen bytes long.
        let bytes = unsafe { core::slice::from_raw_parts(ret.rip as *const u8, MAX_INSTRUCTION_LEN) };
        ret.rip += skip_length(bytes) as u64;
    }
    has_error_code
}

fn current_table_base() -> u64 {
    sidt().base
}

/// `SIDT`: the currently loaded vector table.
pub(super) fn sidt() -> DescriptorTable {
    let mut out = [0u8; 10];
    // SAFETY: SIDT stores ten bytes into `out`.
    unsafe {
        core::arch::asm!("sidt [{}]", in(reg) out.as_mut_ptr(), options(nostack, preserves_flags));
    }
    DescriptorTable {
        limit: u16::from_le_bytes([out[0], out[1]]),
        base: u64::from_le_bytes([out[2], out[3], out[4], out[5], out[6], out[7], out[8], out[9]]),
    }
}

/// `LIDT`.
///
/// # Safety
///
/// `table` must describe a valid 64-bit vector table that stays mapped
/// while it is loaded.
pub(super) unsafe fn lidt(table: DescriptorTable) {
    let mut buf = [0u8; 10];
    buf[..2].copy_from_slice(&table.limit.to_le_bytes());
    buf[2..].copy_from_slice(&table.base.to_le_bytes());
    // SAFETY: forwarded to the caller.
    unsafe {
        core::arch::asm!("lidt [{}]", in(reg) buf.as_ptr(), options(readonly, nostack, preserves_flags));
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
struct Gate {
    offset_low: u16,
    selector: u16,
    ist: u8,
    attributes: u8,
    offset_middle: u16,
    offset_high: u32,
    reserved: u32,
}

impl Gate {
    fn new(handler: u64, selector: u16) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            ist: 0,
            attributes: INTERRUPT_GATE,
            offset_middle: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }
}

/// One core's private vector table plus the scratch word its trap
/// routines read.
#[repr(C, align(16))]
pub struct TrapTable {
    gates: [Gate; GATE_COUNT],
    scratch: AtomicU64,
}

impl TrapTable {
    /// Build a table whose gates all use the current code segment.
    pub fn new() -> Self {
        let selector: u16;
        // SAFETY: reading CS has no side effects.
        unsafe {
            core::arch::asm!("mov {:x}, cs", out(reg) selector, options(nomem, nostack, preserves_flags));
        }
        // SAFETY: the stub block is a linker-provided static.
        let stubs = unsafe { core::ptr::addr_of!(TRAP_STUBS) } as u64;
        Self {
            gates: core::array::from_fn(|i| Gate::new(stubs + (i * STUB_LEN) as u64, selector)),
            scratch: AtomicU64::new(0),
        }
    }

    pub fn descriptor(&self) -> DescriptorTable {
        DescriptorTable {
            limit: (size_of::<[Gate; GATE_COUNT]>() - 1) as u16,
            base: self.gates.as_ptr() as u64,
        }
    }

    pub fn scratch(&self) -> u64 {
        self.scratch.load(Relaxed)
    }

    pub fn set_scratch(&self, value: u64) {
        self.scratch.store(value, Relaxed);
    }
}

impl Default for TrapTable {
    fn default() -> Self {
        Self::new()
    }
}
