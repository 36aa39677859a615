//! Instruction-length decoding for the trap routines.
//!
//! When a probed instruction faults, the saved RIP still points at it.
//! The private trap routine advances RIP by the instruction length so
//! execution resumes at the next instruction instead of re-faulting.
//! Only the encodings the probes can fault on need to decode: system
//! instructions (`0F xx`), port I/O, `MOV` forms, `INT`, and the fence
//! group.  Anything else yields `None` and the caller skips a fixed
//! [`FALLBACK_SKIP`] bytes.

/// Architectural maximum instruction length.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Bytes skipped when an encoding is not recognised.
pub const FALLBACK_SKIP: usize = MAX_INSTRUCTION_LEN;

/// Number of bytes to advance RIP past the instruction at `bytes`.
///
/// `XGETBV` / `XSETBV` (`0F 01 D0` / `0F 01 D1`) are matched directly
/// since they are by far the most frequently trapped encodings.
pub fn skip_length(bytes: &[u8]) -> usize {
    if bytes.len() >= 3 && bytes[0] == 0x0F && bytes[1] == 0x01 && matches!(bytes[2], 0xD0 | 0xD1) {
        return 3;
    }
    instruction_length(bytes).unwrap_or(FALLBACK_SKIP)
}

/// Decode the length of one instruction, or `None` for encodings outside
/// the supported subset (and for truncated input).
pub fn instruction_length(bytes: &[u8]) -> Option<usize> {
    let mut cur = Cursor { bytes, pos: 0 };
    let mut operand_16 = false;

    // Legacy prefixes.
    loop {
        match cur.peek()? {
            0x66 => operand_16 = true,
            0x67 | 0xF0 | 0xF2 | 0xF3 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 => {}
            _ => break,
        }
        cur.advance(1)?;
    }

    // REX must immediately precede the opcode.
    let mut rex_w = false;
    if let 0x40..=0x4F = cur.peek()? {
        rex_w = cur.peek()? & 0x08 != 0;
        cur.advance(1)?;
    }

    let opcode = cur.next()?;
    match opcode {
        // No operands.
        0x50..=0x5F | 0x90 | 0x9C | 0x9D | 0xC3 | 0xCC | 0xCF | 0xF4 | 0xFA | 0xFB => {}
        0xEC..=0xEF => {}
        // imm8 operands.
        0xE4..=0xE7 | 0xCD | 0xEB | 0xB0..=0xB7 => cur.advance(1)?,
        // rel32.
        0xE8 | 0xE9 => cur.advance(4)?,
        0xB8..=0xBF => cur.advance(if rex_w {
            8
        } else if operand_16 {
            2
        } else {
            4
        })?,
        // ModRM forms.
        0x88..=0x8C | 0x8E => cur.modrm()?,
        0xC6 => {
            cur.modrm()?;
            cur.advance(1)?;
        }
        0xC7 => {
            cur.modrm()?;
            cur.advance(if operand_16 { 2 } else { 4 })?;
        }
        0x0F => two_byte(&mut cur)?,
        _ => return None,
    }

    (cur.pos <= MAX_INSTRUCTION_LEN).then_some(cur.pos)
}

fn two_byte(cur: &mut Cursor<'_>) -> Option<()> {
    match cur.next()? {
        // CLTS, INVD, WBINVD, UD2, WRMSR, RDTSC, RDMSR, RDPMC, CPUID.
        0x06 | 0x08 | 0x09 | 0x0B | 0x30..=0x33 | 0xA2 => Some(()),
        // Group 6 (SLDT/STR/...), group 7 (SMSW/INVLPG/XGETBV/...),
        // MOV CRn/DRn, NOP r/m, group 15 fences, MOVZX/MOVSX.
        0x00 | 0x01 | 0x1F | 0x20..=0x23 | 0xAE | 0xB6 | 0xB7 | 0xBE | 0xBF => cur.modrm(),
        _ => None,
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<u8> {
        if self.pos >= MAX_INSTRUCTION_LEN {
            return None;
        }
        self.bytes.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn advance(&mut self, n: usize) -> Option<()> {
        if self.pos + n > self.bytes.len() {
            return None;
        }
        self.pos += n;
        Some(())
    }

    /// ModRM plus optional SIB and displacement (32/64-bit addressing).
    fn modrm(&mut self) -> Option<()> {
        let modrm = self.next()?;
        let md = modrm >> 6;
        let rm = modrm & 0b111;
        if md == 0b11 {
            return Some(());
        }
        let mut disp = match md {
            0b01 => 1,
            0b10 => 4,
            _ => 0,
        };
        if rm == 0b100 {
            let sib = self.next()?;
            if md == 0b00 && sib & 0b111 == 0b101 {
                disp = 4;
            }
        } else if md == 0b00 && rm == 0b101 {
            // RIP-relative.
            disp = 4;
        }
        self.advance(disp)
    }
}
