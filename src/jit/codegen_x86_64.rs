//! x86-64 host code emitters used while threading a guest path together.
//!
//! Each function returns a `Vec<u8>` of raw machine code to append to the
//! current `JitBlock`. These mirror blink's `AppendJitSetReg`,
//! `AppendJitCall`, `AppendJitJump`, `AppendJitRet`, and `AppendJitNop`:
//! shortest-encoding selection for loading a register (xor-to-zero when
//! the immediate is zero, 32-bit sign-extended form when it fits, full
//! 64-bit immediate otherwise), and 5-byte-relative-call/jump encoding
//! when the target is within `JIT_PROXIMITY` of the call site.

fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | (b as u8)
}

/// Loads a 64-bit immediate into a GPR, choosing the shortest available
/// encoding: `xor reg,reg` for zero, 32-bit sign-extended `mov` (0xC7) when
/// the value fits, otherwise a full REX.W `mov r64, imm64` (0xB8+r).
pub fn set_reg(dst: u8, value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    if value == 0 {
        out.push(rex(false, dst >= 8, false, dst >= 8));
        out.push(0x31);
        out.push(0xc0 | ((dst & 7) << 3) | (dst & 7));
        return out;
    }
    if value <= i32::MAX as u64 {
        out.push(rex(true, false, false, dst >= 8));
        out.push(0xc7);
        out.push(0xc0 | (dst & 7));
        out.extend_from_slice(&(value as i32).to_le_bytes());
        return out;
    }
    out.push(rex(true, false, false, dst >= 8));
    out.push(0xb8 + (dst & 7));
    out.extend_from_slice(&value.to_le_bytes());
    out
}

/// `mov dst, src` (full 64-bit GPR to GPR).
pub fn mov_reg(dst: u8, src: u8) -> Vec<u8> {
    vec![rex(true, src >= 8, false, dst >= 8), 0x89, 0xc0 | ((src & 7) << 3) | (dst & 7)]
}

/// Host GPR encodings for the two registers every compiled block reserves:
/// `r12` holds the `*mut Machine` pointer resident for the block's whole
/// lifetime (loaded once in the block prologue from `rdi`, the SysV
/// arg0 the dispatch loop calls the block with); `rdi` is reloaded from
/// it before every handler call since handlers take the machine pointer
/// as their sole argument, matching blink's convention of threading `P`
/// (the machine pointer) through every Jitter-emitted call.
pub const MACHINE_PTR_HOME: u8 = 0b1100; // r12
pub const ARG0: u8 = 0b111; // rdi
pub const ARG1: u8 = 0b110; // rsi

/// `push r64`/`pop r64`, needed around `MACHINE_PTR_HOME` since it's a
/// SysV callee-saved register: a block entered by `call` is obliged to
/// leave it exactly as found, and the caller (`Machine::run_compiled`, a
/// plain Rust `extern "C" fn(*mut Machine)` call) relies on that.
pub fn push_reg(reg: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(2);
    if reg >= 8 {
        out.push(0x41);
    }
    out.push(0x50 + (reg & 7));
    out
}

pub fn pop_reg(reg: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(2);
    if reg >= 8 {
        out.push(0x41);
    }
    out.push(0x58 + (reg & 7));
    out
}

/// Saves the caller's `r12` and loads the machine pointer into it. Pairs
/// with `block_epilogue`; between the two, `call`-site alignment is the
/// same 16-byte-before-`call` state a normal function entry gets (the
/// `push` trades the 8-byte misalignment a `call`-based entry always
/// starts with for the aligned state a `call r11` inside the block needs).
pub fn block_prologue() -> Vec<u8> {
    let mut out = push_reg(MACHINE_PTR_HOME);
    out.extend_from_slice(&mov_reg(MACHINE_PTR_HOME, ARG0));
    out
}

/// Restores the caller's `r12` before the block's final `ret`. Must be
/// emitted on every path out of a committed block, not just the natural
/// fall-through end (any future branch-out-of-path beside `ret` would need
/// the same restore first).
pub fn block_epilogue() -> Vec<u8> {
    pop_reg(MACHINE_PTR_HOME)
}

pub fn reload_machine_arg() -> Vec<u8> {
    mov_reg(ARG0, MACHINE_PTR_HOME)
}

/// Direct relative `call rel32` from `site` to `target`, valid only when
/// `target - (site + 5)` fits in `i32` (checked by the caller against
/// `JIT_PROXIMITY` before emission is attempted).
pub fn call_rel32(site: u64, target: u64) -> Vec<u8> {
    let rel = (target as i64) - (site as i64 + 5);
    let mut out = vec![0xe8u8];
    out.extend_from_slice(&(rel as i32).to_le_bytes());
    out
}

/// Direct relative `jmp rel32`.
pub fn jmp_rel32(site: u64, target: u64) -> Vec<u8> {
    let rel = (target as i64) - (site as i64 + 5);
    let mut out = vec![0xe9u8];
    out.extend_from_slice(&(rel as i32).to_le_bytes());
    out
}

/// `ret`.
pub fn ret() -> Vec<u8> {
    vec![0xc3]
}

/// Multi-byte NOP padding, using the standard Intel-recommended encodings
/// up to 9 bytes (blink's `AlignJit` table), looped for longer runs.
pub fn nop(len: usize) -> Vec<u8> {
    const TABLE: [&[u8]; 10] = [
        &[],
        &[0x90],
        &[0x66, 0x90],
        &[0x0f, 0x1f, 0x00],
        &[0x0f, 0x1f, 0x40, 0x00],
        &[0x0f, 0x1f, 0x44, 0x00, 0x00],
        &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
        &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],
        &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        &[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    ];
    let mut out = Vec::with_capacity(len);
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(9);
        out.extend_from_slice(TABLE[chunk]);
        remaining -= chunk;
    }
    out
}

/// One-byte `int3`, used as a trap filler so a guest that somehow jumps
/// into unreserved alignment padding faults instead of executing garbage.
pub fn trap() -> Vec<u8> {
    vec![0xcc]
}

/// Host-side distance between a would-be call site and its target,
/// checked by the path builder before choosing a direct `call_rel32`
/// over an indirect call through a register loaded with `set_reg`.
pub fn in_proximity(site: u64, target: u64) -> bool {
    let delta = target as i64 - site as i64;
    delta.unsigned_abs() <= super::JIT_PROXIMITY as u64
}
