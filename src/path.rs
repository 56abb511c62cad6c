//! Path builder (C7): threads a run of guest instructions starting at one
//! RIP into a single block of host machine code.
//!
//! Grounded on blink's `path.c`: `CreatePath` leases a JIT block and emits
//! a prologue, installs a "still building" hook pointing at the
//! interpreter's dispatch-loop re-entry so a racing thread that reaches
//! the same guest PC mid-build falls back to interpretation instead of
//! jumping into half-written code, then each threadable guest instruction
//! appends a direct call into that opcode's handler, which advances `m.ip`
//! itself on return. `CommitPath` publishes the finished block;
//! `AbandonPath` releases it unfinished (hit an unsupported opcode, ran
//! past the per-path instruction budget, or raced with an invalidation).

use crate::decode::{DecodeError, Decoder, Mnemonic};
use crate::jit::{codegen_x86_64 as cg, Jit, JitError};
use crate::stats::Stats;

/// Sentinel host address meaning "this guest PC's path is still being
/// built by some thread; fall back to the interpreter rather than racing
/// it." Matches blink's `JitlessDispatch` placeholder hook.
pub const BUILDING_SENTINEL: u64 = 1;

/// Hard cap on how many guest instructions one path will thread before
/// ending the block at a natural boundary (call/jmp/ret) or this limit,
/// whichever comes first. Keeps a single path's append from starving
/// other threads waiting on the same JIT lock for an unreasonable time.
pub const MAX_PATH_INSTRUCTIONS: usize = 1024;

pub struct PathBuilder<'a> {
    jit: &'a Jit,
    stats: &'a Stats,
    decoder: Decoder,
    block_idx: usize,
    start_pc: u64,
    instructions: usize,
}

#[derive(Debug)]
pub enum PathOutcome {
    Committed { host_entry: u64, guest_bytes: u64, instructions: usize },
    Abandoned { reason: &'static str },
}

impl<'a> PathBuilder<'a> {
    /// Leases a block and stages the "still building" hook, mirroring
    /// `CreatePath`. Returns `None` if the JIT is disabled or out of
    /// proximate memory, in which case the caller should just interpret.
    pub fn start(jit: &'a Jit, stats: &'a Stats, start_pc: u64) -> Option<Self> {
        let block_idx = jit.start().ok()?;
        jit.with_block(block_idx, |b| {
            b.append(&cg::block_prologue());
        });
        jit.hooks.set(start_pc, BUILDING_SENTINEL);
        stats.jit_blocks.store(jit.blocks_allocated(), std::sync::atomic::Ordering::Relaxed);
        Some(PathBuilder { jit, stats, decoder: Decoder::new(), block_idx, start_pc, instructions: 0 })
    }

    /// Appends one guest instruction's fetch-decode-emit cycle. Returns
    /// `Ok(Some(next_pc))` to keep building, `Ok(None)` when this
    /// instruction cannot be (or should not be) absorbed and the path ends
    /// just before it, or `Err` to abandon the whole path (decode failure,
    /// unsupported opcode, budget exhausted, or out of block space).
    ///
    /// Only the register-to-register ALU forms `ops::is_threadable`
    /// accepts are actually absorbed into native code (see the module doc
    /// on `ops::handler_address`): every other instruction, including every
    /// branching one, ends the path without being threaded. Each threaded
    /// call advances `m.ip` by its own operand length itself (see
    /// `ops::pack_for_path`), so by the time a path exits `m.ip` already
    /// sits on the next not-yet-absorbed instruction's address and the
    /// dispatcher picks up there with a plain decode-and-interpret step;
    /// no per-instruction bookkeeping needs emitting here.
    pub fn add_instruction(&mut self, fetch: &[u8], pc: u64) -> Result<Option<u64>, &'static str> {
        if self.instructions >= MAX_PATH_INSTRUCTIONS {
            return Err("path instruction budget exhausted");
        }
        let instr = self.decoder.decode(fetch, pc).map_err(|e| match e {
            DecodeError::Malformed { .. } => "decode error mid-path",
            DecodeError::TooLong { .. } => "instruction exceeds 15 bytes",
        })?;
        if matches!(instr.mnemonic, Mnemonic::Unsupported) {
            return Err("unsupported opcode in path");
        }

        if !crate::ops::is_threadable(&instr) {
            if self.instructions == 0 {
                return Err("first instruction in path is not threadable");
            }
            return Ok(None);
        }

        let (fits, used) = self.jit.with_block(self.block_idx, |b| (b.remaining() >= crate::jit::JIT_FIT, b.index));
        if !fits {
            self.jit.note_overflow(used);
            return Err("block ran out of space mid-path");
        }

        // Reload the machine pointer into arg0, load the handler address
        // into r11 (an indirect call, since handler addresses aren't
        // guaranteed to sit within +/-2GiB of JIT memory in a PIE build),
        // pack this instruction's (dst, src, opsize, len) into arg1, and
        // call. The handler itself advances `m.ip` by `len`.
        self.jit.with_block(self.block_idx, |b| {
            let handler_addr = crate::ops::handler_address(instr.mnemonic);
            let args = crate::ops::pack_for_path(&instr);
            let mut code = cg::reload_machine_arg();
            code.extend_from_slice(&cg::set_reg(cg::ARG1, args));
            code.extend_from_slice(&cg::set_reg(0x0b, handler_addr)); // r11 = handler
            code.extend_from_slice(&[0x41, 0xff, 0xd3]); // call r11
            b.append(&code);
        });
        self.instructions += 1;
        self.stats.instructions_jitted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        Ok(Some(pc + instr.len as u64))
    }

    /// Pads to `JIT_ALIGN`, commits the block, and publishes the real
    /// entry hook for `start_pc`. Mirrors `FinishJit` + `CommitPath`.
    pub fn commit(mut self) -> PathOutcome {
        let (entry, bytes) = self.jit.with_block(self.block_idx, |b| {
            let entry = b.addr;
            b.append(&cg::block_epilogue());
            b.append(&cg::ret());
            let pad = (crate::jit::JIT_ALIGN - (b.index % crate::jit::JIT_ALIGN)) % crate::jit::JIT_ALIGN;
            if pad > 0 {
                b.append(&cg::trap());
                if pad > 1 {
                    b.append(&cg::nop(pad - 1));
                }
            }
            (entry, b.index as u64)
        });
        if let Err(JitError::Host(_)) = self.jit.commit(self.block_idx) {
            self.jit.abandon(self.block_idx);
            return PathOutcome::Abandoned { reason: "mprotect failed during commit" };
        }
        self.jit.hooks.set(self.start_pc, entry);
        self.stats.path_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.stats.path_longest_bytes.fetch_max(bytes, std::sync::atomic::Ordering::Relaxed);
        self.stats.path_longest_elements.fetch_max(self.instructions as u64, std::sync::atomic::Ordering::Relaxed);
        PathOutcome::Committed { host_entry: entry, guest_bytes: bytes, instructions: self.instructions }
    }

    pub fn abandon(self, reason: &'static str) -> PathOutcome {
        self.jit.hooks.invalidate(self.start_pc);
        self.jit.abandon(self.block_idx);
        self.stats.path_abandoned.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if reason == "block ran out of space mid-path" {
            self.stats.path_ooms.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        PathOutcome::Abandoned { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::Jit;

    #[test]
    fn start_stages_building_sentinel() {
        let jit = Jit::new(0x40_0000);
        let stats = Stats::default();
        let pb = PathBuilder::start(&jit, &stats, 0x1000).unwrap();
        assert_eq!(jit.hooks.get(0x1000), Some(BUILDING_SENTINEL));
        pb.abandon("test cleanup");
    }

    #[test]
    fn ret_ends_path_without_being_absorbed() {
        let jit = Jit::new(0x40_0000);
        let stats = Stats::default();
        let mut pb = PathBuilder::start(&jit, &stats, 0x1000).unwrap();
        // 48 01 c8 = add rax, rcx (threadable), then c3 = ret (ends the path,
        // not absorbed: `ret` isn't one of the threaded ALU forms).
        let next = pb.add_instruction(&[0x48, 0x01, 0xc8], 0x1000).unwrap();
        assert_eq!(next, Some(0x1003));
        let outcome = pb.add_instruction(&[0xc3], 0x1003).unwrap();
        assert!(outcome.is_none());
        match pb.commit() {
            PathOutcome::Committed { instructions, .. } => assert_eq!(instructions, 1),
            PathOutcome::Abandoned { reason } => panic!("unexpected abandon: {reason}"),
        }
    }

    #[test]
    fn leading_non_threadable_instruction_abandons() {
        let jit = Jit::new(0x40_0000);
        let stats = Stats::default();
        let mut pb = PathBuilder::start(&jit, &stats, 0x1000).unwrap();
        // c3 = ret, not threadable, and it's the first instruction: nothing
        // to thread, so starting a path here is pointless.
        let err = pb.add_instruction(&[0xc3], 0x1000).unwrap_err();
        assert_eq!(err, "first instruction in path is not threadable");
        pb.abandon(err);
    }

    #[test]
    fn unsupported_opcode_abandons() {
        let jit = Jit::new(0x40_0000);
        let stats = Stats::default();
        let mut pb = PathBuilder::start(&jit, &stats, 0x1000).unwrap();
        // 0f 0b = ud2, not modeled -> Unsupported
        let err = pb.add_instruction(&[0x0f, 0x0b], 0x1000).unwrap_err();
        assert_eq!(err, "unsupported opcode in path");
        pb.abandon(err);
        assert!(jit.hooks.get(0x1000).is_none());
    }
}
