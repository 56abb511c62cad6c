//! Opcode handlers (C5): the semantic implementation every decoded
//! instruction is dispatched to.
//!
//! The plain interpreter (`interpret`) handles every modeled mnemonic by
//! reading the decoded operands directly. The path builder additionally
//! needs, for a narrower subset of register-to-register forms, a handler
//! it can thread as a bare `extern "C" fn(*mut Machine, u64)` call site
//! (the packed `u64` plays the same role as blink's `rde`/`uimm0` args
//! baked in via `AppendJitSetReg` before `AppendJitCall`). Memory-operand
//! and immediate forms are intentionally left off the threadable list for
//! now: a real JIT would promote them once profiling shows the block is
//! hot enough to justify the extra code-generation complexity (blink's
//! S1/S2 split); this emulator has one JIT tier, so those forms simply
//! stay interpreted, which is a correctness-preserving, not a load-
//! bearing, simplification.

mod alu;
mod control;
mod data;

use crate::decode::{DecodedInstr, Mnemonic, OpSize, Operand};
use crate::machine::{GuestFault, Machine, RunError};

pub type OpResult = Result<(), RunError>;

pub fn read_operand(m: &mut Machine, instr: &DecodedInstr, op: Operand) -> Result<u64, RunError> {
    match op {
        Operand::Reg(r) => Ok(read_gpr(m, r.0, instr.opsize)),
        Operand::Imm(v) => Ok(v as u64),
        Operand::Mem(mem) => {
            let addr = effective_address(m, mem);
            load_sized(m, addr, instr.opsize)
        }
        Operand::Rel(v) => Ok((instr.rip as i64 + instr.len as i64 + v) as u64),
        Operand::None => Ok(0),
    }
}

pub fn write_operand(m: &mut Machine, instr: &DecodedInstr, op: Operand, value: u64) -> Result<(), RunError> {
    match op {
        Operand::Reg(r) => {
            write_gpr(m, r.0, instr.opsize, value);
            Ok(())
        }
        Operand::Mem(mem) => {
            let addr = effective_address(m, mem);
            store_sized(m, addr, instr.opsize, value)
        }
        _ => Ok(()),
    }
}

fn effective_address(m: &Machine, mem: crate::decode::MemOp) -> u64 {
    let mut addr = mem.disp as i64 as u64;
    if let Some(b) = mem.base {
        addr = addr.wrapping_add(read_gpr(m, b.0, OpSize::Qword));
    }
    if let Some(idx) = mem.index {
        addr = addr.wrapping_add(read_gpr(m, idx.0, OpSize::Qword) * mem.scale as u64);
    }
    if mem.rip_relative {
        addr = addr.wrapping_add(m.ip);
    }
    addr
}

fn load_sized(m: &Machine, addr: u64, size: OpSize) -> Result<u64, RunError> {
    let len = size as usize;
    let bytes = m.system.mem.read_slice(addr, len)?;
    let mut buf = [0u8; 8];
    buf[..len].copy_from_slice(&bytes);
    Ok(u64::from_le_bytes(buf))
}

fn store_sized(m: &mut Machine, addr: u64, size: OpSize, value: u64) -> Result<(), RunError> {
    let len = size as usize;
    m.write_guest(addr, &value.to_le_bytes()[..len])?;
    Ok(())
}

fn read_gpr(m: &Machine, idx: u8, size: OpSize) -> u64 {
    use crate::regs::Reg;
    let r: Reg = unsafe { std::mem::transmute(idx & 0x0f) };
    match size {
        OpSize::Byte => m.regs.get8_low(r) as u64,
        OpSize::Word => m.regs.get16(r) as u64,
        OpSize::Dword => m.regs.get32(r) as u64,
        OpSize::Qword => m.regs.get64(r),
    }
}

fn write_gpr(m: &mut Machine, idx: u8, size: OpSize, value: u64) {
    use crate::regs::Reg;
    let r: Reg = unsafe { std::mem::transmute(idx & 0x0f) };
    match size {
        OpSize::Byte => m.regs.set8_low(r, value as u8),
        OpSize::Word => m.regs.set16(r, value as u16),
        OpSize::Dword => m.regs.set32(r, value as u32),
        OpSize::Qword => m.regs.set64(r, value),
    }
}

pub fn interpret(m: &mut Machine, instr: &DecodedInstr) -> OpResult {
    match instr.mnemonic {
        Mnemonic::Add | Mnemonic::Sub | Mnemonic::And | Mnemonic::Or | Mnemonic::Xor
        | Mnemonic::Cmp | Mnemonic::Adc | Mnemonic::Sbb => alu::binary_op(m, instr),
        Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Neg | Mnemonic::Not => alu::unary_op(m, instr),
        Mnemonic::Test => alu::test_op(m, instr),
        Mnemonic::Xadd => alu::xadd(m, instr),
        Mnemonic::Cmpxchg => alu::cmpxchg(m, instr),
        Mnemonic::Xchg => alu::xchg(m, instr),
        Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar => alu::shift_op(m, instr),

        Mnemonic::Mov | Mnemonic::MovImm => data::mov(m, instr),
        Mnemonic::Lea => data::lea(m, instr),
        Mnemonic::Push => data::push(m, instr),
        Mnemonic::Pop => data::pop(m, instr),
        Mnemonic::Leave => data::leave(m),
        Mnemonic::Pushf => data::pushf(m),
        Mnemonic::Popf => data::popf(m),

        Mnemonic::Jmp => control::jmp(m, instr),
        Mnemonic::Jcc(cc) => control::jcc(m, instr, cc),
        Mnemonic::CallRel | Mnemonic::CallAbs => control::call(m, instr),
        Mnemonic::Ret => control::ret(m),
        Mnemonic::Nop => Ok(()),
        Mnemonic::Int3 => Err(RunError::Fault(GuestFault::Interrupt(3))),
        Mnemonic::Hlt => {
            m.halted = true;
            Ok(())
        }
        Mnemonic::Syscall => crate::syscall::dispatch(m),
        Mnemonic::Movzx | Mnemonic::Movsx | Mnemonic::Invalid | Mnemonic::Unsupported => {
            Err(RunError::Fault(GuestFault::InvalidOpcode))
        }
    }
}

/// True if `instr` is eligible to be threaded into compiled code by the
/// path builder: a register-to-register binary ALU op. Everything else
/// (memory operands, immediates, control flow, syscalls) is still fully
/// supported by `interpret` but is executed by falling out of the
/// compiled block back into the dispatch loop, the same boundary blink
/// draws between what `Jitter` knows how to emit and what it leaves to
/// `JitlessDispatch`.
pub fn is_threadable(instr: &DecodedInstr) -> bool {
    matches!(
        instr.mnemonic,
        Mnemonic::Add | Mnemonic::Sub | Mnemonic::And | Mnemonic::Or | Mnemonic::Xor | Mnemonic::Cmp
    ) && matches!(instr.operands[0], Operand::Reg(_))
        && matches!(instr.operands[1], Operand::Reg(_))
}

fn pack_args(dst: u8, src: u8, opsize: OpSize, oplen: u8) -> u64 {
    dst as u64 | ((src as u64) << 8) | ((opsize as u64) << 16) | ((oplen as u64) << 24)
}

fn unpack_args(bits: u64) -> (u8, u8, OpSize, u8) {
    let dst = (bits & 0xff) as u8;
    let src = ((bits >> 8) & 0xff) as u8;
    let opsize = match (bits >> 16) & 0xff {
        1 => OpSize::Byte,
        2 => OpSize::Word,
        4 => OpSize::Dword,
        _ => OpSize::Qword,
    };
    let oplen = ((bits >> 24) & 0xff) as u8;
    (dst, src, opsize, oplen)
}

/// Encodes the packed argument word the path builder should load before
/// calling this instruction's threaded handler, for the register-to-
/// register forms `is_threadable` accepts. Carries `instr.len` alongside
/// the operands so the threaded handler can advance `m.ip` itself instead
/// of the path builder needing to poke the field's raw offset from
/// hand-emitted machine code.
pub fn pack_for_path(instr: &DecodedInstr) -> u64 {
    let (Operand::Reg(dst), Operand::Reg(src)) = (instr.operands[0], instr.operands[1]) else {
        return 0;
    };
    pack_args(dst.0, src.0, instr.opsize, instr.len)
}

macro_rules! threaded_binop {
    ($name:ident, $op:ident) => {
        extern "C" fn $name(m: *mut Machine, args: u64) {
            let m = unsafe { &mut *m };
            let (dst, src, opsize, oplen) = unpack_args(args);
            alu::$op(m, dst, src, opsize);
            m.ip = m.ip.wrapping_add(oplen as u64);
        }
    };
}

threaded_binop!(thread_add, reg_add);
threaded_binop!(thread_sub, reg_sub);
threaded_binop!(thread_and, reg_and);
threaded_binop!(thread_or, reg_or);
threaded_binop!(thread_xor, reg_xor);
threaded_binop!(thread_cmp, reg_cmp);

/// Host address of the threaded handler for `mnemonic`. Only valid to
/// call when `is_threadable` returned true for the same instruction.
pub fn handler_address(mnemonic: Mnemonic) -> u64 {
    match mnemonic {
        Mnemonic::Add => thread_add as u64,
        Mnemonic::Sub => thread_sub as u64,
        Mnemonic::And => thread_and as u64,
        Mnemonic::Or => thread_or as u64,
        Mnemonic::Xor => thread_xor as u64,
        Mnemonic::Cmp => thread_cmp as u64,
        _ => {
            extern "C" fn unreachable_thunk(_m: *mut Machine, _args: u64) {
                unreachable!("handler_address called for a non-threadable mnemonic")
            }
            unreachable_thunk as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Register;

    #[test]
    fn threadable_detects_reg_reg_alu_only() {
        let mut instr = DecodedInstr {
            rip: 0,
            len: 3,
            mnemonic: Mnemonic::Add,
            opsize: OpSize::Qword,
            operands: [Operand::Reg(Register(0)), Operand::Reg(Register(1)), Operand::None],
            num_operands: 2,
            prefixes: Default::default(),
            is_branch: false,
            is_call: false,
            is_ret: false,
        };
        assert!(is_threadable(&instr));
        instr.operands[1] = Operand::Imm(5);
        assert!(!is_threadable(&instr));
    }

    #[test]
    fn mov_through_a_straddling_memory_operand_lands_on_both_pages() {
        let sys = crate::machine::System::new(0x40_0000, 0x40_1000, true);
        sys.mem
            .commit(0x1000, 2, crate::memory::PteFlags::WRITABLE | crate::memory::PteFlags::USER)
            .unwrap();
        let mut m = crate::machine::Machine::new(sys.clone(), 1, 0x40_0000);
        let straddle = 0x1000 + crate::memory::PAGE_SIZE - 4;
        m.regs.set64(crate::regs::Reg::Rax, 0x0807_0605_0403_0201);

        let instr = DecodedInstr {
            rip: 0x40_0000,
            len: 7,
            mnemonic: Mnemonic::Mov,
            opsize: OpSize::Qword,
            operands: [
                Operand::Mem(crate::decode::MemOp { base: None, index: None, scale: 1, disp: straddle as i32, rip_relative: false, segment: Default::default() }),
                Operand::Reg(Register(0)),
                Operand::None,
            ],
            num_operands: 2,
            prefixes: Default::default(),
            is_branch: false,
            is_call: false,
            is_ret: false,
        };
        data::mov(&mut m, &instr).unwrap();

        assert_eq!(sys.mem.read_slice(straddle, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(sys.mem.read_slice(straddle + 4, 4).unwrap(), vec![5, 6, 7, 8]);
    }

    #[test]
    fn pack_unpack_round_trips() {
        let bits = pack_args(3, 7, OpSize::Dword, 4);
        assert_eq!(unpack_args(bits), (3, 7, OpSize::Dword, 4));
    }

    #[test]
    fn threaded_add_advances_ip_by_instruction_length() {
        let sys = crate::machine::System::new(0x40_0000, 0x40_1000, true);
        let mut m = crate::machine::Machine::new(sys, 1, 0x40_0000);
        m.regs.set64(crate::regs::Reg::Rax, 2);
        m.regs.set64(crate::regs::Reg::Rcx, 3);
        m.ip = 0x40_0000;
        let instr = DecodedInstr {
            rip: 0x40_0000,
            len: 3,
            mnemonic: Mnemonic::Add,
            opsize: OpSize::Qword,
            operands: [Operand::Reg(Register(0)), Operand::Reg(Register(1)), Operand::None],
            num_operands: 2,
            prefixes: Default::default(),
            is_branch: false,
            is_call: false,
            is_ret: false,
        };
        let args = pack_for_path(&instr);
        let handler: extern "C" fn(*mut Machine, u64) = unsafe { std::mem::transmute(handler_address(Mnemonic::Add)) };
        handler(&mut m as *mut Machine, args);
        assert_eq!(m.regs.get64(crate::regs::Reg::Rax), 5);
        assert_eq!(m.ip, 0x40_0003);
    }

    #[test]
    fn pushf_then_popf_round_trips_flags_through_guest_memory() {
        let sys = crate::machine::System::new(0x40_0000, 0x40_1000, true);
        sys.mem.commit(0x40_0000, 1, crate::memory::PteFlags::WRITABLE | crate::memory::PteFlags::USER).unwrap();
        let mut m = crate::machine::Machine::new(sys, 1, 0x40_0000);
        m.regs.set64(crate::regs::Reg::Rsp, 0x40_0800);

        let add = DecodedInstr {
            rip: 0x40_0000,
            len: 3,
            mnemonic: Mnemonic::Add,
            opsize: OpSize::Qword,
            operands: [Operand::Reg(Register(0)), Operand::Reg(Register(1)), Operand::None],
            num_operands: 2,
            prefixes: Default::default(),
            is_branch: false,
            is_call: false,
            is_ret: false,
        };
        m.regs.set64(crate::regs::Reg::Rax, 0);
        m.regs.set64(crate::regs::Reg::Rcx, 0);
        interpret(&mut m, &add).unwrap(); // 0 + 0 -> ZF set
        let flags_after_add = m.regs.flags.as_u64();

        let pushf = DecodedInstr {
            rip: 0x40_0003,
            len: 1,
            mnemonic: Mnemonic::Pushf,
            opsize: OpSize::Qword,
            operands: [Operand::None; 3],
            num_operands: 0,
            prefixes: Default::default(),
            is_branch: false,
            is_call: false,
            is_ret: false,
        };
        interpret(&mut m, &pushf).unwrap();

        // Clobber flags, then pop the pushed word back to restore them.
        m.regs.flags.load_u64(0);
        let popf = DecodedInstr { mnemonic: Mnemonic::Popf, ..pushf };
        interpret(&mut m, &popf).unwrap();
        assert_eq!(m.regs.flags.as_u64(), flags_after_add);
    }
}
