//! Control flow: unconditional/conditional jumps, calls, and returns.
//!
//! Condition codes follow the standard x86 Jcc encoding (the low nibble of
//! the two-byte 0x0F 0x8x opcode / one-byte 0x7x opcode), tested against
//! the lazily materialized flags from `regs.rs`.

use crate::decode::{DecodedInstr, Operand};
use crate::machine::Machine;
use crate::regs::{FlagBits, Reg};

fn branch_target(instr: &DecodedInstr, operand: Operand) -> u64 {
    match operand {
        Operand::Rel(rel) => (instr.rip as i64 + instr.len as i64 + rel) as u64,
        Operand::Imm(v) => v as u64,
        _ => instr.rip + instr.len as u64,
    }
}

pub fn jmp(m: &mut Machine, instr: &DecodedInstr) -> super::OpResult {
    let target = if let Operand::Mem(mem) = instr.operands[0] {
        let addr = super::effective_address(m, mem);
        super::read_operand(m, instr, Operand::Mem(mem)).unwrap_or(addr)
    } else if let Operand::Reg(r) = instr.operands[0] {
        super::read_operand(m, instr, Operand::Reg(r))?
    } else {
        branch_target(instr, instr.operands[0])
    };
    m.ip = target;
    Ok(())
}

/// Tests condition code `cc` (the x86 Jcc nibble) against the lazily
/// derived flags and either branches or falls through.
pub fn jcc(m: &mut Machine, instr: &DecodedInstr, cc: u8) -> super::OpResult {
    let taken = evaluate_cc(m, cc);
    m.ip = if taken { branch_target(instr, instr.operands[0]) } else { instr.rip + instr.len as u64 };
    Ok(())
}

fn evaluate_cc(m: &mut Machine, cc: u8) -> bool {
    let f = &mut m.regs.flags;
    match cc {
        0x0 => f.test(FlagBits::OF),
        0x1 => !f.test(FlagBits::OF),
        0x2 => f.test(FlagBits::CF),
        0x3 => !f.test(FlagBits::CF),
        0x4 => f.test(FlagBits::ZF),
        0x5 => !f.test(FlagBits::ZF),
        0x6 => f.test(FlagBits::CF) || f.test(FlagBits::ZF),
        0x7 => !f.test(FlagBits::CF) && !f.test(FlagBits::ZF),
        0x8 => f.test(FlagBits::SF),
        0x9 => !f.test(FlagBits::SF),
        0xA => f.test(FlagBits::PF),
        0xB => !f.test(FlagBits::PF),
        0xC => f.test(FlagBits::SF) != f.test(FlagBits::OF),
        0xD => f.test(FlagBits::SF) == f.test(FlagBits::OF),
        0xE => f.test(FlagBits::ZF) || (f.test(FlagBits::SF) != f.test(FlagBits::OF)),
        0xF => !f.test(FlagBits::ZF) && (f.test(FlagBits::SF) == f.test(FlagBits::OF)),
        _ => false,
    }
}

pub fn call(m: &mut Machine, instr: &DecodedInstr) -> super::OpResult {
    let target = if let Operand::Mem(mem) = instr.operands[0] {
        super::read_operand(m, instr, Operand::Mem(mem))?
    } else if let Operand::Reg(r) = instr.operands[0] {
        super::read_operand(m, instr, Operand::Reg(r))?
    } else {
        branch_target(instr, instr.operands[0])
    };
    let return_addr = instr.rip + instr.len as u64;
    let rsp = m.regs.get64(Reg::Rsp).wrapping_sub(8);
    m.regs.set64(Reg::Rsp, rsp);
    m.write_guest(rsp, &return_addr.to_le_bytes())?;
    m.ip = target;
    Ok(())
}

pub fn ret(m: &mut Machine) -> super::OpResult {
    let rsp = m.regs.get64(Reg::Rsp);
    let bytes = m.system.mem.read_slice(rsp, 8)?;
    m.regs.set64(Reg::Rsp, rsp.wrapping_add(8));
    m.ip = u64::from_le_bytes(bytes.try_into().unwrap());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{Mnemonic, OpSize};
    use crate::machine::System;

    fn test_machine() -> Machine {
        let sys = System::new(0x40_0000, 0x40_1000, true);
        Machine::new(sys, 1, 0x40_0000)
    }

    #[test]
    fn jcc_ze_follows_zero_flag() {
        let mut m = test_machine();
        m.regs.flags.set_lazy(crate::regs::LazyFlags {
            op: crate::regs::AluOp::Sub,
            width: crate::regs::Width::Qword,
            arg1: 1,
            arg2: 1,
            result: 0,
            carry_in: false,
        });
        let instr = DecodedInstr {
            rip: 0x1000,
            len: 2,
            mnemonic: Mnemonic::Jcc(4),
            opsize: OpSize::Qword,
            operands: [Operand::Rel(0x10), Operand::None, Operand::None],
            num_operands: 1,
            prefixes: Default::default(),
            is_branch: true,
            is_call: false,
            is_ret: false,
        };
        jcc(&mut m, &instr, 4).unwrap();
        assert_eq!(m.ip, 0x1000 + 2 + 0x10);
    }
}
