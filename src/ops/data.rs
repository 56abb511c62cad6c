//! Data movement: mov, lea, push, pop, leave.

use crate::decode::{DecodedInstr, Operand};
use crate::machine::Machine;
use crate::regs::Reg;

use super::{read_operand, write_operand};

pub fn mov(m: &mut Machine, instr: &DecodedInstr) -> super::OpResult {
    let v = read_operand(m, instr, instr.operands[1])?;
    write_operand(m, instr, instr.operands[0], v)
}

pub fn lea(m: &mut Machine, instr: &DecodedInstr) -> super::OpResult {
    let Operand::Mem(mem) = instr.operands[1] else {
        return Ok(());
    };
    let addr = super::effective_address(m, mem);
    write_operand(m, instr, instr.operands[0], addr)
}

fn push_qword(m: &mut Machine, value: u64) -> super::OpResult {
    let rsp = m.regs.get64(Reg::Rsp).wrapping_sub(8);
    m.regs.set64(Reg::Rsp, rsp);
    m.write_guest(rsp, &value.to_le_bytes())?;
    Ok(())
}

fn pop_qword(m: &mut Machine) -> Result<u64, crate::machine::RunError> {
    let rsp = m.regs.get64(Reg::Rsp);
    let bytes = m.system.mem.read_slice(rsp, 8)?;
    m.regs.set64(Reg::Rsp, rsp.wrapping_add(8));
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

pub fn push(m: &mut Machine, instr: &DecodedInstr) -> super::OpResult {
    let v = read_operand(m, instr, instr.operands[0])?;
    push_qword(m, v)
}

pub fn pop(m: &mut Machine, instr: &DecodedInstr) -> super::OpResult {
    let v = pop_qword(m)?;
    write_operand(m, instr, instr.operands[0], v)
}

pub fn leave(m: &mut Machine) -> super::OpResult {
    let rbp = m.regs.get64(Reg::Rbp);
    m.regs.set64(Reg::Rsp, rbp);
    let new_rbp = pop_qword(m)?;
    m.regs.set64(Reg::Rbp, new_rbp);
    Ok(())
}

pub fn pushf(m: &mut Machine) -> super::OpResult {
    push_qword(m, m.regs.flags.as_u64())
}

pub fn popf(m: &mut Machine) -> super::OpResult {
    let v = pop_qword(m)?;
    m.regs.flags.load_u64(v);
    Ok(())
}
