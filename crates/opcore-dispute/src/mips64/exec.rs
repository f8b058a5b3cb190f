//! One MIPS64 instruction. Word operations keep their 32-bit meaning and sign-extend the
//! result; the doubleword forms work on the full register.

use super::{memory::MemoryAccess, syscall, State};
use crate::mips::{self, exec::PreimageReader, VmError};

/// Bytes a step wrote to an output fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Output {
    pub fd: u64,
    pub addr: u64,
    pub len: u64,
}

pub const fn sign_extend(value: u64, bits: u32) -> u64 {
    let mask = (1u64 << bits) - 1;
    let value = value & mask;
    if (value >> (bits - 1)) & 1 == 1 {
        value | !mask
    } else {
        value
    }
}

const fn sext32(value: u32) -> u64 {
    value as i32 as i64 as u64
}

/// Loads and stores address memory through an aligned doubleword.
const fn is_load_store(opcode: u32) -> bool {
    opcode >= 0x20 || opcode == 0x1A || opcode == 0x1B
}

const fn is_store(opcode: u32) -> bool {
    opcode >= 0x28 && !matches!(opcode, 0x30 | 0x34 | 0x37)
}

/// Execute the instruction at `state.pc`.
pub fn step<M: MemoryAccess, P: PreimageReader>(
    s: &mut State,
    mem: &mut M,
    preimages: &mut P,
) -> Result<Option<Output>, VmError> {
    if s.exited {
        return Ok(None);
    }
    s.step += 1;

    let insn = mem.fetch_instruction(s.pc)?;
    let opcode = insn >> 26;

    // j, jal
    if opcode == 2 || opcode == 3 {
        let link = if opcode == 3 { 31 } else { 0 };
        let target = (s.next_pc & !0x0FFF_FFFF) | (u64::from(insn & 0x03FF_FFFF) << 2);
        handle_jump(s, link, target)?;
        return Ok(None);
    }

    let rs_reg = ((insn >> 21) & 0x1F) as usize;
    let rt_reg = ((insn >> 16) & 0x1F) as usize;
    let mut rs = s.registers[rs_reg];
    let mut rd_reg = rt_reg;
    let mut rt = 0;
    let load_store = is_load_store(opcode);
    if opcode == 0 || opcode == 0x1C {
        rt = s.registers[rt_reg];
        rd_reg = ((insn >> 11) & 0x1F) as usize;
    } else if load_store {
        // stores and the merging loads read the old register
        if opcode >= 0x28 || matches!(opcode, 0x1A | 0x1B | 0x22 | 0x26) {
            rt = s.registers[rt_reg];
        }
    } else if matches!(opcode, 0xC..=0xE) {
        rt = u64::from(insn & 0xFFFF);
    } else {
        rt = sign_extend(u64::from(insn & 0xFFFF), 16);
    }

    if (4..8).contains(&opcode) || opcode == 1 {
        handle_branch(s, opcode, insn, rt_reg, rs)?;
        return Ok(None);
    }

    let mut store_addr = None;
    let mut mem_dword = 0;
    if load_store {
        rs = rs.wrapping_add(sign_extend(u64::from(insn & 0xFFFF), 16));
        let addr = rs & !7;
        mem_dword = mem.read_doubleword(addr)?;
        if is_store(opcode) {
            store_addr = Some(addr);
            rd_reg = 0;
        }
    }

    let fun = insn & 0x3F;
    if opcode == 0 {
        match fun {
            0x08 | 0x09 => {
                let link = if fun == 0x09 { rd_reg } else { 0 };
                handle_jump(s, link, rs)?;
                return Ok(None);
            }
            0x0A => {
                handle_rd(s, rd_reg, rs, rt == 0);
                return Ok(None);
            }
            0x0B => {
                handle_rd(s, rd_reg, rs, rt != 0);
                return Ok(None);
            }
            0x0C => return syscall::handle(s, mem, preimages),
            0x10..=0x13 | 0x18..=0x1F => {
                handle_hi_lo(s, fun, rs, rt, rd_reg)?;
                return Ok(None);
            }
            _ => {}
        }
    }

    let value = execute(insn, rs, rt, mem_dword)?;

    // sc and scd always succeed
    if (opcode == 0x38 || opcode == 0x3C) && rt_reg != 0 {
        s.registers[rt_reg] = 1;
    }
    if let Some(addr) = store_addr {
        mem.write_doubleword(addr, value)?;
    }
    handle_rd(s, rd_reg, value, true);
    Ok(None)
}

fn handle_jump(s: &mut State, link: usize, target: u64) -> Result<(), VmError> {
    if s.next_pc != s.pc.wrapping_add(4) {
        return Err(VmError::JumpInDelaySlot(s.pc));
    }
    let prev = s.pc;
    s.pc = s.next_pc;
    s.next_pc = target;
    if link != 0 {
        s.registers[link] = prev.wrapping_add(8);
    }
    Ok(())
}

fn handle_branch(s: &mut State, opcode: u32, insn: u32, rt_reg: usize, rs: u64) -> Result<(), VmError> {
    if s.next_pc != s.pc.wrapping_add(4) {
        return Err(VmError::BranchInDelaySlot(s.pc));
    }
    let taken = match opcode {
        4 => rs == s.registers[rt_reg],
        5 => rs != s.registers[rt_reg],
        6 => (rs as i64) <= 0,
        7 => (rs as i64) > 0,
        _ => match (insn >> 16) & 0x1F {
            0x00 => (rs as i64) < 0,
            0x01 => (rs as i64) >= 0,
            0x10 => {
                s.registers[31] = s.pc.wrapping_add(8);
                (rs as i64) < 0
            }
            0x11 => {
                s.registers[31] = s.pc.wrapping_add(8);
                (rs as i64) >= 0
            }
            _ => return Err(VmError::InvalidInstruction(insn)),
        },
    };
    let prev = s.pc;
    s.pc = s.next_pc;
    s.next_pc = if taken {
        prev.wrapping_add(4).wrapping_add(sign_extend(u64::from(insn & 0xFFFF), 16) << 2)
    } else {
        s.next_pc.wrapping_add(4)
    };
    Ok(())
}

fn handle_hi_lo(s: &mut State, fun: u32, rs: u64, rt: u64, rd_reg: usize) -> Result<(), VmError> {
    let mut value = 0;
    match fun {
        0x10 => value = s.hi,
        0x11 => s.hi = rs,
        0x12 => value = s.lo,
        0x13 => s.lo = rs,
        // mult, multu
        0x18 => {
            let product = (rs as i32 as i64).wrapping_mul(rt as i32 as i64) as u64;
            s.hi = sext32((product >> 32) as u32);
            s.lo = sext32(product as u32);
        }
        0x19 => {
            let product = u64::from(rs as u32) * u64::from(rt as u32);
            s.hi = sext32((product >> 32) as u32);
            s.lo = sext32(product as u32);
        }
        // div, divu
        0x1A | 0x1B if rt as u32 == 0 => return Err(VmError::DivisionByZero(s.pc)),
        0x1A => {
            s.hi = sext32((rs as i32).wrapping_rem(rt as i32) as u32);
            s.lo = sext32((rs as i32).wrapping_div(rt as i32) as u32);
        }
        0x1B => {
            s.hi = sext32(rs as u32 % rt as u32);
            s.lo = sext32(rs as u32 / rt as u32);
        }
        // dmult, dmultu
        0x1C => {
            let product = (rs as i64 as i128).wrapping_mul(rt as i64 as i128) as u128;
            s.hi = (product >> 64) as u64;
            s.lo = product as u64;
        }
        0x1D => {
            let product = u128::from(rs) * u128::from(rt);
            s.hi = (product >> 64) as u64;
            s.lo = product as u64;
        }
        // ddiv, ddivu
        0x1E | 0x1F if rt == 0 => return Err(VmError::DivisionByZero(s.pc)),
        0x1E => {
            s.hi = (rs as i64).wrapping_rem(rt as i64) as u64;
            s.lo = (rs as i64).wrapping_div(rt as i64) as u64;
        }
        0x1F => {
            s.hi = rs % rt;
            s.lo = rs / rt;
        }
        _ => {}
    }
    if rd_reg != 0 {
        s.registers[rd_reg] = value;
    }
    s.pc = s.next_pc;
    s.next_pc = s.next_pc.wrapping_add(4);
    Ok(())
}

fn handle_rd(s: &mut State, rd_reg: usize, value: u64, condition: bool) {
    if condition && rd_reg != 0 {
        s.registers[rd_reg] = value;
    }
    s.pc = s.next_pc;
    s.next_pc = s.next_pc.wrapping_add(4);
}

/// Shift of the word holding `addr` within its doubleword.
const fn word_shift(addr: u64) -> u64 {
    32 - (addr & 4) * 8
}

const fn word_of(dword: u64, addr: u64) -> u32 {
    (dword >> word_shift(addr)) as u32
}

const fn with_word(dword: u64, addr: u64, word: u32) -> u64 {
    let shift = word_shift(addr);
    (dword & !(0xFFFF_FFFF << shift)) | ((word as u64) << shift)
}

/// ALU result, loaded value or merged store doubleword.
pub fn execute(insn: u32, rs: u64, rt: u64, mem: u64) -> Result<u64, VmError> {
    let opcode = insn >> 26;
    let invalid = || VmError::InvalidInstruction(insn);

    if opcode == 0 || (8..0xF).contains(&opcode) || opcode == 0x18 || opcode == 0x19 {
        // immediate ALU ops share the R-type functs
        let fun = match opcode {
            0 => insn & 0x3F,
            8 => 0x20,
            9 => 0x21,
            0xA => 0x2A,
            0xB => 0x2B,
            0xC => 0x24,
            0xD => 0x25,
            0xE => 0x26,
            0x18 => 0x2C,
            _ => 0x2D,
        };
        let shamt = (insn >> 6) & 0x1F;
        return Ok(match fun {
            0x00 => sext32((rt as u32) << shamt),
            0x02 => sext32((rt as u32) >> shamt),
            0x03 => sext32(((rt as i32) >> shamt) as u32),
            0x04 => sext32((rt as u32) << (rs & 0x1F)),
            0x06 => sext32((rt as u32) >> (rs & 0x1F)),
            0x07 => sext32(((rt as i32) >> (rs & 0x1F)) as u32),
            // sync
            0x0F => rs,
            0x14 => rt << (rs & 0x3F),
            0x16 => rt >> (rs & 0x3F),
            0x17 => ((rt as i64) >> (rs & 0x3F)) as u64,
            0x20 | 0x21 => sext32((rs as u32).wrapping_add(rt as u32)),
            0x22 | 0x23 => sext32((rs as u32).wrapping_sub(rt as u32)),
            0x24 => rs & rt,
            0x25 => rs | rt,
            0x26 => rs ^ rt,
            0x27 => !(rs | rt),
            0x2A => ((rs as i64) < (rt as i64)) as u64,
            0x2B => (rs < rt) as u64,
            0x2C | 0x2D => rs.wrapping_add(rt),
            0x2E | 0x2F => rs.wrapping_sub(rt),
            0x38 => rt << shamt,
            0x3A => rt >> shamt,
            0x3B => ((rt as i64) >> shamt) as u64,
            0x3C => rt << (shamt + 32),
            0x3E => rt >> (shamt + 32),
            0x3F => ((rt as i64) >> (shamt + 32)) as u64,
            _ => return Err(invalid()),
        });
    }

    let byte_shift = 56 - (rs & 7) * 8;
    let half_shift = 48 - (rs & 6) * 8;
    Ok(match opcode {
        // lui
        0x0F => sext32((rt as u32) << 16),
        0x1C => match insn & 0x3F {
            0x02 => sext32((rs as i32).wrapping_mul(rt as i32) as u32),
            0x20 => u64::from((rs as u32).leading_zeros()),
            0x21 => u64::from((rs as u32).leading_ones()),
            0x24 => u64::from(rs.leading_zeros()),
            0x25 => u64::from(rs.leading_ones()),
            _ => return Err(invalid()),
        },
        // ldl
        0x1A => {
            let shift = (rs & 7) * 8;
            (rt & !(u64::MAX << shift)) | (mem << shift)
        }
        // ldr
        0x1B => (rt & !(u64::MAX >> byte_shift)) | (mem >> byte_shift),
        // lb
        0x20 => sign_extend((mem >> byte_shift) & 0xFF, 8),
        // lh
        0x21 => sign_extend((mem >> half_shift) & 0xFFFF, 16),
        // lwl, lw, lwr, ll: the 32-bit loads on the addressed word
        0x22 | 0x23 | 0x26 | 0x30 => {
            sext32(mips::exec::execute(insn, rs as u32, rt as u32, word_of(mem, rs))?)
        }
        // lbu
        0x24 => (mem >> byte_shift) & 0xFF,
        // lhu
        0x25 => (mem >> half_shift) & 0xFFFF,
        // lwu
        0x27 => u64::from(word_of(mem, rs)),
        // sb
        0x28 => (mem & !(0xFF << byte_shift)) | ((rt & 0xFF) << byte_shift),
        // sh
        0x29 => (mem & !(0xFFFF << half_shift)) | ((rt & 0xFFFF) << half_shift),
        // swl, sw, swr, sc
        0x2A | 0x2B | 0x2E | 0x38 => {
            let word = mips::exec::execute(insn, rs as u32, rt as u32, word_of(mem, rs))?;
            with_word(mem, rs, word)
        }
        // sdl
        0x2C => {
            let shift = (rs & 7) * 8;
            (mem & !(u64::MAX >> shift)) | (rt >> shift)
        }
        // sdr
        0x2D => (mem & !(u64::MAX << byte_shift)) | (rt << byte_shift),
        // lld, ld
        0x34 | 0x37 => mem,
        // scd, sd
        0x3C | 0x3F => rt,
        _ => return Err(invalid()),
    })
}
