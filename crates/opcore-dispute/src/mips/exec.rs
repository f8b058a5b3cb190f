//! One MIPS32 instruction: decode, execute and advance the program counter.
//!
//! Shared by the full VM and the proof-backed verifier, which differ only in how memory and
//! preimages are reached.

use alloy_primitives::B256;

use super::{memory::MemoryAccess, syscall, State, VmError};

/// Source of preimage bytes for the `read` syscall.
pub trait PreimageReader {
    /// Up to 32 bytes of `len(8, BE) ‖ preimage` at `offset`, and how many are real.
    fn read_preimage(&mut self, key: B256, offset: u64) -> Result<([u8; 32], usize), VmError>;
}

/// Bytes a step wrote to an output fd. Only the full VM has the memory to read them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Output {
    pub fd: u32,
    pub addr: u32,
    pub len: u32,
}

pub const fn sign_extend(value: u32, bits: u32) -> u32 {
    let mask = (1u32 << bits) - 1;
    let value = value & mask;
    if (value >> (bits - 1)) & 1 == 1 {
        value | !mask
    } else {
        value
    }
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
        let target = (s.next_pc & 0xF000_0000) | ((insn & 0x03FF_FFFF) << 2);
        handle_jump(s, link, target)?;
        return Ok(None);
    }

    let rs_reg = ((insn >> 21) & 0x1F) as usize;
    let rt_reg = ((insn >> 16) & 0x1F) as usize;
    let mut rs = s.registers[rs_reg];
    let mut rd_reg = rt_reg;
    let mut rt = 0;
    if opcode == 0 || opcode == 0x1C {
        rt = s.registers[rt_reg];
        rd_reg = ((insn >> 11) & 0x1F) as usize;
    } else if opcode < 0x20 {
        rt = if matches!(opcode, 0xC..=0xE) { insn & 0xFFFF } else { sign_extend(insn & 0xFFFF, 16) };
    } else if opcode >= 0x28 || opcode == 0x22 || opcode == 0x26 {
        rt = s.registers[rt_reg];
    }

    if (4..8).contains(&opcode) || opcode == 1 {
        handle_branch(s, opcode, insn, rt_reg, rs)?;
        return Ok(None);
    }

    let mut store_addr = None;
    let mut mem_word = 0;
    if opcode >= 0x20 {
        rs = rs.wrapping_add(sign_extend(insn & 0xFFFF, 16));
        let addr = rs & !3;
        mem_word = mem.read_word(addr)?;
        if opcode >= 0x28 && opcode != 0x30 {
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
            0x10..=0x13 | 0x18..=0x1B => {
                handle_hi_lo(s, fun, rs, rt, rd_reg)?;
                return Ok(None);
            }
            _ => {}
        }
    }

    let value = execute(insn, rs, rt, mem_word)?;

    // sc always succeeds
    if opcode == 0x38 && rt_reg != 0 {
        s.registers[rt_reg] = 1;
    }
    if let Some(addr) = store_addr {
        mem.write_word(addr, value)?;
    }
    handle_rd(s, rd_reg, value, true);
    Ok(None)
}

fn handle_jump(s: &mut State, link: usize, target: u32) -> Result<(), VmError> {
    if s.next_pc != s.pc.wrapping_add(4) {
        return Err(VmError::JumpInDelaySlot(s.pc.into()));
    }
    let prev = s.pc;
    s.pc = s.next_pc;
    s.next_pc = target;
    if link != 0 {
        s.registers[link] = prev.wrapping_add(8);
    }
    Ok(())
}

fn handle_branch(s: &mut State, opcode: u32, insn: u32, rt_reg: usize, rs: u32) -> Result<(), VmError> {
    if s.next_pc != s.pc.wrapping_add(4) {
        return Err(VmError::BranchInDelaySlot(s.pc.into()));
    }
    let taken = match opcode {
        4 => rs == s.registers[rt_reg],
        5 => rs != s.registers[rt_reg],
        6 => (rs as i32) <= 0,
        7 => (rs as i32) > 0,
        _ => match (insn >> 16) & 0x1F {
            0x00 => (rs as i32) < 0,
            0x01 => (rs as i32) >= 0,
            0x10 => {
                s.registers[31] = s.pc.wrapping_add(8);
                (rs as i32) < 0
            }
            0x11 => {
                s.registers[31] = s.pc.wrapping_add(8);
                (rs as i32) >= 0
            }
            _ => return Err(VmError::InvalidInstruction(insn)),
        },
    };
    let prev = s.pc;
    s.pc = s.next_pc;
    s.next_pc = if taken {
        prev.wrapping_add(4).wrapping_add(sign_extend(insn & 0xFFFF, 16) << 2)
    } else {
        s.next_pc.wrapping_add(4)
    };
    Ok(())
}

fn handle_hi_lo(s: &mut State, fun: u32, rs: u32, rt: u32, rd_reg: usize) -> Result<(), VmError> {
    let mut value = 0;
    match fun {
        0x10 => value = s.hi,
        0x11 => s.hi = rs,
        0x12 => value = s.lo,
        0x13 => s.lo = rs,
        0x18 => {
            let product = (rs as i32 as i64).wrapping_mul(rt as i32 as i64) as u64;
            s.hi = (product >> 32) as u32;
            s.lo = product as u32;
        }
        0x19 => {
            let product = rs as u64 * rt as u64;
            s.hi = (product >> 32) as u32;
            s.lo = product as u32;
        }
        0x1A => {
            if rt == 0 {
                return Err(VmError::DivisionByZero(s.pc.into()));
            }
            s.hi = (rs as i32).wrapping_rem(rt as i32) as u32;
            s.lo = (rs as i32).wrapping_div(rt as i32) as u32;
        }
        0x1B => {
            if rt == 0 {
                return Err(VmError::DivisionByZero(s.pc.into()));
            }
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

fn handle_rd(s: &mut State, rd_reg: usize, value: u32, condition: bool) {
    if condition && rd_reg != 0 {
        s.registers[rd_reg] = value;
    }
    s.pc = s.next_pc;
    s.next_pc = s.next_pc.wrapping_add(4);
}

/// ALU result, loaded value or merged store word.
pub fn execute(insn: u32, rs: u32, rt: u32, mem: u32) -> Result<u32, VmError> {
    let opcode = insn >> 26;
    let invalid = || VmError::InvalidInstruction(insn);

    if opcode == 0 || (8..0xF).contains(&opcode) {
        // immediate ALU ops share the R-type functs
        let fun = match opcode {
            0 => insn & 0x3F,
            8 => 0x20,
            9 => 0x21,
            0xA => 0x2A,
            0xB => 0x2B,
            0xC => 0x24,
            0xD => 0x25,
            _ => 0x26,
        };
        let shamt = (insn >> 6) & 0x1F;
        return Ok(match fun {
            0x00 => rt << shamt,
            0x02 => rt >> shamt,
            0x03 => ((rt as i32) >> shamt) as u32,
            0x04 => rt << (rs & 0x1F),
            0x06 => rt >> (rs & 0x1F),
            0x07 => ((rt as i32) >> (rs & 0x1F)) as u32,
            // sync
            0x0F => rs,
            0x20 | 0x21 => rs.wrapping_add(rt),
            0x22 | 0x23 => rs.wrapping_sub(rt),
            0x24 => rs & rt,
            0x25 => rs | rt,
            0x26 => rs ^ rt,
            0x27 => !(rs | rt),
            0x2A => ((rs as i32) < (rt as i32)) as u32,
            0x2B => (rs < rt) as u32,
            _ => return Err(invalid()),
        });
    }

    Ok(match opcode {
        // lui
        0x0F => rt << 16,
        0x1C => match insn & 0x3F {
            0x02 => (rs as i32).wrapping_mul(rt as i32) as u32,
            0x20 => rs.leading_zeros(),
            0x21 => rs.leading_ones(),
            _ => return Err(invalid()),
        },
        // lb
        0x20 => sign_extend((mem >> (24 - (rs & 3) * 8)) & 0xFF, 8),
        // lh
        0x21 => sign_extend((mem >> (16 - (rs & 2) * 8)) & 0xFFFF, 16),
        // lwl
        0x22 => {
            let shift = (rs & 3) * 8;
            (rt & !(u32::MAX << shift)) | (mem << shift)
        }
        // lw, ll
        0x23 | 0x30 => mem,
        // lbu
        0x24 => (mem >> (24 - (rs & 3) * 8)) & 0xFF,
        // lhu
        0x25 => (mem >> (16 - (rs & 2) * 8)) & 0xFFFF,
        // lwr
        0x26 => {
            let shift = 24 - (rs & 3) * 8;
            (rt & !(u32::MAX >> shift)) | (mem >> shift)
        }
        // sb
        0x28 => {
            let shift = 24 - (rs & 3) * 8;
            (mem & !(0xFF << shift)) | ((rt & 0xFF) << shift)
        }
        // sh
        0x29 => {
            let shift = 16 - (rs & 2) * 8;
            (mem & !(0xFFFF << shift)) | ((rt & 0xFFFF) << shift)
        }
        // swl
        0x2A => {
            let shift = (rs & 3) * 8;
            (mem & !(u32::MAX >> shift)) | (rt >> shift)
        }
        // sw, sc
        0x2B | 0x38 => rt,
        // swr
        0x2E => {
            let shift = 24 - (rs & 3) * 8;
            (mem & !(u32::MAX << shift)) | (rt << shift)
        }
        _ => return Err(invalid()),
    })
}
