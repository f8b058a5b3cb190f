//! The n64 syscall numbers. File descriptors and error numbers are the 32-bit ones.

use alloy_primitives::B256;

use super::{
    exec::Output,
    memory::{MemoryAccess, PAGE_ADDR_MASK},
    State,
};
use crate::mips::{
    exec::PreimageReader,
    memory::PAGE_SIZE,
    syscall::{
        FD_HINT_READ, FD_HINT_WRITE, FD_PREIMAGE_READ, FD_PREIMAGE_WRITE, FD_STDERR, FD_STDIN,
        FD_STDOUT,
    },
    VmError,
};

pub const SYS_READ: u64 = 5000;
pub const SYS_WRITE: u64 = 5001;
pub const SYS_OPEN: u64 = 5002;
pub const SYS_MMAP: u64 = 5009;
pub const SYS_BRK: u64 = 5012;
pub const SYS_CLONE: u64 = 5055;
pub const SYS_FCNTL: u64 = 5070;
pub const SYS_EXIT_GROUP: u64 = 5205;

pub const EBADF: u64 = crate::mips::syscall::EBADF as u64;
pub const EINVAL: u64 = crate::mips::syscall::EINVAL as u64;

/// Fixed program break.
pub const BRK_START: u64 = 0x4000_0000_0000;

const F_GETFL: u64 = 3;

pub(super) fn handle<M: MemoryAccess, P: PreimageReader>(
    s: &mut State,
    mem: &mut M,
    preimages: &mut P,
) -> Result<Option<Output>, VmError> {
    let (num, a0, a1, a2) = (s.registers[2], s.registers[4], s.registers[5], s.registers[6]);
    let fd = u32::try_from(a0).ok();
    let mut output = None;

    let (v0, v1) = match num {
        SYS_MMAP => {
            let mut size = a1;
            if size & PAGE_ADDR_MASK != 0 {
                size = size.wrapping_add(PAGE_SIZE as u64 - (size & PAGE_ADDR_MASK));
            }
            if a0 == 0 {
                let addr = s.heap;
                s.heap = s.heap.wrapping_add(size);
                (addr, 0)
            } else {
                (a0, 0)
            }
        }
        SYS_BRK => (BRK_START, 0),
        SYS_CLONE => (u64::MAX, EINVAL),
        SYS_EXIT_GROUP => {
            s.exited = true;
            s.exit_code = a0 as u8;
            return Ok(None);
        }
        SYS_READ => match fd {
            Some(FD_STDIN) => (0, 0),
            Some(FD_HINT_READ) => (a2, 0),
            Some(FD_PREIMAGE_READ) => (read_preimage(s, mem, preimages, a1, a2)?, 0),
            _ => (u64::MAX, EBADF),
        },
        SYS_WRITE => match fd {
            Some(FD_STDOUT | FD_STDERR | FD_HINT_WRITE) => {
                output = Some(Output { fd: a0, addr: a1, len: a2 });
                (a2, 0)
            }
            Some(FD_PREIMAGE_WRITE) => (write_preimage_key(s, mem, a1, a2)?, 0),
            _ => (u64::MAX, EBADF),
        },
        SYS_FCNTL if a1 == F_GETFL => match fd {
            Some(FD_STDIN | FD_HINT_READ | FD_PREIMAGE_READ) => (0, 0),
            Some(FD_STDOUT | FD_STDERR | FD_HINT_WRITE | FD_PREIMAGE_WRITE) => (1, 0),
            _ => (u64::MAX, EBADF),
        },
        SYS_FCNTL => (u64::MAX, EINVAL),
        SYS_OPEN => (u64::MAX, EBADF),
        _ => (u64::MAX, EINVAL),
    };

    s.registers[2] = v0;
    s.registers[7] = v1;
    s.pc = s.next_pc;
    s.next_pc = s.next_pc.wrapping_add(4);
    Ok(output)
}

/// Copy the next preimage bytes into the doubleword at `addr`, never crossing its boundary.
fn read_preimage<M: MemoryAccess, P: PreimageReader>(
    s: &mut State,
    mem: &mut M,
    preimages: &mut P,
    addr: u64,
    count: u64,
) -> Result<u64, VmError> {
    let (data, data_len) = preimages.read_preimage(s.preimage_key, s.preimage_offset)?;
    let alignment = (addr & 7) as usize;
    let n = data_len.min(8 - alignment).min(usize::try_from(count).unwrap_or(usize::MAX));

    let dword_addr = addr & !7;
    let mut bytes = mem.read_doubleword(dword_addr)?.to_be_bytes();
    bytes[alignment..alignment + n].copy_from_slice(&data[..n]);
    mem.write_doubleword(dword_addr, u64::from_be_bytes(bytes))?;

    s.preimage_offset += n as u64;
    Ok(n as u64)
}

/// Shift bytes from the doubleword at `addr` into the preimage key and rewind the read offset.
fn write_preimage_key<M: MemoryAccess>(
    s: &mut State,
    mem: &mut M,
    addr: u64,
    count: u64,
) -> Result<u64, VmError> {
    let alignment = (addr & 7) as usize;
    let n = usize::try_from(count).unwrap_or(usize::MAX).min(8 - alignment);
    let bytes = mem.read_doubleword(addr & !7)?.to_be_bytes();

    let mut key = s.preimage_key.0;
    key.copy_within(n.., 0);
    key[32 - n..].copy_from_slice(&bytes[alignment..alignment + n]);
    s.preimage_key = B256::from(key);
    s.preimage_offset = 0;
    Ok(n as u64)
}
