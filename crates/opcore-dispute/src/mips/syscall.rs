//! The Linux syscalls a Go program needs, and the preimage fds.

use alloy_primitives::B256;

use super::{
    exec::{Output, PreimageReader},
    memory::{MemoryAccess, PAGE_ADDR_MASK, PAGE_SIZE},
    State, VmError,
};

pub const SYS_READ: u32 = 4003;
pub const SYS_WRITE: u32 = 4004;
pub const SYS_OPEN: u32 = 4005;
pub const SYS_BRK: u32 = 4045;
pub const SYS_FCNTL: u32 = 4055;
pub const SYS_MMAP: u32 = 4090;
pub const SYS_CLONE: u32 = 4120;
pub const SYS_EXIT_GROUP: u32 = 4246;

pub const FD_STDIN: u32 = 0;
pub const FD_STDOUT: u32 = 1;
pub const FD_STDERR: u32 = 2;
pub const FD_HINT_READ: u32 = 3;
pub const FD_HINT_WRITE: u32 = 4;
pub const FD_PREIMAGE_READ: u32 = 5;
pub const FD_PREIMAGE_WRITE: u32 = 6;

pub const EBADF: u32 = 0x9;
pub const EINVAL: u32 = 0x16;

/// Fixed program break.
pub const BRK_START: u32 = 0x4000_0000;

const F_GETFL: u32 = 3;

/// Dispatch on `$v0` with arguments in `$a0..$a2`; results go to `$v0` and `$a3`.
pub(super) fn handle<M: MemoryAccess, P: PreimageReader>(
    s: &mut State,
    mem: &mut M,
    preimages: &mut P,
) -> Result<Option<Output>, VmError> {
    let (num, a0, a1, a2) = (s.registers[2], s.registers[4], s.registers[5], s.registers[6]);
    let mut output = None;

    let (v0, v1) = match num {
        SYS_MMAP => {
            let mut size = a1;
            if size & PAGE_ADDR_MASK != 0 {
                size = size.wrapping_add(PAGE_SIZE as u32 - (size & PAGE_ADDR_MASK));
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
        SYS_CLONE => (u32::MAX, EINVAL),
        SYS_EXIT_GROUP => {
            s.exited = true;
            s.exit_code = a0 as u8;
            return Ok(None);
        }
        SYS_READ => match a0 {
            FD_STDIN => (0, 0),
            FD_HINT_READ => (a2, 0),
            FD_PREIMAGE_READ => (read_preimage(s, mem, preimages, a1, a2)?, 0),
            _ => (u32::MAX, EBADF),
        },
        SYS_WRITE => match a0 {
            FD_STDOUT | FD_STDERR | FD_HINT_WRITE => {
                output = Some(Output { fd: a0, addr: a1, len: a2 });
                (a2, 0)
            }
            FD_PREIMAGE_WRITE => (write_preimage_key(s, mem, a1, a2)?, 0),
            _ => (u32::MAX, EBADF),
        },
        SYS_FCNTL if a1 == F_GETFL => match a0 {
            FD_STDIN | FD_HINT_READ | FD_PREIMAGE_READ => (0, 0),
            FD_STDOUT | FD_STDERR | FD_HINT_WRITE | FD_PREIMAGE_WRITE => (1, 0),
            _ => (u32::MAX, EBADF),
        },
        SYS_FCNTL => (u32::MAX, EINVAL),
        SYS_OPEN => (u32::MAX, EBADF),
        _ => (u32::MAX, EINVAL),
    };

    s.registers[2] = v0;
    s.registers[7] = v1;
    s.pc = s.next_pc;
    s.next_pc = s.next_pc.wrapping_add(4);
    Ok(output)
}

/// Copy the next preimage bytes into the word at `addr`, never crossing a word boundary.
fn read_preimage<M: MemoryAccess, P: PreimageReader>(
    s: &mut State,
    mem: &mut M,
    preimages: &mut P,
    addr: u32,
    count: u32,
) -> Result<u32, VmError> {
    let (data, data_len) = preimages.read_preimage(s.preimage_key, s.preimage_offset.into())?;
    let alignment = (addr & 3) as usize;
    let n = data_len.min(4 - alignment).min(count as usize);

    let word_addr = addr & !3;
    let mut bytes = mem.read_word(word_addr)?.to_be_bytes();
    bytes[alignment..alignment + n].copy_from_slice(&data[..n]);
    mem.write_word(word_addr, u32::from_be_bytes(bytes))?;

    s.preimage_offset += n as u32;
    Ok(n as u32)
}

/// Shift bytes from the word at `addr` into the preimage key and rewind the read offset.
fn write_preimage_key<M: MemoryAccess>(
    s: &mut State,
    mem: &mut M,
    addr: u32,
    count: u32,
) -> Result<u32, VmError> {
    let alignment = (addr & 3) as usize;
    let n = (count as usize).min(4 - alignment);
    let bytes = mem.read_word(addr & !3)?.to_be_bytes();

    let mut key = s.preimage_key.0;
    key.copy_within(n.., 0);
    key[32 - n..].copy_from_slice(&bytes[alignment..alignment + n]);
    s.preimage_key = B256::from(key);
    s.preimage_offset = 0;
    Ok(n as u32)
}
