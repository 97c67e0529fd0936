//! System call dispatch.
//!
//! The trap handler decodes the raw trap frame into a syscall number plus
//! up to four register-passed arguments and calls [`dispatch`]. Every
//! syscall that takes a user pointer runs it through
//! [`mm::user_validation::validate_user_range`] before touching it --
//! user tasks can pass any garbage address.
//!
//! The numbering below is the complete ABI surface: `read` through
//! `yield` are real, dispatched syscalls; 64 and up are reserved for the
//! graphics/event calls a display layer would add. Those slots exist and
//! decode correctly, they just answer [`SyscallError::NotImplemented`] --
//! the display layer is an external collaborator this kernel doesn't
//! carry, but the ABI numbering in front of it is fixed and shouldn't
//! shift out from under a future implementation.

#![allow(dead_code)]

extern crate alloc;

use alloc::string::String;
use alloc::vec;

use crate::fs::file::{OpenFlags, SeekFrom, GLOBAL_FILE_TABLE};
use crate::mm::page_fault::with_current_address_space;
use crate::mm::user_validation::validate_user_range;
use crate::mm::vas::{VmaFlags, VmaKind};
use crate::mm::VirtualAddress;
use crate::sched::{self, BOOT_CPU};

/// System call numbers, matching the minimum ABI surface: `read`, `write`,
/// `open`, `close`, `lseek`, `mmap`, `munmap`, `brk`, `getpid`, `exit`,
/// `fork`, `kill`, `yield`, plus a reserved graphics/event block.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Read = 0,
    Write = 1,
    Open = 2,
    Close = 3,
    Lseek = 4,
    /// `mmap(addr_hint, len, prot, flags)`.
    MemoryMap = 5,
    /// `munmap(addr, len)`.
    MemoryUnmap = 6,
    /// `brk(new_brk)`; pass `0` to just query the current break.
    Brk = 7,
    GetPid = 8,
    Exit = 9,
    Fork = 10,
    Kill = 11,
    /// Give up the remainder of the current quantum.
    Yield = 12,
    /// First of the reserved graphics/event numbers; everything from here
    /// up to [`GRAPHICS_RESERVED_END`] decodes but answers `NotImplemented`.
    GraphicsReserved = 64,
}

/// Last reserved graphics/event syscall number (inclusive).
pub const GRAPHICS_RESERVED_END: usize = 95;

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Syscall::Read),
            1 => Ok(Syscall::Write),
            2 => Ok(Syscall::Open),
            3 => Ok(Syscall::Close),
            4 => Ok(Syscall::Lseek),
            5 => Ok(Syscall::MemoryMap),
            6 => Ok(Syscall::MemoryUnmap),
            7 => Ok(Syscall::Brk),
            8 => Ok(Syscall::GetPid),
            9 => Ok(Syscall::Exit),
            10 => Ok(Syscall::Fork),
            11 => Ok(Syscall::Kill),
            12 => Ok(Syscall::Yield),
            64..=GRAPHICS_RESERVED_END => Ok(Syscall::GraphicsReserved),
            _ => Err(()),
        }
    }
}

/// System call result type, ABI-compatible with a signed return register:
/// non-negative on success, a negative [`SyscallError`] on failure.
pub type SyscallResult = Result<usize, SyscallError>;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall = -1,
    InvalidArgument = -2,
    Fault = -3,
    OutOfMemory = -4,
    NotInitialized = -5,
    NotImplemented = -6,
    BadFileDescriptor = -7,
    NotFound = -8,
}

impl From<crate::error::KernelError> for SyscallError {
    fn from(err: crate::error::KernelError) -> Self {
        use crate::error::{FsError, KernelError};
        match err {
            KernelError::OutOfMemory { .. } => SyscallError::OutOfMemory,
            KernelError::InvalidAddress { .. } => SyscallError::Fault,
            KernelError::NotInitialized { .. } => SyscallError::NotInitialized,
            KernelError::NotImplemented { .. } => SyscallError::NotImplemented,
            KernelError::FsError(FsError::BadFileDescriptor) => SyscallError::BadFileDescriptor,
            KernelError::FsError(FsError::NotFound) => SyscallError::NotFound,
            _ => SyscallError::InvalidArgument,
        }
    }
}

/// Called from the architecture trap handler on a syscall trap/instruction
/// (`syscall`/`int 0x80`, depending on entry path).
#[no_mangle]
pub extern "C" fn syscall_handler(
    syscall_num: usize,
    arg1: usize,
    arg2: usize,
    arg3: usize,
    arg4: usize,
) -> isize {
    let result = match Syscall::try_from(syscall_num) {
        Ok(syscall) => dispatch(syscall, arg1, arg2, arg3, arg4),
        Err(()) => Err(SyscallError::InvalidSyscall),
    };

    match result {
        Ok(value) => value as isize,
        Err(error) => error as i32 as isize,
    }
}

fn dispatch(syscall: Syscall, arg1: usize, arg2: usize, arg3: usize, arg4: usize) -> SyscallResult {
    match syscall {
        Syscall::Read => sys_read(arg1, arg2, arg3),
        Syscall::Write => sys_write(arg1, arg2, arg3),
        Syscall::Open => sys_open(arg1, arg2, arg3),
        Syscall::Close => sys_close(arg1),
        Syscall::Lseek => sys_lseek(arg1, arg2, arg3),
        Syscall::MemoryMap => sys_mmap(arg1, arg2, arg3, arg4),
        Syscall::MemoryUnmap => sys_munmap(arg1, arg2),
        Syscall::Brk => sys_brk(arg1),
        Syscall::GetPid => sys_getpid(),
        Syscall::Exit => sys_exit(arg1),
        Syscall::Fork => sys_fork(),
        Syscall::Kill => sys_kill(arg1, arg2),
        Syscall::Yield => sys_yield(),
        Syscall::GraphicsReserved => Err(SyscallError::NotImplemented),
    }
}

fn sys_yield() -> SyscallResult {
    sched::scheduler::yield_current(BOOT_CPU);
    Ok(0)
}

/// Terminates the calling task. Without a process hierarchy there is no
/// parent to notify and nothing to reap here, so this just marks the task
/// a zombie and hands the CPU to whatever runs next.
fn sys_exit(_code: usize) -> SyscallResult {
    let current = sched::scheduler::current(BOOT_CPU);
    sched::scheduler::terminate(current);
    sched::scheduler::yield_current(BOOT_CPU);
    Ok(0)
}

fn sys_getpid() -> SyscallResult {
    Ok(sched::scheduler::current(BOOT_CPU).0 as usize)
}

/// There is exactly one address space and one task table in this build --
/// duplicating either needs a real process model this kernel doesn't
/// carry (see the userland non-goal). The slot is real so the ABI number
/// is fixed; the call itself is not implemented yet.
fn sys_fork() -> SyscallResult {
    Err(SyscallError::NotImplemented)
}

/// Signal delivery needs a per-task pending-signal set this kernel
/// doesn't have; `kill` on the calling task's own ID degrades to `exit`,
/// matching the one case this single-task build can actually honor.
fn sys_kill(pid: usize, _signal: usize) -> SyscallResult {
    let current = sched::scheduler::current(BOOT_CPU);
    if pid as u64 == current.0 {
        return sys_exit(0);
    }
    Err(SyscallError::NotFound)
}

fn sys_read(fd: usize, buf_ptr: usize, len: usize) -> SyscallResult {
    if len == 0 {
        return Ok(0);
    }
    let file = GLOBAL_FILE_TABLE
        .get(fd)
        .ok_or(SyscallError::BadFileDescriptor)?;
    let mut scratch = vec![0u8; len];
    let n = file.read(&mut scratch).map_err(SyscallError::from)?;
    with_current_address_space(|space| {
        validate_user_range(space, buf_ptr as u64, n, true)
    })
    .map_err(SyscallError::from)?;
    unsafe {
        core::ptr::copy_nonoverlapping(scratch.as_ptr(), buf_ptr as *mut u8, n);
    }
    Ok(n)
}

fn sys_write(fd: usize, buf_ptr: usize, len: usize) -> SyscallResult {
    if len == 0 {
        return Ok(0);
    }
    with_current_address_space(|space| {
        validate_user_range(space, buf_ptr as u64, len, false)
    })
    .map_err(SyscallError::from)?;
    let scratch = unsafe { core::slice::from_raw_parts(buf_ptr as *const u8, len) };
    let file = GLOBAL_FILE_TABLE
        .get(fd)
        .ok_or(SyscallError::BadFileDescriptor)?;
    file.write(scratch).map_err(SyscallError::from)
}

/// Reads the NUL-terminated path string out of user memory at `path_ptr`.
/// Bounded to a single page -- no syscall in this ABI takes a path longer
/// than that.
fn read_user_path(path_ptr: usize) -> Result<String, SyscallError> {
    const MAX_PATH: usize = 4096;
    with_current_address_space(|space| validate_user_range(space, path_ptr as u64, MAX_PATH, false))
        .map_err(SyscallError::from)?;
    let bytes = unsafe { core::slice::from_raw_parts(path_ptr as *const u8, MAX_PATH) };
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(MAX_PATH);
    core::str::from_utf8(&bytes[..len])
        .map(String::from)
        .map_err(|_| SyscallError::InvalidArgument)
}

fn sys_open(path_ptr: usize, flags_bits: usize, _mode: usize) -> SyscallResult {
    let path = read_user_path(path_ptr)?;
    let flags = OpenFlags::from_bits(flags_bits as u32).ok_or(SyscallError::InvalidArgument)?;
    crate::fs::file::open_path(&path, flags)
        .map_err(SyscallError::from)
}

fn sys_close(fd: usize) -> SyscallResult {
    GLOBAL_FILE_TABLE
        .close(fd)
        .map(|_| 0)
        .map_err(SyscallError::from)
}

fn sys_lseek(fd: usize, offset: usize, whence: usize) -> SyscallResult {
    let file = GLOBAL_FILE_TABLE
        .get(fd)
        .ok_or(SyscallError::BadFileDescriptor)?;
    let from = match whence {
        0 => SeekFrom::Start(offset),
        1 => SeekFrom::Current(offset as isize),
        2 => SeekFrom::End(offset as isize),
        _ => return Err(SyscallError::InvalidArgument),
    };
    file.seek(from).map_err(SyscallError::from)
}

fn sys_mmap(addr_hint: usize, len: usize, prot: usize, flags: usize) -> SyscallResult {
    if len == 0 {
        return Err(SyscallError::InvalidArgument);
    }
    let mut vma_flags = VmaFlags::empty();
    if prot & 0b001 != 0 {
        vma_flags |= VmaFlags::READ;
    }
    if prot & 0b010 != 0 {
        vma_flags |= VmaFlags::WRITE;
    }
    if prot & 0b100 != 0 {
        vma_flags |= VmaFlags::EXEC;
    }
    // MAP_PRIVATE (bit 1), the only mode this kernel supports; shared
    // mappings are out of scope.
    if flags & 0b10 != 0 {
        vma_flags |= VmaFlags::PRIVATE;
    }

    let hint = if addr_hint == 0 {
        None
    } else {
        Some(VirtualAddress(addr_hint as u64))
    };

    with_current_address_space(|space| {
        space.mmap(hint, len as u64, vma_flags, VmaKind::Anonymous)
    })
    .map(|addr| addr.0 as usize)
    .map_err(SyscallError::from)
}

fn sys_munmap(addr: usize, len: usize) -> SyscallResult {
    if len == 0 {
        return Err(SyscallError::InvalidArgument);
    }
    with_current_address_space(|space| {
        validate_user_range(space, addr as u64, len, false)?;
        space.munmap(VirtualAddress(addr as u64), len as u64)
    })
    .map(|_| 0)
    .map_err(SyscallError::from)
}

fn sys_brk(new_brk: usize) -> SyscallResult {
    let target = if new_brk == 0 {
        None
    } else {
        Some(VirtualAddress(new_brk as u64))
    };
    with_current_address_space(|space| space.brk(target))
        .map(|addr| addr.0 as usize)
        .map_err(SyscallError::from)
}
