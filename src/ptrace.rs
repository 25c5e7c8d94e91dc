//! Thin wrappers over the ptrace(2) requests the debugger needs.
//!
//! A failed request here means the stopped-tracee invariant no longer holds
//! (wrong pid, tracee gone, bad address), and the tracee may be left with an
//! un-restored trap byte. There is no way to recover mid-command, so every
//! wrapper reports the request, errno, pid and address and terminates.

use std::ffi::c_void;

use libc::{siginfo_t, user_regs_struct};
use nix::sys::ptrace;
use nix::unistd::Pid;

fn die(request: &str, pid: Pid, addr: u64, err: nix::Error) -> ! {
    eprintln!(
        "ptrace {} failed: {} (pid {}, addr 0x{:x})",
        request, err, pid, addr
    );
    std::process::exit(1);
}

/// Ask to be traced by the parent. Called in the child between fork and
/// exec, so errors are propagated to the `pre_exec` machinery instead of
/// killing the debugger.
pub fn trace_me() -> nix::Result<()> {
    ptrace::traceme()
}

pub fn cont(pid: Pid) {
    if let Err(err) = ptrace::cont(pid, None) {
        die("PTRACE_CONT", pid, 0, err);
    }
}

pub fn single_step(pid: Pid) {
    if let Err(err) = ptrace::step(pid, None) {
        die("PTRACE_SINGLESTEP", pid, 0, err);
    }
}

pub fn read_word(pid: Pid, addr: u64) -> u64 {
    match ptrace::read(pid, addr as ptrace::AddressType) {
        Ok(word) => word as u64,
        Err(err) => die("PTRACE_PEEKDATA", pid, addr, err),
    }
}

pub fn write_word(pid: Pid, addr: u64, word: u64) {
    let res = unsafe { ptrace::write(pid, addr as ptrace::AddressType, word as *mut c_void) };
    if let Err(err) = res {
        die("PTRACE_POKEDATA", pid, addr, err);
    }
}

pub fn get_regs(pid: Pid) -> user_regs_struct {
    match ptrace::getregs(pid) {
        Ok(regs) => regs,
        Err(err) => die("PTRACE_GETREGS", pid, 0, err),
    }
}

pub fn set_regs(pid: Pid, regs: user_regs_struct) {
    if let Err(err) = ptrace::setregs(pid, regs) {
        die("PTRACE_SETREGS", pid, 0, err);
    }
}

pub fn get_siginfo(pid: Pid) -> siginfo_t {
    match ptrace::getsiginfo(pid) {
        Ok(info) => info,
        Err(err) => die("PTRACE_GETSIGINFO", pid, 0, err),
    }
}
