//! The x86-64 general-register file as exposed through PTRACE_GETREGS.
//!
//! DWARF register numbers follow the System V x86-64 psABI, figure 3.36
//! (https://www.uclibc.org/docs/psABI-x86_64.pdf). Registers the DWARF
//! numbering does not cover (rip, orig_rax) carry -1.

use libc::user_regs_struct;
use nix::unistd::Pid;

use crate::ptrace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    R15,
    R14,
    R13,
    R12,
    Rbp,
    Rbx,
    R11,
    R10,
    R9,
    R8,
    Rax,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    OrigRax,
    Rip,
    Cs,
    Rflags,
    Rsp,
    Ss,
    FsBase,
    GsBase,
    Ds,
    Es,
    Fs,
    Gs,
}

pub struct RegDescriptor {
    pub reg: Reg,
    pub dwarf_num: i32,
    pub name: &'static str,
}

// Ordered like user_regs_struct in <sys/user.h>.
pub const REGISTER_DESCRIPTORS: [RegDescriptor; 27] = [
    RegDescriptor { reg: Reg::R15, dwarf_num: 15, name: "r15" },
    RegDescriptor { reg: Reg::R14, dwarf_num: 14, name: "r14" },
    RegDescriptor { reg: Reg::R13, dwarf_num: 13, name: "r13" },
    RegDescriptor { reg: Reg::R12, dwarf_num: 12, name: "r12" },
    RegDescriptor { reg: Reg::Rbp, dwarf_num: 6, name: "rbp" },
    RegDescriptor { reg: Reg::Rbx, dwarf_num: 3, name: "rbx" },
    RegDescriptor { reg: Reg::R11, dwarf_num: 11, name: "r11" },
    RegDescriptor { reg: Reg::R10, dwarf_num: 10, name: "r10" },
    RegDescriptor { reg: Reg::R9, dwarf_num: 9, name: "r9" },
    RegDescriptor { reg: Reg::R8, dwarf_num: 8, name: "r8" },
    RegDescriptor { reg: Reg::Rax, dwarf_num: 0, name: "rax" },
    RegDescriptor { reg: Reg::Rcx, dwarf_num: 2, name: "rcx" },
    RegDescriptor { reg: Reg::Rdx, dwarf_num: 1, name: "rdx" },
    RegDescriptor { reg: Reg::Rsi, dwarf_num: 4, name: "rsi" },
    RegDescriptor { reg: Reg::Rdi, dwarf_num: 5, name: "rdi" },
    RegDescriptor { reg: Reg::OrigRax, dwarf_num: -1, name: "orig_rax" },
    RegDescriptor { reg: Reg::Rip, dwarf_num: -1, name: "rip" },
    RegDescriptor { reg: Reg::Cs, dwarf_num: 51, name: "cs" },
    RegDescriptor { reg: Reg::Rflags, dwarf_num: 49, name: "eflags" },
    RegDescriptor { reg: Reg::Rsp, dwarf_num: 7, name: "rsp" },
    RegDescriptor { reg: Reg::Ss, dwarf_num: 52, name: "ss" },
    RegDescriptor { reg: Reg::FsBase, dwarf_num: 58, name: "fs_base" },
    RegDescriptor { reg: Reg::GsBase, dwarf_num: 59, name: "gs_base" },
    RegDescriptor { reg: Reg::Ds, dwarf_num: 53, name: "ds" },
    RegDescriptor { reg: Reg::Es, dwarf_num: 50, name: "es" },
    RegDescriptor { reg: Reg::Fs, dwarf_num: 54, name: "fs" },
    RegDescriptor { reg: Reg::Gs, dwarf_num: 55, name: "gs" },
];

fn read_slot(regs: &user_regs_struct, reg: Reg) -> u64 {
    match reg {
        Reg::R15 => regs.r15,
        Reg::R14 => regs.r14,
        Reg::R13 => regs.r13,
        Reg::R12 => regs.r12,
        Reg::Rbp => regs.rbp,
        Reg::Rbx => regs.rbx,
        Reg::R11 => regs.r11,
        Reg::R10 => regs.r10,
        Reg::R9 => regs.r9,
        Reg::R8 => regs.r8,
        Reg::Rax => regs.rax,
        Reg::Rcx => regs.rcx,
        Reg::Rdx => regs.rdx,
        Reg::Rsi => regs.rsi,
        Reg::Rdi => regs.rdi,
        Reg::OrigRax => regs.orig_rax,
        Reg::Rip => regs.rip,
        Reg::Cs => regs.cs,
        Reg::Rflags => regs.eflags,
        Reg::Rsp => regs.rsp,
        Reg::Ss => regs.ss,
        Reg::FsBase => regs.fs_base,
        Reg::GsBase => regs.gs_base,
        Reg::Ds => regs.ds,
        Reg::Es => regs.es,
        Reg::Fs => regs.fs,
        Reg::Gs => regs.gs,
    }
}

fn write_slot(regs: &mut user_regs_struct, reg: Reg, value: u64) {
    match reg {
        Reg::R15 => regs.r15 = value,
        Reg::R14 => regs.r14 = value,
        Reg::R13 => regs.r13 = value,
        Reg::R12 => regs.r12 = value,
        Reg::Rbp => regs.rbp = value,
        Reg::Rbx => regs.rbx = value,
        Reg::R11 => regs.r11 = value,
        Reg::R10 => regs.r10 = value,
        Reg::R9 => regs.r9 = value,
        Reg::R8 => regs.r8 = value,
        Reg::Rax => regs.rax = value,
        Reg::Rcx => regs.rcx = value,
        Reg::Rdx => regs.rdx = value,
        Reg::Rsi => regs.rsi = value,
        Reg::Rdi => regs.rdi = value,
        Reg::OrigRax => regs.orig_rax = value,
        Reg::Rip => regs.rip = value,
        Reg::Cs => regs.cs = value,
        Reg::Rflags => regs.eflags = value,
        Reg::Rsp => regs.rsp = value,
        Reg::Ss => regs.ss = value,
        Reg::FsBase => regs.fs_base = value,
        Reg::GsBase => regs.gs_base = value,
        Reg::Ds => regs.ds = value,
        Reg::Es => regs.es = value,
        Reg::Fs => regs.fs = value,
        Reg::Gs => regs.gs = value,
    }
}

/// Fetch the register dump and return one register's value.
pub fn value(pid: Pid, reg: Reg) -> u64 {
    let regs = ptrace::get_regs(pid);
    read_slot(&regs, reg)
}

/// Fetch the register dump, overwrite one register, write the dump back.
pub fn set(pid: Pid, reg: Reg, val: u64) {
    let mut regs = ptrace::get_regs(pid);
    write_slot(&mut regs, reg, val);
    ptrace::set_regs(pid, regs);
}

/// Look up a register by its DWARF number and read it.
#[allow(dead_code)]
pub fn from_dwarf(pid: Pid, dwarf_num: i32) -> Option<u64> {
    let desc = REGISTER_DESCRIPTORS
        .iter()
        .find(|d| d.dwarf_num >= 0 && d.dwarf_num == dwarf_num)?;
    Some(value(pid, desc.reg))
}

#[allow(dead_code)]
pub fn name_of(reg: Reg) -> &'static str {
    REGISTER_DESCRIPTORS
        .iter()
        .find(|d| d.reg == reg)
        .map(|d| d.name)
        .expect("register missing from descriptor table")
}

pub fn by_name(name: &str) -> Option<Reg> {
    REGISTER_DESCRIPTORS
        .iter()
        .find(|d| d.name == name)
        .map(|d| d.reg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_regs() -> user_regs_struct {
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn names_round_trip() {
        for desc in REGISTER_DESCRIPTORS.iter() {
            assert_eq!(by_name(name_of(desc.reg)), Some(desc.reg));
        }
        assert_eq!(by_name("xmm0"), None);
    }

    #[test]
    fn descriptor_table_is_consistent() {
        for (i, a) in REGISTER_DESCRIPTORS.iter().enumerate() {
            for b in REGISTER_DESCRIPTORS.iter().skip(i + 1) {
                assert_ne!(a.reg, b.reg);
                assert_ne!(a.name, b.name);
                if a.dwarf_num >= 0 {
                    assert_ne!(a.dwarf_num, b.dwarf_num);
                }
            }
        }
    }

    #[test]
    fn dwarf_numbers_follow_the_psabi() {
        let by_dwarf = |n: i32| {
            REGISTER_DESCRIPTORS
                .iter()
                .find(|d| d.dwarf_num == n)
                .map(|d| d.reg)
        };
        assert_eq!(by_dwarf(0), Some(Reg::Rax));
        assert_eq!(by_dwarf(1), Some(Reg::Rdx));
        assert_eq!(by_dwarf(5), Some(Reg::Rdi));
        assert_eq!(by_dwarf(6), Some(Reg::Rbp));
        assert_eq!(by_dwarf(7), Some(Reg::Rsp));
        assert_eq!(by_dwarf(49), Some(Reg::Rflags));
    }

    #[test]
    fn slots_round_trip_for_every_register() {
        for (i, desc) in REGISTER_DESCRIPTORS.iter().enumerate() {
            let mut regs = zeroed_regs();
            let val = 0x1000 + i as u64;
            write_slot(&mut regs, desc.reg, val);
            assert_eq!(read_slot(&regs, desc.reg), val, "slot {}", desc.name);
        }
    }

    #[test]
    fn writing_one_slot_leaves_the_rest_alone() {
        let mut regs = zeroed_regs();
        write_slot(&mut regs, Reg::Rax, 0xdead_beef);
        for desc in REGISTER_DESCRIPTORS.iter().filter(|d| d.reg != Reg::Rax) {
            assert_eq!(read_slot(&regs, desc.reg), 0, "slot {}", desc.name);
        }
    }
}
