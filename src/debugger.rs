//! The control engine: owns the tracee, the breakpoint map and the image
//! model, and drives everything from the command loop.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};

use log::debug;
use nix::sys::signal::Signal;
use rustyline::error::ReadlineError;
use rustyline::Editor;

use crate::breakpoint::Breakpoint;
use crate::debugger_command::{DebuggerCommand, MemoryAction, RegisterAction};
use crate::dwarf_data::{DwarfData, Error as DwarfError, Function};
use crate::inferior::{Inferior, Status};
use crate::ptrace;
use crate::registers::{self, Reg, REGISTER_DESCRIPTORS};

// SIGTRAP si_code values, from the kernel.
const SI_KERNEL: i32 = 128;
const TRAP_BRKPT: i32 = 1;
const TRAP_TRACE: i32 = 2;

/// Lines of context shown above and below the current line.
const SOURCE_CONTEXT: u64 = 2;

pub struct Debugger {
    history_path: String,
    readline: Editor<()>,
    inferior: Inferior,
    /// False once the tracee has exited or been killed by a signal.
    alive: bool,
    debug_data: DwarfData,
    breakpoints: HashMap<u64, Breakpoint>,
}

impl Debugger {
    /// Load the target's debug info and launch it under trace. Failures
    /// here mean there is nothing to debug, so they exit.
    pub fn new(target: &str, args: &[String]) -> Debugger {
        let debug_data = match DwarfData::from_file(target) {
            Ok(val) => val,
            Err(DwarfError::ErrorOpeningFile) => {
                eprintln!("Could not open file {}", target);
                std::process::exit(1);
            }
            Err(DwarfError::DwarfFormatError(err)) => {
                eprintln!("Could not load debugging symbols from {}: {:?}", target, err);
                std::process::exit(1);
            }
        };

        let inferior = match Inferior::new(target, args) {
            Some(inferior) => inferior,
            None => {
                eprintln!("Error starting subprocess {}", target);
                std::process::exit(1);
            }
        };

        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let history_path = format!("{}/.minidbg_history", home);
        let mut readline = Editor::<()>::new();
        // Attempt to load history from ~/.minidbg_history if it exists
        let _ = readline.load_history(&history_path);

        Debugger {
            history_path,
            readline,
            inferior,
            alive: true,
            debug_data,
            breakpoints: HashMap::new(),
        }
    }

    pub fn run(&mut self) {
        // The tracee stops with SIGTRAP once exec completes; only then is
        // /proc/<pid>/maps meaningful.
        self.wait_for_signal();
        if self.alive {
            let pid = self.inferior.pid();
            self.debug_data.initialize_load_address(pid);
            debug!("load address 0x{:x}", self.debug_data.load_address());
        }

        loop {
            match self.get_next_command() {
                DebuggerCommand::Continue => {
                    if self.require_alive() {
                        self.continue_execution();
                    }
                }
                DebuggerCommand::Break(target) => {
                    if self.require_alive() {
                        self.handle_break(&target);
                    }
                }
                DebuggerCommand::Register(action) => {
                    if self.require_alive() {
                        self.handle_register(action);
                    }
                }
                DebuggerCommand::Memory(action) => {
                    if self.require_alive() {
                        self.handle_memory(action);
                    }
                }
                DebuggerCommand::StepInstruction => {
                    if self.require_alive() {
                        self.single_step_instruction_with_bp_check();
                        if self.alive {
                            if let Some(loc) = self.debug_data.line_at(self.get_pc(), true) {
                                print_source(&loc.file, loc.number, SOURCE_CONTEXT);
                            }
                        }
                    }
                }
                DebuggerCommand::Step => {
                    if self.require_alive() {
                        self.step_in();
                    }
                }
                DebuggerCommand::Next => {
                    if self.require_alive() {
                        self.step_over();
                    }
                }
                DebuggerCommand::Finish => {
                    if self.require_alive() {
                        self.step_out();
                    }
                }
                DebuggerCommand::Symbol(name) => self.lookup_symbol(&name),
                DebuggerCommand::Backtrace => {
                    if self.require_alive() {
                        self.print_backtrace();
                    }
                }
                DebuggerCommand::Quit => break,
            }
        }
        self.teardown();
    }

    fn require_alive(&self) -> bool {
        if !self.alive {
            eprintln!("No inferior process running");
        }
        self.alive
    }

    fn get_next_command(&mut self) -> DebuggerCommand {
        loop {
            match self.readline.readline("minidbg> ") {
                Err(ReadlineError::Interrupted) => {
                    // ctrl+c at the prompt; ignore it
                    println!("Type \"quit\" to exit");
                }
                Err(ReadlineError::Eof) => {
                    return DebuggerCommand::Quit;
                }
                Err(err) => {
                    eprintln!("Unexpected I/O error: {:?}", err);
                    return DebuggerCommand::Quit;
                }
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.readline.add_history_entry(line.as_str());
                    if let Err(err) = self.readline.save_history(&self.history_path) {
                        eprintln!(
                            "Warning: failed to save history file at {}: {}",
                            self.history_path, err
                        );
                    }
                    let tokens: Vec<&str> = line.split_whitespace().collect();
                    if let Some(cmd) = DebuggerCommand::from_tokens(&tokens) {
                        return cmd;
                    } else {
                        eprintln!("Unknown command");
                    }
                }
            }
        }
    }

    fn get_pc(&self) -> u64 {
        registers::value(self.inferior.pid(), Reg::Rip)
    }

    fn set_pc(&self, pc: u64) {
        registers::set(self.inferior.pid(), Reg::Rip, pc);
    }

    // ---- breakpoints ----

    fn handle_break(&mut self, target: &str) {
        if let Some(digits) = target.strip_prefix("0x").or_else(|| target.strip_prefix("0X")) {
            match u64::from_str_radix(digits, 16) {
                Ok(addr) => self.set_breakpoint_at_address(addr),
                Err(_) => eprintln!("Invalid address {}", target),
            }
        } else if let Some((file, line)) = target.split_once(':') {
            match line.parse::<u64>() {
                Ok(line) => self.set_breakpoint_at_source_line(file, line),
                Err(_) => eprintln!("Invalid line number in {}", target),
            }
        } else {
            self.set_breakpoint_at_function(target);
        }
    }

    fn set_breakpoint_at_address(&mut self, addr: u64) {
        // Replacing an existing entry would capture the trap byte as the
        // saved byte and corrupt the later disable, so refuse.
        if self.breakpoints.contains_key(&addr) {
            eprintln!("Breakpoint already set at 0x{:x}", addr);
            return;
        }
        if self.insert_breakpoint(addr) {
            println!("Set breakpoint at address 0x{:x}", addr);
        }
    }

    /// Insert and enable without announcing; shared by user breakpoints and
    /// the temporary ones stepping plants. Returns false if the address is
    /// not mapped.
    fn insert_breakpoint(&mut self, addr: u64) -> bool {
        let mut bp = Breakpoint::new(self.inferior.pid(), addr);
        bp.enable();
        if !bp.is_enabled() {
            eprintln!("Invalid breakpoint address 0x{:x}", addr);
            return false;
        }
        self.breakpoints.insert(addr, bp);
        true
    }

    fn set_breakpoint_at_function(&mut self, name: &str) {
        let targets: Vec<u64> = self
            .debug_data
            .functions_by_name(name)
            .into_iter()
            .filter_map(|(file, func)| {
                debug!("{} declared at {}:{}", func.name, file.name, func.line);
                file.line_entry_after_prologue(func).map(|entry| entry.address)
            })
            .collect();
        if targets.is_empty() {
            eprintln!("No function named {}", name);
            return;
        }
        for dwarf_addr in targets {
            let addr = self.debug_data.offset_dwarf(dwarf_addr);
            self.set_breakpoint_at_address(addr);
        }
    }

    fn set_breakpoint_at_source_line(&mut self, file: &str, line: u64) {
        match self.debug_data.line_in_file(file, line) {
            Some(dwarf_addr) => {
                let addr = self.debug_data.offset_dwarf(dwarf_addr);
                self.set_breakpoint_at_address(addr);
            }
            None => eprintln!("Could not find {}:{}", file, line),
        }
    }

    fn remove_breakpoint(&mut self, addr: u64) {
        if !self.alive {
            // nothing to restore in a dead tracee
            self.breakpoints.remove(&addr);
            return;
        }
        match self.breakpoints.remove(&addr) {
            Some(mut bp) => bp.disable(),
            None => eprintln!("No breakpoint at 0x{:x}", addr),
        }
    }

    // ---- execution control ----

    fn continue_execution(&mut self) {
        self.step_over_breakpoint();
        if !self.alive {
            return;
        }
        ptrace::cont(self.inferior.pid());
        self.wait_for_signal();
    }

    /// If the tracee sits on an enabled breakpoint, the trap has already
    /// fired and the pc points back at it; execute the displaced original
    /// byte once before anything else runs.
    fn step_over_breakpoint(&mut self) {
        let pc = self.get_pc();
        let enabled = self
            .breakpoints
            .get(&pc)
            .map_or(false, |bp| bp.is_enabled());
        if !enabled {
            return;
        }
        if let Some(bp) = self.breakpoints.get_mut(&pc) {
            bp.disable();
        }
        ptrace::single_step(self.inferior.pid());
        self.wait_for_signal();
        if self.alive {
            if let Some(bp) = self.breakpoints.get_mut(&pc) {
                bp.enable();
            }
        }
    }

    fn single_step_instruction(&mut self) {
        ptrace::single_step(self.inferior.pid());
        self.wait_for_signal();
    }

    fn single_step_instruction_with_bp_check(&mut self) {
        if self.breakpoints.contains_key(&self.get_pc()) {
            self.step_over_breakpoint();
        } else {
            self.single_step_instruction();
        }
    }

    fn step_in(&mut self) {
        let start = match self.debug_data.line_at(self.get_pc(), true) {
            Some(loc) => loc,
            None => {
                eprintln!("No line information for the current pc");
                return;
            }
        };
        while self.alive && self.debug_data.line_at(self.get_pc(), true).as_ref() == Some(&start) {
            self.single_step_instruction_with_bp_check();
        }
        if !self.alive {
            return;
        }
        if let Some(loc) = self.debug_data.line_at(self.get_pc(), true) {
            print_source(&loc.file, loc.number, SOURCE_CONTEXT);
        }
    }

    fn get_return_address(&self) -> u64 {
        // The return address sits one word above the saved frame pointer.
        let frame_pointer = registers::value(self.inferior.pid(), Reg::Rbp);
        ptrace::read_word(self.inferior.pid(), frame_pointer + 8)
    }

    fn step_out(&mut self) {
        let return_address = self.get_return_address();
        let added = if !self.breakpoints.contains_key(&return_address) {
            self.insert_breakpoint(return_address)
        } else {
            false
        };
        self.continue_execution();
        if added {
            self.remove_breakpoint(return_address);
        }
    }

    /// Breakpoint every other line of the current function plus the return
    /// address, continue, clean up. Simpler than branch-target analysis and
    /// correct as long as control leaves the function by returning.
    fn step_over(&mut self) {
        let pc = self.get_pc();
        let (start_addr, line_addrs) = match self.debug_data.function_at(pc) {
            Some((file, func)) => {
                let start = file
                    .line_entry_containing(self.debug_data.offset_load(pc))
                    .map(|line| line.address);
                let addrs: Vec<u64> = file
                    .lines
                    .iter()
                    .filter(|line| line.address >= func.low_pc && line.address < func.high_pc)
                    .map(|line| line.address)
                    .collect();
                (start, addrs)
            }
            None => {
                eprintln!("No function information for the current pc");
                return;
            }
        };

        let mut to_delete = Vec::new();
        for dwarf_addr in line_addrs {
            if Some(dwarf_addr) == start_addr {
                continue;
            }
            let addr = self.debug_data.offset_dwarf(dwarf_addr);
            if !self.breakpoints.contains_key(&addr) && self.insert_breakpoint(addr) {
                to_delete.push(addr);
            }
        }
        let return_address = self.get_return_address();
        if !self.breakpoints.contains_key(&return_address)
            && self.insert_breakpoint(return_address)
        {
            to_delete.push(return_address);
        }
        debug!("step over: {} temporary breakpoints", to_delete.len());

        self.continue_execution();

        for addr in to_delete {
            self.remove_breakpoint(addr);
        }
    }

    // ---- signals ----

    fn wait_for_signal(&mut self) {
        let status = match self.inferior.wait(None) {
            Ok(status) => status,
            Err(err) => {
                eprintln!("waitpid failed: {} (pid {})", err, self.inferior.pid());
                std::process::exit(1);
            }
        };
        match status {
            Status::Exited(exit_code) => {
                println!("Child exited (status {})", exit_code);
                self.alive = false;
            }
            Status::Signaled(signal) => {
                println!("Child exited due to signal {:?}", signal);
                self.alive = false;
            }
            Status::Stopped(signal, rip) => {
                debug!("tracee stopped by {:?} at 0x{:x}", signal, rip);
                let info = ptrace::get_siginfo(self.inferior.pid());
                match info.si_signo {
                    0 => {}
                    libc::SIGTRAP => self.handle_sigtrap(info.si_code),
                    libc::SIGSEGV => {
                        println!("Child got SIGSEGV (si_code {})", info.si_code)
                    }
                    signo => println!("Child stopped (signal {})", signal_name(signo)),
                }
            }
        }
    }

    fn handle_sigtrap(&mut self, si_code: i32) {
        match si_code {
            SI_KERNEL | TRAP_BRKPT => {
                // the one-byte trap has executed, so the pc is one past the
                // breakpoint address
                let pc = self.get_pc() - 1;
                self.set_pc(pc);
                println!("Hit breakpoint at address 0x{:x}", pc);
                if let Some(loc) = self.debug_data.line_at(pc, true) {
                    print_source(&loc.file, loc.number, SOURCE_CONTEXT);
                }
            }
            TRAP_TRACE => {
                // single step completed
            }
            code => debug!("unhandled SIGTRAP code {}", code),
        }
    }

    // ---- inspection commands ----

    fn handle_register(&mut self, action: RegisterAction) {
        let pid = self.inferior.pid();
        match action {
            RegisterAction::Dump => self.dump_registers(),
            RegisterAction::Read(name) => match registers::by_name(&name) {
                Some(reg) => println!("{}", registers::value(pid, reg)),
                None => eprintln!("No register named {}", name),
            },
            RegisterAction::Write(name, value) => {
                let reg = match registers::by_name(&name) {
                    Some(reg) => reg,
                    None => {
                        eprintln!("No register named {}", name);
                        return;
                    }
                };
                match parse_hex(&value) {
                    Some(value) => registers::set(pid, reg, value),
                    None => eprintln!("Invalid value {}", value),
                }
            }
        }
    }

    fn dump_registers(&self) {
        let pid = self.inferior.pid();
        for desc in REGISTER_DESCRIPTORS.iter() {
            println!("{} 0x{:016x}", desc.name, registers::value(pid, desc.reg));
        }
    }

    fn handle_memory(&mut self, action: MemoryAction) {
        let pid = self.inferior.pid();
        match action {
            MemoryAction::Read(addr) => match parse_hex(&addr) {
                Some(addr) => println!("{:x}", ptrace::read_word(pid, addr)),
                None => eprintln!("Invalid address {}", addr),
            },
            MemoryAction::Write(addr, value) => match (parse_hex(&addr), parse_hex(&value)) {
                (Some(addr), Some(value)) => ptrace::write_word(pid, addr, value),
                _ => eprintln!("Invalid address or value"),
            },
        }
    }

    fn lookup_symbol(&self, name: &str) {
        let symbols = self.debug_data.symbols(name);
        if symbols.is_empty() {
            eprintln!("No symbol named {}", name);
            return;
        }
        for symbol in symbols {
            println!("{}", symbol);
        }
    }

    /// Walk saved frame pointers, printing one line per frame. Stops at
    /// `main`, at a zero frame pointer, or when an address resolves to no
    /// known function.
    fn print_backtrace(&self) {
        let pid = self.inferior.pid();
        let mut frame_number = 0usize;
        let mut output_frame = |func: &Function| {
            println!("frame #{}: 0x{:x} {}", frame_number, func.low_pc, func.name);
            frame_number += 1;
        };

        let current = match self.debug_data.function_at(self.get_pc()) {
            Some((_, func)) => func,
            None => {
                eprintln!("No function information for the current pc");
                return;
            }
        };
        output_frame(current);

        let mut name = current.name.clone();
        let mut frame_pointer = registers::value(pid, Reg::Rbp);
        let mut return_address = ptrace::read_word(pid, frame_pointer + 8);
        while name != "main" && frame_pointer != 0 {
            let func = match self.debug_data.function_at(return_address) {
                Some((_, func)) => func,
                None => break,
            };
            output_frame(func);
            name = func.name.clone();
            frame_pointer = ptrace::read_word(pid, frame_pointer);
            return_address = ptrace::read_word(pid, frame_pointer + 8);
        }
    }

    /// Restore the tracee's code bytes, then take it down with us.
    fn teardown(&mut self) {
        if !self.alive {
            return;
        }
        for bp in self.breakpoints.values_mut() {
            bp.disable();
        }
        self.breakpoints.clear();
        self.inferior.kill();
    }
}

fn signal_name(signo: i32) -> String {
    match Signal::try_from(signo) {
        Ok(signal) => format!("{:?}", signal),
        Err(_) => signo.to_string(),
    }
}

fn parse_hex(arg: &str) -> Option<u64> {
    let digits = arg
        .strip_prefix("0x")
        .or_else(|| arg.strip_prefix("0X"))
        .unwrap_or(arg);
    u64::from_str_radix(digits, 16).ok()
}

/// Window bounds for the source listing: `context` lines either side of
/// `line`, clamped at the top of the file.
fn source_window(line: u64, context: u64) -> (u64, u64) {
    let start = if line <= context { 1 } else { line - context };
    (start, line + context)
}

fn print_source(path: &str, line: u64, context: u64) {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("Could not open source file {}: {}", path, err);
            return;
        }
    };
    let (start, end) = source_window(line, context);
    for (idx, text) in BufReader::new(file).lines().enumerate() {
        let number = idx as u64 + 1;
        if number < start {
            continue;
        }
        if number > end {
            break;
        }
        let text = match text {
            Ok(text) => text,
            Err(_) => break,
        };
        let marker = if number == line { "> " } else { "  " };
        println!("{}{}", marker, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parsing_strips_the_prefix() {
        assert_eq!(parse_hex("0xdeadbeef"), Some(0xdead_beef));
        assert_eq!(parse_hex("0XDEADBEEF"), Some(0xdead_beef));
        assert_eq!(parse_hex("401000"), Some(0x401000));
        assert_eq!(parse_hex("0x"), None);
        assert_eq!(parse_hex("zzz"), None);
    }

    #[test]
    fn source_window_clamps_at_the_top() {
        assert_eq!(source_window(14, 2), (12, 16));
        assert_eq!(source_window(1, 2), (1, 3));
        assert_eq!(source_window(2, 2), (1, 4));
        assert_eq!(source_window(3, 2), (1, 5));
    }
}
