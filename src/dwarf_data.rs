//! The image model: everything the debugger knows about the tracee's binary.
//!
//! Construction memory-maps the ELF once and copies what the queries need
//! into owned tables: per-compilation-unit function and line tables, the
//! symtab/dynsym symbols, and an `addr2line` context for pc-to-line lookup.
//! The only mutable piece of state is the load address, discovered once the
//! tracee exists.

use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader};

use addr2line::Context;
use log::debug;
use nix::unistd::Pid;
use object::{Object, ObjectKind, ObjectSymbol, SymbolKind};

use crate::gimli_wrapper::{self, Reader};

#[derive(Debug)]
pub enum Error {
    ErrorOpeningFile,
    DwarfFormatError(gimli_wrapper::Error),
}

impl From<gimli_wrapper::Error> for Error {
    fn from(err: gimli_wrapper::Error) -> Self {
        Error::DwarfFormatError(err)
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// DWARF (link-time) addresses; add the load address for the tracee's
    /// view.
    pub low_pc: u64,
    pub high_pc: u64,
    pub line: u64,
}

#[derive(Debug, Clone)]
pub struct Line {
    pub address: u64,
    pub number: u64,
    pub is_stmt: bool,
}

/// One compilation unit: its source path plus the tables used to answer
/// breakpoint and stepping queries.
#[derive(Debug, Clone, Default)]
pub struct File {
    pub name: String,
    pub functions: Vec<Function>,
    /// Line rows sorted by address.
    pub lines: Vec<Line>,
}

impl File {
    fn matches_suffix(&self, suffix: &str) -> bool {
        self.name == suffix || self.name.ends_with(&format!("/{}", suffix))
    }

    /// The line row covering `dwarf_pc`: the greatest row at or below it.
    pub fn line_entry_containing(&self, dwarf_pc: u64) -> Option<&Line> {
        let idx = self.lines.partition_point(|line| line.address <= dwarf_pc);
        if idx == 0 {
            None
        } else {
            Some(&self.lines[idx - 1])
        }
    }

    /// The first line row past a function's prologue. `DW_AT_low_pc` points
    /// at the prologue itself, so take the row after the one at the entry
    /// address; a function too small to have a second row keeps its first.
    pub fn line_entry_after_prologue(&self, func: &Function) -> Option<&Line> {
        let idx = self.lines.partition_point(|line| line.address < func.low_pc);
        let first = self.lines.get(idx)?;
        match self.lines.get(idx + 1) {
            Some(next) if next.address < func.high_pc => Some(next),
            _ => Some(first),
        }
    }
}

/// A source position, as reported back to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub number: u64,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
    NoType,
    Object,
    Func,
    Section,
    File,
}

impl fmt::Display for SymbolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SymbolType::NoType => "notype",
            SymbolType::Object => "object",
            SymbolType::Func => "func",
            SymbolType::Section => "section",
            SymbolType::File => "file",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub sym_type: SymbolType,
    pub name: String,
    pub addr: u64,
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type: {} name: {} addr: 0x{:x}",
            self.sym_type, self.name, self.addr
        )
    }
}

pub struct DwarfData {
    files: Vec<File>,
    symbols: Vec<Symbol>,
    addr2line: Context<Reader>,
    is_pie: bool,
    load_address: u64,
}

impl DwarfData {
    pub fn from_file(path: &str) -> Result<DwarfData, Error> {
        let file = fs::File::open(path).or(Err(Error::ErrorOpeningFile))?;
        let mmap = unsafe { memmap::Mmap::map(&file).or(Err(Error::ErrorOpeningFile))? };
        let object = object::File::parse(&*mmap)
            .map_err(|err| gimli_wrapper::Error::ObjectError(err.to_string()))?;
        let endian = if object.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };
        let is_pie = object.kind() == ObjectKind::Dynamic;
        let symbols = collect_symbols(&object);
        let dwarf = gimli_wrapper::load_dwarf(&object, endian)?;
        let files = gimli_wrapper::parse_units(&dwarf)?;
        let addr2line = Context::from_dwarf(dwarf).map_err(gimli_wrapper::Error::from)?;
        Ok(DwarfData {
            files,
            symbols,
            addr2line,
            is_pie,
            load_address: 0,
        })
    }

    /// For a position-independent executable, read the runtime base from the
    /// first mapping in `/proc/<pid>/maps`. Must run after the tracee's
    /// first stop, and only once.
    pub fn initialize_load_address(&mut self, pid: Pid) {
        if !self.is_pie {
            return;
        }
        let path = format!("/proc/{}/maps", pid);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                eprintln!("Could not open {}: {}", path, err);
                return;
            }
        };
        let mut first_line = String::new();
        if BufReader::new(file).read_line(&mut first_line).is_err() {
            eprintln!("Could not read {}", path);
            return;
        }
        match parse_maps_base(&first_line) {
            Some(base) => {
                debug!("tracee mapped at 0x{:x}", base);
                self.load_address = base;
            }
            None => eprintln!("Could not parse {}", path),
        }
    }

    pub fn load_address(&self) -> u64 {
        self.load_address
    }

    /// Absolute tracee address -> DWARF address.
    pub fn offset_load(&self, addr: u64) -> u64 {
        addr.wrapping_sub(self.load_address)
    }

    /// DWARF address -> absolute tracee address.
    pub fn offset_dwarf(&self, addr: u64) -> u64 {
        addr.wrapping_add(self.load_address)
    }

    /// The compilation unit and subprogram whose pc range contains the
    /// absolute address `pc`.
    pub fn function_at(&self, pc: u64) -> Option<(&File, &Function)> {
        find_function(&self.files, self.offset_load(pc))
    }

    /// The source position for `pc`. With `need_offset` the pc is absolute
    /// and relocated down to a DWARF address first.
    pub fn line_at(&self, pc: u64, need_offset: bool) -> Option<Location> {
        let probe = if need_offset { self.offset_load(pc) } else { pc };
        let location = self.addr2line.find_location(probe).ok()??;
        Some(Location {
            file: location.file?.to_string(),
            number: location.line? as u64,
        })
    }

    /// Every subprogram DIE named `name`, across all compilation units.
    pub fn functions_by_name(&self, name: &str) -> Vec<(&File, &Function)> {
        self.files
            .iter()
            .flat_map(|file| {
                file.functions
                    .iter()
                    .filter(|func| func.name == name)
                    .map(move |func| (file, func))
            })
            .collect()
    }

    /// The DWARF address of the first is-stmt line row with the given line
    /// number, in the compilation unit whose name ends with `suffix`.
    pub fn line_in_file(&self, suffix: &str, line_number: u64) -> Option<u64> {
        find_line_in_file(&self.files, suffix, line_number)
    }

    /// All symtab/dynsym symbols with exactly this name.
    pub fn symbols(&self, name: &str) -> Vec<&Symbol> {
        self.symbols.iter().filter(|sym| sym.name == name).collect()
    }
}

impl fmt::Debug for DwarfData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DwarfData {{files: {:?}}}", self.files)
    }
}

fn collect_symbols(object: &object::File) -> Vec<Symbol> {
    let classify = |kind: SymbolKind| match kind {
        SymbolKind::Text => SymbolType::Func,
        SymbolKind::Data => SymbolType::Object,
        SymbolKind::Section => SymbolType::Section,
        SymbolKind::File => SymbolType::File,
        _ => SymbolType::NoType,
    };
    let mut symbols = Vec::new();
    for symbol in object.symbols().chain(object.dynamic_symbols()) {
        let name = match symbol.name() {
            Ok(name) if !name.is_empty() => name.to_string(),
            _ => continue,
        };
        symbols.push(Symbol {
            sym_type: classify(symbol.kind()),
            name,
            addr: symbol.address(),
        });
    }
    symbols
}

fn find_function<'a>(files: &'a [File], dwarf_pc: u64) -> Option<(&'a File, &'a Function)> {
    for file in files {
        for func in &file.functions {
            if func.low_pc <= dwarf_pc && dwarf_pc < func.high_pc {
                return Some((file, func));
            }
        }
    }
    None
}

fn find_line_in_file(files: &[File], suffix: &str, line_number: u64) -> Option<u64> {
    let file = files.iter().find(|file| file.matches_suffix(suffix))?;
    file.lines
        .iter()
        .find(|line| line.is_stmt && line.number == line_number)
        .map(|line| line.address)
}

/// First hex field of a maps line: `555555554000-555555555000 r-xp ...`.
fn parse_maps_base(line: &str) -> Option<u64> {
    let start = line.split('-').next()?;
    u64::from_str_radix(start.trim(), 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> File {
        File {
            name: "/home/user/project/hello.cpp".to_string(),
            functions: vec![
                Function {
                    name: "main".to_string(),
                    low_pc: 0x1130,
                    high_pc: 0x1180,
                    line: 10,
                },
                Function {
                    name: "helper".to_string(),
                    low_pc: 0x1180,
                    high_pc: 0x11a0,
                    line: 4,
                },
            ],
            lines: vec![
                Line { address: 0x1130, number: 10, is_stmt: true },
                Line { address: 0x113a, number: 12, is_stmt: true },
                Line { address: 0x114e, number: 12, is_stmt: false },
                Line { address: 0x1160, number: 14, is_stmt: true },
                Line { address: 0x1180, number: 4, is_stmt: true },
                Line { address: 0x118c, number: 5, is_stmt: true },
            ],
        }
    }

    #[test]
    fn maps_base_parses_the_first_field() {
        let line = "555555554000-555555555000 r-xp 00000000 08:06 1608698   /tmp/hello\n";
        assert_eq!(parse_maps_base(line), Some(0x555555554000));
        assert_eq!(parse_maps_base("not a maps line"), None);
        assert_eq!(parse_maps_base(""), None);
    }

    #[test]
    fn function_lookup_respects_pc_ranges() {
        let files = vec![sample_file()];
        let (_, func) = find_function(&files, 0x1130).unwrap();
        assert_eq!(func.name, "main");
        let (_, func) = find_function(&files, 0x117f).unwrap();
        assert_eq!(func.name, "main");
        let (_, func) = find_function(&files, 0x1180).unwrap();
        assert_eq!(func.name, "helper");
        assert!(find_function(&files, 0x11a0).is_none());
        assert!(find_function(&files, 0x100).is_none());
    }

    #[test]
    fn line_lookup_matches_file_suffix_and_stmt_rows() {
        let files = vec![sample_file()];
        assert_eq!(find_line_in_file(&files, "hello.cpp", 14), Some(0x1160));
        assert_eq!(
            find_line_in_file(&files, "project/hello.cpp", 14),
            Some(0x1160)
        );
        // line 12 also has a non-stmt row at 0x114e; the stmt row wins
        assert_eq!(find_line_in_file(&files, "hello.cpp", 12), Some(0x113a));
        assert_eq!(find_line_in_file(&files, "goodbye.cpp", 14), None);
        assert_eq!(find_line_in_file(&files, "hello.cpp", 99), None);
        // suffix must match at a path component boundary
        assert_eq!(find_line_in_file(&files, "llo.cpp", 14), None);
    }

    #[test]
    fn containing_entry_is_the_greatest_at_or_below() {
        let file = sample_file();
        assert_eq!(file.line_entry_containing(0x1130).unwrap().address, 0x1130);
        assert_eq!(file.line_entry_containing(0x1145).unwrap().address, 0x113a);
        assert_eq!(file.line_entry_containing(0xffff).unwrap().address, 0x118c);
        assert!(file.line_entry_containing(0x100).is_none());
    }

    #[test]
    fn prologue_skip_takes_the_second_row_in_range() {
        let file = sample_file();
        let main = &file.functions[0];
        assert_eq!(file.line_entry_after_prologue(main).unwrap().address, 0x113a);
        let helper = &file.functions[1];
        assert_eq!(
            file.line_entry_after_prologue(helper).unwrap().address,
            0x118c
        );
    }

    #[test]
    fn prologue_skip_keeps_the_only_row_of_a_tiny_function() {
        let mut file = sample_file();
        file.functions.push(Function {
            name: "tiny".to_string(),
            low_pc: 0x118c,
            high_pc: 0x1190,
            line: 7,
        });
        let tiny = &file.functions[2];
        assert_eq!(file.line_entry_after_prologue(tiny).unwrap().address, 0x118c);
    }

    #[test]
    fn offset_helpers_are_inverses() {
        let load = 0x5555_5555_4000u64;
        for addr in [0u64, 0x1130, 0x7fff_ffff_0000] {
            let abs = addr.wrapping_add(load);
            assert_eq!(abs.wrapping_sub(load), addr);
            assert_eq!(addr.wrapping_sub(load).wrapping_add(load), addr);
        }
    }
}
