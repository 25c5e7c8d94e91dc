//! DWARF section loading and the compilation-unit walk that feeds
//! `dwarf_data`. Everything is copied out of the `.debug_*` sections into
//! owned tables up front so nothing borrows the file mapping afterwards.

use std::borrow::Cow;
use std::rc::Rc;

use gimli::{AttributeValue, EndianReader, Reader as _, RunTimeEndian};
use object::{Object, ObjectSection};

use crate::dwarf_data::{File, Function, Line};

pub type Reader = EndianReader<RunTimeEndian, Rc<[u8]>>;

#[derive(Debug)]
pub enum Error {
    GimliError(gimli::Error),
    ObjectError(String),
}

impl From<gimli::Error> for Error {
    fn from(err: gimli::Error) -> Self {
        Error::GimliError(err)
    }
}

/// Pull the `.debug_*` sections out of the object file into reference-counted
/// buffers.
pub fn load_dwarf(
    object: &object::File,
    endian: RunTimeEndian,
) -> Result<gimli::Dwarf<Reader>, Error> {
    let load_section = |id: gimli::SectionId| -> Result<Reader, gimli::Error> {
        let data = object
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[][..]));
        Ok(EndianReader::new(Rc::from(&*data), endian))
    };
    Ok(gimli::Dwarf::load(load_section)?)
}

/// Walk every compilation unit, collecting its source name, its subprogram
/// DIEs and its line table.
pub fn parse_units(dwarf: &gimli::Dwarf<Reader>) -> Result<Vec<File>, Error> {
    let mut files = Vec::new();
    let mut iter = dwarf.units();
    while let Some(header) = iter.next()? {
        let unit = dwarf.unit(header)?;
        files.push(parse_unit(dwarf, &unit)?);
    }
    Ok(files)
}

fn reader_to_string(reader: &Reader) -> Option<String> {
    reader.to_string_lossy().ok().map(|s| s.into_owned())
}

fn attr_to_string(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    value: AttributeValue<Reader>,
) -> Option<String> {
    let reader = dwarf.attr_string(unit, value).ok()?;
    reader_to_string(&reader)
}

enum HighPc {
    Addr(u64),
    Size(u64),
}

fn parse_unit(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
) -> Result<File, Error> {
    let comp_dir = unit.comp_dir.as_ref().and_then(reader_to_string);
    let unit_name = unit.name.as_ref().and_then(reader_to_string).unwrap_or_default();
    let name = match comp_dir {
        Some(dir) if !unit_name.starts_with('/') => format!("{}/{}", dir, unit_name),
        _ => unit_name,
    };

    let mut functions = Vec::new();
    let mut cursor = unit.entries();
    while let Some((_, entry)) = cursor.next_dfs()? {
        if entry.tag() != gimli::DW_TAG_subprogram {
            continue;
        }
        let mut fn_name = None;
        let mut low_pc = None;
        let mut high_pc = None;
        let mut decl_line = 0;
        let mut attrs = entry.attrs();
        while let Some(attr) = attrs.next()? {
            match attr.name() {
                gimli::DW_AT_name => fn_name = attr_to_string(dwarf, unit, attr.value()),
                gimli::DW_AT_low_pc => {
                    if let AttributeValue::Addr(addr) = attr.value() {
                        low_pc = Some(addr);
                    }
                }
                gimli::DW_AT_high_pc => {
                    // either an end address or an offset from low_pc
                    high_pc = match attr.value() {
                        AttributeValue::Addr(addr) => Some(HighPc::Addr(addr)),
                        _ => attr.udata_value().map(HighPc::Size),
                    }
                }
                gimli::DW_AT_decl_line => decl_line = attr.udata_value().unwrap_or(0),
                _ => {}
            }
        }
        if let (Some(name), Some(low_pc), Some(high_pc)) = (fn_name, low_pc, high_pc) {
            let high_pc = match high_pc {
                HighPc::Addr(addr) => addr,
                HighPc::Size(size) => low_pc + size,
            };
            functions.push(Function {
                name,
                low_pc,
                high_pc,
                line: decl_line,
            });
        }
    }

    let mut lines = Vec::new();
    if let Some(program) = unit.line_program.clone() {
        let mut rows = program.rows();
        while let Some((_, row)) = rows.next_row()? {
            if row.end_sequence() {
                continue;
            }
            if let Some(line) = row.line() {
                lines.push(Line {
                    address: row.address(),
                    number: line.get(),
                    is_stmt: row.is_stmt(),
                });
            }
        }
    }
    lines.sort_by_key(|line| line.address);

    Ok(File {
        name,
        functions,
        lines,
    })
}
