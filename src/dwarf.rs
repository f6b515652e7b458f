// C2: DWARF reader. Pulls the custom `.debug_*` sections out of the final WASM module
// (spec.md §4.2 step 1, via `wasmparser`) and hands them to `gimli` -- the teacher's own DWARF
// dependency, used the same way `expr.rs` reaches for `gimli::Operation`/`EndianSlice`/`Evaluation`
// to decode location expressions -- to recover the line map, variable table, and type table
// (spec.md §3, §4.2 steps 2-7).
use crate::error::*;
use gimli::{AttributeValue, DebuggingInformationEntry, EndianSlice, LittleEndian};
use std::collections::HashMap;

type Slice<'a> = EndianSlice<'a, LittleEndian>;

#[derive(Debug, Clone, Default)]
pub struct VariableRecord {
    pub name: String,
    pub type_name: String,
    pub byte_size: usize,
    pub frame_offset: i64,
    pub is_pointer: bool,
    pub pointee_type: Option<String>,
    pub function: String,
    pub decl_line: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TypeMember {
    pub name: String,
    pub byte_offset: usize,
    pub type_name: String,
    pub size: usize,
    pub is_pointer: bool,
    pub pointee_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TypeInfo {
    pub byte_size: usize,
    pub members: Vec<TypeMember>,
}

#[derive(Debug, Clone, Default)]
pub struct DwarfInfo {
    // hex address string (no "0x" prefix, lowercase) -> source line
    pub line_map: HashMap<String, usize>,
    pub source_files: Vec<String>,
    pub variables: Vec<VariableRecord>,
    pub types: HashMap<String, TypeInfo>,
}

const MAX_TYPE_DEPTH: usize = 10;

// Raw per-offset facts collected during the DIE walk, before the post-pass that resolves
// forward references (spec.md §4.2 step 6: "defer type resolution").
#[derive(Debug, Clone, Default)]
struct RawType {
    tag: gimli::DwTag,
    name: Option<String>,
    byte_size: Option<usize>,
    type_ref: Option<usize>, // absolute .debug_info offset
    members: Vec<RawMember>,
}
#[derive(Debug, Clone)]
struct RawMember {
    name: String,
    byte_offset: usize,
    type_ref: Option<usize>,
}

enum Scope {
    Function(String),
    Struct(usize),
}

// Extracts the four DWARF custom sections from a WASM module's top-level section list
// (spec.md §4.2 step 1).
pub fn extract_debug_sections(wasm: &[u8]) -> Result<HashMap<String, Vec<u8>>> {
    let mut sections: HashMap<String, Vec<u8>> = HashMap::new();
    for payload in wasmparser::Parser::new(0).parse_all(wasm) {
        let payload = payload?;
        if let wasmparser::Payload::CustomSection(reader) = payload {
            let name = reader.name();
            if matches!(name, ".debug_line" | ".debug_info" | ".debug_abbrev" | ".debug_str") {
                sections.insert(name.to_string(), reader.data().to_vec());
            }
        }
    }
    Ok(sections)
}

// Parses the extracted sections into a DwarfInfo. Never fails outright (spec.md §7 "DWARF parse
// anomaly"): a section-level parse failure degrades to an empty sub-structure plus a log line.
pub fn parse(sections: &HashMap<String, Vec<u8>>) -> DwarfInfo {
    let section = |name: &str| -> &[u8] { sections.get(name).map(|v| v.as_slice()).unwrap_or(&[]) };

    let dwarf = gimli::Dwarf {
        debug_abbrev: gimli::DebugAbbrev::new(section(".debug_abbrev"), LittleEndian),
        debug_info: gimli::DebugInfo::new(section(".debug_info"), LittleEndian),
        debug_str: gimli::DebugStr::new(section(".debug_str"), LittleEndian),
        debug_line: gimli::DebugLine::new(section(".debug_line"), LittleEndian),
        ..Default::default()
    };

    let mut info = DwarfInfo::default();

    let mut units = dwarf.units();
    loop {
        let header = match units.next() {
            Ok(Some(h)) => h,
            Ok(None) => break,
            Err(_) => { eprintln!("warning: dwarf: malformed unit header, stopping unit iteration"); break; }
        };
        let unit = match dwarf.unit(header) {
            Ok(u) => u,
            Err(_) => { eprintln!("warning: dwarf: failed to parse compilation unit"); continue; }
        };
        parse_unit_lines(&dwarf, &unit, &mut info);
        parse_unit_dies(&dwarf, &unit, &mut info);
    }

    info
}

fn parse_unit_lines(dwarf: &gimli::Dwarf<Slice>, unit: &gimli::Unit<Slice>, info: &mut DwarfInfo) {
    let program = match &unit.line_program {
        Some(p) => p.clone(),
        None => return,
    };
    let header = program.header().clone();

    // Source file list (spec.md §3 "Source file": ordered list of path strings).
    for entry in header.file_names() {
        info.source_files.push(file_entry_path(dwarf, unit, &header, entry));
    }

    let mut rows = program.rows();
    loop {
        let (_row_header, row) = match rows.next_row() {
            Ok(Some(x)) => x,
            Ok(None) => break,
            Err(_) => { eprintln!("warning: dwarf: malformed line program row"); break; }
        };
        if row.end_sequence() {
            continue;
        }
        if let Some(line) = row.line() {
            let addr = row.address();
            info.line_map.insert(format!("{:x}", addr), line.get() as usize);
        }
    }
}

fn file_entry_path(dwarf: &gimli::Dwarf<Slice>, unit: &gimli::Unit<Slice>, header: &gimli::LineProgramHeader<Slice>, entry: &gimli::FileEntry<Slice>) -> String {
    let name = dwarf.attr_string(unit, entry.path_name()).ok()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.starts_with('/') {
        return name;
    }
    let dir = header.directory(entry.directory_index())
        .and_then(|d| dwarf.attr_string(unit, d).ok())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if dir.is_empty() {
        name
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

fn die_name(dwarf: &gimli::Dwarf<Slice>, unit: &gimli::Unit<Slice>, die: &DebuggingInformationEntry<Slice>) -> Option<String> {
    die.attr_value(gimli::DW_AT_name).ok().flatten()
        .and_then(|v| dwarf.attr_string(unit, v).ok())
        .map(|s| s.to_string_lossy().into_owned())
}

fn die_udata(die: &DebuggingInformationEntry<Slice>, at: gimli::DwAt) -> Option<u64> {
    die.attr_value(at).ok().flatten().and_then(|v| v.udata_value())
}

fn die_type_ref(die: &DebuggingInformationEntry<Slice>, unit_offset: usize) -> Option<usize> {
    match die.attr_value(gimli::DW_AT_type).ok().flatten()? {
        AttributeValue::UnitRef(r) => Some(unit_offset + r.0),
        AttributeValue::DebugInfoRef(r) => Some(r.0),
        _ => None,
    }
}

// Decodes only the single leading "frame base + signed offset" opcode of a DW_AT_location
// expression (DW_OP_fbreg), per spec.md §4.2 step 5.
fn frame_base_offset(die: &DebuggingInformationEntry<Slice>, encoding: gimli::Encoding) -> Option<i64> {
    let value = die.attr_value(gimli::DW_AT_location).ok().flatten()?;
    let expr = match value {
        AttributeValue::Exprloc(e) => e,
        _ => return None,
    };
    let mut ops = expr.operations(encoding);
    match ops.next().ok().flatten()? {
        gimli::Operation::FrameOffset {offset} => Some(offset),
        _ => None,
    }
}

fn parse_unit_dies(dwarf: &gimli::Dwarf<Slice>, unit: &gimli::Unit<Slice>, info: &mut DwarfInfo) {
    let unit_offset = unit.header.offset().as_debug_info_offset().map(|o| o.0).unwrap_or(0);
    let encoding = unit.encoding();

    let mut type_map: HashMap<usize, RawType> = HashMap::new();
    let mut pending_variable_types: Vec<(usize, Option<usize>)> = Vec::new();
    let mut depth: isize = 0;
    let mut scopes: Vec<(isize, Scope)> = Vec::new();

    let mut cursor = unit.entries();
    loop {
        let (delta, die) = match cursor.next_dfs() {
            Ok(Some(x)) => x,
            Ok(None) => break,
            Err(_) => { eprintln!("warning: dwarf: malformed DIE tree"); break; }
        };
        depth += delta;
        while scopes.last().map_or(false, |(d, _)| *d >= depth) {
            scopes.pop();
        }

        let offset = die.offset().0;

        match die.tag() {
            gimli::DW_TAG_subprogram => {
                let name = die_name(dwarf, unit, die).unwrap_or_default();
                scopes.push((depth, Scope::Function(name)));
            }
            gimli::DW_TAG_structure_type | gimli::DW_TAG_class_type => {
                let name = die_name(dwarf, unit, die);
                let byte_size = die_udata(die, gimli::DW_AT_byte_size).map(|v| v as usize);
                type_map.insert(offset, RawType {tag: die.tag(), name, byte_size, type_ref: None, members: Vec::new()});
                scopes.push((depth, Scope::Struct(offset)));
            }
            gimli::DW_TAG_member => {
                let parent = scopes.iter().rev().find_map(|(_, s)| match s {
                    Scope::Struct(o) => Some(*o),
                    _ => None,
                });
                if let Some(parent_offset) = parent {
                    let name = die_name(dwarf, unit, die).unwrap_or_default();
                    let byte_offset = die_udata(die, gimli::DW_AT_data_member_location).unwrap_or(0) as usize;
                    let type_ref = die_type_ref(die, unit_offset);
                    if let Some(rt) = type_map.get_mut(&parent_offset) {
                        rt.members.push(RawMember {name, byte_offset, type_ref});
                    }
                }
            }
            gimli::DW_TAG_pointer_type => {
                let type_ref = die_type_ref(die, unit_offset);
                type_map.insert(offset, RawType {tag: die.tag(), name: None, byte_size: Some(4), type_ref, members: Vec::new()});
            }
            gimli::DW_TAG_typedef | gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => {
                let name = die_name(dwarf, unit, die);
                let type_ref = die_type_ref(die, unit_offset);
                type_map.insert(offset, RawType {tag: die.tag(), name, byte_size: None, type_ref, members: Vec::new()});
            }
            gimli::DW_TAG_base_type => {
                let name = die_name(dwarf, unit, die);
                let byte_size = die_udata(die, gimli::DW_AT_byte_size).map(|v| v as usize);
                type_map.insert(offset, RawType {tag: die.tag(), name, byte_size, type_ref: None, members: Vec::new()});
            }
            gimli::DW_TAG_formal_parameter | gimli::DW_TAG_variable => {
                let function = scopes.iter().rev().find_map(|(_, s)| match s {
                    Scope::Function(n) => Some(n.clone()),
                    _ => None,
                });
                let function = match function {
                    Some(f) if !f.is_empty() => f,
                    _ => continue, // not owned by a function: out of scope (spec.md §3)
                };
                let name = match die_name(dwarf, unit, die) {
                    Some(n) if !n.is_empty() => n,
                    _ => continue,
                };
                let decl_line = die_udata(die, gimli::DW_AT_decl_line).unwrap_or(0) as usize;
                let frame_offset = frame_base_offset(die, encoding).unwrap_or(0);
                let type_ref = die_type_ref(die, unit_offset);
                info.variables.push(VariableRecord {
                    name,
                    type_name: String::new(), // filled in by resolve_types below
                    byte_size: 0,
                    frame_offset,
                    is_pointer: false,
                    pointee_type: None,
                    function,
                    decl_line,
                });
                pending_variable_types.push((info.variables.len() - 1, type_ref));
            }
            _ => {}
        }
    }

    resolve_types(&type_map, info, &pending_variable_types);
}

// Resolves a type-table offset to a display name, size, and pointer-ness, stripping
// typedef/const/volatile wrappers and capping recursion depth (spec.md §4.2 step 6: "cap cyclic
// or excessively deep chains at depth 10").
fn resolve(type_map: &HashMap<usize, RawType>, start: Option<usize>, depth: usize) -> (String, usize, bool, Option<String>) {
    let offset = match start {
        Some(o) => o,
        None => return ("void".to_string(), 0, false, None),
    };
    if depth >= MAX_TYPE_DEPTH {
        return ("<type-too-deep>".to_string(), 0, false, None);
    }
    let rt = match type_map.get(&offset) {
        Some(rt) => rt,
        None => return ("<unknown>".to_string(), 0, false, None),
    };
    match rt.tag {
        gimli::DW_TAG_pointer_type => {
            let (pointee_name, _, _, _) = resolve(type_map, rt.type_ref, depth + 1);
            (format!("{}*", pointee_name), rt.byte_size.unwrap_or(4), true, Some(pointee_name))
        }
        gimli::DW_TAG_typedef | gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => {
            resolve(type_map, rt.type_ref, depth + 1)
        }
        gimli::DW_TAG_structure_type | gimli::DW_TAG_class_type => {
            (rt.name.clone().unwrap_or_else(|| "<anonymous>".to_string()), rt.byte_size.unwrap_or(0), false, None)
        }
        gimli::DW_TAG_base_type => {
            (rt.name.clone().unwrap_or_else(|| "<unknown>".to_string()), rt.byte_size.unwrap_or(0), false, None)
        }
        _ => ("<unknown>".to_string(), 0, false, None),
    }
}

fn resolve_types(type_map: &HashMap<usize, RawType>, info: &mut DwarfInfo, pending: &[(usize, Option<usize>)]) {
    for (idx, type_ref) in pending {
        let (type_name, byte_size, is_pointer, pointee_type) = resolve(type_map, *type_ref, 0);
        let v = &mut info.variables[*idx];
        v.type_name = type_name;
        v.byte_size = byte_size;
        v.is_pointer = is_pointer;
        v.pointee_type = pointee_type;
    }
    for rt in type_map.values() {
        if !matches!(rt.tag, gimli::DW_TAG_structure_type | gimli::DW_TAG_class_type) {
            continue;
        }
        let name = match &rt.name {
            Some(n) if !n.is_empty() => n.clone(),
            _ => continue,
        };
        let mut members = Vec::new();
        for m in &rt.members {
            let (type_name, size, is_pointer, pointee_type) = resolve(type_map, m.type_ref, 0);
            members.push(TypeMember {name: m.name.clone(), byte_offset: m.byte_offset, type_name, size, is_pointer, pointee_type});
        }
        info.types.insert(name, TypeInfo {byte_size: rt.byte_size.unwrap_or(0), members});
    }
}
