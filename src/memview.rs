// C5: typed memory reader. Converts a raw linear-memory snapshot, DWARF info, the frame vector
// and allocation-tracker pointer pair into a semantic snapshot: typed locals per frame, typed heap
// allocations, and pointer edges (spec.md §4.5). Pure given its inputs; never panics on malformed
// or out-of-bounds data (spec.md §7 "Memory-read out-of-bounds", "Allocation tracker malformed").
use crate::bridge::FrameView;
use crate::dwarf::{DwarfInfo, TypeInfo};
use crate::pretty::{element_size_of, ReadContext, Registry};
use crate::settings::Settings;
use std::cell::RefCell;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryValue {
    pub name: String,
    pub resolved_type: String,
    pub address: usize,
    pub display_value: String,
    pub raw_numeric: Option<f64>,
    pub is_pointer: bool,
    pub target_address: Option<usize>,
    pub is_struct: bool,
    pub children: Vec<MemoryValue>,
}

#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub id: u64,
    pub function: String,
    pub line: usize,
    pub locals: Vec<MemoryValue>,
}

#[derive(Debug, Clone)]
pub struct HeapAllocation {
    pub address: usize,
    pub size: usize,
    pub type_name: String,
    pub members: Vec<MemoryValue>,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub frames: Vec<FrameSnapshot>,
    pub heap: Vec<HeapAllocation>,
}

fn leaf(type_name: &str, address: usize, display: String) -> MemoryValue {
    let raw_numeric = display.parse::<f64>().ok();
    MemoryValue {
        name: String::new(),
        resolved_type: type_name.to_string(),
        address,
        display_value: display,
        raw_numeric,
        is_pointer: false,
        target_address: None,
        is_struct: false,
        children: Vec::new(),
    }
}

fn read_bytes<'a>(bytes: &'a [u8], addr: usize, len: usize) -> Option<&'a [u8]> {
    let end = addr.checked_add(len)?;
    bytes.get(addr..end)
}
fn read_u32(bytes: &[u8], addr: usize) -> Option<u32> { Some(u32::from_le_bytes(read_bytes(bytes, addr, 4)?.try_into().ok()?)) }
fn read_u16(bytes: &[u8], addr: usize) -> Option<u16> { Some(u16::from_le_bytes(read_bytes(bytes, addr, 2)?.try_into().ok()?)) }
fn read_u64(bytes: &[u8], addr: usize) -> Option<u64> { Some(u64::from_le_bytes(read_bytes(bytes, addr, 8)?.try_into().ok()?)) }
fn read_f32(bytes: &[u8], addr: usize) -> Option<f32> { Some(f32::from_le_bytes(read_bytes(bytes, addr, 4)?.try_into().ok()?)) }
fn read_f64(bytes: &[u8], addr: usize) -> Option<f64> { Some(f64::from_le_bytes(read_bytes(bytes, addr, 8)?.try_into().ok()?)) }

// Reads the in-program allocation tracker: a 32-bit count followed by an array of 8-byte
// (ptr, size) pairs at the two exported addresses (spec.md §3 "Allocation tracker", §6 exports
// `__nova_alloc_count` / `__nova_allocs`). A malformed tracker degrades to an empty set rather
// than failing the snapshot (spec.md §7).
fn read_tracker_allocations(bytes: &[u8], tracker: (i32, i32), cap: usize) -> Vec<(usize, usize)> {
    let (allocs_ptr, count_ptr) = tracker;
    if allocs_ptr < 0 || count_ptr < 0 {
        return Vec::new();
    }
    let count = match read_u32(bytes, count_ptr as usize) {
        Some(c) => (c as usize).min(cap),
        None => return Vec::new(),
    };
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let entry = allocs_ptr as usize + i * 8;
        let (ptr, size) = match (read_u32(bytes, entry), read_u32(bytes, entry + 4)) {
            (Some(p), Some(s)) => (p as usize, s as usize),
            _ => break,
        };
        out.push((ptr, size));
    }
    out
}

fn allocation_containing(allocations: &HashMap<usize, usize>, addr: usize) -> Option<usize> {
    allocations.iter().find(|(&start, &size)| addr >= start && addr < start + size).map(|(&start, _)| start)
}

// Everything the recursive reader needs, bundled so it can be threaded through closures without
// capturing `&mut self` recursively. `pointer_types` is a `RefCell` because the pretty-printer
// registry's `tag_pointer` side effect and the reader's own pointer-following both need to mutate
// it from inside a chain of `&ReadCtxData` borrows (spec.md §4.5 step 3 "topological inference").
struct ReadCtxData<'a> {
    bytes: &'a [u8],
    dwarf: &'a DwarfInfo,
    allocations: &'a HashMap<usize, usize>,
    pointer_types: RefCell<HashMap<usize, String>>,
    max_array_elements: usize,
    max_type_depth: usize,
    registry: Registry,
}

fn read_value_inner(data: &ReadCtxData, address: usize, type_name: &str, depth: usize) -> MemoryValue {
    if depth > data.max_type_depth {
        return leaf(type_name, address, "<type-too-deep>".to_string());
    }

    let read_cb = |a: usize, t: &str, d: usize| read_value_inner(data, a, t, d);
    let mut tag_cb = |addr: usize, t: String| { data.pointer_types.borrow_mut().insert(addr, t); };
    {
        let mut ctx = ReadContext {
            bytes: data.bytes,
            address,
            depth,
            max_array_elements: data.max_array_elements,
            types: &data.dwarf.types,
            read_value: &read_cb,
            tag_pointer: &mut tag_cb,
        };
        if let Some(v) = data.registry.format("", type_name, &mut ctx) {
            return v;
        }
    }

    if let Some(pointee) = type_name.strip_suffix('*') {
        return read_pointer(data, address, type_name, pointee.trim());
    }
    if let Some(type_info) = data.dwarf.types.get(type_name) {
        return read_struct(data, address, type_name, type_info, depth);
    }
    read_primitive(data, address, type_name)
}

// Pointer fallback (spec.md §4.5 step 3): read a 32-bit target; if it lands inside an active
// allocation and the pointee is a known named type, record the topological inference.
fn read_pointer(data: &ReadCtxData, address: usize, type_name: &str, pointee: &str) -> MemoryValue {
    let target = match read_u32(data.bytes, address) {
        Some(t) => t as usize,
        None => return leaf(type_name, address, "???".to_string()),
    };
    if target != 0 {
        if let Some(alloc_addr) = allocation_containing(data.allocations, target) {
            if data.dwarf.types.contains_key(pointee) {
                data.pointer_types.borrow_mut().insert(alloc_addr, pointee.to_string());
            }
        }
    }
    MemoryValue {
        name: String::new(),
        resolved_type: type_name.to_string(),
        address,
        display_value: if target == 0 { "nullptr".to_string() } else { format!("0x{:x}", target) },
        raw_numeric: Some(target as f64),
        is_pointer: true,
        target_address: if target == 0 { None } else { Some(target) },
        is_struct: false,
        children: Vec::new(),
    }
}

// Struct fallback (spec.md §4.5 step 3): recurse into members by offset, bounded by max_type_depth.
fn read_struct(data: &ReadCtxData, address: usize, type_name: &str, type_info: &TypeInfo, depth: usize) -> MemoryValue {
    let mut children = Vec::with_capacity(type_info.members.len());
    for m in &type_info.members {
        let mut v = read_value_inner(data, address + m.byte_offset, &m.type_name, depth + 1);
        v.name = m.name.clone();
        children.push(v);
    }
    MemoryValue {
        name: String::new(),
        resolved_type: type_name.to_string(),
        address,
        display_value: type_name.to_string(),
        raw_numeric: None,
        is_pointer: false,
        target_address: None,
        is_struct: true,
        children,
    }
}

fn read_primitive(data: &ReadCtxData, address: usize, type_name: &str) -> MemoryValue {
    let bytes = data.bytes;
    let display = match type_name {
        "bool" => bytes.get(address).map(|b| (*b != 0).to_string()),
        "char" | "signed char" => bytes.get(address).map(|b| (*b as i8).to_string()),
        "unsigned char" => bytes.get(address).map(|b| b.to_string()),
        "short" => read_u16(bytes, address).map(|v| (v as i16).to_string()),
        "unsigned short" => read_u16(bytes, address).map(|v| v.to_string()),
        "int" => read_u32(bytes, address).map(|v| (v as i32).to_string()),
        "unsigned int" | "unsigned" => read_u32(bytes, address).map(|v| v.to_string()),
        "long" | "long long" => read_u64(bytes, address).map(|v| (v as i64).to_string()),
        "unsigned long" | "unsigned long long" => read_u64(bytes, address).map(|v| v.to_string()),
        "float" => read_f32(bytes, address).map(|v| v.to_string()),
        "double" => read_f64(bytes, address).map(|v| v.to_string()),
        _ => read_u32(bytes, address).map(|v| (v as i32).to_string()),
    };
    leaf(type_name, address, display.unwrap_or_else(|| "???".to_string()))
}

// Reads typed locals for one frame (spec.md §4.5 step 2). Applies the time-travel filter using the
// frame's own current line: a variable declared at or after that line is not yet in scope.
fn read_frame_locals(data: &ReadCtxData, frame: &FrameView) -> Vec<MemoryValue> {
    let mut locals = Vec::new();
    for var in &data.dwarf.variables {
        if var.function != frame.function {
            continue;
        }
        if var.decl_line >= frame.line {
            continue;
        }
        let address = frame.sp as i64 + var.frame_offset;
        if address < 0 {
            continue;
        }
        let address = address as usize;
        let size = var.byte_size.max(1);
        if address.checked_add(size).map_or(true, |end| end > data.bytes.len()) {
            continue;
        }
        let mut value = read_value_inner(data, address, &var.type_name, 0);
        value.name = var.name.clone();
        locals.push(value);
    }
    locals
}

fn read_raw_words(bytes: &[u8], addr: usize, size: usize) -> Vec<MemoryValue> {
    let count = (size / 4).min(8);
    (0..count)
        .filter_map(|i| {
            let a = addr + i * 4;
            read_u32(bytes, a).map(|v| {
                let mut mv = leaf("u32", a, format!("0x{:08x}", v));
                mv.name = format!("[{}]", i);
                mv
            })
        })
        .collect()
}

const ARRAY_TAG_SUFFIX: &str = "[]";
const STRING_BUFFER_TAG: &str = "__nova_string_buffer";

// Heap typing pass, iterated to fixed point (spec.md §4.5 step 4): array-tagged pointers type as
// arrays, struct-tagged pointers type as structs, and newly typed allocations may reveal further
// pointer edges that only become visible on the next round.
fn heap_typing_pass(data: &ReadCtxData, raw_allocs: &HashMap<usize, usize>) -> Vec<HeapAllocation> {
    let mut typed: HashMap<usize, (String, Vec<MemoryValue>)> = HashMap::new();

    loop {
        let mut changed = false;
        let snapshot_types = data.pointer_types.borrow().clone();
        for (&addr, &size) in raw_allocs {
            if typed.contains_key(&addr) {
                continue;
            }
            let inferred = match snapshot_types.get(&addr) {
                Some(t) => t.clone(),
                None => continue,
            };
            if inferred == STRING_BUFFER_TAG {
                typed.insert(addr, (inferred, Vec::new()));
                changed = true;
                continue;
            }
            if let Some(element_type) = inferred.strip_suffix(ARRAY_TAG_SUFFIX) {
                let element_size = element_size_of(element_type, &data.dwarf.types);
                if element_size == 0 {
                    continue;
                }
                let n = (size / element_size).min(data.max_array_elements);
                let mut members = Vec::with_capacity(n);
                for i in 0..n {
                    let elem_addr = addr + i * element_size;
                    if elem_addr + element_size > data.bytes.len() {
                        break;
                    }
                    let mut v = read_value_inner(data, elem_addr, element_type, 1);
                    v.name = format!("[{}]", i);
                    members.push(v);
                }
                typed.insert(addr, (inferred.clone(), members));
                changed = true;
                continue;
            }
            if let Some(type_info) = data.dwarf.types.get(&inferred) {
                let v = read_struct(data, addr, &inferred, type_info, 1);
                typed.insert(addr, (inferred, v.children));
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut heap: Vec<HeapAllocation> = Vec::new();
    for (&addr, &size) in raw_allocs {
        match typed.get(&addr) {
            Some((type_name, _)) if type_name == STRING_BUFFER_TAG => continue, // consumed by the string printer
            Some((type_name, members)) => heap.push(HeapAllocation {address: addr, size, type_name: type_name.clone(), members: members.clone()}),
            None => heap.push(HeapAllocation {address: addr, size, type_name: "<unknown>".to_string(), members: read_raw_words(data.bytes, addr, size)}),
        }
    }
    heap.sort_by_key(|h| h.address);
    heap
}

// Public contract (spec.md §4.5): byte buffer + DWARF + frame vector + tracker pointers + the
// persistent pointer->type map in; a semantic snapshot plus the successor map out.
pub fn read_snapshot(
    bytes: &[u8],
    dwarf: &DwarfInfo,
    frames_in: &[FrameView],
    tracker: (i32, i32),
    pointer_types: HashMap<usize, String>,
    settings: &Settings,
) -> (Snapshot, HashMap<usize, String>) {
    let raw_allocs = read_tracker_allocations(bytes, tracker, settings.max_tracked_allocations);
    let active: HashMap<usize, usize> = raw_allocs.iter().cloned().collect();

    let mut pruned = pointer_types;
    pruned.retain(|addr, _| active.contains_key(addr));

    let data = ReadCtxData {
        bytes,
        dwarf,
        allocations: &active,
        pointer_types: RefCell::new(pruned),
        max_array_elements: settings.max_array_elements,
        max_type_depth: settings.max_type_depth,
        registry: Registry::with_default_printers(),
    };

    let frames = frames_in
        .iter()
        .map(|f| FrameSnapshot {id: f.id, function: f.function.clone(), line: f.line, locals: read_frame_locals(&data, f)})
        .collect();

    let heap = heap_typing_pass(&data, &active);
    let successor_map = data.pointer_types.into_inner();
    (Snapshot {frames, heap}, successor_map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwarf::{TypeInfo, TypeMember, VariableRecord};

    fn node_type() -> TypeInfo {
        TypeInfo {
            byte_size: 8,
            members: vec![
                TypeMember {name: "v".to_string(), byte_offset: 0, type_name: "int".to_string(), size: 4, is_pointer: false, pointee_type: None},
                TypeMember {name: "next".to_string(), byte_offset: 4, type_name: "Node*".to_string(), size: 4, is_pointer: true, pointee_type: Some("Node".to_string())},
            ],
        }
    }

    fn write_node(bytes: &mut [u8], addr: usize, v: i32, next: u32) {
        bytes[addr..addr + 4].copy_from_slice(&v.to_le_bytes());
        bytes[addr + 4..addr + 8].copy_from_slice(&next.to_le_bytes());
    }

    fn write_tracker(bytes: &mut [u8], count_addr: usize, allocs_addr: usize, allocs: &[(u32, u32)]) {
        bytes[count_addr..count_addr + 4].copy_from_slice(&(allocs.len() as u32).to_le_bytes());
        for (i, (ptr, size)) in allocs.iter().enumerate() {
            let e = allocs_addr + i * 8;
            bytes[e..e + 4].copy_from_slice(&ptr.to_le_bytes());
            bytes[e + 4..e + 8].copy_from_slice(&size.to_le_bytes());
        }
    }

    #[test]
    fn linked_list_traversal_types_three_nodes_with_pointer_edges() {
        let mut bytes = vec![0u8; 256];
        write_node(&mut bytes, 100, 1, 120);
        write_node(&mut bytes, 120, 2, 140);
        write_node(&mut bytes, 140, 3, 0);
        write_tracker(&mut bytes, 200, 204, &[(100, 8), (120, 8), (140, 8)]);
        bytes[0..4].copy_from_slice(&100u32.to_le_bytes()); // local `head` at sp+0

        let mut dwarf = DwarfInfo::default();
        dwarf.types.insert("Node".to_string(), node_type());
        dwarf.variables.push(VariableRecord {
            name: "head".to_string(), type_name: "Node*".to_string(), byte_size: 4, frame_offset: 0,
            is_pointer: true, pointee_type: Some("Node".to_string()), function: "main".to_string(), decl_line: 1,
        });

        let frames = vec![FrameView {id: 0, function: "main".to_string(), line: 10, sp: 0, size: 16}];
        let settings = Settings::default();
        let (snapshot, _) = read_snapshot(&bytes, &dwarf, &frames, (204, 200), HashMap::new(), &settings);

        assert_eq!(snapshot.frames[0].locals.len(), 1);
        assert_eq!(snapshot.frames[0].locals[0].target_address, Some(100));

        assert_eq!(snapshot.heap.len(), 3);
        let a = snapshot.heap.iter().find(|h| h.address == 100).unwrap();
        assert_eq!(a.type_name, "Node");
        assert_eq!(a.members[1].target_address, Some(120));
        let c = snapshot.heap.iter().find(|h| h.address == 140).unwrap();
        assert_eq!(c.members[1].target_address, None);
        assert_eq!(c.members[1].display_value, "nullptr");
    }

    #[test]
    fn time_travel_filter_hides_not_yet_declared_locals() {
        let bytes = vec![0u8; 64];
        let mut dwarf = DwarfInfo::default();
        dwarf.variables.push(VariableRecord {name: "x".to_string(), type_name: "int".to_string(), byte_size: 4, frame_offset: 0, function: "main".to_string(), decl_line: 5, ..Default::default()});
        let settings = Settings::default();

        let before = vec![FrameView {id: 0, function: "main".to_string(), line: 3, sp: 0, size: 16}];
        let (snap, _) = read_snapshot(&bytes, &dwarf, &before, (-1, -1), HashMap::new(), &settings);
        assert!(snap.frames[0].locals.is_empty());

        let after = vec![FrameView {id: 0, function: "main".to_string(), line: 6, sp: 0, size: 16}];
        let (snap, _) = read_snapshot(&bytes, &dwarf, &after, (-1, -1), HashMap::new(), &settings);
        assert_eq!(snap.frames[0].locals.len(), 1);
    }

    #[test]
    fn freed_pointer_is_pruned_from_persistent_map() {
        let bytes = vec![0u8; 64];
        let dwarf = DwarfInfo::default();
        let settings = Settings::default();
        let mut pointer_types = HashMap::new();
        pointer_types.insert(100usize, "Node".to_string());
        pointer_types.insert(200usize, "Node".to_string()); // no longer present in the tracker: freed

        let mut tracker_bytes = bytes.clone();
        write_tracker(&mut tracker_bytes, 0, 8, &[(100, 8)]);
        let frames = vec![];
        let (_, successor) = read_snapshot(&tracker_bytes, &dwarf, &frames, (8, 0), pointer_types, &settings);
        assert!(successor.contains_key(&100));
        assert!(!successor.contains_key(&200));
    }

    #[test]
    fn leftover_allocation_without_inferred_type_exposed_as_raw_words() {
        let mut bytes = vec![0u8; 64];
        bytes[100_usize.min(63)..].copy_from_slice(&[]); // no-op, keep buffer small but valid
        let mut bytes = vec![0u8; 64];
        bytes[16..20].copy_from_slice(&0xdeadbeefu32.to_le_bytes());
        write_tracker(&mut bytes, 0, 8, &[(16, 8)]);
        let dwarf = DwarfInfo::default();
        let settings = Settings::default();
        let (snap, _) = read_snapshot(&bytes, &dwarf, &[], (8, 0), HashMap::new(), &settings);
        assert_eq!(snap.heap.len(), 1);
        assert_eq!(snap.heap[0].type_name, "<unknown>");
        assert_eq!(snap.heap[0].members[0].display_value, "0xdeadbeef");
    }

    #[test]
    fn string_buffer_allocation_is_not_emitted_as_a_standalone_heap_block() {
        let mut bytes = vec![0u8; 64];
        // a long-mode SSO string at sp+0 pointing its data buffer at the tracked allocation.
        bytes[11] = 0x80;
        bytes[4..8].copy_from_slice(&5u32.to_le_bytes());
        bytes[8..12].copy_from_slice(&32u32.to_le_bytes());
        bytes[32..37].copy_from_slice(b"hello");
        write_tracker(&mut bytes, 40, 44, &[(32, 8)]);

        let mut dwarf = DwarfInfo::default();
        dwarf.variables.push(VariableRecord {name: "s".to_string(), type_name: "std::string".to_string(), byte_size: 12, frame_offset: 0, function: "main".to_string(), decl_line: 0, ..Default::default()});

        let frames = vec![FrameView {id: 0, function: "main".to_string(), line: 1, sp: 0, size: 16}];
        let settings = Settings::default();
        let (snap, _) = read_snapshot(&bytes, &dwarf, &frames, (44, 40), HashMap::new(), &settings);

        assert_eq!(snap.frames[0].locals[0].display_value, "\"hello\"");
        assert!(snap.heap.is_empty());
    }

    #[test]
    fn dynamic_array_allocation_is_typed_as_element_array() {
        let mut bytes = vec![0u8; 128];
        // vector<int> local at sp+0: begin=32, end=48, capacity=48 (4 ints).
        bytes[0..4].copy_from_slice(&32u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&48u32.to_le_bytes());
        bytes[8..12].copy_from_slice(&48u32.to_le_bytes());
        for i in 0..4i32 {
            bytes[32 + i as usize * 4..36 + i as usize * 4].copy_from_slice(&i.to_le_bytes());
        }
        write_tracker(&mut bytes, 60, 64, &[(32, 16)]);

        let mut dwarf = DwarfInfo::default();
        dwarf.variables.push(VariableRecord {name: "v".to_string(), type_name: "std::vector<int>".to_string(), byte_size: 12, frame_offset: 0, function: "main".to_string(), decl_line: 0, ..Default::default()});

        let frames = vec![FrameView {id: 0, function: "main".to_string(), line: 1, sp: 0, size: 16}];
        let settings = Settings::default();
        let (snap, _) = read_snapshot(&bytes, &dwarf, &frames, (64, 60), HashMap::new(), &settings);

        assert_eq!(snap.frames[0].locals[0].display_value, "size=4 cap=4");
        assert_eq!(snap.heap.len(), 1);
        assert_eq!(snap.heap[0].type_name, "int[]");
        assert_eq!(snap.heap[0].members.len(), 4);
        assert_eq!(snap.heap[0].members[3].display_value, "3");
    }
}
