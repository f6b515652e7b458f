// C6: pretty-printer registry. Spec.md §4.6, §9 design note: "implement as a table of
// trait-implementing records, each with `match` and `format`, iterated in order" -- the stand-in
// for the source's duck-typed printer registry.
use crate::dwarf::TypeInfo;
use crate::memview::MemoryValue;
use std::collections::HashMap;

// Everything a printer needs to read its value and report back to C5: the byte buffer, the
// address to read from, the current recursion depth, a type table for size lookups, a recursive
// read-back into the generic reader (for array elements), and a "tag this address as type X" side
// effect (spec.md §4.6 "a 'tag this heap pointer as type X' side effect").
pub struct ReadContext<'a> {
    pub bytes: &'a [u8],
    pub address: usize,
    pub depth: usize,
    pub max_array_elements: usize,
    pub types: &'a HashMap<String, TypeInfo>,
    pub read_value: &'a dyn Fn(usize, &str, usize) -> MemoryValue,
    pub tag_pointer: &'a mut dyn FnMut(usize, String),
}

pub trait PrettyPrinter {
    fn matches(&self, type_name: &str) -> bool;
    fn format(&self, name: &str, type_name: &str, ctx: &mut ReadContext) -> Option<MemoryValue>;
}

pub struct Registry {
    printers: Vec<Box<dyn PrettyPrinter>>,
}

impl Registry {
    pub fn with_default_printers() -> Self {
        Registry {printers: vec![Box::new(SsoStringPrinter), Box::new(DynamicArrayPrinter)]}
    }

    pub fn push(&mut self, printer: Box<dyn PrettyPrinter>) {
        self.printers.push(printer);
    }

    // First match wins (spec.md §4.6 "printers are tried in registration order").
    pub fn format(&self, name: &str, type_name: &str, ctx: &mut ReadContext) -> Option<MemoryValue> {
        self.printers.iter().find(|p| p.matches(type_name)).and_then(|p| p.format(name, type_name, ctx))
    }
}

impl Default for Registry {
    fn default() -> Self { Self::with_default_printers() }
}

fn read_u32(bytes: &[u8], addr: usize) -> Option<u32> {
    let end = addr.checked_add(4)?;
    Some(u32::from_le_bytes(bytes.get(addr..end)?.try_into().ok()?))
}

fn leaf(name: &str, type_name: &str, address: usize, display: String) -> MemoryValue {
    MemoryValue {
        name: name.to_string(),
        resolved_type: type_name.to_string(),
        address,
        display_value: display,
        raw_numeric: None,
        is_pointer: false,
        target_address: None,
        is_struct: false,
        children: Vec::new(),
    }
}

// Small-string-optimization layout (spec.md §4.6, 12 bytes on 32-bit):
// short mode (byte 11 MSB clear): size = byte 11 & 0x7F, chars inline at [0, size).
// long mode (byte 11 MSB set): capacity at +0, size at +4, data pointer at +8.
struct SsoStringPrinter;
impl PrettyPrinter for SsoStringPrinter {
    fn matches(&self, type_name: &str) -> bool {
        type_name == "std::string"
            || type_name.contains("basic_string<char")
    }

    fn format(&self, name: &str, type_name: &str, ctx: &mut ReadContext) -> Option<MemoryValue> {
        let base = ctx.address;
        let tag_byte = *ctx.bytes.get(base + 11)?;
        let long_mode = tag_byte & 0x80 != 0;
        let display = if !long_mode {
            let size = (tag_byte & 0x7f) as usize;
            let end = base.checked_add(size)?.min(ctx.bytes.len());
            String::from_utf8_lossy(ctx.bytes.get(base..end)?).into_owned()
        } else {
            let size = read_u32(ctx.bytes, base + 4)? as usize;
            let data_ptr = read_u32(ctx.bytes, base + 8)? as usize;
            (ctx.tag_pointer)(data_ptr, "__nova_string_buffer".to_string());
            let end = data_ptr.checked_add(size).unwrap_or(data_ptr).min(ctx.bytes.len());
            if end > data_ptr {
                String::from_utf8_lossy(ctx.bytes.get(data_ptr..end)?).into_owned()
            } else {
                String::new()
            }
        };
        Some(leaf(name, type_name, base, format!("\"{}\"", display)))
    }
}

// Dynamic array layout (spec.md §4.6, 12 bytes: begin/end/capacity pointers).
struct DynamicArrayPrinter;
impl PrettyPrinter for DynamicArrayPrinter {
    fn matches(&self, type_name: &str) -> bool {
        type_name.starts_with("std::vector<")
    }

    fn format(&self, name: &str, type_name: &str, ctx: &mut ReadContext) -> Option<MemoryValue> {
        let base = ctx.address;
        let begin = read_u32(ctx.bytes, base)? as usize;
        let end = read_u32(ctx.bytes, base + 4)? as usize;
        let capacity_end = read_u32(ctx.bytes, base + 8)? as usize;

        let element_type = element_type_name(type_name);
        let element_size = element_size_of(&element_type, ctx.types);
        if element_size == 0 {
            return None;
        }
        let length = end.saturating_sub(begin) / element_size;
        let capacity = capacity_end.saturating_sub(begin) / element_size;

        (ctx.tag_pointer)(begin, format!("{}[]", element_type));

        let n = length.min(ctx.max_array_elements);
        let mut children = Vec::with_capacity(n);
        for i in 0..n {
            let elem_addr = begin + i * element_size;
            children.push((ctx.read_value)(elem_addr, &element_type, ctx.depth + 1));
        }

        Some(MemoryValue {
            name: name.to_string(),
            resolved_type: type_name.to_string(),
            address: base,
            display_value: format!("size={} cap={}", length, capacity),
            raw_numeric: None,
            is_pointer: false,
            target_address: None,
            is_struct: true,
            children,
        })
    }
}

fn element_type_name(vector_type: &str) -> String {
    let inner = vector_type.find('<').and_then(|start| vector_type.rfind('>').map(|end| &vector_type[start + 1..end]));
    match inner {
        Some(s) => s.split(',').next().unwrap_or(s).trim().to_string(),
        None => "int".to_string(),
    }
}

pub(crate) fn element_size_of(type_name: &str, types: &HashMap<String, TypeInfo>) -> usize {
    match type_name {
        "int" | "float" | "unsigned int" | "unsigned" => 4,
        "double" | "long" | "long long" | "unsigned long" | "unsigned long long" => 8,
        "char" | "bool" | "unsigned char" | "signed char" => 1,
        "short" | "unsigned short" => 2,
        t if t.ends_with('*') => 4,
        t => types.get(t).map(|ty| ty.byte_size).unwrap_or(4),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_i32_leaf(bytes: &[u8], addr: usize) -> MemoryValue {
        let v = i32::from_le_bytes(bytes[addr..addr + 4].try_into().unwrap());
        leaf("[]", "int", addr, v.to_string())
    }

    #[test]
    fn sso_short_string_reads_inline_bytes() {
        let mut bytes = vec![0u8; 12];
        bytes[0] = b'h';
        bytes[1] = b'i';
        bytes[11] = 2;
        let mut tagged = Vec::new();
        let types = HashMap::new();
        let read_value = |_a: usize, _t: &str, _d: usize| -> MemoryValue { unreachable!() };
        let mut ctx = ReadContext {
            bytes: &bytes, address: 0, depth: 0, max_array_elements: 50, types: &types,
            read_value: &read_value, tag_pointer: &mut |a, t| tagged.push((a, t)),
        };
        let v = SsoStringPrinter.format("s", "std::string", &mut ctx).unwrap();
        assert_eq!(v.display_value, "\"hi\"");
        assert!(tagged.is_empty());
    }

    #[test]
    fn sso_long_string_tags_data_buffer() {
        let mut bytes = vec![0u8; 32];
        bytes[11] = 0x80;
        bytes[4..8].copy_from_slice(&10u32.to_le_bytes());
        bytes[8..12].copy_from_slice(&16u32.to_le_bytes());
        bytes[16..26].copy_from_slice(b"0123456789");
        let mut tagged = Vec::new();
        let types = HashMap::new();
        let read_value = |_a: usize, _t: &str, _d: usize| -> MemoryValue { unreachable!() };
        let mut ctx = ReadContext {
            bytes: &bytes, address: 0, depth: 0, max_array_elements: 50, types: &types,
            read_value: &read_value, tag_pointer: &mut |a, t| tagged.push((a, t)),
        };
        let v = SsoStringPrinter.format("s", "std::string", &mut ctx).unwrap();
        assert_eq!(v.display_value, "\"0123456789\"");
        assert_eq!(tagged, vec![(16, "__nova_string_buffer".to_string())]);
    }

    #[test]
    fn dynamic_array_reads_inline_elements_and_tags_begin() {
        let mut bytes = vec![0u8; 32];
        bytes[0..4].copy_from_slice(&16u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&24u32.to_le_bytes());
        bytes[8..12].copy_from_slice(&24u32.to_le_bytes());
        bytes[16..20].copy_from_slice(&7i32.to_le_bytes());
        bytes[20..24].copy_from_slice(&9i32.to_le_bytes());
        let bytes_clone = bytes.clone();
        let mut tagged = Vec::new();
        let types = HashMap::new();
        let read_value = move |a: usize, t: &str, _d: usize| {
            assert_eq!(t, "int");
            read_i32_leaf(&bytes_clone, a)
        };
        let mut ctx = ReadContext {
            bytes: &bytes, address: 0, depth: 0, max_array_elements: 50, types: &types,
            read_value: &read_value, tag_pointer: &mut |a, t| tagged.push((a, t)),
        };
        let v = DynamicArrayPrinter.format("v", "std::vector<int>", &mut ctx).unwrap();
        assert_eq!(v.display_value, "size=2 cap=2");
        assert_eq!(v.children.len(), 2);
        assert_eq!(v.children[0].display_value, "7");
        assert_eq!(v.children[1].display_value, "9");
        assert_eq!(tagged, vec![(16, "int[]".to_string())]);
    }

    #[test]
    fn registry_tries_printers_in_order_first_match_wins() {
        let registry = Registry::with_default_printers();
        let mut bytes = vec![0u8; 12];
        bytes[11] = 0;
        let mut tagged = Vec::new();
        let types = HashMap::new();
        let read_value = |_a: usize, _t: &str, _d: usize| -> MemoryValue { unreachable!() };
        let mut ctx = ReadContext {
            bytes: &bytes, address: 0, depth: 0, max_array_elements: 50, types: &types,
            read_value: &read_value, tag_pointer: &mut |a, t| tagged.push((a, t)),
        };
        assert!(registry.format("s", "std::string", &mut ctx).is_some());
        assert!(registry.format("x", "int", &mut ctx).is_none());
    }
}
