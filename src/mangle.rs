// Name demangling, grounded on the teacher's own use of `cpp_demangle` ("for demangling function
// names (unavoidable in .symtab, convenient in .debug_info)", per its Cargo.toml comment).
use cpp_demangle::{Symbol, DemangleOptions};

// Demangles a standard Itanium-ABI mangled name ("_Z<len><name>...") when possible, and maps known
// aliases of the post-link main() wrapper to "main". Falls back to the raw name otherwise -- the
// instrumenter must never fail just because a name doesn't parse as mangled C++ (spec.md §4.1:
// "the instrumenter is total").
pub fn demangle_function_name(raw: &str, main_wrapper_aliases: &[String]) -> String {
    if main_wrapper_aliases.iter().any(|a| a == raw) {
        return "main".to_string();
    }
    match Symbol::new(raw) {
        Ok(sym) => match sym.demangle(&DemangleOptions::default()) {
            Ok(s) => s,
            Err(_) => raw.to_string(),
        },
        Err(_) => raw.to_string(),
    }
}
