// Configuration for a debug session. Parsed by hand from argv in main.rs, the same way the teacher
// hand-parses its own argv instead of reaching for an args-parsing crate.
#[derive(Clone)]
pub struct Settings {
    // Path prefix (inside the virtual filesystem the editor/front-end own) under which sources are
    // "user code". Everything else -- sysroot headers, compiler-runtime shims -- is "system code".
    pub user_code_prefix: String,

    // Aliases for the post-link main() wrapper emitted by the toolchain. Version-dependent (spec.md
    // Open Question, resolved in DESIGN.md): kept as configuration rather than a single hardcoded name.
    pub main_wrapper_aliases: Vec<String>,

    // Function name substrings/exact names never instrumented: allocator wrappers, language
    // runtime enter/exit thunks, operator new/delete overloads.
    pub instrumentation_deny_list: Vec<String>,

    // Compile worker pool size cap (actual pool size is min(this, available_parallelism, source_count)).
    pub max_compile_workers: usize,

    // Cap on inspector polling / event-processing time slice, to stay responsive when hooks fire rapidly.
    pub periodic_timer_ns: usize,

    // Max number of allocations read from the in-program tracker per snapshot.
    pub max_tracked_allocations: usize,

    // Max elements read inline for a pretty-printed dynamic array.
    pub max_array_elements: usize,

    // Max recursion depth for struct member reads and type-name resolution.
    pub max_type_depth: usize,

    pub trace_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            user_code_prefix: "/workspace/".to_string(),
            main_wrapper_aliases: vec!["__main_void".to_string(), "main".to_string()],
            instrumentation_deny_list: vec![
                "__wrap_malloc".to_string(),
                "__wrap_free".to_string(),
                "__cxa_".to_string(),
                "operator new".to_string(),
                "operator delete".to_string(),
                "__cxx_global_var_init".to_string(),
            ],
            max_compile_workers: 4,
            periodic_timer_ns: 250_000_000,
            max_tracked_allocations: 1024,
            max_array_elements: 50,
            max_type_depth: 10,
            trace_logging: false,
        }
    }
}
