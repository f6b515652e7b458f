// CLI help text, kept in the teacher's `print_help_chapter` shape (one big match over the
// `--help*` flag, each arm a raw string literal) but rewritten for this system: a headless debug
// core driven from the command line, not a TUI (spec.md §1 "Non-goals": no UI). Adapted from
// `al13n321-nnd`'s `doc.rs`.
pub fn print_help_chapter(arg: &str, executable_name: &str) -> bool {
    match arg {
        "--help" => println!(r###"A debug core for an in-browser C++ teaching environment.

Compiles C++ source files to instrumented WebAssembly, runs the result under a pause/resume
bridge, and reports typed locals and heap state at each source line. Normally driven by a browser
front-end over the same control/snapshot regions this binary uses internally; this CLI exists to
exercise the pipeline headlessly (e.g. in CI, or for debugging the debug core itself).

Usage:
{0} [flags] source.cpp [source2.cpp ...]

Flags:
--workspace path   - path prefix under which sources are "user code" (default: current directory)
-c                 - run to completion without pausing at each step, printing only the final state
--help             - show this help message; see below for more help pages

At each pause (without -c): "s" steps, "b" steps back through recorded history, "c" runs to
completion, "q" stops.

Documentation chapters:
--help-overview    - how the pipeline fits together
--help-state       - files in ~/.nova-debug/ - run log and stdout/stderr capture"###,
                             executable_name),
        "--help-overview" => println!(r###"The pipeline has six stages:
 1. Each source file is compiled to WASM textual assembly by an external C++ toolchain.
 2. The assembly is instrumented: step/enter/exit hook calls are inserted at user-code source-line
    boundaries (never inside system headers or denied-list runtime functions).
 3. The instrumented assemblies are linked into one WASM module and loaded into a wasmtime
    instance, with the hooks registered as "env" imports.
 4. Running the module calls into the hooks, which publish frame state and a memory mirror into a
    pair of shared regions and then pause, spinning until resumed or stopped.
 5. On each pause, the typed memory reader recovers locals and heap allocations from the raw byte
    mirror using the DWARF type/variable tables recovered from the linked module.
 6. Pretty-printers recognize known standard-library layouts (strings, vectors) and render them as
    their logical value instead of their raw bytes.

Without -c, this CLI prints the frame/locals/heap state at every pause and waits for a line on
stdin before resuming ("s": step; "b": step back through recorded history, replaying a prior pause
without re-executing; "c": run to completion; "q": stop). Stepping forward again after a step-back
replays the recorded pause ahead of the cursor rather than resuming, until the cursor catches back
up to the live tip."###),
        "--help-state" => println!(r###"The debugger creates directory ~/.nova-debug/ and stores a few things there: the run log and
the debugged program's stdout/stderr capture, one subdirectory per run (~/.nova-debug/0/,
~/.nova-debug/1/, ...). It doesn't create any other files or make any other changes to your
system."###),
        _ => return false,
    }
    true
}
