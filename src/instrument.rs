// C1: assembly instrumenter. Token-stream rewrite of WASM textual assembly (the LLVM wasm-MC
// `.s` dialect: `.file`, `.functype`, `.loc`, `end_function` directives) that injects step/enter/exit
// hook calls at user-code source-line boundaries. Spec.md §4.1.
use crate::mangle::*;
use std::collections::HashSet;

pub const STEP_HOOK: &str = "step";
pub const ENTER_HOOK: &str = "enter";
pub const EXIT_HOOK: &str = "exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepMapEntry {
    pub line: usize,
    pub function: String,
}

pub struct InstrumentResult {
    pub text: String,
    pub hooks_injected: usize,
    // Dense, ordered by step id, starting at the `start_step_id` passed in.
    pub step_map: Vec<StepMapEntry>,
}

struct FunctionState {
    raw_name: String,
    skip: bool,
    stack_ready: bool,
    entered: bool,
    emit_enter_armed: bool,
    last_const: Option<i64>,
    frame_size: i64,
    sp_delta: i64,
    instrumented_lines: HashSet<(u32, usize)>,
}
impl FunctionState {
    fn new(raw_name: String, skip: bool) -> Self {
        FunctionState {raw_name, skip, stack_ready: false, entered: false, emit_enter_armed: false, last_const: None, frame_size: 0, sp_delta: 0, instrumented_lines: HashSet::new()}
    }
}

enum LineKind<'a> {
    Directive(&'a str, &'a str), // name (without leading '.'), rest of line
    EndFunction,
    Label,
    Comment,
    Instruction(&'a str, &'a str), // opcode, rest of line
}

fn classify(trimmed: &str) -> LineKind {
    if trimmed.is_empty() {
        return LineKind::Comment;
    }
    if trimmed.starts_with('#') {
        return LineKind::Comment;
    }
    if trimmed.starts_with('.') {
        let mut it = trimmed[1..].splitn(2, char::is_whitespace);
        let name = it.next().unwrap_or("");
        let rest = it.next().unwrap_or("").trim_start();
        return LineKind::Directive(name, rest);
    }
    if trimmed.ends_with(':') {
        return LineKind::Label;
    }
    let mut it = trimmed.splitn(2, char::is_whitespace);
    let first = it.next().unwrap_or("");
    if first == "end_function" {
        return LineKind::EndFunction;
    }
    if first.starts_with(|c: char| c.is_ascii_lowercase()) {
        let rest = it.next().unwrap_or("").trim_start();
        return LineKind::Instruction(first, rest);
    }
    LineKind::Comment // unknown opcode shape: pass through, never fatal (§4.1 "the instrumenter is total")
}

fn parse_file_directive(rest: &str) -> Option<(u32, String)> {
    // `<id> "path"`
    let mut it = rest.splitn(2, char::is_whitespace);
    let id: u32 = it.next()?.parse().ok()?;
    let path_part = it.next()?.trim();
    let path = path_part.trim_matches('"').to_string();
    Some((id, path))
}

fn parse_loc_directive(rest: &str) -> Option<(u32, usize, usize, bool)> {
    // `<fileId> <line> <col> [prologue_end] [...]`
    let mut parts = rest.split_whitespace();
    let file_id: u32 = parts.next()?.parse().ok()?;
    let line: usize = parts.next()?.parse().ok()?;
    let col: usize = parts.next().unwrap_or("0").parse().unwrap_or(0);
    let prologue_end = parts.any(|p| p == "prologue_end");
    Some((file_id, line, col, prologue_end))
}

fn parse_i32_const(opcode: &str, rest: &str) -> Option<i64> {
    if opcode == "i32.const" || opcode == "i64.const" {
        rest.trim().parse().ok()
    } else {
        None
    }
}

fn is_stack_pointer_update(opcode: &str, rest: &str) -> bool {
    opcode == "global.set" && rest.trim().contains("__stack_pointer")
}

pub struct InstrumentInput<'a> {
    pub assembly: &'a str,
    pub start_step_id: u32,
    pub user_code_prefix: &'a str,
    pub deny_list: &'a [String],
    pub main_wrapper_aliases: &'a [String],
}

pub fn instrument(input: InstrumentInput) -> InstrumentResult {
    let mut out = String::with_capacity(input.assembly.len() * 2);
    out.push_str(&format!(".functype {} (i32) -> ()\n", STEP_HOOK));
    out.push_str(&format!(".functype {} (i32, i32) -> ()\n", ENTER_HOOK));
    out.push_str(&format!(".functype {} () -> ()\n", EXIT_HOOK));

    let mut user_file_ids: HashSet<u32> = HashSet::new();
    let mut current_line: Option<usize> = None;
    let mut current_file_id: Option<u32> = None;
    let mut current_file_is_user = false;
    let mut func: Option<FunctionState> = None;
    let mut next_step_id = input.start_step_id;
    let mut hooks_injected = 0usize;
    let mut step_map: Vec<StepMapEntry> = Vec::new();

    for raw_line in input.assembly.lines() {
        let trimmed = raw_line.trim();
        match classify(trimmed) {
            LineKind::Directive(name, rest) => {
                if name == "file" {
                    if let Some((id, path)) = parse_file_directive(rest) {
                        if is_user_code(&path, input.user_code_prefix) {
                            user_file_ids.insert(id);
                        }
                    }
                    out.push_str(raw_line);
                    out.push('\n');
                } else if name == "functype" {
                    let fname = rest.split_whitespace().next().unwrap_or("").to_string();
                    if fname != STEP_HOOK && fname != ENTER_HOOK && fname != EXIT_HOOK {
                        let skip = input.deny_list.iter().any(|d| fname.contains(d.as_str()));
                        func = Some(FunctionState::new(fname, skip));
                    }
                    out.push_str(raw_line);
                    out.push('\n');
                } else if name == "loc" {
                    if let Some((file_id, line, _col, prologue_end)) = parse_loc_directive(rest) {
                        current_file_is_user = user_file_ids.contains(&file_id);
                        if current_file_is_user {
                            current_line = Some(line);
                            current_file_id = Some(file_id);
                        }
                        if prologue_end {
                            if let Some(f) = &mut func {
                                f.stack_ready = true;
                                if !f.skip && current_file_is_user {
                                    f.emit_enter_armed = true;
                                }
                            }
                        }
                    }
                    out.push_str(raw_line);
                    out.push('\n');
                } else {
                    out.push_str(raw_line);
                    out.push('\n');
                }
            }
            LineKind::EndFunction => {
                if let Some(f) = &func {
                    if f.entered {
                        out.push_str(&format!("call {}\n", EXIT_HOOK));
                        hooks_injected += 1;
                    }
                }
                out.push_str(raw_line);
                out.push('\n');
                func = None;
                current_line = None;
            }
            LineKind::Label | LineKind::Comment => {
                out.push_str(raw_line);
                out.push('\n');
            }
            LineKind::Instruction(opcode, rest) => {
                if let Some(f) = &mut func {
                    if !f.stack_ready {
                        if let Some(v) = parse_i32_const(opcode, rest) {
                            f.last_const = Some(v);
                        }
                        if is_stack_pointer_update(opcode, rest) {
                            if let Some(v) = f.last_const {
                                f.frame_size = v.abs();
                                f.sp_delta = v;
                            }
                        }
                    }

                    if f.emit_enter_armed {
                        out.push_str(&format!("i32.const {}\n", f.frame_size));
                        out.push_str(&format!("i32.const {}\n", f.sp_delta));
                        out.push_str(&format!("call {}\n", ENTER_HOOK));
                        f.entered = true;
                        f.emit_enter_armed = false;
                        hooks_injected += 1;
                    }

                    if opcode == "return" && f.entered {
                        out.push_str(&format!("call {}\n", EXIT_HOOK));
                        hooks_injected += 1;
                        f.entered = false;
                    }

                    if f.stack_ready && !f.skip && current_file_is_user {
                        if let (Some(line), Some(file_id)) = (current_line, current_file_id) {
                            if f.instrumented_lines.insert((file_id, line)) {
                                let step_id = next_step_id;
                                next_step_id += 1;
                                let display = demangle_function_name(&f.raw_name, input.main_wrapper_aliases);
                                step_map.push(StepMapEntry {line, function: display});
                                out.push_str(&format!("i32.const {}\n", step_id));
                                out.push_str(&format!("call {}\n", STEP_HOOK));
                                hooks_injected += 1;
                                let _ = step_id;
                            }
                        }
                    }
                }
                out.push_str(raw_line);
                out.push('\n');
            }
        }
    }

    InstrumentResult {text: out, hooks_injected, step_map}
}

fn is_user_code(path: &str, prefix: &str) -> bool {
    crate::source::is_user_code_path(path, prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(src: &str) -> InstrumentResult {
        instrument(InstrumentInput {
            assembly: src,
            start_step_id: 0,
            user_code_prefix: "/workspace/",
            deny_list: &["__wrap_malloc".to_string()],
            main_wrapper_aliases: &["__main_void".to_string()],
        })
    }

    const HELLO: &str = r#"
.file 1 "/workspace/main.cpp"
.functype __main_void () -> (i32)
__main_void:
.loc 1 2 0
global.get __stack_pointer
i32.const 16
i32.sub
global.set __stack_pointer
i32.const 0
.loc 1 2 0 prologue_end
i32.const 1
.loc 1 3 5
i32.const 2
return
end_function
"#;

    #[test]
    fn prologue_declared_once() {
        let r = assemble(HELLO);
        assert_eq!(r.text.matches(".functype step").count(), 1);
        assert_eq!(r.text.matches(".functype enter").count(), 1);
        assert_eq!(r.text.matches(".functype exit").count(), 1);
    }

    #[test]
    fn step_ids_dense_and_unique() {
        let r = assemble(HELLO);
        for (i, entry) in r.step_map.iter().enumerate() {
            assert_eq!(entry.line, if i == 0 {2} else {3});
        }
    }

    #[test]
    fn no_step_before_prologue_end() {
        let r = assemble(HELLO);
        // line 2 appears once: only the instruction at/after prologue_end is instrumented.
        assert_eq!(r.step_map.iter().filter(|e| e.line == 2).count(), 1);
    }

    #[test]
    fn enter_and_exit_balance() {
        let r = assemble(HELLO);
        assert_eq!(r.text.matches(&format!("call {}", ENTER_HOOK)).count(), 1);
        assert_eq!(r.text.matches(&format!("call {}", EXIT_HOOK)).count(), 1);
    }

    #[test]
    fn deny_listed_function_gets_no_hooks() {
        let src = r#"
.file 1 "/workspace/main.cpp"
.functype __wrap_malloc (i32) -> (i32)
__wrap_malloc:
.loc 1 10 0 prologue_end
.loc 1 11 0
i32.const 1
return
end_function
"#;
        let r = assemble(src);
        assert_eq!(r.hooks_injected, 0);
        assert!(r.step_map.is_empty());
    }

    #[test]
    fn void_function_falling_off_end_counts_exit_hook() {
        let src = r#"
.file 1 "/workspace/main.cpp"
.functype _Z4doitv () -> ()
_Z4doitv:
.loc 1 5 0 prologue_end
i32.const 1
drop
end_function
"#;
        let r = assemble(src);
        assert_eq!(r.text.matches(&format!("call {}", EXIT_HOOK)).count(), 1);
        assert_eq!(r.hooks_injected, 3); // enter + one step + exit, no explicit `return` opcode
    }

    #[test]
    fn same_line_number_in_two_files_both_instrumented() {
        let src = r#"
.file 1 "/workspace/main.cpp"
.file 2 "/workspace/widget.h"
.functype _Z3foov () -> ()
_Z3foov:
.loc 1 7 0 prologue_end
i32.const 1
.loc 2 7 0
i32.const 2
return
end_function
"#;
        let r = assemble(src);
        assert_eq!(r.step_map.iter().filter(|e| e.line == 7).count(), 2);
    }

    #[test]
    fn system_code_not_instrumented() {
        let src = r#"
.file 1 "/usr/include/vector"
.functype _ZNSt6vectorIiED2Ev () -> ()
_ZNSt6vectorIiED2Ev:
.loc 1 100 0 prologue_end
.loc 1 101 0
return
end_function
"#;
        let r = assemble(src);
        assert_eq!(r.hooks_injected, 0);
    }
}
