// Thin CLI driver wiring C1-C6 together (spec.md §2 ambient layer: "hand-parsed std::env::args()
// loop with a --help/--help-* chapter dispatcher", the same shape as the teacher's own argv
// handling in its entry point).
use nova_debug_core::compile::CompileOrchestrator;
use nova_debug_core::context::Context;
use nova_debug_core::dwarf;
use nova_debug_core::error::*;
use nova_debug_core::host::DebugRun;
use nova_debug_core::memview;
use nova_debug_core::persistent::PersistentState;
use nova_debug_core::settings::Settings;
use nova_debug_core::source::SourceFile;
use nova_debug_core::toolchain::ClangBackend;
use nova_debug_core::{doc, log};
use std::collections::HashMap;
use std::io::BufRead;

struct Args {
    workspace: String,
    run_to_completion: bool,
    sources: Vec<String>,
}

fn parse_args(argv: &[String], executable_name: &str) -> std::result::Result<Option<Args>, ()> {
    let mut workspace = std::env::current_dir().map(|p| p.to_string_lossy().into_owned() + "/").unwrap_or_else(|_| "/workspace/".to_string());
    let mut run_to_completion = false;
    let mut sources = Vec::new();

    let mut it = argv.iter();
    while let Some(arg) = it.next() {
        if arg.starts_with("--help") {
            if !doc::print_help_chapter(arg, executable_name) {
                eprintln!("error: unknown help chapter: {}", arg);
            }
            return Ok(None);
        }
        match arg.as_str() {
            "--workspace" => {
                workspace = it.next().ok_or_else(|| eprintln!("error: --workspace requires a path")).map_err(|_| ())?.clone();
            }
            "-c" => run_to_completion = true,
            other if other.starts_with('-') => {
                eprintln!("error: unknown flag: {}", other);
                return Err(());
            }
            other => sources.push(other.to_string()),
        }
    }

    if sources.is_empty() {
        eprintln!("error: no source files given; try --help");
        return Err(());
    }
    Ok(Some(Args {workspace, run_to_completion, sources}))
}

fn read_sources(paths: &[String]) -> Result<Vec<SourceFile>> {
    paths.iter().map(|p| {
        let content = std::fs::read_to_string(p)?;
        Ok(SourceFile {path: p.clone(), content})
    }).collect()
}

fn print_frame(frame: &memview::FrameSnapshot) {
    println!("  {} (line {})", frame.function, frame.line);
    for local in &frame.locals {
        print_value(local, 4);
    }
}

fn print_value(value: &memview::MemoryValue, indent: usize) {
    let pad = " ".repeat(indent);
    println!("{}{}: {} = {}", pad, value.name, value.resolved_type, value.display_value);
    for child in &value.children {
        print_value(child, indent + 2);
    }
}

fn print_heap(heap: &[memview::HeapAllocation]) {
    for alloc in heap {
        println!("  0x{:x} ({} bytes): {}", alloc.address, alloc.size, alloc.type_name);
        for member in &alloc.members {
            print_value(member, 4);
        }
    }
}

fn run(args: Args) -> Result<()> {
    let persistent = PersistentState::create_new()?;
    let mut session_log = log::Log::new();
    log!(session_log, "starting session, workspace={}", args.workspace);

    let settings = Settings {user_code_prefix: args.workspace.clone(), ..Settings::default()};
    let ctx = Context::new(settings.clone());

    let sources = read_sources(&args.sources)?;
    let backend = ClangBackend::new();
    let orchestrator = CompileOrchestrator::new();
    let outcome = orchestrator.compile_and_link(&ctx, &backend, sources, "cli-session")?;
    log!(session_log, "compiled and linked {} bytes of wasm, {} step map entries", outcome.wasm.len(), outcome.step_map.len());

    let debug_sections = dwarf::extract_debug_sections(&outcome.wasm)?;
    let dwarf_info = dwarf::parse(&debug_sections);

    let engine = wasmtime::Engine::default();
    let module = wasmtime::Module::new(&engine, &outcome.wasm)
        .map_err(|e| Error::new(ErrorKind::Environment, format!("failed to load module: {}", e)))?;
    let mut debug_run = DebugRun::new(&engine, &module, outcome.step_map)?;
    let mut inspector = debug_run.inspector();

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    let mut pointer_types: HashMap<usize, String> = HashMap::new();

    std::thread::scope(|scope| {
        let handle = scope.spawn(|| debug_run.run_to_completion());

        'outer: loop {
            let live = loop {
                if let Some(live) = inspector.poll() {
                    break Some(live);
                }
                if handle.is_finished() {
                    break None;
                }
                std::hint::spin_loop();
            };
            let Some((bytes, frames, step_id, tracker)) = live else {
                break;
            };
            let (snapshot, next_pointer_types) = memview::read_snapshot(&bytes, &dwarf_info, &frames, tracker, pointer_types.clone(), &settings);
            pointer_types = next_pointer_types;

            println!("--- paused at step {} ---", step_id);
            for frame in snapshot.frames.iter().rev() {
                print_frame(frame);
            }
            print_heap(&snapshot.heap);

            if args.run_to_completion {
                inspector.resume();
                continue;
            }

            // step/back navigate the recorded step history without touching the executor until a
            // genuine "step" at the live tip (or "continue") resumes it (spec.md §6, §8 scenario 6).
            loop {
                print!("(s)tep / (b)ack / (c)ontinue / (q)uit > ");
                use std::io::Write;
                let _ = std::io::stdout().flush();
                let Some(Ok(line)) = lines.next() else {
                    inspector.stop();
                    break 'outer;
                };
                match line.trim() {
                    "q" => {
                        inspector.stop();
                        break 'outer;
                    }
                    "b" => match inspector.step_back() {
                        Some(state) => {
                            let (snapshot, _) = memview::read_snapshot(&state.bytes, &dwarf_info, &state.frames, state.tracker, pointer_types.clone(), &settings);
                            println!("--- stepped back to step {} ---", state.step_id);
                            for frame in snapshot.frames.iter().rev() {
                                print_frame(frame);
                            }
                            print_heap(&snapshot.heap);
                        }
                        None => println!("already at the oldest recorded step"),
                    },
                    "s" if !inspector.at_live_tip() => {
                        let state = inspector.step_forward_in_history().expect("at_live_tip just checked false");
                        let (snapshot, _) = memview::read_snapshot(&state.bytes, &dwarf_info, &state.frames, state.tracker, pointer_types.clone(), &settings);
                        println!("--- replaying step {} ---", state.step_id);
                        for frame in snapshot.frames.iter().rev() {
                            print_frame(frame);
                        }
                        print_heap(&snapshot.heap);
                    }
                    _ => {
                        inspector.resume();
                        break;
                    }
                }
            }
        }

        match handle.join() {
            Ok(result) => result,
            Err(_) => err!(Internal, "execution thread panicked"),
        }
    })?;

    log!(session_log, "session complete");
    for line in &session_log.lines {
        if let Ok(mut f) = persistent.open_or_create_file("log") {
            use std::io::Write;
            let _ = writeln!(f, "{}", line.text);
        }
    }
    Ok(())
}

fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let executable_name = argv.first().cloned().unwrap_or_else(|| "nova-debug-core".to_string());
    let args = match parse_args(&argv[1..], &executable_name) {
        Ok(Some(a)) => a,
        Ok(None) => return,
        Err(()) => std::process::exit(1),
    };

    if let Err(e) = run(args) {
        eprintln!("error: {}", e.message);
        std::process::exit(1);
    }
}
