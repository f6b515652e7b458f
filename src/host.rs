// Supplemental "ambient execution host" piece (spec.md §4.4, §6): wires the engine-agnostic
// debug bridge into a concrete `wasmtime` instance as `env` imports, plus the narrow WASI
// preview-1 subset spec.md §6 names. `wasmtime` is present in the retrieval pack
// (`bytecodealliance-wasmtime`) and is the natural concrete execution host for a Rust build of
// this system; the execution host itself remains an external collaborator per spec.md §1 -- this
// is only the glue the core needs to be runnable end-to-end. This is the one module in the crate
// that depends on `wasmtime`.
use crate::bridge::{ControlRegion, ExecutorBridge, SnapshotRegion, Stop, CONTROL_MIN_SLOTS};
use crate::error::*;
use crate::instrument::StepMapEntry;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU64, Ordering};
use wasmtime::{Caller, Engine, Instance, Linker, Module, Store};

const DEFAULT_SNAPSHOT_CAPACITY: usize = 1 << 20;

struct HostState {
    bridge: ExecutorBridge<'static>,
}

// Owns the shared regions and `wasmtime` plumbing for a single debug execution. The regions are
// intentionally leaked to `'static`: they live for exactly one execution (spec.md §5 "Shared
// regions live for one execution"), and leaking them sidesteps threading a lifetime through
// `Store<T: 'static>` for what is, in practice, session-scoped memory anyway.
pub struct DebugRun {
    store: Store<HostState>,
    instance: Instance,
    control: &'static [AtomicI32],
    snapshot: &'static [AtomicU8],
    step_map: &'static [StepMapEntry],
}

impl DebugRun {
    pub fn new(engine: &Engine, module: &Module, step_map: Vec<StepMapEntry>) -> Result<Self> {
        let control: &'static [AtomicI32] =
            Box::leak((0..CONTROL_MIN_SLOTS).map(|_| AtomicI32::new(0)).collect::<Vec<_>>().into_boxed_slice());
        let snapshot: &'static [AtomicU8] =
            Box::leak((0..DEFAULT_SNAPSHOT_CAPACITY).map(|_| AtomicU8::new(0)).collect::<Vec<_>>().into_boxed_slice());
        let step_map: &'static [StepMapEntry] = Box::leak(step_map.into_boxed_slice());

        let bridge = ExecutorBridge::new(ControlRegion::new(control), SnapshotRegion::new(snapshot), step_map);
        let mut store = Store::new(engine, HostState {bridge});

        let mut linker = Linker::new(engine);
        register_env_imports(&mut linker)?;
        register_wasi_subset(&mut linker)?;

        let instance = linker.instantiate(&mut store, module)
            .map_err(|e| Error::new(ErrorKind::Environment, format!("failed to instantiate module: {}", e)))?;

        Ok(DebugRun {store, instance, control, snapshot, step_map})
    }

    // Runs the module to completion (or trap). WASI's `proc_exit` and the stop sentinel both
    // terminate execution; a normal return is treated as clean termination (spec.md §7
    // "Executor sentinel ... report normal termination").
    pub fn run_to_completion(&mut self) -> Result<()> {
        let start = self.instance.get_typed_func::<(), ()>(&mut self.store, "_start")
            .map_err(|e| Error::new(ErrorKind::Environment, format!("missing _start export: {}", e)))?;
        start.call(&mut self.store, ())
            .map_err(|e| Error::new(ErrorKind::Environment, format!("execution trapped: {}", e)))?;
        Ok(())
    }

    // A fresh view over this run's shared regions for the inspector's polling task, independent
    // of the executor's `Store` (spec.md §5: inspector and executor are two logical threads).
    pub fn inspector(&self) -> crate::bridge::InspectorBridge<'static> {
        crate::bridge::InspectorBridge::new(ControlRegion::new(self.control), SnapshotRegion::new(self.snapshot), self.step_map)
    }
}

fn read_global_i32(caller: &mut Caller<'_, HostState>, name: &str) -> i32 {
    caller.get_export(name)
        .and_then(|e| e.into_global())
        .and_then(|g| g.get(&mut *caller).i32())
        .unwrap_or(0)
}

fn register_env_imports(linker: &mut Linker<HostState>) -> Result<()> {
    linker.func_wrap("env", "step", |mut caller: Caller<'_, HostState>, step_id: i32| -> i32 {
        let memory = match caller.get_export("memory").and_then(|e| e.into_memory()) {
            Some(m) => m,
            None => return 0,
        };
        let stack_pointer = read_global_i32(&mut caller, "__stack_pointer");
        let allocs_ptr = read_global_i32(&mut caller, "__nova_allocs");
        let count_ptr = read_global_i32(&mut caller, "__nova_alloc_count");
        let bytes = memory.data(&caller).to_vec();
        let result = caller.data_mut().bridge.on_step(step_id as u32, &bytes, stack_pointer, allocs_ptr, count_ptr);
        // A nonzero return tells the instrumented call site's trampoline to unwind via the stop
        // sentinel rather than continue (spec.md §9: sentinel result instead of exceptions).
        match result {
            Ok(()) => 0,
            Err(Stop) => 1,
        }
    }).map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register step hook: {}", e)))?;

    linker.func_wrap("env", "enter", |mut caller: Caller<'_, HostState>, frame_size: i32, sp_delta: i32| {
        let sp = read_global_i32(&mut caller, "__stack_pointer");
        caller.data_mut().bridge.on_enter(frame_size, sp_delta, sp);
    }).map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register enter hook: {}", e)))?;

    linker.func_wrap("env", "exit", |mut caller: Caller<'_, HostState>| {
        caller.data_mut().bridge.on_exit();
    }).map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register exit hook: {}", e)))?;

    linker.func_wrap("env", "notify_alloc", |_: Caller<'_, HostState>, _ptr: i32, _size: i32| {})
        .map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register notify_alloc: {}", e)))?;
    linker.func_wrap("env", "notify_free", |_: Caller<'_, HostState>, _ptr: i32| {})
        .map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register notify_free: {}", e)))?;

    // Drawing primitives and the pacer are owned by the canvas front-end, out of scope for the
    // core (spec.md §1); stubbed as no-ops so a debug-build module still links and runs headless.
    linker.func_wrap("env", "clear", |_: Caller<'_, HostState>| {})
        .map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register clear: {}", e)))?;
    linker.func_wrap("env", "draw_circle", |_: Caller<'_, HostState>, _x: i32, _y: i32, _r: i32, _color_ptr: i32| {})
        .map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register draw_circle: {}", e)))?;
    linker.func_wrap("env", "render_frame", |_: Caller<'_, HostState>| {})
        .map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register render_frame: {}", e)))?;

    Ok(())
}

fn rand_byte() -> u8 {
    static STATE: AtomicU64 = AtomicU64::new(0x9E3779B97F4A7C15);
    let mut x = STATE.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    STATE.store(x, Ordering::Relaxed);
    (x & 0xff) as u8
}

// The narrow WASI preview-1 subset spec.md §6 names: `fd_write` for stdout/stderr, argc/env
// null, a clock, random fill, and proc_exit. Hand-wired directly rather than pulling in the full
// `wasmtime-wasi` crate, since the core needs only these seven calls.
fn register_wasi_subset(linker: &mut Linker<HostState>) -> Result<()> {
    const NS: &str = "wasi_snapshot_preview1";

    linker.func_wrap(NS, "fd_write", |mut caller: Caller<'_, HostState>, fd: i32, iovs_ptr: i32, iovs_len: i32, nwritten_ptr: i32| -> i32 {
        let memory = match caller.get_export("memory").and_then(|e| e.into_memory()) {
            Some(m) => m,
            None => return 8,
        };
        let mut total: u32 = 0;
        for i in 0..iovs_len {
            let entry = (iovs_ptr + i * 8) as usize;
            let data = memory.data(&caller);
            if entry + 8 > data.len() {
                break;
            }
            let ptr = u32::from_le_bytes(data[entry..entry + 4].try_into().unwrap()) as usize;
            let len = u32::from_le_bytes(data[entry + 4..entry + 8].try_into().unwrap()) as usize;
            if ptr + len > data.len() {
                break;
            }
            let text = String::from_utf8_lossy(&data[ptr..ptr + len]).into_owned();
            if fd == 1 { print!("{}", text); } else { eprint!("{}", text); }
            total += len as u32;
        }
        let _ = memory.write(&mut caller, nwritten_ptr as usize, &total.to_le_bytes());
        0
    }).map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register fd_write: {}", e)))?;

    linker.func_wrap(NS, "clock_time_get", |_: Caller<'_, HostState>, _id: i32, _precision: i64, _out_ptr: i32| -> i32 { 0 })
        .map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register clock_time_get: {}", e)))?;

    linker.func_wrap(NS, "random_get", |mut caller: Caller<'_, HostState>, buf_ptr: i32, buf_len: i32| -> i32 {
        let memory = match caller.get_export("memory").and_then(|e| e.into_memory()) {
            Some(m) => m,
            None => return 8,
        };
        let bytes: Vec<u8> = (0..buf_len).map(|_| rand_byte()).collect();
        let _ = memory.write(&mut caller, buf_ptr as usize, &bytes);
        0
    }).map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register random_get: {}", e)))?;

    linker.func_wrap(NS, "proc_exit", |_: Caller<'_, HostState>, code: i32| {
        std::process::exit(code);
    }).map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register proc_exit: {}", e)))?;

    linker.func_wrap(NS, "args_sizes_get", |mut caller: Caller<'_, HostState>, argc_ptr: i32, argv_buf_size_ptr: i32| -> i32 {
        let memory = match caller.get_export("memory").and_then(|e| e.into_memory()) {
            Some(m) => m,
            None => return 8,
        };
        let _ = memory.write(&mut caller, argc_ptr as usize, &0i32.to_le_bytes());
        let _ = memory.write(&mut caller, argv_buf_size_ptr as usize, &0i32.to_le_bytes());
        0
    }).map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register args_sizes_get: {}", e)))?;

    linker.func_wrap(NS, "args_get", |_: Caller<'_, HostState>, _argv_ptr: i32, _argv_buf_ptr: i32| -> i32 { 0 })
        .map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register args_get: {}", e)))?;

    linker.func_wrap(NS, "environ_sizes_get", |mut caller: Caller<'_, HostState>, count_ptr: i32, buf_size_ptr: i32| -> i32 {
        let memory = match caller.get_export("memory").and_then(|e| e.into_memory()) {
            Some(m) => m,
            None => return 8,
        };
        let _ = memory.write(&mut caller, count_ptr as usize, &0i32.to_le_bytes());
        let _ = memory.write(&mut caller, buf_size_ptr as usize, &0i32.to_le_bytes());
        0
    }).map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register environ_sizes_get: {}", e)))?;

    linker.func_wrap(NS, "environ_get", |_: Caller<'_, HostState>, _environ_ptr: i32, _environ_buf_ptr: i32| -> i32 { 0 })
        .map_err(|e| Error::new(ErrorKind::Environment, format!("failed to register environ_get: {}", e)))?;

    Ok(())
}
