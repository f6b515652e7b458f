// Concrete `CompileBackend` (spec.md §1/§6: "external C++ compiler, consumed as a black-box
// command"). Shells out to a wasm32-wasi capable clang, the way a real deployment would invoke
// emscripten/wasi-sdk: one `clang++ -S -g` per source for assembly, one link step to produce the
// module `host.rs` loads. `compile.rs`'s own tests use a `FakeBackend`; this is the backend
// `main.rs` wires in for an actual run.
use crate::compile::CompileBackend;
use crate::error::*;
use crate::source::SourceFile;
use std::process::Command;

pub struct ClangBackend {
    pub clang_path: String,
    pub target: String,
}

impl ClangBackend {
    pub fn new() -> Self {
        ClangBackend {
            clang_path: std::env::var("NOVA_CLANG").unwrap_or_else(|_| "clang++".to_string()),
            target: "wasm32-wasi".to_string(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.clang_path)
            .args(args)
            .output()
            .map_err(|e| Error::new(ErrorKind::Environment, format!("failed to run {}: {}", self.clang_path, e)))
    }
}

impl Default for ClangBackend {
    fn default() -> Self { Self::new() }
}

impl CompileBackend for ClangBackend {
    // The real sysroot (wasi-sdk's libc++ headers and archives) is expected preinstalled
    // alongside the toolchain; nothing to seed here for a headless run.
    fn seed_sysroot(&self) -> Result<()> { Ok(()) }

    // A shared precompiled header would speed up a large workspace; not worth it for the handful
    // of files a headless run typically compiles.
    fn generate_pch(&self) -> Result<()> { Ok(()) }

    fn compile_to_asm(&self, source: &SourceFile) -> Result<String> {
        let output = self.run(&[
            "--target", &self.target,
            "-S", "-g", "-O0", "-std=c++17",
            "-o", "-",
            &source.path,
        ])?;
        if !output.status.success() {
            return err!(Compile, "{}: {}", source.path, String::from_utf8_lossy(&output.stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn link(&self, assemblies: &[(String, String)]) -> Result<Vec<u8>> {
        let dir = std::env::temp_dir().join(format!("nova-debug-link-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let mut paths = Vec::with_capacity(assemblies.len());
        for (i, (_path, asm)) in assemblies.iter().enumerate() {
            let p = dir.join(format!("{}.s", i));
            std::fs::write(&p, asm)?;
            paths.push(p);
        }
        let out_path = dir.join("out.wasm");

        let mut args: Vec<String> = vec!["--target".to_string(), self.target.clone()];
        for p in &paths {
            args.push(p.to_string_lossy().into_owned());
        }
        // The step/enter/exit/notify_alloc/notify_free/clear/draw_circle/render_frame imports are
        // resolved by the host at instantiation time (`host.rs`), not at link time.
        args.push("-Wl,--allow-undefined".to_string());
        args.push("-Wl,--export-all".to_string());
        args.push("-o".to_string());
        args.push(out_path.to_string_lossy().into_owned());

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = self.run(&arg_refs)?;
        if !output.status.success() {
            let _ = std::fs::remove_dir_all(&dir);
            return err!(Compile, "link failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        let wasm = std::fs::read(&out_path)?;
        let _ = std::fs::remove_dir_all(&dir);
        Ok(wasm)
    }
}
