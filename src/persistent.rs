use crate::error::*;
use std::fs;
use std::path::PathBuf;

// One directory per debug session under ~/.nova-debug/<n>/, for the debuggee's stdout/stderr capture
// and the session log dump. Grounded on the teacher's PersistentState (~/.nnd/<n>/stdout etc.),
// distinct from the UI's own "persistence to local storage", which is out of scope (spec.md §1).
pub struct PersistentState {
    dir: PathBuf,
}

impl PersistentState {
    pub fn create_new() -> Result<Self> {
        let base = dirs_home().join(".nova-debug");
        fs::create_dir_all(&base)?;
        for n in 0usize.. {
            let dir = base.join(n.to_string());
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(PersistentState {dir}),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!()
    }

    pub fn open_or_create_file(&self, name: &str) -> Result<fs::File> {
        Ok(fs::OpenOptions::new().create(true).write(true).truncate(true).open(self.dir.join(name))?)
    }

    pub fn dir(&self) -> &std::path::Path { &self.dir }
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}
