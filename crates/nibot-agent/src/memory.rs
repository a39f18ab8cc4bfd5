//! Long-term memory notes — a `MEMORY.md` the agent maintains through its
//! file tools, injected into every system prompt.

use std::path::{Path, PathBuf};

pub struct MemoryStore {
    memory_file: PathBuf,
}

impl MemoryStore {
    /// Memory lives at `<workspace>/memory/MEMORY.md`. Nothing is created
    /// until the agent writes its first note.
    pub fn new(workspace: &Path) -> Self {
        MemoryStore {
            memory_file: workspace.join("memory").join("MEMORY.md"),
        }
    }

    pub fn memory_file(&self) -> &Path {
        &self.memory_file
    }

    /// The memory block for the system prompt, or `None` when no notes
    /// exist yet.
    pub fn get_context(&self) -> Option<String> {
        let content = std::fs::read_to_string(&self.memory_file).ok()?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(format!("## Long-term Memory\n\n{trimmed}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_memory_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        assert!(store.get_context().is_none());
    }

    #[test]
    fn test_empty_memory_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("memory")).unwrap();
        std::fs::write(dir.path().join("memory/MEMORY.md"), "  \n").unwrap();
        let store = MemoryStore::new(dir.path());
        assert!(store.get_context().is_none());
    }

    #[test]
    fn test_memory_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("memory")).unwrap();
        std::fs::write(dir.path().join("memory/MEMORY.md"), "User prefers dark mode.").unwrap();
        let store = MemoryStore::new(dir.path());
        let ctx = store.get_context().unwrap();
        assert!(ctx.contains("Long-term Memory"));
        assert!(ctx.contains("User prefers dark mode."));
    }
}
