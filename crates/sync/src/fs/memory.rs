use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::DurableFileSystem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsOp {
    CreateDir,
    Exists,
    Read,
    Write,
    Rename,
    Remove,
}

/// What an injected fault does when it fires.
#[derive(Debug, Clone)]
pub enum FaultAction {
    Fail(io::ErrorKind, String),
    /// Report success without touching state (writes only).
    SilentDrop,
}

#[derive(Debug, Clone)]
struct Fault {
    op: FsOp,
    path_fragment: Option<String>,
    action: FaultAction,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<PathBuf, String>,
    dirs: BTreeSet<PathBuf>,
    faults: Vec<Fault>,
    calls: HashMap<FsOp, usize>,
}

/// In-memory [`DurableFileSystem`] with one-shot fault injection.
///
/// Writes and renames require the parent directory to exist, like a real
/// filesystem, so missing `create_dir_all` calls surface in tests.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    state: Mutex<MemoryState>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a one-shot fault for the next `op` whose path contains
    /// `path_fragment` (any path when `None`).
    pub fn inject(&self, op: FsOp, path_fragment: Option<&str>, action: FaultAction) {
        self.state().faults.push(Fault {
            op,
            path_fragment: path_fragment.map(str::to_string),
            action,
        });
    }

    pub fn fail_next(&self, op: FsOp, path_fragment: Option<&str>, kind: io::ErrorKind, msg: &str) {
        self.inject(op, path_fragment, FaultAction::Fail(kind, msg.to_string()));
    }

    pub fn pending_faults(&self) -> usize {
        self.state().faults.len()
    }

    pub fn calls(&self, op: FsOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<String> {
        self.state().files.get(path.as_ref()).cloned()
    }

    /// Seed a file directly, creating its parent directories.
    pub fn put(&self, path: impl AsRef<Path>, contents: &str) {
        let path = path.as_ref();
        let mut state = self.state();
        if let Some(parent) = path.parent() {
            insert_ancestors(&mut state.dirs, parent);
        }
        state.files.insert(path.to_path_buf(), contents.to_string());
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.state().files.keys().cloned().collect()
    }

    fn begin(&self, op: FsOp, paths: &[&Path]) -> Option<FaultAction> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        let position = state.faults.iter().position(|fault| {
            fault.op == op
                && match &fault.path_fragment {
                    None => true,
                    Some(fragment) => paths
                        .iter()
                        .any(|path| path.to_string_lossy().contains(fragment.as_str())),
                }
        })?;
        Some(state.faults.remove(position).action)
    }
}

fn insert_ancestors(dirs: &mut BTreeSet<PathBuf>, path: &Path) {
    for ancestor in path.ancestors() {
        if ancestor.as_os_str().is_empty() {
            break;
        }
        dirs.insert(ancestor.to_path_buf());
    }
}

fn parent_exists(state: &MemoryState, path: &Path) -> bool {
    match path.parent() {
        None => true,
        Some(parent) if parent.as_os_str().is_empty() => true,
        Some(parent) => state.dirs.contains(parent),
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such file or directory: {}", path.display()),
    )
}

fn injected(action: FaultAction) -> Option<io::Error> {
    match action {
        FaultAction::Fail(kind, message) => Some(io::Error::new(kind, message)),
        FaultAction::SilentDrop => None,
    }
}

#[async_trait]
impl DurableFileSystem for MemoryFileSystem {
    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        if let Some(action) = self.begin(FsOp::CreateDir, &[path]) {
            if let Some(err) = injected(action) {
                return Err(err);
            }
            return Ok(());
        }
        insert_ancestors(&mut self.state().dirs, path);
        Ok(())
    }

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        if let Some(err) = self.begin(FsOp::Exists, &[path]).and_then(injected) {
            return Err(err);
        }
        let state = self.state();
        Ok(state.files.contains_key(path) || state.dirs.contains(path))
    }

    async fn read(&self, path: &Path) -> io::Result<String> {
        if let Some(err) = self.begin(FsOp::Read, &[path]).and_then(injected) {
            return Err(err);
        }
        self.state()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    async fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        if let Some(action) = self.begin(FsOp::Write, &[path]) {
            if let Some(err) = injected(action) {
                return Err(err);
            }
            return Ok(());
        }
        let mut state = self.state();
        if !parent_exists(&state, path) {
            return Err(not_found(path));
        }
        state.files.insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(err) = self.begin(FsOp::Rename, &[from, to]).and_then(injected) {
            return Err(err);
        }
        let mut state = self.state();
        if !parent_exists(&state, to) {
            return Err(not_found(to));
        }
        let contents = state.files.remove(from).ok_or_else(|| not_found(from))?;
        state.files.insert(to.to_path_buf(), contents);
        Ok(())
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        if let Some(err) = self.begin(FsOp::Remove, &[path]).and_then(injected) {
            return Err(err);
        }
        self.state()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }
}
