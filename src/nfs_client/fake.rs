//! An in-memory [`NfsClient`] used by this crate's own test suite.
//!
//! Grounded on the teacher repository's `examples/in_memory/filesystem.rs`
//! (`InMemoryVfs`): a flat `HashMap` keyed by normalised path, the same
//! shape that example uses for its `nodes` table, reimplemented against
//! this crate's `NfsClient` seam instead of `vfs::Vfs`. Exists purely to let
//! the dispatcher be exercised end-to-end without a reachable NFS export —
//! nothing about it is specific to a particular remote server.
//!
//! Every method takes `&self`: the whole filesystem lives behind one
//! `RefCell`, borrowed only for the duration of a single synchronous
//! lookup/mutation and never across an `await` (there is nothing to await
//! here — every operation resolves immediately), so two operations can be
//! in flight against this client at once without risking a `BorrowMutError`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use super::{AccessMode, Attr, DirEntry, DirHandle, Error, FileHandle, FileType, NfsClient, Result, Time};

struct Node {
    is_dir: bool,
    mode: u32,
    data: Vec<u8>,
}

struct State {
    nodes: HashMap<String, Node>,
    open_files: HashMap<u64, String>,
    open_dirs: HashMap<u64, (Vec<DirEntry>, usize)>,
    next_handle: u64,
    mounted: bool,
}

/// A tiny in-memory filesystem standing in for a real NFS export.
pub struct InMemoryNfsClient {
    state: RefCell<State>,
}

impl Default for InMemoryNfsClient {
    fn default() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node { is_dir: true, mode: 0o755, data: Vec::new() });
        Self {
            state: RefCell::new(State { nodes, open_files: HashMap::new(), open_dirs: HashMap::new(), next_handle: 0, mounted: false }),
        }
    }
}

impl InMemoryNfsClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(path: &str) -> String {
        if path.is_empty() || path == "/" {
            return "/".to_string();
        }
        let trimmed = path.trim_end_matches('/');
        if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        }
    }

    fn parent_of(path: &str) -> String {
        match path.rfind('/') {
            Some(0) => "/".to_string(),
            Some(i) => path[..i].to_string(),
            None => "/".to_string(),
        }
    }

    fn attr_of(node: &Node) -> Attr {
        let now = Self::now();
        Attr {
            file_type: if node.is_dir { FileType::Directory } else { FileType::Regular },
            mode: node.mode,
            size: node.data.len() as u64,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    fn now() -> Time {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Time { seconds: since_epoch.as_secs() as i64, nanos: since_epoch.subsec_nanos() }
    }

    fn children_of(state: &State, dir: &str) -> Vec<DirEntry> {
        let mut names: Vec<String> = state
            .nodes
            .keys()
            .filter(|key| key.as_str() != "/" && Self::parent_of(key) == dir)
            .map(|key| key.rsplit('/').next().unwrap_or(key).to_string())
            .collect();
        names.sort();
        names.into_iter().enumerate().map(|(i, name)| DirEntry { name, cookie: i as u64 + 1 }).collect()
    }
}

#[async_trait(?Send)]
impl NfsClient for InMemoryNfsClient {
    async fn mount(&self) -> Result<()> {
        self.state.borrow_mut().mounted = true;
        Ok(())
    }

    async fn unmount(&self) {
        let mut s = self.state.borrow_mut();
        s.mounted = false;
        s.open_files.clear();
        s.open_dirs.clear();
    }

    async fn lookup(&self, path: &str) -> Result<Attr> {
        let key = Self::normalize(path);
        let s = self.state.borrow();
        s.nodes.get(&key).map(Self::attr_of).ok_or(Error::NoEntry)
    }

    async fn open(&self, path: &str, access: AccessMode, create: bool, mode: u32) -> Result<(FileHandle, Attr)> {
        let _ = access;
        let key = Self::normalize(path);
        let mut s = self.state.borrow_mut();
        if !s.nodes.contains_key(&key) {
            if !create {
                return Err(Error::NoEntry);
            }
            let parent = Self::parent_of(&key);
            if !s.nodes.get(&parent).map(|n| n.is_dir).unwrap_or(false) {
                return Err(Error::NoEntry);
            }
            s.nodes.insert(key.clone(), Node { is_dir: false, mode, data: Vec::new() });
        }
        let node = s.nodes.get(&key).expect("just inserted or already present");
        if node.is_dir {
            return Err(Error::IsDir);
        }
        let attr = Self::attr_of(node);
        let handle = s.next_handle;
        s.next_handle += 1;
        s.open_files.insert(handle, key);
        Ok((FileHandle(handle), attr))
    }

    async fn close(&self, file: FileHandle) -> Result<()> {
        self.state.borrow_mut().open_files.remove(&file.0).ok_or(Error::StaleFile)?;
        Ok(())
    }

    async fn fstat(&self, file: FileHandle) -> Result<Attr> {
        let s = self.state.borrow();
        let key = s.open_files.get(&file.0).ok_or(Error::StaleFile)?;
        s.nodes.get(key).map(Self::attr_of).ok_or(Error::StaleFile)
    }

    async fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let s = self.state.borrow();
        let key = s.open_files.get(&file.0).ok_or(Error::StaleFile)?;
        let node = s.nodes.get(key).ok_or(Error::StaleFile)?;
        let offset = offset as usize;
        if offset >= node.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(node.data.len() - offset);
        buf[..n].copy_from_slice(&node.data[offset..offset + n]);
        Ok(n)
    }

    async fn write(&self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut s = self.state.borrow_mut();
        let key = s.open_files.get(&file.0).ok_or(Error::StaleFile)?.clone();
        let node = s.nodes.get_mut(&key).ok_or(Error::StaleFile)?;
        let offset = offset as usize;
        let end = offset + buf.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    async fn truncate(&self, file: FileHandle, length: u64) -> Result<()> {
        let mut s = self.state.borrow_mut();
        let key = s.open_files.get(&file.0).ok_or(Error::StaleFile)?.clone();
        let node = s.nodes.get_mut(&key).ok_or(Error::StaleFile)?;
        node.data.resize(length as usize, 0);
        Ok(())
    }

    async fn fsync(&self, file: FileHandle) -> Result<()> {
        if self.state.borrow().open_files.contains_key(&file.0) {
            Ok(())
        } else {
            Err(Error::StaleFile)
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let key = Self::normalize(path);
        let mut s = self.state.borrow_mut();
        match s.nodes.get(&key) {
            Some(node) if node.is_dir => Err(Error::IsDir),
            Some(_) => {
                s.nodes.remove(&key);
                Ok(())
            }
            None => Err(Error::NoEntry),
        }
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let old_key = Self::normalize(old_path);
        let new_key = Self::normalize(new_path);
        let mut s = self.state.borrow_mut();
        let node = s.nodes.remove(&old_key).ok_or(Error::NoEntry)?;
        s.nodes.insert(new_key, node);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let key = Self::normalize(path);
        let mut s = self.state.borrow_mut();
        if s.nodes.contains_key(&key) {
            return Err(Error::Exist);
        }
        let parent = Self::parent_of(&key);
        if !s.nodes.get(&parent).map(|n| n.is_dir).unwrap_or(false) {
            return Err(Error::NoEntry);
        }
        s.nodes.insert(key, Node { is_dir: true, mode: 0o755, data: Vec::new() });
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let key = Self::normalize(path);
        let mut s = self.state.borrow_mut();
        match s.nodes.get(&key) {
            Some(node) if !node.is_dir => Err(Error::NotDir),
            Some(_) => {
                if !Self::children_of(&s, &key).is_empty() {
                    return Err(Error::NotEmpty);
                }
                s.nodes.remove(&key);
                Ok(())
            }
            None => Err(Error::NoEntry),
        }
    }

    async fn opendir(&self, path: &str) -> Result<DirHandle> {
        let key = Self::normalize(path);
        let mut s = self.state.borrow_mut();
        match s.nodes.get(&key) {
            Some(node) if node.is_dir => {
                let entries = Self::children_of(&s, &key);
                let handle = s.next_handle;
                s.next_handle += 1;
                s.open_dirs.insert(handle, (entries, 0));
                Ok(DirHandle(handle))
            }
            Some(_) => Err(Error::NotDir),
            None => Err(Error::NoEntry),
        }
    }

    fn readdir_next(&self, dir: DirHandle) -> Option<DirEntry> {
        let mut s = self.state.borrow_mut();
        let (entries, cursor) = s.open_dirs.get_mut(&dir.0)?;
        let entry = entries.get(*cursor).cloned();
        if entry.is_some() {
            *cursor += 1;
        }
        entry
    }

    fn seekdir(&self, dir: DirHandle, cookie: u64) -> Result<()> {
        let mut s = self.state.borrow_mut();
        let (_, cursor) = s.open_dirs.get_mut(&dir.0).ok_or(Error::StaleFile)?;
        *cursor = cookie as usize;
        Ok(())
    }

    fn telldir(&self, dir: DirHandle) -> u64 {
        self.state.borrow().open_dirs.get(&dir.0).map(|(_, cursor)| *cursor as u64).unwrap_or(0)
    }

    fn rewinddir(&self, dir: DirHandle) {
        if let Some((_, cursor)) = self.state.borrow_mut().open_dirs.get_mut(&dir.0) {
            *cursor = 0;
        }
    }

    fn closedir(&self, dir: DirHandle) {
        self.state.borrow_mut().open_dirs.remove(&dir.0);
    }
}
