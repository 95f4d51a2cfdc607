//! Demo embedder: drives a [`fs_nfs_core::Dispatcher`] against a plain local
//! directory instead of a real NFS server.
//!
//! `LoopbackClient` implements [`fs_nfs_core::nfs_client::NfsClient`] over
//! `tokio::fs`, giving the dispatcher something real to talk to without
//! requiring a reachable NFS export to demonstrate the crate — the "NFS
//! server" is just the directory given on the command line, which is why
//! this binary is named the way it is.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use fs_nfs_core::command::{Command, CommandKind, RequestId};
use fs_nfs_core::completion::Completion;
use fs_nfs_core::dispatcher::Dispatcher;
use fs_nfs_core::nfs_client::{AccessMode, Attr, DirEntry, DirHandle, Error, FileHandle, FileType, NfsClient, Result, Time};
use fs_nfs_core::notify::{Notifier, TokioNotifier};
use fs_nfs_core::queue::Ring;

/// Each open file lives behind its own `Mutex`, not a single lock over the
/// whole table: two reads against *different* fds run fully concurrently,
/// only two operations against the *same* fd ever wait on each other, and
/// `tokio::sync::Mutex` (unlike `RefCell`) is designed to be held across an
/// `.await` rather than panicking when that happens.
struct LoopbackClient {
    root: PathBuf,
    files: RefCell<HashMap<u64, Rc<Mutex<tokio::fs::File>>>>,
    dirs: RefCell<HashMap<u64, RefCell<(Vec<DirEntry>, usize)>>>,
    next_handle: Cell<u64>,
}

impl LoopbackClient {
    fn new(root: PathBuf) -> Self {
        Self { root, files: RefCell::new(HashMap::new()), dirs: RefCell::new(HashMap::new()), next_handle: Cell::new(0) }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn alloc_handle(&self) -> u64 {
        let h = self.next_handle.get();
        self.next_handle.set(h + 1);
        h
    }

    fn file_handle(&self, file: FileHandle) -> Result<Rc<Mutex<tokio::fs::File>>> {
        self.files.borrow().get(&file.0).cloned().ok_or(Error::StaleFile)
    }
}

fn map_io_err(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::NotFound => Error::NoEntry,
        std::io::ErrorKind::PermissionDenied => Error::Access,
        std::io::ErrorKind::AlreadyExists => Error::Exist,
        _ => Error::IO,
    }
}

fn time_of(t: std::io::Result<SystemTime>) -> Time {
    let t = t.unwrap_or(SystemTime::UNIX_EPOCH);
    let since_epoch = t.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
    Time { seconds: since_epoch.as_secs() as i64, nanos: since_epoch.subsec_nanos() }
}

async fn attr_of(path: &Path) -> Result<Attr> {
    let meta = tokio::fs::metadata(path).await.map_err(map_io_err)?;
    let file_type = if meta.is_dir() {
        FileType::Directory
    } else if meta.file_type().is_symlink() {
        FileType::Symlink
    } else if meta.is_file() {
        FileType::Regular
    } else {
        FileType::Other
    };

    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode()
    };
    #[cfg(not(unix))]
    let mode = 0o644;

    Ok(Attr {
        file_type,
        mode,
        size: meta.len(),
        atime: time_of(meta.accessed()),
        mtime: time_of(meta.modified()),
        ctime: time_of(meta.modified()),
    })
}

#[async_trait(?Send)]
impl NfsClient for LoopbackClient {
    async fn mount(&self) -> Result<()> {
        tokio::fs::metadata(&self.root).await.map_err(map_io_err)?;
        Ok(())
    }

    async fn unmount(&self) {
        self.files.borrow_mut().clear();
        self.dirs.borrow_mut().clear();
    }

    async fn lookup(&self, path: &str) -> Result<Attr> {
        attr_of(&self.resolve(path)).await
    }

    async fn open(&self, path: &str, access: AccessMode, create: bool, mode: u32) -> Result<(FileHandle, Attr)> {
        let full = self.resolve(path);
        let (read, write) = match access {
            AccessMode::ReadOnly => (true, false),
            AccessMode::WriteOnly => (false, true),
            AccessMode::ReadWrite => (true, true),
        };
        let mut options = OpenOptions::new();
        options.read(read).write(write).create(create);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        let file = options.open(&full).await.map_err(map_io_err)?;
        let attr = attr_of(&full).await?;
        let handle = self.alloc_handle();
        self.files.borrow_mut().insert(handle, Rc::new(Mutex::new(file)));
        Ok((FileHandle(handle), attr))
    }

    async fn close(&self, file: FileHandle) -> Result<()> {
        self.files.borrow_mut().remove(&file.0);
        Ok(())
    }

    async fn fstat(&self, file: FileHandle) -> Result<Attr> {
        let handle = self.file_handle(file)?;
        let f = handle.lock().await;
        let meta = f.metadata().await.map_err(map_io_err)?;
        Ok(Attr {
            file_type: FileType::Regular,
            mode: 0o644,
            size: meta.len(),
            atime: time_of(meta.accessed()),
            mtime: time_of(meta.modified()),
            ctime: time_of(meta.modified()),
        })
    }

    async fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let handle = self.file_handle(file)?;
        let mut f = handle.lock().await;
        f.seek(std::io::SeekFrom::Start(offset)).await.map_err(map_io_err)?;
        let n = f.read(buf).await.map_err(map_io_err)?;
        Ok(n)
    }

    async fn write(&self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize> {
        let handle = self.file_handle(file)?;
        let mut f = handle.lock().await;
        f.seek(std::io::SeekFrom::Start(offset)).await.map_err(map_io_err)?;
        let n = f.write(buf).await.map_err(map_io_err)?;
        Ok(n)
    }

    async fn truncate(&self, file: FileHandle, length: u64) -> Result<()> {
        let handle = self.file_handle(file)?;
        let f = handle.lock().await;
        f.set_len(length).await.map_err(map_io_err)
    }

    async fn fsync(&self, file: FileHandle) -> Result<()> {
        let handle = self.file_handle(file)?;
        let mut f = handle.lock().await;
        f.sync_all().await.map_err(map_io_err)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(self.resolve(path)).await.map_err(map_io_err)
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        tokio::fs::rename(self.resolve(old_path), self.resolve(new_path)).await.map_err(map_io_err)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir(self.resolve(path)).await.map_err(map_io_err)
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        tokio::fs::remove_dir(self.resolve(path)).await.map_err(map_io_err)
    }

    async fn opendir(&self, path: &str) -> Result<DirHandle> {
        let mut read_dir = tokio::fs::read_dir(self.resolve(path)).await.map_err(map_io_err)?;
        let mut entries = Vec::new();
        let mut cookie = 0u64;
        while let Some(entry) = read_dir.next_entry().await.map_err(map_io_err)? {
            cookie += 1;
            entries.push(DirEntry { name: entry.file_name().to_string_lossy().into_owned(), cookie });
        }
        let handle = self.alloc_handle();
        self.dirs.borrow_mut().insert(handle, RefCell::new((entries, 0)));
        Ok(DirHandle(handle))
    }

    fn readdir_next(&self, dir: DirHandle) -> Option<DirEntry> {
        let dirs = self.dirs.borrow();
        let mut state = dirs.get(&dir.0)?.borrow_mut();
        let (entries, cursor) = &mut *state;
        let entry = entries.get(*cursor).cloned();
        if entry.is_some() {
            *cursor += 1;
        }
        entry
    }

    fn seekdir(&self, dir: DirHandle, cookie: u64) -> Result<()> {
        let dirs = self.dirs.borrow();
        let mut state = dirs.get(&dir.0).ok_or(Error::StaleFile)?.borrow_mut();
        state.1 = cookie as usize;
        Ok(())
    }

    fn telldir(&self, dir: DirHandle) -> u64 {
        self.dirs.borrow().get(&dir.0).map(|cell| cell.borrow().1 as u64).unwrap_or(0)
    }

    fn rewinddir(&self, dir: DirHandle) {
        if let Some(cell) = self.dirs.borrow().get(&dir.0) {
            cell.borrow_mut().1 = 0;
        }
    }

    fn closedir(&self, dir: DirHandle) {
        self.dirs.borrow_mut().remove(&dir.0);
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let root = std::env::args().nth(1).expect("usage: loopback_fs <directory-to-serve>");
    let root = PathBuf::from(root);

    let local = tokio::task::LocalSet::new();
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("failed to build runtime");

    local.block_on(&runtime, async move {
        let command_ring = Rc::new(Ring::new(64));
        let completion_ring = Rc::new(Ring::new(64));
        let notifier = TokioNotifier::new();

        let client = LoopbackClient::new(root);
        let region = vec![0u8; 1 << 20];
        let dispatcher = Rc::new(Dispatcher::new(
            client,
            region,
            command_ring.clone(),
            completion_ring.clone(),
            notifier.clone(),
            64,
            64,
        ));

        let driver = dispatcher.clone();
        tokio::task::spawn_local(async move { driver.run().await });

        command_ring
            .push(Command { request_id: RequestId(1), kind: CommandKind::Initialise })
            .map_err(|_| ())
            .expect("ring has room");
        notifier.notify();

        // Give the dispatcher a turn to mount before asking for a directory
        // listing of the root.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let completion: Completion = loop {
            if let Some(c) = completion_ring.pop() {
                break c;
            }
            tokio::task::yield_now().await;
        };
        println!("initialise -> {:?}", completion.status);
    });
}
