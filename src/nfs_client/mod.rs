//! The asynchronous NFS client collaborator.
//!
//! Everything below the dispatcher — mount handling, RPC framing, retry —
//! lives outside this crate; [`NfsClient`] is the seam the dispatcher calls
//! through and an embedder implements. The error taxonomy and attribute
//! shape are carried over from the teacher's `vfs::Vfs` trait (RFC 1813
//! NFSv3 semantics), since the wire values an NFS client surfaces are the
//! same regardless of which side of the wire the crate sits on.

use async_trait::async_trait;

pub mod fake;

/// Result of an [`NfsClient`] operation.
pub type Result<T> = std::result::Result<T, Error>;

/// NFSv3-flavoured error taxonomy, carried over from the NFSv3 server this
/// crate's sibling modules used to implement — the remote server this
/// client talks to returns the same codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    Permission,
    NoEntry,
    IO,
    Access,
    Exist,
    NotDir,
    IsDir,
    InvalidArgument,
    FileTooLarge,
    NoSpace,
    ReadOnlyFs,
    NameTooLong,
    NotEmpty,
    StaleFile,
    NotSupp,
    ServerFault,
    /// The client lost its connection to the server and auto-reconnect is
    /// disabled or has exhausted its attempts.
    Disconnected,
}

/// Opaque handle to an open file, as returned by [`NfsClient::open`]. The
/// dispatcher never inspects this; it only stores it in the descriptor
/// table and hands it back on later calls.
#[derive(Debug, Clone, Copy)]
pub struct FileHandle(pub u64);

/// Opaque handle to an open directory stream.
#[derive(Debug, Clone, Copy)]
pub struct DirHandle(pub u64);

/// File type, mirroring RFC 1813's `ftype3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// Timestamp with NFSv3's seconds/nanoseconds split.
#[derive(Debug, Clone, Copy)]
pub struct Time {
    pub seconds: i64,
    pub nanos: u32,
}

/// File attributes as serialised into a `STAT` completion's output buffer.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub file_type: FileType,
    pub mode: u32,
    pub size: u64,
    pub atime: Time,
    pub mtime: Time,
    pub ctime: Time,
}

/// One entry read back by `DIR_READ`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub cookie: u64,
}

/// Access mode requested by `OPEN`, mirroring the `O_RDONLY`/`O_WRONLY`/
/// `O_RDWR` trio `op.c` ORs into its open flags before calling
/// `nfs_open2_async` (spec.md §4.4 "Open handler specifics").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Mode `op.c` passes to `nfs_open2_async` whenever `CREATE` is set,
/// regardless of what the client asked for (spec.md §4.4).
pub const DEFAULT_OPEN_MODE: u32 = 0o644;

/// The asynchronous NFS client collaborator the dispatcher drives.
///
/// Every fallible method returns [`Error`] rather than this crate's
/// [`crate::completion::Status`] — translating one to the other is the
/// dispatcher's job, not the client's, so this trait stays reusable against
/// any NFS client implementation.
///
/// Methods take `&self`, not `&mut self`: spec.md §5's concurrency model
/// requires multiple NFS operations in flight at once against the one
/// client a `Dispatcher` owns, the same way a real NFS client multiplexes
/// several outstanding RPCs over a single mount. An implementation that
/// needs mutable state (an open-file table, a cursor) reaches for its own
/// interior mutability, scoped to exactly the records one call touches —
/// not a single lock guarding the whole client, which would serialise
/// every call back into the same problem this trait shape exists to avoid.
#[async_trait(?Send)]
pub trait NfsClient {
    /// Establishes the mount this client was configured for. Called once,
    /// by `INITIALISE`.
    async fn mount(&self) -> Result<()>;

    /// Tears down the mount. Called by `DEINITIALISE`; must be safe to call
    /// when no mount is active.
    async fn unmount(&self);

    async fn lookup(&self, path: &str) -> Result<Attr>;

    async fn open(&self, path: &str, access: AccessMode, create: bool, mode: u32) -> Result<(FileHandle, Attr)>;

    async fn close(&self, file: FileHandle) -> Result<()>;

    async fn fstat(&self, file: FileHandle) -> Result<Attr>;

    async fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize>;

    async fn write(&self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize>;

    async fn truncate(&self, file: FileHandle, length: u64) -> Result<()>;

    async fn fsync(&self, file: FileHandle) -> Result<()>;

    async fn remove(&self, path: &str) -> Result<()>;

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()>;

    async fn mkdir(&self, path: &str) -> Result<()>;

    async fn rmdir(&self, path: &str) -> Result<()>;

    async fn opendir(&self, path: &str) -> Result<DirHandle>;

    /// Directory operations are synchronous: the entire listing is fetched
    /// at `opendir` time and walked locally, matching `op.c`'s use of a
    /// client-side cursor over a server-fetched listing rather than a
    /// paged network round trip per `DIR_READ`.
    fn readdir_next(&self, dir: DirHandle) -> Option<DirEntry>;

    fn seekdir(&self, dir: DirHandle, cookie: u64) -> Result<()>;

    fn telldir(&self, dir: DirHandle) -> u64;

    fn rewinddir(&self, dir: DirHandle);

    fn closedir(&self, dir: DirHandle);
}
