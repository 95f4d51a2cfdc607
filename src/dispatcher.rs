//! The single-threaded command dispatcher.
//!
//! Grounded on `op.c`'s `process_commands` and its `handle_*`/`*_cb`
//! function pairs: each command handler here is the async analogue of one
//! `handle_*`/`*_cb` pair — the handler validates and kicks off the NFS
//! call, the completion is produced once the NFS client's future resolves,
//! instead of the `*_cb` callback being re-entered from libnfs's poll loop.
//!
//! Rust's `!Send` single-threaded model (`Rc<RefCell<_>>` driven from a
//! `tokio::task::LocalSet`) replaces `op.c`'s reliance on "everything runs
//! on one seL4 thread, so no locking is needed": there is still exactly one
//! thread, it's just expressed as a current-thread runtime instead of a
//! bare event loop.

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::buffer::{self, BufferDesc, PathScratch, Slot as PathSlot};
use crate::command::{Command, CommandKind, OpenFlags, RequestId};
use crate::completion::{Completion, Payload, Status};
use crate::continuation::ContinuationPool;
use crate::descriptor::{Bound, Fd, Table};
use crate::nfs_client::{self, Attr, DirHandle, FileHandle, NfsClient};
use crate::notify::Notifier;
use crate::queue::Ring;

/// Length of a `STAT` result once serialised into the client's output
/// buffer: file type tag (1 byte) + mode (4) + size (8) + three
/// (seconds, nanos) timestamp pairs (12 each).
pub const STAT_ENCODED_LEN: usize = 1 + 4 + 8 + 12 * 3;

/// State shared between the dispatch loop and every in-flight async
/// operation. Single-threaded, so `Rc<RefCell<_>>` rather than `Arc<Mutex<_>>`
/// is the right tool: nothing here is ever touched from a second thread.
///
/// `client` is an `Rc<C>`, not a bare `C`: every handler clones it out of a
/// short-lived `borrow()` before calling any of its `async` methods, so the
/// `RefCell` guarding the rest of `Shared` is never held across an `.await`.
/// Two NFS operations suspended at once only ever race on their own
/// `Rc::clone`, which can't panic — they never race on this `RefCell`.
struct Shared<C> {
    client: Rc<C>,
    files: Table<FileHandle, DirHandle>,
    continuations: ContinuationPool,
    scratch: PathScratch,
    region: Vec<u8>,
    mounted: bool,
}

/// Bridges the client's shared-memory rings to an [`NfsClient`].
///
/// One `Dispatcher` per client connection. `region` is the byte range the
/// client's `BufferDesc`s index into — in production this is memory the
/// client process also maps; this crate only reads and writes through it,
/// it does not set up the mapping itself.
pub struct Dispatcher<C, N> {
    shared: Rc<RefCell<Shared<C>>>,
    command_ring: Rc<Ring<Command>>,
    completion_ring: Rc<Ring<Completion>>,
    notifier: N,
}

impl<C, N> Dispatcher<C, N>
where
    C: NfsClient + 'static,
    N: Notifier + Clone + 'static,
{
    pub fn new(
        client: C,
        region: Vec<u8>,
        command_ring: Rc<Ring<Command>>,
        completion_ring: Rc<Ring<Completion>>,
        notifier: N,
        descriptor_capacity: usize,
        continuation_capacity: usize,
    ) -> Self {
        let shared = Shared {
            client: Rc::new(client),
            files: Table::new(descriptor_capacity),
            continuations: ContinuationPool::new(continuation_capacity),
            scratch: PathScratch::new(),
            region,
            mounted: false,
        };
        Self {
            shared: Rc::new(RefCell::new(shared)),
            command_ring,
            completion_ring,
            notifier,
        }
    }

    /// Copies `bytes` into the shared data region at `offset`.
    ///
    /// In production the region named by every `BufferDesc` is memory the
    /// client process also maps, so the embedder's transport only needs to
    /// keep this crate's copy in sync with whatever arrived over the actual
    /// shared mapping; this crate never maps memory itself.
    pub fn write_region(&self, offset: usize, bytes: &[u8]) {
        self.shared.borrow_mut().region[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Copies `len` bytes out of the shared data region at `offset`.
    pub fn read_region(&self, offset: usize, len: usize) -> Vec<u8> {
        self.shared.borrow().region[offset..offset + len].to_vec()
    }

    /// Runs forever, waiting for the client to signal new commands and
    /// draining as many as the completion ring currently has room for.
    ///
    /// Must be spawned inside a `tokio::task::LocalSet` (the handlers this
    /// drives are `!Send`).
    pub async fn run(&self) {
        loop {
            self.notifier.notified().await;
            self.drain_ready();
        }
    }

    /// Pops and dispatches as many commands as the back-pressure invariant
    /// allows: `to_consume = min(command_count, completion_space)`. Mirrors
    /// `process_commands`'s loop body exactly, down to consuming commands
    /// even when none of them can be matched to a known type.
    pub fn drain_ready(&self) {
        let command_count = self.command_ring.len();
        let completion_space = self.completion_ring.space();
        let to_consume = command_count.min(completion_space);

        for _ in 0..to_consume {
            let Some(command) = self.command_ring.pop() else {
                break;
            };
            self.dispatch(command);
        }
    }

    fn dispatch(&self, command: Command) {
        let shared = self.shared.clone();
        let request_id = command.request_id;

        // Every admitted command holds a continuation for its lifetime,
        // exactly as `op.c`'s handlers hold one across the async NFS call.
        // The pool is sized to the command ring's capacity, so — given the
        // dispatcher's own back-pressure invariant — this alloc can never
        // observe exhaustion; `op.c` enforced the same precondition with a
        // bare `assert`, which this crate treats as a precondition as well.
        let cont = shared
            .borrow_mut()
            .continuations
            .alloc(request_id)
            .expect("continuation pool sized to command-ring capacity; alloc cannot fail here");

        match command.kind {
            CommandKind::Initialise => self.spawn(shared, cont, handlers::initialise(self.shared.clone(), request_id)),
            CommandKind::Deinitialise => self.spawn(shared, cont, handlers::deinitialise(self.shared.clone(), request_id)),
            CommandKind::Open { path, flags } => {
                self.spawn(shared, cont, handlers::open(self.shared.clone(), request_id, path, flags))
            }
            CommandKind::Close { fd } => self.spawn(shared, cont, handlers::close(self.shared.clone(), request_id, fd)),
            CommandKind::Stat { path, out } => {
                self.spawn(shared, cont, handlers::stat(self.shared.clone(), request_id, path, out))
            }
            CommandKind::Size { fd } => self.spawn(shared, cont, handlers::size(self.shared.clone(), request_id, fd)),
            CommandKind::Read { fd, offset, buf } => {
                self.spawn(shared, cont, handlers::read(self.shared.clone(), request_id, fd, offset, buf))
            }
            CommandKind::Write { fd, offset, buf } => {
                self.spawn(shared, cont, handlers::write(self.shared.clone(), request_id, fd, offset, buf))
            }
            CommandKind::Truncate { fd, length } => {
                self.spawn(shared, cont, handlers::truncate(self.shared.clone(), request_id, fd, length))
            }
            CommandKind::Sync { fd } => self.spawn(shared, cont, handlers::sync(self.shared.clone(), request_id, fd)),
            CommandKind::Remove { path } => self.spawn(shared, cont, handlers::remove(self.shared.clone(), request_id, path)),
            CommandKind::Rename { old_path, new_path } => self.spawn(
                shared,
                cont,
                handlers::rename(self.shared.clone(), request_id, old_path, new_path),
            ),
            CommandKind::Mkdir { path } => self.spawn(shared, cont, handlers::mkdir(self.shared.clone(), request_id, path)),
            CommandKind::Rmdir { path } => self.spawn(shared, cont, handlers::rmdir(self.shared.clone(), request_id, path)),
            CommandKind::DirOpen { path } => self.spawn(shared, cont, handlers::dir_open(self.shared.clone(), request_id, path)),
            CommandKind::DirClose { fd } => {
                let completion = handlers::dir_close(&shared, request_id, fd);
                self.complete_now(shared, cont, completion)
            }
            CommandKind::DirRead { fd, out } => {
                let completion = handlers::dir_read(&shared, request_id, fd, out);
                self.complete_now(shared, cont, completion)
            }
            CommandKind::DirSeek { fd, cookie } => {
                let completion = handlers::dir_seek(&shared, request_id, fd, cookie);
                self.complete_now(shared, cont, completion)
            }
            CommandKind::DirTell { fd } => {
                let completion = handlers::dir_tell(&shared, request_id, fd);
                self.complete_now(shared, cont, completion)
            }
            CommandKind::DirRewind { fd } => {
                let completion = handlers::dir_rewind(&shared, request_id, fd);
                self.complete_now(shared, cont, completion)
            }
        }
    }

    /// Spawns an async handler on the current `LocalSet` and relays its
    /// completion once it resolves, freeing the continuation that was held
    /// for its duration.
    fn spawn(
        &self,
        shared: Rc<RefCell<Shared<C>>>,
        cont: crate::continuation::ContinuationHandle,
        fut: impl std::future::Future<Output = Completion> + 'static,
    ) {
        let completion_ring = self.completion_ring.clone();
        let notifier = self.notifier.clone();
        tokio::task::spawn_local(async move {
            let completion = fut.await;
            shared.borrow_mut().continuations.free(cont);
            completion_ring
                .push(completion)
                .unwrap_or_else(|_| panic!("completion ring overflowed past its reserved back-pressure slot"));
            notifier.notify();
        });
    }

    /// Pushes a completion produced synchronously (the directory-stream
    /// commands never suspend: `op.c`'s `readdir`/`seekdir`/`telldir`/
    /// `rewinddir` are synchronous libnfs calls against an already-fetched
    /// listing, not async RPCs).
    fn complete_now(&self, shared: Rc<RefCell<Shared<C>>>, cont: crate::continuation::ContinuationHandle, completion: Completion) {
        shared.borrow_mut().continuations.free(cont);
        self.completion_ring
            .push(completion)
            .unwrap_or_else(|_| panic!("completion ring overflowed past its reserved back-pressure slot"));
        self.notifier.notify();
    }
}

/// Translates an [`nfs_client::Error`] returned by an async NFS call into a
/// [`Completion`]. Every NFS-layer failure that isn't a validation problem
/// (those are caught before the call is even made) resolves to the single
/// `Error` status — `op.c`'s callbacks never distinguished libnfs error
/// codes any further than "zero or non-zero" either.
fn nfs_err(request_id: RequestId, e: nfs_client::Error) -> Completion {
    let _ = e;
    Completion::err(request_id, Status::Error)
}

/// Serialises `attr` the way `STAT` writes it into the client's output
/// buffer: fixed-width little-endian fields, matching the rest of this
/// crate's other on-the-wire integers (`byteorder`, already a teacher
/// dependency).
fn encode_attr(attr: &Attr) -> [u8; STAT_ENCODED_LEN] {
    let mut buf = Vec::with_capacity(STAT_ENCODED_LEN);
    let type_tag: u8 = match attr.file_type {
        nfs_client::FileType::Regular => 0,
        nfs_client::FileType::Directory => 1,
        nfs_client::FileType::Symlink => 2,
        nfs_client::FileType::Other => 3,
    };
    buf.push(type_tag);
    buf.write_u32::<LittleEndian>(attr.mode).unwrap();
    buf.write_u64::<LittleEndian>(attr.size).unwrap();
    for time in [attr.atime, attr.mtime, attr.ctime] {
        buf.write_i64::<LittleEndian>(time.seconds).unwrap();
        buf.write_u32::<LittleEndian>(time.nanos).unwrap();
    }
    buf.try_into().expect("STAT_ENCODED_LEN matches the fields written above")
}

mod handlers {
    use super::*;

    pub(super) async fn initialise<C: NfsClient>(shared: Rc<RefCell<Shared<C>>>, request_id: RequestId) -> Completion {
        if shared.borrow().mounted {
            tracing::warn!("duplicate initialise command from client");
            return Completion::err(request_id, Status::Error);
        }
        // Clone the `Rc<C>` out and drop the `Shared` borrow before awaiting:
        // an `Rc` clone is just a refcount bump, so nothing borrowed from
        // `shared` is part of this future's saved state across the
        // suspension point (unlike `shared.borrow_mut().client.mount().await`,
        // which would keep the `RefMut` alive for as long as the call takes).
        let client = shared.borrow().client.clone();
        let result = client.mount().await;
        match result {
            Ok(()) => {
                shared.borrow_mut().mounted = true;
                tracing::info!("mounted nfs export");
                Completion::ok(request_id, Payload::None)
            }
            Err(e) => {
                tracing::warn!(?e, "failed to mount nfs export");
                nfs_err(request_id, e)
            }
        }
    }

    /// Idempotent: tearing down an already-torn-down (or never-established)
    /// mount always succeeds. `op.c`'s `handle_deinitialise` never replied
    /// at all, which would stall the client forever waiting on a completion
    /// that never arrives; this crate always replies instead.
    pub(super) async fn deinitialise<C: NfsClient>(shared: Rc<RefCell<Shared<C>>>, request_id: RequestId) -> Completion {
        if shared.borrow().mounted {
            let client = shared.borrow().client.clone();
            client.unmount().await;
            shared.borrow_mut().mounted = false;
        }
        Completion::ok(request_id, Payload::None)
    }

    pub(super) async fn open<C: NfsClient>(
        shared: Rc<RefCell<Shared<C>>>,
        request_id: RequestId,
        path: BufferDesc,
        flags: OpenFlags,
    ) -> Completion {
        let Some(path_owned) = read_path(&shared, path) else {
            return Completion::err(request_id, Status::InvalidPath);
        };

        let fd = match shared.borrow_mut().files.alloc() {
            Ok(fd) => fd,
            Err(e) => return Completion::err(request_id, e.into()),
        };

        let client = shared.borrow().client.clone();
        let result = client.open(&path_owned, flags.access, flags.create, nfs_client::DEFAULT_OPEN_MODE).await;
        match result {
            Ok((handle, _attr)) => {
                shared.borrow_mut().files.set_file(fd, handle).expect("fd was just reserved");
                Completion::ok(request_id, Payload::Fd(fd))
            }
            Err(e) => {
                tracing::warn!(?e, path = %path_owned, "failed to open file");
                shared.borrow_mut().files.free(fd).expect("fd was just reserved and never bound");
                nfs_err(request_id, e)
            }
        }
    }

    /// `unset(fd)` is called *before* the async close is submitted, not
    /// wrapped in a `begin_op`/`end_op` pair around it: the whole point of
    /// `unset`'s counter check is to refuse the close while some other
    /// in-flight operation still holds the descriptor (spec.md §4.4's
    /// "confirming no outstanding operations"). Pinning the descriptor with
    /// `begin_op` for the close call itself would make that check pass
    /// trivially against its own pin and miss a concurrent reader.
    pub(super) async fn close<C: NfsClient>(shared: Rc<RefCell<Shared<C>>>, request_id: RequestId, fd: Fd) -> Completion {
        let handle = match shared.borrow_mut().files.unset(fd) {
            Ok(Bound::File(h)) => h,
            Ok(Bound::Directory(_)) => unreachable!("fd was opened as a file"),
            Err(e) => return Completion::err(request_id, e.into()),
        };

        let client = shared.borrow().client.clone();
        match client.close(handle).await {
            Ok(()) => {
                shared.borrow_mut().files.free(fd).expect("fd was just unset");
                Completion::ok(request_id, Payload::None)
            }
            Err(e) => {
                tracing::warn!(?e, "failed to close file");
                shared.borrow_mut().files.set_file(fd, handle).expect("fd was just unset, still reserved");
                nfs_err(request_id, e)
            }
        }
    }

    pub(super) async fn stat<C: NfsClient>(
        shared: Rc<RefCell<Shared<C>>>,
        request_id: RequestId,
        path: BufferDesc,
        out: BufferDesc,
    ) -> Completion {
        let Some(path_owned) = read_path(&shared, path) else {
            return Completion::err(request_id, Status::InvalidPath);
        };

        // Range-validate `out` up front, the way `op.c`'s `handle_stat` calls
        // `get_buffer(params.buf)` before ever submitting the lookup: an
        // out-of-range `out` must fail as `InvalidBuffer` even when the NFS
        // lookup itself would have failed too, rather than racing the lookup
        // to decide which error wins.
        {
            let s = shared.borrow();
            match buffer::get_buffer(&s.region, out) {
                Some(slice) if slice.len() >= STAT_ENCODED_LEN => {}
                _ => return Completion::err(request_id, Status::InvalidBuffer),
            }
        }

        let client = shared.borrow().client.clone();
        let result = client.lookup(&path_owned).await;
        match result {
            Ok(attr) => {
                let encoded = encode_attr(&attr);
                let mut s = shared.borrow_mut();
                match buffer::get_buffer_mut(&mut s.region, out) {
                    Some(dest) => {
                        dest[..encoded.len()].copy_from_slice(&encoded);
                        Completion::ok(request_id, Payload::Len(encoded.len() as u64))
                    }
                    None => Completion::err(request_id, Status::InvalidBuffer),
                }
            }
            Err(e) => nfs_err(request_id, e),
        }
    }

    pub(super) async fn size<C: NfsClient>(shared: Rc<RefCell<Shared<C>>>, request_id: RequestId, fd: Fd) -> Completion {
        let handle = {
            let mut s = shared.borrow_mut();
            match s.files.begin_op_file(fd) {
                Ok(h) => h,
                Err(e) => return Completion::err(request_id, e.into()),
            }
        };

        let client = shared.borrow().client.clone();
        let result = client.fstat(handle).await;
        shared.borrow_mut().files.end_op(fd);

        match result {
            Ok(attr) => Completion::ok(request_id, Payload::Size(attr.size)),
            Err(e) => nfs_err(request_id, e),
        }
    }

    pub(super) async fn read<C: NfsClient>(
        shared: Rc<RefCell<Shared<C>>>,
        request_id: RequestId,
        fd: Fd,
        offset: u64,
        buf: BufferDesc,
    ) -> Completion {
        let size = {
            let s = shared.borrow();
            match buffer::get_buffer(&s.region, buf) {
                Some(slice) => slice.len(),
                None => return Completion::err(request_id, Status::InvalidBuffer),
            }
        };

        let handle = {
            let mut s = shared.borrow_mut();
            match s.files.begin_op_file(fd) {
                Ok(h) => h,
                Err(e) => return Completion::err(request_id, e.into()),
            }
        };

        let client = shared.borrow().client.clone();
        let mut scratch = vec![0u8; size];
        let result = client.read(handle, offset, &mut scratch).await;
        shared.borrow_mut().files.end_op(fd);

        match result {
            Ok(n) => {
                let mut s = shared.borrow_mut();
                let dest = buffer::get_buffer_mut(&mut s.region, buf).expect("validated above, region unchanged");
                dest[..n].copy_from_slice(&scratch[..n]);
                Completion::ok(request_id, Payload::Len(n as u64))
            }
            Err(e) => {
                tracing::warn!(?e, offset, "failed to read file");
                nfs_err(request_id, e)
            }
        }
    }

    pub(super) async fn write<C: NfsClient>(
        shared: Rc<RefCell<Shared<C>>>,
        request_id: RequestId,
        fd: Fd,
        offset: u64,
        buf: BufferDesc,
    ) -> Completion {
        let bytes = {
            let s = shared.borrow();
            match buffer::get_buffer(&s.region, buf) {
                Some(slice) => slice.to_vec(),
                None => return Completion::err(request_id, Status::InvalidBuffer),
            }
        };

        let handle = {
            let mut s = shared.borrow_mut();
            match s.files.begin_op_file(fd) {
                Ok(h) => h,
                Err(e) => return Completion::err(request_id, e.into()),
            }
        };

        let client = shared.borrow().client.clone();
        let result = client.write(handle, offset, &bytes).await;
        shared.borrow_mut().files.end_op(fd);

        match result {
            Ok(n) => Completion::ok(request_id, Payload::Len(n as u64)),
            Err(e) => {
                tracing::warn!(?e, offset, "failed to write to file");
                nfs_err(request_id, e)
            }
        }
    }

    pub(super) async fn truncate<C: NfsClient>(
        shared: Rc<RefCell<Shared<C>>>,
        request_id: RequestId,
        fd: Fd,
        length: u64,
    ) -> Completion {
        let handle = {
            let mut s = shared.borrow_mut();
            match s.files.begin_op_file(fd) {
                Ok(h) => h,
                Err(e) => return Completion::err(request_id, e.into()),
            }
        };

        let client = shared.borrow().client.clone();
        let result = client.truncate(handle, length).await;
        shared.borrow_mut().files.end_op(fd);

        match result {
            Ok(()) => Completion::ok(request_id, Payload::None),
            Err(e) => nfs_err(request_id, e),
        }
    }

    pub(super) async fn sync<C: NfsClient>(shared: Rc<RefCell<Shared<C>>>, request_id: RequestId, fd: Fd) -> Completion {
        let handle = {
            let mut s = shared.borrow_mut();
            match s.files.begin_op_file(fd) {
                Ok(h) => h,
                Err(e) => return Completion::err(request_id, e.into()),
            }
        };

        let client = shared.borrow().client.clone();
        let result = client.fsync(handle).await;
        shared.borrow_mut().files.end_op(fd);

        match result {
            Ok(()) => Completion::ok(request_id, Payload::None),
            Err(e) => nfs_err(request_id, e),
        }
    }

    pub(super) async fn remove<C: NfsClient>(
        shared: Rc<RefCell<Shared<C>>>,
        request_id: RequestId,
        path: BufferDesc,
    ) -> Completion {
        let Some(path_owned) = read_path(&shared, path) else {
            return Completion::err(request_id, Status::InvalidPath);
        };

        let client = shared.borrow().client.clone();
        match client.remove(&path_owned).await {
            Ok(()) => Completion::ok(request_id, Payload::None),
            Err(e) => {
                tracing::warn!(?e, path = %path_owned, "failed to remove file");
                nfs_err(request_id, e)
            }
        }
    }

    /// Reads both paths into the two scratch slots before issuing the NFS
    /// call, since both must be live across the single `await` — the one
    /// place this crate's two-slot scratch earns its keep over a single
    /// shared slot (every other path-taking command only ever needs `First`).
    pub(super) async fn rename<C: NfsClient>(
        shared: Rc<RefCell<Shared<C>>>,
        request_id: RequestId,
        old_path: BufferDesc,
        new_path: BufferDesc,
    ) -> Completion {
        let (old_owned, new_owned) = {
            let mut s = shared.borrow_mut();
            let region = s.region.clone();
            if !s.scratch.write(PathSlot::First, &region, old_path) {
                return Completion::err(request_id, Status::InvalidPath);
            }
            if !s.scratch.write(PathSlot::Second, &region, new_path) {
                return Completion::err(request_id, Status::InvalidPath);
            }
            (s.scratch.get(PathSlot::First).to_owned(), s.scratch.get(PathSlot::Second).to_owned())
        };

        let client = shared.borrow().client.clone();
        match client.rename(&old_owned, &new_owned).await {
            Ok(()) => Completion::ok(request_id, Payload::None),
            Err(e) => {
                tracing::warn!(?e, old = %old_owned, new = %new_owned, "failed to rename");
                nfs_err(request_id, e)
            }
        }
    }

    pub(super) async fn mkdir<C: NfsClient>(
        shared: Rc<RefCell<Shared<C>>>,
        request_id: RequestId,
        path: BufferDesc,
    ) -> Completion {
        let Some(path_owned) = read_path(&shared, path) else {
            return Completion::err(request_id, Status::InvalidPath);
        };

        let client = shared.borrow().client.clone();
        match client.mkdir(&path_owned).await {
            Ok(()) => Completion::ok(request_id, Payload::None),
            Err(e) => nfs_err(request_id, e),
        }
    }

    /// Unlike `op.c`'s `rmdir_cb` (which allocates a *second* continuation
    /// instead of reusing the one passed via `private_data`, leaking the
    /// original), this handler never touches the continuation pool itself —
    /// `Dispatcher::dispatch` already allocated and will free the one
    /// continuation this request holds for its whole lifetime.
    pub(super) async fn rmdir<C: NfsClient>(
        shared: Rc<RefCell<Shared<C>>>,
        request_id: RequestId,
        path: BufferDesc,
    ) -> Completion {
        let Some(path_owned) = read_path(&shared, path) else {
            return Completion::err(request_id, Status::InvalidPath);
        };

        let client = shared.borrow().client.clone();
        match client.rmdir(&path_owned).await {
            Ok(()) => Completion::ok(request_id, Payload::None),
            Err(e) => nfs_err(request_id, e),
        }
    }

    pub(super) async fn dir_open<C: NfsClient>(
        shared: Rc<RefCell<Shared<C>>>,
        request_id: RequestId,
        path: BufferDesc,
    ) -> Completion {
        let Some(path_owned) = read_path(&shared, path) else {
            return Completion::err(request_id, Status::InvalidPath);
        };

        let fd = match shared.borrow_mut().files.alloc() {
            Ok(fd) => fd,
            Err(e) => return Completion::err(request_id, e.into()),
        };

        let client = shared.borrow().client.clone();
        match client.opendir(&path_owned).await {
            Ok(handle) => {
                shared.borrow_mut().files.set_dir(fd, handle).expect("fd was just reserved");
                Completion::ok(request_id, Payload::Fd(fd))
            }
            Err(e) => {
                tracing::warn!(?e, path = %path_owned, "failed to open directory");
                shared.borrow_mut().files.free(fd).expect("fd was just reserved and never bound");
                nfs_err(request_id, e)
            }
        }
    }

    pub(super) fn dir_close<C: NfsClient>(shared: &Rc<RefCell<Shared<C>>>, request_id: RequestId, fd: Fd) -> Completion {
        let mut s = shared.borrow_mut();
        let handle = match s.files.unset(fd) {
            Ok(Bound::Directory(h)) => h,
            Ok(Bound::File(_)) => unreachable!("fd was opened as a directory"),
            Err(e) => return Completion::err(request_id, e.into()),
        };

        s.client.closedir(handle);
        s.files.free(fd).expect("fd was just unset");
        Completion::ok(request_id, Payload::None)
    }

    pub(super) fn dir_read<C: NfsClient>(
        shared: &Rc<RefCell<Shared<C>>>,
        request_id: RequestId,
        fd: Fd,
        out: BufferDesc,
    ) -> Completion {
        let mut s = shared.borrow_mut();
        if buffer::get_buffer(&s.region, out).map(|b| b.len()).unwrap_or(0) < buffer::MAX_NAME {
            return Completion::err(request_id, Status::InvalidBuffer);
        }

        let handle = match s.files.begin_op_dir(fd) {
            Ok(h) => h,
            Err(e) => return Completion::err(request_id, e.into()),
        };

        let entry = s.client.readdir_next(handle);
        s.files.end_op(fd);

        match entry {
            Some(entry) => {
                let name_len = entry.name.len();
                let dest = buffer::get_buffer_mut(&mut s.region, out).expect("validated above");
                dest[..name_len].copy_from_slice(entry.name.as_bytes());
                Completion::ok(request_id, Payload::Len(name_len as u64))
            }
            None => Completion::err(request_id, Status::EndOfDirectory),
        }
    }

    pub(super) fn dir_seek<C: NfsClient>(shared: &Rc<RefCell<Shared<C>>>, request_id: RequestId, fd: Fd, cookie: u64) -> Completion {
        let mut s = shared.borrow_mut();
        let handle = match s.files.begin_op_dir(fd) {
            Ok(h) => h,
            Err(e) => return Completion::err(request_id, e.into()),
        };
        let result = s.client.seekdir(handle, cookie);
        s.files.end_op(fd);
        match result {
            Ok(()) => Completion::ok(request_id, Payload::None),
            Err(e) => nfs_err(request_id, e),
        }
    }

    pub(super) fn dir_tell<C: NfsClient>(shared: &Rc<RefCell<Shared<C>>>, request_id: RequestId, fd: Fd) -> Completion {
        let mut s = shared.borrow_mut();
        let handle = match s.files.begin_op_dir(fd) {
            Ok(h) => h,
            Err(e) => return Completion::err(request_id, e.into()),
        };
        let cookie = s.client.telldir(handle);
        s.files.end_op(fd);
        Completion::ok(request_id, Payload::Cookie(cookie))
    }

    pub(super) fn dir_rewind<C: NfsClient>(shared: &Rc<RefCell<Shared<C>>>, request_id: RequestId, fd: Fd) -> Completion {
        let mut s = shared.borrow_mut();
        let handle = match s.files.begin_op_dir(fd) {
            Ok(h) => h,
            Err(e) => return Completion::err(request_id, e.into()),
        };
        s.client.rewinddir(handle);
        s.files.end_op(fd);
        Completion::ok(request_id, Payload::None)
    }

    /// Copies `desc` out of the shared region into scratch slot `First` and
    /// returns it as an owned `String` so it can outlive the borrow of
    /// `shared` across the subsequent `await`.
    fn read_path<C: NfsClient>(shared: &Rc<RefCell<Shared<C>>>, desc: BufferDesc) -> Option<String> {
        let mut s = shared.borrow_mut();
        let region = s.region.clone();
        if !s.scratch.write(PathSlot::First, &region, desc) {
            return None;
        }
        Some(s.scratch.get(PathSlot::First).to_owned())
    }
}
