//! Fixed-size table mapping an integer handle to a file or directory
//! session, with a per-slot outstanding-operations counter.
//!
//! Grounded on `op.c`'s `fd_alloc`/`fd_begin_op_file`/`fd_begin_op_dir`/
//! `fd_end_op`/`fd_unset`/`fd_free` family: same contract, same states,
//! reimplemented as an array indexed by descriptor rather than a bag of
//! free functions over process-global state.

use std::fmt;

/// Integer handle naming a descriptor-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(pub u32);

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

/// Errors from descriptor-table operations.
///
/// These map directly onto the `INVALID_FD` / `OUTSTANDING_OPERATIONS` /
/// `ALLOCATION_ERROR` statuses in spec.md §7 — handlers translate a
/// `descriptor::Error` into the matching `Status` at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No free slot exists.
    NoFreeSlots,
    /// The slot named by the `Fd` is free, reserved, or of the wrong kind
    /// for the requested operation.
    InvalidDescriptor,
    /// `unset`/`free` refused because the slot's operation counter is not
    /// zero (an async op is still in flight against it).
    OutstandingOperations,
}

#[derive(Debug, Clone, Copy)]
enum State<H> {
    Free,
    Reserved,
    Bound(Kind<H>),
}

#[derive(Debug, Clone, Copy)]
enum Kind<H> {
    File(H),
    Directory(H),
}

struct Slot<H> {
    state: State<H>,
    op_count: u32,
}

impl<H> Slot<H> {
    fn free() -> Self {
        Self { state: State::Free, op_count: 0 }
    }
}

/// A bound session: either a file handle or a directory handle, named by
/// the `H` the embedder's `NfsClient` implementation uses for each.
pub enum Bound<F, D> {
    File(F),
    Directory(D),
}

/// Descriptor table generic over the file-handle type `F` and directory-
/// handle type `D` the NFS client collaborator hands back from open calls.
///
/// Kept as two parallel typed slots rather than one `enum Handle { File(F),
/// Directory(D) }` stored per slot would also work, but splitting avoids
/// forcing every slot to be sized for whichever variant is larger and keeps
/// `begin_op_file`/`begin_op_dir` each statically typed in their return.
pub struct Table<F, D> {
    files: Box<[Slot<F>]>,
    dirs: Box<[Slot<D>]>,
}

impl<F: Copy, D: Copy> Table<F, D> {
    /// Creates a table with `capacity` descriptors, all free.
    pub fn new(capacity: usize) -> Self {
        let mut files = Vec::with_capacity(capacity);
        let mut dirs = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            files.push(Slot::free());
            dirs.push(Slot::free());
        }
        Self { files: files.into_boxed_slice(), dirs: dirs.into_boxed_slice() }
    }

    pub fn capacity(&self) -> usize {
        self.files.len()
    }

    fn is_free(&self, index: usize) -> bool {
        matches!(self.files[index].state, State::Free) && matches!(self.dirs[index].state, State::Free)
    }

    /// Reserves the lowest-index free slot. Returns `ALLOCATION_ERROR`'s
    /// underlying condition as `Error::NoFreeSlots` if none exists.
    ///
    /// Lowest-index-first is not required by the contract but gives a
    /// deterministic, easily-oracled allocation order (spec.md §4.2's
    /// "tie-break... stable enough to enable a simple test oracle").
    pub fn alloc(&mut self) -> Result<Fd, Error> {
        for index in 0..self.files.len() {
            if self.is_free(index) {
                self.files[index].state = State::Reserved;
                self.dirs[index].state = State::Reserved;
                return Ok(Fd(index as u32));
            }
        }
        Err(Error::NoFreeSlots)
    }

    /// Binds a reserved slot to a file handle.
    pub fn set_file(&mut self, fd: Fd, handle: F) -> Result<(), Error> {
        let index = fd.0 as usize;
        match self.files[index].state {
            State::Reserved | State::Bound(Kind::File(_)) => {
                self.files[index].state = State::Bound(Kind::File(handle));
                self.dirs[index].state = State::Reserved;
                Ok(())
            }
            _ => Err(Error::InvalidDescriptor),
        }
    }

    /// Binds a reserved slot to a directory handle.
    pub fn set_dir(&mut self, fd: Fd, handle: D) -> Result<(), Error> {
        let index = fd.0 as usize;
        match self.dirs[index].state {
            State::Reserved | State::Bound(Kind::Directory(_)) => {
                self.dirs[index].state = State::Bound(Kind::Directory(handle));
                self.files[index].state = State::Reserved;
                Ok(())
            }
            _ => Err(Error::InvalidDescriptor),
        }
    }

    /// Pins a file descriptor for an in-flight operation, incrementing its
    /// counter and returning the bound handle.
    pub fn begin_op_file(&mut self, fd: Fd) -> Result<F, Error> {
        let index = fd.0 as usize;
        match self.files[index].state {
            State::Bound(Kind::File(handle)) => {
                self.files[index].op_count += 1;
                Ok(handle)
            }
            _ => Err(Error::InvalidDescriptor),
        }
    }

    /// Pins a directory descriptor for an in-flight operation.
    pub fn begin_op_dir(&mut self, fd: Fd) -> Result<D, Error> {
        let index = fd.0 as usize;
        match self.dirs[index].state {
            State::Bound(Kind::Directory(handle)) => {
                self.dirs[index].op_count += 1;
                Ok(handle)
            }
            _ => Err(Error::InvalidDescriptor),
        }
    }

    /// Completes one in-flight operation against `fd`.
    ///
    /// Panics if the counter was already zero: an unbalanced `end_op` is a
    /// programming error (spec.md §7 lists it among the fatal conditions).
    pub fn end_op(&mut self, fd: Fd) {
        let index = fd.0 as usize;
        let counter = match (&mut self.files[index].state, &mut self.dirs[index].state) {
            (State::Bound(Kind::File(_)), _) => &mut self.files[index].op_count,
            (_, State::Bound(Kind::Directory(_))) => &mut self.dirs[index].op_count,
            _ => panic!("end_op on a descriptor that is not bound"),
        };
        assert!(*counter > 0, "end_op with counter already zero");
        *counter -= 1;
    }

    /// Transitions a bound slot back to reserved, provided its counter is
    /// zero, returning the handle that was bound.
    pub fn unset(&mut self, fd: Fd) -> Result<Bound<F, D>, Error> {
        let index = fd.0 as usize;
        if let State::Bound(Kind::File(handle)) = self.files[index].state {
            if self.files[index].op_count != 0 {
                return Err(Error::OutstandingOperations);
            }
            self.files[index].state = State::Reserved;
            return Ok(Bound::File(handle));
        }
        if let State::Bound(Kind::Directory(handle)) = self.dirs[index].state {
            if self.dirs[index].op_count != 0 {
                return Err(Error::OutstandingOperations);
            }
            self.dirs[index].state = State::Reserved;
            return Ok(Bound::Directory(handle));
        }
        Err(Error::InvalidDescriptor)
    }

    /// Returns a reserved slot to free.
    pub fn free(&mut self, fd: Fd) -> Result<(), Error> {
        let index = fd.0 as usize;
        if !matches!(self.files[index].state, State::Reserved) || !matches!(self.dirs[index].state, State::Reserved) {
            return Err(Error::InvalidDescriptor);
        }
        self.files[index].state = State::Free;
        self.dirs[index].state = State::Free;
        self.files[index].op_count = 0;
        self.dirs[index].op_count = 0;
        Ok(())
    }

    /// Number of non-free slots, exposed for tests and diagnostics.
    #[cfg(test)]
    fn bound_count(&self) -> usize {
        (0..self.files.len()).filter(|&i| !self.is_free(i)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_lifecycle() {
        let mut table: Table<u64, u64> = Table::new(4);
        let fd = table.alloc().unwrap();
        table.set_file(fd, 42).unwrap();

        let h = table.begin_op_file(fd).unwrap();
        assert_eq!(h, 42);
        table.end_op(fd);

        match table.unset(fd).unwrap() {
            Bound::File(h) => assert_eq!(h, 42),
            Bound::Directory(_) => panic!("expected file"),
        }
        table.free(fd).unwrap();
        assert_eq!(table.bound_count(), 0);
    }

    #[test]
    fn close_fails_with_outstanding_ops() {
        let mut table: Table<u64, u64> = Table::new(4);
        let fd = table.alloc().unwrap();
        table.set_file(fd, 1).unwrap();
        let _h = table.begin_op_file(fd).unwrap();

        assert_eq!(table.unset(fd), Err(Error::OutstandingOperations));
    }

    #[test]
    fn mismatched_kind_is_invalid_fd() {
        let mut table: Table<u64, u64> = Table::new(4);
        let fd = table.alloc().unwrap();
        table.set_dir(fd, 7).unwrap();

        assert_eq!(table.begin_op_file(fd), Err(Error::InvalidDescriptor));
    }

    #[test]
    fn double_close_is_invalid_fd() {
        let mut table: Table<u64, u64> = Table::new(4);
        let fd = table.alloc().unwrap();
        table.set_file(fd, 1).unwrap();
        table.unset(fd).unwrap();
        table.free(fd).unwrap();

        assert_eq!(table.begin_op_file(fd), Err(Error::InvalidDescriptor));
    }

    #[test]
    fn allocation_exhaustion() {
        let mut table: Table<u64, u64> = Table::new(1);
        let fd = table.alloc().unwrap();
        assert_eq!(table.alloc(), Err(Error::NoFreeSlots));
        table.free(fd).unwrap();
        assert!(table.alloc().is_ok());
    }

    #[test]
    fn lowest_index_first() {
        let mut table: Table<u64, u64> = Table::new(4);
        let a = table.alloc().unwrap();
        let b = table.alloc().unwrap();
        table.free(a).unwrap();
        let c = table.alloc().unwrap();
        assert_eq!(c, a);
        assert_ne!(b, c);
    }
}
