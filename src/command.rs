//! The command catalogue dispatched out of the client's command ring, and
//! the typed parameters each command carries.
//!
//! Grounded on `op.c`'s `command_t`/`command_type_t` and the per-command
//! argument structs it unpacks from the wire record; the tag-to-variant
//! mapping mirrors `op.c`'s big `switch` in `process_commands`.

use crate::buffer::BufferDesc;
use crate::descriptor::Fd;
use crate::nfs_client::AccessMode;
use num_derive::FromPrimitive;

/// Identifies a command across the command ring and the matching completion
/// ring entry. Echoed back verbatim in every `Completion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RequestId(pub u64);

/// Wire tag for a command's type, as read out of the raw ring record before
/// it is known to be valid.
///
/// `num_derive::FromPrimitive` gives a checked conversion from the raw tag
/// byte: an out-of-range tag converts to `None` rather than panicking, which
/// the dispatcher turns into `Status::InvalidCommand` (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum CommandTag {
    Initialise = 0,
    Deinitialise = 1,
    Open = 2,
    Close = 3,
    Stat = 4,
    Size = 5,
    Read = 6,
    Write = 7,
    Truncate = 8,
    Sync = 9,
    Remove = 10,
    Rename = 11,
    Mkdir = 12,
    Rmdir = 13,
    DirOpen = 14,
    DirClose = 15,
    DirRead = 16,
    DirSeek = 17,
    DirTell = 18,
    DirRewind = 19,
}

/// A fully decoded, parameter-typed command pulled off the command ring.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub request_id: RequestId,
    pub kind: CommandKind,
}

/// One variant per entry in the command catalogue, carrying exactly the
/// parameters that handler needs (spec.md §4.4).
#[derive(Debug, Clone, Copy)]
pub enum CommandKind {
    /// Establishes the NFS mount. No parameters: server/export are fixed at
    /// startup via config, not passed per-call.
    Initialise,
    /// Tears down the NFS mount. Idempotent.
    Deinitialise,
    Open { path: BufferDesc, flags: OpenFlags },
    Close { fd: Fd },
    Stat { path: BufferDesc, out: BufferDesc },
    Size { fd: Fd },
    Read { fd: Fd, offset: u64, buf: BufferDesc },
    Write { fd: Fd, offset: u64, buf: BufferDesc },
    Truncate { fd: Fd, length: u64 },
    Sync { fd: Fd },
    Remove { path: BufferDesc },
    Rename { old_path: BufferDesc, new_path: BufferDesc },
    Mkdir { path: BufferDesc },
    Rmdir { path: BufferDesc },
    DirOpen { path: BufferDesc },
    DirClose { fd: Fd },
    DirRead { fd: Fd, out: BufferDesc },
    DirSeek { fd: Fd, cookie: u64 },
    DirTell { fd: Fd },
    DirRewind { fd: Fd },
}

/// Flags accepted by `OPEN`: `READ_ONLY`/`WRITE_ONLY`/`READ_WRITE` plus
/// `CREATE`, the same four bits `op.c` ORs into `O_RDONLY`/`O_WRONLY`/
/// `O_RDWR`/`O_CREAT` before calling `nfs_open2_async` (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub access: AccessMode,
    pub create: bool,
}

/// Decodes a raw wire tag into a [`CommandTag`], returning `None` for any
/// value outside the closed catalogue.
///
/// The embedder's wire-decoding layer (parsing a raw ring record into a
/// [`Command`]) calls this before constructing anything: a `None` here must
/// turn directly into an `INVALID_COMMAND` completion without ever
/// allocating a continuation or touching the descriptor table, the same way
/// `op.c`'s `process_commands` checks `cmd.type >= FS_NUM_COMMANDS` before
/// indexing into `cmd_handler`.
pub fn decode_tag(raw: u32) -> Option<CommandTag> {
    num_traits::FromPrimitive::from_u32(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_every_catalogue_entry() {
        for raw in 0..=19u32 {
            assert!(decode_tag(raw).is_some(), "tag {raw} should decode");
        }
    }

    #[test]
    fn rejects_out_of_range_tag() {
        assert!(decode_tag(20).is_none());
        assert!(decode_tag(u32::MAX).is_none());
    }
}
