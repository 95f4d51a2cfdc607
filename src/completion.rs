//! Completion records pushed onto the completion ring, and the closed
//! status-code taxonomy every command resolves to.
//!
//! Grounded on `op.c`'s `reply()` and its `status_t` enum: same nine
//! statuses, same rule that a status other than `SUCCESS` carries no
//! payload.

use crate::command::RequestId;

/// The closed set of outcomes a command can resolve to (spec.md §7).
///
/// Deliberately not `#[non_exhaustive]`: the taxonomy is closed by design,
/// matching `op.c`'s fixed `status_t`, so callers may match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Error,
    InvalidCommand,
    InvalidPath,
    InvalidBuffer,
    InvalidFd,
    AllocationError,
    OutstandingOperations,
    EndOfDirectory,
}

impl From<crate::descriptor::Error> for Status {
    fn from(e: crate::descriptor::Error) -> Self {
        match e {
            crate::descriptor::Error::NoFreeSlots => Status::AllocationError,
            crate::descriptor::Error::InvalidDescriptor => Status::InvalidFd,
            crate::descriptor::Error::OutstandingOperations => Status::OutstandingOperations,
        }
    }
}

/// The payload a completion carries alongside its status. Only a handful of
/// commands return data beyond the bare status; everything else is `None`.
#[derive(Debug, Clone, Copy)]
pub enum Payload {
    None,
    Fd(crate::descriptor::Fd),
    /// Number of bytes actually read, written, or copied into the client's
    /// output buffer (attribute blob for `STAT`, directory entry for
    /// `DIR_READ`).
    Len(u64),
    /// File size, as returned by `SIZE`.
    Size(u64),
    /// Directory stream position, as returned by `DIR_TELL`.
    Cookie(u64),
}

/// A fully formed entry ready to push onto the completion ring.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub request_id: RequestId,
    pub status: Status,
    pub payload: Payload,
}

impl Completion {
    pub fn ok(request_id: RequestId, payload: Payload) -> Self {
        Self { request_id, status: Status::Success, payload }
    }

    pub fn err(request_id: RequestId, status: Status) -> Self {
        debug_assert_ne!(status, Status::Success, "err() called with a success status");
        Self { request_id, status, payload: Payload::None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor;

    #[test]
    fn descriptor_errors_map_to_matching_status() {
        assert_eq!(Status::from(descriptor::Error::NoFreeSlots), Status::AllocationError);
        assert_eq!(Status::from(descriptor::Error::InvalidDescriptor), Status::InvalidFd);
        assert_eq!(Status::from(descriptor::Error::OutstandingOperations), Status::OutstandingOperations);
    }

    #[test]
    fn ok_never_carries_a_non_success_status() {
        let c = Completion::ok(RequestId(1), Payload::None);
        assert_eq!(c.status, Status::Success);
    }
}
