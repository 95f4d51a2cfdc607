//! Validation of client-supplied `(offset, size)` buffer descriptors against
//! the shared data region, and bounded path copying into server-owned
//! scratch slots.
//!
//! Grounded on `op.c`'s `get_buffer`/`copy_path`: same validation rules,
//! same two-slot scratch so rename can hold both paths at once without a
//! heap allocation.

/// Maximum length (in bytes, not counting any terminator) of a path passed
/// into a command. `op.c` pins this via `FS_MAX_PATH_LENGTH`; this crate
/// uses the same figure the teacher's own `vfs::MAX_PATH_LEN` already used
/// for NFSv3 path limits.
pub const MAX_PATH: usize = 1024;

/// Maximum length of a single directory-entry name, as returned by
/// `DIR_READ`. Matches the teacher's `vfs::MAX_NAME_LEN`.
pub const MAX_NAME: usize = 255;

/// A `(offset, size)` pair naming a byte range within the shared data
/// region. Offsets and sizes are client-controlled and must be validated
/// before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub offset: u64,
    pub size: u64,
}

/// Validates `desc` against a region of `region_len` bytes.
///
/// A descriptor is valid iff `offset < region_len`, `size <= region_len -
/// offset`, and `size > 0` — the zero-size case is rejected because it
/// carries no information and would otherwise need special-casing in every
/// downstream handler (spec.md §4.3).
fn validate(desc: BufferDesc, region_len: usize) -> bool {
    let region_len = region_len as u64;
    desc.offset < region_len && desc.size <= region_len - desc.offset && desc.size > 0
}

/// Resolves `desc` to a shared slice, or `None` if it fails validation.
pub fn get_buffer(region: &[u8], desc: BufferDesc) -> Option<&[u8]> {
    if !validate(desc, region.len()) {
        return None;
    }
    let start = desc.offset as usize;
    let end = start + desc.size as usize;
    Some(&region[start..end])
}

/// Resolves `desc` to a mutable shared slice, or `None` if it fails
/// validation.
pub fn get_buffer_mut(region: &mut [u8], desc: BufferDesc) -> Option<&mut [u8]> {
    if !validate(desc, region.len()) {
        return None;
    }
    let start = desc.offset as usize;
    let end = start + desc.size as usize;
    Some(&mut region[start..end])
}

/// Which of the two scratch slots to use. Rename is the only command that
/// needs both simultaneously (one for the source path, one for the
/// destination); every other path-taking command uses `First`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    First,
    Second,
}

/// Two server-owned scratch buffers used to materialise path strings out of
/// client-shared memory, avoiding a heap allocation per path-taking command.
///
/// The dispatcher guarantees it never reuses a slot across a suspension
/// point within a single command — see `dispatcher::Dispatcher::handle_rename`
/// for the one place both slots are alive at once.
pub struct PathScratch {
    slots: [[u8; MAX_PATH]; 2],
    lens: [usize; 2],
}

impl Default for PathScratch {
    fn default() -> Self {
        Self { slots: [[0; MAX_PATH]; 2], lens: [0; 2] }
    }
}

impl PathScratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `desc`, checks `size <= MAX_PATH`, and copies the bytes
    /// into the chosen scratch slot, ready to be read back with [`Self::get`].
    /// Returns `false` if the descriptor is invalid, empty, or too long —
    /// the slot is left unmodified in that case.
    ///
    /// Writing and reading are split into two methods (rather than one
    /// `copy_path` returning `&str` directly, as `op.c`'s did) so that
    /// rename can populate both slots before borrowing either back: a
    /// single combined method would tie the returned `&str`'s borrow to
    /// `&mut self`, making it impossible to hold the first path's slice
    /// alive while writing the second.
    pub fn write(&mut self, slot: Slot, region: &[u8], desc: BufferDesc) -> bool {
        let Some(bytes) = get_buffer(region, desc) else { return false };
        if bytes.len() > MAX_PATH || std::str::from_utf8(bytes).is_err() {
            return false;
        }

        let index = slot.index();
        self.slots[index][..bytes.len()].copy_from_slice(bytes);
        self.lens[index] = bytes.len();
        true
    }

    /// Returns the path most recently written into `slot` via [`Self::write`].
    pub fn get(&self, slot: Slot) -> &str {
        let index = slot.index();
        std::str::from_utf8(&self.slots[index][..self.lens[index]])
            .expect("scratch slot holds only bytes validated as UTF-8 at write time")
    }
}

impl Slot {
    fn index(self) -> usize {
        match self {
            Slot::First => 0,
            Slot::Second => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION_LEN: usize = 4096;

    #[test]
    fn zero_size_is_rejected() {
        let region = [0u8; REGION_LEN];
        assert!(get_buffer(&region, BufferDesc { offset: 0, size: 0 }).is_none());
    }

    #[test]
    fn end_at_region_boundary_is_accepted() {
        let region = [0u8; REGION_LEN];
        let desc = BufferDesc { offset: (REGION_LEN - 4) as u64, size: 4 };
        assert_eq!(get_buffer(&region, desc).unwrap().len(), 4);
    }

    #[test]
    fn offset_at_region_len_is_rejected() {
        let region = [0u8; REGION_LEN];
        let desc = BufferDesc { offset: REGION_LEN as u64, size: 1 };
        assert!(get_buffer(&region, desc).is_none());
    }

    #[test]
    fn overrun_is_rejected() {
        let region = [0u8; REGION_LEN];
        let desc = BufferDesc { offset: (REGION_LEN - 4) as u64, size: 5 };
        assert!(get_buffer(&region, desc).is_none());
    }

    #[test]
    fn path_at_max_len_is_accepted() {
        let mut region = [0u8; REGION_LEN];
        region[..MAX_PATH].copy_from_slice(&[b'a'; MAX_PATH]);

        let mut scratch = PathScratch::new();
        assert!(scratch.write(Slot::First, &region, BufferDesc { offset: 0, size: MAX_PATH as u64 }));
        assert_eq!(scratch.get(Slot::First).len(), MAX_PATH);
    }

    #[test]
    fn path_over_max_len_is_rejected() {
        let mut region = vec![0u8; REGION_LEN + 1];
        region[..MAX_PATH + 1].copy_from_slice(&[b'a'; MAX_PATH + 1]);

        let mut scratch = PathScratch::new();
        let ok = scratch.write(Slot::First, &region, BufferDesc { offset: 0, size: (MAX_PATH + 1) as u64 });
        assert!(!ok);
    }

    #[test]
    fn rename_holds_both_slots_simultaneously() {
        let mut region = [0u8; REGION_LEN];
        region[0..3].copy_from_slice(b"old");
        region[16..16 + 3].copy_from_slice(b"new");

        let mut scratch = PathScratch::new();
        assert!(scratch.write(Slot::First, &region, BufferDesc { offset: 0, size: 3 }));
        assert!(scratch.write(Slot::Second, &region, BufferDesc { offset: 16, size: 3 }));

        let old = scratch.get(Slot::First);
        let new = scratch.get(Slot::Second);
        assert_eq!(old, "old");
        assert_eq!(new, "new");
    }
}
