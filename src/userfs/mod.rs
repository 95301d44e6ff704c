//! In-memory block-structured filesystem.
//!
//! [`UserFs`] keeps a flat directory of named files, each stored as a list
//! of fixed 512-byte blocks, plus an indexed descriptor table with
//! POSIX-like open/read/write/close semantics. Deleting an open file
//! unlinks the name immediately while the contents survive until the last
//! descriptor is closed. Everything lives in process memory; nothing is
//! persisted, and a single instance must not be shared across threads.

mod file;

#[cfg(test)]
mod tests;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;
use thiserror::Error;

use self::file::File;
pub use self::file::{BLOCK_SIZE, MAX_FILE_SIZE};

/// Index into the descriptor table; small, non-negative, reused after
/// close.
pub type Fd = usize;

/// Errors reported by filesystem operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    /// No file with that name, or the descriptor is not open.
    #[error("no such file")]
    NoFile,
    /// The file size cap was reached.
    #[error("file size limit exceeded")]
    NoMem,
    /// The descriptor's access mode forbids the operation.
    #[error("permission denied")]
    NoPermission,
}

bitflags! {
    /// Flags accepted by [`UserFs::open`].
    ///
    /// Neither `READ_ONLY` nor `WRITE_ONLY` means read-write access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Create the file when the name does not exist yet.
        const CREATE = 1;
        /// Reject writes through the returned descriptor.
        const READ_ONLY = 2;
        /// Reject reads through the returned descriptor.
        const WRITE_ONLY = 4;
    }
}

struct Descriptor {
    file: Rc<RefCell<File>>,
    /// Logical position. Rewound to the file size on the next I/O when
    /// another descriptor shrank the file underneath us.
    pos: usize,
    flags: OpenFlags,
}

/// An in-memory filesystem instance.
///
/// The directory holds one reference per linked file and every open
/// descriptor holds another, so an unlinked file is freed exactly when its
/// last descriptor goes away.
#[derive(Default)]
pub struct UserFs {
    files: Vec<Rc<RefCell<File>>>,
    descriptors: Vec<Option<Descriptor>>,
}

impl UserFs {
    /// Create an empty filesystem.
    pub fn new() -> Self {
        UserFs::default()
    }

    /// Open `name` and return a descriptor positioned at byte 0.
    ///
    /// Without [`OpenFlags::CREATE`] the file must already exist.
    pub fn open(&mut self, name: &str, flags: OpenFlags) -> Result<Fd, FsError> {
        let existing = self
            .files
            .iter()
            .find(|file| file.borrow().name() == name)
            .cloned();
        let file = match existing {
            Some(file) => file,
            None if flags.contains(OpenFlags::CREATE) => {
                let file = Rc::new(RefCell::new(File::new(name)));
                self.files.push(Rc::clone(&file));
                file
            }
            None => return Err(FsError::NoFile),
        };
        Ok(self.install(Descriptor {
            file,
            pos: 0,
            flags,
        }))
    }

    fn install(&mut self, descriptor: Descriptor) -> Fd {
        match self.descriptors.iter().position(Option::is_none) {
            Some(slot) => {
                self.descriptors[slot] = Some(descriptor);
                slot
            }
            None => {
                self.descriptors.push(Some(descriptor));
                self.descriptors.len() - 1
            }
        }
    }

    fn descriptor(&mut self, fd: Fd) -> Result<&mut Descriptor, FsError> {
        self.descriptors
            .get_mut(fd)
            .and_then(Option::as_mut)
            .ok_or(FsError::NoFile)
    }

    /// Read up to `buf.len()` bytes at the descriptor's position. Returns
    /// the count actually read; 0 at end of file.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, FsError> {
        let desc = self.descriptor(fd)?;
        if buf.is_empty() {
            return Ok(0);
        }
        if desc.flags.contains(OpenFlags::WRITE_ONLY) {
            return Err(FsError::NoPermission);
        }
        let file = desc.file.borrow();
        if desc.pos > file.size() {
            desc.pos = file.size();
        }
        let read = file.read_at(desc.pos, buf);
        desc.pos += read;
        Ok(read)
    }

    /// Write `buf` at the descriptor's position, growing the file as
    /// needed. A write that would push the file past [`MAX_FILE_SIZE`] is
    /// truncated at the cap and reports [`FsError::NoMem`]; the bytes below
    /// the cap stay written.
    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize, FsError> {
        let desc = self.descriptor(fd)?;
        if buf.is_empty() {
            return Ok(0);
        }
        if desc.flags.contains(OpenFlags::READ_ONLY) {
            return Err(FsError::NoPermission);
        }
        let mut file = desc.file.borrow_mut();
        if desc.pos > file.size() {
            desc.pos = file.size();
        }
        let outcome = file.write_at(desc.pos, buf);
        desc.pos += outcome.written;
        if outcome.capped {
            return Err(FsError::NoMem);
        }
        Ok(outcome.written)
    }

    /// Close a descriptor and release its slot for reuse.
    pub fn close(&mut self, fd: Fd) -> Result<(), FsError> {
        match self.descriptors.get_mut(fd) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(FsError::NoFile),
        }
    }

    /// Unlink `name` from the directory. Descriptors already open on the
    /// file keep working; the contents are freed with the last of them.
    pub fn delete(&mut self, name: &str) -> Result<(), FsError> {
        let pos = self
            .files
            .iter()
            .position(|file| file.borrow().name() == name)
            .ok_or(FsError::NoFile)?;
        self.files.remove(pos);
        Ok(())
    }

    /// Change the file's storage to cover `new_size` bytes.
    ///
    /// Growing preallocates zeroed blocks without touching the logical
    /// size, so reads keep returning the old contents until a write extends
    /// the file. Shrinking frees trailing blocks and truncates the logical
    /// size; positions of other descriptors are rewound lazily on their
    /// next I/O.
    pub fn resize(&mut self, fd: Fd, new_size: usize) -> Result<(), FsError> {
        let desc = self.descriptor(fd)?;
        if desc.flags.contains(OpenFlags::READ_ONLY) {
            return Err(FsError::NoPermission);
        }
        if new_size > MAX_FILE_SIZE {
            return Err(FsError::NoMem);
        }
        let mut file = desc.file.borrow_mut();
        if file.size() < new_size {
            file.grow_to(new_size);
        } else if file.size() > new_size {
            file.shrink_to(new_size);
        }
        Ok(())
    }

    /// Close every descriptor and unlink every file.
    pub fn clear(&mut self) {
        self.descriptors.clear();
        self.files.clear();
    }
}

impl fmt::Debug for UserFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = self
            .descriptors
            .iter()
            .filter(|slot| slot.is_some())
            .count();
        f.debug_struct("UserFs")
            .field("files", &self.files.len())
            .field("open_descriptors", &open)
            .finish()
    }
}
