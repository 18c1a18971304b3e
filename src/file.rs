use crate::console;
use crate::fs::FsError;
use crate::param::NFILE;
use crate::spinlock::SpinLock;
use crate::syscall::SysError;
use crate::vm::VA;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    None,
    Console,
}

/// File metadata, protected by the table-wide spinlock.
#[derive(Debug, Clone, Copy)]
pub struct FileMeta {
    pub ref_count: usize,
    pub r#type: FileType,
}

pub static FILE_TABLE: FileTable = FileTable::new();

/// Global file table
#[derive(Debug)]
pub struct FileTable {
    /// Protects allocation and reference counts
    meta: SpinLock<[FileMeta; NFILE]>,
}

impl FileTable {
    const fn new() -> Self {
        Self {
            meta: SpinLock::new(
                [FileMeta {
                    ref_count: 0,
                    r#type: FileType::None,
                }; NFILE],
                "filetable",
            ),
        }
    }
}

/// File handle, just an index into the `FILE_TABLE`.
#[derive(Debug, PartialEq, Eq)]
pub struct File {
    id: usize,
}

impl File {
    /// Allocates a file structure.
    fn alloc(r#type: FileType) -> Result<Self, FsError> {
        let mut meta = FILE_TABLE.meta.lock();

        for (i, meta) in meta.iter_mut().enumerate() {
            if meta.ref_count == 0 {
                meta.ref_count = 1;
                meta.r#type = r#type;

                return Ok(Self { id: i });
            }
        }

        Err(FsError::OutOfFile)
    }

    /// Allocates a handle on the console device.
    pub fn alloc_console() -> Result<Self, FsError> {
        Self::alloc(FileType::Console)
    }

    /// Increments the reference count for the file.
    pub fn dup(&mut self) -> Self {
        let meta = &mut FILE_TABLE.meta.lock()[self.id];

        assert!(meta.ref_count >= 1, "filedup");

        meta.ref_count += 1;

        Self { id: self.id }
    }

    /// Decrements the reference count and closes the file if it reaches 0.
    pub fn close(&mut self) {
        let mut meta_guard = FILE_TABLE.meta.lock();
        let meta = &mut meta_guard[self.id];

        assert!(meta.ref_count >= 1, "fileclose");

        meta.ref_count -= 1;
        if meta.ref_count == 0 {
            meta.r#type = FileType::None;
        }
    }

    /// Writes `len` bytes from `src` to the file.
    pub fn write(&self, user_src: bool, src: VA, len: usize) -> Result<usize, SysError> {
        let r#type = FILE_TABLE.meta.lock()[self.id].r#type;

        match r#type {
            FileType::Console => console::write(user_src, src, len),
            FileType::None => Err(SysError::BadDescriptor),
        }
    }
}
