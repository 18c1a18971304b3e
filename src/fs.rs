use core::fmt::Display;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::spinlock::SpinLock;

// The filesystem, as far as this kernel goes, is the set of images linked
// into the kernel at build time: a root directory and the programs under it.
// What lives behind the usual inode contract (dup/put, namei, fsinit) is an
// in-memory table rather than a disk, but the contract is the real one: the
// process core holds and releases references exactly as it would against an
// on-disk store.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// path does not name a boot image
    Resolve,
    /// operation does not apply to this inode type
    Type,
    /// the file table is full
    OutOfFile,
}

impl Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FsError::Resolve => write!(f, "cannot resolve path"),
            FsError::Type => write!(f, "wrong inode type"),
            FsError::OutOfFile => write!(f, "out of file structures"),
        }
    }
}

/// A program image baked into the kernel.
struct BootFile {
    name: &'static str,
    data: &'static [u8],
}

// /init reaps orphans forever:
//     start: li a7, 3      # wait()
//            li a0, 0
//            ecall
//            j start
// assembled by hand, the same way initcode ships; od -t xC init
static INIT_IMAGE: [u8; 16] = [
    0x93, 0x08, 0x30, 0x00, 0x13, 0x05, 0x00, 0x00, 0x73, 0x00, 0x00, 0x00, 0x6F, 0xF0, 0x5F,
    0xFF,
];

const NBOOT: usize = 1;

static BOOT_FILES: [BootFile; NBOOT] = [BootFile {
    name: "init",
    data: &INIT_IMAGE,
}];

/// root directory inode number; boot files follow it
const ROOT_INUM: u32 = 1;

/// In-memory reference counts, indexed by `inum - ROOT_INUM`.
static INODE_REFS: SpinLock<[usize; NBOOT + 1]> = SpinLock::new([0; NBOOT + 1], "inodes");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    Dir,
    File,
}

/// A counted reference to an inode. Obtained from `Path::resolve` or `dup`,
/// released with `put`; never cloned implicitly.
#[derive(Debug, PartialEq, Eq)]
pub struct Inode {
    inum: u32,
}

impl Inode {
    fn get(inum: u32) -> Self {
        let mut refs = INODE_REFS.lock();
        refs[(inum - ROOT_INUM) as usize] += 1;
        Self { inum }
    }

    /// Increments the reference count and returns a second handle.
    pub fn dup(&self) -> Self {
        let mut refs = INODE_REFS.lock();
        let count = &mut refs[(self.inum - ROOT_INUM) as usize];
        assert!(*count >= 1, "idup");
        *count += 1;

        Self { inum: self.inum }
    }

    /// Drops this reference.
    pub fn put(self) {
        let mut refs = INODE_REFS.lock();
        let count = &mut refs[(self.inum - ROOT_INUM) as usize];
        assert!(*count >= 1, "iput");
        *count -= 1;
    }

    pub fn r#type(&self) -> InodeType {
        if self.inum == ROOT_INUM {
            InodeType::Dir
        } else {
            InodeType::File
        }
    }

    /// Returns the image bytes behind a file inode.
    pub fn data(&self) -> Result<&'static [u8], FsError> {
        if self.r#type() != InodeType::File {
            return Err(FsError::Type);
        }

        Ok(BOOT_FILES[(self.inum - ROOT_INUM - 1) as usize].data)
    }
}

/// A path under the boot image root.
#[derive(Debug, Clone, Copy)]
pub struct Path<'a>(&'a str);

impl<'a> Path<'a> {
    pub fn new(path: &'a str) -> Self {
        Self(path)
    }

    /// The last component, for process names.
    pub fn file_name(&self) -> &'a str {
        self.0.rsplit('/').next().unwrap_or(self.0)
    }

    /// Looks the path up in the boot image table and returns a counted
    /// reference (xv6's namei).
    pub fn resolve(&self) -> Result<Inode, FsError> {
        let trimmed = self.0.trim_matches('/');

        if trimmed.is_empty() {
            return Ok(Inode::get(ROOT_INUM));
        }

        // the root is the only directory there is
        if trimmed.contains('/') {
            return Err(FsError::Resolve);
        }

        for (i, file) in BOOT_FILES.iter().enumerate() {
            if file.name == trimmed {
                return Ok(Inode::get(ROOT_INUM + 1 + i as u32));
            }
        }

        Err(FsError::Resolve)
    }
}

static INITED: AtomicBool = AtomicBool::new(false);

/// One-shot root initialization, run from the first thread ever scheduled
/// (it must run in process context: resolving can take locks that sleep in a
/// fuller filesystem).
pub fn init(dev: u32) {
    assert!(
        INITED
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok(),
        "fs double init"
    );

    println!("fs: {} boot image(s) on dev {}", BOOT_FILES.len(), dev);
}
