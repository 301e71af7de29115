//! Virtual filesystem layer
//!
//! A [`VfsNode`] is a name, an inode number, a type, a size, and a
//! capability record of operations (`Arc<dyn NodeOps>`). Mounting installs
//! a node as the root; path resolution walks `finddir` from there.
//!
//! The file-descriptor table is process-wide in this revision (a known
//! simplification); 32 slots, allocated lowest-free-first.

use alloc::{string::String, sync::Arc};

use spin::Mutex;

use crate::error::{FsError, KernelError, KernelResult};

/// Maximum path length accepted from the syscall boundary.
pub const MAX_PATH: usize = 256;

/// Process-wide open-file limit.
pub const MAX_OPEN_FILES: usize = 32;

// Open flags (subset honored in this revision)
pub const O_RDONLY: u32 = 0x0000;
pub const O_WRONLY: u32 = 0x0001;
pub const O_RDWR: u32 = 0x0002;

/// Node type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// A directory listing entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode: u32,
    pub name: String,
    pub kind: NodeKind,
}

/// Per-node operations, implemented by each filesystem.
pub trait NodeOps: Send + Sync {
    fn read(&self, node: &VfsNode, offset: u64, buf: &mut [u8]) -> KernelResult<usize>;
    fn write(&self, node: &VfsNode, offset: u64, buf: &[u8]) -> KernelResult<usize>;

    fn open(&self, _node: &VfsNode, _flags: u32) -> KernelResult<()> {
        Ok(())
    }

    fn close(&self, _node: &VfsNode) {}

    /// `index`-th entry of a directory node.
    fn readdir(&self, node: &VfsNode, index: usize) -> Option<DirEntry>;

    /// Child of a directory node by name.
    fn finddir(&self, node: &VfsNode, name: &str) -> Option<VfsNode>;
}

/// A file or directory handle.
#[derive(Clone)]
pub struct VfsNode {
    pub name: String,
    pub inode: u32,
    pub kind: NodeKind,
    pub size: u32,
    pub ops: Arc<dyn NodeOps>,
}

/// An open file: node plus cursor.
struct FileDescriptor {
    node: VfsNode,
    offset: u64,
    #[allow(dead_code)] // recorded for future permission checks
    flags: u32,
}

static ROOT: Mutex<Option<VfsNode>> = Mutex::new(None);

static FD_TABLE: Mutex<[Option<FileDescriptor>; MAX_OPEN_FILES]> =
    Mutex::new([const { None }; MAX_OPEN_FILES]);

/// Reset the layer at boot.
#[cfg(target_os = "none")]
pub fn init() {
    *ROOT.lock() = None;
    log::info!(target: "vfs", "VFS ready ({} fd slots)", MAX_OPEN_FILES);
}

/// Install `root` as the filesystem root.
pub fn mount_root(root: VfsNode) {
    log::info!(target: "vfs", "mounted '{}' as /", root.name);
    *ROOT.lock() = Some(root);
}

/// Drop the root mount (unmount).
pub fn unmount_root() {
    *ROOT.lock() = None;
}

/// Resolve an absolute path to a node by walking `finddir` from the root.
pub fn resolve(path: &str) -> KernelResult<VfsNode> {
    if !path.starts_with('/') || path.len() > MAX_PATH {
        return Err(KernelError::FsError(FsError::InvalidPath));
    }
    let root = ROOT
        .lock()
        .clone()
        .ok_or(KernelError::FsError(FsError::NoRootFs))?;

    let mut node = root;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if node.kind != NodeKind::Directory {
            return Err(KernelError::FsError(FsError::NotADirectory));
        }
        node = node
            .ops
            .clone()
            .finddir(&node, component)
            .ok_or(KernelError::FsError(FsError::NotFound))?;
    }
    Ok(node)
}

/// Open a path; returns the new file descriptor.
pub fn open(path: &str, flags: u32) -> KernelResult<i64> {
    let node = resolve(path)?;
    node.ops.clone().open(&node, flags)?;

    let mut table = FD_TABLE.lock();
    let slot = table
        .iter()
        .position(|fd| fd.is_none())
        .ok_or(KernelError::FsError(FsError::TooManyOpenFiles))?;
    table[slot] = Some(FileDescriptor {
        node,
        offset: 0,
        flags,
    });
    Ok(slot as i64)
}

/// Close a file descriptor.
pub fn close(fd: i64) -> KernelResult<()> {
    let mut table = FD_TABLE.lock();
    let slot = fd_slot(fd)?;
    let descriptor = table[slot]
        .take()
        .ok_or(KernelError::FsError(FsError::BadFileDescriptor))?;
    descriptor.node.ops.clone().close(&descriptor.node);
    Ok(())
}

/// Read from a descriptor into a raw buffer, advancing the cursor.
pub fn read(fd: i64, buf: *mut u8, len: usize) -> KernelResult<i64> {
    if buf.is_null() {
        return Err(KernelError::SyscallError(
            crate::error::SyscallError::InvalidPointer { addr: 0 },
        ));
    }
    // SAFETY: the pointer is taken at face value, as everywhere on the
    // syscall path in this revision; the pages are reached through the
    // current (caller's) address space.
    let slice = unsafe { core::slice::from_raw_parts_mut(buf, len) };

    let mut table = FD_TABLE.lock();
    let slot = fd_slot(fd)?;
    let descriptor = table[slot]
        .as_mut()
        .ok_or(KernelError::FsError(FsError::BadFileDescriptor))?;

    let n = descriptor
        .node
        .ops
        .clone()
        .read(&descriptor.node, descriptor.offset, slice)?;
    descriptor.offset += n as u64;
    Ok(n as i64)
}

/// Write a raw buffer through a descriptor, advancing the cursor.
pub fn write(fd: i64, buf: *const u8, len: usize) -> KernelResult<i64> {
    if buf.is_null() {
        return Err(KernelError::SyscallError(
            crate::error::SyscallError::InvalidPointer { addr: 0 },
        ));
    }
    // SAFETY: as in `read`, the pointer is taken at face value.
    let slice = unsafe { core::slice::from_raw_parts(buf, len) };

    let mut table = FD_TABLE.lock();
    let slot = fd_slot(fd)?;
    let descriptor = table[slot]
        .as_mut()
        .ok_or(KernelError::FsError(FsError::BadFileDescriptor))?;

    let mut node = descriptor.node.clone();
    let n = node.ops.clone().write(&node, descriptor.offset, slice)?;
    descriptor.offset += n as u64;
    // Writes can grow the file; refresh the cached size
    if descriptor.offset > node.size as u64 {
        node.size = descriptor.offset as u32;
        descriptor.node = node;
    }
    Ok(n as i64)
}

fn fd_slot(fd: i64) -> KernelResult<usize> {
    if fd < 0 || fd as usize >= MAX_OPEN_FILES {
        return Err(KernelError::FsError(FsError::BadFileDescriptor));
    }
    Ok(fd as usize)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use super::*;
    use crate::test_sync::guard;

    /// In-memory single-file filesystem for exercising the indirection.
    struct MemFs {
        content: Mutex<alloc::vec::Vec<u8>>,
    }

    impl NodeOps for MemFs {
        fn read(&self, _node: &VfsNode, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
            let content = self.content.lock();
            if offset >= content.len() as u64 {
                return Ok(0);
            }
            let available = &content[offset as usize..];
            let n = buf.len().min(available.len());
            buf[..n].copy_from_slice(&available[..n]);
            Ok(n)
        }

        fn write(&self, _node: &VfsNode, offset: u64, buf: &[u8]) -> KernelResult<usize> {
            let mut content = self.content.lock();
            let end = offset as usize + buf.len();
            if content.len() < end {
                content.resize(end, 0);
            }
            content[offset as usize..end].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn readdir(&self, _node: &VfsNode, index: usize) -> Option<DirEntry> {
            (index == 0).then(|| DirEntry {
                inode: 1,
                name: String::from("note.txt"),
                kind: NodeKind::File,
            })
        }

        fn finddir(&self, node: &VfsNode, name: &str) -> Option<VfsNode> {
            (name == "note.txt").then(|| VfsNode {
                name: String::from("note.txt"),
                inode: 1,
                kind: NodeKind::File,
                size: self.content.lock().len() as u32,
                ops: node.ops.clone(),
            })
        }
    }

    fn mount_memfs() {
        let ops = Arc::new(MemFs {
            content: Mutex::new(alloc::vec::Vec::new()),
        });
        mount_root(VfsNode {
            name: String::from("memfs"),
            inode: 0,
            kind: NodeKind::Directory,
            size: 0,
            ops,
        });
    }

    fn drain_fds() {
        let mut table = FD_TABLE.lock();
        for slot in table.iter_mut() {
            *slot = None;
        }
    }

    #[test]
    fn open_write_read_round_trip() {
        let _g = guard();
        drain_fds();
        mount_memfs();

        let fd = open("/note.txt", O_RDWR).unwrap();
        let data = b"the quick brown fox";
        let written = write(fd, data.as_ptr(), data.len()).unwrap();
        assert_eq!(written, data.len() as i64);
        close(fd).unwrap();

        let fd = open("/note.txt", O_RDONLY).unwrap();
        let mut back = [0u8; 64];
        let n = read(fd, back.as_mut_ptr(), back.len()).unwrap();
        assert_eq!(&back[..n as usize], data);
        // Cursor advanced to EOF; the next read returns 0
        let n = read(fd, back.as_mut_ptr(), back.len()).unwrap();
        assert_eq!(n, 0);
        close(fd).unwrap();
        unmount_root();
    }

    #[test]
    fn missing_file_is_not_found() {
        let _g = guard();
        drain_fds();
        mount_memfs();
        assert!(matches!(
            open("/nope.txt", O_RDONLY),
            Err(KernelError::FsError(FsError::NotFound))
        ));
        unmount_root();
    }

    #[test]
    fn no_root_mounted_is_reported() {
        let _g = guard();
        drain_fds();
        unmount_root();
        assert!(matches!(
            open("/whatever", O_RDONLY),
            Err(KernelError::FsError(FsError::NoRootFs))
        ));
    }

    #[test]
    fn relative_paths_are_rejected() {
        let _g = guard();
        mount_memfs();
        assert!(matches!(
            open("note.txt", O_RDONLY),
            Err(KernelError::FsError(FsError::InvalidPath))
        ));
        unmount_root();
    }

    #[test]
    fn bad_descriptors_are_rejected() {
        let _g = guard();
        drain_fds();
        let mut buf = [0u8; 8];
        assert!(read(-1, buf.as_mut_ptr(), 8).is_err());
        assert!(read(7, buf.as_mut_ptr(), 8).is_err()); // slot never opened
        assert!(close(100).is_err());
    }

    #[test]
    fn fd_slots_are_finite_and_reusable() {
        let _g = guard();
        drain_fds();
        mount_memfs();

        let mut fds = alloc::vec::Vec::new();
        for _ in 0..MAX_OPEN_FILES {
            fds.push(open("/note.txt", O_RDONLY).unwrap());
        }
        assert!(matches!(
            open("/note.txt", O_RDONLY),
            Err(KernelError::FsError(FsError::TooManyOpenFiles))
        ));

        close(fds[0]).unwrap();
        let again = open("/note.txt", O_RDONLY).unwrap();
        assert_eq!(again, fds[0]); // lowest free slot

        for fd in fds.into_iter().skip(1) {
            close(fd).unwrap();
        }
        close(again).unwrap();
        unmount_root();
    }
}
