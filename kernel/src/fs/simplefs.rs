//! SimpleFS: a linear inode + direct-block filesystem
//!
//! On-disk layout (512-byte blocks):
//!
//! - Block 0: superblock (magic `0x53494D50`)
//! - Blocks 1..1+INODE_BLOCKS: packed array of 64-byte inodes
//! - Remaining blocks: data
//!
//! An inode carries its number, type, size, block count, and 12 direct
//! block pointers; files top out at 6 KiB. A directory is a file whose data
//! blocks hold packed 64-byte entries (inode number, 56-byte name, type);
//! entry inode 0 means unused, which works because inode 0 is always the
//! root directory and never appears inside one.
//!
//! Free-space state (block and inode bitmaps) is rebuilt in memory at mount
//! by scanning the inode table; only the superblock's free counters persist.

use alloc::{string::String, sync::Arc, vec, vec::Vec};

use spin::Mutex;

use super::vfs::{DirEntry, NodeKind, NodeOps, VfsNode};
use crate::drivers::block::{BlockDevice, BLOCK_SIZE};
use crate::error::{FsError, KernelError, KernelResult};

pub const SIMPLEFS_MAGIC: u32 = 0x53494D50;
pub const SIMPLEFS_VERSION: u32 = 1;

pub const MAX_FILENAME: usize = 56;
pub const MAX_INODES: usize = 256;
/// Blocks holding the packed inode table.
pub const INODE_BLOCKS: usize = MAX_INODES * INODE_SIZE / BLOCK_SIZE;
pub const MAX_FILE_BLOCKS: usize = 12;

const INODE_SIZE: usize = 64;
const DIRENT_SIZE: usize = 64;
const DIRENTS_PER_BLOCK: usize = BLOCK_SIZE / DIRENT_SIZE;

const ROOT_INODE: u32 = 0;

const KIND_FREE: u32 = 0;
const KIND_FILE: u32 = 1;
const KIND_DIR: u32 = 2;

/// Superblock, block 0. 9 little-endian u32 fields, zero-padded to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    pub num_blocks: u32,
    pub num_inodes: u32,
    pub first_inode_block: u32,
    pub first_data_block: u32,
    pub free_blocks: u32,
    pub free_inodes: u32,
}

impl Superblock {
    fn to_block(self) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        let fields = [
            self.magic,
            self.version,
            self.block_size,
            self.num_blocks,
            self.num_inodes,
            self.first_inode_block,
            self.first_data_block,
            self.free_blocks,
            self.free_inodes,
        ];
        for (i, f) in fields.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&f.to_le_bytes());
        }
        buf
    }

    fn from_block(buf: &[u8]) -> Self {
        let f = |i: usize| u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        Self {
            magic: f(0),
            version: f(1),
            block_size: f(2),
            num_blocks: f(3),
            num_inodes: f(4),
            first_inode_block: f(5),
            first_data_block: f(6),
            free_blocks: f(7),
            free_inodes: f(8),
        }
    }
}

/// One 64-byte inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Inode {
    number: u32,
    kind: u32,
    size: u32,
    blocks: u32,
    direct: [u32; MAX_FILE_BLOCKS],
}

impl Inode {
    fn empty(number: u32) -> Self {
        Self {
            number,
            kind: KIND_FREE,
            size: 0,
            blocks: 0,
            direct: [0; MAX_FILE_BLOCKS],
        }
    }

    fn to_bytes(self) -> [u8; INODE_SIZE] {
        let mut buf = [0u8; INODE_SIZE];
        buf[0..4].copy_from_slice(&self.number.to_le_bytes());
        buf[4..8].copy_from_slice(&self.kind.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.blocks.to_le_bytes());
        for (i, d) in self.direct.iter().enumerate() {
            buf[16 + i * 4..20 + i * 4].copy_from_slice(&d.to_le_bytes());
        }
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let f = |i: usize| u32::from_le_bytes(buf[i..i + 4].try_into().unwrap());
        let mut direct = [0u32; MAX_FILE_BLOCKS];
        for (i, d) in direct.iter_mut().enumerate() {
            *d = f(16 + i * 4);
        }
        Self {
            number: f(0),
            kind: f(4),
            size: f(8),
            blocks: f(12),
            direct,
        }
    }

    fn node_kind(&self) -> Option<NodeKind> {
        match self.kind {
            KIND_FILE => Some(NodeKind::File),
            KIND_DIR => Some(NodeKind::Directory),
            _ => None,
        }
    }
}

/// One 64-byte directory entry.
#[derive(Debug, Clone)]
struct DiskDirEntry {
    inode: u32,
    name: [u8; MAX_FILENAME],
    kind: u32,
}

impl DiskDirEntry {
    fn to_bytes(&self) -> [u8; DIRENT_SIZE] {
        let mut buf = [0u8; DIRENT_SIZE];
        buf[0..4].copy_from_slice(&self.inode.to_le_bytes());
        buf[4..4 + MAX_FILENAME].copy_from_slice(&self.name);
        buf[60..64].copy_from_slice(&self.kind.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let mut name = [0u8; MAX_FILENAME];
        name.copy_from_slice(&buf[4..4 + MAX_FILENAME]);
        Self {
            inode: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            name,
            kind: u32::from_le_bytes(buf[60..64].try_into().unwrap()),
        }
    }

    fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(MAX_FILENAME);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// Entry inode 0 marks an unused slot; the root (inode 0) never appears
    /// inside a directory.
    fn is_used(&self) -> bool {
        self.inode != 0
    }
}

/// Mounted filesystem state.
pub struct SimpleFs {
    device: BlockDevice,
    superblock: Superblock,
    block_used: Vec<bool>,
    inode_used: Vec<bool>,
}

impl SimpleFs {
    // -- inode table access ------------------------------------------------

    fn inode_location(&self, number: u32) -> (u64, usize) {
        let byte = number as usize * INODE_SIZE;
        (
            self.superblock.first_inode_block as u64 + (byte / BLOCK_SIZE) as u64,
            byte % BLOCK_SIZE,
        )
    }

    fn read_inode(&self, number: u32) -> KernelResult<Inode> {
        if number >= self.superblock.num_inodes {
            return Err(KernelError::FsError(FsError::NotFound));
        }
        let (block, offset) = self.inode_location(number);
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.read_block(block, &mut buf)?;
        Ok(Inode::from_bytes(&buf[offset..offset + INODE_SIZE]))
    }

    fn write_inode(&mut self, inode: &Inode) -> KernelResult<()> {
        let (block, offset) = self.inode_location(inode.number);
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.read_block(block, &mut buf)?;
        buf[offset..offset + INODE_SIZE].copy_from_slice(&inode.to_bytes());
        self.device.write_block(block, &buf)
    }

    // -- allocation --------------------------------------------------------

    fn alloc_inode(&mut self) -> KernelResult<u32> {
        let number = self
            .inode_used
            .iter()
            .position(|used| !used)
            .ok_or(KernelError::FsError(FsError::DeviceFull))?;
        self.inode_used[number] = true;
        self.superblock.free_inodes -= 1;
        Ok(number as u32)
    }

    fn alloc_block(&mut self) -> KernelResult<u32> {
        let first_data = self.superblock.first_data_block as usize;
        let number = self.block_used[first_data..]
            .iter()
            .position(|used| !used)
            .map(|i| i + first_data)
            .ok_or(KernelError::FsError(FsError::DeviceFull))?;
        self.block_used[number] = true;
        self.superblock.free_blocks -= 1;
        Ok(number as u32)
    }

    fn flush_superblock(&self) -> KernelResult<()> {
        self.device.write_block(0, &self.superblock.to_block())
    }

    // -- file data ---------------------------------------------------------

    fn read_at(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        if offset >= inode.size as u64 {
            return Ok(0);
        }
        let mut remaining = buf.len().min((inode.size as u64 - offset) as usize);
        let mut pos = offset as usize;
        let mut out = 0;
        let mut sector = [0u8; BLOCK_SIZE];

        while remaining > 0 {
            let index = pos / BLOCK_SIZE;
            if index >= inode.blocks as usize {
                break;
            }
            let in_block = pos % BLOCK_SIZE;
            let chunk = remaining.min(BLOCK_SIZE - in_block);

            self.device
                .read_block(inode.direct[index] as u64, &mut sector)?;
            buf[out..out + chunk].copy_from_slice(&sector[in_block..in_block + chunk]);

            pos += chunk;
            out += chunk;
            remaining -= chunk;
        }
        Ok(out)
    }

    fn write_at(&mut self, number: u32, offset: u64, buf: &[u8]) -> KernelResult<usize> {
        let mut inode = self.read_inode(number)?;
        let end = offset as usize + buf.len();
        if end > MAX_FILE_BLOCKS * BLOCK_SIZE {
            return Err(KernelError::FsError(FsError::FileTooLarge));
        }

        // Grow the direct-block array to cover the write
        let blocks_needed = end.div_ceil(BLOCK_SIZE);
        while (inode.blocks as usize) < blocks_needed {
            let fresh = self.alloc_block()?;
            inode.direct[inode.blocks as usize] = fresh;
            inode.blocks += 1;
        }

        let mut remaining = buf.len();
        let mut pos = offset as usize;
        let mut taken = 0;
        let mut sector = [0u8; BLOCK_SIZE];

        while remaining > 0 {
            let index = pos / BLOCK_SIZE;
            let in_block = pos % BLOCK_SIZE;
            let chunk = remaining.min(BLOCK_SIZE - in_block);
            let block = inode.direct[index] as u64;

            if chunk < BLOCK_SIZE {
                self.device.read_block(block, &mut sector)?;
            }
            sector[in_block..in_block + chunk].copy_from_slice(&buf[taken..taken + chunk]);
            self.device.write_block(block, &sector)?;

            pos += chunk;
            taken += chunk;
            remaining -= chunk;
        }

        if end as u32 > inode.size {
            inode.size = end as u32;
        }
        self.write_inode(&inode)?;
        self.flush_superblock()?;
        Ok(taken)
    }

    // -- directories -------------------------------------------------------

    fn dir_entry_at(&self, dir: &Inode, index: usize) -> KernelResult<Option<DiskDirEntry>> {
        let mut seen = 0;
        let mut sector = [0u8; BLOCK_SIZE];
        for b in 0..dir.blocks as usize {
            self.device.read_block(dir.direct[b] as u64, &mut sector)?;
            for e in 0..DIRENTS_PER_BLOCK {
                let entry = DiskDirEntry::from_bytes(&sector[e * DIRENT_SIZE..(e + 1) * DIRENT_SIZE]);
                if !entry.is_used() {
                    continue;
                }
                if seen == index {
                    return Ok(Some(entry));
                }
                seen += 1;
            }
        }
        Ok(None)
    }

    fn dir_lookup(&self, dir: &Inode, name: &str) -> KernelResult<Option<DiskDirEntry>> {
        let mut sector = [0u8; BLOCK_SIZE];
        for b in 0..dir.blocks as usize {
            self.device.read_block(dir.direct[b] as u64, &mut sector)?;
            for e in 0..DIRENTS_PER_BLOCK {
                let entry = DiskDirEntry::from_bytes(&sector[e * DIRENT_SIZE..(e + 1) * DIRENT_SIZE]);
                if entry.is_used() && entry.name_str() == name {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }

    fn add_dir_entry(&mut self, dir_number: u32, entry: &DiskDirEntry) -> KernelResult<()> {
        let mut dir = self.read_inode(dir_number)?;
        let mut sector = [0u8; BLOCK_SIZE];

        // First free slot in the existing blocks
        for b in 0..dir.blocks as usize {
            let block = dir.direct[b] as u64;
            self.device.read_block(block, &mut sector)?;
            for e in 0..DIRENTS_PER_BLOCK {
                let existing =
                    DiskDirEntry::from_bytes(&sector[e * DIRENT_SIZE..(e + 1) * DIRENT_SIZE]);
                if !existing.is_used() {
                    sector[e * DIRENT_SIZE..(e + 1) * DIRENT_SIZE]
                        .copy_from_slice(&entry.to_bytes());
                    return self.device.write_block(block, &sector);
                }
            }
        }

        // Directory full: extend it by one block
        if dir.blocks as usize >= MAX_FILE_BLOCKS {
            return Err(KernelError::FsError(FsError::DeviceFull));
        }
        let fresh = self.alloc_block()?;
        dir.direct[dir.blocks as usize] = fresh;
        dir.blocks += 1;
        dir.size += BLOCK_SIZE as u32;
        self.write_inode(&dir)?;
        self.flush_superblock()?;

        sector = [0u8; BLOCK_SIZE];
        sector[..DIRENT_SIZE].copy_from_slice(&entry.to_bytes());
        self.device.write_block(fresh as u64, &sector)
    }

    /// Create an empty file in the root directory.
    pub fn create_file(&mut self, name: &str) -> KernelResult<u32> {
        self.create_node(name, KIND_FILE)
    }

    /// Create an empty directory in the root directory.
    pub fn create_dir(&mut self, name: &str) -> KernelResult<u32> {
        self.create_node(name, KIND_DIR)
    }

    fn create_node(&mut self, name: &str, kind: u32) -> KernelResult<u32> {
        if name.is_empty() || name.len() > MAX_FILENAME {
            return Err(KernelError::FsError(FsError::InvalidPath));
        }
        let root = self.read_inode(ROOT_INODE)?;
        if self.dir_lookup(&root, name)?.is_some() {
            return Err(KernelError::FsError(FsError::AlreadyExists));
        }

        let number = self.alloc_inode()?;
        let mut inode = Inode::empty(number);
        inode.kind = kind;
        self.write_inode(&inode)?;

        let mut entry_name = [0u8; MAX_FILENAME];
        entry_name[..name.len()].copy_from_slice(name.as_bytes());
        self.add_dir_entry(
            ROOT_INODE,
            &DiskDirEntry {
                inode: number,
                name: entry_name,
                kind,
            },
        )?;
        self.flush_superblock()?;
        Ok(number)
    }
}

/// Write a fresh, empty filesystem onto `device`.
pub fn format(device: &BlockDevice) -> KernelResult<()> {
    let num_blocks = device.num_blocks.min(u32::MAX as u64) as u32;
    let first_data = 1 + INODE_BLOCKS as u32;
    if num_blocks <= first_data {
        return Err(KernelError::FsError(FsError::IoError));
    }

    // Zero the inode table
    let zero = [0u8; BLOCK_SIZE];
    for b in 1..first_data {
        device.write_block(b as u64, &zero)?;
    }

    // Root directory: inode 0, no entries yet
    let mut root = Inode::empty(ROOT_INODE);
    root.kind = KIND_DIR;
    let mut table_block = [0u8; BLOCK_SIZE];
    device.read_block(1, &mut table_block)?;
    table_block[..INODE_SIZE].copy_from_slice(&root.to_bytes());
    device.write_block(1, &table_block)?;

    let superblock = Superblock {
        magic: SIMPLEFS_MAGIC,
        version: SIMPLEFS_VERSION,
        block_size: BLOCK_SIZE as u32,
        num_blocks,
        num_inodes: MAX_INODES as u32,
        first_inode_block: 1,
        first_data_block: first_data,
        free_blocks: num_blocks - first_data,
        free_inodes: MAX_INODES as u32 - 1,
    };
    device.write_block(0, &superblock.to_block())?;
    log::info!(
        target: "simplefs",
        "formatted {}: {} blocks, {} inodes",
        device.name,
        num_blocks,
        MAX_INODES
    );
    Ok(())
}

/// Read and sanity-check the superblock, rebuild the in-memory bitmaps, and
/// return the root as a VFS node.
pub fn mount(device: BlockDevice) -> KernelResult<VfsNode> {
    mount_with_handle(device).map(|(root, _)| root)
}

/// As [`mount`], but also hand back the filesystem itself for direct
/// operations (file creation, statistics) outside the VFS path.
pub fn mount_with_handle(
    device: BlockDevice,
) -> KernelResult<(VfsNode, Arc<Mutex<SimpleFs>>)> {
    let mut buf = [0u8; BLOCK_SIZE];
    device.read_block(0, &mut buf)?;
    let superblock = Superblock::from_block(&buf);

    if superblock.magic != SIMPLEFS_MAGIC || superblock.version != SIMPLEFS_VERSION {
        return Err(KernelError::FsError(FsError::BadSuperblock));
    }
    if superblock.block_size as usize != BLOCK_SIZE
        || superblock.num_blocks as u64 > device.num_blocks
        || superblock.first_data_block >= superblock.num_blocks
        || superblock.num_inodes == 0
    {
        return Err(KernelError::FsError(FsError::BadSuperblock));
    }

    let mut fs = SimpleFs {
        device,
        superblock,
        block_used: vec![false; superblock.num_blocks as usize],
        inode_used: vec![false; superblock.num_inodes as usize],
    };

    // Metadata blocks are permanently used
    for b in 0..superblock.first_data_block as usize {
        fs.block_used[b] = true;
    }

    // Scan the inode table to rebuild allocation state
    for number in 0..superblock.num_inodes {
        let inode = fs.read_inode(number)?;
        if inode.kind == KIND_FREE {
            continue;
        }
        fs.inode_used[number as usize] = true;
        for b in 0..inode.blocks as usize {
            let block = inode.direct[b] as usize;
            if block < fs.block_used.len() {
                fs.block_used[block] = true;
            }
        }
    }

    // The persisted free counters can drift from the table after an
    // interrupted session; the scan is authoritative.
    fs.superblock.free_inodes = fs.inode_used.iter().filter(|used| !**used).count() as u32;
    fs.superblock.free_blocks = fs.block_used.iter().filter(|used| !**used).count() as u32;

    let root = fs.read_inode(ROOT_INODE)?;
    if root.node_kind() != Some(NodeKind::Directory) {
        return Err(KernelError::FsError(FsError::BadSuperblock));
    }

    let name = String::from(fs.device.name.as_str());
    let handle = Arc::new(Mutex::new(fs));
    let ops = Arc::new(SimpleFsOps { fs: handle.clone() });
    Ok((
        VfsNode {
            name,
            inode: ROOT_INODE,
            kind: NodeKind::Directory,
            size: root.size,
            ops,
        },
        handle,
    ))
}

/// VFS operation record backed by a shared [`SimpleFs`].
pub struct SimpleFsOps {
    fs: Arc<Mutex<SimpleFs>>,
}

impl SimpleFsOps {
    /// Direct access to the filesystem for tooling (create, format checks).
    pub fn filesystem(&self) -> Arc<Mutex<SimpleFs>> {
        self.fs.clone()
    }
}

impl NodeOps for SimpleFsOps {
    fn read(&self, node: &VfsNode, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let fs = self.fs.lock();
        let inode = fs.read_inode(node.inode)?;
        fs.read_at(&inode, offset, buf)
    }

    fn write(&self, node: &VfsNode, offset: u64, buf: &[u8]) -> KernelResult<usize> {
        if node.kind == NodeKind::Directory {
            return Err(KernelError::FsError(FsError::IsADirectory));
        }
        self.fs.lock().write_at(node.inode, offset, buf)
    }

    fn readdir(&self, node: &VfsNode, index: usize) -> Option<DirEntry> {
        let fs = self.fs.lock();
        let dir = fs.read_inode(node.inode).ok()?;
        let entry = fs.dir_entry_at(&dir, index).ok()??;
        Some(DirEntry {
            inode: entry.inode,
            name: String::from(entry.name_str()),
            kind: if entry.kind == KIND_DIR {
                NodeKind::Directory
            } else {
                NodeKind::File
            },
        })
    }

    fn finddir(&self, node: &VfsNode, name: &str) -> Option<VfsNode> {
        let fs = self.fs.lock();
        let dir = fs.read_inode(node.inode).ok()?;
        let entry = fs.dir_lookup(&dir, name).ok()??;
        let inode = fs.read_inode(entry.inode).ok()?;
        Some(VfsNode {
            name: String::from(entry.name_str()),
            inode: entry.inode,
            kind: inode.node_kind()?,
            size: inode.size,
            ops: Arc::new(SimpleFsOps {
                fs: self.fs.clone(),
            }),
        })
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use super::*;
    use crate::drivers::block::RamDisk;

    fn fresh_fs() -> (VfsNode, Arc<Mutex<SimpleFs>>) {
        let device = RamDisk::device("test-disk", 128);
        format(&device).unwrap();
        mount_with_handle(device).unwrap()
    }

    #[test]
    fn format_writes_valid_superblock() {
        let device = RamDisk::device("sb-disk", 128);
        format(&device).unwrap();

        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(0, &mut buf).unwrap();
        let sb = Superblock::from_block(&buf);
        assert_eq!(sb.magic, SIMPLEFS_MAGIC);
        assert_eq!(sb.version, SIMPLEFS_VERSION);
        assert_eq!(sb.block_size, BLOCK_SIZE as u32);
        assert_eq!(sb.num_blocks, 128);
        assert_eq!(sb.num_inodes, MAX_INODES as u32);
        assert_eq!(sb.first_inode_block, 1);
        assert_eq!(sb.first_data_block, 1 + INODE_BLOCKS as u32);
        // Root inode consumed one
        assert_eq!(sb.free_inodes, MAX_INODES as u32 - 1);
    }

    #[test]
    fn mount_rejects_unformatted_device() {
        let device = RamDisk::device("raw-disk", 64);
        assert!(matches!(
            mount(device),
            Err(KernelError::FsError(FsError::BadSuperblock))
        ));
    }

    #[test]
    fn superblock_serialization_round_trips() {
        let sb = Superblock {
            magic: SIMPLEFS_MAGIC,
            version: 1,
            block_size: 512,
            num_blocks: 1000,
            num_inodes: 256,
            first_inode_block: 1,
            first_data_block: 33,
            free_blocks: 900,
            free_inodes: 200,
        };
        assert_eq!(Superblock::from_block(&sb.to_block()), sb);
    }

    #[test]
    fn inode_layout_is_64_bytes() {
        let mut inode = Inode::empty(5);
        inode.kind = KIND_FILE;
        inode.size = 1234;
        inode.blocks = 3;
        inode.direct[0] = 40;
        inode.direct[11] = 99;
        let bytes = inode.to_bytes();
        assert_eq!(bytes.len(), 64);
        assert_eq!(Inode::from_bytes(&bytes), inode);
    }

    #[test]
    fn create_write_read_through_vfs_ops() {
        let (root, fs) = fresh_fs();
        fs.lock().create_file("hello.txt").unwrap();

        let node = root.ops.finddir(&root, "hello.txt").unwrap();
        assert_eq!(node.kind, NodeKind::File);

        let data = b"persistent bytes";
        let n = node.ops.write(&node, 0, data).unwrap();
        assert_eq!(n, data.len());

        let mut back = [0u8; 64];
        let n = node.ops.read(&node, 0, &mut back).unwrap();
        assert_eq!(&back[..n], data);

        // Reads past EOF return 0
        assert_eq!(node.ops.read(&node, 1000, &mut back).unwrap(), 0);
    }

    #[test]
    fn writes_spanning_blocks_round_trip() {
        let (root, fs) = fresh_fs();
        fs.lock().create_file("big.bin").unwrap();
        let node = root.ops.finddir(&root, "big.bin").unwrap();

        let data: Vec<u8> = (0..2000u32).map(|i| (i % 253) as u8).collect();
        node.ops.write(&node, 100, &data).unwrap();

        let mut back = vec![0u8; 2000];
        let node = root.ops.finddir(&root, "big.bin").unwrap(); // refresh size
        let n = node.ops.read(&node, 100, &mut back).unwrap();
        assert_eq!(n, 2000);
        assert_eq!(back, data);
    }

    #[test]
    fn file_size_is_capped_by_direct_blocks() {
        let (root, fs) = fresh_fs();
        fs.lock().create_file("cap.bin").unwrap();
        let node = root.ops.finddir(&root, "cap.bin").unwrap();

        let too_big = vec![0u8; MAX_FILE_BLOCKS * BLOCK_SIZE + 1];
        assert!(matches!(
            node.ops.write(&node, 0, &too_big),
            Err(KernelError::FsError(FsError::FileTooLarge))
        ));

        let exactly = vec![7u8; MAX_FILE_BLOCKS * BLOCK_SIZE];
        assert_eq!(node.ops.write(&node, 0, &exactly).unwrap(), exactly.len());
    }

    #[test]
    fn directory_listing_and_duplicates() {
        let (root, fs) = fresh_fs();
        {
            let mut fs = fs.lock();
            fs.create_file("a.txt").unwrap();
            fs.create_file("b.txt").unwrap();
            fs.create_dir("sub").unwrap();
            assert!(matches!(
                fs.create_file("a.txt"),
                Err(KernelError::FsError(FsError::AlreadyExists))
            ));
        }

        let mut names = std::vec::Vec::new();
        let mut index = 0;
        while let Some(entry) = root.ops.readdir(&root, index) {
            names.push(entry.name);
            index += 1;
        }
        assert_eq!(names, ["a.txt", "b.txt", "sub"]);

        let sub = root.ops.finddir(&root, "sub").unwrap();
        assert_eq!(sub.kind, NodeKind::Directory);
    }

    #[test]
    fn state_survives_remount() {
        let device = RamDisk::device("persist-disk", 128);
        format(&device).unwrap();

        {
            let (root, fs) = mount_with_handle(device.clone()).unwrap();
            fs.lock().create_file("keep.txt").unwrap();
            let node = root.ops.finddir(&root, "keep.txt").unwrap();
            node.ops.write(&node, 0, b"still here").unwrap();
        }

        // Remount from the same backing store
        let root = mount(device).unwrap();
        let node = root.ops.finddir(&root, "keep.txt").unwrap();
        let mut back = [0u8; 16];
        let n = node.ops.read(&node, 0, &mut back).unwrap();
        assert_eq!(&back[..n], b"still here");
    }

    #[test]
    fn mounts_through_vfs_and_syscalls_shape() {
        let _g = crate::test_sync::guard();
        let (root, fs) = fresh_fs();
        fs.lock().create_file("via-vfs.txt").unwrap();
        crate::fs::vfs::mount_root(root);

        let fd = crate::fs::vfs::open("/via-vfs.txt", crate::fs::vfs::O_RDWR).unwrap();
        let data = b"through the fd table";
        crate::fs::vfs::write(fd, data.as_ptr(), data.len()).unwrap();
        crate::fs::vfs::close(fd).unwrap();

        let fd = crate::fs::vfs::open("/via-vfs.txt", crate::fs::vfs::O_RDONLY).unwrap();
        let mut back = [0u8; 32];
        let n = crate::fs::vfs::read(fd, back.as_mut_ptr(), back.len()).unwrap();
        assert_eq!(&back[..n as usize], data);
        crate::fs::vfs::close(fd).unwrap();
        crate::fs::vfs::unmount_root();
    }
}
