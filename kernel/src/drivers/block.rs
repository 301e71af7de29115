//! Block device layer
//!
//! A block device is a capability record: identity plus an `Arc<dyn
//! BlockOps>` implementing sector access. Devices register by name
//! (`hd{a,b,c,d}` for the ATA disks); the filesystem resolves them through
//! the registry. Byte-granular helpers sit on top of the sector operations.

use alloc::{string::String, sync::Arc, vec, vec::Vec};

use spin::Mutex;

use crate::error::{FsError, KernelError, KernelResult};

/// Sector size shared by every device in this kernel.
pub const BLOCK_SIZE: usize = 512;

/// Sector-level operations a driver provides.
pub trait BlockOps: Send + Sync {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> KernelResult<()>;
    fn write_block(&self, block: u64, buf: &[u8]) -> KernelResult<()>;

    /// Multi-sector read; drivers with DMA or multi-sector PIO override.
    fn read_blocks(&self, start: u64, count: usize, buf: &mut [u8]) -> KernelResult<()> {
        for i in 0..count {
            self.read_block(start + i as u64, &mut buf[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE])?;
        }
        Ok(())
    }

    fn write_blocks(&self, start: u64, count: usize, buf: &[u8]) -> KernelResult<()> {
        for i in 0..count {
            self.write_block(start + i as u64, &buf[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE])?;
        }
        Ok(())
    }
}

/// A registered block device.
#[derive(Clone)]
pub struct BlockDevice {
    pub name: String,
    pub block_size: usize,
    pub num_blocks: u64,
    pub ops: Arc<dyn BlockOps>,
}

impl BlockDevice {
    pub fn size_bytes(&self) -> u64 {
        self.num_blocks * self.block_size as u64
    }

    pub fn read_block(&self, block: u64, buf: &mut [u8]) -> KernelResult<()> {
        if block >= self.num_blocks {
            return Err(KernelError::FsError(FsError::IoError));
        }
        self.ops.read_block(block, buf)
    }

    pub fn write_block(&self, block: u64, buf: &[u8]) -> KernelResult<()> {
        if block >= self.num_blocks {
            return Err(KernelError::FsError(FsError::IoError));
        }
        self.ops.write_block(block, buf)
    }

    /// Read `buf.len()` bytes starting at an arbitrary byte offset, going
    /// through whole sectors.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> KernelResult<()> {
        let mut sector = [0u8; BLOCK_SIZE];
        let mut remaining = buf.len();
        let mut pos = offset;
        let mut out = 0;

        while remaining > 0 {
            let block = pos / BLOCK_SIZE as u64;
            let in_block = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = remaining.min(BLOCK_SIZE - in_block);

            self.read_block(block, &mut sector)?;
            buf[out..out + chunk].copy_from_slice(&sector[in_block..in_block + chunk]);

            pos += chunk as u64;
            out += chunk;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Write `buf.len()` bytes at an arbitrary byte offset, read-modify-
    /// writing partial sectors.
    pub fn write_bytes(&self, offset: u64, buf: &[u8]) -> KernelResult<()> {
        let mut sector = [0u8; BLOCK_SIZE];
        let mut remaining = buf.len();
        let mut pos = offset;
        let mut taken = 0;

        while remaining > 0 {
            let block = pos / BLOCK_SIZE as u64;
            let in_block = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = remaining.min(BLOCK_SIZE - in_block);

            if chunk < BLOCK_SIZE {
                self.read_block(block, &mut sector)?;
            }
            sector[in_block..in_block + chunk].copy_from_slice(&buf[taken..taken + chunk]);
            self.write_block(block, &sector)?;

            pos += chunk as u64;
            taken += chunk;
            remaining -= chunk;
        }
        Ok(())
    }
}

static DEVICES: Mutex<Vec<BlockDevice>> = Mutex::new(Vec::new());

/// Reset the registry at boot.
#[cfg(target_os = "none")]
pub fn init() {
    DEVICES.lock().clear();
    log::info!(target: "block", "block device layer ready");
}

/// Register a device. The name must be unique.
pub fn register(device: BlockDevice) -> KernelResult<()> {
    let mut devices = DEVICES.lock();
    if devices.iter().any(|d| d.name == device.name) {
        return Err(KernelError::AlreadyExists {
            resource: "block device",
            id: 0,
        });
    }
    log::info!(
        target: "block",
        "registered {} ({} KiB, {} sectors)",
        device.name,
        device.size_bytes() / 1024,
        device.num_blocks
    );
    devices.push(device);
    Ok(())
}

/// Look a device up by name.
pub fn get(name: &str) -> Option<BlockDevice> {
    DEVICES.lock().iter().find(|d| d.name == name).cloned()
}

/// Memory-backed block device. Serves as a disk stand-in for tests and as a
/// scratch device when no ATA drive is present.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(num_blocks: u64) -> Self {
        Self {
            data: Mutex::new(vec![0; num_blocks as usize * BLOCK_SIZE]),
        }
    }

    /// Wrap into a registered-shape device record.
    pub fn device(name: &str, num_blocks: u64) -> BlockDevice {
        BlockDevice {
            name: String::from(name),
            block_size: BLOCK_SIZE,
            num_blocks,
            ops: Arc::new(Self::new(num_blocks)),
        }
    }
}

impl BlockOps for RamDisk {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> KernelResult<()> {
        let data = self.data.lock();
        let start = block as usize * BLOCK_SIZE;
        if start + BLOCK_SIZE > data.len() {
            return Err(KernelError::FsError(FsError::IoError));
        }
        buf[..BLOCK_SIZE].copy_from_slice(&data[start..start + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> KernelResult<()> {
        let mut data = self.data.lock();
        let start = block as usize * BLOCK_SIZE;
        if start + BLOCK_SIZE > data.len() {
            return Err(KernelError::FsError(FsError::IoError));
        }
        data[start..start + BLOCK_SIZE].copy_from_slice(&buf[..BLOCK_SIZE]);
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ramdisk_round_trip() {
        let dev = RamDisk::device("ram0", 16);
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xAA;
        block[511] = 0x55;
        dev.write_block(3, &block).unwrap();

        let mut back = [0u8; BLOCK_SIZE];
        dev.read_block(3, &mut back).unwrap();
        assert_eq!(back[0], 0xAA);
        assert_eq!(back[511], 0x55);
    }

    #[test]
    fn out_of_range_block_is_io_error() {
        let dev = RamDisk::device("ram1", 4);
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(dev.read_block(4, &mut buf).is_err());
        assert!(dev.write_block(100, &buf).is_err());
    }

    #[test]
    fn byte_helpers_cross_sector_boundaries() {
        let dev = RamDisk::device("ram2", 8);
        let payload: alloc::vec::Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        // Start mid-sector so both ends are partial
        dev.write_bytes(300, &payload).unwrap();

        let mut back = alloc::vec![0u8; 1000];
        dev.read_bytes(300, &mut back).unwrap();
        assert_eq!(back, payload);

        // Neighboring bytes untouched
        let mut edge = [0u8; 4];
        dev.read_bytes(296, &mut edge).unwrap();
        assert_eq!(edge, [0, 0, 0, 0]);
    }

    #[test]
    fn registry_rejects_duplicates() {
        // Unique names to avoid clashing with other tests' registrations
        register(RamDisk::device("ram-dup", 4)).unwrap();
        assert!(register(RamDisk::device("ram-dup", 4)).is_err());
        assert!(get("ram-dup").is_some());
        assert!(get("ram-missing").is_none());
    }
}
