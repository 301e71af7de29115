//! ATA PIO disk driver
//!
//! Polled PIO on the two legacy channels (primary 0x1F0, secondary 0x170).
//! Each detected drive registers as a block device named `hd{a,b,c,d}`.
//! 28-bit LBA addressing; one sector per data phase.

use alloc::{format, sync::Arc};

use spin::Mutex;
use x86_64::instructions::port::{Port, PortReadOnly, PortWriteOnly};

use super::block::{self, BlockDevice, BlockOps, BLOCK_SIZE};
use crate::error::{FsError, KernelError, KernelResult};

const ATA_PRIMARY_IO: u16 = 0x1F0;
const ATA_SECONDARY_IO: u16 = 0x170;

// Register offsets from the channel base
const REG_DATA: u16 = 0;
const REG_SECTOR_COUNT: u16 = 2;
const REG_LBA_LOW: u16 = 3;
const REG_LBA_MID: u16 = 4;
const REG_LBA_HIGH: u16 = 5;
const REG_DRIVE_SELECT: u16 = 6;
const REG_STATUS: u16 = 7;
const REG_COMMAND: u16 = 7;

// Status bits
const STATUS_ERR: u8 = 0x01;
const STATUS_DRQ: u8 = 0x08;
const STATUS_RDY: u8 = 0x40;
const STATUS_BSY: u8 = 0x80;

// Commands
const CMD_READ_PIO: u8 = 0x20;
const CMD_WRITE_PIO: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xE7;
const CMD_IDENTIFY: u8 = 0xEC;

const POLL_LIMIT: u32 = 100_000;

/// One drive slot on a channel.
struct AtaDrive {
    base_io: u16,
    /// 0 = master, 1 = slave
    drive: u8,
    /// Total sectors (LBA28)
    sectors: u64,
    model: [u8; 40],
}

impl AtaDrive {
    fn status(&self) -> u8 {
        let mut port: PortReadOnly<u8> = PortReadOnly::new(self.base_io + REG_STATUS);
        // SAFETY: reading the ATA status register has no side effects beyond
        // clearing the interrupt condition, which polling relies on.
        unsafe { port.read() }
    }

    fn wait_ready(&self) -> KernelResult<()> {
        for _ in 0..POLL_LIMIT {
            let status = self.status();
            if status & STATUS_BSY == 0 && status & STATUS_RDY != 0 {
                return Ok(());
            }
        }
        Err(KernelError::FsError(FsError::IoError))
    }

    fn wait_drq(&self) -> KernelResult<()> {
        for _ in 0..POLL_LIMIT {
            let status = self.status();
            if status & STATUS_ERR != 0 {
                return Err(KernelError::FsError(FsError::IoError));
            }
            if status & STATUS_DRQ != 0 {
                return Ok(());
            }
        }
        Err(KernelError::FsError(FsError::IoError))
    }

    /// Program the drive-select and LBA registers for one sector at `lba`.
    fn select_lba(&self, lba: u64) {
        // SAFETY: standard ATA register programming on this channel; the
        // drive was identified at init.
        unsafe {
            let mut select: PortWriteOnly<u8> =
                PortWriteOnly::new(self.base_io + REG_DRIVE_SELECT);
            let mut count: PortWriteOnly<u8> =
                PortWriteOnly::new(self.base_io + REG_SECTOR_COUNT);
            let mut low: PortWriteOnly<u8> = PortWriteOnly::new(self.base_io + REG_LBA_LOW);
            let mut mid: PortWriteOnly<u8> = PortWriteOnly::new(self.base_io + REG_LBA_MID);
            let mut high: PortWriteOnly<u8> = PortWriteOnly::new(self.base_io + REG_LBA_HIGH);

            select.write(0xE0 | (self.drive << 4) | ((lba >> 24) & 0x0F) as u8);
            count.write(1);
            low.write(lba as u8);
            mid.write((lba >> 8) as u8);
            high.write((lba >> 16) as u8);
        }
    }

    fn command(&self, cmd: u8) {
        let mut port: PortWriteOnly<u8> = PortWriteOnly::new(self.base_io + REG_COMMAND);
        // SAFETY: command issue after proper register setup.
        unsafe { port.write(cmd) }
    }

    fn read_sector(&self, lba: u64, buf: &mut [u8]) -> KernelResult<()> {
        self.wait_ready()?;
        self.select_lba(lba);
        self.command(CMD_READ_PIO);
        self.wait_drq()?;

        let mut data: Port<u16> = Port::new(self.base_io + REG_DATA);
        for chunk in buf[..BLOCK_SIZE].chunks_exact_mut(2) {
            // SAFETY: DRQ is set; the drive has one sector queued.
            let word = unsafe { data.read() };
            chunk[0] = word as u8;
            chunk[1] = (word >> 8) as u8;
        }
        Ok(())
    }

    fn write_sector(&self, lba: u64, buf: &[u8]) -> KernelResult<()> {
        self.wait_ready()?;
        self.select_lba(lba);
        self.command(CMD_WRITE_PIO);
        self.wait_drq()?;

        let mut data: Port<u16> = Port::new(self.base_io + REG_DATA);
        for chunk in buf[..BLOCK_SIZE].chunks_exact(2) {
            let word = chunk[0] as u16 | ((chunk[1] as u16) << 8);
            // SAFETY: DRQ is set; the drive expects one sector of data.
            unsafe { data.write(word) };
        }

        self.command(CMD_CACHE_FLUSH);
        self.wait_ready()
    }

    /// IDENTIFY the drive. `None` when the slot is empty.
    fn identify(base_io: u16, drive: u8) -> Option<AtaDrive> {
        // SAFETY: IDENTIFY protocol on a possibly absent drive; a floating
        // bus reads 0 or 0xFF status, both rejected below.
        unsafe {
            let mut select: PortWriteOnly<u8> = PortWriteOnly::new(base_io + REG_DRIVE_SELECT);
            select.write(0xA0 | (drive << 4));

            let mut status_port: PortReadOnly<u8> = PortReadOnly::new(base_io + REG_STATUS);
            // Settle delay: four status reads
            for _ in 0..4 {
                let _ = status_port.read();
            }

            let mut command: PortWriteOnly<u8> = PortWriteOnly::new(base_io + REG_COMMAND);
            command.write(CMD_IDENTIFY);

            let status = status_port.read();
            if status == 0 || status == 0xFF {
                return None;
            }
        }

        let probe = AtaDrive {
            base_io,
            drive,
            sectors: 0,
            model: [b' '; 40],
        };
        probe.wait_ready().ok()?;
        probe.wait_drq().ok()?;

        let mut identify = [0u16; 256];
        let mut data: Port<u16> = Port::new(base_io + REG_DATA);
        for word in identify.iter_mut() {
            // SAFETY: DRQ is set; 256 words of identify data are queued.
            *word = unsafe { data.read() };
        }

        // Words 60-61: total LBA28 sectors
        let sectors = ((identify[61] as u64) << 16) | identify[60] as u64;
        if sectors == 0 {
            return None;
        }

        // Words 27-46: model string, byte-swapped pairs
        let mut model = [b' '; 40];
        for i in 0..20 {
            model[i * 2] = (identify[27 + i] >> 8) as u8;
            model[i * 2 + 1] = identify[27 + i] as u8;
        }

        Some(AtaDrive {
            base_io,
            drive,
            sectors,
            model,
        })
    }

    fn model_str(&self) -> &str {
        core::str::from_utf8(&self.model)
            .unwrap_or("")
            .trim_end()
    }
}

/// The data phase is one sector at a time and the channel registers are
/// shared between commands, so serialize per drive.
struct LockedDrive(Mutex<AtaDrive>);

impl BlockOps for LockedDrive {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> KernelResult<()> {
        self.0.lock().read_sector(block, buf)
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> KernelResult<()> {
        self.0.lock().write_sector(block, buf)
    }
}

/// Probe the four legacy slots and register every present drive.
pub fn init() {
    let slots = [
        (ATA_PRIMARY_IO, 0u8),
        (ATA_PRIMARY_IO, 1u8),
        (ATA_SECONDARY_IO, 0u8),
        (ATA_SECONDARY_IO, 1u8),
    ];

    for (index, (base_io, drive)) in slots.iter().enumerate() {
        let Some(found) = AtaDrive::identify(*base_io, *drive) else {
            continue;
        };

        let name = format!("hd{}", (b'a' + index as u8) as char);
        log::info!(
            target: "ata",
            "{}: {} ({} MiB)",
            name,
            found.model_str(),
            found.sectors * BLOCK_SIZE as u64 / (1024 * 1024)
        );

        let device = BlockDevice {
            name,
            block_size: BLOCK_SIZE,
            num_blocks: found.sectors,
            ops: Arc::new(LockedDrive(Mutex::new(found))),
        };
        if let Err(e) = block::register(device) {
            log::warn!(target: "ata", "registration failed: {}", e);
        }
    }
}
