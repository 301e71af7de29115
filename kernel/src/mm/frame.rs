//! Physical frame allocator
//!
//! A dense bitmap, one bit per 4 KiB frame (1 = used, 0 = free), scanned
//! linearly. All of physical RAM is owned here; the paging engine, the heap,
//! and the process constructors draw frames from the global instance.
//!
//! Frames start out free except frame 0 (real-mode leftovers), the kernel
//! image, and the allocator's own backing storage (which lives in the
//! kernel's .bss and is therefore covered by the image reservation).

use spin::Mutex;

use super::{PhysicalAddress, KERNEL_PHYSICAL_START, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Upper bound on managed RAM: 512 MiB in 4 KiB frames.
pub const MAX_FRAMES: usize = 512 * 1024 * 1024 / PAGE_SIZE;

const BITMAP_WORDS: usize = MAX_FRAMES / 64;

/// Bitmap-backed physical frame allocator.
pub struct FrameBitmap {
    /// One bit per frame, 1 = used
    bitmap: [u64; BITMAP_WORDS],
    /// Frames actually managed (<= MAX_FRAMES), fixed at init
    total_frames: usize,
    /// Frames currently marked used
    used_frames: usize,
}

impl FrameBitmap {
    pub const fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_WORDS],
            total_frames: 0,
            used_frames: 0,
        }
    }

    #[inline]
    fn test(&self, frame: usize) -> bool {
        self.bitmap[frame / 64] & (1 << (frame % 64)) != 0
    }

    #[inline]
    fn set(&mut self, frame: usize) {
        self.bitmap[frame / 64] |= 1 << (frame % 64);
    }

    #[inline]
    fn clear(&mut self, frame: usize) {
        self.bitmap[frame / 64] &= !(1 << (frame % 64));
    }

    /// Initialize from the RAM size reported at boot and the end of the
    /// kernel image. Marks the boot-time reservations.
    pub fn init(&mut self, mem_size: u64, kernel_end: PhysicalAddress) {
        let mut frames = (mem_size / PAGE_SIZE as u64) as usize;
        if frames > MAX_FRAMES {
            frames = MAX_FRAMES;
        }
        self.total_frames = frames;
        self.used_frames = 0;
        self.bitmap = [0; BITMAP_WORDS];

        // Frame 0: real-mode IVT and friends
        self.reserve(PhysicalAddress::new(0));

        // Kernel image, 1 MiB up to the linker-reported end
        let kernel_size = kernel_end.as_u64().saturating_sub(KERNEL_PHYSICAL_START);
        let kernel_pages = super::bytes_to_pages(kernel_size as usize);
        self.reserve_range(PhysicalAddress::new(KERNEL_PHYSICAL_START), kernel_pages);
    }

    /// Allocate a single frame. Returns its physical base address.
    pub fn alloc_one(&mut self) -> KernelResult<PhysicalAddress> {
        for frame in 0..self.total_frames {
            if !self.test(frame) {
                self.set(frame);
                self.used_frames += 1;
                return Ok(PhysicalAddress::new((frame * PAGE_SIZE) as u64));
            }
        }
        Err(KernelError::OutOfMemory {
            requested: PAGE_SIZE,
            available: 0,
        })
    }

    /// Allocate `count` physically contiguous frames.
    ///
    /// Linear scan keeping a run of consecutive free bits; on a used bit the
    /// scan resumes just past it. O(total_frames) worst case, which is fine
    /// for the boot-time and low-frequency callers this serves.
    pub fn alloc_contig(&mut self, count: usize) -> KernelResult<PhysicalAddress> {
        if count == 0 {
            return Err(KernelError::InvalidArgument {
                name: "count",
                value: "zero",
            });
        }
        if count == 1 {
            return self.alloc_one();
        }

        let mut run_start = 0usize;
        let mut run_len = 0usize;
        let mut frame = 0usize;
        while frame < self.total_frames {
            if self.test(frame) {
                run_len = 0;
                run_start = frame + 1;
            } else {
                run_len += 1;
                if run_len == count {
                    for f in run_start..run_start + count {
                        self.set(f);
                    }
                    self.used_frames += count;
                    return Ok(PhysicalAddress::new((run_start * PAGE_SIZE) as u64));
                }
            }
            frame += 1;
        }

        Err(KernelError::OutOfMemory {
            requested: count * PAGE_SIZE,
            available: self.free_frames() * PAGE_SIZE,
        })
    }

    /// Release a single frame. Out-of-range addresses are ignored; releasing
    /// an already-free frame is reported and ignored.
    pub fn release_one(&mut self, addr: PhysicalAddress) {
        if addr.is_null() {
            return;
        }
        let frame = addr.frame_index() as usize;
        if frame >= self.total_frames {
            return;
        }
        if !self.test(frame) {
            log::warn!("double free of frame {:#x}", addr.as_u64());
            return;
        }
        self.clear(frame);
        self.used_frames -= 1;
    }

    /// Release `count` contiguous frames starting at `addr`.
    pub fn release_range(&mut self, addr: PhysicalAddress, count: usize) {
        for i in 0..count {
            self.release_one(addr.offset((i * PAGE_SIZE) as u64));
        }
    }

    /// Mark a frame used without going through allocation (boot-time fixup).
    pub fn reserve(&mut self, addr: PhysicalAddress) {
        let frame = addr.frame_index() as usize;
        if frame >= self.total_frames {
            return;
        }
        if !self.test(frame) {
            self.set(frame);
            self.used_frames += 1;
        }
    }

    /// Reserve `count` contiguous frames starting at `addr`.
    pub fn reserve_range(&mut self, addr: PhysicalAddress, count: usize) {
        for i in 0..count {
            self.reserve(addr.offset((i * PAGE_SIZE) as u64));
        }
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn used_frames(&self) -> usize {
        self.used_frames
    }

    pub fn free_frames(&self) -> usize {
        self.total_frames - self.used_frames
    }

    /// Is the frame containing `addr` free? Out-of-range counts as not free.
    pub fn is_free(&self, addr: PhysicalAddress) -> bool {
        let frame = addr.frame_index() as usize;
        frame < self.total_frames && !self.test(frame)
    }
}

impl Default for FrameBitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator instance
pub static FRAME_ALLOCATOR: Mutex<FrameBitmap> = Mutex::new(FrameBitmap::new());

/// Initialize the global allocator from the boot-reported RAM size and the
/// end of the kernel image.
pub fn init(mem_size: u64, kernel_end: PhysicalAddress) {
    let mut fa = FRAME_ALLOCATOR.lock();
    fa.init(mem_size, kernel_end);
    log::info!(
        target: "pmm",
        "managing {} MiB ({} frames), {} used, {} free",
        mem_size / (1024 * 1024),
        fa.total_frames(),
        fa.used_frames(),
        fa.free_frames()
    );
}
