//! Kernel heap allocator
//!
//! First-fit allocator over one contiguous virtual range. The range is
//! covered by a single doubly-linked list of blocks in address order; each
//! block carries a magic tag, its total size (header included), and its
//! free/used state. Adjacent free blocks are coalesced eagerly on release.
//!
//! When no block fits, the heap extends itself at the tail of its range:
//! fresh frames from the physical allocator, mapped by the paging engine,
//! appended as one large free block. On the host (unit tests) the heap runs
//! over a fixed buffer and growth simply fails.
//!
//! The heap also backs `alloc::*` kernel-wide through the [`KernelAllocator`]
//! `GlobalAlloc` wrapper installed in `lib.rs`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use spin::Mutex;

use super::{page_align_up, PAGE_SIZE};
#[cfg(target_os = "none")]
use super::VirtualAddress;
use crate::error::{KernelError, KernelResult};

/// Validation tag carried by every block header ("HEAP").
const HEAP_MAGIC: u32 = 0x4845_4150;

/// Smallest payload worth splitting off into its own block.
const MIN_PAYLOAD: usize = 24;

const BLOCK_FREE: u32 = 0;
const BLOCK_USED: u32 = 1;

/// Walk guard: a list longer than this is considered corrupt.
const MAX_BLOCKS: usize = 100_000;

/// Block header. Lives at the start of every block; the payload follows it.
/// `size` is the whole block, header included, and blocks tile the heap:
/// `addr + size == next.addr` whenever `next` exists.
#[repr(C)]
struct BlockHeader {
    magic: u32,
    state: u32,
    size: usize,
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

impl BlockHeader {
    fn is_free(&self) -> bool {
        self.state == BLOCK_FREE
    }
}

/// Where freshly needed heap pages come from.
pub enum GrowthPolicy {
    /// Fixed region; growth requests fail. Used on the host.
    Fixed,
    /// Extend at the tail with frames from the PPA mapped by the paging
    /// engine in the kernel address space.
    #[cfg(target_os = "none")]
    PageMapped,
}

/// Heap state: one contiguous [start, end) range tiled by the block list.
pub struct HeapAllocator {
    start: u64,
    end: u64,
    size: usize,
    first: *mut BlockHeader,
    allocations: u32,
    growth: GrowthPolicy,
}

// SAFETY: raw block pointers all point into the heap range, which is owned
// by this allocator for its whole lifetime; access is serialized by the
// enclosing Mutex.
unsafe impl Send for HeapAllocator {}

impl HeapAllocator {
    pub const fn empty() -> Self {
        Self {
            start: 0,
            end: 0,
            size: 0,
            first: ptr::null_mut(),
            allocations: 0,
            growth: GrowthPolicy::Fixed,
        }
    }

    /// Set up over an existing memory region (host tests, early fixed pools).
    ///
    /// # Safety
    ///
    /// `start..start+len` must be valid, writable, 8-byte-aligned memory that
    /// outlives the allocator and is not used by anything else.
    pub unsafe fn init_fixed(&mut self, start: *mut u8, len: usize) {
        self.start = start as u64;
        self.end = self.start + len as u64;
        self.size = len;
        self.growth = GrowthPolicy::Fixed;
        self.allocations = 0;
        self.first = ptr::null_mut();
        // SAFETY: caller guarantees the region; format one spanning block.
        unsafe { self.format_block(self.start, len) };
    }

    /// Set up at a fixed virtual range, mapping `initial_size` bytes of
    /// fresh frames at `start`.
    #[cfg(target_os = "none")]
    pub fn init_mapped(&mut self, start: VirtualAddress, initial_size: usize) -> KernelResult<()> {
        self.start = start.as_u64();
        self.end = self.start;
        self.size = 0;
        self.growth = GrowthPolicy::PageMapped;
        self.allocations = 0;
        self.first = ptr::null_mut();
        let added = self.grow(initial_size)?;
        // SAFETY: grow just mapped [start, start+added) as fresh kernel pages.
        unsafe { self.format_block(self.start, added) };
        Ok(())
    }

    /// Write a free block header spanning `[addr, addr+len)` and append it
    /// to the list.
    ///
    /// # Safety
    ///
    /// The range must be valid heap memory not covered by any other block.
    unsafe fn format_block(&mut self, addr: u64, len: usize) {
        let block = addr as *mut BlockHeader;
        // SAFETY: per the function contract the range is exclusive heap
        // memory large enough for a header.
        unsafe {
            (*block).magic = HEAP_MAGIC;
            (*block).state = BLOCK_FREE;
            (*block).size = len;
            (*block).prev = ptr::null_mut();
            (*block).next = ptr::null_mut();

            if self.first.is_null() {
                self.first = block;
            } else {
                let mut tail = self.first;
                while !(*tail).next.is_null() {
                    tail = (*tail).next;
                }
                (*tail).next = block;
                (*block).prev = tail;
            }
        }
    }

    /// Allocate `size` bytes, 8-byte aligned. Returns null when `size` is 0
    /// or memory is exhausted and growth fails.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        let mut total = HEADER_SIZE + size;
        if total < HEADER_SIZE + MIN_PAYLOAD {
            total = HEADER_SIZE + MIN_PAYLOAD;
        }
        total = (total + 7) & !7;

        let mut block = self.find_fit(total);
        if block.is_null() {
            let want = page_align_up((total * 2).max(PAGE_SIZE) as u64) as usize;
            match self.grow(want) {
                Ok(added) => {
                    let tail_addr = self.end - added as u64;
                    // SAFETY: grow mapped [tail_addr, end) as fresh pages.
                    unsafe { self.format_block(tail_addr, added) };
                    block = self.find_fit(total);
                }
                Err(e) => {
                    log::error!(target: "heap", "growth failed: {}", e);
                    return ptr::null_mut();
                }
            }
        }
        if block.is_null() {
            return ptr::null_mut();
        }

        // SAFETY: find_fit returned a live block from the list.
        unsafe {
            self.split(block, total);
            (*block).state = BLOCK_USED;
        }
        self.allocations += 1;
        // SAFETY: payload follows the header inside the block.
        unsafe { (block as *mut u8).add(HEADER_SIZE) }
    }

    /// Allocate and zero-fill.
    pub fn alloc_zeroed(&mut self, size: usize) -> *mut u8 {
        let p = self.alloc(size);
        if !p.is_null() {
            // SAFETY: alloc returned a live payload of at least `size` bytes.
            unsafe { ptr::write_bytes(p, 0, size) };
        }
        p
    }

    /// Release a pointer previously returned by [`alloc`]. Null is a no-op;
    /// bad magic and double frees are reported and refused.
    pub fn release(&mut self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        // SAFETY: the header sits immediately before the payload; if `p` did
        // not come from this heap the magic check below rejects it.
        let block = unsafe { (p.sub(HEADER_SIZE)) as *mut BlockHeader };
        unsafe {
            if (*block).magic != HEAP_MAGIC {
                log::error!(target: "heap", "release with bad magic at {:p}", p);
                return;
            }
            if (*block).is_free() {
                log::error!(target: "heap", "double free at {:p}", p);
                return;
            }
            (*block).state = BLOCK_FREE;
            self.allocations -= 1;
            self.coalesce(block);
        }
    }

    /// Resize an allocation. `realloc(null, n)` allocates; `realloc(p, 0)`
    /// releases.
    pub fn realloc(&mut self, p: *mut u8, new_size: usize) -> *mut u8 {
        if p.is_null() {
            return self.alloc(new_size);
        }
        if new_size == 0 {
            self.release(p);
            return ptr::null_mut();
        }

        // SAFETY: header precedes the payload; magic validates provenance.
        let block = unsafe { (p.sub(HEADER_SIZE)) as *mut BlockHeader };
        let current = unsafe {
            if (*block).magic != HEAP_MAGIC {
                log::error!(target: "heap", "realloc with bad magic at {:p}", p);
                return ptr::null_mut();
            }
            (*block).size - HEADER_SIZE
        };
        if new_size <= current {
            return p;
        }

        let fresh = self.alloc(new_size);
        if fresh.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: both pointers are live payloads; `current` bytes exist in
        // the old block.
        unsafe { ptr::copy_nonoverlapping(p, fresh, current) };
        self.release(p);
        fresh
    }

    fn find_fit(&self, total: usize) -> *mut BlockHeader {
        let mut current = self.first;
        while !current.is_null() {
            // SAFETY: list pointers only ever reference heap blocks.
            unsafe {
                if (*current).magic != HEAP_MAGIC {
                    log::error!(target: "heap", "corruption detected at {:p}", current);
                    return ptr::null_mut();
                }
                if (*current).is_free() && (*current).size >= total {
                    return current;
                }
                current = (*current).next;
            }
        }
        ptr::null_mut()
    }

    /// Split `block` so its size becomes `total`, when the surplus can hold
    /// a minimum block of its own.
    ///
    /// # Safety
    ///
    /// `block` must be a live block on the list with `size >= total`.
    unsafe fn split(&mut self, block: *mut BlockHeader, total: usize) {
        // SAFETY: per contract, plus the surplus check before carving.
        unsafe {
            if (*block).size < total + HEADER_SIZE + MIN_PAYLOAD {
                return;
            }
            let rest = (block as *mut u8).add(total) as *mut BlockHeader;
            (*rest).magic = HEAP_MAGIC;
            (*rest).state = BLOCK_FREE;
            (*rest).size = (*block).size - total;
            (*rest).prev = block;
            (*rest).next = (*block).next;
            if !(*block).next.is_null() {
                (*(*block).next).prev = rest;
            }
            (*block).next = rest;
            (*block).size = total;
        }
    }

    /// Merge `block` with its free right and left neighbors.
    ///
    /// # Safety
    ///
    /// `block` must be a live free block on the list.
    unsafe fn coalesce(&mut self, block: *mut BlockHeader) {
        // SAFETY: neighbor links are maintained by every list mutation.
        unsafe {
            let next = (*block).next;
            if !next.is_null() && (*next).is_free() {
                (*block).size += (*next).size;
                (*block).next = (*next).next;
                if !(*next).next.is_null() {
                    (*(*next).next).prev = block;
                }
            }
            let prev = (*block).prev;
            if !prev.is_null() && (*prev).is_free() {
                (*prev).size += (*block).size;
                (*prev).next = (*block).next;
                if !(*block).next.is_null() {
                    (*(*block).next).prev = prev;
                }
            }
        }
    }

    /// Extend the mapped range at the tail by at least `min_bytes` (rounded
    /// up to whole pages). Returns the number of bytes added.
    fn grow(&mut self, min_bytes: usize) -> KernelResult<usize> {
        match self.growth {
            GrowthPolicy::Fixed => Err(KernelError::OutOfMemory {
                requested: min_bytes,
                available: 0,
            }),
            #[cfg(target_os = "none")]
            GrowthPolicy::PageMapped => {
                use super::frame::FRAME_ALLOCATOR;
                use super::paging::{AddressSpace, KernelEnv};
                use super::PageFlags;

                let bytes = page_align_up(min_bytes as u64) as usize;
                let pages = bytes / PAGE_SIZE;
                let env = KernelEnv;
                let kernel_space = AddressSpace::from_root(super::paging::current_root());

                for i in 0..pages {
                    let phys = FRAME_ALLOCATOR.lock().alloc_one()?;
                    let virt = VirtualAddress::new(self.end + (i * PAGE_SIZE) as u64);
                    if let Err(e) = kernel_space.map(&env, virt, phys, PageFlags::kernel()) {
                        FRAME_ALLOCATOR.lock().release_one(phys);
                        return Err(e);
                    }
                }
                self.end += bytes as u64;
                self.size += bytes;
                Ok(bytes)
            }
        }
    }

    /// Walk the whole list checking magic tags, link symmetry, address
    /// continuity, and bounded progress.
    pub fn validate(&self) -> bool {
        let mut current = self.first;
        let mut count = 0usize;
        while !current.is_null() {
            // SAFETY: list pointers only ever reference heap blocks; every
            // field read is behind the magic check.
            unsafe {
                if (*current).magic != HEAP_MAGIC {
                    log::error!(target: "heap", "validate: bad magic at block {} ({:p})", count, current);
                    return false;
                }
                let next = (*current).next;
                if !next.is_null() {
                    if (*next).prev != current {
                        log::error!(target: "heap", "validate: broken link at block {}", count);
                        return false;
                    }
                    let expected = (current as u64) + (*current).size as u64;
                    if next as u64 != expected {
                        log::error!(target: "heap", "validate: gap after block {}", count);
                        return false;
                    }
                }
                count += 1;
                if count > MAX_BLOCKS {
                    log::error!(target: "heap", "validate: list too long or circular");
                    return false;
                }
                current = next;
            }
        }
        true
    }

    pub fn total_size(&self) -> usize {
        self.size
    }

    pub fn used_size(&self) -> usize {
        let mut used = 0;
        let mut current = self.first;
        while !current.is_null() {
            // SAFETY: list pointers only ever reference heap blocks.
            unsafe {
                if !(*current).is_free() {
                    used += (*current).size;
                }
                current = (*current).next;
            }
        }
        used
    }

    pub fn free_size(&self) -> usize {
        self.size - self.used_size()
    }

    pub fn allocation_count(&self) -> u32 {
        self.allocations
    }
}

/// Global kernel heap instance
pub static HEAP: Mutex<HeapAllocator> = Mutex::new(HeapAllocator::empty());

/// Fixed virtual base of the kernel heap range.
pub const HEAP_START: u64 = 0xFFFF_8002_0000_0000;

/// Initial mapped size (16 MiB).
pub const HEAP_INITIAL_SIZE: usize = 16 * 1024 * 1024;

/// Initialize the global heap at its fixed range.
#[cfg(target_os = "none")]
pub fn init() -> KernelResult<()> {
    let mut heap = HEAP.lock();
    heap.init_mapped(VirtualAddress::new(HEAP_START), HEAP_INITIAL_SIZE)?;
    log::info!(
        target: "heap",
        "initialized at {:#x}, {} KiB",
        HEAP_START,
        heap.total_size() / 1024
    );
    Ok(())
}

/// Run the integrity walk on the global heap.
pub fn validate() -> bool {
    crate::arch::without_interrupts(|| HEAP.lock().validate())
}

/// `GlobalAlloc` adapter over the global heap, installed as
/// `#[global_allocator]` on bare metal. Alignments above the heap's native
/// 8 bytes are honored by over-allocating and stashing the raw pointer just
/// below the aligned payload.
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Interrupt handlers allocate too; mask so the tick path can never
        // spin on a heap lock its own interrupted context holds.
        crate::arch::without_interrupts(|| {
            let mut heap = HEAP.lock();
            if layout.align() <= 8 {
                return heap.alloc(layout.size().max(1));
            }

            let raw = heap.alloc(layout.size() + layout.align() + 8);
            if raw.is_null() {
                return raw;
            }
            let aligned = (raw as usize + 8 + layout.align() - 1) & !(layout.align() - 1);
            // SAFETY: `aligned - 8` lies inside the over-allocated region,
            // at least 8 bytes past `raw`.
            unsafe { ((aligned - 8) as *mut u64).write(raw as u64) };
            aligned as *mut u8
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        crate::arch::without_interrupts(|| {
            let mut heap = HEAP.lock();
            if layout.align() <= 8 {
                heap.release(ptr);
                return;
            }
            // SAFETY: alloc stored the raw pointer at `ptr - 8` for this
            // layout.
            let raw = unsafe { ((ptr as usize - 8) as *const u64).read() };
            heap.release(raw as *mut u8);
        })
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;
    use std::{vec, vec::Vec};

    use super::*;

    /// Build a heap over a leaked, 8-aligned host buffer.
    fn heap_with(len: usize) -> HeapAllocator {
        let buf: Vec<u64> = vec![0; len / 8];
        let ptr = Vec::leak(buf).as_mut_ptr() as *mut u8;
        let mut heap = HeapAllocator::empty();
        unsafe { heap.init_fixed(ptr, len) };
        heap
    }

    #[test]
    fn alloc_release_validates_clean() {
        let mut heap = heap_with(64 * 1024);
        let total = heap.total_size();

        let p = heap.alloc(64);
        let q = heap.alloc(128);
        assert!(!p.is_null() && !q.is_null());
        assert_eq!(p as usize % 8, 0);
        assert_eq!(q as usize % 8, 0);

        heap.release(p);
        heap.release(q);

        assert!(heap.validate());
        assert_eq!(heap.free_size(), total);
        assert_eq!(heap.used_size(), 0);
        assert_eq!(heap.allocation_count(), 0);
    }

    #[test]
    fn blocks_tile_the_range() {
        let mut heap = heap_with(32 * 1024);
        let total = heap.total_size();
        let ptrs: Vec<_> = (0..8).map(|i| heap.alloc(32 * (i + 1))).collect();
        assert!(heap.validate());
        // Sum of all block sizes equals the heap size regardless of state
        assert_eq!(heap.used_size() + heap.free_size(), total);
        for p in ptrs {
            heap.release(p);
        }
        assert!(heap.validate());
        assert_eq!(heap.free_size(), total);
    }

    #[test]
    fn released_space_is_reusable() {
        let mut heap = heap_with(16 * 1024);
        let p = heap.alloc(256);
        heap.release(p);
        let q = heap.alloc(256);
        // First-fit hands back the same block
        assert_eq!(p, q);
        heap.release(q);
    }

    #[test]
    fn coalescing_rebuilds_large_blocks() {
        let mut heap = heap_with(16 * 1024);
        let a = heap.alloc(1024);
        let b = heap.alloc(1024);
        let c = heap.alloc(1024);
        heap.release(a);
        heap.release(c);
        heap.release(b); // middle last: both sides merge
        assert!(heap.validate());
        // A single allocation close to the whole heap must now succeed
        let big = heap.alloc(heap.total_size() - 2 * HEADER_SIZE);
        assert!(!big.is_null());
    }

    #[test]
    fn zero_size_and_null_edges() {
        let mut heap = heap_with(4096);
        assert!(heap.alloc(0).is_null());
        heap.release(ptr::null_mut()); // no-op
        assert!(heap.validate());
    }

    #[test]
    fn realloc_preserves_contents() {
        let mut heap = heap_with(16 * 1024);
        let p = heap.alloc(16);
        unsafe { ptr::copy_nonoverlapping(b"heap test!".as_ptr(), p, 10) };
        let q = heap.realloc(p, 4096);
        assert!(!q.is_null());
        let mut out = [0u8; 10];
        unsafe { ptr::copy_nonoverlapping(q, out.as_mut_ptr(), 10) };
        assert_eq!(&out, b"heap test!");
        heap.release(q);
        assert!(heap.validate());
    }

    #[test]
    fn realloc_null_and_zero() {
        let mut heap = heap_with(8 * 1024);
        let p = heap.realloc(ptr::null_mut(), 64);
        assert!(!p.is_null());
        assert!(heap.realloc(p, 0).is_null());
        assert_eq!(heap.allocation_count(), 0);
    }

    #[test]
    fn shrinking_realloc_keeps_pointer() {
        let mut heap = heap_with(8 * 1024);
        let p = heap.alloc(512);
        assert_eq!(heap.realloc(p, 64), p);
        heap.release(p);
    }

    #[test]
    fn double_free_is_refused() {
        let mut heap = heap_with(4096);
        let p = heap.alloc(64);
        heap.release(p);
        let count = heap.allocation_count();
        heap.release(p); // reported, refused
        assert_eq!(heap.allocation_count(), count);
        assert!(heap.validate());
    }

    #[test]
    fn exhaustion_returns_null_without_growth() {
        let mut heap = heap_with(4096);
        assert!(heap.alloc(1 << 20).is_null());
        // Small allocations still work afterwards
        assert!(!heap.alloc(64).is_null());
    }

    #[test]
    fn alloc_zeroed_zeroes() {
        let mut heap = heap_with(8 * 1024);
        // Dirty some memory first
        let p = heap.alloc(256);
        unsafe { ptr::write_bytes(p, 0xAB, 256) };
        heap.release(p);
        let q = heap.alloc_zeroed(256);
        let all_zero = unsafe { (0..256).all(|i| *q.add(i) == 0) };
        assert!(all_zero);
    }

    #[test]
    fn alloc_free_alloc_does_not_leak_capacity() {
        let mut heap = heap_with(16 * 1024);
        let free_before = heap.free_size();
        for _ in 0..100 {
            let p = heap.alloc(100);
            assert!(!p.is_null());
            heap.release(p);
        }
        assert_eq!(heap.free_size(), free_before);
        assert!(heap.validate());
    }
}
