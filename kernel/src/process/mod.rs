//! Process model
//!
//! Process control blocks, the global process table, and the kernel- and
//! user-task constructors. The scheduler consumes the table through the
//! ready queue; the syscall gate reaches it for `getpid`, `sleep`, `exit`.

mod pcb;
mod table;

pub use pcb::{Process, ProcessId, ProcessState, STACK_FRAMES};
pub use table::{
    exit_current, kill, process_list, sleep_current, ProcessTable, PROCESS_TABLE,
};
#[cfg(target_os = "none")]
pub use table::{init, reap, spawn_kernel, spawn_user};

#[cfg(all(test, not(target_os = "none")))]
pub(crate) use table::tests::test_process;

/// Capacity of the process table.
pub const MAX_PROCESSES: usize = 256;

/// Ring-3 virtual base of the user stack region (PML4 slot 1, clear of the
/// kernel's 4 MiB identity map).
pub const USER_STACK_BASE: u64 = 0x80_0000_0000;

/// Ring-3 virtual base of the user code region.
pub const USER_CODE_BASE: u64 = 0x80_0001_0000;

/// Bytes of code copied into a fresh user process image (16 KiB).
pub const USER_CODE_SIZE: usize = STACK_FRAMES * crate::mm::PAGE_SIZE;

#[cfg(all(test, not(target_os = "none")))]
mod layout_tests {
    use super::*;
    use crate::mm::{PAGE_SIZE, VirtualAddress};

    /// User stack and code regions: wholly lower-half, non-overlapping, and
    /// clear of the first 4 MiB identity map.
    #[test]
    fn user_regions_are_well_placed() {
        let stack_end = USER_STACK_BASE + (STACK_FRAMES * PAGE_SIZE) as u64;
        let code_end = USER_CODE_BASE + USER_CODE_SIZE as u64;

        assert!(VirtualAddress::new(USER_STACK_BASE).is_lower_half());
        assert!(VirtualAddress::new(stack_end).is_lower_half());
        assert!(VirtualAddress::new(USER_CODE_BASE).is_lower_half());
        assert!(VirtualAddress::new(code_end).is_lower_half());

        // No overlap between stack and code
        assert!(stack_end <= USER_CODE_BASE || code_end <= USER_STACK_BASE);

        // Both clear of the identity-mapped first 4 MiB
        assert!(USER_STACK_BASE >= 0x40_0000);
        assert!(USER_CODE_BASE >= 0x40_0000);
    }
}
