//! Process control block

use alloc::string::String;

use crate::arch::x86_64::interrupts::RegisterFrame;
use crate::mm::{paging::AddressSpace, PhysicalAddress};

/// Process ID. Monotonically assigned, never reused within a boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process lifecycle state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Ready to run; present in the scheduler's ready queue
    Ready = 0,
    /// Currently executing (at most one process at any time)
    Running = 1,
    /// Blocked on an explicit block call
    Blocked = 2,
    /// Sleeping until `wake_at_tick`
    Sleeping = 3,
    /// Exited, waiting to be reaped
    Zombie = 4,
    /// Killed; storage is reclaimable
    Dead = 5,
}

impl ProcessState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Blocked => "BLOCKED",
            Self::Sleeping => "SLEEPING",
            Self::Zombie => "ZOMBIE",
            Self::Dead => "DEAD",
        }
    }
}

/// Number of 4 KiB frames in each task stack (16 KiB).
pub const STACK_FRAMES: usize = 4;

/// Process control block. All mutation happens through the global table
/// with interrupts masked, so plain fields suffice.
pub struct Process {
    pub pid: ProcessId,
    pub parent: ProcessId,
    pub name: String,
    pub state: ProcessState,
    pub exit_code: i32,

    /// Register state to resume from, in the interrupt-frame layout
    pub frame: RegisterFrame,

    /// Address space this process runs in
    pub space: AddressSpace,
    /// Whether this process owns `space` (user tasks) or shares the kernel
    /// space (kernel tasks)
    pub owns_space: bool,

    /// Ring-0 stack: top pointer and backing frames
    pub kernel_stack_top: u64,
    pub kernel_stack_phys: PhysicalAddress,
    /// Ring-3 stack top (user virtual address; 0 for kernel tasks)
    pub user_stack_top: u64,
    pub user_stack_phys: Option<PhysicalAddress>,
    /// Backing frames of the user code image, if any
    pub user_code_phys: Option<PhysicalAddress>,

    /// Scheduling metadata. Priority is carried but unused by the
    /// round-robin policy in this revision.
    pub priority: u32,
    pub time_slice: u32,
    pub time_used: u32,
    pub total_ticks: u64,

    /// Absolute tick to wake at while `Sleeping`
    pub wake_at_tick: u64,
}

impl Process {
    /// True until the process reaches a terminal state.
    pub fn is_alive(&self) -> bool {
        !matches!(self.state, ProcessState::Zombie | ProcessState::Dead)
    }
}
