//! Process table and lifecycle
//!
//! One global table, capped at [`MAX_PROCESSES`](super::MAX_PROCESSES)
//! entries, keyed by monotonically assigned PIDs. All mutation happens at
//! boot or inside interrupt handlers, i.e. with interrupts masked; the
//! `Mutex` encodes ownership for the compiler and never contends.

use alloc::{boxed::Box, collections::BTreeMap, string::String};

use spin::Mutex;

use super::pcb::{Process, ProcessId, ProcessState, STACK_FRAMES};
use super::MAX_PROCESSES;
use crate::arch::x86_64::gdt;
use crate::arch::x86_64::interrupts::RegisterFrame;
use crate::error::{KernelError, KernelResult};
#[cfg(any(target_os = "none", test))]
use crate::mm::paging::AddressSpace;

/// Default time slice, in ticks.
const DEFAULT_TIME_SLICE: u32 = 10;

/// RFLAGS for a fresh task: reserved bit 1 plus IF, so the task starts with
/// interrupts enabled.
const INITIAL_RFLAGS: u64 = 0x202;

/// The process table: PCB storage, PID allocation, and the current-process
/// pointer.
pub struct ProcessTable {
    processes: BTreeMap<ProcessId, Box<Process>>,
    next_pid: u64,
    current: Option<ProcessId>,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            next_pid: 1,
            current: None,
        }
    }

    /// Hand out the next PID. PIDs are never reused within a boot.
    pub fn alloc_pid(&mut self) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Insert a PCB, enforcing the table capacity.
    pub fn insert(&mut self, process: Box<Process>) -> KernelResult<ProcessId> {
        if self.processes.len() >= MAX_PROCESSES {
            return Err(KernelError::ResourceExhausted {
                resource: "process table",
            });
        }
        let pid = process.pid;
        if self.processes.contains_key(&pid) {
            return Err(KernelError::AlreadyExists {
                resource: "process",
                id: pid.0,
            });
        }
        self.processes.insert(pid, process);
        Ok(pid)
    }

    pub fn remove(&mut self, pid: ProcessId) -> Option<Box<Process>> {
        self.processes.remove(&pid)
    }

    pub fn get(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid).map(|p| &**p)
    }

    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&pid).map(|p| &mut **p)
    }

    pub fn current_pid(&self) -> Option<ProcessId> {
        self.current
    }

    pub fn set_current(&mut self, pid: Option<ProcessId>) {
        self.current = pid;
    }

    pub fn current_mut(&mut self) -> Option<&mut Process> {
        let pid = self.current?;
        self.get_mut(pid)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// All sleeping processes due at `now`. The scheduler promotes them back
    /// to READY and requeues them.
    pub fn due_sleepers(&self, now: u64) -> impl Iterator<Item = ProcessId> + '_ {
        self.processes.values().filter_map(move |p| {
            (p.state == ProcessState::Sleeping && now >= p.wake_at_tick).then_some(p.pid)
        })
    }

    /// PIDs in terminal states whose storage can be reclaimed.
    pub fn reapable(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.processes
            .values()
            .filter_map(|p| (!p.is_alive()).then_some(p.pid))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.processes.values().map(|p| &**p)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Global process table.
///
/// Lock order: the scheduler lock is always taken before this one.
pub static PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());

/// Reset the table at boot.
#[cfg(target_os = "none")]
pub fn init() {
    let table = PROCESS_TABLE.lock();
    log::info!(
        target: "process",
        "process table ready (capacity {}, {} entries)",
        MAX_PROCESSES,
        table.len()
    );
}

/// Initial saved frame for a ring-0 task.
fn initial_kernel_frame(entry: u64, stack_top: u64) -> RegisterFrame {
    RegisterFrame {
        rip: entry,
        rsp: stack_top,
        rflags: INITIAL_RFLAGS,
        cs: gdt::KERNEL_CODE_SELECTOR as u64,
        ss: gdt::KERNEL_DATA_SELECTOR as u64,
        ds: gdt::KERNEL_DATA_SELECTOR as u64,
        es: gdt::KERNEL_DATA_SELECTOR as u64,
        ..RegisterFrame::zeroed()
    }
}

/// Initial saved frame for a ring-3 task: user selectors with RPL 3 and
/// user virtual addresses for code and stack.
fn initial_user_frame(entry_va: u64, stack_top_va: u64) -> RegisterFrame {
    RegisterFrame {
        rip: entry_va,
        rsp: stack_top_va,
        rflags: INITIAL_RFLAGS,
        cs: gdt::USER_CODE_SELECTOR as u64,
        ss: gdt::USER_DATA_SELECTOR as u64,
        ds: gdt::USER_DATA_SELECTOR as u64,
        es: gdt::USER_DATA_SELECTOR as u64,
        ..RegisterFrame::zeroed()
    }
}

/// Create a ring-0 task running `entry` in the kernel address space with a
/// fresh 16 KiB stack. The task is READY but not yet queued; the caller
/// hands it to the scheduler.
#[cfg(target_os = "none")]
pub fn spawn_kernel(
    entry: extern "C" fn() -> !,
    name: &str,
    priority: u32,
) -> KernelResult<ProcessId> {
    use crate::mm::{frame::FRAME_ALLOCATOR, paging, phys_to_virt, PAGE_SIZE};

    let mut table = PROCESS_TABLE.lock();
    let pid = table.alloc_pid();
    let parent = table.current_pid().unwrap_or(ProcessId(0));

    let stack_phys = FRAME_ALLOCATOR.lock().alloc_contig(STACK_FRAMES)?;
    let stack_top = phys_to_virt(stack_phys).as_u64() + (STACK_FRAMES * PAGE_SIZE) as u64;

    let process = Box::new(Process {
        pid,
        parent,
        name: String::from(name),
        state: ProcessState::Ready,
        exit_code: 0,
        frame: initial_kernel_frame(entry as usize as u64, stack_top),
        space: AddressSpace::from_root(paging::current_root()),
        owns_space: false,
        kernel_stack_top: stack_top,
        kernel_stack_phys: stack_phys,
        user_stack_top: 0,
        user_stack_phys: None,
        user_code_phys: None,
        priority,
        time_slice: DEFAULT_TIME_SLICE,
        time_used: 0,
        total_ticks: 0,
        wake_at_tick: 0,
    });

    match table.insert(process) {
        Ok(pid) => {
            log::info!(target: "process", "kernel task '{}' (pid {})", name, pid);
            Ok(pid)
        }
        Err(e) => {
            FRAME_ALLOCATOR.lock().release_range(stack_phys, STACK_FRAMES);
            Err(e)
        }
    }
}

/// Create a ring-3 task in a fresh address space.
///
/// 16 KiB of code starting at `entry_in_kernel` is copied into freshly
/// allocated frames mapped at [`USER_CODE_BASE`](super::USER_CODE_BASE);
/// a 16 KiB user stack is mapped at
/// [`USER_STACK_BASE`](super::USER_STACK_BASE). Both mappings are installed
/// in the new space through the direct map -- CR3 is never switched during
/// construction. On any failure, prior allocations are undone in reverse
/// order.
#[cfg(target_os = "none")]
pub fn spawn_user(entry_in_kernel: u64, name: &str, priority: u32) -> KernelResult<ProcessId> {
    use crate::mm::{
        frame::FRAME_ALLOCATOR,
        paging::{self, KernelEnv},
        phys_to_virt, PageFlags, PhysicalAddress, VirtualAddress, PAGE_SIZE,
    };

    use super::{USER_CODE_BASE, USER_CODE_SIZE, USER_STACK_BASE};

    let env = KernelEnv;
    let mut table = PROCESS_TABLE.lock();
    let pid = table.alloc_pid();
    let parent = table.current_pid().unwrap_or(ProcessId(0));

    // Ring-0 stack for interrupts and syscalls raised by this task
    let kstack_phys = FRAME_ALLOCATOR.lock().alloc_contig(STACK_FRAMES)?;
    let kstack_top = phys_to_virt(kstack_phys).as_u64() + (STACK_FRAMES * PAGE_SIZE) as u64;

    // Ring-3 stack
    let ustack_phys = match FRAME_ALLOCATOR.lock().alloc_contig(STACK_FRAMES) {
        Ok(p) => p,
        Err(e) => {
            FRAME_ALLOCATOR.lock().release_range(kstack_phys, STACK_FRAMES);
            return Err(e);
        }
    };
    let ustack_top = USER_STACK_BASE + (STACK_FRAMES * PAGE_SIZE) as u64;

    // Code image frames
    let ucode_phys = match FRAME_ALLOCATOR.lock().alloc_contig(STACK_FRAMES) {
        Ok(p) => p,
        Err(e) => {
            FRAME_ALLOCATOR.lock().release_range(ustack_phys, STACK_FRAMES);
            FRAME_ALLOCATOR.lock().release_range(kstack_phys, STACK_FRAMES);
            return Err(e);
        }
    };

    // Fresh address space seeing the kernel half
    let kernel_space = AddressSpace::from_root(paging::current_root());
    let space = match AddressSpace::create_from(&env, &kernel_space) {
        Ok(s) => s,
        Err(e) => {
            FRAME_ALLOCATOR.lock().release_range(ucode_phys, STACK_FRAMES);
            FRAME_ALLOCATOR.lock().release_range(ustack_phys, STACK_FRAMES);
            FRAME_ALLOCATOR.lock().release_range(kstack_phys, STACK_FRAMES);
            return Err(e);
        }
    };

    let unwind = |space: AddressSpace,
                  kstack: PhysicalAddress,
                  ustack: PhysicalAddress,
                  ucode: PhysicalAddress| {
        space.destroy(&KernelEnv);
        let mut fa = FRAME_ALLOCATOR.lock();
        fa.release_range(ucode, STACK_FRAMES);
        fa.release_range(ustack, STACK_FRAMES);
        fa.release_range(kstack, STACK_FRAMES);
    };

    // Map stack and code into the new space without touching CR3
    if let Err(e) = space.map_range(
        &env,
        VirtualAddress::new(USER_STACK_BASE),
        ustack_phys,
        STACK_FRAMES,
        PageFlags::user(),
    ) {
        unwind(space, kstack_phys, ustack_phys, ucode_phys);
        return Err(e);
    }
    if let Err(e) = space.map_range(
        &env,
        VirtualAddress::new(USER_CODE_BASE),
        ucode_phys,
        STACK_FRAMES,
        PageFlags::user(),
    ) {
        unwind(space, kstack_phys, ustack_phys, ucode_phys);
        return Err(e);
    }

    // Copy the task image into the code frames through the direct map
    // SAFETY: the source is kernel code the caller vouches for; the
    // destination frames were just allocated and belong to this process.
    unsafe {
        core::ptr::copy_nonoverlapping(
            entry_in_kernel as *const u8,
            phys_to_virt(ucode_phys).as_u64() as *mut u8,
            USER_CODE_SIZE,
        );
    }

    let process = Box::new(Process {
        pid,
        parent,
        name: String::from(name),
        state: ProcessState::Ready,
        exit_code: 0,
        frame: initial_user_frame(USER_CODE_BASE, ustack_top),
        space,
        owns_space: true,
        kernel_stack_top: kstack_top,
        kernel_stack_phys: kstack_phys,
        user_stack_top: ustack_top,
        user_stack_phys: Some(ustack_phys),
        user_code_phys: Some(ucode_phys),
        priority,
        time_slice: DEFAULT_TIME_SLICE,
        time_used: 0,
        total_ticks: 0,
        wake_at_tick: 0,
    });

    match table.insert(process) {
        Ok(pid) => {
            log::info!(
                target: "process",
                "user task '{}' (pid {}): code {:#x}, stack {:#x}",
                name,
                pid,
                USER_CODE_BASE,
                ustack_top
            );
            Ok(pid)
        }
        Err(e) => {
            unwind(space, kstack_phys, ustack_phys, ucode_phys);
            Err(e)
        }
    }
}

/// Put the current process to sleep for `ticks` ticks and yield. The wake
/// tick is strictly in the future for any non-zero duration.
pub fn sleep_current(ticks: u64) {
    if ticks == 0 {
        crate::sched::yield_now();
        return;
    }
    let now = crate::arch::x86_64::timer::ticks();
    let sleeping = crate::arch::without_interrupts(|| {
        let mut table = PROCESS_TABLE.lock();
        let current = table.current_mut();
        if let Some(p) = current {
            p.wake_at_tick = now + ticks;
            p.state = ProcessState::Sleeping;
            Some(p.pid)
        } else {
            None
        }
    });
    if let Some(pid) = sleeping {
        crate::sched::dequeue(pid);
        crate::sched::yield_now();
    }
}

/// Terminate the current process. It becomes a ZOMBIE, leaves the ready
/// queue, and yields away; the scheduler never picks it again, so on bare
/// metal this does not return.
pub fn exit_current(code: i32) {
    let exiting = crate::arch::without_interrupts(|| {
        let mut table = PROCESS_TABLE.lock();
        let current = table.current_mut();
        if let Some(p) = current {
            p.state = ProcessState::Zombie;
            p.exit_code = code;
            Some(p.pid)
        } else {
            None
        }
    });
    if let Some(pid) = exiting {
        log::info!(target: "process", "pid {} exited with code {}", pid, code);
        crate::sched::dequeue(pid);
        crate::sched::yield_now();
        // A zombie is never rescheduled; park until preemption moves on.
        #[cfg(target_os = "none")]
        crate::arch::halt_forever();
    }
}

/// Mark `pid` DEAD and drop it from the ready queue. Storage is reclaimed
/// by the reaper.
pub fn kill(pid: ProcessId) -> KernelResult<()> {
    crate::arch::without_interrupts(|| {
        let mut table = PROCESS_TABLE.lock();
        let process = table
            .get_mut(pid)
            .ok_or(KernelError::ProcessNotFound { pid: pid.0 })?;
        process.state = ProcessState::Dead;
        Ok::<(), KernelError>(())
    })?;
    crate::sched::dequeue(pid);
    Ok(())
}

/// Reclaim every terminal PCB: release its stacks and code frames, destroy
/// its address space, and drop it from the table. Never touches the current
/// process.
#[cfg(target_os = "none")]
pub fn reap() {
    use crate::mm::{frame::FRAME_ALLOCATOR, paging::KernelEnv};

    crate::arch::without_interrupts(|| {
        let mut table = PROCESS_TABLE.lock();
        let current = table.current_pid();
        let victims: alloc::vec::Vec<ProcessId> = table
            .reapable()
            .filter(|pid| Some(*pid) != current)
            .collect();

        for pid in victims {
            let Some(process) = table.remove(pid) else {
                continue;
            };
            {
                let mut fa = FRAME_ALLOCATOR.lock();
                fa.release_range(process.kernel_stack_phys, STACK_FRAMES);
                if let Some(p) = process.user_stack_phys {
                    fa.release_range(p, STACK_FRAMES);
                }
                if let Some(p) = process.user_code_phys {
                    fa.release_range(p, STACK_FRAMES);
                }
            }
            if process.owns_space {
                process.space.destroy(&KernelEnv);
            }
            log::info!(target: "process", "reaped pid {} ('{}')", pid, process.name);
        }
    });
}

/// Debug listing of every process.
pub fn process_list() {
    crate::arch::without_interrupts(|| {
        let table = PROCESS_TABLE.lock();
        println!("\nPID   NAME                 STATE       PRIORITY  TICKS");
        println!("----  -------------------  ----------  --------  -----");
        for p in table.iter() {
            println!(
                "{:<4}  {:<19}  {:<10}  {:>8}  {:>5}",
                p.pid.0,
                p.name,
                p.state.name(),
                p.priority,
                p.total_ticks
            );
        }
        println!();
    });
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod tests {
    extern crate std;

    use super::*;

    /// Minimal PCB for table and scheduler tests.
    pub(crate) fn test_process(pid: ProcessId, name: &str) -> Box<Process> {
        Box::new(Process {
            pid,
            parent: ProcessId(0),
            name: String::from(name),
            state: ProcessState::Ready,
            exit_code: 0,
            frame: initial_kernel_frame(0x1000 * pid.0, 0xFFFF_8000_0100_0000),
            space: AddressSpace::from_root(crate::mm::PhysicalAddress::new(0)),
            owns_space: false,
            kernel_stack_top: 0xFFFF_8000_0100_0000,
            kernel_stack_phys: crate::mm::PhysicalAddress::new(0x10_000),
            user_stack_top: 0,
            user_stack_phys: None,
            user_code_phys: None,
            priority: 0,
            time_slice: DEFAULT_TIME_SLICE,
            time_used: 0,
            total_ticks: 0,
            wake_at_tick: 0,
        })
    }

    #[test]
    fn pids_are_monotone_and_unique() {
        let mut table = ProcessTable::new();
        let a = table.alloc_pid();
        let b = table.alloc_pid();
        let c = table.alloc_pid();
        assert!(a < b && b < c);
        assert_eq!(a.0 + 2, c.0);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut table = ProcessTable::new();
        for _ in 0..MAX_PROCESSES {
            let pid = table.alloc_pid();
            table.insert(test_process(pid, "filler")).unwrap();
        }
        let pid = table.alloc_pid();
        let err = table.insert(test_process(pid, "overflow")).unwrap_err();
        assert!(matches!(err, KernelError::ResourceExhausted { .. }));
    }

    #[test]
    fn duplicate_pid_is_rejected() {
        let mut table = ProcessTable::new();
        table.insert(test_process(ProcessId(7), "one")).unwrap();
        let err = table.insert(test_process(ProcessId(7), "two")).unwrap_err();
        assert!(matches!(err, KernelError::AlreadyExists { .. }));
    }

    #[test]
    fn due_sleepers_honor_wake_tick() {
        let mut table = ProcessTable::new();
        let mut early = test_process(ProcessId(1), "early");
        early.state = ProcessState::Sleeping;
        early.wake_at_tick = 100;
        let mut late = test_process(ProcessId(2), "late");
        late.state = ProcessState::Sleeping;
        late.wake_at_tick = 200;
        table.insert(early).unwrap();
        table.insert(late).unwrap();

        let due: std::vec::Vec<_> = table.due_sleepers(99).collect();
        assert!(due.is_empty());
        let due: std::vec::Vec<_> = table.due_sleepers(100).collect();
        assert_eq!(due, [ProcessId(1)]);
        let due: std::vec::Vec<_> = table.due_sleepers(250).collect();
        assert_eq!(due.len(), 2);
    }

    #[test]
    fn reapable_finds_terminal_states() {
        let mut table = ProcessTable::new();
        let mut zombie = test_process(ProcessId(1), "zombie");
        zombie.state = ProcessState::Zombie;
        let mut dead = test_process(ProcessId(2), "dead");
        dead.state = ProcessState::Dead;
        let live = test_process(ProcessId(3), "live");
        table.insert(zombie).unwrap();
        table.insert(dead).unwrap();
        table.insert(live).unwrap();

        let reapable: std::vec::Vec<_> = table.reapable().collect();
        assert_eq!(reapable.len(), 2);
        assert!(!reapable.contains(&ProcessId(3)));
    }

    #[test]
    fn kill_marks_dead_and_leaves_queue() {
        let _g = crate::test_sync::guard();
        let pid = ProcessId(9999);
        PROCESS_TABLE.lock().insert(test_process(pid, "victim")).unwrap();
        crate::sched::enqueue(pid);

        kill(pid).unwrap();
        assert_eq!(
            PROCESS_TABLE.lock().get(pid).unwrap().state,
            ProcessState::Dead
        );

        // Killing an unknown pid reports the error
        assert!(kill(ProcessId(123_456)).is_err());

        PROCESS_TABLE.lock().remove(pid);
    }

    #[test]
    fn initial_kernel_frame_contract() {
        let frame = initial_kernel_frame(0xCAFE, 0xFFFF_8000_0020_0000);
        assert_eq!(frame.rip, 0xCAFE);
        assert_eq!(frame.rsp, 0xFFFF_8000_0020_0000);
        assert_eq!(frame.rflags, 0x202);
        assert_eq!(frame.cs, 0x08);
        assert_eq!(frame.ss, 0x10);
        assert!(!frame.from_user());
    }

    #[test]
    fn initial_user_frame_contract() {
        let frame = initial_user_frame(super::super::USER_CODE_BASE, 0x80_0001_0000);
        assert_eq!(frame.cs, 0x1B);
        assert_eq!(frame.ss, 0x23);
        assert_eq!(frame.ds, 0x23);
        assert_eq!(frame.rflags, 0x202);
        assert!(frame.from_user());
    }
}
