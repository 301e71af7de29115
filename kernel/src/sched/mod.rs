//! Preemptive round-robin scheduler
//!
//! Runs as the body of the timer-vector handler. On every invocation it
//! rewrites the live interrupt frame in place: the outgoing task's register
//! state is copied into its PCB, the incoming task's saved state is copied
//! into the frame, and the `iretq` at the end of the interrupt path resumes
//! a different task. The ready queue holds exactly the READY processes.
//!
//! Priority exists in the PCB as metadata only; this revision rotates the
//! queue without consulting it.

use alloc::collections::VecDeque;

use spin::Mutex;

use crate::arch::x86_64::interrupts::RegisterFrame;
use crate::process::{ProcessId, ProcessState, ProcessTable, PROCESS_TABLE};

/// Scheduler state: the ready queue and the run/stop switch.
pub struct Scheduler {
    queue: VecDeque<ProcessId>,
    running: bool,
    context_switches: u64,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            running: false,
            context_switches: 0,
        }
    }

    /// Put `pid` on the ready queue and mark it READY. Re-enqueueing a
    /// queued process is a no-op, preserving the one-position invariant.
    pub fn enqueue(&mut self, table: &mut ProcessTable, pid: ProcessId) {
        if self.queue.contains(&pid) {
            return;
        }
        let Some(process) = table.get_mut(pid) else {
            return;
        };
        process.state = ProcessState::Ready;
        self.queue.push_back(pid);
    }

    /// Drop `pid` from the ready queue (sleep, block, exit, kill).
    pub fn dequeue(&mut self, pid: ProcessId) {
        self.queue.retain(|p| *p != pid);
    }

    pub fn ready_count(&self) -> usize {
        self.queue.len()
    }

    pub fn context_switches(&self) -> u64 {
        self.context_switches
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Wake every sleeper whose deadline has passed. Enqueueing flips the
    /// state to READY, so repeatedly taking the first due sleeper terminates
    /// without allocating in the tick path.
    fn wake_sleepers(&mut self, table: &mut ProcessTable, now: u64) {
        loop {
            let pid = match table.due_sleepers(now).next() {
                Some(pid) => pid,
                None => break,
            };
            self.enqueue(table, pid);
        }
    }

    /// One scheduling decision at tick `now` against the live frame.
    pub fn schedule_at(&mut self, table: &mut ProcessTable, frame: &mut RegisterFrame, now: u64) {
        if !self.running {
            return;
        }

        self.wake_sleepers(table, now);

        if self.queue.is_empty() {
            // Nothing else is runnable; the current task keeps the CPU.
            return;
        }

        // Save the outgoing task and rotate it to the back of the queue if
        // it is still runnable.
        let current = table.current_pid();
        if let Some(pid) = current {
            if let Some(process) = table.get_mut(pid) {
                process.frame = *frame;
                process.time_used = 0;
                if process.state == ProcessState::Running {
                    process.state = ProcessState::Ready;
                    if !self.queue.contains(&pid) {
                        self.queue.push_back(pid);
                    }
                }
            }
        }

        // Round-robin pick: head of the queue. Skip stale entries.
        let next = loop {
            let Some(pid) = self.queue.pop_front() else {
                return;
            };
            if table
                .get(pid)
                .is_some_and(|p| p.state == ProcessState::Ready)
            {
                break pid;
            }
        };

        if Some(next) == current {
            // Sole runnable task: leave the frame alone, keep it running.
            let process = table.get_mut(next).expect("picked pid vanished");
            process.state = ProcessState::Running;
            return;
        }

        let process = table.get_mut(next).expect("picked pid vanished");
        process.state = ProcessState::Running;
        process.total_ticks += 1;

        // Resume the incoming task by rewriting the frame in place
        *frame = process.frame;

        // Ring-3 interrupts must land on this task's kernel stack
        crate::arch::x86_64::gdt::set_kernel_stack(process.kernel_stack_top);

        let space = process.space;
        table.set_current(Some(next));
        self.context_switches += 1;

        // Install the next task's translation root if it differs (the write
        // implicitly flushes the TLB)
        if space.root() != crate::mm::paging::current_root() {
            space.switch_to();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Global scheduler.
///
/// Lock order: this lock is always taken before the process table's.
pub static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Timer-vector entry point: one scheduling decision against the live frame.
pub fn schedule(frame: &mut RegisterFrame) {
    let now = crate::arch::x86_64::timer::ticks();
    let mut sched = SCHEDULER.lock();
    let mut table = PROCESS_TABLE.lock();
    sched.schedule_at(&mut table, frame, now);
}

/// Add a process to the ready queue.
pub fn enqueue(pid: ProcessId) {
    crate::arch::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let mut table = PROCESS_TABLE.lock();
        sched.enqueue(&mut table, pid);
    });
}

/// Remove a process from the ready queue.
pub fn dequeue(pid: ProcessId) {
    crate::arch::without_interrupts(|| {
        SCHEDULER.lock().dequeue(pid);
    });
}

/// Begin scheduling. The first timer tick after this performs the first
/// switch; the boot thread enables interrupts right after calling it.
pub fn start() {
    SCHEDULER.lock().start();
    log::info!(target: "sched", "scheduler started (round-robin)");
}

pub fn stop() {
    crate::arch::without_interrupts(|| {
        SCHEDULER.lock().stop();
    });
}

/// Voluntarily give up the CPU: raise the timer vector synchronously so the
/// same dispatcher path performs the switch.
pub fn yield_now() {
    #[cfg(target_os = "none")]
    crate::arch::x86_64::interrupts::raise_timer();
}

/// Block the current process: off the queue, state BLOCKED, yield.
pub fn block_current() {
    let blocked = crate::arch::without_interrupts(|| {
        let mut table = PROCESS_TABLE.lock();
        let current = table.current_mut();
        if let Some(p) = current {
            p.state = ProcessState::Blocked;
            Some(p.pid)
        } else {
            None
        }
    });
    if let Some(pid) = blocked {
        dequeue(pid);
        yield_now();
    }
}

/// Unblock `pid`: back on the queue, state READY.
pub fn unblock(pid: ProcessId) {
    crate::arch::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let mut table = PROCESS_TABLE.lock();
        if table
            .get(pid)
            .is_some_and(|p| p.state == ProcessState::Blocked)
        {
            sched.enqueue(&mut table, pid);
        }
    });
}

/// Print scheduler statistics.
pub fn print_stats() {
    crate::arch::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        println!("\nScheduler statistics:");
        println!("  Running:          {}", sched.is_running());
        println!("  Ready processes:  {}", sched.ready_count());
        println!("  Context switches: {}", sched.context_switches());
        println!(
            "  Uptime:           {} ms",
            crate::arch::x86_64::timer::uptime_ms()
        );
    });
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;
    use std::collections::HashMap;

    use super::*;
    use crate::process::test_process;

    fn setup(n: u64) -> (Scheduler, ProcessTable) {
        let mut table = ProcessTable::new();
        let mut sched = Scheduler::new();
        for i in 1..=n {
            let pid = ProcessId(i);
            table.insert(test_process(pid, "task")).unwrap();
            sched.enqueue(&mut table, pid);
        }
        sched.start();
        (sched, table)
    }

    #[test]
    fn does_nothing_until_started() {
        let mut table = ProcessTable::new();
        let mut sched = Scheduler::new();
        table.insert(test_process(ProcessId(1), "t")).unwrap();
        sched.enqueue(&mut table, ProcessId(1));

        let mut frame = RegisterFrame::zeroed();
        sched.schedule_at(&mut table, &mut frame, 0);
        assert_eq!(frame.rip, 0);
        assert_eq!(table.current_pid(), None);
    }

    #[test]
    fn first_switch_loads_saved_frame() {
        let (mut sched, mut table) = setup(1);
        let mut frame = RegisterFrame::zeroed();
        sched.schedule_at(&mut table, &mut frame, 0);

        assert_eq!(table.current_pid(), Some(ProcessId(1)));
        assert_eq!(frame.rip, 0x1000); // test_process seeds rip = 0x1000 * pid
        assert_eq!(table.get(ProcessId(1)).unwrap().state, ProcessState::Running);
    }

    #[test]
    fn round_robin_rotates() {
        let (mut sched, mut table) = setup(3);
        let mut frame = RegisterFrame::zeroed();

        let mut order = std::vec::Vec::new();
        for _ in 0..6 {
            sched.schedule_at(&mut table, &mut frame, 0);
            order.push(table.current_pid().unwrap().0);
        }
        assert_eq!(order, [1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn exactly_one_running_process() {
        let (mut sched, mut table) = setup(4);
        let mut frame = RegisterFrame::zeroed();
        for tick in 0..20 {
            sched.schedule_at(&mut table, &mut frame, tick);
            let running = table
                .iter()
                .filter(|p| p.state == ProcessState::Running)
                .count();
            assert_eq!(running, 1);
        }
    }

    #[test]
    fn outgoing_state_is_captured_in_pcb() {
        let (mut sched, mut table) = setup(2);
        let mut frame = RegisterFrame::zeroed();
        sched.schedule_at(&mut table, &mut frame, 0); // now running pid 1

        // The task computes something
        frame.rax = 0xABCD;
        frame.rip = 0x1111;

        sched.schedule_at(&mut table, &mut frame, 1); // switch to pid 2
        assert_eq!(table.current_pid(), Some(ProcessId(2)));
        let saved = &table.get(ProcessId(1)).unwrap().frame;
        assert_eq!(saved.rax, 0xABCD);
        assert_eq!(saved.rip, 0x1111);
        // And the live frame now holds pid 2's state
        assert_eq!(frame.rip, 0x2000);
    }

    #[test]
    fn sole_task_keeps_running_without_rewrite() {
        let (mut sched, mut table) = setup(1);
        let mut frame = RegisterFrame::zeroed();
        sched.schedule_at(&mut table, &mut frame, 0);
        frame.rip = 0x4242; // progress since the switch

        sched.schedule_at(&mut table, &mut frame, 1);
        // No other candidate: the frame must not be rewritten backwards
        assert_eq!(frame.rip, 0x4242);
        assert_eq!(table.current_pid(), Some(ProcessId(1)));
    }

    #[test]
    fn queue_membership_iff_ready() {
        let (mut sched, mut table) = setup(2);
        let mut frame = RegisterFrame::zeroed();
        sched.schedule_at(&mut table, &mut frame, 0);

        // Sleep pid 1 (the current task)
        {
            let p = table.get_mut(ProcessId(1)).unwrap();
            p.state = ProcessState::Sleeping;
            p.wake_at_tick = 10;
        }
        sched.dequeue(ProcessId(1));

        sched.schedule_at(&mut table, &mut frame, 1);
        assert_eq!(table.current_pid(), Some(ProcessId(2)));
        // Only pid 2 rotates through the queue
        assert_eq!(sched.ready_count(), 0); // pid 2 is running, queue empty

        // Wake tick arrives: the sweep requeues pid 1
        sched.schedule_at(&mut table, &mut frame, 10);
        assert_eq!(table.current_pid(), Some(ProcessId(1)));
        assert_eq!(table.get(ProcessId(1)).unwrap().state, ProcessState::Running);
    }

    #[test]
    fn sleeper_never_wakes_early() {
        let (mut sched, mut table) = setup(2);
        let mut frame = RegisterFrame::zeroed();
        sched.schedule_at(&mut table, &mut frame, 0);

        {
            let p = table.get_mut(ProcessId(1)).unwrap();
            p.state = ProcessState::Sleeping;
            p.wake_at_tick = 50;
        }
        sched.dequeue(ProcessId(1));

        for tick in 1..50 {
            sched.schedule_at(&mut table, &mut frame, tick);
            assert_ne!(table.current_pid(), Some(ProcessId(1)), "woke at tick {}", tick);
        }
        sched.schedule_at(&mut table, &mut frame, 50);
        assert_eq!(table.current_pid(), Some(ProcessId(1)));
    }

    #[test]
    fn zombie_is_never_rescheduled() {
        let (mut sched, mut table) = setup(2);
        let mut frame = RegisterFrame::zeroed();
        sched.schedule_at(&mut table, &mut frame, 0); // pid 1 running

        {
            let p = table.get_mut(ProcessId(1)).unwrap();
            p.state = ProcessState::Zombie;
        }
        sched.dequeue(ProcessId(1));

        for tick in 1..10 {
            sched.schedule_at(&mut table, &mut frame, tick);
            assert_eq!(table.current_pid(), Some(ProcessId(2)));
        }
    }

    #[test]
    fn fairness_over_many_ticks() {
        let (mut sched, mut table) = setup(3);
        let mut frame = RegisterFrame::zeroed();

        for tick in 0..3000 {
            sched.schedule_at(&mut table, &mut frame, tick);
        }

        let shares: HashMap<u64, u64> = table.iter().map(|p| (p.pid.0, p.total_ticks)).collect();
        let total: u64 = shares.values().sum();
        for (&pid, &ticks) in &shares {
            let share = ticks as f64 / total as f64;
            assert!(
                (share - 1.0 / 3.0).abs() < 0.05,
                "pid {} got share {:.3}",
                pid,
                share
            );
        }
    }

    #[test]
    fn enqueue_is_idempotent() {
        let mut table = ProcessTable::new();
        let mut sched = Scheduler::new();
        table.insert(test_process(ProcessId(1), "t")).unwrap();
        sched.enqueue(&mut table, ProcessId(1));
        sched.enqueue(&mut table, ProcessId(1));
        // A process never occupies two queue positions
        assert_eq!(sched.ready_count(), 1);
    }

    #[test]
    fn block_and_unblock_through_globals() {
        let _g = crate::test_sync::guard();
        let pid = ProcessId(8888);
        PROCESS_TABLE.lock().insert(test_process(pid, "blk")).unwrap();
        super::enqueue(pid);
        PROCESS_TABLE.lock().set_current(Some(pid));

        super::block_current();
        assert_eq!(
            PROCESS_TABLE.lock().get(pid).unwrap().state,
            ProcessState::Blocked
        );

        super::unblock(pid);
        assert_eq!(
            PROCESS_TABLE.lock().get(pid).unwrap().state,
            ProcessState::Ready
        );

        // Cleanup the shared state
        super::dequeue(pid);
        let mut table = PROCESS_TABLE.lock();
        table.set_current(None);
        table.remove(pid);
    }

    #[test]
    fn stale_queue_entries_are_skipped() {
        let (mut sched, mut table) = setup(3);
        // pid 2 dies while still queued (defensive path)
        table.get_mut(ProcessId(2)).unwrap().state = ProcessState::Dead;

        let mut frame = RegisterFrame::zeroed();
        sched.schedule_at(&mut table, &mut frame, 0);
        assert_eq!(table.current_pid(), Some(ProcessId(1)));
        sched.schedule_at(&mut table, &mut frame, 1);
        // pid 2 is skipped; pid 3 runs
        assert_eq!(table.current_pid(), Some(ProcessId(3)));
    }
}
