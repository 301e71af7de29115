//! NovaKernel boot binary
//!
//! Entered from a multiboot2 loader with long mode and the initial page
//! tables already in place. Brings every subsystem up in dependency order,
//! spawns the first tasks (three kernel demo tasks, the idle task, and one
//! ring-3 task), starts the scheduler, and enables interrupts exactly once.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
mod kernel_main {
    use core::arch::{global_asm, naked_asm};
    use core::panic::PanicInfo;

    use nova_kernel::arch::x86_64::vga::{self, Color};
    use nova_kernel::arch::x86_64::{boot, gdt, idt, pic, timer};
    use nova_kernel::mm::{self, frame, heap, paging, VirtualAddress};
    use nova_kernel::{arch, drivers, fs, logger, print, println, process, sched, syscall};

    // The loader leaves the multiboot magic in EAX and the info pointer in
    // EBX; move them into the SysV argument registers and give ourselves a
    // real stack before entering Rust.
    global_asm!(
        r#"
    .section .text
    .global _start
    _start:
        lea rsp, [rip + boot_stack_top]
        mov edi, eax
        mov esi, ebx
        call kernel_entry
    1:
        hlt
        jmp 1b

    .section .bss
    .align 16
    boot_stack:
        .skip 16384
    boot_stack_top:
    "#
    );

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        vga::set_color(Color::White, Color::Red);
        println!("\n*** KERNEL PANIC ***");
        println!("{}", info);
        println!("System halted.");
        nova_kernel::serial_println!("[KERNEL PANIC] {}", info);
        arch::halt_forever()
    }

    fn banner() {
        vga::set_color(Color::LightCyan, Color::Black);
        println!();
        println!("  _   _                 _  __                    _ ");
        println!(" | \\ | | _____   ____ _| |/ /___ _ __ _ __   ___| |");
        println!(" |  \\| |/ _ \\ \\ / / _` | ' // _ \\ '__| '_ \\ / _ \\ |");
        println!(" | |\\  | (_) \\ V / (_| | . \\  __/ |  | | | |  __/ |");
        println!(" |_| \\_|\\___/ \\_/ \\__,_|_|\\_\\___|_|  |_| |_|\\___|_|");
        println!();
        vga::set_color(Color::White, Color::Black);
        println!("  NovaKernel v{} for x86_64", env!("CARGO_PKG_VERSION"));
        println!("  Multiboot2 / long mode / 512 MiB");
        println!();
    }

    fn init_status(component: &str) {
        vga::set_color(Color::LightGreen, Color::Black);
        print!("  [ OK ] ");
        vga::set_color(Color::White, Color::Black);
        println!("{}", component);
    }

    /// Quick self-checks of the memory stack, in the spirit of a POST.
    fn memory_smoke_test() {
        // Frame allocator round trip
        let (a, b, c) = {
            let mut fa = frame::FRAME_ALLOCATOR.lock();
            (
                fa.alloc_one().expect("frame a"),
                fa.alloc_one().expect("frame b"),
                fa.alloc_one().expect("frame c"),
            )
        };
        frame::FRAME_ALLOCATOR.lock().release_one(b);
        let again = frame::FRAME_ALLOCATOR.lock().alloc_one().expect("frame b again");
        assert_eq!(again, b);
        {
            let mut fa = frame::FRAME_ALLOCATOR.lock();
            fa.release_one(a);
            fa.release_one(again);
            fa.release_one(c);
        }

        // Heap allocations behind `alloc`
        {
            let mut v = alloc::vec::Vec::new();
            for i in 0..64 {
                v.push(i * i);
            }
            assert_eq!(v[7], 49);
            let s = alloc::string::String::from("heap allocation works");
            assert!(s.len() > 0);
        }
        assert!(heap::validate());

        // Paging: map a fresh frame, translate it back, unmap
        let env = paging::KernelEnv;
        let kernel_space = paging::AddressSpace::from_root(paging::current_root());
        let phys = frame::FRAME_ALLOCATOR.lock().alloc_one().expect("map frame");
        let virt = VirtualAddress::new(0xFFFF_8003_0000_0000);
        kernel_space
            .map(&env, virt, phys, mm::PageFlags::kernel())
            .expect("map");
        assert_eq!(kernel_space.translate(&env, virt), Some(phys));
        kernel_space.unmap(&env, virt);
        assert_eq!(kernel_space.translate(&env, virt), None);
        frame::FRAME_ALLOCATOR.lock().release_one(phys);

        let stats = mm::stats();
        println!(
            "  Memory: {} MiB total, {} pages free",
            stats.total_memory / (1024 * 1024),
            stats.free_pages
        );
    }

    fn mount_disk() {
        let Some(disk) = drivers::block::get("hda") else {
            println!("  No disk (hda) found; running without a filesystem");
            return;
        };
        println!(
            "  Found disk: {} ({} MiB)",
            disk.name,
            disk.size_bytes() / (1024 * 1024)
        );
        if let Err(e) = fs::simplefs::format(&disk) {
            println!("  Disk format failed: {}", e);
            return;
        }
        match fs::simplefs::mount(disk) {
            Ok(root) => fs::vfs::mount_root(root),
            Err(e) => println!("  Mount failed: {}", e),
        }
    }

    // ---- first tasks ----

    extern "C" fn counter_task() -> ! {
        let mut count: u64 = 0;
        loop {
            vga::set_color(Color::LightGreen, Color::Black);
            println!("[task 1] count: {}", count);
            vga::set_color(Color::White, Color::Black);
            count += 1;
            process::sleep_current(100);
        }
    }

    extern "C" fn slow_counter_task() -> ! {
        let mut count: u64 = 0;
        loop {
            vga::set_color(Color::LightCyan, Color::Black);
            println!("[task 2] count: {}", count);
            vga::set_color(Color::White, Color::Black);
            count += 1;
            process::sleep_current(150);
        }
    }

    extern "C" fn uptime_task() -> ! {
        loop {
            vga::set_color(Color::Yellow, Color::Black);
            println!("[task 3] uptime: {} ms", timer::uptime_ms());
            vga::set_color(Color::White, Color::Black);
            process::sleep_current(200);
        }
    }

    /// Runs when nothing else is ready; also reclaims terminated processes.
    extern "C" fn idle_task() -> ! {
        loop {
            process::reap();
            arch::wait_for_interrupt();
        }
    }

    /// Ring-3 demo: pure position-independent code (it is copied into the
    /// user address space). getpid, five putchar/sleep rounds, then exit --
    /// everything through `int 0x80`.
    #[unsafe(naked)]
    extern "C" fn user_task_entry() {
        naked_asm!(
            "mov rax, 5", // getpid
            "int 0x80",
            "mov rbx, 5",
            "2:",
            "mov rax, 15", // putchar 'U'
            "mov rdi, 85",
            "int 0x80",
            "mov rax, 6", // sleep 500 ms
            "mov rdi, 500",
            "int 0x80",
            "dec rbx",
            "jnz 2b",
            "mov rax, 0", // exit(0)
            "xor rdi, rdi",
            "int 0x80",
            "3:",
            "jmp 3b",
        )
    }

    #[no_mangle]
    pub extern "C" fn kernel_entry(magic: u32, _info: u32) -> ! {
        vga::clear();
        banner();

        boot::check_magic(magic);
        init_status("Multiboot2 handoff");

        logger::init();
        init_status("Kernel logger");

        let kernel_end = boot::kernel_end();
        frame::init(boot::TOTAL_MEMORY, kernel_end);
        init_status("Physical frame allocator");

        let _kernel_space = paging::init(kernel_end).expect("paging init");
        init_status("Paging engine");

        heap::init().expect("heap init");
        init_status("Kernel heap");

        gdt::init();
        init_status("GDT / TSS");

        idt::init();
        init_status("IDT");

        pic::init();
        init_status("PIC remap (32/40)");

        timer::init();
        init_status("PIT timer (100 Hz)");

        process::init();
        init_status("Process table");

        syscall::init();
        init_status("Syscall gate (0x80)");

        drivers::block::init();
        drivers::ata::init();
        init_status("Block devices / ATA");

        fs::vfs::init();
        mount_disk();
        init_status("VFS");

        println!();
        memory_smoke_test();
        println!();

        // First tasks
        let t1 = process::spawn_kernel(counter_task, "task1", 0).expect("task1");
        let t2 = process::spawn_kernel(slow_counter_task, "task2", 0).expect("task2");
        let t3 = process::spawn_kernel(uptime_task, "task3", 0).expect("task3");
        let idle = process::spawn_kernel(idle_task, "idle", 31).expect("idle");
        let user = process::spawn_user(user_task_entry as usize as u64, "user_demo", 1)
            .expect("user task");

        for pid in [t1, t2, t3, idle, user] {
            sched::enqueue(pid);
        }
        process::process_list();

        vga::set_color(Color::LightGreen, Color::Black);
        println!("Starting multitasking...");
        vga::set_color(Color::White, Color::Black);

        sched::start();
        timer::unmask_timer();
        arch::enable_interrupts();

        // The first tick switches away for good; this context is never
        // resumed (there is no PCB for it).
        loop {
            arch::wait_for_interrupt();
        }
    }
}

/// Host builds have no kernel to run; the binary exists for the bare-metal
/// target only.
#[cfg(not(target_os = "none"))]
fn main() {}
