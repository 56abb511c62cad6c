//! End-to-end scenarios driving the emulator through its public API,
//! exercising the interpreter, JIT path builder, memory subsystem, and
//! signal core together rather than each in isolation.

use std::io::Write;
use std::sync::atomic::Ordering;

use uxe::machine::{GuestFault, Machine, System};
use uxe::memory::PteFlags;
use uxe::regs::Reg;
use uxe::signal::{SigAction, SIG_DFL};

const CODE_BASE: u64 = 0x40_0000;

fn fresh_system(jitless: bool) -> std::sync::Arc<System> {
    System::new(CODE_BASE, CODE_BASE + 0x1000, jitless)
}

fn map_rwx_page(system: &System, vaddr: u64) {
    system.mem.commit(vaddr, 1, PteFlags::WRITABLE | PteFlags::USER | PteFlags::HOST_EXEC).unwrap();
}

#[test]
fn integer_add_sets_flags_cleanly_and_exits_via_syscall() {
    // mov eax,1; add eax,2; pushf; pop rax; mov edi,3; mov eax,60 (exit);
    // syscall
    let sys = fresh_system(true);
    map_rwx_page(&sys, CODE_BASE);
    let code: Vec<u8> = vec![
        0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0x83, 0xc0, 0x02, // add eax, 2
        0x9c, // pushf
        0x58, // pop rax
        0xbf, 0x03, 0x00, 0x00, 0x00, // mov edi, 3
        0xb8, 0x3c, 0x00, 0x00, 0x00, // mov eax, 60 (sys_exit)
        0x0f, 0x05, // syscall
    ];
    sys.mem.write_bytes(CODE_BASE, &code).unwrap();

    let tid = sys.alloc_tid();
    let mut m = Machine::new(sys.clone(), tid, CODE_BASE);
    m.regs.set64(Reg::Rsp, CODE_BASE + 0x800);

    // Run the add + pushf/pop by hand so we can inspect rax (the flags
    // word) before the exit syscall tears the machine down.
    m.step().unwrap(); // mov eax, 1
    m.step().unwrap(); // add eax, 2 -> 3, ZF=0 CF=0 SF=0 OF=0
    m.step().unwrap(); // pushf
    m.step().unwrap(); // pop rax
    let flags = m.regs.get64(Reg::Rax);
    assert_eq!(flags & 0x1, 0, "CF should be clear");
    assert_eq!(flags & 0x40, 0, "ZF should be clear");
    assert_eq!(flags & 0x80, 0, "SF should be clear");
    assert_eq!(flags & 0x800, 0, "OF should be clear");

    let fault = m.run_until_halt();
    assert_eq!(fault, GuestFault::Exit(3));
}

#[test]
fn atomic_increment_under_lock_has_no_tears_across_two_threads() {
    // loop: lock inc qword [rbx]; dec rcx; jnz loop; hlt
    let sys = fresh_system(true);
    map_rwx_page(&sys, CODE_BASE);
    let counter_addr = CODE_BASE + 0x100;
    let loop_code: Vec<u8> = vec![
        0xf0, 0x48, 0xff, 0x03, // lock inc qword ptr [rbx]
        0x48, 0xff, 0xc9, // dec rcx
        0x75, 0xf7, // jnz loop (back 9 bytes)
        0xf4, // hlt
    ];
    sys.mem.write_bytes(CODE_BASE, &loop_code).unwrap();
    sys.mem.write_slice(counter_addr, &0u64.to_le_bytes()).unwrap();

    const ITERATIONS: u64 = 100_000;
    let mut threads = Vec::new();
    for _ in 0..2 {
        let tid = sys.alloc_tid();
        let mut m = Machine::new(sys.clone(), tid, CODE_BASE);
        m.regs.set64(Reg::Rsp, CODE_BASE + 0x800);
        m.regs.set64(Reg::Rbx, counter_addr);
        m.regs.set64(Reg::Rcx, ITERATIONS);
        threads.push(std::thread::spawn(move || m.run_until_halt()));
    }
    for t in threads {
        assert_eq!(t.join().unwrap(), GuestFault::Halt);
    }

    let bytes = sys.mem.read_slice(counter_addr, 8).unwrap();
    let counter = u64::from_le_bytes(bytes.try_into().unwrap());
    assert_eq!(counter, 2 * ITERATIONS, "lock inc must not drop updates under contention");
}

#[test]
fn jit_block_overflow_past_the_midpoint_grows_block_size() {
    // Threads two maximum-length (budget-capped) functions back to back
    // into the same freshly mapped block, eating most of its capacity
    // without ever tripping the per-path instruction budget, then attempts
    // a third: it should overflow the block's remaining space well short
    // of the budget, and the overflow should grow `block_size` since by
    // then the block is already packed past its midpoint.
    use uxe::jit::Jit;
    use uxe::path::{PathBuilder, PathOutcome, MAX_PATH_INSTRUCTIONS};
    use uxe::stats::Stats;

    let jit = Jit::new(0x40_0000);
    let stats = Stats::default();
    let initial_block_size = jit.block_size();
    let add_bytes = [0x48, 0x01, 0xc8]; // add rax, rcx

    for fn_no in 0..2u64 {
        let start_pc = 0x10_0000 + fn_no * 0x10_000;
        let mut pb = PathBuilder::start(&jit, &stats, start_pc).unwrap();
        let mut pc = start_pc;
        for _ in 0..MAX_PATH_INSTRUCTIONS {
            pc = pb.add_instruction(&add_bytes, pc).unwrap().expect("add is always threadable");
        }
        match pb.commit() {
            PathOutcome::Committed { instructions, .. } => assert_eq!(instructions, MAX_PATH_INSTRUCTIONS),
            PathOutcome::Abandoned { reason } => panic!("warm-up function should fit in a fresh block: {reason}"),
        }
    }
    assert_eq!(stats.path_count.load(Ordering::Relaxed), 2);

    let start_pc = 0x20_0000;
    let mut pb = PathBuilder::start(&jit, &stats, start_pc).unwrap();
    let mut pc = start_pc;
    let outcome = loop {
        match pb.add_instruction(&add_bytes, pc) {
            Ok(Some(next)) => pc = next,
            Ok(None) => unreachable!("add rax, rcx is always threadable"),
            Err(reason) => break pb.abandon(reason),
        }
    };
    match outcome {
        PathOutcome::Abandoned { reason } => assert_eq!(reason, "block ran out of space mid-path"),
        PathOutcome::Committed { .. } => panic!("third function should have overflowed the shared block"),
    }

    assert!(jit.block_size() > initial_block_size, "overflow past the block's midpoint must grow block_size");
    assert_eq!(stats.path_ooms.load(Ordering::Relaxed), 1);
    assert_eq!(stats.path_count.load(Ordering::Relaxed), 2, "the two functions that fit must still be committed");
}

#[test]
fn jitted_and_interpreted_runs_agree_on_final_register_state() {
    // A modest run of register ALU ops, well within both the per-path
    // instruction budget and a single block's capacity, compiled on one
    // system and interpreted on another: both must land on the same
    // architectural state.
    let jitful_sys = fresh_system(false);
    let interpreter_sys = fresh_system(true);
    map_rwx_page(&jitful_sys, CODE_BASE);
    map_rwx_page(&interpreter_sys, CODE_BASE);

    let mut code = Vec::new();
    for i in 0..200u64 {
        if i % 2 == 0 {
            code.extend_from_slice(&[0x48, 0x01, 0xc8]); // add rax, rcx
        } else {
            code.extend_from_slice(&[0x48, 0x31, 0xd0]); // xor rax, rdx
        }
    }
    code.push(0xf4); // hlt

    jitful_sys.mem.write_bytes(CODE_BASE, &code).unwrap();
    interpreter_sys.mem.write_bytes(CODE_BASE, &code).unwrap();

    let tid = jitful_sys.alloc_tid();
    let mut m1 = Machine::new(jitful_sys.clone(), tid, CODE_BASE);
    m1.regs.set64(Reg::Rcx, 7);
    m1.regs.set64(Reg::Rdx, 3);
    assert_eq!(m1.run_until_halt(), GuestFault::Halt);

    let tid2 = interpreter_sys.alloc_tid();
    let mut m2 = Machine::new(interpreter_sys.clone(), tid2, CODE_BASE);
    m2.regs.set64(Reg::Rcx, 7);
    m2.regs.set64(Reg::Rdx, 3);
    assert_eq!(m2.run_until_halt(), GuestFault::Halt);

    assert_eq!(m1.regs.get64(Reg::Rax), m2.regs.get64(Reg::Rax), "jitted and interpreted runs must agree");
    assert!(jitful_sys.stats.instructions_jitted.load(Ordering::Relaxed) > 0, "this run should actually have threaded a path");
}

#[test]
fn mprotect_invalidates_a_warmed_jit_hook() {
    let sys = fresh_system(false);
    map_rwx_page(&sys, CODE_BASE);
    // add rax, rcx ; ret -- the leading instruction is threadable, so
    // stepping once here builds and commits a path, publishing a hook at
    // CODE_BASE.
    sys.mem.write_bytes(CODE_BASE, &[0x48, 0x01, 0xc8, 0xc3]).unwrap();

    let tid = sys.alloc_tid();
    let mut m = Machine::new(sys.clone(), tid, CODE_BASE);
    m.regs.set64(Reg::Rsp, CODE_BASE + 0x800);
    m.step().unwrap();
    assert!(sys.jit.hooks.get(CODE_BASE).is_some(), "warming step should have published a hook");

    m.regs.set64(Reg::Rax, 10); // SYS_MPROTECT
    m.regs.set64(Reg::Rdi, CODE_BASE);
    m.regs.set64(Reg::Rsi, 4096);
    m.regs.set64(Reg::Rdx, 7); // PROT_READ|WRITE|EXEC
    uxe::syscall::dispatch(&mut m).unwrap();
    assert_eq!(m.regs.get64(Reg::Rax), 0);

    assert!(sys.jit.hooks.get(CODE_BASE).is_none(), "mprotect over a hooked range must invalidate the hook");
}

#[test]
fn signal_handler_runs_exactly_once_and_thread_resumes_past_the_interrupted_syscall() {
    // Main thread blocks in nanosleep; a SIGUSR1 is already pending when it
    // gets there (simulating the race where another thread raised it just
    // before). The handler bumps a counter and returns via rt_sigreturn;
    // execution resumes right after the interrupted syscall and halts.
    let sys = fresh_system(true);
    map_rwx_page(&sys, CODE_BASE);

    let handler_addr = CODE_BASE + 0x20;
    let req_addr = CODE_BASE + 0x40;
    let counter_addr = CODE_BASE + 0x50;

    let mut main_code = Vec::new();
    main_code.extend_from_slice(&[0xb8, 0x23, 0x00, 0x00, 0x00]); // mov eax, 35 (nanosleep)
    main_code.push(0x48);
    main_code.push(0xbf);
    main_code.extend_from_slice(&req_addr.to_le_bytes()); // movabs rdi, req_addr
    main_code.extend_from_slice(&[0xbe, 0x00, 0x00, 0x00, 0x00]); // mov esi, 0
    main_code.extend_from_slice(&[0x0f, 0x05]); // syscall
    main_code.push(0xf4); // hlt
    sys.mem.write_bytes(CODE_BASE, &main_code).unwrap();

    let mut handler_code = Vec::new();
    handler_code.push(0x48);
    handler_code.push(0xb8);
    handler_code.extend_from_slice(&counter_addr.to_le_bytes()); // movabs rax, counter_addr
    handler_code.extend_from_slice(&[0xf0, 0x48, 0xff, 0x00]); // lock inc qword [rax]
    handler_code.extend_from_slice(&[0xb8, 0x0f, 0x00, 0x00, 0x00]); // mov eax, 15 (rt_sigreturn)
    handler_code.extend_from_slice(&[0x0f, 0x05]); // syscall
    sys.mem.write_bytes(handler_addr, &handler_code).unwrap();

    let req = [(0_i64).to_le_bytes(), (10_000_000_i64).to_le_bytes()].concat(); // 10ms timeout
    sys.mem.write_bytes(req_addr, &req).unwrap();
    sys.mem.write_slice(counter_addr, &0u64.to_le_bytes()).unwrap();

    const SIGUSR1: usize = 10;
    sys.sig.set(SIGUSR1 - 1, SigAction { handler: handler_addr, ..Default::default() });

    let tid = sys.alloc_tid();
    let mut m = Machine::new(sys.clone(), tid, CODE_BASE);
    m.regs.set64(Reg::Rsp, CODE_BASE + 0x800);
    m.signals.enqueue(SIGUSR1 as u32);

    let fault = m.run_until_halt();
    assert_eq!(fault, GuestFault::Halt);

    let counter = u64::from_le_bytes(sys.mem.read_slice(counter_addr, 8).unwrap().try_into().unwrap());
    assert_eq!(counter, 1, "handler must run exactly once");
    assert_eq!(m.signals.depth.load(Ordering::Relaxed), 0, "sigreturn must fully unwind the handler depth");

    // Disposition left untouched afterward: confirms nothing clobbered it.
    assert_eq!(sys.sig.get(SIGUSR1 - 1).handler, handler_addr);
    assert_ne!(sys.sig.get(SIGUSR1 - 1).handler, SIG_DFL);
}

#[test]
fn cross_thread_kill_wakes_the_target_out_of_a_blocking_nanosleep() {
    // Thread A blocks in a long nanosleep with no signal pending yet. This
    // test's driving thread stands in for guest Thread B: it looks up A's
    // tid through `System::signal_state_for` (what `sys_kill` does under
    // the hood) and raises SIGUSR1 directly, the way `sys_kill` would for
    // any `tid != caller`. A's handler must run exactly once and A must
    // resume past the syscall rather than sleeping out the full timeout.
    let sys = fresh_system(true);
    map_rwx_page(&sys, CODE_BASE);

    let handler_addr = CODE_BASE + 0x20;
    let req_addr = CODE_BASE + 0x40;
    let counter_addr = CODE_BASE + 0x50;

    let mut main_code = Vec::new();
    main_code.extend_from_slice(&[0xb8, 0x23, 0x00, 0x00, 0x00]); // mov eax, 35 (nanosleep)
    main_code.push(0x48);
    main_code.push(0xbf);
    main_code.extend_from_slice(&req_addr.to_le_bytes()); // movabs rdi, req_addr
    main_code.extend_from_slice(&[0xbe, 0x00, 0x00, 0x00, 0x00]); // mov esi, 0
    main_code.extend_from_slice(&[0x0f, 0x05]); // syscall
    main_code.push(0xf4); // hlt
    sys.mem.write_bytes(CODE_BASE, &main_code).unwrap();

    let mut handler_code = Vec::new();
    handler_code.push(0x48);
    handler_code.push(0xb8);
    handler_code.extend_from_slice(&counter_addr.to_le_bytes()); // movabs rax, counter_addr
    handler_code.extend_from_slice(&[0xf0, 0x48, 0xff, 0x00]); // lock inc qword [rax]
    handler_code.extend_from_slice(&[0xb8, 0x0f, 0x00, 0x00, 0x00]); // mov eax, 15 (rt_sigreturn)
    handler_code.extend_from_slice(&[0x0f, 0x05]); // syscall
    sys.mem.write_bytes(handler_addr, &handler_code).unwrap();

    // A multi-second request: if the signal never reaches A, this test
    // would hang (or, bounded by the polling loop, return only once the
    // full sleep elapses) instead of returning promptly.
    let req = [(2_i64).to_le_bytes(), (0_i64).to_le_bytes()].concat();
    sys.mem.write_bytes(req_addr, &req).unwrap();
    sys.mem.write_slice(counter_addr, &0u64.to_le_bytes()).unwrap();

    const SIGUSR1: usize = 10;
    sys.sig.set(SIGUSR1 - 1, SigAction { handler: handler_addr, ..Default::default() });

    let tid_a = sys.alloc_tid();
    let sys_for_thread = sys.clone();
    let handle = std::thread::spawn(move || {
        let mut m = Machine::new(sys_for_thread, tid_a, CODE_BASE);
        m.regs.set64(Reg::Rsp, CODE_BASE + 0x800);
        m.run_until_halt()
    });

    // Give thread A a moment to actually reach the nanosleep syscall before
    // "thread B" raises the signal against it by tid.
    std::thread::sleep(std::time::Duration::from_millis(20));
    let target = sys.signal_state_for(tid_a).expect("thread A still registered");
    target.enqueue(SIGUSR1 as u32);

    let fault = handle.join().unwrap();
    assert_eq!(fault, GuestFault::Halt);

    let counter = u64::from_le_bytes(sys.mem.read_slice(counter_addr, 8).unwrap().try_into().unwrap());
    assert_eq!(counter, 1, "thread A's handler must run exactly once");
}

#[test]
fn install_from_elf_builds_argv_and_entry_consistent_with_manual_setup() {
    // Smoke-tests run_guest's load path end to end against a tiny static
    // binary that just exits with a fixed code, written to a real temp file
    // the way a caller would hand uxe a path on disk.
    fn minimal_elf(entry: u64, code: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; 64 + 56];
        data[0..4].copy_from_slice(b"\x7fELF");
        data[4] = 2; // ELFCLASS64
        data[5] = 1; // little-endian
        data[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        data[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        data[24..32].copy_from_slice(&entry.to_le_bytes());
        data[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        data[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        data[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

        let ph = &mut data[64..64 + 56];
        ph[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        ph[4..8].copy_from_slice(&(1u32 | 4).to_le_bytes()); // PF_X | PF_R
        ph[8..16].copy_from_slice(&0u64.to_le_bytes()); // p_offset
        ph[16..24].copy_from_slice(&entry.to_le_bytes()); // p_vaddr
        ph[32..40].copy_from_slice(&(code.len() as u64).to_le_bytes());
        ph[40..48].copy_from_slice(&(code.len() as u64).to_le_bytes());

        data.extend_from_slice(code);
        data
    }

    // mov edi, 7; mov eax, 60 (exit); syscall
    let code = [0xbf, 0x07, 0x00, 0x00, 0x00, 0xb8, 0x3c, 0x00, 0x00, 0x00, 0x0f, 0x05];
    let data = minimal_elf(0x40_0000, &code);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();

    let (fault, _system) = uxe::run_guest(
        file.path().to_str().unwrap(),
        &["prog".to_string()],
        &[],
        true,
        None,
    )
    .unwrap();
    assert_eq!(fault, GuestFault::Exit(7));
}

#[test]
#[cfg(feature = "robust_futexes")]
fn robust_list_is_unwound_and_a_waiter_woken_on_thread_exit() {
    // A two-entry robust list: head -> entry1 -> entry2 -> head. Each
    // entry's futex word sits 8 bytes past the entry's own address. entry1's
    // word has FUTEX_WAITERS set and a real waiter blocked on it; on_exit
    // must mark both words FUTEX_OWNER_DIED and wake that waiter.
    use uxe::bus::{FutexWaitResult, FUTEX_OWNER_DIED, FUTEX_WAITERS};

    let sys = fresh_system(true);
    map_rwx_page(&sys, CODE_BASE);

    let head_addr = CODE_BASE + 0x200;
    let entry1 = CODE_BASE + 0x300;
    let entry2 = CODE_BASE + 0x400;
    sys.mem.write_slice(head_addr, &entry1.to_le_bytes()).unwrap();
    sys.mem.write_slice(entry1, &entry2.to_le_bytes()).unwrap();
    sys.mem.write_slice(entry2, &head_addr.to_le_bytes()).unwrap();

    let futex1 = entry1 + 8;
    let futex2 = entry2 + 8;
    let held1 = FUTEX_WAITERS | 7;
    sys.mem.write_slice(futex1, &held1.to_le_bytes()).unwrap();
    sys.mem.write_slice(futex2, &3u32.to_le_bytes()).unwrap();

    let tid = sys.alloc_tid();
    let mut m = Machine::new(sys.clone(), tid, CODE_BASE);
    m.signals.robust_list_head.store(head_addr, Ordering::Relaxed);

    let waiter_sys = sys.clone();
    let waiter = std::thread::spawn(move || {
        waiter_sys.bus.wait(futex1, held1, || {
            let bytes = waiter_sys.mem.read_slice(futex1, 4).unwrap();
            u32::from_le_bytes(bytes.try_into().unwrap())
        })
    });
    std::thread::sleep(std::time::Duration::from_millis(20));

    m.on_exit();

    assert_eq!(waiter.join().unwrap(), FutexWaitResult::Woken);
    let w1 = u32::from_le_bytes(sys.mem.read_slice(futex1, 4).unwrap().try_into().unwrap());
    let w2 = u32::from_le_bytes(sys.mem.read_slice(futex2, 4).unwrap().try_into().unwrap());
    assert_eq!(w1 & FUTEX_OWNER_DIED, FUTEX_OWNER_DIED, "held futex must be marked owner-died");
    assert_eq!(w2 & FUTEX_OWNER_DIED, FUTEX_OWNER_DIED);
}
