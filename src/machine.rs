//! Per-thread CPU state and the interpreter dispatch loop (C8).
//!
//! `System` is the process-wide state shared by every guest thread (one
//! address space, one fd table, one JIT manager, one futex bus). `Machine`
//! is per-thread: register file, TLB, pending signal state, and a back
//! reference to the owning `System`. This mirrors blink's `System`/
//! `Machine` split in `machine.h` exactly, down to the dispatch loop
//! checking the JIT hook table before falling back to interpretation.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::bus::Bus;
use crate::decode::{DecodeError, Decoder, Mnemonic};
use crate::jit::Jit;
use crate::memory::{AddressSpace, MemoryError, Tlb};
use crate::path::{PathBuilder, PathOutcome};
use crate::regs::RegFile;
use crate::signal::SignalState;
use crate::stats::Stats;
use crate::system::FdTable;

/// Guest halt/fault codes surfaced out of the dispatch loop, mirroring the
/// negative `kMachineHalt`..`kMachineSimdException` sentinels in
/// `machine.h`, expressed as a Rust enum instead of magic negative ints
/// flowing through an `int` return, per the REDESIGN note on exceptions-
/// as-control-flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestFault {
    Halt,
    Exit(i32),
    DivideError,
    GeneralProtectionFault,
    SegmentationFault { addr: u64 },
    InvalidOpcode,
    Interrupt(u8),
    SimdException,
}

pub type MachineResult<T> = Result<T, RunError>;

#[derive(Debug)]
pub enum RunError {
    Fault(GuestFault),
    Memory(MemoryError),
    Decode(DecodeError),
}

impl From<MemoryError> for RunError {
    fn from(e: MemoryError) -> Self {
        RunError::Memory(e)
    }
}
impl From<DecodeError> for RunError {
    fn from(e: DecodeError) -> Self {
        RunError::Decode(e)
    }
}

/// Lowest thread id this emulator hands out and the size of the range it
/// draws from, matching blink's `kMinThreadId`/`kMaxThreadIds`: guest code
/// that assumes tids are small and monotonic (some libc builds do) keeps
/// working without colliding with host pids.
pub const MIN_THREAD_ID: i32 = 100;
pub const MAX_THREAD_IDS: i32 = 65536;

/// Process-wide state, one per emulated process (shared across `fork`
/// copy-on-write semantics is out of scope; each
/// `System` here owns its `AddressSpace` outright).
pub struct System {
    pub mem: AddressSpace,
    pub jit: Jit,
    pub bus: Bus,
    pub fds: Mutex<FdTable>,
    pub sig: crate::signal::SignalDispositions,
    /// Live guest tids paired with a shared handle onto that thread's
    /// pending/blocked signal state, guarded in lock order after
    /// `fds.lock`: after `fds.lock`, before `bus.futexes.lock`. The shared
    /// handle is what lets `kill`/`tgkill` raise a signal in another
    /// guest thread: `Machine` owns the same `Arc`, so setting a bit here
    /// is visible to that thread's dispatch loop without it polling
    /// through `System` on every step.
    pub machines: Mutex<Vec<(i32, Arc<SignalState>)>>,
    pub next_tid: AtomicI32,
    pub stats: Stats,
    pub brk: AtomicU64,
    pub jitless: bool,
    pub killed: std::sync::atomic::AtomicBool,
    /// Held across `execve`/`clone`/`fork` races, first in the documented
    /// lock acquisition order (see `lockorder`). A plain `Mutex<()>`: the
    /// only thing that matters is mutual exclusion between the handful of
    /// call sites that duplicate or replace this `System` wholesale.
    pub exec_lock: Mutex<()>,
}

impl System {
    pub fn new(image_base: u64, image_end: u64, jitless: bool) -> Arc<Self> {
        Arc::new(System {
            mem: AddressSpace::new(image_base),
            jit: Jit::new(image_end),
            bus: Bus::default(),
            fds: Mutex::new(FdTable::new()),
            sig: crate::signal::SignalDispositions::default(),
            machines: Mutex::new(Vec::new()),
            next_tid: AtomicI32::new(MIN_THREAD_ID),
            stats: Stats::default(),
            brk: AtomicU64::new(image_end),
            jitless,
            killed: std::sync::atomic::AtomicBool::new(false),
            exec_lock: Mutex::new(()),
        })
    }

    /// Allocates the next tid in `[MIN_THREAD_ID, MIN_THREAD_ID +
    /// MAX_THREAD_IDS)`, wrapping back to the start of the range, matching
    /// this process's fixed tid range.
    pub fn alloc_tid(&self) -> i32 {
        let raw = self.next_tid.fetch_add(1, Ordering::Relaxed);
        MIN_THREAD_ID + (raw - MIN_THREAD_ID).rem_euclid(MAX_THREAD_IDS)
    }

    pub fn register_machine(&self, tid: i32, signals: Arc<SignalState>) {
        self.machines.lock().unwrap().push((tid, signals));
    }

    pub fn unregister_machine(&self, tid: i32) {
        self.machines.lock().unwrap().retain(|(t, _)| *t != tid);
    }

    pub fn live_thread_count(&self) -> usize {
        self.machines.lock().unwrap().len()
    }

    /// Looks up another live guest thread's shared signal state, so
    /// `kill`/`tgkill` can raise a pending bit in it directly. Returns
    /// `None` if `tid` has already exited or was never one of this
    /// process's threads.
    pub fn signal_state_for(&self, tid: i32) -> Option<Arc<SignalState>> {
        self.machines.lock().unwrap().iter().find(|(t, _)| *t == tid).map(|(_, s)| s.clone())
    }
}

pub struct Machine {
    pub system: Arc<System>,
    pub regs: RegFile,
    pub tlb: Tlb,
    pub ip: u64,
    pub tid: i32,
    pub signals: Arc<SignalState>,
    pub halted: bool,
    /// Address of the guest `int*` cleared and futex-woken on thread exit
    /// when set via `set_tid_address`/`clone(CLONE_CHILD_CLEARTID)`.
    pub ctid: AtomicU64,
    pub restored: bool,
    /// This thread's stash buffer (C3), used by any guest write whose
    /// span crosses a page boundary. See [`write_guest`](Machine::write_guest).
    pub stash: crate::memory::Stash,
}

impl Machine {
    pub fn new(system: Arc<System>, tid: i32, entry: u64) -> Self {
        let signals = Arc::new(SignalState::default());
        system.register_machine(tid, signals.clone());
        Machine {
            system,
            regs: RegFile::default(),
            tlb: Tlb::default(),
            ip: entry,
            tid,
            signals,
            halted: false,
            ctid: AtomicU64::new(0),
            restored: false,
            stash: crate::memory::Stash::default(),
        }
    }

    /// Writes `data` at `vaddr`. A write that fits within its starting
    /// page goes straight through; one that straddles the boundary is
    /// staged in this thread's stash and fanned out in one `commit` call
    /// (see `memory::Stash`), so a concurrent reader on the far page never
    /// observes it half-applied.
    pub fn write_guest(&mut self, vaddr: u64, data: &[u8]) -> MachineResult<()> {
        let page_off = (vaddr & crate::memory::PAGE_MASK) as usize;
        if page_off + data.len() <= crate::memory::PAGE_SIZE as usize {
            self.system.mem.write_slice(vaddr, data)?;
        } else {
            self.stash.stage(vaddr, data);
            self.stash.commit(&self.system.mem)?;
        }
        Ok(())
    }

    /// Clears `ctid` and wakes one futex waiter on it, then unlocks the
    /// robust list and deregisters from `System`. Must run exactly once,
    /// on whichever path the thread actually exits by (`exit`, a fatal
    /// fault, or the top-level run loop returning). Matches
    /// `FreeMachine`/`RemoveMachine` in blink's `machine.c`.
    pub fn on_exit(&self) {
        let ctid = self.ctid.load(Ordering::Relaxed);
        if ctid != 0 {
            let _ = self.system.mem.write_slice(ctid, &0u32.to_le_bytes());
            self.system.bus.wake(ctid, 1);
        }
        crate::signal::unlock_robust_futexes(self, &self.system.bus);
        self.system.unregister_machine(self.tid);
    }

    fn fetch(&mut self, pc: u64) -> Result<[u8; 15], RunError> {
        if let Some((host, flags)) = self.tlb.lookup(pc) {
            if flags.contains(crate::memory::PteFlags::PRESENT) {
                return Ok(unsafe { fetch_from_host(host) });
            }
        }
        let (host_base, flags) = self.system.mem.translate(pc & !crate::memory::PAGE_MASK)?;
        self.tlb.insert(pc & !crate::memory::PAGE_MASK, host_base, flags);
        let host = host_base | (pc & crate::memory::PAGE_MASK);
        Ok(unsafe { fetch_from_host(host) })
    }

    /// One step of the dispatch loop: consult the JIT hook table first
    /// (unless `jitless`), fall back to decode-and-interpret, and thread
    /// a new path through the JIT when none exists yet and the run is hot
    /// enough to be worth compiling. Path-building eagerness is kept
    /// simple (always attempt) since this emulator has no profiling tier
    /// unlike the staged interpreter->S1->S2 pipeline a hypervisor-grade
    /// JIT would carry.
    pub fn step(&mut self) -> Result<(), RunError> {
        if self.signals.depth.load(Ordering::Relaxed) == 0 || self.signals.issigsuspend.load(Ordering::Relaxed) {
            if self.signals.next_deliverable().is_some() {
                crate::signal::try_deliver(self, &self.system.sig)?;
            }
        }
        if self.system.killed.load(Ordering::Relaxed) {
            return Err(RunError::Fault(GuestFault::Exit(0)));
        }
        if !self.system.jitless {
            if let Some(host_entry) = self.system.jit.hooks.get(self.ip) {
                if host_entry != crate::path::BUILDING_SENTINEL {
                    self.run_compiled(host_entry);
                    return Ok(());
                }
            } else if let Some(outcome) = self.try_build_path() {
                if let PathOutcome::Committed { host_entry, .. } = outcome {
                    self.run_compiled(host_entry);
                    return Ok(());
                }
            }
        }
        self.interpret_one()
    }

    /// Peek-decodes the instruction at `self.ip` and, only if it is one the
    /// path builder can actually thread, leases a block and starts
    /// absorbing from there. This avoids leasing and immediately abandoning
    /// a JIT block every time the dispatcher lands on an untreadable
    /// instruction (e.g. `ret`, `mov`, any branch), which would otherwise
    /// happen on essentially every path's exit point.
    fn try_build_path(&mut self) -> Option<PathOutcome> {
        let first_bytes = self.fetch(self.ip).ok()?;
        let first_instr = Decoder::new().decode(&first_bytes, self.ip).ok()?;
        if !crate::ops::is_threadable(&first_instr) {
            return None;
        }

        let mut pb = PathBuilder::start(&self.system.jit, &self.system.stats, self.ip)?;
        let mut pc = self.ip;
        loop {
            let bytes = match self.fetch(pc) {
                Ok(b) => b,
                Err(_) => return Some(pb.abandon("fetch failed mid-path")),
            };
            match pb.add_instruction(&bytes, pc) {
                Ok(Some(next)) => pc = next,
                Ok(None) => return Some(pb.commit()),
                Err(reason) => return Some(pb.abandon(reason)),
            }
        }
    }

    /// Calls compiled host code at `entry` with `self` as the sole SysV
    /// argument, exactly like blink's `Jitter`-emitted blocks are entered
    /// with `m` in `rdi`.
    fn run_compiled(&mut self, entry: u64) {
        type Entry = extern "C" fn(*mut Machine);
        let f: Entry = unsafe { std::mem::transmute(entry as *const ()) };
        f(self as *mut Machine);
    }

    fn interpret_one(&mut self) -> Result<(), RunError> {
        let bytes = self.fetch(self.ip)?;
        let instr = Decoder::new().decode(&bytes, self.ip)?;
        if matches!(instr.mnemonic, Mnemonic::Unsupported) {
            return Err(RunError::Fault(GuestFault::InvalidOpcode));
        }
        // `syscall` sets its own next-ip before dispatch runs (see
        // `crate::syscall::dispatch`): `rt_sigreturn` and a successful
        // in-process `execve` both overwrite `ip` outright, and the normal
        // case advances it by the instruction's fixed 2-byte width itself,
        // so it must not be double-advanced here the way every other
        // non-branching mnemonic is.
        let advances_ip_itself = matches!(
            instr.mnemonic,
            Mnemonic::Jmp | Mnemonic::Jcc(_) | Mnemonic::CallRel | Mnemonic::CallAbs | Mnemonic::Ret | Mnemonic::Syscall
        );
        crate::ops::interpret(self, &instr)?;
        self.system.stats.instructions_executed.fetch_add(1, Ordering::Relaxed);
        if !advances_ip_itself {
            self.ip += instr.len as u64;
        }
        Ok(())
    }

    pub fn run_until_halt(&mut self) -> GuestFault {
        let fault = loop {
            match self.step() {
                Ok(()) => {
                    if self.halted {
                        break GuestFault::Halt;
                    }
                }
                Err(RunError::Fault(f)) => break f,
                Err(RunError::Memory(MemoryError::Unmapped { addr })) => {
                    break GuestFault::SegmentationFault { addr }
                }
                Err(RunError::Memory(_)) => break GuestFault::GeneralProtectionFault,
                Err(RunError::Decode(_)) => break GuestFault::InvalidOpcode,
            }
        };
        self.on_exit();
        fault
    }
}

unsafe fn fetch_from_host(host_addr: u64) -> [u8; 15] {
    let mut out = [0u8; 15];
    let ptr = host_addr as *const u8;
    std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), 15);
    out
}
