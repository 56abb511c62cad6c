//! `uxe`: a userspace emulator for unmodified x86-64 Linux binaries, with
//! an in-process JIT threader for x86-64 and AArch64 hosts.
//!
//! The crate is organized around the four subsystems this emulator treats
//! as core (dispatch/path building, JIT code management, memory/TLB, and
//! the concurrency/signal/futex layer) plus the supporting modules each
//! one leans on. `main.rs` is a thin CLI front end over [`run_guest`].

pub mod bus;
pub mod byteio;
pub mod decode;
pub mod elf;
pub mod error;
pub mod jit;
pub mod lockorder;
pub mod machine;
pub mod memory;
pub mod ops;
pub mod path;
pub mod regs;
pub mod signal;
pub mod stats;
pub mod syscall;
pub mod system;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use error::{Error, Result};
pub use machine::{GuestFault, Machine, System};

/// How often the Ctrl-C watcher thread (see [`run_guest`]) rechecks the
/// external kill flag against the running guest's live-thread count.
/// Matches the bounded-poll interval blocking syscalls use to notice a
/// pending signal (`syscall::POLLING_MS`).
const CTRLC_POLL_MS: u64 = 50;

/// Loads `path` as the initial guest image, sets up its address space and
/// stack, and runs its main thread to completion. This is the entry point
/// `main.rs` drives; tests that want a full end-to-end run use it too.
/// Returns the terminating fault alongside the `System` so a caller can
/// print `-s` statistics afterward.
///
/// `kill_flag`, when given, is watched on a background thread for the
/// lifetime of the run and mirrored into `System::killed` the moment it's
/// set, which `Machine::step` already checks every dispatch iteration;
/// this is how `main.rs`'s Ctrl-C handler reaches a guest that's already
/// running on the calling thread. The watcher exits on its own once the
/// guest's main thread deregisters, so a run that finishes on its own
/// doesn't leave it polling forever.
pub fn run_guest(
    path: &str,
    argv: &[String],
    envp: &[String],
    jitless: bool,
    kill_flag: Option<Arc<AtomicBool>>,
) -> Result<(GuestFault, Arc<System>)> {
    let image = elf::load_file(path).map_err(|e| Error::Elf(e.to_string()))?;
    let (image_base, image_end) = image.address_range();
    let system = System::new(image_base, image_end, jitless);
    let entry = elf::install(&system.mem, &image, argv, envp).map_err(|e| Error::Elf(e.to_string()))?;

    let tid = system.alloc_tid();
    let mut machine = Machine::new(system.clone(), tid, entry.entry);
    machine.regs.set64(regs::Reg::Rsp, entry.stack_top);

    if let Some(flag) = kill_flag {
        let watched = system.clone();
        std::thread::spawn(move || {
            while watched.live_thread_count() > 0 {
                if flag.load(Ordering::Relaxed) {
                    watched.killed.store(true, Ordering::Relaxed);
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(CTRLC_POLL_MS));
            }
        });
    }

    let fault = machine.run_until_halt();
    Ok((fault, system))
}
