//! Futex arena (C9): a fixed-capacity pool of futex wait-queues, matching
//! blink's `g_bus->futexes` arena/free-list + `FindFutex`/`NewFutex`/
//! `FreeFutex` from `syscall.c`.
//!
//! A `Futex` is allocated the first time any thread waits on a given
//! guest address and freed once its waiter count drops back to zero,
//! exactly as blink does — there is no per-address futex object kept
//! alive across waits with nobody waiting, to bound memory with the
//! number of addresses *currently* contended rather than ever touched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

pub const FUTEX_WAITERS: u32 = 0x8000_0000;
pub const FUTEX_OWNER_DIED: u32 = 0x4000_0000;

struct Futex {
    waiters: AtomicU32,
    cond: Condvar,
}

/// Process-wide futex table, one per `System`. A `Mutex<HashMap>` stands
/// in for blink's arena + intrusive free list: the allocation pattern
/// (insert on first waiter, remove on last) is identical, we just let the
/// allocator do the bookkeeping instead of hand-rolling a free list,
/// since this isn't running inside a no-allocator kernel context.
#[derive(Default)]
pub struct Bus {
    futexes: Mutex<HashMap<u64, Arc<Futex>>>,
}

impl Bus {
    fn get_or_create(&self, addr: u64) -> Arc<Futex> {
        let mut map = self.futexes.lock().unwrap();
        map.entry(addr)
            .or_insert_with(|| Arc::new(Futex { waiters: AtomicU32::new(0), cond: Condvar::new() }))
            .clone()
    }

    /// Blocks the calling thread until woken or `current_value_at(addr)`
    /// observes something other than `expect`. `load` reads the current
    /// guest memory word under the same lock discipline blink uses:
    /// check-then-sleep must be atomic with respect to a concurrent
    /// `FUTEX_WAKE`, which is provided here by holding the bus's internal
    /// mutex across both the compare and the `Condvar::wait` call.
    pub fn wait(&self, addr: u64, expect: u32, load: impl Fn() -> u32) -> FutexWaitResult {
        let futex = self.get_or_create(addr);
        let mut map = self.futexes.lock().unwrap();
        if load() != expect {
            return FutexWaitResult::ValueMismatch;
        }
        futex.waiters.fetch_add(1, Ordering::SeqCst);
        let (guard, timeout) = futex.cond.wait_timeout(map, std::time::Duration::from_millis(50)).unwrap();
        map = guard;
        let last_waiter = futex.waiters.fetch_sub(1, Ordering::SeqCst) == 1;
        if last_waiter {
            map.remove(&addr);
        }
        drop(map);
        if timeout.timed_out() {
            FutexWaitResult::TimedOut
        } else {
            FutexWaitResult::Woken
        }
    }

    /// Wakes up to `count` waiters on `addr`, returning how many were
    /// actually woken. Matches `SysFutexWake`.
    pub fn wake(&self, addr: u64, count: u32) -> u32 {
        let map = self.futexes.lock().unwrap();
        let Some(futex) = map.get(&addr) else {
            return 0;
        };
        let woken = futex.waiters.load(Ordering::SeqCst).min(count);
        if count == 1 {
            futex.cond.notify_one();
        } else {
            futex.cond.notify_all();
        }
        woken
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FutexWaitResult {
    Woken,
    TimedOut,
    ValueMismatch,
}
