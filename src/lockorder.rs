//! Debug-only lock acquisition order checking (C5's `exec_lock` ->
//! `sig_lock` -> `mmap_lock` -> `fds.lock` -> `machines_lock` ->
//! `futexes.lock` -> `jit.lock` chain).
//!
//! None of this codebase's locks are held nested except at the few call
//! sites that duplicate or replace the whole `System` (`clone`, `fork`,
//! `execve`); everywhere else a lock is taken, used, and dropped before the
//! next one is touched, so there's nothing to order. At those call sites,
//! wrap each acquisition in [`acquire`] in the documented order; in debug
//! builds this asserts no level is taken out of order or re-entered by the
//! same thread, and compiles away entirely in release builds.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Exec = 1,
    Sig = 2,
    Mmap = 3,
    Fds = 4,
    Machines = 5,
    Futexes = 6,
    Jit = 7,
}

#[cfg(debug_assertions)]
mod imp {
    use super::Level;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<Level>> = const { RefCell::new(Vec::new()) };
    }

    pub struct Guard(Level);

    impl Drop for Guard {
        fn drop(&mut self) {
            HELD.with(|h| {
                let mut h = h.borrow_mut();
                debug_assert_eq!(h.last().copied(), Some(self.0), "lock order guard dropped out of order");
                h.pop();
            });
        }
    }

    pub fn acquire(level: Level) -> Guard {
        HELD.with(|h| {
            let mut h = h.borrow_mut();
            if let Some(&top) = h.last() {
                debug_assert!(level > top, "lock order violation: acquired {level:?} while holding {top:?}");
            }
            h.push(level);
        });
        Guard(level)
    }
}

#[cfg(not(debug_assertions))]
mod imp {
    use super::Level;

    pub struct Guard;

    pub fn acquire(_level: Level) -> Guard {
        Guard
    }
}

pub use imp::{acquire, Guard};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_acquisition_is_fine() {
        let a = acquire(Level::Exec);
        let b = acquire(Level::Sig);
        drop(b);
        drop(a);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn out_of_order_acquisition_panics() {
        let _a = acquire(Level::Mmap);
        let _b = acquire(Level::Exec);
    }
}
